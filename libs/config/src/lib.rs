//! # Hive Node Configuration
//!
//! Loads the settings a node needs before its runtime starts: worker count,
//! harbor id, bootstrap command line, logger destination and the dispatch
//! weight table.
//!
//! ## Usage
//!
//! ```rust
//! use node_config::RuntimeConfig;
//!
//! let config = RuntimeConfig::from_toml_str("thread = 2\nbootstrap = \"echo\"").unwrap();
//! assert_eq!(config.thread, 2);
//! assert_eq!(config.weight_for(0), -1);
//! assert_eq!(config.weight_for(100), 0);
//! ```

pub mod runtime_config;

pub use runtime_config::{load_config, RuntimeConfig, DEFAULT_WEIGHTS};
