//! Service Scheduling and Lifecycle Engine
//!
//! Independent services, each addressed by an opaque [`Handle`], talk only
//! through typed messages delivered to per-service mailboxes. A fixed pool of
//! worker threads drains those mailboxes so that one service's callback never
//! runs concurrently with itself while different services run in parallel.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────┐  push   ┌──────────────┐  link  ┌──────────────┐
//! │ send / timer │───────▶│   Mailbox    │──────▶│ GlobalQueue  │
//! │   / socket   │        │ (per service)│       │  (FIFO of    │
//! └──────────────┘        └──────────────┘       │  mailboxes)  │
//!                                                └──────┬───────┘
//!                                                       │ pop
//!                        ┌──────────────┐        ┌──────▼───────┐
//!                        │   Monitor    │◀──────│  Worker xN   │
//!                        │ (hang check) │trigger │ (weighted)   │
//!                        └──────────────┘        └──────────────┘
//! ```
//!
//! A mailbox is unlinked from the global queue for the whole of a worker's
//! turn and relinked only afterwards; that is the serialization guarantee.
//!
//! # Examples
//!
//! ```rust
//! use actors::{Disposition, FnModule, Runtime};
//! use node_config::RuntimeConfig;
//! use types::MessageType;
//!
//! let rt = Runtime::builder(RuntimeConfig::default())
//!     .module(FnModule::new("echo", |ctx, _params| {
//!         ctx.set_callback(|ctx, msg| {
//!             let body = msg.take_payload();
//!             let _ = ctx.send(msg.source, MessageType::RESPONSE, msg.session, body);
//!             Disposition::Retain
//!         });
//!         Ok(())
//!     }))
//!     .build()
//!     .unwrap();
//!
//! let echo = rt.launch("echo", None).unwrap();
//! assert_eq!(echo.handle().harbor(), 1);
//! rt.abort();
//! ```

pub mod command;
pub mod context;
pub mod dispatcher;
pub mod env;
pub mod error;
pub mod logger;
pub mod mailbox;
pub mod metrics;
pub mod module;
pub mod monitor;
pub mod registry;
pub mod runtime;
pub mod service_log;
pub mod socket;
pub mod timer;

pub use context::{Callback, Disposition, ServiceContext};
pub use dispatcher::{dispatch, Weight, WorkerPool};
pub use env::EnvTable;
pub use error::{Result, RuntimeError};
pub use logger::{LoggerModule, LOGGER_MODULE};
pub use mailbox::{GlobalQueue, Mailbox};
pub use metrics::{MetricsSnapshot, RuntimeMetrics};
pub use module::{FnModule, Module, ModuleRegistry, ServiceInstance};
pub use monitor::{MonitorSlot, Stall};
pub use registry::{ContextRef, HandleRegistry, NameBinding};
pub use runtime::{current_handle, current_service, Runtime, RuntimeBuilder, ThreadRole, LOGGER_NAME};
pub use service_log::ServiceLog;
pub use socket::{ChannelPoller, SocketEvent, SocketEventKind, SocketPoll, SocketPoller, SocketSender};
pub use timer::{Expired, Timer, TimerQueue};

pub use types::{Handle, Message, MessageType, Payload};
