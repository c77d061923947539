//! Runtime Error Types
//!
//! Failures surfaced by service launch, message delivery and runtime startup.
//! Per-message failures are returned to the sender; only thread and bootstrap
//! failures are fatal to the node.

use thiserror::Error;
use types::Handle;

/// Main runtime error type
#[derive(Error, Debug)]
pub enum RuntimeError {
    /// No module registered under the requested name
    #[error("Module not found: {module}")]
    ModuleNotFound { module: String },

    /// Module factory declined to create an instance
    #[error("Module {module} failed to create an instance")]
    InstanceCreate { module: String },

    /// Service init returned an error
    #[error("Init failed for {module} ({handle}): {source}")]
    InitFailed {
        module: String,
        handle: Handle,
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// Service retired itself before launch completed
    #[error("Service {handle} exited during launch")]
    ServiceExited { handle: Handle },

    /// Destination handle is not registered
    #[error("Unknown destination {handle}")]
    UnknownDestination { handle: Handle },

    /// Name lookup failed
    #[error("Unknown service name {name}")]
    UnknownName { name: String },

    /// Payload length does not fit the packed size word
    #[error("Message to {destination} is too large ({len} bytes)")]
    MessageTooLarge { destination: String, len: usize },

    /// Destination lives on another harbor
    #[error("Remote destination {destination} is not supported")]
    RemoteUnsupported { destination: String },

    /// Logger or bootstrap service could not be started
    #[error("Bootstrap error: {message}")]
    Bootstrap { message: String },

    /// OS thread could not be spawned
    #[error("Failed to spawn {name} thread: {source}")]
    Thread {
        name: String,
        source: std::io::Error,
    },

    /// Invalid runtime configuration
    #[error("Configuration error: {message}")]
    Configuration { message: String },
}

/// Result type alias for runtime operations
pub type Result<T> = std::result::Result<T, RuntimeError>;

impl RuntimeError {
    pub fn module_not_found(module: impl Into<String>) -> Self {
        Self::ModuleNotFound {
            module: module.into(),
        }
    }

    pub fn instance_create(module: impl Into<String>) -> Self {
        Self::InstanceCreate {
            module: module.into(),
        }
    }

    /// Create an init failure from a service's own error
    pub fn init_failed(module: impl Into<String>, handle: Handle, source: anyhow::Error) -> Self {
        Self::InitFailed {
            module: module.into(),
            handle,
            source: source.into(),
        }
    }

    pub fn service_exited(handle: Handle) -> Self {
        Self::ServiceExited { handle }
    }

    pub fn unknown_destination(handle: Handle) -> Self {
        Self::UnknownDestination { handle }
    }

    pub fn unknown_name(name: impl Into<String>) -> Self {
        Self::UnknownName { name: name.into() }
    }

    pub fn message_too_large(destination: impl ToString, len: usize) -> Self {
        Self::MessageTooLarge {
            destination: destination.to_string(),
            len,
        }
    }

    pub fn remote_unsupported(destination: impl ToString) -> Self {
        Self::RemoteUnsupported {
            destination: destination.to_string(),
        }
    }

    pub fn bootstrap(message: impl Into<String>) -> Self {
        Self::Bootstrap {
            message: message.into(),
        }
    }

    pub fn thread(name: impl Into<String>, source: std::io::Error) -> Self {
        Self::Thread {
            name: name.into(),
            source,
        }
    }

    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Failures reported back to the sender of a single message
    pub fn is_send_failure(&self) -> bool {
        matches!(
            self,
            RuntimeError::UnknownDestination { .. }
                | RuntimeError::UnknownName { .. }
                | RuntimeError::MessageTooLarge { .. }
                | RuntimeError::RemoteUnsupported { .. }
        )
    }

    /// Failures that must stop the node
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            RuntimeError::Bootstrap { .. }
                | RuntimeError::Thread { .. }
                | RuntimeError::Configuration { .. }
        )
    }

    /// Get error category for metrics
    pub fn category(&self) -> &'static str {
        match self {
            RuntimeError::ModuleNotFound { .. } => "module_not_found",
            RuntimeError::InstanceCreate { .. } => "instance_create",
            RuntimeError::InitFailed { .. } => "init_failed",
            RuntimeError::ServiceExited { .. } => "service_exited",
            RuntimeError::UnknownDestination { .. } => "unknown_destination",
            RuntimeError::UnknownName { .. } => "unknown_name",
            RuntimeError::MessageTooLarge { .. } => "message_too_large",
            RuntimeError::RemoteUnsupported { .. } => "remote_unsupported",
            RuntimeError::Bootstrap { .. } => "bootstrap",
            RuntimeError::Thread { .. } => "thread",
            RuntimeError::Configuration { .. } => "configuration",
        }
    }
}
