//! Error types for the runloop bridge

use std::fmt;
use thiserror::Error;

/// Operations that are only legal on the owning thread
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OwnerOperation {
    Bind,
    Acquire,
    Release,
    IsReleased,
    Shutdown,
    Schedule,
    OpenBridge,
    CloseBridge,
    ScheduleWake,
    SetTimeout,
    ClearTimeout,
    RunLoop,
}

impl fmt::Display for OwnerOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OwnerOperation::Bind => write!(f, "bind"),
            OwnerOperation::Acquire => write!(f, "acquire"),
            OwnerOperation::Release => write!(f, "release"),
            OwnerOperation::IsReleased => write!(f, "is_released"),
            OwnerOperation::Shutdown => write!(f, "shutdown"),
            OwnerOperation::Schedule => write!(f, "schedule"),
            OwnerOperation::OpenBridge => write!(f, "open_bridge"),
            OwnerOperation::CloseBridge => write!(f, "close_bridge"),
            OwnerOperation::ScheduleWake => write!(f, "schedule_wake"),
            OwnerOperation::SetTimeout => write!(f, "set_timeout"),
            OwnerOperation::ClearTimeout => write!(f, "clear_timeout"),
            OwnerOperation::RunLoop => write!(f, "run"),
        }
    }
}

/// Main error type for the runloop bridge
#[derive(Error, Debug)]
pub enum Error {
    /// An owning-thread-only operation was invoked from another thread
    #[error("WrongThread: {operation} must run on the owning thread")]
    WrongThread { operation: OwnerOperation },

    /// The cross-thread bridge is closed or closing and refused the request
    #[error("Draining: the run loop bridge is not accepting work")]
    Draining,

    /// The queue was shut down and will never run tasks again
    #[error("Terminated: the task queue has been shut down")]
    Terminated,

    /// A waitable task was dropped before producing a value
    #[error("Abandoned: the task was dropped before it produced a value")]
    Abandoned,

    /// A bounded wait elapsed
    #[error("Timeout: gave up waiting after {0:?}")]
    Timeout(std::time::Duration),

    /// No queue is registered under the requested key
    #[error("NoQueue: no task queue registered for {key}")]
    NoQueue { key: String },

    /// Scripting heap misuse (dead handle, wrong thread, double delete)
    #[error("HeapAccess: {0}")]
    HeapAccess(String),

    /// Invalid configuration value
    #[error("ConfigError: {0}")]
    Config(String),

    /// IO error
    #[error("IOError: {source}")]
    Io {
        #[from]
        source: std::io::Error,
    },

    /// Configuration parse error
    #[error("JsonError: {source}")]
    Json {
        #[from]
        source: serde_json::Error,
    },
}

impl Error {
    /// Create a wrong-thread error
    pub fn wrong_thread(operation: OwnerOperation) -> Self {
        Error::WrongThread { operation }
    }

    /// Create a missing-queue error
    pub fn no_queue(key: impl fmt::Display) -> Self {
        Error::NoQueue {
            key: key.to_string(),
        }
    }

    /// Create a heap access error
    pub fn heap(message: impl Into<String>) -> Self {
        Error::HeapAccess(message.into())
    }

    /// Create a configuration error
    pub fn config(message: impl Into<String>) -> Self {
        Error::Config(message.into())
    }

    /// Whether the caller may retry after re-acquiring the queue
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Error::Draining | Error::Timeout(_))
    }
}

/// Result type for runloop bridge operations
pub type Result<T> = std::result::Result<T, Error>;
