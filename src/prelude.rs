//! Prelude module for convenient imports
//!
//! ```
//! use runloop_bridge::prelude::*;
//!
//! let run_loop = RunLoop::new();
//! let queue = TaskQueue::bind(QueueEnv::new(run_loop.handle()), QueueConfig::default()).unwrap();
//! assert!(queue.is_released());
//! ```

// Queue
pub use crate::queue::{QueuePhase, QueueStats, TaskFuture, TaskQueue};
pub use crate::task_table::{Operation, TaskControl, TaskToken};

// Host loop and time
pub use crate::event_loop::{LoopStats, RunLoop, RunLoopHandle};
pub use crate::time::{ManualClock, MonotonicClock, TimeSource};

// Configuration and errors
pub use crate::config::{QueueConfig, QueueEnv};
pub use crate::error::{Error, OwnerOperation, Result};

// Embedding
pub use crate::bindings::{ObjectWrapper, PeerHeap, PeerId, WeakPeer};
pub use crate::registry::{QueueKey, RunloopRegistry};
