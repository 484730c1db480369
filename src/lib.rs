//! Runloop Bridge: a cross-thread task queue for embedded scripting runtimes
//!
//! A scripting runtime runs on one thread with its own event loop, while
//! the native engine around it runs many threads. This crate lets any
//! engine thread hand work to the scripting thread without that thread
//! ever blocking on a native timer or lock held elsewhere.
//!
//! # Quick Start
//!
//! ```
//! use runloop_bridge::prelude::*;
//! use std::time::Duration;
//!
//! fn main() -> Result<()> {
//!     let run_loop = RunLoop::new();
//!     let queue = TaskQueue::bind(QueueEnv::new(run_loop.handle()), QueueConfig::default())?;
//!
//!     let mut ticks = 0;
//!     queue.add_task_with_delay(
//!         move || {
//!             ticks += 1;
//!             ticks < 3
//!         },
//!         Duration::from_millis(1),
//!     )?;
//!
//!     run_loop.run()?;
//!     assert!(queue.is_released());
//!     Ok(())
//! }
//! ```
//!
//! # Module Overview
//!
//! Producers call into [`queue`]; the queue keeps its tasks in a
//! [`task_table`], counts holders with a [`gate`], and reaches the host
//! loop only through the [`bridge`].
//!
//! | Category | Modules |
//! |----------|---------|
//! | **Core** | [`queue`], [`task_table`], [`gate`], [`bridge`] |
//! | **Host** | [`event_loop`], [`time`] |
//! | **Embedding** | [`registry`], [`bindings`] |
//! | **Support** | [`config`], [`error`](Error), [`prelude`] |

pub mod bindings;
pub mod bridge;
pub mod config;
pub mod event_loop;
pub mod gate;
pub mod prelude;
pub mod queue;
pub mod registry;
pub mod task_table;
pub mod time;

mod error;

pub use error::{Error, OwnerOperation, Result};
pub use queue::{QueueStats, TaskFuture, TaskQueue};
pub use task_table::{Operation, TaskControl, TaskToken};

/// Runloop Bridge version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
