//! Blocking handles for tasks that produce a value

use crate::error::{Error, Result};
use crate::task_table::TaskToken;
use std::sync::mpsc::{Receiver, RecvTimeoutError, TryRecvError};
use std::time::Duration;

/// The result of [`TaskQueue::add_waitable_task`](super::TaskQueue::add_waitable_task).
///
/// If the task is dropped without running (scheduling was refused, the
/// task was cancelled, or the queue was torn down) the future resolves to
/// [`Error::Abandoned`].
#[derive(Debug)]
pub struct TaskFuture<T> {
    rx: Receiver<T>,
    token: Option<TaskToken>,
    default_timeout: Option<Duration>,
}

impl<T> TaskFuture<T> {
    pub(crate) fn new(rx: Receiver<T>, token: Option<TaskToken>, default_timeout: Option<Duration>) -> Self {
        Self {
            rx,
            token,
            default_timeout,
        }
    }

    /// Token of the scheduled task; `None` if scheduling was refused
    pub fn token(&self) -> Option<TaskToken> {
        self.token
    }

    pub fn is_scheduled(&self) -> bool {
        self.token.is_some()
    }

    /// Block until the owning thread has run the task.
    ///
    /// Uses the queue's configured timeout, if any. Calling this on the
    /// owning thread before the task ran deadlocks without a timeout.
    pub fn wait(self) -> Result<T> {
        match self.default_timeout {
            Some(timeout) => self.wait_timeout(timeout),
            None => self.rx.recv().map_err(|_| Error::Abandoned),
        }
    }

    /// Block for at most `timeout`
    pub fn wait_timeout(self, timeout: Duration) -> Result<T> {
        self.rx.recv_timeout(timeout).map_err(|e| match e {
            RecvTimeoutError::Timeout => Error::Timeout(timeout),
            RecvTimeoutError::Disconnected => Error::Abandoned,
        })
    }

    /// Non-blocking poll; `None` while the task has not run yet
    pub fn try_get(&self) -> Option<Result<T>> {
        match self.rx.try_recv() {
            Ok(value) => Some(Ok(value)),
            Err(TryRecvError::Empty) => None,
            Err(TryRecvError::Disconnected) => Some(Err(Error::Abandoned)),
        }
    }
}
