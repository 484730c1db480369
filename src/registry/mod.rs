//! Process-wide queue registry
//!
//! Maps a fixed key to "the" queue that owns a scripting run loop, so
//! collaborators on any thread can find it without holding a reference.
//! Registration and removal are explicit: [`RunloopRegistry::get_or_create`]
//! binds a queue on the owning thread and [`RunloopRegistry::deinit`] only
//! tears it down once it is released.

use crate::config::{QueueConfig, QueueEnv};
use crate::error::{Error, Result};
use crate::queue::TaskQueue;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use std::borrow::Cow;
use std::fmt;

/// Name of a registered queue
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct QueueKey(Cow<'static, str>);

impl QueueKey {
    /// The scripting runtime's own run loop
    pub const SCRIPT_RUNTIME: QueueKey = QueueKey(Cow::Borrowed("script-runtime"));

    pub fn new(name: impl Into<Cow<'static, str>>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for QueueKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Default)]
pub struct RunloopRegistry {
    queues: Mutex<FxHashMap<QueueKey, TaskQueue>>,
}

impl RunloopRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the queue registered under `key`, binding a new one on the
    /// calling thread if there is none.
    ///
    /// `env` and `config` are ignored when the queue already exists.
    pub fn get_or_create(&self, key: QueueKey, env: QueueEnv, config: QueueConfig) -> Result<TaskQueue> {
        let mut queues = self.queues.lock();
        if let Some(queue) = queues.get(&key) {
            return Ok(queue.clone());
        }
        let queue = TaskQueue::bind(env, config)?;
        tracing::debug!(%key, queue = queue.id().as_u64(), "queue registered");
        queues.insert(key, queue.clone());
        Ok(queue)
    }

    pub fn lookup(&self, key: &QueueKey) -> Option<TaskQueue> {
        self.queues.lock().get(key).cloned()
    }

    /// Like [`lookup`](Self::lookup), failing with `Error::NoQueue`
    pub fn get(&self, key: &QueueKey) -> Result<TaskQueue> {
        self.lookup(key).ok_or_else(|| Error::no_queue(key))
    }

    /// Shut down and unregister the queue under `key`.
    ///
    /// Returns false, leaving the queue registered, unless it is released.
    /// Must run on the queue's owning thread.
    pub fn deinit(&self, key: &QueueKey) -> bool {
        let Some(queue) = self.lookup(key) else {
            tracing::debug!(%key, "deinit of an unregistered queue");
            return false;
        };
        if !queue.shutdown() {
            tracing::debug!(%key, phase = ?queue.phase(), "deinit refused: queue still in use");
            return false;
        }

        let mut queues = self.queues.lock();
        if queues.get(key).is_some_and(|q| q.same_queue(&queue)) {
            queues.remove(key);
        }
        tracing::debug!(%key, "queue unregistered");
        true
    }

    pub fn len(&self) -> usize {
        self.queues.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.queues.lock().is_empty()
    }
}
