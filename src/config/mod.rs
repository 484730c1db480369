//! Queue configuration
//!
//! `QueueConfig` carries the tunables of a task queue and can be loaded
//! from JSON. `QueueEnv` is the record handed over once at bind time: it
//! names the host run loop whose thread becomes the owning thread.

use crate::error::{Error, Result};
use crate::event_loop::RunLoopHandle;
use crate::time::TimeSource;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

/// Upper bound for a single wake registration
pub const DEFAULT_MAX_WAKE_DELAY_MS: u64 = 10_000;

/// Default rounding unit of the queue-visible clock
pub const DEFAULT_GRANULARITY_US: u64 = 1_000;

/// Tunables for a [`TaskQueue`](crate::queue::TaskQueue)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Clamp applied to every wake registration
    pub max_wake_delay_ms: u64,
    /// Rounding unit used when stamping execute times
    pub granularity_us: u64,
    /// Panic on wrong-thread calls in debug builds instead of logging
    pub strict_thread_checks: bool,
    /// Bound for blocking waits; `None` waits forever
    pub waitable_timeout_ms: Option<u64>,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_wake_delay_ms: DEFAULT_MAX_WAKE_DELAY_MS,
            granularity_us: DEFAULT_GRANULARITY_US,
            strict_thread_checks: false,
            waitable_timeout_ms: None,
        }
    }
}

impl QueueConfig {
    /// Create a configuration with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a configuration from JSON, filling missing fields with defaults
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: QueueConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Load a configuration file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json_str(&text)
    }

    /// Reject values the queue cannot work with
    pub fn validate(&self) -> Result<()> {
        if self.granularity_us == 0 {
            return Err(Error::config("granularity_us must be greater than zero"));
        }
        if self.max_wake_delay_ms == 0 {
            return Err(Error::config("max_wake_delay_ms must be greater than zero"));
        }
        Ok(())
    }

    pub fn with_max_wake_delay(mut self, delay: Duration) -> Self {
        self.max_wake_delay_ms = delay.as_millis() as u64;
        self
    }

    pub fn with_granularity(mut self, granularity: Duration) -> Self {
        self.granularity_us = granularity.as_micros() as u64;
        self
    }

    pub fn with_strict_thread_checks(mut self, strict: bool) -> Self {
        self.strict_thread_checks = strict;
        self
    }

    pub fn with_waitable_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.waitable_timeout_ms = timeout.map(|t| t.as_millis() as u64);
        self
    }

    pub fn max_wake_delay(&self) -> Duration {
        Duration::from_millis(self.max_wake_delay_ms)
    }

    pub fn granularity(&self) -> Duration {
        Duration::from_micros(self.granularity_us)
    }

    pub fn waitable_timeout(&self) -> Option<Duration> {
        self.waitable_timeout_ms.map(Duration::from_millis)
    }
}

/// Binding record for a queue: the host loop it drives
#[derive(Clone)]
pub struct QueueEnv {
    host: RunLoopHandle,
}

impl QueueEnv {
    pub fn new(host: RunLoopHandle) -> Self {
        Self { host }
    }

    pub fn host(&self) -> &RunLoopHandle {
        &self.host
    }

    /// The clock shared with the host loop's timers
    pub fn clock(&self) -> Arc<dyn TimeSource> {
        self.host.clock()
    }
}

impl std::fmt::Debug for QueueEnv {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueueEnv")
            .field("owner", &self.host.owner())
            .finish()
    }
}
