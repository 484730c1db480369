//! Acquire/release gate
//!
//! Counts the native holders that need the queue to keep the host loop
//! alive. Only the owning thread may move the count.

use std::thread::{self, ThreadId};

/// Outcome of an acquire or release attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateTransition {
    /// Count went up; `first` marks the 0 -> 1 edge
    Acquired { first: bool },
    /// Count went down; `last` marks the 1 -> 0 edge
    Released { last: bool },
    /// Called off the owning thread; nothing changed
    WrongThread,
    /// Release with a count of zero; nothing changed
    AlreadyZero,
}

impl GateTransition {
    pub fn succeeded(self) -> bool {
        matches!(self, GateTransition::Acquired { .. } | GateTransition::Released { .. })
    }
}

#[derive(Debug)]
pub struct ReferenceGate {
    owner: ThreadId,
    count: u32,
}

impl ReferenceGate {
    /// Create a gate owned by the calling thread
    pub fn new() -> Self {
        Self::owned_by(thread::current().id())
    }

    pub fn owned_by(owner: ThreadId) -> Self {
        Self { owner, count: 0 }
    }

    pub fn owner(&self) -> ThreadId {
        self.owner
    }

    fn on_owner(&self) -> bool {
        thread::current().id() == self.owner
    }

    pub fn acquire(&mut self) -> GateTransition {
        if !self.on_owner() {
            return GateTransition::WrongThread;
        }
        self.count = self.count.saturating_add(1);
        GateTransition::Acquired {
            first: self.count == 1,
        }
    }

    pub fn release(&mut self) -> GateTransition {
        if self.count == 0 {
            return GateTransition::AlreadyZero;
        }
        if !self.on_owner() {
            return GateTransition::WrongThread;
        }
        self.count -= 1;
        GateTransition::Released {
            last: self.count == 0,
        }
    }

    pub fn count(&self) -> u32 {
        self.count
    }

    pub fn is_zero(&self) -> bool {
        self.count == 0
    }
}

impl Default for ReferenceGate {
    fn default() -> Self {
        Self::new()
    }
}
