//! Run loop bridge
//!
//! The only code that touches the host loop on behalf of a queue. It owns
//! the single outstanding wake registration and a cross-thread mailbox:
//! producers push thunks from any thread, one coalesced `post` wakes the
//! owning thread, and the owning thread drains the whole batch.
//!
//! ```text
//!  producer ──► mailbox (lock) ──► host.post(deliver) ──► owning thread
//!  producer ──►       │                  (once per batch)      │
//!                     └──────────── thunks run in order ◄──────┘
//! ```

use crate::error::{Error, OwnerOperation, Result};
use crate::event_loop::{Callback, RunLoopHandle, TimerId};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

/// Lifecycle of the cross-thread mailbox
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BridgeState {
    /// Not accepting cross-thread work and not keeping the loop alive
    Closed,
    /// Accepting cross-thread work
    Open,
    /// Delivering what is queued, refusing anything new
    Closing,
}

struct Mailbox {
    state: BridgeState,
    thunks: VecDeque<Callback>,
    post_pending: bool,
    holds_loop: bool,
}

struct BridgeShared {
    host: RunLoopHandle,
    max_wake_delay: Duration,
    mailbox: Mutex<Mailbox>,
    wake: Mutex<Option<TimerId>>,
}

impl BridgeShared {
    fn finish_close(&self, mailbox: &mut Mailbox) {
        mailbox.state = BridgeState::Closed;
        if mailbox.holds_loop {
            mailbox.holds_loop = false;
            self.host.unref_loop();
        }
    }

    fn deliver(&self) {
        loop {
            let batch = {
                let mut mailbox = self.mailbox.lock();
                if mailbox.thunks.is_empty() {
                    mailbox.post_pending = false;
                    if mailbox.state == BridgeState::Closing {
                        self.finish_close(&mut mailbox);
                        tracing::debug!("bridge drained and closed");
                    }
                    return;
                }
                std::mem::take(&mut mailbox.thunks)
            };
            tracing::trace!(count = batch.len(), "delivering cross-thread thunks");
            for thunk in batch {
                thunk();
            }
        }
    }
}

/// Clamp a wake delay into `[0, max]`
pub fn clamp_wake_delay(delay: Duration, max: Duration) -> Duration {
    delay.min(max)
}

/// Owner of one queue's wake registration and cross-thread mailbox
pub struct RunLoopBridge {
    shared: Arc<BridgeShared>,
}

impl RunLoopBridge {
    /// Create a closed bridge over `host`
    pub fn new(host: RunLoopHandle, max_wake_delay: Duration) -> Self {
        Self {
            shared: Arc::new(BridgeShared {
                host,
                max_wake_delay,
                mailbox: Mutex::new(Mailbox {
                    state: BridgeState::Closed,
                    thunks: VecDeque::new(),
                    post_pending: false,
                    holds_loop: false,
                }),
                wake: Mutex::new(None),
            }),
        }
    }

    pub fn host(&self) -> &RunLoopHandle {
        &self.shared.host
    }

    pub fn state(&self) -> BridgeState {
        self.shared.mailbox.lock().state
    }

    pub fn is_open(&self) -> bool {
        self.state() == BridgeState::Open
    }

    /// Start accepting cross-thread work and keep the host loop alive
    pub fn open(&self) -> Result<()> {
        if !self.shared.host.is_owner_thread() {
            return Err(Error::wrong_thread(OwnerOperation::OpenBridge));
        }
        let mut mailbox = self.shared.mailbox.lock();
        if mailbox.state != BridgeState::Open {
            tracing::debug!(from = ?mailbox.state, "bridge opened");
        }
        mailbox.state = BridgeState::Open;
        if !mailbox.holds_loop {
            mailbox.holds_loop = true;
            self.shared.host.ref_loop();
        }
        Ok(())
    }

    /// Cancel the wake and stop accepting cross-thread work.
    ///
    /// Thunks already queued are still delivered; the bridge reaches
    /// `Closed` once they have run.
    pub fn close(&self) -> Result<()> {
        if !self.shared.host.is_owner_thread() {
            return Err(Error::wrong_thread(OwnerOperation::CloseBridge));
        }
        self.cancel_wake();
        let mut mailbox = self.shared.mailbox.lock();
        if mailbox.state == BridgeState::Open {
            if mailbox.thunks.is_empty() && !mailbox.post_pending {
                self.shared.finish_close(&mut mailbox);
                tracing::debug!("bridge closed");
            } else {
                mailbox.state = BridgeState::Closing;
                tracing::debug!(pending = mailbox.thunks.len(), "bridge closing");
            }
        }
        Ok(())
    }

    /// Replace the outstanding wake with one firing `reentry` after `delay`.
    ///
    /// The delay is clamped to the bridge's maximum.
    pub fn schedule_wake(&self, delay: Duration, reentry: Callback) -> Result<()> {
        if !self.shared.host.is_owner_thread() {
            return Err(Error::wrong_thread(OwnerOperation::ScheduleWake));
        }
        self.cancel_wake();

        let delay = clamp_wake_delay(delay, self.shared.max_wake_delay);
        let weak: Weak<BridgeShared> = Arc::downgrade(&self.shared);
        let armed = Arc::new(AtomicU64::new(0));
        let armed_in_timer = Arc::clone(&armed);
        let id = self.shared.host.set_timeout(
            delay,
            Box::new(move || {
                if let Some(shared) = weak.upgrade() {
                    let mut wake = shared.wake.lock();
                    if wake.map(TimerId::as_u64) == Some(armed_in_timer.load(Ordering::Acquire)) {
                        *wake = None;
                    }
                }
                reentry();
            }),
        )?;
        armed.store(id.as_u64(), Ordering::Release);
        *self.shared.wake.lock() = Some(id);
        tracing::debug!(delay_ms = delay.as_millis() as u64, timer = id.as_u64(), "wake scheduled");
        Ok(())
    }

    /// Best-effort cancel of the outstanding wake
    pub fn cancel_wake(&self) -> bool {
        if !self.shared.host.is_owner_thread() {
            tracing::warn!("cancel_wake called off the owning thread");
            return false;
        }
        let id = self.shared.wake.lock().take();
        match id {
            Some(id) => self.shared.host.clear_timeout(id).unwrap_or(false),
            None => false,
        }
    }

    pub fn has_wake(&self) -> bool {
        self.shared.wake.lock().is_some()
    }

    /// Run `thunk` on the owning thread. Callable from any thread.
    ///
    /// Returns false if the bridge is closed or closing, or if the host
    /// loop has stopped; `thunk` is then dropped without running.
    pub fn cross_thread_invoke(&self, thunk: Callback) -> bool {
        let needs_post = {
            let mut mailbox = self.shared.mailbox.lock();
            if mailbox.state != BridgeState::Open {
                Err(thunk)
            } else {
                mailbox.thunks.push_back(thunk);
                Ok(!std::mem::replace(&mut mailbox.post_pending, true))
            }
        };

        match needs_post {
            Err(refused) => {
                // Dropped outside the mailbox lock; it may re-enter the bridge.
                drop(refused);
                tracing::debug!("cross-thread invoke refused: bridge not open");
                false
            }
            Ok(false) => true,
            Ok(true) => {
                let weak = Arc::downgrade(&self.shared);
                let posted = self.shared.host.post(Box::new(move || {
                    if let Some(shared) = weak.upgrade() {
                        shared.deliver();
                    }
                }));
                if posted {
                    return true;
                }

                let stranded = {
                    let mut mailbox = self.shared.mailbox.lock();
                    mailbox.post_pending = false;
                    self.shared.finish_close(&mut mailbox);
                    std::mem::take(&mut mailbox.thunks)
                };
                tracing::warn!(
                    dropped = stranded.len(),
                    "host loop stopped; cross-thread invoke refused"
                );
                false
            }
        }
    }

    /// Thunks queued but not yet delivered
    pub fn pending_invokes(&self) -> usize {
        self.shared.mailbox.lock().thunks.len()
    }
}

impl std::fmt::Debug for RunLoopBridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunLoopBridge")
            .field("state", &self.state())
            .field("has_wake", &self.has_wake())
            .finish()
    }
}
