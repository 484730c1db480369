//! Host Run Loop
//!
//! A single-threaded run loop standing in for the scripting runtime's own
//! event loop. The thread that creates a [`RunLoop`] owns it: timers are
//! armed and fired there, and callbacks posted from other threads run
//! there. A [`RunLoopHandle`] can be shared with any thread, but only
//! `post`, `stop` and the keep-alive counters are legal off the owning
//! thread.
//!
//! # Example
//! ```
//! use runloop_bridge::event_loop::RunLoop;
//! use std::time::Duration;
//!
//! let run_loop = RunLoop::new();
//! let handle = run_loop.handle();
//! handle.set_timeout(Duration::ZERO, Box::new(|| println!("tick"))).unwrap();
//! run_loop.run().unwrap();
//! ```

use crate::error::{Error, OwnerOperation, Result};
use crate::time::{MonotonicClock, TimeSource};
use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::marker::PhantomData;
use std::sync::Arc;
use std::thread::{self, ThreadId};
use std::time::Duration;

/// A unit of work handed to the run loop
pub type Callback = Box<dyn FnOnce() + Send + 'static>;

/// Identifier of an armed timer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TimerId(u64);

impl TimerId {
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

/// A one-shot timer waiting to fire
struct Timer {
    id: TimerId,
    fire_at: Duration,
    callback: Callback,
}

/// Runtime statistics for the run loop
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoopStats {
    /// Timers that fired
    pub timers_fired: u64,
    /// Timers cleared before firing
    pub timers_cleared: u64,
    /// Cross-thread callbacks executed
    pub posts_run: u64,
    /// Number of `run_pending` turns
    pub turns: u64,
}

struct LoopState {
    timers: Vec<Timer>,
    posted: VecDeque<Callback>,
    next_timer_id: u64,
    keep_alive: usize,
    stopped: bool,
    stats: LoopStats,
}

struct LoopShared {
    owner: ThreadId,
    clock: Arc<dyn TimeSource>,
    state: Mutex<LoopState>,
    wakeup: Condvar,
}

impl LoopShared {
    fn check_owner(&self, operation: OwnerOperation) -> Result<()> {
        if thread::current().id() == self.owner {
            Ok(())
        } else {
            Err(Error::wrong_thread(operation))
        }
    }
}

/// The owning side of the host loop; stays on the thread that created it
pub struct RunLoop {
    shared: Arc<LoopShared>,
    _not_send: PhantomData<*const ()>,
}

impl RunLoop {
    /// Create a run loop on the calling thread using wall-clock time
    pub fn new() -> Self {
        Self::with_clock(MonotonicClock::shared())
    }

    /// Create a run loop on the calling thread driven by `clock`
    pub fn with_clock(clock: Arc<dyn TimeSource>) -> Self {
        Self {
            shared: Arc::new(LoopShared {
                owner: thread::current().id(),
                clock,
                state: Mutex::new(LoopState {
                    timers: Vec::new(),
                    posted: VecDeque::new(),
                    next_timer_id: 1,
                    keep_alive: 0,
                    stopped: false,
                    stats: LoopStats::default(),
                }),
                wakeup: Condvar::new(),
            }),
            _not_send: PhantomData,
        }
    }

    pub fn handle(&self) -> RunLoopHandle {
        RunLoopHandle {
            shared: Arc::clone(&self.shared),
        }
    }

    /// Run every posted callback and every timer that is due, once.
    ///
    /// Timers armed by the callbacks themselves wait for the next turn.
    /// Returns the number of callbacks invoked.
    pub fn run_pending(&self) -> Result<usize> {
        self.shared.check_owner(OwnerOperation::RunLoop)?;

        let (posted, due) = {
            let mut state = self.shared.state.lock();
            state.stats.turns += 1;
            let posted = std::mem::take(&mut state.posted);

            let now = self.shared.clock.now();
            let mut due = Vec::new();
            let mut i = 0;
            while i < state.timers.len() {
                if state.timers[i].fire_at <= now {
                    due.push(state.timers.swap_remove(i));
                } else {
                    i += 1;
                }
            }
            due.sort_by_key(|t| (t.fire_at, t.id));

            state.stats.posts_run += posted.len() as u64;
            state.stats.timers_fired += due.len() as u64;
            (posted, due)
        };

        let count = posted.len() + due.len();
        for callback in posted {
            callback();
        }
        for timer in due {
            tracing::trace!(timer = timer.id.0, "timer fired");
            (timer.callback)();
        }
        Ok(count)
    }

    /// Run until stopped or idle.
    ///
    /// The loop is idle when it has no timers, no posted callbacks and a
    /// keep-alive count of zero.
    pub fn run(&self) -> Result<usize> {
        self.run_inner(None)
    }

    /// Run until `duration` has elapsed on the loop's clock, or until stopped
    pub fn run_for(&self, duration: Duration) -> Result<usize> {
        let deadline = self.shared.clock.now() + duration;
        self.run_inner(Some(deadline))
    }

    fn run_inner(&self, deadline: Option<Duration>) -> Result<usize> {
        self.shared.check_owner(OwnerOperation::RunLoop)?;
        let mut total = 0;

        loop {
            total += self.run_pending()?;

            let mut state = self.shared.state.lock();
            if state.stopped {
                break;
            }
            if !state.posted.is_empty() {
                continue;
            }

            let now = self.shared.clock.now();
            if let Some(deadline) = deadline {
                if now >= deadline {
                    break;
                }
            } else if state.timers.is_empty() && state.keep_alive == 0 {
                break;
            }

            let next_timer = state.timers.iter().map(|t| t.fire_at).min();
            let wake_at = match (next_timer, deadline) {
                (Some(t), Some(d)) => Some(t.min(d)),
                (Some(t), None) => Some(t),
                (None, d) => d,
            };

            match wake_at {
                Some(at) if at <= now => continue,
                Some(at) => {
                    let _ = self.shared.wakeup.wait_for(&mut state, at - now);
                }
                None => self.shared.wakeup.wait(&mut state),
            }
        }

        Ok(total)
    }

    pub fn stats(&self) -> LoopStats {
        self.handle().stats()
    }
}

impl Default for RunLoop {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for RunLoop {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunLoop")
            .field("owner", &self.shared.owner)
            .finish()
    }
}

/// Shareable handle to a [`RunLoop`]
#[derive(Clone)]
pub struct RunLoopHandle {
    shared: Arc<LoopShared>,
}

impl RunLoopHandle {
    /// The thread that owns the loop
    pub fn owner(&self) -> ThreadId {
        self.shared.owner
    }

    pub fn is_owner_thread(&self) -> bool {
        thread::current().id() == self.shared.owner
    }

    pub fn clock(&self) -> Arc<dyn TimeSource> {
        Arc::clone(&self.shared.clock)
    }

    pub fn now(&self) -> Duration {
        self.shared.clock.now()
    }

    /// Arm a one-shot timer. Owning thread only.
    pub fn set_timeout(&self, delay: Duration, callback: Callback) -> Result<TimerId> {
        self.shared.check_owner(OwnerOperation::SetTimeout)?;
        let fire_at = self.shared.clock.now().saturating_add(delay);

        let mut state = self.shared.state.lock();
        let id = TimerId(state.next_timer_id);
        state.next_timer_id += 1;
        state.timers.push(Timer {
            id,
            fire_at,
            callback,
        });
        self.shared.wakeup.notify_one();
        Ok(id)
    }

    /// Disarm a timer. Returns false if it already fired or never existed.
    pub fn clear_timeout(&self, id: TimerId) -> Result<bool> {
        self.shared.check_owner(OwnerOperation::ClearTimeout)?;
        let removed = {
            let mut state = self.shared.state.lock();
            let idx = state.timers.iter().position(|t| t.id == id);
            let removed = idx.map(|i| state.timers.swap_remove(i));
            if removed.is_some() {
                state.stats.timers_cleared += 1;
            }
            removed
        };
        // The callback may own resources whose drop re-enters the loop.
        Ok(removed.is_some())
    }

    /// Queue a callback for the owning thread. Callable from any thread.
    ///
    /// Returns false once the loop has been stopped.
    pub fn post(&self, callback: Callback) -> bool {
        let mut state = self.shared.state.lock();
        if state.stopped {
            return false;
        }
        state.posted.push_back(callback);
        self.shared.wakeup.notify_one();
        true
    }

    /// Keep `run()` from returning while idle
    pub fn ref_loop(&self) {
        self.shared.state.lock().keep_alive += 1;
    }

    pub fn unref_loop(&self) {
        let mut state = self.shared.state.lock();
        state.keep_alive = state.keep_alive.saturating_sub(1);
        self.shared.wakeup.notify_one();
    }

    pub fn keep_alive_count(&self) -> usize {
        self.shared.state.lock().keep_alive
    }

    /// Make `run()` return and refuse further posts
    pub fn stop(&self) {
        let mut state = self.shared.state.lock();
        state.stopped = true;
        self.shared.wakeup.notify_all();
    }

    pub fn is_stopped(&self) -> bool {
        self.shared.state.lock().stopped
    }

    pub fn pending_timers(&self) -> usize {
        self.shared.state.lock().timers.len()
    }

    pub fn pending_posts(&self) -> usize {
        self.shared.state.lock().posted.len()
    }

    pub fn stats(&self) -> LoopStats {
        self.shared.state.lock().stats.clone()
    }
}

impl std::fmt::Debug for RunLoopHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunLoopHandle")
            .field("owner", &self.shared.owner)
            .finish()
    }
}
