//! Cross-thread task queue
//!
//! A [`TaskQueue`] is bound to the thread that owns the host run loop.
//! Any thread may add or cancel tasks; task bodies only ever run on the
//! owning thread, from the wake registration the queue keeps armed on the
//! host loop.
//!
//! # Lifecycle
//!
//! ```text
//!  bind ──► Active ◄──► Draining          (schedule() running)
//!             │
//!             ▼ ref count 0, table empty, no wake
//!          Released ──► Terminated        (shutdown())
//! ```
//!
//! The acquire/release gate decides whether the cross-thread bridge is
//! open. While the count is zero, producers on other threads are refused
//! with [`Error::Draining`], because nothing guarantees the owning thread
//! will come back to run their work.
//!
//! # Example
//! ```
//! use runloop_bridge::config::{QueueConfig, QueueEnv};
//! use runloop_bridge::event_loop::RunLoop;
//! use runloop_bridge::queue::TaskQueue;
//!
//! let run_loop = RunLoop::new();
//! let queue = TaskQueue::bind(QueueEnv::new(run_loop.handle()), QueueConfig::default()).unwrap();
//! queue.acquire();
//!
//! let remote = queue.clone();
//! let answer = std::thread::spawn(move || remote.add_waitable_task(|| 6 * 7));
//! let future = answer.join().unwrap();
//!
//! queue.release();
//! run_loop.run().unwrap();
//! assert_eq!(future.wait().unwrap(), 42);
//! assert!(queue.is_released());
//! ```

mod waitable;

pub use waitable::TaskFuture;

use crate::bridge::{BridgeState, RunLoopBridge};
use crate::config::{QueueConfig, QueueEnv};
use crate::error::{Error, OwnerOperation, Result};
use crate::gate::{GateTransition, ReferenceGate};
use crate::task_table::{Operation, Task, TaskControl, TaskTable, TaskToken};
use crate::time::{ceil_to, TimeSource};
use parking_lot::{Condvar, Mutex, ReentrantMutex};
use serde::{Deserialize, Serialize};
use std::cell::RefCell;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{mpsc, Arc, Weak};
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};

static NEXT_QUEUE_ID: AtomicU64 = AtomicU64::new(1);

thread_local! {
    /// Queues bound to this thread. Entries whose queue was dropped on
    /// another thread are pruned at the next bind.
    static BOUND_QUEUES: RefCell<Vec<(QueueId, Weak<QueueShared>)>> = const { RefCell::new(Vec::new()) };
}

/// Process-unique identity of a queue
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct QueueId(u64);

impl QueueId {
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

/// Observable lifecycle phase
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum QueuePhase {
    Active,
    Draining,
    Released,
    Terminated,
}

/// Counters reported by [`TaskQueue::stats`]
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    pub tasks_added: u64,
    pub tasks_executed: u64,
    pub tasks_rearmed: u64,
    pub tasks_cancelled: u64,
    pub tasks_refused: u64,
    pub task_panics: u64,
    pub drains: u64,
    pub pending: usize,
    pub ref_count: u32,
}

#[derive(Default)]
struct Counters {
    added: AtomicU64,
    executed: AtomicU64,
    rearmed: AtomicU64,
    cancelled: AtomicU64,
    refused: AtomicU64,
    panics: AtomicU64,
    drains: AtomicU64,
}

fn bump(counter: &AtomicU64, by: u64) {
    counter.fetch_add(by, Ordering::Relaxed);
}

struct Inner {
    table: TaskTable,
    gate: ReferenceGate,
    /// Tasks re-armed during the current drain, inserted when it ends
    rearmed: Vec<Task>,
    draining: bool,
    terminated: bool,
    /// A cross-thread reschedule is queued on the bridge
    reschedule_posted: bool,
}

impl Inner {
    fn is_idle(&self) -> bool {
        self.gate.is_zero() && self.table.is_empty() && self.rearmed.is_empty() && !self.draining
    }
}

/// The task currently running on the owning thread
struct ExecSlot {
    token: Option<TaskToken>,
    rearm: bool,
}

struct QueueShared {
    id: QueueId,
    owner: ThreadId,
    config: QueueConfig,
    clock: Arc<dyn TimeSource>,
    bridge: RunLoopBridge,
    state: ReentrantMutex<RefCell<Inner>>,
    exec: Mutex<ExecSlot>,
    exec_done: Condvar,
    counters: Counters,
}

impl Drop for QueueShared {
    fn drop(&mut self) {
        if thread::current().id() != self.owner {
            return;
        }
        let id = self.id;
        let _ = BOUND_QUEUES.try_with(|bound| {
            if let Ok(mut bound) = bound.try_borrow_mut() {
                bound.retain(|(bound_id, _)| *bound_id != id);
            }
        });
    }
}

/// Handle to a task queue; clones share the same queue
#[derive(Clone)]
pub struct TaskQueue {
    shared: Arc<QueueShared>,
}

impl TaskQueue {
    /// Bind a new queue to the calling thread, which must own `env`'s loop
    pub fn bind(env: QueueEnv, config: QueueConfig) -> Result<Self> {
        config.validate()?;
        if !env.host().is_owner_thread() {
            return Err(Error::wrong_thread(OwnerOperation::Bind));
        }

        let id = QueueId(NEXT_QUEUE_ID.fetch_add(1, Ordering::Relaxed));
        let owner = thread::current().id();
        let bridge = RunLoopBridge::new(env.host().clone(), config.max_wake_delay());
        let shared = Arc::new(QueueShared {
            id,
            owner,
            config,
            clock: env.clock(),
            bridge,
            state: ReentrantMutex::new(RefCell::new(Inner {
                table: TaskTable::new(),
                gate: ReferenceGate::owned_by(owner),
                rearmed: Vec::new(),
                draining: false,
                terminated: false,
                reschedule_posted: false,
            })),
            exec: Mutex::new(ExecSlot {
                token: None,
                rearm: false,
            }),
            exec_done: Condvar::new(),
            counters: Counters::default(),
        });

        BOUND_QUEUES.with(|bound| {
            let mut bound = bound.borrow_mut();
            bound.retain(|(_, queue)| queue.strong_count() > 0);
            bound.push((id, Arc::downgrade(&shared)));
        });
        tracing::debug!(queue = id.0, ?owner, "task queue bound");
        Ok(Self { shared })
    }

    pub fn id(&self) -> QueueId {
        self.shared.id
    }

    pub fn owner(&self) -> ThreadId {
        self.shared.owner
    }

    pub fn config(&self) -> &QueueConfig {
        &self.shared.config
    }

    pub fn now(&self) -> Duration {
        self.shared.clock.now()
    }

    /// Whether the calling thread is the one this queue is bound to
    pub fn is_owner(&self) -> bool {
        BOUND_QUEUES.with(|bound| bound.borrow().iter().any(|(id, _)| *id == self.shared.id))
    }

    /// Whether two handles refer to the same queue
    pub fn same_queue(&self, other: &TaskQueue) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }

    fn with_inner<R>(&self, f: impl FnOnce(&mut Inner) -> R) -> R {
        let guard = self.shared.state.lock();
        let mut inner = guard.borrow_mut();
        f(&mut inner)
    }

    fn report_wrong_thread(&self, operation: OwnerOperation) {
        tracing::warn!(
            queue = self.shared.id.0,
            %operation,
            caller = ?thread::current().id(),
            "owning-thread operation called from another thread"
        );
        if self.shared.config.strict_thread_checks && cfg!(debug_assertions) {
            panic!("{} called off the owning thread", operation);
        }
    }

    // ---------------------------------------------------------------------
    // Acquire / release gate
    // ---------------------------------------------------------------------

    /// Take a reference that keeps the bridge open. Owning thread only.
    pub fn acquire(&self) -> bool {
        if !self.is_owner() {
            self.report_wrong_thread(OwnerOperation::Acquire);
            return false;
        }
        let transition = self.with_inner(|inner| {
            if inner.terminated {
                None
            } else {
                Some(inner.gate.acquire())
            }
        });

        match transition {
            Some(GateTransition::Acquired { first }) => {
                if first {
                    if let Err(e) = self.shared.bridge.open() {
                        tracing::error!(queue = self.shared.id.0, error = %e, "failed to open bridge");
                    }
                    tracing::debug!(queue = self.shared.id.0, "first reference acquired");
                }
                true
            }
            Some(_) => false,
            None => {
                tracing::debug!(queue = self.shared.id.0, "acquire on a terminated queue");
                false
            }
        }
    }

    /// Drop a reference. Owning thread only; false when the count is zero.
    ///
    /// On the last release the wake registration is torn down at once if
    /// the table is empty, otherwise once the table drains.
    pub fn release(&self) -> bool {
        let transition = self.with_inner(|inner| inner.gate.release());
        match transition {
            GateTransition::Released { last } => {
                if last {
                    tracing::debug!(queue = self.shared.id.0, "last reference released");
                    self.teardown_if_idle();
                }
                true
            }
            GateTransition::AlreadyZero => {
                tracing::debug!(queue = self.shared.id.0, "release with a zero count ignored");
                false
            }
            GateTransition::WrongThread => {
                self.report_wrong_thread(OwnerOperation::Release);
                false
            }
            GateTransition::Acquired { .. } => false,
        }
    }

    /// True when nothing keeps the queue alive. Owning thread only.
    pub fn is_released(&self) -> bool {
        if !self.is_owner() {
            self.report_wrong_thread(OwnerOperation::IsReleased);
            return false;
        }
        self.idle_now()
    }

    fn idle_now(&self) -> bool {
        self.with_inner(|inner| inner.is_idle())
            && !self.shared.bridge.has_wake()
            && self.shared.exec.lock().token.is_none()
    }

    pub fn ref_count(&self) -> u32 {
        self.with_inner(|inner| inner.gate.count())
    }

    // ---------------------------------------------------------------------
    // Producers
    // ---------------------------------------------------------------------

    /// Run `operation` on the owning thread as soon as possible
    pub fn add_task<O>(&self, operation: O) -> Result<TaskToken>
    where
        O: Operation + 'static,
    {
        self.add_task_with_delay(operation, Duration::ZERO)
    }

    /// Run `operation` after `delay`, then every `delay` while it returns
    /// [`TaskControl::Continue`]. Callable from any thread.
    ///
    /// Execute times saturate at `Duration::MAX`, so a huge delay parks the
    /// task until it is cancelled.
    ///
    /// # Errors
    ///
    /// [`Error::Draining`] when called off the owning thread while the queue
    /// is released. The entry is rolled back, but a drain running at the
    /// same moment may already have popped and run it, so retrying a refused
    /// add can run the operation twice.
    pub fn add_task_with_delay<O>(&self, operation: O, delay: Duration) -> Result<TaskToken>
    where
        O: Operation + 'static,
    {
        self.insert(TaskToken::mint(), Box::new(operation), delay)
    }

    /// Schedule another entry under an existing token.
    ///
    /// Entries sharing a token run independently; [`cancel_task`](Self::cancel_task)
    /// removes them all.
    pub fn add_task_with_token<O>(&self, token: TaskToken, operation: O, delay: Duration) -> Result<TaskToken>
    where
        O: Operation + 'static,
    {
        self.insert(token, Box::new(operation), delay)
    }

    fn insert(&self, token: TaskToken, operation: Box<dyn Operation>, delay: Duration) -> Result<TaskToken> {
        let execute_time =
            ceil_to(self.shared.clock.now(), self.shared.config.granularity()).saturating_add(delay);
        let task = Task::new(token, delay, execute_time, operation);

        let refused = self.with_inner(|inner| {
            if inner.terminated {
                Some(task)
            } else {
                inner.table.insert(task);
                None
            }
        });
        if let Some(task) = refused {
            drop(task);
            bump(&self.shared.counters.refused, 1);
            return Err(Error::Terminated);
        }

        if let Err(e) = self.reschedule_timer() {
            // None when a concurrent drain already took the entry.
            let rolled_back = self.with_inner(|inner| inner.table.remove_one(token, execute_time));
            drop(rolled_back);
            bump(&self.shared.counters.refused, 1);
            tracing::debug!(queue = self.shared.id.0, %token, error = %e, "task refused");
            return Err(e);
        }

        bump(&self.shared.counters.added, 1);
        tracing::trace!(
            queue = self.shared.id.0,
            %token,
            delay_ms = delay.as_millis() as u64,
            "task added"
        );
        Ok(token)
    }

    /// Run `f` once on the owning thread and hand its value back.
    ///
    /// If scheduling is refused the returned future is already abandoned.
    pub fn add_waitable_task<T, F>(&self, f: F) -> TaskFuture<T>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        if self.is_owner() && self.is_draining() {
            tracing::warn!(
                queue = self.shared.id.0,
                "waitable task added from inside the queue's own drain; waiting here deadlocks"
            );
        }

        let (tx, rx) = mpsc::sync_channel(1);
        let mut f = Some(f);
        let operation = move || {
            if let Some(f) = f.take() {
                let _ = tx.send(f());
            }
            TaskControl::Stop
        };

        match self.add_task(operation) {
            Ok(token) => TaskFuture::new(rx, Some(token), self.shared.config.waitable_timeout()),
            Err(e) => {
                tracing::debug!(queue = self.shared.id.0, error = %e, "waitable task abandoned");
                TaskFuture::new(rx, None, None)
            }
        }
    }

    /// Remove every entry for `token` and stop an in-flight run from re-arming.
    ///
    /// Called off the owning thread while the task is running, this blocks
    /// until the run finishes (bounded by `waitable_timeout_ms` when set).
    /// Returns whether anything was cancelled.
    pub fn cancel_task(&self, token: TaskToken) -> bool {
        let owner = self.is_owner();
        let (removed, executing) = self.with_inner(|inner| {
            let mut removed = inner.table.cancel_all(token);
            let (cancelled, kept): (Vec<Task>, Vec<Task>) = std::mem::take(&mut inner.rearmed)
                .into_iter()
                .partition(|t| t.token() == token);
            inner.rearmed = kept;
            removed.extend(cancelled);

            let mut exec = self.shared.exec.lock();
            let executing = exec.token == Some(token);
            if executing {
                exec.rearm = false;
            }
            (removed, executing)
        });

        let found = !removed.is_empty() || executing;
        bump(&self.shared.counters.cancelled, removed.len() as u64);
        let shortened = !removed.is_empty();
        drop(removed);

        if executing && !owner && !self.wait_until_not_running(token) {
            tracing::warn!(
                queue = self.shared.id.0,
                %token,
                "cancel gave up waiting for the running task"
            );
        }

        if shortened {
            // The next wake may now be later; failure leaves a harmless early wake.
            let _ = self.reschedule_timer();
        }
        if found {
            tracing::trace!(queue = self.shared.id.0, %token, "task cancelled");
        }
        found
    }

    fn wait_until_not_running(&self, token: TaskToken) -> bool {
        let limit = self.shared.config.waitable_timeout();
        let start = Instant::now();
        let mut exec = self.shared.exec.lock();
        while exec.token == Some(token) {
            match limit {
                None => self.shared.exec_done.wait(&mut exec),
                Some(limit) => {
                    let elapsed = start.elapsed();
                    if elapsed >= limit {
                        return false;
                    }
                    let _ = self.shared.exec_done.wait_for(&mut exec, limit - elapsed);
                }
            }
        }
        true
    }

    // ---------------------------------------------------------------------
    // Wake management
    // ---------------------------------------------------------------------

    /// Make sure a wake is armed for the soonest task.
    ///
    /// Off the owning thread this goes through the bridge, coalescing
    /// concurrent requests into one delivery.
    fn reschedule_timer(&self) -> Result<()> {
        if self.is_owner() {
            self.rearm_wake();
            return Ok(());
        }

        let already_posted = self.with_inner(|inner| std::mem::replace(&mut inner.reschedule_posted, true));
        if already_posted {
            return Ok(());
        }

        let weak = Arc::downgrade(&self.shared);
        let accepted = self.shared.bridge.cross_thread_invoke(Box::new(move || {
            if let Some(shared) = weak.upgrade() {
                let queue = TaskQueue { shared };
                queue.with_inner(|inner| inner.reschedule_posted = false);
                queue.rearm_wake();
            }
        }));

        if accepted {
            Ok(())
        } else {
            self.with_inner(|inner| inner.reschedule_posted = false);
            Err(Error::Draining)
        }
    }

    /// Owning thread: arm the wake for the table front, or tear down when idle
    fn rearm_wake(&self) {
        let next = self.with_inner(|inner| {
            if inner.draining || inner.terminated {
                None
            } else {
                Some(inner.table.next_execute_time())
            }
        });

        match next {
            // A drain in progress re-arms when it finishes.
            None => {}
            Some(Some(at)) => {
                let delay = at.saturating_sub(self.shared.clock.now());
                let weak = Arc::downgrade(&self.shared);
                let armed = self.shared.bridge.schedule_wake(
                    delay,
                    Box::new(move || {
                        if let Some(shared) = weak.upgrade() {
                            let queue = TaskQueue { shared };
                            let now = queue.now();
                            queue.schedule(now);
                        }
                    }),
                );
                if let Err(e) = armed {
                    tracing::error!(queue = self.shared.id.0, error = %e, "failed to arm wake");
                }
            }
            Some(None) => {
                self.shared.bridge.cancel_wake();
                self.teardown_if_idle();
            }
        }
    }

    fn teardown_if_idle(&self) {
        if !self.with_inner(|inner| inner.is_idle()) {
            return;
        }
        self.shared.bridge.cancel_wake();
        if self.shared.bridge.state() == BridgeState::Open {
            if let Err(e) = self.shared.bridge.close() {
                tracing::error!(queue = self.shared.id.0, error = %e, "failed to close bridge");
            }
            tracing::debug!(queue = self.shared.id.0, "queue idle; wake registration released");
        }
    }

    // ---------------------------------------------------------------------
    // Drain loop
    // ---------------------------------------------------------------------

    /// Run every task due at `now`. Owning thread only.
    ///
    /// Re-armed tasks are held back until the drain ends, so a zero-delay
    /// task runs once per call. A nested call from inside a task body does
    /// nothing. Returns the number of task bodies invoked.
    pub fn schedule(&self, now: Duration) -> usize {
        if !self.is_owner() {
            self.report_wrong_thread(OwnerOperation::Schedule);
            return 0;
        }
        let entered = self.with_inner(|inner| !std::mem::replace(&mut inner.draining, true));
        if !entered {
            return 0;
        }
        bump(&self.shared.counters.drains, 1);

        let mut executed = 0;
        loop {
            let next = self.with_inner(|inner| {
                let task = inner.table.pop_ready(now)?;
                let mut exec = self.shared.exec.lock();
                exec.token = Some(task.token());
                exec.rearm = true;
                Some(task)
            });
            let Some(mut task) = next else { break };

            let token = task.token();
            tracing::trace!(queue = self.shared.id.0, %token, "running task");
            let control = match panic::catch_unwind(AssertUnwindSafe(|| task.run())) {
                Ok(control) => control,
                Err(_) => {
                    bump(&self.shared.counters.panics, 1);
                    tracing::error!(queue = self.shared.id.0, %token, "task panicked; not re-arming");
                    TaskControl::Stop
                }
            };
            executed += 1;

            let finished = self.with_inner(|inner| {
                let mut exec = self.shared.exec.lock();
                let rearm = exec.rearm && control == TaskControl::Continue && !inner.terminated;
                exec.token = None;
                exec.rearm = false;
                self.shared.exec_done.notify_all();

                if rearm {
                    task.rearm(now);
                    inner.rearmed.push(task);
                    None
                } else {
                    Some(task)
                }
            });
            if finished.is_none() {
                bump(&self.shared.counters.rearmed, 1);
            }
            drop(finished);
        }

        self.with_inner(|inner| {
            for task in std::mem::take(&mut inner.rearmed) {
                inner.table.insert(task);
            }
            inner.draining = false;
        });
        bump(&self.shared.counters.executed, executed as u64);

        self.shared.bridge.cancel_wake();
        self.rearm_wake();
        executed
    }

    // ---------------------------------------------------------------------
    // Teardown and introspection
    // ---------------------------------------------------------------------

    /// Move a released queue to its terminal state. Owning thread only.
    pub fn shutdown(&self) -> bool {
        if !self.is_owner() {
            self.report_wrong_thread(OwnerOperation::Shutdown);
            return false;
        }
        if !self.idle_now() {
            return false;
        }
        self.with_inner(|inner| inner.terminated = true);
        self.shared.bridge.cancel_wake();
        if let Err(e) = self.shared.bridge.close() {
            tracing::error!(queue = self.shared.id.0, error = %e, "failed to close bridge");
        }
        BOUND_QUEUES.with(|bound| bound.borrow_mut().retain(|(id, _)| *id != self.shared.id));
        tracing::debug!(queue = self.shared.id.0, "task queue shut down");
        true
    }

    pub fn phase(&self) -> QueuePhase {
        let (terminated, draining) = self.with_inner(|inner| (inner.terminated, inner.draining));
        if terminated {
            QueuePhase::Terminated
        } else if draining {
            QueuePhase::Draining
        } else if self.idle_now() {
            QueuePhase::Released
        } else {
            QueuePhase::Active
        }
    }

    pub fn is_draining(&self) -> bool {
        self.with_inner(|inner| inner.draining)
    }

    /// Pending entries, including those re-armed by a drain in progress
    pub fn len(&self) -> usize {
        self.with_inner(|inner| inner.table.len() + inner.rearmed.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of pending entries carrying `token`
    pub fn pending_count(&self, token: TaskToken) -> usize {
        self.with_inner(|inner| {
            inner.table.count(token) + inner.rearmed.iter().filter(|t| t.token() == token).count()
        })
    }

    /// Execute time of the soonest pending entry
    pub fn next_execute_time(&self) -> Option<Duration> {
        self.with_inner(|inner| inner.table.next_execute_time())
    }

    /// Execute time of the soonest pending entry carrying `token`
    pub fn execute_time_of(&self, token: TaskToken) -> Option<Duration> {
        self.with_inner(|inner| {
            inner
                .table
                .iter()
                .chain(inner.rearmed.iter())
                .filter(|t| t.token() == token)
                .map(|t| t.execute_time())
                .min()
        })
    }

    pub fn is_executing(&self, token: TaskToken) -> bool {
        self.shared.exec.lock().token == Some(token)
    }

    pub fn bridge_state(&self) -> BridgeState {
        self.shared.bridge.state()
    }

    pub fn has_wake(&self) -> bool {
        self.shared.bridge.has_wake()
    }

    pub fn stats(&self) -> QueueStats {
        let c = &self.shared.counters;
        let (pending, ref_count) = self.with_inner(|inner| {
            (inner.table.len() + inner.rearmed.len(), inner.gate.count())
        });
        QueueStats {
            tasks_added: c.added.load(Ordering::Relaxed),
            tasks_executed: c.executed.load(Ordering::Relaxed),
            tasks_rearmed: c.rearmed.load(Ordering::Relaxed),
            tasks_cancelled: c.cancelled.load(Ordering::Relaxed),
            tasks_refused: c.refused.load(Ordering::Relaxed),
            task_panics: c.panics.load(Ordering::Relaxed),
            drains: c.drains.load(Ordering::Relaxed),
            pending,
            ref_count,
        }
    }
}

impl fmt::Debug for TaskQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskQueue")
            .field("id", &self.shared.id)
            .field("owner", &self.shared.owner)
            .field("bridge", &self.shared.bridge)
            .finish()
    }
}
