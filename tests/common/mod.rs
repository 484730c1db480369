//! Shared test helpers for integration tests

use parking_lot::Mutex;
use runloop_bridge::config::{QueueConfig, QueueEnv};
use runloop_bridge::event_loop::RunLoop;
use runloop_bridge::time::ManualClock;
use runloop_bridge::{TaskControl, TaskQueue};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// A queue bound to the calling thread, driven by a manual clock at t=0
#[allow(dead_code)]
pub fn manual_queue() -> (RunLoop, ManualClock, TaskQueue) {
    manual_queue_with(QueueConfig::default())
}

#[allow(dead_code)]
pub fn manual_queue_with(config: QueueConfig) -> (RunLoop, ManualClock, TaskQueue) {
    let clock = ManualClock::new();
    let run_loop = RunLoop::with_clock(Arc::new(clock.clone()));
    let queue = TaskQueue::bind(QueueEnv::new(run_loop.handle()), config).expect("bind on owning thread");
    (run_loop, clock, queue)
}

/// A queue bound to the calling thread on wall-clock time
#[allow(dead_code)]
pub fn realtime_queue() -> (RunLoop, TaskQueue) {
    let run_loop = RunLoop::new();
    let queue = TaskQueue::bind(QueueEnv::new(run_loop.handle()), QueueConfig::default())
        .expect("bind on owning thread");
    (run_loop, queue)
}

/// An operation that bumps `count` and then answers `control`
#[allow(dead_code)]
pub fn counting(count: &Arc<AtomicUsize>, control: TaskControl) -> impl FnMut() -> TaskControl + Send + 'static {
    let count = Arc::clone(count);
    move || {
        count.fetch_add(1, Ordering::SeqCst);
        control
    }
}

/// An operation that appends `label` to `log` once
#[allow(dead_code)]
pub fn recording<T: Clone + Send + 'static>(log: &Arc<Mutex<Vec<T>>>, label: T) -> impl FnMut() + Send + 'static {
    let log = Arc::clone(log);
    move || log.lock().push(label.clone())
}

#[allow(dead_code)]
pub fn ms(v: u64) -> Duration {
    Duration::from_millis(v)
}
