//! Pending task storage
//!
//! The [`TaskTable`] keeps tasks ordered by execute time, soonest at the
//! front. Entries with equal execute times keep their insertion order, so
//! draining the table is a stable sort of everything that was inserted.
//!
//! Tokens identify tasks for cancellation. Several entries may share one
//! token; they run independently and are all removed by `cancel_all`.

use crate::time::saturating_from_nanos;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use std::num::NonZeroU64;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

static NEXT_TOKEN: AtomicU64 = AtomicU64::new(1);

/// Opaque identity of a scheduled task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TaskToken(NonZeroU64);

impl TaskToken {
    /// Mint a token that has never been handed out before in this process
    pub fn mint() -> Self {
        let raw = NEXT_TOKEN.fetch_add(1, Ordering::Relaxed);
        // The counter starts at 1 and would need 2^64 mints to wrap.
        Self(NonZeroU64::new(raw).unwrap_or(NonZeroU64::MIN))
    }

    pub fn as_u64(self) -> u64 {
        self.0.get()
    }
}

impl fmt::Display for TaskToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "task#{}", self.0)
    }
}

/// What a task wants after it ran
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskControl {
    /// Run again after the task's delay
    Continue,
    /// Do not re-arm
    Stop,
}

impl From<bool> for TaskControl {
    fn from(keep_going: bool) -> Self {
        if keep_going {
            TaskControl::Continue
        } else {
            TaskControl::Stop
        }
    }
}

impl From<()> for TaskControl {
    fn from(_: ()) -> Self {
        TaskControl::Stop
    }
}

/// A unit of deferred work
pub trait Operation: Send {
    fn run(&mut self) -> TaskControl;
}

impl<F, R> Operation for F
where
    F: FnMut() -> R + Send,
    R: Into<TaskControl>,
{
    fn run(&mut self) -> TaskControl {
        self().into()
    }
}

/// One pending or executing task
pub struct Task {
    token: TaskToken,
    delay: Duration,
    execute_time: Duration,
    operation: Box<dyn Operation>,
}

impl Task {
    pub fn new(
        token: TaskToken,
        delay: Duration,
        execute_time: Duration,
        operation: Box<dyn Operation>,
    ) -> Self {
        Self {
            token,
            delay,
            execute_time,
            operation,
        }
    }

    pub fn token(&self) -> TaskToken {
        self.token
    }

    pub fn delay(&self) -> Duration {
        self.delay
    }

    pub fn execute_time(&self) -> Duration {
        self.execute_time
    }

    pub fn is_periodic(&self) -> bool {
        !self.delay.is_zero()
    }

    pub(crate) fn run(&mut self) -> TaskControl {
        self.operation.run()
    }

    /// The first tick of this task's period that lies strictly after `now`.
    ///
    /// Ticks missed while the owning thread was busy are skipped, never
    /// replayed. Zero-delay tasks re-arm at `now`.
    pub fn next_execute_time(&self, now: Duration) -> Duration {
        if self.delay.is_zero() {
            return now;
        }
        let period = self.delay.as_nanos();
        let behind = now.saturating_sub(self.execute_time).as_nanos();
        let ticks = behind / period + 1;
        self.execute_time
            .saturating_add(saturating_from_nanos(period.saturating_mul(ticks)))
    }

    pub(crate) fn rearm(&mut self, now: Duration) {
        self.execute_time = self.next_execute_time(now);
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("token", &self.token)
            .field("delay", &self.delay)
            .field("execute_time", &self.execute_time)
            .finish()
    }
}

/// Tasks ordered by execute time, soonest first
#[derive(Debug, Default)]
pub struct TaskTable {
    tasks: VecDeque<Task>,
}

impl TaskTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert keeping the order; ties go after existing entries
    pub fn insert(&mut self, task: Task) {
        let at = task.execute_time;
        match (self.tasks.front(), self.tasks.back()) {
            (None, _) => self.tasks.push_back(task),
            (_, Some(back)) if back.execute_time <= at => self.tasks.push_back(task),
            (Some(front), _) if front.execute_time > at => self.tasks.push_front(task),
            _ => {
                let idx = self.tasks.partition_point(|t| t.execute_time <= at);
                self.tasks.insert(idx, task);
            }
        }
    }

    /// Remove the soonest task if it is due at `now`
    pub fn pop_ready(&mut self, now: Duration) -> Option<Task> {
        match self.tasks.front() {
            Some(task) if task.execute_time <= now => self.tasks.pop_front(),
            _ => None,
        }
    }

    /// Remove every entry carrying `token`.
    ///
    /// The removed tasks are handed back so the caller can drop them after
    /// releasing its locks.
    pub fn cancel_all(&mut self, token: TaskToken) -> Vec<Task> {
        let mut removed = Vec::new();
        let mut kept = VecDeque::with_capacity(self.tasks.len());
        for task in self.tasks.drain(..) {
            if task.token == token {
                removed.push(task);
            } else {
                kept.push_back(task);
            }
        }
        self.tasks = kept;
        removed
    }

    /// Remove the most recently inserted entry matching `token` and `execute_time`
    pub fn remove_one(&mut self, token: TaskToken, execute_time: Duration) -> Option<Task> {
        let idx = self
            .tasks
            .iter()
            .rposition(|t| t.token == token && t.execute_time == execute_time)?;
        self.tasks.remove(idx)
    }

    pub fn front(&self) -> Option<&Task> {
        self.tasks.front()
    }

    pub fn next_execute_time(&self) -> Option<Duration> {
        self.tasks.front().map(|t| t.execute_time)
    }

    pub fn contains(&self, token: TaskToken) -> bool {
        self.tasks.iter().any(|t| t.token == token)
    }

    pub fn count(&self, token: TaskToken) -> usize {
        self.tasks.iter().filter(|t| t.token == token).count()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Task> {
        self.tasks.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn ms(v: u64) -> Duration {
        Duration::from_millis(v)
    }

    fn task(token: TaskToken, delay: u64, at: u64) -> Task {
        Task::new(token, ms(delay), ms(at), Box::new(|| TaskControl::Stop))
    }

    fn times(table: &TaskTable) -> Vec<u64> {
        table.iter().map(|t| t.execute_time().as_millis() as u64).collect()
    }

    #[test]
    fn test_tokens_are_unique() {
        let a = TaskToken::mint();
        let b = TaskToken::mint();
        assert_ne!(a, b);
        assert!(b.as_u64() > a.as_u64());
    }

    #[test]
    fn test_insert_keeps_order() {
        let mut table = TaskTable::new();
        for at in [50, 10, 30, 70, 20, 60] {
            table.insert(task(TaskToken::mint(), 0, at));
        }
        assert_eq!(times(&table), vec![10, 20, 30, 50, 60, 70]);
    }

    #[test]
    fn test_ties_keep_insertion_order() {
        let mut table = TaskTable::new();
        let first = TaskToken::mint();
        let second = TaskToken::mint();
        let third = TaskToken::mint();
        table.insert(task(first, 0, 10));
        table.insert(task(TaskToken::mint(), 0, 20));
        table.insert(task(second, 0, 10));
        table.insert(task(third, 0, 10));

        let order: Vec<_> = std::iter::from_fn(|| table.pop_ready(ms(10)))
            .map(|t| t.token())
            .collect();
        assert_eq!(order, vec![first, second, third]);
    }

    #[test]
    fn test_pop_ready_respects_now() {
        let mut table = TaskTable::new();
        table.insert(task(TaskToken::mint(), 0, 100));
        assert!(table.pop_ready(ms(99)).is_none());
        assert!(table.pop_ready(ms(100)).is_some());
        assert!(table.is_empty());
    }

    #[test]
    fn test_cancel_all_removes_duplicates() {
        let mut table = TaskTable::new();
        let shared = TaskToken::mint();
        table.insert(task(shared, 0, 10));
        table.insert(task(TaskToken::mint(), 0, 15));
        table.insert(task(shared, 25, 20));
        assert_eq!(table.count(shared), 2);

        let removed = table.cancel_all(shared);
        assert_eq!(removed.len(), 2);
        assert!(!table.contains(shared));
        assert_eq!(table.len(), 1);
        assert!(table.cancel_all(shared).is_empty());
    }

    #[test]
    fn test_remove_one_leaves_siblings() {
        let mut table = TaskTable::new();
        let shared = TaskToken::mint();
        table.insert(task(shared, 0, 10));
        table.insert(task(shared, 0, 10));
        assert!(table.remove_one(shared, ms(10)).is_some());
        assert_eq!(table.count(shared), 1);
        assert!(table.remove_one(shared, ms(99)).is_none());
    }

    #[test]
    fn test_phase_correct_rearm() {
        let t = task(TaskToken::mint(), 100, 100);
        assert_eq!(t.next_execute_time(ms(100)), ms(200));
        assert_eq!(t.next_execute_time(ms(350)), ms(400));
        assert_eq!(t.next_execute_time(ms(250)), ms(300));
        let from_zero = task(TaskToken::mint(), 100, 0);
        assert_eq!(from_zero.next_execute_time(ms(0)), ms(100));
        // Exactly on a tick boundary still lands in the future.
        assert_eq!(t.next_execute_time(ms(300)), ms(400));
        // Running early never schedules in the past.
        assert_eq!(t.next_execute_time(ms(40)), ms(200));
    }

    #[test]
    fn test_rearm_saturates_for_huge_periods() {
        let t = Task::new(TaskToken::mint(), Duration::MAX, ms(5), Box::new(|| TaskControl::Continue));
        assert_eq!(t.next_execute_time(ms(10)), Duration::MAX);

        let late = task(TaskToken::mint(), 100, 100);
        assert_eq!(late.next_execute_time(Duration::MAX), Duration::MAX);
    }

    #[test]
    fn test_zero_delay_rearms_now() {
        let t = task(TaskToken::mint(), 0, 10);
        assert_eq!(t.next_execute_time(ms(77)), ms(77));
        assert!(!t.is_periodic());
    }

    #[test]
    fn test_closure_operations() {
        let mut calls = 0;
        let mut op = move || {
            calls += 1;
            calls < 2
        };
        assert_eq!(Operation::run(&mut op), TaskControl::Continue);
        assert_eq!(Operation::run(&mut op), TaskControl::Stop);

        let mut once = || {};
        assert_eq!(Operation::run(&mut once), TaskControl::Stop);
    }
}
