//! Producers on other threads feeding a queue driven by a real run loop

mod common;
use common::{counting, manual_queue, manual_queue_with, ms, realtime_queue};
use runloop_bridge::config::QueueConfig;
use runloop_bridge::{Error, TaskControl};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::{Duration, Instant};

mod producers {
    use super::*;

    #[test]
    fn test_many_producers_all_tasks_run() {
        let (run_loop, queue) = realtime_queue();
        queue.acquire();
        let count = Arc::new(AtomicUsize::new(0));
        let remaining = Arc::new(AtomicUsize::new(4));

        let workers: Vec<_> = (0..4)
            .map(|_| {
                let queue = queue.clone();
                let count = Arc::clone(&count);
                let remaining = Arc::clone(&remaining);
                thread::spawn(move || {
                    for _ in 0..50 {
                        queue.add_task(counting(&count, TaskControl::Stop)).unwrap();
                    }
                    if remaining.fetch_sub(1, Ordering::AcqRel) == 1 {
                        let owner = queue.clone();
                        queue
                            .add_task(move || {
                                owner.release();
                            })
                            .unwrap();
                    }
                })
            })
            .collect();

        run_loop.run().unwrap();
        for w in workers {
            w.join().unwrap();
        }
        assert_eq!(count.load(Ordering::SeqCst), 200);
        assert!(queue.is_released());
        assert_eq!(queue.stats().tasks_added, 201);
    }

    #[test]
    fn test_cross_thread_adds_coalesce_into_one_post() {
        let (run_loop, _clock, queue) = manual_queue();
        queue.acquire();
        let barrier = Arc::new(Barrier::new(3));

        let workers: Vec<_> = (0..3)
            .map(|_| {
                let queue = queue.clone();
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    barrier.wait();
                    for _ in 0..10 {
                        queue.add_task(|| {}).unwrap();
                    }
                })
            })
            .collect();
        for w in workers {
            w.join().unwrap();
        }

        assert_eq!(queue.len(), 30);
        assert_eq!(run_loop.handle().pending_posts(), 1);
        run_loop.run_pending().unwrap();
        assert!(queue.has_wake());
    }
}

mod waitable {
    use super::*;

    #[test]
    fn test_waitable_value_crosses_threads() {
        let (run_loop, queue) = realtime_queue();
        queue.acquire();

        let remote = queue.clone();
        let producer = thread::spawn(move || {
            let value = remote.add_waitable_task(|| thread::current().id()).wait();
            let owner = remote.clone();
            remote
                .add_task(move || {
                    owner.release();
                })
                .unwrap();
            value
        });

        run_loop.run().unwrap();
        let ran_on = producer.join().unwrap().unwrap();
        assert_eq!(ran_on, thread::current().id());
        assert!(queue.is_released());
    }

    #[test]
    fn test_refused_waitable_is_abandoned() {
        let (_run_loop, _clock, queue) = manual_queue();
        let remote = queue.clone();
        let result = thread::spawn(move || {
            let future = remote.add_waitable_task(|| 1);
            assert!(!future.is_scheduled());
            future.wait()
        })
        .join()
        .unwrap();
        assert!(matches!(result, Err(Error::Abandoned)));
    }

    #[test]
    fn test_cancelled_waitable_is_abandoned() {
        let (_run_loop, _clock, queue) = manual_queue();
        let future = queue.add_waitable_task(|| "never");
        let token = future.token().unwrap();
        assert!(future.try_get().is_none());

        queue.cancel_task(token);
        assert!(matches!(future.wait(), Err(Error::Abandoned)));
    }

    #[test]
    fn test_configured_timeout_bounds_wait() {
        let config = QueueConfig::default().with_waitable_timeout(Some(ms(20)));
        let (_run_loop, _clock, queue) = manual_queue_with(config);
        queue.acquire();

        let remote = queue.clone();
        let result = thread::spawn(move || remote.add_waitable_task(|| 7).wait())
            .join()
            .unwrap();
        assert!(matches!(result, Err(Error::Timeout(_))));
        assert_eq!(queue.len(), 1);
    }
}

mod cancel {
    use super::*;

    #[test]
    fn test_cross_thread_cancel_waits_for_running_task() {
        let (run_loop, queue) = realtime_queue();
        let started = Arc::new(AtomicBool::new(false));
        let finished = Arc::new(AtomicBool::new(false));
        let runs = Arc::new(AtomicUsize::new(0));

        let (s, f, r) = (Arc::clone(&started), Arc::clone(&finished), Arc::clone(&runs));
        let token = queue
            .add_task_with_delay(
                move || {
                    r.fetch_add(1, Ordering::SeqCst);
                    s.store(true, Ordering::SeqCst);
                    thread::sleep(Duration::from_millis(100));
                    f.store(true, Ordering::SeqCst);
                    TaskControl::Continue
                },
                Duration::from_millis(1),
            )
            .unwrap();

        let remote = queue.clone();
        let (s, f) = (Arc::clone(&started), Arc::clone(&finished));
        let canceller = thread::spawn(move || {
            while !s.load(Ordering::SeqCst) {
                thread::sleep(Duration::from_millis(1));
            }
            let begun = Instant::now();
            let cancelled = remote.cancel_task(token);
            (cancelled, f.load(Ordering::SeqCst), remote.is_executing(token), begun.elapsed())
        });

        run_loop.run().unwrap();
        let (cancelled, finished_first, still_running, blocked) = canceller.join().unwrap();
        assert!(cancelled);
        assert!(finished_first);
        assert!(!still_running);
        assert!(blocked >= Duration::from_millis(50));
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert!(queue.is_released());
    }

    #[test]
    fn test_cancel_wait_honours_timeout() {
        let config = QueueConfig::default().with_waitable_timeout(Some(ms(10)));
        let run_loop = runloop_bridge::event_loop::RunLoop::new();
        let queue = runloop_bridge::TaskQueue::bind(
            runloop_bridge::config::QueueEnv::new(run_loop.handle()),
            config,
        )
        .unwrap();
        let started = Arc::new(AtomicBool::new(false));

        let s = Arc::clone(&started);
        let token = queue
            .add_task(move || {
                s.store(true, Ordering::SeqCst);
                thread::sleep(Duration::from_millis(200));
            })
            .unwrap();

        let remote = queue.clone();
        let s = Arc::clone(&started);
        let canceller = thread::spawn(move || {
            while !s.load(Ordering::SeqCst) {
                thread::sleep(Duration::from_millis(1));
            }
            let begun = Instant::now();
            remote.cancel_task(token);
            (remote.is_executing(token), begun.elapsed())
        });

        run_loop.run().unwrap();
        let (still_running, waited) = canceller.join().unwrap();
        assert!(still_running);
        assert!(waited < Duration::from_millis(150));
    }
}
