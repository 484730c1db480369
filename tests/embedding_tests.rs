//! Registry lookup and wrapper teardown across threads

use runloop_bridge::bindings::{ObjectWrapper, PeerHeap};
use runloop_bridge::config::{QueueConfig, QueueEnv};
use runloop_bridge::event_loop::RunLoop;
use runloop_bridge::registry::{QueueKey, RunloopRegistry};
use serde_json::json;
use std::sync::Arc;
use std::thread;

struct Engine {
    run_loop: RunLoop,
    registry: Arc<RunloopRegistry>,
    heap: Arc<PeerHeap>,
}

impl Engine {
    fn start() -> Self {
        let run_loop = RunLoop::new();
        let registry = Arc::new(RunloopRegistry::new());
        registry
            .get_or_create(QueueKey::SCRIPT_RUNTIME, QueueEnv::new(run_loop.handle()), QueueConfig::default())
            .unwrap();
        Self {
            run_loop,
            registry,
            heap: PeerHeap::new(),
        }
    }

    fn wrap(&self, name: &str) -> ObjectWrapper<String> {
        let peer = self.heap.alloc(json!({ "name": name })).unwrap();
        ObjectWrapper::new(
            name.to_string(),
            peer,
            Arc::clone(&self.heap),
            Arc::clone(&self.registry),
            QueueKey::SCRIPT_RUNTIME,
        )
        .unwrap()
    }
}

mod wrappers {
    use super::*;

    #[test]
    fn test_clones_dropped_on_many_threads_delete_once() {
        let engine = Engine::start();
        let queue = engine.registry.lookup(&QueueKey::SCRIPT_RUNTIME).unwrap();
        queue.acquire();

        let wrapper = engine.wrap("scene");
        let target = wrapper.state().peer().target();
        let clones: Vec<_> = (0..8).map(|_| wrapper.clone()).collect();
        drop(wrapper);

        let threads: Vec<_> = clones
            .into_iter()
            .map(|clone| thread::spawn(move || assert_eq!(clone.as_str(), "scene")))
            .collect();
        for t in threads {
            t.join().unwrap();
        }

        queue.release();
        engine.run_loop.run().unwrap();
        assert_eq!(engine.heap.weak_count(target), 0);
        assert_eq!(engine.heap.weak_deleted(), 1);
        assert_eq!(engine.heap.collect().unwrap(), 1);
    }

    #[test]
    fn test_many_wrappers_released_from_worker() {
        let engine = Engine::start();
        let queue = engine.registry.lookup(&QueueKey::SCRIPT_RUNTIME).unwrap();
        queue.acquire();

        let wrappers: Vec<_> = (0..16).map(|i| engine.wrap(&format!("node-{}", i))).collect();
        thread::spawn(move || drop(wrappers)).join().unwrap();
        assert_eq!(queue.len(), 16);

        queue.release();
        engine.run_loop.run().unwrap();
        assert_eq!(engine.heap.weak_deleted(), 16);
        assert!(engine.registry.deinit(&QueueKey::SCRIPT_RUNTIME));
    }

    #[test]
    fn test_drop_while_released_is_refused_and_leaks() {
        let engine = Engine::start();
        let wrapper = engine.wrap("orphan");
        let target = wrapper.state().peer().target();

        // Nobody holds the queue, so the bridge refuses the deferred delete.
        thread::spawn(move || drop(wrapper)).join().unwrap();
        assert_eq!(engine.heap.weak_count(target), 1);
        assert_eq!(engine.registry.lookup(&QueueKey::SCRIPT_RUNTIME).unwrap().len(), 0);
    }
}

mod registry {
    use super::*;

    #[test]
    fn test_deinit_after_drain() {
        let engine = Engine::start();
        let queue = engine.registry.lookup(&QueueKey::SCRIPT_RUNTIME).unwrap();
        queue.add_task(|| {}).unwrap();
        assert!(!engine.registry.deinit(&QueueKey::SCRIPT_RUNTIME));

        engine.run_loop.run().unwrap();
        assert!(engine.registry.deinit(&QueueKey::SCRIPT_RUNTIME));
        assert!(engine.registry.lookup(&QueueKey::SCRIPT_RUNTIME).is_none());
        assert!(queue.add_task(|| {}).is_err());
    }

    #[test]
    fn test_independent_keys() {
        let run_loop = RunLoop::new();
        let registry = RunloopRegistry::new();
        let env = QueueEnv::new(run_loop.handle());
        let script = registry
            .get_or_create(QueueKey::SCRIPT_RUNTIME, env.clone(), QueueConfig::default())
            .unwrap();
        let tools = registry
            .get_or_create(QueueKey::new("tools"), env, QueueConfig::default())
            .unwrap();
        assert!(!script.same_queue(&tools));
        assert_eq!(registry.len(), 2);

        assert!(registry.deinit(&QueueKey::new("tools")));
        assert_eq!(registry.len(), 1);
    }
}
