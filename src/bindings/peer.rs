//! Scripting heap model
//!
//! A [`PeerHeap`] stands in for the scripting runtime's object heap. Every
//! mutation of handle counts is only legal on the heap's owning thread;
//! reads are allowed anywhere.

use crate::error::{Error, Result};
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use std::thread::{self, ThreadId};

/// Strong reference to a scripting object
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PeerId(u64);

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "peer#{}", self.0)
    }
}

/// Weak reference to a scripting object; must be deleted on the owning thread
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WeakPeer(PeerId);

impl WeakPeer {
    pub fn target(self) -> PeerId {
        self.0
    }
}

struct Slot {
    value: Value,
    strong: usize,
    weak: usize,
}

#[derive(Default)]
struct HeapInner {
    slots: FxHashMap<u64, Slot>,
    next_id: u64,
    weak_deleted: u64,
}

pub struct PeerHeap {
    owner: ThreadId,
    inner: Mutex<HeapInner>,
}

impl PeerHeap {
    /// Create a heap owned by the calling thread
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            owner: thread::current().id(),
            inner: Mutex::new(HeapInner::default()),
        })
    }

    pub fn owner(&self) -> ThreadId {
        self.owner
    }

    pub fn is_owner_thread(&self) -> bool {
        thread::current().id() == self.owner
    }

    fn check_owner(&self, operation: &str) -> Result<()> {
        if self.is_owner_thread() {
            Ok(())
        } else {
            Err(Error::heap(format!("{} called off the heap's owning thread", operation)))
        }
    }

    /// Allocate an object and return a strong handle to it
    pub fn alloc(&self, value: Value) -> Result<PeerId> {
        self.check_owner("alloc")?;
        let mut inner = self.inner.lock();
        inner.next_id += 1;
        let id = inner.next_id;
        inner.slots.insert(
            id,
            Slot {
                value,
                strong: 1,
                weak: 0,
            },
        );
        Ok(PeerId(id))
    }

    /// Create a weak handle to a live object
    pub fn downgrade(&self, peer: PeerId) -> Result<WeakPeer> {
        self.check_owner("downgrade")?;
        let mut inner = self.inner.lock();
        match inner.slots.get_mut(&peer.0) {
            Some(slot) if slot.strong > 0 => {
                slot.weak += 1;
                Ok(WeakPeer(peer))
            }
            _ => Err(Error::heap(format!("downgrade of dead {}", peer))),
        }
    }

    /// Drop a strong handle
    pub fn release_strong(&self, peer: PeerId) -> Result<()> {
        self.check_owner("release_strong")?;
        let mut inner = self.inner.lock();
        match inner.slots.get_mut(&peer.0) {
            Some(slot) if slot.strong > 0 => {
                slot.strong -= 1;
                Ok(())
            }
            _ => Err(Error::heap(format!("over-release of {}", peer))),
        }
    }

    /// Strong handle to the object if it is still alive
    pub fn upgrade(&self, weak: &WeakPeer) -> Result<Option<PeerId>> {
        self.check_owner("upgrade")?;
        let mut inner = self.inner.lock();
        Ok(match inner.slots.get_mut(&weak.0 .0) {
            Some(slot) if slot.strong > 0 && slot.weak > 0 => {
                slot.strong += 1;
                Some(weak.0)
            }
            _ => None,
        })
    }

    /// Delete a weak handle
    pub fn delete_weak(&self, weak: &WeakPeer) -> Result<()> {
        self.check_owner("delete_weak")?;
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        match inner.slots.get_mut(&weak.0 .0) {
            Some(slot) if slot.weak > 0 => {
                slot.weak -= 1;
                inner.weak_deleted += 1;
                Ok(())
            }
            _ => Err(Error::heap(format!("double delete of weak {}", weak.0))),
        }
    }

    /// Free every object with no strong and no weak handles; returns how many
    pub fn collect(&self) -> Result<usize> {
        self.check_owner("collect")?;
        let mut inner = self.inner.lock();
        let before = inner.slots.len();
        inner.slots.retain(|_, slot| slot.strong > 0 || slot.weak > 0);
        Ok(before - inner.slots.len())
    }

    pub fn is_alive(&self, peer: PeerId) -> bool {
        self.inner
            .lock()
            .slots
            .get(&peer.0)
            .is_some_and(|slot| slot.strong > 0)
    }

    pub fn weak_count(&self, peer: PeerId) -> usize {
        self.inner.lock().slots.get(&peer.0).map_or(0, |slot| slot.weak)
    }

    pub fn value(&self, peer: PeerId) -> Option<Value> {
        self.inner.lock().slots.get(&peer.0).map(|slot| slot.value.clone())
    }

    /// Weak handles deleted over the heap's lifetime
    pub fn weak_deleted(&self) -> u64 {
        self.inner.lock().weak_deleted
    }

    pub fn len(&self) -> usize {
        self.inner.lock().slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl fmt::Debug for PeerHeap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PeerHeap")
            .field("owner", &self.owner)
            .field("objects", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_counts() {
        let heap = PeerHeap::new();
        let peer = heap.alloc(json!({"name": "player"})).unwrap();
        let weak = heap.downgrade(peer).unwrap();
        assert_eq!(heap.weak_count(peer), 1);

        heap.release_strong(peer).unwrap();
        assert!(!heap.is_alive(peer));
        assert_eq!(heap.upgrade(&weak).unwrap(), None);
        assert_eq!(heap.collect().unwrap(), 0);

        heap.delete_weak(&weak).unwrap();
        assert!(heap.delete_weak(&weak).is_err());
        assert_eq!(heap.collect().unwrap(), 1);
        assert!(heap.is_empty());
    }

    #[test]
    fn test_mutation_off_thread_rejected() {
        let heap = PeerHeap::new();
        let peer = heap.alloc(json!(1)).unwrap();
        let weak = heap.downgrade(peer).unwrap();

        let remote = Arc::clone(&heap);
        let result = std::thread::spawn(move || remote.delete_weak(&weak)).join().unwrap();
        assert!(matches!(result, Err(Error::HeapAccess(_))));
        assert_eq!(heap.weak_count(peer), 1);
    }
}
