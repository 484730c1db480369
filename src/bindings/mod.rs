//! Native objects bound to scripting peers
//!
//! An [`ObjectWrapper`] ties a native value to one scripting-side object
//! through a weak handle, so the scripting collector stays free to reclaim
//! the peer. Clones share the binding (`Ref`); dropping the last clone
//! (`Unref`) deletes the weak handle. The heap only allows that on its
//! owning thread, so a release from any other thread is deferred as a task
//! on the queue registered for the scripting run loop.

mod peer;

pub use peer::{PeerHeap, PeerId, WeakPeer};

use crate::error::Result;
use crate::registry::{QueueKey, RunloopRegistry};
use std::fmt;
use std::ops::Deref;
use std::sync::Arc;

/// Shared state behind every clone of an [`ObjectWrapper`]
pub struct WrapperState<T> {
    native: T,
    peer: WeakPeer,
    heap: Arc<PeerHeap>,
    registry: Arc<RunloopRegistry>,
    key: QueueKey,
}

impl<T> WrapperState<T> {
    pub fn native(&self) -> &T {
        &self.native
    }

    pub fn peer(&self) -> WeakPeer {
        self.peer
    }

    /// Whether the scripting peer has not been collected yet
    pub fn peer_alive(&self) -> bool {
        self.heap.is_alive(self.peer.target())
    }
}

impl<T> Drop for WrapperState<T> {
    fn drop(&mut self) {
        let peer = self.peer;
        let queue = match self.registry.get(&self.key) {
            Ok(queue) => queue,
            Err(e) => {
                tracing::error!(
                    peer = %peer.target(),
                    error = %e,
                    "object wrapper outlived its owning queue; weak handle leaked"
                );
                return;
            }
        };

        if queue.is_owner() {
            if let Err(e) = self.heap.delete_weak(&peer) {
                tracing::error!(peer = %peer.target(), error = %e, "failed to delete weak handle");
            }
            return;
        }

        let heap = Arc::clone(&self.heap);
        let deferred = queue.add_task(move || {
            if let Err(e) = heap.delete_weak(&peer) {
                tracing::error!(peer = %peer.target(), error = %e, "deferred weak delete failed");
            }
        });
        match deferred {
            Ok(token) => {
                tracing::trace!(peer = %peer.target(), %token, "weak delete deferred to owning thread");
            }
            Err(e) => {
                tracing::error!(
                    key = %self.key,
                    peer = %peer.target(),
                    error = %e,
                    "owning queue refused weak delete; weak handle leaked"
                );
            }
        }
    }
}

impl<T: fmt::Debug> fmt::Debug for WrapperState<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WrapperState")
            .field("native", &self.native)
            .field("peer", &self.peer)
            .field("key", &self.key)
            .finish()
    }
}

/// Reference-counted binding of a native `T` to a scripting peer
pub struct ObjectWrapper<T> {
    state: Arc<WrapperState<T>>,
}

impl<T: Send + Sync + 'static> ObjectWrapper<T> {
    /// Bind `native` to the object behind the strong handle `peer`.
    ///
    /// The strong handle is consumed and replaced by a weak one. Must run on
    /// the heap's owning thread.
    pub fn new(
        native: T,
        peer: PeerId,
        heap: Arc<PeerHeap>,
        registry: Arc<RunloopRegistry>,
        key: QueueKey,
    ) -> Result<Self> {
        let weak = heap.downgrade(peer)?;
        heap.release_strong(peer)?;
        Ok(Self {
            state: Arc::new(WrapperState {
                native,
                peer: weak,
                heap,
                registry,
                key,
            }),
        })
    }

    /// Number of live clones sharing this binding
    pub fn ref_count(&self) -> usize {
        Arc::strong_count(&self.state)
    }

    pub fn state(&self) -> &WrapperState<T> {
        &self.state
    }

    pub fn peer_alive(&self) -> bool {
        self.state.peer_alive()
    }
}

impl<T> Clone for ObjectWrapper<T> {
    fn clone(&self) -> Self {
        Self {
            state: Arc::clone(&self.state),
        }
    }
}

impl<T> Deref for ObjectWrapper<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.state.native
    }
}

impl<T: fmt::Debug> fmt::Debug for ObjectWrapper<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObjectWrapper")
            .field("state", &self.state)
            .field("refs", &Arc::strong_count(&self.state))
            .finish()
    }
}
