//! The point-to-point transport collaborator: out of scope to implement for production (a real
//! build would sit on MPI or a vendor RDMA fabric), but specified as a trait and shipped with an
//! in-process loopback implementation that the integration tests run multi-"rank" scenarios
//! against.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::rank::Rank;

/// Reserved active-message tag for cross-process edge delivery (see `crate::delivery`). Sits
/// right below the termination detector's own reserved tag so neither collides with a
/// user-chosen tag.
pub const DATA_TAG: u64 = u64::MAX - 2;

/// An opaque, transport-minted token standing in for a memory region registered via
/// [`Transport::mem_register`] for split-metadata delivery. The loopback transport's tokens
/// are just indices into its own region table; a real RDMA transport would mint NIC-specific
/// handles instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RegionHandle {
    /// Opaque tag identifying the region within the transport that minted it.
    pub tag: u64,
    /// Size of the registered region, in bytes.
    pub size: u32,
}

/// A registered active-message handler: invoked with the sender's rank and the message payload.
pub type AmHandler = Box<dyn Fn(Rank, &[u8]) + Send + Sync>;

/// Invoked once a [`Transport::get`] completes, with the bytes it fetched.
pub type GetCompletion = Box<dyn FnOnce(Vec<u8>) + Send>;

/// The point-to-point and one-sided transport collaborator.
pub trait Transport: Send + Sync {
    /// Registers the handler invoked for every active message sent to `tag`.
    fn register_tag(&self, tag: u64, handler: AmHandler, max_size: usize);

    /// Sends an eager active message to `dest`.
    fn send_am(&self, tag: u64, dest: Rank, bytes: &[u8]);

    /// Registers `buf` for one-sided `get`, returning the handle remote peers address it by.
    fn mem_register(&self, buf: &[u8]) -> RegionHandle;

    /// Releases a region registered via [`Self::mem_register`].
    fn mem_unregister(&self, handle: RegionHandle);

    /// Issues a non-blocking one-sided get of `size` bytes from `remote` (registered on `dest`)
    /// into `local`; `completion` runs once the transport has the bytes.
    fn get(&self, local: RegionHandle, remote: RegionHandle, size: usize, dest: Rank, completion: GetCompletion);
}

/// An in-process transport simulating a multi-rank world within a single process: `send_am`
/// invokes the destination rank's handler synchronously on the caller's thread, and `get` reads
/// directly out of the destination's region table. Used by tests and the loopback integration
/// scenarios in place of a real MPI/RDMA fabric.
pub struct LoopbackTransport {
    self_rank: Rank,
    peers: Mutex<HashMap<Rank, Arc<LoopbackTransport>>>,
    handlers: Mutex<HashMap<u64, AmHandler>>,
    regions: Mutex<HashMap<u64, Vec<u8>>>,
    next_tag: Mutex<u64>,
}

impl LoopbackTransport {
    /// Creates a transport for `self_rank` with no peers registered yet; wire up a world of ranks
    /// via [`Self::connect`] before sending anything.
    pub fn new(self_rank: Rank) -> Arc<Self> {
        Arc::new(Self {
            self_rank,
            peers: Mutex::new(HashMap::new()),
            handlers: Mutex::new(HashMap::new()),
            regions: Mutex::new(HashMap::new()),
            next_tag: Mutex::new(0),
        })
    }

    /// Bidirectionally registers `self` and `other` as peers of one another.
    pub fn connect(self: &Arc<Self>, other: &Arc<Self>) {
        self.peers.lock().insert(other.self_rank, Arc::clone(other));
        other.peers.lock().insert(self.self_rank, Arc::clone(self));
    }

    /// This transport's own rank.
    pub fn rank(&self) -> Rank {
        self.self_rank
    }
}

impl Transport for LoopbackTransport {
    fn register_tag(&self, tag: u64, handler: AmHandler, _max_size: usize) {
        self.handlers.lock().insert(tag, handler);
    }

    fn send_am(&self, tag: u64, dest: Rank, bytes: &[u8]) {
        let peer = if dest == self.self_rank {
            None
        } else {
            self.peers.lock().get(&dest).cloned()
        };
        match peer {
            Some(peer) => {
                let handlers = peer.handlers.lock();
                if let Some(handler) = handlers.get(&tag) {
                    handler(self.self_rank, bytes);
                } else {
                    tracing::warn!(tag, dest = %dest, "active message dropped: no handler registered");
                }
            }
            None => {
                let handlers = self.handlers.lock();
                if let Some(handler) = handlers.get(&tag) {
                    handler(self.self_rank, bytes);
                } else {
                    tracing::warn!(tag, dest = %dest, "active message dropped: no handler registered");
                }
            }
        }
    }

    fn mem_register(&self, buf: &[u8]) -> RegionHandle {
        let mut next_tag = self.next_tag.lock();
        let tag = *next_tag;
        *next_tag += 1;
        self.regions.lock().insert(tag, buf.to_vec());
        RegionHandle {
            tag,
            size: buf.len() as u32,
        }
    }

    fn mem_unregister(&self, handle: RegionHandle) {
        self.regions.lock().remove(&handle.tag);
    }

    fn get(&self, _local: RegionHandle, remote: RegionHandle, size: usize, dest: Rank, completion: GetCompletion) {
        let source = if dest == self.self_rank {
            self.regions.lock().get(&remote.tag).cloned()
        } else {
            self.peers
                .lock()
                .get(&dest)
                .and_then(|peer| peer.regions.lock().get(&remote.tag).cloned())
        };
        let mut bytes = source.unwrap_or_else(|| panic!("get() against an unregistered region {remote:?} on {dest}"));
        bytes.truncate(size);
        completion(bytes);
    }
}
