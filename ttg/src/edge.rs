//! Typed edges and terminals.
//!
//! An [`Edge<K, V>`] binds the output port of one operator to the input ports of zero or more
//! consumers. Dispatch is late-bound through [`InputTerminal`], the callback set an operator
//! installs for one of its own input ports; an `Edge` itself is just a fan-out list of those.
//! `K = ()` or `V = ()` models a control-only edge, since both are blanket-`Value`/`Key`.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::datacopy::DataCopy;
use crate::delivery::pack_value_frame;
use crate::ids::{OpId, TaskpoolId};
use crate::key::Key;
use crate::rank::{KeyMap, Rank};
use crate::transport::{DATA_TAG, Transport};
use crate::value::Value;

/// Whether an input port reads its argument or mutates it in place.
///
/// Chosen per input port at operator-construction time; drives whether incoming values are
/// registered with [`DataCopy::register_reader`] or [`DataCopy::register_writer`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    /// Multiple tasks may observe the same copy concurrently.
    ReadOnly,
    /// Exactly one task may mutate the copy; fan-out to others forces a physical clone.
    Mutable,
}

/// The callback set an operator installs for one of its input ports. Implemented by the operator
/// layer, which knows the concrete port index, reducer,
/// priomap, and task table this terminal feeds.
pub trait InputTerminal<K: Key, V: Value>: Send + Sync {
    /// Whether this port is read-only or mutable; determines the `DataCopy` registration mode
    /// [`Edge::send`]/[`Edge::broadcast`] use when delivering to this terminal.
    fn access(&self) -> Access;

    /// Delivers one `(key, value)` pair, already wrapped in a `DataCopy`. The resolved copy to
    /// register against this specific input has already been produced by the caller via
    /// `register_reader`/`register_writer` according to [`Self::access`]; this just accumulates it
    /// into the owning operator's task table.
    fn accept(&self, key: K, copy: Arc<DataCopy>);

    /// Declares the expected value count for a streaming input (no-op if this port isn't
    /// streaming for `key`).
    fn set_argstream_size(&self, key: &K, n: u32);

    /// Closes a streaming input early for `key`.
    fn finalize_argstream(&self, key: &K);
}

/// The cross-process routing an edge needs to decide, per key, whether its destination terminal
/// lives on this rank or must be shipped over the wire: the key-map that resolves ownership, this
/// rank's own identity to compare against, and the `(op_id, param_id)` address of the consuming
/// input port on whichever rank ends up owning the key.
struct Distribution<K> {
    transport: Arc<dyn Transport>,
    keymap: Arc<dyn KeyMap<K>>,
    local_rank: Rank,
    dest_op_id: OpId,
    dest_param_id: u64,
    max_active_message_size: usize,
}

impl<K> Clone for Distribution<K> {
    fn clone(&self) -> Self {
        Self {
            transport: Arc::clone(&self.transport),
            keymap: Arc::clone(&self.keymap),
            local_rank: self.local_rank,
            dest_op_id: self.dest_op_id,
            dest_param_id: self.dest_param_id,
            max_active_message_size: self.max_active_message_size,
        }
    }
}

/// A typed channel linking one producer's output port to the input ports of its consumers.
///
/// Cloning an `Edge` shares the same bound-terminal list, so the producer and every consumer
/// registration can hold independent clones that all see the same fan-out set once topology is
/// frozen.
pub struct Edge<K: Key, V: Value> {
    bound: Arc<Mutex<Vec<Arc<dyn InputTerminal<K, V>>>>>,
    distribution: Arc<Mutex<Option<Distribution<K>>>>,
}

impl<K: Key, V: Value> Clone for Edge<K, V> {
    fn clone(&self) -> Self {
        Self {
            bound: Arc::clone(&self.bound),
            distribution: Arc::clone(&self.distribution),
        }
    }
}

impl<K: Key, V: Value> Default for Edge<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: Key, V: Value> Edge<K, V> {
    /// Creates an edge with no consumers bound yet.
    pub fn new() -> Self {
        Self {
            bound: Arc::new(Mutex::new(Vec::new())),
            distribution: Arc::new(Mutex::new(None)),
        }
    }

    /// Binds one more consumer input terminal to this edge's fan-out set.
    pub fn bind(&self, input: Arc<dyn InputTerminal<K, V>>) {
        self.bound.lock().push(input);
    }

    /// Number of consumer terminals currently bound, used by the unbound-terminal topology check.
    pub fn bound_count(&self) -> usize {
        self.bound.lock().len()
    }

    /// Declares the expected stream size for `key` on every bound consumer.
    pub fn set_argstream_size(&self, key: &K, n: u32) {
        for input in self.bound.lock().iter() {
            input.set_argstream_size(key, n);
        }
    }

    /// Closes the stream for `key` early on every bound consumer.
    pub fn finalize_argstream(&self, key: &K) {
        for input in self.bound.lock().iter() {
            input.finalize_argstream(key);
        }
    }

    /// Configures this edge to route keys not owned by `local_rank` (per `keymap`) to the input
    /// port `(dest_op_id, dest_param_id)` of whatever rank's own graph owns them, over `transport`,
    /// instead of delivering locally. Once configured, keys owned by `local_rank` still flow
    /// through the ordinary [`Self::bind`] terminals; this only changes what happens to keys that
    /// aren't.
    pub fn connect_remote(
        &self,
        transport: Arc<dyn Transport>,
        keymap: Arc<dyn KeyMap<K>>,
        local_rank: Rank,
        dest_op_id: OpId,
        dest_param_id: u64,
        max_active_message_size: usize,
    ) {
        *self.distribution.lock() = Some(Distribution {
            transport,
            keymap,
            local_rank,
            dest_op_id,
            dest_param_id,
            max_active_message_size,
        });
    }
}

// `register_reader`/`register_writer` always build a "clone if contended" closure up front, even
// on the uncontended path that never calls it, so the fan-out itself needs `V: Clone`: fan-out
// must always be able to fall back to a physical duplication. `Serialize + DeserializeOwned` is
// needed too: any edge may end up carrying a key to a remote rank, so every value that can flow
// along one has to be able to cross the wire.
impl<K: Key, V: Value + Clone + Serialize + DeserializeOwned> Edge<K, V> {
    /// Sends one `(key, value)` pair to every bound consumer.
    ///
    /// Wraps `value` in a fresh `DataCopy` held (conceptually) by this call; for each bound
    /// terminal, registers a reader or writer copy according to that terminal's [`Access`] and
    /// hands it off via [`InputTerminal::accept`]. Once every consumer has been offered a copy,
    /// releases this send's own hold, which is exactly what triggers a deferred writer if no
    /// later reader ever claimed the original.
    pub fn send(&self, key: K, value: V) {
        let copy = DataCopy::new(value);
        self.route(&[key], &copy);
        copy.release();
    }

    /// Sends the same value to every key in `keys`. When this edge is cross-process
    /// ([`Self::connect_remote`]), `keys` is first partitioned by destination rank so each
    /// non-local rank receives its whole share in a single frame, rather than one frame per key.
    pub fn broadcast(&self, keys: &[K], value: V) {
        let copy = DataCopy::new(value);
        self.route(keys, &copy);
        copy.release();
    }

    fn route(&self, keys: &[K], copy: &Arc<DataCopy>) {
        let Some(dist) = self.distribution.lock().clone() else {
            for key in keys {
                self.fan_out_local(key, copy);
            }
            return;
        };

        let mut remote: HashMap<Rank, Vec<K>> = HashMap::new();
        for key in keys {
            let dest = dist.keymap.rank_of(key);
            if dest == dist.local_rank {
                self.fan_out_local(key, copy);
            } else {
                remote.entry(dest).or_default().push(key.clone());
            }
        }

        for (dest, dest_keys) in remote {
            let value = copy.with_ref::<V, _>(Clone::clone);
            match pack_value_frame(
                TaskpoolId(dist.dest_op_id.0 as u32),
                dist.dest_op_id,
                dist.dest_param_id,
                &dest_keys,
                &value,
                dist.max_active_message_size,
            ) {
                Ok(frame) => dist.transport.send_am(DATA_TAG, dest, &frame.encode()),
                Err(e) => tracing::warn!(error = %e, dest = %dest, "failed to pack outgoing frame"),
            }
        }
    }

    fn fan_out_local(&self, key: &K, copy: &Arc<DataCopy>) {
        let consumers = self.bound.lock().clone();
        for input in consumers {
            let resolved = match input.access() {
                Access::ReadOnly => copy.register_reader(|c| c.cloned_from::<V>()),
                Access::Mutable => match copy.register_writer(
                    |c| c.cloned_from::<V>(),
                    {
                        let input = Arc::clone(&input);
                        let key = key.clone();
                        move |resolved| input.accept(key, resolved)
                    },
                ) {
                    crate::datacopy::Writer::Cloned(fresh) => fresh,
                    crate::datacopy::Writer::Deferred => continue,
                },
            };
            input.accept(key.clone(), resolved);
        }
    }
}
