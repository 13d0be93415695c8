//! Process-wide routing of incoming frames to the operator input port that should receive them.
//!
//! One [`DeliveryRouter`] lives on each [`crate::world::World`], fed by a single active message
//! tag (`crate::transport::DATA_TAG`) registered once at world construction. Per-port handlers are
//! installed as each input is wired up via `World::connect_input`, keyed by `(OpId, param_id)` —
//! the pair [`crate::ids::OpId::from_name`] and the declared input index give every rank without
//! needing any cross-rank coordination. A frame addressed to a port that hasn't registered a
//! handler yet is held in the [`DelayedUnpackQueue`] and replayed the moment that port does.

use std::sync::Arc;

use parking_lot::Mutex;
use rustc_hash::FxHashMap;

use crate::error::DeliveryError;
use crate::ids::{OpId, TaskpoolId};

use super::frame::Frame;
use super::unpack::DelayedUnpackQueue;

/// A per-port handler: decodes a frame's keys and payload and performs local delivery.
pub type RouteHandler = Arc<dyn Fn(&Frame) -> Result<(), DeliveryError> + Send + Sync>;

/// Routes frames (received locally, or handed in by the transport's `DATA_TAG` handler) to the
/// registered handler for their `(op_id, param_id)`, holding ones with no registered destination
/// yet.
pub struct DeliveryRouter {
    handlers: Mutex<FxHashMap<(OpId, u64), RouteHandler>>,
    queue: DelayedUnpackQueue,
    taskpools: Mutex<FxHashMap<OpId, TaskpoolId>>,
}

impl DeliveryRouter {
    /// Creates an empty router, holding at most `max_delayed_unpack_per_op` frames per
    /// not-yet-registered operator.
    pub fn new(max_delayed_unpack_per_op: usize) -> Self {
        Self {
            handlers: Mutex::new(FxHashMap::default()),
            queue: DelayedUnpackQueue::new(max_delayed_unpack_per_op),
            taskpools: Mutex::new(FxHashMap::default()),
        }
    }

    /// Records `op_id`'s locally-assigned `TaskpoolId`, so an incoming frame addressed to it can
    /// be bracketed with this rank's `incoming_message_start`/`incoming_message_end` termination
    /// hooks.
    pub fn register_taskpool(&self, op_id: OpId, tp: TaskpoolId) {
        self.taskpools.lock().insert(op_id, tp);
    }

    /// The locally-assigned `TaskpoolId` for `op_id`, if it has been registered yet.
    pub fn taskpool_of(&self, op_id: OpId) -> Option<TaskpoolId> {
        self.taskpools.lock().get(&op_id).copied()
    }

    /// Registers `handler` for `(op_id, param_id)`, then replays and drains any frames that arrived
    /// for `op_id` before this port was wired up.
    pub fn register(&self, op_id: OpId, param_id: u64, handler: RouteHandler) {
        self.handlers.lock().insert((op_id, param_id), handler);
        for held in self.queue.drain(op_id) {
            if let Err(e) = self.dispatch(held.frame) {
                tracing::warn!(error = %e, "failed to replay delayed frame");
            }
        }
    }

    /// Dispatches one received frame: invokes the registered handler for its `(op_id, param_id)`,
    /// or holds it in the delayed-unpack queue if no such handler exists yet.
    pub fn dispatch(&self, frame: Frame) -> Result<(), DeliveryError> {
        let key = (frame.header.op_id, frame.header.param_id);
        let handler = self.handlers.lock().get(&key).cloned();
        match handler {
            Some(handler) => handler(&frame),
            None => self.queue.hold(frame.header.op_id, frame),
        }
    }

    /// Number of frames currently held for `op_id` across every unresolved port.
    pub fn pending_count(&self, op_id: OpId) -> usize {
        self.queue.pending_count(op_id)
    }
}
