//! The delayed-unpack queue: active messages that arrive addressed to an operator this process
//! hasn't registered yet are held here until registration catches up, matching the original's
//! `std::mutex` + `std::multimap<uint64_t, ...>`.

use std::collections::HashMap;

use parking_lot::Mutex;

use crate::error::DeliveryError;
use crate::ids::OpId;

use super::frame::Frame;

/// One frame held back because its destination operator wasn't registered yet when it arrived.
#[derive(Debug, Clone)]
pub struct DelayedFrame {
    /// The frame as received off the wire.
    pub frame: Frame,
}

/// Process-wide queue of frames awaiting a not-yet-registered operator.
///
/// `max_per_op` bounds how many frames may queue up for a single unresolved `OpId` before
/// [`DelayedUnpackQueue::hold`] starts rejecting with [`DeliveryError::DelayedUnpackOverflow`] —
/// an unbounded queue here would let a misconfigured or slow-to-register peer exhaust memory.
pub struct DelayedUnpackQueue {
    pending: Mutex<HashMap<OpId, Vec<DelayedFrame>>>,
    max_per_op: usize,
}

impl DelayedUnpackQueue {
    /// Creates an empty queue, holding at most `max_per_op` frames per unresolved operator id.
    pub fn new(max_per_op: usize) -> Self {
        Self {
            pending: Mutex::new(HashMap::new()),
            max_per_op,
        }
    }

    /// Holds `frame`, addressed to an operator not yet registered.
    pub fn hold(&self, op_id: OpId, frame: Frame) -> Result<(), DeliveryError> {
        let mut pending = self.pending.lock();
        let queue = pending.entry(op_id).or_default();
        if queue.len() >= self.max_per_op {
            return Err(DeliveryError::DelayedUnpackOverflow { op_id: op_id.0 });
        }
        queue.push(DelayedFrame { frame });
        Ok(())
    }

    /// Drains and returns every frame held for `op_id`, in arrival order, once that operator has
    /// just finished registering (called once from `make_executable`'s static-unpack-callback
    /// registration step).
    pub fn drain(&self, op_id: OpId) -> Vec<DelayedFrame> {
        self.pending.lock().remove(&op_id).unwrap_or_default()
    }

    /// Number of frames currently held for `op_id`.
    pub fn pending_count(&self, op_id: OpId) -> usize {
        self.pending.lock().get(&op_id).map_or(0, Vec::len)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::delivery::frame::FrameHeader;
    use crate::ids::TaskpoolId;

    fn frame() -> Frame {
        Frame {
            header: FrameHeader {
                taskpool_id: TaskpoolId(0),
                op_id: OpId(7),
                param_id: 0,
                num_keys: 0,
            },
            keys: Vec::new(),
            payload: Vec::new(),
        }
    }

    #[test]
    fn held_frames_drain_in_arrival_order() {
        let queue = DelayedUnpackQueue::new(8);
        queue.hold(OpId(7), frame()).unwrap();
        queue.hold(OpId(7), frame()).unwrap();
        assert_eq!(queue.pending_count(OpId(7)), 2);

        let drained = queue.drain(OpId(7));
        assert_eq!(drained.len(), 2);
        assert_eq!(queue.pending_count(OpId(7)), 0);
    }

    #[test]
    fn overflow_is_rejected() {
        let queue = DelayedUnpackQueue::new(1);
        queue.hold(OpId(1), frame()).unwrap();
        let err = queue.hold(OpId(1), frame()).unwrap_err();
        assert!(matches!(err, DeliveryError::DelayedUnpackOverflow { op_id: 1 }));
    }
}
