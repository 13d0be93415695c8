//! The active-message wire frame: a fixed header plus a serialized key list and payload bytes.

use serde::{Deserialize, Serialize};

use crate::error::DeliveryError;
use crate::ids::{OpId, TaskpoolId};

/// `param_id` value meaning "no-input trigger": the message carries no argument, it just fires an
/// operator's zero-arity task for the enclosed keys (matching the original's use of `-1`, widened
/// to the type's max since `param_id` here is unsigned).
pub const NO_INPUT_TRIGGER: u64 = u64::MAX;

/// Fixed-size header carried at the front of every active message (matching the original's
/// `msg_header_t`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrameHeader {
    /// Destination taskpool (operator registration) on the receiving rank.
    pub taskpool_id: TaskpoolId,
    /// Destination operator id, stable across ranks.
    pub op_id: OpId,
    /// Destination input port, or [`NO_INPUT_TRIGGER`] for a no-input trigger.
    pub param_id: u64,
    /// Number of keys packed after the header.
    pub num_keys: i32,
}

impl FrameHeader {
    /// Whether this frame triggers a zero-arity task rather than delivering an argument.
    pub fn is_no_input_trigger(&self) -> bool {
        self.param_id == NO_INPUT_TRIGGER
    }
}

/// One fully-assembled active message: header, the packed keys it addresses, and the payload
/// bytes (either the monolithic `Serializable` encoding or a split-metadata header — the receiver
/// distinguishes the two the same way the sender chose them, out of band, via the operator's
/// registered input kind).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Frame {
    /// The frame's header.
    pub header: FrameHeader,
    /// Bincode-encoded keys, one per key in `header.num_keys`, concatenated.
    pub keys: Vec<u8>,
    /// The payload: either a monolithic `Serializable` blob or a `SplitMetadata::Metadata` blob.
    pub payload: Vec<u8>,
}

impl Frame {
    /// Total size of this frame once packed onto the wire (header + keys + payload), used against
    /// the transport's configured maximum active-message size.
    pub fn wire_size(&self) -> usize {
        bincode::serialized_size(&self.header).expect("FrameHeader encoding is infallible") as usize
            + self.keys.len()
            + self.payload.len()
    }

    /// Encodes this frame as the bytes handed to `Transport::send_am`.
    pub fn encode(&self) -> Vec<u8> {
        bincode::serialize(self).expect("Frame encoding is infallible")
    }

    /// Decodes a frame received off the wire from `Transport::register_tag`'s handler.
    pub fn decode(bytes: &[u8]) -> Result<Frame, DeliveryError> {
        bincode::deserialize(bytes).map_err(|e| DeliveryError::Decode(e.to_string()))
    }
}
