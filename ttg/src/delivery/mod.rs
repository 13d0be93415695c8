//! Cross-process delivery: active-message framing and the delayed-unpack queue for frames that
//! race a not-yet-registered operator.

pub mod frame;
pub mod pack;
pub mod router;
pub mod unpack;

pub use frame::{Frame, FrameHeader, NO_INPUT_TRIGGER};
pub use pack::{pack_split_frame, pack_trigger_frame, pack_value_frame, unpack_keys, unpack_split_frame, unpack_value};
pub use router::{DeliveryRouter, RouteHandler};
pub use unpack::{DelayedFrame, DelayedUnpackQueue};
