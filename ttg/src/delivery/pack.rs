//! Packing and unpacking the key list and payload of a [`Frame`].

use crate::error::DeliveryError;
use crate::key::Key;
use crate::transport::{RegionHandle, Transport};
use crate::value::{Serializable, SplitMetadata};

use super::frame::{Frame, FrameHeader, NO_INPUT_TRIGGER};

/// Packs `keys` and `value`'s monolithic encoding into a [`Frame`], rejecting it if the packed
/// size would exceed `max_size` (the transport's configured maximum active-message size).
pub fn pack_value_frame<K: Key, V: Serializable>(
    taskpool_id: crate::ids::TaskpoolId,
    op_id: crate::ids::OpId,
    param_id: u64,
    keys: &[K],
    value: &V,
    max_size: usize,
) -> Result<Frame, DeliveryError> {
    let keys_bytes = bincode::serialize(keys).map_err(|e| DeliveryError::Decode(e.to_string()))?;
    let mut payload = Vec::with_capacity(value.payload_size());
    value.pack_payload(&mut payload);
    let header = FrameHeader {
        taskpool_id,
        op_id,
        param_id,
        num_keys: keys.len() as i32,
    };
    let frame = Frame {
        header,
        keys: keys_bytes,
        payload,
    };
    let size = frame.wire_size();
    if size > max_size {
        return Err(DeliveryError::Capacity { size, max: max_size });
    }
    Ok(frame)
}

/// Packs a frame carrying no argument, just triggering a zero-arity task for `keys`.
pub fn pack_trigger_frame<K: Key>(
    taskpool_id: crate::ids::TaskpoolId,
    op_id: crate::ids::OpId,
    keys: &[K],
    max_size: usize,
) -> Result<Frame, DeliveryError> {
    let keys_bytes = bincode::serialize(keys).map_err(|e| DeliveryError::Decode(e.to_string()))?;
    let header = FrameHeader {
        taskpool_id,
        op_id,
        param_id: NO_INPUT_TRIGGER,
        num_keys: keys.len() as i32,
    };
    let frame = Frame {
        header,
        keys: keys_bytes,
        payload: Vec::new(),
    };
    let size = frame.wire_size();
    if size > max_size {
        return Err(DeliveryError::Capacity { size, max: max_size });
    }
    Ok(frame)
}

/// Recovers the packed key list from a frame's `keys` bytes.
pub fn unpack_keys<K: Key>(frame: &Frame) -> Result<Vec<K>, DeliveryError> {
    let keys: Vec<K> = bincode::deserialize(&frame.keys).map_err(|e| DeliveryError::Decode(e.to_string()))?;
    if keys.len() != frame.header.num_keys as usize {
        return Err(DeliveryError::Decode(format!(
            "frame header declared {} keys but {} were packed",
            frame.header.num_keys,
            keys.len()
        )));
    }
    Ok(keys)
}

/// Recovers `value`'s monolithic encoding from a frame's payload.
pub fn unpack_value<V: Serializable>(frame: &Frame) -> V {
    V::unpack_payload(&frame.payload)
}

/// Packs `value`'s split-metadata header into a frame, registering each of its data regions with
/// `transport` so the receiver can pull them over with a one-sided [`Transport::get`] rather than
/// having them inlined in the active message. Returns the frame alongside the handles registered
/// for it, which the caller must eventually release with [`Transport::mem_unregister`] once the
/// remote `get`s have completed.
pub fn pack_split_frame<K: Key, V: SplitMetadata>(
    taskpool_id: crate::ids::TaskpoolId,
    op_id: crate::ids::OpId,
    param_id: u64,
    keys: &[K],
    value: &V,
    transport: &dyn Transport,
    max_size: usize,
) -> Result<(Frame, Vec<RegionHandle>), DeliveryError> {
    let keys_bytes = bincode::serialize(keys).map_err(|e| DeliveryError::Decode(e.to_string()))?;
    let metadata = value.get_metadata();
    let handles: Vec<RegionHandle> = value
        .data_regions()
        .into_iter()
        .map(|region| {
            // SAFETY: `value` is borrowed for the duration of this call, so the region it
            // describes stays valid while `mem_register` copies it into the transport's table.
            let bytes = unsafe { std::slice::from_raw_parts(region.addr as *const u8, region.len) };
            transport.mem_register(bytes)
        })
        .collect();
    let mut payload = Vec::new();
    bincode::serialize_into(&mut payload, &(&metadata, &handles)).map_err(|e| DeliveryError::Decode(e.to_string()))?;
    let header = FrameHeader {
        taskpool_id,
        op_id,
        param_id,
        num_keys: keys.len() as i32,
    };
    let frame = Frame {
        header,
        keys: keys_bytes,
        payload,
    };
    let size = frame.wire_size();
    if size > max_size {
        for handle in &handles {
            transport.mem_unregister(*handle);
        }
        return Err(DeliveryError::Capacity { size, max: max_size });
    }
    Ok((frame, handles))
}

/// Recovers a value's split-metadata header and the region handles it still needs to `get`, from
/// a frame packed by [`pack_split_frame`]. The returned value is the "initially empty" shell
/// `SplitMetadata::create_from_metadata` produces; the caller is responsible for issuing the
/// `get`s against the returned handles to fill it in.
pub fn unpack_split_frame<V: SplitMetadata>(frame: &Frame) -> (V, Vec<RegionHandle>) {
    let (metadata, handles): (V::Metadata, Vec<RegionHandle>) =
        bincode::deserialize(&frame.payload).expect("malformed split-metadata payload");
    (V::create_from_metadata(metadata), handles)
}
