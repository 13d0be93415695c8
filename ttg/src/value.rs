//! The [`Value`] bound and the two serialization modes payloads can flow over the wire with.

use serde::Serialize;
use serde::de::DeserializeOwned;

/// A user-defined payload type that may flow along an [`Edge`](crate::edge::Edge).
pub trait Value: Send + Sync + 'static {}
impl<T> Value for T where T: Send + Sync + 'static {}

/// Monolithic (de)serialization: one opaque byte blob, consumed by the send path when a value
/// has no [`SplitMetadata`] implementation.
///
/// Blanket-implemented over `serde::Serialize + DeserializeOwned` via `bincode`, the same crate
/// this workspace already depends on for its own wire encoding.
pub trait Serializable: Sized {
    /// Size in bytes of this value's packed representation.
    fn payload_size(&self) -> usize;
    /// Appends this value's packed representation to `buf`.
    fn pack_payload(&self, buf: &mut Vec<u8>);
    /// Reconstructs a value from its packed representation.
    fn unpack_payload(buf: &[u8]) -> Self;
}

impl<T> Serializable for T
where
    T: Serialize + DeserializeOwned,
{
    fn payload_size(&self) -> usize {
        bincode::serialized_size(self).expect("bincode size computation is infallible") as usize
    }

    fn pack_payload(&self, buf: &mut Vec<u8>) {
        bincode::serialize_into(buf, self).expect("bincode serialization is infallible")
    }

    fn unpack_payload(buf: &[u8]) -> Self {
        bincode::deserialize(buf).expect("malformed payload bytes on the wire")
    }
}

/// One RDMA-transferable memory region: a `(address, length)` pair plus an opaque transport
/// handle minted by [`Transport::mem_register`](crate::transport::Transport::mem_register).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DataRegion {
    /// Base address of the region (informative only; the handle is what the transport moves).
    pub addr: usize,
    /// Length of the region, in bytes.
    pub len: usize,
}

/// Opt-in split-metadata serialization for large values: a small metadata header plus a list of
/// memory regions transferred by one-sided `get` rather than being inlined in the active message.
pub trait SplitMetadata: Sized {
    /// Small header type, inlined in the active message and serialized with `bincode`.
    type Metadata: Serialize + DeserializeOwned + Send + 'static;

    /// Extracts this value's metadata header.
    fn get_metadata(&self) -> Self::Metadata;

    /// Returns the list of memory regions backing this value's data.
    fn data_regions(&self) -> Vec<DataRegion>;

    /// Reconstructs an (initially empty) value from a metadata header; the regions are filled in
    /// by the RDMA `get`s that follow, matching the original's `create_from_metadata`.
    fn create_from_metadata(meta: Self::Metadata) -> Self;
}
