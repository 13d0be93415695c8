//! The [`Key`] trait: a task's identity within an operator.
//!
//! Keys are not owned by the runtime; a clone is kept inside each pending task record for the
//! lifetime of that record ([`PendingTask`](crate::task_table::PendingTask)).

use std::fmt::Debug;
use std::hash::Hash;

use serde::Serialize;
use serde::de::DeserializeOwned;

/// A user-defined task identity: equatable, totally hashable and ordered, printable, and
/// serializable with a size-preserving wire encoding.
///
/// Blanket-implemented for any type meeting the bounds, matching the way `dfir_rs` leaves its
/// `K`/`V` type parameters open rather than requiring a bespoke marker trait per user type.
pub trait Key: Clone + Eq + Hash + Ord + Debug + Serialize + DeserializeOwned + Send + Sync + 'static {}

impl<T> Key for T where T: Clone + Eq + Hash + Ord + Debug + Serialize + DeserializeOwned + Send + Sync + 'static {}

/// Serializes a key to its monolithic wire representation, as carried in an active-message frame's
/// key list.
pub fn encode_key<K: Key>(key: &K) -> Vec<u8> {
    bincode::serialize(key).expect("key serialization is infallible for well-formed Key impls")
}

/// Deserializes a key from its monolithic wire representation.
pub fn decode_key<K: Key>(bytes: &[u8]) -> Result<K, bincode::Error> {
    bincode::deserialize(bytes)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn roundtrip_is_identity() {
        let key = (3_i32, "tile".to_string());
        let bytes = encode_key(&key);
        let back: (i32, String) = decode_key(&bytes).unwrap();
        assert_eq!(key, back);
    }
}
