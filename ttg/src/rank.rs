//! Process ranks and the key-map.

use serde::{Deserialize, Serialize};

/// A process rank in the distributed world, `0..world_size`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Rank(pub u32);

impl Rank {
    /// The rank of the root/first process.
    pub const ROOT: Rank = Rank(0);

    /// Returns the raw rank index.
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl From<u32> for Rank {
    fn from(value: u32) -> Self {
        Rank(value)
    }
}

impl std::fmt::Display for Rank {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "rank{}", self.0)
    }
}

/// A user-supplied total function mapping a key to its owning rank.
///
/// Non-existent ranks (`rank.index() >= world_size`) are unconditionally a fatal topology error,
/// rather than a debug-only assertion as in the original source.
pub trait KeyMap<K>: Send + Sync {
    /// Returns the owning rank for `key`.
    fn rank_of(&self, key: &K) -> Rank;
}

impl<K, F> KeyMap<K> for F
where
    F: Fn(&K) -> Rank + Send + Sync,
{
    fn rank_of(&self, key: &K) -> Rank {
        self(key)
    }
}

/// A key-map that assigns every key to the same, single rank. Useful for control-only
/// operators and tests that don't care about distribution.
pub struct SingleRank(pub Rank);

impl<K> KeyMap<K> for SingleRank {
    fn rank_of(&self, _key: &K) -> Rank {
        self.0
    }
}
