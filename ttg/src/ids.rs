//! Small newtype identifiers shared by the delivery, scheduler, and termination layers.

use serde::{Deserialize, Serialize};

/// A taskpool is one operator's graph-wide registration: stable across ranks, used to address a
/// specific operator's task table from an incoming active message or a termination message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TaskpoolId(pub u32);

/// A globally unique operator instance id, stable across ranks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct OpId(pub u64);

impl OpId {
    /// Derives an `OpId` from an operator's registered name.
    ///
    /// Every rank in an SPMD run builds the same graph and registers the same operator names in
    /// whatever order its own topology-construction code happens to use, so an auto-incrementing
    /// counter would not agree across ranks; hashing the name gives every rank the same id for
    /// "the operator called this" with no coordination required.
    pub fn from_name(name: &str) -> Self {
        use std::hash::Hasher;
        let mut hasher = rustc_hash::FxHasher::default();
        hasher.write(name.as_bytes());
        OpId(hasher.finish())
    }
}
