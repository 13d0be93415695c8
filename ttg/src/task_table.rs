//! Argument accumulation and task firing: a lock-striped hash map, keyed by task key, of in-flight
//! [`PendingTask`] records.
//!
//! The [`DataCopy`] registration (the CAS-racing reader/writer dance in `crate::datacopy`) always
//! happens on the caller's side, lock-free, before any of these methods are called; a bucket lock
//! here only ever guards the short "find-or-create the record, check for a duplicate argument,
//! store the already-resolved copy, fire if complete" sequence. Because the copy's own
//! registration can itself be deferred, [`TaskTable::set_arg`] is also exactly the function
//! captured as the `on_deferred` callback passed to `DataCopy::register_writer` — it runs once per
//! slot whether invoked synchronously on the sending thread or later, off of someone else's
//! [`DataCopy::release`].

use std::sync::Arc;

use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use smallvec::SmallVec;

use crate::datacopy::DataCopy;
use crate::error::ArgumentError;
use crate::key::Key;

/// Most operators declare a handful of input ports; inlining up to this many slots avoids a heap
/// allocation per task record for the common case.
const INLINE_ARITY: usize = 4;

type SlotVec = SmallVec<[Slot; INLINE_ARITY]>;

/// Per-input streaming bookkeeping for a [`PendingTask`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StreamState {
    /// A plain, single-value input.
    NotStreaming,
    /// A streaming input still accepting values; `None` means the size hasn't been declared yet
    /// (the stream is closed only by an explicit `finalize_argstream`).
    Streaming { remaining: Option<u32> },
    /// The streaming input has closed; its slot now counts toward arity.
    Closed,
}

/// One input slot of a [`PendingTask`].
#[derive(Debug, Default)]
struct Slot {
    value: Option<Arc<DataCopy>>,
    stream: Option<StreamState>,
}

impl Slot {
    fn is_filled(&self) -> bool {
        match self.stream {
            None | Some(StreamState::NotStreaming) => self.value.is_some(),
            Some(StreamState::Streaming { .. }) => false,
            Some(StreamState::Closed) => true,
        }
    }
}

/// One in-flight `(operator, key)` record.
#[derive(Debug)]
pub struct PendingTask<K> {
    key: K,
    slots: SlotVec,
    filled: usize,
    priority: i32,
}

impl<K> PendingTask<K> {
    fn new(key: K, arity: usize, priority: i32) -> Self {
        Self {
            key,
            slots: (0..arity).map(|_| Slot::default()).collect(),
            filled: 0,
            priority,
        }
    }
}

/// A task whose inputs are all present, handed off to the scheduler.
#[derive(Debug)]
pub struct ReadyTask<K> {
    /// The task's key.
    pub key: K,
    /// Resolved argument copies, one per input port, in declaration order.
    pub inputs: SmallVec<[Option<Arc<DataCopy>>; INLINE_ARITY]>,
    /// The priority computed at task-record creation: an arity proxy plus a user tiebreaker.
    pub priority: i32,
}

fn firing_priority(arity: usize, user_priority: i32) -> i32 {
    // Static remaining-arity proxy: `arity - 1` dominates, the user's own priomap value only
    // breaks ties between operators of equal arity. `arity` is bounded by a task's declared input
    // count, never more than a few dozen in practice, so this packing is lossless for any priomap
    // range that fits in the low bits; callers with exotic priomaps may see collisions degrade to
    // FIFO-within-bucket.
    let arity_term = (arity.saturating_sub(1) as i32).saturating_mul(1 << 16);
    arity_term.saturating_add(user_priority)
}

/// Lock-striped hash map of [`PendingTask`] records for one operator.
pub struct TaskTable<K: Key> {
    arity: usize,
    shards: Vec<Mutex<FxHashMap<K, PendingTask<K>>>>,
}

fn shard_index<K: Key>(key: &K, n_shards: usize) -> usize {
    use std::hash::{Hash, Hasher};
    let mut hasher = rustc_hash::FxHasher::default();
    key.hash(&mut hasher);
    (hasher.finish() as usize) % n_shards
}

impl<K: Key> TaskTable<K> {
    /// Creates a task table for an operator with the given static input arity.
    ///
    /// `n_shards` should be a power of two sized off the worker-thread count; tests and small
    /// graphs are fine with a single shard.
    pub fn new(arity: usize, n_shards: usize) -> Self {
        let n_shards = n_shards.max(1);
        Self {
            arity,
            shards: (0..n_shards).map(|_| Mutex::new(FxHashMap::default())).collect(),
        }
    }

    fn shard(&self, key: &K) -> &Mutex<FxHashMap<K, PendingTask<K>>> {
        &self.shards[shard_index(key, self.shards.len())]
    }

    /// Installs an already-resolved copy for a plain, non-streaming input and fires the task if
    /// this was its last missing input.
    ///
    /// `copy` must already have gone through [`DataCopy::register_reader`] or
    /// [`DataCopy::register_writer`] (done by the caller, lock-free, outside any bucket lock) —
    /// this call only does the find-or-create, duplicate-argument check, and fill-count
    /// bookkeeping. Because that registration may itself be deferred, this is the exact function
    /// captured as the `on_deferred` callback passed to `register_writer`: it runs exactly once
    /// per slot whether invoked synchronously on the sending thread or later, off of someone
    /// else's [`DataCopy::release`].
    pub fn set_arg(
        &self,
        op: &str,
        key: &K,
        input: usize,
        priority: i32,
        copy: Arc<DataCopy>,
    ) -> Result<Option<ReadyTask<K>>, ArgumentError> {
        let mut bucket = self.shard(key).lock();
        let task = bucket
            .entry(key.clone())
            .or_insert_with(|| PendingTask::new(key.clone(), self.arity, firing_priority(self.arity, priority)));
        if task.slots[input].is_filled() {
            return Err(ArgumentError::DuplicateArgument {
                op: op.to_string(),
                input,
                key: format!("{:?}", key),
            });
        }
        task.slots[input].stream = Some(StreamState::NotStreaming);
        task.slots[input].value = Some(copy);
        task.filled += 1;
        if task.filled < self.arity {
            return Ok(None);
        }
        let mut task = bucket.remove(key).expect("just inserted above");
        for slot in &task.slots {
            if let Some(copy) = &slot.value {
                copy.resolve_writer();
            }
        }
        Ok(Some(ReadyTask {
            key: task.key,
            inputs: task.slots.drain(..).map(|s| s.value).collect(),
            priority: task.priority,
        }))
    }

    /// Stores the resolved copy for a slot already known to exist (the streaming paths below use
    /// this once a stream closes) and fires the task if this was its last missing input.
    fn complete_set_arg(&self, key: &K, input: usize, copy: Arc<DataCopy>) -> Option<ReadyTask<K>> {
        let mut bucket = self.shard(key).lock();
        let task = bucket.get_mut(key)?;
        task.slots[input].value = Some(copy);
        task.filled += 1;
        if task.filled < self.arity {
            return None;
        }
        let mut task = bucket.remove(key)?;
        for slot in &task.slots {
            if let Some(copy) = &slot.value {
                copy.resolve_writer();
            }
        }
        Some(ReadyTask {
            key: task.key,
            inputs: task.slots.drain(..).map(|s| s.value).collect(),
            priority: task.priority,
        })
    }

    /// Declares the expected value count for a streaming input.
    pub fn set_argstream_size(
        &self,
        op: &str,
        key: &K,
        input: usize,
        n: u32,
        priority: i32,
    ) -> Result<(), ArgumentError> {
        if n == 0 {
            return Err(ArgumentError::ZeroStreamSize {
                op: op.to_string(),
                input,
            });
        }
        let mut bucket = self.shard(key).lock();
        let task = bucket
            .entry(key.clone())
            .or_insert_with(|| PendingTask::new(key.clone(), self.arity, firing_priority(self.arity, priority)));
        match task.slots[input].stream {
            None => {
                task.slots[input].stream = Some(StreamState::Streaming { remaining: Some(n) });
                Ok(())
            }
            Some(StreamState::NotStreaming) => Err(ArgumentError::NotStreaming {
                op: op.to_string(),
                input,
            }),
            Some(StreamState::Streaming { .. }) | Some(StreamState::Closed) => {
                task.slots[input].stream = Some(StreamState::Streaming { remaining: Some(n) });
                Ok(())
            }
        }
    }

    /// Folds one more value into a streaming input, closing it (and counting it toward arity)
    /// once the declared size is reached. `merged` is the already-reducer-folded accumulator;
    /// the typed reducer call happens in the operator layer, not here.
    pub fn set_arg_stream_value(
        &self,
        key: &K,
        input: usize,
        merged: Arc<DataCopy>,
        priority: i32,
    ) -> Option<ReadyTask<K>> {
        {
            let mut bucket = self.shard(key).lock();
            let task = bucket
                .entry(key.clone())
                .or_insert_with(|| PendingTask::new(key.clone(), self.arity, firing_priority(self.arity, priority)));
            let slot = &mut task.slots[input];
            slot.value = Some(merged.clone());
            match &mut slot.stream {
                Some(StreamState::Streaming { remaining: Some(n) }) => {
                    *n -= 1;
                    if *n == 0 {
                        slot.stream = Some(StreamState::Closed);
                    } else {
                        return None;
                    }
                }
                Some(StreamState::Streaming { remaining: None }) => return None,
                _ => {
                    slot.stream = Some(StreamState::Streaming { remaining: None });
                    return None;
                }
            }
        }
        self.complete_set_arg(key, input, merged)
    }

    /// Closes a streaming input early; whatever value has been accumulated so far becomes the
    /// argument. Errors if the stream never received a value.
    pub fn finalize_argstream(&self, op: &str, key: &K, input: usize) -> Result<Option<ReadyTask<K>>, ArgumentError> {
        let copy = {
            let mut bucket = self.shard(key).lock();
            let task = bucket.get_mut(key).ok_or_else(|| ArgumentError::UnreceivedStreamClose {
                op: op.to_string(),
                input,
                key: format!("{:?}", key),
            })?;
            let slot = &mut task.slots[input];
            let copy = slot.value.clone().ok_or_else(|| ArgumentError::UnreceivedStreamClose {
                op: op.to_string(),
                input,
                key: format!("{:?}", key),
            })?;
            slot.stream = Some(StreamState::Closed);
            copy
        };
        Ok(self.complete_set_arg(key, input, copy))
    }

    /// Returns the current accumulator for a streaming input, if any value has arrived yet. Used
    /// by the operator layer to fold a newly-arrived value through the installed reducer before
    /// calling [`Self::set_arg_stream_value`].
    pub fn peek_stream_value(&self, key: &K, input: usize) -> Option<Arc<DataCopy>> {
        let bucket = self.shard(key).lock();
        bucket.get(key)?.slots[input].value.clone()
    }

    /// Number of in-flight (not yet fired) task records across all shards. Used by tests and by
    /// termination detection to check an operator's local quiescence.
    pub fn pending_count(&self) -> usize {
        self.shards.iter().map(|s| s.lock().len()).sum()
    }

    /// Drops every in-flight task record across all shards. Used by `OperatorShell::release`;
    /// idempotent, since clearing an already-empty shard is a no-op.
    pub fn clear(&self) {
        for shard in &self.shards {
            shard.lock().clear();
        }
    }
}
