//! Error taxonomy for the runtime.
//!
//! Every fatal condition the runtime can detect is represented as a value so
//! embedders and tests can observe it; [`World::abort_on_error`](crate::world::World::abort_on_error)
//! is the default top-level handler that logs with full context and then
//! aborts the process, matching the "report then abort" propagation policy.

use thiserror::Error;

use crate::rank::Rank;

/// Errors raised while wiring up or freezing a [`Graph`](crate::graph::Graph).
#[derive(Debug, Error)]
pub enum TopologyError {
    /// An operator's declared arity does not match the number of bound input terminals.
    #[error("operator {op} declares arity {declared} but has {bound} bound input terminals")]
    ArityMismatch {
        /// Name of the offending operator.
        op: String,
        /// Declared static arity.
        declared: usize,
        /// Number of terminals actually bound.
        bound: usize,
    },

    /// An output terminal was never bound to any input terminal.
    #[error("output terminal {op}:{port} is unbound")]
    UnboundTerminal {
        /// Name of the offending operator.
        op: String,
        /// Output port index.
        port: usize,
    },

    /// Two operators registered under the same name.
    #[error("duplicate operator name {name:?}")]
    DuplicateOperatorName {
        /// The colliding name.
        name: String,
    },

    /// A key-map returned a rank outside `[0, world_size)`.
    #[error("keymap for operator {op} returned out-of-range rank {rank:?} (world size {world_size})")]
    KeymapOutOfRange {
        /// Name of the offending operator.
        op: String,
        /// The out-of-range rank returned by the key-map.
        rank: Rank,
        /// The configured world size.
        world_size: usize,
    },
}

/// Errors raised while accumulating arguments into a [`PendingTask`](crate::task_table::PendingTask).
#[derive(Debug, Error)]
pub enum ArgumentError {
    /// The same `(op, key, input)` triple was set twice.
    #[error("duplicate argument for operator {op} input {input} key {key}")]
    DuplicateArgument {
        /// Name of the offending operator.
        op: String,
        /// Input port index.
        input: usize,
        /// Debug-formatted key.
        key: String,
    },

    /// `set_argstream_size` was called on a non-streaming input.
    #[error("input {input} of operator {op} is not a streaming input")]
    NotStreaming {
        /// Name of the offending operator.
        op: String,
        /// Input port index.
        input: usize,
    },

    /// `set_argstream_size` was called with `n == 0`.
    #[error("argstream size for operator {op} input {input} must be nonzero")]
    ZeroStreamSize {
        /// Name of the offending operator.
        op: String,
        /// Input port index.
        input: usize,
    },

    /// `finalize_argstream` was called on a stream that never received a value.
    #[error("argstream for operator {op} input {input} key {key} was finalized without ever receiving a value")]
    UnreceivedStreamClose {
        /// Name of the offending operator.
        op: String,
        /// Input port index.
        input: usize,
        /// Debug-formatted key.
        key: String,
    },
}

/// Errors raised by the cross-process delivery layer.
#[derive(Debug, Error)]
pub enum DeliveryError {
    /// The serialized active message (header + keys + payload) exceeds the transport's
    /// configured maximum active-message size.
    #[error("active message of {size} bytes exceeds the transport's max active-message size of {max}")]
    Capacity {
        /// Size of the offending frame, in bytes.
        size: usize,
        /// The transport's configured maximum.
        max: usize,
    },

    /// A frame could not be decoded.
    #[error("failed to decode wire frame: {0}")]
    Decode(String),

    /// A frame referenced an operator id this process does not know about, and the
    /// delayed-unpack queue overflowed its configured bound.
    #[error("delayed-unpack queue overflowed for op_id {op_id}")]
    DelayedUnpackOverflow {
        /// The unresolved operator id.
        op_id: u64,
    },
}

/// Errors raised while coordinating termination.
#[derive(Debug, Error)]
pub enum TerminationError {
    /// `fence` was called before the pre-fence barrier registered all ranks' taskpools.
    #[error("fence called before all {expected} ranks registered their taskpool (saw {seen})")]
    BarrierIncomplete {
        /// Expected number of ranks.
        expected: usize,
        /// Number of ranks actually observed.
        seen: usize,
    },
}

/// Top-level error type for the runtime, aggregating the per-concern taxonomies above.
#[derive(Debug, Error)]
pub enum TtgError {
    /// See [`TopologyError`].
    #[error(transparent)]
    Topology(#[from] TopologyError),

    /// See [`ArgumentError`].
    #[error(transparent)]
    Argument(#[from] ArgumentError),

    /// See [`DeliveryError`].
    #[error(transparent)]
    Delivery(#[from] DeliveryError),

    /// See [`TerminationError`].
    #[error(transparent)]
    Termination(#[from] TerminationError),

    /// An error raised by the user's operator body.
    #[error("operator body failed: {0}")]
    Body(String),
}
