//! A distributed data-flow task-graph runtime: the template-style operator abstraction, argument
//! accumulation and task-readiness machinery, zero-copy fan-out via reference-counted data
//! copies, streaming-reducer inputs, cross-process active-message delivery, and task release to a
//! pluggable scheduler.

pub mod datacopy;
pub mod delivery;
pub mod edge;
pub mod error;
pub mod graph;
pub mod ids;
pub mod key;
pub mod operator;
pub mod rank;
pub mod scheduler;
pub mod task_table;
pub mod termination;
pub mod transport;
mod util;
pub mod value;
pub mod world;

pub use datacopy::DataCopy;
pub use edge::{Access, Edge, InputTerminal};
pub use error::{ArgumentError, DeliveryError, TerminationError, TopologyError, TtgError};
pub use graph::{AnyOperator, Graph};
pub use key::Key;
pub use operator::{FromDataCopies, Op, Outputs, OperatorShell};
pub use rank::{KeyMap, Rank, SingleRank};
pub use value::{SplitMetadata, Value};
pub use world::{World, WorldConfig, WorldConfigBuilder};
