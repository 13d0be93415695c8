//! The operator graph: the set of operators reachable from a user-supplied root, frozen into an
//! executable topology by an idempotent [`Graph::make_executable`] sweep.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use crate::edge::{Access, Edge};
use crate::error::TopologyError;
use crate::ids::{OpId, TaskpoolId};
use crate::key::Key;
use crate::operator::{Op, OperatorShell};
use crate::termination::TerminationDetector;
use crate::value::Value;

/// A type-erased view of a registered [`OperatorShell`], enough for the graph to validate
/// topology and for termination detection to poll local quiescence, without needing to know the
/// operator's concrete `K`/`Op` type parameters.
pub trait AnyOperator: Send + Sync {
    /// The operator's registered name.
    fn name(&self) -> &str;

    /// The operator's cross-rank-stable id, derived from its name.
    fn op_id(&self) -> OpId;

    /// The operator's static input arity (`O::Args::LEN`).
    fn declared_arity(&self) -> usize;

    /// Number of in-flight (not yet fired) task records.
    fn pending_count(&self) -> usize;

    /// Output port indices never bound to an edge.
    fn unbound_output_ports(&self) -> Vec<usize>;

    /// Binds this operator into a world's termination bookkeeping.
    fn bind_registration(&self, taskpool_id: TaskpoolId, termination: Arc<dyn TerminationDetector>);
}

impl<K: Key, O: Op<K>> AnyOperator for OperatorShell<K, O> {
    fn name(&self) -> &str {
        OperatorShell::name(self)
    }

    fn op_id(&self) -> OpId {
        OperatorShell::op_id(self)
    }

    fn declared_arity(&self) -> usize {
        <O::Args as variadics::VariadicExt>::LEN
    }

    fn pending_count(&self) -> usize {
        OperatorShell::pending_count(self)
    }

    fn unbound_output_ports(&self) -> Vec<usize> {
        self.outputs().unbound_ports()
    }

    fn bind_registration(&self, taskpool_id: TaskpoolId, termination: Arc<dyn TerminationDetector>) {
        OperatorShell::bind_registration(self, taskpool_id, termination)
    }
}

/// The set of operators reachable from a user-supplied root.
///
/// Construction wires operators together by binding each input terminal to its producer's
/// [`Edge`] via [`Graph::connect_input`]; [`Graph::make_executable`] then validates every
/// operator's declared arity was fully wired and every output port was bound to at least one
/// consumer, and freezes the topology (subsequent calls are no-ops).
#[derive(Default)]
pub struct Graph {
    operators: Mutex<Vec<Arc<dyn AnyOperator>>>,
    bound_inputs: Mutex<HashMap<String, HashSet<usize>>>,
    executable: Mutex<bool>,
}

impl Graph {
    /// Creates an empty graph.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers an operator with the graph. Errors if another operator already registered under
    /// the same name.
    pub fn register(&self, op: Arc<dyn AnyOperator>) -> Result<(), TopologyError> {
        let mut operators = self.operators.lock().unwrap();
        if operators.iter().any(|existing| existing.name() == op.name()) {
            return Err(TopologyError::DuplicateOperatorName { name: op.name().to_string() });
        }
        self.bound_inputs.lock().unwrap().entry(op.name().to_string()).or_default();
        operators.push(op);
        Ok(())
    }

    /// Binds `shell`'s input port `port` to `edge`, recording that this port of `shell` is now
    /// wired (used by [`Self::make_executable`]'s arity check).
    pub fn connect_input<K: Key, O: Op<K>, V: Value + Clone>(
        &self,
        edge: &Edge<K, V>,
        shell: &Arc<OperatorShell<K, O>>,
        port: usize,
        access: Access,
    ) {
        edge.bind(shell.input_terminal(port, access));
        self.bound_inputs
            .lock()
            .unwrap()
            .entry(shell.name().to_string())
            .or_default()
            .insert(port);
    }

    /// Validates and freezes the topology. Idempotent: once frozen, later calls return `Ok(())`
    /// immediately without re-validating.
    pub fn make_executable(&self) -> Result<(), TopologyError> {
        let mut executable = self.executable.lock().unwrap();
        if *executable {
            return Ok(());
        }
        let operators = self.operators.lock().unwrap();
        let bound_inputs = self.bound_inputs.lock().unwrap();
        for op in operators.iter() {
            let bound = bound_inputs.get(op.name()).map_or(0, HashSet::len);
            if bound != op.declared_arity() {
                return Err(TopologyError::ArityMismatch {
                    op: op.name().to_string(),
                    declared: op.declared_arity(),
                    bound,
                });
            }
            if let Some(&port) = op.unbound_output_ports().first() {
                return Err(TopologyError::UnboundTerminal {
                    op: op.name().to_string(),
                    port,
                });
            }
        }
        *executable = true;
        Ok(())
    }

    /// Whether [`Self::make_executable`] has successfully frozen this graph.
    pub fn is_executable(&self) -> bool {
        *self.executable.lock().unwrap()
    }

    /// The registered operators, for termination-detection polling and diagnostics.
    pub fn operators(&self) -> Vec<Arc<dyn AnyOperator>> {
        self.operators.lock().unwrap().clone()
    }
}
