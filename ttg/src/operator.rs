//! The operator shell: a registered graph node that owns its terminals, key-map,
//! priority-map, per-input reducers, task table, and dispatches execution once a task's
//! arguments are complete.
//!
//! This is the typed layer sitting on top of the erased [`crate::task_table::TaskTable`] and
//! [`crate::datacopy::DataCopy`] tracker: it is the one place that knows each input port's
//! concrete value type, so it is the one place that performs `register_reader`/`register_writer`
//! calls before handing the resolved copy down into the erased bookkeeping below.

use std::any::Any;
use std::marker::PhantomData;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;
use serde::de::DeserializeOwned;
use variadics::VariadicExt;

use crate::datacopy::{DataCopy, Writer};
use crate::delivery::{Frame, RouteHandler, unpack_keys, unpack_value};
use crate::edge::{Access, Edge, InputTerminal};
use crate::error::{DeliveryError, TtgError};
use crate::ids::{OpId, TaskpoolId};
use crate::key::Key;
use crate::scheduler::{Scheduler, TaskDescriptor};
use crate::task_table::{ReadyTask, TaskTable};
use crate::termination::TerminationDetector;
use crate::value::Value;

/// Projects a task's erased argument copies into the concretely-typed, nested-tuple argument
/// list an [`Op`] expects, using the `variadics` crate's heterogeneous-list machinery.
///
/// Each slot's value is cloned out of its `DataCopy` rather than moved: a read-only input's copy
/// may still be shared with other tasks firing off the same broadcast, so an unconditional move
/// would be unsound; a mutable input's copy has already been resolved to a sole hold by the time
/// the task fires (`TaskTable` calls `resolve_writer` on every held copy right before handing back
/// a `ReadyTask`), but cloning it out is the same cost as the resolution step itself and keeps
/// this projection a single, uniform code path instead of two.
pub trait FromDataCopies: VariadicExt + Sized {
    /// Consumes `copies` (one entry per input port, in order) to build `Self`.
    fn project(copies: std::vec::IntoIter<Option<Arc<DataCopy>>>) -> Self;
}

impl FromDataCopies for () {
    fn project(_copies: std::vec::IntoIter<Option<Arc<DataCopy>>>) -> Self {}
}

impl<Item, Rest> FromDataCopies for (Item, Rest)
where
    Item: Any + Send + Sync + Clone,
    Rest: FromDataCopies,
{
    fn project(mut copies: std::vec::IntoIter<Option<Arc<DataCopy>>>) -> Self {
        let copy = copies
            .next()
            .expect("Args::LEN must match the operator's static arity")
            .expect("task fired with an unfilled input slot");
        let item = copy.with_ref::<Item, _>(Clone::clone);
        copy.release();
        (item, Rest::project(copies))
    }
}

/// A user-defined operator body.
pub trait Op<K: Key>: Send + Sync + 'static {
    /// The nested-tuple type of this operator's input arguments, one element per input port.
    type Args: FromDataCopies;

    /// Runs the operator body for one fired task, given its key, resolved arguments, and its
    /// output ports.
    fn call(&self, key: K, args: Self::Args, outputs: &Outputs<K>) -> Result<(), TtgError>;
}

/// An operator's M typed output ports, late-bound to [`Edge`]s and dispatched to by port index.
///
/// Ports are type-erased (`Box<dyn Any>`) since different ports may carry different value types;
/// callers recover the concrete type at the call site via [`Outputs::send`]/[`Outputs::broadcast`],
/// the same way the operator body already knows which port it's writing to.
pub struct Outputs<K: Key> {
    ports: Mutex<Vec<Box<dyn Any + Send + Sync>>>,
    bound_counts: Mutex<Vec<Box<dyn Fn() -> usize + Send + Sync>>>,
    _marker: PhantomData<fn() -> K>,
}

impl<K: Key> Default for Outputs<K> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: Key> Outputs<K> {
    /// Creates an empty set of output ports.
    pub fn new() -> Self {
        Self {
            ports: Mutex::new(Vec::new()),
            bound_counts: Mutex::new(Vec::new()),
            _marker: PhantomData,
        }
    }

    fn ensure_len(&self, index: usize) {
        let mut ports = self.ports.lock();
        let mut counts = self.bound_counts.lock();
        if index >= ports.len() {
            ports.resize_with(index + 1, || Box::new(()));
            counts.resize_with(index + 1, || Box::new(|| 0));
        }
    }

    /// Binds output port `index` to `edge`. Must be called once per port before the graph is made
    /// executable.
    pub fn bind_port<V: Value + Clone>(&self, index: usize, edge: Edge<K, V>) {
        self.ensure_len(index);
        let count_edge = edge.clone();
        self.ports.lock()[index] = Box::new(edge);
        self.bound_counts.lock()[index] = Box::new(move || count_edge.bound_count());
    }

    /// Sends `(key, value)` out of output port `index` to every consumer bound on that port's
    /// edge.
    ///
    /// # Panics
    /// Panics if port `index` was never bound, or was bound with a different value type than
    /// `V` — both are topology bugs caught in debug builds and by [`crate::graph`]'s executable
    /// sweep, not user-data-dependent conditions.
    pub fn send<V: Value + Clone>(&self, port: usize, key: K, value: V) {
        let edge = {
            let ports = self.ports.lock();
            ports
                .get(port)
                .unwrap_or_else(|| panic!("output port {port} was never bound"))
                .downcast_ref::<Edge<K, V>>()
                .expect("output port bound with a different value type")
                .clone()
        };
        edge.send(key, value);
    }

    /// Sends the same value to every key in `keys` out of output port `index`.
    pub fn broadcast<V: Value + Clone>(&self, port: usize, keys: &[K], value: V) {
        let edge = {
            let ports = self.ports.lock();
            ports
                .get(port)
                .unwrap_or_else(|| panic!("output port {port} was never bound"))
                .downcast_ref::<Edge<K, V>>()
                .expect("output port bound with a different value type")
                .clone()
        };
        edge.broadcast(keys, value);
    }

    /// Declares the expected stream size for `key` on every consumer bound to output port
    /// `index`.
    pub fn set_argstream_size<V: Value + Clone>(&self, port: usize, key: &K, n: u32) {
        let edge = {
            let ports = self.ports.lock();
            ports
                .get(port)
                .unwrap_or_else(|| panic!("output port {port} was never bound"))
                .downcast_ref::<Edge<K, V>>()
                .expect("output port bound with a different value type")
                .clone()
        };
        edge.set_argstream_size(key, n);
    }

    /// Indices of output ports that were never bound to an edge (surfaced as
    /// `TopologyError::UnboundTerminal`).
    pub fn unbound_ports(&self) -> Vec<usize> {
        self.bound_counts
            .lock()
            .iter()
            .enumerate()
            .filter(|(_, count)| count() == 0)
            .map(|(i, _)| i)
            .collect()
    }
}

type Reducer = Arc<dyn Fn(Arc<DataCopy>, Arc<DataCopy>) -> Arc<DataCopy> + Send + Sync>;

/// This operator's binding into a world's termination bookkeeping, installed by
/// `World::register_operator` once the operator has a `TaskpoolId`. Absent until then; `dispatch`
/// and `invoke_with` simply skip the termination hooks while it's unset.
#[derive(Clone)]
struct Registration {
    taskpool_id: TaskpoolId,
    termination: Arc<dyn TerminationDetector>,
}

/// A registered graph node.
pub struct OperatorShell<K: Key, O: Op<K>> {
    name: String,
    /// Stable across ranks (derived from `name`), used to address this operator's input ports
    /// from an incoming active message without needing the registration order to agree across
    /// processes.
    op_id: OpId,
    op: O,
    task_table: TaskTable<K>,
    priomap: Box<dyn Fn(&K) -> i32 + Send + Sync>,
    reducers: Mutex<Vec<Option<Reducer>>>,
    outputs: Outputs<K>,
    on_error: Box<dyn Fn(TtgError) + Send + Sync>,
    scheduler: Arc<dyn Scheduler>,
    registration: Mutex<Option<Registration>>,
}

impl<K: Key, O: Op<K>> OperatorShell<K, O> {
    /// Registers a new operator. `n_shards` sizes the task table's lock striping; `on_error` is
    /// invoked with every error the operator body or argument accumulation raises. The default
    /// top-level policy (see [`crate::world::World::abort_on_error`]) is to log it with full
    /// context and abort the process, but embedders may install something softer. `scheduler` is
    /// where a completed task's body is actually released to run, normally
    /// `world.scheduler().clone()`.
    pub fn new(
        name: impl Into<String>,
        op: O,
        priomap: impl Fn(&K) -> i32 + Send + Sync + 'static,
        n_shards: usize,
        on_error: impl Fn(TtgError) + Send + Sync + 'static,
        scheduler: Arc<dyn Scheduler>,
    ) -> Arc<Self> {
        let arity = <O::Args as VariadicExt>::LEN;
        let name = name.into();
        let op_id = OpId::from_name(&name);
        Arc::new(Self {
            name,
            op_id,
            op,
            task_table: TaskTable::new(arity, n_shards),
            priomap: Box::new(priomap),
            reducers: Mutex::new((0..arity).map(|_| None).collect()),
            outputs: Outputs::new(),
            on_error: Box::new(on_error),
            scheduler,
            registration: Mutex::new(None),
        })
    }

    /// The operator's registered name, used in error messages and tracing spans.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// This operator's cross-rank-stable id, derived from its name.
    pub fn op_id(&self) -> OpId {
        self.op_id
    }

    /// Binds this operator into a world's termination bookkeeping once it has been assigned a
    /// `TaskpoolId`. Called exactly once, by `World::register_operator`.
    pub fn bind_registration(&self, taskpool_id: TaskpoolId, termination: Arc<dyn TerminationDetector>) {
        *self.registration.lock() = Some(Registration { taskpool_id, termination });
    }

    /// The operator's output ports.
    pub fn outputs(&self) -> &Outputs<K> {
        &self.outputs
    }

    /// Number of in-flight task records, used by termination's local-quiescence check.
    pub fn pending_count(&self) -> usize {
        self.task_table.pending_count()
    }

    /// Installs a binary fold for input `i`, converting it to a streaming input.
    pub fn set_input_reducer<V: Value + Clone>(&self, input: usize, f: impl Fn(V, V) -> V + Send + Sync + 'static) {
        let erased: Reducer = Arc::new(move |old: Arc<DataCopy>, new: Arc<DataCopy>| {
            let old_v = old.with_ref::<V, _>(Clone::clone);
            old.release();
            let new_v = new.with_ref::<V, _>(Clone::clone);
            new.release();
            DataCopy::new(f(old_v, new_v))
        });
        self.reducers.lock()[input] = Some(erased);
    }

    /// Declares the expected value count for `(input, key)`.
    pub fn set_argstream_size(self: &Arc<Self>, input: usize, key: &K, n: u32) -> Result<(), TtgError> {
        let priority = (self.priomap)(key);
        self.task_table
            .set_argstream_size(&self.name, key, input, n, priority)
            .map_err(Into::into)
    }

    /// Manually injects a fully-assembled argument list for `key`, bypassing the task table and
    /// `DataCopy` tracker entirely. Equivalent to calling `set_arg` for every input in order and
    /// having every one arrive at once.
    pub fn invoke_with(self: &Arc<Self>, key: K, args: O::Args) {
        let priority = (self.priomap)(&key);
        tracing::trace!(op = %self.name, key = ?key, priority, "manually invoked, releasing to scheduler");
        self.mark_task_started();
        let shell = Arc::clone(self);
        self.scheduler.schedule(TaskDescriptor {
            priority,
            run: Box::new(move || {
                if let Err(e) = shell.op.call(key, args, &shell.outputs) {
                    (shell.on_error)(e);
                }
                shell.mark_task_finished();
            }),
        });
    }

    fn mark_task_started(&self) {
        if let Some(Registration { taskpool_id, termination }) = self.registration.lock().clone() {
            termination.taskpool_addto_nb_tasks(taskpool_id, 1);
        }
    }

    fn mark_task_finished(&self) {
        if let Some(Registration { taskpool_id, termination }) = self.registration.lock().clone() {
            termination.taskpool_addto_nb_tasks(taskpool_id, -1);
        }
    }

    /// Manually fires a zero-input operator's task for `key`.
    /// Precondition: `O::Args` has static arity 0 (i.e. is `()`); firing an operator with a
    /// nonzero declared arity through this path panics via `FromDataCopies::project`'s own
    /// preconditions.
    pub fn invoke_noarg(self: &Arc<Self>, key: K) {
        let args = O::Args::project(Vec::new().into_iter());
        self.invoke_with(key, args);
    }

    /// Drops this operator's in-flight task records, task table, and streaming-reducer state.
    /// Idempotent.
    pub fn release(&self) {
        self.task_table.clear();
        for slot in self.reducers.lock().iter_mut() {
            *slot = None;
        }
    }

    /// Closes a streaming input early.
    pub fn finalize_argstream(self: &Arc<Self>, input: usize, key: &K) -> Result<(), TtgError> {
        let ready = self.task_table.finalize_argstream(&self.name, key, input)?;
        if let Some(ready) = ready {
            self.dispatch(ready);
        }
        Ok(())
    }

    /// Manually injects an argument for `(key, input)`, bypassing any `Edge`. Equivalent to what
    /// an `Edge::send` does for a single bound consumer:
    /// wraps `value` in a fresh `DataCopy`, performs the reader/writer registration, and
    /// accumulates the resolved copy.
    pub fn set_arg<V: Value + Clone>(self: &Arc<Self>, key: K, input: usize, value: V, access: Access) {
        let copy = DataCopy::new(value);
        match access {
            Access::ReadOnly => {
                let resolved = copy.register_reader(|c| c.cloned_from::<V>());
                self.complete_set_arg(key, input, resolved);
            }
            Access::Mutable => {
                let shell = Arc::clone(self);
                let deferred_key = key.clone();
                match copy.register_writer(
                    |c| c.cloned_from::<V>(),
                    move |resolved| shell.complete_set_arg(deferred_key, input, resolved),
                ) {
                    Writer::Cloned(fresh) => self.complete_set_arg(key, input, fresh),
                    Writer::Deferred => {}
                }
            }
        }
        copy.release();
    }

    /// Installs an already-resolved copy into `(key, input)`'s slot and dispatches the task if it
    /// just became ready. This is the single function both [`InputTerminal::accept`] and a
    /// deferred writer's eventual release call into.
    fn complete_set_arg(self: &Arc<Self>, key: K, input: usize, copy: Arc<DataCopy>) {
        let reducer = self.reducers.lock()[input].clone();
        let outcome = if let Some(reducer) = reducer {
            let priority = (self.priomap)(&key);
            let merged = match self.task_table.peek_stream_value(&key, input) {
                Some(old) => reducer(old, copy),
                None => copy,
            };
            Ok(self.task_table.set_arg_stream_value(&key, input, merged, priority))
        } else {
            let priority = (self.priomap)(&key);
            self.task_table.set_arg(&self.name, &key, input, priority, copy)
        };
        match outcome {
            Ok(Some(ready)) => self.dispatch(ready),
            Ok(None) => {}
            Err(e) => (self.on_error)(e.into()),
        }
    }

    /// Hands a completed task off to the scheduler with its computed priority.
    /// `Op::call` runs later, on whatever worker thread the scheduler picks, not synchronously on
    /// this call's caller.
    fn dispatch(self: &Arc<Self>, ready: ReadyTask<K>) {
        let priority = ready.priority;
        tracing::trace!(op = %self.name, key = ?ready.key, priority, "releasing task to scheduler");
        self.mark_task_started();
        let shell = Arc::clone(self);
        self.scheduler.schedule(TaskDescriptor {
            priority,
            run: Box::new(move || {
                let args = O::Args::project(ready.inputs.into_vec().into_iter());
                if let Err(e) = shell.op.call(ready.key, args, &shell.outputs) {
                    (shell.on_error)(e);
                }
                shell.mark_task_finished();
            }),
        });
    }

    /// Builds this operator's input terminal for port `index`, to be bound onto an incoming
    /// [`Edge<K, V>`]. `access` determines whether incoming values are registered as shared reads
    /// or an exclusive mutation.
    pub fn input_terminal<V: Value + Clone>(self: &Arc<Self>, index: usize, access: Access) -> Arc<dyn InputTerminal<K, V>> {
        Arc::new(PortTerminal {
            shell: Arc::clone(self),
            index,
            access,
            _marker: PhantomData,
        })
    }

    /// Builds a handler that decodes an incoming frame's keys and value and feeds each one into
    /// input port `index`, exactly as a local `Edge::send` would. Installed into a
    /// `DeliveryRouter` under `(self.op_id(), index as u64)` so frames addressed to this port from
    /// a remote rank land here instead of needing a local `Edge` consumer at all.
    pub fn remote_dispatch_handler<V: Value + Clone + Serialize + DeserializeOwned>(
        self: &Arc<Self>,
        index: usize,
        access: Access,
    ) -> RouteHandler {
        let shell = Arc::clone(self);
        Arc::new(move |frame: &Frame| -> Result<(), DeliveryError> {
            let keys: Vec<K> = unpack_keys(frame)?;
            let value: V = unpack_value(frame);
            for key in keys {
                shell.set_arg(key, index, value.clone(), access);
            }
            Ok(())
        })
    }
}

struct PortTerminal<K: Key, O: Op<K>, V: Value> {
    shell: Arc<OperatorShell<K, O>>,
    index: usize,
    access: Access,
    _marker: PhantomData<fn() -> V>,
}

impl<K: Key, O: Op<K>, V: Value + Clone> InputTerminal<K, V> for PortTerminal<K, O, V> {
    fn access(&self) -> Access {
        self.access
    }

    fn accept(&self, key: K, copy: Arc<DataCopy>) {
        self.shell.complete_set_arg(key, self.index, copy);
    }

    fn set_argstream_size(&self, key: &K, n: u32) {
        if let Err(e) = self.shell.set_argstream_size(self.index, key, n) {
            (self.shell.on_error)(e);
        }
    }

    fn finalize_argstream(&self, key: &K) {
        if let Err(e) = self.shell.finalize_argstream(self.index, key) {
            (self.shell.on_error)(e);
        }
    }
}
