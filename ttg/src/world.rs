//! The top-level runtime handle: configuration, operator registration, and the
//! `execute`/`fence`/`abort` entry points that tie the graph, scheduler, transport, and
//! termination detector together.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::delivery::{DeliveryRouter, Frame};
use crate::edge::{Access, Edge};
use crate::error::{TopologyError, TtgError};
use crate::graph::{AnyOperator, Graph};
use crate::ids::{OpId, TaskpoolId};
use crate::key::Key;
use crate::operator::{Op, OperatorShell};
use crate::rank::{KeyMap, Rank};
use crate::scheduler::Scheduler;
use crate::termination::TerminationDetector;
use crate::transport::{DATA_TAG, Transport};
use crate::value::Value;

/// Validates that `rank` is a legal destination for `op`'s key-map output: out-of-range key-map
/// ranks are unconditionally a fatal topology error, not a debug-only assertion.
pub fn validate_rank(op: &str, rank: Rank, world_size: usize) -> Result<(), TopologyError> {
    if rank.index() >= world_size {
        return Err(TopologyError::KeymapOutOfRange {
            op: op.to_string(),
            rank,
            world_size,
        });
    }
    Ok(())
}

/// Runtime configuration: a plain serde-deserializable config struct, in the same style as this
/// workspace's other config structs, rather than environment-variable globals.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct WorldConfig {
    /// This process's rank in the distributed world.
    pub rank: Rank,
    /// Total number of ranks participating in this run.
    pub world_size: usize,
    /// Number of scheduler worker threads.
    pub worker_threads: usize,
    /// Maximum active-message size the transport will pack, in bytes.
    pub max_active_message_size: usize,
    /// Per-operator unresolved-frame bound for the delayed-unpack queue.
    pub max_delayed_unpack_per_op: usize,
}

impl Default for WorldConfig {
    fn default() -> Self {
        Self {
            rank: Rank::ROOT,
            world_size: 1,
            worker_threads: num_cpus_fallback(),
            max_active_message_size: 1 << 20,
            max_delayed_unpack_per_op: 256,
        }
    }
}

fn num_cpus_fallback() -> usize {
    std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1)
}

/// Builder for [`WorldConfig`], a plain-struct-with-setters configuration pattern rather than a
/// derive-heavy builder macro.
#[derive(Debug, Clone, Default)]
pub struct WorldConfigBuilder {
    config: WorldConfig,
}

impl WorldConfigBuilder {
    /// Starts from [`WorldConfig::default`].
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets this process's rank.
    pub fn rank(mut self, rank: Rank) -> Self {
        self.config.rank = rank;
        self
    }

    /// Sets the total world size.
    pub fn world_size(mut self, world_size: usize) -> Self {
        self.config.world_size = world_size;
        self
    }

    /// Sets the scheduler worker-thread count.
    pub fn worker_threads(mut self, worker_threads: usize) -> Self {
        self.config.worker_threads = worker_threads;
        self
    }

    /// Sets the transport's maximum active-message size.
    pub fn max_active_message_size(mut self, bytes: usize) -> Self {
        self.config.max_active_message_size = bytes;
        self
    }

    /// Finishes building the config.
    pub fn build(self) -> WorldConfig {
        self.config
    }
}

/// The top-level runtime handle tying together the graph, scheduler, transport, and termination
/// detector for one process's participation in a run.
pub struct World {
    config: WorldConfig,
    graph: Graph,
    scheduler: Arc<dyn Scheduler>,
    transport: Arc<dyn Transport>,
    termination: Arc<dyn TerminationDetector>,
    router: Arc<DeliveryRouter>,
    next_taskpool_id: AtomicU32,
}

impl World {
    /// Creates a world from its configuration and external collaborators. The scheduler owns its
    /// own execution context; `World` never keeps a second, separately-counted one.
    ///
    /// Registers this world's cross-process delivery listener on `transport` at construction time
    /// (rather than waiting for [`Self::make_executable`]), since a remote rank may address this
    /// process's operators at any point once it has a handle to `transport` — there is no single
    /// later "topology frozen" moment shared across ranks that would be safe to gate listening on.
    pub fn new(
        config: WorldConfig,
        scheduler: Arc<dyn Scheduler>,
        transport: Arc<dyn Transport>,
        termination: Arc<dyn TerminationDetector>,
    ) -> Arc<Self> {
        let router = Arc::new(DeliveryRouter::new(config.max_delayed_unpack_per_op));
        let dispatch_router = Arc::clone(&router);
        let dispatch_termination = Arc::clone(&termination);
        transport.register_tag(
            DATA_TAG,
            Box::new(move |_from, bytes| match Frame::decode(bytes) {
                Ok(frame) => {
                    // `LoopbackTransport` invokes this handler synchronously, so there is no real
                    // window in which the message is "in flight" separately from task dispatch;
                    // these hooks still run so termination accounting stays correct for the
                    // common case where `taskpool_of` hasn't been registered yet (frame held in
                    // the delayed-unpack queue) and so a transport with genuine network latency
                    // could wrap this same handler without further changes.
                    let tp = dispatch_router.taskpool_of(frame.header.op_id);
                    if let Some(tp) = tp {
                        dispatch_termination.incoming_message_start(tp);
                    }
                    if let Err(e) = dispatch_router.dispatch(frame) {
                        tracing::warn!(error = %e, "failed to dispatch incoming data frame");
                    }
                    if let Some(tp) = tp {
                        dispatch_termination.incoming_message_end(tp);
                    }
                }
                Err(e) => tracing::warn!(error = %e, "failed to decode incoming data frame"),
            }),
            config.max_active_message_size,
        );
        Arc::new(Self {
            config,
            graph: Graph::new(),
            scheduler,
            transport,
            termination,
            router,
            next_taskpool_id: AtomicU32::new(0),
        })
    }

    /// This process's rank.
    pub fn rank(&self) -> Rank {
        self.config.rank
    }

    /// The configured world size.
    pub fn world_size(&self) -> usize {
        self.config.world_size
    }

    /// The runtime configuration this world was built from.
    pub fn config(&self) -> &WorldConfig {
        &self.config
    }

    /// The operator graph this world drives.
    pub fn graph(&self) -> &Graph {
        &self.graph
    }

    /// The transport collaborator.
    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    /// The scheduler collaborator, handed to each [`crate::operator::OperatorShell`]
    /// constructed against this world so task release goes through one shared ready queue.
    pub fn scheduler(&self) -> &Arc<dyn Scheduler> {
        &self.scheduler
    }

    /// Registers an operator with this world's graph and termination detector, minting it a fresh
    /// [`TaskpoolId`] and binding the operator to this world's termination detector so its
    /// dispatched tasks are counted toward quiescence.
    pub fn register_operator(&self, op: Arc<dyn AnyOperator>) -> Result<TaskpoolId, TtgError> {
        let op_id = op.op_id();
        self.graph.register(Arc::clone(&op))?;
        let tp = TaskpoolId(self.next_taskpool_id.fetch_add(1, Ordering::SeqCst));
        op.bind_registration(tp, Arc::clone(&self.termination));
        self.router.register_taskpool(op_id, tp);
        self.termination.monitor_taskpool(tp);
        self.termination.taskpool_ready(tp);
        self.scheduler.enqueue_taskpool(tp);
        tracing::trace!(op = op.name(), op_id = op_id.0, taskpool = tp.0, "operator registered");
        Ok(tp)
    }

    /// Binds `shell`'s input port `port` to `edge`, and additionally installs a remote-delivery
    /// handler for `(shell.op_id(), port)` so frames addressed here from another rank's
    /// [`Edge::connect_remote`] land on this port exactly as a local send would.
    pub fn connect_input<K: Key, O: Op<K>, V: Value + Clone + Serialize + DeserializeOwned>(
        &self,
        edge: &Edge<K, V>,
        shell: &Arc<OperatorShell<K, O>>,
        port: usize,
        access: Access,
    ) {
        self.graph.connect_input(edge, shell, port, access);
        self.router.register(shell.op_id(), port as u64, shell.remote_dispatch_handler(port, access));
    }

    /// Configures `edge` to route keys not owned by this world's rank (per `keymap`) over this
    /// world's transport to input port `dest_param_id` of the operator named `dest_operator_name`
    /// on whichever rank owns them, instead of delivering locally.
    pub fn connect_remote_input<K: Key, V: Value>(
        &self,
        edge: &Edge<K, V>,
        keymap: Arc<dyn KeyMap<K>>,
        dest_operator_name: &str,
        dest_param_id: u64,
    ) {
        edge.connect_remote(
            Arc::clone(&self.transport),
            keymap,
            self.config.rank,
            OpId::from_name(dest_operator_name),
            dest_param_id,
            self.config.max_active_message_size,
        );
    }

    /// This world's delivery router, dispatching incoming data frames to registered input ports.
    pub fn router(&self) -> &Arc<DeliveryRouter> {
        &self.router
    }

    /// Validates and freezes the graph topology. Idempotent.
    pub fn make_executable(&self) -> Result<(), TtgError> {
        self.graph.make_executable().map_err(Into::into)
    }

    /// Checks a key-map's resolved rank against this world's configured size.
    pub fn validate_rank(&self, op: &str, rank: Rank) -> Result<(), TtgError> {
        validate_rank(op, rank, self.config.world_size).map_err(Into::into)
    }

    /// Starts the scheduler's worker threads against this world's default execution context.
    pub fn execute(self: &Arc<Self>) {
        tracing::debug!(rank = %self.config.rank, "starting execution");
        self.scheduler.start();
    }

    /// Blocks until the scheduler has drained its ready queue and every registered taskpool has
    /// reached global quiescence.
    #[tracing::instrument(skip(self), fields(rank = %self.config.rank))]
    pub fn fence(&self) -> Result<(), TtgError> {
        self.scheduler.wait();
        for tp in 0..self.next_taskpool_id.load(Ordering::SeqCst) {
            self.termination.fence(TaskpoolId(tp))?;
        }
        tracing::debug!("fence complete");
        Ok(())
    }

    /// Reports `err` with full context and aborts the process: the default top-level error
    /// policy, used as the `on_error` sink installed on operators unless an embedder overrides
    /// it.
    pub fn abort_on_error(err: TtgError) -> ! {
        tracing::error!(error = %err, "fatal error, aborting");
        std::process::abort();
    }

    /// Logs `msg` and aborts the process.
    pub fn abort(msg: &str) -> ! {
        tracing::error!(%msg, "abort requested");
        std::process::abort();
    }
}
