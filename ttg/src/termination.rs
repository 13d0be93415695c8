//! Termination detection: coordinated empty-set detection across processes, and the `fence`
//! semantics the host thread blocks on.
//!
//! `TerminationDetector` is a trait consumed by [`crate::world::World`]; the shipped
//! implementation is a simple all-reduce-style counter sufficient for the loopback transport and
//! the integration tests. A production MPI-backed detector is out of scope.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Condvar, Mutex};

use crate::error::TerminationError;
use crate::ids::TaskpoolId;
use crate::rank::Rank;
use crate::transport::Transport;

/// The termination-detection collaborator.
pub trait TerminationDetector: Send + Sync {
    /// Adjusts `tp`'s local outstanding-task count by `delta` (positive when a task is created,
    /// negative when one completes).
    fn taskpool_addto_nb_tasks(&self, tp: TaskpoolId, delta: i64);

    /// Marks that an outgoing message is in flight for `tp` (it must be accounted for before
    /// quiescence can be declared).
    fn outgoing_message_start(&self, tp: TaskpoolId);

    /// Marks that an incoming message has started arriving for `tp`.
    fn incoming_message_start(&self, tp: TaskpoolId);

    /// Marks that a previously-started incoming message has finished being processed.
    fn incoming_message_end(&self, tp: TaskpoolId);

    /// Registers `tp` as participating in termination detection for the current run.
    fn monitor_taskpool(&self, tp: TaskpoolId);

    /// Marks `tp` as having finished its local setup and ready to be counted toward quiescence.
    fn taskpool_ready(&self, tp: TaskpoolId);

    /// Blocks the calling thread until every monitored taskpool is globally quiescent.
    fn fence(&self, tp: TaskpoolId) -> Result<(), TerminationError>;
}

#[derive(Default)]
struct Counters {
    nb_tasks: AtomicI64,
    in_flight_messages: AtomicI64,
    ready: std::sync::atomic::AtomicBool,
}

/// A reference-counting termination detector: each taskpool tracks its own outstanding task count
/// plus in-flight messages; a taskpool is locally quiescent once both reach zero. Global
/// quiescence is an all-reduce over every rank's local counts, driven through the
/// [`Transport`] active-message channel reserved for this purpose.
pub struct ReferenceCountingDetector {
    self_rank: Rank,
    world_size: usize,
    transport: Arc<dyn Transport>,
    counters: Mutex<HashMap<TaskpoolId, Arc<Counters>>>,
    reports: Mutex<HashMap<TaskpoolId, HashMap<Rank, bool>>>,
    condvar: Condvar,
}

const TERMINATION_TAG: u64 = u64::MAX - 1;

impl ReferenceCountingDetector {
    /// Creates a detector for a `world_size`-rank run, using `transport`'s active-message channel
    /// reserved at [`TERMINATION_TAG`] to gossip local quiescence reports between ranks.
    pub fn new(self_rank: Rank, world_size: usize, transport: Arc<dyn Transport>) -> Arc<Self> {
        let this = Arc::new(Self {
            self_rank,
            world_size,
            transport,
            counters: Mutex::new(HashMap::new()),
            reports: Mutex::new(HashMap::new()),
            condvar: Condvar::new(),
        });
        this.install_handler();
        this
    }

    fn install_handler(self: &Arc<Self>) {
        // The loopback transport invokes handlers synchronously and registration is per-instance,
        // so each `ReferenceCountingDetector` installs its own handler rather than sharing a
        // process-wide table the way the delayed-unpack queue does.
        let weak = Arc::downgrade(self);
        self.transport.register_tag(
            TERMINATION_TAG,
            Box::new(move |from, bytes| {
                let Some(this) = weak.upgrade() else { return };
                let (tp, quiescent): (TaskpoolId, bool) = bincode::deserialize(bytes).expect("malformed termination report");
                this.record_report(tp, from, quiescent);
            }),
            64,
        );
    }

    fn counters_for(&self, tp: TaskpoolId) -> Arc<Counters> {
        Arc::clone(self.counters.lock().unwrap().entry(tp).or_default())
    }

    fn is_locally_quiescent(&self, tp: TaskpoolId) -> bool {
        let counters = self.counters_for(tp);
        counters.ready.load(Ordering::Acquire)
            && counters.nb_tasks.load(Ordering::Acquire) == 0
            && counters.in_flight_messages.load(Ordering::Acquire) == 0
    }

    fn record_report(&self, tp: TaskpoolId, from: Rank, quiescent: bool) {
        let mut reports = self.reports.lock().unwrap();
        reports.entry(tp).or_default().insert(from, quiescent);
        self.condvar.notify_all();
    }

    fn broadcast_report(&self, tp: TaskpoolId, quiescent: bool) {
        self.record_report(tp, self.self_rank, quiescent);
        let bytes = bincode::serialize(&(tp, quiescent)).expect("termination report encoding is infallible");
        for rank in 0..self.world_size as u32 {
            let rank = Rank(rank);
            if rank != self.self_rank {
                self.transport.send_am(TERMINATION_TAG, rank, &bytes);
            }
        }
    }
}

impl TerminationDetector for ReferenceCountingDetector {
    fn taskpool_addto_nb_tasks(&self, tp: TaskpoolId, delta: i64) {
        self.counters_for(tp).nb_tasks.fetch_add(delta, Ordering::AcqRel);
    }

    fn outgoing_message_start(&self, tp: TaskpoolId) {
        self.counters_for(tp).in_flight_messages.fetch_add(1, Ordering::AcqRel);
    }

    fn incoming_message_start(&self, tp: TaskpoolId) {
        self.counters_for(tp).in_flight_messages.fetch_add(1, Ordering::AcqRel);
    }

    fn incoming_message_end(&self, tp: TaskpoolId) {
        self.counters_for(tp).in_flight_messages.fetch_sub(1, Ordering::AcqRel);
    }

    fn monitor_taskpool(&self, tp: TaskpoolId) {
        self.counters.lock().unwrap().entry(tp).or_default();
        self.reports.lock().unwrap().entry(tp).or_default();
    }

    fn taskpool_ready(&self, tp: TaskpoolId) {
        self.counters_for(tp).ready.store(true, Ordering::Release);
    }

    fn fence(&self, tp: TaskpoolId) -> Result<(), TerminationError> {
        if self.world_size == 0 {
            return Err(TerminationError::BarrierIncomplete {
                expected: 1,
                seen: 0,
            });
        }
        loop {
            let quiescent = self.is_locally_quiescent(tp);
            self.broadcast_report(tp, quiescent);

            let mut reports = self.reports.lock().unwrap();
            loop {
                let all_quiescent = reports
                    .get(&tp)
                    .map(|seen| seen.len() == self.world_size && seen.values().all(|&q| q))
                    .unwrap_or(false);
                if all_quiescent {
                    return Ok(());
                }
                let seen_count = reports.get(&tp).map_or(0, HashMap::len);
                if seen_count < self.world_size {
                    reports = self
                        .condvar
                        .wait_timeout(reports, std::time::Duration::from_millis(10))
                        .unwrap()
                        .0;
                    continue;
                }
                break;
            }
            drop(reports);
            if !self.is_locally_quiescent(tp) {
                continue;
            }
            std::thread::sleep(std::time::Duration::from_millis(1));
        }
    }
}
