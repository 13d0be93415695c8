//! The data-copy tracker: reference-counted value holders with reader/writer accounting,
//! enforcing zero-copy fan-out while letting exactly one mutator observe a copy at a time.
//!
//! The original PaRSEC implementation CASes a raw `parsec_task_t *` into `copy->push_task` and
//! reinterprets `copy->readers` as a writer-marker via the `INT32_MIN` sentinel. Rust has no
//! portable way to CAS an arbitrary owned value into an atomic slot, so the deferred writer is
//! held behind a small `Mutex` instead, the same trade the rest of this workspace makes elsewhere
//! for CAS-shaped state.

use std::any::Any;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicI32, Ordering};

use parking_lot::Mutex;

/// Sentinel written into `readers` while a copy is mutably held with deferred readers pending.
const WRITER_HELD: i32 = i32::MIN;

/// A deferred release: the writer task whose completion is postponed until later readers of the
/// same original copy have been resolved.
pub struct DeferredWriter {
    /// Invoked once the deferred writer may proceed, handed the copy it should mutate.
    pub release: Box<dyn FnOnce(Arc<DataCopy>) + Send>,
}

impl fmt::Debug for DeferredWriter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeferredWriter").finish_non_exhaustive()
    }
}

/// A reference-counted, type-erased holder for one [`Value`](crate::value::Value).
///
/// `readers` encodes this copy's holder state:
/// - `readers > 0`: all current holders are read-only, sharing this copy.
/// - `readers == WRITER_HELD`: exactly one task holds this copy for mutation; `deferred` carries
///   the release callback for that writer, fired once a reader forces the promotion dance.
pub struct DataCopy {
    payload: Mutex<Box<dyn Any + Send + Sync>>,
    readers: AtomicI32,
    deferred: Mutex<Option<DeferredWriter>>,
    type_name: &'static str,
}

impl fmt::Debug for DataCopy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DataCopy")
            .field("type_name", &self.type_name)
            .field("readers", &self.readers.load(Ordering::Relaxed))
            .finish()
    }
}

impl DataCopy {
    /// Wraps `value` in a new, read-only-held `DataCopy` with `readers = 1`.
    pub fn new<V: Any + Send + Sync>(value: V) -> Arc<Self> {
        Arc::new(Self {
            payload: Mutex::new(Box::new(value)),
            readers: AtomicI32::new(1),
            deferred: Mutex::new(None),
            type_name: std::any::type_name::<V>(),
        })
    }

    /// Returns a clone of the wrapped value as a fresh, independently-owned `DataCopy` with
    /// `readers = 1`. Used whenever fan-out forces a physical duplication.
    pub fn cloned_from<V: Any + Send + Sync + Clone>(&self) -> Arc<Self> {
        let guard = self.payload.lock();
        let value = guard
            .downcast_ref::<V>()
            .expect("type-erased payload downcast mismatch")
            .clone();
        drop(guard);
        Self::new(value)
    }

    /// Runs `f` with a shared reference to the wrapped value.
    ///
    /// # Panics
    /// Panics if `V` does not match the type this copy was constructed with.
    pub fn with_ref<V: Any + Send + Sync, R>(&self, f: impl FnOnce(&V) -> R) -> R {
        let guard = self.payload.lock();
        f(guard
            .downcast_ref::<V>()
            .expect("type-erased payload downcast mismatch"))
    }

    /// Runs `f` with an exclusive reference to the wrapped value.
    ///
    /// Callers must only do this while holding the sole mutable registration for this copy
    /// (`readers == WRITER_HELD` and this task is the recorded writer); the tracker does not
    /// re-derive that fact here, matching the original's "the writer trusts its own dispatch".
    pub fn with_mut<V: Any + Send + Sync, R>(&self, f: impl FnOnce(&mut V) -> R) -> R {
        let mut guard = self.payload.lock();
        f(guard
            .downcast_mut::<V>()
            .expect("type-erased payload downcast mismatch"))
    }

    /// Extracts the wrapped value, consuming the copy. Only valid once this is the last holder.
    pub fn into_inner<V: Any + Send + Sync>(self: Arc<Self>) -> V {
        let copy = Arc::try_unwrap(self).unwrap_or_else(|_| panic!("into_inner called while other holders remain"));
        *copy
            .payload
            .into_inner()
            .downcast::<V>()
            .expect("type-erased payload downcast mismatch")
    }

    /// Registers a new read-only holder for an existing copy `self`, returning the copy the
    /// requester should actually use.
    pub fn register_reader(self: &Arc<Self>, clone_if_writer: impl FnOnce(&Arc<Self>) -> Arc<Self>) -> Arc<Self> {
        loop {
            let current = self.readers.load(Ordering::Acquire);
            if current > 0 {
                if self
                    .readers
                    .compare_exchange(current, current + 1, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
                {
                    return self.clone();
                }
                continue;
            }
            // `current == WRITER_HELD`: a writer holds this copy. The writer-promotion dance:
            // this reader takes ownership of the *original* copy (flips it back to `readers =
            // 1`, then to 2 to register itself); the deferred writer is handed a fresh clone and
            // released.
            if self
                .readers
                .compare_exchange(WRITER_HELD, 2, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                if let Some(deferred) = self.deferred.lock().take() {
                    let writer_copy = clone_if_writer(self);
                    (deferred.release)(writer_copy);
                }
                return self.clone();
            }
        }
    }

    /// Registers a new mutable (writer) holder against an existing copy `self`. If the copy is
    /// uncontended (`readers == 1`, no deferred writer yet), this task becomes the deferred
    /// writer of the *original* copy and `on_deferred` is stashed to run once a reader forces the
    /// promotion dance. Otherwise a physical clone is returned immediately via `make_clone`.
    ///
    /// Returns `Writer::Deferred` if this task now owns `self` (deferred release installed), or
    /// `Writer::Cloned(copy)` if a fresh independent copy was handed out instead.
    pub fn register_writer(
        self: &Arc<Self>,
        make_clone: impl FnOnce(&Arc<Self>) -> Arc<Self>,
        on_deferred: impl FnOnce(Arc<Self>) + Send + 'static,
    ) -> Writer {
        if self
            .readers
            .compare_exchange(1, WRITER_HELD, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            let mut deferred = self.deferred.lock();
            debug_assert!(deferred.is_none());
            *deferred = Some(DeferredWriter {
                release: Box::new(on_deferred),
            });
            return Writer::Deferred;
        }
        Writer::Cloned(make_clone(self))
    }

    /// Transitions this copy from writer-held back to a plain `readers = 1` state, for a writer
    /// task that completes without ever being promoted away by a later reader.
    pub fn resolve_writer(self: &Arc<Self>) {
        let _ = self.deferred.lock().take();
        let _ = self
            .readers
            .compare_exchange(WRITER_HELD, 1, Ordering::AcqRel, Ordering::Acquire);
    }

    /// Releases one read-only (or, for a resolved writer, the sole) holder. If the count reaches
    /// zero and no writer is pending, the caller's `drop_payload` runs exactly once.
    ///
    /// If this is the producer releasing its *original* hold and the copy is still
    /// `WRITER_HELD` with nobody having promoted it via [`register_reader`](Self::register_reader),
    /// this call is itself the trigger: the deferred writer never had to share, so it is handed
    /// the original copy directly, with no clone.
    pub fn release(self: &Arc<Self>) {
        if self.readers.load(Ordering::Acquire) == WRITER_HELD {
            if let Some(deferred) = self.deferred.lock().take() {
                (deferred.release)(self.clone());
            }
            return;
        }
        let prev = self.readers.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev > 0, "release() called on a copy with no readers");
        // Dropping the last `Arc` strong reference runs `Drop` for the payload automatically;
        // nothing else to do here. We keep this method so task-table call sites read as "release
        // lowers the reader count" rather than relying on implicit drop order.
        let _ = prev;
    }
}

/// Outcome of [`DataCopy::register_writer`].
pub enum Writer {
    /// The caller's task is now the deferred writer of the original copy.
    Deferred,
    /// The caller's task was handed a freshly cloned, independently-owned copy.
    Cloned(Arc<DataCopy>),
}
