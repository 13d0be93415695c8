//! The worker/thread-pool scheduler collaborator: out of scope to specify down to the metal and
//! freely replaceable, but specified as a trait and shipped with a reference fixed-size thread
//! pool, grounded on the same "shared state handed to raw-thread workers via an `mpsc` channel"
//! shape used elsewhere in this workspace for parallel dataflow execution.

use std::sync::mpsc;
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;

use crate::ids::TaskpoolId;
use crate::util::priority_stack::PriorityStack;

/// One task handed to the scheduler once its arguments are complete: its priority and a
/// type-erased thunk running the operator body.
pub struct TaskDescriptor {
    /// The task's firing priority (see `crate::task_table::firing_priority`); higher runs first.
    pub priority: i32,
    /// Runs the already-dispatched operator body. Boxed since different operators' task
    /// descriptors carry different concrete closures.
    pub run: Box<dyn FnOnce() + Send>,
}

/// Handle a [`Scheduler`] hands back to the runtime for coordinating a run. Tracks the number of
/// tasks that have been scheduled but not yet finished
/// running, across every taskpool registered against it; [`Self::wait_idle`] is the fence
/// primitive `World::fence` drives.
pub struct ExecutionContext {
    in_flight: Mutex<usize>,
    idle: Condvar,
}

impl ExecutionContext {
    fn new() -> Self {
        Self {
            in_flight: Mutex::new(0),
            idle: Condvar::new(),
        }
    }

    fn task_scheduled(&self) {
        *self.in_flight.lock().unwrap() += 1;
    }

    fn task_finished(&self) {
        let mut in_flight = self.in_flight.lock().unwrap();
        *in_flight -= 1;
        if *in_flight == 0 {
            self.idle.notify_all();
        }
    }

    /// Blocks the calling thread until every task scheduled against this context so far has run
    /// to completion.
    pub fn wait_idle(&self) {
        let mut in_flight = self.in_flight.lock().unwrap();
        while *in_flight != 0 {
            in_flight = self.idle.wait(in_flight).unwrap();
        }
    }
}

impl Default for ExecutionContext {
    fn default() -> Self {
        Self::new()
    }
}

/// The worker/thread-pool collaborator.
pub trait Scheduler: Send + Sync {
    /// Registers a taskpool (one operator's set of in-flight tasks) as participating in this run.
    fn enqueue_taskpool(&self, tp: TaskpoolId);

    /// Starts worker threads pulling tasks from this scheduler's own execution context, if not
    /// already running.
    fn start(&self);

    /// Blocks until every task scheduled against this scheduler has run, backing `fence()` on the
    /// host thread. Each scheduler owns exactly one [`ExecutionContext`]; `World` never keeps a
    /// separate one of its own, since a second, uncounted context would make this a no-op fence.
    fn wait(&self);

    /// Hands one ready task to the scheduler's ready queue.
    fn schedule(&self, task: TaskDescriptor);
}

enum Message {
    Task(TaskDescriptor),
    Shutdown,
}

struct Shared {
    stack: PriorityStack<TaskDescriptor>,
}

/// A fixed-size pool of `std::thread::JoinHandle` workers pulling from a priority ready queue,
/// fed through `std::sync::mpsc` directly, keeping the external, replaceable scheduler interface
/// thin.
pub struct ThreadPoolScheduler {
    sender: mpsc::Sender<Message>,
    shared: Arc<Mutex<Shared>>,
    ctx: Arc<ExecutionContext>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    worker_count: usize,
}

impl ThreadPoolScheduler {
    /// Builds a scheduler with `worker_count` worker threads; call [`Scheduler::start`] to spawn
    /// them once an [`ExecutionContext`] exists.
    pub fn new(worker_count: usize) -> Arc<Self> {
        let (sender, receiver) = mpsc::channel();
        let shared = Arc::new(Mutex::new(Shared {
            stack: PriorityStack::new(),
        }));
        let this = Arc::new(Self {
            sender,
            shared,
            ctx: Arc::new(ExecutionContext::new()),
            workers: Mutex::new(Vec::new()),
            worker_count: worker_count.max(1),
        });
        this.spawn_dispatcher(receiver);
        this
    }

    /// The default execution context this scheduler drives.
    pub fn default_execution_context(&self) -> Arc<ExecutionContext> {
        Arc::clone(&self.ctx)
    }

    fn spawn_dispatcher(self: &Arc<Self>, receiver: mpsc::Receiver<Message>) {
        let shared = Arc::clone(&self.shared);
        std::thread::spawn(move || {
            for message in receiver {
                match message {
                    Message::Task(task) => {
                        shared.lock().unwrap().stack.push(task.priority, task);
                    }
                    Message::Shutdown => break,
                }
            }
        });
    }
}

impl Scheduler for ThreadPoolScheduler {
    fn enqueue_taskpool(&self, tp: TaskpoolId) {
        tracing::debug!(taskpool = tp.0, "taskpool enqueued");
    }

    fn start(&self) {
        let mut workers = self.workers.lock().unwrap();
        if !workers.is_empty() {
            return;
        }
        for id in 0..self.worker_count {
            let shared = Arc::clone(&self.shared);
            let ctx = Arc::clone(&self.ctx);
            workers.push(
                std::thread::Builder::new()
                    .name(format!("ttg-worker-{id}"))
                    .spawn(move || loop {
                        let task = shared.lock().unwrap().stack.pop();
                        match task {
                            Some(task) => {
                                (task.run)();
                                ctx.task_finished();
                            }
                            None => std::thread::yield_now(),
                        }
                    })
                    .expect("failed to spawn worker thread"),
            );
        }
    }

    fn wait(&self) {
        self.ctx.wait_idle();
    }

    fn schedule(&self, task: TaskDescriptor) {
        self.ctx.task_scheduled();
        self.sender.send(Message::Task(task)).expect("dispatcher thread died");
    }
}

impl Drop for ThreadPoolScheduler {
    fn drop(&mut self) {
        let _ = self.sender.send(Message::Shutdown);
    }
}
