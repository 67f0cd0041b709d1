//! Task-facing entry points for the `des` discrete-event kernel:
//! `Sim` to build and drive a simulation, plus free functions
//! (`now`, `sleep`, `create_task`, `all_of`, `any_of`, ...) that a task's
//! own `async` body calls without needing to thread a `&Kernel` handle
//! through every call.
//!
//! The free functions find their kernel through a thread-local slot,
//! set for the duration of each `Sim::run`/`step_once` call. This
//! mirrors how a single-threaded event loop is the only thing with a
//! notion of "the currently running kernel" at any instant — a real
//! `Waker` would need the same kind of ambient context to know which
//! kernel to wake into, hence `des_kernel::waker` not bothering with one.
use std::cell::RefCell;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

pub use des_core::{KernelError, Result, Tick, Time};
pub use des_kernel::{
    Aggregate, AggregateChanged, Container, ContainerGet, Event, EventWait, Kernel, KernelState,
    Lock, LockAcquire, Queue, QueueGet, QueuePut, Resume, RunLimit, Semaphore, SemaphoreGet,
    SemaphoreGuard, Singular, SingularChanged, TaskGroup, TaskId, TaskState, WaitTarget,
};

thread_local! {
    static CURRENT: RefCell<Option<Kernel>> = const { RefCell::new(None) };
}

/// The kernel the currently executing task belongs to, if any.
pub fn get_kernel() -> Option<Kernel> {
    CURRENT.with(|c| c.borrow().clone())
}

/// Installs `kernel` as the current one, returning whatever was
/// installed before it so the caller can restore it afterwards.
pub fn set_kernel(kernel: Option<Kernel>) -> Option<Kernel> {
    CURRENT.with(|c| c.replace(kernel))
}

/// Like [`get_kernel`], but fails instead of returning `None`.
pub fn get_running_kernel() -> Result<Kernel> {
    get_kernel().ok_or_else(|| KernelError::RuntimeError("no running kernel".into()))
}

fn current_kernel() -> Kernel {
    get_kernel().expect("des: called outside a running kernel")
}

/// The current simulated time.
pub fn now() -> Time {
    current_kernel().now()
}

/// The currently running task, if called from within one.
pub fn get_current_task() -> Option<TaskId> {
    current_kernel().current_task()
}

/// A simulation: owns one [`Kernel`] and installs it as the current
/// one for the duration of every `run`/`step_once` call, so task
/// bodies can use the free functions in this module.
pub struct Sim {
    kernel: Kernel,
}

impl Sim {
    pub fn new() -> Self {
        Sim { kernel: Kernel::new() }
    }

    pub fn kernel(&self) -> &Kernel {
        &self.kernel
    }

    /// Mounts `fut` as a new task. May be called before the first
    /// `run`/`step_once` (every such task starts together at tick 0)
    /// or from within a running task, same as [`create_task`].
    pub fn spawn<R: 'static>(
        &self,
        fut: impl Future<Output = Result<R>> + 'static,
        name: Option<&str>,
        priority: i64,
    ) -> TaskHandle<R> {
        let id = self.kernel.create_task(fut, name.map(String::from), priority);
        TaskHandle { kernel: self.kernel.clone(), id, _marker: std::marker::PhantomData }
    }

    /// Runs until the event queue drains, `limit` is reached, or a
    /// task calls [`finish`].
    pub fn run(&self, limit: Option<RunLimit>) -> Result<()> {
        let prev = set_kernel(Some(self.kernel.clone()));
        let result = self.kernel.run(limit);
        set_kernel(prev);
        result
    }

    /// Runs exactly one time slot. Returns the time just executed, or
    /// `None` once there's nothing left to do.
    pub fn step_once(&self) -> Option<Time> {
        let prev = set_kernel(Some(self.kernel.clone()));
        let result = self.kernel.step_once();
        set_kernel(prev);
        result
    }

    pub fn now(&self) -> Time {
        self.kernel.now()
    }

    pub fn state(&self) -> KernelState {
        self.kernel.state()
    }
}

impl Default for Sim {
    fn default() -> Self {
        Self::new()
    }
}

/// Runs a single task to completion in a fresh [`Sim`] and returns its
/// result. The common case where a simulation has exactly one
/// top-level task; use [`Sim`] directly for anything with several.
pub fn run<R: 'static>(main: impl Future<Output = Result<R>> + 'static) -> Result<R> {
    let sim = Sim::new();
    let handle = sim.spawn(main, Some("main"), 0);
    sim.run(None)?;
    handle
        .kernel
        .task_result(handle.id)
        .expect("main task did not finish even though run() returned")
}

/// Stops the kernel's dispatch loop after the current time slot.
pub fn finish() {
    current_kernel().finish();
}

/// Spawns a new task on the current kernel. Panics outside a running
/// kernel; see [`Sim::spawn`] to mount tasks before `run` begins.
pub fn create_task<R: 'static>(
    fut: impl Future<Output = Result<R>> + 'static,
    name: Option<&str>,
    priority: i64,
) -> TaskHandle<R> {
    let kernel = current_kernel();
    let id = kernel.create_task(fut, name.map(String::from), priority);
    TaskHandle { kernel, id, _marker: std::marker::PhantomData }
}

/// A handle to a spawned task: its identity, plus the ability to
/// cancel or `await` it.
pub struct TaskHandle<R> {
    kernel: Kernel,
    id: TaskId,
    _marker: std::marker::PhantomData<R>,
}

impl<R> Clone for TaskHandle<R> {
    fn clone(&self) -> Self {
        TaskHandle { kernel: self.kernel.clone(), id: self.id, _marker: std::marker::PhantomData }
    }
}

impl<R: 'static> TaskHandle<R> {
    pub fn id(&self) -> TaskId {
        self.id
    }

    pub fn name(&self) -> Option<String> {
        self.kernel.task_name(self.id)
    }

    pub fn state(&self) -> TaskState {
        self.kernel.task_state(self.id)
    }

    pub fn is_done(&self) -> bool {
        self.kernel.task_done(self.id)
    }

    /// Requests cancellation; a no-op if the task isn't currently
    /// `Pending` or `Waiting`.
    pub fn cancel(&self, msg: Option<String>) -> bool {
        self.kernel.cancel_task(self.id, msg)
    }

    /// Waits for the task to finish and returns its result.
    pub fn join(self) -> des_kernel::TypedTaskJoin<R> {
        des_kernel::join_task(&self.kernel, self.id)
    }

    /// The task's result if it has already finished, without waiting.
    /// Useful once a `Sim::run` has returned and every task is settled.
    pub fn result(&self) -> Option<Result<R>> {
        self.kernel.task_result(self.id)
    }
}

/// Suspends the current task for `ticks` simulated time units.
/// `sleep(0)` yields to any other task already scheduled for this
/// instant without advancing the clock.
pub fn sleep(ticks: u64) -> Sleep {
    Sleep { task: None, ticks, scheduled: false }
}

pub struct Sleep {
    task: Option<TaskId>,
    ticks: u64,
    scheduled: bool,
}

impl Future for Sleep {
    type Output = Result<()>;

    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        let kernel = current_kernel();
        let task = *this
            .task
            .get_or_insert_with(|| kernel.current_task().expect("sleep() polled outside a task"));

        if let Some(msg) = kernel.take_pending_cancel(task) {
            return Poll::Ready(Err(KernelError::Cancelled(msg)));
        }

        if this.scheduled {
            return Poll::Ready(Ok(()));
        }
        this.scheduled = true;
        if this.ticks == 0 {
            kernel.call_soon(task, Resume::Resume);
        } else {
            kernel.call_later(this.ticks, task, Resume::Resume);
        }
        Poll::Pending
    }
}

type BoxFuture<R> = Pin<Box<dyn Future<Output = Result<R>>>>;

/// Runs every future concurrently as its own task and waits for all of
/// them, collecting results in the order tasks actually unblock (not
/// submission order). On the first failure, cancels every task still
/// outstanding and returns that error once they've all settled.
pub fn all_of<R: 'static>(futures: Vec<BoxFuture<R>>) -> AllOf<R> {
    let kernel = current_kernel();
    let ids: Vec<TaskId> = futures
        .into_iter()
        .map(|fut| kernel.create_task(fut, None, 0))
        .collect();
    if let Some(joiner) = kernel.current_task() {
        kernel.fork(joiner, ids.iter().map(|&id| WaitTarget::Task(id)).collect());
    }
    let joins = ids
        .iter()
        .map(|id| Some(des_kernel::join_task::<R>(&kernel, *id)))
        .collect();
    AllOf { kernel, ids, joins, results: Vec::new(), first_error: None }
}

pub struct AllOf<R> {
    kernel: Kernel,
    ids: Vec<TaskId>,
    joins: Vec<Option<des_kernel::TypedTaskJoin<R>>>,
    results: Vec<R>,
    first_error: Option<(TaskId, KernelError)>,
}

impl<R: 'static> Future for AllOf<R> {
    type Output = Result<Vec<R>>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        for i in 0..this.joins.len() {
            let Some(join) = &mut this.joins[i] else { continue };
            if let Poll::Ready(result) = Pin::new(join).poll(cx) {
                this.joins[i] = None;
                match result {
                    Ok(value) => this.results.push(value),
                    Err(e) => {
                        if this.first_error.is_none() {
                            this.first_error = Some((this.ids[i], e));
                            if let Some(joiner) = this.kernel.current_task() {
                                this.kernel.join_any(joiner, WaitTarget::Task(this.ids[i]));
                            }
                        }
                    }
                }
            }
        }
        if this.joins.iter().any(Option::is_some) {
            return Poll::Pending;
        }
        if this.first_error.is_none() {
            if let (Some(joiner), Some(&first)) = (this.kernel.current_task(), this.ids.first()) {
                // No task ever failed, so every id is already settled;
                // this just clears the fork bookkeeping for `joiner`.
                this.kernel.join_any(joiner, WaitTarget::Task(first));
            }
        }
        match this.first_error.take() {
            Some((_, e)) => Poll::Ready(Err(e)),
            None => Poll::Ready(Ok(std::mem::take(&mut this.results))),
        }
    }
}

impl<R> Drop for AllOf<R> {
    fn drop(&mut self) {
        for (slot, id) in self.joins.iter().zip(&self.ids) {
            if slot.is_some() {
                self.kernel.cancel_task(*id, Some("all_of dropped".into()));
            }
        }
    }
}

/// Runs every future concurrently as its own task and returns the
/// first to finish, cancelling the rest. Dropping the returned future
/// before it resolves (e.g. because the awaiting task itself was
/// cancelled) cancels every branch that hadn't finished yet.
pub fn any_of<R: 'static>(futures: Vec<BoxFuture<R>>) -> AnyOf<R> {
    let kernel = current_kernel();
    let ids: Vec<TaskId> = futures
        .into_iter()
        .map(|fut| kernel.create_task(fut, None, 0))
        .collect();
    if let Some(joiner) = kernel.current_task() {
        kernel.fork(joiner, ids.iter().map(|&id| WaitTarget::Task(id)).collect());
    }
    let joins = ids
        .iter()
        .map(|id| Some(des_kernel::join_task::<R>(&kernel, *id)))
        .collect();
    AnyOf { kernel, ids, joins }
}

pub struct AnyOf<R> {
    kernel: Kernel,
    ids: Vec<TaskId>,
    joins: Vec<Option<des_kernel::TypedTaskJoin<R>>>,
}

impl<R: 'static> Future for AnyOf<R> {
    type Output = Result<R>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        for i in 0..this.joins.len() {
            let ready = match &mut this.joins[i] {
                Some(join) => Pin::new(join).poll(cx).map(Some),
                None => Poll::Pending,
            };
            if let Poll::Ready(Some(result)) = ready {
                this.joins[i] = None;
                if let Some(joiner) = this.kernel.current_task() {
                    this.kernel.join_any(joiner, WaitTarget::Task(this.ids[i]));
                }
                return Poll::Ready(result);
            }
        }
        Poll::Pending
    }
}

impl<R> Drop for AnyOf<R> {
    fn drop(&mut self) {
        for (slot, id) in self.joins.iter().zip(&self.ids) {
            if slot.is_some() {
                self.kernel.cancel_task(*id, Some("any_of dropped".into()));
            }
        }
    }
}
