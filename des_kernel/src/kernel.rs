//! The kernel: clock, event queue, task arena, and the dispatch loop.
use std::any::Any;
use std::cell::RefCell;
use std::collections::HashMap;
use std::future::Future;
use std::rc::Rc;
use std::task::{Context, Poll};

use des_core::{KernelError, Result, Time, INIT_TIME, START_TIME};
use log::{debug, trace};
use slab::Slab;

use crate::event_queue::{EventQueue, Resume, ScheduledItem};
use crate::ids::TaskId;
use crate::task::{BoxedTaskFuture, Outcome, TaskSlot, TaskState};
use crate::waker::noop_waker;

/// The kernel's lifecycle state: `Init -> Running -> {Completed,
/// Finished}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KernelState {
    Init,
    Running,
    Completed,
    Finished,
}

/// A limit on how far `run`/`step` should advance the clock.
#[derive(Debug, Clone, Copy)]
pub enum RunLimit {
    /// Relative to the time the kernel is currently at.
    Ticks(u64),
    /// An absolute instant.
    Until(Time),
}

/// What a forked awaitable ultimately resolves into, for `fork`/`join_any`
/// bookkeeping. Every primitive in this kernel (`Event`, `Semaphore`,
/// `Queue`, `Container`, `Singular`/`Aggregate`) is awaited by parking the
/// current task directly, so the only thing `any_of`/`all_of` ever need to
/// race against each other is the child task each branch runs inside —
/// hence a single `Task` variant rather than one per primitive kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitTarget {
    Task(TaskId),
}

pub(crate) struct KernelInner {
    state: KernelState,
    time: Time,
    queue: EventQueue,
    tasks: Slab<TaskSlot>,
    running_task: Option<TaskId>,
    /// Commit callbacks for `Variable`s touched this time slot. Each
    /// `Variable` dedupes its own membership via an internal flag
    /// before pushing here, so a variable written many times in one
    /// slot is only committed once.
    touched: Vec<Box<dyn FnMut()>>,
    /// Targets a task forked off via `fork`, pending a `join_any` that
    /// will cancel whichever of them didn't win the race.
    forks: HashMap<TaskId, Vec<WaitTarget>>,
    finishing: bool,
    limit: Option<Time>,
}

/// A cheap, cloneable handle to a kernel. Every primitive (`Event`,
/// `Semaphore`, `Queue`, `Container`, `Singular`/`Aggregate`) holds one
/// of these directly, so ordinary operations never need to consult the
/// process-wide "current kernel" slot the façade crate keeps for
/// `Waker` plumbing alone (see `des_kernel::waker`).
#[derive(Clone)]
pub struct Kernel(pub(crate) Rc<RefCell<KernelInner>>);

impl Kernel {
    pub fn new() -> Self {
        let inner = KernelInner {
            state: KernelState::Init,
            time: Time(INIT_TIME),
            queue: EventQueue::new(),
            tasks: Slab::new(),
            running_task: None,
            touched: Vec::new(),
            forks: HashMap::new(),
            finishing: false,
            limit: None,
        };
        Kernel(Rc::new(RefCell::new(inner)))
    }

    pub fn state(&self) -> KernelState {
        self.0.borrow().state
    }

    pub fn now(&self) -> Time {
        self.0.borrow().time
    }

    /// Registers a commit callback to run once at the end of the
    /// current time slot. Re-touching an already-touched variable
    /// within the same slot is the caller's responsibility to dedupe
    /// (every `Variable` does, via its own `touched` flag).
    pub(crate) fn touch(&self, commit: Box<dyn FnMut()>) {
        self.0.borrow_mut().touched.push(commit);
    }

    /// Creates and schedules a new task. Before the kernel's first
    /// `run`/`step` call, `inner.time` is still the `INIT` sentinel;
    /// scheduling clamps up to `START_TIME` so tasks mounted up front
    /// (no matter how many) all start together at the first real
    /// instant instead of at a negative one.
    pub fn create_task<R: 'static>(
        &self,
        fut: impl Future<Output = Result<R>> + 'static,
        name: Option<String>,
        priority: i64,
    ) -> TaskId {
        let mut inner = self.0.borrow_mut();
        let boxed = box_task_future(fut);
        let id = TaskId(inner.tasks.insert(TaskSlot::new(name, priority, boxed)));
        let time = inner.time.max(Time(START_TIME));
        enqueue(&mut inner, id, time, Resume::Start);
        id
    }

    /// Schedules `task` to resume at the current time, after the tasks
    /// already queued for it.
    pub fn call_soon(&self, task: TaskId, resume: Resume) {
        let mut inner = self.0.borrow_mut();
        let time = inner.time;
        enqueue(&mut inner, task, time, resume);
    }

    /// Schedules `task` to resume `delay` ticks from now (`delay >= 1`).
    pub fn call_later(&self, delay: u64, task: TaskId, resume: Resume) {
        assert!(delay >= 1, "call_later requires delay >= 1");
        let mut inner = self.0.borrow_mut();
        let time = inner.time + delay;
        enqueue(&mut inner, task, time, resume);
    }

    /// Schedules `task` to resume at the strictly-future instant `when`.
    pub fn call_at(&self, when: Time, task: TaskId, resume: Resume) {
        let mut inner = self.0.borrow_mut();
        assert!(when > inner.time, "call_at requires a strictly future time");
        enqueue(&mut inner, task, when, resume);
    }

    /// Transitions a task to `Waiting` and records a detach callback
    /// for `wait_links`. Called by primitive futures when they park.
    pub(crate) fn park_task(&self, task: TaskId, link: crate::wait::WaitLink) {
        let mut inner = self.0.borrow_mut();
        let slot = &mut inner.tasks[task.index()];
        slot.state = TaskState::Waiting;
        slot.wait_links.push(link);
    }

    /// Takes and clears a pending cancellation request, if any. Every
    /// hand-written suspension future (here and in `des`'s `Sleep`)
    /// checks this on every poll before parking again.
    pub fn take_pending_cancel(&self, task: TaskId) -> Option<Option<String>> {
        self.0.borrow_mut().tasks[task.index()].pending_cancel.take()
    }

    pub fn current_task(&self) -> Option<TaskId> {
        self.0.borrow().running_task
    }

    pub fn task_name(&self, task: TaskId) -> Option<String> {
        self.0.borrow().tasks.get(task.index())?.name.clone()
    }

    pub fn task_priority(&self, task: TaskId) -> i64 {
        self.0.borrow().tasks[task.index()].priority
    }

    pub fn task_state(&self, task: TaskId) -> TaskState {
        self.0.borrow().tasks[task.index()].state
    }

    pub fn task_done(&self, task: TaskId) -> bool {
        self.0.borrow().tasks[task.index()].state.is_done()
    }

    pub(crate) fn task_outcome(&self, task: TaskId) -> Option<Outcome> {
        self.0.borrow().tasks[task.index()].outcome.clone()
    }

    /// The finished result of `task`, downcast to `R`. `None` while the
    /// task is still running; panics if `R` doesn't match the type the
    /// task's future actually produced.
    pub fn task_result<R: 'static>(&self, task: TaskId) -> Option<Result<R>> {
        self.task_outcome(task).map(Outcome::into_result::<R>)
    }

    /// Registers `joiner` to be woken when `target` finishes. Returns
    /// `Some(outcome)` immediately if `target` is already done.
    pub(crate) fn join_or_register(&self, target: TaskId, joiner: TaskId) -> Option<Outcome> {
        let mut inner = self.0.borrow_mut();
        let slot = &mut inner.tasks[target.index()];
        if let Some(outcome) = slot.outcome.clone() {
            Some(outcome)
        } else {
            slot.joiners.push_back(joiner);
            None
        }
    }

    /// Detaches `joiner` from `target`'s joiner list, e.g. because the
    /// joiner itself was cancelled while waiting.
    pub(crate) fn remove_joiner(&self, target: TaskId, joiner: TaskId) {
        let mut inner = self.0.borrow_mut();
        if let Some(slot) = inner.tasks.get_mut(target.index()) {
            if let Some(pos) = slot.joiners.iter().position(|&t| t == joiner) {
                slot.joiners.remove(pos);
            }
        }
    }

    /// Legal when the task is `Waiting` or `Pending`. Detaches it from
    /// every wait queue and the event queue, then reschedules it
    /// immediately with a cancellation.
    pub fn cancel_task(&self, task: TaskId, msg: Option<String>) -> bool {
        let mut inner = self.0.borrow_mut();
        let Some(slot) = inner.tasks.get_mut(task.index()) else {
            return false;
        };
        if !matches!(slot.state, TaskState::Waiting | TaskState::Pending) {
            return false;
        }
        slot.state = TaskState::Cancelling;
        slot.pending_cancel = Some(msg.clone());
        slot.drain_wait_links();
        let time = inner.time;
        enqueue(&mut inner, task, time, Resume::Cancel(msg));
        true
    }

    /// Associates `targets` with `task` so a subsequent `join_any` knows
    /// which of them lost the race and needs cancelling.
    pub fn fork(&self, task: TaskId, targets: Vec<WaitTarget>) {
        self.0.borrow_mut().forks.insert(task, targets);
    }

    /// Called once one of `task`'s forked targets has fired. Cancels
    /// every other forked target still outstanding, then clears the
    /// bookkeeping for `task`.
    pub fn join_any(&self, task: TaskId, winner: WaitTarget) {
        let targets = self.0.borrow_mut().forks.remove(&task).unwrap_or_default();
        for target in targets {
            if target == winner {
                continue;
            }
            let WaitTarget::Task(id) = target;
            self.cancel_task(id, Some("lost the race".into()));
        }
    }

    pub fn finish(&self) {
        self.0.borrow_mut().finishing = true;
    }

    /// Runs the dispatch loop until the queue is empty, `limit` is
    /// reached, or `finish()` is observed.
    pub fn run(&self, limit: Option<RunLimit>) -> Result<()> {
        {
            let mut inner = self.0.borrow_mut();
            if inner.state == KernelState::Completed || inner.state == KernelState::Finished {
                return Err(KernelError::TaskStateError);
            }
            inner.state = KernelState::Running;
            inner.limit = resolve_limit(inner.time, limit);
        }
        loop {
            match self.run_one_slot() {
                StepOutcome::Continue => continue,
                StepOutcome::Stopped => return Ok(()),
            }
        }
    }

    /// Runs one time slot; used by `step()`'s iterator. Returns the
    /// time of the slot just executed, or `None` if the kernel is done
    /// (or stopped at its limit).
    pub fn step_once(&self) -> Option<Time> {
        {
            let mut inner = self.0.borrow_mut();
            if inner.state != KernelState::Running {
                inner.state = KernelState::Running;
            }
        }
        match self.run_one_slot() {
            StepOutcome::Continue => Some(self.0.borrow().time),
            StepOutcome::Stopped => None,
        }
    }

    fn run_one_slot(&self) -> StepOutcome {
        let Some(t) = self.0.borrow().queue_peek_time() else {
            self.0.borrow_mut().state = KernelState::Completed;
            return StepOutcome::Stopped;
        };
        if let Some(limit) = self.0.borrow().limit {
            if t >= limit {
                return StepOutcome::Stopped;
            }
        }
        {
            let mut inner = self.0.borrow_mut();
            assert!(t >= inner.time, "dispatcher tried to move time backward");
            inner.time = t;
        }
        trace!("slot t={t}");
        loop {
            let next_time = self.0.borrow().queue_peek_time();
            if next_time != Some(t) {
                break;
            }
            let item = self.0.borrow_mut().queue_pop().unwrap();
            self.run_item(item);
            if self.0.borrow().finishing {
                self.abort();
                return StepOutcome::Stopped;
            }
        }
        self.commit_touched();
        StepOutcome::Continue
    }

    fn run_item(&self, item: ScheduledItem) {
        let task = item.task;
        trace!("dispatching {task:?} ({:?})", item.resume);
        {
            let mut inner = self.0.borrow_mut();
            let Some(slot) = inner.tasks.get(task.index()) else {
                return;
            };
            if slot.epoch != item.epoch {
                trace!("discarding stale event for {task:?}");
                return;
            }
            inner.running_task = Some(task);
            inner.tasks[task.index()].state = TaskState::Running;
        }

        let mut fut = match self.0.borrow_mut().tasks[task.index()].future.take() {
            Some(fut) => fut,
            None => return,
        };
        let waker = noop_waker();
        let mut cx = Context::from_waker(&waker);
        let poll = fut.as_mut().poll(&mut cx);

        let mut inner = self.0.borrow_mut();
        inner.running_task = None;
        match poll {
            Poll::Pending => {
                let slot = &mut inner.tasks[task.index()];
                slot.future = Some(fut);
                if slot.state == TaskState::Running {
                    // Didn't explicitly park on a primitive (e.g. a
                    // `Sleep` parked purely on the event queue).
                    slot.state = TaskState::Pending;
                }
            }
            Poll::Ready(result) => {
                let outcome = match result {
                    Ok(value) => Outcome::Complete(value),
                    Err(KernelError::Cancelled(msg)) => Outcome::Cancelled(msg),
                    Err(other) => Outcome::Excepted(other),
                };
                let new_state = match &outcome {
                    Outcome::Complete(_) => TaskState::Complete,
                    Outcome::Cancelled(_) => TaskState::Cancelled,
                    Outcome::Excepted(_) => TaskState::Excepted,
                };
                debug!("{task:?} -> {new_state:?}");
                let slot = &mut inner.tasks[task.index()];
                slot.state = new_state;
                slot.outcome = Some(outcome);
                slot.drain_wait_links();
                let joiners: Vec<TaskId> = slot.joiners.drain(..).collect();
                let time = inner.time;
                for joiner in joiners {
                    enqueue(&mut inner, joiner, time, Resume::Resume);
                }
            }
        }
    }

    fn commit_touched(&self) {
        let mut touched = std::mem::take(&mut self.0.borrow_mut().touched);
        for mut commit in touched.drain(..) {
            commit();
        }
    }

    fn abort(&self) {
        let mut inner = self.0.borrow_mut();
        inner.tasks.clear();
        inner.touched.clear();
        inner.forks.clear();
        inner.state = KernelState::Finished;
        inner.finishing = false;
    }
}

impl Default for Kernel {
    fn default() -> Self {
        Self::new()
    }
}

impl KernelInner {
    fn queue_peek_time(&self) -> Option<Time> {
        self.queue.peek_time()
    }

    fn queue_pop(&mut self) -> Option<ScheduledItem> {
        self.queue.pop()
    }
}

enum StepOutcome {
    Continue,
    Stopped,
}

fn resolve_limit(now: Time, limit: Option<RunLimit>) -> Option<Time> {
    match limit {
        None => None,
        Some(RunLimit::Until(t)) => Some(t),
        Some(RunLimit::Ticks(ticks)) => {
            let base = if now.get() < START_TIME { Time(START_TIME) } else { now };
            Some(base + ticks)
        }
    }
}

fn enqueue(inner: &mut KernelInner, task: TaskId, time: Time, resume: Resume) {
    let seq = inner.queue.next_seq();
    let priority = inner.tasks[task.index()].priority;
    let slot = &mut inner.tasks[task.index()];
    slot.epoch += 1;
    let epoch = slot.epoch;
    slot.state = match resume {
        Resume::Cancel(_) => TaskState::Cancelling,
        _ => TaskState::Pending,
    };
    inner.queue.push(ScheduledItem {
        time,
        priority,
        seq,
        task,
        epoch,
        resume,
    });
}

fn box_task_future<R: 'static>(
    fut: impl Future<Output = Result<R>> + 'static,
) -> BoxedTaskFuture {
    Box::pin(async move { fut.await.map(|v| Rc::new(v) as Rc<dyn Any>) })
}
