//! Task state machine and the boxed future every task wraps.
use std::any::Any;
use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::rc::Rc;

use des_core::KernelError;

use crate::ids::TaskId;
use crate::wait::WaitLink;

/// `des_core::KernelError` isn't `Clone`-friendly for `Rc<dyn Any>`
/// results, so a finished task's outcome is kept exactly once and
/// handed out by reference/clone to every observer.
#[derive(Clone)]
pub(crate) enum Outcome {
    Complete(Rc<dyn Any>),
    Cancelled(Option<String>),
    Excepted(KernelError),
}

impl Outcome {
    pub fn into_result<R: 'static>(self) -> Result<R, KernelError> {
        match self {
            Outcome::Complete(v) => Ok(*v
                .downcast::<R>()
                .unwrap_or_else(|_| panic!("task result downcast to the wrong type"))),
            Outcome::Cancelled(msg) => Err(KernelError::Cancelled(msg)),
            Outcome::Excepted(e) => Err(e),
        }
    }

    /// Like [`Outcome::into_result`] but for callers that only care
    /// whether the task failed, not its (possibly unrelated) success
    /// value — avoids a downcast that would panic on a type mismatch.
    pub fn err(&self) -> Option<KernelError> {
        match self {
            Outcome::Complete(_) => None,
            Outcome::Cancelled(msg) => Some(KernelError::Cancelled(msg.clone())),
            Outcome::Excepted(e) => Some(e.clone()),
        }
    }
}

/// Task state machine: `Init -> Pending -> Running ->
/// {Pending, Waiting, Complete, Cancelled, Excepted}`, `Waiting ->
/// {Pending, Cancelling}`, `Pending -> Cancelling`, `Cancelling ->
/// Pending`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Init,
    Pending,
    Running,
    Waiting,
    Cancelling,
    Complete,
    Cancelled,
    Excepted,
}

impl TaskState {
    pub fn is_done(self) -> bool {
        matches!(
            self,
            TaskState::Complete | TaskState::Cancelled | TaskState::Excepted
        )
    }
}

pub(crate) type BoxedTaskFuture =
    Pin<Box<dyn Future<Output = Result<Rc<dyn Any>, KernelError>>>>;

/// The kernel-owned control block for one task. Lives in
/// `KernelInner::tasks`, indexed by `TaskId`.
pub(crate) struct TaskSlot {
    pub name: Option<String>,
    pub priority: i64,
    pub state: TaskState,
    pub future: Option<BoxedTaskFuture>,
    pub outcome: Option<Outcome>,
    pub joiners: VecDeque<TaskId>,
    pub wait_links: Vec<WaitLink>,
    /// Bumped every time the task is (re-)pushed onto the event queue,
    /// so stale heap entries left behind by `cancel` are recognizable
    /// and discarded instead of acted on twice.
    pub epoch: u64,
    /// Set by `cancel()`; consumed by whichever primitive future the
    /// task is parked in the next time it's polled.
    pub pending_cancel: Option<Option<String>>,
}

impl TaskSlot {
    pub fn new(name: Option<String>, priority: i64, future: BoxedTaskFuture) -> Self {
        TaskSlot {
            name,
            priority,
            state: TaskState::Init,
            future: Some(future),
            outcome: None,
            joiners: VecDeque::new(),
            wait_links: Vec::new(),
            epoch: 0,
            pending_cancel: None,
        }
    }

    /// Detaches this task from every wait queue it was parked on
    /// (cancellation, or natural cleanup on completion).
    pub fn drain_wait_links(&mut self) {
        for link in self.wait_links.drain(..) {
            link();
        }
    }
}
