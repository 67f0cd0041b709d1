//! `TaskJoin`: awaiting a task's outcome, and `TaskGroup`, a
//! structured-concurrency scope built on top of it.
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use des_core::Result;

use crate::ids::TaskId;
use crate::kernel::Kernel;

/// Resolves with the joined task's outcome, translating
/// cancellation/panics into `Err` the same way the task's own future
/// would have reported them to its own joiners.
pub(crate) struct TaskJoin {
    kernel: Kernel,
    target: TaskId,
    registered: bool,
}

impl TaskJoin {
    pub fn new(kernel: &Kernel, target: TaskId) -> Self {
        TaskJoin {
            kernel: kernel.clone(),
            target,
            registered: false,
        }
    }
}

impl<R: 'static> IntoTypedJoin<R> for TaskJoin {
    fn into_typed(self) -> TypedTaskJoin<R> {
        TypedTaskJoin {
            inner: self,
            _marker: std::marker::PhantomData,
        }
    }
}

/// Implemented for `TaskJoin` so callers can pick the type they expect
/// the task to resolve to: `task_join.into_typed::<MyResult>()`.
pub trait IntoTypedJoin<R> {
    fn into_typed(self) -> TypedTaskJoin<R>;
}

/// A [`TaskJoin`] that downcasts the outcome to `R` on completion.
pub struct TypedTaskJoin<R> {
    inner: TaskJoin,
    _marker: std::marker::PhantomData<R>,
}

impl<R: 'static> Future for TypedTaskJoin<R> {
    type Output = Result<R>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        Pin::new(&mut this.inner).poll(cx).map(|outcome| outcome.into_result::<R>())
    }
}

impl Future for TaskJoin {
    type Output = crate::task::Outcome;

    fn poll(mut self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Self::Output> {
        if !self.registered {
            let joiner = self
                .kernel
                .current_task()
                .expect("join polled outside a task");
            if let Some(outcome) = self.kernel.join_or_register(self.target, joiner) {
                return Poll::Ready(outcome);
            }
            self.registered = true;
            let kernel = self.kernel.clone();
            let target = self.target;
            self.kernel.park_task(
                joiner,
                Box::new(move || kernel.remove_joiner(target, joiner)),
            );
            return Poll::Pending;
        }
        match self.kernel.task_outcome(self.target) {
            Some(outcome) => Poll::Ready(outcome),
            None => Poll::Pending,
        }
    }
}

/// Joins `target`, downcasting its outcome to `R`. The building block
/// behind `des`'s `create_task().await`-style task handles.
pub fn join_task<R: 'static>(kernel: &Kernel, target: TaskId) -> TypedTaskJoin<R> {
    TaskJoin::new(kernel, target).into_typed()
}

/// A structured-concurrency scope: every task `spawn`ed through it is
/// joined, in spawn order, by `join`. The first child to finish with
/// an error or cancellation cancels every child still outstanding and
/// `join` returns that error after all children have settled.
pub struct TaskGroup {
    kernel: Kernel,
    children: Vec<TaskId>,
}

impl TaskGroup {
    pub fn new(kernel: &Kernel) -> Self {
        TaskGroup {
            kernel: kernel.clone(),
            children: Vec::new(),
        }
    }

    pub fn spawn<R: 'static>(
        &mut self,
        fut: impl Future<Output = Result<R>> + 'static,
        name: Option<String>,
        priority: i64,
    ) -> TaskId {
        let id = self.kernel.create_task(fut, name, priority);
        self.children.push(id);
        id
    }

    /// Joins every spawned child in spawn order. On the first error or
    /// cancellation, cancels every child still outstanding, waits for
    /// all of them to settle, then returns that first error.
    pub async fn join(self) -> Result<()> {
        let mut first_error = None;
        for (i, child) in self.children.iter().enumerate() {
            let outcome = TaskJoin::new(&self.kernel, *child).await;
            if first_error.is_none() {
                if let Some(e) = outcome.err() {
                    first_error = Some(e);
                    for later in &self.children[i + 1..] {
                        self.kernel.cancel_task(*later, Some("sibling failed".into()));
                    }
                }
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}
