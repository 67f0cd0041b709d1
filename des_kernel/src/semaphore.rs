//! Counting semaphore and the `Lock` convenience wrapper.
//!
//! `put()` hands a released unit straight to the highest-priority
//! waiter rather than merely incrementing the count and letting
//! getters re-race for it on their next poll: each parked
//! [`SemaphoreGet`] carries an `Rc<Cell<bool>>` "granted" flag, and
//! `put()` flips the winner's flag and reschedules it synchronously,
//! in the same call. That keeps the transfer exact even though many
//! putters and getters may be scheduled in the same time slot.
use std::cell::{Cell, RefCell};
use std::future::Future;
use std::pin::Pin;
use std::rc::{Rc, Weak};
use std::task::{Context, Poll};

use des_core::{KernelError, Result};

use crate::event_queue::Resume;
use crate::ids::TaskId;
use crate::kernel::Kernel;
use crate::wait::PriorityWaitQueue;

struct Inner {
    kernel: Kernel,
    count: i64,
    capacity: Option<i64>,
    waiters: PriorityWaitQueue,
    grants: Vec<(TaskId, Rc<Cell<bool>>)>,
    seq: u64,
}

/// A counting semaphore. `capacity`, if set,
/// bounds `count` and makes an over-`put` an [`KernelError::Overflow`]
/// rather than silently raising the ceiling.
#[derive(Clone)]
pub struct Semaphore(Rc<RefCell<Inner>>);

impl Semaphore {
    pub fn new(kernel: &Kernel, value: i64, capacity: Option<i64>) -> Self {
        Semaphore(Rc::new(RefCell::new(Inner {
            kernel: kernel.clone(),
            count: value,
            capacity,
            waiters: PriorityWaitQueue::default(),
            grants: Vec::new(),
            seq: 0,
        })))
    }

    /// A binary semaphore (`Lock`): starts available, capacity 1.
    pub fn new_lock(kernel: &Kernel) -> Self {
        Semaphore::new(kernel, 1, Some(1))
    }

    pub fn value(&self) -> i64 {
        self.0.borrow().count
    }

    /// Returns immediately with `true` if a unit was free, without
    /// parking. Skips the wait queue entirely, so it can jump ahead of
    /// already-parked getters; use only where that's acceptable.
    pub fn try_get(&self) -> bool {
        let mut inner = self.0.borrow_mut();
        if inner.count > 0 {
            inner.count -= 1;
            true
        } else {
            false
        }
    }

    pub fn get(&self, priority: i64) -> SemaphoreGet {
        SemaphoreGet {
            inner: Rc::downgrade(&self.0),
            priority,
            task: None,
            granted: Rc::new(Cell::new(false)),
            queued: false,
        }
    }

    pub fn put(&self) -> Result<()> {
        let mut inner = self.0.borrow_mut();
        if let Some(cap) = inner.capacity {
            if inner.count >= cap {
                return Err(KernelError::Overflow);
            }
        }
        if let Some(task) = inner.waiters.pop() {
            let pos = inner.grants.iter().position(|(t, _)| *t == task);
            let cell = pos.map(|i| inner.grants.remove(i).1);
            if let Some(cell) = cell {
                cell.set(true);
            }
            let kernel = inner.kernel.clone();
            drop(inner);
            kernel.call_soon(task, Resume::Resume);
        } else {
            inner.count += 1;
        }
        Ok(())
    }
}

/// Future returned by [`Semaphore::get`].
pub struct SemaphoreGet {
    inner: Weak<RefCell<Inner>>,
    priority: i64,
    task: Option<TaskId>,
    granted: Rc<Cell<bool>>,
    queued: bool,
}

impl Future for SemaphoreGet {
    type Output = Result<()>;

    fn poll(mut self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Self::Output> {
        let Some(strong) = self.inner.upgrade() else {
            return Poll::Ready(Err(KernelError::RuntimeError("semaphore dropped".into())));
        };
        let kernel = strong.borrow().kernel.clone();
        let task = *self
            .task
            .get_or_insert_with(|| kernel.current_task().expect("get() polled outside a task"));

        if let Some(msg) = kernel.take_pending_cancel(task) {
            return Poll::Ready(Err(KernelError::Cancelled(msg)));
        }

        if self.granted.get() {
            return Poll::Ready(Ok(()));
        }

        if !self.queued {
            let mut inner = strong.borrow_mut();
            if inner.count > 0 && inner.waiters.is_empty() {
                inner.count -= 1;
                return Poll::Ready(Ok(()));
            }
            let seq = next_seq(&mut inner);
            inner.waiters.push(task, self.priority, seq);
            inner.grants.push((task, self.granted.clone()));
            self.queued = true;
        }

        let weak = self.inner.clone();
        let granted = self.granted.clone();
        kernel.park_task(
            task,
            Box::new(move || {
                if granted.get() {
                    return;
                }
                if let Some(strong) = weak.upgrade() {
                    let mut inner = strong.borrow_mut();
                    inner.waiters.drop_task(task);
                    if let Some(pos) = inner.grants.iter().position(|(t, _)| *t == task) {
                        inner.grants.remove(pos);
                    }
                }
            }),
        );
        Poll::Pending
    }
}

/// Semaphores keep their own arrival counter (rather than sharing the
/// kernel's) so that `put`'s tie-break among equal-priority waiters is
/// independent of unrelated scheduling activity.
fn next_seq(inner: &mut Inner) -> u64 {
    let seq = inner.seq;
    inner.seq += 1;
    seq
}

/// RAII guard released automatically when dropped.
pub struct SemaphoreGuard {
    sem: Semaphore,
    released: bool,
}

impl Drop for SemaphoreGuard {
    fn drop(&mut self) {
        if !self.released {
            let _ = self.sem.put();
        }
    }
}

impl SemaphoreGuard {
    /// Releases the lock early instead of waiting for `Drop`.
    pub fn release(mut self) -> Result<()> {
        self.released = true;
        self.sem.put()
    }
}

/// A binary `Semaphore` used for mutual exclusion; `acquire()` returns
/// a guard rather than requiring a matching `put()`.
#[derive(Clone)]
pub struct Lock(Semaphore);

impl Lock {
    pub fn new(kernel: &Kernel) -> Self {
        Lock(Semaphore::new_lock(kernel))
    }

    pub fn acquire(&self, priority: i64) -> LockAcquire {
        LockAcquire {
            sem: self.0.clone(),
            get: self.0.get(priority),
        }
    }

    pub fn try_acquire(&self) -> Option<SemaphoreGuard> {
        if self.0.try_get() {
            Some(SemaphoreGuard { sem: self.0.clone(), released: false })
        } else {
            None
        }
    }
}

pub struct LockAcquire {
    sem: Semaphore,
    get: SemaphoreGet,
}

impl Future for LockAcquire {
    type Output = Result<SemaphoreGuard>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        match Pin::new(&mut this.get).poll(cx) {
            Poll::Ready(Ok(())) => Poll::Ready(Ok(SemaphoreGuard {
                sem: this.sem.clone(),
                released: false,
            })),
            Poll::Ready(Err(e)) => Poll::Ready(Err(e)),
            Poll::Pending => Poll::Pending,
        }
    }
}
