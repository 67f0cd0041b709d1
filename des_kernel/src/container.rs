//! `Container`: a bounded pool of `level` credits, consumed and
//! replenished in arbitrary amounts.
//!
//! Requests are served strictly in arrival order: if the request at
//! the head of the queue can't yet be satisfied, later (even
//! satisfiable) requests wait behind it rather than jumping the queue.
//! That keeps `get` fair at the cost of head-of-line blocking, matching
//! the FIFO discipline used everywhere else in this crate.
use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::rc::{Rc, Weak};
use std::task::{Context, Poll};

use des_core::{KernelError, Result};

use crate::event_queue::Resume;
use crate::ids::TaskId;
use crate::kernel::Kernel;

struct Request {
    task: TaskId,
    amount: i64,
    granted: Rc<Cell<bool>>,
}

struct Inner {
    kernel: Kernel,
    level: i64,
    capacity: i64,
    waiters: VecDeque<Request>,
}

/// A bounded n-credit resource pool.
#[derive(Clone)]
pub struct Container(Rc<RefCell<Inner>>);

impl Container {
    pub fn new(kernel: &Kernel, level: i64, capacity: i64) -> Self {
        Container(Rc::new(RefCell::new(Inner {
            kernel: kernel.clone(),
            level,
            capacity,
            waiters: VecDeque::new(),
        })))
    }

    pub fn level(&self) -> i64 {
        self.0.borrow().level
    }

    pub fn capacity(&self) -> i64 {
        self.0.borrow().capacity
    }

    /// Adds `amount` and serves waiters at the head of the queue while
    /// their request is satisfiable.
    pub fn put(&self, amount: i64) -> Result<()> {
        let mut inner = self.0.borrow_mut();
        if inner.level + amount > inner.capacity {
            return Err(KernelError::Overflow);
        }
        inner.level += amount;
        let mut woken = Vec::new();
        while let Some(front) = inner.waiters.front() {
            if front.amount > inner.level {
                break;
            }
            let req = inner.waiters.pop_front().unwrap();
            inner.level -= req.amount;
            req.granted.set(true);
            woken.push(req.task);
        }
        let kernel = inner.kernel.clone();
        drop(inner);
        for task in woken {
            kernel.call_soon(task, Resume::Resume);
        }
        Ok(())
    }

    /// Returns `true` and deducts `amount` immediately if the queue is
    /// empty and enough is available; otherwise leaves the container
    /// untouched.
    pub fn try_get(&self, amount: i64) -> bool {
        let mut inner = self.0.borrow_mut();
        if inner.waiters.is_empty() && inner.level >= amount {
            inner.level -= amount;
            true
        } else {
            false
        }
    }

    pub fn get(&self, amount: i64) -> ContainerGet {
        ContainerGet {
            inner: Rc::downgrade(&self.0),
            amount,
            task: None,
            granted: Rc::new(Cell::new(false)),
            queued: false,
        }
    }
}

pub struct ContainerGet {
    inner: Weak<RefCell<Inner>>,
    amount: i64,
    task: Option<TaskId>,
    granted: Rc<Cell<bool>>,
    queued: bool,
}

impl Future for ContainerGet {
    type Output = Result<()>;

    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        let Some(strong) = this.inner.upgrade() else {
            return Poll::Ready(Err(KernelError::RuntimeError("container dropped".into())));
        };
        let kernel = strong.borrow().kernel.clone();
        let task = *this
            .task
            .get_or_insert_with(|| kernel.current_task().expect("get() polled outside a task"));

        if let Some(msg) = kernel.take_pending_cancel(task) {
            return Poll::Ready(Err(KernelError::Cancelled(msg)));
        }

        if this.granted.get() {
            return Poll::Ready(Ok(()));
        }

        if !this.queued {
            let mut inner = strong.borrow_mut();
            if inner.waiters.is_empty() && inner.level >= this.amount {
                inner.level -= this.amount;
                return Poll::Ready(Ok(()));
            }
            inner.waiters.push_back(Request {
                task,
                amount: this.amount,
                granted: this.granted.clone(),
            });
            this.queued = true;
        }

        let weak = this.inner.clone();
        let granted = this.granted.clone();
        kernel.park_task(
            task,
            Box::new(move || {
                if granted.get() {
                    return;
                }
                if let Some(strong) = weak.upgrade() {
                    strong.borrow_mut().waiters.retain(|r| r.task != task);
                }
            }),
        );
        Poll::Pending
    }
}
