//! A level-triggered flag with a FIFO wait queue.
use std::cell::RefCell;
use std::future::Future;
use std::pin::Pin;
use std::rc::{Rc, Weak};
use std::task::{Context, Poll};

use des_core::Result;

use crate::event_queue::Resume;
use crate::ids::TaskId;
use crate::kernel::Kernel;
use crate::wait::FifoWaitQueue;

struct Inner {
    kernel: Kernel,
    set: bool,
    waiters: FifoWaitQueue,
}

/// `Event`: `set`/`clear`/`is_set`/`wait`. Every waiter parked when
/// `set()` is called is woken in arrival order; a waiter that arrives
/// after the event is already set returns immediately without parking.
#[derive(Clone)]
pub struct Event(Rc<RefCell<Inner>>);

impl Event {
    pub fn new(kernel: &Kernel) -> Self {
        Event(Rc::new(RefCell::new(Inner {
            kernel: kernel.clone(),
            set: false,
            waiters: FifoWaitQueue::default(),
        })))
    }

    pub fn is_set(&self) -> bool {
        self.0.borrow().set
    }

    /// Sets the flag and wakes every currently parked waiter. A no-op
    /// if the flag is already set.
    pub fn set(&self) {
        let mut inner = self.0.borrow_mut();
        if inner.set {
            return;
        }
        inner.set = true;
        let woken = inner.waiters.drain_all();
        let kernel = inner.kernel.clone();
        drop(inner);
        for task in woken {
            kernel.call_soon(task, Resume::Resume);
        }
    }

    pub fn clear(&self) {
        self.0.borrow_mut().set = false;
    }

    pub fn wait(&self) -> EventWait {
        EventWait {
            inner: Rc::downgrade(&self.0),
            task: None,
        }
    }
}

/// Future returned by [`Event::wait`].
pub struct EventWait {
    inner: Weak<RefCell<Inner>>,
    task: Option<TaskId>,
}

impl Future for EventWait {
    type Output = Result<()>;

    fn poll(mut self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Self::Output> {
        let Some(strong) = self.inner.upgrade() else {
            return Poll::Ready(Ok(()));
        };
        let kernel = strong.borrow().kernel.clone();
        let task = *self.task.get_or_insert_with(|| {
            kernel.current_task().expect("wait() polled outside a task")
        });

        if let Some(msg) = kernel.take_pending_cancel(task) {
            return Poll::Ready(Err(des_core::KernelError::Cancelled(msg)));
        }

        if strong.borrow().set {
            return Poll::Ready(Ok(()));
        }

        strong.borrow_mut().waiters.push(task);
        let weak = self.inner.clone();
        kernel.park_task(
            task,
            Box::new(move || {
                if let Some(strong) = weak.upgrade() {
                    strong.borrow_mut().waiters.drop_task(task);
                }
            }),
        );
        Poll::Pending
    }
}
