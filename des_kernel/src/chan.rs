//! `Queue<T>`: a bounded, FIFO rendezvous channel.
//!
//! A waiting getter and a putter are paired through a single shared
//! slot (`Rc<RefCell<Option<T>>>`) handed out when the pairing is
//! decided, rather than by having the getter re-read a shared buffer
//! on its next poll. That makes the transfer exact: whichever side
//! arrives second performs the actual move of `T` synchronously, so
//! there's no window where a second putter could race in and steal a
//! value already earmarked for a parked getter.
use std::cell::RefCell;
use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::rc::{Rc, Weak};
use std::task::{Context, Poll};

use des_core::{KernelError, Result};

use crate::event_queue::Resume;
use crate::ids::TaskId;
use crate::kernel::Kernel;
use crate::wait::FifoWaitQueue;

type Slot<T> = Rc<RefCell<Option<T>>>;

struct Inner<T> {
    kernel: Kernel,
    capacity: usize,
    buffer: VecDeque<T>,
    getters: FifoWaitQueue,
    get_slots: VecDeque<(TaskId, Slot<T>)>,
    putters: FifoWaitQueue,
    put_slots: VecDeque<(TaskId, Slot<T>)>,
}

/// `Queue<T>`: `put`/`get` rendezvous through a bound
/// buffer of `capacity` (0 means synchronous hand-off with no
/// buffering at all).
pub struct Queue<T>(Rc<RefCell<Inner<T>>>);

impl<T> Clone for Queue<T> {
    fn clone(&self) -> Self {
        Queue(self.0.clone())
    }
}

impl<T: 'static> Queue<T> {
    pub fn new(kernel: &Kernel, capacity: usize) -> Self {
        Queue(Rc::new(RefCell::new(Inner {
            kernel: kernel.clone(),
            capacity,
            buffer: VecDeque::new(),
            getters: FifoWaitQueue::default(),
            get_slots: VecDeque::new(),
            putters: FifoWaitQueue::default(),
            put_slots: VecDeque::new(),
        })))
    }

    pub fn len(&self) -> usize {
        self.0.borrow().buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.borrow().buffer.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.0.borrow().capacity
    }

    pub fn try_get(&self) -> Option<T> {
        let mut inner = self.0.borrow_mut();
        if inner.getters.is_empty() {
            inner.buffer.pop_front()
        } else {
            None
        }
    }

    pub fn try_put(&self, value: T) -> Result<(), T> {
        let mut inner = self.0.borrow_mut();
        if !inner.putters.is_empty() || inner.buffer.len() >= inner.capacity {
            return Err(value);
        }
        inner.buffer.push_back(value);
        wake_one_getter(&mut inner);
        Ok(())
    }

    pub fn get(&self) -> QueueGet<T> {
        QueueGet {
            inner: Rc::downgrade(&self.0),
            task: None,
            slot: None,
        }
    }

    pub fn put(&self, value: T) -> QueuePut<T> {
        QueuePut {
            inner: Rc::downgrade(&self.0),
            task: None,
            value: Some(value),
            slot: None,
        }
    }
}

fn wake_one_getter<T>(inner: &mut Inner<T>) {
    if let Some(task) = inner.getters.pop() {
        if let Some(value) = inner.buffer.pop_front() {
            if let Some(pos) = inner.get_slots.iter().position(|(t, _)| *t == task) {
                let (_, slot) = inner.get_slots.remove(pos).unwrap();
                *slot.borrow_mut() = Some(value);
            } else {
                inner.buffer.push_front(value);
                return;
            }
        }
        let kernel = inner.kernel.clone();
        kernel.call_soon(task, Resume::Resume);
    }
    try_admit_putter(inner);
}

fn try_admit_putter<T>(inner: &mut Inner<T>) {
    if inner.buffer.len() < inner.capacity {
        if let Some(task) = inner.putters.pop() {
            if let Some(pos) = inner.put_slots.iter().position(|(t, _)| *t == task) {
                let (_, slot) = inner.put_slots.remove(pos).unwrap();
                if let Some(value) = slot.borrow_mut().take() {
                    inner.buffer.push_back(value);
                }
            }
            let kernel = inner.kernel.clone();
            kernel.call_soon(task, Resume::Resume);
        }
    }
}

pub struct QueueGet<T> {
    inner: Weak<RefCell<Inner<T>>>,
    task: Option<TaskId>,
    slot: Option<Slot<T>>,
}

impl<T: 'static> Future for QueueGet<T> {
    type Output = Result<T>;

    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        let Some(strong) = this.inner.upgrade() else {
            return Poll::Ready(Err(KernelError::RuntimeError("queue dropped".into())));
        };
        let kernel = strong.borrow().kernel.clone();
        let task = *this
            .task
            .get_or_insert_with(|| kernel.current_task().expect("get() polled outside a task"));

        if let Some(msg) = kernel.take_pending_cancel(task) {
            return Poll::Ready(Err(KernelError::Cancelled(msg)));
        }

        if let Some(slot) = &this.slot {
            if let Some(value) = slot.borrow_mut().take() {
                return Poll::Ready(Ok(value));
            }
            // Parked but not yet paired; keep waiting.
            park(&kernel, task, this.inner.clone(), DetachKind::Getter);
            return Poll::Pending;
        }

        let mut inner = strong.borrow_mut();
        if inner.getters.is_empty() {
            if let Some(value) = inner.buffer.pop_front() {
                try_admit_putter(&mut inner);
                return Poll::Ready(Ok(value));
            }
        }
        let slot: Slot<T> = Rc::new(RefCell::new(None));
        inner.getters.push(task);
        inner.get_slots.push_back((task, slot.clone()));
        this.slot = Some(slot);
        drop(inner);
        park(&kernel, task, this.inner.clone(), DetachKind::Getter);
        Poll::Pending
    }
}

pub struct QueuePut<T> {
    inner: Weak<RefCell<Inner<T>>>,
    task: Option<TaskId>,
    value: Option<T>,
    slot: Option<Slot<T>>,
}

impl<T: 'static> Future for QueuePut<T> {
    type Output = Result<()>;

    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        let Some(strong) = this.inner.upgrade() else {
            return Poll::Ready(Err(KernelError::RuntimeError("queue dropped".into())));
        };
        let kernel = strong.borrow().kernel.clone();
        let task = *this
            .task
            .get_or_insert_with(|| kernel.current_task().expect("put() polled outside a task"));

        if let Some(msg) = kernel.take_pending_cancel(task) {
            return Poll::Ready(Err(KernelError::Cancelled(msg)));
        }

        if let Some(slot) = &this.slot {
            if slot.borrow().is_none() && this.value.is_none() {
                return Poll::Ready(Ok(()));
            }
            park(&kernel, task, this.inner.clone(), DetachKind::Putter);
            return Poll::Pending;
        }

        let mut inner = strong.borrow_mut();
        if inner.putters.is_empty() && inner.buffer.len() < inner.capacity {
            let value = this.value.take().expect("QueuePut polled after completion");
            inner.buffer.push_back(value);
            wake_one_getter(&mut inner);
            return Poll::Ready(Ok(()));
        }
        let slot: Slot<T> = Rc::new(RefCell::new(this.value.take()));
        inner.putters.push(task);
        inner.put_slots.push_back((task, slot.clone()));
        this.slot = Some(slot);
        drop(inner);
        park(&kernel, task, this.inner.clone(), DetachKind::Putter);
        Poll::Pending
    }
}

enum DetachKind {
    Getter,
    Putter,
}

fn park<T: 'static>(kernel: &Kernel, task: TaskId, inner: Weak<RefCell<Inner<T>>>, kind: DetachKind) {
    kernel.park_task(
        task,
        Box::new(move || {
            if let Some(strong) = inner.upgrade() {
                let mut inner = strong.borrow_mut();
                match kind {
                    DetachKind::Getter => {
                        inner.getters.drop_task(task);
                        inner.get_slots.retain(|(t, _)| *t != task);
                    }
                    DetachKind::Putter => {
                        inner.putters.drop_task(task);
                        inner.put_slots.retain(|(t, _)| *t != task);
                    }
                }
            }
        }),
    );
}
