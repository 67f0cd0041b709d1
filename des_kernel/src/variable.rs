//! `Singular<T>`/`Aggregate<K, V>`: delta-cycle variables.
//!
//! Writes land in a `next` half that is invisible to every reader
//! until the kernel commits the current time slot; `get` always
//! returns the last *committed* value (`prev`), never a write made
//! earlier in the same slot. This is what makes concurrent assignment
//! inside one time step order-independent: every task in a slot reads
//! the same `prev` no matter how many of them write `next` first.
//!
//! A variable registers its commit closure with
//! [`crate::kernel::Kernel::touch`] at most once per slot (`touched`
//! guards re-registration on repeated writes), and `changed`/`changed_when`
//! park on a [`PredicateWaitQueue`] that the commit closure arms by
//! comparing the old and new committed values.
use std::cell::RefCell;
use std::collections::HashMap;
use std::future::Future;
use std::hash::Hash;
use std::pin::Pin;
use std::rc::{Rc, Weak};
use std::task::{Context, Poll};

use des_core::{KernelError, Result};

use crate::event_queue::Resume;
use crate::ids::TaskId;
use crate::kernel::Kernel;
use crate::wait::PredicateWaitQueue;

type Predicate<T> = Box<dyn Fn(&T, &T) -> bool>;

struct SingularInner<T> {
    kernel: Kernel,
    prev: T,
    next: T,
    touched: bool,
    waiters: PredicateWaitQueue<Predicate<T>>,
}

/// A single delta-cycle variable.
pub struct Singular<T>(Rc<RefCell<SingularInner<T>>>);

impl<T> Clone for Singular<T> {
    fn clone(&self) -> Self {
        Singular(self.0.clone())
    }
}

impl<T: Clone + 'static> Singular<T> {
    pub fn new(kernel: &Kernel, init: T) -> Self {
        Singular(Rc::new(RefCell::new(SingularInner {
            kernel: kernel.clone(),
            prev: init.clone(),
            next: init,
            touched: false,
            waiters: PredicateWaitQueue::default(),
        })))
    }

    /// The last committed value.
    pub fn get(&self) -> T {
        self.0.borrow().prev.clone()
    }

    /// The uncommitted next-phase value: whatever the latest `set` in
    /// the current slot wrote, visible immediately to any reader, not
    /// just after commit.
    pub fn value(&self) -> T {
        self.0.borrow().next.clone()
    }

    /// Writes `value` into the next delta cycle; invisible to `get`
    /// until the current time slot commits.
    pub fn set(&self, value: T) {
        let mut inner = self.0.borrow_mut();
        inner.next = value;
        if !inner.touched {
            inner.touched = true;
            let weak = Rc::downgrade(&self.0);
            inner.kernel.clone().touch(Box::new(move || commit(&weak)));
        }
    }

    /// Waits for a commit after which `predicate(old, new)` holds.
    pub fn changed_when(&self, predicate: impl Fn(&T, &T) -> bool + 'static) -> SingularChanged<T> {
        SingularChanged {
            inner: Rc::downgrade(&self.0),
            predicate: Some(Box::new(predicate)),
            task: None,
        }
    }
}

impl<T: Clone + PartialEq + 'static> Singular<T> {
    /// Waits for the next commit that actually changes the value.
    pub fn changed(&self) -> SingularChanged<T> {
        self.changed_when(|old, new| old != new)
    }
}

fn commit<T: Clone>(weak: &Weak<RefCell<SingularInner<T>>>) {
    let Some(strong) = weak.upgrade() else { return };
    let mut inner = strong.borrow_mut();
    let old = inner.prev.clone();
    inner.prev = inner.next.clone();
    inner.touched = false;
    let new = inner.prev.clone();
    let armed = inner.waiters.take_armed(|pred| pred(&old, &new));
    let kernel = inner.kernel.clone();
    drop(inner);
    for task in armed {
        kernel.call_soon(task, Resume::Resume);
    }
}

pub struct SingularChanged<T> {
    inner: Weak<RefCell<SingularInner<T>>>,
    predicate: Option<Predicate<T>>,
    task: Option<TaskId>,
}

impl<T: 'static> Future for SingularChanged<T> {
    type Output = Result<()>;

    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        let Some(strong) = this.inner.upgrade() else {
            return Poll::Ready(Err(KernelError::RuntimeError("variable dropped".into())));
        };
        let kernel = strong.borrow().kernel.clone();
        let task = *this
            .task
            .get_or_insert_with(|| kernel.current_task().expect("changed() polled outside a task"));

        if let Some(msg) = kernel.take_pending_cancel(task) {
            return Poll::Ready(Err(KernelError::Cancelled(msg)));
        }

        if let Some(predicate) = this.predicate.take() {
            strong.borrow_mut().waiters.push(task, predicate);
            let weak = this.inner.clone();
            kernel.park_task(
                task,
                Box::new(move || {
                    if let Some(strong) = weak.upgrade() {
                        strong.borrow_mut().waiters.drop_task(task);
                    }
                }),
            );
            return Poll::Pending;
        }

        // Re-polled after being armed by a commit.
        Poll::Ready(Ok(()))
    }
}

type AggPredicate<K, V> = Box<dyn Fn(&HashMap<K, V>, &HashMap<K, V>) -> bool>;

struct AggregateInner<K, V> {
    kernel: Kernel,
    committed: HashMap<K, V>,
    pending: HashMap<K, V>,
    touched: bool,
    waiters: PredicateWaitQueue<AggPredicate<K, V>>,
}

/// A named collection of delta-cycle variables committed together,
/// e.g. the fields of one hardware register written by several tasks
/// in the same time slot.
pub struct Aggregate<K, V>(Rc<RefCell<AggregateInner<K, V>>>);

impl<K, V> Clone for Aggregate<K, V> {
    fn clone(&self) -> Self {
        Aggregate(self.0.clone())
    }
}

impl<K: Eq + Hash + Clone + 'static, V: Clone + 'static> Aggregate<K, V> {
    pub fn new(kernel: &Kernel, init: HashMap<K, V>) -> Self {
        Aggregate(Rc::new(RefCell::new(AggregateInner {
            kernel: kernel.clone(),
            pending: init.clone(),
            committed: init,
            touched: false,
            waiters: PredicateWaitQueue::default(),
        })))
    }

    pub fn get(&self, key: &K) -> Option<V> {
        self.0.borrow().committed.get(key).cloned()
    }

    pub fn snapshot(&self) -> HashMap<K, V> {
        self.0.borrow().committed.clone()
    }

    /// The uncommitted next-phase value for `key`: whatever the latest
    /// `set` in the current slot wrote, visible immediately.
    pub fn value(&self, key: &K) -> Option<V> {
        self.0.borrow().pending.get(key).cloned()
    }

    pub fn set(&self, key: K, value: V) {
        let mut inner = self.0.borrow_mut();
        inner.pending.insert(key, value);
        if !inner.touched {
            inner.touched = true;
            let weak = Rc::downgrade(&self.0);
            inner.kernel.clone().touch(Box::new(move || agg_commit(&weak)));
        }
    }

    pub fn changed_when(
        &self,
        predicate: impl Fn(&HashMap<K, V>, &HashMap<K, V>) -> bool + 'static,
    ) -> AggregateChanged<K, V> {
        AggregateChanged {
            inner: Rc::downgrade(&self.0),
            predicate: Some(Box::new(predicate)),
            task: None,
        }
    }
}

fn agg_commit<K: Eq + Hash + Clone, V: Clone>(weak: &Weak<RefCell<AggregateInner<K, V>>>) {
    let Some(strong) = weak.upgrade() else { return };
    let mut inner = strong.borrow_mut();
    let old = inner.committed.clone();
    inner.committed = inner.pending.clone();
    inner.touched = false;
    let new = inner.committed.clone();
    let armed = inner.waiters.take_armed(|pred| pred(&old, &new));
    let kernel = inner.kernel.clone();
    drop(inner);
    for task in armed {
        kernel.call_soon(task, Resume::Resume);
    }
}

pub struct AggregateChanged<K, V> {
    inner: Weak<RefCell<AggregateInner<K, V>>>,
    predicate: Option<AggPredicate<K, V>>,
    task: Option<TaskId>,
}

impl<K: 'static, V: 'static> Future for AggregateChanged<K, V> {
    type Output = Result<()>;

    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        let Some(strong) = this.inner.upgrade() else {
            return Poll::Ready(Err(KernelError::RuntimeError("variable dropped".into())));
        };
        let kernel = strong.borrow().kernel.clone();
        let task = *this
            .task
            .get_or_insert_with(|| kernel.current_task().expect("changed() polled outside a task"));

        if let Some(msg) = kernel.take_pending_cancel(task) {
            return Poll::Ready(Err(KernelError::Cancelled(msg)));
        }

        if let Some(predicate) = this.predicate.take() {
            strong.borrow_mut().waiters.push(task, predicate);
            let weak = this.inner.clone();
            kernel.park_task(
                task,
                Box::new(move || {
                    if let Some(strong) = weak.upgrade() {
                        strong.borrow_mut().waiters.drop_task(task);
                    }
                }),
            );
            return Poll::Pending;
        }

        Poll::Ready(Ok(()))
    }
}
