//! A no-op [`Waker`].
//!
//! This kernel never relies on the generic futures wakeup protocol:
//! every suspension point is a hand-written `Future` that registers
//! itself directly in a [`crate::wait::FifoWaitQueue`] /
//! [`crate::wait::PriorityWaitQueue`] / [`crate::wait::PredicateWaitQueue`]
//! on first poll, and whatever operation satisfies it (`Event::set`,
//! `Semaphore::put`, a `Variable` commit, ...) reschedules the parked
//! task on the kernel's own [`crate::event_queue::EventQueue`]
//! directly — synchronously, in-process, because the whole scheduler
//! is single-threaded and cooperative. The dispatcher is the only
//! thing that ever polls a task, and it always knows which task to
//! poll next by popping the event queue, not by `Waker::wake` calling
//! back into it. A waker is still required to build a `Context` to
//! pass to `Future::poll`; it is simply never used.
use std::task::{RawWaker, RawWakerVTable, Waker};

static VTABLE: RawWakerVTable = RawWakerVTable::new(clone, no_op, no_op, no_op);

unsafe fn clone(_data: *const ()) -> RawWaker {
    RawWaker::new(std::ptr::null(), &VTABLE)
}

unsafe fn no_op(_data: *const ()) {}

pub(crate) fn noop_waker() -> Waker {
    let raw = RawWaker::new(std::ptr::null(), &VTABLE);
    // Safety: the vtable's functions are all no-ops over a null data
    // pointer; none of them ever dereference it.
    unsafe { Waker::from_raw(raw) }
}
