//! The time-indexed, priority-ordered event queue.
//!
//! A min-heap keyed by `(time, priority, seq)`. `seq` is assigned at
//! push time and breaks ties so that two items sharing a `(time,
//! priority)` pair come back out in the order they were pushed.
//!
//! Cancellation needs to remove an arbitrary, already-queued item in
//! less than O(n). Rather than port the reference's position-tracking
//! heap (which needs per-element back-pointers to support that), each
//! push is tagged with the pushing task's current *epoch*; `cancel`
//! bumps the epoch without touching the heap, and the dispatcher
//! silently discards any popped item whose epoch doesn't match the
//! task's current one. A task is therefore still "in at most one
//! logical position" in the queue even though a stale physical entry
//! may still be sitting in the heap waiting to be popped and dropped.
use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;

use des_core::Time;

use crate::ids::TaskId;

/// How a task should be resumed once its turn comes.
#[derive(Debug, Clone)]
pub enum Resume {
    /// First step of the task's future.
    Start,
    /// Re-poll; whatever primitive future woke the task reads its own
    /// satisfied state directly.
    Resume,
    /// The next poll should observe a cancellation.
    Cancel(Option<String>),
}

#[derive(Debug, Clone)]
pub(crate) struct ScheduledItem {
    pub time: Time,
    pub priority: i64,
    pub seq: u64,
    pub task: TaskId,
    pub epoch: u64,
    pub resume: Resume,
}

impl PartialEq for ScheduledItem {
    fn eq(&self, other: &Self) -> bool {
        (self.time, self.priority, self.seq) == (other.time, other.priority, other.seq)
    }
}
impl Eq for ScheduledItem {}

impl PartialOrd for ScheduledItem {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ScheduledItem {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.time, self.priority, self.seq).cmp(&(other.time, other.priority, other.seq))
    }
}

#[derive(Default)]
pub(crate) struct EventQueue {
    heap: BinaryHeap<Reverse<ScheduledItem>>,
    next_seq: u64,
}

impl EventQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    pub fn next_seq(&mut self) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        seq
    }

    pub fn push(&mut self, item: ScheduledItem) {
        self.heap.push(Reverse(item));
    }

    pub fn peek_time(&self) -> Option<Time> {
        self.heap.peek().map(|Reverse(item)| item.time)
    }

    pub fn pop(&mut self) -> Option<ScheduledItem> {
        self.heap.pop().map(|Reverse(item)| item)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item(time: i64, priority: i64, seq: u64, task: usize) -> ScheduledItem {
        ScheduledItem {
            time: Time(time),
            priority,
            seq,
            task: TaskId(task),
            epoch: 0,
            resume: Resume::Start,
        }
    }

    #[test]
    fn pops_in_time_order() {
        let mut q = EventQueue::new();
        q.push(item(5, 0, 0, 0));
        q.push(item(1, 0, 1, 1));
        q.push(item(3, 0, 2, 2));
        assert_eq!(q.pop().unwrap().time, Time(1));
        assert_eq!(q.pop().unwrap().time, Time(3));
        assert_eq!(q.pop().unwrap().time, Time(5));
        assert!(q.is_empty());
    }

    #[test]
    fn breaks_time_ties_by_priority_then_seq() {
        let mut q = EventQueue::new();
        q.push(item(0, 5, 0, 0));
        q.push(item(0, 1, 1, 1));
        q.push(item(0, 1, 2, 2));
        let a = q.pop().unwrap();
        let b = q.pop().unwrap();
        let c = q.pop().unwrap();
        assert_eq!((a.priority, a.seq), (1, 1));
        assert_eq!((b.priority, b.seq), (1, 2));
        assert_eq!((c.priority, c.seq), (5, 0));
    }

    #[test]
    fn peek_time_does_not_consume() {
        let mut q = EventQueue::new();
        q.push(item(7, 0, 0, 0));
        assert_eq!(q.peek_time(), Some(Time(7)));
        assert_eq!(q.peek_time(), Some(Time(7)));
        assert!(q.pop().is_some());
        assert_eq!(q.peek_time(), None);
    }
}
