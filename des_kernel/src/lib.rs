//! The single-threaded discrete-event kernel: clock, event queue,
//! task scheduling, and the synchronization primitives built on top of
//! it. See `des` for the task-facing entry points (`run`, `sleep`,
//! `create_task`, ...) built from these pieces.
mod chan;
mod container;
mod event;
mod event_queue;
mod ids;
mod kernel;
mod semaphore;
mod task;
mod task_group;
mod variable;
mod waker;
mod wait;

pub use chan::{Queue, QueueGet, QueuePut};
pub use container::{Container, ContainerGet};
pub use des_core::{KernelError, Result, Time, Tick, INIT_TIME, START_TIME};
pub use event::{Event, EventWait};
pub use event_queue::Resume;
pub use ids::TaskId;
pub use kernel::{Kernel, KernelState, RunLimit, WaitTarget};
pub use semaphore::{Lock, LockAcquire, Semaphore, SemaphoreGet, SemaphoreGuard};
pub use task::TaskState;
pub use task_group::{join_task, IntoTypedJoin, TaskGroup, TypedTaskJoin};
pub use variable::{Aggregate, AggregateChanged, Singular, SingularChanged};
