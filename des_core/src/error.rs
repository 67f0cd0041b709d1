//! The kernel's error taxonomy.
//!
//! Every fallible public operation in `des_kernel` and `des` returns
//! [`KernelError`] (or a `Result` aliased over it). There is no separate
//! per-primitive error enum; overflow, bad-value, runtime, task-state,
//! and cancellation failures all collapse into variants here.
use thiserror::Error;

/// The unified error type for all `des` operations.
#[derive(Debug, Error, Clone)]
pub enum KernelError {
    /// A task was cancelled; carries the optional message passed to
    /// `Task::cancel`.
    #[error("task cancelled: {}", .0.as_deref().unwrap_or("no message"))]
    Cancelled(Option<String>),

    /// `result()`/`exception()` was called on a task that hasn't finished,
    /// or `run` was called on a kernel that already reached a terminal
    /// state.
    #[error("task or kernel is not in a state that supports this operation")]
    TaskStateError,

    /// An invalid argument was supplied (bad semaphore value, bad `n` for
    /// a `Container`, `run` with neither a coroutine nor an existing
    /// kernel, ...).
    #[error("invalid value: {0}")]
    ValueError(String),

    /// A `BoundedSemaphore` (or `Lock`) was released past its capacity.
    #[error("semaphore released past capacity")]
    Overflow,

    /// The operation requires a currently-running kernel and none was
    /// found (or the kernel found was not in the `Running` state).
    #[error("no running kernel: {0}")]
    RuntimeError(String),
}

pub type Result<T> = std::result::Result<T, KernelError>;
