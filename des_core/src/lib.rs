//! Core time and error types shared by the `des` discrete-event
//! simulation kernel and its façade.
//!
//! This crate has no kernel logic of its own; it exists so that
//! `des_kernel` and `des` (and any future port) agree on one definition
//! of simulation time and one error taxonomy.

mod error;
mod time;

pub use error::{KernelError, Result};
pub use time::{Time, Tick, INIT_TIME, START_TIME};
