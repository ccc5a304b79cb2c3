//! Stackful coroutines for Linux on x86_64 and aarch64.
//!
//! Each [Coroutine] runs on its own guarded native stack and switches with a handful of instructions.
//! Unlike `async` state machines, a coroutine can suspend from any depth of ordinary function calls,
//! so blocking looking code needs no annotations on the functions in between.
//!
//! Scheduling is strictly cooperative and per thread.
//! A coroutine only gives up control at [runtime::yield_now] and never migrates to another thread.
//!
//! [SyncWait] builds on top of that to drive callback based APIs from sequential code,
//! skipping the context switch entirely when a result is already available.
//!
//! # Example
//! ```
//! use spool::{runtime, Coroutine};
//!
//! let counter = Coroutine::create(|mut n| loop {
//!     n = runtime::yield_now(n + 1);
//! })
//! .unwrap();
//!
//! assert_eq!(counter.resume_with(1).unwrap(), 2);
//! assert_eq!(counter.resume_with(10).unwrap(), 11);
//! ```

#![cfg_attr(feature = "fast_thread_local", feature(thread_local))]

use std::io;

pub mod config;
pub mod runtime;
pub mod sync_wait;

pub use config::Config;
pub use runtime::{Coroutine, CoroutineId, Status};
pub use sync_wait::{Completion, SyncWait};

#[cfg(feature = "macros")]
pub use spool_macros::start;

/// Everything that can go wrong creating and driving coroutines.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("couldn't allocate coroutine stack")]
    StackAllocation(#[source] io::Error),
    #[error("can't {operation} a {status:?} coroutine")]
    InvalidStatus {
        operation: &'static str,
        status: Status,
    },
}

pub type Result<T> = std::result::Result<T, Error>;
