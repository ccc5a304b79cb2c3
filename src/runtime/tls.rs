//! Thread local storage for the coroutine scheduler.
//!
//! Encapsulates access so that switching to the nightly `#[thread_local]` attribute is a feature flag.
//! Never hold the borrow across a context switch, the other side needs it too.

use std::cell::RefCell;

use super::Scheduler;

/// Cache padded to avoid potential performance hit due to false sharing.
#[repr(align(128))]
struct Local(RefCell<Option<Scheduler>>);

#[cfg(not(feature = "fast_thread_local"))]
thread_local! {
    /// Each thread gets its own independent scheduler.
    static SCHEDULER: Local = Local(RefCell::new(None));
}

/// Borrow the current thread's scheduler, creating it from the environment's config on first use.
#[cfg(not(feature = "fast_thread_local"))]
pub(super) fn scheduler<T>(f: impl FnOnce(&mut Scheduler) -> T) -> T {
    SCHEDULER.with(|thread_local| borrow(&thread_local.0, f))
}

/// Like [scheduler], but gives up once the thread local has been destroyed.
#[cfg(not(feature = "fast_thread_local"))]
pub(super) fn try_scheduler<T>(f: impl FnOnce(&mut Scheduler) -> T) -> Option<T> {
    SCHEDULER
        .try_with(|thread_local| borrow(&thread_local.0, f))
        .ok()
}

#[cfg(feature = "fast_thread_local")]
#[thread_local]
static SCHEDULER: Local = Local(RefCell::new(None));

/// Borrow the current thread's scheduler, creating it from the environment's config on first use.
#[cfg(feature = "fast_thread_local")]
pub(super) fn scheduler<T>(f: impl FnOnce(&mut Scheduler) -> T) -> T {
    borrow(&SCHEDULER.0, f)
}

/// `#[thread_local]` statics are never destroyed.
#[cfg(feature = "fast_thread_local")]
pub(super) fn try_scheduler<T>(f: impl FnOnce(&mut Scheduler) -> T) -> Option<T> {
    Some(borrow(&SCHEDULER.0, f))
}

fn borrow<T>(cell: &RefCell<Option<Scheduler>>, f: impl FnOnce(&mut Scheduler) -> T) -> T {
    let mut cell = cell.borrow_mut();
    let scheduler = cell.get_or_insert_with(|| Scheduler::new(crate::Config::from_env()));
    f(scheduler)
}
