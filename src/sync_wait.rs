//! Sequential looking code on top of callback based asynchronous APIs.
//!
//! The body runs on its own coroutine and suspends while an operation is in flight.
//! The operation's completion callback resumes it with the result.
//!
//! ```
//! use spool::SyncWait;
//!
//! SyncWait::create(
//!     |wait| {
//!         let reply = wait.wait_for(|completion| completion.complete("pong"));
//!         assert_eq!(reply, Some("pong"));
//!     },
//!     || println!("done"),
//! )
//! .unwrap();
//! ```

use std::cell::Cell;
use std::rc::Rc;
use std::{fmt, panic};

use crate::runtime::{self, Coroutine, CoroutineId};

/// Handle to a body waiting on asynchronous results of type [T].
///
/// Clones refer to the same wait.
pub struct SyncWait<T>(Rc<Shared<T>>);

struct Shared<T> {
    /// Absent while the body runs and once it has finished.
    coroutine: Cell<Option<Coroutine>>,
    id: CoroutineId,
    /// Next yield has to actually suspend.
    armed: Cell<bool>,
    finished: Cell<bool>,
    attached: Cell<Option<T>>,
    finish: Cell<Option<Box<dyn FnOnce()>>>,
}

impl<T: 'static> SyncWait<T> {
    /// Starts running [body] right away, up to its first suspension.
    ///
    /// [finish] is called by whoever resumes the body for the last time.
    /// The coroutine is destroyed once the body returns.
    pub fn create<B, F>(body: B, finish: F) -> crate::Result<()>
    where
        B: FnOnce(SyncWait<T>) + 'static,
        F: FnOnce() + 'static,
    {
        Self::start(Coroutine::new()?, body, finish)
    }

    pub fn create_with_stack_size<B, F>(body: B, finish: F, stack_size: usize) -> crate::Result<()>
    where
        B: FnOnce(SyncWait<T>) + 'static,
        F: FnOnce() + 'static,
    {
        Self::start(Coroutine::with_stack_size(stack_size)?, body, finish)
    }

    fn start<B, F>(coroutine: Coroutine, body: B, finish: F) -> crate::Result<()>
    where
        B: FnOnce(SyncWait<T>) + 'static,
        F: FnOnce() + 'static,
    {
        let wait = SyncWait(Rc::new(Shared {
            coroutine: Cell::new(None),
            id: coroutine.id(),
            armed: Cell::new(false),
            finished: Cell::new(false),
            attached: Cell::new(None),
            finish: Cell::new(Some(Box::new(finish))),
        }));

        coroutine.set({
            let wait = wait.clone();
            move |_| {
                body(wait);
                0
            }
        })?;
        wait.0.coroutine.set(Some(coroutine));

        log::trace!("sync wait on coroutine {} started", wait.0.id);
        wait.drive();
        Ok(())
    }

    /// Hands [result] to the body.
    ///
    /// When the body hasn't reached its [SyncWait::yield_now] yet, the result is stored and nothing switches.
    /// Otherwise the body runs until it suspends again or returns.
    pub fn resume(&self, result: T) {
        if self.0.finished.get() {
            log::warn!("sync wait on coroutine {} resumed after finishing", self.0.id);
            return;
        }

        self.0.attached.set(Some(result));

        // completed synchronously, the pending yield will pick it up
        if self.0.armed.replace(false) {
            return;
        }

        self.drive();
    }

    /// Announces that the next [SyncWait::yield_now] waits for a [SyncWait::resume].
    pub fn yield_before(&self) {
        self.0.armed.set(true);
    }

    /// Waits for the result announced by [SyncWait::yield_before].
    ///
    /// Suspends only if the result hasn't arrived yet.
    ///
    /// # Panics
    /// If it has to suspend from outside the wait's own coroutine.
    pub fn yield_now(&self) -> Option<T> {
        if self.0.armed.get() {
            assert_eq!(
                runtime::current(),
                Some(self.0.id),
                "sync wait suspended outside its own coroutine"
            );
            self.0.armed.set(false);
            runtime::yield_now(0);
        }

        self.0.attached.take()
    }

    /// Starts an operation and waits for it to complete.
    ///
    /// [start] gets a [Completion] to hand to the operation's callback.
    /// Dropping the completion without completing leaves the body suspended forever.
    pub fn wait_for(&self, start: impl FnOnce(Completion<T>)) -> Option<T> {
        self.yield_before();
        start(Completion(self.clone()));
        self.yield_now()
    }

    pub fn is_finished(&self) -> bool {
        self.0.finished.get()
    }

    fn drive(&self) {
        let Some(coroutine) = self.0.coroutine.take() else {
            // resumed by its own body without yield_before, the next yield returns the result
            return;
        };

        let result = panic::catch_unwind(panic::AssertUnwindSafe(|| coroutine.resume()));
        if !coroutine.is_finished() {
            self.0.coroutine.set(Some(coroutine));
            if let Ok(Err(error)) = result {
                log::error!("sync wait on coroutine {} failed to resume: {error}", self.0.id);
            }
            return;
        }

        self.0.finished.set(true);
        log::trace!("sync wait on coroutine {} finished", self.0.id);
        match result {
            Ok(_) => {
                if let Some(finish) = self.0.finish.take() {
                    finish();
                }
                drop(coroutine);
            }
            Err(payload) => {
                drop(coroutine);
                panic::resume_unwind(payload);
            }
        }
    }
}

impl<T> Clone for SyncWait<T> {
    fn clone(&self) -> Self {
        SyncWait(self.0.clone())
    }
}

impl<T> fmt::Debug for SyncWait<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SyncWait")
            .field("coroutine", &self.0.id)
            .field("armed", &self.0.armed.get())
            .field("finished", &self.0.finished.get())
            .finish()
    }
}

/// One shot callback resuming a [SyncWait].
#[derive(Debug)]
pub struct Completion<T>(SyncWait<T>);

impl<T: 'static> Completion<T> {
    pub fn complete(self, result: T) {
        self.0.resume(result);
    }
}

/// For callers arming the wait themselves with [SyncWait::yield_before].
impl<T> From<SyncWait<T>> for Completion<T> {
    fn from(wait: SyncWait<T>) -> Self {
        Completion(wait)
    }
}
