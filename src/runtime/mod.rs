//! Stackful coroutines driven explicitly on the current thread.
//!
//! Every coroutine owns a native stack, so it can suspend itself from arbitrarily deep in a call chain
//! with [yield_now]. Whoever calls [Coroutine::resume] gets control back at that point.
//! Coroutines may resume other coroutines, forming a chain that unwinds one link per yield.

use std::alloc::Layout;
use std::any::Any;
use std::cell::Cell;
use std::ptr::NonNull;
use std::rc::Rc;
use std::{fmt, hint, io, marker, panic, process, thread};

use crate::Config;

mod arena;
mod context_switch;
mod stack;
mod tls;

/// Runs [f] on a fresh coroutine until it returns, resuming it straight away whenever it yields.
///
/// Failing to allocate the coroutine is reported the same way as a panic.
pub fn start<F: FnOnce() -> T + 'static, T: 'static>(f: F) -> thread::Result<T> {
    let output = Rc::new(Cell::new(None));
    let coroutine = Coroutine::create({
        let output = output.clone();
        move |_| {
            output.set(Some(f()));
            0
        }
    });
    let coroutine = match coroutine {
        Ok(coroutine) => coroutine,
        Err(error) => return Err(Box::new(error)),
    };

    loop {
        match panic::catch_unwind(panic::AssertUnwindSafe(|| coroutine.resume())) {
            Ok(Ok(_)) if coroutine.is_finished() => break,
            Ok(Ok(_)) => continue,
            Ok(Err(error)) => return Err(Box::new(error)),
            Err(payload) => return Err(payload),
        }
    }

    output
        .take()
        .ok_or_else(|| Box::new("coroutine finished without output") as Box<dyn Any + Send>)
}

/// Suspends the running coroutine, handing [value] to whoever resumed it.
///
/// Returns the value passed to the resume call that continues this coroutine.
///
/// # Panics
/// If no coroutine is running on this thread.
pub fn yield_now(value: usize) -> usize {
    let (coroutine, caller) = tls::scheduler(|scheduler| {
        let coroutine = scheduler.running_id();
        scheduler.stats.context_switches += 1;
        let caller = scheduler.running().caller.take();
        (coroutine, caller.expect("running coroutine was resumed by someone"))
    });

    let transfer = unsafe { context_switch::jump(caller, value) };

    // whoever resumed this time is who the next yield goes back to
    tls::scheduler(|scheduler| {
        scheduler.coroutines[coroutine.0].caller = Some(transfer.context);
    });
    transfer.data
}

/// The coroutine currently running on this thread, if any.
pub fn current() -> Option<CoroutineId> {
    tls::scheduler(|scheduler| scheduler.running)
}

/// Allocates scratch memory that lives as long as the running coroutine.
///
/// # Panics
/// If no coroutine is running on this thread.
pub fn scratch_alloc(layout: Layout) -> NonNull<u8> {
    tls::scheduler(|scheduler| scheduler.running().arena.alloc(layout))
}

/// Schedules [f] to run when the running coroutine finishes or gets destroyed.
///
/// Deferred calls run in reverse order of registration.
///
/// # Panics
/// If no coroutine is running on this thread.
pub fn defer<F: FnOnce() + 'static>(f: F) -> DeferHandle {
    tls::scheduler(|scheduler| {
        let coroutine = scheduler.running_id();
        scheduler.defer(coroutine, Box::new(f))
    })
}

/// Replaces this thread's configuration, affecting coroutines created from now on.
pub fn configure(config: Config) {
    tls::scheduler(|scheduler| {
        log::debug!("reconfigured: {config:?}");
        scheduler.config = config;
    });
}

/// Snapshot of this thread's counters.
pub fn stats() -> Stats {
    tls::scheduler(|scheduler| Stats {
        live: scheduler.coroutines.len(),
        pooled_stacks: scheduler.stack_pool.len(),
        ..scheduler.stats
    })
}

/// Per thread coroutine counters.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub struct Stats {
    /// Switches performed by resumes, yields and finishing coroutines.
    pub context_switches: u64,
    pub created: u64,
    pub destroyed: u64,
    /// Coroutines that haven't been destroyed yet.
    pub live: usize,
    /// Stacks waiting to be reused.
    pub pooled_stacks: usize,
}

/// Lifecycle of a coroutine.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Status {
    /// Allocated without a body.
    Idle,
    /// Has a body that hasn't started.
    Fresh,
    Running,
    /// Yielded, waiting to be resumed.
    Suspended,
    /// Body returned or panicked, can be given a new body.
    Finished,
}

/// Identifies a coroutine on its thread.
#[repr(transparent)]
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CoroutineId(usize);

impl fmt::Display for CoroutineId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Registration of a deferred call, see [defer].
///
/// Dropping the handle keeps the call scheduled.
#[derive(Debug)]
pub struct DeferHandle {
    coroutine: CoroutineId,
    key: u64,
    thread_bound: marker::PhantomData<*const ()>,
}

impl DeferHandle {
    /// Unschedules the call without running it.
    ///
    /// Returns false if it already ran or got cancelled.
    pub fn cancel(self) -> bool {
        let deferred = tls::scheduler(|scheduler| scheduler.take_deferred(&self));
        deferred.is_some() // dropped outside the borrow
    }

    /// Runs the call now instead of later.
    ///
    /// Returns false if it already ran or got cancelled.
    pub fn run(self) -> bool {
        match tls::scheduler(|scheduler| scheduler.take_deferred(&self)) {
            Some(deferred) => {
                deferred();
                true
            }
            None => false,
        }
    }
}

/// Owning handle to a coroutine on the current thread.
///
/// Dropping the handle destroys the coroutine.
/// Values still alive on a suspended coroutine's stack are leaked, their destructors never run.
///
/// ```
/// use spool::{runtime, Coroutine};
///
/// let coroutine = Coroutine::create(|x| runtime::yield_now(x + 1) * 2).unwrap();
///
/// assert_eq!(coroutine.resume_with(1).unwrap(), 2);
/// assert_eq!(coroutine.resume_with(21).unwrap(), 42);
/// assert!(coroutine.is_finished());
/// ```
#[derive(Debug)]
pub struct Coroutine {
    id: CoroutineId,
    thread_bound: marker::PhantomData<*const ()>,
}

impl Coroutine {
    /// Allocates a coroutine with the configured stack size and no body.
    pub fn new() -> crate::Result<Self> {
        let stack_size = tls::scheduler(|scheduler| scheduler.config.stack_size);
        Self::with_stack_size(stack_size)
    }

    /// Allocates a coroutine with at least [stack_size] usable stack bytes and no body.
    pub fn with_stack_size(stack_size: usize) -> crate::Result<Self> {
        let id = tls::scheduler(|scheduler| scheduler.create(stack_size))?;
        Ok(Coroutine {
            id,
            thread_bound: marker::PhantomData,
        })
    }

    /// Allocates a coroutine ready to run [f].
    ///
    /// [f] receives the value of the first resume and its output is what the last resume returns.
    pub fn create<F: FnOnce(usize) -> usize + 'static>(f: F) -> crate::Result<Self> {
        let coroutine = Self::new()?;
        coroutine.set(f)?;
        Ok(coroutine)
    }

    pub fn create_with_stack_size<F: FnOnce(usize) -> usize + 'static>(
        f: F,
        stack_size: usize,
    ) -> crate::Result<Self> {
        let coroutine = Self::with_stack_size(stack_size)?;
        coroutine.set(f)?;
        Ok(coroutine)
    }

    /// Gives the coroutine a new body to run, starting over from the top of its stack.
    ///
    /// Can't replace the body of a coroutine that's running or suspended.
    pub fn set<F: FnOnce(usize) -> usize + 'static>(&self, f: F) -> crate::Result<()> {
        let previous = tls::scheduler(|scheduler| scheduler.prime(self.id, Box::new(f)))?;
        drop(previous); // outside the borrow, destructors may touch the scheduler
        Ok(())
    }

    /// Same as [Coroutine::resume_with] zero.
    pub fn resume(&self) -> crate::Result<usize> {
        self.resume_with(0)
    }

    /// Switches to the coroutine until it yields or finishes.
    ///
    /// Returns the yielded value, or the body's output once it finishes.
    /// Only fresh and suspended coroutines can be resumed,
    /// which rules out resuming yourself or anyone waiting on you.
    ///
    /// # Panics
    /// If the body panics, after marking the coroutine as finished.
    pub fn resume_with(&self, value: usize) -> crate::Result<usize> {
        let target = tls::scheduler(|scheduler| scheduler.enter(self.id))?;

        let transfer = unsafe { context_switch::jump(target, value) };

        let payload = tls::scheduler(|scheduler| scheduler.leave(self.id, transfer.context));
        if let Some(payload) = payload {
            panic::resume_unwind(payload);
        }
        Ok(transfer.data)
    }

    /// Schedules [f] to run when this coroutine finishes or gets destroyed.
    ///
    /// Deferred calls run in reverse order of registration, on the coroutine's stack when it finishes.
    pub fn defer<F: FnOnce() + 'static>(&self, f: F) -> DeferHandle {
        tls::scheduler(|scheduler| scheduler.defer(self.id, Box::new(f)))
    }

    /// Runs every scheduled deferred call now, latest first.
    pub fn run_deferred(&self) {
        run_deferred(self.id);
    }

    /// Allocates scratch memory that lives as long as this coroutine.
    pub fn scratch_alloc(&self, layout: Layout) -> NonNull<u8> {
        tls::scheduler(|scheduler| scheduler.coroutines[self.id.0].arena.alloc(layout))
    }

    pub fn status(&self) -> Status {
        tls::scheduler(|scheduler| scheduler.coroutines[self.id.0].status)
    }

    pub fn is_finished(&self) -> bool {
        self.status() == Status::Finished
    }

    pub fn id(&self) -> CoroutineId {
        self.id
    }
}

impl Drop for Coroutine {
    fn drop(&mut self) {
        // thread local is gone when dropped during thread teardown, nothing left to return memory to
        // deferred calls run before the stack goes away, they may read scratch memory
        while let Some(Some(deferred)) =
            tls::try_scheduler(|scheduler| scheduler.pop_deferred(self.id))
        {
            deferred();
        }
        let state = tls::try_scheduler(|scheduler| scheduler.destroy(self.id));
        drop(state); // outside the borrow, destructors may touch the scheduler
    }
}

/// Pops and runs deferred calls until none are left, including those scheduled by deferred calls.
fn run_deferred(coroutine: CoroutineId) {
    while let Some(deferred) = tls::scheduler(|scheduler| scheduler.pop_deferred(coroutine)) {
        deferred();
    }
}

/// First function executed on a coroutine's stack.
extern "C" fn trampoline(transfer: context_switch::Transfer) -> ! {
    let (coroutine, entry) = tls::scheduler(|scheduler| {
        let coroutine = scheduler.running_id();
        let state = scheduler.running();
        state.caller = Some(transfer.context);
        (coroutine, state.entry.take())
    });

    // execute closure
    let result = match entry {
        Some(entry) => panic::catch_unwind(panic::AssertUnwindSafe(|| entry(transfer.data))),
        None => Ok(0),
    };
    let deferred = panic::catch_unwind(panic::AssertUnwindSafe(|| run_deferred(coroutine)));
    let result = result.and_then(|output| deferred.map(|()| output));
    hint::black_box(&result);

    let (caller, output) = tls::scheduler(|scheduler| {
        scheduler.stats.context_switches += 1;
        let state = &mut scheduler.coroutines[coroutine.0];
        state.status = Status::Finished;
        let output = match result {
            Ok(output) => output,
            Err(payload) => {
                state.panic = Some(payload);
                0
            }
        };
        log::trace!("coroutine {coroutine} finished");
        (state.caller.take(), output)
    });

    // return to whoever resumed last, never to be switched back to
    if let Some(caller) = caller {
        unsafe { context_switch::jump(caller, output) };
    }
    log::error!("finished coroutine {coroutine} was switched back to");
    process::abort();
}

/// Owner of every coroutine on a thread.
struct Scheduler {
    coroutines: slab::Slab<CoroutineState>,
    running: Option<CoroutineId>,
    stack_pool: Vec<stack::Stack>,
    /// Key of the next deferred call, unique across the thread so stale handles never match.
    next_defer: u64,
    config: Config,
    stats: Stats,
}

impl Scheduler {
    fn new(config: Config) -> Self {
        Scheduler {
            coroutines: slab::Slab::new(),
            running: None,
            stack_pool: Vec::new(),
            next_defer: 0,
            config,
            stats: Stats::default(),
        }
    }

    fn running_id(&self) -> CoroutineId {
        self.running.expect("called from within a coroutine")
    }

    fn running(&mut self) -> &mut CoroutineState {
        let coroutine = self.running_id();
        &mut self.coroutines[coroutine.0]
    }

    fn head_size(&self) -> Option<usize> {
        self.config.arena_head_size.checked_next_multiple_of(16)
    }

    /// Page aligned bytes needed for a [stack_size] stack plus the arena head.
    fn usable_length(&self, stack_size: usize) -> Option<usize> {
        let head_size = self.head_size()?;
        stack::page_aligned(Config::effective_stack_size(stack_size).checked_add(head_size)?)
    }

    fn create(&mut self, stack_size: usize) -> crate::Result<CoroutineId> {
        let out_of_memory = || crate::Error::StackAllocation(io::ErrorKind::OutOfMemory.into());
        // arena head sits at the very top of the mapping, the stack grows down from below it
        let head_size = self.head_size().ok_or_else(out_of_memory)?;
        let usable = self.usable_length(stack_size).ok_or_else(out_of_memory)?;
        let stack = self
            .acquire_stack(usable)
            .map_err(crate::Error::StackAllocation)?;

        let stack_top = unsafe { stack.base().sub(head_size) };
        let arena = unsafe {
            arena::Arena::new(
                stack_top,
                head_size,
                self.config.arena_block_size,
                self.config.large_alloc_threshold,
            )
        };

        let index = self.coroutines.insert(CoroutineState {
            status: Status::Idle,
            stack: Some(stack),
            stack_top,
            context: None,
            caller: None,
            parent: None,
            entry: None,
            panic: None,
            deferred: Vec::new(),
            arena,
        });
        self.stats.created += 1;

        let coroutine = CoroutineId(index);
        log::trace!("created coroutine {coroutine} with {usable} byte stack");
        Ok(coroutine)
    }

    /// Returns the body being replaced.
    fn prime(&mut self, coroutine: CoroutineId, entry: Entry) -> crate::Result<Option<Entry>> {
        let state = &mut self.coroutines[coroutine.0];
        match state.status {
            Status::Idle | Status::Fresh | Status::Finished => {}
            status => {
                return Err(crate::Error::InvalidStatus {
                    operation: "set",
                    status,
                })
            }
        }

        let size = state.stack_top as usize - state.stack_limit() as usize;
        let context = unsafe { context_switch::make(state.stack_top, size, trampoline) };
        state.context = Some(context);
        state.status = Status::Fresh;
        Ok(state.entry.replace(entry))
    }

    /// Marks [coroutine] as running, returning the context to switch to.
    fn enter(&mut self, coroutine: CoroutineId) -> crate::Result<context_switch::Context> {
        let parent = self.running;
        let state = &mut self.coroutines[coroutine.0];
        match state.status {
            Status::Fresh | Status::Suspended => {}
            status => {
                return Err(crate::Error::InvalidStatus {
                    operation: "resume",
                    status,
                })
            }
        }

        let context = match state.context.take() {
            Some(context) if state.owns(context) => context,
            _ => {
                log::error!("coroutine {coroutine} is out of stack");
                process::abort();
            }
        };

        state.status = Status::Running;
        state.parent = parent;
        self.running = Some(coroutine);
        self.stats.context_switches += 1;
        Ok(context)
    }

    /// Records where [coroutine] stopped, returning its panic if it had one.
    fn leave(
        &mut self,
        coroutine: CoroutineId,
        context: context_switch::Context,
    ) -> Option<Box<dyn Any + Send>> {
        let state = &mut self.coroutines[coroutine.0];
        self.running = state.parent.take();

        if state.status == Status::Running {
            state.status = Status::Suspended;
            state.context = Some(context);
        }
        state.panic.take()
    }

    fn destroy(&mut self, coroutine: CoroutineId) -> CoroutineState {
        if self.coroutines[coroutine.0].status == Status::Running {
            log::error!("coroutine {coroutine} destroyed while running");
            process::abort();
        }

        let mut state = self.coroutines.remove(coroutine.0);
        if let Some(stack) = state.stack.take() {
            self.release_stack(stack);
        }
        self.stats.destroyed += 1;

        log::trace!("destroyed coroutine {coroutine}");
        state
    }

    fn defer(&mut self, coroutine: CoroutineId, deferred: Deferred) -> DeferHandle {
        let key = self.next_defer;
        self.next_defer += 1;
        self.coroutines[coroutine.0].deferred.push((key, deferred));

        DeferHandle {
            coroutine,
            key,
            thread_bound: marker::PhantomData,
        }
    }

    /// Unschedules the call behind [handle], none if it already ran or got cancelled.
    fn take_deferred(&mut self, handle: &DeferHandle) -> Option<Deferred> {
        let state = self.coroutines.get_mut(handle.coroutine.0)?;
        let index = state.deferred.iter().position(|(key, _)| *key == handle.key)?;
        Some(state.deferred.remove(index).1)
    }

    fn pop_deferred(&mut self, coroutine: CoroutineId) -> Option<Deferred> {
        let state = self.coroutines.get_mut(coroutine.0)?;
        state.deferred.pop().map(|(_, deferred)| deferred)
    }

    fn acquire_stack(&mut self, usable: usize) -> io::Result<stack::Stack> {
        let mapped = stack::mapped_length(self.config.guard_pages, usable);
        let pooled = self
            .stack_pool
            .iter()
            .rposition(|stack| stack.length() == usable && Some(stack.mapped_length()) == mapped);

        match pooled {
            Some(index) => Ok(self.stack_pool.swap_remove(index)),
            None => stack::Stack::new(self.config.guard_pages, usable),
        }
    }

    /// Keeps default sized stacks with the configured guard around for reuse, unmaps everything else.
    fn release_stack(&mut self, stack: stack::Stack) {
        let default = self.usable_length(self.config.stack_size);
        let mapped = default.and_then(|usable| stack::mapped_length(self.config.guard_pages, usable));
        let reusable = Some(stack.length()) == default && Some(stack.mapped_length()) == mapped;

        if reusable && self.stack_pool.len() < self.config.stack_pool_capacity {
            log::debug!("pooling {} byte stack", stack.length());
            self.stack_pool.push(stack);
        }
    }
}

type Entry = Box<dyn FnOnce(usize) -> usize>;
type Deferred = Box<dyn FnOnce()>;

struct CoroutineState {
    status: Status,
    /// Taken when the coroutine gets destroyed.
    stack: Option<stack::Stack>,
    /// Highest address the coroutine's frames may use.
    stack_top: *mut u8,
    /// Where to switch to when resumed, present while fresh or suspended.
    context: Option<context_switch::Context>,
    /// Where to switch to when yielding, present while running.
    caller: Option<context_switch::Context>,
    /// Coroutine that was running when this one got resumed.
    parent: Option<CoroutineId>,
    entry: Option<Entry>,
    panic: Option<Box<dyn Any + Send>>,
    /// Keyed by registration, run from the back.
    deferred: Vec<(u64, Deferred)>,
    arena: arena::Arena,
}

impl CoroutineState {
    fn stack_limit(&self) -> *mut u8 {
        self.stack
            .as_ref()
            .map_or(self.stack_top, |stack| stack.limit())
    }

    /// Whether a saved context lies within this coroutine's stack.
    fn owns(&self, context: context_switch::Context) -> bool {
        let range = self.stack_limit() as usize..self.stack_top as usize;
        range.contains(&context.address())
    }
}
