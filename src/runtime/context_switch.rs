//! Abstraction over userspace context switching.
//!
//! Provides an implementation for every supported CPU architecture.
//! A context is the block of callee-saved registers that [jump] spills onto the stack it leaves,
//! so the handle is nothing more than the stack pointer of a suspended stack.

use std::arch::global_asm;
use std::ptr::NonNull;

/// Handle to a suspended stack set up for context switching.
#[repr(transparent)]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(super) struct Context(NonNull<()>);

impl Context {
    /// Address of the saved register block.
    pub(super) fn address(self) -> usize {
        self.0.as_ptr() as usize
    }
}

/// What a context switch hands to the side that gets control.
///
/// Returned in two registers and passed to entry functions as their first two arguments.
#[repr(C)]
#[derive(Debug, Copy, Clone)]
pub(super) struct Transfer {
    /// The context that was just left.
    pub(super) context: Context,
    pub(super) data: usize,
}

/// First function executed on a fresh context, must never return.
pub(super) type Entry = extern "C" fn(Transfer) -> !;

/// Function executed on top of a suspended context before it resumes.
pub(super) type OnTop = extern "C" fn(Transfer) -> Transfer;

extern "C" {
    /// Initializes a stack for context switching.
    ///
    /// The first [jump] to the returned context calls [entry] with the jumping context and data word.
    /// [stack_top] is the highest address of the stack, it gets aligned down to 16 bytes.
    #[link_name = "spool_context_make"]
    pub(super) fn make(stack_top: *mut u8, size: usize, entry: Entry) -> Context;

    /// Executes a context switch.
    ///
    /// Spills callee-saved registers onto the current stack and restores [to].
    /// Returns once some other context jumps back to the one left here.
    #[link_name = "spool_context_jump"]
    pub(super) fn jump(to: Context, data: usize) -> Transfer;

    /// Executes a context switch, then calls [on_top] on the target's stack.
    ///
    /// Whatever [on_top] returns is what the target's pending [jump] returns.
    /// [to] must have been suspended by [jump], fresh contexts aren't supported.
    #[allow(dead_code)]
    #[link_name = "spool_context_ontop"]
    pub(super) fn ontop(to: Context, data: usize, on_top: OnTop) -> Transfer;
}

/// Reached when an entry function returns instead of switching away.
extern "C" fn context_finished() -> ! {
    log::error!("coroutine entry function returned, nothing left to switch to");
    std::process::abort();
}

#[cfg(not(target_os = "linux"))]
compile_error!("spool only supports Linux");

#[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
compile_error!("spool only supports x86_64 and aarch64");

#[cfg(all(target_os = "linux", target_arch = "x86_64"))]
global_asm!(
    include_str!("assembly/x86_64.s"),
    finish = sym context_finished,
    options(att_syntax),
);

#[cfg(all(target_os = "linux", target_arch = "aarch64"))]
global_asm!(include_str!("assembly/aarch64.s"), finish = sym context_finished);

#[cfg(test)]
mod tests {
    use std::hint::black_box;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::super::stack::Stack;
    use super::*;

    fn stack() -> Stack {
        Stack::new(1, 16 * 1024).unwrap()
    }

    unsafe fn prepare(stack: &Stack, entry: Entry) -> Context {
        make(stack.base(), stack.length(), entry)
    }

    extern "C" fn increment(mut transfer: Transfer) -> ! {
        loop {
            transfer = unsafe { jump(transfer.context, transfer.data.wrapping_add(1)) };
        }
    }

    #[test]
    fn passes_data_both_ways() {
        let stack = stack();
        let context = unsafe { prepare(&stack, increment) };

        let transfer = unsafe { jump(context, 41) };
        assert_eq!(transfer.data, 42);

        let transfer = unsafe { jump(transfer.context, usize::MAX) };
        assert_eq!(transfer.data, 0);
    }

    #[test]
    fn handle_points_into_target_stack() {
        let stack = stack();
        let context = unsafe { prepare(&stack, increment) };
        let range = stack.limit() as usize..stack.base() as usize;
        assert!(range.contains(&context.address()));

        let transfer = unsafe { jump(context, 0) };
        assert!(range.contains(&transfer.context.address()));
    }

    #[repr(align(16))]
    struct Aligned([u8; 16]);

    extern "C" fn report_alignment(transfer: Transfer) -> ! {
        let probe = black_box(Aligned([0; 16]));
        let misalignment = black_box(&probe) as *const Aligned as usize % 16;
        unsafe { jump(transfer.context, misalignment) };
        unreachable!();
    }

    #[test]
    fn entry_stack_is_aligned() {
        let stack = stack();
        let context = unsafe { prepare(&stack, report_alignment) };

        let transfer = unsafe { jump(context, 0) };

        assert_eq!(transfer.data, 0);
    }

    extern "C" fn accumulate(mut transfer: Transfer) -> ! {
        let mut total = 0.5f64;
        loop {
            total = black_box(total * 2.0);
            transfer = unsafe { jump(transfer.context, total as usize) };
        }
    }

    #[test]
    fn preserves_state_across_switches() {
        let stack = stack();
        let mut context = unsafe { prepare(&stack, accumulate) };

        let local = black_box([7u64; 32]);
        let mut outputs = vec![];
        for _ in 0..4 {
            let transfer = unsafe { jump(context, 0) };
            context = transfer.context;
            outputs.push(transfer.data);
        }

        assert_eq!(outputs, [1, 2, 4, 8]);
        assert_eq!(black_box(local), [7u64; 32]);
    }

    static ON_TOP_SP: AtomicUsize = AtomicUsize::new(0);

    extern "C" fn add_ten(transfer: Transfer) -> Transfer {
        let marker = black_box(0u8);
        ON_TOP_SP.store(&marker as *const u8 as usize, Ordering::SeqCst);
        Transfer {
            context: transfer.context,
            data: transfer.data + 10,
        }
    }

    #[test]
    fn ontop_runs_on_target_stack() {
        let stack = stack();
        let context = unsafe { prepare(&stack, increment) };
        let transfer = unsafe { jump(context, 0) };

        // the target's pending jump returns 15, it answers with 16
        let transfer = unsafe { ontop(transfer.context, 5, add_ten) };

        assert_eq!(transfer.data, 16);
        let range = stack.limit() as usize..stack.base() as usize;
        assert!(range.contains(&ON_TOP_SP.load(Ordering::SeqCst)));
    }
}
