//! Stack memory for coroutines.

use std::{ffi, io, ptr};

/// Size of a virtual memory page.
pub(super) fn page_size() -> usize {
    unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize }
}

/// Rounds [size] up to a whole number of pages, none if that doesn't fit the address space.
pub(super) fn page_aligned(size: usize) -> Option<usize> {
    let page_size = page_size();
    size.div_ceil(page_size).checked_mul(page_size)
}

/// Length of a mapping holding [guard_pages] plus at least [usable] bytes.
pub(super) fn mapped_length(guard_pages: usize, usable: usize) -> Option<usize> {
    guard_pages
        .checked_mul(page_size())?
        .checked_add(page_aligned(usable)?)
}

#[derive(Debug)]
pub(super) struct Stack {
    pointer: *mut u8,
    length: usize,
    guard_length: usize,
}

impl Stack {
    /// Allocates a general purpose stack with at least [usable] bytes.
    /// Demand paging ensures that physical memory is allocated only as necessary, during a page fault.
    /// The stack is protected from overflow using [guard_pages] guard pages.
    pub(super) fn new(guard_pages: usize, usable: usize) -> io::Result<Self> {
        let length = mapped_length(guard_pages, usable).ok_or(io::ErrorKind::OutOfMemory)?;
        let guard_length = guard_pages * page_size();

        // kernel allocates an unused block of virtual memory
        let pointer = unsafe {
            libc::mmap(
                ptr::null_mut(),
                length,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if pointer == libc::MAP_FAILED {
            let error = io::Error::last_os_error();
            return Err(error);
        }

        // if guarding memory goes wrong then mmap gets cleaned up in Stack's drop
        let stack = Stack {
            pointer: pointer as *mut u8,
            length,
            guard_length,
        };

        // located at the lowest addresses since the stack grows downward
        if guard_length > 0 {
            let result = unsafe { libc::mprotect(pointer, guard_length, libc::PROT_NONE) };
            if result == -1 {
                let error = io::Error::last_os_error();
                return Err(error);
            }
        }

        log::debug!("mapped {} byte stack at {:p}", length, pointer);
        Ok(stack)
    }

    /// Upper address of the stack memory, stack addresses grow downwards.
    pub(super) fn base(&self) -> *mut u8 {
        // safety: part of same allocation, can't overflow
        unsafe { self.pointer.add(self.length) }
    }

    /// Lowest usable address, right above the guard pages.
    pub(super) fn limit(&self) -> *mut u8 {
        unsafe { self.pointer.add(self.guard_length) }
    }

    /// Usable bytes between [limit] and [base].
    pub(super) fn length(&self) -> usize {
        self.length - self.guard_length
    }

    /// Total length of the mapping, including guard pages.
    pub(super) fn mapped_length(&self) -> usize {
        self.length
    }
}

impl Drop for Stack {
    fn drop(&mut self) {
        let result = unsafe { libc::munmap(self.pointer as *mut ffi::c_void, self.length) };
        assert_eq!(result, 0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reads_and_writes() {
        let stack = Stack::new(1, 1).unwrap();
        let pointer = stack.base();
        unsafe {
            let pointer = pointer.sub(1);
            pointer.write(123);
            assert_eq!(pointer.read(), 123);
        }
    }

    #[test]
    fn rounds_up_to_pages() {
        let stack = Stack::new(1, page_size() + 1).unwrap();

        assert_eq!(stack.length(), 2 * page_size());
        assert_eq!(stack.mapped_length(), 3 * page_size());
        assert_eq!(stack.base() as usize - stack.limit() as usize, stack.length());
    }

    #[test]
    fn rejects_unaddressable_length() {
        let error = Stack::new(1, usize::MAX - 1).unwrap_err();

        assert_eq!(error.kind(), io::ErrorKind::OutOfMemory);
        assert_eq!(page_aligned(usize::MAX - 1), None);
        assert_eq!(mapped_length(usize::MAX, 1), None);
    }

    #[test]
    fn unguarded() {
        let stack = Stack::new(0, page_size()).unwrap();

        assert_eq!(stack.limit(), stack.base().wrapping_sub(page_size()));
        unsafe { stack.limit().write(1) };
    }

    #[test]
    #[ignore = "aborts process"]
    fn overflow() {
        let stack = Stack::new(1, 1).unwrap();
        unsafe {
            let pointer = stack.limit().sub(1);
            pointer.write(123);
        }
    }
}
