//! Scratch memory scoped to a coroutine's lifetime.
//!
//! Allocations bump a cursor through the current block and are never freed individually.
//! Everything is released at once when the owning coroutine is destroyed.

use std::alloc::{self, Layout};
use std::ptr::NonNull;

/// Additional blocks are at least this aligned.
const BLOCK_ALIGN: usize = 16;

#[derive(Debug)]
pub(super) struct Arena {
    cursor: *mut u8,
    end: *mut u8,
    blocks: Vec<Block>,
    block_size: usize,
    large_threshold: usize,
}

impl Arena {
    /// Bump allocates from [head..head+length] before acquiring heap blocks.
    ///
    /// # Safety
    /// The head region must outlive the arena and must not be used by anything else.
    pub(super) unsafe fn new(
        head: *mut u8,
        length: usize,
        block_size: usize,
        large_threshold: usize,
    ) -> Self {
        Arena {
            cursor: head,
            end: head.add(length),
            blocks: Vec::new(),
            block_size,
            large_threshold,
        }
    }

    /// Returns memory valid until the arena is dropped.
    pub(super) fn alloc(&mut self, layout: Layout) -> NonNull<u8> {
        if let Some(pointer) = self.bump(layout) {
            return pointer;
        }

        // large requests don't waste the rest of the current block
        if layout.size() > self.large_threshold {
            let block = Block::new(layout);
            let pointer = block.pointer;
            self.blocks.push(block);
            return pointer;
        }

        let block = Block::new(
            Layout::from_size_align(
                self.block_size.max(layout.size()),
                layout.align().max(BLOCK_ALIGN),
            )
            .unwrap_or(layout),
        );
        self.cursor = block.pointer.as_ptr();
        self.end = unsafe { self.cursor.add(block.layout.size()) };
        self.blocks.push(block);

        // a fresh block is aligned and large enough for the request
        self.bump(layout)
            .unwrap_or_else(|| alloc::handle_alloc_error(layout))
    }

    /// Number of heap blocks acquired so far.
    #[cfg(test)]
    pub(super) fn blocks(&self) -> usize {
        self.blocks.len()
    }

    /// Bytes left in the current block.
    #[cfg(test)]
    pub(super) fn remaining(&self) -> usize {
        self.end as usize - self.cursor as usize
    }

    fn bump(&mut self, layout: Layout) -> Option<NonNull<u8>> {
        let start = self.cursor as usize;
        let aligned = start.checked_add(layout.align() - 1)? & !(layout.align() - 1);
        let end = aligned.checked_add(layout.size())?;
        if end > self.end as usize {
            return None;
        }

        // derive from cursor to keep provenance
        let pointer = unsafe { self.cursor.add(aligned - start) };
        self.cursor = unsafe { self.cursor.add(end - start) };
        NonNull::new(pointer)
    }
}

/// Heap memory owned by an [Arena].
#[derive(Debug)]
struct Block {
    pointer: NonNull<u8>,
    layout: Layout,
}

impl Block {
    fn new(layout: Layout) -> Self {
        // zero sized layouts are undefined behaviour for the global allocator
        let layout = Layout::from_size_align(layout.size().max(1), layout.align()).unwrap_or(layout);
        let pointer = unsafe { alloc::alloc(layout) };
        let pointer = NonNull::new(pointer).unwrap_or_else(|| alloc::handle_alloc_error(layout));
        Block { pointer, layout }
    }
}

impl Drop for Block {
    fn drop(&mut self) {
        unsafe { alloc::dealloc(self.pointer.as_ptr(), self.layout) };
    }
}
