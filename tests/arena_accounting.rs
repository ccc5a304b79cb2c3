use std::alloc::{GlobalAlloc, Layout, System};
use std::sync::atomic::{AtomicUsize, Ordering};

use spool::{runtime, Coroutine};

/// Keeps track of heap bytes currently allocated.
struct Counting;

static ALLOCATED: AtomicUsize = AtomicUsize::new(0);

unsafe impl GlobalAlloc for Counting {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        let pointer = System.alloc(layout);
        if !pointer.is_null() {
            ALLOCATED.fetch_add(layout.size(), Ordering::SeqCst);
        }
        pointer
    }

    unsafe fn dealloc(&self, pointer: *mut u8, layout: Layout) {
        System.dealloc(pointer, layout);
        ALLOCATED.fetch_sub(layout.size(), Ordering::SeqCst);
    }
}

#[global_allocator]
static GLOBAL: Counting = Counting;

fn scratch_heavy(rounds: usize) -> impl FnOnce(usize) -> usize {
    move |_| {
        let mut pointers = Vec::with_capacity(rounds * 2);
        for i in 0..rounds {
            // small requests fill blocks, large ones get their own
            let small = runtime::scratch_alloc(Layout::array::<u8>(100).unwrap());
            let large = runtime::scratch_alloc(Layout::array::<u8>(5000).unwrap());
            unsafe {
                small.as_ptr().write_bytes(i as u8, 100);
                large.as_ptr().write_bytes(i as u8, 5000);
            }
            pointers.push((small, 100));
            pointers.push((large, 5000));
        }

        let intact = pointers.iter().enumerate().all(|(i, &(pointer, length))| {
            let bytes = unsafe { std::slice::from_raw_parts(pointer.as_ptr(), length) };
            bytes.iter().all(|&byte| byte == (i / 2) as u8)
        });
        drop(pointers);

        let in_use = ALLOCATED.load(Ordering::SeqCst);
        runtime::yield_now(in_use);
        usize::from(intact)
    }
}

#[test]
fn destroy_frees_every_block() {
    // scheduler, slab and stack pool allocate once per thread
    for _ in 0..2 {
        let coroutine = Coroutine::create(scratch_heavy(1)).unwrap();
        coroutine.resume().unwrap();
        coroutine.resume().unwrap();
    }
    let baseline = ALLOCATED.load(Ordering::SeqCst);

    let coroutine = Coroutine::create(scratch_heavy(64)).unwrap();
    let in_use = coroutine.resume().unwrap();
    assert!(in_use >= baseline + 64 * (100 + 5000));

    assert_eq!(coroutine.resume().unwrap(), 1);
    drop(coroutine);

    assert_eq!(ALLOCATED.load(Ordering::SeqCst), baseline);
}
