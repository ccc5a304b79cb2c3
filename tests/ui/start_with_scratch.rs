use std::alloc::Layout;

#[spool::start]
fn main() {
    let scratch = spool::runtime::scratch_alloc(Layout::new::<[u64; 8]>());
    unsafe { scratch.cast::<[u64; 8]>().as_ptr().write([1; 8]) };
}
