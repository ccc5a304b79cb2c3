#[spool::start]
fn main() {
    let value = spool::runtime::yield_now(1);
    assert_eq!(value, 0);
}
