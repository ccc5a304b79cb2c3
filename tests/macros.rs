#[test]
fn expands() {
    let t = trybuild::TestCases::new();
    t.pass("tests/ui/*.rs");
}

#[spool::start]
#[test]
fn runs_on_coroutine() {
    assert!(spool::runtime::current().is_some());
}

#[spool::start]
#[test]
#[should_panic(expected = "inside")]
fn reraises_panic() {
    panic!("inside");
}
