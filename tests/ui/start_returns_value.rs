#[spool::start]
fn answer(question: String) -> usize {
    question.len() + spool::runtime::current().map_or(0, |_| 30)
}

fn main() {
    assert_eq!(answer("twelve chars".to_string()), 42);
}
