use spool::{runtime, Coroutine};

pub fn create_destroy() {
    let coroutine = Coroutine::create(|x| x).unwrap();
    drop(coroutine);
}

pub fn create_run_destroy() {
    let coroutine = Coroutine::create(|x| x + 1).unwrap();
    coroutine.resume().unwrap();
}

/// Coroutine that yields back whatever it's resumed with, forever.
pub fn echo() -> Coroutine {
    Coroutine::create(|mut value| loop {
        value = runtime::yield_now(value);
    })
    .unwrap()
}

/// One resume plus one yield.
pub fn round_trip(coroutine: &Coroutine, value: usize) -> usize {
    coroutine.resume_with(value).unwrap()
}

/// Resumes [depth] nested coroutines, the innermost yields once.
pub fn nested(depth: usize) -> usize {
    fn level(depth: usize) -> usize {
        if depth == 0 {
            return runtime::yield_now(0);
        }
        let inner = Coroutine::create(move |_| level(depth - 1)).unwrap();
        run_to_completion(&inner)
    }

    let outer = Coroutine::create(move |_| level(depth)).unwrap();
    run_to_completion(&outer)
}

fn run_to_completion(coroutine: &Coroutine) -> usize {
    let mut output = coroutine.resume().unwrap();
    while !coroutine.is_finished() {
        output = coroutine.resume().unwrap();
    }
    output
}
