use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;

use spool::{Completion, SyncWait};

type Pending = Rc<RefCell<VecDeque<Completion<usize>>>>;

/// Every operation completes before the body waits on it.
pub fn synchronous(operations: usize) {
    SyncWait::create(
        move |wait: SyncWait<usize>| {
            for i in 0..operations {
                wait.wait_for(|completion| completion.complete(i));
            }
        },
        || {},
    )
    .unwrap();
}

/// Every operation completes later, from outside the body.
pub fn asynchronous(operations: usize) {
    let pending = Pending::default();

    SyncWait::create(
        {
            let pending = pending.clone();
            move |wait: SyncWait<usize>| {
                for _ in 0..operations {
                    wait.wait_for(|completion| pending.borrow_mut().push_back(completion));
                }
            }
        },
        || {},
    )
    .unwrap();

    for i in 0.. {
        let next = pending.borrow_mut().pop_front();
        match next {
            Some(completion) => completion.complete(i),
            None => break,
        }
    }
}
