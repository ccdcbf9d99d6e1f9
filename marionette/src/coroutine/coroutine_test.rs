use super::Coroutine;
use std::{cell::RefCell, rc::Rc};

const STACK: usize = 64 * 1024;

#[test]
pub fn entry_alternates_with_host() {
    let log = Rc::new(RefCell::new(Vec::new()));
    let inner = log.clone();
    let mut coroutine = Coroutine::new("alternate", STACK, move |suspend| {
        inner.borrow_mut().push("a");
        suspend.yield_now();
        inner.borrow_mut().push("b");
        7
    })
    .unwrap();

    assert_eq!(coroutine.result(), -1);
    assert!(!coroutine.running());

    coroutine.proceed();
    assert_eq!(*log.borrow(), ["a"]);
    assert!(coroutine.running());

    coroutine.proceed();
    assert_eq!(*log.borrow(), ["a", "b"]);
    assert!(!coroutine.running());
    assert_eq!(coroutine.result(), 7);

    // the entry is re-entered from the top
    coroutine.proceed();
    assert_eq!(*log.borrow(), ["a", "b", "a"]);
}

#[test]
pub fn stop_ends_after_next_return() {
    let calls = Rc::new(RefCell::new(0));
    let inner = calls.clone();
    let mut coroutine = Coroutine::new("stop", STACK, move |suspend| {
        *inner.borrow_mut() += 1;
        if suspend.stop_requested() {
            0
        } else {
            1
        }
    })
    .unwrap();

    coroutine.proceed();
    assert_eq!(coroutine.result(), 1);
    assert!(!coroutine.is_finished());

    coroutine.signal_stop();
    coroutine.proceed();
    assert_eq!(coroutine.result(), 0);
    assert!(coroutine.is_finished());
    assert!(!coroutine.running());

    coroutine.proceed();
    assert_eq!(*calls.borrow(), 2);
}

#[test]
pub fn total_time_accumulates() {
    let mut coroutine = Coroutine::new("timed", STACK, |_| {
        std::thread::sleep(std::time::Duration::from_millis(2));
        0
    })
    .unwrap();

    coroutine.proceed();
    let first = coroutine.total_time();
    coroutine.proceed();
    assert!(first >= std::time::Duration::from_millis(2));
    assert!(coroutine.total_time() > first);
    assert_eq!(coroutine.name(), "timed");
}

#[test]
pub fn transfer_block_yields_like_suspend() {
    let mut coroutine = Coroutine::new("transfer", STACK, |_| 3).unwrap();

    // outside of the coroutine this is ignored
    let block = unsafe { *coroutine.transfer_block() };
    unsafe { (block.transfer)(block.state) };

    coroutine.proceed();
    assert_eq!(coroutine.result(), 3);
    assert_eq!(unsafe { *coroutine.stop_flag() }, 0);
    coroutine.signal_stop();
    assert_eq!(unsafe { *coroutine.stop_flag() }, 1);
}
