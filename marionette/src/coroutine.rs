//! Resumable units of execution on their own stacks.
//!
//! The entry function is re-entered every time it returns: a return records
//! the result and hands control back, and the next `proceed` starts the entry
//! again from the top. Inside the entry, [`Suspend::yield_now`] hands control
//! back without returning. Hosted C code yields through the
//! [`TransferBlock`], which points at the same shared state.

#[cfg(test)]
mod coroutine_test;

use crate::abi::TransferBlock;
use corosensei::{stack::DefaultStack, CoroutineResult, Yielder};
use std::{
    cell::Cell,
    io,
    os::raw::{c_int, c_void},
    ptr,
    rc::Rc,
    time::{Duration, Instant},
};
use thiserror::Error;
use tracing::{debug, trace, warn};

#[derive(Error, Debug)]
pub enum CoroutineError {
    #[error("Failed to allocate a stack of {size} bytes for coroutine {name}")]
    Stack {
        name: String,
        size: usize,
        #[source]
        source: io::Error,
    },
}

struct CoroutineState {
    running: Cell<bool>,
    /// true while control is on the coroutine's stack
    inside: Cell<bool>,
    stop: Cell<c_int>,
    result: Cell<i32>,
    yielder: Cell<*const Yielder<(), ()>>,
}

impl CoroutineState {
    fn suspend(&self) {
        if !self.inside.get() {
            warn!("Yield requested outside of a running coroutine, ignoring");
            return;
        }

        let yielder = self.yielder.get();
        if yielder.is_null() {
            warn!("Yield requested before the coroutine installed its yielder, ignoring");
            return;
        }

        self.inside.set(false);
        // the yielder lives on the coroutine stack for as long as the body runs
        unsafe { (*yielder).suspend(()) };
    }
}

/// Handle given to the entry function for yielding.
pub struct Suspend {
    state: Rc<CoroutineState>,
}

impl Suspend {
    pub fn yield_now(&self) {
        self.state.suspend();
    }

    pub fn stop_requested(&self) -> bool {
        self.state.stop.get() != 0
    }
}

unsafe extern "C" fn transfer(state: *const c_void) {
    if state.is_null() {
        warn!("Transfer called without a coroutine");
        return;
    }
    (*(state as *const CoroutineState)).suspend();
}

pub struct Coroutine {
    name: String,
    state: Rc<CoroutineState>,
    transfer: Box<TransferBlock>,
    inner: corosensei::Coroutine<(), (), (), DefaultStack>,
    total: Duration,
}

impl Coroutine {
    pub fn new<F>(name: &str, stack_size: usize, mut entry: F) -> Result<Self, CoroutineError>
    where
        F: FnMut(&Suspend) -> i32 + 'static,
    {
        let stack = DefaultStack::new(stack_size).map_err(|source| CoroutineError::Stack {
            name: name.to_string(),
            size: stack_size,
            source,
        })?;

        let state = Rc::new(CoroutineState {
            running: Cell::new(false),
            inside: Cell::new(false),
            stop: Cell::new(0),
            result: Cell::new(-1),
            yielder: Cell::new(ptr::null()),
        });

        let body_state = state.clone();
        let inner = corosensei::Coroutine::with_stack(stack, move |yielder: &Yielder<(), ()>, _input: ()| {
            body_state.yielder.set(yielder as *const Yielder<(), ()>);
            let suspend = Suspend {
                state: body_state.clone(),
            };

            loop {
                body_state.running.set(true);
                let result = entry(&suspend);
                body_state.result.set(result);
                body_state.running.set(false);

                if body_state.stop.get() != 0 {
                    break;
                }
                body_state.inside.set(false);
                yielder.suspend(());
            }

            body_state.yielder.set(ptr::null());
        });

        let transfer = Box::new(TransferBlock {
            state: Rc::as_ptr(&state) as *const c_void,
            transfer,
        });

        debug!(stack_size, "Created coroutine {name}");

        Ok(Self {
            name: name.to_string(),
            state,
            transfer,
            inner,
            total: Duration::ZERO,
        })
    }

    /// Run until the next yield or return. A finished coroutine is left alone.
    pub fn proceed(&mut self) {
        if self.inner.done() {
            warn!("Coroutine {} has finished, not proceeding", self.name);
            return;
        }

        let start = Instant::now();
        self.state.inside.set(true);
        let outcome = self.inner.resume(());
        self.state.inside.set(false);
        let elapsed = start.elapsed();
        self.total += elapsed;

        match outcome {
            CoroutineResult::Yield(()) => trace!(?elapsed, "Coroutine {} yielded", self.name),
            CoroutineResult::Return(()) => debug!(
                result = self.state.result.get(),
                "Coroutine {} finished", self.name
            ),
        }
    }

    /// Ask the entry to finish: its next return ends the coroutine.
    pub fn signal_stop(&self) {
        self.state.stop.set(1);
    }

    /// whether the entry is inside a call that has not returned yet
    pub fn running(&self) -> bool {
        self.state.running.get()
    }

    /// value of the last completed entry call, `-1` before the first
    pub fn result(&self) -> i32 {
        self.state.result.get()
    }

    pub fn total_time(&self) -> Duration {
        self.total
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_finished(&self) -> bool {
        self.inner.done()
    }

    pub(crate) fn transfer_block(&self) -> *const TransferBlock {
        &*self.transfer
    }

    pub(crate) fn stop_flag(&self) -> *const c_int {
        self.state.stop.as_ptr()
    }
}
