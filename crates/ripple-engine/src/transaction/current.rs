//! Thread-local current transaction
//!
//! While a leaf transaction is open, its latest state is published here so
//! that `Setable::current` works without an explicit context. Guards nest:
//! closing a leaf restores whatever was open before it.

use std::cell::RefCell;

use ripple_core::{EngineError, EngineResult};

use crate::State;

thread_local! {
    static CURRENT: RefCell<Option<State>> = const { RefCell::new(None) };
}

/// Restores the previous current state on drop
pub(crate) struct CurrentGuard {
    previous: Option<State>,
}

pub(crate) fn open(state: &State) -> CurrentGuard {
    let previous = CURRENT.with(|current| current.replace(Some(state.clone())));
    CurrentGuard { previous }
}

pub(crate) fn publish(state: &State) {
    CURRENT.with(|current| {
        *current.borrow_mut() = Some(state.clone());
    });
}

impl Drop for CurrentGuard {
    fn drop(&mut self) {
        let previous = self.previous.take();
        CURRENT.with(|current| {
            *current.borrow_mut() = previous;
        });
    }
}

/// Run `f` against the state of the transaction open on this thread
pub fn with_state<R>(f: impl FnOnce(&State) -> R) -> EngineResult<R> {
    CURRENT.with(|current| match current.borrow().as_ref() {
        Some(state) => Ok(f(state)),
        None => Err(EngineError::NoCurrentTransaction),
    })
}

pub fn is_open() -> bool {
    CURRENT.with(|current| current.borrow().is_some())
}
