//! One-shot futures.
//!
//! A `Deferred` fires its registered callbacks exactly once, even when a
//! callback is registered after the result is already known.

use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

type Callback<T> = Box<dyn FnOnce(T) + Send>;

struct DeferredState<T> {
    result: Option<T>,
    callbacks: Vec<Callback<T>>,
}

struct DeferredInner<T> {
    state: Mutex<DeferredState<T>>,
    cond: Condvar,
}

pub struct Deferred<T> {
    inner: Arc<DeferredInner<T>>,
}

impl<T> Clone for Deferred<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Clone + Send + 'static> Deferred<T> {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(DeferredInner {
                state: Mutex::new(DeferredState {
                    result: None,
                    callbacks: Vec::new(),
                }),
                cond: Condvar::new(),
            }),
        }
    }

    /// Settle the result and run every registered callback. A second fire is
    /// ignored.
    pub fn fire(&self, value: T) {
        let callbacks = {
            let Ok(mut state) = self.inner.state.lock() else {
                return;
            };
            if state.result.is_some() {
                return;
            }
            state.result = Some(value.clone());
            self.inner.cond.notify_all();
            std::mem::take(&mut state.callbacks)
        };
        // callbacks run outside the lock
        for callback in callbacks {
            callback(value.clone());
        }
    }

    /// Register a callback; runs immediately if the result is already known.
    pub fn on_result(&self, callback: Callback<T>) {
        let ready = {
            let Ok(mut state) = self.inner.state.lock() else {
                return;
            };
            match &state.result {
                Some(value) => Some(value.clone()),
                None => {
                    state.callbacks.push(callback);
                    return;
                }
            }
        };
        if let Some(value) = ready {
            callback(value);
        }
    }

    pub fn is_fired(&self) -> bool {
        self.inner
            .state
            .lock()
            .map(|state| state.result.is_some())
            .unwrap_or(false)
    }

    /// Block up to `timeout` for the result.
    pub fn wait(&self, timeout: Duration) -> Option<T> {
        let deadline = Instant::now() + timeout;
        let Ok(mut state) = self.inner.state.lock() else {
            return None;
        };
        loop {
            if let Some(value) = &state.result {
                return Some(value.clone());
            }
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            match self.inner.cond.wait_timeout(state, deadline - now) {
                Ok((next, _)) => state = next,
                Err(_) => return None,
            }
        }
    }
}

impl<T: Clone + Send + 'static> Default for Deferred<T> {
    fn default() -> Self {
        Self::new()
    }
}
