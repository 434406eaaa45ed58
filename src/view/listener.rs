//! Per-view inbound event queue.
//!
//! Every update the manager broadcasts to a view is also fanned out, in
//! broadcast order, to each listener registered on that view. The queue is a
//! strict FIFO; it is never reordered by the client.

use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use crate::core::{FabricError, Key, KeyRange, Result};

#[derive(Debug, Clone, PartialEq)]
pub enum ViewEvent {
    /// A batch of keys whose values changed.
    KeyUpdates(Vec<Key>),
    /// The initial load of this exact range is complete.
    SubscriptionEnd(KeyRange),
}

struct QueueState {
    events: VecDeque<ViewEvent>,
    disconnected: bool,
    woken: bool,
}

pub(crate) struct ListenerQueue {
    state: Mutex<QueueState>,
    cond: Condvar,
}

impl ListenerQueue {
    pub(crate) fn new() -> Self {
        Self {
            state: Mutex::new(QueueState {
                events: VecDeque::new(),
                disconnected: false,
                woken: false,
            }),
            cond: Condvar::new(),
        }
    }

    pub(crate) fn push(&self, event: ViewEvent) {
        if let Ok(mut state) = self.state.lock() {
            state.events.push_back(event);
            self.cond.notify_all();
        }
    }

    pub(crate) fn mark_disconnected(&self) {
        if let Ok(mut state) = self.state.lock() {
            state.disconnected = true;
            self.cond.notify_all();
        }
    }
}

/// A registered consumer of one view's update stream. Clones share the same
/// queue, so a clone can `wake` a blocked `get` on the original.
#[derive(Clone)]
pub struct Listener {
    queue: Arc<ListenerQueue>,
}

impl Listener {
    pub(crate) fn from_queue(queue: Arc<ListenerQueue>) -> Self {
        Self { queue }
    }

    /// Block up to `timeout` for events; returns every queued event in
    /// broadcast order. An empty batch means the wait timed out or the
    /// listener was woken. Fails with `Disconnected` once the view's
    /// transport has dropped and the queue is drained.
    pub fn get(&self, timeout: Duration) -> Result<Vec<ViewEvent>> {
        let deadline = Instant::now() + timeout;
        let mut state = self.queue.state.lock()?;
        loop {
            if !state.events.is_empty() {
                return Ok(state.events.drain(..).collect());
            }
            if state.disconnected {
                return Err(FabricError::Disconnected(
                    "view transport dropped".to_string(),
                ));
            }
            if state.woken {
                state.woken = false;
                return Ok(Vec::new());
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(Vec::new());
            }
            let (next, _) = self.queue.cond.wait_timeout(state, deadline - now)?;
            state = next;
        }
    }

    /// Interrupt a blocked `get`, making it return an empty batch.
    pub fn wake(&self) {
        if let Ok(mut state) = self.queue.state.lock() {
            state.woken = true;
            self.queue.cond.notify_all();
        }
    }

    pub fn is_connected(&self) -> bool {
        self.queue
            .state
            .lock()
            .map(|state| !state.disconnected)
            .unwrap_or(false)
    }
}
