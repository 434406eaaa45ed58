//! The client handle onto the keyspace store.
//!
//! A `View` speaks the view protocol over an injected channel. A dedicated
//! receiver thread applies manager broadcasts to the local cache and fans
//! them out to registered listeners; all writes go through a [`Transaction`]
//! and become visible locally only once the manager rebroadcasts them, the
//! same way any other subscriber sees them.

pub mod listener;
pub mod transaction;

pub use listener::{Listener, ViewEvent};
pub use transaction::Transaction;

use std::collections::BTreeMap;
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use log::{debug, info};
use serde_json::Value;

use crate::core::{FabricError, Key, KeyRange, Result, ValueEntry};
use crate::protocol::{ClientMessage, ManagerMessage, ViewChannel};
use listener::ListenerQueue;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    /// Waiting for the manager's Initialize handshake.
    Connecting,
    Connected,
    Disconnected,
}

pub(crate) struct ViewState {
    pub(crate) status: ConnectionStatus,
    pub(crate) client_id: Option<u32>,
    pub(crate) cache: BTreeMap<Key, ValueEntry>,
    pub(crate) subscribed: Vec<KeyRange>,
    loaded: Vec<KeyRange>,
    /// True while a transaction is open: the cache is frozen and inbound
    /// updates are deferred until the transaction ends.
    pub(crate) frozen: bool,
    deferred: Vec<ManagerMessage>,
    pub(crate) pending_writes: BTreeMap<Key, Option<Value>>,
    pub(crate) next_event_id: u64,
    next_flush_id: u64,
    last_completed_flush: u64,
}

pub(crate) struct ViewShared {
    pub(crate) channel: Arc<dyn ViewChannel>,
    pub(crate) state: Mutex<ViewState>,
    pub(crate) cond: Condvar,
    listeners: Mutex<Vec<Arc<ListenerQueue>>>,
}

impl ViewShared {
    pub(crate) fn fan_out(&self, event: ViewEvent) {
        if let Ok(listeners) = self.listeners.lock() {
            for queue in listeners.iter() {
                queue.push(event.clone());
            }
        }
    }

    fn mark_disconnected(&self) {
        if let Ok(mut state) = self.state.lock() {
            state.status = ConnectionStatus::Disconnected;
            self.cond.notify_all();
        }
        if let Ok(listeners) = self.listeners.lock() {
            for queue in listeners.iter() {
                queue.mark_disconnected();
            }
        }
    }

    /// Apply a cache-touching message under the state lock, returning the
    /// listener event it produces.
    fn apply_update_locked(state: &mut ViewState, message: ManagerMessage) -> Option<ViewEvent> {
        match message {
            ManagerMessage::KeyUpdates(events) => {
                let keys: Vec<Key> = events.iter().map(|e| e.key.clone()).collect();
                for event in events {
                    crate::core::apply_event(&mut state.cache, event);
                }
                Some(ViewEvent::KeyUpdates(keys))
            }
            ManagerMessage::SubscriptionEnd(range) => {
                state.loaded.push(range.clone());
                Some(ViewEvent::SubscriptionEnd(range))
            }
            _ => None,
        }
    }

    /// Unfreeze after a transaction: replay updates deferred while frozen.
    /// Returns the listener events to fan out once the lock is released.
    pub(crate) fn unfreeze_locked(&self, state: &mut ViewState) -> Vec<ViewEvent> {
        state.frozen = false;
        let deferred = std::mem::take(&mut state.deferred);
        let events = deferred
            .into_iter()
            .filter_map(|message| Self::apply_update_locked(state, message))
            .collect();
        self.cond.notify_all();
        events
    }

    fn apply_message(&self, message: ManagerMessage) {
        match message {
            ManagerMessage::Bundle(messages) => {
                for inner in messages {
                    self.apply_message(inner);
                }
            }
            ManagerMessage::Initialize {
                client_id,
                base_event_id,
            } => {
                debug!(
                    "view received client id {} (event ids from {})",
                    client_id, base_event_id
                );
                if let Ok(mut state) = self.state.lock() {
                    state.client_id = Some(client_id);
                    state.next_event_id = base_event_id;
                    state.status = ConnectionStatus::Connected;
                    self.cond.notify_all();
                }
            }
            ManagerMessage::MinimumId { ping_id } => {
                let min_event_id = self
                    .state
                    .lock()
                    .map(|state| state.next_event_id + 1)
                    .unwrap_or(0);
                let _ = self.channel.send(ClientMessage::MinimumIdResponse {
                    ping_id,
                    min_event_id,
                });
            }
            ManagerMessage::FlushResponse { flush_id } => {
                if let Ok(mut state) = self.state.lock() {
                    state.last_completed_flush = state.last_completed_flush.max(flush_id);
                    self.cond.notify_all();
                }
            }
            update @ (ManagerMessage::KeyUpdates(_) | ManagerMessage::SubscriptionEnd(_)) => {
                let event = {
                    let Ok(mut state) = self.state.lock() else {
                        return;
                    };
                    if state.frozen {
                        state.deferred.push(update);
                        None
                    } else {
                        let event = Self::apply_update_locked(&mut state, update);
                        self.cond.notify_all();
                        event
                    }
                };
                if let Some(event) = event {
                    self.fan_out(event);
                }
            }
        }
    }

    pub(crate) fn ensure_subscribed(state: &ViewState, key: &Key) -> Result<()> {
        if state.subscribed.iter().any(|range| range.contains(key)) {
            Ok(())
        } else {
            Err(FabricError::NotSubscribed(key.to_string()))
        }
    }
}

/// A client's subscribable, transactional handle onto the keyspace store.
pub struct View {
    shared: Arc<ViewShared>,
    receiver: Mutex<Option<JoinHandle<()>>>,
}

impl View {
    /// Connect over an established channel. The manager side is expected to
    /// answer with an Initialize handshake carrying this view's client id.
    pub fn connect(channel: Arc<dyn ViewChannel>) -> View {
        Self::connect_inner(channel, None)
    }

    /// Connect and present a bearer token for authorization.
    pub fn connect_with_token(channel: Arc<dyn ViewChannel>, token: &str) -> View {
        Self::connect_inner(channel, Some(token.to_string()))
    }

    fn connect_inner(channel: Arc<dyn ViewChannel>, token: Option<String>) -> View {
        let shared = Arc::new(ViewShared {
            channel,
            state: Mutex::new(ViewState {
                status: ConnectionStatus::Connecting,
                client_id: None,
                cache: BTreeMap::new(),
                subscribed: Vec::new(),
                loaded: Vec::new(),
                frozen: false,
                deferred: Vec::new(),
                pending_writes: BTreeMap::new(),
                next_event_id: 0,
                next_flush_id: 0,
                last_completed_flush: 0,
            }),
            cond: Condvar::new(),
            listeners: Mutex::new(Vec::new()),
        });

        if let Some(token) = token {
            if let Err(err) = shared.channel.send(ClientMessage::Authorize { token }) {
                info!("failed to send authorization: {}", err);
                shared.mark_disconnected();
            }
        }

        let receiver_shared = Arc::clone(&shared);
        let receiver = std::thread::Builder::new()
            .name("view-receiver".to_string())
            .spawn(move || {
                loop {
                    match receiver_shared.channel.recv() {
                        Ok(message) => receiver_shared.apply_message(message),
                        Err(_) => {
                            receiver_shared.mark_disconnected();
                            return;
                        }
                    }
                }
            })
            .expect("failed to spawn view receiver thread");

        View {
            shared,
            receiver: Mutex::new(Some(receiver)),
        }
    }

    /// Block up to `timeout` for the Initialize handshake. Returns whether
    /// the view is connected.
    pub fn wait_connect(&self, timeout: Duration) -> Result<bool> {
        let deadline = Instant::now() + timeout;
        let mut state = self.shared.state.lock()?;
        loop {
            match state.status {
                ConnectionStatus::Connected => return Ok(true),
                ConnectionStatus::Disconnected => return Ok(false),
                ConnectionStatus::Connecting => {}
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(false);
            }
            let (next, _) = self.shared.cond.wait_timeout(state, deadline - now)?;
            state = next;
        }
    }

    pub fn client_id(&self) -> Option<u32> {
        self.shared.state.lock().ok().and_then(|s| s.client_id)
    }

    pub fn status(&self) -> ConnectionStatus {
        self.shared
            .state
            .lock()
            .map(|s| s.status)
            .unwrap_or(ConnectionStatus::Disconnected)
    }

    pub fn is_connected(&self) -> bool {
        self.status() == ConnectionStatus::Connected
    }

    /// True while a transaction is open on this view.
    pub fn is_frozen(&self) -> bool {
        self.shared.state.lock().map(|s| s.frozen).unwrap_or(false)
    }

    /// Register interest in a range. The manager streams the range's current
    /// contents, then a SubscriptionEnd for this exact range, then live
    /// updates. With `block` set, waits for the initial load to complete.
    pub fn subscribe(&self, range: KeyRange, block: bool) -> Result<()> {
        {
            let mut state = self.shared.state.lock()?;
            if state.status == ConnectionStatus::Disconnected {
                return Err(FabricError::Disconnected("view is torn down".to_string()));
            }
            state.subscribed.push(range.clone());
        }
        self.shared
            .channel
            .send(ClientMessage::Subscribe(range.clone()))?;

        if block {
            let mut state = self.shared.state.lock()?;
            while !state.loaded.contains(&range) {
                if state.status == ConnectionStatus::Disconnected {
                    return Err(FabricError::Disconnected(
                        "disconnected while waiting for subscription".to_string(),
                    ));
                }
                state = self.shared.cond.wait(state)?;
            }
        }
        Ok(())
    }

    pub fn unsubscribe(&self, range: &KeyRange) -> Result<()> {
        {
            let mut state = self.shared.state.lock()?;
            state.subscribed.retain(|r| r != range);
            state.loaded.retain(|r| r != range);
        }
        self.shared
            .channel
            .send(ClientMessage::Unsubscribe(range.clone()))
    }

    pub fn subscribed_ranges(&self) -> Vec<KeyRange> {
        self.shared
            .state
            .lock()
            .map(|s| s.subscribed.clone())
            .unwrap_or_default()
    }

    /// Open a transaction. Exactly one may be open per view at a time.
    pub fn transaction(&self) -> Result<Transaction<'_>> {
        let mut state = self.shared.state.lock()?;
        if state.frozen {
            return Err(FabricError::TransactionOpen);
        }
        state.frozen = true;
        state.pending_writes.clear();
        Ok(Transaction::new(self))
    }

    /// Block until the manager acknowledges every write this view issued
    /// before the call. With `must_succeed`, an open transaction or a dropped
    /// connection is an error; without it, a dropped connection still is.
    pub fn flush(&self, must_succeed: bool) -> Result<()> {
        let flush_id = {
            let mut state = self.shared.state.lock()?;
            if state.frozen && must_succeed {
                return Err(FabricError::TransactionOpen);
            }
            if state.status == ConnectionStatus::Disconnected {
                return Err(FabricError::Disconnected("view is torn down".to_string()));
            }
            state.next_flush_id += 1;
            state.next_flush_id
        };

        self.shared
            .channel
            .send(ClientMessage::FlushRequest { flush_id })?;

        let mut state = self.shared.state.lock()?;
        while state.last_completed_flush < flush_id {
            if state.status == ConnectionStatus::Disconnected {
                return Err(FabricError::Disconnected(
                    "disconnected while waiting for flush".to_string(),
                ));
            }
            state = self.shared.cond.wait(state)?;
        }
        Ok(())
    }

    /// Register a listener on this view's update stream.
    pub fn listener(&self) -> Listener {
        let queue = Arc::new(ListenerQueue::new());
        let disconnected = self
            .shared
            .state
            .lock()
            .map(|s| s.status == ConnectionStatus::Disconnected)
            .unwrap_or(true);
        if disconnected {
            queue.mark_disconnected();
        }
        if let Ok(mut listeners) = self.shared.listeners.lock() {
            listeners.push(Arc::clone(&queue));
        }
        Listener::from_queue(queue)
    }

    pub(crate) fn shared(&self) -> &Arc<ViewShared> {
        &self.shared
    }

    /// Disconnect and join the receiver thread. Idempotent.
    pub fn teardown(&self) {
        self.shared.channel.disconnect();
        self.shared.mark_disconnected();
        if let Ok(mut receiver) = self.receiver.lock() {
            if let Some(handle) = receiver.take() {
                let _ = handle.join();
            }
        }
    }
}

impl Drop for View {
    fn drop(&mut self) {
        self.teardown();
    }
}

impl Listener {
    /// Register a new listener on `view`; equivalent to [`View::listener`].
    pub fn new(view: &View) -> Listener {
        view.listener()
    }
}
