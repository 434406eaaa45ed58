//! Scoped read/write sessions on a view.
//!
//! Opening a transaction freezes the view's cache, so reads are stable for
//! the transaction's lifetime. Writes buffer locally and are shipped at
//! `end()` as a bundle of events tagged with fresh per-client event ids; they
//! become visible in the cache only once the manager rebroadcasts them.

use std::ops::Bound;

use serde_json::Value;

use crate::core::{FabricError, Key, PartialEvent, Result, UniqueId};
use crate::protocol::ClientMessage;

use super::{ConnectionStatus, View, ViewShared};

pub struct Transaction<'a> {
    view: &'a View,
    finished: bool,
}

impl<'a> Transaction<'a> {
    pub(crate) fn new(view: &'a View) -> Self {
        Self {
            view,
            finished: false,
        }
    }

    /// Read the current value of `key`. Pending writes from this transaction
    /// shadow the cache; a tombstone reads as `None`.
    pub fn get(&self, key: &Key) -> Result<Option<Value>> {
        let state = self.view.shared().state.lock()?;
        ViewShared::ensure_subscribed(&state, key)?;
        if let Some(pending) = state.pending_writes.get(key) {
            return Ok(pending.clone());
        }
        Ok(state
            .cache
            .get(key)
            .and_then(|entry| entry.value().cloned()))
    }

    /// The id of the write that produced the cached value, if any. Pending
    /// writes have no id until `end()` assigns one.
    pub fn get_id(&self, key: &Key) -> Result<Option<UniqueId>> {
        let state = self.view.shared().state.lock()?;
        ViewShared::ensure_subscribed(&state, key)?;
        Ok(state.cache.get(key).map(|entry| entry.id()))
    }

    /// Buffer a write. `None` writes a tombstone.
    pub fn write(&mut self, key: Key, value: Option<Value>) -> Result<()> {
        let mut state = self.view.shared().state.lock()?;
        ViewShared::ensure_subscribed(&state, &key)?;
        state.pending_writes.insert(key, value);
        Ok(())
    }

    /// The smallest key strictly greater than `key` among the cached and
    /// pending keys, or `None` at the end of the cache.
    pub fn next_key(&self, key: &Key) -> Result<Option<Key>> {
        let state = self.view.shared().state.lock()?;
        let bounds = (Bound::Excluded(key), Bound::Unbounded);
        let from_cache = state.cache.range(bounds).next().map(|(k, _)| k.clone());
        let from_pending = state
            .pending_writes
            .range(bounds)
            .next()
            .map(|(k, _)| k.clone());
        Ok(match (from_cache, from_pending) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        })
    }

    /// Ship all buffered writes as events tagged with fresh event ids, then
    /// unfreeze the view. The send happens before the unfreeze so a later
    /// transaction cannot put its (higher) event ids on the wire first.
    pub fn end(mut self) -> Result<()> {
        self.finished = true;
        let shared = self.view.shared();

        let (sent, events) = {
            let mut state = shared.state.lock()?;
            let writes = std::mem::take(&mut state.pending_writes);

            let sent = if writes.is_empty() {
                Ok(())
            } else {
                match (state.status, state.client_id) {
                    (ConnectionStatus::Connected, Some(client_id)) => {
                        let mut pushes = Vec::with_capacity(writes.len());
                        for (key, value) in writes {
                            state.next_event_id += 1;
                            pushes.push(ClientMessage::PushEvent(PartialEvent::new(
                                key,
                                value,
                                UniqueId::new(state.next_event_id, client_id),
                            )));
                        }
                        let message = match pushes.len() {
                            1 => pushes.remove(0),
                            _ => ClientMessage::Bundle(pushes),
                        };
                        shared.channel.send(message)
                    }
                    _ => Err(FabricError::Disconnected(
                        "cannot commit writes on a disconnected view".to_string(),
                    )),
                }
            };

            (sent, shared.unfreeze_locked(&mut state))
        };

        for event in events {
            shared.fan_out(event);
        }
        sent
    }

    /// Discard all buffered writes and unfreeze the view.
    pub fn abort(mut self) -> Result<usize> {
        self.finished = true;
        self.discard()
    }

    fn discard(&self) -> Result<usize> {
        let shared = self.view.shared();
        let (discarded, events) = {
            let mut state = shared.state.lock()?;
            let discarded = state.pending_writes.len();
            state.pending_writes.clear();
            (discarded, shared.unfreeze_locked(&mut state))
        };
        for event in events {
            shared.fan_out(event);
        }
        Ok(discarded)
    }
}

impl Drop for Transaction<'_> {
    fn drop(&mut self) {
        if !self.finished {
            let _ = self.discard();
        }
    }
}
