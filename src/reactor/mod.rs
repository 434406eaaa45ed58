//! Asynchronous reactor adapter over a view.
//!
//! A single dedicated thread owns the `View` and is the only thread that ever
//! touches it; work arrives from arbitrary threads through a queue, and
//! update batches leave through per-keyspace callbacks. Thread affinity is
//! structural: the view moves into the reactor thread at start and never
//! escapes.
//!
//! The adapter performs no automatic reconnection. When the view drops, the
//! injected error callback fires and the owner is responsible for rebuilding
//! a view/reactor pair and resubscribing.

pub mod deferred;

pub use deferred::Deferred;

use std::collections::{BTreeMap, HashMap, HashSet};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{JoinHandle, ThreadId};
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender, unbounded};
use log::{debug, error};
use serde_json::Value;

use crate::core::{FabricError, Key, KeyBound, KeyRange, Keyspace, Result};
use crate::view::{Listener, View, ViewEvent};

/// Outcome of a keyspace subscription's initial load.
pub type SubscriptionResult = std::result::Result<(), String>;

/// Changed key → latest value, as delivered to update callbacks.
pub type UpdateMap = BTreeMap<Key, Option<Value>>;

/// Per-keyspace update callback; runs on the reactor thread.
pub type UpdateCallback = Box<dyn FnMut(&UpdateMap) + Send>;

/// Receives Disconnected / Callback errors from the reactor.
pub type ErrorCallback = Arc<dyn Fn(&FabricError) + Send + Sync>;

/// A closure executed on the reactor thread against the view.
pub type ReactorCall = Box<dyn FnOnce(&View) -> Result<()> + Send>;

/// Success continuation for a queued reactor call.
pub type DoneCallback = Box<dyn FnOnce() + Send>;

/// Failure continuation for a queued reactor call.
pub type ErrBack = Box<dyn FnOnce(FabricError) + Send>;

enum ReactorWork {
    Call {
        f: ReactorCall,
        callback: Option<DoneCallback>,
        errback: Option<ErrBack>,
    },
    Subscribe {
        range: KeyRange,
        callback: Option<UpdateCallback>,
        deferred: Deferred<SubscriptionResult>,
    },
}

/// Callback-driven adapter serializing all view access onto one thread.
pub struct AsyncView {
    work: Sender<ReactorWork>,
    listener: Listener,
    stop: Arc<AtomicBool>,
    reactor_thread: ThreadId,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl AsyncView {
    /// Move `view` into a new reactor thread and start the loop.
    pub fn start(view: View, on_error: ErrorCallback) -> AsyncView {
        let (work, work_rx) = unbounded();
        let listener = view.listener();
        let stop = Arc::new(AtomicBool::new(false));

        let thread_listener = listener.clone();
        let thread_stop = Arc::clone(&stop);
        let handle = std::thread::Builder::new()
            .name("view-reactor".to_string())
            .spawn(move || {
                reactor_loop(view, thread_listener, work_rx, thread_stop, on_error);
            })
            .expect("failed to spawn reactor thread");
        let reactor_thread = handle.thread().id();

        AsyncView {
            work,
            listener,
            stop,
            reactor_thread,
            handle: Mutex::new(Some(handle)),
        }
    }

    /// Subscribe to a whole keyspace along dimension `dim`. The returned
    /// deferred fires once the initial load completes; `callback` (if any)
    /// then receives every subsequent update batch for the keyspace. At most
    /// one subscription per keyspace is allowed on one adapter.
    pub fn subscribe_to_keyspace(
        &self,
        keyspace: Keyspace,
        dim: u32,
        callback: Option<UpdateCallback>,
    ) -> Deferred<SubscriptionResult> {
        self.subscribe_range(KeyRange::all(keyspace, dim), callback)
    }

    /// Subscribe to a single key of a keyspace.
    pub fn subscribe_to_key(
        &self,
        keyspace: Keyspace,
        keyname: Value,
        dim: u32,
        callback: Option<UpdateCallback>,
    ) -> Deferred<SubscriptionResult> {
        let deferred = Deferred::new();
        let range = KeyRange::new(
            keyspace,
            dim,
            Some(KeyBound {
                value: keyname.clone(),
                inclusive: true,
            }),
            Some(KeyBound {
                value: keyname,
                inclusive: true,
            }),
        );
        match range {
            Ok(range) => self.subscribe_range_into(range, callback, deferred.clone()),
            Err(err) => deferred.fire(Err(err.to_string())),
        }
        deferred
    }

    fn subscribe_range(
        &self,
        range: KeyRange,
        callback: Option<UpdateCallback>,
    ) -> Deferred<SubscriptionResult> {
        let deferred = Deferred::new();
        self.subscribe_range_into(range, callback, deferred.clone());
        deferred
    }

    fn subscribe_range_into(
        &self,
        range: KeyRange,
        callback: Option<UpdateCallback>,
        deferred: Deferred<SubscriptionResult>,
    ) {
        if self.stop.load(Ordering::SeqCst) {
            deferred.fire(Err("adapter is stopped".to_string()));
            return;
        }
        let sent = self.work.send(ReactorWork::Subscribe {
            range,
            callback,
            deferred: deferred.clone(),
        });
        if sent.is_err() {
            deferred.fire(Err("reactor is gone".to_string()));
            return;
        }
        self.listener.wake();
    }

    /// Write one key on the reactor thread. `callback` fires after the
    /// transaction committed locally, `errback` on failure.
    pub fn push_transaction(
        &self,
        key: Key,
        value: Option<Value>,
        callback: Option<DoneCallback>,
        errback: Option<ErrBack>,
    ) -> Result<()> {
        self.reactor_thread_call(
            Box::new(move |view| {
                let mut txn = view.transaction()?;
                txn.write(key, value)?;
                txn.end()
            }),
            callback,
            errback,
        )
    }

    /// Run an arbitrary closure on the reactor thread. The callback or
    /// errback fires only after the closure returns, never under a lock.
    pub fn reactor_thread_call(
        &self,
        f: ReactorCall,
        callback: Option<DoneCallback>,
        errback: Option<ErrBack>,
    ) -> Result<()> {
        if self.stop.load(Ordering::SeqCst) {
            return Err(FabricError::Disconnected("adapter is stopped".to_string()));
        }
        self.work
            .send(ReactorWork::Call {
                f,
                callback,
                errback,
            })
            .map_err(|_| FabricError::Disconnected("reactor is gone".to_string()))?;
        self.listener.wake();
        Ok(())
    }

    /// Stop the reactor and join its thread. Safe to call from a reactor
    /// callback: the self-join is skipped when invoked on the reactor thread
    /// itself.
    pub fn stop(&self) {
        self.stop.store(true, Ordering::SeqCst);
        self.listener.wake();
        if std::thread::current().id() != self.reactor_thread {
            if let Ok(mut handle) = self.handle.lock() {
                if let Some(handle) = handle.take() {
                    let _ = handle.join();
                }
            }
        }
    }
}

impl Drop for AsyncView {
    fn drop(&mut self) {
        self.stop();
    }
}

fn reactor_loop(
    view: View,
    listener: Listener,
    work: Receiver<ReactorWork>,
    stop: Arc<AtomicBool>,
    on_error: ErrorCallback,
) {
    let mut callbacks: HashMap<String, UpdateCallback> = HashMap::new();
    let mut pending: HashMap<String, Deferred<SubscriptionResult>> = HashMap::new();
    let mut subscribed: HashSet<String> = HashSet::new();

    while !stop.load(Ordering::SeqCst) {
        let events = match listener.get(Duration::from_secs(1)) {
            Ok(events) => events,
            Err(_) => {
                if !stop.load(Ordering::SeqCst) {
                    debug!("reactor lost its view connection");
                    on_error(&FabricError::Disconnected(
                        "lost connection to the keyspace store".to_string(),
                    ));
                }
                break;
            }
        };

        for event in events {
            match event {
                ViewEvent::KeyUpdates(keys) => {
                    handle_key_updates(&view, &mut callbacks, &keys, &on_error);
                }
                ViewEvent::SubscriptionEnd(range) => {
                    if let Some(deferred) = pending.remove(&range.keyspace().name) {
                        deferred.fire(Ok(()));
                    }
                }
            }
        }

        drain_work(
            &view,
            &work,
            &mut callbacks,
            &mut pending,
            &mut subscribed,
            &on_error,
        );
    }

    // anything still queued is answered, not silently dropped
    while let Ok(item) = work.try_recv() {
        match item {
            ReactorWork::Call { errback, .. } => {
                let err = FabricError::Disconnected("reactor stopped".to_string());
                match errback {
                    Some(errback) => errback(err),
                    None => debug!("dropping queued reactor call: {}", err),
                }
            }
            ReactorWork::Subscribe { deferred, .. } => {
                deferred.fire(Err("reactor stopped".to_string()));
            }
        }
    }

    for deferred in pending.into_values() {
        deferred.fire(Err("reactor stopped".to_string()));
    }

    view.teardown();
}

fn handle_key_updates(
    view: &View,
    callbacks: &mut HashMap<String, UpdateCallback>,
    keys: &[Key],
    on_error: &ErrorCallback,
) {
    if keys.is_empty() {
        return;
    }

    let mut grouped: HashMap<String, UpdateMap> = HashMap::new();
    {
        let txn = match view.transaction() {
            Ok(txn) => txn,
            Err(err) => {
                on_error(&err);
                return;
            }
        };
        for key in keys {
            let name = &key.keyspace().name;
            if !callbacks.contains_key(name) {
                continue;
            }
            match txn.get(key) {
                Ok(value) => {
                    grouped
                        .entry(name.clone())
                        .or_default()
                        .insert(key.clone(), value);
                }
                Err(err) => debug!("skipping update for {}: {}", key, err),
            }
        }
        let _ = txn.abort();
    }

    for (name, updates) in grouped {
        if let Some(callback) = callbacks.get_mut(&name) {
            let outcome = catch_unwind(AssertUnwindSafe(|| callback(&updates)));
            if outcome.is_err() {
                on_error(&FabricError::Callback(format!(
                    "update callback for keyspace '{}' panicked",
                    name
                )));
            }
        }
    }
}

fn drain_work(
    view: &View,
    work: &Receiver<ReactorWork>,
    callbacks: &mut HashMap<String, UpdateCallback>,
    pending: &mut HashMap<String, Deferred<SubscriptionResult>>,
    subscribed: &mut HashSet<String>,
    on_error: &ErrorCallback,
) {
    while let Ok(item) = work.try_recv() {
        match item {
            ReactorWork::Call {
                f,
                callback,
                errback,
            } => {
                let outcome = catch_unwind(AssertUnwindSafe(|| f(view)));
                match outcome {
                    Ok(Ok(())) => {
                        if let Some(callback) = callback {
                            if catch_unwind(AssertUnwindSafe(callback)).is_err() {
                                on_error(&FabricError::Callback(
                                    "reactor call callback panicked".to_string(),
                                ));
                            }
                        }
                    }
                    Ok(Err(err)) => match errback {
                        Some(errback) => errback(err),
                        None => error!("error during reactor call: {}", err),
                    },
                    Err(_) => {
                        let err = FabricError::Callback("queued closure panicked".to_string());
                        match errback {
                            Some(errback) => errback(err),
                            None => on_error(&FabricError::Callback(
                                "queued closure panicked".to_string(),
                            )),
                        }
                    }
                }
            }
            ReactorWork::Subscribe {
                range,
                callback,
                deferred,
            } => {
                let name = range.keyspace().name.clone();
                if subscribed.contains(&name) {
                    deferred.fire(Err(
                        FabricError::DuplicateSubscription(name).to_string()
                    ));
                    continue;
                }
                if let Some(callback) = callback {
                    callbacks.insert(name.clone(), callback);
                }
                pending.insert(name.clone(), deferred.clone());
                subscribed.insert(name.clone());
                if let Err(err) = view.subscribe(range, false) {
                    pending.remove(&name);
                    callbacks.remove(&name);
                    subscribed.remove(&name);
                    deferred.fire(Err(err.to_string()));
                }
            }
        }
    }
}
