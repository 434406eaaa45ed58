//! In-process reference manager.
//!
//! A compact keyspace manager speaking the full view protocol over in-memory
//! channels: client id assignment, subscription loads, per-policy conflict
//! resolution, flush handshakes, minimum-id probes, and optional file-backed
//! persistence with snapshot compaction. Integration tests (and downstream
//! crates' tests) use it as the peer a `View` talks to; the production
//! manager is an external process speaking the same protocol.

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;

use log::{debug, info, warn};

use crate::config::FabricConfig;
use crate::core::{
    ConflictPolicy, Key, Keyspace, PartialEvent, Result, ValueEntry, apply_event,
};
use crate::protocol::{
    ClientMessage, InMemoryViewChannel, ManagerChannel, ManagerMessage, view_channel_pair,
};
use crate::storage::{KeyspaceStorage, LogEntry, OpenFiles, PruneService};
use crate::view::View;

struct ClientHandle {
    channel: ManagerChannel,
    subscriptions: Vec<crate::core::KeyRange>,
    last_min_id: Option<u64>,
}

struct ManagerState {
    next_client_id: u32,
    /// Highest event id seen or handed out; new sessions start above it.
    id_floor: u64,
    clients: HashMap<u32, ClientHandle>,
    keyspaces: HashMap<Keyspace, BTreeMap<Key, ValueEntry>>,
    storages: HashMap<Keyspace, KeyspaceStorage>,
}

struct ManagerInner {
    state: Mutex<ManagerState>,
    cache_path: Option<PathBuf>,
    open_files: Option<Arc<OpenFiles>>,
    max_log_file_bytes: u64,
    required_token: Option<String>,
    ping_counter: AtomicU64,
    shutting_down: AtomicBool,
    ping_sleep: Mutex<()>,
    ping_cond: Condvar,
}

/// The manager side of a set of in-memory view connections.
pub struct InMemoryManager {
    inner: Arc<ManagerInner>,
    client_threads: Mutex<Vec<JoinHandle<()>>>,
    ping_thread: Mutex<Option<JoinHandle<()>>>,
    prune_service: Option<PruneService>,
}

impl InMemoryManager {
    pub fn new(config: &FabricConfig) -> Result<InMemoryManager> {
        Self::build(config, None, None)
    }

    /// A manager persisting every keyspace under `cache_path`, recovering
    /// existing state (newest valid snapshot plus log replay) at startup.
    pub fn with_cache_path(
        config: &FabricConfig,
        cache_path: impl Into<PathBuf>,
    ) -> Result<InMemoryManager> {
        Self::build(config, Some(cache_path.into()), None)
    }

    /// A manager requiring every connection to present `token` first.
    pub fn with_token(config: &FabricConfig, token: &str) -> Result<InMemoryManager> {
        Self::build(config, None, Some(token.to_string()))
    }

    fn build(
        config: &FabricConfig,
        cache_path: Option<PathBuf>,
        required_token: Option<String>,
    ) -> Result<InMemoryManager> {
        config
            .validate()
            .map_err(crate::core::FabricError::Config)?;

        let open_files = cache_path
            .as_ref()
            .map(|_| Arc::new(OpenFiles::new(config.max_open_files)));

        let mut state = ManagerState {
            next_client_id: 0,
            id_floor: 0,
            clients: HashMap::new(),
            keyspaces: HashMap::new(),
            storages: HashMap::new(),
        };

        if let (Some(root), Some(open_files)) = (&cache_path, &open_files) {
            std::fs::create_dir_all(root)?;
            for keyspace in scan_keyspace_directories(root) {
                let storage = KeyspaceStorage::open(
                    root,
                    keyspace.clone(),
                    0,
                    Arc::clone(open_files),
                    config.max_log_file_bytes,
                )?;
                let (cache, id_floor) = storage.recover()?;
                info!(
                    "recovered {} keys for {} (id floor {})",
                    cache.len(),
                    keyspace,
                    id_floor
                );
                state.id_floor = state.id_floor.max(id_floor);
                state.keyspaces.insert(keyspace.clone(), cache);
                state.storages.insert(keyspace, storage);
            }
        }

        let inner = Arc::new(ManagerInner {
            state: Mutex::new(state),
            cache_path,
            open_files,
            max_log_file_bytes: config.max_log_file_bytes,
            required_token,
            ping_counter: AtomicU64::new(0),
            shutting_down: AtomicBool::new(false),
            ping_sleep: Mutex::new(()),
            ping_cond: Condvar::new(),
        });

        // the minimum-id probe runs on a fixed interval, like the production
        // manager's ping loop
        let ping_inner = Arc::clone(&inner);
        let ping_interval = config.ping_interval;
        let ping_thread = std::thread::Builder::new()
            .name("manager-ping".to_string())
            .spawn(move || {
                while !ping_inner.shutting_down.load(Ordering::SeqCst) {
                    {
                        let Ok(guard) = ping_inner.ping_sleep.lock() else {
                            return;
                        };
                        if ping_inner.shutting_down.load(Ordering::SeqCst) {
                            return;
                        }
                        let _ = ping_inner.ping_cond.wait_timeout(guard, ping_interval);
                    }
                    if ping_inner.shutting_down.load(Ordering::SeqCst) {
                        return;
                    }
                    let ping_id = ping_inner.ping_counter.fetch_add(1, Ordering::SeqCst) + 1;
                    if let Ok(state) = ping_inner.state.lock() {
                        for client in state.clients.values() {
                            let _ = client.channel.send(ManagerMessage::MinimumId { ping_id });
                        }
                    }
                }
            })
            .map_err(crate::core::FabricError::Io)?;

        // the pruning loop runs alongside a file-backed manager, each cache
        // directory handled independently
        let prune_service = inner
            .cache_path
            .as_ref()
            .map(|root| PruneService::start(root.clone(), config.prune_interval));

        Ok(InMemoryManager {
            inner,
            client_threads: Mutex::new(Vec::new()),
            ping_thread: Mutex::new(Some(ping_thread)),
            prune_service,
        })
    }

    /// Register a manager-side channel endpoint: assign a client id, send the
    /// Initialize handshake, and start serving the connection.
    pub fn add_channel(&self, channel: ManagerChannel) -> Result<u32> {
        let client_id = {
            let mut state = self.inner.state.lock()?;
            state.next_client_id += 1;
            let client_id = state.next_client_id;
            let base_event_id = state.id_floor;

            // persist the floor so ids stay monotonic across recoveries
            for storage in state.storages.values_mut() {
                if let Err(err) = storage.write_log_entry(&LogEntry::IdFloor(base_event_id)) {
                    warn!("failed to record id floor: {}", err);
                }
            }

            state.clients.insert(
                client_id,
                ClientHandle {
                    channel: channel.clone(),
                    subscriptions: Vec::new(),
                    last_min_id: None,
                },
            );

            if let Err(err) = channel.send(ManagerMessage::Initialize {
                client_id,
                base_event_id,
            }) {
                state.clients.remove(&client_id);
                return Err(err);
            }
            client_id
        };

        let inner = Arc::clone(&self.inner);
        let thread = std::thread::Builder::new()
            .name(format!("manager-client-{}", client_id))
            .spawn(move || serve_client(inner, channel, client_id))
            .map_err(crate::core::FabricError::Io)?;
        self.client_threads.lock()?.push(thread);
        Ok(client_id)
    }

    /// Open a new in-memory connection and return a connected `View` on it.
    pub fn connect_view(&self) -> Result<View> {
        Ok(View::connect(Arc::new(self.connect_channel()?)))
    }

    /// Open a new in-memory connection and return the client endpoint.
    pub fn connect_channel(&self) -> Result<InMemoryViewChannel> {
        let (client_end, manager_end) = view_channel_pair();
        self.add_channel(manager_end)?;
        Ok(client_end)
    }

    /// Broadcast a minimum-id probe to every connected client.
    pub fn send_ping(&self) -> Result<u64> {
        let ping_id = self.inner.ping_counter.fetch_add(1, Ordering::SeqCst) + 1;
        let state = self.inner.state.lock()?;
        for client in state.clients.values() {
            let _ = client.channel.send(ManagerMessage::MinimumId { ping_id });
        }
        Ok(ping_id)
    }

    /// Snapshot every persistent keyspace into its next STATE file.
    pub fn compact(&self) -> Result<()> {
        let mut state = self.inner.state.lock()?;
        let ManagerState {
            keyspaces,
            storages,
            ..
        } = &mut *state;
        for (keyspace, storage) in storages.iter_mut() {
            let map = keyspaces.get(keyspace).cloned().unwrap_or_default();
            storage.compress(&map)?;
        }
        Ok(())
    }

    /// Ping then compact, the periodic maintenance step.
    pub fn check(&self) -> Result<()> {
        self.send_ping()?;
        self.compact()
    }

    /// The latest minimum-id responses, by client id.
    pub fn minimum_ids(&self) -> HashMap<u32, u64> {
        self.inner
            .state
            .lock()
            .map(|state| {
                state
                    .clients
                    .iter()
                    .filter_map(|(&id, c)| c.last_min_id.map(|m| (id, m)))
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn keyspace_names(&self) -> Vec<String> {
        self.inner
            .state
            .lock()
            .map(|state| state.keyspaces.keys().map(|k| k.name.clone()).collect())
            .unwrap_or_default()
    }

    /// Disconnect every client and join the worker threads.
    pub fn shutdown(&self) {
        {
            let _guard = self.inner.ping_sleep.lock();
            self.inner.shutting_down.store(true, Ordering::SeqCst);
            self.inner.ping_cond.notify_all();
        }
        if let Ok(mut ping_thread) = self.ping_thread.lock() {
            if let Some(handle) = ping_thread.take() {
                let _ = handle.join();
            }
        }
        if let Ok(mut state) = self.inner.state.lock() {
            for (_, client) in state.clients.drain() {
                client.channel.disconnect();
            }
        }
        if let Ok(mut threads) = self.client_threads.lock() {
            for thread in threads.drain(..) {
                let _ = thread.join();
            }
        }
        if let Some(prune_service) = &self.prune_service {
            prune_service.stop();
        }
        if let Some(open_files) = &self.inner.open_files {
            open_files.shutdown();
        }
    }
}

impl Drop for InMemoryManager {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn serve_client(inner: Arc<ManagerInner>, channel: ManagerChannel, client_id: u32) {
    let mut authorized = inner.required_token.is_none();

    loop {
        let message = match channel.recv() {
            Ok(message) => message,
            Err(_) => break,
        };
        if !handle_message(&inner, &channel, client_id, message, &mut authorized) {
            break;
        }
    }

    if !inner.shutting_down.load(Ordering::SeqCst) {
        debug!("client {} disconnected", client_id);
    }
    channel.disconnect();
    if let Ok(mut state) = inner.state.lock() {
        state.clients.remove(&client_id);
    }
}

/// Returns false when the connection must be dropped.
fn handle_message(
    inner: &Arc<ManagerInner>,
    channel: &ManagerChannel,
    client_id: u32,
    message: ClientMessage,
    authorized: &mut bool,
) -> bool {
    if !*authorized {
        return match message {
            ClientMessage::Authorize { token } => {
                if Some(&token) == inner.required_token.as_ref() {
                    *authorized = true;
                    true
                } else {
                    warn!("client {} presented a bad token", client_id);
                    false
                }
            }
            _ => {
                warn!("client {} spoke before authorizing", client_id);
                false
            }
        };
    }

    match message {
        ClientMessage::Authorize { .. } => true,
        ClientMessage::Bundle(messages) => {
            for inner_message in messages {
                if !handle_message(inner, channel, client_id, inner_message, authorized) {
                    return false;
                }
            }
            true
        }
        ClientMessage::Subscribe(range) => handle_subscribe(inner, channel, client_id, range),
        ClientMessage::Unsubscribe(range) => {
            if let Ok(mut state) = inner.state.lock() {
                if let Some(client) = state.clients.get_mut(&client_id) {
                    client.subscriptions.retain(|r| r != &range);
                }
            }
            true
        }
        ClientMessage::PushEvent(event) => handle_event(inner, event),
        ClientMessage::FlushRequest { flush_id } => channel
            .send(ManagerMessage::FlushResponse { flush_id })
            .is_ok(),
        ClientMessage::MinimumIdResponse {
            min_event_id,
            ping_id,
        } => {
            debug!(
                "client {} answered ping {} with minimum id {}",
                client_id, ping_id, min_event_id
            );
            if let Ok(mut state) = inner.state.lock() {
                if let Some(client) = state.clients.get_mut(&client_id) {
                    client.last_min_id = Some(min_event_id);
                }
            }
            true
        }
    }
}

fn handle_subscribe(
    inner: &Arc<ManagerInner>,
    channel: &ManagerChannel,
    client_id: u32,
    range: crate::core::KeyRange,
) -> bool {
    let initial: Vec<PartialEvent> = {
        let Ok(mut state) = inner.state.lock() else {
            return false;
        };
        let keyspace = range.keyspace().clone();

        ensure_keyspace(inner, &mut state, &keyspace);

        let initial = state
            .keyspaces
            .get(&keyspace)
            .map(|map| {
                map.iter()
                    .filter(|(key, _)| range.contains(key))
                    .map(|(key, entry)| {
                        PartialEvent::new(key.clone(), entry.value().cloned(), entry.id())
                    })
                    .collect()
            })
            .unwrap_or_default();

        if let Some(client) = state.clients.get_mut(&client_id) {
            client.subscriptions.push(range.clone());
        }
        initial
    };

    if !initial.is_empty() && channel.send(ManagerMessage::KeyUpdates(initial)).is_err() {
        return false;
    }
    channel.send(ManagerMessage::SubscriptionEnd(range)).is_ok()
}

fn ensure_keyspace(inner: &Arc<ManagerInner>, state: &mut ManagerState, keyspace: &Keyspace) {
    if !state.keyspaces.contains_key(keyspace) {
        state.keyspaces.insert(keyspace.clone(), BTreeMap::new());
    }
    if state.storages.contains_key(keyspace) {
        return;
    }
    if let (Some(root), Some(open_files)) = (&inner.cache_path, &inner.open_files) {
        match KeyspaceStorage::open(
            root,
            keyspace.clone(),
            0,
            Arc::clone(open_files),
            inner.max_log_file_bytes,
        ) {
            Ok(storage) => {
                state.storages.insert(keyspace.clone(), storage);
            }
            Err(err) => warn!("failed to open storage for {}: {}", keyspace, err),
        }
    }
}

fn handle_event(inner: &Arc<ManagerInner>, event: PartialEvent) -> bool {
    let Ok(mut state) = inner.state.lock() else {
        return false;
    };

    state.id_floor = state.id_floor.max(event.id.event_id);

    let keyspace = event.keyspace().clone();
    ensure_keyspace(inner, &mut state, &keyspace);
    if let Some(map) = state.keyspaces.get_mut(&keyspace) {
        apply_event(map, event.clone());
    }
    if let Some(storage) = state.storages.get_mut(&keyspace) {
        if let Err(err) = storage.write_log_entry(&LogEntry::Event(event.clone())) {
            warn!("failed to persist event: {}", err);
        }
    }

    // broadcast to every subscriber, the writer included; each view applies
    // the keyspace's policy so all caches converge
    for client in state.clients.values() {
        if client.subscriptions.iter().any(|r| r.contains(&event.key)) {
            let _ = client
                .channel
                .send(ManagerMessage::KeyUpdates(vec![event.clone()]));
        }
    }
    true
}

fn scan_keyspace_directories(root: &std::path::Path) -> Vec<Keyspace> {
    let Ok(entries) = std::fs::read_dir(root) else {
        return Vec::new();
    };
    entries
        .flatten()
        .filter_map(|entry| parse_keyspace_directory(&entry.file_name().to_string_lossy()))
        .collect()
}

fn parse_keyspace_directory(name: &str) -> Option<Keyspace> {
    let mut parts = name.splitn(3, "::");
    let policy = match parts.next()? {
        "value-wins" => ConflictPolicy::ValueWins,
        "highest-id-wins" => ConflictPolicy::HighestIdWins,
        _ => return None,
    };
    let dimension: u32 = parts.next()?.parse().ok()?;
    let keyspace_name = parts.next()?;
    if dimension == 0 {
        return None;
    }
    Some(Keyspace::new(policy, keyspace_name, dimension))
}
