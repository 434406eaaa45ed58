//! Channel demultiplexer: N logical ordered byte channels over one framed
//! transport.
//!
//! Each registered channel gets a dedicated outbound pump thread that stamps
//! chunks with a per-channel sequence number; a single inbound thread decodes
//! envelopes, buffers out-of-order arrivals per channel, and delivers them in
//! sequence order. A zero-length envelope is the close tombstone.

pub mod envelope;
pub mod transport;

pub use envelope::Envelope;
pub use transport::{InMemoryTransport, Transport, read_frame, write_frame};

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use log::{debug, error, info, warn};

use crate::channel::ByteChannel;
use crate::config::FabricConfig;
use crate::core::Result;

/// Inbound messages above this size are logged at warn level.
const LARGE_MESSAGE_WARN_BYTES: usize = 100 * 1024;

/// Called with the channel group when a channel breaks, so all channels
/// belonging to one logical connection can be torn down together.
pub type ChannelBrokeCallback = Arc<dyn Fn(&str) + Send + Sync>;

struct RegisteredChannel {
    local: ByteChannel,
    group: String,
    backlog: BTreeMap<u64, Envelope>,
    backlog_bytes: usize,
    incoming_seq: u64,
}

struct DemuxShared {
    transport: Arc<dyn Transport>,
    channels: Mutex<HashMap<String, RegisteredChannel>>,
    on_channel_broke: Mutex<Option<ChannelBrokeCallback>>,
    shutting_down: AtomicBool,
    max_backlog_bytes: usize,
    unknown_log_limit: u32,
    unknown_counts: Mutex<HashMap<String, u32>>,
    total_bytes_read: AtomicU64,
}

impl DemuxShared {
    fn send_envelope(&self, envelope: &Envelope) -> Result<()> {
        self.transport.send_frame(&envelope.encode()?)
    }

    fn fire_channel_broke(&self, group: &str) {
        let callback = self
            .on_channel_broke
            .lock()
            .ok()
            .and_then(|guard| guard.clone());
        if let Some(callback) = callback {
            callback(group);
        }
    }

    fn log_bytes(&self, count: usize) {
        let prior = self.total_bytes_read.fetch_add(count as u64, Ordering::Relaxed);
        let total = prior + count as u64;
        if prior / (100 * 1024) != total / (100 * 1024) {
            debug!(
                "demuxer read {:.1} MB cumulatively",
                total as f64 / (1024.0 * 1024.0)
            );
        }
    }

    fn note_unknown_channel(&self, envelope: &Envelope) {
        let Ok(mut counts) = self.unknown_counts.lock() else {
            return;
        };
        let count = counts.entry(envelope.channel_id.clone()).or_insert(0);
        *count += 1;
        if *count <= self.unknown_log_limit {
            let suffix = if *count == self.unknown_log_limit {
                "; suppressing further warnings for this id"
            } else {
                ""
            };
            info!(
                "received message (seq {}, {} bytes) for unknown channel {}{}",
                envelope.sequence_number,
                envelope.content.len(),
                envelope.channel_id,
                suffix
            );
        }
    }

    fn handle_frame(&self, frame: &[u8]) {
        let envelope = match Envelope::decode(frame) {
            Ok(envelope) => envelope,
            Err(err) => {
                error!("failed to decode envelope: {}", err);
                return;
            }
        };

        self.log_bytes(envelope.content.len());
        if envelope.content.len() > LARGE_MESSAGE_WARN_BYTES {
            warn!(
                "demuxer got a very large message of {} kB on channel {}",
                envelope.content.len() / 1024,
                envelope.channel_id
            );
        }

        let mut broken: Option<RegisteredChannel> = None;
        {
            let Ok(mut channels) = self.channels.lock() else {
                return;
            };
            let Some(entry) = channels.get_mut(&envelope.channel_id) else {
                drop(channels);
                self.note_unknown_channel(&envelope);
                return;
            };

            let channel_id = envelope.channel_id.clone();
            let sequence = envelope.sequence_number;
            entry.backlog_bytes += envelope.content.len();
            if let Some(old) = entry.backlog.insert(sequence, envelope) {
                entry.backlog_bytes -= old.content.len();
            }

            let tear_down = if entry.backlog_bytes > self.max_backlog_bytes {
                error!(
                    "{}; breaking the channel",
                    crate::core::FabricError::BacklogOverflow {
                        channel_id: channel_id.clone(),
                        bytes: entry.backlog_bytes,
                        limit: self.max_backlog_bytes,
                    }
                );
                true
            } else {
                sequence == entry.incoming_seq && Self::drain_backlog(&channel_id, entry)
            };

            if tear_down {
                broken = channels.remove(&channel_id);
            }
        }

        // teardown happens outside the registry lock
        if let Some(entry) = broken {
            entry.local.disconnect();
            self.fire_channel_broke(&entry.group);
        }
    }

    /// Deliver in-order backlog entries. Returns true if the channel must be
    /// torn down (close tombstone, or the local consumer went away).
    fn drain_backlog(channel_id: &str, entry: &mut RegisteredChannel) -> bool {
        while let Some(envelope) = entry.backlog.remove(&entry.incoming_seq) {
            if envelope.is_close() {
                debug!("channel {} disconnected by peer", channel_id);
                return true;
            }

            entry.backlog_bytes -= envelope.content.len();
            entry.incoming_seq += 1;
            if entry.local.send(envelope.content).is_err() {
                error!(
                    "writing to local consumer of channel {} failed; breaking the channel",
                    channel_id
                );
                return true;
            }
        }
        false
    }
}

/// Multiplexes many logical byte channels over one physical transport.
///
/// Explicitly constructed and torn down with [`ChannelDemuxer::close`]; no
/// ambient registries.
pub struct ChannelDemuxer {
    shared: Arc<DemuxShared>,
    inbound: Mutex<Option<JoinHandle<()>>>,
    pumps: Mutex<Vec<JoinHandle<()>>>,
}

impl ChannelDemuxer {
    pub fn new(transport: Arc<dyn Transport>, config: &FabricConfig) -> Self {
        let shared = Arc::new(DemuxShared {
            transport,
            channels: Mutex::new(HashMap::new()),
            on_channel_broke: Mutex::new(None),
            shutting_down: AtomicBool::new(false),
            max_backlog_bytes: config.max_backlog_bytes,
            unknown_log_limit: config.unknown_channel_log_limit,
            unknown_counts: Mutex::new(HashMap::new()),
            total_bytes_read: AtomicU64::new(0),
        });

        let inbound_shared = Arc::clone(&shared);
        let inbound = std::thread::Builder::new()
            .name("demux-inbound".to_string())
            .spawn(move || Self::inbound_loop(inbound_shared))
            .expect("failed to spawn demux inbound thread");

        Self {
            shared,
            inbound: Mutex::new(Some(inbound)),
            pumps: Mutex::new(Vec::new()),
        }
    }

    /// Install the callback fired (with the channel group) whenever a channel
    /// breaks.
    pub fn set_on_channel_broke(&self, callback: ChannelBrokeCallback) {
        if let Ok(mut guard) = self.shared.on_channel_broke.lock() {
            *guard = Some(callback);
        }
    }

    /// Register a logical channel and start its outbound pump. `local` is the
    /// demuxer-side endpoint; chunks the consumer sends on the peer endpoint
    /// are pumped to the transport, and in-order inbound chunks are delivered
    /// back through it. Returns the channel id used on the wire.
    pub fn add(&self, local: ByteChannel, group: &str, host_id: &str) -> Result<String> {
        let channel_id = uuid::Uuid::new_v4().simple().to_string();

        {
            let mut channels = self.shared.channels.lock()?;
            channels.insert(
                channel_id.clone(),
                RegisteredChannel {
                    local: local.clone(),
                    group: group.to_string(),
                    backlog: BTreeMap::new(),
                    backlog_bytes: 0,
                    incoming_seq: 0,
                },
            );
        }

        let shared = Arc::clone(&self.shared);
        let pump_id = channel_id.clone();
        let pump_group = group.to_string();
        let pump_host = host_id.to_string();
        let pump = std::thread::Builder::new()
            .name(format!("demux-pump-{}", &channel_id[..8]))
            .spawn(move || {
                Self::pump_loop(shared, local, pump_id, pump_group, pump_host);
            })
            .map_err(|e| crate::core::FabricError::Io(e))?;

        self.pumps.lock()?.push(pump);
        Ok(channel_id)
    }

    fn pump_loop(
        shared: Arc<DemuxShared>,
        local: ByteChannel,
        channel_id: String,
        group: String,
        host_id: String,
    ) {
        let mut outgoing_seq: u64 = 0;
        loop {
            let content = match local.recv() {
                Ok(chunk) => chunk,
                Err(_) => {
                    // The consumer disconnected first: if the channel is still
                    // registered, tell the peer with a zero-length envelope so
                    // its registry stays consistent.
                    let was_registered = shared
                        .channels
                        .lock()
                        .map(|mut channels| channels.remove(&channel_id).is_some())
                        .unwrap_or(false);
                    if was_registered && !shared.shutting_down.load(Ordering::SeqCst) {
                        let close = Envelope {
                            channel_group: group.clone(),
                            channel_id: channel_id.clone(),
                            host_id: host_id.clone(),
                            sequence_number: outgoing_seq,
                            content: Vec::new(),
                        };
                        if let Err(err) = shared.send_envelope(&close) {
                            debug!(
                                "failed to send close envelope for channel {}: {}",
                                channel_id, err
                            );
                        }
                    }
                    return;
                }
            };

            let envelope = Envelope {
                channel_group: group.clone(),
                channel_id: channel_id.clone(),
                host_id: host_id.clone(),
                sequence_number: outgoing_seq,
                content,
            };
            outgoing_seq += 1;

            if let Err(err) = shared.send_envelope(&envelope) {
                if !shared.shutting_down.load(Ordering::SeqCst) {
                    error!("transport send failed on channel {}: {}", channel_id, err);
                }
                return;
            }
        }
    }

    fn inbound_loop(shared: Arc<DemuxShared>) {
        loop {
            match shared.transport.recv_frame() {
                Ok(frame) => shared.handle_frame(&frame),
                Err(_) => {
                    if !shared.shutting_down.load(Ordering::SeqCst) {
                        info!("demuxer transport closed; breaking all channels");
                        let drained: Vec<RegisteredChannel> = shared
                            .channels
                            .lock()
                            .map(|mut channels| channels.drain().map(|(_, e)| e).collect())
                            .unwrap_or_default();
                        for entry in drained {
                            entry.local.disconnect();
                            shared.fire_channel_broke(&entry.group);
                        }
                    }
                    return;
                }
            }
        }
    }

    /// Tear down every registered channel and join all worker threads.
    /// Per-channel teardown errors are swallowed; shutdown must not fail.
    pub fn close(&self) {
        self.shared.shutting_down.store(true, Ordering::SeqCst);

        let drained: Vec<RegisteredChannel> = self
            .shared
            .channels
            .lock()
            .map(|mut channels| channels.drain().map(|(_, e)| e).collect())
            .unwrap_or_default();
        for entry in drained {
            entry.local.disconnect();
        }

        self.shared.transport.close();

        if let Ok(mut pumps) = self.pumps.lock() {
            for pump in pumps.drain(..) {
                let _ = pump.join();
            }
        }
        if let Ok(mut inbound) = self.inbound.lock() {
            if let Some(handle) = inbound.take() {
                let _ = handle.join();
            }
        }
    }
}

impl Drop for ChannelDemuxer {
    fn drop(&mut self) {
        self.close();
    }
}
