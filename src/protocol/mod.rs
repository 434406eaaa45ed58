//! The view protocol: the messages exchanged between a client view and the
//! keyspace manager, and the channel abstractions they travel over.
//!
//! Both directions are closed unions with a recursive `Bundle` variant so a
//! burst of messages can travel as one unit and be applied in order.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::channel::{ByteChannel, DuplexChannel};
use crate::core::{FabricError, KeyRange, PartialEvent, Result};

/// Client → manager.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ClientMessage {
    /// Present the opaque bearer token that authorizes this connection.
    Authorize { token: String },
    Subscribe(KeyRange),
    Unsubscribe(KeyRange),
    PushEvent(PartialEvent),
    /// Answer to a minimum-id probe: the smallest event id this client might
    /// still need replayed.
    MinimumIdResponse { ping_id: u64, min_event_id: u64 },
    FlushRequest { flush_id: u64 },
    Bundle(Vec<ClientMessage>),
}

/// Manager → client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ManagerMessage {
    /// Session handshake: assigns the client id used to tag this view's
    /// writes and the event id its counter starts above, which keeps ids
    /// monotonic across reconnects.
    Initialize { client_id: u32, base_event_id: u64 },
    KeyUpdates(Vec<PartialEvent>),
    /// The initial load for this exact range is complete; live updates follow.
    SubscriptionEnd(KeyRange),
    MinimumId { ping_id: u64 },
    FlushResponse { flush_id: u64 },
    Bundle(Vec<ManagerMessage>),
}

/// The channel a view speaks the protocol over. Send and receive both block;
/// either side may disconnect, after which every operation fails with
/// `Disconnected`.
pub trait ViewChannel: Send + Sync {
    fn send(&self, message: ClientMessage) -> Result<()>;
    fn recv(&self) -> Result<ManagerMessage>;
    fn disconnect(&self);
}

/// In-process client endpoint of a view channel.
pub type InMemoryViewChannel = DuplexChannel<ClientMessage, ManagerMessage>;

/// In-process manager endpoint of a view channel.
pub type ManagerChannel = DuplexChannel<ManagerMessage, ClientMessage>;

/// A connected (client, manager) endpoint pair.
pub fn view_channel_pair() -> (InMemoryViewChannel, ManagerChannel) {
    DuplexChannel::pair()
}

impl ViewChannel for InMemoryViewChannel {
    fn send(&self, message: ClientMessage) -> Result<()> {
        DuplexChannel::send(self, message)
    }

    fn recv(&self) -> Result<ManagerMessage> {
        DuplexChannel::recv(self)
    }

    fn disconnect(&self) {
        DuplexChannel::disconnect(self);
    }
}

/// Runs a typed message protocol over a byte channel (typically one logical
/// channel of a demultiplexer), JSON-encoding each message as one chunk.
pub struct SerializedChannel<S, R> {
    byte_channel: ByteChannel,
    _marker: std::marker::PhantomData<fn(S) -> R>,
}

impl<S: Serialize, R: DeserializeOwned> SerializedChannel<S, R> {
    pub fn new(byte_channel: ByteChannel) -> Self {
        Self {
            byte_channel,
            _marker: std::marker::PhantomData,
        }
    }

    pub fn send(&self, message: S) -> Result<()> {
        let encoded =
            serde_json::to_vec(&message).map_err(|e| FabricError::Codec(e.to_string()))?;
        self.byte_channel.send(encoded)
    }

    pub fn recv(&self) -> Result<R> {
        let chunk = self.byte_channel.recv()?;
        serde_json::from_slice(&chunk).map_err(|e| FabricError::Codec(e.to_string()))
    }

    pub fn disconnect(&self) {
        self.byte_channel.disconnect();
    }
}

/// Client endpoint of the view protocol over a byte channel.
pub type SerializedViewChannel = SerializedChannel<ClientMessage, ManagerMessage>;

/// Manager endpoint of the view protocol over a byte channel.
pub type SerializedManagerChannel = SerializedChannel<ManagerMessage, ClientMessage>;

impl ViewChannel for SerializedViewChannel {
    fn send(&self, message: ClientMessage) -> Result<()> {
        SerializedChannel::send(self, message)
    }

    fn recv(&self) -> Result<ManagerMessage> {
        SerializedChannel::recv(self)
    }

    fn disconnect(&self) {
        SerializedChannel::disconnect(self);
    }
}
