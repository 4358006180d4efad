//! The exchange layer contract consumed by session-establishment clients.
//!
//! An exchange is a request/response conversation with one peer, carried
//! either over a reliable connection or over datagrams with reliable-messaging
//! acknowledgements. Clients hold exchanges through [`OwnedExchange`], which
//! aborts the exchange when dropped unless it was closed gracefully.

use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use tracing::debug;

use crate::error::Result;
use crate::ids::{ConnectionId, EncryptionType, ExchangeId, KeyId, NodeId};
use crate::message::{ProfileId, SendFlags};

/// Where a new exchange should be directed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExchangeTarget {
    /// Bind the exchange to an existing connection with `peer`.
    Connection { connection: ConnectionId, peer: NodeId },
    /// Address `peer` directly; `addr` overrides address resolution.
    Node { peer: NodeId, addr: Option<SocketAddr> },
}

impl ExchangeTarget {
    pub fn peer(&self) -> NodeId {
        match self {
            ExchangeTarget::Connection { peer, .. } | ExchangeTarget::Node { peer, .. } => *peer,
        }
    }

    pub fn connection(&self) -> Option<ConnectionId> {
        match self {
            ExchangeTarget::Connection { connection, .. } => Some(*connection),
            ExchangeTarget::Node { .. } => None,
        }
    }
}

/// Snapshot of an exchange's addressing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExchangeInfo {
    pub id: ExchangeId,
    pub peer: NodeId,
    pub connection: Option<ConnectionId>,
}

impl ExchangeInfo {
    /// Exchanges not bound to a connection rely on acknowledgements and
    /// retransmission for delivery.
    pub fn uses_reliable_messaging(&self) -> bool {
        self.connection.is_none()
    }
}

/// Transport notifications delivered back to an exchange's owner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExchangeEvent {
    /// The peer acknowledged `message_id` sent on `exchange`.
    AckReceived { exchange: ExchangeId, message_id: u32 },
    /// Delivery of a message on `exchange` failed permanently.
    SendError { exchange: ExchangeId, error: crate::error::ExchangeError },
    /// No response arrived on `exchange` in time.
    ResponseTimeout { exchange: ExchangeId },
    /// The connection was closed, by the peer or locally.
    ConnectionClosed { connection: ConnectionId },
}

/// Request/response message exchange service.
pub trait ExchangeLayer: Send + Sync {
    /// Route unsolicited messages of `profile` to the registering client.
    fn register_unsolicited_handler(&self, profile: ProfileId) -> Result<()>;

    fn unregister_unsolicited_handler(&self, profile: ProfileId) -> Result<()>;

    /// Create a new outbound exchange.
    fn new_exchange(&self, target: &ExchangeTarget) -> Result<ExchangeId>;

    fn exchange_info(&self, exchange: ExchangeId) -> Result<ExchangeInfo>;

    /// Protect subsequent messages on `exchange` with `key_id`.
    fn set_exchange_key(
        &self,
        exchange: ExchangeId,
        key_id: KeyId,
        encryption_type: EncryptionType,
    ) -> Result<()>;

    /// Send one message; returns the transport-assigned message id.
    fn send(
        &self,
        exchange: ExchangeId,
        profile: ProfileId,
        msg_type: u8,
        payload: Bytes,
        flags: SendFlags,
    ) -> Result<u32>;

    /// Immediately send any acknowledgements owed on `exchange`.
    fn flush_acks(&self, exchange: ExchangeId) -> Result<()>;

    /// Close `exchange` gracefully, letting pending acknowledgements drain.
    fn close(&self, exchange: ExchangeId);

    /// Tear `exchange` down immediately.
    fn abort(&self, exchange: ExchangeId);

    /// A session key used with `peer` has failed; abort traffic relying on it.
    fn on_key_failed(&self, peer: NodeId, key_id: KeyId, error_code: u16);
}

/// Scoped ownership of one exchange.
///
/// Dropping the handle aborts the exchange; [`OwnedExchange::close`] ends it
/// gracefully instead.
pub struct OwnedExchange {
    id: ExchangeId,
    layer: Arc<dyn ExchangeLayer>,
    open: bool,
}

impl OwnedExchange {
    /// Take ownership of an exchange already created on `layer`.
    pub fn adopt(layer: Arc<dyn ExchangeLayer>, id: ExchangeId) -> Self {
        Self { id, layer, open: true }
    }

    /// Create and own a new exchange towards `target`.
    pub fn open(layer: Arc<dyn ExchangeLayer>, target: &ExchangeTarget) -> Result<Self> {
        let id = layer.new_exchange(target)?;
        Ok(Self::adopt(layer, id))
    }

    pub fn id(&self) -> ExchangeId {
        self.id
    }

    pub fn info(&self) -> Result<ExchangeInfo> {
        self.layer.exchange_info(self.id)
    }

    pub fn send(
        &self,
        profile: ProfileId,
        msg_type: u8,
        payload: Bytes,
        flags: SendFlags,
    ) -> Result<u32> {
        self.layer.send(self.id, profile, msg_type, payload, flags)
    }

    pub fn set_key(&self, key_id: KeyId, encryption_type: EncryptionType) -> Result<()> {
        self.layer.set_exchange_key(self.id, key_id, encryption_type)
    }

    pub fn flush_acks(&self) -> Result<()> {
        self.layer.flush_acks(self.id)
    }

    /// End the exchange gracefully.
    pub fn close(mut self) {
        self.open = false;
        self.layer.close(self.id);
    }
}

impl Drop for OwnedExchange {
    fn drop(&mut self) {
        if self.open {
            debug!(exchange = %self.id, "aborting exchange");
            self.layer.abort(self.id);
        }
    }
}

impl std::fmt::Debug for OwnedExchange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OwnedExchange")
            .field("id", &self.id)
            .field("open", &self.open)
            .finish()
    }
}
