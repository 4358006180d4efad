//! Notifications produced by the session manager.
//!
//! Events are queued while an entry point runs and handed to the owner
//! afterwards through [`SecurityManager::poll_event`](crate::SecurityManager::poll_event),
//! so a handler reacting to one may call back into the manager freely.

use std::fmt;

use fabricmsg::{ConnectionId, EncryptionType, KeyId, NodeId};
use zeroize::Zeroizing;

use crate::error::SecurityError;
use crate::key_table::KeyReservation;
use crate::status_report::StatusReport;
use crate::types::{AttemptToken, AuthMode};

#[derive(Debug)]
pub enum SecurityEvent {
    SessionEstablished(EstablishedSession),
    SessionFailed(SessionFailure),
    KeyExportComplete(ExportedKey),
    KeyExportFailed(SessionFailure),
    KeyErrorReceived(KeyErrorReport),
    /// The manager is idle and will accept a new attempt.
    Available,
}

/// A session key ready for use.
#[derive(Debug)]
pub struct EstablishedSession {
    /// Caller context of a locally started attempt; `None` for peer-initiated sessions.
    pub token: Option<AttemptToken>,
    pub peer: NodeId,
    pub connection: Option<ConnectionId>,
    pub key_id: KeyId,
    pub encryption_type: EncryptionType,
    pub auth_mode: AuthMode,
    /// The initiator's reservation on the new key. Dropping it releases the key.
    pub reservation: Option<KeyReservation>,
}

/// A failed session establishment or key export.
#[derive(Debug)]
pub struct SessionFailure {
    /// `None` when the attempt was peer-initiated or its caller cancelled it.
    pub token: Option<AttemptToken>,
    pub peer: NodeId,
    pub connection: Option<ConnectionId>,
    pub error: SecurityError,
    /// Status report sent by the peer, when that is what ended the attempt.
    pub status_report: Option<StatusReport>,
}

pub struct ExportedKey {
    pub token: Option<AttemptToken>,
    pub peer: NodeId,
    pub connection: Option<ConnectionId>,
    pub key_id: u32,
    pub key: Zeroizing<Vec<u8>>,
}

impl fmt::Debug for ExportedKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExportedKey")
            .field("token", &self.token)
            .field("peer", &self.peer)
            .field("connection", &self.connection)
            .field("key_id", &self.key_id)
            .field("len", &self.key.len())
            .finish()
    }
}

/// A key error reported by a peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyErrorReport {
    pub peer: NodeId,
    pub key_id: KeyId,
    /// `None` if the peer named an encryption type this node does not know.
    pub encryption_type: Option<EncryptionType>,
    pub message_id: u32,
    pub error: SecurityError,
}
