//! The in-flight handshake attempt.
//!
//! At most one attempt exists per manager. Its protocol engine lives inside
//! the [`Attempt`] variant, so the manager state and the engine can never
//! disagree. Dropping an attempt aborts its exchange and gives back its key:
//! an uncommitted key is removed, a committed one is released.

use std::sync::Arc;

use bytes::Bytes;
use fabricmsg::{
    ConnectionId, EncryptionType, ExchangeId, InboundMessage, KeyId, NodeId, OwnedExchange,
    SendFlags, SystemLayer, PROFILE_COMMON, PROFILE_SECURITY,
};
use fabricmsg::message::COMMON_MSG_STATUS_REPORT;
use tracing::trace;

use crate::config::{AuthDelegates, SecurityConfig};
use crate::crypto::keys::SessionKeyMaterial;
use crate::crypto::x25519::{EphemeralKeyPair, HandshakeRole};
use crate::engine::key_export::ExportedKeyMaterial;
use crate::error::{Result, SecurityError};
use crate::key_table::{KeyReservation, NewSessionKey, SharedKeyTable};
use crate::message::SecurityMsgType;
use crate::status_report::StatusReport;
use crate::types::{AttemptToken, AuthMode, ManagerState};

use super::cert::CertAttempt;
use super::key_export::KeyExportAttempt;
use super::password::PasswordAttempt;
use super::token::TokenAttempt;

/// State every protocol driver shares.
pub(crate) struct AttemptCommon {
    /// Caller context; `None` for peer-initiated or cancelled attempts.
    pub token: Option<AttemptToken>,
    /// Node the handshake runs with.
    pub peer: NodeId,
    pub connection: Option<ConnectionId>,
    pub exchange: Option<OwnedExchange>,
    pub reservation: Option<KeyReservation>,
    pub key_id: KeyId,
    pub encryption_type: EncryptionType,
    pub auth_mode: AuthMode,
    /// Key material has been written to the table.
    pub committed: bool,
    pub locally_initiated: bool,
    /// Requesting end node of a shared session.
    pub end_node: Option<NodeId>,
}

impl AttemptCommon {
    pub fn initiator(
        token: AttemptToken,
        exchange: OwnedExchange,
        peer: NodeId,
        connection: Option<ConnectionId>,
        encryption_type: EncryptionType,
        auth_mode: AuthMode,
    ) -> Self {
        Self {
            token: Some(token),
            peer,
            connection,
            exchange: Some(exchange),
            reservation: None,
            key_id: KeyId::NONE,
            encryption_type,
            auth_mode,
            committed: false,
            locally_initiated: true,
            end_node: None,
        }
    }

    pub fn responder(exchange: OwnedExchange, msg: &InboundMessage) -> Self {
        Self {
            token: None,
            peer: msg.peer,
            connection: msg.connection,
            exchange: Some(exchange),
            reservation: None,
            key_id: KeyId::NONE,
            encryption_type: EncryptionType::None,
            auth_mode: AuthMode::NotSpecified,
            committed: false,
            locally_initiated: false,
            end_node: None,
        }
    }

    pub fn exchange(&self) -> Result<&OwnedExchange> {
        self.exchange.as_ref().ok_or(SecurityError::IncorrectState)
    }

    pub fn exchange_id(&self) -> Option<ExchangeId> {
        self.exchange.as_ref().map(OwnedExchange::id)
    }

    /// Send a security-profile message on the attempt's exchange.
    pub fn send(&self, msg_type: SecurityMsgType, payload: Bytes, flags: SendFlags) -> Result<u32> {
        let id = self
            .exchange()?
            .send(PROFILE_SECURITY, msg_type.as_u8(), payload, flags)?;
        trace!(peer = %self.peer, ?msg_type, message_id = id, "sent handshake message");
        Ok(id)
    }

    pub fn send_status_report(&self, report: StatusReport) -> Result<()> {
        self.exchange()?.send(
            PROFILE_COMMON,
            COMMON_MSG_STATUS_REPORT,
            report.encode(),
            SendFlags::NONE,
        )?;
        Ok(())
    }

    pub fn uses_reliable_messaging(&self) -> bool {
        self.connection.is_none()
    }

    /// Send pending acknowledgements before a slow step so the peer does
    /// not retransmit while we compute.
    pub fn flush_acks_before_crypto(&self, msg: &InboundMessage) -> Result<()> {
        if msg.ack_requested && self.uses_reliable_messaging() {
            self.exchange()?.flush_acks()?;
        }
        Ok(())
    }

    /// Node reported to the caller: the end node of a shared session,
    /// otherwise the handshake peer.
    pub fn reported_peer(&self) -> NodeId {
        self.end_node.unwrap_or(self.peer)
    }
}

impl Drop for AttemptCommon {
    fn drop(&mut self) {
        if let Some(reservation) = self.reservation.take() {
            if self.committed {
                reservation.release();
            } else {
                reservation.remove_key();
            }
        }
    }
}

/// What the manager does after a driver step.
pub(crate) enum StepOutcome {
    /// Wait for the next message.
    Continue,
    /// The key is committed; report the session.
    Established,
    /// Nothing more to do on this exchange; go idle without a session.
    Abandoned,
    Exported(ExportedKeyMaterial),
}

/// Borrowed manager services handed to a driver step.
pub(crate) struct DriverCtx<'a> {
    pub local_node: NodeId,
    pub config: &'a SecurityConfig,
    pub delegates: &'a AuthDelegates,
    pub table: &'a SharedKeyTable,
    pub system: &'a Arc<dyn SystemLayer>,
}

impl DriverCtx<'_> {
    pub fn ephemeral(&self, role: HandshakeRole) -> EphemeralKeyPair {
        EphemeralKeyPair::for_handshake(role, self.config.force_test_ephemeral_key)
    }

    /// Run `f` between the system layer's expensive-crypto hooks.
    pub fn crypto<T>(&self, f: impl FnOnce() -> T) -> T {
        self.system.on_expensive_crypto_start();
        let out = f();
        self.system.on_expensive_crypto_end();
        out
    }

    /// Allocate the attempt's table entry; the attempt holds its one reservation.
    pub fn alloc_key(&self, common: &mut AttemptCommon, req: NewSessionKey) -> Result<()> {
        let slot = self.table.lock().alloc(req)?;
        common.key_id = slot.key_id;
        common.reservation = Some(KeyReservation::adopt(self.table, slot));
        Ok(())
    }

    /// Alloc request for a peer-proposed key on the responder side.
    pub fn responder_key(
        common: &AttemptCommon,
        key_id: KeyId,
        encryption_type: EncryptionType,
        auth_mode: AuthMode,
    ) -> NewSessionKey {
        NewSessionKey {
            key_id: Some(key_id),
            peer: common.peer,
            encryption_type,
            auth_mode,
            connection: common.connection,
            locally_initiated: false,
            remove_on_idle: common.connection.is_none(),
            shared_end_node: None,
        }
    }

    /// Write negotiated key material to the attempt's entry.
    pub fn commit_key(
        &self,
        common: &mut AttemptCommon,
        material: SessionKeyMaterial,
        auth_mode: AuthMode,
    ) -> Result<()> {
        let slot = common
            .reservation
            .as_ref()
            .map(KeyReservation::slot)
            .ok_or(SecurityError::IncorrectState)?;
        self.table.lock().set_key(&slot, material, auth_mode)?;
        common.auth_mode = auth_mode;
        common.committed = true;
        Ok(())
    }
}

/// The active attempt, if any.
pub(crate) enum Attempt {
    None,
    Password(Box<PasswordAttempt>),
    Cert(Box<CertAttempt>),
    Token(Box<TokenAttempt>),
    KeyExport(Box<KeyExportAttempt>),
}

impl Attempt {
    pub fn is_none(&self) -> bool {
        matches!(self, Attempt::None)
    }

    pub fn manager_state(&self) -> ManagerState {
        match self {
            Attempt::None => ManagerState::Idle,
            Attempt::Password(_) => ManagerState::PasswordInProgress,
            Attempt::Cert(_) => ManagerState::CertInProgress,
            Attempt::Token(_) => ManagerState::TokenInProgress,
            Attempt::KeyExport(_) => ManagerState::KeyExportInProgress,
        }
    }

    pub fn common(&self) -> Option<&AttemptCommon> {
        match self {
            Attempt::None => None,
            Attempt::Password(a) => Some(&a.common),
            Attempt::Cert(a) => Some(&a.common),
            Attempt::Token(a) => Some(&a.common),
            Attempt::KeyExport(a) => Some(&a.common),
        }
    }

    pub fn common_mut(&mut self) -> Option<&mut AttemptCommon> {
        match self {
            Attempt::None => None,
            Attempt::Password(a) => Some(&mut a.common),
            Attempt::Cert(a) => Some(&mut a.common),
            Attempt::Token(a) => Some(&mut a.common),
            Attempt::KeyExport(a) => Some(&mut a.common),
        }
    }

    /// Drop the engine and keep the shared state.
    pub fn into_common(self) -> Option<AttemptCommon> {
        match self {
            Attempt::None => None,
            Attempt::Password(a) => Some(a.common),
            Attempt::Cert(a) => Some(a.common),
            Attempt::Token(a) => Some(a.common),
            Attempt::KeyExport(a) => Some(a.common),
        }
    }

    pub fn exchange_id(&self) -> Option<ExchangeId> {
        self.common().and_then(AttemptCommon::exchange_id)
    }

    /// Run one inbound handshake message through the active driver.
    pub fn on_message(
        &mut self,
        ctx: &DriverCtx<'_>,
        msg_type: SecurityMsgType,
        msg: &InboundMessage,
    ) -> Result<StepOutcome> {
        match self {
            Attempt::None => Err(SecurityError::IncorrectState),
            Attempt::Password(a) => a.on_message(ctx, msg_type, msg),
            Attempt::Cert(a) => a.on_message(ctx, msg_type, msg),
            Attempt::Token(a) => a.on_message(ctx, msg_type, msg),
            Attempt::KeyExport(a) => a.on_message(ctx, msg_type, msg),
        }
    }

    /// A status report arrived on the attempt's exchange.
    pub fn on_status_report(
        &mut self,
        ctx: &DriverCtx<'_>,
        report: StatusReport,
    ) -> Result<StepOutcome> {
        match self {
            Attempt::Password(a) => a.on_status_report(ctx, report),
            _ => Err(report.to_error()),
        }
    }
}

/// Reject any message type the current driver step does not expect.
pub(crate) fn unexpected(msg: &InboundMessage) -> SecurityError {
    SecurityError::UnexpectedMessage {
        profile: msg.profile,
        msg_type: msg.msg_type,
    }
}
