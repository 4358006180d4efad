//! The session manager.
//!
//! Drives at most one session establishment or key export at a time,
//! either started locally or by an unsolicited security-profile message
//! from a peer. Outcomes are queued as [`SecurityEvent`]s; every finished,
//! failed or abandoned attempt is followed by [`SecurityEvent::Available`].
//!
//! The manager owns no threads. The embedder feeds it inbound messages,
//! exchange events, timer expiries and decrypted-traffic notices, then
//! drains the event queue.

mod attempt;
mod cert;
mod key_export;
mod password;
mod token;

use std::mem;
use std::sync::Arc;

use bytes::Bytes;
use crossbeam_queue::SegQueue;
use fabricmsg::message::COMMON_MSG_STATUS_REPORT;
use fabricmsg::{
    EncryptionType, ExchangeEvent, ExchangeLayer, ExchangeTarget, InboundMessage, KeyId, NodeId,
    OwnedExchange, SendFlags, SystemLayer, TimerId, PROFILE_COMMON, PROFILE_SECURITY,
};
use parking_lot::Mutex;
use tracing::{debug, info, trace, warn};

use crate::config::{AuthDelegates, SecurityConfig};
use crate::engine::key_export::ExportedKeyMaterial;
use crate::error::{Result, SecurityError};
use crate::event::{
    EstablishedSession, ExportedKey, KeyErrorReport, SecurityEvent, SessionFailure,
};
use crate::key_error::{KeyErrorKind, KeyErrorMessage};
use crate::key_table::{KeyReservation, SessionKey, SessionKeyTable, SharedKeyTable};
use crate::message::{SecurityMsgType, WireReader};
use crate::status_report::{common, StatusReport};
use crate::types::{AttemptToken, ManagerState};

use self::attempt::{unexpected, Attempt, AttemptCommon, DriverCtx, StepOutcome};
use self::cert::CertAttempt;
use self::key_export::KeyExportAttempt;
use self::password::PasswordAttempt;
use self::token::TokenAttempt;

pub use self::cert::CertSessionParams;
pub use self::key_export::KeyExportParams;
pub use self::password::PasswordSessionParams;
pub use self::token::TokenSessionParams;

/// Bounds one session establishment.
pub const ESTABLISHMENT_TIMER: TimerId = TimerId(1);
/// Periodic sweep of idle session keys.
pub const IDLE_SESSION_TIMER: TimerId = TimerId(2);

struct Layers {
    exchange: Arc<dyn ExchangeLayer>,
    system: Arc<dyn SystemLayer>,
}

/// Per-node security session manager.
pub struct SecurityManager {
    local_node: NodeId,
    config: SecurityConfig,
    delegates: AuthDelegates,
    layers: Option<Layers>,
    key_table: SharedKeyTable,
    attempt: Attempt,
    events: SegQueue<SecurityEvent>,
    next_token: u64,
}

impl SecurityManager {
    /// Create a manager for `local_node`. It does nothing until [`init`](Self::init).
    pub fn new(local_node: NodeId, config: SecurityConfig, delegates: AuthDelegates) -> Result<Self> {
        config.validate()?;
        let key_table = Arc::new(Mutex::new(SessionKeyTable::new(config.max_session_keys)));
        Ok(Self {
            local_node,
            config,
            delegates,
            layers: None,
            key_table,
            attempt: Attempt::None,
            events: SegQueue::new(),
            next_token: 0,
        })
    }

    /// Bind the manager to its exchange and system layers and start
    /// accepting unsolicited security-profile messages.
    pub fn init(
        &mut self,
        exchange: Arc<dyn ExchangeLayer>,
        system: Arc<dyn SystemLayer>,
    ) -> Result<()> {
        if self.layers.is_some() {
            return Err(SecurityError::IncorrectState);
        }
        exchange.register_unsolicited_handler(PROFILE_SECURITY)?;
        if let Some(period) = self.config.idle_timeout() {
            self.key_table
                .lock()
                .attach_idle_timer(system.clone(), IDLE_SESSION_TIMER, period);
        }
        self.layers = Some(Layers { exchange, system });
        info!(node = %self.local_node, "security manager initialized");
        Ok(())
    }

    /// Drop any attempt without reporting it and detach from the layers.
    /// Established keys stay in the table.
    pub fn shutdown(&mut self) {
        let Some(layers) = self.layers.take() else {
            return;
        };
        layers.system.cancel_timer(ESTABLISHMENT_TIMER);
        drop(mem::replace(&mut self.attempt, Attempt::None));
        self.key_table.lock().detach_idle_timer();
        if let Err(e) = layers.exchange.unregister_unsolicited_handler(PROFILE_SECURITY) {
            debug!(error = %e, "unsolicited handler already gone");
        }
        info!(node = %self.local_node, "security manager shut down");
    }

    pub fn state(&self) -> ManagerState {
        if self.layers.is_none() {
            return ManagerState::NotInitialized;
        }
        self.attempt.manager_state()
    }

    pub fn local_node(&self) -> NodeId {
        self.local_node
    }

    pub fn config(&self) -> &SecurityConfig {
        &self.config
    }

    /// The session key table shared with the message layer.
    pub fn key_table(&self) -> &SharedKeyTable {
        &self.key_table
    }

    pub fn is_key_error(err: &SecurityError) -> bool {
        err.is_key_error()
    }

    pub fn poll_event(&self) -> Option<SecurityEvent> {
        self.events.pop()
    }

    pub fn drain_events(&self) -> Vec<SecurityEvent> {
        std::iter::from_fn(|| self.events.pop()).collect()
    }

    // ── Inbound ─────────────────────────────────────────────────────────

    /// Deliver a message received on an exchange.
    ///
    /// Messages on the active attempt's exchange drive it; other
    /// security-profile messages are treated as unsolicited.
    pub fn handle_message(&mut self, msg: InboundMessage) -> Result<()> {
        self.require_initialized()?;
        if self.attempt.exchange_id() == Some(msg.exchange) {
            self.handle_attempt_message(&msg);
        } else if msg.profile == PROFILE_SECURITY {
            self.handle_unsolicited_message(msg);
        } else {
            debug!(exchange = %msg.exchange, profile = msg.profile, "ignoring message for unknown exchange");
        }
        Ok(())
    }

    pub fn handle_exchange_event(&mut self, event: ExchangeEvent) -> Result<()> {
        self.require_initialized()?;
        match event {
            ExchangeEvent::AckReceived { exchange, message_id } => {
                let done = matches!(&self.attempt, Attempt::Cert(a)
                    if a.completes_on_ack(exchange, message_id));
                if done {
                    self.complete_session();
                }
            }
            ExchangeEvent::SendError { exchange, error } => {
                if self.attempt.exchange_id() == Some(exchange) {
                    self.fail_attempt(SecurityError::Exchange(error));
                }
            }
            ExchangeEvent::ResponseTimeout { exchange } => {
                if self.attempt.exchange_id() == Some(exchange) {
                    self.fail_attempt(SecurityError::Timeout);
                }
            }
            ExchangeEvent::ConnectionClosed { connection } => {
                if self.attempt.common().and_then(|c| c.connection) == Some(connection) {
                    self.fail_attempt(SecurityError::ConnectionClosed);
                }
                let removed = self.key_table.lock().remove_connection(connection);
                if !removed.is_empty() {
                    debug!(%connection, count = removed.len(), "removed keys of closed connection");
                }
            }
        }
        Ok(())
    }

    pub fn handle_timer(&mut self, timer: TimerId) -> Result<()> {
        self.require_initialized()?;
        if timer == ESTABLISHMENT_TIMER {
            if !self.attempt.is_none() {
                self.fail_attempt(SecurityError::Timeout);
            }
        } else if timer == IDLE_SESSION_TIMER {
            let removed = self.key_table.lock().on_idle_timer();
            for key in &removed {
                debug!(key_id = %key.key_id(), peer = %key.peer(), "removed idle session key");
            }
        } else {
            trace!(?timer, "ignoring unknown timer");
        }
        Ok(())
    }

    /// Note that a message protected by `key_id` arrived from `peer`.
    pub fn on_encrypted_message_received(&mut self, peer: NodeId, key_id: KeyId) -> Result<()> {
        self.require_initialized()?;
        self.key_table.lock().mark_active(key_id, peer);
        let done = matches!(&self.attempt, Attempt::Cert(a) if a.completes_on_traffic(peer, key_id));
        if done {
            self.complete_session();
        }
        Ok(())
    }

    // ── Key table ───────────────────────────────────────────────────────

    /// Take a hold on an established key so the idle sweep keeps it.
    pub fn reserve_session_key(&mut self, key_id: KeyId, peer: NodeId) -> Result<KeyReservation> {
        let slot = self.key_table.lock().reserve(key_id, peer)?;
        Ok(KeyReservation::adopt(&self.key_table, slot))
    }

    pub fn release_session_key(&mut self, reservation: KeyReservation) {
        reservation.release();
    }

    /// Tell `target` its message `message_id` could not be processed with
    /// `key_id`.
    pub fn send_key_error(
        &mut self,
        target: &ExchangeTarget,
        key_id: KeyId,
        encryption_type: EncryptionType,
        message_id: u32,
        kind: KeyErrorKind,
    ) -> Result<()> {
        let msg = KeyErrorMessage::new(key_id, encryption_type, message_id, kind);
        let exchange = self.open_exchange(target)?;
        exchange.send(
            PROFILE_SECURITY,
            SecurityMsgType::KeyError.as_u8(),
            msg.encode(),
            SendFlags::NONE,
        )?;
        exchange.close();
        debug!(peer = %target.peer(), %key_id, %kind, "sent key error");
        Ok(())
    }

    /// Tell `target` to discard `key_id` and remove it locally.
    pub fn end_session(&mut self, target: &ExchangeTarget, key_id: KeyId) -> Result<()> {
        let exchange = self.open_exchange(target)?;
        exchange.send(
            PROFILE_SECURITY,
            SecurityMsgType::EndSession.as_u8(),
            Bytes::copy_from_slice(&key_id.raw().to_le_bytes()),
            SendFlags::NONE,
        )?;
        exchange.close();
        self.key_table.lock().remove_for_peer(key_id, target.peer());
        info!(peer = %target.peer(), %key_id, "session ended");
        Ok(())
    }

    // ── Attempt control ─────────────────────────────────────────────────

    /// Abort the attempt started with `token`. It fails with
    /// `TransactionCanceled`; the failure event carries no token.
    pub fn cancel_session_establishment(&mut self, token: AttemptToken) -> Result<()> {
        match self.attempt.common_mut() {
            Some(common) if common.token == Some(token) => common.token = None,
            _ => return Err(SecurityError::InvalidArgument("no attempt for token")),
        }
        self.fail_attempt(SecurityError::TransactionCanceled);
        Ok(())
    }

    /// Drop the active attempt without reporting an error.
    pub fn reset(&mut self) {
        let attempt = mem::replace(&mut self.attempt, Attempt::None);
        if attempt.is_none() {
            return;
        }
        debug!(state = %attempt.manager_state(), "attempt reset");
        self.cancel_establishment_timer();
        drop(attempt);
        self.events.push(SecurityEvent::Available);
    }

    // ── Helpers shared with the drivers ─────────────────────────────────

    fn require_initialized(&self) -> Result<&Layers> {
        self.layers.as_ref().ok_or(SecurityError::IncorrectState)
    }

    fn check_available(&self) -> Result<()> {
        self.require_initialized()?;
        if !self.attempt.is_none() {
            return Err(SecurityError::Busy);
        }
        Ok(())
    }

    fn open_exchange(&self, target: &ExchangeTarget) -> Result<OwnedExchange> {
        let layers = self.require_initialized()?;
        Ok(OwnedExchange::open(layers.exchange.clone(), target)?)
    }

    fn next_token(&mut self) -> AttemptToken {
        self.next_token += 1;
        AttemptToken(self.next_token)
    }

    fn ctx(&self) -> Result<DriverCtx<'_>> {
        let layers = self.require_initialized()?;
        Ok(DriverCtx {
            local_node: self.local_node,
            config: &self.config,
            delegates: &self.delegates,
            table: &self.key_table,
            system: &layers.system,
        })
    }

    fn install(&mut self, attempt: Attempt) {
        debug!(state = %attempt.manager_state(), "attempt started");
        self.attempt = attempt;
        if let (Some(layers), Some(timeout)) = (&self.layers, self.config.establishment_timeout()) {
            layers.system.start_timer(ESTABLISHMENT_TIMER, timeout);
        }
    }

    fn cancel_establishment_timer(&self) {
        if let Some(layers) = &self.layers {
            layers.system.cancel_timer(ESTABLISHMENT_TIMER);
        }
    }

    // ── Attempt driving ─────────────────────────────────────────────────

    fn handle_attempt_message(&mut self, msg: &InboundMessage) {
        if msg.is(PROFILE_COMMON, COMMON_MSG_STATUS_REPORT) {
            let result = StatusReport::decode(&msg.payload)
                .and_then(|report| self.step_status_report(report));
            self.apply(result);
            return;
        }
        if msg.profile != PROFILE_SECURITY {
            self.fail_attempt(unexpected(msg));
            return;
        }
        match SecurityMsgType::try_from(msg.msg_type) {
            Err(e) => self.fail_attempt(e),
            Ok(SecurityMsgType::KeyError) => match self.handle_key_error(msg) {
                Ok(kind) => self.fail_attempt(SecurityError::KeyFromPeer(kind)),
                Err(e) => self.fail_attempt(e),
            },
            Ok(msg_type) => {
                let result = self.step_message(msg_type, msg);
                self.apply(result);
            }
        }
    }

    fn step_message(&mut self, msg_type: SecurityMsgType, msg: &InboundMessage) -> Result<StepOutcome> {
        let layers = self.layers.as_ref().ok_or(SecurityError::IncorrectState)?;
        let ctx = DriverCtx {
            local_node: self.local_node,
            config: &self.config,
            delegates: &self.delegates,
            table: &self.key_table,
            system: &layers.system,
        };
        self.attempt.on_message(&ctx, msg_type, msg)
    }

    fn step_status_report(&mut self, report: StatusReport) -> Result<StepOutcome> {
        let layers = self.layers.as_ref().ok_or(SecurityError::IncorrectState)?;
        let ctx = DriverCtx {
            local_node: self.local_node,
            config: &self.config,
            delegates: &self.delegates,
            table: &self.key_table,
            system: &layers.system,
        };
        self.attempt.on_status_report(&ctx, report)
    }

    fn apply(&mut self, result: Result<StepOutcome>) {
        match result {
            Ok(StepOutcome::Continue) => {}
            Ok(StepOutcome::Established) => self.complete_session(),
            Ok(StepOutcome::Abandoned) => self.abandon_attempt(),
            Ok(StepOutcome::Exported(material)) => self.complete_key_export(material),
            Err(error) => self.fail_attempt(error),
        }
    }

    fn take_attempt(&mut self) -> Option<AttemptCommon> {
        let attempt = mem::replace(&mut self.attempt, Attempt::None);
        let common = attempt.into_common()?;
        self.cancel_establishment_timer();
        Some(common)
    }

    fn complete_session(&mut self) {
        let Some(mut common) = self.take_attempt() else {
            warn!("session established with no attempt in progress");
            return;
        };
        if let Some(exchange) = common.exchange.take() {
            exchange.close();
        }
        let reservation = common.reservation.take();
        // A peer-initiated session keeps no hold on its key.
        let reservation = if common.locally_initiated {
            reservation
        } else {
            if let Some(reservation) = reservation {
                reservation.release();
            }
            None
        };

        info!(
            peer = %common.reported_peer(),
            key_id = %common.key_id,
            auth_mode = %common.auth_mode,
            initiator = common.locally_initiated,
            "session established"
        );
        self.events.push(SecurityEvent::SessionEstablished(EstablishedSession {
            token: common.token,
            peer: common.reported_peer(),
            connection: common.connection,
            key_id: common.key_id,
            encryption_type: common.encryption_type,
            auth_mode: common.auth_mode,
            reservation,
        }));
        self.events.push(SecurityEvent::Available);
    }

    fn complete_key_export(&mut self, material: ExportedKeyMaterial) {
        let Some(mut common) = self.take_attempt() else {
            warn!("key export finished with no attempt in progress");
            return;
        };
        if let Some(exchange) = common.exchange.take() {
            exchange.close();
        }
        info!(peer = %common.peer, key_id = material.key_id, "key export complete");
        self.events.push(SecurityEvent::KeyExportComplete(ExportedKey {
            token: common.token,
            peer: common.peer,
            connection: common.connection,
            key_id: material.key_id,
            key: material.key,
        }));
        self.events.push(SecurityEvent::Available);
    }

    /// The exchange has nothing more to carry, and no session resulted.
    fn abandon_attempt(&mut self) {
        let Some(mut common) = self.take_attempt() else {
            return;
        };
        if let Some(exchange) = common.exchange.take() {
            exchange.close();
        }
        debug!(peer = %common.peer, "attempt finished without a session");
        drop(common);
        self.events.push(SecurityEvent::Available);
    }

    fn fail_attempt(&mut self, error: SecurityError) {
        let key_export = matches!(self.attempt, Attempt::KeyExport(_));
        let state = self.attempt.manager_state();
        let Some(mut common) = self.take_attempt() else {
            debug!(%error, "error with no attempt in progress");
            return;
        };
        warn!(peer = %common.peer, %state, %error, "session establishment failed");

        let status_report = match error {
            SecurityError::StatusReportReceived { profile, code } => {
                Some(StatusReport::new(profile, code))
            }
            _ => {
                if let Err(e) = common.send_status_report(StatusReport::for_error(&error)) {
                    debug!(error = %e, "status report not sent");
                }
                None
            }
        };

        if let Some(reservation) = common.reservation.take() {
            reservation.remove_key();
        }
        let failure = SessionFailure {
            token: common.token,
            peer: common.reported_peer(),
            connection: common.connection,
            error,
            status_report,
        };
        // Aborts the exchange.
        drop(common);

        self.events.push(if key_export {
            SecurityEvent::KeyExportFailed(failure)
        } else {
            SecurityEvent::SessionFailed(failure)
        });
        self.events.push(SecurityEvent::Available);
    }

    // ── Unsolicited messages ────────────────────────────────────────────

    fn handle_unsolicited_message(&mut self, msg: InboundMessage) {
        let Some(layers) = &self.layers else {
            return;
        };
        let exchange = OwnedExchange::adopt(layers.exchange.clone(), msg.exchange);

        let msg_type = match SecurityMsgType::try_from(msg.msg_type) {
            Ok(msg_type) => msg_type,
            Err(e) => {
                reject(exchange, StatusReport::for_error(&e));
                return;
            }
        };

        use SecurityMsgType::*;
        match msg_type {
            KeyError => {
                exchange.close();
                if let Err(e) = self.handle_key_error(&msg) {
                    warn!(peer = %msg.peer, error = %e, "dropping malformed key error");
                }
                return;
            }
            EndSession => {
                exchange.close();
                self.handle_end_session(&msg);
                return;
            }
            PasswordInitiatorStep1 | CertBeginSessionRequest | TokenIdentifyToken
            | KeyExportRequest => {}
            _ => {
                reject(exchange, StatusReport::for_error(&unexpected(&msg)));
                return;
            }
        }

        if !self.attempt.is_none() {
            info!(peer = %msg.peer, ?msg_type, state = %self.attempt.manager_state(), "busy, rejecting session request");
            reject(exchange, StatusReport::common(common::BUSY));
            return;
        }

        let mut common = AttemptCommon::responder(exchange, &msg);
        let attempt = {
            let ctx = match self.ctx() {
                Ok(ctx) => ctx,
                Err(_) => return,
            };
            match msg_type {
                PasswordInitiatorStep1 => {
                    Attempt::Password(Box::new(PasswordAttempt::responder(&ctx, common)))
                }
                CertBeginSessionRequest => match ctx.delegates.cert.clone() {
                    Some(delegate) => {
                        Attempt::Cert(Box::new(CertAttempt::responder(&ctx, common, delegate)))
                    }
                    None => {
                        reject_attempt(&mut common, SecurityError::MissingCredentials("certificate"));
                        return;
                    }
                },
                TokenIdentifyToken => match ctx.delegates.token.clone() {
                    Some(delegate) => {
                        Attempt::Token(Box::new(TokenAttempt::responder(&ctx, common, delegate)))
                    }
                    None => {
                        reject_attempt(&mut common, SecurityError::MissingCredentials("token"));
                        return;
                    }
                },
                _ => Attempt::KeyExport(Box::new(KeyExportAttempt::responder(&ctx, common))),
            }
        };

        debug!(peer = %msg.peer, ?msg_type, "peer started an attempt");
        self.install(attempt);
        let result = self.step_message(msg_type, &msg);
        self.apply(result);
    }

    /// Process a key error from a peer: remove the key and notify the
    /// message layer for every node that used it.
    fn handle_key_error(&mut self, msg: &InboundMessage) -> Result<KeyErrorKind> {
        let report = KeyErrorMessage::decode(&msg.payload)?;
        let kind = report.kind();

        let removed = if report.key_id.is_session() {
            let mut table = self.key_table.lock();
            let slot = table.find(report.key_id, msg.peer).map(SessionKey::slot);
            slot.and_then(|slot| table.remove_slot(&slot))
        } else {
            None
        };

        let peers = match &removed {
            Some(entry) if entry.is_shared() => {
                let mut peers = entry.end_nodes().to_vec();
                if !peers.contains(&msg.peer) {
                    peers.push(msg.peer);
                }
                peers
            }
            Some(entry) => vec![entry.peer()],
            None => vec![msg.peer],
        };
        if let Some(layers) = &self.layers {
            for peer in &peers {
                layers
                    .exchange
                    .on_key_failed(*peer, report.key_id, report.error_code);
            }
        }

        warn!(peer = %msg.peer, key_id = %report.key_id, %kind, removed = removed.is_some(), "key error received");
        self.events.push(SecurityEvent::KeyErrorReceived(KeyErrorReport {
            peer: msg.peer,
            key_id: report.key_id,
            encryption_type: report.encryption_type(),
            message_id: report.message_id,
            error: SecurityError::KeyFromPeer(kind),
        }));
        Ok(kind)
    }

    fn handle_end_session(&mut self, msg: &InboundMessage) {
        let mut r = WireReader::new(&msg.payload);
        let key_id = match r.u16().and_then(|raw| r.finish().map(|()| KeyId::from_raw(raw))) {
            Ok(key_id) => key_id,
            Err(e) => {
                warn!(peer = %msg.peer, error = %e, "dropping malformed end session");
                return;
            }
        };
        let removed = self.key_table.lock().remove_for_peer(key_id, msg.peer);
        info!(peer = %msg.peer, %key_id, removed, "peer ended session");
    }
}

/// Answer a message we will not process and close its exchange.
fn reject(exchange: OwnedExchange, report: StatusReport) {
    if let Err(e) = exchange.send(
        PROFILE_COMMON,
        COMMON_MSG_STATUS_REPORT,
        report.encode(),
        SendFlags::NONE,
    ) {
        debug!(error = %e, "rejection not sent");
    }
    exchange.close();
}

fn reject_attempt(common: &mut AttemptCommon, error: SecurityError) {
    warn!(peer = %common.peer, %error, "rejecting session request");
    if let Some(exchange) = common.exchange.take() {
        reject(exchange, StatusReport::for_error(&error));
    }
}
