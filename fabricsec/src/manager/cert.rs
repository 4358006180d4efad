//! Certificate session driver.
//!
//!   Initiator                              Responder
//!     |--- BeginSessionRequest ------------->|
//!     |<-- BeginSessionResponse -------------|   (or Reconfigure)
//!     |--- InitiatorKeyConfirm ------------->|   (key confirmation only)
//!
//! Without key confirmation the responder cannot know the initiator derived
//! the key until the initiator acknowledges the response or sends the first
//! message under the new key. On a connection the response's delivery is
//! enough.

use std::sync::Arc;

use fabricmsg::{EncryptionType, ExchangeId, ExchangeTarget, InboundMessage, KeyId, NodeId, SendFlags};
use tracing::{debug, info};

use crate::crypto::x25519::HandshakeRole;
use crate::engine::cert::{self, CertDelegate, CertEngine, CertProposal, CertRequestOutcome};
use crate::engine::{config_allowed, preferred_config};
use crate::error::{Result, SecurityError};
use crate::event::{EstablishedSession, SecurityEvent};
use crate::key_table::{KeyReservation, NewSessionKey};
use crate::message::SecurityMsgType;
use crate::types::{AttemptToken, AuthMode, CertType};

use super::attempt::{unexpected, Attempt, AttemptCommon, DriverCtx, StepOutcome};
use super::SecurityManager;

/// Arguments to [`SecurityManager::start_cert_session`].
#[derive(Debug, Clone)]
pub struct CertSessionParams {
    pub target: ExchangeTarget,
    /// Request a session shared by `target`'s node on behalf of this end node.
    pub shared_session_end_node: Option<NodeId>,
    /// Minimum certificate type the peer must present.
    pub requested_auth_mode: AuthMode,
    pub encryption_type: EncryptionType,
    /// Overrides the configured key confirmation default.
    pub key_confirm: Option<bool>,
}

impl CertSessionParams {
    pub fn new(target: ExchangeTarget) -> Self {
        Self {
            target,
            shared_session_end_node: None,
            requested_auth_mode: AuthMode::Cert(CertType::NotSpecified),
            encryption_type: EncryptionType::Aes256Gcm,
            key_confirm: None,
        }
    }
}

pub(crate) struct CertAttempt {
    pub common: AttemptCommon,
    engine: CertEngine,
    delegate: Arc<dyn CertDelegate>,
    key_confirm: bool,
    restarted: bool,
    /// Established locally; waiting for proof the peer has the key.
    awaiting_completion: bool,
    last_message_id: Option<u32>,
}

impl CertAttempt {
    fn initiator(
        ctx: &DriverCtx<'_>,
        common: AttemptCommon,
        delegate: Arc<dyn CertDelegate>,
        key_confirm: bool,
    ) -> Result<Self> {
        let curve = preferred_config(ctx.config.cert_initiator_curves, cert::SUPPORTED_CURVES)
            .ok_or(SecurityError::NoCommonConfig)?;
        let proposal = CertProposal {
            key_id: common.key_id,
            encryption_type: common.encryption_type,
            config: ctx.config.cert_proposed_config,
            curve,
            key_confirm,
        };
        let engine = CertEngine::initiator(
            proposal,
            delegate.clone(),
            ctx.ephemeral(HandshakeRole::Initiator),
        )?;
        let mut attempt = Self {
            common,
            engine,
            delegate,
            key_confirm,
            restarted: false,
            awaiting_completion: false,
            last_message_id: None,
        };
        attempt.send_request(ctx)?;
        Ok(attempt)
    }

    pub fn responder(ctx: &DriverCtx<'_>, common: AttemptCommon, delegate: Arc<dyn CertDelegate>) -> Self {
        Self {
            common,
            engine: CertEngine::responder(delegate.clone(), ctx.ephemeral(HandshakeRole::Responder)),
            delegate,
            key_confirm: false,
            restarted: false,
            awaiting_completion: false,
            last_message_id: None,
        }
    }

    fn send_request(&mut self, ctx: &DriverCtx<'_>) -> Result<()> {
        let request = ctx.crypto(|| self.engine.generate_begin_session_request())?;
        self.common.send(
            SecurityMsgType::CertBeginSessionRequest,
            request,
            SendFlags::EXPECT_RESPONSE | SendFlags::REQUEST_ACK,
        )?;
        Ok(())
    }

    fn peer_auth_mode(&self) -> AuthMode {
        AuthMode::Cert(self.engine.peer_cert_type().unwrap_or(CertType::NotSpecified))
    }

    /// True when the ack of `message_id` on `exchange` finishes a deferred
    /// completion.
    pub fn completes_on_ack(&self, exchange: ExchangeId, message_id: u32) -> bool {
        self.awaiting_completion
            && self.last_message_id == Some(message_id)
            && self.common.exchange_id() == Some(exchange)
    }

    /// True when traffic from `peer` under `key_id` finishes a deferred
    /// completion.
    pub fn completes_on_traffic(&self, peer: NodeId, key_id: KeyId) -> bool {
        self.awaiting_completion
            && self.common.key_id == key_id
            && (peer == self.common.peer || Some(peer) == self.common.end_node)
    }

    fn complete_after(&mut self, message_id: u32) -> StepOutcome {
        if !self.common.uses_reliable_messaging() {
            return StepOutcome::Established;
        }
        self.awaiting_completion = true;
        self.last_message_id = Some(message_id);
        debug!(peer = %self.common.peer, message_id, "certificate session awaiting peer");
        StepOutcome::Continue
    }

    pub fn on_message(
        &mut self,
        ctx: &DriverCtx<'_>,
        msg_type: SecurityMsgType,
        msg: &InboundMessage,
    ) -> Result<StepOutcome> {
        use SecurityMsgType::*;

        if self.awaiting_completion {
            return Err(unexpected(msg));
        }
        match (self.common.locally_initiated, msg_type) {
            (true, CertReconfigure) => self.reconfigure(ctx, msg),
            (true, CertBeginSessionResponse) => self.finish_initiator(ctx, msg),
            (false, CertBeginSessionRequest) => self.respond(ctx, msg),
            (false, CertInitiatorKeyConfirm) => {
                self.engine.process_initiator_key_confirm(&msg.payload)?;
                Ok(StepOutcome::Established)
            }
            _ => Err(unexpected(msg)),
        }
    }

    fn reconfigure(&mut self, ctx: &DriverCtx<'_>, msg: &InboundMessage) -> Result<StepOutcome> {
        if self.restarted {
            return Err(unexpected(msg));
        }
        let (config, curve) = CertEngine::parse_reconfigure(&msg.payload)?;
        if !config_allowed(config, ctx.config.cert_initiator_configs & cert::SUPPORTED_CONFIGS) {
            return Err(SecurityError::UnsupportedConfig(config));
        }
        if !config_allowed(curve, ctx.config.cert_initiator_curves & cert::SUPPORTED_CURVES) {
            return Err(SecurityError::UnsupportedCurve(curve));
        }
        let proposal = CertProposal {
            config,
            curve,
            ..*self.engine.proposal().ok_or(SecurityError::IncorrectState)?
        };
        self.engine = CertEngine::initiator(
            proposal,
            self.delegate.clone(),
            ctx.ephemeral(HandshakeRole::Initiator),
        )?;
        self.restarted = true;
        self.send_request(ctx)?;
        debug!(peer = %self.common.peer, config, curve, "certificate session reconfigured");
        Ok(StepOutcome::Continue)
    }

    fn finish_initiator(&mut self, ctx: &DriverCtx<'_>, msg: &InboundMessage) -> Result<StepOutcome> {
        self.common.flush_acks_before_crypto(msg)?;
        let peer = self.common.peer;
        ctx.crypto(|| self.engine.process_begin_session_response(&msg.payload, peer))?;

        let auth_mode = self.peer_auth_mode();
        if !auth_mode.satisfies(self.common.auth_mode) {
            return Err(SecurityError::InvalidCertificate("certificate type not accepted"));
        }
        ctx.commit_key(&mut self.common, self.engine.session_key()?, auth_mode)?;

        if !self.key_confirm {
            return Ok(StepOutcome::Established);
        }
        let confirm = self.engine.generate_initiator_key_confirm()?;
        let message_id = self.common.send(
            SecurityMsgType::CertInitiatorKeyConfirm,
            confirm,
            SendFlags::REQUEST_ACK,
        )?;
        Ok(self.complete_after(message_id))
    }

    fn respond(&mut self, ctx: &DriverCtx<'_>, msg: &InboundMessage) -> Result<StepOutcome> {
        self.common.flush_acks_before_crypto(msg)?;
        let peer = self.common.peer;
        let (configs, curves) = (ctx.config.cert_responder_configs, ctx.config.cert_responder_curves);
        let outcome = ctx.crypto(|| {
            self.engine
                .process_begin_session_request(&msg.payload, peer, configs, curves)
        })?;

        let proposal = match outcome {
            CertRequestOutcome::Proceed(proposal) => proposal,
            CertRequestOutcome::Reconfigure { config, curve } => {
                self.common.send(
                    SecurityMsgType::CertReconfigure,
                    CertEngine::encode_reconfigure(config, curve),
                    SendFlags::NONE,
                )?;
                debug!(%peer, config, curve, "proposed certificate reconfiguration");
                return Ok(StepOutcome::Abandoned);
            }
        };

        self.key_confirm = proposal.key_confirm;
        self.common.encryption_type = proposal.encryption_type;
        let auth_mode = self.peer_auth_mode();
        self.common.auth_mode = auth_mode;
        let request = DriverCtx::responder_key(
            &self.common,
            proposal.key_id,
            proposal.encryption_type,
            auth_mode,
        );
        ctx.alloc_key(&mut self.common, request)?;

        let response = ctx.crypto(|| self.engine.generate_begin_session_response())?;
        ctx.commit_key(&mut self.common, self.engine.session_key()?, auth_mode)?;

        let flags = if self.key_confirm {
            SendFlags::EXPECT_RESPONSE | SendFlags::REQUEST_ACK
        } else {
            SendFlags::REQUEST_ACK
        };
        let message_id = self
            .common
            .send(SecurityMsgType::CertBeginSessionResponse, response, flags)?;

        if self.key_confirm {
            Ok(StepOutcome::Continue)
        } else {
            Ok(self.complete_after(message_id))
        }
    }
}

impl SecurityManager {
    /// Start a certificate-authenticated session with `params.target`.
    ///
    /// With `shared_session_end_node` set, an established shared session to
    /// the same terminating node is reused: the end node is added to it and
    /// `SessionEstablished` is queued before this call returns.
    pub fn start_cert_session(&mut self, params: CertSessionParams) -> Result<AttemptToken> {
        self.require_initialized()?;
        let auth_mode = match params.requested_auth_mode {
            AuthMode::NotSpecified => AuthMode::Cert(CertType::NotSpecified),
            mode if mode.is_cert() => mode,
            _ => {
                return Err(SecurityError::InvalidArgument(
                    "certificate sessions need a certificate auth mode",
                ))
            }
        };
        if !params.encryption_type.is_encrypted() {
            return Err(SecurityError::InvalidArgument(
                "certificate sessions need an encryption type",
            ));
        }

        if let Some(end_node) = params.shared_session_end_node {
            if let Some(token) =
                self.join_shared_session(&params.target, end_node, auth_mode, params.encryption_type)?
            {
                return Ok(token);
            }
        }

        self.check_available()?;
        let delegate = self
            .delegates
            .cert
            .clone()
            .ok_or(SecurityError::MissingCredentials("certificate"))?;
        let key_confirm = params
            .key_confirm
            .unwrap_or(self.config.cert_key_confirm_default);

        let exchange = self.open_exchange(&params.target)?;
        let token = self.next_token();
        let mut common = AttemptCommon::initiator(
            token,
            exchange,
            params.target.peer(),
            params.target.connection(),
            params.encryption_type,
            auth_mode,
        );
        common.end_node = params.shared_session_end_node;

        let (peer, connection) = (common.peer, common.connection);
        let attempt = {
            let ctx = self.ctx()?;
            ctx.alloc_key(
                &mut common,
                NewSessionKey {
                    key_id: None,
                    peer,
                    encryption_type: params.encryption_type,
                    auth_mode,
                    connection,
                    locally_initiated: true,
                    remove_on_idle: false,
                    shared_end_node: params.shared_session_end_node,
                },
            )?;
            CertAttempt::initiator(&ctx, common, delegate, key_confirm)?
        };

        self.install(Attempt::Cert(Box::new(attempt)));
        Ok(token)
    }

    /// Reuse a shared session to the target for `end_node`. `Ok(None)` means
    /// there is none and a handshake is needed.
    fn join_shared_session(
        &mut self,
        target: &ExchangeTarget,
        end_node: NodeId,
        auth_mode: AuthMode,
        encryption_type: EncryptionType,
    ) -> Result<Option<AttemptToken>> {
        let terminating = target.peer();
        let (slot, entry_auth) = {
            let mut table = self.key_table.lock();
            let Some(entry) = table.find_shared(terminating, auth_mode, encryption_type) else {
                return Ok(None);
            };
            let (slot, keyed, entry_auth) = (entry.slot(), entry.is_keyed(), entry.auth_mode());

            // Still being negotiated, either by us or for another end node.
            let negotiating = matches!(&self.attempt, Attempt::Cert(a)
                if a.common.peer == terminating && a.common.key_id == slot.key_id);
            if !keyed || negotiating {
                return Err(SecurityError::Busy);
            }

            table.add_end_node(&slot, end_node)?;
            (table.reserve(slot.key_id, terminating)?, entry_auth)
        };

        let token = self.next_token();
        let reservation = KeyReservation::adopt(&self.key_table, slot);
        info!(%end_node, %terminating, key_id = %slot.key_id, "joined shared session");
        self.events.push(SecurityEvent::SessionEstablished(EstablishedSession {
            token: Some(token),
            peer: end_node,
            connection: target.connection(),
            key_id: slot.key_id,
            encryption_type,
            auth_mode: entry_auth,
            reservation: Some(reservation),
        }));
        Ok(Some(token))
    }
}
