//! Password session driver.
//!
//!   Initiator                              Responder
//!     |--- InitiatorStep1 ------------------>|
//!     |<-- ResponderStep1 / ResponderStep2 --|   (or ResponderReconfigure)
//!     |--- InitiatorStep2 ------------------>|
//!     |<-- ResponderKeyConfirm --------------|   (key confirmation only)

use std::sync::Arc;

use fabricmsg::{
    EncryptionType, ExchangeTarget, InboundMessage, SendFlags, PROFILE_SECURITY,
};
use tracing::debug;
use zeroize::Zeroizing;

use crate::crypto::x25519::HandshakeRole;
use crate::engine::config_allowed;
use crate::engine::password::{
    self, PasswordDelegate, PasswordEngine, PasswordProposal, PasswordStep1Outcome,
};
use crate::error::{Result, SecurityError};
use crate::key_table::NewSessionKey;
use crate::message::SecurityMsgType;
use crate::status_report::{security, StatusReport};
use crate::types::{AttemptToken, AuthMode, PasswordSource};

use super::attempt::{unexpected, Attempt, AttemptCommon, DriverCtx, StepOutcome};
use super::SecurityManager;

/// Arguments to [`SecurityManager::start_password_session`].
#[derive(Debug, Clone)]
pub struct PasswordSessionParams {
    pub target: ExchangeTarget,
    pub source: PasswordSource,
    /// Used instead of asking the password delegate.
    pub password: Option<Zeroizing<Vec<u8>>>,
    pub encryption_type: EncryptionType,
    /// Ask the responder to prove it derived the same key.
    pub key_confirm: bool,
}

impl PasswordSessionParams {
    pub fn new(target: ExchangeTarget, source: PasswordSource) -> Self {
        Self {
            target,
            source,
            password: None,
            encryption_type: EncryptionType::Aes256Gcm,
            key_confirm: false,
        }
    }
}

pub(crate) struct PasswordAttempt {
    pub common: AttemptCommon,
    engine: PasswordEngine,
    delegate: Option<Arc<dyn PasswordDelegate>>,
    /// Initiator side; kept for a restart with another configuration.
    password: Zeroizing<Vec<u8>>,
    /// A reconfigure or legacy fallback already happened.
    restarted: bool,
}

impl PasswordAttempt {
    fn initiator(
        ctx: &DriverCtx<'_>,
        common: AttemptCommon,
        source: PasswordSource,
        key_confirm: bool,
        password: Zeroizing<Vec<u8>>,
    ) -> Result<Self> {
        let proposal = PasswordProposal {
            key_id: common.key_id,
            encryption_type: common.encryption_type,
            config: ctx.config.password_proposed_config,
            source,
            key_confirm,
        };
        let engine = PasswordEngine::initiator(
            proposal,
            password.clone(),
            ctx.ephemeral(HandshakeRole::Initiator),
        )?;
        let mut attempt = Self {
            common,
            engine,
            delegate: None,
            password,
            restarted: false,
        };
        attempt.send_step1(ctx)?;
        Ok(attempt)
    }

    pub fn responder(ctx: &DriverCtx<'_>, common: AttemptCommon) -> Self {
        Self {
            common,
            engine: PasswordEngine::responder(ctx.ephemeral(HandshakeRole::Responder)),
            delegate: ctx.delegates.password.clone(),
            password: Zeroizing::new(Vec::new()),
            restarted: false,
        }
    }

    fn send_step1(&mut self, ctx: &DriverCtx<'_>) -> Result<()> {
        let step1 = ctx.crypto(|| self.engine.generate_initiator_step1())?;
        self.common.send(
            SecurityMsgType::PasswordInitiatorStep1,
            step1,
            SendFlags::EXPECT_RESPONSE | SendFlags::REQUEST_ACK,
        )?;
        Ok(())
    }

    fn proposal(&self) -> Result<PasswordProposal> {
        self.engine
            .proposal()
            .copied()
            .ok_or(SecurityError::IncorrectState)
    }

    pub fn on_message(
        &mut self,
        ctx: &DriverCtx<'_>,
        msg_type: SecurityMsgType,
        msg: &InboundMessage,
    ) -> Result<StepOutcome> {
        use SecurityMsgType::*;

        match (self.common.locally_initiated, msg_type) {
            (true, PasswordResponderReconfigure) => {
                if self.restarted {
                    return Err(unexpected(msg));
                }
                let config = PasswordEngine::parse_reconfigure(&msg.payload)?;
                self.restart(ctx, config)
            }
            (true, PasswordResponderStep1) => {
                ctx.crypto(|| self.engine.process_responder_step1(&msg.payload))?;
                Ok(StepOutcome::Continue)
            }
            (true, PasswordResponderStep2) => self.finish_initiator(ctx, msg),
            (true, PasswordResponderKeyConfirm) => {
                self.engine.process_responder_key_confirm(&msg.payload)?;
                Ok(StepOutcome::Established)
            }
            (false, PasswordInitiatorStep1) => self.respond(ctx, msg),
            (false, PasswordInitiatorStep2) => {
                ctx.crypto(|| self.engine.process_initiator_step2(&msg.payload))?;
                let proposal = self.proposal()?;
                ctx.commit_key(
                    &mut self.common,
                    self.engine.session_key()?,
                    AuthMode::Password(proposal.source),
                )?;
                if proposal.key_confirm {
                    let confirm = self.engine.generate_responder_key_confirm()?;
                    self.common.send(
                        PasswordResponderKeyConfirm,
                        confirm,
                        SendFlags::REQUEST_ACK,
                    )?;
                }
                Ok(StepOutcome::Established)
            }
            _ => Err(unexpected(msg)),
        }
    }

    /// A status report on the attempt's exchange. A responder that only
    /// speaks configuration 1 gets one retry with that configuration.
    pub fn on_status_report(
        &mut self,
        ctx: &DriverCtx<'_>,
        report: StatusReport,
    ) -> Result<StepOutcome> {
        let legacy_peer = report.is(PROFILE_SECURITY, security::PASSWORD_SUPPORTS_ONLY_CONFIG1);
        if legacy_peer
            && self.common.locally_initiated
            && !self.restarted
            && self.proposal()?.config != password::CONFIG_1
        {
            debug!(peer = %self.common.peer, "peer supports only password config 1, retrying");
            return self.restart(ctx, password::CONFIG_1);
        }
        Err(report.to_error())
    }

    /// Begin again with `config` on the same exchange, keeping the key id
    /// and encryption type.
    fn restart(&mut self, ctx: &DriverCtx<'_>, config: u8) -> Result<StepOutcome> {
        let allowed = ctx.config.password_initiator_configs & password::SUPPORTED_CONFIGS;
        if !config_allowed(config, allowed) {
            return Err(SecurityError::UnsupportedConfig(config));
        }
        let proposal = PasswordProposal {
            config,
            ..self.proposal()?
        };
        self.engine = PasswordEngine::initiator(
            proposal,
            self.password.clone(),
            ctx.ephemeral(HandshakeRole::Initiator),
        )?;
        self.restarted = true;
        self.send_step1(ctx)?;
        debug!(peer = %self.common.peer, config, "password session restarted");
        Ok(StepOutcome::Continue)
    }

    fn finish_initiator(&mut self, ctx: &DriverCtx<'_>, msg: &InboundMessage) -> Result<StepOutcome> {
        ctx.crypto(|| self.engine.process_responder_step2(&msg.payload))?;
        let step2 = self.engine.generate_initiator_step2()?;
        let proposal = self.proposal()?;
        // Committed before sending so the peer's first encrypted message finds the key.
        ctx.commit_key(
            &mut self.common,
            self.engine.session_key()?,
            AuthMode::Password(proposal.source),
        )?;

        let flags = if proposal.key_confirm {
            SendFlags::EXPECT_RESPONSE | SendFlags::REQUEST_ACK
        } else {
            SendFlags::REQUEST_ACK
        };
        self.common
            .send(SecurityMsgType::PasswordInitiatorStep2, step2, flags)?;

        if proposal.key_confirm {
            Ok(StepOutcome::Continue)
        } else {
            Ok(StepOutcome::Established)
        }
    }

    fn respond(&mut self, ctx: &DriverCtx<'_>, msg: &InboundMessage) -> Result<StepOutcome> {
        let outcome = self
            .engine
            .process_initiator_step1(&msg.payload, ctx.config.password_responder_configs)?;

        let proposal = match outcome {
            PasswordStep1Outcome::Proceed(proposal) => proposal,
            PasswordStep1Outcome::Reconfigure(config) => {
                self.common.send(
                    SecurityMsgType::PasswordResponderReconfigure,
                    PasswordEngine::encode_reconfigure(config),
                    SendFlags::NONE,
                )?;
                debug!(peer = %self.common.peer, config, "proposed password reconfiguration");
                return Ok(StepOutcome::Abandoned);
            }
            PasswordStep1Outcome::OnlyConfig1 => {
                self.common.send_status_report(StatusReport::security(
                    security::PASSWORD_SUPPORTS_ONLY_CONFIG1,
                ))?;
                return Ok(StepOutcome::Abandoned);
            }
        };

        let password = self
            .delegate
            .as_ref()
            .and_then(|d| d.password(proposal.source, self.common.peer))
            .ok_or(SecurityError::MissingCredentials("password"))?;

        let auth_mode = AuthMode::Password(proposal.source);
        self.common.encryption_type = proposal.encryption_type;
        self.common.auth_mode = auth_mode;
        let request = DriverCtx::responder_key(
            &self.common,
            proposal.key_id,
            proposal.encryption_type,
            auth_mode,
        );
        ctx.alloc_key(&mut self.common, request)?;

        let (step1, step2) = ctx.crypto(|| self.engine.generate_responder_steps(password))?;
        self.common
            .send(SecurityMsgType::PasswordResponderStep1, step1, SendFlags::REQUEST_ACK)?;
        self.common.send(
            SecurityMsgType::PasswordResponderStep2,
            step2,
            SendFlags::EXPECT_RESPONSE | SendFlags::REQUEST_ACK,
        )?;
        Ok(StepOutcome::Continue)
    }
}

impl SecurityManager {
    /// Start a password-authenticated session with `params.target`.
    ///
    /// The returned token identifies the attempt in the eventual
    /// [`SessionEstablished`](crate::SecurityEvent::SessionEstablished) or
    /// [`SessionFailed`](crate::SecurityEvent::SessionFailed) event.
    pub fn start_password_session(&mut self, params: PasswordSessionParams) -> Result<AttemptToken> {
        self.check_available()?;
        if !params.encryption_type.is_encrypted() {
            return Err(SecurityError::InvalidArgument(
                "password sessions need an encryption type",
            ));
        }
        let password = match params.password {
            Some(password) => password,
            None => self
                .delegates
                .password
                .as_ref()
                .and_then(|d| d.password(params.source, params.target.peer()))
                .ok_or(SecurityError::MissingCredentials("password"))?,
        };

        let auth_mode = AuthMode::Password(params.source);
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
                    shared_end_node: None,
                },
            )?;
            PasswordAttempt::initiator(&ctx, common, params.source, params.key_confirm, password)?
        };

        self.install(Attempt::Password(Box::new(attempt)));
        Ok(token)
    }
}
