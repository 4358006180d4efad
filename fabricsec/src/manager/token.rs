//! Token session driver.
//!
//!   Initiator (challenger)                  Responder (token)
//!     |--- IdentifyToken ------------------->|
//!     |<-- IdentifyTokenResponse ------------|   (or Reconfigure)
//!     |--- [Re]AuthenticateToken ----------->|
//!     |<-- [Re]AuthenticateTokenResponse ----|
//!
//! With `encrypt_auth` the authentication pair travels under the agreed
//! key. Without `encrypt_comm` that key is discarded once the token is
//! authenticated.

use std::sync::Arc;

use fabricmsg::{EncryptionType, ExchangeTarget, InboundMessage, KeyId, SendFlags};
use tracing::debug;

use crate::crypto::x25519::HandshakeRole;
use crate::engine::config_allowed;
use crate::engine::token::{self, TokenDelegate, TokenEngine, TokenIdentifyOutcome, TokenProposal};
use crate::error::{Result, SecurityError};
use crate::key_table::NewSessionKey;
use crate::message::SecurityMsgType;
use crate::types::{AttemptToken, AuthMode};

use super::attempt::{unexpected, Attempt, AttemptCommon, DriverCtx, StepOutcome};
use super::SecurityManager;

/// Arguments to [`SecurityManager::start_token_session`].
#[derive(Debug, Clone)]
pub struct TokenSessionParams {
    pub target: ExchangeTarget,
    pub encryption_type: EncryptionType,
    pub encrypt_auth: bool,
    pub encrypt_comm: bool,
    pub reauth_allowed: bool,
}

impl TokenSessionParams {
    pub fn new(target: ExchangeTarget) -> Self {
        Self {
            target,
            encryption_type: EncryptionType::Aes256Gcm,
            encrypt_auth: true,
            encrypt_comm: true,
            reauth_allowed: false,
        }
    }
}

pub(crate) struct TokenAttempt {
    pub common: AttemptCommon,
    engine: TokenEngine,
    delegate: Arc<dyn TokenDelegate>,
    proposal: Option<TokenProposal>,
    restarted: bool,
}

impl TokenAttempt {
    fn initiator(
        ctx: &DriverCtx<'_>,
        common: AttemptCommon,
        delegate: Arc<dyn TokenDelegate>,
        proposal: TokenProposal,
    ) -> Result<Self> {
        let engine = TokenEngine::initiator(
            proposal,
            ctx.local_node.0,
            delegate.clone(),
            ctx.ephemeral(HandshakeRole::Initiator),
        )?;
        let mut attempt = Self {
            common,
            engine,
            delegate,
            proposal: Some(proposal),
            restarted: false,
        };
        attempt.send_identify(ctx)?;
        Ok(attempt)
    }

    pub fn responder(ctx: &DriverCtx<'_>, common: AttemptCommon, delegate: Arc<dyn TokenDelegate>) -> Self {
        Self {
            common,
            engine: TokenEngine::responder(delegate.clone(), ctx.ephemeral(HandshakeRole::Responder)),
            delegate,
            proposal: None,
            restarted: false,
        }
    }

    fn send_identify(&mut self, ctx: &DriverCtx<'_>) -> Result<()> {
        let identify = ctx.crypto(|| self.engine.generate_identify_token())?;
        self.common.send(
            SecurityMsgType::TokenIdentifyToken,
            identify,
            SendFlags::EXPECT_RESPONSE | SendFlags::REQUEST_ACK,
        )?;
        Ok(())
    }

    pub fn on_message(
        &mut self,
        ctx: &DriverCtx<'_>,
        msg_type: SecurityMsgType,
        msg: &InboundMessage,
    ) -> Result<StepOutcome> {
        use SecurityMsgType::*;

        match (self.common.locally_initiated, msg_type) {
            (true, TokenReconfigure) => self.reconfigure(ctx, msg),
            (true, TokenIdentifyTokenResponse) => {
                ctx.crypto(|| self.engine.process_identify_token_response(&msg.payload))?;
                if self.proposal()?.encrypt_auth {
                    self.protect_exchange(ctx)?;
                }
                let step = ctx.crypto(|| self.engine.generate_authenticate())?;
                let msg_type = if step.reauth {
                    TokenReAuthenticateToken
                } else {
                    TokenAuthenticateToken
                };
                self.common.send(
                    msg_type,
                    step.payload,
                    SendFlags::EXPECT_RESPONSE | SendFlags::REQUEST_ACK,
                )?;
                Ok(StepOutcome::Continue)
            }
            (true, TokenAuthenticateTokenResponse | TokenReAuthenticateTokenResponse) => {
                let reauth = msg_type == TokenReAuthenticateTokenResponse;
                ctx.crypto(|| self.engine.process_authenticate_response(&msg.payload, reauth))?;
                self.finish(ctx)?;
                Ok(StepOutcome::Established)
            }
            (false, TokenIdentifyToken) => self.respond(ctx, msg),
            (false, TokenAuthenticateToken | TokenReAuthenticateToken) => {
                let reauth = msg_type == TokenReAuthenticateToken;
                let proof = ctx.crypto(|| self.engine.process_authenticate(&msg.payload, reauth))?;
                let response_type = if reauth {
                    TokenReAuthenticateTokenResponse
                } else {
                    TokenAuthenticateTokenResponse
                };
                self.common
                    .send(response_type, proof, SendFlags::REQUEST_ACK)?;
                self.finish(ctx)?;
                Ok(StepOutcome::Established)
            }
            _ => Err(unexpected(msg)),
        }
    }

    fn proposal(&self) -> Result<TokenProposal> {
        self.proposal.ok_or(SecurityError::IncorrectState)
    }

    fn reconfigure(&mut self, ctx: &DriverCtx<'_>, msg: &InboundMessage) -> Result<StepOutcome> {
        if self.restarted {
            return Err(unexpected(msg));
        }
        let config = TokenEngine::parse_reconfigure(&msg.payload)?;
        if !config_allowed(config, ctx.config.token_initiator_configs & token::SUPPORTED_CONFIGS) {
            return Err(SecurityError::UnsupportedConfig(config));
        }
        let proposal = TokenProposal {
            config,
            ..self.proposal()?
        };
        self.engine = TokenEngine::initiator(
            proposal,
            ctx.local_node.0,
            self.delegate.clone(),
            ctx.ephemeral(HandshakeRole::Initiator),
        )?;
        self.proposal = Some(proposal);
        self.restarted = true;
        self.send_identify(ctx)?;
        debug!(peer = %self.common.peer, config, "token session reconfigured");
        Ok(StepOutcome::Continue)
    }

    fn respond(&mut self, ctx: &DriverCtx<'_>, msg: &InboundMessage) -> Result<StepOutcome> {
        let outcome = self
            .engine
            .process_identify_token(&msg.payload, ctx.config.token_responder_configs)?;
        let proposal = match outcome {
            TokenIdentifyOutcome::Proceed(proposal) => proposal,
            TokenIdentifyOutcome::Reconfigure(config) => {
                self.common.send(
                    SecurityMsgType::TokenReconfigure,
                    TokenEngine::encode_reconfigure(config),
                    SendFlags::NONE,
                )?;
                debug!(peer = %self.common.peer, config, "proposed token reconfiguration");
                return Ok(StepOutcome::Abandoned);
            }
        };
        self.proposal = Some(proposal);
        self.common.auth_mode = AuthMode::TokenIdentificationKey;

        if proposal.uses_session_key() {
            self.common.encryption_type = proposal.encryption_type;
            let request = DriverCtx::responder_key(
                &self.common,
                proposal.key_id,
                proposal.encryption_type,
                AuthMode::TokenIdentificationKey,
            );
            ctx.alloc_key(&mut self.common, request)?;
        }

        let response = ctx.crypto(|| self.engine.generate_identify_token_response())?;
        self.common.send(
            SecurityMsgType::TokenIdentifyTokenResponse,
            response,
            SendFlags::EXPECT_RESPONSE | SendFlags::REQUEST_ACK,
        )?;
        if proposal.encrypt_auth {
            self.protect_exchange(ctx)?;
        }
        Ok(StepOutcome::Continue)
    }

    /// Commit the agreed key and encrypt the rest of the exchange with it.
    fn protect_exchange(&mut self, ctx: &DriverCtx<'_>) -> Result<()> {
        ctx.commit_key(
            &mut self.common,
            self.engine.session_key()?,
            AuthMode::TokenIdentificationKey,
        )?;
        self.common
            .exchange()?
            .set_key(self.common.key_id, self.common.encryption_type)?;
        Ok(())
    }

    /// Keep the agreed key as the session key, or discard it.
    fn finish(&mut self, ctx: &DriverCtx<'_>) -> Result<()> {
        let proposal = self.proposal()?;
        if proposal.encrypt_comm {
            if !self.common.committed {
                ctx.commit_key(
                    &mut self.common,
                    self.engine.session_key()?,
                    AuthMode::TokenIdentificationKey,
                )?;
            }
        } else if let Some(reservation) = self.common.reservation.take() {
            reservation.remove_key();
            self.common.committed = false;
            self.common.key_id = KeyId::NONE;
            self.common.encryption_type = EncryptionType::None;
            self.common.exchange()?.set_key(KeyId::NONE, EncryptionType::None)?;
        }
        self.common.auth_mode = AuthMode::TokenIdentificationKey;
        debug!(
            peer = %self.common.peer,
            token_id = self.engine.token_id(),
            reauth = self.engine.reauthenticated(),
            "token authenticated"
        );
        Ok(())
    }
}

impl SecurityManager {
    /// Start a token authentication with `params.target`.
    ///
    /// The local node acts as challenger. A session key is negotiated only
    /// if `encrypt_auth` or `encrypt_comm` is set.
    pub fn start_token_session(&mut self, params: TokenSessionParams) -> Result<AttemptToken> {
        self.check_available()?;
        let delegate = self
            .delegates
            .token
            .clone()
            .ok_or(SecurityError::MissingCredentials("token"))?;
        let uses_key = params.encrypt_auth || params.encrypt_comm;
        if uses_key && !params.encryption_type.is_encrypted() {
            return Err(SecurityError::InvalidArgument(
                "encrypted token sessions need an encryption type",
            ));
        }
        let encryption_type = if uses_key {
            params.encryption_type
        } else {
            EncryptionType::None
        };

        let exchange = self.open_exchange(&params.target)?;
        let token = self.next_token();
        let mut common = AttemptCommon::initiator(
            token,
            exchange,
            params.target.peer(),
            params.target.connection(),
            encryption_type,
            AuthMode::TokenIdentificationKey,
        );

        let (peer, connection) = (common.peer, common.connection);
        let attempt = {
            let ctx = self.ctx()?;
            if uses_key {
                ctx.alloc_key(
                    &mut common,
                    NewSessionKey {
                        key_id: None,
                        peer,
                        encryption_type,
                        auth_mode: AuthMode::TokenIdentificationKey,
                        connection,
                        locally_initiated: true,
                        remove_on_idle: false,
                        shared_end_node: None,
                    },
                )?;
            }
            let proposal = TokenProposal {
                key_id: common.key_id,
                encryption_type,
                config: ctx.config.token_proposed_config,
                encrypt_auth: params.encrypt_auth,
                encrypt_comm: params.encrypt_comm,
                reauth_allowed: params.reauth_allowed,
            };
            TokenAttempt::initiator(&ctx, common, delegate, proposal)?
        };

        self.install(Attempt::Token(Box::new(attempt)));
        Ok(token)
    }
}
