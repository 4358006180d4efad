//! Key export driver.
//!
//!   Initiator                     Responder
//!     |--- KeyExportRequest ------->|
//!     |<-- KeyExportResponse -------|   (or KeyExportReconfigure)

use std::sync::Arc;

use fabricmsg::{EncryptionType, ExchangeTarget, InboundMessage, SendFlags};
use tracing::{debug, info};

use crate::crypto::x25519::HandshakeRole;
use crate::engine::config_allowed;
use crate::engine::key_export::{
    self, KeyExportDelegate, KeyExportEngine, KeyExportRequestOutcome,
};
use crate::error::{Result, SecurityError};
use crate::message::SecurityMsgType;
use crate::types::{AttemptToken, AuthMode};

use super::attempt::{unexpected, Attempt, AttemptCommon, DriverCtx, StepOutcome};
use super::SecurityManager;

/// Arguments to [`SecurityManager::start_key_export`].
#[derive(Debug, Clone)]
pub struct KeyExportParams {
    pub target: ExchangeTarget,
    /// Identifier of the key to fetch, meaningful to the peer's export delegate.
    pub key_id: u32,
}

pub(crate) struct KeyExportAttempt {
    pub common: AttemptCommon,
    engine: KeyExportEngine,
    delegate: Option<Arc<dyn KeyExportDelegate>>,
    restarted: bool,
}

impl KeyExportAttempt {
    fn initiator(ctx: &DriverCtx<'_>, common: AttemptCommon, key_id: u32) -> Result<Self> {
        let engine = KeyExportEngine::initiator(
            ctx.config.key_export_proposed_config,
            key_id,
            ctx.ephemeral(HandshakeRole::Initiator),
        )?;
        let mut attempt = Self {
            common,
            engine,
            delegate: None,
            restarted: false,
        };
        attempt.send_request(ctx)?;
        Ok(attempt)
    }

    pub fn responder(ctx: &DriverCtx<'_>, common: AttemptCommon) -> Self {
        Self {
            common,
            engine: KeyExportEngine::responder(ctx.ephemeral(HandshakeRole::Responder)),
            delegate: ctx.delegates.key_export.clone(),
            restarted: false,
        }
    }

    fn send_request(&mut self, ctx: &DriverCtx<'_>) -> Result<()> {
        let request = ctx.crypto(|| self.engine.generate_request())?;
        self.common.send(
            SecurityMsgType::KeyExportRequest,
            request,
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
            (true, KeyExportReconfigure) => {
                if self.restarted {
                    return Err(unexpected(msg));
                }
                let config = KeyExportEngine::parse_reconfigure(&msg.payload)?;
                let allowed = ctx.config.key_export_initiator_configs & key_export::SUPPORTED_CONFIGS;
                if !config_allowed(config, allowed) {
                    return Err(SecurityError::UnsupportedConfig(config));
                }
                self.engine = KeyExportEngine::initiator(
                    config,
                    self.engine.key_id(),
                    ctx.ephemeral(HandshakeRole::Initiator),
                )?;
                self.restarted = true;
                self.send_request(ctx)?;
                debug!(peer = %self.common.peer, config, "key export reconfigured");
                Ok(StepOutcome::Continue)
            }
            (true, KeyExportResponse) => {
                let material = ctx.crypto(|| self.engine.process_response(&msg.payload))?;
                Ok(StepOutcome::Exported(material))
            }
            (false, KeyExportRequest) => self.respond(ctx, msg),
            _ => Err(unexpected(msg)),
        }
    }

    fn respond(&mut self, ctx: &DriverCtx<'_>, msg: &InboundMessage) -> Result<StepOutcome> {
        let outcome = self
            .engine
            .process_request(&msg.payload, ctx.config.key_export_responder_configs)?;
        let key_id = match outcome {
            KeyExportRequestOutcome::Proceed { key_id } => key_id,
            KeyExportRequestOutcome::Reconfigure(config) => {
                self.common.send(
                    SecurityMsgType::KeyExportReconfigure,
                    KeyExportEngine::encode_reconfigure(config),
                    SendFlags::NONE,
                )?;
                debug!(peer = %self.common.peer, config, "proposed key export reconfiguration");
                return Ok(StepOutcome::Abandoned);
            }
        };

        let delegate = self
            .delegate
            .as_ref()
            .ok_or(SecurityError::UnauthorizedKeyExport)?;
        let key = delegate.export_key(self.common.peer, key_id)?;
        let response = ctx.crypto(|| self.engine.generate_response(&key))?;
        self.common
            .send(SecurityMsgType::KeyExportResponse, response, SendFlags::REQUEST_ACK)?;
        info!(peer = %self.common.peer, key_id, "exported key");
        Ok(StepOutcome::Abandoned)
    }
}

impl SecurityManager {
    /// Fetch key `params.key_id` from `params.target`.
    ///
    /// The key arrives in a
    /// [`KeyExportComplete`](crate::SecurityEvent::KeyExportComplete) event.
    pub fn start_key_export(&mut self, params: KeyExportParams) -> Result<AttemptToken> {
        self.check_available()?;
        let exchange = self.open_exchange(&params.target)?;
        let token = self.next_token();
        let common = AttemptCommon::initiator(
            token,
            exchange,
            params.target.peer(),
            params.target.connection(),
            EncryptionType::None,
            AuthMode::NotSpecified,
        );

        let attempt = {
            let ctx = self.ctx()?;
            KeyExportAttempt::initiator(&ctx, common, params.key_id)?
        };

        self.install(Attempt::KeyExport(Box::new(attempt)));
        Ok(token)
    }
}
