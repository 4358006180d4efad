//! Session manager configuration.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::engine::cert::{self, CertDelegate};
use crate::engine::key_export::{self, KeyExportDelegate};
use crate::engine::password::{self, PasswordDelegate};
use crate::engine::token::{self, TokenDelegate};
use crate::engine::config_allowed;
use crate::error::{Result, SecurityError};
use crate::key_table::DEFAULT_MAX_SESSION_KEYS;

/// Tunables for one [`SecurityManager`](crate::SecurityManager).
///
/// Config bitmasks list the protocol configurations a role accepts; the
/// `*_proposed_config` values are what an initiator offers first.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SecurityConfig {
    /// Maximum duration of one handshake. 0 disables the timer.
    pub establishment_timeout_ms: u32,
    /// Idle sweep period for unreserved keys. 0 disables sweeping.
    pub idle_session_timeout_ms: u32,
    pub max_session_keys: usize,

    pub password_proposed_config: u8,
    pub password_initiator_configs: u8,
    pub password_responder_configs: u8,

    pub cert_proposed_config: u8,
    pub cert_initiator_configs: u8,
    pub cert_responder_configs: u8,
    pub cert_initiator_curves: u8,
    pub cert_responder_curves: u8,
    /// Request initiator key confirmation unless a start call overrides it.
    pub cert_key_confirm_default: bool,

    pub token_proposed_config: u8,
    pub token_initiator_configs: u8,
    pub token_responder_configs: u8,

    pub key_export_proposed_config: u8,
    pub key_export_initiator_configs: u8,
    pub key_export_responder_configs: u8,

    /// Use fixed ephemeral keys so handshakes are reproducible. Test only.
    pub force_test_ephemeral_key: bool,
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            establishment_timeout_ms: 30_000,
            idle_session_timeout_ms: 15_000,
            max_session_keys: DEFAULT_MAX_SESSION_KEYS,
            password_proposed_config: password::CONFIG_2,
            password_initiator_configs: password::SUPPORTED_CONFIGS,
            password_responder_configs: password::SUPPORTED_CONFIGS,
            cert_proposed_config: cert::CONFIG_2,
            cert_initiator_configs: cert::SUPPORTED_CONFIGS,
            cert_responder_configs: cert::SUPPORTED_CONFIGS,
            cert_initiator_curves: cert::SUPPORTED_CURVES,
            cert_responder_curves: cert::SUPPORTED_CURVES,
            cert_key_confirm_default: false,
            token_proposed_config: token::CONFIG_2,
            token_initiator_configs: token::SUPPORTED_CONFIGS,
            token_responder_configs: token::SUPPORTED_CONFIGS,
            key_export_proposed_config: key_export::CONFIG_1,
            key_export_initiator_configs: key_export::SUPPORTED_CONFIGS,
            key_export_responder_configs: key_export::SUPPORTED_CONFIGS,
            force_test_ephemeral_key: false,
        }
    }
}

impl SecurityConfig {
    /// Parse a JSON document; missing fields take their defaults.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self =
            serde_json::from_str(json).map_err(|e| SecurityError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_session_keys == 0 {
            return Err(SecurityError::Config("max_session_keys must be non-zero".into()));
        }
        check_proposal(
            "password",
            self.password_proposed_config,
            self.password_initiator_configs,
            password::SUPPORTED_CONFIGS,
        )?;
        check_proposal(
            "cert",
            self.cert_proposed_config,
            self.cert_initiator_configs,
            cert::SUPPORTED_CONFIGS,
        )?;
        check_proposal(
            "token",
            self.token_proposed_config,
            self.token_initiator_configs,
            token::SUPPORTED_CONFIGS,
        )?;
        check_proposal(
            "key_export",
            self.key_export_proposed_config,
            self.key_export_initiator_configs,
            key_export::SUPPORTED_CONFIGS,
        )?;
        if self.cert_initiator_curves & cert::SUPPORTED_CURVES == 0 {
            return Err(SecurityError::Config("cert_initiator_curves has no supported curve".into()));
        }
        Ok(())
    }

    pub fn establishment_timeout(&self) -> Option<Duration> {
        millis(self.establishment_timeout_ms)
    }

    pub fn idle_timeout(&self) -> Option<Duration> {
        millis(self.idle_session_timeout_ms)
    }
}

fn check_proposal(protocol: &str, proposed: u8, initiator_mask: u8, supported: u8) -> Result<()> {
    if !config_allowed(proposed, initiator_mask & supported) {
        return Err(SecurityError::Config(format!(
            "{protocol} proposed config {proposed:#04x} not in initiator mask {initiator_mask:#04x}"
        )));
    }
    Ok(())
}

fn millis(ms: u32) -> Option<Duration> {
    (ms != 0).then(|| Duration::from_millis(u64::from(ms)))
}

/// Default authentication delegates, one per protocol.
///
/// A protocol whose delegate is absent cannot be started locally and
/// rejects inbound start messages.
#[derive(Clone, Default)]
pub struct AuthDelegates {
    pub password: Option<Arc<dyn PasswordDelegate>>,
    pub cert: Option<Arc<dyn CertDelegate>>,
    pub token: Option<Arc<dyn TokenDelegate>>,
    pub key_export: Option<Arc<dyn KeyExportDelegate>>,
}

impl fmt::Debug for AuthDelegates {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthDelegates")
            .field("password", &self.password.is_some())
            .field("cert", &self.cert.is_some())
            .field("token", &self.token.is_some())
            .field("key_export", &self.key_export.is_some())
            .finish()
    }
}
