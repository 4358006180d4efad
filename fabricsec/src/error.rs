// Fabric security error types

use fabricmsg::{ExchangeError, KeyId, ProfileId};
use thiserror::Error;

use crate::key_error::KeyErrorKind;

/// Every failure the session manager and its protocol engines can report.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SecurityError {
    // ── API misuse ──────────────────────────────────────────────────────
    #[error("operation not valid in the current manager state")]
    IncorrectState,

    #[error("a session establishment is already in progress")]
    Busy,

    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),

    #[error("out of session key slots")]
    NoMemory,

    #[error("invalid configuration: {0}")]
    Config(String),

    // ── Protocol violations ─────────────────────────────────────────────
    #[error("unexpected message: profile 0x{profile:08x} type 0x{msg_type:02x}")]
    UnexpectedMessage { profile: ProfileId, msg_type: u8 },

    #[error("invalid message type 0x{0:02x}")]
    InvalidMessageType(u8),

    #[error("message too short: need {need}, have {have}")]
    InvalidMessageLength { need: usize, have: usize },

    #[error("invalid field value: {0}")]
    InvalidField(&'static str),

    #[error("signature verification failed")]
    InvalidSignature,

    #[error("certificate rejected: {0}")]
    InvalidCertificate(&'static str),

    #[error("key confirmation failed")]
    KeyConfirmationFailed,

    #[error("peer authentication failed")]
    AuthenticationFailed,

    #[error("unsupported protocol configuration 0x{0:02x}")]
    UnsupportedConfig(u8),

    #[error("unsupported elliptic curve 0x{0:02x}")]
    UnsupportedCurve(u8),

    #[error("no common protocol configuration")]
    NoCommonConfig,

    #[error("session key {0} already exists for peer")]
    DuplicateKeyId(KeyId),

    #[error("key export request not authorized")]
    UnauthorizedKeyExport,

    #[error("no credentials available for {0}")]
    MissingCredentials(&'static str),

    #[error("cryptographic failure: {0}")]
    Crypto(String),

    // ── Peer and lifecycle ──────────────────────────────────────────────
    #[error("peer reported status: profile 0x{profile:08x} code 0x{code:04x}")]
    StatusReportReceived { profile: ProfileId, code: u16 },

    #[error("session establishment timed out")]
    Timeout,

    #[error("session establishment canceled")]
    TransactionCanceled,

    #[error("connection closed")]
    ConnectionClosed,

    #[error("session key {0} not found")]
    KeyNotFound(KeyId),

    // ── Key errors ──────────────────────────────────────────────────────
    #[error("key error: {0}")]
    Key(KeyErrorKind),

    #[error("key error reported by peer: {0}")]
    KeyFromPeer(KeyErrorKind),

    // ── Transport ───────────────────────────────────────────────────────
    #[error("exchange error: {0}")]
    Exchange(#[from] ExchangeError),
}

impl SecurityError {
    /// True for key errors, whether detected locally or reported by a peer.
    pub fn is_key_error(&self) -> bool {
        matches!(self, SecurityError::Key(_) | SecurityError::KeyFromPeer(_))
    }
}

/// Crate-level result alias.
pub type Result<T> = std::result::Result<T, SecurityError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_error_classification() {
        assert!(SecurityError::Key(KeyErrorKind::KeyNotFound).is_key_error());
        assert!(SecurityError::KeyFromPeer(KeyErrorKind::WrongEncryptionType).is_key_error());
        assert!(!SecurityError::Timeout.is_key_error());
    }

    #[test]
    fn exchange_errors_convert() {
        let err: SecurityError = ExchangeError::SendFailed("down".into()).into();
        assert!(matches!(err, SecurityError::Exchange(_)));
    }
}
