//! Status reports: the (profile, code) pair a node sends to tell its peer
//! how an exchange ended, and the mapping from local errors to that pair.

use bytes::{BufMut, Bytes, BytesMut};
use fabricmsg::{ProfileId, PROFILE_COMMON, PROFILE_SECURITY};

use crate::error::{Result, SecurityError};
use crate::key_error::KeyErrorKind;
use crate::message::WireReader;

/// Encoded length of a status report.
pub const STATUS_REPORT_LEN: usize = 6;

/// Status codes under the common profile.
pub mod common {
    pub const SUCCESS: u16 = 0x0000;
    pub const BUSY: u16 = 0x0001;
    pub const BAD_REQUEST: u16 = 0x0010;
    pub const UNSUPPORTED_MESSAGE: u16 = 0x0011;
    pub const UNEXPECTED_MESSAGE: u16 = 0x0012;
    pub const TIMEOUT: u16 = 0x0020;
    pub const CANCELED: u16 = 0x0021;
    pub const INTERNAL_ERROR: u16 = 0x0050;
}

/// Status codes under the security profile.
pub mod security {
    pub const SESSION_ABORTED: u16 = 0x0001;
    pub const PASSWORD_SUPPORTS_ONLY_CONFIG1: u16 = 0x0002;
    pub const UNSUPPORTED_ENCRYPTION_TYPE: u16 = 0x0003;
    pub const INVALID_KEY_ID: u16 = 0x0004;
    pub const DUPLICATE_KEY_ID: u16 = 0x0005;
    pub const KEY_CONFIRMATION_FAILED: u16 = 0x0006;
    pub const INTERNAL_ERROR: u16 = 0x0007;
    pub const AUTHENTICATION_FAILED: u16 = 0x0008;
    pub const UNSUPPORTED_CONFIGURATION: u16 = 0x0009;
    pub const INVALID_CERTIFICATE: u16 = 0x000A;
    pub const NO_COMMON_CONFIGURATIONS: u16 = 0x000B;
    pub const KEY_NOT_FOUND: u16 = 0x000C;
    pub const WRONG_ENCRYPTION_TYPE: u16 = 0x000D;
    pub const UNKNOWN_KEY_TYPE: u16 = 0x000E;
    pub const INVALID_USE_OF_SESSION_KEY: u16 = 0x000F;
    pub const INTERNAL_KEY_ERROR: u16 = 0x0010;
    pub const UNAUTHORIZED_KEY_EXPORT: u16 = 0x0011;
    pub const INVALID_SIGNATURE: u16 = 0x0012;
}

/// A decoded status report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusReport {
    pub profile: ProfileId,
    pub code: u16,
}

impl StatusReport {
    pub const fn new(profile: ProfileId, code: u16) -> Self {
        Self { profile, code }
    }

    pub const fn common(code: u16) -> Self {
        Self::new(PROFILE_COMMON, code)
    }

    pub const fn security(code: u16) -> Self {
        Self::new(PROFILE_SECURITY, code)
    }

    pub fn is_success(&self) -> bool {
        self.profile == PROFILE_COMMON && self.code == common::SUCCESS
    }

    pub fn is(&self, profile: ProfileId, code: u16) -> bool {
        self.profile == profile && self.code == code
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(STATUS_REPORT_LEN);
        buf.put_u32_le(self.profile);
        buf.put_u16_le(self.code);
        buf.freeze()
    }

    pub fn decode(payload: &[u8]) -> Result<Self> {
        let mut r = WireReader::new(payload);
        let profile = r.u32()?;
        let code = r.u16()?;
        Ok(Self { profile, code })
    }

    /// The error a receiver raises when this report ends its exchange.
    pub fn to_error(self) -> SecurityError {
        SecurityError::StatusReportReceived {
            profile: self.profile,
            code: self.code,
        }
    }

    /// Translate a local error into the report sent to the peer.
    ///
    /// Unmapped kinds become `Common/InternalError`.
    pub fn for_error(err: &SecurityError) -> Self {
        use SecurityError as E;
        match err {
            E::Busy => Self::common(common::BUSY),
            E::Timeout => Self::common(common::TIMEOUT),
            E::TransactionCanceled => Self::common(common::CANCELED),
            E::UnexpectedMessage { .. } => Self::common(common::UNEXPECTED_MESSAGE),
            E::InvalidMessageType(_) => Self::common(common::UNSUPPORTED_MESSAGE),
            E::InvalidMessageLength { .. } | E::InvalidField(_) => {
                Self::common(common::BAD_REQUEST)
            }
            E::InvalidSignature => Self::security(security::INVALID_SIGNATURE),
            E::InvalidCertificate(_) => Self::security(security::INVALID_CERTIFICATE),
            E::KeyConfirmationFailed => Self::security(security::KEY_CONFIRMATION_FAILED),
            E::AuthenticationFailed | E::MissingCredentials(_) => {
                Self::security(security::AUTHENTICATION_FAILED)
            }
            E::UnsupportedConfig(_) | E::UnsupportedCurve(_) => {
                Self::security(security::UNSUPPORTED_CONFIGURATION)
            }
            E::NoCommonConfig => Self::security(security::NO_COMMON_CONFIGURATIONS),
            E::DuplicateKeyId(_) => Self::security(security::DUPLICATE_KEY_ID),
            E::UnauthorizedKeyExport => Self::security(security::UNAUTHORIZED_KEY_EXPORT),
            E::KeyNotFound(_) => Self::security(security::KEY_NOT_FOUND),
            E::Key(kind) | E::KeyFromPeer(kind) => Self::security(kind.code()),
            E::Crypto(_) | E::NoMemory => Self::security(security::INTERNAL_ERROR),
            _ => Self::common(common::INTERNAL_ERROR),
        }
    }
}

impl std::fmt::Display for StatusReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "status 0x{:08x}/0x{:04x}", self.profile, self.code)
    }
}

/// Key error kinds are reported under the security profile by code.
impl From<KeyErrorKind> for StatusReport {
    fn from(kind: KeyErrorKind) -> Self {
        Self::security(kind.code())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_encoded_report() {
        let report = StatusReport::security(security::PASSWORD_SUPPORTS_ONLY_CONFIG1);
        let wire = report.encode();
        assert_eq!(wire.len(), STATUS_REPORT_LEN);
        assert_eq!(StatusReport::decode(&wire).unwrap(), report);
    }

    #[test]
    fn short_report_rejected() {
        assert!(StatusReport::decode(&[0, 0, 0, 0, 1]).is_err());
    }

    #[test]
    fn timeout_maps_to_common_timeout() {
        let report = StatusReport::for_error(&SecurityError::Timeout);
        assert_eq!(report, StatusReport::common(common::TIMEOUT));
    }

    #[test]
    fn unmapped_error_is_internal() {
        let report = StatusReport::for_error(&SecurityError::IncorrectState);
        assert_eq!(report, StatusReport::common(common::INTERNAL_ERROR));
    }

    #[test]
    fn key_errors_keep_their_code() {
        let report = StatusReport::for_error(&SecurityError::Key(KeyErrorKind::WrongEncryptionType));
        assert!(report.is(PROFILE_SECURITY, security::WRONG_ENCRYPTION_TYPE));
    }
}
