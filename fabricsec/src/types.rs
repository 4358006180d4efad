//! Authentication modes, manager states and caller tokens.

use std::fmt;

use crate::error::{Result, SecurityError};

/// Where a password used for a password-authenticated session came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PasswordSource {
    NotSpecified = 0x00,
    PairingCode = 0x01,
    SetupCode = 0x02,
}

impl TryFrom<u8> for PasswordSource {
    type Error = SecurityError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0x00 => Ok(PasswordSource::NotSpecified),
            0x01 => Ok(PasswordSource::PairingCode),
            0x02 => Ok(PasswordSource::SetupCode),
            _ => Err(SecurityError::InvalidField("password source")),
        }
    }
}

/// Kind of certificate presented by a peer in a certificate session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum CertType {
    NotSpecified = 0x00,
    General = 0x01,
    Device = 0x02,
    ServiceEndpoint = 0x03,
    AccessToken = 0x04,
}

impl TryFrom<u8> for CertType {
    type Error = SecurityError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0x00 => Ok(CertType::NotSpecified),
            0x01 => Ok(CertType::General),
            0x02 => Ok(CertType::Device),
            0x03 => Ok(CertType::ServiceEndpoint),
            0x04 => Ok(CertType::AccessToken),
            _ => Err(SecurityError::InvalidField("certificate type")),
        }
    }
}

/// How the peer of a session key was authenticated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AuthMode {
    NotSpecified,
    Unauthenticated,
    Password(PasswordSource),
    /// Certificate authentication; `CertType::NotSpecified` accepts any type.
    Cert(CertType),
    TokenIdentificationKey,
}

impl AuthMode {
    pub fn is_password(self) -> bool {
        matches!(self, AuthMode::Password(_))
    }

    pub fn is_cert(self) -> bool {
        matches!(self, AuthMode::Cert(_))
    }

    pub fn is_token(self) -> bool {
        matches!(self, AuthMode::TokenIdentificationKey)
    }

    /// Whether a key established with `self` satisfies a request for `requested`.
    pub fn satisfies(self, requested: AuthMode) -> bool {
        match (self, requested) {
            (AuthMode::Cert(_), AuthMode::Cert(CertType::NotSpecified)) => true,
            (actual, requested) => actual == requested,
        }
    }
}

impl fmt::Display for AuthMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AuthMode::NotSpecified => f.write_str("not-specified"),
            AuthMode::Unauthenticated => f.write_str("unauthenticated"),
            AuthMode::Password(src) => write!(f, "password({src:?})"),
            AuthMode::Cert(ty) => write!(f, "cert({ty:?})"),
            AuthMode::TokenIdentificationKey => f.write_str("token"),
        }
    }
}

/// Opaque caller context identifying one locally started attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AttemptToken(pub u64);

/// Lifecycle state of the session manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ManagerState {
    NotInitialized,
    Idle,
    PasswordInProgress,
    CertInProgress,
    TokenInProgress,
    KeyExportInProgress,
}

impl ManagerState {
    pub fn is_in_progress(self) -> bool {
        !matches!(self, ManagerState::NotInitialized | ManagerState::Idle)
    }
}

impl fmt::Display for ManagerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ManagerState::NotInitialized => "not-initialized",
            ManagerState::Idle => "idle",
            ManagerState::PasswordInProgress => "password",
            ManagerState::CertInProgress => "cert",
            ManagerState::TokenInProgress => "token",
            ManagerState::KeyExportInProgress => "key-export",
        };
        f.write_str(label)
    }
}
