//! Key error messages.
//!
//! A node that receives a message it cannot decrypt tells the sender with a
//! fixed 9-byte key error: key id (2), encryption type (1), message id (4)
//! and error code (2), all little-endian.

use std::fmt;

use bytes::{BufMut, Bytes, BytesMut};
use fabricmsg::{EncryptionType, KeyId};

use crate::error::{Result, SecurityError};
use crate::message::WireReader;
use crate::status_report::security;

pub const KEY_ERROR_LEN: usize = 9;

/// Why a message protected by a key could not be processed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KeyErrorKind {
    KeyNotFound,
    WrongEncryptionType,
    UnknownKeyType,
    InvalidUseOfSessionKey,
    UnsupportedEncryptionType,
    InternalKeyError,
}

impl KeyErrorKind {
    /// Security-profile status code carried on the wire.
    pub fn code(self) -> u16 {
        match self {
            KeyErrorKind::KeyNotFound => security::KEY_NOT_FOUND,
            KeyErrorKind::WrongEncryptionType => security::WRONG_ENCRYPTION_TYPE,
            KeyErrorKind::UnknownKeyType => security::UNKNOWN_KEY_TYPE,
            KeyErrorKind::InvalidUseOfSessionKey => security::INVALID_USE_OF_SESSION_KEY,
            KeyErrorKind::UnsupportedEncryptionType => security::UNSUPPORTED_ENCRYPTION_TYPE,
            KeyErrorKind::InternalKeyError => security::INTERNAL_KEY_ERROR,
        }
    }

    /// Unknown codes from a peer are treated as internal key errors.
    pub fn from_code(code: u16) -> Self {
        match code {
            security::KEY_NOT_FOUND => KeyErrorKind::KeyNotFound,
            security::WRONG_ENCRYPTION_TYPE => KeyErrorKind::WrongEncryptionType,
            security::UNKNOWN_KEY_TYPE => KeyErrorKind::UnknownKeyType,
            security::INVALID_USE_OF_SESSION_KEY => KeyErrorKind::InvalidUseOfSessionKey,
            security::UNSUPPORTED_ENCRYPTION_TYPE => KeyErrorKind::UnsupportedEncryptionType,
            _ => KeyErrorKind::InternalKeyError,
        }
    }
}

impl fmt::Display for KeyErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            KeyErrorKind::KeyNotFound => "key not found",
            KeyErrorKind::WrongEncryptionType => "wrong encryption type",
            KeyErrorKind::UnknownKeyType => "unknown key type",
            KeyErrorKind::InvalidUseOfSessionKey => "invalid use of session key",
            KeyErrorKind::UnsupportedEncryptionType => "unsupported encryption type",
            KeyErrorKind::InternalKeyError => "internal key error",
        };
        f.write_str(label)
    }
}

/// Decoded key error payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeyErrorMessage {
    pub key_id: KeyId,
    /// Encryption type byte as sent; a peer may name a type this node lacks.
    pub raw_encryption_type: u8,
    pub message_id: u32,
    pub error_code: u16,
}

impl KeyErrorMessage {
    pub fn new(key_id: KeyId, encryption_type: EncryptionType, message_id: u32, kind: KeyErrorKind) -> Self {
        Self {
            key_id,
            raw_encryption_type: encryption_type as u8,
            message_id,
            error_code: kind.code(),
        }
    }

    pub fn kind(&self) -> KeyErrorKind {
        KeyErrorKind::from_code(self.error_code)
    }

    pub fn encryption_type(&self) -> Option<EncryptionType> {
        EncryptionType::try_from(self.raw_encryption_type).ok()
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(KEY_ERROR_LEN);
        buf.put_u16_le(self.key_id.raw());
        buf.put_u8(self.raw_encryption_type);
        buf.put_u32_le(self.message_id);
        buf.put_u16_le(self.error_code);
        buf.freeze()
    }

    pub fn decode(payload: &[u8]) -> Result<Self> {
        if payload.len() != KEY_ERROR_LEN {
            return Err(SecurityError::InvalidMessageLength {
                need: KEY_ERROR_LEN,
                have: payload.len(),
            });
        }
        let mut r = WireReader::new(payload);
        let key_id = KeyId::from_raw(r.u16()?);
        let raw_encryption_type = r.u8()?;
        let message_id = r.u32()?;
        let error_code = r.u16()?;
        Ok(Self {
            key_id,
            raw_encryption_type,
            message_id,
            error_code,
        })
    }
}
