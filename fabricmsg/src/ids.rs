//! Identifiers shared by the exchange layer and its clients.

use std::fmt;

use crate::error::{ExchangeError, Result};

/// 64-bit fabric node identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub u64);

impl NodeId {
    /// Placeholder used where no node is specified.
    pub const NOT_SPECIFIED: NodeId = NodeId(0);
    /// Wildcard matching any node.
    pub const ANY: NodeId = NodeId(u64::MAX);

    pub fn is_specified(self) -> bool {
        self != Self::NOT_SPECIFIED
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016X}", self.0)
    }
}

/// Handle for an underlying reliable (stream) connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(pub u32);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "con#{}", self.0)
    }
}

/// Handle for a request/response message exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ExchangeId(pub u32);

impl fmt::Display for ExchangeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ec#{}", self.0)
    }
}

/// 16-bit message encryption key identifier.
///
/// The top nibble carries the key type; the low 12 bits are the key number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct KeyId(u16);

impl KeyId {
    const TYPE_MASK: u16 = 0xF000;
    const NUMBER_MASK: u16 = 0x0FFF;
    const TYPE_NONE: u16 = 0x0000;
    const TYPE_GENERAL: u16 = 0x1000;
    const TYPE_SESSION: u16 = 0x2000;

    /// The "no key" identifier used for unencrypted messages.
    pub const NONE: KeyId = KeyId(0x0000);

    /// Largest session key number.
    pub const MAX_SESSION_NUMBER: u16 = Self::NUMBER_MASK;

    pub const fn from_raw(raw: u16) -> Self {
        Self(raw)
    }

    /// Build a session key id from a 12-bit key number.
    pub const fn session(number: u16) -> Self {
        Self(Self::TYPE_SESSION | (number & Self::NUMBER_MASK))
    }

    /// Build a general (fabric-wide) key id from a 12-bit key number.
    pub const fn general(number: u16) -> Self {
        Self(Self::TYPE_GENERAL | (number & Self::NUMBER_MASK))
    }

    pub const fn raw(self) -> u16 {
        self.0
    }

    pub const fn number(self) -> u16 {
        self.0 & Self::NUMBER_MASK
    }

    pub const fn is_none(self) -> bool {
        self.0 & Self::TYPE_MASK == Self::TYPE_NONE
    }

    pub const fn is_session(self) -> bool {
        self.0 & Self::TYPE_MASK == Self::TYPE_SESSION
    }

    pub const fn is_general(self) -> bool {
        self.0 & Self::TYPE_MASK == Self::TYPE_GENERAL
    }
}

impl fmt::Display for KeyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:04X}", self.0)
    }
}

/// Message encryption type applied by the transport with a bound key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum EncryptionType {
    None = 0x00,
    Aes256Gcm = 0x01,
    ChaCha20Poly1305 = 0x02,
}

impl EncryptionType {
    pub fn is_encrypted(self) -> bool {
        self != EncryptionType::None
    }
}

impl TryFrom<u8> for EncryptionType {
    type Error = ExchangeError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0x00 => Ok(EncryptionType::None),
            0x01 => Ok(EncryptionType::Aes256Gcm),
            0x02 => Ok(EncryptionType::ChaCha20Poly1305),
            other => Err(ExchangeError::UnsupportedEncryptionType(other)),
        }
    }
}
