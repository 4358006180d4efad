use thiserror::Error;

use crate::ids::{ConnectionId, ExchangeId};
use crate::message::ProfileId;

/// All errors produced by the fabric message exchange layer.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ExchangeError {
    #[error("exchange {0} not found")]
    UnknownExchange(ExchangeId),

    #[error("exchange {0} is closed")]
    ExchangeClosed(ExchangeId),

    #[error("connection {0} not found")]
    UnknownConnection(ConnectionId),

    #[error("unsupported encryption type: 0x{0:02x}")]
    UnsupportedEncryptionType(u8),

    #[error("unsolicited handler already registered for profile 0x{0:08x}")]
    HandlerAlreadyRegistered(ProfileId),

    #[error("no unsolicited handler registered for profile 0x{0:08x}")]
    HandlerNotRegistered(ProfileId),

    #[error("send failed: {0}")]
    SendFailed(String),

    #[error("no acknowledgement received for message {0}")]
    AckTimeout(u32),
}

pub type Result<T> = std::result::Result<T, ExchangeError>;
