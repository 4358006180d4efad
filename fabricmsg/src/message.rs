//! Message addressing: profiles, inbound message records and send flags.

use std::ops::BitOr;

use bytes::Bytes;

use crate::ids::{ConnectionId, EncryptionType, ExchangeId, KeyId, NodeId};

/// 32-bit profile identifier scoping a message type.
pub type ProfileId = u32;

/// The common profile (status reports and other generic messages).
pub const PROFILE_COMMON: ProfileId = 0x0000_0000;
/// The security profile (session establishment, key errors, key export).
pub const PROFILE_SECURITY: ProfileId = 0x0000_0004;

/// Common-profile message type carrying a status report.
pub const COMMON_MSG_STATUS_REPORT: u8 = 0x01;

/// A message delivered to a client of the exchange layer.
#[derive(Debug, Clone)]
pub struct InboundMessage {
    /// Exchange the message arrived on.
    pub exchange: ExchangeId,
    /// Sending node.
    pub peer: NodeId,
    /// Connection the message arrived on, if connection-bound.
    pub connection: Option<ConnectionId>,
    pub profile: ProfileId,
    pub msg_type: u8,
    /// Transport-assigned message id.
    pub message_id: u32,
    /// Key the message was protected with (`KeyId::NONE` if unencrypted).
    pub key_id: KeyId,
    pub encryption_type: EncryptionType,
    /// Whether the sender asked for a reliable-messaging acknowledgement.
    pub ack_requested: bool,
    pub payload: Bytes,
}

impl InboundMessage {
    /// Returns true if this message carries the given profile and type.
    pub fn is(&self, profile: ProfileId, msg_type: u8) -> bool {
        self.profile == profile && self.msg_type == msg_type
    }
}

/// Flags controlling how an outbound message is sent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SendFlags(pub u8);

impl SendFlags {
    pub const NONE: Self = Self(0x00);
    /// A response is expected on the exchange.
    pub const EXPECT_RESPONSE: Self = Self(0x01);
    /// Request a reliable-messaging acknowledgement (non-connection exchanges).
    pub const REQUEST_ACK: Self = Self(0x02);

    pub fn contains(self, flag: SendFlags) -> bool {
        (self.0 & flag.0) == flag.0
    }
}

impl BitOr for SendFlags {
    type Output = SendFlags;

    fn bitor(self, rhs: SendFlags) -> SendFlags {
        SendFlags(self.0 | rhs.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_combine() {
        let f = SendFlags::EXPECT_RESPONSE | SendFlags::REQUEST_ACK;
        assert!(f.contains(SendFlags::EXPECT_RESPONSE));
        assert!(f.contains(SendFlags::REQUEST_ACK));
        assert!(!SendFlags::NONE.contains(SendFlags::REQUEST_ACK));
    }
}
