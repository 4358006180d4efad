//! Security profile message types and a little-endian field reader.

use bytes::Buf;

use crate::error::{Result, SecurityError};

/// Message types carried under the security profile.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum SecurityMsgType {
    // Password-authenticated exchange
    PasswordInitiatorStep1 = 0x01,
    PasswordResponderStep1 = 0x02,
    PasswordResponderStep2 = 0x03,
    PasswordInitiatorStep2 = 0x04,
    PasswordResponderKeyConfirm = 0x05,
    PasswordResponderReconfigure = 0x06,

    // Certificate-authenticated exchange
    CertBeginSessionRequest = 0x0A,
    CertBeginSessionResponse = 0x0B,
    CertInitiatorKeyConfirm = 0x0C,
    CertReconfigure = 0x0D,

    // Token-authenticated exchange
    TokenIdentifyToken = 0x14,
    TokenIdentifyTokenResponse = 0x15,
    TokenReconfigure = 0x16,
    TokenAuthenticateToken = 0x17,
    TokenAuthenticateTokenResponse = 0x18,
    TokenReAuthenticateToken = 0x19,
    TokenReAuthenticateTokenResponse = 0x1A,

    // Key export
    KeyExportRequest = 0x1E,
    KeyExportResponse = 0x1F,
    KeyExportReconfigure = 0x20,

    // Session key lifecycle
    EndSession = 0x64,
    KeyError = 0x65,
}

impl SecurityMsgType {
    pub fn as_u8(self) -> u8 {
        self as u8
    }
}

impl TryFrom<u8> for SecurityMsgType {
    type Error = SecurityError;

    fn try_from(value: u8) -> Result<Self> {
        use SecurityMsgType::*;
        let ty = match value {
            0x01 => PasswordInitiatorStep1,
            0x02 => PasswordResponderStep1,
            0x03 => PasswordResponderStep2,
            0x04 => PasswordInitiatorStep2,
            0x05 => PasswordResponderKeyConfirm,
            0x06 => PasswordResponderReconfigure,
            0x0A => CertBeginSessionRequest,
            0x0B => CertBeginSessionResponse,
            0x0C => CertInitiatorKeyConfirm,
            0x0D => CertReconfigure,
            0x14 => TokenIdentifyToken,
            0x15 => TokenIdentifyTokenResponse,
            0x16 => TokenReconfigure,
            0x17 => TokenAuthenticateToken,
            0x18 => TokenAuthenticateTokenResponse,
            0x19 => TokenReAuthenticateToken,
            0x1A => TokenReAuthenticateTokenResponse,
            0x1E => KeyExportRequest,
            0x1F => KeyExportResponse,
            0x20 => KeyExportReconfigure,
            0x64 => EndSession,
            0x65 => KeyError,
            other => return Err(SecurityError::InvalidMessageType(other)),
        };
        Ok(ty)
    }
}

/// Bounds-checked little-endian reader over a message payload.
pub(crate) struct WireReader<'a> {
    buf: &'a [u8],
}

impl<'a> WireReader<'a> {
    pub(crate) fn new(buf: &'a [u8]) -> Self {
        Self { buf }
    }

    fn need(&self, n: usize) -> Result<()> {
        if self.buf.remaining() < n {
            return Err(SecurityError::InvalidMessageLength {
                need: n,
                have: self.buf.remaining(),
            });
        }
        Ok(())
    }

    pub(crate) fn u8(&mut self) -> Result<u8> {
        self.need(1)?;
        Ok(self.buf.get_u8())
    }

    pub(crate) fn u16(&mut self) -> Result<u16> {
        self.need(2)?;
        Ok(self.buf.get_u16_le())
    }

    pub(crate) fn u32(&mut self) -> Result<u32> {
        self.need(4)?;
        Ok(self.buf.get_u32_le())
    }

    pub(crate) fn u64(&mut self) -> Result<u64> {
        self.need(8)?;
        Ok(self.buf.get_u64_le())
    }

    pub(crate) fn array<const N: usize>(&mut self) -> Result<[u8; N]> {
        self.need(N)?;
        let mut out = [0u8; N];
        self.buf.copy_to_slice(&mut out);
        Ok(out)
    }

    pub(crate) fn bytes(&mut self, n: usize) -> Result<&'a [u8]> {
        self.need(n)?;
        let (head, tail) = self.buf.split_at(n);
        self.buf = tail;
        Ok(head)
    }

    /// Fail if unread bytes remain.
    pub(crate) fn finish(self) -> Result<()> {
        if !self.buf.is_empty() {
            return Err(SecurityError::InvalidField("trailing bytes"));
        }
        Ok(())
    }
}
