//! Key export engine.
//!
//! One request/response round. The responder wraps the requested key under
//! an AEAD key derived from a fresh X25519 agreement; nothing is stored in
//! the session key table.

use std::collections::{HashMap, HashSet};

use bytes::{BufMut, Bytes, BytesMut};
use fabricmsg::NodeId;
use zeroize::Zeroizing;

use crate::crypto::aead::{AeadCipher, WrapCipher};
use crate::crypto::hash::transcript_hash;
use crate::crypto::x25519::{derive_bytes, EphemeralKeyPair};
use crate::engine::{config_allowed, preferred_config};
use crate::error::{Result, SecurityError};
use crate::message::WireReader;

/// ChaCha20-Poly1305 wrapping.
pub const CONFIG_1: u8 = 0x01;
/// AES-256-GCM wrapping.
pub const CONFIG_2: u8 = 0x02;
pub const SUPPORTED_CONFIGS: u8 = CONFIG_1 | CONFIG_2;

const REQUEST_LEN: usize = 1 + 4 + 32;

/// Authorizes and supplies exportable keys.
pub trait KeyExportDelegate: Send + Sync {
    /// Key `key_id` for `peer`, or `UnauthorizedKeyExport`.
    fn export_key(&self, peer: NodeId, key_id: u32) -> Result<Zeroizing<Vec<u8>>>;
}

/// Fixed set of exportable keys with an optional peer allow-list.
#[derive(Default)]
pub struct StaticKeyExport {
    keys: HashMap<u32, Zeroizing<Vec<u8>>>,
    authorized: HashSet<NodeId>,
}

impl StaticKeyExport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_key(mut self, key_id: u32, key: &[u8]) -> Self {
        self.keys.insert(key_id, Zeroizing::new(key.to_vec()));
        self
    }

    /// Restrict exports to listed peers. With no peers listed, any peer may export.
    pub fn authorize(mut self, peer: NodeId) -> Self {
        self.authorized.insert(peer);
        self
    }
}

impl KeyExportDelegate for StaticKeyExport {
    fn export_key(&self, peer: NodeId, key_id: u32) -> Result<Zeroizing<Vec<u8>>> {
        if !self.authorized.is_empty() && !self.authorized.contains(&peer) {
            return Err(SecurityError::UnauthorizedKeyExport);
        }
        self.keys
            .get(&key_id)
            .cloned()
            .ok_or(SecurityError::InvalidField("exported key id"))
    }
}

/// A key received from the peer.
pub struct ExportedKeyMaterial {
    pub key_id: u32,
    pub key: Zeroizing<Vec<u8>>,
}

impl std::fmt::Debug for ExportedKeyMaterial {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExportedKeyMaterial")
            .field("key_id", &self.key_id)
            .field("len", &self.key.len())
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyExportRequestOutcome {
    Proceed { key_id: u32 },
    Reconfigure(u8),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyExportEngineState {
    Idle,
    RequestSent,
    RequestReceived,
    Complete,
}

pub struct KeyExportEngine {
    state: KeyExportEngineState,
    config: u8,
    key_id: u32,
    ephemeral: EphemeralKeyPair,
    request: Bytes,
}

impl KeyExportEngine {
    pub fn initiator(config: u8, key_id: u32, ephemeral: EphemeralKeyPair) -> Result<Self> {
        if !config_allowed(config, SUPPORTED_CONFIGS) {
            return Err(SecurityError::UnsupportedConfig(config));
        }
        Ok(Self {
            state: KeyExportEngineState::Idle,
            config,
            key_id,
            ephemeral,
            request: Bytes::new(),
        })
    }

    pub fn responder(ephemeral: EphemeralKeyPair) -> Self {
        Self {
            state: KeyExportEngineState::Idle,
            config: 0,
            key_id: 0,
            ephemeral,
            request: Bytes::new(),
        }
    }

    pub fn state(&self) -> KeyExportEngineState {
        self.state
    }

    pub fn config(&self) -> u8 {
        self.config
    }

    pub fn key_id(&self) -> u32 {
        self.key_id
    }

    pub fn generate_request(&mut self) -> Result<Bytes> {
        if self.state != KeyExportEngineState::Idle || self.config == 0 {
            return Err(SecurityError::IncorrectState);
        }
        let mut buf = BytesMut::with_capacity(REQUEST_LEN);
        buf.put_u8(self.config);
        buf.put_u32_le(self.key_id);
        buf.put_slice(&self.ephemeral.public_key_bytes());
        self.request = buf.freeze();
        self.state = KeyExportEngineState::RequestSent;
        Ok(self.request.clone())
    }

    pub fn parse_reconfigure(payload: &[u8]) -> Result<u8> {
        let mut r = WireReader::new(payload);
        let config = r.u8()?;
        r.finish()?;
        Ok(config)
    }

    pub fn encode_reconfigure(config: u8) -> Bytes {
        Bytes::copy_from_slice(&[config])
    }

    pub fn process_response(&mut self, payload: &[u8]) -> Result<ExportedKeyMaterial> {
        if self.state != KeyExportEngineState::RequestSent {
            return Err(SecurityError::IncorrectState);
        }
        let mut r = WireReader::new(payload);
        let config = r.u8()?;
        let key_id = r.u32()?;
        let responder_pub: [u8; 32] = r.array()?;
        let len = r.u16()? as usize;
        let wrapped = r.bytes(len)?;
        r.finish()?;

        if config != self.config {
            return Err(SecurityError::InvalidField("key export config"));
        }
        if key_id != self.key_id {
            return Err(SecurityError::InvalidField("exported key id"));
        }
        let header = &payload[..REQUEST_LEN];
        let (nonce, cipher) = self.wrap_cipher(&responder_pub, header)?;
        let key = cipher.decrypt(&nonce, wrapped, &self.aad(header))?;
        self.state = KeyExportEngineState::Complete;
        Ok(ExportedKeyMaterial { key_id, key })
    }

    pub fn process_request(&mut self, payload: &[u8], allowed: u8) -> Result<KeyExportRequestOutcome> {
        if self.state != KeyExportEngineState::Idle {
            return Err(SecurityError::IncorrectState);
        }
        let mut r = WireReader::new(payload);
        let config = r.u8()?;
        let key_id = r.u32()?;
        let _initiator_pub: [u8; 32] = r.array()?;
        r.finish()?;

        if !config_allowed(config, allowed & SUPPORTED_CONFIGS) {
            return preferred_config(allowed, SUPPORTED_CONFIGS)
                .map(KeyExportRequestOutcome::Reconfigure)
                .ok_or(SecurityError::NoCommonConfig);
        }
        self.config = config;
        self.key_id = key_id;
        self.request = Bytes::copy_from_slice(payload);
        self.state = KeyExportEngineState::RequestReceived;
        Ok(KeyExportRequestOutcome::Proceed { key_id })
    }

    pub fn generate_response(&mut self, key: &[u8]) -> Result<Bytes> {
        if self.state != KeyExportEngineState::RequestReceived {
            return Err(SecurityError::IncorrectState);
        }
        let mut buf = BytesMut::with_capacity(REQUEST_LEN + 2 + key.len() + 16);
        buf.put_u8(self.config);
        buf.put_u32_le(self.key_id);
        buf.put_slice(&self.ephemeral.public_key_bytes());

        let mut initiator_pub = [0u8; 32];
        initiator_pub.copy_from_slice(&self.request[5..REQUEST_LEN]);
        let header = buf.to_vec();
        let (nonce, cipher) = self.wrap_cipher(&initiator_pub, &header)?;
        let wrapped = cipher.encrypt(&nonce, key, &self.aad(&header))?;
        let len = u16::try_from(wrapped.len())
            .map_err(|_| SecurityError::InvalidArgument("exported key too long"))?;
        buf.put_u16_le(len);
        buf.put_slice(&wrapped);
        self.state = KeyExportEngineState::Complete;
        Ok(buf.freeze())
    }

    /// AEAD key and nonce bound to the request and the response header.
    fn wrap_cipher(&self, peer_pub: &[u8; 32], header: &[u8]) -> Result<([u8; 12], AeadCipher)> {
        let shared = self.ephemeral.diffie_hellman(peer_pub)?;
        let salt = transcript_hash(&[&self.request, header]);
        let info = [b"fabric key export".as_slice(), &[self.config]].concat();
        let mut okm = Zeroizing::new([0u8; 44]);
        derive_bytes(&shared, &salt, &info, &mut okm[..])?;

        let mut key = [0u8; 32];
        key.copy_from_slice(&okm[..32]);
        let mut nonce = [0u8; 12];
        nonce.copy_from_slice(&okm[32..]);
        let cipher = match self.config {
            CONFIG_1 => WrapCipher::ChaCha20Poly1305,
            _ => WrapCipher::Aes256Gcm,
        };
        Ok((nonce, AeadCipher::new(cipher, key)))
    }

    fn aad(&self, header: &[u8]) -> Vec<u8> {
        [self.request.as_ref(), header].concat()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn export(config: u8, key: &[u8]) -> Result<ExportedKeyMaterial> {
        let mut init = KeyExportEngine::initiator(config, 7, EphemeralKeyPair::generate())?;
        let mut resp = KeyExportEngine::responder(EphemeralKeyPair::generate());
        let request = init.generate_request()?;
        assert_eq!(
            resp.process_request(&request, SUPPORTED_CONFIGS)?,
            KeyExportRequestOutcome::Proceed { key_id: 7 }
        );
        let response = resp.generate_response(key)?;
        init.process_response(&response)
    }

    #[test]
    fn chacha_wrapped_export() {
        let exported = export(CONFIG_1, b"fabric secret 0123456789").unwrap();
        assert_eq!(exported.key_id, 7);
        assert_eq!(exported.key.as_slice(), b"fabric secret 0123456789");
    }

    #[test]
    fn aes_wrapped_export() {
        let exported = export(CONFIG_2, &[0x11; 36]).unwrap();
        assert_eq!(exported.key.as_slice(), &[0x11; 36]);
    }

    #[test]
    fn tampered_response_rejected() {
        let mut init = KeyExportEngine::initiator(CONFIG_1, 1, EphemeralKeyPair::generate()).unwrap();
        let mut resp = KeyExportEngine::responder(EphemeralKeyPair::generate());
        let request = init.generate_request().unwrap();
        resp.process_request(&request, SUPPORTED_CONFIGS).unwrap();
        let mut response = resp.generate_response(b"secret").unwrap().to_vec();
        let last = response.len() - 1;
        response[last] ^= 0x80;
        assert_eq!(
            init.process_response(&response).unwrap_err(),
            SecurityError::AuthenticationFailed
        );
    }

    #[test]
    fn reconfigure_to_allowed_config() {
        let mut init = KeyExportEngine::initiator(CONFIG_2, 1, EphemeralKeyPair::generate()).unwrap();
        let mut resp = KeyExportEngine::responder(EphemeralKeyPair::generate());
        let request = init.generate_request().unwrap();
        assert_eq!(
            resp.process_request(&request, CONFIG_1).unwrap(),
            KeyExportRequestOutcome::Reconfigure(CONFIG_1)
        );
        assert_eq!(resp.state(), KeyExportEngineState::Idle);
    }

    #[test]
    fn allow_list_enforced() {
        let delegate = StaticKeyExport::new().with_key(1, b"k").authorize(NodeId(5));
        assert!(delegate.export_key(NodeId(5), 1).is_ok());
        assert_eq!(
            delegate.export_key(NodeId(6), 1).unwrap_err(),
            SecurityError::UnauthorizedKeyExport
        );
    }
}
