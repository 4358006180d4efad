//! Password-authenticated key exchange engine.
//!
//! ```text
//!   Initiator                               Responder
//!     |--- InitiatorStep1 (pub, params) --->|
//!     |<-- ResponderStep1 (pub) ------------|
//!     |<-- ResponderStep2 (proof) ----------|
//!     |--- InitiatorStep2 (proof) --------->|
//!     |<-- ResponderKeyConfirm (optional) --|
//! ```
//!
//! Both sides mix the password into the HKDF salt, so a wrong password
//! surfaces as a proof mismatch (`KeyConfirmationFailed`).

use bytes::{BufMut, Bytes, BytesMut};
use fabricmsg::{EncryptionType, KeyId, NodeId};
use zeroize::Zeroizing;

use crate::crypto::hash::{confirm_tag, tags_match, transcript_hash, ConfirmHash};
use crate::crypto::keys::SessionKeyMaterial;
use crate::crypto::x25519::{derive_handshake_keys, DerivedKeys, EphemeralKeyPair, HandshakeRole};
use crate::engine::{config_allowed, preferred_config};
use crate::error::{Result, SecurityError};
use crate::message::WireReader;
use crate::types::PasswordSource;

/// SHA-256 confirmation tags. Understood by every peer.
pub const CONFIG_1: u8 = 0x01;
/// BLAKE3 confirmation tags.
pub const CONFIG_2: u8 = 0x02;
pub const SUPPORTED_CONFIGS: u8 = CONFIG_1 | CONFIG_2;

const FLAG_KEY_CONFIRM: u8 = 0x01;

const LABEL_RESPONDER_PROOF: &[u8] = b"password responder proof";
const LABEL_INITIATOR_PROOF: &[u8] = b"password initiator proof";
const LABEL_KEY_CONFIRM: &[u8] = b"password key confirm";

/// Supplies passwords for password-authenticated sessions.
pub trait PasswordDelegate: Send + Sync {
    /// Password shared with `peer` for `source`, if one is known.
    fn password(&self, source: PasswordSource, peer: NodeId) -> Option<Zeroizing<Vec<u8>>>;
}

/// One password for every peer.
pub struct StaticPassword {
    source: PasswordSource,
    password: Zeroizing<Vec<u8>>,
}

impl StaticPassword {
    pub fn new(source: PasswordSource, password: &[u8]) -> Self {
        Self {
            source,
            password: Zeroizing::new(password.to_vec()),
        }
    }
}

impl PasswordDelegate for StaticPassword {
    fn password(&self, source: PasswordSource, _peer: NodeId) -> Option<Zeroizing<Vec<u8>>> {
        (source == self.source).then(|| self.password.clone())
    }
}

/// Parameters carried in InitiatorStep1.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PasswordProposal {
    pub key_id: KeyId,
    pub encryption_type: EncryptionType,
    pub config: u8,
    pub source: PasswordSource,
    pub key_confirm: bool,
}

/// Responder decision after reading InitiatorStep1.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PasswordStep1Outcome {
    Proceed(PasswordProposal),
    /// Propose another configuration.
    Reconfigure(u8),
    /// A responder limited to configuration 1 answers with a status report.
    OnlyConfig1,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PasswordEngineState {
    Idle,
    Step1Sent,
    ResponderStep1Received,
    ResponderVerified,
    Step1Received,
    ResponderStepsSent,
    AwaitingKeyConfirm,
    Complete,
}

pub struct PasswordEngine {
    role: HandshakeRole,
    state: PasswordEngineState,
    proposal: Option<PasswordProposal>,
    ephemeral: EphemeralKeyPair,
    password: Zeroizing<Vec<u8>>,
    initiator_pub: [u8; 32],
    responder_pub: [u8; 32],
    keys: Option<DerivedKeys>,
}

impl PasswordEngine {
    pub fn initiator(
        proposal: PasswordProposal,
        password: Zeroizing<Vec<u8>>,
        ephemeral: EphemeralKeyPair,
    ) -> Result<Self> {
        if !config_allowed(proposal.config, SUPPORTED_CONFIGS) {
            return Err(SecurityError::UnsupportedConfig(proposal.config));
        }
        Ok(Self {
            role: HandshakeRole::Initiator,
            state: PasswordEngineState::Idle,
            proposal: Some(proposal),
            ephemeral,
            password,
            initiator_pub: [0; 32],
            responder_pub: [0; 32],
            keys: None,
        })
    }

    pub fn responder(ephemeral: EphemeralKeyPair) -> Self {
        Self {
            role: HandshakeRole::Responder,
            state: PasswordEngineState::Idle,
            proposal: None,
            ephemeral,
            password: Zeroizing::new(Vec::new()),
            initiator_pub: [0; 32],
            responder_pub: [0; 32],
            keys: None,
        }
    }

    pub fn state(&self) -> PasswordEngineState {
        self.state
    }

    pub fn proposal(&self) -> Option<&PasswordProposal> {
        self.proposal.as_ref()
    }

    pub fn is_complete(&self) -> bool {
        self.state == PasswordEngineState::Complete
    }

    fn require(&self, state: PasswordEngineState) -> Result<PasswordProposal> {
        if self.state != state {
            return Err(SecurityError::IncorrectState);
        }
        self.proposal.ok_or(SecurityError::IncorrectState)
    }

    // ── Initiator ───────────────────────────────────────────────────────

    pub fn generate_initiator_step1(&mut self) -> Result<Bytes> {
        let p = self.require(PasswordEngineState::Idle)?;
        self.initiator_pub = self.ephemeral.public_key_bytes();

        let mut buf = BytesMut::with_capacity(38);
        buf.put_u16_le(p.key_id.raw());
        buf.put_u8(p.encryption_type as u8);
        buf.put_u8(p.config);
        buf.put_u8(p.source as u8);
        buf.put_u8(if p.key_confirm { FLAG_KEY_CONFIRM } else { 0 });
        buf.put_slice(&self.initiator_pub);

        self.state = PasswordEngineState::Step1Sent;
        Ok(buf.freeze())
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

    pub fn process_responder_step1(&mut self, payload: &[u8]) -> Result<()> {
        self.require(PasswordEngineState::Step1Sent)?;
        let mut r = WireReader::new(payload);
        self.responder_pub = r.array()?;
        r.finish()?;
        self.derive()?;
        self.state = PasswordEngineState::ResponderStep1Received;
        Ok(())
    }

    pub fn process_responder_step2(&mut self, payload: &[u8]) -> Result<()> {
        self.require(PasswordEngineState::ResponderStep1Received)?;
        self.verify(payload, LABEL_RESPONDER_PROOF)?;
        self.state = PasswordEngineState::ResponderVerified;
        Ok(())
    }

    pub fn generate_initiator_step2(&mut self) -> Result<Bytes> {
        let p = self.require(PasswordEngineState::ResponderVerified)?;
        let proof = self.tag(LABEL_INITIATOR_PROOF)?;
        self.state = if p.key_confirm {
            PasswordEngineState::AwaitingKeyConfirm
        } else {
            PasswordEngineState::Complete
        };
        Ok(Bytes::copy_from_slice(&proof))
    }

    pub fn process_responder_key_confirm(&mut self, payload: &[u8]) -> Result<()> {
        self.require(PasswordEngineState::AwaitingKeyConfirm)?;
        self.verify(payload, LABEL_KEY_CONFIRM)?;
        self.state = PasswordEngineState::Complete;
        Ok(())
    }

    // ── Responder ───────────────────────────────────────────────────────

    pub fn process_initiator_step1(&mut self, payload: &[u8], allowed: u8) -> Result<PasswordStep1Outcome> {
        if self.state != PasswordEngineState::Idle || self.role != HandshakeRole::Responder {
            return Err(SecurityError::IncorrectState);
        }
        let mut r = WireReader::new(payload);
        let key_id = KeyId::from_raw(r.u16()?);
        let encryption_type = EncryptionType::try_from(r.u8()?)?;
        let config = r.u8()?;
        let source = PasswordSource::try_from(r.u8()?)?;
        let flags = r.u8()?;
        let initiator_pub: [u8; 32] = r.array()?;
        r.finish()?;

        if !key_id.is_session() {
            return Err(SecurityError::InvalidField("session key id"));
        }
        if !encryption_type.is_encrypted() {
            return Err(SecurityError::InvalidField("encryption type"));
        }

        if !config_allowed(config, allowed & SUPPORTED_CONFIGS) {
            if allowed & SUPPORTED_CONFIGS == CONFIG_1 {
                return Ok(PasswordStep1Outcome::OnlyConfig1);
            }
            return preferred_config(allowed, SUPPORTED_CONFIGS)
                .map(PasswordStep1Outcome::Reconfigure)
                .ok_or(SecurityError::NoCommonConfig);
        }

        let proposal = PasswordProposal {
            key_id,
            encryption_type,
            config,
            source,
            key_confirm: flags & FLAG_KEY_CONFIRM != 0,
        };
        self.proposal = Some(proposal);
        self.initiator_pub = initiator_pub;
        self.state = PasswordEngineState::Step1Received;
        Ok(PasswordStep1Outcome::Proceed(proposal))
    }

    /// Produce ResponderStep1 and ResponderStep2.
    pub fn generate_responder_steps(&mut self, password: Zeroizing<Vec<u8>>) -> Result<(Bytes, Bytes)> {
        self.require(PasswordEngineState::Step1Received)?;
        self.password = password;
        self.responder_pub = self.ephemeral.public_key_bytes();
        self.derive()?;
        let step1 = Bytes::copy_from_slice(&self.responder_pub);
        let step2 = Bytes::copy_from_slice(&self.tag(LABEL_RESPONDER_PROOF)?);
        self.state = PasswordEngineState::ResponderStepsSent;
        Ok((step1, step2))
    }

    pub fn process_initiator_step2(&mut self, payload: &[u8]) -> Result<()> {
        self.require(PasswordEngineState::ResponderStepsSent)?;
        self.verify(payload, LABEL_INITIATOR_PROOF)?;
        self.state = PasswordEngineState::Complete;
        Ok(())
    }

    pub fn generate_responder_key_confirm(&self) -> Result<Bytes> {
        let p = self.require(PasswordEngineState::Complete)?;
        if !p.key_confirm {
            return Err(SecurityError::IncorrectState);
        }
        Ok(Bytes::copy_from_slice(&self.tag(LABEL_KEY_CONFIRM)?))
    }

    // ── Result ──────────────────────────────────────────────────────────

    /// Available once the peer's proof has been verified.
    pub fn session_key(&self) -> Result<SessionKeyMaterial> {
        if !matches!(
            self.state,
            PasswordEngineState::Complete | PasswordEngineState::AwaitingKeyConfirm
        ) {
            return Err(SecurityError::IncorrectState);
        }
        self.keys
            .as_ref()
            .map(|k| k.session_key.clone())
            .ok_or(SecurityError::IncorrectState)
    }

    fn derive(&mut self) -> Result<()> {
        let p = self.proposal.ok_or(SecurityError::IncorrectState)?;
        let peer_pub = match self.role {
            HandshakeRole::Initiator => self.responder_pub,
            HandshakeRole::Responder => self.initiator_pub,
        };
        let shared = self.ephemeral.diffie_hellman(&peer_pub)?;
        let salt = transcript_hash(&[b"fabric password salt", self.password.as_slice()]);
        let key_id = p.key_id.raw().to_le_bytes();
        let parts: [&[u8]; 5] = [
            b"fabric password",
            &[p.config],
            &key_id,
            &self.initiator_pub,
            &self.responder_pub,
        ];
        let info = parts.concat();
        self.keys = Some(derive_handshake_keys(&shared, &salt, &info)?);
        Ok(())
    }

    fn tag(&self, label: &[u8]) -> Result<[u8; 32]> {
        let p = self.proposal.ok_or(SecurityError::IncorrectState)?;
        let keys = self.keys.as_ref().ok_or(SecurityError::IncorrectState)?;
        let hash = if p.config == CONFIG_1 {
            ConfirmHash::Sha256
        } else {
            ConfirmHash::Blake3
        };
        let transcript = [self.initiator_pub, self.responder_pub].concat();
        Ok(confirm_tag(hash, &keys.confirm_key, label, &transcript))
    }

    fn verify(&self, payload: &[u8], label: &[u8]) -> Result<()> {
        let mut r = WireReader::new(payload);
        let received: [u8; 32] = r.array()?;
        r.finish()?;
        if !tags_match(&received, &self.tag(label)?) {
            return Err(SecurityError::KeyConfirmationFailed);
        }
        Ok(())
    }
}
