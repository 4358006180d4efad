//! Certificate-authenticated key exchange engine.
//!
//! ```text
//!   Initiator                                      Responder
//!     |--- BeginSessionRequest (pub, cert, sig) --->|
//!     |<-- BeginSessionResponse (pub, cert, sig) ---|  [+ responder confirm]
//!     |--- InitiatorKeyConfirm (optional) --------->|
//! ```
//!
//! Each side signs its message with the Ed25519 key named in its
//! certificate; the response signature also covers the request hash.

use std::sync::Arc;

use bytes::{BufMut, Bytes, BytesMut};
use fabricmsg::{EncryptionType, KeyId, NodeId};

use crate::crypto::hash::{confirm_tag, tags_match, transcript_hash, ConfirmHash};
use crate::crypto::keys::{verify_signature, IdentityKeyPair, SessionKeyMaterial};
use crate::crypto::x25519::{derive_handshake_keys, DerivedKeys, EphemeralKeyPair, HandshakeRole};
use crate::engine::{config_allowed, preferred_config};
use crate::error::{Result, SecurityError};
use crate::message::WireReader;
use crate::types::CertType;

/// SHA-256 confirmation tags.
pub const CONFIG_1: u8 = 0x01;
/// BLAKE3 confirmation tags.
pub const CONFIG_2: u8 = 0x02;
pub const SUPPORTED_CONFIGS: u8 = CONFIG_1 | CONFIG_2;

pub const CURVE_X25519: u8 = 0x01;
pub const SUPPORTED_CURVES: u8 = CURVE_X25519;

/// Encoded certificate length: node id, type, public key, issuer signature.
pub const CERT_LEN: usize = 8 + 1 + 32 + 64;

const FLAG_KEY_CONFIRM: u8 = 0x01;
const SIGNATURE_LEN: usize = 64;

const LABEL_RESPONDER_CONFIRM: &[u8] = b"cert responder confirm";
const LABEL_INITIATOR_CONFIRM: &[u8] = b"cert initiator confirm";

// ── Certificates ─────────────────────────────────────────────────────────

/// A node certificate signed by a trust anchor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Certificate {
    pub node_id: NodeId,
    pub cert_type: CertType,
    pub public_key: [u8; 32],
    pub signature: [u8; 64],
}

impl Certificate {
    /// Sign a certificate for `subject_public_key` with `issuer`.
    pub fn issue(
        issuer: &IdentityKeyPair,
        node_id: NodeId,
        cert_type: CertType,
        subject_public_key: [u8; 32],
    ) -> Self {
        let mut cert = Self {
            node_id,
            cert_type,
            public_key: subject_public_key,
            signature: [0; 64],
        };
        cert.signature = issuer.sign(&cert.tbs());
        cert
    }

    fn tbs(&self) -> Vec<u8> {
        let mut tbs = Vec::with_capacity(CERT_LEN - SIGNATURE_LEN);
        tbs.extend_from_slice(&self.node_id.0.to_le_bytes());
        tbs.push(self.cert_type as u8);
        tbs.extend_from_slice(&self.public_key);
        tbs
    }

    /// Check the issuer signature.
    pub fn verify(&self, issuer_public_key: &[u8; 32]) -> Result<()> {
        verify_signature(issuer_public_key, &self.tbs(), &self.signature)
            .map_err(|_| SecurityError::InvalidCertificate("issuer signature"))
    }

    fn encode(&self, buf: &mut BytesMut) {
        buf.put_u64_le(self.node_id.0);
        buf.put_u8(self.cert_type as u8);
        buf.put_slice(&self.public_key);
        buf.put_slice(&self.signature);
    }

    fn decode(r: &mut WireReader<'_>) -> Result<Self> {
        Ok(Self {
            node_id: NodeId(r.u64()?),
            cert_type: CertType::try_from(r.u8()?)?,
            public_key: r.array()?,
            signature: r.array()?,
        })
    }
}

/// A certificate plus the signing key it certifies.
#[derive(Debug)]
pub struct NodeCredentials {
    pub certificate: Certificate,
    pub identity: IdentityKeyPair,
}

impl NodeCredentials {
    /// Generate a fresh identity for `node_id` and certify it with `issuer`.
    pub fn issue(issuer: &IdentityKeyPair, node_id: NodeId, cert_type: CertType) -> Self {
        let identity = IdentityKeyPair::generate();
        let certificate = Certificate::issue(issuer, node_id, cert_type, identity.public_key_bytes());
        Self {
            certificate,
            identity,
        }
    }
}

/// Supplies local credentials and validates peer certificates.
pub trait CertDelegate: Send + Sync {
    fn credentials(&self) -> Option<&NodeCredentials>;

    /// Accept or reject the certificate presented by `peer`.
    fn validate_peer_cert(&self, peer: NodeId, cert: &Certificate) -> Result<()>;
}

/// Trusts certificates signed by a single anchor key.
#[derive(Debug)]
pub struct TrustAnchorDelegate {
    credentials: NodeCredentials,
    anchor: [u8; 32],
}

impl TrustAnchorDelegate {
    pub fn new(credentials: NodeCredentials, anchor_public_key: [u8; 32]) -> Self {
        Self {
            credentials,
            anchor: anchor_public_key,
        }
    }
}

impl CertDelegate for TrustAnchorDelegate {
    fn credentials(&self) -> Option<&NodeCredentials> {
        Some(&self.credentials)
    }

    fn validate_peer_cert(&self, peer: NodeId, cert: &Certificate) -> Result<()> {
        if cert.node_id != peer {
            return Err(SecurityError::InvalidCertificate("node id mismatch"));
        }
        cert.verify(&self.anchor)
    }
}

// ── Engine ───────────────────────────────────────────────────────────────

/// Parameters carried in BeginSessionRequest.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CertProposal {
    pub key_id: KeyId,
    pub encryption_type: EncryptionType,
    pub config: u8,
    pub curve: u8,
    pub key_confirm: bool,
}

/// Responder decision after reading BeginSessionRequest.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CertRequestOutcome {
    Proceed(CertProposal),
    Reconfigure { config: u8, curve: u8 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CertEngineState {
    Idle,
    RequestSent,
    /// Initiator verified the response and owes a key confirmation.
    ResponseProcessed,
    RequestReceived,
    /// Responder sent its response and awaits a key confirmation.
    ResponseSent,
    Complete,
}

pub struct CertEngine {
    role: HandshakeRole,
    state: CertEngineState,
    proposal: Option<CertProposal>,
    delegate: Arc<dyn CertDelegate>,
    ephemeral: EphemeralKeyPair,
    request_hash: [u8; 32],
    initiator_pub: [u8; 32],
    peer_cert: Option<Certificate>,
    transcript: [u8; 32],
    keys: Option<DerivedKeys>,
}

impl CertEngine {
    pub fn initiator(
        proposal: CertProposal,
        delegate: Arc<dyn CertDelegate>,
        ephemeral: EphemeralKeyPair,
    ) -> Result<Self> {
        if !config_allowed(proposal.config, SUPPORTED_CONFIGS) {
            return Err(SecurityError::UnsupportedConfig(proposal.config));
        }
        if !config_allowed(proposal.curve, SUPPORTED_CURVES) {
            return Err(SecurityError::UnsupportedCurve(proposal.curve));
        }
        Ok(Self::new(HandshakeRole::Initiator, Some(proposal), delegate, ephemeral))
    }

    pub fn responder(delegate: Arc<dyn CertDelegate>, ephemeral: EphemeralKeyPair) -> Self {
        Self::new(HandshakeRole::Responder, None, delegate, ephemeral)
    }

    fn new(
        role: HandshakeRole,
        proposal: Option<CertProposal>,
        delegate: Arc<dyn CertDelegate>,
        ephemeral: EphemeralKeyPair,
    ) -> Self {
        Self {
            role,
            state: CertEngineState::Idle,
            proposal,
            delegate,
            ephemeral,
            request_hash: [0; 32],
            initiator_pub: [0; 32],
            peer_cert: None,
            transcript: [0; 32],
            keys: None,
        }
    }

    pub fn state(&self) -> CertEngineState {
        self.state
    }

    pub fn proposal(&self) -> Option<&CertProposal> {
        self.proposal.as_ref()
    }

    pub fn is_complete(&self) -> bool {
        self.state == CertEngineState::Complete
    }

    /// Type of the certificate the peer presented.
    pub fn peer_cert_type(&self) -> Option<CertType> {
        self.peer_cert.as_ref().map(|c| c.cert_type)
    }

    fn require(&self, state: CertEngineState) -> Result<CertProposal> {
        if self.state != state {
            return Err(SecurityError::IncorrectState);
        }
        self.proposal.ok_or(SecurityError::IncorrectState)
    }

    fn local_credentials(&self) -> Result<&NodeCredentials> {
        self.delegate
            .credentials()
            .ok_or(SecurityError::MissingCredentials("certificate"))
    }

    // ── Initiator ───────────────────────────────────────────────────────

    pub fn generate_begin_session_request(&mut self) -> Result<Bytes> {
        let p = self.require(CertEngineState::Idle)?;
        self.initiator_pub = self.ephemeral.public_key_bytes();
        let creds = self.local_credentials()?;

        let mut buf = BytesMut::with_capacity(6 + 32 + CERT_LEN + SIGNATURE_LEN);
        buf.put_u16_le(p.key_id.raw());
        buf.put_u8(p.encryption_type as u8);
        buf.put_u8(p.config);
        buf.put_u8(p.curve);
        buf.put_u8(if p.key_confirm { FLAG_KEY_CONFIRM } else { 0 });
        buf.put_slice(&self.initiator_pub);
        creds.certificate.encode(&mut buf);
        let sig = creds.identity.sign(&buf);
        buf.put_slice(&sig);

        let request = buf.freeze();
        self.request_hash = transcript_hash(&[&request]);
        self.state = CertEngineState::RequestSent;
        Ok(request)
    }

    pub fn parse_reconfigure(payload: &[u8]) -> Result<(u8, u8)> {
        let mut r = WireReader::new(payload);
        let config = r.u8()?;
        let curve = r.u8()?;
        r.finish()?;
        Ok((config, curve))
    }

    pub fn encode_reconfigure(config: u8, curve: u8) -> Bytes {
        Bytes::copy_from_slice(&[config, curve])
    }

    pub fn process_begin_session_response(&mut self, payload: &[u8], peer: NodeId) -> Result<()> {
        let p = self.require(CertEngineState::RequestSent)?;
        let body_len = 1 + 32 + CERT_LEN;
        let mut r = WireReader::new(payload);
        let flags = r.u8()?;
        let responder_pub: [u8; 32] = r.array()?;
        let cert = Certificate::decode(&mut r)?;
        let sig: [u8; 64] = r.array()?;
        let confirm: Option<[u8; 32]> = if p.key_confirm { Some(r.array()?) } else { None };
        r.finish()?;

        if (flags & FLAG_KEY_CONFIRM != 0) != p.key_confirm {
            return Err(SecurityError::InvalidField("key confirmation flag"));
        }
        let body = &payload[..body_len];
        self.delegate.validate_peer_cert(peer, &cert)?;
        let signed = [self.request_hash.as_slice(), body].concat();
        verify_signature(&cert.public_key, &signed, &sig)?;

        self.derive(&responder_pub, body)?;
        if let Some(received) = confirm {
            if !tags_match(&received, &self.tag(LABEL_RESPONDER_CONFIRM)?) {
                return Err(SecurityError::KeyConfirmationFailed);
            }
        }
        self.peer_cert = Some(cert);
        self.state = if p.key_confirm {
            CertEngineState::ResponseProcessed
        } else {
            CertEngineState::Complete
        };
        Ok(())
    }

    pub fn generate_initiator_key_confirm(&mut self) -> Result<Bytes> {
        self.require(CertEngineState::ResponseProcessed)?;
        let tag = self.tag(LABEL_INITIATOR_CONFIRM)?;
        self.state = CertEngineState::Complete;
        Ok(Bytes::copy_from_slice(&tag))
    }

    // ── Responder ───────────────────────────────────────────────────────

    pub fn process_begin_session_request(
        &mut self,
        payload: &[u8],
        peer: NodeId,
        allowed_configs: u8,
        allowed_curves: u8,
    ) -> Result<CertRequestOutcome> {
        if self.state != CertEngineState::Idle || self.role != HandshakeRole::Responder {
            return Err(SecurityError::IncorrectState);
        }
        let signed_len = 6 + 32 + CERT_LEN;
        let mut r = WireReader::new(payload);
        let key_id = KeyId::from_raw(r.u16()?);
        let encryption_type = EncryptionType::try_from(r.u8()?)?;
        let config = r.u8()?;
        let curve = r.u8()?;
        let flags = r.u8()?;
        let initiator_pub: [u8; 32] = r.array()?;
        let cert = Certificate::decode(&mut r)?;
        let sig: [u8; 64] = r.array()?;
        r.finish()?;

        if !key_id.is_session() {
            return Err(SecurityError::InvalidField("session key id"));
        }
        if !encryption_type.is_encrypted() {
            return Err(SecurityError::InvalidField("encryption type"));
        }

        let config_ok = config_allowed(config, allowed_configs & SUPPORTED_CONFIGS);
        let curve_ok = config_allowed(curve, allowed_curves & SUPPORTED_CURVES);
        if !config_ok || !curve_ok {
            let config = if config_ok {
                config
            } else {
                preferred_config(allowed_configs, SUPPORTED_CONFIGS).ok_or(SecurityError::NoCommonConfig)?
            };
            let curve = if curve_ok {
                curve
            } else {
                preferred_config(allowed_curves, SUPPORTED_CURVES).ok_or(SecurityError::UnsupportedCurve(curve))?
            };
            return Ok(CertRequestOutcome::Reconfigure { config, curve });
        }

        self.delegate.validate_peer_cert(peer, &cert)?;
        verify_signature(&cert.public_key, &payload[..signed_len], &sig)?;

        let proposal = CertProposal {
            key_id,
            encryption_type,
            config,
            curve,
            key_confirm: flags & FLAG_KEY_CONFIRM != 0,
        };
        self.proposal = Some(proposal);
        self.request_hash = transcript_hash(&[payload]);
        self.initiator_pub = initiator_pub;
        self.peer_cert = Some(cert);
        self.state = CertEngineState::RequestReceived;
        Ok(CertRequestOutcome::Proceed(proposal))
    }

    pub fn generate_begin_session_response(&mut self) -> Result<Bytes> {
        let p = self.require(CertEngineState::RequestReceived)?;
        let responder_pub = self.ephemeral.public_key_bytes();

        let mut buf = BytesMut::with_capacity(1 + 32 + CERT_LEN + SIGNATURE_LEN + 32);
        buf.put_u8(if p.key_confirm { FLAG_KEY_CONFIRM } else { 0 });
        buf.put_slice(&responder_pub);
        let creds = self.local_credentials()?;
        creds.certificate.encode(&mut buf);
        let signed = [self.request_hash.as_slice(), &buf].concat();
        let sig = creds.identity.sign(&signed);
        let body = buf.to_vec();
        buf.put_slice(&sig);

        self.derive(&responder_pub, &body)?;
        if p.key_confirm {
            buf.put_slice(&self.tag(LABEL_RESPONDER_CONFIRM)?);
            self.state = CertEngineState::ResponseSent;
        } else {
            self.state = CertEngineState::Complete;
        }
        Ok(buf.freeze())
    }

    pub fn process_initiator_key_confirm(&mut self, payload: &[u8]) -> Result<()> {
        self.require(CertEngineState::ResponseSent)?;
        let mut r = WireReader::new(payload);
        let received: [u8; 32] = r.array()?;
        r.finish()?;
        if !tags_match(&received, &self.tag(LABEL_INITIATOR_CONFIRM)?) {
            return Err(SecurityError::KeyConfirmationFailed);
        }
        self.state = CertEngineState::Complete;
        Ok(())
    }

    // ── Result ──────────────────────────────────────────────────────────

    pub fn session_key(&self) -> Result<SessionKeyMaterial> {
        match (&self.keys, self.state) {
            (Some(keys), CertEngineState::Complete | CertEngineState::ResponseSent | CertEngineState::ResponseProcessed) => {
                Ok(keys.session_key.clone())
            }
            _ => Err(SecurityError::IncorrectState),
        }
    }

    fn derive(&mut self, responder_pub: &[u8; 32], response_body: &[u8]) -> Result<()> {
        let p = self.proposal.ok_or(SecurityError::IncorrectState)?;
        let peer_pub = match self.role {
            HandshakeRole::Initiator => *responder_pub,
            HandshakeRole::Responder => self.initiator_pub,
        };
        let shared = self.ephemeral.diffie_hellman(&peer_pub)?;
        self.transcript = transcript_hash(&[&self.request_hash, response_body]);
        let key_id = p.key_id.raw().to_le_bytes();
        let parts: [&[u8]; 3] = [b"fabric cert", &[p.config], &key_id];
        self.keys = Some(derive_handshake_keys(&shared, &self.transcript, &parts.concat())?);
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
        Ok(confirm_tag(hash, &keys.confirm_key, label, &self.transcript))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Fixture {
        initiator: Arc<dyn CertDelegate>,
        responder: Arc<dyn CertDelegate>,
    }

    fn fixture() -> Fixture {
        let anchor = IdentityKeyPair::generate();
        let a = NodeCredentials::issue(&anchor, NodeId(1), CertType::Device);
        let b = NodeCredentials::issue(&anchor, NodeId(2), CertType::ServiceEndpoint);
        Fixture {
            initiator: Arc::new(TrustAnchorDelegate::new(a, anchor.public_key_bytes())),
            responder: Arc::new(TrustAnchorDelegate::new(b, anchor.public_key_bytes())),
        }
    }

    fn proposal(config: u8, key_confirm: bool) -> CertProposal {
        CertProposal {
            key_id: KeyId::session(0x44),
            encryption_type: EncryptionType::Aes256Gcm,
            config,
            curve: CURVE_X25519,
            key_confirm,
        }
    }

    #[test]
    fn handshake_with_key_confirm() {
        let f = fixture();
        let mut init =
            CertEngine::initiator(proposal(CONFIG_2, true), f.initiator.clone(), EphemeralKeyPair::generate()).unwrap();
        let mut resp = CertEngine::responder(f.responder.clone(), EphemeralKeyPair::generate());

        let req = init.generate_begin_session_request().unwrap();
        let outcome = resp
            .process_begin_session_request(&req, NodeId(1), SUPPORTED_CONFIGS, SUPPORTED_CURVES)
            .unwrap();
        assert!(matches!(outcome, CertRequestOutcome::Proceed(p) if p.key_confirm));
        let rsp = resp.generate_begin_session_response().unwrap();
        init.process_begin_session_response(&rsp, NodeId(2)).unwrap();
        let kc = init.generate_initiator_key_confirm().unwrap();
        resp.process_initiator_key_confirm(&kc).unwrap();

        assert!(init.is_complete() && resp.is_complete());
        assert_eq!(init.session_key().unwrap(), resp.session_key().unwrap());
        assert_eq!(init.peer_cert_type(), Some(CertType::ServiceEndpoint));
        assert_eq!(resp.peer_cert_type(), Some(CertType::Device));
    }

    #[test]
    fn handshake_without_key_confirm() {
        let f = fixture();
        let mut init =
            CertEngine::initiator(proposal(CONFIG_1, false), f.initiator.clone(), EphemeralKeyPair::generate()).unwrap();
        let mut resp = CertEngine::responder(f.responder.clone(), EphemeralKeyPair::generate());
        let req = init.generate_begin_session_request().unwrap();
        resp.process_begin_session_request(&req, NodeId(1), CONFIG_1, SUPPORTED_CURVES)
            .unwrap();
        let rsp = resp.generate_begin_session_response().unwrap();
        init.process_begin_session_response(&rsp, NodeId(2)).unwrap();
        assert!(init.is_complete() && resp.is_complete());
    }

    #[test]
    fn unacceptable_config_yields_reconfigure() {
        let f = fixture();
        let mut init =
            CertEngine::initiator(proposal(CONFIG_1, false), f.initiator.clone(), EphemeralKeyPair::generate()).unwrap();
        let mut resp = CertEngine::responder(f.responder.clone(), EphemeralKeyPair::generate());
        let req = init.generate_begin_session_request().unwrap();
        let outcome = resp
            .process_begin_session_request(&req, NodeId(1), CONFIG_2, SUPPORTED_CURVES)
            .unwrap();
        assert_eq!(
            outcome,
            CertRequestOutcome::Reconfigure {
                config: CONFIG_2,
                curve: CURVE_X25519
            }
        );
    }

    #[test]
    fn certificate_for_other_node_rejected() {
        let f = fixture();
        let mut init =
            CertEngine::initiator(proposal(CONFIG_2, false), f.initiator.clone(), EphemeralKeyPair::generate()).unwrap();
        let mut resp = CertEngine::responder(f.responder.clone(), EphemeralKeyPair::generate());
        let req = init.generate_begin_session_request().unwrap();
        let err = resp
            .process_begin_session_request(&req, NodeId(7), SUPPORTED_CONFIGS, SUPPORTED_CURVES)
            .unwrap_err();
        assert_eq!(err, SecurityError::InvalidCertificate("node id mismatch"));
    }

    #[test]
    fn untrusted_issuer_rejected() {
        let f = fixture();
        let rogue = IdentityKeyPair::generate();
        let creds = NodeCredentials::issue(&rogue, NodeId(1), CertType::Device);
        let rogue_delegate: Arc<dyn CertDelegate> =
            Arc::new(TrustAnchorDelegate::new(creds, rogue.public_key_bytes()));
        let mut init =
            CertEngine::initiator(proposal(CONFIG_2, false), rogue_delegate, EphemeralKeyPair::generate()).unwrap();
        let mut resp = CertEngine::responder(f.responder.clone(), EphemeralKeyPair::generate());
        let req = init.generate_begin_session_request().unwrap();
        assert!(matches!(
            resp.process_begin_session_request(&req, NodeId(1), SUPPORTED_CONFIGS, SUPPORTED_CURVES),
            Err(SecurityError::InvalidCertificate(_))
        ));
    }

    #[test]
    fn tampered_request_fails_signature() {
        let f = fixture();
        let mut init =
            CertEngine::initiator(proposal(CONFIG_2, false), f.initiator.clone(), EphemeralKeyPair::generate()).unwrap();
        let mut resp = CertEngine::responder(f.responder.clone(), EphemeralKeyPair::generate());
        let mut req = init.generate_begin_session_request().unwrap().to_vec();
        req[10] ^= 0x01;
        assert_eq!(
            resp.process_begin_session_request(&req, NodeId(1), SUPPORTED_CONFIGS, SUPPORTED_CURVES)
                .unwrap_err(),
            SecurityError::InvalidSignature
        );
    }
}
