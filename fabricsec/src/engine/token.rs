//! Token-authenticated key exchange engine.
//!
//! ```text
//!   Initiator (challenger)                       Responder (token)
//!     |--- IdentifyToken (params, pub) -------------->|
//!     |<-- IdentifyTokenResponse (token id, pub) -----|
//!     |--- AuthenticateToken | ReAuthenticateToken -->|   challenge
//!     |<-- matching response -------------------------|   proof
//! ```
//!
//! The identify round agrees an ephemeral key. Whether that key protects the
//! authentication phase, the communication phase, both or neither is chosen
//! by the initiator's control flags. A full authentication proves knowledge
//! of the token's identification key and leaves both sides with a cached
//! re-authentication key, which later sessions may use instead.

use std::collections::HashMap;
use std::sync::Arc;

use bytes::{BufMut, Bytes, BytesMut};
use fabricmsg::{EncryptionType, KeyId};
use parking_lot::Mutex;
use rand::RngCore;
use zeroize::Zeroizing;

use crate::crypto::hash::{confirm_tag, tags_match, transcript_hash, ConfirmHash};
use crate::crypto::keys::SessionKeyMaterial;
use crate::crypto::x25519::{derive_handshake_keys, DerivedKeys, EphemeralKeyPair, HandshakeRole};
use crate::engine::{config_allowed, preferred_config};
use crate::error::{Result, SecurityError};
use crate::message::WireReader;

/// SHA-256 proofs.
pub const CONFIG_1: u8 = 0x01;
/// BLAKE3 proofs.
pub const CONFIG_2: u8 = 0x02;
pub const SUPPORTED_CONFIGS: u8 = CONFIG_1 | CONFIG_2;

const CONTROL_ENCRYPT_AUTH: u8 = 0x01;
const CONTROL_ENCRYPT_COMM: u8 = 0x02;
const CONTROL_REAUTH_ALLOWED: u8 = 0x04;
const CONTROL_REAUTH_POSSIBLE: u8 = 0x08;

const CHALLENGE_LEN: usize = 32;

const LABEL_AUTH_PROOF: &[u8] = b"token auth proof";
const LABEL_REAUTH_PROOF: &[u8] = b"token reauth proof";
const LABEL_REAUTH_KEY: &[u8] = b"token reauth key";

/// Identification keys and cached re-authentication keys.
///
/// A challenger looks keys up by token id; a token looks its cached
/// re-authentication keys up by challenger id.
pub trait TokenDelegate: Send + Sync {
    /// Identification key of a token this node may challenge.
    fn identification_key(&self, token_id: u64) -> Option<Zeroizing<[u8; 32]>>;

    /// This node's own token id and identification key, when it acts as a token.
    fn local_token(&self) -> Option<(u64, Zeroizing<[u8; 32]>)>;

    fn reauth_key(&self, counterpart: u64) -> Option<Zeroizing<[u8; 32]>>;

    fn store_reauth_key(&self, counterpart: u64, key: Zeroizing<[u8; 32]>);
}

/// In-memory token key store.
#[derive(Default)]
pub struct MemoryTokenStore {
    local: Option<(u64, Zeroizing<[u8; 32]>)>,
    known: HashMap<u64, Zeroizing<[u8; 32]>>,
    reauth: Mutex<HashMap<u64, Zeroizing<[u8; 32]>>>,
}

impl MemoryTokenStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Act as token `token_id`.
    pub fn with_local_token(mut self, token_id: u64, key: [u8; 32]) -> Self {
        self.local = Some((token_id, Zeroizing::new(key)));
        self
    }

    /// Accept token `token_id` when challenging.
    pub fn with_known_token(mut self, token_id: u64, key: [u8; 32]) -> Self {
        self.known.insert(token_id, Zeroizing::new(key));
        self
    }

    pub fn forget_reauth_keys(&self) {
        self.reauth.lock().clear();
    }
}

impl TokenDelegate for MemoryTokenStore {
    fn identification_key(&self, token_id: u64) -> Option<Zeroizing<[u8; 32]>> {
        self.known.get(&token_id).cloned()
    }

    fn local_token(&self) -> Option<(u64, Zeroizing<[u8; 32]>)> {
        self.local.clone()
    }

    fn reauth_key(&self, counterpart: u64) -> Option<Zeroizing<[u8; 32]>> {
        self.reauth.lock().get(&counterpart).cloned()
    }

    fn store_reauth_key(&self, counterpart: u64, key: Zeroizing<[u8; 32]>) {
        self.reauth.lock().insert(counterpart, key);
    }
}

/// Parameters carried in IdentifyToken.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TokenProposal {
    pub key_id: KeyId,
    pub encryption_type: EncryptionType,
    pub config: u8,
    /// Protect AuthenticateToken and its response with the agreed key.
    pub encrypt_auth: bool,
    /// Keep the agreed key as the session key afterwards.
    pub encrypt_comm: bool,
    pub reauth_allowed: bool,
}

impl TokenProposal {
    pub fn uses_session_key(&self) -> bool {
        self.encrypt_auth || self.encrypt_comm
    }

    fn control(&self) -> u8 {
        let mut control = 0;
        if self.encrypt_auth {
            control |= CONTROL_ENCRYPT_AUTH;
        }
        if self.encrypt_comm {
            control |= CONTROL_ENCRYPT_COMM;
        }
        if self.reauth_allowed {
            control |= CONTROL_REAUTH_ALLOWED;
        }
        control
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenIdentifyOutcome {
    Proceed(TokenProposal),
    Reconfigure(u8),
}

/// The initiator's authentication message.
#[derive(Debug, Clone)]
pub struct AuthenticateStep {
    /// ReAuthenticateToken rather than AuthenticateToken.
    pub reauth: bool,
    pub payload: Bytes,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenEngineState {
    Idle,
    IdentifySent,
    IdentifyResponseReceived,
    AuthenticateSent,
    IdentifyReceived,
    IdentifyResponseSent,
    Complete,
}

pub struct TokenEngine {
    role: HandshakeRole,
    state: TokenEngineState,
    proposal: Option<TokenProposal>,
    delegate: Arc<dyn TokenDelegate>,
    ephemeral: EphemeralKeyPair,
    challenger_id: u64,
    token_id: u64,
    initiator_pub: [u8; 32],
    reauth_possible: bool,
    reauth: bool,
    identify: Bytes,
    transcript: [u8; 32],
    challenge: [u8; CHALLENGE_LEN],
    keys: Option<DerivedKeys>,
}

impl TokenEngine {
    pub fn initiator(
        proposal: TokenProposal,
        challenger_id: u64,
        delegate: Arc<dyn TokenDelegate>,
        ephemeral: EphemeralKeyPair,
    ) -> Result<Self> {
        if !config_allowed(proposal.config, SUPPORTED_CONFIGS) {
            return Err(SecurityError::UnsupportedConfig(proposal.config));
        }
        let mut engine = Self::new(HandshakeRole::Initiator, delegate, ephemeral);
        engine.proposal = Some(proposal);
        engine.challenger_id = challenger_id;
        Ok(engine)
    }

    pub fn responder(delegate: Arc<dyn TokenDelegate>, ephemeral: EphemeralKeyPair) -> Self {
        Self::new(HandshakeRole::Responder, delegate, ephemeral)
    }

    fn new(role: HandshakeRole, delegate: Arc<dyn TokenDelegate>, ephemeral: EphemeralKeyPair) -> Self {
        Self {
            role,
            state: TokenEngineState::Idle,
            proposal: None,
            delegate,
            ephemeral,
            challenger_id: 0,
            token_id: 0,
            initiator_pub: [0; 32],
            reauth_possible: false,
            reauth: false,
            identify: Bytes::new(),
            transcript: [0; 32],
            challenge: [0; CHALLENGE_LEN],
            keys: None,
        }
    }

    pub fn state(&self) -> TokenEngineState {
        self.state
    }

    pub fn proposal(&self) -> Option<&TokenProposal> {
        self.proposal.as_ref()
    }

    pub fn is_complete(&self) -> bool {
        self.state == TokenEngineState::Complete
    }

    /// Token id learned from (or sent in) IdentifyTokenResponse.
    pub fn token_id(&self) -> u64 {
        self.token_id
    }

    /// True once the last authentication used the cached re-authentication key.
    pub fn reauthenticated(&self) -> bool {
        self.reauth
    }

    fn require(&self, state: TokenEngineState) -> Result<TokenProposal> {
        if self.state != state {
            return Err(SecurityError::IncorrectState);
        }
        self.proposal.ok_or(SecurityError::IncorrectState)
    }

    // ── Initiator ───────────────────────────────────────────────────────

    pub fn generate_identify_token(&mut self) -> Result<Bytes> {
        let p = self.require(TokenEngineState::Idle)?;
        let mut buf = BytesMut::with_capacity(5 + 8 + 32);
        buf.put_u16_le(p.key_id.raw());
        buf.put_u8(p.encryption_type as u8);
        buf.put_u8(p.config);
        buf.put_u8(p.control());
        buf.put_u64_le(self.challenger_id);
        buf.put_slice(&self.ephemeral.public_key_bytes());
        self.identify = buf.freeze();
        self.state = TokenEngineState::IdentifySent;
        Ok(self.identify.clone())
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

    pub fn process_identify_token_response(&mut self, payload: &[u8]) -> Result<()> {
        let p = self.require(TokenEngineState::IdentifySent)?;
        let mut r = WireReader::new(payload);
        let control = r.u8()?;
        let token_id = r.u64()?;
        let token_pub: [u8; 32] = r.array()?;
        r.finish()?;

        if self.delegate.identification_key(token_id).is_none() {
            return Err(SecurityError::AuthenticationFailed);
        }
        self.token_id = token_id;
        self.reauth_possible = p.reauth_allowed && control & CONTROL_REAUTH_POSSIBLE != 0;
        self.derive(&token_pub, payload)?;
        self.state = TokenEngineState::IdentifyResponseReceived;
        Ok(())
    }

    /// Build AuthenticateToken, or ReAuthenticateToken when both sides hold a
    /// re-authentication key.
    pub fn generate_authenticate(&mut self) -> Result<AuthenticateStep> {
        self.require(TokenEngineState::IdentifyResponseReceived)?;
        self.reauth = self.reauth_possible && self.delegate.reauth_key(self.token_id).is_some();
        rand::thread_rng().fill_bytes(&mut self.challenge);
        self.state = TokenEngineState::AuthenticateSent;
        Ok(AuthenticateStep {
            reauth: self.reauth,
            payload: Bytes::copy_from_slice(&self.challenge),
        })
    }

    pub fn process_authenticate_response(&mut self, payload: &[u8], reauth: bool) -> Result<()> {
        self.require(TokenEngineState::AuthenticateSent)?;
        if reauth != self.reauth {
            return Err(SecurityError::InvalidField("authentication kind"));
        }
        let mut r = WireReader::new(payload);
        let received: [u8; 32] = r.array()?;
        r.finish()?;

        let proof_key = self.proof_key(self.token_id)?;
        if !tags_match(&received, &self.proof(&proof_key)?) {
            return Err(SecurityError::AuthenticationFailed);
        }
        if !reauth {
            self.delegate
                .store_reauth_key(self.token_id, self.next_reauth_key(&proof_key)?);
        }
        self.state = TokenEngineState::Complete;
        Ok(())
    }

    // ── Responder ───────────────────────────────────────────────────────

    pub fn process_identify_token(&mut self, payload: &[u8], allowed: u8) -> Result<TokenIdentifyOutcome> {
        if self.state != TokenEngineState::Idle || self.role != HandshakeRole::Responder {
            return Err(SecurityError::IncorrectState);
        }
        let mut r = WireReader::new(payload);
        let key_id = KeyId::from_raw(r.u16()?);
        let encryption_type = EncryptionType::try_from(r.u8()?)?;
        let config = r.u8()?;
        let control = r.u8()?;
        let challenger_id = r.u64()?;
        let initiator_pub: [u8; 32] = r.array()?;
        r.finish()?;

        let proposal = TokenProposal {
            key_id,
            encryption_type,
            config,
            encrypt_auth: control & CONTROL_ENCRYPT_AUTH != 0,
            encrypt_comm: control & CONTROL_ENCRYPT_COMM != 0,
            reauth_allowed: control & CONTROL_REAUTH_ALLOWED != 0,
        };
        if proposal.uses_session_key() {
            if !key_id.is_session() {
                return Err(SecurityError::InvalidField("session key id"));
            }
            if !encryption_type.is_encrypted() {
                return Err(SecurityError::InvalidField("encryption type"));
            }
        }
        if !config_allowed(config, allowed & SUPPORTED_CONFIGS) {
            return preferred_config(allowed, SUPPORTED_CONFIGS)
                .map(TokenIdentifyOutcome::Reconfigure)
                .ok_or(SecurityError::NoCommonConfig);
        }

        self.proposal = Some(proposal);
        self.challenger_id = challenger_id;
        self.identify = Bytes::copy_from_slice(payload);
        self.initiator_pub = initiator_pub;
        self.state = TokenEngineState::IdentifyReceived;
        Ok(TokenIdentifyOutcome::Proceed(proposal))
    }

    pub fn generate_identify_token_response(&mut self) -> Result<Bytes> {
        let p = self.require(TokenEngineState::IdentifyReceived)?;
        let (token_id, _) = self
            .delegate
            .local_token()
            .ok_or(SecurityError::MissingCredentials("token"))?;
        self.token_id = token_id;
        self.reauth_possible =
            p.reauth_allowed && self.delegate.reauth_key(self.challenger_id).is_some();

        let mut buf = BytesMut::with_capacity(1 + 8 + 32);
        buf.put_u8(if self.reauth_possible { CONTROL_REAUTH_POSSIBLE } else { 0 });
        buf.put_u64_le(token_id);
        buf.put_slice(&self.ephemeral.public_key_bytes());
        let response = buf.freeze();

        let initiator_pub = self.initiator_pub;
        self.derive(&initiator_pub, &response)?;
        self.state = TokenEngineState::IdentifyResponseSent;
        Ok(response)
    }

    /// Answer AuthenticateToken (`reauth == false`) or ReAuthenticateToken.
    pub fn process_authenticate(&mut self, payload: &[u8], reauth: bool) -> Result<Bytes> {
        self.require(TokenEngineState::IdentifyResponseSent)?;
        if reauth && !self.reauth_possible {
            return Err(SecurityError::InvalidField("re-authentication not offered"));
        }
        let mut r = WireReader::new(payload);
        self.challenge = r.array()?;
        r.finish()?;
        self.reauth = reauth;

        let proof_key = self.proof_key(self.challenger_id)?;
        let proof = self.proof(&proof_key)?;
        if !reauth {
            self.delegate
                .store_reauth_key(self.challenger_id, self.next_reauth_key(&proof_key)?);
        }
        self.state = TokenEngineState::Complete;
        Ok(Bytes::copy_from_slice(&proof))
    }

    // ── Result ──────────────────────────────────────────────────────────

    /// The agreed key; available once the identify round is done.
    pub fn session_key(&self) -> Result<SessionKeyMaterial> {
        self.keys
            .as_ref()
            .map(|k| k.session_key.clone())
            .ok_or(SecurityError::IncorrectState)
    }

    fn derive(&mut self, peer_pub: &[u8; 32], identify_response: &[u8]) -> Result<()> {
        let p = self.proposal.ok_or(SecurityError::IncorrectState)?;
        let shared = self.ephemeral.diffie_hellman(peer_pub)?;
        self.transcript = transcript_hash(&[&self.identify, identify_response]);
        let key_id = p.key_id.raw().to_le_bytes();
        let parts: [&[u8]; 3] = [b"fabric token", &[p.config], &key_id];
        self.keys = Some(derive_handshake_keys(&shared, &self.transcript, &parts.concat())?);
        Ok(())
    }

    /// Identification key for a full authentication, the cached key otherwise.
    fn proof_key(&self, counterpart: u64) -> Result<Zeroizing<[u8; 32]>> {
        let key = match (self.reauth, self.role) {
            (true, _) => self.delegate.reauth_key(counterpart),
            (false, HandshakeRole::Initiator) => self.delegate.identification_key(self.token_id),
            (false, HandshakeRole::Responder) => self.delegate.local_token().map(|(_, k)| k),
        };
        key.ok_or(SecurityError::MissingCredentials("token key"))
    }

    fn hash(&self) -> Result<ConfirmHash> {
        let p = self.proposal.ok_or(SecurityError::IncorrectState)?;
        Ok(if p.config == CONFIG_1 {
            ConfirmHash::Sha256
        } else {
            ConfirmHash::Blake3
        })
    }

    fn proof(&self, key: &[u8; 32]) -> Result<[u8; 32]> {
        let label = if self.reauth {
            LABEL_REAUTH_PROOF
        } else {
            LABEL_AUTH_PROOF
        };
        let bound = [self.transcript.as_slice(), &self.challenge].concat();
        Ok(confirm_tag(self.hash()?, key, label, &bound))
    }

    fn next_reauth_key(&self, identification_key: &[u8; 32]) -> Result<Zeroizing<[u8; 32]>> {
        let ids = [self.challenger_id.to_le_bytes(), self.token_id.to_le_bytes()].concat();
        Ok(Zeroizing::new(confirm_tag(
            self.hash()?,
            identification_key,
            LABEL_REAUTH_KEY,
            &ids,
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TOKEN_ID: u64 = 0x7700_0001;
    const CHALLENGER_ID: u64 = 0x10;
    const ID_KEY: [u8; 32] = [0x3C; 32];

    fn stores() -> (Arc<MemoryTokenStore>, Arc<MemoryTokenStore>) {
        (
            Arc::new(MemoryTokenStore::new().with_known_token(TOKEN_ID, ID_KEY)),
            Arc::new(MemoryTokenStore::new().with_local_token(TOKEN_ID, ID_KEY)),
        )
    }

    fn proposal(reauth_allowed: bool) -> TokenProposal {
        TokenProposal {
            key_id: KeyId::session(0x0300),
            encryption_type: EncryptionType::ChaCha20Poly1305,
            config: CONFIG_2,
            encrypt_auth: true,
            encrypt_comm: true,
            reauth_allowed,
        }
    }

    fn run(
        challenger: Arc<MemoryTokenStore>,
        token: Arc<MemoryTokenStore>,
        reauth_allowed: bool,
    ) -> Result<(TokenEngine, TokenEngine)> {
        let mut init = TokenEngine::initiator(proposal(reauth_allowed), CHALLENGER_ID, challenger, EphemeralKeyPair::generate())?;
        let mut resp = TokenEngine::responder(token, EphemeralKeyPair::generate());

        let identify = init.generate_identify_token()?;
        assert!(matches!(
            resp.process_identify_token(&identify, SUPPORTED_CONFIGS)?,
            TokenIdentifyOutcome::Proceed(_)
        ));
        let identify_rsp = resp.generate_identify_token_response()?;
        init.process_identify_token_response(&identify_rsp)?;
        assert_eq!(init.session_key()?, resp.session_key()?);

        let step = init.generate_authenticate()?;
        let proof = resp.process_authenticate(&step.payload, step.reauth)?;
        init.process_authenticate_response(&proof, step.reauth)?;
        Ok((init, resp))
    }

    #[test]
    fn full_authentication() {
        let (challenger, token) = stores();
        let (init, resp) = run(challenger, token, false).unwrap();
        assert!(init.is_complete() && resp.is_complete());
        assert!(!init.reauthenticated());
        assert_eq!(init.token_id(), TOKEN_ID);
    }

    #[test]
    fn second_session_reauthenticates() {
        let (challenger, token) = stores();
        run(challenger.clone(), token.clone(), true).unwrap();
        let (init, _) = run(challenger, token, true).unwrap();
        assert!(init.reauthenticated());
    }

    #[test]
    fn reauth_not_used_when_disallowed() {
        let (challenger, token) = stores();
        run(challenger.clone(), token.clone(), true).unwrap();
        let (init, _) = run(challenger, token, false).unwrap();
        assert!(!init.reauthenticated());
    }

    #[test]
    fn lost_cache_falls_back_to_full_authentication() {
        let (challenger, token) = stores();
        run(challenger.clone(), token.clone(), true).unwrap();
        token.forget_reauth_keys();
        let (init, _) = run(challenger, token, true).unwrap();
        assert!(!init.reauthenticated());
    }

    #[test]
    fn wrong_identification_key_rejected() {
        let challenger = Arc::new(MemoryTokenStore::new().with_known_token(TOKEN_ID, [0x01; 32]));
        let token = Arc::new(MemoryTokenStore::new().with_local_token(TOKEN_ID, ID_KEY));
        assert!(matches!(
            run(challenger, token, false),
            Err(SecurityError::AuthenticationFailed)
        ));
    }

    #[test]
    fn unknown_token_rejected_at_identify() {
        let challenger = Arc::new(MemoryTokenStore::new());
        let token = Arc::new(MemoryTokenStore::new().with_local_token(TOKEN_ID, ID_KEY));
        assert!(matches!(
            run(challenger, token, false),
            Err(SecurityError::AuthenticationFailed)
        ));
    }

    #[test]
    fn unsupported_config_reconfigures() {
        let (challenger, token) = stores();
        let mut init =
            TokenEngine::initiator(proposal(false), CHALLENGER_ID, challenger, EphemeralKeyPair::generate()).unwrap();
        let mut resp = TokenEngine::responder(token, EphemeralKeyPair::generate());
        let identify = init.generate_identify_token().unwrap();
        assert_eq!(
            resp.process_identify_token(&identify, CONFIG_1).unwrap(),
            TokenIdentifyOutcome::Reconfigure(CONFIG_1)
        );
    }
}
