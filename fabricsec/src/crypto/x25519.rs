// X25519 ephemeral key agreement and HKDF key derivation for handshakes.

use hkdf::Hkdf;
use rand::rngs::OsRng;
use sha2::Sha256;
use x25519_dalek::{PublicKey, StaticSecret};
use zeroize::Zeroizing;

use crate::crypto::keys::{SessionKeyMaterial, SESSION_KEY_LEN};
use crate::error::{Result, SecurityError};

/// Fixed ephemeral secrets used when test mode forces known keys.
const TEST_INITIATOR_SECRET: [u8; 32] = [0x5A; 32];
const TEST_RESPONDER_SECRET: [u8; 32] = [0xA5; 32];

/// Which side of a handshake an ephemeral key belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeRole {
    Initiator,
    Responder,
}

/// An X25519 ephemeral keypair for one handshake.
pub struct EphemeralKeyPair {
    secret: StaticSecret,
    public: PublicKey,
}

impl EphemeralKeyPair {
    /// Generate a new random ephemeral keypair.
    pub fn generate() -> Self {
        let secret = StaticSecret::random_from_rng(OsRng);
        let public = PublicKey::from(&secret);
        Self { secret, public }
    }

    /// Create from existing secret bytes.
    pub fn from_secret_bytes(bytes: [u8; 32]) -> Self {
        let secret = StaticSecret::from(bytes);
        let public = PublicKey::from(&secret);
        Self { secret, public }
    }

    /// A random keypair, or the fixed per-role keypair in test mode.
    pub fn for_handshake(role: HandshakeRole, force_test_key: bool) -> Self {
        match (force_test_key, role) {
            (false, _) => Self::generate(),
            (true, HandshakeRole::Initiator) => Self::from_secret_bytes(TEST_INITIATOR_SECRET),
            (true, HandshakeRole::Responder) => Self::from_secret_bytes(TEST_RESPONDER_SECRET),
        }
    }

    /// The 32-byte public key.
    pub fn public_key_bytes(&self) -> [u8; 32] {
        *self.public.as_bytes()
    }

    /// Diffie-Hellman with a peer's public key.
    ///
    /// Rejects low-order peer keys that would yield an all-zero secret.
    pub fn diffie_hellman(&self, peer_public: &[u8; 32]) -> Result<Zeroizing<[u8; 32]>> {
        let shared = self.secret.diffie_hellman(&PublicKey::from(*peer_public));
        if !shared.was_contributory() {
            return Err(SecurityError::Crypto("non-contributory peer key".into()));
        }
        Ok(Zeroizing::new(*shared.as_bytes()))
    }
}

/// Keys derived from one handshake's shared secret.
pub struct DerivedKeys {
    pub session_key: SessionKeyMaterial,
    pub confirm_key: Zeroizing<[u8; 32]>,
}

/// Derive the session key and key-confirmation key from a shared secret.
///
/// ```text
/// prk          = HKDF-Extract(salt, shared_secret)
/// session_key  = HKDF-Expand(prk, info || "session key", 32)
/// confirm_key  = HKDF-Expand(prk, info || "confirm key", 32)
/// ```
pub fn derive_handshake_keys(shared_secret: &[u8; 32], salt: &[u8], info: &[u8]) -> Result<DerivedKeys> {
    let hk = Hkdf::<Sha256>::new(Some(salt), shared_secret);

    let mut session_key = [0u8; SESSION_KEY_LEN];
    expand(&hk, info, b"session key", &mut session_key)?;
    let session_key = SessionKeyMaterial::new(session_key);

    let mut confirm_key = Zeroizing::new([0u8; 32]);
    expand(&hk, info, b"confirm key", &mut confirm_key[..])?;

    Ok(DerivedKeys {
        session_key,
        confirm_key,
    })
}

/// HKDF-SHA256 expansion of `shared_secret` into `out`, for one-off keys.
pub fn derive_bytes(shared_secret: &[u8; 32], salt: &[u8], info: &[u8], out: &mut [u8]) -> Result<()> {
    let hk = Hkdf::<Sha256>::new(Some(salt), shared_secret);
    hk.expand(info, out)
        .map_err(|e| SecurityError::Crypto(format!("HKDF expand error: {e}")))
}

fn expand(hk: &Hkdf<Sha256>, info: &[u8], label: &[u8], out: &mut [u8]) -> Result<()> {
    let mut full = Vec::with_capacity(info.len() + label.len());
    full.extend_from_slice(info);
    full.extend_from_slice(label);
    hk.expand(&full, out)
        .map_err(|e| SecurityError::Crypto(format!("HKDF expand error: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn both_sides_agree() {
        let a = EphemeralKeyPair::generate();
        let b = EphemeralKeyPair::generate();
        let s1 = a.diffie_hellman(&b.public_key_bytes()).unwrap();
        let s2 = b.diffie_hellman(&a.public_key_bytes()).unwrap();
        assert_eq!(*s1, *s2);
    }

    #[test]
    fn low_order_point_rejected() {
        let a = EphemeralKeyPair::generate();
        assert!(a.diffie_hellman(&[0u8; 32]).is_err());
    }

    #[test]
    fn test_mode_keys_are_fixed() {
        let a = EphemeralKeyPair::for_handshake(HandshakeRole::Initiator, true);
        let b = EphemeralKeyPair::for_handshake(HandshakeRole::Initiator, true);
        let c = EphemeralKeyPair::for_handshake(HandshakeRole::Responder, true);
        assert_eq!(a.public_key_bytes(), b.public_key_bytes());
        assert_ne!(a.public_key_bytes(), c.public_key_bytes());
    }

    #[test]
    fn derivation_depends_on_info() {
        let secret = [9u8; 32];
        let k1 = derive_handshake_keys(&secret, b"salt", b"config 1").unwrap();
        let k2 = derive_handshake_keys(&secret, b"salt", b"config 2").unwrap();
        assert_ne!(k1.session_key, k2.session_key);
        assert_ne!(k1.session_key.as_bytes(), &*k1.confirm_key);
    }
}
