//! Per-namespace key ring and sealed, signed messaging.
//!
//! Keys are Ed25519 signing pairs. Sealing converts the recipient's public
//! key to X25519, runs an ephemeral Diffie-Hellman, derives a key with
//! HKDF-SHA256 and encrypts with XChaCha20-Poly1305. A sealed box is
//! `ephemeral_pk (32) | nonce (24) | ciphertext`.
//!
//! [`Keyring::seal`] is encrypt, sign, encrypt: only the holder of the
//! namespace key can read the plaintext or learn who signed it.
use std::collections::HashMap;

use chacha20poly1305::aead::rand_core::{OsRng, RngCore};
use chacha20poly1305::{
    aead::{Aead, KeyInit},
    XChaCha20Poly1305, XNonce,
};
use curve25519_dalek::edwards::CompressedEdwardsY;
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use hkdf::Hkdf;
use sha2::{Digest, Sha256, Sha512};
use x25519_dalek::{PublicKey as X25519PublicKey, StaticSecret as X25519Secret};

use crate::error::LaticaError;
use crate::types::{sha256, to_base64};

const HKDF_INFO: &[u8] = b"latica-sealed-box-xchacha20poly1305-v1";
const EPK_BYTES: usize = 32;
const NONCE_BYTES: usize = 24;
const SIG_BYTES: usize = 64;

/// An Ed25519 signing pair.
#[derive(Clone)]
pub struct KeyPair {
    signing: SigningKey,
}

impl std::fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyPair")
            .field("public_key", &hex::encode(self.public_key()))
            .finish_non_exhaustive()
    }
}

impl KeyPair {
    pub fn generate() -> Self {
        let mut seed = [0u8; 32];
        OsRng.fill_bytes(&mut seed);
        Self::from_secret(seed)
    }

    /// Deterministic pair derived from an arbitrary-length seed.
    pub fn from_seed(seed: &[u8]) -> Self {
        Self::from_secret(sha256(seed))
    }

    pub fn from_secret(secret: [u8; 32]) -> Self {
        Self {
            signing: SigningKey::from_bytes(&secret),
        }
    }

    pub fn public_key(&self) -> [u8; 32] {
        self.signing.verifying_key().to_bytes()
    }

    pub fn secret(&self) -> [u8; 32] {
        self.signing.to_bytes()
    }

    pub fn sign(&self, message: &[u8]) -> [u8; SIG_BYTES] {
        self.signing.sign(message).to_bytes()
    }
}

/// `createKeyPair(seed?)`: deterministic with a seed, random without.
pub fn create_key_pair(seed: Option<&[u8]>) -> KeyPair {
    match seed {
        Some(seed) => KeyPair::from_seed(seed),
        None => KeyPair::generate(),
    }
}

/// Verify an Ed25519 signature. Malformed keys or signatures verify false.
pub fn verify(public_key: &[u8], message: &[u8], sig: &[u8]) -> bool {
    let Ok(pk) = <[u8; 32]>::try_from(public_key) else {
        return false;
    };
    let Ok(sig) = <[u8; SIG_BYTES]>::try_from(sig) else {
        return false;
    };
    let Ok(key) = VerifyingKey::from_bytes(&pk) else {
        return false;
    };
    key.verify(message, &Signature::from_bytes(&sig)).is_ok()
}

fn to_x25519_public(ed25519_pk: &[u8; 32]) -> Result<[u8; 32], LaticaError> {
    let edwards = CompressedEdwardsY(*ed25519_pk)
        .decompress()
        .ok_or_else(|| LaticaError::Crypto("invalid Ed25519 public key".into()))?;
    Ok(edwards.to_montgomery().to_bytes())
}

fn to_x25519_secret(ed25519_seed: &[u8; 32]) -> [u8; 32] {
    let hash = Sha512::digest(ed25519_seed);
    let mut secret = [0u8; 32];
    secret.copy_from_slice(&hash[..32]);
    secret[0] &= 248;
    secret[31] &= 127;
    secret[31] |= 64;
    secret
}

fn cipher_for(shared_secret: &[u8; 32]) -> Result<XChaCha20Poly1305, LaticaError> {
    let hkdf = Hkdf::<Sha256>::new(None, shared_secret);
    let mut key = [0u8; 32];
    hkdf.expand(HKDF_INFO, &mut key)
        .map_err(|e| LaticaError::Crypto(format!("hkdf: {e}")))?;
    Ok(XChaCha20Poly1305::new(&key.into()))
}

/// Anonymous sealed box to `recipient` (an Ed25519 public key).
pub fn seal_box(plaintext: &[u8], recipient: &[u8; 32]) -> Result<Vec<u8>, LaticaError> {
    let recipient = X25519PublicKey::from(to_x25519_public(recipient)?);

    let ephemeral = X25519Secret::random_from_rng(OsRng);
    let ephemeral_pk = X25519PublicKey::from(&ephemeral);
    let cipher = cipher_for(ephemeral.diffie_hellman(&recipient).as_bytes())?;

    let mut nonce = [0u8; NONCE_BYTES];
    OsRng.fill_bytes(&mut nonce);

    let ciphertext = cipher
        .encrypt(&XNonce::from(nonce), plaintext)
        .map_err(|e| LaticaError::Crypto(format!("encryption failed: {e}")))?;

    let mut out = Vec::with_capacity(EPK_BYTES + NONCE_BYTES + ciphertext.len());
    out.extend_from_slice(ephemeral_pk.as_bytes());
    out.extend_from_slice(&nonce);
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

/// Open a box produced by [`seal_box`] for `pair`.
pub fn open_box(sealed: &[u8], pair: &KeyPair) -> Result<Vec<u8>, LaticaError> {
    if sealed.len() < EPK_BYTES + NONCE_BYTES {
        return Err(LaticaError::Malformed);
    }
    let (epk, rest) = sealed.split_at(EPK_BYTES);
    let (nonce, ciphertext) = rest.split_at(NONCE_BYTES);

    let mut epk_bytes = [0u8; EPK_BYTES];
    epk_bytes.copy_from_slice(epk);
    let mut nonce_bytes = [0u8; NONCE_BYTES];
    nonce_bytes.copy_from_slice(nonce);

    let secret = X25519Secret::from(to_x25519_secret(&pair.secret()));
    let cipher = cipher_for(secret.diffie_hellman(&X25519PublicKey::from(epk_bytes)).as_bytes())?;

    cipher
        .decrypt(&XNonce::from(nonce_bytes), ciphertext)
        .map_err(|_| LaticaError::Crypto("decryption failed: authentication error".into()))
}

/// Key pairs indexed by base64 public key, plus this peer's own signing pair.
pub struct Keyring {
    own: KeyPair,
    keys: HashMap<String, KeyPair>,
}

impl Keyring {
    pub fn new(own: KeyPair) -> Self {
        Self {
            own,
            keys: HashMap::new(),
        }
    }

    /// This peer's signing pair.
    pub fn own(&self) -> &KeyPair {
        &self.own
    }

    /// Register a pair. Returns its base64 public key.
    pub fn add(&mut self, pair: KeyPair) -> String {
        let id = to_base64(&pair.public_key());
        self.keys.insert(id.clone(), pair);
        id
    }

    /// Derive and register the namespace pair for `shared_key`.
    /// The returned public key doubles as the subcluster id.
    pub fn add_shared(&mut self, shared_key: &[u8]) -> [u8; 32] {
        let pair = create_key_pair(Some(shared_key));
        let public_key = pair.public_key();
        self.add(pair);
        public_key
    }

    pub fn remove(&mut self, public_key: &[u8]) -> bool {
        self.keys.remove(&to_base64(public_key)).is_some()
    }

    pub fn has(&self, public_key: &[u8]) -> bool {
        self.keys.contains_key(&to_base64(public_key))
    }

    pub fn get(&self, public_key: &[u8]) -> Option<&KeyPair> {
        self.keys.get(&to_base64(public_key))
    }

    /// Public keys of every registered namespace.
    pub fn public_keys(&self) -> Vec<[u8; 32]> {
        self.keys.values().map(KeyPair::public_key).collect()
    }

    fn pair(&self, public_key: &[u8]) -> Result<&KeyPair, LaticaError> {
        self.get(public_key)
            .ok_or_else(|| LaticaError::NoKeys(to_base64(public_key)))
    }

    /// Encrypt, sign, encrypt for the namespace identified by `public_key`.
    pub fn seal(&self, message: &[u8], public_key: &[u8; 32]) -> Result<Vec<u8>, LaticaError> {
        let pair = self.pair(public_key)?;
        let inner = seal_box(message, public_key)?;
        let sig = pair.sign(&inner);

        let mut signed = Vec::with_capacity(SIG_BYTES + inner.len());
        signed.extend_from_slice(&sig);
        signed.extend_from_slice(&inner);
        seal_box(&signed, public_key)
    }

    /// Reverse [`Keyring::seal`].
    pub fn open(&self, sealed: &[u8], public_key: &[u8; 32]) -> Result<Vec<u8>, LaticaError> {
        let pair = self.pair(public_key)?;
        let signed = open_box(sealed, pair)?;
        if signed.len() <= SIG_BYTES {
            return Err(LaticaError::Malformed);
        }

        let (sig, inner) = signed.split_at(SIG_BYTES);
        if !verify(public_key, inner, sig) {
            return Err(LaticaError::NotVerified);
        }
        open_box(inner, pair)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ring_with(secret: &[u8]) -> (Keyring, [u8; 32]) {
        let mut ring = Keyring::new(KeyPair::generate());
        let pk = ring.add_shared(secret);
        (ring, pk)
    }

    #[test]
    fn seeded_pairs_are_deterministic() {
        let a = create_key_pair(Some(b"secret"));
        let b = create_key_pair(Some(b"secret"));
        let c = create_key_pair(None);
        assert_eq!(a.public_key(), b.public_key());
        assert_ne!(a.public_key(), c.public_key());
    }

    #[test]
    fn sign_and_verify() {
        let pair = KeyPair::generate();
        let sig = pair.sign(b"msg");
        assert!(verify(&pair.public_key(), b"msg", &sig));
        assert!(!verify(&pair.public_key(), b"other", &sig));
        assert!(!verify(&[0u8; 3], b"msg", &sig));
    }

    #[test]
    fn seal_open_roundtrip() {
        let (ring, pk) = ring_with(b"shared");
        let sealed = ring.seal(b"hello namespace", &pk).unwrap();
        assert_eq!(ring.open(&sealed, &pk).unwrap(), b"hello namespace");
    }

    #[test]
    fn another_member_can_open() {
        let (alice, pk) = ring_with(b"shared");
        let (bob, pk2) = ring_with(b"shared");
        assert_eq!(pk, pk2);
        let sealed = alice.seal(b"hi bob", &pk).unwrap();
        assert_eq!(bob.open(&sealed, &pk).unwrap(), b"hi bob");
    }

    #[test]
    fn open_without_key_is_no_keys() {
        let (alice, pk) = ring_with(b"shared");
        let (eve, _) = ring_with(b"other");
        let sealed = alice.seal(b"x", &pk).unwrap();
        assert!(matches!(eve.open(&sealed, &pk), Err(LaticaError::NoKeys(_))));
        assert!(matches!(eve.seal(b"x", &pk), Err(LaticaError::NoKeys(_))));
    }

    #[test]
    fn short_payload_is_malformed() {
        let (ring, pk) = ring_with(b"shared");
        let sealed = seal_box(&[1u8; SIG_BYTES], &pk).unwrap();
        assert!(matches!(ring.open(&sealed, &pk), Err(LaticaError::Malformed)));
    }

    #[test]
    fn bad_signature_is_not_verified() {
        let (ring, pk) = ring_with(b"shared");
        let inner = seal_box(b"payload", &pk).unwrap();
        let mut forged = vec![0u8; SIG_BYTES];
        forged.extend_from_slice(&inner);
        let sealed = seal_box(&forged, &pk).unwrap();
        assert!(matches!(ring.open(&sealed, &pk), Err(LaticaError::NotVerified)));
    }

    #[test]
    fn keyring_registry() {
        let mut ring = Keyring::new(KeyPair::generate());
        let pair = KeyPair::from_seed(b"k");
        let pk = pair.public_key();
        assert!(!ring.has(&pk));
        let id = ring.add(pair);
        assert_eq!(id, to_base64(&pk));
        assert!(ring.has(&pk));
        assert_eq!(ring.public_keys(), vec![pk]);
        assert!(ring.remove(&pk));
        assert!(!ring.has(&pk));
    }
}
