//! Cryptographic primitives for Kith.
//!
//! Provides four capabilities the dialer builds on:
//!   1. Ed25519 signature keys: long-term identity, challenge signing
//!   2. x25519 hello keys: one fresh pair per physical connection
//!   3. Short-message sealing: a key half encrypted to a hello public key
//!   4. Directional session keys: one ChaCha20-Poly1305 key per direction
//!
//! All secret material is zeroized on drop. There is no unsafe code in this
//! module.

use chacha20poly1305::aead::{Aead, KeyInit, Payload};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use rand::RngCore;
use thiserror::Error;
use x25519_dalek::{PublicKey, StaticSecret};
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

/// BLAKE3 derive-key context for sealing key halves.
const SEAL_CONTEXT: &str = "kith 2024 short-message seal v1";

/// BLAKE3 derive-key context for directional session keys.
const SESSION_CONTEXT: &str = "kith 2024 directional session key v1";

/// Domain-separation label bound into every sealed key half.
pub const KEY_HALVES_LABEL: &[u8] = b"key-halves";

/// Length of a random key half.
pub const HALF_LEN: usize = 32;

/// Length of a challenge nonce.
pub const CHALLENGE_LEN: usize = 32;

/// Length of an Ed25519 signature.
pub const SIGNATURE_LEN: usize = 64;

/// ChaCha20-Poly1305 authentication tag length.
pub const TAG_LEN: usize = 16;

/// Sealed key half on the wire: ephemeral public key, ciphertext, tag.
pub const SEALED_HALF_LEN: usize = 32 + HALF_LEN + TAG_LEN;

// ── BLAKE3 ────────────────────────────────────────────────────────────────────

/// Hash a byte slice, returning a 32-byte BLAKE3 digest.
pub fn hash(data: &[u8]) -> [u8; 32] {
    *blake3::hash(data).as_bytes()
}

// ── Signature keys ────────────────────────────────────────────────────────────

/// A node's long-term Ed25519 keypair.
///
/// Used only to sign authentication challenges. The private half never
/// leaves this struct except through [`SigningKeyPair::seed`] for storage.
#[derive(Clone)]
pub struct SigningKeyPair {
    secret: SigningKey,
}

impl SigningKeyPair {
    /// Generate a new random keypair.
    pub fn generate() -> Self {
        Self {
            secret: SigningKey::generate(&mut OsRng),
        }
    }

    /// Rebuild a keypair from its stored 32-byte seed.
    pub fn from_seed(seed: &[u8; 32]) -> Self {
        Self {
            secret: SigningKey::from_bytes(seed),
        }
    }

    /// Serialize the seed for persistent storage.
    pub fn seed(&self) -> Zeroizing<[u8; 32]> {
        Zeroizing::new(self.secret.to_bytes())
    }

    pub fn public(&self) -> SignaturePublicKey {
        SignaturePublicKey(self.secret.verifying_key())
    }

    pub fn sign(&self, message: &[u8]) -> [u8; SIGNATURE_LEN] {
        self.secret.sign(message).to_bytes()
    }
}

impl std::fmt::Debug for SigningKeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SigningKeyPair")
            .field("public", &self.public())
            .finish_non_exhaustive()
    }
}

/// The public half of a [`SigningKeyPair`].
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct SignaturePublicKey(VerifyingKey);

impl SignaturePublicKey {
    pub fn from_bytes(bytes: &[u8; 32]) -> Result<Self, CryptoError> {
        VerifyingKey::from_bytes(bytes)
            .map(Self)
            .map_err(|_| CryptoError::BadPublicKey)
    }

    /// Canonical 32-byte encoding, the input to identity derivation.
    pub fn to_bytes(&self) -> [u8; 32] {
        self.0.to_bytes()
    }

    /// Verify `signature` over `message`. Fails closed on any mismatch.
    pub fn verify(&self, message: &[u8], signature: &[u8; SIGNATURE_LEN]) -> Result<(), CryptoError> {
        let signature = Signature::from_bytes(signature);
        self.0
            .verify(message, &signature)
            .map_err(|_| CryptoError::BadSignature)
    }
}

impl std::fmt::Debug for SignaturePublicKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SignaturePublicKey({})", hex::encode(&self.to_bytes()[..8]))
    }
}

// ── Hello keys ────────────────────────────────────────────────────────────────

/// A per-connection x25519 keypair used only to receive the peer's key half.
///
/// A fresh pair is generated for every handshake attempt so two sessions
/// with the same peer cannot be correlated by their hello keys.
#[derive(ZeroizeOnDrop)]
pub struct HelloKeyPair {
    secret: StaticSecret,
    #[zeroize(skip)]
    public: HelloPublicKey,
}

impl HelloKeyPair {
    pub fn generate() -> Self {
        let secret = StaticSecret::random_from_rng(OsRng);
        let public = HelloPublicKey(*PublicKey::from(&secret).as_bytes());
        Self { secret, public }
    }

    pub fn public(&self) -> HelloPublicKey {
        self.public
    }
}

/// Public half of a [`HelloKeyPair`], exchanged in the clear.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HelloPublicKey(pub [u8; 32]);

impl HelloPublicKey {
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

// ── Short-message sealing ─────────────────────────────────────────────────────

/// Encrypt a short message so only the holder of `recipient`'s secret can
/// read it.
///
/// Sealed-box construction: a throwaway x25519 key agrees a secret with the
/// recipient, BLAKE3 turns it into a one-time ChaCha20-Poly1305 key, and
/// `label` is bound in as associated data.
///
///   out = ephemeral_public (32) || ciphertext || tag (16)
pub fn seal_short(recipient: &HelloPublicKey, msg: &[u8], label: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let ephemeral = StaticSecret::random_from_rng(OsRng);
    let ephemeral_public = PublicKey::from(&ephemeral);
    let shared = ephemeral.diffie_hellman(&PublicKey::from(recipient.0));
    if !shared.was_contributory() {
        return Err(CryptoError::NonContributory);
    }

    let key = seal_key(shared.as_bytes(), ephemeral_public.as_bytes(), recipient.as_bytes());
    let cipher = ChaCha20Poly1305::new(Key::from_slice(&key[..]));
    let ciphertext = cipher
        .encrypt(Nonce::from_slice(&[0u8; 12]), Payload { msg, aad: label })
        .map_err(|_| CryptoError::Seal)?;

    let mut out = Vec::with_capacity(32 + ciphertext.len());
    out.extend_from_slice(ephemeral_public.as_bytes());
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

/// Open a message produced by [`seal_short`] for `recipient`.
pub fn open_short(recipient: &HelloKeyPair, sealed: &[u8], label: &[u8]) -> Result<Zeroizing<Vec<u8>>, CryptoError> {
    if sealed.len() < 32 + TAG_LEN {
        return Err(CryptoError::TooShort);
    }
    let mut ephemeral_bytes = [0u8; 32];
    ephemeral_bytes.copy_from_slice(&sealed[..32]);
    let ephemeral_public = PublicKey::from(ephemeral_bytes);

    let shared = recipient.secret.diffie_hellman(&ephemeral_public);
    if !shared.was_contributory() {
        return Err(CryptoError::NonContributory);
    }

    let key = seal_key(shared.as_bytes(), &ephemeral_bytes, recipient.public.as_bytes());
    let cipher = ChaCha20Poly1305::new(Key::from_slice(&key[..]));
    cipher
        .decrypt(Nonce::from_slice(&[0u8; 12]), Payload { msg: &sealed[32..], aad: label })
        .map(Zeroizing::new)
        .map_err(|_| CryptoError::Open)
}

fn seal_key(shared: &[u8; 32], ephemeral: &[u8; 32], recipient: &[u8; 32]) -> Zeroizing<[u8; 32]> {
    let mut h = blake3::Hasher::new_derive_key(SEAL_CONTEXT);
    h.update(shared);
    h.update(ephemeral);
    h.update(recipient);
    Zeroizing::new(*h.finalize().as_bytes())
}

// ── Session keys ──────────────────────────────────────────────────────────────

/// One side's random contribution to the session keys.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct KeyHalf([u8; HALF_LEN]);

impl KeyHalf {
    pub fn generate() -> Self {
        let mut half = [0u8; HALF_LEN];
        OsRng.fill_bytes(&mut half);
        Self(half)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CryptoError> {
        let half: [u8; HALF_LEN] = bytes.try_into().map_err(|_| CryptoError::TooShort)?;
        Ok(Self(half))
    }

    pub fn as_bytes(&self) -> &[u8; HALF_LEN] {
        &self.0
    }
}

/// Symmetric keys for one physical connection, from the local point of view.
///
/// `outbound` seals what we send, `inbound` opens what we receive. The two
/// directions never share key material.
pub struct SessionKeys {
    pub outbound: Zeroizing<[u8; 32]>,
    pub inbound: Zeroizing<[u8; 32]>,
}

impl SessionKeys {
    pub fn derive(
        local_hello: &HelloPublicKey,
        local_half: &KeyHalf,
        remote_hello: &HelloPublicKey,
        remote_half: &KeyHalf,
    ) -> Self {
        Self {
            outbound: directional_key(local_hello, local_half, remote_hello, remote_half),
            inbound: directional_key(remote_hello, remote_half, local_hello, local_half),
        }
    }
}

///   key(A→B) = BLAKE3-derive(hello_A || half_A[..16] || hello_B || half_B[16..])
fn directional_key(
    from_hello: &HelloPublicKey,
    from_half: &KeyHalf,
    to_hello: &HelloPublicKey,
    to_half: &KeyHalf,
) -> Zeroizing<[u8; 32]> {
    let mid = HALF_LEN / 2;
    let mut h = blake3::Hasher::new_derive_key(SESSION_CONTEXT);
    h.update(from_hello.as_bytes());
    h.update(&from_half.0[..mid]);
    h.update(to_hello.as_bytes());
    h.update(&to_half.0[mid..]);
    Zeroizing::new(*h.finalize().as_bytes())
}

/// Generate a random authentication challenge.
pub fn generate_challenge() -> [u8; CHALLENGE_LEN] {
    let mut challenge = [0u8; CHALLENGE_LEN];
    OsRng.fill_bytes(&mut challenge);
    challenge
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("invalid signature public key")]
    BadPublicKey,

    #[error("signature verification failed")]
    BadSignature,

    #[error("x25519 agreement was not contributory")]
    NonContributory,

    #[error("failed to seal short message")]
    Seal,

    #[error("failed to open sealed message")]
    Open,

    #[error("input too short")]
    TooShort,
}

// ── Tests ─────────────────────────────────────────────────────────────────────
