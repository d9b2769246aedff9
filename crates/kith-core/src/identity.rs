//! Peer identities, rendezvous keys, and authentication material.
//!
//! A [`PeerId`] is never transmitted as such: it is always recomputed from a
//! verified [`SignaturePublicKey`], so a peer can only ever claim the identity
//! its signature key proves.

use std::fmt;
use std::path::{Path, PathBuf};

use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::crypto::{CryptoError, SignaturePublicKey, SigningKeyPair};

// ── PeerId ────────────────────────────────────────────────────────────────────

/// Stable 64-bit identifier derived from a signature public key.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PeerId(pub u64);

impl PeerId {
    /// BLAKE3 of the canonical key encoding, folded to 64 bits by XOR of its
    /// four little-endian words.
    pub fn from_key(key: &SignaturePublicKey) -> Self {
        let digest = crate::crypto::hash(&key.to_bytes());
        let folded = digest
            .chunks_exact(8)
            .map(|w| u64::from_le_bytes([w[0], w[1], w[2], w[3], w[4], w[5], w[6], w[7]]))
            .fold(0u64, |acc, w| acc ^ w);
        Self(folded)
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

impl fmt::Debug for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PeerId({:016x})", self.0)
    }
}

// ── Link keys ─────────────────────────────────────────────────────────────────

/// A 64-bit random rendezvous token.
///
/// We issue an accept key to a friend out of band; the friend stores it as
/// the dial key it presents when connecting to us.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LinkKey(pub u64);

pub type DialKey = LinkKey;
pub type AcceptKey = LinkKey;

impl LinkKey {
    pub fn generate() -> Self {
        Self(OsRng.next_u64())
    }
}

impl fmt::Debug for LinkKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "LinkKey({:016x})", self.0)
    }
}

// ── Authentication material ───────────────────────────────────────────────────

/// Our own credentials: the signing key and the identity it implies.
#[derive(Debug, Clone)]
pub struct LocalAuth {
    signing: SigningKeyPair,
    id: PeerId,
}

impl LocalAuth {
    pub fn new(signing: SigningKeyPair) -> Self {
        let id = PeerId::from_key(&signing.public());
        Self { signing, id }
    }

    pub fn id(&self) -> PeerId {
        self.id
    }

    pub fn signing(&self) -> &SigningKeyPair {
        &self.signing
    }
}

/// What we know about a friend: their signature key and the key pair used
/// to rendezvous in either direction.
#[derive(Debug, Clone)]
pub struct RemoteAuth {
    id: PeerId,
    verifying_key: SignaturePublicKey,
    /// Presented when we dial them. Equals the accept key they issued to us.
    pub dial_key: DialKey,
    /// Expected from them when they dial us. We issued it.
    pub accept_key: AcceptKey,
}

impl RemoteAuth {
    pub fn new(verifying_key: SignaturePublicKey, dial_key: DialKey, accept_key: AcceptKey) -> Self {
        Self {
            id: PeerId::from_key(&verifying_key),
            verifying_key,
            dial_key,
            accept_key,
        }
    }

    pub fn id(&self) -> PeerId {
        self.id
    }

    pub fn verifying_key(&self) -> &SignaturePublicKey {
        &self.verifying_key
    }
}

// ── Persistence ───────────────────────────────────────────────────────────────

/// Load the signing seed from `path`, or generate and store a fresh one.
///
/// The file holds the 32-byte seed hex-encoded on a single line.
pub fn load_or_generate(path: &Path) -> Result<SigningKeyPair, IdentityError> {
    if path.exists() {
        let text = std::fs::read_to_string(path)
            .map_err(|e| IdentityError::ReadFailed(path.to_path_buf(), e))?;
        let bytes = hex::decode(text.trim()).map_err(|_| IdentityError::Malformed(path.to_path_buf()))?;
        let seed: [u8; 32] = bytes
            .as_slice()
            .try_into()
            .map_err(|_| IdentityError::Malformed(path.to_path_buf()))?;
        return Ok(SigningKeyPair::from_seed(&seed));
    }

    let keypair = SigningKeyPair::generate();
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| IdentityError::WriteFailed(path.to_path_buf(), e))?;
    }
    let encoded = hex::encode(&keypair.seed()[..]);
    std::fs::write(path, format!("{encoded}\n"))
        .map_err(|e| IdentityError::WriteFailed(path.to_path_buf(), e))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
            .map_err(|e| IdentityError::WriteFailed(path.to_path_buf(), e))?;
    }

    Ok(keypair)
}

/// Parse a hex-encoded 32-byte signature public key.
pub fn parse_public_key(text: &str) -> Result<SignaturePublicKey, IdentityError> {
    let bytes = hex::decode(text.trim()).map_err(|_| IdentityError::BadPublicKey(text.to_string()))?;
    let bytes: [u8; 32] = bytes
        .as_slice()
        .try_into()
        .map_err(|_| IdentityError::BadPublicKey(text.to_string()))?;
    SignaturePublicKey::from_bytes(&bytes).map_err(|e| IdentityError::Crypto(text.to_string(), e))
}

#[derive(Debug, Error)]
pub enum IdentityError {
    #[error("failed to read identity {0}: {1}")]
    ReadFailed(PathBuf, std::io::Error),
    #[error("failed to write identity {0}: {1}")]
    WriteFailed(PathBuf, std::io::Error),
    #[error("identity file {0} is not a hex-encoded 32-byte seed")]
    Malformed(PathBuf),
    #[error("not a hex-encoded public key: {0}")]
    BadPublicKey(String),
    #[error("invalid public key {0}: {1}")]
    Crypto(String, CryptoError),
}
