//! Connection handshake: session keys first, then mutual authentication.
//!
//! ```text
//!   connector                               acceptor
//!   HelloKey(hA)            ───────────▶
//!                           ◀───────────    HelloKey(hB)
//!   SealedHalf(xA → hB)     ───────────▶
//!                           ◀───────────    SealedHalf(xB → hA)
//!   ── both directions now sealed under their own key ──
//!   ConnectHello(dial, cA)  ───────────▶    lookup(dial)
//!                           ◀───────────    AcceptChallenge(cB)
//!   ConnectProof(sig cB)    ───────────▶    verify
//!                           ◀───────────    AcceptProof(key, sig cA)
//!   verify, check key
//!   AuthConfirm             ───────────▶
//! ```
//!
//! Signatures cover the transcript of both hello keys, so a proof cannot be
//! replayed onto another connection. The identity returned on either side is
//! recomputed from the verified signature key, never taken from the wire.

use bytes::Bytes;
use thiserror::Error;

use kith_core::crypto::{
    self, CryptoError, HelloKeyPair, HelloPublicKey, KeyHalf, SessionKeys, CHALLENGE_LEN,
    KEY_HALVES_LABEL,
};
use kith_core::identity::{AcceptKey, LinkKey, LocalAuth, PeerId, RemoteAuth};
use kith_core::wire::{
    AcceptChallenge, AcceptProof, AuthConfirm, ConnectHello, ConnectProof, HelloKey, SealedHalf,
};
use zerocopy::byteorder::U64;

use crate::tube::{Tube, TubeError};

const CONNECT_PROOF_LABEL: &[u8] = b"kith auth connect";
const ACCEPT_PROOF_LABEL: &[u8] = b"kith auth accept";

/// Which end of the physical link we are.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Connector,
    Acceptor,
}

/// BLAKE3 of the connector's then the acceptor's hello key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transcript([u8; 32]);

impl Transcript {
    fn new(connector: &HelloPublicKey, acceptor: &HelloPublicKey) -> Self {
        let mut joined = [0u8; 64];
        joined[..32].copy_from_slice(connector.as_bytes());
        joined[32..].copy_from_slice(acceptor.as_bytes());
        Self(crypto::hash(&joined))
    }

    fn proof_message(&self, label: &[u8], challenge: &[u8; CHALLENGE_LEN]) -> Vec<u8> {
        let mut msg = Vec::with_capacity(label.len() + 32 + CHALLENGE_LEN);
        msg.extend_from_slice(label);
        msg.extend_from_slice(&self.0);
        msg.extend_from_slice(challenge);
        msg
    }
}

// ── Session bootstrap ─────────────────────────────────────────────────────────

/// Exchange hello keys and sealed key halves, then switch the tube to
/// encrypted framing. Nothing is installed unless every step succeeds.
pub async fn hello(tube: &Tube, side: Side) -> Result<Transcript, HandshakeError> {
    let local = HelloKeyPair::generate();
    tube.send_msg(&HelloKey { key: local.public().0 }).await?;
    let remote = HelloPublicKey(tube.recv_msg::<HelloKey>("hello key").await?.key);

    let half = KeyHalf::generate();
    let sealed = crypto::seal_short(&remote, half.as_bytes(), KEY_HALVES_LABEL)?;
    tube.send(Bytes::from(sealed)).await?;
    let theirs: SealedHalf = tube.recv_msg("sealed half").await?;
    let opened = crypto::open_short(&local, &theirs.sealed, KEY_HALVES_LABEL)?;
    let remote_half = KeyHalf::from_bytes(&opened)?;

    let keys = SessionKeys::derive(&local.public(), &half, &remote, &remote_half);
    tube.install_keys(&keys).await?;

    Ok(match side {
        Side::Connector => Transcript::new(&local.public(), &remote),
        Side::Acceptor => Transcript::new(&remote, &local.public()),
    })
}

// ── Mutual authentication ─────────────────────────────────────────────────────

/// Authenticate as the dialing side against a known friend.
pub async fn connect(
    tube: &Tube,
    transcript: &Transcript,
    local: &LocalAuth,
    remote: &RemoteAuth,
) -> Result<PeerId, HandshakeError> {
    let our_challenge = crypto::generate_challenge();
    tube.send_msg(&ConnectHello {
        dial_key: U64::new(remote.dial_key.0),
        challenge: our_challenge,
    })
    .await?;

    let challenge: AcceptChallenge = tube.recv_msg("accept challenge").await?;
    let signature = local
        .signing()
        .sign(&transcript.proof_message(CONNECT_PROOF_LABEL, &challenge.challenge));
    tube.send_msg(&ConnectProof { signature }).await?;

    let proof: AcceptProof = tube.recv_msg("accept proof").await?;
    if proof.accept_key.get() != remote.accept_key.0 {
        return Err(HandshakeError::KeyMismatch);
    }
    remote
        .verifying_key()
        .verify(
            &transcript.proof_message(ACCEPT_PROOF_LABEL, &our_challenge),
            &proof.signature,
        )
        .map_err(HandshakeError::BadSignature)?;

    tube.send_msg(&AuthConfirm::new()).await?;
    Ok(PeerId::from_key(remote.verifying_key()))
}

/// Authenticate as the listening side. `lookup` maps the presented dial key
/// (our accept key) to the friend it was issued to.
pub async fn accept<F>(
    tube: &Tube,
    transcript: &Transcript,
    local: &LocalAuth,
    lookup: F,
) -> Result<(PeerId, RemoteAuth), HandshakeError>
where
    F: FnOnce(AcceptKey) -> Option<RemoteAuth>,
{
    let hello: ConnectHello = tube.recv_msg("connect hello").await?;
    let presented: AcceptKey = LinkKey(hello.dial_key.get());
    let remote = lookup(presented).ok_or(HandshakeError::UnknownKey(presented.0))?;

    let our_challenge = crypto::generate_challenge();
    tube.send_msg(&AcceptChallenge { challenge: our_challenge }).await?;

    let proof: ConnectProof = tube.recv_msg("connect proof").await?;
    remote
        .verifying_key()
        .verify(
            &transcript.proof_message(CONNECT_PROOF_LABEL, &our_challenge),
            &proof.signature,
        )
        .map_err(HandshakeError::BadSignature)?;

    let signature = local
        .signing()
        .sign(&transcript.proof_message(ACCEPT_PROOF_LABEL, &hello.challenge));
    tube.send_msg(&AcceptProof {
        accept_key: U64::new(remote.dial_key.0),
        signature,
    })
    .await?;

    let confirm: AuthConfirm = tube.recv_msg("auth confirm").await?;
    if !confirm.is_valid() {
        return Err(HandshakeError::BadConfirm);
    }
    Ok((PeerId::from_key(remote.verifying_key()), remote))
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum HandshakeError {
    #[error("tube: {0}")]
    Tube(#[from] TubeError),
    #[error("crypto: {0}")]
    Crypto(#[from] CryptoError),
    #[error("no friend holds accept key {0:016x}")]
    UnknownKey(u64),
    #[error("peer answered for the wrong accept key")]
    KeyMismatch,
    #[error("peer signature rejected: {0}")]
    BadSignature(CryptoError),
    #[error("missing authentication confirmation")]
    BadConfirm,
    #[error("handshake timed out")]
    Timeout,
}
