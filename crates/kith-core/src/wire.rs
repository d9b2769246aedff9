//! Kith wire format: the fixed-size messages exchanged on a physical link.
//!
//! Every message travels as the body of one length-prefixed frame. The
//! framing itself lives with the tube in kith-dialer; this module only knows
//! message layouts.
//!
//! All multi-byte integers are big-endian. Structs are `#[repr(C)]` over
//! alignment-1 fields, so there is no padding and zerocopy can read them
//! straight out of a frame. There is no unsafe code in this module.

use static_assertions::assert_eq_size;
use thiserror::Error;
use zerocopy::byteorder::{BigEndian, U32, U64};
use zerocopy::{AsBytes, FromBytes, FromZeroes};

use crate::crypto::{CHALLENGE_LEN, SEALED_HALF_LEN, SIGNATURE_LEN};

/// Dialer protocol version announced in [`Greet`].
pub const PROTOCOL_VERSION: u32 = 1;

/// Build tag announced in [`Greet`], NUL-padded.
pub const BUILD: [u8; 16] = *b"kith-0.1.0\0\0\0\0\0\0";

/// Orientation orders are drawn from `[0, ORIENT_MAX)`.
pub const ORIENT_MAX: u32 = 2_000_000_000;

/// Longest accepted subject, in bytes.
pub const MAX_SUBJECT_LEN: usize = 255;

/// Constant carried by [`AuthConfirm`].
pub const CONFIRM_MAGIC: u32 = 0x6b69_7468;

// ── Hello ─────────────────────────────────────────────────────────────────────

/// Per-connection x25519 public key, sent in the clear.
///
/// Wire size: 32 bytes.
#[derive(Debug, Clone, Copy, AsBytes, FromBytes, FromZeroes)]
#[repr(C)]
pub struct HelloKey {
    pub key: [u8; 32],
}

assert_eq_size!(HelloKey, [u8; 32]);

/// One side's key half, sealed to the peer's hello key.
///
/// Wire size: 80 bytes.
#[derive(Debug, Clone, Copy, AsBytes, FromBytes, FromZeroes)]
#[repr(C)]
pub struct SealedHalf {
    pub sealed: [u8; SEALED_HALF_LEN],
}

assert_eq_size!(SealedHalf, [u8; 80]);

// ── Greet ─────────────────────────────────────────────────────────────────────

/// Build and version exchange, sent once by each side after the hello.
///
/// Wire size: 20 bytes.
#[derive(Debug, Clone, Copy, AsBytes, FromBytes, FromZeroes)]
#[repr(C)]
pub struct Greet {
    pub build: [u8; 16],
    pub version: U32<BigEndian>,
}

assert_eq_size!(Greet, [u8; 20]);

impl Greet {
    pub fn local() -> Self {
        Self {
            build: BUILD,
            version: U32::new(PROTOCOL_VERSION),
        }
    }

    /// Build tag with the NUL padding stripped.
    pub fn build_str(&self) -> String {
        let end = self.build.iter().position(|&b| b == 0).unwrap_or(self.build.len());
        String::from_utf8_lossy(&self.build[..end]).into_owned()
    }
}

// ── Authentication ────────────────────────────────────────────────────────────

/// Connector → acceptor: the dial key we were issued, plus our challenge.
///
/// Wire size: 40 bytes.
#[derive(Debug, Clone, Copy, AsBytes, FromBytes, FromZeroes)]
#[repr(C)]
pub struct ConnectHello {
    pub dial_key: U64<BigEndian>,
    pub challenge: [u8; CHALLENGE_LEN],
}

assert_eq_size!(ConnectHello, [u8; 40]);

/// Acceptor → connector: the acceptor's challenge.
///
/// Wire size: 32 bytes.
#[derive(Debug, Clone, Copy, AsBytes, FromBytes, FromZeroes)]
#[repr(C)]
pub struct AcceptChallenge {
    pub challenge: [u8; CHALLENGE_LEN],
}

assert_eq_size!(AcceptChallenge, [u8; 32]);

/// Connector → acceptor: signature over the acceptor's challenge.
///
/// Wire size: 64 bytes.
#[derive(Debug, Clone, Copy, AsBytes, FromBytes, FromZeroes)]
#[repr(C)]
pub struct ConnectProof {
    pub signature: [u8; SIGNATURE_LEN],
}

assert_eq_size!(ConnectProof, [u8; 64]);

/// Acceptor → connector: the key the acceptor is answering for, and its
/// signature over the connector's challenge.
///
/// Wire size: 72 bytes.
#[derive(Debug, Clone, Copy, AsBytes, FromBytes, FromZeroes)]
#[repr(C)]
pub struct AcceptProof {
    pub accept_key: U64<BigEndian>,
    pub signature: [u8; SIGNATURE_LEN],
}

assert_eq_size!(AcceptProof, [u8; 72]);

/// Connector → acceptor: final confirmation that the acceptor's proof checked
/// out. The acceptor only trusts the link after this arrives.
///
/// Wire size: 4 bytes.
#[derive(Debug, Clone, Copy, AsBytes, FromBytes, FromZeroes)]
#[repr(C)]
pub struct AuthConfirm {
    pub magic: U32<BigEndian>,
}

assert_eq_size!(AuthConfirm, [u8; 4]);

impl AuthConfirm {
    pub fn new() -> Self {
        Self {
            magic: U32::new(CONFIRM_MAGIC),
        }
    }

    pub fn is_valid(&self) -> bool {
        self.magic.get() == CONFIRM_MAGIC
    }
}

impl Default for AuthConfirm {
    fn default() -> Self {
        Self::new()
    }
}

// ── Orientation ───────────────────────────────────────────────────────────────

/// Request to open a logical channel, or the echo answering one.
///
/// Wire size: 12 bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, AsBytes, FromBytes, FromZeroes)]
#[repr(C)]
pub struct Orient {
    pub order: U32<BigEndian>,
    pub session: U64<BigEndian>,
}

assert_eq_size!(Orient, [u8; 12]);

impl Orient {
    pub fn new(order: u32, session: u64) -> Self {
        Self {
            order: U32::new(order),
            session: U64::new(session),
        }
    }

    pub fn order(&self) -> u32 {
        self.order.get()
    }

    pub fn session(&self) -> u64 {
        self.session.get()
    }

    /// The reply a polling side sends back: same session, order plus one.
    pub fn echo(&self) -> Self {
        Self::new(self.order().wrapping_add(1), self.session())
    }
}

// ── Decoding ──────────────────────────────────────────────────────────────────

/// Read a fixed-size message out of one frame body. The frame must be
/// exactly the message size.
pub fn decode<T: FromBytes>(what: &'static str, frame: &[u8]) -> Result<T, WireError> {
    T::read_from(frame).ok_or(WireError::BadLength {
        what,
        expected: std::mem::size_of::<T>(),
        got: frame.len(),
    })
}

/// Validate a subject frame: non-empty UTF-8 of bounded length.
pub fn decode_subject(frame: &[u8]) -> Result<String, WireError> {
    if frame.is_empty() {
        return Err(WireError::EmptySubject);
    }
    if frame.len() > MAX_SUBJECT_LEN {
        return Err(WireError::SubjectTooLong(frame.len()));
    }
    std::str::from_utf8(frame)
        .map(str::to_owned)
        .map_err(|_| WireError::SubjectNotUtf8)
}

#[derive(Debug, Error)]
pub enum WireError {
    #[error("{what}: expected {expected} bytes, got {got}")]
    BadLength {
        what: &'static str,
        expected: usize,
        got: usize,
    },
    #[error("empty subject")]
    EmptySubject,
    #[error("subject of {0} bytes exceeds limit")]
    SubjectTooLong(usize),
    #[error("subject is not valid UTF-8")]
    SubjectNotUtf8,
}
