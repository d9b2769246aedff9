//! Tube: a framed, optionally encrypted duplex stream over a raw socket.
//!
//! Frames are a 4-byte big-endian length followed by the body. Until
//! [`Tube::install_keys`] is called frames travel in the clear; afterwards
//! every frame is sealed with ChaCha20-Poly1305 under the key for its
//! direction, with a 96-bit counter as nonce.
//!
//! Reads and writes are independent: one task may block in `recv` while
//! another sends. Closing the tube wakes both and drops the socket.

use std::sync::Mutex as StdMutex;

use bytes::{Bytes, BytesMut};
use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use futures::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite, ReadHalf, WriteHalf};
use tokio::sync::Mutex;
use tokio_util::codec::{Decoder, Encoder, FramedRead, FramedWrite, LengthDelimitedCodec};
use tokio_util::sync::CancellationToken;
use zerocopy::{AsBytes, FromBytes};

use kith_core::crypto::{SessionKeys, TAG_LEN};
use kith_core::wire::{self, WireError};

use crate::fdlimit::FdPermit;

/// Handshake messages must fit in a frame even when cargo frames are tiny.
const MIN_FRAME_LEN: usize = 1024;

/// Nonces are 96 bits; the counter must never wrap into reuse.
const NONCE_LIMIT: u128 = 1 << 96;

/// Anything a tube can run over: TCP sockets, in-memory pipes.
pub trait RawStream: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin + 'static> RawStream for T {}

type Reader = FramedRead<ReadHalf<Box<dyn RawStream>>, FrameCodec>;
type Writer = FramedWrite<WriteHalf<Box<dyn RawStream>>, FrameCodec>;

// ── Frame cipher ──────────────────────────────────────────────────────────────

struct FrameCipher {
    aead: ChaCha20Poly1305,
    counter: u128,
}

impl FrameCipher {
    fn new(key: &[u8; 32]) -> Self {
        Self {
            aead: ChaCha20Poly1305::new(Key::from_slice(key)),
            counter: 0,
        }
    }

    fn next_nonce(&mut self) -> Result<[u8; 12], TubeError> {
        if self.counter >= NONCE_LIMIT {
            return Err(TubeError::NonceExhausted);
        }
        let mut nonce = [0u8; 12];
        nonce.copy_from_slice(&self.counter.to_be_bytes()[4..]);
        self.counter += 1;
        Ok(nonce)
    }

    fn seal(&mut self, plaintext: &[u8]) -> Result<Bytes, TubeError> {
        let nonce = self.next_nonce()?;
        self.aead
            .encrypt(Nonce::from_slice(&nonce), plaintext)
            .map(Bytes::from)
            .map_err(|_| TubeError::Seal)
    }

    fn open(&mut self, ciphertext: &[u8]) -> Result<BytesMut, TubeError> {
        let nonce = self.next_nonce()?;
        self.aead
            .decrypt(Nonce::from_slice(&nonce), ciphertext)
            .map(|plain| BytesMut::from(&plain[..]))
            .map_err(|_| TubeError::Open)
    }
}

// ── Codec ─────────────────────────────────────────────────────────────────────

/// Length-delimited framing with an optional per-direction cipher.
pub struct FrameCodec {
    framing: LengthDelimitedCodec,
    cipher: Option<FrameCipher>,
}

impl FrameCodec {
    pub fn new(max_frame_len: usize) -> Self {
        let framing = LengthDelimitedCodec::builder()
            .length_field_length(4)
            .big_endian()
            .max_frame_length(max_frame_len.max(MIN_FRAME_LEN) + TAG_LEN)
            .new_codec();
        Self { framing, cipher: None }
    }

    fn install(&mut self, key: &[u8; 32]) {
        self.cipher = Some(FrameCipher::new(key));
    }
}

impl Decoder for FrameCodec {
    type Item = BytesMut;
    type Error = TubeError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<BytesMut>, TubeError> {
        let Some(frame) = self.framing.decode(src)? else {
            return Ok(None);
        };
        match &mut self.cipher {
            None => Ok(Some(frame)),
            Some(cipher) => cipher.open(&frame).map(Some),
        }
    }
}

impl Encoder<Bytes> for FrameCodec {
    type Error = TubeError;

    fn encode(&mut self, item: Bytes, dst: &mut BytesMut) -> Result<(), TubeError> {
        let item = match &mut self.cipher {
            None => item,
            Some(cipher) => cipher.seal(&item)?,
        };
        self.framing.encode(item, dst)?;
        Ok(())
    }
}

// ── Tube ──────────────────────────────────────────────────────────────────────

pub struct Tube {
    reader: Mutex<Option<Reader>>,
    writer: Mutex<Option<Writer>>,
    permit: StdMutex<Option<FdPermit>>,
    closed: CancellationToken,
}

impl Tube {
    /// Wrap a raw stream. `permit`, if any, is released when the tube closes.
    pub fn new(stream: impl RawStream, max_frame_len: usize, permit: Option<FdPermit>) -> Self {
        let stream: Box<dyn RawStream> = Box::new(stream);
        let (read_half, write_half) = tokio::io::split(stream);
        Self {
            reader: Mutex::new(Some(FramedRead::new(read_half, FrameCodec::new(max_frame_len)))),
            writer: Mutex::new(Some(FramedWrite::new(write_half, FrameCodec::new(max_frame_len)))),
            permit: StdMutex::new(permit),
            closed: CancellationToken::new(),
        }
    }

    pub async fn send(&self, frame: Bytes) -> Result<(), TubeError> {
        let mut guard = tokio::select! {
            biased;
            _ = self.closed.cancelled() => return Err(TubeError::Closed),
            guard = self.writer.lock() => guard,
        };
        let Some(writer) = guard.as_mut() else {
            return Err(TubeError::Closed);
        };
        let result = tokio::select! {
            biased;
            _ = self.closed.cancelled() => Err(TubeError::Closed),
            result = writer.send(frame) => result,
        };
        if self.closed.is_cancelled() {
            *guard = None;
        }
        result
    }

    /// Next frame body. A clean end of stream is [`TubeError::Eof`].
    pub async fn recv(&self) -> Result<BytesMut, TubeError> {
        let mut guard = tokio::select! {
            biased;
            _ = self.closed.cancelled() => return Err(TubeError::Closed),
            guard = self.reader.lock() => guard,
        };
        let Some(reader) = guard.as_mut() else {
            return Err(TubeError::Closed);
        };
        let result = tokio::select! {
            biased;
            _ = self.closed.cancelled() => Err(TubeError::Closed),
            frame = reader.next() => match frame {
                Some(frame) => frame,
                None => Err(TubeError::Eof),
            },
        };
        if self.closed.is_cancelled() {
            *guard = None;
        }
        result
    }

    pub async fn send_msg<T: AsBytes>(&self, msg: &T) -> Result<(), TubeError> {
        self.send(Bytes::copy_from_slice(msg.as_bytes())).await
    }

    pub async fn recv_msg<T: FromBytes>(&self, what: &'static str) -> Result<T, TubeError> {
        let frame = self.recv().await?;
        Ok(wire::decode(what, &frame)?)
    }

    /// Switch both directions to encrypted framing.
    pub async fn install_keys(&self, keys: &SessionKeys) -> Result<(), TubeError> {
        let mut reader = self.reader.lock().await;
        let mut writer = self.writer.lock().await;
        match (reader.as_mut(), writer.as_mut()) {
            (Some(reader), Some(writer)) => {
                reader.decoder_mut().install(&keys.inbound);
                writer.encoder_mut().install(&keys.outbound);
                Ok(())
            }
            _ => Err(TubeError::Closed),
        }
    }

    /// Idempotent. Wakes pending I/O, drops the socket, and releases the fd
    /// permit.
    pub fn close(&self) {
        self.closed.cancel();
        if let Ok(mut reader) = self.reader.try_lock() {
            *reader = None;
        }
        if let Ok(mut writer) = self.writer.try_lock() {
            *writer = None;
        }
        let permit = self
            .permit
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .take();
        drop(permit);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }
}

impl Drop for Tube {
    fn drop(&mut self) {
        self.closed.cancel();
    }
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum TubeError {
    #[error("i/o: {0}")]
    Io(#[from] std::io::Error),
    #[error("peer closed the stream")]
    Eof,
    #[error("tube closed")]
    Closed,
    #[error("failed to seal frame")]
    Seal,
    #[error("frame failed authentication")]
    Open,
    #[error("nonce space exhausted")]
    NonceExhausted,
    #[error("wire: {0}")]
    Wire(#[from] WireError),
}

impl From<TubeError> for std::io::Error {
    fn from(e: TubeError) -> Self {
        use std::io::ErrorKind;
        match e {
            TubeError::Io(e) => e,
            TubeError::Eof => std::io::Error::new(ErrorKind::UnexpectedEof, e),
            TubeError::Closed => std::io::Error::new(ErrorKind::NotConnected, e),
            other => std::io::Error::new(ErrorKind::InvalidData, other),
        }
    }
}
