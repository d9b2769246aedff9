//! Handoff: one logical channel riding on a connection.
//!
//! Payload travels as cargo frames; a zero-length cargo marks end of stream
//! in that direction. Each `write` sends one frame (split at the frame
//! limit), reads are served from an internal buffer.
//!
//! While a handoff is open it holds its connection's line, so the poll loop
//! cannot start another channel underneath it. Closing gracefully returns the
//! connection to `Ready`; any I/O failure or dropping an open handoff kills
//! the connection, since its framing can no longer be trusted.

use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::{Arc, Weak};
use std::task::{ready, Context, Poll};

use bytes::{Bytes, BytesMut};
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::sync::OwnedSemaphorePermit;

use crate::conn::{ConnError, Connection};
use crate::tube::{Tube, TubeError};

type Pending<T> = Pin<Box<dyn Future<Output = Result<T, TubeError>> + Send>>;

#[derive(Debug, Default, Clone, Copy, Serialize)]
pub struct HandoffStats {
    pub bytes_read: u64,
    pub bytes_written: u64,
    pub reads: u64,
    pub writes: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Open,
    Closed,
    Killed,
}

pub struct Handoff {
    tag: u64,
    session: u64,
    conn: Weak<Connection>,
    tube: Arc<Tube>,
    line: Option<OwnedSemaphorePermit>,
    max_frame_len: usize,
    state: State,
    read_buf: BytesMut,
    read_closed: bool,
    reading: Option<Pending<BytesMut>>,
    writing: Option<(usize, Pending<()>)>,
    closing: Option<Pending<()>>,
    stats: HandoffStats,
}

impl Handoff {
    pub(crate) fn new(
        tag: u64,
        session: u64,
        conn: Weak<Connection>,
        tube: Arc<Tube>,
        line: OwnedSemaphorePermit,
        max_frame_len: usize,
    ) -> Self {
        Self {
            tag,
            session,
            conn,
            tube,
            line: Some(line),
            max_frame_len: max_frame_len.max(1),
            state: State::Open,
            read_buf: BytesMut::new(),
            read_closed: false,
            reading: None,
            writing: None,
            closing: None,
            stats: HandoffStats::default(),
        }
    }

    pub fn tag(&self) -> u64 {
        self.tag
    }

    pub fn session(&self) -> u64 {
        self.session
    }

    pub fn stats(&self) -> HandoffStats {
        self.stats
    }

    pub fn is_open(&self) -> bool {
        self.state == State::Open
    }

    /// Graceful close: send our end-of-stream, wait for the peer's unless
    /// already seen, then hand the connection back. A second call reports
    /// the channel as not connected.
    pub async fn close(&mut self) -> io::Result<()> {
        if self.state != State::Open {
            return Err(closed_error());
        }
        self.shutdown().await
    }

    /// Abort the channel and the connection under it.
    pub fn kill(&mut self) {
        self.fail(ConnError::Abandoned);
    }

    /// Kill unless already finished. Used where a drop would otherwise
    /// happen after dependent cleanup.
    pub(crate) fn abandon(&mut self) {
        if self.state == State::Open {
            self.fail(ConnError::Abandoned);
        }
    }

    fn fail(&mut self, reason: ConnError) {
        if self.state != State::Open {
            return;
        }
        self.state = State::Killed;
        self.reading = None;
        self.writing = None;
        self.closing = None;
        if let Some(conn) = self.conn.upgrade() {
            conn.kill(reason);
        }
        self.conn = Weak::new();
        self.line = None;
    }

    fn finish(&mut self) {
        self.state = State::Closed;
        if let Some(conn) = self.conn.upgrade() {
            conn.release_handoff(self.tag);
        }
        self.conn = Weak::new();
        // Releasing the line lets the poll loop resume.
        self.line = None;
    }
}

fn closed_error() -> io::Error {
    io::Error::new(io::ErrorKind::NotConnected, "channel closed")
}

impl AsyncRead for Handoff {
    fn poll_read(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        loop {
            if !this.read_buf.is_empty() {
                let n = buf.remaining().min(this.read_buf.len());
                buf.put_slice(&this.read_buf.split_to(n));
                this.stats.bytes_read += n as u64;
                this.stats.reads += 1;
                return Poll::Ready(Ok(()));
            }
            if this.read_closed || buf.remaining() == 0 {
                return Poll::Ready(Ok(()));
            }
            if this.state != State::Open {
                return Poll::Ready(Err(closed_error()));
            }

            let pending = this.reading.get_or_insert_with(|| {
                let tube = this.tube.clone();
                Box::pin(async move { tube.recv().await })
            });
            let result = ready!(pending.as_mut().poll(cx));
            this.reading = None;
            match result {
                Ok(frame) if frame.is_empty() => this.read_closed = true,
                Ok(frame) => this.read_buf = frame,
                Err(e) => {
                    this.fail(ConnError::Channel(e.to_string()));
                    return Poll::Ready(Err(e.into()));
                }
            }
        }
    }
}

impl AsyncWrite for Handoff {
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        if this.writing.is_none() {
            if this.state != State::Open || this.closing.is_some() {
                return Poll::Ready(Err(closed_error()));
            }
            if buf.is_empty() {
                return Poll::Ready(Ok(0));
            }
            let n = buf.len().min(this.max_frame_len);
            let frame = Bytes::copy_from_slice(&buf[..n]);
            let tube = this.tube.clone();
            this.writing = Some((n, Box::pin(async move { tube.send(frame).await })));
        }

        let Some((n, pending)) = this.writing.as_mut() else {
            return Poll::Ready(Ok(0));
        };
        let result = ready!(pending.as_mut().poll(cx));
        let n = *n;
        this.writing = None;
        match result {
            Ok(()) => {
                this.stats.bytes_written += n as u64;
                this.stats.writes += 1;
                Poll::Ready(Ok(n))
            }
            Err(e) => {
                this.fail(ConnError::Channel(e.to_string()));
                Poll::Ready(Err(e.into()))
            }
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if let Some((_, pending)) = this.writing.as_mut() {
            let result = ready!(pending.as_mut().poll(cx));
            this.writing = None;
            if let Err(e) = result {
                this.fail(ConnError::Channel(e.to_string()));
                return Poll::Ready(Err(e.into()));
            }
        }
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.state {
            State::Closed => return Poll::Ready(Ok(())),
            State::Killed => return Poll::Ready(Err(closed_error())),
            State::Open => {}
        }
        ready!(self.as_mut().poll_flush(cx))?;

        let this = self.get_mut();
        if this.closing.is_none() {
            // An abandoned read would hold the tube's reader.
            this.reading = None;
            let tube = this.tube.clone();
            let drain = !this.read_closed;
            this.closing = Some(Box::pin(async move {
                tube.send(Bytes::new()).await?;
                if drain {
                    while !tube.recv().await?.is_empty() {}
                }
                Ok(())
            }));
        }
        let Some(pending) = this.closing.as_mut() else {
            return Poll::Ready(Ok(()));
        };
        let result = ready!(pending.as_mut().poll(cx));
        this.closing = None;
        match result {
            Ok(()) => {
                this.read_closed = true;
                this.finish();
                Poll::Ready(Ok(()))
            }
            Err(e) => {
                this.fail(ConnError::Channel(e.to_string()));
                Poll::Ready(Err(e.into()))
            }
        }
    }
}

impl Drop for Handoff {
    fn drop(&mut self) {
        self.abandon();
    }
}

impl std::fmt::Debug for Handoff {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Handoff")
            .field("tag", &self.tag)
            .field("session", &format_args!("{:016x}", self.session))
            .field("state", &self.state)
            .field("stats", &self.stats)
            .finish()
    }
}
