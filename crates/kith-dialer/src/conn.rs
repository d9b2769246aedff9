//! Connection: one physical link to a peer and its regime state machine.
//!
//! ```text
//!   Idle ─▶ Connecting ─▶ UnAuthenticated ⇄ Authenticating ─▶ Ready ⇄ Busy
//!                                                              │  ▲    ▲
//!                                                              ▼  │    │
//!                                                             Dialing ─┘
//!   any ─▶ Closed (sticky)
//! ```
//!
//! Once `Ready`, a connection carries at most one [`Handoff`] at a time. The
//! [`Connection::poll`] loop owns the read side while idle: it waits for
//! either a local dial queued by [`Connection::dial`] or an orientation
//! message from the peer, then runs the tie-break and hands back the channel.
//!
//! [`Connection::kill`] is the single teardown path. It is idempotent, closes
//! the tube exactly once and wakes everything blocked on this connection.

use std::future::Future;
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use bytes::Bytes;
use serde::Serialize;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;

use kith_core::backoff::Backoff;
use kith_core::config::DialerSettings;
use kith_core::identity::PeerId;
use kith_core::wire::{self, Greet, Orient, WireError, MAX_SUBJECT_LEN, PROTOCOL_VERSION};

use crate::fdlimit::{FdLimiter, FdPermit};
use crate::handoff::Handoff;
use crate::handshake::{self, HandshakeError, Side, Transcript};
use crate::orient::{resolve, OrderSource, Orientation};
use crate::snapshot::{ConnectionSnapshot, HandoffSnapshot};
use crate::tube::{RawStream, Tube, TubeError};

// ── Regime ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Regime {
    Idle,
    Connecting,
    #[serde(rename = "unauthenticated")]
    UnAuthenticated,
    Authenticating,
    Ready,
    /// A local dial is queued for the poll loop.
    Dialing,
    Busy,
    Closed,
}

impl Regime {
    /// The one place legal moves are defined.
    pub fn can_become(self, next: Regime) -> bool {
        use Regime::*;
        match (self, next) {
            (Closed, _) => false,
            (_, Closed) => true,
            (Idle, Connecting | UnAuthenticated) => true,
            (Connecting, Connecting | UnAuthenticated) => true,
            (UnAuthenticated, Authenticating) => true,
            (Authenticating, UnAuthenticated | Ready) => true,
            (Ready, Dialing | Busy) => true,
            (Dialing, Ready | Busy) => true,
            (Busy, Ready) => true,
            _ => false,
        }
    }

    /// Authenticated and not torn down.
    pub fn is_established(self) -> bool {
        matches!(self, Regime::Ready | Regime::Dialing | Regime::Busy)
    }
}

impl std::fmt::Display for Regime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Regime::Idle => "idle",
            Regime::Connecting => "connecting",
            Regime::UnAuthenticated => "unauthenticated",
            Regime::Authenticating => "authenticating",
            Regime::Ready => "ready",
            Regime::Dialing => "dialing",
            Regime::Busy => "busy",
            Regime::Closed => "closed",
        };
        f.write_str(name)
    }
}

// ── Tags ──────────────────────────────────────────────────────────────────────

/// Tag generators for one dialer instance.
#[derive(Debug, Default)]
pub struct Tags {
    conns: AtomicU64,
    handoffs: AtomicU64,
    phones: AtomicU64,
}

impl Tags {
    pub fn next_phone(&self) -> u64 {
        self.phones.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn next_conn(&self) -> u64 {
        self.conns.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn next_handoff(&self) -> u64 {
        self.handoffs.fetch_add(1, Ordering::Relaxed) + 1
    }
}

// ── Connection ────────────────────────────────────────────────────────────────

/// An incoming channel negotiated by [`Connection::poll`].
#[derive(Debug)]
pub struct Incoming {
    pub subject: String,
    pub handoff: Handoff,
}

struct DialRequest {
    subject: String,
    reply: oneshot::Sender<Result<Handoff, ConnError>>,
}

struct ConnState {
    regime: Regime,
    remote: Option<PeerId>,
    error: Option<String>,
    tube: Option<Arc<Tube>>,
    transcript: Option<Transcript>,
    handoff: Option<HandoffSnapshot>,
    polling: bool,
}

pub struct Connection {
    tag: u64,
    side: Side,
    me: Weak<Connection>,
    tags: Arc<Tags>,
    orders: OrderSource,
    max_frame_len: usize,
    state: Mutex<ConnState>,
    dial_tx: mpsc::Sender<DialRequest>,
    dial_rx: tokio::sync::Mutex<mpsc::Receiver<DialRequest>>,
    /// Held by the poll loop while negotiating and by the open handoff after.
    line: Arc<Semaphore>,
    closed: CancellationToken,
}

impl Connection {
    pub fn new(side: Side, tags: Arc<Tags>, orders: OrderSource, max_frame_len: usize) -> Arc<Self> {
        let tag = tags.next_conn();
        let (dial_tx, dial_rx) = mpsc::channel(1);
        Arc::new_cyclic(|me| Self {
            tag,
            side,
            me: me.clone(),
            tags,
            orders,
            max_frame_len,
            state: Mutex::new(ConnState {
                regime: Regime::Idle,
                remote: None,
                error: None,
                tube: None,
                transcript: None,
                handoff: None,
                polling: false,
            }),
            dial_tx,
            dial_rx: tokio::sync::Mutex::new(dial_rx),
            line: Arc::new(Semaphore::new(1)),
            closed: CancellationToken::new(),
        })
    }

    fn lock(&self) -> MutexGuard<'_, ConnState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn tag(&self) -> u64 {
        self.tag
    }

    pub fn side(&self) -> Side {
        self.side
    }

    pub fn regime(&self) -> Regime {
        self.lock().regime
    }

    /// Verified identity of the peer, once authenticated.
    pub fn remote(&self) -> Option<PeerId> {
        self.lock().remote
    }

    /// Why the connection died, if it did.
    pub fn error(&self) -> Option<String> {
        self.lock().error.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    pub fn is_polling(&self) -> bool {
        self.lock().polling
    }

    pub fn snapshot(&self) -> ConnectionSnapshot {
        let state = self.lock();
        ConnectionSnapshot {
            tag: self.tag,
            side: self.side,
            regime: state.regime,
            remote: state.remote,
            handoff: state.handoff,
            error: state.error.clone(),
        }
    }

    fn tube(&self) -> Result<Arc<Tube>, ConnError> {
        self.lock().tube.clone().ok_or(ConnError::Closed)
    }

    async fn until_closed<T>(&self, fut: impl Future<Output = T>) -> Result<T, ConnError> {
        tokio::select! {
            biased;
            _ = self.closed.cancelled() => Err(ConnError::Closed),
            out = fut => Ok(out),
        }
    }

    // ── Establishment ─────────────────────────────────────────────────────

    /// Dial `addr` until it answers, backing off between attempts. Every
    /// attempt holds a descriptor permit which, on success, moves into the
    /// tube.
    pub async fn connect(&self, addr: &str, fd: &FdLimiter, settings: &DialerSettings) -> Result<(), ConnError> {
        let mut backoff = Backoff::new(settings.backoff_lo(), settings.backoff_hi(), settings.backoff_ratio);
        loop {
            transition(&mut self.lock(), Regime::Connecting)?;
            match self.until_closed(fd.acquire(settings.fd_wait())).await? {
                Ok(permit) => match self.until_closed(TcpStream::connect(addr)).await? {
                    Ok(stream) => {
                        if let Err(e) = socket2::SockRef::from(&stream).set_keepalive(true) {
                            tracing::debug!(conn = self.tag, error = %e, "keepalive not set");
                        }
                        return self.attach(stream, Some(permit));
                    }
                    Err(e) => {
                        tracing::debug!(conn = self.tag, addr, attempt = backoff.attempt(), error = %e, "connect failed");
                    }
                },
                Err(e) => tracing::warn!(conn = self.tag, addr, error = %e, "connect starved"),
            }
            let delay = backoff.next_delay();
            self.until_closed(tokio::time::sleep(delay)).await?;
        }
    }

    /// Adopt an already open stream (inbound accept, tests).
    pub fn attach(&self, stream: impl RawStream, permit: Option<FdPermit>) -> Result<(), ConnError> {
        let mut state = self.lock();
        transition(&mut state, Regime::UnAuthenticated)?;
        state.tube = Some(Arc::new(Tube::new(stream, self.max_frame_len, permit)));
        Ok(())
    }

    /// Bootstrap session keys and swap build/version announcements.
    pub async fn greet(&self, timeout: Duration) -> Result<Greet, ConnError> {
        let tube = {
            let mut state = self.lock();
            transition(&mut state, Regime::Authenticating)?;
            state.tube.clone().ok_or(ConnError::Closed)?
        };
        let side = self.side;
        let exchange = async {
            let transcript = handshake::hello(&tube, side).await?;
            tube.send_msg(&Greet::local()).await?;
            let theirs: Greet = tube.recv_msg("greet").await?;
            Ok::<_, HandshakeError>((transcript, theirs))
        };
        let (transcript, theirs) = match self.until_closed(tokio::time::timeout(timeout, exchange)).await? {
            Ok(Ok(done)) => done,
            Ok(Err(e)) => return Err(self.kill(e.into())),
            Err(_) => return Err(self.kill(ConnError::Timeout)),
        };
        if theirs.version.get() != PROTOCOL_VERSION {
            return Err(self.kill(ConnError::Incompatible(theirs.version.get())));
        }

        let mut state = self.lock();
        transition(&mut state, Regime::UnAuthenticated)?;
        state.transcript = Some(transcript);
        tracing::debug!(conn = self.tag, build = %theirs.build_str(), "greeted");
        Ok(theirs)
    }

    /// Run `f` (one side of the handshake) over the tube. On success the
    /// connection becomes `Ready`; on failure it is killed.
    pub async fn auth<F, Fut>(&self, timeout: Duration, f: F) -> Result<PeerId, ConnError>
    where
        F: FnOnce(Arc<Tube>, Transcript) -> Fut,
        Fut: Future<Output = Result<PeerId, HandshakeError>>,
    {
        let prepared = {
            let mut state = self.lock();
            let from = state.regime;
            transition(&mut state, Regime::Authenticating)?;
            match (state.tube.clone(), state.transcript) {
                (Some(tube), Some(transcript)) => Ok((tube, transcript)),
                _ => Err(ConnError::Regime { from, to: Regime::Authenticating }),
            }
        };
        let (tube, transcript) = prepared.map_err(|e| self.kill(e))?;

        let remote = match self.until_closed(tokio::time::timeout(timeout, f(tube, transcript))).await? {
            Ok(Ok(remote)) => remote,
            Ok(Err(e)) => return Err(self.kill(e.into())),
            Err(_) => return Err(self.kill(ConnError::Timeout)),
        };

        let mut state = self.lock();
        transition(&mut state, Regime::Ready)?;
        state.remote = Some(remote);
        Ok(remote)
    }

    // ── Multiplexing ──────────────────────────────────────────────────────

    /// Serve this connection until the peer opens a channel. Local dials
    /// queued meanwhile are carried out here as well; they are answered
    /// through their own reply and the loop keeps going.
    ///
    /// Only one poll may run at a time; a second gets `WouldBlock`.
    pub async fn poll(&self) -> Result<Incoming, ConnError> {
        let mut requests = self.dial_rx.try_lock().map_err(|_| ConnError::WouldBlock)?;
        let _polling = Polling::start(self);
        loop {
            let line = self
                .until_closed(self.line.clone().acquire_owned())
                .await?
                .map_err(|_| ConnError::Closed)?;
            let tube = self.tube()?;

            tokio::select! {
                biased;
                _ = self.closed.cancelled() => return Err(ConnError::Closed),
                request = requests.recv() => {
                    let Some(request) = request else {
                        return Err(ConnError::Closed);
                    };
                    if let Some(incoming) = self.place_call(&tube, request, line).await? {
                        return Ok(incoming);
                    }
                }
                frame = tube.recv() => {
                    let frame = frame.map_err(|e| self.kill(e.into()))?;
                    return self.answer_ring(&tube, &mut requests, &frame, line).await;
                }
            }
        }
    }

    /// Our dial won the loop's attention: orient and, if we prevail, open.
    async fn place_call(
        &self,
        tube: &Arc<Tube>,
        request: DialRequest,
        line: OwnedSemaphorePermit,
    ) -> Result<Option<Incoming>, ConnError> {
        let ours = self.orders.next_orient();
        let exchange = async {
            tube.send_msg(&ours).await?;
            tube.recv_msg::<Orient>("orient").await
        };
        let theirs = match exchange.await {
            Ok(theirs) => theirs,
            Err(e) => {
                let _ = request.reply.send(Err(ConnError::Closed));
                return Err(self.kill(e.into()));
            }
        };

        match resolve(&ours, &theirs) {
            Orientation::Opener => {
                if let Err(e) = tube.send(Bytes::from(request.subject.clone().into_bytes())).await {
                    let _ = request.reply.send(Err(ConnError::Closed));
                    return Err(self.kill(e.into()));
                }
                let handoff = match self.open_handoff(tube, ours.session(), line) {
                    Ok(handoff) => handoff,
                    Err(e) => {
                        let _ = request.reply.send(Err(ConnError::Closed));
                        return Err(e);
                    }
                };
                tracing::debug!(
                    conn = self.tag,
                    subject = %request.subject,
                    session = %format_args!("{:016x}", ours.session()),
                    "channel opened"
                );
                if let Err(Ok(mut handoff)) = request.reply.send(Ok(handoff)) {
                    // Nobody is waiting for it any more.
                    tokio::spawn(async move {
                        let _ = handoff.close().await;
                    });
                }
                Ok(None)
            }
            Orientation::Acceptor => {
                let _ = request.reply.send(Err(ConnError::WouldBlock));
                self.receive_call(tube, theirs.session(), line).await.map(Some)
            }
            Orientation::Collision => {
                let _ = request.reply.send(Err(ConnError::WouldBlock));
                transition(&mut self.lock(), Regime::Ready)?;
                Ok(None)
            }
        }
    }

    /// The peer oriented first: echo and take its subject.
    async fn answer_ring(
        &self,
        tube: &Arc<Tube>,
        requests: &mut mpsc::Receiver<DialRequest>,
        frame: &[u8],
        line: OwnedSemaphorePermit,
    ) -> Result<Incoming, ConnError> {
        let theirs: Orient = wire::decode("orient", frame).map_err(|e| self.kill(e.into()))?;
        // Busy from the echo on, so trimming leaves the peer's call alone.
        self.engage(requests)?;
        tube.send_msg(&theirs.echo()).await.map_err(|e| self.kill(e.into()))?;
        self.receive_call(tube, theirs.session(), line).await
    }

    /// Claim the connection for a call the peer started. A dial queued
    /// while the peer was ringing lost the race.
    fn engage(&self, pending: &mut mpsc::Receiver<DialRequest>) -> Result<(), ConnError> {
        let mut state = self.lock();
        while let Ok(request) = pending.try_recv() {
            let _ = request.reply.send(Err(ConnError::WouldBlock));
        }
        transition(&mut state, Regime::Busy)
    }

    async fn receive_call(&self, tube: &Arc<Tube>, session: u64, line: OwnedSemaphorePermit) -> Result<Incoming, ConnError> {
        let frame = tube.recv().await.map_err(|e| self.kill(e.into()))?;
        let subject = wire::decode_subject(&frame).map_err(|e| self.kill(e.into()))?;
        let handoff = self.open_handoff(tube, session, line)?;
        tracing::debug!(
            conn = self.tag,
            subject = %subject,
            session = %format_args!("{session:016x}"),
            "channel accepted"
        );
        Ok(Incoming { subject, handoff })
    }

    fn open_handoff(&self, tube: &Arc<Tube>, session: u64, line: OwnedSemaphorePermit) -> Result<Handoff, ConnError> {
        let tag = self.tags.next_handoff();
        {
            let mut state = self.lock();
            if state.regime != Regime::Busy {
                transition(&mut state, Regime::Busy)?;
            }
            state.handoff = Some(HandoffSnapshot { tag, session });
        }
        Ok(Handoff::new(tag, session, self.me.clone(), tube.clone(), line, self.max_frame_len))
    }

    /// Open a channel named `subject`. Needs a concurrent [`poll`] to carry
    /// it out; without one, or while a channel is open, this is
    /// `WouldBlock`.
    ///
    /// # Panics
    ///
    /// On an empty subject.
    ///
    /// [`poll`]: Connection::poll
    pub async fn dial(&self, subject: &str) -> Result<Handoff, ConnError> {
        assert!(!subject.is_empty(), "dial with an empty subject");
        if subject.len() > MAX_SUBJECT_LEN {
            return Err(WireError::SubjectTooLong(subject.len()).into());
        }
        let (reply, answer) = oneshot::channel();
        {
            let mut state = self.lock();
            match state.regime {
                Regime::Closed => return Err(ConnError::Closed),
                Regime::Ready if state.polling => {}
                _ => return Err(ConnError::WouldBlock),
            }
            transition(&mut state, Regime::Dialing)?;
            let request = DialRequest { subject: subject.to_owned(), reply };
            if self.dial_tx.try_send(request).is_err() {
                transition(&mut state, Regime::Ready)?;
                return Err(ConnError::WouldBlock);
            }
        }
        match self.until_closed(answer).await? {
            Ok(result) => result,
            Err(_) => Err(ConnError::Closed),
        }
    }

    /// Called once by a handoff that closed gracefully.
    pub(crate) fn release_handoff(&self, tag: u64) {
        let mut state = self.lock();
        if state.handoff.map(|h| h.tag) != Some(tag) {
            return;
        }
        state.handoff = None;
        if state.regime == Regime::Busy {
            state.regime = Regime::Ready;
        }
    }

    // ── Teardown ──────────────────────────────────────────────────────────

    /// Tear the connection down and return `err` for propagation. Returns
    /// `Closed` instead if someone else got there first.
    pub fn kill(&self, err: ConnError) -> ConnError {
        if self.shut(self.lock(), &err) {
            tracing::debug!(conn = self.tag, error = %err, "connection killed");
            err
        } else {
            ConnError::Closed
        }
    }

    /// `Err(Closed)` if already closed.
    pub fn close(&self) -> Result<(), ConnError> {
        if self.shut(self.lock(), &ConnError::Closed) {
            Ok(())
        } else {
            Err(ConnError::Closed)
        }
    }

    /// Close only while nothing is in flight.
    pub fn close_if_ready(&self) -> Result<(), ConnError> {
        let state = self.lock();
        match state.regime {
            Regime::Closed => Err(ConnError::Closed),
            Regime::Ready => {
                self.shut(state, &ConnError::Closed);
                Ok(())
            }
            _ => Err(ConnError::WouldBlock),
        }
    }

    fn shut(&self, mut state: MutexGuard<'_, ConnState>, reason: &ConnError) -> bool {
        if state.regime == Regime::Closed {
            return false;
        }
        state.regime = Regime::Closed;
        state.error = Some(reason.to_string());
        state.handoff = None;
        state.transcript = None;
        let tube = state.tube.take();
        drop(state);

        self.closed.cancel();
        self.line.close();
        if let Some(tube) = tube {
            tube.close();
        }
        true
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.closed.cancel();
    }
}

fn transition(state: &mut ConnState, next: Regime) -> Result<(), ConnError> {
    if state.regime == Regime::Closed {
        return Err(ConnError::Closed);
    }
    if !state.regime.can_become(next) {
        return Err(ConnError::Regime { from: state.regime, to: next });
    }
    state.regime = next;
    Ok(())
}

/// Marks the connection as serviced by a poll loop for the guard's life.
struct Polling<'a>(&'a Connection);

impl<'a> Polling<'a> {
    fn start(conn: &'a Connection) -> Self {
        conn.lock().polling = true;
        Self(conn)
    }
}

impl Drop for Polling<'_> {
    fn drop(&mut self) {
        self.0.lock().polling = false;
    }
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum ConnError {
    #[error("connection closed")]
    Closed,
    #[error("would block")]
    WouldBlock,
    #[error("tube: {0}")]
    Tube(#[from] TubeError),
    #[error("handshake: {0}")]
    Handshake(#[from] HandshakeError),
    #[error("protocol violation: {0}")]
    Protocol(#[from] WireError),
    #[error("illegal regime change {from} -> {to}")]
    Regime { from: Regime, to: Regime },
    #[error("peer speaks protocol version {0}")]
    Incompatible(u32),
    #[error("timed out")]
    Timeout,
    #[error("channel failed: {0}")]
    Channel(String),
    #[error("channel abandoned")]
    Abandoned,
}

impl From<ConnError> for io::Error {
    fn from(e: ConnError) -> Self {
        match e {
            ConnError::Tube(e) => e.into(),
            ConnError::Closed => io::Error::new(io::ErrorKind::NotConnected, e),
            ConnError::WouldBlock => io::Error::new(io::ErrorKind::WouldBlock, e),
            ConnError::Timeout => io::Error::new(io::ErrorKind::TimedOut, e),
            ConnError::Protocol(_) | ConnError::Incompatible(_) => io::Error::new(io::ErrorKind::InvalidData, e),
            other => io::Error::new(io::ErrorKind::Other, other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kith_core::crypto::SigningKeyPair;
    use kith_core::identity::{LinkKey, LocalAuth, RemoteAuth};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    const LIMIT: Duration = Duration::from_secs(5);

    fn new_conn(side: Side, orders: OrderSource) -> Arc<Connection> {
        Connection::new(side, Arc::new(Tags::default()), orders, 1024)
    }

    /// A (connector, order 5) and B (acceptor, order 9), both `Ready`.
    async fn ready_pair() -> (Arc<Connection>, Arc<Connection>) {
        let a = new_conn(Side::Connector, OrderSource::Fixed(5));
        let b = new_conn(Side::Acceptor, OrderSource::Fixed(9));
        let (x, y) = tokio::io::duplex(64 * 1024);
        a.attach(x, None).unwrap();
        b.attach(y, None).unwrap();

        let (ga, gb) = tokio::join!(a.greet(LIMIT), b.greet(LIMIT));
        ga.unwrap();
        gb.unwrap();

        let alice = LocalAuth::new(SigningKeyPair::generate());
        let bob = LocalAuth::new(SigningKeyPair::generate());
        let bob_at_alice = RemoteAuth::new(bob.signing().public(), LinkKey(2), LinkKey(1));
        let alice_at_bob = RemoteAuth::new(alice.signing().public(), LinkKey(1), LinkKey(2));

        let (ra, rb) = tokio::join!(
            a.auth(LIMIT, |tube, transcript| async move {
                handshake::connect(&tube, &transcript, &alice, &bob_at_alice).await
            }),
            b.auth(LIMIT, |tube, transcript| async move {
                handshake::accept(&tube, &transcript, &bob, |_| Some(alice_at_bob))
                    .await
                    .map(|(id, _)| id)
            }),
        );
        ra.unwrap();
        rb.unwrap();
        (a, b)
    }

    #[test]
    fn regime_table() {
        use Regime::*;
        assert!(Idle.can_become(Connecting));
        assert!(Connecting.can_become(Connecting));
        assert!(Authenticating.can_become(Ready));
        assert!(Ready.can_become(Dialing));
        assert!(Dialing.can_become(Busy));
        assert!(Busy.can_become(Ready));
        assert!(Busy.can_become(Closed));

        assert!(!Idle.can_become(Ready));
        assert!(!UnAuthenticated.can_become(Ready));
        assert!(!Ready.can_become(Authenticating));
        assert!(!Closed.can_become(Closed));
        assert!(!Closed.can_become(Ready));
    }

    #[tokio::test]
    async fn pair_becomes_ready_with_each_others_ids() {
        let (a, b) = ready_pair().await;
        assert_eq!(a.regime(), Regime::Ready);
        assert_eq!(b.regime(), Regime::Ready);
        assert!(a.remote().is_some());
        assert!(b.remote().is_some());
        assert_ne!(a.remote(), b.remote());
    }

    #[tokio::test]
    async fn dial_without_poll_would_block() {
        let (a, _b) = ready_pair().await;
        assert!(matches!(a.dial("echo").await, Err(ConnError::WouldBlock)));
        assert_eq!(a.regime(), Regime::Ready);
    }

    #[tokio::test]
    async fn greet_rejects_other_protocol_versions() {
        let a = new_conn(Side::Connector, OrderSource::Random);
        let (x, y) = tokio::io::duplex(4096);
        a.attach(x, None).unwrap();

        let rogue = Tube::new(y, 1024, None);
        let peer = async {
            handshake::hello(&rogue, Side::Acceptor).await.unwrap();
            let mut greet = Greet::local();
            greet.version.set(PROTOCOL_VERSION + 1);
            rogue.send_msg(&greet).await.unwrap();
            // Keep our end open until the connection hangs up.
            let _ = rogue.recv().await;
        };
        let (result, ()) = tokio::join!(a.greet(LIMIT), peer);
        assert!(matches!(result, Err(ConnError::Incompatible(v)) if v == PROTOCOL_VERSION + 1));
        assert!(a.is_closed());
    }

    #[tokio::test(flavor = "current_thread")]
    async fn simultaneous_dials_lower_order_opens() {
        let (a, b) = ready_pair().await;

        let (a_poll, b_poll) = (a.clone(), b.clone());
        let a_loop = tokio::spawn(async move { a_poll.poll().await });
        let b_loop = tokio::spawn(async move { b_poll.poll().await });
        while !(a.is_polling() && b.is_polling()) {
            tokio::task::yield_now().await;
        }

        // Both dials are queued before either loop runs again.
        let (da, db) = tokio::join!(a.dial("echo"), b.dial("echo"));
        let mut opened = da.expect("order 5 opens");
        assert!(matches!(db, Err(ConnError::WouldBlock)));

        let Incoming { subject, handoff: mut accepted } = b_loop.await.unwrap().unwrap();
        assert_eq!(subject, "echo");
        assert_eq!(opened.session(), accepted.session());

        opened.write_all(b"hello, world!").await.unwrap();
        let mut buf = [0u8; 13];
        accepted.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello, world!");

        let (ca, cb) = tokio::join!(opened.close(), accepted.close());
        ca.unwrap();
        cb.unwrap();
        assert_eq!(a.regime(), Regime::Ready);
        assert_eq!(b.regime(), Regime::Ready);

        a.close().unwrap();
        assert!(matches!(a_loop.await.unwrap(), Err(ConnError::Closed)));
    }

    #[tokio::test]
    async fn sequential_channels_deliver_exact_payloads() {
        let (a, b) = ready_pair().await;

        let server = {
            let b = b.clone();
            tokio::spawn(async move {
                for round in 0..5u8 {
                    let Incoming { subject, mut handoff } = b.poll().await.unwrap();
                    assert_eq!(subject, format!("round-{round}"));
                    let mut request = vec![0u8; 100 + round as usize];
                    handoff.read_exact(&mut request).await.unwrap();
                    assert!(request.iter().all(|&x| x == round));
                    handoff.write_all(&[round ^ 0xff; 7]).await.unwrap();
                    handoff.close().await.unwrap();
                }
            })
        };

        let poller = {
            let a = a.clone();
            tokio::spawn(async move { a.poll().await })
        };

        for round in 0..5u8 {
            let mut handoff = loop {
                match a.dial(&format!("round-{round}")).await {
                    Ok(handoff) => break handoff,
                    Err(ConnError::WouldBlock) => tokio::task::yield_now().await,
                    Err(e) => panic!("dial failed: {e}"),
                }
            };
            handoff.write_all(&vec![round; 100 + round as usize]).await.unwrap();
            let mut reply = Vec::new();
            handoff.read_to_end(&mut reply).await.unwrap();
            assert_eq!(reply, vec![round ^ 0xff; 7]);
            handoff.close().await.unwrap();
        }

        server.await.unwrap();
        assert_eq!(a.regime(), Regime::Ready);
        a.close().unwrap();
        assert!(poller.await.unwrap().is_err());
    }

    #[tokio::test]
    async fn close_is_idempotent_and_releases_the_permit() {
        let fd = FdLimiter::new(1);
        let permit = fd.acquire(LIMIT).await.unwrap();
        let conn = new_conn(Side::Connector, OrderSource::Random);
        let (x, _y) = tokio::io::duplex(64);
        conn.attach(x, Some(permit)).unwrap();
        assert_eq!(fd.in_use(), 1);

        conn.close().unwrap();
        assert_eq!(fd.in_use(), 0);
        assert!(matches!(conn.close(), Err(ConnError::Closed)));
        assert!(matches!(conn.close_if_ready(), Err(ConnError::Closed)));
        assert_eq!(conn.regime(), Regime::Closed);
        assert_eq!(fd.in_use(), 0);
    }

    #[tokio::test]
    async fn close_if_ready_spares_busy_connections() {
        let (a, b) = ready_pair().await;
        let b_loop = {
            let b = b.clone();
            tokio::spawn(async move { b.poll().await })
        };
        let a_loop = {
            let a = a.clone();
            tokio::spawn(async move { a.poll().await })
        };
        while !a.is_polling() {
            tokio::task::yield_now().await;
        }
        let mut opened = a.dial("busy").await.unwrap();
        let incoming = b_loop.await.unwrap().unwrap();

        assert_eq!(a.regime(), Regime::Busy);
        assert!(matches!(a.close_if_ready(), Err(ConnError::WouldBlock)));

        // Dropping an open handoff kills the link under it.
        drop(incoming);
        let mut buf = [0u8; 1];
        assert!(opened.read(&mut buf).await.is_err());
        assert!(a.is_closed());
        assert!(a_loop.await.unwrap().is_err());
    }

    #[tokio::test]
    async fn answered_ring_is_not_trimmed_while_the_subject_is_pending() {
        let (a, b) = ready_pair().await;
        let b_loop = {
            let b = b.clone();
            tokio::spawn(async move { b.poll().await })
        };
        while !b.is_polling() {
            tokio::task::yield_now().await;
        }

        // Ring b by hand and hold back the subject.
        let tube = a.tube().unwrap();
        let ours = OrderSource::Random.next_orient();
        tube.send_msg(&ours).await.unwrap();
        let echo: Orient = tube.recv_msg("orient").await.unwrap();
        assert_eq!(echo, ours.echo());

        assert_eq!(b.regime(), Regime::Busy);
        assert!(matches!(b.close_if_ready(), Err(ConnError::WouldBlock)));
        assert!(matches!(b.dial("late").await, Err(ConnError::WouldBlock)));

        tube.send(Bytes::from_static(b"held")).await.unwrap();
        let Incoming { subject, handoff } = b_loop.await.unwrap().unwrap();
        assert_eq!(subject, "held");
        assert_eq!(handoff.session(), ours.session());
        assert!(!b.is_closed());
        a.close().unwrap();
    }

    #[tokio::test]
    async fn kill_wakes_a_pending_dial() {
        let (a, _b) = ready_pair().await;
        let poller = {
            let a = a.clone();
            tokio::spawn(async move { a.poll().await })
        };
        while !a.is_polling() {
            tokio::task::yield_now().await;
        }
        // B never answers the orient, so the dial stays pending.
        let dialing = {
            let a = a.clone();
            tokio::spawn(async move { a.dial("stuck").await })
        };
        while a.regime() != Regime::Dialing {
            tokio::task::yield_now().await;
        }
        a.kill(ConnError::Timeout);
        assert!(matches!(dialing.await.unwrap(), Err(ConnError::Closed)));
        assert!(poller.await.unwrap().is_err());
        assert_eq!(a.error().as_deref(), Some("timed out"));
    }
}
