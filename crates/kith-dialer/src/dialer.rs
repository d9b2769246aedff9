//! Dialer: the registry of friends and the front door for channels.
//!
//! Owns the listening socket, one [`Telephone`] per friend (indexed by
//! identity and by the accept key we issued them), the descriptor limiter
//! every socket draws from, and the table of pending [`Dialer::accept`]
//! calls keyed by subject.
//!
//! Lock order is dialer, then telephone, then connection. Nothing that runs
//! under a connection or telephone lock reaches back up into the dialer.

use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::runtime::Handle;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use kith_core::config::DialerSettings;
use kith_core::identity::{AcceptKey, LocalAuth, PeerId, RemoteAuth};

use crate::conn::{ConnError, Connection, Incoming, Tags};
use crate::fdlimit::{FdError, FdLimiter, FdPermit};
use crate::handoff::Handoff;
use crate::handshake::{self, Side};
use crate::orient::OrderSource;
use crate::snapshot::{DialerSnapshot, Presence, StatusUpdate};
use crate::stream::PeerStream;
use crate::telephone::Telephone;

/// How long the listener waits for a descriptor before warning.
const LISTEN_FD_WAIT: Duration = Duration::from_secs(10);

/// Pause after a failed `accept(2)`.
const ACCEPT_ERROR_PAUSE: Duration = Duration::from_secs(1);

/// An incoming channel on its way to an `accept` caller.
struct Ring {
    id: PeerId,
    handoff: Handoff,
    tel: Weak<Telephone>,
}

#[derive(Default)]
struct HubState {
    tels: HashMap<PeerId, Arc<Telephone>>,
    by_accept_key: HashMap<AcceptKey, Arc<Telephone>>,
    unauthed: HashMap<u64, Arc<Connection>>,
    listens: HashMap<String, oneshot::Sender<Ring>>,
}

/// State shared by the dialer handle, its telephones, and background tasks.
pub(crate) struct Hub {
    pub(crate) local: LocalAuth,
    pub(crate) settings: DialerSettings,
    pub(crate) fd: FdLimiter,
    pub(crate) tags: Arc<Tags>,
    pub(crate) runtime: Handle,
    pub(crate) shutdown: CancellationToken,
    local_addr: SocketAddr,
    state: Mutex<HubState>,
    arrivals_tx: mpsc::Sender<PeerId>,
    arrivals_rx: tokio::sync::Mutex<mpsc::Receiver<PeerId>>,
    statuses_tx: mpsc::Sender<StatusUpdate>,
    statuses_rx: tokio::sync::Mutex<mpsc::Receiver<StatusUpdate>>,
}

impl Hub {
    fn lock(&self) -> MutexGuard<'_, HubState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn telephone(&self, id: PeerId) -> Option<Arc<Telephone>> {
        self.lock().tels.get(&id).cloned()
    }

    pub(crate) fn announce_arrival(&self, id: PeerId) {
        if self.arrivals_tx.try_send(id).is_err() {
            tracing::trace!(peer = %id, "arrival queue full");
        }
    }

    pub(crate) fn announce_status(&self, id: PeerId, online: bool) {
        if self.statuses_tx.try_send(StatusUpdate { id, online }).is_err() {
            tracing::warn!(peer = %id, online, "status queue full, update dropped");
        }
    }

    /// Route an incoming channel to whoever accepts its subject. Channels
    /// nobody waits for are closed gracefully.
    pub(crate) fn receive(&self, id: PeerId, incoming: Incoming, tel: &Arc<Telephone>) {
        let Incoming { subject, handoff } = incoming;
        let waiter = self.lock().listens.remove(&subject);
        let ring = Ring {
            id,
            handoff,
            tel: Arc::downgrade(tel),
        };
        let unclaimed = match waiter {
            Some(waiter) => waiter.send(ring).err(),
            None => Some(ring),
        };
        if let Some(ring) = unclaimed {
            tracing::debug!(peer = %id, subject = %subject, "no listener for subject");
            let mut handoff = ring.handoff;
            self.runtime.spawn(async move {
                let _ = handoff.close().await;
            });
        }
    }

    // ── Inbound ───────────────────────────────────────────────────────────

    async fn listen(self: Arc<Self>, listener: TcpListener) {
        loop {
            let permit = tokio::select! {
                _ = self.shutdown.cancelled() => return,
                permit = self.fd.acquire(LISTEN_FD_WAIT) => permit,
            };
            let permit = match permit {
                Ok(permit) => permit,
                Err(FdError::Starved(_)) => {
                    tracing::warn!(in_use = self.fd.in_use(), "file descriptor starvation");
                    continue;
                }
                Err(FdError::Closed) => return,
            };
            let accepted = tokio::select! {
                _ = self.shutdown.cancelled() => return,
                accepted = listener.accept() => accepted,
            };
            match accepted {
                Ok((stream, from)) => {
                    self.runtime.spawn(self.clone().inbound(stream, permit, from));
                }
                Err(e) => {
                    tracing::warn!(error = %e, "accept failed");
                    drop(permit);
                    tokio::select! {
                        _ = self.shutdown.cancelled() => return,
                        _ = tokio::time::sleep(ACCEPT_ERROR_PAUSE) => {}
                    }
                }
            }
        }
    }

    async fn inbound(self: Arc<Self>, stream: TcpStream, permit: FdPermit, from: SocketAddr) {
        if let Err(e) = socket2::SockRef::from(&stream).set_keepalive(true) {
            tracing::debug!(%from, error = %e, "keepalive not set");
        }
        let conn = Connection::new(
            Side::Acceptor,
            self.tags.clone(),
            OrderSource::default(),
            self.settings.max_frame_len,
        );
        if conn.attach(stream, Some(permit)).is_err() {
            return;
        }
        self.lock().unauthed.insert(conn.tag(), conn.clone());
        let result = self.authenticate(&conn).await;
        self.lock().unauthed.remove(&conn.tag());

        let (id, tel) = match result {
            Ok(found) => found,
            Err(e) => {
                tracing::debug!(%from, conn = conn.tag(), error = %e, "inbound handshake failed");
                let _ = conn.close();
                return;
            }
        };

        // Revoke and re-add during the handshake leaves stale credentials.
        let current = self.telephone(id).is_some_and(|t| Arc::ptr_eq(&t, &tel));
        if !current {
            tracing::debug!(peer = %id, conn = conn.tag(), "friend changed during handshake, dropping");
            let _ = conn.close();
            return;
        }
        tracing::debug!(peer = %id, %from, conn = conn.tag(), "inbound connection ready");
        tel.adopt(self.clone(), conn).await;
    }

    async fn authenticate(&self, conn: &Connection) -> Result<(PeerId, Arc<Telephone>), ConnError> {
        let timeout = self.settings.handshake_timeout();
        conn.greet(timeout).await?;

        let local = self.local.clone();
        let mut matched: Option<Arc<Telephone>> = None;
        let found = &mut matched;
        let id = conn
            .auth(timeout, |tube, transcript| async move {
                handshake::accept(&tube, &transcript, &local, |key| {
                    let tel = self.lock().by_accept_key.get(&key).cloned()?;
                    let remote: RemoteAuth = tel.remote().clone();
                    *found = Some(tel);
                    Some(remote)
                })
                .await
                .map(|(id, _)| id)
            })
            .await?;
        let tel = matched.ok_or(ConnError::Closed)?;
        Ok((id, tel))
    }
}

// ── Dialer ────────────────────────────────────────────────────────────────────

/// Handle to a running dialer. Dropping it shuts the dialer down.
pub struct Dialer {
    hub: Arc<Hub>,
}

impl Dialer {
    /// Listen on `addr` and start accepting friends' connections.
    pub async fn bind(
        local: LocalAuth,
        settings: DialerSettings,
        addr: &str,
        fd_limit: usize,
    ) -> Result<Self, DialerError> {
        let listener = TcpListener::bind(addr).await.map_err(|source| DialerError::Bind {
            addr: addr.to_owned(),
            source,
        })?;
        let local_addr = listener.local_addr()?;
        let capacity = settings.notify_capacity.max(1);
        let (arrivals_tx, arrivals_rx) = mpsc::channel(capacity);
        let (statuses_tx, statuses_rx) = mpsc::channel(capacity);

        let hub = Arc::new(Hub {
            local,
            settings,
            fd: FdLimiter::new(fd_limit),
            tags: Arc::new(Tags::default()),
            runtime: Handle::current(),
            shutdown: CancellationToken::new(),
            local_addr,
            state: Mutex::new(HubState::default()),
            arrivals_tx,
            arrivals_rx: tokio::sync::Mutex::new(arrivals_rx),
            statuses_tx,
            statuses_rx: tokio::sync::Mutex::new(statuses_rx),
        });
        tracing::info!(id = %hub.local.id(), addr = %local_addr, fd_limit, "dialer listening");
        hub.runtime.spawn(hub.clone().listen(listener));
        Ok(Self { hub })
    }

    pub fn id(&self) -> PeerId {
        self.hub.local.id()
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.hub.local_addr
    }

    /// Register a friend. A friend already present is left untouched.
    pub fn add(&self, remote: RemoteAuth, addr: Option<String>) {
        let id = remote.id();
        let tel = {
            let mut state = self.hub.lock();
            if state.tels.contains_key(&id) {
                return;
            }
            let tel = Telephone::new(self.hub.tags.next_phone(), remote, addr, &self.hub);
            state.tels.insert(id, tel.clone());
            state.by_accept_key.insert(tel.remote().accept_key, tel.clone());
            tel
        };
        tracing::info!(peer = %id, reachable = tel.presence().reachable, "friend added");
        tel.rebalance();
    }

    /// Forget a friend and drop every connection to them.
    pub fn revoke(&self, id: PeerId) {
        let tel = {
            let mut state = self.hub.lock();
            let Some(tel) = state.tels.remove(&id) else {
                return;
            };
            state.by_accept_key.remove(&tel.remote().accept_key);
            tel
        };
        tracing::info!(peer = %id, "friend revoked");
        tel.kill();
    }

    /// Point a friend at a new address.
    pub fn update(&self, id: PeerId, addr: impl Into<String>) {
        if let Some(tel) = self.hub.telephone(id) {
            tel.update(addr.into());
        }
    }

    /// Open a channel named `subject` to `id`.
    ///
    /// # Panics
    ///
    /// On an empty subject.
    pub async fn dial(&self, id: PeerId, subject: &str) -> Result<PeerStream, DialerError> {
        assert!(!subject.is_empty(), "dial with an empty subject");
        if self.hub.shutdown.is_cancelled() {
            return Err(DialerError::Shutdown);
        }
        let tel = self.hub.telephone(id).ok_or(DialerError::UnknownPeer(id))?;
        let handoff = tel.dial(subject).await?;
        Ok(PeerStream::new(handoff, self.id(), id, Arc::downgrade(&tel)))
    }

    /// Wait for a friend to open a channel named `subject`.
    ///
    /// # Panics
    ///
    /// If another `accept` for the same subject is still waiting.
    pub async fn accept(&self, subject: &str) -> Result<(PeerId, PeerStream), DialerError> {
        let (tx, rx) = oneshot::channel();
        {
            let mut state = self.hub.lock();
            if let Some(waiting) = state.listens.get(subject) {
                assert!(waiting.is_closed(), "duplicate accept for subject {subject:?}");
            }
            state.listens.insert(subject.to_owned(), tx);
        }
        let ring = tokio::select! {
            _ = self.hub.shutdown.cancelled() => return Err(DialerError::Shutdown),
            ring = rx => ring.map_err(|_| DialerError::Shutdown)?,
        };
        let stream = PeerStream::new(ring.handoff, self.id(), ring.id, ring.tel);
        Ok((ring.id, stream))
    }

    /// Next friend whose connection joined a pool. `None` after shutdown.
    pub async fn wait_for_arrival(&self) -> Option<PeerId> {
        let mut rx = self.hub.arrivals_rx.lock().await;
        tokio::select! {
            biased;
            _ = self.hub.shutdown.cancelled() => None,
            id = rx.recv() => id,
        }
    }

    /// Next presence flip. `None` after shutdown.
    pub async fn wait_for_status(&self) -> Option<StatusUpdate> {
        let mut rx = self.hub.statuses_rx.lock().await;
        tokio::select! {
            biased;
            _ = self.hub.shutdown.cancelled() => None,
            update = rx.recv() => update,
        }
    }

    pub fn presence(&self, id: PeerId) -> Option<Presence> {
        self.hub.telephone(id).map(|tel| tel.presence())
    }

    pub fn snapshot(&self) -> DialerSnapshot {
        let (mut tels, unauthed, mut waiting) = {
            let state = self.hub.lock();
            (
                state.tels.values().cloned().collect::<Vec<_>>(),
                state.unauthed.values().cloned().collect::<Vec<_>>(),
                state
                    .listens
                    .iter()
                    .filter(|(_, tx)| !tx.is_closed())
                    .map(|(subject, _)| subject.clone())
                    .collect::<Vec<_>>(),
            )
        };
        tels.sort_by_key(|t| t.id());
        waiting.sort();
        DialerSnapshot {
            id: self.id(),
            local_addr: Some(self.hub.local_addr.to_string()),
            fd_in_use: self.hub.fd.in_use(),
            fd_limit: self.hub.fd.limit(),
            waiting,
            unauthenticated: unauthed.iter().map(|c| c.snapshot()).collect(),
            telephones: tels.iter().map(|t| t.snapshot()).collect(),
        }
    }

    /// Stop listening and close every connection. Idempotent.
    pub fn shutdown(&self) {
        if self.hub.shutdown.is_cancelled() {
            return;
        }
        self.hub.shutdown.cancel();
        let (tels, unauthed) = {
            let mut state = self.hub.lock();
            state.by_accept_key.clear();
            state.listens.clear();
            (
                state.tels.drain().map(|(_, t)| t).collect::<Vec<_>>(),
                state.unauthed.drain().map(|(_, c)| c).collect::<Vec<_>>(),
            )
        };
        for tel in tels {
            tel.kill();
        }
        for conn in unauthed {
            let _ = conn.close();
        }
        self.hub.fd.close();
        tracing::info!(id = %self.id(), "dialer shut down");
    }
}

impl Drop for Dialer {
    fn drop(&mut self) {
        self.shutdown();
    }
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum DialerError {
    #[error("bind {addr}: {source}")]
    Bind { addr: String, source: io::Error },
    #[error("i/o: {0}")]
    Io(#[from] io::Error),
    #[error("unknown peer {0}")]
    UnknownPeer(PeerId),
    #[error("peer {0} unreachable")]
    Unreachable(PeerId),
    #[error("dialer shut down")]
    Shutdown,
    #[error("connection: {0}")]
    Conn(#[from] ConnError),
}
