//! Telephone: the pool of physical connections to one friend.
//!
//! A telephone keeps `pool_target` outbound connections warm while the friend
//! is reachable, takes any number of inbound ones, and trims idle surplus
//! once the established count passes twice the target. Every connection it
//! owns runs a [`register`](Telephone::register) loop that polls for incoming
//! channels and hands them to the dialer.
//!
//! Connections move from `authing` to `conns` exactly once. Presence is
//! recomputed on every rebalance and announced only when it flips.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use kith_core::identity::{PeerId, RemoteAuth};
use kith_core::uptime::Uptime;

use crate::conn::{ConnError, Connection, Regime};
use crate::dialer::{DialerError, Hub};
use crate::handoff::Handoff;
use crate::handshake::{self, Side};
use crate::orient::OrderSource;
use crate::snapshot::{Presence, TelephoneSnapshot};

struct TelState {
    addr: Option<String>,
    reachable: bool,
    /// Up exactly when the last announced presence was online.
    uptime: Uptime,
    authing: HashMap<u64, Arc<Connection>>,
    conns: BTreeMap<u64, Arc<Connection>>,
    cursor: usize,
    auth_failures: u64,
    last_error: Option<String>,
    killed: bool,
}

impl TelState {
    fn presence(&self) -> Presence {
        Presence {
            maybe_online: self.uptime.is_up(),
            reachable: self.reachable,
            rating: self.uptime.rating(),
            uptime_secs: self.uptime.uptime().as_secs(),
            downtime_secs: self.uptime.downtime().as_secs(),
        }
    }
}

pub struct Telephone {
    tag: u64,
    remote: RemoteAuth,
    me: Weak<Telephone>,
    hub: Weak<Hub>,
    state: Mutex<TelState>,
}

impl Telephone {
    pub(crate) fn new(tag: u64, remote: RemoteAuth, addr: Option<String>, hub: &Arc<Hub>) -> Arc<Self> {
        let settings = &hub.settings;
        Arc::new_cyclic(|me| Self {
            tag,
            remote,
            me: me.clone(),
            hub: Arc::downgrade(hub),
            state: Mutex::new(TelState {
                reachable: addr.is_some(),
                addr,
                uptime: Uptime::new(settings.rating_halflife(), settings.rating_bound),
                authing: HashMap::new(),
                conns: BTreeMap::new(),
                cursor: 0,
                auth_failures: 0,
                last_error: None,
                killed: false,
            }),
        })
    }

    fn lock(&self) -> MutexGuard<'_, TelState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn id(&self) -> PeerId {
        self.remote.id()
    }

    pub fn remote(&self) -> &RemoteAuth {
        &self.remote
    }

    pub fn presence(&self) -> Presence {
        self.lock().presence()
    }

    pub fn snapshot(&self) -> TelephoneSnapshot {
        let (addr, presence, auth_failures, last_error, authing, conns) = {
            let state = self.lock();
            (
                state.addr.clone(),
                state.presence(),
                state.auth_failures,
                state.last_error.clone(),
                state.authing.values().cloned().collect::<Vec<_>>(),
                state.conns.values().cloned().collect::<Vec<_>>(),
            )
        };
        let mut connecting: Vec<_> = authing.iter().map(|c| c.snapshot()).collect();
        connecting.sort_by_key(|c| c.tag);
        TelephoneSnapshot {
            id: self.id(),
            tag: self.tag,
            addr,
            presence,
            auth_failures,
            last_error,
            connecting,
            established: conns.iter().map(|c| c.snapshot()).collect(),
        }
    }

    /// New dial target; the friend is considered reachable again. Attempts
    /// still retrying the old address are abandoned so the pool redials.
    pub(crate) fn update(&self, addr: String) {
        let stale: Vec<Arc<Connection>> = {
            let mut state = self.lock();
            state.addr = Some(addr);
            state.reachable = true;
            let stale: Vec<u64> = state
                .authing
                .iter()
                .filter(|(_, conn)| matches!(conn.regime(), Regime::Idle | Regime::Connecting))
                .map(|(tag, _)| *tag)
                .collect();
            stale.iter().filter_map(|tag| state.authing.remove(tag)).collect()
        };
        for conn in stale {
            tracing::debug!(peer = %self.id(), conn = conn.tag(), "dropping attempt on the old address");
            let _ = conn.close();
        }
        self.rebalance();
    }

    /// Close every connection and refuse new ones.
    pub(crate) fn kill(&self) {
        let doomed: Vec<Arc<Connection>> = {
            let mut state = self.lock();
            state.killed = true;
            let authing = std::mem::take(&mut state.authing);
            let conns = std::mem::take(&mut state.conns);
            authing.into_values().chain(conns.into_values()).collect()
        };
        for conn in doomed {
            let _ = conn.close();
        }
    }

    // ── Pool maintenance ──────────────────────────────────────────────────

    /// Top the pool up, trim surplus, and re-derive presence.
    pub fn rebalance(&self) {
        let Some(hub) = self.hub.upgrade() else {
            return;
        };
        let Some(me) = self.me.upgrade() else {
            return;
        };
        let target = hub.settings.pool_target;

        let mut dials = Vec::new();
        let flipped = {
            let mut state = self.lock();
            if state.killed {
                return;
            }
            state.conns.retain(|_, conn| !conn.is_closed());

            let ready = count(&state.conns, |r| r == Regime::Ready);
            let short = target.saturating_sub(state.authing.len() + ready);
            if short > 0 && state.reachable {
                if let Some(addr) = state.addr.clone() {
                    for _ in 0..short {
                        let conn = Connection::new(
                            Side::Connector,
                            hub.tags.clone(),
                            OrderSource::default(),
                            hub.settings.max_frame_len,
                        );
                        state.authing.insert(conn.tag(), conn.clone());
                        dials.push((conn, addr.clone()));
                    }
                }
            }

            if ready > 2 * target {
                let mut surplus = ready - 2 * target;
                for conn in state.conns.values() {
                    if surplus == 0 {
                        break;
                    }
                    if conn.close_if_ready().is_ok() {
                        surplus -= 1;
                    }
                }
                state.conns.retain(|_, conn| !conn.is_closed());
            }

            let online = count(&state.conns, Regime::is_established) > 0;
            if online != state.uptime.is_up() {
                if online {
                    state.uptime.up();
                } else {
                    state.uptime.down();
                }
                Some(online)
            } else {
                None
            }
        };

        for (conn, addr) in dials {
            hub.runtime.spawn(me.clone().dial_out(hub.clone(), conn, addr));
        }
        if let Some(online) = flipped {
            tracing::info!(peer = %self.id(), online, "presence changed");
            hub.announce_status(self.id(), online);
        }
    }

    async fn dial_out(self: Arc<Self>, hub: Arc<Hub>, conn: Arc<Connection>, addr: String) {
        match self.establish(&hub, &conn, &addr).await {
            Ok(id) => {
                let kept = {
                    let mut state = self.lock();
                    state.authing.remove(&conn.tag());
                    if !state.killed {
                        state.conns.insert(conn.tag(), conn.clone());
                    }
                    !state.killed
                };
                if !kept {
                    let _ = conn.close();
                    return;
                }
                tracing::debug!(peer = %id, conn = conn.tag(), addr = %addr, "outbound connection ready");
                self.register(hub, conn).await;
            }
            Err(ConnError::Closed) => {
                self.lock().authing.remove(&conn.tag());
            }
            Err(e) => {
                tracing::warn!(peer = %self.id(), conn = conn.tag(), error = %e, "authentication failed");
                {
                    let mut state = self.lock();
                    state.auth_failures += 1;
                    state.last_error = Some(e.to_string());
                }
                // The slot stays taken for the pause so rebalancing cannot spin.
                tokio::select! {
                    _ = hub.shutdown.cancelled() => {}
                    _ = tokio::time::sleep(hub.settings.auth_retry()) => {}
                }
                self.lock().authing.remove(&conn.tag());
                self.rebalance();
            }
        }
    }

    async fn establish(&self, hub: &Hub, conn: &Connection, addr: &str) -> Result<PeerId, ConnError> {
        let timeout = hub.settings.handshake_timeout();
        conn.connect(addr, &hub.fd, &hub.settings).await?;
        conn.greet(timeout).await?;
        // Credentials are copied out here; nothing below may reach back into
        // the dialer while the connection runs the handshake.
        let local = hub.local.clone();
        let remote = self.remote.clone();
        conn.auth(timeout, |tube, transcript| async move {
            handshake::connect(&tube, &transcript, &local, &remote).await
        })
        .await
    }

    /// Take an authenticated inbound connection into the pool.
    pub(crate) async fn adopt(self: Arc<Self>, hub: Arc<Hub>, conn: Arc<Connection>) {
        let kept = {
            let mut state = self.lock();
            if !state.killed {
                state.conns.insert(conn.tag(), conn.clone());
            }
            !state.killed
        };
        if !kept {
            let _ = conn.close();
            return;
        }
        self.register(hub, conn).await;
    }

    /// Serve one established connection until it dies.
    async fn register(self: Arc<Self>, hub: Arc<Hub>, conn: Arc<Connection>) {
        hub.announce_arrival(self.id());
        self.rebalance();
        loop {
            match conn.poll().await {
                Ok(incoming) => {
                    self.rebalance();
                    hub.receive(self.id(), incoming, &self);
                }
                Err(e) => {
                    tracing::debug!(peer = %self.id(), conn = conn.tag(), error = %e, "connection left the pool");
                    break;
                }
            }
        }
        let _ = conn.close();
        self.lock().conns.remove(&conn.tag());
        self.rebalance();
    }

    // ── Dialing ───────────────────────────────────────────────────────────

    /// Open a channel on whichever pooled connection takes it, waiting for
    /// the pool to refill between rounds.
    pub(crate) async fn dial(&self, subject: &str) -> Result<Handoff, DialerError> {
        let Some(hub) = self.hub.upgrade() else {
            return Err(DialerError::Shutdown);
        };
        for round in 0..hub.settings.max_dial_tries {
            let conns: Vec<Arc<Connection>> = {
                let mut state = self.lock();
                if state.killed {
                    return Err(DialerError::UnknownPeer(self.id()));
                }
                let mut conns: Vec<_> = state.conns.values().cloned().collect();
                if !conns.is_empty() {
                    let start = state.cursor % conns.len();
                    conns.rotate_left(start);
                    state.cursor = state.cursor.wrapping_add(1);
                }
                conns
            };

            for conn in conns {
                match conn.dial(subject).await {
                    Ok(handoff) => {
                        self.rebalance();
                        return Ok(handoff);
                    }
                    Err(ConnError::WouldBlock) => {}
                    Err(e @ ConnError::Protocol(_)) => return Err(e.into()),
                    Err(e) => {
                        tracing::debug!(peer = %self.id(), conn = conn.tag(), error = %e, "dial failed");
                    }
                }
                if conn.is_closed() {
                    self.lock().conns.remove(&conn.tag());
                }
            }

            tracing::trace!(peer = %self.id(), round, "no connection free, waiting for the pool");
            tokio::select! {
                _ = hub.shutdown.cancelled() => return Err(DialerError::Shutdown),
                _ = tokio::time::sleep(hub.settings.replenish_wait()) => {}
            }
        }
        Err(DialerError::Unreachable(self.id()))
    }
}

fn count(conns: &BTreeMap<u64, Arc<Connection>>, pred: impl Fn(Regime) -> bool) -> usize {
    conns.values().filter(|c| pred(c.regime())).count()
}
