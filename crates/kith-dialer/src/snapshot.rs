//! Serialisable views of dialer state, for status dumps and tests.

use serde::{Serialize, Serializer};

use kith_core::identity::PeerId;

use crate::conn::Regime;
use crate::handshake::Side;

fn hex_u64<S: Serializer>(v: &u64, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_str(&format!("{v:016x}"))
}

fn hex_peer<S: Serializer>(id: &PeerId, s: S) -> Result<S::Ok, S::Error> {
    hex_u64(&id.0, s)
}

fn hex_peer_opt<S: Serializer>(id: &Option<PeerId>, s: S) -> Result<S::Ok, S::Error> {
    match id {
        Some(id) => hex_peer(id, s),
        None => s.serialize_none(),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct HandoffSnapshot {
    pub tag: u64,
    #[serde(serialize_with = "hex_u64")]
    pub session: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ConnectionSnapshot {
    pub tag: u64,
    pub side: Side,
    pub regime: Regime,
    #[serde(serialize_with = "hex_peer_opt")]
    pub remote: Option<PeerId>,
    pub handoff: Option<HandoffSnapshot>,
    pub error: Option<String>,
}

/// What we believe about a friend's availability.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Presence {
    pub maybe_online: bool,
    /// We know an address to dial.
    pub reachable: bool,
    pub rating: f64,
    /// Length of the current online stretch; zero while offline.
    pub uptime_secs: u64,
    /// Length of the current offline stretch; zero while online or before
    /// the friend was ever seen.
    pub downtime_secs: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct TelephoneSnapshot {
    #[serde(serialize_with = "hex_peer")]
    pub id: PeerId,
    pub tag: u64,
    pub addr: Option<String>,
    pub presence: Presence,
    pub auth_failures: u64,
    pub last_error: Option<String>,
    pub connecting: Vec<ConnectionSnapshot>,
    pub established: Vec<ConnectionSnapshot>,
}

#[derive(Debug, Clone, Serialize)]
pub struct DialerSnapshot {
    #[serde(serialize_with = "hex_peer")]
    pub id: PeerId,
    pub local_addr: Option<String>,
    pub fd_in_use: usize,
    pub fd_limit: usize,
    /// Subjects with a pending accept.
    pub waiting: Vec<String>,
    pub unauthenticated: Vec<ConnectionSnapshot>,
    pub telephones: Vec<TelephoneSnapshot>,
}

/// A friend went online or offline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StatusUpdate {
    #[serde(serialize_with = "hex_peer")]
    pub id: PeerId,
    pub online: bool,
}
