//! Kith integration test harness.
//!
//! Every test runs two or more dialers in-process over loopback TCP, each
//! bound to an ephemeral port. Settings are shrunk so pools fill and
//! retries fire in milliseconds.
//!
//!   cargo test --test integration

use std::time::{Duration, Instant};

use kith_core::crypto::SigningKeyPair;
use kith_core::config::DialerSettings;
use kith_core::identity::{LinkKey, LocalAuth, PeerId, RemoteAuth};
use kith_dialer::{Dialer, TelephoneSnapshot};

mod channels;
mod failures;
mod pool;
mod presence;
mod status;

// ── Harness ───────────────────────────────────────────────────────────────────

pub const POOL_TARGET: usize = 2;

pub fn settings() -> DialerSettings {
    DialerSettings {
        pool_target: POOL_TARGET,
        max_dial_tries: 40,
        replenish_wait_ms: 50,
        fd_wait_ms: 1_000,
        handshake_timeout_ms: 5_000,
        backoff_lo_ms: 20,
        backoff_hi_ms: 200,
        auth_retry_ms: 100,
        ..DialerSettings::default()
    }
}

pub struct Node {
    pub auth: LocalAuth,
    pub dialer: Dialer,
}

impl Node {
    pub fn id(&self) -> PeerId {
        self.auth.id()
    }

    pub fn addr(&self) -> String {
        self.dialer.local_addr().to_string()
    }

    /// This node's view of `friend`'s pool.
    pub fn phone(&self, friend: PeerId) -> Option<TelephoneSnapshot> {
        self.dialer
            .snapshot()
            .telephones
            .into_iter()
            .find(|t| t.id == friend)
    }
}

pub async fn node() -> Node {
    node_with(settings()).await
}

pub async fn node_with(settings: DialerSettings) -> Node {
    let auth = LocalAuth::new(SigningKeyPair::generate());
    let dialer = Dialer::bind(auth.clone(), settings, "127.0.0.1:0", 64)
        .await
        .expect("dialer should bind to loopback");
    Node { auth, dialer }
}

/// The two halves of a friendship: how `a` knows `b`, and how `b` knows `a`.
pub struct Friendship {
    pub b_at_a: RemoteAuth,
    pub a_at_b: RemoteAuth,
}

/// Exchange keys between `a` and `b` without registering anything.
pub fn introduce(a: &Node, b: &Node) -> Friendship {
    // Each side issues the key the other presents when dialing it.
    let issued_by_a = LinkKey::generate();
    let issued_by_b = LinkKey::generate();
    Friendship {
        b_at_a: RemoteAuth::new(b.auth.signing().public(), issued_by_b, issued_by_a),
        a_at_b: RemoteAuth::new(a.auth.signing().public(), issued_by_a, issued_by_b),
    }
}

/// Make `a` and `b` friends. Only `a` learns an address, so all
/// connections are dialed by `a`.
pub fn befriend(a: &Node, b: &Node) -> Friendship {
    let f = introduce(a, b);
    a.dialer.add(f.b_at_a.clone(), Some(b.addr()));
    b.dialer.add(f.a_at_b.clone(), None);
    f
}

/// Poll `check` until it holds, failing the test after ten seconds.
pub async fn eventually(what: &str, mut check: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while !check() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

/// An address nothing listens on.
pub async fn dead_addr() -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    drop(listener);
    addr
}
