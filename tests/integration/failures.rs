use std::time::Duration;

use kith_core::config::DialerSettings;
use kith_core::identity::{LinkKey, RemoteAuth};
use kith_dialer::DialerError;

use crate::*;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn stranger_is_refused_and_counted() {
    let a = node().await;
    let b = node().await;
    // a knows b; b has never heard of a.
    let f = introduce(&a, &b);
    a.dialer.add(f.b_at_a, Some(b.addr()));

    eventually("a to record a failed handshake", || {
        a.phone(b.id())
            .is_some_and(|p| p.auth_failures >= 1 && p.last_error.is_some())
    })
    .await;
    let phone = a.phone(b.id()).unwrap();
    assert!(phone.established.is_empty());
    assert!(!phone.presence.maybe_online);
    assert!(b.dialer.snapshot().telephones.is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn wrong_accept_key_is_rejected() {
    let a = node().await;
    let b = node().await;
    let f = introduce(&a, &b);
    // a expects b to answer for a key b never issued.
    let confused = RemoteAuth::new(*f.b_at_a.verifying_key(), f.b_at_a.dial_key, LinkKey(7));
    a.dialer.add(confused, Some(b.addr()));
    b.dialer.add(f.a_at_b, None);

    eventually("a to reject b's answer", || {
        a.phone(b.id())
            .and_then(|p| p.last_error)
            .is_some_and(|e| e.contains("wrong accept key"))
    })
    .await;
    assert!(a.phone(b.id()).unwrap().established.is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn unreachable_friend_fails_the_dial() {
    let quick = DialerSettings {
        max_dial_tries: 3,
        replenish_wait_ms: 20,
        ..settings()
    };
    let a = node_with(quick).await;
    let b = node().await;
    let f = introduce(&a, &b);
    a.dialer.add(f.b_at_a, Some(dead_addr().await));

    let err = a.dialer.dial(b.id(), "echo").await.unwrap_err();
    assert!(matches!(err, DialerError::Unreachable(id) if id == b.id()));
    let phone = a.phone(b.id()).unwrap();
    assert!(!phone.connecting.is_empty(), "connect keeps retrying");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn shutdown_releases_everything() {
    let a = node().await;
    let b = node().await;
    befriend(&a, &b);
    eventually("pool to fill", || {
        a.phone(b.id()).is_some_and(|p| p.established.len() == POOL_TARGET)
    })
    .await;
    assert!(a.dialer.snapshot().fd_in_use >= POOL_TARGET);

    // The arrivals and the online flip are still queued, unread.
    a.dialer.shutdown();
    a.dialer.shutdown();
    for _ in 0..10 {
        assert!(a.dialer.wait_for_status().await.is_none());
        assert!(a.dialer.wait_for_arrival().await.is_none());
    }
    assert!(matches!(a.dialer.dial(b.id(), "echo").await, Err(DialerError::Shutdown)));
    eventually("descriptors to be returned", || a.dialer.snapshot().fd_in_use == 0).await;

    // b notices a is gone.
    eventually("b to see a offline", || {
        b.dialer.presence(a.id()).is_some_and(|p| !p.maybe_online)
    })
    .await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(b.phone(a.id()).unwrap().established.is_empty());
}
