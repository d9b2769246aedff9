use std::time::Duration;

use kith_core::config::DialerSettings;
use kith_dialer::Regime;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use crate::*;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn pool_converges_to_target() {
    let a = node().await;
    let b = node().await;
    befriend(&a, &b);

    eventually("a's pool to fill", || {
        a.phone(b.id())
            .is_some_and(|p| p.established.len() == POOL_TARGET && p.connecting.is_empty())
    })
    .await;

    // Steady state: no further dials, nothing trimmed.
    tokio::time::sleep(Duration::from_millis(300)).await;
    let mine = a.phone(b.id()).unwrap();
    assert_eq!(mine.established.len(), POOL_TARGET);
    assert!(mine.connecting.is_empty());
    assert!(mine.established.iter().all(|c| c.remote == Some(b.id())));

    let theirs = b.phone(a.id()).unwrap();
    assert_eq!(theirs.established.len(), POOL_TARGET);
    assert!(theirs.connecting.is_empty(), "b has no address to dial");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn mutual_dialing_stays_within_twice_target() {
    let a = node().await;
    let b = node().await;
    let f = introduce(&a, &b);
    a.dialer.add(f.b_at_a, Some(b.addr()));
    b.dialer.add(f.a_at_b, Some(a.addr()));

    eventually("both pools to fill", || {
        let ours = a.phone(b.id()).map_or(0, |p| p.established.len());
        let theirs = b.phone(a.id()).map_or(0, |p| p.established.len());
        ours >= POOL_TARGET && theirs >= POOL_TARGET
    })
    .await;
    tokio::time::sleep(Duration::from_millis(300)).await;

    for (node, friend) in [(&a, b.id()), (&b, a.id())] {
        let n = node.phone(friend).unwrap().established.len();
        assert!(
            (POOL_TARGET..=2 * POOL_TARGET).contains(&n),
            "{n} established connections"
        );
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn update_makes_an_inbound_only_friend_dialable() {
    let a = node().await;
    let b = node().await;
    let f = introduce(&a, &b);
    a.dialer.add(f.b_at_a, None);
    b.dialer.add(f.a_at_b, None);

    assert!(!a.dialer.presence(b.id()).unwrap().reachable);
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(a.phone(b.id()).unwrap().established.is_empty());

    a.dialer.update(b.id(), b.addr());
    assert!(a.dialer.presence(b.id()).unwrap().reachable);
    eventually("a's pool to fill after update", || {
        a.phone(b.id()).is_some_and(|p| p.established.len() == POOL_TARGET)
    })
    .await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn update_abandons_attempts_on_the_old_address() {
    // Retries on the old address would not come round again within the test.
    let slow = DialerSettings {
        backoff_lo_ms: 60_000,
        backoff_hi_ms: 60_000,
        ..settings()
    };
    let a = node_with(slow).await;
    let b = node().await;
    let f = introduce(&a, &b);
    a.dialer.add(f.b_at_a, Some(dead_addr().await));
    b.dialer.add(f.a_at_b, None);

    eventually("attempts on the dead address", || {
        a.phone(b.id()).is_some_and(|p| p.connecting.len() == POOL_TARGET)
    })
    .await;

    a.dialer.update(b.id(), b.addr());
    eventually("a's pool to fill at the new address", || {
        a.phone(b.id())
            .is_some_and(|p| p.established.len() == POOL_TARGET && p.connecting.is_empty())
    })
    .await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn surplus_is_trimmed_but_busy_channels_survive() {
    // b wants four connections; a keeps at most two idle ones.
    let a = node_with(DialerSettings { pool_target: 1, ..settings() }).await;
    let b = node_with(DialerSettings { pool_target: 4, ..settings() }).await;
    let f = introduce(&a, &b);
    a.dialer.add(f.b_at_a, None);
    b.dialer.add(f.a_at_b, Some(a.addr()));

    let (accepted, dialed) = tokio::join!(a.dialer.accept("hold"), b.dialer.dial(a.id(), "hold"));
    let (_, mut held_in) = accepted.unwrap();
    let mut held_out = dialed.unwrap();
    let session = held_in.session();

    // b keeps redialing what a trims, so arrivals keep coming.
    let mut arrivals = 0;
    tokio::time::timeout(Duration::from_secs(10), async {
        while arrivals <= 8 {
            a.dialer.wait_for_arrival().await.unwrap();
            arrivals += 1;
        }
    })
    .await
    .expect("a trims surplus connections");

    for _ in 0..10 {
        let phone = a.phone(b.id()).unwrap();
        let busy: Vec<_> = phone
            .established
            .iter()
            .filter(|c| c.regime == Regime::Busy)
            .collect();
        assert_eq!(busy.len(), 1);
        assert_eq!(busy[0].handoff.map(|h| h.session), Some(session));
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    held_out.write_all(b"still here").await.unwrap();
    let mut buf = [0u8; 10];
    held_in.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"still here");
    let (closed_in, closed_out) = tokio::join!(held_in.close(), held_out.close());
    closed_in.unwrap();
    closed_out.unwrap();
}
