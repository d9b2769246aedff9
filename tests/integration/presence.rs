use std::time::Duration;

use crate::*;

async fn next_status(node: &Node) -> kith_dialer::StatusUpdate {
    tokio::time::timeout(Duration::from_secs(10), node.dialer.wait_for_status())
        .await
        .expect("status update in time")
        .expect("dialer still running")
}

async fn assert_quiet(node: &Node) {
    let extra = tokio::time::timeout(Duration::from_millis(400), node.dialer.wait_for_status()).await;
    assert!(extra.is_err(), "unexpected status update: {extra:?}");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn presence_flips_once_per_transition() {
    let a = node().await;
    let b = node().await;
    let f = befriend(&a, &b);

    let p = b.dialer.presence(a.id()).unwrap();
    assert!(!p.maybe_online);
    assert!(!p.reachable);

    let up = next_status(&b).await;
    assert_eq!((up.id, up.online), (a.id(), true));
    assert_quiet(&b).await;

    // a forgets b: every connection goes, b sees a go offline once.
    a.dialer.revoke(b.id());
    let down = next_status(&b).await;
    assert_eq!((down.id, down.online), (a.id(), false));
    assert_quiet(&b).await;
    assert!(!b.dialer.presence(a.id()).unwrap().maybe_online);
    tokio::time::sleep(Duration::from_millis(700)).await;
    let p = b.dialer.presence(a.id()).unwrap();
    assert_eq!(p.uptime_secs, 0);
    assert!(p.downtime_secs >= 1, "offline for {}s", p.downtime_secs);

    // and back.
    a.dialer.add(f.b_at_a, Some(b.addr()));
    let up = next_status(&b).await;
    assert_eq!((up.id, up.online), (a.id(), true));
    assert_quiet(&b).await;
    assert!(b.dialer.presence(a.id()).unwrap().maybe_online);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn arrivals_name_the_friend() {
    let a = node().await;
    let b = node().await;
    befriend(&a, &b);

    let arrived = tokio::time::timeout(Duration::from_secs(10), b.dialer.wait_for_arrival())
        .await
        .unwrap();
    assert_eq!(arrived, Some(a.id()));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn rating_stays_within_bounds() {
    let a = node().await;
    let b = node().await;
    befriend(&a, &b);
    next_status(&a).await;

    let p = a.dialer.presence(b.id()).unwrap();
    assert!(p.maybe_online);
    let bound = settings().rating_bound;
    assert!(p.rating >= 1.0 / bound && p.rating <= bound);
}
