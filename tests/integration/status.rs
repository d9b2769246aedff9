use std::time::Duration;

use crate::*;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn snapshot_serialises_the_pool() {
    let a = node().await;
    let b = node().await;
    befriend(&a, &b);
    eventually("pool to fill", || {
        a.phone(b.id()).is_some_and(|p| p.established.len() == POOL_TARGET)
    })
    .await;

    let json = serde_json::to_value(a.dialer.snapshot()).unwrap();
    assert_eq!(json["id"], format!("{}", a.id()));
    assert_eq!(json["local_addr"], a.addr());
    assert_eq!(json["fd_limit"], 64);

    let phone = &json["telephones"][0];
    assert_eq!(phone["id"], format!("{}", b.id()));
    assert_eq!(phone["presence"]["maybe_online"], true);
    assert_eq!(phone["presence"]["reachable"], true);
    assert_eq!(phone["presence"]["downtime_secs"], 0);
    assert_eq!(phone["auth_failures"], 0);
    let established = phone["established"].as_array().unwrap();
    assert_eq!(established.len(), POOL_TARGET);
    for conn in established {
        assert_eq!(conn["side"], "connector");
        assert_eq!(conn["regime"], "ready");
        assert_eq!(conn["remote"], format!("{}", b.id()));
        assert!(conn["handoff"].is_null());
    }

    let theirs = serde_json::to_value(b.dialer.snapshot()).unwrap();
    let inbound = theirs["telephones"][0]["established"].as_array().unwrap();
    assert!(inbound.iter().all(|c| c["side"] == "acceptor"));
    assert_eq!(theirs["telephones"][0]["presence"]["reachable"], false);
}

#[tokio::test]
async fn waiting_subjects_are_listed() {
    let b = node().await;
    assert!(b.dialer.snapshot().waiting.is_empty());

    let mut accept = Box::pin(b.dialer.accept("parked"));
    let pending = tokio::time::timeout(Duration::from_millis(20), &mut accept).await;
    assert!(pending.is_err(), "nobody dialed");
    assert_eq!(b.dialer.snapshot().waiting, vec!["parked".to_string()]);

    drop(accept);
    assert!(b.dialer.snapshot().waiting.is_empty());
}
