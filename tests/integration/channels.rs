use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};

use kith_dialer::DialerError;

use crate::*;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn dial_and_accept_echo() {
    let a = node().await;
    let b = node().await;
    befriend(&a, &b);

    let (accepted, dialed) = tokio::join!(b.dialer.accept("echo"), a.dialer.dial(b.id(), "echo"));
    let (from, mut inbound) = accepted.unwrap();
    let mut outbound = dialed.unwrap();

    assert_eq!(from, a.id());
    assert_eq!(inbound.local_id(), b.id());
    assert_eq!(inbound.remote_id(), a.id());
    assert_eq!(outbound.local_id(), a.id());
    assert_eq!(outbound.remote_id(), b.id());
    assert_eq!(inbound.session(), outbound.session());

    outbound.write_all(b"hello, world!").await.unwrap();
    let mut buf = [0u8; 13];
    inbound.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"hello, world!");
    inbound.write_all(&buf).await.unwrap();

    // Each side's close waits for the other's end of stream.
    let (closed_in, echoed) = tokio::join!(inbound.close(), async {
        let mut echoed = Vec::new();
        outbound.read_to_end(&mut echoed).await?;
        outbound.close().await?;
        Ok::<_, std::io::Error>(echoed)
    });
    closed_in.unwrap();
    assert_eq!(echoed.unwrap(), b"hello, world!");
    assert_eq!(outbound.stats().bytes_written, 13);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn many_channels_in_sequence() {
    let a = node().await;
    let b = node().await;
    befriend(&a, &b);

    let rounds = async {
        for i in 0..8u8 {
            // The accept is registered before the dial can reach b.
            let (accepted, dialed) = tokio::join!(b.dialer.accept("count"), a.dialer.dial(b.id(), "count"));
            let (_, mut server) = accepted.unwrap();
            let mut client = dialed.unwrap();

            let serve = async {
                let len = server.read_u32().await?;
                let mut body = vec![0u8; len as usize];
                server.read_exact(&mut body).await?;
                assert!(body.iter().all(|&x| x == i));
                server.write_u32(len).await?;
                server.close().await
            };
            let call = async {
                let payload = vec![i; 1000 * (i as usize + 1)];
                client.write_u32(payload.len() as u32).await?;
                for piece in payload.chunks(700) {
                    client.write_all(piece).await?;
                }
                assert_eq!(client.read_u32().await?, payload.len() as u32);
                let mut rest = Vec::new();
                client.read_to_end(&mut rest).await?;
                assert!(rest.is_empty());
                client.close().await
            };
            let (served, called) = tokio::join!(serve, call);
            served.unwrap();
            called.unwrap();
        }
    };
    tokio::time::timeout(Duration::from_secs(20), rounds)
        .await
        .expect("all channels complete");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn subject_without_listener_is_closed_gracefully() {
    let a = node().await;
    let b = node().await;
    befriend(&a, &b);

    let mut stream = a.dialer.dial(b.id(), "nobody-home").await.unwrap();
    let mut buf = [0u8; 8];
    assert_eq!(stream.read(&mut buf).await.unwrap(), 0);
    stream.close().await.unwrap();

    // The connection survives and serves the next channel.
    let (accepted, dialed) = tokio::join!(b.dialer.accept("echo"), a.dialer.dial(b.id(), "echo"));
    assert!(accepted.is_ok());
    assert!(dialed.is_ok());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn abandoned_accept_does_not_block_the_next() {
    let b = node().await;
    let gave_up = tokio::time::timeout(Duration::from_millis(20), b.dialer.accept("later")).await;
    assert!(gave_up.is_err());
    assert!(b.dialer.snapshot().waiting.is_empty());

    let a = node().await;
    befriend(&a, &b);
    let (accepted, dialed) = tokio::join!(b.dialer.accept("later"), a.dialer.dial(b.id(), "later"));
    assert_eq!(accepted.unwrap().0, a.id());
    assert!(dialed.is_ok());
}

#[tokio::test]
#[should_panic(expected = "duplicate accept")]
async fn duplicate_accept_panics() {
    let b = node().await;
    let _ = tokio::join!(b.dialer.accept("twice"), b.dialer.accept("twice"));
}

#[tokio::test]
async fn dialing_a_stranger_fails() {
    let a = node().await;
    let b = node().await;
    let err = a.dialer.dial(b.id(), "echo").await.unwrap_err();
    assert!(matches!(err, DialerError::UnknownPeer(id) if id == b.id()));
}
