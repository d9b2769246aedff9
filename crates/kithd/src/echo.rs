//! Echo service: writes back whatever a friend sends on the `echo` subject.

use std::sync::Arc;

use tokio::io::{AsyncReadExt, AsyncWriteExt};

use kith_dialer::{Dialer, PeerStream};

pub const SUBJECT: &str = "echo";

pub async fn serve(dialer: Arc<Dialer>) {
    loop {
        let (id, stream) = match dialer.accept(SUBJECT).await {
            Ok(accepted) => accepted,
            Err(e) => {
                tracing::info!(error = %e, "echo service stopping");
                return;
            }
        };
        tokio::spawn(async move {
            match echo(stream).await {
                Ok(bytes) => tracing::debug!(peer = %id, bytes, "echo done"),
                Err(e) => tracing::debug!(peer = %id, error = %e, "echo failed"),
            }
        });
    }
}

async fn echo(mut stream: PeerStream) -> std::io::Result<u64> {
    let mut buf = vec![0u8; 16 * 1024];
    let mut total = 0u64;
    loop {
        let n = stream.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        stream.write_all(&buf[..n]).await?;
        total += n as u64;
    }
    stream.close().await?;
    Ok(total)
}
