//! kithd: Kith friend-to-friend dialer daemon.

use std::sync::Arc;

use anyhow::{Context, Result};

use kith_core::config::KithConfig;
use kith_core::identity::{self, LinkKey, LocalAuth, RemoteAuth};
use kith_dialer::Dialer;

mod echo;
mod status;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    // Load config
    if let Err(e) = KithConfig::write_default_if_missing() {
        tracing::warn!(error = %e, "failed to write default config");
    }
    let config = KithConfig::load().unwrap_or_else(|e| {
        tracing::warn!(error = %e, "failed to load config, using defaults");
        KithConfig::default()
    });
    tracing::info!(listen = %config.network.listen_addr, friends = config.friends.len(), "kithd starting");

    // Identity
    let signing = identity::load_or_generate(&config.identity.key_path)
        .with_context(|| format!("failed to load identity from {}", config.identity.key_path.display()))?;
    tracing::info!(public_key = hex::encode(signing.public().to_bytes()), "identity ready");
    let local = LocalAuth::new(signing);

    let dialer = Arc::new(
        Dialer::bind(
            local,
            config.dialer.clone(),
            &config.network.listen_addr,
            config.network.fd_limit,
        )
        .await
        .context("failed to start dialer")?,
    );

    // Friends
    for friend in &config.friends {
        let key = match identity::parse_public_key(&friend.signature_key) {
            Ok(key) => key,
            Err(e) => {
                tracing::warn!(name = %friend.name, error = %e, "skipping friend with bad key");
                continue;
            }
        };
        let remote = RemoteAuth::new(key, LinkKey(friend.dial_key), LinkKey(friend.accept_key));
        tracing::info!(name = %friend.name, peer = %remote.id(), addr = ?friend.addr, "friend configured");
        dialer.add(remote, friend.addr.clone());
    }

    // ── Shutdown channel ─────────────────────────────────────────────────────
    let (shutdown_tx, _) = tokio::sync::broadcast::channel::<()>(1);

    {
        let shutdown = shutdown_tx.clone();
        tokio::spawn(async move {
            tokio::signal::ctrl_c().await.ok();
            tracing::info!("shutdown signal received");
            let _ = shutdown.send(());
        });
    }

    // ── Spawn tasks ──────────────────────────────────────────────────────────

    let arrivals_task = {
        let dialer = dialer.clone();
        tokio::spawn(async move {
            while let Some(id) = dialer.wait_for_arrival().await {
                tracing::debug!(peer = %id, "friend connected");
            }
        })
    };

    let status_task = {
        let dialer = dialer.clone();
        tokio::spawn(async move {
            while let Some(update) = dialer.wait_for_status().await {
                tracing::info!(peer = %update.id, online = update.online, "friend status");
            }
        })
    };

    let echo_task = tokio::spawn(echo::serve(dialer.clone()));
    let snapshot_task = tokio::spawn(status::snapshot_loop(dialer.clone()));

    // ── Wait for exit ────────────────────────────────────────────────────────

    let mut shutdown_rx = shutdown_tx.subscribe();

    tokio::select! {
        _ = shutdown_rx.recv() => tracing::info!("shutting down"),
        r = arrivals_task      => tracing::error!("arrivals task exited: {:?}", r),
        r = status_task        => tracing::error!("status task exited: {:?}", r),
        r = echo_task          => tracing::error!("echo service exited: {:?}", r),
        r = snapshot_task      => tracing::error!("snapshot printer exited: {:?}", r),
    }

    dialer.shutdown();
    Ok(())
}
