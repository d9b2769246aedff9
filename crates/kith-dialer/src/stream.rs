//! The byte stream handed to callers of `dial` and `accept`.

use std::io;
use std::pin::Pin;
use std::sync::Weak;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

use kith_core::identity::PeerId;

use crate::handoff::{Handoff, HandoffStats};
use crate::telephone::Telephone;

/// A channel to a friend, labelled with both ends' identities. Closing or
/// dropping it nudges the friend's pool to rebalance.
#[derive(Debug)]
pub struct PeerStream {
    handoff: Handoff,
    local: PeerId,
    remote: PeerId,
    tel: Weak<Telephone>,
}

impl PeerStream {
    pub(crate) fn new(handoff: Handoff, local: PeerId, remote: PeerId, tel: Weak<Telephone>) -> Self {
        Self {
            handoff,
            local,
            remote,
            tel,
        }
    }

    pub fn local_id(&self) -> PeerId {
        self.local
    }

    pub fn remote_id(&self) -> PeerId {
        self.remote
    }

    pub fn session(&self) -> u64 {
        self.handoff.session()
    }

    pub fn stats(&self) -> HandoffStats {
        self.handoff.stats()
    }

    /// Graceful close. See [`Handoff::close`].
    pub async fn close(&mut self) -> io::Result<()> {
        let result = self.handoff.close().await;
        self.rebalance();
        result
    }

    fn rebalance(&self) {
        if let Some(tel) = self.tel.upgrade() {
            tel.rebalance();
        }
    }
}

impl AsyncRead for PeerStream {
    fn poll_read(mut self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.handoff).poll_read(cx, buf)
    }
}

impl AsyncWrite for PeerStream {
    fn poll_write(mut self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.handoff).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.handoff).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let done = Pin::new(&mut self.handoff).poll_shutdown(cx);
        if done.is_ready() {
            self.rebalance();
        }
        done
    }
}

impl Drop for PeerStream {
    fn drop(&mut self) {
        self.handoff.abandon();
        self.rebalance();
    }
}
