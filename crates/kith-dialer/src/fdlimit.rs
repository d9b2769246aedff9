//! File-descriptor limiter shared by every socket a dialer opens.
//!
//! Inbound accepts and outbound connects draw from the same pool. A permit
//! travels with its socket and is returned when the tube holding it closes.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

#[derive(Debug, Clone)]
pub struct FdLimiter {
    permits: Arc<Semaphore>,
    limit: usize,
}

/// One file descriptor's worth of budget. Released on drop.
#[derive(Debug)]
pub struct FdPermit {
    _permit: OwnedSemaphorePermit,
}

impl FdLimiter {
    pub fn new(limit: usize) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(limit)),
            limit,
        }
    }

    /// Wait up to `wait` for a free descriptor.
    pub async fn acquire(&self, wait: Duration) -> Result<FdPermit, FdError> {
        match tokio::time::timeout(wait, self.permits.clone().acquire_owned()).await {
            Ok(Ok(permit)) => Ok(FdPermit { _permit: permit }),
            Ok(Err(_)) => Err(FdError::Closed),
            Err(_) => Err(FdError::Starved(wait)),
        }
    }

    pub fn in_use(&self) -> usize {
        self.limit.saturating_sub(self.permits.available_permits())
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    /// Fail all current and future waiters.
    pub fn close(&self) {
        self.permits.close();
    }
}

#[derive(Debug, Error)]
pub enum FdError {
    #[error("no file descriptor available within {0:?}")]
    Starved(Duration),
    #[error("file descriptor limiter closed")]
    Closed,
}
