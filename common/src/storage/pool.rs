use std::{
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use serde::Serialize;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::debug;

use crate::error::AppError;

use super::db::SurrealDbClient;

/// Bounded admission gate in front of the store. The driver multiplexes one
/// connection, so the classic pool is modeled as permits: `size` regular slots
/// plus `overflow` burst slots, with a bounded acquire wait and a liveness
/// pre-ping on checkout.
pub struct StoreGate {
    semaphore: Arc<Semaphore>,
    size: usize,
    overflow: usize,
    acquire_timeout: Duration,
    checked_out: Arc<AtomicUsize>,
}

/// Point-in-time gate usage, reported by the store stats endpoint.
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
pub struct GateStats {
    pub pool_size: usize,
    pub pool_checked_out: usize,
    pub pool_overflow: usize,
}

impl StoreGate {
    pub fn new(size: usize, overflow: usize, acquire_timeout: Duration) -> Arc<Self> {
        let total = size.saturating_add(overflow).max(1);
        Arc::new(Self {
            semaphore: Arc::new(Semaphore::new(total)),
            size: size.max(1),
            overflow,
            acquire_timeout,
            checked_out: Arc::new(AtomicUsize::new(0)),
        })
    }

    /// Check out a permit, pre-pinging the connection before handing it over.
    /// Times out with a retryable error when all regular and overflow slots
    /// stay busy past the acquire window.
    pub async fn checkout(
        self: &Arc<Self>,
        db: &SurrealDbClient,
    ) -> Result<StoreLease, AppError> {
        let permit = tokio::time::timeout(
            self.acquire_timeout,
            Arc::clone(&self.semaphore).acquire_owned(),
        )
        .await
        .map_err(|_| {
            AppError::PoolExhausted(format!(
                "no store permit within {:?} ({} + {} slots)",
                self.acquire_timeout, self.size, self.overflow
            ))
        })?
        .map_err(|_| AppError::InternalError("store gate closed".to_string()))?;

        db.ping().await?;

        let in_use = self.checked_out.fetch_add(1, Ordering::Relaxed) + 1;
        if in_use > self.size {
            debug!(in_use, size = self.size, "store gate in overflow");
        }

        Ok(StoreLease {
            _permit: permit,
            checked_out: Arc::clone(&self.checked_out),
        })
    }

    pub fn stats(&self) -> GateStats {
        let in_use = self.checked_out.load(Ordering::Relaxed);
        GateStats {
            pool_size: self.size,
            pool_checked_out: in_use.min(self.size),
            pool_overflow: in_use.saturating_sub(self.size),
        }
    }
}

/// Active permit on the store gate; released on drop along every exit path.
#[derive(Debug)]
pub struct StoreLease {
    _permit: OwnedSemaphorePermit,
    checked_out: Arc<AtomicUsize>,
}

impl Drop for StoreLease {
    fn drop(&mut self) {
        self.checked_out.fetch_sub(1, Ordering::Relaxed);
    }
}
