//! Concurrency bound on in-flight calls.

use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;

use crate::error::{CourierError, Result};

/// Bounds the number of simultaneously executing calls.
///
/// Waiters are served in FIFO order. A slot is held by a [`GateToken`] and
/// returned when the token is dropped, so every exit path releases it.
#[derive(Debug, Clone)]
pub struct ConcurrencyGate {
    semaphore: Arc<Semaphore>,
    max_concurrent: usize,
}

/// Proof of one held concurrency slot.
#[derive(Debug)]
pub struct GateToken {
    _permit: OwnedSemaphorePermit,
}

impl ConcurrencyGate {
    /// Create a gate admitting at most `max_concurrent` holders.
    pub fn new(max_concurrent: usize) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(max_concurrent)),
            max_concurrent,
        }
    }

    /// Wait for a free slot.
    pub async fn acquire(&self, cancel: &CancellationToken) -> Result<GateToken> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(CourierError::Cancelled),
            permit = self.semaphore.clone().acquire_owned() => permit
                .map(|permit| GateToken { _permit: permit })
                .map_err(|_| CourierError::Config("concurrency gate closed".into())),
        }
    }

    /// Take a slot only if one is free right now.
    pub fn try_acquire(&self) -> Option<GateToken> {
        self.semaphore
            .clone()
            .try_acquire_owned()
            .ok()
            .map(|permit| GateToken { _permit: permit })
    }

    /// Return a slot. Equivalent to dropping the token.
    pub fn release(&self, token: GateToken) {
        drop(token);
    }

    /// Number of tokens currently held.
    pub fn outstanding(&self) -> usize {
        self.max_concurrent - self.semaphore.available_permits()
    }

    /// Get the maximum number of concurrent holders.
    pub fn max_concurrent(&self) -> usize {
        self.max_concurrent
    }
}
