//! Admission control for container creation
//!
//! A counting semaphore bounds how many spawns are mid-flight, and a
//! bounded waiting queue rejects callers outright instead of letting
//! backpressure grow without limit.

use crate::errors::EngineError;
use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;

/// Requests allowed to sit waiting for a permit before new arrivals are
/// rejected with a queue-full error.
pub const ADMISSION_LIMIT: usize = 10;

#[derive(Debug)]
pub struct SpawnLimiter {
    semaphore: Arc<Semaphore>,
    waiting: Arc<AtomicUsize>,
}

/// Holds one concurrency slot; dropping it releases the slot on every
/// exit path, including cancellation.
#[derive(Debug)]
pub struct SpawnPermit {
    _permit: OwnedSemaphorePermit,
}

impl SpawnLimiter {
    /// `waiting` is the externally visible queue-depth gauge; the limiter
    /// shares it so instrumentation and admission agree by construction.
    pub fn new(concurrency: usize, waiting: Arc<AtomicUsize>) -> Self {
        SpawnLimiter {
            semaphore: Arc::new(Semaphore::new(concurrency)),
            waiting,
        }
    }

    /// Wait for a concurrency slot. Fails immediately with `QueueFull`
    /// when too many callers are already waiting, and with
    /// `SpawnCancelled` when `token` fires first; a cancelled waiter
    /// never holds a permit afterwards.
    pub async fn acquire(&self, token: &CancellationToken) -> Result<SpawnPermit, EngineError> {
        if self.waiting.fetch_add(1, Ordering::SeqCst) + 1 > ADMISSION_LIMIT {
            self.waiting.fetch_sub(1, Ordering::SeqCst);
            return Err(EngineError::QueueFull);
        }
        let acquired = tokio::select! {
            permit = self.semaphore.clone().acquire_owned() => {
                permit.map_err(|_| EngineError::Closed)
            }
            _ = token.cancelled() => Err(EngineError::SpawnCancelled),
        };
        self.waiting.fetch_sub(1, Ordering::SeqCst);
        acquired.map(|permit| SpawnPermit { _permit: permit })
    }

    pub fn waiting(&self) -> usize {
        self.waiting.load(Ordering::SeqCst)
    }

    /// Fail all current and future waiters; used at engine shutdown.
    pub fn close(&self) {
        self.semaphore.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn limiter(concurrency: usize) -> SpawnLimiter {
        SpawnLimiter::new(concurrency, Arc::new(AtomicUsize::new(0)))
    }

    #[tokio::test]
    async fn at_most_n_permits_in_flight() {
        let limiter = limiter(2);
        let token = CancellationToken::new();
        let first = limiter.acquire(&token).await.unwrap();
        let _second = limiter.acquire(&token).await.unwrap();

        // third waiter blocks until a permit frees up
        let blocked =
            tokio::time::timeout(Duration::from_millis(50), limiter.acquire(&token)).await;
        assert!(blocked.is_err());

        drop(first);
        let third =
            tokio::time::timeout(Duration::from_millis(200), limiter.acquire(&token)).await;
        assert!(third.is_ok());
    }

    #[tokio::test]
    async fn cancelled_waiter_holds_no_permit() {
        let limiter = Arc::new(limiter(1));
        let holder = limiter
            .acquire(&CancellationToken::new())
            .await
            .unwrap();

        let token = CancellationToken::new();
        let waiter = {
            let limiter = limiter.clone();
            let token = token.clone();
            tokio::spawn(async move { limiter.acquire(&token).await })
        };
        while limiter.waiting() == 0 {
            tokio::task::yield_now().await;
        }

        token.cancel();
        let result = waiter.await.unwrap();
        assert!(matches!(result, Err(EngineError::SpawnCancelled)));
        assert_eq!(limiter.waiting(), 0);

        // the slot was not leaked to the cancelled waiter
        drop(holder);
        assert!(limiter.acquire(&CancellationToken::new()).await.is_ok());
    }

    #[tokio::test]
    async fn eleventh_waiter_is_rejected() {
        let limiter = Arc::new(limiter(1));
        let _holder = limiter
            .acquire(&CancellationToken::new())
            .await
            .unwrap();

        let mut waiters = Vec::new();
        for _ in 0..ADMISSION_LIMIT {
            let limiter = limiter.clone();
            waiters.push(tokio::spawn(async move {
                limiter.acquire(&CancellationToken::new()).await
            }));
        }
        while limiter.waiting() < ADMISSION_LIMIT {
            tokio::task::yield_now().await;
        }

        let rejected = limiter.acquire(&CancellationToken::new()).await;
        assert!(matches!(rejected, Err(EngineError::QueueFull)));

        limiter.close();
        for waiter in waiters {
            assert!(matches!(waiter.await.unwrap(), Err(EngineError::Closed)));
        }
    }
}
