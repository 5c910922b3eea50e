//! Periodic token bucket used to cap transfer throughput.
//!
//! The count resets to capacity at every refill boundary; it does not
//! accumulate. Waiters blocked on an empty bucket all wake at the next
//! boundary and re-contend.

use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::{Error, Result};

struct BucketState {
    capacity: usize,
    next_capacity: Option<usize>,
    available: usize,
    interval: Duration,
    last_refill: Instant,
}

impl BucketState {
    fn refill_if_due(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_refill);
        if elapsed < self.interval {
            return;
        }
        let ticks = (elapsed.as_nanos() / self.interval.as_nanos()) as u32;
        self.last_refill += self.interval * ticks;
        if let Some(capacity) = self.next_capacity.take() {
            self.capacity = capacity;
        }
        self.available = self.capacity;
    }

    fn next_refill(&self, now: Instant) -> Duration {
        (self.last_refill + self.interval).saturating_duration_since(now)
    }
}

/// A token bucket with capacity `C` and refill interval `I`.
pub struct TokenBucket {
    state: Mutex<BucketState>,
}

impl TokenBucket {
    pub fn new(capacity: usize, interval: Duration) -> Result<Self> {
        if capacity == 0 {
            return Err(Error::InvalidArgument {
                name: "capacity",
                constraint: "must be greater than zero",
            });
        }
        if interval.is_zero() {
            return Err(Error::InvalidArgument {
                name: "interval",
                constraint: "must be greater than zero",
            });
        }
        Ok(TokenBucket {
            state: Mutex::new(BucketState {
                capacity,
                next_capacity: None,
                available: capacity,
                interval,
                last_refill: Instant::now(),
            }),
        })
    }

    /// Take up to `count` tokens, waiting for the next refill if the bucket
    /// is empty.
    ///
    /// Requests above capacity are clamped. A partially full bucket grants
    /// whatever is left rather than waiting for the full amount, so the
    /// returned count may be less than requested.
    pub async fn get(&self, count: usize, cancel: &CancellationToken) -> Result<usize> {
        loop {
            let wait = {
                let mut state = self.state.lock().await;
                let now = Instant::now();
                state.refill_if_due(now);
                let wanted = count.min(state.capacity);
                if wanted == 0 {
                    return Ok(0);
                }
                if state.available >= wanted {
                    state.available -= wanted;
                    return Ok(wanted);
                }
                if state.available > 0 {
                    let granted = state.available;
                    state.available = 0;
                    return Ok(granted);
                }
                state.next_refill(now)
            };

            tokio::select! {
                _ = tokio::time::sleep(wait) => {}
                _ = cancel.cancelled() => return Err(Error::Canceled),
            }
        }
    }

    /// Change the capacity, effective at the next refill.
    pub async fn set_capacity(&self, capacity: usize) -> Result<()> {
        if capacity == 0 {
            return Err(Error::InvalidArgument {
                name: "capacity",
                constraint: "must be greater than zero",
            });
        }
        self.state.lock().await.next_capacity = Some(capacity);
        Ok(())
    }

    #[cfg(test)]
    pub(crate) async fn available(&self) -> usize {
        self.state.lock().await.available
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test(start_paused = true)]
    async fn test_grants_up_to_capacity() {
        let bucket = TokenBucket::new(100, Duration::from_secs(1)).unwrap();
        let cancel = CancellationToken::new();
        assert_eq!(bucket.get(50, &cancel).await.unwrap(), 50);
        assert_eq!(bucket.get(50, &cancel).await.unwrap(), 50);
        assert_eq!(bucket.available().await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_clamps_oversized_requests() {
        let bucket = TokenBucket::new(10, Duration::from_secs(1)).unwrap();
        let cancel = CancellationToken::new();
        assert_eq!(bucket.get(1000, &cancel).await.unwrap(), 10);
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_request_returns_immediately() {
        let bucket = TokenBucket::new(10, Duration::from_secs(3600)).unwrap();
        let cancel = CancellationToken::new();
        assert_eq!(bucket.get(0, &cancel).await.unwrap(), 0);
        assert_eq!(bucket.available().await, 10);

        // Even an exhausted bucket answers a zero-token request without
        // waiting for the refill.
        assert_eq!(bucket.get(10, &cancel).await.unwrap(), 10);
        assert_eq!(bucket.get(0, &cancel).await.unwrap(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_partial_grant_drains_bucket() {
        let bucket = TokenBucket::new(100, Duration::from_secs(1)).unwrap();
        let cancel = CancellationToken::new();
        assert_eq!(bucket.get(80, &cancel).await.unwrap(), 80);
        assert_eq!(bucket.get(80, &cancel).await.unwrap(), 20);
        assert_eq!(bucket.available().await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_empty_bucket_waits_for_refill() {
        let bucket = Arc::new(TokenBucket::new(100, Duration::from_secs(1)).unwrap());
        let cancel = CancellationToken::new();
        assert_eq!(bucket.get(50, &cancel).await.unwrap(), 50);
        assert_eq!(bucket.get(50, &cancel).await.unwrap(), 50);

        let blocked = {
            let bucket = Arc::clone(&bucket);
            let cancel = cancel.clone();
            tokio::spawn(async move { bucket.get(50, &cancel).await })
        };
        tokio::task::yield_now().await;
        assert!(!blocked.is_finished());

        tokio::time::advance(Duration::from_secs(1)).await;
        assert_eq!(blocked.await.unwrap().unwrap(), 50);
        assert_eq!(bucket.available().await, 50);
    }

    #[tokio::test(start_paused = true)]
    async fn test_window_never_overshoots_capacity() {
        let bucket = TokenBucket::new(64, Duration::from_secs(1)).unwrap();
        let cancel = CancellationToken::new();
        let mut granted = 0;
        while bucket.available().await > 0 {
            granted += bucket.get(17, &cancel).await.unwrap();
        }
        assert_eq!(granted, 64);
    }

    #[tokio::test(start_paused = true)]
    async fn test_capacity_change_applies_at_refill() {
        let bucket = TokenBucket::new(100, Duration::from_secs(1)).unwrap();
        let cancel = CancellationToken::new();
        bucket.set_capacity(10).await.unwrap();

        // Current window still honors the old capacity.
        assert_eq!(bucket.get(100, &cancel).await.unwrap(), 100);

        tokio::time::advance(Duration::from_secs(1)).await;
        assert_eq!(bucket.get(100, &cancel).await.unwrap(), 10);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_unblocks_waiter() {
        let bucket = Arc::new(TokenBucket::new(10, Duration::from_secs(3600)).unwrap());
        let cancel = CancellationToken::new();
        assert_eq!(bucket.get(10, &cancel).await.unwrap(), 10);

        let blocked = {
            let bucket = Arc::clone(&bucket);
            let cancel = cancel.clone();
            tokio::spawn(async move { bucket.get(1, &cancel).await })
        };
        tokio::task::yield_now().await;
        cancel.cancel();
        assert!(matches!(blocked.await.unwrap(), Err(Error::Canceled)));
    }

    #[test]
    fn test_rejects_zero_capacity() {
        assert!(TokenBucket::new(0, Duration::from_secs(1)).is_err());
        assert!(TokenBucket::new(1, Duration::ZERO).is_err());
    }
}
