//! Resizable counting permit for the worker pool.
//!
//! Wraps a tokio [`Semaphore`] whose capacity can be changed while permits
//! are held. Growing adds permits immediately. Shrinking forgets idle permits
//! right away; any shortfall is recorded as debt and paid back by holders as
//! they release, so capacity converges to the target without blocking the
//! caller.
//!
//! Only the pool's adjustment routine calls [`ConcurrencyLimiter::resize`].
//! Workers read the limit through atomics and never take a lock.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::{AcquireError, OwnedSemaphorePermit, Semaphore};

/// Counting permit whose size can change at runtime.
#[derive(Debug)]
pub struct ConcurrencyLimiter {
    semaphore: Arc<Semaphore>,
    limit: AtomicUsize,
    debt: Arc<AtomicUsize>,
}

impl ConcurrencyLimiter {
    /// Creates a limiter with `limit` permits.
    pub fn new(limit: usize) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(limit)),
            limit: AtomicUsize::new(limit),
            debt: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Returns the current target number of permits.
    pub fn limit(&self) -> usize {
        self.limit.load(Ordering::SeqCst)
    }

    /// Returns the number of permits available right now.
    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }

    /// Waits for a permit.
    ///
    /// # Errors
    ///
    /// Returns `AcquireError` if the limiter was closed.
    pub async fn acquire(&self) -> Result<ConcurrencyPermit, AcquireError> {
        let permit = Arc::clone(&self.semaphore).acquire_owned().await?;
        Ok(ConcurrencyPermit {
            permit: Some(permit),
            debt: Arc::clone(&self.debt),
        })
    }

    /// Changes the number of permits to `new_limit`.
    ///
    /// Returns the previous limit.
    pub fn resize(&self, new_limit: usize) -> usize {
        let old_limit = self.limit.swap(new_limit, Ordering::SeqCst);

        if new_limit > old_limit {
            let mut grow = new_limit - old_limit;
            // Cancel outstanding debt before minting new permits.
            let mut debt = self.debt.load(Ordering::SeqCst);
            while debt > 0 && grow > 0 {
                let cancel = debt.min(grow);
                match self.debt.compare_exchange(
                    debt,
                    debt - cancel,
                    Ordering::SeqCst,
                    Ordering::SeqCst,
                ) {
                    Ok(_) => {
                        grow -= cancel;
                        break;
                    }
                    Err(current) => debt = current,
                }
            }
            if grow > 0 {
                self.semaphore.add_permits(grow);
            }
        } else if new_limit < old_limit {
            let shrink = old_limit - new_limit;
            let forgotten = self.semaphore.forget_permits(shrink);
            if forgotten < shrink {
                self.debt.fetch_add(shrink - forgotten, Ordering::SeqCst);
            }
        }

        old_limit
    }

    /// Closes the limiter; pending and future acquires fail.
    pub fn close(&self) {
        self.semaphore.close();
    }
}

/// A held concurrency slot. Released on drop.
#[derive(Debug)]
pub struct ConcurrencyPermit {
    permit: Option<OwnedSemaphorePermit>,
    debt: Arc<AtomicUsize>,
}

impl Drop for ConcurrencyPermit {
    fn drop(&mut self) {
        let Some(permit) = self.permit.take() else {
            return;
        };

        let mut debt = self.debt.load(Ordering::SeqCst);
        while debt > 0 {
            match self
                .debt
                .compare_exchange(debt, debt - 1, Ordering::SeqCst, Ordering::SeqCst)
            {
                Ok(_) => {
                    // Pay back one unit of shrink debt instead of returning it.
                    permit.forget();
                    return;
                }
                Err(current) => debt = current,
            }
        }
        drop(permit);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_grow_adds_permits() {
        let limiter = ConcurrencyLimiter::new(2);
        assert_eq!(limiter.resize(4), 2);
        assert_eq!(limiter.limit(), 4);
        assert_eq!(limiter.available(), 4);
    }

    #[tokio::test]
    async fn test_shrink_idle_permits() {
        let limiter = ConcurrencyLimiter::new(4);
        limiter.resize(1);
        assert_eq!(limiter.available(), 1);
    }

    #[tokio::test]
    async fn test_shrink_while_held_pays_back_on_release() {
        let limiter = ConcurrencyLimiter::new(3);
        let a = limiter.acquire().await.expect("permit a");
        let b = limiter.acquire().await.expect("permit b");
        let c = limiter.acquire().await.expect("permit c");
        assert_eq!(limiter.available(), 0);

        limiter.resize(1);
        drop(a);
        drop(b);
        // Two releases paid the debt; nothing was returned yet.
        assert_eq!(limiter.available(), 0);

        drop(c);
        assert_eq!(limiter.available(), 1);
    }

    #[tokio::test]
    async fn test_grow_cancels_debt() {
        let limiter = ConcurrencyLimiter::new(2);
        let a = limiter.acquire().await.expect("permit a");
        let b = limiter.acquire().await.expect("permit b");

        limiter.resize(1);
        limiter.resize(2);
        drop(a);
        drop(b);
        assert_eq!(limiter.available(), 2);
    }

    #[tokio::test]
    async fn test_close_fails_acquire() {
        let limiter = ConcurrencyLimiter::new(1);
        limiter.close();
        assert!(limiter.acquire().await.is_err());
    }
}
