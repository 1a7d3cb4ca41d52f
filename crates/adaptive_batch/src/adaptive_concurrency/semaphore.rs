//! A semaphore whose permit count can shrink while permits are checked out.
//!
//! `tokio::sync::Semaphore` can only forget permits that are currently
//! available. When the limit drops below the number of permits in use, the
//! shortfall is recorded as a debt and paid off as in-flight permits are
//! returned.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::{AcquireError, OwnedSemaphorePermit, Semaphore};

#[derive(Debug)]
pub(crate) struct ShrinkableSemaphore {
    semaphore: Arc<Semaphore>,
    to_forget: Mutex<usize>,
}

impl ShrinkableSemaphore {
    pub(crate) fn new(size: usize) -> Arc<Self> {
        Arc::new(Self {
            semaphore: Arc::new(Semaphore::new(size)),
            to_forget: Mutex::new(0),
        })
    }

    fn debt(&self) -> MutexGuard<'_, usize> {
        self.to_forget.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) async fn acquire(self: Arc<Self>) -> Result<ConcurrencyPermit, AcquireError> {
        let permit = Arc::clone(&self.semaphore).acquire_owned().await?;
        Ok(ConcurrencyPermit {
            permit: Some(permit),
            semaphore: self,
        })
    }

    /// Applies a change from `from` permits to `to` permits.
    pub(crate) fn resize(&self, from: usize, to: usize) {
        if to > from {
            self.add_permits(to - from);
        } else if from > to {
            self.forget_permits(from - to);
        }
    }

    fn add_permits(&self, count: usize) {
        let mut to_forget = self.debt();
        if *to_forget >= count {
            // Growth cancels permits that were still owed.
            *to_forget -= count;
        } else {
            self.semaphore.add_permits(count - *to_forget);
            *to_forget = 0;
        }
    }

    fn forget_permits(&self, count: usize) {
        let mut to_forget = self.debt();
        *to_forget += count;
        let forgotten = self.semaphore.forget_permits(*to_forget);
        *to_forget -= forgotten;
    }

    #[cfg(test)]
    pub(crate) fn available_permits(&self) -> usize {
        self.semaphore.available_permits()
    }

    #[cfg(test)]
    pub(crate) fn pending_forget(&self) -> usize {
        *self.debt()
    }
}

/// A checked-out permit. Dropping it either returns the permit or pays off
/// one unit of shrink debt.
#[derive(Debug)]
pub(crate) struct ConcurrencyPermit {
    permit: Option<OwnedSemaphorePermit>,
    semaphore: Arc<ShrinkableSemaphore>,
}

impl Drop for ConcurrencyPermit {
    fn drop(&mut self) {
        if let Some(permit) = self.permit.take() {
            let mut to_forget = self.semaphore.debt();
            if *to_forget > 0 {
                permit.forget();
                *to_forget -= 1;
            }
        }
    }
}
