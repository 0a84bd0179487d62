//! Per-account mutual exclusion.

use tokio::sync::{Mutex, Semaphore, SemaphorePermit};

/// The locks one account's announcer, matcher and teardown share.
///
/// `request` serializes announce, heartbeat and poll calls. `matching`
/// serializes match passes and is only ever try-acquired by them.
/// `trading` serializes trade-offer submission.
#[derive(Debug)]
pub struct AccountLocks {
    pub request: Semaphore,
    pub matching: Semaphore,
    pub trading: Mutex<()>,
}

impl Default for AccountLocks {
    fn default() -> Self {
        Self {
            request: Semaphore::new(1),
            matching: Semaphore::new(1),
            trading: Mutex::new(()),
        }
    }
}

impl AccountLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_matching_active(&self) -> bool {
        self.matching.available_permits() == 0
    }

    /// `None` when a pass is already running.
    pub fn try_begin_match(&self) -> Option<SemaphorePermit<'_>> {
        self.matching.try_acquire().ok()
    }

    /// Wait until no request and no match pass is in flight, then hold
    /// both for as long as the returned permits live.
    pub async fn quiesce(&self) -> Option<(SemaphorePermit<'_>, SemaphorePermit<'_>)> {
        let request = self.request.acquire().await.ok()?;
        let matching = self.matching.acquire().await.ok()?;
        Some((request, matching))
    }

    /// Refuse every later acquisition. Permits already handed out stay valid.
    pub fn close(&self) {
        self.request.close();
        self.matching.close();
    }

    pub fn is_closed(&self) -> bool {
        self.request.is_closed()
    }
}
