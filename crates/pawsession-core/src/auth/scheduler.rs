//! Proactive token renewal.
//!
//! One timer at a time: arming a new one aborts whatever was pending, so
//! a burst of expiry updates leaves only the latest renewal armed.

use std::future::Future;
use std::sync::Mutex;

use chrono::{DateTime, Duration, Utc};
use tokio::task::JoinHandle;
use tracing::debug;

struct PendingTimer {
    handle: JoinHandle<()>,
    fires_at: DateTime<Utc>,
}

pub struct RenewalScheduler {
    lead: Duration,
    pending: Mutex<Option<PendingTimer>>,
}

impl std::fmt::Debug for RenewalScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RenewalScheduler")
            .field("lead", &self.lead)
            .field("next_fire", &self.next_fire())
            .finish()
    }
}

impl RenewalScheduler {
    pub fn new(lead: Duration) -> Self {
        Self {
            lead,
            pending: Mutex::new(None),
        }
    }

    pub fn lead(&self) -> Duration {
        self.lead
    }

    /// How long to wait before renewing a token that expires at `expiry`.
    /// Zero when already inside the lead window or past expiry.
    pub fn delay_until_fire(&self, expiry: DateTime<Utc>, now: DateTime<Utc>) -> std::time::Duration {
        (expiry - self.lead - now)
            .to_std()
            .unwrap_or(std::time::Duration::ZERO)
    }

    /// Whether a token expiring at `expiry` is already due for renewal
    pub fn is_due(&self, expiry: DateTime<Utc>, now: DateTime<Utc>) -> bool {
        self.delay_until_fire(expiry, now).is_zero()
    }

    /// Arm the timer for `expiry`, replacing any pending one.
    ///
    /// `fire` runs in its own task so it may reschedule without aborting
    /// itself. Must be called from within a tokio runtime.
    pub fn schedule<F, Fut>(&self, expiry: DateTime<Utc>, fire: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let now = Utc::now();
        let delay = self.delay_until_fire(expiry, now);
        let fires_at = now + Duration::from_std(delay).unwrap_or_else(|_| Duration::zero());

        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            debug!("Renewal timer fired");
            tokio::spawn(fire());
        });

        let previous = self
            .lock()
            .replace(PendingTimer { handle, fires_at });
        if let Some(previous) = previous {
            previous.handle.abort();
        }
        debug!(%expiry, delay_secs = delay.as_secs(), "Renewal scheduled");
    }

    pub fn cancel(&self) {
        if let Some(pending) = self.lock().take() {
            pending.handle.abort();
            debug!("Renewal timer cancelled");
        }
    }

    /// When the armed timer will fire, if one is still pending
    pub fn next_fire(&self) -> Option<DateTime<Utc>> {
        self.lock()
            .as_ref()
            .filter(|p| !p.handle.is_finished())
            .map(|p| p.fires_at)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Option<PendingTimer>> {
        self.pending.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Drop for RenewalScheduler {
    fn drop(&mut self) {
        self.cancel();
    }
}
