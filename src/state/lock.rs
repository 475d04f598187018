//! Stack locking for cross-process exclusion.
//!
//! Each backend stores a [`LockInfo`] record next to the stack state. A
//! [`LockHandle`] is the in-process proof of ownership and must be handed
//! back to [`StateStore::release`](super::StateStore::release).
//!
//! Locks expire so a crashed holder cannot block a stack forever. A live
//! holder keeps its lock with a [`LockKeeper`], which pushes the expiry
//! forward on a timer until the pass ends.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};
use uuid::Uuid;

use super::store::StateStore;
use crate::error::{Result, StateError, WardenError};

/// Default lock expiry. Expired locks may be taken over.
pub const LOCK_EXPIRY: Duration = Duration::from_secs(300);

/// Interval between acquisition attempts while a lock is held elsewhere.
const LOCK_POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Information about a stack lock.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LockInfo {
    /// Unique lock identifier.
    pub lock_id: String,
    /// Who holds the lock.
    pub holder: String,
    /// When the lock was acquired.
    pub acquired_at: DateTime<Utc>,
    /// When the lock expires.
    pub expires_at: DateTime<Utc>,
}

impl LockInfo {
    /// Creates a new lock info with the default expiry.
    #[must_use]
    pub fn new(holder: &str) -> Self {
        Self::with_expiry(holder, LOCK_EXPIRY)
    }

    /// Creates a new lock info that expires after `expiry`.
    #[must_use]
    pub fn with_expiry(holder: &str, expiry: Duration) -> Self {
        let now = Utc::now();
        Self {
            lock_id: Uuid::new_v4().to_string(),
            holder: holder.to_string(),
            acquired_at: now,
            expires_at: now + to_chrono(expiry),
        }
    }

    /// Returns the same lock with its expiry pushed `expiry` past now.
    #[must_use]
    pub fn renewed(&self, expiry: Duration) -> Self {
        Self {
            expires_at: Utc::now() + to_chrono(expiry),
            ..self.clone()
        }
    }

    /// Checks if the lock has expired.
    #[must_use]
    pub fn is_expired(&self) -> bool {
        Utc::now() > self.expires_at
    }

    /// Returns the remaining time until expiry in seconds.
    #[must_use]
    pub fn remaining_secs(&self) -> i64 {
        let remaining = self.expires_at - Utc::now();
        remaining.num_seconds().max(0)
    }
}

/// Outcome of a single acquisition attempt.
#[derive(Debug)]
pub enum LockAttempt {
    /// The lock is ours.
    Acquired(LockInfo),
    /// Someone else holds a live lock.
    Held(LockInfo),
}

/// Exclusive ownership of a stack lock.
#[derive(Debug)]
pub struct LockHandle {
    stack: String,
    info: LockInfo,
    released: bool,
}

impl LockHandle {
    /// Wraps a freshly acquired lock.
    #[must_use]
    pub const fn new(stack: String, info: LockInfo) -> Self {
        Self {
            stack,
            info,
            released: false,
        }
    }

    /// Stack this lock protects.
    #[must_use]
    pub fn stack(&self) -> &str {
        &self.stack
    }

    /// Gets the lock ID.
    #[must_use]
    pub fn lock_id(&self) -> &str {
        &self.info.lock_id
    }

    /// Gets the lock info.
    #[must_use]
    pub const fn info(&self) -> &LockInfo {
        &self.info
    }

    /// Marks the handle as returned to its store.
    pub fn mark_released(&mut self) {
        self.released = true;
    }
}

impl Drop for LockHandle {
    fn drop(&mut self) {
        if !self.released {
            warn!(
                "Lock {} on '{}' dropped without release; it expires at {}",
                self.info.lock_id, self.stack, self.info.expires_at
            );
        }
    }
}

/// Retries `attempt` until it acquires the lock or `timeout` elapses.
///
/// # Errors
///
/// Returns `LockTimeout` naming the current holder, or whatever error
/// `attempt` produces.
pub async fn acquire_within<F, Fut>(stack: &str, timeout: Duration, mut attempt: F) -> Result<LockHandle>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<LockAttempt>>,
{
    let started = Instant::now();

    loop {
        match attempt().await? {
            LockAttempt::Acquired(info) => {
                debug!("Acquired lock {} on '{stack}'", info.lock_id);
                return Ok(LockHandle::new(stack.to_string(), info));
            }
            LockAttempt::Held(existing) => {
                let waited = started.elapsed();
                if waited >= timeout {
                    return Err(StateError::LockTimeout {
                        stack: stack.to_string(),
                        holder: existing.holder,
                        waited_secs: waited.as_secs(),
                    }
                    .into());
                }
                debug!(
                    "Lock on '{stack}' held by {} (expires in {}s), waiting",
                    existing.holder,
                    existing.remaining_secs()
                );
                tokio::time::sleep(LOCK_POLL_INTERVAL.min(timeout.saturating_sub(waited))).await;
            }
        }
    }
}

/// Keeps a held lock alive by renewing it on a fixed period.
///
/// Renewal runs as a background task until [`stop`](Self::stop) is called.
/// If the store reports that the lock now belongs to someone else, the
/// keeper cancels `on_lost` so the pass stops dispatching work.
#[derive(Debug)]
pub struct LockKeeper {
    stop: CancellationToken,
    task: JoinHandle<()>,
}

impl LockKeeper {
    /// Starts renewing `lock_id` on `stack` every `period`.
    #[must_use]
    pub fn spawn(
        store: Arc<dyn StateStore>,
        stack: String,
        lock_id: String,
        period: Duration,
        on_lost: CancellationToken,
    ) -> Self {
        let stop = CancellationToken::new();
        let token = stop.clone();

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    () = token.cancelled() => break,
                    _ = ticker.tick() => {}
                }

                match store.renew(&stack, &lock_id).await {
                    Ok(info) => debug!("Renewed lock {lock_id} on '{stack}' until {}", info.expires_at),
                    Err(WardenError::State(StateError::LockLost { .. })) => {
                        error!("Lock {lock_id} on '{stack}' was taken over; cancelling the pass");
                        on_lost.cancel();
                        break;
                    }
                    // Transient; the next tick tries again before expiry.
                    Err(e) => warn!("Failed to renew lock {lock_id} on '{stack}': {e}"),
                }
            }
        });

        Self { stop, task }
    }

    /// Renewal period for a lock that expires after `expiry`.
    #[must_use]
    pub fn period_for(expiry: Duration) -> Duration {
        (expiry / 3).max(Duration::from_millis(10))
    }

    /// Stops renewing and waits for the task to finish.
    pub async fn stop(self) {
        self.stop.cancel();
        if let Err(e) = self.task.await {
            warn!("Lock renewal task ended abnormally: {e}");
        }
    }
}

fn to_chrono(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or_else(|_| chrono::Duration::seconds(300))
}

/// Generates a unique holder identifier for the current process.
#[must_use]
pub fn generate_holder_id() -> String {
    let hostname = hostname::get()
        .map_or_else(|_| String::from("unknown"), |h| h.to_string_lossy().to_string());

    let pid = std::process::id();
    let uuid = &Uuid::new_v4().to_string()[..8];

    format!("{hostname}-{pid}-{uuid}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{ErrorKind, WardenError};

    #[test]
    fn test_lock_info_creation() {
        let info = LockInfo::new("test-holder");
        assert_eq!(info.holder, "test-holder");
        assert!(!info.is_expired());
        assert!(info.remaining_secs() > 0);
    }

    #[test]
    fn test_holder_id_generation() {
        let id1 = generate_holder_id();
        let id2 = generate_holder_id();
        assert_ne!(id1, id2);
        assert!(id1.contains(&std::process::id().to_string()));
    }

    #[tokio::test]
    async fn test_acquire_after_waiting() {
        let mut calls = 0;
        let handle = acquire_within("dev", Duration::from_secs(5), || {
            calls += 1;
            let outcome = if calls < 3 {
                LockAttempt::Held(LockInfo::new("other"))
            } else {
                LockAttempt::Acquired(LockInfo::new("me"))
            };
            async move { Ok::<_, WardenError>(outcome) }
        })
        .await
        .unwrap();

        assert_eq!(handle.stack(), "dev");
        assert_eq!(handle.info().holder, "me");
        let mut handle = handle;
        handle.mark_released();
    }

    #[test]
    fn test_renewed_keeps_identity() {
        let info = LockInfo::with_expiry("me", Duration::from_secs(1));
        let renewed = info.renewed(Duration::from_secs(600));
        assert_eq!(renewed.lock_id, info.lock_id);
        assert_eq!(renewed.acquired_at, info.acquired_at);
        assert!(renewed.expires_at > info.expires_at);
        assert!(renewed.remaining_secs() > 500);
    }

    #[test]
    fn test_keeper_period_is_a_third_of_expiry() {
        assert_eq!(LockKeeper::period_for(LOCK_EXPIRY), Duration::from_secs(100));
        assert_eq!(LockKeeper::period_for(Duration::ZERO), Duration::from_millis(10));
    }

    #[tokio::test]
    async fn test_timeout_names_holder() {
        let err = acquire_within("dev", Duration::from_millis(50), || async {
            Ok(LockAttempt::Held(LockInfo::new("ci-runner")))
        })
        .await
        .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::LockTimeout);
        assert!(err.to_string().contains("ci-runner"));
    }
}
