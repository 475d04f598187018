//! State store trait definition.
//!
//! This module defines the common interface for state storage backends.

use async_trait::async_trait;
use std::time::Duration;

use super::lock::{LOCK_EXPIRY, LockHandle, LockInfo};
use super::types::StackState;
use crate::error::Result;

/// Durable, lockable persistence for stack state.
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Acquires the exclusive lock for a stack, waiting up to `timeout`.
    ///
    /// The lock is not reentrant: a second call from the same process waits
    /// like any other holder would.
    async fn lock(&self, stack: &str, timeout: Duration) -> Result<LockHandle>;

    /// Releases a lock previously returned by [`lock`](Self::lock).
    async fn release(&self, handle: LockHandle) -> Result<()>;

    /// Pushes the expiry of a held lock forward by [`lock_expiry`](Self::lock_expiry).
    ///
    /// Fails with `LockLost` if `lock_id` no longer owns the stack.
    async fn renew(&self, stack: &str, lock_id: &str) -> Result<LockInfo>;

    /// How long a lock stays valid without renewal.
    fn lock_expiry(&self) -> Duration {
        LOCK_EXPIRY
    }

    /// Loads the state of a stack.
    ///
    /// Returns an empty state with sequence 0 if none exists yet.
    async fn load(&self, stack: &str) -> Result<StackState>;

    /// Saves the state if the stored sequence equals `expected_sequence`.
    ///
    /// A mismatch fails with `Conflict` and leaves the stored state untouched.
    async fn save(&self, stack: &str, state: &StackState, expected_sequence: u64) -> Result<()>;

    /// Deletes the state of a stack. Fails with `NotFound` if none exists.
    async fn delete(&self, stack: &str) -> Result<()>;

    /// Gets current lock information, if any.
    async fn lock_info(&self, stack: &str) -> Result<Option<LockInfo>>;

    /// Removes a lock regardless of holder. Returns true if one existed.
    async fn force_unlock(&self, stack: &str) -> Result<bool>;

    /// Gets the backend type name.
    fn backend_type(&self) -> &'static str;
}

#[async_trait]
impl StateStore for Box<dyn StateStore> {
    async fn lock(&self, stack: &str, timeout: Duration) -> Result<LockHandle> {
        (**self).lock(stack, timeout).await
    }

    async fn release(&self, handle: LockHandle) -> Result<()> {
        (**self).release(handle).await
    }

    async fn renew(&self, stack: &str, lock_id: &str) -> Result<LockInfo> {
        (**self).renew(stack, lock_id).await
    }

    fn lock_expiry(&self) -> Duration {
        (**self).lock_expiry()
    }

    async fn load(&self, stack: &str) -> Result<StackState> {
        (**self).load(stack).await
    }

    async fn save(&self, stack: &str, state: &StackState, expected_sequence: u64) -> Result<()> {
        (**self).save(stack, state, expected_sequence).await
    }

    async fn delete(&self, stack: &str) -> Result<()> {
        (**self).delete(stack).await
    }

    async fn lock_info(&self, stack: &str) -> Result<Option<LockInfo>> {
        (**self).lock_info(stack).await
    }

    async fn force_unlock(&self, stack: &str) -> Result<bool> {
        (**self).force_unlock(stack).await
    }

    fn backend_type(&self) -> &'static str {
        (**self).backend_type()
    }
}
