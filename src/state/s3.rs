//! S3-based state storage backend.
//!
//! This module provides remote state storage on AWS S3 (or compatible
//! services) so several machines can share one stack. Every write is
//! conditional: locks and first saves use `If-None-Match: *`, later saves
//! and lock renewals use `If-Match` on the ETag that was read, so only one
//! writer wins a race.

use async_trait::async_trait;
use aws_sdk_s3::Client;
use aws_sdk_s3::error::ProvideErrorMetadata;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::error::{Result, StateError};

use super::document;
use super::lock::{LOCK_EXPIRY, LockAttempt, LockHandle, LockInfo, acquire_within, generate_holder_id};
use super::secrets::Passphrase;
use super::store::StateStore;
use super::types::StackState;

/// State object name within a stack prefix.
const STATE_KEY: &str = "state.json";

/// Lock object name within a stack prefix.
const LOCK_KEY: &str = "state.lock";

/// Error codes S3 returns when a conditional write loses.
const LOST_RACE_CODES: [&str; 2] = ["PreconditionFailed", "ConditionalRequestConflict"];

/// Condition attached to a put.
#[derive(Debug, Clone, Copy)]
enum Precondition<'a> {
    /// The object must not exist yet.
    Absent,
    /// The object must still carry this ETag.
    Matches(&'a str),
}

/// An object body together with the ETag it was read at.
#[derive(Debug)]
struct Fetched {
    bytes: Vec<u8>,
    etag: Option<String>,
}

/// S3-based state store.
#[derive(Debug)]
pub struct S3StateStore {
    /// S3 client.
    client: Client,
    /// Bucket name.
    bucket: String,
    /// Key prefix.
    prefix: String,
    /// Identifies this process in lock records.
    holder: String,
    /// Passphrase for sensitive values.
    passphrase: Option<Passphrase>,
    /// Lifetime of a lock without renewal.
    lock_expiry: Duration,
}

impl S3StateStore {
    /// Creates a new S3 state store from the ambient AWS configuration.
    pub async fn new(bucket: &str, prefix: Option<&str>, region: Option<&str>) -> Self {
        let config = if let Some(region_str) = region {
            aws_config::from_env()
                .region(aws_config::Region::new(region_str.to_string()))
                .load()
                .await
        } else {
            aws_config::load_from_env().await
        };

        Self::with_client(Client::new(&config), bucket, prefix)
    }

    /// Creates a new S3 state store with an existing client.
    #[must_use]
    pub fn with_client(client: Client, bucket: &str, prefix: Option<&str>) -> Self {
        let prefix = prefix
            .map(|p| {
                let p = p.trim_matches('/');
                if p.is_empty() {
                    String::new()
                } else {
                    format!("{p}/")
                }
            })
            .unwrap_or_default();

        Self {
            client,
            bucket: bucket.to_string(),
            prefix,
            holder: generate_holder_id(),
            passphrase: None,
            lock_expiry: LOCK_EXPIRY,
        }
    }

    /// Overrides how long a lock stays valid without renewal.
    #[must_use]
    pub fn with_lock_expiry(mut self, expiry: Duration) -> Self {
        self.lock_expiry = expiry;
        self
    }

    /// Sets the passphrase used for sensitive values.
    #[must_use]
    pub fn with_passphrase(mut self, passphrase: Passphrase) -> Self {
        self.passphrase = Some(passphrase);
        self
    }

    /// Gets the full S3 key for a stack object.
    fn key(&self, stack: &str, file: &str) -> String {
        format!("{}{stack}/{file}", self.prefix)
    }

    /// Gets an object from S3.
    async fn get_object(&self, key: &str) -> Result<Option<Fetched>> {
        let result = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await;

        match result {
            Ok(response) => {
                let etag = response.e_tag().map(str::to_string);
                let bytes = response.body.collect().await.map_err(|e| {
                    StateError::backend(format!("Failed to read S3 object: {e}"))
                })?;
                Ok(Some(Fetched {
                    bytes: bytes.to_vec(),
                    etag,
                }))
            }
            Err(sdk_err) => {
                let service_err = sdk_err.into_service_error();
                if service_err.is_no_such_key() {
                    Ok(None)
                } else {
                    Err(StateError::backend(format!("S3 get error: {service_err}")).into())
                }
            }
        }
    }

    /// Puts an object to S3 under `condition`.
    ///
    /// Returns `Ok(false)` when the condition no longer holds.
    async fn put_object(&self, key: &str, content: Vec<u8>, condition: Precondition<'_>) -> Result<bool> {
        let request = self
            .client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(content.into())
            .content_type("application/json");
        let request = match condition {
            Precondition::Absent => request.if_none_match("*"),
            Precondition::Matches(etag) => request.if_match(etag),
        };

        match request.send().await {
            Ok(_) => Ok(true),
            Err(e) if e.code().is_some_and(|code| LOST_RACE_CODES.contains(&code)) => {
                debug!("Conditional put of {key} lost: {condition:?}");
                Ok(false)
            }
            Err(e) => Err(StateError::backend(format!("S3 put error: {e}")).into()),
        }
    }

    /// Deletes an object from S3.
    async fn delete_object(&self, key: &str) -> Result<()> {
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| StateError::backend(format!("S3 delete error: {e}")))?;

        Ok(())
    }

    async fn read_lock(&self, stack: &str) -> Result<Option<LockInfo>> {
        Ok(self.read_lock_tagged(stack).await?.map(|(info, _)| info))
    }

    async fn read_lock_tagged(&self, stack: &str) -> Result<Option<(LockInfo, Option<String>)>> {
        let Some(fetched) = self.get_object(&self.key(stack, LOCK_KEY)).await? else {
            return Ok(None);
        };
        let info = serde_json::from_slice(&fetched.bytes).map_err(|e| StateError::Corrupted {
            message: format!("Failed to parse lock: {e}"),
        })?;
        Ok(Some((info, fetched.etag)))
    }

    async fn stored_sequence(&self, key: &str) -> Result<u64> {
        match self.get_object(key).await? {
            Some(fetched) => document::stored_sequence(&fetched.bytes),
            None => Ok(0),
        }
    }

    /// One attempt at creating the lock object.
    async fn try_lock(&self, stack: &str) -> Result<LockAttempt> {
        let key = self.key(stack, LOCK_KEY);

        for _ in 0..2 {
            let info = LockInfo::with_expiry(&self.holder, self.lock_expiry);
            let content = serde_json::to_vec_pretty(&info)
                .map_err(|e| StateError::serialization(format!("Failed to serialize lock: {e}")))?;

            if self.put_object(&key, content, Precondition::Absent).await? {
                info!(
                    "Acquired state lock: {} (expires in {}s)",
                    info.lock_id,
                    self.lock_expiry.as_secs()
                );
                return Ok(LockAttempt::Acquired(info));
            }

            match self.read_lock(stack).await? {
                Some(existing) if existing.is_expired() => {
                    warn!(
                        "Taking over expired lock {} held by {}",
                        existing.lock_id, existing.holder
                    );
                    self.delete_object(&key).await?;
                }
                Some(existing) => return Ok(LockAttempt::Held(existing)),
                None => {}
            }
        }

        match self.read_lock(stack).await? {
            Some(existing) => Ok(LockAttempt::Held(existing)),
            None => Ok(LockAttempt::Held(LockInfo::new("unknown"))),
        }
    }
}

#[async_trait]
impl StateStore for S3StateStore {
    async fn lock(&self, stack: &str, timeout: Duration) -> Result<LockHandle> {
        acquire_within(stack, timeout, || self.try_lock(stack)).await
    }

    async fn release(&self, mut handle: LockHandle) -> Result<()> {
        handle.mark_released();
        let stack = handle.stack().to_string();

        match self.read_lock(&stack).await? {
            Some(existing) if existing.lock_id == handle.lock_id() => {
                self.delete_object(&self.key(&stack, LOCK_KEY)).await?;
                info!("Released state lock: {}", handle.lock_id());
                Ok(())
            }
            _ => Err(StateError::LockLost { stack }.into()),
        }
    }

    async fn renew(&self, stack: &str, lock_id: &str) -> Result<LockInfo> {
        let lost = || StateError::LockLost {
            stack: stack.to_string(),
        };
        let Some((existing, Some(etag))) = self.read_lock_tagged(stack).await? else {
            return Err(lost().into());
        };
        if existing.lock_id != lock_id {
            return Err(lost().into());
        }

        let renewed = existing.renewed(self.lock_expiry);
        let content = serde_json::to_vec_pretty(&renewed)
            .map_err(|e| StateError::serialization(format!("Failed to serialize lock: {e}")))?;
        if !self
            .put_object(&self.key(stack, LOCK_KEY), content, Precondition::Matches(&etag))
            .await?
        {
            return Err(lost().into());
        }
        debug!("Renewed state lock {lock_id} until {}", renewed.expires_at);
        Ok(renewed)
    }

    fn lock_expiry(&self) -> Duration {
        self.lock_expiry
    }

    async fn load(&self, stack: &str) -> Result<StackState> {
        let key = self.key(stack, STATE_KEY);
        debug!("Loading state from s3://{}/{key}", self.bucket);

        match self.get_object(&key).await? {
            Some(fetched) => {
                let state = document::decode(&fetched.bytes, self.passphrase.as_ref())?;
                info!("Loaded state for {} at sequence {}", stack, state.sequence);
                Ok(state)
            }
            None => {
                debug!("No state found in S3");
                Ok(StackState::empty(stack, ""))
            }
        }
    }

    async fn save(&self, stack: &str, state: &StackState, expected_sequence: u64) -> Result<()> {
        let key = self.key(stack, STATE_KEY);

        let current = self.get_object(&key).await?;
        let stored = match &current {
            Some(fetched) => document::stored_sequence(&fetched.bytes)?,
            None => 0,
        };
        let conflict = |found| StateError::Conflict {
            stack: stack.to_string(),
            expected: expected_sequence,
            found,
        };
        if stored != expected_sequence {
            return Err(conflict(stored).into());
        }

        let condition = match &current {
            Some(Fetched { etag: Some(etag), .. }) => Precondition::Matches(etag),
            Some(Fetched { etag: None, .. }) => {
                let message = format!("S3 returned no ETag for s3://{}/{key}", self.bucket);
                return Err(StateError::backend(message).into());
            }
            None => Precondition::Absent,
        };

        let content = document::encode(state, self.passphrase.as_ref())?;
        info!("Saving state to s3://{}/{key}", self.bucket);
        if !self.put_object(&key, content, condition).await? {
            // Someone wrote between our read and our put.
            let found = self.stored_sequence(&key).await?;
            warn!("State for '{stack}' changed during save (now at sequence {found})");
            return Err(conflict(found).into());
        }

        debug!("State saved to S3 at sequence {}", state.sequence);
        Ok(())
    }

    async fn delete(&self, stack: &str) -> Result<()> {
        let key = self.key(stack, STATE_KEY);

        if self.get_object(&key).await?.is_none() {
            return Err(StateError::NotFound {
                stack: stack.to_string(),
            }
            .into());
        }

        info!("Deleting state from s3://{}/{key}", self.bucket);
        self.delete_object(&key).await
    }

    async fn lock_info(&self, stack: &str) -> Result<Option<LockInfo>> {
        self.read_lock(stack).await
    }

    async fn force_unlock(&self, stack: &str) -> Result<bool> {
        if self.read_lock(stack).await?.is_none() {
            return Ok(false);
        }
        self.delete_object(&self.key(stack, LOCK_KEY)).await?;
        warn!("Force-removed lock on '{stack}'");
        Ok(true)
    }

    fn backend_type(&self) -> &'static str {
        "s3"
    }
}
