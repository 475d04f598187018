//! Local file-based state storage backend.
//!
//! One document and one lock file per stack inside a base directory. The
//! lock file is created with `create_new`, so two processes on the same
//! machine cannot both own it.

use async_trait::async_trait;
use std::io::ErrorKind as IoErrorKind;
use std::path::PathBuf;
use std::time::Duration;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

use crate::error::{Result, StateError, WardenError};

use super::document;
use super::lock::{LOCK_EXPIRY, LockAttempt, LockHandle, LockInfo, acquire_within, generate_holder_id};
use super::secrets::Passphrase;
use super::store::StateStore;
use super::types::StackState;

/// Default state directory name.
pub const STATE_DIR: &str = ".stackwarden";

/// Local file-based state store.
#[derive(Debug)]
pub struct LocalStateStore {
    /// Base directory for state files.
    base_dir: PathBuf,
    /// Identifies this process in lock records.
    holder: String,
    /// Passphrase for sensitive values.
    passphrase: Option<Passphrase>,
    /// Lifetime of a lock without renewal.
    lock_expiry: Duration,
}

impl LocalStateStore {
    /// Creates a new local state store under the current directory.
    ///
    /// # Errors
    ///
    /// Returns an error if the current directory cannot be determined.
    pub fn new() -> Result<Self> {
        let base_dir = std::env::current_dir()
            .map_err(|e| WardenError::internal(format!("Cannot determine current directory: {e}")))?
            .join(STATE_DIR);

        Ok(Self::with_base_dir(base_dir))
    }

    /// Creates a new local state store with a custom base directory.
    #[must_use]
    pub fn with_base_dir(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
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

    fn state_path(&self, stack: &str) -> PathBuf {
        self.base_dir.join(format!("{stack}.json"))
    }

    fn lock_path(&self, stack: &str) -> PathBuf {
        self.base_dir.join(format!("{stack}.lock"))
    }

    /// Ensures the state directory exists.
    async fn ensure_dir(&self) -> Result<()> {
        if !self.base_dir.exists() {
            debug!("Creating state directory: {}", self.base_dir.display());
            fs::create_dir_all(&self.base_dir).await.map_err(|e| {
                StateError::backend(format!("Failed to create state directory: {e}"))
            })?;
        }
        Ok(())
    }

    /// Reads the lock file if it exists.
    async fn read_lock_file(&self, stack: &str) -> Result<Option<LockInfo>> {
        let content = match fs::read_to_string(self.lock_path(stack)).await {
            Ok(content) => content,
            Err(e) if e.kind() == IoErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(StateError::Corrupted {
                    message: format!("Failed to read lock file: {e}"),
                }
                .into());
            }
        };

        let lock_info: LockInfo = serde_json::from_str(&content).map_err(|e| {
            StateError::Corrupted {
                message: format!("Failed to parse lock file: {e}"),
            }
        })?;

        Ok(Some(lock_info))
    }

    /// Deletes the lock file.
    async fn delete_lock_file(&self, stack: &str) -> Result<bool> {
        match fs::remove_file(self.lock_path(stack)).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == IoErrorKind::NotFound => Ok(false),
            Err(e) => Err(StateError::backend(format!("Failed to delete lock file: {e}")).into()),
        }
    }

    /// One attempt at creating the lock file.
    async fn try_lock(&self, stack: &str) -> Result<LockAttempt> {
        self.ensure_dir().await?;
        let path = self.lock_path(stack);

        // A second pass only happens after removing an expired lock.
        for _ in 0..2 {
            match fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&path)
                .await
            {
                Ok(mut file) => {
                    let info = LockInfo::with_expiry(&self.holder, self.lock_expiry);
                    let content = serde_json::to_vec_pretty(&info).map_err(|e| {
                        StateError::serialization(format!("Failed to serialize lock: {e}"))
                    })?;
                    file.write_all(&content).await.map_err(|e| {
                        StateError::backend(format!("Failed to write lock file: {e}"))
                    })?;
                    file.sync_all().await.map_err(|e| {
                        StateError::backend(format!("Failed to sync lock file: {e}"))
                    })?;
                    info!(
                        "Acquired state lock: {} (expires in {}s)",
                        info.lock_id,
                        self.lock_expiry.as_secs()
                    );
                    return Ok(LockAttempt::Acquired(info));
                }
                Err(e) if e.kind() == IoErrorKind::AlreadyExists => {
                    match self.read_lock_file(stack).await {
                        Ok(Some(existing)) if existing.is_expired() => {
                            warn!(
                                "Taking over expired lock {} held by {}",
                                existing.lock_id, existing.holder
                            );
                            self.delete_lock_file(stack).await?;
                        }
                        Ok(Some(existing)) => return Ok(LockAttempt::Held(existing)),
                        // Vanished between create and read: just retry.
                        Ok(None) => {}
                        // Being written right now by its creator.
                        Err(_) => return Ok(LockAttempt::Held(LockInfo::new("unknown"))),
                    }
                }
                Err(e) => {
                    return Err(StateError::backend(format!("Failed to create lock file: {e}")).into());
                }
            }
        }

        match self.read_lock_file(stack).await? {
            Some(existing) => Ok(LockAttempt::Held(existing)),
            None => Ok(LockAttempt::Held(LockInfo::new("unknown"))),
        }
    }

    /// Replaces the lock file in one rename so readers never see it empty.
    async fn rewrite_lock_file(&self, stack: &str, info: &LockInfo) -> Result<()> {
        let content = serde_json::to_vec_pretty(info)
            .map_err(|e| StateError::serialization(format!("Failed to serialize lock: {e}")))?;
        let path = self.lock_path(stack);
        let temp_path = path.with_extension("lock.tmp");

        fs::write(&temp_path, &content)
            .await
            .map_err(|e| StateError::backend(format!("Failed to write lock file: {e}")))?;
        fs::rename(&temp_path, &path)
            .await
            .map_err(|e| StateError::backend(format!("Failed to rename lock file: {e}")))?;
        Ok(())
    }

    async fn read_state_bytes(&self, stack: &str) -> Result<Option<Vec<u8>>> {
        match fs::read(self.state_path(stack)).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == IoErrorKind::NotFound => Ok(None),
            Err(e) => Err(StateError::Corrupted {
                message: format!("Failed to read state file: {e}"),
            }
            .into()),
        }
    }
}

#[async_trait]
impl StateStore for LocalStateStore {
    async fn lock(&self, stack: &str, timeout: Duration) -> Result<LockHandle> {
        acquire_within(stack, timeout, || self.try_lock(stack)).await
    }

    async fn release(&self, mut handle: LockHandle) -> Result<()> {
        handle.mark_released();
        let stack = handle.stack().to_string();

        match self.read_lock_file(&stack).await? {
            Some(existing) if existing.lock_id == handle.lock_id() => {
                self.delete_lock_file(&stack).await?;
                info!("Released state lock: {}", handle.lock_id());
                Ok(())
            }
            _ => Err(StateError::LockLost { stack }.into()),
        }
    }

    async fn renew(&self, stack: &str, lock_id: &str) -> Result<LockInfo> {
        match self.read_lock_file(stack).await? {
            Some(existing) if existing.lock_id == lock_id => {
                let renewed = existing.renewed(self.lock_expiry);
                self.rewrite_lock_file(stack, &renewed).await?;
                debug!("Renewed state lock {lock_id} until {}", renewed.expires_at);
                Ok(renewed)
            }
            _ => Err(StateError::LockLost {
                stack: stack.to_string(),
            }
            .into()),
        }
    }

    fn lock_expiry(&self) -> Duration {
        self.lock_expiry
    }

    async fn load(&self, stack: &str) -> Result<StackState> {
        let Some(bytes) = self.read_state_bytes(stack).await? else {
            debug!("No state for '{stack}' yet");
            return Ok(StackState::empty(stack, ""));
        };

        info!("Loading state from: {}", self.state_path(stack).display());
        document::decode(&bytes, self.passphrase.as_ref())
    }

    async fn save(&self, stack: &str, state: &StackState, expected_sequence: u64) -> Result<()> {
        self.ensure_dir().await?;

        let stored = match self.read_state_bytes(stack).await? {
            Some(bytes) => document::stored_sequence(&bytes)?,
            None => 0,
        };
        if stored != expected_sequence {
            return Err(StateError::Conflict {
                stack: stack.to_string(),
                expected: expected_sequence,
                found: stored,
            }
            .into());
        }

        let content = document::encode(state, self.passphrase.as_ref())?;
        let state_path = self.state_path(stack);
        info!("Saving state to: {}", state_path.display());

        // Write to a temporary file first, then rename for atomicity
        let temp_path = state_path.with_extension("json.tmp");

        let mut file = fs::File::create(&temp_path).await.map_err(|e| {
            StateError::backend(format!("Failed to create temp state file: {e}"))
        })?;
        file.write_all(&content)
            .await
            .map_err(|e| StateError::backend(format!("Failed to write state file: {e}")))?;
        file.sync_all()
            .await
            .map_err(|e| StateError::backend(format!("Failed to sync state file: {e}")))?;

        fs::rename(&temp_path, &state_path)
            .await
            .map_err(|e| StateError::backend(format!("Failed to rename state file: {e}")))?;

        debug!("State saved at sequence {}", state.sequence);
        Ok(())
    }

    async fn delete(&self, stack: &str) -> Result<()> {
        match fs::remove_file(self.state_path(stack)).await {
            Ok(()) => {
                info!("Deleted state for '{stack}'");
                Ok(())
            }
            Err(e) if e.kind() == IoErrorKind::NotFound => Err(StateError::NotFound {
                stack: stack.to_string(),
            }
            .into()),
            Err(e) => Err(StateError::backend(format!("Failed to delete state file: {e}")).into()),
        }
    }

    async fn lock_info(&self, stack: &str) -> Result<Option<LockInfo>> {
        self.read_lock_file(stack).await
    }

    async fn force_unlock(&self, stack: &str) -> Result<bool> {
        let removed = self.delete_lock_file(stack).await?;
        if removed {
            warn!("Force-removed lock on '{stack}'");
        }
        Ok(removed)
    }

    fn backend_type(&self) -> &'static str {
        "local"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{PropertyMap, ResourceSpec};
    use crate::error::ErrorKind;
    use crate::state::LockKeeper;
    use crate::state::types::ResourceState;
    use std::sync::Arc;
    use tempfile::TempDir;
    use tokio_util::sync::CancellationToken;

    const STACK: &str = "dev-create-s3-bucket";

    fn create_test_store() -> (LocalStateStore, TempDir) {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let store = LocalStateStore::with_base_dir(temp_dir.path());
        (store, temp_dir)
    }

    fn state_with(names: &[&str]) -> StackState {
        let mut state = StackState::empty(STACK, "dev");
        for name in names {
            state.record(ResourceState::from_spec(
                &ResourceSpec::new(*name, "bucket"),
                format!("id-{name}"),
                PropertyMap::new(),
                "fp",
            ));
        }
        state
    }

    #[tokio::test]
    async fn test_load_missing_is_empty() {
        let (store, _temp) = create_test_store();
        let state = store.load(STACK).await.unwrap();
        assert!(state.is_empty());
        assert_eq!(state.sequence, 0);
    }

    #[tokio::test]
    async fn test_save_and_load() {
        let (store, _temp) = create_test_store();
        let state = state_with(&["bucket-a"]);

        store.save(STACK, &state, 0).await.unwrap();
        let loaded = store.load(STACK).await.unwrap();
        assert_eq!(loaded, state);
        assert_eq!(loaded.sequence, 1);
    }

    #[tokio::test]
    async fn test_stale_sequence_conflicts_without_writing() {
        let (store, _temp) = create_test_store();
        let first = state_with(&["bucket-a"]);
        store.save(STACK, &first, 0).await.unwrap();

        let second = state_with(&["bucket-a", "bucket-b"]);
        let err = store.save(STACK, &second, 0).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Conflict);

        let loaded = store.load(STACK).await.unwrap();
        assert_eq!(loaded, first);
    }

    #[tokio::test]
    async fn test_sensitive_values_encrypted_on_disk() {
        let temp = TempDir::new().unwrap();
        let store = LocalStateStore::with_base_dir(temp.path())
            .with_passphrase(Passphrase::new("local passphrase").unwrap());

        let spec = ResourceSpec::new("db-a", "database")
            .with_property("password", "hunter2")
            .with_sensitive("password");
        let mut state = StackState::empty(STACK, "dev");
        state.record(ResourceState::from_spec(&spec, "db-1", PropertyMap::new(), "fp"));

        store.save(STACK, &state, 0).await.unwrap();
        let raw = std::fs::read_to_string(temp.path().join(format!("{STACK}.json"))).unwrap();
        assert!(!raw.contains("hunter2"));

        let loaded = store.load(STACK).await.unwrap();
        assert_eq!(loaded.get("db-a").unwrap().properties["password"], "hunter2");
    }

    #[tokio::test]
    async fn test_delete() {
        let (store, _temp) = create_test_store();
        let err = store.delete(STACK).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);

        tokio_test::assert_ok!(store.save(STACK, &state_with(&["bucket-a"]), 0).await);
        tokio_test::assert_ok!(store.delete(STACK).await);
        assert!(store.load(STACK).await.unwrap().is_empty());
        tokio_test::assert_err!(store.delete(STACK).await);
    }

    #[tokio::test]
    async fn test_lock_release() {
        let (store, _temp) = create_test_store();

        let handle = store.lock(STACK, Duration::from_secs(1)).await.unwrap();
        assert!(store.lock_info(STACK).await.unwrap().is_some());

        store.release(handle).await.unwrap();
        assert!(store.lock_info(STACK).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_lock_is_exclusive() {
        let (store, _temp) = create_test_store();

        let handle = store.lock(STACK, Duration::from_secs(1)).await.unwrap();
        let err = store
            .lock(STACK, Duration::from_millis(100))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::LockTimeout);

        store.release(handle).await.unwrap();
        let again = store.lock(STACK, Duration::from_millis(100)).await.unwrap();
        store.release(again).await.unwrap();
    }

    #[tokio::test]
    async fn test_expired_lock_is_taken_over() {
        let (store, temp) = create_test_store();
        let mut stale = LockInfo::new("crashed-process");
        stale.expires_at = chrono::Utc::now() - chrono::Duration::seconds(1);
        std::fs::write(
            temp.path().join(format!("{STACK}.lock")),
            serde_json::to_string(&stale).unwrap(),
        )
        .unwrap();

        let handle = store.lock(STACK, Duration::from_millis(100)).await.unwrap();
        assert_ne!(handle.lock_id(), stale.lock_id);
        store.release(handle).await.unwrap();
    }

    #[tokio::test]
    async fn test_renew_extends_only_own_lock() {
        let (store, _temp) = create_test_store();
        let store = store.with_lock_expiry(Duration::from_secs(2));
        let handle = store.lock(STACK, Duration::from_secs(1)).await.unwrap();
        let before = store.lock_info(STACK).await.unwrap().unwrap();

        tokio::time::sleep(Duration::from_millis(20)).await;
        let renewed = store.renew(STACK, handle.lock_id()).await.unwrap();
        assert_eq!(renewed.lock_id, before.lock_id);
        assert!(renewed.expires_at > before.expires_at);
        assert_eq!(store.lock_info(STACK).await.unwrap().unwrap(), renewed);

        let err = store.renew(STACK, "someone-else").await.unwrap_err();
        assert!(matches!(err, WardenError::State(StateError::LockLost { .. })));
        store.release(handle).await.unwrap();
    }

    #[tokio::test]
    async fn test_keeper_holds_lock_past_expiry() {
        let temp = TempDir::new().unwrap();
        let expiry = Duration::from_millis(300);
        let owner: Arc<dyn StateStore> =
            Arc::new(LocalStateStore::with_base_dir(temp.path()).with_lock_expiry(expiry));
        let rival = LocalStateStore::with_base_dir(temp.path()).with_lock_expiry(expiry);

        let handle = owner.lock(STACK, Duration::from_secs(1)).await.unwrap();
        let lost = CancellationToken::new();
        let keeper = LockKeeper::spawn(
            owner.clone(),
            STACK.to_string(),
            handle.lock_id().to_string(),
            LockKeeper::period_for(expiry),
            lost.clone(),
        );

        // Three expiry windows pass while the keeper runs.
        tokio::time::sleep(expiry * 3).await;
        let err = rival.lock(STACK, Duration::from_millis(50)).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::LockTimeout);
        assert!(!lost.is_cancelled());

        keeper.stop().await;
        owner.release(handle).await.unwrap();
    }

    #[tokio::test]
    async fn test_unrenewed_lock_is_taken_over() {
        let temp = TempDir::new().unwrap();
        let expiry = Duration::from_millis(100);
        let owner = LocalStateStore::with_base_dir(temp.path()).with_lock_expiry(expiry);
        let rival = LocalStateStore::with_base_dir(temp.path()).with_lock_expiry(expiry);

        let handle = owner.lock(STACK, Duration::from_secs(1)).await.unwrap();
        tokio::time::sleep(expiry * 2).await;
        let taken = rival.lock(STACK, Duration::from_millis(50)).await.unwrap();

        let err = owner.release(handle).await.unwrap_err();
        assert!(matches!(err, WardenError::State(StateError::LockLost { .. })));
        rival.release(taken).await.unwrap();
    }

    #[tokio::test]
    async fn test_keeper_cancels_when_lock_is_taken() {
        let temp = TempDir::new().unwrap();
        let owner: Arc<dyn StateStore> = Arc::new(LocalStateStore::with_base_dir(temp.path()));
        let mut handle = owner.lock(STACK, Duration::from_secs(1)).await.unwrap();
        owner.force_unlock(STACK).await.unwrap();

        let lost = CancellationToken::new();
        let keeper = LockKeeper::spawn(
            owner.clone(),
            STACK.to_string(),
            handle.lock_id().to_string(),
            Duration::from_millis(10),
            lost.clone(),
        );
        tokio::time::timeout(Duration::from_secs(2), lost.cancelled())
            .await
            .unwrap();
        keeper.stop().await;
        handle.mark_released();
    }

    #[tokio::test]
    async fn test_force_unlock() {
        let (store, _temp) = create_test_store();
        let mut handle = store.lock(STACK, Duration::from_secs(1)).await.unwrap();
        assert!(store.force_unlock(STACK).await.unwrap());
        assert!(!store.force_unlock(STACK).await.unwrap());

        // The handle no longer matches anything on disk.
        handle.mark_released();
    }
}
