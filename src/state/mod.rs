//! State management module for stackwarden.
//!
//! This module provides durable, lockable storage of the last-known state
//! of every stack, with encryption at rest for sensitive property values.

mod document;
mod local;
mod lock;
mod s3;
mod secrets;
mod store;
mod types;

pub use document::{DOCUMENT_VERSION, EncryptionHeader};
pub use local::{LocalStateStore, STATE_DIR};
pub use lock::{LOCK_EXPIRY, LockHandle, LockInfo, LockKeeper, generate_holder_id};
pub use s3::S3StateStore;
pub use secrets::{Passphrase, SealedValue, StateCipher};
pub use store::StateStore;
pub use types::{HistoryEntry, Operation, ResourceState, StackState};
