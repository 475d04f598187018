//! The versioned on-disk document that wraps a [`StackState`].
//!
//! Sensitive property values are replaced by `{"$sealed": {...}}` markers
//! before serialization and restored on load. Both backends store exactly
//! these bytes.

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use super::secrets::{Passphrase, SealedValue};
use super::types::StackState;
use crate::error::{Result, StateError};

/// Current document format version.
pub const DOCUMENT_VERSION: u32 = 1;

/// Marker key for sealed values.
const SEALED_KEY: &str = "$sealed";

/// Encryption metadata kept alongside the state.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct EncryptionHeader {
    /// Base64 salt of the key derivation.
    pub salt: String,
    /// Sealed check value used to detect a wrong passphrase.
    pub check: SealedValue,
}

#[derive(Serialize, Deserialize)]
struct StateDocument {
    version: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    encryption: Option<EncryptionHeader>,
    state: StackState,
}

/// Just enough of a document to compare sequences without decrypting.
#[derive(Deserialize)]
struct DocumentHead {
    version: u32,
    state: StateHead,
}

#[derive(Deserialize)]
struct StateHead {
    sequence: u64,
}

/// Serializes a state, sealing sensitive values.
///
/// # Errors
///
/// Returns an encryption error if sensitive values exist and no passphrase
/// was supplied, or a serialization error.
pub fn encode(state: &StackState, passphrase: Option<&Passphrase>) -> Result<Vec<u8>> {
    let mut stored = state.clone();
    let mut encryption = None;

    if stored.has_sensitive_values() {
        let passphrase = passphrase.ok_or_else(|| {
            StateError::encryption("State holds sensitive values but no passphrase is configured")
        })?;
        let cipher = passphrase.fresh_cipher()?;

        for resource in stored.resources.values_mut() {
            for key in &resource.sensitive {
                for map in [&mut resource.properties, &mut resource.outputs] {
                    if let Some(value) = map.get_mut(key) {
                        let sealed = cipher.seal(&value.to_string())?;
                        *value = json!({ SEALED_KEY: sealed });
                    }
                }
            }
        }

        encryption = Some(EncryptionHeader {
            salt: cipher.salt().to_string(),
            check: cipher.check_value()?,
        });
    }

    let document = StateDocument {
        version: DOCUMENT_VERSION,
        encryption,
        state: stored,
    };

    serde_json::to_vec_pretty(&document)
        .map_err(|e| StateError::serialization(format!("Failed to serialize state: {e}")).into())
}

/// Parses a document, opening sealed values.
///
/// # Errors
///
/// Returns `Corrupted` for unreadable bytes, `VersionMismatch` for newer
/// formats, and an encryption error for a missing or wrong passphrase.
pub fn decode(bytes: &[u8], passphrase: Option<&Passphrase>) -> Result<StackState> {
    let document: StateDocument = serde_json::from_slice(bytes).map_err(|e| StateError::Corrupted {
        message: format!("Failed to parse state document: {e}"),
    })?;
    check_version(document.version)?;

    let mut state = document.state;
    let Some(header) = document.encryption else {
        return Ok(state);
    };

    let passphrase = passphrase.ok_or_else(|| {
        StateError::encryption("State is encrypted but no passphrase is configured")
    })?;
    let cipher = passphrase.cipher(&header.salt)?;
    cipher.verify(&header.check)?;

    for resource in state.resources.values_mut() {
        let name = resource.name.as_str();
        for key in &resource.sensitive {
            for map in [&mut resource.properties, &mut resource.outputs] {
                let Some(value) = map.get_mut(key) else {
                    continue;
                };
                let Some(sealed) = value.get(SEALED_KEY) else {
                    continue;
                };
                let sealed: SealedValue =
                    serde_json::from_value(sealed.clone()).map_err(|e| StateError::Corrupted {
                        message: format!("Malformed sealed value for {name}.{key}: {e}"),
                    })?;
                let plaintext = cipher.open(&sealed)?;
                *value = serde_json::from_str::<Value>(&plaintext).map_err(|e| {
                    StateError::Corrupted {
                        message: format!("Sealed value for {name}.{key} is not JSON: {e}"),
                    }
                })?;
            }
        }
    }

    Ok(state)
}

/// Reads the stored sequence without needing the passphrase.
///
/// # Errors
///
/// Returns `Corrupted` or `VersionMismatch` like [`decode`].
pub fn stored_sequence(bytes: &[u8]) -> Result<u64> {
    let head: DocumentHead = serde_json::from_slice(bytes).map_err(|e| StateError::Corrupted {
        message: format!("Failed to parse state document: {e}"),
    })?;
    check_version(head.version)?;
    Ok(head.state.sequence)
}

fn check_version(found: u32) -> Result<()> {
    if found > DOCUMENT_VERSION {
        return Err(StateError::VersionMismatch {
            expected: DOCUMENT_VERSION.to_string(),
            found: found.to_string(),
        }
        .into());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{PropertyMap, ResourceSpec};
    use crate::error::WardenError;
    use crate::state::types::ResourceState;

    fn state_with_secret() -> StackState {
        let spec = ResourceSpec::new("db-a", "database")
            .with_property("password", "s3cr3t")
            .with_property("size", 20)
            .with_sensitive("password");
        let mut state = StackState::empty("dev-stack", "dev");
        state.record(ResourceState::from_spec(&spec, "db-1", PropertyMap::new(), "fp"));
        state
    }

    #[test]
    fn test_sensitive_roundtrip() {
        let pass = Passphrase::new("passphrase").unwrap();
        let state = state_with_secret();

        let bytes = encode(&state, Some(&pass)).unwrap();
        let raw = String::from_utf8(bytes.clone()).unwrap();
        assert!(!raw.contains("s3cr3t"));
        assert!(raw.contains(SEALED_KEY));
        assert!(raw.contains("\"size\": 20"));

        let loaded = decode(&bytes, Some(&pass)).unwrap();
        assert_eq!(loaded, state);
    }

    #[test]
    fn test_sensitive_outputs_sealed() {
        let pass = Passphrase::new("passphrase").unwrap();
        let spec = ResourceSpec::new("db-a", "database")
            .with_property("password", "s3cr3t")
            .with_sensitive("password");
        let mut state = StackState::empty("dev-stack", "dev");
        let outputs = spec.properties.clone();
        state.record(ResourceState::from_spec(&spec, "db-1", outputs, "fp"));

        let bytes = encode(&state, Some(&pass)).unwrap();
        assert!(!String::from_utf8_lossy(&bytes).contains("s3cr3t"));
        assert_eq!(decode(&bytes, Some(&pass)).unwrap(), state);
    }

    #[test]
    fn test_sensitive_requires_passphrase() {
        let err = encode(&state_with_secret(), None).unwrap_err();
        assert!(matches!(err, WardenError::State(StateError::Encryption { .. })));

        let pass = Passphrase::new("passphrase").unwrap();
        let bytes = encode(&state_with_secret(), Some(&pass)).unwrap();
        assert!(decode(&bytes, None).is_err());

        let wrong = Passphrase::new("other").unwrap();
        assert!(decode(&bytes, Some(&wrong)).is_err());
    }

    #[test]
    fn test_plain_state_needs_no_passphrase() {
        let mut state = StackState::empty("dev-stack", "dev");
        state.record(ResourceState::from_spec(
            &ResourceSpec::new("bucket-a", "bucket"),
            "b-1",
            PropertyMap::new(),
            "fp",
        ));
        let bytes = encode(&state, None).unwrap();
        assert_eq!(decode(&bytes, None).unwrap(), state);
        assert_eq!(stored_sequence(&bytes).unwrap(), 1);
    }

    #[test]
    fn test_newer_version_rejected() {
        let bytes = br#"{"version": 99, "state": {"sequence": 1}}"#;
        let err = stored_sequence(bytes).unwrap_err();
        assert!(matches!(
            err,
            WardenError::State(StateError::VersionMismatch { .. })
        ));
    }

    #[test]
    fn test_garbage_is_corrupted() {
        let err = decode(b"not json", None).unwrap_err();
        assert!(matches!(err, WardenError::State(StateError::Corrupted { .. })));
    }
}
