//! Resource fingerprinting for change detection.
//!
//! A fingerprint is a SHA-256 digest over a canonical encoding of a
//! resource's type, properties, dependency references and sensitive keys.
//! Two specs that describe the same desired resource always produce the
//! same fingerprint, independent of map ordering in the source file.

use serde_json::Value;
use sha2::{Digest, Sha256};

use super::spec::{PropertyMap, ResourceSpec};

/// Computes resource fingerprints.
#[derive(Debug, Default)]
pub struct Fingerprinter;

impl Fingerprinter {
    /// Creates a new fingerprinter.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Computes the fingerprint of a desired resource.
    ///
    /// Fingerprints cover plaintext property values, so changing a
    /// sensitive value is detected as an update.
    #[must_use]
    pub fn fingerprint(&self, spec: &ResourceSpec) -> String {
        let mut hasher = Sha256::new();

        hasher.update(b"type\0");
        hasher.update(spec.type_name.as_bytes());

        hasher.update(b"\0props\0");
        let mut canonical = String::new();
        write_properties(&spec.properties, &mut canonical);
        hasher.update(canonical.as_bytes());

        // Dependency order in the file is irrelevant
        let mut deps: Vec<&str> = spec.depends_on.iter().map(String::as_str).collect();
        deps.sort_unstable();
        deps.dedup();
        hasher.update(b"\0deps\0");
        for dep in deps {
            hasher.update(dep.as_bytes());
            hasher.update(b"\0");
        }

        // Marking a key sensitive changes how it is stored
        let mut sensitive: Vec<&str> = spec.sensitive.iter().map(String::as_str).collect();
        sensitive.sort_unstable();
        sensitive.dedup();
        hasher.update(b"\0sensitive\0");
        for key in sensitive {
            hasher.update(key.as_bytes());
            hasher.update(b"\0");
        }

        hex::encode(hasher.finalize())
    }

    /// Computes a short hash (first 8 characters) for display purposes.
    #[must_use]
    pub fn short_hash(hash: &str) -> String {
        hash.chars().take(8).collect()
    }

    /// Compares two fingerprints in constant time.
    #[must_use]
    pub fn hashes_match(hash1: &str, hash2: &str) -> bool {
        if hash1.len() != hash2.len() {
            return false;
        }

        hash1
            .bytes()
            .zip(hash2.bytes())
            .fold(0u8, |acc, (a, b)| acc | (a ^ b))
            == 0
    }
}

fn write_properties(properties: &PropertyMap, out: &mut String) {
    out.push('{');
    for (key, value) in properties {
        write_string(key, out);
        out.push(':');
        write_value(value, out);
        out.push(',');
    }
    out.push('}');
}

/// Writes a JSON value with object keys sorted, whatever map type backs it.
fn write_value(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<(&String, &Value)> = map.iter().collect();
            entries.sort_by(|a, b| a.0.cmp(b.0));
            out.push('{');
            for (key, inner) in entries {
                write_string(key, out);
                out.push(':');
                write_value(inner, out);
                out.push(',');
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for item in items {
                write_value(item, out);
                out.push(',');
            }
            out.push(']');
        }
        Value::String(s) => write_string(s, out),
        other => out.push_str(&other.to_string()),
    }
}

fn write_string(s: &str, out: &mut String) {
    out.push_str(&Value::String(s.to_string()).to_string());
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_fingerprint_deterministic() {
        let fp = Fingerprinter::new();
        let spec = ResourceSpec::new("bucket-a", "bucket").with_property("acl", "private");
        assert_eq!(fp.fingerprint(&spec), fp.fingerprint(&spec));
    }

    #[test]
    fn test_fingerprint_ignores_ordering() {
        let fp = Fingerprinter::new();
        let a = ResourceSpec::new("bucket-a", "bucket")
            .with_property("tags", json!({"team": "infra", "env": "dev"}))
            .depends_on("role-a")
            .depends_on("role-b");
        let b = ResourceSpec::new("bucket-a", "bucket")
            .with_property("tags", json!({"env": "dev", "team": "infra"}))
            .depends_on("role-b")
            .depends_on("role-a");
        assert_eq!(fp.fingerprint(&a), fp.fingerprint(&b));
    }

    #[test]
    fn test_fingerprint_detects_changes() {
        let fp = Fingerprinter::new();
        let base = ResourceSpec::new("bucket-a", "bucket").with_property("acl", "private");
        let changed = ResourceSpec::new("bucket-a", "bucket").with_property("acl", "public-read");
        let retyped = ResourceSpec::new("bucket-a", "queue").with_property("acl", "private");

        assert_ne!(fp.fingerprint(&base), fp.fingerprint(&changed));
        assert_ne!(fp.fingerprint(&base), fp.fingerprint(&retyped));
    }

    #[test]
    fn test_fingerprint_covers_sensitive_keys() {
        let fp = Fingerprinter::new();
        let plain = ResourceSpec::new("bucket-a", "bucket").with_property("kms_key", "k-1");
        let marked = plain.clone().with_sensitive("kms_key");
        let marked_twice = marked.clone().with_sensitive("kms_key");

        assert_ne!(fp.fingerprint(&plain), fp.fingerprint(&marked));
        assert_eq!(fp.fingerprint(&marked), fp.fingerprint(&marked_twice));
    }

    #[test]
    fn test_short_hash() {
        let short = Fingerprinter::short_hash("abcdef1234567890abcdef1234567890");
        assert_eq!(short, "abcdef12");
    }

    #[test]
    fn test_hashes_match() {
        assert!(Fingerprinter::hashes_match("abc123", "abc123"));
        assert!(!Fingerprinter::hashes_match("abc123", "abc124"));
        assert!(!Fingerprinter::hashes_match("abc123", "abc12"));
    }
}
