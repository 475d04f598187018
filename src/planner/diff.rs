//! Diff engine for comparing the desired graph with stored state.
//!
//! Comparison is by fingerprint only. Live provider values are brought in
//! beforehand by a refresh, never here.

use std::collections::BTreeSet;
use tracing::debug;

use crate::config::{Fingerprinter, ResourceSpec};
use crate::state::{ResourceState, StackState};

/// Shown instead of sensitive values.
const MASKED: &str = "(sensitive)";

/// Engine for computing diffs between desired and stored state.
#[derive(Debug, Default)]
pub struct DiffEngine {
    fingerprinter: Fingerprinter,
}

/// Difference for a single resource.
#[derive(Debug, Clone)]
pub struct ResourceDiff {
    /// Logical name.
    pub name: String,
    /// Type of difference.
    pub diff_type: DiffType,
    /// Field-level details, for display.
    pub details: Vec<DiffDetail>,
    /// Stored fingerprint, if the resource is recorded.
    pub old_hash: Option<String>,
    /// Desired fingerprint, if the resource is desired.
    pub new_hash: Option<String>,
}

/// Type of difference detected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiffType {
    /// Desired but not recorded.
    Create,
    /// Recorded with a different fingerprint.
    Update,
    /// Recorded under a different resource type.
    Replace,
    /// Recorded but no longer desired.
    Delete,
    /// Fingerprints match.
    NoChange,
}

/// Detail about a specific difference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiffDetail {
    /// Field that differs.
    pub field: String,
    /// Stored value.
    pub old_value: Option<String>,
    /// Desired value.
    pub new_value: Option<String>,
}

/// Complete diff result. Desired resources come first in declaration order,
/// then deletions by name.
#[derive(Debug, Default)]
pub struct DiffResult {
    /// All resource diffs.
    pub diffs: Vec<ResourceDiff>,
}

impl DiffEngine {
    /// Creates a new diff engine.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            fingerprinter: Fingerprinter::new(),
        }
    }

    /// Fingerprint of a desired spec, as stored on success.
    #[must_use]
    pub fn fingerprint(&self, spec: &ResourceSpec) -> String {
        self.fingerprinter.fingerprint(spec)
    }

    /// Computes the diff between the desired graph and stored state.
    #[must_use]
    pub fn compute_diff(&self, desired: &[ResourceSpec], state: &StackState) -> DiffResult {
        let mut diffs = Vec::with_capacity(desired.len() + state.resources.len());

        for spec in desired {
            let new_hash = self.fingerprint(spec);
            let diff = Self::compute_resource_diff(spec, state.get(&spec.name), new_hash);
            debug!("{}: {}", diff.name, diff.diff_type);
            diffs.push(diff);
        }

        let desired_names: BTreeSet<&str> = desired.iter().map(|s| s.name.as_str()).collect();
        for (name, recorded) in &state.resources {
            if !desired_names.contains(name.as_str()) {
                debug!("{name} is no longer desired");
                diffs.push(ResourceDiff {
                    name: name.clone(),
                    diff_type: DiffType::Delete,
                    details: vec![DiffDetail {
                        field: String::from("resource"),
                        old_value: Some(recorded.provider_id.clone()),
                        new_value: None,
                    }],
                    old_hash: Some(recorded.fingerprint.clone()),
                    new_hash: None,
                });
            }
        }

        DiffResult { diffs }
    }

    fn compute_resource_diff(
        spec: &ResourceSpec,
        recorded: Option<&ResourceState>,
        new_hash: String,
    ) -> ResourceDiff {
        let Some(recorded) = recorded else {
            return ResourceDiff {
                name: spec.name.clone(),
                diff_type: DiffType::Create,
                details: vec![],
                old_hash: None,
                new_hash: Some(new_hash),
            };
        };

        let diff_type = if recorded.type_name != spec.type_name {
            DiffType::Replace
        } else if Fingerprinter::hashes_match(&recorded.fingerprint, &new_hash) {
            DiffType::NoChange
        } else {
            DiffType::Update
        };

        let details = if diff_type == DiffType::NoChange {
            vec![]
        } else {
            Self::compute_detailed_diff(spec, recorded)
        };

        ResourceDiff {
            name: spec.name.clone(),
            diff_type,
            details,
            old_hash: Some(recorded.fingerprint.clone()),
            new_hash: Some(new_hash),
        }
    }

    /// Field-level differences, with sensitive values masked.
    fn compute_detailed_diff(spec: &ResourceSpec, recorded: &ResourceState) -> Vec<DiffDetail> {
        let mut details = Vec::new();

        if spec.type_name != recorded.type_name {
            details.push(DiffDetail {
                field: String::from("type"),
                old_value: Some(recorded.type_name.clone()),
                new_value: Some(spec.type_name.clone()),
            });
        }

        let keys: BTreeSet<&String> = spec
            .properties
            .keys()
            .chain(recorded.properties.keys())
            .collect();
        for key in keys {
            let old = recorded.properties.get(key);
            let new = spec.properties.get(key);
            if old == new {
                continue;
            }
            let masked = spec.is_sensitive(key) || recorded.is_sensitive(key);
            let render = |v: Option<&serde_json::Value>| {
                v.map(|v| if masked { MASKED.to_string() } else { v.to_string() })
            };
            details.push(DiffDetail {
                field: format!("properties.{key}"),
                old_value: render(old),
                new_value: render(new),
            });
        }

        let mut old_deps = recorded.dependencies.clone();
        let mut new_deps = spec.depends_on.clone();
        old_deps.sort();
        new_deps.sort();
        if old_deps != new_deps {
            details.push(DiffDetail {
                field: String::from("depends_on"),
                old_value: Some(old_deps.join(", ")),
                new_value: Some(new_deps.join(", ")),
            });
        }

        details
    }
}

impl DiffResult {
    /// Number of diffs of the given type.
    #[must_use]
    pub fn count(&self, diff_type: DiffType) -> usize {
        self.diffs.iter().filter(|d| d.diff_type == diff_type).count()
    }

    /// Returns true if there are any changes.
    #[must_use]
    pub fn has_changes(&self) -> bool {
        self.diffs.iter().any(|d| d.diff_type != DiffType::NoChange)
    }

    /// Filters to only diffs that require action.
    #[must_use]
    pub fn actionable_diffs(&self) -> Vec<&ResourceDiff> {
        self.diffs
            .iter()
            .filter(|d| d.diff_type != DiffType::NoChange)
            .collect()
    }

    /// Looks up the diff for a resource.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&ResourceDiff> {
        self.diffs.iter().find(|d| d.name == name)
    }
}

impl std::fmt::Display for DiffType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Create => "create",
            Self::Update => "update",
            Self::Replace => "replace",
            Self::Delete => "delete",
            Self::NoChange => "no change",
        };
        write!(f, "{s}")
    }
}

impl std::fmt::Display for ResourceDiff {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.name, self.diff_type)?;
        if !self.details.is_empty() {
            let fields: Vec<&str> = self.details.iter().map(|d| d.field.as_str()).collect();
            write!(f, " ({})", fields.join(", "))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PropertyMap;

    fn applied(state: &mut StackState, spec: &ResourceSpec) {
        let fp = DiffEngine::new().fingerprint(spec);
        state.record(ResourceState::from_spec(
            spec,
            format!("{}-1", spec.name),
            PropertyMap::new(),
            fp,
        ));
    }

    #[test]
    fn test_create_against_empty_state() {
        let state = StackState::empty("dev-stack", "dev");
        let desired = vec![ResourceSpec::new("bucket-a", "bucket")];
        let diff = DiffEngine::new().compute_diff(&desired, &state);

        assert_eq!(diff.count(DiffType::Create), 1);
        assert!(diff.has_changes());
        assert_eq!(diff.get("bucket-a").unwrap().diff_type, DiffType::Create);
    }

    #[test]
    fn test_unchanged_update_and_delete() {
        let bucket = ResourceSpec::new("bucket-a", "bucket").with_property("acl", "private");
        let role = ResourceSpec::new("role-a", "role");
        let queue = ResourceSpec::new("queue", "queue");

        let mut state = StackState::empty("dev-stack", "dev");
        applied(&mut state, &bucket);
        applied(&mut state, &role);
        applied(&mut state, &queue);

        let desired = vec![
            bucket.clone(),
            role.with_property("policy", "admin"),
        ];
        let diff = DiffEngine::new().compute_diff(&desired, &state);

        assert_eq!(diff.get("bucket-a").unwrap().diff_type, DiffType::NoChange);
        let update = diff.get("role-a").unwrap();
        assert_eq!(update.diff_type, DiffType::Update);
        assert_eq!(update.details[0].field, "properties.policy");
        assert_eq!(diff.get("queue").unwrap().diff_type, DiffType::Delete);
        assert_eq!(diff.actionable_diffs().len(), 2);
    }

    #[test]
    fn test_type_change_is_replace() {
        let mut state = StackState::empty("dev-stack", "dev");
        applied(&mut state, &ResourceSpec::new("store", "bucket"));

        let desired = vec![ResourceSpec::new("store", "table")];
        let diff = DiffEngine::new().compute_diff(&desired, &state);
        let replace = diff.get("store").unwrap();
        assert_eq!(replace.diff_type, DiffType::Replace);
        assert_eq!(replace.details[0].field, "type");
    }

    #[test]
    fn test_sensitive_values_are_masked() {
        let old = ResourceSpec::new("db", "database")
            .with_property("password", "old-secret")
            .with_sensitive("password");
        let mut state = StackState::empty("dev-stack", "dev");
        applied(&mut state, &old);

        let desired = vec![
            ResourceSpec::new("db", "database")
                .with_property("password", "new-secret")
                .with_sensitive("password"),
        ];
        let diff = DiffEngine::new().compute_diff(&desired, &state);
        let detail = &diff.get("db").unwrap().details[0];
        assert_eq!(detail.old_value.as_deref(), Some(MASKED));
        assert_eq!(detail.new_value.as_deref(), Some(MASKED));
        assert!(!diff.get("db").unwrap().to_string().contains("secret"));
    }

    #[test]
    fn test_dependency_change_is_update() {
        let mut state = StackState::empty("dev-stack", "dev");
        applied(&mut state, &ResourceSpec::new("bucket-a", "bucket"));
        applied(&mut state, &ResourceSpec::new("role-a", "role"));

        let desired = vec![
            ResourceSpec::new("bucket-a", "bucket").depends_on("role-a"),
            ResourceSpec::new("role-a", "role"),
        ];
        let diff = DiffEngine::new().compute_diff(&desired, &state);
        let update = diff.get("bucket-a").unwrap();
        assert_eq!(update.diff_type, DiffType::Update);
        assert_eq!(update.details[0].field, "depends_on");
    }
}
