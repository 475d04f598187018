//! State types for tracking what has been applied to a stack.
//!
//! These types represent the last-known state of every resource the engine
//! created and has not yet destroyed.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::config::{PropertyMap, ResourceSpec};

/// Maximum number of history entries kept per stack.
const MAX_HISTORY: usize = 100;

/// The persisted unit: everything known about one stack.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StackState {
    /// Stack identifier.
    pub stack: String,
    /// Backend project identifier.
    pub project: String,
    /// Resources keyed by logical name.
    pub resources: BTreeMap<String, ResourceState>,
    /// Incremented on every successful resource operation.
    pub sequence: u64,
    /// Lock id of the pass that last wrote this state.
    #[serde(default)]
    pub lock_token: Option<String>,
    /// When the state was last updated.
    pub last_updated: DateTime<Utc>,
    /// Recent pass summaries.
    #[serde(default)]
    pub history: Vec<HistoryEntry>,
}

/// Persisted record of one applied resource.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ResourceState {
    /// Logical name.
    pub name: String,
    /// Resource type name.
    #[serde(rename = "type")]
    pub type_name: String,
    /// Identifier assigned by the provider.
    pub provider_id: String,
    /// Last-applied property values.
    pub properties: PropertyMap,
    /// Live values reported by the provider.
    #[serde(default)]
    pub outputs: PropertyMap,
    /// Fingerprint of the spec that produced this state.
    pub fingerprint: String,
    /// Logical names this resource depends on.
    #[serde(default)]
    pub dependencies: Vec<String>,
    /// Property keys encrypted at rest.
    #[serde(default)]
    pub sensitive: Vec<String>,
    /// When the resource was created.
    pub created_at: DateTime<Utc>,
    /// When the resource was last changed.
    pub updated_at: DateTime<Utc>,
}

/// Summary of one pass over the stack.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HistoryEntry {
    /// When the pass finished.
    pub timestamp: DateTime<Utc>,
    /// Lifecycle verb that ran.
    pub operation: Operation,
    /// Resources that were touched.
    pub resources: Vec<String>,
    /// Whether every operation succeeded.
    pub success: bool,
    /// Optional error message.
    #[serde(default)]
    pub error: Option<String>,
}

/// Lifecycle verbs.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    /// Converge to the desired graph.
    Up,
    /// Read live state without changing anything.
    Refresh,
    /// Tear everything down.
    Destroy,
}

impl StackState {
    /// Creates an empty state with sequence 0.
    #[must_use]
    pub fn empty(stack: &str, project: &str) -> Self {
        Self {
            stack: stack.to_string(),
            project: project.to_string(),
            resources: BTreeMap::new(),
            sequence: 0,
            lock_token: None,
            last_updated: Utc::now(),
            history: Vec::new(),
        }
    }

    /// Returns true if no resources are recorded.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.resources.is_empty()
    }

    /// Gets a resource by logical name.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&ResourceState> {
        self.resources.get(name)
    }

    /// Records a resource and advances the sequence.
    pub fn record(&mut self, resource: ResourceState) {
        self.resources.insert(resource.name.clone(), resource);
        self.touch();
    }

    /// Forgets a resource and advances the sequence.
    pub fn forget(&mut self, name: &str) -> Option<ResourceState> {
        let removed = self.resources.remove(name);
        if removed.is_some() {
            self.touch();
        }
        removed
    }

    /// Forgets a resource that vanished at the provider and drops every
    /// reference to it, so recorded dependencies stay resolvable.
    pub fn detach(&mut self, name: &str) -> Option<ResourceState> {
        let removed = self.forget(name)?;
        for resource in self.resources.values_mut() {
            resource.dependencies.retain(|d| d != name);
        }
        Some(removed)
    }

    fn touch(&mut self) {
        self.sequence += 1;
        self.last_updated = Utc::now();
    }

    /// Returns `(resource, dependency)` pairs whose dependency is not recorded.
    #[must_use]
    pub fn dangling_dependencies(&self) -> Vec<(String, String)> {
        self.resources
            .values()
            .flat_map(|r| {
                r.dependencies
                    .iter()
                    .filter(|d| !self.resources.contains_key(d.as_str()))
                    .map(|d| (r.name.clone(), d.clone()))
            })
            .collect()
    }

    /// Returns true if any recorded resource holds a sensitive property or output.
    #[must_use]
    pub fn has_sensitive_values(&self) -> bool {
        self.resources.values().any(|r| {
            r.sensitive
                .iter()
                .any(|key| r.properties.contains_key(key) || r.outputs.contains_key(key))
        })
    }

    /// Adds a history entry, dropping the oldest beyond the cap.
    pub fn add_history(&mut self, entry: HistoryEntry) {
        if self.history.len() >= MAX_HISTORY {
            self.history.remove(0);
        }
        self.history.push(entry);
    }
}

impl ResourceState {
    /// Builds the record for a freshly applied spec.
    #[must_use]
    pub fn from_spec(
        spec: &ResourceSpec,
        provider_id: impl Into<String>,
        outputs: PropertyMap,
        fingerprint: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            name: spec.name.clone(),
            type_name: spec.type_name.clone(),
            provider_id: provider_id.into(),
            properties: spec.properties.clone(),
            outputs,
            fingerprint: fingerprint.into(),
            dependencies: spec.depends_on.clone(),
            sensitive: spec.sensitive.clone(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Rebuilds the desired spec this record was applied from.
    #[must_use]
    pub fn to_spec(&self) -> ResourceSpec {
        ResourceSpec {
            name: self.name.clone(),
            type_name: self.type_name.clone(),
            properties: self.properties.clone(),
            depends_on: self.dependencies.clone(),
            sensitive: self.sensitive.clone(),
        }
    }

    /// Returns true if the property key is sensitive.
    #[must_use]
    pub fn is_sensitive(&self, key: &str) -> bool {
        self.sensitive.iter().any(|k| k == key)
    }
}

impl HistoryEntry {
    /// Creates a successful history entry.
    #[must_use]
    pub fn new(operation: Operation, resources: Vec<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            operation,
            resources,
            success: true,
            error: None,
        }
    }

    /// Creates a failed history entry.
    #[must_use]
    pub fn failed(operation: Operation, resources: Vec<String>, error: &str) -> Self {
        Self {
            timestamp: Utc::now(),
            operation,
            resources,
            success: false,
            error: Some(error.to_string()),
        }
    }
}

impl std::fmt::Display for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let op = match self {
            Self::Up => "up",
            Self::Refresh => "refresh",
            Self::Destroy => "destroy",
        };
        write!(f, "{op}")
    }
}
