//! Configuration specification types for stackwarden.
//!
//! This module defines the structs that map to the `stackwarden.yaml` file.
//! A stack file fully describes the desired resource graph plus everything
//! needed to reach the target account and persist state.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::PathBuf;

/// Property map of a resource. Ordered so that fingerprints are stable.
pub type PropertyMap = BTreeMap<String, Value>;

/// The root configuration structure for a stack.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StackConfig {
    /// Project-level configuration.
    pub project: ProjectConfig,
    /// State backend configuration.
    #[serde(default)]
    pub state: StateConfig,
    /// Trust parameters for federated credentials.
    #[serde(default)]
    pub credentials: CredentialsConfig,
    /// Engine tuning.
    #[serde(default)]
    pub engine: EngineConfig,
    /// Desired resource graph.
    #[serde(default)]
    pub resources: Vec<ResourceSpec>,
}

/// Project-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProjectConfig {
    /// Backend project identifier.
    pub name: String,
    /// Stack name within the project.
    #[serde(default = "default_stack")]
    pub stack: String,
}

/// State backend configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct StateConfig {
    /// Backend type (local or s3).
    #[serde(default)]
    pub backend: StateBackend,
    /// S3 bucket name (required for s3 backend).
    #[serde(default)]
    pub bucket: Option<String>,
    /// S3 key prefix (optional).
    #[serde(default)]
    pub prefix: Option<String>,
    /// S3 region (optional, uses AWS default if not specified).
    #[serde(default)]
    pub region: Option<String>,
    /// Local state directory (for local backend).
    #[serde(default)]
    pub path: Option<String>,
}

/// State backend types.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum StateBackend {
    /// Local file-based state storage.
    #[default]
    Local,
    /// AWS S3-based state storage.
    S3,
}

/// Trust parameters and token source for the credential exchange.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CredentialsConfig {
    /// Role to assume.
    #[serde(default)]
    pub role_arn: String,
    /// Session name recorded by the exchange.
    #[serde(default = "default_session_name")]
    pub session_name: String,
    /// Target region of the credential scope.
    #[serde(default = "default_region")]
    pub region: String,
    /// Requested credential lifetime.
    #[serde(default = "default_duration_secs")]
    pub duration_secs: u32,
    /// Credentials are treated as expired this many seconds early.
    #[serde(default = "default_refresh_margin_secs")]
    pub refresh_margin_secs: u64,
    /// Where the identity token comes from.
    #[serde(default)]
    pub token: TokenSourceConfig,
    /// Override for the exchange endpoint.
    #[serde(default)]
    pub endpoint: Option<String>,
}

/// Identity token source.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "source", rename_all = "lowercase")]
pub enum TokenSourceConfig {
    /// Read the token from an environment variable.
    Env {
        /// Variable name.
        #[serde(default = "default_token_env")]
        env: String,
    },
    /// Read the token from a file, re-read on every refresh.
    File {
        /// Path to the token file.
        path: PathBuf,
    },
}

/// Engine tuning.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct EngineConfig {
    /// Maximum number of concurrent provider operations.
    #[serde(default = "default_parallelism")]
    pub parallelism: usize,
    /// How long to wait for the stack lock.
    #[serde(default = "default_lock_timeout_secs")]
    pub lock_timeout_secs: u64,
    /// Run a read-only refresh before `up` and `destroy`.
    #[serde(default = "default_true")]
    pub refresh_before_up: bool,
    /// Confirm unchanged resources with a provider read during planning.
    #[serde(default)]
    pub confirm_unchanged: bool,
}

/// A node of the desired resource graph.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ResourceSpec {
    /// Logical name, unique within the stack.
    pub name: String,
    /// Resource type name resolved through the provider registry.
    #[serde(rename = "type")]
    pub type_name: String,
    /// Desired properties.
    #[serde(default)]
    pub properties: PropertyMap,
    /// Logical names this resource depends on.
    #[serde(default)]
    pub depends_on: Vec<String>,
    /// Property keys whose values are encrypted at rest.
    #[serde(default)]
    pub sensitive: Vec<String>,
}

// Default value functions

fn default_stack() -> String {
    String::from("dev")
}

fn default_session_name() -> String {
    String::from("StackwardenLocalDev")
}

fn default_region() -> String {
    String::from("ap-south-1")
}

fn default_token_env() -> String {
    String::from("OIDC_TOKEN")
}

const fn default_duration_secs() -> u32 {
    3600
}

const fn default_refresh_margin_secs() -> u64 {
    60
}

const fn default_parallelism() -> usize {
    4
}

const fn default_lock_timeout_secs() -> u64 {
    30
}

const fn default_true() -> bool {
    true
}

impl Default for CredentialsConfig {
    fn default() -> Self {
        Self {
            role_arn: String::new(),
            session_name: default_session_name(),
            region: default_region(),
            duration_secs: default_duration_secs(),
            refresh_margin_secs: default_refresh_margin_secs(),
            token: TokenSourceConfig::default(),
            endpoint: None,
        }
    }
}

impl Default for TokenSourceConfig {
    fn default() -> Self {
        Self::Env {
            env: default_token_env(),
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            parallelism: default_parallelism(),
            lock_timeout_secs: default_lock_timeout_secs(),
            refresh_before_up: true,
            confirm_unchanged: false,
        }
    }
}

impl StackConfig {
    /// Returns the stack identifier used as the state key.
    #[must_use]
    pub fn stack_id(&self) -> String {
        format!("{}-{}", self.project.name, self.project.stack)
    }

    /// Returns resource names in declaration order.
    #[must_use]
    pub fn resource_names(&self) -> Vec<&str> {
        self.resources.iter().map(|r| r.name.as_str()).collect()
    }

    /// Looks up a resource by logical name.
    #[must_use]
    pub fn resource(&self, name: &str) -> Option<&ResourceSpec> {
        self.resources.iter().find(|r| r.name == name)
    }
}

impl ResourceSpec {
    /// Creates a resource spec with no properties or dependencies.
    #[must_use]
    pub fn new(name: impl Into<String>, type_name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            type_name: type_name.into(),
            properties: PropertyMap::new(),
            depends_on: Vec::new(),
            sensitive: Vec::new(),
        }
    }

    /// Adds a property.
    #[must_use]
    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }

    /// Adds a dependency on another logical name.
    #[must_use]
    pub fn depends_on(mut self, name: impl Into<String>) -> Self {
        self.depends_on.push(name.into());
        self
    }

    /// Marks a property key as sensitive.
    #[must_use]
    pub fn with_sensitive(mut self, key: impl Into<String>) -> Self {
        self.sensitive.push(key.into());
        self
    }

    /// Returns true if the given property key is sensitive.
    #[must_use]
    pub fn is_sensitive(&self, key: &str) -> bool {
        self.sensitive.iter().any(|k| k == key)
    }
}
