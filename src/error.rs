//! Error types for the stackwarden reconciliation engine.
//!
//! Every concern owns its own error enum (configuration, credentials, state,
//! providers, planning, reconciliation). [`WardenError`] wraps them all and
//! [`ErrorKind`] flattens the hierarchy into the small taxonomy the command
//! surface reports to users.

use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

/// The main error type for stackwarden.
#[derive(Debug, Error)]
pub enum WardenError {
    /// Configuration-related errors.
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Credential acquisition errors.
    #[error("Authentication error: {0}")]
    Auth(#[from] AuthError),

    /// State management errors.
    #[error("State error: {0}")]
    State(#[from] StateError),

    /// Provider adapter errors.
    #[error("Provider error: {0}")]
    Provider(#[from] ProviderError),

    /// Planning errors.
    #[error("Planning error: {0}")]
    Plan(#[from] PlanError),

    /// Reconciliation errors.
    #[error("Reconciliation error: {0}")]
    Reconcile(#[from] ReconcileError),

    /// IO errors.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Configuration-related errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The configuration file was not found.
    #[error("Configuration file not found: {path}")]
    FileNotFound {
        /// Path to the missing file.
        path: PathBuf,
    },

    /// The configuration file could not be parsed.
    #[error("Failed to parse configuration: {message}")]
    ParseError {
        /// Description of the parse error.
        message: String,
        /// Optional source location.
        location: Option<String>,
    },

    /// Validation failed.
    #[error("Configuration validation failed: {message}")]
    ValidationError {
        /// Description of the validation error.
        message: String,
        /// Field that failed validation.
        field: Option<String>,
    },

    /// Environment variable is missing.
    #[error("Missing environment variable: {name}")]
    MissingEnvVar {
        /// Name of the missing variable.
        name: String,
    },

    /// Duplicate resource definition.
    #[error("Duplicate resource name: {name}")]
    DuplicateName {
        /// The duplicated name.
        name: String,
    },

    /// A trust parameter needed for the credential exchange is empty.
    #[error("Missing trust parameter: {field}")]
    MissingTrustParameter {
        /// Name of the missing parameter.
        field: String,
    },

    /// A resource references a dependency that is not declared.
    #[error("Resource '{resource}' depends on undeclared resource '{dependency}'")]
    UnknownDependency {
        /// The referencing resource.
        resource: String,
        /// The missing dependency.
        dependency: String,
    },
}

/// Credential acquisition errors.
#[derive(Debug, Error)]
pub enum AuthError {
    /// The trust exchange was rejected (invalid role, untrusted issuer,
    /// expired token). Never retried.
    #[error("Trust exchange rejected: {reason}")]
    Rejected {
        /// Reason reported by the exchange endpoint.
        reason: String,
    },

    /// The identity token could not be obtained from its source.
    #[error("Identity token unavailable from {source_name}: {message}")]
    TokenUnavailable {
        /// Description of the token source.
        source_name: String,
        /// What went wrong.
        message: String,
    },

    /// The exchange kept failing transiently until the retry budget ran out.
    #[error("Trust exchange failed after {attempts} attempts: {message}")]
    Transient {
        /// Number of attempts made.
        attempts: u32,
        /// Last failure message.
        message: String,
    },

    /// A single transient failure, before retry accounting.
    #[error("Trust exchange unavailable: {message}")]
    Unavailable {
        /// Description of the failure.
        message: String,
    },

    /// The exchange endpoint answered with something unreadable.
    #[error("Invalid trust exchange response: {message}")]
    InvalidResponse {
        /// Description of the response issue.
        message: String,
    },
}

/// State management errors.
#[derive(Debug, Error)]
pub enum StateError {
    /// No state exists for the stack.
    #[error("No state found for stack '{stack}'")]
    NotFound {
        /// Stack identifier.
        stack: String,
    },

    /// State is corrupted.
    #[error("State is corrupted: {message}")]
    Corrupted {
        /// Description of the corruption.
        message: String,
    },

    /// The lock could not be acquired within the timeout.
    #[error("Timed out after {waited_secs}s waiting for lock on '{stack}' (holder: {holder})")]
    LockTimeout {
        /// Stack identifier.
        stack: String,
        /// Identifier of the current lock holder.
        holder: String,
        /// Seconds spent waiting.
        waited_secs: u64,
    },

    /// The lock handle no longer matches the stored lock.
    #[error("Lock on '{stack}' is not held by this handle")]
    LockLost {
        /// Stack identifier.
        stack: String,
    },

    /// The stored sequence moved since the caller loaded the state.
    #[error("State conflict on '{stack}': expected sequence {expected}, found {found}")]
    Conflict {
        /// Stack identifier.
        stack: String,
        /// Sequence the caller expected.
        expected: u64,
        /// Sequence actually stored.
        found: u64,
    },

    /// Storage backend error.
    #[error("State backend error: {message}")]
    Backend {
        /// Description of the backend error.
        message: String,
    },

    /// Serialization error.
    #[error("State serialization error: {message}")]
    SerializationError {
        /// Description of the serialization error.
        message: String,
    },

    /// State version mismatch.
    #[error("State version mismatch: expected {expected}, found {found}")]
    VersionMismatch {
        /// Expected state version.
        expected: String,
        /// Found state version.
        found: String,
    },

    /// Sealing or opening a sensitive value failed.
    #[error("State encryption error: {message}")]
    Encryption {
        /// Description of the failure.
        message: String,
    },
}

/// Provider adapter errors.
#[derive(Debug, Error)]
pub enum ProviderError {
    /// No adapter is registered for the resource type.
    #[error("Unknown resource type: {type_name}")]
    UnknownType {
        /// The unregistered type name.
        type_name: String,
    },

    /// The resource no longer exists at the provider.
    #[error("{type_name} '{provider_id}' not found")]
    NotFound {
        /// Resource type.
        type_name: String,
        /// Provider-assigned identifier.
        provider_id: String,
    },

    /// A CRUD operation failed.
    #[error("{operation} {type_name} failed: {message}")]
    OperationFailed {
        /// Resource type.
        type_name: String,
        /// Operation name (create, read, update, delete).
        operation: String,
        /// Failure description.
        message: String,
    },

    /// The resource properties cannot be used by the adapter.
    #[error("Invalid properties for {type_name}: {message}")]
    InvalidProperties {
        /// Resource type.
        type_name: String,
        /// What is wrong.
        message: String,
    },
}

/// Planning errors.
#[derive(Debug, Error)]
pub enum PlanError {
    /// The dependency graph contains a cycle.
    #[error("Dependency cycle detected: {}", cycle.join(" -> "))]
    CyclicGraph {
        /// Resources participating in the cycle.
        cycle: Vec<String>,
    },

    /// A node references a dependency absent from the graph.
    #[error("Resource '{resource}' depends on unknown resource '{dependency}'")]
    DanglingDependency {
        /// The referencing resource.
        resource: String,
        /// The missing dependency.
        dependency: String,
    },
}

/// Reconciliation errors.
#[derive(Debug, Error)]
pub enum ReconcileError {
    /// Reconciliation was aborted.
    #[error("Reconciliation aborted: {reason}")]
    Aborted {
        /// Reason for abort.
        reason: String,
    },

    /// The pass was cancelled from outside.
    #[error("Reconciliation cancelled")]
    Cancelled,
}

/// Result type alias for stackwarden operations.
pub type Result<T> = std::result::Result<T, WardenError>;

/// Flat error taxonomy reported by the command surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Invalid or incomplete configuration.
    Config,
    /// Credential exchange rejected.
    Auth,
    /// Credential exchange failed transiently past its retry budget.
    TransientAuth,
    /// State lock not acquired in time.
    LockTimeout,
    /// Optimistic sequence check failed.
    Conflict,
    /// A provider operation failed.
    Provider,
    /// A resource or stack was not found.
    NotFound,
    /// The dependency graph has a cycle.
    CyclicGraph,
    /// Other state storage failures.
    State,
    /// The pass was cancelled.
    Cancelled,
    /// Anything else.
    Internal,
}

impl ErrorKind {
    /// Returns the user-facing name of this kind.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Config => "ConfigError",
            Self::Auth => "AuthError",
            Self::TransientAuth => "TransientAuthError",
            Self::LockTimeout => "LockTimeout",
            Self::Conflict => "ConflictError",
            Self::Provider => "ProviderError",
            Self::NotFound => "NotFoundError",
            Self::CyclicGraph => "CyclicGraphError",
            Self::State => "StateError",
            Self::Cancelled => "Cancelled",
            Self::Internal => "InternalError",
        }
    }

    /// Returns true if an error of this kind aborts a whole pass instead of
    /// being contained to one resource.
    #[must_use]
    pub const fn aborts_pass(self) -> bool {
        !matches!(self, Self::Provider | Self::NotFound)
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl serde::Serialize for ErrorKind {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl WardenError {
    /// Creates a new internal error with the given message.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }

    /// Classifies this error into the user-facing taxonomy.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::Config(_) => ErrorKind::Config,
            Self::Auth(AuthError::Transient { .. } | AuthError::Unavailable { .. }) => {
                ErrorKind::TransientAuth
            }
            Self::Auth(_) => ErrorKind::Auth,
            Self::State(e) => e.kind(),
            Self::Provider(e) => e.kind(),
            Self::Plan(PlanError::CyclicGraph { .. }) => ErrorKind::CyclicGraph,
            Self::Plan(PlanError::DanglingDependency { .. }) => ErrorKind::Config,
            Self::Reconcile(ReconcileError::Cancelled) => ErrorKind::Cancelled,
            Self::Reconcile(_) | Self::Io(_) | Self::Internal(_) => ErrorKind::Internal,
        }
    }

    /// Returns true if this error is retryable.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Auth(AuthError::Unavailable { .. } | AuthError::Transient { .. })
                | Self::State(StateError::LockTimeout { .. })
        )
    }
}

impl ConfigError {
    /// Creates a validation error for a specific field.
    #[must_use]
    pub fn validation(message: impl Into<String>, field: impl Into<String>) -> Self {
        Self::ValidationError {
            message: message.into(),
            field: Some(field.into()),
        }
    }

    /// Creates a validation error without a specific field.
    #[must_use]
    pub fn validation_general(message: impl Into<String>) -> Self {
        Self::ValidationError {
            message: message.into(),
            field: None,
        }
    }
}

impl AuthError {
    /// Returns true if the failure may go away on retry.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Unavailable { .. })
    }

    /// Creates a transient exchange failure.
    #[must_use]
    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::Unavailable {
            message: message.into(),
        }
    }
}

impl StateError {
    /// Creates a backend error with the given message.
    #[must_use]
    pub fn backend(message: impl Into<String>) -> Self {
        Self::Backend {
            message: message.into(),
        }
    }

    /// Creates a serialization error with the given message.
    #[must_use]
    pub fn serialization(message: impl Into<String>) -> Self {
        Self::SerializationError {
            message: message.into(),
        }
    }

    /// Creates an encryption error with the given message.
    #[must_use]
    pub fn encryption(message: impl Into<String>) -> Self {
        Self::Encryption {
            message: message.into(),
        }
    }

    /// Classifies this error into the user-facing taxonomy.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::NotFound { .. } => ErrorKind::NotFound,
            Self::LockTimeout { .. } => ErrorKind::LockTimeout,
            Self::Conflict { .. } => ErrorKind::Conflict,
            _ => ErrorKind::State,
        }
    }
}

impl ProviderError {
    /// Creates an operation failure.
    #[must_use]
    pub fn failed(
        type_name: impl Into<String>,
        operation: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self::OperationFailed {
            type_name: type_name.into(),
            operation: operation.into(),
            message: message.into(),
        }
    }

    /// Returns true if this is a "resource no longer exists" signal.
    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    /// Classifies this error into the user-facing taxonomy.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::NotFound { .. } => ErrorKind::NotFound,
            _ => ErrorKind::Provider,
        }
    }
}
