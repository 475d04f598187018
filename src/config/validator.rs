//! Configuration validation for stack files.
//!
//! The validator collects every problem it finds, then fails on the first
//! error. Structural graph problems (duplicates, undeclared dependencies,
//! cycles) are reported with their dedicated error variants so callers can
//! tell them apart.

use crate::error::{ConfigError, PlanError, Result, WardenError};
use crate::planner::DependencyGraph;
use std::collections::HashSet;
use tracing::{debug, warn};

use super::spec::{EngineConfig, ProjectConfig, ResourceSpec, StackConfig, StateBackend, StateConfig};

/// Validator for stack configurations.
#[derive(Debug, Default)]
pub struct ConfigValidator;

/// Validation result containing all errors found.
#[derive(Debug, Default)]
pub struct ValidationResult {
    /// List of validation errors.
    pub errors: Vec<ValidationError>,
    /// List of warnings (non-fatal issues).
    pub warnings: Vec<String>,
}

/// A single validation error.
#[derive(Debug)]
pub struct ValidationError {
    /// The field path that failed validation.
    pub field: String,
    /// The error message.
    pub message: String,
    /// Classification used when the error is surfaced.
    pub issue: Issue,
}

/// What kind of problem a validation error describes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Issue {
    /// A value is malformed or out of range.
    Invalid,
    /// Two resources share a logical name.
    Duplicate(String),
    /// A dependency reference points at nothing.
    UnknownDependency {
        /// The referencing resource.
        resource: String,
        /// The missing dependency.
        dependency: String,
    },
    /// The dependency graph has a cycle.
    Cycle(Vec<String>),
}

impl ConfigValidator {
    /// Creates a new validator.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Validates a stack configuration.
    ///
    /// # Errors
    ///
    /// Returns the first error found.
    pub fn validate(&self, config: &StackConfig) -> Result<ValidationResult> {
        let mut result = ValidationResult::default();

        Self::validate_project(&config.project, &mut result);
        Self::validate_state(&config.state, &mut result);
        Self::validate_engine(&config.engine, &mut result);
        Self::validate_resources(&config.resources, &mut result);

        if config.credentials.role_arn.trim().is_empty() {
            result.warnings.push(String::from(
                "credentials.role_arn is empty: only preview will work",
            ));
        }

        for warning in &result.warnings {
            warn!("{warning}");
        }

        if result.errors.is_empty() {
            debug!("Configuration validation passed");
            Ok(result)
        } else {
            Err(result.errors.swap_remove(0).into_error())
        }
    }

    /// Validates project configuration.
    fn validate_project(project: &ProjectConfig, result: &mut ValidationResult) {
        for (field, value) in [("project.name", &project.name), ("project.stack", &project.stack)] {
            if value.is_empty() {
                result.push(field, format!("{field} cannot be empty"));
            } else if !is_valid_name(value) {
                result.push(
                    field,
                    format!(
                        "'{value}' is invalid. Must start with a letter and contain only \
                         letters, digits, '-' or '_'."
                    ),
                );
            }
        }
    }

    /// Validates state configuration.
    fn validate_state(state: &StateConfig, result: &mut ValidationResult) {
        match state.backend {
            StateBackend::S3 => {
                if state.bucket.as_ref().is_none_or(String::is_empty) {
                    result.push(
                        "state.bucket",
                        "S3 bucket name is required when using S3 backend",
                    );
                }
            }
            StateBackend::Local => {
                if state.bucket.is_some() {
                    result
                        .warnings
                        .push(String::from("state.bucket is ignored by the local backend"));
                }
            }
        }
    }

    /// Validates engine tuning.
    fn validate_engine(engine: &EngineConfig, result: &mut ValidationResult) {
        if engine.parallelism == 0 {
            result.push("engine.parallelism", "Parallelism must be at least 1");
        }
        if engine.lock_timeout_secs == 0 {
            result.warnings.push(String::from(
                "engine.lock_timeout_secs is 0: a held lock fails immediately",
            ));
        }
    }

    /// Validates the resource graph.
    fn validate_resources(resources: &[ResourceSpec], result: &mut ValidationResult) {
        if resources.is_empty() {
            result
                .warnings
                .push(String::from("No resources defined in configuration"));
            return;
        }

        let declared: HashSet<&str> = resources.iter().map(|r| r.name.as_str()).collect();
        let mut seen_names = HashSet::new();

        for (i, resource) in resources.iter().enumerate() {
            let prefix = format!("resources[{i}]");

            if !seen_names.insert(resource.name.as_str()) {
                result.errors.push(ValidationError {
                    field: format!("{prefix}.name"),
                    message: format!("Duplicate resource name: {}", resource.name),
                    issue: Issue::Duplicate(resource.name.clone()),
                });
            }

            if !is_valid_name(&resource.name) {
                result.push(
                    format!("{prefix}.name"),
                    format!("Resource name '{}' is invalid", resource.name),
                );
            }

            if resource.type_name.trim().is_empty() {
                result.push(format!("{prefix}.type"), "Resource type cannot be empty");
            }

            for dependency in &resource.depends_on {
                if dependency == &resource.name {
                    result.push(
                        format!("{prefix}.depends_on"),
                        format!("Resource '{}' depends on itself", resource.name),
                    );
                } else if !declared.contains(dependency.as_str()) {
                    result.errors.push(ValidationError {
                        field: format!("{prefix}.depends_on"),
                        message: format!(
                            "Resource '{}' depends on undeclared resource '{dependency}'",
                            resource.name
                        ),
                        issue: Issue::UnknownDependency {
                            resource: resource.name.clone(),
                            dependency: dependency.clone(),
                        },
                    });
                }
            }

            for key in &resource.sensitive {
                if !resource.properties.contains_key(key) {
                    result.warnings.push(format!(
                        "{prefix}.sensitive: '{key}' is not a property of '{}'",
                        resource.name
                    ));
                }
            }
        }

        // Cycles are only meaningful once every reference resolves.
        if result.errors.is_empty()
            && let Some(cycle) = DependencyGraph::from_specs(resources).find_cycle()
        {
            result.errors.push(ValidationError {
                field: String::from("resources"),
                message: format!("Dependency cycle: {}", cycle.join(" -> ")),
                issue: Issue::Cycle(cycle),
            });
        }
    }
}

/// Validates that a name follows the naming convention.
/// Names start with an ASCII letter and contain letters, digits, '-' or '_'.
fn is_valid_name(name: &str) -> bool {
    let mut chars = name.chars();

    match chars.next() {
        Some(first) if first.is_ascii_alphabetic() => {}
        _ => return false,
    }

    chars.all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

impl ValidationResult {
    /// Records a plain validation error.
    fn push(&mut self, field: impl Into<String>, message: impl Into<String>) {
        self.errors.push(ValidationError {
            field: field.into(),
            message: message.into(),
            issue: Issue::Invalid,
        });
    }

    /// Returns true if validation passed (no errors).
    #[must_use]
    pub const fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }

    /// Returns the number of errors.
    #[must_use]
    pub const fn error_count(&self) -> usize {
        self.errors.len()
    }

    /// Returns the number of warnings.
    #[must_use]
    pub const fn warning_count(&self) -> usize {
        self.warnings.len()
    }
}

impl ValidationError {
    /// Converts into the crate error matching its issue.
    #[must_use]
    pub fn into_error(self) -> WardenError {
        match self.issue {
            Issue::Invalid => WardenError::Config(ConfigError::ValidationError {
                message: self.message,
                field: Some(self.field),
            }),
            Issue::Duplicate(name) => WardenError::Config(ConfigError::DuplicateName { name }),
            Issue::UnknownDependency {
                resource,
                dependency,
            } => WardenError::Config(ConfigError::UnknownDependency {
                resource,
                dependency,
            }),
            Issue::Cycle(cycle) => WardenError::Plan(PlanError::CyclicGraph { cycle }),
        }
    }
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    fn config_with(resources: Vec<ResourceSpec>) -> StackConfig {
        StackConfig {
            project: ProjectConfig {
                name: "dev".to_string(),
                stack: "createS3Bucket".to_string(),
            },
            state: StateConfig::default(),
            credentials: crate::config::CredentialsConfig {
                role_arn: "arn:aws:iam::1:role/r".to_string(),
                ..Default::default()
            },
            engine: EngineConfig::default(),
            resources,
        }
    }

    #[test]
    fn test_valid_name() {
        assert!(is_valid_name("bucket-a"));
        assert!(is_valid_name("TestBucket"));
        assert!(is_valid_name("role_1"));
    }

    #[test]
    fn test_invalid_name() {
        assert!(!is_valid_name(""));
        assert!(!is_valid_name("1bucket"));
        assert!(!is_valid_name("bucket a"));
        assert!(!is_valid_name("bucket/a"));
    }

    #[test]
    fn test_valid_graph() {
        let config = config_with(vec![
            ResourceSpec::new("role-a", "role"),
            ResourceSpec::new("bucket-a", "bucket").depends_on("role-a"),
        ]);
        let result = ConfigValidator::new().validate(&config).unwrap();
        assert!(result.is_valid());
    }

    #[test]
    fn test_duplicate_name() {
        let config = config_with(vec![
            ResourceSpec::new("bucket-a", "bucket"),
            ResourceSpec::new("bucket-a", "bucket"),
        ]);
        let err = ConfigValidator::new().validate(&config).unwrap_err();
        assert!(matches!(
            err,
            WardenError::Config(ConfigError::DuplicateName { ref name }) if name == "bucket-a"
        ));
    }

    #[test]
    fn test_unknown_dependency() {
        let config = config_with(vec![
            ResourceSpec::new("bucket-a", "bucket").depends_on("role-a"),
        ]);
        let err = ConfigValidator::new().validate(&config).unwrap_err();
        assert!(matches!(
            err,
            WardenError::Config(ConfigError::UnknownDependency { .. })
        ));
    }

    #[test]
    fn test_cycle_is_rejected() {
        let config = config_with(vec![
            ResourceSpec::new("a", "bucket").depends_on("b"),
            ResourceSpec::new("b", "bucket").depends_on("a"),
        ]);
        let err = ConfigValidator::new().validate(&config).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::CyclicGraph);
    }

    #[test]
    fn test_s3_backend_needs_bucket() {
        let mut config = config_with(vec![]);
        config.state.backend = StateBackend::S3;
        let err = ConfigValidator::new().validate(&config).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Config);
    }

    #[test]
    fn test_zero_parallelism() {
        let mut config = config_with(vec![ResourceSpec::new("a", "bucket")]);
        config.engine.parallelism = 0;
        assert!(ConfigValidator::new().validate(&config).is_err());
    }

    #[test]
    fn test_missing_role_is_warning() {
        let mut config = config_with(vec![ResourceSpec::new("a", "bucket")]);
        config.credentials.role_arn.clear();
        let result = ConfigValidator::new().validate(&config).unwrap();
        assert_eq!(result.warning_count(), 1);
    }
}
