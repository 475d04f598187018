//! Configuration parser for loading stack files.
//!
//! This module handles loading configuration from YAML files and environment
//! variables, with proper precedence and error handling.

use crate::error::{ConfigError, Result, WardenError};
use std::path::Path;
use tracing::{debug, info};

use super::spec::StackConfig;

/// Environment variable holding the state encryption passphrase.
pub const PASSPHRASE_ENV: &str = "STACKWARDEN_CONFIG_PASSPHRASE";

/// Configuration parser for loading stack configuration.
#[derive(Debug, Default)]
pub struct ConfigParser {
    /// Base path for resolving relative paths.
    base_path: Option<std::path::PathBuf>,
}

impl ConfigParser {
    /// Creates a new configuration parser.
    #[must_use]
    pub const fn new() -> Self {
        Self { base_path: None }
    }

    /// Sets the base path for resolving relative paths.
    #[must_use]
    pub fn with_base_path(mut self, path: impl Into<std::path::PathBuf>) -> Self {
        self.base_path = Some(path.into());
        self
    }

    /// Loads configuration from a YAML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load_file(&self, path: impl AsRef<Path>) -> Result<StackConfig> {
        let path = path.as_ref();
        info!("Loading configuration from: {}", path.display());

        if !path.exists() {
            return Err(WardenError::Config(ConfigError::FileNotFound {
                path: path.to_path_buf(),
            }));
        }

        let content = std::fs::read_to_string(path).map_err(|e| {
            WardenError::Config(ConfigError::ParseError {
                message: format!("Failed to read file: {e}"),
                location: Some(path.display().to_string()),
            })
        })?;

        self.parse_yaml(&content, Some(path))
    }

    /// Parses configuration from a YAML string.
    ///
    /// # Errors
    ///
    /// Returns an error if the YAML is invalid.
    pub fn parse_yaml(&self, content: &str, source: Option<&Path>) -> Result<StackConfig> {
        debug!("Parsing YAML configuration");

        let mut config: StackConfig = serde_yaml::from_str(content).map_err(|e| {
            let location = source.map(|p| p.display().to_string());
            WardenError::Config(ConfigError::ParseError {
                message: format!("YAML parse error: {e}"),
                location,
            })
        })?;

        if let (Some(base), Some(dir)) = (&self.base_path, config.state.path.as_mut()) {
            if Path::new(dir.as_str()).is_relative() {
                *dir = base.join(dir.as_str()).display().to_string();
            }
        }

        debug!(
            "Parsed stack {} with {} resources",
            config.stack_id(),
            config.resources.len()
        );
        Ok(config)
    }

    /// Loads configuration with environment variable overrides.
    ///
    /// Recognised variables: `STACKWARDEN_PROJECT`, `STACKWARDEN_STACK`,
    /// `ROLE_ARN`, `STACKWARDEN_STATE_BUCKET` and `STACKWARDEN_STATE_PREFIX`.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load_with_env(&self, path: impl AsRef<Path>) -> Result<StackConfig> {
        let mut config = self.load_file(path)?;
        apply_env_overrides(&mut config, |name| std::env::var(name).ok());
        Ok(config)
    }

    /// Loads the .env file if present.
    ///
    /// # Errors
    ///
    /// Returns an error if the .env file exists but cannot be loaded.
    pub fn load_dotenv(&self) -> Result<()> {
        let env_path = self
            .base_path
            .as_ref()
            .map_or_else(|| std::path::PathBuf::from(".env"), |p| p.join(".env"));

        if env_path.exists() {
            info!("Loading environment from: {}", env_path.display());
            dotenvy::from_path(&env_path).map_err(|e| {
                WardenError::Config(ConfigError::ParseError {
                    message: format!("Failed to load .env file: {e}"),
                    location: Some(env_path.display().to_string()),
                })
            })?;
        } else {
            debug!(".env file not found at: {}", env_path.display());
        }

        Ok(())
    }

    /// Gets the state encryption passphrase from the environment.
    ///
    /// # Errors
    ///
    /// Returns an error if the passphrase is not set.
    pub fn state_passphrase() -> Result<String> {
        std::env::var(PASSPHRASE_ENV).map_err(|_| {
            WardenError::Config(ConfigError::MissingEnvVar {
                name: String::from(PASSPHRASE_ENV),
            })
        })
    }
}

/// Applies environment overrides using the given lookup.
fn apply_env_overrides(config: &mut StackConfig, lookup: impl Fn(&str) -> Option<String>) {
    if let Some(name) = lookup("STACKWARDEN_PROJECT") {
        debug!("Overriding project.name from environment");
        config.project.name = name;
    }

    if let Some(stack) = lookup("STACKWARDEN_STACK") {
        debug!("Overriding project.stack from environment");
        config.project.stack = stack;
    }

    if let Some(role) = lookup("ROLE_ARN") {
        debug!("Overriding credentials.role_arn from environment");
        config.credentials.role_arn = role;
    }

    if let Some(bucket) = lookup("STACKWARDEN_STATE_BUCKET") {
        debug!("Overriding state.bucket from environment");
        config.state.bucket = Some(bucket);
    }

    if let Some(prefix) = lookup("STACKWARDEN_STATE_PREFIX") {
        debug!("Overriding state.prefix from environment");
        config.state.prefix = Some(prefix);
    }
}

/// Default configuration file names to search for.
pub const DEFAULT_CONFIG_FILES: &[&str] = &[
    "stackwarden.yaml",
    "stackwarden.yml",
    "stack.yaml",
    "stack.yml",
];

/// Finds the configuration file in the current directory or parent directories.
///
/// # Errors
///
/// Returns an error if no configuration file is found.
pub fn find_config_file(start_dir: impl AsRef<Path>) -> Result<std::path::PathBuf> {
    let start = start_dir.as_ref();
    let mut current = start.to_path_buf();

    loop {
        for filename in DEFAULT_CONFIG_FILES {
            let config_path = current.join(filename);
            if config_path.exists() {
                info!("Found configuration file: {}", config_path.display());
                return Ok(config_path);
            }
        }

        if !current.pop() {
            break;
        }
    }

    Err(WardenError::Config(ConfigError::FileNotFound {
        path: start.join(DEFAULT_CONFIG_FILES[0]),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::spec::{StateBackend, TokenSourceConfig};
    use std::collections::HashMap;

    #[test]
    fn test_parse_minimal_config() {
        let yaml = r"
project:
  name: dev
";
        let parser = ConfigParser::new();
        let config = parser.parse_yaml(yaml, None).unwrap();
        assert_eq!(config.project.name, "dev");
        assert_eq!(config.project.stack, "dev");
        assert_eq!(config.state.backend, StateBackend::Local);
        assert!(config.resources.is_empty());
    }

    #[test]
    fn test_parse_full_config() {
        let yaml = r#"
project:
  name: dev
  stack: create-s3-bucket

state:
  backend: s3
  bucket: warden-state
  prefix: stacks/dev

credentials:
  role_arn: arn:aws:iam::123456789012:role/deployer
  session_name: LocalDev
  token:
    source: file
    path: /var/run/secrets/token

engine:
  parallelism: 2
  refresh_before_up: false

resources:
  - name: role-a
    type: role
  - name: bucket-a
    type: bucket
    properties:
      acl: private
      tags:
        team: infra
    depends_on: [role-a]
    sensitive: [acl]
"#;
        let parser = ConfigParser::new();
        let config = parser.parse_yaml(yaml, None).unwrap();
        assert_eq!(config.stack_id(), "dev-create-s3-bucket");
        assert_eq!(config.state.bucket.as_deref(), Some("warden-state"));
        assert_eq!(config.engine.parallelism, 2);
        assert!(!config.engine.refresh_before_up);
        assert!(matches!(
            config.credentials.token,
            TokenSourceConfig::File { .. }
        ));
        assert_eq!(config.resources.len(), 2);

        let bucket = config.resource("bucket-a").unwrap();
        assert_eq!(bucket.type_name, "bucket");
        assert_eq!(bucket.depends_on, vec!["role-a".to_string()]);
        assert!(bucket.is_sensitive("acl"));
        assert_eq!(bucket.properties["tags"]["team"], "infra");
    }

    #[test]
    fn test_parse_invalid_yaml() {
        let parser = ConfigParser::new();
        let err = parser.parse_yaml("project: [", None).unwrap_err();
        assert!(matches!(
            err,
            WardenError::Config(ConfigError::ParseError { .. })
        ));
    }

    #[test]
    fn test_env_overrides() {
        let parser = ConfigParser::new();
        let mut config = parser
            .parse_yaml("project:\n  name: dev\n", None)
            .unwrap();
        let vars: HashMap<&str, &str> = HashMap::from([
            ("ROLE_ARN", "arn:aws:iam::1:role/ci"),
            ("STACKWARDEN_STACK", "prod"),
        ]);
        apply_env_overrides(&mut config, |name| vars.get(name).map(ToString::to_string));
        assert_eq!(config.credentials.role_arn, "arn:aws:iam::1:role/ci");
        assert_eq!(config.project.stack, "prod");
        assert_eq!(config.project.name, "dev");
    }

    #[test]
    fn test_relative_state_path_uses_base() {
        let parser = ConfigParser::new().with_base_path("/srv/infra");
        let config = parser
            .parse_yaml("project:\n  name: dev\nstate:\n  path: .stackwarden\n", None)
            .unwrap();
        assert_eq!(config.state.path.as_deref(), Some("/srv/infra/.stackwarden"));
    }

    #[test]
    fn test_find_config_file_walks_up() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("stackwarden.yaml"), "project:\n  name: x\n").unwrap();
        let nested = dir.path().join("a").join("b");
        std::fs::create_dir_all(&nested).unwrap();

        let found = find_config_file(&nested).unwrap();
        assert_eq!(found, dir.path().join("stackwarden.yaml"));
    }
}
