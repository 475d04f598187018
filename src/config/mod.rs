//! Configuration module for stackwarden.
//!
//! This module handles all configuration-related functionality:
//! - Parsing and deserializing `stackwarden.yaml`
//! - Validation of the desired resource graph
//! - Computing resource fingerprints for change detection

mod hash;
mod parser;
mod spec;
mod validator;

pub use hash::Fingerprinter;
pub use parser::{ConfigParser, DEFAULT_CONFIG_FILES, PASSPHRASE_ENV, find_config_file};
pub use spec::{
    CredentialsConfig, EngineConfig, ProjectConfig, PropertyMap, ResourceSpec, StackConfig,
    StateBackend, StateConfig, TokenSourceConfig,
};
pub use validator::{ConfigValidator, Issue, ValidationError, ValidationResult};
