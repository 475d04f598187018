//! Identity tokens and the sources they are read from.
//!
//! Tokens are bearer secrets. They are held in memory only, never written
//! anywhere, and their `Debug` output is redacted.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::fmt;
use std::path::PathBuf;
use tracing::debug;

use crate::config::TokenSourceConfig;
use crate::error::{AuthError, ConfigError, Result};

/// Where an identity token came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TokenOrigin {
    /// An environment variable.
    Environment(String),
    /// A file on disk.
    File(PathBuf),
    /// Supplied directly by the caller.
    Static,
}

/// An opaque, time-bounded bearer credential from an external issuer.
#[derive(Clone)]
pub struct IdentityToken {
    value: String,
    issued_at: Option<DateTime<Utc>>,
    origin: TokenOrigin,
}

impl IdentityToken {
    /// Wraps a raw token value.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if the value is empty.
    pub fn new(value: impl Into<String>, origin: TokenOrigin) -> Result<Self> {
        let value = value.into().trim().to_string();
        if value.is_empty() {
            return Err(ConfigError::MissingTrustParameter {
                field: String::from("identity_token"),
            }
            .into());
        }
        Ok(Self {
            value,
            issued_at: None,
            origin,
        })
    }

    /// Records when the issuer minted the token.
    #[must_use]
    pub const fn with_issued_at(mut self, issued_at: DateTime<Utc>) -> Self {
        self.issued_at = Some(issued_at);
        self
    }

    /// Returns the raw token value for the exchange request.
    #[must_use]
    pub fn secret(&self) -> &str {
        &self.value
    }

    /// Returns when the token was issued, if known.
    #[must_use]
    pub const fn issued_at(&self) -> Option<DateTime<Utc>> {
        self.issued_at
    }

    /// Returns where the token came from.
    #[must_use]
    pub const fn origin(&self) -> &TokenOrigin {
        &self.origin
    }
}

impl fmt::Debug for IdentityToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IdentityToken")
            .field("value", &"<redacted>")
            .field("issued_at", &self.issued_at)
            .field("origin", &self.origin)
            .finish()
    }
}

/// Produces fresh identity tokens on demand.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait TokenSource: Send + Sync {
    /// Fetches a token. Called again whenever credentials need refreshing.
    async fn fetch(&self) -> Result<IdentityToken>;

    /// Human-readable description for logs and errors.
    fn describe(&self) -> String;
}

/// Reads the token from an environment variable.
#[derive(Debug, Clone)]
pub struct EnvTokenSource {
    var: String,
}

impl EnvTokenSource {
    /// Creates a source for the given variable.
    #[must_use]
    pub fn new(var: impl Into<String>) -> Self {
        Self { var: var.into() }
    }
}

#[async_trait]
impl TokenSource for EnvTokenSource {
    async fn fetch(&self) -> Result<IdentityToken> {
        debug!("Reading identity token from ${}", self.var);
        let value = std::env::var(&self.var).map_err(|e| AuthError::TokenUnavailable {
            source_name: self.describe(),
            message: e.to_string(),
        })?;
        IdentityToken::new(value, TokenOrigin::Environment(self.var.clone()))
    }

    fn describe(&self) -> String {
        format!("env:{}", self.var)
    }
}

/// Reads the token from a file, e.g. a projected service-account token.
#[derive(Debug, Clone)]
pub struct FileTokenSource {
    path: PathBuf,
}

impl FileTokenSource {
    /// Creates a source for the given file.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl TokenSource for FileTokenSource {
    async fn fetch(&self) -> Result<IdentityToken> {
        debug!("Reading identity token from {}", self.path.display());
        let value = tokio::fs::read_to_string(&self.path)
            .await
            .map_err(|e| AuthError::TokenUnavailable {
                source_name: self.describe(),
                message: e.to_string(),
            })?;
        let issued_at = tokio::fs::metadata(&self.path)
            .await
            .ok()
            .and_then(|m| m.modified().ok())
            .map(DateTime::<Utc>::from);

        let token = IdentityToken::new(value, TokenOrigin::File(self.path.clone()))?;
        Ok(match issued_at {
            Some(at) => token.with_issued_at(at),
            None => token,
        })
    }

    fn describe(&self) -> String {
        format!("file:{}", self.path.display())
    }
}

/// A fixed token handed in by the caller.
#[derive(Clone)]
pub struct StaticTokenSource {
    token: IdentityToken,
}

impl StaticTokenSource {
    /// Creates a source that always yields the given value.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if the value is empty.
    pub fn new(value: impl Into<String>) -> Result<Self> {
        Ok(Self {
            token: IdentityToken::new(value, TokenOrigin::Static)?,
        })
    }
}

#[async_trait]
impl TokenSource for StaticTokenSource {
    async fn fetch(&self) -> Result<IdentityToken> {
        Ok(self.token.clone())
    }

    fn describe(&self) -> String {
        String::from("static")
    }
}

/// Builds the token source described by the configuration.
#[must_use]
pub fn source_from_config(config: &TokenSourceConfig) -> Box<dyn TokenSource> {
    match config {
        TokenSourceConfig::Env { env } => Box::new(EnvTokenSource::new(env.clone())),
        TokenSourceConfig::File { path } => Box::new(FileTokenSource::new(path.clone())),
    }
}
