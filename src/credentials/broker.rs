//! Credential broker: caches federated credentials and refreshes them.
//!
//! The broker owns the only copy of the current credential. Callers get a
//! shared read-only handle. When the cached credential is inside its refresh
//! margin the broker pulls a fresh identity token from its source and runs
//! the exchange again. Concurrent callers wait on the same refresh.

use async_trait::async_trait;
use chrono::{Duration, Utc};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::exchange::{FederatedCredential, TrustExchange, TrustParams};
use super::token::{IdentityToken, TokenSource};
use crate::config::CredentialsConfig;
use crate::error::{AuthError, Result, WardenError};

/// Default number of exchange attempts for transient failures.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Default refresh margin before expiry.
pub const DEFAULT_REFRESH_MARGIN_SECS: i64 = 60;

/// Retry and refresh tuning.
#[derive(Debug, Clone)]
pub struct BrokerSettings {
    /// Credentials are treated as expired this long before their expiry.
    pub refresh_margin: Duration,
    /// Maximum exchange attempts per refresh.
    pub max_attempts: u32,
    /// Delay before the first retry. Doubles on each further retry.
    pub base_backoff: std::time::Duration,
}

impl Default for BrokerSettings {
    fn default() -> Self {
        Self {
            refresh_margin: Duration::seconds(DEFAULT_REFRESH_MARGIN_SECS),
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            base_backoff: std::time::Duration::from_millis(500),
        }
    }
}

impl From<&CredentialsConfig> for BrokerSettings {
    fn from(config: &CredentialsConfig) -> Self {
        let margin = i64::try_from(config.refresh_margin_secs)
            .ok()
            .and_then(Duration::try_seconds)
            .unwrap_or_else(|| Duration::seconds(DEFAULT_REFRESH_MARGIN_SECS));
        Self {
            refresh_margin: margin,
            ..Self::default()
        }
    }
}

/// Hands out valid federated credentials for the duration of a pass.
pub struct CredentialBroker {
    source: Arc<dyn TokenSource>,
    exchange: Arc<dyn TrustExchange>,
    params: TrustParams,
    settings: BrokerSettings,
    cached: Mutex<Option<Arc<FederatedCredential>>>,
    exchanges: AtomicU64,
}

impl CredentialBroker {
    /// Creates a broker. Nothing is fetched until the first [`obtain`](Self::obtain).
    #[must_use]
    pub fn new(
        source: Arc<dyn TokenSource>,
        exchange: Arc<dyn TrustExchange>,
        params: TrustParams,
    ) -> Self {
        Self {
            source,
            exchange,
            params,
            settings: BrokerSettings::default(),
            cached: Mutex::new(None),
            exchanges: AtomicU64::new(0),
        }
    }

    /// Replaces the retry and refresh settings.
    #[must_use]
    pub fn with_settings(mut self, settings: BrokerSettings) -> Self {
        self.settings = settings;
        self
    }

    /// Returns the trust parameters this broker exchanges against.
    #[must_use]
    pub const fn params(&self) -> &TrustParams {
        &self.params
    }

    /// Number of exchanges performed so far.
    #[must_use]
    pub fn exchange_count(&self) -> u64 {
        self.exchanges.load(Ordering::Relaxed)
    }

    /// Returns a credential valid for at least the refresh margin.
    ///
    /// Inside the validity window this returns the cached credential without
    /// any I/O. Otherwise a fresh identity token is fetched and exchanged.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` for incomplete trust parameters, `AuthError`
    /// when the exchange is rejected or the token is unavailable, and a
    /// transient `AuthError` once the retry budget is exhausted.
    pub async fn obtain(&self) -> Result<Arc<FederatedCredential>> {
        self.params.validate()?;

        let mut cached = self.cached.lock().await;
        if let Some(cred) = cached.as_ref()
            && cred.is_valid_at(Utc::now(), self.settings.refresh_margin)
        {
            debug!("Using cached credential ({}s left)", cred.remaining().num_seconds());
            return Ok(Arc::clone(cred));
        }

        if cached.is_some() {
            info!("Credential inside refresh margin, re-exchanging");
        }

        let token = self.source.fetch().await?;
        let fresh = Arc::new(self.exchange_with_retry(&token).await?);
        info!(
            "Obtained credential for {} (expires {})",
            self.params.role_arn, fresh.expires_at
        );
        *cached = Some(Arc::clone(&fresh));
        Ok(fresh)
    }

    /// Drops the cached credential so the next call re-exchanges.
    pub async fn invalidate(&self) {
        *self.cached.lock().await = None;
    }

    async fn exchange_with_retry(&self, token: &IdentityToken) -> Result<FederatedCredential> {
        let mut attempt = 0u32;
        let mut delay = self.settings.base_backoff;

        loop {
            attempt += 1;
            self.exchanges.fetch_add(1, Ordering::Relaxed);

            match self.exchange.exchange(token, &self.params).await {
                Ok(cred) => return Ok(cred),
                Err(WardenError::Auth(e)) if e.is_transient() => {
                    if attempt >= self.settings.max_attempts {
                        return Err(AuthError::Transient {
                            attempts: attempt,
                            message: e.to_string(),
                        }
                        .into());
                    }
                    warn!(
                        "Trust exchange attempt {attempt}/{} failed: {e}. Retrying in {delay:?}",
                        self.settings.max_attempts
                    );
                    tokio::time::sleep(delay).await;
                    delay = delay.saturating_mul(2);
                }
                Err(e) => return Err(e),
            }
        }
    }
}

impl std::fmt::Debug for CredentialBroker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialBroker")
            .field("source", &self.source.describe())
            .field("params", &self.params)
            .field("exchanges", &self.exchange_count())
            .finish_non_exhaustive()
    }
}

/// Anything that can hand the engine a currently valid credential.
///
/// The engine asks again before every provider call, so a broker can refresh
/// underneath a long pass.
#[async_trait]
pub trait CredentialProvider: Send + Sync {
    /// Returns a credential valid for at least the next provider call.
    async fn credential(&self) -> Result<Arc<FederatedCredential>>;
}

#[async_trait]
impl CredentialProvider for CredentialBroker {
    async fn credential(&self) -> Result<Arc<FederatedCredential>> {
        self.obtain().await
    }
}

/// A fixed credential, for callers that manage expiry themselves.
#[async_trait]
impl CredentialProvider for FederatedCredential {
    async fn credential(&self) -> Result<Arc<FederatedCredential>> {
        Ok(Arc::new(self.clone()))
    }
}
