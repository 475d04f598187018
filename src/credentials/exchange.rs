//! Trust exchange: identity token in, temporary cloud credentials out.
//!
//! [`StsTrustExchange`] talks to an `AssumeRoleWithWebIdentity` compatible
//! endpoint. The call is unsigned; the identity token is the proof.

use async_trait::async_trait;
use chrono::{DateTime, Duration, TimeZone, Utc};
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use std::fmt;
use tracing::{debug, warn};

use super::token::IdentityToken;
use crate::config::CredentialsConfig;
use crate::error::{AuthError, ConfigError, Result};

/// API version of the exchange endpoint.
const STS_API_VERSION: &str = "2011-06-15";

/// Request timeout for a single exchange.
const EXCHANGE_TIMEOUT_SECS: u64 = 30;

/// Parameters of the trust relationship to exercise.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrustParams {
    /// Role to assume.
    pub role_arn: String,
    /// Session name recorded by the exchange.
    pub session_name: String,
    /// Target region.
    pub region: String,
    /// Requested credential lifetime in seconds.
    pub duration_secs: u32,
}

impl TrustParams {
    /// Checks that every field is filled in.
    ///
    /// # Errors
    ///
    /// Returns a configuration error naming the first empty field.
    pub fn validate(&self) -> Result<()> {
        let fields = [
            ("role_arn", self.role_arn.as_str()),
            ("session_name", self.session_name.as_str()),
            ("region", self.region.as_str()),
        ];
        if let Some((field, _)) = fields.iter().find(|(_, v)| v.trim().is_empty()) {
            return Err(ConfigError::MissingTrustParameter {
                field: (*field).to_string(),
            }
            .into());
        }
        if self.duration_secs == 0 {
            return Err(ConfigError::MissingTrustParameter {
                field: String::from("duration_secs"),
            }
            .into());
        }
        Ok(())
    }
}

impl From<&CredentialsConfig> for TrustParams {
    fn from(config: &CredentialsConfig) -> Self {
        Self {
            role_arn: config.role_arn.clone(),
            session_name: config.session_name.clone(),
            region: config.region.clone(),
            duration_secs: config.duration_secs,
        }
    }
}

/// What a credential is allowed to touch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CredentialScope {
    /// Account id, when the exchange reports it.
    pub account: Option<String>,
    /// Region the credential is meant for.
    pub region: String,
    /// Role that was assumed.
    pub role_arn: String,
}

/// Temporary credentials derived from an identity token.
#[derive(Clone)]
pub struct FederatedCredential {
    /// Access key id.
    pub access_key_id: String,
    /// Secret access key.
    pub secret_access_key: String,
    /// Session token.
    pub session_token: String,
    /// When the credential stops working.
    pub expires_at: DateTime<Utc>,
    /// Scope of the credential.
    pub scope: CredentialScope,
}

impl FederatedCredential {
    /// Returns true if the credential is still usable `margin` from `now`.
    #[must_use]
    pub fn is_valid_at(&self, now: DateTime<Utc>, margin: Duration) -> bool {
        now + margin < self.expires_at
    }

    /// Time left before expiry, saturating at zero.
    #[must_use]
    pub fn remaining(&self) -> Duration {
        (self.expires_at - Utc::now()).max(Duration::zero())
    }
}

impl fmt::Debug for FederatedCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FederatedCredential")
            .field("access_key_id", &self.access_key_id)
            .field("secret_access_key", &"<redacted>")
            .field("session_token", &"<redacted>")
            .field("expires_at", &self.expires_at)
            .field("scope", &self.scope)
            .finish()
    }
}

/// Exchanges identity tokens for federated credentials.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait TrustExchange: Send + Sync {
    /// Performs one exchange. Transient failures surface as
    /// [`AuthError::Unavailable`]; retries are the caller's business.
    async fn exchange(
        &self,
        token: &IdentityToken,
        params: &TrustParams,
    ) -> Result<FederatedCredential>;
}

/// HTTP client for an `AssumeRoleWithWebIdentity` endpoint.
#[derive(Debug, Clone)]
pub struct StsTrustExchange {
    client: Client,
    endpoint: Option<String>,
}

impl StsTrustExchange {
    /// Creates a client for the regional public endpoint.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be built.
    pub fn new() -> Result<Self> {
        let client = Client::builder()
            .timeout(std::time::Duration::from_secs(EXCHANGE_TIMEOUT_SECS))
            .build()
            .map_err(|e| AuthError::unavailable(format!("Failed to create HTTP client: {e}")))?;
        Ok(Self {
            client,
            endpoint: None,
        })
    }

    /// Overrides the endpoint URL.
    #[must_use]
    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = Some(endpoint.into());
        self
    }

    fn endpoint_for(&self, region: &str) -> String {
        self.endpoint
            .clone()
            .unwrap_or_else(|| format!("https://sts.{region}.amazonaws.com/"))
    }
}

#[async_trait]
impl TrustExchange for StsTrustExchange {
    async fn exchange(
        &self,
        token: &IdentityToken,
        params: &TrustParams,
    ) -> Result<FederatedCredential> {
        let url = self.endpoint_for(&params.region);
        debug!(
            "Exchanging identity token for role {} at {url}",
            params.role_arn
        );

        let duration = params.duration_secs.to_string();
        let form = [
            ("Action", "AssumeRoleWithWebIdentity"),
            ("Version", STS_API_VERSION),
            ("RoleArn", params.role_arn.as_str()),
            ("RoleSessionName", params.session_name.as_str()),
            ("WebIdentityToken", token.secret()),
            ("DurationSeconds", duration.as_str()),
        ];

        let response = self
            .client
            .post(&url)
            .header(reqwest::header::ACCEPT, "application/json")
            .form(&form)
            .send()
            .await
            .map_err(|e| AuthError::unavailable(format!("Request failed: {e}")))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| AuthError::unavailable(format!("Failed to read response: {e}")))?;

        if !status.is_success() {
            return Err(classify_failure(status, &body).into());
        }

        let parsed: StsEnvelope = serde_json::from_str(&body).map_err(|e| {
            AuthError::InvalidResponse {
                message: format!("Failed to parse response: {e}"),
            }
        })?;
        parsed.into_credential(params)
    }
}

/// Maps a non-success response onto the auth error taxonomy.
fn classify_failure(status: StatusCode, body: &str) -> AuthError {
    let detail = serde_json::from_str::<StsErrorEnvelope>(body)
        .map(|e| format!("{}: {}", e.error.code, e.error.message))
        .unwrap_or_else(|_| format!("HTTP {status}"));

    let throttled = status == StatusCode::TOO_MANY_REQUESTS
        || detail.starts_with("Throttling")
        || detail.starts_with("IDPCommunicationError");

    if status.is_server_error() || throttled {
        warn!("Trust exchange unavailable: {detail}");
        AuthError::unavailable(detail)
    } else {
        AuthError::Rejected { reason: detail }
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct StsEnvelope {
    assume_role_with_web_identity_response: StsResponse,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct StsResponse {
    assume_role_with_web_identity_result: StsResult,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct StsResult {
    credentials: StsCredentials,
    #[serde(default)]
    assumed_role_user: Option<StsAssumedRoleUser>,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct StsCredentials {
    access_key_id: String,
    secret_access_key: String,
    session_token: String,
    expiration: StsTimestamp,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct StsAssumedRoleUser {
    arn: String,
}

/// Expiration arrives as epoch seconds in JSON mode, RFC 3339 elsewhere.
#[derive(Deserialize)]
#[serde(untagged)]
enum StsTimestamp {
    Epoch(f64),
    Text(String),
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct StsErrorEnvelope {
    error: StsErrorBody,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct StsErrorBody {
    code: String,
    #[serde(default)]
    message: String,
}

impl StsTimestamp {
    fn to_datetime(&self) -> Option<DateTime<Utc>> {
        match self {
            #[allow(clippy::cast_possible_truncation)]
            Self::Epoch(secs) => Utc.timestamp_opt(secs.trunc() as i64, 0).single(),
            Self::Text(text) => DateTime::parse_from_rfc3339(text)
                .ok()
                .map(|dt| dt.with_timezone(&Utc)),
        }
    }
}

impl StsEnvelope {
    fn into_credential(self, params: &TrustParams) -> Result<FederatedCredential> {
        let result = self
            .assume_role_with_web_identity_response
            .assume_role_with_web_identity_result;
        let expires_at =
            result
                .credentials
                .expiration
                .to_datetime()
                .ok_or_else(|| AuthError::InvalidResponse {
                    message: String::from("Unreadable credential expiration"),
                })?;

        // arn:aws:sts::<account>:assumed-role/<role>/<session>
        let account = result
            .assumed_role_user
            .and_then(|user| user.arn.split(':').nth(4).map(ToString::to_string))
            .filter(|a| !a.is_empty());

        Ok(FederatedCredential {
            access_key_id: result.credentials.access_key_id,
            secret_access_key: result.credentials.secret_access_key,
            session_token: result.credentials.session_token,
            expires_at,
            scope: CredentialScope {
                account,
                region: params.region.clone(),
                role_arn: params.role_arn.clone(),
            },
        })
    }
}
