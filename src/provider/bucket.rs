//! Object-storage bucket resource type, backed by S3.
//!
//! Properties:
//! - `bucket`: physical bucket name. Defaults to the logical name plus a
//!   random suffix, lowercased.
//! - `tags`: map of string tags.
//!
//! The S3 client is built per call from the pass credential, so nothing
//! here reads ambient AWS configuration.

use async_trait::async_trait;
use aws_sdk_s3::Client;
use aws_sdk_s3::config::{BehaviorVersion, Credentials, Region};
use aws_sdk_s3::error::ProvideErrorMetadata;
use aws_sdk_s3::types::{BucketLocationConstraint, CreateBucketConfiguration, Tag, Tagging};
use serde_json::{Value, json};
use std::collections::BTreeMap;
use tracing::{debug, info};
use uuid::Uuid;

use super::adapter::{Created, ProviderAdapter};
use crate::config::{PropertyMap, ResourceSpec};
use crate::credentials::FederatedCredential;
use crate::error::{ProviderError, Result};

/// Type name under which the adapter is registered by default.
pub const BUCKET_TYPE: &str = "bucket";

/// Region that rejects an explicit location constraint.
const DEFAULT_S3_REGION: &str = "us-east-1";

/// Bucket adapter.
#[derive(Debug, Clone, Default)]
pub struct BucketAdapter {
    endpoint: Option<String>,
}

impl BucketAdapter {
    /// Creates an adapter for the public S3 endpoints.
    #[must_use]
    pub const fn new() -> Self {
        Self { endpoint: None }
    }

    /// Points the adapter at an S3-compatible endpoint (path-style).
    #[must_use]
    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = Some(endpoint.into());
        self
    }

    fn client(&self, cred: &FederatedCredential) -> Client {
        let credentials = Credentials::new(
            cred.access_key_id.clone(),
            cred.secret_access_key.clone(),
            Some(cred.session_token.clone()),
            Some(cred.expires_at.into()),
            "stackwarden-federated",
        );

        let mut builder = aws_sdk_s3::Config::builder()
            .behavior_version(BehaviorVersion::latest())
            .region(Region::new(cred.scope.region.clone()))
            .credentials_provider(credentials);
        if let Some(endpoint) = &self.endpoint {
            builder = builder.endpoint_url(endpoint).force_path_style(true);
        }
        Client::from_conf(builder.build())
    }
}

async fn apply_tags(client: &Client, bucket: &str, tags: &BTreeMap<String, String>) -> Result<()> {
    if tags.is_empty() {
        client
            .delete_bucket_tagging()
            .bucket(bucket)
            .send()
            .await
            .map_err(|e| failed("update", e))?;
        return Ok(());
    }

    let tag_set = tags
        .iter()
        .map(|(k, v)| Tag::builder().key(k).value(v).build())
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| invalid(format!("Invalid tag: {e}")))?;
    let tagging = Tagging::builder()
        .set_tag_set(Some(tag_set))
        .build()
        .map_err(|e| invalid(format!("Invalid tagging: {e}")))?;

    client
        .put_bucket_tagging()
        .bucket(bucket)
        .tagging(tagging)
        .send()
        .await
        .map_err(|e| failed("tag", e))?;
    Ok(())
}

#[async_trait]
impl ProviderAdapter for BucketAdapter {
    async fn create(&self, spec: &ResourceSpec, cred: &FederatedCredential) -> Result<Created> {
        let bucket = bucket_name(spec)?;
        let tags = parse_tags(&spec.properties)?;
        let region = cred.scope.region.as_str();
        let client = self.client(cred);

        info!("Creating bucket {bucket} in {region}");
        let mut request = client.create_bucket().bucket(&bucket);
        if region != DEFAULT_S3_REGION {
            request = request.create_bucket_configuration(
                CreateBucketConfiguration::builder()
                    .location_constraint(BucketLocationConstraint::from(region))
                    .build(),
            );
        }
        request.send().await.map_err(|e| failed("create", e))?;

        if !tags.is_empty() {
            apply_tags(&client, &bucket, &tags).await?;
        }

        Ok(Created {
            outputs: outputs(&bucket, region, &tags),
            provider_id: bucket,
        })
    }

    async fn read(
        &self,
        provider_id: &str,
        cred: &FederatedCredential,
    ) -> Result<Option<PropertyMap>> {
        let client = self.client(cred);

        match client.head_bucket().bucket(provider_id).send().await {
            Ok(_) => {}
            Err(e) => {
                let service = e.into_service_error();
                if service.is_not_found() {
                    debug!("Bucket {provider_id} no longer exists");
                    return Ok(None);
                }
                return Err(ProviderError::failed(BUCKET_TYPE, "read", service.to_string()).into());
            }
        }

        let tags = match client.get_bucket_tagging().bucket(provider_id).send().await {
            Ok(out) => out
                .tag_set()
                .iter()
                .map(|t| (t.key().to_string(), t.value().to_string()))
                .collect(),
            Err(e) if e.code() == Some("NoSuchTagSet") => BTreeMap::new(),
            Err(e) => return Err(failed("read", e)),
        };

        Ok(Some(outputs(provider_id, &cred.scope.region, &tags)))
    }

    async fn update(
        &self,
        provider_id: &str,
        spec: &ResourceSpec,
        cred: &FederatedCredential,
    ) -> Result<PropertyMap> {
        if let Some(Value::String(wanted)) = spec.properties.get("bucket")
            && wanted != provider_id
        {
            return Err(invalid(format!(
                "bucket name cannot change in place ({provider_id} -> {wanted})"
            )));
        }

        let tags = parse_tags(&spec.properties)?;
        let client = self.client(cred);
        info!("Updating tags on bucket {provider_id}");
        apply_tags(&client, provider_id, &tags).await?;

        Ok(outputs(provider_id, &cred.scope.region, &tags))
    }

    async fn delete(&self, provider_id: &str, cred: &FederatedCredential) -> Result<()> {
        let client = self.client(cred);
        info!("Deleting bucket {provider_id}");

        match client.delete_bucket().bucket(provider_id).send().await {
            Ok(_) => Ok(()),
            Err(e) if e.code() == Some("NoSuchBucket") => {
                debug!("Bucket {provider_id} already gone");
                Ok(())
            }
            Err(e) => Err(failed("delete", e)),
        }
    }
}

/// Physical name from the `bucket` property, or an auto-generated one.
fn bucket_name(spec: &ResourceSpec) -> Result<String> {
    match spec.properties.get("bucket") {
        Some(Value::String(name)) if !name.is_empty() => Ok(name.clone()),
        Some(other) if !other.is_null() => Err(invalid("'bucket' must be a string")),
        _ => {
            let id = Uuid::new_v4().simple().to_string();
            let suffix = &id[..8];
            let base: String = spec
                .name
                .to_ascii_lowercase()
                .chars()
                .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '-' })
                .collect();
            Ok(format!("{base}-{suffix}"))
        }
    }
}

fn parse_tags(properties: &PropertyMap) -> Result<BTreeMap<String, String>> {
    match properties.get("tags") {
        None | Some(Value::Null) => Ok(BTreeMap::new()),
        // S3 hands tag values back as strings, so anything else would read as drift
        Some(Value::Object(map)) => map
            .iter()
            .map(|(k, v)| match v {
                Value::String(value) => Ok((k.clone(), value.clone())),
                other => Err(invalid(format!(
                    "tag '{k}' must be a string, found {other} (quote it)"
                ))),
            })
            .collect(),
        Some(_) => Err(invalid("'tags' must be a map")),
    }
}

fn outputs(bucket: &str, region: &str, tags: &BTreeMap<String, String>) -> PropertyMap {
    PropertyMap::from([
        ("bucket".to_string(), json!(bucket)),
        ("region".to_string(), json!(region)),
        ("arn".to_string(), json!(format!("arn:aws:s3:::{bucket}"))),
        ("tags".to_string(), json!(tags)),
    ])
}

fn invalid(message: impl Into<String>) -> crate::error::WardenError {
    ProviderError::InvalidProperties {
        type_name: BUCKET_TYPE.to_string(),
        message: message.into(),
    }
    .into()
}

fn failed(operation: &str, err: impl std::fmt::Display) -> crate::error::WardenError {
    ProviderError::failed(BUCKET_TYPE, operation, err.to_string()).into()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::testing::test_credential;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[test]
    fn test_autogenerated_name() {
        let spec = ResourceSpec::new("TestBucket", BUCKET_TYPE);
        let name = bucket_name(&spec).unwrap();
        assert!(name.starts_with("testbucket-"));
        assert_eq!(name.len(), "testbucket-".len() + 8);
    }

    #[test]
    fn test_explicit_name_and_tags() {
        let spec = ResourceSpec::new("logs", BUCKET_TYPE)
            .with_property("bucket", "acme-logs")
            .with_property("tags", json!({"team": "infra", "tier": "2"}));
        assert_eq!(bucket_name(&spec).unwrap(), "acme-logs");

        let tags = parse_tags(&spec.properties).unwrap();
        assert_eq!(tags["team"], "infra");
        assert_eq!(tags["tier"], "2");
    }

    #[tokio::test]
    async fn test_numeric_tag_rejected_before_any_call() {
        let server = MockServer::start().await;
        let adapter = BucketAdapter::new().with_endpoint(server.uri());
        let spec = ResourceSpec::new("logs", BUCKET_TYPE)
            .with_property("bucket", "acme-logs")
            .with_property("tags", json!({"tier": 2}));

        let err = adapter.create(&spec, &test_credential()).await.unwrap_err();
        assert!(matches!(
            err,
            crate::error::WardenError::Provider(ProviderError::InvalidProperties { .. })
        ));
        assert!(server.received_requests().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_read_tags_match_declared_strings() {
        let server = MockServer::start().await;
        Mock::given(method("HEAD"))
            .and(path("/acme-logs"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/acme-logs"))
            .and(query_param("tagging", ""))
            .respond_with(ResponseTemplate::new(200).set_body_string(
                r#"<?xml version="1.0" encoding="UTF-8"?>
<Tagging xmlns="http://s3.amazonaws.com/doc/2006-03-01/"><TagSet><Tag><Key>tier</Key><Value>2</Value></Tag></TagSet></Tagging>"#,
            ))
            .mount(&server)
            .await;

        let adapter = BucketAdapter::new().with_endpoint(server.uri());
        let live = adapter
            .read("acme-logs", &test_credential())
            .await
            .unwrap()
            .unwrap();

        let declared = ResourceSpec::new("logs", BUCKET_TYPE).with_property("tags", json!({"tier": "2"}));
        assert_eq!(live["tags"], declared.properties["tags"]);
    }

    #[test]
    fn test_bad_properties() {
        let spec = ResourceSpec::new("logs", BUCKET_TYPE).with_property("bucket", 5);
        assert!(bucket_name(&spec).is_err());

        let spec = ResourceSpec::new("logs", BUCKET_TYPE).with_property("tags", "x");
        assert!(parse_tags(&spec.properties).is_err());
    }

    #[tokio::test]
    async fn test_create_against_endpoint() {
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .and(path("/acme-logs"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1..)
            .mount(&server)
            .await;

        let adapter = BucketAdapter::new().with_endpoint(server.uri());
        let spec = ResourceSpec::new("logs", BUCKET_TYPE).with_property("bucket", "acme-logs");
        let created = adapter.create(&spec, &test_credential()).await.unwrap();

        assert_eq!(created.provider_id, "acme-logs");
        assert_eq!(created.outputs["arn"], "arn:aws:s3:::acme-logs");
        assert_eq!(created.outputs["region"], "ap-south-1");
    }

    #[tokio::test]
    async fn test_read_missing_bucket() {
        let server = MockServer::start().await;
        Mock::given(method("HEAD"))
            .and(path("/gone-bucket"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let adapter = BucketAdapter::new().with_endpoint(server.uri());
        let live = adapter.read("gone-bucket", &test_credential()).await.unwrap();
        assert!(live.is_none());
    }

    #[tokio::test]
    async fn test_update_rejects_rename() {
        let adapter = BucketAdapter::new();
        let spec = ResourceSpec::new("logs", BUCKET_TYPE).with_property("bucket", "other");
        let err = adapter
            .update("acme-logs", &spec, &test_credential())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("cannot change in place"));
    }

    #[tokio::test]
    async fn test_delete_tags_when_cleared() {
        let server = MockServer::start().await;
        Mock::given(method("DELETE"))
            .and(path("/acme-logs"))
            .and(query_param("tagging", ""))
            .respond_with(ResponseTemplate::new(204))
            .expect(1)
            .mount(&server)
            .await;

        let adapter = BucketAdapter::new().with_endpoint(server.uri());
        let spec = ResourceSpec::new("logs", BUCKET_TYPE);
        let out = adapter
            .update("acme-logs", &spec, &test_credential())
            .await
            .unwrap();
        assert_eq!(out["tags"], json!({}));
    }
}
