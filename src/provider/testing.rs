//! In-memory provider used by unit tests.

#![allow(dead_code)]

use async_trait::async_trait;
use serde_json::json;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use super::adapter::{Created, ProviderAdapter};
use crate::config::{PropertyMap, ResourceSpec};
use crate::credentials::FederatedCredential;
use crate::error::{ProviderError, Result};

#[derive(Default)]
struct Inner {
    live: BTreeMap<String, PropertyMap>,
    names: HashMap<String, String>,
    calls: Vec<String>,
    failing: HashSet<String>,
    failing_creates: HashSet<String>,
    next_id: u64,
    in_flight: usize,
    max_in_flight: usize,
}

/// Records every call and keeps "live" resources in memory.
#[derive(Clone, Default)]
pub struct FakeProvider {
    inner: Arc<Mutex<Inner>>,
    delay: Duration,
}

impl FakeProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Makes every mutating call for `name` fail.
    pub fn fail_on(&self, name: &str) {
        self.lock().failing.insert(name.to_string());
    }

    /// Makes only `create` calls for `name` fail.
    pub fn fail_create_on(&self, name: &str) {
        self.lock().failing_creates.insert(name.to_string());
    }

    pub fn calls(&self) -> Vec<String> {
        self.lock().calls.clone()
    }

    pub fn clear_calls(&self) {
        self.lock().calls.clear();
    }

    pub fn live_count(&self) -> usize {
        self.lock().live.len()
    }

    /// Deletes a live resource behind the engine's back.
    pub fn vanish(&self, provider_id: &str) {
        self.lock().live.remove(provider_id);
    }

    /// Changes a live property behind the engine's back.
    pub fn tamper(&self, provider_id: &str, key: &str, value: serde_json::Value) {
        if let Some(live) = self.lock().live.get_mut(provider_id) {
            live.insert(key.to_string(), value);
        }
    }

    pub fn max_in_flight(&self) -> usize {
        self.lock().max_in_flight
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().expect("fake provider mutex poisoned")
    }

    async fn enter(&self, call: String, name: &str) -> Result<()> {
        {
            let mut inner = self.lock();
            inner.calls.push(call.clone());
            inner.in_flight += 1;
            inner.max_in_flight = inner.max_in_flight.max(inner.in_flight);
        }
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        let mut inner = self.lock();
        inner.in_flight -= 1;
        if inner.failing.contains(name) {
            return Err(ProviderError::failed("fake", call, "injected failure").into());
        }
        Ok(())
    }

    fn name_of(&self, provider_id: &str) -> String {
        self.lock()
            .names
            .get(provider_id)
            .cloned()
            .unwrap_or_else(|| provider_id.to_string())
    }
}

#[async_trait]
impl ProviderAdapter for FakeProvider {
    async fn create(&self, spec: &ResourceSpec, _cred: &FederatedCredential) -> Result<Created> {
        self.enter(format!("create {}", spec.name), &spec.name).await?;
        let mut inner = self.lock();
        if inner.failing_creates.contains(&spec.name) {
            return Err(ProviderError::failed("fake", "create", "injected failure").into());
        }
        inner.next_id += 1;
        let provider_id = format!("{}-{}", spec.name, inner.next_id);
        let mut outputs = spec.properties.clone();
        outputs.insert("id".to_string(), json!(provider_id));
        inner.live.insert(provider_id.clone(), outputs.clone());
        inner.names.insert(provider_id.clone(), spec.name.clone());
        Ok(Created {
            provider_id,
            outputs,
        })
    }

    async fn read(
        &self,
        provider_id: &str,
        _cred: &FederatedCredential,
    ) -> Result<Option<PropertyMap>> {
        let name = self.name_of(provider_id);
        self.lock().calls.push(format!("read {name}"));
        Ok(self.lock().live.get(provider_id).cloned())
    }

    async fn update(
        &self,
        provider_id: &str,
        spec: &ResourceSpec,
        _cred: &FederatedCredential,
    ) -> Result<PropertyMap> {
        self.enter(format!("update {}", spec.name), &spec.name).await?;
        let mut outputs = spec.properties.clone();
        outputs.insert("id".to_string(), json!(provider_id));
        self.lock()
            .live
            .insert(provider_id.to_string(), outputs.clone());
        Ok(outputs)
    }

    async fn delete(&self, provider_id: &str, _cred: &FederatedCredential) -> Result<()> {
        let name = self.name_of(provider_id);
        self.enter(format!("delete {name}"), &name).await?;
        self.lock().live.remove(provider_id);
        Ok(())
    }
}

/// A credential good for an hour.
pub fn test_credential() -> FederatedCredential {
    FederatedCredential {
        access_key_id: "ASIATEST".to_string(),
        secret_access_key: "secret".to_string(),
        session_token: "session".to_string(),
        expires_at: chrono::Utc::now() + chrono::Duration::hours(1),
        scope: crate::credentials::CredentialScope {
            account: Some("123456789012".to_string()),
            region: "ap-south-1".to_string(),
            role_arn: "arn:aws:iam::123456789012:role/test".to_string(),
        },
    }
}
