//! The CRUD contract every resource type implements.

use async_trait::async_trait;

use crate::config::{PropertyMap, ResourceSpec};
use crate::credentials::FederatedCredential;
use crate::error::Result;

/// What a successful create reports back.
#[derive(Debug, Clone, PartialEq)]
pub struct Created {
    /// Identifier assigned by the provider.
    pub provider_id: String,
    /// Live property values after creation.
    pub outputs: PropertyMap,
}

/// Create, read, update and delete for one resource type.
///
/// Every call receives the federated credential of the current pass; an
/// adapter never obtains credentials on its own.
#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    /// Creates the resource.
    async fn create(&self, spec: &ResourceSpec, cred: &FederatedCredential) -> Result<Created>;

    /// Reads live properties. `Ok(None)` means the resource no longer exists
    /// and must be recreated.
    async fn read(
        &self,
        provider_id: &str,
        cred: &FederatedCredential,
    ) -> Result<Option<PropertyMap>>;

    /// Applies a changed spec in place.
    async fn update(
        &self,
        provider_id: &str,
        spec: &ResourceSpec,
        cred: &FederatedCredential,
    ) -> Result<PropertyMap>;

    /// Deletes the resource. Deleting something already gone succeeds.
    async fn delete(&self, provider_id: &str, cred: &FederatedCredential) -> Result<()>;
}
