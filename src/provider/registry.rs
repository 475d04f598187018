//! Maps resource type names to their adapters.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tracing::debug;

use super::adapter::ProviderAdapter;
use crate::error::{ProviderError, Result};

/// Registry of type name to adapter.
#[derive(Clone, Default)]
pub struct ProviderRegistry {
    adapters: HashMap<String, Arc<dyn ProviderAdapter>>,
}

impl ProviderRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers an adapter, replacing any previous one for the type.
    pub fn register(&mut self, type_name: impl Into<String>, adapter: Arc<dyn ProviderAdapter>) {
        let type_name = type_name.into();
        debug!("Registering provider for type '{type_name}'");
        self.adapters.insert(type_name, adapter);
    }

    /// Builder-style [`register`](Self::register).
    #[must_use]
    pub fn with(mut self, type_name: impl Into<String>, adapter: Arc<dyn ProviderAdapter>) -> Self {
        self.register(type_name, adapter);
        self
    }

    /// Resolves the adapter for a type.
    ///
    /// # Errors
    ///
    /// Returns `UnknownType` if nothing is registered under the name.
    pub fn resolve(&self, type_name: &str) -> Result<Arc<dyn ProviderAdapter>> {
        self.adapters.get(type_name).cloned().ok_or_else(|| {
            ProviderError::UnknownType {
                type_name: type_name.to_string(),
            }
            .into()
        })
    }

    /// Returns true if a type is registered.
    #[must_use]
    pub fn contains(&self, type_name: &str) -> bool {
        self.adapters.contains_key(type_name)
    }

    /// Registered type names, sorted.
    #[must_use]
    pub fn type_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.adapters.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

impl fmt::Debug for ProviderRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProviderRegistry")
            .field("types", &self.type_names())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{ErrorKind, WardenError};
    use crate::provider::testing::FakeProvider;

    #[test]
    fn test_resolve_registered() {
        let registry = ProviderRegistry::new()
            .with("bucket", Arc::new(FakeProvider::new()))
            .with("role", Arc::new(FakeProvider::new()));
        assert!(registry.resolve("bucket").is_ok());
        assert!(registry.contains("role"));
        assert_eq!(registry.type_names(), vec!["bucket", "role"]);
    }

    #[test]
    fn test_resolve_unknown() {
        let registry = ProviderRegistry::new();
        let Err(err) = registry.resolve("queue") else {
            panic!("expected an error");
        };
        assert_eq!(err.kind(), ErrorKind::Provider);
        assert!(matches!(
            err,
            WardenError::Provider(ProviderError::UnknownType { ref type_name }) if type_name == "queue"
        ));
    }
}
