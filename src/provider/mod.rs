//! Provider registry and resource adapters.
//!
//! The engine only knows the [`ProviderAdapter`] contract. Concrete resource
//! types register themselves in a [`ProviderRegistry`] under a type name.

mod adapter;
mod bucket;
mod registry;

#[cfg(test)]
pub(crate) mod testing;

pub use adapter::{Created, ProviderAdapter};
pub use bucket::{BUCKET_TYPE, BucketAdapter};
pub use registry::ProviderRegistry;
