//! Federated credentials.
//!
//! - [`token`]: identity tokens and where they come from
//! - [`exchange`]: the trust exchange that turns a token into credentials
//! - [`broker`]: caching and refresh across a long-running pass

pub mod broker;
pub mod exchange;
pub mod token;

pub use broker::{BrokerSettings, CredentialBroker, CredentialProvider};
pub use exchange::{CredentialScope, FederatedCredential, StsTrustExchange, TrustExchange, TrustParams};
pub use token::{
    EnvTokenSource, FileTokenSource, IdentityToken, StaticTokenSource, TokenOrigin, TokenSource,
    source_from_config,
};
