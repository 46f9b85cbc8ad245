//! vargraph-core: placeholder resolution engine for deployment configuration
//!
//! This crate finds `${provider(params):type:key, fallback}` placeholders in a
//! configuration document, orders them by their dependencies, and resolves
//! them concurrently through named providers.
//!
//! # Example
//!
//! ```rust
//! use vargraph_core::{ManagerOptions, ResolverManager, Value};
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> vargraph_core::Result<()> {
//! let yaml = r#"
//! provider:
//!   stage: prod
//! service: api-${sls:stage}
//! "#;
//!
//! let mut manager = ResolverManager::from_yaml(yaml, ManagerOptions::default())?;
//! manager.resolve_config_file().await?;
//! assert_eq!(manager.get("service")?, Value::from("api-prod"));
//! # Ok(())
//! # }
//! ```

pub mod builtin;
pub mod document;
pub mod error;
pub mod expression;
pub mod graph;
pub mod provider;
pub mod scheduler;
pub mod value;

mod manager;

#[cfg(test)]
mod testing;

pub use document::Document;
pub use error::{Error, ErrorKind, ResolverErrorKind, Result};
pub use expression::{parse_placeholder, parse_scalar, Placeholder};
pub use graph::DependencyGraph;
pub use manager::{ManagerOptions, ResolverManager, DEFAULT_STAGE};
pub use provider::{
    FnResolver, PluginLoader, Provider, ProviderFactory, ProviderRegistry, ProviderView,
    ResolutionContext, Resolver, BOOTSTRAP_PROVIDERS, DEFAULT_CREDENTIAL_RESOLVER,
};
pub use scheduler::{Replacement, ResolveOptions};
pub use value::{ConfigPath, Opaque, Value};
