//! Provider and resolver architecture
//!
//! A provider is a named source of values (`env`, `self`, a secrets store
//! account, ...). Each provider owns one or more resolvers keyed by resolver
//! type, one of which may be its default. Placeholders pick a provider by
//! name and a resolver by type:
//!
//! - `${vault:secret:db/password}` runs resolver `secret` of provider `vault`
//! - `${vault:db/password}` runs resolver `db/password` if it exists, else
//!   the provider's default resolver
//!
//! The registry exposes providers through a [`ProviderView`]: the bootstrap
//! view holds only local, side-effect-free providers so the stage and
//! credentials can be worked out before anything remote is contacted.

use async_trait::async_trait;
use indexmap::IndexMap;
use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use crate::document::Document;
use crate::error::{Error, Result};
use crate::value::{ConfigPath, Value};

/// Providers usable before the stage and credentials are known
pub const BOOTSTRAP_PROVIDERS: &[&str] = &["env", "opt", "file", "self", "param", "strToBool", "sls"];

/// Credential resolver used when the document selects none
pub const DEFAULT_CREDENTIAL_RESOLVER: &str = "default-aws-credential-resolver";

/// Name of the resolver a provider falls back to when none was registered
/// under an explicit default
pub const DEFAULT_RESOLVER: &str = "default";

/// Which providers a resolution run may use
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderView {
    /// Only [`BOOTSTRAP_PROVIDERS`]
    Bootstrap,
    /// Every global provider plus those declared for the current stage
    Full,
}

/// Values shared by every resolution in one engine instance
#[derive(Debug, Clone, Default)]
pub struct Invocation {
    /// CLI options served by `opt`
    pub cli_options: IndexMap<String, Value>,
    /// CLI `key=value` parameters served by `param`
    pub cli_params: IndexMap<String, Value>,
    /// Base directory for relative file references
    pub base_path: Option<PathBuf>,
}

/// Context provided to resolvers during resolution
#[derive(Debug, Clone)]
pub struct ResolutionContext {
    /// The path in the document where this resolution is happening
    pub path: ConfigPath,
    /// The live document (for self-references)
    pub document: Document,
    /// Resolved stage, once known
    pub stage: Option<String>,
    /// Name of the provider `aws` references are routed to
    pub credential_resolver: Option<String>,
    /// CLI inputs and file base path
    pub invocation: Arc<Invocation>,
}

impl ResolutionContext {
    /// Create a new resolution context over `document`
    pub fn new(document: Document) -> Self {
        Self {
            path: ConfigPath::root(),
            document,
            stage: None,
            credential_resolver: None,
            invocation: Arc::new(Invocation::default()),
        }
    }

    /// Set the path being resolved
    pub fn with_path(mut self, path: ConfigPath) -> Self {
        self.path = path;
        self
    }

    /// Set the resolved stage
    pub fn with_stage(mut self, stage: impl Into<String>) -> Self {
        self.stage = Some(stage.into());
        self
    }

    /// Set the credential resolver name
    pub fn with_credential_resolver(mut self, name: impl Into<String>) -> Self {
        self.credential_resolver = Some(name.into());
        self
    }

    /// Set CLI inputs and base path
    pub fn with_invocation(mut self, invocation: Arc<Invocation>) -> Self {
        self.invocation = invocation;
        self
    }

    /// Stage or the `dev` default
    pub fn stage_or_default(&self) -> &str {
        self.stage.as_deref().unwrap_or("dev")
    }
}

/// Trait for resolver implementations
///
/// `Ok(None)` means "no value here" and moves resolution on to the next
/// fallback; `Err` aborts the resolution run.
#[async_trait]
pub trait Resolver: Send + Sync {
    /// Resolve `key` with the placeholder's (already resolved) parameters
    async fn resolve(
        &self,
        key: &str,
        params: &[Value],
        ctx: &ResolutionContext,
    ) -> Result<Option<Value>>;
}

/// A simple function-based resolver
pub struct FnResolver<F>
where
    F: Fn(&str, &[Value], &ResolutionContext) -> Result<Option<Value>> + Send + Sync,
{
    func: F,
}

impl<F> FnResolver<F>
where
    F: Fn(&str, &[Value], &ResolutionContext) -> Result<Option<Value>> + Send + Sync,
{
    /// Create a new function-based resolver
    pub fn new(func: F) -> Self {
        Self { func }
    }
}

#[async_trait]
impl<F> Resolver for FnResolver<F>
where
    F: Fn(&str, &[Value], &ResolutionContext) -> Result<Option<Value>> + Send + Sync,
{
    async fn resolve(
        &self,
        key: &str,
        params: &[Value],
        ctx: &ResolutionContext,
    ) -> Result<Option<Value>> {
        (self.func)(key, params, ctx)
    }
}

/// A named set of resolvers
#[derive(Clone)]
pub struct Provider {
    name: String,
    kind: String,
    default_resolver: String,
    resolvers: HashMap<String, Arc<dyn Resolver>>,
}

impl fmt::Debug for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut types: Vec<&String> = self.resolvers.keys().collect();
        types.sort();
        f.debug_struct("Provider")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("default_resolver", &self.default_resolver)
            .field("resolvers", &types)
            .finish()
    }
}

impl Provider {
    /// Create a provider whose kind equals its name
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            kind: name.clone(),
            name,
            default_resolver: DEFAULT_RESOLVER.to_string(),
            resolvers: HashMap::new(),
        }
    }

    /// Set the provider kind (the declaration `type` for stage providers)
    pub fn with_kind(mut self, kind: impl Into<String>) -> Self {
        self.kind = kind.into();
        self
    }

    /// Register a resolver under `resolver_type`
    pub fn with_resolver(mut self, resolver_type: impl Into<String>, resolver: Arc<dyn Resolver>) -> Self {
        self.resolvers.insert(resolver_type.into(), resolver);
        self
    }

    /// Register the default resolver
    pub fn with_default(self, resolver: Arc<dyn Resolver>) -> Self {
        let name = self.default_resolver.clone();
        self.with_resolver(name, resolver)
    }

    /// Register a function as the default resolver
    pub fn with_default_fn<F>(self, func: F) -> Self
    where
        F: Fn(&str, &[Value], &ResolutionContext) -> Result<Option<Value>> + Send + Sync + 'static,
    {
        self.with_default(Arc::new(FnResolver::new(func)))
    }

    /// Register a function as a typed resolver
    pub fn with_fn<F>(self, resolver_type: impl Into<String>, func: F) -> Self
    where
        F: Fn(&str, &[Value], &ResolutionContext) -> Result<Option<Value>> + Send + Sync + 'static,
    {
        self.with_resolver(resolver_type, Arc::new(FnResolver::new(func)))
    }

    /// Rename the resolver type used when a placeholder names none
    pub fn with_default_resolver_name(mut self, resolver_type: impl Into<String>) -> Self {
        self.default_resolver = resolver_type.into();
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> &str {
        &self.kind
    }

    /// Pick the resolver for a reference.
    ///
    /// Without an explicit type, a resolver registered under the key itself
    /// wins over the default one. Returns the resolver and its type.
    pub fn resolver(&self, resolver_type: Option<&str>, key: &str) -> Result<(Arc<dyn Resolver>, String)> {
        let wanted = match resolver_type {
            Some(t) => t,
            None => {
                if let Some(r) = self.resolvers.get(key) {
                    return Ok((Arc::clone(r), key.to_string()));
                }
                self.default_resolver.as_str()
            }
        };
        self.resolvers
            .get(wanted)
            .map(|r| (Arc::clone(r), wanted.to_string()))
            .ok_or_else(|| Error::resolver_not_found(&self.kind, wanted))
    }
}

/// Instantiates stage-declared providers from their `type`
#[async_trait]
pub trait ProviderFactory: Send + Sync {
    /// Build provider `name` from its resolved declaration mapping
    async fn create(&self, name: &str, declaration: &Value, ctx: &ResolutionContext) -> Result<Provider>;
}

/// Turns a `plugins` entry into the providers it contributes
#[async_trait]
pub trait PluginLoader: Send + Sync {
    async fn load(&self, plugin: &str, ctx: &ResolutionContext) -> Result<Vec<Provider>>;
}

/// Registry of available providers
#[derive(Clone, Default)]
pub struct ProviderRegistry {
    global: IndexMap<String, Arc<Provider>>,
    staged: HashMap<String, IndexMap<String, Arc<Provider>>>,
}

impl fmt::Debug for ProviderRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProviderRegistry")
            .field("global", &self.global.keys().collect::<Vec<_>>())
            .field("staged", &self.staged.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl ProviderRegistry {
    /// Create a new empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a registry with the built-in bootstrap providers
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        crate::builtin::register_builtins(&mut registry);
        registry
    }

    /// Register a global provider, replacing one of the same name
    pub fn register(&mut self, provider: Provider) {
        log::debug!("Registering provider '{}' ({})", provider.name(), provider.kind());
        self.global.insert(provider.name().to_string(), Arc::new(provider));
    }

    /// Register a provider visible only while `stage` is the active stage
    pub fn register_for_stage(&mut self, stage: impl Into<String>, provider: Provider) {
        let stage = stage.into();
        if self.global.contains_key(provider.name()) {
            log::warn!(
                "Provider '{}' declared for stage '{}' shadows a global provider",
                provider.name(),
                stage
            );
        }
        log::debug!("Registering provider '{}' for stage '{}'", provider.name(), stage);
        self.staged
            .entry(stage)
            .or_default()
            .insert(provider.name().to_string(), Arc::new(provider));
    }

    /// Get a global provider by name
    pub fn get(&self, name: &str) -> Option<&Arc<Provider>> {
        self.global.get(name)
    }

    /// Providers declared for one stage, in declaration order
    pub fn providers_for_stage(&self, stage: &str) -> Vec<Arc<Provider>> {
        self.staged
            .get(stage)
            .map(|m| m.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Global provider names, in registration order
    pub fn names(&self) -> Vec<String> {
        self.global.keys().cloned().collect()
    }

    /// Look a provider up through a view
    pub fn lookup(&self, name: &str, view: ProviderView, stage: Option<&str>) -> Result<Arc<Provider>> {
        let found = match view {
            ProviderView::Bootstrap => {
                if BOOTSTRAP_PROVIDERS.contains(&name) {
                    self.global.get(name)
                } else {
                    None
                }
            }
            ProviderView::Full => stage
                .and_then(|s| self.staged.get(s))
                .and_then(|m| m.get(name))
                .or_else(|| self.global.get(name)),
        };
        found.cloned().ok_or_else(|| Error::provider_not_found(name))
    }

    /// True when `name` can be looked up through the view
    pub fn is_visible(&self, name: &str, view: ProviderView, stage: Option<&str>) -> bool {
        self.lookup(name, view, stage).is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn echo(tag: &'static str) -> Arc<dyn Resolver> {
        Arc::new(FnResolver::new(move |key: &str, _: &[Value], _: &ResolutionContext| {
            Ok(Some(Value::String(format!("{}:{}", tag, key))))
        }))
    }

    fn ctx() -> ResolutionContext {
        ResolutionContext::new(Document::default())
    }

    #[tokio::test]
    async fn test_explicit_type() {
        let provider = Provider::new("vault").with_resolver("secret", echo("secret"));
        let (resolver, ty) = provider.resolver(Some("secret"), "db").unwrap();
        assert_eq!(ty, "secret");
        assert_eq!(
            resolver.resolve("db", &[], &ctx()).await.unwrap(),
            Some(Value::from("secret:db"))
        );
    }

    #[tokio::test]
    async fn test_key_named_resolver_wins_over_default() {
        let provider = Provider::new("acct")
            .with_default(echo("default"))
            .with_resolver("myFile", echo("file"));

        let (resolver, ty) = provider.resolver(None, "myFile").unwrap();
        assert_eq!(ty, "myFile");
        assert_eq!(
            resolver.resolve("myFile", &[], &ctx()).await.unwrap(),
            Some(Value::from("file:myFile"))
        );

        let (_, ty) = provider.resolver(None, "path/to/param").unwrap();
        assert_eq!(ty, "default");
    }

    #[test]
    fn test_missing_resolver_names_type_and_kind() {
        let provider = Provider::new("acct").with_kind("aws");
        let err = provider.resolver(Some("ssm"), "x").err().unwrap();
        assert_eq!(err.to_string(), "ssm resolver of provider aws not found");

        let err = provider.resolver(None, "x").err().unwrap();
        assert_eq!(err.to_string(), "default resolver of provider aws not found");
    }

    #[test]
    fn test_custom_default_resolver_name() {
        let provider = Provider::new("acct")
            .with_default_resolver_name("ssm")
            .with_resolver("ssm", echo("ssm"));
        assert_eq!(provider.resolver(None, "/a/b").unwrap().1, "ssm");
    }

    #[test]
    fn test_bootstrap_view_hides_remote_providers() {
        let mut registry = ProviderRegistry::with_builtins();
        registry.register(Provider::new("vault").with_default(echo("v")));

        assert!(registry.is_visible("env", ProviderView::Bootstrap, None));
        assert!(registry.is_visible("self", ProviderView::Bootstrap, None));
        assert!(!registry.is_visible("vault", ProviderView::Bootstrap, None));
        assert!(registry.is_visible("vault", ProviderView::Full, None));

        let err = registry.lookup("vault", ProviderView::Bootstrap, None).unwrap_err();
        assert!(err.is_lookup_failure());
    }

    #[test]
    fn test_stage_scoped_providers() {
        let mut registry = ProviderRegistry::new();
        registry.register_for_stage("prod", Provider::new("prodAccount").with_kind("aws"));
        registry.register_for_stage("dev", Provider::new("devAccount").with_kind("aws"));

        let prod: Vec<String> = registry
            .providers_for_stage("prod")
            .iter()
            .map(|p| p.name().to_string())
            .collect();
        assert_eq!(prod, vec!["prodAccount"]);
        assert!(registry.providers_for_stage("staging").is_empty());

        assert!(registry.is_visible("prodAccount", ProviderView::Full, Some("prod")));
        assert!(!registry.is_visible("prodAccount", ProviderView::Full, Some("dev")));
        assert!(!registry.is_visible("prodAccount", ProviderView::Bootstrap, Some("prod")));
    }

    #[test]
    fn test_stage_provider_shadows_global() {
        let mut registry = ProviderRegistry::new();
        registry.register(Provider::new("acct").with_kind("global"));
        registry.register_for_stage("dev", Provider::new("acct").with_kind("staged"));

        assert_eq!(registry.lookup("acct", ProviderView::Full, Some("dev")).unwrap().kind(), "staged");
        assert_eq!(registry.lookup("acct", ProviderView::Full, Some("prod")).unwrap().kind(), "global");
    }

    #[test]
    fn test_register_replaces() {
        let mut registry = ProviderRegistry::new();
        registry.register(Provider::new("custom").with_kind("one"));
        registry.register(Provider::new("custom").with_kind("two"));
        assert_eq!(registry.get("custom").unwrap().kind(), "two");
        assert_eq!(registry.names(), vec!["custom"]);
    }
}
