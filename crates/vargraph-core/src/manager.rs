//! Resolver manager
//!
//! The entry point tying the pieces together: it owns the document, the
//! dependency graph and the provider registry, and runs the two resolution
//! phases. First a bootstrap phase limited to the local providers works out
//! stage, region and credentials. Then a full phase runs with every provider,
//! including the ones declared for the stage and those contributed by plugins.

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use indexmap::IndexMap;

use crate::builtin::collect_params;
use crate::document::Document;
use crate::error::{Error, Result};
use crate::expression::contains_placeholder;
use crate::graph::DependencyGraph;
use crate::provider::{
    Invocation, PluginLoader, Provider, ProviderFactory, ProviderRegistry, ProviderView,
    ResolutionContext, DEFAULT_CREDENTIAL_RESOLVER,
};
use crate::scheduler::{Replacement, ResolveOptions, Scheduler};
use crate::value::{ConfigPath, Value};

/// Stage used when neither the options nor the document name one
pub const DEFAULT_STAGE: &str = "dev";

/// Paths resolved during the bootstrap phase
const BOOTSTRAP_PATHS: &[&str] = &[
    "provider.stage",
    "org",
    "app",
    "service",
    "provider.region",
    "provider.profile",
    "provider.resolver",
    "plugins",
];

static TEMP_KEY_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Options for a manager instance
#[derive(Clone, Default)]
pub struct ManagerOptions {
    /// Stage given on the command line; wins over `provider.stage`
    pub stage: Option<String>,
    /// CLI options served by the `opt` provider
    pub cli_options: IndexMap<String, Value>,
    /// CLI parameters as `key=value`
    pub params: Vec<String>,
    /// Base path for relative file references
    pub base_path: Option<PathBuf>,
    /// Profile for the default credential provider
    pub aws_profile: Option<String>,
    /// Turns `plugins` entries into providers
    pub plugin_loader: Option<Arc<dyn PluginLoader>>,
}

impl fmt::Debug for ManagerOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ManagerOptions")
            .field("stage", &self.stage)
            .field("cli_options", &self.cli_options)
            .field("params", &self.params)
            .field("base_path", &self.base_path)
            .field("aws_profile", &self.aws_profile)
            .field("plugin_loader", &self.plugin_loader.is_some())
            .finish()
    }
}

/// Owns a document and resolves its placeholders
pub struct ResolverManager {
    document: Document,
    graph: Option<DependencyGraph>,
    registry: Arc<ProviderRegistry>,
    factories: HashMap<String, Arc<dyn ProviderFactory>>,
    options: ManagerOptions,
    invocation: Arc<Invocation>,
    stage: Option<String>,
    credential_resolver: Option<String>,
    bootstrapped: bool,
    replacements: Vec<Replacement>,
}

impl fmt::Debug for ResolverManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResolverManager")
            .field("stage", &self.stage)
            .field("credential_resolver", &self.credential_resolver)
            .field("registry", &self.registry)
            .field("factories", &self.factories.keys().collect::<Vec<_>>())
            .field("bootstrapped", &self.bootstrapped)
            .finish()
    }
}

impl ResolverManager {
    /// Create a manager over an already parsed document
    pub fn new(root: Value, options: ManagerOptions) -> Result<Self> {
        let mut cli_params = IndexMap::new();
        for param in &options.params {
            let (key, value) = param.split_once('=').ok_or_else(|| {
                Error::configuration(format!(
                    "Invalid parameter '{}': expected the form key=value",
                    param
                ))
            })?;
            cli_params.insert(key.trim().to_string(), Value::String(value.to_string()));
        }

        let invocation = Invocation {
            cli_options: options.cli_options.clone(),
            cli_params,
            base_path: options.base_path.clone(),
        };

        Ok(Self {
            document: Document::new(root),
            graph: None,
            registry: Arc::new(ProviderRegistry::with_builtins()),
            factories: HashMap::new(),
            stage: None,
            credential_resolver: None,
            bootstrapped: false,
            replacements: Vec::new(),
            invocation: Arc::new(invocation),
            options,
        })
    }

    /// Load a document from a YAML string
    pub fn from_yaml(yaml: &str, options: ManagerOptions) -> Result<Self> {
        let root: Value = serde_yaml::from_str(yaml)?;
        Self::new(root, options)
    }

    /// Load a document from a JSON string
    pub fn from_json(json: &str, options: ManagerOptions) -> Result<Self> {
        let root: Value = serde_json::from_str(json)?;
        Self::new(root, options)
    }

    /// Load a YAML file; relative file references resolve from its directory
    pub fn from_yaml_file(path: impl AsRef<Path>, mut options: ManagerOptions) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::io(path.display().to_string(), format!("Failed to read file: {}", e))
        })?;
        let root: Value = serde_yaml::from_str(&content).map_err(|e| {
            let mut err = Error::from(e);
            if let Some(loc) = err.source_location.as_mut() {
                loc.file = path.display().to_string();
            }
            err
        })?;

        if options.base_path.is_none() {
            options.base_path = path.parent().map(Path::to_path_buf);
        }
        Self::new(root, options)
    }

    /// (Re)build the dependency graph from the current document
    pub fn load_placeholders(&mut self) -> Result<&DependencyGraph> {
        let graph = self.document.with(DependencyGraph::build)?;
        log::debug!("Loaded {} placeholders", graph.len());
        Ok(self.graph.insert(graph))
    }

    fn graph_mut(&mut self) -> Result<&mut DependencyGraph> {
        if self.graph.is_none() {
            self.load_placeholders()?;
        }
        self.graph
            .as_mut()
            .ok_or_else(|| Error::internal("dependency graph missing after load"))
    }

    fn context(&self) -> ResolutionContext {
        let mut ctx = ResolutionContext::new(self.document.clone())
            .with_invocation(Arc::clone(&self.invocation));
        if let Some(stage) = &self.stage {
            ctx = ctx.with_stage(stage);
        }
        if let Some(name) = &self.credential_resolver {
            ctx = ctx.with_credential_resolver(name);
        }
        ctx
    }

    async fn run(
        &mut self,
        selection: Option<Vec<ConfigPath>>,
        view: ProviderView,
    ) -> Result<Vec<Replacement>> {
        let registry = Arc::clone(&self.registry);
        let ctx = self.context();
        let graph = self.graph_mut()?;
        Scheduler::new(graph, registry, ctx, view)
            .run(selection.as_deref())
            .await
    }

    /// Resolve placeholders and write the results into the document.
    ///
    /// Without `selected_paths` every remaining placeholder is resolved.
    /// A failed run leaves the document as it was before the call.
    pub async fn resolve_and_replace_placeholders_in_config(
        &mut self,
        options: ResolveOptions,
    ) -> Result<()> {
        let selection = options
            .selected_paths
            .map(|paths| {
                paths
                    .iter()
                    .map(|p| ConfigPath::parse(p))
                    .collect::<Result<Vec<_>>>()
            })
            .transpose()?;
        let done = self.run(selection, options.view).await?;
        self.replacements.extend(done);
        Ok(())
    }

    /// Resolve one ad hoc expression such as `env:HOME` or `ssm:/path, "x"`.
    ///
    /// The expression is placed in the document under a temporary key so it
    /// can depend on other values, and removed again afterwards.
    pub async fn resolve_variable(&mut self, expression: &str) -> Result<Value> {
        let key = format!(
            "resolveVariable_{}",
            TEMP_KEY_COUNTER.fetch_add(1, Ordering::Relaxed)
        );
        let path = ConfigPath::root().child(&key);
        let text = format!("${{{}}}", expression);

        // Load first so the temporary key is only added once below
        self.graph_mut()?;
        self.document.set(&path, Value::String(text.clone()))?;
        let result = self.resolve_temporary(&path, &text).await;

        self.document.remove(&path);
        if let Some(graph) = self.graph.as_mut() {
            graph.detach(&path);
        }
        result
    }

    async fn resolve_temporary(&mut self, path: &ConfigPath, text: &str) -> Result<Value> {
        let roots = self.graph_mut()?.add_scalar(path, text)?;
        if roots.is_empty() {
            return Err(Error::syntax(text, "no placeholder found"));
        }
        self.run(Some(vec![path.clone()]), ProviderView::Full).await?;
        self.document
            .get(path)
            .ok_or_else(|| Error::path_not_found(path.to_string()))
    }

    /// Register a global provider, replacing one of the same name
    pub fn add_resolver_provider(&mut self, provider: Provider) {
        Arc::make_mut(&mut self.registry).register(provider);
    }

    /// Global providers, in registration order
    pub fn get_resolver_providers(&self) -> Vec<Arc<Provider>> {
        self.registry
            .names()
            .iter()
            .filter_map(|name| self.registry.get(name).cloned())
            .collect()
    }

    /// Providers declared for `stage`
    pub fn get_stage_providers(&self, stage: &str) -> Vec<Arc<Provider>> {
        self.registry.providers_for_stage(stage)
    }

    /// Register the factory that builds stage-declared providers of `type_name`
    pub fn register_provider_factory(
        &mut self,
        type_name: impl Into<String>,
        factory: Arc<dyn ProviderFactory>,
    ) {
        self.factories.insert(type_name.into(), factory);
    }

    /// Pick the provider `aws` references are routed to.
    ///
    /// `provider.resolver` names it explicitly and may not be combined with
    /// `provider.profile`. Otherwise a single `type: aws` declaration in the
    /// `default` or current stage is used, and failing that the default
    /// credential provider.
    pub fn set_credential_resolver(&mut self) -> Result<String> {
        let profile = self.document_value("provider.profile")?;
        let resolver = self.document_value("provider.resolver")?;

        let name = match (profile, resolver) {
            (Some(_), Some(_)) => return Err(Error::credential_conflict()),
            (_, Some(Value::String(name))) => name,
            (_, Some(other)) => {
                return Err(Error::configuration(format!(
                    "provider.resolver must be a string, found {}",
                    other.type_name()
                ))
                .with_path("provider.resolver"))
            }
            (Some(_), None) => DEFAULT_CREDENTIAL_RESOLVER.to_string(),
            (None, None) => {
                let stage = self.stage_or_default().to_string();
                let mut declared: Vec<String> = self.get_aws_providers("default").into_keys().collect();
                if stage != "default" {
                    for name in self.get_aws_providers(&stage).into_keys() {
                        if !declared.contains(&name) {
                            declared.push(name);
                        }
                    }
                }
                match declared.len() {
                    0 => DEFAULT_CREDENTIAL_RESOLVER.to_string(),
                    1 => declared.remove(0),
                    _ => {
                        return Err(Error::configuration(format!(
                            "Multiple resolvers with type \"aws\" found ({})",
                            declared.join(", ")
                        ))
                        .with_path("provider.resolver")
                        .with_help(
                            "Specify the credential provider to use in the provider.resolver key",
                        ))
                    }
                }
            }
        };

        log::debug!("Using credential resolver '{}'", name);
        self.credential_resolver = Some(name.clone());
        Ok(name)
    }

    /// Value at `path`, treating null and empty strings as unset
    fn document_value(&self, path: &str) -> Result<Option<Value>> {
        let value = self.document.get(&ConfigPath::parse(path)?);
        Ok(value.filter(|v| match v {
            Value::Null => false,
            Value::String(s) => !s.is_empty(),
            _ => true,
        }))
    }

    /// Work out the stage: options first, then `provider.stage`, then `dev`.
    ///
    /// A placeholder in `provider.stage` is resolved with the bootstrap
    /// providers only.
    pub async fn resolve_stage(&mut self) -> Result<String> {
        if let Some(stage) = &self.stage {
            return Ok(stage.clone());
        }
        if let Some(stage) = self.options.stage.clone() {
            self.stage = Some(stage.clone());
            return Ok(stage);
        }

        let path = ConfigPath::parse("provider.stage")?;
        let stage = match self.document_value("provider.stage")? {
            None => DEFAULT_STAGE.to_string(),
            Some(Value::String(s)) if !contains_placeholder(&s) => s,
            Some(Value::String(_)) => {
                self.run(Some(vec![path.clone()]), ProviderView::Bootstrap)
                    .await?;
                match self.document.get(&path) {
                    Some(Value::String(s)) if !contains_placeholder(&s) => s,
                    Some(Value::String(s)) => {
                        return Err(Error::configuration(format!(
                            "Stage '{}' cannot be resolved before the stage is known",
                            s
                        ))
                        .with_path("provider.stage")
                        .with_help(
                            "Only env, opt, file, self, param, strToBool and sls can be used in provider.stage",
                        ))
                    }
                    other => return Err(non_string_stage(other.as_ref())),
                }
            }
            Some(other) => return Err(non_string_stage(Some(&other))),
        };

        log::debug!("Resolved stage '{}'", stage);
        self.stage = Some(stage.clone());
        Ok(stage)
    }

    /// Remove every `stages.<name>` section other than `default` and the
    /// current stage, detaching their placeholders from the graph.
    ///
    /// Returns the removed stage names.
    pub fn prune_unused_stages(&mut self) -> Result<Vec<String>> {
        let Some(stage) = self.stage.clone() else {
            return Ok(Vec::new());
        };
        let stages_path = ConfigPath::root().child("stages");
        let names: Vec<String> = match self.document.get(&stages_path) {
            Some(Value::Mapping(map)) => map.keys().cloned().collect(),
            _ => return Ok(Vec::new()),
        };

        let mut removed = Vec::new();
        for name in names {
            if name == "default" || name == stage {
                continue;
            }
            let path = stages_path.child(&name);
            self.document.remove(&path);
            if let Some(graph) = self.graph.as_mut() {
                graph.detach(&path);
            }
            removed.push(name);
        }
        if !removed.is_empty() {
            log::debug!("Pruned unused stages: {}", removed.join(", "));
        }
        Ok(removed)
    }

    /// Declarations of `type: aws` under `stages.<stage>.resolvers`
    pub fn get_aws_providers(&self, stage: &str) -> IndexMap<String, Value> {
        self.declarations(stage)
            .into_iter()
            .filter(|(_, decl)| {
                decl.as_mapping()
                    .and_then(|m| m.get("type"))
                    .and_then(Value::as_str)
                    == Some("aws")
            })
            .collect()
    }

    fn declarations(&self, stage: &str) -> IndexMap<String, Value> {
        let path = ConfigPath::root()
            .child("stages")
            .child(stage)
            .child("resolvers");
        match self.document.get(&path) {
            Some(Value::Mapping(map)) => map,
            _ => IndexMap::new(),
        }
    }

    /// Bootstrap phase: stage, identity, region and credentials from local
    /// providers only, then drop the other stages.
    pub async fn bootstrap(&mut self) -> Result<()> {
        self.resolve_stage().await?;
        let paths = BOOTSTRAP_PATHS
            .iter()
            .map(|p| ConfigPath::parse(p))
            .collect::<Result<Vec<_>>>()?;
        let done = self.run(Some(paths), ProviderView::Bootstrap).await?;
        self.replacements.extend(done);

        self.set_credential_resolver()?;
        self.prune_unused_stages()?;
        self.bootstrapped = true;
        Ok(())
    }

    /// Instantiate stage-declared providers, the default credential provider
    /// and plugin providers.
    pub async fn assemble_providers(&mut self) -> Result<()> {
        let stage = self.stage_or_default().to_string();
        let mut scopes = vec!["default".to_string()];
        if stage != "default" {
            scopes.push(stage.clone());
        }

        let sections = scopes
            .iter()
            .map(|s| ConfigPath::parse(&format!("stages.{}.resolvers", s)))
            .collect::<Result<Vec<_>>>()?;
        let done = self.run(Some(sections), ProviderView::Full).await?;
        self.replacements.extend(done);

        let ctx = self.context();
        // Current-stage declarations are registered last so they shadow `default`
        for scope in &scopes {
            for (name, declaration) in self.declarations(scope) {
                let provider = self.create_provider(&name, &declaration, &ctx).await?;
                Arc::make_mut(&mut self.registry).register_for_stage(&stage, provider);
            }
        }

        if self.credential_resolver.as_deref() == Some(DEFAULT_CREDENTIAL_RESOLVER)
            && self.registry.get(DEFAULT_CREDENTIAL_RESOLVER).is_none()
            && self.factories.contains_key("aws")
        {
            let profile = match &self.options.aws_profile {
                Some(p) => Some(Value::String(p.clone())),
                None => self.document_value("provider.profile")?,
            };
            let mut declaration = IndexMap::new();
            declaration.insert("type".to_string(), Value::from("aws"));
            declaration.insert("profile".to_string(), profile.unwrap_or(Value::Null));
            let provider = self
                .create_provider(DEFAULT_CREDENTIAL_RESOLVER, &Value::Mapping(declaration), &ctx)
                .await?;
            self.add_resolver_provider(provider);
        }

        self.load_plugins(&ctx).await
    }

    async fn create_provider(
        &self,
        name: &str,
        declaration: &Value,
        ctx: &ResolutionContext,
    ) -> Result<Provider> {
        let location = format!("stages.*.resolvers.{}", name);
        let type_name = declaration
            .as_mapping()
            .and_then(|m| m.get("type"))
            .and_then(Value::as_str)
            .ok_or_else(|| {
                Error::configuration(format!("Resolver '{}' has no 'type'", name))
                    .with_path(&location)
            })?;
        let factory = self.factories.get(type_name).ok_or_else(|| {
            Error::configuration(format!(
                "Unknown resolver type '{}' for resolver '{}'",
                type_name, name
            ))
            .with_path(&location)
        })?;
        let provider = factory.create(name, declaration, ctx).await?;
        Ok(provider.with_kind(type_name))
    }

    async fn load_plugins(&mut self, ctx: &ResolutionContext) -> Result<()> {
        let plugins: Vec<String> = match self.document.get(&ConfigPath::root().child("plugins")) {
            Some(Value::Sequence(items)) => items
                .iter()
                .filter_map(|v| v.as_str().map(str::to_string))
                .collect(),
            _ => return Ok(()),
        };
        let Some(loader) = self.options.plugin_loader.clone() else {
            if !plugins.is_empty() {
                log::debug!("No plugin loader configured; skipping {} plugins", plugins.len());
            }
            return Ok(());
        };

        for plugin in plugins {
            for provider in loader.load(&plugin, ctx).await? {
                log::debug!("Plugin '{}' contributes provider '{}'", plugin, provider.name());
                self.add_resolver_provider(provider);
            }
        }
        Ok(())
    }

    /// Resolve the whole document: bootstrap if needed, assemble providers,
    /// resolve the params sections, then everything else.
    ///
    /// Returns the merged params for the current stage.
    pub async fn resolve_config_file(&mut self) -> Result<IndexMap<String, Value>> {
        if !self.bootstrapped {
            self.bootstrap().await?;
        }
        self.assemble_providers().await?;

        let stage = self.stage_or_default().to_string();
        let params = vec![
            ConfigPath::root().child("params"),
            ConfigPath::root().child("stages").child("default").child("params"),
            ConfigPath::root().child("stages").child(&stage).child("params"),
        ];
        let done = self.run(Some(params), ProviderView::Full).await?;
        self.replacements.extend(done);

        self.resolve_and_replace_placeholders_in_config(ResolveOptions::all())
            .await?;
        Ok(self.params())
    }

    /// Params merged for the current stage, CLI params winning
    pub fn params(&self) -> IndexMap<String, Value> {
        self.document.with(|root| {
            collect_params(root, self.stage_or_default(), &self.invocation.cli_params)
        })
    }

    pub fn stage(&self) -> Option<&str> {
        self.stage.as_deref()
    }

    fn stage_or_default(&self) -> &str {
        self.stage.as_deref().unwrap_or(DEFAULT_STAGE)
    }

    pub fn credential_resolver(&self) -> Option<&str> {
        self.credential_resolver.as_deref()
    }

    /// Every substitution made so far, in completion order
    pub fn replacements(&self) -> &[Replacement] {
        &self.replacements
    }

    /// Snapshot of the document in its current state
    pub fn document(&self) -> Value {
        self.document.snapshot()
    }

    /// Read one value from the document
    pub fn get(&self, path: &str) -> Result<Value> {
        let path = ConfigPath::parse(path)?;
        self.document
            .get(&path)
            .ok_or_else(|| Error::path_not_found(path.to_string()))
    }

    pub fn to_yaml(&self) -> Result<String> {
        Ok(serde_yaml::to_string(&self.document.snapshot())?)
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(&self.document.snapshot())?)
    }
}

fn non_string_stage(value: Option<&Value>) -> Error {
    let found = value.map(Value::type_name).unwrap_or("nothing");
    Error::configuration(format!("provider.stage must resolve to a string, found {}", found))
        .with_path("provider.stage")
}
