//! Built-in providers
//!
//! Every provider here reads local state only (process environment, CLI
//! input, files next to the document, the document itself), which is what
//! makes them usable during the bootstrap phase.

use async_trait::async_trait;
use indexmap::IndexMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::provider::{Provider, ProviderRegistry, ResolutionContext, Resolver};
use crate::value::{ConfigPath, Value};

/// Register env, opt, file, self, param, strToBool and sls
pub fn register_builtins(registry: &mut ProviderRegistry) {
    registry.register(Provider::new("env").with_default_fn(env_resolver));
    registry.register(Provider::new("opt").with_default_fn(opt_resolver));
    registry.register(Provider::new("file").with_default(Arc::new(FileResolver)));
    registry.register(Provider::new("self").with_default_fn(self_resolver));
    registry.register(Provider::new("param").with_default_fn(param_resolver));
    registry.register(Provider::new("strToBool").with_default_fn(str_to_bool_resolver));
    registry.register(Provider::new("sls").with_default_fn(sls_resolver));
}

/// Built-in environment variable resolver
///
/// Usage:
///   ${env:VAR_NAME}              - value of VAR_NAME, missing if unset
///   ${env:VAR_NAME, "fallback"}  - fallback handled by the scheduler
fn env_resolver(key: &str, _params: &[Value], _ctx: &ResolutionContext) -> Result<Option<Value>> {
    if key.is_empty() {
        return Err(Error::configuration("env resolver requires a variable name"));
    }
    Ok(std::env::var(key).ok().map(Value::String))
}

/// CLI option resolver; an empty key returns every option
fn opt_resolver(key: &str, _params: &[Value], ctx: &ResolutionContext) -> Result<Option<Value>> {
    let options = &ctx.invocation.cli_options;
    if key.is_empty() {
        return Ok(Some(Value::Mapping(options.clone())));
    }
    Ok(options.get(key).cloned())
}

/// Same-document reference; an empty key returns the whole document
fn self_resolver(key: &str, _params: &[Value], ctx: &ResolutionContext) -> Result<Option<Value>> {
    let path = ConfigPath::parse(key)?;
    Ok(ctx.document.get(&path))
}

/// Invocation parameter resolver
fn param_resolver(key: &str, _params: &[Value], ctx: &ResolutionContext) -> Result<Option<Value>> {
    if key.is_empty() {
        return Err(Error::configuration("param resolver requires a parameter name"));
    }
    let params = ctx
        .document
        .with(|root| collect_params(root, ctx.stage_or_default(), &ctx.invocation.cli_params));
    Ok(params.get(key).cloned())
}

/// Merge parameters from every source, later sources winning:
/// `params.default`, `params.<stage>`, `stages.default.params`,
/// `stages.<stage>.params`, then CLI parameters.
pub fn collect_params(
    root: &Value,
    stage: &str,
    cli_params: &IndexMap<String, Value>,
) -> IndexMap<String, Value> {
    let sources = [
        ConfigPath::root().child("params").child("default"),
        ConfigPath::root().child("params").child(stage),
        ConfigPath::root().child("stages").child("default").child("params"),
        ConfigPath::root().child("stages").child(stage).child("params"),
    ];

    let mut merged = IndexMap::new();
    for source in &sources {
        if let Some(Value::Mapping(map)) = root.get(source) {
            for (k, v) in map {
                merged.insert(k.clone(), v.clone());
            }
        }
    }
    for (k, v) in cli_params {
        merged.insert(k.clone(), v.clone());
    }
    merged
}

/// Parse "true"/"false"/"1"/"0" into a boolean
fn str_to_bool_resolver(key: &str, params: &[Value], _ctx: &ResolutionContext) -> Result<Option<Value>> {
    let input = match params.first() {
        Some(Value::Bool(b)) => return Ok(Some(Value::Bool(*b))),
        Some(Value::Integer(i)) if *i == 0 || *i == 1 => return Ok(Some(Value::Bool(*i == 1))),
        Some(v) => v.as_template_text().unwrap_or_default(),
        None => key.to_string(),
    };

    match input.trim() {
        "true" | "1" => Ok(Some(Value::Bool(true))),
        "false" | "0" => Ok(Some(Value::Bool(false))),
        other => Err(Error::configuration(format!(
            "Unexpected strToBool input '{}'; expected either \"true\", \"false\", \"0\", or \"1\"",
            other
        ))),
    }
}

/// Framework values; only `stage` is known
fn sls_resolver(key: &str, _params: &[Value], ctx: &ResolutionContext) -> Result<Option<Value>> {
    match key {
        "stage" => Ok(Some(Value::String(ctx.stage_or_default().to_string()))),
        other => Err(Error::configuration(format!(
            "sls resolver does not support '{}'",
            other
        ))),
    }
}

/// Built-in file resolver
///
/// Usage:
///   ${file(./config.yml)}          - whole file
///   ${file(./config.yml):db.host}  - one property of a parsed file
///   ${file:./config.json#db.host}  - same, address form
///
/// `.json`, `.yml` and `.yaml` files are parsed; anything else is text.
/// A missing file or property counts as "no value".
struct FileResolver;

impl FileResolver {
    fn target(key: &str, params: &[Value]) -> Result<(String, String)> {
        match params.first() {
            Some(p) => {
                let file = p.as_template_text().ok_or_else(|| {
                    Error::configuration(format!(
                        "file path must be a string, got {}",
                        p.type_name()
                    ))
                })?;
                Ok((file, key.to_string()))
            }
            None => match key.split_once('#') {
                Some((file, prop)) => Ok((file.to_string(), prop.to_string())),
                None => Ok((key.to_string(), String::new())),
            },
        }
    }

    fn full_path(file: &str, base: Option<&Path>) -> PathBuf {
        let path = PathBuf::from(file);
        match base {
            Some(base) if path.is_relative() => base.join(path),
            _ => path,
        }
    }

    fn parse(path: &Path, content: String) -> Result<Value> {
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_ascii_lowercase());
        match ext.as_deref() {
            Some("json") => serde_json::from_str(&content).map_err(|e| {
                Error::parse(format!("Invalid JSON in {}: {}", path.display(), e))
            }),
            Some("yml") | Some("yaml") => serde_yaml::from_str(&content).map_err(|e| {
                Error::parse(format!("Invalid YAML in {}: {}", path.display(), e))
            }),
            _ => Ok(Value::String(content)),
        }
    }
}

#[async_trait]
impl Resolver for FileResolver {
    async fn resolve(&self, key: &str, params: &[Value], ctx: &ResolutionContext) -> Result<Option<Value>> {
        let (file, prop) = Self::target(key, params)?;
        if file.trim().is_empty() {
            return Err(Error::configuration("file resolver requires a file path"));
        }

        let path = Self::full_path(file.trim(), ctx.invocation.base_path.as_deref());
        let content = match tokio::fs::read_to_string(&path).await {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                log::debug!("File {} not found", path.display());
                return Ok(None);
            }
            Err(e) => return Err(Error::io(path.display().to_string(), e.to_string())),
        };

        let parsed = Self::parse(&path, content)?;
        if prop.is_empty() {
            return Ok(Some(parsed));
        }
        let prop_path = ConfigPath::parse(&prop)?;
        Ok(parsed.get(&prop_path).cloned())
    }
}
