//! Resolution scheduler
//!
//! Resolves the root nodes of a [`DependencyGraph`] as a topological
//! wave-front: every root whose dependencies are resolved is spawned on a
//! [`JoinSet`], and results are substituted back into the document on the
//! scheduler loop as they complete. Nested placeholders are resolved inline by
//! their root, one candidate at a time.
//!
//! A run is all-or-nothing: on the first failure the remaining tasks are
//! aborted and the document is restored to its state before the run.

use std::collections::HashSet;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use tokio::task::JoinSet;

use crate::error::{Error, ErrorKind, Result};
use crate::expression::{Candidate, Placeholder, Reference, Template, TemplatePart};
use crate::graph::{DependencyGraph, ExpressionNode, NodeId, NodeState};
use crate::provider::{Provider, ProviderRegistry, ProviderView, ResolutionContext};
use crate::value::{ConfigPath, PathSegment, Value};

type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// What a resolution run should cover
#[derive(Debug, Clone)]
pub struct ResolveOptions {
    /// Only these paths (plus their dependencies); `None` means everything
    pub selected_paths: Option<Vec<String>>,
    /// Providers the run may use
    pub view: ProviderView,
}

impl Default for ResolveOptions {
    fn default() -> Self {
        Self {
            selected_paths: None,
            view: ProviderView::Full,
        }
    }
}

impl ResolveOptions {
    /// Resolve every remaining placeholder
    pub fn all() -> Self {
        Self::default()
    }

    /// Resolve only `paths` and what they depend on
    pub fn paths<I, S>(paths: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            selected_paths: Some(paths.into_iter().map(Into::into).collect()),
            ..Self::default()
        }
    }

    /// Restrict the run to the bootstrap providers
    pub fn with_view(mut self, view: ProviderView) -> Self {
        self.view = view;
        self
    }
}

/// Record of one substituted placeholder
#[derive(Debug, Clone, PartialEq)]
pub struct Replacement {
    pub path: ConfigPath,
    pub original: String,
    pub resolved: Value,
    /// Provider that produced the value; `None` for a literal fallback
    pub provider: Option<String>,
    pub provider_kind: Option<String>,
    pub resolver_type: Option<String>,
    pub key: Option<String>,
}

/// A resolved value and where it came from
#[derive(Debug, Clone)]
struct Resolved {
    value: Value,
    source: Option<Source>,
}

#[derive(Debug, Clone)]
struct Source {
    provider: String,
    provider_kind: String,
    resolver_type: String,
    key: String,
}

/// Everything a resolution task needs, cheap to clone into a task
#[derive(Clone)]
struct Engine {
    registry: Arc<ProviderRegistry>,
    ctx: ResolutionContext,
    view: ProviderView,
}

impl Engine {
    /// Look up a provider, routing `aws` to the credential resolver unless a
    /// provider is literally named `aws`
    fn provider(&self, name: &str) -> Result<Arc<Provider>> {
        let stage = self.ctx.stage.as_deref();
        match self.registry.lookup(name, self.view, stage) {
            Ok(p) => Ok(p),
            Err(e) if name == "aws" => match &self.ctx.credential_resolver {
                Some(target) => self.registry.lookup(target, self.view, stage),
                None => Err(e),
            },
            Err(e) => Err(e),
        }
    }

    fn is_visible(&self, name: &str) -> bool {
        self.provider(name).is_ok()
    }

    fn resolve_placeholder<'a>(&'a self, placeholder: &'a Placeholder) -> BoxFuture<'a, Result<Resolved>> {
        Box::pin(async move {
            let last = placeholder.candidates.len().saturating_sub(1);
            for (idx, candidate) in placeholder.candidates.iter().enumerate() {
                let has_fallback = idx < last;
                match candidate {
                    Candidate::Literal(value) => {
                        return Ok(Resolved {
                            value: value.clone(),
                            source: None,
                        });
                    }
                    Candidate::Nested(inner) => match self.resolve_placeholder(inner).await {
                        Ok(resolved) => return Ok(resolved),
                        Err(e) if has_fallback && (e.is_unresolvable() || e.is_lookup_failure()) => {
                            log::debug!("Fallback {} is missing, trying the next one", inner.original);
                        }
                        Err(e) if e.is_unresolvable() => {}
                        Err(e) => return Err(e),
                    },
                    Candidate::Reference(reference) => {
                        if let Some(resolved) = self.resolve_reference(reference, has_fallback).await? {
                            return Ok(resolved);
                        }
                    }
                }
            }
            Err(Error::cannot_resolve(&placeholder.original, self.ctx.path.to_string()))
        })
    }

    /// `Ok(None)` means this candidate produced no value
    async fn resolve_reference(&self, reference: &Reference, has_fallback: bool) -> Result<Option<Resolved>> {
        let mut params = Vec::new();
        for param in reference.params.iter().flatten() {
            params.push(self.render(param).await?);
        }
        let resolver_type = match &reference.resolver_type {
            Some(t) => Some(self.render_text(t).await?.trim().to_string()),
            None => None,
        };
        let key = match &reference.key {
            Some(t) => self.render_text(t).await?.trim().to_string(),
            None => String::new(),
        };

        let lookup = self
            .provider(&reference.provider)
            .and_then(|p| p.resolver(resolver_type.as_deref(), &key).map(|r| (p, r)));
        let (provider, (resolver, resolver_type)) = match lookup {
            Ok(found) => found,
            Err(e) if has_fallback => {
                log::debug!("{}; trying the next candidate", e.to_string().lines().next().unwrap_or(""));
                return Ok(None);
            }
            Err(e) => return Err(e),
        };

        match resolver.resolve(&key, &params, &self.ctx).await {
            Ok(Some(value)) => Ok(Some(Resolved {
                value,
                source: Some(Source {
                    provider: reference.provider.clone(),
                    provider_kind: provider.kind().to_string(),
                    resolver_type,
                    key,
                }),
            })),
            Ok(None) => {
                log::debug!(
                    "{} resolver of provider {} found nothing for '{}'",
                    resolver_type,
                    provider.kind(),
                    key
                );
                Ok(None)
            }
            Err(e) if matches!(e.kind, ErrorKind::Resolver(_)) => Err(e),
            Err(e) => {
                let message = e.cause.clone().unwrap_or_else(|| e.to_string());
                Err(Error::resolver_failed(provider.kind(), resolver_type, key, message))
            }
        }
    }

    /// A template holding exactly one nested placeholder or literal keeps the
    /// native value; anything else is concatenated text.
    async fn render(&self, template: &Template) -> Result<Value> {
        match template.parts.as_slice() {
            [TemplatePart::Nested(inner)] => return Ok(self.resolve_placeholder(inner).await?.value),
            [TemplatePart::Literal(value)] => return Ok(value.clone()),
            _ => {}
        }

        let mut out = String::new();
        for part in &template.parts {
            match part {
                TemplatePart::Text(text) => out.push_str(text),
                TemplatePart::Literal(value) => out.push_str(&self.embed(value, &template.to_string())?),
                TemplatePart::Nested(inner) => {
                    let value = self.resolve_placeholder(inner).await?.value;
                    out.push_str(&self.embed(&value, &inner.original)?);
                }
            }
        }
        Ok(Value::String(out))
    }

    async fn render_text(&self, template: &Template) -> Result<String> {
        if let Some(text) = template.as_text() {
            return Ok(text);
        }
        let value = self.render(template).await?;
        self.embed(&value, &template.to_string())
    }

    fn embed(&self, value: &Value, expression: &str) -> Result<String> {
        value.as_template_text().ok_or_else(|| {
            Error::non_string_template(self.ctx.path.to_string(), expression, value.type_name())
        })
    }
}

/// Drives one resolution run over a graph
pub struct Scheduler<'g> {
    graph: &'g mut DependencyGraph,
    engine: Engine,
}

impl<'g> Scheduler<'g> {
    pub fn new(
        graph: &'g mut DependencyGraph,
        registry: Arc<ProviderRegistry>,
        ctx: ResolutionContext,
        view: ProviderView,
    ) -> Self {
        Self {
            graph,
            engine: Engine { registry, ctx, view },
        }
    }

    /// Resolve the selected roots (all when `selection` is `None`) and their
    /// dependency closure, substituting results into the document.
    pub async fn run(mut self, selection: Option<&[ConfigPath]>) -> Result<Vec<Replacement>> {
        self.graph.set_stage(self.engine.ctx.stage.as_deref());
        let targets = self.targets(selection);
        if targets.is_empty() {
            log::trace!("Nothing to resolve");
            return Ok(Vec::new());
        }
        log::debug!("Resolving {} placeholders ({:?} view)", targets.len(), self.engine.view);

        let document = self.engine.ctx.document.clone();
        let snapshot = document.snapshot();
        let mut touched = Vec::new();

        match self.execute(&targets, &mut touched).await {
            Ok(replacements) => Ok(replacements),
            Err(e) => {
                document.restore(snapshot);
                for id in touched {
                    self.set_subtree_state(id, NodeState::Unresolved);
                }
                Err(e)
            }
        }
    }

    /// Unresolved roots matching the selection plus everything they need,
    /// minus what the current view cannot resolve
    fn targets(&self, selection: Option<&[ConfigPath]>) -> Vec<NodeId> {
        let stage = self.engine.ctx.stage.as_deref();
        let pending = |node: &ExpressionNode| {
            self.graph.state(node.id) == NodeState::Unresolved
                && !stage.is_some_and(|s| is_foreign_stage_param(&node.path, s))
        };

        let mut queue: Vec<NodeId> = self
            .graph
            .roots()
            .filter(|n| pending(n))
            .filter(|n| selection.is_none_or(|paths| paths.iter().any(|p| p.overlaps(&n.path))))
            .map(|n| n.id)
            .collect();

        let mut closure: HashSet<NodeId> = queue.iter().copied().collect();
        while let Some(id) = queue.pop() {
            for dep in self.graph.root_dependencies(id) {
                if pending(self.graph.node(dep)) && closure.insert(dep) {
                    queue.push(dep);
                }
            }
        }

        if self.engine.view == ProviderView::Bootstrap {
            // Drop roots using a non-bootstrap provider
            closure.retain(|&id| {
                let placeholder = &self.graph.node(id).placeholder;
                let usable = placeholder.providers().iter().all(|p| self.engine.is_visible(p));
                if !usable {
                    log::trace!("Leaving {} for the full phase", placeholder.original);
                }
                usable
            });
        }

        // Then anything waiting on a root this run will not resolve
        loop {
            let blocked: Vec<NodeId> = closure
                .iter()
                .copied()
                .filter(|&id| {
                    self.graph.root_dependencies(id).iter().any(|dep| {
                        !closure.contains(dep) && self.graph.state(*dep) != NodeState::Resolved
                    })
                })
                .collect();
            if blocked.is_empty() {
                break;
            }
            for id in blocked {
                log::debug!(
                    "Leaving {} at '{}' unresolved; it waits on a placeholder outside this run",
                    self.graph.node(id).original(),
                    self.graph.node(id).path
                );
                closure.remove(&id);
            }
        }

        let mut targets: Vec<NodeId> = closure.into_iter().collect();
        targets.sort_unstable();
        targets
    }

    async fn execute(&mut self, targets: &[NodeId], touched: &mut Vec<NodeId>) -> Result<Vec<Replacement>> {
        let mut waiting: Vec<NodeId> = targets.to_vec();
        let mut running: JoinSet<(NodeId, Result<Resolved>)> = JoinSet::new();
        let mut replacements = Vec::new();

        loop {
            let (ready, blocked): (Vec<NodeId>, Vec<NodeId>) = waiting.into_iter().partition(|&id| {
                self.graph
                    .root_dependencies(id)
                    .iter()
                    .all(|dep| self.graph.state(*dep) == NodeState::Resolved)
            });
            waiting = blocked;

            for id in ready {
                let node = self.graph.node(id);
                log::trace!("Spawning {} at '{}'", node.original(), node.path);
                let engine = Engine {
                    ctx: self.engine.ctx.clone().with_path(node.path.clone()),
                    ..self.engine.clone()
                };
                let placeholder = Arc::clone(&node.placeholder);
                running.spawn(async move {
                    let result = engine.resolve_placeholder(&placeholder).await;
                    (id, result)
                });
                touched.push(id);
                self.set_subtree_state(id, NodeState::InProgress);
            }

            let Some(joined) = running.join_next().await else {
                if waiting.is_empty() {
                    break;
                }
                return Err(Error::internal(format!(
                    "{} placeholders are waiting on dependencies that never resolve",
                    waiting.len()
                )));
            };

            let (id, result) = match joined {
                Ok(done) => done,
                Err(e) => {
                    running.abort_all();
                    return Err(Error::internal(format!("resolution task failed: {}", e)));
                }
            };

            let node = self.graph.node(id).clone();
            let outcome = result.and_then(|resolved| {
                self.substitute(&node, &resolved.value)?;
                Ok(resolved)
            });
            let resolved = match outcome {
                Ok(resolved) => resolved,
                Err(e) => {
                    running.abort_all();
                    self.set_subtree_state(id, NodeState::Failed);
                    log::debug!("Aborting run after failure at '{}'", node.path);
                    return Err(e.or_path(node.path.to_string()).or_expression(node.original()));
                }
            };

            log::debug!("Resolved {} at '{}'", node.original(), node.path);
            self.set_subtree_state(id, NodeState::Resolved);
            let source = resolved.source;
            replacements.push(Replacement {
                path: node.path,
                original: node.placeholder.original.clone(),
                resolved: resolved.value,
                provider: source.as_ref().map(|s| s.provider.clone()),
                provider_kind: source.as_ref().map(|s| s.provider_kind.clone()),
                resolver_type: source.as_ref().map(|s| s.resolver_type.clone()),
                key: source.map(|s| s.key),
            });
        }

        Ok(replacements)
    }

    fn set_subtree_state(&mut self, root: NodeId, state: NodeState) {
        for member in self.graph.subtree(root) {
            self.graph.set_state(member, state);
        }
    }

    fn substitute(&mut self, node: &ExpressionNode, value: &Value) -> Result<()> {
        let document = &self.engine.ctx.document;
        if node.whole {
            return document.set(&node.path, value.clone());
        }
        let text = value.as_template_text().ok_or_else(|| {
            Error::non_string_template(node.path.to_string(), node.original(), value.type_name())
        })?;
        self.graph.set_rendered(node.id, text);
        let scalar = self.graph.render_scalar(&node.path).ok_or_else(|| {
            Error::internal(format!("no source text recorded for '{}'", node.path))
        })?;
        document.set(&node.path, Value::String(scalar))
    }
}

/// `params.<other>` or `stages.<other>.params` for a stage other than
/// `stage` and `default`
fn is_foreign_stage_param(path: &ConfigPath, stage: &str) -> bool {
    let foreign = |seg: Option<&PathSegment>| match seg {
        Some(PathSegment::Key(k)) => k != stage && k != "default",
        _ => false,
    };
    let segs = path.segments();
    match path.first_key() {
        Some("params") => foreign(segs.get(1)),
        Some("stages") => {
            matches!(segs.get(2), Some(PathSegment::Key(k)) if k == "params") && foreign(segs.get(1))
        }
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::Document;
    use crate::error::ResolverErrorKind;
    use crate::testing::{calls_of, delayed_provider, mock_provider, CallLog, EventLog};
    use std::sync::Mutex;
    use std::time::{Duration, Instant};
    use pretty_assertions::assert_eq;

    struct Fixture {
        graph: DependencyGraph,
        registry: Arc<ProviderRegistry>,
        ctx: ResolutionContext,
        calls: CallLog,
    }

    impl Fixture {
        fn new(yaml: &str) -> Self {
            Self::with_providers(yaml, Vec::new())
        }

        fn with_providers(yaml: &str, providers: Vec<Provider>) -> Self {
            let root: Value = serde_yaml::from_str(yaml).unwrap();
            let graph = DependencyGraph::build(&root).unwrap();
            let (mock, calls) = mock_provider();
            let mut registry = ProviderRegistry::with_builtins();
            registry.register(mock);
            for provider in providers {
                registry.register(provider);
            }
            Self {
                graph,
                registry: Arc::new(registry),
                ctx: ResolutionContext::new(Document::new(root)),
                calls,
            }
        }

        async fn run(&mut self, view: ProviderView, selection: Option<&[&str]>) -> Result<Vec<Replacement>> {
            let paths: Option<Vec<ConfigPath>> =
                selection.map(|s| s.iter().map(|p| ConfigPath::parse(p).unwrap()).collect());
            Scheduler::new(&mut self.graph, Arc::clone(&self.registry), self.ctx.clone(), view)
                .run(paths.as_deref())
                .await
        }

        async fn run_all(&mut self) -> Result<Vec<Replacement>> {
            self.run(ProviderView::Full, None).await
        }

        fn get(&self, path: &str) -> Value {
            self.ctx
                .document
                .get(&ConfigPath::parse(path).unwrap())
                .unwrap_or(Value::Null)
        }
    }

    #[tokio::test]
    async fn test_document_without_placeholders_is_untouched() {
        let yaml = "a: 1\nb:\n  c: text\n  d: [true, 2.5]";
        let mut f = Fixture::new(yaml);
        let before = f.ctx.document.snapshot();
        assert!(f.run_all().await.unwrap().is_empty());
        assert_eq!(f.ctx.document.snapshot(), before);
    }

    #[tokio::test]
    async fn test_concatenation() {
        let mut f = Fixture::new("prop: prefix-${mock:echo}-suffix");
        f.run_all().await.unwrap();
        assert_eq!(f.get("prop"), Value::from("prefix-resolved-suffix"));
    }

    #[tokio::test]
    async fn test_numbers_are_stringified_in_templates() {
        let mut f = Fixture::new("prop: port-${mock:number}");
        f.run_all().await.unwrap();
        assert_eq!(f.get("prop"), Value::from("port-42"));
    }

    #[tokio::test]
    async fn test_object_in_template_fails_and_rolls_back() {
        let mut f = Fixture::new("ok: ${mock:echo}\nprop: prefix-${mock:json}-suffix");
        let err = f.run_all().await.unwrap_err();
        assert!(matches!(err.kind, ErrorKind::NonStringTemplate { .. }));
        assert_eq!(err.path.as_deref(), Some("prop"));
        assert_eq!(err.expression.as_deref(), Some("${mock:json}"));
        // All-or-nothing: the successful sibling is reverted too
        assert_eq!(f.get("ok"), Value::from("${mock:echo}"));
        assert_eq!(f.get("prop"), Value::from("prefix-${mock:json}-suffix"));
    }

    #[tokio::test]
    async fn test_whole_value_keeps_native_type() {
        let mut f = Fixture::new("obj: ${mock:json}\nnum: ${mock:number}");
        f.run_all().await.unwrap();
        assert_eq!(f.get("obj.foo"), Value::from("bar"));
        assert_eq!(f.get("num"), Value::Integer(42));
    }

    #[tokio::test]
    async fn test_opaque_values_stay_in_memory() {
        let mut f = Fixture::new("handler: ${mock:fn}");
        f.run_all().await.unwrap();
        let value = f.get("handler");
        let callback = value
            .as_opaque()
            .and_then(|o| o.downcast_ref::<crate::testing::Callback>())
            .expect("opaque callback");
        assert_eq!((callback.0)(), "called");
    }

    #[tokio::test]
    async fn test_opaque_value_in_template_fails() {
        let mut f = Fixture::new("handler: call-${mock:fn}");
        let err = f.run_all().await.unwrap_err();
        assert_eq!(
            err.kind,
            ErrorKind::NonStringTemplate {
                type_name: "opaque".into()
            }
        );
    }

    #[tokio::test]
    async fn test_literal_fallback() {
        let mut f = Fixture::new(r#"prop: '${mock:missing, "fallbackValue"}'"#);
        f.run_all().await.unwrap();
        assert_eq!(f.get("prop"), Value::from("fallbackValue"));
    }

    #[tokio::test]
    async fn test_placeholder_fallback_chain() {
        let mut f = Fixture::new(r#"prop: '${mock:missing, ${mock:missing}, ${mock:echo}}'"#);
        let replacements = f.run_all().await.unwrap();
        assert_eq!(f.get("prop"), Value::from("resolved"));
        assert_eq!(replacements[0].key.as_deref(), Some("echo"));
    }

    #[tokio::test]
    async fn test_unreached_fallback_is_never_resolved() {
        let mut f = Fixture::new("prop: ${mock:echo, ${mock:shared}}");
        f.run_all().await.unwrap();
        assert_eq!(calls_of(&f.calls), vec![("default".into(), "echo".into())]);
    }

    #[tokio::test]
    async fn test_unknown_provider_falls_through_when_fallback_exists() {
        let mut f = Fixture::new(r#"prop: '${nope:x, "dflt"}'"#);
        f.run_all().await.unwrap();
        assert_eq!(f.get("prop"), Value::from("dflt"));
    }

    #[tokio::test]
    async fn test_unknown_provider_in_nested_fallback_falls_through() {
        let mut f = Fixture::new(r#"prop: '${mock:missing, ${nope:x}, "d"}'"#);
        f.run_all().await.unwrap();
        assert_eq!(f.get("prop"), Value::from("d"));

        let mut f = Fixture::new("prop: ${mock:missing, ${mock:nope:x}, ${mock:echo}}");
        f.run_all().await.unwrap();
        assert_eq!(f.get("prop"), Value::from("resolved"));
    }

    #[tokio::test]
    async fn test_unknown_provider_in_last_nested_candidate_is_fatal() {
        let mut f = Fixture::new("prop: ${mock:missing, ${nope:x}}");
        let err = f.run_all().await.unwrap_err();
        assert!(err.is_lookup_failure());
        assert_eq!(f.get("prop"), Value::from("${mock:missing, ${nope:x}}"));
    }

    #[tokio::test]
    async fn test_unknown_provider_is_fatal_without_fallback() {
        let mut f = Fixture::new("prop: ${nope:x}");
        let err = f.run_all().await.unwrap_err();
        assert_eq!(
            err.kind,
            ErrorKind::Resolver(ResolverErrorKind::ProviderNotFound {
                provider: "nope".into()
            })
        );
        assert_eq!(err.path.as_deref(), Some("prop"));
    }

    #[tokio::test]
    async fn test_unknown_resolver_type() {
        let mut f = Fixture::new("prop: ${mock:nope:x}");
        let err = f.run_all().await.unwrap_err();
        assert!(err.to_string().starts_with("nope resolver of provider mock not found"));
    }

    #[tokio::test]
    async fn test_missing_value_without_fallback_fails() {
        let mut f = Fixture::new("prop: ${mock:missing}");
        let err = f.run_all().await.unwrap_err();
        assert!(err.is_unresolvable());
        assert_eq!(err.expression.as_deref(), Some("${mock:missing}"));
        assert_eq!(err.path.as_deref(), Some("prop"));
    }

    #[tokio::test]
    async fn test_resolver_error_is_wrapped() {
        let mut f = Fixture::new(r#"prop: '${mock:error, "unused"}'"#);
        let err = f.run_all().await.unwrap_err();
        match &err.kind {
            ErrorKind::Resolver(ResolverErrorKind::Failed { provider, key, message, .. }) => {
                assert_eq!(provider, "mock");
                assert_eq!(key, "error");
                assert_eq!(message, "mock failure");
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_nested_param_resolves_first() {
        let mut f = Fixture::new("prop: ${mock( ${mock:echo} ):param}");
        f.run_all().await.unwrap();
        assert_eq!(f.get("prop"), Value::from("resolved"));
        let calls = f.calls.lock().unwrap().clone();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].1, "echo");
        assert_eq!(calls[1], ("default".into(), "param".into(), vec![Value::from("resolved")]));
    }

    #[tokio::test]
    async fn test_nested_key_selects_resolver_address() {
        let mut f = Fixture::new("prop: ${mock:value:${mock:echo}}");
        f.run_all().await.unwrap();
        assert_eq!(f.get("prop"), Value::from("value:resolved"));
        assert_eq!(calls_of(&f.calls)[1], ("value".into(), "resolved".into()));
    }

    #[tokio::test]
    async fn test_key_named_resolver_with_params() {
        let mut f = Fixture::new("prop: ${mock(myParam):myKey}");
        f.run_all().await.unwrap();
        assert_eq!(f.get("prop"), Value::from("value:myKey"));
        let calls = f.calls.lock().unwrap().clone();
        assert_eq!(calls, vec![("myKey".into(), "myKey".into(), vec![Value::from("myParam")])]);
    }

    #[tokio::test]
    async fn test_resolved_text_is_not_rescanned() {
        let mut f = Fixture::new("prop: ${mock:recurse}");
        f.run_all().await.unwrap();
        assert_eq!(f.get("prop"), Value::from("${mock:echo}"));
    }

    #[tokio::test]
    async fn test_identical_placeholders_resolve_independently() {
        let mut f = Fixture::new("a: ${mock:shared}\nb: ${mock:shared}");
        f.run_all().await.unwrap();
        assert_eq!(f.calls.lock().unwrap().len(), 2);
        assert_ne!(f.get("a"), f.get("b"));
    }

    #[tokio::test]
    async fn test_sibling_text_matching_a_later_placeholder_is_kept() {
        let events: EventLog = Arc::new(Mutex::new(Vec::new()));
        let mut f = Fixture::with_providers(
            "a: '${fast:y}-${slow:x}'",
            vec![
                delayed_provider("fast", 0, "${slow:x}", &events),
                delayed_provider("slow", 100, "S", &events),
            ],
        );
        f.run_all().await.unwrap();
        assert_eq!(f.get("a"), Value::from("${slow:x}-S"));
    }

    #[tokio::test]
    async fn test_repeated_placeholder_in_one_scalar() {
        let mut f = Fixture::new("a: '${mock:shared}/${mock:shared}'");
        f.run_all().await.unwrap();
        let text = f.get("a");
        let parts: Vec<&str> = text.as_str().unwrap().split('/').collect();
        assert_eq!(parts.len(), 2);
        assert_ne!(parts[0], parts[1]);
        assert!(parts.iter().all(|p| p.starts_with("shared-")));
    }

    #[tokio::test]
    async fn test_independent_roots_resolve_concurrently() {
        let events: EventLog = Arc::new(Mutex::new(Vec::new()));
        let mut f = Fixture::with_providers(
            "a: ${slow:a}\nb: ${slow:b}",
            vec![delayed_provider("slow", 200, "done", &events)],
        );
        let started = Instant::now();
        f.run_all().await.unwrap();
        let elapsed = started.elapsed();

        assert!(elapsed >= Duration::from_millis(200));
        assert!(elapsed < Duration::from_millis(390), "took {:?}", elapsed);
        let log = events.lock().unwrap().clone();
        assert!(log[..2].iter().all(|e| e.starts_with("start:")), "{:?}", log);
        assert_eq!(f.get("a"), Value::from("done"));
        assert_eq!(f.get("b"), Value::from("done"));
    }

    #[tokio::test]
    async fn test_dependent_waits_for_its_dependency() {
        let events: EventLog = Arc::new(Mutex::new(Vec::new()));
        let mut f = Fixture::with_providers(
            "copy: ${rec(${self:src}):second}\nsrc: ${rec:first}",
            vec![delayed_provider("rec", 50, "done", &events)],
        );
        f.run_all().await.unwrap();
        assert_eq!(
            events.lock().unwrap().clone(),
            vec!["start:first", "end:first", "start:second", "end:second"]
        );
        assert_eq!(f.get("copy"), Value::from("done"));
    }

    #[tokio::test]
    async fn test_selected_path_resolves_dependencies_only() {
        let mut f = Fixture::new(
            "propA: ${self:propB}\npropB: ${mock:echo}\npropC: ${mock:shared}",
        );
        f.run(ProviderView::Full, Some(&["propA"])).await.unwrap();
        assert_eq!(f.get("propA"), Value::from("resolved"));
        assert_eq!(f.get("propB"), Value::from("resolved"));
        assert_eq!(f.get("propC"), Value::from("${mock:shared}"));
        assert_eq!(calls_of(&f.calls), vec![("default".into(), "echo".into())]);
    }

    #[tokio::test]
    async fn test_selected_parent_resolves_children() {
        let mut f = Fixture::new(
            r#"
group:
  target:
    a: ${mock:echo}
    b: [x, "${mock:number}"]
  ignored: ${mock:shared}
"#,
        );
        f.run(ProviderView::Full, Some(&["group.target"])).await.unwrap();
        assert_eq!(f.get("group.target.a"), Value::from("resolved"));
        assert_eq!(f.get("group.target.b[1]"), Value::Integer(42));
        assert_eq!(f.get("group.ignored"), Value::from("${mock:shared}"));
    }

    #[tokio::test]
    async fn test_later_run_picks_up_remaining_nodes() {
        let mut f = Fixture::new("a: ${mock:echo}\nb: ${mock:shared}");
        f.run(ProviderView::Full, Some(&["a"])).await.unwrap();
        let second = f.run_all().await.unwrap();
        assert_eq!(second.len(), 1);
        assert_eq!(second[0].path.to_string(), "b");
        assert_eq!(f.calls.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_self_reference_sees_substituted_subtree() {
        let mut f = Fixture::new("copy: ${self:src}\nsrc:\n  x: ${mock:echo}\n  y: plain");
        f.run_all().await.unwrap();
        assert_eq!(f.get("copy.x"), Value::from("resolved"));
        assert_eq!(f.get("copy.y"), Value::from("plain"));
    }

    #[tokio::test]
    async fn test_dependency_chain_resolves_in_order() {
        let mut f = Fixture::new("a: ${self:b}-a\nb: ${self:c}-b\nc: ${mock:echo}");
        f.run_all().await.unwrap();
        assert_eq!(f.get("a"), Value::from("resolved-b-a"));
    }

    #[tokio::test]
    async fn test_bootstrap_view_skips_remote_providers() {
        std::env::set_var("VARGRAPH_SCHED_REGION", "eu-west-1");
        let mut f = Fixture::new(
            "region: ${env:VARGRAPH_SCHED_REGION}\nsecret: ${mock:echo}\nuses: ${self:secret}\nmixed: ${env:NOPE, ${mock:echo}}",
        );
        let done = f.run(ProviderView::Bootstrap, None).await.unwrap();
        assert_eq!(done.len(), 1);
        assert_eq!(f.get("region"), Value::from("eu-west-1"));
        assert_eq!(f.get("secret"), Value::from("${mock:echo}"));
        assert_eq!(f.get("uses"), Value::from("${self:secret}"));
        assert_eq!(f.get("mixed"), Value::from("${env:NOPE, ${mock:echo}}"));
        assert!(f.calls.lock().unwrap().is_empty());

        f.run_all().await.unwrap();
        assert_eq!(f.get("uses"), Value::from("resolved"));
    }

    #[tokio::test]
    async fn test_aws_routes_to_credential_resolver() {
        let mut f = Fixture::new("a: ${aws:foo}");
        f.ctx = f.ctx.clone().with_credential_resolver("mock");
        f.run_all().await.unwrap();
        assert_eq!(f.get("a"), Value::from("value:foo"));
    }

    #[tokio::test]
    async fn test_foreign_stage_params_are_skipped() {
        let mut f = Fixture::new(
            r#"
params:
  dev:
    x: ${mock:echo}
  prod:
    x: ${mock:error}
stages:
  prod:
    params:
      y: ${mock:error}
url: ${param:x}
"#,
        );
        f.ctx = f.ctx.clone().with_stage("dev");
        f.run_all().await.unwrap();
        assert_eq!(f.get("url"), Value::from("resolved"));
        assert_eq!(f.get("params.prod.x"), Value::from("${mock:error}"));
    }

    #[tokio::test]
    async fn test_self_read_of_foreign_stage_param_is_left_unresolved() {
        let mut f = Fixture::new(
            "params:\n  prod:\n    x: ${mock:error}\nurl: ${self:params.prod.x}\nother: ${mock:echo}",
        );
        f.ctx = f.ctx.clone().with_stage("dev");
        let done = f.run_all().await.unwrap();
        assert_eq!(done.len(), 1);
        assert_eq!(f.get("url"), Value::from("${self:params.prod.x}"));
        assert_eq!(f.get("other"), Value::from("resolved"));
        assert_eq!(calls_of(&f.calls), vec![("default".into(), "echo".into())]);
    }

    #[test]
    fn test_foreign_stage_param_paths() {
        let check = |p: &str| is_foreign_stage_param(&ConfigPath::parse(p).unwrap(), "dev");
        assert!(check("params.prod.x"));
        assert!(check("stages.prod.params.x"));
        assert!(!check("params.dev.x"));
        assert!(!check("params.default.x"));
        assert!(!check("stages.prod.resolvers.x"));
        assert!(!check("custom.params.prod"));
    }
}
