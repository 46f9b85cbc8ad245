//! Dependency graph over placeholder nodes
//!
//! Nodes live in an arena indexed by [`NodeId`]; `edges[a]` lists the nodes
//! that must be resolved before `a` can be attempted. Edges come from:
//! 1. **Nesting**: a placeholder inside another's params, address or fallbacks
//! 2. **Document reads**: a `self:` or `param:` reference whose target holds
//!    (or is held by) another placeholder
//!
//! The graph must stay acyclic; every mutation re-runs cycle detection.

use std::collections::{HashMap, HashSet};
use std::ops::Range;
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::expression::{scan_scalar, Placeholder, Reference, TemplatePart};
use crate::value::{ConfigPath, PathSegment, Value};

pub type NodeId = usize;

/// Lifecycle of a node within the engine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeState {
    Unresolved,
    InProgress,
    Resolved,
    Failed,
    /// Its text was removed from the document (pruned stage, temporary key)
    Detached,
}

/// A placeholder found in the document
#[derive(Debug, Clone)]
pub struct ExpressionNode {
    pub id: NodeId,
    /// Location of the scalar holding the placeholder
    pub path: ConfigPath,
    pub placeholder: Arc<Placeholder>,
    /// Enclosing node when nested inside another placeholder
    pub parent: Option<NodeId>,
    /// True when the placeholder text is the entire scalar
    pub whole: bool,
    /// Byte range within the source scalar, for root nodes
    pub span: Option<Range<usize>>,
}

impl ExpressionNode {
    pub fn original(&self) -> &str {
        &self.placeholder.original
    }
}

/// Document region a reference reads. `None` segments match any key.
#[derive(Debug, Clone)]
struct ReadTarget {
    pattern: Vec<Option<PathSegment>>,
    /// False when part of the target is only known after resolution
    exact: bool,
}

impl ReadTarget {
    fn overlaps(&self, path: &ConfigPath) -> bool {
        self.pattern
            .iter()
            .zip(path.segments())
            .all(|(want, seg)| want.as_ref().is_none_or(|w| w.matches(seg)))
    }
}

#[derive(Debug, Clone, Default)]
pub struct DependencyGraph {
    nodes: Vec<ExpressionNode>,
    edges: Vec<Vec<NodeId>>,
    states: Vec<NodeState>,
    /// Text each root was rendered to, kept until the node is reset
    rendered: Vec<Option<String>>,
    /// Original text of every scalar holding placeholders
    sources: HashMap<ConfigPath, String>,
    /// Stage `param` reads are linked for; any stage when unset
    stage: Option<String>,
}

impl DependencyGraph {
    /// Scan every scalar of `root`, link the nodes and reject cycles
    pub fn build(root: &Value) -> Result<Self> {
        let mut graph = DependencyGraph::default();
        let mut scalars = Vec::new();
        root.visit_strings(&mut |path, text| {
            if text.contains("${") {
                scalars.push((path.clone(), text.to_string()));
            }
        });

        for (path, text) in scalars {
            graph.insert_scalar(&path, &text)?;
        }

        graph.relink();
        graph.check_cycles()?;
        log::trace!("Built dependency graph with {} nodes", graph.nodes.len());
        Ok(graph)
    }

    /// Add the placeholders of one scalar to an existing graph.
    ///
    /// Returns the new root nodes. On a cycle the graph is left unchanged.
    pub fn add_scalar(&mut self, path: &ConfigPath, text: &str) -> Result<Vec<NodeId>> {
        let before = self.nodes.len();
        let prior_source = self.sources.get(path).cloned();
        let roots = self.insert_scalar(path, text)?;
        self.relink();
        if let Err(e) = self.check_cycles() {
            self.nodes.truncate(before);
            self.states.truncate(before);
            self.rendered.truncate(before);
            match prior_source {
                Some(source) => self.sources.insert(path.clone(), source),
                None => self.sources.remove(path),
            };
            self.relink();
            return Err(e);
        }
        Ok(roots)
    }

    /// Narrow `param` read edges to `stage` and `default`.
    ///
    /// Only removes edges, so the graph stays acyclic.
    pub fn set_stage(&mut self, stage: Option<&str>) {
        if self.stage.as_deref() != stage {
            self.stage = stage.map(str::to_string);
            self.relink();
        }
    }

    /// Detach every node at or below `prefix`
    pub fn detach(&mut self, prefix: &ConfigPath) -> usize {
        let mut count = 0;
        for node in &self.nodes {
            if node.path.starts_with(prefix) && self.states[node.id] != NodeState::Detached {
                self.states[node.id] = NodeState::Detached;
                count += 1;
            }
        }
        if count > 0 {
            log::trace!("Detached {} nodes under '{}'", count, prefix);
            self.relink();
        }
        count
    }

    fn insert_scalar(&mut self, path: &ConfigPath, text: &str) -> Result<Vec<NodeId>> {
        let placeholders = scan_scalar(text).map_err(|e| e.or_path(path.to_string()))?;
        if placeholders.is_empty() {
            return Ok(Vec::new());
        }
        self.sources.insert(path.clone(), text.to_string());
        let mut roots = Vec::with_capacity(placeholders.len());
        for (span, placeholder) in placeholders {
            let whole = span == (0..text.len());
            let id = self.insert_node(path, placeholder, None, whole);
            self.nodes[id].span = Some(span);
            roots.push(id);
        }
        Ok(roots)
    }

    fn insert_node(
        &mut self,
        path: &ConfigPath,
        placeholder: Arc<Placeholder>,
        parent: Option<NodeId>,
        whole: bool,
    ) -> NodeId {
        let id = self.nodes.len();
        let children = placeholder.children();
        self.nodes.push(ExpressionNode {
            id,
            path: path.clone(),
            placeholder,
            parent,
            whole,
            span: None,
        });
        self.edges.push(Vec::new());
        self.states.push(NodeState::Unresolved);
        self.rendered.push(None);
        for child in children {
            self.insert_node(path, child, Some(id), false);
        }
        id
    }

    /// Recompute every edge from scratch
    fn relink(&mut self) {
        let mut edges = vec![Vec::new(); self.nodes.len()];
        for node in &self.nodes {
            if self.states[node.id] == NodeState::Detached {
                continue;
            }
            if let Some(parent) = node.parent {
                edges[parent].push(node.id);
            }
        }

        for node in &self.nodes {
            if self.states[node.id] == NodeState::Detached {
                continue;
            }
            let root = self.root_of(node.id);
            for target in read_targets(&node.placeholder, self.stage.as_deref()) {
                for other in &self.nodes {
                    if self.states[other.id] == NodeState::Detached
                        || !target.overlaps(&other.path)
                        || (!target.exact && self.root_of(other.id) == root)
                    {
                        continue;
                    }
                    if !edges[node.id].contains(&other.id) {
                        edges[node.id].push(other.id);
                    }
                }
            }
        }
        self.edges = edges;
    }

    /// Iterative depth-first search with an explicit on-stack set
    fn check_cycles(&self) -> Result<()> {
        #[derive(Clone, Copy, PartialEq)]
        enum Mark {
            New,
            OnStack,
            Done,
        }

        let mut marks = vec![Mark::New; self.nodes.len()];
        for start in 0..self.nodes.len() {
            if marks[start] != Mark::New || self.states[start] == NodeState::Detached {
                continue;
            }
            // (node, index of the next edge to explore)
            let mut stack: Vec<(NodeId, usize)> = vec![(start, 0)];
            marks[start] = Mark::OnStack;

            while let Some(top) = stack.last_mut() {
                let node = top.0;
                if let Some(&dep) = self.edges[node].get(top.1) {
                    top.1 += 1;
                    match marks[dep] {
                        Mark::New => {
                            marks[dep] = Mark::OnStack;
                            stack.push((dep, 0));
                        }
                        Mark::OnStack => {
                            let from = stack.iter().position(|(n, _)| *n == dep).unwrap_or(0);
                            let mut chain: Vec<String> = stack[from..]
                                .iter()
                                .map(|(n, _)| self.nodes[*n].original().to_string())
                                .collect();
                            chain.push(self.nodes[dep].original().to_string());
                            return Err(Error::cyclic_reference(
                                self.nodes[dep].path.to_string(),
                                chain,
                            )
                            .or_expression(self.nodes[dep].original()));
                        }
                        Mark::Done => {}
                    }
                } else {
                    marks[node] = Mark::Done;
                    stack.pop();
                }
            }
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn node(&self, id: NodeId) -> &ExpressionNode {
        &self.nodes[id]
    }

    pub fn nodes(&self) -> &[ExpressionNode] {
        &self.nodes
    }

    pub fn state(&self, id: NodeId) -> NodeState {
        self.states[id]
    }

    pub fn set_state(&mut self, id: NodeId, state: NodeState) {
        self.states[id] = state;
        if state == NodeState::Unresolved {
            self.rendered[id] = None;
        }
    }

    /// Record the text a root placeholder resolved to
    pub fn set_rendered(&mut self, id: NodeId, text: String) {
        self.rendered[id] = Some(text);
    }

    /// Source scalar at `path` with every rendered root spliced in.
    ///
    /// Roots without a rendering keep their original text. Splicing works on
    /// the recorded spans, so resolved text that happens to contain another
    /// placeholder's source is never mistaken for it.
    pub fn render_scalar(&self, path: &ConfigPath) -> Option<String> {
        let mut text = self.sources.get(path)?.clone();
        let mut spliced: Vec<(&Range<usize>, &str)> = self
            .roots()
            .filter(|n| &n.path == path)
            .filter_map(|n| Some((n.span.as_ref()?, self.rendered[n.id].as_deref()?)))
            .collect();
        spliced.sort_by_key(|(span, _)| std::cmp::Reverse(span.start));
        for (span, rendered) in spliced {
            text.replace_range(span.clone(), rendered);
        }
        Some(text)
    }

    /// Attached nodes written directly in the document
    pub fn roots(&self) -> impl Iterator<Item = &ExpressionNode> {
        self.nodes
            .iter()
            .filter(|n| n.parent.is_none() && self.states[n.id] != NodeState::Detached)
    }

    /// Outermost ancestor of `id`
    pub fn root_of(&self, mut id: NodeId) -> NodeId {
        while let Some(parent) = self.nodes[id].parent {
            id = parent;
        }
        id
    }

    /// `root` and every node nested inside it
    pub fn subtree(&self, root: NodeId) -> Vec<NodeId> {
        // Children are always inserted after their parent
        let mut members: HashSet<NodeId> = HashSet::from([root]);
        let mut out = vec![root];
        for node in &self.nodes[root + 1..] {
            match node.parent {
                Some(p) if members.contains(&p) => {
                    members.insert(node.id);
                    out.push(node.id);
                }
                _ => {}
            }
        }
        out
    }

    /// Other roots whose nodes must resolve before anything in `root`'s subtree
    pub fn root_dependencies(&self, root: NodeId) -> Vec<NodeId> {
        let mut deps = Vec::new();
        for member in self.subtree(root) {
            for &dep in &self.edges[member] {
                let dep_root = self.root_of(dep);
                if dep_root != root && !deps.contains(&dep_root) {
                    deps.push(dep_root);
                }
            }
        }
        deps
    }
}

/// Regions of the document a placeholder's own references read
fn read_targets(placeholder: &Placeholder, stage: Option<&str>) -> Vec<ReadTarget> {
    let stage_segments: Vec<Option<PathSegment>> = match stage {
        Some(s) if s != "default" => vec![
            Some(PathSegment::Key(s.into())),
            Some(PathSegment::Key("default".into())),
        ],
        Some(_) => vec![Some(PathSegment::Key("default".into()))],
        None => vec![None],
    };
    let mut targets = Vec::new();
    for reference in placeholder.references() {
        let Some((key, exact)) = key_prefix(reference) else {
            continue;
        };
        let key_segments: Vec<Option<PathSegment>> = key.segments().iter().cloned().map(Some).collect();
        match reference.provider.as_str() {
            "self" => {
                // A whole-document or fully dynamic read links to nothing
                if key.is_root() {
                    continue;
                }
                targets.push(ReadTarget {
                    pattern: key_segments,
                    exact,
                });
            }
            "param" => {
                for stage in &stage_segments {
                    let mut under_params = vec![Some(PathSegment::Key("params".into())), stage.clone()];
                    under_params.extend(key_segments.iter().cloned());
                    let mut under_stages = vec![
                        Some(PathSegment::Key("stages".into())),
                        stage.clone(),
                        Some(PathSegment::Key("params".into())),
                    ];
                    under_stages.extend(key_segments.iter().cloned());
                    targets.push(ReadTarget {
                        pattern: under_params,
                        exact,
                    });
                    targets.push(ReadTarget {
                        pattern: under_stages,
                        exact,
                    });
                }
            }
            _ => {}
        }
    }
    targets
}

/// Statically known part of a reference key, and whether that is all of it
fn key_prefix(reference: &Reference) -> Option<(ConfigPath, bool)> {
    let Some(key) = &reference.key else {
        return Some((ConfigPath::root(), true));
    };
    let mut text = String::new();
    let mut exact = true;
    for part in &key.parts {
        match part {
            TemplatePart::Text(t) => text.push_str(t),
            _ => {
                exact = false;
                break;
            }
        }
    }
    if !exact {
        // Keep only whole segments before the dynamic part
        match text.rfind(['.', '[']) {
            Some(at) => text.truncate(at),
            None => text.clear(),
        }
    }
    ConfigPath::parse(text.trim()).ok().map(|p| (p, exact))
}
