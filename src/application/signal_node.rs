// Signal nodes, construction rules and the alias registry
use crate::application::expression::{Expr, ExprError, is_expression};
use crate::domain::{FetchRequest, RangeHash, SignalData, StatusInfo, TimeFormat};
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use thiserror::Error;
use tokio::sync::Mutex;

/// A node shared between its plot binding, parents and the registry.
pub type SharedNode = Arc<Mutex<SignalNode>>;

/// Reasons a node is constructed in the terminal `Invalid` state.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum GraphError {
    #[error("invalid expression '{expression}': {source}")]
    Expression {
        expression: String,
        #[source]
        source: ExprError,
    },
    #[error("undeclared alias '{0}'")]
    UndeclaredAlias(String),
    #[error("alias '{alias}' reads from '{child}' but '{parent}' reads from '{parent_source}'")]
    SourceConflict {
        alias: String,
        child: String,
        parent: String,
        parent_source: String,
    },
    #[error("no data source configured for '{0}'")]
    NoSource(String),
}

/// The parameters of a node that decide what gets fetched.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct RequestWindow {
    pub time_start: Option<f64>,
    pub time_end: Option<f64>,
    pub pulse_id: Option<i64>,
    /// `None` falls back to the coordinator default.
    pub max_samples: Option<usize>,
}

impl RequestWindow {
    pub fn hash(&self) -> RangeHash {
        RangeHash::new(
            self.time_start,
            self.time_end,
            self.max_samples.unwrap_or(0),
            self.pulse_id,
        )
    }
}

/// Everything needed to construct a node.
#[derive(Debug, Clone, Default)]
pub struct NodeSpec {
    pub name: String,
    pub alias: Option<String>,
    pub source_id: Option<String>,
    pub window: RequestWindow,
    pub time_format: TimeFormat,
    pub want_envelope: bool,
    pub x_expr: Option<String>,
    pub y_expr: Option<String>,
    pub z_expr: Option<String>,
}

impl NodeSpec {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn alias(mut self, alias: impl Into<String>) -> Self {
        self.alias = Some(alias.into());
        self
    }

    pub fn source(mut self, source_id: impl Into<String>) -> Self {
        self.source_id = Some(source_id.into());
        self
    }

    pub fn range(mut self, start: f64, end: f64) -> Self {
        self.window.time_start = Some(start);
        self.window.time_end = Some(end);
        self
    }

    pub fn pulse(mut self, pulse_id: i64) -> Self {
        self.window.pulse_id = Some(pulse_id);
        self
    }

    pub fn max_samples(mut self, max_samples: usize) -> Self {
        self.window.max_samples = Some(max_samples);
        self
    }

    pub fn time_format(mut self, time_format: TimeFormat) -> Self {
        self.time_format = time_format;
        self
    }

    pub fn envelope(mut self, want_envelope: bool) -> Self {
        self.want_envelope = want_envelope;
        self
    }

    pub fn x_expr(mut self, expr: impl Into<String>) -> Self {
        self.x_expr = Some(expr.into());
        self
    }

    pub fn y_expr(mut self, expr: impl Into<String>) -> Self {
        self.y_expr = Some(expr.into());
        self
    }

    pub fn z_expr(mut self, expr: impl Into<String>) -> Self {
        self.z_expr = Some(expr.into());
        self
    }
}

/// A dependency of a composite node, bound to one `${alias}`.
#[derive(Clone)]
pub struct Child {
    pub alias: String,
    pub node: SharedNode,
    /// Built by the parent (follows the parent's window) rather than
    /// borrowed from the registry.
    pub owned: bool,
}

#[derive(Clone)]
pub enum NodeKind {
    Leaf,
    Composite { expr: Expr, children: Vec<Child> },
}

pub struct SignalNode {
    pub name: String,
    pub alias: Option<String>,
    pub source_id: Option<String>,
    pub window: RequestWindow,
    pub time_format: TimeFormat,
    pub want_envelope: bool,
    /// False for nodes holding local data only.
    pub data_access: bool,
    pub kind: NodeKind,
    pub status: StatusInfo,
    pub last_fetch_hash: Option<RangeHash>,
    pub downsampled: bool,
    /// Primary buffers: fetched for a leaf, derived for a composite.
    pub raw: SignalData,
    /// Buffers exposed to callers after the output expressions.
    pub data: SignalData,
    pub x_expr: Option<Expr>,
    pub y_expr: Option<Expr>,
    pub z_expr: Option<Expr>,
}

impl SignalNode {
    fn blank(spec: &NodeSpec) -> Self {
        Self {
            name: spec.name.clone(),
            alias: spec.alias.clone(),
            source_id: spec.source_id.clone(),
            window: spec.window.clone(),
            time_format: spec.time_format,
            want_envelope: spec.want_envelope,
            data_access: spec.source_id.is_some(),
            kind: NodeKind::Leaf,
            status: StatusInfo::init(),
            last_fetch_hash: None,
            downsampled: false,
            raw: SignalData::default(),
            data: SignalData::default(),
            x_expr: None,
            y_expr: None,
            z_expr: None,
        }
    }

    /// Construct a node, resolving its expression against `registry`.
    ///
    /// Construction never fails: an unsatisfiable node comes back `Invalid`
    /// and stays that way. A valid node with an alias is published.
    pub fn build(spec: NodeSpec, registry: &Registry) -> SharedNode {
        let mut node = Self::blank(&spec);
        match Self::resolve(&spec, registry) {
            Ok((kind, [x_expr, y_expr, z_expr])) => {
                node.kind = kind;
                node.x_expr = x_expr;
                node.y_expr = y_expr;
                node.z_expr = z_expr;
            }
            Err(e) => {
                tracing::warn!("Signal '{}' is invalid: {}", spec.name, e);
                node.status = StatusInfo::invalid(e.to_string());
            }
        }

        let valid = !node.status.is_invalid();
        let shared = Arc::new(Mutex::new(node));
        if let (true, Some(alias)) = (valid, spec.alias.as_ref()) {
            registry.publish(alias, shared.clone(), spec.source_id.clone(), spec.source_id.is_some());
        }
        shared
    }

    /// A node over data already in memory. It never fetches.
    pub fn local(spec: NodeSpec, data: SignalData, registry: &Registry) -> SharedNode {
        let mut node = Self::blank(&spec);
        node.data_access = false;
        node.raw = data.clone();
        node.data = data;
        let shared = Arc::new(Mutex::new(node));
        if let Some(alias) = spec.alias.as_ref() {
            registry.publish(alias, shared.clone(), spec.source_id.clone(), false);
        }
        shared
    }

    #[allow(clippy::type_complexity)]
    fn resolve(
        spec: &NodeSpec,
        registry: &Registry,
    ) -> Result<(NodeKind, [Option<Expr>; 3]), GraphError> {
        let outputs = [&spec.x_expr, &spec.y_expr, &spec.z_expr].map(|e| e.as_deref().map(parse));
        let [x, y, z] = outputs;
        let outputs = [x.transpose()?, y.transpose()?, z.transpose()?];

        if !is_expression(&spec.name) {
            if spec.source_id.is_none() && !spec.name.is_empty() {
                return Err(GraphError::NoSource(spec.name.clone()));
            }
            return Ok((NodeKind::Leaf, outputs));
        }

        let expr = parse(&spec.name)?;
        let mut children = Vec::new();
        for alias in expr.references() {
            let child = match registry.lookup(&alias) {
                Some(entry) => {
                    if let (Some(parent_source), true) = (spec.source_id.as_ref(), entry.data_access) {
                        let child_source = entry.source_id.clone().unwrap_or_default();
                        if &child_source != parent_source {
                            return Err(GraphError::SourceConflict {
                                alias,
                                child: child_source,
                                parent: spec.name.clone(),
                                parent_source: parent_source.clone(),
                            });
                        }
                    }
                    Child {
                        alias,
                        node: entry.node,
                        owned: false,
                    }
                }
                None if spec.source_id.is_some() => {
                    let child_spec = NodeSpec {
                        name: alias.clone(),
                        alias: None,
                        source_id: spec.source_id.clone(),
                        window: spec.window.clone(),
                        time_format: spec.time_format,
                        want_envelope: spec.want_envelope,
                        ..NodeSpec::default()
                    };
                    Child {
                        alias,
                        node: Self::build(child_spec, registry),
                        owned: true,
                    }
                }
                None => return Err(GraphError::UndeclaredAlias(alias)),
            };
            children.push(child);
        }

        Ok((NodeKind::Composite { expr, children }, outputs))
    }

    pub fn children(&self) -> Vec<Child> {
        match &self.kind {
            NodeKind::Leaf => Vec::new(),
            NodeKind::Composite { children, .. } => children.clone(),
        }
    }

    pub fn build_request(&self, default_max_samples: usize) -> FetchRequest {
        FetchRequest {
            source_id: self.source_id.clone().unwrap_or_default(),
            variable: self.name.clone(),
            pulse_id: self.window.pulse_id,
            time_start: self.window.time_start,
            time_end: self.window.time_end,
            time_format: self.time_format,
            max_samples: self.window.max_samples.unwrap_or(default_max_samples),
            decimation: None,
            want_envelope: self.want_envelope,
        }
    }

    /// Whether the fetched x buffer already spans the requested window.
    /// Bounds are inclusive.
    pub fn contains_window(&self) -> bool {
        match (self.window.time_start, self.window.time_end, self.raw.x_bounds()) {
            (Some(start), Some(end), Some((lo, hi))) => lo <= start && hi >= end,
            _ => false,
        }
    }
}

fn parse(source: &str) -> Result<Expr, GraphError> {
    Expr::parse(source).map_err(|e| GraphError::Expression {
        expression: source.to_string(),
        source: e,
    })
}

/// Change a node's window, following owned children down the graph.
///
/// Children borrowed from the registry keep their own window.
pub fn set_window(node: &SharedNode, window: RequestWindow) -> futures::future::BoxFuture<'_, ()> {
    Box::pin(async move {
        let owned: Vec<SharedNode> = {
            let mut guard = node.lock().await;
            guard.window = window.clone();
            guard.children().into_iter().filter(|c| c.owned).map(|c| c.node).collect()
        };
        for child in &owned {
            set_window(child, window.clone()).await;
        }
    })
}

// ── Registry ────────────────────────────────────────────────────────

#[derive(Clone)]
pub struct RegistryEntry {
    pub node: SharedNode,
    pub source_id: Option<String>,
    pub data_access: bool,
}

/// Alias → node map shared by every plot in one session.
#[derive(Default)]
pub struct Registry {
    entries: RwLock<HashMap<String, RegistryEntry>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn publish(&self, alias: &str, node: SharedNode, source_id: Option<String>, data_access: bool) {
        let entry = RegistryEntry {
            node,
            source_id,
            data_access,
        };
        let previous = self
            .entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(alias.to_string(), entry);
        if previous.is_some() {
            tracing::debug!("Alias '{}' re-published", alias);
        }
    }

    pub fn lookup(&self, alias: &str) -> Option<RegistryEntry> {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(alias)
            .cloned()
    }

    pub fn remove(&self, alias: &str) -> Option<SharedNode> {
        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(alias)
            .map(|e| e.node)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::StatusResult;

    #[tokio::test]
    async fn test_bare_name_is_a_leaf() {
        let registry = Registry::new();
        let node = SignalNode::build(NodeSpec::new("ip").source("tokamak").alias("IP"), &registry);
        let guard = node.lock().await;
        assert!(matches!(guard.kind, NodeKind::Leaf));
        assert_eq!(guard.status.result, StatusResult::Ready);
        assert!(registry.lookup("IP").is_some());
    }

    #[tokio::test]
    async fn test_expression_builds_owned_children() {
        let registry = Registry::new();
        let node = SignalNode::build(
            NodeSpec::new("${ip} * ${ne}").source("tokamak").range(0.0, 1.0).pulse(7),
            &registry,
        );
        let children = node.lock().await.children();
        assert_eq!(children.len(), 2);
        assert!(children.iter().all(|c| c.owned));

        let ne = children[1].node.lock().await;
        assert_eq!(ne.name, "ne");
        assert_eq!(ne.source_id.as_deref(), Some("tokamak"));
        assert_eq!(ne.window.pulse_id, Some(7));
        assert_eq!(ne.window.time_end, Some(1.0));
    }

    #[tokio::test]
    async fn test_registered_alias_is_shared() {
        let registry = Registry::new();
        let a = SignalNode::build(NodeSpec::new("ip").source("tokamak").alias("A"), &registry);
        let sum = SignalNode::build(NodeSpec::new("${A} + 1").source("tokamak"), &registry);

        let children = sum.lock().await.children();
        assert!(!children[0].owned);
        assert!(Arc::ptr_eq(&children[0].node, &a));
    }

    #[tokio::test]
    async fn test_undeclared_alias_without_source_is_invalid() {
        let registry = Registry::new();
        let node = SignalNode::build(NodeSpec::new("${A} + ${B}").alias("S"), &registry);
        let guard = node.lock().await;
        assert!(guard.status.is_invalid());
        assert_eq!(guard.status.message, "undeclared alias 'A'");
        assert!(registry.lookup("S").is_none());
    }

    #[tokio::test]
    async fn test_source_conflict_is_invalid() {
        let registry = Registry::new();
        SignalNode::build(NodeSpec::new("ip").source("tokamak").alias("A"), &registry);
        let node = SignalNode::build(NodeSpec::new("${A} * 2").source("stellarator"), &registry);
        assert!(node.lock().await.status.is_invalid());
    }

    #[tokio::test]
    async fn test_local_alias_does_not_conflict() {
        let registry = Registry::new();
        SignalNode::local(
            NodeSpec::new("calibration").alias("CAL"),
            SignalData::new(vec![0.0], vec![2.0]),
            &registry,
        );
        let node = SignalNode::build(NodeSpec::new("${ip} * ${CAL}").source("tokamak"), &registry);
        assert!(!node.lock().await.status.is_invalid());
    }

    #[tokio::test]
    async fn test_bad_syntax_and_bad_output_expression_are_invalid() {
        let registry = Registry::new();
        let node = SignalNode::build(NodeSpec::new("${A} +").source("tokamak"), &registry);
        assert!(node.lock().await.status.is_invalid());

        let node = SignalNode::build(NodeSpec::new("ip").source("tokamak").y_expr("y *"), &registry);
        assert!(node.lock().await.status.is_invalid());
    }

    #[tokio::test]
    async fn test_contains_window_is_inclusive() {
        let registry = Registry::new();
        let node = SignalNode::build(NodeSpec::new("ip").source("tokamak").range(0.0, 10.0), &registry);
        let mut guard = node.lock().await;
        guard.raw = SignalData::new(vec![0.0, 5.0, 10.0], vec![1.0, 2.0, 3.0]);
        assert!(guard.contains_window());
        guard.window.time_end = Some(10.5);
        assert!(!guard.contains_window());
        guard.window.time_end = None;
        assert!(!guard.contains_window());
    }

    #[tokio::test]
    async fn test_set_window_follows_owned_children_only() {
        let registry = Registry::new();
        let shared = SignalNode::build(NodeSpec::new("ne").source("tokamak").alias("NE").range(0.0, 1.0), &registry);
        let parent = SignalNode::build(
            NodeSpec::new("${ip} / ${NE}").source("tokamak").range(0.0, 1.0),
            &registry,
        );

        let window = RequestWindow {
            time_start: Some(2.0),
            time_end: Some(3.0),
            ..RequestWindow::default()
        };
        set_window(&parent, window.clone()).await;

        let children = parent.lock().await.children();
        assert_eq!(children[0].node.lock().await.window, window);
        assert_eq!(shared.lock().await.window.time_start, Some(0.0));
    }
}
