// Signal graph - Data access and processing cycle over node trees
use crate::application::access::AccessCoordinator;
use crate::application::align::GridAligner;
use crate::application::expression::{Expr, ExprError, Scope, Value, evaluate};
use crate::application::signal_node::{NodeKind, SharedNode, SignalNode};
use crate::domain::{SignalData, Stage, StatusInfo, StatusResult};
use futures::future::BoxFuture;
use std::sync::Arc;

pub struct SignalGraph {
    coordinator: Arc<AccessCoordinator>,
    aligner: GridAligner,
}

impl SignalGraph {
    pub fn new(coordinator: Arc<AccessCoordinator>, aligner: GridAligner) -> Self {
        Self { coordinator, aligner }
    }

    /// Run one data access and processing cycle for `node`.
    ///
    /// Never fails: every outcome is reported through the returned status,
    /// which is also stored on the node.
    pub async fn clear_cache(&self) {
        self.coordinator.clear_cache().await;
    }

    pub fn get_data<'a>(&'a self, node: &'a SharedNode) -> BoxFuture<'a, StatusInfo> {
        Box::pin(async move {
            let kind = {
                let mut guard = node.lock().await;
                if guard.status.is_invalid() || guard.status.is_busy() {
                    return guard.status.clone();
                }
                guard.status = StatusInfo::new(StatusResult::Ready, guard.status.stage);
                guard.kind.clone()
            };

            let derived = match kind {
                NodeKind::Leaf => {
                    let access = self.leaf_access(node).await;
                    if !access.is_success() {
                        return access;
                    }
                    None
                }
                NodeKind::Composite { expr, children } => {
                    let mut inputs = Vec::with_capacity(children.len());
                    for child in &children {
                        let status = self.get_data(&child.node).await;
                        let child_guard = child.node.lock().await;
                        if status.is_busy() {
                            let message = format!("signal '{}' is busy", child_guard.name);
                            drop(child_guard);
                            return self.fail_composite(node, Stage::DataAccess, message).await;
                        }
                        if !status.is_success() {
                            // Report the child's own message so the root cause stays visible.
                            let message = child_guard.status.message.clone();
                            let stage = child_guard.status.stage;
                            drop(child_guard);
                            return self.fail_composite(node, stage, message).await;
                        }
                        inputs.push((child.alias.clone(), child_guard.data.clone()));
                    }
                    Some(self.combine(&expr, inputs))
                }
            };

            let mut guard = node.lock().await;
            let outcome = match derived {
                Some(Ok(raw)) => {
                    guard.raw = raw;
                    apply_outputs(&guard)
                }
                Some(Err(e)) => Err(e),
                None => apply_outputs(&guard),
            };

            match outcome {
                Ok(data) => {
                    guard.status = StatusInfo::success(Stage::Processing, data.len());
                    guard.data = data;
                }
                Err(e) => {
                    tracing::warn!("Processing '{}' failed: {}", guard.name, e);
                    guard.status = StatusInfo::fail(Stage::Processing, e.to_string());
                    guard.data = SignalData::default();
                }
            }
            guard.status.clone()
        })
    }

    async fn leaf_access(&self, node: &SharedNode) -> StatusInfo {
        {
            let mut guard = node.lock().await;
            if guard.name.is_empty() {
                guard.status = StatusInfo::success(Stage::DataAccess, guard.raw.len());
                return guard.status.clone();
            }
        }
        self.coordinator.refresh(node).await
    }

    async fn fail_composite(&self, node: &SharedNode, stage: Stage, message: String) -> StatusInfo {
        let mut guard = node.lock().await;
        tracing::debug!("'{}' failed through a dependency: {}", guard.name, message);
        guard.status = StatusInfo::fail(stage, message);
        guard.raw = SignalData::default();
        guard.data = SignalData::default();
        guard.status.clone()
    }

    /// Evaluate a composite expression over its children's exposed buffers.
    ///
    /// Alignment works on copies, so the children never see the common grid.
    fn combine(&self, expr: &Expr, inputs: Vec<(String, SignalData)>) -> Result<SignalData, ExprError> {
        let (aliases, signals): (Vec<String>, Vec<SignalData>) = inputs.into_iter().unzip();
        let aligned = self.aligner.align(&signals);
        let grid = aligned.first().map(|s| s.x.clone()).unwrap_or_default();
        let x_unit = aligned.first().map(|s| s.x_unit.clone()).unwrap_or_default();

        let mut scope = Scope::new();
        for (alias, signal) in aliases.into_iter().zip(aligned) {
            scope.bind_ref(alias, Value::Signal(signal));
        }

        let data = match evaluate(expr, &scope)? {
            Value::Signal(signal) => signal,
            Value::Array(y) if y.len() == grid.len() => SignalData::new(grid, y).with_units(x_unit, ""),
            Value::Array(y) => SignalData::new((0..y.len()).map(|i| i as f64).collect(), y),
            Value::Scalar(v) => SignalData::new(grid, vec![v]).with_units(x_unit, ""),
        };
        Ok(data)
    }
}

/// Evaluate the x/y/z output expressions over the node's primary buffers.
fn apply_outputs(node: &SignalNode) -> Result<SignalData, ExprError> {
    let raw = &node.raw;
    let mut scope = Scope::new();
    scope
        .bind_name("x", Value::Array(raw.x.clone()))
        .bind_name("y", Value::Array(raw.y.clone()));
    if let Some(z) = &raw.z {
        scope.bind_name("z", Value::Array(z.clone()));
    }

    let output = |expr: &Option<Expr>, fallback: Option<&Vec<f64>>| -> Result<Option<Vec<f64>>, ExprError> {
        match expr {
            Some(expr) => Ok(Some(into_samples(evaluate(expr, &scope)?))),
            None => Ok(fallback.cloned()),
        }
    };

    let mut data = SignalData {
        x: output(&node.x_expr, Some(&raw.x))?.unwrap_or_default(),
        y: output(&node.y_expr, Some(&raw.y))?.unwrap_or_default(),
        z: output(&node.z_expr, raw.z.as_ref())?,
        x_unit: raw.x_unit.clone(),
        y_unit: raw.y_unit.clone(),
    };
    data.broadcast_scalars();
    Ok(data)
}

fn into_samples(value: Value) -> Vec<f64> {
    match value {
        Value::Scalar(v) => vec![v],
        Value::Array(values) => values,
        Value::Signal(signal) => signal.y,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::access::AccessOptions;
    use crate::application::access::tests::{RampProvider, coordinator};
    use crate::application::align::AlignPolicy;
    use crate::application::signal_node::{NodeSpec, Registry, RequestWindow, set_window};

    fn graph(provider: Arc<RampProvider>) -> SignalGraph {
        SignalGraph::new(
            Arc::new(coordinator(provider, AccessOptions::default())),
            GridAligner::new(AlignPolicy::Union),
        )
    }

    #[tokio::test]
    async fn test_leaf_containment_scenario() {
        let provider = Arc::new(RampProvider::default());
        let graph = graph(provider.clone());
        let node = SignalNode::build(
            NodeSpec::new("X").source("tokamak").range(100.0, 200.0).max_samples(1000),
            &Registry::new(),
        );

        let status = graph.get_data(&node).await;
        assert!(status.is_success());
        assert_eq!(status.num_points, 11);
        assert_eq!(provider.calls(), 1);

        let zoom = |s, e| RequestWindow {
            time_start: Some(s),
            time_end: Some(e),
            max_samples: Some(1000),
            ..RequestWindow::default()
        };
        set_window(&node, zoom(120.0, 150.0)).await;
        assert!(graph.get_data(&node).await.is_success());
        assert_eq!(provider.calls(), 1);

        set_window(&node, zoom(190.0, 250.0)).await;
        assert!(graph.get_data(&node).await.is_success());
        assert_eq!(provider.calls(), 2);
    }

    #[tokio::test]
    async fn test_composite_sum_over_aligned_children() {
        let provider = Arc::new(RampProvider::default());
        let graph = graph(provider.clone());
        let registry = Registry::new();
        let a = SignalNode::build(NodeSpec::new("ip").source("tokamak").alias("A").range(0.0, 10.0), &registry);
        let b = SignalNode::build(NodeSpec::new("ne").source("tokamak").alias("B").range(0.0, 5.0), &registry);
        let sum = SignalNode::build(NodeSpec::new("${A}+${B}").source("tokamak"), &registry);

        let status = graph.get_data(&sum).await;
        assert!(status.is_success(), "{}", status);
        assert_eq!(provider.calls(), 2);

        // 11 integer points from A plus the 5 half-steps B adds below 5.
        let guard = sum.lock().await;
        assert_eq!(guard.data.len(), 16);
        assert_eq!(status.num_points, 16);
        assert_eq!(guard.data.x[2], 1.0);
        assert_eq!(guard.data.y[2], 4.0);
        assert!(guard.data.y[15].is_nan());
        drop(guard);

        let a = a.lock().await;
        let b = b.lock().await;
        assert_eq!(a.data.x, (0..=10).map(f64::from).collect::<Vec<_>>());
        assert_eq!(b.data.x, (0..=10).map(|i| f64::from(i) * 0.5).collect::<Vec<_>>());
        assert_eq!(b.data.y[3], 3.0);
    }

    #[tokio::test]
    async fn test_child_failure_propagates_message() {
        let provider = Arc::new(RampProvider::default());
        provider.fail_variable("ne");
        let graph = graph(provider.clone());
        let parent = SignalNode::build(
            NodeSpec::new("${ip} * ${ne}").source("tokamak").range(0.0, 1.0),
            &Registry::new(),
        );

        let status = graph.get_data(&parent).await;
        assert!(status.is_fail());
        assert_eq!(status.stage, Stage::DataAccess);
        assert_eq!(status.message, "no such signal: ne");

        let guard = parent.lock().await;
        assert!(guard.raw.is_empty());
        assert!(guard.data.is_empty());
    }

    #[tokio::test]
    async fn test_nested_failure_keeps_root_message() {
        let provider = Arc::new(RampProvider::default());
        provider.fail_variable("te");
        let graph = graph(provider.clone());
        let registry = Registry::new();
        SignalNode::build(NodeSpec::new("${te} + 1").source("tokamak").alias("T").range(0.0, 1.0), &registry);
        let top = SignalNode::build(NodeSpec::new("${T} * 2").source("tokamak").range(0.0, 1.0), &registry);

        let status = graph.get_data(&top).await;
        assert!(status.is_fail());
        assert_eq!(status.message, "no such signal: te");
    }

    #[tokio::test]
    async fn test_evaluation_error_fails_processing() {
        let provider = Arc::new(RampProvider::default());
        let graph = graph(provider.clone());
        let node = SignalNode::build(
            NodeSpec::new("sqrt(${ip}, 2)").source("tokamak").range(0.0, 1.0),
            &Registry::new(),
        );

        let status = graph.get_data(&node).await;
        assert!(status.is_fail());
        assert_eq!(status.stage, Stage::Processing);
        assert!(node.lock().await.data.is_empty());
    }

    #[tokio::test]
    async fn test_invalid_node_never_fetches() {
        let provider = Arc::new(RampProvider::default());
        let graph = graph(provider.clone());
        let node = SignalNode::build(NodeSpec::new("${A} + 1"), &Registry::new());

        let status = graph.get_data(&node).await;
        assert!(status.is_invalid());
        assert!(graph.get_data(&node).await.is_invalid());
        assert_eq!(provider.calls(), 0);
    }

    #[tokio::test]
    async fn test_output_expressions_and_scalar_broadcast() {
        let provider = Arc::new(RampProvider::default());
        let graph = graph(provider.clone());
        let registry = Registry::new();
        let doubled = SignalNode::build(
            NodeSpec::new("ip").source("tokamak").range(0.0, 10.0).y_expr("y * 2"),
            &registry,
        );
        let mean = SignalNode::build(
            NodeSpec::new("ip").source("tokamak").range(0.0, 10.0).y_expr("mean(y)"),
            &registry,
        );

        graph.get_data(&doubled).await;
        assert_eq!(doubled.lock().await.data.y[1], 4.0);
        assert_eq!(doubled.lock().await.raw.y[1], 2.0);

        graph.get_data(&mean).await;
        let guard = mean.lock().await;
        assert_eq!(guard.data.y.len(), 11);
        assert!(guard.data.y.iter().all(|v| *v == 10.0));
    }

    #[tokio::test]
    async fn test_local_alias_feeds_composite_without_fetching() {
        let provider = Arc::new(RampProvider::default());
        let graph = graph(provider.clone());
        let registry = Registry::new();
        SignalNode::local(
            NodeSpec::new("gain").alias("G"),
            SignalData::new(vec![0.0, 1.0], vec![3.0, 3.0]),
            &registry,
        );
        let node = SignalNode::build(NodeSpec::new("${G} * 2"), &registry);

        assert!(graph.get_data(&node).await.is_success());
        assert_eq!(node.lock().await.data.y, vec![6.0, 6.0]);
        assert_eq!(provider.calls(), 0);
    }
}
