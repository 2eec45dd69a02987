// Signal service - Plot bindings and live subscriptions per data source
use crate::application::signal_graph::SignalGraph;
use crate::application::signal_node::{NodeSpec, Registry, RequestWindow, SharedNode, SignalNode, set_window};
use crate::application::subscription::{
    EventTransport, StreamError, StreamingOptions, SubscriptionManager, SubscriptionStatus, VariableSpec,
};
use crate::domain::{FetchResult, SignalData, StatusInfo, TimeFormat};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;

/// One plot binding request.
#[derive(Debug, Clone, Deserialize)]
pub struct SignalQuery {
    pub source: Option<String>,
    pub name: String,
    pub alias: Option<String>,
    pub start: Option<f64>,
    pub end: Option<f64>,
    pub pulse: Option<i64>,
    pub max_samples: Option<usize>,
    #[serde(default)]
    pub envelope: bool,
    #[serde(default)]
    pub absolute: bool,
}

impl SignalQuery {
    fn binding(&self) -> BindingKey {
        BindingKey {
            source: self.source.clone(),
            name: self.name.clone(),
            alias: self.alias.clone(),
            envelope: self.envelope,
            absolute: self.absolute,
        }
    }

    fn window(&self) -> RequestWindow {
        RequestWindow {
            time_start: self.start,
            time_end: self.end,
            pulse_id: self.pulse,
            max_samples: self.max_samples,
        }
    }

    fn spec(&self) -> NodeSpec {
        let mut spec = NodeSpec::new(self.name.clone()).envelope(self.envelope);
        spec.window = self.window();
        if self.absolute {
            spec = spec.time_format(TimeFormat::Absolute);
        }
        if let Some(source) = &self.source {
            spec = spec.source(source.clone());
        }
        if let Some(alias) = &self.alias {
            spec = spec.alias(alias.clone());
        }
        spec
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct BindingKey {
    source: Option<String>,
    name: String,
    alias: Option<String>,
    envelope: bool,
    absolute: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct SignalResponse {
    pub status: StatusInfo,
    pub downsampled: bool,
    pub data: SignalData,
}

pub struct SignalService {
    graph: SignalGraph,
    registry: Registry,
    bindings: Mutex<HashMap<BindingKey, SharedNode>>,
    transport: Arc<dyn EventTransport>,
    streaming: StreamingOptions,
    subscriptions: Mutex<HashMap<String, Arc<SubscriptionManager>>>,
}

impl SignalService {
    pub fn new(graph: SignalGraph, transport: Arc<dyn EventTransport>, streaming: StreamingOptions) -> Self {
        Self {
            graph,
            registry: Registry::new(),
            bindings: Mutex::new(HashMap::new()),
            transport,
            streaming,
            subscriptions: Mutex::new(HashMap::new()),
        }
    }

    /// Refresh the node bound to `query`, creating it on first use.
    pub async fn query(&self, query: SignalQuery) -> SignalResponse {
        let node = {
            let mut bindings = self.bindings.lock().await;
            match bindings.get(&query.binding()) {
                Some(node) => node.clone(),
                None => {
                    tracing::debug!("New binding for '{}'", query.name);
                    let node = SignalNode::build(query.spec(), &self.registry);
                    bindings.insert(query.binding(), node.clone());
                    node
                }
            }
        };

        let window = query.window();
        let changed = node.lock().await.window != window;
        if changed {
            set_window(&node, window).await;
        }

        let status = self.graph.get_data(&node).await;
        let guard = node.lock().await;
        SignalResponse {
            status,
            downsampled: guard.downsampled,
            data: guard.data.clone(),
        }
    }

    /// Drop the node bound to `query` and withdraw its alias.
    ///
    /// Composite nodes already holding the aliased node keep it alive.
    pub async fn release(&self, query: &SignalQuery) -> bool {
        let removed = self.bindings.lock().await.remove(&query.binding());
        if let (Some(_), Some(alias)) = (&removed, &query.alias) {
            self.registry.remove(alias);
        }
        removed.is_some()
    }

    pub async fn start_live(&self, source: &str, variables: Vec<VariableSpec>) -> Result<(), StreamError> {
        let manager = {
            let mut subscriptions = self.subscriptions.lock().await;
            subscriptions
                .entry(source.to_string())
                .or_insert_with(|| {
                    Arc::new(SubscriptionManager::new(
                        source,
                        self.transport.clone(),
                        self.streaming.clone(),
                    ))
                })
                .clone()
        };
        manager.start_subscription(variables).await
    }

    pub async fn clear_cache(&self) {
        self.graph.clear_cache().await;
    }

    /// Next queued sample and the number still waiting behind it, or `None`
    /// when `source` has no subscription.
    pub async fn next_live(&self, source: &str, variable: &str) -> Option<(FetchResult, usize)> {
        let manager = self.subscriptions.lock().await.get(source).cloned()?;
        let sample = manager.get_next_data(variable);
        Some((sample, manager.pending(variable)))
    }

    pub async fn live_status(&self, source: &str) -> Option<SubscriptionStatus> {
        let manager = self.subscriptions.lock().await.get(source).cloned()?;
        Some(manager.status())
    }

    /// Request a stop; with `wait` the call resolves after the reader exits.
    pub async fn stop_live(&self, source: &str, wait: bool) -> Option<SubscriptionStatus> {
        let manager = self.subscriptions.lock().await.get(source).cloned()?;
        manager.stop_subscription();
        if wait {
            Some(manager.wait_stopped().await)
        } else {
            Some(manager.status())
        }
    }
}
