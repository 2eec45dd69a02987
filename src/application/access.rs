// Access coordinator - Fetch, refresh policy and cache write-through
use crate::application::cache_store::CacheStore;
use crate::application::data_provider::{DataProvider, EnvelopeBound, ProviderError};
use crate::application::signal_node::{SharedNode, SignalNode};
use crate::domain::{FetchRequest, FetchResult, Stage, StatusInfo};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct AccessOptions {
    /// Sample budget for nodes that do not set their own.
    pub default_max_samples: usize,
    /// Budget used for the single retry after a sample-limit rejection.
    pub fallback_max_samples: usize,
    /// Refetch on every range change instead of reusing contained data.
    pub honor_sample_count: bool,
    /// Concurrency bound for [`AccessCoordinator::fetch_many`].
    pub max_concurrent_fetches: usize,
}

impl Default for AccessOptions {
    fn default() -> Self {
        Self {
            default_max_samples: 10_000,
            fallback_max_samples: 2_000,
            honor_sample_count: false,
            max_concurrent_fetches: 4,
        }
    }
}

pub struct AccessCoordinator {
    provider: Arc<dyn DataProvider>,
    cache: Arc<dyn CacheStore>,
    options: AccessOptions,
}

impl AccessCoordinator {
    pub fn new(
        provider: Arc<dyn DataProvider>,
        cache: Arc<dyn CacheStore>,
        options: AccessOptions,
    ) -> Self {
        Self {
            provider,
            cache,
            options,
        }
    }

    /// Drop every stored result. Node buffers are left alone.
    pub async fn clear_cache(&self) {
        self.cache.clear().await;
        tracing::info!("Result cache cleared");
    }

    /// Decide whether `node` must go back to the provider, recording the
    /// current range hash as a side effect.
    pub fn needs_refresh(&self, node: &mut SignalNode) -> bool {
        if !node.data_access {
            return false;
        }

        let target = node.window.hash();
        match node.last_fetch_hash.replace(target) {
            None => true,
            Some(previous) if previous == target => false,
            Some(_) if self.options.honor_sample_count || node.downsampled => true,
            Some(_) => {
                let contained = node.contains_window();
                if contained {
                    tracing::debug!("'{}' range is inside fetched data, reusing buffers", node.name);
                }
                !contained
            }
        }
    }

    /// Data-access phase for a leaf: refresh when the policy asks for it,
    /// otherwise keep the current buffers and report success.
    pub async fn refresh(&self, node: &SharedNode) -> StatusInfo {
        {
            let mut guard = node.lock().await;
            if guard.status.is_busy() {
                return guard.status.clone();
            }
            if !self.needs_refresh(&mut guard) {
                let points = guard.raw.len();
                guard.status = StatusInfo::success(Stage::DataAccess, points);
                return guard.status.clone();
            }
        }

        self.fetch(node).await;
        node.lock().await.status.clone()
    }

    /// Fetch `node`'s data and store it on the node.
    ///
    /// Returns at once when the node already has a fetch in flight. The node
    /// lock is released while the provider is working.
    pub async fn fetch(&self, node: &SharedNode) {
        let request = {
            let mut guard = node.lock().await;
            if guard.status.is_busy() {
                tracing::debug!("'{}' already has a fetch in flight", guard.name);
                return;
            }
            guard.status = StatusInfo::busy(Stage::DataAccess);
            guard.build_request(self.options.default_max_samples)
        };

        let outcome = self.fetch_request(&request).await;

        let mut guard = node.lock().await;
        match outcome {
            Ok(result) => {
                guard.downsampled = result.is_downsampled;
                guard.status = StatusInfo::success(Stage::DataAccess, result.len());
                guard.raw = result.into();
            }
            Err(e) => {
                tracing::warn!(
                    "Fetch of '{}' from {} failed (code {}): {}",
                    request.variable,
                    self.provider.name(),
                    e.code(),
                    e
                );
                guard.status = StatusInfo::fail(Stage::DataAccess, e.to_string());
                guard.raw = Default::default();
                // Forget the range so the next cycle tries again.
                guard.last_fetch_hash = None;
            }
        }
    }

    /// Pooled mode: refresh several leaves with bounded concurrency.
    pub async fn fetch_many(&self, nodes: &[SharedNode]) -> Vec<StatusInfo> {
        let limit = self.options.max_concurrent_fetches.max(1);
        futures::stream::iter(nodes)
            .map(|node| self.refresh(node))
            .buffered(limit)
            .collect()
            .await
    }

    /// Cache lookup, then provider call with write-through on success.
    pub async fn fetch_request(&self, request: &FetchRequest) -> Result<FetchResult, ProviderError> {
        let key = request.cache_key();
        if let Some(hit) = self.cache.get(&key).await {
            tracing::debug!("Cache hit for '{}' ({})", request.variable, key);
            return Ok(hit);
        }
        tracing::debug!("Cache miss for '{}' ({})", request.variable, key);

        let result = if request.want_envelope {
            self.fetch_envelope(request).await?
        } else {
            self.fetch_with_fallback(request, None).await?
        };

        self.cache.put(key, result.clone()).await;
        Ok(result)
    }

    async fn fetch_envelope(&self, request: &FetchRequest) -> Result<FetchResult, ProviderError> {
        let min = match self.fetch_with_fallback(request, Some(EnvelopeBound::Min)).await {
            Ok(min) => min,
            Err(e) => {
                tracing::warn!("Envelope minimum for '{}' failed, continuing without it: {}", request.variable, e);
                FetchResult::empty()
            }
        };
        let max = self.fetch_with_fallback(request, Some(EnvelopeBound::Max)).await?;

        Ok(FetchResult {
            is_downsampled: min.is_downsampled || max.is_downsampled,
            x: max.x,
            y: min.y,
            z: Some(max.y),
            x_unit: max.x_unit,
            y_unit: max.y_unit,
            error_code: 0,
            error_message: String::new(),
        })
    }

    async fn fetch_with_fallback(
        &self,
        request: &FetchRequest,
        bound: Option<EnvelopeBound>,
    ) -> Result<FetchResult, ProviderError> {
        match self.call(request, bound).await {
            Err(e) if e.is_sample_limit() => {
                let reduced = request.with_max_samples(self.options.fallback_max_samples.min(request.max_samples));
                tracing::warn!(
                    "'{}' exceeds the provider sample limit, retrying with {} samples",
                    request.variable,
                    reduced.max_samples
                );
                let mut result = checked(self.call(&reduced, bound).await?)?;
                result.is_downsampled = true;
                Ok(result)
            }
            other => checked(other?),
        }
    }

    async fn call(
        &self,
        request: &FetchRequest,
        bound: Option<EnvelopeBound>,
    ) -> Result<FetchResult, ProviderError> {
        match bound {
            Some(bound) => self.provider.fetch_envelope(request, bound).await,
            None => self.provider.fetch(request).await,
        }
    }
}

/// Turn an in-band error code into an error.
fn checked(result: FetchResult) -> Result<FetchResult, ProviderError> {
    if result.is_ok() {
        Ok(result)
    } else {
        Err(ProviderError::Rejected {
            code: result.error_code,
            message: result.error_message,
        })
    }
}
