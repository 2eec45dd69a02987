// Main entry point - Dependency injection and server setup
use std::{net::SocketAddr, sync::Arc};

use anyhow::Context;
use signal_pipeline::application::access::AccessCoordinator;
use signal_pipeline::application::align::GridAligner;
use signal_pipeline::application::cache_store::{BlobCache, CacheStore, MemoryCache};
use signal_pipeline::application::signal_graph::SignalGraph;
use signal_pipeline::application::signal_service::SignalService;
use signal_pipeline::infrastructure::blob_store::FileBlobStore;
use signal_pipeline::infrastructure::config::{CacheKind, load_config};
use signal_pipeline::infrastructure::event_stream::HttpEventTransport;
use signal_pipeline::infrastructure::http_provider::HttpDataProvider;
use signal_pipeline::presentation::app_state::AppState;
use signal_pipeline::presentation::handlers::router;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    // Load configuration
    let config = load_config()?;
    tracing::info!("Effective configuration:\n{}", config.to_redacted_toml()?);

    // Create adapters (infrastructure layer)
    let provider = Arc::new(HttpDataProvider::new(&config.provider));
    let cache: Arc<dyn CacheStore> = match config.cache.kind {
        CacheKind::Memory => Arc::new(MemoryCache::new(config.cache.capacity)),
        CacheKind::Blob => Arc::new(BlobCache::new(FileBlobStore::open(&config.cache.dir).await?)),
    };
    let transport = Arc::new(HttpEventTransport::new(&config.streaming.url));

    // Create services (application layer)
    let coordinator = Arc::new(AccessCoordinator::new(provider, cache, config.access.clone()));
    let graph = SignalGraph::new(coordinator, GridAligner::new(config.alignment.policy));
    let signal_service = SignalService::new(graph, transport, config.streaming.clone());

    let state = Arc::new(AppState { signal_service });

    // Start server
    let addr: SocketAddr = config
        .server
        .addr
        .parse()
        .with_context(|| format!("Invalid server address {}", config.server.addr))?;
    tracing::info!("Starting signal-pipeline service on {}", addr);

    axum::serve(tokio::net::TcpListener::bind(addr).await?, router(state)).await?;

    Ok(())
}
