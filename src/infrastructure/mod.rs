// Infrastructure layer - External dependencies and adapters
pub mod blob_store;
pub mod config;
pub mod event_stream;
pub mod http_provider;
