// Application layer - Use cases and collaborator traits
pub mod access;
pub mod align;
pub mod cache_store;
pub mod data_provider;
pub mod expression;
pub mod signal_graph;
pub mod signal_node;
pub mod signal_service;
pub mod subscription;
