// Signal access and processing pipeline
pub mod application;
pub mod domain;
pub mod infrastructure;
pub mod presentation;
