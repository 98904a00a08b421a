pub mod chunker;
pub mod config;
pub mod context_builder;
pub mod embedding;
pub mod error;
pub mod git;
pub mod indexer;
pub mod inspector;
pub mod rate_limiter;
pub mod retriever;
pub mod scanner;
pub mod server;
pub mod taskflow;
pub mod tool_dispatcher;
pub mod types;
pub mod vector_store;
