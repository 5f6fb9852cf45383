//! Error types shared across the engine.
//!
//! Protocol errors live next to the parser (`http::parser::ParseError`);
//! this module holds the resource and configuration errors.

use thiserror::Error;

/// Failure to lease memory from the block pool.
///
/// Pool exhaustion is never retried by the engine. The caller decides
/// whether to shed the connection.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PoolError {
    #[error("memory pool exhausted: {slabs} slabs allocated (limit {limit})")]
    Exhausted { slabs: usize, limit: usize },
}

/// Semantic problem found while validating `ServerOptions`.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("no listen addresses configured")]
    NoAddresses,
    #[error("invalid listen address {0:?}: {1}")]
    InvalidAddress(String, String),
    #[error("{0} must be greater than zero")]
    Zero(&'static str),
    #[error("max_request_buffer_size {size} cannot hold a full request head ({required} bytes)")]
    RequestBufferTooSmall { size: usize, required: usize },
}

/// Error type for configuration loading.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Parse error: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("Validation failed: {}", join(.0))]
    Validation(Vec<ValidationError>),
}

fn join(errors: &[ValidationError]) -> String {
    errors
        .iter()
        .map(|e| e.to_string())
        .collect::<Vec<_>>()
        .join(", ")
}
