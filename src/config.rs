//! Server options.
//!
//! Options come from an optional YAML file named by `H1LOOP_CONFIG`; every
//! field has a default, so the file only lists what it changes. `LISTEN`
//! overrides the address list with a comma separated value.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, ValidationError};
use crate::server::address::ServerAddress;

pub const CONFIG_ENV: &str = "H1LOOP_CONFIG";
pub const LISTEN_ENV: &str = "LISTEN";

/// Raw-stream filter applied to accepted connections.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum FilterKind {
    #[default]
    None,
    Logging,
}

/// Limits on the request head.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RequestLimits {
    /// Longest request line, CRLF included.
    pub max_request_line_size: usize,
    /// Total bytes of all header lines.
    pub max_request_headers_size: usize,
    pub max_request_header_count: usize,
}

impl Default for RequestLimits {
    fn default() -> Self {
        Self {
            max_request_line_size: 8 * 1024,
            max_request_headers_size: 32 * 1024,
            max_request_header_count: 100,
        }
    }
}

impl RequestLimits {
    /// Largest head the limits admit: request line, header lines and the
    /// blank line that ends them.
    pub fn max_head_size(&self) -> usize {
        self.max_request_line_size
            .saturating_add(self.max_request_headers_size)
            .saturating_add(2)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct PoolOptions {
    /// Upper bound on slabs; unbounded when absent.
    pub max_slabs: Option<usize>,
}

/// Everything the engine needs to run.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ServerOptions {
    /// Listen addresses (e.g. "127.0.0.1:8080", "http://unix:/tmp/h1.sock").
    pub addresses: Vec<String>,

    /// Number of event-loop threads.
    pub thread_count: usize,

    /// Unconsumed request bytes buffered before reads pause.
    pub max_request_buffer_size: Option<usize>,

    /// Unflushed response bytes buffered before writers wait and reads pause.
    pub max_response_buffer_size: Option<usize>,

    /// Grace period for in-flight requests on shutdown.
    pub shutdown_timeout_secs: u64,

    /// Set `TCP_NODELAY` on accepted sockets.
    pub no_delay: bool,

    /// Send `Server: h1loop` on every response.
    pub add_server_header: bool,

    pub filter: FilterKind,

    pub limits: RequestLimits,

    pub pool: PoolOptions,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            addresses: vec!["127.0.0.1:8080".to_string()],
            thread_count: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1),
            max_request_buffer_size: Some(1024 * 1024),
            max_response_buffer_size: Some(64 * 1024),
            shutdown_timeout_secs: 5,
            no_delay: true,
            add_server_header: true,
            filter: FilterKind::None,
            limits: RequestLimits::default(),
            pool: PoolOptions::default(),
        }
    }
}

impl ServerOptions {
    /// Defaults, overlaid by the file in `H1LOOP_CONFIG` and then `LISTEN`.
    pub fn load() -> Result<Self, ConfigError> {
        let mut options = match std::env::var(CONFIG_ENV) {
            Ok(path) => ServerOptions::from_yaml(&std::fs::read_to_string(path)?)?,
            Err(_) => ServerOptions::default(),
        };
        options.apply_env();
        options.validate().map_err(ConfigError::Validation)?;
        Ok(options)
    }

    pub fn from_yaml(content: &str) -> Result<Self, ConfigError> {
        Ok(serde_yaml::from_str(content)?)
    }

    /// Apply environment overrides.
    pub fn apply_env(&mut self) {
        if let Ok(listen) = std::env::var(LISTEN_ENV) {
            let addresses: Vec<String> = listen
                .split(',')
                .map(str::trim)
                .filter(|a| !a.is_empty())
                .map(String::from)
                .collect();
            if !addresses.is_empty() {
                self.addresses = addresses;
            }
        }
    }

    /// Collect every semantic problem, not just the first.
    pub fn validate(&self) -> Result<(), Vec<ValidationError>> {
        let mut errors = Vec::new();

        if self.addresses.is_empty() {
            errors.push(ValidationError::NoAddresses);
        }
        for address in &self.addresses {
            if let Err(e) = ServerAddress::parse(address) {
                errors.push(ValidationError::InvalidAddress(address.clone(), e.to_string()));
            }
        }

        if self.thread_count == 0 {
            errors.push(ValidationError::Zero("thread_count"));
        }
        if self.max_request_buffer_size == Some(0) {
            errors.push(ValidationError::Zero("max_request_buffer_size"));
        }
        if self.max_response_buffer_size == Some(0) {
            errors.push(ValidationError::Zero("max_response_buffer_size"));
        }
        if self.pool.max_slabs == Some(0) {
            errors.push(ValidationError::Zero("pool.max_slabs"));
        }

        let limits = &self.limits;
        if limits.max_request_line_size == 0 {
            errors.push(ValidationError::Zero("limits.max_request_line_size"));
        }
        if limits.max_request_headers_size == 0 {
            errors.push(ValidationError::Zero("limits.max_request_headers_size"));
        }
        if limits.max_request_header_count == 0 {
            errors.push(ValidationError::Zero("limits.max_request_header_count"));
        }

        // Reads pause once this much is buffered, so a head the parser is
        // still waiting on must fit or the connection stalls.
        if let Some(size) = self.max_request_buffer_size.filter(|&s| s > 0) {
            let required = limits.max_head_size();
            if size < required {
                errors.push(ValidationError::RequestBufferTooSmall { size, required });
            }
        }

        if errors.is_empty() { Ok(()) } else { Err(errors) }
    }

    /// Parsed listen addresses. Call after `validate`.
    pub fn server_addresses(&self) -> Result<Vec<ServerAddress>, ConfigError> {
        self.addresses
            .iter()
            .map(|a| {
                ServerAddress::parse(a).map_err(|e| {
                    ConfigError::Validation(vec![ValidationError::InvalidAddress(
                        a.clone(),
                        e.to_string(),
                    )])
                })
            })
            .collect()
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }
}

/// Load and validate options from a YAML file.
pub fn load_config(path: &Path) -> Result<ServerOptions, ConfigError> {
    let content = std::fs::read_to_string(path)?;
    let options = ServerOptions::from_yaml(&content)?;
    options.validate().map_err(ConfigError::Validation)?;
    Ok(options)
}
