//! Server configuration.
//!
//! This module provides configuration management for the tablet server.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use tablet_common::constants::{DEFAULT_PORT, DEFAULT_STREAM_BATCH_ROWS, DEFAULT_STREAM_BUFFER_SIZE};

/// Server configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Host address to bind to.
    #[serde(default = "default_host")]
    pub host: String,

    /// Port to listen on.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Keyspace served by this tablet.
    #[serde(default = "default_keyspace")]
    pub keyspace: String,

    /// Shards served by this tablet, named by key range (`-80`, `80-`).
    #[serde(default = "default_shards")]
    pub shards: Vec<String>,

    /// Report v1 Begin/Commit/Rollback/StreamExecute errors inside the
    /// reply instead of as call failures.
    #[serde(default)]
    pub legacy_errors_in_reply: bool,

    /// Chunks a stream producer may run ahead of its consumer.
    #[serde(default = "default_stream_buffer_size")]
    pub stream_buffer_size: usize,

    /// Maximum rows per streamed chunk.
    #[serde(default = "default_stream_batch_rows")]
    pub stream_batch_rows: usize,

    /// Default deadline for calls that carry none, in milliseconds.
    /// Zero disables it.
    #[serde(default)]
    pub query_timeout_ms: u64,

    /// Idle time after which an open transaction is rolled back.
    #[serde(default = "default_transaction_timeout")]
    pub transaction_timeout_secs: u64,

    /// How often the expiry reaper runs.
    #[serde(default = "default_reaper_interval")]
    pub reaper_interval_ms: u64,

    /// TOML fixture file for the in-memory engine.
    #[serde(default)]
    pub fixtures: Option<PathBuf>,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

fn default_keyspace() -> String {
    "test_keyspace".to_string()
}

fn default_shards() -> Vec<String> {
    vec!["0".to_string()]
}

fn default_stream_buffer_size() -> usize {
    DEFAULT_STREAM_BUFFER_SIZE
}

fn default_stream_batch_rows() -> usize {
    DEFAULT_STREAM_BATCH_ROWS
}

fn default_transaction_timeout() -> u64 {
    30
}

fn default_reaper_interval() -> u64 {
    1000
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            keyspace: default_keyspace(),
            shards: default_shards(),
            legacy_errors_in_reply: false,
            stream_buffer_size: default_stream_buffer_size(),
            stream_batch_rows: default_stream_batch_rows(),
            query_timeout_ms: 0,
            transaction_timeout_secs: default_transaction_timeout(),
            reaper_interval_ms: default_reaper_interval(),
            fixtures: None,
        }
    }
}

impl ServerConfig {
    /// Creates a new default configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads configuration from a file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&content)?;
        Ok(config)
    }

    /// Saves configuration to a file.
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = self.to_toml()?;

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        std::fs::write(path, content)?;
        Ok(())
    }

    /// Converts configuration to TOML string.
    pub fn to_toml(&self) -> Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Returns the socket address.
    pub fn socket_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Default call deadline, if enabled.
    pub fn query_timeout(&self) -> Option<Duration> {
        (self.query_timeout_ms > 0).then(|| Duration::from_millis(self.query_timeout_ms))
    }

    /// Idle limit for open transactions.
    pub fn transaction_timeout(&self) -> Duration {
        Duration::from_secs(self.transaction_timeout_secs)
    }

    /// Interval between reaper passes.
    pub fn reaper_interval(&self) -> Duration {
        Duration::from_millis(self.reaper_interval_ms.max(1))
    }

    /// Creates a builder for configuration.
    pub fn builder() -> ServerConfigBuilder {
        ServerConfigBuilder::new()
    }
}

/// Builder for server configuration.
#[derive(Default)]
pub struct ServerConfigBuilder {
    config: ServerConfig,
}

impl ServerConfigBuilder {
    /// Creates a new builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the host.
    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.config.host = host.into();
        self
    }

    /// Sets the port.
    pub fn port(mut self, port: u16) -> Self {
        self.config.port = port;
        self
    }

    /// Sets the keyspace.
    pub fn keyspace(mut self, keyspace: impl Into<String>) -> Self {
        self.config.keyspace = keyspace.into();
        self
    }

    /// Sets the served shards.
    pub fn shards<I, S>(mut self, shards: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.config.shards = shards.into_iter().map(Into::into).collect();
        self
    }

    /// Selects the legacy error delivery for v1 calls.
    pub fn legacy_errors_in_reply(mut self, enabled: bool) -> Self {
        self.config.legacy_errors_in_reply = enabled;
        self
    }

    /// Sets the stream queue depth.
    pub fn stream_buffer_size(mut self, size: usize) -> Self {
        self.config.stream_buffer_size = size;
        self
    }

    /// Sets the rows per streamed chunk.
    pub fn stream_batch_rows(mut self, rows: usize) -> Self {
        self.config.stream_batch_rows = rows;
        self
    }

    /// Sets the default call deadline.
    pub fn query_timeout_ms(mut self, ms: u64) -> Self {
        self.config.query_timeout_ms = ms;
        self
    }

    /// Sets the transaction idle limit.
    pub fn transaction_timeout_secs(mut self, secs: u64) -> Self {
        self.config.transaction_timeout_secs = secs;
        self
    }

    /// Sets the reaper interval.
    pub fn reaper_interval_ms(mut self, ms: u64) -> Self {
        self.config.reaper_interval_ms = ms;
        self
    }

    /// Sets the fixture file.
    pub fn fixtures(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.fixtures = Some(path.into());
        self
    }

    /// Builds the configuration.
    pub fn build(self) -> ServerConfig {
        self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_default_config() {
        let config = ServerConfig::default();
        assert_eq!(config.host, "0.0.0.0");
        assert_eq!(config.port, DEFAULT_PORT);
        assert_eq!(config.shards, vec!["0".to_string()]);
        assert!(!config.legacy_errors_in_reply);
        assert!(config.query_timeout().is_none());
    }

    #[test]
    fn test_builder() {
        let config = ServerConfig::builder()
            .host("localhost")
            .port(15992)
            .keyspace("ks")
            .shards(["-80", "80-"])
            .legacy_errors_in_reply(true)
            .stream_batch_rows(10)
            .query_timeout_ms(250)
            .build();

        assert_eq!(config.host, "localhost");
        assert_eq!(config.keyspace, "ks");
        assert_eq!(config.shards.len(), 2);
        assert!(config.legacy_errors_in_reply);
        assert_eq!(config.stream_batch_rows, 10);
        assert_eq!(config.query_timeout(), Some(Duration::from_millis(250)));
        assert_eq!(config.socket_addr(), "localhost:15992");
    }

    #[test]
    fn test_to_toml() {
        let toml = ServerConfig::default().to_toml().unwrap();
        assert!(toml.contains("keyspace"));
        assert!(toml.contains("legacy_errors_in_reply"));
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let config: ServerConfig = toml::from_str("port = 1234\nshards = [\"-80\"]").unwrap();
        assert_eq!(config.port, 1234);
        assert_eq!(config.keyspace, "test_keyspace");
        assert_eq!(config.stream_buffer_size, DEFAULT_STREAM_BUFFER_SIZE);
    }

    #[test]
    fn test_save_and_load() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("conf").join("tabletd.toml");

        let config = ServerConfig::builder()
            .host("testhost")
            .port(9999)
            .fixtures("/tmp/fixtures.toml")
            .build();
        config.save(&path).unwrap();

        let loaded = ServerConfig::from_file(&path).unwrap();
        assert_eq!(loaded, config);
    }
}
