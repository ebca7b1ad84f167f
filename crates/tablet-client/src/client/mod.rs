//! Client connection management.
//!
//! Provides [`ClientConfig`] and the [`TabletConn`] connection type.

use std::time::Duration;

use tablet_common::constants::{DEFAULT_PORT, DEFAULT_STREAM_BUFFER_SIZE};

mod conn;

pub use conn::TabletConn;

/// Client configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Server host.
    pub host: String,
    /// Server port.
    pub port: u16,
    /// Connection timeout.
    pub connect_timeout: Duration,
    /// Default per-call timeout, sent to the server with every call. A
    /// caller context with an earlier deadline wins.
    pub call_timeout: Option<Duration>,
    /// Chunks buffered per stream before the connection waits on the
    /// consumer.
    pub stream_buffer_size: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: DEFAULT_PORT,
            connect_timeout: Duration::from_secs(10),
            call_timeout: None,
            stream_buffer_size: DEFAULT_STREAM_BUFFER_SIZE,
        }
    }
}

impl ClientConfig {
    /// Creates a new client configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the host.
    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    /// Sets the port.
    pub fn port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Sets the connection timeout.
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Sets the default call timeout.
    pub fn call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = Some(timeout);
        self
    }

    /// Sets the per-stream buffer size.
    pub fn stream_buffer_size(mut self, size: usize) -> Self {
        self.stream_buffer_size = size.max(1);
        self
    }

    /// Returns the `host:port` address.
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_builder() {
        let config = ClientConfig::new()
            .host("db.example.com")
            .port(16000)
            .call_timeout(Duration::from_secs(5))
            .stream_buffer_size(0);

        assert_eq!(config.address(), "db.example.com:16000");
        assert_eq!(config.call_timeout, Some(Duration::from_secs(5)));
        assert_eq!(config.stream_buffer_size, 1);
    }

    #[test]
    fn test_default_config() {
        let config = ClientConfig::default();
        assert_eq!(config.port, DEFAULT_PORT);
        assert!(config.call_timeout.is_none());
    }
}
