//! Server configuration.

use std::path::PathBuf;
use std::time::Duration;

/// Configuration for the collaboration server.
#[derive(Clone, Debug)]
pub struct ServerConfig {
    /// Interface to listen on.
    pub host: String,
    /// Port to listen on.
    pub port: u16,
    /// Where instances are persisted (when file storage is used).
    pub save_file: PathBuf,
    /// Maximum number of live instances before the least recently used is evicted.
    pub max_instances: usize,
    /// Number of steps retained per instance for incremental sync.
    pub max_step_history: usize,
    /// Quiet period before a persistence flush (in milliseconds).
    pub save_interval_ms: u64,
    /// Debounce window for recounting active users (in milliseconds).
    pub user_collect_interval_ms: u64,
    /// How long a long poll is held open before a keepalive (in milliseconds).
    pub poll_timeout_ms: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8000,
            save_file: PathBuf::from("instances.json"),
            max_instances: 20,
            max_step_history: 10_000,
            save_interval_ms: 10_000,
            user_collect_interval_ms: 5_000,
            poll_timeout_ms: 5 * 60 * 1000,
        }
    }
}

impl ServerConfig {
    pub fn builder() -> ServerConfigBuilder {
        ServerConfigBuilder::new()
    }

    /// `host:port` as given.
    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn save_interval(&self) -> Duration {
        Duration::from_millis(self.save_interval_ms)
    }

    pub fn user_collect_interval(&self) -> Duration {
        Duration::from_millis(self.user_collect_interval_ms)
    }

    pub fn poll_timeout(&self) -> Duration {
        Duration::from_millis(self.poll_timeout_ms)
    }
}

/// Builder for server configuration.
pub struct ServerConfigBuilder {
    config: ServerConfig,
}

impl ServerConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: ServerConfig::default(),
        }
    }

    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.config.host = host.into();
        self
    }

    pub fn port(mut self, port: u16) -> Self {
        self.config.port = port;
        self
    }

    pub fn save_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.save_file = path.into();
        self
    }

    pub fn max_instances(mut self, max: usize) -> Self {
        self.config.max_instances = max;
        self
    }

    pub fn max_step_history(mut self, max: usize) -> Self {
        self.config.max_step_history = max;
        self
    }

    pub fn save_interval(mut self, ms: u64) -> Self {
        self.config.save_interval_ms = ms;
        self
    }

    pub fn user_collect_interval(mut self, ms: u64) -> Self {
        self.config.user_collect_interval_ms = ms;
        self
    }

    pub fn poll_timeout(mut self, ms: u64) -> Self {
        self.config.poll_timeout_ms = ms;
        self
    }

    pub fn build(self) -> ServerConfig {
        self.config
    }
}

impl Default for ServerConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}
