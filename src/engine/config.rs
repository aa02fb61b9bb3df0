//! Engine configuration

use std::time::Duration;

use crate::protocol::framer::DEFAULT_MAX_BUFFER_SIZE;

/// Minimum resync interval accepted by the builder
pub const MIN_RESYNC_INTERVAL: Duration = Duration::from_secs(10);

/// Engine configuration options
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Endpoint label passed to callbacks as the feedback source
    pub name: String,

    /// Maximum size of a buffered partial frame before it is discarded
    pub max_buffer_size: usize,

    /// Interval between subscription resync probes
    pub resync_interval: Duration,

    /// Whether the resync monitor runs at all
    pub resync_enabled: bool,

    /// Pending commands older than this are pruned on each resync tick
    pub command_timeout: Duration,

    /// Transport read buffer size
    pub read_buffer_size: usize,

    /// Capacity of the protocol error broadcast channel
    pub error_channel_capacity: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            name: "codec".to_string(),
            max_buffer_size: DEFAULT_MAX_BUFFER_SIZE,
            resync_interval: Duration::from_secs(5 * 60),
            resync_enabled: true,
            command_timeout: Duration::from_secs(60),
            read_buffer_size: 16 * 1024, // 16KB
            error_channel_capacity: 64,
        }
    }
}

impl EngineConfig {
    /// Create a new config with a custom endpoint label
    pub fn with_name(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    /// Set the endpoint label
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Set the framer buffer limit
    pub fn max_buffer_size(mut self, size: usize) -> Self {
        self.max_buffer_size = size;
        self
    }

    /// Set the resync interval
    pub fn resync_interval(mut self, interval: Duration) -> Self {
        self.resync_interval = interval.max(MIN_RESYNC_INTERVAL);
        self
    }

    /// Disable the resync monitor
    pub fn disable_resync(mut self) -> Self {
        self.resync_enabled = false;
        self
    }

    /// Set the pending command timeout
    pub fn command_timeout(mut self, timeout: Duration) -> Self {
        self.command_timeout = timeout;
        self
    }

    /// Set the transport read buffer size
    pub fn read_buffer_size(mut self, size: usize) -> Self {
        self.read_buffer_size = size;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = EngineConfig::default();

        assert_eq!(config.name, "codec");
        assert_eq!(config.max_buffer_size, DEFAULT_MAX_BUFFER_SIZE);
        assert_eq!(config.resync_interval, Duration::from_secs(300));
        assert!(config.resync_enabled);
    }

    #[test]
    fn test_resync_interval_floor() {
        let config = EngineConfig::default().resync_interval(Duration::from_millis(1));

        assert_eq!(config.resync_interval, MIN_RESYNC_INTERVAL);
    }

    #[test]
    fn test_builder_chaining() {
        let config = EngineConfig::with_name("room-1")
            .max_buffer_size(4096)
            .command_timeout(Duration::from_secs(5))
            .read_buffer_size(1024)
            .disable_resync();

        assert_eq!(config.name, "room-1");
        assert_eq!(config.max_buffer_size, 4096);
        assert_eq!(config.command_timeout, Duration::from_secs(5));
        assert_eq!(config.read_buffer_size, 1024);
        assert!(!config.resync_enabled);
    }
}
