//! Call tracker configuration

use std::time::Duration;

use crate::protocol::FeedbackKey;

/// Builds the command that joins a new call to a held one
pub type JoinCommandFn = fn(held: &str, new: &str) -> String;

fn xapi_join_command(held: &str, new: &str) -> String {
    format!("xCommand Call Join CallId: {} CallId: {}", held, new)
}

/// Call tracker configuration options
#[derive(Clone)]
pub struct CallTrackerConfig {
    /// Feedback key carrying every call (per-call keys are derived from it)
    pub call_key: FeedbackKey,

    /// How long a cached number → name mapping stays valid
    pub name_cache_ttl: Duration,

    /// Maximum number of cached names
    pub name_cache_capacity: usize,

    /// Join each new call to the first call found on hold
    pub join_held_calls: bool,

    /// Command used for the join
    pub join_command: JoinCommandFn,

    /// Capacity of the call event broadcast channel
    pub event_channel_capacity: usize,
}

impl Default for CallTrackerConfig {
    fn default() -> Self {
        Self {
            call_key: FeedbackKey::parse("status/call"),
            name_cache_ttl: Duration::from_secs(24 * 60 * 60),
            name_cache_capacity: 1024,
            join_held_calls: true,
            join_command: xapi_join_command,
            event_channel_capacity: 64,
        }
    }
}

impl std::fmt::Debug for CallTrackerConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallTrackerConfig")
            .field("call_key", &self.call_key)
            .field("name_cache_ttl", &self.name_cache_ttl)
            .field("name_cache_capacity", &self.name_cache_capacity)
            .field("join_held_calls", &self.join_held_calls)
            .field("event_channel_capacity", &self.event_channel_capacity)
            .finish_non_exhaustive()
    }
}

impl CallTrackerConfig {
    /// Settings for the tagged JSON family
    ///
    /// Calls arrive under `zStatus/CallStatus`. The family has no held-call
    /// join command, so joining is off.
    pub fn json() -> Self {
        Self::default()
            .call_key(FeedbackKey::parse("zStatus/CallStatus"))
            .join_held_calls(false)
    }

    /// Set the call feedback key
    pub fn call_key(mut self, key: FeedbackKey) -> Self {
        self.call_key = key;
        self
    }

    /// Set the name cache expiry
    pub fn name_cache_ttl(mut self, ttl: Duration) -> Self {
        self.name_cache_ttl = ttl;
        self
    }

    /// Set the name cache capacity
    pub fn name_cache_capacity(mut self, capacity: usize) -> Self {
        self.name_cache_capacity = capacity;
        self
    }

    /// Enable or disable joining new calls to held calls
    pub fn join_held_calls(mut self, enabled: bool) -> Self {
        self.join_held_calls = enabled;
        self
    }

    /// Override the join command
    pub fn join_command(mut self, f: JoinCommandFn) -> Self {
        self.join_command = f;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = CallTrackerConfig::default();
        assert_eq!(config.call_key, FeedbackKey::parse("Status/Call"));
        assert!(config.join_held_calls);
        assert_eq!(
            (config.join_command)("1", "2"),
            "xCommand Call Join CallId: 1 CallId: 2"
        );
    }

    #[test]
    fn test_builder() {
        let config = CallTrackerConfig::default()
            .join_held_calls(false)
            .name_cache_capacity(3)
            .join_command(|held, new| format!("join {} {}", held, new));

        assert!(!config.join_held_calls);
        assert_eq!(config.name_cache_capacity, 3);
        assert_eq!((config.join_command)("a", "b"), "join a b");
    }

    #[test]
    fn test_json_preset() {
        let config = CallTrackerConfig::json();
        assert_eq!(config.call_key, FeedbackKey::new(["zstatus", "callstatus"]));
        assert!(!config.join_held_calls);
    }
}
