//! Runtime configuration for the topology model.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Tunables shared by the topology, its namespaces and their device actors.
///
/// Every field has a default, so a configuration file only needs to list
/// the values it overrides:
///
/// ```ignore
/// {"peer_retry_delay_ms": 250, "default_namespace": "host"}
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TopologyConfig {
    /// Name under which the host namespace is registered.
    pub default_namespace: String,
    /// Delay before the single retry of a veth peer lookup.
    #[serde(rename = "peer_retry_delay_ms", with = "millis")]
    pub peer_retry_delay: Duration,
    /// Settle time before a destroyed namespace is reclaimed.
    #[serde(rename = "namespace_grace_period_ms", with = "millis")]
    pub namespace_grace_period: Duration,
    /// Capacity of every device actor mailbox.
    pub channel_capacity: usize,
    /// Notifications a channel subscriber may fall behind by before new
    /// ones are dropped.
    pub event_queue_capacity: usize,
}

impl Default for TopologyConfig {
    fn default() -> Self {
        Self {
            default_namespace: "default".to_string(),
            peer_retry_delay: Duration::from_millis(500),
            namespace_grace_period: Duration::from_millis(100),
            channel_capacity: 16,
            event_queue_capacity: 4096,
        }
    }
}

impl TopologyConfig {
    /// Load a configuration from a JSON file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let data = std::fs::read_to_string(path.as_ref())?;
        Self::from_json(&data)
    }

    /// Parse a configuration from a JSON string.
    pub fn from_json(data: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(data)?;
        config.validate()?;
        Ok(config)
    }

    /// Check that the configuration is usable.
    pub fn validate(&self) -> Result<()> {
        if self.channel_capacity == 0 {
            return Err(Error::Config("channel_capacity must be at least 1".into()));
        }
        if self.event_queue_capacity == 0 {
            return Err(Error::Config("event_queue_capacity must be at least 1".into()));
        }
        if self.default_namespace.is_empty() {
            return Err(Error::Config("default_namespace must not be empty".into()));
        }
        Ok(())
    }

    pub fn with_default_namespace(mut self, name: impl Into<String>) -> Self {
        self.default_namespace = name.into();
        self
    }

    pub fn with_peer_retry_delay(mut self, delay: Duration) -> Self {
        self.peer_retry_delay = delay;
        self
    }

    pub fn with_namespace_grace_period(mut self, period: Duration) -> Self {
        self.namespace_grace_period = period;
        self
    }

    pub fn with_channel_capacity(mut self, capacity: usize) -> Self {
        self.channel_capacity = capacity;
        self
    }

    pub fn with_event_queue_capacity(mut self, capacity: usize) -> Self {
        self.event_queue_capacity = capacity;
        self
    }
}

mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
