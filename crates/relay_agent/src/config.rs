//! Agent configuration.
//!
//! Loaded from a JSON file (`AgentConfig::load`) and/or `RELAY_*`
//! environment variables (`AgentConfig::from_env`). Every field has a
//! default, so an empty `{}` is a valid config.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::AgentError;

/// How many inbound messages are processed at once.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Concurrency {
    Concurrent,
    /// Exactly one message in flight.
    Serial,
}

/// What a mediator does with a forward for one of its recipients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ForwardingStrategy {
    QueueOnly,
    QueueAndLiveModeDelivery,
    DirectDelivery,
}

/// How a recipient collects messages from its mediator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PickupStrategy {
    PickUpV1,
    PickUpV2,
    PickUpV2LiveMode,
    Implicit,
    None,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    pub label: String,
    /// Inbound endpoints. Empty means the agent is not reachable and asks
    /// peers to use return routing.
    pub endpoints: Vec<String>,
    pub inbound_concurrency: Concurrency,
    pub auto_accept_mediation_requests: bool,
    pub mediator_forwarding_strategy: ForwardingStrategy,
    pub mediator_pickup_strategy: PickupStrategy,
    pub mediator_polling_interval_ms: u64,
    /// Holder-side batch cap and recipient-side requested limit.
    pub maximum_message_pickup: usize,
    pub reconnect_base_ms: u64,
    pub reconnect_max_ms: u64,
    pub keylist_update_timeout_ms: u64,
    pub mediation_grant_timeout_ms: u64,
    pub pickup_timeout_ms: u64,
    /// Encode keys as did:key in mediation messages.
    pub use_did_key_in_protocols: bool,
    pub queue_database: Option<PathBuf>,
    /// Broadcast buffer for the event bus.
    pub event_capacity: usize,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            label: "relay-agent".into(),
            endpoints: vec![],
            inbound_concurrency: Concurrency::Concurrent,
            auto_accept_mediation_requests: true,
            mediator_forwarding_strategy: ForwardingStrategy::QueueAndLiveModeDelivery,
            mediator_pickup_strategy: PickupStrategy::PickUpV2,
            mediator_polling_interval_ms: 5_000,
            maximum_message_pickup: 10,
            reconnect_base_ms: 2_000,
            reconnect_max_ms: 60_000,
            keylist_update_timeout_ms: 15_000,
            mediation_grant_timeout_ms: 20_000,
            pickup_timeout_ms: 10_000,
            use_did_key_in_protocols: true,
            queue_database: None,
            event_capacity: 1024,
        }
    }
}

impl AgentConfig {
    pub fn load(path: &Path) -> Result<Self, AgentError> {
        let raw = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Defaults overridden by `RELAY_*` variables.
    pub fn from_env() -> Result<Self, AgentError> {
        Self::default().with_env_overrides(|key| std::env::var(key).ok())
    }

    /// Apply overrides from `lookup`; split out so tests need not touch
    /// the process environment.
    pub fn with_env_overrides(mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<Self, AgentError> {
        if let Some(label) = lookup("RELAY_LABEL") {
            self.label = label;
        }
        if let Some(endpoints) = lookup("RELAY_ENDPOINTS") {
            self.endpoints = endpoints
                .split(',')
                .map(str::trim)
                .filter(|e| !e.is_empty())
                .map(String::from)
                .collect();
        }
        if let Some(raw) = lookup("RELAY_INBOUND_CONCURRENCY") {
            self.inbound_concurrency = parse_enum("RELAY_INBOUND_CONCURRENCY", &raw)?;
        }
        if let Some(raw) = lookup("RELAY_FORWARDING_STRATEGY") {
            self.mediator_forwarding_strategy = parse_enum("RELAY_FORWARDING_STRATEGY", &raw)?;
        }
        if let Some(raw) = lookup("RELAY_PICKUP_STRATEGY") {
            self.mediator_pickup_strategy = parse_enum("RELAY_PICKUP_STRATEGY", &raw)?;
        }
        if let Some(raw) = lookup("RELAY_POLLING_INTERVAL_MS") {
            self.mediator_polling_interval_ms = parse_number("RELAY_POLLING_INTERVAL_MS", &raw)?;
        }
        if let Some(raw) = lookup("RELAY_MAXIMUM_MESSAGE_PICKUP") {
            self.maximum_message_pickup = parse_number("RELAY_MAXIMUM_MESSAGE_PICKUP", &raw)?;
        }
        if let Some(path) = lookup("RELAY_QUEUE_DATABASE") {
            self.queue_database = Some(PathBuf::from(path));
        }
        self.validate()?;
        Ok(self)
    }

    pub fn validate(&self) -> Result<(), AgentError> {
        if self.maximum_message_pickup == 0 {
            return Err(AgentError::Config("maximum_message_pickup must be at least 1".into()));
        }
        if self.reconnect_base_ms == 0 || self.reconnect_base_ms > self.reconnect_max_ms {
            return Err(AgentError::Config(
                "reconnect_base_ms must be non-zero and not exceed reconnect_max_ms".into(),
            ));
        }
        if self.mediator_polling_interval_ms == 0 {
            return Err(AgentError::Config("mediator_polling_interval_ms must be non-zero".into()));
        }
        Ok(())
    }

    pub fn polling_interval(&self) -> Duration {
        Duration::from_millis(self.mediator_polling_interval_ms)
    }

    pub fn reconnect_base(&self) -> Duration {
        Duration::from_millis(self.reconnect_base_ms)
    }

    pub fn reconnect_max(&self) -> Duration {
        Duration::from_millis(self.reconnect_max_ms)
    }

    pub fn keylist_update_timeout(&self) -> Duration {
        Duration::from_millis(self.keylist_update_timeout_ms)
    }

    pub fn mediation_grant_timeout(&self) -> Duration {
        Duration::from_millis(self.mediation_grant_timeout_ms)
    }

    pub fn pickup_timeout(&self) -> Duration {
        Duration::from_millis(self.pickup_timeout_ms)
    }

    /// Configured path, or the platform data dir.
    pub fn queue_database_path(&self) -> Result<PathBuf, AgentError> {
        match &self.queue_database {
            Some(path) => Ok(path.clone()),
            None => crate::paths::queue_database_path().map_err(|e| AgentError::Config(e.to_string())),
        }
    }
}

fn parse_enum<T: serde::de::DeserializeOwned>(key: &str, raw: &str) -> Result<T, AgentError> {
    serde_json::from_value(serde_json::Value::String(raw.trim().to_string()))
        .map_err(|_| AgentError::Config(format!("{key}: unrecognised value {raw:?}")))
}

fn parse_number<T: std::str::FromStr>(key: &str, raw: &str) -> Result<T, AgentError> {
    raw.trim()
        .parse()
        .map_err(|_| AgentError::Config(format!("{key}: expected a number, got {raw:?}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn empty_json_yields_defaults() {
        let config: AgentConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config.maximum_message_pickup, 10);
        assert_eq!(config.keylist_update_timeout(), Duration::from_secs(15));
        assert_eq!(config.mediator_pickup_strategy, PickupStrategy::PickUpV2);
    }

    #[test]
    fn env_overrides_apply() {
        let env: HashMap<&str, &str> = [
            ("RELAY_ENDPOINTS", "https://a.example, wss://b.example"),
            ("RELAY_PICKUP_STRATEGY", "PickUpV2LiveMode"),
            ("RELAY_INBOUND_CONCURRENCY", "Serial"),
            ("RELAY_MAXIMUM_MESSAGE_PICKUP", "25"),
        ]
        .into_iter()
        .collect();
        let config = AgentConfig::default()
            .with_env_overrides(|k| env.get(k).map(|v| v.to_string()))
            .unwrap();
        assert_eq!(config.endpoints, vec!["https://a.example", "wss://b.example"]);
        assert_eq!(config.mediator_pickup_strategy, PickupStrategy::PickUpV2LiveMode);
        assert_eq!(config.inbound_concurrency, Concurrency::Serial);
        assert_eq!(config.maximum_message_pickup, 25);
    }

    #[test]
    fn bad_values_are_config_errors() {
        let result = AgentConfig::default().with_env_overrides(|k| {
            (k == "RELAY_PICKUP_STRATEGY").then(|| "Carrier pigeon".to_string())
        });
        assert!(matches!(result, Err(AgentError::Config(_))));

        let zero = AgentConfig { maximum_message_pickup: 0, ..AgentConfig::default() };
        assert!(zero.validate().is_err());
    }

    #[test]
    fn load_reads_json_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("agent.json");
        std::fs::write(&path, r#"{"label":"mediator","endpoints":["ws://localhost:3000"]}"#).unwrap();
        let config = AgentConfig::load(&path).unwrap();
        assert_eq!(config.label, "mediator");
        assert_eq!(config.reconnect_base_ms, 2_000);
    }
}
