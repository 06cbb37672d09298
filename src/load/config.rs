use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ScenarioKind {
    Command,
    Notification,
    Message,
}

/// One entry of `loadTests.tests`.
#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(rename_all = "camelCase")]
pub struct ScenarioConfig {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: ScenarioKind,
    #[serde(default)]
    pub devices: usize,
    #[serde(default = "default_clients", alias = "connections")]
    pub clients: usize,
    /// Messages sent across all clients.
    #[serde(alias = "commands", alias = "notifications", alias = "messages")]
    pub total: usize,
    #[serde(default = "default_interval_millis")]
    pub interval_millis: u64,
    #[serde(default = "default_wait_delay")]
    pub wait_delay: u64,
    #[serde(default = "default_names")]
    pub names: Vec<String>,
    #[serde(default)]
    pub parameters: Value,
    /// Request body with `{#name}`, `{#deviceId}`, `{#deviceIds}` and
    /// `{#requestId}` placeholders. Each kind has a default.
    #[serde(default)]
    pub template: Option<Value>,
    /// Action sent by `message` scenarios.
    #[serde(default)]
    pub action: Option<String>,
    #[serde(default = "default_reply_timeout_millis")]
    pub reply_timeout_millis: u64,
    #[serde(default)]
    pub max_duration_millis: Option<u64>,
}

fn default_clients() -> usize {
    1
}

fn default_interval_millis() -> u64 {
    1000
}

fn default_wait_delay() -> u64 {
    5000
}

fn default_names() -> Vec<String> {
    vec!["load-test".to_string()]
}

fn default_reply_timeout_millis() -> u64 {
    5000
}

impl ScenarioConfig {
    pub fn new(name: &str, kind: ScenarioKind) -> Self {
        ScenarioConfig {
            name: name.to_string(),
            kind,
            devices: 0,
            clients: default_clients(),
            total: 0,
            interval_millis: default_interval_millis(),
            wait_delay: default_wait_delay(),
            names: default_names(),
            parameters: Value::Null,
            template: None,
            action: None,
            reply_timeout_millis: default_reply_timeout_millis(),
            max_duration_millis: None,
        }
    }

    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_millis.max(1))
    }

    pub fn wait_delay(&self) -> Duration {
        Duration::from_millis(self.wait_delay.max(1))
    }

    pub fn reply_timeout(&self) -> Duration {
        Duration::from_millis(self.reply_timeout_millis)
    }

    pub fn max_duration(&self) -> Option<Duration> {
        self.max_duration_millis.map(Duration::from_millis)
    }

    /// Names device `index` subscribes to: the first `(index mod n) + 1`.
    pub fn names_for_device(&self, index: usize) -> &[String] {
        if self.names.is_empty() {
            return &[];
        }

        let count = (index % self.names.len()) + 1;
        &self.names[..count]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn devices_subscribe_to_staggered_name_subsets() {
        let mut config = ScenarioConfig::new("staggered", ScenarioKind::Notification);
        config.names = vec!["a".into(), "b".into(), "c".into()];

        assert_eq!(config.names_for_device(0), ["a"]);
        assert_eq!(config.names_for_device(1), ["a", "b"]);
        assert_eq!(config.names_for_device(2), ["a", "b", "c"]);
        assert_eq!(config.names_for_device(3), ["a"]);
    }

    #[test]
    fn zero_interval_is_clamped() {
        let mut config = ScenarioConfig::new("fast", ScenarioKind::Message);
        config.interval_millis = 0;

        assert_eq!(config.interval(), Duration::from_millis(1));
    }
}
