use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use log::debug;
use serde_json::{json, Value};
use uuid::Uuid;

use crate::connection::Connection;
use crate::error::Result;
use crate::message::Message;
use crate::subscription::{self, Filter, Subscription, SubscriptionKind};

use super::config::{ScenarioConfig, ScenarioKind};
use super::template::{self, Placeholders};

/// A simulated device taking part in a scenario.
#[derive(Clone, Debug)]
pub struct Device {
    pub index: usize,
    pub id: String,
    pub names: Vec<String>,
}

impl Device {
    pub fn new(index: usize, config: &ScenarioConfig) -> Self {
        Device {
            index,
            id: Uuid::new_v4().to_string(),
            names: config.names_for_device(index).to_vec(),
        }
    }
}

/// One synthesized client message and the key it is tallied under.
#[derive(Clone, Debug)]
pub struct Publish {
    pub name: String,
    pub target: Option<String>,
    pub message: Message,
}

/// What differs between command, notification and plain message runs.
#[async_trait]
pub trait Scenario: Send + Sync {
    fn config(&self) -> &ScenarioConfig;

    /// Action clients send on every tick.
    fn action(&self) -> String;

    /// Subscribes a freshly authenticated device. `None` when the scenario
    /// has no device side.
    async fn subscribe_device(
        &self,
        conn: &Connection,
        device: &Device,
        timeout: Duration,
    ) -> Result<Option<Subscription>>;

    /// Builds the `tick`-th message of the run.
    fn build_publish(&self, tick: usize, devices: &[Device], request_id: u64) -> Result<Publish> {
        let config = self.config();
        let name = config
            .names
            .get(tick % config.names.len().max(1))
            .cloned()
            .unwrap_or_default();
        let target = (!devices.is_empty()).then(|| devices[tick % devices.len()].id.clone());
        let device_ids: Vec<String> = devices.iter().map(|d| d.id.clone()).collect();

        let body = template::render(
            &self.template(),
            &Placeholders {
                name: &name,
                device_id: target.as_deref(),
                device_ids: &device_ids,
                request_id,
            },
        );

        Ok(Publish {
            name,
            target,
            message: Message::request(&self.action(), request_id, body)?,
        })
    }

    /// Template used when the config carries none.
    fn default_template(&self) -> Value;

    fn template(&self) -> Value {
        self.config()
            .template
            .clone()
            .unwrap_or_else(|| self.default_template())
    }

    /// Handles one frame seen by a device. Returns true when it is a delivery
    /// produced by the device's subscription.
    fn on_device_frame(
        &self,
        conn: &Connection,
        device: &Device,
        subscription: &Subscription,
        frame: &Message,
    ) -> bool;
}

fn parameters_or_empty(config: &ScenarioConfig) -> Value {
    match &config.parameters {
        Value::Null => json!({}),
        other => other.clone(),
    }
}

pub struct CommandScenario {
    config: ScenarioConfig,
}

impl CommandScenario {
    pub fn new(config: ScenarioConfig) -> Self {
        CommandScenario { config }
    }
}

#[async_trait]
impl Scenario for CommandScenario {
    fn config(&self) -> &ScenarioConfig {
        &self.config
    }

    fn action(&self) -> String {
        SubscriptionKind::Command.push_action()
    }

    async fn subscribe_device(
        &self,
        conn: &Connection,
        device: &Device,
        timeout: Duration,
    ) -> Result<Option<Subscription>> {
        let filter = Filter::device(&device.id).with_names(device.names.iter().cloned());
        let sub = subscription::subscribe(conn, SubscriptionKind::Command, filter, timeout).await?;

        Ok(Some(sub))
    }

    fn default_template(&self) -> Value {
        json!({
            "deviceId": "{#deviceId}",
            "command": {
                "command": "{#name}",
                "parameters": parameters_or_empty(&self.config),
            }
        })
    }

    /// Answers every pushed command with `command/update`, status `done`.
    fn on_device_frame(
        &self,
        conn: &Connection,
        device: &Device,
        subscription: &Subscription,
        frame: &Message,
    ) -> bool {
        if frame.subscription_id() != Some(subscription.id)
            || frame.action() != Some(self.action().as_str())
        {
            return false;
        }

        let command_id = frame
            .get("command")
            .and_then(|c| c.get("id"))
            .cloned()
            .unwrap_or(Value::Null);

        let update = Message::request(
            "command/update",
            conn.next_request_id(),
            json!({
                "deviceId": device.id,
                "commandId": command_id,
                "command": { "status": "done", "result": { "device": device.index } },
            }),
        );

        match update {
            Ok(update) => {
                if let Err(e) = conn.send(&update) {
                    debug!("[{}] could not answer command {}: {}", conn.id(), command_id, e);
                }
            }
            Err(e) => debug!("[{}] could not build command update: {}", conn.id(), e),
        }

        true
    }
}

pub struct NotificationScenario {
    config: ScenarioConfig,
}

impl NotificationScenario {
    pub fn new(config: ScenarioConfig) -> Self {
        NotificationScenario { config }
    }
}

#[async_trait]
impl Scenario for NotificationScenario {
    fn config(&self) -> &ScenarioConfig {
        &self.config
    }

    fn action(&self) -> String {
        SubscriptionKind::Notification.push_action()
    }

    async fn subscribe_device(
        &self,
        conn: &Connection,
        device: &Device,
        timeout: Duration,
    ) -> Result<Option<Subscription>> {
        let filter = Filter::device(&device.id).with_names(device.names.iter().cloned());
        let sub =
            subscription::subscribe(conn, SubscriptionKind::Notification, filter, timeout).await?;

        Ok(Some(sub))
    }

    fn default_template(&self) -> Value {
        json!({
            "deviceId": "{#deviceId}",
            "notification": {
                "notification": "{#name}",
                "parameters": parameters_or_empty(&self.config),
            }
        })
    }

    fn on_device_frame(
        &self,
        _conn: &Connection,
        _device: &Device,
        subscription: &Subscription,
        frame: &Message,
    ) -> bool {
        frame.subscription_id() == Some(subscription.id)
            && frame.action() == Some(self.action().as_str())
    }
}

/// Clients only: round-trips an arbitrary action such as `server/info`.
pub struct MessageScenario {
    config: ScenarioConfig,
}

impl MessageScenario {
    pub fn new(config: ScenarioConfig) -> Self {
        MessageScenario { config }
    }
}

#[async_trait]
impl Scenario for MessageScenario {
    fn config(&self) -> &ScenarioConfig {
        &self.config
    }

    fn action(&self) -> String {
        self.config
            .action
            .clone()
            .unwrap_or_else(|| "server/info".to_string())
    }

    async fn subscribe_device(
        &self,
        _conn: &Connection,
        _device: &Device,
        _timeout: Duration,
    ) -> Result<Option<Subscription>> {
        Ok(None)
    }

    fn build_publish(&self, tick: usize, _devices: &[Device], request_id: u64) -> Result<Publish> {
        let name = self
            .config
            .names
            .get(tick % self.config.names.len().max(1))
            .cloned()
            .unwrap_or_default();

        let body = template::render(
            &self.template(),
            &Placeholders {
                name: &name,
                device_id: None,
                device_ids: &[],
                request_id,
            },
        );

        Ok(Publish {
            name,
            target: None,
            message: Message::request(&self.action(), request_id, body)?,
        })
    }

    fn default_template(&self) -> Value {
        json!({})
    }

    fn on_device_frame(
        &self,
        _conn: &Connection,
        _device: &Device,
        _subscription: &Subscription,
        _frame: &Message,
    ) -> bool {
        false
    }
}

/// Picks the scenario implementation for a configured kind.
pub fn for_config(config: ScenarioConfig) -> Arc<dyn Scenario> {
    match config.kind {
        ScenarioKind::Command => Arc::new(CommandScenario::new(config)),
        ScenarioKind::Notification => Arc::new(NotificationScenario::new(config)),
        ScenarioKind::Message => Arc::new(MessageScenario::new(config)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn devices(config: &ScenarioConfig, n: usize) -> Vec<Device> {
        (0..n).map(|i| Device::new(i, config)).collect()
    }

    #[test]
    fn command_publish_rotates_names_and_devices() {
        let mut config = ScenarioConfig::new("cmd", ScenarioKind::Command);
        config.names = vec!["go".into(), "stop".into()];
        let devices = devices(&config, 3);
        let scenario = CommandScenario::new(config);

        let publish = scenario.build_publish(4, &devices, 99).unwrap();

        assert_eq!(publish.name, "go");
        assert_eq!(publish.target.as_deref(), Some(devices[1].id.as_str()));
        assert_eq!(publish.message.action(), Some("command/insert"));
        assert_eq!(publish.message.request_id(), Some(99));
        assert_eq!(
            publish.message.get("command").and_then(|c| c.get("command")),
            Some(&json!("go"))
        );
    }

    #[test]
    fn message_publish_uses_configured_action() {
        let mut config = ScenarioConfig::new("info", ScenarioKind::Message);
        config.action = Some("server/info".into());
        let scenario = MessageScenario::new(config);

        let publish = scenario.build_publish(0, &[], 5).unwrap();

        assert_eq!(publish.message.action(), Some("server/info"));
        assert_eq!(publish.target, None);
    }

    #[test]
    fn devices_get_distinct_ids_and_name_subsets() {
        let mut config = ScenarioConfig::new("n", ScenarioKind::Notification);
        config.names = vec!["a".into(), "b".into()];
        let devices = devices(&config, 2);

        assert_ne!(devices[0].id, devices[1].id);
        assert_eq!(devices[0].names, vec!["a"]);
        assert_eq!(devices[1].names, vec!["a", "b"]);
    }
}
