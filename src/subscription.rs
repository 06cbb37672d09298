use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use crate::connection::Connection;
use crate::error::{Error, Result};

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionKind {
    Command,
    Notification,
}

impl SubscriptionKind {
    pub fn prefix(self) -> &'static str {
        match self {
            SubscriptionKind::Command => "command",
            SubscriptionKind::Notification => "notification",
        }
    }

    pub fn subscribe_action(self) -> String {
        format!("{}/subscribe", self.prefix())
    }

    pub fn unsubscribe_action(self) -> String {
        format!("{}/unsubscribe", self.prefix())
    }

    /// Action carried by pushes for this kind.
    pub fn push_action(self) -> String {
        format!("{}/insert", self.prefix())
    }
}

impl fmt::Display for SubscriptionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.prefix())
    }
}

/// Attributes a subscription filters pushes on. Empty lists are left out of
/// the request.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Filter {
    pub device_ids: Vec<String>,
    pub network_ids: Vec<u64>,
    pub device_type_ids: Vec<u64>,
    pub names: Vec<String>,
}

impl Filter {
    pub fn device(device_id: &str) -> Self {
        Filter {
            device_ids: vec![device_id.to_string()],
            ..Default::default()
        }
    }

    pub fn with_names<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.names = names.into_iter().map(Into::into).collect();
        self
    }

    fn to_fields(&self) -> Value {
        let mut fields = Map::new();

        match self.device_ids.as_slice() {
            [] => {}
            [single] => {
                fields.insert("deviceId".into(), json!(single));
            }
            many => {
                fields.insert("deviceIds".into(), json!(many));
            }
        }
        if !self.network_ids.is_empty() {
            fields.insert("networkIds".into(), json!(self.network_ids));
        }
        if !self.device_type_ids.is_empty() {
            fields.insert("deviceTypeIds".into(), json!(self.device_type_ids));
        }
        if !self.names.is_empty() {
            fields.insert("names".into(), json!(self.names));
        }

        Value::Object(fields)
    }
}

/// A live server-side subscription; only its ID is tracked client side.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Subscription {
    pub id: u64,
    pub kind: SubscriptionKind,
    pub filter: Filter,
}

impl Subscription {
    pub async fn unsubscribe(&self, conn: &Connection, timeout: Duration) -> Result<()> {
        conn.request(
            &self.kind.unsubscribe_action(),
            json!({ "subscriptionId": self.id }),
            timeout,
        )
        .await?;

        Ok(())
    }

    /// Pattern matching pushes produced by this subscription.
    pub fn push_pattern(&self) -> Value {
        json!({ "action": self.kind.push_action(), "subscriptionId": self.id })
    }
}

pub async fn subscribe(
    conn: &Connection,
    kind: SubscriptionKind,
    filter: Filter,
    timeout: Duration,
) -> Result<Subscription> {
    let response = conn
        .request(&kind.subscribe_action(), filter.to_fields(), timeout)
        .await?;

    let id = response
        .subscription_id()
        .ok_or_else(|| Error::from_frame(&response))?;

    Ok(Subscription { id, kind, filter })
}
