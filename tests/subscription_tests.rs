mod common;

use std::time::Duration;

use serde_json::json;

use hive_harness::subscription::{self, Filter, SubscriptionKind};
use hive_harness::Error;

use common::*;

#[tokio::test]
async fn test_command_push_reaches_subscriber() {
    let server = start_server().await;
    let device = connect_user(&server).await;
    let client = connect_user(&server).await;

    let sub = subscription::subscribe(
        &device,
        SubscriptionKind::Command,
        Filter::device("dev-a").with_names(["reboot"]),
        TIMEOUT,
    )
    .await
    .unwrap();

    let push = device.expect(sub.push_pattern());
    let reply = client
        .request(
            "command/insert",
            json!({ "deviceId": "dev-a", "command": { "command": "reboot", "parameters": { "delay": 1 } } }),
            TIMEOUT,
        )
        .await
        .unwrap();
    let push = push.wait(TIMEOUT).await.unwrap();

    let command_id = reply.get("command").and_then(|c| c.get("id")).cloned();
    assert!(command_id.is_some());
    assert_eq!(push.subscription_id(), Some(sub.id));
    assert_eq!(push.get("command").and_then(|c| c.get("id")).cloned(), command_id);
    assert_eq!(
        push.get("command").and_then(|c| c.get("parameters")),
        Some(&json!({ "delay": 1 }))
    );

    let update = device
        .request(
            "command/update",
            json!({ "deviceId": "dev-a", "commandId": command_id, "command": { "status": "done" } }),
            TIMEOUT,
        )
        .await;
    assert!(update.is_ok());
}

#[tokio::test]
async fn test_name_filter_skips_other_names() {
    let server = start_server().await;
    let device = connect_user(&server).await;
    let client = connect_user(&server).await;

    let sub = subscription::subscribe(
        &device,
        SubscriptionKind::Notification,
        Filter::device("dev-b").with_names(["temperature"]),
        TIMEOUT,
    )
    .await
    .unwrap();

    let push = device.expect(sub.push_pattern());
    client
        .request(
            "notification/insert",
            json!({ "deviceId": "dev-b", "notification": { "notification": "humidity" } }),
            TIMEOUT,
        )
        .await
        .unwrap();

    assert!(push.wait(Duration::from_millis(200)).await.unwrap_err().is_timeout());
}

#[tokio::test]
async fn test_no_pushes_after_unsubscribe() {
    let server = start_server().await;
    let device = connect_user(&server).await;
    let client = connect_user(&server).await;

    let sub = subscription::subscribe(
        &device,
        SubscriptionKind::Notification,
        Filter::device("dev-c"),
        TIMEOUT,
    )
    .await
    .unwrap();
    sub.unsubscribe(&device, TIMEOUT).await.unwrap();

    let push = device.expect(sub.push_pattern());
    client
        .request(
            "notification/insert",
            json!({ "deviceId": "dev-c", "notification": { "notification": "temperature" } }),
            TIMEOUT,
        )
        .await
        .unwrap();

    assert!(push.wait(Duration::from_millis(200)).await.unwrap_err().is_timeout());

    // The id is gone server side.
    let again = sub.unsubscribe(&device, TIMEOUT).await;
    assert!(matches!(again, Err(Error::Protocol { code: Some(404), .. })));
}

#[tokio::test]
async fn test_insert_without_device_is_rejected() {
    let server = start_server().await;
    let client = connect_user(&server).await;

    let error = client
        .request("command/insert", json!({ "command": { "command": "x" } }), TIMEOUT)
        .await
        .unwrap_err();

    assert!(matches!(error, Error::Protocol { code: Some(400), .. }));
}
