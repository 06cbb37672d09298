mod common;

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;

use hive_harness::auth::Credentials;
use hive_harness::load::{ScenarioConfig, ScenarioKind, ScenarioPhase, ScenarioRunner};
use hive_harness::mock::{MockConfig, MockServer};
use hive_harness::RequestIds;

use common::*;

fn scenario(name: &str, kind: ScenarioKind, devices: usize, total: usize) -> ScenarioConfig {
    let mut config = ScenarioConfig::new(name, kind);
    config.devices = devices;
    config.clients = 1;
    config.total = total;
    config.interval_millis = 20;
    config.wait_delay = 300;
    config
}

#[tokio::test]
async fn test_command_scenario_round_trip() {
    let server = start_server().await;
    let config = scenario("commands", ScenarioKind::Command, 1, 3);

    let result = ScenarioRunner::from_config(config, &server.ws_url(), token())
        .with_ids(Arc::new(RequestIds::new()))
        .run()
        .await
        .unwrap();

    assert_eq!(result.sent, 3);
    assert_eq!(result.received, 3);
    assert_eq!(result.errors_count, 0);
    assert!(!result.degraded);
    assert_eq!(result.expected, 3);
    assert_eq!(result.delivered, 3);
    assert!(result.min <= result.median && result.median <= result.max);
    assert_eq!(result.phases.first(), Some(&ScenarioPhase::Created));
    assert_eq!(result.phases.last(), Some(&ScenarioPhase::Completed));
}

#[tokio::test]
async fn test_short_quiet_period() {
    let server = start_server().await;
    let mut config = scenario("quick", ScenarioKind::Command, 1, 3);
    config.interval_millis = 10;
    config.wait_delay = 50;

    let result = ScenarioRunner::from_config(config, &server.ws_url(), token())
        .run()
        .await
        .unwrap();

    assert_eq!(result.sent, 3);
    assert_eq!(result.received, 3);
    assert_eq!(result.errors_count, 0);
}

#[tokio::test]
async fn test_notification_fan_out_counts() {
    let server = start_server().await;
    let mut config = scenario("notifications", ScenarioKind::Notification, 2, 4);
    config.names = vec!["temperature".to_string(), "humidity".to_string()];
    config.clients = 2;

    let result = ScenarioRunner::from_config(config, &server.ws_url(), token())
        .run()
        .await
        .unwrap();

    // Device 0 listens to temperature only, device 1 to both names. Ticks
    // alternate names and targets in step, so device 1 only ever sees
    // humidity and device 0 only temperature: every send has a subscriber.
    assert_eq!(result.sent, 4);
    assert_eq!(result.received, 4);
    assert_eq!(result.errors_count, 0);
    assert_eq!(result.expected, 4);
    assert_eq!(result.delivered, 4);
    assert_eq!(result.tallies.len(), 3);
}

#[tokio::test]
async fn test_message_scenario_without_devices() {
    let server = start_server().await;
    let mut config = scenario("info", ScenarioKind::Message, 0, 5);
    config.clients = 2;

    let result = ScenarioRunner::from_config(
        config,
        &server.ws_url(),
        Credentials::AccessKey(ACCESS_KEY.to_string()),
    )
    .run()
    .await
    .unwrap();

    assert_eq!(result.sent, 5);
    assert_eq!(result.received, 5);
    assert_eq!(result.expected, 0);
    assert_eq!(result.errors_count, 0);
}

#[tokio::test]
async fn test_rejected_credentials_degrade_the_run() {
    let server = start_server().await;
    let config = scenario("rejected", ScenarioKind::Command, 1, 2);

    let result = ScenarioRunner::from_config(config, &server.ws_url(), Credentials::Token("bad".into()))
        .run()
        .await
        .unwrap();

    assert_eq!(result.sent, 0);
    assert_eq!(result.received, 0);
    assert!(result.degraded);
    assert_eq!(result.phases.last(), Some(&ScenarioPhase::Completed));
}

#[tokio::test]
async fn test_unreachable_server_still_completes() {
    init_logger();
    let config = scenario("unreachable", ScenarioKind::Notification, 1, 2);

    let result = ScenarioRunner::from_config(config, "ws://127.0.0.1:1/api/websocket", token())
        .with_timeout(Duration::from_secs(1))
        .run()
        .await
        .unwrap();

    assert_eq!(result.sent, 0);
    assert!(result.errors_count >= 2);
    assert_eq!(result.phases.last(), Some(&ScenarioPhase::Completed));
}

#[tokio::test]
async fn test_clients_required_when_sending() {
    init_logger();
    let mut config = scenario("no-clients", ScenarioKind::Command, 0, 1);
    config.clients = 0;

    let result = ScenarioRunner::from_config(config, "ws://127.0.0.1:1", token())
        .run()
        .await;

    assert!(result.is_err());
}

#[tokio::test]
async fn test_run_ends_one_wait_delay_after_last_reply() {
    let server = start_server().await;
    let mut config = scenario("quiet", ScenarioKind::Message, 0, 3);
    config.interval_millis = 10;

    let result = ScenarioRunner::from_config(config, &server.ws_url(), token())
        .run()
        .await
        .unwrap();

    assert_eq!(result.received, 3);
    // Sends finish around 30ms in, then one 300ms quiet window.
    assert!(result.elapsed_millis >= 300, "ended early: {}ms", result.elapsed_millis);
    assert!(result.elapsed_millis < 500, "ended late: {}ms", result.elapsed_millis);
}

#[tokio::test]
async fn test_devices_unsubscribe_before_closing() {
    let server = start_server().await;
    let config = scenario("unsubscribe", ScenarioKind::Notification, 3, 3);

    let result = ScenarioRunner::from_config(config, &server.ws_url(), token())
        .run()
        .await
        .unwrap();

    assert_eq!(result.errors_count, 0);
    let stats = server.stats().await.unwrap();
    assert_eq!(stats.unsubscribes, 3);
}

#[tokio::test]
async fn test_dropped_client_does_not_stop_the_others() {
    init_logger();
    // Authenticate plus two messages, then the first session to get there is
    // closed with code 1011.
    let server = MockServer::start(MockConfig::default().close_once_after(3))
        .await
        .unwrap();
    let mut config = scenario("dropped", ScenarioKind::Message, 0, 10);
    config.clients = 2;

    let result = ScenarioRunner::from_config(config, &server.ws_url(), token())
        .run()
        .await
        .unwrap();

    assert_eq!(result.sent, 10);
    assert!(result.received >= 8);
    assert!(result.errors_count >= 1);
    assert!(result.degraded);
    assert_eq!(result.phases.last(), Some(&ScenarioPhase::Completed));
}

#[tokio::test]
async fn test_unrenderable_template_stops_sending() {
    let server = start_server().await;
    let mut config = scenario("broken", ScenarioKind::Message, 0, 3);
    config.template = Some(json!("not an object"));

    let result = ScenarioRunner::from_config(config, &server.ws_url(), token())
        .run()
        .await
        .unwrap();

    assert_eq!(result.sent, 0);
    assert!(result.degraded);
    assert!(result.elapsed_millis < 1000);
}
