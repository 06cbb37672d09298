mod common;

use serde_json::json;

use hive_harness::auth::{self, Credentials};
use hive_harness::rest::{RestAuth, RestClient};
use hive_harness::ConnectOptions;

use common::*;

#[tokio::test]
async fn test_info_needs_no_credentials() {
    let server = start_server().await;
    let rest = RestClient::new(&server.rest_url(), RestAuth::None);

    let response = rest.get("/info").await.unwrap();

    assert_eq!(response.status, 200);
    assert_eq!(response.body.get("apiVersion"), Some(&json!("mock")));
}

#[tokio::test]
async fn test_device_registration_requires_token() {
    let server = start_server().await;
    let rest = RestClient::new(&server.rest_url(), RestAuth::None);

    let response = rest
        .put("/device/dev-r", &json!({ "name": "r", "key": "k" }))
        .await
        .unwrap();

    assert_eq!(response.status, 401);
    assert!(!response.is_success());
}

#[tokio::test]
async fn test_registered_device_can_authenticate() {
    let server = start_server().await;
    let rest = RestClient::new(&server.rest_url(), RestAuth::Bearer(TOKEN.to_string()));

    let put = rest
        .put("/device/dev-r", &json!({ "name": "r", "key": "secret" }))
        .await
        .unwrap();
    assert!(put.is_success());

    let device = rest.get("/device/dev-r").await.unwrap().into_result().unwrap();
    assert_eq!(device.get("name"), Some(&json!("r")));

    let missing = rest.get("/device/nope").await.unwrap();
    assert_eq!(missing.status, 404);

    let credentials = Credentials::Device {
        device_id: "dev-r".to_string(),
        device_key: "secret".to_string(),
    };
    let conn = auth::connect_authenticated(
        &server.ws_url(),
        &credentials,
        ConnectOptions::default(),
        TIMEOUT,
    )
    .await
    .unwrap();
    assert!(conn.is_open());
}
