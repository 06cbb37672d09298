#![allow(dead_code)]

use std::time::Duration;

use hive_harness::auth::{self, Credentials};
use hive_harness::mock::{MockConfig, MockServer};
use hive_harness::{ConnectOptions, Connection};

pub const TOKEN: &str = "test-token";
pub const ACCESS_KEY: &str = "test-access-key";
pub const DEVICE_ID: &str = "device-1";
pub const DEVICE_KEY: &str = "device-1-key";

pub const TIMEOUT: Duration = Duration::from_secs(2);

pub fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

pub async fn start_server() -> MockServer {
    init_logger();

    MockServer::start(MockConfig::default().with_device(DEVICE_ID, DEVICE_KEY))
        .await
        .expect("mock server should bind")
}

pub fn token() -> Credentials {
    Credentials::Token(TOKEN.to_string())
}

pub async fn connect(server: &MockServer) -> Connection {
    Connection::connect(&server.ws_url(), ConnectOptions::default())
        .await
        .expect("connect to mock server")
}

pub async fn connect_user(server: &MockServer) -> Connection {
    auth::connect_authenticated(&server.ws_url(), &token(), ConnectOptions::default(), TIMEOUT)
        .await
        .expect("authenticate with test token")
}
