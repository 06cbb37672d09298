use std::env;

use hive_harness::mock::{MockConfig, MockServer};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let env = env_logger::Env::default().filter_or(env_logger::DEFAULT_FILTER_ENV, "info");
    env_logger::init_from_env(env);

    let addr = env::args()
        .nth(1)
        .unwrap_or_else(|| "127.0.0.1:8080".to_string());

    let server = MockServer::bind(&addr, MockConfig::default()).await?;
    log::info!("WebSocket endpoint: {}", server.ws_url());
    log::info!("REST endpoint: {}", server.rest_url());
    server.wait().await;

    Ok(())
}
