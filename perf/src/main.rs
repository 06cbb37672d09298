use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use log::{error, info, warn};
use tokio::runtime::Runtime;

use hive_harness::config::Settings;
use hive_harness::load::{ScenarioRunResult, ScenarioRunner};
use hive_harness::metrics::render_metrics;
use hive_harness::mock::{MockConfig, MockServer};
use hive_harness::Credentials;

/// Runs the configured load scenarios against a hive server.
#[derive(Parser, Debug)]
#[command(version, about)]
struct Args {
    /// JSON settings file.
    #[arg(short, long)]
    config: PathBuf,

    /// Overrides `server.wsUrl`.
    #[arg(long)]
    ws_url: Option<String>,

    /// Runs only the scenario with this name.
    #[arg(long)]
    only: Option<String>,

    /// Prints one JSON object per scenario instead of the text summary.
    #[arg(long)]
    json: bool,

    /// Dumps prometheus metrics after the last scenario.
    #[arg(long)]
    metrics: bool,

    /// Runs against an in-process mock server instead of `server.wsUrl`.
    #[arg(long)]
    mock: bool,
}

fn print_result(result: &ScenarioRunResult, json: bool) {
    if json {
        match serde_json::to_string(result) {
            Ok(line) => println!("{}", line),
            Err(e) => error!("Cannot serialize result for {}: {}", result.name, e),
        }
    } else {
        println!("{}", result);
    }
}

async fn run(args: Args) -> Result<bool, Box<dyn std::error::Error>> {
    let mut settings = Settings::from_file(&args.config)?;
    if let Some(url) = args.ws_url {
        settings.server.ws_url = url;
    }

    let (credentials, _mock) = if args.mock {
        let config = MockConfig::default();
        let key = config.access_keys.first().cloned().unwrap_or_default();
        let server = MockServer::start(config).await?;
        settings.server.ws_url = server.ws_url();
        (Credentials::AccessKey(key), Some(server))
    } else {
        (settings.server.credentials()?, None)
    };

    let tests: Vec<_> = settings
        .load_tests
        .tests
        .into_iter()
        .filter(|t| args.only.as_deref().map_or(true, |only| t.name == only))
        .collect();

    if tests.is_empty() {
        warn!("No load tests selected");
    }

    let mut clean = true;
    for test in tests {
        info!("Running {} against {}", test.name, settings.server.ws_url);

        let runner = ScenarioRunner::from_config(test, &settings.server.ws_url, credentials.clone())
            .with_timeout(settings.server.timeout());

        // Setup errors abort the whole run with exit code 1.
        let result = runner.run().await?;
        clean &= !result.degraded;
        print_result(&result, args.json);
    }

    if args.metrics {
        print!("{}", render_metrics()?);
    }

    Ok(clean)
}

fn main() -> ExitCode {
    let env = env_logger::Env::default().filter_or(env_logger::DEFAULT_FILTER_ENV, "info");
    env_logger::init_from_env(env);

    let args = Args::parse();

    let rt = match Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            error!("Cannot start runtime: {}", e);
            return ExitCode::FAILURE;
        }
    };

    let outcome = rt.block_on(run(args));
    if let Err(e) = &outcome {
        error!("{}", e);
    }

    ExitCode::from(exit_status(&outcome))
}

/// 0 when every run is clean, 2 when one degraded, 1 when setup failed.
fn exit_status(outcome: &Result<bool, Box<dyn std::error::Error>>) -> u8 {
    match outcome {
        Ok(true) => 0,
        Ok(false) => 2,
        Err(_) => 1,
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use super::*;

    fn write_config(name: &str, body: &str) -> PathBuf {
        let path = std::env::temp_dir().join(format!("hive-perf-{}-{}.json", name, std::process::id()));
        fs::write(&path, body).unwrap();
        path
    }

    fn args(config: PathBuf) -> Args {
        Args {
            config,
            ws_url: None,
            only: None,
            json: true,
            metrics: false,
            mock: true,
        }
    }

    #[tokio::test]
    async fn setup_failure_exits_with_one() {
        let path = write_config(
            "setup",
            r#"{
                "server": { "wsUrl": "ws://127.0.0.1:1/api/websocket" },
                "loadTests": { "tests": [
                    { "name": "no-clients", "type": "message", "clients": 0, "total": 3 }
                ] }
            }"#,
        );

        let outcome = run(args(path.clone())).await;
        let _ = fs::remove_file(path);

        assert!(outcome.is_err());
        assert_eq!(exit_status(&outcome), 1);
    }

    #[tokio::test]
    async fn clean_run_exits_with_zero() {
        let path = write_config(
            "clean",
            r#"{
                "server": { "wsUrl": "ws://127.0.0.1:1/api/websocket" },
                "loadTests": { "tests": [
                    { "name": "info", "type": "message", "clients": 1, "total": 2,
                      "intervalMillis": 10, "waitDelay": 100 }
                ] }
            }"#,
        );

        let outcome = run(args(path.clone())).await;
        let _ = fs::remove_file(path);

        assert_eq!(exit_status(&outcome), 0);
    }

    #[test]
    fn degraded_run_exits_with_two() {
        assert_eq!(exit_status(&Ok(false)), 2);
    }
}
