use std::env;
use std::fs;
use std::path::Path;
use std::time::Duration;

use log::info;
use serde::Deserialize;

use crate::auth::Credentials;
use crate::error::{Error, Result};
use crate::load::ScenarioConfig;

pub const WS_URL_ENV: &str = "HIVE_WS_URL";
pub const REST_URL_ENV: &str = "HIVE_REST_URL";
pub const ACCESS_KEY_ENV: &str = "HIVE_ACCESS_KEY";

#[derive(Deserialize, Clone, Debug)]
#[serde(rename_all = "camelCase")]
pub struct Settings {
    pub server: ServerSettings,
    #[serde(default)]
    pub load_tests: LoadTests,
}

#[derive(Deserialize, Clone, Debug)]
#[serde(rename_all = "camelCase")]
pub struct ServerSettings {
    pub ws_url: String,
    #[serde(default)]
    pub rest_url: Option<String>,
    #[serde(default)]
    pub access_key: Option<String>,
    #[serde(default)]
    pub token: Option<String>,
    #[serde(default)]
    pub login: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default = "default_timeout_millis")]
    pub timeout_millis: u64,
}

#[derive(Deserialize, Clone, Debug, Default)]
pub struct LoadTests {
    #[serde(default)]
    pub tests: Vec<ScenarioConfig>,
}

fn default_timeout_millis() -> u64 {
    5000
}

impl Settings {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("cannot read {}: {}", path.display(), e)))?;

        let mut settings = Self::from_json(&text)?;
        settings.apply_env();

        info!(
            "Loaded settings from {} ({} load tests)",
            path.display(),
            settings.load_tests.tests.len()
        );

        Ok(settings)
    }

    pub fn from_json(text: &str) -> Result<Self> {
        serde_json::from_str(text).map_err(|e| Error::Config(e.to_string()))
    }

    /// Environment variables win over the file.
    pub fn apply_env(&mut self) {
        if let Ok(url) = env::var(WS_URL_ENV) {
            self.server.ws_url = url;
        }
        if let Ok(url) = env::var(REST_URL_ENV) {
            self.server.rest_url = Some(url);
        }
        if let Ok(key) = env::var(ACCESS_KEY_ENV) {
            self.server.access_key = Some(key);
        }
    }
}

impl ServerSettings {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_millis)
    }

    /// Credentials in order of preference: access key, token, login.
    pub fn credentials(&self) -> Result<Credentials> {
        if let Some(key) = &self.access_key {
            return Ok(Credentials::AccessKey(key.clone()));
        }
        if let Some(token) = &self.token {
            return Ok(Credentials::Token(token.clone()));
        }
        match (&self.login, &self.password) {
            (Some(login), Some(password)) => Ok(Credentials::Login {
                login: login.clone(),
                password: password.clone(),
            }),
            _ => Err(Error::Config(
                "server needs one of accessKey, token or login/password".to_string(),
            )),
        }
    }
}
