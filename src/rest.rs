//! Thin REST sender. Holds no state beyond the base URL and credentials.

use log::debug;
use reqwest::{Client, Method, RequestBuilder};
use serde_json::Value;

use crate::auth::{DEVICE_ID_HEADER, DEVICE_KEY_HEADER};
use crate::error::{Error, Result};

#[derive(Clone, Debug)]
pub enum RestAuth {
    None,
    Bearer(String),
    Basic { login: String, password: String },
    Device { device_id: String, device_key: String },
}

#[derive(Clone, Debug, PartialEq)]
pub struct RestResponse {
    pub status: u16,
    pub body: Value,
}

impl RestResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Turns non-2xx statuses into [`Error::Http`].
    pub fn into_result(self) -> Result<Value> {
        if self.is_success() {
            Ok(self.body)
        } else {
            Err(Error::Http {
                status: self.status,
                body: self.body,
            })
        }
    }
}

#[derive(Clone, Debug)]
pub struct RestClient {
    base_url: String,
    auth: RestAuth,
    client: Client,
}

impl RestClient {
    pub fn new(base_url: &str, auth: RestAuth) -> Self {
        RestClient {
            base_url: base_url.trim_end_matches('/').to_string(),
            auth,
            client: Client::new(),
        }
    }

    pub fn with_auth(&self, auth: RestAuth) -> Self {
        RestClient {
            base_url: self.base_url.clone(),
            auth,
            client: self.client.clone(),
        }
    }

    pub fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.auth {
            RestAuth::None => request,
            RestAuth::Bearer(token) => request.bearer_auth(token),
            RestAuth::Basic { login, password } => request.basic_auth(login, Some(password)),
            RestAuth::Device {
                device_id,
                device_key,
            } => request
                .header(DEVICE_ID_HEADER, device_id)
                .header(DEVICE_KEY_HEADER, device_key),
        }
    }

    /// Sends one request. Non-2xx statuses are returned, not raised.
    pub async fn send(&self, method: Method, path: &str, body: Option<&Value>) -> Result<RestResponse> {
        let url = self.url(path);
        debug!("{} {}", method, url);

        let mut request = self.authorize(self.client.request(method, &url));
        if let Some(body) = body {
            request = request.json(body);
        }

        let response = request.send().await?;
        let status = response.status().as_u16();
        let text = response.text().await?;

        let body = if text.is_empty() {
            Value::Null
        } else {
            serde_json::from_str(&text).unwrap_or(Value::String(text))
        };

        debug!("{} -> {}", url, status);
        Ok(RestResponse { status, body })
    }

    pub async fn get(&self, path: &str) -> Result<RestResponse> {
        self.send(Method::GET, path, None).await
    }

    pub async fn post(&self, path: &str, body: &Value) -> Result<RestResponse> {
        self.send(Method::POST, path, Some(body)).await
    }

    pub async fn put(&self, path: &str, body: &Value) -> Result<RestResponse> {
        self.send(Method::PUT, path, Some(body)).await
    }

    pub async fn delete(&self, path: &str) -> Result<RestResponse> {
        self.send(Method::DELETE, path, None).await
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn urls_join_without_double_slashes() {
        let client = RestClient::new("http://localhost:8080/api/rest/", RestAuth::None);

        assert_eq!(client.url("/device/abc"), "http://localhost:8080/api/rest/device/abc");
        assert_eq!(client.url("info"), "http://localhost:8080/api/rest/info");
    }

    #[test]
    fn non_success_status_becomes_http_error() {
        let response = RestResponse {
            status: 404,
            body: json!({ "error": "missing" }),
        };

        assert!(matches!(response.into_result(), Err(Error::Http { status: 404, .. })));
    }
}
