use std::time::{SystemTime, UNIX_EPOCH};

use axum::{
    extract::{Extension, Path},
    http::{header::AUTHORIZATION, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde_json::{json, Value};

use super::router::{HubRequest, HubResponse, HubRouter};

fn bearer(headers: &HeaderMap) -> Option<String> {
    headers
        .get(AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
        .map(str::to_string)
}

fn respond(result: Result<HubResponse, String>) -> Response {
    match result {
        Ok(HubResponse::Ok) => StatusCode::NO_CONTENT.into_response(),
        Ok(HubResponse::Device(Some(device))) => Json(device).into_response(),
        Ok(HubResponse::Device(None)) => (
            StatusCode::NOT_FOUND,
            Json(json!({ "error": "Device not found" })),
        )
            .into_response(),
        Ok(HubResponse::Unauthorized) => (
            StatusCode::UNAUTHORIZED,
            Json(json!({ "error": "Unauthorized" })),
        )
            .into_response(),
        Ok(HubResponse::Stats(_)) => StatusCode::NOT_FOUND.into_response(),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, Json(json!({ "error": e }))).into_response(),
    }
}

async fn get_info() -> impl IntoResponse {
    let timestamp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default();

    Json(json!({ "apiVersion": "mock", "serverTimestamp": timestamp }))
}

async fn get_device(
    Path(id): Path<String>,
    Extension(hub): Extension<HubRouter>,
    headers: HeaderMap,
) -> Response {
    let token = bearer(&headers);
    respond(hub.send_command(HubRequest::GetDevice { token, id }).await)
}

async fn put_device(
    Path(id): Path<String>,
    Extension(hub): Extension<HubRouter>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Response {
    let token = bearer(&headers);
    respond(hub.send_command(HubRequest::PutDevice { token, id, body }).await)
}

pub fn rest_routes() -> Router {
    Router::new()
        .route("/info", get(get_info))
        .route("/device/:id", get(get_device).put(put_device))
}
