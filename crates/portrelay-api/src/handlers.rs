use axum::{
    body::Bytes,
    extract::State,
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use std::sync::Arc;
use subtle::ConstantTimeEq;
use tracing::{debug, info, warn};

use crate::error::{result_line, ControlError};
use crate::models::{ControlRequest, DetailRecord, HealthResponse, Operation};
use crate::AppState;

/// Run one control operation against the registry
///
/// Domain failures (not found, already exists, ...) are reported in a `200`
/// result line. Only undecodable requests and authorization failures are
/// rejected with an error status.
#[utoipa::path(
    post,
    path = "/api/control",
    request_body = ControlRequest,
    responses(
        (status = 200, description = "`details` returns the forwarder list, every other operation a `<operation>: <ok|error>` text line", body = [DetailRecord]),
        (status = 400, description = "Malformed request", body = String, content_type = "text/plain"),
        (status = 401, description = "Token missing or wrong", body = String, content_type = "text/plain")
    ),
    tag = "control"
)]
pub async fn control(State(state): State<Arc<AppState>>, body: Bytes) -> Response {
    match dispatch(&state, &body).await {
        Ok(response) => response,
        Err(e) => {
            warn!("Rejected control request: {}", e);
            e.into_response()
        }
    }
}

async fn dispatch(state: &AppState, body: &[u8]) -> Result<Response, ControlError> {
    let request: ControlRequest = serde_json::from_slice(body)
        .map_err(|e| ControlError::MalformedRequest(e.to_string()))?;

    if !token_valid(&state.token, request.token.as_deref()) {
        return Err(ControlError::AuthorizationFailed);
    }

    let label = match request.operation.as_deref() {
        Some(label) if !label.is_empty() => label.to_string(),
        _ => return Err(ControlError::MissingOperation),
    };
    let operation =
        Operation::parse(&label).ok_or_else(|| ControlError::UnknownOperation(label.clone()))?;

    debug!("Control operation {} for {:?}", label, request.name);

    let registry = &state.registry;
    let outcome = match operation {
        Operation::Details => {
            let details: Vec<DetailRecord> = registry
                .list_details()
                .await
                .into_iter()
                .map(DetailRecord::from)
                .collect();
            return Ok(Json(details).into_response());
        }
        Operation::Start => {
            let name = required(&label, "name", &request.name)?;
            registry.start(name).await
        }
        Operation::Stop => {
            let name = required(&label, "name", &request.name)?;
            registry.stop(name).await
        }
        Operation::Add => {
            let name = required(&label, "name", &request.name)?;
            let local = required(&label, "local", &request.local)?;
            let remote = required(&label, "remote", &request.remote)?;
            registry.add(name, local, remote).await
        }
        Operation::Remove => {
            let name = required(&label, "name", &request.name)?;
            registry.remove(name).await
        }
    };

    let line = match &outcome {
        Ok(()) => {
            info!("Control {} succeeded for {:?}", label, request.name);
            result_line(&label, Ok(()))
        }
        Err(e) => {
            info!("Control {} failed for {:?}: {}", label, request.name, e);
            result_line(&label, Err(&e.to_string()))
        }
    };

    Ok(text(line))
}

fn required<'a>(
    operation: &str,
    parameter: &'static str,
    value: &'a Option<String>,
) -> Result<&'a str, ControlError> {
    match value.as_deref() {
        Some(v) if !v.is_empty() => Ok(v),
        _ => Err(ControlError::MissingParameter {
            operation: operation.to_string(),
            parameter,
        }),
    }
}

/// Constant-time token check; an empty configured token never authorizes
fn token_valid(expected: &str, provided: Option<&str>) -> bool {
    match provided {
        Some(provided) if !expected.is_empty() => {
            bool::from(expected.as_bytes().ct_eq(provided.as_bytes()))
        }
        _ => false,
    }
}

fn text(line: String) -> Response {
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
        line,
    )
        .into_response()
}

/// Health check endpoint
#[utoipa::path(
    get,
    path = "/api/health",
    responses(
        (status = 200, description = "Service is healthy", body = HealthResponse)
    ),
    tag = "system"
)]
pub async fn health_check(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    let details = state.registry.list_details().await;

    Json(HealthResponse {
        status: "healthy".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        forwarders: details.len(),
        running: details.iter().filter(|d| d.running).count(),
    })
}
