//! Administrative HTTP API.
//!
//! Served unauthenticated over the in-process transport, and behind the
//! header + basic-auth gate on the loopback listener.

use std::sync::Arc;

use axum::extract::{Request, State};
use axum::http::{header, HeaderMap, HeaderValue, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::Serialize;
use subtle::ConstantTimeEq;
use tower_http::trace::TraceLayer;
use tracing::warn;

use crate::backend::{Backend, ServeConfig, Status};

mod client;
pub mod memnet;

pub use client::LocalClient;

/// Host header used for in-process requests.
pub const LOCAL_API_HOST: &str = "local-vnet.sock";

/// Header a caller must send to show the request is deliberate.
pub const GATE_HEADER: &str = "Sec-Vnet";
pub const GATE_VALUE: &str = "localapi";

pub const STATUS_PATH: &str = "/localapi/v0/status";
pub const SERVE_CONFIG_PATH: &str = "/localapi/v0/serve-config";
pub const LOGIN_INTERACTIVE_PATH: &str = "/localapi/v0/login-interactive";

#[derive(Clone)]
struct LocalApiState {
    backend: Arc<dyn Backend>,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

/// Error returned by local API handlers.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(err: anyhow::Error) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, format!("{err:#}"))
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (
            self.status,
            Json(ErrorBody {
                error: self.message,
            }),
        )
            .into_response()
    }
}

/// The API routes, without access control.
pub fn router(backend: Arc<dyn Backend>) -> Router {
    Router::new()
        .route(STATUS_PATH, get(status))
        .route(SERVE_CONFIG_PATH, get(get_serve_config).post(set_serve_config))
        .route(LOGIN_INTERACTIVE_PATH, post(login_interactive))
        .layer(TraceLayer::new_for_http())
        .with_state(LocalApiState { backend })
}

/// The API routes behind the gate header and `password`.
pub fn gated_router(backend: Arc<dyn Backend>, password: String) -> Router {
    router(backend).layer(middleware::from_fn_with_state(
        Arc::<str>::from(password),
        require_local_api_auth,
    ))
}

async fn status(State(state): State<LocalApiState>) -> Json<Status> {
    Json(state.backend.status())
}

async fn get_serve_config(
    State(state): State<LocalApiState>,
) -> Result<Json<ServeConfig>, ApiError> {
    Ok(Json(state.backend.serve_config().await?))
}

async fn set_serve_config(
    State(state): State<LocalApiState>,
    Json(config): Json<ServeConfig>,
) -> Result<StatusCode, ApiError> {
    state.backend.set_serve_config(config).await?;
    Ok(StatusCode::OK)
}

async fn login_interactive(State(state): State<LocalApiState>) -> Result<StatusCode, ApiError> {
    state.backend.start_login_interactive().await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn require_local_api_auth(
    State(password): State<Arc<str>>,
    req: Request,
    next: Next,
) -> Response {
    let headers = req.headers();
    let gated = headers
        .get(GATE_HEADER)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v == GATE_VALUE);
    if !gated {
        return ApiError::new(
            StatusCode::FORBIDDEN,
            format!("missing '{GATE_HEADER}: {GATE_VALUE}' header"),
        )
        .into_response();
    }

    let authorized = basic_auth_password(headers)
        .is_some_and(|given| constant_time_eq(given.as_bytes(), password.as_bytes()));
    if !authorized {
        warn!(path = %req.uri().path(), "local api request with bad credentials");
        let mut resp =
            ApiError::new(StatusCode::UNAUTHORIZED, "invalid credentials").into_response();
        resp.headers_mut().insert(
            header::WWW_AUTHENTICATE,
            HeaderValue::from_static("Basic realm=\"vnet\""),
        );
        return resp;
    }

    next.run(req).await
}

pub(crate) fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    bool::from(a.ct_eq(b))
}

/// Password from an `Authorization: Basic` header.
pub(crate) fn basic_auth_password(headers: &HeaderMap) -> Option<String> {
    let value = headers.get(header::AUTHORIZATION)?.to_str().ok()?;
    let encoded = value.strip_prefix("Basic ")?;
    let decoded = String::from_utf8(STANDARD.decode(encoded.trim()).ok()?).ok()?;
    let (_, password) = decoded.split_once(':')?;
    Some(password.to_string())
}
