//! HTTP surface — router, shared state, and the endpoint orchestrators.
//!
//! Handlers are thin glue: they translate wire payloads, consult the rate
//! limiter and SRP machinery on the auth path, and dispatch everything
//! else into the subsystems. TLS termination is external; the daemon
//! itself speaks plain HTTP on a loopback or operator-fronted address.
//!
//! Sensitive payloads (A, B, M1, M2, tokens, bundle contents) never reach
//! the logs — auth events carry only `{ event, client_ip, username }`.

use axum::extract::rejection::JsonRejection;
use axum::extract::{ConnectInfo, State};
use axum::http::HeaderMap;
use axum::middleware::from_fn_with_state;
use axum::routing::{get, post};
use axum::{Json, Router};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

pub mod middleware;

use crate::apply::bundle::{validate_bundle, BundleError, ConfigBundle};
use crate::apply::path::PathError;
use crate::apply::{Applier, ApplyError, CancelFlag};
use crate::auth::ratelimit::{Penalty, RateLimiter};
use crate::auth::SessionManager;
use crate::commands::{CommandError, CommandRunner};
use crate::error::ApiError;
use crate::lifecycle::{InactivityTracker, Sentinel, ShutdownManager};
use crate::srp::server::{SrpError, SrpServer};
use crate::sysinfo::SystemInspector;
use middleware::{client_ip, require_session};

/// Process-wide state shared by every handler.
pub struct AppState {
    pub srp: SrpServer,
    pub sessions: Arc<SessionManager>,
    pub limiter: Arc<RateLimiter>,
    pub applier: Applier,
    pub allow_list: Vec<String>,
    pub inspector: Arc<dyn SystemInspector>,
    pub runner: CommandRunner,
    pub sentinel: Sentinel,
    pub shutdown: Arc<ShutdownManager>,
    pub inactivity: Arc<InactivityTracker>,
}

/// Build the full router. `/auth/*` bypasses the session gate but consults
/// the rate limiter; everything else requires a valid bearer token.
pub fn router(state: Arc<AppState>) -> Router {
    let protected = Router::new()
        .route("/info", get(device_info))
        .route("/network", get(network_info))
        .route("/configure", post(configure))
        .route("/command", post(run_command))
        .route("/complete", post(complete))
        .route_layer(from_fn_with_state(Arc::clone(&state), require_session));

    Router::new()
        .route("/auth/srp/init", post(srp_init))
        .route("/auth/srp/verify", post(srp_verify))
        .merge(protected)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

// ── Wire types ──────────────────────────────────────────────────────

#[derive(Deserialize)]
struct SrpInitRequest {
    username: String,
    #[serde(rename = "A")]
    a: String,
}

#[derive(Serialize)]
struct SrpInitResponse {
    handshake_id: String,
    salt: String,
    #[serde(rename = "B")]
    b: String,
}

#[derive(Deserialize)]
struct SrpVerifyRequest {
    handshake_id: String,
    #[serde(rename = "M1")]
    m1: String,
}

#[derive(Serialize)]
struct SrpVerifyResponse {
    #[serde(rename = "M2")]
    m2: String,
    session_token: String,
}

#[derive(Deserialize)]
struct CommandRequest {
    id: String,
}

#[derive(Serialize)]
struct ConfigureResponse {
    status: &'static str,
    message: String,
}

#[derive(Serialize)]
struct CompleteResponse {
    status: &'static str,
    sentinel_file: String,
    message: String,
}

// ── Auth endpoints ──────────────────────────────────────────────────

async fn srp_init(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    connect: Option<ConnectInfo<SocketAddr>>,
    payload: Result<Json<SrpInitRequest>, JsonRejection>,
) -> Result<Json<SrpInitResponse>, ApiError> {
    let Json(request) = payload.map_err(bad_json)?;
    let ip = client_ip(&headers, connect.map(|c| c.0));
    check_rate_limit(&state, ip)?;

    let a_pub = STANDARD
        .decode(&request.a)
        .map_err(|_| ApiError::InvalidRequest("A is not valid base64".into()))?;

    match state.srp.init(&request.username, &a_pub).await {
        Ok(outcome) => Ok(Json(SrpInitResponse {
            handshake_id: outcome.handshake_id,
            salt: STANDARD.encode(outcome.salt),
            b: STANDARD.encode(outcome.b_pub),
        })),
        Err(err) => Err(auth_failure(&state, ip, &request.username, err)),
    }
}

async fn srp_verify(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    connect: Option<ConnectInfo<SocketAddr>>,
    payload: Result<Json<SrpVerifyRequest>, JsonRejection>,
) -> Result<Json<SrpVerifyResponse>, ApiError> {
    let Json(request) = payload.map_err(bad_json)?;
    let ip = client_ip(&headers, connect.map(|c| c.0));
    check_rate_limit(&state, ip)?;

    let m1 = STANDARD
        .decode(&request.m1)
        .map_err(|_| ApiError::InvalidRequest("M1 is not valid base64".into()))?;

    match state.srp.verify(&request.handshake_id, &m1) {
        Ok(outcome) => {
            let session_token = state.sessions.mint(&outcome.username);
            state.limiter.record_success(ip);
            info!(event = "auth_success", client_ip = %ip, username = %outcome.username, "Operator authenticated");
            Ok(Json(SrpVerifyResponse {
                m2: STANDARD.encode(outcome.m2),
                session_token,
            }))
        }
        Err(err) => Err(auth_failure(&state, ip, "", err)),
    }
}

fn check_rate_limit(state: &AppState, ip: IpAddr) -> Result<(), ApiError> {
    state.limiter.check(ip).map_err(|remaining| {
        warn!(event = "rate_limited", client_ip = %ip, retry_after = remaining, "Request refused during lockout");
        ApiError::RateLimited {
            retry_after_secs: remaining,
        }
    })
}

/// Map an SRP failure to the wire without an oracle: every cause reads as
/// *authentication failed*, and only genuine client failures feed the
/// rate limiter.
fn auth_failure(state: &AppState, ip: IpAddr, username: &str, err: SrpError) -> ApiError {
    match err {
        SrpError::Generator(ref cause) => {
            error!(event = "generator_failure", client_ip = %ip, "Password generator failed: {}", cause);
            ApiError::AuthenticationFailed { retry_after_secs: 0 }
        }
        _ => {
            warn!(event = "auth_failure", client_ip = %ip, username = %username, details = %err, "Authentication failed");
            match state.limiter.record_failure(ip) {
                Penalty::Backoff { retry_after_secs } => {
                    ApiError::AuthenticationFailed { retry_after_secs }
                }
                Penalty::Lockout { retry_after_secs } => {
                    ApiError::RateLimited { retry_after_secs }
                }
            }
        }
    }
}

// ── Inventory endpoints ─────────────────────────────────────────────

async fn device_info(
    State(state): State<Arc<AppState>>,
) -> Result<Json<crate::sysinfo::DeviceInfo>, ApiError> {
    let info = state
        .inspector
        .device_info()
        .map_err(|err| ApiError::internal(format!("inventory read failed: {err:#}")))?;
    Ok(Json(info))
}

async fn network_info(
    State(state): State<Arc<AppState>>,
) -> Result<Json<crate::sysinfo::NetworkInfo>, ApiError> {
    let info = state
        .inspector
        .network_info()
        .map_err(|err| ApiError::internal(format!("interface enumeration failed: {err:#}")))?;
    Ok(Json(info))
}

// ── Configure ───────────────────────────────────────────────────────

async fn configure(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<ConfigBundle>, JsonRejection>,
) -> Result<Json<ConfigureResponse>, ApiError> {
    let Json(bundle) = payload.map_err(bad_json)?;
    // A provisioned device takes no further configuration, even if the
    // sentinel appeared out-of-band or a racing /complete beat us here.
    if state.sentinel.exists() {
        return Err(ApiError::SentinelExists);
    }
    let decoded = validate_bundle(&bundle, &state.allow_list)?;
    let count = decoded.len();
    let total: usize = decoded.iter().map(|f| f.content.len()).sum();
    info!(files = count, bytes = total, "Applying configuration bundle");

    let applier = state.applier.clone();
    let cancel = CancelFlag::new();
    // Dropping this future (client disconnect) fires the guard and the
    // staging loop rolls back; defused once the apply has returned.
    let guard = cancel.drop_guard();
    let worker = cancel.clone();
    let applied = tokio::task::spawn_blocking(move || applier.apply(&decoded, &worker))
        .await
        .map_err(|err| ApiError::internal(format!("apply task failed: {err}")))??;
    guard.defuse();

    Ok(Json(ConfigureResponse {
        status: "success",
        message: format!("applied {} file(s)", applied),
    }))
}

// ── Command ─────────────────────────────────────────────────────────

async fn run_command(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<CommandRequest>, JsonRejection>,
) -> Result<Json<crate::commands::CommandOutcome>, ApiError> {
    let Json(request) = payload.map_err(bad_json)?;
    let outcome = state.runner.run(&request.id).await?;
    Ok(Json(outcome))
}

// ── Complete ────────────────────────────────────────────────────────

/// Create the sentinel, then fire the shutdown signal. Ordering matters
/// twice over: the sentinel lands before any drain begins (a crash in
/// between leaves the device marked provisioned, which is the safe side),
/// and graceful drain finishes this in-flight response before the
/// listener closes.
async fn complete(
    State(state): State<Arc<AppState>>,
) -> Result<Json<CompleteResponse>, ApiError> {
    state
        .sentinel
        .create("provisioning completed via /complete")
        .map_err(|err| ApiError::internal(format!("sentinel creation failed: {err}")))?;

    state.shutdown.shutdown("provisioning complete");

    Ok(Json(CompleteResponse {
        status: "shutting_down",
        sentinel_file: state.sentinel.path().display().to_string(),
        message: "provisioning complete; service will not restart".into(),
    }))
}

// ── Error conversions ───────────────────────────────────────────────

fn bad_json(rejection: JsonRejection) -> ApiError {
    ApiError::InvalidRequest(rejection.body_text())
}

impl From<BundleError> for ApiError {
    fn from(err: BundleError) -> Self {
        match &err {
            BundleError::TooManyFiles => ApiError::TooManyFiles,
            BundleError::TooLarge => ApiError::BundleTooLarge,
            BundleError::InvalidMode(_) => ApiError::InvalidFileMode,
            BundleError::Path { source, .. } => match source {
                PathError::NotAllowed => ApiError::PathNotAllowed(err.to_string()),
                _ => ApiError::InvalidPath(err.to_string()),
            },
            BundleError::Empty | BundleError::EmptyContent(_) | BundleError::Encoding(_) => {
                ApiError::InvalidRequest(err.to_string())
            }
        }
    }
}

impl From<ApplyError> for ApiError {
    fn from(err: ApplyError) -> Self {
        error!("Apply failed: {err}");
        ApiError::Internal(err.to_string())
    }
}

impl From<CommandError> for ApiError {
    fn from(err: CommandError) -> Self {
        match err {
            CommandError::NotAllowed(id) => ApiError::CommandNotAllowed(id),
            CommandError::Failed { .. } => ApiError::CommandFailed(err.to_string()),
        }
    }
}
