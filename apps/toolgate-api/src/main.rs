use std::convert::Infallible;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use async_stream::stream;
use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::header::{AUTHORIZATION, CONTENT_TYPE, WWW_AUTHENTICATE};
use axum::http::{HeaderMap, HeaderValue, Method, StatusCode};
use axum::response::Html;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response as HttpResponse};
use axum::routing::{get, post};
use axum::{Json, Router};
use clap::Parser;
use futures_util::Stream;
use serde::{Deserialize, Serialize};
use serde_json::json;
use toolgate_protocol::{AuditEvent, Permission, RequestId, Response, ToolDefinition};
use toolgate_server::{GatewayBuilder, GatewayConfig, HttpConfig, InvocationServer};
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

mod openapi;

/// Permission a capability token needs to read the audit trail.
const AUDIT_READ: &str = "audit:read";

use crate::openapi::{openapi_spec, scalar_docs_html};

#[derive(Debug, Parser)]
#[command(name = "toolgate-api")]
#[command(about = "Capability-gated tool invocation gateway")]
struct Cli {
    /// Gateway configuration (TOML). Defaults apply when omitted.
    #[arg(long)]
    config: Option<PathBuf>,
    #[arg(long, default_value = "127.0.0.1:8787")]
    listen: SocketAddr,
}

#[derive(Clone)]
struct AppState {
    server: InvocationServer,
}

#[derive(Debug, Serialize)]
struct ToolCatalog {
    tools: Vec<ToolDefinition>,
}

#[derive(Debug, Deserialize, Default)]
struct AuditStreamQuery {
    tool_id: Option<String>,
    caller_id: Option<String>,
}

impl AuditStreamQuery {
    fn matches(&self, event: &AuditEvent) -> bool {
        self.tool_id.as_deref().is_none_or(|id| id == event.tool_id)
            && self
                .caller_id
                .as_deref()
                .is_none_or(|id| id == event.caller_id.as_str())
    }
}

#[derive(Debug)]
struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn unauthorized(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::UNAUTHORIZED,
            message: message.into(),
        }
    }

    fn forbidden(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::FORBIDDEN,
            message: message.into(),
        }
    }

    fn not_found(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            message: message.into(),
        }
    }

    fn internal(error: impl std::fmt::Display) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: error.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> HttpResponse {
        let mut response = (self.status, Json(json!({ "error": self.message }))).into_response();
        if self.status == StatusCode::UNAUTHORIZED {
            response
                .headers_mut()
                .insert(WWW_AUTHENTICATE, HeaderValue::from_static("Bearer"));
        }
        response
    }
}

type ApiResult<T> = Result<T, ApiError>;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .json()
        .init();

    let cli = Cli::parse();
    let config = match &cli.config {
        Some(path) => GatewayConfig::load(path)
            .with_context(|| format!("loading configuration from {}", path.display()))?,
        None => GatewayConfig::default(),
    };
    let cors = cors_layer(&config.http)?;
    let server = GatewayBuilder::from_config(&config)
        .context("assembling the gateway from configuration")?
        .build()?;

    let listener = tokio::net::TcpListener::bind(cli.listen).await?;
    info!(
        listen = %cli.listen,
        data_dir = %config.data_dir.display(),
        tools = server.registry().len(),
        "toolgate-api listening"
    );

    axum::serve(listener, router(AppState { server }, cors))
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}

fn router(state: AppState, cors: CorsLayer) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/openapi.json", get(openapi_json))
        .route("/docs", get(docs))
        .route("/docs/", get(docs))
        .route("/invoke", post(invoke))
        .route("/tools", get(list_tools))
        .route("/audit/stream", get(stream_audit))
        .route("/audit/{request_id}", get(get_audit))
        .with_state(state)
        .layer(cors)
        .layer(TraceLayer::new_for_http())
}

/// Cross-origin access limited to the configured origins.
fn cors_layer(config: &HttpConfig) -> Result<CorsLayer> {
    let origins = config
        .allowed_origins
        .iter()
        .map(|origin| {
            HeaderValue::from_str(origin).with_context(|| format!("invalid CORS origin {origin:?}"))
        })
        .collect::<Result<Vec<_>>>()?;
    Ok(CorsLayer::new()
        .allow_origin(AllowOrigin::list(origins))
        .allow_methods([Method::GET, Method::POST])
        .allow_headers([AUTHORIZATION, CONTENT_TYPE]))
}

/// Require a bearer capability token granting `audit:read`.
fn authorize_audit_read(state: &AppState, headers: &HeaderMap) -> ApiResult<()> {
    let token = headers
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|token| !token.is_empty())
        .ok_or_else(|| ApiError::unauthorized("bearer capability token required"))?;
    let claims = state
        .server
        .verifier()
        .check(token)
        .map_err(|rejection| ApiError::unauthorized(format!("invalid capability token: {rejection}")))?;

    let required = Permission::new(AUDIT_READ);
    if !claims.permissions.iter().any(|held| held.covers(&required)) {
        warn!(subject = %claims.sub, "audit read denied");
        return Err(ApiError::forbidden(format!("token lacks {AUDIT_READ}")));
    }
    Ok(())
}

async fn healthz() -> Json<serde_json::Value> {
    Json(json!({
        "status": "ok",
        "service": "toolgate-api"
    }))
}

async fn openapi_json() -> Json<serde_json::Value> {
    Json(openapi_spec())
}

async fn docs() -> Html<String> {
    Html(scalar_docs_html("/openapi.json"))
}

/// The body is parsed by the gateway so malformed input still gets a signed
/// response envelope.
async fn invoke(State(state): State<AppState>, body: Bytes) -> (StatusCode, Json<Response>) {
    let response = state.server.invoke_bytes(&body).await;
    (http_status(&response), Json(response))
}

async fn list_tools(State(state): State<AppState>) -> Json<ToolCatalog> {
    Json(ToolCatalog {
        tools: state.server.registry().definitions().cloned().collect(),
    })
}

async fn get_audit(
    Path(request_id): Path<String>,
    State(state): State<AppState>,
    headers: HeaderMap,
) -> ApiResult<Json<AuditEvent>> {
    authorize_audit_read(&state, &headers)?;
    state
        .server
        .audit()
        .find(&RequestId::from(request_id.as_str()))
        .await
        .map_err(ApiError::internal)?
        .map(Json)
        .ok_or_else(|| ApiError::not_found(format!("no audit record for {request_id}")))
}

async fn stream_audit(
    Query(query): Query<AuditStreamQuery>,
    State(state): State<AppState>,
    headers: HeaderMap,
) -> ApiResult<Sse<impl Stream<Item = Result<Event, Infallible>>>> {
    authorize_audit_read(&state, &headers)?;
    let mut subscription = state.server.audit().hub().subscribe();
    let stream = stream! {
        loop {
            match subscription.recv().await {
                Ok(event) => {
                    if query.matches(&event) {
                        yield Ok(as_sse_event(&event));
                    }
                }
                Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "audit stream subscriber lagged");
                    let lag_payload = json!({ "skipped": skipped }).to_string();
                    yield Ok(Event::default().event("stream.lagged").data(lag_payload));
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    };

    Ok(Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(15))
            .text("keep-alive"),
    ))
}

/// 200 for success, otherwise the envelope's own code.
fn http_status(response: &Response) -> StatusCode {
    if response.is_ok() {
        return StatusCode::OK;
    }
    u16::try_from(response.code)
        .ok()
        .and_then(|code| StatusCode::from_u16(code).ok())
        .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
}

fn as_sse_event(event: &AuditEvent) -> Event {
    let payload = serde_json::to_string(event)
        .unwrap_or_else(|error| json!({ "error": error.to_string() }).to_string());
    Event::default()
        .id(event.event_id.to_string())
        .event("audit.event")
        .data(payload)
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(error) = tokio::signal::ctrl_c().await {
            tracing::error!(%error, "failed to install Ctrl+C handler");
        }
    };

    #[cfg(unix)]
    {
        let terminate = async {
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(mut signal) => {
                    signal.recv().await;
                }
                Err(error) => {
                    tracing::error!(%error, "failed to install SIGTERM handler");
                }
            }
        };

        tokio::select! {
            _ = ctrl_c => {},
            _ = terminate => {},
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await;
    }
}
