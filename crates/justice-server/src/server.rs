use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{Path, State};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use futures::StreamExt;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;

use justice_core::collab::{Evaluator, Reasoner};
use justice_core::ids::{CaseId, ParticipantId};
use justice_judge::{CoinFlip, JudgeConfig};
use justice_store::{CaseRepo, Database, MessageRepo};
use justice_telemetry::TelemetryGuard;

use crate::broadcast::Broadcaster;
use crate::gateway::{GatewayConfig, RoomMode, SessionGateway};
use crate::handlers::HandlerState;
use crate::rooms::RoomRegistry;
use crate::rpc::{RpcRequest, RpcResponse};
use crate::sessions::SessionService;

/// Server configuration.
#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub bind_addr: String,
    pub port: u16,
    pub max_send_queue: usize,
    pub idle_timeout: Duration,
    pub heartbeat_interval: Duration,
    pub max_message_len: usize,
    pub judge: JudgeConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        let gateway = GatewayConfig::default();
        Self {
            bind_addr: "0.0.0.0".into(),
            port: 8000,
            max_send_queue: 256,
            idle_timeout: gateway.idle_timeout,
            heartbeat_interval: gateway.heartbeat_interval,
            max_message_len: gateway.max_message_len,
            judge: JudgeConfig::default(),
        }
    }
}

impl ServerConfig {
    fn gateway(&self) -> GatewayConfig {
        GatewayConfig {
            heartbeat_interval: self.heartbeat_interval,
            idle_timeout: self.idle_timeout,
            max_message_len: self.max_message_len,
        }
    }
}

/// External collaborators the server is built from.
pub struct ServerDeps {
    pub db: Database,
    pub reasoner: Arc<dyn Reasoner>,
    pub evaluator: Arc<dyn Evaluator>,
    pub coin: Arc<dyn CoinFlip>,
    pub telemetry: Option<Arc<TelemetryGuard>>,
}

/// Shared application state passed to Axum handlers.
#[derive(Clone)]
pub struct AppState {
    pub handler_state: Arc<HandlerState>,
    pub gateway: Arc<SessionGateway>,
}

/// Build the Axum router with all routes.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/ws/{case_id}/{identity}", get(chat_ws_handler))
        .route("/ws/hai/{case_id}/{identity}", get(court_ws_handler))
        .route("/rpc", post(rpc_handler))
        .route("/health", get(health_handler))
        .with_state(state)
        .layer(CorsLayer::permissive())
}

/// Wire the components together and start serving. Returns a handle to shut
/// it down.
pub async fn start(config: ServerConfig, deps: ServerDeps) -> Result<ServerHandle, std::io::Error> {
    let cases = Arc::new(CaseRepo::new(deps.db.clone()));
    let messages = Arc::new(MessageRepo::new(deps.db.clone()));
    let rooms = Arc::new(RoomRegistry::new(cases.clone(), config.max_send_queue));
    let broadcaster = Arc::new(Broadcaster::new(messages.clone(), rooms.clone()));
    let sessions = Arc::new(SessionService::new(
        cases.clone(),
        broadcaster.clone(),
        deps.reasoner,
        deps.evaluator,
        deps.coin,
        config.judge.clone(),
    ));
    let gateway = Arc::new(SessionGateway::new(
        broadcaster,
        sessions.clone(),
        config.gateway(),
    ));

    let mut handler_state = HandlerState::new(deps.db, cases, messages, rooms, sessions);
    if let Some(telemetry) = deps.telemetry {
        handler_state = handler_state.with_telemetry(telemetry);
    }

    let router = build_router(AppState {
        handler_state: Arc::new(handler_state),
        gateway,
    });

    let addr = format!("{}:{}", config.bind_addr, config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    let local_addr = listener.local_addr()?;

    tracing::info!(addr = %local_addr, "justice server started");

    let cancel = CancellationToken::new();
    let shutdown = cancel.clone();
    let server = tokio::spawn(async move {
        let result = axum::serve(listener, router)
            .with_graceful_shutdown(async move { shutdown.cancelled().await })
            .await;
        if let Err(e) = result {
            tracing::error!(error = %e, "server stopped with error");
        }
    });

    Ok(ServerHandle {
        addr: local_addr,
        port: local_addr.port(),
        cancel,
        server,
    })
}

/// Handle returned by `start()`.
pub struct ServerHandle {
    pub addr: SocketAddr,
    pub port: u16,
    cancel: CancellationToken,
    server: tokio::task::JoinHandle<()>,
}

impl ServerHandle {
    /// Stop accepting connections and wait for the server task to finish.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        if let Err(e) = self.server.await {
            tracing::warn!(error = %e, "server task ended abnormally");
        }
        tracing::info!("justice server stopped");
    }
}

async fn chat_ws_handler(
    ws: WebSocketUpgrade,
    Path((case_id, identity)): Path<(String, String)>,
    State(state): State<AppState>,
) -> impl IntoResponse {
    upgrade(ws, state, RoomMode::Chat, case_id, identity)
}

async fn court_ws_handler(
    ws: WebSocketUpgrade,
    Path((case_id, identity)): Path<(String, String)>,
    State(state): State<AppState>,
) -> impl IntoResponse {
    upgrade(ws, state, RoomMode::Adversarial, case_id, identity)
}

fn upgrade(
    ws: WebSocketUpgrade,
    state: AppState,
    mode: RoomMode,
    case_id: String,
    identity: String,
) -> impl IntoResponse {
    let case_id = CaseId::from_raw(case_id);
    let identity = ParticipantId::from_raw(identity);
    ws.on_upgrade(move |socket| async move {
        let (sink, stream) = socket.split();
        state
            .gateway
            .serve(mode, case_id, identity, sink, stream)
            .await;
    })
}

/// JSON-RPC over HTTP. The body is parsed here so malformed JSON gets the
/// envelope's `PARSE_ERROR` rather than a bare 4xx.
async fn rpc_handler(State(state): State<AppState>, body: String) -> impl IntoResponse {
    let request: RpcRequest = match serde_json::from_str(&body) {
        Ok(req) => req,
        Err(_) => return Json(RpcResponse::parse_error()),
    };
    let params = request.params.unwrap_or(serde_json::json!({}));
    let handler_state = &state.handler_state;
    Json(crate::handlers::dispatch(handler_state, &request.method, &params, request.id).await)
}

/// Health check HTTP endpoint.
async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    let resp = crate::handlers::dispatch(
        &state.handler_state,
        "health",
        &serde_json::json!({}),
        None,
    )
    .await;

    let status = resp
        .result
        .as_ref()
        .and_then(|r| r.get("status"))
        .and_then(|s| s.as_str())
        .unwrap_or("unknown");

    let http_status = if status == "healthy" {
        axum::http::StatusCode::OK
    } else {
        axum::http::StatusCode::SERVICE_UNAVAILABLE
    };

    (http_status, Json(resp.result.unwrap_or_default()))
}
