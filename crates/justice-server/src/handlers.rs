//! RPC method handlers organized by domain.

use std::sync::Arc;

use justice_core::errors::AdmissionError;
use justice_core::ids::{CaseId, ParticipantId};
use justice_core::turns::Party;
use justice_store::{CaseMode, CaseRepo, CaseStatus, Database, MessageRepo, NewCase, StoreError};
use justice_telemetry::TelemetryGuard;

use crate::rooms::RoomRegistry;
use crate::rpc::{self, RpcResponse};
use crate::sessions::{SessionError, SessionService};

/// Default page size for `room.history`.
const HISTORY_LIMIT: i64 = 500;

/// Shared state available to all RPC handlers.
pub struct HandlerState {
    pub db: Database,
    pub cases: Arc<CaseRepo>,
    pub messages: Arc<MessageRepo>,
    pub rooms: Arc<RoomRegistry>,
    pub sessions: Arc<SessionService>,
    pub telemetry: Option<Arc<TelemetryGuard>>,
}

impl HandlerState {
    pub fn new(
        db: Database,
        cases: Arc<CaseRepo>,
        messages: Arc<MessageRepo>,
        rooms: Arc<RoomRegistry>,
        sessions: Arc<SessionService>,
    ) -> Self {
        Self {
            db,
            cases,
            messages,
            rooms,
            sessions,
            telemetry: None,
        }
    }

    pub fn with_telemetry(mut self, telemetry: Arc<TelemetryGuard>) -> Self {
        self.telemetry = Some(telemetry);
        self
    }
}

/// Dispatch an RPC method to the appropriate handler.
///
/// Params are normalized to snake_case before routing.
pub async fn dispatch(
    state: &Arc<HandlerState>,
    method: &str,
    params: &serde_json::Value,
    id: Option<serde_json::Value>,
) -> RpcResponse {
    let params = rpc::normalize_params(params);

    match method {
        // Cases
        "case.create" => case_create(state, &params, id),
        "case.get" => case_get(state, &params, id),
        "case.list" => case_list(state, id),
        "case.addParticipant" => case_add_participant(state, &params, id),
        "case.updateStatus" => case_update_status(state, &params, id),

        // Adversarial sessions
        "session.start" => session_start(state, &params, id).await,
        "session.submitTurn" => session_submit_turn(state, &params, id).await,
        "session.get" => session_get(state, &params, id).await,

        // Rooms
        "room.history" => room_history(state, &params, id).await,
        "room.members" => room_members(state, &params, id),

        // System
        "system.ping" | "health" => health(state, id),
        "system.logs" | "telemetry.logs" => system_logs(state, &params, id),

        _ => RpcResponse::method_not_found(id, method),
    }
}

fn store_error(id: Option<serde_json::Value>, e: StoreError) -> RpcResponse {
    match e {
        StoreError::NotFound(what) => RpcResponse::not_found(id, format!("Not found: {what}")),
        StoreError::Conflict(msg) => RpcResponse::invalid_params(id, msg),
        other => RpcResponse::internal_error(id, other.to_string()),
    }
}

fn session_error(id: Option<serde_json::Value>, e: SessionError) -> RpcResponse {
    RpcResponse::error(id, e.code(), e.to_string())
}

fn admission_error(id: Option<serde_json::Value>, e: AdmissionError) -> RpcResponse {
    match e {
        AdmissionError::NotFound(_) => RpcResponse::not_found(id, e.to_string()),
        AdmissionError::Forbidden { .. } => RpcResponse::error(id, rpc::FORBIDDEN, e.to_string()),
        other => RpcResponse::internal_error(id, other.to_string()),
    }
}

fn case_id_param(params: &serde_json::Value) -> Result<CaseId, String> {
    rpc::require_str(params, "case_id").map(CaseId::from_raw)
}

// ── Case handlers ──

fn case_create(
    state: &Arc<HandlerState>,
    params: &serde_json::Value,
    id: Option<serde_json::Value>,
) -> RpcResponse {
    let title = match rpc::require_str(params, "title") {
        Ok(s) => s.to_string(),
        Err(e) => return RpcResponse::invalid_params(id, e),
    };
    let owner = match rpc::require_str(params, "owner") {
        Ok(s) => ParticipantId::from_raw(s),
        Err(e) => return RpcResponse::invalid_params(id, e),
    };
    let mode = match rpc::optional_str(params, "mode").map(str::parse::<CaseMode>) {
        None => CaseMode::HumanHuman,
        Some(Ok(mode)) => mode,
        Some(Err(e)) => return RpcResponse::invalid_params(id, e),
    };
    let description = rpc::optional_str(params, "description")
        .unwrap_or_default()
        .to_string();

    let new = NewCase {
        title,
        description,
        mode,
        owner,
    };
    match state.cases.create(&new) {
        Ok(case) => RpcResponse::success(id, serde_json::json!(case)),
        Err(e) => store_error(id, e),
    }
}

fn case_get(
    state: &Arc<HandlerState>,
    params: &serde_json::Value,
    id: Option<serde_json::Value>,
) -> RpcResponse {
    let case_id = match case_id_param(params) {
        Ok(c) => c,
        Err(e) => return RpcResponse::invalid_params(id, e),
    };
    match state.cases.get(&case_id) {
        Ok(case) => RpcResponse::success(id, serde_json::json!(case)),
        Err(e) => store_error(id, e),
    }
}

fn case_list(state: &Arc<HandlerState>, id: Option<serde_json::Value>) -> RpcResponse {
    match state.cases.list() {
        Ok(cases) => RpcResponse::success(
            id,
            serde_json::json!({
                "cases": cases,
                "totalCount": cases.len(),
            }),
        ),
        Err(e) => store_error(id, e),
    }
}

fn case_add_participant(
    state: &Arc<HandlerState>,
    params: &serde_json::Value,
    id: Option<serde_json::Value>,
) -> RpcResponse {
    let case_id = match case_id_param(params) {
        Ok(c) => c,
        Err(e) => return RpcResponse::invalid_params(id, e),
    };
    let address = match rpc::require_str(params, "address") {
        Ok(s) => ParticipantId::from_raw(s),
        Err(e) => return RpcResponse::invalid_params(id, e),
    };
    match state.cases.add_participant(&case_id, &address) {
        Ok(case) => RpcResponse::success(id, serde_json::json!(case)),
        Err(e) => store_error(id, e),
    }
}

fn case_update_status(
    state: &Arc<HandlerState>,
    params: &serde_json::Value,
    id: Option<serde_json::Value>,
) -> RpcResponse {
    let case_id = match case_id_param(params) {
        Ok(c) => c,
        Err(e) => return RpcResponse::invalid_params(id, e),
    };
    let status = match rpc::require_str(params, "status").and_then(|s| s.parse::<CaseStatus>()) {
        Ok(s) => s,
        Err(e) => return RpcResponse::invalid_params(id, e),
    };
    match state.cases.update_status(&case_id, status) {
        Ok(case) => RpcResponse::success(id, serde_json::json!(case)),
        Err(e) => store_error(id, e),
    }
}

// ── Session handlers ──

async fn session_start(
    state: &Arc<HandlerState>,
    params: &serde_json::Value,
    id: Option<serde_json::Value>,
) -> RpcResponse {
    let case_id = match case_id_param(params) {
        Ok(c) => c,
        Err(e) => return RpcResponse::invalid_params(id, e),
    };
    match state.sessions.start(&case_id).await {
        Ok(snapshot) => RpcResponse::success(id, serde_json::json!({ "state": snapshot })),
        Err(e) => session_error(id, e),
    }
}

/// Submit as a party (`speaker`: "a" | "b") or as a seated `identity`.
async fn session_submit_turn(
    state: &Arc<HandlerState>,
    params: &serde_json::Value,
    id: Option<serde_json::Value>,
) -> RpcResponse {
    let case_id = match case_id_param(params) {
        Ok(c) => c,
        Err(e) => return RpcResponse::invalid_params(id, e),
    };
    let input = rpc::optional_str(params, "input");
    let expected_turn = match rpc::optional_u32(params, "expected_turn") {
        Ok(t) => t,
        Err(e) => return RpcResponse::invalid_params(id, e),
    };

    let result = match (
        rpc::optional_str(params, "speaker"),
        rpc::optional_str(params, "identity"),
    ) {
        (Some(speaker), _) => {
            let speaker = match speaker.parse::<Party>() {
                Ok(p) => p,
                Err(e) => return RpcResponse::invalid_params(id, e),
            };
            state
                .sessions
                .submit(&case_id, speaker, input, expected_turn)
                .await
        }
        (None, Some(identity)) => {
            let identity = ParticipantId::from_raw(identity);
            state
                .sessions
                .submit_as(&case_id, &identity, input, expected_turn)
                .await
        }
        (None, None) => {
            return RpcResponse::invalid_params(id, "Missing required parameter: speaker")
        }
    };

    match result {
        Ok(snapshot) => RpcResponse::success(id, serde_json::json!({ "state": snapshot })),
        Err(e) => session_error(id, e),
    }
}

async fn session_get(
    state: &Arc<HandlerState>,
    params: &serde_json::Value,
    id: Option<serde_json::Value>,
) -> RpcResponse {
    let case_id = match case_id_param(params) {
        Ok(c) => c,
        Err(e) => return RpcResponse::invalid_params(id, e),
    };
    match state.sessions.snapshot(&case_id).await {
        Some(snapshot) => RpcResponse::success(id, serde_json::json!({ "state": snapshot })),
        None => RpcResponse::not_found(id, format!("No session for case {case_id}")),
    }
}

// ── Room handlers ──

/// The ledger of a case, readable by its participants only.
async fn room_history(
    state: &Arc<HandlerState>,
    params: &serde_json::Value,
    id: Option<serde_json::Value>,
) -> RpcResponse {
    let case_id = match case_id_param(params) {
        Ok(c) => c,
        Err(e) => return RpcResponse::invalid_params(id, e),
    };
    let identity = match rpc::require_str(params, "identity") {
        Ok(s) => ParticipantId::from_raw(s),
        Err(e) => return RpcResponse::invalid_params(id, e),
    };
    if let Err(e) = state.rooms.authorize(&case_id, &identity).await {
        return admission_error(id, e);
    }
    let after = rpc::optional_i64(params, "after_sequence").unwrap_or(0);
    let limit = rpc::optional_i64(params, "limit").unwrap_or(HISTORY_LIMIT);

    match state.messages.read_since(&case_id, after, Some(limit)) {
        Ok(messages) => {
            let last_sequence = messages.last().and_then(|m| m.sequence);
            RpcResponse::success(
                id,
                serde_json::json!({
                    "messages": messages,
                    "count": messages.len(),
                    "lastSequence": last_sequence,
                }),
            )
        }
        Err(e) => store_error(id, e),
    }
}

fn room_members(
    state: &Arc<HandlerState>,
    params: &serde_json::Value,
    id: Option<serde_json::Value>,
) -> RpcResponse {
    let case_id = match case_id_param(params) {
        Ok(c) => c,
        Err(e) => return RpcResponse::invalid_params(id, e),
    };
    let members = state.rooms.members(&case_id);
    RpcResponse::success(
        id,
        serde_json::json!({
            "members": members,
            "count": members.len(),
        }),
    )
}

// ── System handlers ──

fn system_logs(
    state: &Arc<HandlerState>,
    params: &serde_json::Value,
    id: Option<serde_json::Value>,
) -> RpcResponse {
    let Some(log_sink) = state.telemetry.as_ref().and_then(|t| t.logs()) else {
        return RpcResponse::success(
            id,
            serde_json::json!({
                "logs": [],
                "totalCount": 0,
                "enabled": false,
            }),
        );
    };

    let min_level = match rpc::optional_str(params, "level").map(str::parse::<tracing::Level>) {
        None => None,
        Some(Ok(level)) => Some(level),
        Some(Err(_)) => {
            return RpcResponse::invalid_params(
                id,
                "level must be one of error, warn, info, debug, trace",
            )
        }
    };
    let limit = match rpc::optional_u32(params, "limit") {
        Ok(l) => l,
        Err(e) => return RpcResponse::invalid_params(id, e),
    };
    let query = justice_telemetry::LogQuery {
        min_level,
        case_id: rpc::optional_str(params, "case_id").map(str::to_string),
        connection_id: rpc::optional_str(params, "connection_id").map(str::to_string),
        since: rpc::optional_str(params, "since").map(str::to_string),
        limit,
    };

    let result = log_sink
        .query(&query)
        .and_then(|records| Ok((log_sink.count(&query)?, records)));
    match result {
        Ok((total, records)) => RpcResponse::success(
            id,
            serde_json::json!({
                "totalCount": total,
                "logs": records,
                "enabled": true,
            }),
        ),
        Err(e) => RpcResponse::internal_error(id, e.to_string()),
    }
}

fn health(state: &Arc<HandlerState>, id: Option<serde_json::Value>) -> RpcResponse {
    let db_ok = state
        .db
        .with_conn(|conn| {
            conn.execute_batch("SELECT 1")?;
            Ok(true)
        })
        .unwrap_or(false);

    RpcResponse::success(
        id,
        serde_json::json!({
            "status": if db_ok { "healthy" } else { "degraded" },
            "components": {
                "database": if db_ok { "ok" } else { "error" },
            },
            "rooms": state.rooms.room_count(),
        }),
    )
}
