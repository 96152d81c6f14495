// SPDX-License-Identifier: MIT OR Apache-2.0
//! HTTP control-plane API: the tool-dispatch endpoint, the artifact upload/
//! download side channel, and the `/events` SSE push stream.
//!
//! Every tool is reached through one route, `POST /tools/{tool}`, dispatched
//! by name in [`call_tool`]. Handlers pull fields out of a bare
//! [`serde_json::Value`] body via [`crate::validation`] rather than deriving
//! one request struct per tool; the wire shape is intentionally uniform.

use crate::{validation, AppState};
use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::{header, HeaderMap, StatusCode},
    response::sse::{Event, KeepAlive, Sse},
    response::{IntoResponse, Response},
    Json,
};
use chrono::Utc;
use hub_artifacts::{CreateArtifactRequest, FinalizeUploadRequest};
use hub_blob::{lossless_auto_encode, lossless_decode, sha256_hex};
use hub_board::{CreateTaskRequest, ListPage, TaskFilter, UpdateTaskPatch};
use hub_claim::compute_poll_backoff;
use hub_consensus::{ConsensusKnobs, EmitBlobRefPolicy, ResolveRequest, VoteSource};
use hub_core::{
    Agent, AgentLifecycle, AgentStatus, BlobRef, Cursor, ExecutionMode, MessageCursor,
    RuntimeProfile, TaskCursor, TaskPriority, TaskStatus, TicketKind, Vote,
};
use hub_error::{ErrorCategory, ErrorCode, HubError, HubErrorDto, HubResult};
use hub_gate::DoneGateInput;
use hub_messages::ReadQuery;
use hub_registry::RegisterRequest;
use hub_telemetry::WaitStream;
use hub_waitloop::{
    normalize_poll_interval_ms, normalize_wait_ms, poll_until_change, render, BackoffConfig,
    ResponseShape, SseFrame, WaitOutcome,
};
use hub_watermark::{Stream as WatermarkStream, WatermarkFallback};
use rand::Rng;
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;
use tokio_stream::wrappers::ReceiverStream;
use tracing::warn;
use uuid::Uuid;

/// Wraps a [`HubError`] so it can cross the axum response boundary; neither
/// `HubError` nor `IntoResponse` is local to this crate.
pub struct ApiError(HubError);

impl From<HubError> for ApiError {
    fn from(err: HubError) -> Self {
        ApiError(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = status_for_category(self.0.code.category());
        let dto = HubErrorDto::from(&self.0);
        (status, Json(dto)).into_response()
    }
}

fn status_for_category(category: ErrorCategory) -> StatusCode {
    match category {
        ErrorCategory::Input => StatusCode::BAD_REQUEST,
        ErrorCategory::Auth => StatusCode::UNAUTHORIZED,
        ErrorCategory::Task | ErrorCategory::DoneGate | ErrorCategory::Consensus => {
            StatusCode::CONFLICT
        }
        ErrorCategory::Artifact => StatusCode::NOT_FOUND,
        ErrorCategory::System => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn to_json<T: serde::Serialize>(value: &T) -> HubResult<Value> {
    serde_json::to_value(value).map_err(|e| {
        HubError::new(ErrorCode::SerializationError, "response serialization failed")
            .with_source(e)
    })
}

/// Deserializes an optional, snake-case enum field (`TaskPriority`,
/// `ExecutionMode`, `ConsistencyMode`, `TaskStatus`, `AgentLifecycle`, ...),
/// mapping any shape mismatch to [`ErrorCode::InvalidPayload`].
fn optional_enum<T: DeserializeOwned>(body: &Value, field: &str) -> HubResult<Option<T>> {
    match body.get(field) {
        None | Some(Value::Null) => Ok(None),
        Some(v) => serde_json::from_value(v.clone()).map(Some).map_err(|_| {
            HubError::new(
                ErrorCode::InvalidPayload,
                format!("field `{field}` has an invalid value"),
            )
        }),
    }
}

fn require_enum<T: DeserializeOwned>(body: &Value, field: &str) -> HubResult<T> {
    optional_enum(body, field)?.ok_or_else(|| {
        HubError::new(
            ErrorCode::InvalidPayload,
            format!("missing required field `{field}`"),
        )
    })
}

// ---------------------------------------------------------------------------
// Health
// ---------------------------------------------------------------------------

/// `GET /health`.
pub async fn get_health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "contract_version": hub_core::CONTRACT_VERSION,
        "time": Utc::now().to_rfc3339(),
        "config": state.config.to_snapshot(),
        "kpi": state.kpi.snapshot(),
        "transport": state.transport.snapshot(),
    }))
}

// ---------------------------------------------------------------------------
// Tool dispatch
// ---------------------------------------------------------------------------

/// `POST /tools/{tool}`.
///
/// Wraps [`call_tool`] with idempotency replay: when the body carries an
/// `idempotency_key`, the first response for `(actor, tool, key)` is
/// persisted to `idempotency_keys` and replayed byte-identically on retry
/// within the configured TTL.
pub async fn dispatch_tool(
    State(state): State<Arc<AppState>>,
    Path(tool): Path<String>,
    Json(body): Json<Value>,
) -> Result<Json<Value>, ApiError> {
    let idempotency_key = validation::optional_str(&body, "idempotency_key")?;

    if let Some(key) = idempotency_key {
        validation::validate_idempotency_key(key)?;
        let actor = idempotency_actor(&body);
        if let Some(cached) = load_idempotent(&state, &actor, &tool, key).await? {
            return Ok(Json(cached));
        }
        let result = call_tool(&state, &tool, &body).await;
        state.kpi.record_tool_call(result.is_ok());
        match result {
            Ok(value) => {
                store_idempotent(&state, &actor, &tool, key, &value).await?;
                Ok(Json(value))
            }
            Err(err) => Err(err.into()),
        }
    } else {
        let result = call_tool(&state, &tool, &body).await;
        state.kpi.record_tool_call(result.is_ok());
        result.map(Json).map_err(ApiError::from)
    }
}

/// Best-effort actor identity used to scope idempotency replay. Tools each
/// name their caller differently (`agent_id`, `from`, `creator`,
/// `requesting_agent`); the first one present wins.
fn idempotency_actor(body: &Value) -> String {
    for field in ["agent_id", "from", "creator", "requesting_agent"] {
        if let Ok(Some(v)) = validation::optional_str(body, field) {
            return v.to_string();
        }
    }
    "anonymous".to_string()
}

async fn load_idempotent(
    state: &AppState,
    actor: &str,
    tool: &str,
    key: &str,
) -> HubResult<Option<Value>> {
    let row: Option<(String,)> = sqlx::query_as(
        "SELECT response FROM idempotency_keys WHERE agent_id = ? AND tool = ? AND key = ?",
    )
    .bind(actor)
    .bind(tool)
    .bind(key)
    .fetch_optional(state.store.pool())
    .await?;
    match row {
        Some((raw,)) => {
            let value = serde_json::from_str(&raw).map_err(|e| {
                HubError::new(
                    ErrorCode::SerializationError,
                    "stored idempotent response is not valid json",
                )
                .with_source(e)
            })?;
            Ok(Some(value))
        }
        None => Ok(None),
    }
}

async fn store_idempotent(
    state: &AppState,
    actor: &str,
    tool: &str,
    key: &str,
    response: &Value,
) -> HubResult<()> {
    let raw = serde_json::to_string(response).map_err(|e| {
        HubError::new(
            ErrorCode::SerializationError,
            "idempotent response serialization failed",
        )
        .with_source(e)
    })?;
    let now = hub_store::now_str();
    sqlx::query(
        "INSERT OR REPLACE INTO idempotency_keys (agent_id, tool, key, response, created_at) VALUES (?, ?, ?, ?, ?)",
    )
    .bind(actor)
    .bind(tool)
    .bind(key)
    .bind(raw)
    .bind(now)
    .execute(state.store.pool())
    .await?;
    Ok(())
}

/// Routes a single tool call by name. One consistent error shape
/// ([`HubErrorDto`]) covers every branch.
async fn call_tool(state: &AppState, tool: &str, body: &Value) -> HubResult<Value> {
    match tool {
        // -- Agents --
        "register_agent" => tool_register_agent(state, body).await,
        "update_runtime_profile" => tool_update_runtime_profile(state, body).await,
        "list_agents" => tool_list_agents(state, body).await,

        // -- Messaging --
        "send_message" => tool_send_message(state, body).await,
        "send_blob_message" => tool_send_blob_message(state, body).await,
        "read_messages" => tool_read_messages(state, body).await,

        // -- Tasks --
        "create_task" => tool_create_task(state, body).await,
        "update_task" => tool_update_task(state, body).await,
        "list_tasks" => tool_list_tasks(state, body).await,
        "poll_and_claim" => tool_poll_and_claim(state, body).await,
        "claim_task" => tool_claim_task(state, body).await,
        "renew_task_claim" => tool_renew_task_claim(state, body).await,
        "release_task_claim" => tool_release_task_claim(state, body).await,
        "list_task_claims" => tool_list_task_claims(state, body).await,
        "delete_task" => tool_delete_task(state, body).await,
        "attach_task_artifact" => tool_attach_task_artifact(state, body).await,
        "list_task_artifacts" => tool_list_task_artifacts(state, body).await,
        "get_task_handoff" => tool_get_task_handoff(state, body).await,

        // -- Context --
        "share_context" => tool_share_context(state, body).await,
        "share_blob_context" => tool_share_blob_context(state, body).await,
        "get_context" => tool_get_context(state, body).await,

        // -- Consensus --
        "resolve_consensus" => tool_resolve_consensus(state, body).await,
        "resolve_consensus_from_context" => tool_resolve_consensus_from_context(state, body).await,
        "resolve_consensus_from_message" => tool_resolve_consensus_from_message(state, body).await,
        "list_consensus_decisions" => tool_list_consensus_decisions(state, body).await,

        // -- Protocol / blobs --
        "pack_protocol_message" => tool_pack_protocol_message(state, body).await,
        "unpack_protocol_message" => tool_unpack_protocol_message(state, body).await,
        "hash_payload" => tool_hash_payload(state, body).await,
        "store_protocol_blob" => tool_store_protocol_blob(state, body).await,
        "get_protocol_blob" => tool_get_protocol_blob(state, body).await,
        "list_protocol_blobs" => tool_list_protocol_blobs(state, body).await,

        // -- Artifacts --
        "create_artifact_upload" => tool_create_artifact_upload(state, body).await,
        "create_artifact_download" => tool_create_artifact_download(state, body).await,
        "create_task_artifact_downloads" => tool_create_task_artifact_downloads(state, body).await,
        "share_artifact" => tool_share_artifact(state, body).await,
        "list_artifacts" => tool_list_artifacts(state, body).await,

        // -- Observability --
        "get_activity_log" => tool_get_activity_log(state, body).await,
        "get_kpi_snapshot" => tool_get_kpi_snapshot(state, body).await,
        "get_transport_snapshot" => tool_get_transport_snapshot(state, body).await,
        "wait_for_updates" => tool_wait_for_updates(state, body).await,
        "read_snapshot" => tool_read_snapshot(state, body).await,
        "evaluate_slo_alerts" => tool_evaluate_slo_alerts(state, body).await,
        "list_slo_alerts" => tool_list_slo_alerts(state, body).await,
        "get_auth_coverage" => tool_get_auth_coverage(state, body).await,
        "run_maintenance" => tool_run_maintenance(state, body).await,

        _ => Err(HubError::new(
            ErrorCode::InvalidPayload,
            format!("unknown tool `{tool}`"),
        )),
    }
}

// ---------------------------------------------------------------------------
// Agents
// ---------------------------------------------------------------------------

async fn tool_register_agent(state: &AppState, body: &Value) -> HubResult<Value> {
    let req = RegisterRequest {
        id: validation::require_str(body, "id")?.to_string(),
        name: validation::require_str(body, "name")?.to_string(),
        type_tag: validation::optional_str(body, "type_tag")?
            .unwrap_or("")
            .to_string(),
        capabilities: validation::optional_str(body, "capabilities")?
            .unwrap_or("")
            .to_string(),
        lifecycle: optional_enum::<AgentLifecycle>(body, "lifecycle")?
            .unwrap_or(AgentLifecycle::Ephemeral),
    };
    let (agent, token) = state.registry.register(req).await?;
    to_json(&json!({ "agent": agent, "token": token }))
}

async fn tool_update_runtime_profile(state: &AppState, body: &Value) -> HubResult<Value> {
    let agent_id = validation::require_str(body, "agent_id")?;
    let profile = RuntimeProfile {
        cwd: validation::optional_str(body, "cwd")?
            .unwrap_or("")
            .to_string(),
        has_git: validation::optional_bool(body, "has_git")?,
        file_count: validation::optional_u64(body, "file_count")?.unwrap_or(0),
        empty_dir: validation::optional_bool(body, "empty_dir")?,
        source: validation::optional_str(body, "source")?
            .unwrap_or("")
            .to_string(),
        detected_at: Utc::now(),
    };
    let agent = state
        .registry
        .update_runtime_profile(agent_id, profile)
        .await?;
    to_json(&agent)
}

async fn tool_list_agents(state: &AppState, body: &Value) -> HubResult<Value> {
    let lifecycle = optional_enum::<AgentLifecycle>(body, "lifecycle")?;
    let status = optional_enum::<AgentStatus>(body, "status")?;
    let (limit, offset) = validation::pagination(body, 100, 1000)?;
    let agents: Vec<Agent> = state.registry.list(lifecycle, status, limit, offset).await?;
    to_json(&agents)
}

// ---------------------------------------------------------------------------
// Messaging
// ---------------------------------------------------------------------------

async fn tool_send_message(state: &AppState, body: &Value) -> HubResult<Value> {
    let from = validation::require_str(body, "from")?;
    let to = validation::optional_str(body, "to")?;
    let content = validation::require_str(body, "content")?;
    let metadata = body.get("metadata").cloned().unwrap_or(json!({}));
    let trace_id = validation::optional_str(body, "trace_id")?;
    let span_id = validation::optional_str(body, "span_id")?;
    let message = state
        .messages
        .send(from, to, content, metadata, trace_id, span_id)
        .await?;
    state.watermarks.invalidate(WatermarkStream::Messages);
    to_json(&message)
}

/// Compresses `content` via [`lossless_auto_encode`], stores it in the blob
/// store keyed by its SHA-256, and sends the [`BlobRef`] literal as the
/// message body in place of the raw text.
async fn tool_send_blob_message(state: &AppState, body: &Value) -> HubResult<Value> {
    let from = validation::require_str(body, "from")?;
    let to = validation::optional_str(body, "to")?;
    let content = validation::require_str(body, "content")?;
    let min_payload_chars =
        validation::optional_u64(body, "min_payload_chars")?.unwrap_or(256) as usize;
    let min_gain_pct = validation::optional_f64(body, "min_gain_pct")?.unwrap_or(10.0);
    let metadata = body.get("metadata").cloned().unwrap_or(json!({}));
    let trace_id = validation::optional_str(body, "trace_id")?;
    let span_id = validation::optional_str(body, "span_id")?;

    let hash = sha256_hex(content);
    let encoded = lossless_auto_encode(content, min_payload_chars, min_gain_pct);
    state.blobs.put(&hash, &encoded.stored_value).await?;
    let blob_ref = BlobRef::new(hash, content.chars().count() as u64);
    let literal = blob_ref.to_literal();

    let message = state
        .messages
        .send(from, to, &literal, metadata, trace_id, span_id)
        .await?;
    state.watermarks.invalidate(WatermarkStream::Messages);
    to_json(&json!({ "message": message, "blob_ref": blob_ref, "compressed": encoded.applied }))
}

async fn tool_read_messages(state: &AppState, body: &Value) -> HubResult<Value> {
    let agent_id = validation::require_str(body, "agent_id")?;
    let (limit, offset) = validation::pagination(body, 100, 1000)?;
    let cursor = match validation::optional_str(body, "cursor")? {
        Some(raw) => Some(MessageCursor::parse(raw)?),
        None => None,
    };
    let query = ReadQuery {
        from: validation::optional_str(body, "from")?.map(str::to_string),
        unread_only: validation::optional_bool(body, "unread_only")?,
        since_ts: None,
        cursor,
        limit,
        offset,
    };
    let messages = state.messages.read(agent_id, query).await?;
    to_json(&messages)
}

// ---------------------------------------------------------------------------
// Tasks
// ---------------------------------------------------------------------------

async fn tool_create_task(state: &AppState, body: &Value) -> HubResult<Value> {
    let req = CreateTaskRequest {
        title: validation::require_str(body, "title")?.to_string(),
        description: validation::optional_str(body, "description")?.map(str::to_string),
        namespace: validation::optional_str(body, "namespace")?.map(str::to_string),
        priority: optional_enum::<TaskPriority>(body, "priority")?,
        execution_mode: optional_enum::<ExecutionMode>(body, "execution_mode")?,
        consistency_mode: optional_enum(body, "consistency_mode")?,
        depends_on: validation::optional_i64_array(body, "depends_on")?,
        creator: validation::require_str(body, "creator")?.to_string(),
        trace_id: validation::optional_str(body, "trace_id")?.map(str::to_string),
        span_id: validation::optional_str(body, "span_id")?.map(str::to_string),
    };
    let task = state.board.create(req).await?;
    state.watermarks.invalidate(WatermarkStream::Tasks);
    to_json(&task)
}

async fn tool_update_task(state: &AppState, body: &Value) -> HubResult<Value> {
    let task_id = validation::require_i64(body, "task_id")?;
    let patch = UpdateTaskPatch {
        title: validation::optional_str(body, "title")?.map(str::to_string),
        description: match body.get("description") {
            None => None,
            Some(Value::Null) => Some(None),
            Some(v) => Some(Some(
                v.as_str()
                    .ok_or_else(|| {
                        HubError::new(
                            ErrorCode::InvalidPayload,
                            "field `description` must be a string",
                        )
                    })?
                    .to_string(),
            )),
        },
        priority: optional_enum::<TaskPriority>(body, "priority")?,
        execution_mode: optional_enum::<ExecutionMode>(body, "execution_mode")?,
        consistency_mode: optional_enum(body, "consistency_mode")?,
        status: optional_enum::<TaskStatus>(body, "status")?,
        depends_on: match body.get("depends_on") {
            None | Some(Value::Null) => None,
            Some(_) => Some(validation::optional_i64_array(body, "depends_on")?),
        },
        changed_by: validation::require_str(body, "changed_by")?.to_string(),
        source: validation::optional_str(body, "source")?
            .unwrap_or("update_task")
            .to_string(),
    };
    let task = state.board.update(task_id, patch).await?;
    state.watermarks.invalidate(WatermarkStream::Tasks);
    to_json(&task)
}

async fn tool_list_tasks(state: &AppState, body: &Value) -> HubResult<Value> {
    let filter = TaskFilter {
        status: optional_enum::<TaskStatus>(body, "status")?,
        assigned_to: validation::optional_str(body, "assigned_to")?.map(str::to_string),
        namespace: validation::optional_str(body, "namespace")?.map(str::to_string),
        execution_mode: optional_enum::<ExecutionMode>(body, "execution_mode")?,
        ready_only: validation::optional_bool(body, "ready_only")?,
    };
    let (limit, offset) = validation::pagination(body, 100, 1000)?;
    let cursor = match validation::optional_str(body, "cursor")? {
        Some(raw) => {
            let parsed = TaskCursor::parse(raw)?;
            Some((parsed.updated_at(), parsed.id))
        }
        None => None,
    };
    let page = ListPage {
        updated_after: None,
        cursor,
        limit,
        offset,
    };
    let tasks = state.board.list(filter, page).await?;
    to_json(&tasks)
}

async fn tool_poll_and_claim(state: &AppState, body: &Value) -> HubResult<Value> {
    let agent_id = validation::require_str(body, "agent_id")?;
    let lease_secs = validation::optional_u64(body, "lease_secs")?;
    let namespace = validation::optional_str(body, "namespace")?;
    let claimed = state
        .claims
        .poll_and_claim(agent_id, lease_secs, namespace)
        .await?;
    match claimed {
        Some(claimed) => {
            state.kpi.record_claim_issued();
            state.watermarks.invalidate(WatermarkStream::Tasks);
            to_json(&json!({ "claimed": true, "task": claimed.task, "claim": claimed.claim }))
        }
        None => {
            let active_agents_5m = count_active_agents(state, 5).await?;
            let other_claims_active = count_active_claims(state).await? > 0;
            let backoff = compute_poll_backoff(active_agents_5m, 1, other_claims_active, rand_f64);
            to_json(&json!({ "claimed": false, "retry_after_ms": backoff.retry_after_ms }))
        }
    }
}

async fn tool_claim_task(state: &AppState, body: &Value) -> HubResult<Value> {
    let task_id = validation::require_i64(body, "task_id")?;
    let agent_id = validation::require_str(body, "agent_id")?;
    let lease_secs = validation::optional_u64(body, "lease_secs")?;
    let namespace = validation::optional_str(body, "namespace")?;
    let claimed = state
        .claims
        .claim_task(task_id, agent_id, lease_secs, namespace)
        .await?;
    state.kpi.record_claim_issued();
    state.watermarks.invalidate(WatermarkStream::Tasks);
    to_json(&json!({ "task": claimed.task, "claim": claimed.claim }))
}

async fn tool_renew_task_claim(state: &AppState, body: &Value) -> HubResult<Value> {
    let task_id = validation::require_i64(body, "task_id")?;
    let agent_id = validation::require_str(body, "agent_id")?;
    let lease_secs = validation::optional_u64(body, "lease_secs")?;
    let expected_claim_id = parse_optional_uuid(body, "expected_claim_id")?;
    let claim = state
        .claims
        .renew_task_claim(task_id, agent_id, lease_secs, expected_claim_id)
        .await?;
    state.kpi.record_claim_renewed();
    to_json(&claim)
}

async fn tool_release_task_claim(state: &AppState, body: &Value) -> HubResult<Value> {
    let task_id = validation::require_i64(body, "task_id")?;
    let agent_id = validation::require_str(body, "agent_id")?;
    let next_status = optional_enum::<TaskStatus>(body, "next_status")?;
    let expected_claim_id = parse_optional_uuid(body, "expected_claim_id")?;
    let done_gate_input = if next_status == Some(TaskStatus::Done) {
        Some(DoneGateInput {
            task_id,
            agent_id: agent_id.to_string(),
            consistency_mode: require_enum(body, "consistency_mode")?,
            confidence: validation::require_f64(body, "confidence")?,
            verification_passed: validation::optional_bool(body, "verification_passed")?,
            verified_by: validation::optional_str(body, "verified_by")?.map(str::to_string),
            evidence_refs: validation::optional_str_array(body, "evidence_refs")?,
        })
    } else {
        None
    };
    let task = state
        .claims
        .release_task_claim(task_id, agent_id, next_status, expected_claim_id, done_gate_input)
        .await?;
    state.kpi.record_done_gate(task.status == TaskStatus::Done);
    if task.status == TaskStatus::Done {
        state.kpi.record_claim_released_done();
    } else {
        state.kpi.record_claim_released_other();
    }
    state.watermarks.invalidate(WatermarkStream::Tasks);
    to_json(&task)
}

async fn tool_list_task_claims(state: &AppState, body: &Value) -> HubResult<Value> {
    let agent_id = validation::optional_str(body, "agent_id")?;
    let (limit, offset) = validation::pagination(body, 100, 1000)?;
    let claims = state.claims.list_claims(agent_id, limit, offset).await?;
    to_json(&claims)
}

async fn tool_delete_task(state: &AppState, body: &Value) -> HubResult<Value> {
    let task_id = validation::require_i64(body, "task_id")?;
    let archive = match body.get("archive") {
        Some(_) => validation::optional_bool(body, "archive")?,
        None => true,
    };
    let reason = validation::optional_str(body, "reason")?.unwrap_or("delete_task");
    state.board.delete(task_id, archive, reason).await?;
    state.watermarks.invalidate(WatermarkStream::Tasks);
    to_json(&json!({ "deleted": true, "task_id": task_id }))
}

async fn tool_attach_task_artifact(state: &AppState, body: &Value) -> HubResult<Value> {
    let task_id = validation::require_i64(body, "task_id")?;
    let artifact_id = parse_uuid(body, "artifact_id")?;
    let link = state.artifacts.attach_to_task(task_id, artifact_id).await?;
    to_json(&link)
}

async fn tool_list_task_artifacts(state: &AppState, body: &Value) -> HubResult<Value> {
    let task_id = validation::require_i64(body, "task_id")?;
    let artifacts = state.artifacts.list_task_artifacts(task_id).await?;
    to_json(&artifacts)
}

/// Bundles a task with its claim (if any) and attached artifacts, for an
/// agent picking up in-flight work from another agent.
async fn tool_get_task_handoff(state: &AppState, body: &Value) -> HubResult<Value> {
    let task_id = validation::require_i64(body, "task_id")?;
    let task = state.board.get(task_id).await?.ok_or_else(|| {
        HubError::new(ErrorCode::TaskNotFound, format!("no task with id {task_id}"))
    })?;
    let claims = state.claims.list_claims(None, 1000, 0).await?;
    let claim = claims.into_iter().find(|c| c.task_id == task_id);
    let artifacts = state.artifacts.list_task_artifacts(task_id).await?;
    let unmet_dependencies = state.board.unmet_dependencies(task_id).await?;
    to_json(&json!({
        "task": task,
        "claim": claim,
        "artifacts": artifacts,
        "unmet_dependencies": unmet_dependencies,
    }))
}

// ---------------------------------------------------------------------------
// Context
// ---------------------------------------------------------------------------

async fn tool_share_context(state: &AppState, body: &Value) -> HubResult<Value> {
    let agent_id = validation::require_str(body, "agent_id")?;
    let key = validation::require_str(body, "key")?;
    let value = validation::require_str(body, "value")?;
    let namespace = validation::optional_str(body, "namespace")?;
    let trace_id = validation::optional_str(body, "trace_id")?;
    let span_id = validation::optional_str(body, "span_id")?;
    let context = state
        .context
        .upsert(agent_id, key, value, namespace, trace_id, span_id)
        .await?;
    state.watermarks.invalidate(WatermarkStream::Context);
    to_json(&context)
}

async fn tool_share_blob_context(state: &AppState, body: &Value) -> HubResult<Value> {
    let agent_id = validation::require_str(body, "agent_id")?;
    let key = validation::require_str(body, "key")?;
    let value = validation::require_str(body, "value")?;
    let namespace = validation::optional_str(body, "namespace")?;
    let trace_id = validation::optional_str(body, "trace_id")?;
    let span_id = validation::optional_str(body, "span_id")?;
    let min_payload_chars =
        validation::optional_u64(body, "min_payload_chars")?.unwrap_or(256) as usize;
    let min_gain_pct = validation::optional_f64(body, "min_gain_pct")?.unwrap_or(10.0);

    let hash = sha256_hex(value);
    let encoded = lossless_auto_encode(value, min_payload_chars, min_gain_pct);
    state.blobs.put(&hash, &encoded.stored_value).await?;
    let blob_ref = BlobRef::new(hash, value.chars().count() as u64);
    let literal = blob_ref.to_literal();

    let context = state
        .context
        .upsert(agent_id, key, &literal, namespace, trace_id, span_id)
        .await?;
    state.watermarks.invalidate(WatermarkStream::Context);
    to_json(&json!({ "context": context, "blob_ref": blob_ref, "compressed": encoded.applied }))
}

async fn tool_get_context(state: &AppState, body: &Value) -> HubResult<Value> {
    if let (Ok(Some(agent_id)), Ok(Some(key))) = (
        validation::optional_str(body, "agent_id"),
        validation::optional_str(body, "key"),
    ) {
        let context = state.context.get(agent_id, key).await?;
        return to_json(&context);
    }
    let (limit, offset) = validation::pagination(body, 100, 1000)?;
    let query = hub_context::ContextQuery {
        agent_id: validation::optional_str(body, "agent_id")?.map(str::to_string),
        key: None,
        namespace: validation::optional_str(body, "namespace")?.map(str::to_string),
        updated_after: None,
        limit,
        offset,
    };
    let contexts = state.context.read(query).await?;
    to_json(&contexts)
}

// ---------------------------------------------------------------------------
// Consensus
// ---------------------------------------------------------------------------

fn parse_knobs(state: &AppState, body: &Value) -> HubResult<ConsensusKnobs> {
    let mut knobs = ConsensusKnobs::from_config(&state.config);
    if let Some(v) = validation::optional_f64(body, "disagreement_threshold")? {
        knobs.disagreement_threshold = v.clamp(0.1, 0.9);
    }
    if let Some(v) = validation::optional_i64(body, "min_non_abstain_votes")? {
        knobs.min_non_abstain_votes = v.max(0) as usize;
    }
    if let Some(v) = validation::optional_u64(body, "token_budget_cap")? {
        knobs.token_budget_cap = Some(v);
    }
    if body.get("dedupe_by_agent").is_some() {
        knobs.dedupe_by_agent = validation::optional_bool(body, "dedupe_by_agent")?;
    }
    if body.get("quality_weighting").is_some() {
        knobs.quality_weighting = validation::optional_bool(body, "quality_weighting")?;
    }
    if let Some(policy) = validation::optional_str(body, "emit_blob_ref_policy")? {
        knobs.emit_blob_ref_policy = match policy {
            "never" => EmitBlobRefPolicy::Never,
            "always" => EmitBlobRefPolicy::Always,
            "on_escalate" => EmitBlobRefPolicy::OnEscalate,
            "on_conflict" => EmitBlobRefPolicy::OnConflict,
            other => {
                return Err(HubError::new(
                    ErrorCode::InvalidPayload,
                    format!("unknown emit_blob_ref_policy `{other}`"),
                ))
            }
        };
    }
    Ok(knobs)
}

async fn run_resolve(
    state: &AppState,
    proposal_id: String,
    requesting_agent: String,
    votes: VoteSource,
    knobs: ConsensusKnobs,
) -> HubResult<Value> {
    let decision = state
        .consensus
        .resolve(ResolveRequest {
            proposal_id,
            requesting_agent,
            votes,
            knobs,
        })
        .await?;
    state.kpi.record_consensus_outcome(&decision.outcome);
    to_json(&decision)
}

async fn tool_resolve_consensus(state: &AppState, body: &Value) -> HubResult<Value> {
    let proposal_id = validation::require_str(body, "proposal_id")?.to_string();
    let requesting_agent = validation::require_str(body, "requesting_agent")?.to_string();
    let knobs = parse_knobs(state, body)?;
    let votes = if let Some(hash) = validation::optional_str(body, "votes_blob_hash")? {
        VoteSource::BlobHash(hash.to_string())
    } else if let Some(blob_ref) = validation::optional_str(body, "votes_blob_ref")? {
        VoteSource::BlobRef(blob_ref.to_string())
    } else {
        let raw = body.get("votes").cloned().unwrap_or(Value::Array(Vec::new()));
        let votes: Vec<Vote> = serde_json::from_value(raw).map_err(|_| {
            HubError::new(
                ErrorCode::InvalidPayload,
                "field `votes` must be an array of votes",
            )
        })?;
        VoteSource::Inline(votes)
    };
    run_resolve(state, proposal_id, requesting_agent, votes, knobs).await
}

/// Resolves votes sourced from a context entry's stored value. The value
/// must itself be either a 64-hex blob hash or a [`BlobRef`] literal
/// pointing at the votes blob (the same shape [`tool_share_blob_context`]
/// produces).
async fn tool_resolve_consensus_from_context(state: &AppState, body: &Value) -> HubResult<Value> {
    let proposal_id = validation::require_str(body, "proposal_id")?.to_string();
    let requesting_agent = validation::require_str(body, "requesting_agent")?.to_string();
    let agent_id = validation::require_str(body, "agent_id")?;
    let key = validation::require_str(body, "key")?;
    let knobs = parse_knobs(state, body)?;

    let context = state.context.get(agent_id, key).await?.ok_or_else(|| {
        HubError::new(
            ErrorCode::ContextNotFound,
            format!("no context at ({agent_id}, {key})"),
        )
    })?;
    let votes = votes_source_from_text(&context.value, ErrorCode::UnsupportedContextVotesSource)?;
    run_resolve(state, proposal_id, requesting_agent, votes, knobs).await
}

/// Resolves votes sourced from a message's content, which must be a 64-hex
/// blob hash or [`BlobRef`] literal as produced by
/// [`tool_send_blob_message`].
async fn tool_resolve_consensus_from_message(state: &AppState, body: &Value) -> HubResult<Value> {
    let proposal_id = validation::require_str(body, "proposal_id")?.to_string();
    let requesting_agent = validation::require_str(body, "requesting_agent")?.to_string();
    let message_id = validation::require_i64(body, "message_id")?;
    let knobs = parse_knobs(state, body)?;

    let view = state
        .messages
        .get_for_agent(&requesting_agent, message_id)
        .await?
        .ok_or_else(|| {
            HubError::new(
                ErrorCode::MessageNotFoundOrForbidden,
                format!("message {message_id} not visible to {requesting_agent}"),
            )
        })?;
    let votes =
        votes_source_from_text(&view.message.content, ErrorCode::UnsupportedMessageVotesSource)?;
    run_resolve(state, proposal_id, requesting_agent, votes, knobs).await
}

fn votes_source_from_text(text: &str, unsupported: ErrorCode) -> HubResult<VoteSource> {
    if BlobRef::parse(text).is_some() {
        return Ok(VoteSource::BlobRef(text.to_string()));
    }
    if text.len() == 64 && text.bytes().all(|b| b.is_ascii_hexdigit()) {
        return Ok(VoteSource::BlobHash(text.to_string()));
    }
    Err(HubError::new(
        unsupported,
        "value is neither a blob hash nor a blob reference",
    ))
}

async fn tool_list_consensus_decisions(state: &AppState, body: &Value) -> HubResult<Value> {
    let (limit, offset) = validation::pagination(body, 100, 1000)?;
    let decisions = state.consensus.list_decisions(limit, offset).await?;
    to_json(&decisions)
}

// ---------------------------------------------------------------------------
// Protocol / blobs
// ---------------------------------------------------------------------------

/// Packs `payload` into a [`BlobRef`]-addressed envelope without persisting
/// it: purely a hash/compress preview, mirroring `hash_payload` plus the
/// compression decision [`tool_store_protocol_blob`] would make.
async fn tool_pack_protocol_message(_state: &AppState, body: &Value) -> HubResult<Value> {
    let payload = validation::require_str(body, "payload")?;
    let min_payload_chars =
        validation::optional_u64(body, "min_payload_chars")?.unwrap_or(256) as usize;
    let min_gain_pct = validation::optional_f64(body, "min_gain_pct")?.unwrap_or(10.0);
    let hash = sha256_hex(payload);
    let encoded = lossless_auto_encode(payload, min_payload_chars, min_gain_pct);
    let blob_ref = BlobRef::new(hash, payload.chars().count() as u64);
    to_json(
        &json!({ "blob_ref": blob_ref, "stored_value": encoded.stored_value, "compressed": encoded.applied }),
    )
}

/// Decodes a `stored_value` previously produced by [`lossless_auto_encode`],
/// surfacing the integrity failure reason rather than the decoded text when
/// the check fails.
async fn tool_unpack_protocol_message(_state: &AppState, body: &Value) -> HubResult<Value> {
    let stored_value = validation::require_str(body, "stored_value")?;
    match lossless_decode(stored_value) {
        Ok(raw) => to_json(&json!({ "payload": raw })),
        Err((_, failure)) => Err(HubError::from(failure)),
    }
}

async fn tool_hash_payload(_state: &AppState, body: &Value) -> HubResult<Value> {
    let payload = validation::require_str(body, "payload")?;
    to_json(&json!({ "sha256": sha256_hex(payload), "chars": payload.chars().count() }))
}

async fn tool_store_protocol_blob(state: &AppState, body: &Value) -> HubResult<Value> {
    let value = validation::require_str(body, "value")?;
    let hash = match validation::optional_str(body, "hash")? {
        Some(h) => h.to_string(),
        None => sha256_hex(value),
    };
    let outcome = state.blobs.put(&hash, value).await?;
    to_json(&json!({ "hash": hash, "created": outcome.created }))
}

async fn tool_get_protocol_blob(state: &AppState, body: &Value) -> HubResult<Value> {
    let hash = validation::require_str(body, "hash")?;
    let blob = state.blobs.get(hash).await?;
    to_json(&blob)
}

async fn tool_list_protocol_blobs(state: &AppState, body: &Value) -> HubResult<Value> {
    let (limit, offset) = validation::pagination(body, 100, 1000)?;
    let blobs = state.blobs.list(limit, offset).await?;
    to_json(&blobs)
}

// ---------------------------------------------------------------------------
// Artifacts
// ---------------------------------------------------------------------------

async fn tool_create_artifact_upload(state: &AppState, body: &Value) -> HubResult<Value> {
    let req = CreateArtifactRequest {
        created_by: validation::require_str(body, "created_by")?.to_string(),
        name: validation::require_str(body, "name")?.to_string(),
        namespace: validation::optional_str(body, "namespace")?.map(str::to_string),
        summary: validation::optional_str(body, "summary")?.map(str::to_string),
        ttl_expires_at: None,
    };
    let artifact = state.artifacts.create(req).await?;
    let ttl_secs = validation::optional_u64(body, "ttl_secs")?.unwrap_or(3600);
    let max_bytes = validation::optional_u64(body, "max_bytes")?;
    let ticket = state.tickets.issue(
        TicketKind::Upload,
        artifact.id,
        &artifact.created_by,
        ttl_secs,
        max_bytes,
    );
    to_json(&json!({ "artifact": artifact, "ticket": ticket }))
}

async fn tool_create_artifact_download(state: &AppState, body: &Value) -> HubResult<Value> {
    let artifact_id = parse_uuid(body, "artifact_id")?;
    let agent_id = validation::require_str(body, "agent_id")?;
    let artifact = state.artifacts.get(artifact_id).await?.ok_or_else(|| {
        HubError::new(
            ErrorCode::ArtifactNotFound,
            format!("no artifact {artifact_id}"),
        )
    })?;
    if !state.artifacts.has_access(agent_id, &artifact).await? {
        return Err(HubError::new(
            ErrorCode::ArtifactAccessDenied,
            format!("{agent_id} has no access to artifact {artifact_id}"),
        ));
    }
    let ttl_secs = validation::optional_u64(body, "ttl_secs")?.unwrap_or(3600);
    let ticket = state
        .tickets
        .issue(TicketKind::Download, artifact_id, agent_id, ttl_secs, None);
    to_json(&json!({ "artifact": artifact, "ticket": ticket }))
}

/// Issues one download ticket per artifact attached to `task_id`, skipping
/// (rather than failing) artifacts `agent_id` cannot access.
async fn tool_create_task_artifact_downloads(state: &AppState, body: &Value) -> HubResult<Value> {
    let task_id = validation::require_i64(body, "task_id")?;
    let agent_id = validation::require_str(body, "agent_id")?;
    let ttl_secs = validation::optional_u64(body, "ttl_secs")?.unwrap_or(3600);
    let artifacts = state.artifacts.list_task_artifacts(task_id).await?;
    let mut tickets = Vec::with_capacity(artifacts.len());
    for artifact in artifacts {
        if state.artifacts.has_access(agent_id, &artifact).await? {
            let ticket = state
                .tickets
                .issue(TicketKind::Download, artifact.id, agent_id, ttl_secs, None);
            tickets.push(json!({ "artifact": artifact, "ticket": ticket }));
        }
    }
    to_json(&tickets)
}

async fn tool_share_artifact(state: &AppState, body: &Value) -> HubResult<Value> {
    let artifact_id = parse_uuid(body, "artifact_id")?;
    let agent_id = validation::require_str(body, "agent_id")?;
    let share = state.artifacts.share(artifact_id, agent_id).await?;
    to_json(&share)
}

async fn tool_list_artifacts(state: &AppState, body: &Value) -> HubResult<Value> {
    let namespace = validation::optional_str(body, "namespace")?;
    let (limit, offset) = validation::pagination(body, 100, 1000)?;
    let artifacts = state.artifacts.list(namespace, limit, offset).await?;
    to_json(&artifacts)
}

// ---------------------------------------------------------------------------
// Observability
// ---------------------------------------------------------------------------

async fn tool_get_activity_log(state: &AppState, body: &Value) -> HubResult<Value> {
    let kind = validation::optional_str(body, "kind")?;
    let agent_id = validation::optional_str(body, "agent_id")?;
    let (limit, offset) = validation::pagination(body, 100, 1000)?;

    let mut sql =
        String::from("SELECT id, kind, agent_id, detail, created_at FROM activity_log WHERE 1=1");
    if kind.is_some() {
        sql.push_str(" AND kind = ?");
    }
    if agent_id.is_some() {
        sql.push_str(" AND agent_id = ?");
    }
    sql.push_str(" ORDER BY id DESC LIMIT ? OFFSET ?");

    let mut query = sqlx::query(&sql);
    if let Some(k) = kind {
        query = query.bind(k);
    }
    if let Some(a) = agent_id {
        query = query.bind(a);
    }
    query = query.bind(limit).bind(offset);

    use sqlx::Row;
    let rows = query.fetch_all(state.store.pool()).await?;
    let entries: Vec<Value> = rows
        .into_iter()
        .map(|row| {
            let detail: String = row.get("detail");
            json!({
                "id": row.get::<i64, _>("id"),
                "kind": row.get::<String, _>("kind"),
                "agent_id": row.get::<Option<String>, _>("agent_id"),
                "detail": serde_json::from_str::<Value>(&detail).unwrap_or(Value::Null),
                "created_at": row.get::<String, _>("created_at"),
            })
        })
        .collect();
    to_json(&entries)
}

async fn tool_get_kpi_snapshot(state: &AppState, _body: &Value) -> HubResult<Value> {
    to_json(&state.kpi.snapshot())
}

async fn tool_get_transport_snapshot(state: &AppState, _body: &Value) -> HubResult<Value> {
    to_json(&state.transport.snapshot())
}

async fn tool_wait_for_updates(state: &AppState, body: &Value) -> HubResult<Value> {
    let agent_id = validation::require_str(body, "agent_id")?;
    let streams = validation::parse_streams(body)?;
    let cursor = match validation::optional_str(body, "cursor")? {
        Some(raw) => Cursor::parse(raw)?,
        None => Cursor::ZERO,
    };
    let wait_ms = normalize_wait_ms(
        validation::optional_u64(body, "wait_ms")?,
        state.config.max_wait.as_millis() as u64,
    );
    let poll_interval_ms = normalize_poll_interval_ms(validation::optional_u64(body, "poll_interval_ms")?);
    let miss_streak = validation::optional_u64(body, "miss_streak")?.unwrap_or(0) as u32;
    let backoff = BackoffConfig::new(
        state.config.wait_backoff_factor,
        state.config.wait_backoff_cap.as_millis() as u64,
        state.config.wait_backoff_jitter,
    );
    let shape =
        ResponseShape::parse(validation::optional_str(body, "response_mode")?.unwrap_or("compact"));

    for stream in &streams {
        state.transport.waiter_started(to_wait_stream(*stream));
    }
    let started = std::time::Instant::now();
    let outcome = poll_until_change(
        &state.watermarks,
        agent_id,
        &streams,
        cursor,
        wait_ms,
        poll_interval_ms,
        backoff,
        miss_streak,
        rand_f64,
    )
    .await;
    for stream in &streams {
        state.transport.waiter_finished(to_wait_stream(*stream));
    }
    let outcome = outcome?;
    let elapsed_ms = started.elapsed().as_millis() as u64;
    Ok(render(shape, &outcome, &streams, elapsed_ms))
}

/// A cursor-only read of the current watermarks, for callers that want a
/// baseline without blocking (`wait_for_updates` with `wait_ms: 0` would
/// otherwise still evaluate the poll loop once).
async fn tool_read_snapshot(state: &AppState, body: &Value) -> HubResult<Value> {
    let agent_id = validation::require_str(body, "agent_id")?;
    let fallback = WatermarkFallback {
        tasks: validation::optional_i64(body, "tasks_since")?,
        context: validation::optional_i64(body, "context_since")?,
        activity: validation::optional_i64(body, "activity_since")?,
    };
    let cursor = state.watermarks.cursor_for(agent_id, fallback).await?;
    to_json(&json!({ "cursor": cursor.encode() }))
}

/// Thin wrapper around [`hub_maintenance::MaintenanceRunner::run_once`] that
/// surfaces only the SLO-relevant fields, for callers that want the
/// evaluator without the full sweep report.
async fn tool_evaluate_slo_alerts(state: &AppState, _body: &Value) -> HubResult<Value> {
    let report = state.maintenance.run_once(Utc::now()).await?;
    to_json(&json!({
        "slo_alerts_raised": report.slo_alerts_raised,
        "slo_alerts_resolved": report.slo_alerts_resolved,
    }))
}

async fn tool_list_slo_alerts(state: &AppState, body: &Value) -> HubResult<Value> {
    let include_resolved = validation::optional_bool(body, "include_resolved")?;
    let limit = validation::optional_i64(body, "limit")?.unwrap_or(100).clamp(1, 1000);
    let alerts = state.maintenance.list_alerts(include_resolved, limit).await?;
    to_json(&alerts)
}

async fn tool_get_auth_coverage(state: &AppState, body: &Value) -> HubResult<Value> {
    let (limit, offset) = validation::pagination(body, 100, 1000)?;
    use sqlx::Row;
    let rows = sqlx::query(
        "SELECT agent_id, kind, COUNT(*) as n, MAX(created_at) as last_seen FROM auth_events GROUP BY agent_id, kind ORDER BY last_seen DESC LIMIT ? OFFSET ?",
    )
    .bind(limit)
    .bind(offset)
    .fetch_all(state.store.pool())
    .await?;
    let coverage: Vec<Value> = rows
        .into_iter()
        .map(|row| {
            json!({
                "agent_id": row.get::<Option<String>, _>("agent_id"),
                "kind": row.get::<String, _>("kind"),
                "count": row.get::<i64, _>("n"),
                "last_seen": row.get::<String, _>("last_seen"),
            })
        })
        .collect();
    to_json(&coverage)
}

async fn tool_run_maintenance(state: &AppState, _body: &Value) -> HubResult<Value> {
    let report = state.maintenance.run_once(Utc::now()).await?;
    to_json(&report)
}

// ---------------------------------------------------------------------------
// Shared helpers
// ---------------------------------------------------------------------------

fn parse_uuid(body: &Value, field: &str) -> HubResult<Uuid> {
    let raw = validation::require_str(body, field)?;
    Uuid::parse_str(raw)
        .map_err(|_| HubError::new(ErrorCode::InvalidPayload, format!("field `{field}` is not a valid uuid")))
}

fn parse_optional_uuid(body: &Value, field: &str) -> HubResult<Option<Uuid>> {
    match validation::optional_str(body, field)? {
        Some(raw) => Uuid::parse_str(raw).map(Some).map_err(|_| {
            HubError::new(ErrorCode::InvalidPayload, format!("field `{field}` is not a valid uuid"))
        }),
        None => Ok(None),
    }
}

fn to_wait_stream(stream: WatermarkStream) -> WaitStream {
    match stream {
        WatermarkStream::Messages => WaitStream::Messages,
        WatermarkStream::Tasks => WaitStream::Tasks,
        WatermarkStream::Context => WaitStream::Context,
        WatermarkStream::Activity => WaitStream::Activity,
    }
}

fn rand_f64() -> f64 {
    rand::thread_rng().gen_range(-1.0..1.0)
}

async fn count_active_agents(state: &AppState, minutes: i64) -> HubResult<i64> {
    let cutoff = (Utc::now() - chrono::Duration::minutes(minutes)).to_rfc3339();
    let row: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM agents WHERE last_seen >= ?")
        .bind(cutoff)
        .fetch_one(state.store.pool())
        .await?;
    Ok(row.0)
}

async fn count_active_claims(state: &AppState) -> HubResult<i64> {
    let row: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM task_claims")
        .fetch_one(state.store.pool())
        .await?;
    Ok(row.0)
}

// ---------------------------------------------------------------------------
// Artifact HTTP side channel
// ---------------------------------------------------------------------------

#[derive(serde::Deserialize)]
pub struct TokenQuery {
    token: Option<String>,
}

/// `POST /artifacts/upload/{id}?token=<tok>`. Body is the raw artifact
/// bytes, capped by the ticket's `max_bytes` (enforced here, not by axum's
/// default body limit, since the cap is per-ticket rather than global).
pub async fn upload_artifact(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Query(query): Query<TokenQuery>,
    body: Bytes,
) -> Result<Json<Value>, ApiError> {
    upload_artifact_inner(&state, id, query.token, body)
        .await
        .map(Json)
        .map_err(ApiError::from)
}

async fn upload_artifact_inner(
    state: &AppState,
    artifact_id: Uuid,
    token: Option<String>,
    body: Bytes,
) -> HubResult<Value> {
    let token = token.ok_or_else(|| HubError::new(ErrorCode::ArtifactAccessDenied, "missing upload token"))?;
    let ticket = state.tickets.consume(&token, TicketKind::Upload, artifact_id)?;
    if let Some(max_bytes) = ticket.max_bytes {
        if body.len() as u64 > max_bytes {
            return Err(HubError::new(
                ErrorCode::ArtifactAccessDenied,
                format!("upload exceeds ticket cap of {max_bytes} bytes"),
            ));
        }
    }

    let sha256 = {
        use sha2::{Digest, Sha256};
        let mut hasher = Sha256::new();
        hasher.update(&body);
        format!("{:x}", hasher.finalize())
    };
    tokio::fs::create_dir_all(&state.artifact_root)
        .await
        .map_err(|e| HubError::new(ErrorCode::IoError, "failed to create artifact storage directory").with_source(e))?;
    let storage_path = state.artifact_root.join(artifact_id.to_string());
    tokio::fs::write(&storage_path, &body)
        .await
        .map_err(|e| HubError::new(ErrorCode::IoError, "failed to write artifact bytes").with_source(e))?;

    let req = FinalizeUploadRequest {
        artifact_id,
        size_bytes: body.len() as u64,
        sha256: sha256.clone(),
        storage_path: storage_path.to_string_lossy().to_string(),
        mime_type: None,
    };
    let artifact = state.artifacts.finalize_upload(req).await?;
    state.kpi.record_artifact_uploaded();
    to_json(&json!({
        "artifact_id": artifact.id,
        "size_bytes": artifact.size_bytes,
        "sha256": artifact.sha256,
        "name": artifact.name,
    }))
}

/// `GET /artifacts/download/{id}?token=<tok>`.
pub async fn download_artifact(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Query(query): Query<TokenQuery>,
) -> Result<Response, ApiError> {
    download_artifact_inner(&state, id, query.token)
        .await
        .map_err(ApiError::from)
}

async fn download_artifact_inner(
    state: &AppState,
    artifact_id: Uuid,
    token: Option<String>,
) -> HubResult<Response> {
    let token = token.ok_or_else(|| HubError::new(ErrorCode::ArtifactAccessDenied, "missing download token"))?;
    state.tickets.consume(&token, TicketKind::Download, artifact_id)?;

    let artifact = state.artifacts.get(artifact_id).await?.ok_or_else(|| {
        HubError::new(ErrorCode::ArtifactNotFound, format!("no artifact {artifact_id}"))
    })?;
    let storage_path = artifact.storage_path.ok_or_else(|| {
        HubError::new(
            ErrorCode::ArtifactNotUploaded,
            format!("artifact {artifact_id} has no uploaded bytes"),
        )
    })?;
    let bytes = tokio::fs::read(&storage_path)
        .await
        .map_err(|e| HubError::new(ErrorCode::IoError, "failed to read artifact bytes").with_source(e))?;

    state.artifacts.bump_access_count(artifact_id).await?;
    state.kpi.record_artifact_downloaded();

    let mut headers = HeaderMap::new();
    headers.insert(
        header::CONTENT_TYPE,
        artifact
            .mime_type
            .as_deref()
            .unwrap_or("application/octet-stream")
            .parse()
            .unwrap_or_else(|_| "application/octet-stream".parse().unwrap()),
    );
    headers.insert(header::CONTENT_LENGTH, bytes.len().into());
    headers.insert(
        header::CONTENT_DISPOSITION,
        format!("attachment; filename=\"{}\"", artifact.name)
            .parse()
            .unwrap_or_else(|_| "attachment".parse().unwrap()),
    );
    Ok((StatusCode::OK, headers, bytes).into_response())
}

// ---------------------------------------------------------------------------
// SSE push
// ---------------------------------------------------------------------------

#[derive(serde::Deserialize)]
pub struct EventsQuery {
    agent_id: String,
    #[serde(default)]
    streams: Option<String>,
    #[serde(default)]
    poll_ms: Option<u64>,
    #[serde(default)]
    cursor: Option<String>,
}

/// `GET /events?agent_id=&streams=&poll_ms=&cursor=`. Emits `hello` with the
/// baseline cursor, `update` on any watermark advance, and a `heartbeat`
/// every 15 seconds of otherwise idle polling.
pub async fn stream_events(
    State(state): State<Arc<AppState>>,
    Query(query): Query<EventsQuery>,
) -> Result<Sse<ReceiverStream<Result<Event, Infallible>>>, ApiError> {
    stream_events_inner(state, query).await.map_err(ApiError::from)
}

async fn stream_events_inner(
    state: Arc<AppState>,
    query: EventsQuery,
) -> HubResult<Sse<ReceiverStream<Result<Event, Infallible>>>> {
    let streams = match &query.streams {
        Some(raw) => {
            let names: Vec<Value> = raw
                .split(',')
                .map(|s| Value::String(s.trim().to_string()))
                .collect();
            validation::parse_streams(&json!({ "streams": names }))?
        }
        None => WatermarkStream::ALL.to_vec(),
    };
    let cursor = match &query.cursor {
        Some(raw) => Cursor::parse(raw)?,
        None => Cursor::ZERO,
    };
    let poll_interval_ms = normalize_poll_interval_ms(query.poll_ms);

    let (tx, rx) = tokio::sync::mpsc::channel(16);
    let agent_id = query.agent_id;

    state.transport.sse_connected();
    for stream in &streams {
        state.transport.waiter_started(to_wait_stream(*stream));
    }

    tokio::spawn(run_sse_loop(state, agent_id, streams, cursor, poll_interval_ms, tx));

    Ok(Sse::new(ReceiverStream::new(rx)).keep_alive(KeepAlive::default()))
}

async fn run_sse_loop(
    state: Arc<AppState>,
    agent_id: String,
    streams: Vec<WatermarkStream>,
    mut cursor: Cursor,
    poll_interval_ms: u64,
    tx: tokio::sync::mpsc::Sender<Result<Event, Infallible>>,
) {
    let hello = SseFrame::Hello { cursor };
    if tx.send(Ok(sse_event(&hello))).await.is_err() {
        finish_sse(&state, &streams);
        return;
    }

    let mut miss_streak: u32 = 0;
    let backoff = BackoffConfig::new(
        state.config.wait_backoff_factor,
        state.config.wait_backoff_cap.as_millis() as u64,
        state.config.wait_backoff_jitter,
    );
    let mut idle_for = Duration::ZERO;
    let heartbeat_interval = Duration::from_secs(15);
    let tick = Duration::from_millis(poll_interval_ms);

    loop {
        let outcome = poll_until_change(
            &state.watermarks,
            &agent_id,
            &streams,
            cursor,
            poll_interval_ms,
            poll_interval_ms,
            backoff,
            miss_streak,
            rand_f64,
        )
        .await;
        match outcome {
            Ok(WaitOutcome::Changed {
                cursor: new_cursor,
                changed_streams,
            }) => {
                cursor = new_cursor;
                miss_streak = 0;
                idle_for = Duration::ZERO;
                let frame = SseFrame::Update {
                    cursor,
                    changed_streams: changed_streams.iter().map(|s| s.as_str().to_string()).collect(),
                };
                if tx.send(Ok(sse_event(&frame))).await.is_err() {
                    break;
                }
            }
            Ok(WaitOutcome::TimedOut { .. }) => {
                miss_streak = miss_streak.saturating_add(1);
                idle_for += tick;
                if idle_for >= heartbeat_interval {
                    idle_for = Duration::ZERO;
                    let frame = SseFrame::Heartbeat { cursor };
                    if tx.send(Ok(sse_event(&frame))).await.is_err() {
                        break;
                    }
                }
            }
            Err(err) => {
                warn!(error = %err, agent_id = %agent_id, "sse poll failed");
                break;
            }
        }
    }
    finish_sse(&state, &streams);
}

fn finish_sse(state: &Arc<AppState>, streams: &[WatermarkStream]) {
    state.transport.sse_disconnected();
    for stream in streams {
        state.transport.waiter_finished(to_wait_stream(*stream));
    }
}

fn sse_event(frame: &SseFrame) -> Event {
    match serde_json::to_value(frame) {
        Ok(Value::Object(mut map)) => {
            let event_name = map
                .remove("event")
                .and_then(|v| v.as_str().map(str::to_string))
                .unwrap_or_else(|| "message".to_string());
            Event::default()
                .event(event_name)
                .json_data(Value::Object(map))
                .unwrap_or_else(|_| Event::default().event("error"))
        }
        _ => Event::default().event("error"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn idempotency_actor_prefers_agent_id() {
        let body = json!({"agent_id": "w1", "from": "w2"});
        assert_eq!(idempotency_actor(&body), "w1");
    }

    #[test]
    fn idempotency_actor_falls_back_to_anonymous() {
        let body = json!({});
        assert_eq!(idempotency_actor(&body), "anonymous");
    }

    #[test]
    fn votes_source_from_text_accepts_hash_and_blob_ref() {
        let hash = "a".repeat(64);
        assert!(matches!(
            votes_source_from_text(&hash, ErrorCode::UnsupportedContextVotesSource).unwrap(),
            VoteSource::BlobHash(_)
        ));

        let blob_ref = BlobRef::new(hash, 10).to_literal();
        assert!(matches!(
            votes_source_from_text(&blob_ref, ErrorCode::UnsupportedContextVotesSource).unwrap(),
            VoteSource::BlobRef(_)
        ));

        assert!(votes_source_from_text("not a ref", ErrorCode::UnsupportedContextVotesSource).is_err());
    }

    #[test]
    fn status_for_category_maps_auth_to_unauthorized() {
        assert_eq!(status_for_category(ErrorCategory::Auth), StatusCode::UNAUTHORIZED);
        assert_eq!(status_for_category(ErrorCategory::Input), StatusCode::BAD_REQUEST);
        assert_eq!(status_for_category(ErrorCategory::System), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
