//! Route handlers. Each one parses ids and bodies, calls one arena service
//! and serialises its outcome.

use std::sync::Arc;
use std::time::Duration;

use arena_core::{
    AbortOutcome, Actor, ContinueOutcome, Evaluation, EvaluationRequested, EvaluationResult,
    NewTestRun, Persona, ProgressUpdate, ReconcileOutcome, RunCreated, SweepReport, TestRun,
    TestRunStatus, ValidationDecision,
};
use axum::body::Bytes;
use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::error::{parse_id, ApiError};
use crate::AppState;

type ApiResult<T> = Result<Json<T>, ApiError>;

/// Decode an optional JSON body; an empty body means `T::default()`.
fn optional_body<T: DeserializeOwned + Default>(body: &Bytes) -> Result<T, ApiError> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(T::default());
    }
    serde_json::from_slice(body).map_err(|e| ApiError::validation(format!("invalid body: {e}")))
}

pub async fn health() -> Json<Value> {
    Json(json!({
        "status": "healthy",
        "service": "arenad",
        "version": arena_core::VERSION,
    }))
}

// ---------------------------------------------------------------------------
// Test runs
// ---------------------------------------------------------------------------

pub async fn create_run(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<NewTestRun>, JsonRejection>,
) -> Result<(StatusCode, Json<RunCreated>), ApiError> {
    let Json(request) = payload?;
    let created = state.arena.trigger.create(request).await?;
    Ok((StatusCode::CREATED, Json(created)))
}

pub async fn get_run(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<TestRun> {
    let id = parse_id(&id)?;
    Ok(Json(state.arena.state_machine.get(id).await?))
}

pub async fn abort_run(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<AbortOutcome> {
    let id = parse_id(&id)?;
    Ok(Json(state.arena.aborts.abort(id).await?))
}

pub async fn continue_run(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<ContinueOutcome> {
    let id = parse_id(&id)?;
    let outcome = state
        .arena
        .review
        .continue_after_review(id)
        .await
        .map_err(ApiError::from_continue)?;
    Ok(Json(outcome))
}

pub async fn reconcile_run(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<ReconcileOutcome> {
    let id = parse_id(&id)?;
    Ok(Json(state.arena.reconciler.reconcile(id).await?))
}

#[derive(Debug, Default, Deserialize)]
pub struct SweepRequest {
    pub stale_after_secs: Option<u64>,
}

pub async fn reconcile_stale(
    State(state): State<Arc<AppState>>,
    body: Bytes,
) -> ApiResult<SweepReport> {
    let request: SweepRequest = optional_body(&body)?;
    let stale_after = request
        .stale_after_secs
        .map(Duration::from_secs)
        .unwrap_or(state.stale_after);
    Ok(Json(state.arena.reconciler.sweep(stale_after).await?))
}

/// Executor or evaluator status callback.
#[derive(Debug, Deserialize)]
pub struct StatusReport {
    pub status: TestRunStatus,
    #[serde(default = "default_reporter")]
    pub actor: Actor,
    #[serde(flatten)]
    pub progress: ProgressUpdate,
}

fn default_reporter() -> Actor {
    Actor::Executor
}

pub async fn report_status(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    payload: Result<Json<StatusReport>, JsonRejection>,
) -> ApiResult<TestRun> {
    let id = parse_id(&id)?;
    let Json(report) = payload?;
    if !matches!(report.actor, Actor::Executor | Actor::Evaluator) {
        return Err(ApiError::validation(format!(
            "callbacks may only report as executor or evaluator, not {}",
            report.actor
        )));
    }

    let run = state
        .arena
        .state_machine
        .report(id, report.status, report.actor, report.progress)
        .await?;
    Ok(Json(run))
}

pub async fn heartbeat(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<TestRun> {
    let id = parse_id(&id)?;
    Ok(Json(state.arena.state_machine.heartbeat(id).await?))
}

// ---------------------------------------------------------------------------
// Evaluations
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Deserialize)]
pub struct EvaluationRequest {
    pub evaluator_config_id: Option<String>,
}

pub async fn request_evaluation(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    body: Bytes,
) -> Result<(StatusCode, Json<EvaluationRequested>), ApiError> {
    let id = parse_id(&id)?;
    let request: EvaluationRequest = optional_body(&body)?;
    let requested = state
        .arena
        .evaluations
        .request(id, request.evaluator_config_id)
        .await?;
    Ok((StatusCode::CREATED, Json(requested)))
}

pub async fn list_evaluations(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<Vec<Evaluation>> {
    let id = parse_id(&id)?;
    Ok(Json(state.arena.evaluations.list_for_run(id).await?))
}

pub async fn record_evaluation_result(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    payload: Result<Json<EvaluationResult>, JsonRejection>,
) -> ApiResult<Evaluation> {
    let id = parse_id(&id)?;
    let Json(result) = payload?;
    Ok(Json(state.arena.evaluations.record_result(id, result).await?))
}

pub async fn promote_evaluation(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<Evaluation> {
    let id = parse_id(&id)?;
    Ok(Json(state.arena.promotion.promote(id).await?))
}

// ---------------------------------------------------------------------------
// Personas
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct NewPersona {
    pub name: String,
    #[serde(default)]
    pub profile: Value,
}

pub async fn register_persona(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<NewPersona>, JsonRejection>,
) -> Result<(StatusCode, Json<Persona>), ApiError> {
    let Json(request) = payload?;
    let persona = state
        .arena
        .personas
        .register(&request.name, request.profile)
        .await?;
    Ok((StatusCode::CREATED, Json(persona)))
}

pub async fn get_persona(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<Persona> {
    let id = parse_id(&id)?;
    Ok(Json(state.arena.personas.get(id).await?))
}

#[derive(Debug, Deserialize)]
pub struct ValidationRequest {
    pub decision: ValidationDecision,
    #[serde(default)]
    pub note: Option<String>,
}

pub async fn validate_persona(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    payload: Result<Json<ValidationRequest>, JsonRejection>,
) -> ApiResult<Persona> {
    let id = parse_id(&id)?;
    let Json(request) = payload?;
    let persona = state
        .arena
        .personas
        .validate(id, request.decision, request.note)
        .await?;
    Ok(Json(persona))
}
