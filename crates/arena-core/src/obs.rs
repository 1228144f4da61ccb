//! Structured lifecycle events for test runs, evaluations and personas.
//!
//! Every event is an `info!` (or `warn!` for degraded outcomes) carrying an
//! `event = "..."` field so log pipelines can filter on it. Use
//! `RUST_LOG=arena_core=info` and `--json` on the binaries for aggregation.

use tracing::{info, warn};

/// Span tagging everything inside it with the run code.
///
/// Attach with `tracing::Instrument` so it survives across awaits:
///
/// ```ignore
/// reconcile(id).instrument(obs::run_span("TR-1A2B3C4D")).await
/// ```
pub fn run_span(run_code: &str) -> tracing::Span {
    tracing::info_span!("arena.run", run = %run_code)
}

/// A run was created by the trigger.
pub fn emit_run_created(run_code: &str, prompt_version_id: &str, mode: &str, max_iterations: u32) {
    info!(
        event = "test_run.created",
        run = %run_code,
        prompt_version_id = %prompt_version_id,
        mode = %mode,
        max_iterations = max_iterations,
    );
}

/// A status transition was committed.
pub fn emit_transition(run_code: &str, from: &str, to: &str, actor: &str) {
    info!(
        event = "test_run.transition",
        run = %run_code,
        from = %from,
        to = %to,
        actor = %actor,
    );
}

/// Progress counters were updated without a status change.
pub fn emit_progress_recorded(run_code: &str, current_iteration: u32) {
    info!(event = "test_run.progress", run = %run_code, current_iteration = current_iteration);
}

pub fn emit_run_aborted(run_code: &str, previous_status: &str) {
    info!(event = "test_run.aborted", run = %run_code, previous_status = %previous_status);
}

pub fn emit_review_continued(run_code: &str, next_iteration: u32, max_iterations: u32) {
    info!(
        event = "test_run.review_continued",
        run = %run_code,
        next_iteration = next_iteration,
        max_iterations = max_iterations,
    );
}

/// Reconciliation repaired a stuck run.
pub fn emit_run_reconciled(run_code: &str, from: &str, to: &str, evaluation_id: &str) {
    info!(
        event = "test_run.reconciled",
        run = %run_code,
        from = %from,
        to = %to,
        evaluation_id = %evaluation_id,
    );
}

pub fn emit_sweep_finished(examined: usize, repaired: usize, failed: usize) {
    info!(
        event = "reconcile.sweep_finished",
        examined = examined,
        repaired = repaired,
        failed = failed,
    );
}

pub fn emit_evaluation_recorded(evaluation_id: &str, status: &str) {
    info!(event = "evaluation.recorded", evaluation_id = %evaluation_id, status = %status);
}

pub fn emit_evaluation_promoted(run_id: &str, evaluation_id: &str) {
    info!(event = "evaluation.promoted", run_id = %run_id, evaluation_id = %evaluation_id);
}

pub fn emit_persona_validated(persona_id: &str, status: &str) {
    info!(event = "persona.validated", persona_id = %persona_id, status = %status);
}

/// A guarded write lost a race (warning level).
pub fn emit_concurrent_modification(id: &str, expected: &str) {
    warn!(event = "store.concurrent_modification", id = %id, expected_status = %expected);
}

/// A best-effort workflow notification was not delivered (warning level).
pub fn emit_notification_failed(run_id: &str, action: &str, error: &dyn std::fmt::Display) {
    warn!(event = "notify.failed", run_id = %run_id, action = %action, error = %error);
}
