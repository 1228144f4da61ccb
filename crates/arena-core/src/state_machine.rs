//! Test-run state machine: legal transitions, guards and actor permissions.
//!
//! ```text
//! pending ─▶ running ─▶ battles_completed ─▶ evaluating ─▶ completed
//!               ▲                                 │
//!               └──── awaiting_review ◀───────────┘ (full_cycle_with_review)
//!
//! any active ─▶ aborted (human)      any active ─▶ failed
//! ```
//!
//! The pure functions here decide whether a move is allowed and what it
//! writes. [`TestRunStateMachine`] persists a move with a conditional update
//! keyed on the status it read.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use arena_state::{
    ExecutionMode, ParseEnumError, TestRun, TestRunPatch, TestRunStatus, TestRunStore,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::instrument;
use uuid::Uuid;

use crate::error::{conflict_as_miss, ArenaError, Result};
use crate::metrics::METRICS;
use crate::obs;

/// Who is asking for a transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Actor {
    /// External workflow running the battles.
    Executor,
    /// External scoring workflow.
    Evaluator,
    /// Operator acting through the dashboard or CLI.
    Human,
    /// Out-of-band repair of lost callbacks.
    Reconciler,
}

impl Actor {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Executor => "executor",
            Self::Evaluator => "evaluator",
            Self::Human => "human",
            Self::Reconciler => "reconciler",
        }
    }
}

impl fmt::Display for Actor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Actor {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "executor" => Ok(Self::Executor),
            "evaluator" => Ok(Self::Evaluator),
            "human" => Ok(Self::Human),
            "reconciler" => Ok(Self::Reconciler),
            other => Err(ParseEnumError {
                kind: "actor",
                value: other.to_string(),
            }),
        }
    }
}

/// Whether `from -> to` is an edge of the lifecycle graph for some actor.
pub fn is_legal_transition(from: TestRunStatus, to: TestRunStatus) -> bool {
    use TestRunStatus::*;

    if from.is_abortable() && matches!(to, Aborted | Failed) {
        return true;
    }
    if from.is_reconcilable() && to == Completed {
        return true;
    }
    matches!(
        (from, to),
        (Pending, Running)
            | (Running, BattlesCompleted)
            | (BattlesCompleted, Evaluating)
            | (Evaluating, Completed)
            | (Evaluating, AwaitingReview)
            | (AwaitingReview, Running)
    )
}

/// Whether `actor` may drive the legal edge `from -> to`.
pub fn actor_permits(actor: Actor, from: TestRunStatus, to: TestRunStatus) -> bool {
    use TestRunStatus::*;

    match actor {
        Actor::Human => match to {
            Aborted => from.is_abortable(),
            Running => from == AwaitingReview,
            _ => false,
        },
        Actor::Executor => match (from, to) {
            (_, Failed) => from.is_abortable(),
            (Pending, Running)
            | (Running, BattlesCompleted)
            | (BattlesCompleted, Evaluating)
            | (Evaluating, Completed)
            | (Evaluating, AwaitingReview) => true,
            _ => false,
        },
        Actor::Evaluator => matches!(
            (from, to),
            (BattlesCompleted, Evaluating)
                | (Evaluating, Completed)
                | (Evaluating, Failed)
        ),
        Actor::Reconciler => from.is_reconcilable() && matches!(to, Completed | Failed),
    }
}

/// Check every rule for moving `run` to `to` on behalf of `actor`.
pub fn check_transition(run: &TestRun, to: TestRunStatus, actor: Actor) -> Result<()> {
    let from = run.status;
    let refuse = |reason: String| ArenaError::InvalidTransition { from, to, reason };

    if from.is_terminal() {
        return Err(refuse(format!("{from} is terminal")));
    }
    if !is_legal_transition(from, to) {
        return Err(refuse("not a legal transition".to_string()));
    }
    if !actor_permits(actor, from, to) {
        return Err(refuse(format!("{actor} may not perform this transition")));
    }
    if to == TestRunStatus::AwaitingReview && run.mode != ExecutionMode::FullCycleWithReview {
        return Err(refuse(format!("review requires full_cycle_with_review mode, run is {}", run.mode)));
    }
    if from == TestRunStatus::AwaitingReview
        && to == TestRunStatus::Running
        && run.current_iteration >= run.max_iterations
    {
        return Err(refuse(format!(
            "iteration limit reached ({}/{})",
            run.current_iteration, run.max_iterations
        )));
    }
    Ok(())
}

/// Fields written by the move `from -> to` at `now`.
///
/// Keeps `awaiting_review` in step with the status, stamps `completed_at`
/// on terminal states and `review_completed_at` when leaving review.
pub fn transition_patch(from: TestRunStatus, to: TestRunStatus, now: DateTime<Utc>) -> TestRunPatch {
    TestRunPatch {
        status: Some(to),
        awaiting_review: Some(to == TestRunStatus::AwaitingReview),
        completed_at: to.is_terminal().then_some(now),
        review_completed_at: (from == TestRunStatus::AwaitingReview
            && to != TestRunStatus::AwaitingReview)
            .then_some(now),
        ..Default::default()
    }
}

/// Load a run or fail with `NotFound`.
pub(crate) async fn load_run(runs: &dyn TestRunStore, id: Uuid) -> Result<TestRun> {
    runs.get(id)
        .await?
        .ok_or_else(|| ArenaError::run_not_found(id))
}

/// Persist `patch` on `run`, guarded on the status it was read with.
pub(crate) async fn commit(
    runs: &dyn TestRunStore,
    run: &TestRun,
    patch: TestRunPatch,
) -> Result<TestRun> {
    match conflict_as_miss(runs.conditional_update(run.id, run.status, patch).await)? {
        Some(updated) => Ok(updated),
        None => {
            METRICS.inc_conflicts();
            obs::emit_concurrent_modification(&run.id.to_string(), run.status.as_str());
            Err(ArenaError::ConcurrentModification {
                entity: "test run",
                id: run.id,
                expected: Some(run.status.to_string()),
            })
        }
    }
}

/// Progress reported by the executor alongside (or instead of) a status change.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProgressUpdate {
    pub current_iteration: Option<u32>,
    pub success_count: Option<u32>,
    pub failure_count: Option<u32>,
    pub timeout_count: Option<u32>,
    pub overall_score: Option<f64>,
    pub stopped_reason: Option<String>,
}

impl ProgressUpdate {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    fn validate(&self, run: &TestRun) -> Result<()> {
        if let Some(iteration) = self.current_iteration {
            if iteration == 0 || iteration > run.max_iterations {
                return Err(ArenaError::Validation(format!(
                    "current_iteration must be between 1 and {}, got {}",
                    run.max_iterations, iteration
                )));
            }
        }
        if let Some(score) = self.overall_score {
            if !score.is_finite() {
                return Err(ArenaError::Validation(
                    "overall_score must be a finite number".to_string(),
                ));
            }
        }
        Ok(())
    }

    fn merge_into(self, patch: &mut TestRunPatch) {
        patch.current_iteration = self.current_iteration;
        patch.success_count = self.success_count;
        patch.failure_count = self.failure_count;
        patch.timeout_count = self.timeout_count;
        patch.overall_score = self.overall_score;
        patch.stopped_reason = self.stopped_reason;
    }
}

/// Owner of the test-run lifecycle rules.
pub struct TestRunStateMachine {
    runs: Arc<dyn TestRunStore>,
}

impl TestRunStateMachine {
    pub fn new(runs: Arc<dyn TestRunStore>) -> Self {
        Self { runs }
    }

    /// Move a run to `target` on behalf of `actor`.
    pub async fn request_transition(
        &self,
        id: Uuid,
        target: TestRunStatus,
        actor: Actor,
    ) -> Result<TestRun> {
        self.report(id, target, actor, ProgressUpdate::default())
            .await
    }

    /// Apply an executor status report.
    ///
    /// Reporting the run's current status is a progress-only update; any
    /// other status goes through the transition rules. Terminal runs accept
    /// neither.
    #[instrument(skip_all, fields(run_id = %id, target = %target, actor = %actor))]
    pub async fn report(
        &self,
        id: Uuid,
        target: TestRunStatus,
        actor: Actor,
        progress: ProgressUpdate,
    ) -> Result<TestRun> {
        let run = load_run(self.runs.as_ref(), id).await?;
        progress.validate(&run)?;

        if target == run.status {
            if run.status.is_terminal() {
                return Err(ArenaError::invalid_status(
                    run.status,
                    "terminal test runs do not accept progress updates",
                ));
            }
            let mut patch = TestRunPatch::default();
            progress.merge_into(&mut patch);
            let updated = commit(self.runs.as_ref(), &run, patch).await?;
            obs::emit_progress_recorded(&updated.code, updated.current_iteration);
            return Ok(updated);
        }

        check_transition(&run, target, actor)?;

        let mut patch = transition_patch(run.status, target, Utc::now());
        progress.merge_into(&mut patch);
        let updated = commit(self.runs.as_ref(), &run, patch).await?;

        METRICS.inc_transitions();
        obs::emit_transition(&updated.code, run.status.as_str(), target.as_str(), actor.as_str());
        Ok(updated)
    }

    /// Record an executor heartbeat.
    pub async fn heartbeat(&self, id: Uuid) -> Result<TestRun> {
        self.runs
            .touch_heartbeat(id, Utc::now())
            .await?
            .ok_or_else(|| ArenaError::run_not_found(id))
    }

    /// Fetch a run for status polling.
    pub async fn get(&self, id: Uuid) -> Result<TestRun> {
        load_run(self.runs.as_ref(), id).await
    }
}
