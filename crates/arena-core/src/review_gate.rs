//! Human-in-the-loop pause point for `full_cycle_with_review` runs.
//!
//! The executor parks a run in `awaiting_review` after each evaluation. A
//! human either aborts it or continues it here, which puts it back to
//! `running` and asks the analyzer to start the next iteration. The
//! iteration counter itself is advanced by the executor's progress reports.

use std::sync::Arc;

use arena_state::{TestRun, TestRunStatus, TestRunStore};
use chrono::Utc;
use serde::Serialize;
use tracing::instrument;
use uuid::Uuid;

use crate::error::{ArenaError, Result};
use crate::metrics::METRICS;
use crate::notifier::{notify_best_effort, Notification, WorkflowAction, WorkflowNotifier};
use crate::obs;
use crate::state_machine::{commit, load_run, transition_patch};

/// Result of a committed continue.
#[derive(Debug, Clone, Serialize)]
pub struct ContinueOutcome {
    /// Whether the analyzer accepted the `continue` notification.
    pub analyzer_triggered: bool,
    pub next_iteration: u32,
    pub max_iterations: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub warning: Option<String>,
    #[serde(skip)]
    pub run: TestRun,
}

pub struct ReviewGate {
    runs: Arc<dyn TestRunStore>,
    notifier: Arc<dyn WorkflowNotifier>,
}

impl ReviewGate {
    pub fn new(runs: Arc<dyn TestRunStore>, notifier: Arc<dyn WorkflowNotifier>) -> Self {
        Self { runs, notifier }
    }

    /// Release a run from review into its next iteration.
    ///
    /// The status change is committed before the analyzer is notified; an
    /// undelivered notification leaves the run `running` and comes back as
    /// `analyzer_triggered = false` with a warning.
    ///
    /// # Errors
    ///
    /// `NotFound`, `InvalidStatus` unless the run is awaiting review,
    /// `IterationLimitReached` once `current_iteration >= max_iterations`,
    /// `ConcurrentModification` on a lost race.
    #[instrument(skip(self), fields(run_id = %id))]
    pub async fn continue_after_review(&self, id: Uuid) -> Result<ContinueOutcome> {
        let run = load_run(self.runs.as_ref(), id).await?;

        if run.status != TestRunStatus::AwaitingReview || !run.awaiting_review {
            return Err(ArenaError::invalid_status(
                run.status,
                format!("test run {} is not awaiting review", run.code),
            ));
        }
        if run.current_iteration >= run.max_iterations {
            return Err(ArenaError::IterationLimitReached {
                current: run.current_iteration,
                max: run.max_iterations,
            });
        }

        let patch = transition_patch(run.status, TestRunStatus::Running, Utc::now());
        let updated = commit(self.runs.as_ref(), &run, patch).await?;

        let next_iteration = run.current_iteration + 1;
        METRICS.inc_continues();
        obs::emit_review_continued(&updated.code, next_iteration, updated.max_iterations);

        let notification = Notification::new(updated.id, WorkflowAction::Continue)
            .with("next_iteration", next_iteration)
            .with("max_iterations", updated.max_iterations)
            .with("prompt_version_id", updated.prompt_version_id.clone());
        let warning = notify_best_effort(self.notifier.as_ref(), &notification).await;

        Ok(ContinueOutcome {
            analyzer_triggered: warning.is_none(),
            next_iteration,
            max_iterations: updated.max_iterations,
            warning,
            run: updated,
        })
    }
}
