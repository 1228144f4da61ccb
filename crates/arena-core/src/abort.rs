//! Kill switch for active test runs.
//!
//! Abort is advisory: the executor polls the run status at its checkpoints
//! and stops when it sees `aborted`. The controller cannot cancel work that
//! is already in flight outside this service.

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

/// `stopped_reason` recorded for operator aborts.
pub const HUMAN_STOP: &str = "human_stop";

/// Result of a committed abort.
#[derive(Debug, Clone, Serialize)]
pub struct AbortOutcome {
    pub previous_status: TestRunStatus,
    pub new_status: TestRunStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub warning: Option<String>,
    #[serde(skip)]
    pub run: TestRun,
}

pub struct AbortController {
    runs: Arc<dyn TestRunStore>,
    notifier: Arc<dyn WorkflowNotifier>,
}

impl AbortController {
    pub fn new(runs: Arc<dyn TestRunStore>, notifier: Arc<dyn WorkflowNotifier>) -> Self {
        Self { runs, notifier }
    }

    /// Abort a run that is still active.
    ///
    /// # Errors
    ///
    /// `NotFound` if the run does not exist, `InvalidStatus` (with the
    /// current status) if it is already terminal, `ConcurrentModification`
    /// if its status changed between read and write.
    #[instrument(skip(self), fields(run_id = %id))]
    pub async fn abort(&self, id: Uuid) -> Result<AbortOutcome> {
        let run = load_run(self.runs.as_ref(), id).await?;
        if !run.status.is_abortable() {
            return Err(ArenaError::invalid_status(
                run.status,
                format!("test run {} cannot be aborted", run.code),
            ));
        }

        let mut patch = transition_patch(run.status, TestRunStatus::Aborted, Utc::now());
        patch.stopped_reason = Some(HUMAN_STOP.to_string());
        let updated = commit(self.runs.as_ref(), &run, patch).await?;

        METRICS.inc_aborts();
        obs::emit_run_aborted(&updated.code, run.status.as_str());

        let notification = Notification::new(updated.id, WorkflowAction::Abort)
            .with("previous_status", run.status.as_str())
            .with("stopped_reason", HUMAN_STOP);
        let warning = notify_best_effort(self.notifier.as_ref(), &notification).await;

        Ok(AbortOutcome {
            previous_status: run.status,
            new_status: updated.status,
            warning,
            run: updated,
        })
    }
}
