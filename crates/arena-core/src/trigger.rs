//! Creation of new test runs.

use std::sync::Arc;

use arena_state::{ExecutionMode, TestRun, TestRunStore};
use serde::{Deserialize, Serialize};
use tracing::instrument;

use crate::error::{ArenaError, Result};
use crate::notifier::{notify_best_effort, Notification, WorkflowAction, WorkflowNotifier};
use crate::obs;

/// Request to start testing a prompt version.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewTestRun {
    pub prompt_version_id: String,
    pub mode: ExecutionMode,
    pub max_iterations: u32,
}

impl NewTestRun {
    fn validate(&self) -> Result<()> {
        if self.prompt_version_id.trim().is_empty() {
            return Err(ArenaError::Validation(
                "prompt_version_id must not be empty".to_string(),
            ));
        }
        if self.max_iterations == 0 {
            return Err(ArenaError::Validation(
                "max_iterations must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RunCreated {
    pub test_run: TestRun,
    pub executor_triggered: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub warning: Option<String>,
}

pub struct RunTrigger {
    runs: Arc<dyn TestRunStore>,
    notifier: Arc<dyn WorkflowNotifier>,
}

impl RunTrigger {
    pub fn new(runs: Arc<dyn TestRunStore>, notifier: Arc<dyn WorkflowNotifier>) -> Self {
        Self { runs, notifier }
    }

    /// Create a `pending` run on its first iteration and ask the executor to
    /// start it.
    #[instrument(skip_all, fields(prompt_version_id = %request.prompt_version_id))]
    pub async fn create(&self, request: NewTestRun) -> Result<RunCreated> {
        request.validate()?;

        let run = self
            .runs
            .insert(TestRun::new(
                request.prompt_version_id,
                request.mode,
                request.max_iterations,
            ))
            .await?;
        obs::emit_run_created(
            &run.code,
            &run.prompt_version_id,
            run.mode.as_str(),
            run.max_iterations,
        );

        let notification = Notification::new(run.id, WorkflowAction::Start)
            .with("code", run.code.clone())
            .with("prompt_version_id", run.prompt_version_id.clone())
            .with("mode", run.mode.as_str())
            .with("max_iterations", run.max_iterations)
            .with("current_iteration", run.current_iteration);
        let warning = notify_best_effort(self.notifier.as_ref(), &notification).await;

        Ok(RunCreated {
            test_run: run,
            executor_triggered: warning.is_none(),
            warning,
        })
    }
}
