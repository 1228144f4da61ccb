//! Evaluation lifecycle: re-evaluation trigger and evaluator callbacks.
//!
//! ```text
//! pending ─▶ running ─▶ completed | failed
//!    └──────────────────▶ completed | failed
//! ```
//!
//! Finished evaluations are immutable.

use std::sync::Arc;

use arena_state::{
    Evaluation, EvaluationPatch, EvaluationStatus, EvaluationStore, TestRunStatus, TestRunStore,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::instrument;
use uuid::Uuid;

use crate::error::{conflict_as_miss, ArenaError, Result};
use crate::notifier::{notify_best_effort, Notification, WorkflowAction, WorkflowNotifier};
use crate::obs;
use crate::state_machine::load_run;

/// Result reported by the external evaluator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvaluationResult {
    pub status: EvaluationStatus,
    #[serde(default)]
    pub overall_score: Option<f64>,
    #[serde(default)]
    pub error_message: Option<String>,
}

/// A freshly created evaluation and the delivery status of its trigger.
#[derive(Debug, Clone, Serialize)]
pub struct EvaluationRequested {
    pub evaluation: Evaluation,
    pub evaluator_triggered: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub warning: Option<String>,
}

/// Whether an evaluation may move `from -> to`.
pub fn is_legal_evaluation_transition(from: EvaluationStatus, to: EvaluationStatus) -> bool {
    use EvaluationStatus::*;
    matches!(
        (from, to),
        (Pending, Running) | (Pending, Completed) | (Pending, Failed) | (Running, Completed) | (Running, Failed)
    )
}

pub struct EvaluationService {
    runs: Arc<dyn TestRunStore>,
    evaluations: Arc<dyn EvaluationStore>,
    notifier: Arc<dyn WorkflowNotifier>,
}

impl EvaluationService {
    pub fn new(
        runs: Arc<dyn TestRunStore>,
        evaluations: Arc<dyn EvaluationStore>,
        notifier: Arc<dyn WorkflowNotifier>,
    ) -> Self {
        Self {
            runs,
            evaluations,
            notifier,
        }
    }

    /// Create a pending evaluation for a run whose battles have finished and
    /// ask the analyzer to score it.
    #[instrument(skip(self), fields(run_id = %test_run_id))]
    pub async fn request(
        &self,
        test_run_id: Uuid,
        evaluator_config_id: Option<String>,
    ) -> Result<EvaluationRequested> {
        let run = load_run(self.runs.as_ref(), test_run_id).await?;
        if matches!(
            run.status,
            TestRunStatus::Pending | TestRunStatus::Running | TestRunStatus::Aborted
        ) {
            return Err(ArenaError::invalid_status(
                run.status,
                format!("test run {} has no battles to evaluate", run.code),
            ));
        }

        let evaluation = self
            .evaluations
            .insert(Evaluation::new(test_run_id, evaluator_config_id))
            .await?;
        obs::emit_evaluation_recorded(&evaluation.id.to_string(), evaluation.status.as_str());

        let mut notification = Notification::new(test_run_id, WorkflowAction::Evaluate)
            .with("evaluation_id", evaluation.id.to_string());
        if let Some(config_id) = &evaluation.evaluator_config_id {
            notification = notification.with("evaluator_config_id", config_id.clone());
        }
        let warning = notify_best_effort(self.notifier.as_ref(), &notification).await;

        Ok(EvaluationRequested {
            evaluation,
            evaluator_triggered: warning.is_none(),
            warning,
        })
    }

    /// Apply an evaluator callback.
    #[instrument(skip(self, result), fields(evaluation_id = %id, status = %result.status))]
    pub async fn record_result(&self, id: Uuid, result: EvaluationResult) -> Result<Evaluation> {
        let evaluation = self.get(id).await?;

        if evaluation.status.is_terminal() {
            return Err(ArenaError::invalid_status(
                evaluation.status,
                "finished evaluations cannot change",
            ));
        }
        if !is_legal_evaluation_transition(evaluation.status, result.status) {
            return Err(ArenaError::invalid_status(
                evaluation.status,
                format!("evaluation cannot move to {}", result.status),
            ));
        }
        match result.overall_score {
            Some(score) if !score.is_finite() => {
                return Err(ArenaError::Validation(
                    "overall_score must be a finite number".to_string(),
                ));
            }
            None if result.status == EvaluationStatus::Completed => {
                return Err(ArenaError::Validation(
                    "a completed evaluation requires overall_score".to_string(),
                ));
            }
            _ => {}
        }

        let patch = EvaluationPatch {
            status: Some(result.status),
            overall_score: result.overall_score,
            error_message: result.error_message,
            completed_at: result.status.is_terminal().then(Utc::now),
        };
        let updated = conflict_as_miss(
            self.evaluations
                .conditional_update(id, evaluation.status, patch)
                .await,
        )?
        .ok_or_else(|| ArenaError::ConcurrentModification {
            entity: "evaluation",
            id,
            expected: Some(evaluation.status.to_string()),
        })?;

        obs::emit_evaluation_recorded(&updated.id.to_string(), updated.status.as_str());
        Ok(updated)
    }

    pub async fn get(&self, id: Uuid) -> Result<Evaluation> {
        self.evaluations
            .get(id)
            .await?
            .ok_or_else(|| ArenaError::evaluation_not_found(id))
    }

    /// Evaluations of a run, newest first.
    pub async fn list_for_run(&self, test_run_id: Uuid) -> Result<Vec<Evaluation>> {
        load_run(self.runs.as_ref(), test_run_id).await?;
        Ok(self.evaluations.list_for_run(test_run_id).await?)
    }
}
