//! Promotion of one evaluation as the authoritative result of its run.

use std::sync::Arc;

use arena_state::{Evaluation, EvaluationStatus, EvaluationStore};
use tracing::instrument;
use uuid::Uuid;

use crate::error::{ArenaError, Result};
use crate::obs;

/// Thin API over [`EvaluationStore::set_promoted`].
pub struct PromotionService {
    evaluations: Arc<dyn EvaluationStore>,
}

impl PromotionService {
    pub fn new(evaluations: Arc<dyn EvaluationStore>) -> Self {
        Self { evaluations }
    }

    /// Promote a completed evaluation, un-promoting its siblings.
    ///
    /// Promoting an already promoted evaluation re-runs both steps, which
    /// repairs a run left with no promoted evaluation by an interrupted call.
    #[instrument(skip(self), fields(evaluation_id = %id))]
    pub async fn promote(&self, id: Uuid) -> Result<Evaluation> {
        let evaluation = self
            .evaluations
            .get(id)
            .await?
            .ok_or_else(|| ArenaError::evaluation_not_found(id))?;

        if evaluation.status != EvaluationStatus::Completed {
            return Err(ArenaError::invalid_status(
                evaluation.status,
                "only completed evaluations can be promoted",
            ));
        }

        let promoted = self
            .evaluations
            .set_promoted(evaluation.test_run_id, evaluation.id)
            .await?
            .ok_or_else(|| ArenaError::evaluation_not_found(id))?;

        obs::emit_evaluation_promoted(&promoted.test_run_id.to_string(), &promoted.id.to_string());
        Ok(promoted)
    }
}
