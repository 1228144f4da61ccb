//! Repair of runs left behind by lost executor callbacks.
//!
//! A run stuck in `running`, `battles_completed` or `evaluating` whose
//! evaluation has in fact finished is moved to the matching terminal
//! status. Every repair is a guarded update on the status that was read,
//! so a concurrent executor callback wins and the repair reports
//! `ConcurrentModification` instead of overwriting it.

use std::sync::Arc;
use std::time::Duration;

use arena_state::{
    EvaluationStatus, EvaluationStore, TestRunFilter, TestRunStatus, TestRunStore,
};
use chrono::Utc;
use futures::stream::{self, StreamExt};
use serde::Serialize;
use tracing::{instrument, Instrument};
use uuid::Uuid;

use crate::error::{ArenaError, Result};
use crate::metrics::METRICS;
use crate::obs;
use crate::state_machine::{check_transition, commit, load_run, transition_patch, Actor};

/// `stopped_reason` recorded when a failed evaluation finalises a run.
pub const RECONCILED_EVALUATION_FAILED: &str = "reconciled_evaluation_failed";

/// Runs reconciled at once during a sweep.
const SWEEP_CONCURRENCY: usize = 4;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReconcileOutcome {
    pub reconciled: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub previous_status: Option<TestRunStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub new_status: Option<TestRunStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub evaluation_id: Option<Uuid>,
    /// Why nothing changed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl ReconcileOutcome {
    fn unchanged(reason: impl Into<String>) -> Self {
        Self {
            reconciled: false,
            previous_status: None,
            new_status: None,
            evaluation_id: None,
            reason: Some(reason.into()),
        }
    }
}

/// One repaired run in a sweep.
#[derive(Debug, Clone, Serialize)]
pub struct SweepRepair {
    pub test_run_id: Uuid,
    pub code: String,
    #[serde(flatten)]
    pub outcome: ReconcileOutcome,
}

/// One run the sweep could not reconcile.
#[derive(Debug, Clone, Serialize)]
pub struct SweepFailure {
    pub test_run_id: Uuid,
    pub code: String,
    pub error_code: &'static str,
    pub message: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct SweepReport {
    /// Stale runs found in a reconcilable status.
    pub examined: usize,
    pub repaired: Vec<SweepRepair>,
    /// Stale runs with no finished evaluation yet.
    pub unchanged: usize,
    pub failures: Vec<SweepFailure>,
}

pub struct ReconciliationService {
    runs: Arc<dyn TestRunStore>,
    evaluations: Arc<dyn EvaluationStore>,
}

impl ReconciliationService {
    pub fn new(runs: Arc<dyn TestRunStore>, evaluations: Arc<dyn EvaluationStore>) -> Self {
        Self { runs, evaluations }
    }

    /// Reconcile one run against its newest finished evaluation.
    ///
    /// Idempotent: once repaired the run is terminal, so a second call is a
    /// no-op with `reconciled = false`.
    #[instrument(skip(self), fields(run_id = %id))]
    pub async fn reconcile(&self, id: Uuid) -> Result<ReconcileOutcome> {
        let run = load_run(self.runs.as_ref(), id).await?;
        if !run.status.is_reconcilable() {
            return Ok(ReconcileOutcome::unchanged(format!(
                "status {} is not reconcilable",
                run.status
            )));
        }

        let evaluations = self.evaluations.list_for_run(id).await?;
        let completed = evaluations
            .iter()
            .find(|e| e.status == EvaluationStatus::Completed);
        let failed = evaluations
            .iter()
            .find(|e| e.status == EvaluationStatus::Failed);

        let (target, evaluation) = match (completed, failed) {
            (Some(done), _) => (TestRunStatus::Completed, done),
            (None, Some(failed)) => (TestRunStatus::Failed, failed),
            (None, None) => {
                return Ok(ReconcileOutcome::unchanged("no finished evaluation"));
            }
        };
        check_transition(&run, target, Actor::Reconciler)?;

        let mut patch = transition_patch(run.status, target, Utc::now());
        match target {
            TestRunStatus::Completed => patch.overall_score = evaluation.overall_score,
            _ => patch.stopped_reason = Some(RECONCILED_EVALUATION_FAILED.to_string()),
        }
        let updated = commit(self.runs.as_ref(), &run, patch).await?;

        METRICS.inc_reconciliations();
        obs::emit_run_reconciled(
            &updated.code,
            run.status.as_str(),
            target.as_str(),
            &evaluation.id.to_string(),
        );

        Ok(ReconcileOutcome {
            reconciled: true,
            previous_status: Some(run.status),
            new_status: Some(updated.status),
            evaluation_id: Some(evaluation.id),
            reason: None,
        })
    }

    /// Reconcile every run whose heartbeat is older than `stale_after`.
    ///
    /// One run failing (conflict, storage error) is recorded in the report
    /// and does not stop the others.
    pub async fn sweep(&self, stale_after: Duration) -> Result<SweepReport> {
        let stale_after = chrono::Duration::from_std(stale_after)
            .map_err(|_| ArenaError::Validation("stale threshold out of range".to_string()))?;
        let filter = TestRunFilter {
            statuses: TestRunStatus::RECONCILABLE.to_vec(),
            heartbeat_before: Some(Utc::now() - stale_after),
        };
        let stale = self.runs.find(&filter).await?;

        let mut report = SweepReport {
            examined: stale.len(),
            ..Default::default()
        };

        let results: Vec<_> = stream::iter(stale)
            .map(|run| async move {
                let result = self
                    .reconcile(run.id)
                    .instrument(obs::run_span(&run.code))
                    .await;
                (run, result)
            })
            .buffer_unordered(SWEEP_CONCURRENCY)
            .collect()
            .await;

        for (run, result) in results {
            match result {
                Ok(outcome) if outcome.reconciled => report.repaired.push(SweepRepair {
                    test_run_id: run.id,
                    code: run.code,
                    outcome,
                }),
                Ok(_) => report.unchanged += 1,
                Err(e) => report.failures.push(SweepFailure {
                    test_run_id: run.id,
                    code: run.code,
                    error_code: e.code(),
                    message: e.to_string(),
                }),
            }
        }

        obs::emit_sweep_finished(report.examined, report.repaired.len(), report.failures.len());
        Ok(report)
    }
}
