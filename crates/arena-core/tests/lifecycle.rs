//! End-to-end lifecycle behaviour over the in-memory stores: the abort,
//! review and reconciliation scenarios plus the invariants every transition
//! must keep.

use std::sync::{Arc, Mutex};

use arena_core::{
    Actor, Arena, ArenaError, Notification, ProgressUpdate, Stores, WorkflowAction,
    WorkflowNotifier, HUMAN_STOP,
};
use arena_state::fakes::{MemoryEvaluationStore, MemoryTestRunStore};
use arena_state::storage_traits::*;
use arena_state::StorageError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Test doubles
// ---------------------------------------------------------------------------

/// Records every notification; optionally refuses them all.
#[derive(Default)]
struct RecordingNotifier {
    sent: Mutex<Vec<Notification>>,
    unreachable: bool,
}

impl RecordingNotifier {
    fn unreachable() -> Self {
        Self {
            unreachable: true,
            ..Default::default()
        }
    }

    fn actions(&self) -> Vec<WorkflowAction> {
        self.sent.lock().unwrap().iter().map(|n| n.action).collect()
    }
}

#[async_trait]
impl WorkflowNotifier for RecordingNotifier {
    async fn notify(&self, notification: &Notification) -> arena_core::Result<()> {
        if self.unreachable {
            return Err(ArenaError::UpstreamUnavailable("connection refused".to_string()));
        }
        self.sent.lock().unwrap().push(notification.clone());
        Ok(())
    }
}

/// Run store that lets a competing writer change a run's status just before
/// the next guarded update lands, or has the backend roll the update back.
#[derive(Default)]
struct RacingRunStore {
    inner: MemoryTestRunStore,
    interloper: Mutex<Option<TestRunStatus>>,
    roll_back_next: Mutex<bool>,
}

impl RacingRunStore {
    fn race_next_update_with(&self, status: TestRunStatus) {
        *self.interloper.lock().unwrap() = Some(status);
    }

    fn conflict_on_next_update(&self) {
        *self.roll_back_next.lock().unwrap() = true;
    }
}

#[async_trait]
impl TestRunStore for RacingRunStore {
    async fn insert(&self, run: TestRun) -> StorageResult<TestRun> {
        self.inner.insert(run).await
    }

    async fn get(&self, id: Uuid) -> StorageResult<Option<TestRun>> {
        self.inner.get(id).await
    }

    async fn conditional_update(
        &self,
        id: Uuid,
        expected: TestRunStatus,
        patch: TestRunPatch,
    ) -> StorageResult<Option<TestRun>> {
        if std::mem::take(&mut *self.roll_back_next.lock().unwrap()) {
            return Err(StorageError::Conflict {
                entity: "test run",
                id,
            });
        }
        let competing = self.interloper.lock().unwrap().take();
        if let Some(status) = competing {
            if let Some(mut run) = self.inner.get(id).await? {
                run.status = status;
                run.awaiting_review = status == TestRunStatus::AwaitingReview;
                self.inner.put_unchecked(run);
            }
        }
        self.inner.conditional_update(id, expected, patch).await
    }

    async fn find(&self, filter: &TestRunFilter) -> StorageResult<Vec<TestRun>> {
        self.inner.find(filter).await
    }

    async fn touch_heartbeat(&self, id: Uuid, at: DateTime<Utc>) -> StorageResult<Option<TestRun>> {
        self.inner.touch_heartbeat(id, at).await
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

struct Harness {
    arena: Arena,
    runs: Arc<MemoryTestRunStore>,
    evaluations: Arc<MemoryEvaluationStore>,
    notifier: Arc<RecordingNotifier>,
}

fn harness_with(notifier: RecordingNotifier) -> Harness {
    let runs = Arc::new(MemoryTestRunStore::new());
    let evaluations = Arc::new(MemoryEvaluationStore::new());
    let notifier = Arc::new(notifier);
    let stores = Stores {
        runs: runs.clone(),
        evaluations: evaluations.clone(),
        personas: Arc::new(arena_state::fakes::MemoryPersonaStore::new()),
    };
    Harness {
        arena: Arena::new(stores, notifier.clone()),
        runs,
        evaluations,
        notifier,
    }
}

fn harness() -> Harness {
    harness_with(RecordingNotifier::default())
}

fn seeded(status: TestRunStatus, current: u32, max: u32) -> TestRun {
    let mut run = TestRun::new("pv-scenario", ExecutionMode::FullCycleWithReview, max);
    run.status = status;
    run.current_iteration = current;
    run.awaiting_review = status == TestRunStatus::AwaitingReview;
    run
}

async fn stored(h: &Harness, id: Uuid) -> TestRun {
    h.runs.get(id).await.unwrap().expect("run exists")
}

// ---------------------------------------------------------------------------
// Abort
// ---------------------------------------------------------------------------

#[tokio::test]
async fn abort_pending_run_then_abort_again() {
    let h = harness();
    let run = seeded(TestRunStatus::Pending, 1, 3);
    h.runs.put_unchecked(run.clone());

    let outcome = h.arena.aborts.abort(run.id).await.unwrap();
    assert_eq!(outcome.previous_status, TestRunStatus::Pending);
    assert_eq!(outcome.new_status, TestRunStatus::Aborted);
    assert!(outcome.warning.is_none());

    let after = stored(&h, run.id).await;
    assert_eq!(after.status, TestRunStatus::Aborted);
    assert_eq!(after.stopped_reason.as_deref(), Some(HUMAN_STOP));
    assert!(after.completed_at.is_some());
    assert!(!after.awaiting_review);
    assert_eq!(h.notifier.actions(), vec![WorkflowAction::Abort]);

    let err = h.arena.aborts.abort(run.id).await.unwrap_err();
    assert_eq!(err.code(), "INVALID_STATUS");
    assert_eq!(err.current_status().as_deref(), Some("aborted"));
}

#[tokio::test]
async fn abort_succeeds_exactly_for_active_statuses() {
    let h = harness();
    for status in TestRunStatus::ALL {
        let run = seeded(status, 1, 3);
        h.runs.put_unchecked(run.clone());

        let result = h.arena.aborts.abort(run.id).await;
        if status.is_abortable() {
            assert!(result.is_ok(), "{status} should abort");
            assert_eq!(stored(&h, run.id).await.status, TestRunStatus::Aborted);
        } else {
            let err = result.unwrap_err();
            assert_eq!(err.code(), "INVALID_STATUS", "{status}");
            assert_eq!(stored(&h, run.id).await.status, status);
        }
    }
}

#[tokio::test]
async fn abort_from_review_clears_flag() {
    let h = harness();
    let run = seeded(TestRunStatus::AwaitingReview, 2, 3);
    h.runs.put_unchecked(run.clone());

    h.arena.aborts.abort(run.id).await.unwrap();
    let after = stored(&h, run.id).await;
    assert!(!after.awaiting_review);
    assert!(after.review_completed_at.is_some());
    assert!(after.review_flag_consistent());
}

#[tokio::test]
async fn abort_missing_run_is_not_found() {
    let h = harness();
    let err = h.arena.aborts.abort(Uuid::new_v4()).await.unwrap_err();
    assert!(matches!(err, ArenaError::NotFound { .. }));
}

#[tokio::test]
async fn abort_commits_even_when_executor_is_unreachable() {
    let h = harness_with(RecordingNotifier::unreachable());
    let run = seeded(TestRunStatus::Running, 1, 1);
    h.runs.put_unchecked(run.clone());

    let outcome = h.arena.aborts.abort(run.id).await.unwrap();
    assert!(outcome.warning.unwrap().contains("connection refused"));
    assert_eq!(stored(&h, run.id).await.status, TestRunStatus::Aborted);
}

// ---------------------------------------------------------------------------
// Review gate
// ---------------------------------------------------------------------------

#[tokio::test]
async fn continue_resumes_and_signals_next_iteration() {
    let h = harness();
    let run = seeded(TestRunStatus::AwaitingReview, 1, 3);
    h.runs.put_unchecked(run.clone());

    let outcome = h.arena.review.continue_after_review(run.id).await.unwrap();
    assert!(outcome.analyzer_triggered);
    assert_eq!(outcome.next_iteration, 2);
    assert_eq!(outcome.max_iterations, 3);
    assert!(outcome.warning.is_none());

    let after = stored(&h, run.id).await;
    assert_eq!(after.status, TestRunStatus::Running);
    assert!(!after.awaiting_review);
    assert!(after.review_completed_at.is_some());
    assert_eq!(after.current_iteration, 1);

    let sent = h.notifier.sent.lock().unwrap().clone();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].action, WorkflowAction::Continue);
    assert_eq!(sent[0].extras["next_iteration"], 2);
}

#[tokio::test]
async fn continue_at_iteration_limit_is_refused() {
    let h = harness();
    let run = seeded(TestRunStatus::AwaitingReview, 3, 3);
    h.runs.put_unchecked(run.clone());

    let err = h.arena.review.continue_after_review(run.id).await.unwrap_err();
    assert!(matches!(
        err,
        ArenaError::IterationLimitReached { current: 3, max: 3 }
    ));

    let after = stored(&h, run.id).await;
    assert_eq!(after.status, TestRunStatus::AwaitingReview);
    assert!(after.awaiting_review);
    assert!(h.notifier.actions().is_empty());
}

#[tokio::test]
async fn continue_requires_review_status() {
    let h = harness();
    let run = seeded(TestRunStatus::Running, 1, 3);
    h.runs.put_unchecked(run.clone());

    let err = h.arena.review.continue_after_review(run.id).await.unwrap_err();
    assert_eq!(err.code(), "INVALID_STATUS");
    assert_eq!(err.current_status().as_deref(), Some("running"));
}

#[tokio::test]
async fn continue_with_unreachable_analyzer_stays_committed() {
    let h = harness_with(RecordingNotifier::unreachable());
    let run = seeded(TestRunStatus::AwaitingReview, 1, 2);
    h.runs.put_unchecked(run.clone());

    let outcome = h.arena.review.continue_after_review(run.id).await.unwrap();
    assert!(!outcome.analyzer_triggered);
    assert!(outcome.warning.is_some());
    assert_eq!(stored(&h, run.id).await.status, TestRunStatus::Running);
}

// ---------------------------------------------------------------------------
// Reconciliation
// ---------------------------------------------------------------------------

#[tokio::test]
async fn stuck_evaluating_run_completes_from_evaluation() {
    let h = harness();
    let run = seeded(TestRunStatus::Evaluating, 1, 1);
    h.runs.put_unchecked(run.clone());

    let mut evaluation = Evaluation::new(run.id, None);
    evaluation.status = EvaluationStatus::Completed;
    evaluation.overall_score = Some(8.4);
    h.evaluations.put_unchecked(evaluation.clone());

    let outcome = h.arena.reconciler.reconcile(run.id).await.unwrap();
    assert!(outcome.reconciled);
    assert_eq!(outcome.previous_status, Some(TestRunStatus::Evaluating));
    assert_eq!(outcome.new_status, Some(TestRunStatus::Completed));
    assert_eq!(outcome.evaluation_id, Some(evaluation.id));

    let after = stored(&h, run.id).await;
    assert_eq!(after.status, TestRunStatus::Completed);
    assert_eq!(after.overall_score, Some(8.4));

    let second = h.arena.reconciler.reconcile(run.id).await.unwrap();
    assert!(!second.reconciled);
}

#[tokio::test]
async fn stuck_running_run_without_evaluations_is_left_alone() {
    let h = harness();
    let run = seeded(TestRunStatus::Running, 1, 1);
    h.runs.put_unchecked(run.clone());

    let outcome = h.arena.reconciler.reconcile(run.id).await.unwrap();
    assert!(!outcome.reconciled);
    assert_eq!(stored(&h, run.id).await.status, TestRunStatus::Running);
}

#[tokio::test]
async fn reconcile_loses_race_without_partial_update() {
    let runs = Arc::new(RacingRunStore::default());
    let evaluations = Arc::new(MemoryEvaluationStore::new());
    let stores = Stores {
        runs: runs.clone(),
        evaluations: evaluations.clone(),
        personas: Arc::new(arena_state::fakes::MemoryPersonaStore::new()),
    };
    let arena = Arena::new(stores, Arc::new(RecordingNotifier::default()));

    let run = seeded(TestRunStatus::Evaluating, 1, 1);
    runs.inner.put_unchecked(run.clone());
    let mut evaluation = Evaluation::new(run.id, None);
    evaluation.status = EvaluationStatus::Completed;
    evaluation.overall_score = Some(9.1);
    evaluations.put_unchecked(evaluation);

    runs.race_next_update_with(TestRunStatus::Failed);
    let err = arena.reconciler.reconcile(run.id).await.unwrap_err();
    assert_eq!(err.code(), "CONCURRENT_MODIFICATION");

    let after = runs.get(run.id).await.unwrap().unwrap();
    assert_eq!(after.status, TestRunStatus::Failed);
    assert_eq!(after.overall_score, None);
    assert!(after.completed_at.is_none());
}

#[tokio::test]
async fn abort_loses_race_to_executor() {
    let runs = Arc::new(RacingRunStore::default());
    let stores = Stores {
        runs: runs.clone(),
        evaluations: Arc::new(MemoryEvaluationStore::new()),
        personas: Arc::new(arena_state::fakes::MemoryPersonaStore::new()),
    };
    let notifier = Arc::new(RecordingNotifier::default());
    let arena = Arena::new(stores, notifier.clone());

    let run = seeded(TestRunStatus::Evaluating, 1, 1);
    runs.inner.put_unchecked(run.clone());

    runs.race_next_update_with(TestRunStatus::Completed);
    let err = arena.aborts.abort(run.id).await.unwrap_err();
    assert!(matches!(err, ArenaError::ConcurrentModification { .. }));
    assert_eq!(
        runs.get(run.id).await.unwrap().unwrap().status,
        TestRunStatus::Completed
    );
    assert!(notifier.actions().is_empty());
}

#[tokio::test]
async fn backend_write_conflict_is_concurrent_modification() {
    let runs = Arc::new(RacingRunStore::default());
    let evaluations = Arc::new(MemoryEvaluationStore::new());
    let stores = Stores {
        runs: runs.clone(),
        evaluations: evaluations.clone(),
        personas: Arc::new(arena_state::fakes::MemoryPersonaStore::new()),
    };
    let arena = Arena::new(stores, Arc::new(RecordingNotifier::default()));

    let run = seeded(TestRunStatus::Evaluating, 1, 1);
    runs.inner.put_unchecked(run.clone());
    let mut evaluation = Evaluation::new(run.id, None);
    evaluation.status = EvaluationStatus::Completed;
    evaluation.overall_score = Some(7.7);
    evaluations.put_unchecked(evaluation);

    runs.conflict_on_next_update();
    let err = arena.reconciler.reconcile(run.id).await.unwrap_err();
    match err {
        ArenaError::ConcurrentModification { id, expected, .. } => {
            assert_eq!(id, run.id);
            assert_eq!(expected.as_deref(), Some("evaluating"));
        }
        other => panic!("expected a concurrent modification, got {other:?}"),
    }
    assert_eq!(
        runs.get(run.id).await.unwrap().unwrap().status,
        TestRunStatus::Evaluating
    );

    // Retrying once the conflict has cleared succeeds.
    let outcome = arena.reconciler.reconcile(run.id).await.unwrap();
    assert_eq!(outcome.new_status, Some(TestRunStatus::Completed));
}

// ---------------------------------------------------------------------------
// Full cycle
// ---------------------------------------------------------------------------

#[tokio::test]
async fn review_flag_tracks_status_through_full_cycle() {
    let h = harness();
    let created = h
        .arena
        .trigger
        .create(arena_core::NewTestRun {
            prompt_version_id: "pv-cycle".to_string(),
            mode: ExecutionMode::FullCycleWithReview,
            max_iterations: 2,
        })
        .await
        .unwrap();
    let id = created.test_run.id;
    let machine = &h.arena.state_machine;

    let steps = [
        (TestRunStatus::Running, Actor::Executor),
        (TestRunStatus::BattlesCompleted, Actor::Executor),
        (TestRunStatus::Evaluating, Actor::Evaluator),
        (TestRunStatus::AwaitingReview, Actor::Executor),
    ];
    for (target, actor) in steps {
        let run = machine.request_transition(id, target, actor).await.unwrap();
        assert!(run.review_flag_consistent(), "after {target}");
    }

    let resumed = h.arena.review.continue_after_review(id).await.unwrap();
    assert!(resumed.run.review_flag_consistent());

    let run = machine
        .report(
            id,
            TestRunStatus::Running,
            Actor::Executor,
            ProgressUpdate {
                current_iteration: Some(resumed.next_iteration),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(run.current_iteration, 2);

    for (target, actor) in steps.into_iter().skip(1) {
        let run = machine.request_transition(id, target, actor).await.unwrap();
        assert!(run.review_flag_consistent(), "after {target}");
    }

    let err = h.arena.review.continue_after_review(id).await.unwrap_err();
    assert_eq!(err.code(), "ITERATION_LIMIT_REACHED");

    let aborted = h.arena.aborts.abort(id).await.unwrap();
    assert!(aborted.run.review_flag_consistent());

    assert_eq!(
        h.notifier.actions(),
        vec![
            WorkflowAction::Start,
            WorkflowAction::Continue,
            WorkflowAction::Abort
        ]
    );
}

#[tokio::test]
async fn executor_cannot_skip_or_abort() {
    let h = harness();
    let run = seeded(TestRunStatus::Pending, 1, 1);
    h.runs.put_unchecked(run.clone());
    let machine = &h.arena.state_machine;

    let err = machine
        .request_transition(run.id, TestRunStatus::Evaluating, Actor::Executor)
        .await
        .unwrap_err();
    assert!(matches!(err, ArenaError::InvalidTransition { .. }));

    let err = machine
        .request_transition(run.id, TestRunStatus::Aborted, Actor::Executor)
        .await
        .unwrap_err();
    assert!(matches!(err, ArenaError::InvalidTransition { .. }));
    assert_eq!(stored(&h, run.id).await.status, TestRunStatus::Pending);
}

#[tokio::test]
async fn single_mode_run_cannot_pause_for_review() {
    let h = harness();
    let mut run = TestRun::new("pv-single", ExecutionMode::Single, 1);
    run.status = TestRunStatus::Evaluating;
    h.runs.put_unchecked(run.clone());

    let err = h
        .arena
        .state_machine
        .request_transition(run.id, TestRunStatus::AwaitingReview, Actor::Executor)
        .await
        .unwrap_err();
    assert_eq!(err.code(), "INVALID_TRANSITION");
    assert_eq!(err.current_status().as_deref(), Some("evaluating"));
}

#[tokio::test]
async fn promotion_leaves_exactly_one_promoted() {
    let h = harness();
    let run_id = Uuid::new_v4();
    let mut ids = Vec::new();
    for score in [6.0, 7.5, 8.0] {
        let mut evaluation = Evaluation::new(run_id, None);
        evaluation.status = EvaluationStatus::Completed;
        evaluation.overall_score = Some(score);
        ids.push(evaluation.id);
        h.evaluations.put_unchecked(evaluation);
    }

    for id in &ids {
        h.arena.promotion.promote(*id).await.unwrap();
        let promoted: Vec<Uuid> = h
            .evaluations
            .list_for_run(run_id)
            .await
            .unwrap()
            .into_iter()
            .filter(|e| e.is_promoted)
            .map(|e| e.id)
            .collect();
        assert_eq!(promoted, vec![*id]);
    }
}
