//! Trait contract tests for TestRunStore, EvaluationStore and PersonaStore.
//!
//! Every contract is written once against the trait object and run for
//! both the in-memory fakes and the in-memory SurrealDB backend. Any
//! conforming implementation must pass these. The SurrealDB module adds
//! contention cases on a multi-threaded runtime.

use chrono::{Duration, Utc};
use uuid::Uuid;

use arena_state::fakes::{MemoryEvaluationStore, MemoryPersonaStore, MemoryTestRunStore};
use arena_state::storage_traits::*;
use arena_state::{StorageError, SurrealArenaStore};

fn pending_run() -> TestRun {
    TestRun::new("prompt-v7", ExecutionMode::FullCycleWithReview, 3)
}

fn to_running() -> TestRunPatch {
    TestRunPatch {
        status: Some(TestRunStatus::Running),
        ..Default::default()
    }
}

// ===========================================================================
// TestRunStore contracts
// ===========================================================================

async fn runs_insert_then_get(store: &dyn TestRunStore) {
    let run = pending_run();
    store.insert(run.clone()).await.unwrap();

    let fetched = store.get(run.id).await.unwrap().expect("run should exist");
    assert_eq!(fetched.id, run.id);
    assert_eq!(fetched.code, run.code);
    assert_eq!(fetched.status, TestRunStatus::Pending);
    assert_eq!(fetched.current_iteration, 1);
}

async fn runs_get_missing_is_none(store: &dyn TestRunStore) {
    assert!(store.get(Uuid::new_v4()).await.unwrap().is_none());
}

async fn runs_insert_duplicate_rejected(store: &dyn TestRunStore) {
    let run = pending_run();
    store.insert(run.clone()).await.unwrap();
    let err = store.insert(run).await.unwrap_err();
    assert!(matches!(err, StorageError::Duplicate { .. }));
}

async fn runs_conditional_update_applies_on_match(store: &dyn TestRunStore) {
    let run = store.insert(pending_run()).await.unwrap();

    let updated = store
        .conditional_update(run.id, TestRunStatus::Pending, to_running())
        .await
        .unwrap()
        .expect("precondition holds");
    assert_eq!(updated.status, TestRunStatus::Running);

    let stored = store.get(run.id).await.unwrap().unwrap();
    assert_eq!(stored.status, TestRunStatus::Running);
}

async fn runs_conditional_update_skips_on_mismatch(store: &dyn TestRunStore) {
    let run = store.insert(pending_run()).await.unwrap();

    let patch = TestRunPatch {
        status: Some(TestRunStatus::Completed),
        overall_score: Some(9.0),
        ..Default::default()
    };
    let outcome = store
        .conditional_update(run.id, TestRunStatus::Evaluating, patch)
        .await
        .unwrap();
    assert!(outcome.is_none());

    let stored = store.get(run.id).await.unwrap().unwrap();
    assert_eq!(stored.status, TestRunStatus::Pending);
    assert_eq!(stored.overall_score, None);
}

async fn runs_conditional_update_writes_only_patched_fields(store: &dyn TestRunStore) {
    let run = store.insert(pending_run()).await.unwrap();
    store
        .conditional_update(run.id, TestRunStatus::Pending, to_running())
        .await
        .unwrap()
        .unwrap();
    let beat = Utc::now() + Duration::seconds(30);
    store.touch_heartbeat(run.id, beat).await.unwrap().unwrap();

    let progress = TestRunPatch {
        success_count: Some(5),
        failure_count: Some(1),
        ..Default::default()
    };
    let updated = store
        .conditional_update(run.id, TestRunStatus::Running, progress)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(updated.success_count, 5);
    assert_eq!(updated.failure_count, 1);
    assert_eq!(updated.status, TestRunStatus::Running);
    assert_eq!(updated.code, run.code);
    let kept = updated.last_heartbeat_at.expect("heartbeat survives the update");
    assert!((kept - beat).num_milliseconds().abs() < 1);
}

async fn runs_conditional_update_missing_is_none(store: &dyn TestRunStore) {
    let outcome = store
        .conditional_update(Uuid::new_v4(), TestRunStatus::Pending, to_running())
        .await
        .unwrap();
    assert!(outcome.is_none());
}

async fn runs_find_filters_by_status_and_heartbeat(store: &dyn TestRunStore) {
    let fresh = store.insert(pending_run()).await.unwrap();
    store
        .conditional_update(fresh.id, TestRunStatus::Pending, to_running())
        .await
        .unwrap();

    let mut stale = pending_run();
    stale.last_heartbeat_at = Some(Utc::now() - Duration::hours(2));
    let stale = store.insert(stale).await.unwrap();
    store
        .conditional_update(stale.id, TestRunStatus::Pending, to_running())
        .await
        .unwrap();

    let untouched = store.insert(pending_run()).await.unwrap();

    let running = store
        .find(&TestRunFilter {
            statuses: vec![TestRunStatus::Running],
            heartbeat_before: None,
        })
        .await
        .unwrap();
    let ids: Vec<Uuid> = running.iter().map(|r| r.id).collect();
    assert!(ids.contains(&fresh.id));
    assert!(ids.contains(&stale.id));
    assert!(!ids.contains(&untouched.id));

    let stale_only = store
        .find(&TestRunFilter {
            statuses: vec![TestRunStatus::Running],
            heartbeat_before: Some(Utc::now() - Duration::hours(1)),
        })
        .await
        .unwrap();
    let ids: Vec<Uuid> = stale_only.iter().map(|r| r.id).collect();
    assert_eq!(ids, vec![stale.id]);
}

async fn runs_touch_heartbeat(store: &dyn TestRunStore) {
    let run = store.insert(pending_run()).await.unwrap();
    let at = Utc::now() + Duration::seconds(5);

    let touched = store.touch_heartbeat(run.id, at).await.unwrap().unwrap();
    let beat = touched.last_heartbeat_at.unwrap();
    assert!((beat - at).num_milliseconds().abs() < 1);

    assert!(store
        .touch_heartbeat(Uuid::new_v4(), at)
        .await
        .unwrap()
        .is_none());
}

// ===========================================================================
// EvaluationStore contracts
// ===========================================================================

async fn evaluations_list_newest_first(store: &dyn EvaluationStore) {
    let run_id = Uuid::new_v4();
    let mut older = Evaluation::new(run_id, None);
    older.created_at = Utc::now() - Duration::minutes(10);
    let newer = Evaluation::new(run_id, Some("cfg-2".to_string()));
    let other_run = Evaluation::new(Uuid::new_v4(), None);

    store.insert(older.clone()).await.unwrap();
    store.insert(newer.clone()).await.unwrap();
    store.insert(other_run).await.unwrap();

    let listed = store.list_for_run(run_id).await.unwrap();
    let ids: Vec<Uuid> = listed.iter().map(|e| e.id).collect();
    assert_eq!(ids, vec![newer.id, older.id]);
}

async fn evaluations_conditional_update(store: &dyn EvaluationStore) {
    let evaluation = store
        .insert(Evaluation::new(Uuid::new_v4(), None))
        .await
        .unwrap();

    let patch = EvaluationPatch {
        status: Some(EvaluationStatus::Completed),
        overall_score: Some(8.4),
        completed_at: Some(Utc::now()),
        ..Default::default()
    };
    let stale = store
        .conditional_update(evaluation.id, EvaluationStatus::Running, patch.clone())
        .await
        .unwrap();
    assert!(stale.is_none());

    let done = store
        .conditional_update(evaluation.id, EvaluationStatus::Pending, patch)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(done.status, EvaluationStatus::Completed);
    assert_eq!(done.overall_score, Some(8.4));
}

async fn evaluations_promotion_is_exclusive(store: &dyn EvaluationStore) {
    let run_id = Uuid::new_v4();
    let first = store.insert(Evaluation::new(run_id, None)).await.unwrap();
    let second = store.insert(Evaluation::new(run_id, None)).await.unwrap();
    let third = store.insert(Evaluation::new(run_id, None)).await.unwrap();
    let foreign = store
        .insert(Evaluation::new(Uuid::new_v4(), None))
        .await
        .unwrap();

    store.set_promoted(run_id, first.id).await.unwrap().unwrap();
    store.set_promoted(foreign.test_run_id, foreign.id).await.unwrap();
    let promoted = store.set_promoted(run_id, third.id).await.unwrap().unwrap();
    assert!(promoted.is_promoted);

    let listed = store.list_for_run(run_id).await.unwrap();
    let promoted_ids: Vec<Uuid> = listed
        .iter()
        .filter(|e| e.is_promoted)
        .map(|e| e.id)
        .collect();
    assert_eq!(promoted_ids, vec![third.id]);
    assert!(listed.iter().any(|e| e.id == second.id && !e.is_promoted));

    // Sibling runs are untouched.
    assert!(store.get(foreign.id).await.unwrap().unwrap().is_promoted);
}

async fn evaluations_promote_foreign_run_is_none(store: &dyn EvaluationStore) {
    let evaluation = store
        .insert(Evaluation::new(Uuid::new_v4(), None))
        .await
        .unwrap();
    let outcome = store
        .set_promoted(Uuid::new_v4(), evaluation.id)
        .await
        .unwrap();
    assert!(outcome.is_none());
    assert!(!store.get(evaluation.id).await.unwrap().unwrap().is_promoted);
}

// ===========================================================================
// PersonaStore contracts
// ===========================================================================

async fn personas_guarded_validation(store: &dyn PersonaStore) {
    let persona = store
        .insert(Persona::new(
            "impatient-customer",
            serde_json::json!({"tone": "curt"}),
        ))
        .await
        .unwrap();

    let update = PersonaValidationUpdate {
        status: PersonaValidationStatus::Approved,
        note: Some("looks realistic".to_string()),
        validated_at: Utc::now(),
    };
    let approved = store
        .conditional_set_validation(
            persona.id,
            PersonaValidationStatus::PendingValidation,
            update.clone(),
        )
        .await
        .unwrap()
        .unwrap();
    assert_eq!(approved.validation_status, PersonaValidationStatus::Approved);
    assert_eq!(approved.validation_note.as_deref(), Some("looks realistic"));

    let again = store
        .conditional_set_validation(persona.id, PersonaValidationStatus::PendingValidation, update)
        .await
        .unwrap();
    assert!(again.is_none());
}

// ===========================================================================
// Memory fakes
// ===========================================================================

mod memory {
    use super::*;

    #[tokio::test]
    async fn insert_then_get() {
        runs_insert_then_get(&MemoryTestRunStore::new()).await;
    }

    #[tokio::test]
    async fn get_missing_is_none() {
        runs_get_missing_is_none(&MemoryTestRunStore::new()).await;
    }

    #[tokio::test]
    async fn insert_duplicate_rejected() {
        runs_insert_duplicate_rejected(&MemoryTestRunStore::new()).await;
    }

    #[tokio::test]
    async fn conditional_update_applies_on_match() {
        runs_conditional_update_applies_on_match(&MemoryTestRunStore::new()).await;
    }

    #[tokio::test]
    async fn conditional_update_skips_on_mismatch() {
        runs_conditional_update_skips_on_mismatch(&MemoryTestRunStore::new()).await;
    }

    #[tokio::test]
    async fn conditional_update_missing_is_none() {
        runs_conditional_update_missing_is_none(&MemoryTestRunStore::new()).await;
    }

    #[tokio::test]
    async fn conditional_update_writes_only_patched_fields() {
        runs_conditional_update_writes_only_patched_fields(&MemoryTestRunStore::new()).await;
    }

    #[tokio::test]
    async fn find_filters_by_status_and_heartbeat() {
        runs_find_filters_by_status_and_heartbeat(&MemoryTestRunStore::new()).await;
    }

    #[tokio::test]
    async fn touch_heartbeat() {
        runs_touch_heartbeat(&MemoryTestRunStore::new()).await;
    }

    #[tokio::test]
    async fn evaluations_newest_first() {
        evaluations_list_newest_first(&MemoryEvaluationStore::new()).await;
    }

    #[tokio::test]
    async fn evaluation_conditional_update() {
        evaluations_conditional_update(&MemoryEvaluationStore::new()).await;
    }

    #[tokio::test]
    async fn promotion_is_exclusive() {
        evaluations_promotion_is_exclusive(&MemoryEvaluationStore::new()).await;
    }

    #[tokio::test]
    async fn promote_foreign_run_is_none() {
        evaluations_promote_foreign_run_is_none(&MemoryEvaluationStore::new()).await;
    }

    #[tokio::test]
    async fn persona_guarded_validation() {
        personas_guarded_validation(&MemoryPersonaStore::new()).await;
    }
}

// ===========================================================================
// SurrealArenaStore (mirrors the memory fakes above)
// ===========================================================================

mod surreal {
    use super::*;

    async fn store() -> SurrealArenaStore {
        SurrealArenaStore::in_memory()
            .await
            .expect("in_memory() failed")
    }

    #[tokio::test]
    async fn insert_then_get() {
        runs_insert_then_get(&store().await).await;
    }

    #[tokio::test]
    async fn get_missing_is_none() {
        runs_get_missing_is_none(&store().await).await;
    }

    #[tokio::test]
    async fn insert_duplicate_rejected() {
        runs_insert_duplicate_rejected(&store().await).await;
    }

    #[tokio::test]
    async fn conditional_update_applies_on_match() {
        runs_conditional_update_applies_on_match(&store().await).await;
    }

    #[tokio::test]
    async fn conditional_update_skips_on_mismatch() {
        runs_conditional_update_skips_on_mismatch(&store().await).await;
    }

    #[tokio::test]
    async fn conditional_update_missing_is_none() {
        runs_conditional_update_missing_is_none(&store().await).await;
    }

    #[tokio::test]
    async fn conditional_update_writes_only_patched_fields() {
        runs_conditional_update_writes_only_patched_fields(&store().await).await;
    }

    #[tokio::test]
    async fn find_filters_by_status_and_heartbeat() {
        runs_find_filters_by_status_and_heartbeat(&store().await).await;
    }

    #[tokio::test]
    async fn touch_heartbeat() {
        runs_touch_heartbeat(&store().await).await;
    }

    #[tokio::test]
    async fn evaluations_newest_first() {
        evaluations_list_newest_first(&store().await).await;
    }

    #[tokio::test]
    async fn evaluation_conditional_update() {
        evaluations_conditional_update(&store().await).await;
    }

    #[tokio::test]
    async fn promotion_is_exclusive() {
        evaluations_promotion_is_exclusive(&store().await).await;
    }

    #[tokio::test]
    async fn promote_foreign_run_is_none() {
        evaluations_promote_foreign_run_is_none(&store().await).await;
    }

    #[tokio::test]
    async fn persona_guarded_validation() {
        personas_guarded_validation(&store().await).await;
    }

    // -- contention ----------------------------------------------------------

    const TRIALS: usize = 40;

    fn assert_conflict_or_ok<T: std::fmt::Debug>(outcome: &Result<T, StorageError>) {
        if let Err(err) = outcome {
            assert!(
                matches!(err, StorageError::Conflict { .. }),
                "a lost race must be reported as a conflict, got {err:?}"
            );
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_promotions_leave_one_promoted() {
        let store = store().await;

        for _ in 0..TRIALS {
            let run_id = Uuid::new_v4();
            let a = EvaluationStore::insert(&store, Evaluation::new(run_id, None)).await.unwrap().id;
            let b = EvaluationStore::insert(&store, Evaluation::new(run_id, None)).await.unwrap().id;

            let (first, second) = tokio::join!(
                tokio::spawn({
                    let store = store.clone();
                    async move { store.set_promoted(run_id, a).await }
                }),
                tokio::spawn({
                    let store = store.clone();
                    async move { store.set_promoted(run_id, b).await }
                }),
            );
            let (first, second) = (first.unwrap(), second.unwrap());
            assert_conflict_or_ok(&first);
            assert_conflict_or_ok(&second);

            let succeeded: Vec<Uuid> = [(&first, a), (&second, b)]
                .into_iter()
                .filter(|(outcome, _)| matches!(outcome, Ok(Some(_))))
                .map(|(_, id)| id)
                .collect();

            let promoted: Vec<Uuid> = store
                .list_for_run(run_id)
                .await
                .unwrap()
                .into_iter()
                .filter(|e| e.is_promoted)
                .map(|e| e.id)
                .collect();
            assert!(promoted.len() <= 1, "promoted evaluations: {promoted:?}");
            if !succeeded.is_empty() {
                assert_eq!(promoted.len(), 1);
                assert!(succeeded.contains(&promoted[0]));
            }
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn progress_update_keeps_concurrent_heartbeat() {
        let store = store().await;

        for trial in 0..TRIALS {
            let mut run = pending_run();
            run.status = TestRunStatus::Running;
            let id = TestRunStore::insert(&store, run).await.unwrap().id;
            let beat = Utc::now() + Duration::seconds(trial as i64 + 1);

            let progress = TestRunPatch {
                success_count: Some(3),
                ..Default::default()
            };
            let (updated, touched) = tokio::join!(
                tokio::spawn({
                    let store = store.clone();
                    async move {
                        TestRunStore::conditional_update(&store, id, TestRunStatus::Running, progress)
                            .await
                    }
                }),
                tokio::spawn({
                    let store = store.clone();
                    async move { store.touch_heartbeat(id, beat).await }
                }),
            );
            let (updated, touched) = (updated.unwrap(), touched.unwrap());
            assert_conflict_or_ok(&updated);
            assert_conflict_or_ok(&touched);

            let stored = TestRunStore::get(&store, id).await.unwrap().unwrap();
            assert_eq!(stored.status, TestRunStatus::Running);
            if matches!(updated, Ok(Some(_))) {
                assert_eq!(stored.success_count, 3);
            }
            if matches!(touched, Ok(Some(_))) {
                let kept = stored.last_heartbeat_at.expect("heartbeat was written");
                assert!((kept - beat).num_milliseconds().abs() < 1);
            }
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn competing_guarded_updates_apply_at_most_once() {
        let store = store().await;

        for _ in 0..TRIALS {
            let id = TestRunStore::insert(&store, pending_run()).await.unwrap().id;

            let finish = |status: TestRunStatus| {
                let store = store.clone();
                tokio::spawn(async move {
                    TestRunStore::conditional_update(
                            &store,
                            id,
                            TestRunStatus::Pending,
                            TestRunPatch {
                                status: Some(status),
                                ..Default::default()
                            },
                        )
                        .await
                })
            };
            let (started, aborted) = tokio::join!(
                finish(TestRunStatus::Running),
                finish(TestRunStatus::Aborted)
            );
            let (started, aborted) = (started.unwrap(), aborted.unwrap());
            assert_conflict_or_ok(&started);
            assert_conflict_or_ok(&aborted);

            let winners: Vec<TestRunStatus> = [started, aborted]
                .into_iter()
                .filter_map(|outcome| outcome.ok().flatten())
                .map(|run| run.status)
                .collect();
            assert!(winners.len() <= 1, "both guarded updates applied: {winners:?}");

            let stored = TestRunStore::get(&store, id).await.unwrap().unwrap();
            match winners.first() {
                Some(status) => assert_eq!(stored.status, *status),
                None => assert_eq!(stored.status, TestRunStatus::Pending),
            }
        }
    }
}
