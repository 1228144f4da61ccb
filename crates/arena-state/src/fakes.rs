//! In-memory fakes for storage traits
//!
//! Provides `MemoryTestRunStore`, `MemoryEvaluationStore`, and
//! `MemoryPersonaStore` that satisfy the trait contracts without any external
//! dependencies. Each guarded update runs under a single mutex acquisition,
//! which gives the same all-or-nothing behaviour as the conditional SQL.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::StorageError;
use crate::storage_traits::*;

// ---------------------------------------------------------------------------
// MemoryTestRunStore
// ---------------------------------------------------------------------------

/// In-memory test-run store backed by a `HashMap<id, TestRun>`.
#[derive(Debug, Default)]
pub struct MemoryTestRunStore {
    runs: Mutex<HashMap<Uuid, TestRun>>,
}

impl MemoryTestRunStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Overwrite a run without any guard. Test setup only.
    pub fn put_unchecked(&self, run: TestRun) {
        let mut runs = self.runs.lock().unwrap();
        runs.insert(run.id, run);
    }
}

#[async_trait]
impl TestRunStore for MemoryTestRunStore {
    async fn insert(&self, run: TestRun) -> StorageResult<TestRun> {
        let mut runs = self.runs.lock().unwrap();
        if runs.contains_key(&run.id) {
            return Err(StorageError::Duplicate {
                table: "test_runs",
                id: run.id.to_string(),
            });
        }
        runs.insert(run.id, run.clone());
        Ok(run)
    }

    async fn get(&self, id: Uuid) -> StorageResult<Option<TestRun>> {
        let runs = self.runs.lock().unwrap();
        Ok(runs.get(&id).cloned())
    }

    async fn conditional_update(
        &self,
        id: Uuid,
        expected: TestRunStatus,
        patch: TestRunPatch,
    ) -> StorageResult<Option<TestRun>> {
        let mut runs = self.runs.lock().unwrap();
        match runs.get_mut(&id) {
            Some(run) if run.status == expected => {
                patch.apply_to(run);
                Ok(Some(run.clone()))
            }
            _ => Ok(None),
        }
    }

    async fn find(&self, filter: &TestRunFilter) -> StorageResult<Vec<TestRun>> {
        let runs = self.runs.lock().unwrap();
        let mut matched: Vec<TestRun> = runs
            .values()
            .filter(|run| filter.matches(run))
            .cloned()
            .collect();
        matched.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        Ok(matched)
    }

    async fn touch_heartbeat(&self, id: Uuid, at: DateTime<Utc>) -> StorageResult<Option<TestRun>> {
        let mut runs = self.runs.lock().unwrap();
        Ok(runs.get_mut(&id).map(|run| {
            run.last_heartbeat_at = Some(at);
            run.clone()
        }))
    }
}

// ---------------------------------------------------------------------------
// MemoryEvaluationStore
// ---------------------------------------------------------------------------

/// In-memory evaluation store. Insertion order is kept so that evaluations
/// created within the same clock tick still list newest first.
#[derive(Debug, Default)]
pub struct MemoryEvaluationStore {
    evaluations: Mutex<Vec<Evaluation>>,
}

impl MemoryEvaluationStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Overwrite an evaluation without any guard. Test setup only.
    pub fn put_unchecked(&self, evaluation: Evaluation) {
        let mut evaluations = self.evaluations.lock().unwrap();
        match evaluations.iter_mut().find(|e| e.id == evaluation.id) {
            Some(slot) => *slot = evaluation,
            None => evaluations.push(evaluation),
        }
    }
}

#[async_trait]
impl EvaluationStore for MemoryEvaluationStore {
    async fn insert(&self, evaluation: Evaluation) -> StorageResult<Evaluation> {
        let mut evaluations = self.evaluations.lock().unwrap();
        if evaluations.iter().any(|e| e.id == evaluation.id) {
            return Err(StorageError::Duplicate {
                table: "evaluations",
                id: evaluation.id.to_string(),
            });
        }
        evaluations.push(evaluation.clone());
        Ok(evaluation)
    }

    async fn get(&self, id: Uuid) -> StorageResult<Option<Evaluation>> {
        let evaluations = self.evaluations.lock().unwrap();
        Ok(evaluations.iter().find(|e| e.id == id).cloned())
    }

    async fn list_for_run(&self, test_run_id: Uuid) -> StorageResult<Vec<Evaluation>> {
        let evaluations = self.evaluations.lock().unwrap();
        let mut matched: Vec<Evaluation> = evaluations
            .iter()
            .rev()
            .filter(|e| e.test_run_id == test_run_id)
            .cloned()
            .collect();
        // Stable sort: ties keep the reversed insertion order.
        matched.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(matched)
    }

    async fn conditional_update(
        &self,
        id: Uuid,
        expected: EvaluationStatus,
        patch: EvaluationPatch,
    ) -> StorageResult<Option<Evaluation>> {
        let mut evaluations = self.evaluations.lock().unwrap();
        match evaluations.iter_mut().find(|e| e.id == id) {
            Some(evaluation) if evaluation.status == expected => {
                patch.apply_to(evaluation);
                Ok(Some(evaluation.clone()))
            }
            _ => Ok(None),
        }
    }

    async fn set_promoted(
        &self,
        test_run_id: Uuid,
        evaluation_id: Uuid,
    ) -> StorageResult<Option<Evaluation>> {
        let mut evaluations = self.evaluations.lock().unwrap();
        let belongs = evaluations
            .iter()
            .any(|e| e.id == evaluation_id && e.test_run_id == test_run_id);
        if !belongs {
            return Ok(None);
        }

        for evaluation in evaluations.iter_mut().filter(|e| e.test_run_id == test_run_id) {
            evaluation.is_promoted = false;
        }
        let target = evaluations.iter_mut().find(|e| e.id == evaluation_id);
        Ok(target.map(|evaluation| {
            evaluation.is_promoted = true;
            evaluation.clone()
        }))
    }
}

// ---------------------------------------------------------------------------
// MemoryPersonaStore
// ---------------------------------------------------------------------------

/// In-memory persona store backed by a `HashMap<id, Persona>`.
#[derive(Debug, Default)]
pub struct MemoryPersonaStore {
    personas: Mutex<HashMap<Uuid, Persona>>,
}

impl MemoryPersonaStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl PersonaStore for MemoryPersonaStore {
    async fn insert(&self, persona: Persona) -> StorageResult<Persona> {
        let mut personas = self.personas.lock().unwrap();
        if personas.contains_key(&persona.id) {
            return Err(StorageError::Duplicate {
                table: "personas",
                id: persona.id.to_string(),
            });
        }
        personas.insert(persona.id, persona.clone());
        Ok(persona)
    }

    async fn get(&self, id: Uuid) -> StorageResult<Option<Persona>> {
        let personas = self.personas.lock().unwrap();
        Ok(personas.get(&id).cloned())
    }

    async fn conditional_set_validation(
        &self,
        id: Uuid,
        expected: PersonaValidationStatus,
        update: PersonaValidationUpdate,
    ) -> StorageResult<Option<Persona>> {
        let mut personas = self.personas.lock().unwrap();
        match personas.get_mut(&id) {
            Some(persona) if persona.validation_status == expected => {
                persona.validation_status = update.status;
                persona.validation_note = update.note;
                persona.validated_at = Some(update.validated_at);
                Ok(Some(persona.clone()))
            }
            _ => Ok(None),
        }
    }
}
