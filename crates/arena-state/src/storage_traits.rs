//! Storage trait definitions for the battle arena
//!
//! These traits define the core storage abstractions:
//! - `TestRunStore`: test-run persistence with status-guarded updates
//! - `EvaluationStore`: evaluation persistence and exclusive promotion
//! - `PersonaStore`: persona persistence with guarded validation updates
//!
//! All traits are async and backend-agnostic. In-memory fakes are provided
//! for testing via the `fakes` module.

use std::fmt;
use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::StorageError;

/// Result type for storage operations
pub type StorageResult<T> = std::result::Result<T, StorageError>;

/// Raised when a stored or user-supplied string does not name a known variant.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown {kind}: {value}")]
pub struct ParseEnumError {
    pub kind: &'static str,
    pub value: String,
}

// ---------------------------------------------------------------------------
// TestRun
// ---------------------------------------------------------------------------

/// Lifecycle status of a test run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TestRunStatus {
    Pending,
    Running,
    BattlesCompleted,
    Evaluating,
    Completed,
    Failed,
    Aborted,
    AwaitingReview,
}

impl TestRunStatus {
    pub const ALL: [TestRunStatus; 8] = [
        TestRunStatus::Pending,
        TestRunStatus::Running,
        TestRunStatus::BattlesCompleted,
        TestRunStatus::Evaluating,
        TestRunStatus::Completed,
        TestRunStatus::Failed,
        TestRunStatus::Aborted,
        TestRunStatus::AwaitingReview,
    ];

    /// Statuses from which a human may abort the run.
    pub const ABORTABLE: [TestRunStatus; 5] = [
        TestRunStatus::Running,
        TestRunStatus::Pending,
        TestRunStatus::AwaitingReview,
        TestRunStatus::BattlesCompleted,
        TestRunStatus::Evaluating,
    ];

    /// Statuses in which a lost completion callback can leave a run stuck.
    pub const RECONCILABLE: [TestRunStatus; 3] = [
        TestRunStatus::Running,
        TestRunStatus::Evaluating,
        TestRunStatus::BattlesCompleted,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::BattlesCompleted => "battles_completed",
            Self::Evaluating => "evaluating",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Aborted => "aborted",
            Self::AwaitingReview => "awaiting_review",
        }
    }

    /// Whether no further transitions are allowed.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Aborted)
    }

    pub fn is_abortable(self) -> bool {
        Self::ABORTABLE.contains(&self)
    }

    pub fn is_reconcilable(self) -> bool {
        Self::RECONCILABLE.contains(&self)
    }
}

impl fmt::Display for TestRunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TestRunStatus {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| ParseEnumError {
                kind: "test run status",
                value: s.to_string(),
            })
    }
}

/// How the executor drives a test run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    /// One battle/evaluate pass, then a terminal status.
    Single,
    /// Battle, evaluate, pause for human review, optimise, repeat.
    FullCycleWithReview,
}

impl ExecutionMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Single => "single",
            Self::FullCycleWithReview => "full_cycle_with_review",
        }
    }
}

impl fmt::Display for ExecutionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ExecutionMode {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "single" => Ok(Self::Single),
            "full_cycle_with_review" => Ok(Self::FullCycleWithReview),
            other => Err(ParseEnumError {
                kind: "execution mode",
                value: other.to_string(),
            }),
        }
    }
}

/// A test run: one execution cycle of a prompt version against personas.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestRun {
    pub id: Uuid,
    /// Human-readable code, e.g. `TR-1A2B3C4D`.
    pub code: String,
    pub prompt_version_id: String,
    pub mode: ExecutionMode,
    pub max_iterations: u32,
    pub current_iteration: u32,
    pub status: TestRunStatus,
    /// Mirrors `status == AwaitingReview`; kept as its own column for the executor.
    pub awaiting_review: bool,
    pub success_count: u32,
    pub failure_count: u32,
    pub timeout_count: u32,
    pub overall_score: Option<f64>,
    pub stopped_reason: Option<String>,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub review_completed_at: Option<DateTime<Utc>>,
    pub last_heartbeat_at: Option<DateTime<Utc>>,
}

impl TestRun {
    /// Create a new run in `Pending`, on its first iteration.
    pub fn new(prompt_version_id: impl Into<String>, mode: ExecutionMode, max_iterations: u32) -> Self {
        let id = Uuid::new_v4();
        let now = Utc::now();
        Self {
            id,
            code: Self::code_for(id),
            prompt_version_id: prompt_version_id.into(),
            mode,
            max_iterations,
            current_iteration: 1,
            status: TestRunStatus::Pending,
            awaiting_review: false,
            success_count: 0,
            failure_count: 0,
            timeout_count: 0,
            overall_score: None,
            stopped_reason: None,
            started_at: now,
            completed_at: None,
            review_completed_at: None,
            last_heartbeat_at: Some(now),
        }
    }

    /// Derive the human-readable code for a run id.
    pub fn code_for(id: Uuid) -> String {
        let simple = id.simple().to_string();
        format!("TR-{}", simple[..8].to_ascii_uppercase())
    }

    /// Whether the status/awaiting_review pair is consistent.
    pub fn review_flag_consistent(&self) -> bool {
        self.awaiting_review == (self.status == TestRunStatus::AwaitingReview)
    }
}

/// Field-level changes applied by a guarded update.
///
/// `None` leaves the stored value untouched; patches never clear a field.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TestRunPatch {
    pub status: Option<TestRunStatus>,
    pub awaiting_review: Option<bool>,
    pub current_iteration: Option<u32>,
    pub success_count: Option<u32>,
    pub failure_count: Option<u32>,
    pub timeout_count: Option<u32>,
    pub overall_score: Option<f64>,
    pub stopped_reason: Option<String>,
    pub completed_at: Option<DateTime<Utc>>,
    pub review_completed_at: Option<DateTime<Utc>>,
}

impl TestRunPatch {
    pub fn apply_to(&self, run: &mut TestRun) {
        if let Some(status) = self.status {
            run.status = status;
        }
        if let Some(flag) = self.awaiting_review {
            run.awaiting_review = flag;
        }
        if let Some(iteration) = self.current_iteration {
            run.current_iteration = iteration;
        }
        if let Some(count) = self.success_count {
            run.success_count = count;
        }
        if let Some(count) = self.failure_count {
            run.failure_count = count;
        }
        if let Some(count) = self.timeout_count {
            run.timeout_count = count;
        }
        if let Some(score) = self.overall_score {
            run.overall_score = Some(score);
        }
        if let Some(reason) = &self.stopped_reason {
            run.stopped_reason = Some(reason.clone());
        }
        if let Some(at) = self.completed_at {
            run.completed_at = Some(at);
        }
        if let Some(at) = self.review_completed_at {
            run.review_completed_at = Some(at);
        }
    }
}

/// Query filter for [`TestRunStore::find`].
#[derive(Debug, Clone, Default)]
pub struct TestRunFilter {
    /// Restrict to these statuses. Empty means any status.
    pub statuses: Vec<TestRunStatus>,
    /// Only runs whose last heartbeat (or start, if none) is strictly older.
    pub heartbeat_before: Option<DateTime<Utc>>,
}

impl TestRunFilter {
    pub fn matches(&self, run: &TestRun) -> bool {
        if !self.statuses.is_empty() && !self.statuses.contains(&run.status) {
            return false;
        }
        match self.heartbeat_before {
            Some(cutoff) => run.last_heartbeat_at.unwrap_or(run.started_at) < cutoff,
            None => true,
        }
    }
}

/// Test-run persistence.
///
/// Guarantees:
/// - `conditional_update` is atomic: the patch is applied only if the stored
///   status still equals `expected`, otherwise nothing is written. Only the
///   fields the patch sets are written, so a concurrent heartbeat survives.
/// - A write that loses a backend transaction conflict fails with
///   [`StorageError::Conflict`] and leaves the record unchanged.
/// - `find` returns runs newest first (by `started_at`).
#[async_trait]
pub trait TestRunStore: Send + Sync {
    /// Insert a new run. Fails with `Duplicate` if the id exists.
    async fn insert(&self, run: TestRun) -> StorageResult<TestRun>;

    /// Fetch a run by id.
    async fn get(&self, id: Uuid) -> StorageResult<Option<TestRun>>;

    /// Apply `patch` iff the run exists and its status equals `expected`.
    ///
    /// Returns the updated run, or `None` when zero rows matched.
    async fn conditional_update(
        &self,
        id: Uuid,
        expected: TestRunStatus,
        patch: TestRunPatch,
    ) -> StorageResult<Option<TestRun>>;

    /// List runs matching a filter.
    async fn find(&self, filter: &TestRunFilter) -> StorageResult<Vec<TestRun>>;

    /// Record an executor heartbeat. Returns `None` if the run is absent.
    async fn touch_heartbeat(&self, id: Uuid, at: DateTime<Utc>) -> StorageResult<Option<TestRun>>;
}

// ---------------------------------------------------------------------------
// Evaluation
// ---------------------------------------------------------------------------

/// Status of a scoring pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvaluationStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl EvaluationStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

impl fmt::Display for EvaluationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EvaluationStatus {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            other => Err(ParseEnumError {
                kind: "evaluation status",
                value: other.to_string(),
            }),
        }
    }
}

/// One scoring pass over a test run's battles.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Evaluation {
    pub id: Uuid,
    pub test_run_id: Uuid,
    pub evaluator_config_id: Option<String>,
    pub status: EvaluationStatus,
    pub overall_score: Option<f64>,
    pub is_promoted: bool,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Evaluation {
    /// Create a new pending evaluation for a run.
    pub fn new(test_run_id: Uuid, evaluator_config_id: Option<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            test_run_id,
            evaluator_config_id,
            status: EvaluationStatus::Pending,
            overall_score: None,
            is_promoted: false,
            error_message: None,
            created_at: Utc::now(),
            completed_at: None,
        }
    }
}

/// Field-level changes to an evaluation.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EvaluationPatch {
    pub status: Option<EvaluationStatus>,
    pub overall_score: Option<f64>,
    pub error_message: Option<String>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl EvaluationPatch {
    pub fn apply_to(&self, evaluation: &mut Evaluation) {
        if let Some(status) = self.status {
            evaluation.status = status;
        }
        if let Some(score) = self.overall_score {
            evaluation.overall_score = Some(score);
        }
        if let Some(message) = &self.error_message {
            evaluation.error_message = Some(message.clone());
        }
        if let Some(at) = self.completed_at {
            evaluation.completed_at = Some(at);
        }
    }
}

/// Evaluation persistence.
///
/// Guarantees:
/// - `list_for_run` returns evaluations newest first.
/// - `set_promoted` un-promotes every sibling and promotes the target as one
///   unit: concurrent calls never leave two promoted evaluations. A call that
///   loses the race fails with [`StorageError::Conflict`].
#[async_trait]
pub trait EvaluationStore: Send + Sync {
    async fn insert(&self, evaluation: Evaluation) -> StorageResult<Evaluation>;

    async fn get(&self, id: Uuid) -> StorageResult<Option<Evaluation>>;

    async fn list_for_run(&self, test_run_id: Uuid) -> StorageResult<Vec<Evaluation>>;

    /// Apply `patch` iff the evaluation's status equals `expected`.
    async fn conditional_update(
        &self,
        id: Uuid,
        expected: EvaluationStatus,
        patch: EvaluationPatch,
    ) -> StorageResult<Option<Evaluation>>;

    /// Make `evaluation_id` the only promoted evaluation of `test_run_id`.
    ///
    /// Returns the promoted evaluation, or `None` if it does not belong to the run.
    async fn set_promoted(
        &self,
        test_run_id: Uuid,
        evaluation_id: Uuid,
    ) -> StorageResult<Option<Evaluation>>;
}

// ---------------------------------------------------------------------------
// Persona
// ---------------------------------------------------------------------------

/// Review status of a persona definition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PersonaValidationStatus {
    PendingValidation,
    Approved,
    Rejected,
    ApprovedOverride,
}

impl PersonaValidationStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::PendingValidation => "pending_validation",
            Self::Approved => "approved",
            Self::Rejected => "rejected",
            Self::ApprovedOverride => "approved_override",
        }
    }
}

impl fmt::Display for PersonaValidationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PersonaValidationStatus {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending_validation" => Ok(Self::PendingValidation),
            "approved" => Ok(Self::Approved),
            "rejected" => Ok(Self::Rejected),
            "approved_override" => Ok(Self::ApprovedOverride),
            other => Err(ParseEnumError {
                kind: "persona validation status",
                value: other.to_string(),
            }),
        }
    }
}

/// A test-subject definition used by the executor in battles.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Persona {
    pub id: Uuid,
    pub name: String,
    pub profile: serde_json::Value,
    pub validation_status: PersonaValidationStatus,
    pub validation_note: Option<String>,
    pub validated_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl Persona {
    pub fn new(name: impl Into<String>, profile: serde_json::Value) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            profile,
            validation_status: PersonaValidationStatus::PendingValidation,
            validation_note: None,
            validated_at: None,
            created_at: Utc::now(),
        }
    }
}

/// New validation state written by [`PersonaStore::conditional_set_validation`].
#[derive(Debug, Clone, PartialEq)]
pub struct PersonaValidationUpdate {
    pub status: PersonaValidationStatus,
    pub note: Option<String>,
    pub validated_at: DateTime<Utc>,
}

/// Persona persistence.
#[async_trait]
pub trait PersonaStore: Send + Sync {
    async fn insert(&self, persona: Persona) -> StorageResult<Persona>;

    async fn get(&self, id: Uuid) -> StorageResult<Option<Persona>>;

    /// Write `update` iff the stored validation status equals `expected`.
    async fn conditional_set_validation(
        &self,
        id: Uuid,
        expected: PersonaValidationStatus,
        update: PersonaValidationUpdate,
    ) -> StorageResult<Option<Persona>>;
}
