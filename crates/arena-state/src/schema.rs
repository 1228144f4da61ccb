//! SurrealDB row mappings
//!
//! Rows keep enums and ids as strings and timestamps as SurrealDB datetimes,
//! so that conditional `WHERE status = $expected` guards and datetime range
//! queries run inside the database.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::StorageError;
use crate::storage_traits::{
    Evaluation, EvaluationPatch, Persona, StorageResult, TestRun, TestRunPatch,
};

/// Module for serializing chrono DateTime to SurrealDB datetime format
mod surreal_datetime {
    use chrono::{DateTime, Utc};
    use serde::{self, Deserialize, Deserializer, Serializer};
    use surrealdb::sql::Datetime as SurrealDatetime;

    pub fn serialize<S>(date: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let sd = SurrealDatetime::from(*date);
        serde::Serialize::serialize(&sd, serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<DateTime<Utc>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let sd = SurrealDatetime::deserialize(deserializer)?;
        Ok(DateTime::from(sd))
    }
}

/// Module for serializing optional chrono DateTime to SurrealDB datetime format
mod surreal_datetime_opt {
    use chrono::{DateTime, Utc};
    use serde::{self, Deserialize, Deserializer, Serializer};
    use surrealdb::sql::Datetime as SurrealDatetime;

    pub fn serialize<S>(date: &Option<DateTime<Utc>>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match date {
            Some(d) => {
                let sd = SurrealDatetime::from(*d);
                serde::Serialize::serialize(&Some(sd), serializer)
            }
            None => serde::Serialize::serialize(&None::<SurrealDatetime>, serializer),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<DateTime<Utc>>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let sd = Option::<SurrealDatetime>::deserialize(deserializer)?;
        Ok(sd.map(DateTime::from))
    }
}

fn parse_uuid(field: &'static str, value: &str) -> StorageResult<Uuid> {
    Uuid::parse_str(value).map_err(|_| StorageError::Corrupt {
        field,
        value: value.to_string(),
    })
}

fn parse_enum<T: std::str::FromStr>(field: &'static str, value: &str) -> StorageResult<T> {
    value.parse().map_err(|_| StorageError::Corrupt {
        field,
        value: value.to_string(),
    })
}

// ---------------------------------------------------------------------------
// test_runs
// ---------------------------------------------------------------------------

/// Row in the `test_runs` table
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestRunRow {
    /// SurrealDB record ID
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<surrealdb::sql::Thing>,
    pub run_id: String,
    pub code: String,
    pub prompt_version_id: String,
    pub mode: String,
    pub max_iterations: u32,
    pub current_iteration: u32,
    /// One of the snake_case `TestRunStatus` names
    pub status: String,
    pub awaiting_review: bool,
    pub success_count: u32,
    pub failure_count: u32,
    pub timeout_count: u32,
    pub overall_score: Option<f64>,
    pub stopped_reason: Option<String>,
    #[serde(with = "surreal_datetime")]
    pub started_at: DateTime<Utc>,
    #[serde(default, with = "surreal_datetime_opt")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, with = "surreal_datetime_opt")]
    pub review_completed_at: Option<DateTime<Utc>>,
    #[serde(default, with = "surreal_datetime_opt")]
    pub last_heartbeat_at: Option<DateTime<Utc>>,
}

impl TestRunRow {
    pub fn from_record(run: &TestRun) -> Self {
        Self {
            id: None,
            run_id: run.id.to_string(),
            code: run.code.clone(),
            prompt_version_id: run.prompt_version_id.clone(),
            mode: run.mode.as_str().to_string(),
            max_iterations: run.max_iterations,
            current_iteration: run.current_iteration,
            status: run.status.as_str().to_string(),
            awaiting_review: run.awaiting_review,
            success_count: run.success_count,
            failure_count: run.failure_count,
            timeout_count: run.timeout_count,
            overall_score: run.overall_score,
            stopped_reason: run.stopped_reason.clone(),
            started_at: run.started_at,
            completed_at: run.completed_at,
            review_completed_at: run.review_completed_at,
            last_heartbeat_at: run.last_heartbeat_at,
        }
    }

    pub fn into_record(self) -> StorageResult<TestRun> {
        Ok(TestRun {
            id: parse_uuid("test_runs.run_id", &self.run_id)?,
            code: self.code,
            prompt_version_id: self.prompt_version_id,
            mode: parse_enum("test_runs.mode", &self.mode)?,
            max_iterations: self.max_iterations,
            current_iteration: self.current_iteration,
            status: parse_enum("test_runs.status", &self.status)?,
            awaiting_review: self.awaiting_review,
            success_count: self.success_count,
            failure_count: self.failure_count,
            timeout_count: self.timeout_count,
            overall_score: self.overall_score,
            stopped_reason: self.stopped_reason,
            started_at: self.started_at,
            completed_at: self.completed_at,
            review_completed_at: self.review_completed_at,
            last_heartbeat_at: self.last_heartbeat_at,
        })
    }
}

/// Partial `test_runs` document for `UPDATE ... MERGE`.
///
/// Only the fields a [`TestRunPatch`] sets are serialized, so a guarded
/// update never rewrites columns it did not change (heartbeats in particular).
#[derive(Debug, Default, Serialize)]
pub struct TestRunMerge {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub awaiting_review: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_iteration: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub success_count: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure_count: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout_count: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub overall_score: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stopped_reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", with = "surreal_datetime_opt")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none", with = "surreal_datetime_opt")]
    pub review_completed_at: Option<DateTime<Utc>>,
}

impl From<TestRunPatch> for TestRunMerge {
    fn from(patch: TestRunPatch) -> Self {
        Self {
            status: patch.status.map(|s| s.as_str()),
            awaiting_review: patch.awaiting_review,
            current_iteration: patch.current_iteration,
            success_count: patch.success_count,
            failure_count: patch.failure_count,
            timeout_count: patch.timeout_count,
            overall_score: patch.overall_score,
            stopped_reason: patch.stopped_reason,
            completed_at: patch.completed_at,
            review_completed_at: patch.review_completed_at,
        }
    }
}

// ---------------------------------------------------------------------------
// evaluations
// ---------------------------------------------------------------------------

/// Row in the `evaluations` table
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvaluationRow {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<surrealdb::sql::Thing>,
    pub evaluation_id: String,
    pub test_run_id: String,
    pub evaluator_config_id: Option<String>,
    pub status: String,
    pub overall_score: Option<f64>,
    pub is_promoted: bool,
    pub error_message: Option<String>,
    #[serde(with = "surreal_datetime")]
    pub created_at: DateTime<Utc>,
    #[serde(default, with = "surreal_datetime_opt")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl EvaluationRow {
    pub fn from_record(evaluation: &Evaluation) -> Self {
        Self {
            id: None,
            evaluation_id: evaluation.id.to_string(),
            test_run_id: evaluation.test_run_id.to_string(),
            evaluator_config_id: evaluation.evaluator_config_id.clone(),
            status: evaluation.status.as_str().to_string(),
            overall_score: evaluation.overall_score,
            is_promoted: evaluation.is_promoted,
            error_message: evaluation.error_message.clone(),
            created_at: evaluation.created_at,
            completed_at: evaluation.completed_at,
        }
    }

    pub fn into_record(self) -> StorageResult<Evaluation> {
        Ok(Evaluation {
            id: parse_uuid("evaluations.evaluation_id", &self.evaluation_id)?,
            test_run_id: parse_uuid("evaluations.test_run_id", &self.test_run_id)?,
            evaluator_config_id: self.evaluator_config_id,
            status: parse_enum("evaluations.status", &self.status)?,
            overall_score: self.overall_score,
            is_promoted: self.is_promoted,
            error_message: self.error_message,
            created_at: self.created_at,
            completed_at: self.completed_at,
        })
    }
}

/// Partial `evaluations` document for `UPDATE ... MERGE`.
#[derive(Debug, Default, Serialize)]
pub struct EvaluationMerge {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub overall_score: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", with = "surreal_datetime_opt")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl From<EvaluationPatch> for EvaluationMerge {
    fn from(patch: EvaluationPatch) -> Self {
        Self {
            status: patch.status.map(|s| s.as_str()),
            overall_score: patch.overall_score,
            error_message: patch.error_message,
            completed_at: patch.completed_at,
        }
    }
}

// ---------------------------------------------------------------------------
// personas
// ---------------------------------------------------------------------------

/// Row in the `personas` table
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersonaRow {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<surrealdb::sql::Thing>,
    pub persona_id: String,
    pub name: String,
    pub profile: serde_json::Value,
    pub validation_status: String,
    pub validation_note: Option<String>,
    #[serde(default, with = "surreal_datetime_opt")]
    pub validated_at: Option<DateTime<Utc>>,
    #[serde(with = "surreal_datetime")]
    pub created_at: DateTime<Utc>,
}

impl PersonaRow {
    pub fn from_record(persona: &Persona) -> Self {
        Self {
            id: None,
            persona_id: persona.id.to_string(),
            name: persona.name.clone(),
            profile: persona.profile.clone(),
            validation_status: persona.validation_status.as_str().to_string(),
            validation_note: persona.validation_note.clone(),
            validated_at: persona.validated_at,
            created_at: persona.created_at,
        }
    }

    pub fn into_record(self) -> StorageResult<Persona> {
        Ok(Persona {
            id: parse_uuid("personas.persona_id", &self.persona_id)?,
            name: self.name,
            profile: self.profile,
            validation_status: parse_enum("personas.validation_status", &self.validation_status)?,
            validation_note: self.validation_note,
            validated_at: self.validated_at,
            created_at: self.created_at,
        })
    }
}
