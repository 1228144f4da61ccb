//! SurrealDB-backed store implementation
//!
//! Uses `schema::*Row` types for persistence, converting to/from
//! `storage_traits` records at the boundary. Guarded updates are single
//! `UPDATE ... MERGE $patch WHERE <id> AND <status> = $expected` statements:
//! the precondition is checked and the write applied atomically by the
//! database, and only the patched fields are written. Writes that lose an
//! optimistic race inside SurrealDB surface as [`StorageError::Conflict`].

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use surrealdb::engine::any::Any;
use surrealdb::sql::Datetime as SurrealDatetime;
use surrealdb::Surreal;
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::StorageError;
use crate::handle::{self, CloudConfig};
use crate::schema::{EvaluationMerge, EvaluationRow, PersonaRow, TestRunMerge, TestRunRow};
use crate::storage_traits::*;

/// SurrealDB-backed implementation of [`TestRunStore`], [`EvaluationStore`]
/// and [`PersonaStore`].
#[derive(Clone)]
pub struct SurrealArenaStore {
    db: Surreal<Any>,
}

fn backend(e: surrealdb::Error) -> StorageError {
    StorageError::Backend(e.to_string())
}

/// SurrealDB reports a rolled-back optimistic transaction with this wording,
/// both directly and wrapped in "query was not executed" for the statements
/// of a failed explicit transaction.
fn is_retryable_conflict(message: &str) -> bool {
    message.contains("read or write conflict") || message.contains("can be retried")
}

/// Error mapper for writes to one record.
fn write_failed(entity: &'static str, id: Uuid) -> impl Fn(surrealdb::Error) -> StorageError {
    move |e| {
        let message = e.to_string();
        if is_retryable_conflict(&message) {
            debug!(entity, id = %id, "write lost a transaction conflict");
            StorageError::Conflict { entity, id }
        } else {
            StorageError::Backend(message)
        }
    }
}

impl SurrealArenaStore {
    /// Create an in-memory instance for testing.
    pub async fn in_memory() -> crate::Result<Self> {
        let db = handle::connect_in_memory().await?;
        info!("SurrealArenaStore connected (in-memory)");
        Ok(Self { db })
    }

    /// Connect to an explicit endpoint, e.g. `surrealkv://.arena/db`.
    pub async fn connect(url: &str) -> crate::Result<Self> {
        let db = handle::connect_url(url).await?;
        info!(url = %url, "SurrealArenaStore connected");
        Ok(Self { db })
    }

    /// Connect to SurrealDB Cloud.
    pub async fn cloud(config: &CloudConfig) -> crate::Result<Self> {
        let db = handle::connect_cloud(config).await?;
        info!("SurrealArenaStore connected (cloud)");
        Ok(Self { db })
    }

    /// Create from environment variables (cloud, `SURREALDB_URL`, local).
    pub async fn from_env() -> crate::Result<Self> {
        let db = handle::connect_from_env().await?;
        Ok(Self { db })
    }

    // -- private helpers -----------------------------------------------------

    async fn fetch_run_row(&self, id: Uuid) -> StorageResult<Option<TestRunRow>> {
        let mut res = self
            .db
            .query("SELECT * FROM test_runs WHERE run_id = $rid")
            .bind(("rid", id.to_string()))
            .await
            .map_err(backend)?;
        let rows: Vec<TestRunRow> = res.take(0).map_err(backend)?;
        Ok(rows.into_iter().next())
    }

    async fn fetch_evaluation_row(&self, id: Uuid) -> StorageResult<Option<EvaluationRow>> {
        let mut res = self
            .db
            .query("SELECT * FROM evaluations WHERE evaluation_id = $eid")
            .bind(("eid", id.to_string()))
            .await
            .map_err(backend)?;
        let rows: Vec<EvaluationRow> = res.take(0).map_err(backend)?;
        Ok(rows.into_iter().next())
    }

    async fn fetch_persona_row(&self, id: Uuid) -> StorageResult<Option<PersonaRow>> {
        let mut res = self
            .db
            .query("SELECT * FROM personas WHERE persona_id = $pid")
            .bind(("pid", id.to_string()))
            .await
            .map_err(backend)?;
        let rows: Vec<PersonaRow> = res.take(0).map_err(backend)?;
        Ok(rows.into_iter().next())
    }
}

#[async_trait]
impl TestRunStore for SurrealArenaStore {
    async fn insert(&self, run: TestRun) -> StorageResult<TestRun> {
        if self.fetch_run_row(run.id).await?.is_some() {
            return Err(StorageError::Duplicate {
                table: "test_runs",
                id: run.id.to_string(),
            });
        }

        debug!(run_id = %run.id, code = %run.code, "creating test run");
        let _created: Option<TestRunRow> = self
            .db
            .create("test_runs")
            .content(TestRunRow::from_record(&run))
            .await
            .map_err(backend)?;
        Ok(run)
    }

    async fn get(&self, id: Uuid) -> StorageResult<Option<TestRun>> {
        self.fetch_run_row(id)
            .await?
            .map(TestRunRow::into_record)
            .transpose()
    }

    async fn conditional_update(
        &self,
        id: Uuid,
        expected: TestRunStatus,
        patch: TestRunPatch,
    ) -> StorageResult<Option<TestRun>> {
        let failed = write_failed("test run", id);
        let mut res = self
            .db
            .query(
                "UPDATE test_runs MERGE $patch \
                 WHERE run_id = $rid AND status = $expected RETURN AFTER",
            )
            .bind(("patch", TestRunMerge::from(patch)))
            .bind(("rid", id.to_string()))
            .bind(("expected", expected.as_str().to_string()))
            .await
            .map_err(&failed)?;
        let rows: Vec<TestRunRow> = res.take(0).map_err(&failed)?;

        rows.into_iter().next().map(TestRunRow::into_record).transpose()
    }

    async fn find(&self, filter: &TestRunFilter) -> StorageResult<Vec<TestRun>> {
        let mut conditions = Vec::new();
        if !filter.statuses.is_empty() {
            conditions.push("status IN $statuses");
        }
        if filter.heartbeat_before.is_some() {
            conditions.push("(last_heartbeat_at ?? started_at) < $before");
        }

        let mut sql = String::from("SELECT * FROM test_runs");
        if !conditions.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&conditions.join(" AND "));
        }
        sql.push_str(" ORDER BY started_at DESC");

        let statuses: Vec<String> = filter
            .statuses
            .iter()
            .map(|s| s.as_str().to_string())
            .collect();
        let before = filter.heartbeat_before.map(SurrealDatetime::from);

        let mut res = self
            .db
            .query(sql)
            .bind(("statuses", statuses))
            .bind(("before", before))
            .await
            .map_err(backend)?;
        let rows: Vec<TestRunRow> = res.take(0).map_err(backend)?;

        rows.into_iter().map(TestRunRow::into_record).collect()
    }

    async fn touch_heartbeat(&self, id: Uuid, at: DateTime<Utc>) -> StorageResult<Option<TestRun>> {
        let failed = write_failed("test run", id);
        let mut res = self
            .db
            .query("UPDATE test_runs SET last_heartbeat_at = $at WHERE run_id = $rid RETURN AFTER")
            .bind(("at", SurrealDatetime::from(at)))
            .bind(("rid", id.to_string()))
            .await
            .map_err(&failed)?;
        let rows: Vec<TestRunRow> = res.take(0).map_err(&failed)?;

        rows.into_iter().next().map(TestRunRow::into_record).transpose()
    }
}

#[async_trait]
impl EvaluationStore for SurrealArenaStore {
    async fn insert(&self, evaluation: Evaluation) -> StorageResult<Evaluation> {
        if self.fetch_evaluation_row(evaluation.id).await?.is_some() {
            return Err(StorageError::Duplicate {
                table: "evaluations",
                id: evaluation.id.to_string(),
            });
        }

        debug!(evaluation_id = %evaluation.id, run_id = %evaluation.test_run_id, "creating evaluation");
        let _created: Option<EvaluationRow> = self
            .db
            .create("evaluations")
            .content(EvaluationRow::from_record(&evaluation))
            .await
            .map_err(backend)?;
        Ok(evaluation)
    }

    async fn get(&self, id: Uuid) -> StorageResult<Option<Evaluation>> {
        self.fetch_evaluation_row(id)
            .await?
            .map(EvaluationRow::into_record)
            .transpose()
    }

    async fn list_for_run(&self, test_run_id: Uuid) -> StorageResult<Vec<Evaluation>> {
        let mut res = self
            .db
            .query("SELECT * FROM evaluations WHERE test_run_id = $rid ORDER BY created_at DESC")
            .bind(("rid", test_run_id.to_string()))
            .await
            .map_err(backend)?;
        let rows: Vec<EvaluationRow> = res.take(0).map_err(backend)?;

        rows.into_iter().map(EvaluationRow::into_record).collect()
    }

    async fn conditional_update(
        &self,
        id: Uuid,
        expected: EvaluationStatus,
        patch: EvaluationPatch,
    ) -> StorageResult<Option<Evaluation>> {
        let failed = write_failed("evaluation", id);
        let mut res = self
            .db
            .query(
                "UPDATE evaluations MERGE $patch \
                 WHERE evaluation_id = $eid AND status = $expected RETURN AFTER",
            )
            .bind(("patch", EvaluationMerge::from(patch)))
            .bind(("eid", id.to_string()))
            .bind(("expected", expected.as_str().to_string()))
            .await
            .map_err(&failed)?;
        let rows: Vec<EvaluationRow> = res.take(0).map_err(&failed)?;

        rows.into_iter().next().map(EvaluationRow::into_record).transpose()
    }

    async fn set_promoted(
        &self,
        test_run_id: Uuid,
        evaluation_id: Uuid,
    ) -> StorageResult<Option<Evaluation>> {
        match self.fetch_evaluation_row(evaluation_id).await? {
            Some(row) if row.test_run_id == test_run_id.to_string() => {}
            _ => return Ok(None),
        }

        // Every evaluation of the run is written in one transaction, so two
        // concurrent promotions conflict and one of them is rolled back.
        let failed = write_failed("evaluation", evaluation_id);
        let mut res = self
            .db
            .query(
                "BEGIN TRANSACTION; \
                 UPDATE evaluations SET is_promoted = false \
                 WHERE test_run_id = $rid AND evaluation_id != $eid RETURN NONE; \
                 UPDATE evaluations SET is_promoted = true \
                 WHERE test_run_id = $rid AND evaluation_id = $eid RETURN AFTER; \
                 COMMIT TRANSACTION;",
            )
            .bind(("rid", test_run_id.to_string()))
            .bind(("eid", evaluation_id.to_string()))
            .await
            .map_err(&failed)?;
        let _demoted: Vec<EvaluationRow> = res.take(0).map_err(&failed)?;
        let rows: Vec<EvaluationRow> = res.take(1).map_err(&failed)?;

        rows.into_iter().next().map(EvaluationRow::into_record).transpose()
    }
}

#[async_trait]
impl PersonaStore for SurrealArenaStore {
    async fn insert(&self, persona: Persona) -> StorageResult<Persona> {
        if self.fetch_persona_row(persona.id).await?.is_some() {
            return Err(StorageError::Duplicate {
                table: "personas",
                id: persona.id.to_string(),
            });
        }

        let _created: Option<PersonaRow> = self
            .db
            .create("personas")
            .content(PersonaRow::from_record(&persona))
            .await
            .map_err(backend)?;
        Ok(persona)
    }

    async fn get(&self, id: Uuid) -> StorageResult<Option<Persona>> {
        self.fetch_persona_row(id)
            .await?
            .map(PersonaRow::into_record)
            .transpose()
    }

    async fn conditional_set_validation(
        &self,
        id: Uuid,
        expected: PersonaValidationStatus,
        update: PersonaValidationUpdate,
    ) -> StorageResult<Option<Persona>> {
        let failed = write_failed("persona", id);
        let mut res = self
            .db
            .query(
                "UPDATE personas SET validation_status = $new, validation_note = $note, \
                 validated_at = $at \
                 WHERE persona_id = $pid AND validation_status = $expected RETURN AFTER",
            )
            .bind(("new", update.status.as_str().to_string()))
            .bind(("note", update.note))
            .bind(("at", SurrealDatetime::from(update.validated_at)))
            .bind(("pid", id.to_string()))
            .bind(("expected", expected.as_str().to_string()))
            .await
            .map_err(&failed)?;
        let rows: Vec<PersonaRow> = res.take(0).map_err(&failed)?;

        rows.into_iter().next().map(PersonaRow::into_record).transpose()
    }
}
