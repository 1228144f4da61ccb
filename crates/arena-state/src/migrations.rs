//! SurrealDB schema migrations and initialization
//!
//! Tables are schemaless; the indexes carry the uniqueness guarantees and
//! back the status-guarded updates and newest-first listings.

use crate::error::StateError;
use crate::Result;
use surrealdb::engine::any::Any;
use surrealdb::Surreal;
use tracing::{debug, info};

/// Initialize all arena tables in SurrealDB.
///
/// Safe to call multiple times (idempotent).
pub async fn init_schema(db: &Surreal<Any>) -> Result<()> {
    info!("Initializing arena SurrealDB schema");

    init_test_runs_table(db).await?;
    init_evaluations_table(db).await?;
    init_personas_table(db).await?;

    info!("Arena schema initialization complete");
    Ok(())
}

/// Initialize `test_runs` table
///
/// Schema:
/// ```text
/// TABLE test_runs {
///   run_id:              STRING (unique)
///   code:                STRING
///   prompt_version_id:   STRING (indexed)
///   mode:                STRING (single | full_cycle_with_review)
///   max_iterations:      INT
///   current_iteration:   INT
///   status:              STRING (indexed)
///   awaiting_review:     BOOL
///   success_count, failure_count, timeout_count: INT
///   overall_score:       FLOAT?
///   stopped_reason:      STRING?
///   started_at:          DATETIME
///   completed_at, review_completed_at, last_heartbeat_at: DATETIME?
/// }
/// ```
async fn init_test_runs_table(db: &Surreal<Any>) -> Result<()> {
    debug!("Initializing test_runs table");

    let sql = r#"
        DEFINE TABLE IF NOT EXISTS test_runs SCHEMALESS;
        DEFINE INDEX IF NOT EXISTS idx_test_run_id ON TABLE test_runs COLUMNS run_id UNIQUE;
        DEFINE INDEX IF NOT EXISTS idx_test_run_status ON TABLE test_runs COLUMNS status;
        DEFINE INDEX IF NOT EXISTS idx_test_run_prompt ON TABLE test_runs COLUMNS prompt_version_id;
        DEFINE INDEX IF NOT EXISTS idx_test_run_started ON TABLE test_runs COLUMNS started_at;
    "#;

    db.query(sql)
        .await
        .map_err(|e| StateError::SchemaSetup(e.to_string()))?;
    debug!("test_runs table initialized");
    Ok(())
}

/// Initialize `evaluations` table
///
/// `(test_run_id, created_at)` backs the newest-first listing used by
/// reconciliation.
async fn init_evaluations_table(db: &Surreal<Any>) -> Result<()> {
    debug!("Initializing evaluations table");

    let sql = r#"
        DEFINE TABLE IF NOT EXISTS evaluations SCHEMALESS;
        DEFINE INDEX IF NOT EXISTS idx_evaluation_id ON TABLE evaluations COLUMNS evaluation_id UNIQUE;
        DEFINE INDEX IF NOT EXISTS idx_evaluation_run ON TABLE evaluations COLUMNS test_run_id, created_at;
    "#;

    db.query(sql)
        .await
        .map_err(|e| StateError::SchemaSetup(e.to_string()))?;
    debug!("evaluations table initialized");
    Ok(())
}

/// Initialize `personas` table
async fn init_personas_table(db: &Surreal<Any>) -> Result<()> {
    debug!("Initializing personas table");

    let sql = r#"
        DEFINE TABLE IF NOT EXISTS personas SCHEMALESS;
        DEFINE INDEX IF NOT EXISTS idx_persona_id ON TABLE personas COLUMNS persona_id UNIQUE;
        DEFINE INDEX IF NOT EXISTS idx_persona_validation ON TABLE personas COLUMNS validation_status;
    "#;

    db.query(sql)
        .await
        .map_err(|e| StateError::SchemaSetup(e.to_string()))?;
    debug!("personas table initialized");
    Ok(())
}
