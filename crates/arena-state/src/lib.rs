//! Arena-State: persistence for the battle-arena lifecycle service
//!
//! This crate owns the records the test-run lifecycle operates on and the
//! store abstractions the lifecycle logic is written against.
//!
//! ## Key Components
//!
//! - `TestRunStore` / `EvaluationStore` / `PersonaStore`: backend-agnostic
//!   traits exposing `get`, `conditional_update` and `find`-style queries
//! - `fakes`: in-memory implementations for tests and local runs
//! - `SurrealArenaStore`: SurrealDB-backed implementation of all three traits

mod error;
pub mod fakes;
mod handle;
pub mod migrations;
mod schema;
pub mod storage_traits;
pub mod surreal_store;

pub use error::{StateError, StorageError};
pub use handle::CloudConfig;
pub use schema::{EvaluationRow, PersonaRow, TestRunRow};
pub use storage_traits::{
    Evaluation, EvaluationPatch, EvaluationStatus, EvaluationStore, ExecutionMode,
    ParseEnumError, Persona, PersonaStore, PersonaValidationStatus, PersonaValidationUpdate,
    StorageResult, TestRun, TestRunFilter, TestRunPatch, TestRunStatus, TestRunStore,
};
pub use surreal_store::SurrealArenaStore;

/// Result type for connection and schema operations
pub type Result<T> = std::result::Result<T, StateError>;
