//! Battle Arena core library
//!
//! Lifecycle logic for test runs of AI agent prompts: the status state
//! machine, the abort kill switch, the human review gate, reconciliation of
//! lost callbacks, evaluation promotion and persona validation. All of it is
//! written against the `arena-state` store traits and a [`WorkflowNotifier`]
//! for the outbound webhooks that drive the external executor.

pub mod abort;
pub mod arena;
pub mod error;
pub mod evaluation;
pub mod metrics;
pub mod notifier;
pub mod obs;
pub mod persona;
pub mod promotion;
pub mod reconciliation;
pub mod review_gate;
pub mod state_machine;
pub mod telemetry;
pub mod trigger;

pub use abort::{AbortController, AbortOutcome, HUMAN_STOP};
pub use arena::{Arena, Stores};
pub use error::{ArenaError, Result};
pub use evaluation::{EvaluationRequested, EvaluationResult, EvaluationService};
pub use notifier::{
    notify_best_effort, Notification, WebhookConfig, WebhookNotifier, WorkflowAction,
    WorkflowNotifier, WEBHOOK_SECRET_HEADER,
};
pub use persona::{PersonaService, ValidationDecision};
pub use promotion::PromotionService;
pub use reconciliation::{
    ReconcileOutcome, ReconciliationService, SweepReport, RECONCILED_EVALUATION_FAILED,
};
pub use review_gate::{ContinueOutcome, ReviewGate};
pub use state_machine::{Actor, ProgressUpdate, TestRunStateMachine};
pub use trigger::{NewTestRun, RunCreated, RunTrigger};

pub use arena_state::{
    Evaluation, EvaluationStatus, ExecutionMode, Persona, PersonaValidationStatus, TestRun,
    TestRunStatus,
};

pub use metrics::METRICS;
pub use telemetry::init_tracing;

/// Battle Arena version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
