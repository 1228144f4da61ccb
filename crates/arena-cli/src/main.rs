//! Battle Arena operator CLI
//!
//! The `arena` command drives the test-run lifecycle directly against the
//! configured store, for operators and for scripting.
//!
//! ## Commands
//!
//! - `create`: Start a test run for a prompt version
//! - `status`: Show a run and its evaluations
//! - `abort`: Stop an active run (kill switch)
//! - `continue`: Resume a run paused for human review
//! - `reconcile`: Repair a run stuck behind a lost callback
//! - `sweep`: Reconcile every stale run
//! - `promote`: Mark an evaluation as the authoritative result
//! - `persona`: Register and validate personas

use anyhow::{Context, Result};
use arena_core::{
    Arena, ExecutionMode, NewTestRun, Stores, TestRun, ValidationDecision, WebhookConfig,
    WebhookNotifier,
};
use arena_state::SurrealArenaStore;
use clap::{Parser, Subcommand};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, Level};
use uuid::Uuid;

#[derive(Parser)]
#[command(name = "arena")]
#[command(author = "Stevedores Org")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Battle Arena test-run lifecycle control", long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit JSON-formatted log lines
    #[arg(long, global = true)]
    json: bool,

    /// Print command results as JSON instead of text
    #[arg(long, global = true)]
    output_json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create a test run and ask the executor to start it
    Create {
        /// Prompt version under test
        #[arg(short, long)]
        prompt_version: String,

        /// Execution mode: single or full_cycle_with_review
        #[arg(short, long, default_value = "single")]
        mode: ExecutionMode,

        /// Maximum number of iterations
        #[arg(long, default_value = "1")]
        max_iterations: u32,
    },

    /// Show a test run and its evaluations
    Status {
        /// Test run id
        id: Uuid,
    },

    /// Abort an active test run
    Abort {
        /// Test run id
        id: Uuid,
    },

    /// Continue a test run after human review
    Continue {
        /// Test run id
        id: Uuid,
    },

    /// Reconcile a test run against its evaluations
    Reconcile {
        /// Test run id
        id: Uuid,
    },

    /// Reconcile every run whose heartbeat is older than the cutoff
    Sweep {
        /// Heartbeat age in seconds after which a run counts as stuck
        #[arg(long, default_value = "900")]
        stale_after_secs: u64,
    },

    /// Promote a completed evaluation
    Promote {
        /// Evaluation id
        evaluation: Uuid,
    },

    /// Manage personas
    Persona {
        #[command(subcommand)]
        action: PersonaAction,
    },
}

#[derive(Subcommand)]
enum PersonaAction {
    /// Register a persona awaiting validation
    Register {
        /// Persona name
        name: String,

        /// Path to the persona profile (JSON)
        #[arg(short, long)]
        profile: Option<PathBuf>,
    },

    /// Record a validation decision: approve, reject or override
    Validate {
        /// Persona id
        id: Uuid,

        decision: ValidationDecision,

        /// Reviewer note
        #[arg(short, long)]
        note: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    // Setup logging
    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::WARN
    };
    arena_core::init_tracing(cli.json, level);

    let store = SurrealArenaStore::from_env()
        .await
        .context("Failed to connect to arena database")?;
    let webhooks = WebhookConfig::from_env().context("Invalid webhook configuration")?;
    let notifier = WebhookNotifier::new(webhooks).context("Failed to build webhook client")?;
    let arena = Arena::new(Stores::surreal(store), Arc::new(notifier));
    let out = Output {
        json: cli.output_json,
    };

    match cli.command {
        Commands::Create {
            prompt_version,
            mode,
            max_iterations,
        } => cmd_create(&arena, out, &prompt_version, mode, max_iterations).await,
        Commands::Status { id } => cmd_status(&arena, out, id).await,
        Commands::Abort { id } => cmd_abort(&arena, out, id).await,
        Commands::Continue { id } => cmd_continue(&arena, out, id).await,
        Commands::Reconcile { id } => cmd_reconcile(&arena, out, id).await,
        Commands::Sweep { stale_after_secs } => {
            cmd_sweep(&arena, out, Duration::from_secs(stale_after_secs)).await
        }
        Commands::Promote { evaluation } => cmd_promote(&arena, out, evaluation).await,
        Commands::Persona { action } => match action {
            PersonaAction::Register { name, profile } => {
                cmd_persona_register(&arena, out, &name, profile.as_deref()).await
            }
            PersonaAction::Validate { id, decision, note } => {
                cmd_persona_validate(&arena, out, id, decision, note).await
            }
        },
    }
}

/// Where command results go.
#[derive(Clone, Copy)]
struct Output {
    json: bool,
}

impl Output {
    /// Print `value` as pretty JSON in JSON mode, else the text lines.
    fn emit<T: Serialize>(self, value: &T, text: impl FnOnce() -> Vec<String>) -> Result<()> {
        if self.json {
            println!("{}", serde_json::to_string_pretty(value)?);
        } else {
            for line in text() {
                println!("{line}");
            }
        }
        Ok(())
    }
}

fn run_summary(run: &TestRun) -> Vec<String> {
    let mut lines = vec![
        format!("{} ({})", run.code, run.id),
        format!("Status:     {}", run.status),
        format!("Prompt:     {}", run.prompt_version_id),
        format!("Mode:       {}", run.mode),
        format!("Iteration:  {}/{}", run.current_iteration, run.max_iterations),
        format!(
            "Battles:    {} ok, {} failed, {} timed out",
            run.success_count, run.failure_count, run.timeout_count
        ),
    ];
    if let Some(score) = run.overall_score {
        lines.push(format!("Score:      {score:.2}"));
    }
    if let Some(reason) = &run.stopped_reason {
        lines.push(format!("Stopped:    {reason}"));
    }
    lines
}

fn with_warning(mut lines: Vec<String>, warning: Option<&str>) -> Vec<String> {
    if let Some(warning) = warning {
        lines.push(format!("Warning: {warning}"));
    }
    lines
}

async fn cmd_create(
    arena: &Arena,
    out: Output,
    prompt_version: &str,
    mode: ExecutionMode,
    max_iterations: u32,
) -> Result<()> {
    let created = arena
        .trigger
        .create(NewTestRun {
            prompt_version_id: prompt_version.to_string(),
            mode,
            max_iterations,
        })
        .await
        .context("Failed to create test run")?;

    out.emit(&created, || {
        with_warning(
            vec![format!("Created {} ({})", created.test_run.code, created.test_run.id)],
            created.warning.as_deref(),
        )
    })
}

async fn cmd_status(arena: &Arena, out: Output, id: Uuid) -> Result<()> {
    let run = arena.state_machine.get(id).await?;
    let evaluations = arena.evaluations.list_for_run(id).await?;
    debug!(evaluations = evaluations.len(), "loaded evaluations");

    let view = serde_json::json!({ "test_run": &run, "evaluations": &evaluations });
    out.emit(&view, || {
        let mut lines = run_summary(&run);
        if !evaluations.is_empty() {
            lines.push(String::new());
            lines.push("Evaluations (newest first):".to_string());
            for evaluation in &evaluations {
                let score = evaluation
                    .overall_score
                    .map(|s| format!("{s:.2}"))
                    .unwrap_or_else(|| "-".to_string());
                let marker = if evaluation.is_promoted { " *" } else { "" };
                lines.push(format!(
                    "  {} {:<10} {}{}",
                    evaluation.id, evaluation.status.as_str(), score, marker
                ));
            }
        }
        lines
    })
}

async fn cmd_abort(arena: &Arena, out: Output, id: Uuid) -> Result<()> {
    let outcome = arena.aborts.abort(id).await?;
    out.emit(&outcome, || {
        with_warning(
            vec![format!(
                "Aborted {} (was {})",
                outcome.run.code, outcome.previous_status
            )],
            outcome.warning.as_deref(),
        )
    })
}

async fn cmd_continue(arena: &Arena, out: Output, id: Uuid) -> Result<()> {
    let outcome = arena.review.continue_after_review(id).await?;
    out.emit(&outcome, || {
        with_warning(
            vec![format!(
                "Resumed {}: iteration {}/{}",
                outcome.run.code, outcome.next_iteration, outcome.max_iterations
            )],
            outcome.warning.as_deref(),
        )
    })
}

async fn cmd_reconcile(arena: &Arena, out: Output, id: Uuid) -> Result<()> {
    let outcome = arena.reconciler.reconcile(id).await?;
    out.emit(&outcome, || match (outcome.previous_status, outcome.new_status) {
        (Some(from), Some(to)) if outcome.reconciled => {
            vec![format!("Reconciled: {from} -> {to}")]
        }
        _ => vec![format!(
            "Nothing to reconcile: {}",
            outcome.reason.as_deref().unwrap_or("run is consistent")
        )],
    })
}

async fn cmd_sweep(arena: &Arena, out: Output, stale_after: Duration) -> Result<()> {
    let report = arena.reconciler.sweep(stale_after).await?;
    out.emit(&report, || {
        let mut lines = vec![format!(
            "Examined {} stale runs: {} repaired, {} unchanged, {} failed",
            report.examined,
            report.repaired.len(),
            report.unchanged,
            report.failures.len()
        )];
        for repair in &report.repaired {
            if let Some(to) = repair.outcome.new_status {
                lines.push(format!("  {} -> {}", repair.code, to));
            }
        }
        for failure in &report.failures {
            lines.push(format!(
                "  {} failed: {} ({})",
                failure.code, failure.message, failure.error_code
            ));
        }
        lines
    })
}

async fn cmd_promote(arena: &Arena, out: Output, evaluation: Uuid) -> Result<()> {
    let promoted = arena.promotion.promote(evaluation).await?;
    out.emit(&promoted, || {
        vec![format!(
            "Promoted evaluation {} for run {}",
            promoted.id, promoted.test_run_id
        )]
    })
}

fn read_profile(path: Option<&Path>) -> Result<serde_json::Value> {
    match path {
        Some(path) => {
            let raw = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read {}", path.display()))?;
            serde_json::from_str(&raw)
                .with_context(|| format!("{} is not valid JSON", path.display()))
        }
        None => Ok(serde_json::json!({})),
    }
}

async fn cmd_persona_register(
    arena: &Arena,
    out: Output,
    name: &str,
    profile: Option<&Path>,
) -> Result<()> {
    let profile = read_profile(profile)?;
    let persona = arena.personas.register(name, profile).await?;
    out.emit(&persona, || {
        vec![format!(
            "Registered persona {} ({}): {}",
            persona.name, persona.id, persona.validation_status
        )]
    })
}

async fn cmd_persona_validate(
    arena: &Arena,
    out: Output,
    id: Uuid,
    decision: ValidationDecision,
    note: Option<String>,
) -> Result<()> {
    let persona = arena.personas.validate(id, decision, note).await?;
    out.emit(&persona, || {
        vec![format!("Persona {} is now {}", persona.name, persona.validation_status)]
    })
}
