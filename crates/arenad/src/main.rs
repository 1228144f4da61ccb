use std::sync::Arc;

use anyhow::{Context, Result};
use arena_core::{init_tracing, Arena, Stores, WebhookNotifier};
use arena_state::SurrealArenaStore;
use arenad::sweep::reconcile_loop;
use arenad::{app, AppState, Config};
use tokio::net::TcpListener;
use tracing::{info, warn, Level};

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    let config = Config::from_env().context("failed to load configuration from environment")?;
    init_tracing(config.log_json, Level::INFO);

    info!(version = arena_core::VERSION, "starting arenad");

    let store = SurrealArenaStore::from_env()
        .await
        .context("failed to open arena store")?;
    let notifier =
        WebhookNotifier::new(config.webhook.clone()).context("failed to build webhook client")?;
    if config.webhook.battle_url.is_none() {
        warn!("BATTLE_WEBHOOK_URL not set, start and abort notifications will only warn");
    }
    if config.webhook.analyzer_url.is_none() {
        warn!("ANALYZER_WEBHOOK_URL not set, continue and evaluate notifications will only warn");
    }

    let arena = Arena::new(Stores::surreal(store), Arc::new(notifier));
    let state = Arc::new(AppState::new(arena, &config));

    match config.reconcile_interval {
        Some(every) => {
            tokio::spawn(reconcile_loop(state.clone(), every));
        }
        None => info!("reconciliation sweep disabled"),
    }

    let listener = TcpListener::bind(("0.0.0.0", config.port))
        .await
        .with_context(|| format!("failed to bind port {}", config.port))?;
    info!("arenad listening on port {}", config.port);

    axum::serve(listener, app(state)).await?;

    Ok(())
}
