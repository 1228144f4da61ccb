//! Outbound workflow notifications.
//!
//! The external executor and analyzer are driven by webhook calls carrying
//! `{test_run_id, action, timestamp, ...extras}`. Lifecycle operations treat
//! these calls as best-effort: the state change is committed first, and a
//! failed delivery is reported as a warning, never rolled back.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::debug;
use uuid::Uuid;

use crate::error::{ArenaError, Result};
use crate::metrics::METRICS;
use crate::obs;

/// Header carrying the shared webhook secret, in both directions.
pub const WEBHOOK_SECRET_HEADER: &str = "x-webhook-secret";

const DEFAULT_TIMEOUT_SECS: u64 = 10;

/// What the receiving workflow is asked to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowAction {
    /// Begin executing a newly created run.
    Start,
    /// Stop at the next checkpoint.
    Abort,
    /// Resume after human review with the next iteration.
    Continue,
    /// Score the run's battles.
    Evaluate,
}

impl WorkflowAction {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::Abort => "abort",
            Self::Continue => "continue",
            Self::Evaluate => "evaluate",
        }
    }
}

impl fmt::Display for WorkflowAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outbound webhook payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    pub test_run_id: Uuid,
    pub action: WorkflowAction,
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub extras: Map<String, Value>,
}

impl Notification {
    pub fn new(test_run_id: Uuid, action: WorkflowAction) -> Self {
        Self {
            test_run_id,
            action,
            timestamp: Utc::now(),
            extras: Map::new(),
        }
    }

    /// Attach an extra top-level field.
    pub fn with(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.extras.insert(key.to_string(), value.into());
        self
    }
}

/// Delivers workflow notifications.
#[async_trait]
pub trait WorkflowNotifier: Send + Sync {
    /// Deliver one notification. Failures are `UpstreamUnavailable`.
    async fn notify(&self, notification: &Notification) -> Result<()>;
}

/// Deliver `notification`, turning any failure into a warning message.
pub async fn notify_best_effort(
    notifier: &dyn WorkflowNotifier,
    notification: &Notification,
) -> Option<String> {
    match notifier.notify(notification).await {
        Ok(()) => None,
        Err(e) => {
            METRICS.inc_notify_failures();
            obs::emit_notification_failed(
                &notification.test_run_id.to_string(),
                notification.action.as_str(),
                &e,
            );
            Some(format!("{} notification not delivered: {}", notification.action, e))
        }
    }
}

/// Webhook endpoints and credentials.
#[derive(Debug, Clone, PartialEq)]
pub struct WebhookConfig {
    /// Executor webhook for `start` and `abort`.
    pub battle_url: Option<String>,
    /// Analyzer webhook for `continue` and `evaluate`.
    pub analyzer_url: Option<String>,
    /// Sent as [`WEBHOOK_SECRET_HEADER`] when set.
    pub secret: Option<String>,
    pub timeout: Duration,
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self {
            battle_url: None,
            analyzer_url: None,
            secret: None,
            timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
        }
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|s| !s.trim().is_empty())
}

impl WebhookConfig {
    /// Read from environment variables
    ///
    /// - BATTLE_WEBHOOK_URL (optional)
    /// - ANALYZER_WEBHOOK_URL (optional)
    /// - WEBHOOK_SECRET (optional)
    /// - WEBHOOK_TIMEOUT_SECS (optional, default: 10)
    pub fn from_env() -> Result<Self> {
        let timeout_secs = match std::env::var("WEBHOOK_TIMEOUT_SECS") {
            Ok(raw) => raw.parse::<u64>().map_err(|_| {
                ArenaError::Validation(format!("WEBHOOK_TIMEOUT_SECS must be a number, got {raw}"))
            })?,
            Err(_) => DEFAULT_TIMEOUT_SECS,
        };

        Ok(Self {
            battle_url: non_empty(std::env::var("BATTLE_WEBHOOK_URL").ok()),
            analyzer_url: non_empty(std::env::var("ANALYZER_WEBHOOK_URL").ok()),
            secret: non_empty(std::env::var("WEBHOOK_SECRET").ok()),
            timeout: Duration::from_secs(timeout_secs),
        })
    }

    fn url_for(&self, action: WorkflowAction) -> Option<&str> {
        match action {
            WorkflowAction::Start | WorkflowAction::Abort => self.battle_url.as_deref(),
            WorkflowAction::Continue | WorkflowAction::Evaluate => self.analyzer_url.as_deref(),
        }
    }
}

/// Posts notifications to the configured webhooks with `reqwest`.
pub struct WebhookNotifier {
    config: WebhookConfig,
    http_client: reqwest::Client,
}

impl WebhookNotifier {
    pub fn new(config: WebhookConfig) -> Result<Self> {
        let http_client = reqwest::Client::builder()
            .user_agent(concat!("arena-core/", env!("CARGO_PKG_VERSION")))
            .timeout(config.timeout)
            .build()
            .map_err(|e| ArenaError::UpstreamUnavailable(format!("http client setup: {e}")))?;

        Ok(Self {
            config,
            http_client,
        })
    }

    pub fn config(&self) -> &WebhookConfig {
        &self.config
    }
}

#[async_trait]
impl WorkflowNotifier for WebhookNotifier {
    async fn notify(&self, notification: &Notification) -> Result<()> {
        let Some(url) = self.config.url_for(notification.action) else {
            return Err(ArenaError::UpstreamUnavailable(format!(
                "no webhook configured for {}",
                notification.action
            )));
        };

        debug!(url = %url, action = %notification.action, run_id = %notification.test_run_id, "posting workflow webhook");
        let mut request = self.http_client.post(url).json(notification);
        if let Some(secret) = &self.config.secret {
            request = request.header(WEBHOOK_SECRET_HEADER, secret.as_str());
        }

        let response = request
            .send()
            .await
            .map_err(|e| ArenaError::UpstreamUnavailable(format!("{url}: {e}")))?;
        if !response.status().is_success() {
            return Err(ArenaError::UpstreamUnavailable(format!(
                "{url} answered {}",
                response.status()
            )));
        }
        Ok(())
    }
}
