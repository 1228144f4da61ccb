//! SurrealDB connection setup
//!
//! Supports cloud (WebSocket) connections, an explicit `SURREALDB_URL`, a
//! local on-disk `surrealkv` database, and in-memory databases for tests.

use std::path::Path;

use surrealdb::engine::any::Any;
use surrealdb::opt::auth::{Database, Root};
use surrealdb::Surreal;
use tracing::{info, instrument};

use crate::error::StateError;
use crate::migrations;
use crate::Result;

const DEFAULT_NAMESPACE: &str = "arena";
const DEFAULT_DATABASE: &str = "main";
const LOCAL_DB_PATH: &str = ".arena/db";

/// Configuration for SurrealDB Cloud connection
#[derive(Debug, Clone)]
pub struct CloudConfig {
    /// WebSocket endpoint URL (e.g., "wss://xxx.aws-use1.surrealdb.cloud")
    pub endpoint: String,
    pub username: String,
    pub password: String,
    /// Namespace (default: "arena")
    pub namespace: String,
    /// Database name (default: "main")
    pub database: String,
    /// Whether this is a root user (true) or database user (false)
    pub is_root: bool,
}

impl CloudConfig {
    pub fn new(
        endpoint: impl Into<String>,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        Self {
            endpoint: endpoint.into(),
            username: username.into(),
            password: password.into(),
            namespace: DEFAULT_NAMESPACE.to_string(),
            database: DEFAULT_DATABASE.to_string(),
            is_root: false,
        }
    }

    pub fn with_namespace(mut self, ns: impl Into<String>) -> Self {
        self.namespace = ns.into();
        self
    }

    pub fn with_database(mut self, db: impl Into<String>) -> Self {
        self.database = db.into();
        self
    }

    pub fn with_root(mut self, is_root: bool) -> Self {
        self.is_root = is_root;
        self
    }

    /// Create from environment variables
    ///
    /// Reads:
    /// - SURREALDB_ENDPOINT (required)
    /// - SURREALDB_USERNAME (required)
    /// - SURREALDB_PASSWORD (required)
    /// - SURREALDB_NAMESPACE (optional, default: "arena")
    /// - SURREALDB_DATABASE (optional, default: "main")
    /// - SURREALDB_ROOT (optional, default: "false")
    pub fn from_env() -> std::result::Result<Self, String> {
        let endpoint =
            std::env::var("SURREALDB_ENDPOINT").map_err(|_| "SURREALDB_ENDPOINT not set")?;
        let username =
            std::env::var("SURREALDB_USERNAME").map_err(|_| "SURREALDB_USERNAME not set")?;
        let password =
            std::env::var("SURREALDB_PASSWORD").map_err(|_| "SURREALDB_PASSWORD not set")?;
        let namespace = std::env::var("SURREALDB_NAMESPACE")
            .unwrap_or_else(|_| DEFAULT_NAMESPACE.to_string());
        let database =
            std::env::var("SURREALDB_DATABASE").unwrap_or_else(|_| DEFAULT_DATABASE.to_string());
        let is_root = std::env::var("SURREALDB_ROOT")
            .map(|v| v.to_lowercase() == "true")
            .unwrap_or(false);

        Ok(Self {
            endpoint,
            username,
            password,
            namespace,
            database,
            is_root,
        })
    }
}

async fn open(url: &str, namespace: &str, database: &str) -> Result<Surreal<Any>> {
    let db = surrealdb::engine::any::connect(url)
        .await
        .map_err(|e| StateError::Connection(format!("Failed to connect to {}: {}", url, e)))?;

    db.use_ns(namespace)
        .use_db(database)
        .await
        .map_err(|e| StateError::Connection(e.to_string()))?;

    migrations::init_schema(&db).await?;
    Ok(db)
}

/// Connect to an in-memory database with the schema applied.
pub(crate) async fn connect_in_memory() -> Result<Surreal<Any>> {
    open("mem://", DEFAULT_NAMESPACE, DEFAULT_DATABASE).await
}

/// Connect to an explicit endpoint URL (`mem://`, `surrealkv://path`, `ws://host`).
pub(crate) async fn connect_url(url: &str) -> Result<Surreal<Any>> {
    open(url, DEFAULT_NAMESPACE, DEFAULT_DATABASE).await
}

/// Connect to SurrealDB Cloud.
#[instrument(skip(config), fields(endpoint = %config.endpoint, namespace = %config.namespace))]
pub(crate) async fn connect_cloud(config: &CloudConfig) -> Result<Surreal<Any>> {
    info!("Connecting to SurrealDB Cloud (root={})", config.is_root);

    let db = surrealdb::engine::any::connect(&config.endpoint)
        .await
        .map_err(|e| {
            StateError::Connection(format!("Failed to connect to {}: {}", config.endpoint, e))
        })?;

    if config.is_root {
        db.signin(Root {
            username: &config.username,
            password: &config.password,
        })
        .await
        .map_err(|e| StateError::Connection(format!("Root authentication failed: {}", e)))?;
    } else {
        db.signin(Database {
            namespace: &config.namespace,
            database: &config.database,
            username: &config.username,
            password: &config.password,
        })
        .await
        .map_err(|e| StateError::Connection(format!("Database authentication failed: {}", e)))?;
    }

    db.use_ns(&config.namespace)
        .use_db(&config.database)
        .await
        .map_err(|e| StateError::Connection(e.to_string()))?;

    migrations::init_schema(&db).await?;
    Ok(db)
}

/// Connect using environment variables.
///
/// Cloud config wins, then `SURREALDB_URL`, then a local `surrealkv`
/// database under `.arena/db`.
#[instrument(skip_all)]
pub(crate) async fn connect_from_env() -> Result<Surreal<Any>> {
    if let Ok(config) = CloudConfig::from_env() {
        return connect_cloud(&config).await;
    }

    if let Ok(url) = std::env::var("SURREALDB_URL") {
        info!("SURREALDB_URL found, connecting to {}", url);
        return connect_url(&url).await;
    }

    std::fs::create_dir_all(Path::new(LOCAL_DB_PATH)).map_err(|e| {
        StateError::Connection(format!(
            "Failed to create database directory {}: {}",
            LOCAL_DB_PATH, e
        ))
    })?;
    let url = format!("surrealkv://{}", LOCAL_DB_PATH);
    info!("No cloud config or SURREALDB_URL found, using local persistence: {}", url);
    connect_url(&url).await
}
