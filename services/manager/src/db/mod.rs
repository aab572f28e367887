//! Persistence layer for the world manager.
//!
//! This module provides:
//! - Connection pool management
//! - The [`WorldStore`] port every reconciler talks to
//! - A Postgres implementation ([`PgStore`]) with optimistic version checks
//! - An in-memory implementation ([`MemoryStore`]) for tests and dev mode
//!
//! The database layer uses SQLx with Postgres.

mod error;
mod memory;
mod pg;

pub use error::DbError;
pub use memory::MemoryStore;
pub use pg::PgStore;

use std::collections::{BTreeMap, BTreeSet};
use std::net::IpAddr;
use std::time::Duration;

use areaplane_id::{AreaId, RegionId, ServerId, TaskId};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions};
use tracing::info;

use crate::allocation::AllocationPlan;
use crate::hosting::HostedTask;
use crate::model::{Area, Position, Region, Server, Task, World};

/// Database configuration.
#[derive(Debug, Clone)]
pub struct DbConfig {
    /// Database connection URL.
    pub database_url: String,

    /// Maximum number of connections in the pool.
    pub max_connections: u32,

    /// Minimum number of idle connections.
    pub min_connections: u32,

    /// Connection acquire timeout.
    pub acquire_timeout: Duration,

    /// Idle connection timeout.
    pub idle_timeout: Duration,

    /// Maximum lifetime of a connection.
    pub max_lifetime: Duration,

    /// How long the allocation transaction waits for area row locks.
    pub lock_timeout: Duration,
}

impl Default for DbConfig {
    fn default() -> Self {
        Self {
            database_url: "postgres://localhost/areaplane".to_string(),
            max_connections: 10,
            min_connections: 1,
            acquire_timeout: Duration::from_secs(5),
            idle_timeout: Duration::from_secs(600),
            max_lifetime: Duration::from_secs(1800),
            lock_timeout: Duration::from_secs(2),
        }
    }
}

impl DbConfig {
    /// Load configuration from environment variables.
    pub fn from_env() -> Self {
        let database_url = std::env::var("DATABASE_URL")
            .unwrap_or_else(|_| "postgres://localhost/areaplane".to_string());

        let max_connections = std::env::var("DB_MAX_CONNECTIONS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(10);

        let min_connections = std::env::var("DB_MIN_CONNECTIONS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(1);

        let lock_timeout = std::env::var("DB_LOCK_TIMEOUT_MS")
            .ok()
            .and_then(|s| s.parse().ok())
            .map(Duration::from_millis)
            .unwrap_or(Duration::from_secs(2));

        Self {
            database_url,
            max_connections,
            min_connections,
            lock_timeout,
            ..Default::default()
        }
    }
}

/// Database connection pool wrapper.
#[derive(Clone)]
pub struct Database {
    pool: PgPool,
    lock_timeout: Duration,
}

impl Database {
    /// Create a new database connection pool.
    pub async fn connect(config: &DbConfig) -> Result<Self, DbError> {
        info!(
            max_connections = config.max_connections,
            min_connections = config.min_connections,
            "Connecting to database"
        );

        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(config.acquire_timeout)
            .idle_timeout(Some(config.idle_timeout))
            .max_lifetime(Some(config.max_lifetime))
            .connect(&config.database_url)
            .await
            .map_err(DbError::Connect)?;

        info!("Database connection pool established");

        Ok(Self {
            pool,
            lock_timeout: config.lock_timeout,
        })
    }

    /// Get a reference to the underlying connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Run pending migrations.
    pub async fn run_migrations(&self) -> Result<(), DbError> {
        info!("Running database migrations");

        let candidates = vec![
            std::path::PathBuf::from("./migrations"),
            std::path::PathBuf::from("services/manager/migrations"),
            std::path::PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("migrations"),
        ];
        let mut last_error: Option<sqlx::migrate::MigrateError> = None;

        for dir in &candidates {
            match sqlx::migrate::Migrator::new(dir.clone()).await {
                Ok(migrator) => {
                    info!(migrations_dir = %dir.display(), "Loaded migrations");
                    migrator.run(&self.pool).await.map_err(DbError::Migration)?;
                    info!("Database migrations complete");
                    return Ok(());
                }
                Err(e) => {
                    last_error = Some(e);
                }
            }
        }

        let tried = candidates
            .iter()
            .map(|dir| dir.display().to_string())
            .collect::<Vec<_>>()
            .join(", ");

        Err(DbError::MigrationDirNotFound {
            tried,
            last_error: last_error
                .map(|e| e.to_string())
                .unwrap_or_else(|| "unknown error".to_string()),
        })
    }

    /// Get a world store handle.
    pub fn world_store(&self) -> PgStore {
        PgStore::new(self.pool.clone(), self.lock_timeout)
    }
}

/// Everything allocation needs to know about one region, read at one point.
#[derive(Debug, Clone, PartialEq)]
pub struct RegionSnapshot {
    pub region: Region,
    /// Areas of the region, ordered by index.
    pub areas: Vec<Area>,
    /// Servers of the region, ordered by id.
    pub servers: Vec<Server>,
    /// The first task backing each server of the region, if any.
    pub server_tasks: BTreeMap<ServerId, Task>,
}

/// Persistence port for the world model.
///
/// Each method is its own unit of work; callers wrap them in
/// [`areaplane_reconcile::retry_transient`].
#[async_trait]
pub trait WorldStore: Send + Sync {
    /// Check if the store is reachable.
    async fn health_check(&self) -> Result<(), DbError>;

    // -------------------------------------------------------------------------
    // Regions and areas
    // -------------------------------------------------------------------------

    async fn list_regions(&self) -> Result<Vec<Region>, DbError>;

    async fn insert_region(&self, name: &str, map_name: &str) -> Result<Region, DbError>;

    async fn insert_area(
        &self,
        region_id: RegionId,
        index: i32,
        name: &str,
        position: Position,
    ) -> Result<Area, DbError>;

    async fn delete_area(&self, area_id: AreaId) -> Result<(), DbError>;

    async fn region_snapshot(&self, region_id: RegionId) -> Result<RegionSnapshot, DbError>;

    /// Writes an allocation plan atomically.
    ///
    /// Fails with [`DbError::Conflict`] if any server the plan updates has a
    /// different version, or any area of the region changed owner, since the
    /// snapshot the plan was computed from. Returns the servers with
    /// observable changes as committed (new ids, bumped versions).
    async fn commit_allocation(&self, plan: &AllocationPlan) -> Result<Vec<Server>, DbError>;

    // -------------------------------------------------------------------------
    // Servers
    // -------------------------------------------------------------------------

    async fn list_servers(&self) -> Result<Vec<Server>, DbError>;

    async fn get_server(&self, id: ServerId) -> Result<Option<Server>, DbError>;

    /// Writes every non-area field of `server` if its version still matches,
    /// returning the server with the bumped version.
    async fn update_server(&self, server: &Server) -> Result<Server, DbError>;

    /// Servers of the region whose held area set is not exactly `area_ids`.
    async fn servers_with_areas_differing(
        &self,
        region_id: RegionId,
        area_ids: &BTreeSet<AreaId>,
    ) -> Result<Vec<Server>, DbError>;

    /// Lowest-id server of the region holding `area_id`.
    async fn first_server_containing(
        &self,
        region_id: RegionId,
        area_id: AreaId,
    ) -> Result<Option<Server>, DbError>;

    /// Lowest-id server of the region holding no areas.
    async fn first_empty_server(&self, region_id: RegionId) -> Result<Option<Server>, DbError>;

    /// Enabled servers with no server task recorded.
    async fn enabled_servers_without_task(&self) -> Result<Vec<Server>, DbError>;

    // -------------------------------------------------------------------------
    // Tasks
    // -------------------------------------------------------------------------

    async fn list_tasks(&self) -> Result<Vec<Task>, DbError>;

    /// Lowest-id task backing the server.
    async fn server_task(&self, server_id: ServerId) -> Result<Option<Task>, DbError>;

    /// The first task of every enabled server.
    async fn enabled_server_tasks(&self) -> Result<Vec<Task>, DbError>;

    /// Inserts or updates the task with the same identifier from a poll,
    /// setting `seen`. A changed public IP clears the assigned domain.
    async fn upsert_polled_task(
        &self,
        hosted: &HostedTask,
        seen: DateTime<Utc>,
    ) -> Result<Task, DbError>;

    /// Records a task this manager just started, setting `initiated`.
    async fn record_started_task(
        &self,
        hosted: &HostedTask,
        initiated: DateTime<Utc>,
    ) -> Result<Task, DbError>;

    /// Tasks seen by an earlier poll whose identifier is not in `keep`.
    async fn stale_tasks(
        &self,
        keep: &BTreeSet<String>,
        seen_before: DateTime<Utc>,
    ) -> Result<Vec<Task>, DbError>;

    /// Server tasks not in `keep` that were initiated before the cutoff or
    /// were never initiated by a manager at all.
    async fn unused_server_tasks(
        &self,
        keep: &BTreeSet<String>,
        initiated_before: DateTime<Utc>,
    ) -> Result<Vec<Task>, DbError>;

    async fn set_task_domain(&self, id: TaskId, domain: &str) -> Result<(), DbError>;

    /// Deletes the task; deleting a missing task is not an error.
    async fn delete_task(&self, id: TaskId) -> Result<(), DbError>;

    // -------------------------------------------------------------------------
    // World
    // -------------------------------------------------------------------------

    async fn get_world(&self) -> Result<World, DbError>;

    /// Replaces the manager and kiosk host sets. Returns the updated world
    /// if either set changed, `None` otherwise.
    async fn update_world_hosts(
        &self,
        manager_hosts: &BTreeSet<IpAddr>,
        kiosk_hosts: &BTreeSet<IpAddr>,
    ) -> Result<Option<World>, DbError>;
}
