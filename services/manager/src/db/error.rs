//! Database error types.

use areaplane_reconcile::Retryable;
use thiserror::Error;

/// Database operation errors.
#[derive(Debug, Error)]
pub enum DbError {
    /// Failed to connect to the database.
    #[error("failed to connect to database: {0}")]
    Connect(#[source] sqlx::Error),

    /// Failed to execute a query.
    #[error("query failed: {0}")]
    Query(#[source] sqlx::Error),

    /// Failed to run migrations.
    #[error("migration failed: {0}")]
    Migration(#[source] sqlx::migrate::MigrateError),

    /// Migration directory not found in the current environment.
    #[error("migration directory not found; tried {tried}. Last error: {last_error}. Run from repo root or services/manager.")]
    MigrationDirNotFound { tried: String, last_error: String },

    /// Optimistic version check failed: the row changed since it was read.
    #[error("{entity} {id} was modified concurrently")]
    Conflict { entity: &'static str, id: String },

    /// A row lock could not be acquired in time.
    #[error("lock timeout: {0}")]
    LockTimeout(String),

    /// Serialization failure, deadlock, pool exhaustion or connection loss.
    #[error("transient database failure: {0}")]
    Transient(String),

    /// The addressed row does not exist.
    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: String },

    /// A stored value failed validation on read.
    #[error("invalid stored value: {0}")]
    Validation(String),
}

impl DbError {
    pub fn conflict(entity: &'static str, id: impl ToString) -> Self {
        DbError::Conflict {
            entity,
            id: id.to_string(),
        }
    }

    pub fn not_found(entity: &'static str, id: impl ToString) -> Self {
        DbError::NotFound {
            entity,
            id: id.to_string(),
        }
    }

    /// Classifies a driver error by SQLSTATE.
    pub fn from_sqlx(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::Database(db_err) => match db_err.code().as_deref() {
                // lock_not_available, query_canceled (lock_timeout/statement_timeout)
                Some("55P03") | Some("57014") => DbError::LockTimeout(db_err.message().to_string()),
                // serialization_failure, deadlock_detected
                Some("40001") | Some("40P01") => DbError::Transient(db_err.message().to_string()),
                _ => DbError::Query(err),
            },
            sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_) => {
                DbError::Transient(err.to_string())
            }
            _ => DbError::Query(err),
        }
    }

    /// Returns true if re-running the unit of work may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            DbError::Conflict { .. } | DbError::LockTimeout(_) | DbError::Transient(_)
        )
    }
}

impl Retryable for DbError {
    fn is_retryable(&self) -> bool {
        self.is_transient()
    }
}
