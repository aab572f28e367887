//! Errors of reconciliation jobs and request handlers.

use areaplane_reconcile::Retryable;
use thiserror::Error;

use crate::db::DbError;
use crate::dns::DnsError;
use crate::hosting::HostingError;
use crate::publisher::PublishError;

pub type ManagerResult<T> = Result<T, ManagerError>;

#[derive(Debug, Error)]
pub enum ManagerError {
    #[error("store error: {0}")]
    Db(#[from] DbError),

    #[error("hosting error: {0}")]
    Hosting(#[from] HostingError),

    #[error("dns error: {0}")]
    Dns(#[from] DnsError),

    #[error("publish error: {0}")]
    Publish(#[from] PublishError),

    /// An invariant violation; never retried and nothing is committed.
    #[error("validation failed: {0}")]
    Validation(String),
}

impl ManagerError {
    /// True only for store contention; provider failures wait for the next
    /// tick instead.
    pub fn is_retryable(&self) -> bool {
        match self {
            ManagerError::Db(e) => e.is_transient(),
            _ => false,
        }
    }
}

impl Retryable for ManagerError {
    fn is_retryable(&self) -> bool {
        ManagerError::is_retryable(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_store_contention_is_retryable() {
        assert!(ManagerError::from(DbError::conflict("server", 1)).is_retryable());
        assert!(ManagerError::from(DbError::LockTimeout("areas".into())).is_retryable());
        assert!(!ManagerError::from(DbError::not_found("server", 1)).is_retryable());
        assert!(!ManagerError::Validation("id mismatch".into()).is_retryable());
        assert!(!ManagerError::from(HostingError::LaunchFailed("quota".into())).is_retryable());
    }
}
