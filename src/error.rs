use thiserror::Error;

use crate::bulk::job::JobStatus;
use crate::bulk::schema::SchemaResolutionError;

/// Failure classes surfaced by the import controller.
#[derive(Debug, Error)]
pub enum ImportError {
    #[error(transparent)]
    SchemaResolution(#[from] SchemaResolutionError),

    #[error("resource limit: {0}")]
    ResourceLimit(String),

    #[error("import job {0} not found")]
    JobNotFound(String),

    #[error("job {job_id} cannot move from {from} to {to}")]
    InvalidTransition {
        job_id: String,
        from: JobStatus,
        to: JobStatus,
    },

    /// Transient: the connection pool could not hand out a connection in time.
    #[error("storage unavailable: {0}")]
    StorageUnavailable(String),

    #[error("storage error: {0:#}")]
    Storage(anyhow::Error),

    #[error("source file error: {0:#}")]
    Source(anyhow::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("worker pool: {0}")]
    WorkerPool(String),
}

pub type Result<T, E = ImportError> = std::result::Result<T, E>;

impl ImportError {
    /// Classify a store failure, separating pool exhaustion from hard errors.
    pub fn from_storage(err: anyhow::Error) -> Self {
        let timed_out = err
            .chain()
            .any(|cause| matches!(cause.downcast_ref::<sqlx::Error>(), Some(sqlx::Error::PoolTimedOut)));
        if timed_out {
            ImportError::StorageUnavailable(format!("{err:#}"))
        } else {
            ImportError::Storage(err)
        }
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, ImportError::StorageUnavailable(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Context;

    #[test]
    fn pool_timeouts_are_transient() {
        let err = Err::<(), _>(sqlx::Error::PoolTimedOut)
            .context("load job")
            .unwrap_err();
        let classified = ImportError::from_storage(err);
        assert!(classified.is_transient());
        assert!(classified.to_string().contains("load job"));
    }

    #[test]
    fn other_store_errors_are_hard_failures() {
        let classified = ImportError::from_storage(anyhow::anyhow!("constraint violated"));
        assert!(matches!(classified, ImportError::Storage(_)));
        assert!(!classified.is_transient());
    }
}
