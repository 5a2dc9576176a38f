//! Native errors of the in-memory backend and their classification.

use thiserror::Error;

use crate::domain::{
    ConfigurationCode, DataCode, ErrorMapper, JobId, QueueError, RuntimeCode,
};

#[derive(Debug, Clone, Error)]
pub enum MemoryBackendError {
    #[error("connection refused: queue `{0}` is not connected")]
    NotConnected(String),

    #[error("job {0} already exists")]
    DuplicateJob(JobId),

    #[error("queue does not exist: {0}")]
    QueueDeleted(String),

    #[error("lease {0} is unknown or already finalized")]
    UnknownLease(String),

    #[error("job {0} not found")]
    UnknownJob(JobId),
}

impl MemoryBackendError {
    fn classify(&self) -> QueueError {
        let message = self.to_string();
        match self {
            MemoryBackendError::NotConnected(_) => {
                QueueError::runtime(RuntimeCode::Connection, true, message)
            }
            MemoryBackendError::DuplicateJob(_) => QueueError::data(DataCode::Duplicate, message),
            MemoryBackendError::QueueDeleted(_) => {
                QueueError::configuration(ConfigurationCode::QueueNotFound, message)
            }
            MemoryBackendError::UnknownLease(_) | MemoryBackendError::UnknownJob(_) => {
                QueueError::not_found(message)
            }
        }
    }
}

/// Mapper with the structural rule for this backend registered.
pub(crate) fn memory_error_mapper() -> ErrorMapper {
    ErrorMapper::new().with_structural::<MemoryBackendError, _>(|e| Some(e.classify()))
}
