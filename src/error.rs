use thiserror::Error;

use crate::scheduler::JobState;

#[derive(Error, Debug)]
pub enum SchedulerError {
    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Driver unavailable: {0}")]
    DriverUnavailable(String),

    #[error("Job {0} already reached a terminal state")]
    RaceLost(u64),

    #[error("Out-of-order callback for job {job_id}: {event} while {state}")]
    CallbackOutOfOrder {
        job_id: u64,
        state: JobState,
        event: &'static str,
    },

    #[error("Job id {0} already exists")]
    DuplicateId(u64),

    #[error("Store error: {0}")]
    Store(String),

    #[error("Coordinator returned no result")]
    CoordinatorUnavailable,

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Coarse classification used by callers that translate errors into responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Client,
    NotFound,
    Unavailable,
    Internal,
}

impl SchedulerError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            SchedulerError::Validation(_) | SchedulerError::DuplicateId(_) => ErrorKind::Client,
            SchedulerError::NotFound(_) => ErrorKind::NotFound,
            SchedulerError::DriverUnavailable(_) | SchedulerError::CoordinatorUnavailable => {
                ErrorKind::Unavailable
            }
            SchedulerError::RaceLost(_)
            | SchedulerError::CallbackOutOfOrder { .. }
            | SchedulerError::Store(_)
            | SchedulerError::Internal(_) => ErrorKind::Internal,
        }
    }

    pub fn job_not_found(id: u64) -> Self {
        Self::NotFound(format!("job {}", id))
    }

    pub fn app_not_found(appid: &str) -> Self {
        Self::NotFound(format!("application {}", appid))
    }
}

impl From<serde_json::Error> for SchedulerError {
    fn from(err: serde_json::Error) -> Self {
        SchedulerError::Store(format!("serialization: {}", err))
    }
}

macro_rules! store_error_from {
    ($($ty:ty),* $(,)?) => {
        $(
            impl From<$ty> for SchedulerError {
                fn from(err: $ty) -> Self {
                    SchedulerError::Store(err.to_string())
                }
            }
        )*
    };
}

store_error_from!(
    redb::Error,
    redb::DatabaseError,
    redb::TransactionError,
    redb::TableError,
    redb::StorageError,
    redb::CommitError,
);

pub type Result<T> = std::result::Result<T, SchedulerError>;
