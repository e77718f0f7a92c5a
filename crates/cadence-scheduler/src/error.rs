use thiserror::Error;

/// Errors that can occur within the scheduler subsystem.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// Underlying SQLite / rusqlite error.
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// The provided schedule definition is invalid or unsupported.
    #[error("Invalid schedule: {0}")]
    InvalidSchedule(String),

    /// A job with this ID already exists; the caller must pick a fresh one.
    #[error("Duplicate job id: {id}")]
    DuplicateId { id: String },

    /// No handler is registered for the job's type.
    #[error("no handler registered for job type '{job_type}'")]
    HandlerNotRegistered { job_type: String },

    /// The handler returned an error or panicked.
    #[error("{0}")]
    Handler(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A store connection mutex was poisoned by a panicking holder.
    #[error("Store connection poisoned")]
    Poisoned,

    /// The worker configuration failed validation.
    #[error(transparent)]
    Config(#[from] cadence_core::CadenceError),
}

impl SchedulerError {
    /// Stable code written in front of `error_message` on failed attempts.
    pub fn code(&self) -> &'static str {
        match self {
            SchedulerError::Database(_) => "DATABASE_ERROR",
            SchedulerError::InvalidSchedule(_) => "INVALID_SCHEDULE",
            SchedulerError::DuplicateId { .. } => "DUPLICATE_ID",
            SchedulerError::HandlerNotRegistered { .. } => "HANDLER_NOT_FOUND",
            SchedulerError::Handler(_) => "HANDLER_ERROR",
            SchedulerError::Serialization(_) => "SERIALIZATION_ERROR",
            SchedulerError::Poisoned => "INTERNAL_ERROR",
            SchedulerError::Config(e) => e.code(),
        }
    }
}

pub type Result<T> = std::result::Result<T, SchedulerError>;
