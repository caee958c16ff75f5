use thiserror::Error;

/// Errors surfaced by the job store.
///
/// Client errors (bad input, duplicate keys, dangling references) are never
/// worth retrying; database errors may be transient and the caller can retry
/// the whole operation after the enclosing transaction has rolled back.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Bad configuration detected at startup. The scheduler must not start.
    #[error("configuration error: {0}")]
    Config(String),

    /// Invalid request — e.g. a volatile job paired with a non-volatile
    /// trigger, or a trigger referencing an unknown calendar.
    #[error("client error: {0}")]
    Client(String),

    /// A job/trigger/calendar with the same key already exists and
    /// `replace` was not requested.
    #[error("{kind} already exists: {key}")]
    ObjectAlreadyExists { kind: &'static str, key: String },

    /// The job referenced by an operation is gone. Inside `trigger_fired`
    /// this variant gets the capture-commit-rethrow treatment so the
    /// fired-trigger cleanup still lands.
    #[error("job does not exist: {key}")]
    JobDoesNotExist { key: String },

    /// The named trigger is gone.
    #[error("trigger does not exist: {key}")]
    TriggerDoesNotExist { key: String },

    /// A schedule definition could not be parsed (bad cron expression,
    /// bad time-zone offset, nonsensical repeat settings).
    #[error("invalid schedule: {0}")]
    InvalidSchedule(String),

    /// A SQLite operation failed.
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// The connection pool could not hand out a connection.
    #[error("connection pool error: {0}")]
    Pool(String),

    /// A stored payload column failed to (de)serialize.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl StoreError {
    /// Stable error code string reported to the upstream scheduler.
    pub fn code(&self) -> &'static str {
        match self {
            StoreError::Config(_) => "CONFIG_ERROR",
            StoreError::Client(_) => "CLIENT_ERROR",
            StoreError::ObjectAlreadyExists { .. } => "OBJECT_ALREADY_EXISTS",
            StoreError::JobDoesNotExist { .. } => "JOB_DOES_NOT_EXIST",
            StoreError::TriggerDoesNotExist { .. } => "TRIGGER_DOES_NOT_EXIST",
            StoreError::InvalidSchedule(_) => "CLIENT_ERROR",
            StoreError::Database(_) => "PERSISTENCE_ERROR",
            StoreError::Pool(_) => "PERSISTENCE_ERROR",
            StoreError::Serialization(_) => "PERSISTENCE_ERROR",
        }
    }
}

pub type Result<T> = std::result::Result<T, StoreError>;
