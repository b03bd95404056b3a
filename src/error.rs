use thiserror::Error;

/// Errors surfaced by the migration engine.
///
/// Each variant maps onto one of the stable error identifiers exposed to
/// callers; `exit_code` implements the CLI exit-code contract.
#[derive(Error, Debug)]
pub enum MigrateError {
    #[error("{0}")]
    Error(String),

    #[error("bundle error: {0}")]
    BundleError(String),

    #[error("checksum drift for migration {0}; run `repair --accept-checksum {0}` to accept the on-disk version")]
    DriftError(String),

    #[error("migration {id} requires {required} to be applied first")]
    DependencyError { id: String, required: String },

    #[error("migration {0} is marked irreversible; cannot rollback")]
    IrreversibleError(String),

    #[error("migration {0} is not allowed by the configured allow_tags filter")]
    TagBlocked(String),

    #[error("another migration run holds the advisory lock")]
    LockBusy,

    #[error("migration {0} is marked running; a previous run may have died (retry --force overrides)")]
    StaleRunning(String),

    #[error("execution failed: {0}")]
    ExecutionError(String),

    #[error("verification failed for migration {0}")]
    VerifyFailed(String),

    #[error("configuration error: {0}")]
    ConfigError(String),

    #[error("database error: {0}")]
    DatabaseError(#[from] postgres::Error),

    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

impl MigrateError {
    /// Process exit code for this error.
    ///
    /// 1 = user error, 2 = lock busy, 3 = execution failure,
    /// 4 = configuration error.
    pub fn exit_code(&self) -> i32 {
        match self {
            MigrateError::ConfigError(_) => 4,
            MigrateError::ExecutionError(_)
            | MigrateError::VerifyFailed(_)
            | MigrateError::DatabaseError(_) => 3,
            MigrateError::LockBusy => 2,
            _ => 1,
        }
    }
}
