use thiserror::Error;

pub type Result<T> = std::result::Result<T, StoreError>;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),

    /// Transient retries exhausted on a write path. Read paths degrade
    /// instead of surfacing this.
    #[error("[RPC_FAILED] {0}: connection error")]
    ConnectionExhausted(&'static str),

    #[error("Serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// The closed transient-error allowlist. Widening it silently masks logic
/// bugs, so only genuine network-shaped failures qualify.
pub fn is_transient(err: &sqlx::Error) -> bool {
    matches!(
        err,
        sqlx::Error::Io(_)
            | sqlx::Error::PoolTimedOut
            | sqlx::Error::PoolClosed
            | sqlx::Error::Protocol(_)
            | sqlx::Error::WorkerCrashed
    )
}
