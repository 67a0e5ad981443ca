//! Postgres persistence for discourse-lens.
//!
//! All mutations go through named SQL functions or single-statement updates,
//! wrapped in the transient-retry helper. A process-wide submission lock
//! serializes store calls; workers fan out at the task level, not at the
//! connection level.

pub mod cache;
pub mod error;
pub mod rows;

mod comments;
mod jobs;
mod posts;
mod registry;
mod retry;

pub use cache::{CacheHit, ReadCache, CACHE_MAX_KEYS, CACHE_TTL};
pub use comments::{ClusterAssignment, ClusterMetadataUpdate, ClusterPayload, CommentSync, OpReport};
pub use error::{Result, StoreError};
pub use posts::AnalysisFields;
pub use rows::*;

use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;

use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use tokio::sync::Mutex;
use uuid::Uuid;

use retry::retry_db;

#[derive(Clone)]
pub struct Store {
    pool: PgPool,
    submit_lock: Arc<Mutex<()>>,
    known_jobs: Arc<std::sync::Mutex<HashSet<Uuid>>>,
}

impl Store {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            submit_lock: Arc::new(Mutex::new(())),
            known_jobs: Arc::new(std::sync::Mutex::new(HashSet::new())),
        }
    }

    pub async fn connect(database_url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(database_url)
            .await?;
        Ok(Self::new(pool))
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Run the embedded SQL migrations.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }

    /// Write-path submission: retries transients, then surfaces
    /// `ConnectionExhausted` so callers can fail the operation loudly.
    pub(crate) async fn submit<T, F, Fut>(&self, op: &'static str, f: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = std::result::Result<T, sqlx::Error>>,
    {
        let _guard = self.submit_lock.lock().await;
        match retry_db(op, f).await? {
            Some(v) => Ok(v),
            None => Err(StoreError::ConnectionExhausted(op)),
        }
    }

    /// Read-path submission: `Ok(None)` means transients exhausted and the
    /// caller should degrade instead of erroring.
    pub(crate) async fn submit_degraded<T, F, Fut>(
        &self,
        op: &'static str,
        f: F,
    ) -> Result<Option<T>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = std::result::Result<T, sqlx::Error>>,
    {
        let _guard = self.submit_lock.lock().await;
        Ok(retry_db(op, f).await?)
    }

    pub(crate) fn job_known(&self, job_id: Uuid) -> bool {
        self.known_jobs
            .lock()
            .expect("known_jobs lock poisoned")
            .contains(&job_id)
    }

    pub(crate) fn remember_job(&self, job_id: Uuid) {
        self.known_jobs
            .lock()
            .expect("known_jobs lock poisoned")
            .insert(job_id);
    }
}
