//! Job lifecycle and the degraded read paths.
//!
//! Reads go through a bounded cache; when the store is unreachable past the
//! retry budget, stale cache entries (or empty payloads) are served with an
//! observable degraded flag instead of an error.

use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use tracing::{info, warn};
use uuid::Uuid;

use lens_common::{JobMode, PipelineType};
use lens_store::{CacheHit, JobRow, ReadCache, Result as StoreResult, Store, StoreError};

const MOCK_TARGET_COUNT: usize = 5;

#[derive(thiserror::Error, Debug)]
pub enum JobError {
    #[error("Invalid job: {0}")]
    Invalid(String),

    #[error("Job not found")]
    NotFound,

    #[error(transparent)]
    Store(#[from] StoreError),
}

pub struct JobManager {
    store: Store,
    cache: ReadCache,
}

impl JobManager {
    pub fn new(store: Store) -> Self {
        Self {
            store,
            cache: ReadCache::default(),
        }
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    /// Validate and persist a new job in `discovering` state.
    pub async fn create_job(
        &self,
        pipeline_type: &str,
        mode: &str,
        input_config: &Value,
    ) -> Result<JobRow, JobError> {
        let normalized_type = pipeline_type.trim().to_uppercase();
        let normalized_mode = {
            let m = mode.trim().to_lowercase();
            if m.is_empty() {
                "ingest".to_string()
            } else {
                m
            }
        };

        if matches!(PipelineType::parse(&normalized_type), PipelineType::Other(_)) {
            return Err(JobError::Invalid(format!(
                "unknown pipeline type: {normalized_type}"
            )));
        }
        if matches!(JobMode::parse(&normalized_mode), JobMode::Other(_)) {
            return Err(JobError::Invalid(format!(
                "unknown job mode: {normalized_mode}"
            )));
        }

        let row = self
            .store
            .insert_job(&normalized_type, &normalized_mode, input_config)
            .await?;
        self.cache.invalidate_prefix("jobs_list:");
        info!(job_id = %row.id, pipeline_type = %normalized_type, "Job created");
        Ok(row)
    }

    /// Expand input_config into de-duplicated items and move the job to
    /// `processing`. Returns the item count.
    pub async fn start_discovery(&self, job_id: Uuid) -> Result<usize, JobError> {
        let job = self
            .store
            .get_job(job_id)
            .await?
            .ok_or(JobError::NotFound)?;

        let mut targets = expand_targets(&job.input_config);
        if targets.is_empty() {
            targets = (1..=MOCK_TARGET_COUNT)
                .map(|i| format!("mock://{job_id}/{i}"))
                .collect();
        }

        let count = self.store.insert_job_items(job_id, &targets).await?;
        self.cache.invalidate_prefix("job_items:");
        self.store
            .mark_job_processing(job_id, Some(count as i32))
            .await?;
        info!(%job_id, items = count, "Discovery complete");
        Ok(count)
    }

    // ------------------------------------------------------------------
    // Degraded reads
    // ------------------------------------------------------------------

    /// Jobs, newest first. Returns (payload, degraded).
    pub async fn get_job_list(&self, limit: i64) -> StoreResult<(Value, bool)> {
        let key = format!("jobs_list:{limit}");
        self.cached_read(&key, || async {
            self.store
                .list_jobs(limit)
                .await
                .map(|rows| rows.map(|r| json!(r)))
        })
        .await
    }

    /// Items for one job by updated_at desc. Returns (payload, degraded).
    pub async fn get_job_items(&self, job_id: Uuid, limit: i64) -> StoreResult<(Value, bool)> {
        let key = format!("job_items:{job_id}:{limit}");
        self.cached_read(&key, || async {
            self.store
                .list_job_items(job_id, limit)
                .await
                .map(|rows| rows.map(|r| json!(r)))
        })
        .await
    }

    pub async fn get_job(&self, job_id: Uuid) -> StoreResult<Option<JobRow>> {
        self.store.get_job(job_id).await
    }

    /// Derived summary from item rows. `None` when the job does not exist.
    pub async fn get_job_summary(&self, job_id: Uuid) -> StoreResult<Option<(Value, bool)>> {
        let Some(header) = self.store.get_job(job_id).await? else {
            return Ok(None);
        };

        let mut degraded = false;
        let items = match self.store.job_items_brief(job_id).await? {
            Some(items) => items,
            None => {
                degraded = true;
                Vec::new()
            }
        };

        let total = items.len() as i64;
        let success = items
            .iter()
            .filter(|it| it.status == "completed" || it.stage == "completed")
            .count() as i64;
        let failed = items
            .iter()
            .filter(|it| it.status == "failed" || it.stage == "failed")
            .count() as i64;
        let processed = success + failed;
        let last_item_updated_at: Option<DateTime<Utc>> =
            items.iter().map(|it| it.updated_at).max();

        let mut status = "processing".to_string();
        if total > 0 && processed >= total {
            status = if failed > 0 { "failed" } else { "completed" }.to_string();
        }
        if Store::is_stale(header.last_heartbeat_at, processed, total) {
            status = "stale".to_string();
        }

        let summary = json!({
            "job_id": job_id,
            "pipeline_type": header.pipeline_type,
            "status": status,
            "total_count": total,
            "processed_count": processed,
            "success_count": success,
            "failed_count": failed,
            "last_item_updated_at": last_item_updated_at,
            "last_heartbeat_at": header.last_heartbeat_at,
            "degraded": degraded,
        });
        Ok(Some((summary, degraded)))
    }

    async fn cached_read<F, Fut>(&self, key: &str, fetch: F) -> StoreResult<(Value, bool)>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = StoreResult<Option<Value>>>,
    {
        if let CacheHit::Fresh(data) = self.cache.lookup(key) {
            return Ok((data, false));
        }

        match fetch().await? {
            Some(data) => {
                self.cache.store(key, data.clone());
                Ok((data, false))
            }
            None => match self.cache.lookup(key) {
                CacheHit::Fresh(data) | CacheHit::Stale(data) => {
                    warn!(key, "Serving stale cache for degraded read");
                    Ok((data, true))
                }
                CacheHit::Miss => Ok((json!([]), true)),
            },
        }
    }
}

/// Target expansion, in source order: url, target, targets[], lines[],
/// keywords[]. De-duplicated, order preserved.
pub fn expand_targets(config: &Value) -> Vec<String> {
    let mut raw: Vec<String> = Vec::new();

    let mut add = |val: Option<&Value>| match val {
        Some(Value::String(s)) => raw.push(s.trim().to_string()),
        Some(Value::Array(items)) => {
            for item in items {
                if let Some(s) = item.as_str() {
                    raw.push(s.trim().to_string());
                }
            }
        }
        _ => {}
    };

    add(config.get("url"));
    add(config.get("target"));
    add(config.get("targets"));
    add(config.get("lines"));
    add(config.get("keywords"));

    let mut seen = std::collections::HashSet::new();
    raw.into_iter()
        .filter(|t| !t.is_empty() && seen.insert(t.clone()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expansion_order_and_dedup() {
        let config = json!({
            "url": "https://a",
            "targets": ["https://b", "https://a", " https://c "],
            "keywords": ["tax"],
        });
        assert_eq!(
            expand_targets(&config),
            vec!["https://a", "https://b", "https://c", "tax"]
        );
    }

    #[test]
    fn empty_config_expands_to_nothing() {
        assert!(expand_targets(&json!({})).is_empty());
        assert!(expand_targets(&json!({"url": ""})).is_empty());
    }

    #[test]
    fn resubmission_expands_identically() {
        let config = json!({"lines": ["x", "y", "x"], "target": "x"});
        let a = expand_targets(&config);
        let b = expand_targets(&config);
        assert_eq!(a, b);
        assert_eq!(a, vec!["x", "y"]);
    }
}
