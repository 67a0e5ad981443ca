//! Job and item operations, including the claim/lease/terminal SQL functions.

use chrono::Utc;
use serde_json::Value;
use tracing::warn;
use uuid::Uuid;

use crate::error::Result;
use crate::rows::{JobItemBrief, JobItemRow, JobRow};
use crate::Store;

pub const LEASE_TTL_SECONDS: i32 = 60;

impl Store {
    pub async fn insert_job(
        &self,
        pipeline_type: &str,
        mode: &str,
        input_config: &Value,
    ) -> Result<JobRow> {
        let pool = self.pool.clone();
        let pipeline_type = pipeline_type.trim().to_uppercase();
        let mode = mode.trim().to_lowercase();
        let input_config = input_config.clone();

        let row = self
            .submit("insert_job", move || {
                let pool = pool.clone();
                let pipeline_type = pipeline_type.clone();
                let mode = mode.clone();
                let input_config = input_config.clone();
                async move {
                    sqlx::query_as::<_, JobRow>(
                        r#"
                        INSERT INTO job_batches (pipeline_type, mode, input_config, status)
                        VALUES ($1, $2, $3, 'discovering')
                        RETURNING *
                        "#,
                    )
                    .bind(pipeline_type)
                    .bind(mode)
                    .bind(input_config)
                    .fetch_one(&pool)
                    .await
                }
            })
            .await?;

        self.remember_job(row.id);
        Ok(row)
    }

    pub async fn get_job(&self, job_id: Uuid) -> Result<Option<JobRow>> {
        let pool = self.pool.clone();
        let row = self
            .submit_degraded("get_job", move || {
                let pool = pool.clone();
                async move {
                    sqlx::query_as::<_, JobRow>("SELECT * FROM job_batches WHERE id = $1")
                        .bind(job_id)
                        .fetch_optional(&pool)
                        .await
                }
            })
            .await?;
        Ok(row.flatten())
    }

    pub async fn list_jobs(&self, limit: i64) -> Result<Option<Vec<JobRow>>> {
        let pool = self.pool.clone();
        self.submit_degraded("list_jobs", move || {
            let pool = pool.clone();
            async move {
                sqlx::query_as::<_, JobRow>(
                    "SELECT * FROM job_batches ORDER BY created_at DESC LIMIT $1",
                )
                .bind(limit)
                .fetch_all(&pool)
                .await
            }
        })
        .await
    }

    pub async fn list_job_items(&self, job_id: Uuid, limit: i64) -> Result<Option<Vec<JobItemRow>>> {
        let pool = self.pool.clone();
        self.submit_degraded("list_job_items", move || {
            let pool = pool.clone();
            async move {
                sqlx::query_as::<_, JobItemRow>(
                    r#"
                    SELECT * FROM job_items
                    WHERE job_id = $1
                    ORDER BY updated_at DESC
                    LIMIT $2
                    "#,
                )
                .bind(job_id)
                .bind(limit)
                .fetch_all(&pool)
                .await
            }
        })
        .await
    }

    /// Status/stage projection for summary derivation (up to 5000 items).
    pub async fn job_items_brief(&self, job_id: Uuid) -> Result<Option<Vec<JobItemBrief>>> {
        let pool = self.pool.clone();
        self.submit_degraded("job_items_brief", move || {
            let pool = pool.clone();
            async move {
                sqlx::query_as::<_, JobItemBrief>(
                    r#"
                    SELECT status, stage, updated_at FROM job_items
                    WHERE job_id = $1
                    ORDER BY updated_at DESC
                    LIMIT 5000
                    "#,
                )
                .bind(job_id)
                .fetch_all(&pool)
                .await
            }
        })
        .await
    }

    pub async fn insert_job_items(&self, job_id: Uuid, targets: &[String]) -> Result<usize> {
        if targets.is_empty() {
            return Ok(0);
        }
        let pool = self.pool.clone();
        let targets = targets.to_vec();
        let count = targets.len();

        self.submit("insert_job_items", move || {
            let pool = pool.clone();
            let targets = targets.clone();
            async move {
                sqlx::query(
                    r#"
                    INSERT INTO job_items (job_id, target_id, status, stage)
                    SELECT $1, t, 'pending', 'init' FROM unnest($2::text[]) AS t
                    "#,
                )
                .bind(job_id)
                .bind(targets)
                .execute(&pool)
                .await
                .map(|_| ())
            }
        })
        .await?;

        Ok(count)
    }

    pub async fn mark_job_processing(&self, job_id: Uuid, total_count: Option<i32>) -> Result<()> {
        let pool = self.pool.clone();
        self.submit("mark_job_processing", move || {
            let pool = pool.clone();
            async move {
                sqlx::query(
                    r#"
                    UPDATE job_batches
                    SET status = 'processing',
                        total_count = COALESCE($2, total_count),
                        updated_at = now()
                    WHERE id = $1
                    "#,
                )
                .bind(job_id)
                .bind(total_count)
                .execute(&pool)
                .await
                .map(|_| ())
            }
        })
        .await
    }

    pub async fn set_job_heartbeat(&self, job_id: Uuid) -> Result<()> {
        let pool = self.pool.clone();
        self.submit("set_job_heartbeat", move || {
            let pool = pool.clone();
            async move {
                sqlx::query(
                    "UPDATE job_batches SET last_heartbeat_at = now(), updated_at = now() WHERE id = $1",
                )
                .bind(job_id)
                .execute(&pool)
                .await
                .map(|_| ())
            }
        })
        .await
    }

    /// Terminal header update used by the Pipeline B backend.
    pub async fn update_job_header(
        &self,
        job_id: Uuid,
        status: &str,
        processed: Option<i32>,
        success: Option<i32>,
        failed: Option<i32>,
        error_summary: Option<&str>,
    ) -> Result<()> {
        let pool = self.pool.clone();
        let status = status.to_string();
        let error_summary = error_summary.map(|s| s.chars().take(200).collect::<String>());

        self.submit("update_job_header", move || {
            let pool = pool.clone();
            let status = status.clone();
            let error_summary = error_summary.clone();
            async move {
                sqlx::query(
                    r#"
                    UPDATE job_batches
                    SET status = $2,
                        processed_count = COALESCE($3, processed_count),
                        success_count = COALESCE($4, success_count),
                        failed_count = COALESCE($5, failed_count),
                        error_summary = COALESCE($6, error_summary),
                        finished_at = CASE WHEN $2 IN ('completed', 'failed') THEN now() ELSE finished_at END,
                        updated_at = now()
                    WHERE id = $1
                    "#,
                )
                .bind(job_id)
                .bind(status)
                .bind(processed)
                .bind(success)
                .bind(failed)
                .bind(error_summary)
                .execute(&pool)
                .await
                .map(|_| ())
            }
        })
        .await
    }

    // --- Named claim/terminal functions ---

    pub async fn claim_job_item(
        &self,
        job_id: Uuid,
        worker_id: &str,
    ) -> Result<Option<JobItemRow>> {
        let pool = self.pool.clone();
        let worker_id = worker_id.to_string();
        self.submit("claim_job_item", move || {
            let pool = pool.clone();
            let worker_id = worker_id.clone();
            async move {
                sqlx::query_as::<_, JobItemRow>(
                    "SELECT * FROM claim_job_item($1, $2, $3)",
                )
                .bind(job_id)
                .bind(worker_id)
                .bind(LEASE_TTL_SECONDS)
                .fetch_optional(&pool)
                .await
            }
        })
        .await
    }

    pub async fn set_job_item_stage(&self, item_id: Uuid, stage: &str) -> Result<()> {
        let pool = self.pool.clone();
        let stage = stage.to_string();
        self.submit("set_job_item_stage", move || {
            let pool = pool.clone();
            let stage = stage.clone();
            async move {
                sqlx::query("SELECT set_job_item_stage($1, $2)")
                    .bind(item_id)
                    .bind(stage)
                    .execute(&pool)
                    .await
                    .map(|_| ())
            }
        })
        .await
    }

    pub async fn complete_job_item(
        &self,
        item_id: Uuid,
        result_post_id: Option<&str>,
    ) -> Result<()> {
        let pool = self.pool.clone();
        let result_post_id = result_post_id.map(String::from);
        self.submit("complete_job_item", move || {
            let pool = pool.clone();
            let result_post_id = result_post_id.clone();
            async move {
                sqlx::query("SELECT complete_job_item($1, $2)")
                    .bind(item_id)
                    .bind(result_post_id)
                    .execute(&pool)
                    .await
                    .map(|_| ())
            }
        })
        .await
    }

    pub async fn fail_job_item(&self, item_id: Uuid, stage: &str, error_log: &str) -> Result<()> {
        let pool = self.pool.clone();
        let stage = stage.to_string();
        let error_log = error_log.to_string();
        self.submit("fail_job_item", move || {
            let pool = pool.clone();
            let stage = stage.clone();
            let error_log = error_log.clone();
            async move {
                sqlx::query("SELECT fail_job_item($1, $2, $3)")
                    .bind(item_id)
                    .bind(stage)
                    .bind(error_log)
                    .execute(&pool)
                    .await
                    .map(|_| ())
            }
        })
        .await
    }

    pub async fn bump_job_counters(
        &self,
        job_id: Uuid,
        is_success: bool,
        is_failed: bool,
    ) -> Result<()> {
        debug_assert!(is_success != is_failed, "exactly one counter flag must be set");
        let pool = self.pool.clone();
        self.submit("bump_job_counters", move || {
            let pool = pool.clone();
            async move {
                sqlx::query("SELECT bump_job_counters($1, $2, $3)")
                    .bind(job_id)
                    .bind(is_success)
                    .bind(is_failed)
                    .execute(&pool)
                    .await
                    .map(|_| ())
            }
        })
        .await
    }

    pub async fn finalize_job_if_done(&self, job_id: Uuid) -> Result<()> {
        let pool = self.pool.clone();
        self.submit("finalize_job_if_done", move || {
            let pool = pool.clone();
            async move {
                sqlx::query("SELECT finalize_job_if_done($1)")
                    .bind(job_id)
                    .execute(&pool)
                    .await
                    .map(|_| ())
            }
        })
        .await
    }

    /// Heartbeat on the item row; optionally advances its stage.
    pub async fn touch_item(&self, item_id: Uuid, stage: Option<&str>) -> Result<()> {
        let pool = self.pool.clone();
        let stage = stage.map(String::from);
        self.submit("touch_item", move || {
            let pool = pool.clone();
            let stage = stage.clone();
            async move {
                sqlx::query(
                    r#"
                    UPDATE job_items
                    SET stage = COALESCE($2, stage),
                        lease_expires_at = now() + make_interval(secs => $3),
                        updated_at = now()
                    WHERE id = $1
                    "#,
                )
                .bind(item_id)
                .bind(stage)
                .bind(LEASE_TTL_SECONDS as f64)
                .execute(&pool)
                .await
                .map(|_| ())
            }
        })
        .await
    }

    /// Best-effort progressive item update keyed by (job_id, target). Inserts
    /// the row when the batch backend runs ahead of discovery. Only touches
    /// jobs this process has seen in job_batches.
    pub async fn progressive_item_update(
        &self,
        job_id: Uuid,
        target: &str,
        stage: &str,
        status: &str,
        result_post_id: Option<&str>,
        error: Option<&str>,
    ) {
        if !self.job_known(job_id) {
            match self.job_exists(job_id).await {
                Ok(true) => self.remember_job(job_id),
                _ => return,
            }
        }

        let error = error.map(|e| e.chars().take(500).collect::<String>());
        let pool = self.pool.clone();
        let target_s = target.to_string();
        let stage_s = stage.to_string();
        let status_s = status.to_string();
        let result_s = result_post_id.map(String::from);
        let error_s = error.clone();

        let result = self
            .submit("progressive_item_update", move || {
                let pool = pool.clone();
                let target = target_s.clone();
                let stage = stage_s.clone();
                let status = status_s.clone();
                let result_post_id = result_s.clone();
                let error = error_s.clone();
                async move {
                    let updated = sqlx::query(
                        r#"
                        UPDATE job_items
                        SET stage = $3,
                            status = $4,
                            result_post_id = COALESCE($5, result_post_id),
                            error_log = COALESCE($6, error_log),
                            updated_at = now()
                        WHERE job_id = $1 AND target_id = $2
                        "#,
                    )
                    .bind(job_id)
                    .bind(&target)
                    .bind(&stage)
                    .bind(&status)
                    .bind(&result_post_id)
                    .bind(&error)
                    .execute(&pool)
                    .await?;

                    if updated.rows_affected() == 0 {
                        sqlx::query(
                            r#"
                            INSERT INTO job_items
                                (job_id, target_id, status, stage, result_post_id, error_log)
                            VALUES ($1, $2, $3, $4, $5, $6)
                            "#,
                        )
                        .bind(job_id)
                        .bind(&target)
                        .bind(&status)
                        .bind(&stage)
                        .bind(&result_post_id)
                        .bind(&error)
                        .execute(&pool)
                        .await?;
                    }
                    Ok(())
                }
            })
            .await;

        if let Err(e) = result {
            warn!(%job_id, target, stage, error = %e, "Progressive item update failed (non-fatal)");
        }
    }

    pub async fn job_exists(&self, job_id: Uuid) -> Result<bool> {
        let pool = self.pool.clone();
        let found = self
            .submit_degraded("job_exists", move || {
                let pool = pool.clone();
                async move {
                    sqlx::query_scalar::<_, i64>(
                        "SELECT count(*) FROM job_batches WHERE id = $1",
                    )
                    .bind(job_id)
                    .fetch_one(&pool)
                    .await
                }
            })
            .await?;
        Ok(found.is_some_and(|n| n > 0))
    }

    /// Derived staleness: heartbeat older than 60s with work remaining.
    pub fn is_stale(last_heartbeat_at: Option<chrono::DateTime<Utc>>, processed: i64, total: i64) -> bool {
        match last_heartbeat_at {
            Some(hb) if total > 0 && processed < total => {
                (Utc::now() - hb).num_seconds() > 60
            }
            _ => false,
        }
    }
}
