//! threads_posts operations: ingest upsert, analysis/vision/archive
//! write-backs, enrichment bookkeeping, and read projections.

use std::collections::HashMap;

use serde_json::Value;
use uuid::Uuid;

use lens_common::FetchedPost;

use crate::error::Result;
use crate::rows::{PostListRow, PostRow};
use crate::Store;

const IN_CHUNK: usize = 200;

/// Analyst write-back. Only present fields are written.
#[derive(Debug, Clone, Default)]
pub struct AnalysisFields {
    pub analysis_json: Option<Value>,
    pub analysis_is_valid: Option<bool>,
    pub analysis_invalid_reason: Option<String>,
    pub analysis_missing_keys: Option<Value>,
    pub analysis_version: Option<String>,
    pub analysis_build_id: Option<String>,
    pub full_report: Option<String>,
    pub ai_tags: Option<Value>,
    pub quant_summary: Option<Value>,
    pub cluster_summary: Option<Value>,
}

impl Store {
    /// Upsert one scraped post by canonical URL and return its row id.
    pub async fn upsert_post(&self, post: &FetchedPost, ingest_source: Option<&str>) -> Result<i64> {
        let pool = self.pool.clone();
        let url = post.url.clone();
        let author = post.author.clone();
        let post_text = post.post_text.clone();
        let post_text_raw = post.post_text_raw.clone();
        let metrics = post.metrics.clone();
        let reply_count = post.comments.len() as i64;
        let images = serde_json::to_value(&post.images)?;
        let raw_comments = serde_json::to_value(&post.comments)?;
        let ingest_source = ingest_source.map(String::from);
        let is_first_thread = post.is_first_thread;

        self.submit("upsert_post", move || {
            let pool = pool.clone();
            let url = url.clone();
            let author = author.clone();
            let post_text = post_text.clone();
            let post_text_raw = post_text_raw.clone();
            let metrics = metrics.clone();
            let images = images.clone();
            let raw_comments = raw_comments.clone();
            let ingest_source = ingest_source.clone();
            async move {
                sqlx::query_scalar::<_, i64>(
                    r#"
                    INSERT INTO threads_posts
                        (url, author, post_text, post_text_raw,
                         like_count, view_count, reply_count, reply_count_ui,
                         repost_count, share_count, images, raw_comments,
                         ingest_source, is_first_thread, captured_at, updated_at)
                    VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, now(), now())
                    ON CONFLICT (url) DO UPDATE
                    SET author = EXCLUDED.author,
                        post_text = EXCLUDED.post_text,
                        post_text_raw = EXCLUDED.post_text_raw,
                        like_count = EXCLUDED.like_count,
                        view_count = EXCLUDED.view_count,
                        reply_count = EXCLUDED.reply_count,
                        reply_count_ui = EXCLUDED.reply_count_ui,
                        repost_count = EXCLUDED.repost_count,
                        share_count = EXCLUDED.share_count,
                        images = EXCLUDED.images,
                        raw_comments = EXCLUDED.raw_comments,
                        ingest_source = EXCLUDED.ingest_source,
                        is_first_thread = EXCLUDED.is_first_thread,
                        captured_at = now(),
                        updated_at = now()
                    RETURNING id
                    "#,
                )
                .bind(&url)
                .bind(&author)
                .bind(&post_text)
                .bind(&post_text_raw)
                .bind(metrics.likes)
                .bind(metrics.views)
                .bind(reply_count)
                .bind(metrics.reply_count)
                .bind(metrics.repost_count)
                .bind(metrics.share_count)
                .bind(&images)
                .bind(&raw_comments)
                .bind(&ingest_source)
                .bind(is_first_thread)
                .fetch_one(&pool)
                .await
            }
        })
        .await
    }

    pub async fn get_post(&self, post_id: i64) -> Result<Option<PostRow>> {
        let pool = self.pool.clone();
        let row = self
            .submit_degraded("get_post", move || {
                let pool = pool.clone();
                async move {
                    sqlx::query_as::<_, PostRow>("SELECT * FROM threads_posts WHERE id = $1")
                        .bind(post_id)
                        .fetch_optional(&pool)
                        .await
                }
            })
            .await?;
        Ok(row.flatten())
    }

    pub async fn get_post_id_by_url(&self, url: &str) -> Result<Option<i64>> {
        let pool = self.pool.clone();
        let url = url.to_string();
        let row = self
            .submit_degraded("get_post_id_by_url", move || {
                let pool = pool.clone();
                let url = url.clone();
                async move {
                    sqlx::query_scalar::<_, i64>(
                        "SELECT id FROM threads_posts WHERE url = $1 LIMIT 1",
                    )
                    .bind(url)
                    .fetch_optional(&pool)
                    .await
                }
            })
            .await?;
        Ok(row.flatten())
    }

    /// Recovery fallback: match the trailing shortcode anywhere in the URL.
    pub async fn get_post_id_by_shortcode(&self, shortcode: &str) -> Result<Option<i64>> {
        let pool = self.pool.clone();
        let pattern = format!("%{shortcode}%");
        let row = self
            .submit_degraded("get_post_id_by_shortcode", move || {
                let pool = pool.clone();
                let pattern = pattern.clone();
                async move {
                    sqlx::query_scalar::<_, i64>(
                        "SELECT id FROM threads_posts WHERE url ILIKE $1 LIMIT 1",
                    )
                    .bind(pattern)
                    .fetch_optional(&pool)
                    .await
                }
            })
            .await?;
        Ok(row.flatten())
    }

    /// Map canonical URL -> existing post id, in chunks of 200.
    pub async fn fetch_existing_post_ids(&self, urls: &[String]) -> Result<HashMap<String, i64>> {
        let mut existing = HashMap::new();
        for chunk in urls.chunks(IN_CHUNK) {
            let pool = self.pool.clone();
            let chunk_vec = chunk.to_vec();
            let rows = self
                .submit_degraded("fetch_existing_post_ids", move || {
                    let pool = pool.clone();
                    let chunk = chunk_vec.clone();
                    async move {
                        sqlx::query_as::<_, (i64, String)>(
                            "SELECT id, url FROM threads_posts WHERE url = ANY($1)",
                        )
                        .bind(chunk)
                        .fetch_all(&pool)
                        .await
                    }
                })
                .await?;
            for (id, url) in rows.unwrap_or_default() {
                existing.insert(url, id);
            }
        }
        Ok(existing)
    }

    /// Recent analyzed posts for the list endpoint.
    pub async fn list_recent_posts(&self, limit: i64) -> Result<Option<Vec<PostListRow>>> {
        let pool = self.pool.clone();
        self.submit_degraded("list_recent_posts", move || {
            let pool = pool.clone();
            async move {
                sqlx::query_as::<_, PostListRow>(
                    r#"
                    SELECT id, url, author, post_text, like_count, view_count, reply_count,
                           images, analysis_json, analysis_is_valid,
                           phenomenon_id, phenomenon_status, phenomenon_case_id, created_at
                    FROM threads_posts
                    WHERE analysis_json IS NOT NULL
                       OR (full_report IS NOT NULL AND full_report <> '')
                    ORDER BY created_at DESC
                    LIMIT $1
                    "#,
                )
                .bind(limit)
                .fetch_all(&pool)
                .await
            }
        })
        .await
    }

    pub async fn posts_for_phenomenon(
        &self,
        phenomenon_id: &str,
        limit: i64,
    ) -> Result<Option<Vec<PostListRow>>> {
        let pool = self.pool.clone();
        let phenomenon_id = phenomenon_id.to_string();
        self.submit_degraded("posts_for_phenomenon", move || {
            let pool = pool.clone();
            let phenomenon_id = phenomenon_id.clone();
            async move {
                sqlx::query_as::<_, PostListRow>(
                    r#"
                    SELECT id, url, author, post_text, like_count, view_count, reply_count,
                           images, analysis_json, analysis_is_valid,
                           phenomenon_id, phenomenon_status, phenomenon_case_id, created_at
                    FROM threads_posts
                    WHERE phenomenon_id = $1
                    ORDER BY created_at DESC
                    LIMIT $2
                    "#,
                )
                .bind(phenomenon_id)
                .bind(limit)
                .fetch_all(&pool)
                .await
            }
        })
        .await
    }

    /// Write the analyst bundle. Absent fields keep their current values.
    pub async fn update_analysis_fields(&self, post_id: i64, fields: AnalysisFields) -> Result<()> {
        let pool = self.pool.clone();
        self.submit("update_analysis_fields", move || {
            let pool = pool.clone();
            let f = fields.clone();
            async move {
                sqlx::query(
                    r#"
                    UPDATE threads_posts
                    SET analysis_json = COALESCE($2, analysis_json),
                        analysis_is_valid = COALESCE($3, analysis_is_valid),
                        analysis_invalid_reason = CASE WHEN $3 IS NOT NULL THEN $4 ELSE analysis_invalid_reason END,
                        analysis_missing_keys = CASE WHEN $3 IS NOT NULL THEN $5 ELSE analysis_missing_keys END,
                        analysis_version = COALESCE($6, analysis_version),
                        analysis_build_id = COALESCE($7, analysis_build_id),
                        full_report = COALESCE($8, full_report),
                        ai_tags = COALESCE($9, ai_tags),
                        quant_summary = COALESCE($10, quant_summary),
                        cluster_summary = COALESCE($11, cluster_summary),
                        updated_at = now()
                    WHERE id = $1
                    "#,
                )
                .bind(post_id)
                .bind(&f.analysis_json)
                .bind(f.analysis_is_valid)
                .bind(&f.analysis_invalid_reason)
                .bind(&f.analysis_missing_keys)
                .bind(&f.analysis_version)
                .bind(&f.analysis_build_id)
                .bind(&f.full_report)
                .bind(&f.ai_tags)
                .bind(&f.quant_summary)
                .bind(&f.cluster_summary)
                .execute(&pool)
                .await
                .map(|_| ())
            }
        })
        .await
    }

    /// Unified vision write-back, optionally replacing the images array.
    pub async fn update_vision_meta(
        &self,
        post_id: i64,
        vision_fields: Value,
        images: Option<Value>,
    ) -> Result<()> {
        let pool = self.pool.clone();
        self.submit("update_vision_meta", move || {
            let pool = pool.clone();
            let v = vision_fields.clone();
            let images = images.clone();
            async move {
                sqlx::query(
                    r#"
                    UPDATE threads_posts
                    SET vision_mode = COALESCE($2->>'vision_mode', vision_mode),
                        vision_need_score = COALESCE(($2->>'vision_need_score')::float8, vision_need_score),
                        vision_reasons = COALESCE($2->'vision_reasons', vision_reasons),
                        vision_stage_ran = COALESCE($2->>'vision_stage_ran', vision_stage_ran),
                        vision_v1 = COALESCE($2->'vision_v1', vision_v1),
                        vision_v2 = COALESCE($2->'vision_v2', vision_v2),
                        vision_sim_post_comments = COALESCE(($2->>'vision_sim_post_comments')::float8, vision_sim_post_comments),
                        vision_metrics_reliable = COALESCE(($2->>'vision_metrics_reliable')::boolean, vision_metrics_reliable),
                        vision_updated_at = now(),
                        images = COALESCE($3, images),
                        updated_at = now()
                    WHERE id = $1
                    "#,
                )
                .bind(post_id)
                .bind(&v)
                .bind(&images)
                .execute(&pool)
                .await
                .map(|_| ())
            }
        })
        .await
    }

    /// Best-effort archive snapshot patch.
    pub async fn update_post_archive(
        &self,
        post_id: i64,
        build_id: &str,
        html: &str,
        dom_json: Option<&Value>,
    ) -> Result<()> {
        let pool = self.pool.clone();
        let build_id = build_id.to_string();
        let html = html.to_string();
        let dom_json = dom_json.cloned();
        self.submit("update_post_archive", move || {
            let pool = pool.clone();
            let build_id = build_id.clone();
            let html = html.clone();
            let dom_json = dom_json.clone();
            async move {
                sqlx::query(
                    r#"
                    UPDATE threads_posts
                    SET archive_html = $2,
                        archive_dom_json = $3,
                        archive_build_id = $4,
                        archive_captured_at = now(),
                        updated_at = now()
                    WHERE id = $1
                    "#,
                )
                .bind(post_id)
                .bind(html)
                .bind(dom_json)
                .bind(build_id)
                .execute(&pool)
                .await
                .map(|_| ())
            }
        })
        .await
    }

    // --- Enrichment bookkeeping ---

    pub async fn mark_enrichment_processing(&self, post_id: i64) -> Result<()> {
        let pool = self.pool.clone();
        self.submit("mark_enrichment_processing", move || {
            let pool = pool.clone();
            async move {
                sqlx::query(
                    r#"
                    UPDATE threads_posts
                    SET enrichment_status = 'processing',
                        enrichment_started_at = now(),
                        enrichment_last_error = NULL,
                        updated_at = now()
                    WHERE id = $1
                    "#,
                )
                .bind(post_id)
                .execute(&pool)
                .await
                .map(|_| ())
            }
        })
        .await
    }

    pub async fn mark_enrichment_completed(&self, post_id: i64) -> Result<()> {
        let pool = self.pool.clone();
        self.submit("mark_enrichment_completed", move || {
            let pool = pool.clone();
            async move {
                sqlx::query(
                    r#"
                    UPDATE threads_posts
                    SET enrichment_status = 'completed',
                        enrichment_completed_at = now(),
                        enrichment_last_error = NULL,
                        updated_at = now()
                    WHERE id = $1
                    "#,
                )
                .bind(post_id)
                .execute(&pool)
                .await
                .map(|_| ())
            }
        })
        .await
    }

    pub async fn mark_enrichment_failed(&self, post_id: i64, error: &str) -> Result<()> {
        let pool = self.pool.clone();
        let error: String = error.chars().take(2000).collect();
        self.submit("mark_enrichment_failed", move || {
            let pool = pool.clone();
            let error = error.clone();
            async move {
                sqlx::query(
                    r#"
                    UPDATE threads_posts
                    SET enrichment_status = 'failed',
                        enrichment_last_error = $2,
                        enrichment_retry_count = enrichment_retry_count + 1,
                        updated_at = now()
                    WHERE id = $1
                    "#,
                )
                .bind(post_id)
                .bind(error)
                .execute(&pool)
                .await
                .map(|_| ())
            }
        })
        .await
    }

    /// Registry-driven phenomenon patch: columns plus the analysis_json copy.
    pub async fn patch_post_phenomenon(
        &self,
        post_id: i64,
        analysis_json: &Value,
        phenomenon_id: Uuid,
        status: &str,
        case_id: &str,
    ) -> Result<()> {
        let pool = self.pool.clone();
        let analysis_json = analysis_json.clone();
        let status = status.to_string();
        let case_id = case_id.to_string();
        self.submit("patch_post_phenomenon", move || {
            let pool = pool.clone();
            let analysis_json = analysis_json.clone();
            let status = status.clone();
            let case_id = case_id.clone();
            async move {
                sqlx::query(
                    r#"
                    UPDATE threads_posts
                    SET analysis_json = $2,
                        phenomenon_id = $3,
                        phenomenon_status = $4,
                        phenomenon_case_id = $5,
                        updated_at = now()
                    WHERE id = $1
                    "#,
                )
                .bind(post_id)
                .bind(&analysis_json)
                .bind(phenomenon_id.to_string())
                .bind(&status)
                .bind(&case_id)
                .execute(&pool)
                .await
                .map(|_| ())
            }
        })
        .await
    }

    /// Per-phenomenon post aggregates for the library endpoints.
    pub async fn phenomenon_post_stats(
        &self,
    ) -> Result<HashMap<String, crate::rows::PhenomenonPostStats>> {
        let pool = self.pool.clone();
        let rows = self
            .submit_degraded("phenomenon_post_stats", move || {
                let pool = pool.clone();
                async move {
                    sqlx::query_as::<_, crate::rows::PhenomenonPostStats>(
                        r#"
                        SELECT phenomenon_id,
                               count(*) AS total_posts,
                               COALESCE(sum(like_count), 0)::bigint AS total_likes,
                               max(created_at) AS last_seen_at
                        FROM threads_posts
                        WHERE phenomenon_id IS NOT NULL
                        GROUP BY phenomenon_id
                        "#,
                    )
                    .fetch_all(&pool)
                    .await
                }
            })
            .await?;

        Ok(rows
            .unwrap_or_default()
            .into_iter()
            .map(|s| (s.phenomenon_id.clone(), s))
            .collect())
    }
}
