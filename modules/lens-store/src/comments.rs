//! Comment source-of-truth sync, cluster persistence, and comment reads.

use std::collections::HashMap;

use serde::Serialize;
use serde_json::{json, Value};
use tracing::{info, warn};

use lens_common::ids::comment_identity;
use lens_common::RawComment;

use crate::error::Result;
use crate::rows::{CommentClusterRow, CommentRow};
use crate::Store;

const CHUNK: usize = 200;

/// Outcome of one persistence sub-operation. Never fatal to the caller.
#[derive(Debug, Clone, Serialize)]
pub struct OpReport {
    pub ok: bool,
    pub count: usize,
    pub skipped: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl OpReport {
    pub fn ok(count: usize) -> Self {
        Self { ok: true, count, skipped: false, error: None }
    }

    pub fn skipped(reason: Option<&str>) -> Self {
        Self {
            ok: false,
            count: 0,
            skipped: true,
            error: reason.map(String::from),
        }
    }

    pub fn failed(error: String, count: usize) -> Self {
        Self { ok: false, count, skipped: false, error: Some(error) }
    }
}

/// One cluster as handed to upsert_comment_clusters.
#[derive(Debug, Clone, Serialize)]
pub struct ClusterPayload {
    pub cluster_key: i32,
    pub label: String,
    pub summary: Option<String>,
    pub size: i32,
    pub keywords: Vec<String>,
    pub top_comment_ids: Vec<String>,
    pub centroid_embedding: Option<Vec<f32>>,
}

/// One assignment as handed to set_comment_cluster_assignments.
#[derive(Debug, Clone, Serialize)]
pub struct ClusterAssignment {
    pub comment_id: String,
    pub cluster_key: i32,
    pub cluster_label: Option<String>,
    pub cluster_id: Option<String>,
}

/// Result of a comment sync: the persistence report plus the row id chosen
/// for each input comment (same order), for downstream quant references.
#[derive(Debug, Clone)]
pub struct CommentSync {
    pub report: OpReport,
    pub ids: Vec<String>,
}

/// Label/summary/tactics write-back keyed by (post_id, cluster_key).
#[derive(Debug, Clone, Default)]
pub struct ClusterMetadataUpdate {
    pub cluster_key: i32,
    pub label: Option<String>,
    pub summary: Option<String>,
    pub tactics: Option<Vec<String>>,
    pub tactic_summary: Option<String>,
}

impl Store {
    /// Upsert scraped comments into threads_comments with hybrid identity.
    /// A prior row mapped by (post_id, source_comment_id) keeps its id.
    pub async fn sync_comments(&self, post_id: i64, comments: &[RawComment]) -> CommentSync {
        if comments.is_empty() {
            return CommentSync {
                report: OpReport::ok(0),
                ids: Vec::new(),
            };
        }

        let source_ids: Vec<String> = comments
            .iter()
            .filter_map(|c| c.source_comment_id.clone())
            .filter(|s| !s.is_empty())
            .collect();

        let existing_by_source = match self.existing_ids_by_source(post_id, &source_ids).await {
            Ok(map) => map,
            Err(e) => {
                warn!(post_id, error = %e, "Existing comment id lookup failed");
                HashMap::new()
            }
        };

        let post_id_str = post_id.to_string();
        let ids: Vec<String> = comments
            .iter()
            .map(|c| {
                c.source_comment_id
                    .as_deref()
                    .and_then(|src| existing_by_source.get(src).cloned())
                    .unwrap_or_else(|| comment_identity(&post_id_str, c))
            })
            .collect();

        // Duplicate scraped comments collapse onto one id; keep the last so
        // a single upsert statement never touches the same row twice.
        let mut row_by_id: std::collections::BTreeMap<&str, Value> = std::collections::BTreeMap::new();
        for (c, id) in comments.iter().zip(&ids) {
            row_by_id.insert(
                id.as_str(),
                json!({
                    "id": id,
                    "source_comment_id": c.source_comment_id,
                    "parent_source_comment_id": c.parent_source_comment_id,
                    "author_handle": c.author_handle,
                    "author_id": c.author_id,
                    "text": c.text,
                    "like_count": c.like_count,
                    "reply_count": c.reply_count,
                    "created_at": c.created_at,
                    "raw_json": serde_json::to_value(c).unwrap_or(Value::Null),
                }),
            );
        }
        let rows: Vec<Value> = row_by_id.into_values().collect();

        let mut total = 0usize;
        for chunk in rows.chunks(CHUNK) {
            let payload = Value::Array(chunk.to_vec());
            let pool = self.pool.clone();
            let result = self
                .submit("sync_comments", move || {
                    let pool = pool.clone();
                    let payload = payload.clone();
                    async move {
                        sqlx::query(
                            r#"
                            INSERT INTO threads_comments
                                (id, post_id, source_comment_id, parent_source_comment_id,
                                 author_handle, author_id, text, like_count, reply_count,
                                 created_at, captured_at, raw_json, updated_at)
                            SELECT r.id, $1, r.source_comment_id, r.parent_source_comment_id,
                                   r.author_handle, r.author_id, r.text,
                                   COALESCE(r.like_count, 0), COALESCE(r.reply_count, 0),
                                   r.created_at, now(), r.raw_json, now()
                            FROM jsonb_to_recordset($2) AS r(
                                id TEXT, source_comment_id TEXT, parent_source_comment_id TEXT,
                                author_handle TEXT, author_id TEXT, text TEXT,
                                like_count BIGINT, reply_count BIGINT,
                                created_at TIMESTAMPTZ, raw_json JSONB)
                            ON CONFLICT (id) DO UPDATE
                            SET text = EXCLUDED.text,
                                like_count = EXCLUDED.like_count,
                                reply_count = EXCLUDED.reply_count,
                                source_comment_id = COALESCE(EXCLUDED.source_comment_id, threads_comments.source_comment_id),
                                parent_source_comment_id = COALESCE(EXCLUDED.parent_source_comment_id, threads_comments.parent_source_comment_id),
                                raw_json = EXCLUDED.raw_json,
                                captured_at = now(),
                                updated_at = now()
                            "#,
                        )
                        .bind(post_id)
                        .bind(&payload)
                        .execute(&pool)
                        .await
                        .map(|_| ())
                    }
                })
                .await;

            match result {
                Ok(()) => total += chunk.len(),
                Err(e) => {
                    warn!(post_id, error = %e, "Comment sync chunk failed");
                    return CommentSync {
                        report: OpReport::failed(e.to_string(), total),
                        ids,
                    };
                }
            }
        }

        info!(post_id, upserted = total, "Comments synced");
        CommentSync {
            report: OpReport::ok(total),
            ids,
        }
    }

    async fn existing_ids_by_source(
        &self,
        post_id: i64,
        source_ids: &[String],
    ) -> Result<HashMap<String, String>> {
        let mut existing = HashMap::new();
        for chunk in source_ids.chunks(CHUNK) {
            let pool = self.pool.clone();
            let chunk_vec = chunk.to_vec();
            let rows = self
                .submit_degraded("existing_ids_by_source", move || {
                    let pool = pool.clone();
                    let chunk = chunk_vec.clone();
                    async move {
                        sqlx::query_as::<_, (String, String)>(
                            r#"
                            SELECT id, source_comment_id FROM threads_comments
                            WHERE post_id = $1 AND source_comment_id = ANY($2)
                            "#,
                        )
                        .bind(post_id)
                        .bind(chunk)
                        .fetch_all(&pool)
                        .await
                    }
                })
                .await?;
            for (id, src) in rows.unwrap_or_default() {
                existing.insert(src, id);
            }
        }
        Ok(existing)
    }

    /// Set-based cluster upsert through the named store function.
    pub async fn upsert_comment_clusters(
        &self,
        post_id: i64,
        clusters: &[ClusterPayload],
    ) -> OpReport {
        if clusters.is_empty() {
            return OpReport::skipped(None);
        }
        let payload = match serde_json::to_value(clusters) {
            Ok(v) => v,
            Err(e) => return OpReport::failed(e.to_string(), 0),
        };

        let pool = self.pool.clone();
        let result = self
            .submit("upsert_comment_clusters", move || {
                let pool = pool.clone();
                let payload = payload.clone();
                async move {
                    sqlx::query("SELECT upsert_comment_clusters($1, $2)")
                        .bind(post_id)
                        .bind(&payload)
                        .execute(&pool)
                        .await
                        .map(|_| ())
                }
            })
            .await;

        match result {
            Ok(()) => {
                info!(post_id, clusters = clusters.len(), "Cluster upsert");
                OpReport::ok(clusters.len())
            }
            Err(e) => {
                warn!(post_id, error = %e, "Cluster upsert failed");
                OpReport::failed(e.to_string(), 0)
            }
        }
    }

    /// Idempotent assignment write-back through the named store function.
    pub async fn set_comment_cluster_assignments(
        &self,
        post_id: i64,
        assignments: &[ClusterAssignment],
    ) -> OpReport {
        if assignments.is_empty() {
            return OpReport::skipped(None);
        }
        let payload = match serde_json::to_value(assignments) {
            Ok(v) => v,
            Err(e) => return OpReport::failed(e.to_string(), 0),
        };

        let pool = self.pool.clone();
        let result = self
            .submit("set_comment_cluster_assignments", move || {
                let pool = pool.clone();
                let payload = payload.clone();
                async move {
                    sqlx::query("SELECT set_comment_cluster_assignments($1, $2)")
                        .bind(post_id)
                        .bind(&payload)
                        .execute(&pool)
                        .await
                        .map(|_| ())
                }
            })
            .await;

        match result {
            Ok(()) => {
                info!(post_id, assignments = assignments.len(), "Cluster assignments applied");
                OpReport::ok(assignments.len())
            }
            Err(e) => {
                warn!(post_id, error = %e, "Cluster assignment write-back failed");
                OpReport::failed(e.to_string(), 0)
            }
        }
    }

    /// Idempotent metadata write-back; missing clusters are logged and
    /// counted, never fatal. Returns (ok, updated_count).
    pub async fn update_cluster_metadata(
        &self,
        post_id: i64,
        updates: &[ClusterMetadataUpdate],
    ) -> (bool, usize) {
        if updates.is_empty() {
            return (true, 0);
        }

        let mut updated = 0usize;
        let mut missing = 0usize;
        for u in updates {
            let pool = self.pool.clone();
            let cluster_key = u.cluster_key;
            let label = u.label.clone();
            let summary = u.summary.clone();
            let tactics = u.tactics.as_ref().and_then(|t| serde_json::to_value(t).ok());
            let tactic_summary = u.tactic_summary.clone();

            let result = self
                .submit("update_cluster_metadata", move || {
                    let pool = pool.clone();
                    let label = label.clone();
                    let summary = summary.clone();
                    let tactics = tactics.clone();
                    let tactic_summary = tactic_summary.clone();
                    async move {
                        sqlx::query(
                            r#"
                            UPDATE threads_comment_clusters
                            SET label = COALESCE($3, label),
                                summary = COALESCE($4, summary),
                                tactics = COALESCE($5, tactics),
                                tactic_summary = COALESCE($6, tactic_summary),
                                updated_at = now()
                            WHERE post_id = $1 AND cluster_key = $2
                            "#,
                        )
                        .bind(post_id)
                        .bind(cluster_key)
                        .bind(&label)
                        .bind(&summary)
                        .bind(&tactics)
                        .bind(&tactic_summary)
                        .execute(&pool)
                        .await
                        .map(|r| r.rows_affected())
                    }
                })
                .await;

            match result {
                Ok(0) => {
                    missing += 1;
                    warn!(post_id, cluster_key, "Metadata update for missing cluster");
                }
                Ok(n) => updated += n as usize,
                Err(e) => {
                    warn!(post_id, cluster_key, error = %e, "Cluster metadata update failed");
                }
            }
        }

        info!(
            post_id,
            clusters_attempted = updates.len(),
            clusters_updated_ok = updated,
            missing_clusters = missing,
            "Cluster metadata write-back"
        );
        (missing == 0 || updated > 0, updated)
    }

    pub async fn clusters_for_post(&self, post_id: i64) -> Result<Vec<CommentClusterRow>> {
        let pool = self.pool.clone();
        let rows = self
            .submit_degraded("clusters_for_post", move || {
                let pool = pool.clone();
                async move {
                    sqlx::query_as::<_, CommentClusterRow>(
                        r#"
                        SELECT * FROM threads_comment_clusters
                        WHERE post_id = $1
                        ORDER BY cluster_key ASC
                        "#,
                    )
                    .bind(post_id)
                    .fetch_all(&pool)
                    .await
                }
            })
            .await?;
        Ok(rows.unwrap_or_default())
    }

    pub async fn comments_by_post(
        &self,
        post_id: i64,
        limit: i64,
        offset: i64,
        sort_by_likes: bool,
    ) -> Result<Option<Vec<CommentRow>>> {
        let pool = self.pool.clone();
        let order = if sort_by_likes {
            "like_count DESC, captured_at DESC"
        } else {
            "created_at DESC NULLS LAST, captured_at DESC"
        };
        let sql = format!(
            "SELECT * FROM threads_comments WHERE post_id = $1 ORDER BY {order} LIMIT $2 OFFSET $3"
        );

        self.submit_degraded("comments_by_post", move || {
            let pool = pool.clone();
            let sql = sql.clone();
            async move {
                sqlx::query_as::<_, CommentRow>(sqlx::AssertSqlSafe(sql))
                    .bind(post_id)
                    .bind(limit)
                    .bind(offset)
                    .fetch_all(&pool)
                    .await
            }
        })
        .await
    }

    pub async fn comments_search(
        &self,
        q: Option<&str>,
        author_handle: Option<&str>,
        post_id: Option<i64>,
        limit: i64,
    ) -> Result<Option<Vec<CommentRow>>> {
        let pool = self.pool.clone();
        let q = q.map(String::from);
        let author_handle = author_handle.map(String::from);

        self.submit_degraded("comments_search", move || {
            let pool = pool.clone();
            let q = q.clone();
            let author_handle = author_handle.clone();
            async move {
                sqlx::query_as::<_, CommentRow>(
                    r#"
                    SELECT * FROM threads_comments
                    WHERE ($1::text IS NULL OR text ILIKE '%' || $1 || '%')
                      AND ($2::text IS NULL OR author_handle = $2)
                      AND ($3::bigint IS NULL OR post_id = $3)
                    ORDER BY captured_at DESC
                    LIMIT $4
                    "#,
                )
                .bind(&q)
                .bind(&author_handle)
                .bind(post_id)
                .bind(limit)
                .fetch_all(&pool)
                .await
            }
        })
        .await
    }

    /// Posts whose raw_comments never landed in threads_comments (backfill).
    pub async fn posts_missing_comment_rows(&self, limit: i64) -> Result<Vec<(i64, Value)>> {
        let pool = self.pool.clone();
        let rows = self
            .submit_degraded("posts_missing_comment_rows", move || {
                let pool = pool.clone();
                async move {
                    sqlx::query_as::<_, (i64, Value)>(
                        r#"
                        SELECT p.id, p.raw_comments FROM threads_posts p
                        WHERE jsonb_array_length(p.raw_comments) > 0
                          AND NOT EXISTS (
                              SELECT 1 FROM threads_comments c WHERE c.post_id = p.id
                          )
                        ORDER BY p.created_at DESC
                        LIMIT $1
                        "#,
                    )
                    .bind(limit)
                    .fetch_all(&pool)
                    .await
                }
            })
            .await?;
        Ok(rows.unwrap_or_default())
    }
}
