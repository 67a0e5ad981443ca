use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use uuid::Uuid;

/// A row from the job_batches table.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct JobRow {
    pub id: Uuid,
    pub pipeline_type: String,
    pub mode: String,
    pub input_config: Value,
    pub status: String,
    pub total_count: i32,
    pub processed_count: i32,
    pub success_count: i32,
    pub failed_count: i32,
    pub error_summary: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub last_heartbeat_at: Option<DateTime<Utc>>,
}

/// A row from the job_items table.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct JobItemRow {
    pub id: Uuid,
    pub job_id: Uuid,
    pub target_id: String,
    pub status: String,
    pub stage: String,
    pub attempts: i32,
    pub worker_id: Option<String>,
    pub lease_expires_at: Option<DateTime<Utc>>,
    pub result_post_id: Option<String>,
    pub error_log: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Status/stage projection used by the summary endpoint.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct JobItemBrief {
    pub status: String,
    pub stage: String,
    pub updated_at: DateTime<Utc>,
}

/// The full threads_posts row.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct PostRow {
    pub id: i64,
    pub url: String,
    pub author: Option<String>,
    pub post_text: Option<String>,
    pub post_text_raw: Option<String>,
    pub like_count: i64,
    pub view_count: i64,
    pub reply_count: i64,
    pub reply_count_ui: i64,
    pub repost_count: i64,
    pub share_count: i64,
    pub images: Value,
    pub raw_comments: Value,
    pub cluster_summary: Option<Value>,
    pub analysis_json: Option<Value>,
    pub full_report: Option<String>,
    pub ai_tags: Option<Value>,
    pub quant_summary: Option<Value>,
    pub analysis_is_valid: Option<bool>,
    pub analysis_version: Option<String>,
    pub analysis_build_id: Option<String>,
    pub analysis_invalid_reason: Option<String>,
    pub analysis_missing_keys: Option<Value>,
    pub phenomenon_id: Option<String>,
    pub phenomenon_status: Option<String>,
    pub phenomenon_case_id: Option<String>,
    pub archive_html: Option<String>,
    pub archive_dom_json: Option<Value>,
    pub archive_captured_at: Option<DateTime<Utc>>,
    pub archive_build_id: Option<String>,
    pub vision_mode: Option<String>,
    pub vision_need_score: Option<f64>,
    pub vision_reasons: Option<Value>,
    pub vision_stage_ran: Option<String>,
    pub vision_v1: Option<Value>,
    pub vision_v2: Option<Value>,
    pub vision_sim_post_comments: Option<f64>,
    pub vision_metrics_reliable: Option<bool>,
    pub vision_updated_at: Option<DateTime<Utc>>,
    pub enrichment_status: Option<String>,
    pub enrichment_started_at: Option<DateTime<Utc>>,
    pub enrichment_completed_at: Option<DateTime<Utc>>,
    pub enrichment_retry_count: i32,
    pub enrichment_last_error: Option<String>,
    pub ingest_source: Option<String>,
    pub is_first_thread: bool,
    pub created_at: DateTime<Utc>,
    pub captured_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl PostRow {
    /// Completion gate: a finished item must point at a post that carries an
    /// analysis artifact or a non-empty report.
    pub fn has_analysis(&self) -> bool {
        self.analysis_json.is_some()
            || self
                .full_report
                .as_deref()
                .is_some_and(|r| !r.is_empty())
    }
}

/// Slim projection for the post list endpoint.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct PostListRow {
    pub id: i64,
    pub url: String,
    pub author: Option<String>,
    pub post_text: Option<String>,
    pub like_count: i64,
    pub view_count: i64,
    pub reply_count: i64,
    pub images: Value,
    pub analysis_json: Option<Value>,
    pub analysis_is_valid: Option<bool>,
    pub phenomenon_id: Option<String>,
    pub phenomenon_status: Option<String>,
    pub phenomenon_case_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// A row from threads_comments.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct CommentRow {
    pub id: String,
    pub post_id: i64,
    pub source_comment_id: Option<String>,
    pub parent_source_comment_id: Option<String>,
    pub author_handle: Option<String>,
    pub author_id: Option<String>,
    pub text: Option<String>,
    pub like_count: i64,
    pub reply_count: i64,
    pub created_at: Option<DateTime<Utc>>,
    pub captured_at: DateTime<Utc>,
    pub raw_json: Option<Value>,
    pub cluster_id: Option<String>,
    pub cluster_key: Option<i32>,
    pub updated_at: DateTime<Utc>,
}

/// A row from threads_comment_clusters.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct CommentClusterRow {
    pub post_id: i64,
    pub cluster_key: i32,
    pub label: Option<String>,
    pub summary: Option<String>,
    pub size: i32,
    pub keywords: Value,
    pub top_comment_ids: Value,
    pub centroid_embedding: Option<Value>,
    pub tactics: Option<Value>,
    pub tactic_summary: Option<String>,
    pub updated_at: DateTime<Utc>,
}

/// A registry row without the embedding payload.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct PhenomenonRow {
    pub id: Uuid,
    pub canonical_name: Option<String>,
    pub description: Option<String>,
    pub status: String,
    pub occurrence_count: i64,
    pub minted_by_case_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// One candidate from match_phenomena_v768.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct PhenomenonMatch {
    pub id: Uuid,
    pub canonical_name: Option<String>,
    pub description: Option<String>,
    pub status: String,
    pub similarity: f64,
}

/// Aggregated per-phenomenon post stats for the library endpoints.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct PhenomenonPostStats {
    pub phenomenon_id: String,
    pub total_posts: i64,
    pub total_likes: i64,
    pub last_seen_at: Option<DateTime<Utc>>,
}
