//! The per-item pipeline state machine:
//! `init → fetch → vision? → analyst → store → completed|failed`.
//!
//! Vision is a soft stage; the analyst must succeed. An item completes only
//! when its post carries an analysis artifact or a full report.

use std::sync::Arc;

use serde_json::{json, Value};
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

use lens_analysis::{
    build_analysis_json, cluster_summary_json, protect_core_fields, validate_analysis,
    CommentMapper, CrawlerPost, EnrichmentJob, MappedComment, PhenomenonEnricher,
    ANALYSIS_VERSION,
};
use lens_common::{
    Analyst, FetchedPost, PostFetcher, Stage, TextEmbedder, VisionAnalyzer, VisionMode,
    VisionStageCap,
};
use lens_store::{AnalysisFields, ClusterMetadataUpdate, Store};

use crate::stage::StageReporter;
use crate::vision::run_vision_stage;

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("ingest produced no post id")]
    IngestNoPostId(#[source] anyhow::Error),

    #[error("post id not found; tried={0:?}")]
    PostIdNotFound(Vec<String>),

    #[error("analysis missing for post {0}")]
    AnalysisMissing(i64),

    #[error(transparent)]
    Runner(#[from] anyhow::Error),
}

impl PipelineError {
    /// Terminal error code recorded on the failed job item.
    pub fn code(&self) -> &'static str {
        match self {
            Self::IngestNoPostId(_) => "INGEST_NO_POST_ID",
            Self::PostIdNotFound(_) => "POST_ID_NOT_FOUND",
            Self::AnalysisMissing(_) => "ANALYSIS_MISSING",
            Self::Runner(_) => "RUNNER_ERROR",
        }
    }
}

/// Everything one pipeline run needs, constructed once at startup.
#[derive(Clone)]
pub struct RunnerDeps {
    pub store: Store,
    pub fetcher: Arc<dyn PostFetcher>,
    pub analyst: Arc<dyn Analyst>,
    pub vision: Arc<dyn VisionAnalyzer>,
    pub embedder: Arc<dyn TextEmbedder>,
    pub enricher: Arc<PhenomenonEnricher>,
    pub vision_mode: VisionMode,
    pub vision_stage_cap: VisionStageCap,
    pub persist_assignments: bool,
}

pub struct PipelineRunner {
    deps: RunnerDeps,
}

struct AnalystArtifacts {
    analysis_payload: Value,
    cluster_summary: Value,
}

impl PipelineRunner {
    pub fn new(deps: RunnerDeps) -> Self {
        Self { deps }
    }

    pub fn store(&self) -> &Store {
        &self.deps.store
    }

    /// Drive one target through the full pipeline. Returns the post row id.
    pub async fn run(
        &self,
        url: &str,
        ingest_source: &str,
        reporter: &dyn StageReporter,
    ) -> Result<i64, PipelineError> {
        let safe_url = url.split('?').next().unwrap_or(url);
        info!(url = safe_url, ingest_source, "Pipeline run starting");

        // fetch
        reporter.report(&Stage::Fetch).await;
        let (mut fetched, post_id, sync) = self.fetch_and_store(url, ingest_source).await?;

        // vision: soft stage, only when images are present at all.
        reporter.report(&Stage::Vision).await;
        if fetched.images.is_empty() {
            info!(post_id, "Vision skipped (no images)");
        } else {
            match run_vision_stage(
                &self.deps.store,
                self.deps.vision.as_ref(),
                post_id,
                &mut fetched,
                &self.deps.vision_mode,
                &self.deps.vision_stage_cap,
            )
            .await
            {
                Ok(stage_ran) => info!(post_id, stage_ran, "Vision stage done"),
                Err(e) => warn!(post_id, error = %e, "Vision stage failed (soft-fail)"),
            }
        }

        // analyst: must succeed for the item to complete.
        reporter.report(&Stage::Analyst).await;
        let artifacts = self
            .analyst_stage(post_id, &fetched, &sync.ids)
            .await
            .map_err(PipelineError::Runner)?;

        // An item may only complete once the post carries its analysis.
        let row = self
            .deps
            .store
            .get_post(post_id)
            .await
            .map_err(|e| PipelineError::Runner(e.into()))?
            .ok_or(PipelineError::AnalysisMissing(post_id))?;
        if !row.has_analysis() {
            return Err(PipelineError::AnalysisMissing(post_id));
        }

        // store: the bundle is already persisted; hand off enrichment
        // without blocking.
        reporter.report(&Stage::Store).await;
        let comments_json: Vec<Value> = fetched
            .comments
            .iter()
            .filter_map(|c| serde_json::to_value(c).ok())
            .collect();
        let images_json = row
            .images
            .as_array()
            .cloned()
            .unwrap_or_default();
        self.deps
            .enricher
            .submit(EnrichmentJob {
                post_id,
                analysis_payload: artifacts.analysis_payload,
                cluster_summary: artifacts.cluster_summary,
                comments: comments_json,
                post_text: fetched.post_text.clone(),
                images: images_json,
            })
            .await;

        info!(post_id, "Pipeline run complete");
        Ok(post_id)
    }

    /// Ingest-only run: fetch, upsert, comment sync, archive. No vision, no
    /// analyst.
    pub async fn ingest(&self, url: &str, ingest_source: &str) -> Result<i64, PipelineError> {
        let (_, post_id, _) = self.fetch_and_store(url, ingest_source).await?;
        Ok(post_id)
    }

    async fn fetch_and_store(
        &self,
        url: &str,
        ingest_source: &str,
    ) -> Result<(FetchedPost, i64, lens_store::CommentSync), PipelineError> {
        let fetched = self
            .deps
            .fetcher
            .fetch(url)
            .await
            .map_err(PipelineError::Runner)?;

        let post_id = self
            .deps
            .store
            .upsert_post(&fetched, Some(ingest_source))
            .await
            .map_err(|e| PipelineError::IngestNoPostId(e.into()))?;

        let sync = self.deps.store.sync_comments(post_id, &fetched.comments).await;
        if !sync.report.ok && !sync.report.skipped {
            warn!(post_id, error = ?sync.report.error, "Comment sync degraded (non-fatal)");
        }

        if let Some(html) = fetched.archive_html.clone() {
            let build_id = Uuid::new_v4().to_string();
            if let Err(e) = self
                .deps
                .store
                .update_post_archive(post_id, &build_id, &html, fetched.archive_dom_json.as_ref())
                .await
            {
                warn!(post_id, error = %e, "Archive write-back failed (non-fatal)");
            }
        }

        Ok((fetched, post_id, sync))
    }

    /// Quant mapping, LLM analysis, deterministic fusion, and the analysis
    /// write-back.
    async fn analyst_stage(
        &self,
        post_id: i64,
        fetched: &FetchedPost,
        comment_ids: &[String],
    ) -> anyhow::Result<AnalystArtifacts> {
        let mapped: Vec<MappedComment> = fetched
            .comments
            .iter()
            .zip(comment_ids)
            .map(|(c, id)| MappedComment {
                id: id.clone(),
                author_handle: c.author_handle.clone(),
                text: c.text.clone(),
                like_count: c.like_count,
            })
            .collect();

        let mapper = CommentMapper::new(Arc::clone(&self.deps.embedder));
        let quant = mapper.map(post_id, &mapped).await;

        let (mut cluster_summary, quant_summary) = match &quant {
            Some(map) => {
                let persistence = mapper
                    .persist(&self.deps.store, post_id, map, self.deps.persist_assignments)
                    .await;
                let summary = cluster_summary_json(&mapped, map);
                let quant_summary = json!({
                    "cluster_stats": map.cluster_stats,
                    "high_sim_pairs": map.high_sim_pairs,
                    "math_homogeneity": map.math_homogeneity,
                    "clusters_ref": {"k": map.clusters.len(), "n_clusters": map.n_clusters},
                    "persistence": persistence,
                });
                (summary, Some(quant_summary))
            }
            None => (json!({}), None),
        };

        let output = self
            .deps
            .analyst
            .analyze(fetched, &fetched.comments, Some(&cluster_summary))
            .await?;

        // Cluster insights from the LLM are merged into the summary and
        // written back onto the cluster rows.
        let insights = normalize_cluster_insights(output.llm_payload.get("Cluster_Insights"));
        if !insights.is_empty() {
            merge_cluster_insights(&mut cluster_summary, &insights);
            let updates: Vec<ClusterMetadataUpdate> = insights
                .iter()
                .map(|i| ClusterMetadataUpdate {
                    cluster_key: i.cluster_key,
                    label: i.label.clone(),
                    summary: i.summary.clone(),
                    tactics: i.tactics.clone(),
                    tactic_summary: i.tactic_summary.clone(),
                })
                .collect();
            self.deps
                .store
                .update_cluster_metadata(post_id, &updates)
                .await;
        }

        // Ground truth for fusion is the stored row, not the LLM.
        let row = self
            .deps
            .store
            .get_post(post_id)
            .await?
            .ok_or_else(|| anyhow::anyhow!("post {post_id} vanished before analyst write"))?;

        let crawler = CrawlerPost {
            post_id: post_id.to_string(),
            author: row.author.clone(),
            text: row.post_text.clone(),
            url: Some(row.url.clone()),
            images: row.images.as_array().cloned().unwrap_or_default(),
            timestamp: Some(row.captured_at),
            like_count: Some(row.like_count),
            view_count: Some(row.view_count),
            reply_count: Some(row.reply_count),
        };

        let analysis = build_analysis_json(
            &crawler,
            &output.llm_payload,
            Some(&cluster_summary),
            Some(&output.full_report),
        );
        let mut analysis = protect_core_fields(&crawler, analysis);
        let (is_valid, invalid_reason, missing_keys) = validate_analysis(&analysis);

        analysis.analysis_version = ANALYSIS_VERSION.to_string();
        let build_id = Uuid::new_v4().to_string();
        analysis.analysis_build_id = Some(build_id.clone());
        if !missing_keys.is_empty() {
            analysis.missing_keys = Some(missing_keys.clone());
        }

        let analysis_payload = serde_json::to_value(&analysis)?;
        self.deps
            .store
            .update_analysis_fields(
                post_id,
                AnalysisFields {
                    analysis_json: Some(analysis_payload.clone()),
                    analysis_is_valid: Some(is_valid),
                    analysis_invalid_reason: (!invalid_reason.is_empty())
                        .then_some(invalid_reason.clone()),
                    analysis_missing_keys: (!missing_keys.is_empty())
                        .then(|| json!(missing_keys)),
                    analysis_version: Some(ANALYSIS_VERSION.to_string()),
                    analysis_build_id: Some(build_id),
                    full_report: Some(output.full_report.clone()),
                    ai_tags: Some(output.ai_tags.clone()),
                    quant_summary,
                    cluster_summary: Some(cluster_summary.clone()),
                },
            )
            .await?;

        info!(post_id, is_valid, "Analyst stage wrote analysis bundle");
        Ok(AnalystArtifacts {
            analysis_payload,
            cluster_summary,
        })
    }
}

/// One cluster-level insight from the LLM payload.
#[derive(Debug, Clone, Default)]
pub struct ClusterInsight {
    pub cluster_key: i32,
    pub label: Option<String>,
    pub summary: Option<String>,
    pub tactics: Option<Vec<String>>,
    pub tactic_summary: Option<String>,
}

/// Accept both the list form and a key-indexed map form.
pub fn normalize_cluster_insights(raw: Option<&Value>) -> Vec<ClusterInsight> {
    let Some(raw) = raw else {
        return Vec::new();
    };

    let items: Vec<&Value> = if let Some(arr) = raw.as_array() {
        arr.iter().collect()
    } else if let Some(obj) = raw.as_object() {
        obj.values().collect()
    } else {
        return Vec::new();
    };

    items
        .into_iter()
        .filter_map(|item| {
            let key = item.get("cluster_key")?.as_i64()? as i32;
            let tactics = item.get("tactics").and_then(Value::as_array).map(|arr| {
                arr.iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect::<Vec<_>>()
            });
            Some(ClusterInsight {
                cluster_key: key,
                label: item.get("label").and_then(Value::as_str).map(str::to_string),
                summary: item.get("summary").and_then(Value::as_str).map(str::to_string),
                tactics,
                tactic_summary: item
                    .get("tactic_summary")
                    .and_then(Value::as_str)
                    .map(str::to_string),
            })
        })
        .collect()
}

/// Fold insight labels/summaries/tactics into the stored cluster summary.
pub fn merge_cluster_insights(summary: &mut Value, insights: &[ClusterInsight]) {
    let Some(clusters) = summary.get_mut("clusters").and_then(Value::as_object_mut) else {
        return;
    };
    for insight in insights {
        let Some(entry) = clusters.get_mut(&insight.cluster_key.to_string()) else {
            continue;
        };
        if let Some(label) = &insight.label {
            entry["name"] = json!(label);
            entry["label"] = json!(label);
        }
        if let Some(s) = &insight.summary {
            entry["summary"] = json!(s);
        }
        if let Some(t) = &insight.tactics {
            entry["tactics"] = json!(t);
        }
        if let Some(ts) = &insight.tactic_summary {
            entry["tactic_summary"] = json!(ts);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_codes_map_to_terminal_names() {
        assert_eq!(
            PipelineError::IngestNoPostId(anyhow::anyhow!("x")).code(),
            "INGEST_NO_POST_ID"
        );
        assert_eq!(
            PipelineError::PostIdNotFound(vec![]).code(),
            "POST_ID_NOT_FOUND"
        );
        assert_eq!(PipelineError::AnalysisMissing(1).code(), "ANALYSIS_MISSING");
        assert_eq!(
            PipelineError::Runner(anyhow::anyhow!("boom")).code(),
            "RUNNER_ERROR"
        );
    }

    #[test]
    fn insights_parse_from_list_and_map() {
        let list = json!([
            {"cluster_key": 0, "label": "skeptics", "tactics": ["sarcasm"]},
            {"cluster_key": 1, "summary": "supportive"},
            {"label": "missing key ignored"},
        ]);
        let parsed = normalize_cluster_insights(Some(&list));
        assert_eq!(parsed.len(), 2);
        assert_eq!(parsed[0].label.as_deref(), Some("skeptics"));

        let map = json!({"0": {"cluster_key": 0, "label": "a"}});
        assert_eq!(normalize_cluster_insights(Some(&map)).len(), 1);
    }

    #[test]
    fn merge_updates_matching_clusters_only() {
        let mut summary = json!({
            "clusters": {
                "0": {"count": 3, "samples": []},
                "1": {"count": 1, "samples": []},
            },
            "noise": {"count": 0},
        });
        let insights = vec![
            ClusterInsight {
                cluster_key: 0,
                label: Some("framers".to_string()),
                summary: Some("reframing the premise".to_string()),
                ..Default::default()
            },
            ClusterInsight {
                cluster_key: 9,
                label: Some("nobody".to_string()),
                ..Default::default()
            },
        ];
        merge_cluster_insights(&mut summary, &insights);
        assert_eq!(summary["clusters"]["0"]["label"], "framers");
        assert_eq!(summary["clusters"]["0"]["summary"], "reframing the premise");
        assert!(summary["clusters"]["1"].get("label").is_none());
    }
}
