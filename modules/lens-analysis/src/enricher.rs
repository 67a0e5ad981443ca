//! Post-analysis phenomenon enrichment: deterministic match-or-mint against
//! the narrative registry, with a guarded write-back onto the post.
//!
//! Never blocks the pipeline: callers submit and move on. Inline mode runs
//! the job on the caller's task; otherwise it is dispatched to a small
//! bounded pool.

use std::sync::Arc;

use serde_json::{json, Value};
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};
use uuid::Uuid;

use lens_common::{AppConfig, PhenomenonStatus, TextEmbedder};
use lens_store::Store;

use crate::fingerprint::{
    build_evidence_bundle, EvidenceBundle, FINGERPRINT_VERSION, MATCH_RULESET_VERSION,
    NAMESPACE_UUID, REGISTRY_VERSION,
};

const ENRICH_POOL_SIZE: usize = 2;
const EMBED_DIM: usize = 768;

#[derive(Debug, Clone)]
pub struct EnricherConfig {
    pub enabled: bool,
    pub run_inline: bool,
    pub match_threshold: f64,
    pub match_topk: i64,
}

impl EnricherConfig {
    pub fn from_app(config: &AppConfig) -> Self {
        Self {
            enabled: config.enrichment_enabled,
            run_inline: config.enrich_inline,
            match_threshold: config.match_threshold,
            match_topk: config.match_topk,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PhenomenonMatchResult {
    pub phenomenon_id: Uuid,
    /// matched | minted
    pub status: PhenomenonStatus,
    pub decision: &'static str,
    pub confidence: f64,
    pub ruleset_version: &'static str,
    pub case_id: String,
}

/// Everything the enricher needs for one post, captured at submit time.
#[derive(Debug, Clone)]
pub struct EnrichmentJob {
    pub post_id: i64,
    pub analysis_payload: Value,
    pub cluster_summary: Value,
    pub comments: Vec<Value>,
    pub post_text: String,
    pub images: Vec<Value>,
}

pub struct PhenomenonEnricher {
    store: Store,
    embedder: Arc<dyn TextEmbedder>,
    config: EnricherConfig,
    pool: Arc<Semaphore>,
}

impl PhenomenonEnricher {
    pub fn new(store: Store, embedder: Arc<dyn TextEmbedder>, config: EnricherConfig) -> Arc<Self> {
        info!(
            enabled = config.enabled,
            inline = config.run_inline,
            threshold = config.match_threshold,
            topk = config.match_topk,
            "Phenomenon enricher ready"
        );
        Arc::new(Self {
            store,
            embedder,
            config,
            pool: Arc::new(Semaphore::new(ENRICH_POOL_SIZE)),
        })
    }

    /// Submit one post for enrichment. Returns immediately unless inline
    /// mode is on; either way the caller never sees enrichment errors.
    pub async fn submit(self: &Arc<Self>, job: EnrichmentJob) {
        if !self.config.enabled {
            debug!(post_id = job.post_id, "Enrichment skipped (disabled)");
            return;
        }

        if let Err(e) = self.store.mark_enrichment_processing(job.post_id).await {
            warn!(post_id = job.post_id, error = %e, "Failed to mark enrichment processing");
        }

        if self.config.run_inline {
            self.run_safe(job).await;
        } else {
            let this = Arc::clone(self);
            let permit = Arc::clone(&self.pool).acquire_owned().await.ok();
            tokio::spawn(async move {
                let _permit = permit;
                this.run_safe(job).await;
            });
        }
    }

    async fn run_safe(&self, job: EnrichmentJob) {
        let post_id = job.post_id;
        match self.run(job).await {
            Ok(()) => {
                if let Err(e) = self.store.mark_enrichment_completed(post_id).await {
                    warn!(post_id, error = %e, "Failed to mark enrichment completed");
                }
            }
            Err(e) => {
                warn!(post_id, error = %e, "Enrichment job failed");
                if let Err(mark_err) = self
                    .store
                    .mark_enrichment_failed(post_id, &e.to_string())
                    .await
                {
                    warn!(post_id, error = %mark_err, "Failed to mark enrichment failed");
                }
            }
        }
    }

    async fn run(&self, mut job: EnrichmentJob) -> anyhow::Result<()> {
        let bundle = build_evidence_bundle(
            &job.post_text,
            None,
            &job.comments,
            Some(&job.cluster_summary),
            &job.images,
        );

        let (result, embedding) = self.match_or_mint(&bundle).await?;
        self.patch_analysis(&mut job, &result, &bundle, &embedding)
            .await?;
        Ok(())
    }

    /// Compute the fingerprint embedding and resolve identity: reuse the best
    /// registry candidate above threshold, else mint the deterministic id.
    async fn match_or_mint(
        &self,
        bundle: &EvidenceBundle,
    ) -> anyhow::Result<(PhenomenonMatchResult, Vec<f32>)> {
        let embedding = self.embedder.embed(&bundle.fingerprint).await?;
        if embedding.len() != EMBED_DIM {
            // Operator-visible deployment error, not a soft fallback.
            anyhow::bail!(
                "registry embedding dim mismatch: expected {EMBED_DIM}, got {}",
                embedding.len()
            );
        }

        let deterministic_id = Uuid::new_v5(&NAMESPACE_UUID, bundle.fingerprint.as_bytes());

        let best = match self
            .store
            .match_phenomena(&embedding, self.config.match_threshold, self.config.match_topk)
            .await
        {
            Ok(candidates) => candidates.into_iter().next().map(|c| (c.id, c.similarity)),
            Err(e) => {
                warn!(error = %e, "Vector match failed; falling back to mint");
                None
            }
        };

        let result = resolve_match(best, self.config.match_threshold, deterministic_id, &bundle.case_id);
        info!(
            phenomenon_id = %result.phenomenon_id,
            decision = result.decision,
            confidence = result.confidence,
            "Match-or-mint resolved"
        );
        Ok((result, embedding))
    }

    /// Patch the post and upsert the registry. Already-finalized phenomena
    /// on the post are left untouched (and the registry is not re-counted).
    async fn patch_analysis(
        &self,
        job: &mut EnrichmentJob,
        result: &PhenomenonMatchResult,
        bundle: &EvidenceBundle,
        embedding: &[f32],
    ) -> anyhow::Result<()> {
        let phen_block = job
            .analysis_payload
            .get("phenomenon")
            .cloned()
            .filter(Value::is_object)
            .unwrap_or_else(|| json!({}));
        let existing_id = phen_block.get("id").and_then(Value::as_str).unwrap_or("");
        let existing_status = PhenomenonStatus::parse(
            phen_block
                .get("status")
                .and_then(Value::as_str)
                .unwrap_or("pending"),
        );
        if !existing_id.is_empty() && !existing_status.is_patchable() {
            info!(
                post_id = job.post_id,
                existing_id, "Skip patch; phenomenon already finalized"
            );
            return Ok(());
        }

        let mut phen_block = phen_block;
        phen_block["id"] = json!(result.phenomenon_id.to_string());
        phen_block["status"] = json!(result.status.as_str());

        let payload = &mut job.analysis_payload;
        payload["phenomenon"] = phen_block.clone();
        payload["phenomenon_status"] = json!(result.status.as_str());
        payload["phenomenon_case_id"] = json!(result.case_id);
        payload["match_ruleset_version"] = json!(MATCH_RULESET_VERSION);
        payload["fingerprint_version"] = json!(FINGERPRINT_VERSION);
        payload["registry_version"] = json!(REGISTRY_VERSION);

        self.store
            .patch_post_phenomenon(
                job.post_id,
                payload,
                result.phenomenon_id,
                result.status.as_str(),
                &result.case_id,
            )
            .await?;
        info!(
            post_id = job.post_id,
            phenomenon_id = %result.phenomenon_id,
            status = %result.status,
            "Patched phenomenon identity"
        );

        let id_str = result.phenomenon_id.to_string();
        let short_id = &id_str[..8];
        let canonical_name = phen_block
            .get("name")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| format!("MINTED_{short_id}"));
        let description = phen_block
            .get("description")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| "(auto) pending governance".to_string());

        self.store
            .upsert_phenomenon(
                result.phenomenon_id,
                &canonical_name,
                &description,
                result.status.as_str(),
                embedding,
                &bundle.case_id,
            )
            .await?;

        // Occurrence accounting must exist; failing silently here would let
        // counts drift from the posts that reference them.
        self.store
            .increment_occurrence(result.phenomenon_id)
            .await
            .map_err(|e| {
                anyhow::anyhow!(
                    "increment_occurrence failed: {e}. Ensure the store function is deployed and the role can execute it"
                )
            })?;

        Ok(())
    }
}

/// Pure decision rule: candidate above threshold wins, else mint.
fn resolve_match(
    best: Option<(Uuid, f64)>,
    threshold: f64,
    deterministic_id: Uuid,
    case_id: &str,
) -> PhenomenonMatchResult {
    match best {
        Some((id, similarity)) if similarity >= threshold => PhenomenonMatchResult {
            phenomenon_id: id,
            status: PhenomenonStatus::Matched,
            decision: "MATCH_EXISTING",
            confidence: similarity * 100.0,
            ruleset_version: MATCH_RULESET_VERSION,
            case_id: case_id.to_string(),
        },
        _ => PhenomenonMatchResult {
            phenomenon_id: deterministic_id,
            status: PhenomenonStatus::Minted,
            decision: "MINT_NEW",
            confidence: 100.0,
            ruleset_version: MATCH_RULESET_VERSION,
            case_id: case_id.to_string(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minted_id_is_deterministic_per_fingerprint() {
        let a = Uuid::new_v5(&NAMESPACE_UUID, b"TRIGGER:\nhello\n\nARTIFACT:\n\n\nREACTIONS:\n");
        let b = Uuid::new_v5(&NAMESPACE_UUID, b"TRIGGER:\nhello\n\nARTIFACT:\n\n\nREACTIONS:\n");
        let c = Uuid::new_v5(&NAMESPACE_UUID, b"TRIGGER:\nother\n\nARTIFACT:\n\n\nREACTIONS:\n");
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn candidate_above_threshold_matches() {
        let candidate = Uuid::new_v4();
        let minted = Uuid::new_v4();
        let r = resolve_match(Some((candidate, 0.91)), 0.86, minted, "case");
        assert_eq!(r.phenomenon_id, candidate);
        assert_eq!(r.status, PhenomenonStatus::Matched);
        assert_eq!(r.decision, "MATCH_EXISTING");
        assert!((r.confidence - 91.0).abs() < 1e-9);
    }

    #[test]
    fn candidate_below_threshold_mints() {
        let candidate = Uuid::new_v4();
        let minted = Uuid::new_v4();
        let r = resolve_match(Some((candidate, 0.80)), 0.86, minted, "case");
        assert_eq!(r.phenomenon_id, minted);
        assert_eq!(r.status, PhenomenonStatus::Minted);
        assert_eq!(r.confidence, 100.0);
    }

    #[test]
    fn empty_registry_mints() {
        let minted = Uuid::new_v4();
        let r = resolve_match(None, 0.86, minted, "case");
        assert_eq!(r.phenomenon_id, minted);
        assert_eq!(r.decision, "MINT_NEW");
    }
}
