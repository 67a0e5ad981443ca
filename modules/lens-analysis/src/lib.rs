//! Analysis core: fingerprinting, comment structure mapping, phenomenon
//! match-or-mint, analysis fusion, and the vision gate.

pub mod builder;
pub mod enricher;
pub mod fingerprint;
pub mod quant;
pub mod schema;
pub mod vision_gate;

pub use builder::{build_analysis_json, protect_core_fields, validate_analysis, CrawlerPost};
pub use enricher::{EnricherConfig, EnrichmentJob, PhenomenonEnricher, PhenomenonMatchResult};
pub use fingerprint::{
    build_evidence_bundle, embedding_hash, normalize_text, EvidenceBundle, FINGERPRINT_VERSION,
    MATCH_RULESET_VERSION, NAMESPACE_UUID, REGISTRY_VERSION,
};
pub use quant::{cluster_summary_json, CommentMapper, MappedComment, StructureMap};
pub use schema::{AnalysisV4, ANALYSIS_VERSION};
pub use vision_gate::{GateMetrics, VisionGate, VisionGateDecision};

/// Cosine similarity for f32 embedding vectors.
pub(crate) fn cosine_similarity(a: &[f32], b: &[f32]) -> f64 {
    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    (dot / (norm_a * norm_b)) as f64
}
