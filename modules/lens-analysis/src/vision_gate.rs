//! Regex-free vision gating: additive structural/impact/semantic scoring
//! decides whether image analysis is worth a model call.

use serde_json::{json, Value};
use tracing::info;

use lens_common::{RawComment, VisionMode};

use crate::cosine_similarity;

const DEFAULT_THRESHOLD: f64 = 2.0;
const SILENT_POST_CHARS: usize = 80;
const SHORT_COMMENT_AVG: f64 = 12.0;
const NONEMPTY_RATIO_FLOOR: f64 = 0.70;
const HIGH_VIEWS: i64 = 50_000;
const HIGH_LIKES: i64 = 300;
const HIGH_REPLIES: i64 = 120;
const DIVERGENCE_FLOOR: f64 = 0.30;

/// Engagement inputs. Impact scoring only applies when the crawler marked
/// the metrics reliable.
#[derive(Debug, Clone, Default)]
pub struct GateMetrics {
    pub view_count: i64,
    pub like_count: i64,
    pub reply_count: i64,
    pub metrics_reliable: bool,
}

#[derive(Debug, Clone)]
pub struct VisionGateDecision {
    pub run_v1: bool,
    pub score: f64,
    pub reasons: Vec<String>,
    pub metrics_reliable: bool,
    pub sim_post_comments: Option<f64>,
}

impl VisionGateDecision {
    /// Column payload for the vision write-back.
    pub fn to_db_fields(&self, vision_mode: &VisionMode, stage_ran: &str) -> Value {
        json!({
            "vision_mode": vision_mode.as_str(),
            "vision_need_score": self.score,
            "vision_reasons": self.reasons,
            "vision_stage_ran": stage_ran,
            "vision_sim_post_comments": self.sim_post_comments,
            "vision_metrics_reliable": self.metrics_reliable,
        })
    }
}

#[derive(Debug, Default)]
pub struct VisionGate;

impl VisionGate {
    pub fn new() -> Self {
        Self
    }

    #[allow(clippy::too_many_arguments)]
    pub fn evaluate(
        &self,
        post_id: &str,
        images_count: usize,
        post_text: &str,
        comments: &[RawComment],
        vision_mode: &VisionMode,
        metrics: &GateMetrics,
        post_embedding: Option<&[f32]>,
        top_comment_embeddings: &[Vec<f32>],
    ) -> VisionGateDecision {
        let metrics_reliable = metrics.metrics_reliable;

        // Hard gates.
        if matches!(vision_mode, VisionMode::Off) || images_count == 0 {
            info!(post_id, mode = %vision_mode, images = images_count, "VisionGate decision=SKIP");
            return VisionGateDecision {
                run_v1: false,
                score: 0.0,
                reasons: vec!["NoImagesOrOff".to_string()],
                metrics_reliable,
                sim_post_comments: None,
            };
        }
        if matches!(vision_mode, VisionMode::Force) {
            info!(post_id, "VisionGate decision=FORCE");
            return VisionGateDecision {
                run_v1: true,
                score: 999.0,
                reasons: vec!["ForceMode".to_string()],
                metrics_reliable,
                sim_post_comments: None,
            };
        }

        let mut score = 0.0;
        let mut reasons: Vec<String> = Vec::new();

        // W1: silent post with images.
        if post_text.trim().chars().count() < SILENT_POST_CHARS {
            score += 2.0;
            reasons.push(format!("SilentPost(<{SILENT_POST_CHARS})"));
        }

        // W2: comment poverty.
        let texts: Vec<&str> = comments.iter().map(|c| c.text.trim()).collect();
        let nonempty: Vec<&&str> = texts.iter().filter(|t| !t.is_empty()).collect();
        if !nonempty.is_empty() {
            let avg_len = nonempty.iter().map(|t| t.chars().count()).sum::<usize>() as f64
                / nonempty.len() as f64;
            let nonempty_ratio = nonempty.len() as f64 / texts.len().max(1) as f64;
            if avg_len < SHORT_COMMENT_AVG {
                score += 1.0;
                reasons.push(format!("ShortComments(avg<{SHORT_COMMENT_AVG})"));
            }
            if nonempty_ratio < NONEMPTY_RATIO_FLOOR {
                score += 0.5;
                reasons.push("ManyEmptyComments(<70% nonempty)".to_string());
            }
        } else {
            score += 1.0;
            reasons.push("NoReadableComments".to_string());
        }

        // W3: impact, only when reliable.
        if metrics_reliable
            && (metrics.view_count > HIGH_VIEWS
                || metrics.like_count > HIGH_LIKES
                || metrics.reply_count > HIGH_REPLIES)
        {
            score += 1.5;
            reasons.push("HighImpact".to_string());
        }

        // W4: semantic divergence between post and top comments.
        let mut sim = None;
        if let Some(post_emb) = post_embedding {
            if !top_comment_embeddings.is_empty() {
                let mean = mean_vec(top_comment_embeddings);
                let s = cosine_similarity(post_emb, &mean);
                sim = Some(s);
                if s < DIVERGENCE_FLOOR {
                    score += 2.0;
                    reasons.push(format!("SemanticDivergence(sim<{DIVERGENCE_FLOOR:.2})"));
                }
            }
        }

        let run_v1 = score >= DEFAULT_THRESHOLD;
        info!(
            post_id,
            score,
            run_v1,
            reasons = ?reasons,
            sim = ?sim,
            "VisionGate evaluated"
        );
        VisionGateDecision {
            run_v1,
            score,
            reasons,
            metrics_reliable,
            sim_post_comments: sim,
        }
    }
}

fn mean_vec(vecs: &[Vec<f32>]) -> Vec<f32> {
    let dim = vecs[0].len();
    let mut out = vec![0.0f32; dim];
    for v in vecs {
        for (o, x) in out.iter_mut().zip(v) {
            *o += x;
        }
    }
    let n = vecs.len() as f32;
    for o in &mut out {
        *o /= n;
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn comment(text: &str) -> RawComment {
        RawComment {
            text: text.to_string(),
            ..Default::default()
        }
    }

    fn gate() -> VisionGate {
        VisionGate::new()
    }

    #[test]
    fn off_mode_and_zero_images_skip() {
        let d = gate().evaluate(
            "p", 3, "", &[], &VisionMode::Off, &GateMetrics::default(), None, &[],
        );
        assert!(!d.run_v1);
        assert_eq!(d.reasons, vec!["NoImagesOrOff"]);

        let d = gate().evaluate(
            "p", 0, "", &[], &VisionMode::Auto, &GateMetrics::default(), None, &[],
        );
        assert!(!d.run_v1);
    }

    #[test]
    fn force_mode_always_runs() {
        let d = gate().evaluate(
            "p", 1, "long text ".repeat(20).as_str(), &[], &VisionMode::Force,
            &GateMetrics::default(), None, &[],
        );
        assert!(d.run_v1);
        assert_eq!(d.score, 999.0);
    }

    #[test]
    fn silent_post_with_no_comments_crosses_threshold() {
        let d = gate().evaluate(
            "p", 1, "short", &[], &VisionMode::Auto, &GateMetrics::default(), None, &[],
        );
        // SilentPost(+2.0) + NoReadableComments(+1.0)
        assert_eq!(d.score, 3.0);
        assert!(d.run_v1);
    }

    #[test]
    fn long_post_with_rich_comments_skips() {
        let text = "a detailed multi sentence post that easily exceeds the eighty character silence threshold for gating";
        let comments: Vec<RawComment> = (0..40)
            .map(|i| comment(&format!("a substantive reply with plenty of characters {i}")))
            .collect();
        let d = gate().evaluate(
            "p", 1, text, &comments, &VisionMode::Auto, &GateMetrics::default(), None, &[],
        );
        assert!(d.score < 2.0);
        assert!(!d.run_v1);
    }

    #[test]
    fn impact_requires_reliable_metrics() {
        let text = "a detailed multi sentence post that easily exceeds the eighty character silence threshold for gating";
        let comments: Vec<RawComment> = (0..10)
            .map(|i| comment(&format!("a substantive reply with plenty of characters {i}")))
            .collect();
        let unreliable = GateMetrics {
            view_count: 100_000,
            metrics_reliable: false,
            ..Default::default()
        };
        let d = gate().evaluate(
            "p", 1, text, &comments, &VisionMode::Auto, &unreliable, None, &[],
        );
        assert!(!d.reasons.iter().any(|r| r == "HighImpact"));

        let reliable = GateMetrics {
            view_count: 100_000,
            metrics_reliable: true,
            ..Default::default()
        };
        let d = gate().evaluate(
            "p", 1, text, &comments, &VisionMode::Auto, &reliable, None, &[],
        );
        assert!(d.reasons.iter().any(|r| r == "HighImpact"));
    }

    #[test]
    fn semantic_divergence_adds_two() {
        let text = "a detailed multi sentence post that easily exceeds the eighty character silence threshold for gating";
        let comments: Vec<RawComment> = (0..10)
            .map(|i| comment(&format!("a substantive reply with plenty of characters {i}")))
            .collect();
        let post_emb = vec![1.0f32, 0.0, 0.0];
        let comment_embs = vec![vec![0.0f32, 1.0, 0.0]];
        let d = gate().evaluate(
            "p", 1, text, &comments, &VisionMode::Auto, &GateMetrics::default(),
            Some(&post_emb), &comment_embs,
        );
        assert_eq!(d.score, 2.0);
        assert!(d.run_v1);
        assert_eq!(d.sim_post_comments, Some(0.0));
    }

    #[test]
    fn db_fields_carry_stage_and_mode() {
        let d = gate().evaluate(
            "p", 1, "short", &[], &VisionMode::Auto, &GateMetrics::default(), None, &[],
        );
        let fields = d.to_db_fields(&VisionMode::Auto, "v1");
        assert_eq!(fields["vision_mode"], "auto");
        assert_eq!(fields["vision_stage_ran"], "v1");
        assert_eq!(fields["vision_need_score"], 3.0);
    }
}
