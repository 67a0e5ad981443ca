//! The analysis artifact schema. Closed records; unknown upstream keys are
//! dropped at deserialization.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const ANALYSIS_VERSION: &str = "v4";
pub const ANALYSIS_VERSION_ALLOWLIST: [&str; 2] = ["v4", "v4.1"];

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Metrics {
    #[serde(default)]
    pub likes: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub views: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub replies: Option<i64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ToneProfile {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub primary: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cynicism: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hope: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub outrage: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SegmentSample {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub comment_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    #[serde(default)]
    pub text: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub likes: Option<i64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Segment {
    pub label: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub share: Option<f64>,
    #[serde(default)]
    pub samples: Vec<SegmentSample>,
    #[serde(default)]
    pub linguistic_features: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NarrativeStack {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub l1: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub l2: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub l3: Option<String>,
}

impl NarrativeStack {
    pub fn is_empty(&self) -> bool {
        self.l1.is_none() && self.l2.is_none() && self.l3.is_none()
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PhenomenonBlock {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    /// pending | matched | minted | failed
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ai_image: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DangerBlock {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bot_homogeneity_score: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PostBlock {
    pub post_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub author: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub link: Option<String>,
    #[serde(default)]
    pub images: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
    #[serde(default)]
    pub metrics: Metrics,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SummaryCompat {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub one_line: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub narrative_type: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BattlefieldCompat {
    #[serde(default)]
    pub factions: Vec<Segment>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisV4 {
    pub post: PostBlock,
    pub phenomenon: PhenomenonBlock,
    pub emotional_pulse: ToneProfile,
    #[serde(default)]
    pub segments: Vec<Segment>,
    pub narrative_stack: NarrativeStack,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub danger: Option<DangerBlock>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub full_report: Option<String>,
    // Compatibility blocks for existing UI adapters.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub summary: Option<SummaryCompat>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub battlefield: Option<BattlefieldCompat>,
    /// Optional evidence refs carried through from upstream payloads.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub evidence: Option<Value>,
    #[serde(default = "default_version")]
    pub analysis_version: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub analysis_build_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub missing_keys: Option<Vec<String>>,
}

fn default_version() -> String {
    ANALYSIS_VERSION.to_string()
}

impl Default for AnalysisV4 {
    fn default() -> Self {
        Self {
            post: PostBlock::default(),
            phenomenon: PhenomenonBlock::default(),
            emotional_pulse: ToneProfile::default(),
            segments: Vec::new(),
            narrative_stack: NarrativeStack::default(),
            danger: None,
            full_report: None,
            summary: None,
            battlefield: None,
            evidence: None,
            analysis_version: default_version(),
            analysis_build_id: None,
            missing_keys: None,
        }
    }
}
