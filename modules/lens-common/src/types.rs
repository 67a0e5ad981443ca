use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Declares a closed string-backed enum with a reserved `Other` variant.
/// Unknown values coming back from the store are coerced, logged, and kept
/// as their raw string so they round-trip unchanged.
macro_rules! wire_enum {
    ($(#[$meta:meta])* $name:ident { $($variant:ident => $wire:literal),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
        #[serde(into = "String", from = "String")]
        pub enum $name {
            $($variant,)+
            Other(String),
        }

        impl $name {
            pub fn parse(s: &str) -> Self {
                match s {
                    $($wire => Self::$variant,)+
                    other => {
                        tracing::warn!(value = other, kind = stringify!($name), "Unknown wire value, coercing");
                        Self::Other(other.to_string())
                    }
                }
            }

            pub fn as_str(&self) -> &str {
                match self {
                    $(Self::$variant => $wire,)+
                    Self::Other(s) => s.as_str(),
                }
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self::parse(&s)
            }
        }

        impl From<$name> for String {
            fn from(v: $name) -> String {
                v.as_str().to_string()
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(self.as_str())
            }
        }
    };
}

wire_enum! {
    /// Job flavor: A = single URL, B = keyword batch, C = home-feed sample.
    PipelineType {
        A => "A",
        B => "B",
        C => "C",
    }
}

wire_enum! {
    JobMode {
        Ingest => "ingest",
        Analyze => "analyze",
        Full => "full",
        Preview => "preview",
        Run => "run",
    }
}

wire_enum! {
    JobStatus {
        Discovering => "discovering",
        Processing => "processing",
        Completed => "completed",
        Failed => "failed",
        Stale => "stale",
    }
}

wire_enum! {
    ItemStatus {
        Pending => "pending",
        Processing => "processing",
        Completed => "completed",
        Failed => "failed",
    }
}

wire_enum! {
    /// Per-item pipeline stage, in execution order.
    Stage {
        Init => "init",
        Fetch => "fetch",
        Vision => "vision",
        Analyst => "analyst",
        Store => "store",
        Completed => "completed",
        Failed => "failed",
    }
}

wire_enum! {
    PhenomenonStatus {
        Pending => "pending",
        Provisional => "provisional",
        Matched => "matched",
        Minted => "minted",
        Active => "active",
        Failed => "failed",
    }
}

impl PhenomenonStatus {
    /// Whether the enricher is allowed to overwrite this status on a post.
    pub fn is_patchable(&self) -> bool {
        matches!(self, Self::Pending | Self::Failed | Self::Provisional)
    }
}

wire_enum! {
    EnrichmentStatus {
        Processing => "processing",
        Completed => "completed",
        Failed => "failed",
    }
}

wire_enum! {
    VisionMode {
        Off => "off",
        Auto => "auto",
        Force => "force",
    }
}

wire_enum! {
    VisionStageCap {
        V1 => "v1",
        V2 => "v2",
        Auto => "auto",
    }
}

wire_enum! {
    ReprocessPolicy {
        SkipIfExists => "skip_if_exists",
        ForceIfKeywordHit => "force_if_keyword_hit",
        ForceAll => "force_all",
    }
}

impl ReprocessPolicy {
    pub fn should_reprocess(&self, keyword_hit: bool) -> bool {
        match self {
            Self::ForceAll => true,
            Self::ForceIfKeywordHit => keyword_hit,
            _ => false,
        }
    }
}

/// Engagement counters as the crawler reports them.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PostMetrics {
    #[serde(default)]
    pub likes: i64,
    #[serde(default)]
    pub views: i64,
    #[serde(default)]
    pub reply_count: i64,
    #[serde(default)]
    pub repost_count: i64,
    #[serde(default)]
    pub share_count: i64,
}

/// One image attached to a post. Vision enrichment fills the optional fields.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ImageRecord {
    pub src: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub original_src: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub proxy_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scene_label: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub full_text: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context_desc: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub visual_rhetoric: Option<String>,
}

impl ImageRecord {
    /// Best remote URL for downloading the image bytes.
    pub fn remote_src(&self) -> &str {
        self.original_src
            .as_deref()
            .filter(|s| !s.is_empty())
            .unwrap_or(&self.src)
    }
}

/// One comment as scraped, before identity assignment.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RawComment {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_comment_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_source_comment_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub author_handle: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub author_id: Option<String>,
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub like_count: i64,
    #[serde(default)]
    pub reply_count: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
}

/// The scraper's parsed output for one post URL.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FetchedPost {
    pub url: String,
    pub author: String,
    pub post_text: String,
    #[serde(default)]
    pub post_text_raw: String,
    #[serde(default)]
    pub metrics: PostMetrics,
    #[serde(default)]
    pub images: Vec<ImageRecord>,
    #[serde(default)]
    pub comments: Vec<RawComment>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub archive_html: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub archive_dom_json: Option<serde_json::Value>,
    #[serde(default)]
    pub is_first_thread: bool,
}

/// A post surfaced by keyword discovery, before ingest.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoveredPost {
    pub url: String,
    #[serde(default)]
    pub like_count: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub snippet: Option<String>,
}

/// Cheap vision classification of a single image (stage V1).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VisionV1 {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    #[serde(default)]
    pub has_text: bool,
    #[serde(default)]
    pub is_screenshot: bool,
    /// "low" | "medium" | "high"
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text_density: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
}

impl VisionV1 {
    /// V2 is worth running when the image plausibly carries readable text.
    pub fn warrants_v2(&self) -> bool {
        self.has_text
            || self.is_screenshot
            || matches!(
                self.text_density.as_deref().map(str::to_ascii_lowercase).as_deref(),
                Some("medium") | Some("high")
            )
    }
}

/// Deep vision extraction of a single image (stage V2).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VisionV2 {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scene_label: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub extracted_text: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context_desc: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub visual_rhetoric: Option<String>,
}

/// What the analyst LLM hands back for one post.
#[derive(Debug, Clone, Default)]
pub struct AnalystOutput {
    /// Structured payload (tone, layers, battlefield, summary, danger...).
    pub llm_payload: serde_json::Value,
    /// Long-form markdown report.
    pub full_report: String,
    /// Quantifiable tags lifted out of the structured payload.
    pub ai_tags: serde_json::Value,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_enum_round_trips_known_values() {
        assert_eq!(Stage::parse("analyst"), Stage::Analyst);
        assert_eq!(Stage::Analyst.as_str(), "analyst");
        assert_eq!(JobStatus::parse("stale"), JobStatus::Stale);
    }

    #[test]
    fn unknown_wire_value_coerces_to_other_and_round_trips() {
        let v = ItemStatus::parse("paused");
        assert_eq!(v, ItemStatus::Other("paused".to_string()));
        assert_eq!(v.as_str(), "paused");
    }

    #[test]
    fn phenomenon_patchability() {
        assert!(PhenomenonStatus::Pending.is_patchable());
        assert!(PhenomenonStatus::Provisional.is_patchable());
        assert!(PhenomenonStatus::Failed.is_patchable());
        assert!(!PhenomenonStatus::Matched.is_patchable());
        assert!(!PhenomenonStatus::Active.is_patchable());
    }

    #[test]
    fn reprocess_policy_matrix() {
        assert!(ReprocessPolicy::ForceAll.should_reprocess(false));
        assert!(ReprocessPolicy::ForceIfKeywordHit.should_reprocess(true));
        assert!(!ReprocessPolicy::ForceIfKeywordHit.should_reprocess(false));
        assert!(!ReprocessPolicy::SkipIfExists.should_reprocess(true));
    }
}
