//! Deterministic fusion of crawler row, LLM payload, and cluster data into a
//! validated analysis artifact. Crawler-authoritative protection lives here
//! and nowhere else.

use chrono::{DateTime, Utc};
use regex::RegexBuilder;
use serde_json::Value;
use tracing::warn;

use crate::schema::*;

/// Crawler-side inputs for one post, already ground truth.
#[derive(Debug, Clone, Default)]
pub struct CrawlerPost {
    pub post_id: String,
    pub author: Option<String>,
    pub text: Option<String>,
    pub url: Option<String>,
    pub images: Vec<Value>,
    pub timestamp: Option<DateTime<Utc>>,
    pub like_count: Option<i64>,
    pub view_count: Option<i64>,
    pub reply_count: Option<i64>,
}

fn coerce_int(val: Option<&Value>) -> Option<i64> {
    let v = val?;
    let n = v
        .as_i64()
        .or_else(|| v.as_f64().map(|f| f as i64))
        .or_else(|| v.as_str().and_then(|s| s.trim().parse::<i64>().ok()))?;
    Some(n.max(0))
}

/// Shares arrive as fractions or percentages; normalize into [0, 1].
fn clamp_fraction(val: Option<&Value>) -> Option<f64> {
    let v = val?;
    let mut f = v
        .as_f64()
        .or_else(|| v.as_str().and_then(|s| s.trim().parse::<f64>().ok()))?;
    if f > 1.0 && f <= 100.0 {
        f /= 100.0;
    }
    Some(f.clamp(0.0, 1.0))
}

fn build_metrics(crawler: &CrawlerPost, llm: &Value) -> Metrics {
    let llm_stats = llm.get("Post_Stats");

    let mut likes = crawler.like_count;
    let mut views = crawler.view_count;
    let mut replies = crawler.reply_count;

    // LLM stats fill gaps only when the crawler saw nothing.
    if let Some(stats) = llm_stats {
        if likes.is_none() {
            likes = coerce_int(stats.get("Likes"));
        }
        if views.is_none() {
            views = coerce_int(stats.get("Views"));
        }
        if replies.is_none() {
            replies = coerce_int(stats.get("Replies"));
        }

        if let (Some(crawler_likes), Some(llm_likes)) = (crawler.like_count, coerce_int(stats.get("Likes"))) {
            let divergence = (llm_likes - crawler_likes).abs();
            if divergence as f64 > (crawler_likes as f64 * 0.5).max(100.0) {
                warn!(
                    post_id = %crawler.post_id,
                    crawler_likes,
                    llm_likes,
                    "LLM likes diverge from crawler likes, keeping crawler value"
                );
            }
        }
    }

    Metrics {
        likes: likes.unwrap_or(0),
        views,
        replies,
    }
}

fn sanitize_images(raw: &[Value]) -> Vec<String> {
    raw.iter()
        .filter_map(|img| {
            if let Some(s) = img.as_str() {
                return Some(s.to_string());
            }
            ["src", "proxy_url", "original_src"]
                .iter()
                .find_map(|k| img.get(*k).and_then(Value::as_str))
                .map(str::to_string)
        })
        .collect()
}

fn build_post_block(crawler: &CrawlerPost, metrics: Metrics) -> PostBlock {
    PostBlock {
        post_id: crawler.post_id.clone(),
        author: crawler.author.clone(),
        text: crawler.text.clone(),
        link: crawler.url.clone(),
        images: sanitize_images(&crawler.images),
        timestamp: crawler.timestamp,
        metrics,
    }
}

fn build_phenomenon(llm: &Value) -> PhenomenonBlock {
    // Identity is registry-owned; the LLM contributes descriptive text only.
    let discovery = llm.get("Discovery_Channel");
    let summary = llm.get("summary");

    let description = discovery
        .and_then(|d| {
            d.get("Phenomenon_Description")
                .or_else(|| d.get("description"))
                .and_then(Value::as_str)
        })
        .or_else(|| summary.and_then(|s| s.get("one_line").and_then(Value::as_str)))
        .map(str::to_string);

    let ai_image = llm
        .get("visuals")
        .and_then(|v| {
            v.get("ai_image")
                .or_else(|| v.get("image_url"))
                .and_then(Value::as_str)
        })
        .map(str::to_string);

    PhenomenonBlock {
        id: None,
        status: None,
        name: None,
        description,
        ai_image,
    }
}

fn build_tone(llm: &Value) -> ToneProfile {
    let tone = ["Tone_Fingerprint", "L2_Tone_Fingerprint", "Tone", "tone", "emotional_pulse"]
        .iter()
        .find_map(|k| llm.get(*k).filter(|v| v.is_object()));

    let Some(tone) = tone else {
        return ToneProfile::default();
    };

    let score = |key: &str| -> Option<f64> {
        let capitalized = {
            let mut chars = key.chars();
            match chars.next() {
                Some(c) => c.to_uppercase().collect::<String>() + chars.as_str(),
                None => String::new(),
            }
        };
        clamp_fraction(tone.get(key).or_else(|| tone.get(capitalized.as_str())))
    };

    ToneProfile {
        primary: tone.get("primary").and_then(Value::as_str).map(str::to_string),
        cynicism: score("cynicism"),
        hope: score("hope"),
        outrage: score("anger").or_else(|| score("outrage")),
        notes: tone.get("notes").and_then(Value::as_str).map(str::to_string),
    }
}

fn samples_from_list(raw: Option<&Value>) -> Vec<SegmentSample> {
    raw.and_then(Value::as_array)
        .map(|arr| {
            arr.iter()
                .filter(|s| s.is_object())
                .map(|s| SegmentSample {
                    comment_id: s
                        .get("id")
                        .filter(|v| !v.is_null())
                        .map(|v| match v {
                            Value::String(s) => s.clone(),
                            other => other.to_string(),
                        }),
                    user: s
                        .get("user")
                        .or_else(|| s.get("author_handle"))
                        .and_then(Value::as_str)
                        .map(str::to_string),
                    text: s
                        .get("text")
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .trim()
                        .to_string(),
                    likes: coerce_int(s.get("likes").or_else(|| s.get("like_count"))),
                })
                .collect()
        })
        .unwrap_or_default()
}

fn build_segments(cluster_data: Option<&Value>, llm: &Value) -> Vec<Segment> {
    let mut segments: Vec<Segment> = Vec::new();

    if let Some(cluster_data) = cluster_data {
        let clusters = cluster_data
            .get("clusters")
            .filter(|c| c.is_object() || c.is_array())
            .unwrap_or(cluster_data);

        let entries: Vec<(String, &Value)> = if let Some(obj) = clusters.as_object() {
            obj.iter().map(|(k, v)| (k.clone(), v)).collect()
        } else if let Some(arr) = clusters.as_array() {
            arr.iter().enumerate().map(|(i, v)| (i.to_string(), v)).collect()
        } else {
            Vec::new()
        };

        for (idx, info) in entries {
            if !info.is_object() {
                continue;
            }
            let label = info
                .get("label")
                .or_else(|| info.get("name"))
                .and_then(Value::as_str)
                .map(str::to_string)
                .unwrap_or_else(|| format!("Cluster {idx}"));
            let share = clamp_fraction(
                info.get("share")
                    .or_else(|| info.get("pct"))
                    .or_else(|| info.get("percentage")),
            );
            segments.push(Segment {
                label,
                share,
                samples: samples_from_list(info.get("samples")),
                linguistic_features: Vec::new(),
            });
        }
    }

    if segments.is_empty() {
        if let Some(factions) = llm
            .get("battlefield")
            .and_then(|b| b.get("factions"))
            .and_then(Value::as_array)
        {
            for (idx, f) in factions.iter().enumerate() {
                if !f.is_object() {
                    continue;
                }
                let label = ["label", "name", "id"]
                    .iter()
                    .find_map(|k| f.get(*k).and_then(Value::as_str))
                    .map(str::to_string)
                    .unwrap_or_else(|| format!("Cluster {idx}"));
                let share = clamp_fraction(f.get("share").or_else(|| f.get("share_pct")));
                segments.push(Segment {
                    label,
                    share,
                    samples: samples_from_list(f.get("samples")),
                    linguistic_features: Vec::new(),
                });
            }
        }
    }

    segments
}

fn layer_summary(llm: &Value, lower: &str, upper: &str) -> Option<String> {
    let layers = llm.get("layers")?;
    [lower, upper]
        .iter()
        .find_map(|k| layers.get(*k).and_then(|l| l.get("summary")).and_then(Value::as_str))
        .map(str::to_string)
}

fn extract_report_block(text: &str, start_pattern: &str, stop_patterns: &[&str]) -> Option<String> {
    let start_re = RegexBuilder::new(start_pattern)
        .case_insensitive(true)
        .multi_line(true)
        .build()
        .ok()?;
    let start = start_re.find(text)?;
    let tail = &text[start.end()..];

    let mut end = tail.len();
    for sp in stop_patterns {
        if let Ok(re) = RegexBuilder::new(sp)
            .case_insensitive(true)
            .multi_line(true)
            .build()
        {
            if let Some(m) = re.find(tail) {
                end = end.min(m.start());
            }
        }
    }
    let block = tail[..end].trim();
    (!block.is_empty()).then(|| block.to_string())
}

fn build_narrative_stack(llm: &Value, full_report: Option<&str>) -> NarrativeStack {
    let mut l1 = layer_summary(llm, "l1", "L1")
        .or_else(|| llm.get("L1").or_else(|| llm.get("l1")).and_then(Value::as_str).map(str::to_string));
    let mut l2 = layer_summary(llm, "l2", "L2")
        .or_else(|| llm.get("L2").or_else(|| llm.get("l2")).and_then(Value::as_str).map(str::to_string));
    let mut l3 = layer_summary(llm, "l3", "L3")
        .or_else(|| llm.get("L3").or_else(|| llm.get("l3")).and_then(Value::as_str).map(str::to_string));

    if let Some(report) = full_report {
        if l1.is_none() {
            l1 = extract_report_block(
                report,
                r"L1[：:.\s].*?(語言行為理論|Speech Act Theory)",
                &[r"L2[：:.\s]", r"L3[：:.\s]", r"^### "],
            );
        }
        if l2.is_none() {
            l2 = extract_report_block(
                report,
                r"L2[：:.\s].*?(批判性話語分析|Critical Discourse Analysis|策略)",
                &[r"L3[：:.\s]", r"L1[：:.\s]", r"^### "],
            );
        }
        if l3.is_none() {
            l3 = extract_report_block(
                report,
                r"L3[：:.\s].*?(輿論戰場與派系分析|Battlefield|Factions)",
                &[r"L1[：:.\s]", r"L2[：:.\s]", r"^### "],
            );
        }
    }

    NarrativeStack { l1, l2, l3 }
}

fn build_danger(llm: &Value) -> Option<DangerBlock> {
    let danger = llm.get("danger").filter(|d| d.is_object())?;
    Some(DangerBlock {
        bot_homogeneity_score: clamp_fraction(
            danger
                .get("bot_homogeneity_score")
                .or_else(|| danger.get("math_homogeneity")),
        ),
        notes: danger.get("notes").and_then(Value::as_str).map(str::to_string),
    })
}

/// Merge crawler data, LLM analysis, and clustering output into an
/// AnalysisV4 artifact. Deterministic: same inputs, same artifact.
pub fn build_analysis_json(
    crawler: &CrawlerPost,
    llm: &Value,
    cluster_data: Option<&Value>,
    full_report: Option<&str>,
) -> AnalysisV4 {
    let metrics = build_metrics(crawler, llm);
    let post = build_post_block(crawler, metrics);
    let mut phenomenon = build_phenomenon(llm);
    let segments = build_segments(cluster_data, llm);

    // Identity is registry-owned; mark pending until the enricher lands.
    if phenomenon.id.is_none() && phenomenon.status.is_none() {
        phenomenon.status = Some("pending".to_string());
    }

    let summary = llm.get("summary").filter(|s| s.is_object()).map(|s| SummaryCompat {
        one_line: s.get("one_line").and_then(Value::as_str).map(str::to_string),
        narrative_type: s.get("narrative_type").and_then(Value::as_str).map(str::to_string),
    });
    let battlefield = (!segments.is_empty()).then(|| BattlefieldCompat {
        factions: segments.clone(),
    });

    if crawler.post_id.is_empty() {
        warn!(url = ?crawler.url, "Post id missing when building analysis artifact");
    }

    AnalysisV4 {
        post,
        phenomenon,
        emotional_pulse: build_tone(llm),
        segments,
        narrative_stack: build_narrative_stack(llm, full_report),
        danger: build_danger(llm),
        full_report: full_report.map(str::to_string),
        summary,
        battlefield,
        ..Default::default()
    }
}

/// Enforce crawler-first core fields (text/author/timestamp/metrics). The
/// analyst path must never mutate these directly.
pub fn protect_core_fields(crawler: &CrawlerPost, mut analysis: AnalysisV4) -> AnalysisV4 {
    if let (Some(crawler_likes), llm_likes) = (crawler.like_count, analysis.post.metrics.likes) {
        let divergence = (llm_likes - crawler_likes).abs();
        if divergence as f64 > (crawler_likes as f64 * 0.5).max(100.0) {
            warn!(
                post_id = %crawler.post_id,
                crawler_likes,
                llm_likes,
                "LLM likes diverge from crawler likes, enforcing crawler"
            );
        }
    }

    let metrics = Metrics {
        likes: crawler.like_count.unwrap_or(analysis.post.metrics.likes),
        views: crawler.view_count.or(analysis.post.metrics.views),
        replies: crawler.reply_count.or(analysis.post.metrics.replies),
    };

    analysis.post.text = crawler.text.clone().or(analysis.post.text);
    analysis.post.author = crawler.author.clone().or(analysis.post.author);
    analysis.post.timestamp = crawler.timestamp.or(analysis.post.timestamp);
    analysis.post.metrics = metrics;
    analysis
}

/// Minimal completeness validation: (is_valid, invalid_reason, missing_keys).
pub fn validate_analysis(analysis: &AnalysisV4) -> (bool, String, Vec<String>) {
    let mut missing: Vec<String> = Vec::new();

    if !ANALYSIS_VERSION_ALLOWLIST.contains(&analysis.analysis_version.as_str()) {
        return (
            false,
            format!("unsupported_version:{}", analysis.analysis_version),
            vec!["analysis_version".to_string()],
        );
    }

    if analysis.post.post_id.is_empty() {
        missing.push("post.id".to_string());
    }
    if analysis.post.text.as_deref().unwrap_or("").is_empty() {
        missing.push("post.text".to_string());
    }
    if analysis.post.timestamp.is_none() {
        missing.push("post.created_at".to_string());
    }

    let phen = &analysis.phenomenon;
    let has_identity = phen.id.is_some()
        || phen.name.is_some()
        || phen.status.as_deref() == Some("pending");
    if !has_identity {
        missing.push("phenomenon.id_or_name".to_string());
    }

    // Evidence refs are required only when an evidence block is present.
    if let Some(evidence) = &analysis.evidence {
        let refs = evidence
            .get("refs")
            .and_then(Value::as_array)
            .map(Vec::len)
            .unwrap_or(0);
        if refs < 2 {
            missing.push("phenomenon.evidence>=2".to_string());
        }
    }

    if missing.is_empty() {
        (true, String::new(), missing)
    } else {
        (false, "missing_required_fields".to_string(), missing)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn crawler() -> CrawlerPost {
        CrawlerPost {
            post_id: "p1".to_string(),
            text: Some("post body".to_string()),
            timestamp: Some(Utc::now()),
            ..Default::default()
        }
    }

    #[test]
    fn metrics_prioritize_crawler() {
        let post = CrawlerPost {
            post_id: "p1".to_string(),
            like_count: Some(1700),
            view_count: Some(51_500),
            reply_count: Some(12),
            ..Default::default()
        };
        let llm = json!({"Post_Stats": {"Likes": 0, "Views": 10, "Replies": 1}});
        let result = build_analysis_json(&post, &llm, None, None);
        assert_eq!(result.post.metrics.likes, 1700);
        assert_eq!(result.post.metrics.views, Some(51_500));
        assert_eq!(result.post.metrics.replies, Some(12));
    }

    #[test]
    fn llm_stats_fill_only_missing_metrics() {
        let post = CrawlerPost {
            post_id: "p1".to_string(),
            like_count: None,
            ..Default::default()
        };
        let llm = json!({"Post_Stats": {"Likes": 42}});
        let result = build_analysis_json(&post, &llm, None, None);
        assert_eq!(result.post.metrics.likes, 42);
    }

    #[test]
    fn segment_share_normalized_from_percentage() {
        let llm = json!({});
        let cluster = json!({"clusters": [{"label": "A", "pct": 55, "samples": []}]});
        let result = build_analysis_json(&crawler(), &llm, Some(&cluster), None);
        assert_eq!(result.segments[0].share, Some(0.55));
    }

    #[test]
    fn fraction_shares_kept_and_clamped() {
        let cluster = json!({"clusters": [
            {"label": "A", "share": 0.4},
            {"label": "B", "share": 250},
        ]});
        let result = build_analysis_json(&crawler(), &json!({}), Some(&cluster), None);
        assert_eq!(result.segments[0].share, Some(0.4));
        // Values beyond 100 are clamped, not rescaled.
        assert_eq!(result.segments[1].share, Some(1.0));
    }

    #[test]
    fn missing_optional_fields_stay_empty() {
        let result = build_analysis_json(&crawler(), &json!({}), None, None);
        assert!(result.segments.is_empty());
        assert!(result.emotional_pulse.cynicism.is_none());
        assert!(result.battlefield.is_none());
    }

    #[test]
    fn phenomenon_defaults_to_pending() {
        let result = build_analysis_json(&crawler(), &json!({}), None, None);
        assert_eq!(result.phenomenon.status.as_deref(), Some("pending"));
        assert!(result.phenomenon.id.is_none());
    }

    #[test]
    fn object_images_reduced_to_src() {
        let post = CrawlerPost {
            post_id: "p1".to_string(),
            images: vec![
                json!("https://a/img.jpg"),
                json!({"src": "https://b/img.jpg", "scene_label": "meme"}),
                json!({"proxy_url": "https://c/img.jpg"}),
                json!({"irrelevant": true}),
            ],
            ..Default::default()
        };
        let result = build_analysis_json(&post, &json!({}), None, None);
        assert_eq!(
            result.post.images,
            vec!["https://a/img.jpg", "https://b/img.jpg", "https://c/img.jpg"]
        );
    }

    #[test]
    fn narrative_stack_prefers_structured_layers() {
        let llm = json!({"layers": {"l1": {"summary": "speech acts"}, "L2": {"summary": "framing"}}});
        let result = build_analysis_json(&crawler(), &llm, None, Some("report"));
        assert_eq!(result.narrative_stack.l1.as_deref(), Some("speech acts"));
        assert_eq!(result.narrative_stack.l2.as_deref(), Some("framing"));
    }

    #[test]
    fn narrative_stack_extracted_from_report_markers() {
        let report = "intro\nL1: Speech Act Theory\nthe acts block\nL2: Critical Discourse Analysis\nthe framing block\n";
        let result = build_analysis_json(&crawler(), &json!({}), None, Some(report));
        assert_eq!(result.narrative_stack.l1.as_deref(), Some("the acts block"));
        assert_eq!(result.narrative_stack.l2.as_deref(), Some("the framing block"));
    }

    #[test]
    fn protect_core_fields_enforces_crawler_truth() {
        let mut analysis = build_analysis_json(&crawler(), &json!({}), None, None);
        analysis.post.text = Some("llm-hallucinated".to_string());
        analysis.post.metrics.likes = 99_999;

        let post = CrawlerPost {
            post_id: "p1".to_string(),
            text: Some("crawler text".to_string()),
            like_count: Some(10),
            ..Default::default()
        };
        let protected = protect_core_fields(&post, analysis);
        assert_eq!(protected.post.text.as_deref(), Some("crawler text"));
        assert_eq!(protected.post.metrics.likes, 10);
    }

    #[test]
    fn validation_passes_for_complete_artifact() {
        let analysis = build_analysis_json(&crawler(), &json!({}), None, None);
        let (ok, reason, missing) = validate_analysis(&analysis);
        assert!(ok, "reason={reason} missing={missing:?}");
    }

    #[test]
    fn validation_reports_missing_fields() {
        let analysis = build_analysis_json(
            &CrawlerPost {
                post_id: String::new(),
                ..Default::default()
            },
            &json!({}),
            None,
            None,
        );
        let (ok, reason, missing) = validate_analysis(&analysis);
        assert!(!ok);
        assert_eq!(reason, "missing_required_fields");
        assert!(missing.contains(&"post.id".to_string()));
        assert!(missing.contains(&"post.text".to_string()));
        assert!(missing.contains(&"post.created_at".to_string()));
    }

    #[test]
    fn validation_rejects_unknown_version() {
        let mut analysis = build_analysis_json(&crawler(), &json!({}), None, None);
        analysis.analysis_version = "v3".to_string();
        let (ok, reason, _) = validate_analysis(&analysis);
        assert!(!ok);
        assert!(reason.starts_with("unsupported_version:"));
    }

    #[test]
    fn validation_checks_evidence_when_present() {
        let mut analysis = build_analysis_json(&crawler(), &json!({}), None, None);
        analysis.evidence = Some(json!({"refs": ["only-one"]}));
        let (ok, _, missing) = validate_analysis(&analysis);
        assert!(!ok);
        assert!(missing.contains(&"phenomenon.evidence>=2".to_string()));

        analysis.evidence = Some(json!({"refs": ["a", "b"]}));
        let (ok, _, _) = validate_analysis(&analysis);
        assert!(ok);
    }

    #[test]
    fn battlefield_factions_used_when_no_clusters() {
        let llm = json!({"battlefield": {"factions": [
            {"label": "skeptics", "share": 60, "samples": [{"text": "doubt", "likes": 3}]},
        ]}});
        let result = build_analysis_json(&crawler(), &llm, None, None);
        assert_eq!(result.segments.len(), 1);
        assert_eq!(result.segments[0].label, "skeptics");
        assert_eq!(result.segments[0].share, Some(0.6));
        assert_eq!(result.segments[0].samples[0].text, "doubt");
    }
}
