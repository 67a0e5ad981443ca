//! Chain test: comment mapping feeds the cluster summary, the summary feeds
//! the evidence bundle and the artifact builder, and identity stays stable
//! across the whole chain.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use serde_json::json;

use lens_analysis::{
    build_analysis_json, build_evidence_bundle, cluster_summary_json, validate_analysis,
    CommentMapper, CrawlerPost, MappedComment,
};
use lens_common::TextEmbedder;

/// Embedder with two well-separated directions keyed by a text marker.
struct AxisEmbedder;

#[async_trait]
impl TextEmbedder for AxisEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        Ok(if text.contains("refund") {
            vec![1.0, 0.0, 0.0, 0.0]
        } else {
            vec![0.0, 0.0, 0.0, 1.0]
        })
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let mut out = Vec::new();
        for t in texts {
            out.push(self.embed(t).await?);
        }
        Ok(out)
    }
}

fn comments() -> Vec<MappedComment> {
    let mut out = Vec::new();
    for i in 0..6 {
        out.push(MappedComment {
            id: format!("refund-{i}"),
            author_handle: Some(format!("user{i}")),
            text: format!("where is my refund number {i}"),
            like_count: 10 - i as i64,
        });
        out.push(MappedComment {
            id: format!("weather-{i}"),
            author_handle: Some(format!("other{i}")),
            text: format!("lovely weather this evening {i}"),
            like_count: i as i64,
        });
    }
    out
}

#[tokio::test]
async fn mapped_clusters_flow_into_evidence_and_artifact() {
    let mapper = CommentMapper::new(Arc::new(AxisEmbedder));
    let comments = comments();

    let map = mapper.map(42, &comments).await.expect("structure map");
    assert_eq!(map.n_clusters, 2);
    assert_eq!(map.math_homogeneity, 0.5);

    let summary = cluster_summary_json(&comments, &map);
    assert_eq!(summary["noise"]["count"], 0);

    // Evidence bundle over the mapped summary is deterministic.
    let raw_comments: Vec<serde_json::Value> = comments
        .iter()
        .map(|c| json!({"text": c.text, "like_count": c.like_count}))
        .collect();
    let b1 = build_evidence_bundle("tax refunds are late", None, &raw_comments, Some(&summary), &[]);
    let b2 = build_evidence_bundle("tax refunds are late", None, &raw_comments, Some(&summary), &[]);
    assert_eq!(b1.case_id, b2.case_id);
    // One reaction per cluster plus global top-K, capped.
    assert!(b1.reactions.len() <= map.n_clusters + 5);
    assert!(!b1.reactions.is_empty());

    // The artifact builder consumes the same summary as segments.
    let crawler = CrawlerPost {
        post_id: "42".to_string(),
        text: Some("tax refunds are late".to_string()),
        timestamp: Some(Utc::now()),
        like_count: Some(120),
        ..Default::default()
    };
    let analysis = build_analysis_json(&crawler, &json!({}), Some(&summary), None);
    assert_eq!(analysis.segments.len(), 2);
    assert_eq!(analysis.post.metrics.likes, 120);

    let (ok, reason, missing) = validate_analysis(&analysis);
    assert!(ok, "reason={reason} missing={missing:?}");
}

#[tokio::test]
async fn comment_id_stability_keeps_top_comment_references_valid() {
    let mapper = CommentMapper::new(Arc::new(AxisEmbedder));
    let comments = comments();

    let first = mapper.map(42, &comments).await.expect("map");
    let second = mapper.map(42, &comments).await.expect("map");

    let ids = |m: &lens_analysis::StructureMap| -> HashMap<i32, Vec<String>> {
        m.clusters
            .iter()
            .map(|c| (c.cluster_key, c.top_comment_ids.clone()))
            .collect()
    };
    assert_eq!(ids(&first), ids(&second));
}
