//! Quantitative comment structure mapper.
//!
//! Embeds a post's comments, lays them out in 2-D, clusters them, flags
//! echo/template pairs, and produces the cluster + assignment payloads for
//! persistence. Every numeric step has a deterministic fallback; the mapper
//! never propagates an error to the caller.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use regex::Regex;
use serde_json::{json, Value};
use tracing::{info, warn};

use lens_common::TextEmbedder;
use lens_store::{ClusterAssignment, ClusterPayload, OpReport, Store};

use crate::cosine_similarity;

const MIN_TEXT_LEN: usize = 5;
/// Echo pair similarity threshold and long-text floor. Hard-coded upstream;
/// not tuned per language.
const ECHO_SIM_THRESHOLD: f64 = 0.94;
const ECHO_TEXT_FLOOR: usize = 8;
const KMEANS_SEED: u64 = 42;
const KMEANS_MAX_ITER: usize = 100;
const TOP_KEYWORDS: usize = 6;
const TOP_COMMENT_IDS: usize = 5;
const MAX_SAMPLES_PER_CLUSTER: usize = 5;

/// A comment after identity assignment, as the mapper consumes it.
#[derive(Debug, Clone)]
pub struct MappedComment {
    pub id: String,
    pub author_handle: Option<String>,
    pub text: String,
    pub like_count: i64,
}

/// Per-comment quantitative fields written back onto the comment view.
#[derive(Debug, Clone)]
pub struct CommentQuant {
    pub comment_id: String,
    pub cluster_key: i32,
    pub x: f64,
    pub y: f64,
    pub is_template_like: bool,
}

/// Full mapper output for one post.
#[derive(Debug, Clone)]
pub struct StructureMap {
    pub node_data: Vec<CommentQuant>,
    pub cluster_stats: BTreeMap<i32, usize>,
    pub high_sim_pairs: usize,
    pub math_homogeneity: f64,
    pub clusters: Vec<ClusterPayload>,
    pub assignments: Vec<ClusterAssignment>,
    pub n_clusters: usize,
}

fn cluster_id(post_id: i64, cluster_key: i32) -> String {
    format!("{post_id}::c{cluster_key}")
}

pub struct CommentMapper {
    embedder: Arc<dyn TextEmbedder>,
}

impl CommentMapper {
    pub fn new(embedder: Arc<dyn TextEmbedder>) -> Self {
        Self { embedder }
    }

    /// Map a post's comments. Returns None when there is nothing to map or
    /// embeddings are unavailable; the pipeline continues without quant data.
    pub async fn map(&self, post_id: i64, comments: &[MappedComment]) -> Option<StructureMap> {
        if comments.is_empty() {
            warn!(post_id, "No comments for quant analysis");
            return None;
        }

        let mut valid_indices: Vec<usize> = Vec::new();
        let mut valid_texts: Vec<String> = Vec::new();
        for (idx, c) in comments.iter().enumerate() {
            let text = c.text.trim();
            if text.chars().count() >= MIN_TEXT_LEN {
                valid_indices.push(idx);
                valid_texts.push(text.to_string());
            }
        }

        if valid_texts.is_empty() {
            warn!(post_id, "Valid semantic comments too few after filtering");
            return None;
        }

        let embeddings = match self.embedder.embed_batch(&valid_texts).await {
            Ok(e) if e.len() == valid_texts.len() => e,
            Ok(e) => {
                warn!(post_id, got = e.len(), want = valid_texts.len(), "Embedding count mismatch");
                return None;
            }
            Err(e) => {
                warn!(post_id, error = %e, "Embedding failed");
                return None;
            }
        };

        let count = valid_texts.len();
        let coords = project_2d(&embeddings);
        let (labels, n_clusters) = cluster_embeddings(&embeddings);

        // Echo / template-like detection.
        let mut echo_indices: HashSet<usize> = HashSet::new();
        let mut high_sim_pairs = 0usize;
        for i in 0..count {
            for j in (i + 1)..count {
                let sim = cosine_similarity(&embeddings[i], &embeddings[j]);
                let long_enough = valid_texts[i].chars().count() >= ECHO_TEXT_FLOOR;
                let user_i = comments[valid_indices[i]].author_handle.as_deref();
                let user_j = comments[valid_indices[j]].author_handle.as_deref();
                let distinct_users = matches!((user_i, user_j), (Some(a), Some(b)) if a != b);
                if sim > ECHO_SIM_THRESHOLD && long_enough && distinct_users {
                    echo_indices.insert(valid_indices[i]);
                    echo_indices.insert(valid_indices[j]);
                    high_sim_pairs += 1;
                }
            }
        }

        // Back-fill per-comment quant fields.
        let mut node_data: Vec<CommentQuant> = comments
            .iter()
            .map(|c| CommentQuant {
                comment_id: c.id.clone(),
                cluster_key: -1,
                x: 0.0,
                y: 0.0,
                is_template_like: false,
            })
            .collect();
        for (i, &orig_idx) in valid_indices.iter().enumerate() {
            node_data[orig_idx].cluster_key = labels[i];
            node_data[orig_idx].x = round4(coords[i].0);
            node_data[orig_idx].y = round4(coords[i].1);
            node_data[orig_idx].is_template_like = echo_indices.contains(&orig_idx);
        }

        let mut cluster_stats: BTreeMap<i32, usize> = BTreeMap::new();
        for &label in &labels {
            *cluster_stats.entry(label).or_insert(0) += 1;
        }

        let total_clustered: usize = cluster_stats.values().sum();
        let math_homogeneity = if total_clustered > 0 {
            let dominant = *cluster_stats.values().max().unwrap_or(&0);
            round2(dominant as f64 / total_clustered as f64)
        } else {
            1.0
        };

        // Per-cluster payloads and assignment list.
        let keyword_re = Regex::new(r"[A-Za-z0-9#@']{3,}").expect("keyword regex");
        let mut clusters: Vec<ClusterPayload> = Vec::new();
        let mut cluster_labels: BTreeMap<i32, String> = BTreeMap::new();

        let mut members_by_label: BTreeMap<i32, Vec<(usize, usize)>> = BTreeMap::new();
        for (i, &label) in labels.iter().enumerate() {
            members_by_label.entry(label).or_default().push((i, valid_indices[i]));
        }

        for (&label_key, members) in &members_by_label {
            let member_texts: Vec<&str> = members
                .iter()
                .map(|&(_, orig)| comments[orig].text.as_str())
                .collect();
            let mut by_likes = members.clone();
            by_likes.sort_by(|a, b| comments[b.1].like_count.cmp(&comments[a.1].like_count));
            let top_comment_ids: Vec<String> = by_likes
                .iter()
                .take(TOP_COMMENT_IDS)
                .map(|&(_, orig)| comments[orig].id.clone())
                .collect();
            let centroid = centroid(members.iter().map(|&(i, _)| embeddings[i].as_slice()));
            let label = format!("Cluster {label_key}");
            cluster_labels.insert(label_key, label.clone());

            clusters.push(ClusterPayload {
                cluster_key: label_key,
                label,
                summary: None,
                size: members.len() as i32,
                keywords: top_keywords(&keyword_re, &member_texts),
                top_comment_ids,
                centroid_embedding: centroid,
            });
        }

        let mut assignments: Vec<ClusterAssignment> = Vec::new();
        for node in &node_data {
            if node.cluster_key < 0 {
                continue;
            }
            assignments.push(ClusterAssignment {
                comment_id: node.comment_id.clone(),
                cluster_key: node.cluster_key,
                cluster_label: cluster_labels.get(&node.cluster_key).cloned(),
                cluster_id: Some(cluster_id(post_id, node.cluster_key)),
            });
        }

        info!(
            post_id,
            comments = comments.len(),
            valid = count,
            clusters = n_clusters,
            high_sim_pairs,
            math_homogeneity,
            "Structure mapping complete"
        );

        Some(StructureMap {
            node_data,
            cluster_stats,
            high_sim_pairs,
            math_homogeneity,
            clusters,
            assignments,
            n_clusters,
        })
    }

    /// Persist clusters (set-based) and, when enabled, assignments. Failures
    /// are reported, never raised.
    pub async fn persist(
        &self,
        store: &Store,
        post_id: i64,
        map: &StructureMap,
        persist_assignments: bool,
    ) -> Value {
        let cluster_report = store.upsert_comment_clusters(post_id, &map.clusters).await;

        let assignment_report: OpReport = if persist_assignments {
            store
                .set_comment_cluster_assignments(post_id, &map.assignments)
                .await
        } else {
            OpReport::skipped(Some("DL_PERSIST_ASSIGNMENTS=0"))
        };

        if !cluster_report.ok && !cluster_report.skipped {
            warn!(
                post_id,
                clusters_ok = cluster_report.ok,
                assignments_ok = assignment_report.ok,
                "Cluster persistence degraded"
            );
        }

        json!({
            "clusters": cluster_report,
            "assignments": assignment_report,
        })
    }
}

/// Cluster summary stored on the post row and fed to the analyst and the
/// fingerprint: top samples per cluster plus a noise bucket.
pub fn cluster_summary_json(comments: &[MappedComment], map: &StructureMap) -> Value {
    let total = comments.len();
    let quant_by_id: BTreeMap<&str, &CommentQuant> = map
        .node_data
        .iter()
        .map(|q| (q.comment_id.as_str(), q))
        .collect();

    let mut grouped: BTreeMap<i32, Vec<&MappedComment>> = BTreeMap::new();
    let mut noise: Vec<&MappedComment> = Vec::new();
    for c in comments {
        let key = quant_by_id.get(c.id.as_str()).map(|q| q.cluster_key).unwrap_or(-1);
        if key >= 0 {
            grouped.entry(key).or_default().push(c);
        } else {
            noise.push(c);
        }
    }

    let sample_json = |c: &MappedComment, key: Option<i32>| {
        let mut v = json!({
            "id": c.id,
            "user": c.author_handle,
            "text": c.text,
            "like_count": c.like_count,
        });
        if let Some(key) = key {
            v["cluster_key"] = json!(key);
        }
        v
    };

    let mut clusters = serde_json::Map::new();
    for (key, mut members) in grouped {
        members.sort_by(|a, b| b.like_count.cmp(&a.like_count));
        let pct = if total > 0 {
            members.len() as f64 / total as f64
        } else {
            0.0
        };
        clusters.insert(
            key.to_string(),
            json!({
                "cluster_id": key,
                "cluster_key": key,
                "count": members.len(),
                "pct": round4(pct),
                "pct_label": format!("{:.1}%", pct * 100.0),
                "samples": members
                    .iter()
                    .take(MAX_SAMPLES_PER_CLUSTER)
                    .map(|c| sample_json(c, Some(key)))
                    .collect::<Vec<_>>(),
            }),
        );
    }

    let noise_pct = if total > 0 {
        noise.len() as f64 / total as f64
    } else {
        0.0
    };
    json!({
        "clusters": Value::Object(clusters),
        "noise": {
            "cluster_id": -1,
            "count": noise.len(),
            "pct": round4(noise_pct),
            "pct_label": format!("{:.1}%", noise_pct * 100.0),
            "samples": noise
                .iter()
                .take(MAX_SAMPLES_PER_CLUSTER)
                .map(|c| sample_json(c, None))
                .collect::<Vec<_>>(),
        },
    })
}

fn round2(v: f64) -> f64 {
    (v * 100.0).round() / 100.0
}

fn round4(v: f64) -> f64 {
    (v * 10_000.0).round() / 10_000.0
}

fn top_keywords(re: &Regex, texts: &[&str]) -> Vec<String> {
    let mut counts: BTreeMap<String, usize> = BTreeMap::new();
    for t in texts {
        for m in re.find_iter(&t.to_lowercase()) {
            *counts.entry(m.as_str().to_string()).or_insert(0) += 1;
        }
    }
    let mut ranked: Vec<(String, usize)> = counts.into_iter().collect();
    ranked.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
    ranked.into_iter().take(TOP_KEYWORDS).map(|(w, _)| w).collect()
}

fn centroid<'a>(vectors: impl Iterator<Item = &'a [f32]>) -> Option<Vec<f32>> {
    let mut sum: Vec<f64> = Vec::new();
    let mut n = 0usize;
    for v in vectors {
        if sum.is_empty() {
            sum = vec![0.0; v.len()];
        }
        for (acc, x) in sum.iter_mut().zip(v) {
            *acc += *x as f64;
        }
        n += 1;
    }
    if n == 0 {
        return None;
    }
    Some(sum.into_iter().map(|x| (x / n as f64) as f32).collect())
}

/// 2-D projection: trivial layouts for tiny inputs, PCA-2 otherwise, with
/// the index line as the failure fallback.
fn project_2d(embeddings: &[Vec<f32>]) -> Vec<(f64, f64)> {
    let n = embeddings.len();
    if n == 1 {
        return vec![(0.0, 0.0)];
    }
    if n < 5 {
        return (0..n).map(|i| (i as f64, 0.0)).collect();
    }
    match pca_2d(embeddings) {
        Some(coords) => coords,
        None => {
            warn!(n, "PCA failed, using fallback coords");
            (0..n).map(|i| (i as f64, 0.0)).collect()
        }
    }
}

/// Two principal components via power iteration with deflation.
fn pca_2d(embeddings: &[Vec<f32>]) -> Option<Vec<(f64, f64)>> {
    let n = embeddings.len();
    let dim = embeddings.first()?.len();
    if dim == 0 || embeddings.iter().any(|e| e.len() != dim) {
        return None;
    }

    let mut data: Vec<Vec<f64>> = embeddings
        .iter()
        .map(|e| e.iter().map(|&x| x as f64).collect())
        .collect();

    // Center.
    let mut mean = vec![0.0f64; dim];
    for row in &data {
        for (m, x) in mean.iter_mut().zip(row) {
            *m += x;
        }
    }
    for m in &mut mean {
        *m /= n as f64;
    }
    for row in &mut data {
        for (x, m) in row.iter_mut().zip(&mean) {
            *x -= m;
        }
    }

    let component = |data: &[Vec<f64>], exclude: Option<&Vec<f64>>| -> Option<Vec<f64>> {
        // Deterministic start vector.
        let mut v: Vec<f64> = (0..dim).map(|i| 1.0 + (i % 7) as f64 * 0.1).collect();
        normalize(&mut v)?;
        for _ in 0..100 {
            // w = X^T (X v)
            let mut w = vec![0.0f64; dim];
            for row in data {
                let dot: f64 = row.iter().zip(&v).map(|(a, b)| a * b).sum();
                for (wi, x) in w.iter_mut().zip(row) {
                    *wi += dot * x;
                }
            }
            if let Some(prev) = exclude {
                let proj: f64 = w.iter().zip(prev).map(|(a, b)| a * b).sum();
                for (wi, p) in w.iter_mut().zip(prev) {
                    *wi -= proj * p;
                }
            }
            normalize(&mut w)?;
            let delta: f64 = w.iter().zip(&v).map(|(a, b)| (a - b).abs()).sum();
            v = w;
            if delta < 1e-9 {
                break;
            }
        }
        Some(v)
    };

    let pc1 = component(&data, None)?;
    let pc2 = component(&data, Some(&pc1))?;

    Some(
        data.iter()
            .map(|row| {
                let x: f64 = row.iter().zip(&pc1).map(|(a, b)| a * b).sum();
                let y: f64 = row.iter().zip(&pc2).map(|(a, b)| a * b).sum();
                (x, y)
            })
            .collect(),
    )
}

fn normalize(v: &mut [f64]) -> Option<()> {
    let norm: f64 = v.iter().map(|x| x * x).sum::<f64>().sqrt();
    if !norm.is_finite() || norm < 1e-12 {
        return None;
    }
    for x in v.iter_mut() {
        *x /= norm;
    }
    Some(())
}

/// Cluster-count rule plus seeded k-means. Single cluster on any failure.
fn cluster_embeddings(embeddings: &[Vec<f32>]) -> (Vec<i32>, usize) {
    let n = embeddings.len();
    if n < 3 {
        return (vec![0; n], 1);
    }
    let k = if n <= 10 {
        2
    } else {
        (n / 8).clamp(2, 4)
    };
    match kmeans(embeddings, k) {
        Some(labels) => (labels, k),
        None => {
            warn!(n, k, "KMeans failed, fallback single cluster");
            (vec![0; n], 1)
        }
    }
}

/// K-means with k-means++ seeding from a fixed RNG seed.
fn kmeans(embeddings: &[Vec<f32>], k: usize) -> Option<Vec<i32>> {
    let n = embeddings.len();
    let dim = embeddings.first()?.len();
    if k == 0 || k > n || dim == 0 {
        return None;
    }

    let data: Vec<Vec<f64>> = embeddings
        .iter()
        .map(|e| e.iter().map(|&x| x as f64).collect())
        .collect();
    let mut rng = StdRng::seed_from_u64(KMEANS_SEED);

    // k-means++ seeding.
    let mut centroids: Vec<Vec<f64>> = Vec::with_capacity(k);
    centroids.push(data[rng.random_range(0..n)].clone());
    while centroids.len() < k {
        let dists: Vec<f64> = data
            .iter()
            .map(|p| {
                centroids
                    .iter()
                    .map(|c| sq_dist(p, c))
                    .fold(f64::INFINITY, f64::min)
            })
            .collect();
        let total: f64 = dists.iter().sum();
        if total <= 0.0 {
            // All points identical to a centroid; duplicate one.
            centroids.push(data[0].clone());
            continue;
        }
        let mut r = rng.random_range(0.0..total);
        let mut chosen = n - 1;
        for (i, d) in dists.iter().enumerate() {
            r -= d;
            if r <= 0.0 {
                chosen = i;
                break;
            }
        }
        centroids.push(data[chosen].clone());
    }

    let mut labels = vec![0i32; n];
    for _ in 0..KMEANS_MAX_ITER {
        let mut changed = false;
        for (i, p) in data.iter().enumerate() {
            let mut best = 0usize;
            let mut best_dist = f64::INFINITY;
            for (ci, c) in centroids.iter().enumerate() {
                let d = sq_dist(p, c);
                if d < best_dist {
                    best_dist = d;
                    best = ci;
                }
            }
            if labels[i] != best as i32 {
                labels[i] = best as i32;
                changed = true;
            }
        }
        if !changed {
            break;
        }
        for (ci, c) in centroids.iter_mut().enumerate() {
            let members: Vec<&Vec<f64>> = data
                .iter()
                .zip(&labels)
                .filter(|(_, &l)| l == ci as i32)
                .map(|(p, _)| p)
                .collect();
            if members.is_empty() {
                continue;
            }
            for (d, slot) in c.iter_mut().enumerate() {
                *slot = members.iter().map(|m| m[d]).sum::<f64>() / members.len() as f64;
            }
        }
    }

    Some(labels)
}

fn sq_dist(a: &[f64], b: &[f64]) -> f64 {
    a.iter().zip(b).map(|(x, y)| (x - y) * (x - y)).sum()
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;
    use async_trait::async_trait;
    use std::collections::HashMap;

    /// Embedder returning preset vectors keyed by text prefix.
    struct PresetEmbedder {
        vectors: HashMap<String, Vec<f32>>,
        default_dim: usize,
    }

    impl PresetEmbedder {
        fn new(pairs: &[(&str, Vec<f32>)]) -> Self {
            Self {
                vectors: pairs
                    .iter()
                    .map(|(t, v)| (t.to_string(), v.clone()))
                    .collect(),
                default_dim: pairs.first().map(|(_, v)| v.len()).unwrap_or(4),
            }
        }
    }

    #[async_trait]
    impl TextEmbedder for PresetEmbedder {
        async fn embed(&self, text: &str) -> Result<Vec<f32>> {
            Ok(self
                .vectors
                .get(text)
                .cloned()
                .unwrap_or_else(|| vec![0.5; self.default_dim]))
        }

        async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
            let mut out = Vec::new();
            for t in texts {
                out.push(self.embed(t).await?);
            }
            Ok(out)
        }
    }

    fn comment(id: &str, user: &str, text: &str, likes: i64) -> MappedComment {
        MappedComment {
            id: id.to_string(),
            author_handle: Some(user.to_string()),
            text: text.to_string(),
            like_count: likes,
        }
    }

    #[tokio::test]
    async fn empty_input_maps_to_none() {
        let mapper = CommentMapper::new(Arc::new(PresetEmbedder::new(&[])));
        assert!(mapper.map(1, &[]).await.is_none());
    }

    #[tokio::test]
    async fn short_comments_are_filtered_out() {
        let mapper = CommentMapper::new(Arc::new(PresetEmbedder::new(&[])));
        let comments = vec![comment("a", "u1", "hi", 0), comment("b", "u2", "ok!", 0)];
        assert!(mapper.map(1, &comments).await.is_none());
    }

    #[tokio::test]
    async fn single_valid_comment_gets_origin_coords() {
        let mapper = CommentMapper::new(Arc::new(PresetEmbedder::new(&[(
            "this is long enough",
            vec![1.0, 0.0, 0.0, 0.0],
        )])));
        let comments = vec![comment("a", "u1", "this is long enough", 3)];
        let map = mapper.map(7, &comments).await.expect("map");
        assert_eq!(map.n_clusters, 1);
        assert_eq!(map.node_data[0].cluster_key, 0);
        assert_eq!((map.node_data[0].x, map.node_data[0].y), (0.0, 0.0));
        assert_eq!(map.math_homogeneity, 1.0);
        assert_eq!(map.assignments[0].cluster_id.as_deref(), Some("7::c0"));
    }

    #[tokio::test]
    async fn echo_pairs_require_distinct_users() {
        let same_vec = vec![0.6, 0.8, 0.0, 0.0];
        let mapper = CommentMapper::new(Arc::new(PresetEmbedder::new(&[
            ("copied template text", same_vec.clone()),
            ("copied template text!", same_vec.clone()),
            ("totally different view", vec![0.0, 0.0, 1.0, 0.0]),
        ])));

        // Distinct users: flagged.
        let comments = vec![
            comment("a", "u1", "copied template text", 1),
            comment("b", "u2", "copied template text!", 2),
            comment("c", "u3", "totally different view", 0),
        ];
        let map = mapper.map(1, &comments).await.expect("map");
        assert_eq!(map.high_sim_pairs, 1);
        assert!(map.node_data[0].is_template_like);
        assert!(map.node_data[1].is_template_like);
        assert!(!map.node_data[2].is_template_like);

        // Same user: not flagged.
        let comments = vec![
            comment("a", "u1", "copied template text", 1),
            comment("b", "u1", "copied template text!", 2),
            comment("c", "u3", "totally different view", 0),
        ];
        let map = mapper.map(1, &comments).await.expect("map");
        assert_eq!(map.high_sim_pairs, 0);
    }

    #[tokio::test]
    async fn two_well_separated_groups_cluster_apart() {
        let mut pairs: Vec<(String, Vec<f32>)> = Vec::new();
        for i in 0..6 {
            pairs.push((format!("group one comment {i}"), vec![1.0, 0.0, 0.0, 0.0]));
            pairs.push((format!("group two comment {i}"), vec![0.0, 0.0, 0.0, 1.0]));
        }
        let borrowed: Vec<(&str, Vec<f32>)> =
            pairs.iter().map(|(t, v)| (t.as_str(), v.clone())).collect();
        let mapper = CommentMapper::new(Arc::new(PresetEmbedder::new(&borrowed)));

        let comments: Vec<MappedComment> = pairs
            .iter()
            .enumerate()
            .map(|(i, (t, _))| comment(&format!("c{i}"), &format!("u{i}"), t, i as i64))
            .collect();
        let map = mapper.map(1, &comments).await.expect("map");

        assert_eq!(map.n_clusters, 2);
        let k0 = map.node_data[0].cluster_key;
        let k1 = map.node_data[1].cluster_key;
        assert_ne!(k0, k1);
        // Members of the same group share a label.
        assert!(map
            .node_data
            .iter()
            .step_by(2)
            .all(|q| q.cluster_key == k0));
        assert_eq!(map.math_homogeneity, 0.5);
    }

    #[tokio::test]
    async fn homogeneity_reflects_dominant_cluster() {
        let mut pairs: Vec<(String, Vec<f32>)> = Vec::new();
        for i in 0..9 {
            pairs.push((format!("dominant voice {i}"), vec![1.0, 0.0, 0.0, 0.0]));
        }
        pairs.push(("lone dissent here".to_string(), vec![0.0, 0.0, 0.0, 1.0]));
        let borrowed: Vec<(&str, Vec<f32>)> =
            pairs.iter().map(|(t, v)| (t.as_str(), v.clone())).collect();
        let mapper = CommentMapper::new(Arc::new(PresetEmbedder::new(&borrowed)));

        let comments: Vec<MappedComment> = pairs
            .iter()
            .enumerate()
            .map(|(i, (t, _))| comment(&format!("c{i}"), &format!("u{i}"), t, 0))
            .collect();
        let map = mapper.map(1, &comments).await.expect("map");
        assert_eq!(map.math_homogeneity, 0.9);
    }

    #[test]
    fn cluster_summary_has_noise_bucket_and_caps_samples() {
        let comments: Vec<MappedComment> = (0..8)
            .map(|i| comment(&format!("c{i}"), "u", &format!("text number {i}"), i as i64))
            .collect();
        let map = StructureMap {
            node_data: comments
                .iter()
                .enumerate()
                .map(|(i, c)| CommentQuant {
                    comment_id: c.id.clone(),
                    cluster_key: if i < 7 { 0 } else { -1 },
                    x: 0.0,
                    y: 0.0,
                    is_template_like: false,
                })
                .collect(),
            cluster_stats: BTreeMap::from([(0, 7)]),
            high_sim_pairs: 0,
            math_homogeneity: 1.0,
            clusters: vec![],
            assignments: vec![],
            n_clusters: 1,
        };

        let summary = cluster_summary_json(&comments, &map);
        let c0 = &summary["clusters"]["0"];
        assert_eq!(c0["count"], 7);
        assert_eq!(c0["samples"].as_array().unwrap().len(), MAX_SAMPLES_PER_CLUSTER);
        // Samples sorted by likes desc.
        assert_eq!(c0["samples"][0]["like_count"], 6);
        assert_eq!(summary["noise"]["count"], 1);
    }

    #[test]
    fn keywords_are_lowercased_and_ranked() {
        let re = Regex::new(r"[A-Za-z0-9#@']{3,}").unwrap();
        let kws = top_keywords(&re, &["Tax tax TAX refund", "tax refund now"]);
        assert_eq!(kws, vec!["tax", "refund", "now"]);
    }

    #[test]
    fn kmeans_is_deterministic() {
        let data: Vec<Vec<f32>> = (0..12)
            .map(|i| {
                if i % 2 == 0 {
                    vec![1.0, 0.0]
                } else {
                    vec![0.0, 1.0]
                }
            })
            .collect();
        let a = kmeans(&data, 2).unwrap();
        let b = kmeans(&data, 2).unwrap();
        assert_eq!(a, b);
    }
}
