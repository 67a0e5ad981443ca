//! Deterministic evidence-bundle construction and content hashing.
//!
//! Every rule here is versioned: changing normalization, ordering, or the
//! template changes every case id, so the constants below move together with
//! `FINGERPRINT_VERSION`.

use std::collections::HashSet;

use serde_json::Value;
use sha2::{Digest, Sha256};
use unicode_normalization::UnicodeNormalization;
use uuid::Uuid;

pub const FINGERPRINT_VERSION: &str = "v1";
pub const MATCH_RULESET_VERSION: &str = "v1";
pub const REGISTRY_VERSION: &str = "v1";

pub const TRIGGER_MAX_LEN: usize = 2400;
pub const ARTIFACT_MAX_LEN: usize = 2400;
pub const REACTION_MAX_LEN: usize = 3200;
/// Samples per cluster feeding the signature hash.
pub const TOP_M_CLUSTER_SAMPLES: usize = 3;
pub const TOP_K_GLOBAL_REACTIONS: usize = 5;

/// Invariant namespace for minted phenomenon ids. Do not change.
pub const NAMESPACE_UUID: Uuid = Uuid::from_u128(0x6a7a3bf7_5a3f_4d66_b78e_2d7c9f5b7c7b);

/// Strict normalization: NFC, BOM stripped, whitespace collapsed to single
/// spaces, trimmed, lowercased. Emoji and punctuation survive. Truncation is
/// in characters, not bytes.
pub fn normalize_text(text: &str, max_len: Option<usize>) -> String {
    if text.is_empty() {
        return String::new();
    }
    let nfc: String = text.replace('\u{feff}', "").nfc().collect();
    let collapsed = nfc
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase();
    match max_len {
        Some(cap) if cap > 0 && collapsed.chars().count() > cap => {
            collapsed.chars().take(cap).collect()
        }
        _ => collapsed,
    }
}

/// SHA-256 hex over a %.6f rendering of each component.
pub fn embedding_hash(vec: &[f32]) -> String {
    let mut hasher = Sha256::new();
    for v in vec {
        hasher.update(format!("{v:.6}").as_bytes());
    }
    hex::encode(hasher.finalize())
}

fn sha256_hex(input: &str) -> String {
    hex::encode(Sha256::digest(input.as_bytes()))
}

fn json_like_count(v: &Value) -> i64 {
    v.get("like_count")
        .or_else(|| v.get("likes"))
        .and_then(Value::as_i64)
        .unwrap_or(0)
}

fn json_text(v: &Value) -> String {
    v.get("text")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}

/// One cluster as seen by the fingerprint: a size and its sample comments.
#[derive(Debug, Clone, Default)]
pub struct ClusterInfo {
    pub size: f64,
    pub samples: Vec<Value>,
}

fn cluster_size(info: &Value) -> f64 {
    for key in ["size", "count"] {
        if let Some(n) = info.get(key).and_then(Value::as_f64) {
            return n;
        }
    }
    for key in ["share", "pct", "percentage"] {
        if let Some(n) = info.get(key).and_then(Value::as_f64) {
            return n;
        }
    }
    0.0
}

/// Flatten a stored cluster summary into (key, info) pairs. Accepts either a
/// flat map or the `{clusters: {...}, noise: {...}}` wrapper.
pub fn clusters_from_summary(summary: &Value) -> Vec<(String, ClusterInfo)> {
    let map = match summary.get("clusters") {
        Some(inner) if inner.is_object() => inner,
        _ => summary,
    };
    let Some(obj) = map.as_object() else {
        return Vec::new();
    };

    obj.iter()
        .filter(|(_, info)| info.is_object())
        .map(|(key, info)| {
            let samples = info
                .get("samples")
                .and_then(Value::as_array)
                .cloned()
                .unwrap_or_default();
            (
                key.clone(),
                ClusterInfo {
                    size: cluster_size(info),
                    samples,
                },
            )
        })
        .collect()
}

/// Deterministic SHA-256 over the top-M samples by (likes desc, text asc).
pub fn cluster_signature_hash(samples: &[Value]) -> String {
    let mut ordered: Vec<&Value> = samples.iter().filter(|s| s.is_object()).collect();
    ordered.sort_by(|a, b| {
        json_like_count(b)
            .cmp(&json_like_count(a))
            .then_with(|| normalize_text(&json_text(a), None).cmp(&normalize_text(&json_text(b), None)))
    });

    let joined = ordered
        .iter()
        .take(TOP_M_CLUSTER_SAMPLES)
        .map(|s| normalize_text(&json_text(s), None))
        .filter(|t| !t.is_empty())
        .collect::<Vec<_>>()
        .join("\n");
    sha256_hex(&joined)
}

/// Order clusters by size desc, then signature hash asc. Stable under key
/// permutation.
pub fn order_clusters(clusters: Vec<(String, ClusterInfo)>) -> Vec<(String, ClusterInfo, String)> {
    let mut items: Vec<(String, ClusterInfo, String)> = clusters
        .into_iter()
        .map(|(key, info)| {
            let sig = cluster_signature_hash(&info.samples);
            (key, info, sig)
        })
        .collect();
    items.sort_by(|a, b| {
        b.1.size
            .partial_cmp(&a.1.size)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.2.cmp(&b.2))
    });
    items
}

/// Pick reaction samples: the highest-like sample per ordered cluster, then
/// global top-K comments, deduped by normalized text. Bounded by
/// |clusters| + TOP_K_GLOBAL_REACTIONS.
pub fn select_reaction_samples(summary: Option<&Value>, comments: &[Value]) -> Vec<String> {
    let ordered = order_clusters(
        summary
            .map(clusters_from_summary)
            .unwrap_or_default(),
    );
    let cluster_count = ordered.len();

    let mut picked: Vec<String> = Vec::new();
    let mut seen: HashSet<String> = HashSet::new();

    for (_, info, _) in &ordered {
        let top = info
            .samples
            .iter()
            .filter(|s| s.is_object())
            .max_by(|a, b| {
                json_like_count(a)
                    .cmp(&json_like_count(b))
                    .then_with(|| {
                        normalize_text(&json_text(a), None).cmp(&normalize_text(&json_text(b), None))
                    })
            });
        if let Some(top) = top {
            let norm = normalize_text(&json_text(top), None);
            if !norm.is_empty() && seen.insert(norm.clone()) {
                picked.push(norm);
            }
        }
    }

    let mut global: Vec<&Value> = comments.iter().filter(|c| c.is_object()).collect();
    global.sort_by(|a, b| {
        json_like_count(b)
            .cmp(&json_like_count(a))
            .then_with(|| normalize_text(&json_text(a), None).cmp(&normalize_text(&json_text(b), None)))
    });
    for c in global {
        if picked.len() >= cluster_count + TOP_K_GLOBAL_REACTIONS {
            break;
        }
        let norm = normalize_text(&json_text(c), None);
        if !norm.is_empty() && seen.insert(norm.clone()) {
            picked.push(norm);
        }
    }

    picked
}

/// The (trigger, artifact, reactions) triple plus its identity.
#[derive(Debug, Clone, PartialEq)]
pub struct EvidenceBundle {
    pub fingerprint: String,
    pub case_id: String,
    pub trigger: String,
    pub artifact: String,
    pub reactions: Vec<String>,
    pub version: &'static str,
}

/// Build the evidence bundle from crawler and cluster data. OCR text is
/// aggregated over all images in stable image order; the explicit
/// `ocr_full_text` is only a fallback.
pub fn build_evidence_bundle(
    post_text: &str,
    ocr_full_text: Option<&str>,
    comments: &[Value],
    cluster_summary: Option<&Value>,
    images: &[Value],
) -> EvidenceBundle {
    let trigger = normalize_text(post_text, Some(TRIGGER_MAX_LEN));

    let mut ocr_parts: Vec<String> = Vec::new();
    for img in images {
        if !img.is_object() {
            continue;
        }
        let text = ["full_text", "ocr_full_text", "text", "ocr"]
            .iter()
            .find_map(|k| img.get(*k).and_then(Value::as_str))
            .filter(|t| !t.is_empty());
        if let Some(text) = text {
            ocr_parts.push(text.to_string());
        }
    }
    let artifact_source = if ocr_parts.is_empty() {
        ocr_full_text.unwrap_or_default().to_string()
    } else {
        ocr_parts.join("\n")
    };
    let artifact = normalize_text(&artifact_source, Some(ARTIFACT_MAX_LEN));

    let reactions: Vec<String> = select_reaction_samples(cluster_summary, comments)
        .into_iter()
        .map(|r| normalize_text(&r, Some(REACTION_MAX_LEN)))
        .filter(|r| !r.is_empty())
        .collect();
    let joined_reactions = reactions.join("\n");

    let template =
        format!("TRIGGER:\n{trigger}\n\nARTIFACT:\n{artifact}\n\nREACTIONS:\n{joined_reactions}\n");
    let fingerprint = template.trim().to_string();
    let case_id = sha256_hex(&fingerprint);

    EvidenceBundle {
        fingerprint,
        case_id,
        trigger,
        artifact,
        reactions,
        version: FINGERPRINT_VERSION,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn normalize_text_rules() {
        let raw = "  Héllo \nWorld\t😊  ";
        assert_eq!(normalize_text(raw, None), "héllo world 😊");
        assert_eq!(normalize_text(raw, Some(5)), "héllo");
    }

    #[test]
    fn signature_and_ordering_deterministic() {
        let clusters = json!({
            "1": {"count": 3, "samples": [{"text": "aaa", "like_count": 1}, {"text": "bbb", "like_count": 5}]},
            "2": {"count": 3, "samples": [{"text": "ccc", "like_count": 2}]},
            "3": {"count": 1, "samples": [{"text": "ddd", "like_count": 10}]},
        });
        let first: Vec<String> = order_clusters(clusters_from_summary(&clusters))
            .into_iter()
            .map(|(k, _, _)| k)
            .collect();
        let second: Vec<String> = order_clusters(clusters_from_summary(&clusters))
            .into_iter()
            .map(|(k, _, _)| k)
            .collect();
        assert_eq!(first, second);

        let sig1 = cluster_signature_hash(&[json!({"text": "aaa", "like_count": 1})]);
        let sig2 = cluster_signature_hash(&[json!({"text": "ccc", "like_count": 2})]);
        assert_ne!(sig1, sig2);
    }

    #[test]
    fn case_id_stable_for_fixed_image_order() {
        let comments = vec![
            json!({"text": "first", "like_count": 10}),
            json!({"text": "second", "like_count": 5}),
        ];
        let images = vec![json!({"full_text": "OCR"}), json!({"text": "other"})];
        let summary = json!({"0": {"count": 2, "samples": comments.clone()}});

        let b1 = build_evidence_bundle("POST", None, &comments, Some(&summary), &images);
        let b2 = build_evidence_bundle("POST", None, &comments, Some(&summary), &images);
        assert_eq!(b1.case_id, b2.case_id);
        assert_eq!(b1.fingerprint, b2.fingerprint);
        assert_eq!(b1.version, FINGERPRINT_VERSION);
    }

    #[test]
    fn reactions_include_cluster_heads_and_global_topk() {
        let summary = json!({
            "0": {"count": 3, "samples": [{"text": "cluster head", "like_count": 2}]},
        });
        let comments = vec![
            json!({"text": "cluster head", "like_count": 2}),
            json!({"text": "global top", "like_count": 99}),
        ];
        let reactions = select_reaction_samples(Some(&summary), &comments);
        assert!(reactions.contains(&"cluster head".to_string()));
        assert!(reactions.contains(&"global top".to_string()));
    }

    #[test]
    fn cluster_key_permutation_invariance() {
        let a = json!({
            "a": {"count": 2, "samples": [{"text": "alpha", "like_count": 3}]},
            "b": {"count": 1, "samples": [{"text": "beta", "like_count": 2}]},
        });
        let b = json!({
            "b": {"count": 1, "samples": [{"text": "beta", "like_count": 2}]},
            "a": {"count": 2, "samples": [{"text": "alpha", "like_count": 3}]},
        });
        let b1 = build_evidence_bundle("trigger", None, &[], Some(&a), &[]);
        let b2 = build_evidence_bundle("trigger", None, &[], Some(&b), &[]);
        assert_eq!(b1.case_id, b2.case_id);
    }

    #[test]
    fn reaction_cap_respected() {
        let summary = json!({
            "0": {"count": 1, "samples": [{"text": "c0", "like_count": 1}]},
            "1": {"count": 1, "samples": [{"text": "c1", "like_count": 1}]},
        });
        let comments: Vec<Value> = (0..20)
            .map(|i| json!({"text": format!("g{i}"), "like_count": 100 - i}))
            .collect();
        let reactions = select_reaction_samples(Some(&summary), &comments);
        assert!(reactions.len() <= 2 + TOP_K_GLOBAL_REACTIONS);
    }

    #[test]
    fn wrapped_summary_unwraps_clusters_key() {
        let wrapped = json!({
            "clusters": {"0": {"count": 2, "samples": [{"text": "x", "like_count": 1}]}},
            "noise": {"count": 1, "samples": []},
        });
        let flat = clusters_from_summary(&wrapped);
        assert_eq!(flat.len(), 1);
        assert_eq!(flat[0].0, "0");
    }

    #[test]
    fn embedding_hash_is_format_stable() {
        let h1 = embedding_hash(&[0.1, 0.2]);
        let h2 = embedding_hash(&[0.1, 0.2]);
        let h3 = embedding_hash(&[0.1, 0.200013]);
        assert_eq!(h1, h2);
        assert_ne!(h1, h3);
    }

    #[test]
    fn namespace_uuid_matches_registry_constant() {
        assert_eq!(
            NAMESPACE_UUID.to_string(),
            "6a7a3bf7-5a3f-4d66-b78e-2d7c9f5b7c7b"
        );
    }
}
