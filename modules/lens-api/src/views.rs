//! Read-model helpers for the post and phenomenon endpoints.

use serde_json::{json, Value};
use tracing::warn;

use lens_store::PostListRow;

/// Merge phenomenon identity for one post: DB columns win over whatever the
/// analysis artifact carries; mismatches are logged, never patched here.
pub fn merge_phenomenon_meta(row: &PostListRow) -> Value {
    let aj = row.analysis_json.as_ref();
    let aj_phen = aj.and_then(|a| a.get("phenomenon")).filter(|p| p.is_object());

    let aj_id = aj_phen.and_then(|p| p.get("id")).and_then(Value::as_str);
    let aj_status = aj_phen.and_then(|p| p.get("status")).and_then(Value::as_str);
    let aj_case = aj
        .and_then(|a| a.get("phenomenon_case_id"))
        .and_then(Value::as_str)
        .or_else(|| aj_phen.and_then(|p| p.get("case_id")).and_then(Value::as_str));
    let aj_name = aj_phen
        .and_then(|p| p.get("canonical_name").or_else(|| p.get("name")))
        .and_then(Value::as_str);

    let db_id = row.phenomenon_id.as_deref();
    let db_status = row.phenomenon_status.as_deref();
    let db_case = row.phenomenon_case_id.as_deref();

    let (id, status, case_id, name, source) = if db_id.is_some() || db_status.is_some() || db_case.is_some()
    {
        (db_id, db_status, db_case, None, "db_columns")
    } else if aj_id.is_some() || aj_status.is_some() || aj_case.is_some() {
        (aj_id, aj_status, aj_case, aj_name, "analysis_json")
    } else {
        (None, None, None, None, "default")
    };

    if let (Some(db), Some(aj)) = (db_id, aj_id) {
        if db != aj {
            warn!(post_id = row.id, db_id = db, aj_id = aj, "Phenomenon id mismatch between columns and artifact");
        }
    }

    json!({
        "id": id,
        "status": status.unwrap_or("pending"),
        "case_id": case_id,
        "canonical_name": name,
        "source": source,
    })
}

/// Whitespace-collapsed preview snippet with ellipsis.
pub fn clean_snippet(text: &str, limit: usize) -> String {
    let normalized = text
        .replace(['\r', '\n'], " ")
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ");
    if normalized.chars().count() > limit {
        let cut: String = normalized.chars().take(limit).collect();
        format!("{}…", cut.trim_end())
    } else {
        normalized
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn row(
        phenomenon_id: Option<&str>,
        analysis_json: Option<Value>,
    ) -> PostListRow {
        PostListRow {
            id: 1,
            url: "https://www.threads.net/@u/post/A".to_string(),
            author: None,
            post_text: None,
            like_count: 0,
            view_count: 0,
            reply_count: 0,
            images: json!([]),
            analysis_json,
            analysis_is_valid: None,
            phenomenon_id: phenomenon_id.map(String::from),
            phenomenon_status: phenomenon_id.map(|_| "minted".to_string()),
            phenomenon_case_id: None,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn db_columns_win_over_artifact() {
        let aj = json!({"phenomenon": {"id": "aj-id", "status": "matched"}});
        let meta = merge_phenomenon_meta(&row(Some("db-id"), Some(aj)));
        assert_eq!(meta["id"], "db-id");
        assert_eq!(meta["status"], "minted");
        assert_eq!(meta["source"], "db_columns");
    }

    #[test]
    fn artifact_used_when_columns_empty() {
        let aj = json!({"phenomenon": {"id": "aj-id", "status": "matched", "name": "wave"}});
        let meta = merge_phenomenon_meta(&row(None, Some(aj)));
        assert_eq!(meta["id"], "aj-id");
        assert_eq!(meta["status"], "matched");
        assert_eq!(meta["canonical_name"], "wave");
        assert_eq!(meta["source"], "analysis_json");
    }

    #[test]
    fn default_is_pending() {
        let meta = merge_phenomenon_meta(&row(None, None));
        assert!(meta["id"].is_null());
        assert_eq!(meta["status"], "pending");
        assert_eq!(meta["source"], "default");
    }

    #[test]
    fn snippet_collapses_and_caps() {
        assert_eq!(clean_snippet("a\nb\r\n  c", 180), "a b c");
        let long = "word ".repeat(100);
        let s = clean_snippet(&long, 20);
        assert!(s.ends_with('…'));
        assert!(s.chars().count() <= 21);
    }
}
