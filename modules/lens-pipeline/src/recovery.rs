//! Post-id recovery: when the scrape returns without an id, the row usually
//! exists under a slightly different canonical URL. Poll the candidates
//! before declaring the item lost.

use std::time::Duration;

use tracing::info;

use lens_store::Store;
use threads_client::{canonicalize_url, normalize_url, trailing_shortcode};

const RECOVERY_ATTEMPTS: usize = 3;
const RECOVERY_DELAY: Duration = Duration::from_secs(1);

/// Candidate URLs in lookup order: raw, query-stripped, host-normalized.
pub fn url_candidates(url: &str) -> Vec<String> {
    let raw = url.trim();
    let mut candidates: Vec<String> = Vec::new();

    let mut push = |u: String| {
        if !u.is_empty() && !candidates.contains(&u) {
            candidates.push(u);
        }
    };

    push(normalize_url(raw));
    if raw.contains('?') {
        push(canonicalize_url(raw));
    }
    candidates
}

/// Poll the store for a post id by candidate URL, then by shortcode, with a
/// fixed attempt budget. Returns the id and the list of candidates tried.
pub async fn recover_post_id(store: &Store, url: &str) -> (Option<i64>, Vec<String>) {
    let candidates = url_candidates(url);
    let shortcode = trailing_shortcode(url);
    let mut tried: Vec<String> = Vec::new();

    for attempt in 1..=RECOVERY_ATTEMPTS {
        for candidate in &candidates {
            tried.push(candidate.clone());
            if let Ok(Some(id)) = store.get_post_id_by_url(candidate).await {
                info!(url = candidate.as_str(), "Post id recovered via url");
                return (Some(id), tried);
            }
        }
        if let Some(ref code) = shortcode {
            if let Ok(Some(id)) = store.get_post_id_by_shortcode(code).await {
                info!(shortcode = code.as_str(), "Post id recovered via shortcode");
                return (Some(id), tried);
            }
        }
        if attempt < RECOVERY_ATTEMPTS {
            tokio::time::sleep(RECOVERY_DELAY).await;
        }
    }

    (None, tried)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn candidates_dedupe_and_strip_query() {
        let c = url_candidates("https://www.threads.net/@u/post/ABC?igshid=1");
        assert_eq!(
            c,
            vec![
                "https://www.threads.net/@u/post/ABC?igshid=1",
                "https://www.threads.net/@u/post/ABC",
            ]
        );
    }

    #[test]
    fn candidates_rebuild_alias_host() {
        let c = url_candidates("https://www.threads.com/@u/post/ABC");
        assert_eq!(c, vec!["https://www.threads.net/@u/post/ABC"]);
    }

    #[test]
    fn clean_url_yields_single_candidate() {
        let c = url_candidates("https://www.threads.net/@u/post/ABC");
        assert_eq!(c.len(), 1);
    }
}
