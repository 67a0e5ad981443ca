//! URL normalization for Threads post links.
//!
//! Threads serves the same post under `threads.com` and `threads.net` hosts;
//! the store keys posts by the `www.threads.net` form.

use url::Url;

/// Rewrite alias hosts onto `www.threads.net` and collapse accidental
/// `www.www` doubling. Leaves unparseable input untouched.
pub fn normalize_url(raw: &str) -> String {
    let mut out = raw.trim().to_string();
    while out.contains("www.www") {
        out = out.replace("www.www", "www.");
    }

    if let Ok(parsed) = Url::parse(&out) {
        if let Some(host) = parsed.host_str() {
            if host.contains("threads.com") {
                let scheme = parsed.scheme();
                return format!("{scheme}://www.threads.net{}", parsed.path());
            }
        }
    }
    out
}

/// Canonical form used as the post uniqueness key: query dropped, host
/// normalized.
pub fn canonicalize_url(raw: &str) -> String {
    let base = raw.split('?').next().unwrap_or(raw);
    normalize_url(base)
}

/// Last non-empty path segment, the post shortcode used for recovery lookups.
pub fn trailing_shortcode(raw: &str) -> Option<String> {
    let parsed = Url::parse(raw).ok()?;
    parsed
        .path_segments()?
        .filter(|p| !p.is_empty())
        .next_back()
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rewrites_threads_com_host() {
        assert_eq!(
            normalize_url("https://www.threads.com/@u/post/ABC"),
            "https://www.threads.net/@u/post/ABC"
        );
        assert_eq!(
            normalize_url("https://threads.com/@u/post/ABC"),
            "https://www.threads.net/@u/post/ABC"
        );
    }

    #[test]
    fn leaves_net_host_alone() {
        assert_eq!(
            normalize_url("https://www.threads.net/@u/post/ABC"),
            "https://www.threads.net/@u/post/ABC"
        );
    }

    #[test]
    fn collapses_doubled_www() {
        assert_eq!(
            normalize_url("https://www.www.threads.net/@u/post/ABC"),
            "https://www.threads.net/@u/post/ABC"
        );
    }

    #[test]
    fn canonical_form_drops_query() {
        assert_eq!(
            canonicalize_url("https://www.threads.com/@u/post/ABC?igshid=xyz"),
            "https://www.threads.net/@u/post/ABC"
        );
    }

    #[test]
    fn extracts_shortcode() {
        assert_eq!(
            trailing_shortcode("https://www.threads.net/@u/post/ABC123"),
            Some("ABC123".to_string())
        );
        assert_eq!(trailing_shortcode("not a url"), None);
    }
}
