//! Hybrid comment identity.
//!
//! Comments get a deterministic hash id so re-ingests map onto the same rows
//! even before the platform exposes a native comment id. When a native
//! `source_comment_id` shows up later it is recorded alongside and used to
//! look up the previously minted id; it never replaces it.

use sha2::{Digest, Sha256};

use crate::types::RawComment;

/// Collapse internal whitespace and trim, without touching case or emoji.
pub fn normalize_ws(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Deterministic fallback id: SHA-256 of `"{post_id}:{author}:{text}"` with
/// whitespace-normalized text.
pub fn fallback_comment_id(post_id: &str, author: &str, text: &str) -> String {
    let raw = format!("{post_id}:{author}:{}", normalize_ws(text));
    hex::encode(Sha256::digest(raw.as_bytes()))
}

/// Identity for a raw comment in the absence of a prior-row mapping. Always
/// the hash: a native id is recorded in its own column, never used as the
/// row id, so earlier cluster references stay valid.
pub fn comment_identity(post_id: &str, comment: &RawComment) -> String {
    let author = comment.author_handle.as_deref().unwrap_or("");
    fallback_comment_id(post_id, author, &comment.text)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn whitespace_normalization_is_stable() {
        assert_eq!(normalize_ws("  a\n b\t c  "), "a b c");
    }

    #[test]
    fn fallback_id_stable_across_whitespace_variants() {
        let a = fallback_comment_id("42", "alice", "hello  world");
        let b = fallback_comment_id("42", "alice", "hello\nworld");
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
    }

    #[test]
    fn fallback_id_differs_per_post() {
        let a = fallback_comment_id("42", "alice", "hello");
        let b = fallback_comment_id("43", "alice", "hello");
        assert_ne!(a, b);
    }
}
