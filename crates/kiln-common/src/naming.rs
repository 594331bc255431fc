//! Deterministic naming helpers
//!
//! Dependent object names and artifact paths must be stable across
//! controller restarts, so everything here is a pure function of its input.

use std::fmt::Write;

/// Maximum length of a DNS-1123 label (Job, Service, Pod names)
pub const MAX_LABEL_LEN: usize = 63;

/// SHA-256 of the input, hex encoded, truncated to `len` characters
pub fn deterministic_hash(input: &str, len: usize) -> String {
    use aws_lc_rs::digest;
    let hash = digest::digest(&digest::SHA256, input.as_bytes());
    let mut out = hash
        .as_ref()
        .iter()
        .fold(String::with_capacity(64), |mut s, b| {
            let _ = write!(s, "{:02x}", b);
            s
        });
    out.truncate(len);
    out
}

/// Lowercase the input and replace anything outside `[a-z0-9-]` with `-`
pub fn sanitize(input: &str) -> String {
    let sanitized: String = input
        .to_lowercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
        .collect();
    sanitized.trim_matches('-').to_string()
}

/// Truncate a name to a valid DNS-1123 label.
///
/// Names that fit are returned unchanged. Longer names keep a prefix and get
/// a short hash of the full name appended so that two long names sharing a
/// prefix do not collide.
pub fn truncate_label(name: &str) -> String {
    if name.len() <= MAX_LABEL_LEN {
        return name.to_string();
    }
    let suffix = deterministic_hash(name, 8);
    let keep = MAX_LABEL_LEN - suffix.len() - 1;
    let prefix = name[..keep].trim_end_matches('-');
    format!("{}-{}", prefix, suffix)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_is_deterministic_and_truncated() {
        let a = deterministic_hash("model/default/llama", 16);
        let b = deterministic_hash("model/default/llama", 16);
        assert_eq!(a, b);
        assert_eq!(a.len(), 16);
        assert_ne!(a, deterministic_hash("model/default/llama2", 16));
    }

    #[test]
    fn sanitize_replaces_invalid_characters() {
        assert_eq!(sanitize("Meta_Llama/3.1"), "meta-llama-3-1");
        assert_eq!(sanitize("--x--"), "x");
    }

    #[test]
    fn short_names_are_untouched() {
        assert_eq!(truncate_label("llama-modeller"), "llama-modeller");
    }

    #[test]
    fn long_names_are_capped_and_distinct() {
        let a = format!("{}-model-container-builder", "a".repeat(60));
        let b = format!("{}-server-container-builder", "a".repeat(60));
        let ta = truncate_label(&a);
        let tb = truncate_label(&b);
        assert!(ta.len() <= MAX_LABEL_LEN);
        assert!(tb.len() <= MAX_LABEL_LEN);
        assert_ne!(ta, tb);
        assert_eq!(ta, truncate_label(&a));
    }
}
