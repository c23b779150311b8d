//! Text primitives shared by dedup, retrieval and consolidation

use sha2::{Digest, Sha256};
use std::collections::HashSet;

/// Topics that make a record part of the user's core identity.
/// Records mentioning any of these are never aged or purged.
pub const CORE_KEYWORDS: &[&str] = &["name", "age", "family", "job", "location"];

/// Lower-case and trim. Two texts with the same normalized form are the same memory.
pub fn normalize(text: &str) -> String {
    text.trim().to_lowercase()
}

/// Hex SHA-256 of the normalized text
pub fn content_hash(text: &str) -> String {
    let digest = Sha256::digest(normalize(text).as_bytes());
    hex::encode(digest)
}

/// Canonical profile key: lowercase ASCII alphanumerics joined by single
/// underscores, so "Favorite Color" and "favorite_color" name one fact.
pub fn canonical_key(key: &str) -> String {
    let raw = key.trim();
    let mut out = String::with_capacity(raw.len());
    let mut last_was_sep = false;
    for ch in raw.chars() {
        if ch.is_alphanumeric() {
            out.extend(ch.to_lowercase());
            last_was_sep = false;
        } else if !last_was_sep {
            out.push('_');
            last_was_sep = true;
        }
    }
    out.trim_matches('_').to_string()
}

fn word_set(text: &str) -> HashSet<String> {
    text.split_whitespace().map(|w| w.to_lowercase()).collect()
}

/// Jaccard overlap of the two texts' lowercase word sets.
///
/// Returns 0.0 when both texts are blank.
pub fn jaccard_similarity(a: &str, b: &str) -> f64 {
    let a = word_set(a);
    let b = word_set(b);
    let union = a.union(&b).count();
    if union == 0 {
        return 0.0;
    }
    let intersection = a.intersection(&b).count();
    intersection as f64 / union as f64
}

/// Substring match against [`CORE_KEYWORDS`], so inflections like "jobs",
/// "names" or "aged" stay protected.
pub fn is_core_memory(text: &str) -> bool {
    let normalized = normalize(text);
    CORE_KEYWORDS.iter().any(|kw| normalized.contains(kw))
}
