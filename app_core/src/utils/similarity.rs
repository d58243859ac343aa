//! Text similarity used when matching noisy option labels and skill
//! suggestions against intended values.

use std::collections::HashSet;

/// Lowercase, strip punctuation to spaces, collapse whitespace.
pub fn normalize_label(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for ch in raw.chars() {
        if ch.is_alphanumeric() {
            out.extend(ch.to_lowercase());
        } else {
            out.push(' ');
        }
    }
    out.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Word-level Jaccard similarity over normalized tokens, in [0, 1].
///
/// Two empty strings are identical (1.0); one empty side scores 0.0.
pub fn word_jaccard(a: &str, b: &str) -> f64 {
    let set_a: HashSet<String> = normalize_label(a)
        .split_whitespace()
        .map(str::to_string)
        .collect();
    let set_b: HashSet<String> = normalize_label(b)
        .split_whitespace()
        .map(str::to_string)
        .collect();

    if set_a.is_empty() && set_b.is_empty() {
        return 1.0;
    }
    if set_a.is_empty() || set_b.is_empty() {
        return 0.0;
    }

    let intersection = set_a.intersection(&set_b).count() as f64;
    let union = set_a.union(&set_b).count() as f64;
    intersection / union
}

/// True when `candidate` equals or contains `intended` after normalization,
/// or the other way around.
pub fn containment_match(intended: &str, candidate: &str) -> bool {
    let a = normalize_label(intended);
    let b = normalize_label(candidate);
    if a.is_empty() || b.is_empty() {
        return false;
    }
    a == b || b.contains(&a) || a.contains(&b)
}
