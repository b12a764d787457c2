//! Edit-distance similarity between a harvested message and the canonical
//! statement. Expressed as a percentage so thresholds read naturally
//! (80.0 = "at least 80% similar").

use strsim::levenshtein;

/// Similarity of `a` and `b` in percent, 0.0..=100.0.
///
/// `(1 - distance / max_len) * 100`, where `max_len` counts chars of the
/// longer string. Two empty strings are identical (100.0).
pub fn similarity_pct(a: &str, b: &str) -> f64 {
    let longest = a.chars().count().max(b.chars().count());
    if longest == 0 {
        return 100.0;
    }
    let distance = levenshtein(a, b);
    (1.0 - distance as f64 / longest as f64) * 100.0
}
