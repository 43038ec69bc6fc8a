//! Normalized edit-distance similarity for student names.

/// Similarity in `[0, 1]`: `(max_len - levenshtein) / max_len` over lowercased strings.
///
/// Lengths are counted in chars. Two empty strings are identical (1.0).
pub fn similarity(a: &str, b: &str) -> f64 {
    let a = a.to_lowercase();
    let b = b.to_lowercase();

    let max_len = a.chars().count().max(b.chars().count());
    if max_len == 0 {
        return 1.0;
    }

    let distance = strsim::levenshtein(&a, &b);
    (max_len - distance) as f64 / max_len as f64
}
