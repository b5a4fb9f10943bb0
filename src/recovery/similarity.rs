//! Error-summary similarity used for recurring-failure detection.

use std::collections::HashSet;

/// Tokenize an error summary for comparison.
///
/// Lowercases, folds every digit to `#` so line numbers, ports and request
/// ids do not make otherwise identical errors look different, then splits on
/// anything that is not alphanumeric or `#`.
fn tokens(text: &str) -> HashSet<String> {
    text.to_lowercase()
        .chars()
        .map(|c| if c.is_ascii_digit() { '#' } else { c })
        .collect::<String>()
        .split(|c: char| !(c.is_alphanumeric() || c == '#'))
        .filter(|t| !t.is_empty())
        .map(String::from)
        .collect()
}

/// Jaccard similarity between the token sets of two error summaries.
///
/// Returns a score in `0.0..=1.0`. Two empty summaries are identical.
pub fn error_similarity(a: &str, b: &str) -> f64 {
    let a = tokens(a);
    let b = tokens(b);

    if a.is_empty() && b.is_empty() {
        return 1.0;
    }
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }

    let intersection = a.intersection(&b).count();
    let union = a.union(&b).count();

    intersection as f64 / union as f64
}
