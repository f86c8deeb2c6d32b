//! Fuzzy string similarity for the near-duplicate delegation guard

/// Above this ratio, delegated instructions count as a copy of the request
pub const DUPLICATE_THRESHOLD: f64 = 80.0;

/// Normalized indel similarity in `0.0..=100.0`.
///
/// `200 * lcs(a, b) / (len(a) + len(b))`, computed over chars. Two empty
/// strings are identical.
pub fn ratio(a: &str, b: &str) -> f64 {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();
    let total = a.len() + b.len();
    if total == 0 {
        return 100.0;
    }
    200.0 * lcs_len(&a, &b) as f64 / total as f64
}

/// Whether `instructions` is essentially the request it was meant to break up
pub fn is_near_duplicate(instructions: &str, request: &str) -> bool {
    ratio(instructions, request) > DUPLICATE_THRESHOLD
}

fn lcs_len(a: &[char], b: &[char]) -> usize {
    let (short, long) = if a.len() <= b.len() { (a, b) } else { (b, a) };
    let mut prev = vec![0usize; short.len() + 1];
    let mut cur = vec![0usize; short.len() + 1];
    for &lc in long {
        for (j, &sc) in short.iter().enumerate() {
            cur[j + 1] = if lc == sc {
                prev[j] + 1
            } else {
                cur[j].max(prev[j + 1])
            };
        }
        std::mem::swap(&mut prev, &mut cur);
    }
    prev[short.len()]
}
