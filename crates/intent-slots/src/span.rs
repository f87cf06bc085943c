//! Candidate spans produced by the individual matchers.

/// One possible match for a slot, before overlap resolution.
#[derive(Debug, Clone)]
pub struct Candidate<T> {
    pub start: usize,
    pub end: usize,
    pub matched_text: String,
    pub value: String,
    pub confidence: f64,
    pub payload: T,
}

impl<T> Candidate<T> {
    pub fn new(
        start: usize,
        end: usize,
        matched_text: impl Into<String>,
        value: impl Into<String>,
        confidence: f64,
        payload: T,
    ) -> Self {
        Self {
            start,
            end,
            matched_text: matched_text.into(),
            value: value.into(),
            confidence,
            payload,
        }
    }
}

/// Order candidates by position, longer spans first on ties.
pub fn sort_candidates<T>(candidates: &mut [Candidate<T>]) {
    candidates.sort_by(|a, b| a.start.cmp(&b.start).then(b.end.cmp(&a.end)));
}

/// Every occurrence of every dictionary word, as `(start, end, word)`.
pub fn scan_dictionary<'a>(text: &str, words: &[&'a str]) -> Vec<(usize, usize, &'a str)> {
    let mut hits = Vec::new();
    for word in words {
        for (pos, _) in text.match_indices(word) {
            hits.push((pos, pos + word.len(), *word));
        }
    }
    hits.sort_by(|a, b| a.0.cmp(&b.0).then(b.1.cmp(&a.1)));
    hits
}
