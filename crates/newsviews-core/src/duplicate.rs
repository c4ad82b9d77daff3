//! TF-IDF duplicate detection over title + description text.
//!
//! The vector space is rebuilt for every check over the corpus plus the
//! candidate, with smoothed idf (`ln((1 + n) / (1 + df)) + 1`), raw term
//! counts and L2 normalisation. Tokens are lowercase alphanumeric runs of at
//! least two characters with English stop words removed. Ordered maps keep
//! the floating-point summation order, and so the scores, identical across runs.

use std::collections::{BTreeMap, BTreeSet};

use serde::Serialize;
use tracing::warn;

/// Default similarity at or above which a candidate is a duplicate.
pub const DEFAULT_THRESHOLD: f64 = 0.8;

const STOP_WORDS: &[&str] = &[
    "a", "about", "above", "after", "again", "against", "all", "almost", "also", "am", "among",
    "an", "and", "any", "are", "as", "at", "be", "became", "because", "been", "before", "being",
    "below", "between", "both", "but", "by", "can", "cannot", "could", "did", "do", "does",
    "doing", "done", "down", "during", "each", "either", "else", "enough", "etc", "even", "ever",
    "every", "few", "for", "from", "further", "had", "has", "have", "having", "he", "her", "here",
    "hers", "herself", "him", "himself", "his", "how", "however", "i", "if", "in", "into", "is",
    "it", "its", "itself", "just", "least", "less", "many", "may", "me", "might", "more", "most",
    "much", "must", "my", "myself", "neither", "no", "nor", "not", "now", "of", "off", "often",
    "on", "once", "only", "or", "other", "our", "ours", "ourselves", "out", "over", "own", "per",
    "rather", "same", "she", "should", "since", "so", "some", "still", "such", "than", "that",
    "the", "their", "theirs", "them", "themselves", "then", "there", "these", "they", "this",
    "those", "though", "through", "thus", "to", "too", "under", "until", "up", "upon", "us",
    "very", "via", "was", "we", "well", "were", "what", "whatever", "when", "where", "whether",
    "which", "while", "who", "whom", "whose", "why", "will", "with", "within", "without", "would",
    "yet", "you", "your", "yours", "yourself", "yourselves",
];

/// An accepted submission as seen by the detector.
#[derive(Debug, Clone, PartialEq)]
pub struct CorpusEntry {
    pub id: String,
    pub text: String,
}

impl CorpusEntry {
    pub fn new(id: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            text: text.into(),
        }
    }
}

/// Outcome of a duplicate check.
///
/// `score` is `None` when the corpus is empty or vectorisation failed.
/// `degraded` carries the reason when the check could not run; such a result
/// is never a duplicate.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DuplicateResult {
    pub is_duplicate: bool,
    pub score: Option<f64>,
    pub matched_id: Option<String>,
    pub degraded: Option<String>,
}

impl DuplicateResult {
    fn degraded(reason: impl Into<String>) -> Self {
        Self {
            degraded: Some(reason.into()),
            ..Default::default()
        }
    }
}

/// Near-duplicate detector with a fixed threshold.
#[derive(Debug, Clone, Copy)]
pub struct DuplicateDetector {
    threshold: f64,
}

impl Default for DuplicateDetector {
    fn default() -> Self {
        Self::new(DEFAULT_THRESHOLD)
    }
}

impl DuplicateDetector {
    pub fn new(threshold: f64) -> Self {
        Self { threshold }
    }

    pub fn threshold(&self) -> f64 {
        self.threshold
    }

    /// Compares `candidate` against every corpus entry.
    ///
    /// Never fails: a degenerate vector space produces a non-duplicate result
    /// with `degraded` set.
    pub fn detect(&self, candidate: &str, corpus: &[CorpusEntry]) -> DuplicateResult {
        let result = detect(candidate, corpus, self.threshold);
        if let Some(reason) = &result.degraded {
            warn!(reason = %reason, "Duplicate check degraded, letting submission through");
        }
        result
    }
}

/// Finds the most similar corpus entry and flags a duplicate when
/// `score >= threshold`. Ties keep the first entry in corpus order.
///
/// # Examples
///
/// ```
/// use newsviews_core::duplicate::{detect, CorpusEntry};
///
/// let corpus = vec![CorpusEntry::new("a", "Bridge closed for repairs downtown")];
/// let result = detect("Bridge closed for repairs downtown", &corpus, 0.8);
/// assert!(result.is_duplicate);
/// assert_eq!(result.matched_id.as_deref(), Some("a"));
/// ```
pub fn detect(candidate: &str, corpus: &[CorpusEntry], threshold: f64) -> DuplicateResult {
    if corpus.is_empty() {
        return DuplicateResult::default();
    }

    let candidate_tokens = tokenize(candidate);
    let corpus_tokens: Vec<Vec<String>> = corpus.iter().map(|e| tokenize(&e.text)).collect();

    let idf = inverse_document_frequency(
        corpus_tokens
            .iter()
            .chain(std::iter::once(&candidate_tokens)),
    );
    if idf.is_empty() {
        return DuplicateResult::degraded("empty vocabulary");
    }

    let candidate_vec = tfidf_vector(&candidate_tokens, &idf);

    let mut best: Option<(usize, f64)> = None;
    for (i, tokens) in corpus_tokens.iter().enumerate() {
        let similarity = cosine(&candidate_vec, &tfidf_vector(tokens, &idf));
        if !similarity.is_finite() {
            return DuplicateResult::degraded("non-finite similarity");
        }
        if best.map_or(true, |(_, max)| similarity > max) {
            best = Some((i, similarity));
        }
    }

    match best {
        Some((i, score)) => DuplicateResult {
            is_duplicate: score >= threshold,
            score: Some(score),
            matched_id: Some(corpus[i].id.clone()),
            degraded: None,
        },
        None => DuplicateResult::default(),
    }
}

fn tokenize(text: &str) -> Vec<String> {
    text.split(|c: char| !(c.is_alphanumeric() || c == '_'))
        .filter(|t| t.chars().count() >= 2)
        .map(|t| t.to_lowercase())
        .filter(|t| !STOP_WORDS.contains(&t.as_str()))
        .collect()
}

fn inverse_document_frequency<'a>(
    documents: impl Iterator<Item = &'a Vec<String>>,
) -> BTreeMap<String, f64> {
    let mut document_frequency: BTreeMap<String, usize> = BTreeMap::new();
    let mut n = 0usize;

    for tokens in documents {
        n += 1;
        let unique: BTreeSet<&String> = tokens.iter().collect();
        for term in unique {
            *document_frequency.entry(term.clone()).or_default() += 1;
        }
    }

    document_frequency
        .into_iter()
        .map(|(term, df)| {
            let idf = ((1.0 + n as f64) / (1.0 + df as f64)).ln() + 1.0;
            (term, idf)
        })
        .collect()
}

fn tfidf_vector(tokens: &[String], idf: &BTreeMap<String, f64>) -> BTreeMap<String, f64> {
    let mut counts: BTreeMap<String, f64> = BTreeMap::new();
    for token in tokens {
        *counts.entry(token.clone()).or_default() += 1.0;
    }

    let mut vector: BTreeMap<String, f64> = counts
        .into_iter()
        .map(|(term, tf)| {
            let weight = tf * idf.get(&term).copied().unwrap_or(0.0);
            (term, weight)
        })
        .collect();

    let norm = vector.values().map(|w| w * w).sum::<f64>().sqrt();
    if norm > 0.0 {
        vector.values_mut().for_each(|w| *w /= norm);
    }
    vector
}

/// Dot product of two L2-normalised sparse vectors. Zero vectors give 0.0.
fn cosine(a: &BTreeMap<String, f64>, b: &BTreeMap<String, f64>) -> f64 {
    let (small, large) = if a.len() <= b.len() { (a, b) } else { (b, a) };
    small
        .iter()
        .filter_map(|(term, w)| large.get(term).map(|v| w * v))
        .sum()
}
