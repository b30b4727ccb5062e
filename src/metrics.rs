// src/metrics.rs
use std::collections::HashMap;

use crate::data::normalize_string;

/// Modified n-gram precisions for n = 1..4 plus their brevity-penalized
/// geometric mean. Used for post-training spot checks, not for optimization.
#[derive(Clone, Copy, Debug, Default)]
pub struct BleuScore {
    pub precisions: [f64; 4],
    pub bleu: f64,
}

fn ngram_counts(tokens: &[String], n: usize) -> HashMap<&[String], usize> {
    let mut counts = HashMap::new();
    for gram in tokens.windows(n) {
        *counts.entry(gram).or_insert(0) += 1;
    }
    counts
}

fn modified_precision(reference: &[String], candidate: &[String], n: usize) -> f64 {
    let cand = ngram_counts(candidate, n);
    if cand.is_empty() {
        return 0.0;
    }
    let reference = ngram_counts(reference, n);

    let mut clipped = 0usize;
    let mut total = 0usize;
    for (gram, &count) in &cand {
        total += count;
        clipped += count.min(reference.get(gram).copied().unwrap_or(0));
    }
    clipped as f64 / total as f64
}

/// Sentence-level BLEU of a candidate reply against a single reference.
/// Both sides go through the corpus normalization first.
pub fn bleu_score(reference: &str, candidate: &str) -> BleuScore {
    let ref_tok: Vec<String> = normalize_string(reference)
        .split_whitespace()
        .map(str::to_string)
        .collect();
    let cand_tok: Vec<String> = normalize_string(candidate)
        .split_whitespace()
        .map(str::to_string)
        .collect();
    if ref_tok.is_empty() || cand_tok.is_empty() {
        return BleuScore::default();
    }

    let mut precisions = [0.0f64; 4];
    for (i, p) in precisions.iter_mut().enumerate() {
        *p = modified_precision(&ref_tok, &cand_tok, i + 1);
    }

    let c = cand_tok.len() as f64;
    let r = ref_tok.len() as f64;
    let brevity = if c > r { 1.0 } else { (1.0 - r / c).exp() };

    // Any zero precision zeroes the geometric mean.
    let bleu = if precisions.iter().all(|&p| p > 0.0) {
        brevity * precisions.iter().product::<f64>().powf(0.25)
    } else {
        0.0
    };

    BleuScore { precisions, bleu }
}
