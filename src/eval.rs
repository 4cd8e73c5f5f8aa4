// Copyright 2025-present Harīṣh Tummalachērla
// SPDX-License-Identifier: Apache-2.0

//! Model likelihood, reported during training to watch convergence.
//!
//! The joint log-likelihood splits into a document part (a function of
//! each document's topic counts), a word part (a function of each word's
//! topic counts), and a normalization term over the summary row. All
//! three are pure functions of counter rows; the trainer sums the first
//! two across threads under a mutex and logs the totals.

use crate::model::row::{SummaryRow, TopicCounter, WordTopicRow};

const LANCZOS: [f64; 6] = [
    76.180_091_729_471_46,
    -86.505_320_329_416_77,
    24.014_098_240_830_91,
    -1.231_739_572_450_155,
    0.120_865_097_386_617_9e-2,
    -0.539_523_938_495_3e-5,
];

/// Lanczos approximation of `ln Γ(x)` for positive `x`.
pub fn log_gamma(x: f64) -> f64 {
    let mut y = x;
    let mut tmp = x + 5.5;
    tmp -= (x + 0.5) * tmp.ln();
    let mut ser = 1.000_000_000_190_015;
    for c in LANCZOS {
        y += 1.0;
        ser += c / y;
    }
    -tmp + (2.506_628_274_631_000_5 * ser / x).ln()
}

/// Log-likelihood contribution of one document, given its topic counter.
pub fn doc_likelihood(
    counter: &TopicCounter,
    doc_len: usize,
    alpha: f32,
    num_topics: usize,
) -> f64 {
    if doc_len == 0 {
        return 0.0;
    }
    let alpha = f64::from(alpha);
    let k = num_topics as f64;
    let mut llh = log_gamma(k * alpha) - k * log_gamma(alpha);
    let mut nonzero = 0usize;
    for (_, count) in counter.iter_nonzero() {
        llh += log_gamma(f64::from(count) + alpha);
        nonzero += 1;
    }
    llh += (k - nonzero as f64) * log_gamma(alpha);
    llh -= log_gamma(doc_len as f64 + alpha * k);
    llh
}

/// Log-likelihood contribution of one word's topic row.
pub fn word_likelihood(row: &WordTopicRow, beta: f32, num_topics: usize) -> f64 {
    let beta = f64::from(beta);
    let mut llh = 0.0;
    let mut nonzero = 0usize;
    for (_, count) in row.iter_nonzero() {
        llh += log_gamma(f64::from(count) + beta);
        nonzero += 1;
    }
    if nonzero == 0 {
        return 0.0;
    }
    llh + (num_topics - nonzero) as f64 * log_gamma(beta)
}

/// Normalization term of the word likelihood, over the summary row.
pub fn normalize_word_likelihood(
    summary: &SummaryRow,
    beta: f32,
    num_vocabs: usize,
    num_topics: usize,
) -> f64 {
    let beta = f64::from(beta);
    let v = num_vocabs as f64;
    let mut llh = num_topics as f64 * (log_gamma(beta * v) - v * log_gamma(beta));
    for k in 0..num_topics {
        llh -= log_gamma(summary.get(k as i32) as f64 + v * beta);
    }
    llh
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log_gamma_matches_known_values() {
        // Γ(1) = Γ(2) = 1, Γ(5) = 24.
        assert!(log_gamma(1.0).abs() < 1e-9);
        assert!(log_gamma(2.0).abs() < 1e-9);
        assert!((log_gamma(5.0) - 24f64.ln()).abs() < 1e-9);
        // Γ(0.5) = sqrt(pi).
        assert!((log_gamma(0.5) - std::f64::consts::PI.sqrt().ln()).abs() < 1e-9);
    }

    #[test]
    fn empty_doc_contributes_nothing() {
        let counter = TopicCounter::with_capacity(4);
        assert_eq!(doc_likelihood(&counter, 0, 0.1, 8), 0.0);
    }

    #[test]
    fn concentrated_doc_beats_spread_doc() {
        // With alpha < 1, a document concentrated on one topic is more
        // likely than one spread over many.
        let mut concentrated = TopicCounter::with_capacity(8);
        concentrated.add(0, 6);
        let mut spread = TopicCounter::with_capacity(8);
        for k in 0..6 {
            spread.add(k, 1);
        }
        let a = doc_likelihood(&concentrated, 6, 0.1, 8);
        let b = doc_likelihood(&spread, 6, 0.1, 8);
        assert!(a > b, "{} should exceed {}", a, b);
    }

    #[test]
    fn empty_word_row_contributes_nothing() {
        let row = WordTopicRow::for_word(4, 100);
        assert_eq!(word_likelihood(&row, 0.01, 100), 0.0);
    }
}
