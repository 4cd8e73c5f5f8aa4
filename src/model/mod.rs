// Copyright 2025-present Harīṣh Tummalachērla
// SPDX-License-Identifier: Apache-2.0

//! Model accessors: how the sampler sees the word-topic counters.
//!
//! The sampler only ever needs four capabilities: read a word's topic row,
//! read the summary row, and issue relative deltas against either. The
//! `ModelAccess` trait captures exactly that. Training binds it to a
//! parameter-server-backed implementation whose deltas are buffered and
//! flushed at slice boundaries; inference binds it to a read-only model
//! loaded from disk whose mutators do nothing. The trait is dispatched
//! once per run through generics, so per-token calls monomorphize.

pub mod local;
pub mod ps;
pub mod row;

use crate::config::Config;
use crate::meta::Meta;
use row::{SummaryRow, WordTopicRow};

/// The sampler's view of the model.
pub trait ModelAccess: Sync {
    fn word_topic_row(&self, word: i32) -> &WordTopicRow;
    fn summary_row(&self) -> &SummaryRow;
    fn add_word_topic(&self, word: i32, topic: i32, delta: i32);
    fn add_summary(&self, topic: i32, delta: i64);

    #[inline]
    fn word_topic(&self, word: i32, topic: i32) -> i32 {
        self.word_topic_row(word).get(topic)
    }
}

/// Word-topic rows plus the summary row, with the dense/sparse layout
/// decided per word from its term frequency. Shared by the local model,
/// the parameter-server cache, and the server shards.
pub struct ModelStore {
    rows: Vec<Option<WordTopicRow>>,
    summary: SummaryRow,
    absent: WordTopicRow,
}

impl ModelStore {
    pub fn new(cfg: &Config, rows: Vec<Option<WordTopicRow>>) -> Self {
        ModelStore {
            rows,
            summary: SummaryRow::new(cfg.num_topics),
            absent: WordTopicRow::Sparse(row::SparseCounts::new(1)),
        }
    }

    /// Allocate rows for every word with nonzero tf.
    pub fn from_meta(meta: &Meta, cfg: &Config) -> Self {
        Self::with_rows(cfg, (0..cfg.num_vocabs).map(|w| meta.tf(w as i32) as usize))
    }

    /// Allocate rows from an explicit tf iterator (tests, shards).
    pub fn with_rows(cfg: &Config, tfs: impl Iterator<Item = usize>) -> Self {
        let rows = tfs
            .map(|tf| (tf > 0).then(|| WordTopicRow::for_word(tf, cfg.num_topics)))
            .collect();
        Self::new(cfg, rows)
    }

    /// Allocate delta aggregation rows for every word with nonzero
    /// node-local tf.
    pub fn delta_rows(meta: &Meta, cfg: &Config) -> Self {
        let rows = (0..cfg.num_vocabs)
            .map(|w| {
                let local_tf = meta.local_tf(w as i32) as usize;
                (local_tf > 0).then(|| WordTopicRow::for_delta(local_tf, cfg.num_topics))
            })
            .collect();
        Self::new(cfg, rows)
    }

    /// Row for `word`; words with zero tf share an immutable empty row.
    #[inline]
    pub fn row(&self, word: i32) -> &WordTopicRow {
        self.rows
            .get(word as usize)
            .and_then(Option::as_ref)
            .unwrap_or(&self.absent)
    }

    #[inline]
    pub fn has_row(&self, word: i32) -> bool {
        matches!(self.rows.get(word as usize), Some(Some(_)))
    }

    #[inline]
    pub fn summary(&self) -> &SummaryRow {
        &self.summary
    }

    pub fn add_word_topic(&self, word: i32, topic: i32, delta: i32) {
        if let Some(Some(row)) = self.rows.get(word as usize) {
            row.add(topic, delta);
        }
    }

    pub fn add_summary(&self, topic: i32, delta: i64) {
        self.summary.add(topic, delta);
    }

    pub fn num_words(&self) -> usize {
        self.rows.len()
    }
}
