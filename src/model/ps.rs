// Copyright 2025-present Harīṣh Tummalachērla
// SPDX-License-Identifier: Apache-2.0

//! The parameter-server-backed model used for training.
//!
//! The distributed fabric itself is not part of this crate; it is
//! specified through the `ParameterServer` capability set — read a row,
//! add a delta to a cell, flush — with monotone counters and eventual
//! delivery. `LocalServer` is the in-process implementation of that
//! contract, sharding word rows across `num_servers` stores the way the
//! remote fabric shards them across machines.
//!
//! `PsModel` is what the samplers see. Reads are served from a local
//! cache refreshed once per slice with exactly the rows that slice needs.
//! Writes never touch the cache: they accumulate in per-word delta rows
//! (sized by the node-local term frequency) and are pushed to the server
//! when the slice ends. Within a slice every thread therefore samples
//! against a frozen snapshot plus its own document's updates — the stale
//! synchronous regime the sampler is designed to tolerate.

use std::sync::Arc;

use crate::config::{Config, SUMMARY_TABLE, WORD_TOPIC_TABLE};
use crate::meta::Meta;
use crate::model::row::{SummaryRow, WordTopicRow};
use crate::model::{ModelAccess, ModelStore};

/// Capability set of the parameter-server fabric.
pub trait ParameterServer: Send + Sync {
    /// Visit every nonzero cell of `(table, row)`.
    fn for_each_in_row(&self, table: i32, row: i64, visit: &mut dyn FnMut(i32, i64));
    /// Add a signed delta to `(table, row, col)`.
    fn add_delta(&self, table: i32, row: i64, col: i32, delta: i64);
    /// Make previously added deltas visible to subsequent reads.
    fn flush(&self);
}

/// In-process parameter server: word rows sharded by id, the summary row
/// on shard 0. Counters are atomic, so deltas are visible immediately and
/// `flush` has nothing left to do.
pub struct LocalServer {
    shards: Vec<ModelStore>,
}

impl LocalServer {
    pub fn new(meta: &Meta, cfg: &Config) -> Self {
        let num_shards = cfg.num_servers.max(1);
        let shards = (0..num_shards)
            .map(|shard| {
                ModelStore::with_rows(
                    cfg,
                    (0..cfg.num_vocabs).map(move |w| {
                        if w % num_shards == shard {
                            meta.tf(w as i32) as usize
                        } else {
                            0
                        }
                    }),
                )
            })
            .collect();
        LocalServer { shards }
    }

    #[inline]
    fn shard_of(&self, row: i64) -> &ModelStore {
        &self.shards[(row as usize) % self.shards.len()]
    }
}

impl ParameterServer for LocalServer {
    fn for_each_in_row(&self, table: i32, row: i64, visit: &mut dyn FnMut(i32, i64)) {
        match table {
            WORD_TOPIC_TABLE => {
                for (k, v) in self.shard_of(row).row(row as i32).iter_nonzero() {
                    visit(k, i64::from(v));
                }
            }
            SUMMARY_TABLE => {
                for (k, v) in self.shards[0].summary().iter_nonzero() {
                    visit(k, v);
                }
            }
            _ => {}
        }
    }

    fn add_delta(&self, table: i32, row: i64, col: i32, delta: i64) {
        match table {
            WORD_TOPIC_TABLE => self.shard_of(row).add_word_topic(row as i32, col, delta as i32),
            SUMMARY_TABLE => self.shards[0].add_summary(col, delta),
            _ => {}
        }
    }

    fn flush(&self) {}
}

/// The training model: server-backed reads through a per-slice cache,
/// writes through a delta aggregator.
pub struct PsModel {
    server: Arc<dyn ParameterServer>,
    cache: ModelStore,
    deltas: ModelStore,
}

impl PsModel {
    pub fn new(meta: &Meta, cfg: &Config, server: Arc<dyn ParameterServer>) -> Self {
        PsModel {
            server,
            cache: ModelStore::from_meta(meta, cfg),
            deltas: ModelStore::delta_rows(meta, cfg),
        }
    }

    /// Refresh the cache with the rows the upcoming slice will touch.
    /// Called by the leader thread before the alias-build barrier.
    pub fn request_slice(&self, words: &[i32]) {
        for &word in words {
            let row = self.cache.row(word);
            row.clear();
            self.server
                .for_each_in_row(WORD_TOPIC_TABLE, i64::from(word), &mut |k, v| {
                    row.add(k, v as i32);
                });
        }
        self.cache.summary().clear();
        self.server.for_each_in_row(SUMMARY_TABLE, 0, &mut |k, v| {
            self.cache.summary().add(k, v);
        });
    }

    /// Push the slice's accumulated deltas to the server and reset the
    /// aggregator. Called by the leader thread after the sampling barrier.
    pub fn flush_deltas(&self, words: &[i32]) {
        for &word in words {
            if !self.deltas.has_row(word) {
                continue;
            }
            let row = self.deltas.row(word);
            for (k, v) in row.iter_nonzero() {
                self.server
                    .add_delta(WORD_TOPIC_TABLE, i64::from(word), k, i64::from(v));
            }
            row.clear();
        }
        for (k, v) in self.deltas.summary().iter_nonzero() {
            self.server.add_delta(SUMMARY_TABLE, 0, k, v);
        }
        self.deltas.summary().clear();
        self.server.flush();
    }

    /// Seed the server tables from a block's current topic assignments.
    /// Used by the initialization pass before the first iteration.
    pub fn seed_token(&self, word: i32, topic: i32) {
        self.server
            .add_delta(WORD_TOPIC_TABLE, i64::from(word), topic, 1);
        self.server.add_delta(SUMMARY_TABLE, 0, topic, 1);
    }

    pub fn server(&self) -> &Arc<dyn ParameterServer> {
        &self.server
    }
}

impl ModelAccess for PsModel {
    fn word_topic_row(&self, word: i32) -> &WordTopicRow {
        self.cache.row(word)
    }

    fn summary_row(&self) -> &SummaryRow {
        self.cache.summary()
    }

    fn add_word_topic(&self, word: i32, topic: i32, delta: i32) {
        self.deltas.add_word_topic(word, topic, delta);
    }

    fn add_summary(&self, topic: i32, delta: i64) {
        self.deltas.add_summary(topic, delta);
    }
}
