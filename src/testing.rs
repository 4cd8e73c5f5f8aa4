// Copyright 2025-present Harīṣh Tummalachērla
// SPDX-License-Identifier: Apache-2.0

//! Test utilities shared across unit and integration tests.
//!
//! This module is always compiled but hidden from documentation.
//! It writes miniature corpora in the real on-disk formats so tests
//! exercise the same loaders the engine uses.

#![doc(hidden)]

use std::collections::BTreeMap;
use std::io;
use std::path::Path;

use crate::block::write_block_file;
use crate::config::Config;
use crate::meta::write_vocab_file;

/// Write `block.<n>` and `vocab.<n>` files for a corpus given as
/// blocks -> documents -> (word, topic) pairs. Documents must already be
/// sorted by word id. Term frequencies are derived from the documents,
/// with `tf == local_tf` as on a single-node setup.
pub fn write_corpus(dir: &Path, blocks: &[Vec<Vec<(i32, i32)>>]) -> io::Result<()> {
    for (n, docs) in blocks.iter().enumerate() {
        write_block_file(&dir.join(format!("block.{}", n)), docs)
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e.to_string()))?;

        let mut counts: BTreeMap<i32, i32> = BTreeMap::new();
        for doc in docs {
            for &(word, _) in doc {
                *counts.entry(word).or_insert(0) += 1;
            }
        }
        let words: Vec<i32> = counts.keys().copied().collect();
        let tf: Vec<i32> = counts.values().copied().collect();
        write_vocab_file(&dir.join(format!("vocab.{}", n)), &words, &tf, &tf)?;
    }
    Ok(())
}

/// A small config pointed at `dir`, sized for unit-test corpora.
pub fn small_config(dir: &Path, num_vocabs: usize, num_topics: usize) -> Config {
    Config {
        num_vocabs,
        num_topics,
        num_iterations: 1,
        num_blocks: 1,
        num_local_workers: 1,
        max_num_document: 64,
        data_capacity: 1 << 16,
        model_capacity: 1 << 20,
        delta_capacity: 1 << 20,
        alias_capacity: 1 << 20,
        input_dir: dir.to_path_buf(),
        seed: Some(0x1234_5678),
        ..Config::default()
    }
}
