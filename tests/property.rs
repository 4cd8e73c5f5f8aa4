// Copyright 2025-present Harīṣh Tummalachērla
// SPDX-License-Identifier: Apache-2.0

//! Property-based tests for the planner, the counter rows, and the block
//! format.

use std::collections::HashMap;

use proptest::prelude::*;

use lightlda::block::{write_block_file, DataBlock};
use lightlda::meta::{alias_bytes, delta_bytes, model_bytes, plan_slices, Budgets};
use lightlda::model::row::{SparseCounts, TopicCounter};
use lightlda::Config;

proptest! {
    /// Every multi-word slice stays under all three budgets, boundaries
    /// strictly increase, and the slices cover the vocabulary exactly.
    #[test]
    fn planner_respects_budgets(
        tfs in prop::collection::vec(1i32..500, 1..120),
        num_topics in 2usize..512,
        model_words in 1usize..6,
        alias_words in 1usize..6,
        delta_words in 1usize..6,
    ) {
        let words: Vec<i32> = (0..tfs.len() as i32).collect();
        let local_tf: Vec<i32> = tfs.iter().map(|&t| (t + 1) / 2).collect();
        // Budgets scaled to hold a handful of worst-case words each.
        let budgets = Budgets {
            model: model_words * num_topics * 4,
            alias: alias_words * num_topics * 8,
            delta: delta_words * num_topics * 4,
        };
        let bounds = plan_slices(&words, &tfs, &local_tf, num_topics, budgets);

        prop_assert_eq!(bounds[0], 0);
        prop_assert_eq!(*bounds.last().unwrap(), words.len());
        for pair in bounds.windows(2) {
            prop_assert!(pair[0] < pair[1], "empty slice in {:?}", bounds);
        }
        for pair in bounds.windows(2) {
            let slice = &words[pair[0]..pair[1]];
            if slice.len() == 1 {
                continue;
            }
            let sum = |f: &dyn Fn(usize, usize) -> usize, freqs: &[i32]| -> usize {
                slice.iter().map(|&w| f(freqs[w as usize] as usize, num_topics)).sum()
            };
            prop_assert!(sum(&model_bytes, &tfs) <= budgets.model);
            prop_assert!(sum(&alias_bytes, &tfs) <= budgets.alias);
            prop_assert!(sum(&delta_bytes, &local_tf) <= budgets.delta);
        }
    }

    /// Sparse atomic counters agree with a reference map under any add
    /// sequence.
    #[test]
    fn sparse_counts_match_reference(
        ops in prop::collection::vec((0i32..32, -3i32..4), 0..300),
    ) {
        let row = SparseCounts::new(64);
        let mut reference: HashMap<i32, i32> = HashMap::new();
        for &(k, delta) in &ops {
            row.add(k, delta);
            *reference.entry(k).or_insert(0) += delta;
        }
        for (&k, &v) in &reference {
            prop_assert_eq!(row.get(k), v);
        }
        let total: i64 = row.iter_nonzero().map(|(_, v)| i64::from(v)).sum();
        let expected: i64 = reference.values().map(|&v| i64::from(v)).sum();
        prop_assert_eq!(total, expected);
    }

    /// The thread-local topic counter agrees with a reference map and
    /// clears completely.
    #[test]
    fn topic_counter_matches_reference(
        ops in prop::collection::vec((0i32..128, -2i32..3), 0..200),
    ) {
        let mut counter = TopicCounter::with_capacity(128);
        let mut reference: HashMap<i32, i32> = HashMap::new();
        for &(k, delta) in &ops {
            counter.add(k, delta);
            *reference.entry(k).or_insert(0) += delta;
        }
        for (&k, &v) in &reference {
            prop_assert_eq!(counter.get(k), v);
        }
        counter.clear();
        for &k in reference.keys() {
            prop_assert_eq!(counter.get(k), 0);
        }
    }

    /// write -> read -> write reproduces a block file byte for byte.
    #[test]
    fn block_files_round_trip(
        docs in prop::collection::vec(
            prop::collection::vec((0i32..100, 0i32..8), 0..12),
            0..10,
        ),
    ) {
        let mut docs = docs;
        for doc in &mut docs {
            doc.sort_by_key(|&(w, _)| w);
        }
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("block.0");
        write_block_file(&path, &docs).unwrap();
        let original = std::fs::read(&path).unwrap();

        let cfg = Config {
            num_vocabs: 100,
            max_num_document: 16,
            data_capacity: 1 << 16,
            input_dir: dir.path().to_path_buf(),
            ..Config::default()
        };
        let mut block = DataBlock::with_capacity(&cfg);
        block.read(&path).unwrap();
        prop_assert_eq!(block.num_docs(), docs.len());
        block.write().unwrap();
        prop_assert_eq!(std::fs::read(&path).unwrap(), original);
    }
}
