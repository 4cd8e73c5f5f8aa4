// Copyright 2025-present Harīṣh Tummalachērla
// SPDX-License-Identifier: Apache-2.0

//! Corpus metadata and the slice planner.
//!
//! `Meta` loads the per-block vocabularies, folds the term frequencies,
//! and decides where to cut each block's vocabulary into slices. A slice
//! is the unit of work: while one is being sampled, its word-topic rows,
//! alias rows, and delta rows are all resident at once, so the planner
//! walks the (ascending) word list accumulating the byte cost of each of
//! the three structures and closes the slice just before any budget would
//! overflow. A single word whose rows alone exceed a budget still gets a
//! slice of its own; there is no smaller unit to give it.
//!
//! The planner is the only consumer of term frequencies. Everything it
//! computes is immutable after `init`.

use std::fs::File;
use std::io::{self, BufReader, Read};
use std::path::PathBuf;
use std::sync::atomic::{AtomicI32, Ordering::Relaxed};

use serde::Serialize;
use thiserror::Error;
use tracing::info;

use crate::config::{Config, LOAD_FACTOR};

/// A failed vocab file load.
#[derive(Debug, Error)]
pub enum VocabError {
    #[error("vocab {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("vocab {path}: negative word count {count}")]
    BadCount { path: PathBuf, count: i32 },
    #[error("vocab {path}: word id {word} outside vocabulary of {num_vocabs}")]
    WordOutOfRange {
        path: PathBuf,
        word: i32,
        num_vocabs: usize,
    },
    #[error("vocab {path}: word ids not strictly ascending at position {position}")]
    Unsorted { path: PathBuf, position: usize },
}

// ============================================================================
// PER-BLOCK VOCABULARY
// ============================================================================

/// The words occurring in one block, plus the slice partition over them.
#[derive(Debug)]
pub struct LocalVocab {
    words: Vec<i32>,
    slice_index: Vec<usize>,
}

impl LocalVocab {
    pub fn num_slices(&self) -> usize {
        self.slice_index.len() - 1
    }

    /// Words covered by slice `s`, ascending.
    pub fn slice_words(&self, s: usize) -> &[i32] {
        &self.words[self.slice_index[s]..self.slice_index[s + 1]]
    }

    /// Largest word id in slice `s`; the sampler stops a document here.
    pub fn last_word(&self, s: usize) -> i32 {
        self.words[self.slice_index[s + 1] - 1]
    }

    pub fn len(&self) -> usize {
        self.words.len()
    }

    pub fn is_empty(&self) -> bool {
        self.words.is_empty()
    }
}

// ============================================================================
// SLICE PLANNER
// ============================================================================

/// Byte budgets the three per-slice structures must fit under.
#[derive(Debug, Clone, Copy)]
pub struct Budgets {
    pub model: usize,
    pub alias: usize,
    pub delta: usize,
}

const INT: usize = std::mem::size_of::<i32>();

/// Bytes of word `w`'s word-topic row while its slice is resident.
pub fn model_bytes(tf: usize, num_topics: usize) -> usize {
    if tf > num_topics / (2 * LOAD_FACTOR) {
        num_topics * INT
    } else {
        tf * LOAD_FACTOR * INT
    }
}

/// Bytes of word `w`'s alias row while its slice is resident.
pub fn alias_bytes(tf: usize, num_topics: usize) -> usize {
    if tf > num_topics * 2 / 3 {
        num_topics * 2 * INT
    } else {
        tf * 3 * INT
    }
}

/// Bytes of word `w`'s delta row while its slice is resident.
pub fn delta_bytes(local_tf: usize, num_topics: usize) -> usize {
    if local_tf > num_topics / (4 * LOAD_FACTOR) {
        num_topics * INT
    } else {
        local_tf * LOAD_FACTOR * 2 * INT
    }
}

/// Partition `words` into slices such that the summed model, alias, and
/// delta footprints each stay under budget. Returns the boundary list
/// `[0 = s0 < s1 < ... < sm = len]`.
pub fn plan_slices(
    words: &[i32],
    tf: &[i32],
    local_tf: &[i32],
    num_topics: usize,
    budgets: Budgets,
) -> Vec<usize> {
    let mut slice_index = vec![0usize];
    let mut slice_start = 0usize;
    let mut model = 0usize;
    let mut alias = 0usize;
    let mut delta = 0usize;
    for (j, &w) in words.iter().enumerate() {
        let wm = model_bytes(tf[w as usize] as usize, num_topics);
        let wa = alias_bytes(tf[w as usize] as usize, num_topics);
        let wd = delta_bytes(local_tf[w as usize] as usize, num_topics);
        model += wm;
        alias += wa;
        delta += wd;
        let over = model > budgets.model || alias > budgets.alias || delta > budgets.delta;
        // A word whose rows alone overflow a budget keeps its singleton
        // slice; there is nothing smaller to cut.
        if over && j > slice_start {
            slice_index.push(j);
            slice_start = j;
            model = wm;
            alias = wa;
            delta = wd;
        }
    }
    slice_index.push(words.len());
    slice_index
}

// ============================================================================
// ALIAS INDEX
// ============================================================================

/// Placement of one word's alias row within the arena.
#[derive(Debug)]
pub struct WordEntry {
    pub is_dense: bool,
    /// First int32 cell of this word's rows in the arena.
    pub begin_offset: usize,
    /// Bucket count. Starts at `tf` for sparse words and is tightened to
    /// the actual nonzero-topic count when the row is built; the cell is
    /// atomic because the builder thread writes it while other threads'
    /// samplers read it after the barrier.
    capacity: AtomicI32,
}

impl WordEntry {
    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity.load(Relaxed).max(0) as usize
    }

    #[inline]
    pub fn set_capacity(&self, capacity: usize) {
        self.capacity.store(capacity as i32, Relaxed);
    }
}

/// Arena layout for every word of one (block, slice) pair.
#[derive(Debug)]
pub struct AliasIndex {
    entries: Vec<WordEntry>,
    index_map: Vec<i32>,
    /// Total int32 cells occupied.
    used_cells: usize,
}

impl AliasIndex {
    /// Look up a slice word. Words outside the slice indicate corrupt
    /// scheduling state and abort.
    #[inline]
    pub fn word_entry(&self, word: i32) -> &WordEntry {
        let slot = self.index_map[word as usize];
        assert!(slot >= 0, "word {} has no alias row in this slice", word);
        &self.entries[slot as usize]
    }

    pub fn used_cells(&self) -> usize {
        self.used_cells
    }
}

// ============================================================================
// META
// ============================================================================

/// All metadata for the node's corpus: term frequencies, per-block
/// vocabularies with their slice plans, and per-slice alias layouts.
pub struct Meta {
    tf: Vec<i32>,
    local_tf: Vec<i32>,
    local_vocabs: Vec<LocalVocab>,
    alias_indices: Vec<Vec<AliasIndex>>,
    alias_capacity: usize,
}

impl Meta {
    /// Load `vocab.<i>` for every block, plan slices, and lay out alias
    /// rows. In inference mode each block is a single slice and the alias
    /// budget is computed rather than enforced.
    pub fn init(cfg: &Config) -> Result<Meta, VocabError> {
        let mut tf = vec![0i32; cfg.num_vocabs];
        let mut local_tf = vec![0i32; cfg.num_vocabs];
        let mut word_lists = Vec::with_capacity(cfg.num_blocks);

        for block in 0..cfg.num_blocks {
            let path = cfg.vocab_path(block);
            let (words, block_tf, block_local_tf) = read_vocab_file(&path, cfg.num_vocabs)?;
            for (i, &w) in words.iter().enumerate() {
                let w = w as usize;
                tf[w] = tf[w].max(block_tf[i]);
                local_tf[w] = local_tf[w].max(block_local_tf[i]);
            }
            word_lists.push(words);
        }

        let (local_vocabs, alias_capacity) = if cfg.inference {
            plan_for_inference(cfg, &word_lists, &tf)
        } else {
            plan_for_training(cfg, &word_lists, &tf, &local_tf)
        };

        let alias_indices = build_alias_indices(cfg, &local_vocabs, &tf, alias_capacity);

        Ok(Meta {
            tf,
            local_tf,
            local_vocabs,
            alias_indices,
            alias_capacity,
        })
    }

    /// Term frequency of `word` over the whole dataset.
    #[inline]
    pub fn tf(&self, word: i32) -> i32 {
        self.tf[word as usize]
    }

    /// Term frequency of `word` on this node.
    #[inline]
    pub fn local_tf(&self, word: i32) -> i32 {
        self.local_tf[word as usize]
    }

    pub fn num_vocabs(&self) -> usize {
        self.tf.len()
    }

    pub fn local_vocab(&self, block: usize) -> &LocalVocab {
        &self.local_vocabs[block]
    }

    pub fn alias_index(&self, block: usize, slice: usize) -> &AliasIndex {
        &self.alias_indices[block][slice]
    }

    /// Effective alias arena size in bytes: the configured budget for
    /// training, the computed maximum for inference.
    pub fn alias_capacity(&self) -> usize {
        self.alias_capacity
    }

    /// Slice plan report for the `inspect` subcommand.
    pub fn summarize(&self) -> Vec<VocabSummary> {
        self.local_vocabs
            .iter()
            .enumerate()
            .map(|(block, vocab)| VocabSummary {
                block,
                num_words: vocab.len(),
                num_slices: vocab.num_slices(),
                slice_sizes: (0..vocab.num_slices())
                    .map(|s| vocab.slice_words(s).len())
                    .collect(),
            })
            .collect()
    }
}

/// What `inspect` prints about a block's vocabulary.
#[derive(Debug, Serialize)]
pub struct VocabSummary {
    pub block: usize,
    pub num_words: usize,
    pub num_slices: usize,
    pub slice_sizes: Vec<usize>,
}

fn plan_for_training(
    cfg: &Config,
    word_lists: &[Vec<i32>],
    tf: &[i32],
    local_tf: &[i32],
) -> (Vec<LocalVocab>, usize) {
    let budgets = Budgets {
        model: cfg.model_capacity,
        alias: cfg.alias_capacity,
        delta: cfg.delta_capacity,
    };
    let vocabs: Vec<LocalVocab> = word_lists
        .iter()
        .enumerate()
        .map(|(block, words)| {
            let slice_index = plan_slices(words, tf, local_tf, cfg.num_topics, budgets);
            info!(block, slices = slice_index.len() - 1, words = words.len(), "planned block");
            LocalVocab {
                words: words.clone(),
                slice_index,
            }
        })
        .collect();
    (vocabs, cfg.alias_capacity)
}

/// Inference keeps each block whole and instead sizes the alias arena to
/// the largest per-block requirement.
fn plan_for_inference(
    cfg: &Config,
    word_lists: &[Vec<i32>],
    tf: &[i32],
) -> (Vec<LocalVocab>, usize) {
    let mut alias_capacity = 0usize;
    let vocabs: Vec<LocalVocab> = word_lists
        .iter()
        .map(|words| {
            let total: usize = words
                .iter()
                .map(|&w| alias_bytes(tf[w as usize] as usize, cfg.num_topics))
                .sum();
            alias_capacity = alias_capacity.max(total);
            LocalVocab {
                words: words.clone(),
                slice_index: vec![0, words.len()],
            }
        })
        .collect();
    info!(alias_capacity, "alias capacity computed for inference");
    (vocabs, alias_capacity)
}

fn build_alias_indices(
    cfg: &Config,
    local_vocabs: &[LocalVocab],
    tf: &[i32],
    alias_capacity: usize,
) -> Vec<Vec<AliasIndex>> {
    let alias_thresh = cfg.num_topics * 2 / 3;
    let arena_cells = alias_capacity / INT;
    local_vocabs
        .iter()
        .map(|vocab| {
            (0..vocab.num_slices())
                .map(|s| {
                    let mut index_map = vec![-1i32; cfg.num_vocabs];
                    let mut entries = Vec::new();
                    let mut offset = 0usize;
                    for &word in vocab.slice_words(s) {
                        let word_tf = tf[word as usize] as usize;
                        let (is_dense, capacity, size) = if word_tf >= alias_thresh {
                            (true, cfg.num_topics, cfg.num_topics * 2)
                        } else {
                            (false, word_tf, word_tf * 3)
                        };
                        index_map[word as usize] = entries.len() as i32;
                        entries.push(WordEntry {
                            is_dense,
                            begin_offset: offset,
                            capacity: AtomicI32::new(capacity as i32),
                        });
                        offset += size;
                    }
                    assert!(
                        offset <= arena_cells,
                        "alias layout ({} cells) exceeds arena ({} cells)",
                        offset,
                        arena_cells
                    );
                    AliasIndex {
                        entries,
                        index_map,
                        used_cells: offset,
                    }
                })
                .collect()
        })
        .collect()
}

fn read_vocab_file(
    path: &std::path::Path,
    num_vocabs: usize,
) -> Result<(Vec<i32>, Vec<i32>, Vec<i32>), VocabError> {
    let io_err = |source| VocabError::Io {
        path: path.to_path_buf(),
        source,
    };
    let file = File::open(path).map_err(io_err)?;
    let mut reader = BufReader::new(file);

    let count = read_i32(&mut reader).map_err(io_err)?;
    if count < 0 {
        return Err(VocabError::BadCount {
            path: path.to_path_buf(),
            count,
        });
    }
    let count = count as usize;

    let words = read_i32_vec(&mut reader, count).map_err(io_err)?;
    let tf = read_i32_vec(&mut reader, count).map_err(io_err)?;
    let local_tf = read_i32_vec(&mut reader, count).map_err(io_err)?;

    for (i, &w) in words.iter().enumerate() {
        if w < 0 || w as usize >= num_vocabs {
            return Err(VocabError::WordOutOfRange {
                path: path.to_path_buf(),
                word: w,
                num_vocabs,
            });
        }
        if i > 0 && words[i - 1] >= w {
            return Err(VocabError::Unsorted {
                path: path.to_path_buf(),
                position: i,
            });
        }
    }
    Ok((words, tf, local_tf))
}

fn read_i32<R: Read>(reader: &mut R) -> io::Result<i32> {
    let mut bytes = [0u8; 4];
    reader.read_exact(&mut bytes)?;
    Ok(i32::from_le_bytes(bytes))
}

fn read_i32_vec<R: Read>(reader: &mut R, count: usize) -> io::Result<Vec<i32>> {
    let mut out = Vec::with_capacity(count);
    for _ in 0..count {
        out.push(read_i32(reader)?);
    }
    Ok(out)
}

/// Write a `vocab.<n>` binary file. Used by the preprocessor and tests.
pub fn write_vocab_file(
    path: &std::path::Path,
    words: &[i32],
    tf: &[i32],
    local_tf: &[i32],
) -> io::Result<()> {
    use std::io::Write;
    let file = File::create(path)?;
    let mut writer = io::BufWriter::new(file);
    writer.write_all(&(words.len() as i32).to_le_bytes())?;
    for list in [words, tf, local_tf] {
        for &v in list {
            writer.write_all(&v.to_le_bytes())?;
        }
    }
    writer.flush()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uniform_tf_two_words_per_slice() {
        let num_topics = 1000;
        let words: Vec<i32> = (0..1000).collect();
        let tf = vec![100i32; 1000];
        let local_tf = vec![100i32; 1000];
        // Exactly two words' worth of every budget.
        let budgets = Budgets {
            model: 2 * model_bytes(100, num_topics),
            alias: 2 * alias_bytes(100, num_topics),
            delta: 2 * delta_bytes(100, num_topics),
        };
        let slice_index = plan_slices(&words, &tf, &local_tf, num_topics, budgets);
        assert_eq!(slice_index.len() - 1, 500);
        for pair in slice_index.windows(2) {
            assert!(pair[1] - pair[0] <= 2);
        }
    }

    #[test]
    fn budgets_hold_within_every_slice() {
        let num_topics = 64;
        let words: Vec<i32> = (0..50).collect();
        let tf: Vec<i32> = (0..50).map(|w| 1 + (w * 7) % 90).collect();
        let local_tf: Vec<i32> = tf.iter().map(|&t| (t + 1) / 2).collect();
        let budgets = Budgets {
            model: 2000,
            alias: 3000,
            delta: 2500,
        };
        let slice_index = plan_slices(&words, &tf, &local_tf, num_topics, budgets);
        for pair in slice_index.windows(2) {
            let slice = &words[pair[0]..pair[1]];
            if slice.len() == 1 {
                continue;
            }
            let m: usize = slice
                .iter()
                .map(|&w| model_bytes(tf[w as usize] as usize, num_topics))
                .sum();
            let a: usize = slice
                .iter()
                .map(|&w| alias_bytes(tf[w as usize] as usize, num_topics))
                .sum();
            let d: usize = slice
                .iter()
                .map(|&w| delta_bytes(local_tf[w as usize] as usize, num_topics))
                .sum();
            assert!(m <= budgets.model && a <= budgets.alias && d <= budgets.delta);
        }
    }

    #[test]
    fn oversize_word_gets_its_own_slice() {
        let num_topics = 100;
        let words = vec![0, 1, 2];
        let tf = vec![1000, 1, 1];
        let local_tf = vec![1000, 1, 1];
        let budgets = Budgets {
            model: 8,
            alias: usize::MAX,
            delta: usize::MAX,
        };
        let slice_index = plan_slices(&words, &tf, &local_tf, num_topics, budgets);
        // Word 0 alone, then 1 and 2 each alone under the tiny budget.
        assert_eq!(slice_index, vec![0, 1, 2, 3]);
        for pair in slice_index.windows(2) {
            assert!(pair[1] > pair[0], "empty slice emitted");
        }
    }

    #[test]
    fn alias_index_offsets_increase_and_fit() {
        let cfg = Config {
            num_vocabs: 10,
            num_topics: 9,
            alias_capacity: 4096,
            ..Config::default()
        };
        let vocab = LocalVocab {
            words: vec![1, 3, 5, 8],
            slice_index: vec![0, 2, 4],
        };
        // Word 8 is dense (tf >= 2K/3 = 6), the rest sparse.
        let mut tf = vec![0i32; 10];
        tf[1] = 2;
        tf[3] = 4;
        tf[5] = 5;
        tf[8] = 7;
        let indices = build_alias_indices(&cfg, &[vocab], &tf, cfg.alias_capacity);
        let slice0 = &indices[0][0];
        assert_eq!(slice0.word_entry(1).begin_offset, 0);
        assert_eq!(slice0.word_entry(3).begin_offset, 2 * 3);
        assert_eq!(slice0.used_cells(), 2 * 3 + 4 * 3);
        let slice1 = &indices[0][1];
        assert!(!slice1.word_entry(5).is_dense);
        assert!(slice1.word_entry(8).is_dense);
        assert_eq!(slice1.word_entry(8).begin_offset, 5 * 3);
        assert_eq!(slice1.word_entry(8).capacity(), 9);
    }

    #[test]
    #[should_panic(expected = "no alias row")]
    fn alias_index_rejects_foreign_word() {
        let cfg = Config {
            num_vocabs: 4,
            num_topics: 4,
            alias_capacity: 1024,
            ..Config::default()
        };
        let vocab = LocalVocab {
            words: vec![0],
            slice_index: vec![0, 1],
        };
        let tf = vec![1i32, 1, 1, 1];
        let indices = build_alias_indices(&cfg, &[vocab], &tf, cfg.alias_capacity);
        indices[0][0].word_entry(3);
    }

    #[test]
    fn meta_init_folds_tf_maxima() {
        let dir = tempfile::tempdir().unwrap();
        write_vocab_file(&dir.path().join("vocab.0"), &[0, 2], &[5, 3], &[5, 3]).unwrap();
        write_vocab_file(&dir.path().join("vocab.1"), &[2, 3], &[7, 1], &[2, 1]).unwrap();
        let cfg = Config {
            num_vocabs: 4,
            num_topics: 8,
            num_blocks: 2,
            input_dir: dir.path().to_path_buf(),
            ..Config::default()
        };
        let meta = Meta::init(&cfg).unwrap();
        assert_eq!(meta.tf(0), 5);
        assert_eq!(meta.tf(2), 7);
        assert_eq!(meta.local_tf(2), 3);
        assert_eq!(meta.tf(3), 1);
        assert_eq!(meta.local_vocab(1).last_word(0), 3);
    }

    #[test]
    fn unsorted_vocab_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        write_vocab_file(&dir.path().join("vocab.0"), &[3, 1], &[1, 1], &[1, 1]).unwrap();
        let cfg = Config {
            num_vocabs: 4,
            input_dir: dir.path().to_path_buf(),
            ..Config::default()
        };
        assert!(matches!(
            Meta::init(&cfg),
            Err(VocabError::Unsorted { .. })
        ));
    }
}
