// Copyright 2025-present Harīṣh Tummalachērla
// SPDX-License-Identifier: Apache-2.0

//! On-disk corpus shards and their in-memory form.
//!
//! A block file is the unit of streaming:
//!
//! ```text
//! int64  num_docs
//! int64  offset[0..=num_docs]       // offset[0] = 0, strictly non-decreasing
//! int32  tokens[offset[num_docs]]   // per doc: cursor, then word/topic pairs
//! ```
//!
//! All integers are little-endian. A document's region is
//! `[offset[i], offset[i+1])` within `tokens`; the first cell is its
//! resume cursor, so every region has odd length.
//!
//! `DataBlock` owns two flat buffers sized once from the configured
//! capacities and reused across loads, because the slice planner's byte
//! budgets assume block storage is a fixed arena, not a collection of
//! per-document allocations. Token cells are relaxed atomics: sampling
//! threads write topics in place through shared references, and the block
//! is written back to disk with those updates intact.

use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI32, Ordering::Relaxed};

use serde::Serialize;
use thiserror::Error;

use crate::config::Config;
use crate::document::Document;

/// A failed block read or write. Every variant carries the file name;
/// block I/O errors are fatal and there are no partial results.
#[derive(Debug, Error)]
pub enum BlockError {
    #[error("block {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("block {path}: {docs} documents exceeds max_num_document {max}")]
    TooManyDocs {
        path: PathBuf,
        docs: i64,
        max: usize,
    },
    #[error("block {path}: {tokens} tokens exceeds data_capacity ({capacity} cells)")]
    CorpusOverflow {
        path: PathBuf,
        tokens: i64,
        capacity: usize,
    },
    #[error("block {path}: malformed header ({reason})")]
    BadHeader { path: PathBuf, reason: String },
}

/// One corpus shard, resident in a fixed arena.
pub struct DataBlock {
    num_docs: usize,
    corpus_size: usize,
    offsets: Vec<i64>,
    tokens: Vec<AtomicI32>,
    max_num_document: usize,
    path: Option<PathBuf>,
    loaded: bool,
}

impl DataBlock {
    /// Allocate the offset and token arenas from the configured budgets.
    pub fn with_capacity(cfg: &Config) -> Self {
        let token_cells = cfg.data_capacity / std::mem::size_of::<i32>();
        DataBlock {
            num_docs: 0,
            corpus_size: 0,
            offsets: Vec::with_capacity(cfg.max_num_document + 1),
            tokens: (0..token_cells).map(|_| AtomicI32::new(0)).collect(),
            max_num_document: cfg.max_num_document,
            path: None,
            loaded: false,
        }
    }

    pub fn num_docs(&self) -> usize {
        self.num_docs
    }

    /// Total int32 cells used by the loaded corpus.
    pub fn corpus_size(&self) -> usize {
        self.corpus_size
    }

    pub fn is_loaded(&self) -> bool {
        self.loaded
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// View over document `index`. Valid until the block is reloaded.
    #[inline]
    pub fn doc(&self, index: usize) -> Document<'_> {
        let begin = self.offsets[index] as usize;
        let end = self.offsets[index + 1] as usize;
        Document::new(&self.tokens[begin..end])
    }

    /// Load the block at `path`, replacing the current contents.
    pub fn read(&mut self, path: &Path) -> Result<(), BlockError> {
        let file = File::open(path).map_err(|source| BlockError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let mut reader = BufReader::new(file);
        let io_err = |source| BlockError::Io {
            path: path.to_path_buf(),
            source,
        };

        let num_docs = read_i64(&mut reader).map_err(io_err)?;
        if num_docs < 0 || num_docs as usize > self.max_num_document {
            return Err(BlockError::TooManyDocs {
                path: path.to_path_buf(),
                docs: num_docs,
                max: self.max_num_document,
            });
        }
        let num_docs = num_docs as usize;

        self.offsets.clear();
        let mut prev = 0i64;
        for i in 0..=num_docs {
            let offset = read_i64(&mut reader).map_err(io_err)?;
            if offset < prev || (i == 0 && offset != 0) {
                return Err(BlockError::BadHeader {
                    path: path.to_path_buf(),
                    reason: format!("offset[{}] = {} after {}", i, offset, prev),
                });
            }
            let len = offset - prev;
            if i > 0 && len % 2 == 0 {
                return Err(BlockError::BadHeader {
                    path: path.to_path_buf(),
                    reason: format!("document {} has even region length {}", i - 1, len),
                });
            }
            self.offsets.push(offset);
            prev = offset;
        }

        let corpus_size = prev;
        if corpus_size as usize > self.tokens.len() {
            return Err(BlockError::CorpusOverflow {
                path: path.to_path_buf(),
                tokens: corpus_size,
                capacity: self.tokens.len(),
            });
        }

        let mut buf = [0u8; 1 << 14];
        let mut filled = 0usize;
        let total = corpus_size as usize;
        while filled < total {
            let want = ((total - filled) * 4).min(buf.len());
            reader.read_exact(&mut buf[..want]).map_err(io_err)?;
            for chunk in buf[..want].chunks_exact(4) {
                let v = i32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
                self.tokens[filled].store(v, Relaxed);
                filled += 1;
            }
        }

        self.num_docs = num_docs;
        self.corpus_size = total;
        self.path = Some(path.to_path_buf());
        self.loaded = true;
        Ok(())
    }

    /// Write the block back to its source file. Goes through a temp file
    /// and an atomic rename so a crash never leaves a half-written shard.
    pub fn write(&self) -> Result<(), BlockError> {
        let path = self.path.clone().unwrap_or_default();
        let tmp = path.with_extension("tmp");
        let io_err = |source| BlockError::Io {
            path: path.clone(),
            source,
        };

        {
            let file = File::create(&tmp).map_err(io_err)?;
            let mut writer = BufWriter::new(file);
            writer
                .write_all(&(self.num_docs as i64).to_le_bytes())
                .map_err(io_err)?;
            for &offset in &self.offsets {
                writer.write_all(&offset.to_le_bytes()).map_err(io_err)?;
            }
            for cell in &self.tokens[..self.corpus_size] {
                writer
                    .write_all(&cell.load(Relaxed).to_le_bytes())
                    .map_err(io_err)?;
            }
            writer.flush().map_err(io_err)?;
        }
        fs::rename(&tmp, &path).map_err(io_err)?;
        Ok(())
    }

    /// Forget the loaded contents (the arena stays allocated).
    pub fn unload(&mut self) {
        self.loaded = false;
        self.num_docs = 0;
        self.corpus_size = 0;
        self.offsets.clear();
    }

    /// Structure report for the `inspect` subcommand.
    pub fn summarize(&self) -> BlockSummary {
        let mut max_doc_len = 0usize;
        let mut total_tokens = 0usize;
        for i in 0..self.num_docs {
            let len = ((self.offsets[i + 1] - self.offsets[i]) as usize - 1) / 2;
            max_doc_len = max_doc_len.max(len);
            total_tokens += len;
        }
        BlockSummary {
            num_docs: self.num_docs,
            num_tokens: total_tokens,
            corpus_cells: self.corpus_size,
            max_doc_len,
        }
    }
}

/// What `inspect` prints about a block file.
#[derive(Debug, Serialize)]
pub struct BlockSummary {
    pub num_docs: usize,
    pub num_tokens: usize,
    pub corpus_cells: usize,
    pub max_doc_len: usize,
}

fn read_i64<R: Read>(reader: &mut R) -> io::Result<i64> {
    let mut bytes = [0u8; 8];
    reader.read_exact(&mut bytes)?;
    Ok(i64::from_le_bytes(bytes))
}

/// Write a block file from materialized documents: each document is a list
/// of (word, topic) pairs, already sorted by word. Used by the
/// preprocessor and the test fixtures.
pub fn write_block_file(path: &Path, docs: &[Vec<(i32, i32)>]) -> Result<(), BlockError> {
    let io_err = |source| BlockError::Io {
        path: path.to_path_buf(),
        source,
    };
    let file = File::create(path).map_err(io_err)?;
    let mut writer = BufWriter::new(file);

    writer
        .write_all(&(docs.len() as i64).to_le_bytes())
        .map_err(io_err)?;
    let mut offset = 0i64;
    writer.write_all(&offset.to_le_bytes()).map_err(io_err)?;
    for doc in docs {
        offset += 1 + 2 * doc.len() as i64;
        writer.write_all(&offset.to_le_bytes()).map_err(io_err)?;
    }
    for doc in docs {
        writer.write_all(&0i32.to_le_bytes()).map_err(io_err)?;
        for &(word, topic) in doc {
            writer.write_all(&word.to_le_bytes()).map_err(io_err)?;
            writer.write_all(&topic.to_le_bytes()).map_err(io_err)?;
        }
    }
    writer.flush().map_err(io_err)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_config(dir: &Path) -> Config {
        Config {
            num_vocabs: 100,
            max_num_document: 16,
            data_capacity: 4096,
            input_dir: dir.to_path_buf(),
            ..Config::default()
        }
    }

    #[test]
    fn read_reconstructs_documents() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("block.0");
        write_block_file(&path, &[vec![(1, 0), (4, 0)], vec![(2, 3)]]).unwrap();

        let mut block = DataBlock::with_capacity(&small_config(dir.path()));
        block.read(&path).unwrap();
        assert_eq!(block.num_docs(), 2);
        assert_eq!(block.corpus_size(), 5 + 3);
        let doc = block.doc(0);
        assert_eq!(doc.len(), 2);
        assert_eq!(doc.word(1), 4);
        let doc = block.doc(1);
        assert_eq!(doc.word(0), 2);
        assert_eq!(doc.topic(0), 3);
    }

    #[test]
    fn round_trip_is_byte_identical() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("block.0");
        write_block_file(&path, &[vec![(0, 1), (5, 2), (9, 0)], vec![], vec![(3, 3)]]).unwrap();
        let original = fs::read(&path).unwrap();

        let mut block = DataBlock::with_capacity(&small_config(dir.path()));
        block.read(&path).unwrap();
        block.write().unwrap();

        assert_eq!(fs::read(&path).unwrap(), original);
    }

    #[test]
    fn updated_topics_survive_write_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("block.0");
        write_block_file(&path, &[vec![(1, 0), (2, 0)]]).unwrap();

        let cfg = small_config(dir.path());
        let mut block = DataBlock::with_capacity(&cfg);
        block.read(&path).unwrap();
        block.doc(0).set_topic(1, 7);
        block.doc(0).set_cursor(2);
        block.write().unwrap();

        let mut reloaded = DataBlock::with_capacity(&cfg);
        reloaded.read(&path).unwrap();
        assert_eq!(reloaded.doc(0).topic(1), 7);
        assert_eq!(reloaded.doc(0).cursor(), 2);
    }

    #[test]
    fn too_many_docs_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("block.0");
        let docs: Vec<Vec<(i32, i32)>> = (0..20).map(|_| vec![(1, 0)]).collect();
        write_block_file(&path, &docs).unwrap();

        let mut block = DataBlock::with_capacity(&small_config(dir.path()));
        assert!(matches!(
            block.read(&path),
            Err(BlockError::TooManyDocs { .. })
        ));
    }

    #[test]
    fn oversized_corpus_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("block.0");
        let docs = vec![(0..1000).map(|w| (w, 0)).collect::<Vec<_>>()];
        write_block_file(&path, &docs).unwrap();

        let mut cfg = small_config(dir.path());
        cfg.data_capacity = 64;
        let mut block = DataBlock::with_capacity(&cfg);
        assert!(matches!(
            block.read(&path),
            Err(BlockError::CorpusOverflow { .. })
        ));
    }

    #[test]
    fn even_region_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("block.0");
        // Hand-write a header whose single document region has length 2.
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&1i64.to_le_bytes());
        bytes.extend_from_slice(&0i64.to_le_bytes());
        bytes.extend_from_slice(&2i64.to_le_bytes());
        bytes.extend_from_slice(&0i32.to_le_bytes());
        bytes.extend_from_slice(&0i32.to_le_bytes());
        fs::write(&path, bytes).unwrap();

        let mut block = DataBlock::with_capacity(&small_config(dir.path()));
        assert!(matches!(block.read(&path), Err(BlockError::BadHeader { .. })));
    }
}
