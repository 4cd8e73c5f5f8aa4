// Copyright 2025-present Harīṣh Tummalachērla
// SPDX-License-Identifier: Apache-2.0

//! Read-only model loaded from dumped model files, used for inference.
//!
//! Model files are named `server_<digits>_table_<id>.model`: table 0 is
//! the word-topic table (one `<word> <k>:<c> ...` line per word), table 1
//! is the summary row (a single line whose first field is ignored). All
//! matching files in the input directory are loaded, in sorted order, so
//! a model dumped by any number of servers reassembles the same way on
//! every platform. Files are parsed in parallel; the rows they fill are
//! atomic, so insertion order does not matter.
//!
//! Any malformed line is fatal: a partially loaded model would silently
//! skew every inference result after it.

use std::fs;
use std::io::{self, BufRead, BufReader};
use std::path::{Path, PathBuf};

use rayon::prelude::*;
use thiserror::Error;
use tracing::{info, warn};

use crate::config::{Config, SUMMARY_TABLE, WORD_TOPIC_TABLE};
use crate::meta::Meta;
use crate::model::row::{SummaryRow, WordTopicRow};
use crate::model::{ModelAccess, ModelStore};

/// A failed model load.
#[derive(Debug, Error)]
pub enum ModelError {
    #[error("model dir {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("model {path}:{line}: bad format: {content}")]
    BadLine {
        path: PathBuf,
        line: usize,
        content: String,
    },
}

/// Read-only counters for inference; mutators are no-ops.
pub struct LocalModel {
    store: ModelStore,
}

impl LocalModel {
    /// Load every matching model file under `cfg.input_dir`.
    pub fn load(meta: &Meta, cfg: &Config) -> Result<Self, ModelError> {
        let store = ModelStore::from_meta(meta, cfg);

        let word_topic_files = list_matching(&cfg.input_dir, WORD_TOPIC_TABLE)?;
        let summary_files = list_matching(&cfg.input_dir, SUMMARY_TABLE)?;
        if word_topic_files.is_empty() {
            warn!(dir = %cfg.input_dir.display(), "no word-topic model files found");
        }

        word_topic_files
            .par_iter()
            .try_for_each(|path| load_word_topic_file(path, meta, &store))?;
        for path in &summary_files {
            load_summary_file(path, &store)?;
        }
        Ok(LocalModel { store })
    }

    pub fn store(&self) -> &ModelStore {
        &self.store
    }
}

impl ModelAccess for LocalModel {
    fn word_topic_row(&self, word: i32) -> &WordTopicRow {
        self.store.row(word)
    }

    fn summary_row(&self) -> &SummaryRow {
        self.store.summary()
    }

    fn add_word_topic(&self, _word: i32, _topic: i32, _delta: i32) {}

    fn add_summary(&self, _topic: i32, _delta: i64) {}
}

/// Does `name` match `server_<digits>_table_<table>.model`?
fn matches_model_file(name: &str, table: i32) -> bool {
    let Some(rest) = name.strip_prefix("server_") else {
        return false;
    };
    let Some((digits, rest)) = rest.split_once("_table_") else {
        return false;
    };
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return false;
    }
    rest == format!("{}.model", table)
}

/// Sorted list of model files for `table` in `dir`.
fn list_matching(dir: &Path, table: i32) -> Result<Vec<PathBuf>, ModelError> {
    let entries = fs::read_dir(dir).map_err(|source| ModelError::Io {
        path: dir.to_path_buf(),
        source,
    })?;
    let mut files = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|source| ModelError::Io {
            path: dir.to_path_buf(),
            source,
        })?;
        let name = entry.file_name();
        if matches_model_file(&name.to_string_lossy(), table) {
            files.push(entry.path());
        }
    }
    files.sort();
    Ok(files)
}

fn load_word_topic_file(path: &Path, meta: &Meta, store: &ModelStore) -> Result<(), ModelError> {
    info!(path = %path.display(), "loading word-topic table");
    let file = fs::File::open(path).map_err(|source| ModelError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    for (line_no, line) in BufReader::new(file).lines().enumerate() {
        let line = line.map_err(|source| ModelError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        if line.trim().is_empty() {
            continue;
        }
        let bad_line = || ModelError::BadLine {
            path: path.to_path_buf(),
            line: line_no + 1,
            content: line.clone(),
        };

        let mut fields = line.split_whitespace();
        let word: i32 = fields
            .next()
            .and_then(|f| f.parse().ok())
            .ok_or_else(bad_line)?;
        // Words absent from every block have no row to fill.
        let keep = word >= 0 && (word as usize) < meta.num_vocabs() && meta.tf(word) > 0;
        for field in fields {
            let (topic, count) = parse_pair(field).ok_or_else(bad_line)?;
            if keep {
                store.add_word_topic(word, topic, count);
            }
        }
    }
    Ok(())
}

fn load_summary_file(path: &Path, store: &ModelStore) -> Result<(), ModelError> {
    info!(path = %path.display(), "loading summary table");
    let file = fs::File::open(path).map_err(|source| ModelError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    for (line_no, line) in BufReader::new(file).lines().enumerate() {
        let line = line.map_err(|source| ModelError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        if line.trim().is_empty() {
            continue;
        }
        let bad_line = || ModelError::BadLine {
            path: path.to_path_buf(),
            line: line_no + 1,
            content: line.clone(),
        };
        // First field is the row id; the rest are topic:count pairs.
        for field in line.split_whitespace().skip(1) {
            let (topic, count) = parse_pair(field).ok_or_else(bad_line)?;
            store.add_summary(topic, i64::from(count));
        }
    }
    Ok(())
}

fn parse_pair(field: &str) -> Option<(i32, i32)> {
    let (topic, count) = field.rsplit_once(':')?;
    Some((topic.parse().ok()?, count.parse().ok()?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::meta::write_vocab_file;

    fn fixture(dir: &Path) -> (Config, Meta) {
        write_vocab_file(&dir.join("vocab.0"), &[0, 1, 2], &[3, 6, 2], &[3, 6, 2]).unwrap();
        let cfg = Config {
            num_vocabs: 3,
            num_topics: 4,
            inference: true,
            input_dir: dir.to_path_buf(),
            ..Config::default()
        };
        let meta = Meta::init(&cfg).unwrap();
        (cfg, meta)
    }

    #[test]
    fn file_name_matching() {
        assert!(matches_model_file("server_0_table_0.model", 0));
        assert!(matches_model_file("server_17_table_1.model", 1));
        assert!(!matches_model_file("server_0_table_1.model", 0));
        assert!(!matches_model_file("server__table_0.model", 0));
        assert!(!matches_model_file("server_x_table_0.model", 0));
        assert!(!matches_model_file("server_0_table_0.model.bak", 0));
        assert!(!matches_model_file("client_0_table_0.model", 0));
    }

    #[test]
    fn loads_word_topic_and_summary_tables() {
        let dir = tempfile::tempdir().unwrap();
        let (cfg, meta) = fixture(dir.path());
        fs::write(
            dir.path().join("server_0_table_0.model"),
            "0 1:2 3:1\n1 0:6\n",
        )
        .unwrap();
        fs::write(dir.path().join("server_0_table_1.model"), "0 0:6 1:2 3:1\n").unwrap();

        let model = LocalModel::load(&meta, &cfg).unwrap();
        assert_eq!(model.word_topic(0, 1), 2);
        assert_eq!(model.word_topic(0, 3), 1);
        assert_eq!(model.word_topic(1, 0), 6);
        assert_eq!(model.summary_row().get(0), 6);
        assert_eq!(model.summary_row().get(3), 1);

        // Mutators are no-ops in inference.
        model.add_word_topic(0, 1, 5);
        assert_eq!(model.word_topic(0, 1), 2);
    }

    #[test]
    fn unknown_words_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let (cfg, meta) = fixture(dir.path());
        fs::write(dir.path().join("server_0_table_0.model"), "9 0:4\n").unwrap();
        let model = LocalModel::load(&meta, &cfg).unwrap();
        assert_eq!(model.word_topic(0, 0), 0);
    }

    #[test]
    fn malformed_line_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let (cfg, meta) = fixture(dir.path());
        fs::write(dir.path().join("server_0_table_0.model"), "0 1:2 broken\n").unwrap();
        assert!(matches!(
            LocalModel::load(&meta, &cfg),
            Err(ModelError::BadLine { .. })
        ));
    }

    #[test]
    fn missing_directory_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let (mut cfg, meta) = fixture(dir.path());
        cfg.input_dir = dir.path().join("does-not-exist");
        assert!(matches!(
            LocalModel::load(&meta, &cfg),
            Err(ModelError::Io { .. })
        ));
    }
}
