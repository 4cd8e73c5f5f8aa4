// Copyright 2025-present Harīṣh Tummalachērla
// SPDX-License-Identifier: Apache-2.0

//! Preprocessor: libSVM corpus -> binary block and vocab files.
//!
//! Input is one document per line, `<key>\t<word>:<count> ...`, plus a
//! word dictionary `<word_id>\t<word>\t<tf>`. Output is one `block.<n>`
//! (token-topic pairs with zeroed topics and a zero cursor slot per
//! document), the matching `vocab.<n>` binary, and a human-readable
//! `vocab.<n>.txt`.
//!
//! The block is streamed: a placeholder header goes out first, documents
//! are appended as they parse, and the real offset table is written over
//! the placeholder at the end. Token lists are sorted by word id per
//! document, which is the invariant slice-by-slice sampling depends on,
//! and capped at `MAX_DOC_LENGTH` tokens.

use std::collections::{BTreeMap, HashMap};
use std::fs::File;
use std::io::{self, BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use indicatif::{ProgressBar, ProgressStyle};
use thiserror::Error;
use tracing::{info, warn};

use crate::config::MAX_DOC_LENGTH;
use crate::meta::write_vocab_file;

/// A failed preprocessing run.
#[derive(Debug, Error)]
pub enum DumpError {
    #[error("{path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("dict {path}:{line}: expected <id>\\t<word>\\t<tf>: {content}")]
    BadDict {
        path: PathBuf,
        line: usize,
        content: String,
    },
    #[error("dict {path}:{line}: duplicate word id: {content}")]
    DuplicateWord {
        path: PathBuf,
        line: usize,
        content: String,
    },
}

/// Counters reported after a dump.
#[derive(Debug)]
pub struct DumpStats {
    pub num_docs: usize,
    pub num_tokens: u64,
    pub vocab_size: usize,
    pub skipped_lines: usize,
}

/// Convert `libsvm` + `dict` into `block.<block_id>` and `vocab.<block_id>`
/// under `output_dir`.
pub fn dump_block(
    libsvm: &Path,
    dict: &Path,
    output_dir: &Path,
    block_id: usize,
) -> Result<DumpStats, DumpError> {
    let global_tf = load_dict(dict)?;
    info!(words = global_tf.len(), "dictionary loaded");

    let io_err = |path: &Path| {
        let path = path.to_path_buf();
        move |source| DumpError::Io {
            path: path.clone(),
            source,
        }
    };

    let block_path = output_dir.join(format!("block.{}", block_id));
    let input = File::open(libsvm).map_err(io_err(libsvm))?;
    let total_bytes = input.metadata().map(|m| m.len()).unwrap_or(0);
    let reader = BufReader::new(input);

    // The offset table is only known once every document has parsed, so
    // the token payload streams into a sidecar file first and the final
    // block is assembled as header + payload afterwards.
    let payload_path = block_path.with_extension("payload");
    let mut writer = BufWriter::new(File::create(&payload_path).map_err(io_err(&payload_path))?);

    let progress = ProgressBar::new(total_bytes).with_style(
        ProgressStyle::with_template("{bar:40} {bytes}/{total_bytes} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_bar()),
    );

    let mut offsets: Vec<i64> = vec![0];
    let mut local_tf: HashMap<i32, i32> = HashMap::new();
    let mut tokens: Vec<i32> = Vec::with_capacity(MAX_DOC_LENGTH);
    let mut num_tokens = 0u64;
    let mut skipped = 0usize;

    for (line_no, line) in reader.lines().enumerate() {
        let line = line.map_err(io_err(libsvm))?;
        progress.inc(line.len() as u64 + 1);
        if line.trim().is_empty() {
            continue;
        }
        match parse_doc_line(&line, &global_tf, &mut local_tf, &mut tokens) {
            Ok(()) => {}
            Err(reason) => {
                warn!(line = line_no + 1, reason, "skipping malformed document");
                skipped += 1;
                continue;
            }
        }
        writer
            .write_all(&0i32.to_le_bytes())
            .map_err(io_err(&payload_path))?;
        for &cell in &tokens {
            writer
                .write_all(&cell.to_le_bytes())
                .map_err(io_err(&payload_path))?;
        }
        num_tokens += tokens.len() as u64 / 2;
        let last = *offsets.last().unwrap_or(&0);
        offsets.push(last + 1 + tokens.len() as i64);
    }
    progress.finish_and_clear();
    writer.flush().map_err(io_err(&payload_path))?;
    drop(writer);

    let num_docs = offsets.len() - 1;
    assemble_block(&block_path, &payload_path, &offsets).map_err(io_err(&block_path))?;

    // Vocab files: every word that occurs locally, ascending.
    let mut words: Vec<i32> = local_tf.keys().copied().collect();
    words.sort_unstable();
    let tf_out: Vec<i32> = words
        .iter()
        .map(|w| *global_tf.get(w).unwrap_or(&0))
        .collect();
    let local_out: Vec<i32> = words.iter().map(|w| local_tf[w]).collect();

    let vocab_path = output_dir.join(format!("vocab.{}", block_id));
    write_vocab_file(&vocab_path, &words, &tf_out, &local_out).map_err(io_err(&vocab_path))?;

    let txt_path = output_dir.join(format!("vocab.{}.txt", block_id));
    let mut txt = BufWriter::new(File::create(&txt_path).map_err(io_err(&txt_path))?);
    writeln!(txt, "{}", words.len()).map_err(io_err(&txt_path))?;
    for ((word, tf), local) in words.iter().zip(&tf_out).zip(&local_out) {
        writeln!(txt, "{}\t{}\t{}", word, tf, local).map_err(io_err(&txt_path))?;
    }
    txt.flush().map_err(io_err(&txt_path))?;

    info!(
        num_docs,
        num_tokens,
        vocab = words.len(),
        skipped,
        "block dumped"
    );
    Ok(DumpStats {
        num_docs,
        num_tokens,
        vocab_size: words.len(),
        skipped_lines: skipped,
    })
}

/// `<word_id>\t<word>\t<tf>` per line.
fn load_dict(path: &Path) -> Result<BTreeMap<i32, i32>, DumpError> {
    let file = File::open(path).map_err(|source| DumpError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let mut dict = BTreeMap::new();
    for (line_no, line) in BufReader::new(file).lines().enumerate() {
        let line = line.map_err(|source| DumpError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        if line.trim().is_empty() {
            continue;
        }
        let fields: Vec<&str> = line.trim_end().split('\t').collect();
        let mut parsed = None;
        if fields.len() == 3 {
            if let (Ok(word), Ok(tf)) = (fields[0].parse::<i32>(), fields[2].parse::<i32>()) {
                parsed = Some((word, tf));
            }
        }
        let Some((word, tf)) = parsed else {
            return Err(DumpError::BadDict {
                path: path.to_path_buf(),
                line: line_no + 1,
                content: line,
            });
        };
        if dict.insert(word, tf).is_some() {
            return Err(DumpError::DuplicateWord {
                path: path.to_path_buf(),
                line: line_no + 1,
                content: line,
            });
        }
    }
    Ok(dict)
}

/// Expand one `<key>\t<word>:<count> ...` line into sorted token-topic
/// pairs in `tokens`. Words missing from the dictionary are dropped so
/// the emitted block never references a word the vocab file cannot
/// describe.
fn parse_doc_line(
    line: &str,
    dict: &BTreeMap<i32, i32>,
    local_tf: &mut HashMap<i32, i32>,
    tokens: &mut Vec<i32>,
) -> Result<(), &'static str> {
    let (_, pairs) = line.split_once('\t').ok_or("no key/value tab")?;

    let mut doc: Vec<i32> = Vec::new();
    for pair in pairs.split_whitespace() {
        let (word, count) = pair.split_once(':').ok_or("token without ':'")?;
        let word: i32 = word.parse().map_err(|_| "non-numeric word id")?;
        let count: i32 = count.parse().map_err(|_| "non-numeric count")?;
        if word < 0 || count < 0 {
            return Err("negative word or count");
        }
        if !dict.contains_key(&word) {
            continue;
        }
        for _ in 0..count {
            if doc.len() >= MAX_DOC_LENGTH {
                break;
            }
            doc.push(word);
            *local_tf.entry(word).or_insert(0) += 1;
        }
        if doc.len() >= MAX_DOC_LENGTH {
            break;
        }
    }
    doc.sort_unstable();

    tokens.clear();
    for word in doc {
        tokens.push(word);
        tokens.push(0);
    }
    Ok(())
}

/// Assemble the final block file as `num_docs, offsets, payload` and
/// remove the payload sidecar.
fn assemble_block(path: &Path, payload_path: &Path, offsets: &[i64]) -> io::Result<()> {
    let num_docs = (offsets.len() - 1) as i64;
    let mut out = BufWriter::new(File::create(path)?);
    out.write_all(&num_docs.to_le_bytes())?;
    for &offset in offsets {
        out.write_all(&offset.to_le_bytes())?;
    }
    let mut payload = File::open(payload_path)?;
    io::copy(&mut payload, &mut out)?;
    out.flush()?;
    std::fs::remove_file(payload_path)
}
