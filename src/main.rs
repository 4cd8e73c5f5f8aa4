// Copyright 2025-present Harīṣh Tummalachērla
// SPDX-License-Identifier: Apache-2.0

//! lightlda CLI: preprocess, train, infer, and inspect.
//!
//! ```bash
//! # Convert a libSVM corpus into a block + vocab pair
//! lightlda dump --libsvm corpus.libsvm --dict word_dict.txt --output ./data
//!
//! # Train 1000 topics over 4 out-of-core blocks with 8 threads
//! lightlda train --input-dir ./data --num-vocabs 500000 --num-topics 1000 \
//!     --num-blocks 4 --out-of-core --num-local-workers 8
//!
//! # Fit doc-topic distributions against the dumped model
//! lightlda infer --input-dir ./data --num-vocabs 500000 --num-topics 1000
//!
//! # Look inside a block file
//! lightlda inspect ./data/block.0 --json
//! ```

use std::fs;
use std::path::Path;

use anyhow::Context;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use lightlda::{infer, train, Config, DataBlock};

mod cli;
use cli::{Cli, Commands};

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Train { engine } => {
            let cfg = engine.to_config(false);
            train(&cfg).context("training failed")?;
        }
        Commands::Infer { engine } => {
            let cfg = engine.to_config(true);
            infer(&cfg).context("inference failed")?;
        }
        Commands::Dump {
            libsvm,
            dict,
            output,
            block_id,
        } => {
            let stats = lightlda::dump_block(&libsvm, &dict, &output, block_id)
                .context("preprocessing failed")?;
            println!(
                "block.{}: {} docs, {} tokens, {} words, {} lines skipped",
                block_id, stats.num_docs, stats.num_tokens, stats.vocab_size, stats.skipped_lines
            );
        }
        Commands::Inspect { file, json } => {
            inspect_block(&file, json).context("inspect failed")?;
        }
    }
    Ok(())
}

/// Load a block with capacities taken from the file itself and print its
/// structure.
fn inspect_block(path: &Path, json: bool) -> anyhow::Result<()> {
    let bytes = fs::metadata(path)
        .with_context(|| format!("cannot stat {}", path.display()))?
        .len() as usize;
    // The file is an upper bound on both buffers: every document costs at
    // least one offset entry and one token cell.
    let cfg = Config {
        num_vocabs: 1,
        max_num_document: bytes / 8 + 1,
        data_capacity: bytes + 4,
        ..Config::default()
    };
    let mut block = DataBlock::with_capacity(&cfg);
    block.read(path)?;
    let summary = block.summarize();

    if json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
    } else {
        println!("{}", path.display());
        println!("  documents:    {}", summary.num_docs);
        println!("  tokens:       {}", summary.num_tokens);
        println!("  int32 cells:  {}", summary.corpus_cells);
        println!("  longest doc:  {} tokens", summary.max_doc_len);
    }
    Ok(())
}
