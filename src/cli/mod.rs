// Copyright 2025-present Harīṣh Tummalachērla
// SPDX-License-Identifier: Apache-2.0

//! CLI definitions for the lightlda command-line interface.
//!
//! Four subcommands: `train` to learn a model, `infer` to fit doc-topic
//! distributions against a frozen model, `dump` to convert a libSVM
//! corpus into binary block/vocab files, and `inspect` to examine a
//! block file. Training and inference share the engine options; `dump`
//! is the preprocessing front door.

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

use lightlda::Config;

#[derive(Parser)]
#[command(
    name = "lightlda",
    about = "Out-of-core LightLDA topic model trainer",
    version
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Train a topic model over preprocessed blocks
    Train {
        #[command(flatten)]
        engine: EngineArgs,
    },

    /// Infer doc-topic distributions against dumped model files
    Infer {
        #[command(flatten)]
        engine: EngineArgs,
    },

    /// Convert a libSVM corpus into one binary block + vocab pair
    Dump {
        /// libSVM input file, one document per line
        #[arg(long)]
        libsvm: PathBuf,

        /// Word dictionary file: <word_id>\t<word>\t<tf> per line
        #[arg(long)]
        dict: PathBuf,

        /// Output directory for block.<n> / vocab.<n>
        #[arg(long)]
        output: PathBuf,

        /// Block number to emit
        #[arg(long, default_value_t = 0)]
        block_id: usize,
    },

    /// Inspect a block file's structure
    Inspect {
        /// Path to a block.<n> file
        file: PathBuf,

        /// Emit the report as JSON
        #[arg(long)]
        json: bool,
    },
}

/// Options shared by `train` and `infer`.
#[derive(Args)]
pub struct EngineArgs {
    /// Size of the vocabulary (V)
    #[arg(long)]
    pub num_vocabs: usize,

    /// Number of topics (K)
    #[arg(long, default_value_t = 100)]
    pub num_topics: usize,

    /// Number of passes over the corpus
    #[arg(long, default_value_t = 100)]
    pub num_iterations: usize,

    /// Metropolis-Hastings cycles per token
    #[arg(long, default_value_t = 2)]
    pub mh_steps: usize,

    /// Number of sampling worker threads
    #[arg(long, default_value_t = 1)]
    pub num_local_workers: usize,

    /// Number of parameter server shards
    #[arg(long, default_value_t = 1)]
    pub num_servers: usize,

    /// Number of corpus blocks
    #[arg(long, default_value_t = 1)]
    pub num_blocks: usize,

    /// Maximum documents per block
    #[arg(long, default_value_t = 10_000)]
    pub max_num_document: usize,

    /// Symmetric Dirichlet prior on doc-topic distributions
    #[arg(long, default_value_t = 0.1)]
    pub alpha: f32,

    /// Symmetric Dirichlet prior on word-topic distributions
    #[arg(long, default_value_t = 0.01)]
    pub beta: f32,

    /// Directory holding block.<n>, vocab.<n>, and model files
    #[arg(long)]
    pub input_dir: PathBuf,

    /// Keep the topic assignments found in the blocks
    #[arg(long)]
    pub warm_start: bool,

    /// Stream blocks from disk through a double buffer
    #[arg(long)]
    pub out_of_core: bool,

    /// Use the approximate acceptance ratio
    #[arg(long)]
    pub approx_sampler: bool,

    /// Byte budget for a block's token buffer
    #[arg(long, default_value_t = 800 * 1024 * 1024)]
    pub data_capacity: usize,

    /// Byte budget for word-topic rows resident in one slice
    #[arg(long, default_value_t = 512 * 1024 * 1024)]
    pub model_capacity: usize,

    /// Byte budget for delta rows resident in one slice
    #[arg(long, default_value_t = 128 * 1024 * 1024)]
    pub delta_capacity: usize,

    /// Byte budget for alias rows resident in one slice
    #[arg(long, default_value_t = 512 * 1024 * 1024)]
    pub alias_capacity: usize,

    /// Fixed RNG seed for reproducible runs
    #[arg(long)]
    pub seed: Option<u32>,
}

impl EngineArgs {
    pub fn to_config(&self, inference: bool) -> Config {
        Config {
            num_vocabs: self.num_vocabs,
            num_topics: self.num_topics,
            num_iterations: self.num_iterations,
            mh_steps: self.mh_steps,
            num_local_workers: self.num_local_workers,
            num_servers: self.num_servers,
            num_blocks: self.num_blocks,
            max_num_document: self.max_num_document,
            alpha: self.alpha,
            beta: self.beta,
            input_dir: self.input_dir.clone(),
            warm_start: self.warm_start,
            out_of_core: self.out_of_core,
            inference,
            approx_sampler: self.approx_sampler,
            data_capacity: self.data_capacity,
            model_capacity: self.model_capacity,
            delta_capacity: self.delta_capacity,
            alias_capacity: if inference { 0 } else { self.alias_capacity },
            seed: self.seed,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn train_args_parse() {
        let cli = Cli::try_parse_from([
            "lightlda",
            "train",
            "--num-vocabs",
            "1000",
            "--num-topics",
            "32",
            "--input-dir",
            "/tmp/corpus",
            "--out-of-core",
            "--num-blocks",
            "4",
        ])
        .unwrap();
        let Commands::Train { engine } = cli.command else {
            panic!("expected train");
        };
        let cfg = engine.to_config(false);
        assert_eq!(cfg.num_vocabs, 1000);
        assert_eq!(cfg.num_topics, 32);
        assert_eq!(cfg.num_blocks, 4);
        assert!(cfg.out_of_core);
        assert!(!cfg.inference);
    }

    #[test]
    fn infer_config_computes_alias_budget() {
        let cli = Cli::try_parse_from([
            "lightlda",
            "infer",
            "--num-vocabs",
            "10",
            "--input-dir",
            "/tmp/corpus",
        ])
        .unwrap();
        let Commands::Infer { engine } = cli.command else {
            panic!("expected infer");
        };
        let cfg = engine.to_config(true);
        assert!(cfg.inference);
        assert_eq!(cfg.alias_capacity, 0);
    }
}
