// Copyright 2025-present Harīṣh Tummalachērla
// SPDX-License-Identifier: Apache-2.0

//! Training and inference configuration.
//!
//! Everything the engine needs is collected here once, validated once, and
//! then passed around by reference. The library never reads globals or
//! environment variables; the CLI builds a `Config` from arguments and the
//! tests build one by hand.

use std::path::PathBuf;

use thiserror::Error;

/// Table id of the word-topic table on the parameter server.
pub const WORD_TOPIC_TABLE: i32 = 0;
/// Table id of the summary row on the parameter server.
pub const SUMMARY_TABLE: i32 = 1;
/// Oversizing factor for sparse counter rows, bounds probe chains.
pub const LOAD_FACTOR: usize = 2;
/// Maximum number of tokens considered per document.
pub const MAX_DOC_LENGTH: usize = 8192;

/// Configuration for one training or inference run.
#[derive(Debug, Clone)]
pub struct Config {
    /// Size of the vocabulary (V).
    pub num_vocabs: usize,
    /// Number of topics (K).
    pub num_topics: usize,
    /// Number of passes over the corpus.
    pub num_iterations: usize,
    /// Metropolis-Hastings cycles per token.
    pub mh_steps: usize,
    /// Number of sampling worker threads.
    pub num_local_workers: usize,
    /// Number of parameter server shards.
    pub num_servers: usize,
    /// Number of blocks the corpus is split into.
    pub num_blocks: usize,
    /// Maximum number of documents per block.
    pub max_num_document: usize,
    /// Symmetric Dirichlet prior on doc-topic distributions.
    pub alpha: f32,
    /// Symmetric Dirichlet prior on word-topic distributions.
    pub beta: f32,
    /// Directory holding `block.<n>`, `vocab.<n>` and model files.
    pub input_dir: PathBuf,
    /// Keep the topic assignments found in the blocks instead of
    /// randomizing them at startup.
    pub warm_start: bool,
    /// Stream blocks through a disk-backed double buffer instead of
    /// holding the whole corpus in memory.
    pub out_of_core: bool,
    /// Inference mode: read-only model, no delta emission.
    pub inference: bool,
    /// Use the approximate sampler that drops one factor from each side
    /// of the acceptance ratio.
    pub approx_sampler: bool,
    /// Byte budget for a block's token buffer.
    pub data_capacity: usize,
    /// Byte budget for word-topic rows resident in one slice.
    pub model_capacity: usize,
    /// Byte budget for delta rows resident in one slice.
    pub delta_capacity: usize,
    /// Byte budget for alias rows resident in one slice.
    pub alias_capacity: usize,
    /// Fixed RNG seed; `None` seeds from the clock. Worker i derives its
    /// seed from this value and i.
    pub seed: Option<u32>,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            num_vocabs: 0,
            num_topics: 100,
            num_iterations: 100,
            mh_steps: 2,
            num_local_workers: 1,
            num_servers: 1,
            num_blocks: 1,
            max_num_document: 10_000,
            alpha: 0.1,
            beta: 0.01,
            input_dir: PathBuf::from("."),
            warm_start: false,
            out_of_core: false,
            inference: false,
            approx_sampler: false,
            data_capacity: 800 * 1024 * 1024,
            model_capacity: 512 * 1024 * 1024,
            delta_capacity: 128 * 1024 * 1024,
            alias_capacity: 512 * 1024 * 1024,
            seed: None,
        }
    }
}

/// A rejected configuration. Every variant names the offending option.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("num_vocabs must be positive")]
    NoVocabs,
    #[error("num_topics must be positive")]
    NoTopics,
    #[error("num_blocks must be positive")]
    NoBlocks,
    #[error("num_local_workers must be positive")]
    NoWorkers,
    #[error("mh_steps must be positive")]
    NoMhSteps,
    #[error("max_num_document must be positive")]
    NoDocuments,
    #[error("{0} must be positive")]
    EmptyCapacity(&'static str),
    #[error("alpha and beta must be positive, got alpha={alpha}, beta={beta}")]
    BadPrior { alpha: f32, beta: f32 },
}

impl Config {
    /// Reject configurations the engine cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.num_vocabs == 0 {
            return Err(ConfigError::NoVocabs);
        }
        if self.num_topics == 0 {
            return Err(ConfigError::NoTopics);
        }
        if self.num_blocks == 0 {
            return Err(ConfigError::NoBlocks);
        }
        if self.num_local_workers == 0 {
            return Err(ConfigError::NoWorkers);
        }
        if self.mh_steps == 0 {
            return Err(ConfigError::NoMhSteps);
        }
        if self.max_num_document == 0 {
            return Err(ConfigError::NoDocuments);
        }
        for (name, cap) in [
            ("data_capacity", self.data_capacity),
            ("model_capacity", self.model_capacity),
            ("delta_capacity", self.delta_capacity),
        ] {
            if cap == 0 {
                return Err(ConfigError::EmptyCapacity(name));
            }
        }
        // alias_capacity may be zero in inference mode: the planner
        // computes the real requirement from the vocab files.
        if !self.inference && self.alias_capacity == 0 {
            return Err(ConfigError::EmptyCapacity("alias_capacity"));
        }
        if self.alpha <= 0.0 || self.beta <= 0.0 {
            return Err(ConfigError::BadPrior {
                alpha: self.alpha,
                beta: self.beta,
            });
        }
        Ok(())
    }

    /// `beta * V`, the denominator mass of the word proposal.
    #[inline]
    pub fn beta_sum(&self) -> f32 {
        self.beta * self.num_vocabs as f32
    }

    /// `alpha * K`, the prior mass of the doc proposal.
    #[inline]
    pub fn alpha_sum(&self) -> f32 {
        self.alpha * self.num_topics as f32
    }

    /// Path of block file `n` under the input directory.
    pub fn block_path(&self, n: usize) -> PathBuf {
        self.input_dir.join(format!("block.{}", n))
    }

    /// Path of vocab file `n` under the input directory.
    pub fn vocab_path(&self, n: usize) -> PathBuf {
        self.input_dir.join(format!("vocab.{}", n))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid() -> Config {
        Config {
            num_vocabs: 100,
            ..Config::default()
        }
    }

    #[test]
    fn default_with_vocabs_validates() {
        assert!(valid().validate().is_ok());
    }

    #[test]
    fn zero_topics_rejected() {
        let cfg = Config {
            num_topics: 0,
            ..valid()
        };
        assert!(matches!(cfg.validate(), Err(ConfigError::NoTopics)));
    }

    #[test]
    fn zero_alias_capacity_ok_for_inference_only() {
        let mut cfg = Config {
            alias_capacity: 0,
            ..valid()
        };
        assert!(cfg.validate().is_err());
        cfg.inference = true;
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn negative_prior_rejected() {
        let cfg = Config {
            beta: -0.5,
            ..valid()
        };
        assert!(matches!(cfg.validate(), Err(ConfigError::BadPrior { .. })));
    }
}
