// Copyright 2025-present Harīṣh Tummalachērla
// SPDX-License-Identifier: Apache-2.0

//! Out-of-core LightLDA: Metropolis-Hastings topic model training that
//! scales to models larger than memory.
//!
//! The engine trains Latent Dirichlet Allocation with the LightLDA cycle
//! proposal (word proposal alternated with doc proposal), which makes the
//! per-token cost independent of the topic count. Memory is governed by
//! three explicit byte budgets — model rows, alias rows, delta rows — and
//! a planner that cuts each corpus block's vocabulary into slices that
//! respect all three at once.
//!
//! # Architecture
//!
//! ```text
//!  block.<n> / vocab.<n>          Meta / SlicePlanner
//!  ┌──────────────┐    tf,vocab   ┌─────────────────┐
//!  │  DataStream  │──────────────▶│ slices + alias  │
//!  │ (mem / disk) │               │     layout      │
//!  └──────┬───────┘               └────────┬────────┘
//!         │ blocks                         │ per-slice index
//!         ▼                                ▼
//!  ┌──────────────┐   build    ┌──────────────────┐
//!  │   workers    │───────────▶│    AliasTable    │
//!  │ (sampler ×N) │◀───────────│  (shared arena)  │
//!  └──────┬───────┘   propose  └──────────────────┘
//!         │ deltas
//!         ▼
//!  ┌──────────────┐   flush    ┌──────────────────┐
//!  │   PsModel    │───────────▶│ ParameterServer  │
//!  │ cache+aggr.  │◀───────────│  (local shards)  │
//!  └──────────────┘  request   └──────────────────┘
//! ```
//!
//! Workers are plain OS threads meeting at three barriers per slice:
//! after slice setup, after alias builds, and after sampling. Counter
//! traffic in between is relaxed atomic deltas; the algorithm is designed
//! to tolerate the staleness.

pub mod alias;
pub mod block;
pub mod config;
pub mod document;
pub mod dump;
pub mod eval;
pub mod infer;
pub mod meta;
pub mod model;
pub mod rng;
pub mod sampler;
pub mod stream;
pub mod testing;
pub mod trainer;

// Re-exports for the public API and the CLI.
pub use alias::{AliasScratch, AliasTable};
pub use block::{BlockError, DataBlock};
pub use config::{Config, ConfigError};
pub use document::Document;
pub use dump::{dump_block, DumpError, DumpStats};
pub use infer::infer;
pub use meta::{Meta, VocabError};
pub use model::local::LocalModel;
pub use model::ps::{LocalServer, ParameterServer, PsModel};
pub use model::ModelAccess;
pub use rng::XorshiftRng;
pub use sampler::LightDocSampler;
pub use stream::{open_stream, DataStream};
pub use trainer::{train, TrainError};
