// Copyright 2025-present Harīṣh Tummalachērla
// SPDX-License-Identifier: Apache-2.0

//! Multi-threaded inference driver.
//!
//! Same slice choreography as training, against a frozen model: no
//! parameter cache to refresh, no deltas to flush, and `subtractor = 0`
//! inside the sampler. The planner gives every block a single slice and
//! sizes the alias arena to the largest block instead of enforcing a
//! budget.
//!
//! Because the model never changes, alias rows only depend on which block
//! is resident: with a single block they are built once on the first
//! iteration and reused, with several blocks they are rebuilt whenever
//! the arena is retargeted to a different block's layout.

use std::sync::Barrier;
use std::time::Instant;

use tracing::{error, info};

use crate::alias::{AliasScratch, AliasTable};
use crate::config::Config;
use crate::meta::Meta;
use crate::model::local::LocalModel;
use crate::sampler::LightDocSampler;
use crate::stream::{open_stream, DataStream};
use crate::trainer::{dump_doc_topic, initialize_topics, TrainError};

/// Infer doc-topic distributions for the corpus under `cfg.input_dir`
/// against the model files in the same directory.
pub fn infer(cfg: &Config) -> Result<(), TrainError> {
    let cfg = &Config {
        inference: true,
        ..cfg.clone()
    };
    cfg.validate()?;
    let meta = Meta::init(cfg)?;
    let stream = open_stream(cfg, cfg.num_iterations + 2)?;
    let model = LocalModel::load(&meta, cfg)?;
    let alias = AliasTable::new(cfg, meta.alias_capacity());

    initialize_topics(cfg, &meta, stream.as_ref(), None);
    info!("topic assignments initialized");

    let seed_base = cfg.seed.unwrap_or_else(|| {
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_nanos() as u32)
            .unwrap_or(1)
    });
    let barrier = Barrier::new(cfg.num_local_workers);
    std::thread::scope(|scope| {
        for tid in 0..cfg.num_local_workers {
            let meta = &meta;
            let model = &model;
            let alias = &alias;
            let barrier = &barrier;
            let stream = stream.as_ref();
            scope.spawn(move || {
                infer_worker(tid, cfg, meta, stream, model, alias, barrier, seed_base);
            });
        }
    });

    dump_doc_topic(cfg, stream.as_ref())?;
    stream.finish()?;
    Ok(())
}

#[allow(clippy::too_many_arguments)]
fn infer_worker(
    tid: usize,
    cfg: &Config,
    meta: &Meta,
    stream: &dyn DataStream,
    model: &LocalModel,
    alias: &AliasTable,
    barrier: &Barrier,
    seed_base: u32,
) {
    let workers = cfg.num_local_workers;
    let leader = tid == 0;
    let mut sampler =
        LightDocSampler::new(cfg, seed_base ^ (tid as u32).wrapping_mul(0x9e37_79b9));
    let mut scratch = Some(AliasScratch::new(cfg.num_topics));

    for iter in 0..cfg.num_iterations {
        for block in 0..cfg.num_blocks {
            let vocab = meta.local_vocab(block);
            for slice in 0..vocab.num_slices() {
                let words = vocab.slice_words(slice);
                let bound = alias.bind(meta.alias_index(block, slice));

                if leader {
                    // The block stays resident for all of its slices.
                    if slice == 0 {
                        stream.before_access();
                    }
                    info!(iter, block, slice, "inference slice start");
                }
                barrier.wait();

                // The model is frozen, so a single block's rows stay
                // valid across iterations.
                let rebuild = iter == 0 || cfg.num_blocks > 1;
                if rebuild {
                    let start = Instant::now();
                    let scratch_ref =
                        scratch.get_or_insert_with(|| AliasScratch::new(cfg.num_topics));
                    for &word in words.iter().skip(tid).step_by(workers) {
                        bound.build(word, model, scratch_ref);
                    }
                    if leader {
                        bound.build_beta(model, scratch_ref);
                    }
                    barrier.wait();
                    if leader {
                        info!(
                            elapsed_s = start.elapsed().as_secs_f64(),
                            "alias built"
                        );
                    }
                }

                let data = stream.block();
                let last_word = vocab.last_word(slice);
                for doc_id in (tid..data.num_docs()).step_by(workers) {
                    let doc = data.doc(doc_id);
                    if let Err(e) = sampler.sample_doc(&doc, slice, last_word, model, bound) {
                        error!(error = %e, doc_id, "sampler hit corrupt state");
                        std::process::exit(1);
                    }
                }
                drop(data);

                barrier.wait();
                if leader && slice + 1 == vocab.num_slices() {
                    stream.end_access();
                }

                let last_slice = iter + 1 == cfg.num_iterations
                    && block + 1 == cfg.num_blocks
                    && slice + 1 == vocab.num_slices();
                if last_slice {
                    scratch = None;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing;

    fn corpus_with_model(dir: &std::path::Path) -> Config {
        let blocks = vec![vec![
            vec![(0, 0), (1, 0), (3, 0)],
            vec![(2, 0), (3, 0)],
            vec![(0, 0), (0, 0), (4, 0)],
            vec![(1, 0), (2, 0), (4, 0)],
            vec![(3, 0), (4, 0)],
        ]];
        testing::write_corpus(dir, &blocks).unwrap();
        std::fs::write(
            dir.join("server_0_table_0.model"),
            "0 0:20 1:2\n1 3:14\n2 5:9 0:1\n3 7:12\n4 2:18\n",
        )
        .unwrap();
        std::fs::write(
            dir.join("server_0_table_1.model"),
            "0 0:21 1:2 2:18 3:14 5:9 7:12\n",
        )
        .unwrap();
        let mut cfg = testing::small_config(dir, 5, 10);
        cfg.inference = true;
        cfg.num_iterations = 4;
        cfg
    }

    #[test]
    fn fixed_seed_inference_is_bit_identical() {
        let run = || {
            let dir = tempfile::tempdir().unwrap();
            let cfg = corpus_with_model(dir.path());
            infer(&cfg).unwrap();
            std::fs::read(dir.path().join("doc_topic.0")).unwrap()
        };
        assert_eq!(run(), run());
    }

    #[test]
    fn inference_output_covers_all_docs() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = corpus_with_model(dir.path());
        infer(&cfg).unwrap();
        let dump = std::fs::read_to_string(dir.path().join("doc_topic.0")).unwrap();
        assert_eq!(dump.lines().count(), 5);
        // Model files must be untouched by inference.
        let model = std::fs::read_to_string(dir.path().join("server_0_table_0.model")).unwrap();
        assert!(model.starts_with("0 0:20 1:2"));
    }
}
