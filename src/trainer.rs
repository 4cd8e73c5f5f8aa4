// Copyright 2025-present Harīṣh Tummalachērla
// SPDX-License-Identifier: Apache-2.0

//! Multi-threaded training driver.
//!
//! A fixed pool of `num_local_workers` OS threads runs the same loop over
//! (iteration, block, slice) and synchronizes at three barriers per
//! slice:
//!
//! 1. the leader acquires the block (on its first slice), pulls the
//!    slice's rows into the model cache, and binds the alias layout —
//!    barrier;
//! 2. every thread builds alias rows for its stride of the slice's words,
//!    the leader adds the shared beta row — barrier;
//! 3. every thread samples its stride of the documents — barrier — and
//!    the leader flushes the accumulated deltas, releasing the block
//!    after its last slice.
//!
//! There is no other cross-thread ordering: counter updates are relaxed
//! deltas and the sampler tolerates staleness. A worker that hits a
//! corrupt-state error logs it and terminates the process; its siblings
//! are blocked on a barrier that will never open, and the joint
//! computation is meaningless without it.
//!
//! Before the first iteration an initialization pass walks every block
//! slice by slice, randomizing topics (unless warm-starting) and seeding
//! the server counters from the assignments. After the last iteration a
//! dump pass writes per-document topic counts and the final model tables.

use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::sync::atomic::{AtomicUsize, Ordering::Relaxed};
use std::sync::{Arc, Barrier};
use std::time::Instant;

use parking_lot::Mutex;
use thiserror::Error;
use tracing::{error, info};

use crate::alias::{AliasScratch, AliasTable};
use crate::block::BlockError;
use crate::config::{Config, ConfigError, MAX_DOC_LENGTH, SUMMARY_TABLE, WORD_TOPIC_TABLE};
use crate::eval;
use crate::meta::{Meta, VocabError};
use crate::model::local::ModelError;
use crate::model::ps::{LocalServer, ParameterServer, PsModel};
use crate::model::row::TopicCounter;
use crate::model::ModelAccess;
use crate::rng::XorshiftRng;
use crate::sampler::LightDocSampler;
use crate::stream::{open_stream, DataStream};

/// Anything that can end a run early. All of these are fatal; the process
/// exits nonzero.
#[derive(Debug, Error)]
pub enum TrainError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Vocab(#[from] VocabError),
    #[error(transparent)]
    Block(#[from] BlockError),
    #[error(transparent)]
    Model(#[from] ModelError),
    #[error("output: {0}")]
    Io(#[from] io::Error),
}

/// Cross-thread likelihood accumulators, drained by the barrier leader.
#[derive(Default)]
struct LlhState {
    doc: f64,
    word: f64,
}

/// Train a model over the corpus under `cfg.input_dir`.
pub fn train(cfg: &Config) -> Result<(), TrainError> {
    cfg.validate()?;
    let meta = Meta::init(cfg)?;
    // One stream pass for initialization, one per iteration, one for the
    // final dump.
    let stream = open_stream(cfg, cfg.num_iterations + 2)?;
    let server: Arc<dyn ParameterServer> = Arc::new(LocalServer::new(&meta, cfg));
    let model = PsModel::new(&meta, cfg, Arc::clone(&server));
    let alias = AliasTable::new(cfg, meta.alias_capacity());

    initialize_topics(cfg, &meta, stream.as_ref(), Some(&model));
    info!("topic assignments initialized");

    let seed_base = seed_base(cfg);
    let barrier = Barrier::new(cfg.num_local_workers);
    let llh = Mutex::new(LlhState::default());
    let total_tokens = AtomicUsize::new(0);
    std::thread::scope(|scope| {
        for tid in 0..cfg.num_local_workers {
            let ctx = WorkerCtx {
                tid,
                cfg,
                meta: &meta,
                stream: stream.as_ref(),
                model: &model,
                alias: &alias,
                barrier: &barrier,
                llh: &llh,
                total_tokens: &total_tokens,
            };
            scope.spawn(move || worker_main(ctx, seed_base));
        }
    });

    dump_doc_topic(cfg, stream.as_ref())?;
    dump_model(cfg, server.as_ref())?;
    stream.finish()?;
    info!(
        tokens = total_tokens.load(Relaxed),
        "training finished"
    );
    Ok(())
}

fn seed_base(cfg: &Config) -> u32 {
    cfg.seed.unwrap_or_else(|| {
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_nanos() as u32)
            .unwrap_or(1)
    })
}

/// Per-worker seed: distinct streams derived from one base.
fn worker_seed(base: u32, tid: usize) -> u32 {
    base ^ (tid as u32).wrapping_mul(0x9e37_79b9)
}

struct WorkerCtx<'a> {
    tid: usize,
    cfg: &'a Config,
    meta: &'a Meta,
    stream: &'a dyn DataStream,
    model: &'a PsModel,
    alias: &'a AliasTable,
    barrier: &'a Barrier,
    llh: &'a Mutex<LlhState>,
    total_tokens: &'a AtomicUsize,
}

fn worker_main(ctx: WorkerCtx<'_>, seed_base: u32) {
    let cfg = ctx.cfg;
    let workers = cfg.num_local_workers;
    let leader = ctx.tid == 0;
    let mut sampler = LightDocSampler::new(cfg, worker_seed(seed_base, ctx.tid));
    let mut scratch = Some(AliasScratch::new(cfg.num_topics));
    let mut eval_counter = TopicCounter::with_capacity(MAX_DOC_LENGTH);

    for iter in 0..cfg.num_iterations {
        for block in 0..cfg.num_blocks {
            let vocab = ctx.meta.local_vocab(block);
            for slice in 0..vocab.num_slices() {
                let words = vocab.slice_words(slice);
                let bound = ctx.alias.bind(ctx.meta.alias_index(block, slice));

                if leader {
                    // The block stays resident for all of its slices.
                    if slice == 0 {
                        ctx.stream.before_access();
                    }
                    ctx.model.request_slice(words);
                    info!(iter, block, slice, "slice start");
                }
                ctx.barrier.wait();

                // Alias build, striped by word index.
                let build_start = Instant::now();
                let scratch_ref = scratch.get_or_insert_with(|| AliasScratch::new(cfg.num_topics));
                for &word in words.iter().skip(ctx.tid).step_by(workers) {
                    bound.build(word, ctx.model, scratch_ref);
                }
                if leader {
                    bound.build_beta(ctx.model, scratch_ref);
                }
                ctx.barrier.wait();
                if leader {
                    info!(
                        elapsed_s = build_start.elapsed().as_secs_f64(),
                        words = words.len(),
                        "alias built"
                    );
                }

                // Sampling, striped by document id.
                let sample_start = Instant::now();
                let data = ctx.stream.block();
                let last_word = vocab.last_word(slice);
                let mut tokens = 0usize;
                for doc_id in (ctx.tid..data.num_docs()).step_by(workers) {
                    let doc = data.doc(doc_id);
                    match sampler.sample_doc(&doc, slice, last_word, ctx.model, bound) {
                        Ok(n) => tokens += n,
                        Err(e) => {
                            error!(error = %e, doc_id, "sampler hit corrupt state");
                            std::process::exit(1);
                        }
                    }
                }
                ctx.total_tokens.fetch_add(tokens, Relaxed);
                if leader {
                    let elapsed = sample_start.elapsed().as_secs_f64();
                    info!(
                        elapsed_s = elapsed,
                        throughput = tokens as f64 / elapsed.max(f64::EPSILON),
                        "slice sampled"
                    );
                }

                if iter % 5 == 0 {
                    evaluate(&ctx, &data, block, slice, &mut eval_counter);
                }
                drop(data);

                ctx.barrier.wait();
                if leader {
                    ctx.model.flush_deltas(words);
                    if slice + 1 == vocab.num_slices() {
                        ctx.stream.end_access();
                    }
                }

                let last_slice = iter + 1 == cfg.num_iterations
                    && block + 1 == cfg.num_blocks
                    && slice + 1 == vocab.num_slices();
                if last_slice {
                    // Release the per-thread build scratch.
                    scratch = None;
                }
            }
        }
    }
}

/// Likelihood pass, mirroring the sampling stripes. Document likelihood
/// is counted once per iteration (on slice 0), word likelihood once per
/// word (on block 0).
fn evaluate(
    ctx: &WorkerCtx<'_>,
    data: &crate::block::DataBlock,
    block: usize,
    slice: usize,
    counter: &mut TopicCounter,
) {
    let cfg = ctx.cfg;
    let workers = cfg.num_local_workers;

    if slice == 0 {
        let mut thread_doc = 0.0;
        for doc_id in (ctx.tid..data.num_docs()).step_by(workers) {
            let doc = data.doc(doc_id);
            counter.clear();
            doc.accumulate_topics(counter);
            thread_doc += eval::doc_likelihood(counter, doc.len(), cfg.alpha, cfg.num_topics);
        }
        ctx.llh.lock().doc += thread_doc;
        if ctx.barrier.wait().is_leader() {
            let mut llh = ctx.llh.lock();
            info!(doc_llh = llh.doc, "document likelihood");
            llh.doc = 0.0;
        }
    }

    if block == 0 {
        let vocab = ctx.meta.local_vocab(block);
        let mut thread_word = 0.0;
        for &word in vocab.slice_words(slice).iter().skip(ctx.tid).step_by(workers) {
            thread_word +=
                eval::word_likelihood(ctx.model.word_topic_row(word), cfg.beta, cfg.num_topics);
        }
        ctx.llh.lock().word += thread_word;
        if ctx.barrier.wait().is_leader() {
            let mut llh = ctx.llh.lock();
            info!(word_llh = llh.word, "word likelihood");
            llh.word = 0.0;
        }
        if ctx.tid == 0 {
            let norm = eval::normalize_word_likelihood(
                ctx.model.summary_row(),
                cfg.beta,
                cfg.num_vocabs,
                cfg.num_topics,
            );
            info!(normalization = norm, "word likelihood normalization");
        }
    }
    ctx.barrier.wait();
}

/// Walk every block slice by slice, randomize topics unless warm-starting,
/// and seed the server counters (training only). Single-threaded; runs
/// before the workers start.
pub(crate) fn initialize_topics(
    cfg: &Config,
    meta: &Meta,
    stream: &dyn DataStream,
    model: Option<&PsModel>,
) {
    let mut rng = XorshiftRng::from_seed(seed_base(cfg));
    for block in 0..cfg.num_blocks {
        let vocab = meta.local_vocab(block);
        stream.before_access();
        let data = stream.block();
        for slice in 0..vocab.num_slices() {
            let last_word = vocab.last_word(slice);
            for doc_id in 0..data.num_docs() {
                let doc = data.doc(doc_id);
                if slice == 0 {
                    doc.set_cursor(0);
                }
                let mut cursor = doc.cursor();
                while cursor < doc.len() {
                    if doc.word(cursor) > last_word {
                        break;
                    }
                    if !cfg.warm_start {
                        doc.set_topic(cursor, rng.rand_k(cfg.num_topics as i32));
                    }
                    if let Some(model) = model {
                        model.seed_token(doc.word(cursor), doc.topic(cursor));
                    }
                    cursor += 1;
                }
                doc.set_cursor(cursor);
            }
        }
        drop(data);
        stream.end_access();
    }
}

/// Write `doc_topic.<block>`: one line per document with its nonzero
/// topic counts.
pub(crate) fn dump_doc_topic(cfg: &Config, stream: &dyn DataStream) -> Result<(), io::Error> {
    let mut counter = TopicCounter::with_capacity(MAX_DOC_LENGTH);
    for block in 0..cfg.num_blocks {
        let path = cfg.input_dir.join(format!("doc_topic.{}", block));
        let mut out = BufWriter::new(File::create(&path)?);
        stream.before_access();
        let data = stream.block();
        for doc_id in 0..data.num_docs() {
            let doc = data.doc(doc_id);
            counter.clear();
            doc.accumulate_topics(&mut counter);
            write!(out, "{} ", doc_id)?;
            for (topic, count) in counter.iter_nonzero() {
                write!(out, " {}:{}", topic, count)?;
            }
            writeln!(out)?;
        }
        out.flush()?;
        drop(data);
        stream.end_access();
        info!(block, path = %path.display(), "dumped doc-topic counts");
    }
    Ok(())
}

/// Write the final model tables in the same format the inference loader
/// reads: `server_0_table_0.model` and `server_0_table_1.model`.
fn dump_model(cfg: &Config, server: &dyn ParameterServer) -> Result<(), io::Error> {
    let path = cfg.input_dir.join("server_0_table_0.model");
    let mut out = BufWriter::new(File::create(&path)?);
    for word in 0..cfg.num_vocabs as i64 {
        let mut cells = Vec::new();
        server.for_each_in_row(WORD_TOPIC_TABLE, word, &mut |k, v| cells.push((k, v)));
        if cells.is_empty() {
            continue;
        }
        write!(out, "{}", word)?;
        for (topic, count) in cells {
            write!(out, " {}:{}", topic, count)?;
        }
        writeln!(out)?;
    }
    out.flush()?;
    info!(path = %path.display(), "dumped word-topic table");

    let path = cfg.input_dir.join("server_0_table_1.model");
    let mut out = BufWriter::new(File::create(&path)?);
    write!(out, "0")?;
    let mut cells = Vec::new();
    server.for_each_in_row(SUMMARY_TABLE, 0, &mut |k, v| cells.push((k, v)));
    for (topic, count) in cells {
        write!(out, " {}:{}", topic, count)?;
    }
    writeln!(out)?;
    out.flush()?;
    info!(path = %path.display(), "dumped summary table");
    Ok(())
}
