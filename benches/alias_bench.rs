// Copyright 2025-present Harīṣh Tummalachērla
// SPDX-License-Identifier: Apache-2.0

//! Benchmarks for the alias hot path: row construction and proposal
//! draws, dense and sparse.
//!
//! Run with: cargo bench

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

use lightlda::alias::{AliasScratch, AliasTable};
use lightlda::meta::{write_vocab_file, Meta};
use lightlda::model::row::{SummaryRow, WordTopicRow};
use lightlda::model::{ModelAccess, ModelStore};
use lightlda::{Config, XorshiftRng};

struct StoreModel {
    store: ModelStore,
}

impl ModelAccess for StoreModel {
    fn word_topic_row(&self, word: i32) -> &WordTopicRow {
        self.store.row(word)
    }
    fn summary_row(&self) -> &SummaryRow {
        self.store.summary()
    }
    fn add_word_topic(&self, _: i32, _: i32, _: i32) {}
    fn add_summary(&self, _: i32, _: i64) {}
}

/// Word 0 dense (tf >> K), word 1 sparse with 32 nonzero topics.
fn fixture(num_topics: usize) -> (Config, Meta, StoreModel, tempfile::TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let dense_tf = (num_topics * 2) as i32;
    write_vocab_file(
        &dir.path().join("vocab.0"),
        &[0, 1],
        &[dense_tf, 32],
        &[dense_tf, 32],
    )
    .unwrap();
    let cfg = Config {
        num_vocabs: 2,
        num_topics,
        input_dir: dir.path().to_path_buf(),
        alias_capacity: num_topics * 4 * 8,
        ..Config::default()
    };
    let meta = Meta::init(&cfg).unwrap();
    let model = StoreModel {
        store: ModelStore::from_meta(&meta, &cfg),
    };
    let mut rng = XorshiftRng::from_seed(1);
    for k in 0..num_topics as i32 {
        model.store.add_summary(k, i64::from(rng.rand_k(500) + 1));
        model.store.add_word_topic(0, k, rng.rand_k(20) + 1);
    }
    for i in 0..32 {
        model
            .store
            .add_word_topic(1, (i * num_topics as i32 / 32) % num_topics as i32, 1);
    }
    (cfg, meta, model, dir)
}

fn bench_build(c: &mut Criterion) {
    let mut group = c.benchmark_group("alias_build");
    for num_topics in [1024usize, 16 * 1024] {
        let (cfg, meta, model, _dir) = fixture(num_topics);
        let table = AliasTable::new(&cfg, meta.alias_capacity());
        let alias = table.bind(meta.alias_index(0, 0));
        let mut scratch = AliasScratch::new(num_topics);
        alias.build_beta(&model, &mut scratch);

        group.throughput(Throughput::Elements(num_topics as u64));
        group.bench_with_input(
            BenchmarkId::new("dense", num_topics),
            &num_topics,
            |b, _| {
                b.iter(|| alias.build(black_box(0), &model, &mut scratch));
            },
        );
        group.bench_with_input(
            BenchmarkId::new("sparse", num_topics),
            &num_topics,
            |b, _| {
                b.iter(|| alias.build(black_box(1), &model, &mut scratch));
            },
        );
    }
    group.finish();
}

fn bench_propose(c: &mut Criterion) {
    let mut group = c.benchmark_group("alias_propose");
    let (cfg, meta, model, _dir) = fixture(16 * 1024);
    let table = AliasTable::new(&cfg, meta.alias_capacity());
    let alias = table.bind(meta.alias_index(0, 0));
    let mut scratch = AliasScratch::new(cfg.num_topics);
    alias.build_beta(&model, &mut scratch);
    alias.build(0, &model, &mut scratch);
    alias.build(1, &model, &mut scratch);

    let mut rng = XorshiftRng::from_seed(7);
    group.throughput(Throughput::Elements(1));
    group.bench_function("dense", |b| {
        b.iter(|| black_box(alias.propose(black_box(0), &mut rng)));
    });
    group.bench_function("sparse", |b| {
        b.iter(|| black_box(alias.propose(black_box(1), &mut rng)));
    });
    group.finish();
}

criterion_group!(benches, bench_build, bench_propose);
criterion_main!(benches);
