// Copyright 2025-present Harīṣh Tummalachērla
// SPDX-License-Identifier: Apache-2.0

//! Walker alias tables for the word proposal distribution.
//!
//! The LightLDA word proposal `q_w(k) ∝ (n_wk + β)/(n_k + βV)` must be
//! sampled in O(1) per token. Each word in the current slice gets an alias
//! row packed into one shared arena of int32 cells:
//!
//! - dense rows (frequent words) hold `2K` cells of (alternate, split)
//!   pairs over all K topics, with the β term folded in;
//! - sparse rows hold `2s` pair cells plus `s` cells of topic ids, where
//!   `s` is the word's nonzero-topic count. The β tail is not stored per
//!   word; a single shared "beta row" carries `β/(n_k + βV)` and sparse
//!   proposals mix between the two by mass.
//!
//! Construction is pure integer arithmetic. The proposal weights are
//! scaled to an integer mass `height * size` (with `height` as large as a
//! 31-bit draw allows), adjusted by ±1 round-robin so the total is exact,
//! and packed with Walker's pairing. A uniform 31-bit draw then lands in
//! bucket `s / height`, and `s < split` decides between the bucket's own
//! index and its alternate. No floating point touches the sampling path.
//!
//! All worker threads build rows concurrently; the arena offsets come from
//! the slice's `AliasIndex`, so writes never overlap. The per-thread
//! scratch buffers are owned by the workers and passed in by `&mut`.

use std::sync::atomic::{AtomicI32, AtomicU32, Ordering::Relaxed};

use tracing::warn;

use crate::config::Config;
use crate::meta::AliasIndex;
use crate::model::ModelAccess;
use crate::rng::XorshiftRng;

/// Per-thread build scratch, sized once for K topics.
pub struct AliasScratch {
    q: Vec<f32>,
    q_int: Vec<i32>,
    kv: Vec<i32>,
    low: Vec<(i32, i32)>,
    high: Vec<(i32, i32)>,
    idx: Vec<i32>,
}

impl AliasScratch {
    pub fn new(num_topics: usize) -> Self {
        AliasScratch {
            q: Vec::with_capacity(num_topics),
            q_int: Vec::with_capacity(num_topics),
            kv: Vec::with_capacity(num_topics * 2),
            low: Vec::with_capacity(num_topics * 2),
            high: Vec::with_capacity(num_topics * 2),
            idx: Vec::with_capacity(num_topics),
        }
    }
}

/// Alias row storage for one slice at a time.
pub struct AliasTable {
    arena: Box<[AtomicI32]>,
    beta_kv: Box<[AtomicI32]>,
    /// Per-word bucket height; valid for words of the bound slice.
    height: Box<[AtomicI32]>,
    /// Per-word proposal mass as f32 bits.
    mass_bits: Box<[AtomicU32]>,
    beta_height: AtomicI32,
    beta_mass_bits: AtomicU32,
    num_topics: usize,
    beta: f32,
    beta_sum: f32,
}

impl AliasTable {
    /// `alias_capacity` is the arena budget in bytes (the configured value
    /// for training, the planner's computed maximum for inference).
    pub fn new(cfg: &Config, alias_capacity: usize) -> Self {
        let cells = alias_capacity / std::mem::size_of::<i32>();
        AliasTable {
            arena: (0..cells).map(|_| AtomicI32::new(0)).collect(),
            beta_kv: (0..cfg.num_topics * 2).map(|_| AtomicI32::new(0)).collect(),
            height: (0..cfg.num_vocabs).map(|_| AtomicI32::new(0)).collect(),
            mass_bits: (0..cfg.num_vocabs).map(|_| AtomicU32::new(0)).collect(),
            beta_height: AtomicI32::new(0),
            beta_mass_bits: AtomicU32::new(0),
            num_topics: cfg.num_topics,
            beta: cfg.beta,
            beta_sum: cfg.beta_sum(),
        }
    }

    /// Bind the arena layout of the current slice. Cheap; done by the
    /// leader thread between barriers, after which every worker gets its
    /// own copy of the bound view.
    pub fn bind<'a>(&'a self, index: &'a AliasIndex) -> BoundAlias<'a> {
        BoundAlias { table: self, index }
    }
}

/// The alias table bound to one slice's layout.
#[derive(Clone, Copy)]
pub struct BoundAlias<'a> {
    table: &'a AliasTable,
    index: &'a AliasIndex,
}

impl<'a> BoundAlias<'a> {
    /// Build the alias row for `word` from the current model counters.
    /// Returns false for the degenerate case of a sparse word with no
    /// nonzero topics, which cannot be proposed this slice.
    pub fn build<M: ModelAccess>(&self, word: i32, model: &M, scratch: &mut AliasScratch) -> bool {
        let table = self.table;
        let entry = self.index.word_entry(word);
        let summary = model.summary_row();
        let row = model.word_topic_row(word);

        scratch.q.clear();
        let mut mass = 0.0f32;
        let size;
        if entry.is_dense {
            size = table.num_topics;
            for k in 0..table.num_topics as i32 {
                let q = (row.get(k) as f32 + table.beta) / (summary.get(k) as f32 + table.beta_sum);
                scratch.q.push(q);
                mass += q;
            }
        } else {
            scratch.idx.clear();
            for (k, n_kw) in row.iter_nonzero() {
                let q = n_kw as f32 / (summary.get(k) as f32 + table.beta_sum);
                scratch.idx.push(k);
                scratch.q.push(q);
                mass += q;
            }
            size = scratch.q.len();
            if size == 0 {
                warn!(word, "alias row has no nonzero topics; word skipped this slice");
                entry.set_capacity(0);
                table.mass_bits[word as usize].store(0f32.to_bits(), Relaxed);
                return false;
            }
            entry.set_capacity(size);
        }

        let height = build_alias_kv(scratch, mass);
        let base = entry.begin_offset;
        for (i, &cell) in scratch.kv[..2 * size].iter().enumerate() {
            table.arena[base + i].store(cell, Relaxed);
        }
        if !entry.is_dense {
            for (i, &topic) in scratch.idx.iter().enumerate() {
                table.arena[base + 2 * size + i].store(topic, Relaxed);
            }
        }
        table.height[word as usize].store(height, Relaxed);
        table.mass_bits[word as usize].store(mass.to_bits(), Relaxed);
        true
    }

    /// Build the shared beta row `q(k) = β/(n_k + βV)`.
    pub fn build_beta<M: ModelAccess>(&self, model: &M, scratch: &mut AliasScratch) {
        let table = self.table;
        let summary = model.summary_row();
        scratch.q.clear();
        let mut mass = 0.0f32;
        for k in 0..table.num_topics as i32 {
            let q = table.beta / (summary.get(k) as f32 + table.beta_sum);
            scratch.q.push(q);
            mass += q;
        }
        let height = build_alias_kv(scratch, mass);
        for (i, &cell) in scratch.kv[..2 * table.num_topics].iter().enumerate() {
            table.beta_kv[i].store(cell, Relaxed);
        }
        table.beta_height.store(height, Relaxed);
        table.beta_mass_bits.store(mass.to_bits(), Relaxed);
    }

    /// Draw a topic from the word proposal distribution.
    #[inline]
    pub fn propose(&self, word: i32, rng: &mut XorshiftRng) -> i32 {
        let table = self.table;
        let entry = self.index.word_entry(word);
        let capacity = entry.capacity();
        if entry.is_dense {
            let sample = rng.rand();
            let height = table.height[word as usize].load(Relaxed);
            let idx = ((sample / height) as usize).min(capacity - 1);
            let alt = table.arena[entry.begin_offset + 2 * idx].load(Relaxed);
            let split = table.arena[entry.begin_offset + 2 * idx + 1].load(Relaxed);
            let m = -i32::from(sample < split);
            (idx as i32 & m) | (alt & !m)
        } else {
            let mass = f32::from_bits(table.mass_bits[word as usize].load(Relaxed));
            let beta_mass = f32::from_bits(table.beta_mass_bits.load(Relaxed));
            let sample = rng.rand_double() * f64::from(mass + beta_mass);
            if sample < f64::from(mass) {
                let draw = rng.rand();
                let height = table.height[word as usize].load(Relaxed);
                let idx = ((draw / height) as usize).min(capacity - 1);
                let base = entry.begin_offset;
                let ids = base + 2 * capacity;
                let alt = table.arena[base + 2 * idx].load(Relaxed);
                let split = table.arena[base + 2 * idx + 1].load(Relaxed);
                let own = table.arena[ids + idx].load(Relaxed);
                let other = table.arena[ids + alt as usize].load(Relaxed);
                let m = -i32::from(draw < split);
                (own & m) | (other & !m)
            } else {
                self.propose_beta(rng)
            }
        }
    }

    /// Draw a topic from the shared beta row.
    #[inline]
    pub fn propose_beta(&self, rng: &mut XorshiftRng) -> i32 {
        let table = self.table;
        let sample = rng.rand();
        let height = table.beta_height.load(Relaxed);
        let idx = ((sample / height) as usize).min(table.num_topics - 1);
        let alt = table.beta_kv[2 * idx].load(Relaxed);
        let split = table.beta_kv[2 * idx + 1].load(Relaxed);
        let m = -i32::from(sample < split);
        (idx as i32 & m) | (alt & !m)
    }
}

// ============================================================================
// INTEGER ALIAS CONSTRUCTION
// ============================================================================

/// Turn `scratch.q` (unnormalized weights summing to `mass`) into a packed
/// alias row in `scratch.kv`. Returns the bucket height.
fn build_alias_kv(scratch: &mut AliasScratch, mass: f32) -> i32 {
    let size = scratch.q.len();
    scratch.q_int.clear();
    scratch.q_int.resize(size, 0);
    let height = integerize(&mut scratch.q, mass, &mut scratch.q_int);
    scratch.kv.clear();
    scratch.kv.resize(size * 2, 0);
    walker_pack(
        &scratch.q_int,
        height,
        &mut scratch.kv,
        &mut scratch.low,
        &mut scratch.high,
    );
    height
}

/// Scale normalized proportions to integers summing exactly to
/// `height * size`, where `height` is the largest bucket height a 31-bit
/// draw can address. The ±1 corrections walk the entries round-robin, so
/// no weight moves by more than a few units.
fn integerize(q: &mut [f32], mass: f32, q_int: &mut [i32]) -> i32 {
    let size = q.len() as i32;
    let a_int = 0x7fff_ffff / size;
    let mass_int = a_int * size;

    let mut sum: i64 = 0;
    for (qi, qv) in q_int.iter_mut().zip(q.iter_mut()) {
        *qv /= mass;
        *qi = (*qv * mass_int as f32) as i32;
        sum += i64::from(*qi);
    }

    if sum > i64::from(mass_int) {
        let mut excess = (sum - i64::from(mass_int)) as i32;
        let mut id = 0usize;
        while excess > 0 {
            if q_int[id] >= 1 {
                q_int[id] -= 1;
                excess -= 1;
            }
            id = (id + 1) % q_int.len();
        }
    } else if sum < i64::from(mass_int) {
        let deficit = (i64::from(mass_int) - sum) as i32;
        let mut id = 0usize;
        for _ in 0..deficit {
            q_int[id] += 1;
            id = (id + 1) % q_int.len();
        }
    }
    a_int
}

/// Walker's pairing over exact integer weights. Bucket `k` ends up as
/// `(alternate, split)` with `split = k*height + own_mass`, so a draw `s`
/// with `s / height == k` resolves to `k` when `s < split` and to the
/// alternate otherwise.
fn walker_pack(
    q_int: &[i32],
    height: i32,
    kv: &mut [i32],
    low: &mut Vec<(i32, i32)>,
    high: &mut Vec<(i32, i32)>,
) {
    let size = q_int.len();
    for k in 0..size {
        kv[2 * k] = k as i32;
        kv[2 * k + 1] = (k as i32 + 1) * height;
    }

    low.clear();
    high.clear();
    for (k, &val) in q_int.iter().enumerate() {
        if val < height {
            low.push((k as i32, val));
        } else {
            high.push((k as i32, val));
        }
    }

    let mut low_head = 0;
    let mut high_head = 0;
    while low_head < low.len() && high_head < high.len() {
        let (li, lv) = low[low_head];
        low_head += 1;
        let (hi, hv) = high[high_head];
        high_head += 1;

        kv[2 * li as usize] = hi;
        kv[2 * li as usize + 1] = li * height + lv;

        let rest = hv + lv - height;
        if rest >= height {
            high.push((hi, rest));
        } else {
            low.push((hi, rest));
        }
    }
    // Whichever queue is left holds exactly-full buckets: the integer mass
    // is exact, so their remaining values all equal the height.
    for &(k, v) in &low[low_head..] {
        kv[2 * k as usize] = k;
        kv[2 * k as usize + 1] = k * height + v;
    }
    for &(k, v) in &high[high_head..] {
        kv[2 * k as usize] = k;
        kv[2 * k as usize + 1] = k * height + v;
    }
}
