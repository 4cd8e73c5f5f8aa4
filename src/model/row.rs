// Copyright 2025-present Harīṣh Tummalachērla
// SPDX-License-Identifier: Apache-2.0

//! Counter rows: the storage cells behind the word-topic table, the
//! summary row, and the per-document topic counter.
//!
//! Rows come in two layouts chosen per word at load time. A dense row is a
//! flat array of K counters. A sparse row is an open-addressed map with
//! capacity `tf * LOAD_FACTOR`, which is what makes million-topic models
//! fit in memory: a word that occurs 40 times can touch at most 40 topics,
//! so it gets an 80-slot map instead of a million-entry array.
//!
//! Shared rows use relaxed atomics throughout. Sampling threads issue
//! relative `add` deltas and tolerate stale reads of each other's writes;
//! the barriers between slice phases are the only synchronization points.
//! The per-document counter is thread-local and plain.

use std::sync::atomic::{AtomicI32, AtomicI64, Ordering::Relaxed};

use crate::config::LOAD_FACTOR;

/// Empty slot marker in open-addressed maps. Topic ids are non-negative.
const EMPTY: i32 = -1;

fn next_pow2(n: usize) -> usize {
    n.max(2).next_power_of_two()
}

// ============================================================================
// DENSE ROW
// ============================================================================

/// Flat array of K atomic counters.
#[derive(Debug)]
pub struct DenseCounts {
    cells: Box<[AtomicI32]>,
}

impl DenseCounts {
    pub fn new(len: usize) -> Self {
        DenseCounts {
            cells: (0..len).map(|_| AtomicI32::new(0)).collect(),
        }
    }

    #[inline]
    pub fn get(&self, k: i32) -> i32 {
        match self.cells.get(k as usize) {
            Some(cell) => cell.load(Relaxed),
            None => 0,
        }
    }

    #[inline]
    pub fn add(&self, k: i32, delta: i32) {
        if let Some(cell) = self.cells.get(k as usize) {
            cell.fetch_add(delta, Relaxed);
        }
    }

    pub fn clear(&self) {
        for cell in self.cells.iter() {
            cell.store(0, Relaxed);
        }
    }

    pub fn iter_nonzero(&self) -> impl Iterator<Item = (i32, i32)> + '_ {
        self.cells.iter().enumerate().filter_map(|(k, cell)| {
            let v = cell.load(Relaxed);
            (v != 0).then_some((k as i32, v))
        })
    }
}

// ============================================================================
// SPARSE ROW
// ============================================================================

/// Open-addressed atomic counter map with linear probing.
///
/// Slots are claimed with a compare-exchange on the key cell and never
/// released; counts may pass through zero but the slot stays bound to its
/// topic. Capacity is a power of two at least twice the expected number of
/// distinct keys, which keeps probe chains short.
#[derive(Debug)]
pub struct SparseCounts {
    keys: Box<[AtomicI32]>,
    vals: Box<[AtomicI32]>,
    mask: usize,
}

impl SparseCounts {
    /// `capacity` is the expected number of distinct keys; the slot count
    /// is the next power of two above it.
    pub fn new(capacity: usize) -> Self {
        let slots = next_pow2(capacity);
        SparseCounts {
            keys: (0..slots).map(|_| AtomicI32::new(EMPTY)).collect(),
            vals: (0..slots).map(|_| AtomicI32::new(0)).collect(),
            mask: slots - 1,
        }
    }

    #[inline]
    fn slot_of(&self, k: i32) -> Option<usize> {
        let mut i = (k as usize) & self.mask;
        for _ in 0..=self.mask {
            match self.keys[i].load(Relaxed) {
                key if key == k => return Some(i),
                EMPTY => return None,
                _ => i = (i + 1) & self.mask,
            }
        }
        None
    }

    #[inline]
    pub fn get(&self, k: i32) -> i32 {
        match self.slot_of(k) {
            Some(i) => self.vals[i].load(Relaxed),
            None => 0,
        }
    }

    pub fn add(&self, k: i32, delta: i32) {
        let mut i = (k as usize) & self.mask;
        for _ in 0..=self.mask {
            let key = self.keys[i].load(Relaxed);
            if key == k {
                self.vals[i].fetch_add(delta, Relaxed);
                return;
            }
            if key == EMPTY {
                match self.keys[i].compare_exchange(EMPTY, k, Relaxed, Relaxed) {
                    Ok(_) => {
                        self.vals[i].fetch_add(delta, Relaxed);
                        return;
                    }
                    Err(current) if current == k => {
                        self.vals[i].fetch_add(delta, Relaxed);
                        return;
                    }
                    Err(_) => {
                        // Slot was claimed by another key; keep probing
                        // from the same index.
                        continue;
                    }
                }
            }
            i = (i + 1) & self.mask;
        }
        // The planner sizes every sparse row at twice its worst-case key
        // count, so a full table means the sizing invariant is broken.
        panic!("sparse counter row overflow (capacity {})", self.mask + 1);
    }

    pub fn clear(&self) {
        for (key, val) in self.keys.iter().zip(self.vals.iter()) {
            key.store(EMPTY, Relaxed);
            val.store(0, Relaxed);
        }
    }

    pub fn iter_nonzero(&self) -> impl Iterator<Item = (i32, i32)> + '_ {
        self.keys
            .iter()
            .zip(self.vals.iter())
            .filter_map(|(key, val)| {
                let k = key.load(Relaxed);
                let v = val.load(Relaxed);
                (k != EMPTY && v != 0).then_some((k, v))
            })
    }
}

// ============================================================================
// WORD-TOPIC ROW
// ============================================================================

/// One word's topic counters, dense or sparse per the load-factor rule.
#[derive(Debug)]
pub enum WordTopicRow {
    Dense(DenseCounts),
    Sparse(SparseCounts),
}

impl WordTopicRow {
    /// Layout rule: dense when `tf * LOAD_FACTOR` exceeds K, otherwise a
    /// sparse map of capacity `tf * LOAD_FACTOR`.
    pub fn for_word(tf: usize, num_topics: usize) -> Self {
        if tf * LOAD_FACTOR > num_topics {
            WordTopicRow::Dense(DenseCounts::new(num_topics))
        } else {
            WordTopicRow::Sparse(SparseCounts::new(tf * LOAD_FACTOR))
        }
    }

    /// Layout rule for delta aggregation rows, keyed on the node-local
    /// term frequency and doubled once more: a slice's deltas can touch
    /// both the outgoing and the incoming topic of every token.
    pub fn for_delta(local_tf: usize, num_topics: usize) -> Self {
        if local_tf * 2 * LOAD_FACTOR > num_topics {
            WordTopicRow::Dense(DenseCounts::new(num_topics))
        } else {
            WordTopicRow::Sparse(SparseCounts::new(local_tf * 2 * LOAD_FACTOR))
        }
    }

    #[inline]
    pub fn get(&self, k: i32) -> i32 {
        match self {
            WordTopicRow::Dense(row) => row.get(k),
            WordTopicRow::Sparse(row) => row.get(k),
        }
    }

    #[inline]
    pub fn add(&self, k: i32, delta: i32) {
        match self {
            WordTopicRow::Dense(row) => row.add(k, delta),
            WordTopicRow::Sparse(row) => row.add(k, delta),
        }
    }

    pub fn clear(&self) {
        match self {
            WordTopicRow::Dense(row) => row.clear(),
            WordTopicRow::Sparse(row) => row.clear(),
        }
    }

    pub fn iter_nonzero(&self) -> Box<dyn Iterator<Item = (i32, i32)> + '_> {
        match self {
            WordTopicRow::Dense(row) => Box::new(row.iter_nonzero()),
            WordTopicRow::Sparse(row) => Box::new(row.iter_nonzero()),
        }
    }

    /// Number of topics with a nonzero count.
    pub fn nonzero_count(&self) -> usize {
        self.iter_nonzero().count()
    }
}

// ============================================================================
// SUMMARY ROW
// ============================================================================

/// The K-vector of global topic masses, 64-bit because it sums counts over
/// the whole corpus.
#[derive(Debug)]
pub struct SummaryRow {
    cells: Box<[AtomicI64]>,
}

impl SummaryRow {
    pub fn new(num_topics: usize) -> Self {
        SummaryRow {
            cells: (0..num_topics).map(|_| AtomicI64::new(0)).collect(),
        }
    }

    #[inline]
    pub fn get(&self, k: i32) -> i64 {
        match self.cells.get(k as usize) {
            Some(cell) => cell.load(Relaxed),
            None => 0,
        }
    }

    #[inline]
    pub fn add(&self, k: i32, delta: i64) {
        if let Some(cell) = self.cells.get(k as usize) {
            cell.fetch_add(delta, Relaxed);
        }
    }

    pub fn clear(&self) {
        for cell in self.cells.iter() {
            cell.store(0, Relaxed);
        }
    }

    pub fn len(&self) -> usize {
        self.cells.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }

    pub fn iter_nonzero(&self) -> impl Iterator<Item = (i32, i64)> + '_ {
        self.cells.iter().enumerate().filter_map(|(k, cell)| {
            let v = cell.load(Relaxed);
            (v != 0).then_some((k as i32, v))
        })
    }
}

// ============================================================================
// PER-DOCUMENT TOPIC COUNTER
// ============================================================================

/// Thread-local open-addressed counter for one document's topics.
///
/// Cleared once per document, so instead of wiping the whole slot array it
/// remembers which slots it touched. A document has at most a few thousand
/// tokens while the array has tens of thousands of slots.
#[derive(Debug)]
pub struct TopicCounter {
    keys: Vec<i32>,
    vals: Vec<i32>,
    touched: Vec<u32>,
    mask: usize,
    capacity: usize,
}

impl TopicCounter {
    pub fn with_capacity(capacity: usize) -> Self {
        let slots = next_pow2(capacity * LOAD_FACTOR);
        TopicCounter {
            keys: vec![EMPTY; slots],
            vals: vec![0; slots],
            touched: Vec::with_capacity(capacity),
            mask: slots - 1,
            capacity,
        }
    }

    /// Logical capacity: the number of distinct keys this counter was
    /// sized for.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    #[inline]
    pub fn get(&self, k: i32) -> i32 {
        let mut i = (k as usize) & self.mask;
        loop {
            match self.keys[i] {
                key if key == k => return self.vals[i],
                EMPTY => return 0,
                _ => i = (i + 1) & self.mask,
            }
        }
    }

    #[inline]
    pub fn add(&mut self, k: i32, delta: i32) {
        let mut i = (k as usize) & self.mask;
        loop {
            match self.keys[i] {
                key if key == k => {
                    self.vals[i] += delta;
                    return;
                }
                EMPTY => {
                    self.keys[i] = k;
                    self.vals[i] = delta;
                    self.touched.push(i as u32);
                    return;
                }
                _ => i = (i + 1) & self.mask,
            }
        }
    }

    pub fn clear(&mut self) {
        for &i in &self.touched {
            self.keys[i as usize] = EMPTY;
            self.vals[i as usize] = 0;
        }
        self.touched.clear();
    }

    pub fn iter_nonzero(&self) -> impl Iterator<Item = (i32, i32)> + '_ {
        self.touched.iter().filter_map(|&i| {
            let i = i as usize;
            (self.vals[i] != 0).then_some((self.keys[i], self.vals[i]))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dense_add_and_get() {
        let row = DenseCounts::new(8);
        row.add(3, 5);
        row.add(3, -2);
        assert_eq!(row.get(3), 3);
        assert_eq!(row.get(7), 0);
        // Out of range reads are zero, writes are dropped.
        assert_eq!(row.get(100), 0);
        row.add(100, 1);
    }

    #[test]
    fn sparse_add_and_get() {
        let row = SparseCounts::new(4);
        row.add(1000, 2);
        row.add(7, 1);
        row.add(1000, 3);
        assert_eq!(row.get(1000), 5);
        assert_eq!(row.get(7), 1);
        assert_eq!(row.get(42), 0);
    }

    #[test]
    fn sparse_iter_skips_zeroed_slots() {
        let row = SparseCounts::new(8);
        row.add(5, 1);
        row.add(9, 2);
        row.add(5, -1);
        let got: Vec<_> = row.iter_nonzero().collect();
        assert_eq!(got, vec![(9, 2)]);
    }

    #[test]
    fn layout_rule_matches_load_factor() {
        // tf * 2 > K => dense
        assert!(matches!(
            WordTopicRow::for_word(51, 100),
            WordTopicRow::Dense(_)
        ));
        assert!(matches!(
            WordTopicRow::for_word(50, 100),
            WordTopicRow::Sparse(_)
        ));
    }

    #[test]
    fn summary_row_is_64_bit() {
        let row = SummaryRow::new(4);
        row.add(0, i64::from(i32::MAX));
        row.add(0, i64::from(i32::MAX));
        assert_eq!(row.get(0), 2 * i64::from(i32::MAX));
    }

    #[test]
    fn topic_counter_clear_is_complete() {
        let mut counter = TopicCounter::with_capacity(16);
        for k in 0..10 {
            counter.add(k, k + 1);
        }
        counter.clear();
        for k in 0..10 {
            assert_eq!(counter.get(k), 0);
        }
        assert_eq!(counter.iter_nonzero().count(), 0);
    }

    #[test]
    fn topic_counter_negative_then_positive() {
        let mut counter = TopicCounter::with_capacity(8);
        counter.add(3, -1);
        counter.add(3, 1);
        assert_eq!(counter.get(3), 0);
        assert_eq!(counter.iter_nonzero().count(), 0);
    }

    #[test]
    fn concurrent_sparse_adds_conserve_total() {
        use std::sync::Arc;
        let row = Arc::new(SparseCounts::new(64));
        let mut handles = Vec::new();
        for t in 0..4 {
            let row = Arc::clone(&row);
            handles.push(std::thread::spawn(move || {
                for i in 0..10_000 {
                    row.add((t * 8 + i % 8) as i32, 1);
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        let total: i64 = row.iter_nonzero().map(|(_, v)| i64::from(v)).sum();
        assert_eq!(total, 40_000);
    }
}
