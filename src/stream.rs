// Copyright 2025-present Harīṣh Tummalachērla
// SPDX-License-Identifier: Apache-2.0

//! Block access: in-memory round-robin or disk-backed double buffering.
//!
//! Both implementations share one contract. `before_access` blocks until
//! the next block in sequence is resident, `block()` hands out read guards
//! to it (topic updates go through the block's atomic cells, so a read
//! guard is all the samplers need), and `end_access` releases it. The
//! driver brackets every block visit with this pair; only the leader
//! thread calls them.
//!
//! The disk stream is a classic producer/consumer ping-pong over two
//! block arenas. While the workers sample sequence number `p`, the
//! background thread writes back the block that occupied the other arena
//! and preloads sequence `p + 1` into it. Every pass over the corpus the
//! consumer makes — initialization, each training iteration, the final
//! dump — is one production round, so in-place topic updates persist to
//! disk between passes. Any I/O failure on the producer is fatal; a
//! write-back gets one retry first.

use std::path::PathBuf;
use std::sync::Arc;
use std::thread::JoinHandle;

use parking_lot::{Condvar, Mutex, RwLock, RwLockReadGuard};
use rayon::prelude::*;
use tracing::{debug, warn};

use crate::block::{BlockError, DataBlock};
use crate::config::Config;

/// Sequenced access to the corpus blocks.
pub trait DataStream: Send + Sync {
    /// Wait until the next block is resident.
    fn before_access(&self);
    /// The current block. Guards must be dropped before `end_access`.
    fn block(&self) -> RwLockReadGuard<'_, DataBlock>;
    /// Release the current block; the stream may evict it.
    fn end_access(&self);
    /// Write every dirty block back and stop background work.
    fn finish(&self) -> Result<(), BlockError>;
}

/// Choose the stream implementation for this run. `num_passes` is the
/// number of full sweeps the driver will make over the corpus.
pub fn open_stream(cfg: &Config, num_passes: usize) -> Result<Box<dyn DataStream>, BlockError> {
    if cfg.out_of_core && cfg.num_blocks != 1 {
        Ok(Box::new(DiskDataStream::new(cfg, num_passes)?))
    } else {
        Ok(Box::new(MemoryDataStream::new(cfg)?))
    }
}

/// Write back with a single retry; the second failure is returned.
fn write_back(block: &DataBlock) -> Result<(), BlockError> {
    if let Err(first) = block.write() {
        warn!(error = %first, "block write-back failed, retrying once");
        return block.write();
    }
    Ok(())
}

// ============================================================================
// IN-MEMORY STREAM
// ============================================================================

/// Every block resident at once, visited round-robin.
pub struct MemoryDataStream {
    blocks: Vec<RwLock<DataBlock>>,
    index: Mutex<usize>,
}

impl MemoryDataStream {
    pub fn new(cfg: &Config) -> Result<Self, BlockError> {
        let mut blocks: Vec<DataBlock> = (0..cfg.num_blocks)
            .map(|_| DataBlock::with_capacity(cfg))
            .collect();
        blocks
            .par_iter_mut()
            .enumerate()
            .try_for_each(|(i, block)| block.read(&cfg.block_path(i)))?;
        Ok(MemoryDataStream {
            blocks: blocks.into_iter().map(RwLock::new).collect(),
            index: Mutex::new(0),
        })
    }
}

impl DataStream for MemoryDataStream {
    fn before_access(&self) {
        let mut index = self.index.lock();
        *index %= self.blocks.len();
    }

    fn block(&self) -> RwLockReadGuard<'_, DataBlock> {
        self.blocks[*self.index.lock()].read()
    }

    fn end_access(&self) {
        *self.index.lock() += 1;
    }

    fn finish(&self) -> Result<(), BlockError> {
        for block in &self.blocks {
            write_back(&block.read())?;
        }
        Ok(())
    }
}

// ============================================================================
// DISK STREAM
// ============================================================================

struct StreamState {
    /// Sequence numbers fully loaded by the producer.
    produced: u64,
    /// Sequence numbers fully consumed (end_access calls).
    done: u64,
    /// Producer hit a fatal I/O error.
    failed: bool,
}

struct DiskShared {
    buffers: [RwLock<DataBlock>; 2],
    state: Mutex<StreamState>,
    cond: Condvar,
}

/// Two block arenas, a preloading producer thread, and strict sequence
/// alternation between them.
pub struct DiskDataStream {
    shared: Arc<DiskShared>,
    producer: Mutex<Option<JoinHandle<Result<(), BlockError>>>>,
}

impl DiskDataStream {
    pub fn new(cfg: &Config, num_passes: usize) -> Result<Self, BlockError> {
        let shared = Arc::new(DiskShared {
            buffers: [
                RwLock::new(DataBlock::with_capacity(cfg)),
                RwLock::new(DataBlock::with_capacity(cfg)),
            ],
            state: Mutex::new(StreamState {
                produced: 0,
                done: 0,
                failed: false,
            }),
            cond: Condvar::new(),
        });

        let paths: Vec<PathBuf> = (0..cfg.num_blocks).map(|i| cfg.block_path(i)).collect();
        let total = (num_passes * cfg.num_blocks) as u64;
        let producer = {
            let shared = Arc::clone(&shared);
            std::thread::Builder::new()
                .name("block-preload".into())
                .spawn(move || {
                    let result = preload_main(&shared, &paths, total);
                    if result.is_err() {
                        let mut state = shared.state.lock();
                        state.failed = true;
                        shared.cond.notify_all();
                    }
                    result
                })
                .map_err(|source| BlockError::Io {
                    path: PathBuf::from("block-preload"),
                    source,
                })?
        };

        Ok(DiskDataStream {
            shared,
            producer: Mutex::new(Some(producer)),
        })
    }
}

fn preload_main(
    shared: &DiskShared,
    paths: &[PathBuf],
    total: u64,
) -> Result<(), BlockError> {
    for seq in 0..total {
        {
            let mut state = shared.state.lock();
            while state.done + 1 < seq {
                shared.cond.wait(&mut state);
            }
        }
        {
            let mut buffer = shared.buffers[(seq % 2) as usize].write();
            if buffer.is_loaded() {
                write_back(&buffer)?;
            }
            let path = &paths[(seq as usize) % paths.len()];
            debug!(seq, path = %path.display(), "preloading block");
            buffer.read(path)?;
        }
        let mut state = shared.state.lock();
        state.produced = seq + 1;
        shared.cond.notify_all();
    }

    // Final drain: once the consumer is done with everything, persist
    // whatever is still sitting in the two arenas.
    let mut state = shared.state.lock();
    while state.done < total {
        shared.cond.wait(&mut state);
    }
    drop(state);
    for buffer in &shared.buffers {
        let mut buffer = buffer.write();
        if buffer.is_loaded() {
            write_back(&buffer)?;
            buffer.unload();
        }
    }
    Ok(())
}

impl DataStream for DiskDataStream {
    fn before_access(&self) {
        let mut state = self.shared.state.lock();
        while state.produced <= state.done {
            assert!(!state.failed, "block preload thread failed; aborting");
            self.shared.cond.wait(&mut state);
        }
        assert!(!state.failed, "block preload thread failed; aborting");
    }

    fn block(&self) -> RwLockReadGuard<'_, DataBlock> {
        let current = { self.shared.state.lock().done % 2 };
        self.shared.buffers[current as usize].read()
    }

    fn end_access(&self) {
        let mut state = self.shared.state.lock();
        state.done += 1;
        self.shared.cond.notify_all();
    }

    fn finish(&self) -> Result<(), BlockError> {
        let handle = self.producer.lock().take();
        match handle {
            Some(handle) => match handle.join() {
                Ok(result) => result,
                Err(_) => Err(BlockError::Io {
                    path: PathBuf::from("block-preload"),
                    source: std::io::Error::new(
                        std::io::ErrorKind::Other,
                        "preload thread panicked",
                    ),
                }),
            },
            None => Ok(()),
        }
    }
}
