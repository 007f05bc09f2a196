//! Parallel block hasher: builds the manifest of a file
//!
//! The file is split into `ceil(N / threads)`-block strips, one worker
//! thread per strip. Workers are independent: each hashes its own block
//! range and returns the strip, which is stitched positionally when the
//! task is consumed, so no synchronization on the result is needed. The
//! final block is hashed as if zero-padded to a full block.

use std::path::Path;
use std::sync::Arc;
use std::thread::JoinHandle;

use tracing::debug;

use crate::error::{Error, Result};
use crate::file::SourceData;
use crate::manifest::{block_count, BlockHashes, Manifest};
use crate::rolling::weak_digest;
use crate::strong::StrongHash;
use crate::task::TaskState;

/// Handle to an in-flight manifest computation.
///
/// Poll it with [`state`](Self::state) (progress, cancel, done), then
/// consume it with [`result`](Self::result), which joins the workers and
/// releases the source mapping.
pub struct HashTask {
    state: Arc<TaskState>,
    strips: Vec<JoinHandle<Vec<BlockHashes>>>,
    block_size: usize,
    file_size: i64,
    source: Arc<SourceData>,
}

impl HashTask {
    /// Spawn workers hashing `source` with `block_size`-byte blocks on up
    /// to `threads` OS threads (0 means one per available CPU).
    pub fn spawn(source: Arc<SourceData>, block_size: usize, threads: usize) -> Result<Self> {
        if block_size == 0 {
            return Err(Error::invalid("block_size must be positive"));
        }
        let file_size = source.len() as i64;
        let blocks = block_count(file_size, block_size);
        let threads = effective_threads(threads, blocks);
        let per_strip = blocks.div_ceil(threads.max(1)).max(1);

        debug!(
            file_size,
            block_size,
            blocks,
            threads,
            "hashing blocks"
        );

        let state = Arc::new(TaskState::new(file_size));
        let mut strips = Vec::with_capacity(threads);
        let mut start = 0usize;
        while start < blocks {
            let end = (start + per_strip).min(blocks);
            let source = Arc::clone(&source);
            let state = Arc::clone(&state);
            strips.push(std::thread::spawn(move || {
                hash_strip(&source, block_size, start, end, &state)
            }));
            start = end;
        }

        Ok(Self {
            state,
            strips,
            block_size,
            file_size,
            source,
        })
    }

    /// Open `path`, map it, and spawn the hash task over the mapping.
    pub fn spawn_path(path: &Path, block_size: usize, threads: usize) -> Result<Self> {
        let source = Arc::new(SourceData::open(path)?);
        Self::spawn(source, block_size, threads)
    }

    /// Shared progress/cancel state.
    pub fn state(&self) -> &TaskState {
        &self.state
    }

    /// Join the workers and return the manifest.
    ///
    /// Consumes the handle, releasing the source mapping. Returns
    /// [`Error::Cancelled`] if the task was cancelled; a partial result
    /// is never exposed.
    pub fn result(self) -> Result<Manifest> {
        let mut manifest = Manifest::new(self.block_size, self.file_size);
        manifest.blocks.reserve(block_count(self.file_size, self.block_size));
        for strip in self.strips {
            let strip = strip
                .join()
                .map_err(|_| Error::manifest("hash worker panicked"))?;
            manifest.blocks.extend(strip);
        }
        drop(self.source);
        if self.state.is_cancelled() {
            return Err(Error::Cancelled);
        }
        Ok(manifest)
    }
}

fn hash_strip(
    data: &[u8],
    block_size: usize,
    start: usize,
    end: usize,
    state: &TaskState,
) -> Vec<BlockHashes> {
    let mut result = Vec::with_capacity(end - start);
    let mut padded = Vec::new();
    for index in start..end {
        if state.is_cancelled() {
            return result;
        }
        let offset = index * block_size;
        let block = &data[offset..data.len().min(offset + block_size)];
        let hashed: &[u8] = if block.len() < block_size {
            // Short final block: hash it zero-padded to a full block.
            padded.resize(block_size, 0);
            padded[..block.len()].copy_from_slice(block);
            &padded
        } else {
            block
        };
        result.push(BlockHashes {
            weak: weak_digest(hashed),
            strong: StrongHash::of(hashed),
        });
        state.add_bytes(block.len() as i64);
    }
    result
}

fn effective_threads(requested: usize, blocks: usize) -> usize {
    let available = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1);
    let requested = if requested == 0 { available } else { requested };
    requested.clamp(1, blocks.max(1))
}

/// Convenience: hash in-memory bytes to a manifest on `threads` workers.
pub fn hash_blocks(data: &[u8], block_size: usize, threads: usize) -> Result<Manifest> {
    let task = HashTask::spawn(
        Arc::new(SourceData::from_vec(data.to_vec())),
        block_size,
        threads,
    )?;
    task.result()
}
