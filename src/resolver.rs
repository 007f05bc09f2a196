//! Delta resolver: finds where remote blocks already live in the local file
//!
//! The local file is scanned with a block-sized window sliding one byte at
//! a time. The rolling checksum filters candidates, the strong hash
//! confirms them, and every confirmed window installs a source offset into
//! the plan slot of the matching remote block. Scanning parallelizes over
//! contiguous strips; workers share the plan behind a mutex that is taken
//! only when a match is installed.

use std::path::Path;
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use rustc_hash::FxHashMap;
use tracing::debug;

use crate::delta::{DeltaElement, DeltaMap, NO_MATCH};
use crate::error::{Error, Result};
use crate::file::SourceData;
use crate::manifest::Manifest;
use crate::rolling::RollingChecksum;
use crate::strong::StrongHash;
use crate::task::TaskState;

/// Strips smaller than this fall back to fewer threads.
const MIN_STRIP_BYTES: i64 = 10 * 1024 * 1024;

type LookupTable = FxHashMap<u32, FxHashMap<StrongHash, i64>>;

/// Handle to an in-flight delta resolution.
pub struct ResolveTask {
    state: Arc<TaskState>,
    workers: Vec<JoinHandle<()>>,
    map: Arc<Mutex<Vec<DeltaElement>>>,
    identical_blocks: FxHashMap<i64, Vec<i64>>,
    source: Arc<SourceData>,
}

impl ResolveTask {
    /// Spawn workers scanning `source` against `manifest` on up to
    /// `threads` OS threads (0 means one per available CPU).
    pub fn spawn(
        source: Arc<SourceData>,
        block_size: usize,
        manifest: &Manifest,
        threads: usize,
    ) -> Result<Self> {
        if block_size == 0 {
            return Err(Error::invalid("block_size must be positive"));
        }

        let file_size = source.len() as i64;
        let (lookup, identical_blocks) = build_lookup(manifest);
        let lookup = Arc::new(lookup);

        let map: Vec<DeltaElement> = (0..manifest.block_count() as i64)
            .map(|i| DeltaElement::new(i, i * block_size as i64))
            .collect();
        let map = Arc::new(Mutex::new(map));

        let state = Arc::new(TaskState::new(file_size));
        let strips = partition_strips(file_size, block_size as i64, threads);

        debug!(
            file_size,
            block_size,
            blocks = manifest.block_count(),
            strips = strips.len(),
            "resolving delta"
        );

        let mut workers = Vec::with_capacity(strips.len());
        for (strip_start, strip_len) in strips {
            let source = Arc::clone(&source);
            let lookup = Arc::clone(&lookup);
            let map = Arc::clone(&map);
            let state = Arc::clone(&state);
            workers.push(std::thread::spawn(move || {
                scan_strip(
                    &source,
                    block_size,
                    strip_start,
                    strip_len,
                    &lookup,
                    &map,
                    &state,
                );
            }));
        }

        Ok(Self {
            state,
            workers,
            map,
            identical_blocks,
            source,
        })
    }

    /// Open `path`, map it, and spawn the resolve task over the mapping.
    pub fn spawn_path(
        path: &Path,
        block_size: usize,
        manifest: &Manifest,
        threads: usize,
    ) -> Result<Self> {
        let source = Arc::new(SourceData::open(path)?);
        Self::spawn(source, block_size, manifest, threads)
    }

    /// Shared progress/cancel state.
    pub fn state(&self) -> &TaskState {
        &self.state
    }

    /// Join the workers and return the plan.
    ///
    /// Consumes the handle, releasing the source mapping. Returns
    /// [`Error::Cancelled`] if the task was cancelled.
    pub fn result(self) -> Result<DeltaMap> {
        for worker in self.workers {
            worker
                .join()
                .map_err(|_| Error::manifest("resolve worker panicked"))?;
        }
        drop(self.source);
        if self.state.is_cancelled() {
            return Err(Error::Cancelled);
        }
        let map = Arc::try_unwrap(self.map)
            .map_err(|_| Error::manifest("delta map still shared after join"))?
            .into_inner()
            .map_err(|_| Error::manifest("delta map lock poisoned"))?;
        let delta = DeltaMap {
            map,
            identical_blocks: self.identical_blocks,
        };
        debug!(
            blocks = delta.len(),
            in_place = delta.done_count(),
            downloads = delta.download_count(),
            "delta resolved"
        );
        Ok(delta)
    }
}

/// Two-level candidate table plus the identical-content grouping.
///
/// Blocks sharing a (weak, strong) pair collapse to the first index seen;
/// the full peer sets are kept separately so the patcher can coalesce
/// their downloads.
fn build_lookup(manifest: &Manifest) -> (LookupTable, FxHashMap<i64, Vec<i64>>) {
    let mut lookup: LookupTable = FxHashMap::default();
    let mut groups: FxHashMap<StrongHash, Vec<i64>> = FxHashMap::default();

    for (index, block) in manifest.blocks.iter().enumerate() {
        let index = index as i64;
        lookup
            .entry(block.weak)
            .or_default()
            .entry(block.strong)
            .or_insert(index);
        groups.entry(block.strong).or_default().push(index);
    }

    let mut identical_blocks = FxHashMap::default();
    for group in groups.into_values() {
        if group.len() < 2 {
            continue;
        }
        for &member in &group {
            let peers: Vec<i64> = group.iter().copied().filter(|&i| i != member).collect();
            identical_blocks.insert(member, peers);
        }
    }

    (lookup, identical_blocks)
}

/// Partition the file into per-worker strips of `(start, len)` bytes.
fn partition_strips(file_size: i64, block_size: i64, threads: usize) -> Vec<(i64, i64)> {
    if file_size == 0 {
        return Vec::new();
    }
    let available = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1);
    let requested = if threads == 0 { available } else { threads } as i64;
    let by_size = (file_size / MIN_STRIP_BYTES).max(1);
    let count = requested.min(by_size).max(1);

    let strip_len = (file_size / count).max(block_size.max(1));
    let mut strips = Vec::new();
    let mut start = 0;
    while start < file_size {
        let len = if strips.len() as i64 == count - 1 {
            file_size - start
        } else {
            strip_len.min(file_size - start)
        };
        strips.push((start, len));
        start += len;
    }
    strips
}

fn scan_strip(
    data: &[u8],
    block_size: usize,
    strip_start: i64,
    strip_len: i64,
    lookup: &LookupTable,
    map: &Mutex<Vec<DeltaElement>>,
    state: &TaskState,
) {
    let file_len = data.len();
    let block = block_size;

    // Window starts this worker owns. Strips after the first also test the
    // positions straddling into the preceding strip.
    let lo = if strip_start == 0 {
        0
    } else {
        (strip_start as usize).saturating_sub(block - 1)
    };
    let strip_end = (strip_start + strip_len) as usize;
    let hi = if strip_end >= file_len {
        (file_len + 1).saturating_sub(block)
    } else {
        strip_end.saturating_sub(block - 1)
    };

    let mut reported: i64 = 0;
    let mut consumed: i64 = 0;
    let mut cancelled = false;

    let mut weak = RollingChecksum::new();
    let mut last_failed = false;
    let mut last_failed_weak = 0u32;
    // Strong hashes of destination blocks as they currently sit in the
    // local file, so identical data already at its destination is not
    // scheduled for a pointless self-copy.
    let mut destination_hashes: FxHashMap<i64, StrongHash> = FxHashMap::default();

    let mut pos = lo;
    while pos < hi {
        // Report progress and poll cancellation once per block of input.
        if consumed - reported >= block as i64 {
            let chunk = (consumed - reported).min(strip_len - reported);
            if chunk > 0 {
                state.add_bytes(chunk);
                reported += chunk;
            }
            if state.is_cancelled() {
                cancelled = true;
                break;
            }
        }

        if weak.is_empty() {
            if pos + block > file_len {
                break;
            }
            weak.update(&data[pos..pos + block]);
            consumed += block as i64;
        }

        let digest = weak.digest();

        // Long runs of identical bytes keep producing the same weak digest;
        // once it has failed the strong check there is no point retrying
        // until the digest changes. This can skip a real match hiding
        // behind a colliding digest, a deliberate trade of rare block
        // reuse for not crawling through constant regions.
        let skip = last_failed && last_failed_weak == digest;

        if !skip {
            if let Some(candidates) = lookup.get(&digest) {
                let strong = StrongHash::of(&data[pos..pos + block]);
                if let Some(&block_index) = candidates.get(&strong) {
                    last_failed = false;
                    let local_offset = pos as i64;
                    let block_offset = block_index * block as i64;

                    if local_offset != block_offset
                        && block_offset + block as i64 <= file_len as i64
                    {
                        let destination_hash =
                            *destination_hashes.entry(block_offset).or_insert_with(|| {
                                let start = block_offset as usize;
                                StrongHash::of(&data[start..start + block])
                            });
                        if destination_hash == strong {
                            // Destination already holds these bytes; skip the
                            // window so the same block is not rediscovered
                            // from an overlapping offset.
                            weak.clear();
                            pos += block;
                            continue;
                        }
                    }

                    {
                        let mut map = map.lock().expect("delta map lock");
                        let slot = &mut map[block_index as usize];
                        if slot.local_offset == NO_MATCH {
                            slot.local_offset = local_offset;
                        }
                    }
                    weak.clear();
                    pos += block;
                    continue;
                }
                last_failed = true;
                last_failed_weak = digest;
            } else {
                last_failed = true;
                last_failed_weak = digest;
            }
        }

        // No match: slide one byte.
        if pos + block >= file_len {
            break;
        }
        weak.rotate(data[pos], data[pos + block]);
        pos += 1;
        consumed += 1;
    }

    // Account the strip exactly once unless cancelled, so bytes_done sums
    // to the file size on clean completion.
    if !cancelled {
        state.add_bytes(strip_len - reported);
    }
}

/// Convenience: resolve a delta for in-memory bytes on `threads` workers.
pub fn resolve_delta(
    data: &[u8],
    block_size: usize,
    manifest: &Manifest,
    threads: usize,
) -> Result<DeltaMap> {
    let task = ResolveTask::spawn(
        Arc::new(SourceData::from_vec(data.to_vec())),
        block_size,
        manifest,
        threads,
    )?;
    task.result()
}
