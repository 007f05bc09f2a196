//! In-place patch execution
//!
//! Rewrites the local file so every block offset holds the corresponding
//! remote block, without a scratch copy of the file. Many planned copies
//! read bytes that other planned writes are about to destroy, so blocks
//! are processed from the highest index down: a copy whose source lies
//! above its destination is then always safe. Sources lying below are
//! preserved through a refcounted block cache, filled by an overlap sweep
//! just before each write and drained with priority over the descending
//! cursor so cached bytes live as briefly as possible.

use std::path::Path;

use rustc_hash::FxHashMap;
use tracing::{debug, trace};

use crate::delta::{DeltaMap, NO_MATCH, TOMBSTONE};
use crate::error::{Error, Result};
use crate::file::{round_up, MappedFile, RandomAccessFile};

/// Byte and block counts accumulated while patching.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PatchStats {
    /// Blocks fetched from the remote
    pub blocks_downloaded: usize,
    /// Blocks copied from elsewhere in the local file
    pub blocks_copied: usize,
    /// Blocks already at their destination
    pub blocks_in_place: usize,
    /// Bytes fetched from the remote
    pub bytes_downloaded: i64,
    /// Bytes reused from the local file (copied or in place)
    pub bytes_reused: i64,
}

/// Bytes held because a pending copy still needs them.
struct CachedBlock {
    data: Vec<u8>,
    refs: usize,
}

/// Apply `delta` to `target` in place.
///
/// `target` must already span `max(round_up(local_size), block_size * N)`
/// bytes (a multiple of `block_size`); [`patch_path`] handles that sizing.
/// `fetch` is called with `(block_index, block_size)` and must return
/// `min(block_size, file_final_size - block_index * block_size)` bytes.
/// `progress` receives `(block_bytes, bytes_done, file_final_size)` after
/// every serviced block and cancels the patch by returning `false`;
/// partial writes are left as-is.
pub fn patch<T, F, P>(
    target: &mut T,
    file_final_size: i64,
    block_size: usize,
    delta: &mut DeltaMap,
    mut fetch: F,
    mut progress: P,
) -> Result<PatchStats>
where
    T: RandomAccessFile,
    F: FnMut(i64, usize) -> Result<Vec<u8>>,
    P: FnMut(i64, i64, i64) -> bool,
{
    let block = block_size as i64;
    if block_size == 0 {
        return Err(Error::invalid("block_size must be positive"));
    }
    if file_final_size < 0 {
        return Err(Error::invalid("file_final_size must be non-negative"));
    }
    let block_total = delta.len() as i64;
    let working = target.len();
    if working % block != 0 {
        return Err(Error::invalid(format!(
            "working size {} is not a multiple of block size {}",
            working, block_size
        )));
    }
    if working < block * block_total {
        return Err(Error::invalid(format!(
            "working size {} cannot hold {} blocks of {} bytes",
            working, block_total, block_size
        )));
    }

    debug!(
        blocks = block_total,
        block_size,
        file_final_size,
        downloads = delta.download_count(),
        "patching"
    );

    // Pending copies bucketed by the block slot their source lies in, so
    // a write only has to sweep its own slot and the two neighbours.
    let slot_count = (working / block) as usize;
    let mut ref_cache: Vec<Vec<usize>> = vec![Vec::new(); slot_count];
    for (index, element) in delta.map.iter().enumerate() {
        if element.local_offset != NO_MATCH && element.local_offset != element.block_offset {
            ref_cache[(element.local_offset / block) as usize].push(index);
        }
    }

    let mut block_cache: FxHashMap<i64, CachedBlock> = FxHashMap::default();
    let mut priority: Vec<usize> = Vec::new();
    let mut serviced = vec![false; delta.len()];
    let mut stats = PatchStats::default();
    let mut bytes_done: i64 = 0;

    let mut cursor = block_total - 1;
    loop {
        let index = if let Some(index) = priority.pop() {
            index
        } else if cursor >= 0 {
            let index = cursor as usize;
            cursor -= 1;
            index
        } else {
            break;
        };
        if serviced[index] || delta.map[index].block_index == TOMBSTONE {
            continue;
        }
        let via_priority = cursor >= index as i64;

        let write_offset = index as i64 * block;

        // Overlap sweep: any pending copy sourced within a block of this
        // write loses its bytes, so capture them first. A write can only
        // overlap sources bucketed in the adjacent slots.
        let mut to_cache: Vec<usize> = Vec::new();
        let first_slot = (index.saturating_sub(1)).min(slot_count.saturating_sub(1));
        let last_slot = (index + 1).min(slot_count.saturating_sub(1));
        for slot in first_slot..=last_slot {
            for &candidate in &ref_cache[slot] {
                let source = delta.map[candidate].local_offset;
                if (source - write_offset).abs() < block {
                    to_cache.push(candidate);
                }
            }
        }
        if to_cache.len() == 1 && to_cache[0] == index {
            // The only endangered source feeds this very write; the
            // buffered copy below handles the overlapping move on its own.
            to_cache.clear();
        }
        for candidate in to_cache {
            let source = delta.map[candidate].local_offset;
            match block_cache.entry(source) {
                std::collections::hash_map::Entry::Occupied(mut entry) => {
                    entry.get_mut().refs += 1;
                }
                std::collections::hash_map::Entry::Vacant(entry) => {
                    let mut data = vec![0u8; block_size];
                    target.read_exact_at(&mut data, source)?;
                    entry.insert(CachedBlock { data, refs: 1 });
                    trace!(source, "cached endangered block");
                }
            }
            priority.push(candidate);
            ref_cache[(source / block) as usize].retain(|&i| i != candidate);
        }

        // Service the slot.
        let local_offset = delta.map[index].local_offset;
        let block_len = (file_final_size - write_offset).clamp(0, block);
        if local_offset == write_offset {
            stats.blocks_in_place += 1;
            stats.bytes_reused += block_len;
        } else if local_offset == NO_MATCH {
            let data = fetch(index as i64, block_size)?;
            let expected = block_len as usize;
            if data.len() < expected {
                return Err(Error::ShortFetch {
                    block_index: index as i64,
                    expected,
                    got: data.len(),
                });
            }
            // Write only the bytes the remote actually has; the logical
            // zero padding of the final block never lands on disk.
            target.write_all_at(&data[..expected], write_offset)?;
            stats.blocks_downloaded += 1;
            stats.bytes_downloaded += expected as i64;

            // Download coalescing: identical blocks still waiting on a
            // download can copy from this freshly written destination.
            // Only a fully written block qualifies; a partial tail write
            // leaves stale bytes where a peer's copy would read them.
            if expected == block_size {
                if let Some(peers) = delta.identical_blocks.get(&(index as i64)) {
                    for &peer in peers {
                        let peer = peer as usize;
                        if !serviced[peer]
                            && delta.map[peer].block_index != TOMBSTONE
                            && delta.map[peer].local_offset == NO_MATCH
                        {
                            delta.map[peer].local_offset = write_offset;
                            trace!(peer, from = write_offset, "promoted identical block");
                        }
                    }
                }
            }
        } else {
            // Copy. Its own source can no longer endanger anything.
            ref_cache[(local_offset / block) as usize].retain(|&i| i != index);
            if let Some(mut entry) = block_cache.remove(&local_offset) {
                target.write_all_at(&entry.data, write_offset)?;
                entry.refs -= 1;
                if entry.refs > 0 {
                    block_cache.insert(local_offset, entry);
                }
            } else {
                let mut data = vec![0u8; block_size];
                target.read_exact_at(&mut data, local_offset)?;
                target.write_all_at(&data, write_offset)?;
            }
            stats.blocks_copied += 1;
            stats.bytes_reused += block_len;
        }

        serviced[index] = true;
        if via_priority {
            delta.map[index].block_index = TOMBSTONE;
        }

        bytes_done += block_len;
        if !progress(block_len, bytes_done, file_final_size) {
            return Err(Error::Cancelled);
        }
    }

    debug!(
        downloaded = stats.blocks_downloaded,
        copied = stats.blocks_copied,
        in_place = stats.blocks_in_place,
        "patch complete"
    );
    Ok(stats)
}

/// Patch the file at `path` in place and truncate it to its final size.
///
/// Extends the file's working storage to
/// `max(round_up(local_size, block_size), block_size * N)` before mapping
/// it, so every block write lands in allocated space.
pub fn patch_path<F, P>(
    path: &Path,
    file_final_size: i64,
    block_size: usize,
    delta: &mut DeltaMap,
    fetch: F,
    progress: P,
) -> Result<PatchStats>
where
    F: FnMut(i64, usize) -> Result<Vec<u8>>,
    P: FnMut(i64, i64, i64) -> bool,
{
    if block_size == 0 {
        return Err(Error::invalid("block_size must be positive"));
    }
    crate::file::ensure_exists(path)?;
    if delta.is_empty() {
        // Nothing to write; the remote file is empty.
        std::fs::OpenOptions::new()
            .write(true)
            .open(path)
            .and_then(|f| f.set_len(file_final_size.max(0) as u64))
            .map_err(|e| Error::io("truncating patch target", e))?;
        return Ok(PatchStats::default());
    }

    let block = block_size as i64;
    let local_size = crate::file::file_size_of(path)?;
    let working = round_up(local_size, block).max(block * delta.len() as i64);
    let mut target = MappedFile::open(path, working)?;
    let stats = patch(&mut target, file_final_size, block_size, delta, fetch, progress)?;
    target.truncate_to(file_final_size)?;
    Ok(stats)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::file::MemoryFile;
    use crate::hasher::hash_blocks;
    use crate::resolver::resolve_delta;

    /// Full hash → resolve → patch round trip over in-memory buffers,
    /// returning the patched bytes and the stats.
    fn sync(old: &[u8], new: &[u8], block_size: usize) -> (Vec<u8>, PatchStats) {
        let manifest = hash_blocks(new, block_size, 1).unwrap();
        let mut delta = resolve_delta(old, block_size, &manifest, 1).unwrap();

        let working = round_up(old.len() as i64, block_size as i64)
            .max((block_size * manifest.block_count()) as i64);
        let mut target = MemoryFile::with_len(old, working as usize);

        let stats = patch(
            &mut target,
            new.len() as i64,
            block_size,
            &mut delta,
            |index, size| {
                let start = (index as usize * size).min(new.len());
                let end = (start + size).min(new.len());
                Ok(new[start..end].to_vec())
            },
            |_, _, _| true,
        )
        .unwrap();

        let mut patched = target.into_inner();
        patched.truncate(new.len());
        (patched, stats)
    }

    #[test]
    fn identical_aligned_file_needs_nothing() {
        let data = b"aaaaabbbbbcccccddddd";
        let (patched, stats) = sync(data, data, 5);
        assert_eq!(&patched, data);
        assert_eq!(stats.blocks_downloaded, 0);
        assert_eq!(stats.blocks_in_place, 4);
    }

    #[test]
    fn pure_download() {
        let (patched, stats) = sync(b"..........", b"ABCDEFGHIJ", 5);
        assert_eq!(&patched, b"ABCDEFGHIJ");
        assert_eq!(stats.blocks_downloaded, 2);
    }

    #[test]
    fn copy_from_higher_offset() {
        // Needed bytes sit above their destination; safe under the
        // descending order without any caching.
        let (patched, stats) = sync(b"XXXXXaaaaa", b"aaaaaYYYYY", 5);
        assert_eq!(&patched, b"aaaaaYYYYY");
        assert_eq!(stats.blocks_copied, 1);
        assert_eq!(stats.blocks_downloaded, 1);
    }

    #[test]
    fn copy_from_lower_offset_uses_cache() {
        // "bbbbb" must move up while "ccccc" moves down across it.
        let old = b"bbbbbcccccXXXXX";
        let new = b"cccccXXXXXbbbbb";
        let (patched, stats) = sync(old, new, 5);
        assert_eq!(&patched, new);
        assert_eq!(stats.blocks_downloaded, 0);
    }

    #[test]
    fn rejects_misaligned_working_size() {
        let mut target = MemoryFile::new(vec![0; 12]);
        let mut delta = DeltaMap::default();
        let result = patch(
            &mut target,
            12,
            5,
            &mut delta,
            |_, _| Ok(Vec::new()),
            |_, _, _| true,
        );
        assert!(matches!(result, Err(Error::InvalidArgument { .. })));
    }

    #[test]
    fn rejects_undersized_working_storage() {
        let manifest = hash_blocks(b"aaaaabbbbb", 5, 1).unwrap();
        let mut delta = resolve_delta(b"", 5, &manifest, 1).unwrap();
        let mut target = MemoryFile::new(vec![0; 5]);
        let result = patch(
            &mut target,
            10,
            5,
            &mut delta,
            |_, _| Ok(vec![0; 5]),
            |_, _, _| true,
        );
        assert!(matches!(result, Err(Error::InvalidArgument { .. })));
    }

    #[test]
    fn short_fetch_is_fatal() {
        let manifest = hash_blocks(b"aaaaabbbbb", 5, 1).unwrap();
        let mut delta = resolve_delta(b"", 5, &manifest, 1).unwrap();
        let mut target = MemoryFile::new(vec![0; 10]);
        let result = patch(
            &mut target,
            10,
            5,
            &mut delta,
            |_, _| Ok(vec![0; 3]),
            |_, _, _| true,
        );
        assert!(matches!(result, Err(Error::ShortFetch { .. })));
    }

    #[test]
    fn progress_false_cancels() {
        let manifest = hash_blocks(b"aaaaabbbbb", 5, 1).unwrap();
        let mut delta = resolve_delta(b"", 5, &manifest, 1).unwrap();
        let mut target = MemoryFile::new(vec![0; 10]);
        let mut calls = 0;
        let result = patch(
            &mut target,
            10,
            5,
            &mut delta,
            |_, _| Ok(vec![b'x'; 5]),
            |_, _, _| {
                calls += 1;
                false
            },
        );
        assert!(matches!(result, Err(Error::Cancelled)));
        assert_eq!(calls, 1);
    }

    #[test]
    fn progress_sums_to_final_size() {
        let new = b"ABCDEFGHIJKLM"; // 13 bytes, unaligned
        let manifest = hash_blocks(new, 5, 1).unwrap();
        let mut delta = resolve_delta(b"", 5, &manifest, 1).unwrap();
        let mut target = MemoryFile::new(vec![0; 15]);
        let mut total = 0;
        patch(
            &mut target,
            new.len() as i64,
            5,
            &mut delta,
            |index, size| {
                let start = (index as usize * size).min(new.len());
                let end = (start + size).min(new.len());
                Ok(new[start..end].to_vec())
            },
            |now, done, final_size| {
                total += now;
                assert!(done <= final_size);
                true
            },
        )
        .unwrap();
        assert_eq!(total, new.len() as i64);
    }

    #[test]
    fn identical_blocks_fetch_once() {
        let new = vec![b'z'; 40]; // eight identical blocks
        let manifest = hash_blocks(&new, 5, 1).unwrap();
        let mut delta = resolve_delta(b"not it", 5, &manifest, 1).unwrap();
        let mut target = MemoryFile::new(vec![0; 40]);
        let mut fetches = 0;
        patch(
            &mut target,
            40,
            5,
            &mut delta,
            |_, _| {
                fetches += 1;
                Ok(vec![b'z'; 5])
            },
            |_, _, _| true,
        )
        .unwrap();
        assert_eq!(fetches, 1);
        assert_eq!(target.into_inner(), new);
    }

    #[test]
    fn patch_path_extends_and_truncates() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("local.bin");
        std::fs::write(&path, b"aaaaabb").unwrap();

        let new = b"bbaaaaa";
        let manifest = hash_blocks(new, 5, 1).unwrap();
        let mut delta = resolve_delta(b"aaaaabb", 5, &manifest, 1).unwrap();

        patch_path(
            &path,
            new.len() as i64,
            5,
            &mut delta,
            |index, size| {
                let start = (index as usize * size).min(new.len());
                let end = (start + size).min(new.len());
                Ok(new[start..end].to_vec())
            },
            |_, _, _| true,
        )
        .unwrap();

        assert_eq!(std::fs::read(&path).unwrap(), new);
    }

    #[test]
    fn patch_path_creates_missing_target() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fresh.bin");

        let new = b"0123456789";
        let manifest = hash_blocks(new, 5, 1).unwrap();
        let mut delta = resolve_delta(b"", 5, &manifest, 1).unwrap();

        patch_path(
            &path,
            new.len() as i64,
            5,
            &mut delta,
            |index, size| {
                let start = (index as usize * size).min(new.len());
                let end = (start + size).min(new.len());
                Ok(new[start..end].to_vec())
            },
            |_, _, _| true,
        )
        .unwrap();

        assert_eq!(std::fs::read(&path).unwrap(), new);
    }

    #[test]
    fn empty_remote_truncates_local() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("shrink.bin");
        std::fs::write(&path, b"old content").unwrap();

        let mut delta = DeltaMap::default();
        patch_path(&path, 0, 5, &mut delta, |_, _| Ok(Vec::new()), |_, _, _| true).unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), b"");
    }
}
