//! File backends with advisory locking
//!
//! Hashing and resolving want a contiguous read-only view of a whole
//! file; patching wants random-access reads and writes. Both are modeled
//! here. Memory maps are taken under `fs2` advisory locks so cooperating
//! processes cannot truncate a file out from under a live mapping.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::ops::Deref;
use std::path::Path;

#[allow(unused_imports)]
use fs2::FileExt; // Provides lock_shared() / lock_exclusive() on File
use memmap2::{Mmap, MmapMut};

use crate::error::{Error, Result};

/// Read-ahead buffer size for [`StreamFile`].
const STREAM_BUFFER_SIZE: usize = 8 * 1024 * 1024;

/// Read-only contiguous bytes of a file: an owned buffer or a
/// shared-locked memory map.
///
/// The shared (read) lock is held for the lifetime of the mapping,
/// preventing cooperating processes from exclusively locking or
/// truncating the file while it is mapped.
pub enum SourceData {
    /// Bytes held in memory
    Buffer(Vec<u8>),
    /// Memory-mapped file; the handle keeps the shared lock alive
    Mapped {
        map: Mmap,
        #[allow(dead_code)]
        file: File,
    },
}

impl SourceData {
    /// Open `path` read-only, take a shared lock, and map it.
    ///
    /// Empty files degrade to an empty buffer since there is nothing to map.
    pub fn open(path: &Path) -> Result<Self> {
        let file = File::open(path).map_err(|e| Error::io("opening file for mmap", e))?;
        let len = file
            .metadata()
            .map_err(|e| Error::io("reading metadata", e))?
            .len();
        if len == 0 {
            return Ok(Self::Buffer(Vec::new()));
        }

        file.lock_shared()
            .map_err(|e| Error::io("acquiring shared file lock", e))?;

        // Safety: the shared lock keeps cooperating processes from
        // truncating the file while the map is live.
        let map =
            unsafe { Mmap::map(&file) }.map_err(|e| Error::io("memory mapping file", e))?;

        Ok(Self::Mapped { map, file })
    }

    /// Wrap in-memory bytes.
    pub fn from_vec(data: Vec<u8>) -> Self {
        Self::Buffer(data)
    }

    /// Length of the view in bytes.
    pub fn len(&self) -> usize {
        match self {
            Self::Buffer(data) => data.len(),
            Self::Mapped { map, .. } => map.len(),
        }
    }

    /// Whether the view is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Deref for SourceData {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        match self {
            Self::Buffer(data) => data,
            Self::Mapped { map, .. } => map,
        }
    }
}

impl AsRef<[u8]> for SourceData {
    fn as_ref(&self) -> &[u8] {
        self
    }
}

/// Random-access read/write capability the patcher runs against.
pub trait RandomAccessFile {
    /// Current length of the underlying storage in bytes.
    fn len(&self) -> i64;

    /// Whether the storage is empty.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Fill `buf` from `offset`; the full range must be inside the file.
    fn read_exact_at(&mut self, buf: &mut [u8], offset: i64) -> Result<()>;

    /// Write all of `data` at `offset`; the full range must be inside the file.
    fn write_all_at(&mut self, data: &[u8], offset: i64) -> Result<()>;
}

/// In-memory patch target.
pub struct MemoryFile {
    data: Vec<u8>,
}

impl MemoryFile {
    /// Take ownership of `data` as the working storage.
    pub fn new(data: Vec<u8>) -> Self {
        Self { data }
    }

    /// Copy of `data` zero-extended to `len` bytes.
    pub fn with_len(data: &[u8], len: usize) -> Self {
        let mut storage = data.to_vec();
        storage.resize(len.max(data.len()), 0);
        Self { data: storage }
    }

    /// Consume the file and return its bytes.
    pub fn into_inner(self) -> Vec<u8> {
        self.data
    }
}

impl RandomAccessFile for MemoryFile {
    fn len(&self) -> i64 {
        self.data.len() as i64
    }

    fn read_exact_at(&mut self, buf: &mut [u8], offset: i64) -> Result<()> {
        let start = offset as usize;
        let end = start + buf.len();
        if offset < 0 || end > self.data.len() {
            return Err(Error::invalid(format!(
                "read of {} bytes at offset {} outside {} byte buffer",
                buf.len(),
                offset,
                self.data.len()
            )));
        }
        buf.copy_from_slice(&self.data[start..end]);
        Ok(())
    }

    fn write_all_at(&mut self, data: &[u8], offset: i64) -> Result<()> {
        let start = offset as usize;
        let end = start + data.len();
        if offset < 0 || end > self.data.len() {
            return Err(Error::invalid(format!(
                "write of {} bytes at offset {} outside {} byte buffer",
                data.len(),
                offset,
                self.data.len()
            )));
        }
        self.data[start..end].copy_from_slice(data);
        Ok(())
    }
}

/// Writable memory-mapped patch target under an exclusive lock.
pub struct MappedFile {
    file: File,
    map: Option<MmapMut>,
    len: i64,
}

impl MappedFile {
    /// Open (creating if missing) `path`, extend it to at least
    /// `working_len` bytes, take an exclusive lock, and map it writable.
    pub fn open(path: &Path, working_len: i64) -> Result<Self> {
        if working_len <= 0 {
            return Err(Error::invalid("working length must be positive"));
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(path)
            .map_err(|e| Error::io("opening patch target", e))?;

        file.lock_exclusive()
            .map_err(|e| Error::io("acquiring exclusive file lock", e))?;

        let current = file
            .metadata()
            .map_err(|e| Error::io("reading metadata", e))?
            .len() as i64;
        if current < working_len {
            file.set_len(working_len as u64)
                .map_err(|e| Error::io("extending patch target", e))?;
        }
        let len = current.max(working_len);

        // Safety: exclusive lock held for the mapping's lifetime.
        let map = unsafe { MmapMut::map_mut(&file) }
            .map_err(|e| Error::io("memory mapping patch target", e))?;

        Ok(Self {
            file,
            map: Some(map),
            len,
        })
    }

    /// Flush, unmap, and truncate the file to its final size.
    pub fn truncate_to(mut self, final_len: i64) -> Result<()> {
        if let Some(map) = self.map.take() {
            map.flush().map_err(|e| Error::io("flushing patch target", e))?;
            drop(map);
        }
        self.file
            .set_len(final_len.max(0) as u64)
            .map_err(|e| Error::io("truncating patch target", e))?;
        Ok(())
    }

    fn map_ref(&self) -> Result<&MmapMut> {
        self.map
            .as_ref()
            .ok_or_else(|| Error::invalid("mapping already released"))
    }
}

impl RandomAccessFile for MappedFile {
    fn len(&self) -> i64 {
        self.len
    }

    fn read_exact_at(&mut self, buf: &mut [u8], offset: i64) -> Result<()> {
        let map = self.map_ref()?;
        let start = offset as usize;
        let end = start + buf.len();
        if offset < 0 || end > map.len() {
            return Err(Error::invalid(format!(
                "read of {} bytes at offset {} outside {} byte mapping",
                buf.len(),
                offset,
                map.len()
            )));
        }
        buf.copy_from_slice(&map[start..end]);
        Ok(())
    }

    fn write_all_at(&mut self, data: &[u8], offset: i64) -> Result<()> {
        let map = self
            .map
            .as_mut()
            .ok_or_else(|| Error::invalid("mapping already released"))?;
        let start = offset as usize;
        let end = start + data.len();
        if offset < 0 || end > map.len() {
            return Err(Error::invalid(format!(
                "write of {} bytes at offset {} outside {} byte mapping",
                data.len(),
                offset,
                map.len()
            )));
        }
        map[start..end].copy_from_slice(data);
        Ok(())
    }
}

/// Seek-based file access with an internal read-ahead buffer.
///
/// Suited to sequential-ish block reads where mapping the whole file is
/// unwanted, e.g. serving fetch callbacks from a file standing in for the
/// remote side.
pub struct StreamFile {
    file: File,
    len: i64,
    buffer: Vec<u8>,
    buffer_offset: i64,
}

impl StreamFile {
    /// Open `path` for reading and writing.
    pub fn open(path: &Path) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .map_err(|e| Error::io("opening file", e))?;
        let len = file
            .metadata()
            .map_err(|e| Error::io("reading metadata", e))?
            .len() as i64;
        Ok(Self {
            file,
            len,
            buffer: Vec::new(),
            buffer_offset: 0,
        })
    }

    /// Open `path` read-only.
    pub fn open_readonly(path: &Path) -> Result<Self> {
        let file = File::open(path).map_err(|e| Error::io("opening file", e))?;
        let len = file
            .metadata()
            .map_err(|e| Error::io("reading metadata", e))?
            .len() as i64;
        Ok(Self {
            file,
            len,
            buffer: Vec::new(),
            buffer_offset: 0,
        })
    }

    /// Read up to `len` bytes at `offset`, clamped to the end of file.
    pub fn read_at_most(&mut self, offset: i64, len: usize) -> Result<Vec<u8>> {
        let available = (self.len - offset).max(0) as usize;
        let len = len.min(available);
        let mut buf = vec![0u8; len];
        if len > 0 {
            self.read_exact_at(&mut buf, offset)?;
        }
        Ok(buf)
    }

    fn refill(&mut self, offset: i64, want: usize) -> Result<()> {
        let fill = want.max(STREAM_BUFFER_SIZE.min((self.len - offset).max(0) as usize));
        self.file
            .seek(SeekFrom::Start(offset as u64))
            .map_err(|e| Error::io("seeking", e))?;
        self.buffer.resize(fill, 0);
        self.file
            .read_exact(&mut self.buffer)
            .map_err(|e| Error::io("reading", e))?;
        self.buffer_offset = offset;
        Ok(())
    }
}

impl RandomAccessFile for StreamFile {
    fn len(&self) -> i64 {
        self.len
    }

    fn read_exact_at(&mut self, buf: &mut [u8], offset: i64) -> Result<()> {
        if offset < 0 || offset + buf.len() as i64 > self.len {
            return Err(Error::invalid(format!(
                "read of {} bytes at offset {} outside {} byte file",
                buf.len(),
                offset,
                self.len
            )));
        }
        let in_buffer = offset >= self.buffer_offset
            && offset + buf.len() as i64 <= self.buffer_offset + self.buffer.len() as i64;
        if !in_buffer {
            self.refill(offset, buf.len())?;
        }
        let start = (offset - self.buffer_offset) as usize;
        buf.copy_from_slice(&self.buffer[start..start + buf.len()]);
        Ok(())
    }

    fn write_all_at(&mut self, data: &[u8], offset: i64) -> Result<()> {
        if offset < 0 || offset + data.len() as i64 > self.len {
            return Err(Error::invalid(format!(
                "write of {} bytes at offset {} outside {} byte file",
                data.len(),
                offset,
                self.len
            )));
        }
        self.file
            .seek(SeekFrom::Start(offset as u64))
            .map_err(|e| Error::io("seeking", e))?;
        self.file
            .write_all(data)
            .map_err(|e| Error::io("writing", e))?;
        // Drop any read-ahead overlapping the written range.
        let overlap = offset < self.buffer_offset + self.buffer.len() as i64
            && offset + data.len() as i64 > self.buffer_offset;
        if overlap {
            self.buffer.clear();
            self.buffer_offset = 0;
        }
        Ok(())
    }
}

/// Size of the file at `path`, or an error if it cannot be queried.
pub fn file_size_of(path: &Path) -> Result<i64> {
    let meta = std::fs::metadata(path).map_err(|e| Error::io("reading metadata", e))?;
    Ok(meta.len() as i64)
}

/// Create an empty file at `path` if nothing exists there yet.
pub fn ensure_exists(path: &Path) -> Result<()> {
    OpenOptions::new()
        .append(true)
        .create(true)
        .open(path)
        .map_err(|e| Error::io("creating file", e))?;
    Ok(())
}

/// Round `value` up to the next multiple of `multiple`.
pub fn round_up(value: i64, multiple: i64) -> i64 {
    let remainder = value % multiple;
    if value != 0 && remainder != 0 {
        value + multiple - remainder
    } else {
        value
    }
}
