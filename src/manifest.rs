//! Block manifest: per-block checksums plus the remote file geometry
//!
//! The manifest is produced on the side that owns the newer file and is
//! the only thing the resolver needs besides the local file. On the wire
//! it is a JSON object `{file_size, block_size, blocks}` where each block
//! entry is a `[weak, "hex-strong"]` pair; the entry's position in the
//! array is its block index.

use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::strong::StrongHash;

/// Smallest block size the suggestion heuristic will pick (5 KiB).
pub const MIN_SUGGESTED_BLOCK_SIZE: usize = 5 * 1024;

/// Largest block size the suggestion heuristic will pick (4 MiB).
pub const MAX_SUGGESTED_BLOCK_SIZE: usize = 4 * 1024 * 1024;

/// Weak and strong checksum of a single block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockHashes {
    /// Rolling checksum digest (fast, weak; collisions expected)
    pub weak: u32,
    /// Strong digest (confirms weak candidates)
    pub strong: StrongHash,
}

/// Ordered per-block checksums of the remote file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Manifest {
    /// Exact remote file size in bytes
    pub file_size: i64,

    /// Block size the checksums were computed with
    pub block_size: usize,

    /// One entry per block; the index in this list is the block index.
    /// The final block is hashed as if zero-padded to `block_size`.
    pub blocks: Vec<BlockHashes>,
}

impl Manifest {
    /// Create an empty manifest for a file of `file_size` bytes.
    pub fn new(block_size: usize, file_size: i64) -> Self {
        Self {
            file_size,
            block_size,
            blocks: Vec::new(),
        }
    }

    /// Number of blocks.
    pub fn block_count(&self) -> usize {
        self.blocks.len()
    }

    /// Read a JSON manifest from `path`.
    pub fn read_from(path: &Path) -> Result<Self> {
        let file = File::open(path).map_err(|e| Error::io("opening manifest", e))?;
        let manifest: Manifest = serde_json::from_reader(BufReader::new(file))?;
        manifest.validate()?;
        Ok(manifest)
    }

    /// Write the manifest as JSON to `path`.
    pub fn write_to(&self, path: &Path) -> Result<()> {
        let file = File::create(path).map_err(|e| Error::io("creating manifest", e))?;
        serde_json::to_writer(BufWriter::new(file), self)?;
        Ok(())
    }

    /// Check internal consistency after deserialization.
    fn validate(&self) -> Result<()> {
        if self.block_size == 0 {
            return Err(Error::manifest("block_size must be positive"));
        }
        if self.file_size < 0 {
            return Err(Error::manifest("file_size must be non-negative"));
        }
        let expected = block_count(self.file_size, self.block_size);
        if self.blocks.len() != expected {
            return Err(Error::manifest(format!(
                "expected {} blocks for {} bytes at block size {}, found {}",
                expected,
                self.file_size,
                self.block_size,
                self.blocks.len()
            )));
        }
        Ok(())
    }
}

/// Number of blocks covering `file_size` bytes at `block_size`.
pub fn block_count(file_size: i64, block_size: usize) -> usize {
    let block_size = block_size as i64;
    ((file_size + block_size - 1) / block_size).max(0) as usize
}

/// Pick a block size for a file: one 512th of the file, clamped to
/// [5 KiB, 4 MiB].
pub fn suggested_block_size(file_size: i64) -> usize {
    let candidate = (file_size / 512).max(0) as usize;
    candidate.clamp(MIN_SUGGESTED_BLOCK_SIZE, MAX_SUGGESTED_BLOCK_SIZE)
}

// BlockHashes travels as a two-element [weak, "hex"] array.
impl Serialize for BlockHashes {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        use serde::ser::SerializeTuple;
        let mut tuple = serializer.serialize_tuple(2)?;
        tuple.serialize_element(&self.weak)?;
        tuple.serialize_element(&self.strong)?;
        tuple.end()
    }
}

impl<'de> Deserialize<'de> for BlockHashes {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let (weak, strong) = <(u32, StrongHash)>::deserialize(deserializer)?;
        Ok(Self { weak, strong })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::strong::STRONG_HASH_LEN;

    fn sample_manifest() -> Manifest {
        let mut manifest = Manifest::new(5, 12);
        for chunk in [b"aaaaa".as_slice(), b"bbbbb", b"cc\0\0\0"] {
            manifest.blocks.push(BlockHashes {
                weak: crate::rolling::weak_digest(chunk),
                strong: StrongHash::of(chunk),
            });
        }
        manifest
    }

    #[test]
    fn json_round_trip() {
        let manifest = sample_manifest();
        let text = serde_json::to_string(&manifest).unwrap();
        let back: Manifest = serde_json::from_str(&text).unwrap();
        assert_eq!(back.file_size, manifest.file_size);
        assert_eq!(back.block_size, manifest.block_size);
        assert_eq!(back.blocks, manifest.blocks);
    }

    #[test]
    fn wire_shape_is_pair_array() {
        let manifest = sample_manifest();
        let value: serde_json::Value = serde_json::to_value(&manifest).unwrap();
        let blocks = value["blocks"].as_array().unwrap();
        assert_eq!(blocks.len(), 3);
        let first = blocks[0].as_array().unwrap();
        assert_eq!(first.len(), 2);
        assert!(first[0].is_u64());
        assert_eq!(first[1].as_str().unwrap().len(), STRONG_HASH_LEN * 2);
    }

    #[test]
    fn rejects_truncated_hex() {
        let text = r#"{"file_size":5,"block_size":5,"blocks":[[1,"abcd"]]}"#;
        assert!(serde_json::from_str::<Manifest>(text).is_err());
    }

    #[test]
    fn read_rejects_block_count_mismatch() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.json");
        std::fs::write(&path, r#"{"file_size":100,"block_size":5,"blocks":[]}"#).unwrap();
        assert!(Manifest::read_from(&path).is_err());
    }

    #[test]
    fn file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("manifest.json");
        let manifest = sample_manifest();
        manifest.write_to(&path).unwrap();
        let back = Manifest::read_from(&path).unwrap();
        assert_eq!(back.blocks, manifest.blocks);
    }

    #[test]
    fn block_count_math() {
        assert_eq!(block_count(0, 5), 0);
        assert_eq!(block_count(1, 5), 1);
        assert_eq!(block_count(5, 5), 1);
        assert_eq!(block_count(6, 5), 2);
        assert_eq!(block_count(36, 5), 8);
    }

    #[test]
    fn suggested_size_clamps() {
        assert_eq!(suggested_block_size(0), MIN_SUGGESTED_BLOCK_SIZE);
        assert_eq!(suggested_block_size(1024), MIN_SUGGESTED_BLOCK_SIZE);
        assert_eq!(suggested_block_size(512 * 1024 * 1024), 1024 * 1024);
        assert_eq!(
            suggested_block_size(i64::MAX / 2),
            MAX_SUGGESTED_BLOCK_SIZE
        );
    }
}
