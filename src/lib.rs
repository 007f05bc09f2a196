//! blocksync - In-Place Binary File Delta Synchronization
//!
//! Given the block manifest of a newer "remote" file and an older local
//! copy, blocksync finds every remote block already present locally,
//! plans the minimal set of fetches, and rewrites the local file in place
//! so it matches the remote byte for byte.
//!
//! The pipeline has three stages:
//!
//! 1. [`HashTask`] computes the manifest of the remote file: a weak
//!    rolling checksum plus a strong digest per fixed-size block.
//! 2. [`ResolveTask`] slides a block-sized window over the local file and
//!    produces a [`DeltaMap`]: per remote block, where its bytes can be
//!    found locally, if anywhere.
//! 3. [`patch`] executes the plan in place, downloading only the blocks
//!    with no local source and preserving bytes that later copies still
//!    need.

pub mod cli;
pub mod delta;
pub mod error;
pub mod file;
pub mod hasher;
pub mod manifest;
pub mod patcher;
pub mod progress;
pub mod resolver;
pub mod rolling;
pub mod strong;
pub mod task;

pub use delta::{DeltaElement, DeltaMap, Op, NO_MATCH};
pub use error::{Error, Result};
pub use file::{MappedFile, MemoryFile, RandomAccessFile, SourceData, StreamFile};
pub use hasher::{hash_blocks, HashTask};
pub use manifest::{suggested_block_size, BlockHashes, Manifest};
pub use patcher::{patch, patch_path, PatchStats};
pub use resolver::{resolve_delta, ResolveTask};
pub use rolling::RollingChecksum;
pub use strong::{StrongHash, STRONG_HASH_LEN};
