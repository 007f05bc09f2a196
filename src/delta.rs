//! Delta plan types
//!
//! The resolver produces one [`DeltaElement`] per remote block describing
//! where that block's bytes can currently be found, if anywhere. The
//! patcher consumes the plan in place, so the representation keeps the
//! raw offsets rather than an owned operation list.

use rustc_hash::FxHashMap;

/// Sentinel `local_offset` meaning the block has no usable local data.
pub const NO_MATCH: i64 = -1;

/// Sentinel `block_index` marking a slot the patcher already serviced
/// out of order.
pub const TOMBSTONE: i64 = -1;

/// One operation slot: where remote block `block_index` should come from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeltaElement {
    /// Remote block index; [`TOMBSTONE`] once serviced out of order
    pub block_index: i64,
    /// Destination offset, always `block_index * block_size`
    pub block_offset: i64,
    /// Source offset in the local file, or [`NO_MATCH`]
    pub local_offset: i64,
}

impl DeltaElement {
    /// Fresh slot for `block_index` with no local source yet.
    pub fn new(block_index: i64, block_offset: i64) -> Self {
        Self {
            block_index,
            block_offset,
            local_offset: NO_MATCH,
        }
    }

    /// Classify the slot.
    pub fn op(&self) -> Op {
        if self.local_offset == NO_MATCH {
            Op::Download
        } else if self.local_offset == self.block_offset {
            Op::Done
        } else {
            Op::Copy {
                local_offset: self.local_offset,
            }
        }
    }
}

/// What a slot asks the patcher to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    /// Bytes are already at the destination
    Done,
    /// Bytes live elsewhere in the local file
    Copy { local_offset: i64 },
    /// No local source; fetch from the remote
    Download,
}

/// The full plan: one slot per remote block, plus the identical-content
/// grouping used to coalesce downloads.
#[derive(Debug, Clone, Default)]
pub struct DeltaMap {
    /// One element per remote block, indexed by block index
    pub map: Vec<DeltaElement>,

    /// For every block whose strong hash is shared with at least one
    /// other block: the indices of its peers (itself excluded).
    pub identical_blocks: FxHashMap<i64, Vec<i64>>,
}

impl DeltaMap {
    /// Whether the plan has any slots.
    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Number of slots.
    pub fn len(&self) -> usize {
        self.map.len()
    }

    /// Slots that currently require a download.
    pub fn download_count(&self) -> usize {
        self.map
            .iter()
            .filter(|e| e.local_offset == NO_MATCH)
            .count()
    }

    /// Slots whose data is already in place.
    pub fn done_count(&self) -> usize {
        self.map
            .iter()
            .filter(|e| e.local_offset == e.block_offset)
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classification() {
        let mut element = DeltaElement::new(2, 10);
        assert_eq!(element.op(), Op::Download);

        element.local_offset = 10;
        assert_eq!(element.op(), Op::Done);

        element.local_offset = 35;
        assert_eq!(element.op(), Op::Copy { local_offset: 35 });
    }

    #[test]
    fn counts() {
        let mut delta = DeltaMap::default();
        delta.map.push(DeltaElement::new(0, 0));
        delta.map.push(DeltaElement {
            block_index: 1,
            block_offset: 5,
            local_offset: 5,
        });
        delta.map.push(DeltaElement {
            block_index: 2,
            block_offset: 10,
            local_offset: 0,
        });
        assert_eq!(delta.len(), 3);
        assert_eq!(delta.download_count(), 1);
        assert_eq!(delta.done_count(), 1);
    }
}
