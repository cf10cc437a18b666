//! Contracts this crate requires from its neighbours: block I/O, the storage tree, and the
//! journal/transaction manager. None of the three is implemented here — they are VFS- and
//! kernel-adjacent plumbing that lives outside this crate — but the shapes below are exactly
//! what the core drives, and [`crate::testing`] provides fakes that satisfy them for tests.
//!
//! Block I/O is specified as a synchronous trait rather than mirroring the async, future-boxing
//! HAL traits this codebase uses for real hardware: page-cache integration and block-device I/O
//! are explicitly out of scope here, and an embedder wiring this engine
//! to a real async device is expected to drive the call to completion behind the boundary this
//! trait draws, the same way the tree and journal contracts below stay free of any particular
//! concurrency model.

use crate::error::Result;

/// Raw block access to a single brick's backing device.
pub trait BrickIo: Send + Sync {
    fn block_size(&self) -> u32;
    fn block_count(&self) -> u64;

    fn read_block(&self, block: u64, buf: &mut [u8]) -> Result<()>;
    fn write_block(&self, block: u64, buf: &[u8]) -> Result<()>;

    /// Reserve `count` not-yet-allocated blocks against this brick's free-space accounting.
    /// Returns the reserved block numbers. Mirrors the transaction manager's "grab space" step.
    fn reserve_blocks(&self, count: u64) -> Result<alloc::vec::Vec<u64>>;

    /// Release previously reserved or allocated blocks back to the free pool.
    fn free_blocks(&self, blocks: &[u64]) -> Result<()>;
}

/// An item key as understood by the storage tree: `(oid, item-type, offset, ordering)`.
///
/// `offset` sits ahead of `ordering` in both the field order and the derived `Ord` so that a
/// file's items sort primarily by byte offset, the same way a real reiser4 key packs the brick
/// ordering into bits that only break ties between items that would otherwise land at the same
/// offset. That is what makes both directions of the search work with a single field order:
/// a precise lookup for a known `(offset, ordering)` pair is an exact match, and an imprecise
/// one (offset known, ordering not) sets `ordering = ORDERING_MAX` and asks for the greatest
/// key not exceeding it, which lands on whichever single item actually owns that offset. It is
/// also what lets [`Tree::cut_range_from`] cut a file's tail with one contiguous range instead
/// of one range per brick.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ItemKey {
    pub oid: u64,
    pub item_type: u8,
    pub offset: u64,
    pub ordering: u16,
}

pub const BODY_MINOR: u8 = 1;
pub const STAT_DATA_MINOR: u8 = 0;
pub const ORDERING_MAX: u16 = u16::MAX;

impl ItemKey {
    pub fn body(oid: u64, ordering: u16, offset: u64) -> Self {
        Self {
            oid,
            item_type: BODY_MINOR,
            offset,
            ordering,
        }
    }

    /// An "imprecise" search key: ordering unknown, so the tree must be asked to find the
    /// item whose key is the greatest one not exceeding this one.
    pub fn body_search(oid: u64, offset: u64) -> Self {
        Self::body(oid, ORDERING_MAX, offset)
    }

    pub fn stat_data(oid: u64) -> Self {
        Self {
            oid,
            item_type: STAT_DATA_MINOR,
            offset: 0,
            ordering: ORDERING_MAX,
        }
    }
}

/// Search bias, mirroring the tree primitives' `FIND_EXACT` / `FIND_MAX_NOT_MORE_THAN`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FindBias {
    Exact,
    MaxNotMoreThan,
}

/// One physical extent unit: `width` contiguous blocks starting at `start`, or the sentinel
/// unallocated marker awaiting a real address from the journal at flush time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExtentUnit {
    Allocated { start: u64, width: u64 },
    Unallocated { width: u64 },
}

pub const UNALLOCATED_EXTENT_START: u64 = u64::MAX - 1;

impl ExtentUnit {
    pub fn width(&self) -> u64 {
        match self {
            ExtentUnit::Allocated { width, .. } => *width,
            ExtentUnit::Unallocated { width } => *width,
        }
    }
}

/// A body item as stored in the tree: a key plus a dense run of extent units, all living on
/// the brick named by `key.ordering`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtentItem {
    pub key: ItemKey,
    pub units: alloc::vec::Vec<ExtentUnit>,
}

impl ExtentItem {
    /// Length in bytes spanned by this item, given the stripe/block size.
    pub fn byte_len(&self, block_size: u64) -> u64 {
        self.units.iter().map(|u| u.width()).sum::<u64>() * block_size
    }

    pub fn key_range(&self, block_size: u64) -> (u64, u64) {
        (self.key.offset, self.key.offset + self.byte_len(block_size))
    }
}

/// A tree coordinate: enough to resume a search or walk without repeating it from the root.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Coord {
    pub node_id: u64,
    pub item_pos: u32,
    pub unit_pos: u32,
}

/// The storage tree, as the core needs it. A real implementation backs this with a balanced
/// on-disk tree and longterm node locks (see the lock-ordering discipline in `EngineContext`'s
/// documentation); [`crate::testing::FakeTree`] backs it with an in-memory ordered map.
pub trait Tree: Send + Sync {
    fn coord_by_key(&self, key: ItemKey, bias: FindBias) -> Option<(Coord, ExtentItem)>;

    fn insert_item(&self, item: ExtentItem) -> Result<Coord>;
    fn replace_item(&self, coord: Coord, item: ExtentItem) -> Result<()>;
    fn cut_item(&self, coord: Coord) -> Result<()>;

    /// Cut every item of `from.oid`/`from.item_type` whose offset is `>= from.offset`,
    /// regardless of which brick (`ordering`) it lives on — `from.ordering` is ignored on
    /// input. Returns the smallest key actually removed, if any, so callers (truncate) can
    /// tell whether the item straddling the new size needs a tail rewrite instead of a cut.
    fn cut_range_from(&self, from: ItemKey) -> Result<Option<ItemKey>>;

    fn right_neighbor(&self, coord: Coord) -> Option<(Coord, ExtentItem)>;
    fn left_neighbor(&self, coord: Coord) -> Option<(Coord, ExtentItem)>;

    /// Validate that `coord` still names the item it named when the seal was taken.
    fn seal_holds(&self, coord: Coord, key: ItemKey) -> bool;

    /// Iterate all body items in key order, starting at or after `from`. Used by rebalance.
    fn iter_body_items_from(&self, from: ItemKey) -> alloc::vec::Vec<(Coord, ExtentItem)>;
}

/// The journal/transaction manager, as the core needs it.
pub trait Journal: Send + Sync {
    /// Capture a dirty jnode (identified by brick + block) into the current atom.
    fn capture(&self, brick: u16, block: u64) -> Result<()>;
    fn force_commit_all(&self) -> Result<()>;
    /// True if the current atom was aborted and callers must surface an I/O error.
    fn is_aborted(&self) -> bool;
}
