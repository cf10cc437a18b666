//! C11: in-memory fakes satisfying the collaborator contracts in `collaborators.rs`, used by
//! every other module's unit tests. Not a mock framework: each fake is a small, honest
//! implementation backed by ordinary collections, the same way the rest of the tree prefers a
//! real (if simplified) implementation over a record-and-replay stub.

use alloc::collections::BTreeMap;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU64, Ordering};

use spin::Mutex;

use crate::collaborators::{BrickIo, Coord, ExtentItem, FindBias, ItemKey, Journal, Tree};
use crate::error::{Error, Result};

/// A brick backed by a flat in-memory buffer, with a free list for `reserve_blocks`/
/// `free_blocks` instead of a real allocator.
pub struct FakeBlockDevice {
    block_size: u32,
    block_count: u64,
    blocks: Mutex<Vec<Vec<u8>>>,
    free: Mutex<Vec<u64>>,
}

impl FakeBlockDevice {
    pub fn new(block_size: u32, block_count: u64) -> Self {
        let blocks = (0..block_count).map(|_| alloc::vec![0u8; block_size as usize]).collect();
        // Block 0 is conventionally the superblock; leave it out of the free list so tests
        // that reserve space never hand it back by accident.
        let free = (1..block_count).collect();
        Self {
            block_size,
            block_count,
            blocks: Mutex::new(blocks),
            free: Mutex::new(free),
        }
    }
}

impl BrickIo for FakeBlockDevice {
    fn block_size(&self) -> u32 {
        self.block_size
    }

    fn block_count(&self) -> u64 {
        self.block_count
    }

    fn read_block(&self, block: u64, buf: &mut [u8]) -> Result<()> {
        let blocks = self.blocks.lock();
        let src = blocks.get(block as usize).ok_or(Error::Invalid("block out of range"))?;
        if buf.len() != src.len() {
            return Err(Error::Invalid("read buffer size mismatch"));
        }
        buf.copy_from_slice(src);
        Ok(())
    }

    fn write_block(&self, block: u64, buf: &[u8]) -> Result<()> {
        let mut blocks = self.blocks.lock();
        let dst = blocks.get_mut(block as usize).ok_or(Error::Invalid("block out of range"))?;
        if buf.len() != dst.len() {
            return Err(Error::Invalid("write buffer size mismatch"));
        }
        dst.copy_from_slice(buf);
        Ok(())
    }

    fn reserve_blocks(&self, count: u64) -> Result<Vec<u64>> {
        let mut free = self.free.lock();
        let n = count.min(free.len() as u64) as usize;
        Ok(free.drain(..n).collect())
    }

    fn free_blocks(&self, blocks: &[u64]) -> Result<()> {
        self.free.lock().extend_from_slice(blocks);
        Ok(())
    }
}

/// An ordered-map tree. Each live item has a stable [`Coord`] minted the first time it is
/// reached, tracked in `handles` so `seal_holds`/`right_neighbor`/`left_neighbor` can resolve a
/// coordinate back to the key it named without needing a real node/position pair.
pub struct FakeTree {
    items: Mutex<BTreeMap<ItemKey, ExtentItem>>,
    handles: Mutex<BTreeMap<u64, ItemKey>>,
    next_coord: AtomicU64,
}

impl Default for FakeTree {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeTree {
    pub fn new() -> Self {
        Self {
            items: Mutex::new(BTreeMap::new()),
            handles: Mutex::new(BTreeMap::new()),
            next_coord: AtomicU64::new(1),
        }
    }

    fn mint_coord(&self, key: ItemKey) -> Coord {
        let id = self.next_coord.fetch_add(1, Ordering::Relaxed);
        self.handles.lock().insert(id, key);
        Coord {
            node_id: id,
            item_pos: 0,
            unit_pos: 0,
        }
    }

    fn key_for(&self, coord: Coord) -> Option<ItemKey> {
        self.handles.lock().get(&coord.node_id).copied()
    }
}

impl Tree for FakeTree {
    fn coord_by_key(&self, key: ItemKey, bias: FindBias) -> Option<(Coord, ExtentItem)> {
        let items = self.items.lock();
        let found_key = match bias {
            FindBias::Exact => items.contains_key(&key).then_some(key),
            FindBias::MaxNotMoreThan => items.range(..=key).next_back().map(|(k, _)| *k),
        }?;
        let item = items.get(&found_key)?.clone();
        drop(items);
        Some((self.mint_coord(found_key), item))
    }

    fn insert_item(&self, item: ExtentItem) -> Result<Coord> {
        let key = item.key;
        self.items.lock().insert(key, item);
        Ok(self.mint_coord(key))
    }

    fn replace_item(&self, coord: Coord, item: ExtentItem) -> Result<()> {
        let old_key = self.key_for(coord).ok_or(Error::NotFound)?;
        let mut items = self.items.lock();
        if !items.contains_key(&old_key) {
            return Err(Error::NotFound);
        }
        items.remove(&old_key);
        let new_key = item.key;
        items.insert(new_key, item);
        drop(items);
        self.handles.lock().insert(coord.node_id, new_key);
        Ok(())
    }

    fn cut_item(&self, coord: Coord) -> Result<()> {
        let old_key = self.key_for(coord).ok_or(Error::NotFound)?;
        self.items.lock().remove(&old_key);
        self.handles.lock().remove(&coord.node_id);
        Ok(())
    }

    fn cut_range_from(&self, from: ItemKey) -> Result<Option<ItemKey>> {
        // `from.ordering` is part of the caller's key but must not narrow the range: with
        // offset ahead of ordering in `ItemKey`'s field order, a range that started at
        // `from` verbatim would skip any item at `from.offset` whose ordering sorts below
        // `from.ordering` (callers pass `ORDERING_MAX` via `body_search`, which would skip
        // everything). Rewriting the lower bound's ordering to zero makes the range cover
        // every brick at or after `from.offset`.
        let lower = ItemKey {
            ordering: 0,
            ..from
        };
        let mut items = self.items.lock();
        let victims: Vec<ItemKey> = items
            .range(lower..)
            .map(|(k, _)| *k)
            .take_while(|k| k.oid == from.oid && k.item_type == from.item_type)
            .collect();
        let smallest = victims.iter().min().copied();
        for k in &victims {
            items.remove(k);
        }
        Ok(smallest)
    }

    fn right_neighbor(&self, coord: Coord) -> Option<(Coord, ExtentItem)> {
        let key = self.key_for(coord)?;
        let items = self.items.lock();
        let (next_key, next_item) = items.range((core::ops::Bound::Excluded(key), core::ops::Bound::Unbounded)).next()?;
        let (next_key, next_item) = (*next_key, next_item.clone());
        drop(items);
        Some((self.mint_coord(next_key), next_item))
    }

    fn left_neighbor(&self, coord: Coord) -> Option<(Coord, ExtentItem)> {
        let key = self.key_for(coord)?;
        let items = self.items.lock();
        let (prev_key, prev_item) = items.range(..key).next_back()?;
        let (prev_key, prev_item) = (*prev_key, prev_item.clone());
        drop(items);
        Some((self.mint_coord(prev_key), prev_item))
    }

    fn seal_holds(&self, coord: Coord, key: ItemKey) -> bool {
        match self.key_for(coord) {
            Some(k) if k == key => self.items.lock().contains_key(&key),
            _ => false,
        }
    }

    fn iter_body_items_from(&self, from: ItemKey) -> Vec<(Coord, ExtentItem)> {
        let items = self.items.lock();
        let matches: Vec<(ItemKey, ExtentItem)> = items
            .range(from..)
            .filter(|(k, _)| k.item_type == crate::collaborators::BODY_MINOR)
            .map(|(k, v)| (*k, v.clone()))
            .collect();
        drop(items);
        matches.into_iter().map(|(k, v)| (self.mint_coord(k), v)).collect()
    }
}

/// Records captured (brick, block) pairs; `force_commit_all` just clears them. `aborted` lets a
/// test simulate a journal that has given up, the one behaviour real callers must check for.
#[derive(Default)]
pub struct FakeJournal {
    captured: Mutex<Vec<(u16, u64)>>,
    aborted: core::sync::atomic::AtomicBool,
}

impl FakeJournal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_aborted(&self, aborted: bool) {
        self.aborted.store(aborted, Ordering::Relaxed);
    }

    pub fn captured(&self) -> Vec<(u16, u64)> {
        self.captured.lock().clone()
    }
}

impl Journal for FakeJournal {
    fn capture(&self, brick: u16, block: u64) -> Result<()> {
        if self.aborted.load(Ordering::Relaxed) {
            return Err(Error::Io(brick));
        }
        self.captured.lock().push((brick, block));
        Ok(())
    }

    fn force_commit_all(&self) -> Result<()> {
        self.captured.lock().clear();
        Ok(())
    }

    fn is_aborted(&self) -> bool {
        self.aborted.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::{ExtentUnit, ItemKey};

    #[test]
    fn block_device_round_trips_and_tracks_free_list() {
        let dev = FakeBlockDevice::new(512, 8);
        let reserved = dev.reserve_blocks(3).unwrap();
        assert_eq!(reserved.len(), 3);

        let mut buf = alloc::vec![7u8; 512];
        dev.write_block(reserved[0], &buf).unwrap();
        let mut readback = alloc::vec![0u8; 512];
        dev.read_block(reserved[0], &mut readback).unwrap();
        assert_eq!(buf, readback);

        dev.free_blocks(&reserved).unwrap();
        buf.fill(0);
        let reclaimed = dev.reserve_blocks(3).unwrap();
        assert_eq!(reclaimed.len(), 3);
    }

    #[test]
    fn cut_range_from_spans_every_ordering_by_offset() {
        let tree = FakeTree::new();
        tree.insert_item(ExtentItem {
            key: ItemKey::body(1, 0, 0),
            units: alloc::vec![ExtentUnit::Allocated { start: 0, width: 1 }],
        })
        .unwrap();
        tree.insert_item(ExtentItem {
            key: ItemKey::body(1, 1, 4096),
            units: alloc::vec![ExtentUnit::Allocated { start: 10, width: 1 }],
        })
        .unwrap();
        tree.insert_item(ExtentItem {
            key: ItemKey::body(1, 0, 8192),
            units: alloc::vec![ExtentUnit::Allocated { start: 20, width: 1 }],
        })
        .unwrap();

        let cut_from = ItemKey::body_search(1, 4096);
        let removed = tree.cut_range_from(cut_from).unwrap();
        assert_eq!(removed.unwrap().offset, 4096);

        assert!(tree.coord_by_key(ItemKey::body(1, 0, 0), FindBias::Exact).is_some());
        assert!(tree.coord_by_key(ItemKey::body(1, 1, 4096), FindBias::Exact).is_none());
        assert!(tree.coord_by_key(ItemKey::body(1, 0, 8192), FindBias::Exact).is_none());
    }

    #[test]
    fn journal_reports_aborted() {
        let journal = FakeJournal::new();
        assert!(journal.capture(0, 1).is_ok());
        journal.set_aborted(true);
        assert!(journal.capture(0, 2).is_err());
        assert!(journal.is_aborted());
    }
}
