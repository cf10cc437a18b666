//! C5: the striped-file body manager. Translates `(oid, offset)` into extent-pointer items,
//! merging newly-written blocks into existing items whenever they land on the same brick and
//! are physically contiguous, and splitting them back apart on truncate.
//!
//! Blocks here stay in the `Unallocated` state (a pending width, not a real address) until
//! [`flush_body`] resolves them — the crate has no real journal/flush machinery to defer to
//! (that's explicitly an external collaborator, see `collaborators.rs`), so `flush_body`
//! stands in for "the atom commits and the journal assigns real addresses". See DESIGN.md for
//! why write placement itself happens synchronously rather than through that deferred path.

use alloc::vec::Vec;

use uuid::Uuid;

use crate::brick::BrickId;
use crate::collaborators::{
    BrickIo, Coord, ExtentItem, ExtentUnit, ItemKey, Journal, Tree, BODY_MINOR, UNALLOCATED_EXTENT_START,
};
use crate::config::Configuration;
use crate::distribution::{calc_brick, DistributionPlugin};
use crate::error::{Error, Result};
use crate::treewalk::{find_stripe_item, seal, Hint, HintMode};

/// Everything a body operation needs about the file and the volume it lives on, passed
/// explicitly rather than reached for through ambient state.
pub struct BodyCtx<'a> {
    pub tree: &'a dyn Tree,
    pub journal: &'a dyn Journal,
    pub plugin: &'a dyn DistributionPlugin,
    pub conf: &'a Configuration,
    pub volume_uuid: Uuid,
    pub block_size: u64,
    pub stripe_bits: u8,
    pub oid: u64,
    /// Mirrors `Volume`'s `PROXY_IO` flag; passed in rather than read off `Volume` directly so
    /// this module never needs to know about `Volume`'s locking.
    pub proxy_io: bool,
}

pub struct WriteOutcome {
    pub hint: Hint,
    pub brick: BrickId,
    pub newly_allocated: bool,
}

pub struct TruncateOutcome {
    /// True when `new_size` falls inside a block whose blocks before it survive the cut; the
    /// caller must zero `[new_size % block_size, block_size)` of that block and rewrite it
    /// through the regular write path.
    pub tail_dirty: bool,
}

fn round_up(value: u64, unit: u64) -> u64 {
    value.div_ceil(unit) * unit
}

pub(crate) fn brick_io<'a>(conf: &'a Configuration, id: BrickId) -> Result<&'a alloc::sync::Arc<dyn BrickIo>> {
    Ok(&conf.slot(id).ok_or(Error::NotFound)?.origin().io)
}

/// Appends `new` to `units`, coalescing with the last unit when both are `Unallocated` so a
/// run of sequential writes on one brick stays a single dense unit.
fn append_unit(units: &mut Vec<ExtentUnit>, new: ExtentUnit) {
    if let (Some(ExtentUnit::Unallocated { width }), ExtentUnit::Unallocated { width: new_width }) =
        (units.last_mut(), &new)
    {
        *width += *new_width;
        return;
    }
    units.push(new);
}

/// Resolves the target brick for a block that landed outside any existing item: an existing
/// unit at this offset always wins (the brick is already decided), otherwise the distribution
/// plugin decides, honouring proxy precedence.
fn locate_reserve_data(ctx: &BodyCtx, offset: u64, contiguous_brick: Option<BrickId>, proxy_full: bool) -> Result<BrickId> {
    if let Some(b) = contiguous_brick {
        return Ok(b);
    }
    let dsa: Vec<BrickId> = ctx.conf.dsa_bricks().iter().map(|b| b.id).collect();
    let table = ctx.conf.table.as_deref().ok_or(Error::Invalid("volume has no distribution table"))?;
    let stripe_index = if ctx.stripe_bits == 0 { 0 } else { offset >> ctx.stripe_bits };
    calc_brick(
        ctx.plugin,
        table,
        &dsa,
        &ctx.volume_uuid,
        ctx.oid,
        stripe_index,
        ctx.conf.proxy_brick().map(|b| b.id),
        ctx.proxy_io,
        proxy_full,
    )
}

/// If `item`'s right neighbour continues it on the same brick with no gap, merge it in and
/// drop the neighbour item, returning the merged item at `coord`.
fn merge_right_if_contiguous(ctx: &BodyCtx, coord: Coord, mut item: ExtentItem) -> Result<(Coord, ExtentItem)> {
    let (_, end) = item.key_range(ctx.block_size);
    if let Some((right_coord, right_item)) = ctx.tree.right_neighbor(coord) {
        if right_item.key.ordering == item.key.ordering && right_item.key.offset == end {
            for u in right_item.units {
                append_unit(&mut item.units, u);
            }
            ctx.tree.cut_item(right_coord)?;
            ctx.tree.replace_item(coord, item.clone())?;
            return Ok((coord, item));
        }
    }
    Ok((coord, item))
}

fn unit_block_number(item: &ExtentItem, block_size: u64, offset: u64) -> Result<(BrickId, Option<u64>)> {
    let mut cursor = item.key.offset;
    for u in &item.units {
        let bytes = u.width() * block_size;
        if offset < cursor + bytes {
            let within = (offset - cursor) / block_size;
            return Ok((
                item.key.ordering,
                match u {
                    ExtentUnit::Allocated { start, .. } => Some(start + within),
                    ExtentUnit::Unallocated { .. } => None,
                },
            ));
        }
        cursor += bytes;
    }
    Err(Error::Corrupt("offset claimed to fall inside an item with no covering unit"))
}

/// Writes one block at `block_index` (a page, in traditional terms): find-or-place the
/// covering item, reuse an existing unit, widen the left neighbour in place, or insert a
/// fresh single-unit item and merge right.
pub fn write_block(ctx: &BodyCtx, hint: Option<Hint>, block_index: u64, proxy_full: bool) -> Result<WriteOutcome> {
    let offset = block_index * ctx.block_size;
    let search_key = ItemKey::body_search(ctx.oid, offset);
    let found = find_stripe_item(ctx.tree, hint.as_ref(), search_key, HintMode::Write, ctx.block_size);

    if let Some(f) = &found {
        let (start, end) = f.item.key_range(ctx.block_size);
        if offset >= start && offset < end {
            // Already covered by an item (possibly still pending): no tree mutation needed,
            // just (re)capture the backing jnode.
            let brick = f.item.key.ordering;
            ctx.journal.capture(brick, UNALLOCATED_EXTENT_START)?;
            let new_hint = seal(f.coord, f.item.key, HintMode::Write);
            log::debug!("body: rewrite oid={} offset={} brick={}", ctx.oid, offset, brick);
            return Ok(WriteOutcome {
                hint: new_hint,
                brick,
                newly_allocated: false,
            });
        }
    }

    let contiguous_brick = found.as_ref().and_then(|f| {
        let (_, end) = f.item.key_range(ctx.block_size);
        (end == offset).then_some(f.item.key.ordering)
    });
    let brick = locate_reserve_data(ctx, offset, contiguous_brick, proxy_full)?;

    // Widen-left: the item immediately to the left ends exactly here, on the same brick, so
    // grow it in place instead of minting a new item.
    if let Some(f) = &found {
        let (_, end) = f.item.key_range(ctx.block_size);
        if end == offset && f.item.key.ordering == brick {
            let mut item = f.item.clone();
            append_unit(&mut item.units, ExtentUnit::Unallocated { width: 1 });
            ctx.tree.replace_item(f.coord, item.clone())?;
            let (coord, item) = merge_right_if_contiguous(ctx, f.coord, item)?;
            ctx.journal.capture(brick, UNALLOCATED_EXTENT_START)?;
            let new_hint = seal(coord, item.key, HintMode::Write);
            log::debug!("body: widen oid={} offset={} brick={}", ctx.oid, offset, brick);
            return Ok(WriteOutcome {
                hint: new_hint,
                brick,
                newly_allocated: true,
            });
        }
    }

    // Otherwise: a fresh single-unit item, then a rightward merge if the next item picks up
    // exactly where this one ends.
    let key = ItemKey::body(ctx.oid, brick, offset);
    let item = ExtentItem {
        key,
        units: alloc::vec![ExtentUnit::Unallocated { width: 1 }],
    };
    let coord = ctx.tree.insert_item(item.clone())?;
    let (coord, item) = merge_right_if_contiguous(ctx, coord, item)?;
    ctx.journal.capture(brick, UNALLOCATED_EXTENT_START)?;
    let new_hint = seal(coord, item.key, HintMode::Write);
    log::debug!("body: insert oid={} offset={} brick={}", ctx.oid, offset, brick);
    Ok(WriteOutcome {
        hint: new_hint,
        brick,
        newly_allocated: true,
    })
}

/// Resolves a read: `None` means a hole (caller zero-fills); `Some((brick, None))` means the
/// block is covered but still pending allocation; `Some((brick, Some(addr)))` is a resolved
/// physical block.
pub fn read_block(ctx: &BodyCtx, hint: Option<&Hint>, block_index: u64) -> Result<Option<(BrickId, Option<u64>)>> {
    let offset = block_index * ctx.block_size;
    let key = ItemKey::body_search(ctx.oid, offset);
    match find_stripe_item(ctx.tree, hint, key, HintMode::Read, ctx.block_size) {
        None => Ok(None),
        Some(f) => {
            let (start, end) = f.item.key_range(ctx.block_size);
            if offset < start || offset >= end {
                return Ok(None);
            }
            unit_block_number(&f.item, ctx.block_size, offset).map(Some)
        }
    }
}

/// Resolves every pending (`Unallocated`) unit belonging to `ctx.oid` to a real block address
/// by reserving space on its owning brick, standing in for "the atom commits". Returns how
/// many units were settled.
pub fn flush_body(ctx: &BodyCtx) -> Result<u32> {
    let mut settled = 0u32;
    let items = ctx.tree.iter_body_items_from(ItemKey::body_search(ctx.oid, 0));
    for (coord, item) in items {
        if item.key.oid != ctx.oid || item.key.item_type != BODY_MINOR {
            continue;
        }
        if !item.units.iter().any(|u| matches!(u, ExtentUnit::Unallocated { .. })) {
            continue;
        }
        let io = brick_io(ctx.conf, item.key.ordering)?;
        let mut new_units = Vec::with_capacity(item.units.len());
        for u in item.units {
            match u {
                ExtentUnit::Allocated { .. } => new_units.push(u),
                ExtentUnit::Unallocated { width } => {
                    let blocks = io.reserve_blocks(width)?;
                    if blocks.len() as u64 != width {
                        return Err(Error::NoSpace(item.key.ordering));
                    }
                    // `FakeBlockDevice`'s free list starts as a contiguous run, so a fresh
                    // reservation is contiguous too; a real allocator guarantees as much for
                    // a single reservation call.
                    new_units.push(ExtentUnit::Allocated { start: blocks[0], width });
                    settled += 1;
                }
            }
        }
        ctx.tree.replace_item(
            coord,
            ExtentItem {
                key: item.key,
                units: new_units,
            },
        )?;
    }
    Ok(settled)
}

/// Splits a dense unit run at `keep_blocks` blocks from its start, returning `(kept, rest)`.
pub(crate) fn split_units_at(units: &[ExtentUnit], keep_blocks: u64) -> (Vec<ExtentUnit>, Vec<ExtentUnit>) {
    let mut kept = Vec::new();
    let mut rest = Vec::new();
    let mut seen = 0u64;
    for &u in units {
        let w = u.width();
        if seen >= keep_blocks {
            rest.push(u);
        } else if seen + w <= keep_blocks {
            kept.push(u);
        } else {
            let keep_here = keep_blocks - seen;
            let rest_here = w - keep_here;
            match u {
                ExtentUnit::Allocated { start, .. } => {
                    if keep_here > 0 {
                        kept.push(ExtentUnit::Allocated { start, width: keep_here });
                    }
                    if rest_here > 0 {
                        rest.push(ExtentUnit::Allocated {
                            start: start + keep_here,
                            width: rest_here,
                        });
                    }
                }
                ExtentUnit::Unallocated { .. } => {
                    if keep_here > 0 {
                        kept.push(ExtentUnit::Unallocated { width: keep_here });
                    }
                    if rest_here > 0 {
                        rest.push(ExtentUnit::Unallocated { width: rest_here });
                    }
                }
            }
        }
        seen += w;
    }
    (kept, rest)
}

fn free_units(conf: &Configuration, brick: BrickId, units: &[ExtentUnit]) -> Result<()> {
    let io = brick_io(conf, brick)?;
    let blocks: Vec<u64> = units
        .iter()
        .filter_map(|u| match u {
            ExtentUnit::Allocated { start, width } => Some((*start..*start + *width)),
            ExtentUnit::Unallocated { .. } => None,
        })
        .flatten()
        .collect();
    if blocks.is_empty() {
        return Ok(());
    }
    io.free_blocks(&blocks)
}

/// Shortens the file to `new_size`. Cuts every item that starts at or past the containing
/// block boundary, trims the item straddling it (freeing the blocks past the boundary), and
/// reports whether the caller must zero and rewrite a trailing partial block.
pub fn truncate(ctx: &BodyCtx, new_size: u64) -> Result<TruncateOutcome> {
    let boundary = round_up(new_size, ctx.block_size);
    let mut items = ctx.tree.iter_body_items_from(ItemKey::body_search(ctx.oid, 0));
    items.retain(|(_, it)| it.key.oid == ctx.oid && it.key.item_type == BODY_MINOR);

    let mut tail_dirty = false;
    for (coord, item) in items {
        let (start, end) = item.key_range(ctx.block_size);
        if start >= boundary {
            free_units(ctx.conf, item.key.ordering, &item.units)?;
            ctx.tree.cut_item(coord)?;
        } else if end > boundary {
            let keep_blocks = (boundary - start) / ctx.block_size;
            let (kept, freed) = split_units_at(&item.units, keep_blocks);
            free_units(ctx.conf, item.key.ordering, &freed)?;
            if kept.is_empty() {
                ctx.tree.cut_item(coord)?;
            } else {
                ctx.tree.replace_item(
                    coord,
                    ExtentItem {
                        key: item.key,
                        units: kept,
                    },
                )?;
            }
            if new_size % ctx.block_size != 0 && end > new_size {
                tail_dirty = true;
            }
        }
    }
    Ok(TruncateOutcome { tail_dirty })
}

/// The block index whose tail needs zeroing after a non-block-aligned truncate.
pub fn tail_block_index(new_size: u64, block_size: u64) -> u64 {
    new_size / block_size
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::brick::{Brick, BrickFlags};
    use crate::config::{Configuration, MirrorSlot};
    use crate::distribution::ConsistentHashRing;
    use crate::testing::{FakeBlockDevice, FakeJournal, FakeTree};
    use alloc::sync::Arc;

    fn brick(id: BrickId) -> Brick {
        Brick {
            id,
            subvol_id: id,
            uuid: Uuid::from_u128(id as u128 + 1),
            volume_uuid: Uuid::nil(),
            io: Arc::new(FakeBlockDevice::new(4096, 100_000)),
            capacity_blocks: 100_000,
            free_blocks: 100_000,
            used_blocks: 0,
            min_used_blocks: 0,
            mirror_id: 0,
            num_replicas: 0,
            format_plugin_id: 0,
            distribution_plugin_id: 0,
            stripe_bits: 20,
            is_meta: id == 0,
            flags: BrickFlags::HAS_DATA_ROOM,
            volmap_loc: [0, 0],
        }
    }

    fn single_brick_conf() -> Configuration {
        let plugin = ConsistentHashRing;
        let table = plugin.build(4, &[0]);
        Configuration {
            mslots: alloc::vec![Some(MirrorSlot {
                mirrors: alloc::vec![brick(0)],
            })],
            table: Some(Arc::new(table)),
        }
    }

    #[test]
    fn sequential_writes_merge_into_one_item_then_flush_allocates() {
        let tree = FakeTree::new();
        let journal = FakeJournal::new();
        let plugin = ConsistentHashRing;
        let conf = single_brick_conf();
        let ctx = BodyCtx {
            tree: &tree,
            journal: &journal,
            plugin: &plugin,
            conf: &conf,
            volume_uuid: Uuid::nil(),
            block_size: 4096,
            stripe_bits: 20,
            oid: 7,
            proxy_io: false,
        };

        let mut hint = None;
        for i in 0..192u64 {
            let out = write_block(&ctx, hint.take(), i, false).unwrap();
            assert_eq!(out.brick, 0);
            hint = Some(out.hint);
        }

        let items = tree.iter_body_items_from(ItemKey::body_search(7, 0));
        assert_eq!(items.len(), 1, "sequential same-brick writes should merge into one item");
        assert_eq!(items[0].1.units.iter().map(|u| u.width()).sum::<u64>(), 192);

        let settled = flush_body(&ctx).unwrap();
        assert_eq!(settled, 1);
        let items = tree.iter_body_items_from(ItemKey::body_search(7, 0));
        assert!(matches!(items[0].1.units[0], ExtentUnit::Allocated { width: 192, .. }));
    }

    #[test]
    fn readpage_reports_hole_for_unwritten_offset() {
        let tree = FakeTree::new();
        let journal = FakeJournal::new();
        let plugin = ConsistentHashRing;
        let conf = single_brick_conf();
        let ctx = BodyCtx {
            tree: &tree,
            journal: &journal,
            plugin: &plugin,
            conf: &conf,
            volume_uuid: Uuid::nil(),
            block_size: 4096,
            stripe_bits: 20,
            oid: 1,
            proxy_io: false,
        };
        assert!(read_block(&ctx, None, 0).unwrap().is_none());
        write_block(&ctx, None, 0, false).unwrap();
        assert!(read_block(&ctx, None, 0).unwrap().is_some());
        assert!(read_block(&ctx, None, 5).unwrap().is_none());
    }

    #[test]
    fn truncate_straddling_block_frees_tail_and_flags_dirty_tail() {
        let tree = FakeTree::new();
        let journal = FakeJournal::new();
        let plugin = ConsistentHashRing;
        let conf = single_brick_conf();
        let ctx = BodyCtx {
            tree: &tree,
            journal: &journal,
            plugin: &plugin,
            conf: &conf,
            volume_uuid: Uuid::nil(),
            block_size: 4096,
            stripe_bits: 20,
            oid: 3,
            proxy_io: false,
        };
        let mut hint = None;
        for i in 0..4u64 {
            let out = write_block(&ctx, hint.take(), i, false).unwrap();
            hint = Some(out.hint);
        }
        flush_body(&ctx).unwrap();

        let outcome = truncate(&ctx, 4097).unwrap();
        assert!(outcome.tail_dirty);
        assert_eq!(tail_block_index(4097, 4096), 1);

        let items = tree.iter_body_items_from(ItemKey::body_search(3, 0));
        assert_eq!(items[0].1.units.iter().map(|u| u.width()).sum::<u64>(), 2);
    }

    #[test]
    fn truncate_whole_items_past_boundary_are_removed() {
        let tree = FakeTree::new();
        let journal = FakeJournal::new();
        let plugin = ConsistentHashRing;
        let conf = single_brick_conf();
        let ctx = BodyCtx {
            tree: &tree,
            journal: &journal,
            plugin: &plugin,
            conf: &conf,
            volume_uuid: Uuid::nil(),
            block_size: 4096,
            stripe_bits: 20,
            oid: 4,
            proxy_io: false,
        };
        let mut hint = None;
        for i in 0..8u64 {
            let out = write_block(&ctx, hint.take(), i, false).unwrap();
            hint = Some(out.hint);
        }
        flush_body(&ctx).unwrap();

        let outcome = truncate(&ctx, 4096 * 4).unwrap();
        assert!(!outcome.tail_dirty);
        let items = tree.iter_body_items_from(ItemKey::body_search(4, 0));
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].1.units.iter().map(|u| u.width()).sum::<u64>(), 4);
    }
}
