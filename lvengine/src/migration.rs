//! C6: migration and rebalance. Moves data between bricks to track a freshly reassigned
//! distribution table (`migrate_stripe`, `balance_volume_asym`), and the brick-reconfiguration
//! operations that reassign the table in the first place (`add_brick`, `remove_brick`,
//! `add_proxy`, `finish_rebalance`).
//!
//! A real rebalance walk holds the tree's rightmost-to-leftmost lock discipline and migrates
//! one pass, relying on longterm node locks to keep a concurrent writer from racing ahead of
//! it. This crate's tree has no lock model to lean on, so convergence is driven by repeating a
//! full pass until nothing moves — see DESIGN.md for why that's an acceptable stand-in here.

use alloc::sync::Arc;
use alloc::vec::Vec;

use uuid::Uuid;

use crate::body::{brick_io, split_units_at};
use crate::brick::{Brick, BrickFlags, BrickId};
use crate::collaborators::{BrickIo, Coord, ExtentItem, ExtentUnit, ItemKey, Journal, Tree, BODY_MINOR, UNALLOCATED_EXTENT_START};
use crate::config::{Configuration, MirrorSlot, Volume, VolumeFlags};
use crate::distribution::{calc_brick, empty_table, DistributionPlugin, DistributionTable};
use crate::error::{Error, Result};
use crate::volinfo;

/// Everything a migration/rebalance pass needs, mirroring `body::BodyCtx`.
pub struct MigrationCtx<'a> {
    pub tree: &'a dyn Tree,
    pub journal: &'a dyn Journal,
    pub plugin: &'a dyn DistributionPlugin,
    pub volume_uuid: Uuid,
    pub block_size: u64,
    pub stripe_bits: u8,
}

pub struct MigrationPlan {
    pub coord: Coord,
    pub item: ExtentItem,
    pub target: BrickId,
}

fn stripe_index_of(offset: u64, stripe_bits: u8) -> u64 {
    if stripe_bits == 0 {
        0
    } else {
        offset >> stripe_bits
    }
}

/// The brick the distribution table currently assigns to `oid`'s stripe `stripe_index`.
pub fn brick_at(
    plugin: &dyn DistributionPlugin,
    table: &DistributionTable,
    dsa: &[BrickId],
    volume_uuid: &Uuid,
    oid: u64,
    stripe_index: u64,
) -> Result<BrickId> {
    calc_brick(plugin, table, dsa, volume_uuid, oid, stripe_index, None, false, false)
}

/// If `item` spans more than one stripe, cuts it at the first stripe boundary it crosses and
/// inserts the remainder as a fresh item, so a single migration plan never has to move data
/// belonging to two different target bricks. Returns the (possibly unchanged) leading item.
fn split_at_stripe_boundary(tree: &dyn Tree, block_size: u64, stripe_bits: u8, coord: Coord, item: ExtentItem) -> Result<ExtentItem> {
    let (start, end) = item.key_range(block_size);
    if stripe_bits == 0 {
        return Ok(item);
    }
    let stripe_size = 1u64 << stripe_bits;
    let boundary = ((start / stripe_size) + 1) * stripe_size;
    if boundary >= end {
        return Ok(item);
    }

    let keep_blocks = (boundary - start) / block_size;
    let (kept, rest) = split_units_at(&item.units, keep_blocks);
    let kept_item = ExtentItem { key: item.key, units: kept };
    tree.replace_item(coord, kept_item.clone())?;
    if !rest.is_empty() {
        let rest_key = ItemKey { offset: boundary, ..item.key };
        tree.insert_item(ExtentItem { key: rest_key, units: rest })?;
    }
    Ok(kept_item)
}

/// Compares `item`'s current brick (`item.key.ordering`) against where the table says its
/// leading stripe belongs, returning a plan to move it if they disagree.
pub fn plan_for_item(ctx: &MigrationCtx, conf: &Configuration, coord: Coord, item: ExtentItem) -> Result<Option<MigrationPlan>> {
    let (start, _) = item.key_range(ctx.block_size);
    let stripe_index = stripe_index_of(start, ctx.stripe_bits);
    let dsa: Vec<BrickId> = conf.dsa_bricks().into_iter().map(|b| b.id).collect();
    let table = conf.table.as_deref().ok_or(Error::Invalid("volume has no distribution table"))?;
    let target = brick_at(ctx.plugin, table, &dsa, &ctx.volume_uuid, item.key.oid, stripe_index)?;
    if target == item.key.ordering {
        return Ok(None);
    }
    Ok(Some(MigrationPlan { coord, item, target }))
}

/// Copies one unit's data (if any) from its current brick to `target`, freeing the source
/// blocks once the copy lands. `Unallocated` units carry no data and just change brick.
fn move_unit_data(old_io: &Arc<dyn BrickIo>, new_io: &Arc<dyn BrickIo>, target: BrickId, unit: ExtentUnit, block_size: usize) -> Result<ExtentUnit> {
    match unit {
        ExtentUnit::Unallocated { width } => Ok(ExtentUnit::Unallocated { width }),
        ExtentUnit::Allocated { start, width } => {
            let new_blocks = new_io.reserve_blocks(width)?;
            if new_blocks.len() as u64 != width {
                return Err(Error::NoSpace(target));
            }
            let mut buf = alloc::vec![0u8; block_size];
            for i in 0..width {
                old_io.read_block(start + i, &mut buf)?;
                new_io.write_block(new_blocks[0] + i, &buf)?;
            }
            let freed: Vec<u64> = (start..start + width).collect();
            old_io.free_blocks(&freed)?;
            Ok(ExtentUnit::Allocated { start: new_blocks[0], width })
        }
    }
}

/// Executes a migration plan: moves every unit's data to `plan.target` and re-keys the item
/// (the brick id lives in the item's key, so this is a cut-and-reinsert, not a rename).
pub fn apply_migration(ctx: &MigrationCtx, conf: &Configuration, plan: MigrationPlan) -> Result<()> {
    let old_io = brick_io(conf, plan.item.key.ordering)?.clone();
    let new_io = brick_io(conf, plan.target)?.clone();
    let mut new_units = Vec::with_capacity(plan.item.units.len());
    for u in plan.item.units {
        new_units.push(move_unit_data(&old_io, &new_io, plan.target, u, ctx.block_size as usize)?);
    }

    ctx.tree.cut_item(plan.coord)?;
    let new_key = ItemKey {
        ordering: plan.target,
        ..plan.item.key
    };
    ctx.tree.insert_item(ExtentItem { key: new_key, units: new_units })?;
    ctx.journal.capture(plan.target, UNALLOCATED_EXTENT_START)?;
    log::debug!(
        "migration: oid={} offset={} brick {}->{}",
        plan.item.key.oid,
        plan.item.key.offset,
        plan.item.key.ordering,
        plan.target
    );
    Ok(())
}

/// Migrates every stripe of `oid` onto the brick the current table assigns it to, looping
/// until a full pass moves nothing. Returns how many items were moved.
pub fn migrate_stripe(ctx: &MigrationCtx, conf: &Configuration, oid: u64) -> Result<u32> {
    let mut moved = 0u32;
    loop {
        let mut items = ctx.tree.iter_body_items_from(ItemKey::body_search(oid, 0));
        items.retain(|(_, it)| it.key.oid == oid && it.key.item_type == BODY_MINOR);

        let mut progressed = false;
        for (coord, item) in items {
            let item = split_at_stripe_boundary(ctx.tree, ctx.block_size, ctx.stripe_bits, coord, item)?;
            if let Some(plan) = plan_for_item(ctx, conf, coord, item)? {
                apply_migration(ctx, conf, plan)?;
                moved += 1;
                progressed = true;
            }
        }
        if !progressed {
            break;
        }
    }
    Ok(moved)
}

/// Rebalances the whole volume: every body item in the tree, regardless of owning file, is
/// checked against the current table and migrated if it disagrees. Used after `add_brick`/
/// `remove_brick` reassign the ring.
pub fn balance_volume_asym(ctx: &MigrationCtx, conf: &Configuration) -> Result<u32> {
    let mut moved = 0u32;
    loop {
        let mut items = ctx.tree.iter_body_items_from(ItemKey::body(0, 0, 0));
        items.retain(|(_, it)| it.key.item_type == BODY_MINOR);

        let mut progressed = false;
        for (coord, item) in items {
            let item = split_at_stripe_boundary(ctx.tree, ctx.block_size, ctx.stripe_bits, coord, item)?;
            if let Some(plan) = plan_for_item(ctx, conf, coord, item)? {
                apply_migration(ctx, conf, plan)?;
                moved += 1;
                progressed = true;
            }
        }
        if !progressed {
            break;
        }
    }
    Ok(moved)
}

/// Writes `table` to the meta brick's volmap/voltab chain, flips `new_conf`'s `CUR` head over
/// to it, publishes, and retires the old chain. Shared by every reconfiguration op below.
fn persist_and_publish(volume: &Volume, plugin: &dyn DistributionPlugin, mut new_conf: Configuration, table: DistributionTable) -> Result<()> {
    let meta_id = volume.meta_brick_id;
    let old_head = new_conf.slot(meta_id).map(|s| s.origin().volmap_loc[0]).unwrap_or(0);

    let chain = {
        let meta = new_conf.slot(meta_id).ok_or(Error::NotFound)?.origin();
        volinfo::create(meta, &table, plugin)?
    };

    if let Some(Some(slot)) = new_conf.mslots.get_mut(meta_id as usize) {
        slot.origin_mut().volmap_loc[0] = chain.head;
    }
    new_conf.table = Some(Arc::new(table));

    let published = Arc::new(new_conf);
    volume.publish(published.clone());
    volume.set_new_conf(None);

    if old_head != 0 {
        if let Some(slot) = published.slot(meta_id) {
            let _ = volinfo::release(slot.origin(), old_head);
        }
    }
    Ok(())
}

/// Registers a freshly activated brick into the volume: appends its slot, grows the
/// distribution table (building one from scratch if the volume had none yet), and marks the
/// volume `UNBALANCED` until a rebalance walk catches the new brick up.
pub fn add_brick(volume: &Volume, plugin: &dyn DistributionPlugin, seg_bits: u8, mut new_brick: Brick) -> Result<()> {
    let _guard = volume.try_write_lock()?;
    let conf = volume.conf();
    let mut new_conf = conf.clone_for_reconfig();

    let new_id = new_conf.mslots.len() as BrickId;
    new_brick.id = new_id;
    new_brick.flags.insert(BrickFlags::HAS_DATA_ROOM);
    new_brick.flags.insert(BrickFlags::ACTIVATED);
    new_conf.mslots.push(Some(MirrorSlot {
        mirrors: alloc::vec![new_brick],
    }));

    let dsa: Vec<BrickId> = new_conf.dsa_bricks().into_iter().map(|b| b.id).collect();
    let table = match &conf.table {
        Some(t) if !t.segments.is_empty() => {
            let mut table = (**t).clone();
            plugin.inc(&mut table, &dsa, new_id);
            table
        }
        _ => plugin.build(seg_bits, &dsa),
    };

    persist_and_publish(volume, plugin, new_conf, table)?;
    volume.set_flags(VolumeFlags::UNBALANCED);
    log::info!("volume {} gained brick {new_id}, now unbalanced", volume.uuid);
    Ok(())
}

/// Stage 1 of brick removal: flags the victim `TO_BE_REMOVED`, clears its `HAS_DATA_ROOM` so
/// the allocator stops using it, reassigns its segments among the remaining DSA bricks, and
/// publishes that transitional config (old slot set, new table) right away so writes during the
/// drain already resolve through the reassigned ring. `remove_brick_tail` finalizes once the
/// victim's data has drained. Rejects a removal that would leave the volume with no
/// data-storage-area brick at all — every volume keeps at least one DSA brick, whether that's a
/// dedicated data brick or a meta brick with data room.
pub fn remove_brick(volume: &Volume, plugin: &dyn DistributionPlugin, victim: BrickId) -> Result<()> {
    let _guard = volume.try_write_lock()?;
    let conf = volume.conf();
    let victim_slot = conf.slot(victim).ok_or(Error::NotFound)?;
    let victim_in_dsa = victim_slot.origin().in_dsa();

    let remaining_dsa: Vec<BrickId> = conf
        .dsa_bricks()
        .into_iter()
        .map(|b| b.id)
        .filter(|&id| id != victim)
        .collect();

    if victim_in_dsa && remaining_dsa.is_empty() {
        log::warn!("refusing to remove brick {victim} from volume {}: would empty the DSA", volume.uuid);
        return Err(Error::Invalid("removing this brick would leave the volume with no data-storage-area brick"));
    }

    let mut new_conf = conf.clone_for_reconfig();
    if let Some(Some(slot)) = new_conf.mslots.get_mut(victim as usize) {
        slot.origin_mut().flags.insert(BrickFlags::TO_BE_REMOVED);
        slot.origin_mut().flags.remove(BrickFlags::HAS_DATA_ROOM);
    }

    let table = match &conf.table {
        Some(t) if victim_in_dsa && !t.segments.is_empty() => {
            let mut table = (**t).clone();
            plugin.dec(&mut table, &remaining_dsa, victim);
            table
        }
        Some(t) => (**t).clone(),
        None => empty_table(),
    };

    // Publish the transitional config (old slot set, new table) right away: user writes during
    // the drain must already resolve through the reassigned ring, not the stale one.
    persist_and_publish(volume, plugin, new_conf, table)?;
    volume.set_flags(VolumeFlags::UNBALANCED);
    volume.set_flags(VolumeFlags::INCOMPLETE_REMOVAL);
    log::info!("volume {} staged removal of brick {victim}", volume.uuid);
    Ok(())
}

/// Stage 2 of brick removal: verifies the victim has actually drained, drops its slot for good,
/// and publishes. Callers are expected to have already run `migrate_stripe`/
/// `balance_volume_asym` against the transitional configuration `remove_brick` published, but
/// this is the actual safety check: a victim still holding data is refused rather than evicted.
pub fn remove_brick_tail(volume: &Volume, plugin: &dyn DistributionPlugin, victim: BrickId) -> Result<()> {
    let _guard = volume.brick_removal_sem.try_write().ok_or(Error::Busy)?;
    let conf = volume.conf();
    let victim_brick = conf.slot(victim).ok_or(Error::NotFound)?.origin();
    if victim_brick.used_blocks != victim_brick.min_used_blocks {
        return Err(Error::Invalid("brick still holds data blocks; balance the volume before finishing removal"));
    }

    let mut final_conf = (*conf).clone();
    if let Some(slot) = final_conf.mslots.get_mut(victim as usize) {
        *slot = None;
    }

    let table = final_conf.table.as_deref().cloned().unwrap_or_else(empty_table);
    persist_and_publish(volume, plugin, final_conf, table)?;
    volume.clear_flags(VolumeFlags::INCOMPLETE_REMOVAL);
    log::info!("volume {} finalized removal of brick {victim}", volume.uuid);
    Ok(())
}

/// Marks `proxy` as the volume's write-absorbing proxy brick (at most one at a time).
/// Doesn't touch the distribution table: while active, `calc_brick` routes full-volume writes
/// to it directly rather than through the ring.
pub fn add_proxy(volume: &Volume, proxy: BrickId) -> Result<()> {
    let _guard = volume.try_write_lock()?;
    let conf = volume.conf();
    if conf.proxy_brick().is_some() {
        return Err(Error::Invalid("a proxy brick is already active"));
    }

    let mut new_conf = conf.clone_for_reconfig();
    new_conf.table = conf.table.clone();
    {
        let slot = new_conf
            .mslots
            .get_mut(proxy as usize)
            .and_then(|s| s.as_mut())
            .ok_or(Error::NotFound)?;
        slot.origin_mut().flags.insert(BrickFlags::IS_PROXY);
        slot.origin_mut().flags.remove(BrickFlags::HAS_DATA_ROOM);
    }

    volume.publish(Arc::new(new_conf));
    volume.set_flags(VolumeFlags::PROXY_ENABLED);
    volume.set_flags(VolumeFlags::PROXY_IO);
    Ok(())
}

/// Stops routing new full-volume writes to the proxy brick while its drain (migration back
/// onto the ring) finishes; `IS_PROXY` and `PROXY_ENABLED` stay set until `finish_rebalance`.
pub fn disable_proxy_io(volume: &Volume) -> Result<()> {
    let _guard = volume.try_write_lock()?;
    volume.clear_flags(VolumeFlags::PROXY_IO);
    Ok(())
}

/// Clears the volume's in-flight reconfiguration flags once a rebalance or proxy drain has
/// converged, dropping `IS_PROXY` from whichever brick carried it.
pub fn finish_rebalance(volume: &Volume) -> Result<()> {
    let _guard = volume.try_write_lock()?;
    let conf = volume.conf();
    if conf.proxy_brick().is_some() {
        let mut new_conf = conf.clone_for_reconfig();
        new_conf.table = conf.table.clone();
        for slot in new_conf.mslots.iter_mut().flatten() {
            slot.origin_mut().flags.remove(BrickFlags::IS_PROXY);
        }
        volume.publish(Arc::new(new_conf));
    }
    volume.clear_flags(VolumeFlags::UNBALANCED);
    volume.clear_flags(VolumeFlags::PROXY_ENABLED);
    volume.clear_flags(VolumeFlags::PROXY_IO);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::body::{write_block, BodyCtx};
    use crate::distribution::ConsistentHashRing;
    use crate::testing::{FakeBlockDevice, FakeJournal, FakeTree};

    fn brick(id: BrickId, is_meta: bool) -> Brick {
        Brick {
            id,
            subvol_id: id,
            uuid: Uuid::from_u128(id as u128 + 1),
            volume_uuid: Uuid::nil(),
            io: Arc::new(FakeBlockDevice::new(512, 10_000)),
            capacity_blocks: 10_000,
            free_blocks: 10_000,
            used_blocks: 0,
            min_used_blocks: 0,
            mirror_id: 0,
            num_replicas: 0,
            format_plugin_id: 0,
            distribution_plugin_id: 0,
            stripe_bits: 12,
            is_meta,
            flags: BrickFlags::HAS_DATA_ROOM,
            volmap_loc: [0, 0],
        }
    }

    fn two_brick_conf(seg_bits: u8) -> Configuration {
        let plugin = ConsistentHashRing;
        let table = plugin.build(seg_bits, &[0, 1]);
        Configuration {
            mslots: alloc::vec![
                Some(MirrorSlot { mirrors: alloc::vec![brick(0, true)] }),
                Some(MirrorSlot { mirrors: alloc::vec![brick(1, false)] }),
            ],
            table: Some(Arc::new(table)),
        }
    }

    #[test]
    fn migrate_stripe_moves_misplaced_item_and_preserves_data() {
        let tree = FakeTree::new();
        let journal = FakeJournal::new();
        let plugin = ConsistentHashRing;
        let conf = two_brick_conf(4);

        let body_ctx = BodyCtx {
            tree: &tree,
            journal: &journal,
            plugin: &plugin,
            conf: &conf,
            volume_uuid: Uuid::nil(),
            block_size: 512,
            stripe_bits: 12,
            oid: 1,
            proxy_io: false,
        };
        let out = write_block(&body_ctx, None, 0, false).unwrap();
        let correct_brick = out.brick;
        crate::body::flush_body(&body_ctx).unwrap();

        // Force the item onto the brick the table does *not* assign it to, simulating a stale
        // placement from before a table reassignment.
        let wrong_brick: BrickId = if correct_brick == 0 { 1 } else { 0 };
        let items = tree.iter_body_items_from(ItemKey::body_search(1, 0));
        let (coord, item) = items[0].clone();
        tree.cut_item(coord).unwrap();
        let mut misplaced = item.clone();
        misplaced.key.ordering = wrong_brick;
        tree.insert_item(misplaced).unwrap();

        let mig_ctx = MigrationCtx {
            tree: &tree,
            journal: &journal,
            plugin: &plugin,
            volume_uuid: Uuid::nil(),
            block_size: 512,
            stripe_bits: 12,
        };
        let moved = migrate_stripe(&mig_ctx, &conf, 1).unwrap();
        assert_eq!(moved, 1);

        let items = tree.iter_body_items_from(ItemKey::body_search(1, 0));
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].1.key.ordering, correct_brick);
    }

    #[test]
    fn remove_brick_rejects_when_it_would_empty_the_dsa() {
        let volume = Volume::new(Uuid::nil(), 12, 0, 0);
        let mut conf = two_brick_conf(4);
        // Strip the meta brick's data room so brick 1 is the volume's only DSA member.
        conf.mslots[0].as_mut().unwrap().origin_mut().flags.remove(BrickFlags::HAS_DATA_ROOM);
        volume.publish(Arc::new(conf));

        let plugin = ConsistentHashRing;
        let err = remove_brick(&volume, &plugin, 1).unwrap_err();
        assert_eq!(err, Error::Invalid("removing this brick would leave the volume with no data-storage-area brick"));
    }

    #[test]
    fn remove_brick_allowed_when_meta_shares_the_dsa() {
        let volume = Volume::new(Uuid::nil(), 12, 0, 0);
        volume.publish(Arc::new(two_brick_conf(4)));

        let plugin = ConsistentHashRing;
        // Meta (brick 0) keeps HAS_DATA_ROOM here, so removing the last dedicated data brick
        // still leaves a non-empty DSA.
        remove_brick(&volume, &plugin, 1).unwrap();
        assert!(volume.flags().contains(VolumeFlags::INCOMPLETE_REMOVAL));
        assert!(volume.flags().contains(VolumeFlags::UNBALANCED));

        // The transitional config is published immediately: the victim is still present but
        // flagged out of the DSA, not merely stashed pending a later publish.
        let conf = volume.conf();
        let victim = conf.slot(1).unwrap().origin();
        assert!(victim.flags.contains(BrickFlags::TO_BE_REMOVED));
        assert!(!victim.flags.contains(BrickFlags::HAS_DATA_ROOM));
    }

    #[test]
    fn add_proxy_rejects_a_second_concurrent_proxy() {
        let volume = Volume::new(Uuid::nil(), 12, 0, 0);
        volume.publish(Arc::new(two_brick_conf(4)));

        add_proxy(&volume, 0).unwrap();
        assert!(volume.conf().proxy_brick().is_some());
        assert!(volume.flags().contains(VolumeFlags::PROXY_IO));

        let err = add_proxy(&volume, 1).unwrap_err();
        assert_eq!(err, Error::Invalid("a proxy brick is already active"));

        disable_proxy_io(&volume).unwrap();
        assert!(!volume.flags().contains(VolumeFlags::PROXY_IO));
        finish_rebalance(&volume).unwrap();
        assert!(volume.conf().proxy_brick().is_none());
    }
}
