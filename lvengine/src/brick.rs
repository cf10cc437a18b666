//! C1: brick discovery and registration.
//!
//! A brick is scanned from its master superblock, grouped with its volume siblings by volume
//! UUID, and held here until the configuration store (`config.rs`) activates it in the order
//! the volume's topology demands.

use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use alloc::vec::Vec;

use dvida_serialize::{DvDeSer, DvDeserialize};
use uuid::Uuid;

use crate::collaborators::BrickIo;
use crate::distribution::plugin_by_id;
use crate::error::{Error, Result};

/// A brick's position in its volume's live slot table. Unassigned until activation.
pub type BrickId = u16;

pub const UNASSIGNED_BRICK_ID: BrickId = BrickId::MAX;

pub const MASTER_SB_MAGIC: [u8; 8] = *b"ReIsEr4\0";
pub const MASTER_SB_BLOCK: u64 = 0;

/// Smallest legal `stripe_bits`: below the page size, a stripe would split a single page
/// across bricks, which the body manager's page-granularity write path cannot represent.
pub const PAGE_SHIFT: u8 = 12;

/// The fixed-layout superblock every brick carries, read before the brick can be grouped
/// into a volume. Field order is the on-disk order (`DvDeSer` packs/unpacks declaration order).
#[derive(DvDeSer, Debug, Clone, Copy)]
pub struct MasterSuperblock {
    pub magic: [u8; 8],
    pub volume_uuid: [u8; 16],
    pub brick_uuid: [u8; 16],
    pub format_plugin_id: u8,
    pub volume_plugin_id: u8,
    pub distribution_plugin_id: u8,
    pub mirror_id: u16,
    pub num_replicas: u16,
    pub stripe_bits: u8,
    pub subvol_id: u16,
}

impl MasterSuperblock {
    pub fn parse(buf: &[u8]) -> Result<Self> {
        let (sb, _) = MasterSuperblock::deserialize(dvida_serialize::Endianness::Little, buf)?;
        if sb.magic != MASTER_SB_MAGIC {
            return Err(Error::Corrupt("bad master superblock magic"));
        }
        Ok(sb)
    }
}

/// Flags carried on a registered brick. Hand-rolled rather than pulled from a bitflags-style
/// crate: the set is small and fixed, and plain `u32` masks keep the on-disk representation
/// (the flags word in the volume superblock, see `config.rs`) and the in-memory one identical.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BrickFlags(pub u32);

impl BrickFlags {
    pub const ACTIVATED: Self = Self(1 << 0);
    pub const HAS_DATA_ROOM: Self = Self(1 << 1);
    pub const IS_PROXY: Self = Self(1 << 2);
    pub const IS_ORPHAN: Self = Self(1 << 3);
    pub const TO_BE_REMOVED: Self = Self(1 << 4);
    pub const IN_MIGRATION: Self = Self(1 << 5);
    pub const IS_NONROT_DEVICE: Self = Self(1 << 6);

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

impl core::ops::BitOr for BrickFlags {
    type Output = Self;
    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

/// Which role a brick plays in its mirror group; used to derive activation order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BrickRole {
    MetaOrigin,
    MetaReplica,
    DataOrigin,
    DataReplica,
}

/// A single registered brick. Metadata-only (`volmap_loc`) fields are meaningless on data
/// bricks and left zeroed there.
#[derive(Clone)]
pub struct Brick {
    pub id: BrickId,
    /// The on-disk `subvol_id` from the master superblock: shared by an origin and its
    /// replicas, and used to assign `id` (the live slot index) at activation. Always 0 for
    /// metadata-brick mirrors.
    pub subvol_id: u16,
    pub uuid: Uuid,
    pub volume_uuid: Uuid,
    pub io: Arc<dyn BrickIo>,
    pub capacity_blocks: u64,
    pub free_blocks: u64,
    pub used_blocks: u64,
    pub min_used_blocks: u64,
    pub mirror_id: u16,
    pub num_replicas: u16,
    pub format_plugin_id: u8,
    pub distribution_plugin_id: u8,
    pub stripe_bits: u8,
    pub is_meta: bool,
    pub flags: BrickFlags,
    /// `[CUR, NEW]` volmap chain heads; only meaningful when `is_meta`.
    pub volmap_loc: [u64; 2],
}

impl Brick {
    pub fn role(&self) -> BrickRole {
        match (self.is_meta, self.mirror_id) {
            (true, 0) => BrickRole::MetaOrigin,
            (true, _) => BrickRole::MetaReplica,
            (false, 0) => BrickRole::DataOrigin,
            (false, _) => BrickRole::DataReplica,
        }
    }

    pub fn in_dsa(&self) -> bool {
        self.flags.contains(BrickFlags::HAS_DATA_ROOM) && !self.flags.contains(BrickFlags::IS_PROXY)
    }
}

/// All bricks scanned so far that share a volume UUID, not yet activated into a
/// [`crate::config::Configuration`].
pub struct RegisteredVolume {
    pub volume_uuid: Uuid,
    pub volume_plugin_id: u8,
    pub distribution_plugin_id: u8,
    pub stripe_bits: u8,
    pub bricks: Vec<Brick>,
}

pub enum ScanOutcome {
    Registered,
    AlreadyRegistered,
}

/// Context-wide table of volumes discovered but not yet (fully) activated. Held behind a
/// single coarse lock, uncontended outside registration/activation; this is the outermost
/// lock in the engine's acquisition order.
pub struct BrickRegistry {
    inner: spin::Mutex<BTreeMap<Uuid, RegisteredVolume>>,
}

impl Default for BrickRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl BrickRegistry {
    pub fn new() -> Self {
        Self {
            inner: spin::Mutex::new(BTreeMap::new()),
        }
    }

    /// Read `io`'s master superblock and group it with its volume. Returns
    /// [`ScanOutcome::AlreadyRegistered`] (not an error) if this exact brick uuid is already
    /// known for its volume.
    pub fn scan(&self, io: Arc<dyn BrickIo>, sb: MasterSuperblock) -> Result<ScanOutcome> {
        let volume_uuid = Uuid::from_bytes(sb.volume_uuid);
        let brick_uuid = Uuid::from_bytes(sb.brick_uuid);

        let mut table = self.inner.lock();
        let entry = table.entry(volume_uuid).or_insert_with(|| RegisteredVolume {
            volume_uuid,
            volume_plugin_id: sb.volume_plugin_id,
            distribution_plugin_id: sb.distribution_plugin_id,
            stripe_bits: sb.stripe_bits,
            bricks: Vec::new(),
        });

        if entry.volume_plugin_id != sb.volume_plugin_id
            || entry.distribution_plugin_id != sb.distribution_plugin_id
            || entry.stripe_bits != sb.stripe_bits
        {
            log::warn!("brick {brick_uuid} rejected: disagrees with volume {volume_uuid}");
            return Err(Error::ParameterMismatch(
                "brick disagrees with its volume's already-registered parameters",
            ));
        }

        if entry.bricks.iter().any(|b| b.uuid == brick_uuid) {
            return Ok(ScanOutcome::AlreadyRegistered);
        }

        if sb.mirror_id > sb.num_replicas {
            return Err(Error::Invalid("mirror_id exceeds num_replicas"));
        }
        if sb.stripe_bits != 0 && !(PAGE_SHIFT..=63).contains(&sb.stripe_bits) {
            return Err(Error::Invalid("stripe_bits outside [page-shift, 63] and not 0"));
        }
        plugin_by_id(sb.distribution_plugin_id)?;

        log::debug!("scanned brick {brick_uuid} into volume {volume_uuid} (subvol {})", sb.subvol_id);

        let is_meta = sb.subvol_id == 0;
        entry.bricks.push(Brick {
            id: UNASSIGNED_BRICK_ID,
            subvol_id: sb.subvol_id,
            uuid: brick_uuid,
            volume_uuid,
            io,
            capacity_blocks: 0,
            free_blocks: 0,
            used_blocks: 0,
            min_used_blocks: 0,
            mirror_id: sb.mirror_id,
            num_replicas: sb.num_replicas,
            format_plugin_id: sb.format_plugin_id,
            distribution_plugin_id: sb.distribution_plugin_id,
            stripe_bits: sb.stripe_bits,
            is_meta,
            flags: BrickFlags::HAS_DATA_ROOM,
            volmap_loc: [0, 0],
        });

        Ok(ScanOutcome::Registered)
    }

    pub fn unregister(&self, volume_uuid: Uuid, brick_uuid: Uuid) -> Result<()> {
        let mut table = self.inner.lock();
        let volume = table.get_mut(&volume_uuid).ok_or(Error::NotFound)?;
        let idx = volume
            .bricks
            .iter()
            .position(|b| b.uuid == brick_uuid)
            .ok_or(Error::NotFound)?;
        if volume.bricks[idx].flags.contains(BrickFlags::ACTIVATED) {
            return Err(Error::StillActivated);
        }
        volume.bricks.remove(idx);
        if volume.bricks.is_empty() {
            table.remove(&volume_uuid);
        }
        Ok(())
    }

    pub fn unregister_all(&self, volume_uuid: Uuid) -> Result<()> {
        let mut table = self.inner.lock();
        let volume = table.get(&volume_uuid).ok_or(Error::NotFound)?;
        if volume.bricks.iter().any(|b| b.flags.contains(BrickFlags::ACTIVATED)) {
            return Err(Error::StillActivated);
        }
        table.remove(&volume_uuid);
        Ok(())
    }

    /// Remove and return the registered brick set for a volume, for the configuration store to
    /// consume during activation. Leaves the registry without that volume.
    pub fn take(&self, volume_uuid: Uuid) -> Option<RegisteredVolume> {
        self.inner.lock().remove(&volume_uuid)
    }

    pub fn volume_uuids(&self) -> Vec<Uuid> {
        self.inner.lock().keys().copied().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeBlockDevice;

    fn sb(volume_uuid: [u8; 16], brick_uuid: [u8; 16], subvol_id: u16) -> MasterSuperblock {
        MasterSuperblock {
            magic: MASTER_SB_MAGIC,
            volume_uuid,
            brick_uuid,
            format_plugin_id: 0,
            volume_plugin_id: 0,
            distribution_plugin_id: 0,
            mirror_id: 0,
            num_replicas: 0,
            stripe_bits: 20,
            subvol_id,
        }
    }

    #[test]
    fn scan_groups_by_volume_and_dedupes() {
        let reg = BrickRegistry::new();
        let dev: Arc<dyn BrickIo> = Arc::new(FakeBlockDevice::new(4096, 1024));
        let vol = [1u8; 16];

        let outcome = reg.scan(dev.clone(), sb(vol, [2u8; 16], 0)).unwrap();
        assert!(matches!(outcome, ScanOutcome::Registered));

        let outcome = reg.scan(dev.clone(), sb(vol, [2u8; 16], 0)).unwrap();
        assert!(matches!(outcome, ScanOutcome::AlreadyRegistered));

        let outcome = reg.scan(dev, sb(vol, [3u8; 16], 1)).unwrap();
        assert!(matches!(outcome, ScanOutcome::Registered));

        let taken = reg.take(Uuid::from_bytes(vol)).unwrap();
        assert_eq!(taken.bricks.len(), 2);
    }

    #[test]
    fn scan_rejects_parameter_mismatch() {
        let reg = BrickRegistry::new();
        let dev: Arc<dyn BrickIo> = Arc::new(FakeBlockDevice::new(4096, 1024));
        let vol = [9u8; 16];
        reg.scan(dev.clone(), sb(vol, [1u8; 16], 0)).unwrap();

        let mut mismatched = sb(vol, [2u8; 16], 0);
        mismatched.stripe_bits = 12;
        let err = reg.scan(dev, mismatched).unwrap_err();
        assert!(matches!(err, Error::ParameterMismatch(_)));
    }
}
