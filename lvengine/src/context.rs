//! The engine-wide context every public operation takes explicitly, in place of process-global
//! tables (a volume registry, a cursor shrinker, a cid counter): no `static`/`lazy_static`/
//! thread-local state lives anywhere in this crate.

use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU32, Ordering};

use smart_default::SmartDefault;
use uuid::Uuid;

use crate::brick::BrickRegistry;
use crate::config::Volume;
use crate::error::{Error, Result};
use crate::readdir::CursorPool;

/// Tunables that would otherwise be bare constants; gathered here so an embedder can size them
/// per deployment instead of recompiling.
#[derive(Debug, Clone, Copy, SmartDefault)]
pub struct EngineConfig {
    /// `stripe_bits` used when formatting a freshly created volume (1 MiB stripes).
    #[default = 20]
    pub default_stripe_bits: u8,

    /// `seg_bits` used when formatting a fresh distribution table (4096 segments).
    #[default = 12]
    pub default_segment_bits: u8,

    /// Upper bound, in bytes, on how far an extent item is grown past a boundary before the
    /// migration walk forces a split (`MIGRATION_GRANULARITY`).
    #[default = 4_194_304]
    pub migration_granularity_bytes: u64,

    /// How many pages of migrated data accumulate before the rebalance walk commits a batch
    /// (`MIGR_LARGE_CHUNK_PAGES`).
    #[default = 256]
    pub migrate_large_chunk_pages: u32,

    /// Fraction (parts per 1000) of a metadata brick's capacity reserved as `min_used_blocks`
    /// and therefore never handed out by the allocator.
    #[default = 20]
    pub meta_reserve_per_mille: u32,

    pub block_size: u32,
}

impl EngineConfig {
    pub const fn with_block_size(block_size: u32) -> Self {
        Self {
            default_stripe_bits: 20,
            default_segment_bits: 12,
            migration_granularity_bytes: 4_194_304,
            migrate_large_chunk_pages: 256,
            meta_reserve_per_mille: 20,
            block_size,
        }
    }
}

/// Everything a call into this crate needs that isn't part of its own argument list.
///
/// Owns the brick registry's coarse lock (outermost in the lock-ordering discipline), the
/// live volume table, the readdir cursor pool, and the tunable config. Constructing more than
/// one of these (e.g. one per test) is always safe: nothing here is shared process state.
pub struct EngineContext {
    pub registry: BrickRegistry,
    volumes: spin::RwLock<BTreeMap<Uuid, Arc<Volume>>>,
    cid_counter: AtomicU32,
    pub cursors: CursorPool,
    pub config: EngineConfig,
}

impl EngineContext {
    pub fn new(config: EngineConfig) -> Self {
        Self {
            registry: BrickRegistry::new(),
            volumes: spin::RwLock::new(BTreeMap::new()),
            cid_counter: AtomicU32::new(1),
            cursors: CursorPool::new(),
            config,
        }
    }

    /// Mint the next readdir client id. Cookie encoding reserves the low 20 bits for the
    /// in-directory position, so the id is masked to 12 bits and wraps rather than growing
    /// unboundedly across a long-lived context's lifetime.
    pub fn next_cursor_cid(&self) -> u16 {
        (self.cid_counter.fetch_add(1, Ordering::Relaxed) & 0x0FFF) as u16
    }

    pub fn insert_volume(&self, volume: Arc<Volume>) {
        self.volumes.write().insert(volume.uuid, volume);
    }

    pub fn volume(&self, uuid: Uuid) -> Result<Arc<Volume>> {
        self.volumes.read().get(&uuid).cloned().ok_or(Error::NotFound)
    }

    pub fn remove_volume(&self, uuid: Uuid) -> Option<Arc<Volume>> {
        self.volumes.write().remove(&uuid)
    }

    pub fn volume_uuids(&self) -> Vec<Uuid> {
        self.volumes.read().keys().copied().collect()
    }
}
