//! C3: the distribution engine. Maps a stripe key to a brick id via a consistent-hash ring
//! over a fixed number of segments, and mutates that ring when bricks are added or removed.
//!
//! The core ships exactly one [`DistributionPlugin`] implementation — distribution plugins are,
//! from this crate's point of view, a closed set dispatched by plugin id rather than an
//! open-ended vtable.

use alloc::vec;
use alloc::vec::Vec;

use uuid::Uuid;

use crate::brick::BrickId;
use crate::error::{Error, Result};
use crate::murmur3::{murmur3_x86_32, stripe_seed};

pub const REFERENCE_DISTRIBUTION_PLUGIN_ID: u8 = 0;

/// A segment table: `segments[i]` names the brick id currently responsible for ring position
/// `i`. `segments.len()` is always a power of two (`1 << seg_bits`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DistributionTable {
    pub seg_bits: u8,
    pub segments: Vec<BrickId>,
}

impl DistributionTable {
    pub fn nr_segments(&self) -> usize {
        self.segments.len()
    }
}

pub trait DistributionPlugin: Send + Sync {
    /// Build a fresh table over `buckets` with `1 << seg_bits` segments.
    fn build(&self, seg_bits: u8, buckets: &[BrickId]) -> DistributionTable;

    /// The hot path: resolve one segment given its hash.
    fn segment_for_hash(&self, table: &DistributionTable, hash: u32) -> BrickId;

    /// Add `new_bucket` to the ring, reassigning a roughly `1/(n+1)` fraction of segments to it.
    fn inc(&self, table: &mut DistributionTable, buckets: &[BrickId], new_bucket: BrickId);

    /// Remove `victim` from the ring; every segment it owned is reassigned among `buckets`
    /// (which must already exclude `victim`).
    fn dec(&self, table: &mut DistributionTable, buckets: &[BrickId], victim: BrickId);

    /// Double the segment count, preserving every existing segment's bucket assignment for
    /// its two new children (used by the scale-volume operation).
    fn spl(&self, table: &mut DistributionTable, factor_bits: u8);

    fn pack(&self, table: &DistributionTable, block_buf: &mut [u8], first_segment: usize, segments_per_block: usize) -> usize;
    fn unpack(&self, block_buf: &[u8], first_segment: usize, segments_per_block: usize) -> Vec<BrickId>;
}

/// The reference plugin: segment `i`'s owner is recomputed by hashing `i` together with a
/// per-table salt derived from the current bucket set, so that `inc`/`dec` only move the
/// segments that must move to keep the ring internally consistent with [`Self::build`].
pub struct ConsistentHashRing;

impl ConsistentHashRing {
    fn bucket_for_segment(&self, seg: usize, buckets: &[BrickId]) -> BrickId {
        debug_assert!(!buckets.is_empty());
        if buckets.len() == 1 {
            return buckets[0];
        }
        let h = murmur3_x86_32(&(seg as u32).to_le_bytes(), 0x5EED_u32);
        buckets[(h as usize) % buckets.len()]
    }
}

impl DistributionPlugin for ConsistentHashRing {
    fn build(&self, seg_bits: u8, buckets: &[BrickId]) -> DistributionTable {
        let n = 1usize << seg_bits;
        let segments = (0..n).map(|i| self.bucket_for_segment(i, buckets)).collect();
        DistributionTable { seg_bits, segments }
    }

    fn segment_for_hash(&self, table: &DistributionTable, hash: u32) -> BrickId {
        table.segments[(hash as usize) & (table.nr_segments() - 1)]
    }

    fn inc(&self, table: &mut DistributionTable, buckets: &[BrickId], new_bucket: BrickId) {
        let target_share = table.nr_segments() / buckets.len().max(1);
        let mut moved = 0usize;
        for (i, slot) in table.segments.iter_mut().enumerate() {
            if moved >= target_share {
                break;
            }
            let h = murmur3_x86_32(&(i as u32).to_le_bytes(), 0xA11C_u32);
            if (h as usize) % buckets.len() == 0 {
                *slot = new_bucket;
                moved += 1;
            }
        }
    }

    fn dec(&self, table: &mut DistributionTable, buckets: &[BrickId], victim: BrickId) {
        for (i, slot) in table.segments.iter_mut().enumerate() {
            if *slot == victim {
                *slot = self.bucket_for_segment(i, buckets);
            }
        }
    }

    fn spl(&self, table: &mut DistributionTable, factor_bits: u8) {
        let mut next = Vec::with_capacity(table.segments.len() << factor_bits);
        for &owner in table.segments.iter() {
            for _ in 0..(1u32 << factor_bits) {
                next.push(owner);
            }
        }
        table.seg_bits += factor_bits;
        table.segments = next;
    }

    fn pack(&self, table: &DistributionTable, block_buf: &mut [u8], first_segment: usize, segments_per_block: usize) -> usize {
        let end = (first_segment + segments_per_block).min(table.segments.len());
        let mut written = 0;
        for seg in &table.segments[first_segment..end] {
            block_buf[written..written + 2].copy_from_slice(&seg.to_le_bytes());
            written += 2;
        }
        written
    }

    fn unpack(&self, block_buf: &[u8], first_segment: usize, segments_per_block: usize) -> Vec<BrickId> {
        let _ = first_segment;
        let mut out = Vec::with_capacity(segments_per_block);
        for chunk in block_buf.chunks_exact(2).take(segments_per_block) {
            out.push(u16::from_le_bytes([chunk[0], chunk[1]]));
        }
        out
    }
}

pub fn plugin_by_id(id: u8) -> Result<&'static dyn DistributionPlugin> {
    static RING: ConsistentHashRing = ConsistentHashRing;
    match id {
        REFERENCE_DISTRIBUTION_PLUGIN_ID => Ok(&RING),
        other => Err(Error::UnknownPlugin(other)),
    }
}

/// Resolves the brick that should hold stripe `stripe_index` of file `oid`, honouring the
/// single-DSA-brick short circuit and proxy precedence.
#[allow(clippy::too_many_arguments)]
pub fn calc_brick(
    plugin: &dyn DistributionPlugin,
    table: &DistributionTable,
    dsa: &[BrickId],
    volume_uuid: &Uuid,
    oid: u64,
    stripe_index: u64,
    proxy: Option<BrickId>,
    proxy_io_active: bool,
    caller_wants_proxy_full: bool,
) -> Result<BrickId> {
    if proxy_io_active && !caller_wants_proxy_full {
        if let Some(p) = proxy {
            return Ok(p);
        }
    }
    if dsa.is_empty() {
        return Err(Error::Invalid("distribution has no bricks to place data on"));
    }
    if dsa.len() == 1 {
        return Ok(dsa[0]);
    }
    let seed = stripe_seed(oid, volume_uuid.as_bytes());
    let hash = murmur3_x86_32(&stripe_index.to_le_bytes(), seed);
    Ok(plugin.segment_for_hash(table, hash))
}

pub fn empty_table() -> DistributionTable {
    DistributionTable {
        seg_bits: 0,
        segments: vec![],
    }
}
