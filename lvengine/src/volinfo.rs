//! C4: volume-info persistence. Loads, creates, and retires the linked list of volmap blocks
//! (each referencing a page of voltab entries) that holds the distribution table on disk.

use alloc::vec::Vec;

use dvida_serialize::{DvDeSer, DvDeserialize, DvSerialize, Endianness};

use crate::brick::Brick;
use crate::crc32::crc32;
use crate::distribution::{DistributionPlugin, DistributionTable};
use crate::error::{Error, Result};

pub const VOLMAP_MAGIC: [u8; 8] = *b"R4VoLMaP";
const VOLMAP_HEADER_LEN: usize = 4 + 8 + 8; // checksum + magic + next_volmap_block
const VOLTAB_ENTRY_LEN: usize = 8 + 4; // voltab_block_addr + checksum

#[derive(DvDeSer, Debug, Clone, Copy)]
struct VolmapHeader {
    checksum: u32,
    magic: [u8; 8],
    next_volmap_block: u64,
}

#[derive(DvDeSer, Debug, Clone, Copy)]
struct VoltabEntry {
    voltab_block_addr: u64,
    checksum: u32,
}

fn entries_per_volmap(block_size: u32) -> usize {
    (block_size as usize).saturating_sub(VOLMAP_HEADER_LEN) / VOLTAB_ENTRY_LEN
}

/// A chain of volmap blocks allocated but not yet swapped in as the brick's `CUR` chain.
pub struct NewChain {
    pub head: u64,
    pub volmap_blocks: Vec<u64>,
    pub voltab_blocks: Vec<u64>,
}

/// Loads the distribution table reachable from `meta.volmap_loc[slot]`. A head of 0 means the
/// volume has never had more than one brick: returns an empty table.
pub fn load(meta: &Brick, slot: usize, plugin: &dyn DistributionPlugin, seg_bits: u8) -> Result<DistributionTable> {
    let head = meta.volmap_loc[slot];
    if head == 0 {
        return Ok(DistributionTable {
            seg_bits,
            segments: Vec::new(),
        });
    }

    let block_size = meta.io.block_size();
    // The reference plugin packs one little-endian `u16` brick id per segment (see
    // `ConsistentHashRing::pack`), so a voltab block holds `block_size / 2` segments.
    let segments_per_voltab = (block_size as usize) / 2;
    let mut segments = Vec::new();
    let mut next = head;

    while next != 0 {
        let mut buf = alloc::vec![0u8; block_size as usize];
        meta.io.read_block(next, &mut buf)?;

        let (header, _) = VolmapHeader::deserialize(Endianness::Little, &buf)?;
        if header.magic != VOLMAP_MAGIC {
            log::error!("volmap block {next} on brick {} has a bad magic", meta.id);
            return Err(Error::Corrupt("bad volmap magic"));
        }
        let expected = crc32(&buf[4..]);
        if expected != header.checksum {
            log::error!("volmap block {next} on brick {} failed its checksum", meta.id);
            return Err(Error::Corrupt("volmap checksum mismatch"));
        }

        let entries = entries_per_volmap(block_size);
        let mut offset = VOLMAP_HEADER_LEN;
        for _ in 0..entries {
            if offset + VOLTAB_ENTRY_LEN > buf.len() {
                break;
            }
            let (entry, _) = VoltabEntry::deserialize(Endianness::Little, &buf[offset..])?;
            offset += VOLTAB_ENTRY_LEN;
            if entry.voltab_block_addr == 0 {
                continue;
            }
            let mut voltab_buf = alloc::vec![0u8; block_size as usize];
            meta.io.read_block(entry.voltab_block_addr, &mut voltab_buf)?;
            if crc32(&voltab_buf) != entry.checksum {
                log::error!("voltab block {} on brick {} failed its checksum", entry.voltab_block_addr, meta.id);
                return Err(Error::Corrupt("voltab checksum mismatch"));
            }
            segments.extend(plugin.unpack(&voltab_buf, segments.len(), segments_per_voltab));
        }

        next = header.next_volmap_block;
    }

    Ok(DistributionTable { seg_bits, segments })
}

/// Allocates, formats, and writes a new volmap/voltab chain for `table`. Does not touch the
/// brick's `CUR` slot; the caller commits the new chain head via [`Brick::volmap_loc`] and,
/// once the owning transaction commits, calls [`swap`].
pub fn create(meta: &Brick, table: &DistributionTable, plugin: &dyn DistributionPlugin) -> Result<NewChain> {
    let block_size = meta.io.block_size();
    let segments_per_voltab = (block_size as usize) / 2; // reference plugin packs 2 bytes/segment
    let entries = entries_per_volmap(block_size);

    let mut volmap_blocks = Vec::new();
    let mut voltab_blocks = Vec::new();

    let nr_voltabs = table.segments.len().div_ceil(segments_per_voltab).max(1);
    let nr_volmaps = nr_voltabs.div_ceil(entries).max(1);

    let total_needed = nr_voltabs + nr_volmaps;
    let reserved = match meta.io.reserve_blocks(total_needed as u64) {
        Ok(r) => r,
        Err(e) => return Err(e),
    };
    if reserved.len() < total_needed {
        return Err(Error::NoSpace(meta.id));
    }

    let (volmap_reserved, voltab_reserved) = reserved.split_at(nr_volmaps);
    voltab_blocks.extend_from_slice(voltab_reserved);
    volmap_blocks.extend_from_slice(volmap_reserved);

    // Write voltab blocks, remembering each one's checksum for the volmap entries below.
    let mut voltab_checksums = Vec::with_capacity(voltab_blocks.len());
    for (i, &voltab_block) in voltab_blocks.iter().enumerate() {
        let first_segment = i * segments_per_voltab;
        let seg_end = (first_segment + segments_per_voltab).min(table.segments.len());
        let mut buf = alloc::vec![0u8; block_size as usize];
        plugin.pack(table, &mut buf, first_segment, seg_end - first_segment);
        voltab_checksums.push(crc32(&buf));
        if let Err(e) = meta.io.write_block(voltab_block, &buf) {
            rollback(meta, &volmap_blocks, &voltab_blocks);
            return Err(e);
        }
    }

    // Write volmap blocks, each chaining to the next and listing its slice of voltab entries.
    for (vm_idx, &volmap_block) in volmap_blocks.iter().enumerate() {
        let next_volmap = volmap_blocks.get(vm_idx + 1).copied().unwrap_or(0);
        let mut buf = alloc::vec![0u8; block_size as usize];

        let mut offset = VOLMAP_HEADER_LEN;
        for e in 0..entries {
            let voltab_idx = vm_idx * entries + e;
            let Some(&voltab_block) = voltab_blocks.get(voltab_idx) else {
                break;
            };
            let entry = VoltabEntry {
                voltab_block_addr: voltab_block,
                checksum: voltab_checksums[voltab_idx],
            };
            let written = entry.serialize(Endianness::Little, &mut buf[offset..])?;
            offset += written;
        }

        let header = VolmapHeader {
            checksum: 0,
            magic: VOLMAP_MAGIC,
            next_volmap_block: next_volmap,
        };
        header.serialize(Endianness::Little, &mut buf[..VOLMAP_HEADER_LEN])?;
        let checksum = crc32(&buf[4..]);
        buf[0..4].copy_from_slice(&checksum.to_le_bytes());

        if let Err(e) = meta.io.write_block(volmap_block, &buf) {
            rollback(meta, &volmap_blocks, &voltab_blocks);
            return Err(e);
        }
    }

    log::debug!(
        "wrote new volmap chain head={} on brick {} ({} voltab blocks)",
        volmap_blocks.first().copied().unwrap_or(0),
        meta.id,
        voltab_blocks.len()
    );

    Ok(NewChain {
        head: volmap_blocks.first().copied().unwrap_or(0),
        volmap_blocks,
        voltab_blocks,
    })
}

fn rollback(meta: &Brick, volmap_blocks: &[u64], voltab_blocks: &[u64]) {
    log::warn!("rolling back partially written volmap chain on brick {}", meta.id);
    let mut all = Vec::with_capacity(volmap_blocks.len() + voltab_blocks.len());
    all.extend_from_slice(volmap_blocks);
    all.extend_from_slice(voltab_blocks);
    let _ = meta.io.free_blocks(&all);
}

/// Frees every block reachable from a chain head, walking volmap blocks and their referenced
/// voltab blocks. Used to retire the old `CUR` chain after a successful swap.
pub fn release(meta: &Brick, head: u64) -> Result<()> {
    let block_size = meta.io.block_size();
    let entries = entries_per_volmap(block_size);
    let mut next = head;
    let mut to_free = Vec::new();

    while next != 0 {
        let mut buf = alloc::vec![0u8; block_size as usize];
        meta.io.read_block(next, &mut buf)?;
        let (header, _) = VolmapHeader::deserialize(Endianness::Little, &buf)?;

        let mut offset = VOLMAP_HEADER_LEN;
        for _ in 0..entries {
            if offset + VOLTAB_ENTRY_LEN > buf.len() {
                break;
            }
            let (entry, _) = VoltabEntry::deserialize(Endianness::Little, &buf[offset..])?;
            offset += VOLTAB_ENTRY_LEN;
            if entry.voltab_block_addr != 0 {
                to_free.push(entry.voltab_block_addr);
            }
        }

        to_free.push(next);
        next = header.next_volmap_block;
    }

    meta.io.free_blocks(&to_free)
}
