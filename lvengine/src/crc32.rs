//! IEEE-802.3 (reflected) CRC-32, used to checksum volmap headers and voltab entries.
//!
//! Table-driven, built once from the polynomial rather than carried as a literal, following
//! the init-a-static-table-at-boot shape this codebase's own CRC32 helper uses.

const POLY: u32 = 0xEDB88320;

fn build_table() -> [u32; 256] {
    let mut table = [0u32; 256];
    let mut i = 0;
    while i < 256 {
        let mut c = i as u32;
        let mut j = 0;
        while j < 8 {
            c = if c & 1 != 0 { POLY ^ (c >> 1) } else { c >> 1 };
            j += 1;
        }
        table[i] = c;
        i += 1;
    }
    table
}

/// Computes the CRC-32 of `data` seeded with `!0`, complemented on output (the conventional
/// IEEE framing used by zip/ethernet and by this engine's on-disk checksummed blocks).
pub fn crc32(data: &[u8]) -> u32 {
    static TABLE: spin::Once<[u32; 256]> = spin::Once::new();
    let table = TABLE.call_once(build_table);

    let mut crc = !0u32;
    for &byte in data {
        let idx = ((crc ^ byte as u32) & 0xFF) as usize;
        crc = table[idx] ^ (crc >> 8);
    }
    !crc
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_vector() {
        assert_eq!(crc32(b"123456789"), 0xCBF4_3926);
    }

    #[test]
    fn empty_input() {
        assert_eq!(crc32(&[]), 0);
    }
}
