//! C7: the readdir cursor pool. Backs stateless (NFS-style) directory scans, where a client
//! carries nothing between calls but a 64-bit cookie.
//!
//! Cookie layout: `(cid << POS_BITS) | pos`. `cid` is a context-lifetime counter (see
//! [`crate::context::EngineContext::next_cursor_cid`]), `pos` the in-directory position. A
//! cookie of `0` means "start a fresh scan".

use alloc::collections::BTreeMap;
use alloc::vec::Vec;

use spin::Mutex;

pub const POS_BITS: u32 = 20;
const POS_MASK: u64 = (1u64 << POS_BITS) - 1;

pub fn encode_cookie(cid: u16, pos: u32) -> u64 {
    ((cid as u64) << POS_BITS) | (pos as u64 & POS_MASK)
}

pub fn decode_cookie(cookie: u64) -> (u16, u32) {
    let cid = (cookie >> POS_BITS) as u16;
    let pos = (cookie & POS_MASK) as u32;
    (cid, pos)
}

/// One detached scan position. `last_key` is the hashed name of the entry last returned, used
/// by [`CursorPool::on_entry_changed`] to decide whether a mutation hit the cursor's own entry
/// rather than merely shifting positions around it.
#[derive(Debug, Clone, Copy, Default)]
struct Cursor {
    pos: u32,
    last_key: Option<u64>,
}

/// Cursors indexed by `(oid, cid)` for O(log n) cookie lookup, and a secondary per-oid index
/// so entry-change hooks can walk every open cursor on a directory without scanning the whole
/// pool. A real shrinker would additionally track a ref-counted unused list and reclaim from
/// its head under memory pressure; this crate has no page-reclaim loop to hang that off of, so
/// cursors are dropped by explicit [`CursorPool::release`] instead.
pub struct CursorPool {
    cursors: Mutex<BTreeMap<(u64, u16), Cursor>>,
    by_oid: Mutex<BTreeMap<u64, Vec<u16>>>,
}

impl Default for CursorPool {
    fn default() -> Self {
        Self::new()
    }
}

impl CursorPool {
    pub fn new() -> Self {
        Self {
            cursors: Mutex::new(BTreeMap::new()),
            by_oid: Mutex::new(BTreeMap::new()),
        }
    }

    /// Resolve a cookie to a `(cid, pos)` pair, minting a fresh cursor via `mint_cid` when the
    /// cookie is `0`. A nonzero cookie whose cursor was already reclaimed is accepted anyway —
    /// the scan resumes from the position it encodes, just without the benefit of the
    /// position-adjustment bookkeeping that would have happened while it was gone.
    pub fn open(&self, oid: u64, cookie: u64, mint_cid: impl FnOnce() -> u16) -> (u16, u32) {
        if cookie == 0 {
            let cid = mint_cid();
            self.cursors.lock().insert((oid, cid), Cursor::default());
            self.by_oid.lock().entry(oid).or_default().push(cid);
            return (cid, 0);
        }

        let (cid, pos) = decode_cookie(cookie);
        let mut cursors = self.cursors.lock();
        cursors.entry((oid, cid)).or_insert(Cursor { pos, last_key: None });
        drop(cursors);
        let mut by_oid = self.by_oid.lock();
        let list = by_oid.entry(oid).or_default();
        if !list.contains(&cid) {
            list.push(cid);
        }
        (cid, pos)
    }

    /// Record the position and last-returned-entry hash after a scan step, for the next
    /// `on_entry_changed` call to reason about.
    pub fn advance(&self, oid: u64, cid: u16, pos: u32, last_key: Option<u64>) {
        if let Some(c) = self.cursors.lock().get_mut(&(oid, cid)) {
            c.pos = pos;
            c.last_key = last_key;
        }
    }

    pub fn release(&self, oid: u64, cid: u16) {
        self.cursors.lock().remove(&(oid, cid));
        if let Some(list) = self.by_oid.lock().get_mut(&oid) {
            list.retain(|&c| c != cid);
        }
    }

    /// A directory entry at `mod_offset` was inserted (`removed = false`) or removed
    /// (`removed = true`); `entry_key` is that entry's hashed name, used to detect when the
    /// mutation is of the cursor's own last-returned entry.
    pub fn on_entry_changed(&self, oid: u64, mod_offset: u32, removed: bool, entry_key: u64) {
        let Some(cids) = self.by_oid.lock().get(&oid).cloned() else {
            return;
        };
        let mut cursors = self.cursors.lock();
        for cid in cids {
            let Some(c) = cursors.get_mut(&(oid, cid)) else {
                continue;
            };
            if mod_offset < c.pos {
                c.pos = if removed { c.pos.saturating_sub(1) } else { c.pos + 1 };
            } else if mod_offset == c.pos && removed && c.last_key == Some(entry_key) {
                c.pos = 0;
                c.last_key = None;
            }
        }
    }
}
