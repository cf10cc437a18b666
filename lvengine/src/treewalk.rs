//! C8: stateless tree-walk helpers shared by the body manager and the rebalance walk. The
//! central idea is the "hint": a cached coordinate plus the key it was taken at, which lets a
//! sequential scan skip a full root-to-leaf search as long as the next request is the
//! immediately-following stripe and nothing has invalidated the node since.

use crate::collaborators::{Coord, ExtentItem, FindBias, ItemKey, Tree};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HintMode {
    Read,
    Write,
}

/// A sealed tree coordinate. `find_stripe_item` validates it against the tree before trusting
/// it, so a stale hint never causes incorrect behaviour — only a wasted fast-path attempt.
#[derive(Debug, Clone, Copy)]
pub struct Hint {
    pub coord: Coord,
    pub key: ItemKey,
    pub mode: HintMode,
}

pub struct FindResult {
    pub coord: Coord,
    pub item: ExtentItem,
    pub via_hint: bool,
}

/// Resolves `key` to its covering (or immediately preceding, for `MaxNotMoreThan`) item,
/// taking the sealed-hint fast path when it validates.
pub fn find_stripe_item(
    tree: &dyn Tree,
    hint: Option<&Hint>,
    key: ItemKey,
    mode: HintMode,
    block_size: u64,
) -> Option<FindResult> {
    if let Some(h) = hint {
        if h.mode == mode && key.oid == h.key.oid && key.offset == h.key.offset.wrapping_add(block_size) {
            if let Some((coord, item)) = advance_from_hint(tree, h, block_size) {
                return Some(FindResult {
                    coord,
                    item,
                    via_hint: true,
                });
            }
        }
    }

    let bias = if key.ordering == crate::collaborators::ORDERING_MAX {
        FindBias::MaxNotMoreThan
    } else {
        FindBias::Exact
    };
    tree.coord_by_key(key, bias).map(|(coord, item)| FindResult {
        coord,
        item,
        via_hint: false,
    })
}

/// The fast path itself: confirm the seal still holds, then try the in-item, same-item,
/// right-neighbour-item, and right-neighbour-node steps in order.
fn advance_from_hint(tree: &dyn Tree, hint: &Hint, block_size: u64) -> Option<(Coord, ExtentItem)> {
    if !tree.seal_holds(hint.coord, hint.key) {
        return None;
    }

    let next_offset = hint.key.offset.wrapping_add(block_size);
    let candidate_key = ItemKey {
        offset: next_offset,
        ..hint.key
    };

    if let Some((coord, item)) = tree.coord_by_key(candidate_key, FindBias::Exact) {
        return Some((coord, item));
    }

    if let Some((coord, item)) = tree.right_neighbor(hint.coord) {
        if item.key.ordering == hint.key.ordering {
            return Some((coord, item));
        }
    }

    None
}

/// Seals a fresh hint after a successful lookup or insert, for the next sequential call to
/// validate against.
pub fn seal(coord: Coord, key: ItemKey, mode: HintMode) -> Hint {
    Hint { coord, key, mode }
}
