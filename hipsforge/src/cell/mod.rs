//! HEALPix cell addressing.
//!
//! Cells are addressed arithmetically as `(order, npix)` in the nested
//! scheme; the pyramid never materializes a tree object. Parent/child
//! relations are pure bit operations: `parent = npix / 4`,
//! `children = 4*npix .. 4*npix+4`.

mod geometry;

pub use geometry::{cell_diagonal, disk_cover};

use std::fmt;

/// Number of base cells at order 0.
pub const N_BASE_CELLS: u64 = 12;

/// Conventional root order of a pyramid.
pub const ROOT_ORDER: u8 = 3;

/// Deepest supported order (nested index fits in 61 bits).
pub const MAX_ORDER: u8 = 29;

/// Total number of cells at a given order: `12 * 4^order`.
pub fn n_cells(order: u8) -> u64 {
    N_BASE_CELLS << (2 * order as u32)
}

/// Nside of the tessellation at a given order: `2^order`.
pub fn nside(order: u8) -> u64 {
    1u64 << order
}

/// A HEALPix cell address in the nested scheme.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CellId {
    /// Resolution level; higher order means finer cells.
    pub order: u8,
    /// Nested-scheme index within the order, in `[0, 12*4^order)`.
    pub npix: u64,
}

impl CellId {
    /// Create a cell address. Panics in debug builds when out of range.
    pub fn new(order: u8, npix: u64) -> CellId {
        debug_assert!(order <= MAX_ORDER);
        debug_assert!(npix < n_cells(order));
        CellId { order, npix }
    }

    /// The parent cell one order up, or `None` at order 0.
    pub fn parent(self) -> Option<CellId> {
        if self.order == 0 {
            return None;
        }
        Some(CellId {
            order: self.order - 1,
            npix: self.npix >> 2,
        })
    }

    /// Child `k` (0..4) one order down.
    pub fn child(self, k: u8) -> CellId {
        debug_assert!(k < 4);
        CellId {
            order: self.order + 1,
            npix: (self.npix << 2) | k as u64,
        }
    }

    /// The four children one order down, in nested order.
    pub fn children(self) -> [CellId; 4] {
        [self.child(0), self.child(1), self.child(2), self.child(3)]
    }

    /// The ancestor of this cell at a coarser order.
    ///
    /// `order` must not exceed `self.order`.
    pub fn ancestor_at(self, order: u8) -> CellId {
        debug_assert!(order <= self.order);
        CellId {
            order,
            npix: self.npix >> (2 * (self.order - order) as u32),
        }
    }

    /// Half-open range of descendant npix values at a deeper order.
    pub fn descendants_at(self, order: u8) -> std::ops::Range<u64> {
        debug_assert!(order >= self.order);
        let shift = 2 * (order - self.order) as u32;
        (self.npix << shift)..((self.npix + 1) << shift)
    }

    /// NUNIQ encoding of this cell: `4 * 4^order + npix`.
    pub fn uniq(self) -> u64 {
        (4u64 << (2 * self.order as u32)) + self.npix
    }

    /// Decode a NUNIQ value back into a cell address.
    pub fn from_uniq(uniq: u64) -> CellId {
        debug_assert!(uniq >= 4);
        let order = ((63 - uniq.leading_zeros() as u8) - 2) / 2;
        CellId {
            order,
            npix: uniq - (4u64 << (2 * order as u32)),
        }
    }

    /// Directory bucket for the on-disk layout: `npix / 10000 * 10000`.
    pub fn dir_index(self) -> u64 {
        self.npix / 10_000 * 10_000
    }

    /// True when `other` is this cell or one of its descendants.
    pub fn contains(self, other: CellId) -> bool {
        other.order >= self.order && other.ancestor_at(self.order) == self
    }
}

impl fmt::Display for CellId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.order, self.npix)
    }
}
