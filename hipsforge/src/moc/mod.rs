//! Multi-resolution coverage maps (MOC).
//!
//! A [`Moc`] is a normalized set of sky cells: internally a sorted list of
//! disjoint npix ranges at the declared maximum order, decomposed into
//! maximal multi-order cells (complete sibling groups packed into their
//! parent) for serialization. Coverage maps are derived artifacts; they are
//! always deleted and rebuilt whole, never patched.

pub mod builder;

pub use builder::{from_index_tree, from_invalid_tiles, from_tile_tree};

use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;

use crate::cell::CellId;
use crate::error::{Error, Result};
use crate::fits::{FitsHeader, HeaderWriter, BLOCK};

/// A normalized coverage set with a declared maximum order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Moc {
    order: u8,
    /// Sorted, disjoint, non-adjacent half-open npix ranges at `order`.
    ranges: Vec<(u64, u64)>,
}

impl Moc {
    /// Empty coverage at the given maximum order.
    pub fn new(order: u8) -> Moc {
        Moc {
            order,
            ranges: Vec::new(),
        }
    }

    /// Build from cells at or above the declared order.
    pub fn from_cells(order: u8, cells: impl IntoIterator<Item = CellId>) -> Moc {
        let mut ranges: Vec<(u64, u64)> = cells
            .into_iter()
            .map(|c| {
                debug_assert!(c.order <= order);
                let r = c.descendants_at(order);
                (r.start, r.end)
            })
            .collect();
        normalize(&mut ranges);
        Moc { order, ranges }
    }

    /// Declared maximum order.
    pub fn order(&self) -> u8 {
        self.order
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    /// Number of covered cells, counted at the maximum order.
    pub fn n_leaf_cells(&self) -> u64 {
        self.ranges.iter().map(|(a, b)| b - a).sum()
    }

    /// Add one cell (at or above the maximum order).
    pub fn insert(&mut self, cell: CellId) {
        let r = cell.descendants_at(self.order);
        self.ranges.push((r.start, r.end));
        normalize(&mut self.ranges);
    }

    /// True when the coverage overlaps the cell (any descendant covered).
    pub fn intersects(&self, cell: CellId) -> bool {
        let (a, b) = self.cell_range(cell);
        // First range ending after a.
        let idx = self.ranges.partition_point(|&(_, end)| end <= a);
        self.ranges.get(idx).map(|&(start, _)| start < b).unwrap_or(false)
    }

    /// True when the cell is entirely covered.
    pub fn contains(&self, cell: CellId) -> bool {
        let (a, b) = self.cell_range(cell);
        let idx = self.ranges.partition_point(|&(_, end)| end <= a);
        self.ranges
            .get(idx)
            .map(|&(start, end)| start <= a && b <= end)
            .unwrap_or(false)
    }

    fn cell_range(&self, cell: CellId) -> (u64, u64) {
        if cell.order <= self.order {
            let r = cell.descendants_at(self.order);
            (r.start, r.end)
        } else {
            let npix = cell.ancestor_at(self.order).npix;
            (npix, npix + 1)
        }
    }

    /// Set union; the result's order is the deeper of the two.
    pub fn union(&self, other: &Moc) -> Moc {
        let order = self.order.max(other.order);
        let mut ranges: Vec<(u64, u64)> = Vec::with_capacity(self.ranges.len() + other.ranges.len());
        ranges.extend(self.ranges.iter().map(|&r| lift(r, self.order, order)));
        ranges.extend(other.ranges.iter().map(|&r| lift(r, other.order, order)));
        normalize(&mut ranges);
        Moc { order, ranges }
    }

    /// Set intersection; the result's order is the deeper of the two.
    pub fn intersection(&self, other: &Moc) -> Moc {
        let order = self.order.max(other.order);
        let a: Vec<(u64, u64)> = self.ranges.iter().map(|&r| lift(r, self.order, order)).collect();
        let b: Vec<(u64, u64)> = other.ranges.iter().map(|&r| lift(r, other.order, order)).collect();

        let mut out = Vec::new();
        let (mut i, mut j) = (0, 0);
        while i < a.len() && j < b.len() {
            let lo = a[i].0.max(b[j].0);
            let hi = a[i].1.min(b[j].1);
            if lo < hi {
                out.push((lo, hi));
            }
            if a[i].1 < b[j].1 {
                i += 1;
            } else {
                j += 1;
            }
        }
        Moc { order, ranges: out }
    }

    /// Covered cells at the maximum order, ascending.
    pub fn leaf_cells(&self) -> Vec<CellId> {
        let mut out = Vec::new();
        for &(a, b) in &self.ranges {
            for npix in a..b {
                out.push(CellId::new(self.order, npix));
            }
        }
        out
    }

    /// Maximal multi-order cell decomposition, sorted by NUNIQ value.
    pub fn cells(&self) -> Vec<CellId> {
        let mut out = Vec::new();
        for &(start, end) in &self.ranges {
            let mut a = start;
            while a < end {
                let align = if a == 0 {
                    self.order as u32
                } else {
                    (a.trailing_zeros() / 2).min(self.order as u32)
                };
                let mut k = align;
                while (1u64 << (2 * k)) > end - a {
                    k -= 1;
                }
                out.push(CellId::new(self.order - k as u8, a >> (2 * k)));
                a += 1u64 << (2 * k);
            }
        }
        out.sort_by_key(|c| c.uniq());
        out
    }

    // -- serialization -----------------------------------------------------

    /// Write the normalized set as a FITS binary table of NUNIQ values.
    ///
    /// Any existing file is replaced whole.
    pub fn write_fits(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let cells = self.cells();

        let mut data = Vec::with_capacity(cells.len() * 8);
        for cell in &cells {
            data.extend_from_slice(&(cell.uniq() as i64).to_be_bytes());
        }
        while data.len() % BLOCK != 0 {
            data.push(0);
        }

        let mut primary = HeaderWriter::new();
        primary
            .logical("SIMPLE", true)
            .integer("BITPIX", 8)
            .integer("NAXIS", 0)
            .logical("EXTEND", true);

        let mut ext = HeaderWriter::new();
        ext.string("XTENSION", "BINTABLE")
            .integer("BITPIX", 8)
            .integer("NAXIS", 2)
            .integer("NAXIS1", 8)
            .integer("NAXIS2", cells.len() as i64)
            .integer("PCOUNT", 0)
            .integer("GCOUNT", 1)
            .integer("TFIELDS", 1)
            .string("TTYPE1", "UNIQ")
            .string("TFORM1", "1K")
            .string("PIXTYPE", "HEALPIX")
            .string("ORDERING", "NUNIQ")
            .integer("MOCORDER", self.order as i64);

        let mut out = BufWriter::new(File::create(path)?);
        out.write_all(&primary.finish())?;
        out.write_all(&ext.finish())?;
        out.write_all(&data)?;
        out.flush()?;
        Ok(())
    }

    /// Read a coverage map written by [`Moc::write_fits`].
    pub fn read_fits(path: &Path) -> Result<Moc> {
        let mut reader = BufReader::new(File::open(path)?);
        let _primary = FitsHeader::parse(&mut reader, path)?;
        let ext = FitsHeader::parse(&mut reader, path)?;

        if ext.get_str("XTENSION") != Some("BINTABLE") {
            return Err(Error::fits(path, "expected a BINTABLE extension"));
        }
        let rows = ext
            .get_i64("NAXIS2")
            .ok_or_else(|| Error::fits(path, "missing NAXIS2"))? as usize;
        let order = ext
            .get_i64("MOCORDER")
            .ok_or_else(|| Error::fits(path, "missing MOCORDER"))? as u8;

        let mut raw = vec![0u8; rows * 8];
        reader
            .read_exact(&mut raw)
            .map_err(|_| Error::fits(path, "truncated coverage table"))?;

        let mut cells = Vec::with_capacity(rows);
        for c in raw.chunks_exact(8) {
            let uniq = i64::from_be_bytes([c[0], c[1], c[2], c[3], c[4], c[5], c[6], c[7]]);
            if uniq < 4 {
                return Err(Error::fits(path, format!("invalid NUNIQ value {uniq}")));
            }
            let cell = CellId::from_uniq(uniq as u64);
            if cell.order > order {
                return Err(Error::fits(path, "cell deeper than declared MOCORDER"));
            }
            cells.push(cell);
        }
        Ok(Moc::from_cells(order, cells))
    }
}

/// Re-express a range at a deeper order.
fn lift(range: (u64, u64), from: u8, to: u8) -> (u64, u64) {
    let shift = 2 * (to - from) as u32;
    (range.0 << shift, range.1 << shift)
}

/// Sort, merge overlapping and adjacent ranges in place.
fn normalize(ranges: &mut Vec<(u64, u64)>) {
    ranges.retain(|&(a, b)| a < b);
    ranges.sort_unstable();
    let mut write = 0;
    for i in 0..ranges.len() {
        if write > 0 && ranges[i].0 <= ranges[write - 1].1 {
            ranges[write - 1].1 = ranges[write - 1].1.max(ranges[i].1);
        } else {
            ranges[write] = ranges[i];
            write += 1;
        }
    }
    ranges.truncate(write);
}
