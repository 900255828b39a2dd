//! On-disk tile store.
//!
//! The filesystem is treated purely as a key-value store keyed by
//! `(order, npix, encoding)`:
//!
//! ```text
//! root/Norder{order}/Dir{npix/10000*10000}/Npix{npix}.{ext}
//! root/Norder3/Allsky.{ext}
//! root/Moc.fits
//! root/properties
//! root/HpxFinder/Norder{order}/Dir{...}/Npix{npix}     (provenance records)
//! ```
//!
//! All scans are sorted numerically by order, directory bucket and npix so
//! that traversal order is fully deterministic.

mod properties;

pub use properties::{
    Properties, KEY_CHECK_CODE, KEY_EST_SIZE, KEY_FRAME, KEY_NB_TILES, KEY_ORDER,
    KEY_RELEASE_DATE, KEY_TILE_FORMAT, KEY_TILE_WIDTH,
};

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use regex::Regex;

use crate::cell::CellId;
use crate::error::Result;
use crate::fits::FitsImage;
use crate::tile::{TileBuf, TileEncoding, VisualTile};

fn norder_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^Norder(\d+)$").unwrap())
}

fn dir_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^Dir(\d+)$").unwrap())
}

fn npix_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^Npix(\d+)(?:\.([A-Za-z0-9]+))?$").unwrap())
}

/// A scanned tile file.
#[derive(Debug, Clone)]
pub struct ScannedTile {
    pub cell: CellId,
    pub path: PathBuf,
    /// Extension as found on disk; `None` for provenance record files.
    pub encoding: Option<TileEncoding>,
}

/// Handle to one pyramid directory tree.
#[derive(Debug, Clone)]
pub struct TileStore {
    root: PathBuf,
}

impl TileStore {
    pub fn new(root: impl Into<PathBuf>) -> TileStore {
        TileStore { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    // -- path law ----------------------------------------------------------

    pub fn order_dir(&self, order: u8) -> PathBuf {
        self.root.join(format!("Norder{order}"))
    }

    pub fn tile_path(&self, cell: CellId, encoding: TileEncoding) -> PathBuf {
        self.order_dir(cell.order)
            .join(format!("Dir{}", cell.dir_index()))
            .join(format!("Npix{}.{}", cell.npix, encoding.extension()))
    }

    pub fn allsky_path(&self, encoding: TileEncoding) -> PathBuf {
        self.order_dir(3).join(format!("Allsky.{}", encoding.extension()))
    }

    pub fn moc_path(&self) -> PathBuf {
        self.root.join("Moc.fits")
    }

    pub fn properties_path(&self) -> PathBuf {
        self.root.join("properties")
    }

    // -- provenance index --------------------------------------------------

    pub fn index_root(&self) -> PathBuf {
        self.root.join("HpxFinder")
    }

    pub fn index_store(&self) -> TileStore {
        TileStore::new(self.index_root())
    }

    pub fn index_record_path(&self, cell: CellId) -> PathBuf {
        self.index_root()
            .join(format!("Norder{}", cell.order))
            .join(format!("Dir{}", cell.dir_index()))
            .join(format!("Npix{}", cell.npix))
    }

    pub fn index_checkpoint_path(&self) -> PathBuf {
        self.index_root().join("last_indexed")
    }

    pub fn index_moc_path(&self) -> PathBuf {
        self.index_root().join("Moc.fits")
    }

    // -- tile I/O ----------------------------------------------------------

    pub fn tile_exists(&self, cell: CellId, encoding: TileEncoding) -> bool {
        self.tile_path(cell, encoding).is_file()
    }

    /// Load a tile if present. Absence is the "dead branch" signal, not an
    /// error.
    pub fn read_tile(&self, cell: CellId, encoding: TileEncoding) -> Result<Option<TileBuf>> {
        let path = self.tile_path(cell, encoding);
        if !path.is_file() {
            return Ok(None);
        }
        let buf = match encoding {
            TileEncoding::Fits => TileBuf::Numeric(FitsImage::read(&path)?),
            TileEncoding::Png | TileEncoding::Jpeg => TileBuf::Visual(VisualTile::read(&path)?),
        };
        Ok(Some(buf))
    }

    pub fn write_tile(&self, cell: CellId, encoding: TileEncoding, tile: &TileBuf) -> Result<()> {
        let path = self.tile_path(cell, encoding);
        match tile {
            TileBuf::Numeric(img) => img.write(&path),
            TileBuf::Visual(v) => v.write(&path, encoding),
        }
    }

    pub fn remove_tile(&self, cell: CellId, encoding: TileEncoding) -> Result<()> {
        let path = self.tile_path(cell, encoding);
        if path.is_file() {
            fs::remove_file(path)?;
        }
        Ok(())
    }

    // -- scans -------------------------------------------------------------

    /// Orders present in the store, ascending.
    pub fn orders(&self) -> Result<Vec<u8>> {
        let mut orders = Vec::new();
        if !self.root.is_dir() {
            return Ok(orders);
        }
        for entry in fs::read_dir(&self.root)? {
            let entry = entry?;
            let name = entry.file_name();
            if let Some(caps) = norder_re().captures(&name.to_string_lossy()) {
                if let Ok(order) = caps[1].parse::<u8>() {
                    orders.push(order);
                }
            }
        }
        orders.sort_unstable();
        Ok(orders)
    }

    /// Deepest order present, used to derive an unset leaf order.
    pub fn max_order(&self) -> Result<Option<u8>> {
        Ok(self.orders()?.last().copied())
    }

    /// All tile files at one order, sorted by npix.
    ///
    /// Files whose names do not match the `Npix` pattern are ignored.
    pub fn scan_order(&self, order: u8) -> Result<Vec<ScannedTile>> {
        let mut tiles = Vec::new();
        let order_dir = self.order_dir(order);
        if !order_dir.is_dir() {
            return Ok(tiles);
        }

        let mut buckets: Vec<(u64, PathBuf)> = Vec::new();
        for entry in fs::read_dir(&order_dir)? {
            let entry = entry?;
            let name = entry.file_name();
            if let Some(caps) = dir_re().captures(&name.to_string_lossy()) {
                if let Ok(bucket) = caps[1].parse::<u64>() {
                    buckets.push((bucket, entry.path()));
                }
            }
        }
        buckets.sort_unstable_by_key(|(bucket, _)| *bucket);

        for (_, dir) in buckets {
            let mut files: Vec<(u64, Option<TileEncoding>, PathBuf)> = Vec::new();
            for entry in fs::read_dir(&dir)? {
                let entry = entry?;
                let name = entry.file_name();
                let name = name.to_string_lossy();
                if let Some(caps) = npix_re().captures(&name) {
                    if let Ok(npix) = caps[1].parse::<u64>() {
                        let encoding = caps
                            .get(2)
                            .and_then(|ext| TileEncoding::from_extension(ext.as_str()));
                        files.push((npix, encoding, entry.path()));
                    }
                }
            }
            files.sort_unstable_by_key(|(npix, _, _)| *npix);
            for (npix, encoding, path) in files {
                tiles.push(ScannedTile {
                    cell: CellId::new(order, npix),
                    path,
                    encoding,
                });
            }
        }
        Ok(tiles)
    }

    /// Leaf cells materialized with the given encoding, sorted.
    pub fn leaf_cells(&self, order: u8, encoding: TileEncoding) -> Result<Vec<CellId>> {
        Ok(self
            .scan_order(order)?
            .into_iter()
            .filter(|t| t.encoding == Some(encoding))
            .map(|t| t.cell)
            .collect())
    }

    /// Load the properties metadata file (empty when absent).
    pub fn properties(&self) -> Result<Properties> {
        Properties::load(&self.properties_path())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_path_law() {
        let store = TileStore::new("/data/survey");
        let cell = CellId::new(8, 54_321);
        assert_eq!(
            store.tile_path(cell, TileEncoding::Fits),
            PathBuf::from("/data/survey/Norder8/Dir50000/Npix54321.fits")
        );
        assert_eq!(
            store.allsky_path(TileEncoding::Png),
            PathBuf::from("/data/survey/Norder3/Allsky.png")
        );
        assert_eq!(
            store.index_record_path(CellId::new(5, 100)),
            PathBuf::from("/data/survey/HpxFinder/Norder5/Dir0/Npix100")
        );
    }

    #[test]
    fn test_tile_roundtrip_and_existence() {
        let dir = tempdir().unwrap();
        let store = TileStore::new(dir.path());
        let cell = CellId::new(5, 100);

        assert!(store.read_tile(cell, TileEncoding::Fits).unwrap().is_none());

        let img = FitsImage::filled_blank(4, 4, 16, Some(-1.0));
        store
            .write_tile(cell, TileEncoding::Fits, &TileBuf::Numeric(img))
            .unwrap();
        assert!(store.tile_exists(cell, TileEncoding::Fits));
        assert!(store.read_tile(cell, TileEncoding::Fits).unwrap().is_some());
    }

    #[test]
    fn test_scan_is_sorted_and_filters_encoding() {
        let dir = tempdir().unwrap();
        let store = TileStore::new(dir.path());
        let img = |_: u64| FitsImage::filled_blank(2, 2, 8, None);
        for npix in [10_002u64, 3, 10_001, 7] {
            store
                .write_tile(
                    CellId::new(6, npix),
                    TileEncoding::Fits,
                    &TileBuf::Numeric(img(npix)),
                )
                .unwrap();
        }
        // A stray file that must be ignored.
        std::fs::write(store.order_dir(6).join("Dir0").join("notes.txt"), b"x").unwrap();

        let cells = store.leaf_cells(6, TileEncoding::Fits).unwrap();
        assert_eq!(
            cells.iter().map(|c| c.npix).collect::<Vec<_>>(),
            vec![3, 7, 10_001, 10_002]
        );
        assert!(store.leaf_cells(6, TileEncoding::Png).unwrap().is_empty());
    }

    #[test]
    fn test_orders_and_max_order() {
        let dir = tempdir().unwrap();
        let store = TileStore::new(dir.path());
        assert_eq!(store.max_order().unwrap(), None);

        for order in [3u8, 5, 4] {
            std::fs::create_dir_all(store.order_dir(order)).unwrap();
        }
        assert_eq!(store.orders().unwrap(), vec![3, 4, 5]);
        assert_eq!(store.max_order().unwrap(), Some(5));
    }
}
