//! Coverage-map generators.
//!
//! Each generator scans a directory tree exactly once and produces a fresh
//! [`Moc`]; partial results are never kept.

use tracing::{debug, warn};

use crate::error::Result;
use crate::moc::Moc;
use crate::progress::ProgressTracker;
use crate::store::TileStore;
use crate::tile::TileEncoding;

/// Coverage of the materialized leaf tiles.
///
/// The first tile encountered with a recognized extension fixes the
/// expected encoding for the remainder of the scan (unless `encoding` is
/// given); files with a different extension are skipped, not errors.
pub fn from_tile_tree(
    store: &TileStore,
    order: u8,
    encoding: Option<TileEncoding>,
    progress: &ProgressTracker,
) -> Result<(Moc, Option<TileEncoding>)> {
    let mut expected = encoding;
    let mut moc = Moc::new(order);
    let mut cells = Vec::new();

    for tile in store.scan_order(order)? {
        progress.checkpoint()?;
        let Some(found) = tile.encoding else { continue };
        let expected = *expected.get_or_insert(found);
        if found != expected {
            debug!(cell = %tile.cell, found = %found, "skipping mismatched extension");
            continue;
        }
        cells.push(tile.cell);
        progress.advance();
    }

    if !cells.is_empty() {
        moc = Moc::from_cells(order, cells);
    }
    Ok((moc, expected))
}

/// Coverage of the *indexed* cells: scans the provenance-index tree rather
/// than the tile tree, so it reflects what has been associated with sources
/// even before any tile is materialized.
pub fn from_index_tree(store: &TileStore, order: u8, progress: &ProgressTracker) -> Result<Moc> {
    let index = store.index_store();
    let mut cells = Vec::new();
    for record in index.scan_order(order)? {
        progress.checkpoint()?;
        // Provenance record files carry no extension.
        if record.encoding.is_none() && record.path.extension().is_none() {
            cells.push(record.cell);
            progress.advance();
        }
    }
    Ok(Moc::from_cells(order, cells))
}

/// Coverage of structurally invalid tiles: cells whose file is too short
/// for its declared dimensions (or cannot be decoded at all). The result
/// is a map of *errors*, not presence.
pub fn from_invalid_tiles(
    store: &TileStore,
    order: u8,
    encoding: TileEncoding,
    progress: &ProgressTracker,
) -> Result<Moc> {
    let mut bad = Vec::new();
    for tile in store.scan_order(order)? {
        progress.checkpoint()?;
        if tile.encoding != Some(encoding) {
            continue;
        }
        if !tile_is_structurally_valid(&tile.path, encoding) {
            warn!(cell = %tile.cell, path = %tile.path.display(), "structurally invalid tile");
            bad.push(tile.cell);
        }
        progress.advance();
    }
    Ok(Moc::from_cells(order, bad))
}

fn tile_is_structurally_valid(path: &std::path::Path, encoding: TileEncoding) -> bool {
    match encoding {
        TileEncoding::Fits => {
            let Ok(header) = crate::fits::read_header(path) else {
                return false;
            };
            let Some(min_len) = crate::fits::declared_min_len(&header) else {
                return false;
            };
            std::fs::metadata(path)
                .map(|m| m.len() >= min_len)
                .unwrap_or(false)
        }
        TileEncoding::Png | TileEncoding::Jpeg => image::image_dimensions(path).is_ok(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cell::CellId;
    use crate::fits::FitsImage;
    use crate::tile::TileBuf;
    use tempfile::tempdir;

    fn write_leaf(store: &TileStore, order: u8, npix: u64) {
        let img = FitsImage::filled_blank(4, 4, 16, Some(0.0));
        store
            .write_tile(CellId::new(order, npix), TileEncoding::Fits, &TileBuf::Numeric(img))
            .unwrap();
    }

    #[test]
    fn test_tile_tree_coverage() {
        let dir = tempdir().unwrap();
        let store = TileStore::new(dir.path());
        for npix in [100, 101, 102, 103] {
            write_leaf(&store, 5, npix);
        }
        let progress = ProgressTracker::new();
        let (moc, encoding) = from_tile_tree(&store, 5, None, &progress).unwrap();
        assert_eq!(encoding, Some(TileEncoding::Fits));
        assert_eq!(moc.n_leaf_cells(), 4);
        assert_eq!(
            moc.leaf_cells().iter().map(|c| c.npix).collect::<Vec<_>>(),
            vec![100, 101, 102, 103]
        );
    }

    #[test]
    fn test_first_extension_fixes_scan() {
        let dir = tempdir().unwrap();
        let store = TileStore::new(dir.path());
        write_leaf(&store, 5, 3);
        // A png at a later npix must be skipped once fits is established.
        let png_path = store.tile_path(CellId::new(5, 9), TileEncoding::Png);
        std::fs::create_dir_all(png_path.parent().unwrap()).unwrap();
        image::RgbaImage::new(4, 4).save(&png_path).unwrap();

        let progress = ProgressTracker::new();
        let (moc, encoding) = from_tile_tree(&store, 5, None, &progress).unwrap();
        assert_eq!(encoding, Some(TileEncoding::Fits));
        assert_eq!(moc.n_leaf_cells(), 1);
    }

    #[test]
    fn test_coverage_regeneration_is_idempotent() {
        let dir = tempdir().unwrap();
        let store = TileStore::new(dir.path());
        for npix in [7, 42, 4000] {
            write_leaf(&store, 6, npix);
        }
        let progress = ProgressTracker::new();
        let path = dir.path().join("Moc.fits");

        let (first, _) = from_tile_tree(&store, 6, None, &progress).unwrap();
        first.write_fits(&path).unwrap();
        let bytes_first = std::fs::read(&path).unwrap();

        let (second, _) = from_tile_tree(&store, 6, None, &progress).unwrap();
        second.write_fits(&path).unwrap();
        let bytes_second = std::fs::read(&path).unwrap();
        assert_eq!(bytes_first, bytes_second);
    }

    #[test]
    fn test_index_tree_coverage() {
        let dir = tempdir().unwrap();
        let store = TileStore::new(dir.path());
        for npix in [5u64, 17] {
            let path = store.index_record_path(CellId::new(4, npix));
            std::fs::create_dir_all(path.parent().unwrap()).unwrap();
            std::fs::write(&path, b"{\"name\":\"img\"}\n").unwrap();
        }
        let progress = ProgressTracker::new();
        let moc = from_index_tree(&store, 4, &progress).unwrap();
        assert_eq!(
            moc.leaf_cells().iter().map(|c| c.npix).collect::<Vec<_>>(),
            vec![5, 17]
        );
    }

    #[test]
    fn test_invalid_tiles_coverage() {
        let dir = tempdir().unwrap();
        let store = TileStore::new(dir.path());
        write_leaf(&store, 5, 10);
        write_leaf(&store, 5, 11);

        // Truncate one tile into its data section.
        let bad = store.tile_path(CellId::new(5, 11), TileEncoding::Fits);
        let bytes = std::fs::read(&bad).unwrap();
        std::fs::write(&bad, &bytes[..bytes.len() - crate::fits::BLOCK]).unwrap();

        let progress = ProgressTracker::new();
        let moc = from_invalid_tiles(&store, 5, TileEncoding::Fits, &progress).unwrap();
        assert_eq!(
            moc.leaf_cells().iter().map(|c| c.npix).collect::<Vec<_>>(),
            vec![11]
        );
    }

    #[test]
    fn test_abort_propagates() {
        let dir = tempdir().unwrap();
        let store = TileStore::new(dir.path());
        write_leaf(&store, 5, 1);
        let progress = ProgressTracker::new();
        progress.abort();
        let err = from_tile_tree(&store, 5, None, &progress).unwrap_err();
        assert!(err.is_abort());
    }
}
