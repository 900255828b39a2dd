//! Pyramid aggregator.
//!
//! Builds every interior order, from one above the leaves down to the root
//! order, by folding each cell's four children into one tile. The leaf
//! tiles are the only input; interior tiles are always regenerated, never
//! read back as sources.
//!
//! The recursion works branch by branch: each of the 768 root cells is an
//! independent sub-tree, so the roots are processed in parallel and a
//! branch holds at most one tile per level in memory.

use rayon::prelude::*;
use tracing::{debug, info, warn};

use crate::cell::{n_cells, CellId, ROOT_ORDER};
use crate::config::BuildContext;
use crate::error::{Error, Result};
use crate::fits::FitsImage;
use crate::moc::Moc;
use crate::progress::ProgressTracker;
use crate::store::TileStore;
use crate::tile::{AggKernel, TileBuf, TileEncoding, VisualTile};

/// Thumbnail side length inside the all-sky preview.
pub const ALLSKY_THUMB: u32 = 64;

/// Counters from one aggregation pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PyramidStats {
    /// Interior tiles written.
    pub written: u64,
    /// Stale interior tiles removed because their whole branch is dead.
    pub pruned: u64,
    /// Leaf tiles skipped because they could not be read.
    pub skipped: u64,
}

impl PyramidStats {
    fn merge(self, other: PyramidStats) -> PyramidStats {
        PyramidStats {
            written: self.written + other.written,
            pruned: self.pruned + other.pruned,
            skipped: self.skipped + other.skipped,
        }
    }
}

/// Build all interior orders of the pyramid at `ctx.output_root`.
pub fn build(ctx: &BuildContext, progress: &ProgressTracker) -> Result<PyramidStats> {
    let store = TileStore::new(&ctx.output_root);
    let leaf = match ctx.leaf_order {
        Some(o) => o,
        None => store
            .max_order()?
            .ok_or_else(|| Error::Config("store has no tile orders to aggregate".to_string()))?,
    };
    if leaf <= ctx.min_order {
        debug!(leaf, "no interior orders to build");
        return Ok(PyramidStats::default());
    }
    let kernel = ctx.effective_kernel();
    let encoding = ctx.encoding;

    let roots = n_cells(ctx.min_order);
    progress.begin(roots);
    info!(leaf, root = ctx.min_order, kernel = ?kernel, "aggregating pyramid");

    let stats = (0..roots)
        .into_par_iter()
        .map(|npix| -> Result<PyramidStats> {
            let root = CellId::new(ctx.min_order, npix);
            let (_, stats) = build_branch(&store, root, leaf, encoding, kernel, &ctx.region, progress)?;
            progress.advance();
            Ok(stats)
        })
        .try_reduce(PyramidStats::default, |a, b| Ok(a.merge(b)))?;

    info!(
        written = stats.written,
        pruned = stats.pruned,
        skipped = stats.skipped,
        "aggregation complete"
    );
    Ok(stats)
}

/// Build the sub-tree rooted at `cell` and return its tile (or `None` for
/// a dead branch).
fn build_branch(
    store: &TileStore,
    cell: CellId,
    leaf: u8,
    encoding: TileEncoding,
    kernel: AggKernel,
    region: &Option<Moc>,
    progress: &ProgressTracker,
) -> Result<(Option<TileBuf>, PyramidStats)> {
    progress.checkpoint()?;

    if cell.order == leaf {
        // An unreadable leaf never fails the build; the branch just loses
        // that child, like an absent tile.
        return match store.read_tile(cell, encoding) {
            Ok(tile) => Ok((tile, PyramidStats::default())),
            Err(err) if !err.is_abort() => {
                warn!(cell = %cell, error = %err, "skipping unreadable leaf tile");
                Ok((
                    None,
                    PyramidStats {
                        skipped: 1,
                        ..PyramidStats::default()
                    },
                ))
            }
            Err(err) => Err(err),
        };
    }

    let mut stats = PyramidStats::default();
    let mut children: [Option<TileBuf>; 4] = [None, None, None, None];
    for (k, child) in cell.children().into_iter().enumerate() {
        let (tile, child_stats) =
            build_branch(store, child, leaf, encoding, kernel, region, progress)?;
        stats = stats.merge(child_stats);
        children[k] = tile;
    }

    if children.iter().all(Option::is_none) {
        if store.tile_exists(cell, encoding) {
            store.remove_tile(cell, encoding)?;
            stats.pruned += 1;
        }
        return Ok((None, stats));
    }

    let template = children.iter().flatten().next().unwrap();
    let mut parent = template.like();
    for (k, child) in children.iter().enumerate() {
        if let Some(child) = child {
            parent.fold_child(k as u8, child, kernel);
        }
    }

    let persist = region.as_ref().map_or(true, |r| r.intersects(cell));
    if persist {
        store.write_tile(cell, encoding, &parent)?;
        stats.written += 1;
    }
    Ok((Some(parent), stats))
}

// ---------------------------------------------------------------------------
// All-sky preview
// ---------------------------------------------------------------------------

/// Build the `Norder3/Allsky` mosaic: every root tile downscaled into a
/// fixed grid of [`ALLSKY_THUMB`]-pixel thumbnails. Returns `false` when
/// the store has no root tiles to preview.
pub fn build_allsky(ctx: &BuildContext, progress: &ProgressTracker) -> Result<bool> {
    let store = TileStore::new(&ctx.output_root);
    let encoding = ctx.encoding;
    let cells = store.leaf_cells(ROOT_ORDER, encoding)?;
    if cells.is_empty() {
        return Ok(false);
    }

    let n = n_cells(ROOT_ORDER);
    let cols = (n as f64).sqrt() as u32; // 27
    let rows = (n as u32).div_ceil(cols); // 29
    let thumb = ALLSKY_THUMB.min(ctx.tile_width);
    progress.begin(cells.len() as u64);

    let first = store
        .read_tile(cells[0], encoding)?
        .ok_or_else(|| Error::Config("root tile vanished during all-sky build".to_string()))?;

    let mut canvas = match &first {
        TileBuf::Numeric(img) => {
            let mut c = FitsImage::filled_blank(cols * thumb, rows * thumb, img.bitpix, img.blank);
            c.bscale = img.bscale;
            c.bzero = img.bzero;
            TileBuf::Numeric(c)
        }
        TileBuf::Visual(_) => {
            let mut c = VisualTile::empty(cols * thumb);
            c.image = image::RgbaImage::new(cols * thumb, rows * thumb);
            TileBuf::Visual(c)
        }
    };

    for cell in cells {
        progress.checkpoint()?;
        progress.set_current(cell.to_string());
        let Some(tile) = store.read_tile(cell, encoding)? else {
            continue;
        };
        let ox = (cell.npix as u32 % cols) * thumb;
        let oy = (cell.npix as u32 / cols) * thumb;
        paste_thumb(&mut canvas, &tile, ox, oy, thumb);
        progress.advance();
    }

    match &canvas {
        TileBuf::Numeric(img) => img.write(&store.allsky_path(encoding))?,
        TileBuf::Visual(v) => v.write(&store.allsky_path(encoding), encoding)?,
    }
    info!(cols, rows, thumb, "all-sky preview written");
    Ok(true)
}

/// Downscale one tile into a `thumb`-sized cell of the canvas at `(ox, oy)`.
fn paste_thumb(canvas: &mut TileBuf, tile: &TileBuf, ox: u32, oy: u32, thumb: u32) {
    match (canvas, tile) {
        (TileBuf::Numeric(canvas), TileBuf::Numeric(tile)) => {
            let factor = (tile.width / thumb).max(1);
            let blank = canvas.blank;
            for ty in 0..thumb {
                for tx in 0..thumb {
                    let mut sum = 0.0;
                    let mut count = 0u32;
                    for dy in 0..factor {
                        for dx in 0..factor {
                            let x = (tx * factor + dx).min(tile.width - 1);
                            let y = (ty * factor + dy).min(tile.height - 1);
                            let v = tile.get(x, y);
                            if !tile.is_blank(v) {
                                sum += v;
                                count += 1;
                            }
                        }
                    }
                    let v = if count == 0 {
                        blank.unwrap_or(f64::NAN)
                    } else {
                        sum / count as f64
                    };
                    canvas.set(ox + tx, oy + ty, v);
                }
            }
        }
        (TileBuf::Visual(canvas), TileBuf::Visual(tile)) => {
            let small = image::imageops::resize(
                &tile.image,
                thumb,
                thumb,
                image::imageops::FilterType::Triangle,
            );
            image::imageops::replace(&mut canvas.image, &small, ox as i64, oy as i64);
        }
        _ => debug_assert!(false, "mixed tile encodings in all-sky build"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn write_leaf(store: &TileStore, order: u8, npix: u64, value: f64) {
        let mut img = FitsImage::filled_blank(4, 4, -32, None);
        for v in img.data.iter_mut() {
            *v = value;
        }
        store
            .write_tile(CellId::new(order, npix), TileEncoding::Fits, &TileBuf::Numeric(img))
            .unwrap();
    }

    fn ctx(root: &std::path::Path, leaf: u8) -> BuildContext {
        BuildContext::new(root).with_leaf_order(leaf).with_tile_width(4)
    }

    #[test]
    fn test_sibling_leaves_build_single_ancestor_chain() {
        let dir = tempdir().unwrap();
        let store = TileStore::new(dir.path());
        for npix in [100u64, 101, 102, 103] {
            write_leaf(&store, 5, npix, npix as f64);
        }

        let progress = ProgressTracker::new();
        let stats = build(&ctx(dir.path(), 5), &progress).unwrap();

        // 5/100..=103 share parent 4/25, which has ancestor 3/6.
        assert_eq!(stats.written, 2, "exactly the ancestor chain is written");
        assert!(store.tile_exists(CellId::new(4, 25), TileEncoding::Fits));
        assert!(store.tile_exists(CellId::new(3, 6), TileEncoding::Fits));
        assert!(!store.tile_exists(CellId::new(4, 24), TileEncoding::Fits));
        assert!(!store.tile_exists(CellId::new(3, 5), TileEncoding::Fits));
    }

    #[test]
    fn test_parent_quadrant_values() {
        let dir = tempdir().unwrap();
        let store = TileStore::new(dir.path());
        for (k, value) in [(0u64, 10.0), (1, 20.0), (2, 30.0), (3, 40.0)] {
            write_leaf(&store, 4, k, value);
        }
        let progress = ProgressTracker::new();
        build(&ctx(dir.path(), 4), &progress).unwrap();

        let Some(TileBuf::Numeric(parent)) =
            store.read_tile(CellId::new(3, 0), TileEncoding::Fits).unwrap()
        else {
            panic!("parent tile missing");
        };
        // Child k lands in quadrant (k & 1, k >> 1).
        assert_eq!(parent.get(0, 0), 10.0);
        assert_eq!(parent.get(3, 0), 20.0);
        assert_eq!(parent.get(0, 3), 30.0);
        assert_eq!(parent.get(3, 3), 40.0);
    }

    #[test]
    fn test_empty_leaf_set_builds_nothing() {
        let dir = tempdir().unwrap();
        let store = TileStore::new(dir.path());
        std::fs::create_dir_all(store.order_dir(5)).unwrap();

        let progress = ProgressTracker::new();
        let stats = build(&ctx(dir.path(), 5), &progress).unwrap();
        assert_eq!(stats, PyramidStats::default());
        assert!(store.leaf_cells(4, TileEncoding::Fits).unwrap().is_empty());
        assert!(store.leaf_cells(3, TileEncoding::Fits).unwrap().is_empty());
    }

    #[test]
    fn test_stale_interior_is_pruned() {
        let dir = tempdir().unwrap();
        let store = TileStore::new(dir.path());
        write_leaf(&store, 5, 100, 1.0);
        let progress = ProgressTracker::new();
        build(&ctx(dir.path(), 5), &progress).unwrap();

        // The leaf disappears; its ancestors must go with it.
        store.remove_tile(CellId::new(5, 100), TileEncoding::Fits).unwrap();
        let stats = build(&ctx(dir.path(), 5), &progress).unwrap();
        assert_eq!(stats.pruned, 2);
        assert!(!store.tile_exists(CellId::new(4, 25), TileEncoding::Fits));
        assert!(!store.tile_exists(CellId::new(3, 6), TileEncoding::Fits));
    }

    #[test]
    fn test_unreadable_leaf_is_skipped_not_fatal() {
        let dir = tempdir().unwrap();
        let store = TileStore::new(dir.path());
        write_leaf(&store, 5, 100, 1.0);
        write_leaf(&store, 5, 101, 2.0);

        // Garbage where a sibling tile should be.
        let bad = store.tile_path(CellId::new(5, 102), TileEncoding::Fits);
        std::fs::write(&bad, b"not a tile").unwrap();

        let progress = ProgressTracker::new();
        let stats = build(&ctx(dir.path(), 5), &progress).unwrap();
        assert_eq!(stats.skipped, 1);
        // The readable siblings still build their ancestor chain.
        assert!(store.tile_exists(CellId::new(4, 25), TileEncoding::Fits));
        assert!(store.tile_exists(CellId::new(3, 6), TileEncoding::Fits));
    }

    #[test]
    fn test_region_restricts_persistence() {
        let dir = tempdir().unwrap();
        let store = TileStore::new(dir.path());
        write_leaf(&store, 5, 100, 1.0);
        write_leaf(&store, 5, 2000, 1.0);

        // Region covers only the first branch.
        let region = Moc::from_cells(5, [CellId::new(5, 100)]);
        let c = ctx(dir.path(), 5).with_region(region);
        let progress = ProgressTracker::new();
        build(&c, &progress).unwrap();

        assert!(store.tile_exists(CellId::new(4, 25), TileEncoding::Fits));
        assert!(
            !store.tile_exists(CellId::new(4, 500), TileEncoding::Fits),
            "ancestors of out-of-region leaves are transient"
        );
    }

    #[test]
    fn test_allsky_grid_geometry() {
        let dir = tempdir().unwrap();
        let store = TileStore::new(dir.path());
        for npix in [0u64, 27, 767] {
            write_leaf(&store, 3, npix, 5.0);
        }
        let c = ctx(dir.path(), 3);
        let progress = ProgressTracker::new();
        assert!(build_allsky(&c, &progress).unwrap());

        let allsky = FitsImage::read(&store.allsky_path(TileEncoding::Fits)).unwrap();
        assert_eq!(allsky.width, 27 * 4, "27 columns of tile-width thumbs");
        assert_eq!(allsky.height, 29 * 4, "29 rows cover all 768 cells");
        // npix 27 starts row 1, column 0.
        assert_eq!(allsky.get(0, 4), 5.0);
        assert!(allsky.is_blank(allsky.get(4, 4)), "absent cells stay blank");
    }

    #[test]
    fn test_allsky_without_root_tiles_is_noop() {
        let dir = tempdir().unwrap();
        let progress = ProgressTracker::new();
        assert!(!build_allsky(&ctx(dir.path(), 3), &progress).unwrap());
        assert!(!TileStore::new(dir.path())
            .allsky_path(TileEncoding::Fits)
            .exists());
    }

    #[test]
    fn test_rebuild_is_idempotent() {
        let dir = tempdir().unwrap();
        let store = TileStore::new(dir.path());
        for npix in [100u64, 101] {
            write_leaf(&store, 5, npix, npix as f64);
        }
        let c = ctx(dir.path(), 5);
        let progress = ProgressTracker::new();
        build(&c, &progress).unwrap();
        let first = std::fs::read(store.tile_path(CellId::new(3, 6), TileEncoding::Fits)).unwrap();
        build(&c, &progress).unwrap();
        let second = std::fs::read(store.tile_path(CellId::new(3, 6), TileEncoding::Fits)).unwrap();
        assert_eq!(first, second);
    }
}
