//! Spatial indexer.
//!
//! Maps each calibrated source image onto the leaf cells its footprint
//! overlaps and appends a provenance record per cell under the `HpxFinder`
//! tree. Indexing is append-only and resume-safe: sources are visited in
//! sorted name order and the last fully processed name is checkpointed, so
//! a restart skips everything up to and including it.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::cell::{disk_cover, CellId};
use crate::config::BuildContext;
use crate::error::{Error, Result};
use crate::progress::ProgressTracker;
use crate::sphere;
use crate::store::TileStore;
use crate::wcs::{Frame, Wcs};

/// Pixel margin around the image bounding box accepted during refinement.
const BBOX_MARGIN: f64 = 2.0;

/// One provenance entry: a source file that contributes to a cell.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IndexRecord {
    /// Source identifier; the file stem, plus a `[x,y]` suffix for mosaic
    /// sub-cells.
    pub name: String,
    /// Source file path.
    pub path: String,
    /// Sky footprint as an STC polygon string, for provenance display.
    pub stc: String,
}

/// A calibrated source image.
#[derive(Debug, Clone)]
pub struct SourceImage {
    pub path: PathBuf,
    pub wcs: Wcs,
    pub width: u32,
    pub height: u32,
}

impl SourceImage {
    /// Read calibration and dimensions from a FITS header.
    pub fn load(path: &Path) -> Result<SourceImage> {
        let header = crate::fits::read_header(path)?;
        let width = header
            .get_i64("NAXIS1")
            .ok_or_else(|| Error::fits(path, "missing NAXIS1"))? as u32;
        let height = header
            .get_i64("NAXIS2")
            .ok_or_else(|| Error::fits(path, "missing NAXIS2"))? as u32;
        let wcs = Wcs::from_header(&header, width, height)
            .ok_or_else(|| Error::fits(path, "missing or unsupported WCS calibration"))?;
        Ok(SourceImage {
            path: path.to_path_buf(),
            wcs,
            width,
            height,
        })
    }
}

/// Counters reported at the end of an indexing run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IndexStats {
    /// Sources fully processed in this run.
    pub sources: u64,
    /// Sources skipped because they were unreadable or uncalibrated.
    pub skipped: u64,
    /// Provenance records appended.
    pub records: u64,
}

/// Index every source image under `ctx.input_root` onto the leaf cells of
/// the store at `ctx.output_root`.
pub fn run(ctx: &BuildContext, progress: &ProgressTracker) -> Result<IndexStats> {
    let input = ctx
        .input_root
        .as_ref()
        .ok_or_else(|| Error::Config("indexing requires an input directory".to_string()))?;
    let order = ctx
        .leaf_order
        .ok_or_else(|| Error::Config("indexing requires a leaf order".to_string()))?;
    let store = TileStore::new(&ctx.output_root);

    let sources = list_sources(input)?;
    progress.begin(sources.len() as u64);

    let checkpoint_path = store.index_checkpoint_path();
    let checkpoint = fs::read_to_string(&checkpoint_path)
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty());
    if let Some(last) = &checkpoint {
        info!(last = %last, "resuming index after checkpoint");
    }

    let mut stats = IndexStats::default();
    for path in sources {
        progress.checkpoint()?;
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        if let Some(last) = &checkpoint {
            if name.as_str() <= last.as_str() {
                progress.advance();
                continue;
            }
        }
        progress.set_current(path.display().to_string());

        match SourceImage::load(&path) {
            Ok(source) => {
                stats.records += index_source(&store, ctx, order, &source, progress)?;
                stats.sources += 1;
            }
            Err(err) if !err.is_abort() => {
                // A single bad source never aborts the whole index.
                warn!(path = %path.display(), error = %err, "skipping unreadable source");
                stats.skipped += 1;
            }
            Err(err) => return Err(err),
        }

        fs::create_dir_all(store.index_root())?;
        fs::write(&checkpoint_path, &name)?;
        progress.advance();
    }

    info!(
        sources = stats.sources,
        skipped = stats.skipped,
        records = stats.records,
        "indexing complete"
    );
    Ok(stats)
}

/// Source files under `input`, sorted by file name.
fn list_sources(input: &Path) -> Result<Vec<PathBuf>> {
    let mut sources = Vec::new();
    for entry in fs::read_dir(input)? {
        let entry = entry?;
        let path = entry.path();
        let is_fits = path
            .extension()
            .map(|e| {
                let e = e.to_string_lossy().to_ascii_lowercase();
                e == "fits" || e == "fit"
            })
            .unwrap_or(false);
        if path.is_file() && is_fits {
            sources.push(path);
        }
    }
    sources.sort_by_key(|p| p.file_name().map(|n| n.to_os_string()));
    Ok(sources)
}

/// Index one source, splitting it into mosaic sub-cells when configured.
fn index_source(
    store: &TileStore,
    ctx: &BuildContext,
    order: u8,
    source: &SourceImage,
    progress: &ProgressTracker,
) -> Result<u64> {
    let stem = source
        .path
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_default();

    let step = match ctx.mosaic_cell {
        Some(s) if source.width.max(source.height) > s => s,
        _ => {
            return index_footprint(
                store,
                ctx,
                order,
                source,
                &stem,
                (0, 0, source.width, source.height),
                progress,
            );
        }
    };

    let mut records = 0;
    let mut cy = 0;
    while cy < source.height {
        let h = step.min(source.height - cy);
        let mut cx = 0;
        while cx < source.width {
            progress.checkpoint()?;
            let w = step.min(source.width - cx);
            let name = format!("{stem}[{cx},{cy}]");
            records += index_footprint(store, ctx, order, source, &name, (cx, cy, w, h), progress)?;
            cx += step;
        }
        cy += step;
    }
    Ok(records)
}

/// Index one rectangular footprint of a source image.
fn index_footprint(
    store: &TileStore,
    ctx: &BuildContext,
    order: u8,
    source: &SourceImage,
    name: &str,
    rect: (u32, u32, u32, u32),
    progress: &ProgressTracker,
) -> Result<u64> {
    let (x0, y0, w, h) = rect;
    let (x0, y0, w, h) = (x0 as f64, y0 as f64, w as f64, h as f64);

    // Corner polygon on sky, in the store frame.
    let corner_pixels = [
        (x0, y0),
        (x0 + w, y0),
        (x0 + w, y0 + h),
        (x0, y0 + h),
    ];
    let mut corners = [[0.0f64; 3]; 4];
    for (i, &(px, py)) in corner_pixels.iter().enumerate() {
        let (lon, lat) = source.wcs.pixel_to_lonlat(px, py);
        corners[i] = Frame::Equatorial.convert(ctx.frame, sphere::lonlat_to_xyz(lon, lat));
    }

    let center = sphere::mean_direction(&corners);
    let radius = corners
        .iter()
        .map(|&c| sphere::angular_distance(center, c))
        .fold(0.0_f64, f64::max);
    let (clon, clat) = sphere::xyz_to_lonlat(center);

    // Coarse query, then per-cell refinement.
    let candidates = disk_cover(clon, clat, radius, order);
    debug!(name, candidates = candidates.len(), "refining coarse cover");

    let stc = footprint_stc(&corners);
    let record = IndexRecord {
        name: name.to_string(),
        path: source.path.display().to_string(),
        stc,
    };

    let mut appended = 0;
    for cell in candidates {
        progress.checkpoint()?;
        if !cell_overlaps(source, ctx.frame, cell, (x0, y0, w, h)) {
            continue;
        }
        if append_record(store, cell, &record)? {
            appended += 1;
        }
    }
    Ok(appended)
}

/// Containment refinement: project the cell's own corners back into image
/// pixel space and test them against the footprint bounding box.
fn cell_overlaps(source: &SourceImage, frame: Frame, cell: CellId, bbox: (f64, f64, f64, f64)) -> bool {
    let (x0, y0, w, h) = bbox;
    let mut side_x = [0i32; 4];
    let mut side_y = [0i32; 4];
    let mut projected = 0;

    for (i, (vlon, vlat)) in cell.vertices().into_iter().enumerate() {
        // Cell vertices live in the store frame; go back to the image frame.
        let v = frame.convert(Frame::Equatorial, sphere::lonlat_to_xyz(vlon, vlat));
        let (lon, lat) = sphere::xyz_to_lonlat(v);
        let Some((px, py)) = source.wcs.lonlat_to_pixel(lon, lat) else {
            // Unprojectable corner: unknown side, cannot claim rejection.
            side_x[i] = 2;
            side_y[i] = 2;
            continue;
        };
        projected += 1;

        if px >= x0 - BBOX_MARGIN
            && px <= x0 + w + BBOX_MARGIN
            && py >= y0 - BBOX_MARGIN
            && py <= y0 + h + BBOX_MARGIN
        {
            return true;
        }
        side_x[i] = if px < x0 {
            -1
        } else if px > x0 + w {
            1
        } else {
            0
        };
        side_y[i] = if py < y0 {
            -1
        } else if py > y0 + h {
            1
        } else {
            0
        };
    }

    if projected == 0 {
        // Entirely on the far hemisphere.
        return false;
    }

    // All four corners strictly on one side of the box: a false positive
    // from the coarse query, discard without further work.
    let one_side = |sides: &[i32; 4]| sides[0].abs() == 1 && sides.iter().all(|&s| s == sides[0]);
    if one_side(&side_x) || one_side(&side_y) {
        return false;
    }

    // Corners straddle the box (the cell is larger than the footprint).
    true
}

/// STC polygon footprint string in degrees, store frame.
fn footprint_stc(corners: &[[f64; 3]; 4]) -> String {
    let mut s = String::from("Polygon J2000");
    for &c in corners {
        let (lon, lat) = sphere::xyz_to_lonlat(c);
        s.push_str(&format!(" {:.6} {:.6}", lon.to_degrees(), lat.to_degrees()));
    }
    s
}

/// Append a record to a cell's provenance file unless an entry with the
/// same name is already present. Returns whether a line was written.
pub fn append_record(store: &TileStore, cell: CellId, record: &IndexRecord) -> Result<bool> {
    let path = store.index_record_path(cell);
    if path.is_file() {
        for line in fs::read_to_string(&path)?.lines() {
            if let Ok(existing) = serde_json::from_str::<IndexRecord>(line) {
                if existing.name == record.name {
                    return Ok(false);
                }
            }
        }
    } else if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }

    let mut file = fs::OpenOptions::new().create(true).append(true).open(&path)?;
    let line = serde_json::to_string(record)?;
    writeln!(file, "{line}")?;
    Ok(true)
}

/// Read every record of a cell (absent file yields an empty list).
pub fn read_records(store: &TileStore, cell: CellId) -> Result<Vec<IndexRecord>> {
    let path = store.index_record_path(cell);
    if !path.is_file() {
        return Ok(Vec::new());
    }
    let mut records = Vec::new();
    for line in fs::read_to_string(&path)?.lines() {
        if line.trim().is_empty() {
            continue;
        }
        records.push(serde_json::from_str(line)?);
    }
    Ok(records)
}

/// Summarize leaf provenance records into a coarser order: each record file
/// is folded (union, deduplicated by name) into its ancestor's file.
pub fn summarize(store: &TileStore, from_order: u8, to_order: u8, progress: &ProgressTracker) -> Result<()> {
    debug_assert!(to_order < from_order);
    let index = store.index_store();
    for entry in index.scan_order(from_order)? {
        progress.checkpoint()?;
        if entry.path.extension().is_some() {
            continue;
        }
        let ancestor = entry.cell.ancestor_at(to_order);
        for record in read_records(store, entry.cell)? {
            append_record(store, ancestor, &record)?;
        }
    }
    Ok(())
}
