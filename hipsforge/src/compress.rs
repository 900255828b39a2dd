//! In-place tile compression.
//!
//! FITS tiles compress well and most clients read gzipped FITS
//! transparently, so compression keeps every file name unchanged and only
//! swaps the content. Both directions are idempotent: already-compressed
//! files are skipped on the way in, plain files on the way out.

use std::fs;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use tracing::info;

use crate::config::BuildContext;
use crate::error::Result;
use crate::progress::ProgressTracker;
use crate::store::TileStore;
use crate::tile::TileEncoding;

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

fn is_gzipped(path: &Path) -> Result<bool> {
    let mut magic = [0u8; 2];
    let mut file = fs::File::open(path)?;
    match file.read_exact(&mut magic) {
        Ok(()) => Ok(magic == GZIP_MAGIC),
        // Shorter than two bytes: certainly not gzip.
        Err(_) => Ok(false),
    }
}

/// Every FITS file a compression pass touches: all tiles plus the all-sky
/// preview.
fn fits_files(store: &TileStore) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    for order in store.orders()? {
        for tile in store.scan_order(order)? {
            if tile.encoding == Some(TileEncoding::Fits) {
                files.push(tile.path);
            }
        }
    }
    let allsky = store.allsky_path(TileEncoding::Fits);
    if allsky.is_file() {
        files.push(allsky);
    }
    Ok(files)
}

/// Whether every FITS file in the store already satisfies `want_gzipped`.
/// Best-effort: unreadable files and empty stores answer `false`, leaving
/// the decision to a real pass.
fn tree_converged(ctx: &BuildContext, want_gzipped: bool) -> bool {
    let store = TileStore::new(&ctx.output_root);
    match fits_files(&store) {
        Ok(files) if !files.is_empty() => files
            .iter()
            .all(|p| is_gzipped(p).map(|g| g == want_gzipped).unwrap_or(false)),
        _ => false,
    }
}

/// True when every FITS tile is already gzip-compressed.
pub fn tree_is_gzipped(ctx: &BuildContext) -> bool {
    tree_converged(ctx, true)
}

/// True when every FITS tile is already in plain form.
pub fn tree_is_plain(ctx: &BuildContext) -> bool {
    tree_converged(ctx, false)
}

/// Replace `path` with the transformed bytes, via a sibling temp file so a
/// crash never leaves a half-written tile.
fn swap_in(path: &Path, bytes: &[u8]) -> Result<()> {
    let tmp = path.with_extension("tmp");
    fs::write(&tmp, bytes)?;
    fs::rename(&tmp, path)?;
    Ok(())
}

/// Gzip every FITS tile in place. Returns the number of files compressed.
pub fn gzip_tree(ctx: &BuildContext, progress: &ProgressTracker) -> Result<u64> {
    let store = TileStore::new(&ctx.output_root);
    let files = fits_files(&store)?;
    progress.begin(files.len() as u64);

    let mut compressed = 0;
    for path in files {
        progress.checkpoint()?;
        progress.set_current(path.display().to_string());
        if !is_gzipped(&path)? {
            let plain = fs::read(&path)?;
            let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
            encoder.write_all(&plain)?;
            swap_in(&path, &encoder.finish()?)?;
            compressed += 1;
        }
        progress.advance();
    }
    info!(compressed, "tile tree gzipped");
    Ok(compressed)
}

/// Gunzip every FITS tile in place. Returns the number of files expanded.
pub fn gunzip_tree(ctx: &BuildContext, progress: &ProgressTracker) -> Result<u64> {
    let store = TileStore::new(&ctx.output_root);
    let files = fits_files(&store)?;
    progress.begin(files.len() as u64);

    let mut expanded = 0;
    for path in files {
        progress.checkpoint()?;
        progress.set_current(path.display().to_string());
        if is_gzipped(&path)? {
            let mut plain = Vec::new();
            GzDecoder::new(fs::File::open(&path)?).read_to_end(&mut plain)?;
            swap_in(&path, &plain)?;
            expanded += 1;
        }
        progress.advance();
    }
    info!(expanded, "tile tree gunzipped");
    Ok(expanded)
}
