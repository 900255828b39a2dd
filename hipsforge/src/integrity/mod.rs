//! Integrity subsystem: the store-level check code and per-tile checksums.
//!
//! The check code is a cheap structural fingerprint: a single 32-bit value
//! folded from the byte length of every tile in deterministic traversal
//! order (orders ascending, npix ascending), one code per encoding. It
//! detects added, removed, truncated or reordered tiles without reading
//! pixel data; equal-length content changes are its documented blind spot.
//! Content changes are the job of the per-tile FITS DATASUM, which the
//! deep verification recomputes.

use tracing::{info, warn};

use crate::config::{BuildContext, FAST_CHECK_MAX_ORDER, FAST_CHECK_SAMPLE_LIMIT};
use crate::error::{Error, Result};
use crate::fits::{self, DatasumStatus};
use crate::progress::ProgressTracker;
use crate::store::{TileStore, KEY_CHECK_CODE, KEY_EST_SIZE, KEY_NB_TILES};
use crate::tile::TileEncoding;

/// One computed check code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CheckCode {
    pub encoding: TileEncoding,
    pub code: u32,
    /// Tiles folded into the code.
    pub tiles: u64,
    /// Total byte size of those tiles.
    pub bytes: u64,
}

/// Comparison of a recomputed code against the stored one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CodeStatus {
    /// Stored and recomputed codes agree.
    Match(u32),
    /// The store changed since it was stamped.
    Mismatch { stored: u32, computed: u32 },
    /// No code stored for this encoding.
    Unstamped(u32),
}

/// Fold one tile's byte length into a running code.
fn fold_len(h: u64, len: u64) -> u64 {
    h.wrapping_mul(31).wrapping_add(len ^ (len >> 32))
}

/// Finalize a running code with the tile count.
fn finalize(h: u64, count: u64) -> u32 {
    h.wrapping_mul(31).wrapping_add(count) as u32
}

/// Compute one check code per encoding present in the store.
///
/// Traversal is orders ascending, npix ascending, so the result is
/// independent of directory enumeration order.
pub fn compute_check_codes(
    store: &TileStore,
    progress: &ProgressTracker,
) -> Result<Vec<CheckCode>> {
    // Running state per encoding, in first-seen order.
    let mut states: Vec<(TileEncoding, u64, u64, u64)> = Vec::new();

    for order in store.orders()? {
        for tile in store.scan_order(order)? {
            progress.checkpoint()?;
            let Some(encoding) = tile.encoding else { continue };
            let len = std::fs::metadata(&tile.path)?.len();

            let state = match states.iter_mut().find(|(e, ..)| *e == encoding) {
                Some(s) => s,
                None => {
                    states.push((encoding, 0, 0, 0));
                    states.last_mut().unwrap()
                }
            };
            state.1 = fold_len(state.1, len);
            state.2 += 1;
            state.3 += len;
            progress.advance();
        }
    }

    Ok(states
        .into_iter()
        .map(|(encoding, h, tiles, bytes)| CheckCode {
            encoding,
            code: finalize(h, tiles),
            tiles,
            bytes,
        })
        .collect())
}

/// Render codes into the `properties` token form, `ext:code` space-joined.
pub fn format_codes(codes: &[CheckCode]) -> String {
    codes
        .iter()
        .map(|c| format!("{}:{}", c.encoding, c.code))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Parse the stored token form back into per-encoding codes.
fn parse_codes(s: &str) -> Vec<(TileEncoding, u32)> {
    s.split_whitespace()
        .filter_map(|token| {
            let (ext, code) = token.split_once(':')?;
            Some((TileEncoding::from_extension(ext)?, code.parse().ok()?))
        })
        .collect()
}

/// Recompute the check codes and stamp them into `properties`, together
/// with the tile count, the estimated size and a fresh release date.
pub fn stamp(ctx: &BuildContext, progress: &ProgressTracker) -> Result<Vec<CheckCode>> {
    let store = TileStore::new(&ctx.output_root);
    let codes = compute_check_codes(&store, progress)?;

    let mut props = store.properties()?;
    props.set(KEY_CHECK_CODE, format_codes(&codes));
    props.set(
        KEY_NB_TILES,
        codes.iter().map(|c| c.tiles).sum::<u64>().to_string(),
    );
    props.set(
        KEY_EST_SIZE,
        (codes.iter().map(|c| c.bytes).sum::<u64>() / 1024).to_string(),
    );
    props.touch_release_date();
    props.save(&store.properties_path())?;

    for code in &codes {
        info!(encoding = %code.encoding, code = code.code, tiles = code.tiles, "check code stamped");
    }
    Ok(codes)
}

/// Recompute the check codes and compare them against the stored ones.
pub fn verify_check_codes(
    ctx: &BuildContext,
    progress: &ProgressTracker,
) -> Result<Vec<(TileEncoding, CodeStatus)>> {
    let store = TileStore::new(&ctx.output_root);
    let computed = compute_check_codes(&store, progress)?;
    let stored = store
        .properties()?
        .get(KEY_CHECK_CODE)
        .map(parse_codes)
        .unwrap_or_default();

    Ok(computed
        .into_iter()
        .map(|c| {
            let status = match stored.iter().find(|(e, _)| *e == c.encoding) {
                Some(&(_, s)) if s == c.code => CodeStatus::Match(c.code),
                Some(&(_, s)) => CodeStatus::Mismatch {
                    stored: s,
                    computed: c.code,
                },
                None => CodeStatus::Unstamped(c.code),
            };
            (c.encoding, status)
        })
        .collect())
}

// ---------------------------------------------------------------------------
// Deep verification
// ---------------------------------------------------------------------------

/// Outcome of a per-tile checksum scan.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DatasumReport {
    /// Tiles whose checksum (or structure, for visual tiles) verified.
    pub tested: u64,
    /// FITS tiles lacking an embedded DATASUM.
    pub untested: u64,
    /// Tiles whose content no longer matches.
    pub corrupt: u64,
    /// Ones'-complement fold of every valid DATASUM, in traversal order.
    /// A whole-store content fingerprint.
    pub global: u32,
}

/// Recompute every tile checksum (or a bounded sample in fast mode).
///
/// FITS tiles verify their embedded DATASUM; visual tiles verify that the
/// raster still decodes. The scan aborts as soon as the corrupt tolerance
/// is exceeded, and fails at the end when too many tiles carry no checksum
/// at all.
pub fn verify_datasums(ctx: &BuildContext, progress: &ProgressTracker) -> Result<DatasumReport> {
    let store = TileStore::new(&ctx.output_root);
    let orders = store.orders()?;
    let max = if ctx.fast_check {
        FAST_CHECK_MAX_ORDER
    } else {
        u8::MAX
    };

    let mut report = DatasumReport::default();
    // Per-encoding sample counters for the fast mode.
    let mut sampled: Vec<(TileEncoding, u64)> = Vec::new();

    for order in orders.into_iter().filter(|&o| o <= max) {
        for tile in store.scan_order(order)? {
            progress.checkpoint()?;
            let Some(encoding) = tile.encoding else { continue };

            if ctx.fast_check {
                let count = match sampled.iter_mut().find(|(e, _)| *e == encoding) {
                    Some((_, c)) => c,
                    None => {
                        sampled.push((encoding, 0));
                        &mut sampled.last_mut().unwrap().1
                    }
                };
                if *count >= FAST_CHECK_SAMPLE_LIMIT {
                    continue;
                }
                *count += 1;
            }

            progress.set_current(tile.cell.to_string());
            match encoding {
                TileEncoding::Fits => match fits::verify_datasum(&tile.path) {
                    Ok(DatasumStatus::Valid(sum)) => {
                        report.tested += 1;
                        report.global = fits::add_ones_complement(report.global, sum);
                    }
                    Ok(DatasumStatus::Missing) => report.untested += 1,
                    Ok(DatasumStatus::Mismatch { stored, computed }) => {
                        warn!(cell = %tile.cell, stored, computed, "tile checksum mismatch");
                        report.corrupt += 1;
                    }
                    Err(err) if !err.is_abort() => {
                        warn!(cell = %tile.cell, error = %err, "tile unreadable");
                        report.corrupt += 1;
                    }
                    Err(err) => return Err(err),
                },
                TileEncoding::Png | TileEncoding::Jpeg => {
                    if image::image_dimensions(&tile.path).is_ok() {
                        report.tested += 1;
                    } else {
                        warn!(cell = %tile.cell, "visual tile no longer decodes");
                        report.corrupt += 1;
                    }
                }
            }

            if report.corrupt > ctx.corrupt_tolerance {
                return Err(Error::IntegrityLimit {
                    kind: "corrupt",
                    count: report.corrupt,
                    tolerance: ctx.corrupt_tolerance,
                });
            }
            progress.advance();
        }
    }

    if report.untested > ctx.untested_tolerance {
        return Err(Error::IntegrityLimit {
            kind: "untested",
            count: report.untested,
            tolerance: ctx.untested_tolerance,
        });
    }

    info!(
        tested = report.tested,
        untested = report.untested,
        corrupt = report.corrupt,
        global = report.global,
        "checksum scan complete"
    );
    Ok(report)
}
