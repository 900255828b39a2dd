//! Merge engine: fold one pyramid store into another.
//!
//! Only the leaf tiles are combined; everything derived from them (the
//! interior orders, the coverage map, the all-sky preview and the
//! provenance summaries) is regenerated afterwards so the merged store is
//! indistinguishable from one built in a single pass.
//!
//! Compatibility is checked before the first write: a merge either starts
//! cleanly or leaves the output untouched.

use std::fmt;
use std::str::FromStr;

use tracing::{debug, info, warn};

use crate::cell::CellId;
use crate::config::BuildContext;
use crate::error::{Error, Result};
use crate::index;
use crate::moc::{builder, Moc};
use crate::progress::ProgressTracker;
use crate::pyramid;
use crate::store::{Properties, TileStore, KEY_FRAME};
use crate::tile::{TileBuf, TileEncoding};

/// Pixel/tile combination policy for a merge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MergePolicy {
    /// Incoming tile replaces the existing one wholesale.
    ReplaceTile,
    /// Existing tile wins wholesale; incoming fills gaps only.
    KeepTile,
    /// Per pixel, mean of the non-blank contributors.
    #[default]
    Average,
    /// Per pixel, incoming wins unless blank.
    Overwrite,
    /// Per pixel, existing wins unless blank.
    Keep,
}

impl MergePolicy {
    pub const ALL: [MergePolicy; 5] = [
        MergePolicy::ReplaceTile,
        MergePolicy::KeepTile,
        MergePolicy::Average,
        MergePolicy::Overwrite,
        MergePolicy::Keep,
    ];

    fn label(self) -> &'static str {
        match self {
            MergePolicy::ReplaceTile => "replacetile",
            MergePolicy::KeepTile => "keeptile",
            MergePolicy::Average => "average",
            MergePolicy::Overwrite => "overwrite",
            MergePolicy::Keep => "keep",
        }
    }
}

impl fmt::Display for MergePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

impl FromStr for MergePolicy {
    type Err = Error;

    fn from_str(s: &str) -> Result<MergePolicy> {
        let wanted = s.to_ascii_lowercase();
        MergePolicy::ALL
            .into_iter()
            .find(|p| p.label() == wanted)
            .ok_or_else(|| Error::Config(format!("unknown merge policy '{s}'")))
    }
}

/// Counters from one merge run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MergeStats {
    /// Leaf tiles copied verbatim (no counterpart, or tile-level replace).
    pub copied: u64,
    /// Leaf tiles combined pixel by pixel.
    pub combined: u64,
    /// Incoming leaf tiles discarded because the existing one wins.
    pub kept: u64,
    /// Cells skipped because a tile on either side could not be read.
    pub skipped: u64,
}

/// Merge the store at `ctx.input_root` into the one at `ctx.output_root`.
pub fn run(ctx: &BuildContext, progress: &ProgressTracker) -> Result<MergeStats> {
    let input = ctx
        .input_root
        .as_ref()
        .ok_or_else(|| Error::Config("merging requires an incoming store".to_string()))?;
    let out = TileStore::new(&ctx.output_root);
    let inc = TileStore::new(input);
    let encoding: TileEncoding = ctx.encoding;
    let policy = ctx.merge_policy;

    let leaf = check_compatibility(&out, &inc, ctx)?;
    info!(leaf, policy = %policy, incoming = %input.display(), "merging stores");

    let (in_moc, _) = builder::from_tile_tree(&inc, leaf, Some(encoding), progress)?;
    let (out_moc, _) = builder::from_tile_tree(&out, leaf, Some(encoding), progress)?;

    let incoming_cells = in_moc.leaf_cells();
    progress.begin(incoming_cells.len() as u64);

    let mut stats = MergeStats::default();
    for cell in incoming_cells {
        progress.checkpoint()?;
        progress.set_current(cell.to_string());
        // One corrupt tile on either side skips the cell, never the merge.
        let incoming = match inc.read_tile(cell, encoding) {
            Ok(Some(tile)) => tile,
            Ok(None) => {
                progress.advance();
                continue;
            }
            Err(err) if !err.is_abort() => {
                warn!(cell = %cell, error = %err, "skipping unreadable incoming tile");
                stats.skipped += 1;
                progress.advance();
                continue;
            }
            Err(err) => return Err(err),
        };
        let existing = match out.read_tile(cell, encoding) {
            Ok(tile) => tile,
            Err(err) if !err.is_abort() => {
                warn!(cell = %cell, error = %err, "skipping unreadable existing tile");
                stats.skipped += 1;
                progress.advance();
                continue;
            }
            Err(err) => return Err(err),
        };

        match (existing, policy) {
            (None, _) | (Some(_), MergePolicy::ReplaceTile) => {
                out.write_tile(cell, encoding, &incoming)?;
                stats.copied += 1;
            }
            (Some(_), MergePolicy::KeepTile) => {
                stats.kept += 1;
            }
            (Some(mut existing), _) => {
                combine_tiles(&mut existing, &incoming, policy);
                out.write_tile(cell, encoding, &existing)?;
                stats.combined += 1;
            }
        }

        merge_provenance(&out, &inc, cell, policy)?;
        progress.advance();
    }

    rebuild_derived(ctx, &out, &out_moc, &in_moc, leaf, progress)?;

    info!(
        copied = stats.copied,
        combined = stats.combined,
        kept = stats.kept,
        skipped = stats.skipped,
        "merge complete"
    );
    Ok(stats)
}

/// Verify the two stores can be merged; returns the common leaf order.
/// Runs entirely before the first write.
fn check_compatibility(out: &TileStore, inc: &TileStore, ctx: &BuildContext) -> Result<u8> {
    let incompatible = |reason: String| Error::IncompatibleStores(reason);

    let in_leaf = inc
        .max_order()?
        .ok_or_else(|| incompatible("incoming store has no tile orders".to_string()))?;
    let leaf = match (ctx.leaf_order, out.max_order()?) {
        (Some(o), _) | (None, Some(o)) => {
            if o != in_leaf {
                return Err(incompatible(format!(
                    "leaf orders differ: existing {o}, incoming {in_leaf}"
                )));
            }
            o
        }
        // Merging into an empty store adopts the incoming geometry.
        (None, None) => in_leaf,
    };

    let out_props = out.properties()?;
    let inc_props = inc.properties()?;
    if let (Some(a), Some(b)) = (out_props.get(KEY_FRAME), inc_props.get(KEY_FRAME)) {
        if a != b {
            return Err(incompatible(format!("frames differ: existing {a}, incoming {b}")));
        }
    }

    let sample = |store: &TileStore| -> Result<Option<TileBuf>> {
        match store.leaf_cells(leaf, ctx.encoding)?.first() {
            Some(&cell) => store.read_tile(cell, ctx.encoding),
            None => Ok(None),
        }
    };
    if let (Some(a), Some(b)) = (sample(out)?, sample(inc)?) {
        if a.width() != b.width() {
            return Err(incompatible(format!(
                "tile widths differ: existing {}, incoming {}",
                a.width(),
                b.width()
            )));
        }
        if let (TileBuf::Numeric(a), TileBuf::Numeric(b)) = (&a, &b) {
            if a.bitpix != b.bitpix {
                return Err(incompatible(format!(
                    "pixel encodings differ: existing BITPIX {}, incoming {}",
                    a.bitpix, b.bitpix
                )));
            }
        }
    }
    Ok(leaf)
}

/// Combine one incoming tile into the existing one, pixel by pixel.
fn combine_tiles(existing: &mut TileBuf, incoming: &TileBuf, policy: MergePolicy) {
    match (existing, incoming) {
        (TileBuf::Numeric(a), TileBuf::Numeric(b)) => {
            for y in 0..a.height.min(b.height) {
                for x in 0..a.width.min(b.width) {
                    let va = a.get(x, y);
                    let vb = b.get(x, y);
                    let blank_a = a.is_blank(va);
                    let blank_b = b.is_blank(vb);
                    let v = match (policy, blank_a, blank_b) {
                        (_, true, true) => continue,
                        (_, true, false) => vb,
                        (_, false, true) => continue,
                        (MergePolicy::Average, false, false) => (va + vb) / 2.0,
                        (MergePolicy::Overwrite, false, false) => vb,
                        // Keep, and the tile-level policies never reach here.
                        (_, false, false) => continue,
                    };
                    a.set(x, y, v);
                }
            }
        }
        (TileBuf::Visual(a), TileBuf::Visual(b)) => {
            let w = a.width().min(b.width());
            let h = a.image.height().min(b.image.height());
            for y in 0..h {
                for x in 0..w {
                    let pa = *a.image.get_pixel(x, y);
                    let pb = *b.image.get_pixel(x, y);
                    let p = match (policy, pa[3] == 0, pb[3] == 0) {
                        (_, true, true) => continue,
                        (_, true, false) => pb,
                        (_, false, true) => continue,
                        (MergePolicy::Average, false, false) => image::Rgba([
                            ((pa[0] as u16 + pb[0] as u16) / 2) as u8,
                            ((pa[1] as u16 + pb[1] as u16) / 2) as u8,
                            ((pa[2] as u16 + pb[2] as u16) / 2) as u8,
                            pa[3].max(pb[3]),
                        ]),
                        (MergePolicy::Overwrite, false, false) => pb,
                        (_, false, false) => continue,
                    };
                    a.image.put_pixel(x, y, p);
                }
            }
        }
        _ => debug_assert!(false, "mixed tile encodings in merge"),
    }
}

/// Carry the incoming provenance records across. Tile-level replace also
/// replaces the record file; every other policy takes the union.
fn merge_provenance(out: &TileStore, inc: &TileStore, cell: CellId, policy: MergePolicy) -> Result<()> {
    let records = index::read_records(inc, cell)?;
    if records.is_empty() {
        return Ok(());
    }
    if policy == MergePolicy::ReplaceTile {
        let path = out.index_record_path(cell);
        if path.is_file() {
            std::fs::remove_file(&path)?;
        }
    }
    for record in &records {
        index::append_record(out, cell, record)?;
    }
    Ok(())
}

/// Regenerate everything the merged leaves invalidated.
fn rebuild_derived(
    ctx: &BuildContext,
    out: &TileStore,
    out_moc: &Moc,
    in_moc: &Moc,
    leaf: u8,
    progress: &ProgressTracker,
) -> Result<()> {
    let union = out_moc.union(in_moc);

    let mut rebuild_ctx = ctx.clone();
    rebuild_ctx.leaf_order = Some(leaf);
    rebuild_ctx.region = Some(union.clone());
    pyramid::build(&rebuild_ctx, progress)?;

    union.write_fits(&out.moc_path())?;
    pyramid::build_allsky(&rebuild_ctx, progress)?;

    // Provenance coverage and summaries, when an index tree is present.
    if out.index_root().is_dir() {
        let index_moc = builder::from_index_tree(out, leaf, progress)?;
        if !index_moc.is_empty() {
            index_moc.write_fits(&out.index_moc_path())?;
        }
        // A coarser summary is regenerated only where one already existed;
        // merging never mints one.
        let index = out.index_store();
        let had_summary = index
            .orders()?
            .into_iter()
            .any(|o| o < leaf);
        if had_summary && leaf > ctx.min_order {
            index::summarize(out, leaf, ctx.min_order, progress)?;
        }
    }

    let mut props: Properties = out.properties()?;
    props.touch_release_date();
    props.save(&out.properties_path())?;
    debug!("derived products regenerated");
    Ok(())
}
