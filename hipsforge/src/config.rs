//! Build configuration.
//!
//! A [`BuildContext`] is an immutable value describing one build: it is
//! passed by reference into every operation, alongside a separate
//! [`crate::progress::ProgressTracker`] for the mutable progress/abort
//! surface. No ambient global state exists.

use std::path::PathBuf;

use crate::cell::ROOT_ORDER;
use crate::merge::MergePolicy;
use crate::moc::Moc;
use crate::tile::{AggKernel, TileEncoding};
use crate::wcs::Frame;

/// Default side length of a tile's pixel grid.
pub const DEFAULT_TILE_WIDTH: u32 = 512;

/// Default tolerance for tiles lacking an embedded checksum.
pub const DEFAULT_UNTESTED_TOLERANCE: u64 = 1_000;

/// Default tolerance for corrupt tiles before the scan aborts.
pub const DEFAULT_CORRUPT_TOLERANCE: u64 = 10;

/// Deepest order visited by the fast checksum mode.
pub const FAST_CHECK_MAX_ORDER: u8 = 5;

/// Sample cap per encoding in the fast checksum mode.
pub const FAST_CHECK_SAMPLE_LIMIT: u64 = 256;

/// Immutable configuration for one engine invocation.
#[derive(Debug, Clone)]
pub struct BuildContext {
    /// Root of the pyramid store being built or verified.
    pub output_root: PathBuf,

    /// Second root: the source-image directory for indexing, or the
    /// incoming store for a merge.
    pub input_root: Option<PathBuf>,

    /// Leaf order of the pyramid. When unset, validation derives it from
    /// the `Norder*` directories already present.
    pub leaf_order: Option<u8>,

    /// Coarsest order of the pyramid; conventionally 3.
    pub min_order: u8,

    /// Pixel grid width of every tile.
    pub tile_width: u32,

    /// Tile encoding this invocation operates on.
    pub encoding: TileEncoding,

    /// Aggregation kernel override; `None` uses the encoding's default
    /// (mean for scientific tiles, middle pick for visual ones).
    pub kernel: Option<AggKernel>,

    /// Sky reference frame of the store.
    pub frame: Frame,

    /// Mosaic mode: split source images into sub-cells of this pixel size
    /// while indexing, to bound memory on huge inputs.
    pub mosaic_cell: Option<u32>,

    /// Target coverage region: tiles outside it are computed transiently
    /// but never persisted. `None` means no restriction.
    pub region: Option<Moc>,

    /// Pixel/tile combination policy for merges.
    pub merge_policy: MergePolicy,

    /// Restrict checksum verification to the first orders and a bounded
    /// sample instead of every tile.
    pub fast_check: bool,

    /// How many checksum-less tiles are tolerated before the scan fails.
    pub untested_tolerance: u64,

    /// How many corrupt tiles are tolerated before the scan aborts early.
    pub corrupt_tolerance: u64,
}

impl Default for BuildContext {
    fn default() -> Self {
        BuildContext {
            output_root: PathBuf::new(),
            input_root: None,
            leaf_order: None,
            min_order: ROOT_ORDER,
            tile_width: DEFAULT_TILE_WIDTH,
            encoding: TileEncoding::Fits,
            kernel: None,
            frame: Frame::Equatorial,
            mosaic_cell: None,
            region: None,
            merge_policy: MergePolicy::Average,
            fast_check: false,
            untested_tolerance: DEFAULT_UNTESTED_TOLERANCE,
            corrupt_tolerance: DEFAULT_CORRUPT_TOLERANCE,
        }
    }
}

impl BuildContext {
    /// Context for a store rooted at `output_root`, with defaults elsewhere.
    pub fn new(output_root: impl Into<PathBuf>) -> BuildContext {
        BuildContext {
            output_root: output_root.into(),
            ..BuildContext::default()
        }
    }

    pub fn with_input(mut self, input_root: impl Into<PathBuf>) -> Self {
        self.input_root = Some(input_root.into());
        self
    }

    pub fn with_leaf_order(mut self, order: u8) -> Self {
        self.leaf_order = Some(order);
        self
    }

    pub fn with_encoding(mut self, encoding: TileEncoding) -> Self {
        self.encoding = encoding;
        self
    }

    pub fn with_tile_width(mut self, width: u32) -> Self {
        self.tile_width = width;
        self
    }

    pub fn with_region(mut self, region: Moc) -> Self {
        self.region = Some(region);
        self
    }

    pub fn with_merge_policy(mut self, policy: MergePolicy) -> Self {
        self.merge_policy = policy;
        self
    }

    /// The kernel in effect for this context's encoding.
    pub fn effective_kernel(&self) -> AggKernel {
        self.kernel.unwrap_or_else(|| self.encoding.default_kernel())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let ctx = BuildContext::new("/data/out");
        assert_eq!(ctx.min_order, 3);
        assert_eq!(ctx.tile_width, 512);
        assert_eq!(ctx.encoding, TileEncoding::Fits);
        assert_eq!(ctx.effective_kernel(), AggKernel::Mean);
        assert!(ctx.region.is_none());
    }

    #[test]
    fn test_builder_methods() {
        let ctx = BuildContext::new("/data/out")
            .with_input("/data/in")
            .with_leaf_order(9)
            .with_encoding(TileEncoding::Png);
        assert_eq!(ctx.leaf_order, Some(9));
        assert_eq!(ctx.effective_kernel(), AggKernel::Middle);
        assert!(ctx.input_root.is_some());
    }
}
