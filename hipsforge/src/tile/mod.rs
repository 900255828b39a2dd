//! Tile buffers and the aggregation kernels.
//!
//! Two kernels fold a 2×2 block of child samples into one parent sample:
//!
//! - [`weighted_mean`] averages the non-blank samples (each weight 1, blank
//!   weight 0) and yields blank only when all four are blank. Used for
//!   scientific tiles.
//! - [`middle_pick`] selects a sample that is neither the minimum nor the
//!   maximum of the block, falling through to the last candidate in the
//!   fixed evaluation order on ties. Used for visual tiles (and visual
//!   derivation of scientific data) because it preserves faint point
//!   sources that averaging would dilute. The tie behavior is preserved
//!   exactly as the production pipeline has always behaved; downstream
//!   imagery depends on its bias.

use std::fmt;
use std::path::Path;

use image::{Rgba, RgbaImage};

use crate::error::{Error, Result};
use crate::fits::FitsImage;

/// Aggregation kernel selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AggKernel {
    /// Blank-aware weighted mean.
    #[default]
    Mean,
    /// Order-statistic middle pick.
    Middle,
}

/// On-disk encoding of a tile.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TileEncoding {
    /// Numeric/scientific FITS tile.
    Fits,
    /// 8-bit visual PNG tile.
    Png,
    /// 8-bit visual JPEG tile.
    Jpeg,
}

impl TileEncoding {
    /// File extension used by the directory layout.
    pub fn extension(self) -> &'static str {
        match self {
            TileEncoding::Fits => "fits",
            TileEncoding::Png => "png",
            TileEncoding::Jpeg => "jpg",
        }
    }

    /// Recognize an extension from a scanned file name.
    pub fn from_extension(ext: &str) -> Option<TileEncoding> {
        match ext.to_ascii_lowercase().as_str() {
            "fits" => Some(TileEncoding::Fits),
            "png" => Some(TileEncoding::Png),
            "jpg" | "jpeg" => Some(TileEncoding::Jpeg),
            _ => None,
        }
    }

    /// True for the 8-bit raster encodings.
    pub fn is_visual(self) -> bool {
        !matches!(self, TileEncoding::Fits)
    }

    /// The kernel the aggregator uses for this encoding by default.
    pub fn default_kernel(self) -> AggKernel {
        if self.is_visual() {
            AggKernel::Middle
        } else {
            AggKernel::Mean
        }
    }
}

impl fmt::Display for TileEncoding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.extension())
    }
}

// ---------------------------------------------------------------------------
// Kernels
// ---------------------------------------------------------------------------

fn is_blank(v: f64, blank: Option<f64>) -> bool {
    v.is_nan() || blank.map(|b| v == b).unwrap_or(false)
}

/// Mean of the non-blank samples of a 2×2 block; blank iff all are blank.
pub fn weighted_mean(vals: [f64; 4], blank: Option<f64>) -> f64 {
    let mut sum = 0.0;
    let mut weight = 0u32;
    for v in vals {
        if !is_blank(v, blank) {
            sum += v;
            weight += 1;
        }
    }
    if weight == 0 {
        blank.unwrap_or(f64::NAN)
    } else {
        sum / weight as f64
    }
}

/// Middle pick of a 2×2 block: the first sample, in evaluation order, that
/// equals neither the block minimum nor the block maximum; on degenerate
/// ties the last non-blank sample. Blank iff all are blank.
pub fn middle_pick(vals: [f64; 4], blank: Option<f64>) -> f64 {
    let mut candidates = [0.0f64; 4];
    let mut n = 0;
    for v in vals {
        if !is_blank(v, blank) {
            candidates[n] = v;
            n += 1;
        }
    }
    if n == 0 {
        return blank.unwrap_or(f64::NAN);
    }
    let candidates = &candidates[..n];
    let min = candidates.iter().cloned().fold(f64::INFINITY, f64::min);
    let max = candidates.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
    for &v in candidates {
        if v != min && v != max {
            return v;
        }
    }
    candidates[n - 1]
}

// ---------------------------------------------------------------------------
// Buffers
// ---------------------------------------------------------------------------

/// A visual 8-bit tile. Alpha 0 marks missing data.
#[derive(Debug, Clone)]
pub struct VisualTile {
    pub image: RgbaImage,
}

impl VisualTile {
    /// A fully transparent (missing) tile.
    pub fn empty(width: u32) -> VisualTile {
        VisualTile {
            image: RgbaImage::from_pixel(width, width, Rgba([0, 0, 0, 0])),
        }
    }

    pub fn width(&self) -> u32 {
        self.image.width()
    }

    pub fn read(path: &Path) -> Result<VisualTile> {
        let image = image::open(path)?.to_rgba8();
        Ok(VisualTile { image })
    }

    pub fn write(&self, path: &Path, encoding: TileEncoding) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        match encoding {
            TileEncoding::Png => self.image.save_with_format(path, image::ImageFormat::Png)?,
            TileEncoding::Jpeg => {
                // JPEG has no alpha channel.
                let rgb = image::DynamicImage::ImageRgba8(self.image.clone()).to_rgb8();
                rgb.save_with_format(path, image::ImageFormat::Jpeg)?;
            }
            TileEncoding::Fits => {
                return Err(Error::Config(
                    "visual tile cannot be written with the fits encoding".to_string(),
                ));
            }
        }
        Ok(())
    }
}

/// A tile buffer of either encoding family, as moved through the aggregator.
#[derive(Debug, Clone)]
pub enum TileBuf {
    Numeric(FitsImage),
    Visual(VisualTile),
}

impl TileBuf {
    pub fn width(&self) -> u32 {
        match self {
            TileBuf::Numeric(img) => img.width,
            TileBuf::Visual(v) => v.width(),
        }
    }

    /// A blank-filled buffer carrying the same encoding parameters.
    pub fn like(&self) -> TileBuf {
        match self {
            TileBuf::Numeric(img) => TileBuf::Numeric(img.like()),
            TileBuf::Visual(v) => TileBuf::Visual(VisualTile::empty(v.width())),
        }
    }

    /// Fold one child tile into this parent's quadrant `k`, downsampling
    /// each 2×2 child block into one parent sample with `kernel`.
    ///
    /// Quadrant layout follows the nested child index: x half from bit 0,
    /// y half from bit 1.
    pub fn fold_child(&mut self, k: u8, child: &TileBuf, kernel: AggKernel) {
        let w = self.width();
        let half = w / 2;
        let ox = (k as u32 & 1) * half;
        let oy = ((k as u32 >> 1) & 1) * half;

        match (self, child) {
            (TileBuf::Numeric(parent), TileBuf::Numeric(child)) => {
                let blank = parent.blank;
                for j in 0..half {
                    for i in 0..half {
                        let block = [
                            child.get(2 * i, 2 * j),
                            child.get(2 * i + 1, 2 * j),
                            child.get(2 * i, 2 * j + 1),
                            child.get(2 * i + 1, 2 * j + 1),
                        ];
                        let v = match kernel {
                            AggKernel::Mean => weighted_mean(block, blank),
                            AggKernel::Middle => middle_pick(block, blank),
                        };
                        parent.set(ox + i, oy + j, v);
                    }
                }
            }
            (TileBuf::Visual(parent), TileBuf::Visual(child)) => {
                for j in 0..half {
                    for i in 0..half {
                        let block = [
                            *child.image.get_pixel(2 * i, 2 * j),
                            *child.image.get_pixel(2 * i + 1, 2 * j),
                            *child.image.get_pixel(2 * i, 2 * j + 1),
                            *child.image.get_pixel(2 * i + 1, 2 * j + 1),
                        ];
                        parent.image.put_pixel(ox + i, oy + j, pick_pixel(block));
                    }
                }
            }
            _ => {
                // Mixed encodings never reach aggregation; the store loads
                // one encoding per build.
                debug_assert!(false, "mixed tile encodings in aggregation");
            }
        }
    }
}

/// Middle pick over whole pixels, ordered by luminance. Transparent pixels
/// are the visual blank.
fn pick_pixel(block: [Rgba<u8>; 4]) -> Rgba<u8> {
    let luma = |p: &Rgba<u8>| -> f64 {
        0.299 * p[0] as f64 + 0.587 * p[1] as f64 + 0.114 * p[2] as f64
    };
    let vals = [
        if block[0][3] == 0 { f64::NAN } else { luma(&block[0]) },
        if block[1][3] == 0 { f64::NAN } else { luma(&block[1]) },
        if block[2][3] == 0 { f64::NAN } else { luma(&block[2]) },
        if block[3][3] == 0 { f64::NAN } else { luma(&block[3]) },
    ];
    let picked = middle_pick(vals, None);
    if picked.is_nan() {
        return Rgba([0, 0, 0, 0]);
    }
    // Return the pixel whose luminance was picked (first match in order).
    for (i, v) in vals.iter().enumerate() {
        if *v == picked {
            return block[i];
        }
    }
    block[3]
}
