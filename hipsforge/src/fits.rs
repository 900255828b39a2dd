//! Minimal FITS image codec for numeric tiles and calibrated sources.
//!
//! Covers exactly what the pyramid store needs: single-HDU images with
//! BITPIX 8/16/32/-32/-64, the BLANK sentinel, the BSCALE/BZERO rescale
//! pair, and the DATASUM content checksum. Headers and data live in
//! 2880-byte blocks with big-endian samples.
//!
//! Samples are held in memory as raw stored values (`f64`); BSCALE/BZERO
//! are carried as metadata and never applied during aggregation, so parent
//! tiles keep the leaf encoding bit for bit.

use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;

use crate::error::{Error, Result};

/// FITS block size in bytes.
pub const BLOCK: usize = 2880;

/// One 80-character header card.
const CARD: usize = 80;

/// Pixel grid width of a standard tile.
pub const DEFAULT_TILE_WIDTH: u32 = 512;

// ---------------------------------------------------------------------------
// Header
// ---------------------------------------------------------------------------

/// Parsed FITS header: keyword/value pairs in file order.
#[derive(Debug, Clone, Default)]
pub struct FitsHeader {
    cards: Vec<(String, String)>,
    /// Number of bytes the header occupied on disk (multiple of [`BLOCK`]).
    pub byte_len: usize,
}

impl FitsHeader {
    /// Read a header from the start of `reader`, consuming whole blocks
    /// until the END card.
    pub fn parse(reader: &mut impl Read, path: &Path) -> Result<FitsHeader> {
        let mut cards = Vec::new();
        let mut block = [0u8; BLOCK];
        let mut byte_len = 0;

        loop {
            reader
                .read_exact(&mut block)
                .map_err(|_| Error::fits(path, "truncated header"))?;
            byte_len += BLOCK;

            for card in block.chunks(CARD) {
                let key = std::str::from_utf8(&card[0..8])
                    .map_err(|_| Error::fits(path, "non-ASCII header card"))?
                    .trim_end()
                    .to_string();
                if key == "END" {
                    return Ok(FitsHeader { cards, byte_len });
                }
                if card.len() < 10 || &card[8..10] != b"= " {
                    continue;
                }
                let raw = String::from_utf8_lossy(&card[10..]);
                cards.push((key, parse_value(&raw)));
            }

            // A header longer than 36 000 cards is not something we wrote.
            if byte_len > BLOCK * 1000 {
                return Err(Error::fits(path, "runaway header without END"));
            }
        }
    }

    /// String value of a keyword, quotes stripped.
    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.cards
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Integer value of a keyword.
    pub fn get_i64(&self, key: &str) -> Option<i64> {
        self.get_str(key)?.parse().ok()
    }

    /// Floating-point value of a keyword (accepts FITS `D` exponents).
    pub fn get_f64(&self, key: &str) -> Option<f64> {
        self.get_str(key)?.replace(['D', 'd'], "E").parse().ok()
    }
}

/// Strip an inline comment and surrounding quotes from a raw card value.
fn parse_value(raw: &str) -> String {
    let raw = raw.trim();
    if let Some(stripped) = raw.strip_prefix('\'') {
        match stripped.find('\'') {
            Some(end) => stripped[..end].trim_end().to_string(),
            None => stripped.trim_end().to_string(),
        }
    } else {
        match raw.find('/') {
            Some(end) => raw[..end].trim().to_string(),
            None => raw.to_string(),
        }
    }
}

/// Serialize header cards into padded blocks.
pub struct HeaderWriter {
    buf: Vec<u8>,
}

impl HeaderWriter {
    pub fn new() -> HeaderWriter {
        HeaderWriter { buf: Vec::new() }
    }

    fn push_card(&mut self, text: &str) {
        let mut card = [b' '; CARD];
        let bytes = text.as_bytes();
        card[..bytes.len().min(CARD)].copy_from_slice(&bytes[..bytes.len().min(CARD)]);
        self.buf.extend_from_slice(&card);
    }

    pub fn logical(&mut self, key: &str, value: bool) -> &mut Self {
        self.push_card(&format!("{:<8}= {:>20}", key, if value { "T" } else { "F" }));
        self
    }

    pub fn integer(&mut self, key: &str, value: i64) -> &mut Self {
        self.push_card(&format!("{:<8}= {:>20}", key, value));
        self
    }

    pub fn float(&mut self, key: &str, value: f64) -> &mut Self {
        self.push_card(&format!("{:<8}= {:>20}", key, format!("{value:.10E}")));
        self
    }

    pub fn string(&mut self, key: &str, value: &str) -> &mut Self {
        self.push_card(&format!("{:<8}= '{}'", key, value));
        self
    }

    /// Close with END and pad to a whole block.
    pub fn finish(mut self) -> Vec<u8> {
        self.push_card("END");
        while self.buf.len() % BLOCK != 0 {
            self.buf.push(b' ');
        }
        self.buf
    }
}

impl Default for HeaderWriter {
    fn default() -> Self {
        HeaderWriter::new()
    }
}

// ---------------------------------------------------------------------------
// Image HDU
// ---------------------------------------------------------------------------

/// A numeric image HDU held as raw stored samples.
#[derive(Debug, Clone)]
pub struct FitsImage {
    pub width: u32,
    pub height: u32,
    /// FITS pixel encoding: 8, 16, 32, -32 or -64.
    pub bitpix: i32,
    /// Missing-data sentinel on the raw sample scale. Float encodings use
    /// NaN and normally leave this unset.
    pub blank: Option<f64>,
    /// Multiplicative rescale to physical units.
    pub bscale: f64,
    /// Additive rescale to physical units.
    pub bzero: f64,
    /// Raw samples in row-major order, length `width * height`.
    pub data: Vec<f64>,
}

impl FitsImage {
    /// Create an image filled with the blank value.
    pub fn filled_blank(width: u32, height: u32, bitpix: i32, blank: Option<f64>) -> FitsImage {
        let fill = blank.unwrap_or(f64::NAN);
        FitsImage {
            width,
            height,
            bitpix,
            blank,
            bscale: 1.0,
            bzero: 0.0,
            data: vec![fill; (width as usize) * (height as usize)],
        }
    }

    /// A fresh image carrying this image's encoding parameters.
    pub fn like(&self) -> FitsImage {
        let mut img = FitsImage::filled_blank(self.width, self.height, self.bitpix, self.blank);
        img.bscale = self.bscale;
        img.bzero = self.bzero;
        img
    }

    pub fn get(&self, x: u32, y: u32) -> f64 {
        self.data[(y as usize) * (self.width as usize) + x as usize]
    }

    pub fn set(&mut self, x: u32, y: u32, v: f64) {
        self.data[(y as usize) * (self.width as usize) + x as usize] = v;
    }

    /// The raw value representing missing data.
    pub fn blank_value(&self) -> f64 {
        self.blank.unwrap_or(f64::NAN)
    }

    /// True when a raw sample means "no data".
    pub fn is_blank(&self, v: f64) -> bool {
        v.is_nan() || self.blank.map(|b| v == b).unwrap_or(false)
    }

    /// Bytes per stored sample.
    pub fn bytes_per_sample(&self) -> usize {
        (self.bitpix.unsigned_abs() / 8) as usize
    }

    /// Encode samples to big-endian bytes, padded to a whole block.
    fn encode_data(&self) -> Result<Vec<u8>> {
        let n = self.data.len();
        let mut out = Vec::with_capacity(n * self.bytes_per_sample());
        match self.bitpix {
            8 => {
                for &v in &self.data {
                    out.push(clamp_int(v, 0.0, u8::MAX as f64) as u8);
                }
            }
            16 => {
                for &v in &self.data {
                    let s = clamp_int(v, i16::MIN as f64, i16::MAX as f64) as i16;
                    out.extend_from_slice(&s.to_be_bytes());
                }
            }
            32 => {
                for &v in &self.data {
                    let s = clamp_int(v, i32::MIN as f64, i32::MAX as f64) as i32;
                    out.extend_from_slice(&s.to_be_bytes());
                }
            }
            -32 => {
                for &v in &self.data {
                    out.extend_from_slice(&(v as f32).to_be_bytes());
                }
            }
            -64 => {
                for &v in &self.data {
                    out.extend_from_slice(&v.to_be_bytes());
                }
            }
            other => {
                return Err(Error::Config(format!("unsupported BITPIX {other}")));
            }
        }
        while out.len() % BLOCK != 0 {
            out.push(0);
        }
        Ok(out)
    }

    /// Write the image to `path`, embedding a DATASUM over the data blocks.
    pub fn write(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let data = self.encode_data()?;
        let sum = ones_complement_sum(&data);

        let mut header = HeaderWriter::new();
        header
            .logical("SIMPLE", true)
            .integer("BITPIX", self.bitpix as i64)
            .integer("NAXIS", 2)
            .integer("NAXIS1", self.width as i64)
            .integer("NAXIS2", self.height as i64);
        if self.bscale != 1.0 {
            header.float("BSCALE", self.bscale);
        }
        if self.bzero != 0.0 {
            header.float("BZERO", self.bzero);
        }
        if let Some(blank) = self.blank {
            if self.bitpix > 0 {
                header.integer("BLANK", blank as i64);
            }
        }
        header.string("DATASUM", &sum.to_string());

        let mut out = BufWriter::new(File::create(path)?);
        out.write_all(&header.finish())?;
        out.write_all(&data)?;
        out.flush()?;
        Ok(())
    }

    /// Read an image from `path`.
    pub fn read(path: &Path) -> Result<FitsImage> {
        let mut reader = BufReader::new(File::open(path)?);
        let header = FitsHeader::parse(&mut reader, path)?;
        Self::read_data(&header, &mut reader, path)
    }

    /// Decode the data section that follows an already-parsed header.
    pub fn read_data(
        header: &FitsHeader,
        reader: &mut impl Read,
        path: &Path,
    ) -> Result<FitsImage> {
        let bitpix = header
            .get_i64("BITPIX")
            .ok_or_else(|| Error::fits(path, "missing BITPIX"))? as i32;
        let width = header
            .get_i64("NAXIS1")
            .ok_or_else(|| Error::fits(path, "missing NAXIS1"))? as u32;
        let height = header
            .get_i64("NAXIS2")
            .ok_or_else(|| Error::fits(path, "missing NAXIS2"))? as u32;
        let blank = header.get_f64("BLANK");
        let bscale = header.get_f64("BSCALE").unwrap_or(1.0);
        let bzero = header.get_f64("BZERO").unwrap_or(0.0);

        let n = (width as usize) * (height as usize);
        let bps = (bitpix.unsigned_abs() / 8) as usize;
        let mut raw = vec![0u8; n * bps];
        reader
            .read_exact(&mut raw)
            .map_err(|_| Error::fits(path, "file too short for declared dimensions"))?;

        let mut data = Vec::with_capacity(n);
        match bitpix {
            8 => data.extend(raw.iter().map(|&b| b as f64)),
            16 => {
                for c in raw.chunks_exact(2) {
                    data.push(i16::from_be_bytes([c[0], c[1]]) as f64);
                }
            }
            32 => {
                for c in raw.chunks_exact(4) {
                    data.push(i32::from_be_bytes([c[0], c[1], c[2], c[3]]) as f64);
                }
            }
            -32 => {
                for c in raw.chunks_exact(4) {
                    data.push(f32::from_be_bytes([c[0], c[1], c[2], c[3]]) as f64);
                }
            }
            -64 => {
                for c in raw.chunks_exact(8) {
                    data.push(f64::from_be_bytes([
                        c[0], c[1], c[2], c[3], c[4], c[5], c[6], c[7],
                    ]));
                }
            }
            other => {
                return Err(Error::fits(path, format!("unsupported BITPIX {other}")));
            }
        }

        Ok(FitsImage {
            width,
            height,
            bitpix,
            blank,
            bscale,
            bzero,
            data,
        })
    }
}

fn clamp_int(v: f64, min: f64, max: f64) -> i64 {
    if v.is_nan() {
        return 0;
    }
    v.round().clamp(min, max) as i64
}

// ---------------------------------------------------------------------------
// Structural and content checks
// ---------------------------------------------------------------------------

/// Read only the header of a FITS file.
pub fn read_header(path: &Path) -> Result<FitsHeader> {
    let mut reader = BufReader::new(File::open(path)?);
    FitsHeader::parse(&mut reader, path)
}

/// Minimum byte length a file must have for its declared dimensions, or
/// `None` when the header does not declare an image.
pub fn declared_min_len(header: &FitsHeader) -> Option<u64> {
    let bitpix = header.get_i64("BITPIX")?;
    let w = header.get_i64("NAXIS1")?;
    let h = header.get_i64("NAXIS2")?;
    if w <= 0 || h <= 0 {
        return None;
    }
    Some(header.byte_len as u64 + (w * h) as u64 * (bitpix.unsigned_abs() / 8))
}

/// Outcome of re-verifying a file's embedded DATASUM.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DatasumStatus {
    /// No DATASUM card present.
    Missing,
    /// Recomputed sum matches the stored one.
    Valid(u32),
    /// Content no longer matches the stored sum.
    Mismatch { stored: u32, computed: u32 },
}

/// Recompute the DATASUM of a file and compare against its header.
pub fn verify_datasum(path: &Path) -> Result<DatasumStatus> {
    let mut reader = BufReader::new(File::open(path)?);
    let header = FitsHeader::parse(&mut reader, path)?;
    let stored: u32 = match header.get_str("DATASUM").and_then(|s| s.trim().parse().ok()) {
        Some(v) => v,
        None => return Ok(DatasumStatus::Missing),
    };

    let mut data = Vec::new();
    reader.read_to_end(&mut data)?;
    // Trailing zero padding contributes nothing to a ones'-complement sum,
    // so summing whatever is present matches the sum over padded blocks.
    let computed = ones_complement_sum(&data);

    if computed == stored {
        Ok(DatasumStatus::Valid(computed))
    } else {
        Ok(DatasumStatus::Mismatch { stored, computed })
    }
}

/// 32-bit ones'-complement sum over big-endian words, the FITS DATASUM
/// convention. Input shorter than a multiple of 4 is zero-padded.
pub fn ones_complement_sum(bytes: &[u8]) -> u32 {
    let mut sum: u32 = 0;
    let mut chunks = bytes.chunks_exact(4);
    for c in &mut chunks {
        sum = add_ones_complement(sum, u32::from_be_bytes([c[0], c[1], c[2], c[3]]));
    }
    let rem = chunks.remainder();
    if !rem.is_empty() {
        let mut last = [0u8; 4];
        last[..rem.len()].copy_from_slice(rem);
        sum = add_ones_complement(sum, u32::from_be_bytes(last));
    }
    sum
}

/// Fold one more word into a ones'-complement accumulator.
pub fn add_ones_complement(a: u32, b: u32) -> u32 {
    let s = a as u64 + b as u64;
    ((s & 0xFFFF_FFFF) + (s >> 32)) as u32
}
