//! World-coordinate calibration for source images.
//!
//! A [`Wcs`] maps between pixel coordinates and sky positions through a
//! reference point (CRVAL/CRPIX) and a CD matrix, with either a gnomonic
//! (TAN) or a plate-carree (CAR) projection branch. TAN covers ordinary
//! pointed exposures; CAR covers all-sky source images.

use std::f64::consts::{PI, TAU};
use std::fmt;

use crate::fits::FitsHeader;
use crate::sphere;

/// Sky reference frame of a store or a source image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Frame {
    /// ICRS / equatorial J2000.
    Equatorial,
    /// Galactic coordinates.
    Galactic,
}

/// Rotation matrix taking equatorial unit vectors to galactic ones (J2000).
const EQ_TO_GAL: [[f64; 3]; 3] = [
    [-0.054_875_560_4, -0.873_437_090_2, -0.483_835_015_5],
    [0.494_109_427_9, -0.444_829_630_0, 0.746_982_244_5],
    [-0.867_666_149_0, -0.198_076_373_4, 0.455_983_776_2],
];

impl Frame {
    /// Parse the frame declaration used in the properties file.
    pub fn parse(s: &str) -> Option<Frame> {
        match s.trim().to_ascii_lowercase().as_str() {
            "equatorial" | "icrs" | "c" => Some(Frame::Equatorial),
            "galactic" | "g" => Some(Frame::Galactic),
            _ => None,
        }
    }

    /// Rotate a unit vector expressed in `self` into `target`.
    pub fn convert(self, target: Frame, xyz: [f64; 3]) -> [f64; 3] {
        if self == target {
            return xyz;
        }
        match (self, target) {
            (Frame::Equatorial, Frame::Galactic) => mat_mul(&EQ_TO_GAL, xyz),
            (Frame::Galactic, Frame::Equatorial) => mat_mul_transposed(&EQ_TO_GAL, xyz),
            _ => xyz,
        }
    }
}

impl fmt::Display for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Frame::Equatorial => write!(f, "equatorial"),
            Frame::Galactic => write!(f, "galactic"),
        }
    }
}

fn mat_mul(m: &[[f64; 3]; 3], v: [f64; 3]) -> [f64; 3] {
    [
        m[0][0] * v[0] + m[0][1] * v[1] + m[0][2] * v[2],
        m[1][0] * v[0] + m[1][1] * v[1] + m[1][2] * v[2],
        m[2][0] * v[0] + m[2][1] * v[1] + m[2][2] * v[2],
    ]
}

fn mat_mul_transposed(m: &[[f64; 3]; 3], v: [f64; 3]) -> [f64; 3] {
    [
        m[0][0] * v[0] + m[1][0] * v[1] + m[2][0] * v[2],
        m[0][1] * v[0] + m[1][1] * v[1] + m[2][1] * v[2],
        m[0][2] * v[0] + m[1][2] * v[1] + m[2][2] * v[2],
    ]
}

/// Projection branch of a calibration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Projection {
    /// Gnomonic tangent-plane projection.
    Tan,
    /// Plate carree; linear in longitude/latitude, valid over the whole sky.
    Car,
}

/// World-coordinate calibration of a source image.
#[derive(Debug, Clone)]
pub struct Wcs {
    /// Projection branch.
    pub projection: Projection,
    /// Reference point on sky (lon, lat) in radians.
    pub crval: [f64; 2],
    /// Reference point in pixel coordinates.
    pub crpix: [f64; 2],
    /// CD matrix mapping pixel offsets to intermediate world coordinates
    /// (radians). `cd[0] = [cd1_1, cd1_2]`, `cd[1] = [cd2_1, cd2_2]`.
    pub cd: [[f64; 2]; 2],
    /// Image dimensions `(width, height)` in pixels.
    pub image_size: [f64; 2],
}

impl Wcs {
    /// Build a calibration from FITS header keywords.
    ///
    /// Recognizes `CTYPE1` suffixes `TAN` and `CAR`; angles are read in
    /// degrees and converted to radians. Returns `None` when any required
    /// keyword is missing.
    pub fn from_header(header: &FitsHeader, width: u32, height: u32) -> Option<Wcs> {
        let ctype = header.get_str("CTYPE1")?;
        let projection = if ctype.ends_with("TAN") {
            Projection::Tan
        } else if ctype.ends_with("CAR") {
            Projection::Car
        } else {
            return None;
        };
        let d = PI / 180.0;
        Some(Wcs {
            projection,
            crval: [header.get_f64("CRVAL1")? * d, header.get_f64("CRVAL2")? * d],
            crpix: [header.get_f64("CRPIX1")?, header.get_f64("CRPIX2")?],
            cd: [
                [header.get_f64("CD1_1")? * d, header.get_f64("CD1_2")? * d],
                [header.get_f64("CD2_1")? * d, header.get_f64("CD2_2")? * d],
            ],
            image_size: [width as f64, height as f64],
        })
    }

    /// Convert pixel coordinates to (lon, lat) in radians.
    pub fn pixel_to_lonlat(&self, px: f64, py: f64) -> (f64, f64) {
        let u = px - self.crpix[0];
        let v = py - self.crpix[1];
        let x = self.cd[0][0] * u + self.cd[0][1] * v;
        let y = self.cd[1][0] * u + self.cd[1][1] * v;
        match self.projection {
            Projection::Tan => sphere::xyz_to_lonlat(self.tan_deproject(x, y)),
            Projection::Car => {
                let mut lon = self.crval[0] + x;
                lon = lon.rem_euclid(TAU);
                let lat = (self.crval[1] + y).clamp(-PI / 2.0, PI / 2.0);
                (lon, lat)
            }
        }
    }

    /// Convert (lon, lat) in radians to pixel coordinates.
    ///
    /// Returns `None` when the position cannot be projected (behind the
    /// tangent plane, for TAN).
    pub fn lonlat_to_pixel(&self, lon: f64, lat: f64) -> Option<(f64, f64)> {
        let (x, y) = match self.projection {
            Projection::Tan => {
                let reference = sphere::lonlat_to_xyz(self.crval[0], self.crval[1]);
                sphere::tangent_plane(sphere::lonlat_to_xyz(lon, lat), reference)?
            }
            Projection::Car => {
                // Choose the wrap of lon closest to the reference meridian.
                let mut dlon = (lon - self.crval[0]).rem_euclid(TAU);
                if dlon > PI {
                    dlon -= TAU;
                }
                (dlon, lat - self.crval[1])
            }
        };

        let det = self.cd[0][0] * self.cd[1][1] - self.cd[0][1] * self.cd[1][0];
        let inv_det = 1.0 / det;
        let u = inv_det * (self.cd[1][1] * x - self.cd[0][1] * y);
        let v = inv_det * (-self.cd[1][0] * x + self.cd[0][0] * y);
        Some((u + self.crpix[0], v + self.crpix[1]))
    }

    /// Sky positions (radians) of the four image corners.
    pub fn corners(&self) -> [(f64, f64); 4] {
        let w = self.image_size[0];
        let h = self.image_size[1];
        [
            self.pixel_to_lonlat(0.0, 0.0),
            self.pixel_to_lonlat(w, 0.0),
            self.pixel_to_lonlat(w, h),
            self.pixel_to_lonlat(0.0, h),
        ]
    }

    /// (lon, lat) in radians of the image center pixel.
    pub fn field_center(&self) -> (f64, f64) {
        self.pixel_to_lonlat(self.image_size[0] / 2.0, self.image_size[1] / 2.0)
    }

    /// Angular radius (radians) of the smallest circle centered on the image
    /// center that encloses all four corners.
    pub fn field_radius(&self) -> f64 {
        let (clon, clat) = self.field_center();
        let center = sphere::lonlat_to_xyz(clon, clat);
        self.corners()
            .iter()
            .map(|&(lon, lat)| sphere::angular_distance(center, sphere::lonlat_to_xyz(lon, lat)))
            .fold(0.0_f64, f64::max)
    }

    /// Deproject tangent-plane coordinates (radians) to a unit vector.
    fn tan_deproject(&self, x: f64, y: f64) -> [f64; 3] {
        let x = -x;

        let r = sphere::lonlat_to_xyz(self.crval[0], self.crval[1]);
        let (rx, ry, rz) = (r[0], r[1], r[2]);

        let (ix, iy) = if rz == 1.0 || rz == -1.0 {
            (-1.0, 0.0)
        } else {
            let ix = ry;
            let iy = -rx;
            let norm = ix.hypot(iy);
            (ix / norm, iy / norm)
        };

        let mut jx = iy * rz;
        let mut jy = -ix * rz;
        let mut jz = ix * ry - iy * rx;
        let jnorm = (jx * jx + jy * jy + jz * jz).sqrt();
        jx /= jnorm;
        jy /= jnorm;
        jz /= jnorm;

        let px = ix * x + jx * y + rx;
        let py = iy * x + jy * y + ry;
        let pz = jz * y + rz;
        let norm = (px * px + py * py + pz * pz).sqrt();

        [px / norm, py / norm, pz / norm]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tan_wcs() -> Wcs {
        // ~1 arcsec/pixel pointed at (30°, 10°), 1024² image.
        let scale = (1.0 / 3600.0_f64).to_radians();
        Wcs {
            projection: Projection::Tan,
            crval: [30.0_f64.to_radians(), 10.0_f64.to_radians()],
            crpix: [512.0, 512.0],
            cd: [[-scale, 0.0], [0.0, scale]],
            image_size: [1024.0, 1024.0],
        }
    }

    fn allsky_car_wcs() -> Wcs {
        // 360×180 image at 1 degree per pixel covering the whole sky.
        let d = 1.0_f64.to_radians();
        Wcs {
            projection: Projection::Car,
            crval: [PI, 0.0],
            crpix: [180.0, 90.0],
            cd: [[d, 0.0], [0.0, d]],
            image_size: [360.0, 180.0],
        }
    }

    #[test]
    fn test_tan_center_roundtrip() {
        let wcs = tan_wcs();
        let (lon, lat) = wcs.pixel_to_lonlat(512.0, 512.0);
        assert!((lon - 30.0_f64.to_radians()).abs() < 1e-9);
        assert!((lat - 10.0_f64.to_radians()).abs() < 1e-9);

        let (px, py) = wcs.lonlat_to_pixel(lon, lat).unwrap();
        assert!((px - 512.0).abs() < 1e-6);
        assert!((py - 512.0).abs() < 1e-6);
    }

    #[test]
    fn test_tan_pixel_roundtrip_off_center() {
        let wcs = tan_wcs();
        for (px, py) in [(0.0, 0.0), (1024.0, 0.0), (100.0, 900.0)] {
            let (lon, lat) = wcs.pixel_to_lonlat(px, py);
            let (px2, py2) = wcs.lonlat_to_pixel(lon, lat).unwrap();
            assert!((px - px2).abs() < 1e-5, "px {px} -> {px2}");
            assert!((py - py2).abs() < 1e-5, "py {py} -> {py2}");
        }
    }

    #[test]
    fn test_tan_rejects_antipode() {
        let wcs = tan_wcs();
        assert!(wcs
            .lonlat_to_pixel(210.0_f64.to_radians(), -10.0_f64.to_radians())
            .is_none());
    }

    #[test]
    fn test_tan_field_radius_covers_corners() {
        let wcs = tan_wcs();
        let r = wcs.field_radius();
        // Half diagonal of a 1024² field at 1 arcsec/px is ~724 arcsec.
        let expected = (724.0 / 3600.0_f64).to_radians();
        assert!((r - expected).abs() / expected < 0.01, "radius {r}");
    }

    #[test]
    fn test_car_covers_whole_sky() {
        let wcs = allsky_car_wcs();
        for (lon_deg, lat_deg) in [(0.0f64, 0.0f64), (180.0, 89.0), (359.0, -89.0), (90.0, 45.0)] {
            let (px, py) = wcs
                .lonlat_to_pixel(lon_deg.to_radians(), lat_deg.to_radians())
                .expect("CAR projects everywhere");
            assert!((-1.0..=361.0).contains(&px), "px {px} for lon {lon_deg}");
            assert!((-1.0..=181.0).contains(&py), "py {py} for lat {lat_deg}");
        }
        assert!(wcs.field_radius() > PI / 2.0);
    }

    #[test]
    fn test_frame_conversion_roundtrip() {
        let v = sphere::lonlat_to_xyz(1.1, -0.4);
        let g = Frame::Equatorial.convert(Frame::Galactic, v);
        let back = Frame::Galactic.convert(Frame::Equatorial, g);
        for i in 0..3 {
            assert!((v[i] - back[i]).abs() < 1e-12);
        }
    }

    #[test]
    fn test_frame_parse() {
        assert_eq!(Frame::parse("equatorial"), Some(Frame::Equatorial));
        assert_eq!(Frame::parse("Galactic"), Some(Frame::Galactic));
        assert_eq!(Frame::parse("ecliptic"), None);
    }

    #[test]
    fn test_galactic_north_pole_position() {
        // The J2000 north galactic pole is at RA ~192.86°, Dec ~27.13°.
        let ngp = sphere::lonlat_to_xyz(192.859_f64.to_radians(), 27.128_f64.to_radians());
        let g = Frame::Equatorial.convert(Frame::Galactic, ngp);
        let (_, glat) = sphere::xyz_to_lonlat(g);
        assert!(glat > 89.9_f64.to_radians(), "glat = {}", glat.to_degrees());
    }
}
