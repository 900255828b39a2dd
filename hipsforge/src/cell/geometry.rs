//! Spherical geometry of HEALPix cells.
//!
//! The 12 base faces are laid out as 0–3 (north polar cap), 4–7 (equatorial
//! belt) and 8–11 (south polar cap). Within each face, `x` increases
//! northeast and `y` northwest; the nested sub-index interleaves the face
//! coordinates bit by bit (`x` on even bits, `y` on odd bits).

use std::collections::HashSet;
use std::f64::consts::{FRAC_PI_2, FRAC_PI_4, PI, TAU};

use crate::cell::{nside, CellId};
use crate::sphere;

impl CellId {
    /// The cell containing a sky position at the given order.
    ///
    /// `lon` is in `[0, 2π)`, `lat` in `[-π/2, π/2]`, both radians.
    pub fn from_lonlat(lon: f64, lat: f64, order: u8) -> CellId {
        let ns = nside(order) as f64;
        let (face, x, y) = locate_face_xy(lon, lat, ns);
        CellId {
            order,
            npix: face * nside(order) * nside(order) + interleave(x, y),
        }
    }

    /// (lon, lat) in radians of the cell center.
    pub fn center(self) -> (f64, f64) {
        let (face, x, y) = self.face_xy();
        face_xy_to_lonlat(face, x as f64 + 0.5, y as f64 + 0.5, nside(self.order) as f64)
    }

    /// The four cell vertices as (lon, lat) in radians.
    ///
    /// Order: south, east, north, west corner of the diamond.
    pub fn vertices(self) -> [(f64, f64); 4] {
        let (face, x, y) = self.face_xy();
        let ns = nside(self.order) as f64;
        let (x, y) = (x as f64, y as f64);
        [
            face_xy_to_lonlat(face, x, y, ns),
            face_xy_to_lonlat(face, x + 1.0, y, ns),
            face_xy_to_lonlat(face, x + 1.0, y + 1.0, ns),
            face_xy_to_lonlat(face, x, y + 1.0, ns),
        ]
    }

    /// The (up to 8) edge- and corner-adjacent cells at the same order.
    pub fn neighbours(self) -> Vec<CellId> {
        let ns = nside(self.order) as i64;
        let (face, x, y) = self.face_xy();
        let x = x as i64;
        let y = y as i64;

        // E, NE, N, NW, W, SW, S, SE
        let dirs: [(i64, i64); 8] = [
            (1, 0),
            (1, 1),
            (0, 1),
            (-1, 1),
            (-1, 0),
            (-1, -1),
            (0, -1),
            (1, -1),
        ];

        let mut result = Vec::with_capacity(8);
        for (dx, dy) in dirs {
            let nx = x + dx;
            let ny = y + dy;

            if nx >= 0 && nx < ns && ny >= 0 && ny < ns {
                result.push(self.with_face_xy(face, nx as u64, ny as u64));
                continue;
            }

            let cross_x = nx < 0 || nx >= ns;
            let cross_y = ny < 0 || ny >= ns;
            let target = if cross_x && cross_y {
                adjacent_face(face, dx.signum(), dy.signum())
            } else if cross_x {
                adjacent_face(face, dx.signum(), 0)
            } else {
                adjacent_face(face, 0, dy.signum())
            };
            let Some(nf) = target else { continue };

            let (fx, fy) = remap_across_edge(face, nf, nx, ny, ns);
            if fx >= 0 && fx < ns && fy >= 0 && fy < ns {
                result.push(self.with_face_xy(nf, fx as u64, fy as u64));
            }
        }
        result
    }

    fn face_xy(self) -> (u64, u64, u64) {
        let ns2 = nside(self.order) * nside(self.order);
        let (x, y) = deinterleave(self.npix % ns2);
        (self.npix / ns2, x, y)
    }

    fn with_face_xy(self, face: u64, x: u64, y: u64) -> CellId {
        let ns2 = nside(self.order) * nside(self.order);
        CellId {
            order: self.order,
            npix: face * ns2 + interleave(x, y),
        }
    }
}

/// Upper bound on the center-to-vertex distance of any cell at `order`,
/// in radians. Used as a safety margin by the coarse disk query.
pub fn cell_diagonal(order: u8) -> f64 {
    2.0 * (PI / 3.0).sqrt() / nside(order) as f64
}

/// Cells at `order` whose extent may intersect the disk of the given radius
/// (radians) around (lon, lat).
///
/// Implemented as a flood fill over cell adjacency starting from the disk
/// center; a cell is kept when its center lies within the radius plus one
/// cell diagonal. Over-coverage is expected and harmless, the caller refines
/// the result; the diagonal margin prevents under-coverage.
pub fn disk_cover(lon: f64, lat: f64, radius: f64, order: u8) -> Vec<CellId> {
    let center = sphere::lonlat_to_xyz(lon, lat);
    let limit = radius + cell_diagonal(order);

    let seed = CellId::from_lonlat(lon, lat, order);
    let mut accepted = Vec::new();
    let mut seen: HashSet<u64> = HashSet::new();
    let mut queue = vec![seed];
    seen.insert(seed.npix);

    while let Some(cell) = queue.pop() {
        let (clon, clat) = cell.center();
        let dist = sphere::angular_distance(center, sphere::lonlat_to_xyz(clon, clat));
        if dist > limit && cell != seed {
            continue;
        }
        accepted.push(cell);
        for nb in cell.neighbours() {
            if seen.insert(nb.npix) {
                queue.push(nb);
            }
        }
    }

    accepted.sort();
    accepted
}

// ---------------------------------------------------------------------------
// Face classification
// ---------------------------------------------------------------------------

fn is_north(face: u64) -> bool {
    face <= 3
}

fn is_south(face: u64) -> bool {
    face >= 8
}

/// Row of a base face: 0 = north polar, 1 = equatorial, 2 = south polar.
fn face_row(face: u64) -> u8 {
    if face <= 3 {
        0
    } else if face <= 7 {
        1
    } else {
        2
    }
}

// ---------------------------------------------------------------------------
// Sky position <-> (face, x, y)
// ---------------------------------------------------------------------------

/// Locate the (face, x, y) grid cell containing a sky position.
fn locate_face_xy(lon: f64, lat: f64, ns: f64) -> (u64, u64, u64) {
    let z = lat.sin();
    let mut phi = lon;
    if phi < 0.0 {
        phi += TAU;
    }
    if phi >= TAU {
        phi -= TAU;
    }

    let phi_t = phi % FRAC_PI_2;
    let column = ((phi / FRAC_PI_2).floor() as i64).rem_euclid(4) as u64;

    if z.abs() >= 2.0 / 3.0 {
        // Polar cap: solve the cap equations for the face-local axes.
        let north = z >= 0.0;
        let zfactor = if north { 1.0 } else { -1.0 };

        let root_x = (1.0 - z * zfactor) * 3.0 * (ns * (2.0 * phi_t - PI) / PI).powi(2);
        let kx = if root_x <= 0.0 { 0.0 } else { root_x.sqrt() };
        let root_y = (1.0 - z * zfactor) * 3.0 * (ns * 2.0 * phi_t / PI).powi(2);
        let ky = if root_y <= 0.0 { 0.0 } else { root_y.sqrt() };

        let (xx, yy) = if north { (ns - kx, ns - ky) } else { (ky, kx) };

        let x = (xx.floor() as u64).min(ns as u64 - 1);
        let y = (yy.floor() as u64).min(ns as u64 - 1);
        let face = if north { column } else { 8 + column };
        (face, x, y)
    } else {
        // Equatorial belt: shear (z, phi) into the rhombus lattice.
        let zunits = (z + 2.0 / 3.0) / (4.0 / 3.0);
        let phiunits = phi_t / FRAC_PI_2;

        let mut xx = (zunits + phiunits) * ns;
        let mut yy = (zunits - phiunits + 1.0) * ns;

        let face = if xx >= ns {
            xx -= ns;
            if yy >= ns {
                yy -= ns;
                column
            } else {
                ((column + 1) % 4) + 4
            }
        } else if yy >= ns {
            yy -= ns;
            column + 4
        } else {
            8 + column
        };

        let x = (xx.floor() as u64).min(ns as u64 - 1);
        let y = (yy.floor() as u64).min(ns as u64 - 1);
        (face, x, y)
    }
}

/// Map continuous face coordinates back to (lon, lat).
///
/// `x` and `y` may be fractional and may equal `ns` (cell vertices).
fn face_xy_to_lonlat(face: u64, x: f64, y: f64, ns: f64) -> (f64, f64) {
    let x_norm = x / ns;
    let y_norm = y / ns;

    let in_polar_regime = if is_north(face) {
        (x_norm + y_norm) > 1.0
    } else if is_south(face) {
        (x_norm + y_norm) < 1.0
    } else {
        false
    };

    if !in_polar_regime {
        let (phi_off, z_off, col) = if face <= 3 {
            (1.0, 0.0, face)
        } else if face <= 7 {
            (0.0, -1.0, face - 4)
        } else {
            (1.0, -2.0, face - 8)
        };

        let z = (2.0 / 3.0) * (x_norm + y_norm + z_off);
        let phi = FRAC_PI_4 * (x_norm - y_norm + phi_off + 2.0 * col as f64);
        (wrap_lon(phi), z.clamp(-1.0, 1.0).asin())
    } else {
        let north = is_north(face);
        let zfactor = if north { 1.0 } else { -1.0 };

        // Work in the north-polar convention; mirror for the south cap.
        let (px, py) = if north { (x, y) } else { (ns - y, ns - x) };
        let kx = ns - px;
        let ky = ns - py;

        let phi_t = if kx + ky == 0.0 {
            0.0
        } else {
            PI * ky / (2.0 * (kx + ky))
        };

        let z = if phi_t < FRAC_PI_4 {
            let denom = (2.0 * phi_t - PI) * ns;
            if denom.abs() < 1e-15 {
                zfactor
            } else {
                let val = PI * kx / denom;
                (1.0 - val * val / 3.0) * zfactor
            }
        } else {
            let denom = 2.0 * phi_t * ns;
            if denom.abs() < 1e-15 {
                zfactor
            } else {
                let val = PI * ky / denom;
                (1.0 - val * val / 3.0) * zfactor
            }
        };

        let col = if is_south(face) { face - 8 } else { face };
        let phi = FRAC_PI_2 * col as f64 + phi_t;
        (wrap_lon(phi), z.clamp(-1.0, 1.0).asin())
    }
}

fn wrap_lon(mut lon: f64) -> f64 {
    if lon < 0.0 {
        lon += TAU;
    }
    if lon >= TAU {
        lon -= TAU;
    }
    lon
}

// ---------------------------------------------------------------------------
// Bit interleaving
// ---------------------------------------------------------------------------

/// Interleave (x, y) into a nested sub-index; x on even bits, y on odd bits.
fn interleave(x: u64, y: u64) -> u64 {
    let mut result = 0u64;
    let mut xx = x;
    let mut yy = y;
    let mut bit = 0;
    while xx > 0 || yy > 0 {
        result |= (xx & 1) << bit;
        result |= (yy & 1) << (bit + 1);
        bit += 2;
        xx >>= 1;
        yy >>= 1;
    }
    result
}

/// De-interleave a nested sub-index into (x, y).
fn deinterleave(sub: u64) -> (u64, u64) {
    let mut x = 0u64;
    let mut y = 0u64;
    let mut s = sub;
    let mut bit = 0;
    while s > 0 {
        x |= (s & 1) << bit;
        s >>= 1;
        y |= (s & 1) << bit;
        s >>= 1;
        bit += 1;
    }
    (x, y)
}

// ---------------------------------------------------------------------------
// Base-face adjacency
// ---------------------------------------------------------------------------

/// The neighbouring base face in direction (dx, dy), each in {-1, 0, 1}.
/// Returns `None` where the face lattice has no neighbour (cap corners).
fn adjacent_face(face: u64, dx: i64, dy: i64) -> Option<u64> {
    let f = face as i64;
    if dx == 0 && dy == 0 {
        return Some(face);
    }

    if is_north(face) {
        let col = f; // 0..3
        match (dx, dy) {
            (1, 0) => Some(((col + 1) % 4) as u64),
            (0, 1) => Some(((col + 3) % 4) as u64),
            (1, 1) => Some(((col + 2) % 4) as u64),
            (-1, 0) => Some((col + 4) as u64),
            (0, -1) => Some((4 + (col + 1) % 4) as u64),
            (-1, -1) => Some((col + 8) as u64),
            _ => None,
        }
    } else if is_south(face) {
        let col = f - 8;
        match (dx, dy) {
            (1, 0) => Some((4 + (col + 1) % 4) as u64),
            (0, 1) => Some((col + 4) as u64),
            (1, 1) => Some(col as u64),
            (-1, 0) => Some((8 + (col + 3) % 4) as u64),
            (0, -1) => Some((8 + (col + 1) % 4) as u64),
            (-1, -1) => Some((8 + (col + 2) % 4) as u64),
            _ => None,
        }
    } else {
        let col = f - 4;
        match (dx, dy) {
            (1, 0) => Some(col as u64),
            (0, 1) => Some(((col + 3) % 4) as u64),
            (-1, 0) => Some((8 + (col + 3) % 4) as u64),
            (0, -1) => Some((col + 8) as u64),
            (1, -1) => Some((4 + (col + 1) % 4) as u64),
            (-1, 1) => Some(((4 + (col + 3) % 4).rem_euclid(12)) as u64),
            _ => None,
        }
    }
}

/// Remap grid coordinates that stepped off one face onto the target face.
fn remap_across_edge(from: u64, to: u64, nx: i64, ny: i64, ns: i64) -> (i64, i64) {
    let mut fx = nx.rem_euclid(ns);
    let mut fy = ny.rem_euclid(ns);

    let crossed_x = nx < 0 || nx >= ns;
    let crossed_y = ny < 0 || ny >= ns;

    match (face_row(from), face_row(to)) {
        // Between two north-cap faces the axes swap at the shared edge.
        (0, 0) => {
            if crossed_x && !crossed_y {
                fx = ny;
                fy = ns - 1;
            } else if crossed_y && !crossed_x {
                fy = nx;
                fx = ns - 1;
            } else {
                fx = ns - 1;
                fy = ns - 1;
            }
        }
        // Mirror situation between two south-cap faces.
        (2, 2) => {
            if crossed_x && !crossed_y {
                fx = ny.rem_euclid(ns);
                fy = 0;
            } else if crossed_y && !crossed_x {
                fy = nx.rem_euclid(ns);
                fx = 0;
            } else {
                fx = 0;
                fy = 0;
            }
        }
        // All other transitions wrap without an axis swap.
        _ => {}
    }

    (fx, fy)
}
