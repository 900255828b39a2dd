//! Unit-vector helpers on the celestial sphere.

use std::f64::consts::TAU;

/// Convert (lon, lat) in radians to a unit vector `[x, y, z]`.
pub fn lonlat_to_xyz(lon: f64, lat: f64) -> [f64; 3] {
    let cos_lat = lat.cos();
    [cos_lat * lon.cos(), cos_lat * lon.sin(), lat.sin()]
}

/// Convert a unit vector to (lon, lat) in radians.
/// Longitude is in `[0, 2π)`, latitude in `[-π/2, π/2]`.
pub fn xyz_to_lonlat(xyz: [f64; 3]) -> (f64, f64) {
    let mut lon = f64::atan2(xyz[1], xyz[0]);
    if lon < 0.0 {
        lon += TAU;
    }
    (lon, xyz[2].clamp(-1.0, 1.0).asin())
}

/// Great-circle angular distance between two unit vectors, in radians.
pub fn angular_distance(a: [f64; 3], b: [f64; 3]) -> f64 {
    let dot = a[0] * b[0] + a[1] * b[1] + a[2] * b[2];
    dot.clamp(-1.0, 1.0).acos()
}

/// Normalized mean direction of a set of unit vectors.
///
/// Used to find the center of a corner polygon. The inputs must not sum to
/// the zero vector (antipodal degenerate case); in that event the first
/// vector is returned unchanged.
pub fn mean_direction(points: &[[f64; 3]]) -> [f64; 3] {
    let mut m = [0.0_f64; 3];
    for p in points {
        m[0] += p[0];
        m[1] += p[1];
        m[2] += p[2];
    }
    let norm = (m[0] * m[0] + m[1] * m[1] + m[2] * m[2]).sqrt();
    if norm < 1e-12 {
        return points[0];
    }
    [m[0] / norm, m[1] / norm, m[2] / norm]
}

/// Gnomonic (TAN) projection of `point` onto the tangent plane at `reference`.
///
/// Returns `Some((x, y))` with x increasing toward increasing longitude and
/// y toward the north pole, or `None` when the point lies on the opposite
/// hemisphere from the reference.
pub fn tangent_plane(point: [f64; 3], reference: [f64; 3]) -> Option<(f64, f64)> {
    let s = point;
    let r = reference;

    let sdotr = s[0] * r[0] + s[1] * r[1] + s[2] * r[2];
    if sdotr <= 0.0 {
        return None;
    }
    let inv_sdotr = 1.0 / sdotr;

    if r[2] == 1.0 {
        let inv_s2 = 1.0 / s[2];
        return Some((s[0] * inv_s2, s[1] * inv_s2));
    } else if r[2] == -1.0 {
        let inv_s2 = 1.0 / s[2];
        return Some((-s[0] * inv_s2, s[1] * inv_s2));
    }

    // eta: perpendicular to r, in the direction of increasing longitude
    let mut etax = -r[1];
    let mut etay = r[0];
    let inv_en = 1.0 / etax.hypot(etay);
    etax *= inv_en;
    etay *= inv_en;

    // xi = r × eta: northward
    let xix = -r[2] * etay;
    let xiy = r[2] * etax;
    let xiz = r[0] * etay - r[1] * etax;

    let x = (s[0] * etax + s[1] * etay) * inv_sdotr;
    let y = (s[0] * xix + s[1] * xiy + s[2] * xiz) * inv_sdotr;

    Some((x, y))
}
