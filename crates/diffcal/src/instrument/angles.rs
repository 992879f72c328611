//! Diffraction-angle conventions and the stereographic projection pair.
//!
//! Scattering directions are described by spherical coordinates relative to
//! the incident beam: `tth` (two-theta, the scattering angle off the beam
//! axis) and `eta` (azimuth about the beam, measured from the eta reference
//! axis). Eta is periodic; every function that returns eta re-maps it into
//! the active half-open period.

use nalgebra::Vector3;

/// Default eta reference axis (lab +x).
pub const ETA_REF: Vector3<f64> = Vector3::new(1.0, 0.0, 0.0);

const TWO_PI: f64 = 2.0 * std::f64::consts::PI;

/// Half-open eta period `[min, min + 360°)`, stored in radians.
#[derive(Debug, Clone, Copy, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct EtaPeriod {
    /// Lower edge of the period in radians.
    pub min: f64,
}

impl Default for EtaPeriod {
    fn default() -> Self {
        // [-180, 180) degrees
        Self {
            min: -std::f64::consts::PI,
        }
    }
}

impl EtaPeriod {
    /// Build a period starting at `min_deg` degrees.
    pub fn from_min_degrees(min_deg: f64) -> Self {
        Self {
            min: min_deg.to_radians(),
        }
    }

    /// Map an angle (radians) into `[min, min + 2π)`.
    pub fn map(self, angle: f64) -> f64 {
        if !angle.is_finite() {
            return f64::NAN;
        }
        self.min + (angle - self.min).rem_euclid(TWO_PI)
    }
}

/// Orthonormal frame attached to the incident beam.
///
/// `e1` is the eta reference direction projected perpendicular to the beam,
/// `e2` completes the right-handed triad, `b` is the beam propagation
/// direction. Eta is measured from `e1` toward `e2`.
#[derive(Debug, Clone, Copy)]
pub struct BeamFrame {
    pub b: Vector3<f64>,
    pub e1: Vector3<f64>,
    pub e2: Vector3<f64>,
}

impl BeamFrame {
    /// Construct the eta frame for a beam propagation direction.
    ///
    /// Falls back to lab +y as the eta reference when the beam is parallel
    /// to the default reference axis.
    pub fn new(beam_vector: Vector3<f64>) -> Self {
        let b = beam_vector.normalize();
        let mut e1 = ETA_REF - b * ETA_REF.dot(&b);
        if e1.norm() < 1e-8 {
            let alt = Vector3::new(0.0, 1.0, 0.0);
            e1 = alt - b * alt.dot(&b);
        }
        let e1 = e1.normalize();
        let e2 = b.cross(&e1);
        Self { b, e1, e2 }
    }

    /// Unit scattering direction for `(tth, eta)` in radians.
    pub fn ray_from_angles(&self, tth: f64, eta: f64) -> Vector3<f64> {
        self.b * tth.cos() + (self.e1 * eta.cos() + self.e2 * eta.sin()) * tth.sin()
    }

    /// `(tth, eta)` for a scattering direction, eta mapped into `period`.
    ///
    /// A zero or non-finite direction yields NaN angles.
    pub fn angles_from_ray(&self, dir: &Vector3<f64>, period: EtaPeriod) -> (f64, f64) {
        let n = dir.norm();
        if !n.is_finite() || n < 1e-14 {
            return (f64::NAN, f64::NAN);
        }
        let v = dir / n;
        let tth = v.dot(&self.b).clamp(-1.0, 1.0).acos();
        let eta = period.map(v.dot(&self.e2).atan2(v.dot(&self.e1)));
        (tth, eta)
    }
}

/// Stereographic image coordinates `[i, j]` for a scattering direction.
///
/// The direction is first reduced to `(tth, eta)` relative to the beam, then
/// projected from the unit sphere onto a `size x size` grid whose inscribed
/// disc covers the forward hemisphere. Directions at `tth = 180°` have no
/// projection and yield NaN.
pub fn stereo_ij_from_ray(dir: &Vector3<f64>, frame: &BeamFrame, size: usize) -> [f64; 2] {
    let (tth, eta) = frame.angles_from_ray(dir, EtaPeriod::default());
    stereo_ij_from_angles(tth, eta, size)
}

/// Stereographic image coordinates for `(tth, eta)` in radians.
pub fn stereo_ij_from_angles(tth: f64, eta: f64, size: usize) -> [f64; 2] {
    if !tth.is_finite() || !eta.is_finite() {
        return [f64::NAN, f64::NAN];
    }
    let (nx, ny, nz) = (
        tth.sin() * eta.cos(),
        tth.sin() * eta.sin(),
        tth.cos(),
    );
    let den = 1.0 + nz;
    if den.abs() < 1e-12 {
        return [f64::NAN, f64::NAN];
    }
    let rad = (size as f64 - 1.0) / 2.0;
    let x = nx / den;
    let y = ny / den;
    [y * rad + rad, x * rad + rad]
}

/// `(tth, eta)` for a stereographic pixel, or `None` outside the unit disc.
pub fn angles_from_stereo_ij(ij: [f64; 2], size: usize) -> Option<(f64, f64)> {
    let rad = (size as f64 - 1.0) / 2.0;
    if rad <= 0.0 {
        return None;
    }
    let x = (ij[1] - rad) / rad;
    let y = (ij[0] - rad) / rad;
    let r2 = x * x + y * y;
    if r2 > 1.0 {
        return None;
    }
    let den = 1.0 + r2;
    let nx = 2.0 * x / den;
    let ny = 2.0 * y / den;
    let nz = (1.0 - r2) / den;
    let tth = nz.clamp(-1.0, 1.0).acos();
    let eta = ny.atan2(nx);
    Some((tth, eta))
}
