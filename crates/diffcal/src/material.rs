//! Material descriptions consumed by overlay generation and refinement.
//!
//! Crystallographic databases and structure-factor machinery live outside
//! this crate; a [`Material`] is plain data (lattice parameters plus the
//! active reflection list) from which plane spacings and nominal ring
//! angles follow. Serialized materials use a versioned JSON schema like the
//! instrument configuration.

use nalgebra::{Matrix3, Rotation3, Vector3};
use serde::{Deserialize, Serialize};

/// keV * Angstrom product for photon energy/wavelength conversion.
pub const KEV_ANGSTROM: f64 = 12.398_419_84;

const MATERIAL_SCHEMA_V1: &str = "diffcal.material.v1";

/// Errors raised by material lookup and parsing.
#[derive(Debug, Clone, PartialEq)]
pub enum MaterialError {
    MissingMaterial(String),
    BadSchema { found: String, expected: String },
    InvalidLattice(String),
}

impl std::fmt::Display for MaterialError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::MissingMaterial(name) => write!(f, "material '{}' is not loaded", name),
            Self::BadSchema { found, expected } => {
                write!(f, "unsupported schema '{}' (expected '{}')", found, expected)
            }
            Self::InvalidLattice(reason) => write!(f, "invalid lattice: {}", reason),
        }
    }
}

impl std::error::Error for MaterialError {}

/// Direct lattice parameters: lengths in Angstrom, angles in radians.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Lattice {
    pub a: f64,
    pub b: f64,
    pub c: f64,
    pub alpha: f64,
    pub beta: f64,
    pub gamma: f64,
}

impl Lattice {
    /// Cubic lattice with edge `a` (Angstrom).
    pub fn cubic(a: f64) -> Self {
        let right = std::f64::consts::FRAC_PI_2;
        Self {
            a,
            b: a,
            c: a,
            alpha: right,
            beta: right,
            gamma: right,
        }
    }

    /// Direct metric tensor.
    fn metric(&self) -> Matrix3<f64> {
        let (a, b, c) = (self.a, self.b, self.c);
        let (ca, cb, cg) = (self.alpha.cos(), self.beta.cos(), self.gamma.cos());
        Matrix3::new(
            a * a,
            a * b * cg,
            a * c * cb,
            a * b * cg,
            b * b,
            b * c * ca,
            a * c * cb,
            b * c * ca,
            c * c,
        )
    }

    /// Reciprocal metric tensor, or `None` for a degenerate cell.
    fn reciprocal_metric(&self) -> Option<Matrix3<f64>> {
        self.metric().try_inverse()
    }

    /// Interplanar spacing (Angstrom) of the `hkl` family; NaN for a
    /// degenerate cell or the zero reflection.
    pub fn d_spacing(&self, hkl: [i32; 3]) -> f64 {
        let Some(gstar) = self.reciprocal_metric() else {
            return f64::NAN;
        };
        let h = Vector3::new(hkl[0] as f64, hkl[1] as f64, hkl[2] as f64);
        let inv_d2 = (h.transpose() * gstar * h)[(0, 0)];
        if inv_d2 <= 0.0 {
            return f64::NAN;
        }
        1.0 / inv_d2.sqrt()
    }

    /// Busing–Levy B matrix mapping `hkl` to a reciprocal-space Cartesian
    /// vector (Angstrom^-1) in the crystal frame.
    pub fn b_matrix(&self) -> Option<Matrix3<f64>> {
        let gstar = self.reciprocal_metric()?;
        let astar = gstar[(0, 0)].sqrt();
        let bstar = gstar[(1, 1)].sqrt();
        let cstar = gstar[(2, 2)].sqrt();
        if !(astar.is_finite() && bstar.is_finite() && cstar.is_finite()) {
            return None;
        }
        let cos_gstar = gstar[(0, 1)] / (astar * bstar);
        let cos_bstar = gstar[(0, 2)] / (astar * cstar);
        let sin_gstar = (1.0 - cos_gstar * cos_gstar).max(0.0).sqrt();
        let sin_bstar = (1.0 - cos_bstar * cos_bstar).max(0.0).sqrt();
        if sin_gstar < 1e-12 || self.c <= 0.0 {
            return None;
        }
        // Busing & Levy (1967) convention.
        Some(Matrix3::new(
            astar,
            bstar * cos_gstar,
            cstar * cos_bstar,
            0.0,
            bstar * sin_gstar,
            -cstar * sin_bstar * self.alpha.cos(),
            0.0,
            0.0,
            1.0 / self.c,
        ))
    }

    /// Pack into `[a, b, c, alpha, beta, gamma]` (refinement order).
    pub fn as_array(&self) -> [f64; 6] {
        [self.a, self.b, self.c, self.alpha, self.beta, self.gamma]
    }

    /// Unpack from `[a, b, c, alpha, beta, gamma]`.
    pub fn from_array(v: [f64; 6]) -> Self {
        Self {
            a: v[0],
            b: v[1],
            c: v[2],
            alpha: v[3],
            beta: v[4],
            gamma: v[5],
        }
    }
}

/// Crystal parameters for single-crystal overlays: orientation
/// (exponential map), position in the sample frame (mm), and a symmetric
/// stretch in `[xx, yy, zz, yz, xz, xy]` order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CrystalParams {
    pub orientation: [f64; 3],
    pub position: [f64; 3],
    pub stretch: [f64; 6],
}

impl Default for CrystalParams {
    fn default() -> Self {
        Self {
            orientation: [0.0; 3],
            position: [0.0; 3],
            stretch: [1.0, 1.0, 1.0, 0.0, 0.0, 0.0],
        }
    }
}

impl CrystalParams {
    pub fn rmat(&self) -> Matrix3<f64> {
        *Rotation3::from_scaled_axis(Vector3::from_column_slice(&self.orientation)).matrix()
    }

    pub fn stretch_matrix(&self) -> Matrix3<f64> {
        let s = &self.stretch;
        Matrix3::new(s[0], s[5], s[4], s[5], s[1], s[3], s[4], s[3], s[2])
    }

    pub fn position_vec(&self) -> Vector3<f64> {
        Vector3::from_column_slice(&self.position)
    }
}

/// A material with its active reflection list.
#[derive(Debug, Clone, PartialEq)]
pub struct Material {
    pub name: String,
    pub lattice: Lattice,
    /// Active reflections (Miller indices), strongest-first by convention.
    pub planes: Vec<[i32; 3]>,
    /// Full angular tolerance (radians) about each nominal ring, when set.
    pub tth_width: Option<f64>,
}

impl Material {
    pub fn new(name: impl Into<String>, lattice: Lattice, planes: Vec<[i32; 3]>) -> Self {
        Self {
            name: name.into(),
            lattice,
            planes,
            tth_width: None,
        }
    }

    /// Nominal two-theta (radians) per active reflection at the given beam
    /// energy. Reflections outside the Bragg limit yield NaN.
    pub fn ring_tths(&self, energy_kev: f64) -> Vec<f64> {
        let lambda = KEV_ANGSTROM / energy_kev;
        self.planes
            .iter()
            .map(|&hkl| {
                let d = self.lattice.d_spacing(hkl);
                let s = lambda / (2.0 * d);
                if !(0.0..=1.0).contains(&s) {
                    f64::NAN
                } else {
                    2.0 * s.asin()
                }
            })
            .collect()
    }

    /// Tolerance bands about each ring, merged where they overlap.
    ///
    /// Bands are merged transitively in ascending two-theta order; a merged
    /// band carries the sorted indices of every member reflection so callers
    /// can style shared bands distinctly. Empty when no width is configured.
    pub fn merged_ranges(&self, energy_kev: f64) -> Vec<MergedRange> {
        let Some(width) = self.tth_width else {
            return Vec::new();
        };
        let half = width / 2.0;
        let tths = self.ring_tths(energy_kev);

        let mut order: Vec<usize> = (0..tths.len()).filter(|&i| tths[i].is_finite()).collect();
        order.sort_by(|&a, &b| tths[a].total_cmp(&tths[b]));

        let mut ranges: Vec<MergedRange> = Vec::new();
        for idx in order {
            let lo = tths[idx] - half;
            let hi = tths[idx] + half;
            match ranges.last_mut() {
                Some(last) if lo <= last.bounds.1 => {
                    last.bounds.1 = last.bounds.1.max(hi);
                    last.indices.push(idx);
                    last.indices.sort_unstable();
                }
                _ => ranges.push(MergedRange {
                    indices: vec![idx],
                    bounds: (lo, hi),
                }),
            }
        }
        ranges
    }
}

/// One (possibly shared) tolerance band around powder rings.
#[derive(Debug, Clone, PartialEq)]
pub struct MergedRange {
    /// Sorted indices of member reflections in the material's plane list.
    pub indices: Vec<usize>,
    /// Two-theta bounds (radians).
    pub bounds: (f64, f64),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct MaterialSpecV1 {
    schema: String,
    name: String,
    lattice_angstrom_deg: [f64; 6],
    planes: Vec<[i32; 3]>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    tth_width_deg: Option<f64>,
}

impl Material {
    /// Parse a material from its versioned JSON representation.
    pub fn from_json_str(data: &str) -> Result<Self, Box<dyn std::error::Error>> {
        let spec: MaterialSpecV1 = serde_json::from_str(data)?;
        if spec.schema != MATERIAL_SCHEMA_V1 {
            return Err(MaterialError::BadSchema {
                found: spec.schema,
                expected: MATERIAL_SCHEMA_V1.to_string(),
            }
            .into());
        }
        let l = spec.lattice_angstrom_deg;
        if l[..3].iter().any(|&x| x <= 0.0) {
            return Err(MaterialError::InvalidLattice("non-positive cell edge".into()).into());
        }
        Ok(Self {
            name: spec.name,
            lattice: Lattice {
                a: l[0],
                b: l[1],
                c: l[2],
                alpha: l[3].to_radians(),
                beta: l[4].to_radians(),
                gamma: l[5].to_radians(),
            },
            planes: spec.planes,
            tth_width: spec.tth_width_deg.map(f64::to_radians),
        })
    }

    /// Load a material from a JSON file.
    pub fn from_json_file(path: &std::path::Path) -> Result<Self, Box<dyn std::error::Error>> {
        let data = std::fs::read_to_string(path)?;
        Self::from_json_str(&data)
    }

    /// Serialize to the versioned JSON schema.
    pub fn to_json_string(&self) -> Result<String, Box<dyn std::error::Error>> {
        let spec = MaterialSpecV1 {
            schema: MATERIAL_SCHEMA_V1.to_string(),
            name: self.name.clone(),
            lattice_angstrom_deg: [
                self.lattice.a,
                self.lattice.b,
                self.lattice.c,
                self.lattice.alpha.to_degrees(),
                self.lattice.beta.to_degrees(),
                self.lattice.gamma.to_degrees(),
            ],
            planes: self.planes.clone(),
            tth_width_deg: self.tth_width.map(f64::to_degrees),
        };
        Ok(serde_json::to_string_pretty(&spec)?)
    }
}

/// Stringified Miller index, e.g. `"1 1 1"` (pick-container reflection key).
pub fn hkl_to_string(hkl: [i32; 3]) -> String {
    format!("{} {} {}", hkl[0], hkl[1], hkl[2])
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ceria() -> Material {
        // Fluorite CeO2, first few powder lines.
        Material::new(
            "CeO2",
            Lattice::cubic(5.41153),
            vec![[1, 1, 1], [2, 0, 0], [2, 2, 0], [3, 1, 1]],
        )
    }

    #[test]
    fn cubic_d_spacing_matches_closed_form() {
        let m = ceria();
        for &hkl in &m.planes {
            let d = m.lattice.d_spacing(hkl);
            let s = ((hkl[0] * hkl[0] + hkl[1] * hkl[1] + hkl[2] * hkl[2]) as f64).sqrt();
            assert!((d - m.lattice.a / s).abs() < 1e-12);
        }
    }

    #[test]
    fn b_matrix_norm_is_reciprocal_spacing() {
        let lat = Lattice {
            a: 4.9134,
            b: 4.9134,
            c: 5.4052,
            alpha: std::f64::consts::FRAC_PI_2,
            beta: std::f64::consts::FRAC_PI_2,
            gamma: 120.0f64.to_radians(),
        };
        let b = lat.b_matrix().expect("valid cell");
        for &hkl in &[[1, 0, 1], [2, -1, 0], [1, 1, 2]] {
            let g = b * Vector3::new(hkl[0] as f64, hkl[1] as f64, hkl[2] as f64);
            let d = lat.d_spacing(hkl);
            assert!(
                (g.norm() - 1.0 / d).abs() < 1e-9,
                "hkl {:?}: |Bh| = {}, 1/d = {}",
                hkl,
                g.norm(),
                1.0 / d
            );
        }
    }

    #[test]
    fn ring_tths_are_increasing_for_cubic() {
        let m = ceria();
        let tths = m.ring_tths(80.0);
        for w in tths.windows(2) {
            assert!(w[0] < w[1]);
        }
    }

    #[test]
    fn unreachable_reflection_is_nan() {
        let mut m = ceria();
        m.planes.push([40, 0, 0]);
        let tths = m.ring_tths(8.0);
        assert!(tths.last().unwrap().is_nan());
    }

    #[test]
    fn merged_ranges_tag_members() {
        let mut m = ceria();
        // Duplicate ring: same tth twice, must share one band.
        m.planes.push([1, 1, 1]);
        m.tth_width = Some(0.3f64.to_radians());
        let ranges = m.merged_ranges(80.0);
        let shared = ranges
            .iter()
            .find(|r| r.indices.len() > 1)
            .expect("coincident rings share a band");
        assert_eq!(shared.indices, vec![0, 4]);
        // Distinct rings keep their own bands.
        assert!(ranges.iter().any(|r| r.indices == vec![1]));
    }

    #[test]
    fn material_json_roundtrip() {
        let mut m = ceria();
        m.tth_width = Some(0.25f64.to_radians());
        let json = m.to_json_string().unwrap();
        let m2 = Material::from_json_str(&json).unwrap();
        assert_eq!(m2.planes, m.planes);
        assert!((m2.lattice.a - m.lattice.a).abs() < 1e-12);
        assert!((m2.tth_width.unwrap() - m.tth_width.unwrap()).abs() < 1e-12);
    }
}
