//! Instrument geometry model.
//!
//! An [`Instrument`] is a named collection of [`Panel`]s plus a beam and a
//! sample-stage pose. A panel's pose (translation + exponential-map tilt),
//! pixel grid, and pitch fully determine the mapping between panel pixels and
//! the lab Cartesian frame. All angle computations apply panel distortion in
//! a fixed order: pixel -> undistort -> ideal Cartesian -> angles, and the
//! exact reverse on the way back.
//!
//! Rays that miss a panel produce NaN coordinates rather than errors so that
//! vectorized callers can mix valid and invalid rows.

pub mod angles;
pub mod config;
pub mod distortion;

use nalgebra::{DMatrix, Matrix3, Rotation3, Vector3};

use angles::{BeamFrame, EtaPeriod};
use distortion::Distortion;

/// Incident beam description.
#[derive(Debug, Clone, PartialEq)]
pub struct Beam {
    /// Unit propagation direction in the lab frame.
    pub vector: Vector3<f64>,
    /// Photon energy in keV.
    pub energy_kev: f64,
}

impl Default for Beam {
    fn default() -> Self {
        Self {
            vector: Vector3::new(0.0, 0.0, -1.0),
            energy_kev: 65.351,
        }
    }
}

impl Beam {
    /// Eta frame attached to this beam.
    pub fn frame(&self) -> BeamFrame {
        BeamFrame::new(self.vector)
    }

    /// Wavelength in Angstrom.
    pub fn wavelength_angstrom(&self) -> f64 {
        crate::material::KEV_ANGSTROM / self.energy_kev
    }

    /// Reset the propagation direction from azimuth/polar angles (radians).
    ///
    /// Azimuth is measured in the lab x-z plane from -z, polar from the
    /// lab -y axis; the default beam corresponds to (0, 90°).
    pub fn set_spherical(&mut self, azimuth: f64, polar: f64) {
        self.vector = Vector3::new(
            polar.sin() * azimuth.sin(),
            -polar.cos(),
            -polar.sin() * azimuth.cos(),
        );
    }

    /// Azimuth/polar angles (radians) of the propagation direction.
    pub fn spherical(&self) -> (f64, f64) {
        let v = self.vector.normalize();
        let polar = (-v.y).clamp(-1.0, 1.0).acos();
        let azimuth = v.x.atan2(-v.z);
        (azimuth, polar)
    }
}

/// Sample-stage pose: chi tilt about lab x plus a translation.
#[derive(Debug, Clone, PartialEq)]
pub struct SamplePose {
    /// Chi tilt in radians.
    pub chi: f64,
    /// Stage translation (mm); diffracted rays originate here.
    pub tvec: Vector3<f64>,
}

impl Default for SamplePose {
    fn default() -> Self {
        Self {
            chi: 0.0,
            tvec: Vector3::zeros(),
        }
    }
}

impl SamplePose {
    /// Rotation of the sample frame relative to the lab frame.
    pub fn rmat(&self) -> Matrix3<f64> {
        *Rotation3::from_scaled_axis(Vector3::new(self.chi, 0.0, 0.0)).matrix()
    }
}

/// Sensor surface geometry.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum PanelShape {
    /// Flat sensor plane.
    Planar,
    /// Cylindrical sensor curved toward the sample with this radius (mm).
    /// The cylinder axis is the panel-local y axis.
    Cylindrical { radius_mm: f64 },
}

/// One physical or logical detector sensor.
#[derive(Debug, Clone)]
pub struct Panel {
    /// Pixel grid rows.
    pub rows: usize,
    /// Pixel grid columns.
    pub cols: usize,
    /// Pixel pitch (row, col) in mm.
    pub pitch: (f64, f64),
    /// Panel center position in the lab frame (mm).
    pub tvec: Vector3<f64>,
    /// Exponential-map tilt (radians).
    pub tilt: Vector3<f64>,
    /// Sensor surface geometry.
    pub shape: PanelShape,
    /// Optional distortion model in panel Cartesian coordinates.
    pub distortion: Option<Distortion>,
    /// Optional row-major validity buffer (`rows * cols`); `false` marks an
    /// unusable pixel.
    pub buffer: Option<Vec<bool>>,
    /// Optional group id for panels tiling one logical sensor.
    pub group: Option<String>,
    /// Group-relative region-of-interest offset (row, col) in pixels.
    pub roi_offset: Option<(usize, usize)>,
}

impl Panel {
    /// Flat panel with the given grid, pitch, and pose.
    pub fn planar(
        rows: usize,
        cols: usize,
        pitch: (f64, f64),
        tvec: Vector3<f64>,
        tilt: Vector3<f64>,
    ) -> Self {
        Self {
            rows,
            cols,
            pitch,
            tvec,
            tilt,
            shape: PanelShape::Planar,
            distortion: None,
            buffer: None,
            group: None,
            roi_offset: None,
        }
    }

    /// Rotation matrix of the panel frame (exponential map of `tilt`).
    pub fn rmat(&self) -> Matrix3<f64> {
        *Rotation3::from_scaled_axis(self.tilt).matrix()
    }

    /// Physical extent (width, height) in mm.
    pub fn extent_mm(&self) -> (f64, f64) {
        (self.cols as f64 * self.pitch.1, self.rows as f64 * self.pitch.0)
    }

    /// Panel-local Cartesian coordinates (mm) of a fractional pixel `(i, j)`.
    ///
    /// Row 0 is the top of the image: +y points from row `rows-1` to row 0.
    pub fn cart_from_pixel(&self, ij: [f64; 2]) -> [f64; 2] {
        let x = (ij[1] - (self.cols as f64 - 1.0) / 2.0) * self.pitch.1;
        let y = ((self.rows as f64 - 1.0) / 2.0 - ij[0]) * self.pitch.0;
        [x, y]
    }

    /// Fractional pixel `(i, j)` for panel-local Cartesian coordinates (mm).
    pub fn pixel_from_cart(&self, xy: [f64; 2]) -> [f64; 2] {
        let j = xy[0] / self.pitch.1 + (self.cols as f64 - 1.0) / 2.0;
        let i = (self.rows as f64 - 1.0) / 2.0 - xy[1] / self.pitch.0;
        [i, j]
    }

    /// Lab-frame position of a point on the sensor surface given ideal
    /// panel-local Cartesian coordinates (mm).
    pub fn surface_to_lab(&self, xy: [f64; 2]) -> Vector3<f64> {
        let local = match self.shape {
            PanelShape::Planar => Vector3::new(xy[0], xy[1], 0.0),
            PanelShape::Cylindrical { radius_mm } => {
                let phi = xy[0] / radius_mm;
                Vector3::new(
                    radius_mm * phi.sin(),
                    xy[1],
                    radius_mm * (1.0 - phi.cos()),
                )
            }
        };
        self.rmat() * local + self.tvec
    }

    /// Ideal panel-local Cartesian coordinates of a lab point assumed to lie
    /// on (or near) the sensor surface. The planar variant projects along
    /// the panel normal; the cylindrical variant unrolls the arc.
    pub fn lab_to_surface(&self, lab: &Vector3<f64>) -> [f64; 2] {
        let local = self.rmat().transpose() * (lab - self.tvec);
        match self.shape {
            PanelShape::Planar => [local.x, local.y],
            PanelShape::Cylindrical { radius_mm } => {
                let phi = local.x.atan2(radius_mm - local.z);
                [radius_mm * phi, local.y]
            }
        }
    }

    /// Lab-frame position of a fractional pixel (distortion removed first).
    pub fn pixel_to_lab(&self, ij: [f64; 2]) -> Vector3<f64> {
        let mut xy = self.cart_from_pixel(ij);
        if let Some(d) = &self.distortion {
            xy = d.apply(xy);
        }
        self.surface_to_lab(xy)
    }

    /// Fractional pixel coordinates of a lab point on the sensor surface
    /// (distortion re-applied last). `None` if any step is non-finite.
    pub fn lab_to_pixel(&self, lab: &Vector3<f64>) -> Option<[f64; 2]> {
        let mut xy = self.lab_to_surface(lab);
        if let Some(d) = &self.distortion {
            xy = d.apply_inverse(xy);
        }
        let ij = self.pixel_from_cart(xy);
        if ij[0].is_finite() && ij[1].is_finite() {
            Some(ij)
        } else {
            None
        }
    }

    /// Intersect a ray `origin + t * dir` (t > 0) with the sensor surface.
    ///
    /// Returns ideal panel-local Cartesian coordinates, or NaN coordinates
    /// when the ray misses (parallel to a planar panel, behind the origin,
    /// or off the cylindrical sheet).
    pub fn intersect_ray(&self, origin: &Vector3<f64>, dir: &Vector3<f64>) -> [f64; 2] {
        let rmat = self.rmat();
        match self.shape {
            PanelShape::Planar => {
                let normal = rmat.column(2).into_owned();
                let denom = normal.dot(dir);
                if denom.abs() < 1e-12 {
                    return [f64::NAN, f64::NAN];
                }
                let t = normal.dot(&(self.tvec - origin)) / denom;
                if !t.is_finite() || t <= 0.0 {
                    return [f64::NAN, f64::NAN];
                }
                let local = rmat.transpose() * (origin + dir * t - self.tvec);
                [local.x, local.y]
            }
            PanelShape::Cylindrical { radius_mm } => {
                // Solve in the panel frame, where the cylinder axis is the
                // y axis through (0, y, radius).
                let o = rmat.transpose() * (origin - self.tvec);
                let d = rmat.transpose() * dir;
                let ox = o.x;
                let oz = o.z - radius_mm;
                let a = d.x * d.x + d.z * d.z;
                let b = 2.0 * (ox * d.x + oz * d.z);
                let c = ox * ox + oz * oz - radius_mm * radius_mm;
                let disc = b * b - 4.0 * a * c;
                if a < 1e-14 || disc < 0.0 {
                    return [f64::NAN, f64::NAN];
                }
                let sq = disc.sqrt();
                let (width, _) = self.extent_mm();
                let phi_max = width / (2.0 * radius_mm);
                // Prefer the nearer front-sheet intersection within the arc.
                for t in [(-b - sq) / (2.0 * a), (-b + sq) / (2.0 * a)] {
                    if !t.is_finite() || t <= 0.0 {
                        continue;
                    }
                    let p = o + d * t;
                    let phi = p.x.atan2(radius_mm - p.z);
                    if phi.abs() <= phi_max + 1e-9 {
                        return [radius_mm * phi, p.y];
                    }
                }
                [f64::NAN, f64::NAN]
            }
        }
    }

    /// Diffraction angles of an ideal panel-local Cartesian point, for rays
    /// emanating from the sample-stage origin.
    pub fn cart_to_angles(
        &self,
        xy: [f64; 2],
        beam: &BeamFrame,
        sample: &SamplePose,
        period: EtaPeriod,
    ) -> (f64, f64) {
        if !xy[0].is_finite() || !xy[1].is_finite() {
            return (f64::NAN, f64::NAN);
        }
        let lab = self.surface_to_lab(xy);
        beam.angles_from_ray(&(lab - sample.tvec), period)
    }

    /// Ideal panel-local Cartesian position where the `(tth, eta)` ray from
    /// the sample-stage origin strikes this panel; NaN if it misses.
    pub fn angles_to_cart(
        &self,
        tth: f64,
        eta: f64,
        beam: &BeamFrame,
        sample: &SamplePose,
    ) -> [f64; 2] {
        if !tth.is_finite() || !eta.is_finite() {
            return [f64::NAN, f64::NAN];
        }
        let dir = beam.ray_from_angles(tth, eta);
        self.intersect_ray(&sample.tvec, &dir)
    }

    /// True when an ideal Cartesian point lies within the sensor extent.
    /// With `use_buffer`, the pixel's validity-buffer entry must also hold.
    pub fn on_panel(&self, xy: [f64; 2], use_buffer: bool) -> bool {
        if !xy[0].is_finite() || !xy[1].is_finite() {
            return false;
        }
        let (w, h) = self.extent_mm();
        if xy[0].abs() > w / 2.0 || xy[1].abs() > h / 2.0 {
            return false;
        }
        if use_buffer {
            if let Some(buffer) = &self.buffer {
                let ij = self.pixel_from_cart(xy);
                let i = ij[0].round() as isize;
                let j = ij[1].round() as isize;
                if i < 0 || j < 0 || i >= self.rows as isize || j >= self.cols as isize {
                    return false;
                }
                return buffer[i as usize * self.cols + j as usize];
            }
        }
        true
    }

    /// Filter a polyline to the points on the panel (see [`Panel::on_panel`]).
    pub fn clip_to_panel(&self, points: &[[f64; 2]], use_buffer: bool) -> Vec<[f64; 2]> {
        points
            .iter()
            .copied()
            .filter(|xy| self.on_panel(*xy, use_buffer))
            .collect()
    }

    /// Bilinear interpolation of `image` at ideal Cartesian points.
    ///
    /// Out-of-bounds points and points with any NaN neighbor yield NaN, so
    /// validity propagates through downstream masked sums.
    pub fn interpolate_bilinear(&self, points: &[[f64; 2]], image: &DMatrix<f64>) -> Vec<f64> {
        let mut out = Vec::with_capacity(points.len());
        for &xy in points {
            out.push(self.sample_bilinear(xy, image));
        }
        out
    }

    fn sample_bilinear(&self, xy: [f64; 2], image: &DMatrix<f64>) -> f64 {
        if !xy[0].is_finite() || !xy[1].is_finite() {
            return f64::NAN;
        }
        let ij = self.pixel_from_cart(xy);
        let i0 = ij[0].floor();
        let j0 = ij[1].floor();
        if i0 < 0.0 || j0 < 0.0 || i0 + 1.0 > (self.rows - 1) as f64 || j0 + 1.0 > (self.cols - 1) as f64
        {
            return f64::NAN;
        }
        let (i0u, j0u) = (i0 as usize, j0 as usize);
        let fi = ij[0] - i0;
        let fj = ij[1] - j0;
        let v00 = image[(i0u, j0u)];
        let v01 = image[(i0u, j0u + 1)];
        let v10 = image[(i0u + 1, j0u)];
        let v11 = image[(i0u + 1, j0u + 1)];
        v00 * (1.0 - fi) * (1.0 - fj)
            + v01 * (1.0 - fi) * fj
            + v10 * fi * (1.0 - fj)
            + v11 * fi * fj
    }

    /// Panel border polylines in `(tth, eta)` degrees for display, split
    /// where eta wraps (consecutive points further apart than half the eta
    /// span are disconnected with a NaN row).
    pub fn border_angles(
        &self,
        beam: &BeamFrame,
        sample: &SamplePose,
        period: EtaPeriod,
        samples_per_edge: usize,
    ) -> Vec<Vec<[f64; 2]>> {
        let n = samples_per_edge.max(2);
        let (w, h) = self.extent_mm();
        let (hw, hh) = (w / 2.0, h / 2.0);
        let mut borders = Vec::with_capacity(4);
        let edges: [([f64; 2], [f64; 2]); 4] = [
            ([-hw, -hh], [hw, -hh]),
            ([-hw, hh], [hw, hh]),
            ([-hw, -hh], [-hw, hh]),
            ([hw, -hh], [hw, hh]),
        ];
        for (p0, p1) in edges {
            let mut line = Vec::with_capacity(n);
            for k in 0..n {
                let f = k as f64 / (n - 1) as f64;
                let xy = [p0[0] + (p1[0] - p0[0]) * f, p0[1] + (p1[1] - p0[1]) * f];
                let (tth, eta) = self.cart_to_angles(xy, beam, sample, period);
                line.push([tth.to_degrees(), eta.to_degrees()]);
            }
            // Disconnect wrap-around jumps.
            let max_jump = 180.0;
            let mut split = Vec::with_capacity(line.len());
            for (k, pt) in line.iter().enumerate() {
                if k > 0 && (pt[1] - line[k - 1][1]).abs() > max_jump {
                    split.push([f64::NAN, f64::NAN]);
                }
                split.push(*pt);
            }
            borders.push(split);
        }
        borders
    }
}

/// Configuration errors raised while assembling or mutating an instrument.
#[derive(Debug, Clone, PartialEq)]
pub enum InstrumentError {
    UnknownPanel(String),
    InvalidPanel { name: String, reason: String },
    BadSchema { found: String, expected: String },
}

impl std::fmt::Display for InstrumentError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::UnknownPanel(name) => write!(f, "unknown panel '{}'", name),
            Self::InvalidPanel { name, reason } => {
                write!(f, "invalid panel '{}': {}", name, reason)
            }
            Self::BadSchema { found, expected } => {
                write!(f, "unsupported schema '{}' (expected '{}')", found, expected)
            }
        }
    }
}

impl std::error::Error for InstrumentError {}

/// Complete instrument: named panels + beam + sample pose.
///
/// Panels keep insertion-independent deterministic order (`BTreeMap`) so
/// that pick-target iteration and serialized output are reproducible.
#[derive(Debug, Clone, Default)]
pub struct Instrument {
    panels: std::collections::BTreeMap<String, Panel>,
    /// Incident beam; mutable during refinement.
    pub beam: Beam,
    /// Sample-stage pose; mutable during refinement.
    pub sample: SamplePose,
}

impl Instrument {
    pub fn new(beam: Beam, sample: SamplePose) -> Self {
        Self {
            panels: Default::default(),
            beam,
            sample,
        }
    }

    /// Insert or replace a panel. Zero-sized grids are rejected.
    pub fn add_panel(&mut self, name: impl Into<String>, panel: Panel) -> Result<(), InstrumentError> {
        let name = name.into();
        if panel.rows == 0 || panel.cols == 0 {
            return Err(InstrumentError::InvalidPanel {
                name,
                reason: "zero-sized pixel grid".into(),
            });
        }
        if panel.pitch.0 <= 0.0 || panel.pitch.1 <= 0.0 {
            return Err(InstrumentError::InvalidPanel {
                name,
                reason: "non-positive pixel pitch".into(),
            });
        }
        if let Some(buffer) = &panel.buffer {
            if buffer.len() != panel.rows * panel.cols {
                return Err(InstrumentError::InvalidPanel {
                    name,
                    reason: format!(
                        "validity buffer length {} does not match grid {}x{}",
                        buffer.len(),
                        panel.rows,
                        panel.cols
                    ),
                });
            }
        }
        self.panels.insert(name, panel);
        Ok(())
    }

    pub fn panel(&self, name: &str) -> Result<&Panel, InstrumentError> {
        self.panels
            .get(name)
            .ok_or_else(|| InstrumentError::UnknownPanel(name.to_string()))
    }

    pub fn panel_mut(&mut self, name: &str) -> Result<&mut Panel, InstrumentError> {
        self.panels
            .get_mut(name)
            .ok_or_else(|| InstrumentError::UnknownPanel(name.to_string()))
    }

    pub fn panels(&self) -> impl Iterator<Item = (&String, &Panel)> {
        self.panels.iter()
    }

    pub fn panel_names(&self) -> Vec<String> {
        self.panels.keys().cloned().collect()
    }

    pub fn n_panels(&self) -> usize {
        self.panels.len()
    }

    /// Diffraction angles of a lab point relative to the beam and sample
    /// origin, eta mapped into `period`.
    pub fn lab_to_angles(&self, lab: &Vector3<f64>, period: EtaPeriod) -> (f64, f64) {
        self.beam
            .frame()
            .angles_from_ray(&(lab - self.sample.tvec), period)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn flat_panel() -> Panel {
        Panel::planar(
            256,
            320,
            (0.2, 0.2),
            Vector3::new(12.0, -5.0, -650.0),
            Vector3::new(0.02, -0.015, 0.004),
        )
    }

    #[test]
    fn pixel_lab_roundtrip_planar() {
        let panel = flat_panel();
        for &ij in &[[0.0, 0.0], [10.5, 200.25], [255.0, 319.0], [128.0, 160.0]] {
            let lab = panel.pixel_to_lab(ij);
            let back = panel.lab_to_pixel(&lab).expect("finite");
            assert!((back[0] - ij[0]).abs() < 1e-9, "i: {} vs {}", back[0], ij[0]);
            assert!((back[1] - ij[1]).abs() < 1e-9, "j: {} vs {}", back[1], ij[1]);
        }
    }

    #[test]
    fn pixel_lab_roundtrip_with_distortion() {
        let mut panel = flat_panel();
        panel.distortion = Some(Distortion::RadialPolynomial {
            k: [-4.0e-6, 0.0, 0.0],
            center: [0.0, 0.0],
        });
        let ij = [40.0, 77.5];
        let lab = panel.pixel_to_lab(ij);
        let back = panel.lab_to_pixel(&lab).expect("finite");
        assert!((back[0] - ij[0]).abs() < 1e-6);
        assert!((back[1] - ij[1]).abs() < 1e-6);
    }

    #[test]
    fn pixel_lab_roundtrip_cylindrical() {
        let mut panel = flat_panel();
        panel.shape = PanelShape::Cylindrical { radius_mm: 800.0 };
        for &ij in &[[12.0, 3.0], [100.0, 310.0], [250.0, 160.0]] {
            let lab = panel.pixel_to_lab(ij);
            let back = panel.lab_to_pixel(&lab).expect("finite");
            assert!((back[0] - ij[0]).abs() < 1e-8);
            assert!((back[1] - ij[1]).abs() < 1e-8);
        }
    }

    #[test]
    fn angles_cart_roundtrip() {
        let panel = flat_panel();
        let beam = Beam::default().frame();
        let sample = SamplePose::default();
        let period = EtaPeriod::default();
        let xy = [5.0, -8.0];
        let (tth, eta) = panel.cart_to_angles(xy, &beam, &sample, period);
        assert!(tth.is_finite() && eta.is_finite());
        let back = panel.angles_to_cart(tth, eta, &beam, &sample);
        assert!((back[0] - xy[0]).abs() < 1e-8);
        assert!((back[1] - xy[1]).abs() < 1e-8);
    }

    #[test]
    fn ray_missing_panel_is_nan() {
        let panel = flat_panel();
        let beam = Beam::default().frame();
        let sample = SamplePose::default();
        // A ray pointing away from the detector.
        let xy = panel.angles_to_cart(
            std::f64::consts::PI - 0.01,
            0.0,
            &beam,
            &sample,
        );
        assert!(xy[0].is_nan() && xy[1].is_nan());
    }

    #[test]
    fn cylinder_ray_miss_is_nan() {
        let mut panel = flat_panel();
        panel.shape = PanelShape::Cylindrical { radius_mm: 800.0 };
        let origin = Vector3::zeros();
        // Straight up, never touches the detector at z ~ -650.
        let xy = panel.intersect_ray(&origin, &Vector3::new(0.0, 1.0, 0.0));
        assert!(xy[0].is_nan() && xy[1].is_nan());
    }

    #[test]
    fn bilinear_out_of_bounds_is_nan() {
        let panel = flat_panel();
        let image = DMatrix::from_element(panel.rows, panel.cols, 3.5);
        let (w, h) = panel.extent_mm();
        let vals = panel.interpolate_bilinear(&[[0.0, 0.0], [w, h]], &image);
        assert!((vals[0] - 3.5).abs() < 1e-12);
        assert!(vals[1].is_nan());
    }

    #[test]
    fn buffer_excludes_pixels_from_clip() {
        let mut panel = flat_panel();
        let mut buffer = vec![true; panel.rows * panel.cols];
        let dead = panel.cart_from_pixel([10.0, 10.0]);
        buffer[10 * panel.cols + 10] = false;
        panel.buffer = Some(buffer);
        assert!(panel.on_panel(dead, false));
        assert!(!panel.on_panel(dead, true));
    }

    #[test]
    fn border_angles_cover_four_edges() {
        let panel = flat_panel();
        let beam = Beam::default().frame();
        let sample = SamplePose::default();
        let borders = panel.border_angles(&beam, &sample, EtaPeriod::default(), 16);
        assert_eq!(borders.len(), 4);
        for line in &borders {
            assert!(line.len() >= 16);
            assert!(line
                .iter()
                .any(|p| p[0].is_finite() && p[1].is_finite()));
        }
    }

    #[test]
    fn add_panel_rejects_bad_buffer() {
        let mut instr = Instrument::default();
        let mut panel = flat_panel();
        panel.buffer = Some(vec![true; 7]);
        let err = instr.add_panel("bad", panel).unwrap_err();
        assert!(matches!(err, InstrumentError::InvalidPanel { .. }));
    }
}
