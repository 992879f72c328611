//! Predicted-feature overlays.
//!
//! An [`Overlay`] pairs a material with one of a closed set of kinds
//! (powder rings, Laue spots, rotation-series spots, const-chi rings) and
//! lazily generates per-panel feature geometry in the coordinates of the
//! active view. Regeneration is driven by an `update_needed` flag set when
//! the instrument, the material, or the view type changes, and cleared on
//! the next data request.

pub mod const_chi;
pub mod laue;
pub mod powder;
pub mod rotation_series;

use std::collections::BTreeMap;

use crate::instrument::angles::EtaPeriod;
use crate::instrument::{Instrument, Panel};
use crate::material::{CrystalParams, Material};
use crate::view::polar::PolarConfig;

/// Which coordinates overlay geometry is expressed in.
#[derive(Debug, Clone, Copy)]
pub enum ViewFrame<'a> {
    /// Per-panel fractional pixel coordinates (i, j).
    Raw,
    /// Cartesian coordinates (mm) on the given display panel.
    Cartesian(&'a Panel),
    /// (two-theta, eta) in degrees.
    Polar(&'a PolarConfig),
    /// Stereographic pixel coordinates (i, j).
    Stereo { size: usize },
}

/// Everything overlay generation needs from the session.
#[derive(Debug, Clone, Copy)]
pub struct OverlayContext<'a> {
    pub instrument: &'a Instrument,
    pub material: &'a Material,
    pub frame: ViewFrame<'a>,
    pub eta_period: EtaPeriod,
}

/// Overlay generation errors (configuration class; numerical edge cases
/// propagate as NaN/empty results instead).
#[derive(Debug, Clone, PartialEq)]
pub enum OverlayError {
    DegenerateMaterial(String),
}

impl std::fmt::Display for OverlayError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::DegenerateMaterial(name) => {
                write!(f, "material '{}' has a degenerate lattice", name)
            }
        }
    }
}

impl std::error::Error for OverlayError {}

/// Powder overlay parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct PowderParams {
    /// Number of eta samples around each ring.
    pub eta_steps: usize,
    /// Clip ring points against panel validity buffers.
    pub clip_with_panel_buffer: bool,
}

impl Default for PowderParams {
    fn default() -> Self {
        Self {
            eta_steps: 360,
            clip_with_panel_buffer: false,
        }
    }
}

/// Tolerance-region outline shape for Laue spots.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RangeShape {
    Rectangle,
    Ellipse,
}

/// Laue overlay parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct LaueParams {
    pub crystal: CrystalParams,
    pub min_energy_kev: f64,
    pub max_energy_kev: f64,
    /// Full tolerance widths (radians) for display regions and pick
    /// matching; `None` disables regions.
    pub tth_width: Option<f64>,
    pub eta_width: Option<f64>,
    pub range_shape: RangeShape,
}

impl Default for LaueParams {
    fn default() -> Self {
        Self {
            crystal: CrystalParams::default(),
            min_energy_kev: 5.0,
            max_energy_kev: 35.0,
            tth_width: None,
            eta_width: None,
            range_shape: RangeShape::Ellipse,
        }
    }
}

/// Rotation-series overlay parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct RotationSeriesParams {
    pub crystal: CrystalParams,
    /// Omega ranges (radians) the scan covers.
    pub ome_ranges: Vec<(f64, f64)>,
    /// Omega period lower edge (radians); the period spans a full turn.
    pub ome_period_min: f64,
    /// Eta acceptance ranges (radians).
    pub eta_ranges: Vec<(f64, f64)>,
    /// Show every rotation increment at once.
    pub aggregated: bool,
    /// Active frame's omega center (radians) when not aggregated.
    pub ome_frame_center: f64,
    /// Active frame's full omega width (radians).
    pub ome_frame_width: f64,
}

impl Default for RotationSeriesParams {
    fn default() -> Self {
        Self {
            crystal: CrystalParams::default(),
            ome_ranges: vec![(-std::f64::consts::PI, std::f64::consts::PI)],
            ome_period_min: -std::f64::consts::PI,
            eta_ranges: vec![(-std::f64::consts::PI, std::f64::consts::PI)],
            aggregated: true,
            ome_frame_center: 0.0,
            ome_frame_width: 0.25f64.to_radians(),
        }
    }
}

/// Const-chi overlay parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct ConstChiParams {
    /// Polar angles (radians) about the tilted sample axis; deduplicated
    /// and sorted on construction.
    pub chi_values: Vec<f64>,
    /// Points per ring.
    pub steps: usize,
}

impl ConstChiParams {
    pub fn new(mut chi_values: Vec<f64>) -> Self {
        chi_values.sort_by(f64::total_cmp);
        chi_values.dedup_by(|a, b| (*a - *b).abs() < 1e-12);
        Self {
            chi_values,
            steps: 360,
        }
    }
}

/// Closed set of overlay kinds.
#[derive(Debug, Clone, PartialEq)]
pub enum OverlayKind {
    Powder(PowderParams),
    Laue(LaueParams),
    RotationSeries(RotationSeriesParams),
    ConstChi(ConstChiParams),
}

impl OverlayKind {
    pub fn is_powder(&self) -> bool {
        matches!(self, Self::Powder(_))
    }

    pub fn is_laue(&self) -> bool {
        matches!(self, Self::Laue(_))
    }
}

/// Generated feature geometry for one panel, in active-view coordinates.
#[derive(Debug, Clone, Default)]
pub struct PanelOverlayData {
    /// Reflections contributing features on this panel.
    pub hkls: Vec<[i32; 3]>,
    /// Material plane-list index per local feature (powder rings only).
    pub ring_indices: Vec<usize>,
    /// Ring polylines, one per local reflection.
    pub rings: Vec<Vec<[f64; 2]>>,
    /// Tolerance-band boundary polylines (lower bounds then upper bounds).
    pub ring_ranges: Vec<Vec<[f64; 2]>>,
    /// Member plane-list indices per boundary polyline; more than one
    /// member marks a merged band.
    pub range_indices: Vec<Vec<usize>>,
    /// Predicted spot positions (Laue, rotation series).
    pub spots: Vec<[f64; 2]>,
    /// Photon energy (keV) per Laue spot.
    pub spot_energies: Vec<f64>,
    /// Omega (radians) per rotation-series spot.
    pub spot_omegas: Vec<f64>,
    /// Tolerance-region outlines per spot.
    pub spot_ranges: Vec<Vec<[f64; 2]>>,
}

/// Per-panel overlay data keyed by panel name.
pub type OverlayData = BTreeMap<String, PanelOverlayData>;

/// A named overlay with lazily regenerated data.
#[derive(Debug, Clone)]
pub struct Overlay {
    pub name: String,
    pub material_name: String,
    pub kind: OverlayKind,
    pub visible: bool,
    update_needed: bool,
    data: OverlayData,
}

impl Overlay {
    pub fn new(name: impl Into<String>, material_name: impl Into<String>, kind: OverlayKind) -> Self {
        Self {
            name: name.into(),
            material_name: material_name.into(),
            kind,
            visible: true,
            update_needed: true,
            data: OverlayData::new(),
        }
    }

    /// Flag the cached data stale (geometry/material/view change).
    pub fn mark_update_needed(&mut self) {
        self.update_needed = true;
    }

    pub fn update_needed(&self) -> bool {
        self.update_needed
    }

    /// Overlay data in the context's view coordinates, regenerating only
    /// when flagged stale. The flag clears after a successful regeneration.
    pub fn data(&mut self, ctx: &OverlayContext) -> Result<&OverlayData, OverlayError> {
        if self.update_needed {
            self.data = self.generate(ctx)?;
            self.update_needed = false;
            tracing::debug!(overlay = %self.name, "overlay regenerated");
        }
        Ok(&self.data)
    }

    /// Last generated data without regeneration (may be stale or empty).
    pub fn cached_data(&self) -> &OverlayData {
        &self.data
    }

    fn generate(&self, ctx: &OverlayContext) -> Result<OverlayData, OverlayError> {
        match &self.kind {
            OverlayKind::Powder(params) => powder::generate(ctx, params),
            OverlayKind::Laue(params) => laue::generate(ctx, params),
            OverlayKind::RotationSeries(params) => rotation_series::generate(ctx, params),
            OverlayKind::ConstChi(params) => const_chi::generate(ctx, params),
        }
    }

    /// Number of pickable targets per panel (rings for powder, spots for
    /// Laue); used to enforce the pick padding invariant.
    pub fn reflection_counts(&self) -> BTreeMap<String, usize> {
        self.data
            .iter()
            .map(|(name, panel)| {
                let n = if self.kind.is_powder() {
                    panel.rings.len()
                } else {
                    panel.spots.len()
                };
                (name.clone(), n)
            })
            .collect()
    }
}

/// Map a clipped, distorted panel-Cartesian point into the view frame.
///
/// `xy` is the measured (distortion-applied) panel coordinate; conversions
/// that need ideal coordinates undo the distortion first.
pub(crate) fn cart_to_view(
    xy: [f64; 2],
    panel: &Panel,
    ctx: &OverlayContext,
) -> [f64; 2] {
    match ctx.frame {
        ViewFrame::Raw => panel.pixel_from_cart(xy),
        ViewFrame::Cartesian(display) => {
            let ideal = undistort(panel, xy);
            let lab = panel.surface_to_lab(ideal);
            let origin = ctx.instrument.sample.tvec;
            display.intersect_ray(&origin, &(lab - origin))
        }
        ViewFrame::Polar(_) => {
            let ideal = undistort(panel, xy);
            let (tth, eta) = panel.cart_to_angles(
                ideal,
                &ctx.instrument.beam.frame(),
                &ctx.instrument.sample,
                ctx.eta_period,
            );
            [tth.to_degrees(), eta.to_degrees()]
        }
        ViewFrame::Stereo { size } => {
            let ideal = undistort(panel, xy);
            let (tth, eta) = panel.cart_to_angles(
                ideal,
                &ctx.instrument.beam.frame(),
                &ctx.instrument.sample,
                ctx.eta_period,
            );
            crate::instrument::angles::stereo_ij_from_angles(tth, eta, size)
        }
    }
}

fn undistort(panel: &Panel, xy: [f64; 2]) -> [f64; 2] {
    match &panel.distortion {
        Some(d) => d.apply(xy),
        None => xy,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instrument::{Beam, SamplePose};
    use crate::material::Lattice;
    use nalgebra::Vector3;

    fn setup() -> (Instrument, Material) {
        let mut instr = Instrument::new(Beam::default(), SamplePose::default());
        instr
            .add_panel(
                "d0",
                Panel::planar(
                    800,
                    800,
                    (0.4, 0.4),
                    Vector3::new(0.0, 0.0, -800.0),
                    Vector3::zeros(),
                ),
            )
            .unwrap();
        let material = Material::new(
            "CeO2",
            Lattice::cubic(5.41153),
            vec![[1, 1, 1], [2, 0, 0], [2, 2, 0]],
        );
        (instr, material)
    }

    #[test]
    fn data_regenerates_only_when_flagged() {
        let (instr, material) = setup();
        let polar = PolarConfig::default();
        let ctx = OverlayContext {
            instrument: &instr,
            material: &material,
            frame: ViewFrame::Polar(&polar),
            eta_period: EtaPeriod::default(),
        };
        let mut overlay = Overlay::new("CeO2 powder", "CeO2", OverlayKind::Powder(PowderParams::default()));
        assert!(overlay.update_needed());
        overlay.data(&ctx).unwrap();
        assert!(!overlay.update_needed());

        // Cached data survives until the flag is raised again.
        let before = overlay.cached_data().len();
        overlay.mark_update_needed();
        overlay.data(&ctx).unwrap();
        assert_eq!(overlay.cached_data().len(), before);
    }
}
