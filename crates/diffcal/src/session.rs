//! Explicit session context.
//!
//! One [`Session`] object owns the instrument, the loaded materials, the
//! active view settings, the mask set, and the overlays, and is passed
//! explicitly to the components that need it; there is no global
//! configuration. Mutations route through methods that raise the right
//! dirty flags: overlays regenerate lazily on their next data request, and
//! the polar view drops its geometry-dependent caches.

use std::collections::BTreeMap;

use crate::instrument::angles::EtaPeriod;
use crate::instrument::{Instrument, Panel};
use crate::material::{Material, MaterialError};
use crate::overlay::{Overlay, OverlayContext, OverlayData, OverlayError, OverlayKind, ViewFrame};
use crate::refine::RefinableModel;
use crate::view::cartesian::DisplayPlane;
use crate::view::mask::MaskSet;
use crate::view::polar::{PolarConfig, PolarProcessing, PolarView};
use crate::view::stereo::StereoConfig;
use crate::view::{PanelImages, ViewError, ViewType};

/// The central context: instrument + materials + view settings + overlays.
#[derive(Debug)]
pub struct Session {
    pub instrument: Instrument,
    materials: BTreeMap<String, Material>,
    pub overlays: Vec<Overlay>,
    view_type: ViewType,
    pub polar: PolarConfig,
    pub polar_processing: PolarProcessing,
    pub stereo: StereoConfig,
    pub display_plane: DisplayPlane,
    pub masks: MaskSet,
    polar_view: Option<PolarView>,
    cartesian_panel: Option<Panel>,
}

impl Session {
    pub fn new(instrument: Instrument) -> Self {
        Self {
            instrument,
            materials: BTreeMap::new(),
            overlays: Vec::new(),
            view_type: ViewType::Polar,
            polar: PolarConfig::default(),
            polar_processing: PolarProcessing::default(),
            stereo: StereoConfig::default(),
            display_plane: DisplayPlane::default(),
            masks: MaskSet::default(),
            polar_view: None,
            cartesian_panel: None,
        }
    }

    pub fn view_type(&self) -> ViewType {
        self.view_type
    }

    /// Switch the active view; all overlay data must follow the new
    /// coordinate system.
    pub fn set_view_type(&mut self, view_type: ViewType) {
        if self.view_type != view_type {
            self.view_type = view_type;
            self.mark_overlays_stale();
        }
    }

    pub fn eta_period(&self) -> EtaPeriod {
        self.polar.eta_period()
    }

    // ── materials ─────────────────────────────────────────────────────

    pub fn add_material(&mut self, material: Material) {
        self.materials.insert(material.name.clone(), material);
    }

    pub fn material(&self, name: &str) -> Result<&Material, MaterialError> {
        self.materials
            .get(name)
            .ok_or_else(|| MaterialError::MissingMaterial(name.to_string()))
    }

    /// Replace a material's lattice/plane data and flag its overlays.
    pub fn update_material(&mut self, material: Material) {
        let name = material.name.clone();
        self.materials.insert(name.clone(), material);
        for overlay in &mut self.overlays {
            if overlay.material_name == name {
                overlay.mark_update_needed();
            }
        }
    }

    pub fn materials(&self) -> &BTreeMap<String, Material> {
        &self.materials
    }

    // ── geometry mutation ─────────────────────────────────────────────

    /// Update a panel pose; overlays and view caches go stale.
    pub fn set_panel_pose(
        &mut self,
        name: &str,
        tvec: nalgebra::Vector3<f64>,
        tilt: nalgebra::Vector3<f64>,
    ) -> Result<(), crate::instrument::InstrumentError> {
        let panel = self.instrument.panel_mut(name)?;
        panel.tvec = tvec;
        panel.tilt = tilt;
        self.mark_geometry_changed();
        Ok(())
    }

    /// Mutate the beam; overlays and view caches go stale.
    pub fn set_beam_energy(&mut self, energy_kev: f64) {
        self.instrument.beam.energy_kev = energy_kev;
        self.mark_geometry_changed();
    }

    /// Every overlay regenerates on its next data request.
    pub fn mark_overlays_stale(&mut self) {
        for overlay in &mut self.overlays {
            overlay.mark_update_needed();
        }
    }

    /// Geometry changed: overlays stale, distortion/display caches dropped.
    pub fn mark_geometry_changed(&mut self) {
        self.mark_overlays_stale();
        self.cartesian_panel = None;
        if let Some(view) = &mut self.polar_view {
            view.invalidate_corr_field();
        }
    }

    // ── overlays ──────────────────────────────────────────────────────

    pub fn add_overlay(&mut self, overlay: Overlay) {
        self.overlays.push(overlay);
    }

    pub fn visible_overlay_indices(&self) -> Vec<usize> {
        self.overlays
            .iter()
            .enumerate()
            .filter(|(_, o)| o.visible)
            .map(|(i, _)| i)
            .collect()
    }

    /// Current data for one overlay, regenerated if stale.
    pub fn overlay_data(&mut self, idx: usize) -> Result<&OverlayData, SessionContextError> {
        if matches!(self.view_type, ViewType::Cartesian) && self.cartesian_panel.is_none() {
            self.cartesian_panel = Some(
                self.display_plane
                    .display_panel(&self.instrument)
                    .map_err(SessionContextError::View)?,
            );
        }

        let Self {
            instrument,
            materials,
            overlays,
            view_type,
            polar,
            stereo,
            cartesian_panel,
            ..
        } = self;
        let overlay = overlays
            .get_mut(idx)
            .ok_or(SessionContextError::NoSuchOverlay(idx))?;
        let material = materials
            .get(&overlay.material_name)
            .ok_or_else(|| {
                SessionContextError::Material(MaterialError::MissingMaterial(
                    overlay.material_name.clone(),
                ))
            })?;

        let frame = match view_type {
            ViewType::Raw => ViewFrame::Raw,
            ViewType::Polar => ViewFrame::Polar(polar),
            ViewType::Stereo => ViewFrame::Stereo { size: stereo.size },
            ViewType::Cartesian => {
                ViewFrame::Cartesian(cartesian_panel.as_ref().expect("cached above"))
            }
        };
        let ctx = OverlayContext {
            instrument,
            material,
            frame,
            eta_period: polar.eta_period(),
        };
        overlay.data(&ctx).map_err(SessionContextError::Overlay)
    }

    /// Regenerate every visible overlay (e.g. before starting a pick
    /// session, which needs current polar-frame data).
    pub fn refresh_visible_overlays(&mut self) -> Result<(), SessionContextError> {
        for idx in self.visible_overlay_indices() {
            self.overlay_data(idx)?;
        }
        Ok(())
    }

    // ── view synthesis ────────────────────────────────────────────────

    /// Build (or rebuild) the polar view from per-panel images.
    pub fn synthesize_polar(&mut self, images: &PanelImages) -> Result<&PolarView, ViewError> {
        let mut view = PolarView::new(self.polar.clone(), self.polar_processing.clone())?;
        view.warp_all(&self.instrument, images, &self.masks)?;
        self.polar_view = Some(view);
        Ok(self.polar_view.as_ref().expect("just set"))
    }

    pub fn polar_view(&self) -> Option<&PolarView> {
        self.polar_view.as_ref()
    }

    pub fn polar_view_mut(&mut self) -> Option<&mut PolarView> {
        self.polar_view.as_mut()
    }

    // ── refinement bridge ─────────────────────────────────────────────

    /// Deep-copied model slice for a refinement or auto-pick worker.
    pub fn snapshot_model(&self) -> RefinableModel {
        let mut crystals = BTreeMap::new();
        for overlay in &self.overlays {
            match &overlay.kind {
                OverlayKind::Laue(p) => {
                    crystals.insert(overlay.name.clone(), p.crystal.clone());
                }
                OverlayKind::RotationSeries(p) => {
                    crystals.insert(overlay.name.clone(), p.crystal.clone());
                }
                _ => {}
            }
        }
        RefinableModel {
            instrument: self.instrument.clone(),
            materials: self.materials.clone(),
            crystals,
        }
    }

    /// Commit refined parameters back into the session (primary thread
    /// only) and flag every overlay for regeneration.
    pub fn apply_refined_model(&mut self, model: RefinableModel) {
        self.instrument = model.instrument;
        self.materials = model.materials;
        for overlay in &mut self.overlays {
            if let Some(crystal) = model.crystals.get(&overlay.name) {
                match &mut overlay.kind {
                    OverlayKind::Laue(p) => p.crystal = crystal.clone(),
                    OverlayKind::RotationSeries(p) => p.crystal = crystal.clone(),
                    _ => {}
                }
            }
        }
        self.mark_geometry_changed();
    }
}

/// Errors surfaced by session-level operations.
#[derive(Debug)]
pub enum SessionContextError {
    NoSuchOverlay(usize),
    Material(MaterialError),
    Overlay(OverlayError),
    View(ViewError),
}

impl std::fmt::Display for SessionContextError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NoSuchOverlay(idx) => write!(f, "no overlay at index {}", idx),
            Self::Material(e) => write!(f, "{}", e),
            Self::Overlay(e) => write!(f, "{}", e),
            Self::View(e) => write!(f, "{}", e),
        }
    }
}

impl std::error::Error for SessionContextError {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instrument::{Beam, SamplePose};
    use crate::material::Lattice;
    use crate::overlay::PowderParams;
    use nalgebra::Vector3;

    fn session() -> Session {
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
        let mut session = Session::new(instr);
        session.add_material(Material::new(
            "CeO2",
            Lattice::cubic(5.41153),
            vec![[1, 1, 1], [2, 0, 0]],
        ));
        session.add_overlay(Overlay::new(
            "CeO2 powder",
            "CeO2",
            OverlayKind::Powder(PowderParams::default()),
        ));
        session
    }

    #[test]
    fn geometry_change_marks_overlays_stale() {
        let mut session = session();
        session.overlay_data(0).unwrap();
        assert!(!session.overlays[0].update_needed());

        session
            .set_panel_pose(
                "d0",
                Vector3::new(1.0, 0.0, -800.0),
                Vector3::zeros(),
            )
            .unwrap();
        assert!(session.overlays[0].update_needed());
        session.overlay_data(0).unwrap();
        assert!(!session.overlays[0].update_needed());
    }

    #[test]
    fn view_type_change_marks_overlays_stale() {
        let mut session = session();
        session.overlay_data(0).unwrap();
        session.set_view_type(ViewType::Stereo);
        assert!(session.overlays[0].update_needed());
        // Same view type again is a no-op.
        session.overlay_data(0).unwrap();
        session.set_view_type(ViewType::Stereo);
        assert!(!session.overlays[0].update_needed());
    }

    #[test]
    fn missing_material_is_a_configuration_error() {
        let mut session = session();
        session.add_overlay(Overlay::new(
            "ghost",
            "unobtainium",
            OverlayKind::Powder(PowderParams::default()),
        ));
        let err = session.overlay_data(1).unwrap_err();
        assert!(err.to_string().contains("unobtainium"));
    }

    #[test]
    fn refined_model_roundtrip_updates_session() {
        let mut session = session();
        let mut model = session.snapshot_model();
        model.instrument.panel_mut("d0").unwrap().tvec.x = 5.5;
        session.apply_refined_model(model);
        assert_eq!(session.instrument.panel("d0").unwrap().tvec.x, 5.5);
        assert!(session.overlays[0].update_needed());
    }
}
