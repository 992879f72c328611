//! Polar (two-theta, eta) view synthesis.
//!
//! Builds a fixed-resolution angular grid, inverse-maps every grid cell onto
//! each panel (angles -> ideal Cartesian -> distorted Cartesian -> bilinear
//! sample), and merges panels by masked sum. Processing stages are cached
//! separately (raw warp -> background-subtracted -> distortion-corrected ->
//! masked) so late-stage settings changes do not pay for re-warping.

use std::collections::BTreeMap;

use nalgebra::DMatrix;

use crate::instrument::angles::EtaPeriod;
use crate::instrument::{Instrument, Panel};

use super::mask::MaskSet;
use super::snip;
use super::{validate_panel_images, MaskedImage, PanelImages, ViewError};

/// Angular extent and resolution of the polar grid.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct PolarConfig {
    pub tth_min_deg: f64,
    pub tth_max_deg: f64,
    pub eta_min_deg: f64,
    pub eta_max_deg: f64,
    /// Pixel size along two-theta, degrees.
    pub tth_pixel_size_deg: f64,
    /// Pixel size along eta, degrees.
    pub eta_pixel_size_deg: f64,
}

impl Default for PolarConfig {
    fn default() -> Self {
        Self {
            tth_min_deg: 1.0,
            tth_max_deg: 20.0,
            eta_min_deg: -180.0,
            eta_max_deg: 180.0,
            tth_pixel_size_deg: 0.01,
            eta_pixel_size_deg: 0.25,
        }
    }
}

impl PolarConfig {
    pub fn ntth(&self) -> usize {
        ((self.tth_max_deg - self.tth_min_deg) / self.tth_pixel_size_deg).round() as usize
    }

    pub fn neta(&self) -> usize {
        ((self.eta_max_deg - self.eta_min_deg) / self.eta_pixel_size_deg).round() as usize
    }

    /// (rows, cols) = (neta, ntth).
    pub fn shape(&self) -> (usize, usize) {
        (self.neta(), self.ntth())
    }

    pub fn eta_period(&self) -> EtaPeriod {
        EtaPeriod::from_min_degrees(self.eta_min_deg)
    }

    /// Two-theta cell centers in radians.
    pub fn tth_centers(&self) -> Vec<f64> {
        (0..self.ntth())
            .map(|c| (self.tth_min_deg + (c as f64 + 0.5) * self.tth_pixel_size_deg).to_radians())
            .collect()
    }

    /// Eta cell centers in radians.
    pub fn eta_centers(&self) -> Vec<f64> {
        (0..self.neta())
            .map(|r| (self.eta_min_deg + (r as f64 + 0.5) * self.eta_pixel_size_deg).to_radians())
            .collect()
    }

    /// Fractional polar pixel (i, j) of an angular coordinate (radians).
    pub fn angles_to_pixel(&self, tth: f64, eta: f64) -> [f64; 2] {
        [
            (eta.to_degrees() - self.eta_min_deg) / self.eta_pixel_size_deg - 0.5,
            (tth.to_degrees() - self.tth_min_deg) / self.tth_pixel_size_deg - 0.5,
        ]
    }

    /// Display extent `[tth_min, tth_max, eta_max, eta_min]` in degrees.
    pub fn extent(&self) -> [f64; 4] {
        [
            self.tth_min_deg,
            self.tth_max_deg,
            self.eta_max_deg,
            self.eta_min_deg,
        ]
    }

    fn validate(&self) -> Result<(), ViewError> {
        if self.tth_pixel_size_deg <= 0.0 || self.eta_pixel_size_deg <= 0.0 {
            return Err(ViewError::BadConfig("non-positive pixel size".into()));
        }
        if self.ntth() == 0 || self.neta() == 0 {
            return Err(ViewError::BadConfig("empty polar grid".into()));
        }
        Ok(())
    }
}

/// Background-subtraction and distortion-correction settings.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct PolarProcessing {
    pub apply_snip: bool,
    /// Background estimator width, degrees two-theta.
    pub snip_width_deg: f64,
    pub snip_numiter: usize,
    /// Mask pixels near valid-run borders after background subtraction.
    pub apply_erosion: bool,
}

impl Default for PolarProcessing {
    fn default() -> Self {
        Self {
            apply_snip: false,
            snip_width_deg: 1.0,
            snip_numiter: 2,
            apply_erosion: false,
        }
    }
}

/// Optional two-theta displacement field.
///
/// A direct field is defined on the polar grid; a per-panel field is first
/// warped into polar space with the same per-panel warp as the base image.
#[derive(Debug, Clone)]
pub enum TthDistortion {
    /// Displacement (radians) per polar-grid cell.
    PolarField(DMatrix<f64>),
    /// Displacement (radians) per panel pixel, keyed by panel name.
    PerPanel(BTreeMap<String, DMatrix<f64>>),
}

/// Polar view synthesizer with staged caches.
#[derive(Debug, Clone)]
pub struct PolarView {
    cfg: PolarConfig,
    processing: PolarProcessing,
    /// Per-panel warped images (raw-warp stage cache).
    warp_images: BTreeMap<String, MaskedImage>,
    /// Which polar pixels each panel contributes to.
    panel_has_data: BTreeMap<String, DMatrix<bool>>,
    raw_img: Option<MaskedImage>,
    snip_background: Option<DMatrix<f64>>,
    /// Background-subtracted stage cache.
    snipped_img: Option<MaskedImage>,
    /// Polar-space displacement field cache.
    corr_field: Option<MaskedImage>,
    display_img: Option<MaskedImage>,
    computation_img: Option<MaskedImage>,
}

impl PolarView {
    pub fn new(cfg: PolarConfig, processing: PolarProcessing) -> Result<Self, ViewError> {
        cfg.validate()?;
        Ok(Self {
            cfg,
            processing,
            warp_images: BTreeMap::new(),
            panel_has_data: BTreeMap::new(),
            raw_img: None,
            snip_background: None,
            snipped_img: None,
            corr_field: None,
            display_img: None,
            computation_img: None,
        })
    }

    pub fn config(&self) -> &PolarConfig {
        &self.cfg
    }

    pub fn processing(&self) -> &PolarProcessing {
        &self.processing
    }

    /// Replace the processing settings; downstream caches are dropped, the
    /// raw warp is kept.
    pub fn set_processing(&mut self, processing: PolarProcessing) {
        if self.processing != processing {
            self.processing = processing;
            self.snipped_img = None;
            self.snip_background = None;
            self.display_img = None;
            self.computation_img = None;
        }
    }

    /// Warp one panel image into the polar grid.
    pub fn warp_image(&self, instrument: &Instrument, panel: &Panel, img: &DMatrix<f64>) -> MaskedImage {
        let beam = instrument.beam.frame();
        let tths = self.cfg.tth_centers();
        let etas = self.cfg.eta_centers();
        let mut out = MaskedImage::invalid(etas.len(), tths.len());
        for (r, &eta) in etas.iter().enumerate() {
            for (c, &tth) in tths.iter().enumerate() {
                let mut xy = panel.angles_to_cart(tth, eta, &beam, &instrument.sample);
                if let Some(d) = &panel.distortion {
                    xy = d.apply_inverse(xy);
                }
                let v = panel.interpolate_bilinear(&[xy], img)[0];
                if v.is_finite() {
                    out.data[(r, c)] = v;
                    out.valid[(r, c)] = true;
                }
            }
        }
        out
    }

    /// Warp every panel and regenerate all stages.
    ///
    /// Fails fatally when image keys or shapes violate the input contract.
    pub fn warp_all(
        &mut self,
        instrument: &Instrument,
        images: &PanelImages,
        masks: &MaskSet,
    ) -> Result<(), ViewError> {
        validate_panel_images(instrument, images)?;

        self.warp_images.clear();
        self.panel_has_data.clear();
        for (name, panel) in instrument.panels() {
            let mut img = images[name].clone();
            super::apply_panel_buffer(panel, &mut img, 0.0);
            let warped = self.warp_image(instrument, panel, &img);
            self.panel_has_data.insert(name.clone(), warped.valid.clone());
            self.warp_images.insert(name.clone(), warped);
        }
        tracing::info!(
            n_panels = self.warp_images.len(),
            shape = ?self.cfg.shape(),
            "polar warp complete"
        );
        self.generate_image(instrument, masks)
    }

    /// Re-warp only the listed panels (after a geometry change), then
    /// regenerate downstream stages.
    pub fn update_panels(
        &mut self,
        instrument: &Instrument,
        names: &[String],
        images: &PanelImages,
        masks: &MaskSet,
    ) -> Result<(), ViewError> {
        self.corr_field = None;
        for name in names {
            let panel = instrument
                .panel(name)
                .map_err(|_| ViewError::PanelKeyMismatch {
                    expected: instrument.panel_names(),
                    found: names.to_vec(),
                })?;
            let img = images.get(name).ok_or_else(|| ViewError::PanelKeyMismatch {
                expected: instrument.panel_names(),
                found: images.keys().cloned().collect(),
            })?;
            let mut img = img.clone();
            super::apply_panel_buffer(panel, &mut img, 0.0);
            let warped = self.warp_image(instrument, panel, &img);
            self.panel_has_data.insert(name.clone(), warped.valid.clone());
            self.warp_images.insert(name.clone(), warped);
        }
        self.generate_image(instrument, masks)
    }

    /// Merge warped panels and run the processing stages.
    fn generate_image(&mut self, instrument: &Instrument, masks: &MaskSet) -> Result<(), ViewError> {
        let raw = MaskedImage::masked_sum(self.warp_images.values())
            .unwrap_or_else(|| MaskedImage::invalid(self.cfg.neta(), self.cfg.ntth()));
        self.raw_img = Some(raw);
        self.apply_processing(instrument, masks)
    }

    fn apply_processing(&mut self, instrument: &Instrument, masks: &MaskSet) -> Result<(), ViewError> {
        let raw = self.raw_img.as_ref().expect("raw image present");
        let mut img = raw.clone();

        if self.processing.apply_snip {
            let width = snip::snip_width_pixels(
                self.processing.snip_width_deg,
                self.cfg.tth_pixel_size_deg,
            );
            // The estimator must not see masked intensities.
            let masked_data = img.filled(f64::NAN);
            let background = snip::snip1d(&masked_data, width, self.processing.snip_numiter);
            for idx in 0..img.data.len() {
                if img.valid[idx] && background[idx].is_finite() {
                    img.data[idx] -= background[idx];
                }
            }
            if self.processing.apply_erosion {
                let eroded = snip::erode_validity(&img.valid, width, self.processing.snip_numiter);
                img.valid = eroded;
            }
            self.snip_background = Some(background);
        } else {
            self.snip_background = None;
        }

        self.snipped_img = Some(img);
        self.reapply_masks(instrument, masks)
    }

    /// Re-run only the mask/distortion stages from the background-subtracted
    /// cache.
    pub fn reapply_masks(&mut self, instrument: &Instrument, masks: &MaskSet) -> Result<(), ViewError> {
        let Some(snipped) = self.snipped_img.clone() else {
            return Ok(());
        };

        // Masks are applied before the tth distortion so that they are
        // distorted together with the image.
        let mut display = snipped;
        let visible = masks.visible_exclusion(&self.cfg, instrument, &display.data)?;
        display.exclude(&visible);

        let mut computation = display.clone();
        let boundary = masks.boundary_exclusion(&self.cfg, instrument)?;
        computation.exclude(&boundary);

        self.display_img = Some(display);
        self.computation_img = Some(computation);
        Ok(())
    }

    /// Apply a two-theta displacement field to the current stages.
    pub fn apply_tth_distortion(
        &mut self,
        instrument: &Instrument,
        distortion: &TthDistortion,
    ) -> Result<(), ViewError> {
        let corr = self.corr_field_polar(instrument, distortion)?;
        for target in [&mut self.display_img, &mut self.computation_img] {
            if let Some(img) = target.take() {
                *target = Some(shift_tth(&img, &corr, self.cfg.tth_pixel_size_deg));
            }
        }
        Ok(())
    }

    /// The polar-space displacement field, warping per-panel fields with the
    /// same warp as the base image. Cached until geometry changes.
    fn corr_field_polar(
        &mut self,
        instrument: &Instrument,
        distortion: &TthDistortion,
    ) -> Result<MaskedImage, ViewError> {
        if let Some(cached) = &self.corr_field {
            return Ok(cached.clone());
        }
        let field = match distortion {
            TthDistortion::PolarField(field) => {
                if field.shape() != self.cfg.shape() {
                    return Err(ViewError::BadConfig(
                        "polar displacement field shape mismatch".into(),
                    ));
                }
                MaskedImage::from_data(field.clone())
            }
            TthDistortion::PerPanel(fields) => {
                let mut warped = Vec::new();
                for (name, panel) in instrument.panels() {
                    let Some(field) = fields.get(name) else {
                        return Err(ViewError::PanelKeyMismatch {
                            expected: instrument.panel_names(),
                            found: fields.keys().cloned().collect(),
                        });
                    };
                    warped.push(self.warp_image(instrument, panel, field));
                }
                MaskedImage::masked_sum(warped.iter())
                    .unwrap_or_else(|| MaskedImage::invalid(self.cfg.neta(), self.cfg.ntth()))
            }
        };
        self.corr_field = Some(field.clone());
        Ok(field)
    }

    /// Drop the cached displacement field (geometry changed).
    pub fn invalidate_corr_field(&mut self) {
        self.corr_field = None;
    }

    /// Raw merged polar image (before background subtraction and masks).
    pub fn raw_image(&self) -> Option<&MaskedImage> {
        self.raw_img.as_ref()
    }

    /// Estimated background, when SNIP ran.
    pub fn snip_background(&self) -> Option<&DMatrix<f64>> {
        self.snip_background.as_ref()
    }

    /// Image with visible masks applied (what the rendering layer shows).
    pub fn display_image(&self) -> Option<&MaskedImage> {
        self.display_img.as_ref()
    }

    /// Image with visible and boundary masks applied (what computations use).
    pub fn computation_image(&self) -> Option<&MaskedImage> {
        self.computation_img.as_ref()
    }

    /// Which polar pixels a given panel contributes to.
    pub fn panel_has_data(&self, panel: &str) -> Option<&DMatrix<bool>> {
        self.panel_has_data.get(panel)
    }
}

/// Shift each pixel's two-theta coordinate by a displacement field
/// (edge-clamped linear resampling along the tth axis).
fn shift_tth(img: &MaskedImage, corr: &MaskedImage, tth_pixel_size_deg: f64) -> MaskedImage {
    let (rows, cols) = img.shape();
    let mut out = MaskedImage::invalid(rows, cols);
    for r in 0..rows {
        for c in 0..cols {
            let shift = if corr.valid[(r, c)] {
                corr.data[(r, c)].to_degrees() / tth_pixel_size_deg
            } else {
                0.0
            };
            let src = c as f64 - shift;
            let src = src.clamp(0.0, (cols - 1) as f64);
            let c0 = src.floor() as usize;
            let c1 = (c0 + 1).min(cols - 1);
            let f = src - c0 as f64;
            if img.valid[(r, c0)] && img.valid[(r, c1)] {
                out.data[(r, c)] = img.data[(r, c0)] * (1.0 - f) + img.data[(r, c1)] * f;
                out.valid[(r, c)] = true;
            } else if img.valid[(r, c0)] && f < 0.5 {
                out.data[(r, c)] = img.data[(r, c0)];
                out.valid[(r, c)] = true;
            } else if img.valid[(r, c1)] && f >= 0.5 {
                out.data[(r, c)] = img.data[(r, c1)];
                out.valid[(r, c)] = true;
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instrument::{Beam, Instrument, Panel, SamplePose};
    use nalgebra::Vector3;

    /// Two flat panels side by side so that panel "a" covers low two-theta
    /// and panel "b" high two-theta, overlapping near the middle.
    fn split_instrument() -> (Instrument, PanelImages) {
        let mut instr = Instrument::new(Beam::default(), SamplePose::default());
        let z = -1000.0;
        // tth in [5, 15] deg maps to radii ~ [87, 268] mm at this distance.
        let a = Panel::planar(
            900,
            420,
            (0.5, 0.5),
            Vector3::new(130.0, 0.0, z),
            Vector3::zeros(),
        );
        let b = Panel::planar(
            900,
            420,
            (0.5, 0.5),
            Vector3::new(230.0, 0.0, z),
            Vector3::zeros(),
        );
        instr.add_panel("a", a).unwrap();
        instr.add_panel("b", b).unwrap();

        let mut images = PanelImages::new();
        images.insert("a".into(), DMatrix::from_element(900, 420, 1.0));
        images.insert("b".into(), DMatrix::from_element(900, 420, 3.0));
        (instr, images)
    }

    fn narrow_cfg() -> PolarConfig {
        PolarConfig {
            tth_min_deg: 5.0,
            tth_max_deg: 15.0,
            eta_min_deg: -5.0,
            eta_max_deg: 5.0,
            tth_pixel_size_deg: 1.0,
            eta_pixel_size_deg: 1.0,
        }
    }

    #[test]
    fn merged_view_covers_overlap_and_keeps_exclusive_values() {
        let (instr, images) = split_instrument();
        let mut view = PolarView::new(narrow_cfg(), PolarProcessing::default()).unwrap();
        view.warp_all(&instr, &images, &MaskSet::default()).unwrap();

        let img = view.computation_image().expect("generated");
        let tths = view.config().tth_centers();
        let col_of = |deg: f64| {
            tths.iter()
                .position(|&t| (t.to_degrees() - deg).abs() < 0.51)
                .unwrap()
        };
        let mid_row = view.config().neta() / 2;

        // Exclusive columns carry each panel's own intensity.
        assert_eq!(img.data[(mid_row, col_of(6.0))], 1.0);
        assert!(img.valid[(mid_row, col_of(6.0))]);
        assert_eq!(img.data[(mid_row, col_of(14.0))], 3.0);
        assert!(img.valid[(mid_row, col_of(14.0))]);

        // The overlap column must have no invalid pixels.
        let overlap = col_of(10.0);
        for r in 0..view.config().neta() {
            assert!(img.valid[(r, overlap)], "invalid pixel in overlap at row {r}");
        }
    }

    #[test]
    fn mismatched_keys_abort_generation() {
        let (instr, mut images) = split_instrument();
        images.remove("b");
        let mut view = PolarView::new(narrow_cfg(), PolarProcessing::default()).unwrap();
        let err = view
            .warp_all(&instr, &images, &MaskSet::default())
            .unwrap_err();
        assert!(matches!(err, ViewError::PanelKeyMismatch { .. }));
        assert!(view.computation_image().is_none());
    }

    #[test]
    fn snip_stage_subtracts_flat_background() {
        // Single panel fully covering the grid, so the raw polar image is
        // constant and therefore pure background.
        let mut instr = Instrument::new(Beam::default(), SamplePose::default());
        let panel = Panel::planar(
            900,
            420,
            (0.5, 0.5),
            Vector3::new(160.0, 0.0, -1000.0),
            Vector3::zeros(),
        );
        instr.add_panel("a", panel).unwrap();
        let mut images = PanelImages::new();
        images.insert("a".into(), DMatrix::from_element(900, 420, 1.0));

        let cfg = PolarConfig {
            tth_min_deg: 5.0,
            tth_max_deg: 13.0,
            eta_min_deg: -5.0,
            eta_max_deg: 5.0,
            tth_pixel_size_deg: 1.0,
            eta_pixel_size_deg: 1.0,
        };
        let processing = PolarProcessing {
            apply_snip: true,
            snip_width_deg: 2.0,
            snip_numiter: 2,
            apply_erosion: false,
        };
        let mut view = PolarView::new(cfg, processing).unwrap();
        view.warp_all(&instr, &images, &MaskSet::default()).unwrap();
        let img = view.computation_image().unwrap();
        assert!(img.n_valid() > 0);
        for idx in 0..img.data.len() {
            if img.valid[idx] {
                assert!(img.data[idx].abs() < 1e-6, "residual {}", img.data[idx]);
            }
        }
        assert!(view.snip_background().is_some());
    }

    #[test]
    fn tth_shift_moves_columns() {
        let mut img = MaskedImage::from_data(DMatrix::zeros(1, 10));
        img.data[(0, 5)] = 7.0;
        // Uniform +1 px shift (in radians: 1 deg with 1 deg pixels).
        let corr = MaskedImage::from_data(DMatrix::from_element(1, 10, 1f64.to_radians()));
        let shifted = shift_tth(&img, &corr, 1.0);
        assert_eq!(shifted.data[(0, 6)], 7.0);
        assert_eq!(shifted.data[(0, 5)], 0.0);
    }
}
