//! User mask management.
//!
//! Masks are combined by logical OR on the exclusion side, in a fixed order:
//! panel validity buffers are applied to the raw images before warping,
//! polygon masks are converted into the active view's coordinates, and
//! threshold masks cut on raw intensity. "Visible" masks affect the display
//! image; "boundary" masks additionally affect the computation image.

use nalgebra::DMatrix;

use crate::instrument::Instrument;

use super::polar::PolarConfig;
use super::ViewError;

/// Coordinate system a polygon mask is authored in.
#[derive(Debug, Clone, PartialEq)]
pub enum MaskFrame {
    /// Vertices in (two-theta, eta) degrees.
    Polar,
    /// Vertices in a panel's Cartesian frame (mm).
    Panel(String),
}

/// A user-drawn polygon mask.
#[derive(Debug, Clone)]
pub struct PolygonMask {
    pub name: String,
    pub frame: MaskFrame,
    /// Closed polygon vertices (the closing edge is implicit).
    pub vertices: Vec<[f64; 2]>,
    /// Apply to the display image.
    pub visible: bool,
    /// Apply to the computation image.
    pub boundary: bool,
}

/// Intensity cuts on the raw merged image.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ThresholdMask {
    /// Exclude pixels below this value.
    pub lower: f64,
    /// Exclude pixels above this value.
    pub upper: f64,
    pub visible: bool,
}

/// The active mask collection.
#[derive(Debug, Clone, Default)]
pub struct MaskSet {
    pub polygons: Vec<PolygonMask>,
    pub threshold: Option<ThresholdMask>,
}

impl MaskSet {
    /// Exclusion applied to the display image: visible polygons OR the
    /// threshold cut on raw intensities.
    pub fn visible_exclusion(
        &self,
        cfg: &PolarConfig,
        instrument: &Instrument,
        raw_data: &DMatrix<f64>,
    ) -> Result<DMatrix<bool>, ViewError> {
        let (rows, cols) = cfg.shape();
        let mut total = DMatrix::from_element(rows, cols, false);
        for poly in self.polygons.iter().filter(|p| p.visible) {
            or_into(&mut total, &self.rasterize_polar(poly, cfg, instrument)?);
        }
        if let Some(t) = self.threshold.filter(|t| t.visible) {
            if raw_data.shape() == (rows, cols) {
                for idx in 0..rows * cols {
                    let v = raw_data[idx];
                    if v.is_finite() && (v < t.lower || v > t.upper) {
                        total[idx] = true;
                    }
                }
            }
        }
        Ok(total)
    }

    /// Exclusion additionally applied to the computation image.
    pub fn boundary_exclusion(
        &self,
        cfg: &PolarConfig,
        instrument: &Instrument,
    ) -> Result<DMatrix<bool>, ViewError> {
        let (rows, cols) = cfg.shape();
        let mut total = DMatrix::from_element(rows, cols, false);
        for poly in self.polygons.iter().filter(|p| p.boundary) {
            or_into(&mut total, &self.rasterize_polar(poly, cfg, instrument)?);
        }
        Ok(total)
    }

    /// Exclusion for a single panel's raw image (raw-view masking).
    pub fn panel_exclusion(
        &self,
        panel_name: &str,
        instrument: &Instrument,
    ) -> Result<DMatrix<bool>, ViewError> {
        let panel = instrument
            .panel(panel_name)
            .map_err(|e| ViewError::BadConfig(e.to_string()))?;
        let mut total = DMatrix::from_element(panel.rows, panel.cols, false);
        for poly in self.polygons.iter().filter(|p| p.visible) {
            let MaskFrame::Panel(name) = &poly.frame else {
                continue;
            };
            if name != panel_name || poly.vertices.len() < 3 {
                continue;
            }
            for i in 0..panel.rows {
                for j in 0..panel.cols {
                    let xy = panel.cart_from_pixel([i as f64, j as f64]);
                    if point_in_polygon(xy, &poly.vertices) {
                        total[(i, j)] = true;
                    }
                }
            }
        }
        Ok(total)
    }

    /// Rasterize one polygon onto the polar grid.
    fn rasterize_polar(
        &self,
        poly: &PolygonMask,
        cfg: &PolarConfig,
        instrument: &Instrument,
    ) -> Result<DMatrix<bool>, ViewError> {
        let (rows, cols) = cfg.shape();
        let mut out = DMatrix::from_element(rows, cols, false);
        if poly.vertices.len() < 3 {
            return Ok(out);
        }

        // Panel-frame polygons are converted vertex-wise into angles.
        let vertices: Vec<[f64; 2]> = match &poly.frame {
            MaskFrame::Polar => poly.vertices.clone(),
            MaskFrame::Panel(name) => {
                let panel = instrument
                    .panel(name)
                    .map_err(|e| ViewError::BadConfig(e.to_string()))?;
                let beam = instrument.beam.frame();
                let period = cfg.eta_period();
                poly.vertices
                    .iter()
                    .map(|&xy| {
                        let (tth, eta) =
                            panel.cart_to_angles(xy, &beam, &instrument.sample, period);
                        [tth.to_degrees(), eta.to_degrees()]
                    })
                    .filter(|p| p[0].is_finite() && p[1].is_finite())
                    .collect()
            }
        };
        if vertices.len() < 3 {
            return Ok(out);
        }

        let tths = cfg.tth_centers();
        let etas = cfg.eta_centers();
        for (r, &eta) in etas.iter().enumerate() {
            for (c, &tth) in tths.iter().enumerate() {
                if point_in_polygon([tth.to_degrees(), eta.to_degrees()], &vertices) {
                    out[(r, c)] = true;
                }
            }
        }
        Ok(out)
    }
}

fn or_into(total: &mut DMatrix<bool>, add: &DMatrix<bool>) {
    for (t, a) in total.iter_mut().zip(add.iter()) {
        *t |= *a;
    }
}

/// Even-odd rule point-in-polygon test.
fn point_in_polygon(p: [f64; 2], vertices: &[[f64; 2]]) -> bool {
    let mut inside = false;
    let n = vertices.len();
    let mut j = n - 1;
    for i in 0..n {
        let (xi, yi) = (vertices[i][0], vertices[i][1]);
        let (xj, yj) = (vertices[j][0], vertices[j][1]);
        if ((yi > p[1]) != (yj > p[1]))
            && (p[0] < (xj - xi) * (p[1] - yi) / (yj - yi) + xi)
        {
            inside = !inside;
        }
        j = i;
    }
    inside
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instrument::{Beam, Instrument, Panel, SamplePose};
    use crate::view::polar::{PolarProcessing, PolarView};
    use crate::view::PanelImages;
    use nalgebra::Vector3;

    fn instrument() -> (Instrument, PanelImages) {
        let mut instr = Instrument::new(Beam::default(), SamplePose::default());
        instr
            .add_panel(
                "a",
                Panel::planar(
                    900,
                    420,
                    (0.5, 0.5),
                    Vector3::new(160.0, 0.0, -1000.0),
                    Vector3::zeros(),
                ),
            )
            .unwrap();
        let mut images = PanelImages::new();
        images.insert("a".into(), DMatrix::from_element(900, 420, 2.0));
        (instr, images)
    }

    fn cfg() -> PolarConfig {
        PolarConfig {
            tth_min_deg: 5.0,
            tth_max_deg: 13.0,
            eta_min_deg: -5.0,
            eta_max_deg: 5.0,
            tth_pixel_size_deg: 0.5,
            eta_pixel_size_deg: 0.5,
        }
    }

    #[test]
    fn point_in_polygon_basic() {
        let square = vec![[0.0, 0.0], [2.0, 0.0], [2.0, 2.0], [0.0, 2.0]];
        assert!(point_in_polygon([1.0, 1.0], &square));
        assert!(!point_in_polygon([3.0, 1.0], &square));
    }

    #[test]
    fn adding_masks_never_increases_valid_count() {
        let (instr, images) = instrument();
        let mut masks = MaskSet::default();
        let mut view = PolarView::new(cfg(), PolarProcessing::default()).unwrap();
        view.warp_all(&instr, &images, &masks).unwrap();
        let baseline = view.computation_image().unwrap().n_valid();

        // Polygon over part of the grid.
        masks.polygons.push(PolygonMask {
            name: "box".into(),
            frame: MaskFrame::Polar,
            vertices: vec![[6.0, -2.0], [8.0, -2.0], [8.0, 2.0], [6.0, 2.0]],
            visible: true,
            boundary: true,
        });
        view.reapply_masks(&instr, &masks).unwrap();
        let with_polygon = view.computation_image().unwrap().n_valid();
        assert!(with_polygon < baseline);

        // Threshold cutting everything above 1.0 (image is 2.0 everywhere).
        masks.threshold = Some(ThresholdMask {
            lower: f64::NEG_INFINITY,
            upper: 1.0,
            visible: true,
        });
        view.reapply_masks(&instr, &masks).unwrap();
        let with_threshold = view.computation_image().unwrap().n_valid();
        assert!(with_threshold <= with_polygon);
        assert_eq!(with_threshold, 0);
    }

    #[test]
    fn boundary_mask_spares_display_image() {
        let (instr, images) = instrument();
        let mut masks = MaskSet::default();
        masks.polygons.push(PolygonMask {
            name: "calib-region".into(),
            frame: MaskFrame::Polar,
            vertices: vec![[6.0, -2.0], [8.0, -2.0], [8.0, 2.0], [6.0, 2.0]],
            visible: false,
            boundary: true,
        });
        let mut view = PolarView::new(cfg(), PolarProcessing::default()).unwrap();
        view.warp_all(&instr, &images, &masks).unwrap();
        let display = view.display_image().unwrap().n_valid();
        let computation = view.computation_image().unwrap().n_valid();
        assert!(computation < display);
    }

    #[test]
    fn panel_frame_polygon_masks_polar_region() {
        let (instr, images) = instrument();
        let mut masks = MaskSet::default();
        // A box in panel coordinates around the beam-level stripe.
        masks.polygons.push(PolygonMask {
            name: "panel-box".into(),
            frame: MaskFrame::Panel("a".into()),
            vertices: vec![[-30.0, -10.0], [30.0, -10.0], [30.0, 10.0], [-30.0, 10.0]],
            visible: true,
            boundary: false,
        });
        let mut view = PolarView::new(cfg(), PolarProcessing::default()).unwrap();
        view.warp_all(&instr, &images, &masks).unwrap();
        let raw_valid = view.raw_image().unwrap().n_valid();
        let display = view.display_image().unwrap().n_valid();
        assert!(display < raw_valid);
    }

    #[test]
    fn panel_frame_polygon_masks_raw_pixels() {
        let (instr, _) = instrument();
        let mut masks = MaskSet::default();
        masks.polygons.push(PolygonMask {
            name: "dead-zone".into(),
            frame: MaskFrame::Panel("a".into()),
            vertices: vec![[-10.0, -10.0], [10.0, -10.0], [10.0, 10.0], [-10.0, 10.0]],
            visible: true,
            boundary: false,
        });
        let excl = masks.panel_exclusion("a", &instr).unwrap();
        let panel = instr.panel("a").unwrap();
        let center = panel.pixel_from_cart([0.0, 0.0]);
        assert!(excl[(center[0] as usize, center[1] as usize)]);
        assert!(!excl[(0, 0)]);
        // Polygons on other panels do not leak in.
        assert!(masks
            .panel_exclusion("missing", &instr)
            .is_err());
    }

    #[test]
    fn threshold_on_raw_view_intensities() {
        let (instr, _) = instrument();
        let masks = MaskSet {
            polygons: vec![],
            threshold: Some(ThresholdMask {
                lower: 0.5,
                upper: 10.0,
                visible: true,
            }),
        };
        let raw = DMatrix::from_fn(cfg().neta(), cfg().ntth(), |r, _| if r % 2 == 0 { 0.0 } else { 2.0 });
        let excl = masks.visible_exclusion(&cfg(), &instr, &raw).unwrap();
        for r in 0..cfg().neta() {
            for c in 0..cfg().ntth() {
                assert_eq!(excl[(r, c)], r % 2 == 0);
            }
        }
    }
}
