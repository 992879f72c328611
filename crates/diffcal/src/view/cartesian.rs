//! Cartesian view: forward warp of all panels onto a virtual display plane.
//!
//! The plane is sized from the bounding box of every panel's corners
//! projected along sample rays, symmetric about the plane origin. Each panel
//! pixel is forward-projected into the virtual grid; contributions
//! accumulate into sum and count arrays and are normalized where the count
//! is positive.

use nalgebra::{DMatrix, Vector3};

use crate::instrument::{Instrument, Panel, PanelShape};

use super::{validate_panel_images, MaskedImage, PanelImages, ViewError};

/// Virtual display plane pose and resolution.
#[derive(Debug, Clone, PartialEq)]
pub struct DisplayPlane {
    /// Exponential-map tilt of the plane.
    pub tilt: Vector3<f64>,
    /// Plane origin in the lab frame (mm).
    pub tvec: Vector3<f64>,
    /// Virtual pixel size (mm).
    pub pixel_size: f64,
}

impl Default for DisplayPlane {
    fn default() -> Self {
        Self {
            tilt: Vector3::zeros(),
            tvec: Vector3::new(0.0, 0.0, -1000.0),
            pixel_size: 0.5,
        }
    }
}

impl DisplayPlane {
    /// Bounding (width, height) in mm of all panel corners projected onto
    /// this plane along rays from the sample origin, symmetric about the
    /// plane origin.
    pub fn panel_size(&self, instrument: &Instrument) -> (f64, f64) {
        let plane = self.as_panel(3, 3);
        let mut max_x: f64 = 0.0;
        let mut max_y: f64 = 0.0;
        for (_, panel) in instrument.panels() {
            let (w, h) = panel.extent_mm();
            let corners = [
                [-w / 2.0, -h / 2.0],
                [w / 2.0, -h / 2.0],
                [w / 2.0, h / 2.0],
                [-w / 2.0, h / 2.0],
            ];
            for xy in corners {
                let lab = panel.surface_to_lab(xy);
                let dir = lab - instrument.sample.tvec;
                let p = plane.intersect_ray(&instrument.sample.tvec, &dir);
                if p[0].is_finite() && p[1].is_finite() {
                    max_x = max_x.max(p[0].abs());
                    max_y = max_y.max(p[1].abs());
                }
            }
        }
        (2.0 * max_x, 2.0 * max_y)
    }

    /// The plane itself as a panel with the given grid.
    fn as_panel(&self, rows: usize, cols: usize) -> Panel {
        Panel {
            rows,
            cols,
            pitch: (self.pixel_size, self.pixel_size),
            tvec: self.tvec,
            tilt: self.tilt,
            shape: PanelShape::Planar,
            distortion: None,
            buffer: None,
            group: None,
            roi_offset: None,
        }
    }

    /// Virtual panel sized to cover every instrument panel.
    pub fn display_panel(&self, instrument: &Instrument) -> Result<Panel, ViewError> {
        let (w, h) = self.panel_size(instrument);
        let cols = (w / self.pixel_size) as usize;
        let rows = (h / self.pixel_size) as usize;
        if rows == 0 || cols == 0 {
            return Err(ViewError::BadConfig(
                "display plane does not intersect any panel rays".into(),
            ));
        }
        Ok(self.as_panel(rows, cols))
    }
}

/// Synthesized Cartesian view.
#[derive(Debug, Clone)]
pub struct CartesianView {
    /// Virtual panel describing the display-plane grid.
    pub plane: Panel,
    /// Normalized intensities with validity.
    pub image: MaskedImage,
}

/// Forward-warp all panel images onto the display plane.
pub fn synthesize(
    instrument: &Instrument,
    images: &PanelImages,
    plane: &DisplayPlane,
) -> Result<CartesianView, ViewError> {
    validate_panel_images(instrument, images)?;
    let display = plane.display_panel(instrument)?;

    let mut sum = DMatrix::<f64>::zeros(display.rows, display.cols);
    let mut count = DMatrix::<f64>::zeros(display.rows, display.cols);

    for (name, panel) in instrument.panels() {
        let mut img = images[name].clone();
        super::apply_panel_buffer(panel, &mut img, 0.0);
        for i in 0..panel.rows {
            for j in 0..panel.cols {
                let v = img[(i, j)];
                if !v.is_finite() {
                    continue;
                }
                let lab = panel.pixel_to_lab([i as f64, j as f64]);
                let dir = lab - instrument.sample.tvec;
                let xy = display.intersect_ray(&instrument.sample.tvec, &dir);
                let Some(ij) = finite_pixel(&display, xy) else {
                    continue;
                };
                sum[ij] += v;
                count[ij] += 1.0;
            }
        }
    }

    let mut image = MaskedImage::invalid(display.rows, display.cols);
    for idx in 0..sum.len() {
        if count[idx] > 0.0 {
            image.data[idx] = sum[idx] / count[idx];
            image.valid[idx] = true;
        }
    }
    let n_rows = display.rows;
    let n_cols = display.cols;
    tracing::info!(
        rows = n_rows,
        cols = n_cols,
        filled = image.n_valid(),
        "cartesian view synthesized"
    );
    Ok(CartesianView {
        plane: display,
        image,
    })
}

fn finite_pixel(panel: &Panel, xy: [f64; 2]) -> Option<(usize, usize)> {
    if !xy[0].is_finite() || !xy[1].is_finite() {
        return None;
    }
    let ij = panel.pixel_from_cart(xy);
    let i = ij[0].round();
    let j = ij[1].round();
    if i < 0.0 || j < 0.0 || i >= panel.rows as f64 || j >= panel.cols as f64 {
        return None;
    }
    Some((i as usize, j as usize))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instrument::{Beam, SamplePose};

    fn instrument() -> (Instrument, PanelImages) {
        let mut instr = Instrument::new(Beam::default(), SamplePose::default());
        for (name, x) in [("left", -40.0), ("right", 40.0)] {
            instr
                .add_panel(
                    name,
                    Panel::planar(
                        128,
                        128,
                        (0.5, 0.5),
                        Vector3::new(x, 0.0, -900.0),
                        Vector3::new(0.0, 0.005, 0.0),
                    ),
                )
                .unwrap();
        }
        let mut images = PanelImages::new();
        images.insert("left".into(), DMatrix::from_element(128, 128, 1.0));
        images.insert("right".into(), DMatrix::from_element(128, 128, 5.0));
        (instr, images)
    }

    #[test]
    fn normalized_values_and_gap_invalidity() {
        let (instr, images) = instrument();
        let view = synthesize(&instr, &images, &DisplayPlane::default()).unwrap();
        // Filled pixels hold per-panel intensities (possibly averaged at
        // overlaps), so every valid value lies in [1, 5].
        let mut any_valid = false;
        for idx in 0..view.image.data.len() {
            if view.image.valid[idx] {
                any_valid = true;
                let v = view.image.data[idx];
                assert!((1.0..=5.0).contains(&v), "out-of-range {}", v);
            }
        }
        assert!(any_valid);
        // The two panels are separated in x; the plane center between them
        // receives nothing.
        let center = (view.plane.rows / 2, view.plane.cols / 2);
        assert!(!view.image.valid[center]);
    }

    #[test]
    fn key_mismatch_fails() {
        let (instr, mut images) = instrument();
        images.insert("ghost".into(), DMatrix::zeros(4, 4));
        assert!(matches!(
            synthesize(&instr, &images, &DisplayPlane::default()),
            Err(ViewError::PanelKeyMismatch { .. })
        ));
    }
}
