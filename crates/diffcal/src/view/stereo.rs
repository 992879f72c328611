//! Stereographic view synthesis.
//!
//! A square grid whose inscribed disc is the stereographic projection of the
//! forward hemisphere. Pixels outside the disc are invalid. The view is
//! resampled either from an already-synthesized polar image (fast path) or
//! directly from the raw panel images.

use crate::instrument::angles;
use crate::instrument::Instrument;

use super::polar::PolarConfig;
use super::{validate_panel_images, MaskedImage, PanelImages, ViewError};

/// Stereo view settings.
#[derive(Debug, Clone, Copy, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct StereoConfig {
    /// Square view edge length in pixels (odd sizes center the pole).
    pub size: usize,
    /// Resample the polar view instead of projecting raw panels.
    pub project_from_polar: bool,
}

impl Default for StereoConfig {
    fn default() -> Self {
        Self {
            size: 1001,
            project_from_polar: true,
        }
    }
}

/// Resample a polar image into the stereographic square.
pub fn from_polar(
    polar_img: &MaskedImage,
    polar_cfg: &PolarConfig,
    cfg: &StereoConfig,
) -> Result<MaskedImage, ViewError> {
    if cfg.size < 3 {
        return Err(ViewError::BadConfig("stereo size too small".into()));
    }
    if polar_img.shape() != polar_cfg.shape() {
        return Err(ViewError::BadConfig(
            "polar image does not match polar config".into(),
        ));
    }
    let period = polar_cfg.eta_period();
    let mut out = MaskedImage::invalid(cfg.size, cfg.size);
    for i in 0..cfg.size {
        for j in 0..cfg.size {
            let Some((tth, eta)) = angles::angles_from_stereo_ij([i as f64, j as f64], cfg.size)
            else {
                continue;
            };
            let eta = period.map(eta);
            let v = sample_polar(polar_img, polar_cfg, tth, eta);
            if v.is_finite() {
                out.data[(i, j)] = v;
                out.valid[(i, j)] = true;
            }
        }
    }
    Ok(out)
}

/// Project raw panel images directly into the stereographic square, merging
/// panels by masked sum.
pub fn from_raw(
    instrument: &Instrument,
    images: &PanelImages,
    cfg: &StereoConfig,
) -> Result<MaskedImage, ViewError> {
    if cfg.size < 3 {
        return Err(ViewError::BadConfig("stereo size too small".into()));
    }
    validate_panel_images(instrument, images)?;

    let beam = instrument.beam.frame();
    let mut out = MaskedImage::invalid(cfg.size, cfg.size);
    for (name, panel) in instrument.panels() {
        let mut img = images[name].clone();
        super::apply_panel_buffer(panel, &mut img, 0.0);
        for i in 0..cfg.size {
            for j in 0..cfg.size {
                let Some((tth, eta)) =
                    angles::angles_from_stereo_ij([i as f64, j as f64], cfg.size)
                else {
                    continue;
                };
                let mut xy = panel.angles_to_cart(tth, eta, &beam, &instrument.sample);
                if let Some(d) = &panel.distortion {
                    xy = d.apply_inverse(xy);
                }
                let v = panel.interpolate_bilinear(&[xy], &img)[0];
                if v.is_finite() {
                    out.data[(i, j)] += v;
                    out.valid[(i, j)] = true;
                }
            }
        }
    }
    Ok(out)
}

/// Bilinear sample of the polar image at an angular coordinate (radians);
/// NaN out of bounds or when any neighbor is invalid.
fn sample_polar(img: &MaskedImage, cfg: &PolarConfig, tth: f64, eta: f64) -> f64 {
    let ij = cfg.angles_to_pixel(tth, eta);
    let (rows, cols) = img.shape();
    let i0 = ij[0].floor();
    let j0 = ij[1].floor();
    if i0 < 0.0 || j0 < 0.0 || i0 + 1.0 > (rows - 1) as f64 || j0 + 1.0 > (cols - 1) as f64 {
        return f64::NAN;
    }
    let (i0u, j0u) = (i0 as usize, j0 as usize);
    for (di, dj) in [(0, 0), (0, 1), (1, 0), (1, 1)] {
        if !img.valid[(i0u + di, j0u + dj)] {
            return f64::NAN;
        }
    }
    let fi = ij[0] - i0;
    let fj = ij[1] - j0;
    img.data[(i0u, j0u)] * (1.0 - fi) * (1.0 - fj)
        + img.data[(i0u, j0u + 1)] * (1.0 - fi) * fj
        + img.data[(i0u + 1, j0u)] * fi * (1.0 - fj)
        + img.data[(i0u + 1, j0u + 1)] * fi * fj
}
