//! Unified view synthesis.
//!
//! Projects per-panel raw images into unified representations:
//!
//! 1. **Polar** – fixed-resolution (two-theta, eta) grid, inverse-mapped per
//!    panel and merged by masked sum ([`polar`]).
//! 2. **Cartesian** – forward warp onto a virtual display plane with
//!    sum/count normalization ([`cartesian`]).
//! 3. **Stereo** – stereographic square resampled from the polar view
//!    ([`stereo`]).
//!
//! Validity is explicit everywhere: a [`MaskedImage`] pairs intensities with
//! a boolean validity array, NaN propagates as "no data", and masks combine
//! by logical OR on the exclusion side.

pub mod cartesian;
pub mod mask;
pub mod polar;
pub mod snip;
pub mod stereo;

use std::collections::BTreeMap;

use nalgebra::DMatrix;

/// Active unified-view representation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ViewType {
    Raw,
    Cartesian,
    Polar,
    Stereo,
}

/// Per-panel raw images keyed by panel name.
pub type PanelImages = BTreeMap<String, DMatrix<f64>>;

/// Fatal view-synthesis configuration errors.
#[derive(Debug, Clone, PartialEq)]
pub enum ViewError {
    /// Image keys do not exactly match the instrument's panel names.
    PanelKeyMismatch {
        expected: Vec<String>,
        found: Vec<String>,
    },
    /// An image's dimensions differ from the panel's declared grid.
    PanelShapeMismatch {
        panel: String,
        expected: (usize, usize),
        found: (usize, usize),
    },
    /// Degenerate view configuration (empty grid, inverted bounds).
    BadConfig(String),
}

impl std::fmt::Display for ViewError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::PanelKeyMismatch { expected, found } => write!(
                f,
                "panel keys {:?} do not match instrument panels {:?}",
                found, expected
            ),
            Self::PanelShapeMismatch {
                panel,
                expected,
                found,
            } => write!(
                f,
                "image for panel '{}' is {}x{}, declared grid is {}x{}",
                panel, found.0, found.1, expected.0, expected.1
            ),
            Self::BadConfig(msg) => write!(f, "bad view configuration: {}", msg),
        }
    }
}

impl std::error::Error for ViewError {}

/// A 2D intensity array with an explicit validity mask.
///
/// Combination rules: arithmetic marks an output element invalid when any
/// input element is invalid; stacking by [`MaskedImage::masked_sum`] treats
/// missing contributors as zero and keeps an element valid when any
/// contributor is valid. Exclusion masks are ORed on top.
#[derive(Debug, Clone, PartialEq)]
pub struct MaskedImage {
    pub data: DMatrix<f64>,
    pub valid: DMatrix<bool>,
}

impl MaskedImage {
    /// Fully invalid image of the given shape.
    pub fn invalid(rows: usize, cols: usize) -> Self {
        Self {
            data: DMatrix::zeros(rows, cols),
            valid: DMatrix::from_element(rows, cols, false),
        }
    }

    /// Wrap a data array, deriving validity from NaN entries.
    pub fn from_data(data: DMatrix<f64>) -> Self {
        let valid = data.map(|v| v.is_finite());
        Self { data, valid }
    }

    pub fn shape(&self) -> (usize, usize) {
        (self.data.nrows(), self.data.ncols())
    }

    /// Number of valid elements.
    pub fn n_valid(&self) -> usize {
        self.valid.iter().filter(|&&v| v).count()
    }

    /// Intensities with invalid elements filled by `fill`.
    pub fn filled(&self, fill: f64) -> DMatrix<f64> {
        let mut out = self.data.clone();
        for (v, m) in out.iter_mut().zip(self.valid.iter()) {
            if !*m {
                *v = fill;
            }
        }
        out
    }

    /// Mark elements invalid wherever `exclude` is true (logical OR on the
    /// exclusion side). Shapes must match.
    pub fn exclude(&mut self, exclude: &DMatrix<bool>) {
        debug_assert_eq!(self.valid.shape(), exclude.shape());
        for (v, e) in self.valid.iter_mut().zip(exclude.iter()) {
            if *e {
                *v = false;
            }
        }
    }

    /// Element-wise masked sum over a stack of images.
    ///
    /// An output element is valid when any contributor is valid; invalid
    /// contributors add nothing.
    pub fn masked_sum<'a>(stack: impl IntoIterator<Item = &'a MaskedImage>) -> Option<Self> {
        let mut iter = stack.into_iter();
        let first = iter.next()?;
        let (rows, cols) = first.shape();
        let mut out = Self::invalid(rows, cols);
        for img in std::iter::once(first).chain(iter) {
            debug_assert_eq!(img.shape(), (rows, cols));
            for idx in 0..rows * cols {
                if img.valid[idx] && img.data[idx].is_finite() {
                    out.data[idx] += img.data[idx];
                    out.valid[idx] = true;
                }
            }
        }
        Some(out)
    }
}

/// Validate the view-synthesis input contract: image keys must equal the
/// instrument panel-name set exactly and every image must match its panel's
/// declared shape.
pub fn validate_panel_images(
    instrument: &crate::instrument::Instrument,
    images: &PanelImages,
) -> Result<(), ViewError> {
    let expected = instrument.panel_names();
    let found: Vec<String> = images.keys().cloned().collect();
    if expected != found {
        return Err(ViewError::PanelKeyMismatch { expected, found });
    }
    for (name, panel) in instrument.panels() {
        let img = &images[name];
        if img.nrows() != panel.rows || img.ncols() != panel.cols {
            return Err(ViewError::PanelShapeMismatch {
                panel: name.clone(),
                expected: (panel.rows, panel.cols),
                found: (img.nrows(), img.ncols()),
            });
        }
    }
    Ok(())
}

/// Apply a panel's validity buffer to its raw image, filling dead pixels
/// with `fill` (0 keeps them from bleeding into warped views).
pub fn apply_panel_buffer(panel: &crate::instrument::Panel, image: &mut DMatrix<f64>, fill: f64) {
    if let Some(buffer) = &panel.buffer {
        for i in 0..panel.rows {
            for j in 0..panel.cols {
                if !buffer[i * panel.cols + j] {
                    image[(i, j)] = fill;
                }
            }
        }
    }
}

/// Square-root display scaling (minimum shifted to zero).
pub fn sqrt_scale_img(img: &DMatrix<f64>) -> DMatrix<f64> {
    let min = img
        .iter()
        .copied()
        .filter(|v| v.is_finite())
        .fold(f64::INFINITY, f64::min);
    let min = if min.is_finite() { min } else { 0.0 };
    img.map(|v| (v - min).sqrt())
}

/// Logarithmic display scaling (minimum shifted to one).
pub fn log_scale_img(img: &DMatrix<f64>) -> DMatrix<f64> {
    let min = img
        .iter()
        .copied()
        .filter(|v| v.is_finite())
        .fold(f64::INFINITY, f64::min);
    let min = if min.is_finite() { min } else { 0.0 };
    img.map(|v| (v - min + 1.0).ln())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instrument::{Beam, Instrument, Panel, SamplePose};
    use nalgebra::Vector3;

    fn two_panel_instrument() -> Instrument {
        let mut instr = Instrument::new(Beam::default(), SamplePose::default());
        for (name, x) in [("a", -40.0), ("b", 40.0)] {
            instr
                .add_panel(
                    name,
                    Panel::planar(64, 64, (0.5, 0.5), Vector3::new(x, 0.0, -500.0), Vector3::zeros()),
                )
                .unwrap();
        }
        instr
    }

    #[test]
    fn key_mismatch_is_fatal() {
        let instr = two_panel_instrument();
        let mut images = PanelImages::new();
        images.insert("a".into(), DMatrix::zeros(64, 64));
        let err = validate_panel_images(&instr, &images).unwrap_err();
        assert!(matches!(err, ViewError::PanelKeyMismatch { .. }));
    }

    #[test]
    fn shape_mismatch_is_fatal() {
        let instr = two_panel_instrument();
        let mut images = PanelImages::new();
        images.insert("a".into(), DMatrix::zeros(64, 64));
        images.insert("b".into(), DMatrix::zeros(32, 64));
        let err = validate_panel_images(&instr, &images).unwrap_err();
        assert!(matches!(err, ViewError::PanelShapeMismatch { .. }));
    }

    #[test]
    fn masked_sum_ors_validity() {
        let mut a = MaskedImage::invalid(2, 2);
        a.data[(0, 0)] = 2.0;
        a.valid[(0, 0)] = true;
        let mut b = MaskedImage::invalid(2, 2);
        b.data[(0, 0)] = 3.0;
        b.valid[(0, 0)] = true;
        b.data[(1, 1)] = 5.0;
        b.valid[(1, 1)] = true;

        let sum = MaskedImage::masked_sum([&a, &b]).unwrap();
        assert_eq!(sum.data[(0, 0)], 5.0);
        assert!(sum.valid[(0, 0)]);
        assert_eq!(sum.data[(1, 1)], 5.0);
        assert!(sum.valid[(1, 1)]);
        assert!(!sum.valid[(0, 1)]);
    }

    #[test]
    fn exclude_never_revalidates() {
        let mut img = MaskedImage::from_data(DMatrix::from_element(3, 3, 1.0));
        let none = DMatrix::from_element(3, 3, false);
        img.exclude(&none);
        assert_eq!(img.n_valid(), 9);
        let mut some = DMatrix::from_element(3, 3, false);
        some[(1, 1)] = true;
        img.exclude(&some);
        assert_eq!(img.n_valid(), 8);
        img.exclude(&none);
        assert_eq!(img.n_valid(), 8);
    }
}
