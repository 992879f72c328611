//! Per-panel pixel distortion models.
//!
//! Distortion operates in panel-local Cartesian coordinates (mm). `apply`
//! removes distortion (measured -> ideal); `apply_inverse` adds it
//! (ideal -> measured). Models are a closed set of variants dispatched by
//! match, not trait objects.

use serde::{Deserialize, Serialize};

/// Settings for the iterative removal of distortion.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct UndistortConfig {
    /// Maximum fixed-point iterations.
    pub max_iters: usize,
    /// Stop when the coordinate update norm falls below this threshold (mm).
    pub eps: f64,
}

impl Default for UndistortConfig {
    fn default() -> Self {
        Self {
            max_iters: 15,
            eps: 1e-10,
        }
    }
}

/// Closed set of panel distortion models.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "function", rename_all = "snake_case")]
pub enum Distortion {
    /// Radial polynomial about a center point:
    /// `r_measured = r_ideal * (1 + k1 r^2 + k2 r^4 + k3 r^6)`.
    RadialPolynomial {
        k: [f64; 3],
        center: [f64; 2],
    },
}

impl Distortion {
    /// Measured -> ideal coordinates (iterative inversion of the forward
    /// model). Non-convergent or non-finite input yields NaN coordinates.
    pub fn apply(&self, xy: [f64; 2]) -> [f64; 2] {
        self.apply_with(xy, UndistortConfig::default())
    }

    /// Measured -> ideal with explicit iteration settings.
    pub fn apply_with(&self, xy: [f64; 2], cfg: UndistortConfig) -> [f64; 2] {
        match self {
            Self::RadialPolynomial { k, center } => {
                if !xy[0].is_finite() || !xy[1].is_finite() {
                    return [f64::NAN, f64::NAN];
                }
                let dx = xy[0] - center[0];
                let dy = xy[1] - center[1];
                let mut x = dx;
                let mut y = dy;
                for _ in 0..cfg.max_iters.max(1) {
                    let r2 = x * x + y * y;
                    let scale = 1.0 + k[0] * r2 + k[1] * r2 * r2 + k[2] * r2 * r2 * r2;
                    if !scale.is_finite() || scale.abs() < 1e-12 {
                        return [f64::NAN, f64::NAN];
                    }
                    let x_next = dx / scale;
                    let y_next = dy / scale;
                    let step = ((x_next - x).powi(2) + (y_next - y).powi(2)).sqrt();
                    x = x_next;
                    y = y_next;
                    if step <= cfg.eps {
                        break;
                    }
                }
                [x + center[0], y + center[1]]
            }
        }
    }

    /// Ideal -> measured coordinates (closed-form forward model).
    pub fn apply_inverse(&self, xy: [f64; 2]) -> [f64; 2] {
        match self {
            Self::RadialPolynomial { k, center } => {
                if !xy[0].is_finite() || !xy[1].is_finite() {
                    return [f64::NAN, f64::NAN];
                }
                let x = xy[0] - center[0];
                let y = xy[1] - center[1];
                let r2 = x * x + y * y;
                let scale = 1.0 + k[0] * r2 + k[1] * r2 * r2 + k[2] * r2 * r2 * r2;
                [x * scale + center[0], y * scale + center[1]]
            }
        }
    }
}
