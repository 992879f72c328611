//! Automatic pick generation.
//!
//! Powder: per ring and eta bin, a Gaussian-plus-offset peak is fitted to a
//! two-theta lineout of the polar image (Levenberg-Marquardt via
//! `tiny-solver`); fits below the height threshold or drifting beyond the
//! two-theta tolerance are rejected. Laue: windowed centroid of the raw
//! panel image around each simulated spot, gated on integrated intensity.
//!
//! These functions run on the worker pool with deep-copied inputs; they
//! never touch live session state.

use std::collections::HashMap;

use crate::instrument::angles::EtaPeriod;
use crate::instrument::Instrument;
use crate::material::{CrystalParams, Material};
use crate::overlay::laue::simulate_spots;
use crate::overlay::Overlay;
use crate::view::polar::PolarConfig;
use crate::view::{MaskedImage, PanelImages};

use super::{angles_pick_to_cart, OverlayPicks, PanelPicks, UNSET};

/// Powder auto-pick settings.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PowderAutoPickOptions {
    /// Initial peak FWHM estimate, degrees two-theta.
    pub fwhm_estimate_deg: f64,
    /// Reject fits with amplitude below this.
    pub min_height: f64,
    /// Reject fits whose center drifts beyond this from the nominal ring.
    pub tth_tol_deg: f64,
    /// Polar rows averaged into one lineout.
    pub eta_bin_rows: usize,
}

impl Default for PowderAutoPickOptions {
    fn default() -> Self {
        Self {
            fwhm_estimate_deg: 0.05,
            min_height: 10.0,
            tth_tol_deg: 0.25,
            eta_bin_rows: 8,
        }
    }
}

/// Fit powder ring picks from the polar computation image.
///
/// `overlay` must carry polar-frame data. Returns per-panel pick lists
/// aligned with the overlay's local reflection lists.
pub fn auto_pick_powder(
    instrument: &Instrument,
    polar_img: &MaskedImage,
    polar_cfg: &PolarConfig,
    overlay: &Overlay,
    options: &PowderAutoPickOptions,
) -> Result<OverlayPicks, String> {
    if polar_img.shape() != polar_cfg.shape() {
        return Err("polar image does not match polar grid".to_string());
    }
    let mut out = OverlayPicks::default();

    for (panel_name, pd) in overlay.cached_data() {
        let mut rings: Vec<Vec<[f64; 2]>> = vec![Vec::new(); pd.rings.len()];
        for (local, ring) in pd.rings.iter().enumerate() {
            if ring.is_empty() {
                continue;
            }
            let nominal_tth = ring.iter().map(|p| p[0]).sum::<f64>() / ring.len() as f64;
            for (eta_deg, tth_fit) in
                fit_ring_rows(polar_img, polar_cfg, ring, nominal_tth, options)
            {
                let cart = angles_pick_to_cart([tth_fit, eta_deg], panel_name, instrument);
                let Ok(panel) = instrument.panel(panel_name) else {
                    continue;
                };
                if panel.on_panel(cart, false) {
                    rings[local].push(cart);
                }
            }
        }
        let n_found: usize = rings.iter().map(Vec::len).sum();
        tracing::debug!(panel = %panel_name, n_found, "powder auto pick");
        out.panels
            .insert(panel_name.clone(), PanelPicks::Powder(rings));
    }
    Ok(out)
}

/// Fit one ring in eta bins; yields (eta_deg, fitted tth_deg) pairs.
fn fit_ring_rows(
    img: &MaskedImage,
    cfg: &PolarConfig,
    ring: &[[f64; 2]],
    nominal_tth: f64,
    options: &PowderAutoPickOptions,
) -> Vec<(f64, f64)> {
    let (rows, cols) = img.shape();
    let window_deg = options.tth_tol_deg + options.fwhm_estimate_deg * 2.0;
    let c_nom = (nominal_tth - cfg.tth_min_deg) / cfg.tth_pixel_size_deg;
    let half_w = (window_deg / cfg.tth_pixel_size_deg).ceil() as isize;
    let c_lo = ((c_nom as isize) - half_w).max(0) as usize;
    let c_hi = (((c_nom as isize) + half_w) as usize).min(cols.saturating_sub(1));
    if c_lo >= c_hi {
        return Vec::new();
    }

    // Eta rows the ring actually covers on this panel.
    let mut covered = vec![false; rows];
    for p in ring {
        let r = ((p[1] - cfg.eta_min_deg) / cfg.eta_pixel_size_deg) as isize;
        if (0..rows as isize).contains(&r) {
            covered[r as usize] = true;
        }
    }

    let bin = options.eta_bin_rows.max(1);
    let mut picks = Vec::new();
    let mut r0 = 0;
    while r0 < rows {
        let r1 = (r0 + bin).min(rows);
        if !(r0..r1).any(|r| covered[r]) {
            r0 = r1;
            continue;
        }
        // Mean lineout over the bin, NaN where no valid samples.
        let mut xs = Vec::with_capacity(c_hi - c_lo + 1);
        let mut ys = Vec::with_capacity(c_hi - c_lo + 1);
        for c in c_lo..=c_hi {
            let mut sum = 0.0;
            let mut n = 0usize;
            for r in r0..r1 {
                if img.valid[(r, c)] {
                    sum += img.data[(r, c)];
                    n += 1;
                }
            }
            if n > 0 {
                xs.push(cfg.tth_min_deg + (c as f64 + 0.5) * cfg.tth_pixel_size_deg);
                ys.push(sum / n as f64);
            }
        }
        if xs.len() >= 5 {
            if let Some((amp, mu)) =
                fit_gaussian_peak(&xs, &ys, nominal_tth, options.fwhm_estimate_deg)
            {
                if amp >= options.min_height && (mu - nominal_tth).abs() <= options.tth_tol_deg {
                    let eta_deg =
                        cfg.eta_min_deg + ((r0 + r1) as f64 / 2.0) * cfg.eta_pixel_size_deg;
                    picks.push((eta_deg, mu));
                }
            }
        }
        r0 = r1;
    }
    picks
}

/// Gaussian + constant-offset peak fit; returns (amplitude, center).
fn fit_gaussian_peak(
    xs: &[f64],
    ys: &[f64],
    mu0: f64,
    fwhm0: f64,
) -> Option<(f64, f64)> {
    use nalgebra as ts_na;
    use tiny_solver::Optimizer;

    #[derive(Debug, Clone)]
    struct GaussianFactor {
        x: f64,
        y: f64,
    }

    impl<T: ts_na::RealField> tiny_solver::factors::Factor<T> for GaussianFactor {
        fn residual_func(&self, params: &[ts_na::DVector<T>]) -> ts_na::DVector<T> {
            let p = &params[0];
            let amp = p[0].clone();
            let mu = p[1].clone();
            let sigma = p[2].clone();
            let offset = p[3].clone();
            let dx = T::from_f64(self.x).unwrap() - mu;
            let s2 = sigma.clone() * sigma;
            let model = amp * (-(dx.clone() * dx) / (s2 * T::from_f64(2.0).unwrap())).exp() + offset;
            ts_na::DVector::<T>::from_vec(vec![model - T::from_f64(self.y).unwrap()])
        }
    }

    let y_min = ys.iter().copied().fold(f64::INFINITY, f64::min);
    let (mut y_max, mut x_at_max) = (f64::NEG_INFINITY, mu0);
    for (&x, &y) in xs.iter().zip(ys) {
        if y > y_max {
            y_max = y;
            x_at_max = x;
        }
    }
    if !y_min.is_finite() || !y_max.is_finite() {
        return None;
    }

    let mut problem = tiny_solver::Problem::new();
    for (&x, &y) in xs.iter().zip(ys) {
        problem.add_residual_block(1, &["p"], Box::new(GaussianFactor { x, y }), None);
    }
    let sigma0 = (fwhm0 / 2.354_820_045).max(1e-4);
    let mut initial_values = HashMap::<String, ts_na::DVector<f64>>::new();
    initial_values.insert(
        "p".to_string(),
        ts_na::DVector::from_vec(vec![(y_max - y_min).max(1e-6), x_at_max, sigma0, y_min]),
    );

    let optimizer = tiny_solver::LevenbergMarquardtOptimizer::default();
    let options = tiny_solver::OptimizerOptions {
        max_iteration: 60,
        verbosity_level: 0,
        ..Default::default()
    };
    let result = optimizer.optimize(&problem, &initial_values, Some(options))?;
    let p = result.get("p")?;
    let amp = p[0];
    let mu = p[1];
    if !amp.is_finite() || !mu.is_finite() {
        return None;
    }
    Some((amp, mu))
}

/// Laue auto-pick settings.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LaueAutoPickOptions {
    /// Half-width (pixels) of the centroid window around each spot.
    pub window_px: usize,
    /// Reject spots whose background-subtracted integral falls below this.
    pub min_intensity: f64,
    pub min_energy_kev: f64,
    pub max_energy_kev: f64,
}

impl Default for LaueAutoPickOptions {
    fn default() -> Self {
        Self {
            window_px: 10,
            min_intensity: 50.0,
            min_energy_kev: 5.0,
            max_energy_kev: 35.0,
        }
    }
}

/// Centroid-fit Laue picks from raw panel images.
///
/// Spots are re-simulated with the supplied crystal so the output aligns
/// with overlay data generated from the same parameters.
pub fn auto_pick_laue(
    instrument: &Instrument,
    images: &PanelImages,
    material: &Material,
    crystal: &CrystalParams,
    options: &LaueAutoPickOptions,
) -> Result<OverlayPicks, String> {
    let mut out = OverlayPicks::default();
    for (panel_name, panel) in instrument.panels() {
        let Some(image) = images.get(panel_name) else {
            return Err(format!("missing image for panel '{}'", panel_name));
        };
        let spots = simulate_spots(
            instrument,
            panel,
            material,
            crystal,
            options.min_energy_kev,
            options.max_energy_kev,
        )
        .map_err(|e| e.to_string())?;

        let mut picked = Vec::with_capacity(spots.len());
        for spot in &spots {
            picked.push(centroid_pick(panel, image, spot.cart, options));
        }
        out.panels
            .insert(panel_name.clone(), PanelPicks::Laue(picked));
    }
    Ok(out)
}

/// Background-subtracted intensity centroid in a window around the
/// predicted spot; unset when the integral is below threshold.
fn centroid_pick(
    panel: &crate::instrument::Panel,
    image: &nalgebra::DMatrix<f64>,
    predicted_cart: [f64; 2],
    options: &LaueAutoPickOptions,
) -> [f64; 2] {
    let ij = panel.pixel_from_cart(predicted_cart);
    if !ij[0].is_finite() || !ij[1].is_finite() {
        return UNSET;
    }
    let w = options.window_px as isize;
    let ic = ij[0].round() as isize;
    let jc = ij[1].round() as isize;

    let mut local_min = f64::INFINITY;
    for di in -w..=w {
        for dj in -w..=w {
            let (i, j) = (ic + di, jc + dj);
            if i < 0 || j < 0 || i >= panel.rows as isize || j >= panel.cols as isize {
                continue;
            }
            let v = image[(i as usize, j as usize)];
            if v.is_finite() {
                local_min = local_min.min(v);
            }
        }
    }
    if !local_min.is_finite() {
        return UNSET;
    }

    let (mut total, mut ci, mut cj) = (0.0, 0.0, 0.0);
    for di in -w..=w {
        for dj in -w..=w {
            let (i, j) = (ic + di, jc + dj);
            if i < 0 || j < 0 || i >= panel.rows as isize || j >= panel.cols as isize {
                continue;
            }
            let v = image[(i as usize, j as usize)];
            if !v.is_finite() {
                continue;
            }
            let weight = v - local_min;
            total += weight;
            ci += weight * i as f64;
            cj += weight * j as f64;
        }
    }
    if total < options.min_intensity {
        return UNSET;
    }
    panel.cart_from_pixel([ci / total, cj / total])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instrument::{Beam, Panel, SamplePose};
    use crate::material::Lattice;
    use crate::overlay::{OverlayContext, OverlayKind, PowderParams, ViewFrame};
    use crate::view::polar::{PolarProcessing, PolarView};
    use nalgebra::{DMatrix, Vector3};

    fn instrument() -> Instrument {
        let mut instr = Instrument::new(Beam::default(), SamplePose::default());
        instr
            .add_panel(
                "d0",
                Panel::planar(
                    1024,
                    1024,
                    (0.3, 0.3),
                    Vector3::new(0.0, 0.0, -800.0),
                    Vector3::zeros(),
                ),
            )
            .unwrap();
        instr
    }

    /// Render synthetic rings of the material into a panel image.
    fn synthetic_image(instr: &Instrument, material: &Material, height: f64) -> PanelImages {
        let panel = instr.panel("d0").unwrap();
        let tths = material.ring_tths(instr.beam.energy_kev);
        let beam = instr.beam.frame();
        let mut img = DMatrix::from_element(panel.rows, panel.cols, 5.0);
        for i in 0..panel.rows {
            for j in 0..panel.cols {
                let xy = panel.cart_from_pixel([i as f64, j as f64]);
                let (tth, _) = panel.cart_to_angles(
                    xy,
                    &beam,
                    &instr.sample,
                    EtaPeriod::default(),
                );
                for &t in &tths {
                    let d = (tth - t).to_degrees();
                    img[(i, j)] += height * (-d * d / (2.0 * 0.02f64.powi(2))).exp();
                }
            }
        }
        let mut images = PanelImages::new();
        images.insert("d0".into(), img);
        images
    }

    #[test]
    fn gaussian_fit_recovers_center() {
        let xs: Vec<f64> = (0..40).map(|k| 3.0 + 0.01 * k as f64).collect();
        let ys: Vec<f64> = xs
            .iter()
            .map(|&x| 20.0 + 80.0 * (-(x - 3.22f64).powi(2) / (2.0 * 0.03f64.powi(2))).exp())
            .collect();
        let (amp, mu) = fit_gaussian_peak(&xs, &ys, 3.2, 0.07).expect("fit");
        assert!((mu - 3.22).abs() < 1e-3, "center {}", mu);
        assert!((amp - 80.0).abs() < 1.0, "amplitude {}", amp);
    }

    #[test]
    fn powder_auto_pick_lands_on_rings() {
        let instr = instrument();
        let material = Material::new(
            "CeO2",
            Lattice::cubic(5.41153),
            vec![[1, 1, 1], [2, 0, 0]],
        );
        let images = synthetic_image(&instr, &material, 400.0);

        let polar_cfg = crate::view::polar::PolarConfig {
            tth_min_deg: 2.0,
            tth_max_deg: 6.0,
            eta_min_deg: -180.0,
            eta_max_deg: 180.0,
            tth_pixel_size_deg: 0.01,
            eta_pixel_size_deg: 1.0,
        };
        let mut view =
            PolarView::new(polar_cfg.clone(), PolarProcessing::default()).unwrap();
        view.warp_all(&instr, &images, &Default::default()).unwrap();

        let ctx = OverlayContext {
            instrument: &instr,
            material: &material,
            frame: ViewFrame::Polar(&polar_cfg),
            eta_period: EtaPeriod::from_min_degrees(polar_cfg.eta_min_deg),
        };
        let mut overlay = Overlay::new(
            "CeO2 powder",
            "CeO2",
            OverlayKind::Powder(PowderParams::default()),
        );
        overlay.data(&ctx).unwrap();

        let options = PowderAutoPickOptions {
            fwhm_estimate_deg: 0.05,
            min_height: 50.0,
            tth_tol_deg: 0.2,
            eta_bin_rows: 30,
        };
        let picks = auto_pick_powder(
            &instr,
            view.computation_image().unwrap(),
            &polar_cfg,
            &overlay,
            &options,
        )
        .unwrap();

        let PanelPicks::Powder(rings) = &picks.panels["d0"] else {
            panic!("expected powder picks");
        };
        let tths = material.ring_tths(instr.beam.energy_kev);
        let pd = &overlay.cached_data()["d0"];
        let n_found: usize = rings.iter().map(Vec::len).sum();
        assert!(n_found > 10, "too few auto picks: {}", n_found);
        for (local, ring_picks) in rings.iter().enumerate() {
            let nominal = tths[pd.ring_indices[local]];
            for &cart in ring_picks {
                let angles = super::super::cart_pick_to_angles(
                    cart,
                    "d0",
                    &instr,
                    EtaPeriod::default(),
                );
                assert!(
                    (angles[0] - nominal.to_degrees()).abs() < 0.05,
                    "pick at {} deg vs nominal {} deg",
                    angles[0],
                    nominal.to_degrees()
                );
            }
        }
    }

    #[test]
    fn laue_centroid_finds_offset_spot() {
        let instr = instrument();
        let panel = instr.panel("d0").unwrap();
        // A bright blob offset by ~2 px from the prediction.
        let mut img = DMatrix::from_element(panel.rows, panel.cols, 1.0);
        let predicted_cart = [30.0, -20.0];
        let ij = panel.pixel_from_cart(predicted_cart);
        let (ic, jc) = (ij[0].round() as usize + 2, ij[1].round() as usize + 1);
        for di in 0..3 {
            for dj in 0..3 {
                img[(ic + di - 1, jc + dj - 1)] = 500.0;
            }
        }
        let options = LaueAutoPickOptions {
            window_px: 8,
            min_intensity: 100.0,
            ..Default::default()
        };
        let cart = centroid_pick(panel, &img, predicted_cart, &options);
        assert!(!super::super::is_unset(cart));
        let picked_ij = panel.pixel_from_cart(cart);
        assert!((picked_ij[0] - ic as f64).abs() < 0.2);
        assert!((picked_ij[1] - jc as f64).abs() < 0.2);

        // A flat image yields no pick.
        let flat = DMatrix::from_element(panel.rows, panel.cols, 1.0);
        let unset = centroid_pick(panel, &flat, predicted_cart, &options);
        assert!(super::super::is_unset(unset));
    }
}
