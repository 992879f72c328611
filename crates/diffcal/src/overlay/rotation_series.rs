//! Rotation-series (monochromatic scan) overlay generation.
//!
//! For each reflection, solve the rotation angles where the Bragg condition
//! is met while the sample spins about its stage axis, then project the
//! diffracted rays at those angles. Aggregated display shows every
//! increment; otherwise only spots whose omega falls inside the active
//! frame's range (± half-width) are emitted.

use nalgebra::{Rotation3, Vector3};

use super::{
    cart_to_view, OverlayContext, OverlayData, OverlayError, PanelOverlayData,
    RotationSeriesParams,
};
use crate::material::KEV_ANGSTROM;

const TWO_PI: f64 = 2.0 * std::f64::consts::PI;

fn map_omega(omega: f64, period_min: f64) -> f64 {
    period_min + (omega - period_min).rem_euclid(TWO_PI)
}

fn in_ranges(value: f64, ranges: &[(f64, f64)]) -> bool {
    ranges.iter().any(|&(lo, hi)| value >= lo && value <= hi)
}

pub fn generate(
    ctx: &OverlayContext,
    params: &RotationSeriesParams,
) -> Result<OverlayData, OverlayError> {
    let material = ctx.material;
    let b_matrix = material
        .lattice
        .b_matrix()
        .ok_or_else(|| OverlayError::DegenerateMaterial(material.name.clone()))?;
    let frame = ctx.instrument.beam.frame();
    let sample = &ctx.instrument.sample;
    let lambda = ctx.instrument.beam.wavelength_angstrom();
    let crystal = &params.crystal;

    // Reciprocal vectors in the (chi-tilted) sample frame at omega = 0.
    let orient = sample.rmat() * crystal.rmat() * crystal.stretch_matrix();
    let axis = sample.rmat() * Vector3::new(0.0, 1.0, 0.0);

    // Solutions gathered per (hkl, omega); projected per panel below.
    struct Candidate {
        hkl: [i32; 3],
        omega: f64,
        dir: Vector3<f64>,
    }
    let mut candidates = Vec::new();

    for &hkl in &material.planes {
        let h = Vector3::new(hkl[0] as f64, hkl[1] as f64, hkl[2] as f64);
        let g0 = orient * (b_matrix * h);
        let g_norm = g0.norm();
        if !g_norm.is_finite() || g_norm < 1e-12 {
            continue;
        }
        let s = lambda * g_norm / 2.0;
        if s > 1.0 {
            // Beyond the Bragg limit at this wavelength.
            continue;
        }
        let g0_hat = g0 / g_norm;

        // b . R_axis(omega) g0 = -s  ->  A cos w + B sin w = -s - C
        let ba = frame.b.dot(&axis);
        let ga = axis.dot(&g0_hat);
        let a_coef = frame.b.dot(&g0_hat) - ba * ga;
        let b_coef = frame.b.dot(&axis.cross(&g0_hat));
        let c_coef = ba * ga;
        let amp = (a_coef * a_coef + b_coef * b_coef).sqrt();
        if amp < 1e-14 {
            continue;
        }
        let rhs = (-s - c_coef) / amp;
        if rhs.abs() > 1.0 {
            continue;
        }
        let phase = b_coef.atan2(a_coef);
        let delta = rhs.acos();
        for omega in [phase + delta, phase - delta] {
            let omega = map_omega(omega, params.ome_period_min);
            if !in_ranges(omega, &params.ome_ranges) {
                continue;
            }
            let g_rot = Rotation3::from_axis_angle(
                &nalgebra::Unit::new_normalize(axis),
                omega,
            ) * g0_hat;
            let dir = frame.b + g_rot * (2.0 * s);
            let (_, eta) = frame.angles_from_ray(&dir, ctx.eta_period);
            if !in_ranges(eta, &params.eta_ranges) {
                continue;
            }
            candidates.push(Candidate { hkl, omega, dir });
        }
    }

    let half_frame = params.ome_frame_width / 2.0;
    let mut data = OverlayData::new();
    for (name, panel) in ctx.instrument.panels() {
        let mut pd = PanelOverlayData::default();
        for cand in &candidates {
            if !params.aggregated {
                let delta = (cand.omega - params.ome_frame_center + std::f64::consts::PI)
                    .rem_euclid(TWO_PI)
                    - std::f64::consts::PI;
                if delta.abs() > half_frame {
                    continue;
                }
            }
            let origin = sample.tvec + sample.rmat() * crystal.position_vec();
            let mut cart = panel.intersect_ray(&origin, &cand.dir);
            if let Some(d) = &panel.distortion {
                cart = d.apply_inverse(cart);
            }
            if !panel.on_panel(cart, false) {
                continue;
            }
            let p = cart_to_view(cart, panel, ctx);
            if !p[0].is_finite() || !p[1].is_finite() {
                continue;
            }
            pd.hkls.push(cand.hkl);
            pd.spots.push(p);
            pd.spot_omegas.push(cand.omega);
        }
        data.insert(name.clone(), pd);
    }
    Ok(data)
}
