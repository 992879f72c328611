//! Powder ring overlay generation.
//!
//! Rings are sampled densely in eta at each reflection's nominal two-theta,
//! mapped through the instrument geometry onto each panel, clipped, and
//! expressed in the active view's coordinates. When the material carries a
//! two-theta width, tolerance-band boundary rings are emitted from the
//! merged ranges, tagged with their member reflections.

use super::{cart_to_view, OverlayContext, OverlayData, OverlayError, PanelOverlayData, PowderParams};
use crate::instrument::Panel;

pub fn generate(
    ctx: &OverlayContext,
    params: &PowderParams,
) -> Result<OverlayData, OverlayError> {
    let energy = ctx.instrument.beam.energy_kev;
    let tths = ctx.material.ring_tths(energy);
    let merged = ctx.material.merged_ranges(energy);
    let etas = eta_samples(params.eta_steps);

    let mut data = OverlayData::new();
    for (name, panel) in ctx.instrument.panels() {
        let mut pd = PanelOverlayData::default();

        for (i, &tth) in tths.iter().enumerate() {
            if !tth.is_finite() {
                continue;
            }
            let pts = ring_points(tth, &etas, panel, ctx, params);
            if pts.is_empty() {
                // Ring does not touch this panel; the local reflection
                // list shortens accordingly.
                continue;
            }
            pd.hkls.push(ctx.material.planes[i]);
            pd.ring_indices.push(i);
            pd.rings.push(pts);
        }

        for range in &merged {
            let lower = ring_points(range.bounds.0, &etas, panel, ctx, params);
            if !lower.is_empty() {
                pd.ring_ranges.push(lower);
                pd.range_indices.push(range.indices.clone());
            }
        }
        for range in &merged {
            let upper = ring_points(range.bounds.1, &etas, panel, ctx, params);
            if !upper.is_empty() {
                pd.ring_ranges.push(upper);
                pd.range_indices.push(range.indices.clone());
            }
        }

        data.insert(name.clone(), pd);
    }
    Ok(data)
}

fn eta_samples(steps: usize) -> Vec<f64> {
    let steps = steps.max(8);
    (0..=steps)
        .map(|k| -std::f64::consts::PI + 2.0 * std::f64::consts::PI * k as f64 / steps as f64)
        .collect()
}

/// Sample one ring on one panel: angles -> ideal Cartesian -> distorted
/// Cartesian -> clip -> view coordinates.
fn ring_points(
    tth: f64,
    etas: &[f64],
    panel: &Panel,
    ctx: &OverlayContext,
    params: &PowderParams,
) -> Vec<[f64; 2]> {
    let beam = ctx.instrument.beam.frame();
    let mut pts = Vec::new();
    for &eta in etas {
        let mut xy = panel.angles_to_cart(tth, eta, &beam, &ctx.instrument.sample);
        if let Some(d) = &panel.distortion {
            xy = d.apply_inverse(xy);
        }
        if !panel.on_panel(xy, params.clip_with_panel_buffer) {
            continue;
        }
        let p = cart_to_view(xy, panel, ctx);
        if p[0].is_finite() && p[1].is_finite() {
            pts.push(p);
        }
    }
    pts
}
