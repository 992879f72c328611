//! Const-chi overlay: rings of constant polar angle about the sample axis.
//!
//! Each configured chi value traces the cone of directions at that angle
//! from the (chi-tilted) sample rotation axis; the cone's intersection with
//! every panel is a polyline in the active view's coordinates, split where
//! consecutive points jump.

use nalgebra::Vector3;

use super::{cart_to_view, ConstChiParams, OverlayContext, OverlayData, OverlayError, PanelOverlayData};

pub fn generate(
    ctx: &OverlayContext,
    params: &ConstChiParams,
) -> Result<OverlayData, OverlayError> {
    let sample = &ctx.instrument.sample;
    let axis = sample.rmat() * Vector3::new(0.0, 1.0, 0.0);
    // Orthonormal pair spanning the plane perpendicular to the axis.
    let seed = Vector3::new(1.0, 0.0, 0.0);
    let u = (seed - axis * seed.dot(&axis)).normalize();
    let w = axis.cross(&u);

    let steps = params.steps.max(16);
    let mut data = OverlayData::new();
    for (name, panel) in ctx.instrument.panels() {
        let mut pd = PanelOverlayData::default();
        for &chi in &params.chi_values {
            let mut line = Vec::new();
            for k in 0..=steps {
                let phi = 2.0 * std::f64::consts::PI * k as f64 / steps as f64;
                let dir = axis * chi.cos() + (u * phi.cos() + w * phi.sin()) * chi.sin();
                let mut cart = panel.intersect_ray(&sample.tvec, &dir);
                if let Some(d) = &panel.distortion {
                    cart = d.apply_inverse(cart);
                }
                if !panel.on_panel(cart, false) {
                    continue;
                }
                let p = cart_to_view(cart, panel, ctx);
                if p[0].is_finite() && p[1].is_finite() {
                    line.push(p);
                }
            }
            if line.is_empty() {
                continue;
            }
            pd.rings.push(split_jumps(line));
        }
        data.insert(name.clone(), pd);
    }
    Ok(data)
}

/// Insert NaN separators where consecutive points are far apart (more than
/// ten times the median step) so the rendering layer does not connect them.
fn split_jumps(line: Vec<[f64; 2]>) -> Vec<[f64; 2]> {
    if line.len() < 3 {
        return line;
    }
    let mut steps: Vec<f64> = line
        .windows(2)
        .map(|w| ((w[1][0] - w[0][0]).powi(2) + (w[1][1] - w[0][1]).powi(2)).sqrt())
        .collect();
    steps.sort_by(f64::total_cmp);
    let median = steps[steps.len() / 2];
    let tolerance = median * 10.0;

    let mut out = Vec::with_capacity(line.len());
    for (k, pt) in line.iter().enumerate() {
        if k > 0 {
            let prev = line[k - 1];
            let d = ((pt[0] - prev[0]).powi(2) + (pt[1] - prev[1]).powi(2)).sqrt();
            if d > tolerance {
                out.push([f64::NAN, f64::NAN]);
            }
        }
        out.push(*pt);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instrument::angles::EtaPeriod;
    use crate::instrument::{Beam, Instrument, Panel, SamplePose};
    use crate::material::{Lattice, Material};
    use crate::overlay::ViewFrame;

    #[test]
    fn chi_rings_land_on_panel() {
        let mut instr = Instrument::new(Beam::default(), SamplePose::default());
        instr
            .add_panel(
                "d0",
                Panel::planar(
                    1024,
                    1024,
                    (0.4, 0.4),
                    Vector3::new(0.0, 0.0, -500.0),
                    Vector3::zeros(),
                ),
            )
            .unwrap();
        let material = Material::new("none", Lattice::cubic(4.0), vec![]);
        let ctx = OverlayContext {
            instrument: &instr,
            material: &material,
            frame: ViewFrame::Raw,
            eta_period: EtaPeriod::default(),
        };
        // The beam runs along -z and the axis along +y; directions near
        // chi = 90 degrees graze the detector plane normal.
        let params = ConstChiParams::new(vec![80.0f64.to_radians(), 85.0f64.to_radians()]);
        let data = generate(&ctx, &params).unwrap();
        let pd = &data["d0"];
        assert!(!pd.rings.is_empty());
        let panel = instr.panel("d0").unwrap();
        for ring in &pd.rings {
            for pt in ring.iter().filter(|p| p[0].is_finite()) {
                assert!(pt[0] >= -0.5 && pt[0] <= panel.rows as f64 - 0.5);
                assert!(pt[1] >= -0.5 && pt[1] <= panel.cols as f64 - 0.5);
            }
        }
    }

    #[test]
    fn duplicate_chi_values_collapse() {
        let params = ConstChiParams::new(vec![0.5, 0.5, 0.2]);
        assert_eq!(params.chi_values, vec![0.2, 0.5]);
    }
}
