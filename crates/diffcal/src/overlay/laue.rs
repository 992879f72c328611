//! Laue (polychromatic single-crystal) overlay generation.
//!
//! A kinematic forward simulation stands in for the external diffraction
//! engine: each reciprocal-lattice vector selects its own wavelength from
//! the Bragg condition, spots inside the energy band are projected onto the
//! panels, and optional tolerance regions (rectangle or ellipse in angle
//! space) are attached for display and pick matching.

use nalgebra::Vector3;

use super::{
    cart_to_view, LaueParams, OverlayContext, OverlayData, OverlayError, PanelOverlayData,
    RangeShape,
};
use crate::instrument::{Instrument, Panel, SamplePose};
use crate::material::{CrystalParams, Material, KEV_ANGSTROM};

/// One simulated Laue reflection on a panel.
#[derive(Debug, Clone)]
pub struct LaueSpot {
    pub hkl: [i32; 3],
    /// Measured (distortion-applied) panel Cartesian position (mm).
    pub cart: [f64; 2],
    /// Scattering angles (radians), eta unmapped.
    pub tth: f64,
    pub eta: f64,
    /// Selected photon energy (keV).
    pub energy_kev: f64,
}

/// Kinematic Laue simulation for one panel.
///
/// Emits every reflection whose Bragg-selected energy lies inside
/// `[min_energy, max_energy]` and whose spot lands on the panel. Degenerate
/// lattices fail; degenerate single reflections are skipped.
pub fn simulate_spots(
    instrument: &Instrument,
    panel: &Panel,
    material: &Material,
    crystal: &CrystalParams,
    min_energy_kev: f64,
    max_energy_kev: f64,
) -> Result<Vec<LaueSpot>, OverlayError> {
    let b_matrix = material
        .lattice
        .b_matrix()
        .ok_or_else(|| OverlayError::DegenerateMaterial(material.name.clone()))?;
    let frame = instrument.beam.frame();
    let sample = &instrument.sample;
    let orient = sample.rmat() * crystal.rmat() * crystal.stretch_matrix();
    let origin = sample.tvec + sample.rmat() * crystal.position_vec();

    let mut spots = Vec::new();
    for &hkl in &material.planes {
        let h = Vector3::new(hkl[0] as f64, hkl[1] as f64, hkl[2] as f64);
        let g = orient * (b_matrix * h);
        let g_norm = g.norm();
        if !g_norm.is_finite() || g_norm < 1e-12 {
            continue;
        }
        let mut g_hat = g / g_norm;
        // Friedel pair: choose the orientation diffracting the beam.
        let mut s = -frame.b.dot(&g_hat);
        if s < 0.0 {
            g_hat = -g_hat;
            s = -s;
        }
        if s <= 1e-12 {
            continue;
        }
        let lambda = 2.0 * s / g_norm;
        let energy = KEV_ANGSTROM / lambda;
        if energy < min_energy_kev || energy > max_energy_kev {
            continue;
        }
        let dir = frame.b + g_hat * (2.0 * s);
        let mut cart = panel.intersect_ray(&origin, &dir);
        if let Some(d) = &panel.distortion {
            cart = d.apply_inverse(cart);
        }
        if !panel.on_panel(cart, false) {
            continue;
        }
        let (tth, eta) =
            frame.angles_from_ray(&dir, crate::instrument::angles::EtaPeriod::default());
        spots.push(LaueSpot {
            hkl,
            cart,
            tth,
            eta,
            energy_kev: energy,
        });
    }
    Ok(spots)
}

pub fn generate(ctx: &OverlayContext, params: &LaueParams) -> Result<OverlayData, OverlayError> {
    let mut data = OverlayData::new();
    for (name, panel) in ctx.instrument.panels() {
        let spots = simulate_spots(
            ctx.instrument,
            panel,
            ctx.material,
            &params.crystal,
            params.min_energy_kev,
            params.max_energy_kev,
        )?;

        let mut pd = PanelOverlayData::default();
        for spot in &spots {
            let p = cart_to_view(spot.cart, panel, ctx);
            if !p[0].is_finite() || !p[1].is_finite() {
                continue;
            }
            pd.hkls.push(spot.hkl);
            pd.spots.push(p);
            pd.spot_energies.push(spot.energy_kev);
            pd.spot_ranges
                .push(range_outline(spot, panel, ctx, params));
        }
        tracing::debug!(panel = %name, n_spots = pd.spots.len(), "laue spots simulated");
        data.insert(name.clone(), pd);
    }
    Ok(data)
}

/// Tolerance-region outline around one spot, in view coordinates.
fn range_outline(
    spot: &LaueSpot,
    panel: &Panel,
    ctx: &OverlayContext,
    params: &LaueParams,
) -> Vec<[f64; 2]> {
    let (Some(tth_width), Some(eta_width)) = (params.tth_width, params.eta_width) else {
        return Vec::new();
    };
    let beam = ctx.instrument.beam.frame();
    let sample: &SamplePose = &ctx.instrument.sample;

    let offsets: Vec<[f64; 2]> = match params.range_shape {
        RangeShape::Rectangle => vec![
            [0.5, 0.5],
            [0.5, -0.5],
            [-0.5, -0.5],
            [-0.5, 0.5],
            [0.5, 0.5],
        ],
        RangeShape::Ellipse => (0..=24)
            .map(|k| {
                let t = 2.0 * std::f64::consts::PI * k as f64 / 24.0;
                [0.5 * t.cos(), 0.5 * t.sin()]
            })
            .collect(),
    };

    let mut outline = Vec::with_capacity(offsets.len());
    for off in offsets {
        let tth = spot.tth + off[0] * tth_width;
        let eta = spot.eta + off[1] * eta_width;
        let mut xy = panel.angles_to_cart(tth, eta, &beam, sample);
        if let Some(d) = &panel.distortion {
            xy = d.apply_inverse(xy);
        }
        let p = cart_to_view(xy, panel, ctx);
        if p[0].is_finite() && p[1].is_finite() {
            outline.push(p);
        }
    }
    outline
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instrument::angles::EtaPeriod;
    use crate::instrument::Beam;
    use crate::material::Lattice;
    use crate::overlay::ViewFrame;
    use nalgebra::Vector3;

    fn setup() -> (Instrument, Material) {
        let mut instr = Instrument::new(Beam::default(), SamplePose::default());
        instr
            .add_panel(
                "d0",
                Panel::planar(
                    1024,
                    1024,
                    (0.4, 0.4),
                    Vector3::new(0.0, 0.0, -300.0),
                    Vector3::zeros(),
                ),
            )
            .unwrap();
        let mut planes = Vec::new();
        for h in -3i32..=3 {
            for k in -3i32..=3 {
                for l in -3i32..=3 {
                    if (h, k, l) != (0, 0, 0) {
                        planes.push([h, k, l]);
                    }
                }
            }
        }
        (instr, Material::new("Ni", Lattice::cubic(3.5238), planes))
    }

    #[test]
    fn spots_respect_energy_band() {
        let (instr, material) = setup();
        let panel = instr.panel("d0").unwrap();
        let crystal = CrystalParams {
            orientation: [0.2, -0.1, 0.35],
            ..Default::default()
        };
        let spots =
            simulate_spots(&instr, panel, &material, &crystal, 8.0, 30.0).unwrap();
        assert!(!spots.is_empty(), "no spots simulated");
        for spot in &spots {
            assert!(spot.energy_kev >= 8.0 && spot.energy_kev <= 30.0);
            assert!(panel.on_panel(spot.cart, false));
        }
    }

    #[test]
    fn bragg_condition_holds_per_spot() {
        let (instr, material) = setup();
        let panel = instr.panel("d0").unwrap();
        let crystal = CrystalParams {
            orientation: [0.0, 0.3, -0.2],
            ..Default::default()
        };
        let spots =
            simulate_spots(&instr, panel, &material, &crystal, 5.0, 40.0).unwrap();
        for spot in &spots {
            let d = material.lattice.d_spacing(spot.hkl);
            let lambda = KEV_ANGSTROM / spot.energy_kev;
            // lambda = 2 d sin(theta)
            let lhs = lambda;
            let rhs = 2.0 * d * (spot.tth / 2.0).sin();
            assert!(
                (lhs - rhs).abs() < 1e-9,
                "hkl {:?}: {} vs {}",
                spot.hkl,
                lhs,
                rhs
            );
        }
    }

    #[test]
    fn ellipse_ranges_surround_spots() {
        let (instr, material) = setup();
        let ctx = OverlayContext {
            instrument: &instr,
            material: &material,
            frame: ViewFrame::Raw,
            eta_period: EtaPeriod::default(),
        };
        let params = LaueParams {
            crystal: CrystalParams {
                orientation: [0.2, -0.1, 0.35],
                ..Default::default()
            },
            min_energy_kev: 8.0,
            max_energy_kev: 30.0,
            tth_width: Some(0.5f64.to_radians()),
            eta_width: Some(1.0f64.to_radians()),
            range_shape: RangeShape::Ellipse,
        };
        let data = generate(&ctx, &params).unwrap();
        let pd = &data["d0"];
        assert_eq!(pd.spots.len(), pd.spot_ranges.len());
        assert!(!pd.spots.is_empty());
        for (spot, outline) in pd.spots.iter().zip(&pd.spot_ranges) {
            if outline.is_empty() {
                continue;
            }
            // The outline centroid tracks the spot.
            let cx = outline.iter().map(|p| p[0]).sum::<f64>() / outline.len() as f64;
            let cy = outline.iter().map(|p| p[1]).sum::<f64>() / outline.len() as f64;
            assert!((cx - spot[0]).abs() < 25.0);
            assert!((cy - spot[1]).abs() < 25.0);
        }
    }
}
