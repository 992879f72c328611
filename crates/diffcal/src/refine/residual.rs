//! Correspondence materialization and residual construction.
//!
//! A correspondence pairs one observed pick with a predictor that can
//! recompute the feature's position from current model parameters. Once
//! materialized, residual building no longer cares which overlay kind a
//! correspondence came from.

use nalgebra::{DVector, Vector3};

use crate::instrument::angles::EtaPeriod;
use crate::overlay::{Overlay, OverlayKind};
use crate::picks::{is_unset, PanelPicks, PickSet};

use super::RefinableModel;

/// Recomputes a predicted feature position from model parameters.
#[derive(Debug, Clone, PartialEq)]
pub enum Predictor {
    /// Powder ring: two-theta from the material's lattice, eta taken from
    /// the observation.
    PowderRing { material: String, hkl: [i32; 3] },
    /// Laue spot: kinematic forward simulation of one reflection.
    LaueSpot {
        overlay: String,
        material: String,
        hkl: [i32; 3],
    },
}

/// One observed/predicted pair on a panel.
#[derive(Debug, Clone, PartialEq)]
pub struct Correspondence {
    pub panel: String,
    /// Observed position, panel-local Cartesian mm (distorted frame).
    pub observed_cart: [f64; 2],
    pub predictor: Predictor,
}

/// Flatten non-unset picks into correspondences, overlay by overlay.
pub fn build_correspondences(picks: &PickSet, overlays: &[&Overlay]) -> Vec<Correspondence> {
    let mut out = Vec::new();
    for overlay in overlays {
        let Some(op) = picks.overlay(&overlay.name) else {
            continue;
        };
        for (panel, panel_picks) in &op.panels {
            let Some(pd) = overlay.cached_data().get(panel) else {
                continue;
            };
            match (&overlay.kind, panel_picks) {
                (OverlayKind::Powder(_), PanelPicks::Powder(rings)) => {
                    for (local, ring) in rings.iter().enumerate() {
                        let Some(&hkl) = pd.hkls.get(local) else {
                            continue;
                        };
                        for &cart in ring {
                            if is_unset(cart) {
                                continue;
                            }
                            out.push(Correspondence {
                                panel: panel.clone(),
                                observed_cart: cart,
                                predictor: Predictor::PowderRing {
                                    material: overlay.material_name.clone(),
                                    hkl,
                                },
                            });
                        }
                    }
                }
                (OverlayKind::Laue(_), PanelPicks::Laue(spots)) => {
                    for (local, &cart) in spots.iter().enumerate() {
                        if is_unset(cart) {
                            continue;
                        }
                        let Some(&hkl) = pd.hkls.get(local) else {
                            continue;
                        };
                        out.push(Correspondence {
                            panel: panel.clone(),
                            observed_cart: cart,
                            predictor: Predictor::LaueSpot {
                                overlay: overlay.name.clone(),
                                material: overlay.material_name.clone(),
                                hkl,
                            },
                        });
                    }
                }
                _ => {}
            }
        }
    }
    tracing::debug!(n = out.len(), "correspondences materialized");
    out
}

/// Residual vector: two rows (x, y) per correspondence, predicted minus
/// observed in panel-local Cartesian mm. Predictions that leave the panel
/// during a solver excursion contribute zero rather than NaN so one bad
/// step cannot poison the whole fit.
pub fn residual_vector(model: &RefinableModel, correspondences: &[Correspondence]) -> DVector<f64> {
    let mut out = DVector::zeros(correspondences.len() * 2);
    for (k, corr) in correspondences.iter().enumerate() {
        let predicted = predict(model, corr);
        let (rx, ry) = match predicted {
            Some(p) => (
                p[0] - corr.observed_cart[0],
                p[1] - corr.observed_cart[1],
            ),
            None => (0.0, 0.0),
        };
        out[2 * k] = if rx.is_finite() { rx } else { 0.0 };
        out[2 * k + 1] = if ry.is_finite() { ry } else { 0.0 };
    }
    out
}

fn predict(model: &RefinableModel, corr: &Correspondence) -> Option<[f64; 2]> {
    let instrument = &model.instrument;
    let panel = instrument.panel(&corr.panel).ok()?;
    match &corr.predictor {
        Predictor::PowderRing { material, hkl } => {
            let material = model.materials.get(material)?;
            let d = material.lattice.d_spacing(*hkl);
            let s = instrument.beam.wavelength_angstrom() / (2.0 * d);
            if !(0.0..=1.0).contains(&s) {
                return None;
            }
            let tth_pred = 2.0 * s.asin();

            // Eta comes from the observation itself.
            let ideal_obs = match &panel.distortion {
                Some(dist) => dist.apply(corr.observed_cart),
                None => corr.observed_cart,
            };
            let (_, eta_obs) = panel.cart_to_angles(
                ideal_obs,
                &instrument.beam.frame(),
                &instrument.sample,
                EtaPeriod::default(),
            );
            if !eta_obs.is_finite() {
                return None;
            }
            let mut xy = panel.angles_to_cart(
                tth_pred,
                eta_obs,
                &instrument.beam.frame(),
                &instrument.sample,
            );
            if let Some(dist) = &panel.distortion {
                xy = dist.apply_inverse(xy);
            }
            (xy[0].is_finite() && xy[1].is_finite()).then_some(xy)
        }
        Predictor::LaueSpot {
            overlay,
            material,
            hkl,
        } => {
            let material = model.materials.get(material)?;
            let crystal = model.crystals.get(overlay)?;
            let b_matrix = material.lattice.b_matrix()?;
            let frame = instrument.beam.frame();
            let sample = &instrument.sample;

            let h = Vector3::new(hkl[0] as f64, hkl[1] as f64, hkl[2] as f64);
            let g = sample.rmat() * crystal.rmat() * crystal.stretch_matrix() * (b_matrix * h);
            let g_norm = g.norm();
            if !g_norm.is_finite() || g_norm < 1e-12 {
                return None;
            }
            let mut g_hat = g / g_norm;
            let mut s = -frame.b.dot(&g_hat);
            if s < 0.0 {
                g_hat = -g_hat;
                s = -s;
            }
            if s <= 1e-12 {
                return None;
            }
            let dir = frame.b + g_hat * (2.0 * s);
            let origin = sample.tvec + sample.rmat() * crystal.position_vec();
            let mut xy = panel.intersect_ray(&origin, &dir);
            if let Some(dist) = &panel.distortion {
                xy = dist.apply_inverse(xy);
            }
            (xy[0].is_finite() && xy[1].is_finite()).then_some(xy)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instrument::{Beam, Instrument, Panel, SamplePose};
    use crate::material::{Lattice, Material};
    use std::collections::BTreeMap;

    fn model() -> RefinableModel {
        let mut instr = Instrument::new(Beam::default(), SamplePose::default());
        instr
            .add_panel(
                "d0",
                Panel::planar(
                    1200,
                    1200,
                    (0.4, 0.4),
                    nalgebra::Vector3::new(0.0, 0.0, -800.0),
                    nalgebra::Vector3::zeros(),
                ),
            )
            .unwrap();
        RefinableModel {
            instrument: instr,
            materials: [(
                "CeO2".to_string(),
                Material::new("CeO2", Lattice::cubic(5.41153), vec![[1, 1, 1]]),
            )]
            .into(),
            crystals: BTreeMap::new(),
        }
    }

    #[test]
    fn residual_vanishes_for_perfect_picks() {
        let model = model();
        let panel = model.instrument.panel("d0").unwrap();
        let material = &model.materials["CeO2"];
        let tth = material.ring_tths(model.instrument.beam.energy_kev)[0];
        let beam = model.instrument.beam.frame();
        let xy = panel.angles_to_cart(tth, 0.7, &beam, &model.instrument.sample);

        let corr = vec![Correspondence {
            panel: "d0".into(),
            observed_cart: xy,
            predictor: Predictor::PowderRing {
                material: "CeO2".into(),
                hkl: [1, 1, 1],
            },
        }];
        let r = residual_vector(&model, &corr);
        assert_eq!(r.len(), 2);
        assert!(r.norm() < 1e-9, "norm {}", r.norm());
    }

    #[test]
    fn residual_grows_with_injected_shift() {
        let mut model = model();
        let panel = model.instrument.panel("d0").unwrap();
        let material = &model.materials["CeO2"];
        let tth = material.ring_tths(model.instrument.beam.energy_kev)[0];
        let beam = model.instrument.beam.frame();
        let xy = panel.angles_to_cart(tth, -1.2, &beam, &model.instrument.sample);
        let corr = vec![Correspondence {
            panel: "d0".into(),
            observed_cart: xy,
            predictor: Predictor::PowderRing {
                material: "CeO2".into(),
                hkl: [1, 1, 1],
            },
        }];

        model.instrument.panel_mut("d0").unwrap().tvec.x += 1.0;
        let r = residual_vector(&model, &corr);
        assert!(r.norm() > 0.1, "norm {}", r.norm());
    }

    #[test]
    fn unset_picks_never_materialize() {
        use crate::overlay::{OverlayKind, PowderParams};
        let overlay = Overlay::new("p", "CeO2", OverlayKind::Powder(PowderParams::default()));
        let mut picks = PickSet::default();
        picks.overlays.insert("p".into(), Default::default());
        let corr = build_correspondences(&picks, &[&overlay]);
        assert!(corr.is_empty());
    }
}
