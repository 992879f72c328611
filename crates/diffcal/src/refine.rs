//! Pick-based nonlinear least-squares refinement.
//!
//! The engine reads and writes model values only through parameter
//! accessor paths ([`ParamId`]); its private working state exists just for
//! the duration of one solve. Residuals are built overlay-agnostically from
//! materialized correspondences in panel-local Cartesian coordinates, which
//! sidesteps periodic-angle discontinuities. The same entry point serves a
//! powder-only and a joint powder + Laue refinement.

pub mod residual;
pub mod solver;

use std::cell::RefCell;
use std::collections::BTreeMap;

use nalgebra::DVector;

use crate::instrument::Instrument;
use crate::material::{CrystalParams, Material};

pub use residual::{build_correspondences, residual_vector, Correspondence, Predictor};
pub use solver::{solve_lm, LmOptions, RefineOutcome};

/// One scalar degree of freedom, addressed by path into the model.
#[derive(Debug, Clone, PartialEq)]
pub enum ParamId {
    PanelTilt { panel: String, axis: usize },
    PanelTranslation { panel: String, axis: usize },
    BeamAzimuth,
    BeamPolar,
    BeamEnergy,
    SampleChi,
    SampleTranslation { axis: usize },
    CrystalOrientation { overlay: String, axis: usize },
    CrystalPosition { overlay: String, axis: usize },
    LatticeParam { material: String, index: usize },
}

/// A degree of freedom with its free/fixed flag.
#[derive(Debug, Clone, PartialEq)]
pub struct ParamDescriptor {
    pub id: ParamId,
    pub vary: bool,
}

/// Ordered refinement parameter set.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParamSet {
    pub params: Vec<ParamDescriptor>,
}

impl ParamSet {
    /// Instrument-standard parameter set: per-panel tilt and translation
    /// (free), beam and sample (fixed).
    pub fn instrument_default(instrument: &Instrument) -> Self {
        let mut params = Vec::new();
        for (name, _) in instrument.panels() {
            for axis in 0..3 {
                params.push(ParamDescriptor {
                    id: ParamId::PanelTilt {
                        panel: name.clone(),
                        axis,
                    },
                    vary: true,
                });
            }
            for axis in 0..3 {
                params.push(ParamDescriptor {
                    id: ParamId::PanelTranslation {
                        panel: name.clone(),
                        axis,
                    },
                    vary: true,
                });
            }
        }
        params.push(ParamDescriptor {
            id: ParamId::BeamAzimuth,
            vary: false,
        });
        params.push(ParamDescriptor {
            id: ParamId::BeamPolar,
            vary: false,
        });
        params.push(ParamDescriptor {
            id: ParamId::BeamEnergy,
            vary: false,
        });
        params.push(ParamDescriptor {
            id: ParamId::SampleChi,
            vary: false,
        });
        for axis in 0..3 {
            params.push(ParamDescriptor {
                id: ParamId::SampleTranslation { axis },
                vary: false,
            });
        }
        Self { params }
    }

    /// Add crystal orientation/position parameters for a Laue overlay.
    pub fn with_crystal(mut self, overlay: &str, vary_orientation: bool, vary_position: bool) -> Self {
        for axis in 0..3 {
            self.params.push(ParamDescriptor {
                id: ParamId::CrystalOrientation {
                    overlay: overlay.to_string(),
                    axis,
                },
                vary: vary_orientation,
            });
        }
        for axis in 0..3 {
            self.params.push(ParamDescriptor {
                id: ParamId::CrystalPosition {
                    overlay: overlay.to_string(),
                    axis,
                },
                vary: vary_position,
            });
        }
        self
    }

    /// Set the vary flag of every parameter matching `pred`.
    pub fn set_vary(&mut self, mut pred: impl FnMut(&ParamId) -> bool, vary: bool) {
        for p in &mut self.params {
            if pred(&p.id) {
                p.vary = vary;
            }
        }
    }

    /// Indices of free parameters.
    pub fn free_indices(&self) -> Vec<usize> {
        self.params
            .iter()
            .enumerate()
            .filter(|(_, p)| p.vary)
            .map(|(i, _)| i)
            .collect()
    }

    /// Pack the free parameter values into a vector.
    pub fn pack(&self, model: &RefinableModel) -> DVector<f64> {
        DVector::from_iterator(
            self.free_indices().len(),
            self.params
                .iter()
                .filter(|p| p.vary)
                .map(|p| model.get(&p.id)),
        )
    }

    /// Write a free-parameter vector back into the model.
    pub fn apply(&self, model: &mut RefinableModel, x: &DVector<f64>) {
        let mut k = 0;
        for p in &self.params {
            if p.vary {
                model.set(&p.id, x[k]);
                k += 1;
            }
        }
    }
}

/// The model slice the engine may read and write.
#[derive(Debug, Clone)]
pub struct RefinableModel {
    pub instrument: Instrument,
    /// Materials by name.
    pub materials: BTreeMap<String, Material>,
    /// Crystal parameters by overlay name (Laue / rotation series).
    pub crystals: BTreeMap<String, CrystalParams>,
}

impl RefinableModel {
    pub fn get(&self, id: &ParamId) -> f64 {
        match id {
            ParamId::PanelTilt { panel, axis } => self
                .instrument
                .panel(panel)
                .map(|p| p.tilt[*axis])
                .unwrap_or(f64::NAN),
            ParamId::PanelTranslation { panel, axis } => self
                .instrument
                .panel(panel)
                .map(|p| p.tvec[*axis])
                .unwrap_or(f64::NAN),
            ParamId::BeamAzimuth => self.instrument.beam.spherical().0,
            ParamId::BeamPolar => self.instrument.beam.spherical().1,
            ParamId::BeamEnergy => self.instrument.beam.energy_kev,
            ParamId::SampleChi => self.instrument.sample.chi,
            ParamId::SampleTranslation { axis } => self.instrument.sample.tvec[*axis],
            ParamId::CrystalOrientation { overlay, axis } => self
                .crystals
                .get(overlay)
                .map(|c| c.orientation[*axis])
                .unwrap_or(f64::NAN),
            ParamId::CrystalPosition { overlay, axis } => self
                .crystals
                .get(overlay)
                .map(|c| c.position[*axis])
                .unwrap_or(f64::NAN),
            ParamId::LatticeParam { material, index } => self
                .materials
                .get(material)
                .map(|m| m.lattice.as_array()[*index])
                .unwrap_or(f64::NAN),
        }
    }

    pub fn set(&mut self, id: &ParamId, value: f64) {
        match id {
            ParamId::PanelTilt { panel, axis } => {
                if let Ok(p) = self.instrument.panel_mut(panel) {
                    p.tilt[*axis] = value;
                }
            }
            ParamId::PanelTranslation { panel, axis } => {
                if let Ok(p) = self.instrument.panel_mut(panel) {
                    p.tvec[*axis] = value;
                }
            }
            ParamId::BeamAzimuth => {
                let (_, polar) = self.instrument.beam.spherical();
                self.instrument.beam.set_spherical(value, polar);
            }
            ParamId::BeamPolar => {
                let (azimuth, _) = self.instrument.beam.spherical();
                self.instrument.beam.set_spherical(azimuth, value);
            }
            ParamId::BeamEnergy => self.instrument.beam.energy_kev = value,
            ParamId::SampleChi => self.instrument.sample.chi = value,
            ParamId::SampleTranslation { axis } => self.instrument.sample.tvec[*axis] = value,
            ParamId::CrystalOrientation { overlay, axis } => {
                if let Some(c) = self.crystals.get_mut(overlay) {
                    c.orientation[*axis] = value;
                }
            }
            ParamId::CrystalPosition { overlay, axis } => {
                if let Some(c) = self.crystals.get_mut(overlay) {
                    c.position[*axis] = value;
                }
            }
            ParamId::LatticeParam { material, index } => {
                if let Some(m) = self.materials.get_mut(material) {
                    let mut arr = m.lattice.as_array();
                    arr[*index] = value;
                    m.lattice = crate::material::Lattice::from_array(arr);
                }
            }
        }
    }
}

/// Run one refinement over the free parameters and write the result back.
///
/// Non-convergence (including a singular Jacobian) is reported in the
/// outcome, never raised; the model then keeps its initial values.
pub fn refine(
    model: &mut RefinableModel,
    params: &ParamSet,
    correspondences: &[Correspondence],
    options: &LmOptions,
) -> RefineOutcome {
    let x0 = params.pack(model);
    if x0.is_empty() {
        return RefineOutcome {
            converged: false,
            n_iter: 0,
            rss_before: f64::NAN,
            rss_after: f64::NAN,
            residual: DVector::zeros(0),
            message: "no free parameters".to_string(),
        };
    }

    let work = RefCell::new(model.clone());
    let f = |x: &DVector<f64>| {
        let mut m = work.borrow_mut();
        params.apply(&mut m, x);
        residual_vector(&m, correspondences)
    };

    let (x_final, outcome) = solve_lm(f, x0, options);
    if outcome.converged {
        params.apply(model, &x_final);
    }
    tracing::info!(
        converged = outcome.converged,
        n_iter = outcome.n_iter,
        rss_before = outcome.rss_before,
        rss_after = outcome.rss_after,
        "refinement finished"
    );
    outcome
}
