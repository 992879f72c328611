//! Instrument configuration persistence.
//!
//! Instrument JSON follows a versioned schema (`diffcal.instrument.v1`).
//! Angles are stored in degrees and lengths in mm; the in-memory model uses
//! radians internally.

use std::collections::BTreeMap;
use std::path::Path;

use nalgebra::Vector3;
use serde::{Deserialize, Serialize};

use super::distortion::Distortion;
use super::{Beam, Instrument, InstrumentError, Panel, PanelShape, SamplePose};

const INSTRUMENT_SCHEMA_V1: &str = "diffcal.instrument.v1";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct InstrumentSpecV1 {
    schema: String,
    beam: BeamSpec,
    #[serde(default)]
    sample: SampleSpec,
    detectors: BTreeMap<String, PanelSpec>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct BeamSpec {
    /// Unit propagation direction in the lab frame.
    vector: [f64; 3],
    energy_kev: f64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct SampleSpec {
    #[serde(default)]
    chi_deg: f64,
    #[serde(default)]
    translation_mm: [f64; 3],
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct PanelSpec {
    rows: usize,
    cols: usize,
    pixel_pitch_mm: [f64; 2],
    translation_mm: [f64; 3],
    tilt_deg: [f64; 3],
    #[serde(default, skip_serializing_if = "Option::is_none")]
    cylinder_radius_mm: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    distortion: Option<Distortion>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    group: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    roi_offset: Option<(usize, usize)>,
}

impl Instrument {
    /// Load an instrument from a JSON file.
    pub fn from_json_file(path: &Path) -> Result<Self, Box<dyn std::error::Error>> {
        let data = std::fs::read_to_string(path)?;
        Self::from_json_str(&data).map_err(Into::into)
    }

    /// Parse an instrument from a JSON string.
    pub fn from_json_str(data: &str) -> Result<Self, Box<dyn std::error::Error>> {
        let spec: InstrumentSpecV1 = serde_json::from_str(data)?;
        from_spec(spec).map_err(Into::into)
    }

    /// Serialize to the versioned JSON schema.
    pub fn to_json_string(&self) -> Result<String, Box<dyn std::error::Error>> {
        let spec = to_spec(self);
        Ok(serde_json::to_string_pretty(&spec)?)
    }

    /// Write the instrument to a JSON file.
    pub fn to_json_file(&self, path: &Path) -> Result<(), Box<dyn std::error::Error>> {
        std::fs::write(path, self.to_json_string()?)?;
        Ok(())
    }
}

fn from_spec(spec: InstrumentSpecV1) -> Result<Instrument, InstrumentError> {
    if spec.schema != INSTRUMENT_SCHEMA_V1 {
        return Err(InstrumentError::BadSchema {
            found: spec.schema,
            expected: INSTRUMENT_SCHEMA_V1.to_string(),
        });
    }

    let beam = Beam {
        vector: Vector3::from_column_slice(&spec.beam.vector).normalize(),
        energy_kev: spec.beam.energy_kev,
    };
    let sample = SamplePose {
        chi: spec.sample.chi_deg.to_radians(),
        tvec: Vector3::from_column_slice(&spec.sample.translation_mm),
    };

    let mut instrument = Instrument::new(beam, sample);
    for (name, p) in spec.detectors {
        let shape = match p.cylinder_radius_mm {
            Some(radius_mm) if radius_mm > 0.0 => PanelShape::Cylindrical { radius_mm },
            Some(_) => {
                return Err(InstrumentError::InvalidPanel {
                    name,
                    reason: "non-positive cylinder radius".into(),
                })
            }
            None => PanelShape::Planar,
        };
        let panel = Panel {
            rows: p.rows,
            cols: p.cols,
            pitch: (p.pixel_pitch_mm[0], p.pixel_pitch_mm[1]),
            tvec: Vector3::from_column_slice(&p.translation_mm),
            tilt: Vector3::new(
                p.tilt_deg[0].to_radians(),
                p.tilt_deg[1].to_radians(),
                p.tilt_deg[2].to_radians(),
            ),
            shape,
            distortion: p.distortion,
            buffer: None,
            group: p.group,
            roi_offset: p.roi_offset,
        };
        instrument.add_panel(name, panel)?;
    }
    Ok(instrument)
}

fn to_spec(instrument: &Instrument) -> InstrumentSpecV1 {
    let detectors = instrument
        .panels()
        .map(|(name, p)| {
            let cylinder_radius_mm = match p.shape {
                PanelShape::Planar => None,
                PanelShape::Cylindrical { radius_mm } => Some(radius_mm),
            };
            let spec = PanelSpec {
                rows: p.rows,
                cols: p.cols,
                pixel_pitch_mm: [p.pitch.0, p.pitch.1],
                translation_mm: [p.tvec.x, p.tvec.y, p.tvec.z],
                tilt_deg: [
                    p.tilt.x.to_degrees(),
                    p.tilt.y.to_degrees(),
                    p.tilt.z.to_degrees(),
                ],
                cylinder_radius_mm,
                distortion: p.distortion.clone(),
                group: p.group.clone(),
                roi_offset: p.roi_offset,
            };
            (name.clone(), spec)
        })
        .collect();

    InstrumentSpecV1 {
        schema: INSTRUMENT_SCHEMA_V1.to_string(),
        beam: BeamSpec {
            vector: [
                instrument.beam.vector.x,
                instrument.beam.vector.y,
                instrument.beam.vector.z,
            ],
            energy_kev: instrument.beam.energy_kev,
        },
        sample: SampleSpec {
            chi_deg: instrument.sample.chi.to_degrees(),
            translation_mm: [
                instrument.sample.tvec.x,
                instrument.sample.tvec.y,
                instrument.sample.tvec.z,
            ],
        },
        detectors,
    }
}
