//! Pick-set persistence.
//!
//! The container (`diffcal.picks.v1`) holds two parallel trees keyed
//! overlay name -> panel name -> reflection key -> positions: once in
//! panel-local Cartesian mm and once in (two-theta, eta) degrees.
//! Reflection keys are stringified Miller triples for powder rings and
//! sequential indices for Laue spots. Import validates the entire key
//! structure against the current session before touching any state; a
//! mismatch rejects the whole file.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::instrument::angles::EtaPeriod;
use crate::instrument::Instrument;
use crate::material::hkl_to_string;
use crate::overlay::Overlay;

use super::{
    angles_pick_to_cart, cart_pick_to_angles, is_unset, OverlayPicks, PanelPicks, PickSet,
};

const PICKS_SCHEMA_V1: &str = "diffcal.picks.v1";

/// Structure-validation failures; always fatal, never partially applied.
#[derive(Debug, Clone, PartialEq)]
pub enum PickIoError {
    BadSchema { found: String, expected: String },
    UnknownOverlay(String),
    PanelKeyMismatch {
        overlay: String,
        expected: Vec<String>,
        found: Vec<String>,
    },
    ReflectionKeyMismatch {
        overlay: String,
        panel: String,
        expected: Vec<String>,
        found: Vec<String>,
    },
}

impl std::fmt::Display for PickIoError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::BadSchema { found, expected } => {
                write!(f, "unsupported schema '{}' (expected '{}')", found, expected)
            }
            Self::UnknownOverlay(name) => {
                write!(f, "overlay '{}' is not part of the current session", name)
            }
            Self::PanelKeyMismatch {
                overlay,
                expected,
                found,
            } => write!(
                f,
                "overlay '{}': panel keys {:?} do not match session panels {:?}",
                overlay, found, expected
            ),
            Self::ReflectionKeyMismatch {
                overlay, panel, ..
            } => write!(
                f,
                "overlay '{}', panel '{}': reflection keys do not match",
                overlay, panel
            ),
        }
    }
}

impl std::error::Error for PickIoError {}

type Tree = BTreeMap<String, BTreeMap<String, BTreeMap<String, Vec<[f64; 2]>>>>;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct PickContainerV1 {
    schema: String,
    cartesian: Tree,
    angles: Tree,
}

/// Reflection keys of one overlay on one panel, in local order.
fn reflection_keys(overlay: &Overlay, panel: &str) -> Vec<String> {
    let Some(pd) = overlay.cached_data().get(panel) else {
        return Vec::new();
    };
    if overlay.kind.is_powder() {
        pd.hkls.iter().map(|&h| hkl_to_string(h)).collect()
    } else {
        (0..pd.spots.len()).map(|i| i.to_string()).collect()
    }
}

/// Serialize picks for the given overlays into the container format.
pub fn export_picks(
    picks: &PickSet,
    overlays: &[&Overlay],
    instrument: &Instrument,
    period: EtaPeriod,
) -> Result<String, Box<dyn std::error::Error>> {
    let mut cartesian = Tree::new();
    let mut angles = Tree::new();

    for overlay in overlays {
        let Some(op) = picks.overlay(&overlay.name) else {
            continue;
        };
        let mut cart_panels = BTreeMap::new();
        let mut ang_panels = BTreeMap::new();
        for (panel, panel_picks) in &op.panels {
            let keys = reflection_keys(overlay, panel);
            let mut cart_map = BTreeMap::new();
            let mut ang_map = BTreeMap::new();
            match panel_picks {
                PanelPicks::Powder(rings) => {
                    for (key, ring) in keys.iter().zip(rings) {
                        let ang: Vec<[f64; 2]> = ring
                            .iter()
                            .map(|&p| cart_pick_to_angles(p, panel, instrument, period))
                            .collect();
                        cart_map.insert(key.clone(), ring.clone());
                        ang_map.insert(key.clone(), ang);
                    }
                }
                PanelPicks::Laue(spots) => {
                    for (key, &spot) in keys.iter().zip(spots) {
                        // JSON has no NaN; unset spots export as empty.
                        let (cart, ang) = if is_unset(spot) {
                            (Vec::new(), Vec::new())
                        } else {
                            (
                                vec![spot],
                                vec![cart_pick_to_angles(spot, panel, instrument, period)],
                            )
                        };
                        cart_map.insert(key.clone(), cart);
                        ang_map.insert(key.clone(), ang);
                    }
                }
            }
            cart_panels.insert(panel.clone(), cart_map);
            ang_panels.insert(panel.clone(), ang_map);
        }
        cartesian.insert(overlay.name.clone(), cart_panels);
        angles.insert(overlay.name.clone(), ang_panels);
    }

    let container = PickContainerV1 {
        schema: PICKS_SCHEMA_V1.to_string(),
        cartesian,
        angles,
    };
    Ok(serde_json::to_string_pretty(&container)?)
}

/// Parse and validate a pick container against the session's overlays, then
/// return the picks it encodes (Cartesian tree is authoritative).
///
/// Validation covers the full overlay -> panel -> reflection key structure;
/// any mismatch rejects the import without producing partial data.
pub fn import_picks(
    data: &str,
    overlays: &[&Overlay],
) -> Result<PickSet, Box<dyn std::error::Error>> {
    let container: PickContainerV1 = serde_json::from_str(data)?;
    if container.schema != PICKS_SCHEMA_V1 {
        return Err(PickIoError::BadSchema {
            found: container.schema,
            expected: PICKS_SCHEMA_V1.to_string(),
        }
        .into());
    }

    // Validate everything before building any output.
    for (overlay_name, panels) in &container.cartesian {
        let overlay = overlays
            .iter()
            .find(|o| &o.name == overlay_name)
            .ok_or_else(|| PickIoError::UnknownOverlay(overlay_name.clone()))?;

        let expected_panels: Vec<String> = overlay.cached_data().keys().cloned().collect();
        let found_panels: Vec<String> = panels.keys().cloned().collect();
        if expected_panels != found_panels {
            return Err(PickIoError::PanelKeyMismatch {
                overlay: overlay_name.clone(),
                expected: expected_panels,
                found: found_panels,
            }
            .into());
        }

        for (panel, refl_map) in panels {
            let mut expected: Vec<String> = reflection_keys(overlay, panel);
            let mut found: Vec<String> = refl_map.keys().cloned().collect();
            expected.sort();
            found.sort();
            if expected != found {
                return Err(PickIoError::ReflectionKeyMismatch {
                    overlay: overlay_name.clone(),
                    panel: panel.clone(),
                    expected,
                    found,
                }
                .into());
            }
        }
    }

    let mut out = PickSet::default();
    for (overlay_name, panels) in &container.cartesian {
        let overlay = overlays
            .iter()
            .find(|o| &o.name == overlay_name)
            .expect("validated above");
        let mut op = OverlayPicks::default();
        for (panel, refl_map) in panels {
            let keys = reflection_keys(overlay, panel);
            let picks = if overlay.kind.is_powder() {
                PanelPicks::Powder(
                    keys.iter()
                        .map(|k| refl_map[k].clone())
                        .collect(),
                )
            } else {
                PanelPicks::Laue(
                    keys.iter()
                        .map(|k| refl_map[k].first().copied().unwrap_or(super::UNSET))
                        .collect(),
                )
            };
            op.panels.insert(panel.clone(), picks);
        }
        out.overlays.insert(overlay_name.clone(), op);
    }
    Ok(out)
}
