//! Observed-feature picks and the interactive pick session.
//!
//! A [`PickSet`] stores, per overlay and panel, the observed positions
//! matched to predicted overlay features: an open polyline per powder
//! ring, a single (possibly unset) position per Laue spot. Positions are
//! stored canonically in panel-local Cartesian mm; angular conversions
//! happen at the display and export boundaries.

pub mod autopick;
pub mod io;
pub mod session;

use std::collections::BTreeMap;

use crate::instrument::angles::EtaPeriod;
use crate::instrument::Instrument;
use crate::overlay::Overlay;

/// Sentinel for an unset pick position.
pub const UNSET: [f64; 2] = [f64::NAN, f64::NAN];

/// True when a position is the unset sentinel.
pub fn is_unset(p: [f64; 2]) -> bool {
    p[0].is_nan() || p[1].is_nan()
}

/// Picks on one panel for one overlay.
#[derive(Debug, Clone, PartialEq)]
pub enum PanelPicks {
    /// One open polyline per powder ring.
    Powder(Vec<Vec<[f64; 2]>>),
    /// One position per Laue spot (unset = NaN pair).
    Laue(Vec<[f64; 2]>),
}

impl PanelPicks {
    /// Number of per-reflection entries.
    pub fn len(&self) -> usize {
        match self {
            Self::Powder(rings) => rings.len(),
            Self::Laue(spots) => spots.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Grow or shrink to exactly `n` entries, padding with empty/unset.
    pub fn pad_to(&mut self, n: usize) {
        match self {
            Self::Powder(rings) => rings.resize_with(n, Vec::new),
            Self::Laue(spots) => spots.resize(n, UNSET),
        }
    }

    /// Number of actually supplied (non-empty, non-unset) picks.
    pub fn n_set(&self) -> usize {
        match self {
            Self::Powder(rings) => rings.iter().map(|r| r.len()).sum(),
            Self::Laue(spots) => spots.iter().filter(|&&p| !is_unset(p)).count(),
        }
    }
}

/// All picks for one overlay, keyed by panel name.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct OverlayPicks {
    pub panels: BTreeMap<String, PanelPicks>,
}

impl OverlayPicks {
    pub fn n_set(&self) -> usize {
        self.panels.values().map(PanelPicks::n_set).sum()
    }
}

/// Picks for every active overlay, keyed by overlay name.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PickSet {
    pub overlays: BTreeMap<String, OverlayPicks>,
}

impl PickSet {
    /// Clear one overlay's picks entirely.
    pub fn reset_overlay(&mut self, overlay: &str) {
        self.overlays.remove(overlay);
    }

    /// Enforce the padding invariant against an overlay's current data:
    /// every panel present in the overlay data gets a pick list of exactly
    /// the overlay's reflection count, preserving existing entries.
    pub fn pad_picks(&mut self, overlay: &Overlay) {
        let counts = overlay.reflection_counts();
        let is_powder = overlay.kind.is_powder();
        let entry = self.overlays.entry(overlay.name.clone()).or_default();

        // Drop panels that vanished from the overlay data.
        entry.panels.retain(|panel, _| counts.contains_key(panel));

        for (panel, &n) in &counts {
            let picks = entry.panels.entry(panel.clone()).or_insert_with(|| {
                if is_powder {
                    PanelPicks::Powder(Vec::new())
                } else {
                    PanelPicks::Laue(Vec::new())
                }
            });
            picks.pad_to(n);
        }
    }

    pub fn overlay(&self, name: &str) -> Option<&OverlayPicks> {
        self.overlays.get(name)
    }

    pub fn overlay_mut(&mut self, name: &str) -> Option<&mut OverlayPicks> {
        self.overlays.get_mut(name)
    }

    /// Total supplied picks across all overlays.
    pub fn n_set(&self) -> usize {
        self.overlays.values().map(OverlayPicks::n_set).sum()
    }
}

/// Convert a panel-Cartesian pick to (two-theta, eta) degrees.
pub fn cart_pick_to_angles(
    cart: [f64; 2],
    panel_name: &str,
    instrument: &Instrument,
    period: EtaPeriod,
) -> [f64; 2] {
    let Ok(panel) = instrument.panel(panel_name) else {
        return UNSET;
    };
    let ideal = match &panel.distortion {
        Some(d) => d.apply(cart),
        None => cart,
    };
    let (tth, eta) = panel.cart_to_angles(
        ideal,
        &instrument.beam.frame(),
        &instrument.sample,
        period,
    );
    [tth.to_degrees(), eta.to_degrees()]
}

/// Convert a (two-theta, eta) degrees pick to panel-Cartesian mm.
pub fn angles_pick_to_cart(
    angles: [f64; 2],
    panel_name: &str,
    instrument: &Instrument,
) -> [f64; 2] {
    let Ok(panel) = instrument.panel(panel_name) else {
        return UNSET;
    };
    let mut xy = panel.angles_to_cart(
        angles[0].to_radians(),
        angles[1].to_radians(),
        &instrument.beam.frame(),
        &instrument.sample,
    );
    if let Some(d) = &panel.distortion {
        xy = d.apply_inverse(xy);
    }
    xy
}
