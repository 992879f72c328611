//! Interactive pick-session state machine.
//!
//! Orchestrates, per overlay, the collection of correspondences between
//! predicted features and observed positions:
//!
//! ```text
//! Idle -> SelectMethod -> {ManualPick | AutoPickPending | LoadPending |
//!         ReuseExisting} -> ReviewPicks -> {Accepted -> next overlay |
//!         Rejected -> SelectMethod} -> ... -> AllOverlaysDone
//! ```
//!
//! The session owns the pick set and the per-overlay target order; the UI
//! boundary delivers plain events (method choice, picked point, undo,
//! accept/reject). Every event is validated against the current state.
//! Async steps (auto picking) are keyed by worker epoch tokens; results
//! arriving after the session moved on are ignored, and failures return the
//! machine to `SelectMethod` rather than leaving it stuck.

use crate::instrument::Instrument;
use crate::overlay::Overlay;
use crate::worker::JobToken;

use super::{angles_pick_to_cart, is_unset, OverlayPicks, PanelPicks, PickSet, UNSET};

/// How picks are collected for the current overlay.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PickMethod {
    Manual,
    Auto,
    Load,
    ReuseExisting,
}

/// One pickable target: a ring segment on a panel, or a Laue spot.
#[derive(Debug, Clone, PartialEq)]
pub struct PickTarget {
    pub panel: String,
    /// Index into the overlay's local reflection list for that panel.
    pub reflection: usize,
    /// Miller indices of the target reflection.
    pub hkl: [i32; 3],
}

/// Session states.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionState {
    Idle,
    SelectMethod { overlay_idx: usize },
    ManualPick { overlay_idx: usize, target_idx: usize },
    AutoPickPending { overlay_idx: usize, token: JobToken },
    LoadPending { overlay_idx: usize },
    ReviewPicks { overlay_idx: usize },
    AllOverlaysDone,
}

/// Invalid event/state combinations and setup failures.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionError {
    InvalidTransition { event: &'static str, state: String },
    NoOverlays,
    NoExistingPicks(String),
    StaleToken,
}

impl std::fmt::Display for SessionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidTransition { event, state } => {
                write!(f, "event '{}' is not valid in state {}", event, state)
            }
            Self::NoOverlays => write!(f, "no visible overlays to pick"),
            Self::NoExistingPicks(name) => {
                write!(f, "overlay '{}' has no existing picks to reuse", name)
            }
            Self::StaleToken => write!(f, "worker result belongs to an abandoned step"),
        }
    }
}

impl std::error::Error for SessionError {}

/// Pick-relevant snapshot of one overlay.
#[derive(Debug, Clone)]
struct OverlayPlan {
    name: String,
    is_powder: bool,
    targets: Vec<PickTarget>,
}

/// The pick-session state machine.
#[derive(Debug)]
pub struct PickSession {
    state: SessionState,
    plans: Vec<OverlayPlan>,
    picks: PickSet,
}

impl PickSession {
    pub fn new() -> Self {
        Self {
            state: SessionState::Idle,
            plans: Vec::new(),
            picks: PickSet::default(),
        }
    }

    pub fn state(&self) -> &SessionState {
        &self.state
    }

    pub fn picks(&self) -> &PickSet {
        &self.picks
    }

    pub fn picks_mut(&mut self) -> &mut PickSet {
        &mut self.picks
    }

    /// Take the finished pick set (refinement consumes it).
    pub fn take_picks(&mut self) -> PickSet {
        std::mem::take(&mut self.picks)
    }

    /// Begin a session over the given overlays (their data must be current,
    /// generated in the polar frame so target ordering can use angles).
    ///
    /// Targets iterate powder reflections by ascending minimum ring
    /// two-theta, panels within a reflection by ascending minimum eta; Laue
    /// spots iterate panels in name order, then spot index.
    pub fn begin(&mut self, overlays: &[&Overlay]) -> Result<(), SessionError> {
        if !matches!(self.state, SessionState::Idle | SessionState::AllOverlaysDone) {
            return Err(self.invalid("begin"));
        }
        if overlays.is_empty() {
            return Err(SessionError::NoOverlays);
        }
        self.plans = overlays.iter().map(|o| plan_overlay(o)).collect();
        self.picks = PickSet::default();
        for overlay in overlays {
            self.picks.pad_picks(overlay);
        }
        self.state = SessionState::SelectMethod { overlay_idx: 0 };
        tracing::info!(n_overlays = overlays.len(), "pick session started");
        Ok(())
    }

    /// Name of the overlay currently being picked.
    pub fn active_overlay(&self) -> Option<&str> {
        let idx = match self.state {
            SessionState::SelectMethod { overlay_idx }
            | SessionState::ManualPick { overlay_idx, .. }
            | SessionState::AutoPickPending { overlay_idx, .. }
            | SessionState::LoadPending { overlay_idx }
            | SessionState::ReviewPicks { overlay_idx } => overlay_idx,
            _ => return None,
        };
        self.plans.get(idx).map(|p| p.name.as_str())
    }

    /// The manual-pick target currently highlighted.
    pub fn current_target(&self) -> Option<&PickTarget> {
        let SessionState::ManualPick {
            overlay_idx,
            target_idx,
        } = self.state
        else {
            return None;
        };
        self.plans[overlay_idx].targets.get(target_idx)
    }

    /// Choose the collection method for the active overlay.
    ///
    /// `Auto` and `Load` move to pending states: the caller launches the
    /// worker / file import and reports back via [`Self::auto_pick_finished`]
    /// or [`Self::load_finished`]. The token for `Auto` is supplied by the
    /// caller from its worker pool.
    pub fn choose_method(
        &mut self,
        method: PickMethod,
        auto_token: Option<JobToken>,
    ) -> Result<(), SessionError> {
        let SessionState::SelectMethod { overlay_idx } = self.state else {
            return Err(self.invalid("choose_method"));
        };
        match method {
            PickMethod::Manual => {
                // Manual picking restarts this overlay's picks from scratch.
                let name = self.plans[overlay_idx].name.clone();
                self.picks.reset_overlay(&name);
                self.pad_plan(overlay_idx);
                self.state = SessionState::ManualPick {
                    overlay_idx,
                    target_idx: 0,
                };
            }
            PickMethod::Auto => {
                let token = auto_token.ok_or_else(|| self.invalid("choose_method(auto)"))?;
                let name = self.plans[overlay_idx].name.clone();
                self.picks.reset_overlay(&name);
                self.pad_plan(overlay_idx);
                self.state = SessionState::AutoPickPending { overlay_idx, token };
            }
            PickMethod::Load => {
                self.state = SessionState::LoadPending { overlay_idx };
            }
            PickMethod::ReuseExisting => {
                let plan = &self.plans[overlay_idx];
                let has_picks = self
                    .picks
                    .overlay(&plan.name)
                    .map(|op| op.n_set() > 0)
                    .unwrap_or(false);
                if !has_picks {
                    return Err(SessionError::NoExistingPicks(plan.name.clone()));
                }
                self.state = SessionState::ReviewPicks { overlay_idx };
            }
        }
        Ok(())
    }

    /// Manual pick: a point in polar view coordinates (two-theta, eta in
    /// degrees). Powder targets accumulate an open polyline; Laue targets
    /// take a single position and advance to the next target.
    pub fn point_picked(
        &mut self,
        tth_eta_deg: [f64; 2],
        instrument: &Instrument,
    ) -> Result<(), SessionError> {
        let SessionState::ManualPick {
            overlay_idx,
            target_idx,
        } = self.state
        else {
            return Err(self.invalid("point_picked"));
        };
        let plan = &self.plans[overlay_idx];
        let Some(target) = plan.targets.get(target_idx) else {
            return Err(self.invalid("point_picked"));
        };
        let cart = angles_pick_to_cart(tth_eta_deg, &target.panel, instrument);
        let is_powder = plan.is_powder;
        let name = plan.name.clone();
        let panel = target.panel.clone();
        let reflection = target.reflection;

        let entry = self
            .picks
            .overlay_mut(&name)
            .and_then(|op| op.panels.get_mut(&panel))
            .expect("picks padded at begin");
        match entry {
            PanelPicks::Powder(rings) => {
                rings[reflection].push(cart);
            }
            PanelPicks::Laue(spots) => {
                spots[reflection] = cart;
            }
        }
        if !is_powder {
            self.advance_target();
        }
        Ok(())
    }

    /// Manual pick: finish the open polyline for the current powder target
    /// and move to the next one (Laue targets advance on pick instead).
    pub fn complete_polyline(&mut self) -> Result<(), SessionError> {
        let SessionState::ManualPick { .. } = self.state else {
            return Err(self.invalid("complete_polyline"));
        };
        self.advance_target();
        Ok(())
    }

    /// Manual pick: remove the most recent point; steps back one target
    /// when the current one is empty (powder) or always (Laue).
    pub fn undo_last_point(&mut self) -> Result<(), SessionError> {
        let SessionState::ManualPick {
            overlay_idx,
            mut target_idx,
        } = self.state
        else {
            return Err(self.invalid("undo_last_point"));
        };
        let plan = &self.plans[overlay_idx];
        if plan.is_powder {
            // If the current ring has no points, step back one target first.
            let empty = self
                .target_points_len(overlay_idx, target_idx)
                .map(|n| n == 0)
                .unwrap_or(true);
            if empty {
                if target_idx == 0 {
                    return Ok(());
                }
                target_idx -= 1;
                self.state = SessionState::ManualPick {
                    overlay_idx,
                    target_idx,
                };
            }
            let plan = &self.plans[overlay_idx];
            let target = &plan.targets[target_idx];
            let name = plan.name.clone();
            let panel = target.panel.clone();
            let reflection = target.reflection;
            if let Some(PanelPicks::Powder(rings)) = self
                .picks
                .overlay_mut(&name)
                .and_then(|op| op.panels.get_mut(&panel))
            {
                rings[reflection].pop();
            }
        } else {
            if target_idx == 0 {
                return Ok(());
            }
            target_idx -= 1;
            self.state = SessionState::ManualPick {
                overlay_idx,
                target_idx,
            };
            let plan = &self.plans[overlay_idx];
            let target = &plan.targets[target_idx];
            let name = plan.name.clone();
            let panel = target.panel.clone();
            let reflection = target.reflection;
            if let Some(PanelPicks::Laue(spots)) = self
                .picks
                .overlay_mut(&name)
                .and_then(|op| op.panels.get_mut(&panel))
            {
                spots[reflection] = UNSET;
            }
        }
        Ok(())
    }

    /// Worker completion for an auto-pick step. A stale token is ignored;
    /// a failure restores `SelectMethod` for the same overlay.
    pub fn auto_pick_finished(
        &mut self,
        token: JobToken,
        outcome: Result<OverlayPicks, String>,
    ) -> Result<(), SessionError> {
        let SessionState::AutoPickPending {
            overlay_idx,
            token: expected,
        } = self.state
        else {
            return Err(self.invalid("auto_pick_finished"));
        };
        if token != expected {
            // Result of an abandoned step; drop it on the floor.
            tracing::debug!("ignoring stale auto-pick result");
            return Ok(());
        }
        match outcome {
            Ok(op) => {
                let name = self.plans[overlay_idx].name.clone();
                self.picks.overlays.insert(name, op);
                self.pad_plan(overlay_idx);
                self.state = SessionState::ReviewPicks { overlay_idx };
            }
            Err(msg) => {
                tracing::warn!(error = %msg, "auto pick failed");
                self.state = SessionState::SelectMethod { overlay_idx };
            }
        }
        Ok(())
    }

    /// Result of a pick-file import for the active overlay.
    pub fn load_finished(
        &mut self,
        outcome: Result<OverlayPicks, String>,
    ) -> Result<(), SessionError> {
        let SessionState::LoadPending { overlay_idx } = self.state else {
            return Err(self.invalid("load_finished"));
        };
        match outcome {
            Ok(op) => {
                let name = self.plans[overlay_idx].name.clone();
                self.picks.overlays.insert(name, op);
                self.pad_plan(overlay_idx);
                self.state = SessionState::ReviewPicks { overlay_idx };
            }
            Err(msg) => {
                tracing::warn!(error = %msg, "pick import failed");
                self.state = SessionState::SelectMethod { overlay_idx };
            }
        }
        Ok(())
    }

    /// Abandon a pending async step (view/overlay switch); the worker's
    /// eventual result will carry a stale token.
    pub fn abandon_pending(&mut self) -> Result<(), SessionError> {
        let overlay_idx = match self.state {
            SessionState::AutoPickPending { overlay_idx, .. }
            | SessionState::LoadPending { overlay_idx } => overlay_idx,
            _ => return Err(self.invalid("abandon_pending")),
        };
        self.state = SessionState::SelectMethod { overlay_idx };
        Ok(())
    }

    /// Manual picking completed (every target visited) or dismissed:
    /// move to review.
    pub fn finish_manual(&mut self) -> Result<(), SessionError> {
        let SessionState::ManualPick { overlay_idx, .. } = self.state else {
            return Err(self.invalid("finish_manual"));
        };
        self.state = SessionState::ReviewPicks { overlay_idx };
        Ok(())
    }

    /// Accept or reject the reviewed picks. Accepting advances to the next
    /// overlay (or finishes); rejecting returns to method selection for the
    /// same overlay, leaving already-accepted overlays' picks intact.
    pub fn review_decision(&mut self, accepted: bool) -> Result<(), SessionError> {
        let SessionState::ReviewPicks { overlay_idx } = self.state else {
            return Err(self.invalid("review_decision"));
        };
        if !accepted {
            self.state = SessionState::SelectMethod { overlay_idx };
            return Ok(());
        }
        let next = overlay_idx + 1;
        if next >= self.plans.len() {
            self.state = SessionState::AllOverlaysDone;
            tracing::info!(n_picks = self.picks.n_set(), "pick session complete");
        } else {
            self.state = SessionState::SelectMethod { overlay_idx: next };
        }
        Ok(())
    }

    fn advance_target(&mut self) {
        let SessionState::ManualPick {
            overlay_idx,
            target_idx,
        } = self.state
        else {
            return;
        };
        let next = target_idx + 1;
        if next >= self.plans[overlay_idx].targets.len() {
            self.state = SessionState::ReviewPicks { overlay_idx };
        } else {
            self.state = SessionState::ManualPick {
                overlay_idx,
                target_idx: next,
            };
        }
    }

    fn target_points_len(&self, overlay_idx: usize, target_idx: usize) -> Option<usize> {
        let plan = &self.plans[overlay_idx];
        let target = plan.targets.get(target_idx)?;
        match self.picks.overlay(&plan.name)?.panels.get(&target.panel)? {
            PanelPicks::Powder(rings) => rings.get(target.reflection).map(Vec::len),
            PanelPicks::Laue(spots) => spots
                .get(target.reflection)
                .map(|&p| if is_unset(p) { 0 } else { 1 }),
        }
    }

    /// Re-pad one overlay's picks against its plan.
    fn pad_plan(&mut self, overlay_idx: usize) {
        let plan = &self.plans[overlay_idx];
        let mut counts: std::collections::BTreeMap<String, usize> = Default::default();
        for t in &plan.targets {
            let c = counts.entry(t.panel.clone()).or_insert(0);
            *c = (*c).max(t.reflection + 1);
        }
        let is_powder = plan.is_powder;
        let entry = self.picks.overlays.entry(plan.name.clone()).or_default();
        for (panel, n) in counts {
            let picks = entry.panels.entry(panel).or_insert_with(|| {
                if is_powder {
                    PanelPicks::Powder(Vec::new())
                } else {
                    PanelPicks::Laue(Vec::new())
                }
            });
            if picks.len() < n {
                picks.pad_to(n);
            }
        }
    }

    fn invalid(&self, event: &'static str) -> SessionError {
        SessionError::InvalidTransition {
            event,
            state: format!("{:?}", self.state),
        }
    }
}

impl Default for PickSession {
    fn default() -> Self {
        Self::new()
    }
}

/// Build the target iteration order for one overlay from its (polar-frame)
/// data.
fn plan_overlay(overlay: &Overlay) -> OverlayPlan {
    let data = overlay.cached_data();
    let is_powder = overlay.kind.is_powder();
    let mut targets = Vec::new();

    if is_powder {
        // Reflections ordered by minimum ring two-theta across panels,
        // panels within a reflection by minimum eta.
        #[derive(Debug)]
        struct RingRef {
            hkl: [i32; 3],
            min_tth: f64,
            panels: Vec<(String, usize, f64)>,
        }
        let mut rings: Vec<RingRef> = Vec::new();
        for (panel, pd) in data {
            for (local, ring) in pd.rings.iter().enumerate() {
                let hkl = pd.hkls[local];
                let min_tth = ring
                    .iter()
                    .map(|p| p[0])
                    .fold(f64::INFINITY, f64::min);
                let min_eta = ring
                    .iter()
                    .map(|p| p[1])
                    .fold(f64::INFINITY, f64::min);
                match rings.iter_mut().find(|r| r.hkl == hkl) {
                    Some(r) => {
                        r.min_tth = r.min_tth.min(min_tth);
                        r.panels.push((panel.clone(), local, min_eta));
                    }
                    None => rings.push(RingRef {
                        hkl,
                        min_tth,
                        panels: vec![(panel.clone(), local, min_eta)],
                    }),
                }
            }
        }
        rings.sort_by(|a, b| a.min_tth.total_cmp(&b.min_tth));
        for ring in &mut rings {
            ring.panels
                .sort_by(|a, b| a.2.total_cmp(&b.2));
            for (panel, local, _) in &ring.panels {
                targets.push(PickTarget {
                    panel: panel.clone(),
                    reflection: *local,
                    hkl: ring.hkl,
                });
            }
        }
    } else {
        for (panel, pd) in data {
            for (local, _) in pd.spots.iter().enumerate() {
                targets.push(PickTarget {
                    panel: panel.clone(),
                    reflection: local,
                    hkl: pd.hkls.get(local).copied().unwrap_or([0, 0, 0]),
                });
            }
        }
    }

    OverlayPlan {
        name: overlay.name.clone(),
        is_powder,
        targets,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instrument::angles::EtaPeriod;
    use crate::instrument::{Beam, Panel, SamplePose};
    use crate::material::{CrystalParams, Lattice, Material};
    use crate::overlay::{
        LaueParams, OverlayContext, OverlayKind, PowderParams, RangeShape, ViewFrame,
    };
    use crate::view::polar::PolarConfig;
    use nalgebra::Vector3;

    fn instrument() -> Instrument {
        let mut instr = Instrument::new(Beam::default(), SamplePose::default());
        instr
            .add_panel(
                "d0",
                Panel::planar(
                    1200,
                    1200,
                    (0.4, 0.4),
                    Vector3::new(0.0, 0.0, -800.0),
                    Vector3::zeros(),
                ),
            )
            .unwrap();
        instr
    }

    fn powder_overlay(instr: &Instrument) -> Overlay {
        let material = Material::new(
            "CeO2",
            Lattice::cubic(5.41153),
            vec![[1, 1, 1], [2, 0, 0]],
        );
        let cfg = PolarConfig::default();
        let ctx = OverlayContext {
            instrument: instr,
            material: &material,
            frame: ViewFrame::Polar(&cfg),
            eta_period: EtaPeriod::default(),
        };
        let mut overlay = Overlay::new(
            "CeO2 powder",
            "CeO2",
            OverlayKind::Powder(PowderParams::default()),
        );
        overlay.data(&ctx).unwrap();
        overlay
    }

    fn laue_overlay(instr: &Instrument) -> Overlay {
        let mut planes = Vec::new();
        for h in -2i32..=2 {
            for k in -2i32..=2 {
                for l in -2i32..=2 {
                    if (h, k, l) != (0, 0, 0) {
                        planes.push([h, k, l]);
                    }
                }
            }
        }
        let material = Material::new("Ni", Lattice::cubic(3.5238), planes);
        let cfg = PolarConfig::default();
        let ctx = OverlayContext {
            instrument: instr,
            material: &material,
            frame: ViewFrame::Polar(&cfg),
            eta_period: EtaPeriod::default(),
        };
        let mut overlay = Overlay::new(
            "Ni laue",
            "Ni",
            OverlayKind::Laue(LaueParams {
                crystal: CrystalParams {
                    orientation: [0.2, -0.1, 0.3],
                    ..Default::default()
                },
                min_energy_kev: 40.0,
                max_energy_kev: 90.0,
                tth_width: None,
                eta_width: None,
                range_shape: RangeShape::Rectangle,
            }),
        );
        overlay.data(&ctx).unwrap();
        overlay
    }

    #[test]
    fn manual_powder_flow_reaches_done() {
        let instr = instrument();
        let overlay = powder_overlay(&instr);
        let mut session = PickSession::new();
        session.begin(&[&overlay]).unwrap();
        assert!(matches!(session.state(), SessionState::SelectMethod { .. }));

        session.choose_method(PickMethod::Manual, None).unwrap();
        let n_targets = {
            let mut n = 0;
            while session.current_target().is_some() {
                session.point_picked([3.5, 10.0], &instr).unwrap();
                session.point_picked([3.5, 20.0], &instr).unwrap();
                session.complete_polyline().unwrap();
                n += 1;
            }
            n
        };
        assert!(n_targets >= 2);
        assert!(matches!(session.state(), SessionState::ReviewPicks { .. }));
        session.review_decision(true).unwrap();
        assert!(matches!(session.state(), SessionState::AllOverlaysDone));
        assert_eq!(session.picks().n_set(), 2 * n_targets);
    }

    #[test]
    fn powder_targets_order_by_tth() {
        let instr = instrument();
        let overlay = powder_overlay(&instr);
        let mut session = PickSession::new();
        session.begin(&[&overlay]).unwrap();
        session.choose_method(PickMethod::Manual, None).unwrap();
        // First target must be the lowest-tth ring: (1 1 1).
        let target = session.current_target().unwrap();
        assert_eq!(target.hkl, [1, 1, 1]);
    }

    #[test]
    fn laue_pick_advances_and_undo_steps_back() {
        let instr = instrument();
        let overlay = laue_overlay(&instr);
        if overlay.cached_data()["d0"].spots.len() < 2 {
            // Geometry produced too few spots for this scenario.
            return;
        }
        let mut session = PickSession::new();
        session.begin(&[&overlay]).unwrap();
        session.choose_method(PickMethod::Manual, None).unwrap();

        session.point_picked([4.0, 30.0], &instr).unwrap();
        let SessionState::ManualPick { target_idx, .. } = *session.state() else {
            panic!("still picking");
        };
        assert_eq!(target_idx, 1);

        session.undo_last_point().unwrap();
        let SessionState::ManualPick { target_idx, .. } = *session.state() else {
            panic!("still picking");
        };
        assert_eq!(target_idx, 0);
        // The undone spot is unset again.
        assert_eq!(session.picks().n_set(), 0);
    }

    #[test]
    fn reject_returns_to_select_without_clearing_other_overlays() {
        let instr = instrument();
        let o1 = powder_overlay(&instr);
        let mut o2 = powder_overlay(&instr);
        o2.name = "CeO2 powder 2".into();
        let mut session = PickSession::new();
        session.begin(&[&o1, &o2]).unwrap();

        // Accept overlay 1 with one pick.
        session.choose_method(PickMethod::Manual, None).unwrap();
        session.point_picked([3.5, 0.0], &instr).unwrap();
        session.finish_manual().unwrap();
        session.review_decision(true).unwrap();
        let n_after_first = session.picks().n_set();
        assert_eq!(n_after_first, 1);

        // Reject overlay 2's review: back to SelectMethod, first overlay
        // picks untouched.
        session.choose_method(PickMethod::Manual, None).unwrap();
        session.point_picked([3.5, 5.0], &instr).unwrap();
        session.finish_manual().unwrap();
        session.review_decision(false).unwrap();
        assert!(matches!(
            session.state(),
            SessionState::SelectMethod { overlay_idx: 1 }
        ));
        assert!(session.picks().overlay("CeO2 powder").unwrap().n_set() >= 1);
    }

    #[test]
    fn stale_auto_token_is_ignored() {
        let instr = instrument();
        let overlay = powder_overlay(&instr);
        let mut session = PickSession::new();
        session.begin(&[&overlay]).unwrap();
        session
            .choose_method(PickMethod::Auto, Some(JobToken { epoch: 3 }))
            .unwrap();

        let stale = JobToken { epoch: 2 };
        session
            .auto_pick_finished(stale, Ok(OverlayPicks::default()))
            .unwrap();
        // Still pending: the stale result changed nothing.
        assert!(matches!(session.state(), SessionState::AutoPickPending { .. }));

        // Failure of the real job returns to SelectMethod.
        session
            .auto_pick_finished(JobToken { epoch: 3 }, Err("no peaks".into()))
            .unwrap();
        assert!(matches!(session.state(), SessionState::SelectMethod { .. }));
    }

    #[test]
    fn auto_pick_via_worker_pool_roundtrip() {
        use crate::worker::{JobOutcome, WorkerPool};

        let instr = instrument();
        let overlay = powder_overlay(&instr);
        let mut session = PickSession::new();
        session.begin(&[&overlay]).unwrap();

        // The worker receives deep copies, never live references.
        let mut pool = WorkerPool::<OverlayPicks>::new(2);
        let n_rings = overlay.cached_data()["d0"].rings.len();
        let token = pool.submit(move || {
            let mut op = OverlayPicks::default();
            let mut rings = vec![Vec::new(); n_rings];
            rings[0].push([10.0, 5.0]);
            op.panels.insert("d0".to_string(), PanelPicks::Powder(rings));
            Ok(op)
        });
        session.choose_method(PickMethod::Auto, Some(token)).unwrap();

        let result = pool.wait_for(token).expect("worker result");
        let outcome = match result.outcome {
            JobOutcome::Completed(op) => Ok(op),
            JobOutcome::Failed(msg) => Err(msg),
        };
        session.auto_pick_finished(result.token, outcome).unwrap();
        assert!(matches!(session.state(), SessionState::ReviewPicks { .. }));
        assert_eq!(session.picks().n_set(), 1);

        session.review_decision(true).unwrap();
        assert!(matches!(session.state(), SessionState::AllOverlaysDone));
    }

    #[test]
    fn reuse_requires_existing_picks() {
        let instr = instrument();
        let overlay = powder_overlay(&instr);
        let mut session = PickSession::new();
        session.begin(&[&overlay]).unwrap();
        let err = session
            .choose_method(PickMethod::ReuseExisting, None)
            .unwrap_err();
        assert!(matches!(err, SessionError::NoExistingPicks(_)));
    }

    #[test]
    fn events_outside_their_state_are_rejected() {
        let instr = instrument();
        let overlay = powder_overlay(&instr);
        let mut session = PickSession::new();
        assert!(session.point_picked([1.0, 2.0], &instr).is_err());
        assert!(session.review_decision(true).is_err());
        session.begin(&[&overlay]).unwrap();
        assert!(session.complete_polyline().is_err());
        assert!(session
            .auto_pick_finished(JobToken { epoch: 0 }, Err("x".into()))
            .is_err());
    }
}
