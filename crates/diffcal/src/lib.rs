//! diffcal — geometry calibration for multi-panel area-detector X-ray
//! diffraction instruments.
//!
//! The pipeline stages are:
//!
//! 1. **Instrument** – per-panel pose/pixel-grid/distortion model, beam and
//!    sample pose, pixel <-> lab <-> angular <-> stereographic transforms.
//! 2. **View** – unified image synthesis (polar, Cartesian virtual plane,
//!    stereographic) with panel stitching, SNIP background subtraction, and
//!    ordered mask application.
//! 3. **Overlay** – predicted diffraction features (powder rings, Laue
//!    spots, rotation-series spots, const-chi rings) in the active view's
//!    coordinates, regenerated lazily on dirty flags.
//! 4. **Picks** – the interactive pick-session state machine, manual and
//!    automatic correspondence collection, and validated pick-file
//!    round-tripping.
//! 5. **Refine** – nonlinear least-squares adjustment of instrument and
//!    crystal parameters against the picked correspondences.
//!
//! # Public API
//!
//! [`Session`] is the primary entry point: it owns the instrument,
//! materials, view settings, and overlays, and is passed explicitly to the
//! components that need it. Long-running work (view synthesis, auto
//! picking, refinement) goes through [`worker::WorkerPool`] with deep-copied
//! inputs and epoch-tagged results.

pub mod instrument;
pub mod material;
pub mod overlay;
pub mod picks;
pub mod refine;
pub mod session;
pub mod view;
pub mod worker;

pub use instrument::angles::EtaPeriod;
pub use instrument::{Beam, Instrument, InstrumentError, Panel, PanelShape, SamplePose};
pub use material::{CrystalParams, Lattice, Material};
pub use overlay::{Overlay, OverlayKind};
pub use picks::session::{PickMethod, PickSession, SessionState};
pub use picks::PickSet;
pub use refine::{refine, LmOptions, ParamSet, RefinableModel, RefineOutcome};
pub use session::Session;
pub use view::polar::{PolarConfig, PolarProcessing, PolarView};
pub use view::{MaskedImage, PanelImages, ViewError, ViewType};
pub use worker::{JobOutcome, JobToken, WorkerPool};
