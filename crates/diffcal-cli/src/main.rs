//! diffcal CLI — view synthesis and pick-based calibration from the shell.

use clap::{Args, Parser, Subcommand};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use nalgebra::DMatrix;

use diffcal::overlay::{Overlay, OverlayKind, PowderParams};
use diffcal::picks::io::import_picks;
use diffcal::refine::{build_correspondences, refine, LmOptions, ParamId, ParamSet};
use diffcal::view::{log_scale_img, sqrt_scale_img};
use diffcal::{Instrument, Material, PanelImages, Session, ViewType};

type CliError = Box<dyn std::error::Error>;
type CliResult<T> = Result<T, CliError>;

#[derive(Parser)]
#[command(name = "diffcal")]
#[command(about = "Calibrate multi-panel X-ray diffraction instrument geometry from images")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Synthesize the unified polar view from per-panel images.
    Polar(PolarArgs),

    /// Simulate powder overlay geometry for a material.
    Simulate(SimulateArgs),

    /// Refine instrument geometry against an exported pick file.
    Calibrate(CalibrateArgs),

    /// Print an instrument summary.
    InstrumentInfo {
        /// Path to the instrument JSON.
        #[arg(long)]
        instrument: PathBuf,
    },
}

#[derive(Debug, Clone, Args)]
struct PolarArgs {
    /// Path to the instrument JSON.
    #[arg(long)]
    instrument: PathBuf,

    /// Per-panel image as `panel=path` (repeatable; 8/16-bit gray).
    #[arg(long = "image")]
    images: Vec<String>,

    /// Path to write the polar view (PNG).
    #[arg(long)]
    out: PathBuf,

    /// Two-theta range in degrees, as `min:max`.
    #[arg(long, default_value = "1:20")]
    tth_range: String,

    /// Polar pixel size along two-theta, degrees.
    #[arg(long, default_value = "0.01")]
    tth_pixel_size: f64,

    /// Polar pixel size along eta, degrees.
    #[arg(long, default_value = "0.25")]
    eta_pixel_size: f64,

    /// Apply SNIP background subtraction.
    #[arg(long)]
    snip: bool,

    /// SNIP estimator width, degrees two-theta.
    #[arg(long, default_value = "1.0")]
    snip_width: f64,

    /// SNIP iteration count.
    #[arg(long, default_value = "2")]
    snip_numiter: usize,

    /// Display scaling: linear, sqrt, or log.
    #[arg(long, default_value = "linear")]
    scale: String,
}

#[derive(Debug, Clone, Args)]
struct SimulateArgs {
    /// Path to the instrument JSON.
    #[arg(long)]
    instrument: PathBuf,

    /// Path to the material JSON.
    #[arg(long)]
    material: PathBuf,

    /// Path to write the overlay data (JSON).
    #[arg(long)]
    out: PathBuf,

    /// Eta samples around each ring.
    #[arg(long, default_value = "360")]
    eta_steps: usize,
}

#[derive(Debug, Clone, Args)]
struct CalibrateArgs {
    /// Path to the instrument JSON.
    #[arg(long)]
    instrument: PathBuf,

    /// Path to the material JSON.
    #[arg(long)]
    material: PathBuf,

    /// Path to the exported pick file.
    #[arg(long)]
    picks: PathBuf,

    /// Overlay name the pick file was exported under (defaults to
    /// "<material> powder").
    #[arg(long)]
    overlay_name: Option<String>,

    /// Path to write the refined instrument JSON.
    #[arg(long)]
    out: PathBuf,

    /// Also refine panel tilts (translations always refine).
    #[arg(long)]
    refine_tilt: bool,

    /// Maximum solver iterations.
    #[arg(long, default_value = "50")]
    max_iters: usize,
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let result = match cli.command {
        Commands::Polar(args) => cmd_polar(args),
        Commands::Simulate(args) => cmd_simulate(args),
        Commands::Calibrate(args) => cmd_calibrate(args),
        Commands::InstrumentInfo { instrument } => cmd_instrument_info(&instrument),
    };
    if let Err(err) = result {
        eprintln!("error: {}", err);
        std::process::exit(1);
    }
}

/// Load an 8/16-bit grayscale image into a float matrix.
fn load_panel_image(path: &Path) -> CliResult<DMatrix<f64>> {
    let img = image::open(path)?.into_luma16();
    let (w, h) = img.dimensions();
    let mut out = DMatrix::zeros(h as usize, w as usize);
    for (x, y, pixel) in img.enumerate_pixels() {
        out[(y as usize, x as usize)] = pixel.0[0] as f64;
    }
    Ok(out)
}

fn parse_panel_images(specs: &[String]) -> CliResult<PanelImages> {
    let mut images = PanelImages::new();
    for spec in specs {
        let (panel, path) = spec
            .split_once('=')
            .ok_or_else(|| format!("--image expects panel=path, got '{}'", spec))?;
        images.insert(panel.to_string(), load_panel_image(Path::new(path))?);
    }
    Ok(images)
}

fn cmd_polar(args: PolarArgs) -> CliResult<()> {
    let instrument = Instrument::from_json_file(&args.instrument)?;
    let images = parse_panel_images(&args.images)?;

    let (tth_min, tth_max) = args
        .tth_range
        .split_once(':')
        .and_then(|(a, b)| Some((a.parse::<f64>().ok()?, b.parse::<f64>().ok()?)))
        .ok_or("--tth-range expects min:max in degrees")?;

    let mut session = Session::new(instrument);
    session.polar.tth_min_deg = tth_min;
    session.polar.tth_max_deg = tth_max;
    session.polar.tth_pixel_size_deg = args.tth_pixel_size;
    session.polar.eta_pixel_size_deg = args.eta_pixel_size;
    session.polar_processing.apply_snip = args.snip;
    session.polar_processing.snip_width_deg = args.snip_width;
    session.polar_processing.snip_numiter = args.snip_numiter;

    session.synthesize_polar(&images)?;
    let view = session.polar_view().expect("just synthesized");
    let img = view.display_image().ok_or("polar view not generated")?;

    let data = match args.scale.as_str() {
        "linear" => img.filled(0.0),
        "sqrt" => sqrt_scale_img(&img.filled(0.0)),
        "log" => log_scale_img(&img.filled(0.0)),
        other => return Err(format!("unknown scale '{}'", other).into()),
    };
    write_gray_png(&args.out, &data, &img.valid)?;
    tracing::info!(
        out = %args.out.display(),
        valid = img.n_valid(),
        "polar view written"
    );
    Ok(())
}

fn write_gray_png(
    path: &Path,
    data: &DMatrix<f64>,
    valid: &DMatrix<bool>,
) -> CliResult<()> {
    let (lo, hi) = data
        .iter()
        .zip(valid.iter())
        .filter(|(_, &v)| v)
        .map(|(d, _)| *d)
        .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), v| {
            (lo.min(v), hi.max(v))
        });
    let span = if hi > lo { hi - lo } else { 1.0 };

    let mut img = image::GrayImage::new(data.ncols() as u32, data.nrows() as u32);
    for (x, y, pixel) in img.enumerate_pixels_mut() {
        let (r, c) = (y as usize, x as usize);
        let v = if valid[(r, c)] {
            (((data[(r, c)] - lo) / span) * 255.0).clamp(0.0, 255.0) as u8
        } else {
            0
        };
        pixel.0 = [v];
    }
    img.save(path)?;
    Ok(())
}

fn cmd_simulate(args: SimulateArgs) -> CliResult<()> {
    let instrument = Instrument::from_json_file(&args.instrument)?;
    let material = Material::from_json_file(&args.material)?;
    let material_name = material.name.clone();

    let mut session = Session::new(instrument);
    session.add_material(material);
    session.set_view_type(ViewType::Polar);
    session.add_overlay(Overlay::new(
        format!("{} powder", material_name),
        material_name,
        OverlayKind::Powder(PowderParams {
            eta_steps: args.eta_steps,
            ..Default::default()
        }),
    ));
    let data = session.overlay_data(0)?;

    // Serialize per-panel rings as plain (tth, eta) polylines.
    let mut doc = BTreeMap::new();
    for (panel, pd) in data {
        let rings: Vec<_> = pd
            .hkls
            .iter()
            .zip(&pd.rings)
            .map(|(hkl, ring)| {
                serde_json::json!({
                    "hkl": hkl,
                    "points": ring,
                })
            })
            .collect();
        doc.insert(panel.clone(), rings);
    }
    std::fs::write(&args.out, serde_json::to_string_pretty(&doc)?)?;
    tracing::info!(out = %args.out.display(), "overlay data written");
    Ok(())
}

fn cmd_calibrate(args: CalibrateArgs) -> CliResult<()> {
    let instrument = Instrument::from_json_file(&args.instrument)?;
    let material = Material::from_json_file(&args.material)?;
    let material_name = material.name.clone();
    let overlay_name = args
        .overlay_name
        .clone()
        .unwrap_or_else(|| format!("{} powder", material_name));

    let mut session = Session::new(instrument);
    session.add_material(material);
    session.set_view_type(ViewType::Polar);
    session.add_overlay(Overlay::new(
        overlay_name,
        material_name,
        OverlayKind::Powder(PowderParams::default()),
    ));
    session.overlay_data(0)?;

    let pick_data = std::fs::read_to_string(&args.picks)?;
    let picks = import_picks(&pick_data, &[&session.overlays[0]])?;

    let correspondences = build_correspondences(&picks, &[&session.overlays[0]]);
    if correspondences.is_empty() {
        return Err("pick file contains no usable correspondences".into());
    }

    let mut params = ParamSet::instrument_default(&session.instrument);
    if !args.refine_tilt {
        params.set_vary(|id| matches!(id, ParamId::PanelTilt { .. }), false);
    }

    let mut model = session.snapshot_model();
    let options = LmOptions {
        max_iters: args.max_iters,
        ..Default::default()
    };
    let outcome = refine(&mut model, &params, &correspondences, &options);

    println!(
        "refinement {}: rss {:.6e} -> {:.6e} in {} iterations",
        if outcome.converged {
            "converged"
        } else {
            "did not converge"
        },
        outcome.rss_before,
        outcome.rss_after,
        outcome.n_iter
    );
    if !outcome.converged {
        return Err(format!("refinement failed: {}", outcome.message).into());
    }

    session.apply_refined_model(model);
    session.instrument.to_json_file(&args.out)?;
    tracing::info!(out = %args.out.display(), "refined instrument written");
    Ok(())
}

fn cmd_instrument_info(path: &Path) -> CliResult<()> {
    let instrument = Instrument::from_json_file(path)?;
    println!("beam: {:.4} keV along {:?}", instrument.beam.energy_kev, [
        instrument.beam.vector.x,
        instrument.beam.vector.y,
        instrument.beam.vector.z
    ]);
    println!(
        "sample: chi {:.4} deg, translation {:?} mm",
        instrument.sample.chi.to_degrees(),
        [
            instrument.sample.tvec.x,
            instrument.sample.tvec.y,
            instrument.sample.tvec.z
        ]
    );
    println!("panels: {}", instrument.n_panels());
    for (name, panel) in instrument.panels() {
        let (w, h) = panel.extent_mm();
        println!(
            "  {}: {}x{} px, {:.3}x{:.3} mm, distance {:.1} mm{}",
            name,
            panel.rows,
            panel.cols,
            w,
            h,
            panel.tvec.norm(),
            if panel.distortion.is_some() {
                ", distortion"
            } else {
                ""
            }
        );
    }
    Ok(())
}
