use cgmath::Vector2;
use photoba::config::RobustNorm;
use photoba::diagnostics::{JsonLinesSink, TracingSink};
use photoba::interest::HarrisDetector;
use photoba::logger::{init_logger, level_from_flags};
use photoba::noise::*;
use photoba::output::*;
use photoba::synthetic::{synthetic_rig, RigOptions, SyntheticScene};
use photoba::*;
use rand::rngs::StdRng;
use rand::SeedableRng;
use structopt::StructOpt;
use tracing::{debug, info};

use std::fs::create_dir_all;
use std::path::PathBuf;

// helper to parse Vector2 with structopt
fn parse_vec2(s: &str) -> std::result::Result<Vector2<f64>, String> {
    let values = s
        .split(',')
        .map(|x| x.trim().parse::<f64>().map_err(|e| e.to_string()))
        .collect::<std::result::Result<Vec<_>, _>>()?;
    match values.as_slice() {
        [x, y] => Ok(Vector2::new(*x, *y)),
        _ => Err(format!("expected two comma separated values, got {:?}", s)),
    }
}

#[derive(StructOpt, Debug)]
struct LogOpt {
    /// Log debug output and show progress bars.
    #[structopt(short = "v", long = "verbose")]
    verbose: bool,

    /// Log everything.
    #[structopt(long = "debug")]
    debug: bool,
}

impl LogOpt {
    fn init(&self) {
        init_logger(level_from_flags(self.verbose, self.debug));
    }
}

#[derive(StructOpt, Debug)]
struct AdjustOpt {
    /// JSON configuration file. photoba.json is used if it exists and no file is given.
    #[structopt(long = "config-file", parse(from_os_str))]
    config_file: Option<PathBuf>,

    /// One of ref, sparse, robust_ref, robust_sparse.
    #[structopt(long = "adjustment-type")]
    adjustment_type: Option<AdjustmentType>,

    /// Initial Levenberg-Marquardt damping.
    #[structopt(long = "lambda")]
    lambda: Option<f64>,

    #[structopt(long = "camera-position-sigma")]
    camera_position_sigma: Option<f64>,

    #[structopt(long = "camera-pose-sigma")]
    camera_pose_sigma: Option<f64>,

    #[structopt(long = "gcp-sigma")]
    gcp_sigma: Option<f64>,

    #[structopt(long = "max-iterations")]
    max_iterations: Option<usize>,

    /// Minimum number of matches between an image pair.
    #[structopt(long = "min-matches")]
    min_matches: Option<usize>,

    /// Below 10 nothing is reported, 10 reports start and end, 20 every iteration, 30 adds
    /// per camera rows.
    #[structopt(long = "report-level")]
    report_level: Option<u32>,

    /// Report every N iterations.
    #[structopt(long = "report-every")]
    report_every: Option<usize>,

    /// Norm of the robust adjustment types, cauchy or huber.
    #[structopt(long = "robust-norm")]
    robust_norm: Option<RobustNorm>,

    /// Pixel threshold of the robust norm.
    #[structopt(long = "robust-threshold")]
    robust_threshold: Option<f64>,

    /// Directory for inputs given as bare file names and for all outputs.
    #[structopt(long = "data-dir", parse(from_os_str))]
    data_dir: Option<PathBuf>,

    /// Write camera and point parameters after every iteration.
    #[structopt(long = "save-iteration-data")]
    save_iteration_data: bool,

    /// Write reports as JSON lines to this file.
    #[structopt(long = "json-report", parse(from_os_str))]
    json_report: Option<PathBuf>,

    /// Print the resolved configuration as JSON and exit.
    #[structopt(long = "print-config")]
    print_config: bool,

    #[structopt(flatten)]
    log: LogOpt,

    /// Control network in .net or .cnet format.
    #[structopt(name = "NETWORK", parse(from_os_str))]
    network: Option<PathBuf>,

    /// Camera files in .tsai or .pinhole format, in the order the network refers to them.
    #[structopt(name = "CAMERAS", parse(from_os_str))]
    cameras: Vec<PathBuf>,
}

impl AdjustOpt {
    /// Apply command line overrides on top of the configuration file.
    fn apply(&self, config: &mut AdjustConfig) {
        if let Some(x) = self.adjustment_type {
            config.adjustment_type = x;
        }
        if let Some(x) = self.lambda {
            config.lambda = Some(x);
        }
        if let Some(x) = self.camera_position_sigma {
            config.camera_position_sigma = x;
        }
        if let Some(x) = self.camera_pose_sigma {
            config.camera_pose_sigma = x;
        }
        if let Some(x) = self.gcp_sigma {
            config.gcp_sigma = x;
        }
        if let Some(x) = self.max_iterations {
            config.max_iterations = x;
        }
        if let Some(x) = self.min_matches {
            config.min_matches = x;
        }
        if let Some(x) = self.report_level {
            config.report_level = x;
        }
        if let Some(x) = self.report_every {
            config.report_every = x;
        }
        if let Some(x) = self.robust_norm {
            config.robust_norm = x;
        }
        if let Some(x) = self.robust_threshold {
            config.robust_threshold = x;
        }
        if let Some(x) = &self.data_dir {
            config.data_dir = x.clone();
        }
        if self.save_iteration_data {
            config.save_iteration_data = true;
        }
    }
}

#[derive(StructOpt, Debug)]
struct SearchRangeOpt {
    /// Left image.
    #[structopt(name = "LEFT", parse(from_os_str))]
    left: PathBuf,

    /// Right image.
    #[structopt(name = "RIGHT", parse(from_os_str))]
    right: PathBuf,

    /// Divide pixel translations by this factor, for images that were subsampled.
    #[structopt(long = "scale", default_value = "1.0")]
    scale: f64,

    /// Seed for RANSAC.
    #[structopt(long = "seed", default_value = "0")]
    seed: u64,

    /// Maximum number of interest points per image.
    #[structopt(long = "max-points", default_value = "500")]
    max_points: usize,

    #[structopt(flatten)]
    log: LogOpt,
}

#[derive(StructOpt, Debug)]
struct SyntheticOpt {
    /// Cameras along x.
    #[structopt(long = "columns", default_value = "3")]
    columns: usize,

    /// Cameras along y.
    #[structopt(long = "rows", default_value = "2")]
    rows: usize,

    /// Distance between neighboring cameras.
    #[structopt(long = "spacing", default_value = "4")]
    spacing: f64,

    /// Height of the cameras above the ground.
    #[structopt(long = "height", default_value = "20")]
    height: f64,

    /// Upper bound on the number of points. Points seen by fewer than two cameras are dropped.
    #[structopt(long = "points", default_value = "100")]
    num_points: usize,

    /// Number of ground control points.
    #[structopt(long = "gcps", default_value = "4")]
    num_ground_control: usize,

    /// Constant offset added to every observation, as "x,y" pixels.
    #[structopt(long = "pixel-offset", default_value = "0,0", parse(try_from_str = parse_vec2))]
    pixel_offset: Vector2<f64>,

    /// Standard deviation of Gaussian noise added to every observation, in pixels.
    #[structopt(long = "pixel-noise", default_value = "0")]
    pixel_noise: f64,

    /// Probability of turning an observation into an outlier.
    #[structopt(long = "outlier-chance", default_value = "0")]
    outlier_chance: f64,

    /// Distance outliers are moved, in pixels.
    #[structopt(long = "outlier-magnitude", default_value = "50")]
    outlier_magnitude: f64,

    /// Standard deviation of noise added to tie point positions.
    #[structopt(long = "point-std", default_value = "0")]
    point_std: f64,

    /// Standard deviation of noise added to camera centers.
    #[structopt(long = "translation-std", default_value = "0")]
    translation_std: f64,

    /// Standard deviation of noise added to camera rotations, in radians.
    #[structopt(long = "rotation-std", default_value = "0")]
    rotation_std: f64,

    /// Format of the control network, net or cnet.
    #[structopt(long = "network-format", default_value = "net")]
    network_format: String,

    #[structopt(long = "seed", default_value = "0")]
    seed: u64,

    #[structopt(flatten)]
    log: LogOpt,

    /// Output directory.
    #[structopt(name = "OUTDIR", parse(from_os_str))]
    out: PathBuf,
}

#[derive(StructOpt, Debug)]
struct PlyOpt {
    /// Apply the .adjust files in this directory to the cameras.
    #[structopt(long = "adjust-dir", parse(from_os_str))]
    adjust_dir: Option<PathBuf>,

    #[structopt(flatten)]
    log: LogOpt,

    /// Control network in .net or .cnet format.
    #[structopt(name = "NETWORK", parse(from_os_str))]
    network: PathBuf,

    /// Camera files followed by the output .ply file.
    #[structopt(name = "FILES", parse(from_os_str), min_values = 2)]
    files: Vec<PathBuf>,
}

#[derive(StructOpt, Debug)]
#[structopt(
    name = "photoba",
    about = "Photogrammetric bundle adjustment of cameras and control networks."
)]
enum Opt {
    /// Adjust cameras and control points to minimize reprojection error.
    Adjust(AdjustOpt),
    /// Estimate the disparity search window between two images.
    SearchRange(SearchRangeOpt),
    /// Generate a synthetic camera rig and control network.
    Synthetic(SyntheticOpt),
    /// Convert cameras and a control network to a .ply for visualization.
    Ply(PlyOpt),
}

fn run_adjust(opt: AdjustOpt) -> Result<()> {
    opt.log.init();
    let mut config = AdjustConfig::load(opt.config_file.as_deref())?;
    opt.apply(&mut config);
    config.validate()?;
    if opt.print_config {
        println!("{}", serde_json::to_string_pretty(&config)?);
        return Ok(());
    }

    let network_path = opt
        .network
        .as_ref()
        .map(|p| config.resolve(p))
        .ok_or_else(|| Error::Configuration("no control network given".to_string()))?;
    if opt.cameras.is_empty() {
        return Err(Error::Configuration("no camera files given".to_string()));
    }
    let camera_paths = opt
        .cameras
        .iter()
        .map(|p| config.resolve(p))
        .collect::<Vec<_>>();
    let mut inputs = camera_paths.clone();
    inputs.push(network_path.clone());
    config.require_inputs(&inputs)?;

    let cameras = camera_paths
        .iter()
        .map(|p| load_camera(p))
        .collect::<Result<Vec<_>>>()?;
    let network = ControlNetwork::from_file(&network_path)?;
    debug!("loaded {}", network);
    let mut model = BundleAdjustmentModel::new(cameras, network, config.sigmas())?;
    info!("{}", model);

    create_dir_all(&config.data_dir)?;
    write_snapshots(
        &model,
        &config.data_dir,
        INITIAL_CAMERA_FILE,
        INITIAL_POINT_FILE,
    )?;

    let mut reporter =
        Reporter::new(config.report_level, config.report_every).with_sink(TracingSink);
    if let Some(path) = &opt.json_report {
        reporter.add_sink(Box::new(JsonLinesSink::create(path)?));
    }
    let mut trajectory = if config.save_iteration_data {
        Some(IterationReport::create(&config.data_dir)?)
    } else {
        None
    };

    let mut adjuster = Adjuster::new(config.adjustment_type.strategy(), config.error_norm());
    let options = DriverOptions {
        max_iterations: config.max_iterations,
        lambda: config.lambda,
    };
    let outcome = adjust_bundles(
        &mut model,
        &mut adjuster,
        &options,
        &mut reporter,
        trajectory.as_mut(),
    )?;

    write_snapshots(&model, &config.data_dir, FINAL_CAMERA_FILE, FINAL_POINT_FILE)?;
    let written = write_adjustments(&model, &camera_paths, &config.data_dir)?;
    debug!("wrote {} adjustment files", written.len());

    let summary = Summary::from_model(&model, Some(outcome.cost));
    println!(
        "{:?} after {} iterations, mean pixel error {:.6}",
        outcome.state, outcome.iterations, summary.pixel_error.mean
    );
    Ok(())
}

fn run_search_range(opt: SearchRangeOpt) -> Result<()> {
    opt.log.init();
    for path in &[&opt.left, &opt.right] {
        if !path.is_file() {
            return Err(Error::Configuration(format!(
                "image {} does not exist",
                path.display()
            )));
        }
    }
    let estimator = SearchRangeEstimator {
        seed: opt.seed,
        verbose: opt.log.verbose,
        ..Default::default()
    };
    let detector = HarrisDetector {
        max_points: opt.max_points,
        ..Default::default()
    };
    let range = estimator.estimate(&opt.left, &opt.right, opt.scale, &detector)?;
    println!("{}", range);
    Ok(())
}

fn run_synthetic(opt: SyntheticOpt) -> Result<()> {
    opt.log.init();
    let scene = synthetic_rig(&RigOptions {
        columns: opt.columns,
        rows: opt.rows,
        spacing: opt.spacing,
        height: opt.height,
        num_points: opt.num_points,
        num_ground_control: opt.num_ground_control,
        seed: opt.seed,
        verbose: opt.log.verbose,
        ..Default::default()
    });

    // separate stream from the one used to place points
    let mut rng = StdRng::seed_from_u64(opt.seed.wrapping_add(1));
    let mut network = add_pixel_offset(scene.network, opt.pixel_offset);
    network = add_pixel_noise(network, opt.pixel_noise, &mut rng)?;
    network = add_outliers(network, opt.outlier_chance, opt.outlier_magnitude, &mut rng);
    network = perturb_points(network, opt.point_std, &mut rng)?;
    let cameras = perturb_cameras(
        scene.cameras,
        opt.translation_std,
        opt.rotation_std,
        &mut rng,
    )?;

    let scene = SyntheticScene { cameras, network };
    let (camera_paths, network_path) = scene.write(&opt.out, &opt.network_format)?;
    println!(
        "Wrote {} cameras and {} points ({} ground control) to {}",
        camera_paths.len(),
        scene.network.num_points(),
        scene.network.num_ground_control_points(),
        network_path.display()
    );
    Ok(())
}

fn run_ply(opt: PlyOpt) -> Result<()> {
    opt.log.init();
    let (out, camera_paths) = opt
        .files
        .split_last()
        .ok_or_else(|| Error::Configuration("no output file given".to_string()))?;
    let network = ControlNetwork::from_file(&opt.network)?;
    let cameras = camera_paths
        .iter()
        .map(|p| load_camera(p))
        .collect::<Result<Vec<_>>>()?;
    match &opt.adjust_dir {
        Some(dir) => {
            let adjusted = cameras
                .into_iter()
                .zip(camera_paths)
                .map(|(camera, path)| {
                    AdjustedCamera::from_adjustment_file(camera, &adjustment_path(dir, path)?)
                })
                .collect::<Result<Vec<_>>>()?;
            ply::write_ply(out, &adjusted, &network)
        }
        None => ply::write_ply(out, &cameras, &network),
    }
}

fn main() -> Result<()> {
    match Opt::from_args() {
        Opt::Adjust(opt) => run_adjust(opt),
        Opt::SearchRange(opt) => run_search_range(opt),
        Opt::Synthetic(opt) => run_synthetic(opt),
        Opt::Ply(opt) => run_ply(opt),
    }
}
