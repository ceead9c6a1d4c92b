//! Functions for generating synthetic camera rigs and control networks.

use cgmath::{Point2, Point3};
use indicatif::ParallelProgressIterator;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rayon::prelude::*;
use tracing::debug;

use std::fs::create_dir_all;
use std::path::{Path, PathBuf};

use crate::camera::{Camera, PinholeCamera};
use crate::error::Result;
use crate::interest::progress_bar;
use crate::network::{ControlNetwork, ControlPoint, ControlPointKind};

/// A grid of nadir cameras flying over points scattered on the ground.
///
/// ```txt
///        spacing
///        <----->
///   *       *       *    ^
///                        |  cameras at `height`
///   *       *       *    v
///  ..:..:.:...:..:.:..:.    points with z in [-relief, relief]
/// ```
#[derive(Debug, Clone)]
pub struct RigOptions {
    /// Cameras along x.
    pub columns: usize,
    /// Cameras along y.
    pub rows: usize,
    pub spacing: f64,
    pub height: f64,
    /// Focal length in pixels.
    pub focal: f64,
    /// Width and height of the (square) images in pixels.
    pub image_size: f64,
    pub num_points: usize,
    /// Maximum height of points above or below the ground.
    pub relief: f64,
    /// The first `num_ground_control` kept points are ground control points.
    pub num_ground_control: usize,
    /// Points seen by fewer cameras are dropped.
    pub min_observations: usize,
    pub seed: u64,
    /// Show a progress bar.
    pub verbose: bool,
}

impl Default for RigOptions {
    fn default() -> Self {
        RigOptions {
            columns: 3,
            rows: 2,
            spacing: 4.0,
            height: 20.0,
            focal: 1000.0,
            image_size: 1000.0,
            num_points: 100,
            relief: 1.0,
            num_ground_control: 4,
            min_observations: 2,
            seed: 0,
            verbose: false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SyntheticScene {
    pub cameras: Vec<PinholeCamera>,
    pub network: ControlNetwork,
}

fn in_image(p: Point2<f64>, size: f64) -> bool {
    p.x.is_finite() && p.y.is_finite() && p.x >= 0.0 && p.x < size && p.y >= 0.0 && p.y < size
}

/// Generate a rig of nadir cameras and a noise free control network observing it.
pub fn synthetic_rig(options: &RigOptions) -> SyntheticScene {
    let cameras = itertools::iproduct!(0..options.rows, 0..options.columns)
        .map(|(r, c)| {
            PinholeCamera::nadir(
                Point3::new(
                    c as f64 * options.spacing,
                    r as f64 * options.spacing,
                    options.height,
                ),
                options.focal,
                options.image_size / 2.0,
            )
        })
        .collect::<Vec<_>>();

    // scatter points over the footprint of the rig
    let width = (options.columns.max(1) - 1) as f64 * options.spacing;
    let depth = (options.rows.max(1) - 1) as f64 * options.spacing;
    let mut rng = StdRng::seed_from_u64(options.seed);
    let positions = (0..options.num_points)
        .map(|_| {
            Point3::new(
                rng.gen_range(-0.1 * width..=1.1 * width),
                rng.gen_range(-0.1 * depth..=1.1 * depth),
                rng.gen_range(-options.relief..=options.relief),
            )
        })
        .collect::<Vec<_>>();

    let mut points = positions
        .par_iter()
        .progress_with(progress_bar(
            positions.len() as u64,
            "Computing visibility",
            options.verbose,
        ))
        .map(|p| {
            let mut point = ControlPoint::new(*p, ControlPointKind::Tie);
            for (j, camera) in cameras.iter().enumerate() {
                // cameras look down, skip points above them
                if p.z < camera.center().z {
                    let pixel = camera.project(*p);
                    if in_image(pixel, options.image_size) {
                        point.observe(j, pixel);
                    }
                }
            }
            point
        })
        .filter(|p| p.observations.len() >= options.min_observations)
        .collect::<Vec<_>>();

    for point in points.iter_mut().take(options.num_ground_control) {
        point.kind = ControlPointKind::GroundControl;
    }
    debug!(
        "generated {} cameras and {} of {} points",
        cameras.len(),
        points.len(),
        options.num_points
    );

    SyntheticScene {
        cameras,
        network: ControlNetwork::new(points),
    }
}

impl SyntheticScene {
    /// Write every camera as `camera_<index>.tsai` and the network as `network.<extension>` into
    /// `dir`. Returns the camera paths and the network path.
    pub fn write(&self, dir: &Path, network_extension: &str) -> Result<(Vec<PathBuf>, PathBuf)> {
        create_dir_all(dir)?;
        let camera_paths = self
            .cameras
            .iter()
            .enumerate()
            .map(|(j, camera)| {
                let path = dir.join(format!("camera_{:03}.tsai", j));
                camera.write(&path)?;
                Ok(path)
            })
            .collect::<Result<Vec<_>>>()?;
        let network_path = dir.join(format!("network.{}", network_extension));
        self.network.write(&network_path)?;
        Ok((camera_paths, network_path))
    }
}
