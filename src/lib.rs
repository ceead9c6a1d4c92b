//! Photogrammetric bundle adjustment.
//!
//! A [BundleAdjustmentModel](model::BundleAdjustmentModel) couples a set of cameras with a
//! [ControlNetwork](network::ControlNetwork) of tie points and ground control points. The
//! [Adjuster](solver::Adjuster) proposes Levenberg-Marquardt steps for it and
//! [adjust_bundles](driver::adjust_bundles) runs the iteration until it converges, stalls or
//! reaches its iteration limit.
//!
//! ```no_run
//! use photoba::*;
//! # fn main() -> photoba::Result<()> {
//! let cameras = vec![load_camera("left.tsai".as_ref())?, load_camera("right.tsai".as_ref())?];
//! let network = ControlNetwork::from_file("network.net".as_ref())?;
//! let mut model = BundleAdjustmentModel::new(cameras, network, AdjustConfig::default().sigmas())?;
//! let mut adjuster = Adjuster::new(SolveStrategy::Sparse, ErrorNorm::L2);
//! let outcome = adjust_bundles(
//!     &mut model,
//!     &mut adjuster,
//!     &DriverOptions::default(),
//!     &mut Reporter::new(10, 1).with_sink(diagnostics::TracingSink),
//!     None,
//! )?;
//! println!("{:?} after {} iterations", outcome.state, outcome.iterations);
//! # Ok(())
//! # }
//! ```

pub mod camera;
pub mod config;
pub mod diagnostics;
pub mod driver;
pub mod error;
pub mod interest;
pub mod logger;
pub mod model;
pub mod network;
pub mod noise;
pub mod output;
pub mod ply;
pub mod rotation;
pub mod search_range;
pub mod solver;
pub mod synthetic;

pub use camera::{load_camera, AdjustedCamera, Camera, PinholeCamera};
pub use config::{AdjustConfig, AdjustmentType};
pub use diagnostics::{Reporter, Summary};
pub use driver::{adjust_bundles, AdjustmentState, DriverOptions, Outcome};
pub use error::{Error, Result};
pub use model::{BundleAdjustmentModel, CameraId, PointId, Sigmas};
pub use network::{ControlNetwork, ControlPoint, ControlPointKind};
pub use search_range::{SearchRange, SearchRangeEstimator};
pub use solver::{Adjuster, ErrorNorm, SolveStrategy};
