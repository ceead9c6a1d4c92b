//! The iteration loop driving an [Adjuster] to convergence.

use serde::Serialize;
use tracing::{debug, info};

use crate::camera::Camera;
use crate::diagnostics::Reporter;
use crate::error::Result;
use crate::model::BundleAdjustmentModel;
use crate::output::IterationReport;
use crate::solver::{Adjuster, ParameterUpdate};

/// Improvements below both of these end the loop.
pub const ABSOLUTE_TOLERANCE: f64 = 1e-3;
pub const RELATIVE_TOLERANCE: f64 = 1e-3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AdjustmentState {
    Initialized,
    Iterating,
    /// The adjuster could not improve the solution further.
    Converged,
    MaxIterations,
    /// Improvements fell below [ABSOLUTE_TOLERANCE] and [RELATIVE_TOLERANCE].
    Stalled,
}

impl AdjustmentState {
    pub fn is_terminal(self) -> bool {
        match self {
            AdjustmentState::Initialized | AdjustmentState::Iterating => false,
            _ => true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DriverOptions {
    /// Maximum number of calls to [Adjuster::update]. The run stops as soon as this many updates
    /// have been made, so a limit of `n` allows exactly `n` updates and 0 allows none.
    pub max_iterations: usize,
    /// Initial damping, the adjuster's default is used if unset.
    pub lambda: Option<f64>,
}

impl Default for DriverOptions {
    fn default() -> Self {
        DriverOptions {
            max_iterations: 30,
            lambda: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Outcome {
    pub state: AdjustmentState,
    pub iterations: usize,
    /// Cost after the last accepted step.
    pub cost: f64,
}

/// Write an accepted step back into the model.
pub fn commit<C: Camera>(model: &mut BundleAdjustmentModel<C>, update: ParameterUpdate) {
    let cameras = model.camera_ids().collect::<Vec<_>>();
    for (j, a) in cameras.into_iter().zip(update.cameras) {
        model.set_camera_parameters(j, a);
    }
    let points = model.point_ids().collect::<Vec<_>>();
    for (i, b) in points.into_iter().zip(update.points) {
        model.set_point_parameters(i, b);
    }
}

/// Run bundle adjustment on `model` until the adjuster converges, `max_iterations` updates have
/// been made, or improvements stall.
///
/// Accepted steps are committed to `model` as they are made. If the adjuster fails the error is
/// returned and `model` holds the last accepted parameters. When `trajectory` is given every
/// iteration's parameters are appended to it.
pub fn adjust_bundles<C: Camera + Sync>(
    model: &mut BundleAdjustmentModel<C>,
    adjuster: &mut Adjuster,
    options: &DriverOptions,
    reporter: &mut Reporter,
    mut trajectory: Option<&mut IterationReport>,
) -> Result<Outcome> {
    let mut state = AdjustmentState::Initialized;
    if let Some(lambda) = options.lambda {
        adjuster.set_initial_damping(lambda);
    }
    let mut cost = adjuster.cost(model, &model.parameters());
    reporter.start(model, Some(cost))?;
    debug!("{:?} with cost {:.6e}", state, cost);

    if options.max_iterations == 0 {
        state = AdjustmentState::MaxIterations;
    } else {
        state = AdjustmentState::Iterating;
    }

    while !state.is_terminal() {
        let step = adjuster.update(model)?;
        let iteration = adjuster.iterations();
        if let Some(update) = step.update {
            commit(model, update);
        }
        cost = step.cost;

        if let Some(report) = trajectory.as_mut() {
            report.append(iteration, model)?;
        }
        reporter.iteration(iteration, model, Some(cost))?;

        if step.converged {
            state = AdjustmentState::Converged;
        } else if iteration >= options.max_iterations {
            state = AdjustmentState::MaxIterations;
        } else if step.absolute_improvement < ABSOLUTE_TOLERANCE
            && step.relative_improvement < RELATIVE_TOLERANCE
        {
            state = AdjustmentState::Stalled;
        }
    }

    let iterations = adjuster.iterations();
    info!("Bundle adjustment stopped after {} iterations: {:?}", iterations, state);
    reporter.end(iterations, state, model, Some(cost))?;
    Ok(Outcome {
        state,
        iterations,
        cost,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::camera::{nadir_camera, PinholeCamera};
    use crate::model::{PointVector, Sigmas};
    use crate::network::{ControlNetwork, ControlPoint, ControlPointKind};
    use crate::solver::{ErrorNorm, SolveStrategy};
    use cgmath::{Point3, Vector2};

    fn model(offset: Vector2<f64>) -> BundleAdjustmentModel<PinholeCamera> {
        let cameras = vec![nadir_camera(-1.0, 0.0, 10.0), nadir_camera(1.0, 0.0, 10.0)];
        let points = [
            Point3::new(-1.0, -1.0, 0.0),
            Point3::new(1.0, -1.0, 0.3),
            Point3::new(1.0, 1.0, 0.0),
            Point3::new(-1.0, 1.0, -0.2),
        ]
        .iter()
        .enumerate()
        .map(|(k, p)| {
            let kind = if k == 0 {
                ControlPointKind::GroundControl
            } else {
                ControlPointKind::Tie
            };
            let mut cp = ControlPoint::new(*p, kind);
            for (j, c) in cameras.iter().enumerate() {
                cp.observe(j, c.project(*p) + offset);
            }
            cp
        })
        .collect();
        BundleAdjustmentModel::new(
            cameras,
            ControlNetwork::new(points),
            Sigmas {
                camera_position: 1.0,
                camera_pose: 1e-6,
                ground_control: 1e-6,
            },
        )
        .unwrap()
    }

    #[test]
    fn perfect_network_converges_immediately() {
        let mut m = model(Vector2::new(0.0, 0.0));
        let mut adjuster = Adjuster::new(SolveStrategy::Sparse, ErrorNorm::L2);
        let outcome = adjust_bundles(
            &mut m,
            &mut adjuster,
            &DriverOptions::default(),
            &mut Reporter::silent(),
            None,
        )
        .unwrap();
        assert_eq!(outcome.state, AdjustmentState::Converged);
        assert_eq!(outcome.iterations, 1);
        assert!(m.pixel_residuals().iter().all(|r| *r < 1e-9));
    }

    #[test]
    fn offset_network_is_corrected() {
        let mut m = model(Vector2::new(2.0, 0.0));
        let mut adjuster = Adjuster::new(SolveStrategy::Dense, ErrorNorm::L2);
        let outcome = adjust_bundles(
            &mut m,
            &mut adjuster,
            &DriverOptions {
                max_iterations: 30,
                lambda: Some(1e-2),
            },
            &mut Reporter::silent(),
            None,
        )
        .unwrap();
        assert!(outcome.state.is_terminal());
        assert!(outcome.iterations <= 30);
        let residuals = m.pixel_residuals();
        assert!(residuals.iter().sum::<f64>() / (residuals.len() as f64) < 0.5);
    }

    #[test]
    fn iteration_ceiling() {
        let mut m = model(Vector2::new(2.0, 0.0));
        let mut adjuster = Adjuster::new(SolveStrategy::Sparse, ErrorNorm::L2);
        let outcome = adjust_bundles(
            &mut m,
            &mut adjuster,
            &DriverOptions {
                max_iterations: 1,
                lambda: None,
            },
            &mut Reporter::silent(),
            None,
        )
        .unwrap();
        assert_eq!(outcome.state, AdjustmentState::MaxIterations);
        assert_eq!(outcome.iterations, 1);

        let mut m = model(Vector2::new(2.0, 0.0));
        let mut adjuster = Adjuster::new(SolveStrategy::Sparse, ErrorNorm::L2);
        let outcome = adjust_bundles(
            &mut m,
            &mut adjuster,
            &DriverOptions {
                max_iterations: 0,
                lambda: None,
            },
            &mut Reporter::silent(),
            None,
        )
        .unwrap();
        assert_eq!(outcome.state, AdjustmentState::MaxIterations);
        assert_eq!(outcome.iterations, 0);
        assert!(m.camera_position_deltas().iter().all(|d| *d == 0.0));
    }

    #[test]
    fn trajectory_rows_are_written() {
        let dir = tempfile::tempdir().unwrap();
        let mut m = model(Vector2::new(2.0, 0.0));
        let mut adjuster = Adjuster::new(SolveStrategy::Sparse, ErrorNorm::L2);
        let mut report = IterationReport::create(dir.path()).unwrap();
        let outcome = adjust_bundles(
            &mut m,
            &mut adjuster,
            &DriverOptions::default(),
            &mut Reporter::silent(),
            Some(&mut report),
        )
        .unwrap();
        let cameras =
            std::fs::read_to_string(dir.path().join(crate::output::ITERATION_CAMERA_FILE)).unwrap();
        let points =
            std::fs::read_to_string(dir.path().join(crate::output::ITERATION_POINT_FILE)).unwrap();
        assert_eq!(cameras.lines().count(), 2 * outcome.iterations);
        assert_eq!(points.lines().count(), 4 * outcome.iterations);
    }

    #[test]
    fn commit_writes_parameters() {
        let mut m = model(Vector2::new(0.0, 0.0));
        let mut update = m.parameters();
        update.points[1] = PointVector::new(0.0, 0.0, 0.0);
        update.cameras[0][0] = 0.5;
        commit(&mut m, update);
        assert_eq!(m.camera_position_deltas()[0], 0.5);
        assert_eq!(
            m.point_parameters(m.point_id(1).unwrap()),
            &PointVector::new(0.0, 0.0, 0.0)
        );
    }
}
