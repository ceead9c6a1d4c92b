//! Levenberg-Marquardt optimizer for a [BundleAdjustmentModel].
//!
//! Each call to [Adjuster::update] linearizes the projection of every observation around the
//! model's current parameters, builds the normal equations including the prior on camera
//! corrections and ground control points, and solves them either densely or by eliminating the
//! point blocks first (Schur complement on the camera system). Robust norms are handled by
//! iteratively reweighting each observation with the derivative of the norm.
//!
//! The adjuster never writes to the model. Accepted steps are returned as a [ParameterUpdate] for
//! the caller to commit.

use nalgebra as na;
use rayon::prelude::*;
use tracing::{debug, trace};

use crate::camera::Camera;
use crate::error::{Error, Result};
use crate::model::{BundleAdjustmentModel, CameraVector, Parameters, PixelObservation, PointVector};

pub type ParameterUpdate = Parameters;

const DEFAULT_DAMPING: f64 = 1e-3;
const MIN_DAMPING: f64 = 1e-12;
const MAX_ATTEMPTS: usize = 10;
const MIN_RELATIVE_STEP: f64 = 1e-12;
const MIN_COST: f64 = 1e-20;

/// How the normal equations are solved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SolveStrategy {
    /// Cholesky factorization of the full system.
    Dense,
    /// Eliminate the 3x3 point blocks, factor the reduced camera system, back-substitute.
    Sparse,
}

/// Penalty applied to the squared pixel residual of each observation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ErrorNorm {
    L2,
    Huber { threshold: f64 },
    Cauchy { threshold: f64 },
}

impl ErrorNorm {
    /// Penalty for a squared residual `s`.
    pub fn rho(&self, s: f64) -> f64 {
        match *self {
            ErrorNorm::L2 => s,
            ErrorNorm::Huber { threshold } => {
                let t2 = threshold * threshold;
                if s <= t2 {
                    s
                } else {
                    2.0 * threshold * s.sqrt() - t2
                }
            }
            ErrorNorm::Cauchy { threshold } => {
                let t2 = threshold * threshold;
                t2 * (s / t2).ln_1p()
            }
        }
    }

    /// Derivative of [ErrorNorm::rho] with respect to `s`.
    pub fn weight(&self, s: f64) -> f64 {
        match *self {
            ErrorNorm::L2 => 1.0,
            ErrorNorm::Huber { threshold } => {
                if s <= threshold * threshold {
                    1.0
                } else {
                    threshold / s.sqrt()
                }
            }
            ErrorNorm::Cauchy { threshold } => 1.0 / (1.0 + s / (threshold * threshold)),
        }
    }
}

/// Result of a single [Adjuster::update].
#[derive(Debug, Clone)]
pub struct Step {
    /// No further progress is possible.
    pub converged: bool,
    pub absolute_improvement: f64,
    pub relative_improvement: f64,
    /// Total cost after the step (or the current cost if no step was taken).
    pub cost: f64,
    /// Parameters after an accepted step.
    pub update: Option<ParameterUpdate>,
}

pub struct Adjuster {
    strategy: SolveStrategy,
    norm: ErrorNorm,
    lambda: f64,
    iterations: usize,
}

/// Residual and its derivatives for one observation.
struct Linearized {
    residual: na::Vector2<f64>,
    weight: f64,
    camera: na::Matrix2x6<f64>,
    point: na::Matrix2x3<f64>,
}

/// Block form of the damped normal equations `N delta = g`.
struct NormalEquations {
    u: Vec<na::Matrix6<f64>>,
    v: Vec<na::Matrix3<f64>>,
    /// For every point, the coupling block with each camera observing it.
    w: Vec<Vec<(usize, na::Matrix6x3<f64>)>>,
    g_a: Vec<na::Vector6<f64>>,
    g_b: Vec<na::Vector3<f64>>,
}

fn residual<C: Camera>(
    model: &BundleAdjustmentModel<C>,
    o: &PixelObservation,
    params: &Parameters,
) -> na::Vector2<f64> {
    let p = model.projection(
        o.point,
        o.camera,
        &params.cameras[o.camera.index()],
        &params.points[o.point.index()],
    );
    na::Vector2::new(o.pixel.x - p.x, o.pixel.y - p.y)
}

fn step_size(x: f64) -> f64 {
    1e-6 * x.abs().max(1.0)
}

/// Central difference derivatives of the projection with respect to the camera and point
/// parameters.
fn jacobians<C: Camera>(
    model: &BundleAdjustmentModel<C>,
    o: &PixelObservation,
    a: &CameraVector,
    b: &PointVector,
) -> (na::Matrix2x6<f64>, na::Matrix2x3<f64>) {
    let project = |a: &CameraVector, b: &PointVector| {
        let p = model.projection(o.point, o.camera, a, b);
        na::Vector2::new(p.x, p.y)
    };

    let mut camera = na::Matrix2x6::zeros();
    for k in 0..6 {
        let h = step_size(a[k]);
        let mut plus = *a;
        plus[k] += h;
        let mut minus = *a;
        minus[k] -= h;
        camera.set_column(k, &((project(&plus, b) - project(&minus, b)) / (2.0 * h)));
    }

    let mut point = na::Matrix2x3::zeros();
    for k in 0..3 {
        let h = step_size(b[k]);
        let mut plus = *b;
        plus[k] += h;
        let mut minus = *b;
        minus[k] -= h;
        point.set_column(k, &((project(a, &plus) - project(a, &minus)) / (2.0 * h)));
    }

    (camera, point)
}

/// Prior cost `(x - x0)^T C^-1 (x - x0)` of every camera and point.
fn prior_cost<C: Camera>(model: &BundleAdjustmentModel<C>, params: &Parameters) -> f64 {
    let cameras: f64 = model
        .camera_ids()
        .map(|j| {
            let d = params.cameras[j.index()] - model.camera_initial(j);
            d.dot(&(model.camera_inverse_covariance(j) * d))
        })
        .sum();
    let points: f64 = model
        .point_ids()
        .filter(|i| model.is_ground_control(*i))
        .map(|i| {
            let d = params.points[i.index()] - model.point_initial(i);
            d.dot(&(model.point_inverse_covariance(i) * d))
        })
        .sum();
    cameras + points
}

impl NormalEquations {
    fn assemble<C: Camera>(
        model: &BundleAdjustmentModel<C>,
        params: &Parameters,
        linearized: &[Linearized],
    ) -> Self {
        let mut u = model
            .camera_ids()
            .map(|j| model.camera_inverse_covariance(j))
            .collect::<Vec<_>>();
        let mut g_a = model
            .camera_ids()
            .map(|j| {
                model.camera_inverse_covariance(j)
                    * (model.camera_initial(j) - params.cameras[j.index()])
            })
            .collect::<Vec<_>>();
        let mut v = model
            .point_ids()
            .map(|i| model.point_inverse_covariance(i))
            .collect::<Vec<_>>();
        let mut g_b = model
            .point_ids()
            .map(|i| {
                model.point_inverse_covariance(i)
                    * (model.point_initial(i) - params.points[i.index()])
            })
            .collect::<Vec<_>>();
        let mut w: Vec<Vec<(usize, na::Matrix6x3<f64>)>> = vec![Vec::new(); model.num_points()];

        for (o, l) in model.observations().iter().zip(linearized) {
            let j = o.camera.index();
            let i = o.point.index();
            let at = l.camera.transpose() * l.weight;
            let bt = l.point.transpose() * l.weight;
            u[j] += at * l.camera;
            v[i] += bt * l.point;
            g_a[j] += at * l.residual;
            g_b[i] += bt * l.residual;
            let coupling = at * l.point;
            match w[i].iter_mut().find(|(k, _)| *k == j) {
                Some((_, block)) => *block += coupling,
                None => w[i].push((j, coupling)),
            }
        }

        NormalEquations { u, v, w, g_a, g_b }
    }

    fn num_cameras(&self) -> usize {
        self.u.len()
    }

    fn num_points(&self) -> usize {
        self.v.len()
    }

    fn solve(
        &self,
        strategy: SolveStrategy,
        lambda: f64,
    ) -> Result<(Vec<CameraVector>, Vec<PointVector>)> {
        match strategy {
            SolveStrategy::Dense => self.solve_dense(lambda),
            SolveStrategy::Sparse => self.solve_sparse(lambda),
        }
    }

    fn solve_dense(&self, lambda: f64) -> Result<(Vec<CameraVector>, Vec<PointVector>)> {
        let m = self.num_cameras();
        let offset = 6 * m;
        let n = offset + 3 * self.num_points();

        let mut lhs = na::DMatrix::<f64>::zeros(n, n);
        let mut rhs = na::DVector::<f64>::zeros(n);
        for (j, (u, g)) in self.u.iter().zip(&self.g_a).enumerate() {
            lhs.fixed_view_mut::<6, 6>(6 * j, 6 * j).copy_from(u);
            rhs.fixed_rows_mut::<6>(6 * j).copy_from(g);
        }
        for (i, (v, g)) in self.v.iter().zip(&self.g_b).enumerate() {
            let r = offset + 3 * i;
            lhs.fixed_view_mut::<3, 3>(r, r).copy_from(v);
            rhs.fixed_rows_mut::<3>(r).copy_from(g);
            for (j, w) in &self.w[i] {
                lhs.fixed_view_mut::<6, 3>(6 * j, r).copy_from(w);
                lhs.fixed_view_mut::<3, 6>(r, 6 * j).copy_from(&w.transpose());
            }
        }
        for k in 0..n {
            lhs[(k, k)] += lambda;
        }

        let delta = na::linalg::Cholesky::new(lhs)
            .ok_or_else(|| {
                Error::NumericalFailure("normal equations are not positive definite".to_string())
            })?
            .solve(&rhs);

        let da = (0..m)
            .map(|j| delta.fixed_rows::<6>(6 * j).into_owned())
            .collect();
        let db = (0..self.num_points())
            .map(|i| delta.fixed_rows::<3>(offset + 3 * i).into_owned())
            .collect();
        Ok((da, db))
    }

    fn solve_sparse(&self, lambda: f64) -> Result<(Vec<CameraVector>, Vec<PointVector>)> {
        let m = self.num_cameras();
        let v_inv = self
            .v
            .iter()
            .enumerate()
            .map(|(i, v)| {
                (v + na::Matrix3::identity() * lambda)
                    .try_inverse()
                    .ok_or_else(|| {
                        Error::NumericalFailure(format!("point block {} is singular", i))
                    })
            })
            .collect::<Result<Vec<_>>>()?;

        let mut reduced = na::DMatrix::<f64>::zeros(6 * m, 6 * m);
        let mut rhs = na::DVector::<f64>::zeros(6 * m);
        for (j, (u, g)) in self.u.iter().zip(&self.g_a).enumerate() {
            let mut block = reduced.fixed_view_mut::<6, 6>(6 * j, 6 * j);
            block += u + na::Matrix6::identity() * lambda;
            rhs.fixed_rows_mut::<6>(6 * j).copy_from(g);
        }
        for (i, blocks) in self.w.iter().enumerate() {
            for (j, w_ij) in blocks {
                let y = w_ij * v_inv[i];
                let mut r = rhs.fixed_rows_mut::<6>(6 * j);
                r -= y * self.g_b[i];
                for (k, w_ik) in blocks {
                    let mut block = reduced.fixed_view_mut::<6, 6>(6 * j, 6 * k);
                    block -= y * w_ik.transpose();
                }
            }
        }

        let delta = na::linalg::Cholesky::new(reduced)
            .ok_or_else(|| {
                Error::NumericalFailure("reduced camera system is not positive definite".to_string())
            })?
            .solve(&rhs);
        let da = (0..m)
            .map(|j| delta.fixed_rows::<6>(6 * j).into_owned())
            .collect::<Vec<CameraVector>>();

        let db = self
            .w
            .iter()
            .enumerate()
            .map(|(i, blocks)| {
                let mut g = self.g_b[i];
                for (j, w_ij) in blocks {
                    g -= w_ij.transpose() * da[*j];
                }
                v_inv[i] * g
            })
            .collect();
        Ok((da, db))
    }
}

impl Adjuster {
    pub fn new(strategy: SolveStrategy, norm: ErrorNorm) -> Self {
        Adjuster {
            strategy,
            norm,
            lambda: DEFAULT_DAMPING,
            iterations: 0,
        }
    }

    pub fn set_initial_damping(&mut self, lambda: f64) {
        self.lambda = lambda;
    }

    pub fn damping(&self) -> f64 {
        self.lambda
    }

    pub fn strategy(&self) -> SolveStrategy {
        self.strategy
    }

    pub fn norm(&self) -> ErrorNorm {
        self.norm
    }

    /// Number of calls to [Adjuster::update] so far.
    pub fn iterations(&self) -> usize {
        self.iterations
    }

    /// Total cost of `params`: robustified reprojection error plus the priors.
    pub fn cost<C: Camera + Sync>(
        &self,
        model: &BundleAdjustmentModel<C>,
        params: &Parameters,
    ) -> f64 {
        let data: f64 = model
            .observations()
            .par_iter()
            .map(|o| self.norm.rho(residual(model, o, params).norm_squared()))
            .sum();
        data + prior_cost(model, params)
    }

    fn linearize<C: Camera + Sync>(
        &self,
        model: &BundleAdjustmentModel<C>,
        params: &Parameters,
    ) -> Vec<Linearized> {
        model
            .observations()
            .par_iter()
            .map(|o| {
                let a = &params.cameras[o.camera.index()];
                let b = &params.points[o.point.index()];
                let residual = residual(model, o, params);
                let (camera, point) = jacobians(model, o, a, b);
                Linearized {
                    weight: self.norm.weight(residual.norm_squared()),
                    residual,
                    camera,
                    point,
                }
            })
            .collect()
    }

    /// Propose a step from the model's current parameters. Rejected steps increase the damping
    /// and are retried a bounded number of times.
    pub fn update<C: Camera + Sync>(&mut self, model: &BundleAdjustmentModel<C>) -> Result<Step> {
        self.iterations += 1;
        let x = model.parameters();
        let cost = self.cost(model, &x);
        if !cost.is_finite() {
            return Err(Error::NumericalFailure(format!(
                "cost is not finite at iteration {}",
                self.iterations
            )));
        }
        let finished = |cost| Step {
            converged: true,
            absolute_improvement: 0.0,
            relative_improvement: 0.0,
            cost,
            update: None,
        };
        if cost < MIN_COST {
            return Ok(finished(cost));
        }

        let linearized = self.linearize(model, &x);
        let normal = NormalEquations::assemble(model, &x, &linearized);
        let scale = x
            .cameras
            .iter()
            .map(|a| a.norm_squared())
            .chain(x.points.iter().map(|b| b.norm_squared()))
            .sum::<f64>()
            .sqrt()
            .max(1.0);

        for attempt in 0..MAX_ATTEMPTS {
            let (da, db) = normal.solve(self.strategy, self.lambda)?;
            let size = da
                .iter()
                .map(|d| d.norm_squared())
                .chain(db.iter().map(|d| d.norm_squared()))
                .sum::<f64>()
                .sqrt();
            if size < MIN_RELATIVE_STEP * scale {
                debug!("step size {:e} is negligible", size);
                return Ok(finished(cost));
            }

            let candidate = Parameters {
                cameras: x.cameras.iter().zip(&da).map(|(a, d)| a + d).collect(),
                points: x.points.iter().zip(&db).map(|(b, d)| b + d).collect(),
            };
            let new_cost = self.cost(model, &candidate);
            if new_cost.is_finite() && new_cost < cost {
                debug!(
                    "iteration {}: cost {:.6e} -> {:.6e} (lambda {:.1e})",
                    self.iterations, cost, new_cost, self.lambda
                );
                self.lambda = (self.lambda / 10.0).max(MIN_DAMPING);
                let absolute_improvement = cost - new_cost;
                return Ok(Step {
                    converged: new_cost < MIN_COST,
                    absolute_improvement,
                    relative_improvement: absolute_improvement / cost,
                    cost: new_cost,
                    update: Some(candidate),
                });
            }
            trace!(
                "rejected attempt {} with cost {:.6e} (lambda {:.1e})",
                attempt,
                new_cost,
                self.lambda
            );
            self.lambda *= 10.0;
        }

        debug!("no improving step found at iteration {}", self.iterations);
        Ok(finished(cost))
    }
}
