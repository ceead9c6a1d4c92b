//! The bundle adjustment model: camera corrections and point positions, the projection function
//! relating them to observed pixels, and the prior weights on both.
//!
//! Every camera carries a 6 element correction vector `[tx, ty, tz, rx, ry, rz]`: a translation of
//! the camera center followed by "xyz" Euler angles of a rotation about the camera center. The
//! corrections start at zero. Every control point carries its 3D position, seeded from the
//! control network.

use cgmath::prelude::*;
use cgmath::{Point2, Point3, Quaternion, Vector3};
use nalgebra as na;

use tracing::warn;

use std::path::Path;

use crate::camera::{write_adjustment, AdjustedCamera, Camera};
use crate::error::{Error, Result};
use crate::network::ControlNetwork;
use crate::rotation::{angle_between_degrees, euler_xyz_to_quaternion};

pub type CameraVector = na::Vector6<f64>;
pub type PointVector = na::Vector3<f64>;

/// Index of a camera, checked against the model it came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CameraId(usize);

/// Index of a control point, checked against the model it came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PointId(usize);

impl CameraId {
    pub fn index(self) -> usize {
        self.0
    }
}

impl PointId {
    pub fn index(self) -> usize {
        self.0
    }
}

/// A single pixel observation with validated indices.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PixelObservation {
    pub point: PointId,
    pub camera: CameraId,
    pub pixel: Point2<f64>,
}

/// Standard deviations of the priors on camera corrections and ground control points.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Sigmas {
    pub camera_position: f64,
    pub camera_pose: f64,
    pub ground_control: f64,
}

impl Sigmas {
    pub fn validate(&self) -> Result<()> {
        for (name, value) in &[
            ("camera position sigma", self.camera_position),
            ("camera pose sigma", self.camera_pose),
            ("ground control point sigma", self.ground_control),
        ] {
            if !(*value > 0.0) || !value.is_finite() {
                return Err(Error::Configuration(format!(
                    "{} must be positive and finite, got {}",
                    name, value
                )));
            }
        }
        Ok(())
    }
}

/// Full set of camera and point parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct Parameters {
    pub cameras: Vec<CameraVector>,
    pub points: Vec<PointVector>,
}

/// Split a camera vector into its translation and rotation.
pub fn correction(a: &CameraVector) -> (Vector3<f64>, Quaternion<f64>) {
    (
        Vector3::new(a[0], a[1], a[2]),
        euler_xyz_to_quaternion(Vector3::new(a[3], a[4], a[5])),
    )
}

pub struct BundleAdjustmentModel<C: Camera> {
    cameras: Vec<C>,
    network: ControlNetwork,
    observations: Vec<PixelObservation>,
    a: Vec<CameraVector>,
    a_initial: Vec<CameraVector>,
    b: Vec<PointVector>,
    b_initial: Vec<PointVector>,
    sigmas: Sigmas,
}

impl<C: Camera> BundleAdjustmentModel<C> {
    /// Create a model from the base cameras and a control network. Every observation must refer
    /// to one of `cameras`.
    pub fn new(cameras: Vec<C>, network: ControlNetwork, sigmas: Sigmas) -> Result<Self> {
        sigmas.validate()?;

        let mut observations = Vec::with_capacity(network.num_observations());
        for (i, point) in network.points.iter().enumerate() {
            for obs in &point.observations {
                if obs.camera >= cameras.len() {
                    return Err(Error::Data(format!(
                        "control point {} is observed by camera {}, but only {} cameras were loaded",
                        i,
                        obs.camera,
                        cameras.len()
                    )));
                }
                observations.push(PixelObservation {
                    point: PointId(i),
                    camera: CameraId(obs.camera),
                    pixel: obs.pixel,
                });
            }
        }

        let components = network.num_components(cameras.len());
        if components > 1 {
            warn!(
                "control network is split into {} disconnected components, their relative placement is only constrained by the priors",
                components
            );
        }

        let b_initial = network
            .points
            .iter()
            .map(|p| PointVector::new(p.position.x, p.position.y, p.position.z))
            .collect::<Vec<_>>();

        Ok(BundleAdjustmentModel {
            a: vec![CameraVector::zeros(); cameras.len()],
            a_initial: vec![CameraVector::zeros(); cameras.len()],
            b: b_initial.clone(),
            b_initial,
            cameras,
            network,
            observations,
            sigmas,
        })
    }

    pub fn num_cameras(&self) -> usize {
        self.cameras.len()
    }

    pub fn num_points(&self) -> usize {
        self.b.len()
    }

    pub fn num_observations(&self) -> usize {
        self.observations.len()
    }

    pub fn num_ground_control_points(&self) -> usize {
        self.network.num_ground_control_points()
    }

    pub fn camera_id(&self, j: usize) -> Result<CameraId> {
        if j < self.num_cameras() {
            Ok(CameraId(j))
        } else {
            Err(Error::Data(format!(
                "camera {} out of range ({} cameras)",
                j,
                self.num_cameras()
            )))
        }
    }

    pub fn point_id(&self, i: usize) -> Result<PointId> {
        if i < self.num_points() {
            Ok(PointId(i))
        } else {
            Err(Error::Data(format!(
                "point {} out of range ({} points)",
                i,
                self.num_points()
            )))
        }
    }

    pub fn camera_ids(&self) -> impl Iterator<Item = CameraId> {
        (0..self.num_cameras()).map(CameraId)
    }

    pub fn point_ids(&self) -> impl Iterator<Item = PointId> {
        (0..self.num_points()).map(PointId)
    }

    pub fn observations(&self) -> &[PixelObservation] {
        &self.observations
    }

    pub fn cameras(&self) -> &[C] {
        &self.cameras
    }

    pub fn network(&self) -> &ControlNetwork {
        &self.network
    }

    pub fn sigmas(&self) -> Sigmas {
        self.sigmas
    }

    pub fn is_ground_control(&self, i: PointId) -> bool {
        self.network.points[i.0].is_ground_control()
    }

    pub fn camera_parameters(&self, j: CameraId) -> &CameraVector {
        &self.a[j.0]
    }

    pub fn camera_initial(&self, j: CameraId) -> &CameraVector {
        &self.a_initial[j.0]
    }

    pub fn set_camera_parameters(&mut self, j: CameraId, a_j: CameraVector) {
        self.a[j.0] = a_j;
    }

    pub fn point_parameters(&self, i: PointId) -> &PointVector {
        &self.b[i.0]
    }

    pub fn point_initial(&self, i: PointId) -> &PointVector {
        &self.b_initial[i.0]
    }

    pub fn set_point_parameters(&mut self, i: PointId, b_i: PointVector) {
        self.b[i.0] = b_i;
    }

    /// Snapshot of all current parameters.
    pub fn parameters(&self) -> Parameters {
        Parameters {
            cameras: self.a.clone(),
            points: self.b.clone(),
        }
    }

    /// Pixel location of point `b_i` in camera `j` once the correction `a_j` is applied.
    /// Only depends on the arguments and the base cameras, never on the stored parameters.
    pub fn projection(
        &self,
        _i: PointId,
        j: CameraId,
        a_j: &CameraVector,
        b_i: &PointVector,
    ) -> Point2<f64> {
        let (translation, rotation) = correction(a_j);
        AdjustedCamera::new(&self.cameras[j.0], translation, rotation)
            .project(Point3::new(b_i[0], b_i[1], b_i[2]))
    }

    /// Diagonal inverse covariance of camera `j`'s correction: `1/sigma` for the translation and
    /// the rotation entries.
    pub fn camera_inverse_covariance(&self, _j: CameraId) -> na::Matrix6<f64> {
        let p = 1.0 / self.sigmas.camera_position;
        let r = 1.0 / self.sigmas.camera_pose;
        na::Matrix6::from_diagonal(&na::Vector6::new(p, p, p, r, r, r))
    }

    /// Diagonal inverse covariance of point `i`. Tie points get a zero matrix so that they are
    /// driven only by their observations.
    pub fn point_inverse_covariance(&self, i: PointId) -> na::Matrix3<f64> {
        if self.is_ground_control(i) {
            na::Matrix3::from_diagonal_element(1.0 / self.sigmas.ground_control)
        } else {
            na::Matrix3::zeros()
        }
    }

    /// Distance between observed and projected pixel for every observation, in observation
    /// order.
    pub fn pixel_residuals(&self) -> Vec<f64> {
        self.observations
            .iter()
            .map(|o| {
                let projected =
                    self.projection(o.point, o.camera, &self.a[o.camera.0], &self.b[o.point.0]);
                (o.pixel - projected).magnitude()
            })
            .collect()
    }

    /// Distance moved by every camera center.
    pub fn camera_position_deltas(&self) -> Vec<f64> {
        self.a
            .iter()
            .zip(&self.a_initial)
            .map(|(now, initial)| (now.fixed_rows::<3>(0) - initial.fixed_rows::<3>(0)).norm())
            .collect()
    }

    /// Rotation of every camera away from its initial pose, in degrees.
    pub fn camera_pose_deltas(&self) -> Vec<f64> {
        self.a
            .iter()
            .zip(&self.a_initial)
            .map(|(now, initial)| angle_between_degrees(correction(initial).1, correction(now).1))
            .collect()
    }

    /// Distance moved by every ground control point, in point order.
    pub fn ground_control_point_deltas(&self) -> Vec<f64> {
        self.point_ids()
            .filter(|i| self.is_ground_control(*i))
            .map(|i| (self.b[i.0] - self.b_initial[i.0]).norm())
            .collect()
    }

    /// Base camera `j` with its current correction applied.
    pub fn adjusted_camera(&self, j: CameraId) -> AdjustedCamera<&C> {
        let (translation, rotation) = correction(&self.a[j.0]);
        AdjustedCamera::new(&self.cameras[j.0], translation, rotation)
    }

    /// Save camera `j`'s current correction so it can be re-applied to the base camera later.
    pub fn write_adjustment(&self, j: CameraId, path: &Path) -> Result<()> {
        let (translation, rotation) = correction(&self.a[j.0]);
        write_adjustment(path, translation, rotation)
    }

    /// Current point positions.
    pub fn point_positions(&self) -> Vec<Point3<f64>> {
        self.b.iter().map(|b| Point3::new(b[0], b[1], b[2])).collect()
    }

    /// The control network with every point moved to its current position.
    pub fn adjusted_network(&self) -> ControlNetwork {
        let mut network = self.network.clone();
        for (point, b) in network.points.iter_mut().zip(&self.b) {
            point.position = Point3::new(b[0], b[1], b[2]);
        }
        network
    }
}

impl<C: Camera + Clone> BundleAdjustmentModel<C> {
    /// Every camera with its current correction applied.
    pub fn adjusted_cameras(&self) -> Vec<AdjustedCamera<C>> {
        self.a
            .iter()
            .zip(&self.cameras)
            .map(|(a, camera)| {
                let (translation, rotation) = correction(a);
                AdjustedCamera::new(camera.clone(), translation, rotation)
            })
            .collect()
    }
}

impl<C: Camera> std::fmt::Display for BundleAdjustmentModel<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Bundle adjustment model with {} cameras, {} points ({} ground control), and {} observations",
            self.num_cameras(),
            self.num_points(),
            self.num_ground_control_points(),
            self.num_observations()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::camera::{nadir_camera, PinholeCamera};
    use crate::network::{ControlPoint, ControlPointKind};

    fn sigmas() -> Sigmas {
        Sigmas {
            camera_position: 1.0,
            camera_pose: 1e-2,
            ground_control: 1e-3,
        }
    }

    fn model() -> BundleAdjustmentModel<PinholeCamera> {
        let cameras = vec![nadir_camera(-1.0, 0.0, 10.0), nadir_camera(1.0, 0.0, 10.0)];
        let mut points = Vec::new();
        for (k, p) in [(-1.0, -1.0), (1.0, -1.0), (1.0, 1.0)].iter().enumerate() {
            let kind = if k == 0 {
                ControlPointKind::GroundControl
            } else {
                ControlPointKind::Tie
            };
            let mut cp = ControlPoint::new(Point3::new(p.0, p.1, 0.0), kind);
            for (j, c) in cameras.iter().enumerate() {
                cp.observe(j, c.project(cp.position));
            }
            points.push(cp);
        }
        // never observed
        points.push(ControlPoint::new(
            Point3::new(5.0, 5.0, 5.0),
            ControlPointKind::Tie,
        ));
        BundleAdjustmentModel::new(cameras, ControlNetwork::new(points), sigmas()).unwrap()
    }

    #[test]
    fn deltas_are_zero_after_construction() {
        let m = model();
        assert!(m.camera_position_deltas().iter().all(|x| *x == 0.0));
        assert!(m.camera_pose_deltas().iter().all(|x| *x == 0.0));
        assert!(m.ground_control_point_deltas().iter().all(|x| *x == 0.0));
        assert_eq!(m.ground_control_point_deltas().len(), 1);
    }

    #[test]
    fn counts_and_unobserved_point() {
        let m = model();
        assert_eq!(m.num_cameras(), 2);
        assert_eq!(m.num_points(), 4);
        assert_eq!(m.num_observations(), 6);
        assert!(m.pixel_residuals().iter().all(|x| *x < 1e-9));
        let last = m.point_id(3).unwrap();
        assert_eq!(m.point_parameters(last), &PointVector::new(5.0, 5.0, 5.0));
        assert!(m.point_id(4).is_err());
        assert!(m.camera_id(2).is_err());
    }

    #[test]
    fn projection_is_pure() {
        let m = model();
        let i = m.point_id(0).unwrap();
        let j = m.camera_id(0).unwrap();
        let a = CameraVector::new(0.5, 0.0, 0.0, 0.0, 0.0, 0.0);
        let b = PointVector::new(-1.0, -1.0, 0.0);
        let moved = m.projection(i, j, &a, &b);
        // moving the camera by +0.5 in x moves the image of the point by -50 px in u
        let still = m.projection(i, j, m.camera_parameters(j), &b);
        assert!((still.x - moved.x - 50.0).abs() < 1e-9);
        assert_eq!(m.camera_parameters(j), &CameraVector::zeros());
    }

    #[test]
    fn set_parameters_changes_deltas() {
        let mut m = model();
        let j = m.camera_id(1).unwrap();
        m.set_camera_parameters(j, CameraVector::new(3.0, 4.0, 0.0, 0.0, 0.0, 0.1));
        assert!((m.camera_position_deltas()[1] - 5.0).abs() < 1e-12);
        assert!((m.camera_pose_deltas()[1] - 0.1f64.to_degrees()).abs() < 1e-9);
        assert_eq!(m.camera_position_deltas()[0], 0.0);
        assert_eq!(m.camera_initial(j), &CameraVector::zeros());

        let i = m.point_id(0).unwrap();
        m.set_point_parameters(i, PointVector::new(-1.0, -1.0, 2.0));
        assert!((m.ground_control_point_deltas()[0] - 2.0).abs() < 1e-12);
    }

    #[test]
    fn inverse_covariances() {
        let m = model();
        let c = m.camera_inverse_covariance(m.camera_id(0).unwrap());
        assert_eq!(c[(0, 0)], 1.0);
        assert_eq!(c[(3, 3)], 100.0);
        assert_eq!(c[(0, 1)], 0.0);
        let gcp = m.point_inverse_covariance(m.point_id(0).unwrap());
        assert_eq!(gcp, na::Matrix3::from_diagonal_element(1000.0));
        let tie = m.point_inverse_covariance(m.point_id(1).unwrap());
        assert_eq!(tie, na::Matrix3::zeros());
    }

    #[test]
    fn inverse_covariance_grows_as_sigma_shrinks() {
        let mut previous = 0.0;
        for sigma in &[1.0, 1e-3, 1e-6, 1e-12] {
            let s = Sigmas {
                ground_control: *sigma,
                ..sigmas()
            };
            let m = BundleAdjustmentModel::new(
                vec![nadir_camera(0.0, 0.0, 10.0)],
                ControlNetwork::new(vec![ControlPoint::new(
                    Point3::new(0.0, 0.0, 0.0),
                    ControlPointKind::GroundControl,
                )]),
                s,
            )
            .unwrap();
            let w = m.point_inverse_covariance(m.point_id(0).unwrap())[(0, 0)];
            assert!(w > previous);
            assert_eq!(w, 1.0 / sigma);
            previous = w;
        }
    }

    #[test]
    fn rejects_non_positive_sigma() {
        for bad in &[0.0, -1.0, std::f64::NAN, std::f64::INFINITY] {
            let s = Sigmas {
                camera_pose: *bad,
                ..sigmas()
            };
            match BundleAdjustmentModel::new(
                vec![nadir_camera(0.0, 0.0, 10.0)],
                ControlNetwork::default(),
                s,
            ) {
                Err(Error::Configuration(_)) => (),
                Err(e) => panic!("unexpected error {}", e),
                Ok(_) => panic!("sigma {} accepted", bad),
            }
        }
    }

    #[test]
    fn rejects_unknown_camera() {
        let mut cp = ControlPoint::new(Point3::new(0.0, 0.0, 0.0), ControlPointKind::Tie);
        cp.observe(3, Point2::new(0.0, 0.0));
        match BundleAdjustmentModel::new(
            vec![nadir_camera(0.0, 0.0, 10.0)],
            ControlNetwork::new(vec![cp]),
            sigmas(),
        ) {
            Err(Error::Data(_)) => (),
            Err(e) => panic!("unexpected error {}", e),
            Ok(_) => panic!("observation of a missing camera accepted"),
        }
    }

    #[test]
    fn adjusted_cameras_match_projection() {
        let mut m = model();
        let j = m.camera_id(0).unwrap();
        let a = CameraVector::new(0.1, -0.2, 0.3, 0.01, -0.02, 0.03);
        m.set_camera_parameters(j, a);
        let p = PointVector::new(0.5, 0.5, 0.0);
        let expected = m.projection(m.point_id(0).unwrap(), j, &a, &p);
        let cams = m.adjusted_cameras();
        let got = cams[0].project(Point3::new(0.5, 0.5, 0.0));
        assert!((got - expected).magnitude() < 1e-12);
        let got = m.adjusted_camera(j).project(Point3::new(0.5, 0.5, 0.0));
        assert!((got - expected).magnitude() < 1e-12);
    }

    #[test]
    fn adjustment_file_reproduces_camera() {
        let dir = tempfile::tempdir().unwrap();
        let mut m = model();
        let j = m.camera_id(1).unwrap();
        m.set_camera_parameters(j, CameraVector::new(0.4, 0.3, -0.2, 0.02, 0.01, -0.05));
        let path = dir.path().join("camera.adjust");
        m.write_adjustment(j, &path).unwrap();
        let reloaded = AdjustedCamera::from_adjustment_file(m.cameras()[1].clone(), &path).unwrap();
        for p in &[
            Point3::new(0.0, 0.0, 0.0),
            Point3::new(1.0, -1.0, 0.5),
            Point3::new(-2.0, 3.0, 1.0),
        ] {
            let a = reloaded.project(*p);
            let b = m.adjusted_camera(j).project(*p);
            assert!((a - b).magnitude() < 1e-9);
        }
    }

    #[test]
    fn adjusted_network_moves_points() {
        let mut m = model();
        let i = m.point_id(2).unwrap();
        m.set_point_parameters(i, PointVector::new(7.0, 8.0, 9.0));
        let net = m.adjusted_network();
        assert_eq!(net.points[2].position, Point3::new(7.0, 8.0, 9.0));
        assert_eq!(m.network().points[2].position, Point3::new(1.0, 1.0, 0.0));
    }
}
