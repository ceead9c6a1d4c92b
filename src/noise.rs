//! Functions for adding noise to control networks and cameras.

use cgmath::prelude::*;
use cgmath::{Quaternion, Rad, Vector2, Vector3};
use rand::Rng;
use rand_distr::{Distribution, Normal, StandardNormal};

use crate::camera::PinholeCamera;
use crate::error::{Error, Result};
use crate::network::ControlNetwork;

fn normal(mean: f64, std: f64) -> Result<Normal<f64>> {
    Normal::new(mean, std).map_err(|e| {
        Error::Configuration(format!("invalid standard deviation {}: {}", std, e))
    })
}

fn unit_random<R: Rng>(rng: &mut R) -> Vector3<f64> {
    loop {
        let v = Vector3::new(
            rng.sample(StandardNormal),
            rng.sample(StandardNormal),
            rng.sample(StandardNormal),
        );
        if v.magnitude2() > 1e-12 {
            return v.normalize();
        }
    }
}

fn unit_random2<R: Rng>(rng: &mut R) -> Vector2<f64> {
    let angle = rng.gen_range(0.0..std::f64::consts::PI * 2.0);
    Vector2::new(angle.cos(), angle.sin())
}

/// Shift every observation by a constant pixel offset.
pub fn add_pixel_offset(mut network: ControlNetwork, offset: Vector2<f64>) -> ControlNetwork {
    for point in network.points.iter_mut() {
        for obs in point.observations.iter_mut() {
            obs.pixel += offset;
        }
    }
    network
}

/// Move every observation in a random direction by a normally distributed distance.
pub fn add_pixel_noise<R: Rng>(
    mut network: ControlNetwork,
    std: f64,
    rng: &mut R,
) -> Result<ControlNetwork> {
    let n = normal(0.0, std)?;
    for point in network.points.iter_mut() {
        for obs in point.observations.iter_mut() {
            obs.pixel += unit_random2(rng) * n.sample(rng);
        }
    }
    Ok(network)
}

/// Turn a fraction of the observations into outliers by moving them `magnitude` pixels in a
/// random direction.
pub fn add_outliers<R: Rng>(
    mut network: ControlNetwork,
    chance: f64,
    magnitude: f64,
    rng: &mut R,
) -> ControlNetwork {
    for point in network.points.iter_mut() {
        for obs in point.observations.iter_mut() {
            if rng.gen_bool(chance.max(0.0).min(1.0)) {
                obs.pixel += unit_random2(rng) * magnitude;
            }
        }
    }
    network
}

/// Add Gaussian noise to the initial position of every tie point. Ground control points are left
/// in place.
pub fn perturb_points<R: Rng>(
    mut network: ControlNetwork,
    std: f64,
    rng: &mut R,
) -> Result<ControlNetwork> {
    let n = normal(0.0, std)?;
    for point in network.points.iter_mut().filter(|p| !p.is_ground_control()) {
        point.position += unit_random(rng) * n.sample(rng);
    }
    Ok(network)
}

/// Add Gaussian noise to camera centers and rotate each camera about a random axis by a
/// normally distributed angle (radians).
pub fn perturb_cameras<R: Rng>(
    cameras: Vec<PinholeCamera>,
    translation_std: f64,
    rotation_std: f64,
    rng: &mut R,
) -> Result<Vec<PinholeCamera>> {
    let n_translation = normal(0.0, translation_std)?;
    let n_rotation = normal(0.0, rotation_std)?;
    Ok(cameras
        .into_iter()
        .map(|mut c| {
            c.center += unit_random(rng) * n_translation.sample(rng);
            let r = Quaternion::from_axis_angle(unit_random(rng), Rad(n_rotation.sample(rng)));
            c.rotation = (r * c.rotation).normalize();
            c
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::synthetic::{synthetic_rig, RigOptions};
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn offset_moves_every_observation() {
        let scene = synthetic_rig(&RigOptions {
            num_points: 10,
            ..Default::default()
        });
        let shifted = add_pixel_offset(scene.network.clone(), Vector2::new(2.0, 0.0));
        for (a, b) in scene.network.points.iter().zip(&shifted.points) {
            for (oa, ob) in a.observations.iter().zip(&b.observations) {
                assert_eq!(ob.pixel.x - oa.pixel.x, 2.0);
                assert_eq!(ob.pixel.y, oa.pixel.y);
            }
        }
    }

    #[test]
    fn zero_noise_is_identity() {
        let mut rng = StdRng::seed_from_u64(1);
        let scene = synthetic_rig(&RigOptions::default());
        let noisy = add_pixel_noise(scene.network.clone(), 0.0, &mut rng).unwrap();
        assert_eq!(noisy, scene.network);
        let cameras = perturb_cameras(scene.cameras.clone(), 0.0, 0.0, &mut rng).unwrap();
        for (a, b) in cameras.iter().zip(&scene.cameras) {
            assert_eq!(a.center, b.center);
            assert!((a.rotation - b.rotation).magnitude() < 1e-12);
        }
    }

    #[test]
    fn noise_has_expected_scale() {
        let mut rng = StdRng::seed_from_u64(2);
        let scene = synthetic_rig(&RigOptions::default());
        let noisy = add_pixel_noise(scene.network.clone(), 1.0, &mut rng).unwrap();
        let moved = scene
            .network
            .points
            .iter()
            .zip(&noisy.points)
            .flat_map(|(a, b)| {
                a.observations
                    .iter()
                    .zip(&b.observations)
                    .map(|(oa, ob)| (ob.pixel - oa.pixel).magnitude())
                    .collect::<Vec<_>>()
            })
            .collect::<Vec<_>>();
        let rms = (moved.iter().map(|d| d * d).sum::<f64>() / moved.len() as f64).sqrt();
        assert!(rms > 0.7 && rms < 1.3, "rms {}", rms);
        assert!(add_pixel_noise(scene.network, -1.0, &mut rng).is_err());
    }

    #[test]
    fn ground_control_points_are_not_perturbed() {
        let mut rng = StdRng::seed_from_u64(3);
        let scene = synthetic_rig(&RigOptions::default());
        let moved = perturb_points(scene.network.clone(), 0.5, &mut rng).unwrap();
        for (a, b) in scene.network.points.iter().zip(&moved.points) {
            if a.is_ground_control() {
                assert_eq!(a.position, b.position);
            }
        }
        assert!(scene
            .network
            .points
            .iter()
            .zip(&moved.points)
            .any(|(a, b)| a.position != b.position));
    }

    #[test]
    fn outliers() {
        let mut rng = StdRng::seed_from_u64(4);
        let scene = synthetic_rig(&RigOptions::default());
        let all = add_outliers(scene.network.clone(), 1.0, 50.0, &mut rng);
        for (a, b) in scene.network.points.iter().zip(&all.points) {
            for (oa, ob) in a.observations.iter().zip(&b.observations) {
                assert!(((ob.pixel - oa.pixel).magnitude() - 50.0).abs() < 1e-9);
            }
        }
        let none = add_outliers(scene.network.clone(), 0.0, 50.0, &mut rng);
        assert_eq!(none, scene.network);
    }
}
