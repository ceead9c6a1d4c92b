//! Conversions between Euler angles and rotations.
//!
//! Camera pose corrections are stored as three Euler angles applied in "xyz" order:
//! `R = Rx(a) * Ry(b) * Rz(c)`. The angles only exist at the parameter-vector boundary; any
//! composition or comparison goes through quaternions.

use cgmath::prelude::*;
use cgmath::{Matrix3, Quaternion, Rad, Vector3};

#[cfg(test)]
use cgmath::AbsDiffEq;

/// Rotation `Rx(angles.x) * Ry(angles.y) * Rz(angles.z)` as a unit quaternion.
pub fn euler_xyz_to_quaternion(angles: Vector3<f64>) -> Quaternion<f64> {
    Quaternion::from_angle_x(Rad(angles.x))
        * Quaternion::from_angle_y(Rad(angles.y))
        * Quaternion::from_angle_z(Rad(angles.z))
}

/// Recover "xyz" Euler angles from a rotation matrix. Inverse of [euler_xyz_to_quaternion] for
/// the middle angle in `[-pi/2, pi/2]`.
pub fn rotation_matrix_to_euler_xyz(m: &Matrix3<f64>) -> Vector3<f64> {
    // cgmath matrices are column major: m[col][row]
    let r02 = m.z.x;
    let r12 = m.z.y;
    let r22 = m.z.z;
    let r01 = m.y.x;
    let r00 = m.x.x;
    let b = r02.max(-1.0).min(1.0).asin();
    if r02.abs() < 1.0 - 1e-12 {
        Vector3::new((-r12).atan2(r22), b, (-r01).atan2(r00))
    } else {
        // gimbal lock, only a + c (or a - c) is observable. Put everything into a.
        let r10 = m.x.y;
        let r11 = m.y.y;
        Vector3::new((r02.signum() * r10).atan2(r11), b, 0.0)
    }
}

pub fn quaternion_to_euler_xyz(q: Quaternion<f64>) -> Vector3<f64> {
    rotation_matrix_to_euler_xyz(&Matrix3::from(q.normalize()))
}

/// Angle of the rotation described by `q`, in radians, in `[0, pi]`.
pub fn rotation_angle(q: Quaternion<f64>) -> f64 {
    let q = q.normalize();
    2.0 * q.v.magnitude().atan2(q.s.abs())
}

/// Angle in degrees of the rotation taking `from` to `to`.
pub fn angle_between_degrees(from: Quaternion<f64>, to: Quaternion<f64>) -> f64 {
    rotation_angle(from.normalize().conjugate() * to.normalize()).to_degrees()
}

#[test]
fn test_euler_identity() {
    let q = euler_xyz_to_quaternion(Vector3::new(0.0, 0.0, 0.0));
    assert!(q.abs_diff_eq(&Quaternion::one(), 1e-15));
    assert_eq!(rotation_angle(q), 0.0);
}

#[test]
fn test_euler_round_trip() {
    let angles = Vector3::new(0.3, -0.7, 1.2);
    let q = euler_xyz_to_quaternion(angles);
    assert!(quaternion_to_euler_xyz(q).abs_diff_eq(&angles, 1e-12));
}

#[test]
fn test_euler_order() {
    // first rotate about z, then y, then x (applied to a vector from the right)
    let angles = Vector3::new(0.1, 0.2, 0.3);
    let q = euler_xyz_to_quaternion(angles);
    let v = Vector3::new(1.0, 2.0, 3.0);
    let expected = Matrix3::from_angle_x(Rad(0.1))
        * Matrix3::from_angle_y(Rad(0.2))
        * Matrix3::from_angle_z(Rad(0.3))
        * v;
    assert!(q.rotate_vector(v).abs_diff_eq(&expected, 1e-12));
}

#[test]
fn test_euler_gimbal_lock() {
    let angles = Vector3::new(0.4, -std::f64::consts::FRAC_PI_2, 0.0);
    let q = euler_xyz_to_quaternion(angles);
    let back = euler_xyz_to_quaternion(quaternion_to_euler_xyz(q));
    assert!(angle_between_degrees(q, back) < 1e-4);
}

#[test]
fn test_angle_between() {
    let a = euler_xyz_to_quaternion(Vector3::new(0.0, 0.0, 0.1));
    let b = euler_xyz_to_quaternion(Vector3::new(0.0, 0.0, 0.4));
    assert!((angle_between_degrees(a, b) - 0.3f64.to_degrees()).abs() < 1e-10);
    // q and -q are the same rotation
    assert!(angle_between_degrees(b, -b).abs() < 1e-10);
}
