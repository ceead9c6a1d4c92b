//! Camera models and the pose-corrected camera used during bundle adjustment.

use cgmath::prelude::*;
use cgmath::{Matrix3, Point2, Point3, Quaternion, Vector2, Vector3};
use nom::character::complete::{char, line_ending, multispace0, space0, space1};
use nom::bytes::complete::take_while1;
use nom::error::VerboseError;
use nom::multi::{many0, separated_list1};
use nom::number::complete::double;
use nom::sequence::{delimited, separated_pair, terminated};
use nom::IResult;

use std::fs::File;
use std::io::{BufWriter, Read, Write};
use std::path::Path;

#[cfg(test)]
use cgmath::AbsDiffEq;

use crate::error::{extension_of, Error, Result};
use crate::rotation::euler_xyz_to_quaternion;

/// A camera that can map world points into pixels.
pub trait Camera {
    /// Project a world point to pixel coordinates.
    fn project(&self, p: Point3<f64>) -> Point2<f64>;

    /// Center of the camera in world coordinates.
    fn center(&self) -> Point3<f64>;

    /// Rotation from the camera frame into the world frame.
    fn pose(&self) -> Quaternion<f64>;
}

impl<'a, C: Camera + ?Sized> Camera for &'a C {
    fn project(&self, p: Point3<f64>) -> Point2<f64> {
        (**self).project(p)
    }

    fn center(&self) -> Point3<f64> {
        (**self).center()
    }

    fn pose(&self) -> Quaternion<f64> {
        (**self).pose()
    }
}

/// Ideal pinhole camera. The camera looks down its positive z axis, pixel `u` increases along
/// camera x and pixel `v` along camera y.
#[derive(Debug, Clone, PartialEq)]
pub struct PinholeCamera {
    pub center: Point3<f64>,
    /// Camera to world rotation.
    pub rotation: Quaternion<f64>,
    /// Focal length in pixels along u and v.
    pub focal: Vector2<f64>,
    /// Principal point in pixels.
    pub principal: Vector2<f64>,
}

impl Camera for PinholeCamera {
    fn project(&self, p: Point3<f64>) -> Point2<f64> {
        let local = self.rotation.conjugate().rotate_vector(p - self.center);
        Point2::new(
            self.focal.x * local.x / local.z + self.principal.x,
            self.focal.y * local.y / local.z + self.principal.y,
        )
    }

    fn center(&self) -> Point3<f64> {
        self.center
    }

    fn pose(&self) -> Quaternion<f64> {
        self.rotation
    }
}

type ParseResult<'a, T> = IResult<&'a str, T, VerboseError<&'a str>>;

fn parse_key_values(input: &str) -> ParseResult<'_, Vec<(&str, Vec<f64>)>> {
    many0(delimited(
        multispace0,
        separated_pair(
            take_while1(|c: char| c.is_alphanumeric() || c == '_'),
            delimited(space0, char('='), space0),
            separated_list1(space1, double),
        ),
        multispace0,
    ))(input)
}

fn parse_number_lines(input: &str) -> ParseResult<'_, Vec<Vec<f64>>> {
    many0(terminated(
        delimited(space0, separated_list1(space1, double), space0),
        many0(line_ending),
    ))(input)
}

fn read_to_string(path: &Path) -> Result<String> {
    let mut contents = String::new();
    File::open(path)?.read_to_string(&mut contents)?;
    Ok(contents)
}

fn leftover_error(path: &Path, rest: &str) -> Error {
    Error::Parse(format!(
        "{}: could not parse line starting at \"{}\"",
        path.display(),
        rest.lines().next().unwrap_or("")
    ))
}

impl PinholeCamera {
    pub fn new(
        center: Point3<f64>,
        rotation: Quaternion<f64>,
        focal: Vector2<f64>,
        principal: Vector2<f64>,
    ) -> Self {
        PinholeCamera {
            center,
            rotation: rotation.normalize(),
            focal,
            principal,
        }
    }

    /// Camera at `center` looking straight down the world -z axis, with image x along world x
    /// and image y along world -y.
    pub fn nadir(center: Point3<f64>, focal: f64, principal: f64) -> Self {
        PinholeCamera::new(
            center,
            Quaternion::from(Matrix3::new(1.0, 0.0, 0.0, 0.0, -1.0, 0.0, 0.0, 0.0, -1.0)),
            Vector2::new(focal, focal),
            Vector2::new(principal, principal),
        )
    }

    /// Read a camera in the `key = values` text format:
    ///
    /// ```txt
    /// fu = <focal length u>
    /// fv = <focal length v>
    /// cu = <principal point u>
    /// cv = <principal point v>
    /// C = <x> <y> <z>
    /// R = <r00> <r01> <r02> <r10> <r11> <r12> <r20> <r21> <r22>
    /// ```
    /// `R` is the row major camera to world rotation.
    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = read_to_string(path)?;
        let (rest, pairs) = parse_key_values(&contents).map_err(|e| match e {
            nom::Err::Error(e) | nom::Err::Failure(e) => {
                Error::Parse(nom::error::convert_error(contents.as_str(), e))
            }
            nom::Err::Incomplete(x) => Error::Parse(format!("{:?}", x)),
        })?;
        if !rest.trim().is_empty() {
            return Err(leftover_error(path, rest));
        }

        let get = |key: &str, len: usize| -> Result<&Vec<f64>> {
            let values = pairs
                .iter()
                .find(|(k, _)| *k == key)
                .map(|(_, v)| v)
                .ok_or_else(|| {
                    Error::Parse(format!("{}: missing key {}", path.display(), key))
                })?;
            if values.len() != len {
                return Err(Error::Parse(format!(
                    "{}: expected {} values for {}, found {}",
                    path.display(),
                    len,
                    key,
                    values.len()
                )));
            }
            Ok(values)
        };

        let c = get("C", 3)?;
        let r = get("R", 9)?;
        let m = Matrix3::from_cols(
            Vector3::new(r[0], r[3], r[6]),
            Vector3::new(r[1], r[4], r[7]),
            Vector3::new(r[2], r[5], r[8]),
        );
        if (m.determinant() - 1.0).abs() > 1e-6 {
            return Err(Error::Parse(format!(
                "{}: R is not a rotation matrix",
                path.display()
            )));
        }

        Ok(PinholeCamera::new(
            Point3::new(c[0], c[1], c[2]),
            Quaternion::from(m),
            Vector2::new(get("fu", 1)?[0], get("fv", 1)?[0]),
            Vector2::new(get("cu", 1)?[0], get("cv", 1)?[0]),
        ))
    }

    pub fn write(&self, path: &Path) -> Result<()> {
        let mut file = BufWriter::new(File::create(path)?);
        writeln!(file, "fu = {}", self.focal.x)?;
        writeln!(file, "fv = {}", self.focal.y)?;
        writeln!(file, "cu = {}", self.principal.x)?;
        writeln!(file, "cv = {}", self.principal.y)?;
        writeln!(
            file,
            "C = {} {} {}",
            self.center.x, self.center.y, self.center.z
        )?;
        let m = Matrix3::from(self.rotation);
        let rows = (0..3)
            .map(|i| m.row(i))
            .flat_map(|r| vec![r.x, r.y, r.z])
            .map(|x| x.to_string())
            .collect::<Vec<_>>();
        writeln!(file, "R = {}", rows.join(" "))?;
        file.flush()?;
        Ok(())
    }
}

/// Load a camera model, choosing the format from the file extension.
pub fn load_camera(path: &Path) -> Result<PinholeCamera> {
    match extension_of(path)?.as_str() {
        "tsai" | "pinhole" => PinholeCamera::from_file(path),
        ext => Err(Error::Configuration(format!(
            "unknown camera file extension {} ({})",
            ext,
            path.display()
        ))),
    }
}

/// A base camera with a position and pose correction applied.
///
/// The corrected camera center is `base.center() + translation` and the corrected pose is
/// `rotation * base.pose()`, with the rotation taking place around the camera center.
#[derive(Debug, Clone)]
pub struct AdjustedCamera<C: Camera> {
    pub base: C,
    pub translation: Vector3<f64>,
    pub rotation: Quaternion<f64>,
}

impl<C: Camera> AdjustedCamera<C> {
    pub fn new(base: C, translation: Vector3<f64>, rotation: Quaternion<f64>) -> Self {
        AdjustedCamera {
            base,
            translation,
            rotation: rotation.normalize(),
        }
    }

    /// Build from a translation and a rotation given as "xyz" Euler angles.
    pub fn from_euler(base: C, translation: Vector3<f64>, euler: Vector3<f64>) -> Self {
        AdjustedCamera::new(base, translation, euler_xyz_to_quaternion(euler))
    }

    /// Re-apply a correction previously saved with [write_adjustment].
    pub fn from_adjustment_file(base: C, path: &Path) -> Result<Self> {
        let (translation, rotation) = read_adjustment(path)?;
        Ok(AdjustedCamera::new(base, translation, rotation))
    }
}

impl<C: Camera> Camera for AdjustedCamera<C> {
    fn project(&self, p: Point3<f64>) -> Point2<f64> {
        let c = self.base.center();
        let offset = self.rotation.conjugate().rotate_vector(p - c - self.translation);
        self.base.project(c + offset)
    }

    fn center(&self) -> Point3<f64> {
        self.base.center() + self.translation
    }

    fn pose(&self) -> Quaternion<f64> {
        self.rotation * self.base.pose()
    }
}

/// Write a camera correction as two lines: the translation and the rotation quaternion
/// (`w x y z`).
pub fn write_adjustment(
    path: &Path,
    translation: Vector3<f64>,
    rotation: Quaternion<f64>,
) -> Result<()> {
    let mut file = BufWriter::new(File::create(path)?);
    writeln!(
        file,
        "{} {} {}",
        translation.x, translation.y, translation.z
    )?;
    writeln!(
        file,
        "{} {} {} {}",
        rotation.s, rotation.v.x, rotation.v.y, rotation.v.z
    )?;
    file.flush()?;
    Ok(())
}

pub fn read_adjustment(path: &Path) -> Result<(Vector3<f64>, Quaternion<f64>)> {
    let contents = read_to_string(path)?;
    let (rest, lines) = parse_number_lines(&contents)
        .map_err(|_| Error::Parse(format!("{}: malformed adjustment", path.display())))?;
    if !rest.trim().is_empty() {
        return Err(leftover_error(path, rest));
    }
    match lines.as_slice() {
        [t, q] if t.len() == 3 && q.len() == 4 => Ok((
            Vector3::new(t[0], t[1], t[2]),
            Quaternion::new(q[0], q[1], q[2], q[3]),
        )),
        _ => Err(Error::Parse(format!(
            "{}: expected a translation line and a quaternion line",
            path.display()
        ))),
    }
}

#[cfg(test)]
pub(crate) fn nadir_camera(x: f64, y: f64, height: f64) -> PinholeCamera {
    PinholeCamera::nadir(Point3::new(x, y, height), 1000.0, 500.0)
}

#[test]
fn test_project_principal_point() {
    let c = nadir_camera(1.0, 2.0, 10.0);
    let uv = c.project(Point3::new(1.0, 2.0, 0.0));
    assert!(uv.abs_diff_eq(&Point2::new(500.0, 500.0), 1e-9));
    let uv = c.project(Point3::new(2.0, 2.0, 0.0));
    assert!(uv.abs_diff_eq(&Point2::new(600.0, 500.0), 1e-9));
}

#[test]
fn test_identity_adjustment() {
    let c = nadir_camera(0.0, 0.0, 10.0);
    let a = AdjustedCamera::new(&c, Vector3::zero(), Quaternion::one());
    let p = Point3::new(0.3, -0.2, 1.0);
    assert!(a.project(p).abs_diff_eq(&c.project(p), 1e-12));
    assert!(a.center().abs_diff_eq(&c.center(), 1e-12));
}

#[test]
fn test_adjusted_center_and_pose() {
    let c = nadir_camera(0.0, 0.0, 10.0);
    let q = euler_xyz_to_quaternion(Vector3::new(0.0, 0.0, 0.2));
    let a = AdjustedCamera::new(&c, Vector3::new(1.0, 0.0, 0.0), q);
    assert!(a.center().abs_diff_eq(&Point3::new(1.0, 0.0, 10.0), 1e-12));
    // a point straight below the new center still lands on the principal point
    assert!(a
        .project(Point3::new(1.0, 0.0, 0.0))
        .abs_diff_eq(&Point2::new(500.0, 500.0), 1e-9));
    assert!(a.pose().abs_diff_eq(&(q * c.pose()), 1e-12));
}

#[test]
fn test_camera_file_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("cam.tsai");
    let c = PinholeCamera::new(
        Point3::new(10.0, -3.5, 1200.25),
        euler_xyz_to_quaternion(Vector3::new(3.1, 0.2, -0.4)),
        Vector2::new(1500.0, 1490.0),
        Vector2::new(640.0, 512.0),
    );
    c.write(&path).unwrap();
    let d = load_camera(&path).unwrap();
    let p = Point3::new(30.0, 20.0, 0.0);
    assert!(c.project(p).abs_diff_eq(&d.project(p), 1e-6));
    assert!(c.center().abs_diff_eq(&d.center(), 1e-12));
}

#[test]
fn test_unknown_camera_extension() {
    match load_camera(Path::new("camera.cahvor")) {
        Err(Error::Configuration(_)) => (),
        x => panic!("expected configuration error, got {:?}", x),
    }
}

#[test]
fn test_adjustment_file_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("cam.adjust");
    let t = Vector3::new(0.25, -1.5, 3.0);
    let q = euler_xyz_to_quaternion(Vector3::new(0.01, -0.02, 0.03));
    write_adjustment(&path, t, q).unwrap();
    let (t2, q2) = read_adjustment(&path).unwrap();
    assert_eq!(t, t2);
    assert_eq!(q, q2);
}
