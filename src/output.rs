//! Files written by an adjustment run.
//!
//! All text files are tab separated with one camera or point per line.

use std::collections::HashSet;
use std::fs::{create_dir_all, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use crate::camera::Camera;
use crate::error::{Error, Result};
use crate::model::BundleAdjustmentModel;
use crate::rotation::quaternion_to_euler_xyz;

pub const INITIAL_CAMERA_FILE: &str = "cam_initial.txt";
pub const INITIAL_POINT_FILE: &str = "wp_initial.txt";
pub const FINAL_CAMERA_FILE: &str = "cam_final.txt";
pub const FINAL_POINT_FILE: &str = "wp_final.txt";
pub const ITERATION_CAMERA_FILE: &str = "iterCameraParam.txt";
pub const ITERATION_POINT_FILE: &str = "iterPointsParam.txt";

fn join_values<I: IntoIterator<Item = f64>>(values: I) -> String {
    values
        .into_iter()
        .map(|v| v.to_string())
        .collect::<Vec<_>>()
        .join("\t")
}

/// Write the adjusted center and pose (as "xyz" Euler angles) of every camera.
pub fn write_camera_snapshot<C: Camera>(
    model: &BundleAdjustmentModel<C>,
    path: &Path,
) -> Result<()> {
    let mut f = BufWriter::new(File::create(path)?);
    for j in model.camera_ids() {
        let camera = model.adjusted_camera(j);
        let c = camera.center();
        let e = quaternion_to_euler_xyz(camera.pose());
        writeln!(f, "{}", join_values(vec![c.x, c.y, c.z, e.x, e.y, e.z]))?;
    }
    f.flush()?;
    Ok(())
}

/// Write the current position of every point.
pub fn write_point_snapshot<C: Camera>(model: &BundleAdjustmentModel<C>, path: &Path) -> Result<()> {
    let mut f = BufWriter::new(File::create(path)?);
    for p in model.point_positions() {
        writeln!(f, "{}", join_values(vec![p.x, p.y, p.z]))?;
    }
    f.flush()?;
    Ok(())
}

/// Write both the camera and point snapshots into `dir`.
pub fn write_snapshots<C: Camera>(
    model: &BundleAdjustmentModel<C>,
    dir: &Path,
    camera_file: &str,
    point_file: &str,
) -> Result<()> {
    write_camera_snapshot(model, &dir.join(camera_file))?;
    write_point_snapshot(model, &dir.join(point_file))
}

/// Per iteration camera and point parameters. Both files are truncated on creation and flushed
/// after every append.
pub struct IterationReport {
    cameras: BufWriter<File>,
    points: BufWriter<File>,
}

impl IterationReport {
    pub fn create(dir: &Path) -> Result<Self> {
        Ok(IterationReport {
            cameras: BufWriter::new(File::create(dir.join(ITERATION_CAMERA_FILE))?),
            points: BufWriter::new(File::create(dir.join(ITERATION_POINT_FILE))?),
        })
    }

    pub fn append<C: Camera>(
        &mut self,
        iteration: usize,
        model: &BundleAdjustmentModel<C>,
    ) -> Result<()> {
        for j in model.camera_ids() {
            writeln!(
                self.cameras,
                "{}\t{}\t{}",
                iteration,
                j.index(),
                join_values(model.camera_parameters(j).iter().cloned())
            )?;
        }
        for i in model.point_ids() {
            writeln!(
                self.points,
                "{}\t{}\t{}",
                iteration,
                i.index(),
                join_values(model.point_parameters(i).iter().cloned())
            )?;
        }
        self.cameras.flush()?;
        self.points.flush()?;
        Ok(())
    }
}

/// Path of the adjustment file for `camera_path` inside `dir`. The camera path is taken relative
/// to `dir` when it lies below it, so cameras from different subdirectories keep separate files.
/// The extension is replaced by `adjust`.
pub fn adjustment_path(dir: &Path, camera_path: &Path) -> Result<PathBuf> {
    if camera_path.file_name().is_none() {
        return Err(Error::Configuration(format!(
            "camera path {:?} has no file name",
            camera_path
        )));
    }
    let relative = camera_path.strip_prefix(dir).unwrap_or(camera_path);
    Ok(dir.join(relative).with_extension("adjust"))
}

/// Write the correction of every camera to `dir`. `camera_paths` are the files the cameras were
/// loaded from, in model order. Two cameras mapping to the same adjustment file is an error.
pub fn write_adjustments<C: Camera>(
    model: &BundleAdjustmentModel<C>,
    camera_paths: &[PathBuf],
    dir: &Path,
) -> Result<Vec<PathBuf>> {
    if camera_paths.len() != model.num_cameras() {
        return Err(Error::Data(format!(
            "{} camera paths for {} cameras",
            camera_paths.len(),
            model.num_cameras()
        )));
    }
    let paths = camera_paths
        .iter()
        .map(|camera_path| adjustment_path(dir, camera_path))
        .collect::<Result<Vec<_>>>()?;
    let mut seen = HashSet::new();
    for (camera_path, path) in camera_paths.iter().zip(&paths) {
        if !seen.insert(path) {
            return Err(Error::Data(format!(
                "camera {:?} writes its adjustment to {:?}, which is already used by another camera",
                camera_path, path
            )));
        }
    }

    for (j, path) in model.camera_ids().zip(&paths) {
        if let Some(parent) = path.parent() {
            create_dir_all(parent)?;
        }
        model.write_adjustment(j, path)?;
    }
    Ok(paths)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::camera::{nadir_camera, read_adjustment};
    use crate::model::{CameraVector, Sigmas};
    use crate::network::{ControlNetwork, ControlPoint, ControlPointKind};
    use cgmath::Point3;

    fn model() -> BundleAdjustmentModel<crate::camera::PinholeCamera> {
        let mut cp = ControlPoint::new(Point3::new(1.0, 2.0, 3.0), ControlPointKind::Tie);
        cp.observe(0, cgmath::Point2::new(10.0, 20.0));
        BundleAdjustmentModel::new(
            vec![nadir_camera(0.0, 0.0, 10.0), nadir_camera(5.0, 0.0, 10.0)],
            ControlNetwork::new(vec![cp]),
            Sigmas {
                camera_position: 1.0,
                camera_pose: 1.0,
                ground_control: 1.0,
            },
        )
        .unwrap()
    }

    #[test]
    fn snapshots() {
        let dir = tempfile::tempdir().unwrap();
        let mut m = model();
        let j = m.camera_id(1).unwrap();
        m.set_camera_parameters(j, CameraVector::new(1.0, 0.0, 0.0, 0.0, 0.0, 0.0));
        write_snapshots(&m, dir.path(), FINAL_CAMERA_FILE, FINAL_POINT_FILE).unwrap();

        let cameras = std::fs::read_to_string(dir.path().join(FINAL_CAMERA_FILE)).unwrap();
        let rows = cameras
            .lines()
            .map(|l| {
                l.split('\t')
                    .map(|v| v.parse::<f64>().unwrap())
                    .collect::<Vec<_>>()
            })
            .collect::<Vec<_>>();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[1].len(), 6);
        assert_eq!(&rows[1][..3], &[6.0, 0.0, 10.0]);

        let points = std::fs::read_to_string(dir.path().join(FINAL_POINT_FILE)).unwrap();
        assert_eq!(points.trim(), "1\t2\t3");
    }

    #[test]
    fn iteration_report_truncates_and_appends() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(ITERATION_CAMERA_FILE), "stale\n").unwrap();
        let m = model();
        let mut report = IterationReport::create(dir.path()).unwrap();
        report.append(1, &m).unwrap();
        report.append(2, &m).unwrap();
        let cameras = std::fs::read_to_string(dir.path().join(ITERATION_CAMERA_FILE)).unwrap();
        let lines = cameras.lines().collect::<Vec<_>>();
        assert_eq!(lines.len(), 4);
        assert!(lines[3].starts_with("2\t1\t"));
        let points = std::fs::read_to_string(dir.path().join(ITERATION_POINT_FILE)).unwrap();
        assert_eq!(points.lines().next(), Some("1\t0\t1\t2\t3"));
    }

    #[test]
    fn adjustments_per_camera() {
        let dir = tempfile::tempdir().unwrap();
        let mut m = model();
        let j = m.camera_id(0).unwrap();
        m.set_camera_parameters(j, CameraVector::new(0.5, 0.0, 0.0, 0.0, 0.0, 0.0));
        let paths = write_adjustments(
            &m,
            &[dir.path().join("left.tsai"), PathBuf::from("right.tsai")],
            dir.path(),
        )
        .unwrap();
        assert_eq!(paths[0], dir.path().join("left.adjust"));
        assert_eq!(paths[1], dir.path().join("right.adjust"));
        let (t, _) = read_adjustment(&paths[0]).unwrap();
        assert_eq!(t.x, 0.5);

        assert!(write_adjustments(&m, &[PathBuf::from("a.tsai")], dir.path()).is_err());
    }

    #[test]
    fn same_name_in_different_directories() {
        let dir = Path::new("/data");
        let first = adjustment_path(dir, Path::new("run1/left.tsai")).unwrap();
        let second = adjustment_path(dir, Path::new("run2/left.tsai")).unwrap();
        assert_ne!(first, second);
        assert_eq!(first, Path::new("/data/run1/left.adjust"));
        assert_eq!(
            adjustment_path(dir, Path::new("/data/run2/left.tsai")).unwrap(),
            second
        );
        assert!(adjustment_path(dir, Path::new("")).is_err());

        let out = tempfile::tempdir().unwrap();
        let m = model();
        let paths = write_adjustments(
            &m,
            &[
                out.path().join("run1").join("left.tsai"),
                out.path().join("run2").join("left.tsai"),
            ],
            out.path(),
        )
        .unwrap();
        assert!(paths[0].is_file());
        assert!(paths[1].is_file());
        assert_ne!(paths[0], paths[1]);

        match write_adjustments(
            &m,
            &[PathBuf::from("left.tsai"), PathBuf::from("left.pinhole")],
            out.path(),
        ) {
            Err(Error::Data(msg)) => assert!(msg.contains("already used")),
            other => panic!("expected a data error, got {:?}", other),
        }
    }
}
