use cgmath::{Point3, Vector2};
use photoba::diagnostics::{JsonLinesSink, Statistics};
use photoba::output::write_adjustments;
use photoba::synthetic::{synthetic_rig, RigOptions};
use photoba::*;

fn sigmas(ground_control: f64) -> Sigmas {
    Sigmas {
        camera_position: 1.0,
        camera_pose: 1e-6,
        ground_control,
    }
}

/// Two nadir cameras over four points, the first one ground control. Every observation is
/// shifted by `offset` pixels.
fn two_camera_model(offset: Vector2<f64>, gcp_sigma: f64) -> BundleAdjustmentModel<PinholeCamera> {
    let cameras = vec![
        PinholeCamera::nadir(Point3::new(-1.0, 0.0, 10.0), 1000.0, 500.0),
        PinholeCamera::nadir(Point3::new(1.0, 0.0, 10.0), 1000.0, 500.0),
    ];
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
    BundleAdjustmentModel::new(cameras, ControlNetwork::new(points), sigmas(gcp_sigma)).unwrap()
}

fn run<C: Camera + Sync>(
    model: &mut BundleAdjustmentModel<C>,
    strategy: SolveStrategy,
    norm: ErrorNorm,
) -> Outcome {
    let mut adjuster = Adjuster::new(strategy, norm);
    adjust_bundles(
        model,
        &mut adjuster,
        &DriverOptions {
            max_iterations: 30,
            lambda: Some(1e-2),
        },
        &mut Reporter::silent(),
        None,
    )
    .unwrap()
}

fn mean(values: &[f64]) -> f64 {
    Statistics::from_values(values).mean
}

#[test]
fn two_pixel_offset_is_removed() {
    let mut model = two_camera_model(Vector2::new(2.0, 0.0), 1e-6);
    assert!(mean(&model.pixel_residuals()) > 1.9);
    let outcome = run(&mut model, SolveStrategy::Sparse, ErrorNorm::L2);
    assert!(outcome.state.is_terminal());
    assert!(outcome.iterations <= 30);
    assert!(mean(&model.pixel_residuals()) < 0.5);
    for d in model.camera_position_deltas() {
        assert!(d.is_finite());
        assert!(d > 0.0);
    }
}

#[test]
fn perfect_observations_converge() {
    let mut model = two_camera_model(Vector2::new(0.0, 0.0), 1e-6);
    let outcome = run(&mut model, SolveStrategy::Dense, ErrorNorm::L2);
    assert_eq!(outcome.state, AdjustmentState::Converged);
    assert!(model.camera_position_deltas().iter().all(|d| *d < 1e-9));
}

#[test]
fn ground_control_moves_more_with_looser_sigma() {
    let deltas = [1e-6, 1.0, 100.0]
        .iter()
        .map(|sigma| {
            let mut model = two_camera_model(Vector2::new(2.0, 0.0), *sigma);
            run(&mut model, SolveStrategy::Sparse, ErrorNorm::L2);
            model.ground_control_point_deltas()[0]
        })
        .collect::<Vec<_>>();
    assert!(deltas[0] < 1e-4, "{:?}", deltas);
    assert!(deltas[0] < deltas[1], "{:?}", deltas);
    assert!(deltas[1] < deltas[2], "{:?}", deltas);
}

#[test]
fn dense_and_sparse_agree() {
    let mut dense = two_camera_model(Vector2::new(2.0, -1.0), 1e-3);
    let mut sparse = two_camera_model(Vector2::new(2.0, -1.0), 1e-3);
    let a = run(&mut dense, SolveStrategy::Dense, ErrorNorm::L2);
    let b = run(&mut sparse, SolveStrategy::Sparse, ErrorNorm::L2);
    assert_eq!(a.state, b.state);
    assert_eq!(a.iterations, b.iterations);
    let (pa, pb) = (dense.parameters(), sparse.parameters());
    for (x, y) in pa.cameras.iter().zip(&pb.cameras) {
        assert!((x - y).norm() < 1e-6);
    }
    for (x, y) in pa.points.iter().zip(&pb.points) {
        assert!((x - y).norm() < 1e-6);
    }
}

#[test]
fn cauchy_norm_keeps_outlier_out() {
    let scene = synthetic_rig(&RigOptions {
        num_points: 40,
        ..Default::default()
    });
    let outlier_point = scene
        .network
        .points
        .iter()
        .position(|p| !p.is_ground_control())
        .unwrap();
    let mut network = scene.network.clone();
    network.points[outlier_point].observations[0].pixel.y += 30.0;
    // index of the corrupted observation in model order
    let outlier = network.points[..outlier_point]
        .iter()
        .map(|p| p.observations.len())
        .sum::<usize>();

    let residuals = |norm| {
        let mut model =
            BundleAdjustmentModel::new(scene.cameras.clone(), network.clone(), sigmas(1e-6))
                .unwrap();
        run(&mut model, SolveStrategy::Sparse, norm);
        model.pixel_residuals()
    };
    let l2 = residuals(ErrorNorm::L2);
    let cauchy = residuals(ErrorNorm::Cauchy { threshold: 2.0 });

    assert!(cauchy[outlier] > 20.0, "{}", cauchy[outlier]);
    assert!(cauchy[outlier] > l2[outlier]);
    let mut inliers = cauchy.clone();
    inliers.remove(outlier);
    assert!(Statistics::from_values(&inliers).median < 0.1);
}

#[test]
fn adjustment_files_reproduce_cameras() {
    let dir = tempfile::tempdir().unwrap();
    let mut model = two_camera_model(Vector2::new(2.0, 1.0), 1e-6);
    run(&mut model, SolveStrategy::Dense, ErrorNorm::L2);

    let camera_paths = vec![dir.path().join("left.tsai"), dir.path().join("right.tsai")];
    let written = write_adjustments(&model, &camera_paths, dir.path()).unwrap();
    assert_eq!(written[0], dir.path().join("left.adjust"));

    let p = Point3::new(0.3, -0.4, 0.1);
    for (k, path) in written.iter().enumerate() {
        let j = model.camera_id(k).unwrap();
        let from_file =
            AdjustedCamera::from_adjustment_file(&model.cameras()[k], path).unwrap();
        let expected = model.adjusted_camera(j).project(p);
        let actual = from_file.project(p);
        assert!((expected.x - actual.x).abs() < 1e-6);
        assert!((expected.y - actual.y).abs() < 1e-6);
    }
}

#[test]
fn json_report_has_start_and_end() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("report.jsonl");
    let mut model = two_camera_model(Vector2::new(2.0, 0.0), 1e-6);
    let mut adjuster = Adjuster::new(SolveStrategy::Sparse, ErrorNorm::L2);
    let mut reporter = Reporter::new(20, 1).with_sink(JsonLinesSink::create(&path).unwrap());
    adjust_bundles(
        &mut model,
        &mut adjuster,
        &DriverOptions::default(),
        &mut reporter,
        None,
    )
    .unwrap();

    let text = std::fs::read_to_string(&path).unwrap();
    let lines = text.lines().collect::<Vec<_>>();
    assert!(lines.len() >= 3);
    assert!(lines[0].contains("\"event\":\"start\""));
    assert!(lines[lines.len() - 1].contains("\"event\":\"end\""));
    for line in lines {
        serde_json::from_str::<serde_json::Value>(line).unwrap();
    }
}
