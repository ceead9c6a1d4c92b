//! Estimate the pixel translation window between two images from interest point matches.
//!
//! Matches are filtered by fitting a rotation plus translation with RANSAC. The window is the
//! bounding box of the inlier translations grown by half its size. If no model can be fit, a
//! fixed window around the origin is returned instead.

use cgmath::prelude::*;
use cgmath::{Basis2, Point2, Rad, Vector2};
use image::GrayImage;
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::Serialize;
use tracing::{debug, info, warn};

use std::path::{Path, PathBuf};

use crate::error::Result;
use crate::interest::{
    match_interest_points, read_interest_point_file, read_match_file, remove_duplicates,
    write_interest_point_file, write_match_file, InterestPoint, InterestPointDetector,
};

/// Integer window with an exclusive upper corner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SearchRange {
    pub min_x: i32,
    pub min_y: i32,
    pub max_x: i32,
    pub max_y: i32,
}

impl SearchRange {
    /// Returned when the matches can not be trusted.
    pub const FALLBACK: SearchRange = SearchRange {
        min_x: -10,
        min_y: -10,
        max_x: 10,
        max_y: 10,
    };

    pub fn new(x: i32, y: i32, width: i32, height: i32) -> Self {
        SearchRange {
            min_x: x,
            min_y: y,
            max_x: x + width,
            max_y: y + height,
        }
    }

    pub fn width(&self) -> i32 {
        self.max_x - self.min_x
    }

    pub fn height(&self) -> i32 {
        self.max_y - self.min_y
    }

    pub fn contains(&self, x: i32, y: i32) -> bool {
        x >= self.min_x && x < self.max_x && y >= self.min_y && y < self.max_y
    }

    /// Bounding box of `translations`, grown by a quarter of its size on each side.
    pub fn from_translations(translations: &[Vector2<i32>]) -> Option<Self> {
        let (first, rest) = translations.split_first()?;
        let mut range = SearchRange {
            min_x: first.x,
            min_y: first.y,
            max_x: first.x + 1,
            max_y: first.y + 1,
        };
        for t in rest {
            range.min_x = range.min_x.min(t.x);
            range.min_y = range.min_y.min(t.y);
            range.max_x = range.max_x.max(t.x);
            range.max_y = range.max_y.max(t.y);
        }
        let (dx, dy) = (range.width() / 4, range.height() / 4);
        range.min_x -= dx;
        range.min_y -= dy;
        range.max_x += dx;
        range.max_y += dy;
        Some(range)
    }
}

impl std::fmt::Display for SearchRange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "[{}, {}, {}, {}]",
            self.min_x,
            self.min_y,
            self.width(),
            self.height()
        )
    }
}

/// Rotation about the origin followed by a translation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RigidTransform2 {
    pub angle: f64,
    pub translation: Vector2<f64>,
}

impl RigidTransform2 {
    pub fn apply(&self, p: Point2<f64>) -> Point2<f64> {
        Basis2::from_angle(Rad(self.angle)).rotate_point(p) + self.translation
    }

    /// Least squares fit mapping `from` onto `to`. `None` if `from` has no spatial extent.
    pub fn fit(from: &[Point2<f64>], to: &[Point2<f64>]) -> Option<Self> {
        if from.is_empty() || from.len() != to.len() {
            return None;
        }
        let n = from.len() as f64;
        let cf = from.iter().fold(Vector2::zero(), |acc, p| acc + p.to_vec()) / n;
        let ct = to.iter().fold(Vector2::zero(), |acc, p| acc + p.to_vec()) / n;
        let (mut dot, mut cross, mut spread) = (0.0, 0.0, 0.0);
        for (f, t) in from.iter().zip(to) {
            let a = f.to_vec() - cf;
            let b = t.to_vec() - ct;
            dot += a.dot(b);
            cross += a.perp_dot(b);
            spread += a.magnitude2();
        }
        if spread < 1e-12 {
            return None;
        }
        let angle = cross.atan2(dot);
        let rotated = Basis2::from_angle(Rad(angle)).rotate_vector(cf);
        Some(RigidTransform2 {
            angle,
            translation: ct - rotated,
        })
    }
}

#[derive(Debug, Clone)]
pub struct SearchRangeEstimator {
    pub trials: usize,
    /// Pixels.
    pub inlier_threshold: f64,
    pub min_inliers: usize,
    /// Descriptor ratio test for matching.
    pub ratio: f32,
    pub seed: u64,
    /// Show a progress bar while matching.
    pub verbose: bool,
}

impl Default for SearchRangeEstimator {
    fn default() -> Self {
        SearchRangeEstimator {
            trials: 100,
            inlier_threshold: 25.0,
            min_inliers: 5,
            ratio: 0.8,
            seed: 0,
            verbose: false,
        }
    }
}

fn location(p: &InterestPoint) -> Point2<f64> {
    Point2::new(p.x as f64, p.y as f64)
}

/// `<path without extension><suffix>`
fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut s = path.with_extension("").into_os_string();
    s.push(suffix);
    PathBuf::from(s)
}

/// Interest point cache for `image`.
pub fn interest_point_file(image: &Path) -> PathBuf {
    with_suffix(image, ".vwip")
}

/// Match cache for a pair of images, next to the left image.
pub fn match_file(left: &Path, right: &Path) -> PathBuf {
    let right_stem = right
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    with_suffix(left, &format!("__{}.match", right_stem))
}

impl SearchRangeEstimator {
    fn inliers(
        &self,
        model: &RigidTransform2,
        left: &[Point2<f64>],
        right: &[Point2<f64>],
    ) -> Vec<usize> {
        left.iter()
            .zip(right)
            .enumerate()
            .filter(|(_, (l, r))| (model.apply(**l) - **r).magnitude() < self.inlier_threshold)
            .map(|(i, _)| i)
            .collect()
    }

    /// Fit a rigid transform from `left` to `right` with RANSAC. Returns the model and the
    /// indices of its inliers, or `None` if fewer than `min_inliers` agree on any model.
    pub fn fit(
        &self,
        left: &[Point2<f64>],
        right: &[Point2<f64>],
    ) -> Option<(RigidTransform2, Vec<usize>)> {
        let n = left.len().min(right.len());
        if n < 2 || n < self.min_inliers {
            return None;
        }
        let mut rng = StdRng::seed_from_u64(self.seed);
        let mut best: Option<(RigidTransform2, Vec<usize>)> = None;
        for _ in 0..self.trials {
            let sample = rand::seq::index::sample(&mut rng, n, 2);
            let from = sample.iter().map(|i| left[i]).collect::<Vec<_>>();
            let to = sample.iter().map(|i| right[i]).collect::<Vec<_>>();
            let model = match RigidTransform2::fit(&from, &to) {
                Some(m) => m,
                None => continue,
            };
            let inliers = self.inliers(&model, &left[..n], &right[..n]);
            if best.as_ref().map_or(true, |(_, b)| inliers.len() > b.len()) {
                best = Some((model, inliers));
            }
        }

        let (model, inliers) = best?;
        if inliers.len() < self.min_inliers {
            return None;
        }
        // refine on the consensus set
        let from = inliers.iter().map(|i| left[*i]).collect::<Vec<_>>();
        let to = inliers.iter().map(|i| right[*i]).collect::<Vec<_>>();
        if let Some(refined) = RigidTransform2::fit(&from, &to) {
            let refined_inliers = self.inliers(&refined, &left[..n], &right[..n]);
            if refined_inliers.len() >= inliers.len() {
                return Some((refined, refined_inliers));
            }
        }
        Some((model, inliers))
    }

    /// Window from already filtered matches. Translations are divided by `scale`.
    pub fn range_from_inliers(
        &self,
        left: &[Point2<f64>],
        right: &[Point2<f64>],
        scale: f64,
    ) -> SearchRange {
        let translations = left
            .iter()
            .zip(right)
            .map(|(l, r)| {
                ((*r - *l) / scale)
                    .map(f64::round)
                    .cast::<i32>()
                    .unwrap_or_else(Vector2::zero)
            })
            .collect::<Vec<_>>();
        match SearchRange::from_translations(&translations) {
            Some(range) => range,
            None => {
                warn!("no matches to estimate a search range from, using {}", SearchRange::FALLBACK);
                SearchRange::FALLBACK
            }
        }
    }

    /// Window from raw matches: outliers are rejected first.
    pub fn range_from_matches(
        &self,
        left: &[Point2<f64>],
        right: &[Point2<f64>],
        scale: f64,
    ) -> SearchRange {
        match self.fit(left, right) {
            Some((model, inliers)) => {
                debug!(
                    "RANSAC found {} inliers, angle {:.4}, translation ({:.2}, {:.2})",
                    inliers.len(),
                    model.angle,
                    model.translation.x,
                    model.translation.y
                );
                let l = inliers.iter().map(|i| left[*i]).collect::<Vec<_>>();
                let r = inliers.iter().map(|i| right[*i]).collect::<Vec<_>>();
                self.range_from_inliers(&l, &r, scale)
            }
            None => {
                warn!(
                    "RANSAC failed on {} matches, unable to detect the search range. Using {}",
                    left.len(),
                    SearchRange::FALLBACK
                );
                SearchRange::FALLBACK
            }
        }
    }

    fn interest_points(
        &self,
        image_path: &Path,
        detector: &dyn InterestPointDetector,
    ) -> Result<Vec<InterestPoint>> {
        let cache = interest_point_file(image_path);
        if cache.exists() {
            debug!("using cached interest points {}", cache.display());
            return read_interest_point_file(&cache);
        }
        let image: GrayImage = image::open(image_path)?.to_luma8();
        let points = detector.detect(&image);
        info!("located {} points in {}", points.len(), image_path.display());
        write_interest_point_file(&cache, &points)?;
        Ok(points)
    }

    /// Estimate the search window between two image files. Interest points and inlier matches
    /// are cached next to the images and reused on later calls.
    pub fn estimate(
        &self,
        left_image: &Path,
        right_image: &Path,
        scale: f64,
        detector: &dyn InterestPointDetector,
    ) -> Result<SearchRange> {
        let cache = match_file(left_image, right_image);
        if cache.exists() {
            info!("using cached matches {}", cache.display());
            let (left, right) = read_match_file(&cache)?;
            let l = left.iter().map(location).collect::<Vec<_>>();
            let r = right.iter().map(location).collect::<Vec<_>>();
            return Ok(self.range_from_inliers(&l, &r, scale));
        }

        let left_points = self.interest_points(left_image, detector)?;
        let right_points = self.interest_points(right_image, detector)?;
        let matches = match_interest_points(&left_points, &right_points, self.ratio, self.verbose);
        info!("{} putative matches", matches.len());
        let (left, right): (Vec<_>, Vec<_>) = matches
            .into_iter()
            .map(|(i, j)| (left_points[i].clone(), right_points[j].clone()))
            .unzip();
        let (left, right) = remove_duplicates(left, right);

        let l = left.iter().map(location).collect::<Vec<_>>();
        let r = right.iter().map(location).collect::<Vec<_>>();
        let (_, inliers) = match self.fit(&l, &r) {
            Some(fit) => fit,
            None => {
                warn!(
                    "RANSAC failed on {} matches, unable to detect the search range. Using {}",
                    l.len(),
                    SearchRange::FALLBACK
                );
                return Ok(SearchRange::FALLBACK);
            }
        };
        let left = inliers.iter().map(|i| left[*i].clone()).collect::<Vec<_>>();
        let right = inliers.iter().map(|i| right[*i].clone()).collect::<Vec<_>>();
        write_match_file(&cache, &left, &right)?;

        let l = left.iter().map(location).collect::<Vec<_>>();
        let r = right.iter().map(location).collect::<Vec<_>>();
        Ok(self.range_from_inliers(&l, &r, scale))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interest::HarrisDetector;
    use rand::Rng;

    #[test]
    fn window_from_translations() {
        let t = [Vector2::new(0, 0), Vector2::new(8, -4), Vector2::new(4, 4)];
        let range = SearchRange::from_translations(&t).unwrap();
        // raw box x in [0, 8], y in [-4, 4]: size 8x8, grown by 2 on each side
        assert_eq!(range, SearchRange::new(-2, -6, 12, 12));
        assert!(SearchRange::from_translations(&[]).is_none());
        assert_eq!(SearchRange::FALLBACK, SearchRange::new(-10, -10, 20, 20));
        assert_eq!(SearchRange::FALLBACK.to_string(), "[-10, -10, 20, 20]");
    }

    #[test]
    fn rigid_fit_recovers_transform() {
        let truth = RigidTransform2 {
            angle: 0.3,
            translation: Vector2::new(5.0, -2.0),
        };
        let from = vec![
            Point2::new(0.0, 0.0),
            Point2::new(10.0, 0.0),
            Point2::new(3.0, 7.0),
        ];
        let to = from.iter().map(|p| truth.apply(*p)).collect::<Vec<_>>();
        let fit = RigidTransform2::fit(&from, &to).unwrap();
        assert!((fit.angle - 0.3).abs() < 1e-12);
        assert!((fit.translation - truth.translation).magnitude() < 1e-9);
        assert!(RigidTransform2::fit(&from[..1], &to[..1]).is_none());
    }

    #[test]
    fn identical_images_contain_origin() {
        let mut rng = StdRng::seed_from_u64(4);
        let left = (0..40)
            .map(|_| Point2::new(rng.gen_range(0.0..500.0), rng.gen_range(0.0..500.0)))
            .collect::<Vec<Point2<f64>>>();
        let right = left
            .iter()
            .map(|p| *p + Vector2::new(rng.gen_range(-2.0..2.0), rng.gen_range(-2.0..2.0)))
            .collect::<Vec<_>>();
        let estimator = SearchRangeEstimator::default();
        let range = estimator.range_from_matches(&left, &right, 1.0);
        assert!(range.contains(0, 0));

        let raw = left
            .iter()
            .zip(&right)
            .map(|(l, r)| (*r - *l).map(f64::round).cast::<i32>().unwrap())
            .collect::<Vec<_>>();
        let xs = raw.iter().map(|t| t.x);
        let ys = raw.iter().map(|t| t.y);
        let raw_width = xs.clone().max().unwrap() - xs.min().unwrap() + 1;
        let raw_height = ys.clone().max().unwrap() - ys.min().unwrap() + 1;
        assert!(range.width() as f64 <= 1.5 * raw_width as f64);
        assert!(range.height() as f64 <= 1.5 * raw_height as f64);
    }

    #[test]
    fn outliers_are_rejected() {
        let mut left = Vec::new();
        let mut right = Vec::new();
        for i in 0..20 {
            let p = Point2::new((i * 23 % 200) as f64, (i * 41 % 300) as f64);
            left.push(p);
            right.push(p + Vector2::new(30.0, 10.0));
        }
        left.push(Point2::new(10.0, 10.0));
        right.push(Point2::new(400.0, -300.0));
        let estimator = SearchRangeEstimator::default();
        let (_, inliers) = estimator.fit(&left, &right).unwrap();
        assert_eq!(inliers.len(), 20);
        assert!(!inliers.contains(&20));
        let range = estimator.range_from_matches(&left, &right, 1.0);
        assert_eq!(range, SearchRange::new(30, 10, 1, 1));
        // translations are divided by the scale
        let range = estimator.range_from_matches(&left, &right, 2.0);
        assert_eq!(range, SearchRange::new(15, 5, 1, 1));
    }

    #[test]
    fn too_few_matches_fall_back() {
        let left = vec![
            Point2::new(0.0, 0.0),
            Point2::new(1.0, 0.0),
            Point2::new(0.0, 1.0),
        ];
        let right = left.clone();
        let range = SearchRangeEstimator::default().range_from_matches(&left, &right, 1.0);
        assert_eq!(range, SearchRange::new(-10, -10, 20, 20));
        let range = SearchRangeEstimator::default().range_from_matches(&[], &[], 1.0);
        assert_eq!(range, SearchRange::FALLBACK);
    }

    fn blocks_image(seed: u64) -> GrayImage {
        let mut rng = StdRng::seed_from_u64(seed);
        let values = (0..64).map(|_| rng.gen::<u8>()).collect::<Vec<_>>();
        GrayImage::from_fn(128, 128, |x, y| {
            image::Luma([values[((y / 16) * 8 + x / 16) as usize]])
        })
    }

    #[test]
    fn estimate_from_images_uses_caches() {
        let dir = tempfile::tempdir().unwrap();
        let left = dir.path().join("left.png");
        let right = dir.path().join("right.png");
        blocks_image(9).save(&left).unwrap();
        blocks_image(9).save(&right).unwrap();

        let estimator = SearchRangeEstimator::default();
        let detector = HarrisDetector::default();
        let range = estimator.estimate(&left, &right, 1.0, &detector).unwrap();
        assert!(range.contains(0, 0));
        assert!(dir.path().join("left.vwip").exists());
        assert!(dir.path().join("right.vwip").exists());
        let cache = dir.path().join("left__right.match");
        assert!(cache.exists());
        assert_eq!(cache, match_file(&left, &right));

        // second run reads the cache
        let again = estimator.estimate(&left, &right, 1.0, &detector).unwrap();
        assert_eq!(range, again);
    }
}
