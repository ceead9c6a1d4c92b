//! Interest point detection, description and matching between image pairs.
//!
//! Points and matches are cached on disk in a big-endian binary layout:
//!
//! ```txt
//! point list:  u32 count, then per point
//!              f32 x, f32 y, f32 score, u32 descriptor length, f32 descriptor...
//! match file:  point list (left image), point list (right image), paired by index
//! ```

use byteorder::{BigEndian, WriteBytesExt};
use image::GrayImage;
use indicatif::{ParallelProgressIterator, ProgressBar, ProgressStyle};
use nom::multi::count;
use nom::number::complete::{be_f32, be_u32};
use nom::IResult;
use rayon::prelude::*;
use tracing::debug;

use std::collections::HashMap;
use std::fs::File;
use std::io::{BufWriter, Read, Write};
use std::path::Path;

use crate::error::{Error, Result};

#[derive(Debug, Clone, PartialEq)]
pub struct InterestPoint {
    pub x: f32,
    pub y: f32,
    pub score: f32,
    pub descriptor: Vec<f32>,
}

pub trait InterestPointDetector {
    /// Detect and describe interest points, strongest first.
    fn detect(&self, image: &GrayImage) -> Vec<InterestPoint>;
}

/// Harris corners described by a normalized intensity patch.
#[derive(Debug, Clone)]
pub struct HarrisDetector {
    /// Harris sensitivity, `det - k * trace^2`.
    pub k: f64,
    /// Half width of the structure tensor window.
    pub block_radius: u32,
    /// Responses below this fraction of the strongest response are ignored.
    pub relative_threshold: f64,
    pub max_points: usize,
    /// Half width of the descriptor patch.
    pub patch_radius: u32,
}

impl Default for HarrisDetector {
    fn default() -> Self {
        HarrisDetector {
            k: 0.04,
            block_radius: 2,
            relative_threshold: 0.01,
            max_points: 500,
            patch_radius: 5,
        }
    }
}

fn sobel(image: &GrayImage) -> (Vec<f64>, Vec<f64>) {
    let (w, h) = (image.width() as i64, image.height() as i64);
    let mut gx = vec![0.0; (w * h) as usize];
    let mut gy = vec![0.0; (w * h) as usize];
    let at = |x: i64, y: i64| image.get_pixel(x as u32, y as u32)[0] as f64;
    for y in 1..h - 1 {
        for x in 1..w - 1 {
            let idx = (y * w + x) as usize;
            gx[idx] = at(x + 1, y - 1) + 2.0 * at(x + 1, y) + at(x + 1, y + 1)
                - at(x - 1, y - 1)
                - 2.0 * at(x - 1, y)
                - at(x - 1, y + 1);
            gy[idx] = at(x - 1, y + 1) + 2.0 * at(x, y + 1) + at(x + 1, y + 1)
                - at(x - 1, y - 1)
                - 2.0 * at(x, y - 1)
                - at(x + 1, y - 1);
        }
    }
    (gx, gy)
}

impl HarrisDetector {
    fn responses(&self, image: &GrayImage) -> Vec<f64> {
        let (w, h) = (image.width() as i64, image.height() as i64);
        let (gx, gy) = sobel(image);
        let r = self.block_radius as i64;
        let mut responses = vec![0.0; (w * h) as usize];
        for y in r + 1..h - r - 1 {
            for x in r + 1..w - r - 1 {
                let (mut xx, mut yy, mut xy) = (0.0, 0.0, 0.0);
                for by in -r..=r {
                    for bx in -r..=r {
                        let idx = ((y + by) * w + x + bx) as usize;
                        xx += gx[idx] * gx[idx];
                        yy += gy[idx] * gy[idx];
                        xy += gx[idx] * gy[idx];
                    }
                }
                let trace = xx + yy;
                responses[(y * w + x) as usize] = xx * yy - xy * xy - self.k * trace * trace;
            }
        }
        responses
    }

    /// Mean subtracted, unit length patch around `(x, y)`. The patch must lie inside the image.
    fn describe(&self, image: &GrayImage, x: u32, y: u32) -> Vec<f32> {
        let r = self.patch_radius;
        let mut patch = Vec::with_capacity(((2 * r + 1) * (2 * r + 1)) as usize);
        for py in y - r..=y + r {
            for px in x - r..=x + r {
                patch.push(image.get_pixel(px, py)[0] as f32);
            }
        }
        let mean = patch.iter().sum::<f32>() / patch.len() as f32;
        patch.iter_mut().for_each(|v| *v -= mean);
        let norm = patch.iter().map(|v| v * v).sum::<f32>().sqrt();
        if norm > 0.0 {
            patch.iter_mut().for_each(|v| *v /= norm);
        }
        patch
    }
}

impl InterestPointDetector for HarrisDetector {
    fn detect(&self, image: &GrayImage) -> Vec<InterestPoint> {
        let (w, h) = (image.width() as i64, image.height() as i64);
        let responses = self.responses(image);
        let strongest = responses.iter().cloned().fold(0.0, f64::max);
        if strongest <= 0.0 {
            return Vec::new();
        }
        let threshold = strongest * self.relative_threshold;
        let margin = (self.block_radius as i64 + 2).max(self.patch_radius as i64);

        let mut points = Vec::new();
        for y in margin..h - margin {
            for x in margin..w - margin {
                let response = responses[(y * w + x) as usize];
                if response <= threshold {
                    continue;
                }
                let is_max = itertools::iproduct!(-1i64..=1, -1i64..=1)
                    .filter(|&(dx, dy)| dx != 0 || dy != 0)
                    .all(|(dx, dy)| responses[((y + dy) * w + x + dx) as usize] <= response);
                if is_max {
                    points.push(InterestPoint {
                        x: x as f32,
                        y: y as f32,
                        score: response as f32,
                        descriptor: self.describe(image, x as u32, y as u32),
                    });
                }
            }
        }
        points.sort_by(|a, b| b.score.total_cmp(&a.score));
        points.truncate(self.max_points);
        debug!("detected {} Harris corners", points.len());
        points
    }
}

pub(crate) fn progress_bar(length: u64, message: &str, verbose: bool) -> ProgressBar {
    if !verbose {
        return ProgressBar::hidden();
    }

    let pb = ProgressBar::new(length);
    if let Ok(style) = ProgressStyle::default_bar().template("{msg} [{bar:40}] {percent}% ({eta})")
    {
        pb.set_style(style.progress_chars("#-"));
    }
    pb.set_message(message.to_string());
    pb
}

fn distance(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() {
        return std::f32::INFINITY;
    }
    a.iter()
        .zip(b)
        .map(|(x, y)| (x - y) * (x - y))
        .sum::<f32>()
        .sqrt()
}

/// Match every left point to its nearest right point by descriptor distance. A match is kept if
/// the nearest neighbor is closer than `ratio` times the second nearest.
pub fn match_interest_points(
    left: &[InterestPoint],
    right: &[InterestPoint],
    ratio: f32,
    verbose: bool,
) -> Vec<(usize, usize)> {
    left.par_iter()
        .enumerate()
        .progress_with(progress_bar(left.len() as u64, "Matching", verbose))
        .filter_map(|(i, l)| {
            let mut best = (std::f32::INFINITY, None);
            let mut second = std::f32::INFINITY;
            for (j, r) in right.iter().enumerate() {
                let d = distance(&l.descriptor, &r.descriptor);
                if d < best.0 {
                    second = best.0;
                    best = (d, Some(j));
                } else if d < second {
                    second = d;
                }
            }
            match best {
                (d, Some(j)) if d.is_finite() && d < ratio * second => Some((i, j)),
                _ => None,
            }
        })
        .collect()
}

/// Drop every match whose left or right location is shared with another match.
pub fn remove_duplicates(
    left: Vec<InterestPoint>,
    right: Vec<InterestPoint>,
) -> (Vec<InterestPoint>, Vec<InterestPoint>) {
    let key = |p: &InterestPoint| (p.x.to_bits(), p.y.to_bits());
    let mut left_counts = HashMap::new();
    let mut right_counts = HashMap::new();
    for p in &left {
        *left_counts.entry(key(p)).or_insert(0) += 1;
    }
    for p in &right {
        *right_counts.entry(key(p)).or_insert(0) += 1;
    }
    left.into_iter()
        .zip(right)
        .filter(|(l, r)| left_counts[&key(l)] == 1 && right_counts[&key(r)] == 1)
        .unzip()
}

fn write_points<W: Write>(w: &mut W, points: &[InterestPoint]) -> Result<()> {
    w.write_u32::<BigEndian>(points.len() as u32)?;
    for p in points {
        w.write_f32::<BigEndian>(p.x)?;
        w.write_f32::<BigEndian>(p.y)?;
        w.write_f32::<BigEndian>(p.score)?;
        w.write_u32::<BigEndian>(p.descriptor.len() as u32)?;
        for v in &p.descriptor {
            w.write_f32::<BigEndian>(*v)?;
        }
    }
    Ok(())
}

fn parse_point(input: &[u8]) -> IResult<&[u8], InterestPoint> {
    let (input, x) = be_f32(input)?;
    let (input, y) = be_f32(input)?;
    let (input, score) = be_f32(input)?;
    let (input, n) = be_u32(input)?;
    let (input, descriptor) = count(be_f32, n as usize)(input)?;
    Ok((
        input,
        InterestPoint {
            x,
            y,
            score,
            descriptor,
        },
    ))
}

fn parse_points(input: &[u8]) -> IResult<&[u8], Vec<InterestPoint>> {
    let (input, n) = be_u32(input)?;
    count(parse_point, n as usize)(input)
}

fn read_bytes(path: &Path) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    File::open(path)?.read_to_end(&mut buf)?;
    Ok(buf)
}

pub fn write_interest_point_file(path: &Path, points: &[InterestPoint]) -> Result<()> {
    let mut f = BufWriter::new(File::create(path)?);
    write_points(&mut f, points)?;
    f.flush()?;
    Ok(())
}

pub fn read_interest_point_file(path: &Path) -> Result<Vec<InterestPoint>> {
    let buf = read_bytes(path)?;
    match parse_points(&buf) {
        Ok((rest, points)) if rest.is_empty() => Ok(points),
        Ok((rest, _)) => Err(Error::Parse(format!(
            "{}: {} trailing bytes",
            path.display(),
            rest.len()
        ))),
        Err(_) => Err(Error::Parse(format!(
            "{}: truncated interest point file",
            path.display()
        ))),
    }
}

pub fn write_match_file(path: &Path, left: &[InterestPoint], right: &[InterestPoint]) -> Result<()> {
    let mut f = BufWriter::new(File::create(path)?);
    write_points(&mut f, left)?;
    write_points(&mut f, right)?;
    f.flush()?;
    Ok(())
}

pub fn read_match_file(path: &Path) -> Result<(Vec<InterestPoint>, Vec<InterestPoint>)> {
    let buf = read_bytes(path)?;
    let parsed = parse_points(&buf).and_then(|(rest, left)| {
        let (rest, right) = parse_points(rest)?;
        Ok((rest, (left, right)))
    });
    match parsed {
        Ok((rest, (left, right))) if rest.is_empty() && left.len() == right.len() => {
            Ok((left, right))
        }
        Ok(_) => Err(Error::Parse(format!(
            "{}: match lists differ in length or have trailing bytes",
            path.display()
        ))),
        Err(_) => Err(Error::Parse(format!(
            "{}: truncated match file",
            path.display()
        ))),
    }
}
