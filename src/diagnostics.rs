//! Residual statistics and the sinks they are reported through.
//!
//! A [Reporter] is created by the caller and handed to
//! [adjust_bundles](crate::driver::adjust_bundles). It decides what to report based on its level
//! and forwards [ReportEvent]s to every registered [ReportSink]:
//!
//! | level | reported |
//! |-------|----------|
//! | < 10  | nothing |
//! | >= 10 | summaries at start and end |
//! | >= 20 | a summary every `every` iterations |
//! | >= 30 | a row per camera with each summary |

use serde::Serialize;
use tracing::info;

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use crate::camera::Camera;
use crate::driver::AdjustmentState;
use crate::error::Result;
use crate::model::BundleAdjustmentModel;

/// Distribution of a set of values.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Statistics {
    pub count: usize,
    pub min: f64,
    pub mean: f64,
    pub median: f64,
    pub max: f64,
}

impl Statistics {
    /// Statistics of `values`. All fields are zero when `values` is empty.
    pub fn from_values(values: &[f64]) -> Self {
        if values.is_empty() {
            return Statistics {
                count: 0,
                min: 0.0,
                mean: 0.0,
                median: 0.0,
                max: 0.0,
            };
        }
        let mut sorted = values.to_vec();
        sorted.sort_by(|a, b| a.total_cmp(b));
        let n = sorted.len();
        let median = if n % 2 == 1 {
            sorted[n / 2]
        } else {
            (sorted[n / 2 - 1] + sorted[n / 2]) / 2.0
        };
        Statistics {
            count: n,
            min: sorted[0],
            mean: sorted.iter().sum::<f64>() / n as f64,
            median,
            max: sorted[n - 1],
        }
    }
}

impl std::fmt::Display for Statistics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "mean {:.4e} median {:.4e} min {:.4e} max {:.4e} (n={})",
            self.mean, self.median, self.min, self.max, self.count
        )
    }
}

/// Snapshot of the model's size and error distribution.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Summary {
    pub num_cameras: usize,
    pub num_points: usize,
    pub num_observations: usize,
    pub num_ground_control_points: usize,
    /// Pixels.
    pub pixel_error: Statistics,
    /// Network units.
    pub camera_position_delta: Statistics,
    /// Degrees.
    pub camera_pose_delta: Statistics,
    /// Network units.
    pub ground_control_delta: Statistics,
    pub cost: Option<f64>,
}

impl Summary {
    pub fn from_model<C: Camera>(model: &BundleAdjustmentModel<C>, cost: Option<f64>) -> Self {
        Summary {
            num_cameras: model.num_cameras(),
            num_points: model.num_points(),
            num_observations: model.num_observations(),
            num_ground_control_points: model.num_ground_control_points(),
            pixel_error: Statistics::from_values(&model.pixel_residuals()),
            camera_position_delta: Statistics::from_values(&model.camera_position_deltas()),
            camera_pose_delta: Statistics::from_values(&model.camera_pose_deltas()),
            ground_control_delta: Statistics::from_values(&model.ground_control_point_deltas()),
            cost,
        }
    }
}

impl std::fmt::Display for Summary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(
            f,
            "{} cameras, {} points ({} ground control), {} observations",
            self.num_cameras, self.num_points, self.num_ground_control_points, self.num_observations
        )?;
        if let Some(cost) = self.cost {
            writeln!(f, "  cost:                  {:.6e}", cost)?;
        }
        writeln!(f, "  pixel error:           {}", self.pixel_error)?;
        writeln!(f, "  camera position delta: {}", self.camera_position_delta)?;
        writeln!(f, "  camera pose delta:     {}", self.camera_pose_delta)?;
        write!(f, "  gcp delta:             {}", self.ground_control_delta)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ReportEvent {
    Start {
        summary: Summary,
    },
    Iteration {
        iteration: usize,
        summary: Summary,
    },
    Camera {
        iteration: usize,
        camera: usize,
        position_delta: f64,
        pose_delta: f64,
    },
    End {
        iterations: usize,
        state: AdjustmentState,
        summary: Summary,
    },
}

/// Destination for report events.
pub trait ReportSink {
    fn emit(&mut self, event: &ReportEvent) -> Result<()>;
}

/// Writes events as text through `tracing`.
#[derive(Debug, Default)]
pub struct TracingSink;

impl ReportSink for TracingSink {
    fn emit(&mut self, event: &ReportEvent) -> Result<()> {
        match event {
            ReportEvent::Start { summary } => info!("Starting bundle adjustment: {}", summary),
            ReportEvent::Iteration { iteration, summary } => {
                info!("Iteration {}: {}", iteration, summary)
            }
            ReportEvent::Camera {
                iteration,
                camera,
                position_delta,
                pose_delta,
            } => info!(
                "  [{}] camera {}: moved {:.4e}, rotated {:.4e} deg",
                iteration, camera, position_delta, pose_delta
            ),
            ReportEvent::End {
                iterations,
                state,
                summary,
            } => info!(
                "Finished after {} iterations ({:?}): {}",
                iterations, state, summary
            ),
        }
        Ok(())
    }
}

/// Writes one JSON object per event, flushing after each.
pub struct JsonLinesSink<W: Write> {
    writer: W,
}

impl<W: Write> JsonLinesSink<W> {
    pub fn new(writer: W) -> Self {
        JsonLinesSink { writer }
    }

    pub fn into_inner(self) -> W {
        self.writer
    }
}

impl JsonLinesSink<BufWriter<File>> {
    pub fn create(path: &Path) -> Result<Self> {
        Ok(JsonLinesSink::new(BufWriter::new(File::create(path)?)))
    }
}

impl<W: Write> ReportSink for JsonLinesSink<W> {
    fn emit(&mut self, event: &ReportEvent) -> Result<()> {
        serde_json::to_writer(&mut self.writer, event)?;
        self.writer.write_all(b"\n")?;
        self.writer.flush()?;
        Ok(())
    }
}

pub struct Reporter {
    level: u32,
    every: usize,
    sinks: Vec<Box<dyn ReportSink>>,
}

impl Reporter {
    pub fn new(level: u32, every: usize) -> Self {
        Reporter {
            level,
            every: every.max(1),
            sinks: Vec::new(),
        }
    }

    /// Reporter that never emits anything.
    pub fn silent() -> Self {
        Reporter::new(0, 1)
    }

    pub fn with_sink<S: ReportSink + 'static>(mut self, sink: S) -> Self {
        self.sinks.push(Box::new(sink));
        self
    }

    pub fn add_sink(&mut self, sink: Box<dyn ReportSink>) {
        self.sinks.push(sink);
    }

    pub fn level(&self) -> u32 {
        self.level
    }

    fn emit(&mut self, event: ReportEvent) -> Result<()> {
        for sink in self.sinks.iter_mut() {
            sink.emit(&event)?;
        }
        Ok(())
    }

    fn cameras<C: Camera>(
        &mut self,
        iteration: usize,
        model: &BundleAdjustmentModel<C>,
    ) -> Result<()> {
        if self.level < 30 {
            return Ok(());
        }
        let positions = model.camera_position_deltas();
        let poses = model.camera_pose_deltas();
        for (camera, (position_delta, pose_delta)) in positions.into_iter().zip(poses).enumerate()
        {
            self.emit(ReportEvent::Camera {
                iteration,
                camera,
                position_delta,
                pose_delta,
            })?;
        }
        Ok(())
    }

    pub fn start<C: Camera>(
        &mut self,
        model: &BundleAdjustmentModel<C>,
        cost: Option<f64>,
    ) -> Result<()> {
        if self.level < 10 {
            return Ok(());
        }
        self.emit(ReportEvent::Start {
            summary: Summary::from_model(model, cost),
        })?;
        self.cameras(0, model)
    }

    pub fn iteration<C: Camera>(
        &mut self,
        iteration: usize,
        model: &BundleAdjustmentModel<C>,
        cost: Option<f64>,
    ) -> Result<()> {
        if self.level < 20 || iteration % self.every != 0 {
            return Ok(());
        }
        self.emit(ReportEvent::Iteration {
            iteration,
            summary: Summary::from_model(model, cost),
        })?;
        self.cameras(iteration, model)
    }

    pub fn end<C: Camera>(
        &mut self,
        iterations: usize,
        state: AdjustmentState,
        model: &BundleAdjustmentModel<C>,
        cost: Option<f64>,
    ) -> Result<()> {
        if self.level < 10 {
            return Ok(());
        }
        self.emit(ReportEvent::End {
            iterations,
            state,
            summary: Summary::from_model(model, cost),
        })?;
        self.cameras(iterations, model)
    }
}
