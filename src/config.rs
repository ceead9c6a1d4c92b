//! Configuration of an adjustment run, loaded from JSON and overridden from the command line.

use serde::{Deserialize, Serialize};

use std::convert::TryFrom;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use crate::error::{Error, Result};
use crate::model::Sigmas;
use crate::solver::{ErrorNorm, SolveStrategy};

/// Configuration file read when none is given explicitly.
pub const DEFAULT_CONFIG_FILE: &str = "photoba.json";

/// Which solver and error norm to use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum AdjustmentType {
    /// Dense solve, L2 norm.
    Ref,
    /// Point blocks eliminated before solving, L2 norm.
    Sparse,
    RobustRef,
    RobustSparse,
}

impl AdjustmentType {
    pub fn strategy(self) -> SolveStrategy {
        match self {
            AdjustmentType::Ref | AdjustmentType::RobustRef => SolveStrategy::Dense,
            AdjustmentType::Sparse | AdjustmentType::RobustSparse => SolveStrategy::Sparse,
        }
    }

    pub fn is_robust(self) -> bool {
        match self {
            AdjustmentType::RobustRef | AdjustmentType::RobustSparse => true,
            _ => false,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            AdjustmentType::Ref => "ref",
            AdjustmentType::Sparse => "sparse",
            AdjustmentType::RobustRef => "robust_ref",
            AdjustmentType::RobustSparse => "robust_sparse",
        }
    }
}

impl FromStr for AdjustmentType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "ref" => Ok(AdjustmentType::Ref),
            "sparse" => Ok(AdjustmentType::Sparse),
            "robust_ref" => Ok(AdjustmentType::RobustRef),
            "robust_sparse" => Ok(AdjustmentType::RobustSparse),
            _ => Err(Error::Configuration(format!(
                "unknown adjustment type {:?}, expected one of ref, sparse, robust_ref, robust_sparse",
                s
            ))),
        }
    }
}

impl TryFrom<String> for AdjustmentType {
    type Error = Error;

    fn try_from(s: String) -> Result<Self> {
        s.parse()
    }
}

impl From<AdjustmentType> for String {
    fn from(t: AdjustmentType) -> String {
        t.as_str().to_string()
    }
}

impl std::fmt::Display for AdjustmentType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Norm used by the robust adjustment types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RobustNorm {
    Cauchy,
    Huber,
}

impl FromStr for RobustNorm {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "cauchy" => Ok(RobustNorm::Cauchy),
            "huber" => Ok(RobustNorm::Huber),
            _ => Err(Error::Configuration(format!(
                "unknown robust norm {:?}, expected cauchy or huber",
                s
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AdjustConfig {
    pub adjustment_type: AdjustmentType,
    /// Initial damping. The adjuster picks one if unset.
    pub lambda: Option<f64>,
    pub camera_position_sigma: f64,
    pub camera_pose_sigma: f64,
    pub gcp_sigma: f64,
    pub max_iterations: usize,
    /// Minimum number of matches between an image pair, used when building control networks.
    pub min_matches: usize,
    pub save_iteration_data: bool,
    pub report_level: u32,
    pub report_every: usize,
    pub robust_norm: RobustNorm,
    /// Pixels.
    pub robust_threshold: f64,
    pub data_dir: PathBuf,
}

impl Default for AdjustConfig {
    fn default() -> Self {
        AdjustConfig {
            adjustment_type: AdjustmentType::Ref,
            lambda: None,
            camera_position_sigma: 1.0,
            camera_pose_sigma: 1e-16,
            gcp_sigma: 1e-16,
            max_iterations: 30,
            min_matches: 30,
            save_iteration_data: false,
            report_level: 10,
            report_every: 1,
            robust_norm: RobustNorm::Cauchy,
            robust_threshold: 2.0,
            data_dir: PathBuf::from("."),
        }
    }
}

impl AdjustConfig {
    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path).map_err(|e| {
            Error::Configuration(format!("failed to read config {}: {}", path.display(), e))
        })?;
        serde_json::from_str(&contents).map_err(|e| {
            Error::Configuration(format!("failed to parse config {}: {}", path.display(), e))
        })
    }

    /// Load `explicit` if given, otherwise [DEFAULT_CONFIG_FILE] if it exists, otherwise the
    /// defaults.
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        match explicit {
            Some(path) => AdjustConfig::from_file(path),
            None => {
                let default = Path::new(DEFAULT_CONFIG_FILE);
                if default.exists() {
                    AdjustConfig::from_file(default)
                } else {
                    Ok(AdjustConfig::default())
                }
            }
        }
    }

    pub fn validate(&self) -> Result<()> {
        self.sigmas().validate()?;
        if let Some(lambda) = self.lambda {
            if !(lambda > 0.0) || !lambda.is_finite() {
                return Err(Error::Configuration(format!(
                    "lambda must be positive, got {}",
                    lambda
                )));
            }
        }
        if !(self.robust_threshold > 0.0) || !self.robust_threshold.is_finite() {
            return Err(Error::Configuration(format!(
                "robust threshold must be positive, got {}",
                self.robust_threshold
            )));
        }
        if self.report_every == 0 {
            return Err(Error::Configuration(
                "report_every must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    pub fn sigmas(&self) -> Sigmas {
        Sigmas {
            camera_position: self.camera_position_sigma,
            camera_pose: self.camera_pose_sigma,
            ground_control: self.gcp_sigma,
        }
    }

    pub fn error_norm(&self) -> ErrorNorm {
        if !self.adjustment_type.is_robust() {
            return ErrorNorm::L2;
        }
        match self.robust_norm {
            RobustNorm::Cauchy => ErrorNorm::Cauchy {
                threshold: self.robust_threshold,
            },
            RobustNorm::Huber => ErrorNorm::Huber {
                threshold: self.robust_threshold,
            },
        }
    }

    /// Bare file names are looked up in `data_dir`; anything with a directory component is used
    /// as given.
    pub fn resolve(&self, path: &Path) -> PathBuf {
        let bare = path.is_relative()
            && path
                .parent()
                .map(|p| p.as_os_str().is_empty())
                .unwrap_or(true);
        if bare {
            self.data_dir.join(path)
        } else {
            path.to_path_buf()
        }
    }

    /// Check that every input exists before any work is done.
    pub fn require_inputs(&self, paths: &[PathBuf]) -> Result<()> {
        for path in paths {
            if !path.is_file() {
                return Err(Error::Configuration(format!(
                    "required input {} does not exist",
                    path.display()
                )));
            }
        }
        Ok(())
    }
}
