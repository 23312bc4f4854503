//! Per-feature standardization matching the classifier's training data.

use crate::types::{FeatureState, FeatureVector};
use serde::Deserialize;
use std::path::Path;
use thiserror::Error;

/// Standardized magnitude above which a feature counts as an outlier.
const OUTLIER_SIGMA: f32 = 10.0;
/// Fraction of outlier features that triggers a mismatch warning.
const OUTLIER_WARN_RATIO: f32 = 0.05;

#[derive(Error, Debug)]
pub enum ScalerError {
    #[error("scaler file not found: {0}")]
    NotFound(String),
    #[error("failed to read scaler: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse scaler JSON: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("scaler is empty")]
    Empty,
    #[error("scaler mean has {mean} entries but scale has {scale}")]
    LengthMismatch { mean: usize, scale: usize },
    #[error("scaler has {actual} features, expected {expected}")]
    UnexpectedDimension { expected: usize, actual: usize },
    #[error("scaler scale[{0}] is zero or non-finite")]
    DegenerateScale(usize),
    #[error("scaler mean[{0}] is non-finite")]
    NonFiniteMean(usize),
    #[error("feature vector has {actual} values, scaler expects {expected}")]
    DimensionMismatch { expected: usize, actual: usize },
    #[error("feature vector is already normalized")]
    AlreadyNormalized,
    #[error("normalized feature {0} is non-finite")]
    NonFiniteOutput(usize),
}

/// On-disk layout. Accepts both `mean`/`scale` and the scikit-learn
/// attribute names `mean_`/`scale_`.
#[derive(Deserialize)]
struct ScalerFile {
    #[serde(alias = "mean_")]
    mean: Vec<f32>,
    #[serde(alias = "scale_")]
    scale: Vec<f32>,
}

/// Validated mean/scale statistics. Immutable once loaded.
#[derive(Debug, Clone, PartialEq)]
pub struct Scaler {
    mean: Vec<f32>,
    scale: Vec<f32>,
}

impl Scaler {
    /// Build a scaler, rejecting anything that would produce NaN or infinity.
    pub fn new(mean: Vec<f32>, scale: Vec<f32>) -> Result<Self, ScalerError> {
        if mean.len() != scale.len() {
            return Err(ScalerError::LengthMismatch {
                mean: mean.len(),
                scale: scale.len(),
            });
        }
        if mean.is_empty() {
            return Err(ScalerError::Empty);
        }
        if let Some(i) = scale.iter().position(|s| *s == 0.0 || !s.is_finite()) {
            return Err(ScalerError::DegenerateScale(i));
        }
        if let Some(i) = mean.iter().position(|m| !m.is_finite()) {
            return Err(ScalerError::NonFiniteMean(i));
        }
        Ok(Self { mean, scale })
    }

    pub fn from_json(json: &str) -> Result<Self, ScalerError> {
        let file: ScalerFile = serde_json::from_str(json)?;
        Self::new(file.mean, file.scale)
    }

    pub fn load(path: &Path) -> Result<Self, ScalerError> {
        if !path.exists() {
            return Err(ScalerError::NotFound(path.display().to_string()));
        }
        let scaler = Self::from_json(&std::fs::read_to_string(path)?)?;
        tracing::info!(path = %path.display(), features = scaler.len(), "loaded scaler");
        Ok(scaler)
    }

    /// Fail unless the scaler covers exactly `expected` features.
    pub fn expect_len(self, expected: usize) -> Result<Self, ScalerError> {
        if self.len() != expected {
            return Err(ScalerError::UnexpectedDimension {
                expected,
                actual: self.len(),
            });
        }
        Ok(self)
    }

    pub fn len(&self) -> usize {
        self.mean.len()
    }

    pub fn is_empty(&self) -> bool {
        self.mean.is_empty()
    }

    /// `out[i] = (v[i] - mean[i]) / scale[i]`, as a new vector.
    pub fn normalize(&self, vector: &FeatureVector) -> Result<FeatureVector, ScalerError> {
        if vector.state == FeatureState::Normalized {
            return Err(ScalerError::AlreadyNormalized);
        }
        if vector.len() != self.len() {
            return Err(ScalerError::DimensionMismatch {
                expected: self.len(),
                actual: vector.len(),
            });
        }

        let values: Vec<f32> = vector
            .values
            .iter()
            .zip(self.mean.iter().zip(&self.scale))
            .map(|(v, (m, s))| (v - m) / s)
            .collect();

        if let Some(i) = values.iter().position(|v| !v.is_finite()) {
            return Err(ScalerError::NonFiniteOutput(i));
        }

        let outliers = values.iter().filter(|v| v.abs() > OUTLIER_SIGMA).count();
        let ratio = outliers as f32 / values.len() as f32;
        if ratio > OUTLIER_WARN_RATIO {
            tracing::warn!(
                outliers,
                total = values.len(),
                "many features far outside the scaler's distribution; \
                 normalization mode may not match the scaler"
            );
        }

        Ok(FeatureVector::normalized(values))
    }
}
