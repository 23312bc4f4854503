//! Landmark → feature-vector encoding.
//!
//! The chosen mode must be the one the scaler statistics were computed
//! with. A mismatch is not detectable here; it only shows up as outlier
//! features after standardization (see [`crate::scaler`]).

use crate::types::{BoundingBox, FeatureVector, KeypointSet, LANDMARK_COUNT};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use thiserror::Error;

/// Padding added to each side of the landmark extent, as a fraction of it.
pub const DEFAULT_BBOX_PADDING: f32 = 0.1;

#[derive(Error, Debug, PartialEq)]
pub enum FeatureError {
    #[error("expected {expected} landmarks, got {actual}")]
    LandmarkCount { expected: usize, actual: usize },
    #[error("landmark bounding box is degenerate (width {width}, height {height})")]
    DegenerateBox { width: f32, height: f32 },
    #[error("unknown normalization mode: {0}")]
    UnknownMode(String),
}

/// Coordinate frame the landmarks are expressed in before flattening.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum NormalizationMode {
    /// (x, y, z) as detected, relative to the whole image.
    Raw,
    /// (x, y) relative to the padded face box, z scaled by box width.
    #[default]
    BoundingBoxRelative,
    /// (x, y) shifted so the image center is the origin.
    CenterRelative,
}

impl NormalizationMode {
    pub fn as_str(self) -> &'static str {
        match self {
            NormalizationMode::Raw => "raw",
            NormalizationMode::BoundingBoxRelative => "bbox",
            NormalizationMode::CenterRelative => "center",
        }
    }
}

impl FromStr for NormalizationMode {
    type Err = FeatureError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "raw" => Ok(Self::Raw),
            "bbox" | "bbox-relative" | "bounding-box-relative" => Ok(Self::BoundingBoxRelative),
            "center" | "center-relative" => Ok(Self::CenterRelative),
            other => Err(FeatureError::UnknownMode(other.to_string())),
        }
    }
}

/// Flattens a [`KeypointSet`] into `3 × landmark_count` values.
#[derive(Debug, Clone, Copy)]
pub struct Vectorizer {
    pub mode: NormalizationMode,
    pub landmark_count: usize,
    pub padding: f32,
}

impl Default for Vectorizer {
    fn default() -> Self {
        Self::new(NormalizationMode::default())
    }
}

impl Vectorizer {
    pub fn new(mode: NormalizationMode) -> Self {
        Self {
            mode,
            landmark_count: LANDMARK_COUNT,
            padding: DEFAULT_BBOX_PADDING,
        }
    }

    pub fn with_landmark_count(mut self, landmark_count: usize) -> Self {
        self.landmark_count = landmark_count;
        self
    }

    /// Length of every vector this vectorizer produces.
    pub fn output_len(&self) -> usize {
        self.landmark_count * 3
    }

    pub fn vectorize(&self, keypoints: &KeypointSet) -> Result<FeatureVector, FeatureError> {
        if keypoints.len() != self.landmark_count {
            return Err(FeatureError::LandmarkCount {
                expected: self.landmark_count,
                actual: keypoints.len(),
            });
        }

        let mut values = Vec::with_capacity(self.output_len());

        match self.mode {
            NormalizationMode::Raw => {
                for p in keypoints.points() {
                    values.extend_from_slice(&[p.x, p.y, p.z]);
                }
            }
            NormalizationMode::CenterRelative => {
                for p in keypoints.points() {
                    values.extend_from_slice(&[p.x - 0.5, p.y - 0.5, p.z]);
                }
            }
            NormalizationMode::BoundingBoxRelative => {
                let bbox = keypoints.bounding_box(self.padding).unwrap_or(BoundingBox {
                    x: 0.0,
                    y: 0.0,
                    width: 0.0,
                    height: 0.0,
                });
                if bbox.is_degenerate() {
                    return Err(FeatureError::DegenerateBox {
                        width: bbox.width,
                        height: bbox.height,
                    });
                }

                // The box is clamped to the image, so points past its edge are too.
                for p in keypoints.points() {
                    values.extend_from_slice(&[
                        (p.x.clamp(0.0, 1.0) - bbox.x) / bbox.width,
                        (p.y.clamp(0.0, 1.0) - bbox.y) / bbox.height,
                        p.z / bbox.width,
                    ]);
                }
            }
        }

        tracing::trace!(mode = self.mode.as_str(), len = values.len(), "vectorized landmarks");
        Ok(FeatureVector::raw(values))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Keypoint;

    /// Deterministic, non-degenerate synthetic face: points on a spiral.
    fn synthetic_face(n: usize) -> KeypointSet {
        let points = (0..n)
            .map(|i| {
                let t = i as f32 / n as f32;
                let angle = t * std::f32::consts::TAU * 3.0;
                Keypoint::new(
                    0.5 + 0.2 * t * angle.cos(),
                    0.45 + 0.25 * t * angle.sin(),
                    -0.05 + 0.1 * t,
                )
            })
            .collect();
        KeypointSet::new(points)
    }

    #[test]
    fn test_output_length_all_modes() {
        let face = synthetic_face(LANDMARK_COUNT);
        for mode in [
            NormalizationMode::Raw,
            NormalizationMode::BoundingBoxRelative,
            NormalizationMode::CenterRelative,
        ] {
            let v = Vectorizer::new(mode).vectorize(&face).unwrap();
            assert_eq!(v.len(), 3 * LANDMARK_COUNT, "mode {mode:?}");
        }
    }

    #[test]
    fn test_raw_mode_is_identity() {
        let face = KeypointSet::new(vec![Keypoint::new(0.1, 0.2, 0.3), Keypoint::new(0.4, 0.5, 0.6)]);
        let v = Vectorizer::new(NormalizationMode::Raw)
            .with_landmark_count(2)
            .vectorize(&face)
            .unwrap();
        assert_eq!(v.values, vec![0.1, 0.2, 0.3, 0.4, 0.5, 0.6]);
    }

    #[test]
    fn test_center_mode_shifts_xy_only() {
        let face = KeypointSet::new(vec![Keypoint::new(0.5, 0.25, 0.1)]);
        let v = Vectorizer::new(NormalizationMode::CenterRelative)
            .with_landmark_count(1)
            .vectorize(&face)
            .unwrap();
        assert_eq!(v.values, vec![0.0, -0.25, 0.1]);
    }

    #[test]
    fn test_bbox_relative_known_box() {
        // Corners at 0.25/0.75 padded by 0.1 of the 0.5 extent give the box
        // x=0.2, y=0.2, w=0.6, h=0.6.
        let face = KeypointSet::new(vec![
            Keypoint::new(0.25, 0.25, 0.0),
            Keypoint::new(0.75, 0.75, 0.0),
            Keypoint::new(0.5, 0.5, 0.1),
        ]);
        let bbox = face.bounding_box(0.1).unwrap();
        assert!((bbox.x - 0.2).abs() < 1e-6);
        assert!((bbox.width - 0.6).abs() < 1e-6);

        let v = Vectorizer::new(NormalizationMode::BoundingBoxRelative)
            .with_landmark_count(3)
            .vectorize(&face)
            .unwrap();
        let (nx, ny, nz) = (v.values[6], v.values[7], v.values[8]);
        assert!((nx - 0.5).abs() < 1e-5, "nx = {nx}");
        assert!((ny - 0.5).abs() < 1e-5, "ny = {ny}");
        assert!((nz - 0.1667).abs() < 1e-4, "nz = {nz}");
    }

    #[test]
    fn test_bbox_relative_containment() {
        let face = synthetic_face(LANDMARK_COUNT);
        let vectorizer = Vectorizer::new(NormalizationMode::BoundingBoxRelative);
        let v = vectorizer.vectorize(&face).unwrap();
        let pad = vectorizer.padding;
        for chunk in v.values.chunks_exact(3) {
            assert!(chunk[0] >= -pad && chunk[0] <= 1.0 + pad, "nx = {}", chunk[0]);
            assert!(chunk[1] >= -pad && chunk[1] <= 1.0 + pad, "ny = {}", chunk[1]);
        }
    }

    #[test]
    fn test_bbox_relative_face_past_image_edge() {
        let face = KeypointSet::new(vec![
            Keypoint::new(-0.1, 0.3, 0.0),
            Keypoint::new(0.4, 0.7, 0.0),
            Keypoint::new(0.2, 1.2, 0.0),
        ]);
        let vectorizer = Vectorizer::new(NormalizationMode::BoundingBoxRelative).with_landmark_count(3);
        let v = vectorizer.vectorize(&face).unwrap();
        let pad = vectorizer.padding;
        for chunk in v.values.chunks_exact(3) {
            assert!(chunk[0] >= -pad && chunk[0] <= 1.0 + pad, "nx = {}", chunk[0]);
            assert!(chunk[1] >= -pad && chunk[1] <= 1.0 + pad, "ny = {}", chunk[1]);
        }
        assert_eq!(v.values[0], 0.0);
        assert!((v.values[7] - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_bbox_relative_position_invariant() {
        let face = synthetic_face(LANDMARK_COUNT);
        let shifted = KeypointSet::new(
            face.points()
                .iter()
                .map(|p| Keypoint::new(p.x - 0.1, p.y + 0.05, p.z))
                .collect(),
        );
        let vectorizer = Vectorizer::new(NormalizationMode::BoundingBoxRelative);
        let a = vectorizer.vectorize(&face).unwrap();
        let b = vectorizer.vectorize(&shifted).unwrap();
        for (x, y) in a.values.iter().zip(&b.values) {
            assert!((x - y).abs() < 1e-4);
        }
    }

    #[test]
    fn test_wrong_landmark_count() {
        let face = synthetic_face(468);
        let err = Vectorizer::default().vectorize(&face).unwrap_err();
        assert_eq!(
            err,
            FeatureError::LandmarkCount {
                expected: LANDMARK_COUNT,
                actual: 468
            }
        );
    }

    #[test]
    fn test_degenerate_box_rejected() {
        let face = KeypointSet::new(vec![Keypoint::new(0.5, 0.5, 0.0); 4]);
        let err = Vectorizer::new(NormalizationMode::BoundingBoxRelative)
            .with_landmark_count(4)
            .vectorize(&face)
            .unwrap_err();
        assert!(matches!(err, FeatureError::DegenerateBox { .. }));
    }

    #[test]
    fn test_mode_parsing() {
        assert_eq!("bbox".parse::<NormalizationMode>().unwrap(), NormalizationMode::BoundingBoxRelative);
        assert_eq!(" Center ".parse::<NormalizationMode>().unwrap(), NormalizationMode::CenterRelative);
        assert_eq!("raw".parse::<NormalizationMode>().unwrap(), NormalizationMode::Raw);
        assert!("zyx".parse::<NormalizationMode>().is_err());
    }
}
