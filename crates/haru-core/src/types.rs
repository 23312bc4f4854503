use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;

/// Number of tracked landmarks for the face-mesh model with iris refinement.
pub const LANDMARK_COUNT: usize = 478;

/// Number of emotion classes produced by the classifier.
pub const EMOTION_CLASSES: usize = 7;

/// A single tracked facial landmark.
///
/// `x` and `y` are normalized to [0, 1] relative to the source image;
/// `z` is a relative depth on roughly the same scale as `x`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Keypoint {
    pub x: f32,
    pub y: f32,
    pub z: f32,
}

impl Keypoint {
    pub const fn new(x: f32, y: f32, z: f32) -> Self {
        Self { x, y, z }
    }
}

/// All landmarks for one detected face, in model order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct KeypointSet {
    points: Vec<Keypoint>,
}

impl KeypointSet {
    pub fn new(points: Vec<Keypoint>) -> Self {
        Self { points }
    }

    pub fn points(&self) -> &[Keypoint] {
        &self.points
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&Keypoint> {
        self.points.get(index)
    }

    /// Padded extent of all landmarks, clamped to the unit square.
    ///
    /// `padding` is a fraction of the raw extent added on every side.
    /// Returns `None` for an empty set.
    pub fn bounding_box(&self, padding: f32) -> Option<BoundingBox> {
        let first = self.points.first()?;
        let (mut min_x, mut max_x) = (first.x, first.x);
        let (mut min_y, mut max_y) = (first.y, first.y);

        for p in &self.points[1..] {
            min_x = min_x.min(p.x);
            max_x = max_x.max(p.x);
            min_y = min_y.min(p.y);
            max_y = max_y.max(p.y);
        }

        let pad_x = (max_x - min_x) * padding;
        let pad_y = (max_y - min_y) * padding;
        let x0 = (min_x - pad_x).clamp(0.0, 1.0);
        let y0 = (min_y - pad_y).clamp(0.0, 1.0);
        let x1 = (max_x + pad_x).clamp(0.0, 1.0);
        let y1 = (max_y + pad_y).clamp(0.0, 1.0);

        Some(BoundingBox {
            x: x0,
            y: y0,
            width: x1 - x0,
            height: y1 - y0,
        })
    }
}

/// Normalized face rectangle derived from a [`KeypointSet`].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
}

impl BoundingBox {
    pub fn is_degenerate(&self) -> bool {
        self.width <= f32::EPSILON || self.height <= f32::EPSILON
    }
}

/// Whether a feature vector has been standardized by a scaler yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FeatureState {
    Raw,
    Normalized,
}

/// Flattened landmark encoding fed to the emotion classifier.
#[derive(Debug, Clone, PartialEq)]
pub struct FeatureVector {
    pub values: Vec<f32>,
    pub state: FeatureState,
}

impl FeatureVector {
    pub fn raw(values: Vec<f32>) -> Self {
        Self {
            values,
            state: FeatureState::Raw,
        }
    }

    pub fn normalized(values: Vec<f32>) -> Self {
        Self {
            values,
            state: FeatureState::Normalized,
        }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn is_finite(&self) -> bool {
        self.values.iter().all(|v| v.is_finite())
    }
}

/// The seven emotion categories, in classifier output order.
///
/// Serializes as the English name. Deserializing accepts English or Korean
/// labels, and anything else becomes `Neutral`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Emotion {
    Sadness,
    Joy,
    Anger,
    Anxiety,
    Panic,
    Hurt,
    Neutral,
}

impl Emotion {
    pub const ALL: [Emotion; EMOTION_CLASSES] = [
        Emotion::Sadness,
        Emotion::Joy,
        Emotion::Anger,
        Emotion::Anxiety,
        Emotion::Panic,
        Emotion::Hurt,
        Emotion::Neutral,
    ];

    pub fn from_index(index: usize) -> Option<Self> {
        Self::ALL.get(index).copied()
    }

    pub fn index(self) -> usize {
        self as usize
    }

    /// English wire name, also used for sticker file names.
    pub fn as_str(self) -> &'static str {
        match self {
            Emotion::Sadness => "sadness",
            Emotion::Joy => "joy",
            Emotion::Anger => "anger",
            Emotion::Anxiety => "anxiety",
            Emotion::Panic => "panic",
            Emotion::Hurt => "hurt",
            Emotion::Neutral => "neutral",
        }
    }

    /// Korean display label, as sent to the backend.
    pub fn korean(self) -> &'static str {
        match self {
            Emotion::Sadness => "슬픔",
            Emotion::Joy => "기쁨",
            Emotion::Anger => "분노",
            Emotion::Anxiety => "불안",
            Emotion::Panic => "당황",
            Emotion::Hurt => "상처",
            Emotion::Neutral => "중립",
        }
    }

    /// English name or Korean label; anything else is `Neutral`.
    pub fn from_label(label: &str) -> Self {
        let label = label.trim();
        Self::ALL
            .into_iter()
            .find(|e| e.as_str().eq_ignore_ascii_case(label) || e.korean() == label)
            .unwrap_or(Emotion::Neutral)
    }
}

impl<'de> Deserialize<'de> for Emotion {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let label = String::deserialize(deserializer)?;
        Ok(Emotion::from_label(&label))
    }
}

impl fmt::Display for Emotion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Decoded output of one classifier pass.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassificationResult {
    pub emotion: Emotion,
    /// Intensity level in 1..=3.
    pub level: u8,
    pub raw_scores: [f32; EMOTION_CLASSES],
    pub probabilities: [f32; EMOTION_CLASSES],
}

impl ClassificationResult {
    /// Probability of the winning class.
    pub fn confidence(&self) -> f32 {
        self.probabilities[self.emotion.index()]
    }
}
