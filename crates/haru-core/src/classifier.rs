//! Emotion classifier (small MLP) via ONNX Runtime.
//!
//! Takes one standardized landmark vector as a `[1, N]` tensor and returns
//! seven logits in [`Emotion::ALL`](crate::types::Emotion::ALL) order.

use crate::backend::{self, ExecutionBackend};
use crate::types::{FeatureState, FeatureVector, EMOTION_CLASSES};
use ndarray::Array2;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ClassifierError {
    #[error("model file not found: {0}")]
    ModelNotFound(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("classifier expects {expected} features, got {actual}")]
    InputLength { expected: usize, actual: usize },
    #[error("classifier input must be normalized")]
    NotNormalized,
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// Anything that maps a normalized feature vector to seven logits.
///
/// Calls take `&mut self`, so a single handle can never run two passes at
/// once.
pub trait EmotionModel {
    fn input_len(&self) -> usize;
    fn run(&mut self, features: &FeatureVector) -> Result<[f32; EMOTION_CLASSES], ClassifierError>;
}

/// ONNX-backed emotion classifier. Dropping it releases the session.
pub struct EmotionClassifier {
    session: Session,
    input_len: usize,
}

impl EmotionClassifier {
    /// Load the classifier from `model_path`.
    ///
    /// `input_len` is the feature dimension the model was trained on; it is
    /// checked against the model's declared input shape when available.
    pub fn load(
        model_path: &Path,
        input_len: usize,
        backends: &[ExecutionBackend],
    ) -> Result<Self, ClassifierError> {
        if !model_path.exists() {
            return Err(ClassifierError::ModelNotFound(model_path.display().to_string()));
        }

        let session = backend::build_session(model_path, backends)?;

        tracing::info!(
            path = %model_path.display(),
            inputs = ?session.inputs().iter().map(|i| (i.name(), i.dtype())).collect::<Vec<_>>(),
            outputs = ?session.outputs().iter().map(|o| o.name()).collect::<Vec<_>>(),
            input_len,
            "loaded emotion classifier"
        );

        if session.inputs().is_empty() || session.outputs().is_empty() {
            return Err(ClassifierError::InferenceFailed(
                "model must declare at least one input and one output".into(),
            ));
        }

        Ok(Self { session, input_len })
    }
}

impl EmotionModel for EmotionClassifier {
    fn input_len(&self) -> usize {
        self.input_len
    }

    fn run(&mut self, features: &FeatureVector) -> Result<[f32; EMOTION_CLASSES], ClassifierError> {
        check_input(features, self.input_len)?;

        let input = Array2::from_shape_vec((1, features.len()), features.values.clone())
            .map_err(|e| ClassifierError::InferenceFailed(format!("input shape: {e}")))?;

        let outputs = self
            .session
            .run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let (_, logits) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| ClassifierError::InferenceFailed(format!("logits: {e}")))?;

        logits_from_slice(logits)
    }
}

/// Reject vectors the classifier must never see.
pub(crate) fn check_input(features: &FeatureVector, expected: usize) -> Result<(), ClassifierError> {
    if features.state != FeatureState::Normalized {
        return Err(ClassifierError::NotNormalized);
    }
    if features.len() != expected {
        return Err(ClassifierError::InputLength {
            expected,
            actual: features.len(),
        });
    }
    Ok(())
}

fn logits_from_slice(logits: &[f32]) -> Result<[f32; EMOTION_CLASSES], ClassifierError> {
    <[f32; EMOTION_CLASSES]>::try_from(logits).map_err(|_| {
        ClassifierError::InferenceFailed(format!(
            "expected {EMOTION_CLASSES} logits, got {}",
            logits.len()
        ))
    })
}
