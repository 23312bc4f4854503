//! haru-core — Emotion inference for a single selfie.
//!
//! Face-mesh landmarks are flattened into a feature vector, standardized
//! with the scaler saved at training time, and classified by a small MLP.
//! The winning emotion and intensity pick a sticker that is drawn onto the
//! photo at fixed facial anchors. Both models run via ONNX Runtime.

pub mod backend;
pub mod classifier;
pub mod compositor;
pub mod decoder;
pub mod detector;
pub mod features;
pub mod history;
pub mod landmarks;
pub mod pipeline;
pub mod scaler;
pub mod session;
pub mod types;
pub mod upload;

pub use pipeline::{Analysis, FailureReason, LandmarkRetention, Pipeline, PipelineError, PipelineParts, PipelineState};
pub use types::{ClassificationResult, Emotion, FeatureVector, Keypoint, KeypointSet};

use std::path::PathBuf;

/// Where models and the scaler are looked up when nothing else is configured.
///
/// `$XDG_DATA_HOME/haru/models`, falling back to `~/.local/share/haru/models`.
pub fn default_model_dir() -> PathBuf {
    if let Some(data) = std::env::var_os("XDG_DATA_HOME") {
        return PathBuf::from(data).join("haru/models");
    }
    match std::env::var_os("HOME") {
        Some(home) => PathBuf::from(home).join(".local/share/haru/models"),
        None => PathBuf::from("models"),
    }
}
