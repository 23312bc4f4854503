use crate::config::Config;
use haru_core::backend;
use haru_core::classifier::EmotionClassifier;
use haru_core::compositor::{Compositor, DirStickerAssets};
use haru_core::features::Vectorizer;
use haru_core::landmarks::FaceMeshFactory;
use haru_core::scaler::Scaler;
use haru_core::{Pipeline, PipelineError, PipelineParts};
use std::path::Path;

/// The production pipeline: face detector and mesh, ONNX MLP, stickers from disk.
pub type OnnxPipeline = Pipeline<FaceMeshFactory, EmotionClassifier, DirStickerAssets>;

/// Load every model and asset named by `config`.
///
/// Fails fast: a missing model or a scaler whose length disagrees with the
/// vectorizer stops here instead of at the first image. The face models are
/// only opened per image under `PerImage` retention, so their files are
/// checked here.
pub fn build_pipeline(config: &Config) -> Result<OnnxPipeline, PipelineError> {
    let backends = backend::effective_backends(&config.backends);
    tracing::info!(
        backends = ?backends.iter().map(|b| b.as_str()).collect::<Vec<_>>(),
        model_dir = %config.model_dir.display(),
        "loading models"
    );

    let vectorizer = Vectorizer::new(config.normalization).with_landmark_count(config.landmark_count);
    let dim = vectorizer.output_len();

    let scaler = Scaler::load(&config.scaler_path())
        .and_then(|s| s.expect_len(dim))
        .map_err(|e| PipelineError::ModelLoad(e.to_string()))?;

    require_file(&config.detector_model_path())?;
    require_file(&config.landmark_model_path())?;

    let model = EmotionClassifier::load(&config.emotion_model_path(), dim, &backends)
        .map_err(|e| PipelineError::ModelLoad(e.to_string()))?;

    let compositor = Compositor::new(config.output_width, config.output_height, config.placements.clone())
        .map_err(|e| PipelineError::Config(e.to_string()))?;

    let landmarks = FaceMeshFactory {
        detector_path: config.detector_model_path(),
        model_path: config.landmark_model_path(),
        landmark_count: config.landmark_count,
        backends,
    };

    Pipeline::new(PipelineParts {
        landmarks,
        retention: config.retention,
        vectorizer,
        scaler,
        model,
        level_policy: config.level_policy,
        compositor,
        assets: DirStickerAssets::new(config.sticker_dir.clone()),
        step_budget: config.step_timeout(),
    })
}

fn require_file(path: &Path) -> Result<(), PipelineError> {
    if path.is_file() {
        Ok(())
    } else {
        Err(PipelineError::ModelLoad(format!("model file not found: {}", path.display())))
    }
}
