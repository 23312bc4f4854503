//! Per-image orchestration: detect → vectorize → normalize → classify →
//! decode → composite.
//!
//! Stages run strictly in order. Between stages the session's epoch token
//! is checked so a superseded submission stops without producing output.

use crate::classifier::{ClassifierError, EmotionModel};
use crate::compositor::{ComposedImage, CompositeError, Compositor, StickerAssets};
use crate::decoder::{self, DecodeError, LevelPolicy};
use crate::features::{FeatureError, Vectorizer};
use crate::landmarks::{LandmarkError, LandmarkFactory, LandmarkProvider};
use crate::scaler::{Scaler, ScalerError};
use crate::session::{EpochToken, PipelineSession};
use crate::types::{ClassificationResult, KeypointSet};
use image::DynamicImage;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::{Duration, Instant};
use thiserror::Error;

/// Why a run ended in [`PipelineState::Failed`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FailureReason {
    NoFace,
    Timeout,
    ModelLoad,
    Inference,
    Compositing,
}

impl FailureReason {
    pub fn as_str(self) -> &'static str {
        match self {
            FailureReason::NoFace => "no-face",
            FailureReason::Timeout => "timeout",
            FailureReason::ModelLoad => "model-load",
            FailureReason::Inference => "inference",
            FailureReason::Compositing => "compositing",
        }
    }

    /// Whether retaking or reselecting the photo is the right user action.
    pub fn is_retake(self) -> bool {
        matches!(self, FailureReason::NoFace)
    }
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", content = "reason", rename_all = "kebab-case")]
pub enum PipelineState {
    Idle,
    LandmarkModelLoading,
    Ready,
    Detecting,
    Classifying,
    Compositing,
    Done,
    Failed(FailureReason),
}

impl PipelineState {
    /// Detecting, classifying or compositing.
    pub fn is_busy(&self) -> bool {
        matches!(
            self,
            PipelineState::Detecting | PipelineState::Classifying | PipelineState::Compositing
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, PipelineState::Done | PipelineState::Failed(_))
    }
}

impl fmt::Display for PipelineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PipelineState::Idle => f.write_str("idle"),
            PipelineState::LandmarkModelLoading => f.write_str("landmark-model-loading"),
            PipelineState::Ready => f.write_str("ready"),
            PipelineState::Detecting => f.write_str("detecting"),
            PipelineState::Classifying => f.write_str("classifying"),
            PipelineState::Compositing => f.write_str("compositing"),
            PipelineState::Done => f.write_str("done"),
            PipelineState::Failed(reason) => write!(f, "failed({reason})"),
        }
    }
}

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("model load failed: {0}")]
    ModelLoad(String),
    #[error("face not detected")]
    NoFace,
    #[error("landmark detection: {0}")]
    Landmark(#[from] LandmarkError),
    #[error("feature extraction: {0}")]
    Feature(#[from] FeatureError),
    #[error("feature normalization: {0}")]
    Scaler(#[from] ScalerError),
    #[error("classifier: {0}")]
    Classifier(#[from] ClassifierError),
    #[error("decoding: {0}")]
    Decode(#[from] DecodeError),
    #[error("compositing: {0}")]
    Composite(#[from] CompositeError),
    #[error("{step} exceeded its {limit:?} budget ({elapsed:?})")]
    Timeout {
        step: &'static str,
        elapsed: Duration,
        limit: Duration,
    },
    #[error("submission {epoch} superseded by a newer one")]
    Superseded { epoch: u64 },
    #[error("configuration: {0}")]
    Config(String),
}

impl PipelineError {
    /// The failure state this error puts the pipeline in.
    ///
    /// `None` for superseded runs; the newer run owns the state.
    pub fn failure_reason(&self) -> Option<FailureReason> {
        match self {
            PipelineError::Superseded { .. } => None,
            PipelineError::NoFace => Some(FailureReason::NoFace),
            PipelineError::Timeout { .. } => Some(FailureReason::Timeout),
            PipelineError::ModelLoad(_) | PipelineError::Config(_) => Some(FailureReason::ModelLoad),
            PipelineError::Composite(_) => Some(FailureReason::Compositing),
            PipelineError::Landmark(_)
            | PipelineError::Feature(_)
            | PipelineError::Scaler(_)
            | PipelineError::Classifier(_)
            | PipelineError::Decode(_) => Some(FailureReason::Inference),
        }
    }
}

/// Lifetime of the landmark provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum LandmarkRetention {
    /// Load, detect and release for every image. Bounds peak memory.
    #[default]
    PerImage,
    /// Keep one provider for the pipeline's lifetime.
    Persistent,
}

impl FromStr for LandmarkRetention {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "per-image" | "per_image" | "transient" => Ok(Self::PerImage),
            "persistent" | "singleton" => Ok(Self::Persistent),
            other => Err(format!("unknown landmark retention: {other}")),
        }
    }
}

/// Output of one successful run.
#[derive(Debug, Clone)]
pub struct Analysis {
    pub epoch: u64,
    pub classification: ClassificationResult,
    pub keypoints: KeypointSet,
    pub composed: ComposedImage,
}

/// Everything a [`Pipeline`] is built from.
pub struct PipelineParts<F, M, A> {
    pub landmarks: F,
    pub retention: LandmarkRetention,
    pub vectorizer: Vectorizer,
    pub scaler: Scaler,
    pub model: M,
    pub level_policy: LevelPolicy,
    pub compositor: Compositor,
    pub assets: A,
    /// Upper bound for any single stage.
    pub step_budget: Option<Duration>,
}

pub struct Pipeline<F: LandmarkFactory, M: EmotionModel, A: StickerAssets> {
    factory: F,
    persistent: Option<F::Provider>,
    retention: LandmarkRetention,
    vectorizer: Vectorizer,
    scaler: Scaler,
    model: M,
    level_policy: LevelPolicy,
    compositor: Compositor,
    assets: A,
    step_budget: Option<Duration>,
}

impl<F: LandmarkFactory, M: EmotionModel, A: StickerAssets> Pipeline<F, M, A> {
    /// Assemble a pipeline, checking that vectorizer, scaler and model agree
    /// on the feature dimension.
    pub fn new(parts: PipelineParts<F, M, A>) -> Result<Self, PipelineError> {
        let dim = parts.vectorizer.output_len();
        if parts.scaler.len() != dim {
            return Err(PipelineError::Config(format!(
                "scaler covers {} features but the vectorizer emits {dim}",
                parts.scaler.len()
            )));
        }
        if parts.model.input_len() != dim {
            return Err(PipelineError::Config(format!(
                "classifier expects {} features but the vectorizer emits {dim}",
                parts.model.input_len()
            )));
        }

        let persistent = match parts.retention {
            LandmarkRetention::Persistent => Some(
                parts
                    .landmarks
                    .create()
                    .map_err(|e| PipelineError::ModelLoad(e.to_string()))?,
            ),
            LandmarkRetention::PerImage => None,
        };

        tracing::info!(
            retention = ?parts.retention,
            mode = parts.vectorizer.mode.as_str(),
            level_policy = ?parts.level_policy,
            features = dim,
            "pipeline ready"
        );

        Ok(Self {
            factory: parts.landmarks,
            persistent,
            retention: parts.retention,
            vectorizer: parts.vectorizer,
            scaler: parts.scaler,
            model: parts.model,
            level_policy: parts.level_policy,
            compositor: parts.compositor,
            assets: parts.assets,
            step_budget: parts.step_budget,
        })
    }

    pub fn retention(&self) -> LandmarkRetention {
        self.retention
    }

    /// Run one image through every stage.
    ///
    /// `observer` sees every state transition. On failure the last state it
    /// sees is `Failed(reason)`, except for superseded runs.
    pub fn run(
        &mut self,
        photo: &DynamicImage,
        token: EpochToken,
        observer: &mut dyn FnMut(&PipelineState),
    ) -> Result<Analysis, PipelineError> {
        let mut session = PipelineSession::new(token);
        let result = self.run_stages(&mut session, photo, observer);

        match &result {
            Ok(analysis) => {
                tracing::info!(
                    epoch = analysis.epoch,
                    emotion = %analysis.classification.emotion,
                    level = analysis.classification.level,
                    "analysis complete"
                );
            }
            Err(err) => match err.failure_reason() {
                Some(reason) => {
                    tracing::warn!(epoch = session.epoch(), error = %err, %reason, "analysis failed");
                    session.transition(PipelineState::Failed(reason), observer);
                }
                None => {
                    tracing::debug!(epoch = session.epoch(), "stale submission dropped");
                }
            },
        }

        result
    }

    fn run_stages(
        &mut self,
        session: &mut PipelineSession<F::Provider>,
        photo: &DynamicImage,
        observer: &mut dyn FnMut(&PipelineState),
    ) -> Result<Analysis, PipelineError> {
        ensure_current(session.token())?;

        if self.retention == LandmarkRetention::PerImage {
            session.transition(PipelineState::LandmarkModelLoading, observer);
            let started = Instant::now();
            let provider = self
                .factory
                .create()
                .map_err(|e| PipelineError::ModelLoad(e.to_string()))?;
            session.attach_landmarker(provider);
            self.check_budget("landmark model load", started)?;
            session.transition(PipelineState::Ready, observer);
        }

        // Detect
        ensure_current(session.token())?;
        session.transition(PipelineState::Detecting, observer);
        let started = Instant::now();
        let rgb = photo.to_rgb8();
        let detection = match session.landmarker_mut() {
            Some(provider) => provider.detect(&rgb)?,
            None => self
                .persistent
                .as_mut()
                .ok_or(LandmarkError::Released)?
                .detect(&rgb)?,
        };
        // Free the per-image detector before the classifier runs.
        session.release_landmarker();
        self.check_budget("detection", started)?;

        let keypoints = match detection {
            Some(set) if !set.is_empty() => set,
            _ => return Err(PipelineError::NoFace),
        };

        // Classify
        ensure_current(session.token())?;
        session.transition(PipelineState::Classifying, observer);
        let started = Instant::now();
        let raw = self.vectorizer.vectorize(&keypoints)?;
        let normalized = self.scaler.normalize(&raw)?;
        let logits = self.model.run(&normalized)?;
        let classification = decoder::decode(logits, self.level_policy)?;
        self.check_budget("classification", started)?;

        // Composite
        ensure_current(session.token())?;
        session.transition(PipelineState::Compositing, observer);
        let started = Instant::now();
        let composed = self.compositor.compose(
            photo,
            &keypoints,
            classification.emotion,
            classification.level,
            &self.assets,
        )?;
        self.check_budget("compositing", started)?;

        ensure_current(session.token())?;
        session.set_composed(composed);
        session.transition(PipelineState::Done, observer);

        let composed = session
            .take_composed()
            .ok_or_else(|| PipelineError::Config("composed image missing".into()))?;

        Ok(Analysis {
            epoch: session.epoch(),
            classification,
            keypoints,
            composed,
        })
    }

    fn check_budget(&self, step: &'static str, started: Instant) -> Result<(), PipelineError> {
        let elapsed = started.elapsed();
        tracing::debug!(step, ?elapsed, "stage finished");
        match self.step_budget {
            Some(limit) if elapsed > limit => Err(PipelineError::Timeout {
                step,
                elapsed,
                limit,
            }),
            _ => Ok(()),
        }
    }
}

impl<F: LandmarkFactory, M: EmotionModel, A: StickerAssets> Drop for Pipeline<F, M, A> {
    fn drop(&mut self) {
        if let Some(mut provider) = self.persistent.take() {
            provider.release();
        }
        tracing::debug!("pipeline dropped, models released");
    }
}

fn ensure_current(token: &EpochToken) -> Result<(), PipelineError> {
    if token.is_current() {
        Ok(())
    } else {
        Err(PipelineError::Superseded {
            epoch: token.epoch(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classifier::check_input;
    use crate::compositor::StickerPlacement;
    use crate::features::NormalizationMode;
    use crate::session::EpochCounter;
    use crate::types::{Emotion, FeatureVector, Keypoint, EMOTION_CLASSES};
    use image::{Rgba, RgbImage, RgbaImage};
    use std::cell::Cell;
    use std::rc::Rc;

    const POINTS: usize = 12;

    #[derive(Default)]
    struct Counters {
        creates: Cell<usize>,
        releases: Cell<usize>,
        detects: Cell<usize>,
        runs: Cell<usize>,
        sticker_loads: Cell<usize>,
    }

    fn face() -> KeypointSet {
        KeypointSet::new(
            (0..POINTS)
                .map(|i| {
                    let t = i as f32 / POINTS as f32;
                    Keypoint::new(0.3 + 0.4 * t, 0.6 - 0.3 * t * t, 0.01 * i as f32)
                })
                .collect(),
        )
    }

    struct FakeProvider {
        result: Option<KeypointSet>,
        counters: Rc<Counters>,
    }

    impl LandmarkProvider for FakeProvider {
        fn detect(&mut self, _image: &RgbImage) -> Result<Option<KeypointSet>, LandmarkError> {
            self.counters.detects.set(self.counters.detects.get() + 1);
            Ok(self.result.clone())
        }

        fn release(&mut self) {
            self.counters.releases.set(self.counters.releases.get() + 1);
        }
    }

    struct FakeFactory {
        result: Option<KeypointSet>,
        counters: Rc<Counters>,
    }

    impl LandmarkFactory for FakeFactory {
        type Provider = FakeProvider;

        fn create(&self) -> Result<FakeProvider, LandmarkError> {
            self.counters.creates.set(self.counters.creates.get() + 1);
            Ok(FakeProvider {
                result: self.result.clone(),
                counters: Rc::clone(&self.counters),
            })
        }
    }

    /// Deterministic stand-in for the MLP: logits from feature sums.
    struct FakeModel {
        counters: Rc<Counters>,
        supersede: Option<EpochCounter>,
    }

    impl EmotionModel for FakeModel {
        fn input_len(&self) -> usize {
            POINTS * 3
        }

        fn run(&mut self, features: &FeatureVector) -> Result<[f32; EMOTION_CLASSES], ClassifierError> {
            check_input(features, self.input_len())?;
            self.counters.runs.set(self.counters.runs.get() + 1);
            if let Some(counter) = &self.supersede {
                counter.advance();
            }
            Ok(std::array::from_fn(|i| if i == 1 { 2.0 } else { 0.1 * i as f32 }))
        }
    }

    struct FakeAssets {
        counters: Rc<Counters>,
    }

    impl StickerAssets for FakeAssets {
        fn load(&self, _emotion: Emotion, _level: u8) -> Result<RgbaImage, CompositeError> {
            self.counters.sticker_loads.set(self.counters.sticker_loads.get() + 1);
            Ok(RgbaImage::from_pixel(4, 4, Rgba([255, 255, 0, 255])))
        }
    }

    fn pipeline(
        detection: Option<KeypointSet>,
        retention: LandmarkRetention,
        counters: &Rc<Counters>,
        supersede: Option<EpochCounter>,
    ) -> Pipeline<FakeFactory, FakeModel, FakeAssets> {
        let dim = POINTS * 3;
        Pipeline::new(PipelineParts {
            landmarks: FakeFactory {
                result: detection,
                counters: Rc::clone(counters),
            },
            retention,
            vectorizer: Vectorizer::new(NormalizationMode::BoundingBoxRelative).with_landmark_count(POINTS),
            scaler: Scaler::new(vec![0.5; dim], vec![0.25; dim]).unwrap(),
            model: FakeModel {
                counters: Rc::clone(counters),
                supersede,
            },
            level_policy: LevelPolicy::ProbabilityThirds,
            compositor: Compositor::new(
                30,
                40,
                vec![StickerPlacement {
                    name: "top".into(),
                    anchor: 0,
                    width: 6,
                    height: 6,
                    offset_x: -3,
                    offset_y: -3,
                }],
            )
            .unwrap(),
            assets: FakeAssets {
                counters: Rc::clone(counters),
            },
            step_budget: None,
        })
        .unwrap()
    }

    fn photo() -> DynamicImage {
        DynamicImage::ImageRgb8(RgbImage::from_pixel(60, 80, image::Rgb([10, 20, 30])))
    }

    #[test]
    fn test_happy_path_states_and_output() {
        let counters = Rc::new(Counters::default());
        let mut p = pipeline(Some(face()), LandmarkRetention::PerImage, &counters, None);
        let epochs = EpochCounter::new();
        let mut states = Vec::new();

        let analysis = p
            .run(&photo(), epochs.advance(), &mut |s: &PipelineState| states.push(*s))
            .unwrap();

        assert_eq!(
            states,
            vec![
                PipelineState::LandmarkModelLoading,
                PipelineState::Ready,
                PipelineState::Detecting,
                PipelineState::Classifying,
                PipelineState::Compositing,
                PipelineState::Done,
            ]
        );
        assert_eq!(analysis.classification.emotion, Emotion::Joy);
        assert_eq!(analysis.composed.image.dimensions(), (30, 40));
        assert_eq!(analysis.epoch, 1);
        assert_eq!(counters.runs.get(), 1);
    }

    #[test]
    fn test_no_face_short_circuits() {
        let counters = Rc::new(Counters::default());
        let mut p = pipeline(None, LandmarkRetention::PerImage, &counters, None);
        let mut states = Vec::new();

        let err = p
            .run(&photo(), EpochCounter::new().advance(), &mut |s: &PipelineState| states.push(*s))
            .unwrap_err();

        assert!(matches!(err, PipelineError::NoFace));
        assert_eq!(states.last(), Some(&PipelineState::Failed(FailureReason::NoFace)));
        assert!(!states.contains(&PipelineState::Classifying));
        assert_eq!(counters.runs.get(), 0);
        assert_eq!(counters.sticker_loads.get(), 0);
    }

    #[test]
    fn test_empty_keypoints_is_no_face() {
        let counters = Rc::new(Counters::default());
        let mut p = pipeline(Some(KeypointSet::default()), LandmarkRetention::PerImage, &counters, None);
        let mut last = PipelineState::Idle;

        let err = p
            .run(&photo(), EpochCounter::new().advance(), &mut |s: &PipelineState| last = *s)
            .unwrap_err();

        assert!(matches!(err, PipelineError::NoFace));
        assert_eq!(last, PipelineState::Failed(FailureReason::NoFace));
        assert_eq!(counters.runs.get(), 0);
        assert_eq!(counters.sticker_loads.get(), 0);
    }

    #[test]
    fn test_per_image_provider_created_and_released_each_run() {
        let counters = Rc::new(Counters::default());
        let mut p = pipeline(Some(face()), LandmarkRetention::PerImage, &counters, None);
        let epochs = EpochCounter::new();
        for _ in 0..3 {
            p.run(&photo(), epochs.advance(), &mut |_: &PipelineState| {}).unwrap();
        }
        assert_eq!(counters.creates.get(), 3);
        assert_eq!(counters.releases.get(), 3);
    }

    #[test]
    fn test_persistent_provider_reused() {
        let counters = Rc::new(Counters::default());
        let mut p = pipeline(Some(face()), LandmarkRetention::Persistent, &counters, None);
        let epochs = EpochCounter::new();
        let mut states = Vec::new();
        for _ in 0..3 {
            p.run(&photo(), epochs.advance(), &mut |s: &PipelineState| states.push(*s))
                .unwrap();
        }
        assert_eq!(counters.creates.get(), 1);
        assert_eq!(counters.releases.get(), 0);
        assert!(!states.contains(&PipelineState::LandmarkModelLoading));
        drop(p);
        assert_eq!(counters.releases.get(), 1);
    }

    #[test]
    fn test_deterministic_results() {
        let counters = Rc::new(Counters::default());
        let mut p = pipeline(Some(face()), LandmarkRetention::Persistent, &counters, None);
        let epochs = EpochCounter::new();
        let a = p.run(&photo(), epochs.advance(), &mut |_: &PipelineState| {}).unwrap();
        let b = p.run(&photo(), epochs.advance(), &mut |_: &PipelineState| {}).unwrap();
        assert_eq!(a.classification, b.classification);
        assert_eq!(a.composed.image, b.composed.image);
    }

    #[test]
    fn test_stale_token_never_runs() {
        let counters = Rc::new(Counters::default());
        let mut p = pipeline(Some(face()), LandmarkRetention::PerImage, &counters, None);
        let epochs = EpochCounter::new();
        let stale = epochs.advance();
        let _newer = epochs.advance();
        let mut states = Vec::new();

        let err = p
            .run(&photo(), stale, &mut |s: &PipelineState| states.push(*s))
            .unwrap_err();

        assert!(matches!(err, PipelineError::Superseded { epoch: 1 }));
        assert!(states.is_empty());
        assert_eq!(counters.detects.get(), 0);
    }

    #[test]
    fn test_superseded_mid_run_discards_result() {
        let counters = Rc::new(Counters::default());
        let epochs = EpochCounter::new();
        // The model bumps the epoch while "inferring", as a retake would.
        let mut p = pipeline(Some(face()), LandmarkRetention::PerImage, &counters, Some(epochs.clone()));
        let mut states = Vec::new();

        let err = p
            .run(&photo(), epochs.advance(), &mut |s: &PipelineState| states.push(*s))
            .unwrap_err();

        assert!(matches!(err, PipelineError::Superseded { .. }));
        assert_eq!(counters.runs.get(), 1);
        assert_eq!(counters.sticker_loads.get(), 0);
        assert!(!states.contains(&PipelineState::Compositing));
        assert!(!states.iter().any(|s| matches!(s, PipelineState::Failed(_))));
    }

    #[test]
    fn test_dimension_mismatch_rejected_at_build() {
        let counters = Rc::new(Counters::default());
        let result = Pipeline::new(PipelineParts {
            landmarks: FakeFactory {
                result: None,
                counters: Rc::clone(&counters),
            },
            retention: LandmarkRetention::PerImage,
            vectorizer: Vectorizer::default(),
            scaler: Scaler::new(vec![0.0; 3], vec![1.0; 3]).unwrap(),
            model: FakeModel {
                counters: Rc::clone(&counters),
                supersede: None,
            },
            level_policy: LevelPolicy::default(),
            compositor: Compositor::default(),
            assets: FakeAssets {
                counters: Rc::clone(&counters),
            },
            step_budget: None,
        });
        assert!(matches!(result, Err(PipelineError::Config(_))));
    }

    #[test]
    fn test_zero_budget_times_out() {
        let counters = Rc::new(Counters::default());
        let mut p = pipeline(Some(face()), LandmarkRetention::PerImage, &counters, None);
        p.step_budget = Some(Duration::ZERO);
        let mut last = PipelineState::Idle;

        let err = p
            .run(&photo(), EpochCounter::new().advance(), &mut |s: &PipelineState| last = *s)
            .unwrap_err();

        assert!(matches!(err, PipelineError::Timeout { .. }));
        assert_eq!(last, PipelineState::Failed(FailureReason::Timeout));
    }

    #[test]
    fn test_failure_reason_mapping() {
        assert_eq!(PipelineError::NoFace.failure_reason(), Some(FailureReason::NoFace));
        assert_eq!(PipelineError::Superseded { epoch: 3 }.failure_reason(), None);
        assert_eq!(
            PipelineError::ModelLoad("x".into()).failure_reason(),
            Some(FailureReason::ModelLoad)
        );
        assert_eq!(
            PipelineError::Composite(CompositeError::EmptyImage).failure_reason(),
            Some(FailureReason::Compositing)
        );
        assert!(FailureReason::NoFace.is_retake());
        assert!(!FailureReason::Timeout.is_retake());
    }

    #[test]
    fn test_state_display() {
        assert_eq!(PipelineState::Failed(FailureReason::NoFace).to_string(), "failed(no-face)");
        assert!(PipelineState::Classifying.is_busy());
        assert!(!PipelineState::Ready.is_busy());
        assert!(PipelineState::Done.is_terminal());
    }
}
