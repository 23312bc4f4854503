use haru_core::backend::{self, ExecutionBackend};
use haru_core::compositor::{StickerPlacement, DEFAULT_OUTPUT_HEIGHT, DEFAULT_OUTPUT_WIDTH};
use haru_core::decoder::LevelPolicy;
use haru_core::features::NormalizationMode;
use haru_core::types::LANDMARK_COUNT;
use haru_core::LandmarkRetention;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("reading {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("parsing {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: toml::de::Error,
    },
    #[error("output size must be non-zero, got {width}x{height}")]
    OutputSize { width: u32, height: u32 },
}

/// Engine configuration, loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Directory containing the ONNX models and the scaler.
    pub model_dir: PathBuf,
    /// SCRFD face detector model file name.
    pub detector_model: String,
    /// Face-mesh landmark model file name.
    pub landmark_model: String,
    /// Emotion classifier model file name.
    pub emotion_model: String,
    /// Scaler parameters (JSON `mean` / `scale`).
    pub scaler_file: String,
    /// Directory holding `{emotion}_{level}.png` stickers.
    pub sticker_dir: PathBuf,
    /// Points per face the landmark model emits.
    pub landmark_count: usize,
    /// Must match the mode the classifier was trained with.
    pub normalization: NormalizationMode,
    pub level_policy: LevelPolicy,
    /// Execution backends in preference order.
    pub backends: Vec<ExecutionBackend>,
    pub retention: LandmarkRetention,
    /// Seconds to wait for models to load.
    pub load_timeout_secs: u64,
    /// Seconds one analysis may take end to end.
    pub analyze_timeout_secs: u64,
    /// Milliseconds any single stage may take; 0 disables the check.
    pub step_timeout_ms: u64,
    pub output_width: u32,
    pub output_height: u32,
    pub placements: Vec<StickerPlacement>,
}

/// Optional TOML overrides (`HARU_CONFIG_FILE`).
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct ConfigFile {
    output: Option<OutputSection>,
    #[serde(default, rename = "placement")]
    placements: Vec<StickerPlacement>,
}

#[derive(Debug, Deserialize)]
struct OutputSection {
    width: u32,
    height: u32,
}

impl Config {
    /// Load configuration from `HARU_*` environment variables with defaults.
    ///
    /// Unparseable values fall back to the default with a warning.
    pub fn from_env() -> Self {
        let model_dir = std::env::var("HARU_MODEL_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| haru_core::default_model_dir());

        let sticker_dir = std::env::var("HARU_STICKER_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| model_dir.join("../emotions"));

        let backends = match std::env::var("HARU_BACKENDS") {
            Ok(list) => backend::parse_backends(&list).unwrap_or_else(|e| {
                tracing::warn!(error = %e, "ignoring HARU_BACKENDS");
                ExecutionBackend::DEFAULT_PREFERENCE.to_vec()
            }),
            Err(_) => ExecutionBackend::DEFAULT_PREFERENCE.to_vec(),
        };

        Self {
            model_dir,
            detector_model: env_string("HARU_DETECTOR_MODEL", "face_detector.onnx"),
            landmark_model: env_string("HARU_LANDMARK_MODEL", "face_landmarks.onnx"),
            emotion_model: env_string("HARU_EMOTION_MODEL", "emotion_mlp.onnx"),
            scaler_file: env_string("HARU_SCALER_FILE", "scaler.json"),
            sticker_dir,
            landmark_count: env_parse("HARU_LANDMARK_COUNT", LANDMARK_COUNT),
            normalization: env_parse("HARU_NORMALIZATION", NormalizationMode::default()),
            level_policy: env_parse("HARU_LEVEL_POLICY", LevelPolicy::default()),
            backends,
            retention: env_parse("HARU_LANDMARK_RETENTION", LandmarkRetention::default()),
            load_timeout_secs: env_parse("HARU_LOAD_TIMEOUT_SECS", 30),
            analyze_timeout_secs: env_parse("HARU_ANALYZE_TIMEOUT_SECS", 15),
            step_timeout_ms: env_parse("HARU_STEP_TIMEOUT_MS", 0),
            output_width: env_parse("HARU_OUTPUT_WIDTH", DEFAULT_OUTPUT_WIDTH),
            output_height: env_parse("HARU_OUTPUT_HEIGHT", DEFAULT_OUTPUT_HEIGHT),
            placements: StickerPlacement::defaults(),
        }
    }

    /// Environment, then the TOML file named by `HARU_CONFIG_FILE` if set.
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = Self::from_env();
        if let Ok(path) = std::env::var("HARU_CONFIG_FILE") {
            config.apply_file(Path::new(&path))?;
        }
        Ok(config)
    }

    /// Override output size and sticker placements from a TOML file.
    ///
    /// ```toml
    /// [output]
    /// width = 1080
    /// height = 1440
    ///
    /// [[placement]]
    /// name = "top"
    /// anchor = 10
    /// width = 270
    /// height = 270
    /// offset_x = -135
    /// offset_y = -340
    /// ```
    pub fn apply_file(&mut self, path: &Path) -> Result<(), ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        let file: ConfigFile = toml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.display().to_string(),
            source,
        })?;

        if let Some(output) = file.output {
            if output.width == 0 || output.height == 0 {
                return Err(ConfigError::OutputSize {
                    width: output.width,
                    height: output.height,
                });
            }
            self.output_width = output.width;
            self.output_height = output.height;
        }
        if !file.placements.is_empty() {
            self.placements = file.placements;
        }

        tracing::info!(
            path = %path.display(),
            width = self.output_width,
            height = self.output_height,
            placements = self.placements.len(),
            "applied config file"
        );
        Ok(())
    }

    pub fn detector_model_path(&self) -> PathBuf {
        self.model_dir.join(&self.detector_model)
    }

    pub fn landmark_model_path(&self) -> PathBuf {
        self.model_dir.join(&self.landmark_model)
    }

    pub fn emotion_model_path(&self) -> PathBuf {
        self.model_dir.join(&self.emotion_model)
    }

    pub fn scaler_path(&self) -> PathBuf {
        self.model_dir.join(&self.scaler_file)
    }

    pub fn load_timeout(&self) -> Duration {
        Duration::from_secs(self.load_timeout_secs)
    }

    pub fn analyze_timeout(&self) -> Duration {
        Duration::from_secs(self.analyze_timeout_secs)
    }

    pub fn step_timeout(&self) -> Option<Duration> {
        (self.step_timeout_ms > 0).then(|| Duration::from_millis(self.step_timeout_ms))
    }
}

fn env_string(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_parse<T: FromStr>(key: &str, default: T) -> T {
    match std::env::var(key) {
        Ok(value) => value.parse().unwrap_or_else(|_| {
            tracing::warn!(key, value = %value, "unparseable value, using default");
            default
        }),
        Err(_) => default,
    }
}
