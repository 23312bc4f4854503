//! Face-mesh landmark provider via ONNX Runtime.
//!
//! A face detector finds the largest face, the mesh model (478 points with
//! iris refinement, 468 without) runs on a letterboxed crop around it, and
//! the points are mapped back through the letterbox and the crop to
//! coordinates normalized by the original image size.

use crate::backend::{self, ExecutionBackend};
use crate::detector::{self, FaceBox, FaceDetector};
use crate::types::{Keypoint, KeypointSet};
use image::{imageops::FilterType, Rgb, RgbImage};
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::{Path, PathBuf};
use thiserror::Error;

const MESH_INPUT_SIZE: u32 = 256;
const MESH_PRESENCE_THRESHOLD: f32 = 0.5;
/// Letterbox fill, mid-gray after scaling to [0, 1].
const MESH_PAD_VALUE: u8 = 128;
/// Context added around the detected box on every side, as a fraction of its longer side.
const CROP_MARGIN: f32 = 0.25;

#[derive(Error, Debug)]
pub enum LandmarkError {
    #[error("model file not found: {0}")]
    ModelNotFound(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("landmark model has been released")]
    Released,
    #[error("image has zero size")]
    EmptyImage,
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// Detects at most one face and returns its landmarks.
pub trait LandmarkProvider {
    /// `Ok(None)` means no face was found; that is not an error.
    fn detect(&mut self, image: &RgbImage) -> Result<Option<KeypointSet>, LandmarkError>;

    /// Free the underlying model now instead of waiting for drop.
    fn release(&mut self);
}

/// Creates landmark providers, so callers can load one per image.
pub trait LandmarkFactory {
    type Provider: LandmarkProvider;

    fn create(&self) -> Result<Self::Provider, LandmarkError>;
}

/// Metadata for coordinate de-mapping after letterbox resize.
#[derive(Debug, Clone, Copy)]
struct LetterboxInfo {
    scale: f32,
    pad_x: f32,
    pad_y: f32,
}

/// Region of the source image the mesh model runs on, in pixels.
#[derive(Debug, Clone, Copy, PartialEq)]
struct FaceCrop {
    x: u32,
    y: u32,
    width: u32,
    height: u32,
}

/// Square region around `face` with [`CROP_MARGIN`] on every side, clipped
/// to the image. `None` when nothing of it lies inside the image.
fn face_crop(face: &FaceBox, width: u32, height: u32) -> Option<FaceCrop> {
    let side = face.width.max(face.height) * (1.0 + 2.0 * CROP_MARGIN);
    let cx = face.x + face.width / 2.0;
    let cy = face.y + face.height / 2.0;

    let left = (cx - side / 2.0).floor().clamp(0.0, width as f32) as u32;
    let top = (cy - side / 2.0).floor().clamp(0.0, height as f32) as u32;
    let right = (cx + side / 2.0).ceil().clamp(0.0, width as f32) as u32;
    let bottom = (cy + side / 2.0).ceil().clamp(0.0, height as f32) as u32;

    if right <= left || bottom <= top {
        return None;
    }
    Some(FaceCrop {
        x: left,
        y: top,
        width: right - left,
        height: bottom - top,
    })
}

/// Face detector plus face-mesh ONNX model.
pub struct FaceMeshLandmarker {
    detector: FaceDetector,
    session: Option<Session>,
    landmark_count: usize,
    num_outputs: usize,
}

impl FaceMeshLandmarker {
    pub fn load(
        detector_path: &Path,
        model_path: &Path,
        landmark_count: usize,
        backends: &[ExecutionBackend],
    ) -> Result<Self, LandmarkError> {
        let detector = FaceDetector::load(detector_path, backends)?;
        if !model_path.exists() {
            return Err(LandmarkError::ModelNotFound(model_path.display().to_string()));
        }

        let session = backend::build_session(model_path, backends)?;
        let num_outputs = session.outputs().len();

        tracing::info!(
            path = %model_path.display(),
            inputs = ?session.inputs().iter().map(|i| (i.name(), i.dtype())).collect::<Vec<_>>(),
            outputs = ?session.outputs().iter().map(|o| o.name()).collect::<Vec<_>>(),
            "loaded face-mesh model"
        );

        if num_outputs == 0 {
            return Err(LandmarkError::InferenceFailed("face-mesh model has no outputs".into()));
        }

        Ok(Self {
            detector,
            session: Some(session),
            landmark_count,
            num_outputs,
        })
    }

    pub fn is_loaded(&self) -> bool {
        self.session.is_some()
    }

    /// Letterbox into a square NHWC tensor with values in [0, 1].
    fn preprocess(image: &RgbImage) -> (Array4<f32>, LetterboxInfo) {
        let size = MESH_INPUT_SIZE as f32;
        let (width, height) = image.dimensions();
        let scale = (size / width as f32).min(size / height as f32);

        let new_w = ((width as f32 * scale).round() as u32).clamp(1, MESH_INPUT_SIZE);
        let new_h = ((height as f32 * scale).round() as u32).clamp(1, MESH_INPUT_SIZE);
        let pad_x = (MESH_INPUT_SIZE - new_w) / 2;
        let pad_y = (MESH_INPUT_SIZE - new_h) / 2;

        let resized = image::imageops::resize(image, new_w, new_h, FilterType::Triangle);
        let mut canvas = RgbImage::from_pixel(
            MESH_INPUT_SIZE,
            MESH_INPUT_SIZE,
            Rgb([MESH_PAD_VALUE; 3]),
        );
        image::imageops::replace(&mut canvas, &resized, pad_x as i64, pad_y as i64);

        let n = MESH_INPUT_SIZE as usize;
        let mut tensor = Array4::<f32>::zeros((1, n, n, 3));
        for (x, y, pixel) in canvas.enumerate_pixels() {
            for c in 0..3 {
                tensor[[0, y as usize, x as usize, c]] = pixel[c] as f32 / 255.0;
            }
        }

        let letterbox = LetterboxInfo {
            scale,
            pad_x: pad_x as f32,
            pad_y: pad_y as f32,
        };
        (tensor, letterbox)
    }
}

impl LandmarkProvider for FaceMeshLandmarker {
    fn detect(&mut self, image: &RgbImage) -> Result<Option<KeypointSet>, LandmarkError> {
        let session = self.session.as_mut().ok_or(LandmarkError::Released)?;
        let (width, height) = image.dimensions();
        if width == 0 || height == 0 {
            return Err(LandmarkError::EmptyImage);
        }

        let faces = self.detector.detect(image)?;
        let Some(crop) = detector::largest(&faces).and_then(|face| face_crop(&face, width, height)) else {
            tracing::debug!(faces = faces.len(), "no usable face box");
            return Ok(None);
        };
        tracing::debug!(faces = faces.len(), ?crop, "running face mesh on crop");

        let region = image::imageops::crop_imm(image, crop.x, crop.y, crop.width, crop.height).to_image();
        let (input, letterbox) = Self::preprocess(&region);
        let outputs = session.run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let mut mesh: Option<Vec<f32>> = None;
        let mut presence: Option<f32> = None;
        for idx in 0..self.num_outputs {
            let (_, data) = outputs[idx]
                .try_extract_tensor::<f32>()
                .map_err(|e| LandmarkError::InferenceFailed(format!("output {idx}: {e}")))?;
            if data.len() >= self.landmark_count * 3 && mesh.is_none() {
                mesh = Some(data.to_vec());
            } else if data.len() == 1 && presence.is_none() {
                presence = Some(data[0]);
            }
        }

        let mesh = mesh.ok_or_else(|| {
            LandmarkError::InferenceFailed(format!(
                "no output holds {} landmark coordinates",
                self.landmark_count * 3
            ))
        })?;

        Ok(decode_mesh(
            &mesh,
            presence,
            self.landmark_count,
            &letterbox,
            &crop,
            width,
            height,
        ))
    }

    fn release(&mut self) {
        self.detector.release();
        if self.session.take().is_some() {
            tracing::debug!("face-mesh session released");
        }
    }
}

/// Presence as a probability; sigmoid is applied when the model emits a logit.
fn presence_probability(value: f32) -> f32 {
    if (0.0..=1.0).contains(&value) {
        value
    } else {
        1.0 / (1.0 + (-value).exp())
    }
}

/// Map raw mesh output (input-tensor pixels) back through the letterbox and
/// the crop to keypoints normalized by the full image, with x and y clamped
/// to [0, 1].
fn decode_mesh(
    mesh: &[f32],
    presence: Option<f32>,
    landmark_count: usize,
    letterbox: &LetterboxInfo,
    crop: &FaceCrop,
    width: u32,
    height: u32,
) -> Option<KeypointSet> {
    if let Some(score) = presence.map(presence_probability) {
        if score < MESH_PRESENCE_THRESHOLD {
            tracing::debug!(score, "face presence below threshold");
            return None;
        }
    }

    let (w, h) = (width as f32, height as f32);
    let points = mesh
        .chunks_exact(3)
        .take(landmark_count)
        .map(|c| {
            let px = crop.x as f32 + (c[0] - letterbox.pad_x) / letterbox.scale;
            let py = crop.y as f32 + (c[1] - letterbox.pad_y) / letterbox.scale;
            Keypoint::new(
                (px / w).clamp(0.0, 1.0),
                (py / h).clamp(0.0, 1.0),
                c[2] / letterbox.scale / w,
            )
        })
        .collect::<Vec<_>>();

    if points.len() < landmark_count {
        return None;
    }
    Some(KeypointSet::new(points))
}

/// Loads a fresh [`FaceMeshLandmarker`] on every call.
#[derive(Debug, Clone)]
pub struct FaceMeshFactory {
    pub detector_path: PathBuf,
    pub model_path: PathBuf,
    pub landmark_count: usize,
    pub backends: Vec<ExecutionBackend>,
}

impl LandmarkFactory for FaceMeshFactory {
    type Provider = FaceMeshLandmarker;

    fn create(&self) -> Result<FaceMeshLandmarker, LandmarkError> {
        FaceMeshLandmarker::load(
            &self.detector_path,
            &self.model_path,
            self.landmark_count,
            &self.backends,
        )
    }
}
