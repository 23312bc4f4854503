//! SCRFD face detector.
//!
//! Finds face boxes in the full photo so the mesh model only ever sees a
//! face-sized crop. Boxes are in source-image pixels.

use crate::backend::{self, ExecutionBackend};
use crate::landmarks::LandmarkError;
use image::{imageops::FilterType, Rgb, RgbImage};
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;

const DETECTOR_INPUT_SIZE: u32 = 640;
const DETECTOR_MEAN: f32 = 127.5;
const DETECTOR_STD: f32 = 128.0;
const DETECTOR_SCORE_THRESHOLD: f32 = 0.5;
const DETECTOR_NMS_THRESHOLD: f32 = 0.4;
const DETECTOR_STRIDES: [usize; 3] = [8, 16, 32];
const ANCHORS_PER_CELL: usize = 2;

/// One detected face in source-image pixels.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FaceBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    pub confidence: f32,
}

impl FaceBox {
    pub fn area(&self) -> f32 {
        self.width.max(0.0) * self.height.max(0.0)
    }

    fn iou(&self, other: &FaceBox) -> f32 {
        let left = self.x.max(other.x);
        let top = self.y.max(other.y);
        let right = (self.x + self.width).min(other.x + other.width);
        let bottom = (self.y + self.height).min(other.y + other.height);

        let inter = (right - left).max(0.0) * (bottom - top).max(0.0);
        let union = self.area() + other.area() - inter;
        if union > 0.0 {
            inter / union
        } else {
            0.0
        }
    }
}

/// Scale and padding applied when fitting the photo into the square input.
#[derive(Debug, Clone, Copy)]
struct Letterbox {
    scale: f32,
    pad_x: f32,
    pad_y: f32,
}

/// (score, bbox) output indices for one stride.
type StrideOutputs = (usize, usize);

pub struct FaceDetector {
    session: Option<Session>,
    strides: [StrideOutputs; 3],
}

impl FaceDetector {
    pub fn load(model_path: &Path, backends: &[ExecutionBackend]) -> Result<Self, LandmarkError> {
        if !model_path.exists() {
            return Err(LandmarkError::ModelNotFound(model_path.display().to_string()));
        }

        let session = backend::build_session(model_path, backends)?;
        let names: Vec<String> = session.outputs().iter().map(|o| o.name().to_string()).collect();

        tracing::info!(
            path = %model_path.display(),
            outputs = ?names,
            "loaded face detector"
        );

        if names.len() < 6 {
            return Err(LandmarkError::InferenceFailed(format!(
                "face detector needs score and bbox outputs for 3 strides, got {} outputs",
                names.len()
            )));
        }

        let strides = output_layout(&names);
        tracing::debug!(?strides, "detector output layout");

        Ok(Self {
            session: Some(session),
            strides,
        })
    }

    /// Faces in `image`, highest confidence first, overlaps suppressed.
    pub fn detect(&mut self, image: &RgbImage) -> Result<Vec<FaceBox>, LandmarkError> {
        let session = self.session.as_mut().ok_or(LandmarkError::Released)?;
        let (input, letterbox) = preprocess(image);
        let outputs = session.run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let mut candidates = Vec::new();
        for (&stride, &(score_idx, bbox_idx)) in DETECTOR_STRIDES.iter().zip(&self.strides) {
            let (_, scores) = outputs[score_idx]
                .try_extract_tensor::<f32>()
                .map_err(|e| LandmarkError::InferenceFailed(format!("scores stride {stride}: {e}")))?;
            let (_, boxes) = outputs[bbox_idx]
                .try_extract_tensor::<f32>()
                .map_err(|e| LandmarkError::InferenceFailed(format!("boxes stride {stride}: {e}")))?;
            candidates.extend(decode_stride(scores, boxes, stride, &letterbox));
        }

        let faces = nms(candidates, DETECTOR_NMS_THRESHOLD);
        tracing::debug!(faces = faces.len(), "face detection done");
        Ok(faces)
    }

    pub fn release(&mut self) {
        if self.session.take().is_some() {
            tracing::debug!("face detector session released");
        }
    }
}

/// Letterbox into a 640² NCHW tensor normalized as `(p - 127.5) / 128`.
fn preprocess(image: &RgbImage) -> (Array4<f32>, Letterbox) {
    let size = DETECTOR_INPUT_SIZE;
    let (width, height) = image.dimensions();
    let scale = (size as f32 / width as f32).min(size as f32 / height as f32);

    let new_w = ((width as f32 * scale).round() as u32).clamp(1, size);
    let new_h = ((height as f32 * scale).round() as u32).clamp(1, size);
    let pad_x = (size - new_w) / 2;
    let pad_y = (size - new_h) / 2;

    let resized = image::imageops::resize(image, new_w, new_h, FilterType::Triangle);
    // Padding with the mean normalizes to zero.
    let mut canvas = RgbImage::from_pixel(size, size, Rgb([DETECTOR_MEAN as u8; 3]));
    image::imageops::replace(&mut canvas, &resized, pad_x as i64, pad_y as i64);

    let n = size as usize;
    let mut tensor = Array4::<f32>::zeros((1, 3, n, n));
    for (x, y, pixel) in canvas.enumerate_pixels() {
        for c in 0..3 {
            tensor[[0, c, y as usize, x as usize]] = (pixel[c] as f32 - DETECTOR_MEAN) / DETECTOR_STD;
        }
    }

    let letterbox = Letterbox {
        scale,
        pad_x: pad_x as f32,
        pad_y: pad_y as f32,
    };
    (tensor, letterbox)
}

/// Map stride slots to output indices, by `score_<s>`/`bbox_<s>` names when
/// present, otherwise the usual export order (scores 0-2, boxes 3-5).
fn output_layout(names: &[String]) -> [StrideOutputs; 3] {
    let find = |prefix: &str, stride: usize| {
        let target = format!("{prefix}_{stride}");
        names.iter().position(|n| *n == target)
    };

    let named: Option<Vec<StrideOutputs>> = DETECTOR_STRIDES
        .iter()
        .map(|&s| Some((find("score", s)?, find("bbox", s)?)))
        .collect();

    match named {
        Some(found) => [found[0], found[1], found[2]],
        None => [(0, 3), (1, 4), (2, 5)],
    }
}

/// Decode one stride's anchor grid into boxes in source-image pixels.
fn decode_stride(scores: &[f32], boxes: &[f32], stride: usize, letterbox: &Letterbox) -> Vec<FaceBox> {
    let grid = DETECTOR_INPUT_SIZE as usize / stride;
    let anchors = grid * grid * ANCHORS_PER_CELL;
    let step = stride as f32;

    (0..anchors)
        .filter_map(|idx| {
            let score = *scores.get(idx)?;
            if score <= DETECTOR_SCORE_THRESHOLD {
                return None;
            }
            let d = boxes.get(idx * 4..idx * 4 + 4)?;

            let cell = idx / ANCHORS_PER_CELL;
            let cx = (cell % grid) as f32 * step;
            let cy = (cell / grid) as f32 * step;

            let x1 = (cx - d[0] * step - letterbox.pad_x) / letterbox.scale;
            let y1 = (cy - d[1] * step - letterbox.pad_y) / letterbox.scale;
            let x2 = (cx + d[2] * step - letterbox.pad_x) / letterbox.scale;
            let y2 = (cy + d[3] * step - letterbox.pad_y) / letterbox.scale;

            Some(FaceBox {
                x: x1,
                y: y1,
                width: x2 - x1,
                height: y2 - y1,
                confidence: score,
            })
        })
        .collect()
}

/// Greedy non-maximum suppression; result is sorted by confidence.
fn nms(mut candidates: Vec<FaceBox>, threshold: f32) -> Vec<FaceBox> {
    candidates.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));

    let mut kept: Vec<FaceBox> = Vec::new();
    for candidate in candidates {
        if kept.iter().all(|k| k.iou(&candidate) <= threshold) {
            kept.push(candidate);
        }
    }
    kept
}

/// The face to analyze when the photo holds several: the largest one.
pub fn largest(faces: &[FaceBox]) -> Option<FaceBox> {
    faces.iter().copied().max_by(|a, b| a.area().total_cmp(&b.area()))
}
