//! Daily record as the host posts it to the backend.
//!
//! Only the payload lives here; the HTTP request itself belongs to the host.

use crate::compositor::CompositeError;
use crate::pipeline::Analysis;
use crate::types::Emotion;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use chrono::NaiveDate;
use serde::Serialize;
use thiserror::Error;

const DATA_URL_PREFIX: &str = "data:image/png;base64,";

#[derive(Error, Debug)]
pub enum UploadError {
    #[error("not a PNG data URL")]
    NotPngDataUrl,
    #[error("base64: {0}")]
    Base64(#[from] base64::DecodeError),
    #[error("intensity must be 1..=3, got {0}")]
    Intensity(u8),
    #[error("encoding composite: {0}")]
    Composite(#[from] CompositeError),
}

/// A multipart form value.
#[derive(Debug, Clone, PartialEq)]
pub enum FormValue<'a> {
    Text(String),
    File {
        filename: &'a str,
        content_type: &'static str,
        bytes: &'a [u8],
    },
}

#[derive(Debug, Clone, Serialize)]
pub struct EmotionUpload {
    #[serde(with = "date_format")]
    pub date: NaiveDate,
    pub emotion: Emotion,
    pub intensity: u8,
    pub filename: String,
    #[serde(skip)]
    pub image_png: Vec<u8>,
}

impl EmotionUpload {
    pub fn new(date: NaiveDate, emotion: Emotion, intensity: u8, image_png: Vec<u8>) -> Result<Self, UploadError> {
        if !(1..=3).contains(&intensity) {
            return Err(UploadError::Intensity(intensity));
        }
        Ok(Self {
            date,
            emotion,
            intensity,
            filename: format!("haru_{}.png", date.format("%Y%m%d")),
            image_png,
        })
    }

    /// Build the record for a finished analysis.
    pub fn from_analysis(date: NaiveDate, analysis: &Analysis) -> Result<Self, UploadError> {
        Self::new(
            date,
            analysis.classification.emotion,
            analysis.classification.level,
            analysis.composed.to_png()?,
        )
    }

    /// Build the record from the data URL the compositor hands to the UI.
    pub fn from_data_url(
        date: NaiveDate,
        emotion: Emotion,
        intensity: u8,
        data_url: &str,
    ) -> Result<Self, UploadError> {
        let payload = data_url
            .strip_prefix(DATA_URL_PREFIX)
            .ok_or(UploadError::NotPngDataUrl)?;
        Self::new(date, emotion, intensity, BASE64.decode(payload)?)
    }

    /// Fields in posting order. The backend expects the Korean label.
    pub fn form_fields(&self) -> Vec<(&'static str, FormValue<'_>)> {
        vec![
            ("date", FormValue::Text(self.date.format("%Y-%m-%d").to_string())),
            ("emotion", FormValue::Text(self.emotion.korean().to_string())),
            ("intensity", FormValue::Text(self.intensity.to_string())),
            (
                "image",
                FormValue::File {
                    filename: &self.filename,
                    content_type: "image/png",
                    bytes: &self.image_png,
                },
            ),
        ]
    }
}

mod date_format {
    use chrono::NaiveDate;
    use serde::Serializer;

    pub fn serialize<S: Serializer>(date: &NaiveDate, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(&date.format("%Y-%m-%d"))
    }
}
