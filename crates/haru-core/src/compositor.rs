//! Cover-fit photo + landmark-anchored emotion stickers.

use crate::types::{Emotion, KeypointSet};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use image::{imageops::FilterType, DynamicImage, ImageFormat, RgbaImage};
use serde::{Deserialize, Serialize};
use std::io::Cursor;
use std::path::{Path, PathBuf};
use thiserror::Error;

pub const DEFAULT_OUTPUT_WIDTH: u32 = 1440;
pub const DEFAULT_OUTPUT_HEIGHT: u32 = 1920;

#[derive(Error, Debug)]
pub enum CompositeError {
    #[error("sticker asset not found: {0}")]
    AssetNotFound(String),
    #[error("failed to load sticker {path}: {source}")]
    AssetLoad {
        path: String,
        #[source]
        source: image::ImageError,
    },
    #[error("landmark {index} out of range ({count} landmarks)")]
    AnchorOutOfRange { index: usize, count: usize },
    #[error("invalid output size {width}x{height}")]
    InvalidOutputSize { width: u32, height: u32 },
    #[error("source image has zero size")]
    EmptyImage,
    #[error("PNG encoding failed: {0}")]
    Encode(#[from] image::ImageError),
}

/// One sticker position, in output-canvas pixels relative to a landmark.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StickerPlacement {
    pub name: String,
    /// Landmark index the sticker is anchored to.
    pub anchor: usize,
    pub width: u32,
    pub height: u32,
    pub offset_x: i32,
    pub offset_y: i32,
}

impl StickerPlacement {
    /// Forehead-top, left-cheek and right-cheek, sized for a 1440px canvas.
    pub fn defaults() -> Vec<StickerPlacement> {
        vec![
            StickerPlacement {
                name: "top".into(),
                anchor: 10,
                width: 360,
                height: 360,
                offset_x: -180,
                offset_y: -450,
            },
            StickerPlacement {
                name: "left".into(),
                anchor: 127,
                width: 300,
                height: 300,
                offset_x: -360,
                offset_y: -150,
            },
            StickerPlacement {
                name: "right".into(),
                anchor: 356,
                width: 270,
                height: 270,
                offset_x: 90,
                offset_y: -135,
            },
        ]
    }
}

/// Source of sticker images for an `(emotion, level)` pair.
pub trait StickerAssets {
    fn load(&self, emotion: Emotion, level: u8) -> Result<RgbaImage, CompositeError>;
}

/// Stickers stored as `{emotion}_{level}.png` in one directory.
#[derive(Debug, Clone)]
pub struct DirStickerAssets {
    dir: PathBuf,
}

impl DirStickerAssets {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn path_for(&self, emotion: Emotion, level: u8) -> PathBuf {
        self.dir.join(format!("{}_{}.png", emotion.as_str(), level))
    }
}

impl StickerAssets for DirStickerAssets {
    fn load(&self, emotion: Emotion, level: u8) -> Result<RgbaImage, CompositeError> {
        let path = self.path_for(emotion, level);
        if !path.exists() {
            return Err(CompositeError::AssetNotFound(path.display().to_string()));
        }
        image::open(&path)
            .map(|img| img.to_rgba8())
            .map_err(|source| CompositeError::AssetLoad {
                path: path.display().to_string(),
                source,
            })
    }
}

/// Source rectangle (pixels) cropped out of the photo for cover-fit.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CropRect {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

/// Largest centered crop of `src` with the aspect ratio of `dst`.
pub fn cover_crop(src_w: u32, src_h: u32, dst_w: u32, dst_h: u32) -> CropRect {
    let src_ratio = src_w as f64 / src_h as f64;
    let dst_ratio = dst_w as f64 / dst_h as f64;

    if src_ratio > dst_ratio {
        // Too wide: keep full height, trim the sides.
        let width = ((src_h as f64 * dst_ratio).round() as u32).clamp(1, src_w);
        CropRect {
            x: (src_w - width) / 2,
            y: 0,
            width,
            height: src_h,
        }
    } else {
        let height = ((src_w as f64 / dst_ratio).round() as u32).clamp(1, src_h);
        CropRect {
            x: 0,
            y: (src_h - height) / 2,
            width: src_w,
            height,
        }
    }
}

/// A finished composite.
#[derive(Debug, Clone)]
pub struct ComposedImage {
    pub image: RgbaImage,
}

impl ComposedImage {
    pub fn to_png(&self) -> Result<Vec<u8>, CompositeError> {
        let mut buf = Cursor::new(Vec::new());
        DynamicImage::ImageRgba8(self.image.clone()).write_to(&mut buf, ImageFormat::Png)?;
        Ok(buf.into_inner())
    }

    /// `data:image/png;base64,...`, the form the host UI displays and uploads.
    pub fn to_data_url(&self) -> Result<String, CompositeError> {
        Ok(format!("data:image/png;base64,{}", BASE64.encode(self.to_png()?)))
    }

    pub fn save(&self, path: &Path) -> Result<(), CompositeError> {
        self.image.save(path)?;
        Ok(())
    }
}

/// Draws the photo at a fixed size and overlays stickers.
#[derive(Debug, Clone)]
pub struct Compositor {
    pub width: u32,
    pub height: u32,
    pub placements: Vec<StickerPlacement>,
}

impl Default for Compositor {
    fn default() -> Self {
        Self {
            width: DEFAULT_OUTPUT_WIDTH,
            height: DEFAULT_OUTPUT_HEIGHT,
            placements: StickerPlacement::defaults(),
        }
    }
}

impl Compositor {
    pub fn new(width: u32, height: u32, placements: Vec<StickerPlacement>) -> Result<Self, CompositeError> {
        if width == 0 || height == 0 {
            return Err(CompositeError::InvalidOutputSize { width, height });
        }
        Ok(Self {
            width,
            height,
            placements,
        })
    }

    /// Compose `photo` with the sticker for `(emotion, level)`.
    ///
    /// The sticker is loaded and every anchor resolved before anything is
    /// drawn; any failure leaves no partial output.
    pub fn compose(
        &self,
        photo: &DynamicImage,
        keypoints: &KeypointSet,
        emotion: Emotion,
        level: u8,
        assets: &dyn StickerAssets,
    ) -> Result<ComposedImage, CompositeError> {
        let (src_w, src_h) = (photo.width(), photo.height());
        if src_w == 0 || src_h == 0 {
            return Err(CompositeError::EmptyImage);
        }

        let sticker = assets.load(emotion, level)?;
        let crop = cover_crop(src_w, src_h, self.width, self.height);
        let sx = self.width as f32 / crop.width as f32;
        let sy = self.height as f32 / crop.height as f32;

        let mut stamps = Vec::with_capacity(self.placements.len());
        for placement in &self.placements {
            let anchor = keypoints.get(placement.anchor).ok_or(CompositeError::AnchorOutOfRange {
                index: placement.anchor,
                count: keypoints.len(),
            })?;
            // Landmark → source pixels → canvas pixels.
            let cx = (anchor.x * src_w as f32 - crop.x as f32) * sx;
            let cy = (anchor.y * src_h as f32 - crop.y as f32) * sy;
            let resized = image::imageops::resize(
                &sticker,
                placement.width.max(1),
                placement.height.max(1),
                FilterType::Triangle,
            );
            stamps.push((
                resized,
                cx.round() as i64 + placement.offset_x as i64,
                cy.round() as i64 + placement.offset_y as i64,
            ));
        }

        let cropped = photo.crop_imm(crop.x, crop.y, crop.width, crop.height);
        let mut canvas = cropped
            .resize_exact(self.width, self.height, FilterType::Triangle)
            .to_rgba8();

        for (stamp, x, y) in &stamps {
            image::imageops::overlay(&mut canvas, stamp, *x, *y);
        }

        tracing::debug!(
            %emotion,
            level,
            stickers = stamps.len(),
            width = self.width,
            height = self.height,
            "composited result"
        );

        Ok(ComposedImage { image: canvas })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Keypoint;
    use image::{Rgba, RgbImage};
    use std::cell::Cell;

    struct SolidSticker {
        color: Rgba<u8>,
        loads: Cell<usize>,
    }

    impl StickerAssets for SolidSticker {
        fn load(&self, _emotion: Emotion, _level: u8) -> Result<RgbaImage, CompositeError> {
            self.loads.set(self.loads.get() + 1);
            Ok(RgbaImage::from_pixel(8, 8, self.color))
        }
    }

    struct MissingSticker;

    impl StickerAssets for MissingSticker {
        fn load(&self, emotion: Emotion, level: u8) -> Result<RgbaImage, CompositeError> {
            Err(CompositeError::AssetNotFound(format!("{emotion}_{level}.png")))
        }
    }

    fn centered_face() -> KeypointSet {
        KeypointSet::new(vec![Keypoint::new(0.5, 0.5, 0.0); 3])
    }

    fn one_placement(anchor: usize) -> Vec<StickerPlacement> {
        vec![StickerPlacement {
            name: "center".into(),
            anchor,
            width: 10,
            height: 10,
            offset_x: -5,
            offset_y: -5,
        }]
    }

    #[test]
    fn test_cover_crop_wide_source() {
        // 4000x3000 into 3:4 → keep 3000 high, 2250 wide, centered.
        let crop = cover_crop(4000, 3000, 1440, 1920);
        assert_eq!(crop, CropRect { x: 875, y: 0, width: 2250, height: 3000 });
    }

    #[test]
    fn test_cover_crop_tall_source() {
        // 1000x2000 into 3:4 → keep 1000 wide, 1333 high, centered.
        let crop = cover_crop(1000, 2000, 1440, 1920);
        assert_eq!(crop.width, 1000);
        assert_eq!(crop.height, 1333);
        assert_eq!(crop.y, 333);
    }

    #[test]
    fn test_cover_crop_same_ratio() {
        let crop = cover_crop(720, 960, 1440, 1920);
        assert_eq!(crop, CropRect { x: 0, y: 0, width: 720, height: 960 });
    }

    #[test]
    fn test_compose_output_size_and_sticker() {
        let photo = DynamicImage::ImageRgb8(RgbImage::from_pixel(400, 300, image::Rgb([0, 0, 255])));
        let compositor = Compositor::new(90, 120, one_placement(0)).unwrap();
        let assets = SolidSticker {
            color: Rgba([255, 0, 0, 255]),
            loads: Cell::new(0),
        };
        let out = compositor
            .compose(&photo, &centered_face(), Emotion::Joy, 2, &assets)
            .unwrap();
        assert_eq!(out.image.dimensions(), (90, 120));
        assert_eq!(assets.loads.get(), 1);
        // Face center lands on canvas center, covered by the red sticker.
        assert_eq!(out.image.get_pixel(45, 60), &Rgba([255, 0, 0, 255]));
        // Far corner keeps the photo.
        assert_eq!(out.image.get_pixel(1, 1), &Rgba([0, 0, 255, 255]));
    }

    #[test]
    fn test_missing_asset_aborts() {
        let photo = DynamicImage::ImageRgb8(RgbImage::new(40, 40));
        let compositor = Compositor::new(30, 40, one_placement(0)).unwrap();
        let err = compositor
            .compose(&photo, &centered_face(), Emotion::Hurt, 1, &MissingSticker)
            .unwrap_err();
        assert!(matches!(err, CompositeError::AssetNotFound(_)));
    }

    #[test]
    fn test_anchor_out_of_range() {
        let photo = DynamicImage::ImageRgb8(RgbImage::new(40, 40));
        let compositor = Compositor::new(30, 40, one_placement(356)).unwrap();
        let assets = SolidSticker {
            color: Rgba([0, 0, 0, 255]),
            loads: Cell::new(0),
        };
        let err = compositor
            .compose(&photo, &centered_face(), Emotion::Joy, 1, &assets)
            .unwrap_err();
        assert!(matches!(err, CompositeError::AnchorOutOfRange { index: 356, count: 3 }));
    }

    #[test]
    fn test_zero_output_size_rejected() {
        assert!(Compositor::new(0, 10, vec![]).is_err());
    }

    #[test]
    fn test_data_url_prefix() {
        let composed = ComposedImage {
            image: RgbaImage::from_pixel(2, 2, Rgba([1, 2, 3, 255])),
        };
        let url = composed.to_data_url().unwrap();
        assert!(url.starts_with("data:image/png;base64,iVBORw0KGgo"));
    }

    #[test]
    fn test_dir_assets_path_and_missing() {
        let dir = tempfile::tempdir().unwrap();
        let assets = DirStickerAssets::new(dir.path());
        assert_eq!(assets.path_for(Emotion::Joy, 3), dir.path().join("joy_3.png"));
        assert!(matches!(
            assets.load(Emotion::Joy, 3),
            Err(CompositeError::AssetNotFound(_))
        ));

        RgbaImage::from_pixel(4, 4, Rgba([9, 9, 9, 255]))
            .save(assets.path_for(Emotion::Panic, 1))
            .unwrap();
        let sticker = assets.load(Emotion::Panic, 1).unwrap();
        assert_eq!(sticker.dimensions(), (4, 4));
    }
}
