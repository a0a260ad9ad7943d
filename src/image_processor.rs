//! # Image Processing Module
//!
//! Questo modulo definisce la capability di manipolazione raster usata dalla pipeline
//! e la sua implementazione basata sulla crate `image`.
//!
//! ## Responsabilità:
//! - Trait `ImageEngine` (caricamento, formati supportati, probing del canale alpha)
//! - Trait `RasterImage` (scale_to_fit, resize, scale_and_crop, qualità, interlace, salvataggio)
//! - Geometria pura di fit e crop, testabile senza decodificare immagini
//! - `RasterEngine`: implementazione in puro Rust
//!
//! ## Formati Supportati da `RasterEngine`
//!
//! | Formato | Input | Output |
//! |---------|-------|--------|
//! | JPEG    | ✅    | ✅     |
//! | PNG     | ✅    | ✅     |
//! | GIF     | ✅    | ✅     |
//! | WebP    | ✅    | ❌     |
//! | AVIF    | ❌    | ❌     |
//!
//! L'interlacciamento non è supportato in scrittura: viene ignorato.
//!
//! ## Ancoraggio del crop
//! - `Anchor::Focal`: il centro del crop segue il focal point dell'asset
//! - `Anchor::Position`: allineamento `verticale-orizzontale` (es. `top-left`)

use crate::error::{Result, TransformError};
use crate::index::record::FocalPoint;
use crate::transform::definition::{Horizontal, Interlace, Vertical};
use image::codecs::jpeg::JpegEncoder;
use image::imageops::FilterType;
use image::{ColorType, DynamicImage, ImageFormat};
use std::fs::File;
use std::io::BufWriter;
use std::path::Path;

/// Where the crop window is anchored
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Anchor {
    Position(Vertical, Horizontal),
    Focal(FocalPoint),
}

impl Default for Anchor {
    fn default() -> Self {
        Anchor::Position(Vertical::Center, Horizontal::Center)
    }
}

/// A loaded image that can be transformed in place
pub trait RasterImage: Send {
    fn width(&self) -> u32;
    fn height(&self) -> u32;
    /// Scale preserving aspect ratio so the image fits inside the box
    fn scale_to_fit(&mut self, width: Option<u32>, height: Option<u32>) -> Result<()>;
    /// Resize ignoring aspect ratio
    fn resize(&mut self, width: u32, height: u32) -> Result<()>;
    fn scale_and_crop(&mut self, width: u32, height: u32, allow_upscale: bool, anchor: Anchor) -> Result<()>;
    fn set_quality(&mut self, quality: u8);
    fn set_interlace(&mut self, interlace: Interlace);
    fn is_transparent(&self) -> bool;
    /// Encode to `path`, the format is taken from its extension
    fn save_as(&self, path: &Path) -> Result<()>;
}

/// Raster image manipulation capability
pub trait ImageEngine: Send + Sync {
    fn load(&self, path: &Path) -> Result<Box<dyn RasterImage>>;
    fn supports_output(&self, format: &str) -> bool;
    /// Whether sources can be probed for transparency when picking a format
    fn supports_alpha_probe(&self) -> bool;
    fn supports_interlace(&self, format: &str) -> bool;
}

/// Dimensions after fitting `src` inside an optional box
pub fn fit_dimensions(src_width: u32, src_height: u32, width: Option<u32>, height: Option<u32>) -> (u32, u32) {
    let (sw, sh) = (src_width.max(1) as f64, src_height.max(1) as f64);
    let ratio = match (width, height) {
        (Some(w), Some(h)) => (w as f64 / sw).min(h as f64 / sh),
        (Some(w), None) => w as f64 / sw,
        (None, Some(h)) => h as f64 / sh,
        (None, None) => 1.0,
    };
    (
        ((sw * ratio).round() as u32).max(1),
        ((sh * ratio).round() as u32).max(1),
    )
}

/// Resize then crop instructions for a scale-and-crop operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CropPlan {
    pub scaled_width: u32,
    pub scaled_height: u32,
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

pub fn crop_plan(
    src_width: u32,
    src_height: u32,
    width: u32,
    height: u32,
    allow_upscale: bool,
    anchor: Anchor,
) -> CropPlan {
    let (sw, sh) = (src_width.max(1) as f64, src_height.max(1) as f64);
    let (mut tw, mut th) = (width.max(1) as f64, height.max(1) as f64);

    let mut factor = (tw / sw).max(th / sh);
    if factor > 1.0 && !allow_upscale {
        // keep the target aspect ratio but shrink the window to fit the source
        let shrink = (sw / tw).min(sh / th);
        tw = (tw * shrink).floor().max(1.0);
        th = (th * shrink).floor().max(1.0);
        factor = 1.0;
    }

    let scaled_width = ((sw * factor).round() as u32).max(tw as u32);
    let scaled_height = ((sh * factor).round() as u32).max(th as u32);
    let (crop_w, crop_h) = (tw as u32, th as u32);
    let (free_x, free_y) = (scaled_width - crop_w, scaled_height - crop_h);

    let (x, y) = match anchor {
        Anchor::Position(vertical, horizontal) => {
            let x = match horizontal {
                Horizontal::Left => 0,
                Horizontal::Center => free_x / 2,
                Horizontal::Right => free_x,
            };
            let y = match vertical {
                Vertical::Top => 0,
                Vertical::Center => free_y / 2,
                Vertical::Bottom => free_y,
            };
            (x, y)
        }
        Anchor::Focal(point) => {
            let center = |extent: u32, window: u32, at: f64| -> u32 {
                let start = extent as f64 * at - window as f64 / 2.0;
                start.round().clamp(0.0, (extent - window) as f64) as u32
            };
            (
                center(scaled_width, crop_w, point.x),
                center(scaled_height, crop_h, point.y),
            )
        }
    };

    CropPlan {
        scaled_width,
        scaled_height,
        x,
        y,
        width: crop_w,
        height: crop_h,
    }
}

/// Pure Rust engine on top of the `image` crate
#[derive(Debug, Default, Clone, Copy)]
pub struct RasterEngine;

impl RasterEngine {
    pub fn new() -> Self {
        Self
    }
}

impl ImageEngine for RasterEngine {
    fn load(&self, path: &Path) -> Result<Box<dyn RasterImage>> {
        let image = image::open(path)?;
        Ok(Box::new(RasterHandle {
            image,
            quality: 82,
            interlace: Interlace::None,
        }))
    }

    fn supports_output(&self, format: &str) -> bool {
        matches!(format, "jpg" | "jpeg" | "png" | "gif")
    }

    fn supports_alpha_probe(&self) -> bool {
        true
    }

    fn supports_interlace(&self, _format: &str) -> bool {
        false
    }
}

struct RasterHandle {
    image: DynamicImage,
    quality: u8,
    interlace: Interlace,
}

impl RasterImage for RasterHandle {
    fn width(&self) -> u32 {
        self.image.width()
    }

    fn height(&self) -> u32 {
        self.image.height()
    }

    fn scale_to_fit(&mut self, width: Option<u32>, height: Option<u32>) -> Result<()> {
        let (w, h) = fit_dimensions(self.width(), self.height(), width, height);
        self.image = self.image.resize_exact(w, h, FilterType::Lanczos3);
        Ok(())
    }

    fn resize(&mut self, width: u32, height: u32) -> Result<()> {
        self.image = self.image.resize_exact(width.max(1), height.max(1), FilterType::Lanczos3);
        Ok(())
    }

    fn scale_and_crop(&mut self, width: u32, height: u32, allow_upscale: bool, anchor: Anchor) -> Result<()> {
        let plan = crop_plan(self.width(), self.height(), width, height, allow_upscale, anchor);
        if (plan.scaled_width, plan.scaled_height) != (self.width(), self.height()) {
            self.image = self
                .image
                .resize_exact(plan.scaled_width, plan.scaled_height, FilterType::Lanczos3);
        }
        self.image = self.image.crop_imm(plan.x, plan.y, plan.width, plan.height);
        Ok(())
    }

    fn set_quality(&mut self, quality: u8) {
        self.quality = quality.clamp(1, 100);
    }

    fn set_interlace(&mut self, interlace: Interlace) {
        self.interlace = interlace;
    }

    fn is_transparent(&self) -> bool {
        self.image.color().has_alpha() && self.image.to_rgba8().pixels().any(|p| p.0[3] < u8::MAX)
    }

    fn save_as(&self, path: &Path) -> Result<()> {
        let extension = path
            .extension()
            .map(|e| e.to_string_lossy().to_lowercase())
            .unwrap_or_default();

        match extension.as_str() {
            "jpg" | "jpeg" => {
                let rgb = self.image.to_rgb8();
                let mut writer = BufWriter::new(File::create(path)?);
                JpegEncoder::new_with_quality(&mut writer, self.quality).encode(
                    rgb.as_raw(),
                    rgb.width(),
                    rgb.height(),
                    ColorType::Rgb8,
                )?;
            }
            "png" => self.image.save_with_format(path, ImageFormat::Png)?,
            "gif" => DynamicImage::ImageRgba8(self.image.to_rgba8()).save_with_format(path, ImageFormat::Gif)?,
            other => return Err(TransformError::UnsupportedFormat(other.to_string())),
        }
        Ok(())
    }
}
