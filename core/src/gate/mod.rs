//! Image quality gate for captured document pages.
//!
//! A raw buffer from the camera or a file import is decoded upright, checked
//! against a resolution floor, bounded in size, re-encoded as JPEG and scored
//! for focus. Only an [`AcceptedImage`] can be attached to a delivery
//! document, so nothing reaches the store before admission succeeds.
//!
//! The thresholds are heuristics; a false reject is resolved by retaking the
//! photo, or by an admin switching `gate.quality_check` off.

mod orientation;
mod sharpness;

use image::codecs::jpeg::JpegEncoder;
use image::imageops::FilterType;
use image::{ColorType, DynamicImage, GenericImageView, Rgb, RgbImage};
use serde::{Deserialize, Serialize};
use tokio::task::spawn_blocking;

use crate::errors::{IntakeError, RejectReason, Result};
use crate::settings;
use crate::store::Store;

pub use orientation::Orientation;

pub const JPEG_MIME: &str = "image/jpeg";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GateConfig {
    /// When off, images are still normalised but never rejected.
    pub quality_check: bool,
    pub min_long_edge: u32,
    pub max_long_edge: u32,
    /// Longer edge of the copy the focus score is taken on; 0 scores the
    /// stored frame as is.
    pub score_long_edge: u32,
    pub blur_threshold: f64,
    pub jpeg_quality: u8,
    pub rotate_quality: u8,
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            quality_check: true,
            min_long_edge: 1500,
            max_long_edge: 2500,
            score_long_edge: 0,
            blur_threshold: 60.0,
            jpeg_quality: 85,
            rotate_quality: 90,
        }
    }
}

/// An encoded page image that passed (or bypassed) admission.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AcceptedImage {
    #[serde(skip)]
    pub bytes: Vec<u8>,
    pub mime_type: String,
    pub width: u32,
    pub height: u32,
    /// `None` for images produced by [`ImageQualityGate::rotate`].
    pub sharpness: Option<f64>,
}

impl AcceptedImage {
    pub fn size_bytes(&self) -> u64 {
        self.bytes.len() as u64
    }
}

#[derive(Debug, Clone, Default)]
pub struct ImageQualityGate {
    config: GateConfig,
}

impl ImageQualityGate {
    pub fn new(config: GateConfig) -> Self {
        Self { config }
    }

    /// Build a gate from the persisted settings.
    pub async fn from_store(store: &Store) -> Result<Self> {
        Ok(Self::new(settings::load_gate_config(store).await?))
    }

    /// Admit a raw buffer on the blocking pool. Dropping the returned future
    /// abandons the result; admission itself never touches the store.
    pub async fn admit(&self, raw: Vec<u8>) -> Result<AcceptedImage> {
        let gate = self.clone();
        spawn_blocking(move || gate.admit_blocking(&raw)).await?
    }

    pub fn admit_blocking(&self, raw: &[u8]) -> Result<AcceptedImage> {
        self.admit_frame(decode_upright(raw)?)
    }

    /// Admit an already decoded, upright frame.
    pub fn admit_frame(&self, img: DynamicImage) -> Result<AcceptedImage> {
        let cfg = &self.config;
        let (w, h) = img.dimensions();
        if cfg.quality_check && w.max(h) < cfg.min_long_edge {
            log::info!("rejecting {w}x{h} capture: below {}px", cfg.min_long_edge);
            return Err(IntakeError::Rejected(RejectReason::TooSmall));
        }

        let (tw, th) = fit_within(w, h, cfg.max_long_edge);
        let img = if (tw, th) == (w, h) {
            img
        } else {
            img.resize_exact(tw, th, FilterType::Triangle)
        };
        let bytes = encode_jpeg(&img, cfg.jpeg_quality)?;

        let score = sharpness::score(&img, cfg.score_long_edge);
        if cfg.quality_check && score < cfg.blur_threshold {
            log::info!(
                "rejecting {tw}x{th} capture: sharpness {score:.1} < {}",
                cfg.blur_threshold
            );
            return Err(IntakeError::Rejected(RejectReason::Blurry));
        }
        log::debug!("admitted {tw}x{th} capture, sharpness {score:.1}, {} bytes", bytes.len());

        Ok(AcceptedImage {
            bytes,
            mime_type: JPEG_MIME.to_string(),
            width: tw,
            height: th,
            sharpness: Some(score),
        })
    }

    /// Sharpness score alone, for live capture hints.
    pub fn score(&self, raw: &[u8]) -> Result<f64> {
        let img = decode_upright(raw)?;
        Ok(sharpness::score(&img, self.config.score_long_edge))
    }

    /// Rotate an accepted image clockwise by `degrees` on the blocking pool.
    pub async fn rotate(&self, bytes: Vec<u8>, degrees: f64) -> Result<AcceptedImage> {
        let gate = self.clone();
        spawn_blocking(move || gate.rotate_blocking(&bytes, degrees)).await?
    }

    /// Rotation keeps the whole page visible by growing the canvas and does
    /// not re-run admission.
    pub fn rotate_blocking(&self, bytes: &[u8], degrees: f64) -> Result<AcceptedImage> {
        if !degrees.is_finite() {
            return Err(IntakeError::InvalidInput(format!(
                "rotation angle {degrees} is not finite"
            )));
        }
        let img = decode_upright(bytes)?;
        let rotated = rotate_expand(&img, degrees);
        let encoded = encode_jpeg(&rotated, self.config.rotate_quality)?;
        Ok(AcceptedImage {
            bytes: encoded,
            mime_type: JPEG_MIME.to_string(),
            width: rotated.width(),
            height: rotated.height(),
            sharpness: None,
        })
    }
}

fn decode_upright(raw: &[u8]) -> Result<DynamicImage> {
    let img = image::load_from_memory(raw)?;
    Ok(Orientation::from_bytes(raw).correct(img))
}

/// Dimensions with the longer edge clamped to `max_edge`, aspect preserved.
/// Never upscales.
pub(crate) fn fit_within(w: u32, h: u32, max_edge: u32) -> (u32, u32) {
    let long = w.max(h);
    if long <= max_edge || long == 0 {
        return (w, h);
    }
    let scale = f64::from(max_edge) / f64::from(long);
    let shrink = |v: u32| ((f64::from(v) * scale).round() as u32).clamp(1, max_edge);
    if w >= h {
        (max_edge, shrink(h))
    } else {
        (shrink(w), max_edge)
    }
}

pub(crate) fn encode_jpeg(img: &DynamicImage, quality: u8) -> Result<Vec<u8>> {
    let rgb = img.to_rgb8();
    let mut out = Vec::new();
    JpegEncoder::new_with_quality(&mut out, quality)
        .encode(rgb.as_raw(), rgb.width(), rgb.height(), ColorType::Rgb8)
        .map_err(|err| IntakeError::Decode(format!("JPEG encoding failed: {err}")))?;
    Ok(out)
}

/// Rotate clockwise around the centre, expanding the canvas so nothing is
/// cropped. Uncovered corners are white, like paper.
fn rotate_expand(img: &DynamicImage, degrees: f64) -> DynamicImage {
    let turn = degrees.rem_euclid(360.0);
    match turn {
        t if t == 0.0 => return img.clone(),
        t if t == 90.0 => return img.rotate90(),
        t if t == 180.0 => return img.rotate180(),
        t if t == 270.0 => return img.rotate270(),
        _ => {}
    }

    let (sin, cos) = turn.to_radians().sin_cos();
    let (w, h) = (f64::from(img.width()), f64::from(img.height()));
    let nw = (w * cos.abs() + h * sin.abs()).round().max(1.0) as u32;
    let nh = (w * sin.abs() + h * cos.abs()).round().max(1.0) as u32;

    let src = img.to_rgb8();
    let mut out = RgbImage::from_pixel(nw, nh, Rgb([255, 255, 255]));
    let (cx, cy) = (w / 2.0, h / 2.0);
    let (ncx, ncy) = (f64::from(nw) / 2.0, f64::from(nh) / 2.0);
    for (x, y, px) in out.enumerate_pixels_mut() {
        let dx = f64::from(x) + 0.5 - ncx;
        let dy = f64::from(y) + 0.5 - ncy;
        let sx = dx * cos + dy * sin + cx;
        let sy = -dx * sin + dy * cos + cy;
        if sx >= 0.0 && sy >= 0.0 && sx < w && sy < h {
            *px = *src.get_pixel(sx as u32, sy as u32);
        }
    }
    DynamicImage::ImageRgb8(out)
}
