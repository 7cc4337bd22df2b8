//! Laplacian-variance focus measure.

use std::borrow::Cow;

use image::imageops::FilterType;
use image::{DynamicImage, GenericImageView, RgbImage};

/// Divisor applied to the raw variance so scores land in a readable range.
const SCORE_SCALE: f64 = 100.0;

/// Sharpness of `img`. When `max_edge` is non-zero the image is first shrunk
/// so its longer edge is at most `max_edge`; this only affects the score.
pub fn score(img: &DynamicImage, max_edge: u32) -> f64 {
    let (w, h) = img.dimensions();
    let sample = if max_edge > 0 && w.max(h) > max_edge {
        let (sw, sh) = super::fit_within(w, h, max_edge);
        Cow::Owned(img.resize_exact(sw, sh, FilterType::Triangle))
    } else {
        Cow::Borrowed(img)
    };
    laplacian_variance(&sample.to_rgb8()) / SCORE_SCALE
}

fn luma(rgb: &RgbImage) -> Vec<f64> {
    rgb.pixels()
        .map(|p| 0.299 * f64::from(p[0]) + 0.587 * f64::from(p[1]) + 0.114 * f64::from(p[2]))
        .collect()
}

/// Population variance of the 4-neighbour Laplacian over interior pixels.
fn laplacian_variance(rgb: &RgbImage) -> f64 {
    let (w, h) = (rgb.width() as usize, rgb.height() as usize);
    if w < 3 || h < 3 {
        return 0.0;
    }
    let gray = luma(rgb);
    let mut responses = Vec::with_capacity((w - 2) * (h - 2));
    for y in 1..h - 1 {
        for x in 1..w - 1 {
            let i = y * w + x;
            responses.push(gray[i - w] + gray[i + w] + gray[i - 1] + gray[i + 1] - 4.0 * gray[i]);
        }
    }
    let n = responses.len() as f64;
    let mean = responses.iter().sum::<f64>() / n;
    responses.iter().map(|r| (r - mean).powi(2)).sum::<f64>() / n
}
