//! The focus metric.
//!
//! A frame is reduced to a single scalar in a fixed sequence: grayscale
//! reduction, region-of-interest selection around the intensity peak,
//! optional denoising blur, background flattening, axis projections, and a
//! Gaussian fit of each projection. The focus value is `|sigma_x| /
//! |sigma_y|`, the ratio of the fitted widths.
//!
//! Peak localization deliberately uses its own very heavy blur: a light blur
//! cannot find the true peak under shot noise, while fitting on a heavily
//! blurred image would destroy the widths being measured. "Where to look"
//! and "how to denoise" are therefore decoupled.
//!
//! Failure handling is a strict contract: [`FocusEstimator::compute`] always
//! returns a sample and never errors. A fit that does not converge degrades
//! to the raw standard deviation of the projection; a zero vertical width
//! reports `+Infinity`; any earlier failure (malformed frame) reports `NaN`.
//! The sample's timestamp is taken at call entry regardless of outcome.

pub mod filter;
pub mod fit;

use parking_lot::RwLock;
use std::sync::Arc;

use crate::config::EstimatorConfig;
use crate::data::{unix_now, FocusSample, Frame};

/// Sigma of the blur used only to locate the intensity peak. Intentionally
/// much larger than any denoising blur and independent of the configured
/// `blur_sigma`.
pub const PEAK_LOCATE_SIGMA: f64 = 111.0;

/// Stateless focus computation, parameterized by a configuration snapshot.
///
/// The configuration is swapped atomically as a whole; a computation that
/// is already running finishes with the snapshot it started with.
pub struct FocusEstimator {
    config: RwLock<Arc<EstimatorConfig>>,
}

impl FocusEstimator {
    #[must_use]
    pub fn new(config: EstimatorConfig) -> Self {
        Self {
            config: RwLock::new(Arc::new(config)),
        }
    }

    /// Current configuration snapshot.
    #[must_use]
    pub fn config(&self) -> Arc<EstimatorConfig> {
        self.config.read().clone()
    }

    /// Replace the configuration. In-flight computations are unaffected.
    pub fn set_config(&self, config: EstimatorConfig) {
        *self.config.write() = Arc::new(config);
    }

    /// Compute the focus value for one frame.
    ///
    /// Never fails: degenerate inputs produce the `NaN`/`+Infinity`
    /// sentinels instead.
    #[must_use]
    pub fn compute(&self, frame: &Frame) -> FocusSample {
        let timestamp = unix_now();
        let config = self.config();
        let focus = compute_focus(frame, &config).unwrap_or(f64::NAN);
        FocusSample { timestamp, focus }
    }
}

impl Default for FocusEstimator {
    fn default() -> Self {
        Self::new(EstimatorConfig::default())
    }
}

/// The full pipeline. `None` means a preprocessing step could not run at
/// all (malformed frame) and maps to `NaN`.
fn compute_focus(frame: &Frame, config: &EstimatorConfig) -> Option<f64> {
    if !frame.is_well_formed() {
        return None;
    }

    let (mut image, mut width, mut height) = grayscale(frame);

    // Region of interest: find the peak on a heavily blurred copy, then
    // crop a window around it (clamped to the image bounds).
    if config.crop_radius > 0 {
        let located = filter::blur(&image, width, height, PEAK_LOCATE_SIGMA);
        let (px, py) = filter::peak_position(&located, width);
        (image, width, height) =
            crop_around(&image, width, height, px, py, config.crop_radius as usize);
    }

    if config.enable_blur {
        image = filter::blur(&image, width, height, config.blur_sigma);
    }

    // Background flattening, after the blur so the threshold does not fight
    // the smoothing: subtract half the mean, then clamp to zero below the
    // threshold.
    let mean = image.iter().sum::<f64>() / image.len() as f64;
    for v in &mut image {
        *v -= mean / 2.0;
        if *v < config.background_threshold {
            *v = 0.0;
        }
    }

    let (proj_x, proj_y) = projections(&image, width, height);

    let sigma_x = if config.use_double_gaussian_x {
        fit::fit_double_gaussian(&proj_x).map(|f| f.sigma)
    } else {
        fit::fit_gaussian(&proj_x).map(|f| f.sigma)
    }
    .unwrap_or_else(|| fit::population_std(&proj_x));

    let sigma_y = fit::fit_gaussian(&proj_y)
        .map(|f| f.sigma)
        .unwrap_or_else(|| fit::population_std(&proj_y));

    // A fitted width can come out negative; only its magnitude is
    // meaningful.
    let (sigma_x, sigma_y) = (sigma_x.abs(), sigma_y.abs());
    if sigma_y == 0.0 {
        return Some(f64::INFINITY);
    }
    Some(sigma_x / sigma_y)
}

/// Channel-averaged f64 copy of the frame.
fn grayscale(frame: &Frame) -> (Vec<f64>, usize, usize) {
    let width = frame.width as usize;
    let height = frame.height as usize;
    let channels = frame.channels as usize;
    if channels == 1 {
        let gray = frame.pixels.iter().map(|&v| f64::from(v)).collect();
        return (gray, width, height);
    }
    let gray = frame
        .pixels
        .chunks_exact(channels)
        .map(|px| px.iter().map(|&v| f64::from(v)).sum::<f64>() / channels as f64)
        .collect();
    (gray, width, height)
}

/// Square window of half-width `radius` around `(cx, cy)`, clamped to the
/// image bounds. Never empty for an in-bounds center.
fn crop_around(
    pixels: &[f64],
    width: usize,
    height: usize,
    cx: usize,
    cy: usize,
    radius: usize,
) -> (Vec<f64>, usize, usize) {
    let x_min = cx.saturating_sub(radius);
    let x_max = (cx + radius).min(width);
    let y_min = cy.saturating_sub(radius);
    let y_max = (cy + radius).min(height);

    let crop_w = x_max - x_min;
    let crop_h = y_max - y_min;
    let mut out = Vec::with_capacity(crop_w * crop_h);
    for y in y_min..y_max {
        out.extend_from_slice(&pixels[y * width + x_min..y * width + x_max]);
    }
    (out, crop_w, crop_h)
}

/// Column means (`proj_x`, length `width`) and row means (`proj_y`, length
/// `height`).
fn projections(pixels: &[f64], width: usize, height: usize) -> (Vec<f64>, Vec<f64>) {
    let mut proj_x = vec![0.0; width];
    let mut proj_y = vec![0.0; height];
    for y in 0..height {
        let row = &pixels[y * width..(y + 1) * width];
        for (x, &v) in row.iter().enumerate() {
            proj_x[x] += v;
            proj_y[y] += v;
        }
    }
    for v in &mut proj_x {
        *v /= height as f64;
    }
    for v in &mut proj_y {
        *v /= width as f64;
    }
    (proj_x, proj_y)
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Noise-free elliptical Gaussian blob on a flat background, the test
    /// pattern used throughout: background 100, amplitude 150.
    fn blob_pattern(width: usize, height: usize, sigma_x: f64, sigma_y: f64) -> Vec<f64> {
        let (cx, cy) = (width as f64 / 2.0, height as f64 / 2.0);
        let mut out = Vec::with_capacity(width * height);
        for y in 0..height {
            for x in 0..width {
                let dx = x as f64 - cx;
                let dy = y as f64 - cy;
                let value = 100.0
                    + 150.0
                        * (-dx * dx / (2.0 * sigma_x * sigma_x)
                            - dy * dy / (2.0 * sigma_y * sigma_y))
                            .exp();
                out.push(value);
            }
        }
        out
    }

    fn quantize(pixels: &[f64]) -> Vec<u8> {
        pixels.iter().map(|&v| v.clamp(0.0, 255.0) as u8).collect()
    }

    fn blob_frame(width: usize, height: usize, sigma_x: f64, sigma_y: f64) -> Frame {
        Frame::new(
            quantize(&blob_pattern(width, height, sigma_x, sigma_y)),
            width as u32,
            height as u32,
            1,
        )
    }

    #[test]
    fn sharp_blob_yields_expected_width_ratio() {
        let estimator = FocusEstimator::default();
        let frame = blob_frame(320, 240, 20.0, 15.0);
        let sample = estimator.compute(&frame);

        let expected = 20.0 / 15.0;
        assert!(
            (sample.focus - expected).abs() / expected < 0.15,
            "focus {} not within 15% of {}",
            sample.focus,
            expected
        );
    }

    #[test]
    fn focus_is_non_negative_or_sentinel() {
        let estimator = FocusEstimator::default();
        let frame = blob_frame(160, 120, 12.0, 9.0);
        let sample = estimator.compute(&frame);
        assert!(sample.focus.is_nan() || sample.focus >= 0.0);
    }

    #[test]
    fn compute_is_idempotent() {
        let estimator = FocusEstimator::default();
        let frame = blob_frame(160, 120, 10.0, 8.0);
        let a = estimator.compute(&frame);
        let b = estimator.compute(&frame);
        assert_eq!(a.focus, b.focus, "identical frame and config must agree");
    }

    #[test]
    fn pre_blurred_frame_measures_differently() {
        let estimator = FocusEstimator::default();
        let (w, h) = (320, 240);

        let sharp = blob_pattern(w, h, 20.0, 15.0);
        let blurred = filter::blur(&sharp, w, h, 12.0);

        let sharp_focus = estimator
            .compute(&Frame::new(quantize(&sharp), w as u32, h as u32, 1))
            .focus;
        let blurred_focus = estimator
            .compute(&Frame::new(quantize(&blurred), w as u32, h as u32, 1))
            .focus;

        assert!(sharp_focus.is_finite() && blurred_focus.is_finite());
        assert!(
            (sharp_focus - blurred_focus).abs() > 0.03,
            "blurring must change the metric: sharp={sharp_focus} blurred={blurred_focus}"
        );
    }

    #[test]
    fn all_zero_frame_yields_sentinel() {
        let estimator = FocusEstimator::default();
        let frame = Frame::new(vec![0u8; 160 * 120], 160, 120, 1);
        let sample = estimator.compute(&frame);
        assert!(
            sample.focus.is_nan() || sample.focus.is_infinite(),
            "no-signal frame must not produce a finite value, got {}",
            sample.focus
        );
    }

    #[test]
    fn malformed_frame_yields_nan() {
        let estimator = FocusEstimator::default();
        let empty = Frame::new(Vec::new(), 0, 0, 1);
        assert!(estimator.compute(&empty).focus.is_nan());

        let short = Frame::new(vec![0u8; 10], 160, 120, 1);
        assert!(estimator.compute(&short).focus.is_nan());
    }

    #[test]
    fn timestamp_taken_at_entry_even_on_failure() {
        let estimator = FocusEstimator::default();
        let before = unix_now();
        let sample = estimator.compute(&Frame::new(Vec::new(), 0, 0, 1));
        let after = unix_now();
        assert!(sample.timestamp >= before && sample.timestamp <= after);
    }

    #[test]
    fn rgb_channel_average_matches_grayscale() {
        let estimator = FocusEstimator::default();
        let gray = quantize(&blob_pattern(160, 120, 12.0, 9.0));
        let rgb: Vec<u8> = gray.iter().flat_map(|&v| [v, v, v]).collect();

        let gray_focus = estimator.compute(&Frame::new(gray, 160, 120, 1)).focus;
        let rgb_focus = estimator.compute(&Frame::new(rgb, 160, 120, 3)).focus;
        assert_eq!(gray_focus, rgb_focus);
    }

    #[test]
    fn config_swap_changes_behavior_atomically() {
        let estimator = FocusEstimator::default();
        assert!(estimator.config().enable_blur);

        let mut config = EstimatorConfig::default();
        config.enable_blur = false;
        config.blur_sigma = 3.0;
        estimator.set_config(config);

        let snapshot = estimator.config();
        assert!(!snapshot.enable_blur);
        assert_eq!(snapshot.blur_sigma, 3.0);
    }

    #[test]
    fn crop_clamps_to_image_bounds() {
        let pixels: Vec<f64> = (0..20).map(f64::from).collect();
        // peak near the corner: window clamps instead of wrapping
        let (crop, w, h) = crop_around(&pixels, 5, 4, 0, 0, 2);
        assert_eq!((w, h), (2, 2));
        assert_eq!(crop, vec![0.0, 1.0, 5.0, 6.0]);

        let (crop, w, h) = crop_around(&pixels, 5, 4, 2, 2, 100);
        assert_eq!((w, h), (5, 4));
        assert_eq!(crop.len(), 20);
    }

    #[test]
    fn projections_are_axis_means() {
        // 2x3 image: rows [1,2,3], [5,6,7]
        let pixels = vec![1.0, 2.0, 3.0, 5.0, 6.0, 7.0];
        let (proj_x, proj_y) = projections(&pixels, 3, 2);
        assert_eq!(proj_x, vec![3.0, 4.0, 5.0]);
        assert_eq!(proj_y, vec![2.0, 6.0]);
    }
}
