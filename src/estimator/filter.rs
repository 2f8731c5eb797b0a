//! Separable Gaussian filtering and peak location on row-major f64 images.
//!
//! Edges are handled by clamping sample coordinates into the image, so the
//! blur neither darkens borders nor needs an explicit padding buffer. Kernel
//! radius is `ceil(3*sigma)`, capped to the image extent so oversized sigmas
//! (the peak-localization blur uses a very large one) stay well-defined on
//! small images.

/// Normalized 1-D Gaussian kernel for the given sigma.
///
/// `max_radius` bounds the kernel half-width; pass the image extent along
/// the convolution axis. A non-positive sigma yields the identity kernel.
pub fn gaussian_kernel(sigma: f64, max_radius: usize) -> Vec<f64> {
    if sigma <= 0.0 || !sigma.is_finite() {
        return vec![1.0];
    }
    let radius = ((3.0 * sigma).ceil() as usize).clamp(1, max_radius.max(1));
    let denom = 2.0 * sigma * sigma;
    let mut kernel: Vec<f64> = (0..=2 * radius)
        .map(|i| {
            let d = i as f64 - radius as f64;
            (-d * d / denom).exp()
        })
        .collect();
    let sum: f64 = kernel.iter().sum();
    for w in &mut kernel {
        *w /= sum;
    }
    kernel
}

/// Separable Gaussian blur with clamp-to-edge sampling.
pub fn blur(pixels: &[f64], width: usize, height: usize, sigma: f64) -> Vec<f64> {
    if pixels.is_empty() || width == 0 || height == 0 || sigma <= 0.0 {
        return pixels.to_vec();
    }

    // Horizontal pass.
    let kernel = gaussian_kernel(sigma, width.saturating_sub(1));
    let radius = kernel.len() / 2;
    let mut horizontal = vec![0.0; pixels.len()];
    for y in 0..height {
        let row = &pixels[y * width..(y + 1) * width];
        for x in 0..width {
            let mut acc = 0.0;
            for (k, w) in kernel.iter().enumerate() {
                let sx = (x as isize + k as isize - radius as isize)
                    .clamp(0, width as isize - 1) as usize;
                acc += w * row[sx];
            }
            horizontal[y * width + x] = acc;
        }
    }

    // Vertical pass.
    let kernel = gaussian_kernel(sigma, height.saturating_sub(1));
    let radius = kernel.len() / 2;
    let mut out = vec![0.0; pixels.len()];
    for x in 0..width {
        for y in 0..height {
            let mut acc = 0.0;
            for (k, w) in kernel.iter().enumerate() {
                let sy = (y as isize + k as isize - radius as isize)
                    .clamp(0, height as isize - 1) as usize;
                acc += w * horizontal[sy * width + x];
            }
            out[y * width + x] = acc;
        }
    }
    out
}

/// Coordinates `(x, y)` of the maximum-intensity pixel.
///
/// Ties resolve to the first occurrence in row-major order.
pub fn peak_position(pixels: &[f64], width: usize) -> (usize, usize) {
    let mut best = 0usize;
    let mut best_value = f64::NEG_INFINITY;
    for (i, &v) in pixels.iter().enumerate() {
        if v > best_value {
            best_value = v;
            best = i;
        }
    }
    if width == 0 {
        return (0, 0);
    }
    (best % width, best / width)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kernel_is_normalized_and_symmetric() {
        let kernel = gaussian_kernel(2.0, 100);
        let sum: f64 = kernel.iter().sum();
        assert!((sum - 1.0).abs() < 1e-12);
        assert_eq!(kernel.len(), 13); // radius ceil(6) = 6
        for i in 0..kernel.len() / 2 {
            assert!((kernel[i] - kernel[kernel.len() - 1 - i]).abs() < 1e-12);
        }
    }

    #[test]
    fn oversized_sigma_is_capped_to_image_extent() {
        let kernel = gaussian_kernel(111.0, 9);
        assert_eq!(kernel.len(), 19);
        let sum: f64 = kernel.iter().sum();
        assert!((sum - 1.0).abs() < 1e-12);
    }

    #[test]
    fn blur_preserves_constant_images() {
        let img = vec![7.0; 16 * 12];
        let out = blur(&img, 16, 12, 3.0);
        for v in out {
            assert!((v - 7.0).abs() < 1e-9);
        }
    }

    #[test]
    fn blur_spreads_an_impulse_without_moving_it() {
        let (w, h) = (21, 21);
        let mut img = vec![0.0; w * h];
        img[10 * w + 10] = 100.0;
        let out = blur(&img, w, h, 2.0);

        let (px, py) = peak_position(&out, w);
        assert_eq!((px, py), (10, 10));
        // mass is conserved away from edges
        let total: f64 = out.iter().sum();
        assert!((total - 100.0).abs() < 1e-6);
        // and the peak is now much lower than the impulse
        assert!(out[10 * w + 10] < 10.0);
    }

    #[test]
    fn peak_position_finds_the_maximum() {
        let img = vec![0.0, 1.0, 5.0, 2.0, 3.0, 4.0];
        assert_eq!(peak_position(&img, 3), (2, 0));
    }
}
