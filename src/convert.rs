// convert.rs — pixel conversions and the grayscale reference.
//
// `rgba_to_gray` is the CPU reference for the GPU grayscale kernel
// (shaders/gray.wgsl): both compute BT.601 luma on raw 0..255 values and
// both round at the u8 narrowing step, so the GPU path can be validated
// against this one pixel-for-pixel.

use crate::image::{ColorImage, Image, Pixel};

/// BT.601 luma from raw 0..255 channel values. Stays in f32; rounding
/// happens only when narrowing to u8.
#[inline]
pub fn luma(r: f32, g: f32, b: f32) -> f32 {
    0.299 * r + 0.587 * g + 0.114 * b
}

/// Grayscale-convert an interleaved RGBA frame. Alpha is ignored.
pub fn rgba_to_gray(src: &ColorImage) -> Image<u8> {
    let mut dst = Image::new(src.width(), src.height());
    for y in 0..src.height() {
        for x in 0..src.width() {
            let [r, g, b, _a] = src.get(x, y);
            let v = luma(r as f32, g as f32, b as f32);
            dst.set(x, y, u8::from_f32(v));
        }
    }
    dst
}

/// Convert an Image<u8> to Image<f32> preserving raw values (42 → 42.0).
pub fn u8_to_f32_raw(src: &Image<u8>) -> Image<f32> {
    let mut dst = Image::new(src.width(), src.height());
    for y in 0..src.height() {
        for x in 0..src.width() {
            dst.set(x, y, src.get(x, y) as f32);
        }
    }
    dst
}

/// Convert an Image<f32> with raw intensities to Image<u8>, clamping and
/// rounding. This is the host-side step applied to GPU grayscale readbacks.
pub fn f32_raw_to_u8(src: &Image<f32>) -> Image<u8> {
    let mut dst = Image::new(src.width(), src.height());
    for y in 0..src.height() {
        for x in 0..src.width() {
            dst.set(x, y, u8::from_f32(src.get(x, y)));
        }
    }
    dst
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_luma_coefficients() {
        assert!((luma(255.0, 0.0, 0.0) - 0.299 * 255.0).abs() < 1e-4);
        assert!((luma(0.0, 255.0, 0.0) - 0.587 * 255.0).abs() < 1e-4);
        assert!((luma(0.0, 0.0, 255.0) - 0.114 * 255.0).abs() < 1e-4);
        // Coefficients sum to 1: neutral gray is preserved.
        assert!((luma(128.0, 128.0, 128.0) - 128.0).abs() < 1e-3);
    }

    #[test]
    fn test_rgba_to_gray_neutral() {
        let mut src = ColorImage::new(2, 1);
        src.set(0, 0, [100, 100, 100, 255]);
        src.set(1, 0, [0, 255, 0, 255]);
        let gray = rgba_to_gray(&src);
        assert_eq!(gray.get(0, 0), 100);
        assert_eq!(gray.get(1, 0), u8::from_f32(0.587 * 255.0));
    }

    #[test]
    fn test_rgba_to_gray_ignores_alpha() {
        let mut a = ColorImage::new(1, 1);
        let mut b = ColorImage::new(1, 1);
        a.set(0, 0, [90, 90, 90, 0]);
        b.set(0, 0, [90, 90, 90, 255]);
        assert_eq!(rgba_to_gray(&a).get(0, 0), rgba_to_gray(&b).get(0, 0));
    }

    #[test]
    fn test_u8_f32_roundtrip() {
        let img = Image::from_vec(2, 2, vec![0u8, 100, 200, 255]);
        let f = u8_to_f32_raw(&img);
        assert!((f.get(1, 0) - 100.0).abs() < 1e-6);
        let back = f32_raw_to_u8(&f);
        for y in 0..2 {
            for x in 0..2 {
                assert_eq!(back.get(x, y), img.get(x, y));
            }
        }
    }

    #[test]
    fn test_f32_to_u8_clamps() {
        let img = Image::from_vec(2, 1, vec![-10.0f32, 300.0]);
        let out = f32_raw_to_u8(&img);
        assert_eq!(out.get(0, 0), 0);
        assert_eq!(out.get(1, 0), 255);
    }
}
