use image::DynamicImage;
use log::debug;

#[derive(Debug, thiserror::Error)]
pub enum PreviewError {
    #[error("image processing error: {0}")]
    Image(#[from] image::ImageError),
    #[error("webp encoding error: {0}")]
    WebpEncode(String),
}

/// One encoded derivative plus the dimensions it ended up with.
#[derive(Debug, Clone)]
pub struct Preview {
    pub data: Vec<u8>,
    pub width: u32,
    pub height: u32,
}

/// Applies the EXIF orientation to pixel data so previews always display
/// upright. Values 2/5/7 are the mirrored variants.
pub fn auto_orient(img: DynamicImage, orientation: Option<u16>) -> DynamicImage {
    match orientation {
        Some(2) => img.fliph(),
        Some(3) => img.rotate180(),
        Some(4) => img.flipv(),
        Some(5) => img.fliph().rotate270(),
        Some(6) => img.rotate90(),
        Some(7) => img.fliph().rotate90(),
        Some(8) => img.rotate270(),
        _ => img,
    }
}

/// Scales down so the longest edge fits `max_px`. An image already within
/// bounds is passed through untouched; previews are never upscaled.
pub fn resize_to_fit(img: &DynamicImage, max_px: u32) -> DynamicImage {
    if img.width().max(img.height()) <= max_px {
        return img.clone();
    }
    img.thumbnail(max_px, max_px)
}

/// Lossy WebP at the configured quality. The encoder only accepts RGB8 and
/// RGBA8 layouts, so everything is normalized to RGBA first; greyscale and
/// 16-bit inputs would otherwise be rejected.
pub fn encode_webp(img: &DynamicImage, quality: u8) -> Result<Vec<u8>, PreviewError> {
    let rgba = img.to_rgba8();
    let encoder = webp::Encoder::from_rgba(rgba.as_raw(), rgba.width(), rgba.height());
    let data = encoder.encode(quality as f32);
    if data.is_empty() {
        return Err(PreviewError::WebpEncode(format!(
            "encoder produced no output for {}x{}",
            rgba.width(),
            rgba.height()
        )));
    }
    Ok(data.to_vec())
}

pub fn make_preview(img: &DynamicImage, max_px: u32, quality: u8) -> Result<Preview, PreviewError> {
    let resized = resize_to_fit(img, max_px);
    let data = encode_webp(&resized, quality)?;
    debug!(
        "Encoded {}x{} preview ({} bytes)",
        resized.width(),
        resized.height(),
        data.len()
    );
    Ok(Preview {
        width: resized.width(),
        height: resized.height(),
        data,
    })
}

/// Blurhash with 4x3 components, computed from a heavily downsampled copy.
/// The hash is a placeholder for the UI; 32px of source detail is plenty.
pub fn compute_blurhash(img: &DynamicImage) -> String {
    let resized = img.thumbnail(32, 32);
    let rgba = resized.to_rgba8();
    let (width, height) = rgba.dimensions();

    let pixels: Vec<u32> = rgba
        .chunks(4)
        .map(|chunk| {
            let r = chunk[0] as u32;
            let g = chunk[1] as u32;
            let b = chunk[2] as u32;
            let a = chunk[3] as u32;
            (a << 24) | (r << 16) | (g << 8) | b
        })
        .collect();

    let dct = fast_blurhash::compute_dct(&pixels, width as usize, height as usize, 4, 3);
    dct.into_blurhash()
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgb, RgbImage};

    #[test]
    fn test_resize_never_upscales() {
        let img = DynamicImage::ImageRgb8(RgbImage::from_pixel(400, 300, Rgb([10, 20, 30])));
        let resized = resize_to_fit(&img, 800);
        assert_eq!((resized.width(), resized.height()), (400, 300));
    }

    #[test]
    fn test_resize_bounds_longest_edge() {
        let img = DynamicImage::ImageRgb8(RgbImage::from_pixel(4000, 3000, Rgb([10, 20, 30])));
        let resized = resize_to_fit(&img, 800);
        assert_eq!(resized.width().max(resized.height()), 800);
        // Aspect ratio survives.
        assert_eq!(resized.width(), 800);
        assert_eq!(resized.height(), 600);
    }

    #[test]
    fn test_orientation_rotation_swaps_dimensions() {
        let img = DynamicImage::ImageRgb8(RgbImage::from_pixel(400, 300, Rgb([1, 2, 3])));
        let rotated = auto_orient(img, Some(6));
        assert_eq!((rotated.width(), rotated.height()), (300, 400));
    }

    #[test]
    fn test_orientation_noop_for_normal() {
        let img = DynamicImage::ImageRgb8(RgbImage::from_pixel(400, 300, Rgb([1, 2, 3])));
        let same = auto_orient(img, Some(1));
        assert_eq!((same.width(), same.height()), (400, 300));
    }

    #[test]
    fn test_webp_output_is_riff() {
        let img = DynamicImage::ImageRgb8(RgbImage::from_pixel(64, 64, Rgb([200, 100, 50])));
        let data = encode_webp(&img, 85).unwrap();
        assert_eq!(&data[0..4], b"RIFF");
        assert_eq!(&data[8..12], b"WEBP");
    }

    #[test]
    fn test_blurhash_is_deterministic() {
        let img = DynamicImage::ImageRgb8(RgbImage::from_fn(64, 48, |x, y| {
            Rgb([(x * 4) as u8, (y * 5) as u8, 128])
        }));
        let first = compute_blurhash(&img);
        let second = compute_blurhash(&img);
        assert!(!first.is_empty());
        assert_eq!(first, second);
    }

    #[test]
    fn test_preview_of_small_image_keeps_dimensions() {
        let img = DynamicImage::ImageRgb8(RgbImage::from_pixel(640, 480, Rgb([9, 9, 9])));
        let small = make_preview(&img, 800, 85).unwrap();
        assert_eq!((small.width, small.height), (640, 480));
        let large = make_preview(&img, 2500, 85).unwrap();
        assert_eq!((large.width, large.height), (640, 480));
    }
}
