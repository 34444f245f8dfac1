use image::{DynamicImage, ImageBuffer, Rgb};
use log::{debug, warn};
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum RawError {
    #[error("failed to decode RAW file: {0}")]
    Decode(String),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CfaPattern {
    Rggb,
    Bggr,
    Grbg,
    Gbrg,
}

impl CfaPattern {
    fn layout(self) -> &'static [u8; 4] {
        match self {
            CfaPattern::Rggb => b"RGGB",
            CfaPattern::Bggr => b"BGGR",
            CfaPattern::Grbg => b"GRBG",
            CfaPattern::Gbrg => b"GBRG",
        }
    }

    /// Color of the sensor cell at (x, y).
    fn channel_at(self, x: usize, y: usize) -> u8 {
        self.layout()[(y & 1) * 2 + (x & 1)]
    }
}

/// Decodes a RAW image to RGB via a nearest-neighbor demosaic. Quality is
/// preview-grade, which is all the derivatives need.
pub fn decode_raw_to_dynamic_image(path: &Path) -> Result<DynamicImage, RawError> {
    debug!("Decoding RAW file: {}", path.display());

    let raw_image =
        rawloader::decode_file(path).map_err(|e| RawError::Decode(format!("{:?}", e)))?;

    let (width, height, data) = match raw_image.data {
        rawloader::RawImageData::Integer(data) => (raw_image.width, raw_image.height, data),
        rawloader::RawImageData::Float(data) => {
            let int_data: Vec<u16> = data.iter().map(|&f| f.clamp(0.0, 65535.0) as u16).collect();
            (raw_image.width, raw_image.height, int_data)
        }
    };

    let pattern = parse_cfa(&raw_image.cfa);
    let rgb8_data = demosaic_nearest(&data, width, height, pattern);

    let img_buffer: ImageBuffer<Rgb<u8>, Vec<u8>> =
        ImageBuffer::from_raw(width as u32, height as u32, rgb8_data).ok_or_else(|| {
            RawError::Decode("buffer conversion failed: invalid dimensions".to_string())
        })?;

    Ok(DynamicImage::ImageRgb8(img_buffer))
}

/// For every pixel, takes its own channel directly and borrows the two
/// missing channels from the nearest cells of the right color.
fn demosaic_nearest(data: &[u16], width: usize, height: usize, pattern: CfaPattern) -> Vec<u8> {
    let mut rgb_data = vec![0u8; width * height * 3];

    let sample = |x: usize, y: usize| -> u8 {
        if x < width && y < height {
            (data[y * width + x] >> 8) as u8
        } else {
            0
        }
    };

    // Neighbor offsets in preference order: self, cardinal, diagonal. In
    // any 2x2 Bayer block this always finds every channel.
    const OFFSETS: [(isize, isize); 9] = [
        (0, 0),
        (1, 0),
        (0, 1),
        (-1, 0),
        (0, -1),
        (1, 1),
        (-1, 1),
        (1, -1),
        (-1, -1),
    ];

    for y in 0..height {
        for x in 0..width {
            let mut rgb = [0u8; 3];
            for (slot, channel) in [(0usize, b'R'), (1, b'G'), (2, b'B')] {
                for (dx, dy) in OFFSETS {
                    let nx = x.wrapping_add_signed(dx);
                    let ny = y.wrapping_add_signed(dy);
                    if nx < width && ny < height && pattern.channel_at(nx, ny) == channel {
                        rgb[slot] = sample(nx, ny);
                        break;
                    }
                }
            }

            let out_idx = (y * width + x) * 3;
            rgb_data[out_idx] = rgb[0];
            rgb_data[out_idx + 1] = rgb[1];
            rgb_data[out_idx + 2] = rgb[2];
        }
    }

    rgb_data
}

fn parse_cfa(cfa: &rawloader::CFA) -> CfaPattern {
    // The CFA type exposes its pattern through Debug formatting only.
    let pattern_name = format!("{:?}", cfa);

    if pattern_name.contains("RGGB") {
        CfaPattern::Rggb
    } else if pattern_name.contains("BGGR") {
        CfaPattern::Bggr
    } else if pattern_name.contains("GRBG") {
        CfaPattern::Grbg
    } else if pattern_name.contains("GBRG") {
        CfaPattern::Gbrg
    } else {
        warn!("Unknown CFA pattern {}, assuming RGGB", pattern_name);
        CfaPattern::Rggb
    }
}

/// RAW formats that go through rawloader instead of the image crate.
pub fn is_raw_file(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| {
            matches!(
                ext.to_lowercase().as_str(),
                "raw" | "cr2" | "cr3" | "nef" | "arw" | "orf" | "rw2" | "dng"
            )
        })
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn test_is_raw_file() {
        assert!(is_raw_file(&PathBuf::from("photo.cr2")));
        assert!(is_raw_file(&PathBuf::from("photo.CR2")));
        assert!(is_raw_file(&PathBuf::from("photo.nef")));
        assert!(is_raw_file(&PathBuf::from("photo.arw")));
        assert!(is_raw_file(&PathBuf::from("photo.dng")));
        assert!(is_raw_file(&PathBuf::from("photo.orf")));
        assert!(is_raw_file(&PathBuf::from("photo.rw2")));

        assert!(!is_raw_file(&PathBuf::from("photo.jpg")));
        assert!(!is_raw_file(&PathBuf::from("photo.webp")));
        assert!(!is_raw_file(&PathBuf::from("video.mp4")));
    }

    #[test]
    fn test_channel_layout() {
        assert_eq!(CfaPattern::Rggb.channel_at(0, 0), b'R');
        assert_eq!(CfaPattern::Rggb.channel_at(1, 0), b'G');
        assert_eq!(CfaPattern::Rggb.channel_at(0, 1), b'G');
        assert_eq!(CfaPattern::Rggb.channel_at(1, 1), b'B');

        assert_eq!(CfaPattern::Bggr.channel_at(0, 0), b'B');
        assert_eq!(CfaPattern::Bggr.channel_at(1, 1), b'R');
    }

    #[test]
    fn test_demosaic_uniform_field() {
        // A sensor reading the same value everywhere demosaics to a
        // uniform grey regardless of pattern.
        let data = vec![0x8000u16; 4 * 4];
        for pattern in [
            CfaPattern::Rggb,
            CfaPattern::Bggr,
            CfaPattern::Grbg,
            CfaPattern::Gbrg,
        ] {
            let rgb = demosaic_nearest(&data, 4, 4, pattern);
            assert_eq!(rgb.len(), 4 * 4 * 3);
            assert!(rgb.iter().all(|&v| v == 0x80));
        }
    }

    #[test]
    fn test_decode_nonexistent_file() {
        let result = decode_raw_to_dynamic_image(&PathBuf::from("/nonexistent/file.cr2"));
        assert!(result.is_err());
    }
}
