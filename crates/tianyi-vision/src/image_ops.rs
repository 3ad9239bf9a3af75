use std::io::Cursor;
use std::path::{Path, PathBuf};

use image::codecs::jpeg::JpegEncoder;
use thiserror::Error;
use tracing::debug;

use tianyi_core::error::TianyiError;

/// Vision models tile images in 28-pixel patches; the short edge is pinned
/// to 27 tiles and the long edge rounded down to a whole tile count.
const PATCH: u32 = 28;
const TARGET_SHORT_SIDE: u32 = 27 * PATCH;

#[derive(Debug, Error)]
pub enum VisionError {
    #[error("image decode failed: {0}")]
    Decode(#[from] image::ImageError),

    #[error("vision request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("vision service rejected request ({status}): {message}")]
    Api { status: u16, message: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<VisionError> for TianyiError {
    fn from(e: VisionError) -> Self {
        match e {
            VisionError::Decode(err) => TianyiError::Validation(format!("无法解析图片: {err}")),
            VisionError::Io(err) => TianyiError::Io(err),
            other => TianyiError::Upstream {
                service: "vision".to_string(),
                reason: other.to_string(),
            },
        }
    }
}

/// Re-encode an uploaded image as RGB JPEG sized for the describer.
///
/// Images whose short edge exceeds 27×28 px are shrunk so the short edge
/// lands exactly there and the long edge on a multiple of 28; smaller
/// images pass through at their original size.
pub fn normalize_image(bytes: &[u8]) -> Result<Vec<u8>, VisionError> {
    let decoded = image::load_from_memory(bytes)?;
    let rgb = decoded.to_rgb8();
    let (width, height) = rgb.dimensions();

    let (new_width, new_height) = if width < height && width > TARGET_SHORT_SIDE {
        let scaled = (u64::from(height) * u64::from(TARGET_SHORT_SIDE) / u64::from(width)) as u32;
        (TARGET_SHORT_SIDE, scaled / PATCH * PATCH)
    } else if height <= width && height > TARGET_SHORT_SIDE {
        let scaled = (u64::from(width) * u64::from(TARGET_SHORT_SIDE) / u64::from(height)) as u32;
        (scaled / PATCH * PATCH, TARGET_SHORT_SIDE)
    } else {
        (width, height)
    };

    let resized = if (new_width, new_height) == (width, height) {
        image::DynamicImage::ImageRgb8(rgb)
    } else {
        debug!(width, height, new_width, new_height, "resizing image");
        image::DynamicImage::ImageRgb8(rgb).resize_exact(
            new_width,
            new_height,
            image::imageops::FilterType::Triangle,
        )
    };

    let mut out = Vec::new();
    let encoder = JpegEncoder::new_with_quality(Cursor::new(&mut out), 85);
    resized.write_with_encoder(encoder)?;
    Ok(out)
}

/// Persist a normalized image under the uploading user's directory.
/// Returns the server path of the written file.
pub fn save_user_image(
    image_root: &Path,
    user_id: &str,
    jpeg_bytes: &[u8],
) -> Result<PathBuf, VisionError> {
    let dir = image_root.join(user_id);
    std::fs::create_dir_all(&dir)?;
    let stamp = chrono::Local::now().format("%Y-%m-%d_%H-%M-%S");
    let path = dir.join(format!("{stamp}.jpg"));
    std::fs::write(&path, jpeg_bytes)?;
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn png_bytes(width: u32, height: u32) -> Vec<u8> {
        let img = image::RgbImage::from_pixel(width, height, image::Rgb([120, 180, 60]));
        let mut out = Vec::new();
        image::DynamicImage::ImageRgb8(img)
            .write_to(&mut Cursor::new(&mut out), image::ImageFormat::Png)
            .unwrap();
        out
    }

    fn decoded_dimensions(jpeg: &[u8]) -> (u32, u32) {
        let img = image::load_from_memory(jpeg).unwrap();
        (img.width(), img.height())
    }

    #[test]
    fn landscape_upload_shrinks_to_patch_grid() {
        let jpeg = normalize_image(&png_bytes(4000, 3000)).unwrap();
        // Short edge pinned to 756, long edge 4000*756/3000 = 1008 (36 patches).
        assert_eq!(decoded_dimensions(&jpeg), (1008, 756));
    }

    #[test]
    fn portrait_upload_pins_width() {
        let jpeg = normalize_image(&png_bytes(1500, 3000)).unwrap();
        let (w, h) = decoded_dimensions(&jpeg);
        assert_eq!(w, 756);
        assert_eq!(h % 28, 0);
        assert!(h > w);
    }

    #[test]
    fn small_images_pass_through() {
        let jpeg = normalize_image(&png_bytes(300, 200)).unwrap();
        assert_eq!(decoded_dimensions(&jpeg), (300, 200));
    }

    #[test]
    fn saved_image_lands_in_user_directory() {
        let dir = tempfile::tempdir().unwrap();
        let path = save_user_image(dir.path(), "alice", b"jpeg-bytes").unwrap();
        assert!(path.starts_with(dir.path().join("alice")));
        assert_eq!(path.extension().unwrap(), "jpg");
        assert_eq!(std::fs::read(&path).unwrap(), b"jpeg-bytes");
    }
}
