//! Image preprocessing for VLM requests.
//!
//! Full-resolution bodies routinely push the station past its timeout, so
//! file references are downscaled and re-encoded as JPEG before being
//! inlined as `data:` URLs. References that are already URLs pass through
//! untouched.

use std::io::Cursor;
use std::path::Path;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use image::codecs::jpeg::JpegEncoder;
use image::imageops::FilterType;

use crate::config::Config;

/// Prepares image references for submission to a VLM.
#[derive(Debug, Clone)]
pub struct ImagePreprocessor {
    max_side: u32,
    jpeg_quality: u8,
    raw_bytes: bool,
}

impl ImagePreprocessor {
    pub fn new(max_side: u32, jpeg_quality: u8, raw_bytes: bool) -> Self {
        Self {
            max_side,
            jpeg_quality,
            raw_bytes,
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(
            config.max_image_side,
            config.jpeg_quality,
            config.raw_image_bytes,
        )
    }

    /// Turn an image reference into a URL the VLM accepts.
    ///
    /// `http://`, `https://` and `data:` references are returned as-is.
    /// File paths become `data:image/jpeg;base64,…` after downscaling, or a
    /// raw base64 data URL when decoding fails or raw mode is on.
    pub fn image_url(&self, reference: &str) -> std::io::Result<String> {
        if reference.starts_with("http://")
            || reference.starts_with("https://")
            || reference.starts_with("data:")
        {
            return Ok(reference.to_string());
        }

        let path = Path::new(reference);
        if self.raw_bytes {
            return self.raw_data_url(path);
        }

        match self.downscaled_jpeg_url(path) {
            Ok(url) => Ok(url),
            Err(err) => {
                tracing::debug!(path = reference, error = %err, "decode failed, sending raw bytes");
                self.raw_data_url(path)
            }
        }
    }

    fn downscaled_jpeg_url(&self, path: &Path) -> Result<String, image::ImageError> {
        let img = image::open(path)?;
        let img = if self.max_side > 0 && img.width().max(img.height()) > self.max_side {
            img.resize(self.max_side, self.max_side, FilterType::Lanczos3)
        } else {
            img
        };

        // JPEG has no alpha channel; flatten before encoding.
        let rgb = img.to_rgb8();
        let mut buf = Cursor::new(Vec::new());
        let encoder = JpegEncoder::new_with_quality(&mut buf, self.jpeg_quality);
        rgb.write_with_encoder(encoder)?;

        Ok(format!(
            "data:image/jpeg;base64,{}",
            BASE64.encode(buf.into_inner())
        ))
    }

    fn raw_data_url(&self, path: &Path) -> std::io::Result<String> {
        let bytes = std::fs::read(path)?;
        Ok(format!(
            "data:{};base64,{}",
            mime_from_path(path),
            BASE64.encode(bytes)
        ))
    }
}

/// Guess a MIME type from the file extension; unknown extensions default to
/// `image/png`.
pub fn mime_from_path(path: &Path) -> &'static str {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_lowercase());
    match ext.as_deref() {
        Some("jpg") | Some("jpeg") => "image/jpeg",
        Some("png") => "image/png",
        Some("webp") => "image/webp",
        Some("gif") => "image/gif",
        Some("bmp") => "image/bmp",
        Some("tif") | Some("tiff") => "image/tiff",
        _ => "image/png",
    }
}
