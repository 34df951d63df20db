//! Image encoding: `DynamicImage` → PNG bytes → base64 payload.
//!
//! Every extracted image is normalised to PNG before it is hashed, so the
//! same figure embedded twice (even in different source encodings that
//! decode to identical pixels) gets one key. PNG is lossless, which keeps
//! small labels and axis text legible for the model.

use crate::model::ImagePayload;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use image::DynamicImage;
use std::io::Cursor;
use tracing::debug;

pub const PNG_MIME: &str = "image/png";

/// Encode a decoded image as PNG.
pub fn encode_png(img: &DynamicImage) -> Result<Vec<u8>, image::ImageError> {
    let mut buf = Vec::new();
    img.write_to(&mut Cursor::new(&mut buf), image::ImageFormat::Png)?;
    debug!(
        "Encoded {}x{} image → {} PNG bytes",
        img.width(),
        img.height(),
        buf.len()
    );
    Ok(buf)
}

/// Wrap PNG bytes as a base64 payload ready for a model request.
pub fn to_payload(png: &[u8]) -> ImagePayload {
    ImagePayload {
        base64: STANDARD.encode(png),
        mime_type: PNG_MIME.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgba, RgbaImage};

    #[test]
    fn encode_small_image() {
        let img = DynamicImage::ImageRgba8(RgbaImage::from_pixel(10, 10, Rgba([255, 0, 0, 255])));
        let png = encode_png(&img).expect("encode should succeed");
        assert_eq!(&png[1..4], b"PNG");

        let payload = to_payload(&png);
        assert_eq!(payload.mime_type, "image/png");
        let decoded = STANDARD.decode(&payload.base64).expect("valid base64");
        assert_eq!(decoded, png);
    }

    #[test]
    fn identical_pixels_encode_identically() {
        let a = DynamicImage::ImageRgba8(RgbaImage::from_pixel(4, 4, Rgba([1, 2, 3, 255])));
        let b = DynamicImage::ImageRgba8(RgbaImage::from_pixel(4, 4, Rgba([1, 2, 3, 255])));
        assert_eq!(encode_png(&a).unwrap(), encode_png(&b).unwrap());
    }
}
