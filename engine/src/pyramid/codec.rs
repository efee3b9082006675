//! Tile encoding

use bytes::Bytes;
use image::codecs::jpeg::JpegEncoder;
use image::{GrayImage, ImageEncoder, ImageFormat};

use super::types::PyramidError;

/// Encodes composited tiles into their stored representation
pub trait TileCodec: Send + Sync {
    fn encode(&self, tile: &GrayImage) -> Result<Bytes, PyramidError>;

    fn decode(&self, data: &[u8]) -> Result<GrayImage, PyramidError>;

    /// File extension used by file-backed stores
    fn extension(&self) -> &'static str;
}

/// Lossy single-channel JPEG
#[derive(Debug, Clone, Copy)]
pub struct JpegCodec {
    quality: u8,
}

impl JpegCodec {
    pub fn new(quality: u8) -> Self {
        Self { quality }
    }

    pub fn quality(&self) -> u8 {
        self.quality
    }
}

impl TileCodec for JpegCodec {
    fn encode(&self, tile: &GrayImage) -> Result<Bytes, PyramidError> {
        let mut buffer = Vec::new();
        let encoder = JpegEncoder::new_with_quality(&mut buffer, self.quality);
        encoder
            .write_image(
                tile.as_raw(),
                tile.width(),
                tile.height(),
                image::ExtendedColorType::L8,
            )
            .map_err(|e| PyramidError::Codec(format!("JPEG encoding failed: {}", e)))?;
        Ok(Bytes::from(buffer))
    }

    fn decode(&self, data: &[u8]) -> Result<GrayImage, PyramidError> {
        let image = image::load_from_memory_with_format(data, ImageFormat::Jpeg)
            .map_err(|e| PyramidError::Codec(format!("JPEG decoding failed: {}", e)))?;
        Ok(image.into_luma8())
    }

    fn extension(&self) -> &'static str {
        "jpg"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Luma;

    #[test]
    fn test_jpeg_keeps_tile_dimensions() {
        let codec = JpegCodec::new(90);
        let tile = GrayImage::from_pixel(256, 256, Luma([128]));
        let data = codec.encode(&tile).unwrap();
        // SOI marker
        assert_eq!(&data[..2], &[0xFF, 0xD8]);

        let decoded = codec.decode(&data).unwrap();
        assert_eq!(decoded.dimensions(), (256, 256));
        // Flat tiles survive lossy compression almost unchanged
        assert!(decoded.pixels().all(|p| p[0].abs_diff(128) <= 2));
    }

    #[test]
    fn test_decode_rejects_garbage() {
        let codec = JpegCodec::new(90);
        assert!(matches!(codec.decode(b"not a jpeg"), Err(PyramidError::Codec(_))));
    }
}
