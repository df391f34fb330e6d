//! Image transfer decoding
//!
//! Clients send images either as raw interleaved buffers or PNG/JPEG
//! streams, each tagged with a pixel layout. Everything is normalized here
//! into an `image::DynamicImage` before it reaches the reorder window.

use bytes::Bytes;
use image::{DynamicImage, GrayImage, ImageBuffer, ImageFormat, Luma, RgbImage};
use serde::{Deserialize, Serialize};

use crate::error::{ProxyError, Result};

/// Pixel layout announced by the client
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ImageLayout {
    /// Color; raw buffers carry 4 bytes per pixel, the 4th is discarded
    Rgb24,
    Grey8,
    /// 16-bit grey; raw buffers are little-endian
    Grey16,
}

impl std::fmt::Display for ImageLayout {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ImageLayout::Rgb24 => write!(f, "RGB_24"),
            ImageLayout::Grey8 => write!(f, "GREY_8"),
            ImageLayout::Grey16 => write!(f, "GREY_16"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ImageCompression {
    #[default]
    None,
    Png,
    Jpg,
}

/// Image payload exactly as received on the wire
#[derive(Debug, Clone)]
pub struct EncodedImage {
    pub width: u32,
    pub height: u32,
    pub layout: ImageLayout,
    pub compression: ImageCompression,
    pub data: Bytes,
}

impl EncodedImage {
    /// Raw (uncompressed) payload
    pub fn raw(width: u32, height: u32, layout: ImageLayout, data: impl Into<Bytes>) -> Self {
        Self {
            width,
            height,
            layout,
            compression: ImageCompression::None,
            data: data.into(),
        }
    }

    /// Decode into the internal representation
    pub fn decode(&self) -> Result<DynamicImage> {
        match self.compression {
            ImageCompression::None => self.decode_raw(),
            ImageCompression::Png => self.decode_compressed(ImageFormat::Png),
            ImageCompression::Jpg => self.decode_compressed(ImageFormat::Jpeg),
        }
    }

    fn decode_raw(&self) -> Result<DynamicImage> {
        match self.layout {
            ImageLayout::Rgb24 => {
                let expected = self.raw_len(4)?;
                self.check_len(expected)?;
                // keep the first three bytes of every 4-byte pixel
                let rgb: Vec<u8> = self
                    .data
                    .chunks_exact(4)
                    .flat_map(|px| [px[0], px[1], px[2]])
                    .collect();
                RgbImage::from_raw(self.width, self.height, rgb)
                    .map(DynamicImage::ImageRgb8)
                    .ok_or_else(|| self.size_error(expected))
            }
            ImageLayout::Grey8 => {
                let expected = self.raw_len(1)?;
                self.check_len(expected)?;
                GrayImage::from_raw(self.width, self.height, self.data.to_vec())
                    .map(DynamicImage::ImageLuma8)
                    .ok_or_else(|| self.size_error(expected))
            }
            ImageLayout::Grey16 => {
                let expected = self.raw_len(2)?;
                self.check_len(expected)?;
                let grey: Vec<u16> = self
                    .data
                    .chunks_exact(2)
                    .map(|px| u16::from_le_bytes([px[0], px[1]]))
                    .collect();
                ImageBuffer::<Luma<u16>, Vec<u16>>::from_raw(self.width, self.height, grey)
                    .map(DynamicImage::ImageLuma16)
                    .ok_or_else(|| self.size_error(expected))
            }
        }
    }

    /// Byte length of a raw buffer; dimensions come from the client
    fn raw_len(&self, bytes_per_pixel: usize) -> Result<usize> {
        (self.width as usize)
            .checked_mul(self.height as usize)
            .and_then(|pixels| pixels.checked_mul(bytes_per_pixel))
            .ok_or_else(|| {
                ProxyError::ImageConversion(format!(
                    "{}x{} {} image is too large",
                    self.width, self.height, self.layout
                ))
            })
    }

    fn decode_compressed(&self, format: ImageFormat) -> Result<DynamicImage> {
        let decoded = image::load_from_memory_with_format(&self.data, format)
            .map_err(|e| ProxyError::ImageConversion(format!("{format:?} decode failed: {e}")))?;

        Ok(match self.layout {
            ImageLayout::Rgb24 => DynamicImage::ImageRgb8(decoded.into_rgb8()),
            ImageLayout::Grey8 => DynamicImage::ImageLuma8(decoded.into_luma8()),
            ImageLayout::Grey16 => DynamicImage::ImageLuma16(decoded.into_luma16()),
        })
    }

    fn check_len(&self, expected: usize) -> Result<()> {
        if self.data.len() != expected {
            return Err(self.size_error(expected));
        }
        Ok(())
    }

    fn size_error(&self, expected: usize) -> ProxyError {
        ProxyError::ImageConversion(format!(
            "{}x{} {} buffer has {} bytes, expected {}",
            self.width,
            self.height,
            self.layout,
            self.data.len(),
            expected
        ))
    }
}

/// Camera-mounting correction applied to the second stereo sensor
pub fn rotate_180(image: &DynamicImage) -> DynamicImage {
    image.rotate180()
}
