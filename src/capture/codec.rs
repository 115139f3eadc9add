//! Sensor image -> service image: resample, orient, convert pixels, then
//! optionally compress.

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use bytes::Bytes;
use image::codecs::jpeg::JpegEncoder;
use image::codecs::png::PngEncoder;
use image::imageops::FilterType;
use image::{DynamicImage, ExtendedColorType, GrayImage, ImageEncoder, RgbImage, RgbaImage};
use tracing::{instrument, trace};

use crate::capture::frame::{Compression, Image, PixelLayout, Transformation};
use crate::capture::sensor::{RawFormat, RawImage};
use crate::error::{Error, Result};

/// Why an asynchronous conversion did not produce a buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConversionStatus {
    /// Input buffer does not match its declared size or format
    Invalid,
    /// Converter accepted the request but could not complete it
    Failed,
    /// Converter went away before completing
    Disposed,
}

/// Target of the conversion step
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConversionParams {
    pub layout: PixelLayout,
    pub resolution: (u32, u32),
    pub transform: Transformation,
}

/// Full per-frame codec request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CodecParams {
    pub conversion: ConversionParams,
    pub compression: Compression,
    /// JPEG quality, 1-100
    pub quality: u8,
}

/// Asynchronous resample + pixel-format conversion primitive.
#[async_trait]
pub trait ImageConverter: Send + Sync {
    async fn convert(
        &self,
        raw: RawImage,
        params: ConversionParams,
    ) -> std::result::Result<Vec<u8>, ConversionStatus>;
}

/// Converter running on the blocking pool with the `image` crate.
#[derive(Debug, Default, Clone, Copy)]
pub struct CpuImageConverter;

#[async_trait]
impl ImageConverter for CpuImageConverter {
    async fn convert(
        &self,
        raw: RawImage,
        params: ConversionParams,
    ) -> std::result::Result<Vec<u8>, ConversionStatus> {
        tokio::task::spawn_blocking(move || convert_pixels(&raw, &params))
            .await
            .map_err(|_| ConversionStatus::Disposed)?
    }
}

fn to_dynamic(raw: &RawImage) -> Option<DynamicImage> {
    let data = raw.data.to_vec();
    match raw.format {
        RawFormat::Grey8 => GrayImage::from_raw(raw.width, raw.height, data).map(DynamicImage::ImageLuma8),
        RawFormat::Rgb24 => RgbImage::from_raw(raw.width, raw.height, data).map(DynamicImage::ImageRgb8),
        RawFormat::Rgba32 => RgbaImage::from_raw(raw.width, raw.height, data).map(DynamicImage::ImageRgba8),
    }
}

/// Blocking body of [`CpuImageConverter`].
pub fn convert_pixels(
    raw: &RawImage,
    params: &ConversionParams,
) -> std::result::Result<Vec<u8>, ConversionStatus> {
    let (width, height) = params.resolution;
    if !raw.is_valid() || width == 0 || height == 0 {
        return Err(ConversionStatus::Invalid);
    }

    let mut img = to_dynamic(raw).ok_or(ConversionStatus::Invalid)?;
    if (img.width(), img.height()) != (width, height) {
        img = img.resize_exact(width, height, FilterType::Triangle);
    }

    let img = match params.transform {
        Transformation::None => img,
        Transformation::MirrorX => img.flipv(),
        Transformation::MirrorY => img.fliph(),
        Transformation::MirrorXY => img.rotate180(),
    };

    Ok(match params.layout {
        PixelLayout::Grey8 => img.to_luma8().into_raw(),
        PixelLayout::Grey16 => img
            .to_luma16()
            .into_raw()
            .into_iter()
            .flat_map(u16::to_le_bytes)
            .collect(),
        PixelLayout::Rgb24 => img.to_rgb8().into_raw(),
    })
}

fn color_type(layout: PixelLayout) -> ExtendedColorType {
    match layout {
        PixelLayout::Grey8 => ExtendedColorType::L8,
        PixelLayout::Grey16 => ExtendedColorType::L16,
        PixelLayout::Rgb24 => ExtendedColorType::Rgb8,
    }
}

/// Encodes an already oriented pixel buffer.
pub fn encode(
    pixels: &[u8],
    (width, height): (u32, u32),
    layout: PixelLayout,
    compression: Compression,
    quality: u8,
) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    match compression {
        Compression::None => return Ok(pixels.to_vec()),
        Compression::Jpg => {
            if layout == PixelLayout::Grey16 {
                return Err(Error::UnsupportedEncoding { layout, compression });
            }
            JpegEncoder::new_with_quality(&mut out, quality.clamp(1, 100)).encode(
                pixels,
                width,
                height,
                color_type(layout),
            )?;
        }
        Compression::Png => {
            // PNG encoder takes 16-bit samples in native byte order
            let native: Vec<u8>;
            let pixels = if layout == PixelLayout::Grey16 {
                native = pixels
                    .chunks_exact(2)
                    .flat_map(|c| u16::from_le_bytes([c[0], c[1]]).to_ne_bytes())
                    .collect();
                &native[..]
            } else {
                pixels
            };
            PngEncoder::new(&mut out).write_image(pixels, width, height, color_type(layout))?;
        }
    }
    Ok(out)
}

#[derive(Clone)]
pub struct FrameCodec {
    converter: Arc<dyn ImageConverter>,
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new(Arc::new(CpuImageConverter))
    }
}

impl FrameCodec {
    pub fn new(converter: Arc<dyn ImageConverter>) -> Self {
        Self { converter }
    }

    /// Converts then compresses. Compression only starts once the oriented
    /// buffer is available.
    #[instrument(skip(self, raw), fields(src_w = raw.width, src_h = raw.height))]
    pub async fn convert(&self, raw: RawImage, params: CodecParams) -> Result<Image> {
        let started = Instant::now();
        let conversion = params.conversion;

        let pixels = self
            .converter
            .convert(raw, conversion)
            .await
            .map_err(Error::ConversionFailed)?;

        let data = match params.compression {
            Compression::None => pixels,
            compression => {
                tokio::task::spawn_blocking(move || {
                    encode(&pixels, conversion.resolution, conversion.layout, compression, params.quality)
                })
                .await??
            }
        };

        let elapsed = started.elapsed();
        trace!(bytes = data.len(), ?elapsed, "Frame converted");
        metrics::histogram!("frame_convert_time_us").record(elapsed.as_micros() as f64);

        Ok(Image {
            width: conversion.resolution.0,
            height: conversion.resolution.1,
            layout: conversion.layout,
            compression: params.compression,
            data: Bytes::from(data),
        })
    }
}
