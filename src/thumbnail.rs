//! Thumbnail generation.
//!
//! For every configured size the original is flattened to opaque RGB,
//! center-cropped to the target aspect ratio, scaled with Lanczos3 to exactly
//! the target dimensions and encoded as JPEG with optimized Huffman tables.
//! A failure on any size fails the whole batch.
//!
//! [`ThumbnailEngine::render`] is CPU bound; async callers go through
//! [`ThumbnailEngine::render_async`], which runs it on the blocking pool under
//! a deadline.
use crate::{AppError, Result, ThumbnailSize};
use bytes::Bytes;
use image::imageops::{self, FilterType};
use image::{DynamicImage, RgbImage};
use jpeg_encoder::{ColorType, Encoder};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

pub const DEFAULT_SIZES: [ThumbnailSize; 3] = [
    ThumbnailSize::new(100, 100),
    ThumbnailSize::new(300, 300),
    ThumbnailSize::new(1200, 1200),
];

pub const DEFAULT_QUALITY: u8 = 85;

#[derive(Clone, Debug)]
pub struct ThumbnailConfig {
    pub sizes: Vec<ThumbnailSize>,
    /// JPEG quality (1-100)
    pub quality: u8,
    /// Upper bound for one `render_async` call
    pub timeout: Duration,
}

impl Default for ThumbnailConfig {
    fn default() -> Self {
        Self {
            sizes: DEFAULT_SIZES.to_vec(),
            quality: DEFAULT_QUALITY,
            timeout: Duration::from_secs(120),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RenderedThumbnail {
    pub size: ThumbnailSize,
    pub data: Bytes,
}

pub struct ThumbnailEngine {
    config: ThumbnailConfig,
}

impl ThumbnailEngine {
    pub fn new(config: ThumbnailConfig) -> Self {
        Self { config }
    }

    pub fn sizes(&self) -> &[ThumbnailSize] {
        &self.config.sizes
    }

    pub fn render(&self, original: &[u8]) -> Result<Vec<RenderedThumbnail>> {
        let img = image::load_from_memory(original)
            .map_err(|e| AppError::Processing(format!("Failed to decode image: {e}")))?;
        debug!(
            width = img.width(),
            height = img.height(),
            color = ?img.color(),
            "Decoded original"
        );

        let rgb = flatten(img);
        self.config
            .sizes
            .iter()
            .map(|&size| {
                let data = encode_jpeg(&fit(&rgb, size), self.config.quality)?;
                debug!(size = %size, bytes = data.len(), "Thumbnail rendered");
                Ok(RenderedThumbnail { size, data })
            })
            .collect()
    }

    pub async fn render_async(self: Arc<Self>, original: Bytes) -> Result<Vec<RenderedThumbnail>> {
        let deadline = self.config.timeout;
        let engine = self.clone();
        let task = tokio::task::spawn_blocking(move || engine.render(&original));

        match tokio::time::timeout(deadline, task).await {
            Ok(joined) => {
                joined.map_err(|e| AppError::Internal(format!("Thumbnail task panicked: {e}")))?
            }
            // The blocking thread keeps running to completion; its output is dropped.
            Err(_) => Err(AppError::Timeout(deadline)),
        }
    }
}

/// Composites anything with an alpha channel onto white.
fn flatten(img: DynamicImage) -> RgbImage {
    if !img.color().has_alpha() {
        return img.into_rgb8();
    }

    let rgba = img.into_rgba8();
    RgbImage::from_fn(rgba.width(), rgba.height(), |x, y| {
        let px = rgba.get_pixel(x, y).0;
        let alpha = u16::from(px[3]);
        let blend = |c: u8| ((u16::from(c) * alpha + 255 * (255 - alpha) + 127) / 255) as u8;
        image::Rgb([blend(px[0]), blend(px[1]), blend(px[2])])
    })
}

/// Largest centered region of a `src_w x src_h` image with the aspect ratio
/// of `dst_w x dst_h`, as `(x, y, width, height)`.
fn center_crop(src_w: u32, src_h: u32, dst_w: u32, dst_h: u32) -> (u32, u32, u32, u32) {
    let (sw, sh, dw, dh) = (
        u64::from(src_w),
        u64::from(src_h),
        u64::from(dst_w),
        u64::from(dst_h),
    );

    if sw * dh > sh * dw {
        // Source is wider: trim left and right.
        let w = ((sh * dw + dh / 2) / dh).clamp(1, sw) as u32;
        ((src_w - w) / 2, 0, w, src_h)
    } else {
        let h = ((sw * dh + dw / 2) / dw).clamp(1, sh) as u32;
        (0, (src_h - h) / 2, src_w, h)
    }
}

fn fit(rgb: &RgbImage, size: ThumbnailSize) -> RgbImage {
    let (x, y, w, h) = center_crop(rgb.width(), rgb.height(), size.width, size.height);
    let cropped = imageops::crop_imm(rgb, x, y, w, h).to_image();
    imageops::resize(&cropped, size.width, size.height, FilterType::Lanczos3)
}

fn encode_jpeg(img: &RgbImage, quality: u8) -> Result<Bytes> {
    let (width, height) = match (u16::try_from(img.width()), u16::try_from(img.height())) {
        (Ok(w), Ok(h)) => (w, h),
        _ => {
            return Err(AppError::Processing(format!(
                "Thumbnail {}x{} exceeds JPEG limits",
                img.width(),
                img.height()
            )))
        }
    };

    let mut buf = Vec::new();
    let mut encoder = Encoder::new(&mut buf, quality);
    encoder.set_optimized_huffman_tables(true);
    encoder
        .encode(img.as_raw(), width, height, ColorType::Rgb)
        .map_err(|e| AppError::Processing(format!("Failed to encode JPEG: {e}")))?;
    Ok(Bytes::from(buf))
}
