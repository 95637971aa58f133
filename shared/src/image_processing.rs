use std::io::Cursor;
use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use image::codecs::jpeg::JpegEncoder;
use image::codecs::png::PngEncoder;
use image::imageops::FilterType;
use image::{DynamicImage, GenericImageView, ImageReader, Limits};
use metrics::{counter, histogram};
use serde::Deserialize;
use thiserror::Error;
use tokio::sync::Semaphore;
use tracing::{instrument, warn};

use crate::preview::{PreviewRegistry, PreviewUrl};
use crate::{AppError, ErrorKind};

const BYTES_PER_MB: usize = 1024 * 1024;

#[derive(Debug, Error)]
pub enum ImageError {
    #[error("unsupported image type: {mime}")]
    UnsupportedType { mime: String },

    #[error("file too large: {size} bytes, max {max}")]
    FileTooLarge { size: usize, max: usize },

    #[error("too many files: {count}, max {max}")]
    TooManyFiles { count: usize, max: usize },

    #[error("input bytes empty")]
    EmptyInput,

    #[error("failed to decode image: {0}")]
    Decode(String),

    #[error("image too large: {width}x{height} = {pixels} pixels, max {max_pixels}")]
    ImageTooLarge {
        width: u32,
        height: u32,
        pixels: u64,
        max_pixels: u64,
    },

    #[error("{mime} encoding failed: width={width}, height={height}, reason={reason}")]
    Encode {
        mime: String,
        width: u32,
        height: u32,
        reason: String,
    },

    #[error("processing worker was interrupted")]
    Interrupted,
}

impl From<ImageError> for AppError {
    fn from(e: ImageError) -> Self {
        let kind = match &e {
            ImageError::UnsupportedType { .. } => ErrorKind::ImageFormatUnsupported,
            ImageError::FileTooLarge { .. } | ImageError::ImageTooLarge { .. } => {
                ErrorKind::ImageTooLarge
            }
            ImageError::TooManyFiles { .. } | ImageError::EmptyInput => ErrorKind::Validation,
            ImageError::Decode(_) | ImageError::Encode { .. } => ErrorKind::ImageProcessing,
            ImageError::Interrupted => ErrorKind::Internal,
        };
        AppError::new(kind, e.to_string())
    }
}

/// Caller-supplied constraints for validation and compression.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct ProcessingConfig {
    pub allowed_types: Vec<String>,
    pub max_size_mb: usize,
    pub max_width: u32,
    pub max_height: u32,
    /// Encoder quality, 1..=100.
    pub quality: u8,
    pub max_files: usize,
    pub max_concurrent_ops: usize,
    pub max_image_pixels: u64,
    pub max_alloc_bytes: u64,
    pub max_dimension: u32,
}

impl Default for ProcessingConfig {
    fn default() -> Self {
        Self {
            allowed_types: vec![
                "image/jpeg".to_string(),
                "image/png".to_string(),
                "image/webp".to_string(),
            ],
            max_size_mb: 5,
            max_width: 1920,
            max_height: 1080,
            quality: 80,
            max_files: 10,
            max_concurrent_ops: 4,
            max_image_pixels: 100_000_000,
            max_alloc_bytes: 512 * 1024 * 1024,
            max_dimension: 15_000,
        }
    }
}

impl ProcessingConfig {
    #[must_use]
    pub fn max_size_bytes(&self) -> usize {
        self.max_size_mb.saturating_mul(BYTES_PER_MB)
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.allowed_types.is_empty() {
            return Err("allowed_types must not be empty".into());
        }
        if self.max_size_mb == 0 {
            return Err("max_size_mb must be > 0".into());
        }
        if self.max_width == 0 || self.max_height == 0 {
            return Err("max_width and max_height must be > 0".into());
        }
        if !(1..=100).contains(&self.quality) {
            return Err(format!("quality must be in 1..=100, got {}", self.quality));
        }
        if self.max_files == 0 || self.max_concurrent_ops == 0 {
            return Err("max_files and max_concurrent_ops must be > 0".into());
        }
        Ok(())
    }
}

/// A named, typed blob of image bytes as picked by the user.
#[derive(Clone, Debug, PartialEq)]
pub struct ImageFile {
    pub name: String,
    pub mime: String,
    pub bytes: Bytes,
}

impl ImageFile {
    pub fn new(name: impl Into<String>, mime: impl Into<String>, bytes: impl Into<Bytes>) -> Self {
        Self {
            name: name.into(),
            mime: mime.into(),
            bytes: bytes.into(),
        }
    }

    #[must_use]
    pub fn size(&self) -> usize {
        self.bytes.len()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum OutputFormat {
    Jpeg,
    Png,
    WebP,
}

impl OutputFormat {
    fn from_mime(mime: &str) -> Option<Self> {
        match mime.trim().to_ascii_lowercase().as_str() {
            "image/jpeg" | "image/jpg" => Some(Self::Jpeg),
            "image/png" => Some(Self::Png),
            "image/webp" => Some(Self::WebP),
            _ => None,
        }
    }
}

/// Rejects a file before any decoding happens.
pub fn validate(
    file: &ImageFile,
    allowed_types: &[String],
    max_size_bytes: usize,
) -> Result<(), ImageError> {
    if !allowed_types
        .iter()
        .any(|allowed| allowed.eq_ignore_ascii_case(file.mime.trim()))
    {
        return Err(ImageError::UnsupportedType {
            mime: file.mime.clone(),
        });
    }
    if file.size() > max_size_bytes {
        return Err(ImageError::FileTooLarge {
            size: file.size(),
            max: max_size_bytes,
        });
    }
    Ok(())
}

/// Largest size that fits inside `max_width`x`max_height` while keeping the
/// aspect ratio. Never upscales.
#[must_use]
pub fn fit_within(width: u32, height: u32, max_width: u32, max_height: u32) -> (u32, u32) {
    if width <= max_width && height <= max_height {
        return (width, height);
    }
    let ratio = (f64::from(max_width) / f64::from(width))
        .min(f64::from(max_height) / f64::from(height));
    let scale = |dim: u32, max: u32| -> u32 {
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let scaled = (f64::from(dim) * ratio).round() as u32;
        scaled.clamp(1, max.max(1))
    };
    (scale(width, max_width), scale(height, max_height))
}

pub struct ImageProcessor {
    config: ProcessingConfig,
    semaphore: Arc<Semaphore>,
    previews: Arc<PreviewRegistry>,
}

impl ImageProcessor {
    pub fn new(config: ProcessingConfig, previews: Arc<PreviewRegistry>) -> Self {
        let semaphore = Arc::new(Semaphore::new(config.max_concurrent_ops));
        Self {
            config,
            semaphore,
            previews,
        }
    }

    pub fn with_defaults(previews: Arc<PreviewRegistry>) -> Self {
        Self::new(ProcessingConfig::default(), previews)
    }

    #[must_use]
    pub fn config(&self) -> &ProcessingConfig {
        &self.config
    }

    #[must_use]
    pub fn previews(&self) -> &Arc<PreviewRegistry> {
        &self.previews
    }

    pub fn validate(&self, file: &ImageFile) -> Result<(), ImageError> {
        validate(file, &self.config.allowed_types, self.config.max_size_bytes())
    }

    /// Compresses with the configured bounds and quality.
    pub async fn compress(&self, file: ImageFile) -> Result<ImageFile, ImageError> {
        let (max_width, max_height, quality) =
            (self.config.max_width, self.config.max_height, self.config.quality);
        self.compress_with(file, max_width, max_height, quality).await
    }

    #[instrument(skip(self, file), fields(name = %file.name, input_size = file.size()))]
    pub async fn compress_with(
        &self,
        file: ImageFile,
        max_width: u32,
        max_height: u32,
        quality: u8,
    ) -> Result<ImageFile, ImageError> {
        let start = Instant::now();
        counter!("image.compress.requests").increment(1);

        // Waits for a slot; a closed semaphore means the processor is shutting down.
        let _permit = self
            .semaphore
            .acquire()
            .await
            .map_err(|_| ImageError::Interrupted)?;

        let config = self.config.clone();
        let result = tokio::task::spawn_blocking(move || {
            Self::compress_sync(&config, &file, max_width, max_height, quality)
        })
        .await
        .map_err(|_| ImageError::Interrupted)?;

        histogram!("image.compress.duration_ms").record(start.elapsed().as_millis() as f64);

        match &result {
            Ok(out) => {
                histogram!("image.compress.output_size").record(out.size() as f64);
            }
            Err(e) => {
                counter!("image.compress.errors").increment(1);
                warn!(error = %e, "compress failed");
            }
        }

        result
    }

    /// Compresses every file independently and registers a preview for each
    /// success. A failing file is logged and skipped; `on_progress` receives
    /// the percentage of files completed so far after each success.
    #[instrument(skip(self, files, on_progress), fields(count = files.len()))]
    pub async fn process_batch<F>(
        &self,
        files: Vec<ImageFile>,
        mut on_progress: F,
    ) -> Result<Vec<PreviewUrl>, ImageError>
    where
        F: FnMut(u8) + Send,
    {
        if files.len() > self.config.max_files {
            return Err(ImageError::TooManyFiles {
                count: files.len(),
                max: self.config.max_files,
            });
        }

        let total = files.len();
        let mut previews = Vec::with_capacity(total);

        for (index, file) in files.into_iter().enumerate() {
            let name = file.name.clone();
            let processed = match self.validate(&file) {
                Ok(()) => self.compress(file).await,
                Err(e) => Err(e),
            };

            match processed {
                Ok(out) => {
                    previews.push(self.previews.register(out));
                    on_progress(percent(previews.len(), total));
                }
                Err(e) => {
                    counter!("image.batch.skipped").increment(1);
                    warn!(index, file = %name, error = %e, "skipping image in batch");
                }
            }
        }

        Ok(previews)
    }

    pub fn revoke(&self, url: &PreviewUrl) -> bool {
        self.previews.revoke(url)
    }

    pub fn revoke_all<'a>(&self, urls: impl IntoIterator<Item = &'a PreviewUrl>) -> usize {
        self.previews.revoke_all(urls)
    }

    fn compress_sync(
        config: &ProcessingConfig,
        file: &ImageFile,
        max_width: u32,
        max_height: u32,
        quality: u8,
    ) -> Result<ImageFile, ImageError> {
        let format = OutputFormat::from_mime(&file.mime).ok_or_else(|| {
            ImageError::UnsupportedType {
                mime: file.mime.clone(),
            }
        })?;

        let img = decode_image(config, &file.bytes)?;
        let (w, h) = img.dimensions();
        let (target_w, target_h) = fit_within(w, h, max_width, max_height);

        let resized = if (target_w, target_h) == (w, h) {
            img
        } else {
            img.resize_exact(target_w, target_h, FilterType::Triangle)
        };

        let bytes = encode(&resized, format, &file.mime, quality.clamp(1, 100))?;

        Ok(ImageFile {
            name: file.name.clone(),
            mime: file.mime.clone(),
            bytes: Bytes::from(bytes),
        })
    }
}

fn percent(done: usize, total: usize) -> u8 {
    if total == 0 {
        return 100;
    }
    u8::try_from(done.saturating_mul(100) / total).unwrap_or(100)
}

fn decode_image(config: &ProcessingConfig, raw_bytes: &[u8]) -> Result<DynamicImage, ImageError> {
    if raw_bytes.is_empty() {
        return Err(ImageError::EmptyInput);
    }

    let mut reader = ImageReader::new(Cursor::new(raw_bytes))
        .with_guessed_format()
        .map_err(|e| ImageError::Decode(e.to_string()))?;

    if reader.format().is_none() {
        return Err(ImageError::Decode("unrecognised image format".into()));
    }

    let mut limits = Limits::default();
    limits.max_image_width = Some(config.max_dimension);
    limits.max_image_height = Some(config.max_dimension);
    limits.max_alloc = Some(config.max_alloc_bytes);
    reader.limits(limits);

    let img = reader
        .decode()
        .map_err(|e| ImageError::Decode(e.to_string()))?;
    let (w, h) = img.dimensions();
    let pixels = u64::from(w) * u64::from(h);

    if pixels > config.max_image_pixels {
        return Err(ImageError::ImageTooLarge {
            width: w,
            height: h,
            pixels,
            max_pixels: config.max_image_pixels,
        });
    }

    Ok(img)
}

fn encode(
    img: &DynamicImage,
    format: OutputFormat,
    mime: &str,
    quality: u8,
) -> Result<Vec<u8>, ImageError> {
    let (width, height) = img.dimensions();
    let encode_err = |reason: String| ImageError::Encode {
        mime: mime.to_string(),
        width,
        height,
        reason,
    };

    if width == 0 || height == 0 {
        return Err(encode_err("zero dimension".into()));
    }

    let mut buffer = Vec::new();
    match format {
        OutputFormat::Jpeg => {
            // JPEG has no alpha channel.
            let rgb = DynamicImage::ImageRgb8(img.to_rgb8());
            let encoder = JpegEncoder::new_with_quality(&mut buffer, quality);
            rgb.write_with_encoder(encoder)
                .map_err(|e| encode_err(e.to_string()))?;
        }
        OutputFormat::Png => {
            let encoder = PngEncoder::new(&mut buffer);
            img.write_with_encoder(encoder)
                .map_err(|e| encode_err(e.to_string()))?;
        }
        OutputFormat::WebP => {
            let rgba = DynamicImage::ImageRgba8(img.to_rgba8());
            let encoder =
                webp::Encoder::from_image(&rgba).map_err(|e| encode_err(e.to_string()))?;
            buffer = encoder.encode(f32::from(quality)).to_vec();
        }
    }

    if buffer.is_empty() {
        return Err(encode_err("encoder produced no output".into()));
    }

    Ok(buffer)
}
