use std::collections::HashMap;
use std::io::Cursor;
use std::sync::{Arc, Mutex};

use genstudio_contracts::events::EventSink;
use genstudio_contracts::media::ImagePayload;
use image::codecs::jpeg::JpegEncoder;
use image::imageops::FilterType;
use image::{DynamicImage, RgbImage};
use serde_json::json;
use uuid::Uuid;

use crate::config::{StudioConfig, MIB};
use crate::error::{StudioError, StudioResult};
use crate::{emit, payload_digest};

pub const SUPPORTED_MIME_TYPES: [&str; 5] = [
    "image/jpeg",
    "image/jpg",
    "image/png",
    "image/webp",
    "image/gif",
];
pub const MIN_IMAGE_BYTES: u64 = 1024;
pub const MAX_IMAGE_BYTES: u64 = 20 * MIB;
pub const COMPRESSED_MIME: &str = "image/jpeg";

pub fn validate_image(mime_type: &str, size: u64) -> StudioResult<()> {
    validate_image_with_limit(mime_type, size, MAX_IMAGE_BYTES)
}

pub fn validate_image_with_limit(mime_type: &str, size: u64, max_bytes: u64) -> StudioResult<()> {
    let normalized = mime_type.trim().to_ascii_lowercase();
    if !SUPPORTED_MIME_TYPES.contains(&normalized.as_str()) {
        return Err(StudioError::Validation(format!(
            "Unsupported format: {mime_type}. Supported: JPEG, PNG, WebP, GIF"
        )));
    }
    if size > max_bytes {
        return Err(StudioError::Validation(format!(
            "File too large: {:.2}MB. Maximum: {}MB",
            size as f64 / MIB as f64,
            max_bytes / MIB
        )));
    }
    if size < MIN_IMAGE_BYTES {
        return Err(StudioError::Validation(
            "File too small or corrupted".to_string(),
        ));
    }
    Ok(())
}

pub fn should_compress(size: u64, threshold_bytes: u64) -> bool {
    size > threshold_bytes
}

#[derive(Debug, Clone, PartialEq)]
pub struct CompressedImage {
    pub payload: ImagePayload,
    pub original_size: u64,
    pub compressed_size: u64,
    pub compression_ratio: f64,
    pub width: u32,
    pub height: u32,
}

/// Largest size within `max_dimension` on both sides, keeping the aspect
/// ratio. Never upscales.
pub fn fit_within(width: u32, height: u32, max_dimension: u32) -> (u32, u32) {
    if width <= max_dimension && height <= max_dimension {
        return (width, height);
    }
    if width > height {
        let scaled = (height as u64 * max_dimension as u64 / width as u64).max(1);
        (max_dimension, scaled as u32)
    } else {
        let scaled = (width as u64 * max_dimension as u64 / height as u64).max(1);
        (scaled as u32, max_dimension)
    }
}

/// Decodes, downsamples to `max_dimension` and re-encodes as JPEG. The
/// output type is always JPEG regardless of the input type.
pub fn compress_image(bytes: &[u8], max_dimension: u32, quality: u8) -> StudioResult<CompressedImage> {
    let decoded = image::load_from_memory(bytes)
        .map_err(|err| StudioError::Validation(format!("Failed to load image: {err}")))?;
    let (width, height) = fit_within(decoded.width(), decoded.height(), max_dimension);
    let resized = if (width, height) == (decoded.width(), decoded.height()) {
        decoded
    } else {
        decoded.resize_exact(width, height, FilterType::Triangle)
    };
    let flattened = flatten_onto_white(&resized);

    let mut out = Vec::new();
    let mut encoder = JpegEncoder::new_with_quality(&mut out, quality.clamp(1, 100));
    encoder
        .encode_image(&flattened)
        .map_err(|err| StudioError::Validation(format!("Failed to compress image: {err}")))?;

    let original_size = bytes.len() as u64;
    let compressed_size = out.len() as u64;
    Ok(CompressedImage {
        payload: ImagePayload::new(out, COMPRESSED_MIME),
        original_size,
        compressed_size,
        compression_ratio: original_size as f64 / compressed_size.max(1) as f64,
        width,
        height,
    })
}

fn flatten_onto_white(image: &DynamicImage) -> RgbImage {
    let rgba = image.to_rgba8();
    let mut flattened = RgbImage::new(rgba.width(), rgba.height());
    for (x, y, pixel) in rgba.enumerate_pixels() {
        let alpha = u16::from(pixel[3]);
        let blend =
            |channel: u8| -> u8 { (((u16::from(channel) * alpha) + (255 * (255 - alpha))) / 255) as u8 };
        flattened.put_pixel(
            x,
            y,
            image::Rgb([blend(pixel[0]), blend(pixel[1]), blend(pixel[2])]),
        );
    }
    flattened
}

/// Holds displayable previews until their handles are released.
#[derive(Debug, Clone, Default)]
pub struct PreviewStore {
    entries: Arc<Mutex<HashMap<Uuid, ImagePayload>>>,
}

impl PreviewStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, payload: ImagePayload) -> PreviewHandle {
        let id = Uuid::new_v4();
        if let Ok(mut entries) = self.entries.lock() {
            entries.insert(id, payload);
        }
        PreviewHandle {
            id,
            store: self.clone(),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.lock().map(|entries| entries.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn get(&self, id: &Uuid) -> Option<ImagePayload> {
        self.entries
            .lock()
            .ok()
            .and_then(|entries| entries.get(id).cloned())
    }

    fn remove(&self, id: &Uuid) {
        if let Ok(mut entries) = self.entries.lock() {
            entries.remove(id);
        }
    }
}

/// Preview reference. The entry is released when the handle is dropped, so
/// superseding a preview is just replacing the handle.
#[derive(Debug)]
pub struct PreviewHandle {
    id: Uuid,
    store: PreviewStore,
}

impl PreviewHandle {
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn data_url(&self) -> Option<String> {
        self.store.get(&self.id).map(|payload| payload.to_data_url())
    }

    pub fn release(self) {}
}

impl Drop for PreviewHandle {
    fn drop(&mut self) {
        self.store.remove(&self.id);
    }
}

#[derive(Debug)]
pub struct ProcessedUpload {
    pub name: String,
    pub payload: ImagePayload,
    pub was_compressed: bool,
    pub compression_ratio: Option<f64>,
    pub preview: PreviewHandle,
}

pub struct UploadProcessor {
    threshold_bytes: u64,
    max_dimension: u32,
    quality: u8,
    previews: PreviewStore,
    events: Arc<dyn EventSink>,
}

impl UploadProcessor {
    pub fn new(config: &StudioConfig, previews: PreviewStore, events: Arc<dyn EventSink>) -> Self {
        Self {
            threshold_bytes: config.compress_threshold_bytes,
            max_dimension: config.compress_max_dimension,
            quality: config.jpeg_quality,
            previews,
            events,
        }
    }

    pub fn previews(&self) -> &PreviewStore {
        &self.previews
    }

    /// Validates, compresses when above the threshold and registers a
    /// preview. A failed compression keeps the original bytes.
    pub fn process(&self, name: &str, payload: ImagePayload) -> StudioResult<ProcessedUpload> {
        let size = payload.len() as u64;
        validate_image(&payload.mime_type, size)?;
        emit(
            self.events.as_ref(),
            "upload_validated",
            json!({
                "name": name,
                "mime_type": payload.mime_type,
                "size_bytes": size,
                "sha256": payload_digest(&payload.bytes),
            }),
        );

        let mut final_payload = payload;
        let mut was_compressed = false;
        let mut compression_ratio = None;

        if should_compress(size, self.threshold_bytes) {
            match compress_image(&final_payload.bytes, self.max_dimension, self.quality) {
                Ok(compressed) => {
                    emit(
                        self.events.as_ref(),
                        "upload_compressed",
                        json!({
                            "name": name,
                            "original_size": compressed.original_size,
                            "compressed_size": compressed.compressed_size,
                            "ratio": compressed.compression_ratio,
                            "width": compressed.width,
                            "height": compressed.height,
                        }),
                    );
                    was_compressed = true;
                    compression_ratio = Some(compressed.compression_ratio);
                    final_payload = compressed.payload;
                }
                Err(err) => {
                    emit(
                        self.events.as_ref(),
                        "upload_compression_failed",
                        json!({ "name": name, "error": err.to_string() }),
                    );
                }
            }
        }

        let preview = self.previews.register(final_payload.clone());
        Ok(ProcessedUpload {
            name: name.to_string(),
            payload: final_payload,
            was_compressed,
            compression_ratio,
            preview,
        })
    }
}

/// Encodes `image` as PNG.
pub fn encode_png(image: &DynamicImage) -> StudioResult<Vec<u8>> {
    let mut bytes = Vec::new();
    image
        .write_to(&mut Cursor::new(&mut bytes), image::ImageFormat::Png)
        .map_err(|err| StudioError::Validation(format!("Failed to encode image: {err}")))?;
    Ok(bytes)
}
