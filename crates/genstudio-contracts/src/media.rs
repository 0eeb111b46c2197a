use std::path::Path;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;

pub const DEFAULT_IMAGE_MIME: &str = "image/png";

/// Raw image bytes plus the MIME type they are encoded in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImagePayload {
    pub bytes: Vec<u8>,
    pub mime_type: String,
}

impl ImagePayload {
    pub fn new(bytes: Vec<u8>, mime_type: impl Into<String>) -> Self {
        Self {
            bytes,
            mime_type: mime_type.into(),
        }
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn to_base64(&self) -> String {
        BASE64.encode(&self.bytes)
    }

    pub fn to_data_url(&self) -> String {
        format!("data:{};base64,{}", self.mime_type, self.to_base64())
    }

    pub fn from_base64(data: &str, mime_type: impl Into<String>) -> Result<Self, String> {
        let cleaned = clean_base64(data)?;
        let bytes = BASE64
            .decode(cleaned.as_bytes())
            .map_err(|err| format!("Invalid base64 image data: {err}"))?;
        if bytes.is_empty() {
            return Err("Image data is empty".to_string());
        }
        Ok(Self::new(bytes, mime_type))
    }

    /// Parses `data:<mime>;base64,<data>`. A bare base64 string is accepted
    /// and typed as PNG.
    pub fn from_data_url(raw: &str) -> Result<Self, String> {
        let trimmed = raw.trim();
        let (mime, data) = match split_data_url(trimmed) {
            Some((mime, data)) => (mime, data),
            None => (DEFAULT_IMAGE_MIME.to_string(), trimmed),
        };
        Self::from_base64(data, mime)
    }

    /// Estimated size in MiB, for trace payloads.
    pub fn size_mb(&self) -> f64 {
        self.bytes.len() as f64 / 1024.0 / 1024.0
    }
}

/// One image handed to the request builder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImageSource {
    File {
        name: String,
        bytes: Vec<u8>,
        mime_type: String,
    },
    Base64 {
        data: String,
        mime_type: String,
    },
}

impl ImageSource {
    pub fn file(name: impl Into<String>, bytes: Vec<u8>, mime_type: impl Into<String>) -> Self {
        Self::File {
            name: name.into(),
            bytes,
            mime_type: mime_type.into(),
        }
    }

    pub fn base64(data: impl Into<String>, mime_type: impl Into<String>) -> Self {
        Self::Base64 {
            data: data.into(),
            mime_type: mime_type.into(),
        }
    }

    /// Accepts a `data:` URL and keeps its declared MIME type.
    pub fn data_url(raw: &str) -> Self {
        match split_data_url(raw.trim()) {
            Some((mime, data)) => Self::base64(data, mime),
            None => Self::base64(raw.trim(), DEFAULT_IMAGE_MIME),
        }
    }

    pub fn from_path(path: &Path) -> std::io::Result<Self> {
        let bytes = std::fs::read(path)?;
        let name = path
            .file_name()
            .and_then(|value| value.to_str())
            .unwrap_or("image")
            .to_string();
        let mime = mime_for_path(path).unwrap_or(DEFAULT_IMAGE_MIME);
        Ok(Self::file(name, bytes, mime))
    }

    pub fn mime_type(&self) -> &str {
        match self {
            Self::File { mime_type, .. } | Self::Base64 { mime_type, .. } => mime_type,
        }
    }

    /// Decodes into binary. Base64 sources are cleaned first.
    pub fn to_payload(&self) -> Result<ImagePayload, String> {
        match self {
            Self::File {
                bytes, mime_type, ..
            } => Ok(ImagePayload::new(bytes.clone(), mime_type.clone())),
            Self::Base64 { data, mime_type } => ImagePayload::from_base64(data, mime_type.clone()),
        }
    }
}

/// Strips an optional data-URL header and whitespace, then checks the
/// standard base64 alphabet with at most two padding characters.
pub fn clean_base64(raw: &str) -> Result<String, String> {
    let body = match raw.split_once(',') {
        Some((_, data)) => data,
        None => raw,
    };
    let cleaned: String = body.chars().filter(|ch| !ch.is_whitespace()).collect();
    let unpadded = cleaned.trim_end_matches('=');
    if cleaned.len() - unpadded.len() > 2 {
        return Err("Invalid base64 image data format".to_string());
    }
    if !unpadded
        .chars()
        .all(|ch| ch.is_ascii_alphanumeric() || ch == '+' || ch == '/')
    {
        return Err("Invalid base64 image data format".to_string());
    }
    Ok(cleaned)
}

/// Decoded size of a base64 string, before decoding it.
pub fn estimated_decoded_len(base64_len: usize) -> usize {
    base64_len * 3 / 4
}

fn split_data_url(raw: &str) -> Option<(String, &str)> {
    let rest = raw.strip_prefix("data:")?;
    let (header, data) = rest.split_once(',')?;
    let mime = header
        .split(';')
        .next()
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .unwrap_or(DEFAULT_IMAGE_MIME);
    Some((mime.to_string(), data))
}

pub fn mime_for_path(path: &Path) -> Option<&'static str> {
    let ext = path
        .extension()
        .and_then(|value| value.to_str())
        .map(|value| value.to_ascii_lowercase())
        .unwrap_or_default();
    match ext.as_str() {
        "png" => Some("image/png"),
        "jpg" | "jpeg" => Some("image/jpeg"),
        "webp" => Some("image/webp"),
        "gif" => Some("image/gif"),
        "mp4" => Some("video/mp4"),
        _ => None,
    }
}

pub fn extension_for_mime(mime: &str) -> &'static str {
    let lowered = mime.trim().to_ascii_lowercase();
    if lowered.contains("jpeg") || lowered.contains("jpg") {
        return "jpg";
    }
    if lowered.contains("webp") {
        return "webp";
    }
    if lowered.contains("gif") {
        return "gif";
    }
    if lowered.contains("mp4") {
        return "mp4";
    }
    if lowered.contains("webm") {
        return "webm";
    }
    "png"
}
