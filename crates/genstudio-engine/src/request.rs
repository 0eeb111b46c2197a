use std::fmt;
use std::str::FromStr;

use genstudio_contracts::media::{estimated_decoded_len, ImagePayload, ImageSource};
use reqwest::blocking::multipart::{Form as MultipartForm, Part as MultipartPart};
use serde_json::{json, Value};

use crate::error::{StudioError, StudioResult};
use crate::upload::{MAX_IMAGE_BYTES, SUPPORTED_MIME_TYPES};

pub const FIELD_PROMPT: &str = "prompt";
pub const FIELD_MODEL: &str = "model";
pub const FIELD_IMAGE_FILES: &str = "imageFiles";
pub const FIELD_IMAGE_FILE: &str = "imageFile";
pub const FIELD_IMAGE_BASE64: &str = "imageBase64";
pub const FIELD_IMAGE_MIME: &str = "imageMimeType";
pub const FIELD_NEGATIVE_PROMPT: &str = "negativePrompt";
pub const FIELD_ASPECT_RATIO: &str = "aspectRatio";

const RECONSTRUCTED_FILE_NAME: &str = "generated-image.png";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GenerationMode {
    Generate,
    Edit,
    EditSimple,
    Compose,
}

impl GenerationMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Generate => "generate",
            Self::Edit => "edit",
            Self::EditSimple => "edit-simple",
            Self::Compose => "compose",
        }
    }

    pub fn requires_images(&self) -> bool {
        !matches!(self, Self::Generate)
    }
}

impl fmt::Display for GenerationMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for GenerationMode {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "generate" => Ok(Self::Generate),
            "edit" => Ok(Self::Edit),
            "edit-simple" | "edit_simple" => Ok(Self::EditSimple),
            "compose" => Ok(Self::Compose),
            other => Err(format!("unknown generation mode '{other}'")),
        }
    }
}

/// One part of the provider `contents` list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContentPart {
    Text(String),
    InlineImage(ImagePayload),
}

impl ContentPart {
    pub fn to_json(&self) -> Value {
        match self {
            Self::Text(text) => json!({ "text": text }),
            Self::InlineImage(payload) => json!({
                "inlineData": {
                    "mimeType": payload.mime_type,
                    "data": payload.to_base64(),
                }
            }),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GenerationRequest {
    pub prompt: String,
    pub images: Vec<ImagePayload>,
    pub mode: GenerationMode,
    pub model: String,
}

impl GenerationRequest {
    pub fn new(prompt: impl Into<String>, mode: GenerationMode, model: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            images: Vec::new(),
            mode,
            model: model.into(),
        }
    }

    pub fn with_images(mut self, images: Vec<ImagePayload>) -> Self {
        self.images = images;
        self
    }

    /// Prompt text first, then each image in order.
    pub fn content_parts(&self) -> Vec<ContentPart> {
        let mut parts = Vec::with_capacity(self.images.len() + 1);
        parts.push(ContentPart::Text(self.prompt.clone()));
        parts.extend(self.images.iter().cloned().map(ContentPart::InlineImage));
        parts
    }
}

/// Assembles a prompt and its images. Newly added images keep their
/// insertion order; the current image, if any, always goes last.
#[derive(Debug, Clone, Default)]
pub struct RequestBuilder {
    prompt: String,
    added: Vec<ImageSource>,
    current: Option<ImageSource>,
}

impl RequestBuilder {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            ..Self::default()
        }
    }

    pub fn add_image(mut self, source: ImageSource) -> Self {
        self.added.push(source);
        self
    }

    pub fn add_images(mut self, sources: impl IntoIterator<Item = ImageSource>) -> Self {
        self.added.extend(sources);
        self
    }

    pub fn current_image(mut self, source: Option<ImageSource>) -> Self {
        self.current = source;
        self
    }

    pub fn image_count(&self) -> usize {
        self.added.len() + usize::from(self.current.is_some())
    }

    fn ordered_sources(&self) -> impl Iterator<Item = &ImageSource> {
        self.added.iter().chain(self.current.iter())
    }

    pub fn build(&self, mode: GenerationMode, model: impl Into<String>) -> StudioResult<GenerationRequest> {
        let prompt = self.prompt.trim();
        if prompt.is_empty() {
            return Err(StudioError::Validation("Missing prompt".to_string()));
        }
        let mut images = Vec::with_capacity(self.image_count());
        for source in self.ordered_sources() {
            let payload = source.to_payload().map_err(StudioError::Validation)?;
            check_image_part(&payload)?;
            images.push(payload);
        }
        if mode.requires_images() && images.is_empty() {
            return Err(StudioError::Validation(
                "No images provided for editing".to_string(),
            ));
        }
        Ok(GenerationRequest {
            prompt: prompt.to_string(),
            images,
            mode,
            model: model.into(),
        })
    }

    /// Multipart body for the studio routes. Base64 sources are turned back
    /// into binary file parts; the text fields are only used when the data
    /// cannot be decoded.
    pub fn build_multipart(&self) -> MultipartPayload {
        let mut payload = MultipartPayload::new();
        payload.push_text(FIELD_PROMPT, self.prompt.clone());
        for source in self.ordered_sources() {
            match source {
                ImageSource::File {
                    name,
                    bytes,
                    mime_type,
                } => payload.push_file(FIELD_IMAGE_FILES, name.clone(), mime_type.clone(), bytes.clone()),
                ImageSource::Base64 { data, mime_type } => match source.to_payload() {
                    Ok(decoded) => payload.push_file(
                        FIELD_IMAGE_FILES,
                        RECONSTRUCTED_FILE_NAME,
                        mime_type.clone(),
                        decoded.bytes,
                    ),
                    Err(_) => {
                        payload.push_text(FIELD_IMAGE_BASE64, data.clone());
                        payload.push_text(FIELD_IMAGE_MIME, mime_type.clone());
                    }
                },
            }
        }
        payload
    }
}

/// MIME allow-list plus the 20 MiB provider ceiling.
pub fn check_image_part(payload: &ImagePayload) -> StudioResult<()> {
    let mime = payload.mime_type.trim().to_ascii_lowercase();
    if !SUPPORTED_MIME_TYPES.contains(&mime.as_str()) {
        return Err(StudioError::Validation(format!(
            "Unsupported image format: {}. Supported formats: JPEG, PNG, WebP, GIF",
            payload.mime_type
        )));
    }
    if payload.len() as u64 > MAX_IMAGE_BYTES {
        return Err(StudioError::Validation(format!(
            "Image file too large. Maximum size is 20MB. Current size: {:.2}MB",
            payload.size_mb()
        )));
    }
    Ok(())
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FormPart {
    Text {
        name: String,
        value: String,
    },
    File {
        name: String,
        file_name: String,
        mime_type: String,
        bytes: Vec<u8>,
    },
}

impl FormPart {
    pub fn name(&self) -> &str {
        match self {
            Self::Text { name, .. } | Self::File { name, .. } => name,
        }
    }
}

/// Ordered multipart body, independent of the HTTP stack that sends or
/// receives it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MultipartPayload {
    parts: Vec<FormPart>,
}

impl MultipartPayload {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_text(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.parts.push(FormPart::Text {
            name: name.into(),
            value: value.into(),
        });
    }

    pub fn push_file(
        &mut self,
        name: impl Into<String>,
        file_name: impl Into<String>,
        mime_type: impl Into<String>,
        bytes: Vec<u8>,
    ) {
        self.parts.push(FormPart::File {
            name: name.into(),
            file_name: file_name.into(),
            mime_type: mime_type.into(),
            bytes,
        });
    }

    pub fn parts(&self) -> &[FormPart] {
        &self.parts
    }

    pub fn text(&self, name: &str) -> Option<&str> {
        self.parts.iter().find_map(|part| match part {
            FormPart::Text { name: field, value } if field == name => Some(value.as_str()),
            _ => None,
        })
    }

    /// Non-empty trimmed text field.
    pub fn text_value(&self, name: &str) -> Option<String> {
        self.text(name)
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .map(str::to_string)
    }

    pub fn files(&self, name: &str) -> Vec<ImageSource> {
        self.parts
            .iter()
            .filter_map(|part| match part {
                FormPart::File {
                    name: field,
                    file_name,
                    mime_type,
                    bytes,
                } if field == name => Some(ImageSource::file(
                    file_name.clone(),
                    bytes.clone(),
                    mime_type.clone(),
                )),
                _ => None,
            })
            .collect()
    }

    /// Reads the image fields the studio routes accept: every `imageFiles`
    /// part, the legacy single `imageFile` when no `imageFiles` were sent,
    /// and finally an `imageBase64`/`imageMimeType` pair.
    pub fn to_builder(&self) -> StudioResult<RequestBuilder> {
        let prompt = self.text_value(FIELD_PROMPT).unwrap_or_default();
        let mut sources = self.files(FIELD_IMAGE_FILES);
        if sources.is_empty() {
            sources.extend(self.files(FIELD_IMAGE_FILE).into_iter().take(1));
        }
        let current = match self.text_value(FIELD_IMAGE_BASE64) {
            Some(data) => {
                let cleaned = genstudio_contracts::media::clean_base64(&data)
                    .map_err(StudioError::Validation)?;
                if estimated_decoded_len(cleaned.len()) as u64 > MAX_IMAGE_BYTES {
                    return Err(StudioError::Validation(
                        "Image too large for processing. Please use a smaller image.".to_string(),
                    ));
                }
                let mime = self
                    .text_value(FIELD_IMAGE_MIME)
                    .unwrap_or_else(|| genstudio_contracts::media::DEFAULT_IMAGE_MIME.to_string());
                Some(ImageSource::base64(cleaned, mime))
            }
            None => None,
        };
        Ok(RequestBuilder::new(prompt)
            .add_images(sources)
            .current_image(current))
    }

    pub fn into_form(self) -> StudioResult<MultipartForm> {
        let mut form = MultipartForm::new();
        for part in self.parts {
            form = match part {
                FormPart::Text { name, value } => form.text(name, value),
                FormPart::File {
                    name,
                    file_name,
                    mime_type,
                    bytes,
                } => {
                    let file_part = MultipartPart::bytes(bytes)
                        .file_name(file_name)
                        .mime_str(&mime_type)
                        .map_err(|err| {
                            StudioError::Validation(format!("invalid MIME type '{mime_type}': {err}"))
                        })?;
                    form.part(name, file_part)
                }
            };
        }
        Ok(form)
    }
}
