//! JSON bodies of the studio's HTTP routes, shared by the server and the
//! remote client.

use serde::{Deserialize, Serialize};

use crate::media::ImagePayload;

pub const ROUTE_GEMINI_GENERATE: &str = "/api/gemini/generate";
pub const ROUTE_GEMINI_EDIT: &str = "/api/gemini/edit";
pub const ROUTE_GEMINI_EDIT_SIMPLE: &str = "/api/gemini/edit-simple";
pub const ROUTE_IMAGEN_GENERATE: &str = "/api/imagen/generate";
pub const ROUTE_VEO_GENERATE: &str = "/api/veo/generate";
pub const ROUTE_VEO_OPERATION: &str = "/api/veo/operation";
pub const ROUTE_VEO_DOWNLOAD: &str = "/api/veo/download";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PromptBody {
    #[serde(default)]
    pub prompt: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiImage {
    pub image_bytes: String,
    pub mime_type: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageBody {
    pub image: ApiImage,
}

impl ImageBody {
    pub fn from_payload(payload: &ImagePayload) -> Self {
        Self {
            image: ApiImage {
                image_bytes: payload.to_base64(),
                mime_type: payload.mime_type.clone(),
            },
        }
    }

    pub fn to_payload(&self) -> Result<ImagePayload, String> {
        ImagePayload::from_base64(&self.image.image_bytes, self.image.mime_type.clone())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationBody {
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownloadBody {
    pub uri: String,
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn image_body_uses_camel_case_keys() {
        let body = ImageBody::from_payload(&ImagePayload::new(vec![1, 2, 3], "image/png"));
        assert_eq!(
            serde_json::to_value(&body).unwrap(),
            json!({"image": {"imageBytes": "AQID", "mimeType": "image/png"}})
        );
        assert_eq!(body.to_payload().unwrap().bytes, vec![1, 2, 3]);
    }

    #[test]
    fn prompt_body_tolerates_missing_fields() {
        let body: PromptBody = serde_json::from_value(json!({})).unwrap();
        assert!(body.prompt.is_empty());
        assert!(body.model.is_none());
    }
}
