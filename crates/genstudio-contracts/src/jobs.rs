use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Opaque operation name returned when a video job is submitted.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobHandle(String);

impl JobHandle {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for JobHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobStatus {
    pub done: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uri: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl JobStatus {
    pub fn pending() -> Self {
        Self::default()
    }

    pub fn completed(uri: impl Into<String>) -> Self {
        Self {
            done: true,
            uri: Some(uri.into()),
            error: None,
        }
    }

    pub fn completed_without_result() -> Self {
        Self {
            done: true,
            uri: None,
            error: None,
        }
    }

    /// Reads a long-running operation document. Both the SDK shape
    /// (`response.generatedVideos[0].video.uri`) and the REST shape
    /// (`response.generateVideoResponse.generatedSamples[0].video.uri`)
    /// are understood.
    pub fn from_operation(payload: &Value) -> Self {
        let done = payload
            .get("done")
            .and_then(Value::as_bool)
            .unwrap_or(false);
        let error = payload.get("error").and_then(|err| {
            if err.is_null() {
                return None;
            }
            err.get("message")
                .and_then(Value::as_str)
                .map(str::to_string)
                .or_else(|| err.as_str().map(str::to_string))
                .or_else(|| Some(err.to_string()))
        });
        let uri = if done {
            payload.get("response").and_then(first_video_uri)
        } else {
            None
        };
        Self { done, uri, error }
    }
}

fn first_video_uri(response: &Value) -> Option<String> {
    let samples = response
        .get("generatedVideos")
        .or_else(|| {
            response
                .get("generateVideoResponse")
                .and_then(|inner| inner.get("generatedSamples"))
        })
        .and_then(Value::as_array)?;
    samples
        .first()
        .and_then(|sample| sample.get("video"))
        .and_then(|video| video.get("uri"))
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|uri| !uri.is_empty())
        .map(str::to_string)
}
