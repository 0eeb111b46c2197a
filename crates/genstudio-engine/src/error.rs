use std::fmt;

/// Coarse classification used for retry decisions and HTTP translation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Validation,
    RateLimited,
    Service,
    BadRequest,
    EmptyResult,
    Network,
    Provider,
    JobFailed,
    Timeout,
    Cancelled,
    Busy,
    Config,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Validation => "validation_error",
            Self::RateLimited => "rate_limited",
            Self::Service => "service_error",
            Self::BadRequest => "bad_request",
            Self::EmptyResult => "empty_result",
            Self::Network => "network_error",
            Self::Provider => "provider_error",
            Self::JobFailed => "job_failed",
            Self::Timeout => "timeout",
            Self::Cancelled => "cancelled",
            Self::Busy => "busy",
            Self::Config => "config_error",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StudioError {
    #[error("{0}")]
    Validation(String),

    #[error("rate limited by provider: {0}")]
    RateLimited(String),

    #[error("provider service error: {0}")]
    Service(String),

    #[error("Image processing failed after {attempts} attempts. This could be due to image complexity, format issues, or temporary service problems. Please try with a different image or try again later.")]
    ServiceDegraded { attempts: u32 },

    #[error("invalid request: {0}")]
    BadRequest(String),

    #[error("{0}")]
    EmptyResult(String),

    #[error("network failure: {0}")]
    Network(String),

    #[error("provider request failed ({status}): {message}")]
    Provider { status: u16, message: String },

    #[error("job failed: {0}")]
    JobFailed(String),

    #[error("job did not complete after {attempts} status checks")]
    PollTimeout { attempts: u32 },

    #[error("operation cancelled")]
    Cancelled,

    #[error("a request is already in flight")]
    Busy,

    #[error("configuration error: {0}")]
    Config(String),
}

impl StudioError {
    /// Maps a non-success provider status to its error class.
    pub fn from_status(status: u16, message: impl Into<String>) -> Self {
        let message = message.into();
        match status {
            400 => Self::BadRequest(message),
            429 => Self::RateLimited(message),
            500 => Self::Service(message),
            _ => Self::Provider { status, message },
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Validation(_) => ErrorKind::Validation,
            Self::RateLimited(_) => ErrorKind::RateLimited,
            Self::Service(_) | Self::ServiceDegraded { .. } => ErrorKind::Service,
            Self::BadRequest(_) => ErrorKind::BadRequest,
            Self::EmptyResult(_) => ErrorKind::EmptyResult,
            Self::Network(_) => ErrorKind::Network,
            Self::Provider { .. } => ErrorKind::Provider,
            Self::JobFailed(_) => ErrorKind::JobFailed,
            Self::PollTimeout { .. } => ErrorKind::Timeout,
            Self::Cancelled => ErrorKind::Cancelled,
            Self::Busy => ErrorKind::Busy,
            Self::Config(_) => ErrorKind::Config,
        }
    }

    /// Status code surfaced to HTTP callers.
    pub fn http_status(&self) -> u16 {
        match self {
            Self::Validation(_) | Self::BadRequest(_) => 400,
            Self::RateLimited(_) => 429,
            Self::Busy => 409,
            Self::Network(_) => 502,
            Self::PollTimeout { .. } => 504,
            Self::Provider { status, .. } if (400..600).contains(status) => *status,
            _ => 500,
        }
    }

    /// User-facing message, matching what the studio routes return.
    pub fn user_message(&self) -> String {
        match self {
            Self::BadRequest(_) => {
                "Invalid request. Please check your image format and prompt.".to_string()
            }
            Self::RateLimited(_) => {
                "Rate limit exceeded. Please wait a moment before trying again.".to_string()
            }
            Self::Service(_) => {
                "Gemini service temporarily unavailable. Please try again in a few moments."
                    .to_string()
            }
            other => other.to_string(),
        }
    }
}

impl From<reqwest::Error> for StudioError {
    fn from(err: reqwest::Error) -> Self {
        if let Some(status) = err.status() {
            return Self::from_status(status.as_u16(), err.to_string());
        }
        Self::Network(err.to_string())
    }
}

pub type StudioResult<T> = Result<T, StudioError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_codes_map_to_taxonomy() {
        assert_eq!(StudioError::from_status(400, "x").kind(), ErrorKind::BadRequest);
        assert_eq!(StudioError::from_status(429, "x").kind(), ErrorKind::RateLimited);
        assert_eq!(StudioError::from_status(500, "x").kind(), ErrorKind::Service);
        assert_eq!(
            StudioError::from_status(503, "x"),
            StudioError::Provider {
                status: 503,
                message: "x".to_string()
            }
        );
    }

    #[test]
    fn http_status_round_trips_provider_codes() {
        assert_eq!(StudioError::from_status(503, "x").http_status(), 503);
        assert_eq!(StudioError::ServiceDegraded { attempts: 3 }.http_status(), 500);
        assert_eq!(StudioError::Validation("x".into()).http_status(), 400);
        assert_eq!(StudioError::Network("x".into()).http_status(), 502);
        assert_eq!(StudioError::PollTimeout { attempts: 2 }.http_status(), 504);
    }

    #[test]
    fn degraded_message_names_attempts() {
        let message = StudioError::ServiceDegraded { attempts: 3 }.to_string();
        assert!(message.starts_with("Image processing failed after 3 attempts."));
    }
}
