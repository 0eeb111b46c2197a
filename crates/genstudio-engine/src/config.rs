use std::env;
use std::time::Duration;

pub const DEFAULT_API_BASE: &str = "https://generativelanguage.googleapis.com/v1beta";
pub const DEFAULT_IMAGE_MODEL: &str = "gemini-2.5-flash-image-preview";
pub const DEFAULT_IMAGEN_MODEL: &str = "imagen-4.0-generate-001";
pub const DEFAULT_VIDEO_MODEL: &str = "veo-3.0-generate-001";

pub const MIB: u64 = 1024 * 1024;

#[derive(Debug, Clone, PartialEq)]
pub struct StudioConfig {
    pub api_base: String,
    pub api_key: Option<String>,
    pub image_model: String,
    pub imagen_model: String,
    pub video_model: String,
    pub max_attempts: u32,
    pub backoff_base: Duration,
    pub degrade_delay: Duration,
    /// Prompt length kept by the first degraded attempt.
    pub simplified_prompt_chars: usize,
    /// Prompt length kept by the last degraded attempt.
    pub truncated_prompt_chars: usize,
    pub simple_fallback: bool,
    pub retry_empty_result: bool,
    pub simple_max_bytes: u64,
    pub poll_interval: Duration,
    pub poll_max_attempts: u32,
    pub compress_threshold_bytes: u64,
    pub compress_max_dimension: u32,
    pub jpeg_quality: u8,
    pub request_timeout: Duration,
}

impl Default for StudioConfig {
    fn default() -> Self {
        Self {
            api_base: DEFAULT_API_BASE.to_string(),
            api_key: None,
            image_model: DEFAULT_IMAGE_MODEL.to_string(),
            imagen_model: DEFAULT_IMAGEN_MODEL.to_string(),
            video_model: DEFAULT_VIDEO_MODEL.to_string(),
            max_attempts: 3,
            backoff_base: Duration::from_millis(1000),
            degrade_delay: Duration::from_millis(2000),
            simplified_prompt_chars: 400,
            truncated_prompt_chars: 100,
            simple_fallback: true,
            retry_empty_result: false,
            simple_max_bytes: 10 * MIB,
            poll_interval: Duration::from_millis(5000),
            poll_max_attempts: 120,
            compress_threshold_bytes: 5 * MIB,
            compress_max_dimension: 2048,
            jpeg_quality: 80,
            request_timeout: Duration::from_secs(90),
        }
    }
}

impl StudioConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Builds a config from an arbitrary key lookup so tests do not have to
    /// mutate the process environment.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| {
            lookup(key)
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        };
        let defaults = Self::default();

        Self {
            api_base: get("GEMINI_API_BASE")
                .map(|value| value.trim_end_matches('/').to_string())
                .unwrap_or(defaults.api_base),
            api_key: get("GEMINI_API_KEY").or_else(|| get("GOOGLE_API_KEY")),
            image_model: get("GENSTUDIO_IMAGE_MODEL").unwrap_or(defaults.image_model),
            imagen_model: get("GENSTUDIO_IMAGEN_MODEL").unwrap_or(defaults.imagen_model),
            video_model: get("GENSTUDIO_VIDEO_MODEL").unwrap_or(defaults.video_model),
            max_attempts: parse_clamped(get("GENSTUDIO_MAX_ATTEMPTS"), 3, 1, 6) as u32,
            backoff_base: Duration::from_millis(parse_clamped(
                get("GENSTUDIO_BACKOFF_BASE_MS"),
                1000,
                0,
                30_000,
            )),
            degrade_delay: Duration::from_millis(parse_clamped(
                get("GENSTUDIO_DEGRADE_DELAY_MS"),
                2000,
                0,
                30_000,
            )),
            simplified_prompt_chars: defaults.simplified_prompt_chars,
            truncated_prompt_chars: defaults.truncated_prompt_chars,
            simple_fallback: parse_bool(get("GENSTUDIO_SIMPLE_FALLBACK"), true),
            retry_empty_result: parse_bool(get("GENSTUDIO_RETRY_EMPTY_RESULT"), false),
            simple_max_bytes: defaults.simple_max_bytes,
            poll_interval: Duration::from_millis(parse_clamped(
                get("GENSTUDIO_POLL_INTERVAL_MS"),
                5000,
                0,
                60_000,
            )),
            poll_max_attempts: parse_clamped(get("GENSTUDIO_POLL_MAX_ATTEMPTS"), 120, 1, 10_000)
                as u32,
            compress_threshold_bytes: parse_clamped(
                get("GENSTUDIO_COMPRESS_THRESHOLD_MB"),
                5,
                1,
                20,
            ) * MIB,
            compress_max_dimension: defaults.compress_max_dimension,
            jpeg_quality: parse_clamped(get("GENSTUDIO_JPEG_QUALITY"), 80, 10, 100) as u8,
            request_timeout: Duration::from_secs(parse_clamped(
                get("GENSTUDIO_REQUEST_TIMEOUT_S"),
                90,
                15,
                300,
            )),
        }
    }

    /// Zero-delay profile for tests and dry runs.
    pub fn without_delays(mut self) -> Self {
        self.backoff_base = Duration::ZERO;
        self.degrade_delay = Duration::ZERO;
        self.poll_interval = Duration::ZERO;
        self
    }
}

fn parse_clamped(raw: Option<String>, default: u64, min: u64, max: u64) -> u64 {
    raw.and_then(|text| text.parse::<u64>().ok())
        .unwrap_or(default)
        .clamp(min, max)
}

fn parse_bool(raw: Option<String>, default: bool) -> bool {
    let Some(text) = raw else {
        return default;
    };
    match text.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => true,
        "0" | "false" | "no" | "off" => false,
        _ => default,
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(key, value)| (key.to_string(), value.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn empty_environment_yields_defaults() {
        let config = StudioConfig::from_lookup(|_| None);
        assert_eq!(config, StudioConfig::default());
    }

    #[test]
    fn overrides_are_trimmed_and_clamped() {
        let config = StudioConfig::from_lookup(lookup(&[
            ("GEMINI_API_BASE", " http://localhost:9000/v1/ "),
            ("GOOGLE_API_KEY", "secret"),
            ("GENSTUDIO_MAX_ATTEMPTS", "50"),
            ("GENSTUDIO_POLL_INTERVAL_MS", "250"),
            ("GENSTUDIO_COMPRESS_THRESHOLD_MB", "8"),
            ("GENSTUDIO_RETRY_EMPTY_RESULT", "yes"),
            ("GENSTUDIO_SIMPLE_FALLBACK", "off"),
        ]));
        assert_eq!(config.api_base, "http://localhost:9000/v1");
        assert_eq!(config.api_key.as_deref(), Some("secret"));
        assert_eq!(config.max_attempts, 6);
        assert_eq!(config.poll_interval, Duration::from_millis(250));
        assert_eq!(config.compress_threshold_bytes, 8 * MIB);
        assert!(config.retry_empty_result);
        assert!(!config.simple_fallback);
    }

    #[test]
    fn gemini_key_wins_over_google_key() {
        let config = StudioConfig::from_lookup(lookup(&[
            ("GEMINI_API_KEY", "primary"),
            ("GOOGLE_API_KEY", "secondary"),
        ]));
        assert_eq!(config.api_key.as_deref(), Some("primary"));
    }

    #[test]
    fn unparsable_numbers_fall_back_to_default() {
        let config = StudioConfig::from_lookup(lookup(&[("GENSTUDIO_JPEG_QUALITY", "high")]));
        assert_eq!(config.jpeg_quality, 80);
    }
}
