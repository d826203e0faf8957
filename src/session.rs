use std::time::{SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use url::Url;

pub const HTML_CONTENT_TYPE: &str = "text/html";
pub const CSS_CONTENT_TYPE: &str = "text/css";
pub const DEFAULT_CONTENT_TYPE: &str = "application/octet-stream";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    reason: String,
}

impl ValidationError {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.reason)
    }
}

impl std::error::Error for ValidationError {}

/// Externally addressable identifier of a recorded session.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(String);

impl SessionId {
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().simple().to_string())
    }

    pub fn parse(value: &str) -> Result<Self, ValidationError> {
        if value.trim().is_empty() {
            return Err(ValidationError::new("session id cannot be empty"));
        }
        if value.len() > 64 {
            return Err(ValidationError::new("session id cannot exceed 64 characters"));
        }
        if !value
            .bytes()
            .all(|byte| byte.is_ascii_alphanumeric() || byte == b'-' || byte == b'_')
        {
            return Err(ValidationError::new(format!(
                "session id `{value}` may only contain ASCII letters, digits, `-` and `_`"
            )));
        }
        Ok(Self(value.to_owned()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Store-assigned identifier of a resource, unique within its session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResourceId(pub i64);

impl std::fmt::Display for ResourceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for ResourceId {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.parse::<i64>()
            .map(Self)
            .map_err(|_| ValidationError::new(format!("resource id `{s}` is not an integer")))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Recording,
    Completed,
}

impl SessionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Recording => "recording",
            Self::Completed => "completed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "recording" => Some(Self::Recording),
            "completed" => Some(Self::Completed),
            _ => None,
        }
    }
}

/// Where a resource payload lives. Exactly one location per resource.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResourcePayload {
    Inline(Bytes),
    Blob { key: String, size_bytes: u64 },
}

impl ResourcePayload {
    pub fn is_inline(&self) -> bool {
        matches!(self, Self::Inline(_))
    }

    pub fn blob_key(&self) -> Option<&str> {
        match self {
            Self::Blob { key, .. } => Some(key),
            Self::Inline(_) => None,
        }
    }

    pub fn size_bytes(&self) -> u64 {
        match self {
            Self::Inline(bytes) => bytes.len() as u64,
            Self::Blob { size_bytes, .. } => *size_bytes,
        }
    }
}

/// Metadata of a captured response, before placement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceMeta {
    pub url: String,
    pub status: u16,
    pub content_type: String,
    pub captured_at_unix_ms: i64,
}

/// A resource ready to be appended to a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewResource {
    pub meta: ResourceMeta,
    pub payload: ResourcePayload,
}

/// A persisted resource including its payload location.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resource {
    pub id: ResourceId,
    pub meta: ResourceMeta,
    pub payload: ResourcePayload,
}

/// Resource metadata without the inline bytes, as listed on a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceSummary {
    pub id: ResourceId,
    pub url: String,
    pub status: u16,
    pub content_type: String,
    pub captured_at_unix_ms: i64,
    pub size_bytes: u64,
    pub blob_key: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionRecord {
    pub id: SessionId,
    pub url: String,
    pub status: SessionStatus,
    pub created_at_unix_ms: i64,
    pub started_at_unix_ms: i64,
    pub last_activity_unix_ms: i64,
    pub completed_at_unix_ms: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionDetail {
    #[serde(flatten)]
    pub session: SessionRecord,
    pub resources: Vec<ResourceSummary>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSummary {
    #[serde(flatten)]
    pub session: SessionRecord,
    pub resource_count: u64,
}

/// Everything needed to create a session record in one write.
#[derive(Debug, Clone)]
pub struct NewSession {
    pub id: SessionId,
    pub url: String,
    pub started_at_unix_ms: i64,
    pub resources: Vec<NewResource>,
}

pub fn is_html(content_type: &str) -> bool {
    content_type.to_ascii_lowercase().contains(HTML_CONTENT_TYPE)
}

pub fn is_css(content_type: &str) -> bool {
    content_type.to_ascii_lowercase().contains(CSS_CONTENT_TYPE)
}

/// Trims the input, defaults to `https://` when no http(s) scheme is given and
/// rejects anything that does not parse as a hosted http(s) URL.
pub fn normalize_target_url(raw: &str) -> Result<Url, ValidationError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(ValidationError::new("URL is required"));
    }

    let lowered = trimmed.to_ascii_lowercase();
    let candidate = if lowered.starts_with("http://") || lowered.starts_with("https://") {
        trimmed.to_owned()
    } else {
        format!("https://{trimmed}")
    };

    let url = Url::parse(&candidate)
        .map_err(|err| ValidationError::new(format!("invalid URL `{trimmed}`: {err}")))?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(ValidationError::new(format!(
            "invalid URL `{trimmed}`: only http and https are supported"
        )));
    }
    if url.host_str().is_none_or(str::is_empty) {
        return Err(ValidationError::new(format!(
            "invalid URL `{trimmed}`: missing host"
        )));
    }
    Ok(url)
}

pub fn now_unix_ms() -> i64 {
    match SystemTime::now().duration_since(UNIX_EPOCH) {
        Ok(duration) => i64::try_from(duration.as_millis()).unwrap_or(i64::MAX),
        Err(_) => 0,
    }
}

#[cfg(test)]
mod tests {
    use super::{SessionId, is_css, is_html, normalize_target_url};

    #[test]
    fn normalize_target_url_adds_https_and_trailing_slash() {
        let url = normalize_target_url("  example.test ").unwrap();
        assert_eq!(url.as_str(), "https://example.test/");

        let url = normalize_target_url("http://example.test/a?b=1").unwrap();
        assert_eq!(url.as_str(), "http://example.test/a?b=1");
    }

    #[test]
    fn normalize_target_url_rejects_malformed_input() {
        let cases = ["", "   ", "https://", "http://exa mple.test", "https://:80/"];
        for case in cases {
            assert!(
                normalize_target_url(case).is_err(),
                "case `{case}` should fail"
            );
        }
    }

    #[test]
    fn session_id_rejects_unsafe_values() {
        let too_long = "x".repeat(65);
        let cases = ["", " ", "../x", "a/b", "a b", too_long.as_str()];
        for case in cases {
            assert!(SessionId::parse(case).is_err(), "case `{case}` should fail");
        }
        assert_eq!(SessionId::parse("abc-123_x").unwrap().as_str(), "abc-123_x");
    }

    #[test]
    fn generated_session_ids_parse() {
        let id = SessionId::generate();
        assert_eq!(SessionId::parse(id.as_str()).unwrap(), id);
    }

    #[test]
    fn content_type_helpers_ignore_parameters_and_case() {
        assert!(is_html("Text/HTML; charset=utf-8"));
        assert!(is_css("text/css"));
        assert!(!is_html("application/json"));
    }
}
