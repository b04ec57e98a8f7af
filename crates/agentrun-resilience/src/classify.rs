//! Error classification.
//!
//! Classification is best-effort pattern matching on the error message, or on the status code
//! for HTTP failures. The result is an immutable [`ClassifiedError`] telling callers whether a
//! retry is worthwhile and whether a degraded response is acceptable.

use std::collections::BTreeMap;
use std::error::Error as StdError;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Failure taxonomy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Not retryable; the calling workflow should abort (e.g. authentication failure).
    Critical,
    /// Retryable with backoff (network, timeout, service unavailable).
    Transient,
    /// Retryable, but the caller should change strategy (rate limits, quotas).
    Resource,
    /// Not retryable, fallback-eligible (malformed input).
    Validation,
    /// Generic retryable default.
    Recoverable,
    /// Logged, never surfaced as a failure.
    Warning,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Critical => "critical",
            Self::Transient => "transient",
            Self::Resource => "resource",
            Self::Validation => "validation",
            Self::Recoverable => "recoverable",
            Self::Warning => "warning",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A normalized failure descriptor.
#[derive(Clone, Serialize)]
pub struct ClassifiedError {
    kind: ErrorKind,
    code: String,
    message: String,
    service: String,
    retryable: bool,
    max_retries: u32,
    retry_delay: Duration,
    fallback: bool,
    context: BTreeMap<String, Value>,
    #[serde(skip)]
    source: Option<Arc<dyn StdError + Send + Sync>>,
}

impl ClassifiedError {
    /// Build a classification. Retry hints start at zero; use the `with_*` methods to set them.
    pub fn new(
        kind: ErrorKind,
        code: impl Into<String>,
        message: impl Into<String>,
        service: impl Into<String>,
    ) -> Self {
        Self {
            kind,
            code: code.into(),
            message: message.into(),
            service: service.into(),
            retryable: false,
            max_retries: 0,
            retry_delay: Duration::ZERO,
            fallback: false,
            context: BTreeMap::new(),
            source: None,
        }
    }

    /// Mark as retryable with the given hints.
    pub fn retryable(mut self, max_retries: u32, retry_delay: Duration) -> Self {
        self.retryable = true;
        self.max_retries = max_retries;
        self.retry_delay = retry_delay;
        self
    }

    /// Mark as fallback-eligible.
    pub fn with_fallback(mut self) -> Self {
        self.fallback = true;
        self
    }

    /// Add a context entry.
    pub fn with_context(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.context.insert(key.into(), value.into());
        self
    }

    /// Merge a set of context entries, overwriting existing keys.
    pub fn with_context_map(mut self, entries: impl IntoIterator<Item = (String, Value)>) -> Self {
        self.context.extend(entries);
        self
    }

    fn with_source(mut self, source: Arc<dyn StdError + Send + Sync>) -> Self {
        self.source = Some(source);
        self
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// Stable machine-readable code, e.g. `NETWORK_ERROR`.
    pub fn code(&self) -> &str {
        &self.code
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    /// Subsystem the failure originated from.
    pub fn service(&self) -> &str {
        &self.service
    }

    pub fn is_retryable(&self) -> bool {
        self.retryable
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    pub fn retry_delay(&self) -> Duration {
        self.retry_delay
    }

    /// Whether a degraded-mode response is acceptable.
    pub fn allows_fallback(&self) -> bool {
        self.fallback
    }

    pub fn context(&self) -> &BTreeMap<String, Value> {
        &self.context
    }

    /// Recovery plan suggested for this class of failure.
    pub fn recovery_strategy(&self) -> RecoveryStrategy {
        match self.kind {
            ErrorKind::Critical => RecoveryStrategy {
                fallback_message: "Critical error - manual intervention required".into(),
                ..RecoveryStrategy::default()
            },
            ErrorKind::Transient => RecoveryStrategy {
                retry_with_backoff: true,
                switch_provider: true,
                fallback_message: "Retrying with alternative provider".into(),
                ..RecoveryStrategy::default()
            },
            ErrorKind::Resource => RecoveryStrategy {
                switch_provider: true,
                reduce_scope: true,
                fallback_message: "Resource limit reached - switching strategy".into(),
                ..RecoveryStrategy::default()
            },
            ErrorKind::Validation => RecoveryStrategy {
                use_fallback: true,
                skip_validation: true,
                fallback_message: "Validation failed - using fallback".into(),
                ..RecoveryStrategy::default()
            },
            ErrorKind::Recoverable => RecoveryStrategy {
                use_template: true,
                use_fallback: true,
                retry_with_backoff: true,
                fallback_message: "Using fallback strategy".into(),
                ..RecoveryStrategy::default()
            },
            ErrorKind::Warning => RecoveryStrategy {
                fallback_message: "Non-blocking warning".into(),
                ..RecoveryStrategy::default()
            },
        }
    }
}

impl fmt::Debug for ClassifiedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClassifiedError")
            .field("kind", &self.kind)
            .field("code", &self.code)
            .field("message", &self.message)
            .field("service", &self.service)
            .field("retryable", &self.retryable)
            .field("fallback", &self.fallback)
            .finish_non_exhaustive()
    }
}

impl fmt::Display for ClassifiedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}: {}", self.kind, self.code, self.message)
    }
}

impl StdError for ClassifiedError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.source
            .as_deref()
            .map(|e| e as &(dyn StdError + 'static))
    }
}

/// How a caller may recover from a classified failure.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecoveryStrategy {
    pub use_template: bool,
    pub use_fallback: bool,
    pub retry_with_backoff: bool,
    pub switch_provider: bool,
    pub reduce_scope: bool,
    pub skip_validation: bool,
    pub fallback_message: String,
}

/// Classifies failures on behalf of one subsystem.
#[derive(Debug, Clone)]
pub struct ErrorClassifier {
    service: String,
}

impl ErrorClassifier {
    pub fn new(service: impl Into<String>) -> Self {
        Self {
            service: service.into(),
        }
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    /// Classify an arbitrary error. Already-classified errors are returned unchanged.
    pub fn classify(&self, err: &(dyn StdError + 'static)) -> ClassifiedError {
        if let Some(classified) = find_classified(err) {
            return classified.clone();
        }
        self.classify_message(&err.to_string())
    }

    /// Classify an owned error and keep it as the classification's source.
    pub fn classify_owned<E>(&self, err: E) -> ClassifiedError
    where
        E: StdError + Send + Sync + 'static,
    {
        if let Some(classified) = find_classified(&err) {
            return classified.clone();
        }
        self.classify_message(&err.to_string())
            .with_source(Arc::new(err))
    }

    /// Classify a bare error message.
    pub fn classify_message(&self, message: &str) -> ClassifiedError {
        let lower = message.to_lowercase();
        let has = |needles: &[&str]| needles.iter().any(|n| lower.contains(n));
        let service = self.service.as_str();

        if has(&["connection refused", "connection reset", "no such host", "dial tcp", "broken pipe"]) {
            return ClassifiedError::new(
                ErrorKind::Transient,
                "NETWORK_ERROR",
                "Service temporarily unavailable",
                service,
            )
            .retryable(5, Duration::from_secs(2))
            .with_fallback()
            .with_context("original_error", message);
        }

        if has(&["timeout", "timed out", "deadline exceeded"]) {
            return ClassifiedError::new(ErrorKind::Transient, "TIMEOUT", "Operation timed out", service)
                .retryable(3, Duration::from_secs(5))
                .with_fallback()
                .with_context(
                    "suggestion",
                    "Consider increasing timeout or reducing payload size",
                );
        }

        if has(&["rate limit", "too many requests", "429"]) {
            return ClassifiedError::new(ErrorKind::Resource, "RATE_LIMIT", "Rate limit exceeded", service)
                .retryable(3, Duration::from_secs(30))
                .with_fallback()
                .with_context("suggestion", "Implement exponential backoff");
        }

        if has(&["quota exceeded", "insufficient", "out of memory"]) {
            return ClassifiedError::new(
                ErrorKind::Resource,
                "RESOURCE_EXHAUSTED",
                "Resource limit exceeded",
                service,
            )
            .with_fallback()
            .with_context("action", "Check resource quotas and limits");
        }

        if has(&["unauthorized", "forbidden", "401", "403", "authentication"]) {
            return ClassifiedError::new(
                ErrorKind::Critical,
                "AUTH_ERROR",
                "Authentication failed",
                service,
            )
            .with_context("action", "Check API keys and credentials");
        }

        if has(&["invalid", "validation", "malformed"]) {
            return ClassifiedError::new(
                ErrorKind::Validation,
                "VALIDATION_ERROR",
                "Input validation failed",
                service,
            )
            .with_fallback()
            .with_context("suggestion", "Check input format and requirements");
        }

        if has(&["parser", "syntax", "parse error"]) {
            return ClassifiedError::new(ErrorKind::Validation, "PARSE_ERROR", "Parsing failed", service)
                .with_fallback()
                .with_context("action", "Using basic validation instead");
        }

        if has(&["context length", "token limit"]) {
            return ClassifiedError::new(
                ErrorKind::Recoverable,
                "TOKEN_LIMIT",
                "Token limit exceeded",
                service,
            )
            .retryable(1, Duration::from_secs(1))
            .with_fallback()
            .with_context("suggestion", "Reduce prompt size or use smaller model");
        }

        if has(&["service unavailable", "503"]) {
            return ClassifiedError::new(
                ErrorKind::Transient,
                "SERVICE_UNAVAILABLE",
                format!("{service} service is temporarily unavailable"),
                service,
            )
            .retryable(5, Duration::from_secs(10))
            .with_fallback();
        }

        ClassifiedError::new(ErrorKind::Recoverable, "UNKNOWN_ERROR", message, service)
            .retryable(2, Duration::from_secs(3))
            .with_fallback()
    }

    /// Classify an HTTP failure from its status code and response body.
    ///
    /// JSON bodies contribute their `error` or `message` field to the message; other bodies are
    /// used verbatim.
    pub fn classify_http(&self, status: u16, body: &[u8]) -> ClassifiedError {
        let detail = http_detail(body);
        let service = self.service.as_str();

        let classified = match status {
            429 => ClassifiedError::new(ErrorKind::Resource, "RATE_LIMIT", "Rate limit exceeded", service)
                .retryable(3, Duration::from_secs(30))
                .with_fallback()
                .with_context("response", detail.clone()),
            401 | 403 => ClassifiedError::new(
                ErrorKind::Critical,
                "AUTH_ERROR",
                format!("Authentication failed: {detail}"),
                service,
            ),
            400 => ClassifiedError::new(
                ErrorKind::Validation,
                "BAD_REQUEST",
                format!("Invalid request: {detail}"),
                service,
            )
            .with_fallback(),
            500 | 502 | 503 => ClassifiedError::new(
                ErrorKind::Transient,
                "SERVER_ERROR",
                format!("Server error: {detail}"),
                service,
            )
            .retryable(3, Duration::from_secs(5))
            .with_fallback(),
            504 => ClassifiedError::new(ErrorKind::Transient, "TIMEOUT", "Gateway timeout", service)
                .retryable(2, Duration::from_secs(10))
                .with_fallback(),
            400..=499 => ClassifiedError::new(
                ErrorKind::Validation,
                format!("CLIENT_ERROR_{status}"),
                format!("Client error: {detail}"),
                service,
            )
            .with_fallback(),
            500..=599 => ClassifiedError::new(
                ErrorKind::Transient,
                format!("SERVER_ERROR_{status}"),
                format!("Server error: {detail}"),
                service,
            )
            .retryable(3, Duration::from_secs(5))
            .with_fallback(),
            _ => ClassifiedError::new(
                ErrorKind::Recoverable,
                format!("HTTP_{status}"),
                format!("HTTP error {status}: {detail}"),
                service,
            )
            .retryable(2, Duration::from_secs(3))
            .with_fallback()
            .with_context("response", detail),
        };

        classified.with_context("status_code", status)
    }
}

fn find_classified<'a>(err: &'a (dyn StdError + 'static)) -> Option<&'a ClassifiedError> {
    let mut current: Option<&(dyn StdError + 'static)> = Some(err);
    while let Some(e) = current {
        if let Some(classified) = e.downcast_ref::<ClassifiedError>() {
            return Some(classified);
        }
        current = e.source();
    }
    None
}

fn http_detail(body: &[u8]) -> String {
    if body.is_empty() {
        return String::new();
    }
    if let Ok(Value::Object(map)) = serde_json::from_slice::<Value>(body) {
        for key in ["error", "message"] {
            if let Some(Value::String(msg)) = map.get(key) {
                return msg.clone();
            }
        }
    }
    String::from_utf8_lossy(body).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn classifier() -> ErrorClassifier {
        ErrorClassifier::new("llm-router")
    }

    #[test]
    fn test_network_errors_are_transient() {
        let c = classifier().classify_message("dial tcp 10.0.0.1:443: connection refused");
        assert_eq!(c.kind(), ErrorKind::Transient);
        assert_eq!(c.code(), "NETWORK_ERROR");
        assert!(c.is_retryable());
        assert!(c.allows_fallback());
        assert_eq!(c.max_retries(), 5);
        assert_eq!(c.service(), "llm-router");
    }

    #[test]
    fn test_timeouts_and_rate_limits() {
        let timeout = classifier().classify_message("context deadline exceeded");
        assert_eq!(timeout.code(), "TIMEOUT");
        assert!(timeout.is_retryable());

        let limited = classifier().classify_message("HTTP 429 Too Many Requests");
        assert_eq!(limited.kind(), ErrorKind::Resource);
        assert_eq!(limited.code(), "RATE_LIMIT");
        assert!(limited.is_retryable());
    }

    #[test]
    fn test_auth_is_critical_and_final() {
        let c = classifier().classify_message("401 unauthorized");
        assert_eq!(c.kind(), ErrorKind::Critical);
        assert!(!c.is_retryable());
        assert!(!c.allows_fallback());
        assert!(c.recovery_strategy().fallback_message.contains("manual"));
    }

    #[test]
    fn test_validation_allows_fallback_without_retry() {
        let c = classifier().classify_message("malformed JSON payload");
        assert_eq!(c.kind(), ErrorKind::Validation);
        assert!(!c.is_retryable());
        assert!(c.allows_fallback());
        assert!(c.recovery_strategy().skip_validation);
    }

    #[test]
    fn test_unknown_defaults_to_recoverable() {
        let c = classifier().classify_message("the flux capacitor misbehaved");
        assert_eq!(c.kind(), ErrorKind::Recoverable);
        assert_eq!(c.code(), "UNKNOWN_ERROR");
        assert!(c.is_retryable());
        assert!(c.allows_fallback());
        assert_eq!(c.message(), "the flux capacitor misbehaved");
    }

    #[test]
    fn test_already_classified_passes_through() {
        let original = ClassifiedError::new(ErrorKind::Warning, "DEPRECATED", "old api", "parser");
        let c = classifier().classify(&original);
        assert_eq!(c.kind(), ErrorKind::Warning);
        assert_eq!(c.code(), "DEPRECATED");
        assert_eq!(c.service(), "parser");
    }

    #[test]
    fn test_owned_classification_keeps_source() {
        let io = std::io::Error::new(std::io::ErrorKind::Other, "connection reset by peer");
        let c = classifier().classify_owned(io);
        assert_eq!(c.code(), "NETWORK_ERROR");
        assert!(c.source().is_some());
    }

    #[test]
    fn test_http_status_ranges() {
        let c = classifier();
        assert_eq!(c.classify_http(429, b"").code(), "RATE_LIMIT");
        assert_eq!(c.classify_http(403, b"").kind(), ErrorKind::Critical);
        assert!(!c.classify_http(401, b"").is_retryable());
        assert!(c.classify_http(503, b"").is_retryable());
        assert!(c.classify_http(504, b"").is_retryable());

        let teapot = c.classify_http(418, b"short and stout");
        assert_eq!(teapot.code(), "CLIENT_ERROR_418");
        assert!(!teapot.is_retryable());
        assert_eq!(teapot.context().get("status_code"), Some(&Value::from(418)));
    }

    #[test]
    fn test_http_json_body_message() {
        let c = classifier().classify_http(400, br#"{"error": "missing field 'prompt'"}"#);
        assert_eq!(c.code(), "BAD_REQUEST");
        assert_eq!(c.message(), "Invalid request: missing field 'prompt'");
    }

    #[test]
    fn test_display_format() {
        let c = ClassifiedError::new(ErrorKind::Transient, "TIMEOUT", "slow", "svc");
        assert_eq!(c.to_string(), "[transient] TIMEOUT: slow");
    }
}
