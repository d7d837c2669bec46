use reqwest::StatusCode;
use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum JanusError {
    #[error("invalid request: {message}")]
    InvalidRequest { code: &'static str, message: String },
    #[error("not found: {message}")]
    NotFound { code: &'static str, message: String },
    #[error("method not allowed: {message}")]
    MethodNotAllowed { message: String },
    #[error("invalid mode: {message}")]
    InvalidMode { message: String },
    #[error("translation failed: {message}")]
    TranslationFailed { message: String },
    #[error("rate limited: {message}")]
    RateLimited {
        message: String,
        retry_after: Option<u64>,
        detail: String,
    },
    #[error("upstream error ({status}): {message}")]
    Upstream {
        status: StatusCode,
        message: String,
        detail: String,
    },
    #[error("no viable credential strategy: {message}")]
    ServiceUnavailable { message: String },
    #[error("upstream timeout: {message}")]
    Timeout { message: String },
    #[error("internal error: {message}")]
    Internal { message: String },
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse json: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, JanusError>;

impl JanusError {
    pub fn invalid_request(code: &'static str, message: impl Into<String>) -> Self {
        Self::InvalidRequest {
            code,
            message: message.into(),
        }
    }

    pub fn not_found(code: &'static str, message: impl Into<String>) -> Self {
        Self::NotFound {
            code,
            message: message.into(),
        }
    }

    pub fn translation(message: impl Into<String>) -> Self {
        Self::TranslationFailed {
            message: message.into(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Error taxon used in the canonical error body's `type` field.
    pub fn taxon(&self) -> &'static str {
        match self {
            Self::InvalidRequest { .. } => "invalid_request",
            Self::NotFound { .. } => "not_found",
            Self::MethodNotAllowed { .. } => "method_not_allowed",
            Self::InvalidMode { .. } => "invalid_mode",
            Self::TranslationFailed { .. } => "translation_failed",
            Self::RateLimited { .. } => "rate_limited",
            Self::Upstream { .. } => "upstream_error",
            Self::ServiceUnavailable { .. } => "service_unavailable",
            Self::Timeout { .. } => "timeout",
            Self::Internal { .. } | Self::Io(_) | Self::Json(_) => "internal_error",
            Self::Http(err) => {
                if err.is_timeout() {
                    "timeout"
                } else {
                    "upstream_error"
                }
            }
        }
    }

    /// Short machine-readable identifier for the canonical error body's `code`.
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidRequest { code, .. } | Self::NotFound { code, .. } => code,
            Self::MethodNotAllowed { .. } => "method_not_allowed",
            Self::InvalidMode { .. } => "invalid_mode",
            Self::TranslationFailed { .. } => "translation_failed",
            Self::RateLimited { .. } => "rate_limit_exceeded",
            Self::Upstream { .. } => "upstream_error",
            Self::ServiceUnavailable { .. } => "no_credential_strategy",
            Self::Timeout { .. } => "upstream_timeout",
            Self::Internal { .. } | Self::Io(_) | Self::Json(_) => "internal_error",
            Self::Http(err) => {
                if err.is_timeout() {
                    "upstream_timeout"
                } else {
                    "upstream_unreachable"
                }
            }
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            Self::InvalidRequest { .. }
            | Self::InvalidMode { .. }
            | Self::TranslationFailed { .. } => StatusCode::BAD_REQUEST,
            Self::NotFound { .. } => StatusCode::NOT_FOUND,
            Self::MethodNotAllowed { .. } => StatusCode::METHOD_NOT_ALLOWED,
            Self::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            Self::Upstream { .. } => StatusCode::BAD_GATEWAY,
            Self::ServiceUnavailable { .. } => StatusCode::SERVICE_UNAVAILABLE,
            Self::Timeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            Self::Internal { .. } | Self::Io(_) | Self::Json(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
            Self::Http(err) => {
                if err.is_timeout() {
                    StatusCode::GATEWAY_TIMEOUT
                } else {
                    StatusCode::BAD_GATEWAY
                }
            }
        }
    }

    pub fn to_body(&self) -> ErrorBody {
        ErrorBody {
            error: ErrorDetail {
                message: self.to_string(),
                kind: self.taxon().to_string(),
                code: self.code().to_string(),
            },
        }
    }
}

/// Canonical error body emitted by protocol mode: `{"error":{...}}`.
#[derive(Debug, Clone, Serialize)]
pub struct ErrorBody {
    pub error: ErrorDetail,
}

#[derive(Debug, Clone, Serialize)]
pub struct ErrorDetail {
    pub message: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub code: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn taxon_drives_status() {
        let err = JanusError::not_found("instance_not_found", "no instance for path");
        assert_eq!(err.status(), StatusCode::NOT_FOUND);
        assert_eq!(err.taxon(), "not_found");
        assert_eq!(err.code(), "instance_not_found");
    }

    #[test]
    fn body_shape_matches_contract() {
        let err = JanusError::ServiceUnavailable {
            message: "strategy kubernetes_secret failed".to_string(),
        };
        let body = serde_json::to_value(err.to_body()).unwrap();
        assert_eq!(body["error"]["type"], "service_unavailable");
        assert_eq!(body["error"]["code"], "no_credential_strategy");
        assert!(
            body["error"]["message"]
                .as_str()
                .unwrap()
                .contains("kubernetes_secret")
        );
    }
}
