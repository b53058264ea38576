use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;
use thiserror::Error;
use tracing::warn;

pub type Result<T> = std::result::Result<T, ProxyError>;

/// Every failure the proxy can surface to a client.
#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Cannot reach upstream: {0}")]
    UpstreamUnreachable(String),

    #[error("Upstream timed out: {0}")]
    UpstreamTimeout(String),

    #[error("Upstream returned HTTP {0}")]
    UpstreamStatus(u16),

    #[error("Malformed manifest: {0}")]
    MalformedManifest(String),

    #[error("Variant playlist {0} is itself a master playlist")]
    UnexpectedNestedMaster(String),

    #[error("Resource too large: {declared} bytes exceeds limit of {limit} bytes")]
    ResourceTooLarge { declared: u64, limit: u64 },

    #[error("Unsupported operation: {0}")]
    UnsupportedOperation(String),
}

impl ProxyError {
    /// Stable machine-readable identifier, part of the JSON error body.
    pub fn kind(&self) -> &'static str {
        match self {
            ProxyError::InvalidInput(_) => "invalid_input",
            ProxyError::UpstreamUnreachable(_) => "upstream_unreachable",
            ProxyError::UpstreamTimeout(_) => "upstream_timeout",
            ProxyError::UpstreamStatus(_) => "upstream_status",
            ProxyError::MalformedManifest(_) => "malformed_manifest",
            ProxyError::UnexpectedNestedMaster(_) => "unexpected_nested_master",
            ProxyError::ResourceTooLarge { .. } => "resource_too_large",
            ProxyError::UnsupportedOperation(_) => "unsupported_operation",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            ProxyError::InvalidInput(_) | ProxyError::UnsupportedOperation(_) => {
                StatusCode::BAD_REQUEST
            }
            ProxyError::ResourceTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            ProxyError::UpstreamTimeout(_) => StatusCode::GATEWAY_TIMEOUT,
            ProxyError::UpstreamUnreachable(_)
            | ProxyError::UpstreamStatus(_)
            | ProxyError::MalformedManifest(_)
            | ProxyError::UnexpectedNestedMaster(_) => StatusCode::BAD_GATEWAY,
        }
    }

    /// Whether the failure originated upstream (counted separately in metrics).
    pub fn is_upstream(&self) -> bool {
        matches!(
            self,
            ProxyError::UpstreamUnreachable(_)
                | ProxyError::UpstreamTimeout(_)
                | ProxyError::UpstreamStatus(_)
        )
    }
}

impl From<reqwest::Error> for ProxyError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            ProxyError::UpstreamTimeout(err.to_string())
        } else if let Some(status) = err.status() {
            ProxyError::UpstreamStatus(status.as_u16())
        } else {
            ProxyError::UpstreamUnreachable(err.to_string())
        }
    }
}

impl IntoResponse for ProxyError {
    fn into_response(self) -> Response {
        let status = self.status();
        warn!(kind = self.kind(), status = status.as_u16(), "{}", self);

        let body = Json(json!({
            "error": self.to_string(),
            "kind": self.kind(),
            "status": status.as_u16(),
        }));

        (status, body).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_mapping_matches_boundary_contract() {
        assert_eq!(
            ProxyError::InvalidInput("x".into()).status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            ProxyError::UnsupportedOperation("x".into()).status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            ProxyError::ResourceTooLarge {
                declared: 2,
                limit: 1
            }
            .status(),
            StatusCode::PAYLOAD_TOO_LARGE
        );
        assert_eq!(
            ProxyError::UpstreamStatus(404).status(),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(
            ProxyError::UpstreamUnreachable("refused".into()).status(),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(
            ProxyError::UpstreamTimeout("read".into()).status(),
            StatusCode::GATEWAY_TIMEOUT
        );
    }

    #[test]
    fn kinds_are_stable_identifiers() {
        assert_eq!(ProxyError::UpstreamStatus(500).kind(), "upstream_status");
        assert_eq!(
            ProxyError::UnexpectedNestedMaster("u".into()).kind(),
            "unexpected_nested_master"
        );
        assert_eq!(
            ProxyError::MalformedManifest("bad".into()).kind(),
            "malformed_manifest"
        );
    }

    #[test]
    fn upstream_errors_are_flagged() {
        assert!(ProxyError::UpstreamStatus(503).is_upstream());
        assert!(!ProxyError::InvalidInput("x".into()).is_upstream());
    }

    #[tokio::test]
    async fn into_response_renders_json_body() {
        use http_body_util::BodyExt;

        let resp = ProxyError::UpstreamStatus(404).into_response();
        assert_eq!(resp.status(), StatusCode::BAD_GATEWAY);

        let body = resp.into_body().collect().await.unwrap().to_bytes();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["kind"], "upstream_status");
        assert_eq!(json["status"], 502);
        assert!(json["error"].as_str().unwrap().contains("404"));
    }
}
