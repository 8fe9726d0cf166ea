//! Error types and client-facing error responses

use http_body_util::{combinators::BoxBody, BodyExt, Full};
use hyper::body::Bytes;
use hyper::{Response, StatusCode};
use thiserror::Error;

/// Error codes for failures surfaced to proxied clients
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxyErrorCode {
    /// Missing or unusable Host header
    MissingHostHeader,
    /// No running service is registered under the requested subdomain
    UnknownService,
    /// The resolved backend could not be reached
    ConnectionFailed,
    /// The backend did not answer within the configured request timeout
    RequestTimeout,
}

impl ProxyErrorCode {
    /// Get the HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            ProxyErrorCode::MissingHostHeader => StatusCode::BAD_REQUEST,
            ProxyErrorCode::UnknownService => StatusCode::NOT_FOUND,
            ProxyErrorCode::ConnectionFailed => StatusCode::BAD_GATEWAY,
            ProxyErrorCode::RequestTimeout => StatusCode::GATEWAY_TIMEOUT,
        }
    }

    /// Get the error code as a string for the X-Proxy-Error header
    pub fn as_header_value(&self) -> &'static str {
        match self {
            ProxyErrorCode::MissingHostHeader => "MISSING_HOST_HEADER",
            ProxyErrorCode::UnknownService => "UNKNOWN_SERVICE",
            ProxyErrorCode::ConnectionFailed => "CONNECTION_FAILED",
            ProxyErrorCode::RequestTimeout => "REQUEST_TIMEOUT",
        }
    }

    /// Human-readable body; never carries internal error detail
    pub fn message(&self) -> &'static str {
        self.status_code()
            .canonical_reason()
            .unwrap_or("Proxy Error")
    }
}

/// Create a plain-text error response with X-Proxy-Error header
pub fn error_response(code: ProxyErrorCode) -> Response<BoxBody<Bytes, hyper::Error>> {
    Response::builder()
        .status(code.status_code())
        .header("Content-Type", "text/plain; charset=utf-8")
        .header("X-Proxy-Error", code.as_header_value())
        .body(
            Full::new(Bytes::from_static(code.message().as_bytes()))
                .map_err(|never| match never {})
                .boxed(),
        )
        .expect("valid response with StatusCode enum and static headers")
}

/// Failure that aborts a proxied connection instead of producing a response.
///
/// Returning one of these from the request service makes hyper drop the
/// connection without writing a single byte, which is how unroutable
/// upgrade handshakes are refused.
#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("upgrade request for unknown service '{0}'")]
    UnknownUpgradeTarget(String),

    #[error("upgrade request without a usable Host header")]
    UpgradeWithoutHost,
}

/// Errors produced by the container event feed
#[derive(Debug, Clone, Error)]
pub enum FeedError {
    /// A single event could not be decoded; the feed itself is still usable
    #[error("malformed event: {0}")]
    Decode(String),

    /// The subscription failed or was cut; no further events will arrive on it
    #[error("event feed transport error: {0}")]
    Transport(String),
}

impl From<bollard::errors::Error> for FeedError {
    fn from(err: bollard::errors::Error) -> Self {
        match err {
            bollard::errors::Error::JsonDataError { .. }
            | bollard::errors::Error::JsonSerdeError { .. } => FeedError::Decode(err.to_string()),
            other => FeedError::Transport(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_code_status_codes() {
        assert_eq!(
            ProxyErrorCode::MissingHostHeader.status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            ProxyErrorCode::UnknownService.status_code(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            ProxyErrorCode::ConnectionFailed.status_code(),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(
            ProxyErrorCode::RequestTimeout.status_code(),
            StatusCode::GATEWAY_TIMEOUT
        );
    }

    #[test]
    fn test_unknown_service_response() {
        let response = error_response(ProxyErrorCode::UnknownService);

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(
            response.headers().get("X-Proxy-Error").unwrap(),
            "UNKNOWN_SERVICE"
        );
        assert_eq!(ProxyErrorCode::UnknownService.message(), "Not Found");
    }

    #[test]
    fn test_gateway_messages_are_generic() {
        assert_eq!(ProxyErrorCode::ConnectionFailed.message(), "Bad Gateway");
        assert_eq!(ProxyErrorCode::RequestTimeout.message(), "Gateway Timeout");
    }

    #[test]
    fn test_feed_error_classification() {
        let serde_err = serde_json::from_str::<serde_json::Value>("{").unwrap_err();
        let decode = FeedError::from(bollard::errors::Error::from(serde_err));
        assert!(matches!(decode, FeedError::Decode(_)));

        let transport = FeedError::from(bollard::errors::Error::DockerResponseServerError {
            status_code: 500,
            message: "daemon gone".to_string(),
        });
        assert!(matches!(transport, FeedError::Transport(_)));
    }
}
