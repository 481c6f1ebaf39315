use async_trait::async_trait;
use axum::http::HeaderMap;
use bytes::Bytes;
use futures_util::stream::BoxStream;
use serde_json::Value;

/// Raw upstream chunks of a streamed invocation, each one JSON document.
pub type ChunkStream = BoxStream<'static, Result<Bytes, UpstreamError>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    InvokeModel,
    InvokeModelWithResponseStream,
    AssumeRole,
}

impl Operation {
    pub fn as_str(self) -> &'static str {
        match self {
            Operation::InvokeModel => "InvokeModel",
            Operation::InvokeModelWithResponseStream => "InvokeModelWithResponseStream",
            Operation::AssumeRole => "AssumeRole",
        }
    }

    pub fn service(self) -> &'static str {
        match self {
            Operation::AssumeRole => "sts",
            _ => "bedrock",
        }
    }
}

impl std::fmt::Display for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum UpstreamError {
    /// Error reported by the service itself, with its code and message.
    #[error("{} {operation} failed (status {status}): {code}: {message}", .operation.service())]
    Api {
        operation: Operation,
        status: u16,
        code: String,
        message: String,
    },
    #[error("{} {operation} transport error: {message}", .operation.service())]
    Network { operation: Operation, message: String },
    #[error("{} {operation} timed out after {after_ms}ms", .operation.service())]
    Timeout { operation: Operation, after_ms: u64 },
    #[error("failed to obtain credentials: {0}")]
    Credentials(String),
    #[error("failed to decode bedrock response: {0}")]
    Decode(String),
}

impl UpstreamError {
    pub fn api(operation: Operation, status: u16, code: impl Into<String>, message: impl Into<String>) -> Self {
        UpstreamError::Api {
            operation,
            status,
            code: code.into(),
            message: message.into(),
        }
    }

    pub fn code(&self) -> Option<&str> {
        match self {
            UpstreamError::Api { code, .. } => Some(code),
            _ => None,
        }
    }
}

/// Invokes a hosted model with an already adapted request body.
#[async_trait]
pub trait UpstreamClient: Send + Sync {
    async fn invoke(&self, model_id: &str, body: Bytes) -> Result<Bytes, UpstreamError>;

    /// Returns once response headers arrive; chunks are pulled lazily from the stream.
    async fn invoke_stream(&self, model_id: &str, body: Bytes) -> Result<ChunkStream, UpstreamError>;
}

/// Builds an [`UpstreamError::Api`] from a non-success HTTP response.
///
/// The code comes from `x-amzn-ErrorType` (`Code:uri` form) or the body's
/// `__type` / `code` field; the message from `message` / `Message`.
pub fn error_from_response(operation: Operation, status: u16, headers: &HeaderMap, body: &str) -> UpstreamError {
    let parsed: Option<Value> = serde_json::from_str(body).ok();
    let code = headers
        .get("x-amzn-errortype")
        .and_then(|v| v.to_str().ok())
        .map(|v| v.split(':').next().unwrap_or(v).to_string())
        .or_else(|| parsed.as_ref().and_then(extract_error_code))
        .unwrap_or_else(|| fallback_code(status).to_string());
    let message = parsed
        .as_ref()
        .and_then(extract_error_message)
        .unwrap_or_else(|| body.trim().to_string());
    UpstreamError::api(operation, status, code, message)
}

fn extract_error_code(value: &Value) -> Option<String> {
    let raw = value
        .get("__type")
        .or_else(|| value.get("code"))
        .or_else(|| value.get("Code"))
        .or_else(|| value.get("Error").and_then(|e| e.get("Code")))
        .and_then(|v| v.as_str())?;
    // `__type` may be `namespace#Code`.
    Some(raw.rsplit('#').next().unwrap_or(raw).to_string())
}

fn extract_error_message(value: &Value) -> Option<String> {
    value
        .get("message")
        .or_else(|| value.get("Message"))
        .or_else(|| value.get("Error").and_then(|e| e.get("Message")))
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
}

fn fallback_code(status: u16) -> &'static str {
    match status {
        400 => "ValidationException",
        401 | 403 => "AccessDeniedException",
        404 => "ResourceNotFoundException",
        429 => "ThrottlingException",
        503 => "ServiceUnavailableException",
        _ => "InternalServerException",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn code_from_error_type_header() {
        let mut headers = HeaderMap::new();
        headers.insert(
            "x-amzn-ErrorType",
            "ValidationException:http://internal.amazon.com/coral/com.amazon.bedrock/"
                .parse()
                .unwrap(),
        );
        let err = error_from_response(
            Operation::InvokeModel,
            400,
            &headers,
            r#"{"message":"Malformed input request"}"#,
        );
        assert_eq!(err.code(), Some("ValidationException"));
        assert_eq!(
            err.to_string(),
            "bedrock InvokeModel failed (status 400): ValidationException: Malformed input request"
        );
    }

    #[test]
    fn code_from_body_type_field() {
        let err = error_from_response(
            Operation::InvokeModel,
            429,
            &HeaderMap::new(),
            r#"{"__type":"com.amazon.coral.availability#ThrottlingException","message":"slow down"}"#,
        );
        assert_eq!(err.code(), Some("ThrottlingException"));
    }

    #[test]
    fn non_json_body_falls_back_to_status() {
        let err = error_from_response(Operation::InvokeModel, 503, &HeaderMap::new(), "busy\n");
        assert_eq!(err.code(), Some("ServiceUnavailableException"));
        assert!(err.to_string().ends_with("ServiceUnavailableException: busy"));
    }
}
