use axum::http::StatusCode;

use crate::anthropic::{CompletionResponse, MessagesResponse};
use crate::error::{AppError, AppResult, ErrorKind};
use crate::upstream::{Operation, UpstreamError};

pub fn message_id() -> String {
    format!("msg_bdrk_{}", uuid::Uuid::new_v4().simple())
}

pub fn completion_id() -> String {
    format!("compl_bdrk_{}", uuid::Uuid::new_v4().simple())
}

/// Parses a Bedrock Messages body and echoes the requested model id.
pub fn translate_message(raw: &[u8], requested_model: &str) -> AppResult<MessagesResponse> {
    let mut resp: MessagesResponse = serde_json::from_slice(raw).map_err(|err| {
        AppError::internal(format!("failed to decode bedrock response: {err}"))
    })?;
    resp.model = requested_model.to_string();
    if resp.id.is_empty() {
        resp.id = message_id();
    }
    Ok(resp)
}

pub fn translate_completion(raw: &[u8], requested_model: &str) -> AppResult<CompletionResponse> {
    let mut resp: CompletionResponse = serde_json::from_slice(raw).map_err(|err| {
        AppError::internal(format!("failed to decode bedrock response: {err}"))
    })?;
    resp.response_type = "completion".to_string();
    resp.model = requested_model.to_string();
    if resp.id.is_empty() {
        resp.id = completion_id();
    }
    Ok(resp)
}

/// Public error kind for a Bedrock error code, if the code is a known one.
pub fn kind_for_code(code: &str) -> Option<ErrorKind> {
    let kind = match code {
        "ValidationException" => ErrorKind::InvalidRequest,
        "AccessDeniedException" | "AccessDenied" => ErrorKind::Permission,
        "UnrecognizedClientException"
        | "ExpiredTokenException"
        | "InvalidSignatureException"
        | "ExpiredToken"
        | "InvalidClientTokenId"
        | "SignatureDoesNotMatch" => ErrorKind::Authentication,
        "ResourceNotFoundException" => ErrorKind::NotFound,
        "ThrottlingException" | "TooManyRequestsException" => ErrorKind::RateLimit,
        "ServiceUnavailableException" | "ModelNotReadyException" | "ServiceQuotaExceededException" => {
            ErrorKind::Overloaded
        }
        "ModelTimeoutException" => ErrorKind::Timeout,
        _ => return None,
    };
    Some(kind)
}

pub fn classify(err: &UpstreamError) -> AppError {
    match err {
        UpstreamError::Api {
            operation,
            status,
            code,
            ..
        } => {
            // Unmapped STS codes are configuration faults on this side.
            let fallback = if (400..500).contains(status) && *operation != Operation::AssumeRole {
                ErrorKind::InvalidRequest
            } else {
                ErrorKind::Internal
            };
            let kind = kind_for_code(code).unwrap_or(fallback);
            AppError::new(kind, err.to_string())
        }
        UpstreamError::Timeout { .. } => AppError::new(ErrorKind::Timeout, err.to_string()),
        UpstreamError::Network { .. } => {
            AppError::internal(err.to_string()).with_status(StatusCode::BAD_GATEWAY)
        }
        UpstreamError::Credentials(_) | UpstreamError::Decode(_) => AppError::internal(err.to_string()),
    }
}
