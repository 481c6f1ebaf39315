use crate::anthropic::{CompletionRequest, CountTokensResponse, MessagesRequest};
use crate::app::AppState;
use crate::auth::check_api_key;
use crate::error::{AppError, AppResult, ErrorKind};
use crate::normalize::{
    NormalizedRequest, RequestContext, normalize_completion, normalize_messages, oversized_message,
    parse_body, resolve_model, validate_conversation,
};
use crate::stream;
use crate::tokens::count_input_tokens;
use crate::translate::{classify, translate_completion, translate_message};
use axum::Json;
use axum::extract::State;
use axum::extract::rejection::BytesRejection;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response, Sse};
use bytes::Bytes;
use serde_json::json;

const TOKEN_COUNTING_BETA_PREFIX: &str = "token-counting-";

pub async fn metrics(State(state): State<AppState>) -> impl IntoResponse {
    state.metrics.render()
}

pub async fn health() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}

pub async fn not_found() -> AppError {
    AppError::new(ErrorKind::NotFound, "not found")
}

fn record_request(endpoint: &'static str, stream: bool) {
    metrics::counter!(
        "proxy_requests_total",
        "endpoint" => endpoint,
        "stream" => if stream { "true" } else { "false" }
    )
    .increment(1);
}

/// Body-read failures, the inbound size limit included, become error envelopes.
fn read_body(state: &AppState, body: Result<Bytes, BytesRejection>) -> AppResult<Bytes> {
    body.map_err(|rejection| {
        if rejection.status() == StatusCode::PAYLOAD_TOO_LARGE {
            let limit = state.config.max_body_bytes.min(state.config.max_inbound_bytes);
            AppError::invalid_request(oversized_message(limit))
        } else {
            AppError::invalid_request(format!(
                "failed to read request body: {}",
                rejection.body_text()
            ))
        }
    })
}

fn log_upstream_error(req: &NormalizedRequest, err: &crate::upstream::UpstreamError) -> AppError {
    tracing::warn!(
        model = %req.requested_model,
        model_id = %req.upstream_model_id,
        error = %err,
        "upstream call failed"
    );
    classify(err)
}

pub async fn create_message(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Result<Bytes, BytesRejection>,
) -> AppResult<Response> {
    check_api_key(&headers, state.config.api_key.as_deref())?;
    let body = read_body(&state, body)?;
    let ctx = RequestContext::from_headers(&headers);
    let req: MessagesRequest = parse_body(&body)?;
    let normalized = normalize_messages(&state.config, &ctx, req)?;
    record_request("messages", normalized.stream);
    tracing::debug!(
        model = %normalized.requested_model,
        model_id = %normalized.upstream_model_id,
        stream = normalized.stream,
        betas = ?normalized.betas,
        body_bytes = normalized.body.len(),
        "forwarding message request"
    );

    if normalized.stream {
        let upstream = state
            .upstream
            .invoke_stream(&normalized.upstream_model_id, normalized.body.clone())
            .await
            .map_err(|err| log_upstream_error(&normalized, &err))?;
        let events = stream::message_events(upstream, normalized.requested_model);
        return Ok(Sse::new(events).into_response());
    }

    let raw = state
        .upstream
        .invoke(&normalized.upstream_model_id, normalized.body.clone())
        .await
        .map_err(|err| log_upstream_error(&normalized, &err))?;
    let resp = translate_message(&raw, &normalized.requested_model)?;
    Ok(Json(resp).into_response())
}

pub async fn count_tokens(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Result<Bytes, BytesRejection>,
) -> AppResult<Response> {
    check_api_key(&headers, state.config.api_key.as_deref())?;
    let body = read_body(&state, body)?;
    let ctx = RequestContext::from_headers(&headers);
    if state.config.count_tokens_requires_beta && !ctx.has_beta_prefix(TOKEN_COUNTING_BETA_PREFIX) {
        return Err(AppError::invalid_request(
            "count_tokens requires the 'token-counting-2024-11-01' anthropic-beta flag",
        ));
    }
    let req: MessagesRequest = parse_body(&body)?;
    resolve_model(&state.config.bedrock, req.model.as_deref())?;
    validate_conversation(&req)?;
    record_request("count_tokens", false);
    let input_tokens = count_input_tokens(&req)?;
    Ok(Json(CountTokensResponse { input_tokens }).into_response())
}

pub async fn create_completion(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Result<Bytes, BytesRejection>,
) -> AppResult<Response> {
    check_api_key(&headers, state.config.api_key.as_deref())?;
    let body = read_body(&state, body)?;
    let req: CompletionRequest = parse_body(&body)?;
    let normalized = normalize_completion(&state.config, req)?;
    record_request("complete", normalized.stream);
    tracing::debug!(
        model = %normalized.requested_model,
        model_id = %normalized.upstream_model_id,
        stream = normalized.stream,
        "forwarding completion request"
    );

    if normalized.stream {
        let upstream = state
            .upstream
            .invoke_stream(&normalized.upstream_model_id, normalized.body.clone())
            .await
            .map_err(|err| log_upstream_error(&normalized, &err))?;
        let events = stream::completion_events(upstream, normalized.requested_model);
        return Ok(Sse::new(events).into_response());
    }

    let raw = state
        .upstream
        .invoke(&normalized.upstream_model_id, normalized.body.clone())
        .await
        .map_err(|err| log_upstream_error(&normalized, &err))?;
    let resp = translate_completion(&raw, &normalized.requested_model)?;
    Ok(Json(resp).into_response())
}
