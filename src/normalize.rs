//! Validation of inbound requests and their mapping onto Bedrock invocation bodies.

use axum::http::HeaderMap;
use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value, json};
use std::collections::HashSet;

use crate::anthropic::{
    CompletionRequest, ContentBlock, MessageContent, MessagesRequest, Role,
};
use crate::config::{BedrockConfig, Config, DEFAULT_ANTHROPIC_VERSION, UnknownFieldPolicy};
use crate::error::{AppError, AppResult};

/// Values taken from request headers that override or extend the body.
#[derive(Debug, Clone, Default)]
pub struct RequestContext {
    pub anthropic_version: Option<String>,
    pub betas: Vec<String>,
}

impl RequestContext {
    pub fn from_headers(headers: &HeaderMap) -> Self {
        let anthropic_version = headers
            .get("anthropic-version")
            .and_then(|v| v.to_str().ok())
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty());
        let betas = headers
            .get_all("anthropic-beta")
            .iter()
            .filter_map(|v| v.to_str().ok())
            .flat_map(|v| v.split(','))
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .map(str::to_string)
            .collect();
        Self {
            anthropic_version,
            betas,
        }
    }

    pub fn has_beta_prefix(&self, prefix: &str) -> bool {
        self.betas.iter().any(|b| b.starts_with(prefix))
    }
}

/// A request ready to be sent upstream.
#[derive(Debug, Clone)]
pub struct NormalizedRequest {
    /// Model id as the client sent it (or the configured default); echoed in responses.
    pub requested_model: String,
    pub upstream_model_id: String,
    pub body: Bytes,
    pub stream: bool,
    pub betas: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedModel {
    pub requested: String,
    pub upstream_id: String,
}

pub fn parse_body<T: DeserializeOwned>(raw: &[u8]) -> AppResult<T> {
    if raw.iter().all(u8::is_ascii_whitespace) {
        return Err(AppError::invalid_request("request body is empty"));
    }
    serde_json::from_slice(raw)
        .map_err(|err| AppError::invalid_request(format!("invalid request body: {err}")))
}

/// Maps a public model id to a Bedrock model id.
///
/// Mapped names win; ids that already carry a vendor prefix (`anthropic.…`, `us.anthropic.…`)
/// pass through; an absent id falls back to the configured default.
pub fn resolve_model(cfg: &BedrockConfig, requested: Option<&str>) -> AppResult<ResolvedModel> {
    let requested = match requested.map(str::trim).filter(|m| !m.is_empty()) {
        Some(model) => model.to_string(),
        None => cfg
            .anthropic_default_model
            .clone()
            .filter(|m| !m.is_empty())
            .ok_or_else(|| AppError::invalid_request("model: field required"))?,
    };
    let upstream_id = if let Some(mapped) = cfg.model_mappings.get(&requested) {
        mapped.clone()
    } else if requested.contains('.') {
        requested.clone()
    } else {
        return Err(AppError::invalid_request(format!(
            "model: unknown model '{requested}'"
        )));
    };
    Ok(ResolvedModel {
        requested,
        upstream_id,
    })
}

/// Header value wins over the body; the result goes through the version mappings.
pub fn resolve_anthropic_version(
    cfg: &BedrockConfig,
    header: Option<&str>,
    body: Option<&str>,
) -> String {
    let raw = header
        .or(body)
        .map(str::trim)
        .filter(|v| !v.is_empty());
    let mapped = raw.map(|v| {
        cfg.anthropic_version_mappings
            .get(v)
            .cloned()
            .unwrap_or_else(|| v.to_string())
    });
    match mapped {
        Some(version) => version,
        None if !cfg.anthropic_default_version.is_empty() => cfg.anthropic_default_version.clone(),
        None => DEFAULT_ANTHROPIC_VERSION.to_string(),
    }
}

/// Order-preserving union of header and body beta flags.
pub fn merge_betas(header: &[String], body: Option<&[String]>) -> Vec<String> {
    let mut seen = HashSet::new();
    header
        .iter()
        .chain(body.unwrap_or(&[]).iter())
        .map(|b| b.trim())
        .filter(|b| !b.is_empty() && seen.insert(b.to_string()))
        .map(str::to_string)
        .collect()
}

/// Checks messages, tool references and tool definitions.
pub fn validate_conversation(req: &MessagesRequest) -> AppResult<()> {
    if req.messages.is_empty() {
        return Err(AppError::invalid_request(
            "messages: at least one message is required",
        ));
    }

    let mut tool_use_ids: HashSet<&str> = HashSet::new();
    for (i, message) in req.messages.iter().enumerate() {
        match &message.content {
            MessageContent::Text(text) => {
                if text.is_empty() {
                    return Err(AppError::invalid_request(format!(
                        "messages.{i}.content: text content must be non-empty"
                    )));
                }
            }
            MessageContent::Blocks(blocks) => {
                if blocks.is_empty() {
                    return Err(AppError::invalid_request(format!(
                        "messages.{i}.content: at least one content block is required"
                    )));
                }
                for (j, block) in blocks.iter().enumerate() {
                    match &**block {
                        ContentBlock::ToolUse { id, .. } if message.role == Role::Assistant => {
                            tool_use_ids.insert(id.as_str());
                        }
                        ContentBlock::ToolUse { .. } => {
                            return Err(AppError::invalid_request(format!(
                                "messages.{i}.content.{j}: tool_use blocks are only allowed in assistant messages"
                            )));
                        }
                        ContentBlock::ToolResult { tool_use_id, .. } => {
                            if message.role != Role::User {
                                return Err(AppError::invalid_request(format!(
                                    "messages.{i}.content.{j}: tool_result blocks are only allowed in user messages"
                                )));
                            }
                            if !tool_use_ids.contains(tool_use_id.as_str()) {
                                return Err(AppError::invalid_request(format!(
                                    "messages.{i}.content.{j}: tool_result references unknown tool_use_id '{tool_use_id}'"
                                )));
                            }
                        }
                        _ => {}
                    }
                }
            }
        }
    }

    validate_tools(req)
}

fn validate_tools(req: &MessagesRequest) -> AppResult<()> {
    let Some(tools) = &req.tools else {
        return Ok(());
    };
    let mut names = HashSet::new();
    for (i, tool) in tools.iter().enumerate() {
        if tool.name.trim().is_empty() {
            return Err(AppError::invalid_request(format!(
                "tools.{i}.name: must be non-empty"
            )));
        }
        if tool.is_custom() {
            let schema_type = tool
                .input_schema
                .as_ref()
                .and_then(|s| s.get("type"))
                .and_then(Value::as_str);
            if schema_type != Some("object") {
                return Err(AppError::invalid_request(format!(
                    "tools.{i}.input_schema: type must be 'object'"
                )));
            }
        } else if tool.tool_type.as_deref().unwrap_or("").trim().is_empty() {
            return Err(AppError::invalid_request(format!(
                "tools.{i}.type: must be non-empty"
            )));
        }
        if !names.insert(tool.name.as_str()) {
            return Err(AppError::invalid_request(format!(
                "tools: duplicate tool name '{}'",
                tool.name
            )));
        }
    }
    Ok(())
}

/// Message shown when an invocation body exceeds the limit. Mirrors the wording
/// Bedrock uses for its own size check, which clients match on.
pub fn oversized_message(limit: usize) -> String {
    format!(
        "bedrock InvokeModel rejected locally: ValidationException: 1 validation error detected: \
         Value at 'body' failed to satisfy constraint: Member must have length less than or equal to {limit}"
    )
}

fn encode_body(cfg: &Config, body: Map<String, Value>) -> AppResult<Bytes> {
    let bytes = serde_json::to_vec(&Value::Object(body))
        .map_err(|err| AppError::internal(format!("failed to encode bedrock body: {err}")))?;
    if bytes.len() > cfg.max_body_bytes {
        return Err(AppError::invalid_request(oversized_message(cfg.max_body_bytes)));
    }
    Ok(Bytes::from(bytes))
}

fn to_value<T: serde::Serialize>(value: &T) -> AppResult<Value> {
    serde_json::to_value(value)
        .map_err(|err| AppError::internal(format!("failed to encode bedrock body: {err}")))
}

/// Applies the unknown-field policy to `extra`, copying kept fields into `body`.
fn apply_unknown_fields(
    policy: UnknownFieldPolicy,
    extra: &Map<String, Value>,
    body: &mut Map<String, Value>,
) -> AppResult<()> {
    match policy {
        UnknownFieldPolicy::Ignore => Ok(()),
        UnknownFieldPolicy::Reject => match extra.keys().next() {
            Some(key) => Err(AppError::invalid_request(format!(
                "{key}: extra inputs are not permitted"
            ))),
            None => Ok(()),
        },
        UnknownFieldPolicy::Preserve => {
            for (k, v) in extra {
                body.entry(k.clone()).or_insert_with(|| v.clone());
            }
            Ok(())
        }
    }
}

/// Validates a Messages request and builds its Bedrock body.
pub fn normalize_messages(
    cfg: &Config,
    ctx: &RequestContext,
    req: MessagesRequest,
) -> AppResult<NormalizedRequest> {
    let model = resolve_model(&cfg.bedrock, req.model.as_deref())?;
    validate_conversation(&req)?;
    let max_tokens = match req.max_tokens {
        Some(0) => {
            return Err(AppError::invalid_request(
                "max_tokens: must be greater than 0",
            ));
        }
        Some(n) => n,
        None => return Err(AppError::invalid_request("max_tokens: field required")),
    };

    let version = resolve_anthropic_version(
        &cfg.bedrock,
        ctx.anthropic_version.as_deref(),
        req.anthropic_version.as_deref(),
    );
    let betas = merge_betas(&ctx.betas, req.betas.as_deref());

    let mut body = Map::new();
    body.insert("anthropic_version".to_string(), json!(version));
    if !betas.is_empty() {
        body.insert("anthropic_beta".to_string(), json!(betas));
    }
    body.insert("max_tokens".to_string(), json!(max_tokens));
    if let Some(system) = &req.system {
        body.insert("system".to_string(), to_value(system)?);
    }
    body.insert("messages".to_string(), to_value(&req.messages)?);
    if let Some(tools) = &req.tools {
        if !tools.is_empty() {
            body.insert("tools".to_string(), to_value(tools)?);
        }
    }
    if let Some(choice) = &req.tool_choice {
        body.insert("tool_choice".to_string(), choice.clone());
    }
    if let Some(t) = req.temperature {
        body.insert("temperature".to_string(), json!(t));
    }
    if let Some(p) = req.top_p.filter(|p| *p >= 0.0) {
        body.insert("top_p".to_string(), json!(p));
    }
    if let Some(k) = req.top_k.filter(|k| *k >= 0) {
        body.insert("top_k".to_string(), json!(k));
    }
    if let Some(stop) = &req.stop_sequences {
        if !stop.is_empty() {
            body.insert("stop_sequences".to_string(), json!(stop));
        }
    }
    if let Some(thinking) = &req.thinking {
        body.insert("thinking".to_string(), thinking.clone());
    }
    apply_unknown_fields(cfg.unknown_fields, &req.extra, &mut body)?;

    Ok(NormalizedRequest {
        requested_model: model.requested,
        upstream_model_id: model.upstream_id,
        body: encode_body(cfg, body)?,
        stream: req.stream.unwrap_or(false),
        betas,
    })
}

/// Validates a legacy text-completion request and builds its Bedrock body.
pub fn normalize_completion(
    cfg: &Config,
    req: CompletionRequest,
) -> AppResult<NormalizedRequest> {
    let model = resolve_model(&cfg.bedrock, req.model.as_deref())?;
    if req.prompt.trim().is_empty() {
        return Err(AppError::invalid_request("prompt: must be non-empty"));
    }
    let max_tokens = match req.max_tokens_to_sample {
        Some(0) => {
            return Err(AppError::invalid_request(
                "max_tokens_to_sample: must be greater than 0",
            ));
        }
        Some(n) => n,
        None => {
            return Err(AppError::invalid_request(
                "max_tokens_to_sample: field required",
            ));
        }
    };

    let mut body = Map::new();
    body.insert("prompt".to_string(), json!(wrap_prompt(&req.prompt)));
    body.insert("max_tokens_to_sample".to_string(), json!(max_tokens));
    if let Some(t) = req.temperature {
        body.insert("temperature".to_string(), json!(t));
    }
    if let Some(p) = req.top_p.filter(|p| *p >= 0.0) {
        body.insert("top_p".to_string(), json!(p));
    }
    if let Some(k) = req.top_k.filter(|k| *k >= 0) {
        body.insert("top_k".to_string(), json!(k));
    }
    if let Some(stop) = &req.stop_sequences {
        if !stop.is_empty() {
            body.insert("stop_sequences".to_string(), json!(stop));
        }
    }
    apply_unknown_fields(cfg.unknown_fields, &req.extra, &mut body)?;

    Ok(NormalizedRequest {
        requested_model: model.requested,
        upstream_model_id: model.upstream_id,
        body: encode_body(cfg, body)?,
        stream: req.stream.unwrap_or(false),
        betas: Vec::new(),
    })
}

/// Text completions need the `Human:` / `Assistant:` turn markers.
pub fn wrap_prompt(prompt: &str) -> String {
    if prompt.trim_end().ends_with("Assistant:") {
        prompt.to_string()
    } else {
        format!("\n\nHuman: {prompt}\n\nAssistant:")
    }
}
