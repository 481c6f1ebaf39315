//! Local input-token estimate for `/v1/messages/count_tokens`.

use serde_json::Value;
use std::sync::OnceLock;
use tiktoken_rs::{CoreBPE, cl100k_base};

use crate::anthropic::{ContentBlock, MessageContent, MessagesRequest, Passthrough, SystemPrompt};
use crate::error::{AppError, AppResult};

/// Role markers and separators added around every message.
const PER_MESSAGE_OVERHEAD: u64 = 4;
/// Tool-use preamble the model sees once tools are declared.
const TOOLS_OVERHEAD: u64 = 16;
/// Rough flat cost of an image or document attachment.
const ATTACHMENT_TOKENS: u64 = 1_500;

static BPE: OnceLock<Result<CoreBPE, String>> = OnceLock::new();

fn bpe() -> AppResult<&'static CoreBPE> {
    BPE.get_or_init(|| cl100k_base().map_err(|err| err.to_string()))
        .as_ref()
        .map_err(|err| AppError::internal(format!("tokenizer unavailable: {err}")))
}

fn count_text(text: &str, bpe: &CoreBPE) -> u64 {
    bpe.encode_ordinary(text).len() as u64
}

fn count_value(value: &Value, bpe: &CoreBPE) -> u64 {
    match value {
        Value::Null => 0,
        Value::String(s) => count_text(s, bpe),
        other => count_text(&other.to_string(), bpe),
    }
}

fn count_block(block: &Passthrough<ContentBlock>, bpe: &CoreBPE) -> u64 {
    match &**block {
        ContentBlock::Text { text, .. } => count_text(text, bpe),
        ContentBlock::Image { .. } | ContentBlock::Document { .. } => ATTACHMENT_TOKENS,
        ContentBlock::ToolUse { name, input, .. } => {
            count_text(name, bpe) + count_value(input, bpe)
        }
        ContentBlock::ToolResult { content, .. } => match content {
            Some(Value::Array(parts)) => parts
                .iter()
                .map(|p| match p.get("text").and_then(Value::as_str) {
                    Some(text) => count_text(text, bpe),
                    None => count_value(p, bpe),
                })
                .sum(),
            Some(other) => count_value(other, bpe),
            None => 0,
        },
        ContentBlock::Thinking { thinking, .. } => count_text(thinking, bpe),
        ContentBlock::RedactedThinking { .. } => 0,
        ContentBlock::Unknown => count_value(block.raw(), bpe),
    }
}

/// Counts system text, message content and tool definitions.
pub fn count_input_tokens(req: &MessagesRequest) -> AppResult<u64> {
    let bpe = bpe()?;
    let mut total = 0u64;

    if let Some(system) = &req.system {
        total += match system {
            SystemPrompt::Text(text) => count_text(text, bpe),
            SystemPrompt::Blocks(blocks) => blocks.iter().map(|b| count_text(&b.text, bpe)).sum(),
        };
    }

    for message in &req.messages {
        total += PER_MESSAGE_OVERHEAD;
        total += match &message.content {
            MessageContent::Text(text) => count_text(text, bpe),
            MessageContent::Blocks(blocks) => blocks.iter().map(|b| count_block(b, bpe)).sum(),
        };
    }

    if let Some(tools) = req.tools.as_ref().filter(|t| !t.is_empty()) {
        total += TOOLS_OVERHEAD;
        for tool in tools {
            total += count_text(&tool.name, bpe);
            if let Some(description) = &tool.description {
                total += count_text(description, bpe);
            }
            if let Some(schema) = &tool.input_schema {
                total += count_value(schema, bpe);
            }
        }
    }

    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn request(value: Value) -> MessagesRequest {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn counts_grow_with_content() {
        let short = request(json!({"messages": [{"role": "user", "content": "Hello"}]}));
        let long = request(json!({
            "system": "You are a helpful assistant.",
            "messages": [{"role": "user", "content": "Hello, how are you doing today?"}]
        }));
        let a = count_input_tokens(&short).unwrap();
        let b = count_input_tokens(&long).unwrap();
        assert!(a > PER_MESSAGE_OVERHEAD);
        assert!(b > a);
    }

    #[test]
    fn tools_are_counted() {
        let base = json!({"messages": [{"role": "user", "content": "weather?"}]});
        let mut with_tools = base.clone();
        with_tools["tools"] = json!([{
            "name": "get_weather",
            "description": "Get the current weather in a given location",
            "input_schema": {"type": "object", "properties": {"location": {"type": "string"}}}
        }]);
        let without = count_input_tokens(&request(base)).unwrap();
        let with = count_input_tokens(&request(with_tools)).unwrap();
        assert!(with > without + TOOLS_OVERHEAD);
    }

    #[test]
    fn unknown_blocks_count_their_json() {
        let plain = request(json!({"messages": [{"role": "user", "content": [
            {"type": "text", "text": "q"}
        ]}]}));
        let with_unknown = request(json!({"messages": [{"role": "user", "content": [
            {"type": "text", "text": "q"},
            {"type": "search_result", "source": "https://example.com", "title": "Search result title",
                "content": [{"type": "text", "text": "a fairly long passage of retrieved text"}]}
        ]}]}));
        assert!(count_input_tokens(&with_unknown).unwrap() > count_input_tokens(&plain).unwrap());
    }
}
