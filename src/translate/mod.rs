//! Bidirectional translation between the canonical chat-completions dialect
//! and each provider's native dialect: request, response, and streaming.

pub mod anthropic;
pub mod bedrock;
pub mod gemini;
pub mod oracle;
pub mod watsonx;

use rand::Rng;
use serde_json::Value;

use crate::config::Dialect;
use crate::openai::{
    ChatCompletionChunk, ChatCompletionRequest, ChatCompletionResponse, ChatMessage, ChunkChoice,
    ChunkDelta, FinishReason, MessageContent, Role,
};
use crate::{JanusError, Result};

/// Emitted when a canonical feature does not survive translation. Warnings
/// reach the log, never the upstream request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TranslationWarning {
    pub feature: String,
    pub details: String,
}

impl TranslationWarning {
    pub fn new(feature: impl Into<String>, details: impl Into<String>) -> Self {
        Self {
            feature: feature.into(),
            details: details.into(),
        }
    }
}

/// A native request body plus everything the dispatcher needs to ship it.
#[derive(Debug, Clone)]
pub struct TranslatedRequest {
    pub body: Value,
    pub warnings: Vec<TranslationWarning>,
}

/// Canonical response id: `chatcmpl-` plus 8 hex chars.
pub fn new_response_id() -> String {
    let n: u32 = rand::rng().random();
    format!("chatcmpl-{n:08x}")
}

/// Canonical request into the target dialect.
pub fn translate_request(dialect: Dialect, request: &ChatCompletionRequest) -> Result<TranslatedRequest> {
    match dialect {
        Dialect::Openai | Dialect::AzureOpenai => {
            // The caller-facing dialect is already the native one; Azure only
            // differs in URL shape and authentication.
            Ok(TranslatedRequest {
                body: serde_json::to_value(request)?,
                warnings: Vec::new(),
            })
        }
        Dialect::BedrockConverse => bedrock::request_from_openai(request),
        Dialect::AnthropicMessages => anthropic::request_from_openai(request),
        Dialect::Gemini => gemini::request_from_openai(request),
        Dialect::Watsonx => watsonx::request_from_openai(request),
        Dialect::OracleGenai => oracle::request_from_openai(request),
    }
}

/// Native response into the canonical shape. `id` and `created` are stamped
/// by the dispatcher; `model` echoes the caller's model name.
pub fn translate_response(
    dialect: Dialect,
    native: &Value,
    model: &str,
    id: &str,
    created: i64,
) -> Result<ChatCompletionResponse> {
    let mut response = match dialect {
        Dialect::Openai | Dialect::AzureOpenai => {
            serde_json::from_value::<ChatCompletionResponse>(native.clone()).map_err(|err| {
                JanusError::Upstream {
                    status: reqwest::StatusCode::BAD_GATEWAY,
                    message: format!("upstream returned a malformed chat completion: {err}"),
                    detail: native.to_string(),
                }
            })?
        }
        Dialect::BedrockConverse => bedrock::response_to_openai(native, model)?,
        Dialect::AnthropicMessages => anthropic::response_to_openai(native, model)?,
        Dialect::Gemini => gemini::response_to_openai(native, model)?,
        Dialect::Watsonx => watsonx::response_to_openai(native, model)?,
        Dialect::OracleGenai => oracle::response_to_openai(native, model)?,
    };
    response.id = id.to_string();
    response.created = created;
    response.usage.fill_total();
    Ok(response)
}

/// Stateful frame-by-frame stream translation. Each native frame yields zero
/// or more canonical chunks; `finish` emits the terminal chunk exactly once.
pub struct StreamTranslator {
    dialect: Dialect,
    id: String,
    created: i64,
    model: String,
    state: StreamState,
}

/// Shared per-stream accumulation used by every dialect.
#[derive(Debug, Default)]
pub(crate) struct StreamState {
    pub role_sent: bool,
    pub finish_sent: bool,
    pub finish_reason: Option<FinishReason>,
    pub usage: Option<crate::openai::Usage>,
    /// Native content-block index → canonical tool-call index.
    pub tool_indexes: std::collections::HashMap<u64, u32>,
}

impl StreamTranslator {
    pub fn new(dialect: Dialect, id: impl Into<String>, created: i64, model: impl Into<String>) -> Self {
        Self {
            dialect,
            id: id.into(),
            created,
            model: model.into(),
            state: StreamState::default(),
        }
    }

    fn chunk(&self) -> ChatCompletionChunk {
        ChatCompletionChunk::new(self.id.clone(), self.created, self.model.clone())
    }

    /// Feeds one native frame (the decoded SSE data or eventstream payload).
    pub fn on_frame(&mut self, frame: &str) -> Result<Vec<ChatCompletionChunk>> {
        if self.state.finish_sent {
            return Ok(Vec::new());
        }
        let template = self.chunk();
        match self.dialect {
            Dialect::Openai | Dialect::AzureOpenai => {
                passthrough_frame(frame, &template, &mut self.state)
            }
            Dialect::BedrockConverse => bedrock::stream_frame(frame, &template, &mut self.state),
            Dialect::AnthropicMessages => anthropic::stream_frame(frame, &template, &mut self.state),
            Dialect::Gemini => gemini::stream_frame(frame, &template, &mut self.state),
            Dialect::Watsonx => watsonx::stream_frame(frame, &template, &mut self.state),
            Dialect::OracleGenai => oracle::stream_frame(frame, &template, &mut self.state),
        }
    }

    /// Terminal chunk carrying the final finish_reason, emitted exactly once.
    /// Returns `None` when a finish chunk already went out mid-stream.
    pub fn finish(&mut self) -> Option<ChatCompletionChunk> {
        if self.state.finish_sent {
            return None;
        }
        self.state.finish_sent = true;
        let mut chunk = self.chunk();
        chunk.choices.push(ChunkChoice {
            index: 0,
            delta: ChunkDelta::default(),
            finish_reason: Some(self.state.finish_reason.unwrap_or(FinishReason::Stop)),
        });
        chunk.usage = self.state.usage.clone();
        Some(chunk)
    }
}

/// OpenAI-dialect streams pass through with the canonical id/created/model
/// restamped.
fn passthrough_frame(
    frame: &str,
    template: &ChatCompletionChunk,
    state: &mut StreamState,
) -> Result<Vec<ChatCompletionChunk>> {
    let mut chunk: ChatCompletionChunk = serde_json::from_str(frame).map_err(|err| {
        JanusError::Upstream {
            status: reqwest::StatusCode::BAD_GATEWAY,
            message: format!("upstream sent a malformed stream chunk: {err}"),
            detail: frame.to_string(),
        }
    })?;
    chunk.id = template.id.clone();
    chunk.created = template.created;
    chunk.model = template.model.clone();
    if let Some(usage) = &chunk.usage {
        state.usage = Some(usage.clone());
    }
    for choice in &chunk.choices {
        if let Some(reason) = choice.finish_reason {
            state.finish_reason = Some(reason);
            state.finish_sent = true;
        }
    }
    Ok(vec![chunk])
}

/// Concatenates system messages, in order, for dialects that separate the
/// system prompt from the conversation.
pub(crate) fn collect_system_text(messages: &[ChatMessage]) -> Option<String> {
    let mut out = String::new();
    for message in messages {
        if message.role != Role::System {
            continue;
        }
        if let Some(content) = &message.content {
            let text = content.text();
            if text.is_empty() {
                continue;
            }
            if !out.is_empty() {
                out.push('\n');
            }
            out.push_str(&text);
        }
    }
    (!out.is_empty()).then_some(out)
}

/// Flattens a message to plain text for prompt-only dialects; non-text parts
/// produce warnings.
pub(crate) fn message_plain_text(
    message: &ChatMessage,
    warnings: &mut Vec<TranslationWarning>,
) -> String {
    match &message.content {
        Some(MessageContent::Text(text)) => text.clone(),
        Some(MessageContent::Parts(parts)) => {
            let mut out = String::new();
            for part in parts {
                match part {
                    crate::openai::ContentPart::Text { text } => out.push_str(text),
                    other => warnings.push(TranslationWarning::new(
                        "content_part",
                        format!("dropping unsupported content part: {}", part_name(other)),
                    )),
                }
            }
            out
        }
        None => String::new(),
    }
}

pub(crate) fn part_name(part: &crate::openai::ContentPart) -> &'static str {
    match part {
        crate::openai::ContentPart::Text { .. } => "text",
        crate::openai::ContentPart::ImageUrl { .. } => "image_url",
        crate::openai::ContentPart::Document { .. } => "document",
    }
}

/// Splits a `data:` URL into (media_type, payload); `None` for plain URLs.
pub(crate) fn split_data_url(url: &str) -> Option<(String, String)> {
    let rest = url.strip_prefix("data:")?;
    let (meta, payload) = rest.split_once(',')?;
    let media_type = meta.strip_suffix(";base64").unwrap_or(meta);
    let media_type = if media_type.is_empty() {
        "application/octet-stream"
    } else {
        media_type
    };
    Some((media_type.to_string(), payload.to_string()))
}
