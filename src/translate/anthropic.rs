//! Anthropic Messages dialect.

use serde_json::{json, Map, Value};

use super::{collect_system_text, split_data_url, StreamState, TranslatedRequest, TranslationWarning};
use crate::openai::{
    ChatCompletionChunk, ChatCompletionRequest, ChatCompletionResponse, ChatChoice, ChatMessage,
    ChunkChoice, ChunkDelta, ContentPart, DocumentSource, FinishReason, FunctionCall,
    FunctionCallDelta, MessageContent, Role, ToolCall, ToolCallDelta, ToolChoice, ToolChoiceMode,
    Usage,
};
use crate::{JanusError, Result};

/// Anthropic requires max_tokens; used when the caller omits it.
const DEFAULT_MAX_TOKENS: u64 = 4096;

pub fn request_from_openai(request: &ChatCompletionRequest) -> Result<TranslatedRequest> {
    let mut warnings = Vec::new();
    let mut body = Map::new();

    body.insert("model".to_string(), json!(request.model));
    match request.max_tokens {
        Some(max_tokens) => {
            body.insert("max_tokens".to_string(), json!(max_tokens));
        }
        None => {
            warnings.push(TranslationWarning::new(
                "max_tokens",
                format!("anthropic requires max_tokens; defaulted to {DEFAULT_MAX_TOKENS}"),
            ));
            body.insert("max_tokens".to_string(), json!(DEFAULT_MAX_TOKENS));
        }
    }

    if let Some(system) = collect_system_text(&request.messages) {
        body.insert("system".to_string(), json!(system));
    }

    let mut messages = Vec::<Value>::new();
    for message in &request.messages {
        match message.role {
            Role::System => {}
            Role::User => {
                let blocks = content_blocks(message, &mut warnings);
                if !blocks.is_empty() {
                    messages.push(json!({ "role": "user", "content": blocks }));
                }
            }
            Role::Assistant => {
                let mut blocks = content_blocks(message, &mut warnings);
                for call in message.tool_calls.iter().flatten() {
                    let input: Value =
                        serde_json::from_str(&call.function.arguments).unwrap_or(json!({}));
                    blocks.push(json!({
                        "type": "tool_use",
                        "id": call.id,
                        "name": call.function.name,
                        "input": input,
                    }));
                }
                if !blocks.is_empty() {
                    messages.push(json!({ "role": "assistant", "content": blocks }));
                }
            }
            Role::Tool => {
                let tool_call_id = message.tool_call_id.clone().ok_or_else(|| {
                    JanusError::translation("tool message is missing tool_call_id")
                })?;
                let text = message
                    .content
                    .as_ref()
                    .map(MessageContent::text)
                    .unwrap_or_default();
                messages.push(json!({
                    "role": "user",
                    "content": [{
                        "type": "tool_result",
                        "tool_use_id": tool_call_id,
                        "content": text,
                    }]
                }));
            }
        }
    }
    body.insert("messages".to_string(), Value::Array(messages));

    if let Some(temperature) = request.temperature {
        body.insert("temperature".to_string(), json!(temperature));
    }
    if let Some(top_p) = request.top_p {
        body.insert("top_p".to_string(), json!(top_p));
    }
    if let Some(stop) = &request.stop {
        body.insert("stop_sequences".to_string(), json!(stop));
    }
    if request.seed.is_some() {
        warnings.push(TranslationWarning::new(
            "seed",
            "anthropic messages does not support seed; dropped",
        ));
    }

    if let Some(tools) = &request.tools {
        let specs: Vec<Value> = tools
            .iter()
            .map(|tool| {
                json!({
                    "name": tool.function.name,
                    "description": tool.function.description,
                    "input_schema": tool.function.parameters,
                })
            })
            .collect();
        body.insert("tools".to_string(), Value::Array(specs));
        if let Some(choice) = &request.tool_choice {
            let mapped = match choice {
                ToolChoice::Mode(ToolChoiceMode::Auto) => Some(json!({ "type": "auto" })),
                ToolChoice::Mode(ToolChoiceMode::Required) => Some(json!({ "type": "any" })),
                ToolChoice::Mode(ToolChoiceMode::None) => None,
                ToolChoice::Tool { function, .. } => {
                    Some(json!({ "type": "tool", "name": function.name }))
                }
            };
            match mapped {
                Some(value) => {
                    body.insert("tool_choice".to_string(), value);
                }
                None => {
                    body.remove("tools");
                    warnings.push(TranslationWarning::new(
                        "tool_choice",
                        "anthropic has no tool_choice=none; tools omitted",
                    ));
                }
            }
        }
    }

    if request.stream {
        body.insert("stream".to_string(), json!(true));
    }

    Ok(TranslatedRequest {
        body: Value::Object(body),
        warnings,
    })
}

fn content_blocks(message: &ChatMessage, _warnings: &mut Vec<TranslationWarning>) -> Vec<Value> {
    let mut blocks = Vec::new();
    match &message.content {
        Some(MessageContent::Text(text)) => {
            if !text.is_empty() {
                blocks.push(json!({ "type": "text", "text": text }));
            }
        }
        Some(MessageContent::Parts(parts)) => {
            for part in parts {
                match part {
                    ContentPart::Text { text } => {
                        if !text.is_empty() {
                            blocks.push(json!({ "type": "text", "text": text }));
                        }
                    }
                    ContentPart::ImageUrl { image_url } => {
                        let source = match split_data_url(&image_url.url) {
                            Some((media_type, payload)) => json!({
                                "type": "base64",
                                "media_type": media_type,
                                "data": payload,
                            }),
                            None => json!({ "type": "url", "url": image_url.url }),
                        };
                        blocks.push(json!({ "type": "image", "source": source }));
                    }
                    ContentPart::Document { source, .. } => {
                        let source = match source {
                            DocumentSource::Base64 { media_type, data } => json!({
                                "type": "base64",
                                "media_type": media_type,
                                "data": data,
                            }),
                            DocumentSource::Url { url } => json!({ "type": "url", "url": url }),
                        };
                        blocks.push(json!({ "type": "document", "source": source }));
                    }
                }
            }
        }
        None => {}
    }
    blocks
}

pub fn response_to_openai(native: &Value, model: &str) -> Result<ChatCompletionResponse> {
    let content = native
        .get("content")
        .and_then(Value::as_array)
        .ok_or_else(|| JanusError::Upstream {
            status: reqwest::StatusCode::BAD_GATEWAY,
            message: "anthropic response missing content".to_string(),
            detail: native.to_string(),
        })?;

    let mut text = String::new();
    let mut tool_calls = Vec::<ToolCall>::new();
    for block in content {
        match block.get("type").and_then(Value::as_str) {
            Some("text") => {
                if let Some(t) = block.get("text").and_then(Value::as_str) {
                    text.push_str(t);
                }
            }
            Some("tool_use") => {
                tool_calls.push(ToolCall {
                    id: block
                        .get("id")
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .to_string(),
                    kind: "function".to_string(),
                    function: FunctionCall {
                        name: block
                            .get("name")
                            .and_then(Value::as_str)
                            .unwrap_or_default()
                            .to_string(),
                        arguments: block
                            .get("input")
                            .map(Value::to_string)
                            .unwrap_or_else(|| "{}".to_string()),
                    },
                });
            }
            _ => {}
        }
    }

    let finish_reason = stop_reason(native.get("stop_reason").and_then(Value::as_str));

    let mut response = ChatCompletionResponse::new(model);
    response.choices.push(ChatChoice {
        index: 0,
        message: ChatMessage {
            role: Role::Assistant,
            content: (!text.is_empty()).then(|| MessageContent::Text(text)),
            tool_calls: (!tool_calls.is_empty()).then_some(tool_calls),
            tool_call_id: None,
            name: None,
            extra: Map::new(),
        },
        finish_reason: Some(finish_reason),
        extra: Map::new(),
    });
    if let Some(usage) = native.get("usage") {
        response.usage = Usage::new(
            usage.get("input_tokens").and_then(Value::as_u64).unwrap_or(0),
            usage.get("output_tokens").and_then(Value::as_u64).unwrap_or(0),
        );
    }
    Ok(response)
}

fn stop_reason(reason: Option<&str>) -> FinishReason {
    match reason {
        Some("max_tokens") => FinishReason::Length,
        Some("tool_use") => FinishReason::ToolCalls,
        Some("refusal") => FinishReason::ContentFilter,
        Some("end_turn") | Some("stop_sequence") | None => FinishReason::Stop,
        Some(_) => FinishReason::Stop,
    }
}

pub(crate) fn stream_frame(
    frame: &str,
    template: &ChatCompletionChunk,
    state: &mut StreamState,
) -> Result<Vec<ChatCompletionChunk>> {
    let event: Value = serde_json::from_str(frame).map_err(|err| JanusError::Upstream {
        status: reqwest::StatusCode::BAD_GATEWAY,
        message: format!("anthropic stream frame is not json: {err}"),
        detail: frame.to_string(),
    })?;
    let event_type = event.get("type").and_then(Value::as_str).unwrap_or_default();

    let mut chunks = Vec::new();
    match event_type {
        "message_start" => {
            if let Some(usage) = event.pointer("/message/usage") {
                let prompt = usage.get("input_tokens").and_then(Value::as_u64).unwrap_or(0);
                state.usage = Some(Usage::new(prompt, 0));
            }
            let mut chunk = template.clone();
            chunk.choices.push(ChunkChoice {
                index: 0,
                delta: ChunkDelta {
                    role: Some(Role::Assistant),
                    ..ChunkDelta::default()
                },
                finish_reason: None,
            });
            state.role_sent = true;
            chunks.push(chunk);
        }
        "content_block_start" => {
            let block_index = event.get("index").and_then(Value::as_u64).unwrap_or(0);
            if let Some(block) = event.get("content_block") {
                if block.get("type").and_then(Value::as_str) == Some("tool_use") {
                    let next_index = state.tool_indexes.len() as u32;
                    let index = *state.tool_indexes.entry(block_index).or_insert(next_index);
                    let mut chunk = template.clone();
                    chunk.choices.push(ChunkChoice {
                        index: 0,
                        delta: ChunkDelta {
                            tool_calls: Some(vec![ToolCallDelta {
                                index,
                                id: block.get("id").and_then(Value::as_str).map(str::to_string),
                                function: Some(FunctionCallDelta {
                                    name: block
                                        .get("name")
                                        .and_then(Value::as_str)
                                        .map(str::to_string),
                                    arguments: None,
                                }),
                            }]),
                            ..ChunkDelta::default()
                        },
                        finish_reason: None,
                    });
                    chunks.push(chunk);
                }
            }
        }
        "content_block_delta" => {
            let block_index = event.get("index").and_then(Value::as_u64).unwrap_or(0);
            let Some(delta) = event.get("delta") else {
                return Ok(chunks);
            };
            match delta.get("type").and_then(Value::as_str) {
                Some("text_delta") => {
                    if let Some(text) = delta.get("text").and_then(Value::as_str) {
                        let mut chunk = template.clone();
                        chunk.choices.push(ChunkChoice {
                            index: 0,
                            delta: ChunkDelta {
                                content: Some(text.to_string()),
                                ..ChunkDelta::default()
                            },
                            finish_reason: None,
                        });
                        chunks.push(chunk);
                    }
                }
                Some("input_json_delta") => {
                    let next_index = state.tool_indexes.len() as u32;
                    let index = *state.tool_indexes.entry(block_index).or_insert(next_index);
                    if let Some(partial) = delta.get("partial_json").and_then(Value::as_str) {
                        let mut chunk = template.clone();
                        chunk.choices.push(ChunkChoice {
                            index: 0,
                            delta: ChunkDelta {
                                tool_calls: Some(vec![ToolCallDelta {
                                    index,
                                    id: None,
                                    function: Some(FunctionCallDelta {
                                        name: None,
                                        arguments: Some(partial.to_string()),
                                    }),
                                }]),
                                ..ChunkDelta::default()
                            },
                            finish_reason: None,
                        });
                        chunks.push(chunk);
                    }
                }
                _ => {}
            }
        }
        "message_delta" => {
            if let Some(reason) = event.pointer("/delta/stop_reason").and_then(Value::as_str) {
                state.finish_reason = Some(stop_reason(Some(reason)));
            }
            if let Some(output) = event.pointer("/usage/output_tokens").and_then(Value::as_u64) {
                let prompt = state.usage.as_ref().map(|u| u.prompt_tokens).unwrap_or(0);
                state.usage = Some(Usage::new(prompt, output));
            }
        }
        // ping, content_block_stop and message_stop carry no delta.
        _ => {}
    }
    Ok(chunks)
}
