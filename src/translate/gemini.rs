//! Vertex Gemini dialect (generateContent / streamGenerateContent).

use serde_json::{json, Map, Value};

use super::{collect_system_text, split_data_url, StreamState, TranslatedRequest, TranslationWarning};
use crate::openai::{
    ChatCompletionChunk, ChatCompletionRequest, ChatCompletionResponse, ChatChoice, ChatMessage,
    ChunkChoice, ChunkDelta, ContentPart, DocumentSource, FinishReason, FunctionCall,
    FunctionCallDelta, MessageContent, Role, ToolCall, ToolCallDelta, ToolChoice, ToolChoiceMode,
    Usage,
};
use crate::{JanusError, Result};

pub fn request_from_openai(request: &ChatCompletionRequest) -> Result<TranslatedRequest> {
    let mut warnings = Vec::new();
    let mut body = Map::new();

    if let Some(system) = collect_system_text(&request.messages) {
        body.insert(
            "systemInstruction".to_string(),
            json!({ "parts": [{ "text": system }] }),
        );
    }

    let mut contents = Vec::<Value>::new();
    for message in &request.messages {
        match message.role {
            Role::System => {}
            Role::User => {
                let parts = message_parts(message, &mut warnings);
                if !parts.is_empty() {
                    contents.push(json!({ "role": "user", "parts": parts }));
                }
            }
            Role::Assistant => {
                let mut parts = message_parts(message, &mut warnings);
                for call in message.tool_calls.iter().flatten() {
                    let args: Value =
                        serde_json::from_str(&call.function.arguments).unwrap_or(json!({}));
                    parts.push(json!({
                        "functionCall": { "name": call.function.name, "args": args }
                    }));
                }
                if !parts.is_empty() {
                    contents.push(json!({ "role": "model", "parts": parts }));
                }
            }
            Role::Tool => {
                // Gemini matches tool results by function name.
                let name = message.name.clone().unwrap_or_default();
                let text = message
                    .content
                    .as_ref()
                    .map(MessageContent::text)
                    .unwrap_or_default();
                let response: Value =
                    serde_json::from_str(&text).unwrap_or_else(|_| json!({ "output": text }));
                contents.push(json!({
                    "role": "user",
                    "parts": [{
                        "functionResponse": { "name": name, "response": response }
                    }]
                }));
            }
        }
    }
    body.insert("contents".to_string(), Value::Array(contents));

    let mut generation = Map::new();
    if let Some(max_tokens) = request.max_tokens {
        generation.insert("maxOutputTokens".to_string(), json!(max_tokens));
    }
    if let Some(temperature) = request.temperature {
        generation.insert("temperature".to_string(), json!(temperature));
    }
    if let Some(top_p) = request.top_p {
        generation.insert("topP".to_string(), json!(top_p));
    }
    if let Some(stop) = &request.stop {
        generation.insert("stopSequences".to_string(), json!(stop));
    }
    if let Some(seed) = request.seed {
        generation.insert("seed".to_string(), json!(seed));
    }
    if !generation.is_empty() {
        body.insert("generationConfig".to_string(), Value::Object(generation));
    }

    if let Some(tools) = &request.tools {
        let declarations: Vec<Value> = tools
            .iter()
            .map(|tool| {
                json!({
                    "name": tool.function.name,
                    "description": tool.function.description,
                    "parameters": tool.function.parameters,
                })
            })
            .collect();
        body.insert(
            "tools".to_string(),
            json!([{ "functionDeclarations": declarations }]),
        );
        if let Some(choice) = &request.tool_choice {
            let config = match choice {
                ToolChoice::Mode(ToolChoiceMode::Auto) => json!({ "mode": "AUTO" }),
                ToolChoice::Mode(ToolChoiceMode::None) => json!({ "mode": "NONE" }),
                ToolChoice::Mode(ToolChoiceMode::Required) => json!({ "mode": "ANY" }),
                ToolChoice::Tool { function, .. } => json!({
                    "mode": "ANY",
                    "allowedFunctionNames": [function.name],
                }),
            };
            body.insert(
                "toolConfig".to_string(),
                json!({ "functionCallingConfig": config }),
            );
        }
    }

    Ok(TranslatedRequest {
        body: Value::Object(body),
        warnings,
    })
}

fn message_parts(message: &ChatMessage, _warnings: &mut Vec<TranslationWarning>) -> Vec<Value> {
    let mut parts = Vec::new();
    match &message.content {
        Some(MessageContent::Text(text)) => {
            if !text.is_empty() {
                parts.push(json!({ "text": text }));
            }
        }
        Some(MessageContent::Parts(content_parts)) => {
            for part in content_parts {
                match part {
                    ContentPart::Text { text } => {
                        if !text.is_empty() {
                            parts.push(json!({ "text": text }));
                        }
                    }
                    ContentPart::ImageUrl { image_url } => {
                        match split_data_url(&image_url.url) {
                            Some((media_type, payload)) => parts.push(json!({
                                "inlineData": { "mimeType": media_type, "data": payload }
                            })),
                            // Gemini takes remote references inline.
                            None => parts.push(json!({
                                "fileData": { "mimeType": "image/*", "fileUri": image_url.url }
                            })),
                        }
                    }
                    ContentPart::Document { source, .. } => match source {
                        DocumentSource::Base64 { media_type, data } => parts.push(json!({
                            "inlineData": { "mimeType": media_type, "data": data }
                        })),
                        DocumentSource::Url { url } => parts.push(json!({
                            "fileData": { "mimeType": "application/pdf", "fileUri": url }
                        })),
                    },
                }
            }
        }
        None => {}
    }
    parts
}

pub fn response_to_openai(native: &Value, model: &str) -> Result<ChatCompletionResponse> {
    let candidates = native
        .get("candidates")
        .and_then(Value::as_array)
        .ok_or_else(|| JanusError::Upstream {
            status: reqwest::StatusCode::BAD_GATEWAY,
            message: "gemini response missing candidates".to_string(),
            detail: native.to_string(),
        })?;

    let mut response = ChatCompletionResponse::new(model);
    for (position, candidate) in candidates.iter().enumerate() {
        let mut text = String::new();
        let mut tool_calls = Vec::<ToolCall>::new();
        for part in candidate
            .pointer("/content/parts")
            .and_then(Value::as_array)
            .into_iter()
            .flatten()
        {
            if let Some(t) = part.get("text").and_then(Value::as_str) {
                text.push_str(t);
            }
            if let Some(call) = part.get("functionCall") {
                let name = call
                    .get("name")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string();
                tool_calls.push(ToolCall {
                    id: format!("call_{}", tool_calls.len()),
                    kind: "function".to_string(),
                    function: FunctionCall {
                        arguments: call
                            .get("args")
                            .map(Value::to_string)
                            .unwrap_or_else(|| "{}".to_string()),
                        name,
                    },
                });
            }
        }

        let finish_reason = if !tool_calls.is_empty() {
            FinishReason::ToolCalls
        } else {
            finish_reason(candidate.get("finishReason").and_then(Value::as_str))
        };

        response.choices.push(ChatChoice {
            index: candidate
                .get("index")
                .and_then(Value::as_u64)
                .unwrap_or(position as u64) as u32,
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
    }

    if let Some(usage) = native.get("usageMetadata") {
        response.usage = Usage {
            prompt_tokens: usage
                .get("promptTokenCount")
                .and_then(Value::as_u64)
                .unwrap_or(0),
            completion_tokens: usage
                .get("candidatesTokenCount")
                .and_then(Value::as_u64)
                .unwrap_or(0),
            total_tokens: usage
                .get("totalTokenCount")
                .and_then(Value::as_u64)
                .unwrap_or(0),
        };
    }
    Ok(response)
}

fn finish_reason(reason: Option<&str>) -> FinishReason {
    match reason {
        Some("MAX_TOKENS") => FinishReason::Length,
        Some("SAFETY") | Some("RECITATION") | Some("PROHIBITED_CONTENT") => {
            FinishReason::ContentFilter
        }
        Some("STOP") | None => FinishReason::Stop,
        Some(_) => FinishReason::Stop,
    }
}

/// Gemini streams full candidate snapshots per SSE frame; each frame's text
/// parts become one content delta.
pub(crate) fn stream_frame(
    frame: &str,
    template: &ChatCompletionChunk,
    state: &mut StreamState,
) -> Result<Vec<ChatCompletionChunk>> {
    let event: Value = serde_json::from_str(frame).map_err(|err| JanusError::Upstream {
        status: reqwest::StatusCode::BAD_GATEWAY,
        message: format!("gemini stream frame is not json: {err}"),
        detail: frame.to_string(),
    })?;

    let mut chunks = Vec::new();
    if !state.role_sent {
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

    if let Some(candidate) = event
        .get("candidates")
        .and_then(Value::as_array)
        .and_then(|c| c.first())
    {
        for part in candidate
            .pointer("/content/parts")
            .and_then(Value::as_array)
            .into_iter()
            .flatten()
        {
            if let Some(text) = part.get("text").and_then(Value::as_str) {
                if !text.is_empty() {
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
            if let Some(call) = part.get("functionCall") {
                let index = state.tool_indexes.len() as u32;
                state.tool_indexes.insert(index as u64, index);
                let mut chunk = template.clone();
                chunk.choices.push(ChunkChoice {
                    index: 0,
                    delta: ChunkDelta {
                        tool_calls: Some(vec![ToolCallDelta {
                            index,
                            id: Some(format!("call_{index}")),
                            function: Some(FunctionCallDelta {
                                name: call
                                    .get("name")
                                    .and_then(Value::as_str)
                                    .map(str::to_string),
                                arguments: call.get("args").map(Value::to_string),
                            }),
                        }]),
                        ..ChunkDelta::default()
                    },
                    finish_reason: None,
                });
                state.finish_reason = Some(FinishReason::ToolCalls);
                chunks.push(chunk);
            }
        }
        if let Some(reason) = candidate.get("finishReason").and_then(Value::as_str) {
            if state.finish_reason != Some(FinishReason::ToolCalls) {
                state.finish_reason = Some(finish_reason(Some(reason)));
            }
        }
    }

    if let Some(usage) = event.get("usageMetadata") {
        let mut parsed = Usage {
            prompt_tokens: usage
                .get("promptTokenCount")
                .and_then(Value::as_u64)
                .unwrap_or(0),
            completion_tokens: usage
                .get("candidatesTokenCount")
                .and_then(Value::as_u64)
                .unwrap_or(0),
            total_tokens: usage
                .get("totalTokenCount")
                .and_then(Value::as_u64)
                .unwrap_or(0),
        };
        parsed.fill_total();
        state.usage = Some(parsed);
    }

    Ok(chunks)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn base_request() -> ChatCompletionRequest {
        ChatCompletionRequest {
            model: "gemini-1.5-pro".to_string(),
            messages: vec![ChatMessage::system("short"), ChatMessage::user("hi")],
            temperature: None,
            top_p: Some(0.9),
            max_tokens: Some(32),
            stop: None,
            seed: Some(7),
            tools: None,
            tool_choice: None,
            stream: false,
        }
    }

    #[test]
    fn request_uses_camel_case_config() {
        let translated = request_from_openai(&base_request()).unwrap();
        let body = &translated.body;
        assert_eq!(body["systemInstruction"]["parts"][0]["text"], "short");
        assert_eq!(body["generationConfig"]["maxOutputTokens"], 32);
        assert_eq!(body["generationConfig"]["topP"], 0.9);
        assert_eq!(body["generationConfig"]["seed"], 7);
        assert_eq!(body["contents"][0]["role"], "user");
    }

    #[test]
    fn remote_image_stays_a_reference() {
        let mut request = base_request();
        request.messages = vec![ChatMessage {
            role: Role::User,
            content: Some(MessageContent::Parts(vec![ContentPart::ImageUrl {
                image_url: crate::openai::ImageUrl {
                    url: "https://example.com/cat.png".to_string(),
                    detail: None,
                },
            }])),
            tool_calls: None,
            tool_call_id: None,
            name: None,
            extra: Map::new(),
        }];
        let translated = request_from_openai(&request).unwrap();
        assert_eq!(
            translated.body["contents"][0]["parts"][0]["fileData"]["fileUri"],
            "https://example.com/cat.png"
        );
        assert!(translated.warnings.is_empty());
    }

    #[test]
    fn response_maps_candidates() {
        let native = json!({
            "candidates": [{
                "index": 0,
                "finishReason": "MAX_TOKENS",
                "content": { "role": "model", "parts": [{ "text": "partial" }] },
            }],
            "usageMetadata": {
                "promptTokenCount": 4,
                "candidatesTokenCount": 8,
                "totalTokenCount": 12,
            },
        });
        let response = response_to_openai(&native, "gemini-1.5-pro").unwrap();
        assert_eq!(response.choices[0].finish_reason, Some(FinishReason::Length));
        assert_eq!(response.usage.total_tokens, 12);
    }

    #[test]
    fn stream_emits_role_then_text() {
        let template = ChatCompletionChunk::new("chatcmpl-deadbeef", 3, "gemini-1.5-pro");
        let mut state = StreamState::default();
        let frame = json!({
            "candidates": [{ "content": { "parts": [{ "text": "hello" }] } }]
        })
        .to_string();
        let chunks = stream_frame(&frame, &template, &mut state).unwrap();
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].choices[0].delta.role, Some(Role::Assistant));
        assert_eq!(chunks[1].choices[0].delta.content.as_deref(), Some("hello"));

        // Role only once.
        let chunks = stream_frame(&frame, &template, &mut state).unwrap();
        assert_eq!(chunks.len(), 1);
    }
}
