//! Bedrock Converse dialect: canonical chat-completions in and out of the
//! Converse request/response/stream shapes.

use serde_json::{json, Map, Value};

use super::{
    collect_system_text, split_data_url, StreamState, TranslatedRequest, TranslationWarning,
};
use crate::openai::{
    ChatCompletionChunk, ChatCompletionRequest, ChatCompletionResponse, ChatChoice, ChatMessage,
    ChunkChoice, ChunkDelta, ContentPart, FinishReason, FunctionCall, FunctionCallDelta,
    MessageContent, Role, ToolCall, ToolCallDelta, ToolChoice, ToolChoiceMode, Usage,
};
use crate::{JanusError, Result};

pub fn request_from_openai(request: &ChatCompletionRequest) -> Result<TranslatedRequest> {
    let mut warnings = Vec::new();
    let mut body = Map::new();

    let mut messages = Vec::<Value>::new();
    for message in &request.messages {
        match message.role {
            Role::System => {}
            Role::User => {
                let blocks = content_blocks(message, &mut warnings)?;
                if !blocks.is_empty() {
                    messages.push(json!({ "role": "user", "content": blocks }));
                }
            }
            Role::Assistant => {
                let mut blocks = content_blocks(message, &mut warnings)?;
                for call in message.tool_calls.iter().flatten() {
                    let input: Value =
                        serde_json::from_str(&call.function.arguments).unwrap_or(json!({}));
                    blocks.push(json!({
                        "toolUse": {
                            "toolUseId": call.id,
                            "name": call.function.name,
                            "input": input,
                        }
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
                        "toolResult": {
                            "toolUseId": tool_call_id,
                            "content": [{ "text": text }],
                        }
                    }]
                }));
            }
        }
    }
    body.insert("messages".to_string(), Value::Array(messages));

    if let Some(system) = collect_system_text(&request.messages) {
        body.insert("system".to_string(), json!([{ "text": system }]));
    }

    let mut inference = Map::new();
    if let Some(max_tokens) = request.max_tokens {
        inference.insert("maxTokens".to_string(), json!(max_tokens));
    }
    if let Some(temperature) = request.temperature {
        inference.insert("temperature".to_string(), json!(temperature));
    }
    if let Some(top_p) = request.top_p {
        inference.insert("topP".to_string(), json!(top_p));
    }
    if let Some(stop) = &request.stop {
        inference.insert("stopSequences".to_string(), json!(stop));
    }
    if !inference.is_empty() {
        body.insert("inferenceConfig".to_string(), Value::Object(inference));
    }
    if request.seed.is_some() {
        warnings.push(TranslationWarning::new(
            "seed",
            "bedrock converse does not support seed; dropped",
        ));
    }

    if let Some(tools) = &request.tools {
        let specs: Vec<Value> = tools
            .iter()
            .map(|tool| {
                json!({
                    "toolSpec": {
                        "name": tool.function.name,
                        "description": tool.function.description,
                        "inputSchema": { "json": tool.function.parameters },
                    }
                })
            })
            .collect();
        let mut tool_config = Map::new();
        tool_config.insert("tools".to_string(), Value::Array(specs));
        if let Some(choice) = &request.tool_choice {
            match choice {
                ToolChoice::Mode(ToolChoiceMode::Auto) => {
                    tool_config.insert("toolChoice".to_string(), json!({ "auto": {} }));
                }
                ToolChoice::Mode(ToolChoiceMode::Required) => {
                    tool_config.insert("toolChoice".to_string(), json!({ "any": {} }));
                }
                ToolChoice::Mode(ToolChoiceMode::None) => {
                    // Converse has no "none"; omit the tool config entirely.
                    warnings.push(TranslationWarning::new(
                        "tool_choice",
                        "bedrock converse does not support tool_choice=none; tools omitted",
                    ));
                    tool_config.clear();
                }
                ToolChoice::Tool { function, .. } => {
                    tool_config.insert(
                        "toolChoice".to_string(),
                        json!({ "tool": { "name": function.name } }),
                    );
                }
            }
        }
        if !tool_config.is_empty() {
            body.insert("toolConfig".to_string(), Value::Object(tool_config));
        }
    }

    Ok(TranslatedRequest {
        body: Value::Object(body),
        warnings,
    })
}

fn content_blocks(
    message: &ChatMessage,
    warnings: &mut Vec<TranslationWarning>,
) -> Result<Vec<Value>> {
    let mut blocks = Vec::new();
    match &message.content {
        Some(MessageContent::Text(text)) => {
            if !text.is_empty() {
                blocks.push(json!({ "text": text }));
            }
        }
        Some(MessageContent::Parts(parts)) => {
            for part in parts {
                match part {
                    ContentPart::Text { text } => {
                        if !text.is_empty() {
                            blocks.push(json!({ "text": text }));
                        }
                    }
                    ContentPart::ImageUrl { image_url } => {
                        // Converse takes raw bytes; only data: URLs can be
                        // embedded without fetching.
                        match split_data_url(&image_url.url) {
                            Some((media_type, payload)) => {
                                let format = media_type
                                    .strip_prefix("image/")
                                    .unwrap_or("png")
                                    .to_string();
                                blocks.push(json!({
                                    "image": {
                                        "format": format,
                                        "source": { "bytes": payload },
                                    }
                                }));
                            }
                            None => warnings.push(TranslationWarning::new(
                                "image_url",
                                "bedrock converse cannot reference remote image urls; dropped",
                            )),
                        }
                    }
                    ContentPart::Document { source, name } => match source {
                        crate::openai::DocumentSource::Base64 { media_type, data } => {
                            let format = document_format(media_type);
                            blocks.push(json!({
                                "document": {
                                    "format": format,
                                    "name": name.clone().unwrap_or_else(|| "document".to_string()),
                                    "source": { "bytes": data },
                                }
                            }));
                        }
                        crate::openai::DocumentSource::Url { .. } => {
                            warnings.push(TranslationWarning::new(
                                "document",
                                "bedrock converse cannot reference document urls; dropped",
                            ));
                        }
                    },
                }
            }
        }
        None => {}
    }
    Ok(blocks)
}

fn document_format(media_type: &str) -> &'static str {
    match media_type {
        "application/pdf" => "pdf",
        "text/csv" => "csv",
        "text/html" => "html",
        "text/markdown" => "md",
        "application/vnd.openxmlformats-officedocument.wordprocessingml.document" => "docx",
        _ => "txt",
    }
}

pub fn response_to_openai(native: &Value, model: &str) -> Result<ChatCompletionResponse> {
    let output = native
        .get("output")
        .and_then(|o| o.get("message"))
        .ok_or_else(|| upstream_shape("converse response missing output.message", native))?;

    let mut text = String::new();
    let mut tool_calls = Vec::<ToolCall>::new();
    for block in output
        .get("content")
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
    {
        if let Some(t) = block.get("text").and_then(Value::as_str) {
            text.push_str(t);
        }
        if let Some(tool_use) = block.get("toolUse") {
            tool_calls.push(ToolCall {
                id: tool_use
                    .get("toolUseId")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
                kind: "function".to_string(),
                function: FunctionCall {
                    name: tool_use
                        .get("name")
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .to_string(),
                    arguments: tool_use
                        .get("input")
                        .map(Value::to_string)
                        .unwrap_or_else(|| "{}".to_string()),
                },
            });
        }
    }

    let finish_reason = stop_reason(native.get("stopReason").and_then(Value::as_str));

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
        response.usage = Usage {
            prompt_tokens: usage.get("inputTokens").and_then(Value::as_u64).unwrap_or(0),
            completion_tokens: usage.get("outputTokens").and_then(Value::as_u64).unwrap_or(0),
            total_tokens: usage.get("totalTokens").and_then(Value::as_u64).unwrap_or(0),
        };
    }
    Ok(response)
}

fn stop_reason(reason: Option<&str>) -> FinishReason {
    match reason {
        Some("max_tokens") => FinishReason::Length,
        Some("tool_use") => FinishReason::ToolCalls,
        Some("content_filtered") | Some("guardrail_intervened") => FinishReason::ContentFilter,
        Some("end_turn") | Some("stop_sequence") | None => FinishReason::Stop,
        Some(_) => FinishReason::Stop,
    }
}

/// One ConverseStream event (already JSON-decoded from the eventstream
/// frame, tagged with its event type under `__type`).
pub(crate) fn stream_frame(
    frame: &str,
    template: &ChatCompletionChunk,
    state: &mut StreamState,
) -> Result<Vec<ChatCompletionChunk>> {
    let event: Value = serde_json::from_str(frame)
        .map_err(|err| upstream_shape(&format!("converse stream frame is not json: {err}"), &Value::Null))?;
    let event_type = event
        .get("__type")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();

    let mut chunks = Vec::new();
    match event_type.as_str() {
        "messageStart" => {
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
        "contentBlockStart" => {
            if let Some(tool_use) = event
                .get("start")
                .and_then(|s| s.get("toolUse"))
            {
                let block_index = event
                    .get("contentBlockIndex")
                    .and_then(Value::as_u64)
                    .unwrap_or(0);
                let next_index = state.tool_indexes.len() as u32;
                let index = *state.tool_indexes.entry(block_index).or_insert(next_index);
                let mut chunk = template.clone();
                chunk.choices.push(ChunkChoice {
                    index: 0,
                    delta: ChunkDelta {
                        tool_calls: Some(vec![ToolCallDelta {
                            index,
                            id: tool_use
                                .get("toolUseId")
                                .and_then(Value::as_str)
                                .map(str::to_string),
                            function: Some(FunctionCallDelta {
                                name: tool_use
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
        "contentBlockDelta" => {
            let Some(delta) = event.get("delta") else {
                return Ok(chunks);
            };
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
            if let Some(tool_use) = delta.get("toolUse") {
                let block_index = event
                    .get("contentBlockIndex")
                    .and_then(Value::as_u64)
                    .unwrap_or(0);
                let next_index = state.tool_indexes.len() as u32;
                let index = *state.tool_indexes.entry(block_index).or_insert(next_index);
                let mut chunk = template.clone();
                chunk.choices.push(ChunkChoice {
                    index: 0,
                    delta: ChunkDelta {
                        tool_calls: Some(vec![ToolCallDelta {
                            index,
                            id: None,
                            function: Some(FunctionCallDelta {
                                name: None,
                                arguments: tool_use
                                    .get("input")
                                    .and_then(Value::as_str)
                                    .map(str::to_string),
                            }),
                        }]),
                        ..ChunkDelta::default()
                    },
                    finish_reason: None,
                });
                chunks.push(chunk);
            }
        }
        "messageStop" => {
            let reason = stop_reason(event.get("stopReason").and_then(Value::as_str));
            state.finish_reason = Some(reason);
        }
        "metadata" => {
            if let Some(usage) = event.get("usage") {
                let mut parsed = Usage {
                    prompt_tokens: usage.get("inputTokens").and_then(Value::as_u64).unwrap_or(0),
                    completion_tokens: usage
                        .get("outputTokens")
                        .and_then(Value::as_u64)
                        .unwrap_or(0),
                    total_tokens: usage.get("totalTokens").and_then(Value::as_u64).unwrap_or(0),
                };
                parsed.fill_total();
                state.usage = Some(parsed);
            }
        }
        // contentBlockStop and unknown event kinds produce no delta.
        _ => {}
    }
    Ok(chunks)
}

fn upstream_shape(message: &str, native: &Value) -> JanusError {
    JanusError::Upstream {
        status: reqwest::StatusCode::BAD_GATEWAY,
        message: message.to_string(),
        detail: native.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::openai::{ToolSpec, FunctionSpec};
    use serde_json::json;

    fn base_request() -> ChatCompletionRequest {
        ChatCompletionRequest {
            model: "claude-3-sonnet".to_string(),
            messages: vec![
                ChatMessage::system("be brief"),
                ChatMessage::user("hello"),
            ],
            temperature: Some(0.5),
            top_p: None,
            max_tokens: Some(20),
            stop: Some(vec!["END".to_string()]),
            seed: None,
            tools: None,
            tool_choice: None,
            stream: false,
        }
    }

    #[test]
    fn request_maps_system_and_inference_config() {
        let translated = request_from_openai(&base_request()).unwrap();
        let body = &translated.body;
        assert_eq!(body["system"][0]["text"], "be brief");
        assert_eq!(body["messages"][0]["role"], "user");
        assert_eq!(body["messages"][0]["content"][0]["text"], "hello");
        assert_eq!(body["inferenceConfig"]["maxTokens"], 20);
        assert_eq!(body["inferenceConfig"]["temperature"], 0.5);
        assert_eq!(body["inferenceConfig"]["stopSequences"][0], "END");
        assert!(translated.warnings.is_empty());
    }

    #[test]
    fn request_maps_tools() {
        let mut request = base_request();
        request.tools = Some(vec![ToolSpec {
            kind: "function".to_string(),
            function: FunctionSpec {
                name: "get_weather".to_string(),
                description: Some("weather lookup".to_string()),
                parameters: json!({"type": "object"}),
            },
        }]);
        request.tool_choice = Some(ToolChoice::Mode(ToolChoiceMode::Required));

        let translated = request_from_openai(&request).unwrap();
        let tool = &translated.body["toolConfig"]["tools"][0]["toolSpec"];
        assert_eq!(tool["name"], "get_weather");
        assert_eq!(tool["inputSchema"]["json"]["type"], "object");
        assert!(translated.body["toolConfig"]["toolChoice"]["any"].is_object());
    }

    #[test]
    fn remote_image_drops_with_warning() {
        let mut request = base_request();
        request.messages = vec![ChatMessage {
            role: Role::User,
            content: Some(MessageContent::Parts(vec![
                ContentPart::Text { text: "look".to_string() },
                ContentPart::ImageUrl {
                    image_url: crate::openai::ImageUrl {
                        url: "https://example.com/cat.png".to_string(),
                        detail: None,
                    },
                },
            ])),
            tool_calls: None,
            tool_call_id: None,
            name: None,
            extra: Map::new(),
        }];
        let translated = request_from_openai(&request).unwrap();
        assert_eq!(translated.warnings.len(), 1);
        assert_eq!(translated.warnings[0].feature, "image_url");
        assert_eq!(
            translated.body["messages"][0]["content"].as_array().unwrap().len(),
            1
        );
    }

    #[test]
    fn response_maps_stop_reason_and_usage() {
        let native = json!({
            "output": {
                "message": {
                    "role": "assistant",
                    "content": [{ "text": "hi there" }],
                }
            },
            "stopReason": "max_tokens",
            "usage": { "inputTokens": 10, "outputTokens": 20, "totalTokens": 30 },
        });
        let response = response_to_openai(&native, "claude-3-sonnet").unwrap();
        assert_eq!(response.model, "claude-3-sonnet");
        assert_eq!(response.choices[0].finish_reason, Some(FinishReason::Length));
        assert_eq!(
            response.choices[0].message.content.as_ref().unwrap().text(),
            "hi there"
        );
        assert_eq!(response.usage.total_tokens, 30);
    }

    #[test]
    fn response_maps_tool_use() {
        let native = json!({
            "output": {
                "message": {
                    "content": [
                        { "toolUse": { "toolUseId": "t1", "name": "get_weather", "input": {"city": "Oslo"} } }
                    ],
                }
            },
            "stopReason": "tool_use",
        });
        let response = response_to_openai(&native, "m").unwrap();
        assert_eq!(response.choices[0].finish_reason, Some(FinishReason::ToolCalls));
        let calls = response.choices[0].message.tool_calls.as_ref().unwrap();
        assert_eq!(calls[0].function.name, "get_weather");
        assert!(calls[0].function.arguments.contains("Oslo"));
    }

    #[test]
    fn stream_frames_produce_deltas() {
        let template = ChatCompletionChunk::new("chatcmpl-0badc0de", 7, "claude");
        let mut state = StreamState::default();

        let chunks = stream_frame(
            &json!({"__type": "messageStart", "role": "assistant"}).to_string(),
            &template,
            &mut state,
        )
        .unwrap();
        assert_eq!(chunks[0].choices[0].delta.role, Some(Role::Assistant));

        let chunks = stream_frame(
            &json!({"__type": "contentBlockDelta", "contentBlockIndex": 0, "delta": {"text": "hel"}})
                .to_string(),
            &template,
            &mut state,
        )
        .unwrap();
        assert_eq!(chunks[0].choices[0].delta.content.as_deref(), Some("hel"));

        let chunks = stream_frame(
            &json!({"__type": "messageStop", "stopReason": "end_turn"}).to_string(),
            &template,
            &mut state,
        )
        .unwrap();
        assert!(chunks.is_empty());
        assert_eq!(state.finish_reason, Some(FinishReason::Stop));

        stream_frame(
            &json!({"__type": "metadata", "usage": {"inputTokens": 3, "outputTokens": 4}})
                .to_string(),
            &template,
            &mut state,
        )
        .unwrap();
        assert_eq!(state.usage.as_ref().unwrap().total_tokens, 7);
    }
}
