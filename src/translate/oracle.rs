//! Oracle Generative AI dialect (generateText). Prompt-style like watsonx;
//! the compartment and serving mode are added by the provider client.

use serde_json::{json, Map, Value};

use super::{message_plain_text, StreamState, TranslatedRequest, TranslationWarning};
use crate::openai::{
    ChatCompletionChunk, ChatCompletionRequest, ChatCompletionResponse, ChatChoice, ChatMessage,
    ChunkChoice, ChunkDelta, FinishReason, MessageContent, Role, Usage,
};
use crate::{JanusError, Result};

pub fn request_from_openai(request: &ChatCompletionRequest) -> Result<TranslatedRequest> {
    if request.tools.is_some() || request.tool_choice.is_some() {
        return Err(JanusError::translation(
            "oracle generateText does not support tools",
        ));
    }

    let mut warnings = Vec::new();
    let prompt = flatten_prompt(&request.messages, &mut warnings);

    let mut inference = Map::new();
    inference.insert("runtimeType".to_string(), json!("COHERE"));
    inference.insert("prompt".to_string(), json!(prompt));
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
    if request.seed.is_some() {
        warnings.push(TranslationWarning::new(
            "seed",
            "oracle generateText does not support seed; dropped",
        ));
    }

    let body = json!({
        "servingMode": {
            "servingType": "ON_DEMAND",
            "modelId": request.model,
        },
        "inferenceRequest": Value::Object(inference),
    });

    Ok(TranslatedRequest {
        body,
        warnings,
    })
}

fn flatten_prompt(messages: &[ChatMessage], warnings: &mut Vec<TranslationWarning>) -> String {
    let mut prompt = String::new();
    for message in messages {
        let text = message_plain_text(message, warnings);
        if text.is_empty() {
            continue;
        }
        let prefix = match message.role {
            Role::System => "System: ",
            Role::User => "User: ",
            Role::Assistant => "Assistant: ",
            Role::Tool => "Tool: ",
        };
        prompt.push_str(prefix);
        prompt.push_str(&text);
        prompt.push('\n');
    }
    prompt.push_str("Assistant:");
    prompt
}

pub fn response_to_openai(native: &Value, model: &str) -> Result<ChatCompletionResponse> {
    let generated = native
        .pointer("/inferenceResponse/generatedTexts/0")
        .ok_or_else(|| JanusError::Upstream {
            status: reqwest::StatusCode::BAD_GATEWAY,
            message: "oracle response missing generatedTexts".to_string(),
            detail: native.to_string(),
        })?;

    let text = generated
        .get("text")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    let finish_reason = finish_reason(generated.get("finishReason").and_then(Value::as_str));

    let mut response = ChatCompletionResponse::new(model);
    response.choices.push(ChatChoice {
        index: 0,
        message: ChatMessage {
            role: Role::Assistant,
            content: Some(MessageContent::Text(text)),
            tool_calls: None,
            tool_call_id: None,
            name: None,
            extra: Map::new(),
        },
        finish_reason: Some(finish_reason),
        extra: Map::new(),
    });
    // Oracle reports no token usage on generateText; leave zeros rather than
    // fabricating counts.
    response.usage = Usage::default();
    Ok(response)
}

fn finish_reason(reason: Option<&str>) -> FinishReason {
    match reason {
        Some("MAX_TOKENS") | Some("LENGTH") => FinishReason::Length,
        Some("ERROR") => FinishReason::Error,
        Some("COMPLETE") | Some("STOP") | None => FinishReason::Stop,
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
        message: format!("oracle stream frame is not json: {err}"),
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

    if let Some(text) = event.get("text").and_then(Value::as_str) {
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
    if let Some(reason) = event.get("finishReason").and_then(Value::as_str) {
        state.finish_reason = Some(finish_reason(Some(reason)));
    }
    Ok(chunks)
}
