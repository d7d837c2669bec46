//! IBM watsonx.ai text-generation dialect. Chat history is flattened into a
//! single prompt; tools are not expressible in this dialect.

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
            "watsonx text generation does not support tools",
        ));
    }

    let mut warnings = Vec::new();
    let prompt = flatten_prompt(&request.messages, &mut warnings);

    let mut parameters = Map::new();
    parameters.insert("decoding_method".to_string(), json!("sample"));
    if let Some(max_tokens) = request.max_tokens {
        parameters.insert("max_new_tokens".to_string(), json!(max_tokens));
    }
    if let Some(temperature) = request.temperature {
        parameters.insert("temperature".to_string(), json!(temperature));
    }
    if let Some(top_p) = request.top_p {
        parameters.insert("top_p".to_string(), json!(top_p));
    }
    if let Some(stop) = &request.stop {
        parameters.insert("stop_sequences".to_string(), json!(stop));
    }
    if let Some(seed) = request.seed {
        parameters.insert("random_seed".to_string(), json!(seed));
    }

    // project_id is added by the provider client from the instance config.
    let body = json!({
        "model_id": request.model,
        "input": prompt,
        "parameters": Value::Object(parameters),
    });

    Ok(TranslatedRequest {
        body,
        warnings,
    })
}

/// Role-prefixed transcript, ending with an assistant cue.
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
    let result = native
        .pointer("/results/0")
        .ok_or_else(|| JanusError::Upstream {
            status: reqwest::StatusCode::BAD_GATEWAY,
            message: "watsonx response missing results".to_string(),
            detail: native.to_string(),
        })?;

    let text = result
        .get("generated_text")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    let finish_reason = stop_reason(result.get("stop_reason").and_then(Value::as_str));

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
    response.usage = Usage::new(
        result
            .get("input_token_count")
            .and_then(Value::as_u64)
            .unwrap_or(0),
        result
            .get("generated_token_count")
            .and_then(Value::as_u64)
            .unwrap_or(0),
    );
    Ok(response)
}

fn stop_reason(reason: Option<&str>) -> FinishReason {
    match reason {
        Some("max_tokens") | Some("token_limit") => FinishReason::Length,
        Some("error") => FinishReason::Error,
        Some("eos_token") | Some("stop_sequence") | Some("not_finished") | None => {
            FinishReason::Stop
        }
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
        message: format!("watsonx stream frame is not json: {err}"),
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

    if let Some(result) = event.pointer("/results/0") {
        if let Some(text) = result.get("generated_text").and_then(Value::as_str) {
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
        match result.get("stop_reason").and_then(Value::as_str) {
            Some("not_finished") | None => {}
            reason => state.finish_reason = Some(stop_reason(reason)),
        }
        if let Some(generated) = result.get("generated_token_count").and_then(Value::as_u64) {
            let prompt = result
                .get("input_token_count")
                .and_then(Value::as_u64)
                .unwrap_or_else(|| state.usage.as_ref().map(|u| u.prompt_tokens).unwrap_or(0));
            state.usage = Some(Usage::new(prompt, generated));
        }
    }
    Ok(chunks)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn flattens_roles_into_prompt() {
        let request = ChatCompletionRequest {
            model: "ibm/granite-13b-chat-v2".to_string(),
            messages: vec![
                ChatMessage::system("be kind"),
                ChatMessage::user("hello"),
                ChatMessage::assistant("hi!"),
                ChatMessage::user("bye"),
            ],
            temperature: None,
            top_p: None,
            max_tokens: Some(16),
            stop: None,
            seed: None,
            tools: None,
            tool_choice: None,
            stream: false,
        };
        let translated = request_from_openai(&request).unwrap();
        let input = translated.body["input"].as_str().unwrap();
        assert_eq!(
            input,
            "System: be kind\nUser: hello\nAssistant: hi!\nUser: bye\nAssistant:"
        );
        assert_eq!(translated.body["parameters"]["max_new_tokens"], 16);
    }

    #[test]
    fn tools_are_a_translation_failure() {
        let request = ChatCompletionRequest {
            model: "ibm/granite-13b-chat-v2".to_string(),
            messages: vec![ChatMessage::user("hi")],
            temperature: None,
            top_p: None,
            max_tokens: None,
            stop: None,
            seed: None,
            tools: Some(vec![]),
            tool_choice: None,
            stream: false,
        };
        let err = request_from_openai(&request).unwrap_err();
        assert!(matches!(err, JanusError::TranslationFailed { .. }));
    }

    #[test]
    fn response_maps_token_counts() {
        let native = json!({
            "results": [{
                "generated_text": "greetings",
                "generated_token_count": 3,
                "input_token_count": 11,
                "stop_reason": "eos_token",
            }]
        });
        let response = response_to_openai(&native, "ibm/granite-13b-chat-v2").unwrap();
        assert_eq!(response.choices[0].finish_reason, Some(FinishReason::Stop));
        assert_eq!(response.usage.prompt_tokens, 11);
        assert_eq!(response.usage.total_tokens, 14);
    }
}
