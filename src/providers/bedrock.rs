//! AWS Bedrock runtime client: region-derived endpoint, Converse routes, and
//! the vnd.amazon.eventstream decoder for streaming responses.

use std::collections::{BTreeMap, HashMap, VecDeque};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use futures_util::stream;
use futures_util::StreamExt;
use serde_json::Value;

use super::FrameStream;
use crate::config::InstanceConfig;
use crate::{JanusError, Result};

pub struct BedrockClient {
    pub(crate) http: reqwest::Client,
    pub(crate) base_url: String,
}

impl BedrockClient {
    pub fn new(http: reqwest::Client, config: &InstanceConfig) -> Result<Self> {
        let base_url = match &config.endpoint {
            Some(endpoint) => endpoint.trim_end_matches('/').to_string(),
            None => {
                let region = config
                    .region
                    .as_deref()
                    .ok_or_else(|| JanusError::internal("bedrock instance has no region"))?;
                format!("https://bedrock-runtime.{region}.amazonaws.com")
            }
        };
        Ok(Self { http, base_url })
    }

    pub fn chat_route(
        &self,
        model: &str,
        stream: bool,
    ) -> Result<(String, BTreeMap<String, String>)> {
        let action = if stream { "converse-stream" } else { "converse" };
        Ok((format!("/model/{model}/{action}"), BTreeMap::new()))
    }
}

#[derive(Debug)]
struct EventStreamMessage {
    headers: HashMap<String, String>,
    payload: Vec<u8>,
}

/// Incremental binary-frame decoder for the AWS eventstream encoding:
/// 4-byte total length, 4-byte headers length, 4-byte prelude CRC, headers,
/// payload, 4-byte message CRC.
#[derive(Debug, Default)]
struct EventStreamDecoder {
    buffer: Vec<u8>,
}

impl EventStreamDecoder {
    fn push(&mut self, chunk: &[u8]) {
        self.buffer.extend_from_slice(chunk);
    }

    fn next_message(&mut self) -> Option<Result<EventStreamMessage>> {
        if self.buffer.len() < 12 {
            return None;
        }
        let total_len = u32::from_be_bytes(self.buffer[0..4].try_into().ok()?) as usize;
        if total_len < 16 {
            return Some(Err(JanusError::internal("eventstream total_len too small")));
        }
        if self.buffer.len() < total_len {
            return None;
        }
        let message = self.buffer.drain(0..total_len).collect::<Vec<u8>>();
        let headers_len = u32::from_be_bytes(message[4..8].try_into().ok()?) as usize;
        let headers_start = 12usize;
        let headers_end = headers_start.saturating_add(headers_len);
        if headers_end > message.len() {
            return Some(Err(JanusError::internal("eventstream invalid headers length")));
        }
        let payload_end = total_len.saturating_sub(4);
        if headers_end > payload_end {
            return Some(Err(JanusError::internal("eventstream invalid payload length")));
        }

        let headers = match parse_headers(&message[headers_start..headers_end]) {
            Ok(headers) => headers,
            Err(err) => return Some(Err(err)),
        };
        let payload = message[headers_end..payload_end].to_vec();
        Some(Ok(EventStreamMessage { headers, payload }))
    }
}

fn parse_headers(bytes: &[u8]) -> Result<HashMap<String, String>> {
    let mut out = HashMap::<String, String>::new();
    let mut idx = 0usize;
    while idx < bytes.len() {
        let name_len = *bytes
            .get(idx)
            .ok_or_else(|| JanusError::internal("eventstream header missing name length"))?
            as usize;
        idx += 1;
        if idx + name_len > bytes.len() {
            return Err(JanusError::internal("eventstream header name truncated"));
        }
        let name = std::str::from_utf8(&bytes[idx..idx + name_len])
            .map_err(|err| JanusError::internal(format!("eventstream bad header name: {err}")))?;
        idx += name_len;
        let value_type = *bytes
            .get(idx)
            .ok_or_else(|| JanusError::internal("eventstream header missing type"))?;
        idx += 1;
        let ensure = |idx: usize, needed: usize, label: &str| -> Result<()> {
            if idx + needed > bytes.len() {
                return Err(JanusError::internal(format!(
                    "eventstream header value truncated ({label})"
                )));
            }
            Ok(())
        };

        match value_type {
            0 | 1 => {}
            2 => {
                ensure(idx, 1, "byte")?;
                idx += 1;
            }
            3 => {
                ensure(idx, 2, "short")?;
                idx += 2;
            }
            4 => {
                ensure(idx, 4, "int")?;
                idx += 4;
            }
            5 => {
                ensure(idx, 8, "long")?;
                idx += 8;
            }
            6 | 7 => {
                ensure(idx, 2, "length")?;
                let len = u16::from_be_bytes([bytes[idx], bytes[idx + 1]]) as usize;
                idx += 2;
                ensure(idx, len, "bytes")?;
                if value_type == 7 {
                    let value = std::str::from_utf8(&bytes[idx..idx + len]).map_err(|err| {
                        JanusError::internal(format!("eventstream header value utf8 error: {err}"))
                    })?;
                    out.insert(name.to_string(), value.to_string());
                }
                idx += len;
            }
            8 => {
                ensure(idx, 8, "timestamp")?;
                idx += 8;
            }
            9 => {
                ensure(idx, 16, "uuid")?;
                idx += 16;
            }
            other => {
                return Err(JanusError::internal(format!(
                    "eventstream unsupported header type {other}"
                )));
            }
        }
    }
    Ok(out)
}

/// Decodes a streaming Bedrock response into JSON frames tagged with the
/// event type under `__type`, ready for the Converse stream translator.
pub(crate) fn decode_event_stream(response: reqwest::Response) -> FrameStream {
    Box::pin(stream::unfold(
        (
            response.bytes_stream(),
            EventStreamDecoder::default(),
            VecDeque::<Result<String>>::new(),
        ),
        |(mut bytes_stream, mut decoder, mut pending)| async move {
            loop {
                if let Some(item) = pending.pop_front() {
                    return Some((item, (bytes_stream, decoder, pending)));
                }
                match bytes_stream.next().await {
                    Some(Ok(chunk)) => {
                        decoder.push(&chunk);
                        while let Some(message) = decoder.next_message() {
                            match message.and_then(|message| frame_from_message(&message)) {
                                Ok(Some(frame)) => pending.push_back(Ok(frame)),
                                Ok(None) => {}
                                Err(err) => pending.push_back(Err(err)),
                            }
                        }
                    }
                    Some(Err(err)) => pending.push_back(Err(JanusError::Http(err))),
                    None => return None,
                }
            }
        },
    ))
}

fn frame_from_message(message: &EventStreamMessage) -> Result<Option<String>> {
    let message_type = message
        .headers
        .get(":message-type")
        .map(String::as_str)
        .unwrap_or("event");
    if message_type != "event" {
        let detail = String::from_utf8_lossy(&message.payload).into_owned();
        return Err(JanusError::Upstream {
            status: reqwest::StatusCode::BAD_GATEWAY,
            message: format!(
                "bedrock stream reported {}",
                message
                    .headers
                    .get(":exception-type")
                    .map(String::as_str)
                    .unwrap_or(message_type)
            ),
            detail,
        });
    }

    let mut payload: Value = serde_json::from_slice(&message.payload)?;

    // invoke-with-response-stream wraps the event in a base64 `bytes` field;
    // converse-stream carries the event JSON directly.
    if let Some(bytes) = payload.get("bytes").and_then(Value::as_str) {
        let decoded = BASE64
            .decode(bytes)
            .map_err(|err| JanusError::internal(format!("bedrock base64 decode failed: {err}")))?;
        payload = serde_json::from_slice(&decoded)?;
    }

    if let Some(event_type) = message.headers.get(":event-type") {
        if let Some(object) = payload.as_object_mut() {
            object.insert("__type".to_string(), Value::String(event_type.clone()));
        }
    }
    Ok(Some(payload.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode_message(headers: &[(&str, &str)], payload: &[u8]) -> Vec<u8> {
        let mut header_bytes = Vec::new();
        for (name, value) in headers {
            header_bytes.push(name.len() as u8);
            header_bytes.extend_from_slice(name.as_bytes());
            header_bytes.push(7u8);
            header_bytes.extend_from_slice(&(value.len() as u16).to_be_bytes());
            header_bytes.extend_from_slice(value.as_bytes());
        }
        let total_len = 12 + header_bytes.len() + payload.len() + 4;
        let mut out = Vec::with_capacity(total_len);
        out.extend_from_slice(&(total_len as u32).to_be_bytes());
        out.extend_from_slice(&(header_bytes.len() as u32).to_be_bytes());
        out.extend_from_slice(&[0u8; 4]);
        out.extend_from_slice(&header_bytes);
        out.extend_from_slice(payload);
        out.extend_from_slice(&[0u8; 4]);
        out
    }

    #[test]
    fn decoder_splits_messages_across_chunks() {
        let message = encode_message(
            &[(":message-type", "event"), (":event-type", "messageStart")],
            br#"{"role":"assistant"}"#,
        );
        let mut decoder = EventStreamDecoder::default();
        let (first, second) = message.split_at(7);
        decoder.push(first);
        assert!(decoder.next_message().is_none());
        decoder.push(second);

        let decoded = decoder.next_message().unwrap().unwrap();
        assert_eq!(decoded.headers[":event-type"], "messageStart");
        let frame = frame_from_message(&decoded).unwrap().unwrap();
        let value: Value = serde_json::from_str(&frame).unwrap();
        assert_eq!(value["__type"], "messageStart");
        assert_eq!(value["role"], "assistant");
    }

    #[test]
    fn exception_messages_become_upstream_errors() {
        let message = encode_message(
            &[(":message-type", "exception"), (":exception-type", "throttlingException")],
            br#"{"message":"slow down"}"#,
        );
        let mut decoder = EventStreamDecoder::default();
        decoder.push(&message);
        let decoded = decoder.next_message().unwrap().unwrap();
        let err = frame_from_message(&decoded).unwrap_err();
        assert!(err.to_string().contains("throttlingException"));
    }

    #[test]
    fn region_builds_runtime_endpoint() {
        let mut config = InstanceConfig::for_tests(crate::config::ProviderKind::Bedrock);
        config.region = Some("eu-central-1".to_string());
        let client = BedrockClient::new(reqwest::Client::new(), &config).unwrap();
        assert_eq!(client.base_url, "https://bedrock-runtime.eu-central-1.amazonaws.com");
        let (path, _) = client.chat_route("claude-3-sonnet", true).unwrap();
        assert_eq!(path, "/model/claude-3-sonnet/converse-stream");
    }
}
