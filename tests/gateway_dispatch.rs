use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use axum::body::{to_bytes, Body};
use axum::extract::State;
use axum::http::{Request, StatusCode};
use axum::response::IntoResponse;
use axum::routing::{any, post};
use axum::Router;
use futures_util::StreamExt;
use serde_json::{json, Value};
use tower::util::ServiceExt;

use janus_llm::config::Config;
use janus_llm::dispatch::{Dispatcher, ProtocolReply};
use janus_llm::http::{router, GatewayState};
use janus_llm::openai::ChatCompletionRequest;
use janus_llm::platform::PlatformCapabilities;

#[derive(Clone, Default)]
struct Captured {
    requests: Arc<Mutex<Vec<(String, BTreeMap<String, String>, Vec<u8>)>>>,
}

impl Captured {
    fn push(&self, path: String, headers: BTreeMap<String, String>, body: Vec<u8>) {
        self.requests.lock().unwrap().push((path, headers, body));
    }

    fn last(&self) -> (String, BTreeMap<String, String>, Vec<u8>) {
        self.requests.lock().unwrap().last().cloned().unwrap()
    }
}

async fn spawn_upstream(app: Router) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{addr}")
}

async fn openai_like_upstream(captured: Captured, reply: Value) -> String {
    async fn handler(
        State((captured, reply)): State<(Captured, Value)>,
        request: Request<Body>,
    ) -> impl IntoResponse {
        let (parts, body) = request.into_parts();
        let headers = parts
            .headers
            .iter()
            .map(|(name, value)| {
                (
                    name.as_str().to_string(),
                    value.to_str().unwrap_or_default().to_string(),
                )
            })
            .collect();
        let body = to_bytes(body, 1024 * 1024).await.unwrap_or_default();
        captured.push(parts.uri.path().to_string(), headers, body.to_vec());
        axum::Json(reply.clone())
    }

    let app = Router::new()
        .route("/{*rest}", any(handler))
        .with_state((captured, reply));
    spawn_upstream(app).await
}

fn write_temp(name: &str, contents: &str) -> String {
    let path = std::env::temp_dir().join(format!("janus-test-{name}-{}", std::process::id()));
    std::fs::write(&path, contents).unwrap();
    path.to_string_lossy().into_owned()
}

fn gateway_for(config_yaml: &str) -> GatewayState {
    let config = Config::from_yaml(config_yaml, |name| std::env::var(name).ok()).unwrap();
    let dispatcher =
        Arc::new(Dispatcher::new(&config, PlatformCapabilities::default()).unwrap());
    GatewayState { dispatcher }
}

#[tokio::test]
async fn unknown_path_yields_canonical_not_found() {
    let state = gateway_for(
        r#"
instances:
  openai_direct:
    type: openai
    mode: transparent
    authentication:
      strategies:
        - type: static
          value: sk-test
    endpoints:
      - path: /transparent/openai
        methods: [POST]
features:
  transparent_mode:
    enabled: true
"#,
    );
    state.dispatcher.init_credentials().await;
    let app = router(state);

    let response = app
        .oneshot(
            Request::builder()
                .method("GET")
                .uri("/does-not-exist")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    let body = to_bytes(response.into_body(), 64 * 1024).await.unwrap();
    let parsed: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(parsed["error"]["type"], "not_found");
    assert_eq!(parsed["error"]["code"], "instance_not_found");
    assert!(parsed["error"]["message"].is_string());
}

#[tokio::test]
async fn transparent_passthrough_preserves_bytes_and_signs() {
    let captured = Captured::default();
    let upstream_reply = json!({
        "id": "chatcmpl-upstream-original",
        "object": "chat.completion",
        "created": 1700000001,
        "model": "gpt-3.5-turbo",
        "choices": [{
            "index": 0,
            "message": { "role": "assistant", "content": "hi", "refusal": null },
            "finish_reason": "stop",
        }],
        "usage": { "prompt_tokens": 1, "completion_tokens": 1, "total_tokens": 2 },
        "refusal": null,
        "service_tier": "default",
        "system_fingerprint": "fp_fake123",
    });
    let base_url = openai_like_upstream(captured.clone(), upstream_reply.clone()).await;

    let state = gateway_for(&format!(
        r#"
instances:
  openai_direct:
    type: openai
    mode: transparent
    base_url: {base_url}
    authentication:
      strategies:
        - type: static
          value: sk-test
    endpoints:
      - path: /transparent/openai
        methods: [POST]
features:
  transparent_mode:
    enabled: true
"#
    ));
    state.dispatcher.init_credentials().await;
    let app = router(state);

    let caller_body =
        json!({"model": "gpt-3.5-turbo", "messages": [{"role": "user", "content": "hi"}], "max_tokens": 5});
    let response = app
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/transparent/openai/chat/completions")
                .header("content-type", "application/json")
                .header("authorization", "Bearer caller-token")
                .header("x-api-key", "caller-key")
                .header("x-request-id", "req-1")
                .body(Body::from(caller_body.to_string()))
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let body = to_bytes(response.into_body(), 64 * 1024).await.unwrap();
    let parsed: Value = serde_json::from_slice(&body).unwrap();
    // Upstream-specific fields and the upstream id survive untouched.
    assert_eq!(parsed, upstream_reply);
    assert_eq!(parsed["id"], "chatcmpl-upstream-original");
    assert_eq!(parsed["service_tier"], "default");
    assert_eq!(parsed["system_fingerprint"], "fp_fake123");

    let (path, headers, seen_body) = captured.last();
    assert_eq!(path, "/chat/completions");
    // The gateway's own credential replaced the caller's.
    assert_eq!(headers["authorization"], "Bearer sk-test");
    assert!(!headers.contains_key("x-api-key"));
    assert_eq!(headers["x-request-id"], "req-1");
    let seen: Value = serde_json::from_slice(&seen_body).unwrap();
    assert_eq!(seen, caller_body);
}

#[tokio::test]
async fn protocol_bedrock_translates_both_ways() {
    let captured = Captured::default();
    let converse_reply = json!({
        "output": {
            "message": {
                "role": "assistant",
                "content": [{ "text": "hello from converse" }],
            }
        },
        "stopReason": "end_turn",
        "usage": { "inputTokens": 12, "outputTokens": 8, "totalTokens": 20 },
    });
    let endpoint = openai_like_upstream(captured.clone(), converse_reply).await;

    let state = gateway_for(&format!(
        r#"
instances:
  bedrock_us1_openai:
    type: bedrock
    mode: protocol
    protocol: openai
    region: us-east-1
    endpoint: {endpoint}
    authentication:
      strategies:
        - type: static
          value: '{{"access_key":"AKIDEXAMPLE","secret_key":"wJalr"}}'
    transformation:
      request_from: openai
      request_to: bedrock_converse
      response_from: bedrock_converse
      response_to: openai
    endpoints:
      - path: /openai/bedrock_us1_openai
        methods: [POST]
routing:
  defaults:
    bedrock: bedrock_us1_openai
features:
  protocol_mode:
    enabled: true
"#
    ));
    state.dispatcher.init_credentials().await;
    let app = router(state);

    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/openai/bedrock_us1_openai/chat/completions")
                .header("content-type", "application/json")
                .body(Body::from(
                    json!({
                        "model": "claude-3-sonnet",
                        "messages": [{"role": "user", "content": "hello"}],
                        "max_tokens": 20,
                    })
                    .to_string(),
                ))
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let body = to_bytes(response.into_body(), 64 * 1024).await.unwrap();
    let parsed: Value = serde_json::from_slice(&body).unwrap();

    let id = parsed["id"].as_str().unwrap();
    assert!(id.starts_with("chatcmpl-"));
    assert_eq!(id.len(), "chatcmpl-".len() + 8);
    assert!(id["chatcmpl-".len()..].chars().all(|c| c.is_ascii_hexdigit()));
    assert_eq!(parsed["model"], "claude-3-sonnet");
    let finish = parsed["choices"][0]["finish_reason"].as_str().unwrap();
    assert!(finish == "stop" || finish == "length");
    assert_eq!(
        parsed["usage"]["total_tokens"].as_u64().unwrap(),
        parsed["usage"]["prompt_tokens"].as_u64().unwrap()
            + parsed["usage"]["completion_tokens"].as_u64().unwrap()
    );
    assert_eq!(parsed["choices"][0]["message"]["content"], "hello from converse");

    // The upstream call went to the converse action, SigV4-signed.
    let (path, headers, native_body) = captured.last();
    assert_eq!(path, "/model/claude-3-sonnet/converse");
    assert!(headers["authorization"].starts_with("AWS4-HMAC-SHA256"));
    assert!(headers.contains_key("x-amz-date"));
    let native: Value = serde_json::from_slice(&native_body).unwrap();
    assert_eq!(native["messages"][0]["content"][0]["text"], "hello");
    assert_eq!(native["inferenceConfig"]["maxTokens"], 20);

    // The legacy route reaches the same instance via the model router.
    let legacy = app
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/v1/chat/completions")
                .header("content-type", "application/json")
                .body(Body::from(
                    json!({
                        "model": "claude-3-sonnet",
                        "messages": [{"role": "user", "content": "hello again"}],
                    })
                    .to_string(),
                ))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(legacy.status(), StatusCode::OK);
}

#[tokio::test]
async fn credential_fallback_elects_mounted_secret() {
    let captured = Captured::default();
    let base_url = openai_like_upstream(captured.clone(), json!({"ok": true})).await;
    let secret_path = write_temp("fallback-secret", "sk-from-file\n");

    let state = gateway_for(&format!(
        r#"
instances:
  openai_fallback:
    type: openai
    mode: transparent
    base_url: {base_url}
    authentication:
      strategies:
        - type: workload_identity
          cloud: aws
        - type: vault
          address: http://127.0.0.1:9
          role: gateway
          path: aws/sts/bedrock
        - type: kubernetes_secret
          path: {secret_path}
    endpoints:
      - path: /transparent/openai
        methods: [POST]
features:
  transparent_mode:
    enabled: true
"#
    ));
    state.dispatcher.init_credentials().await;
    let app = router(state);

    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/transparent/openai/chat/completions")
                .header("content-type", "application/json")
                .body(Body::from("{}"))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let (_, headers, _) = captured.last();
    assert_eq!(headers["authorization"], "Bearer sk-from-file");

    let metrics = app
        .oneshot(Request::builder().uri("/metrics").body(Body::empty()).unwrap())
        .await
        .unwrap();
    let body = to_bytes(metrics.into_body(), 256 * 1024).await.unwrap();
    let text = String::from_utf8_lossy(&body);
    assert!(text.contains("strategy=\"kubernetes_secret\""), "metrics: {text}");
}

#[tokio::test]
async fn unusable_instance_fails_fast_with_503() {
    let state = gateway_for(
        r#"
instances:
  broken:
    type: openai
    mode: transparent
    authentication:
      strategies:
        - type: kubernetes_secret
          path: /does/not/exist
    endpoints:
      - path: /transparent/openai
        methods: [POST]
features:
  transparent_mode:
    enabled: true
"#,
    );
    state.dispatcher.init_credentials().await;
    let app = router(state);

    let response = app
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/transparent/openai/x")
                .body(Body::from("{}"))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    let body = to_bytes(response.into_body(), 64 * 1024).await.unwrap();
    let parsed: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(parsed["error"]["type"], "service_unavailable");
    assert!(parsed["error"]["message"]
        .as_str()
        .unwrap()
        .contains("kubernetes_secret"));
}

#[tokio::test]
async fn mode_and_method_gates() {
    let state = gateway_for(
        r#"
instances:
  transparent_under_protocol_path:
    type: openai
    mode: transparent
    authentication:
      strategies:
        - type: static
          value: sk-test
    endpoints:
      - path: /openai/not_protocol
        methods: [POST]
  only_post:
    type: openai
    mode: transparent
    authentication:
      strategies:
        - type: static
          value: sk-test
    endpoints:
      - path: /transparent/openai
        methods: [POST]
features:
  transparent_mode:
    enabled: true
  protocol_mode:
    enabled: true
"#,
    );
    state.dispatcher.init_credentials().await;
    let app = router(state);

    // Protocol endpoint family over a transparent instance.
    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/openai/not_protocol/chat/completions")
                .header("content-type", "application/json")
                .body(Body::from(
                    json!({"model": "gpt-4", "messages": []}).to_string(),
                ))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body = to_bytes(response.into_body(), 64 * 1024).await.unwrap();
    let parsed: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(parsed["error"]["type"], "invalid_mode");

    // Method not allowed on a transparent prefix.
    let response = app
        .oneshot(
            Request::builder()
                .method("DELETE")
                .uri("/transparent/openai/files/abc")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);
}

#[tokio::test]
async fn streaming_translates_frames_and_terminates() {
    // Anthropic-shaped SSE upstream.
    async fn stream_handler() -> impl IntoResponse {
        let events = [
            json!({"type": "message_start", "message": {"usage": {"input_tokens": 2}}}),
            json!({"type": "content_block_delta", "index": 0, "delta": {"type": "text_delta", "text": "he"}}),
            json!({"type": "content_block_delta", "index": 0, "delta": {"type": "text_delta", "text": "y"}}),
            json!({"type": "message_delta", "delta": {"stop_reason": "end_turn"}, "usage": {"output_tokens": 2}}),
            json!({"type": "message_stop"}),
        ];
        let body = events
            .iter()
            .map(|event| format!("data: {event}\n\n"))
            .collect::<String>();
        (
            [("content-type", "text/event-stream")],
            body,
        )
    }
    let app = Router::new().route("/messages", post(stream_handler));
    let base_url = spawn_upstream(app).await;

    let state = gateway_for(&format!(
        r#"
instances:
  anthropic_openai:
    type: anthropic
    mode: protocol
    protocol: openai
    base_url: {base_url}
    authentication:
      strategies:
        - type: static
          value: sk-ant-test
    transformation:
      request_from: openai
      request_to: anthropic_messages
      response_from: anthropic_messages
      response_to: openai
    endpoints:
      - path: /openai/anthropic_openai
        methods: [POST]
features:
  protocol_mode:
    enabled: true
"#
    ));
    state.dispatcher.init_credentials().await;
    let app = router(state);

    let response = app
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/openai/anthropic_openai/chat/completions")
                .header("content-type", "application/json")
                .body(Body::from(
                    json!({
                        "model": "claude-sonnet-4",
                        "messages": [{"role": "user", "content": "hi"}],
                        "max_tokens": 16,
                        "stream": true,
                    })
                    .to_string(),
                ))
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers()["content-type"].to_str().unwrap(),
        "text/event-stream"
    );
    let body = to_bytes(response.into_body(), 256 * 1024).await.unwrap();
    let text = String::from_utf8_lossy(&body);

    let frames: Vec<&str> = text
        .split("\n\n")
        .filter_map(|frame| frame.strip_prefix("data: "))
        .collect();
    assert_eq!(*frames.last().unwrap(), "[DONE]");

    let chunks: Vec<Value> = frames[..frames.len() - 1]
        .iter()
        .map(|frame| serde_json::from_str(frame).unwrap())
        .collect();
    assert_eq!(chunks[0]["choices"][0]["delta"]["role"], "assistant");
    let content: String = chunks
        .iter()
        .filter_map(|chunk| chunk["choices"][0]["delta"]["content"].as_str())
        .collect();
    assert_eq!(content, "hey");
    let terminal = chunks.last().unwrap();
    assert_eq!(terminal["choices"][0]["finish_reason"], "stop");
    // Every chunk carries the same canonical id.
    let ids: std::collections::BTreeSet<&str> = chunks
        .iter()
        .map(|chunk| chunk["id"].as_str().unwrap())
        .collect();
    assert_eq!(ids.len(), 1);
    assert!(ids.iter().next().unwrap().starts_with("chatcmpl-"));
}

#[tokio::test]
async fn dropped_stream_records_cancellation() {
    // Upstream emits two frames then stalls far beyond the test's patience.
    async fn slow_handler() -> impl IntoResponse {
        let stream = futures_util::stream::unfold(0u32, |count| async move {
            match count {
                0 => Some((
                    Ok::<_, std::convert::Infallible>(
                        "data: {\"type\":\"message_start\",\"message\":{}}\n\n".to_string(),
                    ),
                    1,
                )),
                1 => Some((
                    Ok(
                        "data: {\"type\":\"content_block_delta\",\"index\":0,\"delta\":{\"type\":\"text_delta\",\"text\":\"a\"}}\n\n"
                            .to_string(),
                    ),
                    2,
                )),
                _ => {
                    tokio::time::sleep(std::time::Duration::from_secs(600)).await;
                    None
                }
            }
        });
        (
            [("content-type", "text/event-stream")],
            Body::from_stream(stream),
        )
    }
    let upstream = Router::new().route("/messages", post(slow_handler));
    let base_url = spawn_upstream(upstream).await;

    let state = gateway_for(&format!(
        r#"
instances:
  anthropic_stream:
    type: anthropic
    mode: protocol
    protocol: openai
    base_url: {base_url}
    authentication:
      strategies:
        - type: static
          value: sk-ant-test
    transformation:
      request_from: openai
      request_to: anthropic_messages
      response_from: anthropic_messages
      response_to: openai
    endpoints:
      - path: /openai/anthropic_stream
        methods: [POST]
features:
  protocol_mode:
    enabled: true
"#
    ));
    state.dispatcher.init_credentials().await;
    let dispatcher = state.dispatcher.clone();

    let request: ChatCompletionRequest = serde_json::from_value(json!({
        "model": "claude-sonnet-4",
        "messages": [{"role": "user", "content": "hi"}],
        "stream": true,
    }))
    .unwrap();

    let reply = dispatcher
        .dispatch_protocol("anthropic_stream", request)
        .await
        .unwrap();
    let ProtocolReply::Stream(mut chunks) = reply else {
        panic!("expected a stream reply");
    };
    // Read two frames, then hang up.
    let first = chunks.next().await.unwrap().unwrap();
    assert_eq!(first.choices[0].delta.role, Some(janus_llm::openai::Role::Assistant));
    let second = chunks.next().await.unwrap().unwrap();
    assert_eq!(second.choices[0].delta.content.as_deref(), Some("a"));
    drop(chunks);

    let strategy_info = dispatcher.strategy_info().await;
    let rendered = dispatcher.metrics.render(&strategy_info);
    assert!(
        rendered.contains("ai_gateway_cancelled_total{instance=\"anthropic_stream\"} 1"),
        "metrics: {rendered}"
    );
}

#[tokio::test]
async fn models_listing_serves_protocol_instances() {
    let state = gateway_for(
        r#"
instances:
  bedrock_us1_openai:
    type: bedrock
    mode: protocol
    protocol: openai
    region: us-east-1
    authentication:
      strategies:
        - type: static
          value: '{"access_key":"a","secret_key":"b"}'
    transformation:
      request_from: openai
      request_to: bedrock_converse
      response_from: bedrock_converse
      response_to: openai
    endpoints:
      - path: /openai/bedrock_us1_openai
        methods: [POST]
"#,
    );
    state.dispatcher.init_credentials().await;
    let app = router(state);

    let response = app
        .clone()
        .oneshot(Request::builder().uri("/v1/models").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = to_bytes(response.into_body(), 64 * 1024).await.unwrap();
    let parsed: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(parsed["object"], "list");
    assert_eq!(parsed["data"][0]["id"], "bedrock_us1_openai");
    assert_eq!(parsed["data"][0]["owned_by"], "bedrock");

    let missing = app
        .oneshot(
            Request::builder()
                .uri("/v1/models/nope")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(missing.status(), StatusCode::NOT_FOUND);
}
