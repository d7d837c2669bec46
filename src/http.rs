//! axum surface: transparent and protocol facades, legacy OpenAI routes, and
//! the operational endpoints.

use std::collections::BTreeMap;
use std::sync::Arc;

use axum::body::Body;
use axum::extract::{Path, RawQuery, State};
use axum::http::{HeaderMap, HeaderName, HeaderValue, Method as AxumMethod, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{any, get, post};
use axum::{Json, Router};
use bytes::Bytes;
use futures_util::StreamExt;
use reqwest::Method;
use time::OffsetDateTime;

use crate::dispatch::{Dispatcher, ProtocolReply};
use crate::openai::{ChatCompletionRequest, ModelEntry, ModelList};
use crate::JanusError;

#[derive(Clone)]
pub struct GatewayState {
    pub dispatcher: Arc<Dispatcher>,
}

pub fn router(state: GatewayState) -> Router {
    let mut app = Router::new()
        .route("/health", get(health))
        .route("/ready", get(ready))
        .route("/metrics", get(metrics))
        .route("/v1/chat/completions", post(legacy_chat))
        .route("/v1/models", get(list_models))
        .route("/v1/models/{id}", get(get_model));

    if state.dispatcher.registry.is_feature_enabled("transparent_mode") {
        app = app.route("/transparent/{*rest}", any(transparent));
    }
    if state.dispatcher.registry.is_feature_enabled("protocol_mode") {
        app = app.route("/openai/{*rest}", post(protocol).get(protocol_get));
    }

    app.fallback(not_found).with_state(state)
}

fn error_response(err: &JanusError) -> Response {
    let mut response = (err.status(), Json(err.to_body())).into_response();
    if let JanusError::RateLimited {
        retry_after: Some(secs),
        ..
    } = err
    {
        if let Ok(value) = HeaderValue::from_str(&secs.to_string()) {
            response.headers_mut().insert("retry-after", value);
        }
    }
    response
}

async fn not_found() -> Response {
    error_response(&JanusError::not_found(
        "instance_not_found",
        "no provider instance is configured for this path",
    ))
}

async fn health(State(state): State<GatewayState>) -> Response {
    if state.dispatcher.health.is_healthy() {
        Json(serde_json::json!({ "status": "healthy", "service": "ai-gateway" })).into_response()
    } else {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(serde_json::json!({ "status": "unhealthy", "service": "ai-gateway" })),
        )
            .into_response()
    }
}

async fn ready(State(state): State<GatewayState>) -> Response {
    if state.dispatcher.any_instance_ready().await {
        Json(serde_json::json!({ "status": "ready" })).into_response()
    } else {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(serde_json::json!({ "status": "not ready" })),
        )
            .into_response()
    }
}

async fn metrics(State(state): State<GatewayState>) -> Response {
    let strategy_info = state.dispatcher.strategy_info().await;
    let body = state.dispatcher.metrics.render(&strategy_info);
    (
        [("content-type", "text/plain; version=0.0.4")],
        body,
    )
        .into_response()
}

async fn transparent(
    State(state): State<GatewayState>,
    method: AxumMethod,
    Path(rest): Path<String>,
    RawQuery(raw_query): RawQuery,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let path = format!("/transparent/{rest}");
    let method = match Method::from_bytes(method.as_str().as_bytes()) {
        Ok(method) => method,
        Err(_) => {
            return error_response(&JanusError::MethodNotAllowed {
                message: format!("unsupported method {method}"),
            })
        }
    };
    let query = parse_query(raw_query.as_deref().unwrap_or(""));
    let inbound_headers = header_map_to_btree(&headers);

    match state
        .dispatcher
        .dispatch_transparent(method, &path, query, &inbound_headers, body)
        .await
    {
        Ok(upstream) => {
            // Verbatim passthrough: status, headers and body as the upstream
            // produced them, minus hop-by-hop headers.
            let mut response = Response::builder().status(upstream.status);
            if let Some(headers) = response.headers_mut() {
                for (name, value) in &upstream.headers {
                    let lowered = name.to_ascii_lowercase();
                    if matches!(
                        lowered.as_str(),
                        "connection" | "transfer-encoding" | "content-length" | "keep-alive"
                    ) {
                        continue;
                    }
                    if let (Ok(name), Ok(value)) = (
                        HeaderName::from_bytes(name.as_bytes()),
                        HeaderValue::from_str(value),
                    ) {
                        headers.insert(name, value);
                    }
                }
            }
            response
                .body(Body::from(upstream.body))
                .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
        }
        Err(err) => error_response(&err),
    }
}

async fn protocol(
    State(state): State<GatewayState>,
    Path(rest): Path<String>,
    body: Bytes,
) -> Response {
    let path = format!("/openai/{rest}");
    let matched = match state.dispatcher.resolve(&path) {
        Ok(matched) => matched,
        Err(err) => return error_response(&err),
    };
    if !matched.instance.allows_method(&matched.prefix, "POST") {
        return error_response(&JanusError::MethodNotAllowed {
            message: format!("method POST is not allowed on {}", matched.prefix),
        });
    }
    if matched.suffix != "/chat/completions" {
        return error_response(&JanusError::not_found(
            "unsupported_operation",
            format!("protocol openai does not serve {}", matched.suffix),
        ));
    }

    let request: ChatCompletionRequest = match serde_json::from_slice(&body) {
        Ok(request) => request,
        Err(err) => {
            return error_response(&JanusError::invalid_request(
                "invalid_json",
                format!("invalid request body: {err}"),
            ))
        }
    };

    match state
        .dispatcher
        .dispatch_protocol(&matched.instance.name, request)
        .await
    {
        Ok(reply) => protocol_reply_response(reply),
        Err(err) => error_response(&err),
    }
}

/// GET side of the protocol facade; currently only `models`.
async fn protocol_get(State(state): State<GatewayState>, Path(rest): Path<String>) -> Response {
    let path = format!("/openai/{rest}");
    let matched = match state.dispatcher.resolve(&path) {
        Ok(matched) => matched,
        Err(err) => return error_response(&err),
    };
    if !matched.instance.allows_method(&matched.prefix, "GET") {
        return error_response(&JanusError::MethodNotAllowed {
            message: format!("method GET is not allowed on {}", matched.prefix),
        });
    }
    match matched.suffix.as_str() {
        "/models" => {
            let created = OffsetDateTime::now_utc().unix_timestamp();
            Json(ModelList {
                object: "list".to_string(),
                data: vec![ModelEntry {
                    id: matched.instance.name.clone(),
                    object: "model".to_string(),
                    created,
                    owned_by: matched.instance.config.kind.to_string(),
                }],
            })
            .into_response()
        }
        other => error_response(&JanusError::not_found(
            "unsupported_operation",
            format!("protocol openai does not serve {other}"),
        )),
    }
}

async fn legacy_chat(State(state): State<GatewayState>, body: Bytes) -> Response {
    let request: ChatCompletionRequest = match serde_json::from_slice(&body) {
        Ok(request) => request,
        Err(err) => {
            return error_response(&JanusError::invalid_request(
                "invalid_json",
                format!("invalid request body: {err}"),
            ))
        }
    };
    match state.dispatcher.dispatch_legacy_chat(request).await {
        Ok(reply) => protocol_reply_response(reply),
        Err(err) => error_response(&err),
    }
}

fn protocol_reply_response(reply: ProtocolReply) -> Response {
    match reply {
        ProtocolReply::Json(response) => Json(response).into_response(),
        ProtocolReply::Stream(chunks) => {
            let events = chunks
                .map(|item| match item {
                    Ok(chunk) => {
                        let payload = serde_json::to_string(&chunk).unwrap_or_default();
                        Ok::<_, std::convert::Infallible>(Bytes::from(format!(
                            "data: {payload}\n\n"
                        )))
                    }
                    Err(err) => {
                        // Past the first byte the status is already out, so
                        // the failure becomes a terminal error event.
                        let payload = serde_json::to_string(&err.to_body()).unwrap_or_default();
                        Ok(Bytes::from(format!("data: {payload}\n\n")))
                    }
                })
                .chain(futures_util::stream::once(async {
                    Ok(Bytes::from_static(b"data: [DONE]\n\n"))
                }));
            Response::builder()
                .status(StatusCode::OK)
                .header("content-type", "text/event-stream")
                .header("cache-control", "no-cache")
                .body(Body::from_stream(events))
                .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
        }
    }
}

async fn list_models(State(state): State<GatewayState>) -> Response {
    Json(model_list(&state)).into_response()
}

async fn get_model(State(state): State<GatewayState>, Path(id): Path<String>) -> Response {
    match model_list(&state).data.into_iter().find(|entry| entry.id == id) {
        Some(entry) => Json(entry).into_response(),
        None => error_response(&JanusError::not_found(
            "model_not_found",
            format!("model not found: {id}"),
        )),
    }
}

fn model_list(state: &GatewayState) -> ModelList {
    let created = OffsetDateTime::now_utc().unix_timestamp();
    ModelList {
        object: "list".to_string(),
        data: state
            .dispatcher
            .advertised_models()
            .into_iter()
            .map(|(name, owned_by)| ModelEntry {
                id: name,
                object: "model".to_string(),
                created,
                owned_by,
            })
            .collect(),
    }
}

fn header_map_to_btree(headers: &HeaderMap) -> BTreeMap<String, String> {
    let mut out = BTreeMap::new();
    for (name, value) in headers {
        if let Ok(value) = value.to_str() {
            out.insert(name.as_str().to_string(), value.to_string());
        }
    }
    out
}

/// Minimal query-string parsing for the transparent passthrough; values are
/// percent-decoded and re-encoded on the outbound URL.
fn parse_query(raw: &str) -> BTreeMap<String, String> {
    let mut out = BTreeMap::new();
    for pair in raw.split('&').filter(|p| !p.is_empty()) {
        let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
        out.insert(percent_decode(key), percent_decode(value));
    }
    out
}

fn percent_decode(input: &str) -> String {
    let bytes = input.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut idx = 0;
    while idx < bytes.len() {
        match bytes[idx] {
            b'%' if idx + 2 < bytes.len() => {
                let hex = &input[idx + 1..idx + 3];
                match u8::from_str_radix(hex, 16) {
                    Ok(byte) => {
                        out.push(byte);
                        idx += 3;
                    }
                    Err(_) => {
                        out.push(b'%');
                        idx += 1;
                    }
                }
            }
            b'+' => {
                out.push(b' ');
                idx += 1;
            }
            byte => {
                out.push(byte);
                idx += 1;
            }
        }
    }
    String::from_utf8_lossy(&out).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn query_parsing_decodes() {
        let query = parse_query("api-version=2024-02-15-preview&q=a%20b+c&flag");
        assert_eq!(query["api-version"], "2024-02-15-preview");
        assert_eq!(query["q"], "a b c");
        assert_eq!(query["flag"], "");
    }
}
