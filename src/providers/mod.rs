//! Per-provider HTTP clients: URL composition, signed issuance, retries,
//! stream decoding, and normalized error mapping.

mod anthropic;
mod azure;
mod bedrock;
mod openai;
mod oracle;
mod vertex;
mod watsonx;

pub use anthropic::AnthropicClient;
pub use azure::AzureClient;
pub use bedrock::BedrockClient;
pub use openai::OpenAiClient;
pub use oracle::OracleClient;
pub use vertex::VertexClient;
pub use watsonx::WatsonxClient;

use std::collections::BTreeMap;
use std::time::Duration;

use bytes::Bytes;
use futures_util::stream::BoxStream;
use reqwest::{Method, StatusCode};
use serde_json::Value;
use time::OffsetDateTime;

use crate::auth::apply_auth;
use crate::config::ProviderKind;
use crate::credential::Credential;
use crate::registry::Instance;
use crate::utils::backoff::{
    parse_retry_after, rate_limit_delay, retry_delay, MAX_ATTEMPTS, MAX_RATE_LIMIT_RETRIES,
};
use crate::{JanusError, Result};

/// Frames already decoded from the provider's native stream framing (SSE or
/// AWS eventstream), one JSON payload per item.
pub type FrameStream = BoxStream<'static, Result<String>>;

#[derive(Debug, Clone)]
pub struct ProviderRequest {
    pub method: Method,
    /// Path relative to the provider base URL, starting with `/`.
    pub path: String,
    pub query: BTreeMap<String, String>,
    pub headers: BTreeMap<String, String>,
    pub body: Bytes,
}

impl ProviderRequest {
    pub fn post_json(path: impl Into<String>, body: &Value) -> Self {
        let mut headers = BTreeMap::new();
        headers.insert("content-type".to_string(), "application/json".to_string());
        Self {
            method: Method::POST,
            path: path.into(),
            query: BTreeMap::new(),
            headers,
            body: Bytes::from(serde_json::to_vec(body).unwrap_or_default()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ProviderResponse {
    pub status: StatusCode,
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
}

impl ProviderResponse {
    /// Protocol-mode success gate: maps non-2xx upstream replies onto the
    /// error taxonomy, preserving the native body as detail.
    pub fn require_success(self) -> Result<Self> {
        if self.status.is_success() {
            return Ok(self);
        }
        Err(self.into_error())
    }

    fn into_error(self) -> JanusError {
        let detail = String::from_utf8_lossy(&self.body).into_owned();
        match self.status {
            StatusCode::NOT_FOUND => JanusError::not_found(
                "upstream_not_found",
                "upstream reported the named resource missing",
            ),
            StatusCode::TOO_MANY_REQUESTS => JanusError::RateLimited {
                message: "upstream rejected with rate limit".to_string(),
                retry_after: self
                    .header("retry-after")
                    .and_then(|value| parse_retry_after(&value)),
                detail,
            },
            StatusCode::BAD_REQUEST => JanusError::invalid_request(
                "upstream_rejected",
                format!("upstream rejected the request: {detail}"),
            ),
            status => JanusError::Upstream {
                status,
                message: format!("upstream returned {status}"),
                detail,
            },
        }
    }

    pub fn header(&self, name: &str) -> Option<String> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.clone())
    }
}

/// One client per provider kind; a closed set, like the strategy variants.
pub enum ProviderClient {
    Bedrock(BedrockClient),
    Openai(OpenAiClient),
    Anthropic(AnthropicClient),
    Azure(AzureClient),
    Vertex(VertexClient),
    Watsonx(WatsonxClient),
    Oracle(OracleClient),
}

impl ProviderClient {
    pub fn for_instance(instance: &Instance, timeout: Duration) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(JanusError::Http)?;
        let config = &instance.config;
        Ok(match config.kind {
            ProviderKind::Bedrock => Self::Bedrock(BedrockClient::new(http, config)?),
            ProviderKind::Openai => Self::Openai(OpenAiClient::new(http, config)),
            ProviderKind::Anthropic => Self::Anthropic(AnthropicClient::new(http, config)),
            ProviderKind::Azure => Self::Azure(AzureClient::new(http, config)?),
            ProviderKind::Vertex => Self::Vertex(VertexClient::new(http, config)?),
            ProviderKind::Ibm => Self::Watsonx(WatsonxClient::new(http, config)?),
            ProviderKind::Oracle => Self::Oracle(OracleClient::new(http, config)?),
        })
    }

    pub fn kind(&self) -> ProviderKind {
        match self {
            Self::Bedrock(_) => ProviderKind::Bedrock,
            Self::Openai(_) => ProviderKind::Openai,
            Self::Anthropic(_) => ProviderKind::Anthropic,
            Self::Azure(_) => ProviderKind::Azure,
            Self::Vertex(_) => ProviderKind::Vertex,
            Self::Watsonx(_) => ProviderKind::Ibm,
            Self::Oracle(_) => ProviderKind::Oracle,
        }
    }

    fn http(&self) -> &reqwest::Client {
        match self {
            Self::Bedrock(c) => &c.http,
            Self::Openai(c) => &c.http,
            Self::Anthropic(c) => &c.http,
            Self::Azure(c) => &c.http,
            Self::Vertex(c) => &c.http,
            Self::Watsonx(c) => &c.http,
            Self::Oracle(c) => &c.http,
        }
    }

    fn base_url(&self) -> &str {
        match self {
            Self::Bedrock(c) => &c.base_url,
            Self::Openai(c) => &c.base_url,
            Self::Anthropic(c) => &c.base_url,
            Self::Azure(c) => &c.base_url,
            Self::Vertex(c) => &c.base_url,
            Self::Watsonx(c) => &c.base_url,
            Self::Oracle(c) => &c.base_url,
        }
    }

    /// Where a protocol-mode chat request goes for this provider, given the
    /// caller's model. Returns path plus query parameters.
    pub fn chat_route(
        &self,
        model: &str,
        stream: bool,
    ) -> Result<(String, BTreeMap<String, String>)> {
        match self {
            Self::Bedrock(c) => c.chat_route(model, stream),
            Self::Openai(c) => c.chat_route(stream),
            Self::Anthropic(c) => c.chat_route(stream),
            Self::Azure(c) => c.chat_route(model, stream),
            Self::Vertex(c) => c.chat_route(model, stream),
            Self::Watsonx(c) => c.chat_route(stream),
            Self::Oracle(c) => c.chat_route(stream),
        }
    }

    /// Provider-specific body finalization (project ids, compartments,
    /// stream flags) before issuance.
    pub fn finalize_body(&self, body: &mut Value, stream: bool) {
        match self {
            Self::Watsonx(c) => c.finalize_body(body),
            Self::Oracle(c) => c.finalize_body(body, stream),
            _ => {}
        }
    }

    fn build_url(&self, request: &ProviderRequest) -> Result<String> {
        let base = self.base_url().trim_end_matches('/');
        let mut url = reqwest::Url::parse(&format!("{base}{}", request.path))
            .map_err(|err| JanusError::internal(format!("invalid upstream url: {err}")))?;
        if !request.query.is_empty() {
            let mut pairs = url.query_pairs_mut();
            for (key, value) in &request.query {
                pairs.append_pair(key, value);
            }
        }
        Ok(url.to_string())
    }

    /// Issues the request with the provider's authentication, retrying
    /// transport failures, 5xx (except 501) and 429 per policy. Returns the
    /// upstream response whatever its status.
    pub async fn invoke(
        &self,
        instance: &Instance,
        credential: &Credential,
        request: &ProviderRequest,
    ) -> Result<ProviderResponse> {
        let url = self.build_url(request)?;
        let mut rate_limit_retries = 0u32;
        let mut attempt = 0u32;

        loop {
            attempt += 1;
            match self.send(instance, credential, request, &url).await {
                Ok(response) => {
                    let status = response.status;
                    if status == StatusCode::TOO_MANY_REQUESTS
                        && rate_limit_retries < MAX_RATE_LIMIT_RETRIES
                    {
                        rate_limit_retries += 1;
                        let retry_after = response
                            .header("retry-after")
                            .and_then(|value| parse_retry_after(&value));
                        tokio::time::sleep(rate_limit_delay(rate_limit_retries, retry_after)).await;
                        continue;
                    }
                    if status.is_server_error()
                        && status != StatusCode::NOT_IMPLEMENTED
                        && attempt < MAX_ATTEMPTS
                    {
                        tokio::time::sleep(retry_delay(attempt)).await;
                        continue;
                    }
                    return Ok(response);
                }
                Err(err) => {
                    // DNS, refused connections and TLS failures surface as
                    // connect errors; timeouts are not retried.
                    let retryable =
                        matches!(&err, JanusError::Http(http) if http.is_connect() && !http.is_timeout());
                    if retryable && attempt < MAX_ATTEMPTS {
                        tokio::time::sleep(retry_delay(attempt)).await;
                        continue;
                    }
                    return Err(err);
                }
            }
        }
    }

    async fn send(
        &self,
        instance: &Instance,
        credential: &Credential,
        request: &ProviderRequest,
        url: &str,
    ) -> Result<ProviderResponse> {
        let response = self
            .issue(instance, credential, request, url, false)
            .await?;

        let status = response.status();
        let headers = response
            .headers()
            .iter()
            .map(|(name, value)| {
                (
                    name.as_str().to_string(),
                    String::from_utf8_lossy(value.as_bytes()).into_owned(),
                )
            })
            .collect();
        let body = response.bytes().await?;
        Ok(ProviderResponse {
            status,
            headers,
            body,
        })
    }

    /// Streaming issuance: establishes the response, then hands back the
    /// provider's decoded frame stream. Establishment failures map onto the
    /// taxonomy; once frames flow, nothing is retried.
    pub async fn invoke_stream(
        &self,
        instance: &Instance,
        credential: &Credential,
        request: &ProviderRequest,
    ) -> Result<FrameStream> {
        let url = self.build_url(request)?;
        let response = self.issue(instance, credential, request, &url, true).await?;

        let status = response.status();
        if !status.is_success() {
            let headers = response
                .headers()
                .iter()
                .map(|(name, value)| {
                    (
                        name.as_str().to_string(),
                        String::from_utf8_lossy(value.as_bytes()).into_owned(),
                    )
                })
                .collect();
            let body = response.bytes().await.unwrap_or_default();
            return Err(ProviderResponse {
                status,
                headers,
                body,
            }
            .into_error());
        }

        Ok(match self {
            Self::Bedrock(_) => bedrock::decode_event_stream(response),
            _ => crate::utils::sse::sse_data_stream_from_response(response),
        })
    }

    async fn issue(
        &self,
        instance: &Instance,
        credential: &Credential,
        request: &ProviderRequest,
        url: &str,
        streaming: bool,
    ) -> Result<reqwest::Response> {
        let mut headers = request.headers.clone();
        apply_auth(
            self.kind(),
            &instance.config,
            credential,
            request.method.as_str(),
            url,
            &mut headers,
            &request.body,
            OffsetDateTime::now_utc(),
        )?;

        let mut builder = self
            .http()
            .request(request.method.clone(), url)
            .body(request.body.clone());
        for (name, value) in &headers {
            builder = builder.header(name, value);
        }
        if streaming {
            // Streams run unbounded; the dispatcher enforces per-frame
            // idle limits instead.
            builder = builder.timeout(Duration::from_secs(24 * 60 * 60));
            if !matches!(self, Self::Bedrock(_)) {
                builder = builder.header("accept", "text/event-stream");
            }
        }
        builder.send().await.map_err(JanusError::Http)
    }
}

/// Strips hop-by-hop headers plus the caller's own authentication before a
/// transparent forward.
pub fn strip_inbound_headers(headers: &BTreeMap<String, String>) -> BTreeMap<String, String> {
    const HOP_BY_HOP: &[&str] = &[
        "connection",
        "keep-alive",
        "proxy-authenticate",
        "proxy-authorization",
        "te",
        "trailer",
        "transfer-encoding",
        "upgrade",
        "host",
        "content-length",
    ];
    const CALLER_AUTH: &[&str] = &["authorization", "x-api-key", "api-key", "x-auth-token"];

    headers
        .iter()
        .filter(|(name, _)| {
            let lowered = name.to_ascii_lowercase();
            !HOP_BY_HOP.contains(&lowered.as_str()) && !CALLER_AUTH.contains(&lowered.as_str())
        })
        .map(|(name, value)| (name.clone(), value.clone()))
        .collect()
}
