//! The per-request dispatch engine: resolve instance, gate mode, acquire
//! credentials, translate, invoke, translate back, emit telemetry.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use futures_util::stream::{self, BoxStream};
use futures_util::StreamExt;
use reqwest::Method;
use time::OffsetDateTime;

use crate::config::{Config, InstanceMode};
use crate::credential::{CredentialManager, StrategyContext};
use crate::metrics::{HealthState, InstanceMetrics, MetricsRegistry};
use crate::openai::{ChatCompletionChunk, ChatCompletionRequest, ChatCompletionResponse};
use crate::platform::PlatformCapabilities;
use crate::providers::{strip_inbound_headers, ProviderClient, ProviderRequest, ProviderResponse};
use crate::registry::{InstanceRegistry, PathMatch};
use crate::router::ModelRouter;
use crate::translate::{self, StreamTranslator};
use crate::{JanusError, Result};

pub type ChunkStream = BoxStream<'static, Result<ChatCompletionChunk>>;

/// A protocol-mode dispatch resolves to either a buffered response or a
/// stream of canonical chunks.
pub enum ProtocolReply {
    Json(ChatCompletionResponse),
    Stream(ChunkStream),
}

pub struct Dispatcher {
    pub registry: Arc<InstanceRegistry>,
    managers: HashMap<String, Arc<CredentialManager>>,
    clients: HashMap<String, Arc<ProviderClient>>,
    pub metrics: Arc<MetricsRegistry>,
    pub health: Arc<HealthState>,
    model_router: ModelRouter,
    stream_idle: Duration,
}

impl Dispatcher {
    pub fn new(config: &Config, platform: PlatformCapabilities) -> Result<Self> {
        let registry = Arc::new(InstanceRegistry::new(config)?);
        let cx = StrategyContext::new(platform);
        let request_timeout = Duration::from_secs(config.global.default_timeout_secs);
        let stream_idle = Duration::from_secs(config.global.stream_idle_secs);

        let mut managers = HashMap::new();
        let mut clients = HashMap::new();
        let mut metric_entries = Vec::new();
        for instance in registry.instances() {
            managers.insert(
                instance.name.clone(),
                Arc::new(CredentialManager::new(
                    instance.name.clone(),
                    &instance.config.authentication,
                    cx.clone(),
                )),
            );
            clients.insert(
                instance.name.clone(),
                Arc::new(ProviderClient::for_instance(instance, request_timeout)?),
            );
            metric_entries.push((instance.name.clone(), instance.config.metrics.labels.clone()));
        }

        Ok(Self {
            registry,
            managers,
            clients,
            metrics: Arc::new(MetricsRegistry::new(metric_entries)),
            health: Arc::new(HealthState::default()),
            model_router: ModelRouter::new(),
            stream_idle,
        })
    }

    /// Elects a credential strategy per instance. An instance whose election
    /// fails stays configured but unusable; its dispatches fail fast.
    pub async fn init_credentials(&self) {
        for (name, manager) in &self.managers {
            if let Err(err) = manager.init().await {
                tracing::warn!(instance = %name, error = %err, "instance has no usable credentials");
            }
        }
    }

    pub async fn strategy_info(&self) -> BTreeMap<String, (String, u64)> {
        let mut out = BTreeMap::new();
        for (name, manager) in &self.managers {
            if let Some(strategy) = manager.current_strategy().await {
                out.insert(name.clone(), (strategy.to_string(), manager.epoch()));
            }
        }
        out
    }

    /// True when at least one instance holds a usable credential.
    pub async fn any_instance_ready(&self) -> bool {
        for manager in self.managers.values() {
            if manager.current_strategy().await.is_some() {
                return true;
            }
        }
        false
    }

    fn manager(&self, name: &str) -> Result<&Arc<CredentialManager>> {
        self.managers
            .get(name)
            .ok_or_else(|| JanusError::internal(format!("no credential manager for {name}")))
    }

    fn client(&self, name: &str) -> Result<&Arc<ProviderClient>> {
        self.clients
            .get(name)
            .ok_or_else(|| JanusError::internal(format!("no provider client for {name}")))
    }

    fn instance_metrics(&self, name: &str) -> Option<Arc<InstanceMetrics>> {
        self.metrics.instance(name)
    }

    pub fn resolve(&self, path: &str) -> Result<PathMatch> {
        self.registry.lookup_by_path(path).ok_or_else(|| {
            JanusError::not_found(
                "instance_not_found",
                "no provider instance is configured for this path",
            )
        })
    }

    /// Transparent passthrough: strip the bound prefix, strip caller auth
    /// and hop-by-hop headers, sign, forward, and return the upstream reply
    /// verbatim whatever its status.
    pub async fn dispatch_transparent(
        &self,
        method: Method,
        path: &str,
        query: BTreeMap<String, String>,
        headers: &BTreeMap<String, String>,
        body: Bytes,
    ) -> Result<ProviderResponse> {
        let started = Instant::now();
        let matched = self.resolve(path)?;
        let instance = &matched.instance;

        if instance.config.mode != InstanceMode::Transparent {
            return Err(JanusError::InvalidMode {
                message: format!("instance {} requires protocol mode", instance.name),
            });
        }
        if !instance.allows_method(&matched.prefix, method.as_str()) {
            return Err(JanusError::MethodNotAllowed {
                message: format!("method {method} is not allowed on {}", matched.prefix),
            });
        }

        let credential = self.manager(&instance.name)?.get().await?;
        let request = ProviderRequest {
            method,
            path: matched.suffix.clone(),
            query,
            headers: strip_inbound_headers(headers),
            body,
        };
        let client = self.client(&instance.name)?;
        let result = client.invoke(instance, &credential, &request).await;

        if let Some(metrics) = self.instance_metrics(&instance.name) {
            let ok = result.as_ref().map(|r| r.status.is_success()).unwrap_or(false);
            metrics.record_request(started.elapsed().as_millis() as u64, ok);
        }
        match &result {
            Ok(response) if response.status.is_success() => self.health.record_success(),
            _ => self.health.record_error(),
        }
        result
    }

    /// Protocol-mode dispatch against an already-resolved instance.
    pub async fn dispatch_protocol(
        &self,
        instance_name: &str,
        request: ChatCompletionRequest,
    ) -> Result<ProtocolReply> {
        let started = Instant::now();
        let started_at = OffsetDateTime::now_utc().unix_timestamp();
        let instance = self.registry.require(instance_name)?;

        if instance.config.mode != InstanceMode::Protocol {
            return Err(JanusError::InvalidMode {
                message: format!("instance {} requires transparent mode", instance.name),
            });
        }
        let transformation = instance.config.transformation.as_ref().ok_or_else(|| {
            JanusError::internal(format!("protocol instance {} has no transformation", instance.name))
        })?;
        let request_to = transformation.request_to;
        let response_from = transformation.response_from;

        let credential = self.manager(&instance.name)?.get().await?;
        let client = self.client(&instance.name)?;

        let translated = translate::translate_request(request_to, &request)?;
        for warning in &translated.warnings {
            tracing::warn!(
                instance = %instance.name,
                feature = %warning.feature,
                details = %warning.details,
                "request translation warning"
            );
        }
        let mut body = translated.body;
        client.finalize_body(&mut body, request.stream);

        let (path, query) = client.chat_route(&request.model, request.stream)?;
        let mut provider_request = ProviderRequest::post_json(path, &body);
        provider_request.query = query;

        let response_id = translate::new_response_id();
        let outcome = if request.stream {
            let frames = client
                .invoke_stream(&instance, &credential, &provider_request)
                .await?;
            let translator =
                StreamTranslator::new(response_from, response_id, started_at, request.model.clone());
            Ok(ProtocolReply::Stream(self.translated_stream(
                frames,
                translator,
                instance.name.clone(),
            )))
        } else {
            let response = client
                .invoke(&instance, &credential, &provider_request)
                .await?
                .require_success()?;
            let native: serde_json::Value = serde_json::from_slice(&response.body)?;
            let reply = translate::translate_response(
                response_from,
                &native,
                &request.model,
                &response_id,
                started_at,
            )?;
            Ok(ProtocolReply::Json(reply))
        };

        if let Some(metrics) = self.instance_metrics(&instance.name) {
            metrics.record_request(started.elapsed().as_millis() as u64, outcome.is_ok());
        }
        match &outcome {
            Ok(_) => self.health.record_success(),
            Err(_) => self.health.record_error(),
        }
        outcome
    }

    /// Legacy `/v1/chat/completions`: the model name selects the instance.
    pub async fn dispatch_legacy_chat(
        &self,
        request: ChatCompletionRequest,
    ) -> Result<ProtocolReply> {
        if request.model.trim().is_empty() {
            return Err(JanusError::invalid_request("missing_model", "model is required"));
        }
        let instance = self.model_router.route(&self.registry, &request.model)?;
        self.dispatch_protocol(&instance.name, request).await
    }

    /// Wires native frames through the stream translator, enforcing the
    /// per-frame idle limit. Dropping the returned stream drops the upstream
    /// connection, which is how caller cancellation propagates.
    fn translated_stream(
        &self,
        frames: crate::providers::FrameStream,
        translator: StreamTranslator,
        instance_name: String,
    ) -> ChunkStream {
        struct StreamGuard {
            metrics: Option<Arc<InstanceMetrics>>,
            completed: bool,
        }
        impl Drop for StreamGuard {
            fn drop(&mut self) {
                if !self.completed {
                    if let Some(metrics) = &self.metrics {
                        metrics.record_cancelled();
                    }
                    tracing::debug!("stream cancelled before completion");
                }
            }
        }

        let guard = StreamGuard {
            metrics: self.instance_metrics(&instance_name),
            completed: false,
        };
        let idle = self.stream_idle;

        Box::pin(stream::unfold(
            (
                frames,
                translator,
                std::collections::VecDeque::<Result<ChatCompletionChunk>>::new(),
                guard,
                false,
            ),
            move |(mut frames, mut translator, mut pending, mut guard, mut done)| async move {
                loop {
                    if let Some(item) = pending.pop_front() {
                        return Some((item, (frames, translator, pending, guard, done)));
                    }
                    if done {
                        return None;
                    }
                    match tokio::time::timeout(idle, frames.next()).await {
                        Err(_) => {
                            done = true;
                            guard.completed = true;
                            pending.push_back(Err(JanusError::Timeout {
                                message: format!(
                                    "upstream stream idle for more than {}s",
                                    idle.as_secs()
                                ),
                            }));
                        }
                        Ok(Some(Ok(frame))) => match translator.on_frame(&frame) {
                            Ok(chunks) => pending.extend(chunks.into_iter().map(Ok)),
                            Err(err) => {
                                done = true;
                                guard.completed = true;
                                pending.push_back(Err(err));
                            }
                        },
                        Ok(Some(Err(err))) => {
                            done = true;
                            guard.completed = true;
                            pending.push_back(Err(err));
                        }
                        Ok(None) => {
                            done = true;
                            guard.completed = true;
                            if let Some(chunk) = translator.finish() {
                                pending.push_back(Ok(chunk));
                            }
                        }
                    }
                }
            },
        ))
    }

    /// Models advertised on `/v1/models`: the routing defaults plus every
    /// protocol instance, attributed to their provider kind.
    pub fn advertised_models(&self) -> Vec<(String, String)> {
        let mut out = Vec::new();
        for instance in self.registry.instances_by_mode(InstanceMode::Protocol) {
            out.push((instance.name.clone(), instance.config.kind.to_string()));
        }
        out.sort();
        out.dedup();
        out
    }
}
