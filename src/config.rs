//! Instance configuration: a YAML document with environment-variable
//! expansion, parsed once at startup and validated exhaustively before the
//! registry is built.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::{JanusError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    Bedrock,
    Azure,
    Openai,
    Anthropic,
    Vertex,
    Ibm,
    Oracle,
}

impl ProviderKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Bedrock => "bedrock",
            Self::Azure => "azure",
            Self::Openai => "openai",
            Self::Anthropic => "anthropic",
            Self::Vertex => "vertex",
            Self::Ibm => "ibm",
            Self::Oracle => "oracle",
        }
    }
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceMode {
    Transparent,
    Protocol,
}

impl fmt::Display for InstanceMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Transparent => "transparent",
            Self::Protocol => "protocol",
        })
    }
}

/// Wire dialects a translation pair can name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Dialect {
    Openai,
    BedrockConverse,
    AnthropicMessages,
    Gemini,
    AzureOpenai,
    Watsonx,
    OracleGenai,
}

impl Dialect {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Openai => "openai",
            Self::BedrockConverse => "bedrock_converse",
            Self::AnthropicMessages => "anthropic_messages",
            Self::Gemini => "gemini",
            Self::AzureOpenai => "azure_openai",
            Self::Watsonx => "watsonx",
            Self::OracleGenai => "oracle_genai",
        }
    }

    /// The native dialect a provider kind speaks, used to check that a
    /// configured translation pair is actually implemented.
    pub fn native_for(kind: ProviderKind) -> Dialect {
        match kind {
            ProviderKind::Bedrock => Dialect::BedrockConverse,
            ProviderKind::Azure => Dialect::AzureOpenai,
            ProviderKind::Openai => Dialect::Openai,
            ProviderKind::Anthropic => Dialect::AnthropicMessages,
            ProviderKind::Vertex => Dialect::Gemini,
            ProviderKind::Ibm => Dialect::Watsonx,
            ProviderKind::Oracle => Dialect::OracleGenai,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub global: GlobalConfig,
    #[serde(default)]
    pub instances: BTreeMap<String, InstanceConfig>,
    #[serde(default)]
    pub routing: RoutingConfig,
    #[serde(default)]
    pub features: BTreeMap<String, FeatureConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GlobalConfig {
    #[serde(default)]
    pub metrics: GlobalMetricsConfig,
    /// Request deadline for non-streaming dispatches, in seconds.
    #[serde(default = "default_timeout_secs")]
    pub default_timeout_secs: u64,
    /// Per-frame idle limit for streaming dispatches, in seconds.
    #[serde(default = "default_stream_idle_secs")]
    pub stream_idle_secs: u64,
}

// A missing `global` section must still get the serde field defaults.
impl Default for GlobalConfig {
    fn default() -> Self {
        Self {
            metrics: GlobalMetricsConfig::default(),
            default_timeout_secs: default_timeout_secs(),
            stream_idle_secs: default_stream_idle_secs(),
        }
    }
}

fn default_timeout_secs() -> u64 {
    120
}

fn default_stream_idle_secs() -> u64 {
    60
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct GlobalMetricsConfig {
    #[serde(default)]
    pub enabled: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceConfig {
    #[serde(rename = "type")]
    pub kind: ProviderKind,
    pub mode: InstanceMode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub protocol: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub region: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compartment_id: Option<String>,
    /// Azure model → deployment name substitution.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub deployments: BTreeMap<String, String>,
    pub authentication: AuthenticationConfig,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transformation: Option<TransformationConfig>,
    pub endpoints: Vec<EndpointConfig>,
    #[serde(default)]
    pub metrics: MetricsConfig,
}

#[derive(Clone, Serialize, Deserialize)]
pub struct AuthenticationConfig {
    pub strategies: Vec<StrategyConfig>,
}

impl fmt::Debug for AuthenticationConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Strategy configs can hold literal secrets.
        f.debug_struct("AuthenticationConfig")
            .field("strategies", &self.strategies.len())
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CloudFamily {
    Aws,
    Azure,
    Gcp,
    Oci,
    Ibm,
}

impl fmt::Display for CloudFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Aws => "aws",
            Self::Azure => "azure",
            Self::Gcp => "gcp",
            Self::Oci => "oci",
            Self::Ibm => "ibm",
        })
    }
}

#[derive(Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StrategyConfig {
    WorkloadIdentity {
        cloud: CloudFamily,
        /// Azure: target resource scope; GCP: unused; AWS: unused.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        resource: Option<String>,
    },
    Vault {
        address: String,
        role: String,
        path: String,
        #[serde(default = "default_vault_auth_mount")]
        auth_mount: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        field: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        namespace: Option<String>,
    },
    AwsSecretsManager {
        secret_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        region: Option<String>,
    },
    AzureKeyVault {
        vault: String,
        name: String,
    },
    GcpSecretManager {
        project: String,
        secret: String,
        #[serde(default = "default_secret_version")]
        version: String,
    },
    /// Mounted secret file, e.g. injected by a CSI driver.
    KubernetesSecret {
        path: String,
    },
    Static {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        value: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        env: Option<String>,
    },
}

fn default_vault_auth_mount() -> String {
    "kubernetes".to_string()
}

fn default_secret_version() -> String {
    "latest".to_string()
}

impl StrategyConfig {
    pub fn kind_name(&self) -> &'static str {
        match self {
            Self::WorkloadIdentity { .. } => "workload_identity",
            Self::Vault { .. } => "vault",
            Self::AwsSecretsManager { .. } => "aws_secrets_manager",
            Self::AzureKeyVault { .. } => "azure_key_vault",
            Self::GcpSecretManager { .. } => "gcp_secret_manager",
            Self::KubernetesSecret { .. } => "kubernetes_secret",
            Self::Static { .. } => "static",
        }
    }
}

// Strategy parameters can hold literal secrets; only the kind is loggable.
impl fmt::Debug for StrategyConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "StrategyConfig({})", self.kind_name())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransformationConfig {
    pub request_from: Dialect,
    pub request_to: Dialect,
    pub response_from: Dialect,
    pub response_to: Dialect,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EndpointConfig {
    pub path: String,
    pub methods: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct MetricsConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct RoutingConfig {
    /// Default instance per provider kind, used by the legacy `/v1` routes.
    #[serde(default)]
    pub defaults: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct FeatureConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// Expands `${NAME}` and `${NAME:-default}` references against `lookup`.
/// Unresolved references without a default are collected and reported.
pub fn expand_env(input: &str, lookup: impl Fn(&str) -> Option<String>) -> Result<String> {
    let mut out = String::with_capacity(input.len());
    let mut unresolved = Vec::<String>::new();
    let mut rest = input;

    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        let tail = &rest[start + 2..];
        let Some(end) = tail.find('}') else {
            return Err(JanusError::invalid_request(
                "config_parse_error",
                format!("unterminated ${{ reference near offset {start}"),
            ));
        };
        let reference = &tail[..end];
        let (name, default) = match reference.split_once(":-") {
            Some((name, default)) => (name, Some(default)),
            None => (reference, None),
        };
        match lookup(name) {
            Some(value) => out.push_str(&value),
            None => match default {
                Some(default) => out.push_str(default),
                None => unresolved.push(name.to_string()),
            },
        }
        rest = &tail[end + 1..];
    }
    out.push_str(rest);

    if unresolved.is_empty() {
        Ok(out)
    } else {
        Err(JanusError::invalid_request(
            "config_env_unresolved",
            format!("unresolved environment references: {}", unresolved.join(", ")),
        ))
    }
}

impl Config {
    /// Parses a YAML document after environment expansion. Unknown top-level
    /// keys are warned about and ignored.
    pub fn from_yaml(raw: &str, lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let expanded = expand_env(raw, lookup)?;

        let doc: serde_yaml::Value = serde_yaml::from_str(&expanded).map_err(|err| {
            JanusError::invalid_request("config_parse_error", format!("invalid yaml: {err}"))
        })?;
        if let serde_yaml::Value::Mapping(map) = &doc {
            for key in map.keys() {
                if let serde_yaml::Value::String(key) = key {
                    if !matches!(key.as_str(), "global" | "instances" | "routing" | "features") {
                        tracing::warn!(key = %key, "ignoring unknown top-level config key");
                    }
                }
            }
        }

        let config: Config = serde_yaml::from_value(doc).map_err(|err| {
            JanusError::invalid_request("config_parse_error", format!("invalid config: {err}"))
        })?;
        config.validate()?;
        Ok(config)
    }

    pub async fn load(path: &str) -> Result<Self> {
        let raw = tokio::fs::read_to_string(path).await?;
        Self::from_yaml(&raw, |name| std::env::var(name).ok())
    }

    pub fn is_feature_enabled(&self, name: &str) -> bool {
        self.features.get(name).map(|f| f.enabled).unwrap_or(false)
    }

    /// Enforces the instance invariants. Every violation is reported, not
    /// just the first.
    pub fn validate(&self) -> Result<()> {
        let mut violations = Vec::<String>::new();
        let mut prefix_owners = BTreeMap::<&str, &str>::new();

        for (name, instance) in &self.instances {
            match instance.mode {
                InstanceMode::Protocol => {
                    if instance.transformation.is_none() {
                        violations
                            .push(format!("instance {name}: protocol mode requires a transformation"));
                    }
                    if instance.protocol.is_none() {
                        violations
                            .push(format!("instance {name}: protocol mode requires a protocol tag"));
                    }
                }
                InstanceMode::Transparent => {
                    if instance.transformation.is_some() {
                        violations
                            .push(format!("instance {name}: transparent mode forbids a transformation"));
                    }
                }
            }

            if let Some(transformation) = &instance.transformation {
                let native = Dialect::native_for(instance.kind);
                if transformation.request_from != Dialect::Openai
                    || transformation.response_to != Dialect::Openai
                {
                    violations.push(format!(
                        "instance {name}: caller-facing dialect must be openai, got {} -> {}",
                        transformation.request_from.as_str(),
                        transformation.response_to.as_str()
                    ));
                }
                if transformation.request_to != native || transformation.response_from != native {
                    violations.push(format!(
                        "instance {name}: translation pair {} -> {} is not implemented for provider {} (native dialect {})",
                        transformation.request_to.as_str(),
                        transformation.response_from.as_str(),
                        instance.kind,
                        native.as_str()
                    ));
                }
            }

            if instance.authentication.strategies.is_empty() {
                violations.push(format!("instance {name}: authentication.strategies is empty"));
            }
            for strategy in &instance.authentication.strategies {
                if let StrategyConfig::Static { value: None, env: None } = strategy {
                    violations.push(format!(
                        "instance {name}: static strategy needs either value or env"
                    ));
                }
            }

            if instance.endpoints.is_empty() {
                violations.push(format!("instance {name}: endpoints is empty"));
            }
            for endpoint in &instance.endpoints {
                if !endpoint.path.starts_with('/') {
                    violations.push(format!(
                        "instance {name}: endpoint path {:?} must start with '/'",
                        endpoint.path
                    ));
                }
                if endpoint.methods.is_empty() {
                    violations.push(format!(
                        "instance {name}: endpoint {} allows no methods",
                        endpoint.path
                    ));
                }
                if let Some(owner) = prefix_owners.insert(endpoint.path.as_str(), name.as_str()) {
                    violations.push(format!(
                        "endpoint path {} is bound by both {owner} and {name}",
                        endpoint.path
                    ));
                }
            }
        }

        for (kind, target) in &self.routing.defaults {
            if !self.instances.contains_key(target) {
                violations.push(format!(
                    "routing.defaults.{kind} refers to unknown instance {target}"
                ));
            }
        }

        if violations.is_empty() {
            Ok(())
        } else {
            Err(JanusError::invalid_request(
                "config_invalid",
                violations.join("; "),
            ))
        }
    }
}

#[cfg(test)]
impl InstanceConfig {
    /// Minimal valid instance for unit tests.
    pub(crate) fn for_tests(kind: ProviderKind) -> Self {
        Self {
            kind,
            mode: InstanceMode::Transparent,
            protocol: None,
            description: None,
            region: Some("us-east-1".to_string()),
            endpoint: None,
            base_url: None,
            project_id: None,
            location: None,
            api_version: None,
            compartment_id: None,
            deployments: BTreeMap::new(),
            authentication: AuthenticationConfig {
                strategies: vec![StrategyConfig::Static {
                    value: Some("test-secret".to_string()),
                    env: None,
                }],
            },
            transformation: None,
            endpoints: Vec::new(),
            metrics: MetricsConfig::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
global:
  metrics:
    enabled: true
instances:
  bedrock_us1_openai:
    type: bedrock
    mode: protocol
    protocol: openai
    region: ${AWS_REGION:-us-east-1}
    authentication:
      strategies:
        - type: workload_identity
          cloud: aws
        - type: kubernetes_secret
          path: /var/run/secrets/bedrock/creds
    transformation:
      request_from: openai
      request_to: bedrock_converse
      response_from: bedrock_converse
      response_to: openai
    endpoints:
      - path: /openai/bedrock_us1_openai
        methods: [POST]
    metrics:
      enabled: true
      labels:
        region: us-east-1
  openai_direct:
    type: openai
    mode: transparent
    base_url: https://api.openai.com/v1
    authentication:
      strategies:
        - type: static
          env: OPENAI_API_KEY
    endpoints:
      - path: /transparent/openai
        methods: [POST, GET]
routing:
  defaults:
    bedrock: bedrock_us1_openai
features:
  protocol_mode:
    enabled: true
  transparent_mode:
    enabled: true
"#;

    #[test]
    fn parses_sample() {
        let config = Config::from_yaml(SAMPLE, |_| None).unwrap();
        assert_eq!(config.instances.len(), 2);
        let bedrock = &config.instances["bedrock_us1_openai"];
        assert_eq!(bedrock.kind, ProviderKind::Bedrock);
        assert_eq!(bedrock.mode, InstanceMode::Protocol);
        assert_eq!(bedrock.region.as_deref(), Some("us-east-1"));
        assert!(config.is_feature_enabled("protocol_mode"));
        assert!(!config.is_feature_enabled("rag_documents"));
    }

    #[test]
    fn expands_env_with_defaults() {
        let out = expand_env("region: ${R:-eu-west-1}, key: ${K}", |name| {
            (name == "K").then(|| "sk-test".to_string())
        })
        .unwrap();
        assert_eq!(out, "region: eu-west-1, key: sk-test");
    }

    #[test]
    fn unresolved_env_fails() {
        let err = expand_env("key: ${MISSING}", |_| None).unwrap_err();
        assert!(err.to_string().contains("MISSING"));
    }

    #[test]
    fn reports_every_violation() {
        let raw = r#"
instances:
  broken_a:
    type: bedrock
    mode: protocol
    authentication:
      strategies: []
    endpoints: []
  broken_b:
    type: openai
    mode: transparent
    authentication:
      strategies:
        - type: static
          value: sk-x
    transformation:
      request_from: openai
      request_to: openai
      response_from: openai
      response_to: openai
    endpoints:
      - path: /transparent/openai
        methods: [POST]
  broken_c:
    type: anthropic
    mode: transparent
    authentication:
      strategies:
        - type: static
          value: sk-y
    endpoints:
      - path: /transparent/openai
        methods: [POST]
"#;
        let err = Config::from_yaml(raw, |_| None).unwrap_err();
        let text = err.to_string();
        assert!(text.contains("broken_a: protocol mode requires a transformation"));
        assert!(text.contains("broken_a: authentication.strategies is empty"));
        assert!(text.contains("broken_a: endpoints is empty"));
        assert!(text.contains("broken_b: transparent mode forbids a transformation"));
        assert!(text.contains("bound by both broken_b and broken_c"));
    }

    #[test]
    fn rejects_mismatched_translation_pair() {
        let raw = r#"
instances:
  wrong_pair:
    type: bedrock
    mode: protocol
    protocol: openai
    authentication:
      strategies:
        - type: static
          value: sk-x
    transformation:
      request_from: openai
      request_to: gemini
      response_from: gemini
      response_to: openai
    endpoints:
      - path: /openai/wrong_pair
        methods: [POST]
"#;
        let err = Config::from_yaml(raw, |_| None).unwrap_err();
        assert!(err.to_string().contains("not implemented for provider bedrock"));
    }
}
