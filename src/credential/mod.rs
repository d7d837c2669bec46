//! Credential acquisition: time-bounded credential values, the ordered
//! strategy variants that produce them, and the per-instance manager that
//! elects among strategies.

mod manager;
mod mounted;
mod stores;
mod vault;
mod workload;

pub use manager::CredentialManager;
pub use mounted::{KubernetesSecretStrategy, StaticStrategy};
pub use stores::{AwsSecretsManagerStrategy, AzureKeyVaultStrategy, GcpSecretManagerStrategy};
pub use vault::VaultStrategy;
pub use workload::WorkloadIdentityStrategy;

use std::fmt;
use std::time::Duration;

use time::OffsetDateTime;
use tokio::sync::Mutex;

use crate::config::StrategyConfig;
use crate::platform::PlatformCapabilities;
use crate::{JanusError, Result};

/// A credential is refreshed once `now + SKEW` reaches its expiry.
pub const FRESHNESS_SKEW: Duration = Duration::from_secs(5 * 60);

/// Bound on a single strategy acquisition attempt.
pub const ACQUIRE_TIMEOUT: Duration = Duration::from_secs(10);

/// How long a strategy stays out of election after a refresh failure.
pub const TAINT_COOLDOWN: Duration = Duration::from_secs(30);

/// Default expiry for secrets read from a store that advertises none.
pub const STORE_DEFAULT_TTL: Duration = Duration::from_secs(24 * 60 * 60);

#[derive(Clone, PartialEq, Eq)]
pub enum Credential {
    Aws {
        access_key: String,
        secret_key: String,
        session_token: Option<String>,
        expiry: Option<OffsetDateTime>,
    },
    AzureToken {
        token: String,
        expiry: Option<OffsetDateTime>,
    },
    GcpToken {
        token: String,
        expiry: Option<OffsetDateTime>,
    },
    ApiKey {
        value: String,
        expiry: Option<OffsetDateTime>,
    },
}

impl Credential {
    pub fn expiry(&self) -> Option<OffsetDateTime> {
        match self {
            Self::Aws { expiry, .. }
            | Self::AzureToken { expiry, .. }
            | Self::GcpToken { expiry, .. }
            | Self::ApiKey { expiry, .. } => *expiry,
        }
    }

    pub fn is_fresh(&self, now: OffsetDateTime) -> bool {
        match self.expiry() {
            Some(expiry) => now + FRESHNESS_SKEW < expiry,
            None => true,
        }
    }

    pub fn kind_name(&self) -> &'static str {
        match self {
            Self::Aws { .. } => "aws",
            Self::AzureToken { .. } => "azure_token",
            Self::GcpToken { .. } => "gcp_token",
            Self::ApiKey { .. } => "api_key",
        }
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("kind", &self.kind_name())
            .field("expiry", &self.expiry())
            .finish()
    }
}

/// Shared context handed to strategies: HTTP client, environment access,
/// and the startup platform probe.
#[derive(Clone)]
pub struct StrategyContext {
    pub http: reqwest::Client,
    pub platform: PlatformCapabilities,
    pub env: fn(&str) -> Option<String>,
}

impl StrategyContext {
    pub fn new(platform: PlatformCapabilities) -> Self {
        let http = reqwest::Client::builder()
            .timeout(ACQUIRE_TIMEOUT)
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self {
            http,
            platform,
            env: read_env,
        }
    }

    pub fn env(&self, name: &str) -> Option<String> {
        (self.env)(name)
    }
}

fn read_env(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

/// Closed set of strategy variants; config validation guarantees every
/// configured entry maps to exactly one of these.
pub enum StrategyImpl {
    WorkloadIdentity(WorkloadIdentityStrategy),
    Vault(VaultStrategy),
    AwsSecretsManager(AwsSecretsManagerStrategy),
    AzureKeyVault(AzureKeyVaultStrategy),
    GcpSecretManager(GcpSecretManagerStrategy),
    KubernetesSecret(KubernetesSecretStrategy),
    Static(StaticStrategy),
    #[cfg(test)]
    Probe(probe::ProbeStrategy),
}


pub struct CredentialStrategy {
    imp: StrategyImpl,
    /// Cached credential plus refresh collapse for this strategy.
    cache: Mutex<Option<Credential>>,
    tainted_until: Mutex<Option<tokio::time::Instant>>,
}

impl CredentialStrategy {
    pub fn from_config(config: &StrategyConfig) -> Self {
        let imp = match config.clone() {
            StrategyConfig::WorkloadIdentity { cloud, resource } => {
                StrategyImpl::WorkloadIdentity(WorkloadIdentityStrategy::new(cloud, resource))
            }
            StrategyConfig::Vault {
                address,
                role,
                path,
                auth_mount,
                field,
                namespace,
            } => StrategyImpl::Vault(VaultStrategy::new(
                address, role, path, auth_mount, field, namespace,
            )),
            StrategyConfig::AwsSecretsManager { secret_id, region } => {
                StrategyImpl::AwsSecretsManager(AwsSecretsManagerStrategy::new(secret_id, region))
            }
            StrategyConfig::AzureKeyVault { vault, name } => {
                StrategyImpl::AzureKeyVault(AzureKeyVaultStrategy::new(vault, name))
            }
            StrategyConfig::GcpSecretManager {
                project,
                secret,
                version,
            } => StrategyImpl::GcpSecretManager(GcpSecretManagerStrategy::new(
                project, secret, version,
            )),
            StrategyConfig::KubernetesSecret { path } => {
                StrategyImpl::KubernetesSecret(KubernetesSecretStrategy::new(path))
            }
            StrategyConfig::Static { value, env } => {
                StrategyImpl::Static(StaticStrategy::new(value, env))
            }
        };
        Self {
            imp,
            cache: Mutex::new(None),
            tainted_until: Mutex::new(None),
        }
    }

    #[cfg(test)]
    pub(crate) fn from_probe(probe: probe::ProbeStrategy) -> Self {
        Self {
            imp: StrategyImpl::Probe(probe),
            cache: Mutex::new(None),
            tainted_until: Mutex::new(None),
        }
    }

    pub fn kind(&self) -> &'static str {
        match &self.imp {
            StrategyImpl::WorkloadIdentity(_) => "workload_identity",
            StrategyImpl::Vault(_) => "vault",
            StrategyImpl::AwsSecretsManager(_) => "aws_secrets_manager",
            StrategyImpl::AzureKeyVault(_) => "azure_key_vault",
            StrategyImpl::GcpSecretManager(_) => "gcp_secret_manager",
            StrategyImpl::KubernetesSecret(_) => "kubernetes_secret",
            StrategyImpl::Static(_) => "static",
            #[cfg(test)]
            StrategyImpl::Probe(_) => "probe",
        }
    }

    /// Eligibility probe. A failure here makes the manager skip the strategy
    /// during election.
    pub async fn init(&self, cx: &StrategyContext) -> Result<()> {
        match &self.imp {
            StrategyImpl::WorkloadIdentity(s) => s.init(cx),
            StrategyImpl::Vault(s) => s.init(cx).await,
            StrategyImpl::AwsSecretsManager(s) => s.init(cx),
            StrategyImpl::AzureKeyVault(s) => s.init(cx),
            StrategyImpl::GcpSecretManager(s) => s.init(cx),
            StrategyImpl::KubernetesSecret(s) => s.init().await,
            StrategyImpl::Static(s) => s.init(cx),
            #[cfg(test)]
            StrategyImpl::Probe(s) => s.init(),
        }
    }

    /// Returns the cached credential when fresh, refreshing otherwise.
    pub async fn get(&self, cx: &StrategyContext) -> Result<Credential> {
        let now = OffsetDateTime::now_utc();
        {
            let cache = self.cache.lock().await;
            if let Some(credential) = cache.as_ref() {
                if credential.is_fresh(now) {
                    return Ok(credential.clone());
                }
            }
        }
        self.refresh(cx).await
    }

    /// Forces an acquisition. Held under the per-strategy mutex so that
    /// concurrent refreshers collapse onto one upstream call.
    pub async fn refresh(&self, cx: &StrategyContext) -> Result<Credential> {
        let mut cache = self.cache.lock().await;
        // A racer may have refreshed while this task waited on the lock.
        let now = OffsetDateTime::now_utc();
        if let Some(credential) = cache.as_ref() {
            if credential.is_fresh(now) {
                return Ok(credential.clone());
            }
        }

        let fetched = match tokio::time::timeout(ACQUIRE_TIMEOUT, self.fetch(cx)).await {
            Ok(fetched) => fetched,
            Err(_) => Err(JanusError::Timeout {
                message: format!("credential strategy {} timed out", self.kind()),
            }),
        };

        match fetched {
            Ok(credential) => {
                *cache = Some(credential.clone());
                Ok(credential)
            }
            Err(err) => {
                *cache = None;
                self.taint().await;
                Err(err)
            }
        }
    }

    async fn fetch(&self, cx: &StrategyContext) -> Result<Credential> {
        match &self.imp {
            StrategyImpl::WorkloadIdentity(s) => s.fetch(cx).await,
            StrategyImpl::Vault(s) => s.fetch(cx).await,
            StrategyImpl::AwsSecretsManager(s) => s.fetch(cx).await,
            StrategyImpl::AzureKeyVault(s) => s.fetch(cx).await,
            StrategyImpl::GcpSecretManager(s) => s.fetch(cx).await,
            StrategyImpl::KubernetesSecret(s) => s.fetch().await,
            StrategyImpl::Static(s) => s.fetch(cx),
            #[cfg(test)]
            StrategyImpl::Probe(s) => s.fetch(),
        }
    }

    pub async fn is_expired(&self) -> bool {
        let cache = self.cache.lock().await;
        match cache.as_ref() {
            Some(credential) => !credential.is_fresh(OffsetDateTime::now_utc()),
            None => true,
        }
    }

    async fn taint(&self) {
        let mut tainted = self.tainted_until.lock().await;
        *tainted = Some(tokio::time::Instant::now() + TAINT_COOLDOWN);
    }

    pub async fn is_tainted(&self) -> bool {
        let mut tainted = self.tainted_until.lock().await;
        match *tainted {
            Some(until) if tokio::time::Instant::now() < until => true,
            Some(_) => {
                *tainted = None;
                false
            }
            None => false,
        }
    }
}

/// Interprets a secret payload: JSON bundles become typed credentials,
/// anything else is an opaque API key.
pub(crate) fn parse_secret_payload(text: &str, expiry: Option<OffsetDateTime>) -> Credential {
    let trimmed = text.trim();
    if let Ok(value) = serde_json::from_str::<serde_json::Value>(trimmed) {
        if let Some(object) = value.as_object() {
            let field = |names: &[&str]| -> Option<String> {
                names.iter().find_map(|name| {
                    object
                        .get(*name)
                        .and_then(|v| v.as_str())
                        .map(str::to_string)
                })
            };

            let access_key = field(&["access_key", "access_key_id", "AccessKeyId", "AWS_ACCESS_KEY_ID"]);
            let secret_key = field(&[
                "secret_key",
                "secret_access_key",
                "SecretAccessKey",
                "AWS_SECRET_ACCESS_KEY",
            ]);
            if let (Some(access_key), Some(secret_key)) = (access_key, secret_key) {
                return Credential::Aws {
                    access_key,
                    secret_key,
                    session_token: field(&[
                        "session_token",
                        "security_token",
                        "SessionToken",
                        "AWS_SESSION_TOKEN",
                    ]),
                    expiry,
                };
            }

            if let Some(value) = field(&["api_key", "apiKey", "key", "token", "value"]) {
                return Credential::ApiKey { value, expiry };
            }

            // Single-field secret of any name.
            if object.len() == 1 {
                if let Some(value) = object.values().next().and_then(|v| v.as_str()) {
                    return Credential::ApiKey {
                        value: value.to_string(),
                        expiry,
                    };
                }
            }
        }
    }
    Credential::ApiKey {
        value: trimmed.to_string(),
        expiry,
    }
}
