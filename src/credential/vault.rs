//! HashiCorp Vault strategy: Kubernetes auth with the pod service-account
//! token, then a read of the configured secret path. Lease duration drives
//! credential expiry.

use serde::Deserialize;
use serde_json::Value;
use time::{Duration, OffsetDateTime};

use super::{parse_secret_payload, Credential, StrategyContext};
use crate::{JanusError, Result};

const SERVICE_ACCOUNT_TOKEN: &str = "/var/run/secrets/kubernetes.io/serviceaccount/token";

pub struct VaultStrategy {
    address: String,
    role: String,
    path: String,
    auth_mount: String,
    field: Option<String>,
    namespace: Option<String>,
}

impl VaultStrategy {
    pub fn new(
        address: String,
        role: String,
        path: String,
        auth_mount: String,
        field: Option<String>,
        namespace: Option<String>,
    ) -> Self {
        Self {
            address: address.trim_end_matches('/').to_string(),
            role,
            path,
            auth_mount,
            field,
            namespace,
        }
    }

    /// Reachability probe against the unauthenticated health endpoint.
    pub async fn init(&self, cx: &StrategyContext) -> Result<()> {
        let url = format!("{}/v1/sys/health", self.address);
        let response = cx.http.get(&url).send().await.map_err(|err| {
            JanusError::ServiceUnavailable {
                message: format!("vault {} is unreachable: {err}", self.address),
            }
        })?;
        // Vault reports sealed/standby states with non-200 codes that still
        // prove reachability; only 5xx counts as down.
        if response.status().is_server_error() {
            return Err(JanusError::ServiceUnavailable {
                message: format!("vault health returned {}", response.status()),
            });
        }
        Ok(())
    }

    pub async fn fetch(&self, cx: &StrategyContext) -> Result<Credential> {
        let client_token = self.login(cx).await?;
        self.read_secret(cx, &client_token).await
    }

    async fn login(&self, cx: &StrategyContext) -> Result<String> {
        let jwt = tokio::fs::read_to_string(SERVICE_ACCOUNT_TOKEN)
            .await
            .map_err(|err| JanusError::ServiceUnavailable {
                message: format!("service-account token unavailable for vault login: {err}"),
            })?;

        let url = format!("{}/v1/auth/{}/login", self.address, self.auth_mount);
        let mut request = cx.http.post(&url).json(&serde_json::json!({
            "role": self.role,
            "jwt": jwt.trim(),
        }));
        if let Some(namespace) = &self.namespace {
            request = request.header("X-Vault-Namespace", namespace);
        }

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(JanusError::ServiceUnavailable {
                message: format!("vault kubernetes login failed ({status}): {body}"),
            });
        }

        #[derive(Deserialize)]
        struct LoginResponse {
            auth: LoginAuth,
        }
        #[derive(Deserialize)]
        struct LoginAuth {
            client_token: String,
        }
        let login: LoginResponse = response.json().await?;
        Ok(login.auth.client_token)
    }

    async fn read_secret(&self, cx: &StrategyContext, client_token: &str) -> Result<Credential> {
        let url = format!("{}/v1/{}", self.address, self.path.trim_start_matches('/'));
        let mut request = cx.http.get(&url).header("X-Vault-Token", client_token);
        if let Some(namespace) = &self.namespace {
            request = request.header("X-Vault-Namespace", namespace);
        }

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(JanusError::ServiceUnavailable {
                message: format!("vault read of {} failed ({status}): {body}", self.path),
            });
        }

        let body: Value = response.json().await?;
        let lease_secs = body.get("lease_duration").and_then(Value::as_u64);
        let expiry = lease_secs
            .filter(|secs| *secs > 0)
            .map(|secs| OffsetDateTime::now_utc() + Duration::seconds(secs as i64));

        let data = body
            .get("data")
            .ok_or_else(|| JanusError::ServiceUnavailable {
                message: format!("vault secret {} has no data", self.path),
            })?;
        // KV v2 nests the payload one level deeper.
        let data = data.get("data").unwrap_or(data);

        if let Some(field) = &self.field {
            let value = data
                .get(field)
                .and_then(Value::as_str)
                .ok_or_else(|| JanusError::ServiceUnavailable {
                    message: format!("vault secret {} has no field {field}", self.path),
                })?;
            return Ok(Credential::ApiKey {
                value: value.to_string(),
                expiry,
            });
        }

        Ok(parse_secret_payload(&data.to_string(), expiry))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sts_bundle_from_vault_data() {
        // Shape returned by the AWS secrets engine.
        let data = serde_json::json!({
            "access_key": "ASIAEXAMPLE",
            "secret_key": "wJalr",
            "security_token": "FwoG",
        });
        let credential = parse_secret_payload(&data.to_string(), None);
        match credential {
            Credential::Aws { access_key, session_token, .. } => {
                assert_eq!(access_key, "ASIAEXAMPLE");
                assert_eq!(session_token.as_deref(), Some("FwoG"));
            }
            other => panic!("expected aws credential, got {other:?}"),
        }
    }
}
