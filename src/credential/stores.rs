//! Cloud secret-store strategies. Each reads one named secret; JSON payloads
//! become typed credentials, anything else is an opaque key. Stores advertise
//! no lease, so expiry defaults to 24 hours.

use std::collections::BTreeMap;

use serde::Deserialize;
use serde_json::Value;
use time::OffsetDateTime;

use super::{parse_secret_payload, Credential, StrategyContext, STORE_DEFAULT_TTL};
use crate::auth::sigv4::{sign_sigv4, SigV4Timestamp};
use crate::{JanusError, Result};

fn store_expiry() -> Option<OffsetDateTime> {
    Some(OffsetDateTime::now_utc() + STORE_DEFAULT_TTL)
}

/// AWS Secrets Manager. The GetSecretValue call itself is signed with the
/// ambient AWS environment credentials.
pub struct AwsSecretsManagerStrategy {
    secret_id: String,
    region: Option<String>,
}

impl AwsSecretsManagerStrategy {
    pub fn new(secret_id: String, region: Option<String>) -> Self {
        Self { secret_id, region }
    }

    pub fn init(&self, cx: &StrategyContext) -> Result<()> {
        if cx.env("AWS_ACCESS_KEY_ID").is_none() || cx.env("AWS_SECRET_ACCESS_KEY").is_none() {
            return Err(JanusError::ServiceUnavailable {
                message: "aws secrets manager needs ambient AWS credentials".to_string(),
            });
        }
        Ok(())
    }

    pub async fn fetch(&self, cx: &StrategyContext) -> Result<Credential> {
        let region = self
            .region
            .clone()
            .or_else(|| cx.env("AWS_REGION"))
            .unwrap_or_else(|| "us-east-1".to_string());
        let bootstrap = Credential::Aws {
            access_key: cx.env("AWS_ACCESS_KEY_ID").unwrap_or_default(),
            secret_key: cx.env("AWS_SECRET_ACCESS_KEY").unwrap_or_default(),
            session_token: cx.env("AWS_SESSION_TOKEN"),
            expiry: None,
        };

        let url = format!("https://secretsmanager.{region}.amazonaws.com/");
        let body = serde_json::to_vec(&serde_json::json!({ "SecretId": self.secret_id }))?;
        let mut headers = BTreeMap::new();
        headers.insert(
            "content-type".to_string(),
            "application/x-amz-json-1.1".to_string(),
        );
        headers.insert(
            "x-amz-target".to_string(),
            "secretsmanager.GetSecretValue".to_string(),
        );
        let timestamp = SigV4Timestamp::from_datetime(OffsetDateTime::now_utc())?;
        let signed = sign_sigv4(
            &bootstrap,
            &region,
            "secretsmanager",
            "POST",
            &url,
            &headers,
            &body,
            timestamp,
        )?;

        let mut request = cx
            .http
            .post(&url)
            .header("content-type", "application/x-amz-json-1.1")
            .header("x-amz-target", "secretsmanager.GetSecretValue")
            .header("authorization", &signed.authorization)
            .header("x-amz-date", &signed.amz_date)
            .header("x-amz-content-sha256", &signed.content_sha256)
            .body(body);
        if let Some(token) = &signed.security_token {
            request = request.header("x-amz-security-token", token);
        }

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(JanusError::ServiceUnavailable {
                message: format!("secrets manager read failed ({status}): {body}"),
            });
        }

        #[derive(Deserialize)]
        struct GetSecretValueResponse {
            #[serde(rename = "SecretString")]
            secret_string: Option<String>,
        }
        let parsed: GetSecretValueResponse = response.json().await?;
        let secret = parsed
            .secret_string
            .ok_or_else(|| JanusError::ServiceUnavailable {
                message: format!("secret {} has no string payload", self.secret_id),
            })?;
        Ok(parse_secret_payload(&secret, store_expiry()))
    }
}

/// Azure Key Vault, authenticated with an ambient Azure access token.
pub struct AzureKeyVaultStrategy {
    vault: String,
    name: String,
}

impl AzureKeyVaultStrategy {
    pub fn new(vault: String, name: String) -> Self {
        Self { vault, name }
    }

    pub fn init(&self, cx: &StrategyContext) -> Result<()> {
        if cx.env("AZURE_ACCESS_TOKEN").is_none() && !cx.platform.azure_workload_identity {
            return Err(JanusError::ServiceUnavailable {
                message: "azure key vault needs an access token or workload identity".to_string(),
            });
        }
        Ok(())
    }

    pub async fn fetch(&self, cx: &StrategyContext) -> Result<Credential> {
        let token = match cx.env("AZURE_ACCESS_TOKEN") {
            Some(token) => token,
            None => {
                let exchange = super::WorkloadIdentityStrategy::new(
                    crate::config::CloudFamily::Azure,
                    Some("https://vault.azure.net".to_string()),
                );
                match exchange.fetch(cx).await? {
                    Credential::AzureToken { token, .. } => token,
                    other => {
                        return Err(JanusError::internal(format!(
                            "azure exchange yielded {}",
                            other.kind_name()
                        )))
                    }
                }
            }
        };

        let vault = self.vault.trim_end_matches('/');
        let vault_url = if vault.starts_with("https://") {
            vault.to_string()
        } else {
            format!("https://{vault}.vault.azure.net")
        };
        let url = format!("{vault_url}/secrets/{}?api-version=7.4", self.name);

        let response = cx.http.get(&url).bearer_auth(&token).send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(JanusError::ServiceUnavailable {
                message: format!("key vault read of {} failed ({status}): {body}", self.name),
            });
        }

        let body: Value = response.json().await?;
        let value = body
            .get("value")
            .and_then(Value::as_str)
            .ok_or_else(|| JanusError::ServiceUnavailable {
                message: format!("key vault secret {} has no value", self.name),
            })?;
        Ok(parse_secret_payload(value, store_expiry()))
    }
}

/// GCP Secret Manager, authenticated with an ambient GCP token.
pub struct GcpSecretManagerStrategy {
    project: String,
    secret: String,
    version: String,
}

impl GcpSecretManagerStrategy {
    pub fn new(project: String, secret: String, version: String) -> Self {
        Self {
            project,
            secret,
            version,
        }
    }

    pub fn init(&self, cx: &StrategyContext) -> Result<()> {
        if cx.env("GCP_ACCESS_TOKEN").is_none() && !cx.platform.gcp_workload_identity {
            return Err(JanusError::ServiceUnavailable {
                message: "gcp secret manager needs an access token or workload identity".to_string(),
            });
        }
        Ok(())
    }

    pub async fn fetch(&self, cx: &StrategyContext) -> Result<Credential> {
        let token = match cx.env("GCP_ACCESS_TOKEN") {
            Some(token) => token,
            None => {
                let exchange = super::WorkloadIdentityStrategy::new(
                    crate::config::CloudFamily::Gcp,
                    None,
                );
                match exchange.fetch(cx).await? {
                    Credential::GcpToken { token, .. } => token,
                    other => {
                        return Err(JanusError::internal(format!(
                            "gcp exchange yielded {}",
                            other.kind_name()
                        )))
                    }
                }
            }
        };

        let url = format!(
            "https://secretmanager.googleapis.com/v1/projects/{}/secrets/{}/versions/{}:access",
            self.project, self.secret, self.version
        );
        let response = cx.http.get(&url).bearer_auth(&token).send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(JanusError::ServiceUnavailable {
                message: format!("secret manager read of {} failed ({status}): {body}", self.secret),
            });
        }

        #[derive(Deserialize)]
        struct AccessResponse {
            payload: AccessPayload,
        }
        #[derive(Deserialize)]
        struct AccessPayload {
            data: String,
        }
        let parsed: AccessResponse = response.json().await?;
        let decoded = {
            use base64::Engine as _;
            base64::engine::general_purpose::STANDARD
                .decode(parsed.payload.data.as_bytes())
                .map_err(|err| JanusError::ServiceUnavailable {
                    message: format!("secret manager payload is not base64: {err}"),
                })?
        };
        let text = String::from_utf8(decoded).map_err(|err| JanusError::ServiceUnavailable {
            message: format!("secret manager payload is not utf-8: {err}"),
        })?;
        Ok(parse_secret_payload(&text, store_expiry()))
    }
}
