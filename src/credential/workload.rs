//! Workload-identity exchanges: platform-issued tokens traded for short-lived
//! provider credentials, with no embedded secrets.

use serde::Deserialize;
use time::{Duration, OffsetDateTime};

use super::{Credential, StrategyContext};
use crate::config::CloudFamily;
use crate::platform;
use crate::{JanusError, Result};

const AZURE_DEFAULT_RESOURCE: &str = "https://cognitiveservices.azure.com";
const GCP_METADATA_TOKEN_URL: &str =
    "http://metadata.google.internal/computeMetadata/v1/instance/service-accounts/default/token";

pub struct WorkloadIdentityStrategy {
    cloud: CloudFamily,
    resource: Option<String>,
}

impl WorkloadIdentityStrategy {
    pub fn new(cloud: CloudFamily, resource: Option<String>) -> Self {
        Self { cloud, resource }
    }

    /// Eligibility follows the startup platform probe; the exchange itself
    /// re-validates at acquisition time.
    pub fn init(&self, cx: &StrategyContext) -> Result<()> {
        let eligible = match self.cloud {
            CloudFamily::Aws => cx.platform.aws_workload_identity,
            CloudFamily::Azure => cx.platform.azure_workload_identity,
            CloudFamily::Gcp => cx.platform.gcp_workload_identity,
            CloudFamily::Oci | CloudFamily::Ibm => false,
        };
        if eligible {
            Ok(())
        } else {
            Err(JanusError::ServiceUnavailable {
                message: format!("workload identity for {} is not available on this platform", self.cloud),
            })
        }
    }

    pub async fn fetch(&self, cx: &StrategyContext) -> Result<Credential> {
        match self.cloud {
            CloudFamily::Aws => self.fetch_aws(cx).await,
            CloudFamily::Azure => self.fetch_azure(cx).await,
            CloudFamily::Gcp => self.fetch_gcp(cx).await,
            CloudFamily::Oci | CloudFamily::Ibm => Err(JanusError::ServiceUnavailable {
                message: format!("workload identity exchange for {} is not supported", self.cloud),
            }),
        }
    }

    async fn fetch_aws(&self, cx: &StrategyContext) -> Result<Credential> {
        let role_arn = require_env(cx, platform::AWS_ROLE_ARN)?;
        let token_file = require_env(cx, platform::AWS_WEB_IDENTITY_TOKEN_FILE)?;
        let token = tokio::fs::read_to_string(&token_file).await?;
        let region = cx.env("AWS_REGION").unwrap_or_else(|| "us-east-1".to_string());
        let url = format!("https://sts.{region}.amazonaws.com/");

        let response = cx
            .http
            .post(&url)
            .header("Accept", "application/json")
            .form(&[
                ("Action", "AssumeRoleWithWebIdentity"),
                ("Version", "2011-06-15"),
                ("RoleArn", role_arn.as_str()),
                ("RoleSessionName", "janus-gateway"),
                ("WebIdentityToken", token.trim()),
            ])
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(JanusError::ServiceUnavailable {
                message: format!("sts web-identity exchange failed ({status}): {body}"),
            });
        }

        #[derive(Deserialize)]
        struct StsEnvelope {
            #[serde(rename = "AssumeRoleWithWebIdentityResponse")]
            response: StsResponse,
        }
        #[derive(Deserialize)]
        struct StsResponse {
            #[serde(rename = "AssumeRoleWithWebIdentityResult")]
            result: StsResult,
        }
        #[derive(Deserialize)]
        struct StsResult {
            #[serde(rename = "Credentials")]
            credentials: StsCredentials,
        }
        #[derive(Deserialize)]
        struct StsCredentials {
            #[serde(rename = "AccessKeyId")]
            access_key_id: String,
            #[serde(rename = "SecretAccessKey")]
            secret_access_key: String,
            #[serde(rename = "SessionToken")]
            session_token: String,
            #[serde(rename = "Expiration")]
            expiration: f64,
        }

        let envelope: StsEnvelope = response.json().await?;
        let credentials = envelope.response.result.credentials;
        let expiry = OffsetDateTime::from_unix_timestamp(credentials.expiration as i64)
            .map_err(|err| JanusError::internal(format!("sts expiration out of range: {err}")))?;
        Ok(Credential::Aws {
            access_key: credentials.access_key_id,
            secret_key: credentials.secret_access_key,
            session_token: Some(credentials.session_token),
            expiry: Some(expiry),
        })
    }

    async fn fetch_azure(&self, cx: &StrategyContext) -> Result<Credential> {
        let token_file = require_env(cx, platform::AZURE_FEDERATED_TOKEN_FILE)?;
        let client_id = require_env(cx, platform::AZURE_CLIENT_ID)?;
        let tenant_id = require_env(cx, platform::AZURE_TENANT_ID)?;
        let assertion = tokio::fs::read_to_string(&token_file).await?;

        let resource = self
            .resource
            .as_deref()
            .unwrap_or(AZURE_DEFAULT_RESOURCE)
            .trim_end_matches('/');
        let scope = format!("{resource}/.default");
        let url = format!("https://login.microsoftonline.com/{tenant_id}/oauth2/v2.0/token");

        let response = cx
            .http
            .post(&url)
            .form(&[
                ("grant_type", "client_credentials"),
                ("client_id", client_id.as_str()),
                ("scope", scope.as_str()),
                (
                    "client_assertion_type",
                    "urn:ietf:params:oauth:client-assertion-type:jwt-bearer",
                ),
                ("client_assertion", assertion.trim()),
            ])
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(JanusError::ServiceUnavailable {
                message: format!("azure federated token exchange failed ({status}): {body}"),
            });
        }

        let token: BearerTokenResponse = response.json().await?;
        let expiry = token.expiry();
        Ok(Credential::AzureToken {
            token: token.access_token,
            expiry,
        })
    }

    async fn fetch_gcp(&self, cx: &StrategyContext) -> Result<Credential> {
        if let Some(credentials_file) = cx.env(platform::GOOGLE_APPLICATION_CREDENTIALS) {
            return self.fetch_gcp_from_file(cx, &credentials_file).await;
        }

        // Application Default Credentials via the metadata server.
        let response = cx
            .http
            .get(GCP_METADATA_TOKEN_URL)
            .header("Metadata-Flavor", "Google")
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(JanusError::ServiceUnavailable {
                message: format!("gcp metadata token fetch failed ({status}): {body}"),
            });
        }
        let token: BearerTokenResponse = response.json().await?;
        let expiry = token.expiry();
        Ok(Credential::GcpToken {
            token: token.access_token,
            expiry,
        })
    }

    async fn fetch_gcp_from_file(&self, cx: &StrategyContext, path: &str) -> Result<Credential> {
        #[derive(Deserialize)]
        struct AdcFile {
            #[serde(rename = "type")]
            kind: String,
            #[serde(default)]
            client_id: Option<String>,
            #[serde(default)]
            client_secret: Option<String>,
            #[serde(default)]
            refresh_token: Option<String>,
        }

        let raw = tokio::fs::read_to_string(path).await?;
        let adc: AdcFile = serde_json::from_str(&raw)?;
        if adc.kind != "authorized_user" {
            // A service_account key needs RS256 JWT signing; this process
            // only supports refresh-token and metadata flows.
            return Err(JanusError::ServiceUnavailable {
                message: format!("unsupported gcp credentials type {:?}", adc.kind),
            });
        }
        let (Some(client_id), Some(client_secret), Some(refresh_token)) =
            (adc.client_id, adc.client_secret, adc.refresh_token)
        else {
            return Err(JanusError::ServiceUnavailable {
                message: "gcp authorized_user file is missing refresh fields".to_string(),
            });
        };

        let response = cx
            .http
            .post("https://oauth2.googleapis.com/token")
            .form(&[
                ("grant_type", "refresh_token"),
                ("client_id", client_id.as_str()),
                ("client_secret", client_secret.as_str()),
                ("refresh_token", refresh_token.as_str()),
            ])
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(JanusError::ServiceUnavailable {
                message: format!("gcp refresh token exchange failed ({status}): {body}"),
            });
        }
        let token: BearerTokenResponse = response.json().await?;
        let expiry = token.expiry();
        Ok(Credential::GcpToken {
            token: token.access_token,
            expiry,
        })
    }
}

#[derive(Deserialize)]
struct BearerTokenResponse {
    access_token: String,
    #[serde(default)]
    expires_in: Option<u64>,
}

impl BearerTokenResponse {
    fn expiry(&self) -> Option<OffsetDateTime> {
        self.expires_in
            .map(|secs| OffsetDateTime::now_utc() + Duration::seconds(secs as i64))
    }
}

fn require_env(cx: &StrategyContext, name: &str) -> Result<String> {
    cx.env(name).ok_or_else(|| JanusError::ServiceUnavailable {
        message: format!("{name} is not set"),
    })
}
