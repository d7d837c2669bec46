//! Per-provider outbound authentication: mutates the outbound header map to
//! carry the credential in the provider's expected form.

use std::collections::BTreeMap;

use time::OffsetDateTime;

use super::sigv4::{sign_sigv4, SigV4Timestamp};
use crate::config::{InstanceConfig, ProviderKind};
use crate::credential::Credential;
use crate::{JanusError, Result};

const ANTHROPIC_DEFAULT_VERSION: &str = "2023-06-01";

/// Injects authentication for `kind` into `headers`. `url` must be the final
/// outbound URL including any query string; `now` is taken at the call site.
pub fn apply_auth(
    kind: ProviderKind,
    instance: &InstanceConfig,
    credential: &Credential,
    method: &str,
    url: &str,
    headers: &mut BTreeMap<String, String>,
    body: &[u8],
    now: OffsetDateTime,
) -> Result<()> {
    match kind {
        ProviderKind::Bedrock => {
            let region = instance
                .region
                .as_deref()
                .ok_or_else(|| JanusError::internal("bedrock instance has no region"))?;
            let timestamp = SigV4Timestamp::from_datetime(now)?;
            let signed = sign_sigv4(
                credential, region, "bedrock", method, url, headers, body, timestamp,
            )?;
            headers.insert("authorization".to_string(), signed.authorization);
            headers.insert("x-amz-date".to_string(), signed.amz_date);
            headers.insert("x-amz-content-sha256".to_string(), signed.content_sha256);
            headers.insert("host".to_string(), signed.host);
            if let Some(token) = signed.security_token {
                headers.insert("x-amz-security-token".to_string(), token);
            }
            Ok(())
        }
        ProviderKind::Azure => match credential {
            Credential::ApiKey { value, .. } => {
                headers.insert("api-key".to_string(), value.clone());
                Ok(())
            }
            Credential::AzureToken { token, .. } => {
                headers.insert("authorization".to_string(), format!("Bearer {token}"));
                Ok(())
            }
            other => Err(shape_mismatch(kind, other)),
        },
        ProviderKind::Vertex => match credential {
            Credential::GcpToken { token, .. } => {
                headers.insert("authorization".to_string(), format!("Bearer {token}"));
                Ok(())
            }
            Credential::ApiKey { value, .. } => {
                headers.insert("authorization".to_string(), format!("Bearer {value}"));
                Ok(())
            }
            other => Err(shape_mismatch(kind, other)),
        },
        ProviderKind::Anthropic => match credential {
            Credential::ApiKey { value, .. } => {
                headers.insert("x-api-key".to_string(), value.clone());
                let version = instance
                    .api_version
                    .as_deref()
                    .unwrap_or(ANTHROPIC_DEFAULT_VERSION);
                headers.insert("anthropic-version".to_string(), version.to_string());
                Ok(())
            }
            other => Err(shape_mismatch(kind, other)),
        },
        ProviderKind::Openai | ProviderKind::Ibm | ProviderKind::Oracle => match credential {
            Credential::ApiKey { value, .. } => {
                headers.insert("authorization".to_string(), format!("Bearer {value}"));
                Ok(())
            }
            other => Err(shape_mismatch(kind, other)),
        },
    }
}

fn shape_mismatch(kind: ProviderKind, credential: &Credential) -> JanusError {
    JanusError::internal(format!(
        "provider {kind} cannot authenticate with a {} credential",
        credential.kind_name()
    ))
}
