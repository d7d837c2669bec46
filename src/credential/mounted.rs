//! Mounted-secret and static strategies: a file path injected by a CSI
//! driver sidecar, or a literal / environment-sourced value. No expiry.

use super::{parse_secret_payload, Credential, StrategyContext};
use crate::{JanusError, Result};

pub struct KubernetesSecretStrategy {
    path: String,
}

impl KubernetesSecretStrategy {
    pub fn new(path: String) -> Self {
        Self { path }
    }

    pub async fn init(&self) -> Result<()> {
        match tokio::fs::metadata(&self.path).await {
            Ok(meta) if meta.is_file() => Ok(()),
            Ok(_) => Err(JanusError::ServiceUnavailable {
                message: format!("mounted secret {} is not a file", self.path),
            }),
            Err(err) => Err(JanusError::ServiceUnavailable {
                message: format!("mounted secret {} is unreadable: {err}", self.path),
            }),
        }
    }

    pub async fn fetch(&self) -> Result<Credential> {
        let raw = tokio::fs::read_to_string(&self.path).await.map_err(|err| {
            JanusError::ServiceUnavailable {
                message: format!("mounted secret {} read failed: {err}", self.path),
            }
        })?;
        Ok(parse_secret_payload(&raw, None))
    }
}

pub struct StaticStrategy {
    value: Option<String>,
    env: Option<String>,
}

impl StaticStrategy {
    pub fn new(value: Option<String>, env: Option<String>) -> Self {
        Self { value, env }
    }

    pub fn init(&self, cx: &StrategyContext) -> Result<()> {
        self.fetch(cx).map(|_| ())
    }

    pub fn fetch(&self, cx: &StrategyContext) -> Result<Credential> {
        if let Some(value) = self.value.as_ref().filter(|v| !v.trim().is_empty()) {
            return Ok(parse_secret_payload(value, None));
        }
        if let Some(name) = &self.env {
            if let Some(value) = cx.env(name) {
                return Ok(parse_secret_payload(&value, None));
            }
            return Err(JanusError::ServiceUnavailable {
                message: format!("static strategy: {name} is not set"),
            });
        }
        Err(JanusError::ServiceUnavailable {
            message: "static strategy has neither value nor env".to_string(),
        })
    }
}
