use std::collections::BTreeMap;

use crate::config::InstanceConfig;
use crate::{JanusError, Result};

const DEFAULT_API_VERSION: &str = "2024-02-15-preview";

pub struct AzureClient {
    pub(crate) http: reqwest::Client,
    pub(crate) base_url: String,
    api_version: String,
    /// Model name → deployment name from the instance configuration.
    deployments: BTreeMap<String, String>,
}

impl AzureClient {
    pub fn new(http: reqwest::Client, config: &InstanceConfig) -> Result<Self> {
        let endpoint = config
            .endpoint
            .as_deref()
            .or(config.base_url.as_deref())
            .ok_or_else(|| JanusError::internal("azure instance has no endpoint"))?;
        Ok(Self {
            http,
            base_url: endpoint.trim_end_matches('/').to_string(),
            api_version: config
                .api_version
                .clone()
                .unwrap_or_else(|| DEFAULT_API_VERSION.to_string()),
            deployments: config.deployments.clone(),
        })
    }

    /// The deployment name substitutes for the model in the URL path; an
    /// unmapped model falls back to its own name as the deployment.
    pub fn chat_route(
        &self,
        model: &str,
        _stream: bool,
    ) -> Result<(String, BTreeMap<String, String>)> {
        let deployment = self
            .deployments
            .get(model)
            .map(String::as_str)
            .unwrap_or(model);
        let mut query = BTreeMap::new();
        query.insert("api-version".to_string(), self.api_version.clone());
        Ok((
            format!("/openai/deployments/{deployment}/chat/completions"),
            query,
        ))
    }
}
