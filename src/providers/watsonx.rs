use std::collections::BTreeMap;

use serde_json::Value;

use crate::config::InstanceConfig;
use crate::{JanusError, Result};

const DEFAULT_BASE_URL: &str = "https://us-south.ml.cloud.ibm.com";
const API_VERSION: &str = "2023-05-29";

pub struct WatsonxClient {
    pub(crate) http: reqwest::Client,
    pub(crate) base_url: String,
    project_id: String,
    api_version: String,
}

impl WatsonxClient {
    pub fn new(http: reqwest::Client, config: &InstanceConfig) -> Result<Self> {
        let project_id = config
            .project_id
            .clone()
            .ok_or_else(|| JanusError::internal("watsonx instance has no project_id"))?;
        Ok(Self {
            http,
            base_url: config
                .base_url
                .as_deref()
                .or(config.endpoint.as_deref())
                .unwrap_or(DEFAULT_BASE_URL)
                .trim_end_matches('/')
                .to_string(),
            project_id,
            api_version: config
                .api_version
                .clone()
                .unwrap_or_else(|| API_VERSION.to_string()),
        })
    }

    pub fn chat_route(&self, stream: bool) -> Result<(String, BTreeMap<String, String>)> {
        let path = if stream {
            "/ml/v1/text/generation_stream"
        } else {
            "/ml/v1/text/generation"
        };
        let mut query = BTreeMap::new();
        query.insert("version".to_string(), self.api_version.clone());
        Ok((path.to_string(), query))
    }

    /// The project id rides in the body, not the URL.
    pub fn finalize_body(&self, body: &mut Value) {
        if let Some(object) = body.as_object_mut() {
            object.insert("project_id".to_string(), Value::String(self.project_id.clone()));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ProviderKind;
    use serde_json::json;

    #[test]
    fn body_gains_project_id() {
        let mut config = InstanceConfig::for_tests(ProviderKind::Ibm);
        config.project_id = Some("proj-1".to_string());
        let client = WatsonxClient::new(reqwest::Client::new(), &config).unwrap();

        let mut body = json!({ "model_id": "ibm/granite-13b-chat-v2", "input": "hi" });
        client.finalize_body(&mut body);
        assert_eq!(body["project_id"], "proj-1");

        let (path, query) = client.chat_route(false).unwrap();
        assert_eq!(path, "/ml/v1/text/generation");
        assert_eq!(query["version"], API_VERSION);
    }
}
