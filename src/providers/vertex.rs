use std::collections::BTreeMap;

use crate::config::InstanceConfig;
use crate::{JanusError, Result};

pub struct VertexClient {
    pub(crate) http: reqwest::Client,
    pub(crate) base_url: String,
    project_id: String,
    location: String,
}

impl VertexClient {
    pub fn new(http: reqwest::Client, config: &InstanceConfig) -> Result<Self> {
        let project_id = config
            .project_id
            .clone()
            .ok_or_else(|| JanusError::internal("vertex instance has no project_id"))?;
        let location = config
            .location
            .clone()
            .unwrap_or_else(|| "us-central1".to_string());
        let base_url = config
            .endpoint
            .clone()
            .unwrap_or_else(|| format!("https://{location}-aiplatform.googleapis.com"));
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            project_id,
            location,
        })
    }

    pub fn chat_route(
        &self,
        model: &str,
        stream: bool,
    ) -> Result<(String, BTreeMap<String, String>)> {
        let action = if stream {
            "streamGenerateContent"
        } else {
            "generateContent"
        };
        let mut query = BTreeMap::new();
        if stream {
            query.insert("alt".to_string(), "sse".to_string());
        }
        Ok((
            format!(
                "/v1/projects/{}/locations/{}/publishers/google/models/{model}:{action}",
                self.project_id, self.location
            ),
            query,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ProviderKind;

    #[test]
    fn path_includes_project_location_and_action() {
        let mut config = InstanceConfig::for_tests(ProviderKind::Vertex);
        config.project_id = Some("my-project".to_string());
        config.location = Some("europe-west4".to_string());

        let client = VertexClient::new(reqwest::Client::new(), &config).unwrap();
        assert_eq!(client.base_url, "https://europe-west4-aiplatform.googleapis.com");

        let (path, query) = client.chat_route("gemini-1.5-pro", true).unwrap();
        assert_eq!(
            path,
            "/v1/projects/my-project/locations/europe-west4/publishers/google/models/gemini-1.5-pro:streamGenerateContent"
        );
        assert_eq!(query["alt"], "sse");
    }
}
