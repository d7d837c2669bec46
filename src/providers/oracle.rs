use std::collections::BTreeMap;

use serde_json::Value;

use crate::config::InstanceConfig;
use crate::{JanusError, Result};

pub struct OracleClient {
    pub(crate) http: reqwest::Client,
    pub(crate) base_url: String,
    compartment_id: String,
}

impl OracleClient {
    pub fn new(http: reqwest::Client, config: &InstanceConfig) -> Result<Self> {
        let endpoint = config
            .endpoint
            .as_deref()
            .ok_or_else(|| JanusError::internal("oracle instance has no endpoint"))?;
        let compartment_id = config
            .compartment_id
            .clone()
            .ok_or_else(|| JanusError::internal("oracle instance has no compartment_id"))?;
        Ok(Self {
            http,
            base_url: endpoint.trim_end_matches('/').to_string(),
            compartment_id,
        })
    }

    pub fn chat_route(&self, _stream: bool) -> Result<(String, BTreeMap<String, String>)> {
        Ok(("/20231130/actions/generateText".to_string(), BTreeMap::new()))
    }

    /// Adds the compartment and, for streams, the SSE flag the service
    /// expects inside inferenceRequest.
    pub fn finalize_body(&self, body: &mut Value, stream: bool) {
        if let Some(object) = body.as_object_mut() {
            object.insert(
                "compartmentId".to_string(),
                Value::String(self.compartment_id.clone()),
            );
        }
        if stream {
            if let Some(inference) = body
                .get_mut("inferenceRequest")
                .and_then(Value::as_object_mut)
            {
                inference.insert("isStream".to_string(), Value::Bool(true));
            }
        }
    }
}
