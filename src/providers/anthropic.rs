use std::collections::BTreeMap;

use crate::config::InstanceConfig;
use crate::Result;

const DEFAULT_BASE_URL: &str = "https://api.anthropic.com/v1";

pub struct AnthropicClient {
    pub(crate) http: reqwest::Client,
    pub(crate) base_url: String,
}

impl AnthropicClient {
    pub fn new(http: reqwest::Client, config: &InstanceConfig) -> Self {
        let base_url = config
            .base_url
            .as_deref()
            .unwrap_or(DEFAULT_BASE_URL)
            .trim_end_matches('/')
            .to_string();
        Self { http, base_url }
    }

    pub fn chat_route(&self, _stream: bool) -> Result<(String, BTreeMap<String, String>)> {
        // Streaming rides on the same path via the body's stream flag.
        Ok(("/messages".to_string(), BTreeMap::new()))
    }
}
