//! Model routing for the legacy `/v1` routes: configured per-kind defaults
//! first, then the built-in model-name pattern rules.

use std::sync::Arc;

use regex::Regex;

use crate::config::ProviderKind;
use crate::registry::{Instance, InstanceRegistry};
use crate::{JanusError, Result};

/// Built-in model-name routing rules, checked in order.
struct PatternRule {
    pattern: Regex,
    kind: ProviderKind,
}

pub struct ModelRouter {
    rules: Vec<PatternRule>,
}

impl Default for ModelRouter {
    fn default() -> Self {
        Self::new()
    }
}

impl ModelRouter {
    pub fn new() -> Self {
        let table: &[(&str, ProviderKind)] = &[
            // Suffix disambiguators first, they are the most specific.
            (r"-anthropic$", ProviderKind::Anthropic),
            (r"-azure-deployment$", ProviderKind::Azure),
            (r"^gpt-", ProviderKind::Openai),
            (r"^o[0-9]", ProviderKind::Openai),
            (r"^claude-", ProviderKind::Bedrock),
            (r"^anthropic\.", ProviderKind::Bedrock),
            (r"^amazon\.titan", ProviderKind::Bedrock),
            (r"^gemini-", ProviderKind::Vertex),
            (r"^ibm/", ProviderKind::Ibm),
            (r"^cohere\.", ProviderKind::Oracle),
            (r"^meta\.llama", ProviderKind::Oracle),
        ];
        let rules = table
            .iter()
            .filter_map(|(pattern, kind)| {
                Regex::new(pattern).ok().map(|pattern| PatternRule {
                    pattern,
                    kind: *kind,
                })
            })
            .collect();
        Self { rules }
    }

    pub fn kind_for_model(&self, model: &str) -> Option<ProviderKind> {
        self.rules
            .iter()
            .find(|rule| rule.pattern.is_match(model))
            .map(|rule| rule.kind)
    }

    /// Resolves a model name to the protocol instance that serves it, via
    /// the registry's routing defaults.
    pub fn route(&self, registry: &InstanceRegistry, model: &str) -> Result<Arc<Instance>> {
        let kind = self.kind_for_model(model).ok_or_else(|| {
            JanusError::invalid_request(
                "model_not_supported",
                format!("no provider is known for model {model:?}"),
            )
        })?;
        registry.default_for_kind(kind).ok_or_else(|| {
            JanusError::invalid_request(
                "model_not_supported",
                format!("no default instance is configured for provider {kind}"),
            )
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pattern_table_matches_expected_providers() {
        let router = ModelRouter::new();
        let cases = [
            ("claude-3-sonnet-20240229", ProviderKind::Bedrock),
            ("claude-3-5-sonnet-20240620", ProviderKind::Bedrock),
            ("amazon.titan-text-express-v1", ProviderKind::Bedrock),
            ("gpt-4-turbo", ProviderKind::Openai),
            ("gpt-3.5-turbo", ProviderKind::Openai),
            ("gpt-4-azure-deployment", ProviderKind::Azure),
            ("gemini-1.5-pro", ProviderKind::Vertex),
            ("claude-3-sonnet-20240229-anthropic", ProviderKind::Anthropic),
            ("ibm/granite-13b-chat-v2", ProviderKind::Ibm),
            ("cohere.command-r-plus", ProviderKind::Oracle),
            ("meta.llama-3-70b", ProviderKind::Oracle),
        ];
        for (model, expected) in cases {
            assert_eq!(router.kind_for_model(model), Some(expected), "model {model}");
        }
        assert_eq!(router.kind_for_model("mystery-model"), None);
    }
}
