//! Immutable instance registry: path-prefix and name lookups over the parsed
//! configuration. Built once at startup and shared read-only.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::config::{Config, InstanceConfig, InstanceMode, ProviderKind};
use crate::{JanusError, Result};

#[derive(Debug)]
pub struct Instance {
    pub name: String,
    pub config: InstanceConfig,
}

impl Instance {
    pub fn allows_method(&self, prefix: &str, method: &str) -> bool {
        self.config
            .endpoints
            .iter()
            .filter(|endpoint| endpoint.path == prefix)
            .any(|endpoint| {
                endpoint
                    .methods
                    .iter()
                    .any(|allowed| allowed.eq_ignore_ascii_case(method))
            })
    }
}

/// Result of a path lookup: the owning instance, the matched prefix, and the
/// path remainder to forward upstream.
#[derive(Debug, Clone)]
pub struct PathMatch {
    pub instance: Arc<Instance>,
    pub prefix: String,
    pub suffix: String,
}

#[derive(Debug)]
pub struct InstanceRegistry {
    by_name: BTreeMap<String, Arc<Instance>>,
    /// Prefix → instance, scanned longest-first.
    prefixes: Vec<(String, Arc<Instance>)>,
    features: BTreeMap<String, bool>,
    routing_defaults: BTreeMap<String, String>,
}

impl InstanceRegistry {
    pub fn new(config: &Config) -> Result<Self> {
        config.validate()?;

        let mut by_name = BTreeMap::new();
        let mut prefixes = Vec::new();
        for (name, instance_config) in &config.instances {
            let instance = Arc::new(Instance {
                name: name.clone(),
                config: instance_config.clone(),
            });
            for endpoint in &instance.config.endpoints {
                prefixes.push((endpoint.path.clone(), instance.clone()));
            }
            by_name.insert(name.clone(), instance);
        }
        // Longest prefix wins; validation already rejected duplicates.
        prefixes.sort_by(|a, b| b.0.len().cmp(&a.0.len()).then_with(|| a.0.cmp(&b.0)));

        Ok(Self {
            by_name,
            prefixes,
            features: config
                .features
                .iter()
                .map(|(name, feature)| (name.clone(), feature.enabled))
                .collect(),
            routing_defaults: config.routing.defaults.clone(),
        })
    }

    pub fn lookup_by_path(&self, path: &str) -> Option<PathMatch> {
        for (prefix, instance) in &self.prefixes {
            if let Some(suffix) = strip_prefix_segment(path, prefix) {
                return Some(PathMatch {
                    instance: instance.clone(),
                    prefix: prefix.clone(),
                    suffix,
                });
            }
        }
        None
    }

    pub fn lookup_by_name(&self, name: &str) -> Option<Arc<Instance>> {
        self.by_name.get(name).cloned()
    }

    pub fn default_for_kind(&self, kind: ProviderKind) -> Option<Arc<Instance>> {
        let name = self.routing_defaults.get(kind.as_str())?;
        self.by_name.get(name).cloned()
    }

    pub fn instances(&self) -> impl Iterator<Item = &Arc<Instance>> {
        self.by_name.values()
    }

    pub fn instances_by_mode(&self, mode: InstanceMode) -> Vec<Arc<Instance>> {
        self.by_name
            .values()
            .filter(|instance| instance.config.mode == mode)
            .cloned()
            .collect()
    }

    pub fn instances_by_kind(&self, kind: ProviderKind) -> Vec<Arc<Instance>> {
        self.by_name
            .values()
            .filter(|instance| instance.config.kind == kind)
            .cloned()
            .collect()
    }

    pub fn is_feature_enabled(&self, name: &str) -> bool {
        self.features.get(name).copied().unwrap_or(false)
    }

    pub fn require(&self, name: &str) -> Result<Arc<Instance>> {
        self.lookup_by_name(name)
            .ok_or_else(|| JanusError::not_found("instance_not_found", format!("instance not found: {name}")))
    }
}

/// Prefix match that respects path-segment boundaries: `/openai/a` matches
/// `/openai/a` and `/openai/a/chat` but not `/openai/ab`.
fn strip_prefix_segment(path: &str, prefix: &str) -> Option<String> {
    let rest = path.strip_prefix(prefix)?;
    if rest.is_empty() {
        return Some(String::new());
    }
    if rest.starts_with('/') || prefix.ends_with('/') {
        return Some(rest.to_string());
    }
    None
}
