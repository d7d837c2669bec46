use std::collections::BTreeSet;

use janus_llm::config::{Config, InstanceMode, ProviderKind};
use janus_llm::registry::InstanceRegistry;

const CONFIG: &str = r#"
global:
  metrics:
    enabled: true
instances:
  bedrock_us1:
    type: bedrock
    mode: transparent
    region: ${AWS_REGION:-us-east-1}
    authentication:
      strategies:
        - type: workload_identity
          cloud: aws
        - type: vault
          address: https://vault.internal:8200
          role: ai-gateway
          path: aws/sts/bedrock
        - type: kubernetes_secret
          path: /var/run/secrets/bedrock/creds
    endpoints:
      - path: /transparent/bedrock/us1
        methods: [POST, GET]
    metrics:
      enabled: true
      labels:
        region: us-east-1
  bedrock_us1_openai:
    type: bedrock
    mode: protocol
    protocol: openai
    region: us-east-1
    authentication:
      strategies:
        - type: static
          env: AWS_BEDROCK_KEY_JSON
    transformation:
      request_from: openai
      request_to: bedrock_converse
      response_from: bedrock_converse
      response_to: openai
    endpoints:
      - path: /openai/bedrock_us1_openai
        methods: [POST]
  openai_direct:
    type: openai
    mode: transparent
    base_url: https://api.openai.com/v1
    authentication:
      strategies:
        - type: static
          env: OPENAI_API_KEY
    endpoints:
      - path: /transparent/openai
        methods: [POST]
routing:
  defaults:
    bedrock: bedrock_us1_openai
features:
  transparent_mode:
    enabled: true
  protocol_mode:
    enabled: true
"#;

fn load() -> Config {
    Config::from_yaml(CONFIG, |name| {
        (name == "AWS_REGION").then(|| "us-east-1".to_string())
    })
    .unwrap()
}

#[test]
fn registry_resolves_longest_prefix_with_suffix() {
    let registry = InstanceRegistry::new(&load()).unwrap();

    let matched = registry
        .lookup_by_path("/transparent/bedrock/us1/model/claude-3-sonnet/converse")
        .unwrap();
    assert_eq!(matched.instance.name, "bedrock_us1");
    assert_eq!(matched.suffix, "/model/claude-3-sonnet/converse");

    let matched = registry
        .lookup_by_path("/openai/bedrock_us1_openai/chat/completions")
        .unwrap();
    assert_eq!(matched.instance.name, "bedrock_us1_openai");
    assert_eq!(matched.suffix, "/chat/completions");

    assert!(registry.lookup_by_path("/does-not-exist").is_none());
}

#[test]
fn every_configured_prefix_resolves_to_exactly_one_instance() {
    let config = load();
    let registry = InstanceRegistry::new(&config).unwrap();
    for (name, instance) in &config.instances {
        for endpoint in &instance.endpoints {
            let matched = registry.lookup_by_path(&endpoint.path).unwrap();
            assert_eq!(&matched.instance.name, name, "prefix {}", endpoint.path);
        }
    }
}

/// Re-parsing the same document yields the same in-memory registry.
#[test]
fn reparse_is_stable() {
    let first = load();
    let second = load();

    let names = |config: &Config| config.instances.keys().cloned().collect::<BTreeSet<_>>();
    assert_eq!(names(&first), names(&second));

    for (name, a) in &first.instances {
        let b = &second.instances[name];
        assert_eq!(a.kind, b.kind);
        assert_eq!(a.mode, b.mode);
        let prefixes_a: BTreeSet<_> = a.endpoints.iter().map(|e| e.path.clone()).collect();
        let prefixes_b: BTreeSet<_> = b.endpoints.iter().map(|e| e.path.clone()).collect();
        assert_eq!(prefixes_a, prefixes_b);
        let strategies_a: Vec<_> = a
            .authentication
            .strategies
            .iter()
            .map(|s| s.kind_name())
            .collect();
        let strategies_b: Vec<_> = b
            .authentication
            .strategies
            .iter()
            .map(|s| s.kind_name())
            .collect();
        assert_eq!(strategies_a, strategies_b);
        assert_eq!(
            a.transformation.as_ref().map(|t| (t.request_to, t.response_from)),
            b.transformation.as_ref().map(|t| (t.request_to, t.response_from)),
        );
    }

    // Serialize and parse again: still the same set.
    let serialized = serde_yaml::to_string(&first).unwrap();
    let third = Config::from_yaml(&serialized, |_| None).unwrap();
    assert_eq!(names(&first), names(&third));
}

#[test]
fn filters_and_defaults() {
    let registry = InstanceRegistry::new(&load()).unwrap();
    assert_eq!(registry.instances_by_mode(InstanceMode::Transparent).len(), 2);
    assert_eq!(registry.instances_by_mode(InstanceMode::Protocol).len(), 1);
    assert_eq!(registry.instances_by_kind(ProviderKind::Bedrock).len(), 2);
    assert_eq!(
        registry.default_for_kind(ProviderKind::Bedrock).unwrap().name,
        "bedrock_us1_openai"
    );
    assert!(registry.is_feature_enabled("protocol_mode"));
    assert!(!registry.is_feature_enabled("unknown_feature"));
}

#[test]
fn duplicate_prefix_across_instances_is_rejected_at_load() {
    let raw = CONFIG.replace("/transparent/openai", "/transparent/bedrock/us1");
    let err = Config::from_yaml(&raw, |name| {
        (name == "AWS_REGION").then(|| "us-east-1".to_string())
    })
    .unwrap_err();
    assert!(err.to_string().contains("bound by both"));
}
