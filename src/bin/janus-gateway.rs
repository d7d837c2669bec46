use std::sync::Arc;

use tracing_subscriber::EnvFilter;

use janus_llm::config::{Config, InstanceMode};
use janus_llm::dispatch::Dispatcher;
use janus_llm::http::{router, GatewayState};
use janus_llm::platform::PlatformCapabilities;
use janus_llm::Result;

fn env_or(name: &str, default: &str) -> String {
    std::env::var(name)
        .ok()
        .filter(|value| !value.trim().is_empty())
        .unwrap_or_else(|| default.to_string())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let port = env_or("PORT", "8080");
    let config_path = env_or("PROVIDER_INSTANCES_CONFIG", "configs/provider-instances.yaml");

    tracing::info!(path = %config_path, "loading provider instances configuration");
    let config = Config::load(&config_path).await?;

    let platform = PlatformCapabilities::detect();
    let dispatcher = Arc::new(Dispatcher::new(&config, platform)?);
    dispatcher.init_credentials().await;

    let transparent = dispatcher
        .registry
        .instances_by_mode(InstanceMode::Transparent)
        .len();
    let protocol = dispatcher
        .registry
        .instances_by_mode(InstanceMode::Protocol)
        .len();
    tracing::info!(
        transparent_instances = transparent,
        protocol_instances = protocol,
        transparent_mode = dispatcher.registry.is_feature_enabled("transparent_mode"),
        protocol_mode = dispatcher.registry.is_feature_enabled("protocol_mode"),
        "gateway configured"
    );

    if env_or("TLS_ENABLED", "false") == "true" {
        // TLS termination belongs to the fronting listener; the gateway
        // itself serves plain HTTP.
        tracing::warn!(
            tls_port = %env_or("TLS_PORT", "8443"),
            cert = %env_or("TLS_CERT_FILE", "/etc/tls/tls.crt"),
            key = %env_or("TLS_KEY_FILE", "/etc/tls/tls.key"),
            "TLS_ENABLED is set; terminate TLS in front of the gateway"
        );
    }

    let app = router(GatewayState { dispatcher });

    let addr = format!("0.0.0.0:{port}");
    tracing::info!(addr = %addr, "starting http server");
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("shutting down");
        })
        .await?;
    Ok(())
}
