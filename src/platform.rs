//! Workload-identity platform detection. Runs once at startup; the result is
//! advisory, strategies still validate themselves at acquisition time.

use std::path::Path;

pub const AWS_ROLE_ARN: &str = "AWS_ROLE_ARN";
pub const AWS_WEB_IDENTITY_TOKEN_FILE: &str = "AWS_WEB_IDENTITY_TOKEN_FILE";
pub const AZURE_FEDERATED_TOKEN_FILE: &str = "AZURE_FEDERATED_TOKEN_FILE";
pub const AZURE_CLIENT_ID: &str = "AZURE_CLIENT_ID";
pub const AZURE_TENANT_ID: &str = "AZURE_TENANT_ID";
pub const GOOGLE_APPLICATION_CREDENTIALS: &str = "GOOGLE_APPLICATION_CREDENTIALS";
const OCI_RESOURCE_PRINCIPAL_VERSION: &str = "OCI_RESOURCE_PRINCIPAL_VERSION";
const IBM_CR_TOKEN_FILE: &str = "IBM_CR_TOKEN_FILE";

/// One flag per workload-identity family. Cross-cloud federation means
/// several can be true at once.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PlatformCapabilities {
    pub aws_workload_identity: bool,
    pub azure_workload_identity: bool,
    pub gcp_workload_identity: bool,
    pub oci_resource_principal: bool,
    pub ibm_compute_resource: bool,
}

impl PlatformCapabilities {
    pub fn detect() -> Self {
        Self::detect_with(
            |name| std::env::var(name).ok().filter(|v| !v.trim().is_empty()),
            |path| Path::new(path).exists(),
        )
    }

    pub fn detect_with(
        env: impl Fn(&str) -> Option<String>,
        file_exists: impl Fn(&str) -> bool,
    ) -> Self {
        let aws_workload_identity = match (env(AWS_ROLE_ARN), env(AWS_WEB_IDENTITY_TOKEN_FILE)) {
            (Some(_), Some(token_file)) => file_exists(&token_file),
            _ => false,
        };

        let azure_workload_identity = match (
            env(AZURE_FEDERATED_TOKEN_FILE),
            env(AZURE_CLIENT_ID),
            env(AZURE_TENANT_ID),
        ) {
            (Some(token_file), Some(_), Some(_)) => file_exists(&token_file),
            _ => false,
        };

        // Either an explicit credentials file or the GCE metadata server.
        let gcp_workload_identity = env(GOOGLE_APPLICATION_CREDENTIALS)
            .map(|path| file_exists(&path))
            .unwrap_or(false)
            || env("GCE_METADATA_HOST").is_some()
            || file_exists("/run/secrets/gcp/metadata");

        let oci_resource_principal = env(OCI_RESOURCE_PRINCIPAL_VERSION).is_some();
        let ibm_compute_resource = env(IBM_CR_TOKEN_FILE)
            .map(|path| file_exists(&path))
            .unwrap_or(false);

        let caps = Self {
            aws_workload_identity,
            azure_workload_identity,
            gcp_workload_identity,
            oci_resource_principal,
            ibm_compute_resource,
        };
        tracing::info!(
            aws = caps.aws_workload_identity,
            azure = caps.azure_workload_identity,
            gcp = caps.gcp_workload_identity,
            oci = caps.oci_resource_principal,
            ibm = caps.ibm_compute_resource,
            "platform workload-identity capabilities"
        );
        caps
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detects_aws_when_token_file_present() {
        let caps = PlatformCapabilities::detect_with(
            |name| match name {
                AWS_ROLE_ARN => Some("arn:aws:iam::123:role/gateway".to_string()),
                AWS_WEB_IDENTITY_TOKEN_FILE => Some("/var/run/secrets/eks/token".to_string()),
                _ => None,
            },
            |path| path == "/var/run/secrets/eks/token",
        );
        assert!(caps.aws_workload_identity);
        assert!(!caps.azure_workload_identity);
    }

    #[test]
    fn aws_flag_requires_both_env_vars() {
        let caps = PlatformCapabilities::detect_with(
            |name| (name == AWS_ROLE_ARN).then(|| "arn:aws:iam::123:role/x".to_string()),
            |_| true,
        );
        assert!(!caps.aws_workload_identity);
    }

    #[test]
    fn multiple_families_can_coexist() {
        let caps = PlatformCapabilities::detect_with(
            |name| match name {
                AWS_ROLE_ARN => Some("arn".to_string()),
                AWS_WEB_IDENTITY_TOKEN_FILE => Some("/t/aws".to_string()),
                AZURE_FEDERATED_TOKEN_FILE => Some("/t/azure".to_string()),
                AZURE_CLIENT_ID => Some("client".to_string()),
                AZURE_TENANT_ID => Some("tenant".to_string()),
                _ => None,
            },
            |_| true,
        );
        assert!(caps.aws_workload_identity && caps.azure_workload_identity);
    }
}
