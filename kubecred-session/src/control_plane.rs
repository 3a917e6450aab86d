//! Managed-cluster control-plane client.

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use kubecred_core::{
    AzureConfig, ClusterCredentialSource, CredentialError, CredentialResult, ResourceId,
};
use reqwest::StatusCode;
use serde::Deserialize;

/// API version used for `listClusterUserCredential`.
pub const CONTAINER_SERVICE_API_VERSION: &str = "2024-02-01";

#[derive(Debug, Deserialize)]
struct ListCredentialsResponse {
    #[serde(default)]
    kubeconfigs: Vec<KubeconfigEntry>,
}

#[derive(Debug, Deserialize)]
struct KubeconfigEntry {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    value: Option<String>,
}

/// Calls `listClusterUserCredential` on the management endpoint.
#[derive(Debug, Clone)]
pub struct ArmClusterCredentialClient {
    http: reqwest::Client,
    endpoint: String,
}

impl ArmClusterCredentialClient {
    pub fn new(config: &AzureConfig) -> CredentialResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(config.http_timeout)
            .build()
            .map_err(|e| {
                CredentialError::kubeconfig_generation_failed(format!("failed to build HTTP client: {e}"))
            })?;
        Ok(Self {
            http,
            endpoint: config.management_endpoint.trim_end_matches('/').to_string(),
        })
    }

    fn url(&self, resource: &ResourceId) -> String {
        format!(
            "{}/subscriptions/{}/resourceGroups/{}/providers/Microsoft.ContainerService/managedClusters/{}/listClusterUserCredential?api-version={}",
            self.endpoint,
            resource.subscription_id(),
            resource.resource_group(),
            resource.cluster_name(),
            CONTAINER_SERVICE_API_VERSION,
        )
    }
}

#[async_trait]
impl ClusterCredentialSource for ArmClusterCredentialClient {
    async fn list_cluster_user_credentials(
        &self,
        management_token: &str,
        resource: &ResourceId,
    ) -> CredentialResult<String> {
        tracing::debug!(resource = %resource, "fetching cluster user credentials");

        let response = self
            .http
            .post(self.url(resource))
            .bearer_auth(management_token)
            .header(reqwest::header::CONTENT_LENGTH, 0)
            .send()
            .await
            .map_err(|e| {
                CredentialError::kubeconfig_generation_failed(format!(
                    "Failed to generate kubeconfig: request error: {e}"
                ))
            })?;

        let status = response.status();
        match status {
            StatusCode::FORBIDDEN | StatusCode::NOT_FOUND => {
                tracing::warn!(resource = %resource, %status, "cluster access refused by control plane");
                return Err(CredentialError::invalid_cluster_access(format!(
                    "control plane returned {status} for {resource}"
                )));
            }
            s if !s.is_success() => {
                return Err(CredentialError::kubeconfig_generation_failed(format!(
                    "Failed to generate kubeconfig: control plane returned {status}"
                )));
            }
            _ => {}
        }

        let body: ListCredentialsResponse = response.json().await.map_err(|e| {
            CredentialError::kubeconfig_generation_failed(format!(
                "Failed to generate kubeconfig: invalid response: {e}"
            ))
        })?;

        let first = body.kubeconfigs.into_iter().next().ok_or_else(|| {
            CredentialError::kubeconfig_generation_failed("No user kubeconfig available")
        })?;
        let encoded = first
            .value
            .filter(|v| !v.is_empty())
            .ok_or_else(|| CredentialError::kubeconfig_generation_failed("Kubeconfig data is empty"))?;
        let bytes = STANDARD.decode(encoded.trim()).map_err(|e| {
            CredentialError::kubeconfig_generation_failed(format!("kubeconfig value is not base64: {e}"))
        })?;

        tracing::trace!(
            credential_name = first.name.as_deref().unwrap_or("-"),
            bytes = bytes.len(),
            "cluster user credentials received"
        );

        String::from_utf8(bytes).map_err(|e| {
            CredentialError::kubeconfig_generation_failed(format!("kubeconfig is not UTF-8: {e}"))
        })
    }
}
