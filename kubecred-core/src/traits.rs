//! Collaborator seams.
//!
//! Production implementations live in `kubecred-auth` and
//! `kubecred-session`; doubles live in `kubecred-test-utils`.

use crate::error::CredentialResult;
use crate::identity::{ExchangedToken, ResourceId};
use async_trait::async_trait;
use std::path::Path;
use std::sync::Arc;

/// One on-behalf-of exchange. Stateless, no caching, no retries.
#[async_trait]
pub trait TokenExchanger: Send + Sync {
    /// Exchange `assertion` (the caller's delegated token) for a token valid
    /// for `scope` in `tenant_id`.
    ///
    /// # Errors
    /// Any failure is reported as `AzureOboFailed`.
    async fn exchange(
        &self,
        assertion: &str,
        scope: &str,
        tenant_id: &str,
    ) -> CredentialResult<ExchangedToken>;
}

/// Fetches the cluster user credential document from the control plane.
#[async_trait]
pub trait ClusterCredentialSource: Send + Sync {
    /// Returns the raw document (YAML or JSON) for `resource`.
    async fn list_cluster_user_credentials(
        &self,
        management_token: &str,
        resource: &ResourceId,
    ) -> CredentialResult<String>;
}

/// A live cluster session bound to a credential file.
#[async_trait]
pub trait SessionHandle: Send + Sync + std::fmt::Debug {
    /// Path of the credential file this session reads.
    fn credential_path(&self) -> &Path;

    /// Release everything the session holds. Must be idempotent.
    async fn cleanup(&self);
}

/// Opens session handles over credential files.
#[async_trait]
pub trait SessionFactory: Send + Sync {
    async fn open(&self, credential_path: &Path) -> CredentialResult<Arc<dyn SessionHandle>>;
}
