//! Tenant boundary policy.
//!
//! Decides whether a caller may address a subscription. The check is a seam:
//! deployments that need identity-to-subscription policy plug in their own
//! implementation.

use async_trait::async_trait;
use kubecred_core::{CredentialResult, UserContext};

#[async_trait]
pub trait TenantBoundaryPolicy: Send + Sync {
    /// `Ok(false)` rejects the request with `TenantBoundaryViolation`.
    async fn allows(&self, user: &UserContext, subscription_id: &str) -> CredentialResult<bool>;
}

/// Allows every subscription.
///
/// This is the default: no subscription-to-tenant ownership lookup is done,
/// so access control rests on the downstream token's own permissions.
#[derive(Debug, Clone, Copy, Default)]
pub struct PermissiveBoundaryPolicy;

#[async_trait]
impl TenantBoundaryPolicy for PermissiveBoundaryPolicy {
    async fn allows(&self, _user: &UserContext, _subscription_id: &str) -> CredentialResult<bool> {
        Ok(true)
    }
}

/// Allows only subscriptions mapped to the caller's tenant.
#[derive(Debug, Clone, Default)]
pub struct StaticTenantPolicy {
    owners: std::collections::HashMap<String, String>,
}

impl StaticTenantPolicy {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that `subscription_id` belongs to `tenant_id`.
    pub fn with_subscription(mut self, subscription_id: impl Into<String>, tenant_id: impl Into<String>) -> Self {
        self.owners.insert(subscription_id.into(), tenant_id.into());
        self
    }
}

#[async_trait]
impl TenantBoundaryPolicy for StaticTenantPolicy {
    async fn allows(&self, user: &UserContext, subscription_id: &str) -> CredentialResult<bool> {
        Ok(self
            .owners
            .get(subscription_id)
            .is_some_and(|tenant| tenant == user.tenant_id()))
    }
}
