//! Caller identity, cluster addressing, and cached token value types.

use crate::clock::EpochMillis;
use crate::error::{CredentialError, CredentialResult};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};

// ============================================================================
// USER CONTEXT
// ============================================================================

/// A validated caller identity.
///
/// Only produced by validating a delegated token; never persisted.
#[derive(Clone)]
pub struct UserContext {
    user_object_id: String,
    tenant_id: String,
    access_token: SecretString,
}

impl UserContext {
    pub fn new(
        user_object_id: impl Into<String>,
        tenant_id: impl Into<String>,
        access_token: impl Into<String>,
    ) -> Self {
        let access_token: String = access_token.into();
        Self {
            user_object_id: user_object_id.into(),
            tenant_id: tenant_id.into(),
            access_token: SecretString::new(access_token.into()),
        }
    }

    pub fn user_object_id(&self) -> &str {
        &self.user_object_id
    }

    pub fn tenant_id(&self) -> &str {
        &self.tenant_id
    }

    /// The caller's delegated token (use only as an exchange assertion).
    pub fn access_token(&self) -> &str {
        self.access_token.expose_secret()
    }
}

impl std::fmt::Debug for UserContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UserContext")
            .field("user_object_id", &self.user_object_id)
            .field("tenant_id", &self.tenant_id)
            .field(
                "access_token",
                &format!("[REDACTED, {} chars]", self.access_token.expose_secret().len()),
            )
            .finish()
    }
}

// ============================================================================
// RESOURCE ID
// ============================================================================

/// Addresses one managed cluster.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ResourceId {
    subscription_id: String,
    resource_group: String,
    cluster_name: String,
}

impl ResourceId {
    /// # Errors
    /// Returns `InvalidClusterAccess` if any segment is empty.
    pub fn new(
        subscription_id: impl Into<String>,
        resource_group: impl Into<String>,
        cluster_name: impl Into<String>,
    ) -> CredentialResult<Self> {
        let id = Self {
            subscription_id: subscription_id.into(),
            resource_group: resource_group.into(),
            cluster_name: cluster_name.into(),
        };
        for (field, value) in [
            ("subscription_id", &id.subscription_id),
            ("resource_group", &id.resource_group),
            ("cluster_name", &id.cluster_name),
        ] {
            if value.trim().is_empty() {
                return Err(CredentialError::invalid_cluster_access(format!(
                    "{field} must not be empty"
                )));
            }
        }
        Ok(id)
    }

    pub fn subscription_id(&self) -> &str {
        &self.subscription_id
    }

    pub fn resource_group(&self) -> &str {
        &self.resource_group
    }

    pub fn cluster_name(&self) -> &str {
        &self.cluster_name
    }
}

impl std::fmt::Display for ResourceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}/{}/{}",
            self.subscription_id, self.resource_group, self.cluster_name
        )
    }
}

// ============================================================================
// TOKENS
// ============================================================================

/// Result of a single on-behalf-of exchange.
#[derive(Clone, PartialEq, Eq)]
pub struct ExchangedToken {
    pub token: String,
    pub expires_at: EpochMillis,
}

impl std::fmt::Debug for ExchangedToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExchangedToken")
            .field("token", &format!("[REDACTED, {} chars]", self.token.len()))
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

/// A downstream token held by a cache.
#[derive(Clone, PartialEq, Eq)]
pub struct CachedToken {
    pub token: String,
    pub expires_at: EpochMillis,
    pub refresh_token: Option<String>,
}

impl CachedToken {
    pub fn is_fresh(&self, now: EpochMillis, safety_buffer_ms: i64) -> bool {
        is_fresh(self.expires_at, now, safety_buffer_ms)
    }
}

impl From<ExchangedToken> for CachedToken {
    fn from(value: ExchangedToken) -> Self {
        Self {
            token: value.token,
            expires_at: value.expires_at,
            refresh_token: None,
        }
    }
}

impl std::fmt::Debug for CachedToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CachedToken")
            .field("token", &format!("[REDACTED, {} chars]", self.token.len()))
            .field("expires_at", &self.expires_at)
            .field("refresh_token", &self.refresh_token.as_ref().map(|_| "[REDACTED]"))
            .finish()
    }
}

/// Identity claims decoded (not verified) from a delegated token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CachedUserInfo {
    pub user_object_id: String,
    pub tenant_id: String,
    pub object_id: String,
    pub expires_at: EpochMillis,
}

/// An entry is usable only while `expires_at > now + safety_buffer_ms`.
pub fn is_fresh(expires_at: EpochMillis, now: EpochMillis, safety_buffer_ms: i64) -> bool {
    expires_at > now.saturating_add(safety_buffer_ms)
}
