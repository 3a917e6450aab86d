//! Error types for kubecred.
//!
//! Every public operation surfaces exactly one [`ErrorKind`]. The low-level
//! `detail` is for internal and audit logs only; callers facing an agent or
//! end user should render [`CredentialError::public_message`] instead.

use serde::{Deserialize, Serialize};
use thiserror::Error;

// ============================================================================
// ERROR KIND ENUM
// ============================================================================

/// Categories of credential failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    /// Subscription is not on the configured allow-list
    UnauthorizedSubscription,

    /// Control plane refused access to the cluster (403/404)
    InvalidClusterAccess,

    /// A downstream token could not be obtained
    TokenAcquisitionFailed,

    /// Tenant boundary policy rejected the request
    TenantBoundaryViolation,

    /// Cluster credential document could not be fetched or rewritten
    KubeconfigGenerationFailed,

    /// Delegated token is malformed, incomplete, or expired
    JwtValidationFailed,

    /// On-behalf-of exchange with the identity provider failed
    AzureOboFailed,

    /// Credential file could not be written securely
    TempFileCreationFailed,
}

impl ErrorKind {
    /// Sanitized message safe to show outside the process.
    pub fn public_message(&self) -> &'static str {
        match self {
            ErrorKind::UnauthorizedSubscription => "Access denied to the specified subscription",
            ErrorKind::InvalidClusterAccess => "Access denied to the specified cluster",
            ErrorKind::TokenAcquisitionFailed => "Authentication failed",
            ErrorKind::TenantBoundaryViolation => "Operation not allowed across tenant boundaries",
            ErrorKind::KubeconfigGenerationFailed => "Failed to configure cluster access",
            ErrorKind::JwtValidationFailed => "Invalid authentication token",
            ErrorKind::AzureOboFailed => "Azure authentication failed",
            ErrorKind::TempFileCreationFailed => "System configuration error",
        }
    }

    /// Stable wire name, e.g. `AZURE_OBO_FAILED`.
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::UnauthorizedSubscription => "UNAUTHORIZED_SUBSCRIPTION",
            ErrorKind::InvalidClusterAccess => "INVALID_CLUSTER_ACCESS",
            ErrorKind::TokenAcquisitionFailed => "TOKEN_ACQUISITION_FAILED",
            ErrorKind::TenantBoundaryViolation => "TENANT_BOUNDARY_VIOLATION",
            ErrorKind::KubeconfigGenerationFailed => "KUBECONFIG_GENERATION_FAILED",
            ErrorKind::JwtValidationFailed => "JWT_VALIDATION_FAILED",
            ErrorKind::AzureOboFailed => "AZURE_OBO_FAILED",
            ErrorKind::TempFileCreationFailed => "TEMP_FILE_CREATION_FAILED",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// CREDENTIAL ERROR
// ============================================================================

/// A classified credential failure.
///
/// Cloneable so a single failed exchange can be handed to every caller that
/// joined it.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{kind}: {detail}")]
pub struct CredentialError {
    pub kind: ErrorKind,
    pub detail: String,
    pub user_object_id: Option<String>,
    pub tenant_id: Option<String>,
}

impl CredentialError {
    pub fn new(kind: ErrorKind, detail: impl Into<String>) -> Self {
        Self {
            kind,
            detail: detail.into(),
            user_object_id: None,
            tenant_id: None,
        }
    }

    /// Attach the caller identity. Existing ids are kept.
    pub fn with_identity(mut self, user_object_id: &str, tenant_id: &str) -> Self {
        if self.user_object_id.is_none() {
            self.user_object_id = Some(user_object_id.to_string());
        }
        if self.tenant_id.is_none() {
            self.tenant_id = Some(tenant_id.to_string());
        }
        self
    }

    /// Re-classify a collaborator failure, preserving its detail and identity.
    pub fn rewrap(self, kind: ErrorKind) -> Self {
        Self {
            kind,
            detail: format!("{}: {}", self.kind, self.detail),
            ..self
        }
    }

    pub fn public_message(&self) -> &'static str {
        self.kind.public_message()
    }

    // ========================================================================
    // Convenience constructors
    // ========================================================================

    pub fn unauthorized_subscription(subscription_id: &str) -> Self {
        Self::new(
            ErrorKind::UnauthorizedSubscription,
            format!("subscription {subscription_id} is not in the allow-list"),
        )
    }

    pub fn invalid_cluster_access(detail: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidClusterAccess, detail)
    }

    pub fn token_acquisition_failed(detail: impl Into<String>) -> Self {
        Self::new(ErrorKind::TokenAcquisitionFailed, detail)
    }

    pub fn tenant_boundary_violation(detail: impl Into<String>) -> Self {
        Self::new(ErrorKind::TenantBoundaryViolation, detail)
    }

    pub fn kubeconfig_generation_failed(detail: impl Into<String>) -> Self {
        Self::new(ErrorKind::KubeconfigGenerationFailed, detail)
    }

    pub fn jwt_validation_failed(detail: impl Into<String>) -> Self {
        Self::new(ErrorKind::JwtValidationFailed, detail)
    }

    pub fn azure_obo_failed(detail: impl Into<String>) -> Self {
        Self::new(ErrorKind::AzureOboFailed, detail)
    }

    pub fn temp_file_creation_failed(detail: impl Into<String>) -> Self {
        Self::new(ErrorKind::TempFileCreationFailed, detail)
    }
}

/// Result type alias for credential operations.
pub type CredentialResult<T> = Result<T, CredentialError>;

// ============================================================================
// CONFIG ERROR
// ============================================================================

/// Startup configuration errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Missing required configuration field: {field}")]
    MissingRequired { field: String },

    #[error("Invalid value for {field}: {value} - {reason}")]
    InvalidValue {
        field: String,
        value: String,
        reason: String,
    },

    #[error("Incompatible options: {option_a} and {option_b}")]
    IncompatibleOptions { option_a: String, option_b: String },
}
