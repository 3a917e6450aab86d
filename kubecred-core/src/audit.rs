//! Security audit events.
//!
//! Events go to the `kubecred::audit` tracing target so a subscriber can
//! route them separately. Only identifiers and error kinds are recorded,
//! never token material or upstream error text.

use crate::error::ErrorKind;

pub const AUDIT_TARGET: &str = "kubecred::audit";

/// What happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuditAction {
    UserContextCreated,
    TokenAcquired,
    SessionCreated,
    SessionReleased,
    AccessDenied,
}

impl AuditAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditAction::UserContextCreated => "user_context_created",
            AuditAction::TokenAcquired => "token_acquired",
            AuditAction::SessionCreated => "session_created",
            AuditAction::SessionReleased => "session_released",
            AuditAction::AccessDenied => "access_denied",
        }
    }
}

/// Audit event sink, a no-op unless enabled.
#[derive(Debug, Clone, Copy, Default)]
pub struct AuditLog {
    enabled: bool,
}

impl AuditLog {
    pub fn new(enabled: bool) -> Self {
        Self { enabled }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn record(&self, action: AuditAction, tenant_id: &str, user_object_id: &str, resource: Option<&str>) {
        if !self.enabled {
            return;
        }
        tracing::info!(
            target: AUDIT_TARGET,
            action = action.as_str(),
            tenant_id,
            user_object_id,
            resource = resource.unwrap_or("-"),
            "audit"
        );
    }

    pub fn denied(&self, kind: ErrorKind, tenant_id: &str, user_object_id: &str, resource: Option<&str>) {
        if !self.enabled {
            return;
        }
        tracing::warn!(
            target: AUDIT_TARGET,
            action = AuditAction::AccessDenied.as_str(),
            error_kind = kind.as_str(),
            tenant_id,
            user_object_id,
            resource = resource.unwrap_or("-"),
            "audit"
        );
    }
}
