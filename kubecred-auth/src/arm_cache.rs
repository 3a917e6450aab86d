//! Management-token cache.
//!
//! One management-plane token per (tenant, user), bounded LRU, with
//! concurrent misses for the same key coalesced into one exchange.

use crate::boundary::{PermissiveBoundaryPolicy, TenantBoundaryPolicy};
use crate::claims;
use kubecred_core::{
    AuditAction, AuditLog, CacheCounters, CacheKey, CacheSettings, CacheStats, CachedToken,
    CachedUserInfo, Clock, CredentialError, CredentialResult, ErrorKind, FlightRole,
    SecuritySettings, SingleFlight, TokenExchanger, UserContext, MANAGEMENT_SCOPE,
};
use moka::future::Cache;
use moka::policy::EvictionPolicy;
use moka::notification::RemovalCause;
use std::sync::Arc;

/// Caches management tokens obtained through on-behalf-of exchange.
pub struct ArmTokenCache {
    exchanger: Arc<dyn TokenExchanger>,
    boundary: Arc<dyn TenantBoundaryPolicy>,
    cache: Cache<CacheKey, CachedToken>,
    flights: SingleFlight<CachedToken, CredentialError>,
    counters: Arc<CacheCounters>,
    clock: Arc<dyn Clock>,
    settings: CacheSettings,
    security: SecuritySettings,
    audit: AuditLog,
}

impl ArmTokenCache {
    pub fn new(
        exchanger: Arc<dyn TokenExchanger>,
        clock: Arc<dyn Clock>,
        settings: CacheSettings,
        security: SecuritySettings,
    ) -> Self {
        let counters = Arc::new(CacheCounters::default());
        let listener_counters = Arc::clone(&counters);
        let cache = Cache::builder()
            .max_capacity(settings.max_cache_size)
            .eviction_policy(EvictionPolicy::lru())
            .eviction_listener(move |key: Arc<CacheKey>, _value, cause| {
                if cause == RemovalCause::Size {
                    listener_counters.record_eviction();
                    tracing::debug!(cache_key = %key, "management token evicted");
                }
            })
            .build();

        Self {
            exchanger,
            boundary: Arc::new(PermissiveBoundaryPolicy),
            cache,
            flights: SingleFlight::new(),
            counters,
            clock,
            audit: AuditLog::new(security.audit_log_enabled),
            settings,
            security,
        }
    }

    /// Replace the tenant boundary policy (permissive by default).
    pub fn with_boundary_policy(mut self, boundary: Arc<dyn TenantBoundaryPolicy>) -> Self {
        self.boundary = boundary;
        self
    }

    /// Management token for `user`, from cache when fresh.
    ///
    /// # Errors
    /// `TokenAcquisitionFailed` carrying the caller's ids. Failures are not cached.
    pub async fn get_arm_token(&self, user: &UserContext) -> CredentialResult<CachedToken> {
        let key = CacheKey::arm_for(user);
        let now = self.clock.now_epoch_millis();

        if let Some(cached) = self.cache.get(&key).await {
            if cached.is_fresh(now, self.settings.safety_buffer_ms()) {
                self.counters.record_hit();
                tracing::trace!(cache_key = %key, "management token cache hit");
                return Ok(cached);
            }
        }
        self.counters.record_miss();

        let (result, role) = self
            .flights
            .run(key.as_str(), || self.acquire(key.clone(), user.clone()))
            .await;
        if role == FlightRole::Joined {
            self.counters.record_coalesced();
        }
        result
    }

    /// The leader's work: exchange, then write through before the flight ends.
    fn acquire(
        &self,
        key: CacheKey,
        user: UserContext,
    ) -> impl std::future::Future<Output = CredentialResult<CachedToken>> + Send + 'static {
        let exchanger = Arc::clone(&self.exchanger);
        let cache = self.cache.clone();
        let counters = Arc::clone(&self.counters);
        let clock = Arc::clone(&self.clock);
        let token_ttl_ms = self.settings.token_ttl_ms();
        let audit = self.audit;

        async move {
            counters.record_fetch();
            tracing::debug!(cache_key = %key, "acquiring management token");

            let exchanged = exchanger
                .exchange(user.access_token(), MANAGEMENT_SCOPE, user.tenant_id())
                .await
                .map_err(|e| {
                    counters.record_failure();
                    tracing::warn!(
                        tenant_id = user.tenant_id(),
                        user_object_id = user.user_object_id(),
                        error_kind = %e.kind,
                        "failed to acquire management token"
                    );
                    CredentialError::token_acquisition_failed(format!(
                        "Failed to acquire ARM token: {}",
                        e
                    ))
                    .with_identity(user.user_object_id(), user.tenant_id())
                })?;

            let now = clock.now_epoch_millis();
            let token = CachedToken {
                expires_at: exchanged.expires_at.min(now + token_ttl_ms),
                token: exchanged.token,
                refresh_token: None,
            };
            cache.insert(key, token.clone()).await;
            audit.record(
                AuditAction::TokenAcquired,
                user.tenant_id(),
                user.user_object_id(),
                Some("arm"),
            );
            Ok::<_, CredentialError>(token)
        }
    }

    /// Decode identity claims from a delegated token (signature not verified).
    pub fn extract_user_info(&self, delegated_token: &str) -> CredentialResult<CachedUserInfo> {
        claims::extract_user_info(delegated_token, self.clock.now_epoch_millis())
    }

    /// True iff the token decodes to a complete, unexpired identity.
    pub fn validate_jwt_token(&self, delegated_token: &str) -> bool {
        self.extract_user_info(delegated_token)
            .map(|info| info.expires_at > self.clock.now_epoch_millis())
            .unwrap_or(false)
    }

    /// Validate a delegated token and build the caller's context.
    ///
    /// When `subscription_id` is given the allow-list and the tenant boundary
    /// policy are both consulted, in that order.
    pub async fn create_user_context(
        &self,
        delegated_token: &str,
        subscription_id: Option<&str>,
    ) -> CredentialResult<UserContext> {
        let info = self
            .extract_user_info(delegated_token)
            .map_err(|e| CredentialError::jwt_validation_failed(format!("Invalid or expired JWT token: {}", e.detail)))?;

        let user = UserContext::new(info.user_object_id, info.tenant_id, delegated_token);

        if let Some(subscription_id) = subscription_id {
            if !self.security.is_subscription_allowed(subscription_id) {
                self.audit.denied(
                    ErrorKind::UnauthorizedSubscription,
                    user.tenant_id(),
                    user.user_object_id(),
                    Some(subscription_id),
                );
                return Err(CredentialError::unauthorized_subscription(subscription_id)
                    .with_identity(user.user_object_id(), user.tenant_id()));
            }

            let allowed = self
                .boundary
                .allows(&user, subscription_id)
                .await
                .map_err(|e| e.with_identity(user.user_object_id(), user.tenant_id()))?;
            if !allowed {
                self.audit.denied(
                    ErrorKind::TenantBoundaryViolation,
                    user.tenant_id(),
                    user.user_object_id(),
                    Some(subscription_id),
                );
                return Err(CredentialError::tenant_boundary_violation(format!(
                    "subscription {subscription_id} is outside tenant {}",
                    user.tenant_id()
                ))
                .with_identity(user.user_object_id(), user.tenant_id()));
            }
        }

        self.audit.record(
            AuditAction::UserContextCreated,
            user.tenant_id(),
            user.user_object_id(),
            subscription_id,
        );
        Ok(user)
    }

    /// Drop every cached token of `tenant_id`.
    pub async fn invalidate_tenant(&self, tenant_id: &str) {
        let keys: Vec<Arc<CacheKey>> = self
            .cache
            .iter()
            .filter(|(key, _)| key.tenant_id() == tenant_id)
            .map(|(key, _)| key)
            .collect();
        for key in keys {
            self.cache.invalidate(key.as_ref()).await;
        }
    }

    /// Drop every cached token.
    pub async fn clear(&self) {
        self.cache.invalidate_all();
        self.cache.run_pending_tasks().await;
    }

    /// Synchronous variant of [`Self::clear`] for shutdown hooks. Removal is
    /// applied lazily but no entry is served afterwards.
    pub fn purge(&self) {
        self.cache.invalidate_all();
    }

    pub async fn stats(&self) -> CacheStats {
        self.cache.run_pending_tasks().await;
        self.counters.snapshot(self.cache.entry_count())
    }
}
