//! Multi-tenant facade.
//!
//! Composes the management-token cache and the session cache behind one
//! handle and owns the process-wide shutdown wiring.

use crate::error::BootstrapError;
use crate::shutdown::{ShutdownCoordinator, ShutdownGuard, ShutdownSignals};
use kubecred_auth::{ArmTokenCache, OboTokenExchanger, TenantBoundaryPolicy};
use kubecred_core::{
    AuditLog, CacheStats, CachedToken, Clock, ClusterCredentialSource, CredentialError,
    CredentialResult, ErrorKind, MultiTenantConfig, ResourceId, SessionFactory, SystemClock,
    TokenExchanger, UserContext,
};
use kubecred_session::{
    ActiveFiles, ArmClusterCredentialClient, KubeconfigSessionFactory, SecureFileStore,
    SessionCache, SessionLease, SessionSources,
};
use std::path::PathBuf;
use std::sync::{Arc, Weak};
use tokio::task::JoinHandle;

/// Counters of both caches.
#[derive(Debug, Clone, PartialEq)]
pub struct FacadeStats {
    pub arm_tokens: CacheStats,
    pub sessions: CacheStats,
}

pub struct MultiTenantFacade {
    arm_tokens: Arc<ArmTokenCache>,
    sessions: Arc<SessionCache>,
    config: MultiTenantConfig,
    audit: AuditLog,
    shutdown: Arc<ShutdownCoordinator>,
    _guard: ShutdownGuard,
}

impl MultiTenantFacade {
    pub fn builder(config: MultiTenantConfig) -> FacadeBuilder {
        FacadeBuilder::new(config)
    }

    /// Production wiring: on-behalf-of exchange, the ARM control plane and
    /// file-backed sessions.
    pub fn from_config(config: MultiTenantConfig) -> Result<Self, BootstrapError> {
        config.validate()?;
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let exchanger = Arc::new(OboTokenExchanger::new(&config.azure, Arc::clone(&clock))?);
        let control_plane = Arc::new(ArmClusterCredentialClient::new(&config.azure)?);
        let facade = Self::builder(config)
            .clock(clock)
            .exchanger(exchanger)
            .control_plane(control_plane)
            .session_factory(Arc::new(KubeconfigSessionFactory::from_env()))
            .build()?;
        tracing::info!(
            credential_dir = %facade.config.storage.credential_dir.display(),
            max_cache_size = facade.config.cache.max_cache_size,
            audit = facade.audit.is_enabled(),
            "multi-tenant credential facade ready"
        );
        Ok(facade)
    }

    /// [`Self::from_config`] over [`MultiTenantConfig::from_env`].
    pub fn from_env() -> Result<Self, BootstrapError> {
        Self::from_config(MultiTenantConfig::from_env()?)
    }

    pub fn config(&self) -> &MultiTenantConfig {
        &self.config
    }

    /// Validate a delegated token and build the caller's context.
    pub async fn create_user_context(
        &self,
        delegated_token: &str,
        subscription_id: Option<&str>,
    ) -> CredentialResult<UserContext> {
        self.arm_tokens
            .create_user_context(delegated_token, subscription_id)
            .await
    }

    pub async fn get_arm_token(&self, user: &UserContext) -> CredentialResult<CachedToken> {
        self.arm_tokens.get_arm_token(user).await
    }

    /// Session for `user` on `resource`.
    ///
    /// # Errors
    /// `UnauthorizedSubscription` when the subscription is outside the
    /// allow-list, otherwise whatever [`SessionCache::get_or_create_session`]
    /// reports.
    pub async fn get_session(
        &self,
        user: &UserContext,
        resource: &ResourceId,
    ) -> CredentialResult<SessionLease> {
        let subscription_id = resource.subscription_id();
        if !self.config.security.is_subscription_allowed(subscription_id) {
            self.audit.denied(
                ErrorKind::UnauthorizedSubscription,
                user.tenant_id(),
                user.user_object_id(),
                Some(subscription_id),
            );
            return Err(CredentialError::unauthorized_subscription(subscription_id)
                .with_identity(user.user_object_id(), user.tenant_id()));
        }
        self.sessions.get_or_create_session(user, resource).await
    }

    /// Path of the credential file backing `user`'s session on `resource`.
    pub async fn get_kubeconfig_path(
        &self,
        user: &UserContext,
        resource: &ResourceId,
    ) -> CredentialResult<PathBuf> {
        Ok(self.get_session(user, resource).await?.credential_path)
    }

    pub async fn cleanup_tenant(&self, user: &UserContext, resource: &ResourceId) {
        self.sessions.cleanup_tenant(user, resource).await;
    }

    /// Release every session of a tenant and drop its management tokens.
    pub async fn cleanup_tenant_sessions(&self, tenant_id: &str) -> usize {
        let released = self.sessions.cleanup_tenant_sessions(tenant_id).await;
        self.arm_tokens.invalidate_tenant(tenant_id).await;
        released
    }

    pub async fn cleanup_all_tenants(&self) {
        self.sessions.cleanup_all_tenants().await;
        self.arm_tokens.clear().await;
    }

    pub async fn stats(&self) -> FacadeStats {
        FacadeStats {
            arm_tokens: self.arm_tokens.stats().await,
            sessions: self.sessions.stats().await,
        }
    }

    pub fn shutdown_coordinator(&self) -> &Arc<ShutdownCoordinator> {
        &self.shutdown
    }

    /// Run the synchronous shutdown hooks now.
    pub fn shutdown(&self) {
        self.shutdown.run();
    }

    /// On SIGINT or SIGTERM, release every session, run the shutdown hooks
    /// and exit the process with status 0.
    ///
    /// # Errors
    /// `Signals` if the handlers cannot be installed.
    pub fn install_signal_handlers(self: &Arc<Self>) -> Result<JoinHandle<()>, BootstrapError> {
        self.install_signal_handlers_with(AfterSignal::Exit(0))
    }

    /// Install the handlers now and spawn the task that waits on them. The
    /// task does not keep the facade alive.
    ///
    /// # Errors
    /// `Signals` if the handlers cannot be installed.
    pub fn install_signal_handlers_with(
        self: &Arc<Self>,
        after: AfterSignal,
    ) -> Result<JoinHandle<()>, BootstrapError> {
        let mut signals = ShutdownSignals::register().map_err(BootstrapError::Signals)?;
        let facade: Weak<Self> = Arc::downgrade(self);
        let coordinator = Arc::clone(&self.shutdown);
        Ok(tokio::spawn(async move {
            let signal = signals.recv().await;
            if let Some(facade) = facade.upgrade() {
                facade.cleanup_all_tenants().await;
            }
            let report = coordinator.run();
            if let AfterSignal::Exit(code) = after {
                tracing::info!(signal, code, failed_hooks = report.failed.len(), "exiting after shutdown");
                std::process::exit(code);
            }
        }))
    }
}

/// What the signal task does once cleanup has finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AfterSignal {
    /// Terminate the process with this status.
    Exit(i32),
    /// Finish the task and leave the process running.
    Return,
}

impl std::fmt::Debug for MultiTenantFacade {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MultiTenantFacade")
            .field("config", &self.config)
            .field("shutdown", &self.shutdown)
            .finish()
    }
}

// ============================================================================
// BUILDER
// ============================================================================

/// Assembles a [`MultiTenantFacade`] from collaborators.
///
/// The exchanger, control plane and session factory are required; the clock
/// defaults to [`SystemClock`] and the tenant boundary policy to permissive.
pub struct FacadeBuilder {
    config: MultiTenantConfig,
    clock: Arc<dyn Clock>,
    exchanger: Option<Arc<dyn TokenExchanger>>,
    control_plane: Option<Arc<dyn ClusterCredentialSource>>,
    session_factory: Option<Arc<dyn SessionFactory>>,
    boundary: Option<Arc<dyn TenantBoundaryPolicy>>,
    active_files: Option<Arc<ActiveFiles>>,
}

impl FacadeBuilder {
    pub fn new(config: MultiTenantConfig) -> Self {
        Self {
            config,
            clock: Arc::new(SystemClock),
            exchanger: None,
            control_plane: None,
            session_factory: None,
            boundary: None,
            active_files: None,
        }
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn exchanger(mut self, exchanger: Arc<dyn TokenExchanger>) -> Self {
        self.exchanger = Some(exchanger);
        self
    }

    pub fn control_plane(mut self, control_plane: Arc<dyn ClusterCredentialSource>) -> Self {
        self.control_plane = Some(control_plane);
        self
    }

    pub fn session_factory(mut self, factory: Arc<dyn SessionFactory>) -> Self {
        self.session_factory = Some(factory);
        self
    }

    pub fn boundary_policy(mut self, boundary: Arc<dyn TenantBoundaryPolicy>) -> Self {
        self.boundary = Some(boundary);
        self
    }

    /// Share an active-file set with other stores in the process.
    pub fn active_files(mut self, active: Arc<ActiveFiles>) -> Self {
        self.active_files = Some(active);
        self
    }

    pub fn build(self) -> Result<MultiTenantFacade, BootstrapError> {
        let exchanger = self.exchanger.ok_or(BootstrapError::MissingComponent("exchanger"))?;
        let control_plane = self
            .control_plane
            .ok_or(BootstrapError::MissingComponent("control_plane"))?;
        let session_factory = self
            .session_factory
            .ok_or(BootstrapError::MissingComponent("session_factory"))?;
        let config = self.config;

        let mut arm_tokens = ArmTokenCache::new(
            Arc::clone(&exchanger),
            Arc::clone(&self.clock),
            config.cache.clone(),
            config.security.clone(),
        );
        if let Some(boundary) = self.boundary {
            arm_tokens = arm_tokens.with_boundary_policy(boundary);
        }
        let arm_tokens = Arc::new(arm_tokens);

        let active = self.active_files.unwrap_or_else(|| Arc::new(ActiveFiles::new()));
        let store = Arc::new(SecureFileStore::new(&config.storage, active));
        let sessions = Arc::new(SessionCache::new(
            SessionSources {
                exchanger,
                arm_tokens: Arc::clone(&arm_tokens),
                control_plane,
                sessions: session_factory,
                store,
                clock: self.clock,
            },
            config.cache.clone(),
            &config.security,
        ));

        let shutdown = Arc::new(ShutdownCoordinator::new());
        {
            let sessions = Arc::clone(&sessions);
            shutdown.register("session-cache", move || {
                let deleted = sessions.shutdown_sweep();
                tracing::info!(deleted, "credential files removed");
            });
        }
        {
            let arm_tokens = Arc::clone(&arm_tokens);
            shutdown.register("arm-token-cache", move || arm_tokens.purge());
        }

        Ok(MultiTenantFacade {
            audit: AuditLog::new(config.security.audit_log_enabled),
            arm_tokens,
            sessions,
            config,
            _guard: ShutdownGuard::new(Arc::clone(&shutdown)),
            shutdown,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kubecred_core::clock::test_clocks;
    use kubecred_core::{ClientCredential, ManualClock, CLUSTER_SCOPE};
    use kubecred_test_utils::{
        fixtures, mint_delegated_token, MockClusterSource, MockTokenExchanger, RecordingSessionFactory,
    };
    use std::collections::HashSet;
    use std::path::Path;

    struct Fixture {
        dir: tempfile::TempDir,
        exchanger: Arc<MockTokenExchanger>,
        control_plane: Arc<MockClusterSource>,
        sessions: Arc<RecordingSessionFactory>,
        facade: MultiTenantFacade,
    }

    fn fixture_with(configure: impl FnOnce(&mut MultiTenantConfig)) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let mut config = MultiTenantConfig::new("client", "home-tenant", ClientCredential::secret("s"));
        config.storage.credential_dir = dir.path().to_path_buf();
        configure(&mut config);

        let clock: Arc<ManualClock> = Arc::new(test_clocks::baseline());
        let exchanger = Arc::new(MockTokenExchanger::new(clock.clone()));
        let control_plane = Arc::new(MockClusterSource::new(fixtures::aks_user_kubeconfig()));
        let sessions = Arc::new(RecordingSessionFactory::new());
        let facade = MultiTenantFacade::builder(config)
            .clock(clock)
            .exchanger(exchanger.clone())
            .control_plane(control_plane.clone())
            .session_factory(sessions.clone())
            .build()
            .unwrap();

        Fixture {
            dir,
            exchanger,
            control_plane,
            sessions,
            facade,
        }
    }

    fn fixture() -> Fixture {
        fixture_with(|_| {})
    }

    fn cluster(sub: &str, name: &str) -> ResourceId {
        ResourceId::new(sub, "rg", name).unwrap()
    }

    fn file_count(dir: &Path) -> usize {
        std::fs::read_dir(dir).unwrap().count()
    }

    fn delegated(oid: &str, tid: &str) -> String {
        let exp = test_clocks::BASELINE_MILLIS / 1000 + 3600;
        mint_delegated_token(oid, tid, exp)
    }

    #[tokio::test]
    async fn test_user_context_then_session() {
        let f = fixture();
        let user = f
            .facade
            .create_user_context(&delegated("user-1", "tenant-1"), Some("sub-1"))
            .await
            .unwrap();
        assert_eq!(user.tenant_id(), "tenant-1");

        let path = f
            .facade
            .get_kubeconfig_path(&user, &cluster("sub-1", "aks"))
            .await
            .unwrap();
        assert!(path.starts_with(f.dir.path()));
        assert!(path.exists());
        assert_eq!(f.exchanger.calls_for(CLUSTER_SCOPE), 1);
    }

    #[tokio::test]
    async fn test_disallowed_subscription_rejected_before_any_io() {
        let f = fixture_with(|config| {
            config.security.allowed_subscriptions = Some(HashSet::from(["sub-ok".to_string()]));
        });
        let user = UserContext::new("u", "t", "delegated");
        let err = f
            .facade
            .get_session(&user, &cluster("sub-other", "aks"))
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::UnauthorizedSubscription);
        assert_eq!(err.tenant_id.as_deref(), Some("t"));
        assert_eq!(f.exchanger.total_calls(), 0);
        assert_eq!(f.control_plane.calls(), 0);
    }

    #[tokio::test]
    async fn test_cleanup_tenant_sessions_drops_tokens_too() {
        let f = fixture();
        let a = UserContext::new("u", "tenant-a", "delegated");
        let b = UserContext::new("u", "tenant-b", "delegated");
        f.facade.get_session(&a, &cluster("s", "one")).await.unwrap();
        f.facade.get_session(&b, &cluster("s", "one")).await.unwrap();

        assert_eq!(f.facade.cleanup_tenant_sessions("tenant-a").await, 1);
        assert_eq!(file_count(f.dir.path()), 1);

        let stats = f.facade.stats().await;
        assert_eq!(stats.arm_tokens.entry_count, 1);
        assert_eq!(stats.sessions.entry_count, 1);
    }

    #[tokio::test]
    async fn test_cleanup_all_tenants_removes_everything() {
        let f = fixture();
        let user = UserContext::new("u", "t", "delegated");
        for name in ["one", "two"] {
            f.facade.get_session(&user, &cluster("s", name)).await.unwrap();
        }
        f.facade.cleanup_all_tenants().await;

        assert_eq!(file_count(f.dir.path()), 0);
        assert_eq!(f.sessions.total_cleanups(), 2);
        let stats = f.facade.stats().await;
        assert_eq!(stats.arm_tokens.entry_count, 0);
        assert_eq!(stats.sessions.entry_count, 0);
    }

    #[tokio::test]
    async fn test_shutdown_deletes_three_tracked_files() {
        let f = fixture();
        let user = UserContext::new("u", "t", "delegated");
        for name in ["one", "two", "three"] {
            f.facade.get_session(&user, &cluster("s", name)).await.unwrap();
        }
        assert_eq!(file_count(f.dir.path()), 3);

        f.facade.shutdown();
        f.facade.shutdown();

        assert_eq!(file_count(f.dir.path()), 0);
        assert!(f.facade.shutdown_coordinator().is_done());
    }

    #[tokio::test]
    async fn test_session_after_shutdown_is_refused() {
        let f = fixture();
        let user = UserContext::new("u", "t", "delegated");
        f.facade.shutdown();

        let err = f
            .facade
            .get_session(&user, &cluster("s", "late"))
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::TempFileCreationFailed);
        assert_eq!(f.control_plane.calls(), 0);

        let Fixture { dir, facade, .. } = f;
        drop(facade);
        assert_eq!(file_count(dir.path()), 0);
    }

    #[tokio::test]
    async fn test_signal_task_registers_without_firing() {
        let f = fixture();
        let facade = Arc::new(f.facade);
        let handle = facade.install_signal_handlers_with(AfterSignal::Return).unwrap();
        tokio::task::yield_now().await;

        assert!(!handle.is_finished());
        assert!(!facade.shutdown_coordinator().is_done());
        handle.abort();
    }

    #[tokio::test]
    async fn test_dropping_facade_deletes_files() {
        let f = fixture();
        let user = UserContext::new("u", "t", "delegated");
        let path = f
            .facade
            .get_kubeconfig_path(&user, &cluster("s", "aks"))
            .await
            .unwrap();
        let Fixture { dir, facade, .. } = f;

        drop(facade);

        assert!(!path.exists());
        assert_eq!(file_count(dir.path()), 0);
    }

    #[test]
    fn test_builder_requires_collaborators() {
        let config = MultiTenantConfig::new("c", "t", ClientCredential::secret("s"));
        let err = MultiTenantFacade::builder(config).build().unwrap_err();
        assert!(matches!(err, BootstrapError::MissingComponent("exchanger")));
    }

    #[test]
    fn test_from_config_rejects_invalid_config() {
        let mut config = MultiTenantConfig::new("c", "t", ClientCredential::secret("s"));
        config.cache.max_cache_size = 0;
        let err = MultiTenantFacade::from_config(config).unwrap_err();
        assert!(matches!(err, BootstrapError::Config(_)));
    }
}
