//! Per-tenant cluster session cache.
//!
//! One session per (tenant, user, subscription, resource group, cluster).
//! A miss exchanges a cluster token and obtains a management token
//! concurrently, fetches the cluster credential document, rewrites its
//! identity, persists it as a secure file and opens a session over it.
//!
//! Every removal path (LRU eviction, replacement on refresh, explicit
//! cleanup, shutdown) releases the session and its file exactly once.
//!
//! A creation that is still running when the cache is cleared or shut down
//! releases what it built instead of publishing it. After shutdown no new
//! session is created.

use crate::kubeconfig;
use crate::secure_file::{FileLease, SecureFileStore};
use futures_util::FutureExt;
use kubecred_auth::ArmTokenCache;
use kubecred_core::{
    is_fresh, AuditAction, AuditLog, CacheCounters, CacheKey, CacheSettings, CacheStats,
    Clock, ClusterCredentialSource, CredentialError, CredentialResult, EpochMillis, ErrorKind,
    FlightRole, ResourceId, SecuritySettings, SessionFactory, SessionHandle, SingleFlight,
    TokenExchanger, UserContext, CLUSTER_SCOPE,
};
use moka::future::Cache;
use moka::notification::RemovalCause;
use moka::policy::EvictionPolicy;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

// ============================================================================
// ENTRIES
// ============================================================================

/// What a caller receives for a cluster.
#[derive(Debug, Clone)]
pub struct SessionLease {
    pub credential_path: PathBuf,
    pub session: Arc<dyn SessionHandle>,
    pub expires_at: EpochMillis,
}

/// A cached session and the credential file it owns.
#[derive(Debug)]
pub struct SessionEntry {
    file: FileLease,
    session: Arc<dyn SessionHandle>,
    expires_at: EpochMillis,
    released: AtomicBool,
    tenant_id: String,
    user_object_id: String,
    resource: String,
    audit: AuditLog,
}

impl SessionEntry {
    pub fn credential_path(&self) -> &Path {
        self.file.path()
    }

    pub fn expires_at(&self) -> EpochMillis {
        self.expires_at
    }

    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::SeqCst)
    }

    fn lease(&self) -> SessionLease {
        SessionLease {
            credential_path: self.file.path().to_path_buf(),
            session: Arc::clone(&self.session),
            expires_at: self.expires_at,
        }
    }

    /// Close the session and give up the file. Only the first call acts.
    pub async fn release(&self) {
        if self.released.swap(true, Ordering::SeqCst) {
            return;
        }
        self.session.cleanup().await;
        self.file.release();
        self.audit.record(
            AuditAction::SessionReleased,
            &self.tenant_id,
            &self.user_object_id,
            Some(&self.resource),
        );
    }
}

// ============================================================================
// SESSION CACHE
// ============================================================================

/// Collaborators a [`SessionCache`] needs.
pub struct SessionSources {
    pub exchanger: Arc<dyn TokenExchanger>,
    pub arm_tokens: Arc<ArmTokenCache>,
    pub control_plane: Arc<dyn ClusterCredentialSource>,
    pub sessions: Arc<dyn SessionFactory>,
    pub store: Arc<SecureFileStore>,
    pub clock: Arc<dyn Clock>,
}

pub struct SessionCache {
    sources: Arc<SessionSources>,
    cache: Cache<CacheKey, Arc<SessionEntry>>,
    flights: SingleFlight<Arc<SessionEntry>, CredentialError>,
    counters: Arc<CacheCounters>,
    settings: CacheSettings,
    max_session_age_ms: i64,
    audit: AuditLog,
    /// Set once by [`SessionCache::shutdown_sweep`].
    closed: Arc<AtomicBool>,
    /// Bumped by every full clear; creations started earlier are discarded.
    epoch: Arc<AtomicU64>,
}

impl SessionCache {
    pub fn new(sources: SessionSources, settings: CacheSettings, security: &SecuritySettings) -> Self {
        let counters = Arc::new(CacheCounters::default());
        let listener_counters = Arc::clone(&counters);
        let cache = Cache::builder()
            .max_capacity(settings.max_cache_size)
            .eviction_policy(EvictionPolicy::lru())
            .async_eviction_listener(move |key: Arc<CacheKey>, entry: Arc<SessionEntry>, cause| {
                if cause == RemovalCause::Size {
                    listener_counters.record_eviction();
                }
                async move {
                    tracing::debug!(cache_key = %key, ?cause, "session entry removed");
                    entry.release().await;
                }
                .boxed()
            })
            .build();

        Self {
            sources: Arc::new(sources),
            cache,
            flights: SingleFlight::new(),
            counters,
            settings,
            max_session_age_ms: security.max_kubeconfig_age_ms(),
            audit: AuditLog::new(security.audit_log_enabled),
            closed: Arc::new(AtomicBool::new(false)),
            epoch: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Session for `user` on `resource`, from cache when fresh.
    ///
    /// # Errors
    /// - `TokenAcquisitionFailed` if either token cannot be obtained
    /// - `InvalidClusterAccess` if the control plane refuses the cluster
    /// - `KubeconfigGenerationFailed` if the document is unusable
    /// - `TempFileCreationFailed` if the credential file cannot be written
    ///   or the cache has been shut down
    /// - `KubeconfigGenerationFailed` if a cleanup released the session
    ///   before it was ready
    pub async fn get_or_create_session(
        &self,
        user: &UserContext,
        resource: &ResourceId,
    ) -> CredentialResult<SessionLease> {
        if self.is_closed() {
            return Err(shut_down().with_identity(user.user_object_id(), user.tenant_id()));
        }
        let key = CacheKey::kubeconfig_for(user, resource);
        let now = self.sources.clock.now_epoch_millis();

        if let Some(entry) = self.cache.get(&key).await {
            if !entry.is_released() && is_fresh(entry.expires_at, now, self.settings.safety_buffer_ms()) {
                self.counters.record_hit();
                tracing::trace!(cache_key = %key, "session cache hit");
                return Ok(entry.lease());
            }
        }
        self.counters.record_miss();

        let (result, role) = self
            .flights
            .run(key.as_str(), || self.create(key.clone(), user.clone(), resource.clone()))
            .await;
        if role == FlightRole::Joined {
            self.counters.record_coalesced();
        }
        result.map(|entry| entry.lease())
    }

    /// The leader's work for one key. Inserts into the cache before the
    /// flight settles, then takes the entry back out if a clear or shutdown
    /// happened meanwhile.
    fn create(
        &self,
        key: CacheKey,
        user: UserContext,
        resource: ResourceId,
    ) -> impl std::future::Future<Output = CredentialResult<Arc<SessionEntry>>> + Send + 'static {
        let sources = Arc::clone(&self.sources);
        let cache = self.cache.clone();
        let counters = Arc::clone(&self.counters);
        let max_age_ms = self.max_session_age_ms;
        let audit = self.audit;
        let closed = Arc::clone(&self.closed);
        let epoch = Arc::clone(&self.epoch);
        let started_in = epoch.load(Ordering::SeqCst);

        async move {
            counters.record_fetch();
            tracing::debug!(cache_key = %key, "creating cluster session");

            let entry = build_entry(&sources, &user, &resource, max_age_ms, audit)
                .await
                .map_err(|e| {
                    counters.record_failure();
                    tracing::warn!(
                        tenant_id = user.tenant_id(),
                        user_object_id = user.user_object_id(),
                        resource = %resource,
                        error_kind = %e.kind,
                        "failed to create cluster session"
                    );
                    audit.denied(
                        e.kind,
                        user.tenant_id(),
                        user.user_object_id(),
                        Some(&resource.to_string()),
                    );
                    e.with_identity(user.user_object_id(), user.tenant_id())
                })?;

            let entry = Arc::new(entry);
            cache.insert(key.clone(), Arc::clone(&entry)).await;

            let shut = closed.load(Ordering::SeqCst);
            if shut || epoch.load(Ordering::SeqCst) != started_in {
                if cache.get(&key).await.is_some_and(|current| Arc::ptr_eq(&current, &entry)) {
                    cache.invalidate(&key).await;
                }
                entry.release().await;
                tracing::info!(cache_key = %key, shut_down = shut, "session finished after cleanup, released");
                let err = if shut {
                    shut_down()
                } else {
                    CredentialError::kubeconfig_generation_failed("session was released by a cleanup before it was ready")
                };
                return Err(err.with_identity(user.user_object_id(), user.tenant_id()));
            }

            audit.record(
                AuditAction::SessionCreated,
                user.tenant_id(),
                user.user_object_id(),
                Some(&resource.to_string()),
            );
            Ok::<_, CredentialError>(entry)
        }
    }

    /// Release the session of `user` on `resource`, if cached.
    pub async fn cleanup_tenant(&self, user: &UserContext, resource: &ResourceId) {
        let key = CacheKey::kubeconfig_for(user, resource);
        if let Some(entry) = self.cache.remove(&key).await {
            entry.release().await;
        }
    }

    /// Release every session belonging to `tenant_id`. Returns how many.
    pub async fn cleanup_tenant_sessions(&self, tenant_id: &str) -> usize {
        let keys: Vec<Arc<CacheKey>> = self
            .cache
            .iter()
            .filter(|(key, _)| key.tenant_id() == tenant_id)
            .map(|(key, _)| key)
            .collect();
        let mut released = 0;
        for key in keys {
            if let Some(entry) = self.cache.remove(key.as_ref()).await {
                entry.release().await;
                released += 1;
            }
        }
        released
    }

    /// Release every cached session. Creations already running are
    /// discarded when they finish.
    pub async fn cleanup_all_tenants(&self) {
        self.epoch.fetch_add(1, Ordering::SeqCst);
        self.flights.forget_all().await;
        let entries: Vec<Arc<SessionEntry>> = self.cache.iter().map(|(_, entry)| entry).collect();
        let count = entries.len();
        for entry in entries {
            entry.release().await;
        }
        self.cache.invalidate_all();
        self.cache.run_pending_tasks().await;
        tracing::info!(sessions = count, "all cluster sessions released");
    }

    /// Best-effort synchronous teardown: refuse further sessions, delete
    /// every tracked file and drop all entries. Sessions are not awaited.
    pub fn shutdown_sweep(&self) -> usize {
        self.closed.store(true, Ordering::SeqCst);
        self.epoch.fetch_add(1, Ordering::SeqCst);
        let deleted = self.sources.store.active_files().sweep();
        self.cache.invalidate_all();
        deleted
    }

    pub async fn stats(&self) -> CacheStats {
        self.cache.run_pending_tasks().await;
        self.counters.snapshot(self.cache.entry_count())
    }

    pub fn store(&self) -> &Arc<SecureFileStore> {
        &self.sources.store
    }

    pub fn arm_tokens(&self) -> &Arc<ArmTokenCache> {
        &self.sources.arm_tokens
    }
}

fn shut_down() -> CredentialError {
    CredentialError::temp_file_creation_failed("session cache is shut down")
}

async fn build_entry(
    sources: &SessionSources,
    user: &UserContext,
    resource: &ResourceId,
    max_age_ms: i64,
    audit: AuditLog,
) -> CredentialResult<SessionEntry> {
    let cluster_exchange = async {
        sources
            .exchanger
            .exchange(user.access_token(), CLUSTER_SCOPE, user.tenant_id())
            .await
            .map_err(|e| CredentialError::token_acquisition_failed(format!("Failed to acquire AKS token: {e}")))
    };
    let (cluster, arm) = tokio::try_join!(cluster_exchange, sources.arm_tokens.get_arm_token(user))?;

    let path = sources
        .store
        .target_path(user.tenant_id(), user.user_object_id(), &cluster.token);
    let file = sources.store.lease(path);

    let session = match materialize(sources, user, resource, file.path(), &cluster.token, &arm.token).await {
        Ok(session) => session,
        Err(e) => {
            file.release();
            return Err(e);
        }
    };

    let now = sources.clock.now_epoch_millis();
    Ok(SessionEntry {
        file,
        session,
        expires_at: cluster.expires_at.min(now.saturating_add(max_age_ms)),
        released: AtomicBool::new(false),
        tenant_id: user.tenant_id().to_string(),
        user_object_id: user.user_object_id().to_string(),
        resource: resource.to_string(),
        audit,
    })
}

async fn materialize(
    sources: &SessionSources,
    user: &UserContext,
    resource: &ResourceId,
    path: &Path,
    cluster_token: &str,
    management_token: &str,
) -> CredentialResult<Arc<dyn SessionHandle>> {
    let store = &sources.store;
    store.ensure_dir_writable().await?;

    if store.is_reusable(path, user.user_object_id(), cluster_token).await {
        tracing::debug!(path = %path.display(), "reusing existing credential file");
    } else {
        let raw = sources
            .control_plane
            .list_cluster_user_credentials(management_token, resource)
            .await
            .map_err(|e| match e.kind {
                ErrorKind::InvalidClusterAccess | ErrorKind::KubeconfigGenerationFailed => e,
                _ => e.rewrap(ErrorKind::KubeconfigGenerationFailed),
            })?;
        let rendered = kubeconfig::render_for_user(&raw, user.user_object_id(), cluster_token)?;
        store
            .write_atomic(path, &rendered, user.user_object_id(), cluster_token)
            .await?;
    }

    sources.sessions.open(path).await.map_err(|e| match e.kind {
        ErrorKind::KubeconfigGenerationFailed => e,
        _ => e.rewrap(ErrorKind::KubeconfigGenerationFailed),
    })
}
