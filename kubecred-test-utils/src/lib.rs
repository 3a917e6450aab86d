//! kubecred Test Utilities
//!
//! Shared test infrastructure for the kubecred workspace:
//! - Delegated-token minting (unsigned, claims only)
//! - Counting doubles for the exchanger, control plane and session factory
//! - Credential document fixtures
//! - Audit event capture
//! - Proptest generators for identifiers

use async_trait::async_trait;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use kubecred_core::audit::AUDIT_TARGET;
use kubecred_core::{
    AuditAction, Clock, ClusterCredentialSource, CredentialError, CredentialResult, ExchangedToken,
    ResourceId, SessionFactory, SessionHandle, TokenExchanger,
};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

// ============================================================================
// DELEGATED TOKENS
// ============================================================================

/// Build an unsigned JWT carrying `claims`.
pub fn mint_token_with_claims(claims: serde_json::Value) -> String {
    let header = serde_json::json!({ "alg": "RS256", "typ": "JWT" });
    format!(
        "{}.{}.{}",
        URL_SAFE_NO_PAD.encode(header.to_string()),
        URL_SAFE_NO_PAD.encode(claims.to_string()),
        URL_SAFE_NO_PAD.encode("not-a-real-signature"),
    )
}

/// Build a delegated token for `oid` in `tid` expiring at `exp_secs`.
pub fn mint_delegated_token(oid: &str, tid: &str, exp_secs: i64) -> String {
    mint_token_with_claims(serde_json::json!({
        "oid": oid,
        "tid": tid,
        "exp": exp_secs,
        "aud": "api://kubecred",
    }))
}

// ============================================================================
// MOCK TOKEN EXCHANGER
// ============================================================================

/// Counting exchanger that issues `"{scope}|{tenant}|{n}"` tokens.
pub struct MockTokenExchanger {
    clock: Arc<dyn Clock>,
    lifetime_ms: Mutex<i64>,
    delay: Option<Duration>,
    fail_scopes: Mutex<Vec<String>>,
    calls: Mutex<HashMap<String, usize>>,
    total: AtomicUsize,
}

impl MockTokenExchanger {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            lifetime_ms: Mutex::new(3_600_000),
            delay: None,
            fail_scopes: Mutex::new(Vec::new()),
            calls: Mutex::new(HashMap::new()),
            total: AtomicUsize::new(0),
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn with_lifetime_ms(self, lifetime_ms: i64) -> Self {
        *self.lifetime_ms.lock().unwrap() = lifetime_ms;
        self
    }

    pub fn set_lifetime_ms(&self, lifetime_ms: i64) {
        *self.lifetime_ms.lock().unwrap() = lifetime_ms;
    }

    /// Make every exchange for `scope` fail until [`Self::recover`].
    pub fn fail_scope(&self, scope: &str) {
        self.fail_scopes.lock().unwrap().push(scope.to_string());
    }

    pub fn recover(&self) {
        self.fail_scopes.lock().unwrap().clear();
    }

    pub fn calls_for(&self, scope: &str) -> usize {
        self.calls.lock().unwrap().get(scope).copied().unwrap_or(0)
    }

    pub fn total_calls(&self) -> usize {
        self.total.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TokenExchanger for MockTokenExchanger {
    async fn exchange(
        &self,
        _assertion: &str,
        scope: &str,
        tenant_id: &str,
    ) -> CredentialResult<ExchangedToken> {
        self.total.fetch_add(1, Ordering::SeqCst);
        let n = {
            let mut calls = self.calls.lock().unwrap();
            let count = calls.entry(scope.to_string()).or_insert(0);
            *count += 1;
            *count
        };
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if self.fail_scopes.lock().unwrap().iter().any(|s| s == scope) {
            return Err(CredentialError::azure_obo_failed(format!(
                "mock exchange refused for {scope}"
            )));
        }
        let lifetime = *self.lifetime_ms.lock().unwrap();
        Ok(ExchangedToken {
            token: format!("{scope}|{tenant_id}|{n}"),
            expires_at: self.clock.now_epoch_millis() + lifetime,
        })
    }
}

// ============================================================================
// MOCK CLUSTER CREDENTIAL SOURCE
// ============================================================================

/// Counting control plane that serves a fixed document.
pub struct MockClusterSource {
    document: Mutex<String>,
    delay: Option<Duration>,
    failure: Mutex<Option<CredentialError>>,
    calls: AtomicUsize,
}

impl MockClusterSource {
    pub fn new(document: impl Into<String>) -> Self {
        Self {
            document: Mutex::new(document.into()),
            delay: None,
            failure: Mutex::new(None),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn set_document(&self, document: impl Into<String>) {
        *self.document.lock().unwrap() = document.into();
    }

    pub fn fail_with(&self, error: CredentialError) {
        *self.failure.lock().unwrap() = Some(error);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ClusterCredentialSource for MockClusterSource {
    async fn list_cluster_user_credentials(
        &self,
        _management_token: &str,
        _resource: &ResourceId,
    ) -> CredentialResult<String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(err) = self.failure.lock().unwrap().clone() {
            return Err(err);
        }
        Ok(self.document.lock().unwrap().clone())
    }
}

// ============================================================================
// RECORDING SESSIONS
// ============================================================================

/// Session double that counts cleanups.
#[derive(Debug)]
pub struct RecordingSession {
    path: PathBuf,
    cleaned: AtomicBool,
    cleanup_calls: AtomicUsize,
}

impl RecordingSession {
    pub fn cleanup_calls(&self) -> usize {
        self.cleanup_calls.load(Ordering::SeqCst)
    }

    pub fn is_cleaned(&self) -> bool {
        self.cleaned.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SessionHandle for RecordingSession {
    fn credential_path(&self) -> &Path {
        &self.path
    }

    async fn cleanup(&self) {
        self.cleanup_calls.fetch_add(1, Ordering::SeqCst);
        self.cleaned.store(true, Ordering::SeqCst);
    }
}

/// Factory that keeps every session it opened.
#[derive(Default)]
pub struct RecordingSessionFactory {
    opened: Mutex<Vec<Arc<RecordingSession>>>,
}

impl RecordingSessionFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn opened(&self) -> Vec<Arc<RecordingSession>> {
        self.opened.lock().unwrap().clone()
    }

    pub fn total_cleanups(&self) -> usize {
        self.opened().iter().map(|s| s.cleanup_calls()).sum()
    }
}

#[async_trait]
impl SessionFactory for RecordingSessionFactory {
    async fn open(&self, credential_path: &Path) -> CredentialResult<Arc<dyn SessionHandle>> {
        let session = Arc::new(RecordingSession {
            path: credential_path.to_path_buf(),
            cleaned: AtomicBool::new(false),
            cleanup_calls: AtomicUsize::new(0),
        });
        self.opened.lock().unwrap().push(Arc::clone(&session));
        Ok(session)
    }
}

// ============================================================================
// AUDIT CAPTURE
// ============================================================================

/// Records the `action` of every audit event emitted while installed.
///
/// The subscriber is thread-local, so use it from a current-thread runtime.
#[derive(Debug, Clone, Default)]
pub struct AuditCapture {
    actions: Arc<Mutex<Vec<String>>>,
}

impl AuditCapture {
    pub fn install() -> (Self, tracing::subscriber::DefaultGuard) {
        use tracing_subscriber::layer::SubscriberExt;

        let capture = Self::default();
        let subscriber = tracing_subscriber::registry().with(capture.clone());
        (capture, tracing::subscriber::set_default(subscriber))
    }

    pub fn actions(&self) -> Vec<String> {
        self.actions.lock().unwrap().clone()
    }

    pub fn count(&self, action: AuditAction) -> usize {
        self.actions
            .lock()
            .unwrap()
            .iter()
            .filter(|a| a.as_str() == action.as_str())
            .count()
    }
}

impl<S: tracing::Subscriber> tracing_subscriber::Layer<S> for AuditCapture {
    fn on_event(&self, event: &tracing::Event<'_>, _ctx: tracing_subscriber::layer::Context<'_, S>) {
        if event.metadata().target() != AUDIT_TARGET {
            return;
        }
        let mut field = ActionField(None);
        event.record(&mut field);
        if let Some(action) = field.0 {
            self.actions.lock().unwrap().push(action);
        }
    }
}

struct ActionField(Option<String>);

impl tracing::field::Visit for ActionField {
    fn record_str(&mut self, field: &tracing::field::Field, value: &str) {
        if field.name() == "action" {
            self.0 = Some(value.to_string());
        }
    }

    fn record_debug(&mut self, _field: &tracing::field::Field, _value: &dyn std::fmt::Debug) {}
}

// ============================================================================
// FIXTURES
// ============================================================================

pub mod fixtures {
    //! Credential documents shaped like the managed-cluster control plane returns.

    /// Local-account style document with a client certificate user.
    pub fn aks_user_kubeconfig() -> String {
        r#"apiVersion: v1
kind: Config
clusters:
- cluster:
    certificate-authority-data: TFMwdExTMUNSVWRKVGlCRFJWSlVTVVpKUTBGVVJTMHRMUzB0Q2c9PQ==
    server: https://aks-prod-dns-12345678.hcp.westeurope.azmk8s.io:443
  name: aks-prod
contexts:
- context:
    cluster: aks-prod
    user: clusterUser_rg-prod_aks-prod
    namespace: workloads
  name: aks-prod
current-context: aks-prod
preferences: {}
users:
- name: clusterUser_rg-prod_aks-prod
  user:
    client-certificate-data: TFMwdExTMUNSVWRKVGlCRFJWSlVTVVpKUTBGVVJTMHRMUzB0Q2c9PQ==
    client-key-data: TFMwdExTMUNSVWRKVGlCU1UwRWdVRkpKVmtGVVJTQkxSVmt0TFMwdExRbz0=
"#
        .to_string()
    }

    /// Exec-plugin style document as served for AAD-enabled clusters.
    pub fn aks_exec_kubeconfig_json() -> String {
        serde_json::json!({
            "apiVersion": "v1",
            "kind": "Config",
            "clusters": [{
                "name": "aks-dev",
                "cluster": { "server": "https://aks-dev.hcp.eastus.azmk8s.io:443" }
            }],
            "contexts": [{
                "name": "aks-dev",
                "context": { "cluster": "aks-dev", "user": "clusterUser_rg-dev_aks-dev" }
            }],
            "current-context": "aks-dev",
            "users": [{
                "name": "clusterUser_rg-dev_aks-dev",
                "user": {
                    "exec": {
                        "apiVersion": "client.authentication.k8s.io/v1beta1",
                        "command": "kubelogin",
                        "args": ["get-token", "--login", "devicecode"]
                    }
                }
            }]
        })
        .to_string()
    }

    /// Document with no users.
    pub fn kubeconfig_without_users() -> String {
        "apiVersion: v1\nkind: Config\ncontexts:\n- name: c\n  context:\n    cluster: c\n    user: u\nusers: []\n".to_string()
    }
}

// ============================================================================
// PROPTEST GENERATORS
// ============================================================================

pub mod generators {
    //! Proptest strategies for identifiers.

    use proptest::prelude::*;

    /// GUID-shaped tenant or object id.
    pub fn arb_guid() -> impl Strategy<Value = String> {
        "[0-9a-f]{8}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{12}"
    }

    /// Azure resource-name-like segment.
    pub fn arb_resource_name() -> impl Strategy<Value = String> {
        "[a-z][a-z0-9-]{0,15}"
    }
}
