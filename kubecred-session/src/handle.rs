//! Session handles over credential files.
//!
//! A session is what cluster-facing tools hold while they work: it knows
//! which credential file to load and which background tasks (watches,
//! port-forwards) it must stop when released.

use crate::kubeconfig::{self, KubeconfigSummary};
use async_trait::async_trait;
use kubecred_core::{CredentialError, CredentialResult, SessionFactory, SessionHandle};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::task::AbortHandle;

const DEFAULT_NAMESPACE: &str = "default";

#[derive(Debug, Default)]
struct Tracked {
    watches: Vec<AbortHandle>,
    port_forwards: HashMap<String, AbortHandle>,
}

/// Session over a rendered kubeconfig.
#[derive(Debug)]
pub struct KubeconfigSession {
    path: PathBuf,
    summary: KubeconfigSummary,
    namespace: String,
    tracked: Mutex<Tracked>,
    closed: AtomicBool,
}

impl KubeconfigSession {
    fn tracked(&self) -> MutexGuard<'_, Tracked> {
        self.tracked.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn summary(&self) -> &KubeconfigSummary {
        &self.summary
    }

    pub fn server(&self) -> Option<&str> {
        self.summary.server.as_deref()
    }

    pub fn current_context(&self) -> Option<&str> {
        self.summary.current_context.as_deref()
    }

    /// Context namespace, else the factory default.
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Stop `watch` when the session is released. A closed session stops it now.
    pub fn track_watch(&self, watch: AbortHandle) {
        if self.is_closed() {
            watch.abort();
            return;
        }
        self.tracked().watches.push(watch);
    }

    pub fn track_port_forward(&self, id: impl Into<String>, forward: AbortHandle) {
        if self.is_closed() {
            forward.abort();
            return;
        }
        if let Some(previous) = self.tracked().port_forwards.insert(id.into(), forward) {
            previous.abort();
        }
    }

    /// Stop and forget one port-forward. Returns whether it was tracked.
    pub fn stop_port_forward(&self, id: &str) -> bool {
        match self.tracked().port_forwards.remove(id) {
            Some(forward) => {
                forward.abort();
                true
            }
            None => false,
        }
    }

    pub fn port_forward_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.tracked().port_forwards.keys().cloned().collect();
        ids.sort();
        ids
    }
}

#[async_trait]
impl SessionHandle for KubeconfigSession {
    fn credential_path(&self) -> &Path {
        &self.path
    }

    async fn cleanup(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let tracked = std::mem::take(&mut *self.tracked());
        let watches = tracked.watches.len();
        let forwards = tracked.port_forwards.len();
        for watch in tracked.watches {
            watch.abort();
        }
        for (_, forward) in tracked.port_forwards {
            forward.abort();
        }
        tracing::debug!(
            path = %self.path.display(),
            watches,
            port_forwards = forwards,
            "session released"
        );
    }
}

/// Opens [`KubeconfigSession`]s.
#[derive(Debug, Clone)]
pub struct KubeconfigSessionFactory {
    default_namespace: String,
}

impl Default for KubeconfigSessionFactory {
    fn default() -> Self {
        Self {
            default_namespace: DEFAULT_NAMESPACE.to_string(),
        }
    }
}

impl KubeconfigSessionFactory {
    pub fn new(default_namespace: impl Into<String>) -> Self {
        Self {
            default_namespace: default_namespace.into(),
        }
    }

    /// Default namespace from `K8S_NAMESPACE`, else `default`.
    pub fn from_env() -> Self {
        std::env::var("K8S_NAMESPACE")
            .ok()
            .filter(|ns| !ns.trim().is_empty())
            .map(Self::new)
            .unwrap_or_default()
    }

    pub async fn open_session(&self, credential_path: &Path) -> CredentialResult<KubeconfigSession> {
        let raw = tokio::fs::read_to_string(credential_path).await.map_err(|e| {
            CredentialError::kubeconfig_generation_failed(format!(
                "failed to load kubeconfig {}: {e}",
                credential_path.display()
            ))
        })?;
        let summary = kubeconfig::summarize(&raw)?;
        let namespace = summary
            .namespace
            .clone()
            .unwrap_or_else(|| self.default_namespace.clone());
        Ok(KubeconfigSession {
            path: credential_path.to_path_buf(),
            summary,
            namespace,
            tracked: Mutex::new(Tracked::default()),
            closed: AtomicBool::new(false),
        })
    }
}

#[async_trait]
impl SessionFactory for KubeconfigSessionFactory {
    async fn open(&self, credential_path: &Path) -> CredentialResult<Arc<dyn SessionHandle>> {
        Ok(Arc::new(self.open_session(credential_path).await?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kubecred_core::ErrorKind;
    use kubecred_test_utils::fixtures;
    use std::time::Duration;

    async fn session_from(doc: &str, factory: &KubeconfigSessionFactory) -> (tempfile::TempDir, KubeconfigSession) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("kubeconfig-test");
        std::fs::write(&path, doc).unwrap();
        let session = factory.open_session(&path).await.unwrap();
        (dir, session)
    }

    fn pending_task() -> tokio::task::JoinHandle<()> {
        tokio::spawn(async { tokio::time::sleep(Duration::from_secs(3600)).await })
    }

    #[tokio::test]
    async fn test_session_exposes_cluster_details() {
        let factory = KubeconfigSessionFactory::default();
        let (_dir, session) = session_from(&fixtures::aks_user_kubeconfig(), &factory).await;
        assert_eq!(session.current_context(), Some("aks-prod"));
        assert_eq!(
            session.server(),
            Some("https://aks-prod-dns-12345678.hcp.westeurope.azmk8s.io:443")
        );
        assert_eq!(session.namespace(), "workloads");
    }

    #[tokio::test]
    async fn test_namespace_falls_back_to_factory_default() {
        let factory = KubeconfigSessionFactory::new("tools");
        let (_dir, session) = session_from(&fixtures::aks_exec_kubeconfig_json(), &factory).await;
        assert_eq!(session.namespace(), "tools");
    }

    #[tokio::test]
    async fn test_cleanup_aborts_tracked_tasks_once() {
        let factory = KubeconfigSessionFactory::default();
        let (_dir, session) = session_from(&fixtures::aks_user_kubeconfig(), &factory).await;

        let watch = pending_task();
        let forward = pending_task();
        session.track_watch(watch.abort_handle());
        session.track_port_forward("pf-1", forward.abort_handle());
        assert_eq!(session.port_forward_ids(), vec!["pf-1".to_string()]);

        session.cleanup().await;
        session.cleanup().await;

        assert!(session.is_closed());
        assert!(watch.await.unwrap_err().is_cancelled());
        assert!(forward.await.unwrap_err().is_cancelled());
        assert!(session.port_forward_ids().is_empty());
    }

    #[tokio::test]
    async fn test_tracking_after_close_aborts_immediately() {
        let factory = KubeconfigSessionFactory::default();
        let (_dir, session) = session_from(&fixtures::aks_user_kubeconfig(), &factory).await;
        session.cleanup().await;

        let late = pending_task();
        session.track_watch(late.abort_handle());
        assert!(late.await.unwrap_err().is_cancelled());
    }

    #[tokio::test]
    async fn test_stop_port_forward() {
        let factory = KubeconfigSessionFactory::default();
        let (_dir, session) = session_from(&fixtures::aks_user_kubeconfig(), &factory).await;
        let forward = pending_task();
        session.track_port_forward("pf", forward.abort_handle());
        assert!(session.stop_port_forward("pf"));
        assert!(!session.stop_port_forward("pf"));
        assert!(forward.await.unwrap_err().is_cancelled());
    }

    #[tokio::test]
    async fn test_missing_file_rejected() {
        let factory = KubeconfigSessionFactory::default();
        let err = factory
            .open(Path::new("/nonexistent/kubeconfig-x"))
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::KubeconfigGenerationFailed);
    }
}
