//! kubecred
//!
//! Multi-tenant delegated credentials for managed Kubernetes clusters. A
//! caller presents a delegated token; kubecred exchanges it on behalf of the
//! caller for management-plane and cluster tokens, fetches the cluster's user
//! credentials, and hands back a session backed by an owner-only credential
//! file. Tokens and sessions are cached per tenant and user, and every file
//! is removed on eviction, cleanup, or shutdown.
//!
//! ```no_run
//! use kubecred::{MultiTenantFacade, ResourceId};
//!
//! # async fn run(delegated_token: &str) -> Result<(), Box<dyn std::error::Error>> {
//! let facade = std::sync::Arc::new(MultiTenantFacade::from_env()?);
//! facade.install_signal_handlers()?;
//!
//! let user = facade.create_user_context(delegated_token, Some("sub-id")).await?;
//! let cluster = ResourceId::new("sub-id", "rg-prod", "aks-prod")?;
//! let path = facade.get_kubeconfig_path(&user, &cluster).await?;
//! println!("KUBECONFIG={}", path.display());
//! # Ok(())
//! # }
//! ```

pub mod error;
pub mod facade;
pub mod shutdown;
pub mod telemetry;

pub use error::BootstrapError;
pub use facade::{AfterSignal, FacadeBuilder, FacadeStats, MultiTenantFacade};
pub use shutdown::{wait_for_signal, ShutdownCoordinator, ShutdownGuard, ShutdownReport, ShutdownSignals};
pub use telemetry::{init_tracing, TelemetryConfig};

pub use kubecred_core::{
    CacheStats, CachedToken, ClientCredential, CredentialError, CredentialResult, ErrorKind,
    MultiTenantConfig, ResourceId, UserContext,
};
pub use kubecred_session::SessionLease;
