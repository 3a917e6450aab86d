//! kubecred core
//!
//! Identity types, error taxonomy, cache keys, clocks, configuration and the
//! request-coalescing primitive shared by the auth and session crates.

pub mod audit;
pub mod cache_key;
pub mod clock;
pub mod config;
pub mod error;
pub mod identity;
pub mod single_flight;
pub mod stats;
pub mod traits;

pub use audit::{AuditAction, AuditLog};
pub use cache_key::{CacheKey, KeyKind};
pub use clock::{Clock, EpochMillis, ManualClock, SystemClock};
pub use config::{
    AzureConfig, CacheSettings, ClientCredential, MultiTenantConfig, SecuritySettings,
    StorageSettings,
};
pub use error::{ConfigError, CredentialError, CredentialResult, ErrorKind};
pub use identity::{is_fresh, CachedToken, CachedUserInfo, ExchangedToken, ResourceId, UserContext};
pub use single_flight::{FlightRole, SingleFlight};
pub use stats::{CacheCounters, CacheStats};
pub use traits::{ClusterCredentialSource, SessionFactory, SessionHandle, TokenExchanger};

/// Scope for management-plane tokens.
pub const MANAGEMENT_SCOPE: &str = "https://management.azure.com/.default";

/// Scope for managed-cluster (AKS AAD server application) tokens.
pub const CLUSTER_SCOPE: &str = "6dae42f8-4368-4678-94ff-3960e28e3630/user.read";
