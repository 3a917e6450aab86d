//! kubecred session layer
//!
//! Turns a validated caller identity and a cluster address into a live
//! session backed by a per-user credential file:
//!
//! - `kubeconfig`: parse and rewrite control-plane credential documents
//! - `secure_file`: owner-only credential files with shared, ref-counted tracking
//! - `control_plane`: `listClusterUserCredential` client
//! - `handle`: sessions over credential files
//! - `session_cache`: the per-tenant session cache

pub mod control_plane;
pub mod handle;
pub mod kubeconfig;
pub mod secure_file;
pub mod session_cache;

pub use control_plane::{ArmClusterCredentialClient, CONTAINER_SERVICE_API_VERSION};
pub use handle::{KubeconfigSession, KubeconfigSessionFactory};
pub use kubeconfig::{EmbeddedIdentity, KubeconfigSummary};
pub use secure_file::{ActiveFiles, FileLease, SecureFileStore, CREDENTIAL_FILE_MODE};
pub use session_cache::{SessionCache, SessionEntry, SessionLease, SessionSources};
