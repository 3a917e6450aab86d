//! kubecred auth
//!
//! Delegated-identity handling: on-behalf-of exchange, claim extraction, the
//! tenant boundary seam, and the management-token cache.

pub mod arm_cache;
pub mod boundary;
pub mod claims;
pub mod exchange;

pub use arm_cache::ArmTokenCache;
pub use boundary::{PermissiveBoundaryPolicy, StaticTenantPolicy, TenantBoundaryPolicy};
pub use claims::extract_user_info;
pub use exchange::{OboTokenExchanger, DEFAULT_TOKEN_LIFETIME_MS};
