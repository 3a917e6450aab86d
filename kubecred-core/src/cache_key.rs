//! Tenant-scoped cache keys.
//!
//! A `CacheKey` can only be built through constructors that take a tenant id
//! and a user id, so no cache entry exists outside a (tenant, user) scope.
//!
//! # Format
//!
//! `type_tag:tenant:user[:segment...]`, segments in fixed order. `%` and `:`
//! inside a segment are percent-escaped, which keeps the encoding injective.

use crate::identity::{ResourceId, UserContext};
use std::fmt;

const SEPARATOR: char = ':';

/// Kind of cached value a key addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KeyKind {
    /// Management-plane token
    Arm,
    /// Cluster session bundle
    Kubeconfig,
}

impl KeyKind {
    pub fn tag(&self) -> &'static str {
        match self {
            KeyKind::Arm => "arm",
            KeyKind::Kubeconfig => "kubeconfig",
        }
    }
}

/// A cache key scoped to one tenant and one user.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CacheKey {
    encoded: String,
    tenant_id: String,
}

impl CacheKey {
    fn build(kind: KeyKind, tenant_id: &str, user_object_id: &str, rest: &[&str]) -> Self {
        let mut encoded = String::from(kind.tag());
        for segment in [tenant_id, user_object_id].iter().chain(rest.iter()) {
            encoded.push(SEPARATOR);
            push_escaped(&mut encoded, segment);
        }
        Self {
            encoded,
            tenant_id: tenant_id.to_string(),
        }
    }

    /// Key for a management token: `arm:tenant:user`.
    pub fn arm(tenant_id: &str, user_object_id: &str) -> Self {
        Self::build(KeyKind::Arm, tenant_id, user_object_id, &[])
    }

    /// Key for a cluster session: `kubeconfig:tenant:user:sub:rg:cluster`.
    pub fn kubeconfig(tenant_id: &str, user_object_id: &str, resource: &ResourceId) -> Self {
        Self::build(
            KeyKind::Kubeconfig,
            tenant_id,
            user_object_id,
            &[
                resource.subscription_id(),
                resource.resource_group(),
                resource.cluster_name(),
            ],
        )
    }

    pub fn arm_for(user: &UserContext) -> Self {
        Self::arm(user.tenant_id(), user.user_object_id())
    }

    pub fn kubeconfig_for(user: &UserContext, resource: &ResourceId) -> Self {
        Self::kubeconfig(user.tenant_id(), user.user_object_id(), resource)
    }

    pub fn as_str(&self) -> &str {
        &self.encoded
    }

    /// Tenant this key belongs to (unescaped).
    pub fn tenant_id(&self) -> &str {
        &self.tenant_id
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.encoded)
    }
}

fn push_escaped(out: &mut String, segment: &str) {
    for c in segment.chars() {
        match c {
            '%' => out.push_str("%25"),
            SEPARATOR => out.push_str("%3A"),
            other => out.push(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn rid(sub: &str, rg: &str, cluster: &str) -> ResourceId {
        ResourceId::new(sub, rg, cluster).unwrap()
    }

    #[test]
    fn test_arm_key_format() {
        assert_eq!(CacheKey::arm("t1", "u1").as_str(), "arm:t1:u1");
    }

    #[test]
    fn test_kubeconfig_key_format() {
        let key = CacheKey::kubeconfig("t1", "u1", &rid("s", "rg", "aks"));
        assert_eq!(key.as_str(), "kubeconfig:t1:u1:s:rg:aks");
        assert_eq!(key.tenant_id(), "t1");
    }

    #[test]
    fn test_separator_in_segment_does_not_collide() {
        let a = CacheKey::arm("t:u", "x");
        let b = CacheKey::arm("t", "u:x");
        assert_ne!(a, b);
    }

    #[test]
    fn test_same_user_different_tenant_differs() {
        assert_ne!(CacheKey::arm("tenant-a", "user"), CacheKey::arm("tenant-b", "user"));
    }

    proptest! {
        #[test]
        fn prop_arm_key_injective(
            t1 in "[a-z:%]{0,6}", u1 in "[a-z:%]{0,6}",
            t2 in "[a-z:%]{0,6}", u2 in "[a-z:%]{0,6}",
        ) {
            let equal_inputs = t1 == t2 && u1 == u2;
            prop_assert_eq!(CacheKey::arm(&t1, &u1) == CacheKey::arm(&t2, &u2), equal_inputs);
        }

        #[test]
        fn prop_kinds_never_collide(t in "[a-z:]{1,6}", u in "[a-z:]{1,6}",
                                     s in "[a-z]{1,4}", g in "[a-z]{1,4}", c in "[a-z]{1,4}") {
            let arm = CacheKey::arm(&t, &u);
            let kube = CacheKey::kubeconfig(&t, &u, &rid(&s, &g, &c));
            prop_assert_ne!(arm, kube);
        }
    }
}
