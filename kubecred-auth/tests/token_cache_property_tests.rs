//! Property-based tests for the management-token cache.
//!
//! **Tenant isolation**: for any two callers that share a user object id but
//! not a tenant, the cache never serves one caller's token to the other.
//!
//! **Coalescing**: for any number of concurrent requests for one caller, one
//! exchange is performed and every caller receives the same token.

use kubecred_auth::ArmTokenCache;
use kubecred_core::clock::test_clocks;
use kubecred_core::{CacheSettings, SecuritySettings, UserContext, MANAGEMENT_SCOPE};
use kubecred_test_utils::generators::arb_guid;
use kubecred_test_utils::MockTokenExchanger;
use proptest::prelude::*;
use std::sync::Arc;
use std::time::Duration;

fn cache_over(exchanger: Arc<MockTokenExchanger>) -> ArmTokenCache {
    ArmTokenCache::new(
        exchanger,
        Arc::new(test_clocks::baseline()),
        CacheSettings::default(),
        SecuritySettings::default(),
    )
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn prop_tokens_never_cross_tenants(
        user in arb_guid(),
        tenant_a in arb_guid(),
        tenant_b in arb_guid(),
    ) {
        prop_assume!(tenant_a != tenant_b);

        let rt = tokio::runtime::Runtime::new().unwrap();
        rt.block_on(async {
            let exchanger = Arc::new(MockTokenExchanger::new(Arc::new(test_clocks::baseline())));
            let cache = cache_over(Arc::clone(&exchanger));

            let a = UserContext::new(user.clone(), tenant_a.clone(), "delegated");
            let b = UserContext::new(user.clone(), tenant_b.clone(), "delegated");

            let first_a = cache.get_arm_token(&a).await.unwrap();
            let first_b = cache.get_arm_token(&b).await.unwrap();
            let again_a = cache.get_arm_token(&a).await.unwrap();

            prop_assert_ne!(&first_a.token, &first_b.token);
            prop_assert!(first_a.token.contains(&tenant_a));
            prop_assert!(first_b.token.contains(&tenant_b));
            prop_assert_eq!(&first_a.token, &again_a.token);
            prop_assert_eq!(exchanger.calls_for(MANAGEMENT_SCOPE), 2);
            Ok(())
        })?;
    }

    #[test]
    fn prop_concurrent_requests_share_one_exchange(callers in 2usize..12) {
        let rt = tokio::runtime::Runtime::new().unwrap();
        rt.block_on(async {
            let exchanger = Arc::new(
                MockTokenExchanger::new(Arc::new(test_clocks::baseline()))
                    .with_delay(Duration::from_millis(20)),
            );
            let cache = Arc::new(cache_over(Arc::clone(&exchanger)));
            let user = UserContext::new("oid", "tid", "delegated");

            let mut handles = Vec::with_capacity(callers);
            for _ in 0..callers {
                let cache = Arc::clone(&cache);
                let user = user.clone();
                handles.push(tokio::spawn(async move { cache.get_arm_token(&user).await }));
            }

            let mut tokens = Vec::with_capacity(callers);
            for handle in handles {
                tokens.push(handle.await.unwrap().unwrap().token);
            }

            prop_assert_eq!(exchanger.calls_for(MANAGEMENT_SCOPE), 1);
            prop_assert!(tokens.iter().all(|t| t == &tokens[0]));

            let stats = cache.stats().await;
            prop_assert_eq!(stats.fetches, 1);
            prop_assert_eq!(stats.hits + stats.coalesced, callers as u64 - 1);
            Ok(())
        })?;
    }
}
