//! Delegated-token claim extraction.
//!
//! The delegated token is trusted as already validated upstream: its
//! signature is NOT verified here. Only structure, the identity claims and
//! expiry are checked.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use kubecred_core::{CachedUserInfo, CredentialError, CredentialResult, EpochMillis};
use serde::Deserialize;

#[derive(Debug, Deserialize)]
struct DelegatedClaims {
    oid: Option<String>,
    tid: Option<String>,
    exp: Option<i64>,
}

/// Decode the identity claims of `token` without verifying its signature.
///
/// # Errors
/// `JwtValidationFailed` if the token is not a JWT, lacks `oid` or `tid`,
/// or `exp` is missing or not after `now`.
pub fn extract_user_info(token: &str, now: EpochMillis) -> CredentialResult<CachedUserInfo> {
    let claims = decode_claims(token)?;

    let (oid, tid) = match (non_empty(claims.oid), non_empty(claims.tid)) {
        (Some(oid), Some(tid)) => (oid, tid),
        _ => {
            return Err(CredentialError::jwt_validation_failed(
                "invalid JWT token structure: oid and tid claims are required",
            ))
        }
    };

    let expires_at = match claims.exp {
        Some(exp) => exp.saturating_mul(1000),
        None => return Err(CredentialError::jwt_validation_failed("JWT token has no exp claim")),
    };
    if expires_at <= now {
        return Err(CredentialError::jwt_validation_failed("JWT token has expired"));
    }

    Ok(CachedUserInfo {
        user_object_id: oid.clone(),
        tenant_id: tid,
        object_id: oid,
        expires_at,
    })
}

fn decode_claims(token: &str) -> CredentialResult<DelegatedClaims> {
    // Header must parse as a JWT header; the signature is never checked.
    jsonwebtoken::decode_header(token)
        .map_err(|e| CredentialError::jwt_validation_failed(format!("malformed JWT header: {e}")))?;

    let payload = token
        .split('.')
        .nth(1)
        .ok_or_else(|| CredentialError::jwt_validation_failed("JWT has no payload segment"))?;
    let bytes = URL_SAFE_NO_PAD
        .decode(payload.trim_end_matches('='))
        .map_err(|e| CredentialError::jwt_validation_failed(format!("payload is not base64url: {e}")))?;
    serde_json::from_slice(&bytes)
        .map_err(|e| CredentialError::jwt_validation_failed(format!("payload is not JSON claims: {e}")))
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use kubecred_core::ErrorKind;
    use kubecred_test_utils::{mint_delegated_token, mint_token_with_claims};

    const NOW_MS: i64 = 1_704_067_200_000;
    const NOW_SECS: i64 = NOW_MS / 1000;

    #[test]
    fn test_valid_token_extracts_identity() {
        let token = mint_delegated_token("user-oid", "tenant-tid", NOW_SECS + 3600);
        let info = extract_user_info(&token, NOW_MS).unwrap();
        assert_eq!(info.user_object_id, "user-oid");
        assert_eq!(info.object_id, "user-oid");
        assert_eq!(info.tenant_id, "tenant-tid");
        assert_eq!(info.expires_at, (NOW_SECS + 3600) * 1000);
    }

    #[test]
    fn test_missing_oid_rejected() {
        let token = mint_token_with_claims(serde_json::json!({ "tid": "t", "exp": NOW_SECS + 60 }));
        let err = extract_user_info(&token, NOW_MS).unwrap_err();
        assert_eq!(err.kind, ErrorKind::JwtValidationFailed);
    }

    #[test]
    fn test_missing_tid_rejected() {
        let token = mint_token_with_claims(serde_json::json!({ "oid": "o", "exp": NOW_SECS + 60 }));
        let err = extract_user_info(&token, NOW_MS).unwrap_err();
        assert_eq!(err.kind, ErrorKind::JwtValidationFailed);
    }

    #[test]
    fn test_missing_exp_rejected() {
        let token = mint_token_with_claims(serde_json::json!({ "oid": "o", "tid": "t" }));
        let err = extract_user_info(&token, NOW_MS).unwrap_err();
        assert_eq!(err.kind, ErrorKind::JwtValidationFailed);
    }

    #[test]
    fn test_expiry_at_now_rejected() {
        let token = mint_delegated_token("o", "t", NOW_SECS);
        let err = extract_user_info(&token, NOW_MS).unwrap_err();
        assert_eq!(err.kind, ErrorKind::JwtValidationFailed);
        assert!(err.detail.contains("expired"));
    }

    #[test]
    fn test_garbage_rejected() {
        for token in ["", "not-a-jwt", "a.b", "e30.e30.sig"] {
            let err = extract_user_info(token, NOW_MS).unwrap_err();
            assert_eq!(err.kind, ErrorKind::JwtValidationFailed, "{token}");
        }
    }
}
