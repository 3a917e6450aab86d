//! On-behalf-of token exchange over the OAuth2 v2.0 token endpoint.

use async_trait::async_trait;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use jsonwebtoken::{encode, Algorithm, EncodingKey, Header};
use kubecred_core::{
    AzureConfig, ClientCredential, Clock, CredentialError, CredentialResult, ExchangedToken,
    TokenExchanger,
};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::sync::Arc;

const JWT_BEARER_GRANT: &str = "urn:ietf:params:oauth:grant-type:jwt-bearer";
const CLIENT_ASSERTION_TYPE: &str = "urn:ietf:params:oauth:client-assertion-type:jwt-bearer";

/// Lifetime assumed when the token endpoint omits `expires_in`.
pub const DEFAULT_TOKEN_LIFETIME_MS: i64 = 60 * 60 * 1000;

/// Lifetime of a signed client assertion.
const ASSERTION_LIFETIME_SECS: i64 = 600;

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: Option<String>,
    #[serde(default)]
    expires_in: Option<serde_json::Value>,
}

#[derive(Debug, Default, Deserialize)]
struct TokenErrorResponse {
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    error_codes: Option<Vec<i64>>,
}

#[derive(Debug, Serialize)]
struct AssertionClaims {
    aud: String,
    exp: i64,
    iat: i64,
    iss: String,
    jti: String,
    nbf: i64,
    sub: String,
}

/// Private key and thumbprint parsed once from the configured PEM bundle.
#[derive(Clone)]
struct CertificateSigner {
    key: EncodingKey,
    thumbprint: String,
}

impl CertificateSigner {
    fn from_pem(pem_bundle: &str) -> CredentialResult<Self> {
        let key = EncodingKey::from_rsa_pem(pem_bundle.as_bytes()).map_err(|e| {
            CredentialError::azure_obo_failed(format!("failed to parse certificate private key: {e}"))
        })?;
        Ok(Self {
            key,
            thumbprint: certificate_thumbprint(pem_bundle)?,
        })
    }

    fn sign(&self, client_id: &str, audience: &str, now_secs: i64) -> CredentialResult<String> {
        let mut header = Header::new(Algorithm::RS256);
        header.x5t_s256 = Some(self.thumbprint.clone());
        let claims = AssertionClaims {
            aud: audience.to_string(),
            exp: now_secs + ASSERTION_LIFETIME_SECS,
            iat: now_secs,
            iss: client_id.to_string(),
            jti: uuid::Uuid::new_v4().to_string(),
            nbf: now_secs,
            sub: client_id.to_string(),
        };
        encode(&header, &claims, &self.key).map_err(|e| {
            CredentialError::azure_obo_failed(format!("failed to sign client assertion: {e}"))
        })
    }
}

/// base64url SHA-256 of the DER certificate in `pem_bundle`.
fn certificate_thumbprint(pem_bundle: &str) -> CredentialResult<String> {
    let entries = pem::parse_many(pem_bundle)
        .map_err(|e| CredentialError::azure_obo_failed(format!("failed to parse PEM content: {e}")))?;
    let cert = entries
        .iter()
        .find(|p| p.tag() == "CERTIFICATE")
        .ok_or_else(|| CredentialError::azure_obo_failed("no certificate found in PEM"))?;
    Ok(URL_SAFE_NO_PAD.encode(Sha256::digest(cert.contents())))
}

enum ClientAuth {
    Secret(SecretString),
    Certificate(CertificateSigner),
}

/// HTTP on-behalf-of exchanger.
///
/// The client credential is validated when the exchanger is built, so a
/// misconfigured certificate fails at startup rather than on first use.
pub struct OboTokenExchanger {
    http: reqwest::Client,
    client_id: String,
    authority: String,
    auth: ClientAuth,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for OboTokenExchanger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let auth = match self.auth {
            ClientAuth::Secret(_) => "client_secret",
            ClientAuth::Certificate(_) => "client_certificate",
        };
        f.debug_struct("OboTokenExchanger")
            .field("client_id", &self.client_id)
            .field("authority", &self.authority)
            .field("auth", &auth)
            .finish()
    }
}

impl OboTokenExchanger {
    /// # Errors
    /// `AzureOboFailed` if the credential is empty or the certificate bundle
    /// does not hold an RSA key and a certificate.
    pub fn new(config: &AzureConfig, clock: Arc<dyn Clock>) -> CredentialResult<Self> {
        let auth = match &config.credential {
            ClientCredential::Secret(secret) => {
                if secret.expose_secret().is_empty() {
                    return Err(CredentialError::azure_obo_failed("client secret is empty"));
                }
                ClientAuth::Secret(secret.clone())
            }
            ClientCredential::Certificate(pem) => {
                ClientAuth::Certificate(CertificateSigner::from_pem(pem.expose_secret())?)
            }
        };
        let http = reqwest::Client::builder()
            .timeout(config.http_timeout)
            .build()
            .map_err(|e| CredentialError::azure_obo_failed(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            http,
            client_id: config.client_id.clone(),
            authority: config.authority.trim_end_matches('/').to_string(),
            auth,
            clock,
        })
    }

    fn token_url(&self, tenant_id: &str) -> String {
        format!("{}/{}/oauth2/v2.0/token", self.authority, tenant_id)
    }

    fn form(&self, assertion: &str, scope: &str, token_url: &str) -> CredentialResult<Vec<(&'static str, String)>> {
        let mut params = vec![
            ("grant_type", JWT_BEARER_GRANT.to_string()),
            ("requested_token_use", "on_behalf_of".to_string()),
            ("client_id", self.client_id.clone()),
            ("assertion", assertion.to_string()),
            ("scope", scope.to_string()),
        ];
        match &self.auth {
            ClientAuth::Secret(secret) => {
                params.push(("client_secret", secret.expose_secret().to_string()));
            }
            ClientAuth::Certificate(signer) => {
                let now_secs = self.clock.now_epoch_millis() / 1000;
                params.push(("client_assertion_type", CLIENT_ASSERTION_TYPE.to_string()));
                params.push(("client_assertion", signer.sign(&self.client_id, token_url, now_secs)?));
            }
        }
        Ok(params)
    }
}

#[async_trait]
impl TokenExchanger for OboTokenExchanger {
    async fn exchange(
        &self,
        assertion: &str,
        scope: &str,
        tenant_id: &str,
    ) -> CredentialResult<ExchangedToken> {
        let token_url = self.token_url(tenant_id);
        let params = self.form(assertion, scope, &token_url)?;

        tracing::debug!(tenant_id, scope, "performing on-behalf-of exchange");

        let response = self
            .http
            .post(&token_url)
            .form(&params)
            .send()
            .await
            .map_err(|e| CredentialError::azure_obo_failed(format!("OBO flow failed: request error: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let body: TokenErrorResponse = response.json().await.unwrap_or_default();
            let error = body.error.unwrap_or_else(|| "unknown_error".to_string());
            let codes = body
                .error_codes
                .map(|c| c.iter().map(|n| n.to_string()).collect::<Vec<_>>().join(","))
                .unwrap_or_default();
            tracing::warn!(tenant_id, scope, %status, error = %error, codes = %codes, "on-behalf-of exchange rejected");
            return Err(CredentialError::azure_obo_failed(format!(
                "OBO flow failed: status {status}: {error} [{codes}]"
            )));
        }

        let body: TokenResponse = response
            .json()
            .await
            .map_err(|e| CredentialError::azure_obo_failed(format!("OBO flow failed: invalid token response: {e}")))?;

        let token = body
            .access_token
            .filter(|t| !t.is_empty())
            .ok_or_else(|| CredentialError::azure_obo_failed("No access token received from OBO flow"))?;

        let now = self.clock.now_epoch_millis();
        let expires_at = match body.expires_in.as_ref().and_then(parse_expires_in) {
            Some(secs) => now.saturating_add(secs.saturating_mul(1000)),
            None => now.saturating_add(DEFAULT_TOKEN_LIFETIME_MS),
        };

        Ok(ExchangedToken { token, expires_at })
    }
}

/// `expires_in` arrives as a number or, from older endpoints, a string.
fn parse_expires_in(value: &serde_json::Value) -> Option<i64> {
    match value {
        serde_json::Value::Number(n) => n.as_i64(),
        serde_json::Value::String(s) => s.parse().ok(),
        _ => None,
    }
    .filter(|secs| *secs > 0)
}
