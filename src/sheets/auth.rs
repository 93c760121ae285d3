//! Bearer tokens for the spreadsheet API.
//!
//! Production tenants upload a service-account JSON; we mint an RS256
//! assertion and exchange it at the token endpoint, caching the result until
//! shortly before expiry. A static-token mode exists for tests and local
//! development (`{"token": "..."}` as the credentials blob).

use jsonwebtoken::{encode, Algorithm, EncodingKey, Header};
use parking_lot::Mutex;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use tracing::debug;

use crate::error::{SyncError, SyncResult};

const SHEETS_SCOPE: &str = "https://www.googleapis.com/auth/spreadsheets";
const JWT_GRANT_TYPE: &str = "urn:ietf:params:oauth:grant-type:jwt-bearer";
/// Refresh this long before the token actually expires.
const EXPIRY_MARGIN: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Deserialize)]
pub struct ServiceAccountKey {
    pub client_email: String,
    pub private_key: String,
    #[serde(default)]
    pub token_uri: Option<String>,
}

#[derive(Debug, Serialize)]
struct AssertionClaims<'a> {
    iss: &'a str,
    scope: &'a str,
    aud: &'a str,
    iat: i64,
    exp: i64,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default = "default_expires_in")]
    expires_in: u64,
}

fn default_expires_in() -> u64 {
    3600
}

struct CachedToken {
    token: String,
    expires_at: Instant,
}

enum AuthInner {
    Static(String),
    ServiceAccount {
        key: ServiceAccountKey,
        encoding_key: Box<EncodingKey>,
        token_url: String,
        cached: Mutex<Option<CachedToken>>,
    },
}

pub struct TokenProvider {
    http: Client,
    inner: AuthInner,
}

impl std::fmt::Debug for TokenProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenProvider").finish_non_exhaustive()
    }
}

/// Shape probe for the credentials blob.
#[derive(Deserialize)]
struct StaticToken {
    token: String,
}

impl TokenProvider {
    /// Parse a decrypted spreadsheet-credentials blob. `{"token": ...}`
    /// selects static mode; anything else must be a service-account JSON.
    pub fn from_credentials_json(
        json: &str,
        http: Client,
        default_token_url: &str,
    ) -> SyncResult<Self> {
        if let Ok(st) = serde_json::from_str::<StaticToken>(json) {
            return Ok(Self {
                http,
                inner: AuthInner::Static(st.token),
            });
        }

        let key: ServiceAccountKey = serde_json::from_str(json).map_err(|e| {
            SyncError::credential(format!("spreadsheet credentials are not valid: {e}"))
        })?;

        let encoding_key = EncodingKey::from_rsa_pem(key.private_key.as_bytes())
            .map_err(|e| SyncError::credential(format!("service-account key rejected: {e}")))?;

        let token_url = key
            .token_uri
            .clone()
            .unwrap_or_else(|| default_token_url.to_string());

        Ok(Self {
            http,
            inner: AuthInner::ServiceAccount {
                key,
                encoding_key: Box::new(encoding_key),
                token_url,
                cached: Mutex::new(None),
            },
        })
    }

    pub async fn bearer(&self) -> SyncResult<String> {
        match &self.inner {
            AuthInner::Static(token) => Ok(token.clone()),
            AuthInner::ServiceAccount {
                key,
                encoding_key,
                token_url,
                cached,
            } => {
                if let Some(c) = cached.lock().as_ref() {
                    if c.expires_at > Instant::now() {
                        return Ok(c.token.clone());
                    }
                }

                let now = chrono::Utc::now().timestamp();
                let claims = AssertionClaims {
                    iss: &key.client_email,
                    scope: SHEETS_SCOPE,
                    aud: token_url,
                    iat: now,
                    exp: now + 3600,
                };
                let assertion = encode(&Header::new(Algorithm::RS256), &claims, encoding_key)
                    .map_err(|e| SyncError::credential(format!("assertion signing: {e}")))?;

                let resp = self
                    .http
                    .post(token_url)
                    .form(&[("grant_type", JWT_GRANT_TYPE), ("assertion", &assertion)])
                    .send()
                    .await
                    .map_err(|e| SyncError::internal(format!("token endpoint: {e}")))?;

                let status = resp.status();
                if !status.is_success() {
                    let body = resp.text().await.unwrap_or_default();
                    return Err(if status.is_client_error() {
                        SyncError::credential(format!("token exchange {status}: {body}"))
                    } else {
                        SyncError::internal(format!("token exchange {status}: {body}"))
                    });
                }

                let token: TokenResponse = resp
                    .json()
                    .await
                    .map_err(|e| SyncError::internal(format!("token response parse: {e}")))?;

                let expires_at = Instant::now()
                    + Duration::from_secs(token.expires_in).saturating_sub(EXPIRY_MARGIN);
                debug!(expires_in = token.expires_in, "Minted spreadsheet access token");
                *cached.lock() = Some(CachedToken {
                    token: token.access_token.clone(),
                    expires_at,
                });
                Ok(token.access_token)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn test_static_token_mode() {
        let provider = TokenProvider::from_credentials_json(
            r#"{"token": "test-bearer"}"#,
            Client::new(),
            "https://example.invalid/token",
        )
        .unwrap();
        let token = tokio::runtime::Runtime::new()
            .unwrap()
            .block_on(provider.bearer())
            .unwrap();
        assert_eq!(token, "test-bearer");
    }

    #[test]
    fn test_garbage_credentials_rejected() {
        let err = TokenProvider::from_credentials_json(
            "definitely not json",
            Client::new(),
            "https://example.invalid/token",
        )
        .unwrap_err();
        assert_eq!(err.kind, ErrorKind::CredentialCorrupt);
    }

    #[test]
    fn test_bad_private_key_rejected() {
        let json = r#"{"client_email": "svc@example.iam", "private_key": "not a pem"}"#;
        let err = TokenProvider::from_credentials_json(
            json,
            Client::new(),
            "https://example.invalid/token",
        )
        .unwrap_err();
        assert_eq!(err.kind, ErrorKind::CredentialCorrupt);
    }
}
