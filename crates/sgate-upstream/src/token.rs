//! Bearer token lifecycle for a single provider's upstream client.
//!
//! Before every outbound call the client checks whether its cached bearer
//! token is absent or within 30s of expiry; if so it fetches a fresh
//! server-side cross-site-request token and derives a short-lived HS256 JWT
//! from it. Refresh is single-flight: the `tokio::sync::Mutex` held across
//! the `.await` in `bearer_token` means concurrent callers queue behind
//! whichever one is already refreshing, rather than each firing their own
//! refresh call.

use std::sync::Arc;

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD as b64url;
use hmac::{Hmac, Mac};
use serde::Serialize;
use sha2::Sha256;
use time::OffsetDateTime;
use tokio::sync::Mutex;

use crate::error::UpstreamError;

type HmacSha256 = Hmac<Sha256>;

const REFRESH_SKEW: time::Duration = time::Duration::seconds(30);
const MAX_TOKEN_TTL_SECS: i64 = 300;

/// The server-side cross-site-request token fetched ahead of JWT derivation.
#[derive(Debug, Clone)]
pub struct ServerToken {
    pub key_id: String,
    /// Base64url-encoded signing secret as returned by upstream.
    pub token: String,
    pub server_exp: i64,
}

/// Fetches a fresh `ServerToken` for a provider's credentials. Implemented
/// against the real upstream by `sgate-upstream::client`; swappable so
/// `TokenLifecycle` is unit-testable without network access.
#[async_trait::async_trait]
pub trait ServerTokenSource: Send + Sync {
    async fn fetch(&self, csesidx: &str, cookie_bag: &str) -> Result<ServerToken, UpstreamError>;
}

#[derive(Serialize)]
struct JwtHeader<'a> {
    alg: &'a str,
    typ: &'a str,
    kid: &'a str,
}

#[derive(Serialize)]
struct JwtPayload<'a> {
    iss: &'a str,
    aud: &'a str,
    sub: String,
    iat: i64,
    nbf: i64,
    exp: i64,
}

struct Cached {
    bearer: String,
    expires_at: OffsetDateTime,
}

/// Per-(provider, csesidx) bearer token cache. One instance lives inside
/// each cached `UpstreamClient` (see `sgate-upstream::cache`).
pub struct TokenLifecycle {
    csesidx: String,
    issuer: String,
    audience: String,
    source: Arc<dyn ServerTokenSource>,
    cached: Mutex<Option<Cached>>,
}

impl TokenLifecycle {
    pub fn new(
        csesidx: String,
        issuer: String,
        audience: String,
        source: Arc<dyn ServerTokenSource>,
    ) -> Self {
        Self {
            csesidx,
            issuer,
            audience,
            source,
            cached: Mutex::new(None),
        }
    }

    pub async fn bearer_token(&self, cookie_bag: &str) -> Result<String, UpstreamError> {
        let mut guard = self.cached.lock().await;
        let now = OffsetDateTime::now_utc();
        if let Some(cached) = guard.as_ref()
            && cached.expires_at - now > REFRESH_SKEW
        {
            return Ok(cached.bearer.clone());
        }

        match self.refresh(cookie_bag).await {
            Ok((bearer, expires_at)) => {
                let result = bearer.clone();
                *guard = Some(Cached { bearer, expires_at });
                Ok(result)
            }
            Err(err) => {
                // Token pointer stays null; the next call simply retries.
                *guard = None;
                Err(err)
            }
        }
    }

    async fn refresh(&self, cookie_bag: &str) -> Result<(String, OffsetDateTime), UpstreamError> {
        let server_token = self.source.fetch(&self.csesidx, cookie_bag).await?;
        let now = OffsetDateTime::now_utc().unix_timestamp();
        let exp = (now + MAX_TOKEN_TTL_SECS).min(server_token.server_exp);

        let header = JwtHeader {
            alg: "HS256",
            typ: "JWT",
            kid: &server_token.key_id,
        };
        let payload = JwtPayload {
            iss: &self.issuer,
            aud: &self.audience,
            sub: format!("csesidx/{}", self.csesidx),
            iat: now,
            nbf: now,
            exp,
        };

        let header_json =
            serde_json::to_vec(&header).map_err(|e| UpstreamError::AuthRefresh(e.to_string()))?;
        let payload_json = serde_json::to_vec(&payload)
            .map_err(|e| UpstreamError::AuthRefresh(e.to_string()))?;
        let signing_input = format!(
            "{}.{}",
            b64url.encode(header_json),
            b64url.encode(payload_json)
        );

        let key = b64url
            .decode(&server_token.token)
            .map_err(|e| UpstreamError::AuthRefresh(format!("bad server token encoding: {e}")))?;
        let mut mac = HmacSha256::new_from_slice(&key)
            .map_err(|e| UpstreamError::AuthRefresh(e.to_string()))?;
        mac.update(signing_input.as_bytes());
        let signature = b64url.encode(mac.finalize().into_bytes());

        let jwt = format!("{signing_input}.{signature}");
        let expires_at = OffsetDateTime::from_unix_timestamp(exp)
            .map_err(|e| UpstreamError::AuthRefresh(e.to_string()))?;
        Ok((jwt, expires_at))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FixedSource {
        calls: AtomicUsize,
        server_exp: i64,
    }

    #[async_trait::async_trait]
    impl ServerTokenSource for FixedSource {
        async fn fetch(&self, _csesidx: &str, _cookie_bag: &str) -> Result<ServerToken, UpstreamError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(ServerToken {
                key_id: "key-1".to_string(),
                token: b64url.encode([7u8; 32]),
                server_exp: self.server_exp,
            })
        }
    }

    #[tokio::test]
    async fn derives_a_three_part_jwt_and_caches_it() {
        let source = Arc::new(FixedSource {
            calls: AtomicUsize::new(0),
            server_exp: OffsetDateTime::now_utc().unix_timestamp() + 3600,
        });
        let lifecycle = TokenLifecycle::new(
            "abc123".to_string(),
            "sgate".to_string(),
            "upstream".to_string(),
            source.clone(),
        );

        let first = lifecycle.bearer_token("cookie").await.unwrap();
        assert_eq!(first.matches('.').count(), 2);

        let second = lifecycle.bearer_token("cookie").await.unwrap();
        assert_eq!(first, second);
        assert_eq!(source.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn failed_refresh_leaves_state_clean_for_retry() {
        struct FailingSource;
        #[async_trait::async_trait]
        impl ServerTokenSource for FailingSource {
            async fn fetch(&self, _: &str, _: &str) -> Result<ServerToken, UpstreamError> {
                Err(UpstreamError::AuthRefresh("no network".to_string()))
            }
        }
        let lifecycle = TokenLifecycle::new(
            "abc123".to_string(),
            "sgate".to_string(),
            "upstream".to_string(),
            Arc::new(FailingSource),
        );
        assert!(lifecycle.bearer_token("cookie").await.is_err());
        assert!(lifecycle.bearer_token("cookie").await.is_err());
    }

    #[tokio::test]
    async fn exp_is_clamped_to_server_exp_when_sooner() {
        let near = OffsetDateTime::now_utc().unix_timestamp() + 10;
        let source = Arc::new(FixedSource {
            calls: AtomicUsize::new(0),
            server_exp: near,
        });
        let lifecycle = TokenLifecycle::new(
            "abc123".to_string(),
            "sgate".to_string(),
            "upstream".to_string(),
            source,
        );
        // within 30s of expiry already -> every call refreshes, never panics.
        let _ = lifecycle.bearer_token("cookie").await.unwrap();
    }
}
