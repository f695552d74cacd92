//! API-key authentication and daily-usage enforcement (§6, §7).

use std::sync::Arc;

use axum::http::HeaderMap;
use sgate_storage::GatewayStorage;
use time::OffsetDateTime;

use crate::error::GatewayError;

#[derive(Debug, Clone)]
pub struct AuthContext {
    pub user_id: i64,
    pub api_key_id: i64,
}

pub struct Authenticator<S> {
    storage: Arc<S>,
}

impl<S: GatewayStorage> Authenticator<S> {
    pub fn new(storage: Arc<S>) -> Self {
        Self { storage }
    }

    /// Validates the caller's API key and enforces its daily cap. Does not
    /// itself increment usage — callers do that only after a successful
    /// exchange, via [`Self::record_usage`].
    pub async fn authenticate(
        &self,
        headers: &HeaderMap,
        query: Option<&str>,
    ) -> Result<AuthContext, GatewayError> {
        let key_value = extract_api_key(headers, query).ok_or(GatewayError::AuthError)?;

        let entry = self
            .storage
            .find_api_key(&key_value)
            .await?
            .ok_or(GatewayError::AuthError)?;

        if !entry.enabled {
            return Err(GatewayError::AuthError);
        }
        if let Some(limit) = entry.daily_limit
            && entry.daily_usage >= limit
        {
            return Err(GatewayError::RateLimitError);
        }

        Ok(AuthContext {
            user_id: entry.user_id,
            api_key_id: entry.id,
        })
    }

    pub async fn record_usage(&self, api_key_id: i64) -> Result<(), GatewayError> {
        self.storage.increment_daily_usage(api_key_id).await?;
        self.storage
            .touch_api_key_last_used(api_key_id, OffsetDateTime::now_utc())
            .await?;
        Ok(())
    }
}

/// Checks, in order: `x-goog-api-key` header, `Authorization: Bearer …`
/// header, `key` query parameter.
fn extract_api_key(headers: &HeaderMap, query: Option<&str>) -> Option<String> {
    if let Some(value) = header_value(headers, "x-goog-api-key") {
        return Some(value);
    }
    if let Some(auth) = header_value(headers, "authorization") {
        let trimmed = auth.trim();
        for prefix in ["Bearer ", "bearer "] {
            if let Some(token) = trimmed.strip_prefix(prefix) {
                return Some(token.trim().to_string());
            }
        }
    }
    query.and_then(|q| {
        q.split('&').find_map(|pair| {
            let (k, v) = pair.split_once('=')?;
            (k == "key").then(|| v.to_string())
        })
    })
}

fn header_value(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;
    use sgate_storage::entities::api_keys::Model as ApiKeyModel;
    use sgate_storage::fake::FakeStorage;

    fn key(id: i64, value: &str, daily_usage: i64, daily_limit: Option<i64>) -> ApiKeyModel {
        ApiKeyModel {
            id,
            user_id: 42,
            key_value: value.to_string(),
            label: None,
            enabled: true,
            daily_usage,
            daily_limit,
            created_at: OffsetDateTime::now_utc(),
            last_used_at: None,
        }
    }

    #[tokio::test]
    async fn header_bearer_token_is_accepted() {
        let storage = Arc::new(FakeStorage::new());
        storage.seed_api_key(key(1, "secret-key", 0, None));
        let auth = Authenticator::new(storage);

        let mut headers = HeaderMap::new();
        headers.insert("authorization", HeaderValue::from_static("Bearer secret-key"));
        let ctx = auth.authenticate(&headers, None).await.unwrap();
        assert_eq!(ctx.user_id, 42);
    }

    #[tokio::test]
    async fn url_param_key_is_accepted() {
        let storage = Arc::new(FakeStorage::new());
        storage.seed_api_key(key(1, "secret-key", 0, None));
        let auth = Authenticator::new(storage);

        let ctx = auth
            .authenticate(&HeaderMap::new(), Some("key=secret-key"))
            .await
            .unwrap();
        assert_eq!(ctx.api_key_id, 1);
    }

    #[tokio::test]
    async fn missing_key_is_unauthenticated() {
        let storage = Arc::new(FakeStorage::new());
        let auth = Authenticator::new(storage);
        let err = auth.authenticate(&HeaderMap::new(), None).await.unwrap_err();
        assert!(matches!(err, GatewayError::AuthError));
    }

    #[tokio::test]
    async fn cap_reached_is_rate_limited() {
        let storage = Arc::new(FakeStorage::new());
        storage.seed_api_key(key(1, "secret-key", 100, Some(100)));
        let auth = Authenticator::new(storage);

        let mut headers = HeaderMap::new();
        headers.insert("x-goog-api-key", HeaderValue::from_static("secret-key"));
        let err = auth.authenticate(&headers, None).await.unwrap_err();
        assert!(matches!(err, GatewayError::RateLimitError));
    }
}
