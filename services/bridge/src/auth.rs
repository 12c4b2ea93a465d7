//! Token verification for every authenticated bridge endpoint.
//!
//! # Purpose
//! Handlers receive typed claims through the [`AuthClaims`] extractor rather
//! than a request-scoped context bag. On a cache miss the verifier prefers
//! the authority RPC when one is configured (1-second deadline, no retries);
//! otherwise it verifies locally with the issuer's secret from the shared
//! store. Verified claims land in the expiry-swept cache.
use crate::api::{api_unauthorized, api_upstream, ApiError};
use crate::{AppState, BridgeStore};
use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use plover_auth::client::ClientError;
use plover_auth::{AuthorityClient, Claims, TokenCache};
use std::sync::Arc;

#[derive(thiserror::Error, Debug)]
pub enum AuthError {
    #[error("token is invalid or expired")]
    Invalid,
    #[error("verification backend unavailable")]
    Upstream,
}

pub struct BridgeAuth {
    cache: Arc<TokenCache>,
    authority: Option<AuthorityClient>,
    store: Arc<BridgeStore>,
}

impl BridgeAuth {
    pub fn new(
        cache: Arc<TokenCache>,
        authority: Option<AuthorityClient>,
        store: Arc<BridgeStore>,
    ) -> Self {
        Self {
            cache,
            authority,
            store,
        }
    }

    pub async fn verify(&self, token: &str) -> Result<Claims, AuthError> {
        if let Some(claims) = self.cache.get(token) {
            return Ok(claims);
        }

        let claims = match &self.authority {
            Some(client) => match client.verify(token).await {
                Ok(claims) => claims,
                Err(ClientError::Denied) => return Err(AuthError::Invalid),
                Err(err) => {
                    tracing::warn!(error = %err, "authority verify failed");
                    return Err(AuthError::Upstream);
                }
            },
            None => self.verify_local(token).await?,
        };

        self.cache.put(token, claims.clone());
        Ok(claims)
    }

    async fn verify_local(&self, token: &str) -> Result<Claims, AuthError> {
        let issuer = plover_auth::extract_issuer(token).map_err(|_| AuthError::Invalid)?;
        let secret = match self.store.get_secret(&issuer).await {
            Ok(secret) => secret,
            Err(plover_store::StoreError::SecretNotFound(_)) => return Err(AuthError::Invalid),
            Err(err) => {
                tracing::warn!(error = %err, "issuer secret lookup failed");
                return Err(AuthError::Upstream);
            }
        };
        plover_auth::decode(token, &secret).map_err(|_| AuthError::Invalid)
    }
}

/// Verified claims attached to an authenticated request.
pub struct AuthClaims(pub Claims);

#[axum::async_trait]
impl FromRequestParts<AppState> for AuthClaims {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let header = parts
            .headers
            .get(axum::http::header::AUTHORIZATION)
            .and_then(|value| value.to_str().ok())
            .ok_or_else(|| api_unauthorized("missing bearer token"))?;
        let token = header
            .strip_prefix("Bearer ")
            .ok_or_else(|| api_unauthorized("missing bearer token"))?;

        match state.auth.verify(token).await {
            Ok(claims) => Ok(AuthClaims(claims)),
            Err(AuthError::Invalid) => Err(api_unauthorized("token is invalid or expired")),
            Err(AuthError::Upstream) => Err(api_upstream("token verification unavailable")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use plover_common::{unix_now, ChannelId};

    const SECRET: &[u8] = b"0123456789abcdef0123456789abcdef";

    async fn local_auth() -> BridgeAuth {
        let store = Arc::new(BridgeStore::new(ChannelId(0), None));
        store
            .put_secret("authority-test", SECRET)
            .await
            .expect("secret");
        BridgeAuth::new(Arc::new(TokenCache::new()), None, store)
    }

    #[tokio::test]
    async fn local_verify_accepts_minted_token() {
        let auth = local_auth().await;
        let iat = unix_now();
        let token = plover_auth::mint_bearer(
            "authority-test",
            "user-a",
            ChannelId(3),
            SECRET,
            iat,
            iat + 600,
        )
        .expect("mint");

        let claims = auth.verify(&token).await.expect("verify");
        assert_eq!(claims.user_id, "user-a");
        assert_eq!(claims.channel_id, ChannelId(3));

        // The second lookup is answered from the cache.
        assert!(auth.cache.get(&token).is_some());
        let cached = auth.verify(&token).await.expect("verify");
        assert_eq!(cached, claims);
    }

    #[tokio::test]
    async fn local_verify_rejects_expired_token() {
        let auth = local_auth().await;
        let iat = unix_now() - 120;
        let token = plover_auth::mint_bearer(
            "authority-test",
            "user-a",
            ChannelId(0),
            SECRET,
            iat,
            iat + 1,
        )
        .expect("mint");

        assert!(matches!(
            auth.verify(&token).await,
            Err(AuthError::Invalid)
        ));
        // Rejected tokens never enter the cache.
        assert!(auth.cache.get(&token).is_none());
    }

    #[tokio::test]
    async fn local_verify_rejects_unknown_issuer() {
        let auth = local_auth().await;
        let iat = unix_now();
        let token = plover_auth::mint_bearer(
            "authority-stranger",
            "user-a",
            ChannelId(0),
            SECRET,
            iat,
            iat + 600,
        )
        .expect("mint");
        assert!(matches!(
            auth.verify(&token).await,
            Err(AuthError::Invalid)
        ));
    }

    #[tokio::test]
    async fn garbage_token_is_invalid() {
        let auth = local_auth().await;
        assert!(matches!(
            auth.verify("not-a-token").await,
            Err(AuthError::Invalid)
        ));
    }
}
