//! Token claims, HS256 minting and verification, and issuer extraction.
//!
//! # Purpose
//! Defines the claim structure carried by bearer and refresh tokens and the
//! helpers the authority and bridges use to sign, validate, and inspect them.
//! A bearer token encodes an expiry; a refresh token carries the same claims
//! without one, its lifetime enforced by the shared store instead.
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation};
use plover_common::ChannelId;
use serde::{Deserialize, Serialize};

pub mod cache;
pub mod client;

pub use cache::TokenCache;
pub use client::AuthorityClient;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Claims {
    pub iss: String,
    pub iat: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exp: Option<i64>,
    pub user_id: String,
    pub channel_id: ChannelId,
}

impl Claims {
    /// Expiry for cache ordering; refresh tokens never enter the cache, so a
    /// missing exp collapses to the issue time.
    pub fn expires_at(&self) -> i64 {
        self.exp.unwrap_or(self.iat)
    }
}

#[derive(thiserror::Error, Debug)]
pub enum TokenError {
    #[error("jwt error: {0}")]
    Jwt(#[from] jsonwebtoken::errors::Error),
    #[error("malformed token")]
    Malformed,
    #[error("issuer missing from token")]
    MissingIssuer,
}

/// Sign a bearer token carrying an expiry.
pub fn mint_bearer(
    iss: &str,
    user_id: &str,
    channel_id: ChannelId,
    secret: &[u8],
    iat: i64,
    exp: i64,
) -> Result<String, TokenError> {
    let claims = Claims {
        iss: iss.to_string(),
        iat,
        exp: Some(exp),
        user_id: user_id.to_string(),
        channel_id,
    };
    let key = EncodingKey::from_secret(secret);
    Ok(jsonwebtoken::encode(
        &Header::new(Algorithm::HS256),
        &claims,
        &key,
    )?)
}

/// Sign a refresh token: same claims, no encoded expiry.
pub fn mint_refresh(
    iss: &str,
    user_id: &str,
    channel_id: ChannelId,
    secret: &[u8],
    iat: i64,
) -> Result<String, TokenError> {
    let claims = Claims {
        iss: iss.to_string(),
        iat,
        exp: None,
        user_id: user_id.to_string(),
        channel_id,
    };
    let key = EncodingKey::from_secret(secret);
    Ok(jsonwebtoken::encode(
        &Header::new(Algorithm::HS256),
        &claims,
        &key,
    )?)
}

/// Validate signature and expiry, returning the decoded claims.
pub fn decode(token: &str, secret: &[u8]) -> Result<Claims, TokenError> {
    let key = DecodingKey::from_secret(secret);
    let mut validation = Validation::new(Algorithm::HS256);
    validation.validate_aud = false;
    // Expired means expired; no grace window.
    validation.leeway = 0;
    let data = jsonwebtoken::decode::<Claims>(token, &key, &validation)?;
    Ok(data.claims)
}

/// Read the `iss` claim without verifying the signature.
///
/// The authority uses this to pick the verification secret: the issuer names
/// the instance whose secret signed the token.
pub fn extract_issuer(token: &str) -> Result<String, TokenError> {
    let mut parts = token.split('.');
    let payload = match (parts.next(), parts.next(), parts.next(), parts.next()) {
        (Some(_), Some(payload), Some(_), None) => payload,
        _ => return Err(TokenError::Malformed),
    };

    let decoded = URL_SAFE_NO_PAD
        .decode(payload)
        .map_err(|_| TokenError::Malformed)?;
    let body: serde_json::Value =
        serde_json::from_slice(&decoded).map_err(|_| TokenError::Malformed)?;

    body.get("iss")
        .and_then(|value| value.as_str())
        .map(|iss| iss.to_string())
        .ok_or(TokenError::MissingIssuer)
}

#[cfg(test)]
mod tests {
    use super::*;
    use plover_common::unix_now;

    const SECRET: &[u8] = b"0123456789abcdef0123456789abcdef";

    #[test]
    fn bearer_round_trip_preserves_claims() {
        let iat = unix_now();
        let exp = iat + 600;
        let token =
            mint_bearer("authority-1", "user-a", ChannelId(2), SECRET, iat, exp).expect("mint");
        let claims = decode(&token, SECRET).expect("decode");
        assert_eq!(claims.iss, "authority-1");
        assert_eq!(claims.iat, iat);
        assert_eq!(claims.exp, Some(exp));
        assert_eq!(claims.user_id, "user-a");
        assert_eq!(claims.channel_id, ChannelId(2));
    }

    #[test]
    fn decode_rejects_wrong_secret() {
        let iat = unix_now();
        let token =
            mint_bearer("authority-1", "user-a", ChannelId(0), SECRET, iat, iat + 600)
                .expect("mint");
        assert!(decode(&token, b"another-secret-another-secret-ab").is_err());
    }

    #[test]
    fn decode_rejects_expired_token() {
        let iat = unix_now() - 120;
        let token =
            mint_bearer("authority-1", "user-a", ChannelId(0), SECRET, iat, iat + 60)
                .expect("mint");
        let err = decode(&token, SECRET).expect_err("expired");
        assert!(matches!(err, TokenError::Jwt(_)));
    }

    #[test]
    fn extract_issuer_matches_mint() {
        let iat = unix_now();
        let token =
            mint_bearer("authority-7", "user-a", ChannelId(0), SECRET, iat, iat + 600)
                .expect("mint");
        assert_eq!(extract_issuer(&token).expect("issuer"), "authority-7");
    }

    #[test]
    fn extract_issuer_works_on_refresh_tokens() {
        let token = mint_refresh("authority-7", "user-a", ChannelId(1), SECRET, unix_now())
            .expect("mint");
        assert_eq!(extract_issuer(&token).expect("issuer"), "authority-7");
    }

    #[test]
    fn extract_issuer_rejects_garbage() {
        assert!(matches!(
            extract_issuer("not-a-token"),
            Err(TokenError::Malformed)
        ));
        assert!(matches!(
            extract_issuer("a.b.c.d"),
            Err(TokenError::Malformed)
        ));
    }

    #[test]
    fn refresh_token_has_no_exp() {
        let token = mint_refresh("authority-1", "user-a", ChannelId(0), SECRET, unix_now())
            .expect("mint");
        let payload = token.split('.').nth(1).expect("payload");
        let decoded = URL_SAFE_NO_PAD.decode(payload).expect("base64");
        let body: serde_json::Value = serde_json::from_slice(&decoded).expect("json");
        assert!(body.get("exp").is_none());
    }
}
