use async_trait::async_trait;
use axum::http::HeaderMap;
use fitsave_core::identity::{AuthProvider, AuthResolutionError};
use fitsave_core::util::sanitize;
use fitsave_core::AccountId;
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::Deserialize;

use crate::config::JwtAuthConfig;
use crate::cookies::read_cookie;

pub const SESSION_COOKIE: &str = "fitsave_session";

/// Verifies HS256 session tokens; the account id is the `sub` claim.
#[derive(Clone)]
pub struct JwtSessionVerifier {
    key: DecodingKey,
    validation: Validation,
}

#[derive(Debug, Deserialize)]
struct SessionClaims {
    sub: String,
}

impl JwtSessionVerifier {
    pub fn new(config: &JwtAuthConfig) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.leeway = config.clock_skew.as_secs();
        validation.validate_nbf = true;
        if let Some(issuer) = config.issuer.as_deref() {
            validation.set_issuer(&[issuer]);
        }
        match config.audience.as_deref() {
            Some(audience) => validation.set_audience(&[audience]),
            None => validation.validate_aud = false,
        }

        Self {
            key: DecodingKey::from_secret(config.secret.as_bytes()),
            validation,
        }
    }
}

#[async_trait]
impl AuthProvider for JwtSessionVerifier {
    async fn authenticate(&self, session_token: &str) -> Result<AccountId, AuthResolutionError> {
        let decoded = decode::<SessionClaims>(session_token, &self.key, &self.validation)
            .map_err(|error| AuthResolutionError::Rejected(sanitize(&error)))?;

        AccountId::new(decoded.claims.sub)
            .ok_or_else(|| AuthResolutionError::Rejected("Token subject is missing".to_string()))
    }
}

/// Session token from `Authorization: Bearer`, falling back to the session cookie.
pub fn extract_session_token(headers: &HeaderMap) -> Option<String> {
    extract_bearer_token(headers)
        .map(str::to_string)
        .or_else(|| read_cookie(headers, SESSION_COOKIE))
}

fn extract_bearer_token(headers: &HeaderMap) -> Option<&str> {
    let header = headers.get("authorization")?.to_str().ok()?;
    let (scheme, token) = header.split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("bearer") {
        return None;
    }
    let token = token.trim();
    if token.is_empty() {
        None
    } else {
        Some(token)
    }
}
