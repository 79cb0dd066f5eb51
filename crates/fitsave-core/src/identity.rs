//! Identity resolution for saved-result requests.
//!
//! An authenticated account always wins. Without one, the caller is tracked by
//! an anonymous id carried in a long-lived cookie; a missing or malformed
//! cookie gets a freshly minted id that the HTTP layer writes back.

use std::sync::Arc;

use async_trait::async_trait;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use thiserror::Error;

use crate::models::{AccountId, AnonymousId, OwnerId};
use crate::util::fingerprint;

type HmacSha256 = Hmac<Sha256>;

/// Raw identity material pulled off a request.
#[derive(Debug, Clone, Default)]
pub struct RequestCredentials {
    pub session_token: Option<String>,
    pub anonymous_cookie: Option<String>,
}

#[derive(Debug, Error)]
pub enum AuthResolutionError {
    #[error("session rejected: {0}")]
    Rejected(String),
    #[error("auth provider unavailable: {0}")]
    Unavailable(String),
}

/// Resolves a session token to an account.
#[async_trait]
pub trait AuthProvider: Send + Sync {
    async fn authenticate(&self, session_token: &str) -> Result<AccountId, AuthResolutionError>;
}

/// Signs anonymous ids as `<id>.<hex hmac-sha256>`.
#[derive(Clone)]
pub struct AnonymousCookieSigner {
    key: Vec<u8>,
}

impl AnonymousCookieSigner {
    pub fn new(secret: impl AsRef<[u8]>) -> Self {
        Self {
            key: secret.as_ref().to_vec(),
        }
    }

    fn mac(&self, id: &str) -> HmacSha256 {
        let mut mac = HmacSha256::new_from_slice(&self.key).expect("HMAC accepts any key length");
        mac.update(id.as_bytes());
        mac
    }

    pub fn sign(&self, id: &AnonymousId) -> String {
        let tag = self.mac(id.as_str()).finalize().into_bytes();
        format!("{}.{}", id.as_str(), hex::encode(tag))
    }

    pub fn verify(&self, value: &str) -> Option<AnonymousId> {
        let (id, tag) = value.split_once('.')?;
        let id = AnonymousId::parse(id)?;
        let tag = hex::decode(tag).ok()?;
        self.mac(id.as_str()).verify_slice(&tag).ok()?;
        Some(id)
    }
}

impl std::fmt::Debug for AnonymousCookieSigner {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("AnonymousCookieSigner")
            .field("key", &"[REDACTED]")
            .finish()
    }
}

/// Identity a request acts as.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedIdentity {
    pub owner: OwnerId,
    /// Cookie value to write back when a new anonymous id was minted.
    pub issued_cookie: Option<String>,
}

impl ResolvedIdentity {
    pub const fn is_new_anonymous(&self) -> bool {
        self.issued_cookie.is_some()
    }
}

#[derive(Clone)]
pub struct IdentityResolver {
    auth: Option<Arc<dyn AuthProvider>>,
    signer: Option<AnonymousCookieSigner>,
    allow_anonymous: bool,
}

impl IdentityResolver {
    pub fn new(
        auth: Option<Arc<dyn AuthProvider>>,
        signer: Option<AnonymousCookieSigner>,
        allow_anonymous: bool,
    ) -> Self {
        Self {
            auth,
            signer,
            allow_anonymous,
        }
    }

    pub fn is_auth_configured(&self) -> bool {
        self.auth.is_some()
    }

    /// Resolve the owner for a request.
    ///
    /// Returns `None` only when there is no account and anonymous use is off.
    pub async fn resolve(&self, credentials: &RequestCredentials) -> Option<ResolvedIdentity> {
        if let Some(account) = self.authenticated_account(credentials).await {
            return Some(ResolvedIdentity {
                owner: OwnerId::Account(account),
                issued_cookie: None,
            });
        }

        if !self.allow_anonymous {
            return None;
        }

        if let Some(anonymous) = self.anonymous_owner(credentials) {
            return Some(ResolvedIdentity {
                owner: OwnerId::Anonymous(anonymous),
                issued_cookie: None,
            });
        }

        let minted = AnonymousId::generate();
        let cookie = self.encode_cookie(&minted);
        tracing::debug!(
            owner = fingerprint(minted.as_str()),
            "Minted anonymous identity"
        );
        Some(ResolvedIdentity {
            owner: OwnerId::Anonymous(minted),
            issued_cookie: Some(cookie),
        })
    }

    /// Account behind the session token, if any. Provider failures count as signed out.
    pub async fn authenticated_account(&self, credentials: &RequestCredentials) -> Option<AccountId> {
        let auth = self.auth.as_ref()?;
        let token = credentials.session_token.as_deref()?;
        match auth.authenticate(token).await {
            Ok(account) => Some(account),
            Err(error) => {
                tracing::debug!(%error, "Session not accepted; treating request as anonymous");
                None
            }
        }
    }

    /// Anonymous id carried by the request cookie, without minting a new one.
    pub fn anonymous_owner(&self, credentials: &RequestCredentials) -> Option<AnonymousId> {
        let raw = credentials.anonymous_cookie.as_deref()?.trim();
        match &self.signer {
            Some(signer) => signer.verify(raw),
            None => AnonymousId::parse(raw),
        }
    }

    pub fn encode_cookie(&self, id: &AnonymousId) -> String {
        self.signer
            .as_ref()
            .map_or_else(|| id.as_str().to_string(), |signer| signer.sign(id))
    }
}
