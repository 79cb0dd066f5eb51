//! Owner identities.
//!
//! Anonymous visitors and signed-in accounts live in separate id spaces. The
//! storage form of an owner always carries a namespace prefix, so no account id
//! can ever render to the same owner key as an anonymous id.

use std::fmt;
use std::str::FromStr;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

const ANONYMOUS_PREFIX: &str = "anon_";
const ACCOUNT_PREFIX: &str = "user_";

static ANONYMOUS_ID_SHAPE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[0-9a-f-]{36}$").expect("Invalid regex"));

/// Cookie-issued pseudo-identity for a visitor who has not signed in.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct AnonymousId(String);

impl AnonymousId {
    /// Mint a fresh random anonymous id.
    #[must_use]
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Parse a raw cookie value, accepting only the lower-case UUID shape.
    pub fn parse(raw: &str) -> Option<Self> {
        ANONYMOUS_ID_SHAPE
            .is_match(raw)
            .then(|| Self(raw.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AnonymousId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for AnonymousId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s).ok_or_else(|| format!("malformed anonymous id: {s}"))
    }
}

impl TryFrom<String> for AnonymousId {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<AnonymousId> for String {
    fn from(value: AnonymousId) -> Self {
        value.0
    }
}

/// Account identifier supplied by the auth provider.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AccountId(String);

impl AccountId {
    /// Wrap a provider-issued account id. Blank ids are rejected.
    pub fn new(id: impl Into<String>) -> Option<Self> {
        let id = id.into();
        let trimmed = id.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(Self(trimmed.to_string()))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AccountId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// The identity a saved result belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum OwnerId {
    Anonymous(AnonymousId),
    Account(AccountId),
}

impl OwnerId {
    /// Namespaced text form used as the `owner_id` column.
    pub fn storage_key(&self) -> String {
        match self {
            Self::Anonymous(id) => format!("{ANONYMOUS_PREFIX}{id}"),
            Self::Account(id) => format!("{ACCOUNT_PREFIX}{id}"),
        }
    }

    /// Parse a value previously produced by [`OwnerId::storage_key`].
    pub fn from_storage_key(raw: &str) -> Option<Self> {
        if let Some(rest) = raw.strip_prefix(ANONYMOUS_PREFIX) {
            return AnonymousId::parse(rest).map(Self::Anonymous);
        }
        raw.strip_prefix(ACCOUNT_PREFIX)
            .and_then(AccountId::new)
            .map(Self::Account)
    }

    pub const fn is_anonymous(&self) -> bool {
        matches!(self, Self::Anonymous(_))
    }
}

impl fmt::Display for OwnerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.storage_key())
    }
}

impl From<AnonymousId> for OwnerId {
    fn from(value: AnonymousId) -> Self {
        Self::Anonymous(value)
    }
}

impl From<AccountId> for OwnerId {
    fn from(value: AccountId) -> Self {
        Self::Account(value)
    }
}

impl Serialize for OwnerId {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.storage_key())
    }
}

impl<'de> Deserialize<'de> for OwnerId {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Self::from_storage_key(&raw)
            .ok_or_else(|| serde::de::Error::custom(format!("invalid owner id: {raw}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_anonymous_ids_pass_shape_check() {
        let id = AnonymousId::generate();
        assert_eq!(id.as_str().len(), 36);
        assert!(AnonymousId::parse(id.as_str()).is_some());
    }

    #[test]
    fn anonymous_id_rejects_malformed_values() {
        assert!(AnonymousId::parse("").is_none());
        assert!(AnonymousId::parse("not-a-uuid").is_none());
        assert!(AnonymousId::parse("6F9619FF-8B86-D011-B42D-00C04FC964FF").is_none());
        assert!(AnonymousId::parse("6f9619ff-8b86-d011-b42d-00c04fc964ff ").is_none());
        assert!(AnonymousId::parse("6f9619ff-8b86-d011-b42d-00c04fc964ff").is_some());
    }

    #[test]
    fn account_id_rejects_blank() {
        assert!(AccountId::new("   ").is_none());
        assert_eq!(AccountId::new(" u-1 ").unwrap().as_str(), "u-1");
    }

    #[test]
    fn namespaces_never_collide() {
        let anonymous = AnonymousId::generate();
        let spoofed_account = AccountId::new(format!("anon_{anonymous}")).unwrap();
        let raw_account = AccountId::new(anonymous.as_str()).unwrap();

        let anonymous_owner = OwnerId::from(anonymous);
        assert_ne!(
            anonymous_owner.storage_key(),
            OwnerId::from(spoofed_account).storage_key()
        );
        assert_ne!(
            anonymous_owner.storage_key(),
            OwnerId::from(raw_account).storage_key()
        );
    }

    #[test]
    fn storage_key_round_trips() {
        let owner = OwnerId::from(AccountId::new("acct-9").unwrap());
        assert_eq!(OwnerId::from_storage_key(&owner.storage_key()), Some(owner));
        assert_eq!(OwnerId::from_storage_key("anon_bogus"), None);
        assert_eq!(OwnerId::from_storage_key("acct-9"), None);
    }
}
