//! fitsave-core - Core library for fitsave
//!
//! This crate contains the result-persistence and identity layer shared by the
//! HTTP API and by clients: content-addressed result keys, the two storage
//! drivers, the persistence gateway, identity resolution, and the sign-in
//! sync coordinator.

pub mod config;
pub mod db;
pub mod error;
pub mod gateway;
pub mod identity;
pub mod key;
pub mod models;
pub mod state;
pub mod sync;
pub mod util;
mod validate;

pub use error::{Error, Result};
pub use gateway::{GatewayError, PersistenceGateway};
pub use key::derive_key;
pub use models::{AccountId, AnonymousId, OwnerId, SavedResult, SubmissionKind, SubmissionRecord};
