//! Data models for fitsave

mod owner;
mod saved_result;
mod submission;

pub use owner::{AccountId, AnonymousId, OwnerId};
pub use saved_result::SavedResult;
pub use submission::{SubmissionKind, SubmissionRecord};
