//! Newsletter and contact submissions (append-only)

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Which form produced a submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SubmissionKind {
    Newsletter,
    Contact,
}

impl SubmissionKind {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Newsletter => "newsletter",
            Self::Contact => "contact",
        }
    }
}

impl fmt::Display for SubmissionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SubmissionKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "newsletter" => Ok(Self::Newsletter),
            "contact" => Ok(Self::Contact),
            other => Err(format!("unknown submission kind: {other}")),
        }
    }
}

/// A single form submission.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmissionRecord {
    pub kind: SubmissionKind,
    pub payload: Map<String, Value>,
    /// Creation timestamp (Unix ms)
    pub created_at: i64,
}

impl SubmissionRecord {
    #[must_use]
    pub fn new(kind: SubmissionKind, payload: Map<String, Value>) -> Self {
        Self {
            kind,
            payload,
            created_at: crate::util::unix_millis_now(),
        }
    }
}
