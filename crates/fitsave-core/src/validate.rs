//! Input checks applied by the gateway before anything reaches a driver.

use std::sync::LazyLock;

use regex::Regex;
use serde_json::{Map, Value};

use crate::gateway::GatewayError;
use crate::models::SubmissionKind;

pub const MAX_CALCULATOR_TYPE_LEN: usize = 80;
pub const MAX_CALCULATOR_NAME_LEN: usize = 140;
pub const MAX_RESULT_ID_LEN: usize = 100;
pub const MAX_EMAIL_LEN: usize = 254;
pub const MAX_MESSAGE_LEN: usize = 5000;
pub const MAX_LIST_LIMIT: usize = 30;

static RESULT_ID_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-zA-Z0-9_-]+$").expect("Invalid regex"));
/// Calculator types become the prefix of every result id, so they share its alphabet.
static CALCULATOR_TYPE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-zA-Z0-9_-]+$").expect("Invalid regex"));
static EMAIL_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[^\s@]+@[^\s@]+\.[^\s@]+$").expect("Invalid regex"));

fn invalid(message: impl Into<String>) -> GatewayError {
    GatewayError::Validation(message.into())
}

/// Required, non-blank, at most `max` characters. Returns the trimmed value.
pub fn required_text<'a>(
    value: &'a str,
    field: &str,
    max: usize,
) -> Result<&'a str, GatewayError> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(invalid(format!("{field} is required")));
    }
    if trimmed.chars().count() > max {
        return Err(invalid(format!("{field} must be at most {max} characters")));
    }
    Ok(trimmed)
}

pub fn calculator_type(value: &str) -> Result<&str, GatewayError> {
    let trimmed = required_text(value, "calculatorType", MAX_CALCULATOR_TYPE_LEN)?;
    if !CALCULATOR_TYPE_RE.is_match(trimmed) {
        return Err(invalid(
            "calculatorType may only contain letters, digits, '-' and '_'",
        ));
    }
    Ok(trimmed)
}

pub fn calculator_name(value: &str) -> Result<&str, GatewayError> {
    required_text(value, "calculatorName", MAX_CALCULATOR_NAME_LEN)
}

pub fn result_id(value: &str) -> Result<&str, GatewayError> {
    if value.len() > MAX_RESULT_ID_LEN || !RESULT_ID_RE.is_match(value) {
        return Err(invalid("Invalid result id"));
    }
    Ok(value)
}

/// Missing or zero limits fall back to the maximum.
pub fn list_limit(requested: Option<usize>) -> usize {
    requested
        .filter(|limit| *limit > 0)
        .map_or(MAX_LIST_LIMIT, |limit| limit.min(MAX_LIST_LIMIT))
}

pub fn submission(kind: SubmissionKind, payload: &Map<String, Value>) -> Result<(), GatewayError> {
    let email = payload
        .get("email")
        .and_then(Value::as_str)
        .map(str::trim)
        .unwrap_or_default();
    if email.is_empty() {
        return Err(invalid("email is required"));
    }
    if email.len() > MAX_EMAIL_LEN || !EMAIL_RE.is_match(email) {
        return Err(invalid("email is not a valid address"));
    }

    if kind == SubmissionKind::Contact {
        let message = payload
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or_default();
        required_text(message, "message", MAX_MESSAGE_LEN)?;
    }
    Ok(())
}
