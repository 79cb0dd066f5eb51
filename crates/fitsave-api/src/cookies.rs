use axum::http::{HeaderMap, HeaderValue};

pub const ANONYMOUS_COOKIE: &str = "fitsave_anon";
const ANONYMOUS_COOKIE_MAX_AGE_SECS: u64 = 31_536_000;

/// Value of cookie `name` across every `Cookie` header on the request.
pub fn read_cookie(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get_all("cookie")
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|header| header.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(key, _)| *key == name)
        .map(|(_, value)| value.trim().trim_matches('"').to_string())
        .filter(|value| !value.is_empty())
}

/// `Set-Cookie` value remembering an anonymous id for a year.
///
/// Returns `None` when the value cannot be encoded; the visitor just is not remembered.
pub fn anonymous_cookie(value: &str, secure: bool) -> Option<HeaderValue> {
    let mut cookie = format!(
        "{ANONYMOUS_COOKIE}={value}; Path=/; Max-Age={ANONYMOUS_COOKIE_MAX_AGE_SECS}; HttpOnly; SameSite=Lax"
    );
    if secure {
        cookie.push_str("; Secure");
    }
    match HeaderValue::from_str(&cookie) {
        Ok(header) => Some(header),
        Err(error) => {
            tracing::warn!(%error, "Could not encode anonymous identity cookie");
            None
        }
    }
}
