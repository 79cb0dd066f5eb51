use axum::http::HeaderMap;

use crate::error::AppError;

/// Cross-site request check run before any mutating handler.
pub trait CsrfVerifier: Send + Sync {
    fn verify(&self, headers: &HeaderMap) -> Result<(), AppError>;
}

/// Accepts requests whose `Origin` (or `Referer`) is an allowed origin or
/// matches the request's own `Host`.
#[derive(Debug, Clone, Default)]
pub struct OriginCheck {
    allowed_origins: Vec<String>,
}

impl OriginCheck {
    pub fn new(allowed_origins: Vec<String>) -> Self {
        Self { allowed_origins }
    }
}

impl CsrfVerifier for OriginCheck {
    fn verify(&self, headers: &HeaderMap) -> Result<(), AppError> {
        let source = header_str(headers, "origin")
            .filter(|value| *value != "null")
            .or_else(|| header_str(headers, "referer"))
            .ok_or_else(|| AppError::forbidden("Missing Origin header"))?;

        let origin = url::Url::parse(source)
            .map_err(|_| AppError::forbidden("Malformed Origin header"))?
            .origin();
        if !origin.is_tuple() {
            return Err(AppError::forbidden("Opaque origin is not allowed"));
        }

        let serialized = origin.ascii_serialization();
        if self.allowed_origins.iter().any(|allowed| *allowed == serialized) {
            return Ok(());
        }

        let same_host = match (origin, header_str(headers, "host")) {
            (url::Origin::Tuple(_, host, port), Some(request_host)) => {
                let default_port = matches!(port, 80 | 443);
                let candidate = if default_port {
                    host.to_string()
                } else {
                    format!("{host}:{port}")
                };
                candidate.eq_ignore_ascii_case(request_host)
            }
            _ => false,
        };
        if same_host {
            Ok(())
        } else {
            tracing::warn!(origin = %serialized, "Rejected cross-site request");
            Err(AppError::forbidden("Cross-site request rejected"))
        }
    }
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
}

#[cfg(test)]
mod tests {
    use axum::http::HeaderValue;

    use super::*;

    fn headers(pairs: &[(&'static str, &'static str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (name, value) in pairs {
            map.insert(*name, HeaderValue::from_static(value));
        }
        map
    }

    #[test]
    fn allowed_origin_passes() {
        let check = OriginCheck::new(vec!["https://fit.example.com".to_string()]);
        assert!(check
            .verify(&headers(&[("origin", "https://fit.example.com")]))
            .is_ok());
        assert!(check
            .verify(&headers(&[("referer", "https://fit.example.com/bmi?x=1")]))
            .is_ok());
    }

    #[test]
    fn same_host_passes_without_configuration() {
        let check = OriginCheck::default();
        assert!(check
            .verify(&headers(&[
                ("origin", "http://localhost:3000"),
                ("host", "localhost:3000")
            ]))
            .is_ok());
        assert!(check
            .verify(&headers(&[
                ("origin", "https://fit.example.com"),
                ("host", "fit.example.com")
            ]))
            .is_ok());
    }

    #[test]
    fn foreign_or_missing_origin_is_rejected() {
        let check = OriginCheck::new(vec!["https://fit.example.com".to_string()]);
        assert!(matches!(
            check.verify(&headers(&[("origin", "https://evil.example"), ("host", "fit.example.com")])),
            Err(AppError::Forbidden(_))
        ));
        assert!(matches!(
            check.verify(&headers(&[("host", "fit.example.com")])),
            Err(AppError::Forbidden(_))
        ));
        assert!(check.verify(&headers(&[("origin", "null")])).is_err());
    }
}
