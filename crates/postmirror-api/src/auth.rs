use axum::http::HeaderMap;
use subtle::ConstantTimeEq;

use crate::error::AppError;

pub const WEBHOOK_SECRET_HEADER: &str = "x-sync-secret";

pub fn extract_bearer_token(headers: &HeaderMap) -> Result<&str, AppError> {
    let header = headers
        .get("authorization")
        .ok_or_else(|| AppError::unauthorized("Missing Authorization header"))?
        .to_str()
        .map_err(|_| AppError::unauthorized("Authorization header is not valid UTF-8"))?;

    let (scheme, token) = header
        .split_once(' ')
        .ok_or_else(|| AppError::unauthorized("Authorization header must be `Bearer <token>`"))?;

    if !scheme.eq_ignore_ascii_case("bearer") {
        return Err(AppError::unauthorized(
            "Authorization scheme must be `Bearer`",
        ));
    }
    let token = token.trim();
    if token.is_empty() {
        return Err(AppError::unauthorized("Bearer token is empty"));
    }

    Ok(token)
}

/// Bearer check against the sync API secret
pub fn require_api_secret(headers: &HeaderMap, secret: Option<&str>) -> Result<(), AppError> {
    let secret = secret.ok_or_else(|| AppError::config("SYNC_API_SECRET is not configured"))?;
    let token = extract_bearer_token(headers)?;
    if constant_time_eq(token.as_bytes(), secret.as_bytes()) {
        Ok(())
    } else {
        Err(AppError::unauthorized("Invalid sync API secret"))
    }
}

/// Same as [`require_api_secret`] but open when no secret is configured
pub fn optional_api_secret(headers: &HeaderMap, secret: Option<&str>) -> Result<(), AppError> {
    match secret {
        Some(_) => require_api_secret(headers, secret),
        None => Ok(()),
    }
}

pub fn require_webhook_secret(headers: &HeaderMap, secret: Option<&str>) -> Result<(), AppError> {
    let secret =
        secret.ok_or_else(|| AppError::config("SYNC_WEBHOOK_SECRET is not configured"))?;
    let provided = headers
        .get(WEBHOOK_SECRET_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .unwrap_or_default();
    if !provided.is_empty() && constant_time_eq(provided.as_bytes(), secret.as_bytes()) {
        Ok(())
    } else {
        Err(AppError::unauthorized("Invalid webhook secret"))
    }
}

/// Length is not hidden; contents are compared without early exit
fn constant_time_eq(left: &[u8], right: &[u8]) -> bool {
    left.ct_eq(right).into()
}

#[cfg(test)]
mod tests {
    use axum::http::HeaderValue;

    use super::*;

    fn headers(name: &'static str, value: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(name, HeaderValue::from_str(value).unwrap());
        headers
    }

    #[test]
    fn bearer_token_is_parsed_case_insensitively() {
        let headers = headers("authorization", "bearer  abc ");
        assert_eq!(extract_bearer_token(&headers).unwrap(), "abc");
    }

    #[test]
    fn bearer_token_rejects_other_schemes() {
        let headers = headers("authorization", "Basic abc");
        assert!(matches!(
            extract_bearer_token(&headers),
            Err(AppError::Unauthorized(_))
        ));
    }

    #[test]
    fn api_secret_checks() {
        let good = headers("authorization", "Bearer s3cret");
        let bad = headers("authorization", "Bearer s3cre7");

        assert!(require_api_secret(&good, Some("s3cret")).is_ok());
        assert!(matches!(
            require_api_secret(&bad, Some("s3cret")),
            Err(AppError::Unauthorized(_))
        ));
        assert!(matches!(
            require_api_secret(&good, None),
            Err(AppError::Config(_))
        ));
        assert!(optional_api_secret(&HeaderMap::new(), None).is_ok());
        assert!(optional_api_secret(&HeaderMap::new(), Some("s3cret")).is_err());
    }

    #[test]
    fn webhook_secret_checks() {
        let good = headers(WEBHOOK_SECRET_HEADER, "hook");
        assert!(require_webhook_secret(&good, Some("hook")).is_ok());
        assert!(require_webhook_secret(&HeaderMap::new(), Some("hook")).is_err());
        assert!(matches!(
            require_webhook_secret(&good, None),
            Err(AppError::Config(_))
        ));
    }

    #[test]
    fn constant_time_eq_compares_lengths_and_bytes() {
        assert!(constant_time_eq(b"abc", b"abc"));
        assert!(!constant_time_eq(b"abc", b"abd"));
        assert!(!constant_time_eq(b"abc", b"abcd"));
    }
}
