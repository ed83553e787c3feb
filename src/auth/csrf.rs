//! Per-session CSRF tokens.

use actix_web::{web, HttpRequest, HttpResponse};
use chrono::{DateTime, Duration, Utc};
use serde_json::json;
use tracing::warn;
use url::Url;

use crate::auth::session::Session;
use crate::auth::tokens::{constant_time_eq, random_hex};
use crate::error::AuthError;
use crate::{AppState, Result};

pub const HEADER_NAME: &str = "X-CSRF-Token";

#[derive(Debug, Clone, PartialEq)]
pub struct CsrfToken {
    pub value: String,
    pub created_at: DateTime<Utc>,
}

impl CsrfToken {
    pub fn issue() -> Self {
        Self {
            value: random_hex(32),
            created_at: Utc::now(),
        }
    }

    pub fn is_expired(&self, lifetime: Duration) -> bool {
        Utc::now() - self.created_at > lifetime
    }

    pub fn remaining_secs(&self, lifetime: Duration) -> i64 {
        (self.created_at + lifetime - Utc::now()).num_seconds().max(0)
    }
}

/// Current token of the session, issuing a new one when missing or expired.
pub fn current_token(session: &Session, lifetime: Duration) -> CsrfToken {
    match session.csrf() {
        Some(token) if !token.is_expired(lifetime) => token,
        _ => {
            let token = CsrfToken::issue();
            session.set_csrf(Some(token.clone()));
            token
        }
    }
}

/// An expired stored token is replaced before the check fails, so the
/// client can fetch the new one and retry.
pub fn validate(session: &Session, submitted: Option<&str>, lifetime: Duration) -> bool {
    let submitted = match submitted.map(str::trim) {
        Some(value) if !value.is_empty() => value,
        _ => return false,
    };

    match session.csrf() {
        None => false,
        Some(stored) if stored.is_expired(lifetime) => {
            session.set_csrf(Some(CsrfToken::issue()));
            false
        }
        Some(stored) => constant_time_eq(stored.value.as_bytes(), submitted.as_bytes()),
    }
}

/// Body field first, then the `X-CSRF-Token` header.
pub fn submitted_token<'a>(req: &'a HttpRequest, body_field: Option<&'a str>) -> Option<&'a str> {
    body_field.filter(|value| !value.is_empty()).or_else(|| {
        req.headers()
            .get(HEADER_NAME)
            .and_then(|value| value.to_str().ok())
    })
}

pub fn require(
    session: &Session,
    req: &HttpRequest,
    body_field: Option<&str>,
    lifetime: Duration,
) -> Result<()> {
    if validate(session, submitted_token(req, body_field), lifetime) {
        Ok(())
    } else {
        warn!("CSRF validation failed for {}", req.path());
        Err(AuthError::CsrfInvalid.into())
    }
}

fn host_of(authority: &str) -> Option<String> {
    Url::parse(&format!("http://{}", authority))
        .ok()
        .and_then(|url| url.host_str().map(str::to_string))
}

/// A present Referer must point at the host serving the request.
pub fn same_origin(req: &HttpRequest) -> bool {
    let referer = match req
        .headers()
        .get(actix_web::http::header::REFERER)
        .and_then(|value| value.to_str().ok())
    {
        Some(referer) => referer,
        None => return true,
    };

    let referer_host = Url::parse(referer)
        .ok()
        .and_then(|url| url.host_str().map(str::to_string));
    let request_host = host_of(req.connection_info().host());

    match (referer_host, request_host) {
        (Some(a), Some(b)) => a.eq_ignore_ascii_case(&b),
        _ => false,
    }
}

fn is_ajax(req: &HttpRequest) -> bool {
    req.headers()
        .get("X-Requested-With")
        .and_then(|value| value.to_str().ok())
        .map_or(false, |value| value.eq_ignore_ascii_case("XMLHttpRequest"))
}

pub async fn csrf_token(
    req: HttpRequest,
    session: Session,
    state: web::Data<AppState>,
) -> Result<HttpResponse> {
    if !is_ajax(&req) || !same_origin(&req) {
        warn!("Rejected CSRF token request from foreign origin");
        return Err(AuthError::ForeignOrigin.into());
    }

    let lifetime = state.csrf_lifetime();
    let token = current_token(&session, lifetime);

    Ok(HttpResponse::Ok().json(json!({
        "success": true,
        "token": token.value,
        "expira_en_segundos": token.remaining_secs(lifetime),
        "timestamp": Utc::now().timestamp()
    })))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::session::AuthState;
    use actix_web::test::TestRequest;

    fn lifetime() -> Duration {
        Duration::seconds(1800)
    }

    #[test]
    fn test_token_is_reused_until_expiry() {
        let session = Session::for_test(AuthState::Anonymous);
        let first = current_token(&session, lifetime());
        let second = current_token(&session, lifetime());
        assert_eq!(first, second);
        assert_eq!(first.value.len(), 64);
    }

    #[test]
    fn test_validate() {
        let session = Session::for_test(AuthState::Anonymous);
        assert!(!validate(&session, Some("anything"), lifetime()));

        let token = current_token(&session, lifetime());
        assert!(validate(&session, Some(&token.value), lifetime()));
        assert!(!validate(&session, Some("wrong"), lifetime()));
        assert!(!validate(&session, None, lifetime()));
        assert!(!validate(&session, Some(""), lifetime()));
    }

    #[test]
    fn test_expired_token_is_replaced_and_rejected() {
        let session = Session::for_test(AuthState::Anonymous);
        let stale = CsrfToken {
            value: "a".repeat(64),
            created_at: Utc::now() - Duration::seconds(3600),
        };
        session.set_csrf(Some(stale.clone()));

        assert!(!validate(&session, Some(&stale.value), lifetime()));
        let renewed = session.csrf().unwrap();
        assert_ne!(renewed.value, stale.value);
        assert!(validate(&session, Some(&renewed.value), lifetime()));
    }

    #[test]
    fn test_submitted_token_prefers_body() {
        let req = TestRequest::default()
            .insert_header((HEADER_NAME, "from-header"))
            .to_http_request();
        assert_eq!(submitted_token(&req, Some("from-body")), Some("from-body"));
        assert_eq!(submitted_token(&req, Some("")), Some("from-header"));
        assert_eq!(submitted_token(&req, None), Some("from-header"));

        let bare = TestRequest::default().to_http_request();
        assert_eq!(submitted_token(&bare, None), None);
    }

    #[test]
    fn test_same_origin() {
        let req = TestRequest::default()
            .insert_header(("Host", "portal.example.com:8080"))
            .insert_header(("Referer", "https://portal.example.com/gh/login"))
            .to_http_request();
        assert!(same_origin(&req));

        let req = TestRequest::default()
            .insert_header(("Host", "portal.example.com"))
            .insert_header(("Referer", "https://evil.example.net/"))
            .to_http_request();
        assert!(!same_origin(&req));

        let req = TestRequest::default()
            .insert_header(("Host", "portal.example.com"))
            .to_http_request();
        assert!(same_origin(&req));
    }
}
