//! Authentication for the portal
//!
//! Password login with per-(ip, email) lockout, a second factor through an
//! authenticator app or an emailed code, server-side sessions and CSRF
//! tokens.

pub mod cipher;
pub mod client;
pub mod csrf;
pub mod handlers;
pub mod lockout;
pub mod password;
pub mod rate_limit;
pub mod recovery;
pub mod session;
pub mod tokens;
pub mod totp;

pub use cipher::SecretCipher;
pub use lockout::LoginLockout;
pub use rate_limit::{RateLimitConfig, RateLimiter};
pub use session::{session_middleware, AdminUser, CurrentUser, Session, SessionStore, SessionUser};

use actix_web::HttpRequest;
use tracing::warn;

use crate::db::models::NuevoAcceso;
use crate::AppState;
use client::{client_ip, describe_agent, user_agent};

/// Appends an entry to the access history. Failures are logged and never
/// reach the caller.
pub async fn record_access(state: &AppState, req: &HttpRequest, usuario_id: i64, exito: bool, detalles: &str) {
    let (dispositivo, navegador) = describe_agent(user_agent(req));
    let entry = NuevoAcceso {
        usuario_id,
        ip: client_ip(req),
        dispositivo: dispositivo.to_string(),
        navegador: navegador.to_string(),
        exito,
        detalles: detalles.to_string(),
    };

    if let Err(e) = state.security.log_access(entry).await {
        warn!("Could not record access for user {}: {}", usuario_id, e);
    }
}
