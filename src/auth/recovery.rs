//! Password recovery by emailed link and self-service password change.

use actix_web::{web, HttpRequest, HttpResponse};
use chrono::{Duration, Utc};
use serde::Deserialize;
use serde_json::json;
use tracing::{error, info, warn};

use crate::auth::client::client_ip;
use crate::auth::csrf;
use crate::auth::lockout::{format_remaining, FailureOutcome, LockStatus};
use crate::auth::password::{hash_password, validate_new_password, verify_password, Strength};
use crate::auth::record_access;
use crate::auth::session::{CurrentUser, Session};
use crate::auth::tokens::{random_hex, sha256_hex};
use crate::error::{AppError, AuthError};
use crate::mail;
use crate::portal::validate::is_valid_email;
use crate::{AppState, Result};

const GENERIC_FORGOT_MESSAGE: &str =
    "Si el correo está registrado, recibirás un enlace para restablecer tu contraseña.";

#[derive(Debug, Deserialize)]
pub struct ForgotRequest {
    #[serde(default)]
    pub email: String,
    pub csrf_token: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ResetRequest {
    #[serde(default)]
    pub token: String,
    #[serde(default)]
    pub password: String,
    #[serde(default)]
    pub confirm: String,
    pub csrf_token: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ChangeRequest {
    #[serde(default)]
    pub current: String,
    #[serde(default)]
    pub new: String,
    #[serde(default)]
    pub confirm: String,
    pub csrf_token: Option<String>,
}

fn reset_link(state: &AppState, token: &str) -> String {
    format!("{}recuperar_contraseña.php?token={}", state.config.public_url, token)
}

pub async fn forgot(
    req: HttpRequest,
    body: web::Json<ForgotRequest>,
    session: Session,
    state: web::Data<AppState>,
) -> Result<HttpResponse> {
    csrf::require(&session, &req, body.csrf_token.as_deref(), state.csrf_lifetime())?;

    let email = body.email.trim().to_lowercase();
    if !is_valid_email(&email) {
        return Err(AppError::validation("Por favor ingresa un correo electrónico válido"));
    }

    let ip = client_ip(&req);
    if let Err(wait) = state.reset_limiter.check_rate_limit(&format!("reset:{}", ip)).await {
        return Err(AuthError::RateLimited(format!(
            "Demasiadas solicitudes. Intenta nuevamente en {} segundos.",
            wait
        ))
        .into());
    }

    let security = state.security.as_ref();
    if let LockStatus::Locked { remaining_secs } = state.lockout.check(security, &ip, &email).await? {
        return Err(AuthError::Locked {
            wait: format_remaining(remaining_secs),
        }
        .into());
    }
    if let FailureOutcome::Locked { remaining_secs } = state.lockout.record_failure(security, &ip, &email).await? {
        return Err(AuthError::Locked {
            wait: format_remaining(remaining_secs),
        }
        .into());
    }

    if let Some(usuario) = state.users.find_by_email(&email).await? {
        state.security.delete_reset_tokens(usuario.id).await?;

        let token = random_hex(32);
        let expires_at = Utc::now() + Duration::seconds(state.config.security.reset_token_secs);
        state
            .security
            .replace_reset_token(usuario.id, &sha256_hex(&token), expires_at)
            .await?;

        let (subject, html) = mail::password_reset(&usuario.nombre, &reset_link(&state, &token));
        match state.mailer.send(&usuario.email, &subject, &html).await {
            Ok(()) => info!("Password reset link sent to user {}", usuario.id),
            Err(e) => error!("Password reset email failed for user {}: {}", usuario.id, e),
        }
    } else {
        warn!("Password reset requested for unknown email from {}", ip);
    }

    Ok(HttpResponse::Ok().json(json!({
        "success": true,
        "message": GENERIC_FORGOT_MESSAGE
    })))
}

pub async fn reset(
    req: HttpRequest,
    body: web::Json<ResetRequest>,
    session: Session,
    state: web::Data<AppState>,
) -> Result<HttpResponse> {
    csrf::require(&session, &req, body.csrf_token.as_deref(), state.csrf_lifetime())?;

    let token = body.token.trim();
    if token.is_empty() {
        return Err(AppError::validation("El enlace de recuperación no es válido"));
    }
    validate_new_password(&body.password, &body.confirm, Strength::Standard)?;

    let stored = state
        .security
        .find_reset_token(&sha256_hex(token))
        .await?
        .ok_or_else(|| AppError::validation("El enlace de recuperación no es válido o ya fue utilizado"))?;
    if stored.is_expired() {
        state.security.delete_reset_tokens(stored.usuario_id).await?;
        return Err(AppError::validation(
            "El enlace de recuperación ha expirado. Solicita uno nuevo.",
        ));
    }

    state
        .users
        .update_password(stored.usuario_id, &hash_password(&body.password)?)
        .await?;
    state.security.delete_reset_tokens(stored.usuario_id).await?;
    record_access(&state, &req, stored.usuario_id, true, "Contraseña restablecida vía token").await;
    info!("Password reset completed for user {}", stored.usuario_id);

    Ok(HttpResponse::Ok().json(json!({
        "success": true,
        "message": "Tu contraseña ha sido restablecida. Ya puedes iniciar sesión.",
        "redirect": state.config.storage.base_url
    })))
}

pub async fn change(
    req: HttpRequest,
    body: web::Json<ChangeRequest>,
    current: CurrentUser,
    state: web::Data<AppState>,
) -> Result<HttpResponse> {
    csrf::require(&current.session, &req, body.csrf_token.as_deref(), state.csrf_lifetime())?;

    if body.current.is_empty() {
        return Err(AppError::validation("Todos los campos son obligatorios"));
    }
    validate_new_password(&body.new, &body.confirm, Strength::Strict)?;
    if body.new == body.current {
        return Err(AppError::validation(
            "La nueva contraseña debe ser diferente a la actual",
        ));
    }

    let usuario = state
        .users
        .find_by_id(current.user.id)
        .await?
        .ok_or(AuthError::NotAuthenticated)?;
    if !verify_password(&body.current, &usuario.contrasena) {
        return Err(AppError::validation("La contraseña actual es incorrecta"));
    }

    state
        .users
        .update_password(usuario.id, &hash_password(&body.new)?)
        .await?;
    record_access(&state, &req, usuario.id, true, "Cambio de contraseña exitoso").await;

    Ok(HttpResponse::Ok().json(json!({
        "success": true,
        "message": "Contraseña actualizada correctamente"
    })))
}
