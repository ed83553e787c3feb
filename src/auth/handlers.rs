use actix_web::{web, HttpRequest, HttpResponse};
use chrono::{Duration, Utc};
use lazy_static::lazy_static;
use regex::Regex;
use serde::Deserialize;
use serde_json::json;
use tracing::{error, info, warn};

use crate::auth::client::client_ip;
use crate::auth::csrf;
use crate::auth::lockout::{format_remaining, FailureOutcome, LockStatus};
use crate::auth::password::{hash_password, verify_password};
use crate::auth::session::{AuthState, CurrentUser, Session, SessionUser, TotpSetup};
use crate::auth::tokens::random_digits;
use crate::auth::{record_access, totp};
use crate::error::{AppError, AuthError};
use crate::mail;
use crate::{AppState, Result};

lazy_static! {
    static ref SIX_DIGITS: Regex = Regex::new(r"^\d{6}$").unwrap();
}

#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub password: String,
    pub csrf_token: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct CodeRequest {
    #[serde(default)]
    pub code: String,
    pub csrf_token: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct CsrfOnly {
    pub csrf_token: Option<String>,
}

fn home_for(state: &AppState, user: &SessionUser) -> String {
    if user.is_admin() {
        state.config.admin_home()
    } else {
        state.config.user_home()
    }
}

/// Final step of every login path: authenticated state, fresh session id,
/// access history entry.
async fn complete_login(
    req: &HttpRequest,
    session: &Session,
    state: &AppState,
    user: SessionUser,
    detalles: &str,
) -> Result<HttpResponse> {
    let redirect = home_for(state, &user);
    let user_id = user.id;

    session.set_totp_setup(None);
    session.set_auth(AuthState::Authenticated { user });
    session.renew();
    record_access(state, req, user_id, true, detalles).await;
    info!("User {} logged in", user_id);

    Ok(HttpResponse::Ok().json(json!({
        "success": true,
        "redirect": redirect
    })))
}

fn validate_code_format(code: &str) -> Result<()> {
    if code.is_empty() {
        return Err(AppError::validation("Por favor ingresa el código de verificación"));
    }
    if !SIX_DIGITS.is_match(code) {
        return Err(AppError::validation("El código debe ser de 6 dígitos"));
    }
    Ok(())
}

pub async fn login(
    req: HttpRequest,
    body: web::Json<LoginRequest>,
    session: Session,
    state: web::Data<AppState>,
) -> Result<HttpResponse> {
    csrf::require(&session, &req, body.csrf_token.as_deref(), state.csrf_lifetime())?;

    let ip = client_ip(&req);
    let email = body.email.trim().to_lowercase();
    let security = state.security.as_ref();

    if !email.is_empty() {
        if let LockStatus::Locked { remaining_secs } = state.lockout.check(security, &ip, &email).await? {
            warn!("Blocked login attempt from {}", ip);
            return Err(AuthError::Locked {
                wait: format_remaining(remaining_secs),
            }
            .into());
        }
    }

    if email.is_empty() || body.password.is_empty() {
        return Err(AppError::validation("Debe ingresar correo y contraseña"));
    }

    let usuario = match state.users.find_by_email(&email).await? {
        Some(usuario) if verify_password(&body.password, &usuario.contrasena) => usuario,
        other => {
            if let Some(usuario) = &other {
                record_access(
                    &state,
                    &req,
                    usuario.id,
                    false,
                    "Intento de inicio de sesión fallido - Contraseña incorrecta",
                )
                .await;
            }
            let err = match state.lockout.record_failure(security, &ip, &email).await? {
                FailureOutcome::Remaining(remaining) => AuthError::InvalidCredentials { remaining },
                FailureOutcome::Locked { remaining_secs } => AuthError::Locked {
                    wait: format_remaining(remaining_secs),
                },
            };
            return Err(err.into());
        }
    };

    state.lockout.reset(security, &ip, &email).await?;

    let user = SessionUser::from(&usuario);
    let now = Utc::now();

    if usuario.is_admin() && !usuario.has_totp_secret() {
        let expires_at = now + Duration::seconds(state.config.security.setup_2fa_secs);
        session.set_totp_setup(Some(TotpSetup {
            secret: totp::generate_secret(),
            expires_at,
        }));
        session.set_auth(AuthState::AwaitingSetup { user, expires_at });
        session.renew();
        info!("Admin {} must configure 2FA", usuario.id);
        return Ok(HttpResponse::Ok().json(json!({
            "success": true,
            "next": "setup_2fa"
        })));
    }

    if usuario.tiene_2fa && usuario.has_totp_secret() {
        let expires_at = now + Duration::seconds(state.config.security.pending_2fa_secs);
        session.set_auth(AuthState::AwaitingTwoFactor { user, expires_at });
        session.renew();
        return Ok(HttpResponse::Ok().json(json!({
            "success": true,
            "next": "verify_2fa"
        })));
    }

    complete_login(&req, &session, &state, user, "Inicio de sesión exitoso").await
}

/// Secret being enrolled, for either the forced first-login setup or a
/// logged-in user turning 2FA on.
fn active_setup(session: &Session) -> Result<(SessionUser, TotpSetup)> {
    let user = match session.auth() {
        AuthState::AwaitingSetup { user, .. } | AuthState::Authenticated { user } => user,
        AuthState::AwaitingTwoFactor { .. } => return Err(AuthError::TwoFactorPending.into()),
        AuthState::Anonymous => return Err(AuthError::NotAuthenticated.into()),
    };

    match session.totp_setup() {
        Some(setup) if setup.expires_at > Utc::now() => Ok((user, setup)),
        Some(_) => {
            if matches!(session.auth(), AuthState::AwaitingSetup { .. }) {
                session.purge();
            } else {
                session.set_totp_setup(None);
            }
            Err(AuthError::CodeRejected(
                "El tiempo para configurar el 2FA ha expirado. Por favor inicia sesión nuevamente.".to_string(),
            )
            .into())
        }
        None => Err(AppError::validation("No hay una configuración 2FA en curso")),
    }
}

pub async fn setup_info(session: Session, state: web::Data<AppState>) -> Result<HttpResponse> {
    let (user, setup) = active_setup(&session)?;

    let uri = totp::provisioning_uri(&state.config.security.totp_issuer, &user.email, &setup.secret);
    let qr = totp::qr_svg(&uri)?;

    Ok(HttpResponse::Ok().json(json!({
        "success": true,
        "secret_display": totp::display_secret(&setup.secret),
        "otpauth_uri": uri,
        "qr_svg": qr,
        "expira_en": setup.expires_at.timestamp()
    })))
}

pub async fn setup_confirm(
    req: HttpRequest,
    body: web::Json<CodeRequest>,
    session: Session,
    state: web::Data<AppState>,
) -> Result<HttpResponse> {
    csrf::require(&session, &req, body.csrf_token.as_deref(), state.csrf_lifetime())?;
    let (user, setup) = active_setup(&session)?;

    let code = body.code.trim();
    if code.is_empty() {
        return Err(AppError::validation("Por favor ingresa el código de verificación de tu app."));
    }
    if !SIX_DIGITS.is_match(code) {
        return Err(AppError::validation("El código debe ser de 6 dígitos."));
    }
    if !totp::verify(&setup.secret, code) {
        return Err(AuthError::CodeRejected(
            "Código incorrecto. Verifica que tu app muestre el código correcto y que la hora de tu dispositivo esté sincronizada."
                .to_string(),
        )
        .into());
    }

    let encrypted = state.cipher.encrypt(&setup.secret)?;
    state.users.set_two_factor(user.id, true, Some(encrypted)).await?;
    session.set_totp_setup(None);

    if matches!(session.auth(), AuthState::AwaitingSetup { .. }) {
        return complete_login(
            &req,
            &session,
            &state,
            user,
            "Login exitoso - 2FA configurado por primera vez (App de Autenticación)",
        )
        .await;
    }

    record_access(&state, &req, user.id, true, "Verificación 2FA activada").await;
    notify_two_factor_enabled(&state, &user).await;
    session.renew();
    Ok(HttpResponse::Ok().json(json!({
        "success": true,
        "message": "Verificación en dos pasos activada correctamente"
    })))
}

pub(crate) async fn notify_two_factor_enabled(state: &AppState, user: &SessionUser) {
    let (subject, html) = mail::two_factor_enabled(&user.nombre);
    if let Err(e) = state.mailer.send(&user.email, &subject, &html).await {
        warn!("Could not send 2FA confirmation to user {}: {}", user.id, e);
    }
}

fn pending_user(session: &Session) -> Result<SessionUser> {
    match session.auth() {
        AuthState::AwaitingTwoFactor { user, expires_at } => {
            if expires_at < Utc::now() {
                session.purge();
                return Err(AuthError::CodeExpired.into());
            }
            Ok(user)
        }
        AuthState::Authenticated { .. } => Err(AppError::validation("La sesión ya está verificada")),
        _ => Err(AuthError::NotAuthenticated.into()),
    }
}

pub async fn verify(
    req: HttpRequest,
    body: web::Json<CodeRequest>,
    session: Session,
    state: web::Data<AppState>,
) -> Result<HttpResponse> {
    csrf::require(&session, &req, body.csrf_token.as_deref(), state.csrf_lifetime())?;
    let user = pending_user(&session)?;

    let code = body.code.trim();
    validate_code_format(code)?;

    let usuario = state
        .users
        .find_by_id(user.id)
        .await?
        .ok_or(AuthError::NotAuthenticated)?;

    let totp_ok = match usuario.secreto_2fa.as_deref().filter(|s| !s.is_empty()) {
        Some(encrypted) => match state.cipher.decrypt(encrypted) {
            Ok(secret) => totp::verify(&secret, code),
            Err(e) => {
                error!("Stored 2FA secret for user {} unreadable: {}", user.id, e);
                false
            }
        },
        None => false,
    };
    if totp_ok {
        return complete_login(&req, &session, &state, user, "Login exitoso con verificación 2FA").await;
    }

    let max_attempts = state.config.security.email_code_max_attempts;
    let rejection = match state.security.active_email_code(user.id).await? {
        Some(stored) if stored.is_expired() => {
            state.security.mark_code_used(stored.id).await?;
            AuthError::CodeRejected("El código ha expirado. Por favor solicita uno nuevo.".to_string())
        }
        Some(stored) if stored.intentos >= max_attempts => {
            state.security.mark_code_used(stored.id).await?;
            AuthError::CodeRejected(
                "Demasiados intentos fallidos. Por favor solicita un nuevo código.".to_string(),
            )
        }
        Some(stored) if verify_password(code, &stored.codigo_hash) => {
            state.security.mark_code_used(stored.id).await?;
            return complete_login(&req, &session, &state, user, "Login exitoso con verificación 2FA").await;
        }
        Some(stored) => {
            state.security.increment_code_attempts(stored.id).await?;
            let remaining = max_attempts - stored.intentos - 1;
            if remaining <= 0 {
                AuthError::CodeRejected(
                    "Código incorrecto. Has agotado todos los intentos. Solicita un nuevo código.".to_string(),
                )
            } else {
                AuthError::CodeRejected(format!(
                    "Código incorrecto. Te quedan {} intento{}.",
                    remaining,
                    if remaining > 1 { "s" } else { "" }
                ))
            }
        }
        None => AuthError::InvalidCode,
    };

    record_access(&state, &req, user.id, false, "Código 2FA incorrecto").await;
    Err(rejection.into())
}

pub async fn resend(
    req: HttpRequest,
    body: web::Json<CsrfOnly>,
    session: Session,
    state: web::Data<AppState>,
) -> Result<HttpResponse> {
    csrf::require(&session, &req, body.csrf_token.as_deref(), state.csrf_lifetime())?;
    let user = pending_user(&session)?;

    if let Err(wait) = state.resend_limiter.check_rate_limit(&format!("2fa:{}", user.id)).await {
        return Err(AuthError::RateLimited(format!(
            "Espera {} segundos para solicitar otro código.",
            wait
        ))
        .into());
    }

    state.security.invalidate_email_codes(user.id).await?;
    let code = random_digits(6);
    let expires_at = Utc::now() + Duration::seconds(state.config.security.email_code_secs);
    state
        .security
        .create_email_code(user.id, &hash_password(&code)?, expires_at)
        .await?;

    let (subject, html) = mail::two_factor_code(
        &user.nombre,
        &code,
        state.config.security.email_code_secs / 60,
    );
    state.mailer.send(&user.email, &subject, &html).await.map_err(|e| {
        error!("2FA code email failed for user {}: {}", user.id, e);
        AppError::MailError("No se pudo enviar el código. Por favor intenta nuevamente.".to_string())
    })?;

    Ok(HttpResponse::Ok().json(json!({
        "success": true,
        "message": "Se ha enviado un nuevo código a tu correo."
    })))
}

pub async fn logout(req: HttpRequest, session: Session, state: web::Data<AppState>) -> Result<HttpResponse> {
    if let Some(user) = session.user() {
        record_access(&state, &req, user.id, true, "Cierre de sesión manual - Usuario").await;
        info!("User {} logged out", user.id);
    }
    session.purge();

    Ok(HttpResponse::Ok().json(json!({
        "success": true,
        "redirect": state.config.storage.base_url
    })))
}

pub async fn current_session(current: CurrentUser, state: web::Data<AppState>) -> Result<HttpResponse> {
    let user = &current.user;
    Ok(HttpResponse::Ok().json(json!({
        "success": true,
        "usuario": {
            "id": user.id,
            "nombre": user.nombre,
            "apellido": user.apellido,
            "email": user.email,
            "rol": user.rol,
            "es_admin": user.is_admin()
        },
        "inicio": home_for(&state, user)
    })))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::csrf::current_token;
    use crate::db::models::{CodigoDosFactores, Usuario};
    use crate::test_support::{test_state, usuario, Mocks};
    use actix_web::http::StatusCode;
    use actix_web::test::TestRequest;
    use actix_web::ResponseError;

    fn request() -> HttpRequest {
        TestRequest::default()
            .peer_addr("203.0.113.5:4000".parse().unwrap())
            .insert_header(("User-Agent", "Mozilla/5.0 Firefox/120.0"))
            .to_http_request()
    }

    fn login_body(session: &Session, email: &str, password: &str) -> web::Json<LoginRequest> {
        let token = current_token(session, Duration::seconds(1800));
        web::Json(LoginRequest {
            email: email.into(),
            password: password.into(),
            csrf_token: Some(token.value),
        })
    }

    fn with_password(mut user: Usuario, password: &str) -> Usuario {
        user.contrasena = bcrypt::hash(password, 4).unwrap();
        user
    }

    async fn body_json(resp: HttpResponse) -> serde_json::Value {
        let bytes = actix_web::body::to_bytes(resp.into_body()).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[actix_web::test]
    async fn test_login_rejects_bad_csrf() {
        let state = test_state(Mocks::default());
        let session = Session::for_test(AuthState::Anonymous);
        let body = web::Json(LoginRequest {
            email: "ana@example.com".into(),
            password: "x".into(),
            csrf_token: Some("forged".into()),
        });

        let err = login(request(), body, session, state).await.unwrap_err();
        assert_eq!(err.status_code(), StatusCode::FORBIDDEN);
        assert_eq!(err.public_message(), "Token de seguridad inválido");
    }

    #[actix_web::test]
    async fn test_login_locked() {
        let mut mocks = Mocks::default();
        mocks.security.expect_get_lockout().returning(|ip, email| {
            Ok(Some(crate::db::models::BloqueoAcceso {
                ip: ip.to_string(),
                email: email.to_string(),
                intentos: 5,
                ultimo_intento: Utc::now(),
                bloqueado_hasta: Some(Utc::now() + Duration::seconds(600)),
            }))
        });
        let state = test_state(mocks);
        let session = Session::for_test(AuthState::Anonymous);
        let body = login_body(&session, "ana@example.com", "Secreta123");

        let err = login(request(), body, session, state).await.unwrap_err();
        assert_eq!(err.status_code(), StatusCode::TOO_MANY_REQUESTS);
        assert!(err.public_message().starts_with("Demasiados intentos fallidos"));
    }

    #[actix_web::test]
    async fn test_wrong_password_counts_down() {
        let mut mocks = Mocks::default();
        mocks.security.expect_get_lockout().returning(|_, _| Ok(None));
        mocks.security.expect_record_failed_attempt().returning(|_, _, _, _| Ok(1));
        mocks
            .security
            .expect_log_access()
            .withf(|entry| !entry.exito && entry.detalles.contains("Contraseña incorrecta") && entry.ip == "203.0.113.5")
            .times(1)
            .returning(|_| Ok(()));
        mocks
            .users
            .expect_find_by_email()
            .returning(|_| Ok(Some(with_password(usuario(7, "usuario"), "Correcta123"))));
        let state = test_state(mocks);
        let session = Session::for_test(AuthState::Anonymous);
        let body = login_body(&session, "ana@example.com", "Incorrecta1");

        let err = login(request(), body, session, state).await.unwrap_err();
        assert_eq!(err.status_code(), StatusCode::UNAUTHORIZED);
        assert_eq!(
            err.public_message(),
            "Credenciales incorrectas. Le quedan 4 intentos antes del bloqueo temporal."
        );
    }

    #[actix_web::test]
    async fn test_regular_login_succeeds() {
        let mut mocks = Mocks::default();
        mocks.security.expect_get_lockout().returning(|_, _| Ok(None));
        mocks.security.expect_clear_lockout().times(1).returning(|_, _| Ok(()));
        mocks
            .security
            .expect_log_access()
            .withf(|entry| entry.exito && entry.detalles == "Inicio de sesión exitoso" && entry.navegador == "Firefox")
            .times(1)
            .returning(|_| Ok(()));
        mocks
            .users
            .expect_find_by_email()
            .returning(|_| Ok(Some(with_password(usuario(7, "usuario"), "Correcta123"))));
        let state = test_state(mocks);
        let session = Session::for_test(AuthState::Anonymous);
        let body = login_body(&session, " Ana@Example.com ", "Correcta123");

        let resp = login(request(), body, session.clone(), state).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(body_json(resp).await["redirect"], "/gh/usuario/");
        assert_eq!(session.user().map(|u| u.id), Some(7));
    }

    #[actix_web::test]
    async fn test_admin_without_secret_goes_to_setup() {
        let mut mocks = Mocks::default();
        mocks.security.expect_get_lockout().returning(|_, _| Ok(None));
        mocks.security.expect_clear_lockout().returning(|_, _| Ok(()));
        mocks
            .users
            .expect_find_by_email()
            .returning(|_| Ok(Some(with_password(usuario(1, "administrador"), "Correcta123"))));
        let state = test_state(mocks);
        let session = Session::for_test(AuthState::Anonymous);
        let body = login_body(&session, "admin@example.com", "Correcta123");

        let resp = login(request(), body, session.clone(), state.clone()).await.unwrap();
        assert_eq!(body_json(resp).await["next"], "setup_2fa");
        assert!(matches!(session.auth(), AuthState::AwaitingSetup { .. }));
        assert_eq!(session.totp_setup().unwrap().secret.len(), 16);

        // Pending setup cannot reach authenticated endpoints.
        assert!(CurrentUser::from_session(session.clone()).is_err());

        let resp = setup_info(session, state).await.unwrap();
        let value = body_json(resp).await;
        assert!(value["otpauth_uri"].as_str().unwrap().starts_with("otpauth://totp/"));
        assert!(value["qr_svg"].as_str().unwrap().contains("<svg"));
    }

    #[actix_web::test]
    async fn test_setup_confirm_completes_login() {
        let mut mocks = Mocks::default();
        mocks
            .users
            .expect_set_two_factor()
            .withf(|id, enabled, secret| *id == 1 && *enabled && secret.is_some())
            .times(1)
            .returning(|_, _, _| Ok(()));
        mocks
            .security
            .expect_log_access()
            .withf(|entry| entry.detalles.starts_with("Login exitoso - 2FA configurado"))
            .times(1)
            .returning(|_| Ok(()));
        let state = test_state(mocks);

        let admin = SessionUser::from(&usuario(1, "admin"));
        let session = Session::for_test(AuthState::AwaitingSetup {
            user: admin,
            expires_at: Utc::now() + Duration::seconds(900),
        });
        let secret = totp::generate_secret();
        session.set_totp_setup(Some(TotpSetup {
            secret: secret.clone(),
            expires_at: Utc::now() + Duration::seconds(900),
        }));
        let token = current_token(&session, Duration::seconds(1800));
        let code = totp::code_at(&secret, Utc::now().timestamp()).unwrap();

        let body = web::Json(CodeRequest { code, csrf_token: Some(token.value) });
        let resp = setup_confirm(request(), body, session.clone(), state).await.unwrap();
        assert_eq!(body_json(resp).await["redirect"], "/gh/administrador/");
        assert!(session.totp_setup().is_none());
        assert!(session.user().unwrap().is_admin());
    }

    #[actix_web::test]
    async fn test_verify_with_totp() {
        let secret = totp::generate_secret();
        let state_for_cipher = test_state(Mocks::default());
        let encrypted = state_for_cipher.cipher.encrypt(&secret).unwrap();

        let mut mocks = Mocks::default();
        mocks.users.expect_find_by_id().returning(move |id| {
            let mut user = usuario(id, "usuario");
            user.tiene_2fa = true;
            user.secreto_2fa = Some(encrypted.clone());
            Ok(Some(user))
        });
        mocks
            .security
            .expect_log_access()
            .withf(|entry| entry.exito && entry.detalles == "Login exitoso con verificación 2FA")
            .times(1)
            .returning(|_| Ok(()));
        let state = test_state(mocks);

        let session = Session::for_test(AuthState::AwaitingTwoFactor {
            user: SessionUser::from(&usuario(7, "usuario")),
            expires_at: Utc::now() + Duration::seconds(600),
        });
        let token = current_token(&session, Duration::seconds(1800));
        let code = totp::code_at(&secret, Utc::now().timestamp()).unwrap();

        let body = web::Json(CodeRequest { code, csrf_token: Some(token.value) });
        verify(request(), body, session.clone(), state).await.unwrap();
        assert_eq!(session.user().map(|u| u.id), Some(7));
    }

    #[actix_web::test]
    async fn test_verify_wrong_email_code() {
        let mut mocks = Mocks::default();
        mocks.users.expect_find_by_id().returning(|id| Ok(Some(usuario(id, "usuario"))));
        mocks.security.expect_active_email_code().returning(|uid| {
            Ok(Some(CodigoDosFactores {
                id: 11,
                usuario_id: uid,
                codigo_hash: bcrypt::hash("123456", 4).unwrap(),
                expira_en: Utc::now() + Duration::seconds(300),
                intentos: 2,
                usado: false,
                fecha_creacion: Utc::now(),
            }))
        });
        mocks.security.expect_increment_code_attempts().times(1).returning(|_| Ok(()));
        mocks
            .security
            .expect_log_access()
            .withf(|entry| !entry.exito && entry.detalles == "Código 2FA incorrecto")
            .times(1)
            .returning(|_| Ok(()));
        let state = test_state(mocks);

        let session = Session::for_test(AuthState::AwaitingTwoFactor {
            user: SessionUser::from(&usuario(7, "usuario")),
            expires_at: Utc::now() + Duration::seconds(600),
        });
        let token = current_token(&session, Duration::seconds(1800));
        let body = web::Json(CodeRequest { code: "654321".into(), csrf_token: Some(token.value) });

        let err = verify(request(), body, session, state).await.unwrap_err();
        assert_eq!(err.status_code(), StatusCode::UNAUTHORIZED);
        assert_eq!(err.public_message(), "Código incorrecto. Te quedan 2 intentos.");
    }

    #[actix_web::test]
    async fn test_verify_rejects_expired_pending_state() {
        let state = test_state(Mocks::default());
        let session = Session::for_test(AuthState::AwaitingTwoFactor {
            user: SessionUser::from(&usuario(7, "usuario")),
            expires_at: Utc::now() - Duration::seconds(1),
        });
        let token = current_token(&session, Duration::seconds(1800));
        let body = web::Json(CodeRequest { code: "123456".into(), csrf_token: Some(token.value) });

        let err = verify(request(), body, session.clone(), state).await.unwrap_err();
        assert_eq!(err.status_code(), StatusCode::UNAUTHORIZED);
        assert_eq!(session.auth(), AuthState::Anonymous);
    }

    #[actix_web::test]
    async fn test_verify_requires_six_digits() {
        let state = test_state(Mocks::default());
        let session = Session::for_test(AuthState::AwaitingTwoFactor {
            user: SessionUser::from(&usuario(7, "usuario")),
            expires_at: Utc::now() + Duration::seconds(600),
        });
        let token = current_token(&session, Duration::seconds(1800));
        let body = web::Json(CodeRequest { code: "12a456".into(), csrf_token: Some(token.value) });

        let err = verify(request(), body, session, state).await.unwrap_err();
        assert_eq!(err.status_code(), StatusCode::BAD_REQUEST);
        assert_eq!(err.public_message(), "El código debe ser de 6 dígitos");
    }

    #[actix_web::test]
    async fn test_resend_is_rate_limited() {
        let mut mocks = Mocks::default();
        mocks.security.expect_invalidate_email_codes().times(1).returning(|_| Ok(()));
        mocks.security.expect_create_email_code().times(1).returning(|_, _, _| Ok(()));
        mocks
            .mailer
            .expect_send()
            .withf(|to, subject, _| to == "user7@example.com" && subject.contains("Código"))
            .times(1)
            .returning(|_, _, _| Ok(()));
        let state = test_state(mocks);

        let session = Session::for_test(AuthState::AwaitingTwoFactor {
            user: SessionUser::from(&usuario(7, "usuario")),
            expires_at: Utc::now() + Duration::seconds(600),
        });
        let token = current_token(&session, Duration::seconds(1800)).value;

        let body = web::Json(CsrfOnly { csrf_token: Some(token.clone()) });
        resend(request(), body, session.clone(), state.clone()).await.unwrap();

        let body = web::Json(CsrfOnly { csrf_token: Some(token) });
        let err = resend(request(), body, session, state).await.unwrap_err();
        assert_eq!(err.status_code(), StatusCode::TOO_MANY_REQUESTS);
    }

    #[actix_web::test]
    async fn test_logout_records_and_purges() {
        let mut mocks = Mocks::default();
        mocks
            .security
            .expect_log_access()
            .withf(|entry| entry.usuario_id == 7 && entry.detalles == "Cierre de sesión manual - Usuario")
            .times(1)
            .returning(|_| Ok(()));
        let state = test_state(mocks);
        let session = Session::for_test(AuthState::Authenticated {
            user: SessionUser::from(&usuario(7, "usuario")),
        });

        logout(request(), session.clone(), state).await.unwrap();
        assert_eq!(session.auth(), AuthState::Anonymous);
    }
}
