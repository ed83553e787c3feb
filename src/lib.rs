pub mod auth;
pub mod config;
pub mod db;
pub mod error;
pub mod files;
pub mod mail;
pub mod notifications;
pub mod portal;

use std::path::Path;
use std::sync::Arc;
use std::time::Duration as StdDuration;

use actix_web::http::header::{self, HeaderName};
use actix_web::middleware::DefaultHeaders;
use actix_web::{web, HttpResponse};
use tracing::info;

pub use config::Settings;
pub use error::AppError;
pub type Result<T> = std::result::Result<T, AppError>;

use auth::session::SessionConfig;
use auth::{LoginLockout, RateLimitConfig, RateLimiter, SecretCipher, SessionStore};
use db::{DbOperations, NotificationRepository, PortalRepository, SecurityRepository, UserRepository};
use mail::Mailer;

/// Health check endpoint handler
/// Returns a JSON response with server status and timestamp
pub async fn health_check() -> HttpResponse {
    HttpResponse::Ok().json(serde_json::json!({
        "status": "healthy",
        "timestamp": chrono::Utc::now().to_rfc3339()
    }))
}

/// Headers added to every response.
pub fn security_headers() -> DefaultHeaders {
    DefaultHeaders::new()
        .add((header::X_FRAME_OPTIONS, "DENY"))
        .add((header::X_CONTENT_TYPE_OPTIONS, "nosniff"))
        .add((HeaderName::from_static("x-xss-protection"), "1; mode=block"))
        .add((header::REFERRER_POLICY, "strict-origin-when-cross-origin"))
}

/// Storage backends for each repository slot.
#[derive(Clone)]
pub struct Repositories {
    pub users: Arc<dyn UserRepository>,
    pub security: Arc<dyn SecurityRepository>,
    pub notifications: Arc<dyn NotificationRepository>,
    pub portal: Arc<dyn PortalRepository>,
}

impl Repositories {
    pub fn from_db(db: DbOperations) -> Self {
        let db = Arc::new(db);
        Self {
            users: db.clone(),
            security: db.clone(),
            notifications: db.clone(),
            portal: db,
        }
    }
}

/// Application state shared across all components
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Settings>,
    pub users: Arc<dyn UserRepository>,
    pub security: Arc<dyn SecurityRepository>,
    pub notifications: Arc<dyn NotificationRepository>,
    pub portal: Arc<dyn PortalRepository>,
    pub sessions: Arc<SessionStore>,
    pub mailer: Arc<dyn Mailer>,
    pub cipher: SecretCipher,
    pub lockout: LoginLockout,
    /// One 2FA code email per user per window.
    pub resend_limiter: Arc<RateLimiter>,
    /// Password reset requests per client ip.
    pub reset_limiter: Arc<RateLimiter>,
    db: Option<DbOperations>,
}

impl AppState {
    pub async fn new(config: Settings) -> Result<Self> {
        let db = DbOperations::new_with_options(
            &config.database.url,
            config.database.max_connections,
            StdDuration::from_secs(config.database.acquire_timeout_secs),
        )
        .await?;
        db.migrate().await?;

        let mailer = mail::from_settings(&config.smtp)?;
        let mut state = Self::with_repositories(config, Repositories::from_db(db.clone()), mailer)?;
        state.db = Some(db);
        info!("Application state initialized");
        Ok(state)
    }

    pub fn with_repositories(config: Settings, repos: Repositories, mailer: Arc<dyn Mailer>) -> Result<Self> {
        let key = config.security.app_key_bytes()?;
        let security = &config.security;

        let resend_limiter = RateLimiter::new(RateLimitConfig {
            window_size: chrono::Duration::seconds(security.email_code_resend_secs),
            max_requests: 1,
        });
        let reset_limiter = RateLimiter::new(RateLimitConfig {
            window_size: chrono::Duration::minutes(15),
            max_requests: 5,
        });

        Ok(Self {
            sessions: Arc::new(SessionStore::new(SessionConfig::from_settings(security))),
            cipher: SecretCipher::new(key),
            lockout: LoginLockout::from_settings(security),
            resend_limiter: Arc::new(resend_limiter),
            reset_limiter: Arc::new(reset_limiter),
            users: repos.users,
            security: repos.security,
            notifications: repos.notifications,
            portal: repos.portal,
            mailer,
            config: Arc::new(config),
            db: None,
        })
    }

    pub fn csrf_lifetime(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.config.security.csrf_lifetime_secs)
    }

    pub fn storage_root(&self) -> &Path {
        &self.config.storage.root
    }

    /// Drops expired sessions and stale rate limit windows.
    pub async fn cleanup(&self) {
        let expired = self.sessions.cleanup().await;
        if expired > 0 {
            info!("Removed {} expired sessions", expired);
        }
        self.resend_limiter.cleanup().await;
        self.reset_limiter.cleanup().await;
    }

    pub async fn shutdown(&self) -> Result<()> {
        if let Some(db) = &self.db {
            db.close().await;
        }
        Ok(())
    }
}

fn json_config() -> web::JsonConfig {
    web::JsonConfig::default()
        .limit(256 * 1024)
        .error_handler(|err, _req| AppError::validation(format!("Solicitud inválida: {}", err)).into())
}

/// Registers every route of the portal.
pub fn configure(cfg: &mut web::ServiceConfig) {
    use auth::{csrf, handlers as login, recovery};
    use files::handlers as downloads;
    use notifications::handlers as notif;
    use portal::{applications, documents, profile, security, users, vacancies};

    cfg.app_data(json_config())
        .route("/health", web::get().to(health_check))
        .service(
            web::scope("/api")
                .route("/csrf-token", web::get().to(csrf::csrf_token))
                .route("/login", web::post().to(login::login))
                .route("/logout", web::post().to(login::logout))
                .route("/session", web::get().to(login::current_session))
                .service(
                    web::scope("/2fa")
                        .route("/setup", web::get().to(login::setup_info))
                        .route("/setup", web::post().to(login::setup_confirm))
                        .route("/verify", web::post().to(login::verify))
                        .route("/resend", web::post().to(login::resend))
                        .route("/toggle", web::post().to(security::toggle_two_factor)),
                )
                .service(
                    web::scope("/password")
                        .route("/forgot", web::post().to(recovery::forgot))
                        .route("/reset", web::post().to(recovery::reset))
                        .route("/change", web::post().to(recovery::change)),
                )
                .service(
                    web::scope("/documentos")
                        .route("", web::get().to(documents::list_my_documents))
                        .route("", web::post().to(documents::upload_my_document))
                        .route("/descargar", web::get().to(downloads::download_document))
                        .route("/ver", web::get().to(downloads::view_document))
                        .route("/eliminar", web::post().to(documents::delete_my_document)),
                )
                .service(
                    web::scope("/notificaciones")
                        .route("/listar", web::get().to(notif::list))
                        .route("/estadisticas", web::get().to(notif::statistics))
                        .route("/usuarios", web::get().to(notif::selectable_users))
                        .route("/obtener", web::get().to(notif::get))
                        .route("/crear", web::post().to(notif::create))
                        .route("/actualizar", web::post().to(notif::update))
                        .route("/eliminar", web::post().to(notif::delete))
                        .route("/cambiar_estado", web::post().to(notif::change_status))
                        .route("/duplicar", web::post().to(notif::duplicate))
                        .route("/responder", web::post().to(notif::respond))
                        .route("/respuestas", web::get().to(notif::replies))
                        .route("/eliminar_respuesta", web::post().to(notif::delete_reply))
                        .route("/archivo", web::get().to(downloads::notification_file)),
                )
                .route("/vacantes", web::get().to(vacancies::list_vacancies))
                .route("/postulaciones", web::post().to(applications::submit_application))
                .route("/perfil", web::get().to(profile::get_profile))
                .route("/perfil", web::post().to(profile::update_profile))
                .route("/historial", web::get().to(security::my_history))
                .service(
                    web::scope("/admin")
                        .route("/vacantes", web::post().to(vacancies::create_vacancy))
                        .route("/vacantes/actualizar", web::post().to(vacancies::update_vacancy))
                        .route("/vacantes/eliminar", web::post().to(vacancies::delete_vacancy))
                        .route("/postulaciones", web::get().to(applications::list_applications))
                        .route("/archivos", web::get().to(documents::list_archives))
                        .route("/archivos", web::post().to(documents::upload_archive))
                        .route("/archivos/eliminar", web::post().to(documents::delete_archive))
                        .route("/archivos/renombrar", web::post().to(documents::rename_archive))
                        .route("/documentos/eliminar", web::post().to(documents::delete_user_document))
                        .route("/usuarios", web::get().to(users::list_users))
                        .route("/usuarios", web::post().to(users::create_user))
                        .route("/usuarios/actualizar", web::post().to(users::update_user))
                        .route("/usuarios/eliminar", web::post().to(users::delete_user))
                        .route("/historial", web::get().to(security::global_history))
                        .route("/mfa", web::get().to(security::mfa_overview))
                        .route("/mfa/restablecer", web::post().to(security::reset_mfa)),
                ),
        );
}

#[cfg(test)]
pub mod test_support {
    //! Mocked state and ready-made sessions for handler tests.

    use std::path::Path;
    use std::sync::Arc;

    use actix_multipart::Multipart;
    use actix_web::error::PayloadError;
    use actix_web::http::header::{self, HeaderMap, HeaderValue};
    use actix_web::web::{self, Bytes};
    use chrono::{Duration, Utc};

    use crate::auth::csrf;
    use crate::auth::session::{AdminUser, AuthState, CurrentUser, Session, SessionUser};
    use crate::db::models::Usuario;
    use crate::db::repository::{
        MockNotificationRepository, MockPortalRepository, MockSecurityRepository, MockUserRepository,
    };
    use crate::mail::MockMailer;
    use crate::{AppState, Repositories, Settings};

    #[derive(Default)]
    pub struct Mocks {
        pub users: MockUserRepository,
        pub security: MockSecurityRepository,
        pub notifications: MockNotificationRepository,
        pub portal: MockPortalRepository,
        pub mailer: MockMailer,
    }

    fn build(mocks: Mocks, root: Option<&Path>) -> web::Data<AppState> {
        let mut settings = Settings::new_for_test().unwrap();
        if let Some(root) = root {
            settings.storage.root = root.to_path_buf();
        }
        let repos = Repositories {
            users: Arc::new(mocks.users),
            security: Arc::new(mocks.security),
            notifications: Arc::new(mocks.notifications),
            portal: Arc::new(mocks.portal),
        };
        web::Data::new(AppState::with_repositories(settings, repos, Arc::new(mocks.mailer)).unwrap())
    }

    pub fn test_state(mocks: Mocks) -> web::Data<AppState> {
        build(mocks, None)
    }

    pub fn test_state_with_root(mocks: Mocks, root: &Path) -> web::Data<AppState> {
        build(mocks, Some(root))
    }

    pub fn usuario(id: i64, rol: &str) -> Usuario {
        Usuario {
            id,
            nombre: "Usuario".into(),
            apellido: "Prueba".into(),
            email: format!("user{}@example.com", id),
            contrasena: String::new(),
            rol: rol.into(),
            telefono: None,
            direccion: None,
            fecha_nacimiento: None,
            estado_civil: None,
            emergencia_contacto: None,
            emergencia_telefono: None,
            acerca_de_mi: None,
            avatar: None,
            cargo: None,
            area: None,
            tiene_2fa: false,
            secreto_2fa: None,
            fecha_registro: Utc::now(),
        }
    }

    fn signed_in(usuario: &Usuario) -> CurrentUser {
        let user = SessionUser::from(usuario);
        let session = Session::for_test(AuthState::Authenticated { user: user.clone() });
        CurrentUser { user, session }
    }

    pub fn admin_user() -> AdminUser {
        AdminUser(signed_in(&usuario(1, "administrador")))
    }

    pub fn regular_user(id: i64) -> CurrentUser {
        signed_in(&usuario(id, "usuario"))
    }

    pub fn csrf_for(session: &Session) -> Option<String> {
        Some(csrf::current_token(session, Duration::seconds(1800)).value)
    }

    pub enum Part<'a> {
        Text(&'a str, &'a str),
        /// Field name, file name, content.
        File(&'a str, &'a str, &'a [u8]),
    }

    const BOUNDARY: &str = "gh-test-boundary-7f3a";

    /// A `multipart/form-data` body fed through the real parser.
    pub fn multipart(parts: &[Part<'_>]) -> Multipart {
        let mut body = Vec::new();
        for part in parts {
            body.extend_from_slice(format!("--{}\r\n", BOUNDARY).as_bytes());
            match part {
                Part::Text(name, value) => {
                    body.extend_from_slice(
                        format!("Content-Disposition: form-data; name=\"{}\"\r\n\r\n", name).as_bytes(),
                    );
                    body.extend_from_slice(value.as_bytes());
                }
                Part::File(name, file_name, bytes) => {
                    body.extend_from_slice(
                        format!(
                            "Content-Disposition: form-data; name=\"{}\"; filename=\"{}\"\r\n\
                             Content-Type: application/octet-stream\r\n\r\n",
                            name, file_name
                        )
                        .as_bytes(),
                    );
                    body.extend_from_slice(bytes);
                }
            }
            body.extend_from_slice(b"\r\n");
        }
        body.extend_from_slice(format!("--{}--\r\n", BOUNDARY).as_bytes());

        let mut headers = HeaderMap::new();
        headers.insert(
            header::CONTENT_TYPE,
            HeaderValue::from_str(&format!("multipart/form-data; boundary={}", BOUNDARY)).unwrap(),
        );
        let stream = futures::stream::once(async move { Ok::<_, PayloadError>(Bytes::from(body)) });
        Multipart::new(&headers, stream)
    }
}
