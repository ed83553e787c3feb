use thiserror::Error;
use actix_web::{ResponseError, HttpResponse, http::StatusCode};
use serde_json::json;
use tracing::error;

const GENERIC_MESSAGE: &str = "Error interno del servidor";

#[derive(Error, Debug)]
pub enum AppError {
    #[error("Authentication error: {0}")]
    AuthError(#[from] AuthError),

    #[error("Database error: {0}")]
    DatabaseError(#[from] DatabaseError),

    #[error("File error: {0}")]
    FileError(#[from] FileError),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Internal server error: {0}")]
    InternalError(String),

    #[error("Validation error: {0}")]
    ValidationError(String),

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Mail error: {0}")]
    MailError(String),
}

impl AppError {
    pub fn validation(message: impl Into<String>) -> Self {
        AppError::ValidationError(message.into())
    }

    /// Message safe to show to the end user. Server-side failures collapse
    /// into a generic text; the detail only goes to the log.
    pub fn public_message(&self) -> String {
        match self {
            AppError::AuthError(e) => e.to_string(),
            AppError::FileError(e) => e.to_string(),
            AppError::ValidationError(m)
            | AppError::Forbidden(m)
            | AppError::NotFound(m)
            | AppError::Conflict(m) => m.clone(),
            AppError::DatabaseError(DatabaseError::NotFound) => "Registro no encontrado".to_string(),
            AppError::DatabaseError(DatabaseError::Duplicate) => "El registro ya existe".to_string(),
            _ => GENERIC_MESSAGE.to_string(),
        }
    }
}

// Implement conversion from config::ConfigError
impl From<config::ConfigError> for AppError {
    fn from(err: config::ConfigError) -> Self {
        AppError::ConfigError(err.to_string())
    }
}

// Implement conversion from sqlx::Error
impl From<sqlx::Error> for AppError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => AppError::DatabaseError(DatabaseError::NotFound),
            sqlx::Error::Database(ref db) if db.code().as_deref() == Some("23505") => {
                AppError::DatabaseError(DatabaseError::Duplicate)
            }
            _ => AppError::DatabaseError(DatabaseError::QueryError(err.to_string())),
        }
    }
}

impl From<sqlx::migrate::MigrateError> for AppError {
    fn from(err: sqlx::migrate::MigrateError) -> Self {
        AppError::DatabaseError(DatabaseError::MigrationError(err.to_string()))
    }
}

impl From<std::io::Error> for AppError {
    fn from(err: std::io::Error) -> Self {
        AppError::InternalError(err.to_string())
    }
}

impl From<actix_multipart::MultipartError> for AppError {
    fn from(err: actix_multipart::MultipartError) -> Self {
        error!("Multipart error: {}", err);
        AppError::ValidationError("Error al procesar el formulario".to_string())
    }
}

impl From<lettre::error::Error> for AppError {
    fn from(err: lettre::error::Error) -> Self {
        AppError::MailError(err.to_string())
    }
}

impl From<lettre::transport::smtp::Error> for AppError {
    fn from(err: lettre::transport::smtp::Error) -> Self {
        AppError::MailError(err.to_string())
    }
}

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        AppError::InternalError(err.to_string())
    }
}

impl ResponseError for AppError {
    fn error_response(&self) -> HttpResponse {
        let status = self.status_code();
        if status.is_server_error() {
            error!("Request failed: {}", self);
        }
        HttpResponse::build(status).json(json!({
            "success": false,
            "error": self.public_message()
        }))
    }

    fn status_code(&self) -> StatusCode {
        match self {
            AppError::AuthError(e) => match e {
                AuthError::NotAuthenticated
                | AuthError::SessionExpired
                | AuthError::InvalidCredentials { .. }
                | AuthError::InvalidCode
                | AuthError::CodeExpired
                | AuthError::CodeRejected(_) => StatusCode::UNAUTHORIZED,
                AuthError::Forbidden
                | AuthError::CsrfInvalid
                | AuthError::TwoFactorPending
                | AuthError::ForeignOrigin => StatusCode::FORBIDDEN,
                AuthError::Locked { .. } | AuthError::RateLimited(_) => StatusCode::TOO_MANY_REQUESTS,
            },
            AppError::FileError(e) => match e {
                FileError::NotFound => StatusCode::NOT_FOUND,
                FileError::OutsideRoot | FileError::Traversal => StatusCode::FORBIDDEN,
                FileError::MissingName
                | FileError::DisallowedExtension
                | FileError::DisallowedMime
                | FileError::TooLarge { .. }
                | FileError::TooManyFiles { .. }
                | FileError::TooManyFields
                | FileError::RequestTooLarge { .. } => StatusCode::BAD_REQUEST,
            },
            AppError::ValidationError(_) => StatusCode::BAD_REQUEST,
            AppError::Forbidden(_) => StatusCode::FORBIDDEN,
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::Conflict(_) => StatusCode::CONFLICT,
            AppError::DatabaseError(DatabaseError::NotFound) => StatusCode::NOT_FOUND,
            AppError::DatabaseError(DatabaseError::Duplicate) => StatusCode::CONFLICT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

#[derive(Error, Debug)]
pub enum AuthError {
    #[error("Debe iniciar sesión para continuar")]
    NotAuthenticated,

    #[error("La sesión expiró por inactividad")]
    SessionExpired,

    #[error("Credenciales incorrectas. Le quedan {remaining} intentos antes del bloqueo temporal.")]
    InvalidCredentials { remaining: u32 },

    #[error("Demasiados intentos fallidos. Por favor, inténtelo de nuevo después de {wait}.")]
    Locked { wait: String },

    #[error("Código de verificación incorrecto")]
    InvalidCode,

    #[error("El tiempo para verificar el código ha expirado. Por favor inicia sesión nuevamente.")]
    CodeExpired,

    /// Wrong or unusable second-factor code with a specific explanation.
    #[error("{0}")]
    CodeRejected(String),

    #[error("Verificación 2FA pendiente")]
    TwoFactorPending,

    #[error("Token de seguridad inválido")]
    CsrfInvalid,

    #[error("Acceso no autorizado desde origen externo")]
    ForeignOrigin,

    #[error("No tiene permisos para realizar esta acción")]
    Forbidden,

    #[error("{0}")]
    RateLimited(String),
}

#[derive(Error, Debug)]
pub enum DatabaseError {
    #[error("Connection error: {0}")]
    ConnectionError(String),

    #[error("Query error: {0}")]
    QueryError(String),

    #[error("Migration error: {0}")]
    MigrationError(String),

    #[error("Record not found")]
    NotFound,

    #[error("Duplicate record")]
    Duplicate,
}

#[derive(Error, Debug, PartialEq)]
pub enum FileError {
    #[error("No se especificó ningún archivo")]
    MissingName,

    #[error("Archivo no encontrado")]
    NotFound,

    #[error("Ruta de archivo no válida")]
    Traversal,

    #[error("Acceso denegado")]
    OutsideRoot,

    #[error("Tipo de archivo no permitido")]
    DisallowedExtension,

    #[error("El contenido del archivo no corresponde a un tipo permitido")]
    DisallowedMime,

    #[error("El archivo excede el tamaño máximo permitido ({max_mb} MB)")]
    TooLarge { max_mb: u64 },

    #[error("Máximo {max} archivos permitidos por envío")]
    TooManyFiles { max: usize },

    #[error("El formulario contiene demasiados campos")]
    TooManyFields,

    #[error("La solicitud excede el tamaño máximo permitido ({max_mb} MB)")]
    RequestTooLarge { max_mb: u64 },
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;

    #[test]
    fn test_error_conversion() {
        let io_err = io::Error::new(io::ErrorKind::NotFound, "file not found");
        let app_err: AppError = io_err.into();
        assert!(matches!(app_err, AppError::InternalError(_)));

        let config_err = config::ConfigError::NotFound(String::from("key not found"));
        let app_err: AppError = config_err.into();
        assert!(matches!(app_err, AppError::ConfigError(_)));

        let db_err = sqlx::Error::RowNotFound;
        let app_err: AppError = db_err.into();
        assert!(matches!(app_err, AppError::DatabaseError(DatabaseError::NotFound)));
    }

    #[test]
    fn test_error_status_codes() {
        let err = AppError::AuthError(AuthError::InvalidCredentials { remaining: 3 });
        assert_eq!(err.status_code(), StatusCode::UNAUTHORIZED);

        let err = AppError::AuthError(AuthError::CsrfInvalid);
        assert_eq!(err.status_code(), StatusCode::FORBIDDEN);

        let err = AppError::AuthError(AuthError::Locked { wait: "15 minutos y 0 segundos".into() });
        assert_eq!(err.status_code(), StatusCode::TOO_MANY_REQUESTS);

        let err = AppError::ValidationError("invalid input".to_string());
        assert_eq!(err.status_code(), StatusCode::BAD_REQUEST);

        let err = AppError::FileError(FileError::OutsideRoot);
        assert_eq!(err.status_code(), StatusCode::FORBIDDEN);

        let err = AppError::FileError(FileError::NotFound);
        assert_eq!(err.status_code(), StatusCode::NOT_FOUND);

        let err = AppError::DatabaseError(DatabaseError::Duplicate);
        assert_eq!(err.status_code(), StatusCode::CONFLICT);
    }

    #[test]
    fn test_public_message_hides_internals() {
        let err = AppError::DatabaseError(DatabaseError::QueryError("relation usuarios does not exist".into()));
        assert_eq!(err.public_message(), "Error interno del servidor");

        let err = AppError::InternalError("disk full".into());
        assert_eq!(err.public_message(), "Error interno del servidor");

        let err = AppError::AuthError(AuthError::InvalidCredentials { remaining: 2 });
        assert_eq!(
            err.public_message(),
            "Credenciales incorrectas. Le quedan 2 intentos antes del bloqueo temporal."
        );
    }

    #[test]
    fn test_error_display() {
        let err = AppError::ValidationError("test error".to_string());
        assert_eq!(err.to_string(), "Validation error: test error");

        let err = AppError::DatabaseError(DatabaseError::NotFound);
        assert_eq!(err.to_string(), "Database error: Record not found");
    }

    #[actix_web::test]
    async fn test_error_envelope() {
        let err = AppError::Forbidden("Acceso denegado".into());
        let resp = err.error_response();
        assert_eq!(resp.status(), StatusCode::FORBIDDEN);
        let body = actix_web::body::to_bytes(resp.into_body()).await.unwrap();
        let value: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(value["success"], false);
        assert_eq!(value["error"], "Acceso denegado");
    }
}
