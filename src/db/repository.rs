//! Data access seams.
//!
//! Handlers only see these traits; `DbOperations` implements all of them
//! on top of Postgres and unit tests substitute the generated mocks.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};

use crate::db::models::*;
use crate::Result;

/// Who is asking. Drives the visibility rules in notification queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Viewer {
    pub usuario_id: i64,
    pub is_admin: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NotificationFilter {
    pub estado: Option<EstadoNotificacion>,
    pub prioridad: Option<Prioridad>,
    pub destino: Option<Destino>,
    pub desde: Option<NaiveDate>,
    pub hasta: Option<NaiveDate>,
    /// Already escaped for `LIKE`.
    pub busqueda: Option<String>,
    pub limite: i64,
    pub offset: i64,
}

impl Default for NotificationFilter {
    fn default() -> Self {
        Self {
            estado: None,
            prioridad: None,
            destino: None,
            desde: None,
            hasta: None,
            busqueda: None,
            limite: 50,
            offset: 0,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct HistoryFilter {
    pub usuario_id: Option<i64>,
    pub exito: Option<bool>,
    pub desde: Option<NaiveDate>,
    pub hasta: Option<NaiveDate>,
    pub limite: i64,
    pub offset: i64,
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait UserRepository: Send + Sync {
    async fn find_by_id(&self, id: i64) -> Result<Option<Usuario>>;
    async fn find_by_email(&self, email: &str) -> Result<Option<Usuario>>;
    async fn list(&self) -> Result<Vec<Usuario>>;
    async fn email_taken(&self, email: &str, except_id: Option<i64>) -> Result<bool>;
    async fn create(&self, user: NuevoUsuario) -> Result<i64>;
    async fn update(&self, user: ActualizacionUsuario) -> Result<bool>;
    async fn update_profile(&self, id: i64, profile: ActualizacionPerfil) -> Result<()>;
    async fn update_password(&self, id: i64, password_hash: &str) -> Result<()>;
    /// Stores the encrypted secret (when given) and the enabled flag.
    async fn set_two_factor(&self, id: i64, enabled: bool, encrypted_secret: Option<String>) -> Result<()>;
    /// Clears both the flag and the stored secret.
    async fn reset_two_factor(&self, id: i64) -> Result<()>;
    async fn two_factor_overview(&self) -> Result<Vec<EstadoDosFactores>>;
    async fn delete(&self, id: i64) -> Result<bool>;
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait SecurityRepository: Send + Sync {
    async fn get_lockout(&self, ip: &str, email: &str) -> Result<Option<BloqueoAcceso>>;
    /// Adds one attempt in a single statement and sets `bloqueado_hasta`
    /// once the count reaches `max_attempts`. Returns the new count.
    async fn record_failed_attempt(
        &self,
        ip: &str,
        email: &str,
        max_attempts: i32,
        bloqueado_hasta: DateTime<Utc>,
    ) -> Result<i32>;
    /// Clears a block that has already run out, keeping the count.
    async fn lift_expired_lockout(&self, ip: &str, email: &str) -> Result<()>;
    async fn clear_lockout(&self, ip: &str, email: &str) -> Result<()>;

    async fn log_access(&self, entry: NuevoAcceso) -> Result<()>;
    async fn user_history(&self, usuario_id: i64, limite: i64, offset: i64) -> Result<(Vec<HistorialAcceso>, i64)>;
    async fn global_history(&self, filter: HistoryFilter) -> Result<(Vec<HistorialAccesoDetalle>, i64)>;

    async fn create_email_code(&self, usuario_id: i64, codigo_hash: &str, expira_en: DateTime<Utc>) -> Result<()>;
    async fn active_email_code(&self, usuario_id: i64) -> Result<Option<CodigoDosFactores>>;
    async fn increment_code_attempts(&self, id: i64) -> Result<()>;
    async fn mark_code_used(&self, id: i64) -> Result<()>;
    async fn invalidate_email_codes(&self, usuario_id: i64) -> Result<()>;

    async fn replace_reset_token(&self, usuario_id: i64, token_hash: &str, expira_en: DateTime<Utc>) -> Result<()>;
    async fn find_reset_token(&self, token_hash: &str) -> Result<Option<PasswordReset>>;
    async fn delete_reset_tokens(&self, usuario_id: i64) -> Result<()>;
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait NotificationRepository: Send + Sync {
    async fn list(&self, viewer: Viewer, filter: NotificationFilter) -> Result<Vec<NotificacionResumen>>;
    async fn statistics(&self) -> Result<EstadisticasNotificaciones>;
    async fn get(&self, id: i64) -> Result<Option<Notificacion>>;
    async fn is_recipient(&self, notificacion_id: i64, usuario_id: i64) -> Result<bool>;
    async fn recipients(&self, notificacion_id: i64) -> Result<Vec<Destinatario>>;
    async fn selectable_users(&self) -> Result<Vec<Destinatario>>;
    async fn create(&self, notification: NuevaNotificacion, files: Vec<NuevoArchivo>) -> Result<i64>;
    async fn update(&self, id: i64, notification: NuevaNotificacion) -> Result<()>;
    /// Deletes the notification and everything hanging from it. Returns the
    /// stored paths of attachments and reply files so they can be unlinked.
    async fn delete(&self, id: i64) -> Result<Vec<String>>;
    async fn set_status(&self, id: i64, estado: EstadoNotificacion) -> Result<()>;
    async fn count_copies(&self, base_name: &str) -> Result<i64>;
    async fn duplicate(&self, id: i64, nombre: &str, creado_por: i64, files: Vec<NuevoArchivo>) -> Result<i64>;
    async fn attachments(&self, notificacion_id: i64) -> Result<Vec<NotificacionArchivo>>;
    async fn attachment(&self, id: i64) -> Result<Option<NotificacionArchivo>>;
    async fn mark_read(&self, notificacion_id: i64, usuario_id: i64) -> Result<()>;
    async fn replies(&self, notificacion_id: i64, only_user: Option<i64>) -> Result<Vec<NotificacionRespuesta>>;
    async fn reply(&self, id: i64) -> Result<Option<NotificacionRespuesta>>;
    async fn reply_by_attachment(&self, ruta: &str) -> Result<Option<NotificacionRespuesta>>;
    async fn create_reply(
        &self,
        notificacion_id: i64,
        usuario_id: i64,
        respuesta: &str,
        archivos: Vec<AdjuntoRespuesta>,
    ) -> Result<i64>;
    async fn delete_reply(&self, id: i64) -> Result<bool>;
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait PortalRepository: Send + Sync {
    async fn vacancies(&self) -> Result<Vec<Vacante>>;
    async fn vacancy(&self, id: i64) -> Result<Option<Vacante>>;
    async fn create_vacancy(&self, vacancy: NuevaVacante) -> Result<i64>;
    async fn update_vacancy(&self, id: i64, vacancy: NuevaVacante) -> Result<bool>;
    async fn delete_vacancy(&self, id: i64) -> Result<bool>;

    async fn application_exists(&self, documento: &str, vacante_id: i64) -> Result<bool>;
    async fn create_application(&self, application: NuevaPostulacion) -> Result<i64>;
    async fn applications(&self) -> Result<Vec<Postulacion>>;
    async fn delete_application_by_file(&self, hoja_vida: &str) -> Result<u64>;

    async fn documents(&self) -> Result<Vec<Documento>>;
    async fn document(&self, id: i64) -> Result<Option<Documento>>;
    async fn create_document(&self, document: NuevoDocumento) -> Result<i64>;
    async fn rename_document(&self, id: i64, nombre: &str) -> Result<bool>;
    async fn delete_document(&self, id: i64) -> Result<bool>;

    async fn user_documents(&self, usuario_id: Option<i64>) -> Result<Vec<DocumentoUsuario>>;
    async fn user_document(&self, id: i64) -> Result<Option<DocumentoUsuario>>;
    async fn create_user_document(&self, document: NuevoDocumentoUsuario) -> Result<i64>;
    async fn rename_user_document(&self, id: i64, nombre: &str) -> Result<bool>;
    async fn delete_user_document(&self, id: i64) -> Result<bool>;
    /// True when the user owns a stored document whose path ends with `file_name`.
    async fn owns_file(&self, usuario_id: i64, file_name: &str) -> Result<bool>;
}
