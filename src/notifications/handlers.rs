use actix_multipart::Multipart;
use actix_web::{web, HttpRequest, HttpResponse};
use serde::Deserialize;
use serde_json::json;
use tracing::{error, info, warn};

use crate::auth::csrf;
use crate::auth::session::{AdminUser, CurrentUser};
use crate::db::models::{AdjuntoRespuesta, EstadoNotificacion, NuevoArchivo};
use crate::db::repository::Viewer;
use crate::error::{AppError, FileError};
use crate::files::storage::{
    self, MultipartForm, UploadLimits, UploadedFile, NOTIFICATIONS_DIR, REPLIES_DIR,
};
use crate::files::{access, guard, policy};
use crate::notifications::form::{copy_name, ListQuery, NotificationFields, MAX_REPLY_CHARS};
use crate::portal::validate::parse_id;
use crate::portal::IdRequest;
use crate::{AppState, Result};

#[derive(Debug, Deserialize)]
pub struct IdQuery {
    pub id: Option<String>,
}

impl IdQuery {
    fn valid_id(&self) -> Result<i64> {
        parse_id(self.id.as_deref()).ok_or_else(|| AppError::validation("ID de notificación no válido"))
    }
}

#[derive(Debug, Deserialize)]
pub struct UpdateRequest {
    pub id: Option<i64>,
    #[serde(flatten)]
    pub fields: NotificationFields,
    pub csrf_token: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct StatusRequest {
    pub id: Option<i64>,
    pub estado: Option<String>,
    pub csrf_token: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct DeleteReplyRequest {
    #[serde(alias = "id")]
    pub respuesta_id: Option<i64>,
    pub csrf_token: Option<String>,
}

fn not_found() -> AppError {
    AppError::NotFound("Notificación no encontrada".to_string())
}

fn no_access() -> AppError {
    AppError::Forbidden("No tienes acceso a esta notificación".to_string())
}

async fn remove_all(state: &AppState, paths: &[String]) {
    for path in paths {
        storage::remove(state.storage_root(), path, &state.config.storage.base_url).await;
    }
}

fn check_attachment(file: &UploadedFile) -> Result<String> {
    let ext = file.extension().unwrap_or_default();
    if !policy::NOTIFICATION_EXTENSIONS.contains(&ext.as_str()) {
        return Err(AppError::validation(format!("Tipo de archivo no permitido: {}", ext)));
    }
    if !policy::mime_matches_extension(&ext, &file.bytes) {
        warn!("Attachment {} rejected, content does not match .{}", file.file_name, ext);
        return Err(AppError::validation(
            "Archivo rechazado: el contenido no coincide con la extensión",
        ));
    }
    Ok(ext)
}

pub async fn list(
    query: web::Query<ListQuery>,
    current: CurrentUser,
    state: web::Data<AppState>,
) -> Result<HttpResponse> {
    let filter = query.to_filter()?;
    let (limite, offset) = (filter.limite, filter.offset);
    let viewer = Viewer {
        usuario_id: current.user.id,
        is_admin: current.user.is_admin(),
    };

    let notificaciones = state.notifications.list(viewer, filter).await?;
    Ok(HttpResponse::Ok().json(json!({
        "success": true,
        "notificaciones": notificaciones,
        "limite": limite,
        "pagina": offset / limite + 1
    })))
}

pub async fn statistics(_admin: AdminUser, state: web::Data<AppState>) -> Result<HttpResponse> {
    let estadisticas = state.notifications.statistics().await?;
    Ok(HttpResponse::Ok().json(json!({
        "success": true,
        "estadisticas": estadisticas
    })))
}

pub async fn selectable_users(_admin: AdminUser, state: web::Data<AppState>) -> Result<HttpResponse> {
    let usuarios: Vec<_> = state
        .notifications
        .selectable_users()
        .await?
        .into_iter()
        .map(|u| {
            json!({
                "id": u.id,
                "nombre": format!("{} {}", u.nombre, u.apellido),
                "email": u.email
            })
        })
        .collect();

    Ok(HttpResponse::Ok().json(json!({
        "success": true,
        "usuarios": usuarios
    })))
}

pub async fn get(
    query: web::Query<IdQuery>,
    current: CurrentUser,
    state: web::Data<AppState>,
) -> Result<HttpResponse> {
    let id = query.valid_id()?;
    let notificacion = state.notifications.get(id).await?.ok_or_else(not_found)?;

    if !access::notification_visible(state.notifications.as_ref(), &current.user, &notificacion).await? {
        warn!("User {} denied notification {}", current.user.id, id);
        return Err(no_access());
    }

    let archivos: Vec<_> = state
        .notifications
        .attachments(id)
        .await?
        .into_iter()
        .filter(|a| {
            guard::resolve_legacy(state.storage_root(), &a.ruta_archivo, NOTIFICATIONS_DIR, &a.nombre_archivo).is_ok()
        })
        .collect();

    let destinatarios = if access::needs_membership(&notificacion) && current.user.is_admin() {
        state.notifications.recipients(id).await?
    } else {
        Vec::new()
    };

    if !current.user.is_admin() {
        state.notifications.mark_read(id, current.user.id).await?;
    }

    Ok(HttpResponse::Ok().json(json!({
        "success": true,
        "notificacion": notificacion,
        "archivos": archivos,
        "destinatarios": destinatarios
    })))
}

pub async fn create(
    req: HttpRequest,
    payload: Multipart,
    admin: AdminUser,
    state: web::Data<AppState>,
) -> Result<HttpResponse> {
    let storage_config = &state.config.storage;
    let limits = UploadLimits::new(
        storage_config,
        storage_config.max_upload_bytes,
        storage_config.max_notification_files,
    );
    let form = MultipartForm::read(payload, limits).await?;
    csrf::require(&admin.session, &req, form.raw_text("csrf_token"), state.csrf_lifetime())?;

    let fields = NotificationFields {
        nombre: form.text("nombre").map(str::to_string),
        cuerpo: form.text("cuerpo").map(str::to_string),
        destino: form.text("destino").map(str::to_string),
        prioridad: form.text("prioridad").map(str::to_string),
        usuarios_ids: form.text("usuarios_ids").map(str::to_string),
        permitir_respuesta: form.flag("permitir_respuesta"),
    };
    let notificacion = fields.validate(admin.user.id)?;

    let uploads = form.files("archivos");
    let mut checked = Vec::with_capacity(uploads.len());
    for file in uploads {
        checked.push((file, check_attachment(file)?));
    }

    let mut archivos = Vec::with_capacity(checked.len());
    for (file, ext) in checked {
        let nombre_archivo = storage::notification_file_name(&file.file_name);
        let ruta = match storage::store(state.storage_root(), NOTIFICATIONS_DIR, &nombre_archivo, &file.bytes).await {
            Ok(ruta) => ruta,
            Err(e) => {
                let stored: Vec<String> = archivos.iter().map(|a: &NuevoArchivo| a.ruta_archivo.clone()).collect();
                remove_all(&state, &stored).await;
                return Err(e);
            }
        };
        archivos.push(NuevoArchivo {
            nombre_original: file.file_name.clone(),
            nombre_archivo,
            ruta_archivo: ruta,
            tipo_mime: policy::attachment_mime(&ext).to_string(),
            tamano: file.size() as i64,
        });
    }

    let stored: Vec<String> = archivos.iter().map(|a| a.ruta_archivo.clone()).collect();
    match state.notifications.create(notificacion, archivos).await {
        Ok(id) => {
            info!("Admin {} created notification {} with {} files", admin.user.id, id, stored.len());
            Ok(HttpResponse::Created().json(json!({
                "success": true,
                "id": id,
                "archivos": stored.len(),
                "message": "Notificación creada exitosamente"
            })))
        }
        Err(e) => {
            error!("Could not create notification: {}", e);
            remove_all(&state, &stored).await;
            Err(e)
        }
    }
}

pub async fn update(
    req: HttpRequest,
    body: web::Json<UpdateRequest>,
    admin: AdminUser,
    state: web::Data<AppState>,
) -> Result<HttpResponse> {
    csrf::require(&admin.session, &req, body.csrf_token.as_deref(), state.csrf_lifetime())?;

    let id = body
        .id
        .filter(|id| *id > 0)
        .ok_or_else(|| AppError::validation("ID de notificación no válido"))?;
    let notificacion = body.fields.validate(admin.user.id)?;

    state.notifications.update(id, notificacion).await?;
    info!("Admin {} updated notification {}", admin.user.id, id);

    Ok(HttpResponse::Ok().json(json!({
        "success": true,
        "message": "Notificación actualizada exitosamente"
    })))
}

pub async fn delete(
    req: HttpRequest,
    body: web::Json<IdRequest>,
    admin: AdminUser,
    state: web::Data<AppState>,
) -> Result<HttpResponse> {
    csrf::require(&admin.session, &req, body.csrf_token.as_deref(), state.csrf_lifetime())?;
    let id = body.valid_id("ID de notificación no válido")?;

    let paths = state.notifications.delete(id).await?;
    remove_all(&state, &paths).await;
    info!("Admin {} deleted notification {} ({} files)", admin.user.id, id, paths.len());

    Ok(HttpResponse::Ok().json(json!({
        "success": true,
        "archivos_eliminados": paths.len(),
        "message": "Notificación eliminada exitosamente"
    })))
}

pub async fn change_status(
    req: HttpRequest,
    body: web::Json<StatusRequest>,
    admin: AdminUser,
    state: web::Data<AppState>,
) -> Result<HttpResponse> {
    csrf::require(&admin.session, &req, body.csrf_token.as_deref(), state.csrf_lifetime())?;

    let id = body
        .id
        .filter(|id| *id > 0)
        .ok_or_else(|| AppError::validation("ID de notificación no válido"))?;
    let estado = body
        .estado
        .as_deref()
        .and_then(EstadoNotificacion::parse)
        .ok_or_else(|| AppError::validation("Estado no válido. Debe ser \"activa\" o \"archivada\""))?;

    let actual = state.notifications.get(id).await?.ok_or_else(not_found)?;
    if actual.estado == estado.as_str() {
        return Ok(HttpResponse::Ok().json(json!({
            "success": true,
            "message": format!("La notificación ya se encuentra en estado {}", estado.as_str()),
            "estado_actual": estado.as_str()
        })));
    }

    state.notifications.set_status(id, estado).await?;
    info!("Admin {} set notification {} to {}", admin.user.id, id, estado.as_str());

    let accion = match estado {
        EstadoNotificacion::Activa => "activada",
        EstadoNotificacion::Archivada => "archivada",
    };
    Ok(HttpResponse::Ok().json(json!({
        "success": true,
        "message": format!("Notificación {} correctamente", accion),
        "nuevo_estado": estado.as_str(),
        "estado_anterior": actual.estado
    })))
}

pub async fn duplicate(
    req: HttpRequest,
    body: web::Json<IdRequest>,
    admin: AdminUser,
    state: web::Data<AppState>,
) -> Result<HttpResponse> {
    csrf::require(&admin.session, &req, body.csrf_token.as_deref(), state.csrf_lifetime())?;
    let id = body.valid_id("ID de notificación no válido")?;

    let original = state.notifications.get(id).await?.ok_or_else(not_found)?;
    let copies = state
        .notifications
        .count_copies(&format!("Copia de {}", original.nombre))
        .await?;
    let nombre = copy_name(&original.nombre, copies);

    let mut archivos = Vec::new();
    for adjunto in state.notifications.attachments(id).await? {
        let nombre_archivo = storage::notification_file_name(&adjunto.nombre_original);
        match storage::copy(state.storage_root(), &adjunto.ruta_archivo, NOTIFICATIONS_DIR, &nombre_archivo).await {
            Ok(ruta) => archivos.push(NuevoArchivo {
                nombre_original: adjunto.nombre_original,
                nombre_archivo,
                ruta_archivo: ruta,
                tipo_mime: adjunto.tipo_mime,
                tamano: adjunto.tamano,
            }),
            Err(e) => warn!("Attachment {} not copied: {}", adjunto.id, e),
        }
    }

    let stored: Vec<String> = archivos.iter().map(|a| a.ruta_archivo.clone()).collect();
    match state.notifications.duplicate(id, &nombre, admin.user.id, archivos).await {
        Ok(new_id) => {
            info!("Admin {} duplicated notification {} as {}", admin.user.id, id, new_id);
            Ok(HttpResponse::Created().json(json!({
                "success": true,
                "id": new_id,
                "nombre": nombre,
                "message": "Notificación duplicada exitosamente"
            })))
        }
        Err(e) => {
            remove_all(&state, &stored).await;
            Err(e)
        }
    }
}

pub async fn respond(
    req: HttpRequest,
    payload: Multipart,
    current: CurrentUser,
    state: web::Data<AppState>,
) -> Result<HttpResponse> {
    let storage_config = &state.config.storage;
    let limits = UploadLimits::new(
        storage_config,
        storage_config.max_upload_bytes,
        storage_config.max_notification_files,
    );
    let form = MultipartForm::read(payload, limits).await?;
    csrf::require(&current.session, &req, form.raw_text("csrf_token"), state.csrf_lifetime())?;

    let id = parse_id(form.text("notificacion_id"))
        .ok_or_else(|| AppError::validation("ID de notificación requerido"))?;
    let respuesta = form
        .text("respuesta")
        .ok_or_else(|| AppError::validation("La respuesta no puede estar vacía"))?;
    if respuesta.chars().count() > MAX_REPLY_CHARS {
        return Err(AppError::validation("La respuesta no puede exceder 2000 caracteres"));
    }

    let notificacion = state.notifications.get(id).await?.ok_or_else(not_found)?;
    if !access::notification_visible(state.notifications.as_ref(), &current.user, &notificacion).await? {
        return Err(no_access());
    }
    if !notificacion.is_active() {
        return Err(AppError::Forbidden(
            "No se puede responder a una notificación archivada".to_string(),
        ));
    }
    if !notificacion.permitir_respuesta {
        return Err(AppError::Forbidden("Esta notificación no permite respuestas".to_string()));
    }

    let uploads = form.files("archivos");
    let mut checked = Vec::with_capacity(uploads.len());
    for file in uploads {
        let ext = file.extension().unwrap_or_default();
        if !policy::REPLY_EXTENSIONS.contains(&ext.as_str()) {
            return Err(AppError::validation("Uno de los archivos tiene un formato no permitido"));
        }
        if !policy::mime_matches_extension(&ext, &file.bytes) {
            return Err(FileError::DisallowedMime.into());
        }
        checked.push((file, ext));
    }

    let mut archivos = Vec::with_capacity(checked.len());
    for (file, ext) in checked {
        let name = storage::reply_file_name(current.user.id, &ext);
        match storage::store(state.storage_root(), REPLIES_DIR, &name, &file.bytes).await {
            Ok(ruta) => archivos.push(AdjuntoRespuesta {
                nombre: file.file_name.clone(),
                ruta,
            }),
            Err(e) => {
                let stored: Vec<String> = archivos.iter().map(|a: &AdjuntoRespuesta| a.ruta.clone()).collect();
                remove_all(&state, &stored).await;
                return Err(e);
            }
        }
    }

    let stored: Vec<String> = archivos.iter().map(|a| a.ruta.clone()).collect();
    match state
        .notifications
        .create_reply(id, current.user.id, respuesta, archivos)
        .await
    {
        Ok(respuesta_id) => {
            info!("User {} replied to notification {}", current.user.id, id);
            Ok(HttpResponse::Created().json(json!({
                "success": true,
                "respuesta_id": respuesta_id,
                "message": "Respuesta enviada correctamente"
            })))
        }
        Err(e) => {
            remove_all(&state, &stored).await;
            Err(e)
        }
    }
}

pub async fn replies(
    query: web::Query<IdQuery>,
    current: CurrentUser,
    state: web::Data<AppState>,
) -> Result<HttpResponse> {
    let id = query.valid_id()?;
    let notificacion = state.notifications.get(id).await?.ok_or_else(not_found)?;
    if !access::notification_visible(state.notifications.as_ref(), &current.user, &notificacion).await? {
        return Err(no_access());
    }

    let only_user = if current.user.is_admin() { None } else { Some(current.user.id) };
    let respuestas = state.notifications.replies(id, only_user).await?;

    Ok(HttpResponse::Ok().json(json!({
        "success": true,
        "total": respuestas.len(),
        "respuestas": respuestas
    })))
}

pub async fn delete_reply(
    req: HttpRequest,
    body: web::Json<DeleteReplyRequest>,
    admin: AdminUser,
    state: web::Data<AppState>,
) -> Result<HttpResponse> {
    csrf::require(&admin.session, &req, body.csrf_token.as_deref(), state.csrf_lifetime())?;

    let id = body
        .respuesta_id
        .filter(|id| *id > 0)
        .ok_or_else(|| AppError::validation("ID de respuesta requerido"))?;
    let reply = state
        .notifications
        .reply(id)
        .await?
        .ok_or_else(|| AppError::NotFound("Respuesta no encontrada".to_string()))?;

    if !state.notifications.delete_reply(id).await? {
        return Err(AppError::NotFound("Respuesta no encontrada".to_string()));
    }
    let paths: Vec<String> = reply.archivos.0.iter().map(|a| a.ruta.clone()).collect();
    remove_all(&state, &paths).await;
    info!("Admin {} deleted reply {}", admin.user.id, id);

    Ok(HttpResponse::Ok().json(json!({
        "success": true,
        "message": "Respuesta eliminada correctamente"
    })))
}
