use actix_files::NamedFile;
use actix_web::http::header::{self, ContentDisposition, DispositionParam, DispositionType, HeaderValue};
use actix_web::{mime, web, HttpRequest, HttpResponse};
use serde::Deserialize;
use std::path::Path;
use tokio::io::AsyncReadExt;
use tracing::{info, warn};

use crate::auth::session::{CurrentUser, SessionUser};
use crate::error::{AppError, FileError};
use crate::files::storage::{NOTIFICATIONS_DIR, REPLIES_DIR};
use crate::files::{access, guard, policy};
use crate::{AppState, Result};

/// Bytes read from the start of a file for the signature check.
const SNIFF_BYTES: u64 = 8192;

#[derive(Debug, Deserialize)]
pub struct DocumentQuery {
    pub archivo: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct AttachmentQuery {
    pub id: Option<String>,
    pub tipo: Option<String>,
    pub ruta: Option<String>,
}

/// How a resolved file goes out.
struct Delivery<'a> {
    content_type: &'a str,
    disposition: DispositionType,
    file_name: &'a str,
    no_cache: bool,
}

async fn serve(req: &HttpRequest, path: &Path, delivery: Delivery<'_>) -> Result<HttpResponse> {
    let content_type: mime::Mime = delivery
        .content_type
        .parse()
        .map_err(|_| AppError::InternalError(format!("Invalid content type {}", delivery.content_type)))?;

    let file = NamedFile::open_async(path).await.map_err(|e| {
        warn!("Could not open {}: {}", path.display(), e);
        FileError::NotFound
    })?;
    let mut resp = file
        .set_content_type(content_type)
        .set_content_disposition(ContentDisposition {
            disposition: delivery.disposition,
            parameters: vec![DispositionParam::Filename(policy::sanitize_download_name(delivery.file_name))],
        })
        .use_etag(!delivery.no_cache)
        .use_last_modified(!delivery.no_cache)
        .into_response(req);

    let headers = resp.headers_mut();
    headers.insert(header::X_CONTENT_TYPE_OPTIONS, HeaderValue::from_static("nosniff"));
    if delivery.no_cache {
        headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-cache, no-store, must-revalidate"));
        headers.insert(header::PRAGMA, HeaderValue::from_static("no-cache"));
        headers.insert(header::EXPIRES, HeaderValue::from_static("0"));
    } else {
        headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("private, must-revalidate, max-age=0"));
    }
    Ok(resp)
}

fn denied() -> AppError {
    AppError::Forbidden("No tiene permiso para acceder a este archivo".to_string())
}

fn forbidden_type() -> AppError {
    AppError::Forbidden(FileError::DisallowedExtension.to_string())
}

/// Lower-cased extension of `name` if it is in `allowed`.
fn allowed_extension(name: &str, allowed: &[&str]) -> Result<String> {
    policy::extension(name)
        .filter(|ext| allowed.contains(&ext.as_str()))
        .ok_or_else(forbidden_type)
}

/// Shared path for `descargar` and `ver`: parameter, allow-list,
/// permission, containment, in that order. Permission comes before the
/// existence check so other users' file names cannot be discovered.
async fn resolve_document(user: &SessionUser, archivo: Option<&str>, state: &AppState) -> Result<(std::path::PathBuf, String, String)> {
    let requested = archivo.map(str::trim).filter(|a| !a.is_empty()).ok_or(FileError::MissingName)?;
    let relative = guard::strip_base_url(requested, &state.config.storage.base_url);
    let ext = allowed_extension(relative, policy::DOCUMENT_EXTENSIONS)?;

    let file_name = access::file_name(relative).to_string();
    let owns = if user.is_admin() || access::is_shared_document(relative) {
        false
    } else {
        state.portal.owns_file(user.id, &file_name).await?
    };
    if !access::can_access_document(user, relative, owns) {
        warn!("User {} denied access to {}", user.id, relative);
        return Err(denied());
    }

    let path = guard::resolve_within(state.storage_root(), relative)?;
    Ok((path, ext, file_name))
}

pub async fn download_document(
    req: HttpRequest,
    query: web::Query<DocumentQuery>,
    current: CurrentUser,
    state: web::Data<AppState>,
) -> Result<HttpResponse> {
    let (path, _, file_name) = resolve_document(&current.user, query.archivo.as_deref(), &state).await?;
    info!("User {} downloaded {}", current.user.id, file_name);
    serve(
        &req,
        &path,
        Delivery {
            content_type: "application/octet-stream",
            disposition: DispositionType::Attachment,
            file_name: &file_name,
            no_cache: false,
        },
    )
    .await
}

pub async fn view_document(
    req: HttpRequest,
    query: web::Query<DocumentQuery>,
    current: CurrentUser,
    state: web::Data<AppState>,
) -> Result<HttpResponse> {
    let (path, ext, file_name) = resolve_document(&current.user, query.archivo.as_deref(), &state).await?;
    serve(
        &req,
        &path,
        Delivery {
            content_type: policy::inline_mime(&ext),
            disposition: DispositionType::Inline,
            file_name: &file_name,
            no_cache: false,
        },
    )
    .await
}

/// Checks the leading bytes of the file against its extension.
async fn check_signature(path: &Path, ext: &str) -> Result<()> {
    let file = tokio::fs::File::open(path).await?;
    let mut head = Vec::with_capacity(SNIFF_BYTES as usize);
    file.take(SNIFF_BYTES).read_to_end(&mut head).await?;
    if !policy::mime_matches_extension(ext, &head) {
        warn!("Content of {} does not match .{}", path.display(), ext);
        return Err(forbidden_type());
    }
    Ok(())
}

pub async fn notification_file(
    req: HttpRequest,
    query: web::Query<AttachmentQuery>,
    current: CurrentUser,
    state: web::Data<AppState>,
) -> Result<HttpResponse> {
    if query.tipo.as_deref() == Some("respuesta") {
        return reply_file(&req, query.ruta.as_deref(), &current.user, &state).await;
    }

    let id = query
        .id
        .as_deref()
        .and_then(|id| id.trim().parse::<i64>().ok())
        .filter(|id| *id > 0)
        .ok_or_else(|| AppError::validation("ID de archivo inválido"))?;

    let archivo = state
        .notifications
        .attachment(id)
        .await?
        .ok_or_else(|| AppError::NotFound("Archivo no encontrado".to_string()))?;
    let notification = state
        .notifications
        .get(archivo.notificacion_id)
        .await?
        .ok_or_else(|| AppError::NotFound("Archivo no encontrado".to_string()))?;

    if !access::notification_visible(state.notifications.as_ref(), &current.user, &notification).await? {
        return Err(denied());
    }

    let ext = match policy::extension(&archivo.nombre_original) {
        Some(_) => allowed_extension(&archivo.nombre_original, policy::NOTIFICATION_EXTENSIONS)?,
        None => allowed_extension(&archivo.nombre_archivo, policy::NOTIFICATION_EXTENSIONS)?,
    };

    let path = guard::resolve_legacy(
        state.storage_root(),
        &archivo.ruta_archivo,
        NOTIFICATIONS_DIR,
        &archivo.nombre_archivo,
    )?;
    check_signature(&path, &ext).await?;

    serve(
        &req,
        &path,
        Delivery {
            content_type: policy::attachment_mime(&ext),
            disposition: DispositionType::Attachment,
            file_name: &archivo.nombre_original,
            no_cache: true,
        },
    )
    .await
}

async fn reply_file(req: &HttpRequest, ruta: Option<&str>, user: &SessionUser, state: &AppState) -> Result<HttpResponse> {
    let requested = ruta.map(str::trim).filter(|r| !r.is_empty()).ok_or(FileError::MissingName)?;
    let relative = guard::strip_base_url(requested, &state.config.storage.base_url);
    if !relative.starts_with(&format!("{}/", REPLIES_DIR)) {
        return Err(FileError::Traversal.into());
    }
    let ext = allowed_extension(relative, policy::REPLY_EXTENSIONS)?;

    let reply = state
        .notifications
        .reply_by_attachment(relative)
        .await?
        .ok_or_else(|| AppError::NotFound("Archivo no encontrado".to_string()))?;

    if !user.is_admin() {
        let notification = state
            .notifications
            .get(reply.notificacion_id)
            .await?
            .ok_or_else(|| AppError::NotFound("Archivo no encontrado".to_string()))?;
        if !access::notification_visible(state.notifications.as_ref(), user, &notification).await? {
            return Err(denied());
        }
    }

    let path = guard::resolve_within(state.storage_root(), relative)?;
    check_signature(&path, &ext).await?;

    let download_name = reply
        .archivos
        .iter()
        .find(|adjunto| adjunto.ruta == relative)
        .map(|adjunto| adjunto.nombre.clone())
        .unwrap_or_else(|| access::file_name(relative).to_string());

    serve(
        req,
        &path,
        Delivery {
            content_type: policy::attachment_mime(&ext),
            disposition: DispositionType::Attachment,
            file_name: &download_name,
            no_cache: true,
        },
    )
    .await
}
