//! Personal documents uploaded by users and the admin file archive
//! (processed files and shared resources).

use actix_multipart::Multipart;
use actix_web::{web, HttpRequest, HttpResponse};
use serde::Deserialize;
use serde_json::json;
use tracing::{info, warn};

use crate::auth::csrf;
use crate::auth::session::{AdminUser, CurrentUser};
use crate::db::models::{NuevoDocumento, NuevoDocumentoUsuario, TipoDocumentoUsuario, TipoSeccion};
use crate::error::{AppError, FileError};
use crate::files::storage::{self, MultipartForm, UploadLimits, UploadedFile, APPLICATIONS_DIR};
use crate::files::{guard, policy};
use crate::portal::IdRequest;
use crate::{AppState, Result};

const MAX_DISPLAY_NAME: usize = 255;

fn single_upload(state: &AppState) -> UploadLimits {
    UploadLimits::new(&state.config.storage, state.config.storage.max_upload_bytes, 1)
}

fn require_pdf(file: &UploadedFile) -> Result<()> {
    if file.extension().as_deref() != Some("pdf") {
        return Err(FileError::DisallowedExtension.into());
    }
    if !policy::mime_matches_extension("pdf", &file.bytes) {
        return Err(FileError::DisallowedMime.into());
    }
    Ok(())
}

pub async fn list_my_documents(current: CurrentUser, state: web::Data<AppState>) -> Result<HttpResponse> {
    let documentos = state.portal.user_documents(Some(current.user.id)).await?;
    Ok(HttpResponse::Ok().json(json!({
        "success": true,
        "documentos": documentos
    })))
}

pub async fn upload_my_document(
    req: HttpRequest,
    payload: Multipart,
    current: CurrentUser,
    state: web::Data<AppState>,
) -> Result<HttpResponse> {
    if current.user.is_admin() {
        return Err(AppError::Forbidden(
            "Los administradores no cargan documentos personales".to_string(),
        ));
    }

    let form = MultipartForm::read(payload, single_upload(&state)).await?;
    csrf::require(&current.session, &req, form.raw_text("csrf_token"), state.csrf_lifetime())?;

    let tipo = form
        .text("tipo_documento")
        .and_then(TipoDocumentoUsuario::parse)
        .ok_or_else(|| AppError::validation("Tipo de documento no válido"))?;
    let file = form
        .file("documento")
        .ok_or_else(|| AppError::validation("Debe seleccionar un archivo"))?;
    require_pdf(file)?;

    let user_id = current.user.id;
    let name = storage::user_document_name(user_id, tipo.as_str());
    let dir = format!("Documentos/{}", tipo.folder());
    let ruta = storage::store(state.storage_root(), &dir, &name, &file.bytes).await?;

    let id = state
        .portal
        .create_user_document(NuevoDocumentoUsuario {
            usuario_id: user_id,
            tipo_documento: tipo.as_str().to_string(),
            nombre_archivo: policy::sanitize_download_name(&file.file_name),
            ruta_archivo: ruta,
        })
        .await?;
    info!("User {} uploaded document {} ({})", user_id, id, tipo.as_str());

    Ok(HttpResponse::Created().json(json!({
        "success": true,
        "id": id,
        "message": "Documento cargado correctamente"
    })))
}

pub async fn delete_my_document(
    req: HttpRequest,
    body: web::Json<IdRequest>,
    current: CurrentUser,
    state: web::Data<AppState>,
) -> Result<HttpResponse> {
    csrf::require(&current.session, &req, body.csrf_token.as_deref(), state.csrf_lifetime())?;
    let id = body.valid_id("ID de documento inválido")?;

    let document = state
        .portal
        .user_document(id)
        .await?
        .filter(|doc| doc.usuario_id == current.user.id)
        .ok_or_else(|| AppError::NotFound("Documento no encontrado".to_string()))?;

    state.portal.delete_user_document(document.id).await?;
    storage::remove(state.storage_root(), &document.ruta_archivo, &state.config.storage.base_url).await;
    info!("User {} deleted document {}", current.user.id, id);

    Ok(HttpResponse::Ok().json(json!({
        "success": true,
        "message": "Documento eliminado correctamente"
    })))
}

pub async fn list_archives(_admin: AdminUser, state: web::Data<AppState>) -> Result<HttpResponse> {
    let documentos = state.portal.documents().await?;
    let documentos_usuarios = state.portal.user_documents(None).await?;
    let postulaciones = state.portal.applications().await?;

    Ok(HttpResponse::Ok().json(json!({
        "success": true,
        "documentos": documentos,
        "documentos_usuarios": documentos_usuarios,
        "postulaciones": postulaciones
    })))
}

pub async fn upload_archive(
    req: HttpRequest,
    payload: Multipart,
    admin: AdminUser,
    state: web::Data<AppState>,
) -> Result<HttpResponse> {
    let form = MultipartForm::read(payload, single_upload(&state)).await?;
    csrf::require(&admin.session, &req, form.raw_text("csrf_token"), state.csrf_lifetime())?;

    let seccion = form
        .text("tipo_seccion")
        .and_then(TipoSeccion::parse)
        .ok_or_else(|| AppError::validation("Tipo de sección no válido"))?;
    let file = form
        .file("archivo")
        .ok_or_else(|| AppError::validation("Debe seleccionar un archivo"))?;

    let ext = file.extension().ok_or(FileError::DisallowedExtension)?;
    if !policy::ARCHIVE_EXTENSIONS.contains(&ext.as_str()) {
        return Err(FileError::DisallowedExtension.into());
    }
    if !policy::mime_matches_extension(&ext, &file.bytes) {
        return Err(FileError::DisallowedMime.into());
    }

    let nombre = form
        .text("nombre")
        .unwrap_or(file.file_name.as_str())
        .chars()
        .take(MAX_DISPLAY_NAME)
        .collect::<String>();
    let stored_name = storage::notification_file_name(&file.file_name);
    let ruta = storage::store(state.storage_root(), seccion.directory(), &stored_name, &file.bytes).await?;

    let id = state
        .portal
        .create_document(NuevoDocumento {
            nombre,
            ruta,
            tipo_documento: policy::document_kind(&ext).to_string(),
            tipo_seccion: seccion,
            subido_por: admin.user.id,
        })
        .await?;
    info!("Admin {} uploaded archive {} to {}", admin.user.id, id, seccion.as_str());

    Ok(HttpResponse::Created().json(json!({
        "success": true,
        "id": id,
        "message": "Archivo subido exitosamente"
    })))
}

#[derive(Debug, Deserialize)]
pub struct DeleteArchiveRequest {
    pub id: Option<i64>,
    /// Stored CV path when deleting an application file.
    pub hoja_vida: Option<String>,
    pub csrf_token: Option<String>,
}

pub async fn delete_archive(
    req: HttpRequest,
    body: web::Json<DeleteArchiveRequest>,
    admin: AdminUser,
    state: web::Data<AppState>,
) -> Result<HttpResponse> {
    csrf::require(&admin.session, &req, body.csrf_token.as_deref(), state.csrf_lifetime())?;
    let base_url = &state.config.storage.base_url;

    if let Some(hoja_vida) = body.hoja_vida.as_deref().map(str::trim).filter(|h| !h.is_empty()) {
        let relative = guard::strip_base_url(hoja_vida, base_url);
        if !relative.starts_with(&format!("{}/", APPLICATIONS_DIR)) {
            return Err(FileError::Traversal.into());
        }
        if state.portal.delete_application_by_file(relative).await? == 0 {
            return Err(AppError::NotFound("Postulación no encontrada".to_string()));
        }
        storage::remove(state.storage_root(), relative, base_url).await;
        info!("Admin {} deleted application file {}", admin.user.id, relative);
        return Ok(HttpResponse::Ok().json(json!({
            "success": true,
            "message": "Postulación eliminada exitosamente"
        })));
    }

    let id = body
        .id
        .filter(|id| *id > 0)
        .ok_or_else(|| AppError::validation("Parámetros requeridos faltantes"))?;
    let document = state
        .portal
        .document(id)
        .await?
        .ok_or_else(|| AppError::NotFound("Archivo no encontrado".to_string()))?;

    state.portal.delete_document(id).await?;
    if TipoSeccion::parse(&document.tipo_seccion) == Some(TipoSeccion::Archivo) {
        let removed = state.portal.delete_application_by_file(&document.ruta).await?;
        if removed > 0 {
            warn!("Archive {} also removed {} application(s)", id, removed);
        }
    }
    storage::remove(state.storage_root(), &document.ruta, base_url).await;
    info!("Admin {} deleted archive {}", admin.user.id, id);

    Ok(HttpResponse::Ok().json(json!({
        "success": true,
        "message": "Archivo eliminado exitosamente"
    })))
}

#[derive(Debug, Deserialize)]
pub struct RenameRequest {
    pub id: Option<i64>,
    #[serde(default)]
    pub nuevo_nombre: String,
    #[serde(default)]
    pub tipo: String,
    pub csrf_token: Option<String>,
}

pub async fn rename_archive(
    req: HttpRequest,
    body: web::Json<RenameRequest>,
    admin: AdminUser,
    state: web::Data<AppState>,
) -> Result<HttpResponse> {
    csrf::require(&admin.session, &req, body.csrf_token.as_deref(), state.csrf_lifetime())?;

    let id = body
        .id
        .filter(|id| *id > 0)
        .ok_or_else(|| AppError::validation("Parámetros requeridos faltantes"))?;
    let nombre = body.nuevo_nombre.trim();
    if nombre.is_empty() {
        return Err(AppError::validation("El nombre no puede estar vacío"));
    }
    if nombre.chars().count() > MAX_DISPLAY_NAME {
        return Err(AppError::validation("El nombre es demasiado largo"));
    }

    let renamed = match body.tipo.as_str() {
        "documentos_usuarios" => state.portal.rename_user_document(id, nombre).await?,
        tipo => {
            let seccion = TipoSeccion::parse(tipo).ok_or_else(|| AppError::validation("Tipo no válido"))?;
            match state.portal.document(id).await? {
                Some(doc) if doc.tipo_seccion == seccion.as_str() => state.portal.rename_document(id, nombre).await?,
                _ => false,
            }
        }
    };
    if !renamed {
        return Err(AppError::NotFound("Archivo no encontrado".to_string()));
    }
    info!("Admin {} renamed {} {}", admin.user.id, body.tipo, id);

    Ok(HttpResponse::Ok().json(json!({
        "success": true,
        "message": "Nombre actualizado correctamente"
    })))
}

pub async fn delete_user_document(
    req: HttpRequest,
    body: web::Json<IdRequest>,
    admin: AdminUser,
    state: web::Data<AppState>,
) -> Result<HttpResponse> {
    csrf::require(&admin.session, &req, body.csrf_token.as_deref(), state.csrf_lifetime())?;
    let id = body.valid_id("ID de documento inválido")?;

    let document = state
        .portal
        .user_document(id)
        .await?
        .ok_or_else(|| AppError::NotFound("Documento no encontrado".to_string()))?;
    state.portal.delete_user_document(id).await?;
    storage::remove(state.storage_root(), &document.ruta_archivo, &state.config.storage.base_url).await;
    info!("Admin {} deleted user document {}", admin.user.id, id);

    Ok(HttpResponse::Ok().json(json!({
        "success": true,
        "message": "Documento eliminado correctamente"
    })))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::models::{Documento, DocumentoUsuario};
    use crate::test_support::{admin_user, csrf_for, multipart, regular_user, test_state_with_root, Mocks, Part};
    use actix_web::http::StatusCode;
    use actix_web::test::TestRequest;
    use actix_web::ResponseError;
    use chrono::Utc;

    fn user_doc(id: i64, owner: i64, ruta: &str) -> DocumentoUsuario {
        DocumentoUsuario {
            id,
            usuario_id: owner,
            tipo_documento: "otros".into(),
            nombre_archivo: "certificado.pdf".into(),
            ruta_archivo: ruta.into(),
            fecha_subida: Utc::now(),
        }
    }

    fn stored(dir: &std::path::Path) -> usize {
        std::fs::read_dir(dir).map(|entries| entries.count()).unwrap_or(0)
    }

    #[actix_web::test]
    async fn test_upload_my_document_stores_pdf() {
        let dir = tempfile::tempdir().unwrap();
        let mut mocks = Mocks::default();
        mocks
            .portal
            .expect_create_user_document()
            .withf(|doc| {
                doc.usuario_id == 3
                    && doc.tipo_documento == "certificado"
                    && doc.ruta_archivo.starts_with("Documentos/Certificados/3_certificado_")
            })
            .times(1)
            .returning(|_| Ok(40));
        let state = test_state_with_root(mocks, dir.path());
        let current = regular_user(3);
        let token = csrf_for(&current.session).unwrap();

        let parts = [
            Part::Text("csrf_token", &token),
            Part::Text("tipo_documento", "certificado"),
            Part::File("documento", "certificado laboral.pdf", b"%PDF-1.4"),
        ];
        let resp = upload_my_document(TestRequest::default().to_http_request(), multipart(&parts), current, state)
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::CREATED);
        assert_eq!(stored(&dir.path().join("Documentos/Certificados")), 1);
    }

    #[actix_web::test]
    async fn test_upload_my_document_rejects_renamed_content() {
        let dir = tempfile::tempdir().unwrap();
        let mut mocks = Mocks::default();
        mocks.portal.expect_create_user_document().times(0);
        let state = test_state_with_root(mocks, dir.path());
        let current = regular_user(3);
        let token = csrf_for(&current.session).unwrap();

        let parts = [
            Part::Text("csrf_token", &token),
            Part::Text("tipo_documento", "otros"),
            Part::File("documento", "nota.pdf", b"solo texto"),
        ];
        let err = upload_my_document(TestRequest::default().to_http_request(), multipart(&parts), current, state)
            .await
            .unwrap_err();
        assert_eq!(err.status_code(), StatusCode::BAD_REQUEST);
        assert_eq!(stored(&dir.path().join("Documentos/Otros")), 0);
    }

    #[actix_web::test]
    async fn test_upload_archive_takes_one_file() {
        let dir = tempfile::tempdir().unwrap();
        let mut mocks = Mocks::default();
        mocks.portal.expect_create_document().times(0);
        let state = test_state_with_root(mocks, dir.path());
        let admin = admin_user();
        let token = csrf_for(&admin.session).unwrap();

        let parts = [
            Part::Text("csrf_token", &token),
            Part::Text("tipo_seccion", "recursos"),
            Part::File("archivo", "manual.pdf", b"%PDF-1.4"),
            Part::File("archivo", "anexo.pdf", b"%PDF-1.4"),
        ];
        let err = upload_archive(TestRequest::default().to_http_request(), multipart(&parts), admin, state)
            .await
            .unwrap_err();
        assert_eq!(err.status_code(), StatusCode::BAD_REQUEST);
        assert_eq!(err.public_message(), "Máximo 1 archivos permitidos por envío");
        assert_eq!(stored(&dir.path().join("Documentos/Recursos")), 0);
    }

    #[actix_web::test]
    async fn test_upload_archive_records_kind_and_section() {
        let dir = tempfile::tempdir().unwrap();
        let mut mocks = Mocks::default();
        mocks
            .portal
            .expect_create_document()
            .withf(|doc| {
                doc.nombre == "Manual de inducción"
                    && doc.tipo_documento == "pdf"
                    && doc.tipo_seccion == TipoSeccion::Recursos
                    && doc.ruta.starts_with("Documentos/Recursos/")
            })
            .times(1)
            .returning(|_| Ok(3));
        let state = test_state_with_root(mocks, dir.path());
        let admin = admin_user();
        let token = csrf_for(&admin.session).unwrap();

        let parts = [
            Part::Text("csrf_token", &token),
            Part::Text("tipo_seccion", "recursos"),
            Part::Text("nombre", "Manual de inducción"),
            Part::File("archivo", "manual.pdf", b"%PDF-1.4"),
        ];
        let resp = upload_archive(TestRequest::default().to_http_request(), multipart(&parts), admin, state)
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::CREATED);
        assert_eq!(stored(&dir.path().join("Documentos/Recursos")), 1);
    }

    #[test]
    fn test_require_pdf() {
        let ok = UploadedFile { field: "documento".into(), file_name: "cv.PDF".into(), bytes: b"%PDF-1.7".to_vec() };
        assert!(require_pdf(&ok).is_ok());

        let renamed = UploadedFile { field: "documento".into(), file_name: "cv.pdf".into(), bytes: b"GIF89a....".to_vec() };
        assert_eq!(
            require_pdf(&renamed).unwrap_err().public_message(),
            "El contenido del archivo no corresponde a un tipo permitido"
        );

        let word = UploadedFile { field: "documento".into(), file_name: "cv.docx".into(), bytes: vec![0x50, 0x4b, 3, 4] };
        assert!(require_pdf(&word).is_err());
    }

    #[actix_web::test]
    async fn test_user_cannot_delete_foreign_document() {
        let dir = tempfile::tempdir().unwrap();
        let mut mocks = Mocks::default();
        mocks
            .portal
            .expect_user_document()
            .returning(|id| Ok(Some(user_doc(id, 99, "Documentos/Otros/99_otros_a.pdf"))));
        mocks.portal.expect_delete_user_document().times(0);
        let state = test_state_with_root(mocks, dir.path());
        let current = regular_user(3);

        let body = web::Json(IdRequest { id: Some(1), csrf_token: csrf_for(&current.session) });
        let err = delete_my_document(TestRequest::default().to_http_request(), body, current, state)
            .await
            .unwrap_err();
        assert_eq!(err.status_code(), StatusCode::NOT_FOUND);
    }

    #[actix_web::test]
    async fn test_owner_deletes_document_and_file() {
        let dir = tempfile::tempdir().unwrap();
        let stored = storage::store(dir.path(), "Documentos/Otros", "3_otros_a.pdf", b"%PDF").await.unwrap();

        let mut mocks = Mocks::default();
        let ruta = stored.clone();
        mocks
            .portal
            .expect_user_document()
            .returning(move |id| Ok(Some(user_doc(id, 3, &ruta))));
        mocks.portal.expect_delete_user_document().times(1).returning(|_| Ok(true));
        let state = test_state_with_root(mocks, dir.path());
        let current = regular_user(3);

        let body = web::Json(IdRequest { id: Some(1), csrf_token: csrf_for(&current.session) });
        delete_my_document(TestRequest::default().to_http_request(), body, current, state)
            .await
            .unwrap();
        assert!(!dir.path().join(&stored).exists());
    }

    #[actix_web::test]
    async fn test_delete_processed_archive_removes_application() {
        let dir = tempfile::tempdir().unwrap();
        let mut mocks = Mocks::default();
        mocks.portal.expect_document().returning(|id| {
            Ok(Some(Documento {
                id,
                nombre: "HV".into(),
                ruta: "Documentos/Procesados/1_a_hv.pdf".into(),
                tipo_documento: "pdf".into(),
                tipo_seccion: "archivo".into(),
                subido_por: Some(1),
                fecha_subida: Utc::now(),
            }))
        });
        mocks.portal.expect_delete_document().times(1).returning(|_| Ok(true));
        mocks
            .portal
            .expect_delete_application_by_file()
            .withf(|ruta| ruta == "Documentos/Procesados/1_a_hv.pdf")
            .times(1)
            .returning(|_| Ok(0));
        let state = test_state_with_root(mocks, dir.path());
        let admin = admin_user();

        let body = web::Json(DeleteArchiveRequest { id: Some(4), hoja_vida: None, csrf_token: csrf_for(&admin.session) });
        delete_archive(TestRequest::default().to_http_request(), body, admin, state)
            .await
            .unwrap();
    }

    #[actix_web::test]
    async fn test_delete_application_path_must_be_inside_applications() {
        let dir = tempfile::tempdir().unwrap();
        let mut mocks = Mocks::default();
        mocks.portal.expect_delete_application_by_file().times(0);
        let state = test_state_with_root(mocks, dir.path());
        let admin = admin_user();

        let body = web::Json(DeleteArchiveRequest {
            id: None,
            hoja_vida: Some("Documentos/Procesados/nomina.xlsx".into()),
            csrf_token: csrf_for(&admin.session),
        });
        let err = delete_archive(TestRequest::default().to_http_request(), body, admin, state)
            .await
            .unwrap_err();
        assert_eq!(err.status_code(), StatusCode::FORBIDDEN);
    }

    #[actix_web::test]
    async fn test_rename_checks_section() {
        let dir = tempfile::tempdir().unwrap();
        let mut mocks = Mocks::default();
        mocks.portal.expect_document().returning(|id| {
            Ok(Some(Documento {
                id,
                nombre: "Manual".into(),
                ruta: "Documentos/Recursos/1_a_manual.pdf".into(),
                tipo_documento: "pdf".into(),
                tipo_seccion: "recursos".into(),
                subido_por: Some(1),
                fecha_subida: Utc::now(),
            }))
        });
        mocks
            .portal
            .expect_rename_document()
            .withf(|id, nombre| *id == 2 && nombre == "Manual 2024")
            .times(1)
            .returning(|_, _| Ok(true));
        let state = test_state_with_root(mocks, dir.path());

        let admin = admin_user();
        let body = web::Json(RenameRequest {
            id: Some(2),
            nuevo_nombre: " Manual 2024 ".into(),
            tipo: "recursos".into(),
            csrf_token: csrf_for(&admin.session),
        });
        rename_archive(TestRequest::default().to_http_request(), body, admin, state.clone())
            .await
            .unwrap();

        let admin = admin_user();
        let body = web::Json(RenameRequest {
            id: Some(2),
            nuevo_nombre: "Otro".into(),
            tipo: "archivo".into(),
            csrf_token: csrf_for(&admin.session),
        });
        let err = rename_archive(TestRequest::default().to_http_request(), body, admin, state)
            .await
            .unwrap_err();
        assert_eq!(err.status_code(), StatusCode::NOT_FOUND);
    }
}
