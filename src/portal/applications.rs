use actix_multipart::Multipart;
use actix_web::{web, HttpRequest, HttpResponse};
use serde_json::json;
use tracing::{error, info, warn};

use crate::auth::csrf;
use crate::auth::session::{AdminUser, Session};
use crate::db::models::NuevaPostulacion;
use crate::error::{AppError, DatabaseError};
use crate::files::storage::{self, MultipartForm, UploadLimits};
use crate::files::policy;
use crate::portal::validate::{
    is_valid_email, is_valid_phone, parse_id, validate_document_number, validate_person_name, MAX_EMAIL_LEN,
};
use crate::{AppState, Result};

const DUPLICATE_MESSAGE: &str =
    "Ya existe una postulación con este número de documento para la vacante seleccionada.";

/// Applicant data after every check, minus the stored file name.
#[derive(Debug, PartialEq)]
pub struct ApplicationInput {
    pub vacante_id: i64,
    pub tipo_documento: String,
    pub documento: String,
    pub nombre: String,
    pub correo: String,
    pub telefono: Option<String>,
}

pub fn parse_application(form: &MultipartForm) -> Result<ApplicationInput> {
    let nombre = form.text("nombre").map(str::to_uppercase);
    let tipo_documento = form.text("tipo_documento");
    let documento = form.text("documento").map(str::to_uppercase);
    let correo = form.text("correo").map(str::to_lowercase);
    let vacante_id = parse_id(form.text("vacante_id"));

    let (nombre, tipo_documento, documento, correo, vacante_id) =
        match (nombre, tipo_documento, documento, correo, vacante_id) {
            (Some(n), Some(t), Some(d), Some(c), Some(v)) => (n, t.to_string(), d, c, v),
            _ => return Err(AppError::validation("Faltan datos obligatorios en la postulación.")),
        };

    validate_document_number(&tipo_documento, &documento)?;
    validate_person_name(&nombre)?;

    if correo.len() > MAX_EMAIL_LEN {
        return Err(AppError::validation("El correo electrónico es demasiado largo."));
    }
    if !is_valid_email(&correo) {
        return Err(AppError::validation("El correo electrónico no es válido."));
    }

    let telefono = form.text("telefono").map(str::to_string);
    if let Some(telefono) = &telefono {
        if !is_valid_phone(telefono) {
            return Err(AppError::validation("El teléfono no tiene un formato válido."));
        }
    }

    Ok(ApplicationInput {
        vacante_id,
        tipo_documento,
        documento,
        nombre,
        correo,
        telefono,
    })
}

pub async fn submit_application(
    req: HttpRequest,
    payload: Multipart,
    session: Session,
    state: web::Data<AppState>,
) -> Result<HttpResponse> {
    let limits = UploadLimits::new(&state.config.storage, state.config.storage.max_upload_bytes, 1);
    let form = MultipartForm::read(payload, limits).await?;
    csrf::require(&session, &req, form.raw_text("csrf_token"), state.csrf_lifetime())?;

    let input = parse_application(&form)?;

    if state.portal.vacancy(input.vacante_id).await?.is_none() {
        return Err(AppError::validation("La vacante seleccionada no existe."));
    }

    let file = form
        .file("hoja_vida")
        .ok_or_else(|| AppError::validation("No se ha seleccionado ningún archivo válido."))?;
    if file.extension().as_deref() != Some("pdf") || !policy::mime_matches_extension("pdf", &file.bytes) {
        return Err(AppError::validation("Solo se permiten archivos PDF."));
    }

    if state.portal.application_exists(&input.documento, input.vacante_id).await? {
        return Err(AppError::Conflict(DUPLICATE_MESSAGE.to_string()));
    }

    let root = state.storage_root();
    let stored = storage::store_application(root, &input.nombre, &file.bytes).await?;

    let application = NuevaPostulacion {
        vacante_id: input.vacante_id,
        tipo_documento: input.tipo_documento,
        documento: input.documento,
        nombre: input.nombre,
        correo: input.correo,
        telefono: input.telefono,
        hoja_vida: stored.clone(),
    };

    match state.portal.create_application(application).await {
        Ok(id) => {
            info!("Application {} stored for vacancy {}", id, input.vacante_id);
            Ok(HttpResponse::Created().json(json!({
                "success": true,
                "message": "Tu postulación fue enviada correctamente"
            })))
        }
        Err(e) => {
            storage::remove(root, &stored, &state.config.storage.base_url).await;
            match e {
                AppError::DatabaseError(DatabaseError::Duplicate) => {
                    warn!("Duplicate application for vacancy {}", input.vacante_id);
                    Err(AppError::Conflict(DUPLICATE_MESSAGE.to_string()))
                }
                other => {
                    error!("Could not store application: {}", other);
                    Err(other)
                }
            }
        }
    }
}

pub async fn list_applications(_admin: AdminUser, state: web::Data<AppState>) -> Result<HttpResponse> {
    let postulaciones = state.portal.applications().await?;
    Ok(HttpResponse::Ok().json(json!({
        "success": true,
        "postulaciones": postulaciones
    })))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::session::AuthState;
    use crate::db::models::Vacante;
    use crate::files::UploadedFile;
    use crate::test_support::{csrf_for, multipart, test_state_with_root, Mocks, Part};
    use actix_web::http::StatusCode;
    use actix_web::test::TestRequest;
    use actix_web::ResponseError;
    use chrono::Utc;
    use std::collections::HashMap;

    fn form(pairs: &[(&str, &str)]) -> MultipartForm {
        let fields: HashMap<String, String> = pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        MultipartForm::from_parts(
            fields,
            vec![UploadedFile { field: "hoja_vida".into(), file_name: "cv.pdf".into(), bytes: b"%PDF-1.4".to_vec() }],
        )
    }

    fn valid() -> Vec<(&'static str, &'static str)> {
        vec![
            ("nombre", "José Pérez"),
            ("tipo_documento", "CC"),
            ("documento", "1020304050"),
            ("correo", "Jose.Perez@Example.com"),
            ("telefono", "300 123 4567"),
            ("vacante_id", "2"),
        ]
    }

    #[test]
    fn test_parse_normalizes_case() {
        let input = parse_application(&form(&valid())).unwrap();
        assert_eq!(input.nombre, "JOSÉ PÉREZ");
        assert_eq!(input.correo, "jose.perez@example.com");
        assert_eq!(input.vacante_id, 2);
        assert_eq!(input.telefono.as_deref(), Some("300 123 4567"));
    }

    #[test]
    fn test_parse_rejects_missing_and_invalid() {
        let mut fields = valid();
        fields.retain(|(k, _)| *k != "correo");
        let err = parse_application(&form(&fields)).unwrap_err();
        assert_eq!(err.public_message(), "Faltan datos obligatorios en la postulación.");

        let mut fields = valid();
        fields[2] = ("documento", "12AB");
        assert!(parse_application(&form(&fields)).is_err());

        let mut fields = valid();
        fields[3] = ("correo", "jose@");
        let err = parse_application(&form(&fields)).unwrap_err();
        assert_eq!(err.public_message(), "El correo electrónico no es válido.");

        let mut fields = valid();
        fields[4] = ("telefono", "abc");
        assert!(parse_application(&form(&fields)).is_err());

        let mut fields = valid();
        fields.retain(|(k, _)| *k != "telefono");
        assert_eq!(parse_application(&form(&fields)).unwrap().telefono, None);
    }

    fn vacante(id: i64) -> Vacante {
        Vacante {
            id,
            titulo: "Analista".into(),
            descripcion: "Analista de nómina".into(),
            ciudad: "Bogotá".into(),
            fecha_publicacion: Utc::now(),
        }
    }

    fn application_parts<'a>(token: &'a str) -> Vec<Part<'a>> {
        let mut parts = vec![Part::Text("csrf_token", token)];
        parts.extend(valid().into_iter().map(|(name, value)| Part::Text(name, value)));
        parts
    }

    fn stored_cvs(root: &std::path::Path) -> usize {
        std::fs::read_dir(root.join(storage::APPLICATIONS_DIR))
            .map(|entries| entries.count())
            .unwrap_or(0)
    }

    #[actix_web::test]
    async fn test_submit_stores_cv_under_applicant_name() {
        let dir = tempfile::tempdir().unwrap();
        let mut mocks = Mocks::default();
        mocks.portal.expect_vacancy().returning(|id| Ok(Some(vacante(id))));
        mocks.portal.expect_application_exists().returning(|_, _| Ok(false));
        mocks
            .portal
            .expect_create_application()
            .withf(|a| a.hoja_vida == "Documentos/Postulaciones/HV-JOSE.pdf" && a.documento == "1020304050")
            .times(1)
            .returning(|_| Ok(12));
        let state = test_state_with_root(mocks, dir.path());
        let session = Session::for_test(AuthState::Anonymous);
        let token = csrf_for(&session).unwrap();

        let mut parts = application_parts(&token);
        parts.push(Part::File("hoja_vida", "cv.pdf", b"%PDF-1.4"));
        let resp = submit_application(TestRequest::default().to_http_request(), multipart(&parts), session, state)
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::CREATED);
        assert!(dir.path().join("Documentos/Postulaciones/HV-JOSE.pdf").is_file());
    }

    #[actix_web::test]
    async fn test_duplicate_application_is_conflict() {
        let dir = tempfile::tempdir().unwrap();
        let mut mocks = Mocks::default();
        mocks.portal.expect_vacancy().returning(|id| Ok(Some(vacante(id))));
        mocks.portal.expect_application_exists().returning(|_, _| Ok(true));
        mocks.portal.expect_create_application().times(0);
        let state = test_state_with_root(mocks, dir.path());
        let session = Session::for_test(AuthState::Anonymous);
        let token = csrf_for(&session).unwrap();

        let mut parts = application_parts(&token);
        parts.push(Part::File("hoja_vida", "cv.pdf", b"%PDF-1.4"));
        let err = submit_application(TestRequest::default().to_http_request(), multipart(&parts), session, state)
            .await
            .unwrap_err();
        assert_eq!(err.status_code(), StatusCode::CONFLICT);
        assert_eq!(err.public_message(), DUPLICATE_MESSAGE);
        assert_eq!(stored_cvs(dir.path()), 0);
    }

    #[actix_web::test]
    async fn test_insert_race_removes_stored_cv() {
        let dir = tempfile::tempdir().unwrap();
        let mut mocks = Mocks::default();
        mocks.portal.expect_vacancy().returning(|id| Ok(Some(vacante(id))));
        mocks.portal.expect_application_exists().returning(|_, _| Ok(false));
        mocks
            .portal
            .expect_create_application()
            .returning(|_| Err(AppError::DatabaseError(DatabaseError::Duplicate)));
        let state = test_state_with_root(mocks, dir.path());
        let session = Session::for_test(AuthState::Anonymous);
        let token = csrf_for(&session).unwrap();

        let mut parts = application_parts(&token);
        parts.push(Part::File("hoja_vida", "cv.pdf", b"%PDF-1.4"));
        let err = submit_application(TestRequest::default().to_http_request(), multipart(&parts), session, state)
            .await
            .unwrap_err();
        assert_eq!(err.status_code(), StatusCode::CONFLICT);
        assert_eq!(stored_cvs(dir.path()), 0);
    }

    #[actix_web::test]
    async fn test_submit_accepts_a_single_file() {
        let dir = tempfile::tempdir().unwrap();
        let mut mocks = Mocks::default();
        mocks.portal.expect_vacancy().times(0);
        let state = test_state_with_root(mocks, dir.path());
        let session = Session::for_test(AuthState::Anonymous);
        let token = csrf_for(&session).unwrap();

        let mut parts = application_parts(&token);
        parts.push(Part::File("hoja_vida", "cv.pdf", b"%PDF-1.4"));
        parts.push(Part::File("hoja_vida", "otra.pdf", b"%PDF-1.4"));
        let err = submit_application(TestRequest::default().to_http_request(), multipart(&parts), session, state)
            .await
            .unwrap_err();
        assert_eq!(err.status_code(), StatusCode::BAD_REQUEST);
        assert_eq!(stored_cvs(dir.path()), 0);
    }
}
