use actix_multipart::Multipart;
use actix_web::{web, HttpRequest, HttpResponse};
use chrono::Utc;
use serde_json::json;
use tracing::info;

use crate::auth::csrf;
use crate::auth::session::{AuthState, CurrentUser};
use crate::db::models::ActualizacionPerfil;
use crate::error::{AppError, AuthError, FileError};
use crate::files::storage::{self, MultipartForm, UploadLimits, AVATARS_DIR};
use crate::files::policy;
use crate::portal::validate::{age_on, char_len_between, is_valid_phone, parse_date};
use crate::{AppState, Result};

const MAX_ABOUT_ME: usize = 500;

/// Validated profile fields, avatar excluded.
pub fn parse_profile(form: &MultipartForm) -> Result<ActualizacionPerfil> {
    let nombre = form.text("nombre").unwrap_or_default();
    let apellido = form.text("apellido").unwrap_or_default();
    if !char_len_between(nombre, 2, 100) {
        return Err(AppError::validation("El nombre debe tener entre 2 y 100 caracteres"));
    }
    if !char_len_between(apellido, 2, 100) {
        return Err(AppError::validation("El apellido debe tener entre 2 y 100 caracteres"));
    }

    let telefono = form.text("telefono").map(str::to_string);
    if telefono.as_deref().map_or(false, |t| !is_valid_phone(t)) {
        return Err(AppError::validation("El formato del teléfono no es válido"));
    }
    let emergencia_telefono = form.text("emergencia_telefono").map(str::to_string);
    if emergencia_telefono.as_deref().map_or(false, |t| !is_valid_phone(t)) {
        return Err(AppError::validation("El formato del teléfono de emergencia no es válido"));
    }

    let fecha_nacimiento = match form.text("fecha_nacimiento") {
        Some(raw) => {
            let fecha = parse_date(raw).ok_or_else(|| AppError::validation("La fecha de nacimiento no es válida"))?;
            let edad = age_on(fecha, Utc::now().date_naive());
            if !(16..=100).contains(&edad) {
                return Err(AppError::validation("La edad debe estar entre 16 y 100 años"));
            }
            Some(fecha)
        }
        None => None,
    };

    let acerca_de_mi = form.text("acerca_de_mi").map(str::to_string);
    if acerca_de_mi.as_deref().map_or(false, |a| a.chars().count() > MAX_ABOUT_ME) {
        return Err(AppError::validation("La descripción no puede superar los 500 caracteres"));
    }

    Ok(ActualizacionPerfil {
        nombre: nombre.to_string(),
        apellido: apellido.to_string(),
        telefono,
        direccion: form.text("direccion").map(str::to_string),
        fecha_nacimiento,
        estado_civil: form.text("estado_civil").map(str::to_string),
        emergencia_contacto: form.text("emergencia_contacto").map(str::to_string),
        emergencia_telefono,
        acerca_de_mi,
        avatar: None,
    })
}

pub async fn get_profile(current: CurrentUser, state: web::Data<AppState>) -> Result<HttpResponse> {
    let usuario = state
        .users
        .find_by_id(current.user.id)
        .await?
        .ok_or(AuthError::NotAuthenticated)?;

    Ok(HttpResponse::Ok().json(json!({
        "success": true,
        "usuario": usuario,
        "tiene_secreto_2fa": usuario.has_totp_secret()
    })))
}

pub async fn update_profile(
    req: HttpRequest,
    payload: Multipart,
    current: CurrentUser,
    state: web::Data<AppState>,
) -> Result<HttpResponse> {
    let limits = UploadLimits::new(&state.config.storage, state.config.storage.max_avatar_bytes, 1);
    let form = MultipartForm::read(payload, limits).await?;
    csrf::require(&current.session, &req, form.raw_text("csrf_token"), state.csrf_lifetime())?;

    let mut profile = parse_profile(&form)?;
    let user_id = current.user.id;

    let mut avatar_url = None;
    if let Some(file) = form.file("avatar") {
        let ext = file.extension().ok_or(FileError::DisallowedExtension)?;
        if !policy::AVATAR_EXTENSIONS.contains(&ext.as_str()) {
            return Err(FileError::DisallowedExtension.into());
        }
        if !policy::mime_matches_extension(&ext, &file.bytes) {
            return Err(FileError::DisallowedMime.into());
        }

        let previous = state.users.find_by_id(user_id).await?.and_then(|u| u.avatar);
        let stored = storage::store(
            state.storage_root(),
            AVATARS_DIR,
            &format!("user_{}.{}", user_id, ext),
            &file.bytes,
        )
        .await?;
        if let Some(previous) = previous.filter(|p| *p != stored) {
            storage::remove(state.storage_root(), &previous, &state.config.storage.base_url).await;
        }

        avatar_url = Some(format!(
            "{}{}?v={}",
            state.config.storage.base_url,
            stored,
            Utc::now().timestamp()
        ));
        profile.avatar = Some(stored);
    }

    let (nombre, apellido) = (profile.nombre.clone(), profile.apellido.clone());
    state.users.update_profile(user_id, profile).await?;

    let mut user = current.user.clone();
    user.nombre = nombre;
    user.apellido = apellido;
    current.session.set_auth(AuthState::Authenticated { user });
    info!("User {} updated profile", user_id);

    Ok(HttpResponse::Ok().json(json!({
        "success": true,
        "message": "Perfil actualizado correctamente",
        "avatar_url": avatar_url
    })))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::files::UploadedFile;
    use crate::test_support::{csrf_for, multipart, regular_user, test_state_with_root, usuario, Mocks, Part};
    use actix_web::http::StatusCode;
    use actix_web::test::TestRequest;
    use actix_web::ResponseError;
    use chrono::Datelike;
    use std::collections::HashMap;

    const PNG: &[u8] = &[0x89, 0x50, 0x4E, 0x47, 0x0D, 0x0A, 0x1A, 0x0A, 0x00, 0x00, 0x00, 0x0D];

    #[actix_web::test]
    async fn test_avatar_replaces_previous_file() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join(AVATARS_DIR)).unwrap();
        let previous = dir.path().join("Img/Avatars/user_3.jpg");
        std::fs::write(&previous, b"old").unwrap();

        let mut mocks = Mocks::default();
        mocks.users.expect_find_by_id().returning(|id| {
            let mut user = usuario(id, "usuario");
            user.avatar = Some("Img/Avatars/user_3.jpg".into());
            Ok(Some(user))
        });
        mocks
            .users
            .expect_update_profile()
            .withf(|id, profile| *id == 3 && profile.avatar.as_deref() == Some("Img/Avatars/user_3.png"))
            .times(1)
            .returning(|_, _| Ok(()));
        let state = test_state_with_root(mocks, dir.path());
        let current = regular_user(3);
        let token = csrf_for(&current.session).unwrap();

        let parts = [
            Part::Text("csrf_token", &token),
            Part::Text("nombre", "Ana"),
            Part::Text("apellido", "Ruiz"),
            Part::File("avatar", "yo.png", PNG),
        ];
        let resp = update_profile(TestRequest::default().to_http_request(), multipart(&parts), current, state)
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert!(dir.path().join("Img/Avatars/user_3.png").is_file());
        assert!(!previous.exists());
    }

    #[actix_web::test]
    async fn test_avatar_content_must_match_extension() {
        let dir = tempfile::tempdir().unwrap();
        let mut mocks = Mocks::default();
        mocks.users.expect_update_profile().times(0);
        let state = test_state_with_root(mocks, dir.path());
        let current = regular_user(3);
        let token = csrf_for(&current.session).unwrap();

        let parts = [
            Part::Text("csrf_token", &token),
            Part::Text("nombre", "Ana"),
            Part::Text("apellido", "Ruiz"),
            Part::File("avatar", "yo.png", b"%PDF-1.4"),
        ];
        let err = update_profile(TestRequest::default().to_http_request(), multipart(&parts), current, state)
            .await
            .unwrap_err();
        assert_eq!(err.status_code(), StatusCode::BAD_REQUEST);
        assert!(!dir.path().join("Img/Avatars/user_3.png").exists());
    }

    fn form(pairs: &[(&str, &str)]) -> MultipartForm {
        let fields: HashMap<String, String> = pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        MultipartForm::from_parts(fields, Vec::<UploadedFile>::new())
    }

    #[test]
    fn test_minimal_profile() {
        let profile = parse_profile(&form(&[("nombre", "Ana"), ("apellido", "Ruiz"), ("telefono", "")])).unwrap();
        assert_eq!(profile.nombre, "Ana");
        assert_eq!(profile.telefono, None);
        assert_eq!(profile.avatar, None);
    }

    #[test]
    fn test_name_lengths() {
        let err = parse_profile(&form(&[("nombre", "A"), ("apellido", "Ruiz")])).unwrap_err();
        assert_eq!(err.public_message(), "El nombre debe tener entre 2 y 100 caracteres");
    }

    #[test]
    fn test_phone_and_birth_date() {
        assert!(parse_profile(&form(&[("nombre", "Ana"), ("apellido", "Ruiz"), ("telefono", "12")])).is_err());
        assert!(parse_profile(&form(&[("nombre", "Ana"), ("apellido", "Ruiz"), ("fecha_nacimiento", "31/12/1990")])).is_err());

        let too_young = format!("{}-01-01", Utc::now().year() - 10);
        let err = parse_profile(&form(&[("nombre", "Ana"), ("apellido", "Ruiz"), ("fecha_nacimiento", &too_young)]))
            .unwrap_err();
        assert_eq!(err.public_message(), "La edad debe estar entre 16 y 100 años");

        let ok = parse_profile(&form(&[("nombre", "Ana"), ("apellido", "Ruiz"), ("fecha_nacimiento", "1990-05-20")]))
            .unwrap();
        assert!(ok.fecha_nacimiento.is_some());
    }

    #[test]
    fn test_about_me_limit() {
        let long = "a".repeat(501);
        assert!(parse_profile(&form(&[("nombre", "Ana"), ("apellido", "Ruiz"), ("acerca_de_mi", &long)])).is_err());
    }
}
