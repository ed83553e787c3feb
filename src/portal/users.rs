use actix_web::{web, HttpRequest, HttpResponse};
use serde::Deserialize;
use serde_json::json;
use tracing::{info, warn};

use crate::auth::csrf;
use crate::auth::password::hash_password;
use crate::auth::session::AdminUser;
use crate::db::models::{ActualizacionUsuario, NuevoUsuario};
use crate::error::AppError;
use crate::portal::validate::is_valid_email;
use crate::portal::IdRequest;
use crate::{AppState, Result};

const ROLES: &[&str] = &["usuario", "administrador", "admin"];

#[derive(Debug, Deserialize)]
pub struct UserRequest {
    pub id: Option<i64>,
    #[serde(default)]
    pub nombre: String,
    #[serde(default)]
    pub apellido: String,
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub contrasena: String,
    pub rol: Option<String>,
    pub telefono: Option<String>,
    pub cargo: Option<String>,
    pub area: Option<String>,
    pub csrf_token: Option<String>,
}

fn optional(value: &Option<String>) -> Option<String> {
    value
        .as_deref()
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

/// Common fields: (nombre, apellido, email, rol).
fn common_fields(body: &UserRequest) -> Result<(String, String, String, String)> {
    let nombre = body.nombre.trim();
    let apellido = body.apellido.trim();
    let email = body.email.trim().to_lowercase();
    if nombre.is_empty() || apellido.is_empty() || email.is_empty() {
        return Err(AppError::validation("Nombre, apellido y correo son obligatorios"));
    }
    if !is_valid_email(&email) {
        return Err(AppError::validation("El correo electrónico no es válido"));
    }

    let rol = optional(&body.rol).unwrap_or_else(|| "usuario".to_string());
    if !ROLES.contains(&rol.as_str()) {
        return Err(AppError::validation("Rol no válido"));
    }
    Ok((nombre.to_string(), apellido.to_string(), email, rol))
}

pub async fn list_users(_admin: AdminUser, state: web::Data<AppState>) -> Result<HttpResponse> {
    let usuarios = state.users.list().await?;
    Ok(HttpResponse::Ok().json(json!({
        "success": true,
        "usuarios": usuarios
    })))
}

pub async fn create_user(
    req: HttpRequest,
    body: web::Json<UserRequest>,
    admin: AdminUser,
    state: web::Data<AppState>,
) -> Result<HttpResponse> {
    csrf::require(&admin.session, &req, body.csrf_token.as_deref(), state.csrf_lifetime())?;

    let (nombre, apellido, email, rol) = common_fields(&body)?;
    if body.contrasena.is_empty() {
        return Err(AppError::validation("La contraseña es obligatoria"));
    }
    if state.users.email_taken(&email, None).await? {
        return Err(AppError::Conflict("Ya existe un usuario con ese correo electrónico".to_string()));
    }

    let id = state
        .users
        .create(NuevoUsuario {
            nombre,
            apellido,
            email,
            contrasena_hash: hash_password(&body.contrasena)?,
            rol,
            telefono: optional(&body.telefono),
            cargo: optional(&body.cargo),
            area: optional(&body.area),
        })
        .await?;
    info!("Admin {} created user {}", admin.user.id, id);

    Ok(HttpResponse::Created().json(json!({
        "success": true,
        "id": id,
        "message": "Usuario creado correctamente"
    })))
}

pub async fn update_user(
    req: HttpRequest,
    body: web::Json<UserRequest>,
    admin: AdminUser,
    state: web::Data<AppState>,
) -> Result<HttpResponse> {
    csrf::require(&admin.session, &req, body.csrf_token.as_deref(), state.csrf_lifetime())?;

    let id = body
        .id
        .filter(|id| *id > 0)
        .ok_or_else(|| AppError::validation("ID de usuario inválido"))?;
    let (nombre, apellido, email, rol) = common_fields(&body)?;
    if state.users.email_taken(&email, Some(id)).await? {
        return Err(AppError::Conflict("El correo ya está registrado por otro usuario".to_string()));
    }

    let updated = state
        .users
        .update(ActualizacionUsuario {
            id,
            nombre,
            apellido,
            email,
            rol,
            telefono: optional(&body.telefono),
            cargo: optional(&body.cargo),
            area: optional(&body.area),
        })
        .await?;
    if !updated {
        return Err(AppError::NotFound("Usuario no encontrado".to_string()));
    }
    info!("Admin {} updated user {}", admin.user.id, id);

    Ok(HttpResponse::Ok().json(json!({
        "success": true,
        "message": "Usuario actualizado correctamente"
    })))
}

pub async fn delete_user(
    req: HttpRequest,
    body: web::Json<IdRequest>,
    admin: AdminUser,
    state: web::Data<AppState>,
) -> Result<HttpResponse> {
    csrf::require(&admin.session, &req, body.csrf_token.as_deref(), state.csrf_lifetime())?;
    let id = body.valid_id("ID de usuario inválido")?;

    if id == admin.user.id {
        warn!("Admin {} tried to delete own account", id);
        return Err(AppError::validation("No puede eliminar su propia cuenta"));
    }
    if !state.users.delete(id).await? {
        return Err(AppError::NotFound("Usuario no encontrado".to_string()));
    }
    info!("Admin {} deleted user {}", admin.user.id, id);

    Ok(HttpResponse::Ok().json(json!({
        "success": true,
        "message": "Usuario eliminado correctamente"
    })))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{admin_user, csrf_for, test_state, Mocks};
    use actix_web::http::StatusCode;
    use actix_web::test::TestRequest;
    use actix_web::ResponseError;

    fn body(admin: &AdminUser, id: Option<i64>, email: &str) -> web::Json<UserRequest> {
        web::Json(UserRequest {
            id,
            nombre: "Carla".into(),
            apellido: "Mejía".into(),
            email: email.into(),
            contrasena: "Temporal123".into(),
            rol: None,
            telefono: Some(" ".into()),
            cargo: Some("Analista".into()),
            area: None,
            csrf_token: csrf_for(&admin.session),
        })
    }

    #[actix_web::test]
    async fn test_create_user() {
        let mut mocks = Mocks::default();
        mocks.users.expect_email_taken().returning(|_, _| Ok(false));
        mocks
            .users
            .expect_create()
            .withf(|u| {
                u.email == "carla@example.com"
                    && u.rol == "usuario"
                    && u.telefono.is_none()
                    && u.contrasena_hash.starts_with("$2")
            })
            .times(1)
            .returning(|_| Ok(12));
        let state = test_state(mocks);
        let admin = admin_user();

        let body = body(&admin, None, " Carla@Example.com");
        let resp = create_user(TestRequest::default().to_http_request(), body, admin, state)
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::CREATED);
    }

    #[actix_web::test]
    async fn test_duplicate_email() {
        let mut mocks = Mocks::default();
        mocks
            .users
            .expect_email_taken()
            .withf(|email, except| email == "carla@example.com" && *except == Some(5))
            .returning(|_, _| Ok(true));
        let state = test_state(mocks);
        let admin = admin_user();

        let body = body(&admin, Some(5), "carla@example.com");
        let err = update_user(TestRequest::default().to_http_request(), body, admin, state)
            .await
            .unwrap_err();
        assert_eq!(err.status_code(), StatusCode::CONFLICT);
    }

    #[actix_web::test]
    async fn test_cannot_delete_self() {
        let mut mocks = Mocks::default();
        mocks.users.expect_delete().times(0);
        let state = test_state(mocks);
        let admin = admin_user();
        let own_id = admin.user.id;

        let body = web::Json(IdRequest { id: Some(own_id), csrf_token: csrf_for(&admin.session) });
        let err = delete_user(TestRequest::default().to_http_request(), body, admin, state)
            .await
            .unwrap_err();
        assert_eq!(err.status_code(), StatusCode::BAD_REQUEST);
    }
}
