use actix_web::{web, HttpRequest, HttpResponse};
use serde::Deserialize;
use serde_json::json;
use tracing::info;

use crate::auth::csrf;
use crate::auth::session::AdminUser;
use crate::db::models::NuevaVacante;
use crate::error::AppError;
use crate::portal::IdRequest;
use crate::{AppState, Result};

#[derive(Debug, Deserialize)]
pub struct VacancyRequest {
    pub id: Option<i64>,
    #[serde(default)]
    pub titulo: String,
    #[serde(default)]
    pub descripcion: String,
    #[serde(default)]
    pub ciudad: String,
    pub csrf_token: Option<String>,
}

impl VacancyRequest {
    fn validated(&self) -> Result<NuevaVacante> {
        let titulo = self.titulo.trim();
        let descripcion = self.descripcion.trim();
        let ciudad = self.ciudad.trim();
        if titulo.is_empty() || descripcion.is_empty() || ciudad.is_empty() {
            return Err(AppError::validation("Todos los campos son obligatorios"));
        }
        Ok(NuevaVacante {
            titulo: titulo.to_string(),
            descripcion: descripcion.to_string(),
            ciudad: ciudad.to_string(),
        })
    }
}

pub async fn list_vacancies(state: web::Data<AppState>) -> Result<HttpResponse> {
    let vacantes = state.portal.vacancies().await?;
    Ok(HttpResponse::Ok().json(json!({
        "success": true,
        "vacantes": vacantes
    })))
}

pub async fn create_vacancy(
    req: HttpRequest,
    body: web::Json<VacancyRequest>,
    admin: AdminUser,
    state: web::Data<AppState>,
) -> Result<HttpResponse> {
    csrf::require(&admin.session, &req, body.csrf_token.as_deref(), state.csrf_lifetime())?;
    let vacancy = body.validated()?;

    let id = state.portal.create_vacancy(vacancy).await?;
    info!("Admin {} created vacancy {}", admin.user.id, id);

    Ok(HttpResponse::Created().json(json!({
        "success": true,
        "id": id,
        "message": "Vacante agregada correctamente"
    })))
}

pub async fn update_vacancy(
    req: HttpRequest,
    body: web::Json<VacancyRequest>,
    admin: AdminUser,
    state: web::Data<AppState>,
) -> Result<HttpResponse> {
    csrf::require(&admin.session, &req, body.csrf_token.as_deref(), state.csrf_lifetime())?;
    let id = body
        .id
        .filter(|id| *id > 0)
        .ok_or_else(|| AppError::validation("ID de vacante inválido"))?;
    let vacancy = body.validated()?;

    if !state.portal.update_vacancy(id, vacancy).await? {
        return Err(AppError::NotFound("La vacante no existe".to_string()));
    }
    info!("Admin {} updated vacancy {}", admin.user.id, id);

    Ok(HttpResponse::Ok().json(json!({
        "success": true,
        "message": "Vacante actualizada correctamente"
    })))
}

pub async fn delete_vacancy(
    req: HttpRequest,
    body: web::Json<IdRequest>,
    admin: AdminUser,
    state: web::Data<AppState>,
) -> Result<HttpResponse> {
    csrf::require(&admin.session, &req, body.csrf_token.as_deref(), state.csrf_lifetime())?;
    let id = body.valid_id("ID de vacante inválido")?;

    if !state.portal.delete_vacancy(id).await? {
        return Err(AppError::NotFound("La vacante no existe o ya fue eliminada".to_string()));
    }
    info!("Admin {} deleted vacancy {}", admin.user.id, id);

    Ok(HttpResponse::Ok().json(json!({
        "success": true,
        "message": "Vacante eliminada correctamente"
    })))
}
