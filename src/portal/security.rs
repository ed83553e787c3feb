//! Access history and second-factor settings.

use actix_web::{web, HttpRequest, HttpResponse};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{info, warn};

use crate::auth::handlers::notify_two_factor_enabled;
use crate::auth::session::{AdminUser, CurrentUser, TotpSetup};
use crate::auth::{csrf, record_access, totp};
use crate::db::repository::HistoryFilter;
use crate::error::{AppError, AuthError};
use crate::portal::validate::{parse_date, parse_id};
use crate::portal::{paging, total_pages};
use crate::{AppState, Result};

const PAGE_SIZES: &[i64] = &[10, 20, 50, 100];

/// America/Bogota, which has no daylight saving.
const UTC_OFFSET_HOURS: i64 = -5;

pub fn format_local(fecha: DateTime<Utc>) -> String {
    (fecha.naive_utc() + Duration::hours(UTC_OFFSET_HOURS))
        .format("%d/%m/%Y %H:%M:%S")
        .to_string()
}

pub fn elapsed_label(fecha: DateTime<Utc>, now: DateTime<Utc>) -> String {
    let elapsed = (now - fecha).max(Duration::zero());
    if elapsed.num_days() > 0 {
        format!("{} día(s)", elapsed.num_days())
    } else if elapsed.num_hours() > 0 {
        format!("{} hora(s)", elapsed.num_hours())
    } else if elapsed.num_minutes() > 0 {
        format!("{} minuto(s)", elapsed.num_minutes())
    } else {
        "Hace unos segundos".to_string()
    }
}

#[derive(Debug, Serialize)]
pub struct FormattedAccess<T: Serialize> {
    #[serde(flatten)]
    pub acceso: T,
    pub fecha_formateada: String,
    pub tiempo_transcurrido: String,
    pub estado: &'static str,
    pub estado_texto: &'static str,
}

impl<T: Serialize> FormattedAccess<T> {
    fn new(acceso: T, fecha: DateTime<Utc>, exito: bool, now: DateTime<Utc>) -> Self {
        Self {
            acceso,
            fecha_formateada: format_local(fecha),
            tiempo_transcurrido: elapsed_label(fecha, now),
            estado: if exito { "success" } else { "error" },
            estado_texto: if exito { "Exitoso" } else { "Fallido" },
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct HistoryQuery {
    pub pagina: Option<i64>,
    pub limite: Option<i64>,
}

pub async fn my_history(
    query: web::Query<HistoryQuery>,
    current: CurrentUser,
    state: web::Data<AppState>,
) -> Result<HttpResponse> {
    let (pagina, limite, offset) = paging(query.pagina, query.limite, 10, 100);
    let (rows, total) = state.security.user_history(current.user.id, limite, offset).await?;

    let now = Utc::now();
    let historial: Vec<_> = rows
        .into_iter()
        .map(|a| {
            let (fecha, exito) = (a.fecha_acceso, a.exito);
            FormattedAccess::new(a, fecha, exito, now)
        })
        .collect();

    Ok(HttpResponse::Ok().json(json!({
        "success": true,
        "historial": historial,
        "paginacion": {
            "total": total,
            "pagina_actual": pagina,
            "por_pagina": limite,
            "total_paginas": total_pages(total, limite)
        }
    })))
}

#[derive(Debug, Default, Deserialize)]
pub struct GlobalHistoryQuery {
    pub usuario: Option<String>,
    pub estado: Option<String>,
    pub desde: Option<String>,
    pub hasta: Option<String>,
    pub registros: Option<i64>,
    pub pagina: Option<i64>,
}

impl GlobalHistoryQuery {
    /// Unknown values are dropped rather than rejected.
    pub fn to_filter(&self) -> (HistoryFilter, i64) {
        let registros = self
            .registros
            .filter(|r| PAGE_SIZES.contains(r))
            .unwrap_or(20);
        let (pagina, limite, offset) = paging(self.pagina, Some(registros), 20, 100);

        let exito = match self.estado.as_deref() {
            Some("exitoso") => Some(true),
            Some("fallido") => Some(false),
            _ => None,
        };

        let filter = HistoryFilter {
            usuario_id: parse_id(self.usuario.as_deref()),
            exito,
            desde: self.desde.as_deref().and_then(parse_date),
            hasta: self.hasta.as_deref().and_then(parse_date),
            limite,
            offset,
        };
        (filter, pagina)
    }
}

pub async fn global_history(
    query: web::Query<GlobalHistoryQuery>,
    _admin: AdminUser,
    state: web::Data<AppState>,
) -> Result<HttpResponse> {
    let (filter, pagina) = query.to_filter();
    let limite = filter.limite;
    let (mut rows, total) = state.security.global_history(filter.clone()).await?;

    // Pages past the end show the last one.
    let paginas = total_pages(total, limite);
    let pagina = if pagina > paginas {
        let last = HistoryFilter {
            offset: (paginas - 1) * limite,
            ..filter
        };
        rows = state.security.global_history(last).await?.0;
        paginas
    } else {
        pagina
    };

    let now = Utc::now();
    let historial: Vec<_> = rows
        .into_iter()
        .map(|a| {
            let (fecha, exito) = (a.acceso.fecha_acceso, a.acceso.exito);
            FormattedAccess::new(a, fecha, exito, now)
        })
        .collect();

    Ok(HttpResponse::Ok().json(json!({
        "success": true,
        "historial": historial,
        "paginacion": {
            "total": total,
            "pagina_actual": pagina,
            "por_pagina": limite,
            "total_paginas": paginas
        }
    })))
}

#[derive(Debug, Deserialize)]
pub struct ToggleRequest {
    #[serde(default)]
    pub activar: bool,
    pub csrf_token: Option<String>,
}

pub async fn toggle_two_factor(
    req: HttpRequest,
    body: web::Json<ToggleRequest>,
    current: CurrentUser,
    state: web::Data<AppState>,
) -> Result<HttpResponse> {
    csrf::require(&current.session, &req, body.csrf_token.as_deref(), state.csrf_lifetime())?;

    if !body.activar && current.user.is_admin() {
        warn!("Admin {} tried to disable 2FA", current.user.id);
        return Err(AppError::Forbidden(
            "La verificación 2FA es obligatoria para administradores y no puede ser desactivada.".to_string(),
        ));
    }

    let usuario = state
        .users
        .find_by_id(current.user.id)
        .await?
        .ok_or(AuthError::NotAuthenticated)?;

    if !body.activar {
        state.users.set_two_factor(usuario.id, false, None).await?;
        record_access(&state, &req, usuario.id, true, "Verificación 2FA desactivada").await;
        info!("User {} disabled 2FA", usuario.id);
        return Ok(HttpResponse::Ok().json(json!({
            "success": true,
            "activo": false,
            "message": "Verificación en 2 pasos desactivada correctamente."
        })));
    }

    if !usuario.has_totp_secret() {
        let expires_at = Utc::now() + Duration::seconds(state.config.security.setup_2fa_secs);
        current.session.set_totp_setup(Some(TotpSetup {
            secret: totp::generate_secret(),
            expires_at,
        }));
        info!("User {} started authenticator enrolment", usuario.id);
        return Ok(HttpResponse::Ok().json(json!({
            "success": true,
            "setup_required": true
        })));
    }

    state.users.set_two_factor(usuario.id, true, None).await?;
    record_access(&state, &req, usuario.id, true, "Verificación 2FA activada").await;
    notify_two_factor_enabled(&state, &current.user).await;
    info!("User {} enabled 2FA", usuario.id);

    Ok(HttpResponse::Ok().json(json!({
        "success": true,
        "activo": true,
        "message": "Verificación en 2 pasos activada correctamente."
    })))
}

pub async fn mfa_overview(_admin: AdminUser, state: web::Data<AppState>) -> Result<HttpResponse> {
    let usuarios = state.users.two_factor_overview().await?;
    Ok(HttpResponse::Ok().json(json!({
        "success": true,
        "usuarios": usuarios
    })))
}

#[derive(Debug, Deserialize)]
pub struct MfaResetRequest {
    pub usuario_id: Option<i64>,
    pub csrf_token: Option<String>,
}

pub async fn reset_mfa(
    req: HttpRequest,
    body: web::Json<MfaResetRequest>,
    admin: AdminUser,
    state: web::Data<AppState>,
) -> Result<HttpResponse> {
    csrf::require(&admin.session, &req, body.csrf_token.as_deref(), state.csrf_lifetime())?;

    let usuario_id = body
        .usuario_id
        .filter(|id| *id > 0)
        .ok_or_else(|| AppError::validation("ID de usuario inválido"))?;
    let usuario = state
        .users
        .find_by_id(usuario_id)
        .await?
        .ok_or_else(|| AppError::NotFound("Usuario no encontrado".to_string()))?;

    state.users.reset_two_factor(usuario.id).await?;
    state.security.invalidate_email_codes(usuario.id).await?;
    record_access(
        &state,
        &req,
        usuario.id,
        true,
        &format!("2FA restablecido por el administrador {}", admin.user.email),
    )
    .await;
    info!("Admin {} reset 2FA for user {}", admin.user.id, usuario.id);

    Ok(HttpResponse::Ok().json(json!({
        "success": true,
        "message": format!("Se restableció la verificación en 2 pasos de {}", usuario.full_name())
    })))
}
