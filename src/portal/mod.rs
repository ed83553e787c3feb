//! Everything in the portal besides login and notifications: vacancies,
//! applications, documents, profile, user administration and security
//! screens.

pub mod applications;
pub mod documents;
pub mod profile;
pub mod security;
pub mod users;
pub mod vacancies;
pub mod validate;

use serde::Deserialize;

use crate::error::AppError;
use crate::Result;

/// Body of the many `.../eliminar` style endpoints.
#[derive(Debug, Deserialize)]
pub struct IdRequest {
    pub id: Option<i64>,
    pub csrf_token: Option<String>,
}

impl IdRequest {
    pub fn valid_id(&self, message: &str) -> Result<i64> {
        self.id.filter(|id| *id > 0).ok_or_else(|| AppError::validation(message))
    }
}

/// `pagina`/`limite` style paging: page clamped to at least 1, size to
/// `1..=max`.
pub fn paging(pagina: Option<i64>, limite: Option<i64>, default_limit: i64, max_limit: i64) -> (i64, i64, i64) {
    let limite = limite.unwrap_or(default_limit).clamp(1, max_limit);
    let pagina = pagina.unwrap_or(1).max(1);
    (pagina, limite, (pagina - 1).saturating_mul(limite))
}

pub fn total_pages(total: i64, limite: i64) -> i64 {
    if total <= 0 {
        1
    } else {
        total / limite + i64::from(total % limite != 0)
    }
}
