//! Database module for the HR portal
//!
//! Models, repository traits and the Postgres implementation.

pub mod models;
pub mod operations;
pub mod repository;

pub use models::{Notificacion, Usuario};
pub use operations::DbOperations;
pub use repository::{
    HistoryFilter, NotificationFilter, NotificationRepository, PortalRepository, SecurityRepository,
    UserRepository, Viewer,
};

/// Escapes `%`, `_` and `\` so user input matches literally inside `LIKE`.
pub fn escape_like(input: &str) -> String {
    let mut escaped = String::with_capacity(input.len());
    for c in input.chars() {
        if matches!(c, '%' | '_' | '\\') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}
