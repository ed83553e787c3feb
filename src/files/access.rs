//! Who may see which notification or stored document.

use crate::auth::session::SessionUser;
use crate::db::models::{Destino, Notificacion};
use crate::db::NotificationRepository;
use crate::Result;

/// Folders every authenticated user may read from.
pub const SHARED_DOCUMENT_DIRS: &[&str] = &["Documentos/Postulaciones/", "Documentos/Recursos/"];

/// Admins see everything. Other users only see active notifications
/// addressed to everyone, to regular users, or to them by name.
pub fn can_view_notification(user: &SessionUser, notification: &Notificacion, is_recipient: bool) -> bool {
    if user.is_admin() {
        return true;
    }
    if !notification.is_active() {
        return false;
    }
    match notification.destino() {
        Some(Destino::Todos) | Some(Destino::Regulares) => true,
        Some(Destino::Especificos) => is_recipient,
        Some(Destino::Administradores) | None => false,
    }
}

/// Only `especificos` needs the membership lookup.
pub fn needs_membership(notification: &Notificacion) -> bool {
    notification.destino() == Some(Destino::Especificos)
}

/// `can_view_notification` with the recipient lookup done when needed.
pub async fn notification_visible(
    repo: &dyn NotificationRepository,
    user: &SessionUser,
    notification: &Notificacion,
) -> Result<bool> {
    let is_recipient = if !user.is_admin() && needs_membership(notification) {
        repo.is_recipient(notification.id, user.id).await?
    } else {
        false
    };
    Ok(can_view_notification(user, notification, is_recipient))
}

pub fn is_shared_document(relative: &str) -> bool {
    SHARED_DOCUMENT_DIRS.iter().any(|dir| relative.starts_with(dir))
}

pub fn can_access_document(user: &SessionUser, relative: &str, owns: bool) -> bool {
    user.is_admin() || is_shared_document(relative) || owns
}

pub fn file_name(relative: &str) -> &str {
    relative.rsplit(['/', '\\']).next().unwrap_or(relative)
}
