//! Internal notifications
//!
//! Admins publish notifications to an audience (everyone, admins, regular
//! users or a list of users) with optional attachments; recipients read
//! them and, when allowed, reply with text and files.

pub mod form;
pub mod handlers;

pub use form::{ListQuery, NotificationFields};
