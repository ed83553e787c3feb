//! Stored files: upload intake, path containment, access rules and the
//! download endpoints.

pub mod access;
pub mod guard;
pub mod handlers;
pub mod policy;
pub mod storage;

pub use storage::{MultipartForm, UploadedFile};
