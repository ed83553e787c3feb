//! Multipart intake and on-disk layout under the storage root.

use actix_multipart::Multipart;
use chrono::Utc;
use futures::StreamExt;
use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::Path;
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

use crate::auth::tokens::random_hex;
use crate::config::StorageConfig;
use crate::error::FileError;
use crate::files::guard;
use crate::files::policy;
use crate::Result;

pub const NOTIFICATIONS_DIR: &str = "Documentos/Notificaciones";
pub const REPLIES_DIR: &str = "Documentos/Respuestas";
pub const APPLICATIONS_DIR: &str = "Documentos/Postulaciones";
pub const AVATARS_DIR: &str = "Img/Avatars";

/// Text fields never need more than this.
const MAX_FIELD_BYTES: usize = 64 * 1024;
/// Parts that are not files, including empty file inputs.
const MAX_FIELDS: usize = 32;

#[derive(Debug, Clone)]
pub struct UploadedFile {
    pub field: String,
    pub file_name: String,
    pub bytes: Vec<u8>,
}

impl UploadedFile {
    pub fn extension(&self) -> Option<String> {
        policy::extension(&self.file_name)
    }

    pub fn size(&self) -> u64 {
        self.bytes.len() as u64
    }
}

/// Caps applied while a multipart body is being read.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct UploadLimits {
    pub max_file_bytes: u64,
    pub max_files: usize,
    pub max_total_bytes: u64,
    pub max_fields: usize,
}

impl UploadLimits {
    pub fn new(storage: &StorageConfig, max_file_bytes: u64, max_files: usize) -> Self {
        Self {
            max_file_bytes,
            max_files,
            max_total_bytes: storage.max_request_bytes,
            max_fields: MAX_FIELDS,
        }
    }
}

/// A fully buffered multipart form.
#[derive(Debug, Default)]
pub struct MultipartForm {
    fields: HashMap<String, String>,
    files: Vec<UploadedFile>,
}

fn too_large(max_bytes: u64) -> FileError {
    FileError::TooLarge {
        max_mb: max_bytes / (1024 * 1024),
    }
}

impl MultipartForm {
    /// Reads the whole payload, stopping at the first part that breaks
    /// one of `limits`. Empty file inputs are skipped.
    pub async fn read(mut payload: Multipart, limits: UploadLimits) -> Result<Self> {
        let mut form = MultipartForm::default();
        let mut file_count = 0usize;
        let mut field_count = 0usize;
        let mut total = 0u64;

        while let Some(item) = payload.next().await {
            let mut field = item?;
            let disposition = field.content_disposition();
            let name = disposition.get_name().unwrap_or_default().to_string();
            let file_name = disposition
                .get_filename()
                .map(str::to_string)
                .filter(|file_name| !file_name.is_empty());
            let is_file_input = disposition.get_filename().is_some();

            if file_name.is_some() {
                file_count += 1;
                if file_count > limits.max_files {
                    warn!("Multipart body exceeds {} files", limits.max_files);
                    return Err(FileError::TooManyFiles { max: limits.max_files }.into());
                }
            } else {
                field_count += 1;
                if field_count > limits.max_fields {
                    warn!("Multipart body exceeds {} fields", limits.max_fields);
                    return Err(FileError::TooManyFields.into());
                }
            }

            let limit = if is_file_input {
                limits.max_file_bytes
            } else {
                MAX_FIELD_BYTES as u64
            };
            let mut bytes = Vec::new();
            while let Some(chunk) = field.next().await {
                let chunk = chunk?;
                let chunk_len = chunk.len() as u64;
                if bytes.len() as u64 + chunk_len > limit {
                    return Err(too_large(limits.max_file_bytes).into());
                }
                total += chunk_len;
                if total > limits.max_total_bytes {
                    return Err(FileError::RequestTooLarge {
                        max_mb: limits.max_total_bytes / (1024 * 1024),
                    }
                    .into());
                }
                bytes.extend_from_slice(&chunk);
            }

            match file_name {
                Some(file_name) if !bytes.is_empty() => {
                    form.files.push(UploadedFile {
                        field: name,
                        file_name,
                        bytes,
                    });
                }
                _ if is_file_input => {}
                _ => {
                    form.fields
                        .insert(name, String::from_utf8_lossy(&bytes).into_owned());
                }
            }
        }

        debug!(
            "Multipart form read: {} fields, {} files",
            form.fields.len(),
            form.files.len()
        );
        Ok(form)
    }

    pub fn from_parts(fields: HashMap<String, String>, files: Vec<UploadedFile>) -> Self {
        Self { fields, files }
    }

    /// Trimmed value of a text field; blank counts as absent.
    pub fn text(&self, name: &str) -> Option<&str> {
        self.fields
            .get(name)
            .map(|value| value.trim())
            .filter(|value| !value.is_empty())
    }

    pub fn raw_text(&self, name: &str) -> Option<&str> {
        self.fields.get(name).map(String::as_str)
    }

    pub fn flag(&self, name: &str) -> bool {
        matches!(self.text(name), Some("1") | Some("true") | Some("on") | Some("si"))
    }

    pub fn file(&self, name: &str) -> Option<&UploadedFile> {
        self.files.iter().find(|file| file.field == name)
    }

    /// Files sent under `name` or `name[]`.
    pub fn files(&self, name: &str) -> Vec<&UploadedFile> {
        let array_name = format!("{}[]", name);
        self.files
            .iter()
            .filter(|file| file.field == name || file.field == array_name)
            .collect()
    }
}

/// Writes `bytes` to `root/dir/name`, creating directories. Returns the
/// path relative to the root.
pub async fn store(root: &Path, dir: &str, name: &str, bytes: &[u8]) -> Result<String> {
    let dir = dir.trim_matches('/');
    let target_dir = root.join(dir);
    tokio::fs::create_dir_all(&target_dir).await?;
    tokio::fs::write(target_dir.join(name), bytes).await?;
    Ok(format!("{}/{}", dir, name))
}

/// Copies a stored file to `dir/new_name`. Returns the new relative path.
pub async fn copy(root: &Path, relative: &str, dir: &str, new_name: &str) -> Result<String> {
    let source = guard::resolve_legacy(root, relative, dir, "")?;
    let dir = dir.trim_matches('/');
    tokio::fs::create_dir_all(root.join(dir)).await?;
    tokio::fs::copy(&source, root.join(dir).join(new_name)).await?;
    Ok(format!("{}/{}", dir, new_name))
}

/// Best-effort unlink. Failures are logged, never returned.
pub async fn remove(root: &Path, relative: &str, base_url: &str) {
    let relative = guard::strip_base_url(relative, base_url).trim_start_matches("../");
    match guard::resolve_within(root, relative) {
        Ok(path) => {
            if let Err(e) = tokio::fs::remove_file(&path).await {
                warn!("Could not delete {}: {}", relative, e);
            }
        }
        Err(FileError::NotFound) => debug!("File already gone: {}", relative),
        Err(e) => warn!("Refusing to delete {}: {}", relative, e),
    }
}

/// `{unix_ts}_{uniq}_{sanitized original}`
pub fn notification_file_name(original: &str) -> String {
    format!(
        "{}_{}_{}",
        Utc::now().timestamp(),
        random_hex(6),
        policy::sanitize_stored_name(original)
    )
}

/// `{YmdHis}_{usuario}_{16 hex}.{ext}`
pub fn reply_file_name(usuario_id: i64, ext: &str) -> String {
    format!(
        "{}_{}_{}.{}",
        Utc::now().format("%Y%m%d%H%M%S"),
        usuario_id,
        random_hex(8),
        ext
    )
}

/// `{usuario}_{tipo}_{uniq}.pdf`
pub fn user_document_name(usuario_id: i64, tipo: &str) -> String {
    format!("{}_{}_{}.pdf", usuario_id, tipo, random_hex(7))
}

/// Folds accented Spanish letters to ASCII and keeps only letters.
fn ascii_letters(input: &str) -> String {
    input
        .chars()
        .filter_map(|c| {
            let folded = match c {
                'Á' | 'À' | 'Ä' | 'Â' => 'A',
                'É' | 'È' | 'Ë' | 'Ê' => 'E',
                'Í' | 'Ì' | 'Ï' | 'Î' => 'I',
                'Ó' | 'Ò' | 'Ö' | 'Ô' => 'O',
                'Ú' | 'Ù' | 'Ü' | 'Û' => 'U',
                'Ñ' => 'N',
                'á' | 'à' | 'ä' | 'â' => 'a',
                'é' | 'è' | 'ë' | 'ê' => 'e',
                'í' | 'ì' | 'ï' | 'î' => 'i',
                'ó' | 'ò' | 'ö' | 'ô' => 'o',
                'ú' | 'ù' | 'ü' | 'û' => 'u',
                'ñ' => 'n',
                c => c,
            };
            folded.is_ascii_alphabetic().then_some(folded)
        })
        .collect()
}

fn application_stem(nombre: &str) -> String {
    nombre
        .split_whitespace()
        .next()
        .map(ascii_letters)
        .filter(|name| !name.is_empty())
        .unwrap_or_else(|| "Postulante".to_string())
}

/// Stores a CV as `HV-{FirstName}.pdf`, then `HV-{FirstName}_1.pdf`,
/// `_2`... The name is claimed with `create_new`, so concurrent
/// applicants never share a file. Returns the path relative to the root.
pub async fn store_application(root: &Path, nombre: &str, bytes: &[u8]) -> Result<String> {
    let stem = application_stem(nombre);
    let dir = root.join(APPLICATIONS_DIR);
    tokio::fs::create_dir_all(&dir).await?;

    let mut n = 0u32;
    loop {
        let candidate = match n {
            0 => format!("HV-{}.pdf", stem),
            n => format!("HV-{}_{}.pdf", stem, n),
        };
        let path = dir.join(&candidate);
        match OpenOptions::new().write(true).create_new(true).open(&path).await {
            Ok(mut file) => {
                let written = async {
                    file.write_all(bytes).await?;
                    file.flush().await
                }
                .await;
                if let Err(e) = written {
                    let _ = tokio::fs::remove_file(&path).await;
                    return Err(e.into());
                }
                return Ok(format!("{}/{}", APPLICATIONS_DIR, candidate));
            }
            Err(e) if e.kind() == ErrorKind::AlreadyExists => n += 1,
            Err(e) => return Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::AppError;
    use crate::test_support::{multipart, Part};

    fn limits(max_files: usize) -> UploadLimits {
        UploadLimits {
            max_file_bytes: 16,
            max_files,
            max_total_bytes: 40,
            max_fields: 3,
        }
    }

    #[actix_web::test]
    async fn test_read_raw_body() {
        let payload = multipart(&[
            Part::Text("csrf_token", "abc"),
            Part::Text("nombre", " Aviso "),
            Part::File("archivos[]", "a.pdf", b"%PDF-1.4"),
            Part::File("archivos[]", "", b""),
        ]);
        let form = MultipartForm::read(payload, limits(2)).await.unwrap();

        assert_eq!(form.raw_text("csrf_token"), Some("abc"));
        assert_eq!(form.text("nombre"), Some("Aviso"));
        let files = form.files("archivos");
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].file_name, "a.pdf");
        assert_eq!(files[0].bytes, b"%PDF-1.4");
    }

    #[actix_web::test]
    async fn test_read_stops_at_file_cap() {
        let payload = multipart(&[
            Part::File("archivos[]", "a.txt", b"1"),
            Part::File("archivos[]", "b.txt", b"2"),
            Part::File("archivos[]", "c.txt", b"3"),
        ]);
        let err = MultipartForm::read(payload, limits(2)).await.unwrap_err();
        assert!(matches!(err, AppError::FileError(FileError::TooManyFiles { max: 2 })));
    }

    #[actix_web::test]
    async fn test_read_stops_at_field_cap() {
        let payload = multipart(&[
            Part::Text("a", "1"),
            Part::Text("b", "2"),
            Part::Text("c", "3"),
            Part::Text("d", "4"),
        ]);
        let err = MultipartForm::read(payload, limits(2)).await.unwrap_err();
        assert!(matches!(err, AppError::FileError(FileError::TooManyFields)));
    }

    #[actix_web::test]
    async fn test_read_enforces_file_and_total_budgets() {
        let payload = multipart(&[Part::File("cv", "cv.pdf", &[b'x'; 17])]);
        let err = MultipartForm::read(payload, limits(1)).await.unwrap_err();
        assert!(matches!(err, AppError::FileError(FileError::TooLarge { .. })));

        let payload = multipart(&[
            Part::File("archivos[]", "a.txt", &[b'a'; 16]),
            Part::File("archivos[]", "b.txt", &[b'b'; 16]),
            Part::File("archivos[]", "c.txt", &[b'c'; 16]),
        ]);
        let err = MultipartForm::read(payload, limits(5)).await.unwrap_err();
        assert!(matches!(err, AppError::FileError(FileError::RequestTooLarge { .. })));
    }

    #[tokio::test]
    async fn test_store_copy_remove() {
        let root = tempfile::tempdir().unwrap();

        let stored = store(root.path(), NOTIFICATIONS_DIR, "a.txt", b"hola").await.unwrap();
        assert_eq!(stored, "Documentos/Notificaciones/a.txt");
        assert!(root.path().join(&stored).is_file());

        let copied = copy(root.path(), &format!("../{}", stored), NOTIFICATIONS_DIR, "b.txt")
            .await
            .unwrap();
        assert_eq!(tokio::fs::read(root.path().join(&copied)).await.unwrap(), b"hola");

        remove(root.path(), &format!("/gh/{}", stored), "/gh/").await;
        assert!(!root.path().join(&stored).exists());

        // Missing files and traversal attempts are ignored.
        remove(root.path(), &stored, "/gh/").await;
        remove(root.path(), "../../etc/passwd", "/gh/").await;
    }

    #[tokio::test]
    async fn test_application_names_avoid_collisions() {
        let root = tempfile::tempdir().unwrap();
        let first = store_application(root.path(), "JOSÉ PÉREZ", b"%PDF-a").await.unwrap();
        assert_eq!(first, "Documentos/Postulaciones/HV-JOSE.pdf");

        let second = store_application(root.path(), "JOSÉ LÓPEZ", b"%PDF-b").await.unwrap();
        assert_eq!(second, "Documentos/Postulaciones/HV-JOSE_1.pdf");
        assert_eq!(tokio::fs::read(root.path().join(&first)).await.unwrap(), b"%PDF-a");

        let third = store_application(root.path(), "JOSÉ LÓPEZ", b"%PDF-c").await.unwrap();
        assert_eq!(third, "Documentos/Postulaciones/HV-JOSE_2.pdf");

        let blank = store_application(root.path(), "   ", b"%PDF").await.unwrap();
        assert_eq!(blank, "Documentos/Postulaciones/HV-Postulante.pdf");
    }

    #[tokio::test]
    async fn test_concurrent_applications_get_distinct_files() {
        let root = tempfile::tempdir().unwrap();
        let contents: Vec<Vec<u8>> = (0..8).map(|i| format!("%PDF-{}", i).into_bytes()).collect();

        let stored = futures::future::join_all(
            contents.iter().map(|bytes| store_application(root.path(), "Ana María", bytes)),
        )
        .await;

        let mut names: Vec<String> = stored.into_iter().map(|r| r.unwrap()).collect();
        for (name, bytes) in names.iter().zip(&contents) {
            assert_eq!(&tokio::fs::read(root.path().join(name)).await.unwrap(), bytes);
        }
        names.sort();
        names.dedup();
        assert_eq!(names.len(), 8);
    }

    #[test]
    fn test_generated_names() {
        let name = notification_file_name("Informe final.pdf");
        assert!(name.ends_with("_Informe_final.pdf"));

        let reply = reply_file_name(9, "zip");
        let parts: Vec<&str> = reply.trim_end_matches(".zip").split('_').collect();
        assert_eq!(parts.len(), 3);
        assert_eq!(parts[0].len(), 14);
        assert_eq!(parts[1], "9");
        assert_eq!(parts[2].len(), 16);

        let doc = user_document_name(4, "hoja_vida");
        assert!(doc.starts_with("4_hoja_vida_") && doc.ends_with(".pdf"));
    }

    #[test]
    fn test_form_accessors() {
        let mut fields = HashMap::new();
        fields.insert("nombre".to_string(), "  Aviso ".to_string());
        fields.insert("vacio".to_string(), "   ".to_string());
        fields.insert("permitir_respuesta".to_string(), "1".to_string());
        let files = vec![
            UploadedFile { field: "archivos[]".into(), file_name: "a.pdf".into(), bytes: vec![1] },
            UploadedFile { field: "archivos[]".into(), file_name: "b.pdf".into(), bytes: vec![2] },
            UploadedFile { field: "avatar".into(), file_name: "yo.png".into(), bytes: vec![3] },
        ];
        let form = MultipartForm::from_parts(fields, files);

        assert_eq!(form.text("nombre"), Some("Aviso"));
        assert_eq!(form.text("vacio"), None);
        assert!(form.flag("permitir_respuesta"));
        assert!(!form.flag("otro"));
        assert_eq!(form.files("archivos").len(), 2);
        assert_eq!(form.file("avatar").unwrap().extension().as_deref(), Some("png"));
    }
}
