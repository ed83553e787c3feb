//! Extension and content-type allow-lists.

/// Files reachable through the generic document endpoints.
pub const DOCUMENT_EXTENSIONS: &[&str] = &["pdf", "doc", "docx", "xls", "xlsx", "png", "jpg", "jpeg"];

pub const NOTIFICATION_EXTENSIONS: &[&str] =
    &["pdf", "doc", "docx", "xls", "xlsx", "jpg", "jpeg", "png", "gif", "txt"];

pub const REPLY_EXTENSIONS: &[&str] = &[
    "pdf", "doc", "docx", "xls", "xlsx", "jpg", "jpeg", "png", "gif", "txt", "zip", "rar",
];

/// Uploads to the admin archive screen.
pub const ARCHIVE_EXTENSIONS: &[&str] = &["pdf", "doc", "docx", "xls", "xlsx"];

pub const AVATAR_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png", "gif", "webp"];

const MAX_DOWNLOAD_NAME: usize = 200;

/// Lowercased extension without the dot.
pub fn extension(name: &str) -> Option<String> {
    let file_name = name.rsplit(['/', '\\']).next().unwrap_or(name);
    match file_name.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() && !ext.is_empty() => Some(ext.to_ascii_lowercase()),
        _ => None,
    }
}

pub fn is_allowed(name: &str, allowed: &[&str]) -> bool {
    extension(name).map_or(false, |ext| allowed.contains(&ext.as_str()))
}

/// Content type used when a document is shown inline.
pub fn inline_mime(ext: &str) -> &'static str {
    match ext {
        "pdf" => "application/pdf",
        "doc" | "docx" => "application/msword",
        "xls" | "xlsx" => "application/vnd.ms-excel",
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        _ => "application/octet-stream",
    }
}

/// Content type for notification and reply attachments.
pub fn attachment_mime(ext: &str) -> &'static str {
    match ext {
        "pdf" => "application/pdf",
        "doc" => "application/msword",
        "docx" => "application/vnd.openxmlformats-officedocument.wordprocessingml.document",
        "xls" => "application/vnd.ms-excel",
        "xlsx" => "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet",
        "jpg" | "jpeg" => "image/jpeg",
        "png" => "image/png",
        "gif" => "image/gif",
        "webp" => "image/webp",
        "txt" => "text/plain",
        "zip" => "application/zip",
        "rar" => "application/x-rar-compressed",
        _ => "application/octet-stream",
    }
}

/// MIME type detected from the magic bytes, if recognised.
pub fn sniff(bytes: &[u8]) -> Option<&'static str> {
    infer::get(bytes).map(|kind| kind.mime_type())
}

/// Sniffed types accepted for a declared extension. Office formats are
/// containers (OLE or zip), so any of the container types is accepted.
fn accepted_sniffed(ext: &str) -> &'static [&'static str] {
    match ext {
        "pdf" => &["application/pdf"],
        "doc" | "xls" => &[
            "application/msword",
            "application/vnd.ms-excel",
            "application/x-ole-storage",
        ],
        "docx" | "xlsx" => &[
            "application/vnd.openxmlformats-officedocument.wordprocessingml.document",
            "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet",
            "application/zip",
        ],
        "jpg" | "jpeg" => &["image/jpeg"],
        "png" => &["image/png"],
        "gif" => &["image/gif"],
        "webp" => &["image/webp"],
        "zip" => &["application/zip"],
        "rar" => &["application/vnd.rar", "application/x-rar-compressed"],
        _ => &[],
    }
}

/// Plain text has no signature and is never sniffed. Everything else must
/// sniff to a type consistent with its extension.
pub fn mime_matches_extension(ext: &str, bytes: &[u8]) -> bool {
    if ext == "txt" {
        return true;
    }
    match sniff(bytes) {
        Some(mime) => accepted_sniffed(ext).contains(&mime),
        None => false,
    }
}

/// Archive uploads record a coarse document type.
pub fn document_kind(ext: &str) -> &'static str {
    match ext {
        "pdf" => "pdf",
        "xls" | "xlsx" => "excel",
        "doc" | "docx" => "word",
        _ => "otro",
    }
}

/// Safe `filename` for Content-Disposition: reserved characters become
/// `_` and long names are cut keeping the extension.
pub fn sanitize_download_name(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .map(|c| match c {
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' | '\0' => '_',
            c => c,
        })
        .collect();

    if cleaned.chars().count() <= MAX_DOWNLOAD_NAME {
        return cleaned;
    }

    match cleaned.rsplit_once('.') {
        Some((stem, ext)) if ext.chars().count() < 20 => {
            let keep = MAX_DOWNLOAD_NAME - ext.chars().count() - 1;
            let stem: String = stem.chars().take(keep).collect();
            format!("{}.{}", stem, ext)
        }
        _ => cleaned.chars().take(MAX_DOWNLOAD_NAME).collect(),
    }
}

/// File name reduced to `[A-Za-z0-9._-]` for storage on disk.
pub fn sanitize_stored_name(name: &str) -> String {
    let base = name.rsplit(['/', '\\']).next().unwrap_or(name);
    let cleaned: String = base
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') { c } else { '_' })
        .collect();
    let cleaned = cleaned.trim_start_matches('.').to_string();
    if cleaned.is_empty() {
        "archivo".to_string()
    } else {
        cleaned
    }
}
