//! Time-based one-time passwords (RFC 6238) for authenticator apps.
//!
//! Secrets are 10 random bytes encoded as 16 base32 characters. Codes are
//! six digits over a 30 second step, HMAC-SHA1.

use data_encoding::BASE32_NOPAD;
use hmac::{Hmac, Mac};
use qrcode::render::svg;
use qrcode::QrCode;
use rand::RngCore;
use sha1::Sha1;
use url::form_urlencoded;

use crate::error::AppError;
use crate::Result;

type HmacSha1 = Hmac<Sha1>;

pub const DIGITS: u32 = 6;
pub const STEP_SECS: i64 = 30;
/// Steps accepted on either side of the current one.
pub const DEFAULT_WINDOW: i64 = 2;
const SECRET_BYTES: usize = 10;
const QR_SIZE: u32 = 250;

pub fn generate_secret() -> String {
    let mut bytes = [0u8; SECRET_BYTES];
    rand::thread_rng().fill_bytes(&mut bytes);
    BASE32_NOPAD.encode(&bytes)
}

/// Accepts the grouped display form too (lowercase, spaces, padding).
pub fn decode_secret(secret: &str) -> Option<Vec<u8>> {
    let normalized: String = secret
        .chars()
        .filter(|c| !c.is_whitespace() && *c != '=')
        .map(|c| c.to_ascii_uppercase())
        .collect();
    if normalized.is_empty() {
        return None;
    }
    BASE32_NOPAD.decode(normalized.as_bytes()).ok()
}

fn hotp(key: &[u8], counter: u64, digits: u32) -> Option<String> {
    let mut mac = HmacSha1::new_from_slice(key).ok()?;
    mac.update(&counter.to_be_bytes());
    let digest = mac.finalize().into_bytes();

    let offset = (digest[digest.len() - 1] & 0x0f) as usize;
    let binary = ((u32::from(digest[offset]) & 0x7f) << 24)
        | (u32::from(digest[offset + 1]) << 16)
        | (u32::from(digest[offset + 2]) << 8)
        | u32::from(digest[offset + 3]);
    let code = binary % 10u32.pow(digits);
    Some(format!("{:0width$}", code, width = digits as usize))
}

pub fn code_at(secret: &str, unix_time: i64) -> Option<String> {
    let key = decode_secret(secret)?;
    hotp(&key, (unix_time / STEP_SECS) as u64, DIGITS)
}

pub fn verify_at(secret: &str, code: &str, unix_time: i64, window: i64) -> bool {
    if code.len() != DIGITS as usize || !code.chars().all(|c| c.is_ascii_digit()) {
        return false;
    }
    let key = match decode_secret(secret) {
        Some(key) => key,
        None => return false,
    };
    let current = unix_time / STEP_SECS;
    (-window..=window)
        .filter_map(|offset| {
            let step = current + offset;
            if step < 0 {
                None
            } else {
                hotp(&key, step as u64, DIGITS)
            }
        })
        .any(|candidate| super::tokens::constant_time_eq(candidate.as_bytes(), code.as_bytes()))
}

pub fn verify(secret: &str, code: &str) -> bool {
    verify_at(secret, code, chrono::Utc::now().timestamp(), DEFAULT_WINDOW)
}

fn encode_component(value: &str) -> String {
    form_urlencoded::byte_serialize(value.as_bytes())
        .collect::<String>()
        .replace('+', "%20")
}

pub fn provisioning_uri(issuer: &str, account: &str, secret: &str) -> String {
    let issuer = encode_component(issuer);
    format!(
        "otpauth://totp/{}:{}?secret={}&issuer={}&algorithm=SHA1&digits={}&period={}",
        issuer,
        encode_component(account),
        secret,
        issuer,
        DIGITS,
        STEP_SECS
    )
}

pub fn qr_svg(uri: &str) -> Result<String> {
    let code = QrCode::new(uri.as_bytes())
        .map_err(|e| AppError::InternalError(format!("QR generation failed: {}", e)))?;
    Ok(code
        .render::<svg::Color>()
        .min_dimensions(QR_SIZE, QR_SIZE)
        .build())
}

/// `JBSWY3DPEHPK3PXP` -> `JBSW Y3DP EHPK 3PXP`
pub fn display_secret(secret: &str) -> String {
    secret
        .chars()
        .collect::<Vec<_>>()
        .chunks(4)
        .map(|chunk| chunk.iter().collect::<String>())
        .collect::<Vec<_>>()
        .join(" ")
}
