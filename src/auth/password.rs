use tracing::error;

use crate::error::AppError;
use crate::Result;

const BCRYPT_COST: u32 = 10;
const MIN_PASSWORD_LEN: usize = 8;

/// Rule set for new passwords. Self-service changes are `Strict`; the
/// emailed reset flow only asks for `Standard`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strength {
    Standard,
    Strict,
}

pub fn hash_password(plain: &str) -> Result<String> {
    bcrypt::hash(plain, BCRYPT_COST).map_err(|e| {
        error!("Password hashing failed: {}", e);
        AppError::InternalError(format!("bcrypt: {}", e))
    })
}

/// Accepts `$2a$`, `$2b$` and `$2y$` hashes. Malformed hashes never match.
pub fn verify_password(plain: &str, hash: &str) -> bool {
    bcrypt::verify(plain, hash).unwrap_or(false)
}

pub fn validate_new_password(new: &str, confirm: &str, strength: Strength) -> Result<()> {
    if new.is_empty() || confirm.is_empty() {
        return Err(AppError::validation("Todos los campos son obligatorios"));
    }
    if new != confirm {
        return Err(AppError::validation("Las contraseñas no coinciden"));
    }
    if new.chars().count() < MIN_PASSWORD_LEN {
        return Err(AppError::validation(
            "La contraseña debe tener al menos 8 caracteres",
        ));
    }
    let has_upper = new.chars().any(|c| c.is_uppercase());
    let has_lower = new.chars().any(|c| c.is_lowercase());
    let has_digit = new.chars().any(|c| c.is_ascii_digit());
    if !(has_upper && has_lower && has_digit) {
        return Err(AppError::validation(
            "La contraseña debe contener mayúsculas, minúsculas y números",
        ));
    }
    if strength == Strength::Strict && new.chars().all(|c| c.is_alphanumeric()) {
        return Err(AppError::validation(
            "La contraseña debe contener al menos un carácter especial",
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_and_verify() {
        let hash = hash_password("Secreta#2024").unwrap();
        assert!(hash.starts_with("$2b$10$"));
        assert!(verify_password("Secreta#2024", &hash));
        assert!(!verify_password("secreta#2024", &hash));
    }

    #[test]
    fn test_verify_accepts_php_prefix() {
        let hash = hash_password("Clave123!").unwrap();
        let php_style = hash.replacen("$2b$", "$2y$", 1);
        assert!(verify_password("Clave123!", &php_style));
    }

    #[test]
    fn test_verify_rejects_garbage_hash() {
        assert!(!verify_password("anything", "not-a-hash"));
        assert!(!verify_password("anything", ""));
    }

    #[test]
    fn test_password_rules() {
        assert!(validate_new_password("", "", Strength::Standard).is_err());
        assert!(validate_new_password("Abcdef12", "Abcdef13", Strength::Standard).is_err());
        assert!(validate_new_password("Ab1", "Ab1", Strength::Standard).is_err());
        assert!(validate_new_password("abcdefg1", "abcdefg1", Strength::Standard).is_err());
        assert!(validate_new_password("Abcdefg1", "Abcdefg1", Strength::Standard).is_ok());
        assert!(validate_new_password("Abcdefg1", "Abcdefg1", Strength::Strict).is_err());
        assert!(validate_new_password("Abcdefg1!", "Abcdefg1!", Strength::Strict).is_ok());
    }
}
