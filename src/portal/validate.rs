//! Input checks shared by the portal and notification forms.

use chrono::{Datelike, NaiveDate};
use lazy_static::lazy_static;
use regex::Regex;

use crate::error::AppError;
use crate::Result;

lazy_static! {
    static ref EMAIL: Regex =
        Regex::new(r"^[A-Za-z0-9._%+\-]+@[A-Za-z0-9](?:[A-Za-z0-9\-]*[A-Za-z0-9])?(?:\.[A-Za-z0-9](?:[A-Za-z0-9\-]*[A-Za-z0-9])?)+$").unwrap();
    static ref PHONE: Regex = Regex::new(r"^[0-9+\-\s()]{7,15}$").unwrap();
    static ref PERSON_NAME: Regex = Regex::new(r"^[A-Za-zÁÉÍÓÚáéíóúÑñÜü\s'\-]+$").unwrap();
    static ref DIGITS: Regex = Regex::new(r"^[0-9]+$").unwrap();
    static ref ALPHANUMERIC: Regex = Regex::new(r"^[A-Za-z0-9]+$").unwrap();
}

pub const MAX_EMAIL_LEN: usize = 255;

pub fn is_valid_email(email: &str) -> bool {
    email.len() <= MAX_EMAIL_LEN && EMAIL.is_match(email)
}

pub fn is_valid_phone(phone: &str) -> bool {
    PHONE.is_match(phone)
}

/// `YYYY-MM-DD` only.
pub fn parse_date(value: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(value.trim(), "%Y-%m-%d").ok()
}

/// Positive integer id from a query or form value.
pub fn parse_id(value: Option<&str>) -> Option<i64> {
    value
        .and_then(|v| v.trim().parse::<i64>().ok())
        .filter(|id| *id > 0)
}

pub fn required<'a>(value: Option<&'a str>, message: &str) -> Result<&'a str> {
    value
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .ok_or_else(|| AppError::validation(message))
}

pub fn char_len_between(value: &str, min: usize, max: usize) -> bool {
    let len = value.chars().count();
    len >= min && len <= max
}

/// Whole years between `birth` and `today`.
pub fn age_on(birth: NaiveDate, today: NaiveDate) -> i32 {
    let mut age = today.year() - birth.year();
    if (today.month(), today.day()) < (birth.month(), birth.day()) {
        age -= 1;
    }
    age
}

struct DocumentRule {
    min: usize,
    max: usize,
    digits_only: bool,
    label: &'static str,
}

fn document_rule(tipo: &str) -> Option<DocumentRule> {
    let rule = match tipo {
        "CC" => DocumentRule { min: 6, max: 10, digits_only: true, label: "Cédula de ciudadanía" },
        "CE" => DocumentRule { min: 6, max: 12, digits_only: false, label: "Cédula de extranjería" },
        "TI" => DocumentRule { min: 10, max: 11, digits_only: true, label: "Tarjeta de identidad" },
        "Pasaporte" => DocumentRule { min: 5, max: 15, digits_only: false, label: "Pasaporte" },
        _ => return None,
    };
    Some(rule)
}

/// Identity document number for the given type (CC, CE, TI, Pasaporte).
pub fn validate_document_number(tipo: &str, numero: &str) -> Result<()> {
    let rule = document_rule(tipo).ok_or_else(|| AppError::validation("Tipo de documento no válido."))?;

    if !char_len_between(numero, rule.min, rule.max) {
        return Err(AppError::validation(format!(
            "El {} debe tener entre {} y {} caracteres.",
            rule.label, rule.min, rule.max
        )));
    }
    if rule.digits_only && !DIGITS.is_match(numero) {
        return Err(AppError::validation(format!(
            "El {} solo puede contener números.",
            rule.label
        )));
    }
    if !rule.digits_only && !ALPHANUMERIC.is_match(numero) {
        return Err(AppError::validation(format!(
            "El {} solo puede contener letras y números.",
            rule.label
        )));
    }
    Ok(())
}

pub fn validate_person_name(nombre: &str) -> Result<()> {
    if !PERSON_NAME.is_match(nombre) {
        return Err(AppError::validation("El nombre contiene caracteres no permitidos."));
    }
    if !char_len_between(nombre, 3, 255) {
        return Err(AppError::validation("El nombre debe tener entre 3 y 255 caracteres."));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_email() {
        assert!(is_valid_email("ana.perez@empresa.com.co"));
        assert!(!is_valid_email("ana@"));
        assert!(!is_valid_email("sin-arroba.com"));
        assert!(!is_valid_email(&format!("{}@x.com", "a".repeat(260))));
    }

    #[test]
    fn test_phone_and_dates() {
        assert!(is_valid_phone("+57 (300) 123-4567"));
        assert!(!is_valid_phone("12345"));
        assert!(!is_valid_phone("300abc4567"));
        assert_eq!(parse_date("2024-02-29"), NaiveDate::from_ymd_opt(2024, 2, 29));
        assert_eq!(parse_date("29/02/2024"), None);
        assert_eq!(parse_id(Some(" 12 ")), Some(12));
        assert_eq!(parse_id(Some("-1")), None);
        assert_eq!(parse_id(None), None);
    }

    #[test]
    fn test_age() {
        let birth = NaiveDate::from_ymd_opt(2000, 6, 15).unwrap();
        assert_eq!(age_on(birth, NaiveDate::from_ymd_opt(2016, 6, 14).unwrap()), 15);
        assert_eq!(age_on(birth, NaiveDate::from_ymd_opt(2016, 6, 15).unwrap()), 16);
    }

    #[test]
    fn test_document_numbers() {
        assert!(validate_document_number("CC", "1020304050").is_ok());
        assert!(validate_document_number("CC", "12345").is_err());
        assert!(validate_document_number("CC", "12A456").is_err());
        assert!(validate_document_number("CE", "AB12345").is_ok());
        assert!(validate_document_number("TI", "123456789").is_err());
        assert!(validate_document_number("Pasaporte", "PA12345").is_ok());
        assert!(validate_document_number("NIT", "900123456").is_err());

        let err = validate_document_number("CC", "12A456").unwrap_err();
        assert_eq!(err.public_message(), "El Cédula de ciudadanía solo puede contener números.");
    }

    #[test]
    fn test_person_name() {
        assert!(validate_person_name("JOSÉ O'NEIL PEÑA-RÍOS").is_ok());
        assert!(validate_person_name("AB").is_err());
        assert!(validate_person_name("ROBERT'); DROP").is_err());
    }
}
