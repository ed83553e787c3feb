//! Outgoing email: 2FA codes, reset links and account notices.

use async_trait::async_trait;
use lettre::message::{header::ContentType, Mailbox};
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use std::sync::Arc;
use tracing::{error, info};

use crate::config::SmtpConfig;
use crate::error::AppError;
use crate::Result;

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Mailer: Send + Sync {
    async fn send(&self, to: &str, subject: &str, html: &str) -> Result<()>;
}

pub struct SmtpMailer {
    transport: AsyncSmtpTransport<Tokio1Executor>,
    from: Mailbox,
}

impl SmtpMailer {
    pub fn new(config: &SmtpConfig) -> Result<Self> {
        let from: Mailbox = format!("{} <{}>", config.from_name, config.from_email)
            .parse()
            .map_err(|e| AppError::ConfigError(format!("Invalid from address: {}", e)))?;

        let transport = AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&config.host)
            .map_err(|e| AppError::ConfigError(format!("Invalid SMTP relay: {}", e)))?
            .port(config.port)
            .credentials(Credentials::new(config.username.clone(), config.password.clone()))
            .build();

        Ok(Self { transport, from })
    }
}

#[async_trait]
impl Mailer for SmtpMailer {
    async fn send(&self, to: &str, subject: &str, html: &str) -> Result<()> {
        let to: Mailbox = to
            .parse()
            .map_err(|e| AppError::MailError(format!("Invalid recipient address: {}", e)))?;

        let message = Message::builder()
            .from(self.from.clone())
            .to(to)
            .subject(subject)
            .header(ContentType::TEXT_HTML)
            .body(html.to_string())?;

        match tokio::time::timeout(std::time::Duration::from_secs(30), self.transport.send(message)).await {
            Ok(Ok(_)) => {
                info!("Email sent: {}", subject);
                Ok(())
            }
            Ok(Err(e)) => {
                error!("SMTP error: {}", e);
                Err(e.into())
            }
            Err(_) => Err(AppError::MailError("SMTP timeout".to_string())),
        }
    }
}

/// Used when SMTP is disabled: the message is only logged.
pub struct NoopMailer;

#[async_trait]
impl Mailer for NoopMailer {
    async fn send(&self, to: &str, subject: &str, _html: &str) -> Result<()> {
        info!("SMTP disabled, not sending '{}' to {}", subject, to);
        Ok(())
    }
}

pub fn from_settings(config: &SmtpConfig) -> Result<Arc<dyn Mailer>> {
    if config.enabled {
        Ok(Arc::new(SmtpMailer::new(config)?))
    } else {
        Ok(Arc::new(NoopMailer))
    }
}

fn layout(title: &str, content: &str) -> String {
    format!(
        "<!DOCTYPE html><html><head><meta charset=\"utf-8\"></head>\
         <body style=\"font-family: Arial, sans-serif; color: #333;\">\
         <div style=\"max-width: 600px; margin: 0 auto; padding: 20px;\">\
         <h2 style=\"color: #0d6efd;\">{}</h2>{}\
         <hr><p style=\"font-size: 12px; color: #888;\">Portal de Gestión Humana. \
         Este es un mensaje automático, por favor no responda.</p>\
         </div></body></html>",
        title, content
    )
}

pub fn two_factor_code(nombre: &str, code: &str, minutes: i64) -> (String, String) {
    let subject = "Código de verificación - Portal Gestión Humana".to_string();
    let body = layout(
        "Código de verificación",
        &format!(
            "<p>Hola {},</p><p>Su código de verificación es:</p>\
             <p style=\"font-size: 28px; letter-spacing: 6px; font-weight: bold;\">{}</p>\
             <p>El código expira en {} minutos. Si usted no intentó iniciar sesión, \
             cambie su contraseña.</p>",
            escape_html(nombre),
            code,
            minutes
        ),
    );
    (subject, body)
}

pub fn password_reset(nombre: &str, link: &str) -> (String, String) {
    let subject = "Recuperación de contraseña - Portal Gestión Humana".to_string();
    let body = layout(
        "Recuperación de contraseña",
        &format!(
            "<p>Hola {},</p><p>Recibimos una solicitud para restablecer su contraseña.</p>\
             <p><a href=\"{}\">Restablecer contraseña</a></p>\
             <p>El enlace es válido durante 1 hora. Si usted no lo solicitó, ignore este mensaje.</p>",
            escape_html(nombre),
            escape_html(link)
        ),
    );
    (subject, body)
}

pub fn two_factor_enabled(nombre: &str) -> (String, String) {
    let subject = "Verificación en dos pasos activada - Portal Gestión Humana".to_string();
    let body = layout(
        "Verificación en dos pasos activada",
        &format!(
            "<p>Hola {},</p><p>La verificación en dos pasos fue activada en su cuenta. \
             A partir de ahora se le pedirá un código adicional al iniciar sesión.</p>",
            escape_html(nombre)
        ),
    );
    (subject, body)
}

pub fn escape_html(input: &str) -> String {
    input
        .replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
        .replace('\'', "&#39;")
}
