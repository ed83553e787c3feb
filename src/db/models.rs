use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use sqlx::types::Json;
use sqlx::FromRow;

/// Roles stored as `admin` or `administrador` both grant the admin panel.
pub fn is_admin_role(rol: &str) -> bool {
    matches!(rol, "admin" | "administrador")
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Usuario {
    pub id: i64,
    pub nombre: String,
    pub apellido: String,
    pub email: String,
    #[serde(skip_serializing)]
    pub contrasena: String,
    pub rol: String,
    pub telefono: Option<String>,
    pub direccion: Option<String>,
    pub fecha_nacimiento: Option<NaiveDate>,
    pub estado_civil: Option<String>,
    pub emergencia_contacto: Option<String>,
    pub emergencia_telefono: Option<String>,
    pub acerca_de_mi: Option<String>,
    pub avatar: Option<String>,
    pub cargo: Option<String>,
    pub area: Option<String>,
    pub tiene_2fa: bool,
    #[serde(skip_serializing)]
    pub secreto_2fa: Option<String>,
    pub fecha_registro: DateTime<Utc>,
}

impl Usuario {
    pub fn is_admin(&self) -> bool {
        is_admin_role(&self.rol)
    }

    pub fn full_name(&self) -> String {
        format!("{} {}", self.nombre, self.apellido)
    }

    pub fn has_totp_secret(&self) -> bool {
        self.secreto_2fa.as_deref().map_or(false, |s| !s.is_empty())
    }
}

#[derive(Debug, Clone)]
pub struct NuevoUsuario {
    pub nombre: String,
    pub apellido: String,
    pub email: String,
    pub contrasena_hash: String,
    pub rol: String,
    pub telefono: Option<String>,
    pub cargo: Option<String>,
    pub area: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ActualizacionUsuario {
    pub id: i64,
    pub nombre: String,
    pub apellido: String,
    pub email: String,
    pub rol: String,
    pub telefono: Option<String>,
    pub cargo: Option<String>,
    pub area: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct ActualizacionPerfil {
    pub nombre: String,
    pub apellido: String,
    pub telefono: Option<String>,
    pub direccion: Option<String>,
    pub fecha_nacimiento: Option<NaiveDate>,
    pub estado_civil: Option<String>,
    pub emergencia_contacto: Option<String>,
    pub emergencia_telefono: Option<String>,
    pub acerca_de_mi: Option<String>,
    /// Only replaces the stored avatar when set.
    pub avatar: Option<String>,
}

/// Row for the admin MFA screen.
#[derive(Debug, Clone, Serialize, FromRow)]
pub struct EstadoDosFactores {
    pub id: i64,
    pub nombre: String,
    pub apellido: String,
    pub email: String,
    pub rol: String,
    pub tiene_2fa: bool,
    pub configurado: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Vacante {
    pub id: i64,
    pub titulo: String,
    pub descripcion: String,
    pub ciudad: String,
    pub fecha_publicacion: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NuevaVacante {
    pub titulo: String,
    pub descripcion: String,
    pub ciudad: String,
}

#[derive(Debug, Clone, Serialize, FromRow)]
pub struct Postulacion {
    pub id: i64,
    pub vacante_id: i64,
    pub vacante_titulo: Option<String>,
    pub tipo_documento: String,
    pub documento: String,
    pub nombre: String,
    pub correo: String,
    pub telefono: Option<String>,
    pub hoja_vida: String,
    pub fecha_postulacion: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NuevaPostulacion {
    pub vacante_id: i64,
    pub tipo_documento: String,
    pub documento: String,
    pub nombre: String,
    pub correo: String,
    pub telefono: Option<String>,
    pub hoja_vida: String,
}

/// Files uploaded from the admin "Archivos" screen.
#[derive(Debug, Clone, Serialize, FromRow)]
pub struct Documento {
    pub id: i64,
    pub nombre: String,
    pub ruta: String,
    pub tipo_documento: String,
    pub tipo_seccion: String,
    pub subido_por: Option<i64>,
    pub fecha_subida: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NuevoDocumento {
    pub nombre: String,
    pub ruta: String,
    pub tipo_documento: String,
    pub tipo_seccion: TipoSeccion,
    pub subido_por: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TipoSeccion {
    Archivo,
    Recursos,
}

impl TipoSeccion {
    pub fn as_str(&self) -> &'static str {
        match self {
            TipoSeccion::Archivo => "archivo",
            TipoSeccion::Recursos => "recursos",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "archivo" => Some(TipoSeccion::Archivo),
            "recursos" => Some(TipoSeccion::Recursos),
            _ => None,
        }
    }

    pub fn directory(&self) -> &'static str {
        match self {
            TipoSeccion::Archivo => "Documentos/Procesados",
            TipoSeccion::Recursos => "Documentos/Recursos",
        }
    }
}

#[derive(Debug, Clone, Serialize, FromRow)]
pub struct DocumentoUsuario {
    pub id: i64,
    pub usuario_id: i64,
    pub tipo_documento: String,
    pub nombre_archivo: String,
    pub ruta_archivo: String,
    pub fecha_subida: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NuevoDocumentoUsuario {
    pub usuario_id: i64,
    pub tipo_documento: String,
    pub nombre_archivo: String,
    pub ruta_archivo: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TipoDocumentoUsuario {
    HojaVida,
    Certificado,
    Certificacion,
    ExperienciaLaboral,
    Otros,
}

impl TipoDocumentoUsuario {
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "hoja_vida" => Some(Self::HojaVida),
            "certificado" => Some(Self::Certificado),
            "certificacion" => Some(Self::Certificacion),
            "experiencia_laboral" => Some(Self::ExperienciaLaboral),
            "otros" => Some(Self::Otros),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::HojaVida => "hoja_vida",
            Self::Certificado => "certificado",
            Self::Certificacion => "certificacion",
            Self::ExperienciaLaboral => "experiencia_laboral",
            Self::Otros => "otros",
        }
    }

    pub fn folder(&self) -> &'static str {
        match self {
            Self::HojaVida => "HojasDeVida",
            Self::Certificado => "Certificados",
            Self::Certificacion => "Certificaciones",
            Self::ExperienciaLaboral => "ExperienciaLaboral",
            Self::Otros => "Otros",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Destino {
    Todos,
    Administradores,
    Regulares,
    Especificos,
}

impl Destino {
    pub fn as_str(&self) -> &'static str {
        match self {
            Destino::Todos => "todos",
            Destino::Administradores => "administradores",
            Destino::Regulares => "regulares",
            Destino::Especificos => "especificos",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "todos" => Some(Destino::Todos),
            "administradores" => Some(Destino::Administradores),
            "regulares" => Some(Destino::Regulares),
            "especificos" => Some(Destino::Especificos),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Prioridad {
    Baja,
    Media,
    Alta,
}

impl Prioridad {
    pub fn as_str(&self) -> &'static str {
        match self {
            Prioridad::Baja => "baja",
            Prioridad::Media => "media",
            Prioridad::Alta => "alta",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "baja" => Some(Prioridad::Baja),
            "media" => Some(Prioridad::Media),
            "alta" => Some(Prioridad::Alta),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EstadoNotificacion {
    Activa,
    Archivada,
}

impl EstadoNotificacion {
    pub fn as_str(&self) -> &'static str {
        match self {
            EstadoNotificacion::Activa => "activa",
            EstadoNotificacion::Archivada => "archivada",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "activa" => Some(EstadoNotificacion::Activa),
            "archivada" => Some(EstadoNotificacion::Archivada),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Notificacion {
    pub id: i64,
    pub nombre: String,
    pub cuerpo: String,
    pub destino: String,
    pub prioridad: String,
    pub estado: String,
    pub permitir_respuesta: bool,
    pub creado_por: Option<i64>,
    pub fecha_creacion: DateTime<Utc>,
    pub fecha_actualizacion: Option<DateTime<Utc>>,
}

impl Notificacion {
    pub fn destino(&self) -> Option<Destino> {
        Destino::parse(&self.destino)
    }

    pub fn is_active(&self) -> bool {
        self.estado == EstadoNotificacion::Activa.as_str()
    }
}

#[derive(Debug, Clone, Serialize, FromRow)]
pub struct NotificacionResumen {
    #[sqlx(flatten)]
    #[serde(flatten)]
    pub notificacion: Notificacion,
    pub archivos_count: i64,
    pub respuestas_count: i64,
}

#[derive(Debug, Clone)]
pub struct NuevaNotificacion {
    pub nombre: String,
    pub cuerpo: String,
    pub destino: Destino,
    pub prioridad: Prioridad,
    pub permitir_respuesta: bool,
    pub creado_por: i64,
    pub usuarios_ids: Vec<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct NotificacionArchivo {
    pub id: i64,
    pub notificacion_id: i64,
    pub nombre_original: String,
    pub nombre_archivo: String,
    pub ruta_archivo: String,
    pub tipo_mime: String,
    pub tamano: i64,
    pub fecha_subida: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NuevoArchivo {
    pub nombre_original: String,
    pub nombre_archivo: String,
    pub ruta_archivo: String,
    pub tipo_mime: String,
    pub tamano: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdjuntoRespuesta {
    pub nombre: String,
    pub ruta: String,
}

#[derive(Debug, Clone, Serialize, FromRow)]
pub struct NotificacionRespuesta {
    pub id: i64,
    pub notificacion_id: i64,
    pub usuario_id: i64,
    pub autor: String,
    pub respuesta: String,
    pub archivos: Json<Vec<AdjuntoRespuesta>>,
    pub fecha_respuesta: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, FromRow)]
pub struct Destinatario {
    pub id: i64,
    pub nombre: String,
    pub apellido: String,
    pub email: String,
}

#[derive(Debug, Clone, Default, Serialize, FromRow)]
pub struct EstadisticasNotificaciones {
    pub total: i64,
    pub activas: i64,
    pub archivadas: i64,
    pub total_respuestas: i64,
}

#[derive(Debug, Clone, Serialize, FromRow)]
pub struct HistorialAcceso {
    pub id: i64,
    pub usuario_id: i64,
    pub fecha_acceso: DateTime<Utc>,
    pub ip_acceso: String,
    pub dispositivo: String,
    pub navegador: String,
    pub exito: bool,
    pub detalles: String,
}

#[derive(Debug, Clone, Serialize, FromRow)]
pub struct HistorialAccesoDetalle {
    #[sqlx(flatten)]
    #[serde(flatten)]
    pub acceso: HistorialAcceso,
    pub nombre: String,
    pub apellido: String,
    pub email: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NuevoAcceso {
    pub usuario_id: i64,
    pub ip: String,
    pub dispositivo: String,
    pub navegador: String,
    pub exito: bool,
    pub detalles: String,
}

#[derive(Debug, Clone, FromRow)]
pub struct CodigoDosFactores {
    pub id: i64,
    pub usuario_id: i64,
    pub codigo_hash: String,
    pub expira_en: DateTime<Utc>,
    pub intentos: i32,
    pub usado: bool,
    pub fecha_creacion: DateTime<Utc>,
}

impl CodigoDosFactores {
    pub fn is_expired(&self) -> bool {
        Utc::now() > self.expira_en
    }
}

#[derive(Debug, Clone, FromRow)]
pub struct BloqueoAcceso {
    pub ip: String,
    pub email: String,
    pub intentos: i32,
    pub ultimo_intento: DateTime<Utc>,
    pub bloqueado_hasta: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, FromRow)]
pub struct PasswordReset {
    pub id: i64,
    pub usuario_id: i64,
    pub token_hash: String,
    pub expira_en: DateTime<Utc>,
}

impl PasswordReset {
    pub fn is_expired(&self) -> bool {
        Utc::now() > self.expira_en
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_admin_roles() {
        assert!(is_admin_role("admin"));
        assert!(is_admin_role("administrador"));
        assert!(!is_admin_role("usuario"));
        assert!(!is_admin_role("Admin"));
    }

    #[test]
    fn test_enum_parsing() {
        assert_eq!(Destino::parse("especificos"), Some(Destino::Especificos));
        assert_eq!(Destino::parse("otros"), None);
        assert_eq!(Prioridad::parse("alta").map(|p| p.as_str()), Some("alta"));
        assert_eq!(EstadoNotificacion::parse("borrador"), None);
        assert_eq!(TipoSeccion::parse("recursos").map(|s| s.directory()), Some("Documentos/Recursos"));
        assert_eq!(
            TipoDocumentoUsuario::parse("experiencia_laboral").map(|t| t.folder()),
            Some("ExperienciaLaboral")
        );
    }

    #[test]
    fn test_expiry_checks() {
        let code = CodigoDosFactores {
            id: 1,
            usuario_id: 1,
            codigo_hash: String::new(),
            expira_en: Utc::now() - chrono::Duration::seconds(1),
            intentos: 0,
            usado: false,
            fecha_creacion: Utc::now(),
        };
        assert!(code.is_expired());

        let reset = PasswordReset {
            id: 1,
            usuario_id: 1,
            token_hash: String::new(),
            expira_en: Utc::now() + chrono::Duration::hours(1),
        };
        assert!(!reset.is_expired());
    }
}
