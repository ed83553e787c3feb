//! Input parsing shared by the notification endpoints.

use serde::Deserialize;

use crate::db::escape_like;
use crate::db::models::{Destino, EstadoNotificacion, NuevaNotificacion, Prioridad};
use crate::db::repository::NotificationFilter;
use crate::error::AppError;
use crate::portal::paging;
use crate::portal::validate::parse_date;
use crate::Result;

pub const MAX_REPLY_CHARS: usize = 2000;

/// Raw notification fields, from either a multipart form or JSON.
#[derive(Debug, Default, Deserialize)]
pub struct NotificationFields {
    pub nombre: Option<String>,
    pub cuerpo: Option<String>,
    pub destino: Option<String>,
    pub prioridad: Option<String>,
    /// Comma separated ids.
    pub usuarios_ids: Option<String>,
    #[serde(default)]
    pub permitir_respuesta: bool,
}

fn non_blank(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|v| !v.is_empty())
}

/// `"3, 5,8"` into ids. Any non-numeric entry rejects the whole list.
pub fn parse_user_ids(csv: &str) -> Result<Vec<i64>> {
    let mut ids = Vec::new();
    for part in csv.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        match part.parse::<i64>() {
            Ok(id) if id > 0 => {
                if !ids.contains(&id) {
                    ids.push(id);
                }
            }
            _ => return Err(AppError::validation("Los usuarios seleccionados no son válidos")),
        }
    }
    Ok(ids)
}

impl NotificationFields {
    pub fn validate(&self, creado_por: i64) -> Result<NuevaNotificacion> {
        let missing = || AppError::validation("Todos los campos requeridos deben estar completos");

        let nombre = non_blank(&self.nombre).ok_or_else(missing)?;
        let cuerpo = non_blank(&self.cuerpo).ok_or_else(missing)?;
        let destino = non_blank(&self.destino).ok_or_else(missing)?;
        let prioridad = non_blank(&self.prioridad).ok_or_else(missing)?;

        let destino = Destino::parse(destino).ok_or_else(|| AppError::validation("Destino no válido"))?;
        let prioridad = Prioridad::parse(prioridad).ok_or_else(|| AppError::validation("Prioridad no válida"))?;

        let usuarios_ids = if destino == Destino::Especificos {
            let ids = parse_user_ids(non_blank(&self.usuarios_ids).unwrap_or_default())?;
            if ids.is_empty() {
                return Err(AppError::validation(
                    "Debe seleccionar al menos un usuario para notificaciones específicas",
                ));
            }
            ids
        } else {
            Vec::new()
        };

        Ok(NuevaNotificacion {
            nombre: nombre.to_string(),
            cuerpo: cuerpo.to_string(),
            destino,
            prioridad,
            permitir_respuesta: self.permitir_respuesta,
            creado_por,
            usuarios_ids,
        })
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct ListQuery {
    pub estado: Option<String>,
    pub prioridad: Option<String>,
    pub destino: Option<String>,
    pub fecha_desde: Option<String>,
    pub fecha_hasta: Option<String>,
    pub busqueda: Option<String>,
    pub limite: Option<i64>,
    pub pagina: Option<i64>,
}

fn date_filter(value: &Option<String>, message: &str) -> Result<Option<chrono::NaiveDate>> {
    match non_blank(value) {
        Some(raw) => parse_date(raw).map(Some).ok_or_else(|| AppError::validation(message)),
        None => Ok(None),
    }
}

impl ListQuery {
    /// Unknown enum values are ignored; malformed dates are an error.
    pub fn to_filter(&self) -> Result<NotificationFilter> {
        let (_, limite, offset) = paging(self.pagina, self.limite, 50, 100);
        Ok(NotificationFilter {
            estado: non_blank(&self.estado).and_then(EstadoNotificacion::parse),
            prioridad: non_blank(&self.prioridad).and_then(Prioridad::parse),
            destino: non_blank(&self.destino).and_then(Destino::parse),
            desde: date_filter(&self.fecha_desde, "Formato de fecha desde inválido")?,
            hasta: date_filter(&self.fecha_hasta, "Formato de fecha hasta inválido")?,
            busqueda: non_blank(&self.busqueda).map(escape_like),
            limite,
            offset,
        })
    }
}

/// Name of a duplicated notification given how many copies exist.
pub fn copy_name(original: &str, existing_copies: i64) -> String {
    let base = format!("Copia de {}", original);
    if existing_copies > 0 {
        format!("{} ({})", base, existing_copies + 1)
    } else {
        base
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fields(destino: &str, ids: Option<&str>) -> NotificationFields {
        NotificationFields {
            nombre: Some(" Pausas activas ".into()),
            cuerpo: Some("Recuerden la pausa de las 3pm".into()),
            destino: Some(destino.into()),
            prioridad: Some("media".into()),
            usuarios_ids: ids.map(str::to_string),
            permitir_respuesta: true,
        }
    }

    #[test]
    fn test_validate_general_audience() {
        let n = fields("todos", Some("1,2")).validate(3).unwrap();
        assert_eq!(n.nombre, "Pausas activas");
        assert_eq!(n.destino, Destino::Todos);
        assert!(n.usuarios_ids.is_empty());
        assert_eq!(n.creado_por, 3);
    }

    #[test]
    fn test_specific_recipients() {
        let n = fields("especificos", Some("4, 9,4")).validate(1).unwrap();
        assert_eq!(n.usuarios_ids, vec![4, 9]);

        let err = fields("especificos", Some(" ")).validate(1).unwrap_err();
        assert_eq!(
            err.public_message(),
            "Debe seleccionar al menos un usuario para notificaciones específicas"
        );
        let err = fields("especificos", Some("4,x")).validate(1).unwrap_err();
        assert_eq!(err.public_message(), "Los usuarios seleccionados no son válidos");
    }

    #[test]
    fn test_missing_and_unknown_values() {
        let mut f = fields("todos", None);
        f.cuerpo = Some("  ".into());
        assert!(f.validate(1).is_err());
        assert!(fields("nadie", None).validate(1).is_err());
    }

    #[test]
    fn test_list_filter() {
        let query = ListQuery {
            estado: Some("archivada".into()),
            prioridad: Some("urgente".into()),
            busqueda: Some("50%_off".into()),
            fecha_desde: Some("2024-02-01".into()),
            limite: Some(500),
            pagina: Some(2),
            ..Default::default()
        };
        let filter = query.to_filter().unwrap();
        assert_eq!(filter.estado, Some(EstadoNotificacion::Archivada));
        assert_eq!(filter.prioridad, None);
        assert_eq!(filter.busqueda.as_deref(), Some("50\\%\\_off"));
        assert_eq!((filter.limite, filter.offset), (100, 100));

        let bad = ListQuery { fecha_hasta: Some("01/02/2024".into()), ..Default::default() };
        assert!(bad.to_filter().is_err());
        assert_eq!(ListQuery::default().to_filter().unwrap().limite, 50);
    }

    #[test]
    fn test_copy_name() {
        assert_eq!(copy_name("Aviso", 0), "Copia de Aviso");
        assert_eq!(copy_name("Aviso", 2), "Copia de Aviso (3)");
    }
}
