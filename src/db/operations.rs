use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgPoolOptions;
use sqlx::types::Json;
use sqlx::{PgPool, Postgres, QueryBuilder, Transaction};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

use crate::db::escape_like;
use crate::db::models::*;
use crate::db::repository::*;
use crate::error::{AppError, DatabaseError};
use crate::Result;

const USER_COLUMNS: &str = "id, nombre, apellido, email, contrasena, rol, telefono, direccion, \
    fecha_nacimiento, estado_civil, emergencia_contacto, emergencia_telefono, acerca_de_mi, \
    avatar, cargo, area, tiene_2fa, secreto_2fa, fecha_registro";

const NOTIFICATION_COLUMNS: &str = "n.id, n.nombre, n.cuerpo, n.destino, n.prioridad, n.estado, \
    n.permitir_respuesta, n.creado_por, n.fecha_creacion, n.fecha_actualizacion";

const REPLY_SELECT: &str = "SELECT r.id, r.notificacion_id, r.usuario_id, \
    (u.nombre || ' ' || u.apellido) AS autor, r.respuesta, r.archivos, r.fecha_respuesta \
    FROM notificaciones_respuestas r JOIN usuarios u ON u.id = r.usuario_id";

/// Postgres implementation of every repository trait.
#[derive(Clone)]
pub struct DbOperations {
    pool: Arc<PgPool>,
}

impl DbOperations {
    pub fn new(pool: Arc<PgPool>) -> Self {
        Self { pool }
    }

    pub async fn new_with_options(
        url: &str,
        max_connections: u32,
        acquire_timeout: Duration,
    ) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(acquire_timeout)
            .connect(url)
            .await
            .map_err(|e| AppError::DatabaseError(DatabaseError::ConnectionError(e.to_string())))?;

        Ok(Self { pool: Arc::new(pool) })
    }

    /// Pool that opens connections on first use.
    pub fn connect_lazy(url: &str, max_connections: u32) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(Duration::from_secs(2))
            .connect_lazy(url)
            .map_err(|e| AppError::DatabaseError(DatabaseError::ConnectionError(e.to_string())))?;

        Ok(Self { pool: Arc::new(pool) })
    }

    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations").run(self.pool.as_ref()).await?;
        info!("Database migrations applied");
        Ok(())
    }

    pub async fn begin_transaction(&self) -> Result<Transaction<'_, Postgres>> {
        Ok(self.pool.as_ref().begin().await?)
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    async fn insert_attachments(
        transaction: &mut Transaction<'_, Postgres>,
        notificacion_id: i64,
        files: &[NuevoArchivo],
    ) -> Result<()> {
        for file in files {
            sqlx::query(
                "INSERT INTO notificaciones_archivos \
                 (notificacion_id, nombre_original, nombre_archivo, ruta_archivo, tipo_mime, tamano) \
                 VALUES ($1, $2, $3, $4, $5, $6)",
            )
            .bind(notificacion_id)
            .bind(&file.nombre_original)
            .bind(&file.nombre_archivo)
            .bind(&file.ruta_archivo)
            .bind(&file.tipo_mime)
            .bind(file.tamano)
            .execute(&mut **transaction)
            .await?;
        }
        Ok(())
    }

    async fn insert_recipients(
        transaction: &mut Transaction<'_, Postgres>,
        notificacion_id: i64,
        usuarios_ids: &[i64],
    ) -> Result<()> {
        for usuario_id in usuarios_ids {
            sqlx::query(
                "INSERT INTO notificaciones_usuarios (notificacion_id, usuario_id) VALUES ($1, $2) \
                 ON CONFLICT DO NOTHING",
            )
            .bind(notificacion_id)
            .bind(usuario_id)
            .execute(&mut **transaction)
            .await?;
        }
        Ok(())
    }

    async fn create_notification_with_transaction(
        transaction: &mut Transaction<'_, Postgres>,
        notification: &NuevaNotificacion,
        files: &[NuevoArchivo],
    ) -> Result<i64> {
        let id: i64 = sqlx::query_scalar(
            "INSERT INTO notificaciones (nombre, cuerpo, destino, prioridad, permitir_respuesta, creado_por) \
             VALUES ($1, $2, $3, $4, $5, $6) RETURNING id",
        )
        .bind(&notification.nombre)
        .bind(&notification.cuerpo)
        .bind(notification.destino.as_str())
        .bind(notification.prioridad.as_str())
        .bind(notification.permitir_respuesta)
        .bind(notification.creado_por)
        .fetch_one(&mut **transaction)
        .await?;

        if notification.destino == Destino::Especificos {
            Self::insert_recipients(transaction, id, &notification.usuarios_ids).await?;
        }
        Self::insert_attachments(transaction, id, files).await?;
        Ok(id)
    }

    async fn update_notification_with_transaction(
        transaction: &mut Transaction<'_, Postgres>,
        id: i64,
        notification: &NuevaNotificacion,
    ) -> Result<()> {
        let result = sqlx::query(
            "UPDATE notificaciones SET nombre = $1, cuerpo = $2, destino = $3, prioridad = $4, \
             permitir_respuesta = $5, fecha_actualizacion = NOW() WHERE id = $6",
        )
        .bind(&notification.nombre)
        .bind(&notification.cuerpo)
        .bind(notification.destino.as_str())
        .bind(notification.prioridad.as_str())
        .bind(notification.permitir_respuesta)
        .bind(id)
        .execute(&mut **transaction)
        .await?;

        if result.rows_affected() == 0 {
            return Err(AppError::DatabaseError(DatabaseError::NotFound));
        }

        sqlx::query("DELETE FROM notificaciones_usuarios WHERE notificacion_id = $1")
            .bind(id)
            .execute(&mut **transaction)
            .await?;
        if notification.destino == Destino::Especificos {
            Self::insert_recipients(transaction, id, &notification.usuarios_ids).await?;
        }
        Ok(())
    }

    async fn delete_notification_with_transaction(
        transaction: &mut Transaction<'_, Postgres>,
        id: i64,
    ) -> Result<Vec<String>> {
        let mut paths: Vec<String> = sqlx::query_scalar(
            "SELECT ruta_archivo FROM notificaciones_archivos WHERE notificacion_id = $1",
        )
        .bind(id)
        .fetch_all(&mut **transaction)
        .await?;

        let reply_files: Vec<Json<Vec<AdjuntoRespuesta>>> = sqlx::query_scalar(
            "SELECT archivos FROM notificaciones_respuestas WHERE notificacion_id = $1",
        )
        .bind(id)
        .fetch_all(&mut **transaction)
        .await?;
        paths.extend(
            reply_files
                .into_iter()
                .flat_map(|files| files.0.into_iter().map(|f| f.ruta)),
        );

        for table in [
            "notificaciones_respuestas",
            "notificaciones_leidas",
            "notificaciones_usuarios",
            "notificaciones_archivos",
        ] {
            sqlx::query(&format!("DELETE FROM {} WHERE notificacion_id = $1", table))
                .bind(id)
                .execute(&mut **transaction)
                .await?;
        }

        let result = sqlx::query("DELETE FROM notificaciones WHERE id = $1")
            .bind(id)
            .execute(&mut **transaction)
            .await?;
        if result.rows_affected() == 0 {
            return Err(AppError::DatabaseError(DatabaseError::NotFound));
        }
        Ok(paths)
    }

    async fn duplicate_notification_with_transaction(
        transaction: &mut Transaction<'_, Postgres>,
        id: i64,
        nombre: &str,
        creado_por: i64,
        files: &[NuevoArchivo],
    ) -> Result<i64> {
        let new_id: Option<i64> = sqlx::query_scalar(
            "INSERT INTO notificaciones (nombre, cuerpo, destino, prioridad, estado, permitir_respuesta, creado_por) \
             SELECT $1, cuerpo, destino, prioridad, 'activa', permitir_respuesta, $2 \
             FROM notificaciones WHERE id = $3 RETURNING id",
        )
        .bind(nombre)
        .bind(creado_por)
        .bind(id)
        .fetch_optional(&mut **transaction)
        .await?;
        let new_id = new_id.ok_or(AppError::DatabaseError(DatabaseError::NotFound))?;

        sqlx::query(
            "INSERT INTO notificaciones_usuarios (notificacion_id, usuario_id) \
             SELECT $1, usuario_id FROM notificaciones_usuarios WHERE notificacion_id = $2",
        )
        .bind(new_id)
        .bind(id)
        .execute(&mut **transaction)
        .await?;

        Self::insert_attachments(transaction, new_id, files).await?;
        Ok(new_id)
    }

    fn push_history_filters<'a>(builder: &mut QueryBuilder<'a, Postgres>, filter: &'a HistoryFilter) {
        builder.push(" WHERE TRUE");
        if let Some(usuario_id) = filter.usuario_id {
            builder.push(" AND h.usuario_id = ").push_bind(usuario_id);
        }
        if let Some(exito) = filter.exito {
            builder.push(" AND h.exito = ").push_bind(exito);
        }
        if let Some(desde) = filter.desde {
            builder.push(" AND h.fecha_acceso::date >= ").push_bind(desde);
        }
        if let Some(hasta) = filter.hasta {
            builder.push(" AND h.fecha_acceso::date <= ").push_bind(hasta);
        }
    }
}

/// Runs `$body` inside a transaction, committing on success and rolling
/// back on error.
macro_rules! in_transaction {
    ($self:ident, |$tx:ident| $body:expr) => {{
        let mut $tx = $self.begin_transaction().await?;
        let result = $body;
        match result {
            Ok(value) => {
                $tx.commit().await?;
                Ok(value)
            }
            Err(e) => {
                $tx.rollback().await?;
                Err(e)
            }
        }
    }};
}

#[async_trait]
impl UserRepository for DbOperations {
    async fn find_by_id(&self, id: i64) -> Result<Option<Usuario>> {
        let user = sqlx::query_as::<_, Usuario>(&format!("SELECT {} FROM usuarios WHERE id = $1", USER_COLUMNS))
            .bind(id)
            .fetch_optional(self.pool.as_ref())
            .await?;
        Ok(user)
    }

    async fn find_by_email(&self, email: &str) -> Result<Option<Usuario>> {
        let user = sqlx::query_as::<_, Usuario>(&format!(
            "SELECT {} FROM usuarios WHERE LOWER(email) = LOWER($1)",
            USER_COLUMNS
        ))
        .bind(email)
        .fetch_optional(self.pool.as_ref())
        .await?;
        Ok(user)
    }

    async fn list(&self) -> Result<Vec<Usuario>> {
        let users = sqlx::query_as::<_, Usuario>(&format!(
            "SELECT {} FROM usuarios ORDER BY nombre, apellido",
            USER_COLUMNS
        ))
        .fetch_all(self.pool.as_ref())
        .await?;
        Ok(users)
    }

    async fn email_taken(&self, email: &str, except_id: Option<i64>) -> Result<bool> {
        let taken: bool = sqlx::query_scalar(
            "SELECT EXISTS(SELECT 1 FROM usuarios WHERE LOWER(email) = LOWER($1) \
             AND ($2::bigint IS NULL OR id <> $2))",
        )
        .bind(email)
        .bind(except_id)
        .fetch_one(self.pool.as_ref())
        .await?;
        Ok(taken)
    }

    async fn create(&self, user: NuevoUsuario) -> Result<i64> {
        let id: i64 = sqlx::query_scalar(
            "INSERT INTO usuarios (nombre, apellido, email, contrasena, rol, telefono, cargo, area) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8) RETURNING id",
        )
        .bind(&user.nombre)
        .bind(&user.apellido)
        .bind(&user.email)
        .bind(&user.contrasena_hash)
        .bind(&user.rol)
        .bind(&user.telefono)
        .bind(&user.cargo)
        .bind(&user.area)
        .fetch_one(self.pool.as_ref())
        .await?;
        debug!("Created user {}", id);
        Ok(id)
    }

    async fn update(&self, user: ActualizacionUsuario) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE usuarios SET nombre = $1, apellido = $2, email = $3, rol = $4, telefono = $5, \
             cargo = $6, area = $7, fecha_actualizacion = NOW() WHERE id = $8",
        )
        .bind(&user.nombre)
        .bind(&user.apellido)
        .bind(&user.email)
        .bind(&user.rol)
        .bind(&user.telefono)
        .bind(&user.cargo)
        .bind(&user.area)
        .bind(user.id)
        .execute(self.pool.as_ref())
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn update_profile(&self, id: i64, profile: ActualizacionPerfil) -> Result<()> {
        sqlx::query(
            "UPDATE usuarios SET nombre = $1, apellido = $2, telefono = $3, direccion = $4, \
             fecha_nacimiento = $5, estado_civil = $6, emergencia_contacto = $7, \
             emergencia_telefono = $8, acerca_de_mi = $9, avatar = COALESCE($10, avatar), \
             fecha_actualizacion = NOW() WHERE id = $11",
        )
        .bind(&profile.nombre)
        .bind(&profile.apellido)
        .bind(&profile.telefono)
        .bind(&profile.direccion)
        .bind(profile.fecha_nacimiento)
        .bind(&profile.estado_civil)
        .bind(&profile.emergencia_contacto)
        .bind(&profile.emergencia_telefono)
        .bind(&profile.acerca_de_mi)
        .bind(&profile.avatar)
        .bind(id)
        .execute(self.pool.as_ref())
        .await?;
        Ok(())
    }

    async fn update_password(&self, id: i64, password_hash: &str) -> Result<()> {
        sqlx::query("UPDATE usuarios SET contrasena = $1, fecha_actualizacion = NOW() WHERE id = $2")
            .bind(password_hash)
            .bind(id)
            .execute(self.pool.as_ref())
            .await?;
        Ok(())
    }

    async fn set_two_factor(&self, id: i64, enabled: bool, encrypted_secret: Option<String>) -> Result<()> {
        sqlx::query(
            "UPDATE usuarios SET tiene_2fa = $1, secreto_2fa = COALESCE($2, secreto_2fa) WHERE id = $3",
        )
        .bind(enabled)
        .bind(encrypted_secret)
        .bind(id)
        .execute(self.pool.as_ref())
        .await?;
        Ok(())
    }

    async fn reset_two_factor(&self, id: i64) -> Result<()> {
        sqlx::query("UPDATE usuarios SET tiene_2fa = FALSE, secreto_2fa = NULL WHERE id = $1")
            .bind(id)
            .execute(self.pool.as_ref())
            .await?;
        Ok(())
    }

    async fn two_factor_overview(&self) -> Result<Vec<EstadoDosFactores>> {
        let rows = sqlx::query_as::<_, EstadoDosFactores>(
            "SELECT id, nombre, apellido, email, rol, tiene_2fa, \
             (secreto_2fa IS NOT NULL AND secreto_2fa <> '') AS configurado \
             FROM usuarios ORDER BY nombre, apellido",
        )
        .fetch_all(self.pool.as_ref())
        .await?;
        Ok(rows)
    }

    async fn delete(&self, id: i64) -> Result<bool> {
        let result = sqlx::query("DELETE FROM usuarios WHERE id = $1")
            .bind(id)
            .execute(self.pool.as_ref())
            .await?;
        Ok(result.rows_affected() > 0)
    }
}

#[async_trait]
impl SecurityRepository for DbOperations {
    async fn get_lockout(&self, ip: &str, email: &str) -> Result<Option<BloqueoAcceso>> {
        let row = sqlx::query_as::<_, BloqueoAcceso>(
            "SELECT ip, email, intentos, ultimo_intento, bloqueado_hasta FROM bloqueos_acceso \
             WHERE ip = $1 AND email = $2",
        )
        .bind(ip)
        .bind(email)
        .fetch_optional(self.pool.as_ref())
        .await?;
        Ok(row)
    }

    async fn record_failed_attempt(
        &self,
        ip: &str,
        email: &str,
        max_attempts: i32,
        bloqueado_hasta: DateTime<Utc>,
    ) -> Result<i32> {
        let intentos: i32 = sqlx::query_scalar(
            "INSERT INTO bloqueos_acceso (ip, email, intentos, ultimo_intento, bloqueado_hasta) \
             VALUES ($1, $2, 1, NOW(), CASE WHEN 1 >= $3::INT THEN $4::TIMESTAMPTZ END) \
             ON CONFLICT (ip, email) DO UPDATE SET \
             intentos = bloqueos_acceso.intentos + 1, \
             ultimo_intento = NOW(), \
             bloqueado_hasta = CASE WHEN bloqueos_acceso.intentos + 1 >= $3::INT \
             THEN $4::TIMESTAMPTZ ELSE bloqueos_acceso.bloqueado_hasta END \
             RETURNING intentos",
        )
        .bind(ip)
        .bind(email)
        .bind(max_attempts)
        .bind(bloqueado_hasta)
        .fetch_one(self.pool.as_ref())
        .await?;
        Ok(intentos)
    }

    async fn lift_expired_lockout(&self, ip: &str, email: &str) -> Result<()> {
        sqlx::query(
            "UPDATE bloqueos_acceso SET bloqueado_hasta = NULL \
             WHERE ip = $1 AND email = $2 AND bloqueado_hasta <= NOW()",
        )
        .bind(ip)
        .bind(email)
        .execute(self.pool.as_ref())
        .await?;
        Ok(())
    }

    async fn clear_lockout(&self, ip: &str, email: &str) -> Result<()> {
        sqlx::query("DELETE FROM bloqueos_acceso WHERE ip = $1 AND email = $2")
            .bind(ip)
            .bind(email)
            .execute(self.pool.as_ref())
            .await?;
        Ok(())
    }

    async fn log_access(&self, entry: NuevoAcceso) -> Result<()> {
        sqlx::query(
            "INSERT INTO historial_accesos (usuario_id, ip_acceso, dispositivo, navegador, exito, detalles) \
             VALUES ($1, $2, $3, $4, $5, $6)",
        )
        .bind(entry.usuario_id)
        .bind(&entry.ip)
        .bind(&entry.dispositivo)
        .bind(&entry.navegador)
        .bind(entry.exito)
        .bind(&entry.detalles)
        .execute(self.pool.as_ref())
        .await?;
        Ok(())
    }

    async fn user_history(&self, usuario_id: i64, limite: i64, offset: i64) -> Result<(Vec<HistorialAcceso>, i64)> {
        let rows = sqlx::query_as::<_, HistorialAcceso>(
            "SELECT id, usuario_id, fecha_acceso, ip_acceso, dispositivo, navegador, exito, detalles \
             FROM historial_accesos WHERE usuario_id = $1 ORDER BY fecha_acceso DESC LIMIT $2 OFFSET $3",
        )
        .bind(usuario_id)
        .bind(limite)
        .bind(offset)
        .fetch_all(self.pool.as_ref())
        .await?;

        let total: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM historial_accesos WHERE usuario_id = $1")
            .bind(usuario_id)
            .fetch_one(self.pool.as_ref())
            .await?;
        Ok((rows, total))
    }

    async fn global_history(&self, filter: HistoryFilter) -> Result<(Vec<HistorialAccesoDetalle>, i64)> {
        let mut count = QueryBuilder::<Postgres>::new("SELECT COUNT(*) FROM historial_accesos h");
        Self::push_history_filters(&mut count, &filter);
        let total: i64 = count.build_query_scalar().fetch_one(self.pool.as_ref()).await?;

        let mut select = QueryBuilder::<Postgres>::new(
            "SELECT h.id, h.usuario_id, h.fecha_acceso, h.ip_acceso, h.dispositivo, h.navegador, \
             h.exito, h.detalles, u.nombre, u.apellido, u.email \
             FROM historial_accesos h JOIN usuarios u ON h.usuario_id = u.id",
        );
        Self::push_history_filters(&mut select, &filter);
        select
            .push(" ORDER BY h.fecha_acceso DESC LIMIT ")
            .push_bind(filter.limite)
            .push(" OFFSET ")
            .push_bind(filter.offset);
        let rows = select
            .build_query_as::<HistorialAccesoDetalle>()
            .fetch_all(self.pool.as_ref())
            .await?;
        Ok((rows, total))
    }

    async fn create_email_code(&self, usuario_id: i64, codigo_hash: &str, expira_en: DateTime<Utc>) -> Result<()> {
        sqlx::query("INSERT INTO codigos_2fa (usuario_id, codigo_hash, expira_en) VALUES ($1, $2, $3)")
            .bind(usuario_id)
            .bind(codigo_hash)
            .bind(expira_en)
            .execute(self.pool.as_ref())
            .await?;
        Ok(())
    }

    async fn active_email_code(&self, usuario_id: i64) -> Result<Option<CodigoDosFactores>> {
        let row = sqlx::query_as::<_, CodigoDosFactores>(
            "SELECT id, usuario_id, codigo_hash, expira_en, intentos, usado, fecha_creacion \
             FROM codigos_2fa WHERE usuario_id = $1 AND usado = FALSE \
             ORDER BY fecha_creacion DESC LIMIT 1",
        )
        .bind(usuario_id)
        .fetch_optional(self.pool.as_ref())
        .await?;
        Ok(row)
    }

    async fn increment_code_attempts(&self, id: i64) -> Result<()> {
        sqlx::query("UPDATE codigos_2fa SET intentos = intentos + 1 WHERE id = $1")
            .bind(id)
            .execute(self.pool.as_ref())
            .await?;
        Ok(())
    }

    async fn mark_code_used(&self, id: i64) -> Result<()> {
        sqlx::query("UPDATE codigos_2fa SET usado = TRUE WHERE id = $1")
            .bind(id)
            .execute(self.pool.as_ref())
            .await?;
        Ok(())
    }

    async fn invalidate_email_codes(&self, usuario_id: i64) -> Result<()> {
        sqlx::query("UPDATE codigos_2fa SET usado = TRUE WHERE usuario_id = $1 AND usado = FALSE")
            .bind(usuario_id)
            .execute(self.pool.as_ref())
            .await?;
        Ok(())
    }

    async fn replace_reset_token(&self, usuario_id: i64, token_hash: &str, expira_en: DateTime<Utc>) -> Result<()> {
        in_transaction!(self, |transaction| {
            async {
                sqlx::query("DELETE FROM password_resets WHERE usuario_id = $1")
                    .bind(usuario_id)
                    .execute(&mut *transaction)
                    .await?;
                sqlx::query("INSERT INTO password_resets (usuario_id, token_hash, expira_en) VALUES ($1, $2, $3)")
                    .bind(usuario_id)
                    .bind(token_hash)
                    .bind(expira_en)
                    .execute(&mut *transaction)
                    .await?;
                Ok::<(), AppError>(())
            }
            .await
        })
    }

    async fn find_reset_token(&self, token_hash: &str) -> Result<Option<PasswordReset>> {
        let row = sqlx::query_as::<_, PasswordReset>(
            "SELECT id, usuario_id, token_hash, expira_en FROM password_resets WHERE token_hash = $1",
        )
        .bind(token_hash)
        .fetch_optional(self.pool.as_ref())
        .await?;
        Ok(row)
    }

    async fn delete_reset_tokens(&self, usuario_id: i64) -> Result<()> {
        sqlx::query("DELETE FROM password_resets WHERE usuario_id = $1")
            .bind(usuario_id)
            .execute(self.pool.as_ref())
            .await?;
        Ok(())
    }
}

#[async_trait]
impl NotificationRepository for DbOperations {
    async fn list(&self, viewer: Viewer, filter: NotificationFilter) -> Result<Vec<NotificacionResumen>> {
        let mut builder = QueryBuilder::<Postgres>::new("SELECT ");
        builder
            .push(NOTIFICATION_COLUMNS)
            .push(
                ", (SELECT COUNT(*) FROM notificaciones_archivos a WHERE a.notificacion_id = n.id) AS archivos_count, \
                 (SELECT COUNT(*) FROM notificaciones_respuestas r WHERE r.notificacion_id = n.id AND r.usuario_id <> ",
            )
            .push_bind(viewer.usuario_id)
            .push(") AS respuestas_count FROM notificaciones n WHERE TRUE");

        if !viewer.is_admin {
            builder
                .push(
                    " AND n.estado = 'activa' AND (n.destino IN ('todos', 'regulares') \
                     OR (n.destino = 'especificos' AND EXISTS (SELECT 1 FROM notificaciones_usuarios nu \
                     WHERE nu.notificacion_id = n.id AND nu.usuario_id = ",
                )
                .push_bind(viewer.usuario_id)
                .push(")))");
        }
        if let Some(estado) = filter.estado {
            builder.push(" AND n.estado = ").push_bind(estado.as_str());
        }
        if let Some(prioridad) = filter.prioridad {
            builder.push(" AND n.prioridad = ").push_bind(prioridad.as_str());
        }
        if let Some(destino) = filter.destino {
            builder.push(" AND n.destino = ").push_bind(destino.as_str());
        }
        if let Some(desde) = filter.desde {
            builder.push(" AND n.fecha_creacion::date >= ").push_bind(desde);
        }
        if let Some(hasta) = filter.hasta {
            builder.push(" AND n.fecha_creacion::date <= ").push_bind(hasta);
        }
        if let Some(busqueda) = &filter.busqueda {
            let pattern = format!("%{}%", busqueda);
            builder
                .push(" AND (n.nombre ILIKE ")
                .push_bind(pattern.clone())
                .push(" ESCAPE '\\' OR n.cuerpo ILIKE ")
                .push_bind(pattern)
                .push(" ESCAPE '\\')");
        }
        builder
            .push(" ORDER BY n.fecha_creacion DESC LIMIT ")
            .push_bind(filter.limite)
            .push(" OFFSET ")
            .push_bind(filter.offset);

        let rows = builder
            .build_query_as::<NotificacionResumen>()
            .fetch_all(self.pool.as_ref())
            .await?;
        Ok(rows)
    }

    async fn statistics(&self) -> Result<EstadisticasNotificaciones> {
        let stats = sqlx::query_as::<_, EstadisticasNotificaciones>(
            "SELECT COUNT(*) AS total, \
             COUNT(*) FILTER (WHERE estado = 'activa') AS activas, \
             COUNT(*) FILTER (WHERE estado = 'archivada') AS archivadas, \
             (SELECT COUNT(*) FROM notificaciones_respuestas) AS total_respuestas \
             FROM notificaciones",
        )
        .fetch_one(self.pool.as_ref())
        .await?;
        Ok(stats)
    }

    async fn get(&self, id: i64) -> Result<Option<Notificacion>> {
        let row = sqlx::query_as::<_, Notificacion>(&format!(
            "SELECT {} FROM notificaciones n WHERE n.id = $1",
            NOTIFICATION_COLUMNS
        ))
        .bind(id)
        .fetch_optional(self.pool.as_ref())
        .await?;
        Ok(row)
    }

    async fn is_recipient(&self, notificacion_id: i64, usuario_id: i64) -> Result<bool> {
        let found: bool = sqlx::query_scalar(
            "SELECT EXISTS(SELECT 1 FROM notificaciones_usuarios WHERE notificacion_id = $1 AND usuario_id = $2)",
        )
        .bind(notificacion_id)
        .bind(usuario_id)
        .fetch_one(self.pool.as_ref())
        .await?;
        Ok(found)
    }

    async fn recipients(&self, notificacion_id: i64) -> Result<Vec<Destinatario>> {
        let rows = sqlx::query_as::<_, Destinatario>(
            "SELECT u.id, u.nombre, u.apellido, u.email FROM notificaciones_usuarios nu \
             JOIN usuarios u ON u.id = nu.usuario_id WHERE nu.notificacion_id = $1 ORDER BY u.nombre",
        )
        .bind(notificacion_id)
        .fetch_all(self.pool.as_ref())
        .await?;
        Ok(rows)
    }

    async fn selectable_users(&self) -> Result<Vec<Destinatario>> {
        let rows = sqlx::query_as::<_, Destinatario>(
            "SELECT id, nombre, apellido, email FROM usuarios ORDER BY nombre, apellido",
        )
        .fetch_all(self.pool.as_ref())
        .await?;
        Ok(rows)
    }

    async fn create(&self, notification: NuevaNotificacion, files: Vec<NuevoArchivo>) -> Result<i64> {
        in_transaction!(self, |transaction| {
            Self::create_notification_with_transaction(&mut transaction, &notification, &files).await
        })
    }

    async fn update(&self, id: i64, notification: NuevaNotificacion) -> Result<()> {
        in_transaction!(self, |transaction| {
            Self::update_notification_with_transaction(&mut transaction, id, &notification).await
        })
    }

    async fn delete(&self, id: i64) -> Result<Vec<String>> {
        in_transaction!(self, |transaction| {
            Self::delete_notification_with_transaction(&mut transaction, id).await
        })
    }

    async fn set_status(&self, id: i64, estado: EstadoNotificacion) -> Result<()> {
        let result = sqlx::query(
            "UPDATE notificaciones SET estado = $1, fecha_actualizacion = NOW() WHERE id = $2",
        )
        .bind(estado.as_str())
        .bind(id)
        .execute(self.pool.as_ref())
        .await?;
        if result.rows_affected() == 0 {
            return Err(AppError::DatabaseError(DatabaseError::NotFound));
        }
        Ok(())
    }

    async fn count_copies(&self, base_name: &str) -> Result<i64> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM notificaciones WHERE nombre LIKE $1 ESCAPE '\\'",
        )
        .bind(format!("{}%", escape_like(base_name)))
        .fetch_one(self.pool.as_ref())
        .await?;
        Ok(count)
    }

    async fn duplicate(&self, id: i64, nombre: &str, creado_por: i64, files: Vec<NuevoArchivo>) -> Result<i64> {
        in_transaction!(self, |transaction| {
            Self::duplicate_notification_with_transaction(&mut transaction, id, nombre, creado_por, &files).await
        })
    }

    async fn attachments(&self, notificacion_id: i64) -> Result<Vec<NotificacionArchivo>> {
        let rows = sqlx::query_as::<_, NotificacionArchivo>(
            "SELECT id, notificacion_id, nombre_original, nombre_archivo, ruta_archivo, tipo_mime, tamano, fecha_subida \
             FROM notificaciones_archivos WHERE notificacion_id = $1 ORDER BY id",
        )
        .bind(notificacion_id)
        .fetch_all(self.pool.as_ref())
        .await?;
        Ok(rows)
    }

    async fn attachment(&self, id: i64) -> Result<Option<NotificacionArchivo>> {
        let row = sqlx::query_as::<_, NotificacionArchivo>(
            "SELECT id, notificacion_id, nombre_original, nombre_archivo, ruta_archivo, tipo_mime, tamano, fecha_subida \
             FROM notificaciones_archivos WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(self.pool.as_ref())
        .await?;
        Ok(row)
    }

    async fn mark_read(&self, notificacion_id: i64, usuario_id: i64) -> Result<()> {
        sqlx::query(
            "INSERT INTO notificaciones_leidas (notificacion_id, usuario_id) VALUES ($1, $2) \
             ON CONFLICT DO NOTHING",
        )
        .bind(notificacion_id)
        .bind(usuario_id)
        .execute(self.pool.as_ref())
        .await?;
        Ok(())
    }

    async fn replies(&self, notificacion_id: i64, only_user: Option<i64>) -> Result<Vec<NotificacionRespuesta>> {
        let rows = sqlx::query_as::<_, NotificacionRespuesta>(&format!(
            "{} WHERE r.notificacion_id = $1 AND ($2::bigint IS NULL OR r.usuario_id = $2) \
             ORDER BY r.fecha_respuesta ASC",
            REPLY_SELECT
        ))
        .bind(notificacion_id)
        .bind(only_user)
        .fetch_all(self.pool.as_ref())
        .await?;
        Ok(rows)
    }

    async fn reply(&self, id: i64) -> Result<Option<NotificacionRespuesta>> {
        let row = sqlx::query_as::<_, NotificacionRespuesta>(&format!("{} WHERE r.id = $1", REPLY_SELECT))
            .bind(id)
            .fetch_optional(self.pool.as_ref())
            .await?;
        Ok(row)
    }

    async fn reply_by_attachment(&self, ruta: &str) -> Result<Option<NotificacionRespuesta>> {
        let needle = Json(serde_json::json!([{ "ruta": ruta }]));
        let row = sqlx::query_as::<_, NotificacionRespuesta>(&format!(
            "{} WHERE r.archivos @> $1 LIMIT 1",
            REPLY_SELECT
        ))
        .bind(needle)
        .fetch_optional(self.pool.as_ref())
        .await?;
        Ok(row)
    }

    async fn create_reply(
        &self,
        notificacion_id: i64,
        usuario_id: i64,
        respuesta: &str,
        archivos: Vec<AdjuntoRespuesta>,
    ) -> Result<i64> {
        let id: i64 = sqlx::query_scalar(
            "INSERT INTO notificaciones_respuestas (notificacion_id, usuario_id, respuesta, archivos) \
             VALUES ($1, $2, $3, $4) RETURNING id",
        )
        .bind(notificacion_id)
        .bind(usuario_id)
        .bind(respuesta)
        .bind(Json(archivos))
        .fetch_one(self.pool.as_ref())
        .await?;
        Ok(id)
    }

    async fn delete_reply(&self, id: i64) -> Result<bool> {
        let result = sqlx::query("DELETE FROM notificaciones_respuestas WHERE id = $1")
            .bind(id)
            .execute(self.pool.as_ref())
            .await?;
        Ok(result.rows_affected() > 0)
    }
}

#[async_trait]
impl PortalRepository for DbOperations {
    async fn vacancies(&self) -> Result<Vec<Vacante>> {
        let rows = sqlx::query_as::<_, Vacante>(
            "SELECT id, titulo, descripcion, ciudad, fecha_publicacion FROM vacantes ORDER BY fecha_publicacion DESC",
        )
        .fetch_all(self.pool.as_ref())
        .await?;
        Ok(rows)
    }

    async fn vacancy(&self, id: i64) -> Result<Option<Vacante>> {
        let row = sqlx::query_as::<_, Vacante>(
            "SELECT id, titulo, descripcion, ciudad, fecha_publicacion FROM vacantes WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(self.pool.as_ref())
        .await?;
        Ok(row)
    }

    async fn create_vacancy(&self, vacancy: NuevaVacante) -> Result<i64> {
        let id: i64 = sqlx::query_scalar(
            "INSERT INTO vacantes (titulo, descripcion, ciudad) VALUES ($1, $2, $3) RETURNING id",
        )
        .bind(&vacancy.titulo)
        .bind(&vacancy.descripcion)
        .bind(&vacancy.ciudad)
        .fetch_one(self.pool.as_ref())
        .await?;
        Ok(id)
    }

    async fn update_vacancy(&self, id: i64, vacancy: NuevaVacante) -> Result<bool> {
        let result = sqlx::query("UPDATE vacantes SET titulo = $1, descripcion = $2, ciudad = $3 WHERE id = $4")
            .bind(&vacancy.titulo)
            .bind(&vacancy.descripcion)
            .bind(&vacancy.ciudad)
            .bind(id)
            .execute(self.pool.as_ref())
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn delete_vacancy(&self, id: i64) -> Result<bool> {
        let result = sqlx::query("DELETE FROM vacantes WHERE id = $1")
            .bind(id)
            .execute(self.pool.as_ref())
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn application_exists(&self, documento: &str, vacante_id: i64) -> Result<bool> {
        let found: bool = sqlx::query_scalar(
            "SELECT EXISTS(SELECT 1 FROM postulaciones WHERE documento = $1 AND vacante_id = $2)",
        )
        .bind(documento)
        .bind(vacante_id)
        .fetch_one(self.pool.as_ref())
        .await?;
        Ok(found)
    }

    async fn create_application(&self, application: NuevaPostulacion) -> Result<i64> {
        let id: i64 = sqlx::query_scalar(
            "INSERT INTO postulaciones (vacante_id, tipo_documento, documento, nombre, correo, telefono, hoja_vida) \
             VALUES ($1, $2, $3, $4, $5, $6, $7) RETURNING id",
        )
        .bind(application.vacante_id)
        .bind(&application.tipo_documento)
        .bind(&application.documento)
        .bind(&application.nombre)
        .bind(&application.correo)
        .bind(&application.telefono)
        .bind(&application.hoja_vida)
        .fetch_one(self.pool.as_ref())
        .await?;
        Ok(id)
    }

    async fn applications(&self) -> Result<Vec<Postulacion>> {
        let rows = sqlx::query_as::<_, Postulacion>(
            "SELECT p.id, p.vacante_id, v.titulo AS vacante_titulo, p.tipo_documento, p.documento, p.nombre, \
             p.correo, p.telefono, p.hoja_vida, p.fecha_postulacion \
             FROM postulaciones p LEFT JOIN vacantes v ON v.id = p.vacante_id \
             ORDER BY p.fecha_postulacion DESC",
        )
        .fetch_all(self.pool.as_ref())
        .await?;
        Ok(rows)
    }

    async fn delete_application_by_file(&self, hoja_vida: &str) -> Result<u64> {
        let result = sqlx::query("DELETE FROM postulaciones WHERE hoja_vida = $1")
            .bind(hoja_vida)
            .execute(self.pool.as_ref())
            .await?;
        Ok(result.rows_affected())
    }

    async fn documents(&self) -> Result<Vec<Documento>> {
        let rows = sqlx::query_as::<_, Documento>(
            "SELECT id, nombre, ruta, tipo_documento, tipo_seccion, subido_por, fecha_subida \
             FROM documentos ORDER BY fecha_subida DESC",
        )
        .fetch_all(self.pool.as_ref())
        .await?;
        Ok(rows)
    }

    async fn document(&self, id: i64) -> Result<Option<Documento>> {
        let row = sqlx::query_as::<_, Documento>(
            "SELECT id, nombre, ruta, tipo_documento, tipo_seccion, subido_por, fecha_subida \
             FROM documentos WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(self.pool.as_ref())
        .await?;
        Ok(row)
    }

    async fn create_document(&self, document: NuevoDocumento) -> Result<i64> {
        let id: i64 = sqlx::query_scalar(
            "INSERT INTO documentos (nombre, ruta, tipo_documento, tipo_seccion, subido_por) \
             VALUES ($1, $2, $3, $4, $5) RETURNING id",
        )
        .bind(&document.nombre)
        .bind(&document.ruta)
        .bind(&document.tipo_documento)
        .bind(document.tipo_seccion.as_str())
        .bind(document.subido_por)
        .fetch_one(self.pool.as_ref())
        .await?;
        Ok(id)
    }

    async fn rename_document(&self, id: i64, nombre: &str) -> Result<bool> {
        let result = sqlx::query("UPDATE documentos SET nombre = $1 WHERE id = $2")
            .bind(nombre)
            .bind(id)
            .execute(self.pool.as_ref())
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn delete_document(&self, id: i64) -> Result<bool> {
        let result = sqlx::query("DELETE FROM documentos WHERE id = $1")
            .bind(id)
            .execute(self.pool.as_ref())
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn user_documents(&self, usuario_id: Option<i64>) -> Result<Vec<DocumentoUsuario>> {
        let rows = sqlx::query_as::<_, DocumentoUsuario>(
            "SELECT id, usuario_id, tipo_documento, nombre_archivo, ruta_archivo, fecha_subida \
             FROM documentos_usuarios WHERE ($1::bigint IS NULL OR usuario_id = $1) \
             ORDER BY fecha_subida DESC",
        )
        .bind(usuario_id)
        .fetch_all(self.pool.as_ref())
        .await?;
        Ok(rows)
    }

    async fn user_document(&self, id: i64) -> Result<Option<DocumentoUsuario>> {
        let row = sqlx::query_as::<_, DocumentoUsuario>(
            "SELECT id, usuario_id, tipo_documento, nombre_archivo, ruta_archivo, fecha_subida \
             FROM documentos_usuarios WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(self.pool.as_ref())
        .await?;
        Ok(row)
    }

    async fn create_user_document(&self, document: NuevoDocumentoUsuario) -> Result<i64> {
        let id: i64 = sqlx::query_scalar(
            "INSERT INTO documentos_usuarios (usuario_id, tipo_documento, nombre_archivo, ruta_archivo) \
             VALUES ($1, $2, $3, $4) RETURNING id",
        )
        .bind(document.usuario_id)
        .bind(&document.tipo_documento)
        .bind(&document.nombre_archivo)
        .bind(&document.ruta_archivo)
        .fetch_one(self.pool.as_ref())
        .await?;
        Ok(id)
    }

    async fn rename_user_document(&self, id: i64, nombre: &str) -> Result<bool> {
        let result = sqlx::query("UPDATE documentos_usuarios SET nombre_archivo = $1 WHERE id = $2")
            .bind(nombre)
            .bind(id)
            .execute(self.pool.as_ref())
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn delete_user_document(&self, id: i64) -> Result<bool> {
        let result = sqlx::query("DELETE FROM documentos_usuarios WHERE id = $1")
            .bind(id)
            .execute(self.pool.as_ref())
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn owns_file(&self, usuario_id: i64, file_name: &str) -> Result<bool> {
        let found: bool = sqlx::query_scalar(
            "SELECT EXISTS(SELECT 1 FROM documentos_usuarios WHERE usuario_id = $1 \
             AND (ruta_archivo = $2 OR ruta_archivo LIKE $3 ESCAPE '\\'))",
        )
        .bind(usuario_id)
        .bind(file_name)
        .bind(format!("%/{}", escape_like(file_name)))
        .fetch_one(self.pool.as_ref())
        .await?;
        Ok(found)
    }
}
