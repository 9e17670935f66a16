//! Hybrid Supabase/SQLite storage layer: date-based routing + unified query API.
//!
//! Supabase (PostgreSQL) holds the current year and is the source of truth;
//! local SQLite files hold the cache and the per-year historical archive.
//! Callers never pick a backend: the manager routes each operation from the
//! record date and the requested mode.

use std::collections::hash_map::Entry;
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::time::{Duration, Instant};

use chrono::{Datelike, NaiveDate, Utc};
use molino_core::{
    year_of, EstadoConvocatoria, NivelHoras, NuevaAsignacionMenu, NuevaConvocatoria,
    NuevaInasistencia, SqlRow, SqlValue, SYNC_TABLES,
};
use rusqlite::types::Value as SqliteValue;
use rusqlite::types::ValueRef as SqliteValueRef;
use serde::Serialize;
use sqlx::postgres::{PgConnectOptions, PgPool, PgPoolOptions, PgRow, PgSslMode};
use sqlx::{Column, Row as _, TypeInfo, ValueRef as _};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

pub const CRATE_NAME: &str = "molino-storage";

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("cloud backend requested but not connected")]
    CloudUnavailable,
    #[error("configuration: {0}")]
    Config(String),
    #[error("row decode: {0}")]
    Decode(String),
    #[error(transparent)]
    Sqlite(#[from] rusqlite::Error),
    #[error(transparent)]
    Postgres(#[from] sqlx::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Backend selection requested by the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DbMode {
    /// Route by record date: current year and connected → cloud, else local.
    Auto,
    /// Force Supabase; errors when the connection is down.
    Cloud,
    /// Force the local SQLite store.
    Local,
    /// Local only, never consult the cloud connection state.
    Offline,
}

/// Backend an operation actually ran against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DbSource {
    Cloud,
    Local,
}

#[derive(Debug, Clone)]
enum Target {
    Cloud,
    Local(i32),
}

#[derive(Debug, Clone)]
pub struct QueryResult {
    pub rows: Vec<SqlRow>,
    pub row_count: usize,
    pub source: DbSource,
    pub elapsed_ms: f64,
}

/// Supabase connection coordinates, the pooler-style five-field form.
#[derive(Debug, Clone)]
pub struct CloudConfig {
    pub host: String,
    pub port: u16,
    pub database: String,
    pub user: String,
    pub password: String,
}

#[derive(Debug, Clone)]
pub struct StorageConfig {
    /// Full connection URL; takes precedence over [`CloudConfig`] parts.
    pub database_url: Option<String>,
    pub cloud: Option<CloudConfig>,
    pub sqlite_dir: PathBuf,
    pub sqlite_db_name: String,
    pub current_year: i32,
    /// Skip the cloud connection attempt entirely.
    pub offline: bool,
    pub connect_timeout: Duration,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            database_url: None,
            cloud: None,
            sqlite_dir: PathBuf::from("data"),
            sqlite_db_name: "gestion_rrhh.db".to_string(),
            current_year: Utc::now().year(),
            offline: false,
            connect_timeout: Duration::from_secs(15),
        }
    }
}

impl StorageConfig {
    pub fn from_env() -> Self {
        let cloud = match (
            std::env::var("SUPABASE_DB_HOST").ok(),
            std::env::var("SUPABASE_DB_USER").ok(),
            std::env::var("SUPABASE_DB_PASSWORD").ok(),
        ) {
            (Some(host), Some(user), Some(password)) => Some(CloudConfig {
                host,
                port: std::env::var("SUPABASE_DB_PORT")
                    .ok()
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(6543),
                database: std::env::var("SUPABASE_DB_NAME")
                    .unwrap_or_else(|_| "postgres".to_string()),
                user,
                password,
            }),
            _ => None,
        };

        Self {
            database_url: std::env::var("DATABASE_URL").ok(),
            cloud,
            sqlite_dir: std::env::var("MOLINO_SQLITE_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("data")),
            sqlite_db_name: std::env::var("MOLINO_SQLITE_DB")
                .unwrap_or_else(|_| "gestion_rrhh.db".to_string()),
            current_year: std::env::var("MOLINO_CURRENT_YEAR")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or_else(|| Utc::now().year()),
            offline: std::env::var("MOLINO_OFFLINE")
                .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(false),
            connect_timeout: Duration::from_secs(15),
        }
    }
}

/// Rewrite `?` placeholders to PostgreSQL `$1..$n`, leaving single-quoted
/// literals untouched.
pub fn translate_placeholders(sql: &str) -> String {
    let mut out = String::with_capacity(sql.len() + 8);
    let mut index = 0usize;
    let mut in_literal = false;
    for ch in sql.chars() {
        match ch {
            '\'' => {
                in_literal = !in_literal;
                out.push(ch);
            }
            '?' if !in_literal => {
                index += 1;
                out.push('$');
                out.push_str(&index.to_string());
            }
            _ => out.push(ch),
        }
    }
    out
}

fn bind_pg<'q>(
    query: sqlx::query::Query<'q, sqlx::Postgres, sqlx::postgres::PgArguments>,
    params: &[SqlValue],
) -> sqlx::query::Query<'q, sqlx::Postgres, sqlx::postgres::PgArguments> {
    let mut query = query;
    for value in params {
        query = match value {
            SqlValue::Null => query.bind(Option::<String>::None),
            SqlValue::Bool(v) => query.bind(*v),
            SqlValue::Integer(v) => query.bind(*v),
            SqlValue::Real(v) => query.bind(*v),
            SqlValue::Text(v) => query.bind(v.clone()),
        };
    }
    query
}

fn bind_sqlite(value: &SqlValue) -> SqliteValue {
    match value {
        SqlValue::Null => SqliteValue::Null,
        SqlValue::Bool(v) => SqliteValue::Integer(i64::from(*v)),
        SqlValue::Integer(v) => SqliteValue::Integer(*v),
        SqlValue::Real(v) => SqliteValue::Real(*v),
        SqlValue::Text(v) => SqliteValue::Text(v.clone()),
    }
}

fn sqlite_value(raw: SqliteValueRef<'_>) -> SqlValue {
    match raw {
        SqliteValueRef::Null => SqlValue::Null,
        SqliteValueRef::Integer(v) => SqlValue::Integer(v),
        SqliteValueRef::Real(v) => SqlValue::Real(v),
        SqliteValueRef::Text(v) => SqlValue::Text(String::from_utf8_lossy(v).into_owned()),
        SqliteValueRef::Blob(v) => SqlValue::Text(String::from_utf8_lossy(v).into_owned()),
    }
}

fn run_local_query(
    conn: &rusqlite::Connection,
    sql: &str,
    params: &[SqlValue],
) -> Result<Vec<SqlRow>, StorageError> {
    let mut stmt = conn.prepare(sql)?;
    let columns: Vec<String> = stmt.column_names().into_iter().map(str::to_string).collect();
    let mut rows = stmt.query(rusqlite::params_from_iter(params.iter().map(bind_sqlite)))?;
    let mut out = Vec::new();
    while let Some(row) = rows.next()? {
        let mut decoded = SqlRow::new();
        for (idx, name) in columns.iter().enumerate() {
            decoded.insert(name.clone(), sqlite_value(row.get_ref(idx)?));
        }
        out.push(decoded);
    }
    Ok(out)
}

fn pg_value(row: &PgRow, idx: usize) -> Result<SqlValue, StorageError> {
    let raw = row.try_get_raw(idx)?;
    if raw.is_null() {
        return Ok(SqlValue::Null);
    }
    let type_name = raw.type_info().name().to_string();
    let value = match type_name.as_str() {
        "INT2" => SqlValue::Integer(i64::from(row.try_get::<i16, _>(idx)?)),
        "INT4" => SqlValue::Integer(i64::from(row.try_get::<i32, _>(idx)?)),
        "INT8" => SqlValue::Integer(row.try_get::<i64, _>(idx)?),
        "FLOAT4" => SqlValue::Real(f64::from(row.try_get::<f32, _>(idx)?)),
        "FLOAT8" | "NUMERIC" => SqlValue::Real(row.try_get::<f64, _>(idx)?),
        "BOOL" => SqlValue::Bool(row.try_get::<bool, _>(idx)?),
        "DATE" => SqlValue::Text(
            row.try_get::<NaiveDate, _>(idx)?
                .format("%Y-%m-%d")
                .to_string(),
        ),
        "TIMESTAMP" => SqlValue::Text(
            row.try_get::<chrono::NaiveDateTime, _>(idx)?
                .format("%Y-%m-%dT%H:%M:%S%.f")
                .to_string(),
        ),
        "TIMESTAMPTZ" => SqlValue::Text(
            row.try_get::<chrono::DateTime<Utc>, _>(idx)?.to_rfc3339(),
        ),
        "UUID" => SqlValue::Text(row.try_get::<sqlx::types::Uuid, _>(idx)?.to_string()),
        "JSON" | "JSONB" => {
            SqlValue::Text(row.try_get::<serde_json::Value, _>(idx)?.to_string())
        }
        _ => SqlValue::Text(row.try_get::<String, _>(idx)?),
    };
    Ok(value)
}

fn pg_row_to_row(row: &PgRow) -> Result<SqlRow, StorageError> {
    let mut out = SqlRow::new();
    for column in row.columns() {
        out.insert(column.name().to_string(), pg_value(row, column.ordinal())?);
    }
    Ok(out)
}

/// Idempotent local mirror of the synced tables. Only the columns the
/// operational layer touches; the trigger bookkeeping stays in the cloud
/// store's contract.
const LOCAL_SCHEMA: &str = r"
CREATE TABLE IF NOT EXISTS configuracion (
  clave TEXT PRIMARY KEY,
  valor TEXT
);

CREATE TABLE IF NOT EXISTS datos_personales (
  id_agente INTEGER PRIMARY KEY,
  nombre TEXT NOT NULL,
  apellido TEXT NOT NULL,
  dni TEXT,
  email TEXT,
  activo INTEGER NOT NULL DEFAULT 1,
  fecha_creacion TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
);

CREATE TABLE IF NOT EXISTS dispositivos (
  id_dispositivo INTEGER PRIMARY KEY,
  nombre_dispositivo TEXT NOT NULL,
  piso_dispositivo TEXT,
  activo INTEGER NOT NULL DEFAULT 1,
  fecha_creacion TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
);

CREATE TABLE IF NOT EXISTS turnos (
  id_turno INTEGER PRIMARY KEY,
  tipo_turno TEXT NOT NULL,
  descripcion TEXT,
  hora_inicio_default TEXT,
  hora_fin_default TEXT,
  cant_horas_default REAL,
  activo INTEGER NOT NULL DEFAULT 1,
  fecha_creacion TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
);

CREATE TABLE IF NOT EXISTS dias (
  id_dia INTEGER PRIMARY KEY,
  fecha TEXT NOT NULL UNIQUE,
  feriado INTEGER NOT NULL DEFAULT 0,
  fecha_creacion TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
);

CREATE TABLE IF NOT EXISTS planificacion (
  id_plani INTEGER PRIMARY KEY,
  fecha TEXT,
  id_turno INTEGER REFERENCES turnos(id_turno),
  observaciones TEXT,
  fecha_creacion TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP,
  fecha_modificacion TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
);

CREATE TABLE IF NOT EXISTS convocatoria (
  id_convocatoria INTEGER PRIMARY KEY,
  id_plani INTEGER REFERENCES planificacion(id_plani),
  id_agente INTEGER NOT NULL REFERENCES datos_personales(id_agente),
  id_turno INTEGER NOT NULL REFERENCES turnos(id_turno),
  fecha_convocatoria TEXT NOT NULL,
  estado TEXT NOT NULL DEFAULT 'vigente',
  motivo_cambio TEXT,
  fecha_creacion TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP,
  fecha_modificacion TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
);

CREATE INDEX IF NOT EXISTS idx_convocatoria_fecha
  ON convocatoria(fecha_convocatoria);
CREATE INDEX IF NOT EXISTS idx_convocatoria_agente
  ON convocatoria(id_agente, fecha_convocatoria);

CREATE TABLE IF NOT EXISTS menu (
  id_menu INTEGER PRIMARY KEY,
  id_convocatoria INTEGER NOT NULL REFERENCES convocatoria(id_convocatoria),
  id_dispositivo INTEGER NOT NULL REFERENCES dispositivos(id_dispositivo),
  id_agente INTEGER NOT NULL REFERENCES datos_personales(id_agente),
  fecha_asignacion TEXT NOT NULL,
  orden INTEGER NOT NULL DEFAULT 1,
  fecha_registro TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
);

CREATE TABLE IF NOT EXISTS saldos (
  id_saldo INTEGER PRIMARY KEY,
  id_agente INTEGER NOT NULL REFERENCES datos_personales(id_agente),
  anio INTEGER NOT NULL,
  mes INTEGER NOT NULL,
  horas_mes REAL NOT NULL DEFAULT 0,
  horas_acumuladas REAL NOT NULL DEFAULT 0,
  fecha_actualizacion TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP,
  UNIQUE (id_agente, anio, mes)
);

CREATE TABLE IF NOT EXISTS inasistencias (
  id_inasistencia INTEGER PRIMARY KEY,
  id_agente INTEGER NOT NULL REFERENCES datos_personales(id_agente),
  fecha_inasistencia TEXT NOT NULL,
  motivo TEXT NOT NULL DEFAULT 'imprevisto',
  observaciones TEXT,
  estado TEXT,
  fecha_creacion TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP,
  fecha_actualizacion_estado TEXT
);

CREATE TABLE IF NOT EXISTS certificados (
  id_certificado INTEGER PRIMARY KEY,
  id_inasistencia INTEGER REFERENCES inasistencias(id_inasistencia),
  id_agente INTEGER REFERENCES datos_personales(id_agente),
  tipo TEXT,
  aprobado INTEGER NOT NULL DEFAULT 0,
  fecha_creacion TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
);

CREATE TABLE IF NOT EXISTS capacitaciones (
  id_cap INTEGER PRIMARY KEY,
  nombre TEXT,
  fecha TEXT,
  fecha_creacion TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
);

CREATE TABLE IF NOT EXISTS capacitaciones_participantes (
  id_participante INTEGER PRIMARY KEY,
  id_cap INTEGER REFERENCES capacitaciones(id_cap),
  id_agente INTEGER REFERENCES datos_personales(id_agente),
  asistio INTEGER NOT NULL DEFAULT 0,
  fecha_creacion TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
);

CREATE VIEW IF NOT EXISTS vista_convocatorias_activas AS
  SELECT c.id_convocatoria,
         c.id_agente,
         c.id_turno,
         c.fecha_convocatoria,
         c.estado,
         t.tipo_turno,
         t.hora_inicio_default AS hora_inicio
    FROM convocatoria c
    JOIN turnos t ON t.id_turno = c.id_turno
   WHERE c.estado = 'vigente';

CREATE VIEW IF NOT EXISTS vista_salud_sistema AS
  SELECT (SELECT COUNT(*) FROM datos_personales WHERE activo = 1) AS agentes_activos,
         (SELECT COUNT(*) FROM dispositivos WHERE activo = 1) AS dispositivos_activos,
         (SELECT COUNT(*) FROM convocatoria WHERE estado = 'vigente') AS convocatorias_vigentes,
         (SELECT COUNT(*) FROM inasistencias) AS inasistencias;
";

#[derive(Debug, Clone, Serialize)]
pub struct ManagerStatus {
    pub current_year: i32,
    pub mode: &'static str,
    pub cloud_connected: bool,
    pub cloud_host: Option<String>,
    pub cloud_database: Option<String>,
    pub cloud_ping: Option<String>,
    pub sqlite_dir: String,
    pub sqlite_db_name: String,
    pub open_local_connections: usize,
}

#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum TableCount {
    Rows(i64),
    Error(String),
}

/// Optional filters for [`UnifiedDbManager::query_convocatorias`].
#[derive(Debug, Clone, Default)]
pub struct ConvocatoriaFilter {
    pub desde: Option<NaiveDate>,
    pub hasta: Option<NaiveDate>,
    pub id_agente: Option<i64>,
    pub estado: Option<String>,
    pub limit: Option<i64>,
}

/// Optional filters for [`UnifiedDbManager::query_inasistencias`].
#[derive(Debug, Clone, Default)]
pub struct InasistenciaFilter {
    pub desde: Option<NaiveDate>,
    pub hasta: Option<NaiveDate>,
    pub id_agente: Option<i64>,
}

pub struct UnifiedDbManager {
    current_year: i32,
    sqlite_dir: PathBuf,
    sqlite_db_name: String,
    cloud: Option<PgPool>,
    cloud_label: Option<(String, String)>,
    local: Mutex<HashMap<i32, rusqlite::Connection>>,
}

impl UnifiedDbManager {
    /// Build the manager, attempting the cloud connection unless the config
    /// says offline. A failed attempt degrades to offline with a warning; it
    /// never aborts construction.
    pub async fn connect(config: StorageConfig) -> Result<Self, StorageError> {
        std::fs::create_dir_all(&config.sqlite_dir)?;

        let mut cloud = None;
        let mut cloud_label = None;
        if config.offline {
            info!("cloud connection skipped, offline mode requested");
        } else {
            match Self::cloud_pool(&config).await {
                Ok(Some((pool, label))) => {
                    info!(host = %label.0, "connected to supabase");
                    cloud = Some(pool);
                    cloud_label = Some(label);
                }
                Ok(None) => warn!("supabase configuration incomplete, running offline"),
                Err(err) => warn!(error = %err, "supabase connection failed, running offline"),
            }
        }

        info!(
            current_year = config.current_year,
            cloud = cloud.is_some(),
            "unified db manager ready"
        );
        Ok(Self {
            current_year: config.current_year,
            sqlite_dir: config.sqlite_dir,
            sqlite_db_name: config.sqlite_db_name,
            cloud,
            cloud_label,
            local: Mutex::new(HashMap::new()),
        })
    }

    /// Local-only manager; the cloud side stays disconnected.
    pub fn offline(config: StorageConfig) -> Result<Self, StorageError> {
        std::fs::create_dir_all(&config.sqlite_dir)?;
        Ok(Self {
            current_year: config.current_year,
            sqlite_dir: config.sqlite_dir,
            sqlite_db_name: config.sqlite_db_name,
            cloud: None,
            cloud_label: None,
            local: Mutex::new(HashMap::new()),
        })
    }

    async fn cloud_pool(
        config: &StorageConfig,
    ) -> Result<Option<(PgPool, (String, String))>, StorageError> {
        let options = PgPoolOptions::new()
            .max_connections(4)
            .acquire_timeout(config.connect_timeout);

        if let Some(url) = &config.database_url {
            let pool = options.connect(url).await?;
            return Ok(Some((pool, ("<database_url>".to_string(), String::new()))));
        }

        let Some(cloud) = &config.cloud else {
            return Ok(None);
        };
        let connect = PgConnectOptions::new()
            .host(&cloud.host)
            .port(cloud.port)
            .database(&cloud.database)
            .username(&cloud.user)
            .password(&cloud.password)
            .ssl_mode(PgSslMode::Require);
        let pool = options.connect_with(connect).await?;
        Ok(Some((pool, (cloud.host.clone(), cloud.database.clone()))))
    }

    pub fn current_year(&self) -> i32 {
        self.current_year
    }

    pub fn is_cloud_connected(&self) -> bool {
        self.cloud.is_some()
    }

    /// Which backend a record with the given date would hit under `mode`.
    pub fn route(&self, fecha: Option<NaiveDate>, mode: DbMode) -> Result<DbSource, StorageError> {
        self.target_for(fecha, mode).map(|t| match t {
            Target::Cloud => DbSource::Cloud,
            Target::Local(_) => DbSource::Local,
        })
    }

    fn target_for(&self, fecha: Option<NaiveDate>, mode: DbMode) -> Result<Target, StorageError> {
        let year = fecha.map(|f| f.year()).unwrap_or(self.current_year);
        match mode {
            DbMode::Cloud => {
                if self.cloud.is_some() {
                    Ok(Target::Cloud)
                } else {
                    Err(StorageError::CloudUnavailable)
                }
            }
            DbMode::Local | DbMode::Offline => Ok(Target::Local(year)),
            DbMode::Auto => {
                if year >= self.current_year && self.cloud.is_some() {
                    Ok(Target::Cloud)
                } else {
                    Ok(Target::Local(year))
                }
            }
        }
    }

    fn local_db_path(&self, year: i32) -> PathBuf {
        let path = if year == self.current_year {
            self.sqlite_dir.join(&self.sqlite_db_name)
        } else {
            self.sqlite_dir.join(format!("gestion_rrhh_{year}.db"))
        };
        if path.exists() {
            path
        } else {
            // No per-year archive file; everything lives in the main db.
            self.sqlite_dir.join(&self.sqlite_db_name)
        }
    }

    async fn with_local<T>(
        &self,
        year: i32,
        f: impl FnOnce(&rusqlite::Connection) -> Result<T, StorageError>,
    ) -> Result<T, StorageError> {
        let mut map = self.local.lock().await;
        let conn = match map.entry(year) {
            Entry::Occupied(entry) => entry.into_mut(),
            Entry::Vacant(entry) => {
                let path = self.local_db_path(year);
                let conn = rusqlite::Connection::open(&path)?;
                conn.execute_batch("PRAGMA foreign_keys = ON;")?;
                debug!(path = %path.display(), year, "opened sqlite connection");
                entry.insert(conn)
            }
        };
        f(conn)
    }

    /// Create the local mirror schema for the current-year database.
    pub async fn bootstrap_local_schema(&self) -> Result<(), StorageError> {
        self.with_local(self.current_year, |conn| {
            conn.execute_batch(LOCAL_SCHEMA)?;
            Ok(())
        })
        .await
    }

    // -----------------------------------------------------------------------
    // Generic query API
    // -----------------------------------------------------------------------

    /// Run a SELECT against the routed backend. SQL is written in the SQLite
    /// dialect with `?` placeholders; it is translated for PostgreSQL.
    pub async fn query(
        &self,
        sql: &str,
        params: &[SqlValue],
        fecha: Option<NaiveDate>,
        mode: DbMode,
    ) -> Result<QueryResult, StorageError> {
        let started = Instant::now();
        let target = self.target_for(fecha, mode)?;
        let (rows, source) = match target {
            Target::Cloud => {
                let pool = self.cloud.as_ref().ok_or(StorageError::CloudUnavailable)?;
                let translated = translate_placeholders(sql);
                let fetched = bind_pg(sqlx::query(&translated), params)
                    .fetch_all(pool)
                    .await?;
                let mut rows = Vec::with_capacity(fetched.len());
                for row in &fetched {
                    rows.push(pg_row_to_row(row)?);
                }
                (rows, DbSource::Cloud)
            }
            Target::Local(year) => (
                self.with_local(year, |conn| run_local_query(conn, sql, params))
                    .await?,
                DbSource::Local,
            ),
        };
        debug!(?source, rows = rows.len(), "query");
        Ok(QueryResult {
            row_count: rows.len(),
            rows,
            source,
            elapsed_ms: started.elapsed().as_secs_f64() * 1000.0,
        })
    }

    pub async fn query_one(
        &self,
        sql: &str,
        params: &[SqlValue],
        fecha: Option<NaiveDate>,
        mode: DbMode,
    ) -> Result<Option<SqlRow>, StorageError> {
        let result = self.query(sql, params, fecha, mode).await?;
        Ok(result.rows.into_iter().next())
    }

    /// Run a statement and return the affected row count.
    pub async fn execute(
        &self,
        sql: &str,
        params: &[SqlValue],
        fecha: Option<NaiveDate>,
        mode: DbMode,
    ) -> Result<u64, StorageError> {
        let target = self.target_for(fecha, mode)?;
        match target {
            Target::Cloud => {
                let pool = self.cloud.as_ref().ok_or(StorageError::CloudUnavailable)?;
                let translated = translate_placeholders(sql);
                let done = bind_pg(sqlx::query(&translated), params)
                    .execute(pool)
                    .await?;
                Ok(done.rows_affected())
            }
            Target::Local(year) => {
                self.with_local(year, |conn| {
                    let mut stmt = conn.prepare(sql)?;
                    let affected =
                        stmt.execute(rusqlite::params_from_iter(params.iter().map(bind_sqlite)))?;
                    Ok(affected as u64)
                })
                .await
            }
        }
    }

    /// INSERT returning the new primary key: `RETURNING` on PostgreSQL,
    /// `last_insert_rowid()` on SQLite.
    pub async fn insert_returning(
        &self,
        sql: &str,
        params: &[SqlValue],
        fecha: Option<NaiveDate>,
        returning: &str,
    ) -> Result<i64, StorageError> {
        let target = self.target_for(fecha, DbMode::Auto)?;
        match target {
            Target::Cloud => {
                let pool = self.cloud.as_ref().ok_or(StorageError::CloudUnavailable)?;
                let translated = format!("{} RETURNING {returning}", translate_placeholders(sql));
                let row = bind_pg(sqlx::query(&translated), params)
                    .fetch_one(pool)
                    .await?;
                let decoded = pg_row_to_row(&row)?;
                decoded
                    .get(returning)
                    .and_then(SqlValue::as_i64)
                    .ok_or_else(|| {
                        StorageError::Decode(format!("column {returning} missing from RETURNING"))
                    })
            }
            Target::Local(year) => {
                self.with_local(year, |conn| {
                    let mut stmt = conn.prepare(sql)?;
                    stmt.execute(rusqlite::params_from_iter(params.iter().map(bind_sqlite)))?;
                    Ok(conn.last_insert_rowid())
                })
                .await
            }
        }
    }

    // -----------------------------------------------------------------------
    // Convocatorias
    // -----------------------------------------------------------------------

    pub async fn insert_convocatoria(
        &self,
        nueva: &NuevaConvocatoria,
    ) -> Result<i64, StorageError> {
        let sql = "INSERT INTO convocatoria \
                   (id_plani, id_agente, id_turno, fecha_convocatoria, estado) \
                   VALUES (?, ?, ?, ?, ?)";
        let estado = nueva.estado.unwrap_or(EstadoConvocatoria::Vigente);
        let params = [
            SqlValue::Integer(nueva.id_plani),
            SqlValue::Integer(nueva.id_agente),
            SqlValue::Integer(nueva.id_turno),
            SqlValue::from(nueva.fecha_convocatoria),
            SqlValue::from(estado.as_str()),
        ];
        self.insert_returning(sql, &params, Some(nueva.fecha_convocatoria), "id_convocatoria")
            .await
    }

    pub async fn query_convocatorias(
        &self,
        filter: &ConvocatoriaFilter,
    ) -> Result<QueryResult, StorageError> {
        let mut conditions = Vec::new();
        let mut params = Vec::new();

        if let Some(desde) = filter.desde {
            conditions.push("c.fecha_convocatoria >= ?");
            params.push(SqlValue::from(desde));
        }
        if let Some(hasta) = filter.hasta {
            conditions.push("c.fecha_convocatoria <= ?");
            params.push(SqlValue::from(hasta));
        }
        if let Some(id_agente) = filter.id_agente {
            conditions.push("c.id_agente = ?");
            params.push(SqlValue::Integer(id_agente));
        }
        if let Some(estado) = &filter.estado {
            conditions.push("c.estado = ?");
            params.push(SqlValue::from(estado.as_str()));
        }

        let where_clause = if conditions.is_empty() {
            "1=1".to_string()
        } else {
            conditions.join(" AND ")
        };
        let sql = format!(
            "SELECT c.*, \
                    dp.nombre || ' ' || dp.apellido AS agente_nombre, \
                    t.tipo_turno \
               FROM convocatoria c \
               JOIN datos_personales dp ON c.id_agente = dp.id_agente \
               JOIN turnos t ON c.id_turno = t.id_turno \
              WHERE {where_clause} \
              ORDER BY c.fecha_convocatoria DESC \
              LIMIT ?"
        );
        params.push(SqlValue::Integer(filter.limit.unwrap_or(1000)));

        // The most recent date in the filter decides the backend.
        let fecha_ref = filter.hasta.or(filter.desde);
        self.query(&sql, &params, fecha_ref, DbMode::Auto).await
    }

    /// Update a convocatoria's state in whichever store owns it. The record
    /// is located first (current store, then the local archive) so the
    /// update lands next to the data.
    pub async fn update_convocatoria_estado(
        &self,
        id_convocatoria: i64,
        nuevo_estado: EstadoConvocatoria,
        motivo: Option<&str>,
    ) -> Result<bool, StorageError> {
        let probe_sql = "SELECT fecha_convocatoria FROM convocatoria WHERE id_convocatoria = ?";
        let probe_params = [SqlValue::Integer(id_convocatoria)];
        let mut found = self
            .query_one(probe_sql, &probe_params, None, DbMode::Auto)
            .await?;
        if found.is_none() && self.is_cloud_connected() {
            found = self
                .query_one(probe_sql, &probe_params, None, DbMode::Local)
                .await?;
        }
        let Some(row) = found else {
            return Ok(false);
        };

        let fecha = row
            .get("fecha_convocatoria")
            .and_then(SqlValue::as_str)
            .and_then(year_of)
            .and_then(|year| NaiveDate::from_ymd_opt(year, 1, 1));

        let sql = "UPDATE convocatoria \
                      SET estado = ?, \
                          motivo_cambio = ?, \
                          fecha_modificacion = CURRENT_TIMESTAMP \
                    WHERE id_convocatoria = ?";
        let params = [
            SqlValue::from(nuevo_estado.as_str()),
            SqlValue::from(motivo.map(str::to_string)),
            SqlValue::Integer(id_convocatoria),
        ];
        let affected = self.execute(sql, &params, fecha, DbMode::Auto).await?;
        Ok(affected > 0)
    }

    // -----------------------------------------------------------------------
    // Saldos
    // -----------------------------------------------------------------------

    pub async fn saldos_de_agente(
        &self,
        id_agente: i64,
        year: Option<i32>,
    ) -> Result<Vec<SqlRow>, StorageError> {
        let year = year.unwrap_or(self.current_year);
        let sql = "SELECT s.*, dp.nombre || ' ' || dp.apellido AS agente \
                     FROM saldos s \
                     JOIN datos_personales dp ON s.id_agente = dp.id_agente \
                    WHERE s.id_agente = ? AND s.anio = ? \
                    ORDER BY s.mes";
        let params = [SqlValue::Integer(id_agente), SqlValue::Integer(i64::from(year))];
        let fecha = NaiveDate::from_ymd_opt(year, 1, 1);
        let result = self.query(sql, &params, fecha, DbMode::Auto).await?;
        Ok(result.rows)
    }

    /// All agents' balances for one month, with the derived hours band.
    pub async fn saldos_del_mes(
        &self,
        mes: u32,
        year: Option<i32>,
    ) -> Result<QueryResult, StorageError> {
        let year = year.unwrap_or(self.current_year);
        let sql = "SELECT s.*, dp.nombre || ' ' || dp.apellido AS agente \
                     FROM saldos s \
                     JOIN datos_personales dp ON s.id_agente = dp.id_agente \
                    WHERE s.mes = ? AND s.anio = ? \
                    ORDER BY dp.apellido";
        let params = [
            SqlValue::Integer(i64::from(mes)),
            SqlValue::Integer(i64::from(year)),
        ];
        let fecha = NaiveDate::from_ymd_opt(year, mes, 1);
        let mut result = self.query(sql, &params, fecha, DbMode::Auto).await?;
        for row in &mut result.rows {
            let nivel = row
                .get("horas_mes")
                .and_then(SqlValue::as_f64)
                .map(NivelHoras::from_horas)
                .unwrap_or(NivelHoras::Normal);
            row.insert("nivel".to_string(), SqlValue::from(nivel.as_str()));
        }
        Ok(result)
    }

    // -----------------------------------------------------------------------
    // Inasistencias
    // -----------------------------------------------------------------------

    pub async fn insert_inasistencia(
        &self,
        nueva: &NuevaInasistencia,
    ) -> Result<i64, StorageError> {
        let sql = "INSERT INTO inasistencias \
                   (id_agente, fecha_inasistencia, motivo, observaciones) \
                   VALUES (?, ?, ?, ?)";
        let params = [
            SqlValue::Integer(nueva.id_agente),
            SqlValue::from(nueva.fecha_inasistencia),
            SqlValue::from(nueva.motivo.clone().unwrap_or_else(|| "imprevisto".to_string())),
            SqlValue::from(nueva.observaciones.clone().unwrap_or_default()),
        ];
        self.insert_returning(sql, &params, Some(nueva.fecha_inasistencia), "id_inasistencia")
            .await
    }

    pub async fn query_inasistencias(
        &self,
        filter: &InasistenciaFilter,
    ) -> Result<QueryResult, StorageError> {
        let mut conditions = Vec::new();
        let mut params = Vec::new();

        if let Some(desde) = filter.desde {
            conditions.push("i.fecha_inasistencia >= ?");
            params.push(SqlValue::from(desde));
        }
        if let Some(hasta) = filter.hasta {
            conditions.push("i.fecha_inasistencia <= ?");
            params.push(SqlValue::from(hasta));
        }
        if let Some(id_agente) = filter.id_agente {
            conditions.push("i.id_agente = ?");
            params.push(SqlValue::Integer(id_agente));
        }

        let where_clause = if conditions.is_empty() {
            "1=1".to_string()
        } else {
            conditions.join(" AND ")
        };
        let sql = format!(
            "SELECT i.*, dp.nombre || ' ' || dp.apellido AS agente \
               FROM inasistencias i \
               JOIN datos_personales dp ON i.id_agente = dp.id_agente \
              WHERE {where_clause} \
              ORDER BY i.fecha_inasistencia DESC"
        );

        let fecha_ref = filter.hasta.or(filter.desde);
        self.query(&sql, &params, fecha_ref, DbMode::Auto).await
    }

    // -----------------------------------------------------------------------
    // Menu (device assignments)
    // -----------------------------------------------------------------------

    pub async fn insert_menu(&self, nueva: &NuevaAsignacionMenu) -> Result<i64, StorageError> {
        let sql = "INSERT INTO menu \
                   (id_convocatoria, id_dispositivo, id_agente, fecha_asignacion, orden) \
                   VALUES (?, ?, ?, ?, ?)";
        let params = [
            SqlValue::Integer(nueva.id_convocatoria),
            SqlValue::Integer(nueva.id_dispositivo),
            SqlValue::Integer(nueva.id_agente),
            SqlValue::from(nueva.fecha_asignacion),
            SqlValue::Integer(nueva.orden.unwrap_or(1)),
        ];
        self.insert_returning(sql, &params, Some(nueva.fecha_asignacion), "id_menu")
            .await
    }

    // -----------------------------------------------------------------------
    // Master tables (always the current store)
    // -----------------------------------------------------------------------

    pub async fn agentes_activos(&self) -> Result<Vec<SqlRow>, StorageError> {
        let sql = "SELECT id_agente, nombre, apellido, dni, email, \
                          nombre || ' ' || apellido AS nombre_completo \
                     FROM datos_personales \
                    WHERE activo = 1 \
                    ORDER BY apellido, nombre";
        let result = self.query(sql, &[], None, DbMode::Auto).await?;
        Ok(result.rows)
    }

    pub async fn dispositivos_activos(&self) -> Result<Vec<SqlRow>, StorageError> {
        let sql = "SELECT id_dispositivo, nombre_dispositivo, piso_dispositivo \
                     FROM dispositivos \
                    WHERE activo = 1 \
                    ORDER BY piso_dispositivo, nombre_dispositivo";
        let result = self.query(sql, &[], None, DbMode::Auto).await?;
        Ok(result.rows)
    }

    pub async fn turnos(&self) -> Result<Vec<SqlRow>, StorageError> {
        let sql = "SELECT id_turno, tipo_turno, descripcion, \
                          hora_inicio_default, hora_fin_default, cant_horas_default \
                     FROM turnos \
                    WHERE activo = 1 \
                    ORDER BY tipo_turno";
        let result = self.query(sql, &[], None, DbMode::Auto).await?;
        Ok(result.rows)
    }

    // -----------------------------------------------------------------------
    // Analytic views
    // -----------------------------------------------------------------------

    pub async fn salud_sistema(&self) -> Result<Option<SqlRow>, StorageError> {
        self.query_one("SELECT * FROM vista_salud_sistema", &[], None, DbMode::Auto)
            .await
    }

    pub async fn convocatorias_activas(
        &self,
        fecha: Option<NaiveDate>,
    ) -> Result<QueryResult, StorageError> {
        let fecha = fecha.unwrap_or_else(|| Utc::now().date_naive());
        let sql = "SELECT * FROM vista_convocatorias_activas \
                    WHERE fecha_convocatoria >= ? \
                    ORDER BY fecha_convocatoria, hora_inicio";
        self.query(sql, &[SqlValue::from(fecha)], Some(fecha), DbMode::Auto)
            .await
    }

    // -----------------------------------------------------------------------
    // Diagnostics
    // -----------------------------------------------------------------------

    pub async fn status(&self) -> ManagerStatus {
        let cloud_ping = match &self.cloud {
            Some(pool) => Some(match sqlx::query("SELECT 1").execute(pool).await {
                Ok(_) => "ok".to_string(),
                Err(err) => format!("error: {err}"),
            }),
            None => None,
        };
        ManagerStatus {
            current_year: self.current_year,
            mode: if self.cloud.is_some() { "hybrid" } else { "offline" },
            cloud_connected: self.cloud.is_some(),
            cloud_host: self.cloud_label.as_ref().map(|(host, _)| host.clone()),
            cloud_database: self.cloud_label.as_ref().map(|(_, db)| db.clone()),
            cloud_ping,
            sqlite_dir: self.sqlite_dir.display().to_string(),
            sqlite_db_name: self.sqlite_db_name.clone(),
            open_local_connections: self.local.lock().await.len(),
        }
    }

    /// Row counts for every registry table. Per-table failures are reported
    /// in place, they do not abort the scan.
    pub async fn table_counts(&self, mode: DbMode) -> BTreeMap<String, TableCount> {
        let mut counts = BTreeMap::new();
        for spec in &SYNC_TABLES {
            let sql = format!("SELECT COUNT(*) AS n FROM {}", spec.name);
            let count = match self.query_one(&sql, &[], None, mode).await {
                Ok(Some(row)) => row
                    .get("n")
                    .and_then(SqlValue::as_i64)
                    .map(TableCount::Rows)
                    .unwrap_or_else(|| TableCount::Error("missing count column".to_string())),
                Ok(None) => TableCount::Rows(0),
                Err(err) => TableCount::Error(err.to_string()),
            };
            counts.insert(spec.name.to_string(), count);
        }
        counts
    }

    /// Probe both stores and produce a short human-readable report.
    pub async fn test_connection(&self) -> (bool, String) {
        let mut lines = Vec::new();
        let mut success = true;

        match &self.cloud {
            Some(_) => {
                match self
                    .query_one(
                        "SELECT COUNT(*) AS n FROM configuracion",
                        &[],
                        None,
                        DbMode::Cloud,
                    )
                    .await
                {
                    Ok(row) => {
                        let n = row.and_then(|r| r.get("n").and_then(SqlValue::as_i64)).unwrap_or(0);
                        lines.push(format!("cloud: ok ({n} configs)"));
                    }
                    Err(err) => {
                        lines.push(format!("cloud: error: {err}"));
                        success = false;
                    }
                }
            }
            None => lines.push("cloud: not connected".to_string()),
        }

        match self
            .query_one(
                "SELECT COUNT(*) AS n FROM configuracion",
                &[],
                None,
                DbMode::Local,
            )
            .await
        {
            Ok(row) => {
                let n = row.and_then(|r| r.get("n").and_then(SqlValue::as_i64)).unwrap_or(0);
                lines.push(format!("local: ok ({n} configs)"));
            }
            Err(err) => {
                lines.push(format!("local: error: {err}"));
                success = false;
            }
        }

        (success, lines.join("\n"))
    }

    /// Drop every open connection. The manager can keep being used; local
    /// connections reopen lazily.
    pub async fn close(&self) {
        self.local.lock().await.clear();
        if let Some(pool) = &self.cloud {
            pool.close().await;
        }
        info!("all connections closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn offline_manager(dir: &std::path::Path, year: i32) -> UnifiedDbManager {
        UnifiedDbManager::offline(StorageConfig {
            sqlite_dir: dir.to_path_buf(),
            current_year: year,
            offline: true,
            ..StorageConfig::default()
        })
        .expect("offline manager")
    }

    #[test]
    fn placeholders_become_numbered_dollars() {
        assert_eq!(
            translate_placeholders("SELECT * FROM t WHERE a = ? AND b = ?"),
            "SELECT * FROM t WHERE a = $1 AND b = $2"
        );
        assert_eq!(translate_placeholders("SELECT 1"), "SELECT 1");
    }

    #[test]
    fn placeholders_inside_literals_survive() {
        assert_eq!(
            translate_placeholders("SELECT * FROM t WHERE a = '?' AND b = ?"),
            "SELECT * FROM t WHERE a = '?' AND b = $1"
        );
    }

    #[tokio::test]
    async fn auto_mode_routes_by_year_when_offline() {
        let dir = tempdir().expect("tempdir");
        let db = offline_manager(dir.path(), 2025);

        let historic = NaiveDate::from_ymd_opt(2022, 6, 1);
        let current = NaiveDate::from_ymd_opt(2025, 6, 1);

        assert_eq!(db.route(historic, DbMode::Auto).unwrap(), DbSource::Local);
        // Current-year data still routes local with the cloud down.
        assert_eq!(db.route(current, DbMode::Auto).unwrap(), DbSource::Local);
        assert_eq!(db.route(None, DbMode::Auto).unwrap(), DbSource::Local);
        assert_eq!(db.route(current, DbMode::Offline).unwrap(), DbSource::Local);
        assert!(matches!(
            db.route(current, DbMode::Cloud),
            Err(StorageError::CloudUnavailable)
        ));
    }

    #[tokio::test]
    async fn local_insert_query_update_roundtrip() {
        let dir = tempdir().expect("tempdir");
        let db = offline_manager(dir.path(), 2025);
        db.bootstrap_local_schema().await.expect("schema");

        db.execute(
            "INSERT INTO datos_personales (id_agente, nombre, apellido) VALUES (?, ?, ?)",
            &[
                SqlValue::Integer(1),
                SqlValue::from("Ana"),
                SqlValue::from("García"),
            ],
            None,
            DbMode::Local,
        )
        .await
        .expect("agente");
        db.execute(
            "INSERT INTO turnos (id_turno, tipo_turno) VALUES (?, ?)",
            &[SqlValue::Integer(1), SqlValue::from("mañana")],
            None,
            DbMode::Local,
        )
        .await
        .expect("turno");
        db.execute(
            "INSERT INTO planificacion (id_plani, fecha, id_turno) VALUES (?, ?, ?)",
            &[
                SqlValue::Integer(1),
                SqlValue::from("2025-12-15"),
                SqlValue::Integer(1),
            ],
            None,
            DbMode::Local,
        )
        .await
        .expect("planificacion");

        let id = db
            .insert_convocatoria(&NuevaConvocatoria {
                id_plani: 1,
                id_agente: 1,
                id_turno: 1,
                fecha_convocatoria: NaiveDate::from_ymd_opt(2025, 12, 15).unwrap(),
                estado: None,
            })
            .await
            .expect("insert convocatoria");
        assert!(id > 0);

        let result = db
            .query_convocatorias(&ConvocatoriaFilter {
                desde: NaiveDate::from_ymd_opt(2025, 1, 1),
                ..ConvocatoriaFilter::default()
            })
            .await
            .expect("query convocatorias");
        assert_eq!(result.row_count, 1);
        assert_eq!(result.source, DbSource::Local);
        let row = &result.rows[0];
        assert_eq!(row.get("estado").and_then(SqlValue::as_str), Some("vigente"));
        assert_eq!(
            row.get("agente_nombre").and_then(SqlValue::as_str),
            Some("Ana García")
        );

        let updated = db
            .update_convocatoria_estado(id, EstadoConvocatoria::Cancelada, Some("lluvia"))
            .await
            .expect("update estado");
        assert!(updated);

        let row = db
            .query_one(
                "SELECT estado, motivo_cambio FROM convocatoria WHERE id_convocatoria = ?",
                &[SqlValue::Integer(id)],
                None,
                DbMode::Local,
            )
            .await
            .expect("reread")
            .expect("row exists");
        assert_eq!(row.get("estado").and_then(SqlValue::as_str), Some("cancelada"));
        assert_eq!(
            row.get("motivo_cambio").and_then(SqlValue::as_str),
            Some("lluvia")
        );

        let missing = db
            .update_convocatoria_estado(9999, EstadoConvocatoria::Cancelada, None)
            .await
            .expect("update missing");
        assert!(!missing);
    }

    #[tokio::test]
    async fn saldos_del_mes_adds_the_nivel_band() {
        let dir = tempdir().expect("tempdir");
        let db = offline_manager(dir.path(), 2025);
        db.bootstrap_local_schema().await.expect("schema");

        for (id, nombre, horas) in [(1, "Ana", 45.0), (2, "Bruno", 75.0), (3, "Carla", 95.0)] {
            db.execute(
                "INSERT INTO datos_personales (id_agente, nombre, apellido) VALUES (?, ?, ?)",
                &[
                    SqlValue::Integer(id),
                    SqlValue::from(nombre),
                    SqlValue::from(format!("Apellido{id}")),
                ],
                None,
                DbMode::Local,
            )
            .await
            .expect("agente");
            db.execute(
                "INSERT INTO saldos (id_agente, anio, mes, horas_mes) VALUES (?, ?, ?, ?)",
                &[
                    SqlValue::Integer(id),
                    SqlValue::Integer(2025),
                    SqlValue::Integer(3),
                    SqlValue::Real(horas),
                ],
                None,
                DbMode::Local,
            )
            .await
            .expect("saldo");
        }

        let result = db.saldos_del_mes(3, Some(2025)).await.expect("saldos");
        assert_eq!(result.row_count, 3);
        let niveles: Vec<&str> = result
            .rows
            .iter()
            .map(|r| r.get("nivel").and_then(SqlValue::as_str).unwrap())
            .collect();
        assert_eq!(niveles, ["BAJO", "NORMAL", "ALTO"]);
    }

    #[tokio::test]
    async fn table_counts_capture_per_table_errors() {
        let dir = tempdir().expect("tempdir");
        let db = offline_manager(dir.path(), 2025);
        // No schema bootstrap: every count should error, none should panic.
        let counts = db.table_counts(DbMode::Local).await;
        assert_eq!(counts.len(), SYNC_TABLES.len());
        assert!(counts
            .values()
            .all(|count| matches!(count, TableCount::Error(_))));

        db.bootstrap_local_schema().await.expect("schema");
        let counts = db.table_counts(DbMode::Local).await;
        assert!(counts
            .values()
            .all(|count| matches!(count, TableCount::Rows(0))));
    }

    #[tokio::test]
    async fn test_connection_reports_both_sides() {
        let dir = tempdir().expect("tempdir");
        let db = offline_manager(dir.path(), 2025);
        db.bootstrap_local_schema().await.expect("schema");

        let (success, report) = db.test_connection().await;
        assert!(success);
        assert!(report.contains("cloud: not connected"));
        assert!(report.contains("local: ok"));
    }

    #[tokio::test]
    async fn insert_returning_uses_rowid_locally() {
        let dir = tempdir().expect("tempdir");
        let db = offline_manager(dir.path(), 2025);
        db.bootstrap_local_schema().await.expect("schema");

        let id = db
            .insert_returning(
                "INSERT INTO dispositivos (nombre_dispositivo, piso_dispositivo) VALUES (?, ?)",
                &[SqlValue::from("Telar"), SqlValue::from("PB")],
                None,
                "id_dispositivo",
            )
            .await
            .expect("insert");
        assert_eq!(id, 1);

        let next = db
            .insert_returning(
                "INSERT INTO dispositivos (nombre_dispositivo) VALUES (?)",
                &[SqlValue::from("Molienda")],
                None,
                "id_dispositivo",
            )
            .await
            .expect("insert 2");
        assert_eq!(next, 2);
    }

    #[tokio::test]
    async fn views_exist_after_bootstrap() {
        let dir = tempdir().expect("tempdir");
        let db = offline_manager(dir.path(), 2025);
        db.bootstrap_local_schema().await.expect("schema");

        let salud = db.salud_sistema().await.expect("salud").expect("one row");
        assert_eq!(
            salud.get("agentes_activos").and_then(SqlValue::as_i64),
            Some(0)
        );

        let activas = db.convocatorias_activas(None).await.expect("vista activas");
        assert_eq!(activas.row_count, 0);
    }
}
