//! Core domain model and table registry for the Molino HR system.

use std::collections::BTreeMap;

use chrono::{DateTime, Datelike, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

pub const CRATE_NAME: &str = "molino-core";

/// Backend-free SQL scalar. Both stores round-trip through this type so the
/// routing and sync layers never touch a driver-specific value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SqlValue {
    Null,
    Bool(bool),
    Integer(i64),
    Real(f64),
    Text(String),
}

impl SqlValue {
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            SqlValue::Integer(v) => Some(*v),
            SqlValue::Bool(v) => Some(i64::from(*v)),
            SqlValue::Text(v) => v.parse().ok(),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            SqlValue::Real(v) => Some(*v),
            SqlValue::Integer(v) => Some(*v as f64),
            SqlValue::Text(v) => v.parse().ok(),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            SqlValue::Text(v) => Some(v.as_str()),
            _ => None,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, SqlValue::Null)
    }
}

impl From<&str> for SqlValue {
    fn from(v: &str) -> Self {
        SqlValue::Text(v.to_string())
    }
}

impl From<String> for SqlValue {
    fn from(v: String) -> Self {
        SqlValue::Text(v)
    }
}

impl From<i64> for SqlValue {
    fn from(v: i64) -> Self {
        SqlValue::Integer(v)
    }
}

impl From<f64> for SqlValue {
    fn from(v: f64) -> Self {
        SqlValue::Real(v)
    }
}

impl From<bool> for SqlValue {
    fn from(v: bool) -> Self {
        SqlValue::Bool(v)
    }
}

impl From<NaiveDate> for SqlValue {
    fn from(v: NaiveDate) -> Self {
        SqlValue::Text(v.format("%Y-%m-%d").to_string())
    }
}

impl<T: Into<SqlValue>> From<Option<T>> for SqlValue {
    fn from(v: Option<T>) -> Self {
        v.map(Into::into).unwrap_or(SqlValue::Null)
    }
}

/// A decoded row. `BTreeMap` keeps column order deterministic, which the
/// sync layer relies on for stable checksums.
pub type SqlRow = BTreeMap<String, SqlValue>;

/// Extract the year from a `YYYY-MM-DD...` prefixed string. Returns `None`
/// for anything that does not parse; callers fall back to the current year.
pub fn year_of(fecha: &str) -> Option<i32> {
    let prefix = fecha.get(..10)?;
    NaiveDate::parse_from_str(prefix, "%Y-%m-%d")
        .ok()
        .map(|d| d.year())
}

/// Parse a store-rendered timestamp in any of the formats the two backends
/// emit (`CURRENT_TIMESTAMP` text, ISO-8601, bare dates).
pub fn parse_change_stamp(raw: &str) -> Option<DateTime<Utc>> {
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Some(ts.with_timezone(&Utc));
    }
    for fmt in ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f"] {
        if let Ok(ts) = chrono::NaiveDateTime::parse_from_str(raw, fmt) {
            return Some(ts.and_utc());
        }
    }
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|ts| ts.and_utc())
}

// ---------------------------------------------------------------------------
// Sync table registry
// ---------------------------------------------------------------------------

/// One synchronizable table: name, primary-key column and the column whose
/// value moves when the row changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TableSpec {
    pub name: &'static str,
    pub primary_key: &'static str,
    pub change_column: &'static str,
}

/// Tables in foreign-key dependency order; parents first so downloads can
/// insert without tripping constraints.
pub const SYNC_TABLES: [TableSpec; 12] = [
    TableSpec { name: "datos_personales", primary_key: "id_agente", change_column: "fecha_creacion" },
    TableSpec { name: "dispositivos", primary_key: "id_dispositivo", change_column: "fecha_creacion" },
    TableSpec { name: "turnos", primary_key: "id_turno", change_column: "fecha_creacion" },
    TableSpec { name: "dias", primary_key: "id_dia", change_column: "fecha_creacion" },
    TableSpec { name: "planificacion", primary_key: "id_plani", change_column: "fecha_modificacion" },
    TableSpec { name: "convocatoria", primary_key: "id_convocatoria", change_column: "fecha_modificacion" },
    TableSpec { name: "menu", primary_key: "id_menu", change_column: "fecha_registro" },
    TableSpec { name: "saldos", primary_key: "id_saldo", change_column: "fecha_actualizacion" },
    TableSpec { name: "inasistencias", primary_key: "id_inasistencia", change_column: "fecha_actualizacion_estado" },
    TableSpec { name: "certificados", primary_key: "id_certificado", change_column: "fecha_creacion" },
    TableSpec { name: "capacitaciones", primary_key: "id_cap", change_column: "fecha_creacion" },
    TableSpec { name: "capacitaciones_participantes", primary_key: "id_participante", change_column: "fecha_creacion" },
];

pub fn table_spec(name: &str) -> Option<&'static TableSpec> {
    SYNC_TABLES.iter().find(|spec| spec.name == name)
}

// ---------------------------------------------------------------------------
// Domain types
// ---------------------------------------------------------------------------

/// Lifecycle state of a convocatoria.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EstadoConvocatoria {
    Vigente,
    Cancelada,
    Reprogramada,
}

impl EstadoConvocatoria {
    pub fn as_str(self) -> &'static str {
        match self {
            EstadoConvocatoria::Vigente => "vigente",
            EstadoConvocatoria::Cancelada => "cancelada",
            EstadoConvocatoria::Reprogramada => "reprogramada",
        }
    }
}

/// Insert payload for a shift assignment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NuevaConvocatoria {
    pub id_plani: i64,
    pub id_agente: i64,
    pub id_turno: i64,
    pub fecha_convocatoria: NaiveDate,
    #[serde(default)]
    pub estado: Option<EstadoConvocatoria>,
}

/// Insert payload for an absence.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NuevaInasistencia {
    pub id_agente: i64,
    pub fecha_inasistencia: NaiveDate,
    #[serde(default)]
    pub motivo: Option<String>,
    #[serde(default)]
    pub observaciones: Option<String>,
}

/// Insert payload linking an agent, a device and a convocatoria.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NuevaAsignacionMenu {
    pub id_convocatoria: i64,
    pub id_dispositivo: i64,
    pub id_agente: i64,
    pub fecha_asignacion: NaiveDate,
    #[serde(default)]
    pub orden: Option<i64>,
}

/// Monthly-hours band used by the saldos views.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum NivelHoras {
    Bajo,
    Normal,
    Alto,
}

impl NivelHoras {
    pub fn from_horas(horas_mes: f64) -> Self {
        if horas_mes < 60.0 {
            NivelHoras::Bajo
        } else if horas_mes >= 90.0 {
            NivelHoras::Alto
        } else {
            NivelHoras::Normal
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            NivelHoras::Bajo => "BAJO",
            NivelHoras::Normal => "NORMAL",
            NivelHoras::Alto => "ALTO",
        }
    }
}
