//! Bidirectional Supabase ↔ SQLite sync engine.
//!
//! Change detection walks the table registry comparing change-timestamp
//! columns against the last successful run; rows are fingerprinted with a
//! checksum so a record edited on both sides since then surfaces as a
//! conflict instead of being overwritten blindly.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use molino_core::{parse_change_stamp, SqlRow, SqlValue, SYNC_TABLES};
use molino_storage::{DbMode, StorageConfig, UnifiedDbManager};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::fs;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{info, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "molino-sync";

/// Lower bound used when no previous sync exists.
const NEVER_SYNCED: &str = "2000-01-01 00:00:00";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncDirection {
    Download,
    Upload,
    Bidirectional,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictPolicy {
    CloudWins,
    LocalWins,
    NewestWins,
    Manual,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeOrigin {
    Local,
    Cloud,
}

/// One changed row, as detected on one side.
#[derive(Debug, Clone, Serialize)]
pub struct SyncRecord {
    pub table: String,
    pub record_id: i64,
    pub origin: ChangeOrigin,
    pub row: SqlRow,
    /// Value of the table's change column, when the row carries one.
    pub change_stamp: Option<DateTime<Utc>>,
    pub observed_at: DateTime<Utc>,
    pub checksum: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncOutcome {
    pub run_id: Uuid,
    pub success: bool,
    pub downloaded: usize,
    pub uploaded: usize,
    pub conflicts: usize,
    pub errors: Vec<String>,
    pub duration_seconds: f64,
    pub finished_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncStatusReport {
    pub last_sync: Option<DateTime<Utc>>,
    pub pending_uploads: usize,
    pub pending_downloads: usize,
    pub conflicts: usize,
    pub is_synced: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct ChangeRef {
    pub table: String,
    pub record_id: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncPreview {
    pub will_download: usize,
    pub will_upload: usize,
    pub potential_conflicts: usize,
    pub tables_affected: Vec<String>,
    pub download_detail: Vec<ChangeRef>,
    pub upload_detail: Vec<ChangeRef>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ConflictView {
    pub table: String,
    pub record_id: i64,
    pub local_row: SqlRow,
    pub cloud_row: SqlRow,
    pub local_stamp: Option<DateTime<Utc>>,
    pub cloud_stamp: Option<DateTime<Utc>>,
}

/// Registry entry; mirrors [`molino_core::TableSpec`] but owned so the YAML
/// override can replace the built-in list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableEntry {
    pub name: String,
    pub primary_key: String,
    pub change_column: String,
}

#[derive(Debug, Clone, Deserialize)]
struct RegistryFile {
    tables: Vec<TableEntry>,
}

pub fn builtin_registry() -> Vec<TableEntry> {
    SYNC_TABLES
        .iter()
        .map(|spec| TableEntry {
            name: spec.name.to_string(),
            primary_key: spec.primary_key.to_string(),
            change_column: spec.change_column.to_string(),
        })
        .collect()
}

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub state_path: PathBuf,
    /// Optional YAML file replacing the built-in table registry.
    pub registry_path: Option<PathBuf>,
    pub policy: ConflictPolicy,
    pub scheduler_enabled: bool,
    pub sync_cron_1: String,
    pub sync_cron_2: String,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            state_path: PathBuf::from("data/sync_log.json"),
            registry_path: None,
            policy: ConflictPolicy::NewestWins,
            scheduler_enabled: false,
            sync_cron_1: "0 6 * * *".to_string(),
            sync_cron_2: "0 18 * * *".to_string(),
        }
    }
}

impl SyncConfig {
    pub fn from_env() -> Self {
        let policy = match std::env::var("MOLINO_CONFLICT_POLICY").as_deref() {
            Ok("cloud") => ConflictPolicy::CloudWins,
            Ok("local") => ConflictPolicy::LocalWins,
            Ok("manual") => ConflictPolicy::Manual,
            _ => ConflictPolicy::NewestWins,
        };
        Self {
            state_path: std::env::var("MOLINO_SYNC_LOG")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("data/sync_log.json")),
            registry_path: std::env::var("MOLINO_SYNC_TABLES").ok().map(PathBuf::from),
            policy,
            scheduler_enabled: std::env::var("MOLINO_SCHEDULER_ENABLED")
                .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(false),
            sync_cron_1: std::env::var("MOLINO_SYNC_CRON_1")
                .unwrap_or_else(|_| "0 6 * * *".to_string()),
            sync_cron_2: std::env::var("MOLINO_SYNC_CRON_2")
                .unwrap_or_else(|_| "0 18 * * *".to_string()),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct SyncState {
    last_sync: Option<DateTime<Utc>>,
    last_result: Option<SyncOutcome>,
}

fn is_volatile_column(name: &str) -> bool {
    name.ends_with("_timestamp") || name.ends_with("_modificacion")
}

/// Fingerprint a row's payload. Volatile timestamp columns are excluded so
/// the same data written on both sides hashes identically.
pub fn row_checksum(row: &SqlRow) -> Result<String> {
    let filtered: SqlRow = row
        .iter()
        .filter(|(name, _)| !is_volatile_column(name))
        .map(|(name, value)| (name.clone(), value.clone()))
        .collect();
    let serialized = serde_json::to_string(&filtered).context("serializing row for checksum")?;
    let mut hasher = Sha256::new();
    hasher.update(serialized.as_bytes());
    Ok(hex::encode(hasher.finalize()))
}

/// Same record changed on both sides with diverging payloads.
pub fn detect_conflicts(
    local: &[SyncRecord],
    cloud: &[SyncRecord],
) -> Vec<(SyncRecord, SyncRecord)> {
    let mut out = Vec::new();
    for l in local {
        for c in cloud {
            if l.table == c.table && l.record_id == c.record_id && l.checksum != c.checksum {
                out.push((l.clone(), c.clone()));
            }
        }
    }
    out
}

/// Which side survives a conflict. `None` means the policy defers to manual
/// resolution. Newest-wins compares the rows' own change stamps; a missing
/// stamp on either side falls back to the cloud copy.
pub fn choose_winner(
    local: &SyncRecord,
    cloud: &SyncRecord,
    policy: ConflictPolicy,
) -> Option<ChangeOrigin> {
    match policy {
        ConflictPolicy::CloudWins => Some(ChangeOrigin::Cloud),
        ConflictPolicy::LocalWins => Some(ChangeOrigin::Local),
        ConflictPolicy::NewestWins => match (local.change_stamp, cloud.change_stamp) {
            (Some(l), Some(c)) if l > c => Some(ChangeOrigin::Local),
            _ => Some(ChangeOrigin::Cloud),
        },
        ConflictPolicy::Manual => None,
    }
}

const BOOLEAN_MARKERS: [&str; 11] = [
    "activo",
    "feriado",
    "requiere",
    "asistio",
    "aprobado",
    "resolved",
    "recurring",
    "bloqueante",
    "alerta",
    "custom",
    "grupo",
];

/// SQLite stores booleans as 0/1 integers; PostgreSQL wants real booleans.
/// Column names tell us which integers are flags.
pub fn convert_bools_for_cloud(row: &SqlRow) -> SqlRow {
    row.iter()
        .map(|(name, value)| {
            let lowered = name.to_ascii_lowercase();
            let converted = match value {
                SqlValue::Integer(v @ (0 | 1))
                    if BOOLEAN_MARKERS.iter().any(|marker| lowered.contains(marker)) =>
                {
                    SqlValue::Bool(*v == 1)
                }
                other => other.clone(),
            };
            (name.clone(), converted)
        })
        .collect()
}

fn load_registry(path: Option<&Path>) -> Result<Vec<TableEntry>> {
    let Some(path) = path else {
        return Ok(builtin_registry());
    };
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("reading {}", path.display()))?;
    let parsed: RegistryFile =
        serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))?;
    Ok(parsed.tables)
}

fn load_last_sync(path: &Path) -> Option<DateTime<Utc>> {
    let text = std::fs::read_to_string(path).ok()?;
    match serde_json::from_str::<SyncState>(&text) {
        Ok(state) => state.last_sync,
        Err(err) => {
            warn!(error = %err, path = %path.display(), "unreadable sync state, assuming never synced");
            None
        }
    }
}

pub struct SyncManager {
    db: Arc<UnifiedDbManager>,
    config: SyncConfig,
    tables: Vec<TableEntry>,
    last_sync: Option<DateTime<Utc>>,
    conflicts: Vec<(SyncRecord, SyncRecord)>,
}

impl SyncManager {
    pub fn new(db: Arc<UnifiedDbManager>, config: SyncConfig) -> Result<Self> {
        let tables = load_registry(config.registry_path.as_deref())?;
        let last_sync = load_last_sync(&config.state_path);
        info!(tables = tables.len(), ?last_sync, "sync manager ready");
        Ok(Self {
            db,
            config,
            tables,
            last_sync,
            conflicts: Vec::new(),
        })
    }

    pub fn last_sync(&self) -> Option<DateTime<Utc>> {
        self.last_sync
    }

    // -----------------------------------------------------------------------
    // Change detection
    // -----------------------------------------------------------------------

    async fn detect_changes(
        &self,
        origin: ChangeOrigin,
        since: Option<DateTime<Utc>>,
        tables: Option<&[String]>,
    ) -> Vec<SyncRecord> {
        let bound = since
            .map(|ts| ts.format("%Y-%m-%d %H:%M:%S").to_string())
            .unwrap_or_else(|| NEVER_SYNCED.to_string());
        let mode = match origin {
            ChangeOrigin::Local => DbMode::Local,
            ChangeOrigin::Cloud => DbMode::Cloud,
        };

        let mut changes = Vec::new();
        for entry in &self.tables {
            if let Some(filter) = tables {
                if !filter.iter().any(|t| t == &entry.name) {
                    continue;
                }
            }

            // Both stores render timestamps differently: SQLite compares
            // CURRENT_TIMESTAMP text, PostgreSQL needs a typed bound.
            let sql = match origin {
                ChangeOrigin::Cloud => format!(
                    "SELECT * FROM {} WHERE {} > CAST(? AS TIMESTAMP)",
                    entry.name, entry.change_column
                ),
                ChangeOrigin::Local => format!(
                    "SELECT * FROM {} WHERE {} > ?",
                    entry.name, entry.change_column
                ),
            };

            let result = match self
                .db
                .query(&sql, &[SqlValue::from(bound.clone())], None, mode)
                .await
            {
                Ok(result) => result,
                Err(err) => {
                    warn!(table = entry.name.as_str(), error = %err, "change detection failed");
                    continue;
                }
            };

            for row in result.rows {
                let Some(record_id) = row.get(&entry.primary_key).and_then(SqlValue::as_i64)
                else {
                    warn!(table = entry.name.as_str(), "row without primary key skipped");
                    continue;
                };
                let checksum = match row_checksum(&row) {
                    Ok(checksum) => checksum,
                    Err(err) => {
                        warn!(table = entry.name.as_str(), record_id, error = %err, "row checksum failed");
                        continue;
                    }
                };
                let change_stamp = row
                    .get(&entry.change_column)
                    .and_then(SqlValue::as_str)
                    .and_then(parse_change_stamp);
                changes.push(SyncRecord {
                    table: entry.name.clone(),
                    record_id,
                    origin,
                    row,
                    change_stamp,
                    observed_at: Utc::now(),
                    checksum,
                });
            }
        }
        changes
    }

    // -----------------------------------------------------------------------
    // Apply
    // -----------------------------------------------------------------------

    /// Upsert one record into the given side: probe by primary key, then
    /// UPDATE or INSERT with the row's own column list.
    async fn apply_record(&self, record: &SyncRecord, target: ChangeOrigin) -> Result<()> {
        let entry = self
            .tables
            .iter()
            .find(|t| t.name == record.table)
            .with_context(|| format!("table {} not in registry", record.table))?;
        let mode = match target {
            ChangeOrigin::Local => DbMode::Local,
            ChangeOrigin::Cloud => DbMode::Cloud,
        };
        let row = match target {
            ChangeOrigin::Cloud => convert_bools_for_cloud(&record.row),
            ChangeOrigin::Local => record.row.clone(),
        };
        let pk = entry.primary_key.as_str();

        let exists = self
            .db
            .query_one(
                &format!("SELECT {pk} FROM {} WHERE {pk} = ?", record.table),
                &[SqlValue::Integer(record.record_id)],
                None,
                mode,
            )
            .await?
            .is_some();

        if exists {
            let columns: Vec<&str> = row
                .keys()
                .map(String::as_str)
                .filter(|name| *name != pk)
                .collect();
            if columns.is_empty() {
                return Ok(());
            }
            let set_clause = columns
                .iter()
                .map(|name| format!("{name} = ?"))
                .collect::<Vec<_>>()
                .join(", ");
            let mut params: Vec<SqlValue> = columns
                .iter()
                .map(|name| row.get(*name).cloned().unwrap_or(SqlValue::Null))
                .collect();
            params.push(SqlValue::Integer(record.record_id));
            self.db
                .execute(
                    &format!("UPDATE {} SET {set_clause} WHERE {pk} = ?", record.table),
                    &params,
                    None,
                    mode,
                )
                .await?;
        } else {
            let columns: Vec<&str> = row.keys().map(String::as_str).collect();
            let column_list = columns.join(", ");
            let placeholders = vec!["?"; columns.len()].join(", ");
            let params: Vec<SqlValue> = columns
                .iter()
                .map(|name| row.get(*name).cloned().unwrap_or(SqlValue::Null))
                .collect();
            self.db
                .execute(
                    &format!(
                        "INSERT INTO {} ({column_list}) VALUES ({placeholders})",
                        record.table
                    ),
                    &params,
                    None,
                    mode,
                )
                .await?;
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Sync runs
    // -----------------------------------------------------------------------

    pub async fn sync(
        &mut self,
        direction: SyncDirection,
        tables: Option<&[String]>,
        force: bool,
    ) -> Result<SyncOutcome> {
        let started = Instant::now();
        let run_id = Uuid::new_v4();
        let mut errors: Vec<String> = Vec::new();
        let mut downloaded = 0usize;
        let mut uploaded = 0usize;

        info!(%run_id, ?direction, force, "sync starting");

        if !self.db.is_cloud_connected() {
            return Ok(SyncOutcome {
                run_id,
                success: false,
                downloaded: 0,
                uploaded: 0,
                conflicts: 0,
                errors: vec!["cloud is not connected".to_string()],
                duration_seconds: started.elapsed().as_secs_f64(),
                finished_at: Utc::now(),
            });
        }

        let since = if force { None } else { self.last_sync };

        let cloud_changes = if matches!(
            direction,
            SyncDirection::Download | SyncDirection::Bidirectional
        ) {
            let changes = self.detect_changes(ChangeOrigin::Cloud, since, tables).await;
            info!(count = changes.len(), "cloud changes detected");
            changes
        } else {
            Vec::new()
        };

        let local_changes = if matches!(
            direction,
            SyncDirection::Upload | SyncDirection::Bidirectional
        ) {
            let changes = self.detect_changes(ChangeOrigin::Local, since, tables).await;
            info!(count = changes.len(), "local changes detected");
            changes
        } else {
            Vec::new()
        };

        if direction == SyncDirection::Bidirectional {
            self.conflicts = detect_conflicts(&local_changes, &cloud_changes);
            if !self.conflicts.is_empty() {
                info!(count = self.conflicts.len(), "conflicts detected");
            }
        }

        let conflicted: BTreeSet<(&str, i64)> = self
            .conflicts
            .iter()
            .map(|(local, _)| (local.table.as_str(), local.record_id))
            .collect();

        for change in &cloud_changes {
            if conflicted.contains(&(change.table.as_str(), change.record_id)) {
                continue;
            }
            match self.apply_record(change, ChangeOrigin::Local).await {
                Ok(()) => downloaded += 1,
                Err(err) => errors.push(format!(
                    "download {}#{}: {err:#}",
                    change.table, change.record_id
                )),
            }
        }

        for change in &local_changes {
            if conflicted.contains(&(change.table.as_str(), change.record_id)) {
                continue;
            }
            match self.apply_record(change, ChangeOrigin::Cloud).await {
                Ok(()) => uploaded += 1,
                Err(err) => errors.push(format!(
                    "upload {}#{}: {err:#}",
                    change.table, change.record_id
                )),
            }
        }

        if self.config.policy != ConflictPolicy::Manual && !self.conflicts.is_empty() {
            let resolved = self.resolve_pending(&mut errors).await;
            info!(resolved, "conflicts auto-resolved");
        }

        let outcome = SyncOutcome {
            run_id,
            success: errors.is_empty(),
            downloaded,
            uploaded,
            conflicts: self.conflicts.len(),
            errors,
            duration_seconds: started.elapsed().as_secs_f64(),
            finished_at: Utc::now(),
        };

        if outcome.success {
            self.last_sync = Some(outcome.finished_at);
            if let Err(err) = self.save_state(&outcome).await {
                warn!(error = %err, "could not persist sync state");
            }
        }

        info!(
            downloaded = outcome.downloaded,
            uploaded = outcome.uploaded,
            conflicts = outcome.conflicts,
            success = outcome.success,
            "sync finished"
        );
        Ok(outcome)
    }

    pub async fn sync_download(&mut self, tables: Option<&[String]>) -> Result<SyncOutcome> {
        self.sync(SyncDirection::Download, tables, false).await
    }

    pub async fn sync_upload(&mut self, tables: Option<&[String]>) -> Result<SyncOutcome> {
        self.sync(SyncDirection::Upload, tables, false).await
    }

    pub async fn full_sync(&mut self, force: bool) -> Result<SyncOutcome> {
        self.sync(SyncDirection::Bidirectional, None, force).await
    }

    // -----------------------------------------------------------------------
    // Conflict resolution
    // -----------------------------------------------------------------------

    async fn resolve_pending(&mut self, errors: &mut Vec<String>) -> usize {
        let mut resolved = 0usize;
        let mut remaining = Vec::new();
        let pending = std::mem::take(&mut self.conflicts);

        for (local, cloud) in pending {
            let outcome = match choose_winner(&local, &cloud, self.config.policy) {
                Some(ChangeOrigin::Local) => self.apply_record(&local, ChangeOrigin::Cloud).await,
                Some(ChangeOrigin::Cloud) => self.apply_record(&cloud, ChangeOrigin::Local).await,
                None => {
                    remaining.push((local, cloud));
                    continue;
                }
            };
            match outcome {
                Ok(()) => resolved += 1,
                Err(err) => {
                    errors.push(format!(
                        "conflict {}#{}: {err:#}",
                        local.table, local.record_id
                    ));
                    remaining.push((local, cloud));
                }
            }
        }

        self.conflicts = remaining;
        resolved
    }

    pub fn conflicts(&self) -> Vec<ConflictView> {
        self.conflicts
            .iter()
            .map(|(local, cloud)| ConflictView {
                table: local.table.clone(),
                record_id: local.record_id,
                local_row: local.row.clone(),
                cloud_row: cloud.row.clone(),
                local_stamp: local.change_stamp,
                cloud_stamp: cloud.change_stamp,
            })
            .collect()
    }

    /// Resolve a single pending conflict by hand, keeping one side.
    pub async fn resolve_conflict(
        &mut self,
        table: &str,
        record_id: i64,
        keep: ChangeOrigin,
    ) -> Result<bool> {
        let Some(idx) = self
            .conflicts
            .iter()
            .position(|(local, _)| local.table == table && local.record_id == record_id)
        else {
            return Ok(false);
        };
        let (local, cloud) = self.conflicts[idx].clone();
        match keep {
            ChangeOrigin::Cloud => self.apply_record(&cloud, ChangeOrigin::Local).await?,
            ChangeOrigin::Local => self.apply_record(&local, ChangeOrigin::Cloud).await?,
        }
        self.conflicts.remove(idx);
        Ok(true)
    }

    // -----------------------------------------------------------------------
    // Inspection
    // -----------------------------------------------------------------------

    pub async fn check_sync_needed(&self) -> bool {
        if !self.db.is_cloud_connected() {
            return false;
        }
        if !self
            .detect_changes(ChangeOrigin::Local, self.last_sync, None)
            .await
            .is_empty()
        {
            return true;
        }
        !self
            .detect_changes(ChangeOrigin::Cloud, self.last_sync, None)
            .await
            .is_empty()
    }

    pub async fn status(&self) -> SyncStatusReport {
        let local = self
            .detect_changes(ChangeOrigin::Local, self.last_sync, None)
            .await;
        let cloud = if self.db.is_cloud_connected() {
            self.detect_changes(ChangeOrigin::Cloud, self.last_sync, None)
                .await
        } else {
            Vec::new()
        };
        let conflicts = detect_conflicts(&local, &cloud).len();
        SyncStatusReport {
            last_sync: self.last_sync,
            pending_uploads: local.len(),
            pending_downloads: cloud.len(),
            conflicts,
            is_synced: local.is_empty() && cloud.is_empty() && conflicts == 0,
        }
    }

    /// What a bidirectional run would do, without writing anything.
    pub async fn preview(&mut self) -> SyncPreview {
        let local = self
            .detect_changes(ChangeOrigin::Local, self.last_sync, None)
            .await;
        let cloud = if self.db.is_cloud_connected() {
            self.detect_changes(ChangeOrigin::Cloud, self.last_sync, None)
                .await
        } else {
            Vec::new()
        };

        let mut tables_affected: BTreeSet<String> = BTreeSet::new();
        let download_detail = cloud
            .iter()
            .map(|change| {
                tables_affected.insert(change.table.clone());
                ChangeRef {
                    table: change.table.clone(),
                    record_id: change.record_id,
                }
            })
            .collect();
        let upload_detail = local
            .iter()
            .map(|change| {
                tables_affected.insert(change.table.clone());
                ChangeRef {
                    table: change.table.clone(),
                    record_id: change.record_id,
                }
            })
            .collect();

        self.conflicts = detect_conflicts(&local, &cloud);
        SyncPreview {
            will_download: cloud.len(),
            will_upload: local.len(),
            potential_conflicts: self.conflicts.len(),
            tables_affected: tables_affected.into_iter().collect(),
            download_detail,
            upload_detail,
        }
    }

    // -----------------------------------------------------------------------
    // State persistence
    // -----------------------------------------------------------------------

    async fn save_state(&self, outcome: &SyncOutcome) -> Result<()> {
        let state = SyncState {
            last_sync: self.last_sync,
            last_result: Some(outcome.clone()),
        };
        if let Some(parent) = self.config.state_path.parent() {
            fs::create_dir_all(parent)
                .await
                .with_context(|| format!("creating {}", parent.display()))?;
        }
        let bytes = serde_json::to_vec_pretty(&state).context("serializing sync state")?;
        fs::write(&self.config.state_path, bytes)
            .await
            .with_context(|| format!("writing {}", self.config.state_path.display()))?;
        Ok(())
    }
}

/// Build the cron scheduler when enabled; each tick runs a full
/// bidirectional sync.
pub async fn maybe_build_scheduler(
    manager: Arc<tokio::sync::Mutex<SyncManager>>,
    config: &SyncConfig,
) -> Result<Option<JobScheduler>> {
    if !config.scheduler_enabled {
        return Ok(None);
    }

    let sched = JobScheduler::new().await.context("creating scheduler")?;
    for cron in [&config.sync_cron_1, &config.sync_cron_2] {
        let manager = manager.clone();
        let job = Job::new_async(cron.as_str(), move |_uuid, _lock| {
            let manager = manager.clone();
            Box::pin(async move {
                let mut guard = manager.lock().await;
                match guard.full_sync(false).await {
                    Ok(outcome) => info!(
                        downloaded = outcome.downloaded,
                        uploaded = outcome.uploaded,
                        success = outcome.success,
                        "scheduled sync finished"
                    ),
                    Err(err) => warn!(error = %err, "scheduled sync failed"),
                }
            })
        })
        .with_context(|| format!("creating scheduler job for cron {cron}"))?;
        sched.add(job).await.context("adding scheduler job")?;
    }
    Ok(Some(sched))
}

/// Convenience entry point for the CLI: env-configured manager + one full
/// bidirectional run.
pub async fn run_sync_once_from_env() -> Result<SyncOutcome> {
    let db = Arc::new(UnifiedDbManager::connect(StorageConfig::from_env()).await?);
    let mut manager = SyncManager::new(db, SyncConfig::from_env())?;
    manager.full_sync(false).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use molino_storage::DbSource;
    use tempfile::tempdir;

    fn row(pairs: &[(&str, SqlValue)]) -> SqlRow {
        pairs
            .iter()
            .map(|(name, value)| (name.to_string(), value.clone()))
            .collect()
    }

    fn record(table: &str, id: i64, origin: ChangeOrigin, data: SqlRow) -> SyncRecord {
        let checksum = row_checksum(&data).expect("checksum");
        SyncRecord {
            table: table.to_string(),
            record_id: id,
            origin,
            row: data,
            change_stamp: None,
            observed_at: Utc::now(),
            checksum,
        }
    }

    #[test]
    fn checksum_ignores_volatile_columns() {
        let a = row(&[
            ("id_convocatoria", SqlValue::Integer(1)),
            ("estado", SqlValue::from("vigente")),
            ("fecha_modificacion", SqlValue::from("2025-01-01 10:00:00")),
        ]);
        let b = row(&[
            ("id_convocatoria", SqlValue::Integer(1)),
            ("estado", SqlValue::from("vigente")),
            ("fecha_modificacion", SqlValue::from("2025-06-30 23:59:59")),
        ]);
        assert_eq!(row_checksum(&a).unwrap(), row_checksum(&b).unwrap());

        let c = row(&[
            ("id_convocatoria", SqlValue::Integer(1)),
            ("estado", SqlValue::from("cancelada")),
        ]);
        assert_ne!(row_checksum(&a).unwrap(), row_checksum(&c).unwrap());
    }

    #[test]
    fn conflicts_require_same_key_and_diverging_payload() {
        let local = vec![record(
            "convocatoria",
            1,
            ChangeOrigin::Local,
            row(&[("id_convocatoria", SqlValue::Integer(1)), ("estado", SqlValue::from("vigente"))]),
        )];
        let cloud_same = vec![record(
            "convocatoria",
            1,
            ChangeOrigin::Cloud,
            row(&[("id_convocatoria", SqlValue::Integer(1)), ("estado", SqlValue::from("vigente"))]),
        )];
        let cloud_diverged = vec![record(
            "convocatoria",
            1,
            ChangeOrigin::Cloud,
            row(&[("id_convocatoria", SqlValue::Integer(1)), ("estado", SqlValue::from("cancelada"))]),
        )];
        let cloud_other_table = vec![record(
            "saldos",
            1,
            ChangeOrigin::Cloud,
            row(&[("id_saldo", SqlValue::Integer(1)), ("horas_mes", SqlValue::Real(10.0))]),
        )];

        assert!(detect_conflicts(&local, &cloud_same).is_empty());
        assert_eq!(detect_conflicts(&local, &cloud_diverged).len(), 1);
        assert!(detect_conflicts(&local, &cloud_other_table).is_empty());
    }

    #[test]
    fn winner_selection_per_policy() {
        let stamp = |h| Utc.with_ymd_and_hms(2025, 5, 1, h, 0, 0).single().unwrap();
        let mut local = record(
            "convocatoria",
            1,
            ChangeOrigin::Local,
            row(&[("estado", SqlValue::from("vigente"))]),
        );
        let mut cloud = record(
            "convocatoria",
            1,
            ChangeOrigin::Cloud,
            row(&[("estado", SqlValue::from("cancelada"))]),
        );

        assert_eq!(
            choose_winner(&local, &cloud, ConflictPolicy::CloudWins),
            Some(ChangeOrigin::Cloud)
        );
        assert_eq!(
            choose_winner(&local, &cloud, ConflictPolicy::LocalWins),
            Some(ChangeOrigin::Local)
        );
        assert_eq!(choose_winner(&local, &cloud, ConflictPolicy::Manual), None);

        local.change_stamp = Some(stamp(12));
        cloud.change_stamp = Some(stamp(9));
        assert_eq!(
            choose_winner(&local, &cloud, ConflictPolicy::NewestWins),
            Some(ChangeOrigin::Local)
        );
        cloud.change_stamp = Some(stamp(15));
        assert_eq!(
            choose_winner(&local, &cloud, ConflictPolicy::NewestWins),
            Some(ChangeOrigin::Cloud)
        );
        // Missing stamps fall back to the cloud copy.
        local.change_stamp = None;
        assert_eq!(
            choose_winner(&local, &cloud, ConflictPolicy::NewestWins),
            Some(ChangeOrigin::Cloud)
        );
    }

    #[test]
    fn boolean_markers_promote_flag_columns_only() {
        let converted = convert_bools_for_cloud(&row(&[
            ("activo", SqlValue::Integer(1)),
            ("asistio", SqlValue::Integer(0)),
            ("orden", SqlValue::Integer(1)),
            ("horas_mes", SqlValue::Real(1.0)),
            ("id_agente", SqlValue::Integer(0)),
        ]));
        assert_eq!(converted["activo"], SqlValue::Bool(true));
        assert_eq!(converted["asistio"], SqlValue::Bool(false));
        assert_eq!(converted["orden"], SqlValue::Integer(1));
        assert_eq!(converted["horas_mes"], SqlValue::Real(1.0));
        assert_eq!(converted["id_agente"], SqlValue::Integer(0));
    }

    #[test]
    fn registry_override_replaces_builtin() {
        let builtin = builtin_registry();
        assert_eq!(builtin.len(), 12);
        assert_eq!(builtin[0].name, "datos_personales");

        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("sync_tables.yaml");
        std::fs::write(
            &path,
            "tables:\n  - name: convocatoria\n    primary_key: id_convocatoria\n    change_column: fecha_modificacion\n",
        )
        .expect("write registry");
        let loaded = load_registry(Some(&path)).expect("load registry");
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].change_column, "fecha_modificacion");

        assert!(load_registry(Some(Path::new("/nonexistent/registry.yaml"))).is_err());
    }

    async fn offline_manager(dir: &Path) -> (Arc<UnifiedDbManager>, SyncManager) {
        let db = Arc::new(
            UnifiedDbManager::offline(StorageConfig {
                sqlite_dir: dir.to_path_buf(),
                current_year: 2025,
                offline: true,
                ..StorageConfig::default()
            })
            .expect("offline manager"),
        );
        db.bootstrap_local_schema().await.expect("schema");
        let sync = SyncManager::new(
            db.clone(),
            SyncConfig {
                state_path: dir.join("sync_log.json"),
                ..SyncConfig::default()
            },
        )
        .expect("sync manager");
        (db, sync)
    }

    #[tokio::test]
    async fn local_changes_are_detected_and_fingerprinted() {
        let dir = tempdir().expect("tempdir");
        let (db, sync) = offline_manager(dir.path()).await;

        db.execute(
            "INSERT INTO datos_personales (id_agente, nombre, apellido) VALUES (?, ?, ?)",
            &[SqlValue::Integer(1), SqlValue::from("Ana"), SqlValue::from("García")],
            None,
            DbMode::Local,
        )
        .await
        .expect("insert");

        let changes = sync.detect_changes(ChangeOrigin::Local, None, None).await;
        assert_eq!(changes.len(), 1);
        let change = &changes[0];
        assert_eq!(change.table, "datos_personales");
        assert_eq!(change.record_id, 1);
        assert_eq!(change.origin, ChangeOrigin::Local);
        assert!(change.change_stamp.is_some());
        assert_eq!(change.checksum.len(), 64);

        // A future bound sees nothing.
        let later = Utc.with_ymd_and_hms(2099, 1, 1, 0, 0, 0).single().unwrap();
        let changes = sync.detect_changes(ChangeOrigin::Local, Some(later), None).await;
        assert!(changes.is_empty());

        // Table filter narrows the scan.
        let filter = vec!["saldos".to_string()];
        let changes = sync
            .detect_changes(ChangeOrigin::Local, None, Some(&filter))
            .await;
        assert!(changes.is_empty());
    }

    #[tokio::test]
    async fn apply_record_inserts_then_updates() {
        let dir = tempdir().expect("tempdir");
        let (db, sync) = offline_manager(dir.path()).await;

        let incoming = record(
            "datos_personales",
            7,
            ChangeOrigin::Cloud,
            row(&[
                ("id_agente", SqlValue::Integer(7)),
                ("nombre", SqlValue::from("Bruno")),
                ("apellido", SqlValue::from("Paz")),
                ("activo", SqlValue::Integer(1)),
            ]),
        );
        sync.apply_record(&incoming, ChangeOrigin::Local)
            .await
            .expect("insert path");

        let stored = db
            .query_one(
                "SELECT nombre FROM datos_personales WHERE id_agente = ?",
                &[SqlValue::Integer(7)],
                None,
                DbMode::Local,
            )
            .await
            .expect("query")
            .expect("row");
        assert_eq!(stored.get("nombre").and_then(SqlValue::as_str), Some("Bruno"));

        let renamed = record(
            "datos_personales",
            7,
            ChangeOrigin::Cloud,
            row(&[
                ("id_agente", SqlValue::Integer(7)),
                ("nombre", SqlValue::from("Bruno José")),
                ("apellido", SqlValue::from("Paz")),
                ("activo", SqlValue::Integer(1)),
            ]),
        );
        sync.apply_record(&renamed, ChangeOrigin::Local)
            .await
            .expect("update path");

        let result = db
            .query(
                "SELECT nombre FROM datos_personales",
                &[],
                None,
                DbMode::Local,
            )
            .await
            .expect("query all");
        assert_eq!(result.row_count, 1);
        assert_eq!(result.source, DbSource::Local);
        assert_eq!(
            result.rows[0].get("nombre").and_then(SqlValue::as_str),
            Some("Bruno José")
        );
    }

    #[tokio::test]
    async fn sync_without_cloud_fails_fast() {
        let dir = tempdir().expect("tempdir");
        let (_db, mut sync) = offline_manager(dir.path()).await;

        let outcome = sync.full_sync(false).await.expect("outcome");
        assert!(!outcome.success);
        assert_eq!(outcome.downloaded, 0);
        assert_eq!(outcome.uploaded, 0);
        assert_eq!(outcome.errors, vec!["cloud is not connected".to_string()]);
        // A failed run never advances the watermark.
        assert!(sync.last_sync().is_none());
        assert!(!dir.path().join("sync_log.json").exists());
    }

    #[tokio::test]
    async fn state_file_roundtrip() {
        let dir = tempdir().expect("tempdir");
        let (db, mut sync) = offline_manager(dir.path()).await;

        let finished_at = Utc.with_ymd_and_hms(2025, 4, 1, 6, 0, 0).single().unwrap();
        sync.last_sync = Some(finished_at);
        let outcome = SyncOutcome {
            run_id: Uuid::new_v4(),
            success: true,
            downloaded: 3,
            uploaded: 2,
            conflicts: 0,
            errors: vec![],
            duration_seconds: 1.5,
            finished_at,
        };
        sync.save_state(&outcome).await.expect("save");

        let reloaded = SyncManager::new(
            db,
            SyncConfig {
                state_path: dir.path().join("sync_log.json"),
                ..SyncConfig::default()
            },
        )
        .expect("reload");
        assert_eq!(reloaded.last_sync(), Some(finished_at));

        // Corrupt state degrades to never-synced instead of failing.
        std::fs::write(dir.path().join("sync_log.json"), "{not json").expect("corrupt");
        assert_eq!(load_last_sync(&dir.path().join("sync_log.json")), None);
    }

    #[tokio::test]
    async fn manual_resolution_applies_the_kept_side() {
        let dir = tempdir().expect("tempdir");
        let (db, mut sync) = offline_manager(dir.path()).await;

        let local = record(
            "datos_personales",
            3,
            ChangeOrigin::Local,
            row(&[
                ("id_agente", SqlValue::Integer(3)),
                ("nombre", SqlValue::from("Laura")),
                ("apellido", SqlValue::from("Núñez")),
            ]),
        );
        let cloud = record(
            "datos_personales",
            3,
            ChangeOrigin::Cloud,
            row(&[
                ("id_agente", SqlValue::Integer(3)),
                ("nombre", SqlValue::from("Laura B.")),
                ("apellido", SqlValue::from("Núñez")),
            ]),
        );
        sync.conflicts = vec![(local, cloud)];

        // Keeping the cloud side writes it into the local store.
        let resolved = sync
            .resolve_conflict("datos_personales", 3, ChangeOrigin::Cloud)
            .await
            .expect("resolve");
        assert!(resolved);
        assert!(sync.conflicts().is_empty());

        let stored = db
            .query_one(
                "SELECT nombre FROM datos_personales WHERE id_agente = ?",
                &[SqlValue::Integer(3)],
                None,
                DbMode::Local,
            )
            .await
            .expect("query")
            .expect("row");
        assert_eq!(
            stored.get("nombre").and_then(SqlValue::as_str),
            Some("Laura B.")
        );

        let missing = sync
            .resolve_conflict("datos_personales", 99, ChangeOrigin::Cloud)
            .await
            .expect("resolve missing");
        assert!(!missing);
    }

    #[tokio::test]
    async fn preview_reports_pending_work_without_writing() {
        let dir = tempdir().expect("tempdir");
        let (db, mut sync) = offline_manager(dir.path()).await;

        db.execute(
            "INSERT INTO dispositivos (id_dispositivo, nombre_dispositivo) VALUES (?, ?)",
            &[SqlValue::Integer(1), SqlValue::from("Telar")],
            None,
            DbMode::Local,
        )
        .await
        .expect("insert");

        let preview = sync.preview().await;
        assert_eq!(preview.will_upload, 1);
        assert_eq!(preview.will_download, 0);
        assert_eq!(preview.potential_conflicts, 0);
        assert_eq!(preview.tables_affected, vec!["dispositivos".to_string()]);
        assert_eq!(preview.upload_detail[0].table, "dispositivos");

        let report = sync.status().await;
        assert_eq!(report.pending_uploads, 1);
        assert_eq!(report.pending_downloads, 0);
        assert!(!report.is_synced);

        // Offline: nothing to reconcile against, so no sync is "needed".
        assert!(!sync.check_sync_needed().await);
    }
}
