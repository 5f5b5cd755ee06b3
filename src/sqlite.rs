//! SQLite-backed [`ScanRepository`].
//!
//! Rows outlive the process, so a restarted monitor still finds scans that a
//! crashed run left PENDING or RUNNING. Every write is a load, patch and
//! store inside an IMMEDIATE transaction, using the same patch rules as
//! [`MemoryStore`](crate::store::MemoryStore). Forced failures are guarded in
//! SQL as well, so a second process sharing the file cannot overwrite a
//! terminal row.

use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row, Transaction, TransactionBehavior};
use time::OffsetDateTime;
use tracing::debug;

use crate::error::StoreError;
use crate::store::{
    apply_completion, apply_host_patch, apply_scan_patch, new_scan, HostPatch, HostResults,
    Result, ScanPatch, ScanRepository,
};
use crate::types::{
    Artifact, ArtifactDescriptor, ArtifactKind, Host, HostId, HostScanStatus, PortRecord, Scan,
    ScanId, ScanStatus, TopologyHop,
};

const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS scans (
    id                  INTEGER PRIMARY KEY AUTOINCREMENT,
    targets_json        TEXT NOT NULL,
    status              TEXT NOT NULL,
    progress_percent    INTEGER NOT NULL,
    progress_message    TEXT NOT NULL,
    error_message       TEXT,
    total_hosts         INTEGER,
    created_at          INTEGER NOT NULL,
    started_at          INTEGER,
    progress_updated_at INTEGER NOT NULL,
    completed_at        INTEGER
);
CREATE INDEX IF NOT EXISTS idx_scans_status ON scans(status);

CREATE TABLE IF NOT EXISTS hosts (
    id                    INTEGER PRIMARY KEY AUTOINCREMENT,
    scan_id               INTEGER NOT NULL REFERENCES scans(id) ON DELETE CASCADE,
    ip                    TEXT NOT NULL,
    hostname              TEXT,
    os_type               TEXT,
    os_accuracy           INTEGER,
    is_vm                 INTEGER NOT NULL DEFAULT 0,
    vm_type               TEXT,
    mac                   TEXT,
    vendor                TEXT,
    distance              INTEGER,
    uptime_seconds        INTEGER,
    ports_discovered      INTEGER NOT NULL DEFAULT 0,
    scan_status           TEXT NOT NULL,
    scan_started_at       INTEGER,
    scan_completed_at     INTEGER,
    scan_progress_percent INTEGER NOT NULL DEFAULT 0,
    scan_error_message    TEXT,
    UNIQUE (scan_id, ip)
);

CREATE TABLE IF NOT EXISTS ports (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    host_id     INTEGER NOT NULL REFERENCES hosts(id) ON DELETE CASCADE,
    port_number INTEGER NOT NULL,
    protocol    TEXT NOT NULL,
    service     TEXT,
    product     TEXT,
    version     TEXT,
    extra_info  TEXT,
    cpe         TEXT,
    UNIQUE (host_id, port_number, protocol)
);

CREATE TABLE IF NOT EXISTS hops (
    id       INTEGER PRIMARY KEY AUTOINCREMENT,
    host_id  INTEGER NOT NULL REFERENCES hosts(id) ON DELETE CASCADE,
    ttl      INTEGER NOT NULL,
    address  TEXT,
    hostname TEXT,
    rtt_ms   REAL
);

CREATE TABLE IF NOT EXISTS artifacts (
    id         INTEGER PRIMARY KEY AUTOINCREMENT,
    scan_id    INTEGER NOT NULL REFERENCES scans(id) ON DELETE CASCADE,
    kind       TEXT NOT NULL,
    file_path  TEXT NOT NULL,
    file_size  INTEGER,
    created_at INTEGER NOT NULL
);
"#;

const SCAN_COLUMNS: &str = "id, targets_json, status, progress_percent, progress_message, \
     error_message, total_hosts, created_at, started_at, progress_updated_at, completed_at";

const HOST_COLUMNS: &str = "id, scan_id, ip, hostname, os_type, os_accuracy, is_vm, vm_type, \
     mac, vendor, distance, uptime_seconds, ports_discovered, scan_status, scan_started_at, \
     scan_completed_at, scan_progress_percent, scan_error_message";

/// Status values that end a row's lifecycle, as stored.
const TERMINAL_GUARD: &str = "NOT IN ('completed', 'failed')";

impl From<rusqlite::Error> for StoreError {
    fn from(e: rusqlite::Error) -> Self {
        StoreError::Unavailable(e.to_string())
    }
}

#[derive(Debug, thiserror::Error)]
#[error("unknown {kind} {value:?}")]
struct UnknownValue {
    kind: &'static str,
    value: String,
}

/// Persistent repository over one SQLite connection.
#[derive(Clone)]
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    /// Open (or create) the database at `path`.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| {
                StoreError::Unavailable(format!(
                    "failed to create db directory {}: {e}",
                    parent.display()
                ))
            })?;
        }
        let conn = Connection::open(path)?;
        initialize(&conn)?;
        debug!(path = %path.display(), "scan database opened");
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        initialize(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Run `f` against the connection on the blocking pool.
    async fn call<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let mut guard = conn
                .lock()
                .map_err(|_| StoreError::Unavailable("database connection lock poisoned".into()))?;
            f(&mut guard)
        })
        .await
        .map_err(|e| StoreError::Unavailable(format!("database task failed: {e}")))?
    }
}

fn initialize(conn: &Connection) -> rusqlite::Result<()> {
    conn.busy_timeout(Duration::from_secs(5))?;
    conn.pragma_update(None, "journal_mode", "WAL")?;
    conn.pragma_update(None, "foreign_keys", "ON")?;
    conn.execute_batch(SCHEMA_SQL)
}

fn immediate(conn: &mut Connection) -> rusqlite::Result<Transaction<'_>> {
    conn.transaction_with_behavior(TransactionBehavior::Immediate)
}

fn conversion<E>(idx: usize, ty: Type, e: E) -> rusqlite::Error
where
    E: std::error::Error + Send + Sync + 'static,
{
    rusqlite::Error::FromSqlConversionFailure(idx, ty, Box::new(e))
}

fn unknown(idx: usize, kind: &'static str, value: String) -> rusqlite::Error {
    conversion(idx, Type::Text, UnknownValue { kind, value })
}

/// Timestamps are stored as unix nanoseconds.
fn nanos(ts: OffsetDateTime) -> i64 {
    i64::try_from(ts.unix_timestamp_nanos()).unwrap_or(i64::MAX)
}

fn timestamp(row: &Row<'_>, idx: usize) -> rusqlite::Result<OffsetDateTime> {
    let n: i64 = row.get(idx)?;
    OffsetDateTime::from_unix_timestamp_nanos(i128::from(n)).map_err(|e| conversion(idx, Type::Integer, e))
}

fn opt_timestamp(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<OffsetDateTime>> {
    match row.get::<_, Option<i64>>(idx)? {
        Some(_) => timestamp(row, idx).map(Some),
        None => Ok(None),
    }
}

fn ip_column(row: &Row<'_>, idx: usize) -> rusqlite::Result<IpAddr> {
    let s: String = row.get(idx)?;
    s.parse().map_err(|e| conversion(idx, Type::Text, e))
}

fn scan_status(row: &Row<'_>, idx: usize) -> rusqlite::Result<ScanStatus> {
    let s: String = row.get(idx)?;
    match s.as_str() {
        "pending" => Ok(ScanStatus::Pending),
        "running" => Ok(ScanStatus::Running),
        "completed" => Ok(ScanStatus::Completed),
        "failed" => Ok(ScanStatus::Failed),
        _ => Err(unknown(idx, "scan status", s)),
    }
}

fn host_status(row: &Row<'_>, idx: usize) -> rusqlite::Result<HostScanStatus> {
    let s: String = row.get(idx)?;
    match s.as_str() {
        "pending" => Ok(HostScanStatus::Pending),
        "scanning" => Ok(HostScanStatus::Scanning),
        "completed" => Ok(HostScanStatus::Completed),
        "failed" => Ok(HostScanStatus::Failed),
        _ => Err(unknown(idx, "host status", s)),
    }
}

fn artifact_kind(row: &Row<'_>, idx: usize) -> rusqlite::Result<ArtifactKind> {
    let s: String = row.get(idx)?;
    [ArtifactKind::Json, ArtifactKind::Html, ArtifactKind::Dot]
        .into_iter()
        .find(|k| k.extension() == s)
        .ok_or_else(|| unknown(idx, "artifact kind", s))
}

fn scan_from_row(row: &Row<'_>) -> rusqlite::Result<Scan> {
    let targets: String = row.get(1)?;
    Ok(Scan {
        id: ScanId(row.get::<_, i64>(0)? as u64),
        targets: serde_json::from_str(&targets).map_err(|e| conversion(1, Type::Text, e))?,
        status: scan_status(row, 2)?,
        progress_percent: row.get(3)?,
        progress_message: row.get(4)?,
        error_message: row.get(5)?,
        total_hosts: row.get(6)?,
        created_at: timestamp(row, 7)?,
        started_at: opt_timestamp(row, 8)?,
        progress_updated_at: timestamp(row, 9)?,
        completed_at: opt_timestamp(row, 10)?,
    })
}

fn host_from_row(row: &Row<'_>) -> rusqlite::Result<Host> {
    Ok(Host {
        id: HostId(row.get::<_, i64>(0)? as u64),
        scan_id: ScanId(row.get::<_, i64>(1)? as u64),
        ip: ip_column(row, 2)?,
        hostname: row.get(3)?,
        os_type: row.get(4)?,
        os_accuracy: row.get(5)?,
        is_vm: row.get(6)?,
        vm_type: row.get(7)?,
        mac: row.get(8)?,
        vendor: row.get(9)?,
        distance: row.get(10)?,
        uptime_seconds: row.get::<_, Option<i64>>(11)?.map(|u| u as u64),
        ports_discovered: row.get(12)?,
        scan_status: host_status(row, 13)?,
        scan_started_at: opt_timestamp(row, 14)?,
        scan_completed_at: opt_timestamp(row, 15)?,
        scan_progress_percent: row.get(16)?,
        scan_error_message: row.get(17)?,
    })
}

fn load_scan(conn: &Connection, id: ScanId) -> rusqlite::Result<Option<Scan>> {
    conn.query_row(
        &format!("SELECT {SCAN_COLUMNS} FROM scans WHERE id = ?1"),
        params![id.0 as i64],
        scan_from_row,
    )
    .optional()
}

fn load_host(conn: &Connection, id: HostId) -> rusqlite::Result<Option<Host>> {
    conn.query_row(
        &format!("SELECT {HOST_COLUMNS} FROM hosts WHERE id = ?1"),
        params![id.0 as i64],
        host_from_row,
    )
    .optional()
}

fn scan_exists(conn: &Connection, id: ScanId) -> rusqlite::Result<bool> {
    conn.query_row("SELECT 1 FROM scans WHERE id = ?1", params![id.0 as i64], |_| Ok(()))
        .optional()
        .map(|r| r.is_some())
}

/// Write every mutable scan column. With `only_if_active` the row is left
/// alone once terminal; the return value is the number of rows changed.
fn store_scan(conn: &Connection, scan: &Scan, only_if_active: bool) -> rusqlite::Result<usize> {
    let guard = if only_if_active {
        format!(" AND status {TERMINAL_GUARD}")
    } else {
        String::new()
    };
    conn.execute(
        &format!(
            "UPDATE scans SET status = ?2, progress_percent = ?3, progress_message = ?4, \
             error_message = ?5, total_hosts = ?6, started_at = ?7, progress_updated_at = ?8, \
             completed_at = ?9 WHERE id = ?1{guard}"
        ),
        params![
            scan.id.0 as i64,
            scan.status.to_string(),
            scan.progress_percent,
            scan.progress_message,
            scan.error_message,
            scan.total_hosts,
            scan.started_at.map(nanos),
            nanos(scan.progress_updated_at),
            scan.completed_at.map(nanos),
        ],
    )
}

fn store_host(conn: &Connection, host: &Host, only_if_active: bool) -> rusqlite::Result<usize> {
    let guard = if only_if_active {
        format!(" AND scan_status {TERMINAL_GUARD}")
    } else {
        String::new()
    };
    conn.execute(
        &format!(
            "UPDATE hosts SET hostname = ?2, os_type = ?3, os_accuracy = ?4, is_vm = ?5, \
             vm_type = ?6, mac = ?7, vendor = ?8, distance = ?9, uptime_seconds = ?10, \
             ports_discovered = ?11, scan_status = ?12, scan_started_at = ?13, \
             scan_completed_at = ?14, scan_progress_percent = ?15, scan_error_message = ?16 \
             WHERE id = ?1{guard}"
        ),
        params![
            host.id.0 as i64,
            host.hostname,
            host.os_type,
            host.os_accuracy,
            host.is_vm,
            host.vm_type,
            host.mac,
            host.vendor,
            host.distance,
            host.uptime_seconds.map(|u| u as i64),
            host.ports_discovered,
            host.scan_status.to_string(),
            host.scan_started_at.map(nanos),
            host.scan_completed_at.map(nanos),
            host.scan_progress_percent,
            host.scan_error_message,
        ],
    )
}

#[async_trait]
impl ScanRepository for SqliteStore {
    async fn create_scan(&self, targets: Vec<String>, now: OffsetDateTime) -> Result<Scan> {
        self.call(move |conn| {
            let targets_json = serde_json::to_string(&targets)
                .map_err(|e| StoreError::Unavailable(format!("encoding targets: {e}")))?;
            let tx = immediate(conn)?;
            tx.execute(
                "INSERT INTO scans (targets_json, status, progress_percent, progress_message, \
                 created_at, progress_updated_at) VALUES (?1, ?2, 0, 'Queued', ?3, ?3)",
                params![targets_json, ScanStatus::Pending.to_string(), nanos(now)],
            )?;
            let scan = new_scan(ScanId(tx.last_insert_rowid() as u64), targets, now);
            store_scan(&tx, &scan, false)?;
            tx.commit()?;
            Ok(scan)
        })
        .await
    }

    async fn get_scan(&self, id: ScanId) -> Result<Option<Scan>> {
        self.call(move |conn| Ok(load_scan(conn, id)?)).await
    }

    async fn list_scans(&self) -> Result<Vec<Scan>> {
        self.call(|conn| {
            let mut stmt = conn.prepare(&format!("SELECT {SCAN_COLUMNS} FROM scans ORDER BY id"))?;
            let rows = stmt.query_map([], scan_from_row)?;
            Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
        })
        .await
    }

    async fn list_active_scans(&self) -> Result<Vec<Scan>> {
        self.call(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {SCAN_COLUMNS} FROM scans WHERE status {TERMINAL_GUARD} ORDER BY id"
            ))?;
            let rows = stmt.query_map([], scan_from_row)?;
            Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
        })
        .await
    }

    async fn update_scan(&self, id: ScanId, patch: ScanPatch, now: OffsetDateTime) -> Result<Scan> {
        self.call(move |conn| {
            let tx = immediate(conn)?;
            let mut scan = load_scan(&tx, id)?.ok_or(StoreError::ScanNotFound(id))?;
            if scan.status.is_terminal() {
                return Err(StoreError::Terminal(id));
            }
            apply_scan_patch(&mut scan, patch, now);
            store_scan(&tx, &scan, true)?;
            tx.commit()?;
            Ok(scan)
        })
        .await
    }

    async fn fail_scan_if_active(
        &self,
        id: ScanId,
        message: &str,
        now: OffsetDateTime,
    ) -> Result<bool> {
        let message = message.to_string();
        self.call(move |conn| {
            let tx = immediate(conn)?;
            let mut scan = load_scan(&tx, id)?.ok_or(StoreError::ScanNotFound(id))?;
            if scan.status.is_terminal() {
                return Ok(false);
            }
            let patch = ScanPatch {
                progress_message: Some(message.clone()),
                ..Default::default()
            }
            .with_status(ScanStatus::Failed)
            .with_error(message);
            apply_scan_patch(&mut scan, patch, now);
            let changed = store_scan(&tx, &scan, true)?;
            tx.commit()?;
            Ok(changed == 1)
        })
        .await
    }

    async fn create_hosts(&self, scan_id: ScanId, addrs: &[IpAddr]) -> Result<Vec<Host>> {
        let addrs = addrs.to_vec();
        self.call(move |conn| {
            let tx = immediate(conn)?;
            if !scan_exists(&tx, scan_id)? {
                return Err(StoreError::ScanNotFound(scan_id));
            }
            let mut created = Vec::new();
            for ip in addrs {
                let inserted = tx.execute(
                    "INSERT OR IGNORE INTO hosts (scan_id, ip, scan_status) VALUES (?1, ?2, ?3)",
                    params![
                        scan_id.0 as i64,
                        ip.to_string(),
                        HostScanStatus::Pending.to_string()
                    ],
                )?;
                if inserted == 1 {
                    created.push(Host::new(HostId(tx.last_insert_rowid() as u64), scan_id, ip));
                }
            }
            tx.commit()?;
            Ok(created)
        })
        .await
    }

    async fn get_host(&self, id: HostId) -> Result<Option<Host>> {
        self.call(move |conn| Ok(load_host(conn, id)?)).await
    }

    async fn list_hosts(&self, scan_id: ScanId) -> Result<Vec<Host>> {
        self.call(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {HOST_COLUMNS} FROM hosts WHERE scan_id = ?1 ORDER BY id"
            ))?;
            let rows = stmt.query_map(params![scan_id.0 as i64], host_from_row)?;
            Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
        })
        .await
    }

    async fn update_host(&self, id: HostId, patch: HostPatch, now: OffsetDateTime) -> Result<Host> {
        self.call(move |conn| {
            let tx = immediate(conn)?;
            let mut host = load_host(&tx, id)?.ok_or(StoreError::HostNotFound(id))?;
            apply_host_patch(&mut host, patch, now)?;
            store_host(&tx, &host, true)?;
            tx.commit()?;
            Ok(host)
        })
        .await
    }

    async fn fail_host_if_active(
        &self,
        id: HostId,
        message: &str,
        now: OffsetDateTime,
    ) -> Result<bool> {
        let message = message.to_string();
        self.call(move |conn| {
            let tx = immediate(conn)?;
            let mut host = load_host(&tx, id)?.ok_or(StoreError::HostNotFound(id))?;
            if host.scan_status.is_terminal() {
                return Ok(false);
            }
            let patch = HostPatch {
                status: Some(HostScanStatus::Failed),
                error_message: Some(message),
                ..Default::default()
            };
            apply_host_patch(&mut host, patch, now)?;
            let changed = store_host(&tx, &host, true)?;
            tx.commit()?;
            Ok(changed == 1)
        })
        .await
    }

    async fn complete_host(
        &self,
        id: HostId,
        results: HostResults,
        now: OffsetDateTime,
    ) -> Result<Host> {
        self.call(move |conn| {
            let tx = immediate(conn)?;
            let mut host = load_host(&tx, id)?.ok_or(StoreError::HostNotFound(id))?;
            let from = host.scan_status;
            let (ports, hops) = apply_completion(&mut host, results, now)?;
            if store_host(&tx, &host, true)? != 1 {
                return Err(StoreError::InvalidTransition {
                    host: id,
                    from,
                    to: HostScanStatus::Completed,
                });
            }
            for p in &ports {
                tx.execute(
                    "INSERT OR IGNORE INTO ports (host_id, port_number, protocol, service, \
                     product, version, extra_info, cpe) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                    params![
                        id.0 as i64,
                        p.port_number,
                        p.protocol,
                        p.service,
                        p.product,
                        p.version,
                        p.extra_info,
                        p.cpe,
                    ],
                )?;
            }
            for h in &hops {
                tx.execute(
                    "INSERT INTO hops (host_id, ttl, address, hostname, rtt_ms) \
                     VALUES (?1, ?2, ?3, ?4, ?5)",
                    params![
                        id.0 as i64,
                        h.ttl,
                        h.address.map(|a| a.to_string()),
                        h.hostname,
                        h.rtt_ms,
                    ],
                )?;
            }
            tx.commit()?;
            Ok(host)
        })
        .await
    }

    async fn list_ports(&self, host: HostId) -> Result<Vec<PortRecord>> {
        self.call(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT port_number, protocol, service, product, version, extra_info, cpe \
                 FROM ports WHERE host_id = ?1 ORDER BY id",
            )?;
            let rows = stmt.query_map(params![host.0 as i64], |row| {
                Ok(PortRecord {
                    port_number: row.get(0)?,
                    protocol: row.get(1)?,
                    service: row.get(2)?,
                    product: row.get(3)?,
                    version: row.get(4)?,
                    extra_info: row.get(5)?,
                    cpe: row.get(6)?,
                })
            })?;
            Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
        })
        .await
    }

    async fn list_hops(&self, host: HostId) -> Result<Vec<TopologyHop>> {
        self.call(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT ttl, address, hostname, rtt_ms FROM hops WHERE host_id = ?1 ORDER BY id",
            )?;
            let rows = stmt.query_map(params![host.0 as i64], |row| {
                let address = match row.get::<_, Option<String>>(1)? {
                    Some(_) => Some(ip_column(row, 1)?),
                    None => None,
                };
                Ok(TopologyHop {
                    ttl: row.get(0)?,
                    address,
                    hostname: row.get(2)?,
                    rtt_ms: row.get(3)?,
                })
            })?;
            Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
        })
        .await
    }

    async fn insert_artifacts(
        &self,
        scan_id: ScanId,
        artifacts: Vec<ArtifactDescriptor>,
        now: OffsetDateTime,
    ) -> Result<Vec<Artifact>> {
        self.call(move |conn| {
            let tx = immediate(conn)?;
            if !scan_exists(&tx, scan_id)? {
                return Err(StoreError::ScanNotFound(scan_id));
            }
            let mut rows = Vec::with_capacity(artifacts.len());
            for a in artifacts {
                tx.execute(
                    "INSERT INTO artifacts (scan_id, kind, file_path, file_size, created_at) \
                     VALUES (?1, ?2, ?3, ?4, ?5)",
                    params![
                        scan_id.0 as i64,
                        a.kind.extension(),
                        a.file_path.to_string_lossy().into_owned(),
                        a.file_size.map(|s| s as i64),
                        nanos(now),
                    ],
                )?;
                rows.push(Artifact {
                    scan_id,
                    kind: a.kind,
                    file_path: a.file_path,
                    file_size: a.file_size,
                    created_at: now,
                });
            }
            tx.commit()?;
            Ok(rows)
        })
        .await
    }

    async fn list_artifacts(&self, scan_id: ScanId) -> Result<Vec<Artifact>> {
        self.call(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT kind, file_path, file_size, created_at FROM artifacts \
                 WHERE scan_id = ?1 ORDER BY id",
            )?;
            let rows = stmt.query_map(params![scan_id.0 as i64], |row| {
                Ok(Artifact {
                    scan_id,
                    kind: artifact_kind(row, 0)?,
                    file_path: PathBuf::from(row.get::<_, String>(1)?),
                    file_size: row.get::<_, Option<i64>>(2)?.map(|s| s as u64),
                    created_at: timestamp(row, 3)?,
                })
            })?;
            Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn t0() -> OffsetDateTime {
        OffsetDateTime::from_unix_timestamp_nanos(1_760_000_000_123_456_789).unwrap()
    }

    #[tokio::test]
    async fn rows_round_trip_through_columns() {
        let store = SqliteStore::open_in_memory().unwrap();
        let scan = store
            .create_scan(vec!["10.0.0.0/24".into(), "10.0.1.7".into()], t0())
            .await
            .unwrap();
        assert_eq!(store.get_scan(scan.id).await.unwrap(), Some(scan.clone()));

        let host = store
            .create_hosts(scan.id, &["fe80::1".parse().unwrap()])
            .await
            .unwrap()
            .remove(0);
        assert_eq!(store.get_host(host.id).await.unwrap(), Some(host.clone()));

        let stored = store
            .insert_artifacts(
                scan.id,
                vec![ArtifactDescriptor {
                    kind: ArtifactKind::Dot,
                    file_path: PathBuf::from("out/scan_1.dot"),
                    file_size: Some(512),
                }],
                t0(),
            )
            .await
            .unwrap();
        assert_eq!(store.list_artifacts(scan.id).await.unwrap(), stored);
    }

    #[tokio::test]
    async fn guarded_update_skips_terminal_rows() {
        let store = SqliteStore::open_in_memory().unwrap();
        let scan = store.create_scan(vec![], t0()).await.unwrap();
        assert!(store.fail_scan_if_active(scan.id, "gone", t0()).await.unwrap());

        let conn = store.conn.lock().unwrap();
        let mut late = scan.clone();
        late.status = ScanStatus::Completed;
        assert_eq!(store_scan(&conn, &late, true).unwrap(), 0);
        let kept = load_scan(&conn, scan.id).unwrap().unwrap();
        assert_eq!(kept.status, ScanStatus::Failed);
        assert_eq!(kept.error_message.as_deref(), Some("gone"));
    }

    #[tokio::test]
    async fn unknown_status_is_a_conversion_error() {
        let store = SqliteStore::open_in_memory().unwrap();
        let scan = store.create_scan(vec![], t0()).await.unwrap();
        {
            let conn = store.conn.lock().unwrap();
            conn.execute("UPDATE scans SET status = 'paused' WHERE id = ?1", params![scan.id.0 as i64])
                .unwrap();
        }
        let err = store.get_scan(scan.id).await.unwrap_err();
        assert!(matches!(err, StoreError::Unavailable(ref m) if m.contains("paused")));
    }
}
