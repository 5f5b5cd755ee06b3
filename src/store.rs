//! Persistence boundary for scan, host, port, hop and artifact rows.
//!
//! Every repository call is a single atomic operation on the rows it
//! touches. The rules that keep concurrent writers honest live here:
//! terminal scans reject further writes, scan progress never moves
//! backwards, and host status only moves forward.

use std::collections::{BTreeMap, HashMap};
use std::net::IpAddr;

use async_trait::async_trait;
use time::OffsetDateTime;
use tokio::sync::RwLock;

use crate::error::StoreError;
use crate::types::{
    Artifact, ArtifactDescriptor, Host, HostId, HostReport, HostScanStatus, PortRecord, Scan,
    ScanId, ScanSnapshot, ScanStatus, TopologyHop,
};

pub type Result<T> = std::result::Result<T, StoreError>;

/// Partial update of a scan row.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ScanPatch {
    pub status: Option<ScanStatus>,
    pub progress_percent: Option<u8>,
    pub progress_message: Option<String>,
    pub error_message: Option<String>,
    pub total_hosts: Option<u32>,
}

impl ScanPatch {
    pub fn progress(percent: u8, message: impl Into<String>) -> Self {
        Self {
            progress_percent: Some(percent),
            progress_message: Some(message.into()),
            ..Default::default()
        }
    }

    pub fn with_status(mut self, status: ScanStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn with_error(mut self, message: impl Into<String>) -> Self {
        self.error_message = Some(message.into());
        self
    }

    pub fn with_total_hosts(mut self, total: u32) -> Self {
        self.total_hosts = Some(total);
        self
    }
}

/// Fields filled in from a successful deep scan.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HostDetails {
    pub hostname: Option<String>,
    pub os_type: Option<String>,
    pub os_accuracy: Option<u8>,
    pub mac: Option<String>,
    pub vendor: Option<String>,
    pub is_vm: bool,
    pub vm_type: Option<String>,
    pub distance: Option<u32>,
    pub uptime_seconds: Option<u64>,
}

/// Partial update of a host row.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HostPatch {
    pub status: Option<HostScanStatus>,
    pub progress_percent: Option<u8>,
    pub error_message: Option<String>,
    pub details: Option<HostDetails>,
    pub ports_discovered: Option<u32>,
}

/// Everything a successful deep scan leaves behind for one host.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HostResults {
    pub details: HostDetails,
    pub ports: Vec<PortRecord>,
    pub hops: Vec<TopologyHop>,
}

impl HostPatch {
    pub fn status(status: HostScanStatus) -> Self {
        Self {
            status: Some(status),
            ..Default::default()
        }
    }

    pub fn progress(percent: u8) -> Self {
        Self {
            progress_percent: Some(percent),
            ..Default::default()
        }
    }
}

#[async_trait]
pub trait ScanRepository: Send + Sync {
    async fn create_scan(&self, targets: Vec<String>, now: OffsetDateTime) -> Result<Scan>;
    async fn get_scan(&self, id: ScanId) -> Result<Option<Scan>>;
    async fn list_scans(&self) -> Result<Vec<Scan>>;
    /// Scans in PENDING or RUNNING.
    async fn list_active_scans(&self) -> Result<Vec<Scan>>;
    async fn update_scan(&self, id: ScanId, patch: ScanPatch, now: OffsetDateTime) -> Result<Scan>;
    /// Force FAILED only if the scan is still non-terminal. Returns whether it was applied.
    async fn fail_scan_if_active(
        &self,
        id: ScanId,
        message: &str,
        now: OffsetDateTime,
    ) -> Result<bool>;

    /// Creates one PENDING host per address not already present in the scan.
    async fn create_hosts(&self, scan_id: ScanId, addrs: &[IpAddr]) -> Result<Vec<Host>>;
    async fn get_host(&self, id: HostId) -> Result<Option<Host>>;
    async fn list_hosts(&self, scan_id: ScanId) -> Result<Vec<Host>>;
    async fn update_host(&self, id: HostId, patch: HostPatch, now: OffsetDateTime) -> Result<Host>;
    /// Force FAILED only if the host is still non-terminal. Returns whether it was applied.
    async fn fail_host_if_active(
        &self,
        id: HostId,
        message: &str,
        now: OffsetDateTime,
    ) -> Result<bool>;

    /// Move a SCANNING host to COMPLETED and store its ports and hops in the
    /// same step. A host that is no longer SCANNING is left untouched and the
    /// call fails with [`StoreError::InvalidTransition`].
    async fn complete_host(
        &self,
        id: HostId,
        results: HostResults,
        now: OffsetDateTime,
    ) -> Result<Host>;
    async fn list_ports(&self, host: HostId) -> Result<Vec<PortRecord>>;
    async fn list_hops(&self, host: HostId) -> Result<Vec<TopologyHop>>;

    async fn insert_artifacts(
        &self,
        scan_id: ScanId,
        artifacts: Vec<ArtifactDescriptor>,
        now: OffsetDateTime,
    ) -> Result<Vec<Artifact>>;
    async fn list_artifacts(&self, scan_id: ScanId) -> Result<Vec<Artifact>>;

    /// Bulk read of everything persisted under a scan.
    async fn snapshot(&self, scan_id: ScanId) -> Result<ScanSnapshot> {
        let scan = self
            .get_scan(scan_id)
            .await?
            .ok_or(StoreError::ScanNotFound(scan_id))?;
        let mut hosts = Vec::new();
        for host in self.list_hosts(scan_id).await? {
            let ports = self.list_ports(host.id).await?;
            let hops = self.list_hops(host.id).await?;
            hosts.push(HostReport { host, ports, hops });
        }
        Ok(ScanSnapshot { scan, hosts })
    }
}

#[derive(Debug, Default)]
struct Tables {
    next_scan: u64,
    next_host: u64,
    scans: BTreeMap<ScanId, Scan>,
    hosts: BTreeMap<HostId, Host>,
    ports: HashMap<HostId, Vec<PortRecord>>,
    hops: HashMap<HostId, Vec<TopologyHop>>,
    artifacts: HashMap<ScanId, Vec<Artifact>>,
}

/// In-process repository. All rows live behind one lock; each call holds it
/// for exactly one read or write.
#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: RwLock<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

pub(crate) fn new_scan(id: ScanId, targets: Vec<String>, now: OffsetDateTime) -> Scan {
    Scan {
        id,
        targets,
        status: ScanStatus::Pending,
        progress_percent: 0,
        progress_message: "Queued".to_string(),
        error_message: None,
        total_hosts: None,
        created_at: now,
        started_at: None,
        progress_updated_at: now,
        completed_at: None,
    }
}

pub(crate) fn apply_scan_patch(scan: &mut Scan, patch: ScanPatch, now: OffsetDateTime) {
    if let Some(status) = patch.status {
        if status == ScanStatus::Running && scan.started_at.is_none() {
            scan.started_at = Some(now);
        }
        if status.is_terminal() {
            scan.completed_at = Some(now);
        }
        scan.status = status;
    }
    let touched = patch.progress_percent.is_some() || patch.progress_message.is_some();
    if let Some(p) = patch.progress_percent {
        scan.progress_percent = scan.progress_percent.max(p.min(100));
    }
    if let Some(msg) = patch.progress_message {
        scan.progress_message = msg;
    }
    if touched {
        scan.progress_updated_at = now;
    }
    if let Some(err) = patch.error_message {
        scan.error_message = Some(err);
    }
    if let Some(total) = patch.total_hosts {
        scan.total_hosts = Some(total);
    }
}

pub(crate) fn apply_host_patch(host: &mut Host, patch: HostPatch, now: OffsetDateTime) -> Result<()> {
    let current = host.scan_status;
    if current.is_terminal() {
        return Err(StoreError::InvalidTransition {
            host: host.id,
            from: current,
            to: patch.status.unwrap_or(current),
        });
    }
    if let Some(next) = patch.status {
        if next != current {
            if !current.can_transition_to(next) {
                return Err(StoreError::InvalidTransition {
                    host: host.id,
                    from: current,
                    to: next,
                });
            }
            if next == HostScanStatus::Scanning {
                host.scan_started_at = Some(now);
            }
            if next.is_terminal() {
                host.scan_completed_at = Some(now);
            }
            host.scan_status = next;
        }
    }
    if let Some(p) = patch.progress_percent {
        host.scan_progress_percent = host.scan_progress_percent.max(p.min(100));
    }
    if let Some(err) = patch.error_message {
        host.scan_error_message = Some(err);
    }
    if let Some(d) = patch.details {
        host.hostname = d.hostname;
        host.os_type = d.os_type;
        host.os_accuracy = d.os_accuracy;
        host.mac = d.mac;
        host.vendor = d.vendor;
        host.is_vm = d.is_vm;
        host.vm_type = d.vm_type;
        host.distance = d.distance;
        host.uptime_seconds = d.uptime_seconds;
    }
    if let Some(n) = patch.ports_discovered {
        host.ports_discovered = n;
    }
    Ok(())
}

/// COMPLETED transition for a finished deep scan. Returns the ports (one per
/// port/protocol pair) and hops to persist with it.
pub(crate) fn apply_completion(
    host: &mut Host,
    results: HostResults,
    now: OffsetDateTime,
) -> Result<(Vec<PortRecord>, Vec<TopologyHop>)> {
    let HostResults {
        details,
        ports,
        hops,
    } = results;
    let mut unique: Vec<PortRecord> = Vec::with_capacity(ports.len());
    for p in ports {
        if !unique
            .iter()
            .any(|r| r.port_number == p.port_number && r.protocol == p.protocol)
        {
            unique.push(p);
        }
    }
    let patch = HostPatch {
        status: Some(HostScanStatus::Completed),
        progress_percent: Some(100),
        details: Some(details),
        ports_discovered: Some(unique.len() as u32),
        ..Default::default()
    };
    apply_host_patch(host, patch, now)?;
    Ok((unique, hops))
}

#[async_trait]
impl ScanRepository for MemoryStore {
    async fn create_scan(&self, targets: Vec<String>, now: OffsetDateTime) -> Result<Scan> {
        let mut t = self.inner.write().await;
        t.next_scan += 1;
        let scan = new_scan(ScanId(t.next_scan), targets, now);
        t.scans.insert(scan.id, scan.clone());
        Ok(scan)
    }

    async fn get_scan(&self, id: ScanId) -> Result<Option<Scan>> {
        Ok(self.inner.read().await.scans.get(&id).cloned())
    }

    async fn list_scans(&self) -> Result<Vec<Scan>> {
        Ok(self.inner.read().await.scans.values().cloned().collect())
    }

    async fn list_active_scans(&self) -> Result<Vec<Scan>> {
        Ok(self
            .inner
            .read()
            .await
            .scans
            .values()
            .filter(|s| !s.status.is_terminal())
            .cloned()
            .collect())
    }

    async fn update_scan(&self, id: ScanId, patch: ScanPatch, now: OffsetDateTime) -> Result<Scan> {
        let mut t = self.inner.write().await;
        let scan = t.scans.get_mut(&id).ok_or(StoreError::ScanNotFound(id))?;
        if scan.status.is_terminal() {
            return Err(StoreError::Terminal(id));
        }
        apply_scan_patch(scan, patch, now);
        Ok(scan.clone())
    }

    async fn fail_scan_if_active(
        &self,
        id: ScanId,
        message: &str,
        now: OffsetDateTime,
    ) -> Result<bool> {
        let mut t = self.inner.write().await;
        let scan = t.scans.get_mut(&id).ok_or(StoreError::ScanNotFound(id))?;
        if scan.status.is_terminal() {
            return Ok(false);
        }
        let patch = ScanPatch {
            progress_message: Some(message.to_string()),
            ..Default::default()
        }
        .with_status(ScanStatus::Failed)
        .with_error(message);
        apply_scan_patch(scan, patch, now);
        Ok(true)
    }

    async fn create_hosts(&self, scan_id: ScanId, addrs: &[IpAddr]) -> Result<Vec<Host>> {
        let mut t = self.inner.write().await;
        if !t.scans.contains_key(&scan_id) {
            return Err(StoreError::ScanNotFound(scan_id));
        }
        let mut created = Vec::new();
        for &ip in addrs {
            let exists = t
                .hosts
                .values()
                .any(|h| h.scan_id == scan_id && h.ip == ip);
            if exists {
                continue;
            }
            t.next_host += 1;
            let host = Host::new(HostId(t.next_host), scan_id, ip);
            t.hosts.insert(host.id, host.clone());
            created.push(host);
        }
        Ok(created)
    }

    async fn get_host(&self, id: HostId) -> Result<Option<Host>> {
        Ok(self.inner.read().await.hosts.get(&id).cloned())
    }

    async fn list_hosts(&self, scan_id: ScanId) -> Result<Vec<Host>> {
        Ok(self
            .inner
            .read()
            .await
            .hosts
            .values()
            .filter(|h| h.scan_id == scan_id)
            .cloned()
            .collect())
    }

    async fn update_host(&self, id: HostId, patch: HostPatch, now: OffsetDateTime) -> Result<Host> {
        let mut t = self.inner.write().await;
        let host = t.hosts.get_mut(&id).ok_or(StoreError::HostNotFound(id))?;
        apply_host_patch(host, patch, now)?;
        Ok(host.clone())
    }

    async fn fail_host_if_active(
        &self,
        id: HostId,
        message: &str,
        now: OffsetDateTime,
    ) -> Result<bool> {
        let mut t = self.inner.write().await;
        let host = t.hosts.get_mut(&id).ok_or(StoreError::HostNotFound(id))?;
        if host.scan_status.is_terminal() {
            return Ok(false);
        }
        let patch = HostPatch {
            status: Some(HostScanStatus::Failed),
            error_message: Some(message.to_string()),
            ..Default::default()
        };
        apply_host_patch(host, patch, now)?;
        Ok(true)
    }

    async fn complete_host(
        &self,
        id: HostId,
        results: HostResults,
        now: OffsetDateTime,
    ) -> Result<Host> {
        let mut t = self.inner.write().await;
        let host = t.hosts.get_mut(&id).ok_or(StoreError::HostNotFound(id))?;
        let (ports, hops) = apply_completion(host, results, now)?;
        let done = host.clone();
        t.ports.insert(id, ports);
        if !hops.is_empty() {
            t.hops.insert(id, hops);
        }
        Ok(done)
    }

    async fn list_ports(&self, host: HostId) -> Result<Vec<PortRecord>> {
        Ok(self
            .inner
            .read()
            .await
            .ports
            .get(&host)
            .cloned()
            .unwrap_or_default())
    }

    async fn list_hops(&self, host: HostId) -> Result<Vec<TopologyHop>> {
        Ok(self
            .inner
            .read()
            .await
            .hops
            .get(&host)
            .cloned()
            .unwrap_or_default())
    }

    async fn insert_artifacts(
        &self,
        scan_id: ScanId,
        artifacts: Vec<ArtifactDescriptor>,
        now: OffsetDateTime,
    ) -> Result<Vec<Artifact>> {
        let mut t = self.inner.write().await;
        if !t.scans.contains_key(&scan_id) {
            return Err(StoreError::ScanNotFound(scan_id));
        }
        let rows: Vec<Artifact> = artifacts
            .into_iter()
            .map(|a| Artifact {
                scan_id,
                kind: a.kind,
                file_path: a.file_path,
                file_size: a.file_size,
                created_at: now,
            })
            .collect();
        t.artifacts.entry(scan_id).or_default().extend(rows.clone());
        Ok(rows)
    }

    async fn list_artifacts(&self, scan_id: ScanId) -> Result<Vec<Artifact>> {
        Ok(self
            .inner
            .read()
            .await
            .artifacts
            .get(&scan_id)
            .cloned()
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;
    use std::time::Duration;

    fn t0() -> OffsetDateTime {
        OffsetDateTime::UNIX_EPOCH
    }

    fn ip(last: u8) -> IpAddr {
        IpAddr::V4(Ipv4Addr::new(10, 0, 0, last))
    }

    #[tokio::test]
    async fn progress_never_moves_backwards() {
        let store = MemoryStore::new();
        let scan = store.create_scan(vec!["10.0.0.0/24".into()], t0()).await.unwrap();
        store
            .update_scan(scan.id, ScanPatch::progress(40, "a"), t0())
            .await
            .unwrap();
        let s = store
            .update_scan(scan.id, ScanPatch::progress(20, "b"), t0())
            .await
            .unwrap();
        assert_eq!(s.progress_percent, 40);
        assert_eq!(s.progress_message, "b");
    }

    #[tokio::test]
    async fn terminal_scan_rejects_updates() {
        let store = MemoryStore::new();
        let scan = store.create_scan(vec![], t0()).await.unwrap();
        let done = store
            .update_scan(
                scan.id,
                ScanPatch::progress(100, "done").with_status(ScanStatus::Completed),
                t0(),
            )
            .await
            .unwrap();
        assert_eq!(done.completed_at, Some(t0()));
        let err = store
            .update_scan(scan.id, ScanPatch::progress(100, "again"), t0())
            .await
            .unwrap_err();
        assert_eq!(err, StoreError::Terminal(scan.id));
        assert!(!store.fail_scan_if_active(scan.id, "x", t0()).await.unwrap());
    }

    #[tokio::test]
    async fn progress_timestamp_tracks_writes() {
        let store = MemoryStore::new();
        let scan = store.create_scan(vec![], t0()).await.unwrap();
        let later = t0() + Duration::from_secs(30);
        let s = store
            .update_scan(scan.id, ScanPatch::default().with_total_hosts(3), later)
            .await
            .unwrap();
        assert_eq!(s.progress_updated_at, t0());
        let s = store
            .update_scan(scan.id, ScanPatch::progress(5, "x"), later)
            .await
            .unwrap();
        assert_eq!(s.progress_updated_at, later);
    }

    #[tokio::test]
    async fn hosts_are_unique_per_scan() {
        let store = MemoryStore::new();
        let scan = store.create_scan(vec![], t0()).await.unwrap();
        let created = store
            .create_hosts(scan.id, &[ip(1), ip(1), ip(2)])
            .await
            .unwrap();
        assert_eq!(created.len(), 2);
        let again = store.create_hosts(scan.id, &[ip(2)]).await.unwrap();
        assert!(again.is_empty());
        assert_eq!(store.list_hosts(scan.id).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn host_status_only_moves_forward() {
        let store = MemoryStore::new();
        let scan = store.create_scan(vec![], t0()).await.unwrap();
        let host = store.create_hosts(scan.id, &[ip(1)]).await.unwrap().remove(0);

        let err = store
            .update_host(host.id, HostPatch::status(HostScanStatus::Completed), t0())
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::InvalidTransition { .. }));

        store
            .update_host(host.id, HostPatch::status(HostScanStatus::Scanning), t0())
            .await
            .unwrap();
        let done = store
            .update_host(host.id, HostPatch::status(HostScanStatus::Completed), t0())
            .await
            .unwrap();
        assert_eq!(done.scan_completed_at, Some(t0()));

        assert!(!store.fail_host_if_active(host.id, "late", t0()).await.unwrap());
        let h = store.get_host(host.id).await.unwrap().unwrap();
        assert_eq!(h.scan_status, HostScanStatus::Completed);
        assert!(h.scan_error_message.is_none());
    }

    fn ssh() -> PortRecord {
        PortRecord {
            port_number: 22,
            protocol: "tcp".into(),
            service: Some("ssh".into()),
            product: None,
            version: None,
            extra_info: None,
            cpe: None,
        }
    }

    #[tokio::test]
    async fn snapshot_collects_ports_and_hops() {
        let store = MemoryStore::new();
        let scan = store.create_scan(vec![], t0()).await.unwrap();
        let host = store.create_hosts(scan.id, &[ip(7)]).await.unwrap().remove(0);
        store
            .update_host(host.id, HostPatch::status(HostScanStatus::Scanning), t0())
            .await
            .unwrap();
        let done = store
            .complete_host(
                host.id,
                HostResults {
                    ports: vec![ssh(), ssh()],
                    hops: vec![TopologyHop {
                        ttl: 1,
                        address: Some(ip(7)),
                        hostname: None,
                        rtt_ms: Some(0.4),
                    }],
                    ..Default::default()
                },
                t0(),
            )
            .await
            .unwrap();
        assert_eq!(done.scan_status, HostScanStatus::Completed);
        assert_eq!(done.ports_discovered, 1);
        let snap = store.snapshot(scan.id).await.unwrap();
        assert_eq!(snap.hosts.len(), 1);
        assert_eq!(snap.hosts[0].ports.len(), 1);
        assert_eq!(snap.hosts[0].hops.len(), 1);
    }

    #[tokio::test]
    async fn failed_host_keeps_no_results() {
        let store = MemoryStore::new();
        let scan = store.create_scan(vec![], t0()).await.unwrap();
        let host = store.create_hosts(scan.id, &[ip(8)]).await.unwrap().remove(0);
        store
            .update_host(host.id, HostPatch::status(HostScanStatus::Scanning), t0())
            .await
            .unwrap();
        assert!(store.fail_host_if_active(host.id, "terminated", t0()).await.unwrap());

        let results = HostResults {
            ports: vec![ssh()],
            ..Default::default()
        };
        let err = store.complete_host(host.id, results, t0()).await.unwrap_err();
        assert!(matches!(err, StoreError::InvalidTransition { .. }));
        assert!(store.list_ports(host.id).await.unwrap().is_empty());
        let h = store.get_host(host.id).await.unwrap().unwrap();
        assert_eq!(h.scan_status, HostScanStatus::Failed);
        assert_eq!(h.ports_discovered, 0);
    }
}
