use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::IpAddr;
use std::path::PathBuf;
use time::OffsetDateTime;

/// Identifier of one logical scan run.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(transparent)]
pub struct ScanId(pub u64);

impl fmt::Display for ScanId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of a host row. Unique across scans.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(transparent)]
pub struct HostId(pub u64);

impl fmt::Display for HostId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ScanStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl ScanStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, ScanStatus::Completed | ScanStatus::Failed)
    }
}

impl fmt::Display for ScanStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ScanStatus::Pending => "pending",
            ScanStatus::Running => "running",
            ScanStatus::Completed => "completed",
            ScanStatus::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Per-host scan state, independent of the parent scan's status.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum HostScanStatus {
    Pending,
    Scanning,
    Completed,
    Failed,
}

impl HostScanStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, HostScanStatus::Completed | HostScanStatus::Failed)
    }

    /// Forward-only lifecycle: PENDING -> SCANNING -> {COMPLETED, FAILED}.
    /// PENDING -> FAILED is allowed for hosts abandoned before their worker ran.
    pub fn can_transition_to(self, next: HostScanStatus) -> bool {
        use HostScanStatus::*;
        matches!(
            (self, next),
            (Pending, Scanning) | (Pending, Failed) | (Scanning, Completed) | (Scanning, Failed)
        )
    }
}

impl fmt::Display for HostScanStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            HostScanStatus::Pending => "pending",
            HostScanStatus::Scanning => "scanning",
            HostScanStatus::Completed => "completed",
            HostScanStatus::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// One logical scan run as persisted.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Scan {
    pub id: ScanId,
    pub targets: Vec<String>,
    pub status: ScanStatus,
    pub progress_percent: u8,
    pub progress_message: String,
    pub error_message: Option<String>,
    pub total_hosts: Option<u32>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339::option")]
    pub started_at: Option<OffsetDateTime>,
    /// Last time the progress percent or message was written.
    #[serde(with = "time::serde::rfc3339")]
    pub progress_updated_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339::option")]
    pub completed_at: Option<OffsetDateTime>,
}

/// One discovered address within a scan.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Host {
    pub id: HostId,
    pub scan_id: ScanId,
    pub ip: IpAddr,
    pub hostname: Option<String>,
    pub os_type: Option<String>,
    pub os_accuracy: Option<u8>,
    pub is_vm: bool,
    pub vm_type: Option<String>,
    pub mac: Option<String>,
    pub vendor: Option<String>,
    pub distance: Option<u32>,
    pub uptime_seconds: Option<u64>,
    pub ports_discovered: u32,
    pub scan_status: HostScanStatus,
    #[serde(with = "time::serde::rfc3339::option")]
    pub scan_started_at: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub scan_completed_at: Option<OffsetDateTime>,
    pub scan_progress_percent: u8,
    pub scan_error_message: Option<String>,
}

impl Host {
    pub fn new(id: HostId, scan_id: ScanId, ip: IpAddr) -> Self {
        Self {
            id,
            scan_id,
            ip,
            hostname: None,
            os_type: None,
            os_accuracy: None,
            is_vm: false,
            vm_type: None,
            mac: None,
            vendor: None,
            distance: None,
            uptime_seconds: None,
            ports_discovered: 0,
            scan_status: HostScanStatus::Pending,
            scan_started_at: None,
            scan_completed_at: None,
            scan_progress_percent: 0,
            scan_error_message: None,
        }
    }
}

/// An open port and the service detected on it.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct PortRecord {
    pub port_number: u16,
    pub protocol: String,
    pub service: Option<String>,
    pub product: Option<String>,
    pub version: Option<String>,
    pub extra_info: Option<String>,
    pub cpe: Option<String>,
}

/// One traceroute hop towards a host.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct TopologyHop {
    pub ttl: u32,
    pub address: Option<IpAddr>,
    pub hostname: Option<String>,
    pub rtt_ms: Option<f64>,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactKind {
    Json,
    Html,
    Dot,
}

impl ArtifactKind {
    pub fn extension(self) -> &'static str {
        match self {
            ArtifactKind::Json => "json",
            ArtifactKind::Html => "html",
            ArtifactKind::Dot => "dot",
        }
    }
}

/// What a report generator hands back for each file it produced.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ArtifactDescriptor {
    pub kind: ArtifactKind,
    pub file_path: PathBuf,
    pub file_size: Option<u64>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Artifact {
    pub scan_id: ScanId,
    pub kind: ArtifactKind,
    pub file_path: PathBuf,
    pub file_size: Option<u64>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

/// A host together with everything persisted under it.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct HostReport {
    #[serde(flatten)]
    pub host: Host,
    pub ports: Vec<PortRecord>,
    pub hops: Vec<TopologyHop>,
}

/// Full persisted state of a scan, as handed to report generation.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ScanSnapshot {
    pub scan: Scan,
    pub hosts: Vec<HostReport>,
}

/// Per-host row of a status poll.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct HostProgress {
    pub id: HostId,
    pub ip: IpAddr,
    pub hostname: Option<String>,
    pub scan_status: HostScanStatus,
    pub scan_progress_percent: u8,
    pub scan_error_message: Option<String>,
    pub ports_discovered: u32,
    pub is_vm: bool,
    pub vm_type: Option<String>,
}

impl From<&Host> for HostProgress {
    fn from(h: &Host) -> Self {
        Self {
            id: h.id,
            ip: h.ip,
            hostname: h.hostname.clone(),
            scan_status: h.scan_status,
            scan_progress_percent: h.scan_progress_percent,
            scan_error_message: h.scan_error_message.clone(),
            ports_discovered: h.ports_discovered,
            is_vm: h.is_vm,
            vm_type: h.vm_type.clone(),
        }
    }
}

/// Poll-based status of one scan.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ScanStatusView {
    #[serde(flatten)]
    pub scan: Scan,
    pub hosts: Vec<HostProgress>,
    pub artifacts: Vec<Artifact>,
}
