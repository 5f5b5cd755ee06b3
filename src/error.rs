use std::net::IpAddr;
use std::time::Duration;

use thiserror::Error;

use crate::types::{HostId, HostScanStatus, ScanId};

/// Repository failures. Fatal to the operation that hit them.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("scan {0} not found")]
    ScanNotFound(ScanId),

    #[error("host {0} not found")]
    HostNotFound(HostId),

    #[error("scan {0} is already terminal")]
    Terminal(ScanId),

    #[error("host {host}: invalid status transition {from} -> {to}")]
    InvalidTransition {
        host: HostId,
        from: HostScanStatus,
        to: HostScanStatus,
    },

    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// Failures of the external scanning tool.
#[derive(Error, Debug)]
pub enum ExecutorError {
    #[error("{program} not found: {source}")]
    NotFound {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to run {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("timed out after {0:?}")]
    Timeout(Duration),

    #[error("exited with status {code:?}: {stderr}")]
    Exit { code: Option<i32>, stderr: String },

    #[error("could not read output {path}: {source}")]
    Output {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Parse(#[from] ParseError),

    #[error("{0}")]
    Other(String),
}

/// Malformed scanner output.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("malformed xml: {0}")]
    Xml(String),

    #[error("unexpected root element <{0}>")]
    UnexpectedRoot(String),

    #[error("no live host in output")]
    NoHost,

    #[error("invalid {field}: {value}")]
    InvalidField { field: &'static str, value: String },
}

#[derive(Error, Debug)]
pub enum ReportError {
    #[error("io error writing {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("{0}")]
    Other(String),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProcessError {
    #[error("process inspection unavailable: {0}")]
    Unavailable(String),

    #[error("process {0} not found")]
    NotFound(u32),

    #[error("could not signal process {pid}: {reason}")]
    Signal { pid: u32, reason: String },
}

#[derive(Error, Debug)]
pub enum DetectError {
    #[error("could not list interfaces: {0}")]
    Interfaces(#[from] std::io::Error),

    #[error("no routable or non-bridge IPv4 network found")]
    NoNetwork,
}

/// Why a single host's deep scan failed. Recorded on the host row, never propagated.
#[derive(Error, Debug)]
pub enum HostScanError {
    #[error("host scan for {addr} failed: {source}")]
    Executor {
        addr: IpAddr,
        #[source]
        source: ExecutorError,
    },

    #[error("host scan output for {addr} unusable: {source}")]
    Parse {
        addr: IpAddr,
        #[source]
        source: ParseError,
    },

    #[error("could not record results for {addr}: {source}")]
    Persistence {
        addr: IpAddr,
        #[source]
        source: StoreError,
    },
}

/// Scan-level errors.
#[derive(Error, Debug)]
pub enum ScanError {
    #[error("discovery failed: {0}")]
    Discovery(#[source] ExecutorError),

    #[error("report generation failed: {0}")]
    Report(#[source] ReportError),

    #[error("persistence failed: {0}")]
    Persistence(#[from] StoreError),

    #[error("no targets for scan {scan_id}: {reason}")]
    NoTargets { scan_id: ScanId, reason: String },

    #[error("invalid target for scan {scan_id}: {target}")]
    InvalidTarget { scan_id: ScanId, target: String },

    #[error("scan {0} not found")]
    NotFound(ScanId),
}
