use std::path::PathBuf;
use std::time::Duration;

/// Knobs for a scan run.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Maximum number of host scans executing at once.
    pub parallelism: usize,
    pub discovery_timeout: Duration,
    /// Bound on a single host's deep scan.
    pub host_timeout: Duration,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            parallelism: 8,
            discovery_timeout: Duration::from_secs(30 * 60),
            host_timeout: Duration::from_secs(5 * 60),
        }
    }
}

impl OrchestratorConfig {
    pub fn effective_parallelism(&self) -> usize {
        self.parallelism.max(1)
    }
}

/// Thresholds for the stuck-scan monitor. Checks apply in the order
/// runtime, stall, pending.
#[derive(Debug, Clone)]
pub struct MonitorConfig {
    pub interval: Duration,
    pub max_runtime: Duration,
    pub stall_threshold: Duration,
    pub pending_timeout: Duration,
    /// A host SCANNING longer than this is a zombie candidate.
    pub host_timeout: Duration,
    /// Wait between the graceful and the forced termination signal.
    pub grace_period: Duration,
    /// Executable name of scanner processes to look for.
    pub process_name: String,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
            max_runtime: Duration::from_secs(2 * 60 * 60),
            stall_threshold: Duration::from_secs(10 * 60),
            pending_timeout: Duration::from_secs(5 * 60),
            host_timeout: Duration::from_secs(15 * 60),
            grace_period: Duration::from_secs(5),
            process_name: "nmap".to_string(),
        }
    }
}

/// How the external scanner is invoked.
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    pub nmap_path: PathBuf,
    /// Where scanner XML output is written. File names double as the
    /// process signature the monitor matches on.
    pub output_dir: PathBuf,
    /// Optional nmap `-p` spec for deep scans; nmap's default port set otherwise.
    pub ports: Option<String>,
    pub extra_args: Vec<String>,
    /// Only report hosts with at least one open port from discovery.
    pub require_open_port: bool,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            nmap_path: PathBuf::from("nmap"),
            output_dir: PathBuf::from("./scan_outputs"),
            ports: None,
            extra_args: Vec::new(),
            require_open_port: true,
        }
    }
}

impl ExecutorConfig {
    /// Executable name used to match running scanner processes.
    pub fn program_name(&self) -> String {
        self.nmap_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "nmap".to_string())
    }
}
