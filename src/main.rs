use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::Parser;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use lan_recon::clock::{Clock, SystemClock};
use lan_recon::config::{ExecutorConfig, MonitorConfig, OrchestratorConfig};
use lan_recon::executor::NmapExecutor;
use lan_recon::monitor::StuckScanMonitor;
use lan_recon::netdetect::{self, InterfaceDetector};
use lan_recon::orchestrator::Orchestrator;
use lan_recon::ports;
use lan_recon::process::SystemProcessInspector;
use lan_recon::reports::FileReportGenerator;
use lan_recon::server::{self, AppState};
use lan_recon::sqlite::SqliteStore;
use lan_recon::store::ScanRepository;
use lan_recon::types::{ScanStatus, ScanStatusView};

/// lan-recon: nmap-driven LAN reconnaissance with live progress and stuck-scan recovery.
#[derive(Debug, Clone, Parser)]
#[command(
    name = "lan-recon",
    version,
    about = "nmap-driven LAN reconnaissance with live progress and stuck-scan recovery.",
    long_about = None
)]
struct Cli {
    /// Comma-separated CIDRs/IPs, or path to a file with one per line. If omitted, auto-detect the local network.
    #[arg(long, env = "LAN_RECON_TARGETS")]
    targets: Option<String>,

    /// Ports for deep scans: inline list (`22,80,8000-8010`) or path to a ports file. nmap defaults if omitted.
    #[arg(long, env = "LAN_RECON_PORTS")]
    ports: Option<String>,

    /// Path to the nmap binary.
    #[arg(long, env = "LAN_RECON_NMAP", default_value = "nmap")]
    nmap: PathBuf,

    /// Directory for raw scanner output and reports.
    #[arg(long = "output-dir", env = "LAN_RECON_OUTPUT_DIR", default_value = "./scan_outputs")]
    output_dir: PathBuf,

    /// SQLite database holding scans, hosts and artifacts across runs.
    #[arg(long, env = "LAN_RECON_DB", default_value = "./lan_recon.db")]
    db: PathBuf,

    /// Keep discovered hosts even when no open port was seen.
    #[arg(long = "all-hosts", default_value_t = false)]
    all_hosts: bool,

    /// Max host deep scans running at once.
    #[arg(long, env = "LAN_RECON_PARALLELISM", default_value_t = 8)]
    parallelism: usize,

    /// Discovery timeout in seconds.
    #[arg(long = "discovery-timeout", default_value_t = 1800)]
    discovery_timeout: u64,

    /// Per-host deep scan timeout in seconds.
    #[arg(long = "host-timeout", default_value_t = 300)]
    host_timeout: u64,

    /// Seconds between stuck-scan sweeps.
    #[arg(long = "monitor-interval", default_value_t = 60)]
    monitor_interval: u64,

    /// A scan running longer than this many seconds is failed.
    #[arg(long = "max-runtime", default_value_t = 7200)]
    max_runtime: u64,

    /// A scan whose progress has not moved for this many seconds is failed.
    #[arg(long = "stall-threshold", default_value_t = 600)]
    stall_threshold: u64,

    /// A scan still at 0% after this many seconds is failed.
    #[arg(long = "pending-timeout", default_value_t = 300)]
    pending_timeout: u64,

    /// A host scanning longer than this many seconds is treated as a zombie.
    #[arg(long = "zombie-host-timeout", default_value_t = 900)]
    zombie_host_timeout: u64,

    /// Write the final scan status as pretty JSON to this path (optional).
    #[arg(long)]
    output: Option<PathBuf>,

    /// Serve the HTTP API on this address (e.g. 127.0.0.1:8080) instead of running one scan.
    #[arg(long, env = "LAN_RECON_SERVE")]
    serve: Option<String>,

    /// Verbose logging (overridden by RUST_LOG).
    #[arg(short, long, default_value_t = false)]
    verbose: bool,
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "lan_recon=debug,tower_http=debug" } else { "lan_recon=info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

/// Comma-separated list or a file with one target per line (`#` comments allowed).
fn load_targets(arg: &str) -> Result<Vec<String>> {
    let path = Path::new(arg);
    let raw = if path.is_file() {
        fs::read_to_string(path).with_context(|| format!("reading targets file {}", path.display()))?
    } else {
        arg.replace(',', "\n")
    };
    let targets: Vec<String> = raw
        .lines()
        .map(|l| l.split('#').next().unwrap_or("").trim())
        .filter(|l| !l.is_empty())
        .map(str::to_string)
        .collect();
    if let Some(bad) = targets.iter().find(|t| !netdetect::is_valid_target(t)) {
        bail!("invalid target: {bad}");
    }
    Ok(targets)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let targets = cli.targets.as_deref().map(load_targets).transpose()?;
    let port_spec = match cli.ports.as_deref() {
        Some(arg) => ports::port_spec_from_arg(arg)?,
        None => None,
    };

    info!(
        targets = %targets.as_ref().map(|t| t.join(",")).unwrap_or_else(|| "<auto-detect>".into()),
        ports = %port_spec.as_deref().unwrap_or("<nmap default>"),
        parallelism = cli.parallelism,
        output_dir = %cli.output_dir.display(),
        db = %cli.db.display(),
        "lan-recon configuration"
    );
    if let Some(t) = &targets {
        let capacity: u64 = t.iter().map(|s| netdetect::host_capacity(s)).sum();
        info!(capacity, "addresses in target ranges");
    }

    let executor_config = ExecutorConfig {
        nmap_path: cli.nmap.clone(),
        output_dir: cli.output_dir.clone(),
        ports: port_spec,
        require_open_port: !cli.all_hosts,
        ..Default::default()
    };
    let monitor_config = MonitorConfig {
        interval: Duration::from_secs(cli.monitor_interval.max(1)),
        max_runtime: Duration::from_secs(cli.max_runtime),
        stall_threshold: Duration::from_secs(cli.stall_threshold),
        pending_timeout: Duration::from_secs(cli.pending_timeout),
        host_timeout: Duration::from_secs(cli.zombie_host_timeout),
        process_name: executor_config.program_name(),
        ..Default::default()
    };
    let orchestrator_config = OrchestratorConfig {
        parallelism: cli.parallelism,
        discovery_timeout: Duration::from_secs(cli.discovery_timeout),
        host_timeout: Duration::from_secs(cli.host_timeout),
    };

    let store = SqliteStore::open(&cli.db)
        .with_context(|| format!("opening scan database {}", cli.db.display()))?;
    let repo: Arc<dyn ScanRepository> = Arc::new(store);
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let orchestrator = Arc::new(Orchestrator::new(
        repo.clone(),
        Arc::new(NmapExecutor::new(executor_config)),
        Arc::new(FileReportGenerator::new(&cli.output_dir)),
        Arc::new(InterfaceDetector),
        clock.clone(),
        orchestrator_config,
    ));
    let monitor = Arc::new(StuckScanMonitor::new(
        repo,
        Arc::new(SystemProcessInspector),
        clock,
        monitor_config,
    ))
    .start();

    if let Some(bind) = cli.serve.as_deref() {
        let state = AppState::new(orchestrator);
        tokio::select! {
            res = server::spawn_server(bind, state) => {
                if let Err(e) = res {
                    error!("HTTP server error: {e}");
                }
            }
            _ = tokio::signal::ctrl_c() => info!("shutting down"),
        }
        monitor.stop().await;
        return Ok(());
    }

    let result = orchestrator.run_scan(targets).await;
    monitor.stop().await;
    let scan_id = result?;
    let view = orchestrator.scan_status(scan_id).await?;
    print_results_table(&view);
    if let Some(path) = cli.output.as_deref() {
        if let Err(e) = write_results_json(path, &view) {
            warn!("failed to write JSON to {}: {e}", path.display());
        } else {
            info!("wrote JSON results to {}", path.display());
        }
    }
    if view.scan.status == ScanStatus::Failed {
        bail!("{}", view.scan.progress_message);
    }
    Ok(())
}

fn print_results_table(view: &ScanStatusView) {
    let scan = &view.scan;
    println!(
        "\nScan {}: {} ({}%) {}",
        scan.id, scan.status, scan.progress_percent, scan.progress_message
    );

    let mut ip_w = "ip".len();
    let mut host_w = "hostname".len();
    let mut vm_w = "vm".len();
    for h in &view.hosts {
        ip_w = ip_w.max(h.ip.to_string().len());
        host_w = host_w.max(h.hostname.as_deref().unwrap_or("-").len().min(40));
        vm_w = vm_w.max(h.vm_type.as_deref().unwrap_or("-").len());
    }
    let status_w = "completed".len();
    let ports_w = "ports".len();

    println!(
        "{:<ip_w$}  {:<host_w$}  {:<status_w$}  {:>ports_w$}  {:<vm_w$}  error",
        "ip", "hostname", "status", "ports", "vm",
    );
    println!(
        "{:-<ip_w$}  {:-<host_w$}  {:-<status_w$}  {:-<ports_w$}  {:-<vm_w$}  -----",
        "", "", "", "", "",
    );
    for h in &view.hosts {
        let hostname: String = h.hostname.as_deref().unwrap_or("-").chars().take(40).collect();
        println!(
            "{:<ip_w$}  {:<host_w$}  {:<status_w$}  {:>ports_w$}  {:<vm_w$}  {}",
            h.ip.to_string(),
            hostname,
            h.scan_status.to_string(),
            h.ports_discovered,
            h.vm_type.as_deref().unwrap_or("-"),
            h.scan_error_message.as_deref().unwrap_or(""),
        );
    }
    for a in &view.artifacts {
        println!("report: {}", a.file_path.display());
    }
}

fn write_results_json(path: &Path, view: &ScanStatusView) -> Result<()> {
    let file = File::create(path)?;
    serde_json::to_writer_pretty(file, view)?;
    Ok(())
}
