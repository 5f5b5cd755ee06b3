//! The external scanner, invoked as a child process.

use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::config::ExecutorConfig;
use crate::error::ExecutorError;
use crate::netdetect;
use crate::parser;
use crate::types::ScanId;

/// Intermediate per-host progress, 0..=100. Receivers should treat values as hints
/// and keep them monotonic.
pub type ProgressSender = mpsc::UnboundedSender<u8>;

/// Raw result of one host's deep scan, before parsing.
#[derive(Debug, Clone)]
pub struct RawScanOutput {
    pub address: IpAddr,
    pub xml: String,
    pub output_path: Option<PathBuf>,
}

#[async_trait]
pub trait ScanExecutor: Send + Sync {
    /// One sweep over every target. Returns live addresses.
    async fn discover(
        &self,
        scan_id: ScanId,
        targets: &[String],
        timeout: Duration,
    ) -> Result<Vec<IpAddr>, ExecutorError>;

    /// Deep scan of a single address.
    async fn scan_host(
        &self,
        scan_id: ScanId,
        addr: IpAddr,
        timeout: Duration,
        progress: ProgressSender,
    ) -> Result<RawScanOutput, ExecutorError>;
}

fn addr_slug(addr: IpAddr) -> String {
    addr.to_string().replace(['.', ':'], "_")
}

/// Command-line fragment identifying scanner processes of a scan, or of one
/// host within it. Output file names are built from the same fragment.
pub fn process_signature(scan_id: ScanId, addr: Option<IpAddr>) -> String {
    match addr {
        None => format!("scan_{scan_id}_"),
        Some(a) => format!("scan_{scan_id}_{}.xml", addr_slug(a)),
    }
}

/// Runs `nmap` with XML output written next to the configured output dir.
#[derive(Debug, Clone)]
pub struct NmapExecutor {
    config: ExecutorConfig,
}

impl NmapExecutor {
    pub fn new(config: ExecutorConfig) -> Self {
        Self { config }
    }

    pub fn discovery_output(&self, scan_id: ScanId) -> PathBuf {
        self.config
            .output_dir
            .join(format!("scan_{scan_id}_discovery.xml"))
    }

    pub fn host_output(&self, scan_id: ScanId, addr: IpAddr) -> PathBuf {
        self.config
            .output_dir
            .join(process_signature(scan_id, Some(addr)))
    }

    pub fn discovery_args(&self, output: &Path, targets: &[String]) -> Vec<String> {
        let mut args: Vec<String> = [
            "-F",
            "--max-retries",
            "1",
            "--host-timeout",
            "30s",
            "-T4",
            "-oX",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect();
        args.push(output.display().to_string());
        if targets.iter().any(|t| netdetect::is_ipv6_target(t)) {
            args.push("-6".to_string());
        }
        args.extend(self.config.extra_args.iter().cloned());
        args.extend(targets.iter().cloned());
        args
    }

    pub fn host_args(&self, output: &Path, addr: IpAddr) -> Vec<String> {
        let mut args: Vec<String> = [
            "-sV",
            "-O",
            "-R",
            "--osscan-guess",
            "-T4",
            "--traceroute",
            "--version-intensity",
            "2",
            "--max-retries",
            "1",
            "--max-os-tries",
            "1",
            "--host-timeout",
            "240s",
            "--stats-every",
            "5s",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect();
        if addr.is_ipv6() {
            args.push("-6".to_string());
        }
        if let Some(spec) = &self.config.ports {
            args.push("-p".to_string());
            args.push(spec.clone());
        }
        args.extend(self.config.extra_args.iter().cloned());
        args.push("-oX".to_string());
        args.push(output.display().to_string());
        args.push(addr.to_string());
        args
    }

    async fn run(
        &self,
        args: Vec<String>,
        timeout: Duration,
        progress: Option<ProgressSender>,
    ) -> Result<(), ExecutorError> {
        let program = self.config.nmap_path.display().to_string();
        tokio::fs::create_dir_all(&self.config.output_dir)
            .await
            .map_err(|source| ExecutorError::Output {
                path: self.config.output_dir.display().to_string(),
                source,
            })?;

        let mut cmd = Command::new(&self.config.nmap_path);
        cmd.args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        debug!("Executing nmap: {:?}", cmd);

        let mut child = cmd.spawn().map_err(|source| {
            if source.kind() == std::io::ErrorKind::NotFound {
                ExecutorError::NotFound {
                    program: program.clone(),
                    source,
                }
            } else {
                ExecutorError::Spawn {
                    program: program.clone(),
                    source,
                }
            }
        })?;

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();

        let run = async {
            let read_stats = async {
                let Some(out) = stdout else { return };
                let mut lines = BufReader::new(out).lines();
                let mut stats = StatsTracker::default();
                while let Ok(Some(line)) = lines.next_line().await {
                    if let (Some(tx), Some(p)) = (progress.as_ref(), stats.observe(&line)) {
                        let _ = tx.send(p);
                    }
                }
            };
            let read_stderr = async {
                let mut buf = String::new();
                if let Some(mut err) = stderr {
                    let _ = err.read_to_string(&mut buf).await;
                }
                buf
            };
            let (_, err_text, status) = tokio::join!(read_stats, read_stderr, child.wait());
            (err_text, status)
        };

        let outcome = tokio::time::timeout(timeout, run).await;
        let (err_text, status) = match outcome {
            Ok(done) => done,
            Err(_) => {
                warn!("nmap exceeded {:?}, killing", timeout);
                let _ = child.start_kill();
                let _ = child.wait().await;
                return Err(ExecutorError::Timeout(timeout));
            }
        };

        let status = status.map_err(|source| ExecutorError::Spawn { program, source })?;
        if !status.success() {
            return Err(ExecutorError::Exit {
                code: status.code(),
                stderr: tail(err_text.trim(), 500),
            });
        }
        Ok(())
    }

    async fn read_output(path: &Path) -> Result<String, ExecutorError> {
        tokio::fs::read_to_string(path)
            .await
            .map_err(|source| ExecutorError::Output {
                path: path.display().to_string(),
                source,
            })
    }
}

#[async_trait]
impl ScanExecutor for NmapExecutor {
    async fn discover(
        &self,
        scan_id: ScanId,
        targets: &[String],
        timeout: Duration,
    ) -> Result<Vec<IpAddr>, ExecutorError> {
        let output = self.discovery_output(scan_id);
        let args = self.discovery_args(&output, targets);
        self.run(args, timeout, None).await?;
        let xml = Self::read_output(&output).await?;
        Ok(parser::parse_discovery(&xml, self.config.require_open_port)?)
    }

    async fn scan_host(
        &self,
        scan_id: ScanId,
        addr: IpAddr,
        timeout: Duration,
        progress: ProgressSender,
    ) -> Result<RawScanOutput, ExecutorError> {
        let output = self.host_output(scan_id, addr);
        let args = self.host_args(&output, addr);
        self.run(args, timeout, Some(progress)).await?;
        let xml = Self::read_output(&output).await?;
        Ok(RawScanOutput {
            address: addr,
            xml,
            output_path: Some(output),
        })
    }
}

fn tail(s: &str, max: usize) -> String {
    if s.len() <= max {
        return s.to_string();
    }
    let mut start = s.len() - max;
    while !s.is_char_boundary(start) {
        start += 1;
    }
    s[start..].to_string()
}

/// Progress band of a scanner sub-phase. Ping and DNS phases carry no band.
fn phase_band(phase: &str) -> Option<(u8, u8)> {
    let p = phase.to_ascii_lowercase();
    if p.contains("service scan") {
        Some((40, 75))
    } else if p.contains("os detection") {
        Some((75, 90))
    } else if p.contains("traceroute") || p.contains("nse") || p.contains("script") {
        Some((90, 99))
    } else if p.contains("stealth scan") || p.contains("connect scan") || p.contains("udp scan") {
        Some((0, 40))
    } else {
        None
    }
}

/// Turns `--stats-every` output into a monotonic host percentage.
#[derive(Debug, Default)]
pub struct StatsTracker {
    last: u8,
}

impl StatsTracker {
    /// Returns a new value only when it advances.
    pub fn observe(&mut self, line: &str) -> Option<u8> {
        let p = parse_stats_line(line)?;
        if p > self.last {
            self.last = p;
            Some(p)
        } else {
            None
        }
    }
}

/// `SYN Stealth Scan Timing: About 45.50% done; ...` or `Completed Service scan at ...`.
pub fn parse_stats_line(line: &str) -> Option<u8> {
    let line = line.trim();
    if let Some(rest) = line.strip_prefix("Completed ") {
        let phase = rest.split(" at ").next()?;
        return phase_band(phase).map(|(_, hi)| hi);
    }
    let (phase, rest) = line.split_once(" Timing: About ")?;
    let pct: f64 = rest.split('%').next()?.trim().parse().ok()?;
    let (lo, hi) = phase_band(phase)?;
    let span = f64::from(hi - lo);
    let value = f64::from(lo) + span * pct.clamp(0.0, 100.0) / 100.0;
    Some(value.floor() as u8)
}
