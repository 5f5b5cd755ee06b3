//! Stuck-scan monitor.
//!
//! Works only from persisted rows, so it also catches scans whose
//! orchestrator died. Each sweep diagnoses every PENDING or RUNNING scan,
//! applying the checks in order: total runtime, stalled progress, pending
//! timeout. A stuck scan has its scanner processes stopped (SIGTERM, grace
//! period, then SIGKILL for survivors) and is failed together with its
//! unfinished hosts. Hosts that sit in SCANNING too long on an otherwise
//! healthy scan are handled one by one.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use time::OffsetDateTime;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::clock::{elapsed_between, Clock};
use crate::config::MonitorConfig;
use crate::error::StoreError;
use crate::executor::process_signature;
use crate::process::{ProcessFilter, ProcessInspector};
use crate::store::ScanRepository;
use crate::types::{Host, HostId, HostScanStatus, Scan, ScanId, ScanStatus};

/// Why a scan was judged stuck.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StuckReason {
    RuntimeExceeded { elapsed: Duration, limit: Duration },
    StalledProgress { idle: Duration, limit: Duration },
    PendingTimeout { elapsed: Duration, limit: Duration },
}

impl fmt::Display for StuckReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StuckReason::RuntimeExceeded { elapsed, limit } => write!(
                f,
                "runtime exceeded ({}s elapsed, limit {}s)",
                elapsed.as_secs(),
                limit.as_secs()
            ),
            StuckReason::StalledProgress { idle, limit } => write!(
                f,
                "stalled progress (no change for {}s, limit {}s)",
                idle.as_secs(),
                limit.as_secs()
            ),
            StuckReason::PendingTimeout { elapsed, limit } => write!(
                f,
                "pending timeout (no progress after {}s, limit {}s)",
                elapsed.as_secs(),
                limit.as_secs()
            ),
        }
    }
}

/// Classify a scan. `None` means it looks healthy.
pub fn diagnose(scan: &Scan, now: OffsetDateTime, config: &MonitorConfig) -> Option<StuckReason> {
    if scan.status.is_terminal() {
        return None;
    }
    let elapsed = elapsed_between(scan.created_at, now);
    if elapsed > config.max_runtime {
        return Some(StuckReason::RuntimeExceeded {
            elapsed,
            limit: config.max_runtime,
        });
    }
    if scan.status == ScanStatus::Running {
        let idle = elapsed_between(scan.progress_updated_at, now);
        if idle > config.stall_threshold {
            return Some(StuckReason::StalledProgress {
                idle,
                limit: config.stall_threshold,
            });
        }
    }
    if scan.progress_percent == 0 && elapsed > config.pending_timeout {
        return Some(StuckReason::PendingTimeout {
            elapsed,
            limit: config.pending_timeout,
        });
    }
    None
}

/// Outcome of one sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub inspected: usize,
    pub failed_scans: Vec<ScanId>,
    pub zombie_hosts: Vec<HostId>,
    pub errors: Vec<String>,
}

impl SweepReport {
    pub fn is_quiet(&self) -> bool {
        self.failed_scans.is_empty() && self.zombie_hosts.is_empty() && self.errors.is_empty()
    }
}

/// What process cleanup found and did.
#[derive(Debug, Default)]
struct Cleanup {
    found: Vec<u32>,
    forced: Vec<u32>,
    problems: Vec<String>,
    inspection_failed: bool,
}

impl fmt::Display for Cleanup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.inspection_failed {
            write!(f, "process cleanup skipped")?;
        } else if self.found.is_empty() {
            write!(f, "no executor process found (orchestrator may have crashed)")?;
        } else {
            write!(
                f,
                "terminated {} executor process(es) {:?}, {} force-killed",
                self.found.len(),
                self.found,
                self.forced.len()
            )?;
        }
        for p in &self.problems {
            write!(f, "; {p}")?;
        }
        Ok(())
    }
}

/// A stuck scan or a zombie host, waiting for its processes to be stopped.
enum Remedy {
    Scan { scan: Scan, reason: StuckReason },
    Zombie { scan_id: ScanId, host: Host },
}

impl Remedy {
    fn filter(&self, program: &str) -> ProcessFilter {
        let needle = match self {
            Remedy::Scan { scan, .. } => process_signature(scan.id, None),
            Remedy::Zombie { scan_id, host } => process_signature(*scan_id, Some(host.ip)),
        };
        ProcessFilter::new(program.to_string(), needle)
    }
}

pub struct StuckScanMonitor {
    repo: Arc<dyn ScanRepository>,
    inspector: Arc<dyn ProcessInspector>,
    clock: Arc<dyn Clock>,
    config: MonitorConfig,
}

impl StuckScanMonitor {
    pub fn new(
        repo: Arc<dyn ScanRepository>,
        inspector: Arc<dyn ProcessInspector>,
        clock: Arc<dyn Clock>,
        config: MonitorConfig,
    ) -> Self {
        Self {
            repo,
            inspector,
            clock,
            config,
        }
    }

    /// One pass over every active scan. Problems with one scan are recorded
    /// in the report and never stop the others.
    ///
    /// Process cleanup for everything found stuck runs as one escalation, so
    /// a sweep waits a single grace period however many scans it fails.
    pub async fn sweep(&self) -> SweepReport {
        let mut report = SweepReport::default();
        let scans = match self.repo.list_active_scans().await {
            Ok(s) => s,
            Err(e) => {
                error!("monitor could not list active scans: {e}");
                report.errors.push(e.to_string());
                return report;
            }
        };

        let mut remedies = Vec::new();
        for scan in scans {
            report.inspected += 1;
            let now = self.clock.now();
            match diagnose(&scan, now, &self.config) {
                Some(reason) => {
                    warn!(scan_id = %scan.id, %reason, "scan is stuck");
                    remedies.push(Remedy::Scan { scan, reason });
                }
                None if scan.status == ScanStatus::Running => match self.zombies(&scan, now).await {
                    Ok(hosts) => remedies.extend(hosts.into_iter().map(|host| Remedy::Zombie {
                        scan_id: scan.id,
                        host,
                    })),
                    Err(e) => report.errors.push(format!("scan {}: {e}", scan.id)),
                },
                None => {}
            }
        }
        if remedies.is_empty() {
            return report;
        }

        let cleanups = self.stop_processes(&remedies).await;
        for (remedy, cleanup) in remedies.iter().zip(cleanups) {
            match remedy {
                Remedy::Scan { scan, reason } => match self.fail_scan(scan, reason, &cleanup).await {
                    Ok(true) => report.failed_scans.push(scan.id),
                    Ok(false) => debug!(scan_id = %scan.id, "scan finished before it could be failed"),
                    Err(e) => report.errors.push(format!("scan {}: {e}", scan.id)),
                },
                Remedy::Zombie { scan_id, host } => match self.fail_zombie(host, &cleanup).await {
                    Ok(true) => report.zombie_hosts.push(host.id),
                    Ok(false) => debug!(host = %host.ip, "host finished before it could be failed"),
                    Err(e) => report.errors.push(format!("scan {scan_id}: {e}")),
                },
            }
        }
        report
    }

    async fn fail_scan(
        &self,
        scan: &Scan,
        reason: &StuckReason,
        cleanup: &Cleanup,
    ) -> Result<bool, StoreError> {
        let hosts = self.repo.list_hosts(scan.id).await?;
        let count = |s: HostScanStatus| hosts.iter().filter(|h| h.scan_status == s).count();
        let unfinished = hosts.iter().filter(|h| !h.scan_status.is_terminal()).count();
        let message = format!(
            "Terminated by monitor: {reason}. Hosts: {} completed, {} failed, {unfinished} unfinished. {cleanup}",
            count(HostScanStatus::Completed),
            count(HostScanStatus::Failed),
        );
        if !self
            .repo
            .fail_scan_if_active(scan.id, &message, self.clock.now())
            .await?
        {
            return Ok(false);
        }
        info!(scan_id = %scan.id, "{message}");

        let host_message = format!("parent scan {} terminated by monitor: {reason}", scan.id);
        for host in hosts.iter().filter(|h| !h.scan_status.is_terminal()) {
            self.repo
                .fail_host_if_active(host.id, &host_message, self.clock.now())
                .await?;
        }
        Ok(true)
    }

    fn is_zombie(&self, host: &Host, now: OffsetDateTime) -> bool {
        host.scan_status == HostScanStatus::Scanning
            && host
                .scan_started_at
                .is_some_and(|t| elapsed_between(t, now) > self.config.host_timeout)
    }

    async fn zombies(&self, scan: &Scan, now: OffsetDateTime) -> Result<Vec<Host>, StoreError> {
        let hosts = self.repo.list_hosts(scan.id).await?;
        Ok(hosts
            .into_iter()
            .filter(|h| self.is_zombie(h, now))
            .inspect(|h| warn!(scan_id = %scan.id, host = %h.ip, "host scan exceeded its time limit"))
            .collect())
    }

    async fn fail_zombie(&self, host: &Host, cleanup: &Cleanup) -> Result<bool, StoreError> {
        let message = format!(
            "host scan exceeded {}s and was terminated by monitor; {cleanup}",
            self.config.host_timeout.as_secs()
        );
        self.repo
            .fail_host_if_active(host.id, &message, self.clock.now())
            .await
    }

    /// SIGTERM everything matching any remedy, wait the grace period once,
    /// then SIGKILL survivors. Best effort: failures are collected, never
    /// returned. One [`Cleanup`] per remedy, in order.
    async fn stop_processes(&self, remedies: &[Remedy]) -> Vec<Cleanup> {
        let filters: Vec<ProcessFilter> = remedies
            .iter()
            .map(|r| r.filter(&self.config.process_name))
            .collect();
        let mut cleanups = Vec::with_capacity(filters.len());
        for filter in &filters {
            cleanups.push(self.signal(filter).await);
        }
        if cleanups.iter().all(|c| c.found.is_empty()) {
            return cleanups;
        }

        tokio::time::sleep(self.config.grace_period).await;
        for (filter, cleanup) in filters.iter().zip(cleanups.iter_mut()) {
            if !cleanup.found.is_empty() {
                self.kill_survivors(filter, cleanup).await;
            }
        }
        cleanups
    }

    async fn signal(&self, filter: &ProcessFilter) -> Cleanup {
        let mut cleanup = Cleanup::default();
        match self.inspector.list_processes(filter).await {
            Ok(found) => cleanup.found = found.into_iter().map(|p| p.pid).collect(),
            Err(e) => {
                warn!(needle = %filter.needle, "process inspection failed: {e}");
                cleanup.inspection_failed = true;
                cleanup.problems.push(e.to_string());
                return cleanup;
            }
        }
        for &pid in &cleanup.found {
            if let Err(e) = self.inspector.terminate(pid, false).await {
                debug!(pid, "graceful termination failed: {e}");
                cleanup.problems.push(e.to_string());
            }
        }
        cleanup
    }

    async fn kill_survivors(&self, filter: &ProcessFilter, cleanup: &mut Cleanup) {
        let survivors: Vec<u32> = match self.inspector.list_processes(filter).await {
            Ok(still) => still
                .into_iter()
                .map(|p| p.pid)
                .filter(|pid| cleanup.found.contains(pid))
                .collect(),
            Err(e) => {
                cleanup.problems.push(e.to_string());
                cleanup.found.clone()
            }
        };
        for pid in survivors {
            match self.inspector.terminate(pid, true).await {
                Ok(()) => cleanup.forced.push(pid),
                Err(e) => cleanup.problems.push(e.to_string()),
            }
        }
    }

    /// Run [`StuckScanMonitor::sweep`] every `interval` until stopped.
    pub fn start(self: Arc<Self>) -> MonitorHandle {
        let token = CancellationToken::new();
        let cancel = token.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.config.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            info!(interval = ?self.config.interval, "stuck-scan monitor started");
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let report = self.sweep().await;
                        if report.is_quiet() {
                            debug!(inspected = report.inspected, "monitor sweep clean");
                        } else {
                            info!(
                                inspected = report.inspected,
                                failed = report.failed_scans.len(),
                                zombies = report.zombie_hosts.len(),
                                errors = report.errors.len(),
                                "monitor sweep"
                            );
                        }
                    }
                }
            }
            info!("stuck-scan monitor stopped");
        });
        MonitorHandle { token, handle }
    }
}

pub struct MonitorHandle {
    token: CancellationToken,
    handle: JoinHandle<()>,
}

impl MonitorHandle {
    /// Cancel the loop and wait for it. A sweep in flight finishes first.
    pub async fn stop(self) {
        self.token.cancel();
        if let Err(e) = self.handle.await {
            error!("monitor task failed: {e}");
        }
    }
}
