//! Progress discipline for scan and host rows.
//!
//! Scan progress bands: discovery 0..=15, host scanning 15..=90, reporting
//! 90..=100. While hosts complete, every write to the scan row goes through
//! [`ScanProgress::record_completion`], which holds one lock across the
//! count increment and the repository write so completions cannot
//! interleave and regress the percentage.

use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::debug;

use crate::clock::Clock;
use crate::error::StoreError;
use crate::store::{HostPatch, ScanPatch, ScanRepository};
use crate::types::{HostId, Scan, ScanId};

pub const DISCOVERY_DONE: u8 = 15;
pub const HOSTS_DONE: u8 = 90;
pub const REPORTS_DONE: u8 = 100;

/// `15 + floor(75 * completed / total)`, clamped to the host-scanning band.
pub fn host_phase_percent(completed: usize, total: usize) -> u8 {
    if total == 0 {
        return HOSTS_DONE;
    }
    let span = u64::from(HOSTS_DONE - DISCOVERY_DONE);
    let done = completed.min(total) as u64;
    let pct = u64::from(DISCOVERY_DONE) + span * done / total as u64;
    pct.clamp(u64::from(DISCOVERY_DONE), u64::from(HOSTS_DONE)) as u8
}

/// How one host's scan ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostOutcome {
    Completed { ports: u32 },
    Failed(String),
}

impl HostOutcome {
    pub fn is_failed(&self) -> bool {
        matches!(self, HostOutcome::Failed(_))
    }
}

#[derive(Debug, Default)]
struct Counts {
    done: usize,
    failed: usize,
}

/// Aggregates host completions into the scan row.
pub struct ScanProgress {
    repo: Arc<dyn ScanRepository>,
    clock: Arc<dyn Clock>,
    scan_id: ScanId,
    total: usize,
    counts: Mutex<Counts>,
}

impl ScanProgress {
    pub fn new(
        repo: Arc<dyn ScanRepository>,
        clock: Arc<dyn Clock>,
        scan_id: ScanId,
        total: usize,
    ) -> Self {
        Self {
            repo,
            clock,
            scan_id,
            total,
            counts: Mutex::new(Counts::default()),
        }
    }

    pub async fn record_completion(&self, outcome: &HostOutcome) -> Result<Scan, StoreError> {
        let mut counts = self.counts.lock().await;
        counts.done += 1;
        if outcome.is_failed() {
            counts.failed += 1;
        }
        let pct = host_phase_percent(counts.done, self.total);
        let mut message = format!("Scanned {} of {} hosts", counts.done, self.total);
        if counts.failed > 0 {
            message.push_str(&format!(" ({} failed)", counts.failed));
        }
        self.repo
            .update_scan(self.scan_id, ScanPatch::progress(pct, message), self.clock.now())
            .await
    }

    /// Hosts completed so far and how many of those failed.
    pub async fn counts(&self) -> (usize, usize) {
        let c = self.counts.lock().await;
        (c.done, c.failed)
    }
}

/// Forwards intermediate executor progress onto one host row.
/// Values are kept monotonic and below 100 until the worker's terminal write.
pub struct HostProgressReporter {
    repo: Arc<dyn ScanRepository>,
    clock: Arc<dyn Clock>,
    host_id: HostId,
    last: u8,
}

impl HostProgressReporter {
    pub fn new(repo: Arc<dyn ScanRepository>, clock: Arc<dyn Clock>, host_id: HostId) -> Self {
        Self {
            repo,
            clock,
            host_id,
            last: 0,
        }
    }

    pub async fn report(&mut self, percent: u8) {
        let p = percent.min(99);
        if p <= self.last {
            return;
        }
        self.last = p;
        if let Err(e) = self
            .repo
            .update_host(self.host_id, HostPatch::progress(p), self.clock.now())
            .await
        {
            debug!(host = %self.host_id, "dropping host progress update: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn host_phase_formula() {
        assert_eq!(host_phase_percent(0, 10), 15);
        assert_eq!(host_phase_percent(6, 10), 60);
        assert_eq!(host_phase_percent(1, 3), 40);
        assert_eq!(host_phase_percent(10, 10), 90);
        assert_eq!(host_phase_percent(12, 10), 90);
        assert_eq!(host_phase_percent(0, 0), 90);
    }

    #[test]
    fn host_phase_is_non_decreasing() {
        let total = 37;
        let mut prev = 0;
        for done in 0..=total {
            let p = host_phase_percent(done, total);
            assert!(p >= prev);
            prev = p;
        }
    }
}
