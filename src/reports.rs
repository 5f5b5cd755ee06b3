//! Report artifacts written once every host of a scan is terminal.

use std::fmt::Write as _;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tracing::debug;

use crate::error::ReportError;
use crate::types::{ArtifactDescriptor, ArtifactKind, ScanSnapshot};

#[async_trait]
pub trait ReportGenerator: Send + Sync {
    async fn generate(&self, snapshot: &ScanSnapshot) -> Result<Vec<ArtifactDescriptor>, ReportError>;
}

/// Writes `scan_<id>.json`, `scan_<id>.html` and `scan_<id>.dot` into one directory.
#[derive(Debug, Clone)]
pub struct FileReportGenerator {
    output_dir: PathBuf,
}

impl FileReportGenerator {
    pub fn new(output_dir: impl Into<PathBuf>) -> Self {
        Self {
            output_dir: output_dir.into(),
        }
    }

    fn path_for(&self, snapshot: &ScanSnapshot, kind: ArtifactKind) -> PathBuf {
        self.output_dir
            .join(format!("scan_{}.{}", snapshot.scan.id, kind.extension()))
    }

    async fn write(&self, path: &Path, body: &[u8]) -> Result<u64, ReportError> {
        let io = |source| ReportError::Io {
            path: path.display().to_string(),
            source,
        };
        tokio::fs::write(path, body).await.map_err(io)?;
        let meta = tokio::fs::metadata(path).await.map_err(io)?;
        Ok(meta.len())
    }
}

#[async_trait]
impl ReportGenerator for FileReportGenerator {
    async fn generate(&self, snapshot: &ScanSnapshot) -> Result<Vec<ArtifactDescriptor>, ReportError> {
        tokio::fs::create_dir_all(&self.output_dir)
            .await
            .map_err(|source| ReportError::Io {
                path: self.output_dir.display().to_string(),
                source,
            })?;

        let rendered = [
            (ArtifactKind::Json, serde_json::to_vec_pretty(snapshot)?),
            (ArtifactKind::Html, render_html(snapshot).into_bytes()),
            (ArtifactKind::Dot, render_dot(snapshot).into_bytes()),
        ];
        let mut out = Vec::with_capacity(rendered.len());
        for (kind, body) in rendered {
            let path = self.path_for(snapshot, kind);
            let size = self.write(&path, &body).await?;
            debug!(scan_id = %snapshot.scan.id, path = %path.display(), size, "wrote report");
            out.push(ArtifactDescriptor {
                kind,
                file_path: path,
                file_size: Some(size),
            });
        }
        Ok(out)
    }
}

fn escape_html(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(c),
        }
    }
    out
}

fn opt(s: &Option<String>) -> String {
    escape_html(s.as_deref().unwrap_or("-"))
}

pub fn render_html(snapshot: &ScanSnapshot) -> String {
    let scan = &snapshot.scan;
    let mut html = String::new();
    let _ = writeln!(
        html,
        "<!DOCTYPE html>\n<html><head><meta charset=\"utf-8\"><title>Scan {}</title></head><body>",
        scan.id
    );
    let _ = writeln!(
        html,
        "<h1>Scan {}</h1>\n<p>Targets: {} | Status: {} | Hosts: {}</p>",
        scan.id,
        escape_html(&scan.targets.join(", ")),
        scan.status,
        snapshot.hosts.len()
    );
    html.push_str(
        "<table border=\"1\">\n<tr><th>ip</th><th>hostname</th><th>os</th><th>vm</th><th>mac</th><th>status</th><th>ports</th></tr>\n",
    );
    for h in &snapshot.hosts {
        let ports = h
            .ports
            .iter()
            .map(|p| {
                let svc = p.service.as_deref().unwrap_or("?");
                format!("{}/{} {}", p.port_number, p.protocol, escape_html(svc))
            })
            .collect::<Vec<_>>()
            .join("<br>");
        let vm = if h.host.is_vm {
            opt(&h.host.vm_type)
        } else {
            "no".to_string()
        };
        let _ = writeln!(
            html,
            "<tr><td>{}</td><td>{}</td><td>{}</td><td>{}</td><td>{}</td><td>{}</td><td>{}</td></tr>",
            h.host.ip,
            opt(&h.host.hostname),
            opt(&h.host.os_type),
            vm,
            opt(&h.host.mac),
            h.host.scan_status,
            ports
        );
    }
    html.push_str("</table>\n</body></html>\n");
    html
}

/// Graphviz topology: scanner -> traceroute hops -> host.
pub fn render_dot(snapshot: &ScanSnapshot) -> String {
    let mut dot = format!("digraph scan_{} {{\n  \"scanner\" [shape=box];\n", snapshot.scan.id);
    let mut edges = std::collections::BTreeSet::new();
    for h in &snapshot.hosts {
        let target = h.host.ip.to_string();
        let label = match &h.host.hostname {
            Some(name) => format!("{target}\\n{name}"),
            None => target.clone(),
        };
        let _ = writeln!(dot, "  \"{target}\" [label=\"{label}\"];");
        let mut prev = "scanner".to_string();
        let mut hops: Vec<_> = h.hops.iter().filter_map(|hop| hop.address).collect();
        if hops.last() == Some(&h.host.ip) {
            hops.pop();
        }
        for addr in hops {
            let node = addr.to_string();
            edges.insert((prev, node.clone()));
            prev = node;
        }
        edges.insert((prev, target));
    }
    for (from, to) in edges {
        let _ = writeln!(dot, "  \"{from}\" -> \"{to}\";");
    }
    dot.push_str("}\n");
    dot
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Host, HostId, HostReport, PortRecord, Scan, ScanId, ScanStatus, TopologyHop};
    use std::net::IpAddr;
    use time::OffsetDateTime;

    fn snapshot() -> ScanSnapshot {
        let now = OffsetDateTime::UNIX_EPOCH;
        let scan = Scan {
            id: ScanId(7),
            targets: vec!["10.0.0.0/30".into()],
            status: ScanStatus::Running,
            progress_percent: 90,
            progress_message: "Generating reports".into(),
            error_message: None,
            total_hosts: Some(1),
            created_at: now,
            started_at: Some(now),
            progress_updated_at: now,
            completed_at: None,
        };
        let ip: IpAddr = "10.0.0.2".parse().unwrap();
        let mut host = Host::new(HostId(1), ScanId(7), ip);
        host.hostname = Some("<nas>".into());
        ScanSnapshot {
            scan,
            hosts: vec![HostReport {
                host,
                ports: vec![PortRecord {
                    port_number: 22,
                    protocol: "tcp".into(),
                    service: Some("ssh".into()),
                    product: None,
                    version: None,
                    extra_info: None,
                    cpe: None,
                }],
                hops: vec![
                    TopologyHop {
                        ttl: 1,
                        address: Some("10.0.0.1".parse().unwrap()),
                        hostname: None,
                        rtt_ms: Some(0.4),
                    },
                    TopologyHop {
                        ttl: 2,
                        address: Some(ip),
                        hostname: None,
                        rtt_ms: Some(0.9),
                    },
                ],
            }],
        }
    }

    #[test]
    fn html_escapes_hostnames() {
        let html = render_html(&snapshot());
        assert!(html.contains("&lt;nas&gt;"));
        assert!(html.contains("22/tcp ssh"));
    }

    #[test]
    fn dot_routes_through_hops() {
        let dot = render_dot(&snapshot());
        assert!(dot.contains("\"scanner\" -> \"10.0.0.1\";"));
        assert!(dot.contains("\"10.0.0.1\" -> \"10.0.0.2\";"));
        assert!(!dot.contains("\"10.0.0.2\" -> \"10.0.0.2\""));
    }

    #[tokio::test]
    async fn writes_one_artifact_per_kind() {
        let dir = tempfile::tempdir().unwrap();
        let reports = FileReportGenerator::new(dir.path().join("reports"));
        let artifacts = reports.generate(&snapshot()).await.unwrap();
        let kinds: Vec<_> = artifacts.iter().map(|a| a.kind).collect();
        assert_eq!(kinds, vec![ArtifactKind::Json, ArtifactKind::Html, ArtifactKind::Dot]);
        for a in &artifacts {
            assert!(a.file_path.exists());
            assert!(a.file_size.unwrap() > 0);
        }
        assert!(artifacts[0].file_path.ends_with("scan_7.json"));
    }
}
