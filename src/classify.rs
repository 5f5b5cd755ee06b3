//! VM / container classification from deep-scan signals.
//!
//! Signals are tried in order and the first match wins:
//! MAC OUI (and the vendor string nmap resolves from it), OS fingerprint
//! substrings, then a single-hop topology inside a known container bridge
//! network.

use std::net::IpAddr;

use ipnet::IpNet;

use crate::parser::HostRecord;

/// Known virtualization OUIs, upper-case, colon separated.
const VM_OUIS: &[(&str, &str)] = &[
    ("00:05:69", "VMware"),
    ("00:0C:29", "VMware"),
    ("00:1C:14", "VMware"),
    ("00:50:56", "VMware"),
    ("08:00:27", "VirtualBox"),
    ("0A:00:27", "VirtualBox"),
    ("52:54:00", "QEMU/KVM"),
    ("00:16:3E", "Xen"),
    ("00:1C:42", "Parallels"),
    ("00:15:5D", "Hyper-V"),
    ("02:42:AC", "Docker"),
];

/// Vendor strings nmap reports for virtual NICs.
const VM_VENDORS: &[(&str, &str)] = &[
    ("qemu", "QEMU/KVM"),
    ("vmware", "VMware"),
    ("virtualbox", "VirtualBox"),
    ("pcs systemtechnik", "VirtualBox"),
    ("xensource", "Xen"),
    ("xen", "Xen"),
    ("parallels", "Parallels"),
];

/// OS fingerprint substrings, lower-case.
const OS_SIGNATURES: &[(&str, &str)] = &[
    ("docker", "Docker"),
    ("lxc", "LXC"),
    ("container", "Container"),
    ("kvm", "QEMU/KVM"),
    ("qemu", "QEMU/KVM"),
    ("hyper-v", "Hyper-V"),
    ("hyperv", "Hyper-V"),
    ("vmware", "VMware"),
    ("virtualbox", "VirtualBox"),
    ("xen", "Xen"),
];

/// Default bridge networks of common container runtimes.
const CONTAINER_BRIDGES: &[(&str, &str)] = &[
    ("172.17.0.0/16", "Docker"),
    ("172.18.0.0/16", "Docker"),
    ("10.0.3.0/24", "LXC"),
];

/// Which signal produced a classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    MacOui,
    OsFingerprint,
    Topology,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VmClassification {
    pub vm_type: String,
    pub signal: Signal,
}

fn normalize_mac(mac: &str) -> String {
    mac.trim().replace('-', ":").to_ascii_uppercase()
}

fn by_mac(mac: Option<&str>, vendor: Option<&str>) -> Option<String> {
    if let Some(mac) = mac {
        let mac = normalize_mac(mac);
        if let Some((_, kind)) = VM_OUIS.iter().find(|(oui, _)| mac.starts_with(oui)) {
            return Some((*kind).to_string());
        }
    }
    let vendor = vendor?.to_ascii_lowercase();
    VM_VENDORS
        .iter()
        .find(|(needle, _)| vendor.contains(needle))
        .map(|(_, kind)| (*kind).to_string())
}

fn by_os(os: Option<&str>) -> Option<String> {
    let os = os?.to_ascii_lowercase();
    OS_SIGNATURES
        .iter()
        .find(|(needle, _)| os.contains(needle))
        .map(|(_, kind)| (*kind).to_string())
}

fn by_topology(addr: IpAddr, rec: &HostRecord) -> Option<String> {
    let single_hop = rec.hops.len() <= 1 && rec.distance.map_or(true, |d| d <= 1);
    if !single_hop {
        return None;
    }
    container_bridge(addr).map(str::to_string)
}

/// Runtime owning the default bridge network `addr` falls in, if any.
pub(crate) fn container_bridge(addr: IpAddr) -> Option<&'static str> {
    CONTAINER_BRIDGES.iter().find_map(|(net, kind)| {
        let net: IpNet = net.parse().ok()?;
        net.contains(&addr).then_some(*kind)
    })
}

/// Classify a scanned host. `None` means no virtualization signal was seen.
pub fn classify(addr: IpAddr, rec: &HostRecord) -> Option<VmClassification> {
    if let Some(vm_type) = by_mac(rec.mac.as_deref(), rec.vendor.as_deref()) {
        return Some(VmClassification {
            vm_type,
            signal: Signal::MacOui,
        });
    }
    if let Some(vm_type) = by_os(rec.os_type.as_deref()) {
        return Some(VmClassification {
            vm_type,
            signal: Signal::OsFingerprint,
        });
    }
    by_topology(addr, rec).map(|vm_type| VmClassification {
        vm_type,
        signal: Signal::Topology,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::TopologyHop;

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    #[test]
    fn mac_oui_wins_over_os() {
        let rec = HostRecord {
            mac: Some("52-54-00-12-34-56".into()),
            os_type: Some("Linux (Docker)".into()),
            ..Default::default()
        };
        let c = classify(ip("192.168.1.5"), &rec).unwrap();
        assert_eq!(c.vm_type, "QEMU/KVM");
        assert_eq!(c.signal, Signal::MacOui);
    }

    #[test]
    fn vendor_string_counts_as_mac_signal() {
        let rec = HostRecord {
            mac: Some("AA:BB:CC:00:00:01".into()),
            vendor: Some("Parallels".into()),
            ..Default::default()
        };
        assert_eq!(classify(ip("192.168.1.5"), &rec).unwrap().vm_type, "Parallels");
    }

    #[test]
    fn os_fingerprint_detects_hypervisor_guest() {
        let rec = HostRecord {
            os_type: Some("Microsoft Hyper-V Server 2019".into()),
            ..Default::default()
        };
        let c = classify(ip("192.168.1.5"), &rec).unwrap();
        assert_eq!(c.vm_type, "Hyper-V");
        assert_eq!(c.signal, Signal::OsFingerprint);
    }

    #[test]
    fn single_hop_bridge_address_is_container() {
        let rec = HostRecord {
            hops: vec![TopologyHop {
                ttl: 1,
                address: Some(ip("172.17.0.3")),
                hostname: None,
                rtt_ms: None,
            }],
            ..Default::default()
        };
        let c = classify(ip("172.17.0.3"), &rec).unwrap();
        assert_eq!(c.vm_type, "Docker");
        assert_eq!(c.signal, Signal::Topology);
    }

    #[test]
    fn multi_hop_bridge_address_is_not_container() {
        let rec = HostRecord {
            distance: Some(3),
            ..Default::default()
        };
        assert_eq!(classify(ip("10.0.3.9"), &rec), None);
    }

    #[test]
    fn plain_host_is_not_vm() {
        let rec = HostRecord {
            mac: Some("3C:22:FB:00:00:01".into()),
            vendor: Some("Apple".into()),
            os_type: Some("Apple macOS 14".into()),
            ..Default::default()
        };
        assert_eq!(classify(ip("192.168.1.10"), &rec), None);
    }
}
