use if_addrs::{get_if_addrs, IfAddr};
use ipnet::{IpNet, Ipv4Net};
use std::net::{IpAddr, Ipv4Addr, UdpSocket};

use crate::classify;
use crate::error::DetectError;

/// Public address used only to pick the outbound route; nothing is sent to it.
const ROUTE_REFERENCE: (Ipv4Addr, u16) = (Ipv4Addr::new(8, 8, 8, 8), 80);

/// Interface name prefixes of virtual bridges and container veths.
const BRIDGE_PREFIXES: &[&str] = &["docker", "br-", "veth", "virbr", "lxcbr", "cni", "podman"];

/// Source of the local network used when a scan is started without targets.
pub trait NetworkDetector: Send + Sync {
    fn detect_local_network(&self) -> Result<String, DetectError>;
}

/// Picks the network behind the default route, falling back to the host's interfaces.
#[derive(Debug, Clone, Copy, Default)]
pub struct InterfaceDetector;

impl NetworkDetector for InterfaceDetector {
    fn detect_local_network(&self) -> Result<String, DetectError> {
        let interfaces = local_interfaces()?;
        select_local_network(routed_source(), &interfaces)
            .map(|n| n.to_string())
            .ok_or(DetectError::NoNetwork)
    }
}

/// An IPv4 address bound to a local interface.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalInterface {
    pub name: String,
    pub ip: Ipv4Addr,
    pub netmask: Ipv4Addr,
}

impl LocalInterface {
    fn is_bridge(&self) -> bool {
        BRIDGE_PREFIXES.iter().any(|p| self.name.starts_with(p))
            || classify::container_bridge(IpAddr::V4(self.ip)).is_some()
    }
}

/// IPv4 addresses of every local interface, in the order the OS reports them.
pub fn local_interfaces() -> Result<Vec<LocalInterface>, DetectError> {
    Ok(get_if_addrs()?
        .into_iter()
        .filter_map(|iface| match iface.addr {
            IfAddr::V4(v4) => Some(LocalInterface {
                name: iface.name,
                ip: v4.ip,
                netmask: v4.netmask,
            }),
            IfAddr::V6(_) => None,
        })
        .collect())
}

/// Source address the kernel picks for outbound traffic. Connecting a UDP
/// socket only resolves the route.
fn routed_source() -> Option<Ipv4Addr> {
    let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).ok()?;
    socket.connect(ROUTE_REFERENCE).ok()?;
    match socket.local_addr().ok()?.ip() {
        IpAddr::V4(ip) => Some(ip),
        IpAddr::V6(_) => None,
    }
}

fn usable(ip: Ipv4Addr) -> bool {
    !(ip.is_loopback() || ip.is_link_local() || ip.is_unspecified())
}

/// Chooses the network to scan.
///
/// The routed source address wins, taking its interface's netmask when the
/// address is found in `interfaces` and /24 otherwise. Without one, the
/// lowest interface network is used, skipping `BRIDGE_PREFIXES` names and the
/// default container ranges.
pub fn select_local_network(
    routed: Option<Ipv4Addr>,
    interfaces: &[LocalInterface],
) -> Option<Ipv4Net> {
    if let Some(ip) = routed.filter(|ip| usable(*ip)) {
        return Some(match interfaces.iter().find(|i| i.ip == ip) {
            Some(iface) => interface_network(ip, iface.netmask),
            None => ipv4_to_default_cidr(ip),
        });
    }
    interfaces
        .iter()
        .filter(|i| usable(i.ip) && !i.is_bridge())
        .map(|i| interface_network(i.ip, i.netmask))
        .min_by_key(|n| (u32::from(n.network()), n.prefix_len()))
}

/// Network of an interface address given its netmask.
pub fn interface_network(ip: Ipv4Addr, netmask: Ipv4Addr) -> Ipv4Net {
    match Ipv4Net::with_netmask(ip, netmask) {
        Ok(net) if net.prefix_len() > 0 => net.trunc(),
        _ => ipv4_to_default_cidr(ip),
    }
}

/// Helper: convert an IPv4 address into its default /24 network.
pub fn ipv4_to_default_cidr(ip: Ipv4Addr) -> Ipv4Net {
    let o = ip.octets();
    let net = Ipv4Addr::new(o[0], o[1], o[2], 0);
    Ipv4Net::new(net, 24).expect("/24 is always valid")
}

fn target_address(target: &str) -> Option<IpAddr> {
    let t = target.trim();
    if t.contains('/') {
        t.parse::<IpNet>().ok().map(|n| n.addr())
    } else {
        t.parse::<IpAddr>().ok()
    }
}

/// Accepts CIDR ranges (`10.0.0.0/24`) and single addresses (`10.0.0.7`).
pub fn is_valid_target(target: &str) -> bool {
    target_address(target).is_some()
}

pub fn is_ipv6_target(target: &str) -> bool {
    target_address(target).is_some_and(|a| a.is_ipv6())
}

/// First target whose address family differs from the first valid target's.
/// The scanner runs in a single family per invocation.
pub fn mixed_family_target(targets: &[String]) -> Option<&String> {
    let mut families = targets
        .iter()
        .filter_map(|t| target_address(t).map(|a| (t, a.is_ipv6())));
    let (_, first) = families.next()?;
    families.find(|(_, v6)| *v6 != first).map(|(t, _)| t)
}

/// Number of scannable host addresses in a target, for operator summaries.
pub fn host_capacity(target: &str) -> u64 {
    let t = target.trim();
    match t.parse::<IpNet>() {
        Ok(IpNet::V4(n)) => {
            let size = 1u64 << (32 - u32::from(n.prefix_len()));
            if size > 2 {
                size - 2
            } else {
                size
            }
        }
        Ok(IpNet::V6(_)) => 0,
        Err(_) => u64::from(t.parse::<IpAddr>().is_ok()),
    }
}
