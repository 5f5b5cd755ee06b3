//! nmap XML (`-oX`) to typed records.

use std::collections::HashSet;
use std::net::IpAddr;

use roxmltree::{Document, Node};
use serde::{Deserialize, Serialize};

use crate::error::ParseError;
use crate::types::{PortRecord, TopologyHop};

/// Structured result of one host's deep scan.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
pub struct HostRecord {
    pub address: Option<IpAddr>,
    pub hostname: Option<String>,
    pub os_type: Option<String>,
    pub os_accuracy: Option<u8>,
    pub mac: Option<String>,
    pub vendor: Option<String>,
    pub distance: Option<u32>,
    pub uptime_seconds: Option<u64>,
    pub ports: Vec<PortRecord>,
    pub hops: Vec<TopologyHop>,
}

fn parse_doc(xml: &str) -> Result<Document<'_>, ParseError> {
    let doc = Document::parse(xml).map_err(|e| ParseError::Xml(e.to_string()))?;
    let root = doc.root_element();
    if !root.has_tag_name("nmaprun") {
        return Err(ParseError::UnexpectedRoot(root.tag_name().name().to_string()));
    }
    Ok(doc)
}

fn child<'a, 'input>(node: Node<'a, 'input>, name: &str) -> Option<Node<'a, 'input>> {
    node.children().find(|n| n.has_tag_name(name))
}

fn children<'a, 'input: 'a>(
    node: Node<'a, 'input>,
    name: &'a str,
) -> impl Iterator<Item = Node<'a, 'input>> + 'a {
    node.children().filter(move |n| n.has_tag_name(name))
}

fn non_empty(s: Option<&str>) -> Option<String> {
    s.map(str::trim).filter(|s| !s.is_empty()).map(str::to_string)
}

fn is_up(host: Node) -> bool {
    child(host, "status").and_then(|s| s.attribute("state")) == Some("up")
}

fn ip_address(host: Node) -> Option<IpAddr> {
    children(host, "address")
        .filter(|a| matches!(a.attribute("addrtype"), Some("ipv4") | Some("ipv6")))
        .find_map(|a| a.attribute("addr").and_then(|s| s.parse().ok()))
}

fn has_open_port(host: Node) -> bool {
    child(host, "ports")
        .map(|ports| {
            children(ports, "port").any(|p| {
                child(p, "state").and_then(|s| s.attribute("state")) == Some("open")
            })
        })
        .unwrap_or(false)
}

/// Live addresses from a discovery sweep, deduplicated in document order.
pub fn parse_discovery(xml: &str, require_open_port: bool) -> Result<Vec<IpAddr>, ParseError> {
    let doc = parse_doc(xml)?;
    let mut seen = HashSet::new();
    let mut out = Vec::new();
    for host in children(doc.root_element(), "host") {
        if !is_up(host) {
            continue;
        }
        if require_open_port && !has_open_port(host) {
            continue;
        }
        if let Some(ip) = ip_address(host) {
            if seen.insert(ip) {
                out.push(ip);
            }
        }
    }
    Ok(out)
}

fn parse_port(port: Node) -> Result<Option<PortRecord>, ParseError> {
    if child(port, "state").and_then(|s| s.attribute("state")) != Some("open") {
        return Ok(None);
    }
    let raw = port.attribute("portid").unwrap_or("");
    let port_number = raw
        .parse::<u16>()
        .ok()
        .filter(|p| *p != 0)
        .ok_or_else(|| ParseError::InvalidField {
            field: "portid",
            value: raw.to_string(),
        })?;
    let service = child(port, "service");
    let attr = |name: &str| non_empty(service.and_then(|s| s.attribute(name)));
    Ok(Some(PortRecord {
        port_number,
        protocol: port.attribute("protocol").unwrap_or("tcp").to_string(),
        service: attr("name"),
        product: attr("product"),
        version: attr("version"),
        extra_info: attr("extrainfo"),
        cpe: service.and_then(|s| child(s, "cpe")).and_then(|c| non_empty(c.text())),
    }))
}

fn parse_hop(hop: Node) -> Result<TopologyHop, ParseError> {
    let raw = hop.attribute("ttl").unwrap_or("");
    let ttl = raw.parse::<u32>().map_err(|_| ParseError::InvalidField {
        field: "ttl",
        value: raw.to_string(),
    })?;
    Ok(TopologyHop {
        ttl,
        address: hop.attribute("ipaddr").and_then(|s| s.parse().ok()),
        hostname: non_empty(hop.attribute("host")),
        rtt_ms: hop.attribute("rtt").and_then(|s| s.parse().ok()),
    })
}

/// First live host of a deep-scan output.
pub fn parse_host(xml: &str) -> Result<HostRecord, ParseError> {
    let doc = parse_doc(xml)?;
    let host = children(doc.root_element(), "host")
        .find(|h| is_up(*h))
        .ok_or(ParseError::NoHost)?;

    let mut rec = HostRecord {
        address: ip_address(host),
        ..Default::default()
    };

    if let Some(mac) = children(host, "address").find(|a| a.attribute("addrtype") == Some("mac")) {
        rec.mac = non_empty(mac.attribute("addr"));
        rec.vendor = non_empty(mac.attribute("vendor"));
    }

    rec.hostname = child(host, "hostnames")
        .and_then(|hs| child(hs, "hostname"))
        .and_then(|h| non_empty(h.attribute("name")));

    if let Some(osmatch) = child(host, "os").and_then(|os| child(os, "osmatch")) {
        rec.os_type = non_empty(osmatch.attribute("name"));
        rec.os_accuracy = osmatch
            .attribute("accuracy")
            .and_then(|a| a.parse::<u8>().ok())
            .map(|a| a.min(100));
    }

    rec.uptime_seconds = child(host, "uptime")
        .and_then(|u| u.attribute("seconds"))
        .and_then(|s| s.parse().ok());
    rec.distance = child(host, "distance")
        .and_then(|d| d.attribute("value"))
        .and_then(|s| s.parse().ok());

    if let Some(ports) = child(host, "ports") {
        for port in children(ports, "port") {
            if let Some(p) = parse_port(port)? {
                rec.ports.push(p);
            }
        }
    }

    if let Some(trace) = child(host, "trace") {
        for hop in children(trace, "hop") {
            rec.hops.push(parse_hop(hop)?);
        }
    }

    Ok(rec)
}

#[cfg(test)]
mod tests {
    use super::*;

    const DISCOVERY: &str = r#"<?xml version="1.0"?>
<nmaprun scanner="nmap">
  <host><status state="up"/><address addr="10.0.0.1" addrtype="ipv4"/>
    <ports><port protocol="tcp" portid="22"><state state="open"/></port></ports></host>
  <host><status state="up"/><address addr="10.0.0.2" addrtype="ipv4"/>
    <ports><port protocol="tcp" portid="80"><state state="closed"/></port></ports></host>
  <host><status state="down"/><address addr="10.0.0.3" addrtype="ipv4"/></host>
  <host><status state="up"/><address addr="10.0.0.1" addrtype="ipv4"/>
    <ports><port protocol="tcp" portid="443"><state state="open"/></port></ports></host>
</nmaprun>"#;

    const HOST: &str = r#"<?xml version="1.0"?>
<nmaprun scanner="nmap">
  <host>
    <status state="up" reason="arp-response"/>
    <address addr="192.168.1.20" addrtype="ipv4"/>
    <address addr="00:0C:29:AA:BB:CC" addrtype="mac" vendor="VMware"/>
    <hostnames><hostname name="db01.lan" type="PTR"/></hostnames>
    <ports>
      <port protocol="tcp" portid="22"><state state="open"/>
        <service name="ssh" product="OpenSSH" version="8.9p1" extrainfo="Ubuntu"><cpe>cpe:/a:openbsd:openssh:8.9p1</cpe></service></port>
      <port protocol="tcp" portid="25"><state state="filtered"/></port>
      <port protocol="tcp" portid="5432"><state state="open"/><service name="postgresql"/></port>
    </ports>
    <os><osmatch name="Linux 5.4 - 5.15" accuracy="96"/></os>
    <uptime seconds="86400" lastboot="Thu Jan  1 00:00:00 2026"/>
    <distance value="1"/>
    <trace><hop ttl="1" ipaddr="192.168.1.20" rtt="0.41" host="db01.lan"/></trace>
  </host>
</nmaprun>"#;

    #[test]
    fn discovery_keeps_live_hosts_with_open_ports_once() {
        let ips = parse_discovery(DISCOVERY, true).unwrap();
        assert_eq!(ips, vec!["10.0.0.1".parse::<IpAddr>().unwrap()]);
    }

    #[test]
    fn discovery_without_port_filter_keeps_all_up_hosts() {
        let ips = parse_discovery(DISCOVERY, false).unwrap();
        assert_eq!(ips.len(), 2);
    }

    #[test]
    fn host_record_fields() {
        let rec = parse_host(HOST).unwrap();
        assert_eq!(rec.address, Some("192.168.1.20".parse().unwrap()));
        assert_eq!(rec.hostname.as_deref(), Some("db01.lan"));
        assert_eq!(rec.vendor.as_deref(), Some("VMware"));
        assert_eq!(rec.os_type.as_deref(), Some("Linux 5.4 - 5.15"));
        assert_eq!(rec.os_accuracy, Some(96));
        assert_eq!(rec.distance, Some(1));
        assert_eq!(rec.uptime_seconds, Some(86400));
        assert_eq!(rec.ports.len(), 2);
        assert_eq!(rec.ports[0].product.as_deref(), Some("OpenSSH"));
        assert_eq!(rec.ports[0].cpe.as_deref(), Some("cpe:/a:openbsd:openssh:8.9p1"));
        assert_eq!(rec.ports[1].product, None);
        assert_eq!(rec.hops.len(), 1);
    }

    #[test]
    fn malformed_xml_is_rejected() {
        assert!(matches!(parse_host("<nmaprun><host>"), Err(ParseError::Xml(_))));
        assert!(matches!(
            parse_host("<report/>"),
            Err(ParseError::UnexpectedRoot(_))
        ));
    }

    #[test]
    fn no_live_host_is_an_error() {
        let xml = r#"<nmaprun><host><status state="down"/></host></nmaprun>"#;
        assert_eq!(parse_host(xml), Err(ParseError::NoHost));
    }

    #[test]
    fn bad_port_number_is_rejected() {
        let xml = r#"<nmaprun><host><status state="up"/>
            <ports><port protocol="tcp" portid="http"><state state="open"/></port></ports>
            </host></nmaprun>"#;
        assert!(matches!(
            parse_host(xml),
            Err(ParseError::InvalidField { field: "portid", .. })
        ));
    }
}
