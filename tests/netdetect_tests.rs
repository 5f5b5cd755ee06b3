use lan_recon::netdetect::{
    interface_network, ipv4_to_default_cidr, is_ipv6_target, is_valid_target,
    select_local_network, LocalInterface,
};
use std::net::Ipv4Addr;

fn iface(name: &str, ip: Ipv4Addr, netmask: Ipv4Addr) -> LocalInterface {
    LocalInterface {
        name: name.into(),
        ip,
        netmask,
    }
}

#[test]
fn default_cidr_is_24() {
    let cidr = ipv4_to_default_cidr(Ipv4Addr::new(192, 168, 42, 99));
    assert_eq!(cidr.to_string(), "192.168.42.0/24");
}

#[test]
fn interface_network_is_truncated() {
    let net = interface_network(
        Ipv4Addr::new(10, 0, 0, 77),
        Ipv4Addr::new(255, 255, 255, 252),
    );
    assert_eq!(net.to_string(), "10.0.0.76/30");
}

#[test]
fn targets_accept_cidrs_and_addresses() {
    assert!(is_valid_target("192.168.1.0/30"));
    assert!(is_valid_target(" 10.0.0.1 "));
    assert!(is_valid_target("fe80::/64"));
    assert!(!is_valid_target("192.168.1.0/33"));
    assert!(!is_valid_target("router.lan"));
}

#[test]
fn targets_report_their_family() {
    assert!(is_ipv6_target("fd00::/64"));
    assert!(is_ipv6_target("2001:db8::5"));
    assert!(!is_ipv6_target("10.0.0.0/8"));
    assert!(!is_ipv6_target("router.lan"));
}

#[test]
fn bridges_are_skipped_without_a_route() {
    let ifaces = [
        iface("lo", Ipv4Addr::new(127, 0, 0, 1), Ipv4Addr::new(255, 0, 0, 0)),
        iface("docker0", Ipv4Addr::new(172, 17, 0, 1), Ipv4Addr::new(255, 255, 0, 0)),
        iface("br-5f2a9c", Ipv4Addr::new(10, 9, 0, 1), Ipv4Addr::new(255, 255, 255, 0)),
        iface("lxcbr0", Ipv4Addr::new(10, 0, 3, 1), Ipv4Addr::new(255, 255, 255, 0)),
        iface("eth0", Ipv4Addr::new(192, 168, 1, 20), Ipv4Addr::new(255, 255, 255, 0)),
    ];
    let net = select_local_network(None, &ifaces).unwrap();
    assert_eq!(net.to_string(), "192.168.1.0/24");
}

#[test]
fn default_container_range_is_skipped_under_any_name() {
    let ifaces = [
        iface("ens4", Ipv4Addr::new(172, 18, 0, 1), Ipv4Addr::new(255, 255, 0, 0)),
        iface("ens5", Ipv4Addr::new(192, 168, 50, 3), Ipv4Addr::new(255, 255, 255, 0)),
    ];
    let net = select_local_network(None, &ifaces).unwrap();
    assert_eq!(net.to_string(), "192.168.50.0/24");
}

#[test]
fn routed_source_beats_lower_networks() {
    let ifaces = [
        iface("eth1", Ipv4Addr::new(10, 1, 0, 5), Ipv4Addr::new(255, 255, 0, 0)),
        iface("eth0", Ipv4Addr::new(192, 168, 1, 20), Ipv4Addr::new(255, 255, 255, 0)),
    ];
    let net = select_local_network(Some(Ipv4Addr::new(192, 168, 1, 20)), &ifaces).unwrap();
    assert_eq!(net.to_string(), "192.168.1.0/24");
}

#[test]
fn only_bridges_means_no_network() {
    let ifaces = [
        iface("lo", Ipv4Addr::new(127, 0, 0, 1), Ipv4Addr::new(255, 0, 0, 0)),
        iface("docker0", Ipv4Addr::new(172, 17, 0, 1), Ipv4Addr::new(255, 255, 0, 0)),
        iface("virbr0", Ipv4Addr::new(192, 168, 122, 1), Ipv4Addr::new(255, 255, 255, 0)),
    ];
    assert_eq!(select_local_network(None, &ifaces), None);
}
