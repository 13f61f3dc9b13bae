use if_addrs::{get_if_addrs, IfAddr};
use ipnet::{IpNet, Ipv4Net};
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};

/// Network-link status, consulted before every request attempt.
pub trait LinkStatus: Send + Sync {
    fn is_connected(&self) -> bool;

    /// Local networks for diagnostics; empty when unknown.
    fn local_networks(&self) -> Vec<IpNet> {
        Vec::new()
    }
}

/// Treats the link as up iff at least one non-loopback IPv4 interface is configured.
#[derive(Debug, Default, Clone, Copy)]
pub struct InterfaceLink;

impl LinkStatus for InterfaceLink {
    fn is_connected(&self) -> bool {
        match get_if_addrs() {
            Ok(ifaces) => ifaces
                .iter()
                .any(|i| matches!(&i.addr, IfAddr::V4(v4) if !v4.ip.is_loopback())),
            Err(e) => {
                tracing::warn!(error = %e, "failed to enumerate interfaces");
                false
            }
        }
    }

    /// Each non-loopback IPv4 interface as a network, sorted and de-duplicated.
    fn local_networks(&self) -> Vec<IpNet> {
        let Ok(ifaces) = get_if_addrs() else {
            return Vec::new();
        };
        let nets: BTreeSet<Ipv4Net> = ifaces
            .into_iter()
            .filter_map(|iface| match iface.addr {
                IfAddr::V4(v4) if !v4.ip.is_loopback() => {
                    let prefix = u32::from(v4.netmask).count_ones() as u8;
                    Ipv4Net::new(v4.ip, prefix).ok().map(|n| n.trunc())
                }
                _ => None,
            })
            .collect();
        nets.into_iter().map(IpNet::V4).collect()
    }
}

/// A link whose state is set by hand. Used by tests and when the host has no
/// meaningful interface list.
#[derive(Debug)]
pub struct StaticLink(AtomicBool);

impl StaticLink {
    pub fn new(connected: bool) -> Self {
        Self(AtomicBool::new(connected))
    }

    pub fn set(&self, connected: bool) {
        self.0.store(connected, Ordering::Relaxed);
    }
}

impl LinkStatus for StaticLink {
    fn is_connected(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}
