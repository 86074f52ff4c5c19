//! Bridge / VLAN plumber: keeps the host's layer-2 state in agreement with
//! the ring model by driving a small OS networking facade.

pub mod firewall;
pub mod netlink_ops;

use std::net::Ipv4Addr;

use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::model::{is_rfc1918, subnets_overlap, Ring};
use netlink_ops::{NetlinkOps, RouteSpec};

#[derive(Debug, Error)]
pub enum Error {
    #[error("rtnetlink error: {0}")]
    #[cfg(target_os = "linux")]
    Rtnetlink(#[from] rtnetlink::Error),
    #[error("nftables error: {0}")]
    NfTables(String),
    #[error("general plumbing error: {0}")]
    General(String),
    #[error("subnet sanity check failed: WAN address {wan} lies inside ring `{ring}` ({subnet}/{prefix})")]
    WanSubnetOverlap {
        wan: Ipv4Addr,
        ring: String,
        subnet: Ipv4Addr,
        prefix: u8,
    },
}

/// Node-local router address for a ring: `ring.subnet.network | node_index`.
pub fn router_address(ring: &Ring, node_index: u8) -> Ipv4Addr {
    let base = u32::from(ring.subnet.0);
    Ipv4Addr::from(base | (node_index as u32))
}

/// Sanity check required before any rebuild: no ring subnet may contain the
/// current WAN address. Returns the first offending ring, if any.
pub fn check_wan_overlap<'a>(rings: &'a [Ring], wan_addr: Ipv4Addr) -> Option<&'a Ring> {
    rings.iter().find(|r| subnets_overlap(r.subnet, wan_addr))
}

pub struct Plumber<N: NetlinkOps> {
    netlink: N,
}

impl<N: NetlinkOps> Plumber<N> {
    pub fn new(netlink: N) -> Self {
        Self { netlink }
    }

    /// Brings a ring bridge into existence: create, up, flush addresses,
    /// delete any stale route, assign the router address, bring up, then
    /// install the subnet route.
    pub async fn create_bridge(&self, ring: &Ring, node_index: u8) -> Result<u32, Error> {
        if !is_rfc1918(ring.subnet.0) {
            return Err(Error::General(format!("ring `{}` subnet {} is not RFC1918", ring.name, ring.subnet.0)));
        }
        let index = self.netlink.bridge_create(&ring.bridge).await?;
        self.netlink.link_up(index).await?;
        self.netlink.addr_flush(index).await?;

        let _ = self
            .netlink
            .route_del(&RouteSpec {
                destination: ring.subnet.0,
                prefix_len: ring.subnet.1,
                gateway: None,
                if_index: index,
            })
            .await;

        let router = router_address(ring, node_index);
        self.netlink.addr_add(index, router, ring.subnet.1).await?;
        self.netlink.link_up(index).await?;
        self.netlink
            .route_add(&RouteSpec {
                destination: ring.subnet.0,
                prefix_len: ring.subnet.1,
                gateway: None,
                if_index: index,
            })
            .await?;
        Ok(index)
    }

    pub async fn delete_bridges(&self, rings: &[Ring]) -> Result<(), Error> {
        let links = self.netlink.link_list().await?;
        for ring in rings.iter().filter(|r| r.is_bridged()) {
            if let Some(link) = links.iter().find(|l| l.name == ring.bridge) {
                self.netlink.bridge_destroy(link.index).await?;
            }
        }
        Ok(())
    }

    pub async fn create_bridges(&self, rings: &[Ring], node_index: u8) -> Result<(), Error> {
        for ring in rings.iter().filter(|r| r.is_bridged()) {
            self.create_bridge(ring, node_index).await?;
        }
        Ok(())
    }

    pub async fn add_dev_to_ring_bridge(&self, iface_index: u32, ring: &Ring) -> Result<(), Error> {
        let links = self.netlink.link_list().await?;
        let bridge = links
            .iter()
            .find(|l| l.name == ring.bridge)
            .ok_or_else(|| Error::General(format!("bridge {} not found", ring.bridge)))?;
        self.netlink.bridge_add_iface(bridge.index, iface_index).await
    }

    pub async fn add_vif(&self, parent_index: u32, vlan_id: u16, iface_name: &str, ring: &Ring) -> Result<(), Error> {
        let vif_index = self.netlink.vlan_add(parent_index, vlan_id, iface_name).await?;
        self.netlink.link_up(vif_index).await?;
        self.add_dev_to_ring_bridge(vif_index, ring).await
    }

    /// Loops once per second, retrying attachment of `iface_indices` to the
    /// unenrolled ring bridge until they all succeed or `cancel` fires.
    ///
    /// Compensates for the radio daemon not having created its interfaces
    /// yet by the time the supervisor wants to attach them.
    pub async fn rebuild_unenrolled(&self, mut iface_indices: Vec<u32>, unenrolled: &Ring, cancel: CancellationToken) {
        loop {
            let mut still_pending = Vec::new();
            for idx in iface_indices {
                if self.add_dev_to_ring_bridge(idx, unenrolled).await.is_err() {
                    still_pending.push(idx);
                }
            }
            iface_indices = still_pending;
            if iface_indices.is_empty() {
                return;
            }
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(std::time::Duration::from_secs(1)) => {}
            }
        }
    }

    /// Resolves the live IPv4 address currently assigned to `iface_name`, or
    /// `None` if the interface doesn't exist or carries no IPv4 address.
    pub async fn device_ipv4(&self, iface_name: &str) -> Result<Option<Ipv4Addr>, Error> {
        let links = self.netlink.link_list().await?;
        let Some(link) = links.iter().find(|l| l.name == iface_name) else {
            return Ok(None);
        };
        let addrs = self.netlink.addr_list_v4().await?;
        Ok(addrs.iter().find(|a| a.if_index == link.index).map(|a| a.addr))
    }

    /// Full reset: delete then recreate all bridges. Callers are expected to
    /// block hotplug handling for the duration and publish a net-update
    /// event on the bus afterwards.
    pub async fn reset_interfaces(&self, rings: &[Ring], node_index: u8, wan_addr: Ipv4Addr) -> Result<(), Error> {
        if let Some(offending) = check_wan_overlap(rings, wan_addr) {
            return Err(Error::WanSubnetOverlap {
                wan: wan_addr,
                ring: offending.name.clone(),
                subnet: offending.subnet.0,
                prefix: offending.subnet.1,
            });
        }
        self.delete_bridges(rings).await?;
        self.create_bridges(rings, node_index).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::netlink_ops::mock::MockNetlinkOps;
    use super::*;

    fn test_ring(name: &str, vlan_id: i32, net: (u8, u8, u8, u8), prefix: u8) -> Ring {
        Ring {
            name: name.to_string(),
            vlan_id,
            bridge: Ring::bridge_name(vlan_id),
            subnet: (Ipv4Addr::new(net.0, net.1, net.2, net.3), prefix),
            vaps: vec![],
            lease_duration_secs: 3600,
        }
    }

    #[tokio::test]
    async fn create_bridge_installs_router_address_and_route() {
        let netlink = MockNetlinkOps::new();
        let plumber = Plumber::new(netlink.clone());
        let ring = test_ring("guest", 20, (192, 168, 20, 0), 24);

        let index = plumber.create_bridge(&ring, 1).await.unwrap();

        let state = netlink.state.lock().unwrap();
        assert!(state.up.get(&index).copied().unwrap_or(false));
        assert!(state.addrs.iter().any(|a| a.if_index == index && a.addr == Ipv4Addr::new(192, 168, 20, 1)));
        assert!(state.routes.iter().any(|r| r.if_index == index && r.destination == ring.subnet.0));
    }

    #[tokio::test]
    async fn reset_interfaces_is_idempotent() {
        let netlink = MockNetlinkOps::new();
        let plumber = Plumber::new(netlink.clone());
        let rings = vec![test_ring("core", 10, (192, 168, 10, 0), 24)];
        let wan = Ipv4Addr::new(203, 0, 113, 5);

        plumber.reset_interfaces(&rings, 1, wan).await.unwrap();
        let bridges_after_first = netlink.state.lock().unwrap().links.len();
        plumber.reset_interfaces(&rings, 1, wan).await.unwrap();
        let bridges_after_second = netlink.state.lock().unwrap().links.len();

        assert_eq!(bridges_after_first, bridges_after_second);
    }

    #[tokio::test]
    async fn reset_interfaces_refuses_to_run_on_wan_overlap() {
        let netlink = MockNetlinkOps::new();
        let plumber = Plumber::new(netlink);
        let rings = vec![test_ring("core", 10, (192, 168, 0, 0), 16)];
        let wan = Ipv4Addr::new(192, 168, 138, 42);

        let err = plumber.reset_interfaces(&rings, 1, wan).await.unwrap_err();
        assert!(matches!(err, Error::WanSubnetOverlap { .. }));
    }

    #[tokio::test]
    async fn device_ipv4_resolves_the_live_address_of_a_named_link() {
        let netlink = MockNetlinkOps::new();
        let plumber = Plumber::new(netlink.clone());
        let ring = test_ring("core", 10, (192, 168, 10, 0), 24);
        plumber.create_bridge(&ring, 1).await.unwrap();

        let resolved = plumber.device_ipv4(&ring.bridge).await.unwrap();
        assert_eq!(resolved, Some(Ipv4Addr::new(192, 168, 10, 1)));
        assert_eq!(plumber.device_ipv4("nonexistent0").await.unwrap(), None);
    }

    #[test]
    fn router_address_or_s_node_index_into_network() {
        let ring = test_ring("core", 10, (192, 168, 10, 0), 24);
        assert_eq!(router_address(&ring, 1), Ipv4Addr::new(192, 168, 10, 1));
        assert_eq!(router_address(&ring, 5), Ipv4Addr::new(192, 168, 10, 5));
    }
}
