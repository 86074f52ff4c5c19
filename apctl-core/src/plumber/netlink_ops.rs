//! Abstraction over rtnetlink link/bridge/vlan/addr/route operations.
//!
//! Decouples bridge-and-vlan plumbing logic from the raw netlink wire
//! format so the plumber can be exercised with a stateful in-memory mock.

use std::net::Ipv4Addr;

use async_trait::async_trait;
use futures::TryStreamExt;
use rtnetlink::packet_route::address::AddressAttribute;
use rtnetlink::packet_route::link::LinkAttribute;
use rtnetlink::packet_route::route::{RouteAddress, RouteAttribute};

use super::Error;

#[derive(Debug, Clone, PartialEq)]
pub struct RouteSpec {
    pub destination: Ipv4Addr,
    pub prefix_len: u8,
    pub gateway: Option<Ipv4Addr>,
    pub if_index: u32,
}

#[derive(Debug, Clone)]
pub struct LinkInfo {
    pub index: u32,
    pub name: String,
}

#[derive(Debug, Clone)]
pub struct AddrInfo {
    pub if_index: u32,
    pub addr: Ipv4Addr,
    pub prefix_len: u8,
}

/// Abstraction over netlink link/bridge/vlan/addr/route operations.
///
/// Implementors must be cheaply cloneable: the underlying handle is already
/// reference-counted.
#[async_trait]
pub trait NetlinkOps: Send + Sync {
    async fn link_list(&self) -> Result<Vec<LinkInfo>, Error>;
    async fn link_up(&self, if_index: u32) -> Result<(), Error>;
    async fn link_down(&self, if_index: u32) -> Result<(), Error>;
    async fn link_delete(&self, if_index: u32) -> Result<(), Error>;

    async fn bridge_create(&self, name: &str) -> Result<u32, Error>;
    async fn bridge_destroy(&self, if_index: u32) -> Result<(), Error>;
    async fn bridge_add_iface(&self, bridge_index: u32, iface_index: u32) -> Result<(), Error>;

    async fn vlan_add(&self, parent_index: u32, vlan_id: u16, name: &str) -> Result<u32, Error>;

    async fn addr_flush(&self, if_index: u32) -> Result<(), Error>;
    async fn addr_add(&self, if_index: u32, addr: Ipv4Addr, prefix_len: u8) -> Result<(), Error>;
    async fn addr_list_v4(&self) -> Result<Vec<AddrInfo>, Error>;

    async fn route_add(&self, route: &RouteSpec) -> Result<(), Error>;
    async fn route_del(&self, route: &RouteSpec) -> Result<(), Error>;
    async fn route_list(&self) -> Result<Vec<RouteSpec>, Error>;
}

/// Production [`NetlinkOps`] backed by an `rtnetlink::Handle`.
#[derive(Clone)]
pub struct RealNetlinkOps {
    handle: rtnetlink::Handle,
}

impl RealNetlinkOps {
    pub fn new(handle: rtnetlink::Handle) -> Self {
        Self { handle }
    }

    fn route_message_to_spec(msg: &rtnetlink::packet_route::route::RouteMessage) -> Option<RouteSpec> {
        let if_index = msg.attributes.iter().find_map(|a| match a {
            RouteAttribute::Oif(idx) => Some(*idx),
            _ => None,
        })?;
        let destination = msg
            .attributes
            .iter()
            .find_map(|a| match a {
                RouteAttribute::Destination(RouteAddress::Inet(ip)) => Some(*ip),
                _ => None,
            })
            .unwrap_or(Ipv4Addr::UNSPECIFIED);
        let gateway = msg.attributes.iter().find_map(|a| match a {
            RouteAttribute::Gateway(RouteAddress::Inet(ip)) => Some(*ip),
            _ => None,
        });
        Some(RouteSpec {
            destination,
            prefix_len: msg.header.destination_prefix_length,
            gateway,
            if_index,
        })
    }
}

#[async_trait]
impl NetlinkOps for RealNetlinkOps {
    async fn link_list(&self) -> Result<Vec<LinkInfo>, Error> {
        let links: Vec<_> = self.handle.link().get().execute().try_collect().await?;
        Ok(links
            .iter()
            .filter_map(|link| {
                let name = link.attributes.iter().find_map(|a| match a {
                    LinkAttribute::IfName(n) => Some(n.clone()),
                    _ => None,
                })?;
                Some(LinkInfo {
                    index: link.header.index,
                    name,
                })
            })
            .collect())
    }

    async fn link_up(&self, if_index: u32) -> Result<(), Error> {
        self.handle.link().set(if_index).up().execute().await?;
        Ok(())
    }

    async fn link_down(&self, if_index: u32) -> Result<(), Error> {
        self.handle.link().set(if_index).down().execute().await?;
        Ok(())
    }

    async fn link_delete(&self, if_index: u32) -> Result<(), Error> {
        self.handle.link().del(if_index).execute().await?;
        Ok(())
    }

    async fn bridge_create(&self, name: &str) -> Result<u32, Error> {
        self.handle.link().add().bridge(name.to_string()).execute().await?;
        let links = self.link_list().await?;
        links
            .into_iter()
            .find(|l| l.name == name)
            .map(|l| l.index)
            .ok_or_else(|| Error::General(format!("bridge {name} not found after creation")))
    }

    async fn bridge_destroy(&self, if_index: u32) -> Result<(), Error> {
        self.link_delete(if_index).await
    }

    async fn bridge_add_iface(&self, bridge_index: u32, iface_index: u32) -> Result<(), Error> {
        self.handle.link().set(iface_index).controller(bridge_index).execute().await?;
        Ok(())
    }

    async fn vlan_add(&self, parent_index: u32, vlan_id: u16, name: &str) -> Result<u32, Error> {
        self.handle
            .link()
            .add()
            .vlan(name.to_string(), parent_index, vlan_id)
            .execute()
            .await?;
        let links = self.link_list().await?;
        links
            .into_iter()
            .find(|l| l.name == name)
            .map(|l| l.index)
            .ok_or_else(|| Error::General(format!("vlan iface {name} not found after creation")))
    }

    async fn addr_flush(&self, if_index: u32) -> Result<(), Error> {
        let addrs = self.addr_list_v4().await?;
        for addr in addrs.into_iter().filter(|a| a.if_index == if_index) {
            let mut builder = rtnetlink::AddressHandle::new(self.handle.clone());
            builder.delete_prefix(addr.addr.into(), addr.prefix_len, if_index).execute().await?;
        }
        Ok(())
    }

    async fn addr_add(&self, if_index: u32, addr: Ipv4Addr, prefix_len: u8) -> Result<(), Error> {
        self.handle.address().add(if_index, addr.into(), prefix_len).execute().await?;
        Ok(())
    }

    async fn addr_list_v4(&self) -> Result<Vec<AddrInfo>, Error> {
        let addrs: Vec<_> = self.handle.address().get().execute().try_collect().await?;
        Ok(addrs
            .iter()
            .filter_map(|addr| {
                let ip = addr.attributes.iter().find_map(|a| match a {
                    AddressAttribute::Address(std::net::IpAddr::V4(ip)) => Some(*ip),
                    _ => None,
                })?;
                Some(AddrInfo {
                    if_index: addr.header.index,
                    addr: ip,
                    prefix_len: addr.header.prefix_len,
                })
            })
            .collect())
    }

    async fn route_add(&self, route: &RouteSpec) -> Result<(), Error> {
        let mut builder = rtnetlink::RouteMessageBuilder::<Ipv4Addr>::default()
            .destination_prefix(route.destination, route.prefix_len)
            .output_interface(route.if_index);
        if let Some(gw) = route.gateway {
            builder = builder.gateway(gw);
        }
        self.handle.route().add(builder.build()).execute().await?;
        Ok(())
    }

    async fn route_del(&self, route: &RouteSpec) -> Result<(), Error> {
        let mut builder = rtnetlink::RouteMessageBuilder::<Ipv4Addr>::default()
            .destination_prefix(route.destination, route.prefix_len)
            .output_interface(route.if_index);
        if let Some(gw) = route.gateway {
            builder = builder.gateway(gw);
        }
        self.handle.route().del(builder.build()).execute().await?;
        Ok(())
    }

    async fn route_list(&self) -> Result<Vec<RouteSpec>, Error> {
        let builder = rtnetlink::RouteMessageBuilder::<Ipv4Addr>::default();
        let routes: Vec<_> = self.handle.route().get(builder.build()).execute().try_collect().await?;
        Ok(routes.iter().filter_map(Self::route_message_to_spec).collect())
    }
}

#[cfg(test)]
pub mod mock {
    use std::collections::HashMap;
    use std::sync::{Arc, Mutex};

    use super::*;

    #[derive(Debug, Default)]
    pub struct NetlinkState {
        pub links: Vec<LinkInfo>,
        pub up: HashMap<u32, bool>,
        pub bridge_members: HashMap<u32, Vec<u32>>,
        pub addrs: Vec<AddrInfo>,
        pub routes: Vec<RouteSpec>,
        next_index: u32,
    }

    #[derive(Clone)]
    pub struct MockNetlinkOps {
        pub state: Arc<Mutex<NetlinkState>>,
    }

    impl MockNetlinkOps {
        pub fn new() -> Self {
            Self {
                state: Arc::new(Mutex::new(NetlinkState { next_index: 100, ..Default::default() })),
            }
        }

        fn alloc_index(state: &mut NetlinkState) -> u32 {
            state.next_index += 1;
            state.next_index
        }
    }

    #[async_trait]
    impl NetlinkOps for MockNetlinkOps {
        async fn link_list(&self) -> Result<Vec<LinkInfo>, Error> {
            Ok(self.state.lock().unwrap().links.clone())
        }

        async fn link_up(&self, if_index: u32) -> Result<(), Error> {
            self.state.lock().unwrap().up.insert(if_index, true);
            Ok(())
        }

        async fn link_down(&self, if_index: u32) -> Result<(), Error> {
            self.state.lock().unwrap().up.insert(if_index, false);
            Ok(())
        }

        async fn link_delete(&self, if_index: u32) -> Result<(), Error> {
            let mut state = self.state.lock().unwrap();
            state.links.retain(|l| l.index != if_index);
            state.bridge_members.remove(&if_index);
            Ok(())
        }

        async fn bridge_create(&self, name: &str) -> Result<u32, Error> {
            let mut state = self.state.lock().unwrap();
            let index = Self::alloc_index(&mut state);
            state.links.push(LinkInfo { index, name: name.to_string() });
            state.bridge_members.insert(index, Vec::new());
            Ok(index)
        }

        async fn bridge_destroy(&self, if_index: u32) -> Result<(), Error> {
            self.link_delete(if_index).await
        }

        async fn bridge_add_iface(&self, bridge_index: u32, iface_index: u32) -> Result<(), Error> {
            let mut state = self.state.lock().unwrap();
            state.bridge_members.entry(bridge_index).or_default().push(iface_index);
            Ok(())
        }

        async fn vlan_add(&self, _parent_index: u32, _vlan_id: u16, name: &str) -> Result<u32, Error> {
            let mut state = self.state.lock().unwrap();
            let index = Self::alloc_index(&mut state);
            state.links.push(LinkInfo { index, name: name.to_string() });
            Ok(index)
        }

        async fn addr_flush(&self, if_index: u32) -> Result<(), Error> {
            self.state.lock().unwrap().addrs.retain(|a| a.if_index != if_index);
            Ok(())
        }

        async fn addr_add(&self, if_index: u32, addr: Ipv4Addr, prefix_len: u8) -> Result<(), Error> {
            self.state.lock().unwrap().addrs.push(AddrInfo { if_index, addr, prefix_len });
            Ok(())
        }

        async fn addr_list_v4(&self) -> Result<Vec<AddrInfo>, Error> {
            Ok(self.state.lock().unwrap().addrs.clone())
        }

        async fn route_add(&self, route: &RouteSpec) -> Result<(), Error> {
            self.state.lock().unwrap().routes.push(route.clone());
            Ok(())
        }

        async fn route_del(&self, route: &RouteSpec) -> Result<(), Error> {
            self.state.lock().unwrap().routes.retain(|r| r != route);
            Ok(())
        }

        async fn route_list(&self) -> Result<Vec<RouteSpec>, Error> {
            Ok(self.state.lock().unwrap().routes.clone())
        }
    }
}
