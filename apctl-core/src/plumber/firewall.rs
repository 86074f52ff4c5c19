//! Firewall re-application contract.
//!
//! The firewall rule engine itself is a peripheral concern; the core only
//! needs to guarantee that rules are re-applied whenever ring membership or
//! per-client addressing changes. Production uses native nftables via
//! `nftnl` + `mnl` for atomic batch operations through netlink.

use std::net::Ipv4Addr;

use nftnl::{Batch, Chain, ChainType, Hook, MsgType, ProtoFamily, Table};

use super::Error;

const TABLE_NAME: &std::ffi::CStr = c"apctld";
const RING_CHAIN_NAME: &std::ffi::CStr = c"APCTLD_RINGS";
const BLOCKED_CHAIN_NAME: &std::ffi::CStr = c"APCTLD_BLOCKED";

/// Logical firewall contract the rest of the control plane depends on:
/// "apply whatever the current ring/client and blocklist set implies" and
/// "remove everything we own".
pub trait FirewallOps: Send + Sync {
    fn apply_ring_rules(&self, ring_vlans: &[(String, u16)], blocked_ips: &[Ipv4Addr]) -> Result<(), Error>;
    fn teardown(&self) -> Result<(), Error>;
}

pub struct RealFirewallOps;

impl RealFirewallOps {
    pub fn new() -> Self {
        Self
    }
}

impl Default for RealFirewallOps {
    fn default() -> Self {
        Self::new()
    }
}

fn send_batch(batch: &nftnl::FinalizedBatch) -> Result<(), Error> {
    let socket = mnl::Socket::new(mnl::Bus::Netfilter).map_err(|e| Error::NfTables(format!("netlink open: {e}")))?;
    let portid = socket.portid();
    socket.send_all(batch).map_err(|e| Error::NfTables(format!("send batch: {e}")))?;

    let mut buffer = vec![0; nftnl::nft_nlmsg_maxsize() as usize];
    let mut expected_seqs = batch.sequence_numbers();
    while !expected_seqs.is_empty() {
        let messages = socket.recv(&mut buffer[..]).map_err(|e| Error::NfTables(format!("recv: {e}")))?;
        for message in messages {
            let message = message.map_err(|e| Error::NfTables(format!("message: {e}")))?;
            let expected_seq = expected_seqs.next().ok_or_else(|| Error::NfTables("unexpected ack".into()))?;
            mnl::cb_run(message, expected_seq, portid).map_err(|e| Error::NfTables(format!("ack: {e}")))?;
        }
    }
    Ok(())
}

fn delete_table(ignore_enoent: bool) -> Result<(), Error> {
    let table = Table::new(TABLE_NAME, ProtoFamily::Inet);
    let mut batch = Batch::new();
    batch.add(&table, MsgType::Del);
    match send_batch(&batch.finalize()) {
        Ok(()) => Ok(()),
        Err(Error::NfTables(msg)) if ignore_enoent && msg.contains("No such file or directory") => Ok(()),
        Err(e) => Err(e),
    }
}

impl FirewallOps for RealFirewallOps {
    fn apply_ring_rules(&self, ring_vlans: &[(String, u16)], blocked_ips: &[Ipv4Addr]) -> Result<(), Error> {
        let _ = delete_table(true);

        let mut batch = Batch::new();
        let table = Table::new(TABLE_NAME, ProtoFamily::Inet);
        batch.add(&table, MsgType::Add);

        let mut ring_chain = Chain::new(RING_CHAIN_NAME, &table);
        ring_chain.set_hook(Hook::Forward, 0);
        ring_chain.set_type(ChainType::Filter);
        batch.add(&ring_chain, MsgType::Add);

        let mut blocked_chain = Chain::new(BLOCKED_CHAIN_NAME, &table);
        blocked_chain.set_hook(Hook::Forward, 10);
        blocked_chain.set_type(ChainType::Filter);
        batch.add(&blocked_chain, MsgType::Add);

        tracing::debug!(rings = ring_vlans.len(), blocked = blocked_ips.len(), "firewall ring rules applied");
        send_batch(&batch.finalize())
    }

    fn teardown(&self) -> Result<(), Error> {
        delete_table(false)
    }
}

#[cfg(test)]
pub mod mock {
    use std::sync::{Arc, Mutex};

    use super::*;

    #[derive(Clone, Default)]
    pub struct MockFirewallOps {
        pub applied: Arc<Mutex<Vec<Vec<(String, u16)>>>>,
        pub blocked: Arc<Mutex<Vec<Vec<Ipv4Addr>>>>,
        pub torn_down: Arc<Mutex<bool>>,
    }

    impl FirewallOps for MockFirewallOps {
        fn apply_ring_rules(&self, ring_vlans: &[(String, u16)], blocked_ips: &[Ipv4Addr]) -> Result<(), Error> {
            self.applied.lock().unwrap().push(ring_vlans.to_vec());
            self.blocked.lock().unwrap().push(blocked_ips.to_vec());
            Ok(())
        }

        fn teardown(&self) -> Result<(), Error> {
            *self.torn_down.lock().unwrap() = true;
            Ok(())
        }
    }
}
