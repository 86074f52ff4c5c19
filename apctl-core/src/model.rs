//! Core data model: physical devices, rings, virtual APs and clients.
//!
//! Mirrors the hierarchical shape of the configuration tree but keeps
//! in-memory copies that the rest of the control plane reasons about
//! without touching the tree on every read.

use std::collections::BTreeSet;
use std::net::Ipv4Addr;

use cidr::Cidr;
use serde::{Deserialize, Serialize};

/// Wireless band a radio can operate in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Band {
    LoBand,
    HiBand,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum FreqWidth {
    W20,
    W40,
    W80,
    W160,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum WifiMode {
    A,
    G,
    N,
    Ac,
}

/// HT capability flags relevant to config rendering and scoring.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HtCaps {
    pub short_gi_20: bool,
    pub short_gi_40: bool,
    pub stbc_tx: bool,
    pub stbc_rx1: bool,
    pub stbc_rx2: bool,
    pub stbc_rx3: bool,
    pub ldpc: bool,
    pub amsdu_7935: bool,
    pub delayed_ba: bool,
    pub dsss_cck_ht40: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WifiState {
    Ok,
    Disabled,
    IllegalBand,
    UnsupportedBand,
    IllegalChan,
    BadChan,
    UnsupportedChan,
    NoChan,
}

/// A device's requested and actual radio configuration.
#[derive(Debug, Clone, Default)]
pub struct ActiveConfig {
    pub band: Option<Band>,
    pub channel: Option<u32>,
    pub width: Option<FreqWidth>,
    pub mode: Option<WifiMode>,
}

/// Wireless capabilities and configuration discovered from, or applied to,
/// a physical radio.
#[derive(Debug, Clone)]
pub struct WifiInfo {
    pub support_vlans: bool,
    pub interfaces: u32,
    pub channels: BTreeSet<u32>,
    pub freq_widths: BTreeSet<FreqWidth>,
    pub bands: BTreeSet<Band>,
    pub modes: BTreeSet<WifiMode>,
    pub ht_caps: HtCaps,
    pub configured: ActiveConfig,
    pub active: ActiveConfig,
    pub state: WifiState,
}

impl WifiInfo {
    pub fn supports_band(&self, band: Band) -> bool {
        self.bands.contains(&band)
    }

    pub fn supports_channel(&self, channel: u32) -> bool {
        self.channels.contains(&channel)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceKind {
    Wired,
    Wireless,
    Pseudo,
}

/// A physical (or pseudo, daemon-spawned) network interface.
#[derive(Debug, Clone)]
pub struct PhysicalDevice {
    pub name: String,
    pub mac_addr: [u8; 6],
    pub kind: DeviceKind,
    pub ring: Option<String>,
    pub disabled: bool,
    pub wifi: Option<WifiInfo>,
}

impl PhysicalDevice {
    pub fn is_wireless(&self) -> bool {
        self.kind == DeviceKind::Wireless
    }

    pub fn is_pseudo(&self) -> bool {
        self.kind == DeviceKind::Pseudo
    }
}

/// Number of low bits masked off the base MAC to encode a BSSID index,
/// derived from `max_ssids` at call sites via [`mac_index_bits`].
pub fn mac_index_bits(max_ssids: u32) -> u32 {
    if max_ssids <= 1 {
        return 0;
    }
    (u32::BITS - (max_ssids - 1).leading_zeros()).max(1)
}

/// Derives the MAC for BSSID `index` from a device's base MAC.
///
/// Clears the low `k` bits of the base MAC and ORs in `index`, then forces
/// on the locally-administered bit of the first octet so the upper 47 bits
/// of base and derived MACs agree, as required by the radio daemon.
pub fn mac_update_last_octet(base: [u8; 6], k: u32, index: u32) -> [u8; 6] {
    let mut mac = base;
    let mask: u8 = if k >= 8 { 0x00 } else { !((1u8 << k).wrapping_sub(1)) };
    mac[5] = (mac[5] & mask) | (index as u8 & !mask);
    mac[0] |= 0x02;
    mac
}

pub fn mac_to_string(mac: [u8; 6]) -> String {
    mac.iter().map(|b| format!("{b:02x}")).collect::<Vec<_>>().join(":")
}

pub fn mac_from_str(s: &str) -> Option<[u8; 6]> {
    let mut out = [0u8; 6];
    let parts: Vec<&str> = s.split(':').collect();
    if parts.len() != 6 {
        return None;
    }
    for (i, p) in parts.iter().enumerate() {
        out[i] = u8::from_str_radix(p, 16).ok()?;
    }
    Some(out)
}

/// The fixed set of ring names known to the system, in the order used for
/// subnet-index derivation.
pub const RING_NAMES: &[&str] = &[
    "internal",
    "unenrolled",
    "core",
    "standard",
    "devices",
    "guest",
    "quarantine",
    "wan",
    "vpn",
];

pub fn ring_index(name: &str) -> Option<u32> {
    RING_NAMES.iter().position(|n| *n == name).map(|i| i as u32)
}

#[derive(Debug, Clone)]
pub struct Ring {
    pub name: String,
    pub vlan_id: i32,
    pub bridge: String,
    pub subnet: (Ipv4Addr, u8),
    pub vaps: Vec<String>,
    pub lease_duration_secs: u64,
}

impl Ring {
    pub fn is_bridged(&self) -> bool {
        self.vlan_id >= 0
    }

    pub fn bridge_name(vlan_id: i32) -> String {
        format!("brvlan{vlan_id}")
    }
}

/// `subnet(site, ring) = base + (((site << k) + ringIdx) << (32-prefix))`.
///
/// `k = ceil(log2(MaxRings))`. The result is required to lie in RFC1918
/// space; callers are responsible for validating that separately.
pub fn derive_subnet(base: Ipv4Addr, prefix: u8, site: u32, ring_idx: u32) -> (Ipv4Addr, u8) {
    let max_rings = RING_NAMES.len() as u32;
    let k = mac_index_bits(max_rings).max(1);
    let base_bits = u32::from(base);
    let offset = ((site << k) + ring_idx) << (32 - prefix);
    (Ipv4Addr::from(base_bits.wrapping_add(offset)), prefix)
}

pub fn is_rfc1918(addr: Ipv4Addr) -> bool {
    let o = addr.octets();
    o[0] == 10 || (o[0] == 172 && (16..=31).contains(&o[1])) || (o[0] == 192 && o[1] == 168)
}

pub fn subnets_overlap(a: (Ipv4Addr, u8), b_addr: Ipv4Addr) -> bool {
    let (net, prefix) = a;
    match cidr::Ipv4Cidr::new(net, prefix) {
        Ok(cidr) => cidr.contains(&b_addr),
        Err(_) => false,
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum KeyMgmt {
    WpaPsk,
    WpaEap,
}

#[derive(Debug, Clone)]
pub struct VirtualAp {
    pub name: String,
    pub ssid: String,
    pub tag_5ghz: bool,
    pub key_mgmt: KeyMgmt,
    pub passphrase: Option<String>,
    pub default_ring: String,
    pub rings: Vec<String>,
    pub disabled: bool,
}

#[derive(Debug, Clone, Default)]
pub struct Connection {
    pub vap: Option<String>,
    pub band: Option<Band>,
    pub node: Option<String>,
    pub active: bool,
    pub wireless: bool,
    pub username: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct Client {
    pub mac: [u8; 6],
    pub ring: Option<String>,
    pub home: Option<String>,
    pub dns_name: Option<String>,
    pub friendly_name: Option<String>,
    pub ipv4: Option<Ipv4Addr>,
    pub lease_expires: Option<u64>,
    pub dhcp_name: Option<String>,
    pub connection: Connection,
    pub device_classification: Option<String>,
    pub wireless: bool,
}
