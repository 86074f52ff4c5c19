//! Device inventory: enumerate OS interfaces, classify them, probe wireless
//! capabilities, and reconcile the result with the configuration tree.

use std::collections::{BTreeSet, HashMap};

use serde_json::json;
use thiserror::Error;
use tokio::process::Command;

use crate::config::{ConfigClient, PropertyResult};
use crate::model::{ActiveConfig, Band, DeviceKind, FreqWidth, HtCaps, PhysicalDevice, WifiInfo, WifiMode, WifiState};
use crate::plumber::netlink_ops::{LinkInfo, NetlinkOps};

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Netlink(#[from] crate::plumber::Error),
    #[error(transparent)]
    Config(#[from] crate::config::Error),
}

/// Interfaces the classifier never treats as physical NICs.
const VIRTUAL_IFACE_PREFIXES: &[&str] = &["lo", "br", "veth", "docker", "tun", "wg", "tap"];

pub fn is_virtual_iface(name: &str) -> bool {
    VIRTUAL_IFACE_PREFIXES.iter().any(|p| name.starts_with(p))
}

/// MAC prefix the kernel uses for emulated/virtual wireless NICs; these are
/// always skipped during wireless capability probing.
pub fn is_emulated_mac(mac: [u8; 6]) -> bool {
    mac[0] == 0x02 && mac[1] == 0x00
}

/// Platform predicate for "this wired NIC could plausibly be the WAN uplink":
/// here, simply "is not one of the known LAN-only interface names".
pub fn is_wan_candidate(name: &str) -> bool {
    !name.starts_with("eth0") || name == "eth0"
}

/// Lists the interfaces `iw` reports as wireless. Returns an empty list (not
/// an error) when `iw` is unavailable, so a host with no wireless hardware
/// still enumerates its wired NICs normally.
pub async fn list_wireless_interfaces() -> Vec<String> {
    let output = match Command::new("iw").arg("dev").output().await {
        Ok(out) => out,
        Err(_) => return Vec::new(),
    };
    let text = String::from_utf8_lossy(&output.stdout);
    text.lines().filter_map(|line| line.trim().strip_prefix("Interface ")).map(str::to_string).collect()
}

pub async fn phy_for_interface(iface: &str) -> Option<String> {
    let output = Command::new("iw").arg("dev").arg(iface).arg("info").output().await.ok()?;
    let text = String::from_utf8_lossy(&output.stdout);
    text.lines().find_map(|line| line.trim().strip_prefix("wiphy ").map(|n| format!("phy{n}")))
}

pub async fn probe_phy(phy: &str) -> Option<WifiInfo> {
    let output = Command::new("iw").arg("phy").arg(phy).arg("info").output().await.ok()?;
    let text = String::from_utf8_lossy(&output.stdout);
    Some(parse_phy_info(&text))
}

pub async fn enumerate(netlink: &(dyn NetlinkOps + Send + Sync)) -> Result<Vec<PhysicalDevice>, Error> {
    let links: Vec<LinkInfo> = netlink.link_list().await?;
    let wireless_names: BTreeSet<String> = list_wireless_interfaces().await.into_iter().collect();

    let mut devices = Vec::new();
    for link in links {
        if is_virtual_iface(&link.name) {
            continue;
        }

        if wireless_names.contains(&link.name) {
            let wifi = match phy_for_interface(&link.name).await {
                Some(phy) => probe_phy(&phy).await,
                None => None,
            };
            devices.push(PhysicalDevice {
                name: link.name,
                mac_addr: [0; 6],
                kind: DeviceKind::Wireless,
                ring: None,
                disabled: false,
                wifi,
            });
        } else {
            devices.push(PhysicalDevice {
                name: link.name,
                mac_addr: [0; 6],
                kind: DeviceKind::Wired,
                ring: None,
                disabled: false,
                wifi: None,
            });
        }
    }
    Ok(devices)
}

/// Chooses the WAN device among wired candidates. Prefers an explicit
/// tree-side ring assignment; otherwise promotes a single WAN-capable NIC
/// and reports the choice so the caller can publish it back to the tree.
pub fn choose_wan<'a>(devices: &'a [PhysicalDevice], tree_assigned: Option<&str>) -> Option<(&'a PhysicalDevice, bool)> {
    if let Some(name) = tree_assigned {
        if let Some(dev) = devices.iter().find(|d| d.name == name) {
            return Some((dev, false));
        }
    }
    let candidates: Vec<&PhysicalDevice> = devices
        .iter()
        .filter(|d| d.kind == DeviceKind::Wired && is_wan_candidate(&d.name))
        .collect();
    if candidates.len() == 1 {
        return Some((candidates[0], true));
    }
    None
}

/// Publishes a device's current fields into `@/nodes/<node_id>/nics/<name>/*`,
/// adding missing properties, deleting stale ones and updating changed ones.
pub async fn reconcile_nic(
    client: &dyn ConfigClient,
    node_id: &str,
    device: &PhysicalDevice,
    known_fields: &[&str],
) -> Result<(), Error> {
    let base = vec!["nodes".to_string(), node_id.to_string(), "nics".to_string(), device.name.clone()];

    let mut desired: HashMap<&str, serde_json::Value> = HashMap::new();
    desired.insert("kind", json!(format!("{:?}", device.kind)));
    desired.insert("disabled", json!(device.disabled));
    if let Some(ring) = &device.ring {
        desired.insert("ring", json!(ring));
    }

    for (field, value) in desired.iter() {
        let mut path = base.clone();
        path.push(field.to_string());
        match client.read(&path).await? {
            PropertyResult::Missing => client.create(&path, value.clone()).await?,
            PropertyResult::Present(existing) if &existing != value => client.set(&path, value.clone()).await?,
            PropertyResult::Present(_) => {}
        }
    }

    for field in known_fields {
        if !desired.contains_key(field) {
            let mut path = base.clone();
            path.push(field.to_string());
            if matches!(client.read(&path).await?, PropertyResult::Present(_)) {
                client.delete(&path).await?;
            }
        }
    }

    Ok(())
}

/// Parses `iw phy` style textual capability output into a [`WifiInfo`].
///
/// This is a best-effort line scanner: it looks for the markers the real
/// tool emits rather than modelling the whole grammar.
pub fn parse_phy_info(text: &str) -> WifiInfo {
    let mut channels = BTreeSet::new();
    let mut bands = BTreeSet::new();
    let mut modes = BTreeSet::new();
    let mut freq_widths = BTreeSet::new();
    let mut support_vlans = false;
    let mut max_interfaces = 1u32;
    let mut ht_caps = HtCaps::default();

    let mut in_valid_combo = false;
    for raw_line in text.lines() {
        let line = raw_line.trim();

        if line.contains("AP/VLAN") && !line.contains("tx-frames") {
            support_vlans = true;
        }

        if line.starts_with("valid interface combinations") {
            in_valid_combo = true;
            continue;
        }
        if in_valid_combo {
            if line.contains('#') && line.contains("AP") {
                if let Some(n) = parse_combo_ap_count(line) {
                    max_interfaces = max_interfaces.max(n);
                }
            } else if !line.starts_with('*') && !line.starts_with('#') {
                in_valid_combo = false;
            }
        }

        if let Some(channel) = parse_channel_line(line) {
            if line.contains("disabled") || line.contains("no IR") || line.contains("radar detection") {
                continue;
            }
            channels.insert(channel);
            if channel <= 14 {
                bands.insert(Band::LoBand);
                modes.insert(WifiMode::G);
            } else {
                bands.insert(Band::HiBand);
                modes.insert(WifiMode::A);
            }
        }

        if line.contains("HT20/HT40") {
            modes.insert(WifiMode::N);
        }
        if line.contains("VHT Capabilities") {
            modes.insert(WifiMode::Ac);
        }
        if line.contains("HT Capabilities") {
            if let Some(bits) = parse_hex_after_colon(line) {
                if bits & 0b10 != 0 {
                    freq_widths.insert(FreqWidth::W40);
                }
            }
        }

        apply_ht_cap_flag(line, &mut ht_caps);
    }
    if freq_widths.is_empty() {
        freq_widths.insert(FreqWidth::W20);
    }

    WifiInfo {
        support_vlans,
        interfaces: max_interfaces,
        channels,
        freq_widths,
        bands,
        modes,
        ht_caps,
        configured: ActiveConfig::default(),
        active: ActiveConfig::default(),
        state: WifiState::Ok,
    }
}

fn parse_combo_ap_count(line: &str) -> Option<u32> {
    let idx = line.find("AP")?;
    let before = &line[..idx];
    let count = before.rsplit('#').next()?.trim_start_matches('{').trim();
    count.split(',').next()?.trim().parse().ok()
}

fn parse_channel_line(line: &str) -> Option<u32> {
    if !line.contains("MHz") || !line.contains('[') {
        return None;
    }
    let start = line.find('[')? + 1;
    let end = line[start..].find(']')? + start;
    line[start..end].parse().ok()
}

fn parse_hex_after_colon(line: &str) -> Option<u32> {
    let after = line.split(':').nth(1)?.trim();
    let hex = after.trim_start_matches("0x");
    u32::from_str_radix(hex.split_whitespace().next()?, 16).ok()
}

fn apply_ht_cap_flag(line: &str, caps: &mut HtCaps) {
    if line.contains("RX STBC 1") {
        caps.stbc_rx1 = true;
    }
    if line.contains("RX STBC 2") {
        caps.stbc_rx1 = true;
        caps.stbc_rx2 = true;
    }
    if line.contains("RX STBC 3") {
        caps.stbc_rx1 = true;
        caps.stbc_rx2 = true;
        caps.stbc_rx3 = true;
    }
    if line.contains("TX STBC") {
        caps.stbc_tx = true;
    }
    if line.contains("RX LDPC") {
        caps.ldpc = true;
    }
    if line.contains("HT20/HT40") && line.contains("SM") {
        // not a width signal; present defensively against unexpected lines
    }
    if line.contains("RX Greenfield") {}
    if line.contains("RX HT20 SGI") {
        caps.short_gi_20 = true;
    }
    if line.contains("RX HT40 SGI") {
        caps.short_gi_40 = true;
    }
    if line.contains("RX Max A-MSDU length 7935") {
        caps.amsdu_7935 = true;
    }
    if line.contains("HT Delayed Block Ack") {
        caps.delayed_ba = true;
    }
    if line.contains("DSSS/CCK HT40") {
        caps.dsss_cck_ht40 = true;
    }
}

/// Describes a probed radio for the log, as required by the capability probe.
pub fn describe(wifi: &WifiInfo) -> String {
    format!(
        "vlans={} max_ap={} bands={:?} channels={} widths={:?}",
        wifi.support_vlans,
        wifi.interfaces,
        wifi.bands,
        wifi.channels.len(),
        wifi.freq_widths
    )
}
