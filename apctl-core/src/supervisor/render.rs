//! Renders the radio daemon's per-device config file and VAP sidecar files.

use std::collections::BTreeMap;
use std::fmt::Write as _;

use crate::model::{mac_index_bits, mac_to_string, mac_update_last_octet, Band, FreqWidth, PhysicalDevice, VirtualAp};
use crate::region::is_secondary_above;

/// Renders the main config file for one selected device.
pub fn render_device_config(device: &PhysicalDevice, vaps: &[&VirtualAp]) -> String {
    let wifi = device.wifi.as_ref().expect("selected device must have wifi info");
    let hw_mode = match wifi.active.band {
        Some(Band::LoBand) => "g",
        Some(Band::HiBand) => "a",
        None => "g",
    };
    let channel = wifi.active.channel.unwrap_or(0);
    let ht_capab = render_ht_capab(wifi, channel);

    let mut out = String::new();
    let _ = writeln!(out, "interface={}", device.name);
    let _ = writeln!(out, "hw_mode={hw_mode}");
    let _ = writeln!(out, "channel={channel}");
    if !ht_capab.is_empty() {
        let _ = writeln!(out, "ht_capab={ht_capab}");
    }

    let k = mac_index_bits(wifi.interfaces);
    for (idx, vap) in vaps.iter().enumerate().take(wifi.interfaces as usize) {
        if idx == 0 {
            let _ = writeln!(out, "ssid={}", vap.ssid);
        } else {
            let bssid = mac_update_last_octet(device.mac_addr, k, idx as u32);
            let _ = writeln!(out, "bss={}_{idx}", device.name);
            let _ = writeln!(out, "bssid={}", mac_to_string(bssid));
            let _ = writeln!(out, "ssid={}", vap.ssid);
        }
    }
    out
}

fn render_ht_capab(wifi: &crate::model::WifiInfo, channel: u32) -> String {
    if !wifi.freq_widths.contains(&FreqWidth::W40) {
        return String::new();
    }
    let mut flags = String::new();
    flags.push_str(if is_secondary_above(channel) { "[HT40+]" } else { "[HT40-]" });
    if wifi.ht_caps.short_gi_20 {
        flags.push_str("[SHORT-GI-20]");
    }
    if wifi.ht_caps.short_gi_40 {
        flags.push_str("[SHORT-GI-40]");
    }
    if wifi.ht_caps.stbc_tx {
        flags.push_str("[TX-STBC]");
    }
    if wifi.ht_caps.stbc_rx1 {
        flags.push_str("[RX-STBC1]");
    } else if wifi.ht_caps.stbc_rx2 {
        flags.push_str("[RX-STBC12]");
    } else if wifi.ht_caps.stbc_rx3 {
        flags.push_str("[RX-STBC123]");
    }
    if wifi.ht_caps.ldpc {
        flags.push_str("[LDPC]");
    }
    if wifi.ht_caps.amsdu_7935 {
        flags.push_str("[MAX-AMSDU-7935]");
    }
    if wifi.ht_caps.delayed_ba {
        flags.push_str("[DELAYED-BA]");
    }
    if wifi.ht_caps.dsss_cck_ht40 {
        flags.push_str("[DSSS_CCK-40]");
    }
    flags
}

/// Renders the `<prefix>.vlan` sidecar: one line per ring mapping its VLAN
/// id to a named sub-interface.
pub fn render_vlan_file(iface_name: &str, ring_vlans: &[(String, i32)]) -> String {
    let mut out = String::new();
    for (_ring, vlan_id) in ring_vlans.iter().filter(|(_, v)| *v >= 0) {
        let _ = writeln!(out, "{vlan_id} {iface_name}.{vlan_id}");
    }
    out
}

/// Renders the `<prefix>.macs` sidecar: one line per known client MAC
/// mapping it to its ring's VLAN id.
pub fn render_macs_file(client_rings: &BTreeMap<[u8; 6], i32>) -> String {
    let mut out = String::new();
    for (mac, vlan_id) in client_rings {
        let _ = writeln!(out, "{} {vlan_id}", mac_to_string(*mac));
    }
    out
}
