//! `apctld wifi` diagnostic sub-command: probes wireless NICs with `iw` and
//! reports per-NIC validity against the stack's minimum requirements.

use apctl_core::inventory;
use apctl_core::model::{Band, WifiInfo};

pub struct NicReport {
    pub name: String,
    pub wifi: WifiInfo,
    pub valid: bool,
}

/// Minimum requirement: VLAN/AP-VLAN support, at least one BSSID beyond the
/// base, and at least one usable band.
fn is_valid(wifi: &WifiInfo) -> bool {
    wifi.support_vlans && wifi.interfaces >= 2 && !wifi.bands.is_empty() && !wifi.channels.is_empty()
}

/// Runs the diagnostic probe, optionally restricted to one interface. Shares
/// the `iw`-probing functions `inventory::enumerate` uses at startup so the
/// two never drift out of sync.
pub async fn run(only: Option<&str>) -> Vec<NicReport> {
    let interfaces = match only {
        Some(iface) => vec![iface.to_string()],
        None => inventory::list_wireless_interfaces().await,
    };

    let mut reports = Vec::new();
    for name in interfaces {
        let Some(phy) = inventory::phy_for_interface(&name).await else { continue };
        let Some(wifi) = inventory::probe_phy(&phy).await else { continue };
        let valid = is_valid(&wifi);
        reports.push(NicReport { name, wifi, valid });
    }
    reports
}

pub fn print_report(report: &NicReport, verbose: bool) {
    if verbose {
        println!("{}: {} ({})", report.name, if report.valid { "valid" } else { "invalid" }, inventory::describe(&report.wifi));
    } else {
        let bands: Vec<&str> = report.wifi.bands.iter().map(|b| if *b == Band::LoBand { "lo" } else { "hi" }).collect();
        println!("{}: {} [bands={}]", report.name, if report.valid { "valid" } else { "invalid" }, bands.join(","));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use apctl_core::model::{ActiveConfig, FreqWidth, HtCaps, WifiMode, WifiState};
    use std::collections::BTreeSet;

    fn sample(support_vlans: bool, interfaces: u32) -> WifiInfo {
        WifiInfo {
            support_vlans,
            interfaces,
            channels: BTreeSet::from([1]),
            freq_widths: BTreeSet::from([FreqWidth::W20]),
            bands: BTreeSet::from([Band::LoBand]),
            modes: BTreeSet::from([WifiMode::G]),
            ht_caps: HtCaps::default(),
            configured: ActiveConfig::default(),
            active: ActiveConfig::default(),
            state: WifiState::Ok,
        }
    }

    #[test]
    fn rejects_devices_without_vlan_support() {
        assert!(!is_valid(&sample(false, 4)));
    }

    #[test]
    fn rejects_devices_with_only_one_interface() {
        assert!(!is_valid(&sample(true, 1)));
    }

    #[test]
    fn accepts_a_capable_device() {
        assert!(is_valid(&sample(true, 4)));
    }
}
