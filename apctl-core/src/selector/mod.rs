//! Wifi selector: scores candidate radios per band and picks a channel and
//! width for each chosen device.

use std::collections::BTreeSet;

use crate::model::{Band, FreqWidth, PhysicalDevice, WifiMode, WifiState};
use crate::region::{self, Region};

/// Scores a candidate `(device, band)` pairing. Zero means "ineligible".
pub fn score(device: &PhysicalDevice, band: Band) -> u32 {
    let Some(wifi) = &device.wifi else { return 0 };
    if device.is_pseudo() || device.disabled || !wifi.support_vlans || wifi.interfaces <= 1 {
        return 0;
    }
    if !wifi.supports_band(band) {
        return 0;
    }
    if let Some(configured_band) = wifi.configured.band {
        if configured_band != band {
            return 0;
        }
    }
    if let Some(channel) = wifi.configured.channel {
        if !wifi.supports_channel(channel) {
            return 0;
        }
    }
    if wifi.state != WifiState::Ok {
        return 0;
    }

    let mut total = 0u32;
    if band == Band::LoBand {
        total += 10;
    }
    if wifi.modes.contains(&WifiMode::N) {
        total += 1;
    }
    if band == Band::HiBand && wifi.modes.contains(&WifiMode::Ac) {
        total += 2;
    }
    total
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Selection {
    pub lo: Option<usize>,
    pub hi: Option<usize>,
}

/// Enumerates all ordered `(a, b), a != b` device-index pairs and keeps the
/// best-scoring `(LoBand: a, HiBand: b)` assignment.
///
/// `current` is the existing selection; if the new best does not improve on
/// it, the current selection is kept. `force` (set when a device has left
/// the `Ok` state) always re-selects even on a tied score.
pub fn select(devices: &[PhysicalDevice], current: &Selection, force: bool) -> Selection {
    let mut best_score = -1i64;
    let mut best = Selection { lo: None, hi: None };

    for (a_idx, a) in devices.iter().enumerate() {
        for (b_idx, b) in devices.iter().enumerate() {
            if a_idx == b_idx {
                continue;
            }
            let total = score(a, Band::LoBand) as i64 + score(b, Band::HiBand) as i64;
            if total > best_score {
                best_score = total;
                best = Selection {
                    lo: Some(a_idx),
                    hi: Some(b_idx),
                };
            }
        }
    }

    let current_score = current.lo.map(|i| score(&devices[i], Band::LoBand)).unwrap_or(0) as i64
        + current.hi.map(|i| score(&devices[i], Band::HiBand)).unwrap_or(0) as i64;

    if !force && best_score <= current_score && current.lo.is_some() {
        current.clone()
    } else {
        best
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelChoice {
    pub channel: u32,
    pub width: FreqWidth,
}

/// Picks a channel/width for a newly-chosen `(device, band)`. A user-pinned
/// channel is tried first; if it fails capability/policy checks the caller
/// must mark the device `BadChan`.
pub fn choose_channel(device: &PhysicalDevice, band: Band, region: Region, rng_pick: impl Fn(&[u32]) -> u32) -> Option<ChannelChoice> {
    let wifi = device.wifi.as_ref()?;
    let legal: BTreeSet<u32> = region::legal_channels(region, band).iter().copied().collect();

    if let Some(pinned) = wifi.configured.channel {
        if legal.contains(&pinned) && wifi.supports_channel(pinned) {
            let width = wifi.configured.width.unwrap_or_else(|| region::max_width_for_channel(region, pinned));
            return Some(ChannelChoice { channel: pinned, width });
        }
        return None;
    }

    match band {
        Band::LoBand => {
            let candidates: Vec<u32> = region::LO_BAND_PREFERRED
                .iter()
                .copied()
                .filter(|c| wifi.supports_channel(*c))
                .collect();
            let chosen = if !candidates.is_empty() {
                rng_pick(&candidates)
            } else {
                let fallback: Vec<u32> = region::LO_BAND_ALL_20.iter().copied().filter(|c| wifi.supports_channel(*c)).collect();
                if fallback.is_empty() {
                    return None;
                }
                rng_pick(&fallback)
            };
            Some(ChannelChoice {
                channel: chosen,
                width: FreqWidth::W20,
            })
        }
        Band::HiBand => {
            let has_ac = wifi.modes.contains(&WifiMode::Ac);
            let has_ht40 = wifi.freq_widths.contains(&FreqWidth::W40);
            let (table, width) = if has_ac {
                (region::HI_BAND_80, FreqWidth::W80)
            } else if has_ht40 {
                (region::HI_BAND_40, FreqWidth::W40)
            } else {
                (region::HI_BAND_20, FreqWidth::W20)
            };
            let candidates: Vec<u32> = table.iter().copied().filter(|c| wifi.supports_channel(*c)).collect();
            if candidates.is_empty() {
                return None;
            }
            Some(ChannelChoice {
                channel: rng_pick(&candidates),
                width,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ActiveConfig, DeviceKind, HtCaps, WifiInfo};

    fn wireless_device(name: &str, bands: &[Band], modes: &[WifiMode], interfaces: u32) -> PhysicalDevice {
        PhysicalDevice {
            name: name.into(),
            mac_addr: [0; 6],
            kind: DeviceKind::Wireless,
            ring: None,
            disabled: false,
            wifi: Some(WifiInfo {
                support_vlans: true,
                interfaces,
                channels: (1..=11).chain([36, 40, 44, 48, 149]).collect(),
                freq_widths: [FreqWidth::W20, FreqWidth::W40].into(),
                bands: bands.iter().copied().collect(),
                modes: modes.iter().copied().collect(),
                ht_caps: HtCaps::default(),
                configured: ActiveConfig::default(),
                active: ActiveConfig::default(),
                state: WifiState::Ok,
            }),
        }
    }

    #[test]
    fn scores_zero_for_unsupported_band_or_disabled() {
        let mut d = wireless_device("wlan0", &[Band::LoBand], &[], 1);
        assert_eq!(score(&d, Band::LoBand), 0, "single-interface device is ineligible");
        d.wifi.as_mut().unwrap().interfaces = 2;
        assert_eq!(score(&d, Band::HiBand), 0, "unsupported band scores zero");
        d.disabled = true;
        assert_eq!(score(&d, Band::LoBand), 0);
    }

    #[test]
    fn s1_two_nics_select_lo_and_hi_as_expected() {
        let a = wireless_device("wlan0", &[Band::LoBand], &[WifiMode::N], 1);
        let mut a = a;
        a.wifi.as_mut().unwrap().interfaces = 1;
        let b = wireless_device("wlan1", &[Band::HiBand], &[WifiMode::N, WifiMode::Ac], 4);

        let devices = vec![a, b];
        let sel = select(&devices, &Selection { lo: None, hi: None }, false);
        assert_eq!(sel.lo, Some(0));
        assert_eq!(sel.hi, Some(1));
    }

    #[test]
    fn select_keeps_current_when_score_does_not_improve() {
        let a = wireless_device("wlan0", &[Band::LoBand, Band::HiBand], &[], 2);
        let b = wireless_device("wlan1", &[Band::LoBand, Band::HiBand], &[], 2);
        let devices = vec![a, b];
        let current = Selection { lo: Some(0), hi: Some(1) };
        let sel = select(&devices, &current, false);
        assert_eq!(sel, current);
    }

    #[test]
    fn select_forces_reselection_when_requested() {
        let a = wireless_device("wlan0", &[Band::LoBand, Band::HiBand], &[], 2);
        let b = wireless_device("wlan1", &[Band::LoBand, Band::HiBand], &[], 2);
        let devices = vec![a, b];
        let current = Selection { lo: Some(0), hi: Some(1) };
        let sel = select(&devices, &current, true);
        assert_eq!(sel.lo, Some(0));
        assert_eq!(sel.hi, Some(1));
    }

    #[test]
    fn choose_channel_lo_band_prefers_non_overlapping_set() {
        let device = wireless_device("wlan0", &[Band::LoBand], &[], 1);
        let choice = choose_channel(&device, Band::LoBand, Region::Us, |cands| cands[0]).unwrap();
        assert!(region::LO_BAND_PREFERRED.contains(&choice.channel));
        assert_eq!(choice.width, FreqWidth::W20);
    }

    #[test]
    fn choose_channel_respects_pinned_channel() {
        let mut device = wireless_device("wlan1", &[Band::HiBand], &[WifiMode::Ac], 4);
        device.wifi.as_mut().unwrap().configured.channel = Some(40);
        let choice = choose_channel(&device, Band::HiBand, Region::Us, |c| c[0]).unwrap();
        assert_eq!(choice.channel, 40);
    }

    #[test]
    fn choose_channel_rejects_illegal_pinned_channel() {
        let mut device = wireless_device("wlan1", &[Band::HiBand], &[], 4);
        device.wifi.as_mut().unwrap().configured.channel = Some(13);
        assert!(choose_channel(&device, Band::HiBand, Region::Us, |c| c[0]).is_none());
    }
}
