//! Region-keyed channel and width policy tables.
//!
//! The source kept these as inline constants; we keep the same values but
//! key them by region so the rest of the control plane stays region-agnostic.
//! Only the US table is populated today.

use std::collections::HashMap;

use crate::model::{Band, FreqWidth};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Region {
    Us,
}

/// Non-overlapping 2.4GHz channels, tried in random order by the selector.
pub const LO_BAND_PREFERRED: &[u32] = &[1, 6, 11];

/// All legal 20MHz 2.4GHz channels, used as a fallback.
pub const LO_BAND_ALL_20: &[u32] = &[1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11];

/// 5GHz channels usable with an 80MHz width.
pub const HI_BAND_80: &[u32] = &[36, 52, 100, 149];

/// 5GHz channels usable with HT40, paired with their primary-above/below role.
pub const HI_BAND_40: &[u32] = &[36, 44, 40, 48, 149, 157, 153, 161];

/// All legal 20MHz 5GHz channels.
pub const HI_BAND_20: &[u32] = &[36, 40, 44, 48, 52, 56, 60, 64, 100, 104, 108, 112, 116, 120, 124, 128, 132, 136, 140, 144, 149, 153, 157, 161];

/// 40MHz channels whose secondary channel is above the primary.
pub const HT40_PRIMARY_ABOVE: &[u32] = &[36, 44, 52, 60, 100, 108, 116, 124, 132, 140, 149, 157];

/// 40MHz channels whose secondary channel is below the primary.
pub const HT40_PRIMARY_BELOW: &[u32] = &[40, 48, 56, 64, 104, 112, 120, 128, 136, 144, 153, 161];

pub fn legal_channels(region: Region, band: Band) -> &'static [u32] {
    match (region, band) {
        (Region::Us, Band::LoBand) => LO_BAND_ALL_20,
        (Region::Us, Band::HiBand) => HI_BAND_20,
    }
}

/// Per-channel legal width table: the widest width that channel supports.
pub fn max_width_for_channel(region: Region, channel: u32) -> FreqWidth {
    match region {
        Region::Us => {
            if HI_BAND_80.contains(&channel) {
                FreqWidth::W80
            } else if HT40_PRIMARY_ABOVE.contains(&channel) || HT40_PRIMARY_BELOW.contains(&channel) {
                FreqWidth::W40
            } else {
                FreqWidth::W20
            }
        }
    }
}

pub fn is_secondary_above(channel: u32) -> bool {
    HT40_PRIMARY_ABOVE.contains(&channel)
}

/// Lookup table mapping a region to its legal-channel sets; kept as a map so
/// additional regions can be added without touching selector logic.
pub fn region_table() -> HashMap<Region, HashMap<Band, &'static [u32]>> {
    let mut outer = HashMap::new();
    let mut inner = HashMap::new();
    inner.insert(Band::LoBand, LO_BAND_ALL_20);
    inner.insert(Band::HiBand, HI_BAND_20);
    outer.insert(Region::Us, inner);
    outer
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn max_width_matches_channel_class() {
        assert_eq!(max_width_for_channel(Region::Us, 36), FreqWidth::W80);
        assert_eq!(max_width_for_channel(Region::Us, 149), FreqWidth::W80);
        assert_eq!(max_width_for_channel(Region::Us, 1), FreqWidth::W20);
    }

    #[test]
    fn primary_above_and_below_are_disjoint() {
        for ch in HT40_PRIMARY_ABOVE {
            assert!(!HT40_PRIMARY_BELOW.contains(ch));
        }
    }
}
